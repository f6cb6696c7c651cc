//! Forwarding released calls to downstream relay servers

use crate::registry::CallLabels;
use async_trait::async_trait;
use rdio_core::{Call, Downstream, Error, Result};
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::debug;

/// Path appended to a relay's base URL
pub const UPLOAD_PATH: &str = "/api/call-upload";

/// Sends one call to one relay
#[async_trait]
pub trait CallRelay: Send + Sync {
    /// Deliver `call` to `downstream`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Relay`] on transport failure or a non-success status.
    async fn send(&self, call: &Call, labels: &CallLabels, downstream: &Downstream) -> Result<()>;
}

/// Relay client speaking the multipart call upload format
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
}

impl HttpRelay {
    /// Client with a per-request `timeout`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(format!("Failed to build relay client: {e}")))?;
        Ok(Self { client })
    }

    fn form(call: &Call, labels: &CallLabels, apikey: &str) -> Result<Form> {
        let mime = if call.audio_mime.is_empty() {
            "application/octet-stream"
        } else {
            &call.audio_mime
        };
        let audio = Part::bytes(call.audio.clone())
            .file_name(call.audio_name.clone())
            .mime_str(mime)
            .map_err(|e| Error::validation("audioType", e.to_string()))?;

        let mut form = Form::new()
            .part("audio", audio)
            .text("audioName", call.audio_name.clone())
            .text("audioType", call.audio_mime.clone())
            .text("dateTime", call.timestamp.to_rfc3339())
            .text("frequencies", serde_json::to_string(&call.frequencies)?)
            .text("key", apikey.to_string())
            .text("patches", serde_json::to_string(&call.patches)?)
            .text("sources", serde_json::to_string(&call.units)?);

        if let Some(frequency) = call.frequency {
            form = form.text("frequency", frequency.to_string());
        }
        if let Some(site) = &call.site_ref {
            form = form.text("site", site.clone());
        }
        if let Some(source) = call.units.first() {
            form = form.text("source", source.unit_ref.to_string());
        }
        if let Some(system) = call.system_ref() {
            form = form.text("system", system.to_string());
        }
        if let Some(talkgroup) = call.talkgroup_ref() {
            form = form.text("talkgroup", talkgroup.to_string());
        }

        let optional = [
            ("systemLabel", &labels.system),
            ("talkgroupLabel", &labels.talkgroup),
            ("talkgroupName", &labels.talkgroup_name),
            ("talkgroupGroup", &labels.group),
            ("talkgroupTag", &labels.tag),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                form = form.text(name, value.clone());
            }
        }

        Ok(form)
    }
}

#[async_trait]
impl CallRelay for HttpRelay {
    async fn send(&self, call: &Call, labels: &CallLabels, downstream: &Downstream) -> Result<()> {
        let url = format!("{}{UPLOAD_PATH}", downstream.url.trim_end_matches('/'));
        let relay_error = |message: String| Error::Relay {
            target: downstream.url.clone(),
            message,
        };

        let form = Self::form(call, labels, &downstream.apikey)?;
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| relay_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(relay_error(format!("{status}: {}", body.trim())));
        }

        debug!(downstream = %downstream.url, call_id = ?call.id, "Call relayed");
        Ok(())
    }
}
