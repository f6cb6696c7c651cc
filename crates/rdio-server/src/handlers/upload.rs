//! Call upload endpoint compatible with scanner uploaders

use crate::state::AppState;
use axum::{
    extract::{
        Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use rdio_core::{Call, CallMeta, CallUnit, Error, Frequency, Scope};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const IMPORTED: &str = "Call imported successfully.";
const TEST_REPLY: &str = "incomplete call data: no talkgroup";
const INVALID_KEY: &str = "Invalid API key";

/// Fields collected from the multipart body
#[derive(Debug, Default)]
pub struct UploadForm {
    /// Uploader's API key
    pub key: Option<String>,
    /// Connectivity check marker
    pub test: bool,
    /// Call assembled from the remaining fields
    pub call: Call,
}

/// Parse a capture time given as Unix seconds or RFC 3339
#[must_use]
pub fn parse_date_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    text.parse::<i64>().map_or_else(
        |_| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        },
        |seconds| DateTime::from_timestamp(seconds, 0),
    )
}

/// Parse patched talkgroups given as a JSON array or a comma separated list
#[must_use]
pub fn parse_patches(text: &str) -> Vec<u32> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
        return items
            .iter()
            .filter_map(|item| match item {
                Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .collect();
    }
    text.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Drain the multipart body into an [`UploadForm`]
///
/// Unknown fields are ignored; fields that fail to parse are left unset.
///
/// # Errors
///
/// Returns the multipart error if the body is malformed.
pub async fn read_form(multipart: &mut Multipart) -> Result<UploadForm, MultipartError> {
    let mut form = UploadForm::default();
    let mut meta = CallMeta::default();
    let mut source = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        if name == "audio" {
            if form.call.audio_name.is_empty() {
                form.call.audio_name = field.file_name().unwrap_or("").to_string();
            }
            if form.call.audio_mime.is_empty() {
                form.call.audio_mime = field.content_type().unwrap_or("").to_string();
            }
            form.call.audio = field.bytes().await?.to_vec();
            continue;
        }

        let text = field.text().await?;
        match name.as_str() {
            "key" => form.key = non_empty(text),
            "test" => form.test = true,
            "audioName" => {
                if let Some(value) = non_empty(text) {
                    form.call.audio_name = value;
                }
            }
            "audioType" => {
                if let Some(value) = non_empty(text) {
                    form.call.audio_mime = value;
                }
            }
            "dateTime" => {
                if let Some(timestamp) = parse_date_time(&text) {
                    form.call.timestamp = timestamp;
                }
            }
            "frequencies" => {
                form.call.frequencies =
                    serde_json::from_str::<Vec<Frequency>>(&text).unwrap_or_default();
            }
            "frequency" => form.call.frequency = text.trim().parse().ok(),
            "patches" => form.call.patches = parse_patches(&text),
            "site" => form.call.site_ref = non_empty(text),
            "source" => source = text.trim().parse::<u32>().ok(),
            "sources" => {
                form.call.units = serde_json::from_str::<Vec<CallUnit>>(&text).unwrap_or_default();
            }
            "system" => meta.system_ref = text.trim().parse().ok(),
            "systemLabel" => meta.system_label = non_empty(text),
            "talkgroup" => meta.talkgroup_ref = text.trim().parse().ok(),
            "talkgroupGroup" => meta.talkgroup_group = non_empty(text),
            "talkgroupLabel" => meta.talkgroup_label = non_empty(text),
            "talkgroupName" => meta.talkgroup_name = non_empty(text),
            "talkgroupTag" => meta.talkgroup_tag = non_empty(text),
            _ => {}
        }
    }

    if form.call.units.is_empty()
        && let Some(unit_ref) = source
    {
        form.call.units.push(CallUnit {
            unit_ref,
            offset: 0.0,
            label: None,
        });
    }
    form.call.meta = meta;
    Ok(form)
}

fn reply(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

/// Handle a multipart call upload
///
/// Responds `400` for a malformed body, `401` for a missing, unknown or
/// disabled key or one whose scope excludes the call, `417` for incomplete
/// call data and `200` once the call is queued.
pub async fn handle_call_upload(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(e) => {
            warn!("Rejected upload: {}", e);
            return reply(StatusCode::BAD_REQUEST, e.body_text());
        }
    };
    let form = match read_form(&mut multipart).await {
        Ok(form) => form,
        Err(e) => {
            warn!("Rejected upload: invalid multipart data: {}", e);
            return reply(StatusCode::BAD_REQUEST, format!("Invalid multipart data: {e}"));
        }
    };

    let credentials = state.controller.credentials();
    let Some(apikey) = form
        .key
        .as_deref()
        .and_then(|key| credentials.apikey(key))
    else {
        warn!(
            system = ?form.call.meta.system_ref,
            talkgroup = ?form.call.meta.talkgroup_ref,
            "Rejected upload: invalid API key"
        );
        return reply(StatusCode::UNAUTHORIZED, INVALID_KEY);
    };

    if form.test {
        debug!(ident = %apikey.ident, "Upload connectivity check");
        return reply(StatusCode::OK, TEST_REPLY);
    }

    let call = form.call;
    if let Err(e) = call.validate() {
        warn!(
            ident = %apikey.ident,
            system = ?call.meta.system_ref,
            talkgroup = ?call.meta.talkgroup_ref,
            file = %call.audio_name,
            "Rejected upload: {}",
            e
        );
        return reply(
            StatusCode::EXPECTATION_FAILED,
            format!("Incomplete call data: {}", validation_reason(&e)),
        );
    }

    let permitted = match &apikey.scope {
        Scope::Wildcard => true,
        Scope::List(_) => match (call.meta.system_ref, call.meta.talkgroup_ref) {
            (Some(system_ref), Some(talkgroup_ref)) => apikey.has_access(system_ref, talkgroup_ref),
            _ => false,
        },
    };
    if !permitted {
        warn!(
            ident = %apikey.ident,
            system = ?call.meta.system_ref,
            talkgroup = ?call.meta.talkgroup_ref,
            "Rejected upload: key not permitted for talkgroup"
        );
        return reply(StatusCode::UNAUTHORIZED, INVALID_KEY);
    }

    let (system, talkgroup, file) = (
        call.meta.system_ref,
        call.meta.talkgroup_ref,
        call.audio_name.clone(),
    );
    match state.controller.ingest(call).await {
        Ok(()) => {
            info!(ident = %apikey.ident, system = ?system, talkgroup = ?talkgroup, file = %file, "Call received");
            reply(StatusCode::OK, IMPORTED)
        }
        Err(e @ Error::Validation { .. }) => reply(
            StatusCode::EXPECTATION_FAILED,
            format!("Incomplete call data: {}", validation_reason(&e)),
        ),
        Err(e) => {
            warn!(file = %file, "Upload not queued: {}", e);
            reply(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

fn validation_reason(error: &Error) -> String {
    match error {
        Error::Validation { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
