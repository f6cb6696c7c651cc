//! Shared fixtures for server integration tests

#![allow(dead_code, clippy::missing_panics_doc)]

use async_trait::async_trait;
use rdio_core::{
    Apikey, Call, Config, Downstream, Result, Scope, SystemScope, System, TalkgroupScope,
    Talkgroup,
};
use rdio_database::{MemoryStore, Store};
use rdio_server::{AppState, CallLabels, CallRelay, Controller, Passthrough, build_router};
use reqwest::multipart::{Form, Part};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const UPLOAD_KEY: &str = "upload-key";
pub const LIMITED_KEY: &str = "limited-key";

/// Relay that accepts everything without network traffic
pub struct NullRelay;

#[async_trait]
impl CallRelay for NullRelay {
    async fn send(&self, _: &Call, _: &CallLabels, _: &Downstream) -> Result<()> {
        Ok(())
    }
}

/// Store with one system (ref 1) carrying talkgroups 10 and 20, an
/// unrestricted upload key and one limited to talkgroup 10
pub fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let talkgroup = |talkgroup_ref: u32, label: &str| Talkgroup {
        talkgroup_ref,
        label: label.to_string(),
        name: format!("{label} Dispatch"),
        ..Talkgroup::default()
    };
    store.add_system(System {
        system_ref: 1,
        label: "County".to_string(),
        talkgroups: vec![talkgroup(10, "Fire"), talkgroup(20, "Police")],
        ..System::default()
    });
    store.add_apikey(Apikey {
        id: None,
        key: UPLOAD_KEY.to_string(),
        ident: "uploader".to_string(),
        disabled: false,
        order: 0,
        scope: Scope::Wildcard,
    });
    store.add_apikey(Apikey {
        id: None,
        key: LIMITED_KEY.to_string(),
        ident: "limited".to_string(),
        disabled: false,
        order: 1,
        scope: Scope::List(vec![SystemScope {
            system_ref: 1,
            talkgroups: TalkgroupScope::List([10].into()),
        }]),
    });
    store
}

/// Started controller over `store`
pub async fn start_controller(store: &Arc<MemoryStore>, config: Config) -> Arc<Controller> {
    let controller = Controller::new(
        Arc::new(config),
        Arc::clone(store) as Arc<dyn Store>,
        Arc::new(NullRelay),
        Arc::new(Passthrough),
    );
    controller.start().await.unwrap();
    controller
}

/// Running HTTP server bound to an ephemeral port
pub struct TestServer {
    pub base_url: String,
    pub controller: Arc<Controller>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(store: &Arc<MemoryStore>, config: Config) -> Self {
        let controller = start_controller(store, config).await;
        let app = build_router(Arc::new(AppState::new(Arc::clone(&controller))));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            controller,
            handle,
        }
    }

    pub fn upload_url(&self) -> String {
        format!("{}/api/call-upload", self.base_url)
    }

    /// POST `form` to the upload endpoint, returning status and body text
    pub async fn upload(&self, form: Form) -> (u16, String) {
        let response = reqwest::Client::new()
            .post(self.upload_url())
            .multipart(form)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.text().await.unwrap())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.controller.stop();
        self.handle.abort();
    }
}

/// Complete upload form for system 1 / `talkgroup` at unix `seconds`
pub fn call_form(key: &str, talkgroup: u32, seconds: i64) -> Form {
    Form::new()
        .text("key", key.to_string())
        .part(
            "audio",
            Part::bytes(vec![7u8; 256])
                .file_name("call.mp3")
                .mime_str("audio/mpeg")
                .unwrap(),
        )
        .text("dateTime", seconds.to_string())
        .text("system", "1")
        .text("talkgroup", talkgroup.to_string())
        .text("frequency", "851012500")
        .text("source", "4242")
}

/// Poll the store until it holds `count` calls or a second has passed
pub async fn wait_for_calls(store: &MemoryStore, count: u64) -> bool {
    for _ in 0..100 {
        if store.count_calls().await.unwrap() == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
