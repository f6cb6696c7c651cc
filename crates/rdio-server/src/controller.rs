//! Ingestion pipeline, session registration and live protocol handling

use crate::clients::{Client, Clients};
use crate::convert::AudioConverter;
use crate::credentials::Credentials;
use crate::delayer::Delayer;
use crate::dispatch::{Dispatch, Dispatcher};
use crate::downstream::CallRelay;
use crate::registry::Registry;
use crate::search::CallQuery;
use async_channel::{Receiver, Sender};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rdio_core::{
    Access, Call, CallPayload, Command, Config, ConversionMode, Error, LiveFeedMatrix, Message,
    Result, Scope, System, Talkgroup, Unit,
};
use rdio_database::Store;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const UNKNOWN_GROUP: &str = "Unknown";
const UNKNOWN_TAG: &str = "Untagged";

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Owns the shared state and drives calls from upload to delivery
pub struct Controller {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    credentials: Arc<Credentials>,
    clients: Arc<Clients>,
    dispatcher: Arc<dyn Dispatch>,
    delayer: Arc<Delayer>,
    converter: Arc<dyn AudioConverter>,
    ingest_tx: Sender<Call>,
    ingest_rx: Receiver<Call>,
    register_tx: Sender<Arc<Client>>,
    register_rx: Receiver<Arc<Client>>,
    unregister_tx: Sender<Arc<Client>>,
    unregister_rx: Receiver<Arc<Client>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("clients", &self.clients.len())
            .field("queued", &self.ingest_tx.len())
            .field("delayed", &self.delayer.pending())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Wire a controller over `store`, forwarding to relays through `relay`
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        relay: Arc<dyn CallRelay>,
        converter: Arc<dyn AudioConverter>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let credentials = Arc::new(Credentials::new());
        let clients = Arc::new(Clients::new());
        let dispatcher: Arc<dyn Dispatch> = Arc::new(Dispatcher::new(
            Arc::clone(&clients),
            Arc::clone(&credentials),
            Arc::clone(&registry),
            relay,
        ));
        let delayer = Arc::new(Delayer::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
        ));

        let (ingest_tx, ingest_rx) = async_channel::bounded(config.ingest.queue_size.max(1));
        let register_size = config.live.register_queue_size.max(1);
        let (register_tx, register_rx) = async_channel::bounded(register_size);
        let (unregister_tx, unregister_rx) = async_channel::bounded(register_size);

        Arc::new(Self {
            config,
            store,
            registry,
            credentials,
            clients,
            dispatcher,
            delayer,
            converter,
            ingest_tx,
            ingest_rx,
            register_tx,
            register_rx,
            unregister_tx,
            unregister_rx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Reference tables
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Credential tables
    #[must_use]
    pub const fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// Registered sessions
    #[must_use]
    pub const fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    /// Delay queue
    #[must_use]
    pub const fn delayer(&self) -> &Arc<Delayer> {
        &self.delayer
    }

    /// Load reference data and credentials, recover delayed calls and start
    /// the ingestion and registration workers
    ///
    /// # Errors
    ///
    /// Returns an error if the initial load or delayed-call recovery fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.reload_registry().await?;
        self.credentials.reload(self.store.as_ref()).await?;
        self.delayer.start().await?;

        let ingest = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                info!("Ingestion worker started");
                while let Ok(call) = this.ingest_rx.recv().await {
                    this.process_call(call).await;
                }
                info!("Ingestion worker shutting down");
            })
        };
        let registration = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_registration().await })
        };

        self.workers.lock().extend([ingest, registration]);
        Ok(())
    }

    /// Stop accepting work and abort timers and workers
    pub fn stop(&self) {
        self.ingest_tx.close();
        self.register_tx.close();
        self.unregister_tx.close();
        self.delayer.stop();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        info!("Controller stopped");
    }

    /// Validate and queue a call for ingestion
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an invalid call, or an error once the
    /// controller is stopped.
    pub async fn ingest(&self, call: Call) -> Result<()> {
        if let Err(e) = call.validate() {
            warn!(
                system = ?call.system_ref(),
                talkgroup = ?call.talkgroup_ref(),
                file = %call.audio_name,
                "Rejected call: {}",
                e
            );
            return Err(e);
        }

        self.ingest_tx
            .send(call)
            .await
            .map_err(|_| Error::Other("ingestion queue closed".to_string()))
    }

    /// Run one call through resolution, policy, persistence and distribution
    pub async fn process_call(&self, mut call: Call) {
        let file = call.audio_name.clone();
        self.registry.resolve(&mut call);

        if let (Some(system), Some(talkgroup_ref)) = (&call.system, call.talkgroup_ref())
            && system.is_blacklisted(talkgroup_ref)
        {
            info!(
                system = system.system_ref,
                talkgroup = talkgroup_ref,
                file = %file,
                "Blacklisted talkgroup, call dropped"
            );
            return;
        }

        let auto_populate = self.config.ingest.auto_populate
            || call.system.as_ref().is_some_and(|s| s.auto_populate);
        if auto_populate {
            match self.auto_populate(&mut call).await {
                Ok(true) => {
                    if let Err(e) = self.reload_registry().await {
                        error!(file = %file, "Failed to reload reference data: {}", e);
                    }
                    self.notify_config_changed();
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        system = ?call.system_ref(),
                        talkgroup = ?call.talkgroup_ref(),
                        file = %file,
                        "Auto-populate failed: {}",
                        e
                    );
                    return;
                }
            }
        }

        if !self.registry.resolve(&mut call) {
            warn!(
                system = ?call.system_ref(),
                talkgroup = ?call.talkgroup_ref(),
                file = %file,
                "Unknown system or talkgroup, call dropped"
            );
            return;
        }
        let (Some(system_ref), Some(talkgroup_ref)) = (call.system_ref(), call.talkgroup_ref())
        else {
            return;
        };

        if !self.config.ingest.disable_duplicate_detection {
            let window = Duration::from_millis(self.config.ingest.duplicate_window_ms);
            match self
                .store
                .find_duplicate(system_ref, talkgroup_ref, call.timestamp, window)
                .await
            {
                Ok(false) => {}
                Ok(true) => {
                    warn!(
                        system = system_ref,
                        talkgroup = talkgroup_ref,
                        file = %file,
                        "Duplicate call rejected"
                    );
                    return;
                }
                Err(e) => {
                    error!(
                        system = system_ref,
                        talkgroup = talkgroup_ref,
                        file = %file,
                        "Duplicate check failed: {}",
                        e
                    );
                    return;
                }
            }
        }

        let mode = self.config.audio.conversion;
        if mode != ConversionMode::Disabled
            && let Err(e) = self.converter.convert(&mut call, mode).await
        {
            warn!(
                system = system_ref,
                talkgroup = talkgroup_ref,
                file = %file,
                "Keeping original audio: {}",
                e
            );
        }

        match self.store.insert_call(&call).await {
            Ok(id) => call.id = Some(id),
            Err(e) => {
                error!(
                    system = system_ref,
                    talkgroup = talkgroup_ref,
                    file = %file,
                    "Failed to store call: {}",
                    e
                );
                return;
            }
        }
        info!(
            call_id = call.id,
            system = system_ref,
            talkgroup = talkgroup_ref,
            file = %file,
            "Call imported"
        );

        if Delayer::can_delay(&call) {
            if let Err(e) = self.delayer.delay(call).await {
                error!(
                    system = system_ref,
                    talkgroup = talkgroup_ref,
                    file = %file,
                    "Failed to delay call: {}",
                    e
                );
            }
        } else {
            self.dispatcher.dispatch(call);
        }
    }

    /// Create missing reference data for `call`, returning whether anything changed
    async fn auto_populate(&self, call: &mut Call) -> Result<bool> {
        let mut changed = false;

        let system = if let Some(system) = call.system.clone() {
            system
        } else {
            if !self.config.ingest.auto_populate {
                return Ok(false);
            }
            let system_ref = call
                .meta
                .system_ref
                .unwrap_or_else(|| self.registry.next_system_ref());
            let label = non_empty(call.meta.system_label.as_ref())
                .unwrap_or_else(|| format!("System {system_ref}"));
            let id = self.store.create_system(system_ref, &label).await?;
            info!(system = system_ref, label = %label, "System created");

            call.meta.system_id = Some(id);
            call.meta.system_ref = Some(system_ref);
            changed = true;
            Arc::new(System {
                id,
                system_ref,
                label,
                auto_populate: true,
                ..System::default()
            })
        };

        if call.talkgroup.is_none() {
            let group_label = non_empty(call.meta.talkgroup_group.as_ref())
                .unwrap_or_else(|| UNKNOWN_GROUP.to_string());
            let group_id = match self.registry.group_by_label(&group_label) {
                Some(group) => group.id,
                None => self.store.create_group(&group_label).await?,
            };
            let tag_label = non_empty(call.meta.talkgroup_tag.as_ref())
                .unwrap_or_else(|| UNKNOWN_TAG.to_string());
            let tag_id = match self.registry.tag_by_label(&tag_label) {
                Some(tag) => tag.id,
                None => self.store.create_tag(&tag_label).await?,
            };

            let talkgroup_ref = call
                .meta
                .talkgroup_ref
                .unwrap_or_else(|| system.next_talkgroup_ref());
            let label = non_empty(call.meta.talkgroup_label.as_ref())
                .unwrap_or_else(|| talkgroup_ref.to_string());
            let name =
                non_empty(call.meta.talkgroup_name.as_ref()).unwrap_or_else(|| label.clone());
            let talkgroup = Talkgroup {
                talkgroup_ref,
                label,
                name,
                group_id: Some(group_id),
                tag_id: Some(tag_id),
                ..Talkgroup::default()
            };
            let id = self.store.create_talkgroup(system.id, &talkgroup).await?;
            info!(
                system = system.system_ref,
                talkgroup = talkgroup_ref,
                label = %talkgroup.label,
                "Talkgroup created"
            );

            call.meta.talkgroup_id = Some(id);
            call.meta.talkgroup_ref = Some(talkgroup_ref);
            changed = true;
        }

        for observed in &call.units {
            let label = observed.label.clone().unwrap_or_default();
            let needs_write = system
                .unit_by_ref(observed.unit_ref)
                .is_none_or(|unit| unit.label.is_empty() && !label.is_empty());
            if needs_write {
                let unit = Unit {
                    unit_ref: observed.unit_ref,
                    label,
                    ..Unit::default()
                };
                self.store.upsert_unit(system.id, &unit).await?;
                changed = true;
            }
        }

        Ok(changed)
    }

    async fn reload_registry(&self) -> Result<()> {
        let systems = self.store.load_systems().await?;
        let groups = self.store.load_groups().await?;
        let tags = self.store.load_tags().await?;
        debug!(
            systems = systems.len(),
            groups = groups.len(),
            tags = tags.len(),
            "Reference data loaded"
        );
        self.registry.replace(systems, groups, tags);
        Ok(())
    }

    /// Re-read reference data and credentials, then notify every session
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn reload(&self) -> Result<()> {
        self.reload_registry().await?;
        self.credentials.reload(self.store.as_ref()).await?;
        self.notify_config_changed();
        Ok(())
    }

    /// Re-check every session's grant and push its configuration, or a PIN
    /// prompt when the grant is gone
    pub fn notify_config_changed(&self) {
        let restricted = self.credentials.is_restricted();
        for client in self.clients.snapshot() {
            let access = if restricted {
                client
                    .access()
                    .and_then(|current| self.credentials.access(&current.code))
            } else {
                Some(Arc::new(Access::unrestricted()))
            };
            client.set_access(access.clone());

            let message = match access {
                Some(access) => self.config_message(&access.scope),
                None => Message::new(Command::Pin),
            };
            tokio::spawn(async move {
                client.send(message).await;
            });
        }
    }

    /// Queue a new session for registration
    pub async fn register(&self, client: Arc<Client>) {
        if self.register_tx.send(client).await.is_err() {
            debug!("Registration queue closed");
        }
    }

    /// Queue a session for removal
    pub async fn unregister(&self, client: Arc<Client>) {
        if self.unregister_tx.send(client).await.is_err() {
            debug!("Registration queue closed");
        }
    }

    async fn run_registration(&self) {
        loop {
            tokio::select! {
                registered = self.register_rx.recv() => {
                    let Ok(client) = registered else { break };
                    self.clients.add(Arc::clone(&client));
                    debug!(client_id = %client.id(), "Session registered");

                    let message = if self.credentials.is_restricted() {
                        Message::new(Command::Pin)
                    } else {
                        let access = Arc::new(Access::unrestricted());
                        client.set_access(Some(Arc::clone(&access)));
                        self.config_message(&access.scope)
                    };
                    tokio::spawn(async move {
                        client.send(message).await;
                    });
                    self.emit_listeners_count();
                }
                unregistered = self.unregister_rx.recv() => {
                    let Ok(client) = unregistered else { break };
                    if self.clients.remove(client.id()) {
                        debug!(client_id = %client.id(), "Session unregistered");
                        self.emit_listeners_count();
                    }
                }
            }
        }
    }

    fn emit_listeners_count(&self) {
        if !self.config.options.show_listeners_count {
            return;
        }
        let count = self.clients.len();
        for client in self.clients.snapshot() {
            let message = Message::new(Command::ListenersCount).with_payload(count);
            tokio::spawn(async move {
                client.send(message).await;
            });
        }
    }

    fn session_scope(&self, client: &Client) -> Option<Scope> {
        if self.credentials.is_restricted() {
            client.access().map(|access| access.scope.clone())
        } else {
            Some(Scope::Wildcard)
        }
    }

    /// Handle one inbound protocol message from `client`
    pub async fn process_message(&self, client: &Arc<Client>, message: Message) {
        match message.command {
            Command::Version => {
                let payload = json!({
                    "branding": self.config.options.branding,
                    "email": self.config.options.email,
                    "version": env!("CARGO_PKG_VERSION"),
                });
                client
                    .send(Message::new(Command::Version).with_payload(payload))
                    .await;
            }
            Command::Pin => self.authenticate(client, message.payload.as_ref()).await,
            _ if self.session_scope(client).is_none() => {
                client.send(Message::new(Command::Pin)).await;
            }
            Command::Config => {
                if let Some(scope) = self.session_scope(client) {
                    client.send(self.config_message(&scope)).await;
                }
            }
            Command::Call => self.send_call(client, message).await,
            Command::ListCalls => self.list_calls(client, message.payload).await,
            Command::LivefeedMap => {
                let active = client.set_livefeed(LiveFeedMatrix::from_value(message.payload.as_ref()));
                client
                    .send(Message::new(Command::LivefeedMap).with_payload(active))
                    .await;
            }
            other => debug!(client_id = %client.id(), command = %other, "Ignored message"),
        }
    }

    async fn authenticate(&self, client: &Arc<Client>, payload: Option<&Value>) {
        let code = payload
            .and_then(Value::as_str)
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let Some(code) = code else {
            client.send(Message::new(Command::Pin)).await;
            return;
        };

        let attempts = client.count_attempt();
        let Some(access) = self.credentials.access(&code) else {
            warn!(client_id = %client.id(), attempts, "Invalid access code");
            client.send(Message::new(Command::Pin)).await;
            return;
        };
        if attempts >= self.config.live.max_auth_attempts {
            warn!(client_id = %client.id(), ident = %access.ident, attempts, "Too many authentication attempts");
            client.send(Message::new(Command::Pin)).await;
            return;
        }
        if access.is_expired_at(Utc::now()) {
            warn!(client_id = %client.id(), ident = %access.ident, "Access code expired");
            client.send(Message::new(Command::Expired)).await;
            return;
        }
        if let Some(limit) = access.limit {
            let sessions = self.clients.count_ident(&access.ident, client.id());
            if sessions >= usize::try_from(limit).unwrap_or(usize::MAX) {
                warn!(client_id = %client.id(), ident = %access.ident, limit, "Session limit reached");
                client.send(Message::new(Command::MaxSessions)).await;
                return;
            }
        }

        client.reset_attempts();
        info!(client_id = %client.id(), ident = %access.ident, "Session authenticated");
        let message = self.config_message(&access.scope);
        client.set_access(Some(access));
        client.send(message).await;
    }

    async fn send_call(&self, client: &Arc<Client>, message: Message) {
        let Some(scope) = self.session_scope(client) else {
            return;
        };
        let id = message.payload.as_ref().and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });
        let Some(id) = id else {
            debug!(client_id = %client.id(), "Call request without id");
            return;
        };

        let mut call = match self.store.get_call(id).await {
            Ok(Some(call)) => call,
            Ok(None) => {
                debug!(client_id = %client.id(), call_id = id, "Requested call not found");
                return;
            }
            Err(e) => {
                error!(client_id = %client.id(), call_id = id, "Failed to load call: {}", e);
                return;
            }
        };
        self.registry.resolve(&mut call);

        let (Some(system_ref), Some(talkgroup_ref)) = (call.system_ref(), call.talkgroup_ref())
        else {
            return;
        };
        if !scope.has_access(system_ref, talkgroup_ref) || Delayer::can_delay(&call) {
            debug!(client_id = %client.id(), call_id = id, "Call request denied");
            return;
        }

        match serde_json::to_value(CallPayload::from(&call)) {
            Ok(payload) => {
                client
                    .send(
                        Message::new(Command::Call)
                            .with_payload(payload)
                            .with_flag(message.flag),
                    )
                    .await;
            }
            Err(e) => error!(call_id = id, "Failed to encode call: {}", e),
        }
    }

    async fn list_calls(&self, client: &Arc<Client>, payload: Option<Value>) {
        let Some(scope) = self.session_scope(client) else {
            return;
        };
        let query: CallQuery = payload
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let search = query.to_search(&self.registry);

        let mut results = match self.store.search_calls(&search, &scope).await {
            Ok(results) => results,
            Err(e) => {
                error!(client_id = %client.id(), "Call search failed: {}", e);
                return;
            }
        };
        let now = Utc::now();
        results.results.retain(|summary| {
            let delay = self.registry.delay_for(summary.system, summary.talkgroup);
            delay == 0
                || summary
                    .date_time
                    .checked_add_signed(ChronoDuration::minutes(i64::from(delay)))
                    .is_some_and(|release| release <= now)
        });

        let mut payload = match serde_json::to_value(&results) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                error!(client_id = %client.id(), "Failed to encode search results: {}", e);
                return;
            }
        };
        payload.insert(
            "options".to_string(),
            serde_json::to_value(&query).unwrap_or(Value::Null),
        );
        client
            .send(Message::new(Command::ListCalls).with_payload(Value::Object(payload)))
            .await;
    }

    /// Configuration snapshot limited to what `scope` covers
    #[must_use]
    pub fn config_message(&self, scope: &Scope) -> Message {
        let options = &self.config.options;
        let mut groups: BTreeMap<String, BTreeMap<String, Vec<u32>>> = BTreeMap::new();
        let mut tags: BTreeMap<String, BTreeMap<String, Vec<u32>>> = BTreeMap::new();

        let systems: Vec<Value> = self
            .registry
            .systems()
            .iter()
            .filter(|system| scope.covers_system(system.system_ref))
            .map(|system| {
                let talkgroups: Vec<Value> = system
                    .talkgroups
                    .iter()
                    .filter(|t| scope.has_access(system.system_ref, t.talkgroup_ref))
                    .map(|t| {
                        let group = t.group_id.and_then(|id| self.registry.group_label(id));
                        let tag = t.tag_id.and_then(|id| self.registry.tag_label(id));
                        if let Some(group) = &group {
                            groups
                                .entry(group.clone())
                                .or_default()
                                .entry(system.system_ref.to_string())
                                .or_default()
                                .push(t.talkgroup_ref);
                        }
                        if let Some(tag) = &tag {
                            tags.entry(tag.clone())
                                .or_default()
                                .entry(system.system_ref.to_string())
                                .or_default()
                                .push(t.talkgroup_ref);
                        }
                        json!({
                            "id": t.talkgroup_ref,
                            "label": t.label,
                            "name": t.name,
                            "frequency": t.frequency,
                            "group": group,
                            "tag": tag,
                            "led": t.led,
                            "order": t.order,
                        })
                    })
                    .collect();
                let units: Vec<Value> = system
                    .units
                    .iter()
                    .map(|u| json!({"id": u.unit_ref, "label": u.label}))
                    .collect();
                json!({
                    "id": system.system_ref,
                    "label": system.label,
                    "order": system.order,
                    "talkgroups": talkgroups,
                    "units": units,
                })
            })
            .collect();

        let payload = json!({
            "options": {
                "branding": options.branding,
                "dimmerDelay": options.dimmer_delay,
                "email": options.email,
                "keypadBeeps": options.keypad_beeps,
                "playbackGoesLive": options.playback_goes_live,
                "showListenersCount": options.show_listeners_count,
                "sortTalkgroups": options.sort_talkgroups,
                "tagsToggle": options.tags_toggle,
                "time12hFormat": options.time12h_format,
            },
            "systems": systems,
            "groups": groups,
            "tags": tags,
        });
        Message::new(Command::Config).with_payload(payload)
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc)]
mod tests {
    use super::*;
    use crate::convert::Passthrough;
    use crate::registry::CallLabels;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use rdio_core::{CallMeta, Downstream};
    use rdio_database::MemoryStore;
    use tokio::sync::mpsc;

    struct NoRelay;

    #[async_trait]
    impl CallRelay for NoRelay {
        async fn send(&self, _: &Call, _: &CallLabels, _: &Downstream) -> Result<()> {
            Ok(())
        }
    }

    fn controller(store: &Arc<MemoryStore>, config: Config) -> Arc<Controller> {
        Controller::new(
            Arc::new(config),
            Arc::clone(store) as Arc<dyn Store>,
            Arc::new(NoRelay),
            Arc::new(Passthrough),
        )
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.add_system(System {
            system_ref: 1,
            label: "County".to_string(),
            talkgroups: vec![Talkgroup {
                talkgroup_ref: 10,
                label: "Fire".to_string(),
                ..Talkgroup::default()
            }],
            ..System::default()
        });
        store
    }

    fn call(system_ref: u32, talkgroup_ref: u32) -> Call {
        Call {
            audio: vec![1; 128],
            audio_name: "call.mp3".to_string(),
            audio_mime: "audio/mpeg".to_string(),
            timestamp: Utc::now(),
            meta: CallMeta {
                system_ref: Some(system_ref),
                talkgroup_ref: Some(talkgroup_ref),
                ..CallMeta::default()
            },
            ..Call::default()
        }
    }

    fn access(code: &str, ident: &str) -> Access {
        Access {
            code: code.to_string(),
            ident: ident.to_string(),
            ..Access::unrestricted()
        }
    }

    fn pin(code: &str) -> Message {
        Message::new(Command::Pin).with_payload(STANDARD.encode(code))
    }

    async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_call_not_persisted() {
        let store = seeded_store();
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();

        let first = call(1, 10);
        let mut second = first.clone();
        second.timestamp = first.timestamp + ChronoDuration::milliseconds(200);
        let mut third = first.clone();
        third.timestamp = first.timestamp + ChronoDuration::seconds(5);

        controller.process_call(first).await;
        controller.process_call(second).await;
        assert_eq!(store.count_calls().await.unwrap(), 1);

        controller.process_call(third).await;
        assert_eq!(store.count_calls().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_blacklisted_calls_dropped() {
        let store = Arc::new(MemoryStore::new());
        store.add_system(System {
            system_ref: 1,
            label: "County".to_string(),
            blacklists: [10].into(),
            talkgroups: vec![Talkgroup {
                talkgroup_ref: 10,
                ..Talkgroup::default()
            }],
            ..System::default()
        });
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();

        controller.process_call(call(1, 10)).await;
        controller.process_call(call(1, 99)).await;
        controller.process_call(call(7, 10)).await;

        assert_eq!(store.count_calls().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_auto_populate_creates_reference_data() {
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.ingest.auto_populate = true;
        let controller = controller(&store, config);
        controller.reload().await.unwrap();

        let mut incoming = call(5, 500);
        incoming.meta.talkgroup_label = Some("Ops".to_string());
        incoming.units = vec![rdio_core::CallUnit {
            unit_ref: 42,
            offset: 0.0,
            label: Some("Engine 1".to_string()),
        }];
        controller.process_call(incoming).await;

        let system = controller.registry().system_by_ref(5).unwrap();
        assert_eq!(system.label, "System 5");
        let talkgroup = system.talkgroup_by_ref(500).unwrap();
        assert_eq!(talkgroup.label, "Ops");
        assert_eq!(talkgroup.name, "Ops");
        assert_eq!(
            controller.registry().group_label(talkgroup.group_id.unwrap()).as_deref(),
            Some(UNKNOWN_GROUP)
        );
        assert_eq!(system.unit_by_ref(42).unwrap().label, "Engine 1");
        assert_eq!(store.count_calls().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_invalid_call() {
        let store = seeded_store();
        let controller = controller(&store, Config::default());
        let mut short = call(1, 10);
        short.audio.truncate(44);

        assert!(matches!(
            controller.ingest(short).await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_does_not_stall_ingest() {
        let store = seeded_store();
        let controller = controller(&store, Config::default());
        controller.start().await.unwrap();

        for edge in [chrono::DateTime::<Utc>::MIN_UTC, chrono::DateTime::<Utc>::MAX_UTC] {
            let mut bad = call(1, 10);
            bad.timestamp = edge;
            assert!(matches!(
                controller.ingest(bad.clone()).await,
                Err(Error::Validation { .. })
            ));
            controller.process_call(bad).await;
        }
        assert_eq!(store.count_calls().await.unwrap(), 0);

        controller.ingest(call(1, 10)).await.unwrap();
        let mut stored = false;
        for _ in 0..100 {
            if store.count_calls().await.unwrap() == 1 {
                stored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stored);
        controller.stop();
    }

    #[tokio::test]
    async fn test_pin_lockout_after_failed_attempts() {
        let store = seeded_store();
        store.add_access(access("1234", "dispatch"));
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();

        let (client, mut rx) = Client::new(8);
        for _ in 0..5 {
            controller.process_message(&client, pin("0000")).await;
            assert_eq!(next(&mut rx).await.command, Command::Pin);
        }
        controller.process_message(&client, pin("1234")).await;
        assert_eq!(next(&mut rx).await.command, Command::Pin);
        assert!(client.access().is_none());
    }

    #[tokio::test]
    async fn test_fifth_attempt_locked_even_with_valid_code() {
        let store = seeded_store();
        store.add_access(access("1234", "dispatch"));
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();

        let (client, mut rx) = Client::new(8);
        for _ in 0..4 {
            controller.process_message(&client, pin("0000")).await;
            assert_eq!(next(&mut rx).await.command, Command::Pin);
        }
        controller.process_message(&client, pin("1234")).await;
        assert_eq!(next(&mut rx).await.command, Command::Pin);
        assert!(client.access().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pin_success_pushes_scoped_config() {
        let store = seeded_store();
        store.add_access(access("1234", "dispatch"));
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();

        let (client, mut rx) = Client::new(8);
        controller
            .process_message(&client, Message::new(Command::Config))
            .await;
        assert_eq!(next(&mut rx).await.command, Command::Pin);

        controller.process_message(&client, pin("0000")).await;
        assert_eq!(next(&mut rx).await.command, Command::Pin);
        controller.process_message(&client, pin("1234")).await;

        let config = next(&mut rx).await;
        assert_eq!(config.command, Command::Config);
        let payload = config.payload.unwrap();
        assert_eq!(payload["systems"][0]["id"], json!(1));
        assert_eq!(payload["systems"][0]["talkgroups"][0]["label"], json!("Fire"));
        assert_eq!(client.ident().as_deref(), Some("dispatch"));
    }

    #[tokio::test]
    async fn test_pin_expired_and_malformed() {
        let store = seeded_store();
        store.add_access(Access {
            expiration: Some(Utc::now() - ChronoDuration::minutes(1)),
            ..access("1234", "dispatch")
        });
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();

        let (client, mut rx) = Client::new(8);
        controller.process_message(&client, pin("1234")).await;
        assert_eq!(next(&mut rx).await.command, Command::Expired);

        controller
            .process_message(&client, Message::new(Command::Pin).with_payload("%%%"))
            .await;
        assert_eq!(next(&mut rx).await.command, Command::Pin);
    }

    #[tokio::test]
    async fn test_session_limit_sends_max_without_config() {
        let store = seeded_store();
        store.add_access(Access {
            limit: Some(1),
            ..access("1234", "dispatch")
        });
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();

        let (first, mut first_rx) = Client::new(8);
        controller.clients().add(Arc::clone(&first));
        controller.process_message(&first, pin("1234")).await;
        assert_eq!(next(&mut first_rx).await.command, Command::Config);

        let (second, mut second_rx) = Client::new(8);
        controller.clients().add(Arc::clone(&second));
        controller.process_message(&second, pin("1234")).await;
        assert_eq!(next(&mut second_rx).await.command, Command::MaxSessions);
        assert!(second_rx.try_recv().is_err());
        assert!(second.access().is_none());
    }

    #[tokio::test]
    async fn test_livefeed_and_version_replies() {
        let store = seeded_store();
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();

        let (client, mut rx) = Client::new(8);
        controller
            .process_message(
                &client,
                Message::new(Command::LivefeedMap).with_payload(json!({"1": {"10": true}})),
            )
            .await;
        assert_eq!(next(&mut rx).await.payload, Some(json!(true)));

        controller
            .process_message(&client, Message::new(Command::Version))
            .await;
        let version = next(&mut rx).await;
        assert_eq!(version.command, Command::Version);
        assert_eq!(version.payload.unwrap()["version"], json!(env!("CARGO_PKG_VERSION")));

        controller
            .process_message(&client, Message::new(Command::Unknown("XYZ".to_string())))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_fetch_and_search() {
        let store = seeded_store();
        let controller = controller(&store, Config::default());
        controller.reload().await.unwrap();
        controller.process_call(call(1, 10)).await;

        let (client, mut rx) = Client::new(8);
        controller
            .process_message(
                &client,
                Message::new(Command::ListCalls).with_payload(json!({"limit": 10})),
            )
            .await;
        let listed = next(&mut rx).await.payload.unwrap();
        assert_eq!(listed["count"], json!(1));
        assert_eq!(listed["options"]["limit"], json!(10));
        let id = listed["results"][0]["id"].clone();

        controller
            .process_message(
                &client,
                Message::new(Command::Call)
                    .with_payload(id.clone())
                    .with_flag(Some(json!("d"))),
            )
            .await;
        let fetched = next(&mut rx).await;
        assert_eq!(fetched.command, Command::Call);
        assert_eq!(fetched.payload.unwrap()["id"], id);
        assert_eq!(fetched.flag, Some(json!("d")));
    }

    #[tokio::test]
    async fn test_registration_grants_open_access() {
        let store = seeded_store();
        let mut config = Config::default();
        config.options.show_listeners_count = true;
        let controller = controller(&store, config);
        controller.start().await.unwrap();

        let (client, mut rx) = Client::new(8);
        controller.register(Arc::clone(&client)).await;

        let mut commands = vec![next(&mut rx).await.command, next(&mut rx).await.command];
        commands.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(commands, vec![Command::Config, Command::ListenersCount]);
        assert!(client.access().is_some());
        assert_eq!(controller.clients().len(), 1);

        controller.stop();
    }

    #[tokio::test]
    async fn test_live_delivery_after_ingest() {
        let store = seeded_store();
        let controller = controller(&store, Config::default());
        controller.start().await.unwrap();

        let (client, mut rx) = Client::new(8);
        controller.register(Arc::clone(&client)).await;
        assert_eq!(next(&mut rx).await.command, Command::Config);
        controller
            .process_message(
                &client,
                Message::new(Command::LivefeedMap).with_payload(json!({"1": {"10": true}})),
            )
            .await;
        assert_eq!(next(&mut rx).await.command, Command::LivefeedMap);

        controller.ingest(call(1, 10)).await.unwrap();
        let delivered = next(&mut rx).await;
        assert_eq!(delivered.command, Command::Call);
        assert_eq!(delivered.payload.unwrap()["talkgroup"], json!(10));

        controller.stop();
    }
}
