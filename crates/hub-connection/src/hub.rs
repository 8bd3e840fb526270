//! Hub session: connection lifecycle plus the domain API.
//!
//! A [`HubClient`] owns at most one live link to its hub. Every operation
//! connects on demand, so callers never have to call
//! [`connect`](HubClient::connect) themselves. While connected, a
//! supervisor watches the hub heartbeat; when it lapses or the link ends
//! unexpectedly, the session drops to `Disconnected` and a single
//! reconnect loop runs until the session is back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ezlo_protocol::constants::{ALREADY_LOGGED_IN, HUB_PORT};
use ezlo_protocol::{Message, describe_error, method};

use crate::error::{ErrorKind, HubError, WsError};
use crate::keepalive::{LossReason, heartbeat_watchdog, reconnect_loop};
use crate::observers::{ObserverHandle, ObserverRegistry, Subscription};
use crate::predicates::{house_mode_switched, scene_finished};
use crate::tracker::Completion;
use crate::transport::{Connector, WsConnector};
use crate::types::{ConnectionState, HubCredentials, ItemTarget, SessionConfig};
use crate::ws_client::WsClient;

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), HubError>>>;

/// Builds the WebSocket URL of a hub reachable at `host`.
pub fn hub_url(host: &str) -> String {
    format!("wss://{host}:{HUB_PORT}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-flight connect attempt, tagged with the session generation it
/// belongs to.
struct Pending {
    generation: u64,
    attempt: ConnectAttempt,
}

struct Active {
    client: Arc<WsClient>,
    /// Stops the heartbeat watchdog of `client`.
    supervisor: CancellationToken,
}

struct Inner {
    url: String,
    credentials: HubCredentials,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    observers: Arc<ObserverRegistry>,
    state: watch::Sender<ConnectionState>,
    active: Mutex<Option<Active>>,
    connecting: Mutex<Option<Pending>>,
    reconnect: Mutex<Option<CancellationToken>>,
    /// Bumped by every shutdown. Attempts started under an older
    /// generation never install their link.
    generation: AtomicU64,
}

/// Session with one hub.
///
/// Cheap to clone; clones share the connection, the observers and the
/// lifecycle state. The session shuts down when the last clone is
/// dropped.
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<Inner>,
}

impl HubClient {
    /// Creates a session with default settings. Nothing is opened until
    /// the first operation.
    pub fn new(url: impl Into<String>, credentials: HubCredentials) -> Self {
        Self::with_config(url, credentials, SessionConfig::default())
    }

    pub fn with_config(
        url: impl Into<String>,
        credentials: HubCredentials,
        config: SessionConfig,
    ) -> Self {
        let connector = Arc::new(WsConnector::new(config.accept_invalid_certs));
        Self::with_connector(url, credentials, config, connector)
    }

    /// Creates a session that opens its links through `connector`.
    pub fn with_connector(
        url: impl Into<String>,
        credentials: HubCredentials,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                credentials,
                config,
                connector,
                observers: Arc::new(ObserverRegistry::new()),
                state,
                active: Mutex::new(None),
                connecting: Mutex::new(None),
                reconnect: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Hub serial number.
    pub fn identity(&self) -> &str {
        &self.inner.credentials.hub_identity
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Opens the link and logs in.
    ///
    /// Returns immediately when already connected. Concurrent callers
    /// share one in-flight attempt and all receive its outcome.
    pub async fn connect(&self) -> Result<(), HubError> {
        let generation = self.inner.generation();
        self.inner.connect_in(generation).await
    }

    /// Closes the link and stops the supervisor, any reconnect loop and
    /// any connect attempt still in flight.
    ///
    /// Pending requests fail, as do callers waiting on an interrupted
    /// connect. Idempotent.
    pub fn disconnect(&self) {
        if self.inner.shutdown() {
            info!(hub = %self.identity(), "disconnected");
        }
    }

    /// True while a logged-in link is open.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver following every lifecycle transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Registers an observer for inbound messages that are not responses.
    pub fn add_observer<P, H>(&self, predicate: P, handler: H) -> ObserverHandle
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.observers.add(predicate, handler)
    }

    /// Returns `false` if the observer was already removed.
    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.inner.observers.remove(handle)
    }

    /// Streams broadcasts matching `predicate` until the subscription is
    /// dropped.
    pub fn subscribe_broadcasts<P>(&self, predicate: P) -> Subscription
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Subscription::new(self.inner.observers.clone(), predicate)
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Sends a raw request and returns the whole response message.
    pub async fn send_request(&self, request: Message) -> Result<Message, HubError> {
        let operation = request.method().unwrap_or("request").to_string();
        let client = self.client_for(&operation).await?;
        client
            .send_request(request)
            .await
            .map_err(|kind| self.error(&operation, kind))
    }

    async fn client_for(&self, operation: &str) -> Result<Arc<WsClient>, HubError> {
        self.connect().await.map_err(|e| e.during(operation))?;
        self.inner
            .current_client()
            .ok_or_else(|| self.error(operation, WsError::Closed.into()))
    }

    async fn call(&self, operation: &str, method: &str, params: Value) -> Result<Value, HubError> {
        let client = self.client_for(operation).await?;
        debug!(hub = %self.identity(), method, "request");
        client
            .send_request(Message::request(method, params))
            .await
            .map(Message::into_result)
            .map_err(|kind| self.error(operation, kind))
    }

    async fn list(
        &self,
        operation: &str,
        method: &str,
        params: Value,
        field: Option<&str>,
    ) -> Result<Vec<Value>, HubError> {
        let result = self.call(operation, method, params).await?;
        let list = match field {
            Some(field) => result.get(field).cloned(),
            None => Some(result),
        };
        match list {
            Some(Value::Array(entries)) => Ok(entries),
            other => Err(self.error(
                operation,
                ErrorKind::UnexpectedResponse(format!(
                    "expected a list{}, got {}",
                    field.map(|f| format!(" in `{f}`")).unwrap_or_default(),
                    other.unwrap_or(Value::Null)
                )),
            )),
        }
    }

    fn error(&self, operation: &str, kind: ErrorKind) -> HubError {
        HubError::new(self.identity(), operation, kind)
    }

    // -----------------------------------------------------------------------
    // Domain API
    // -----------------------------------------------------------------------

    /// Hub model, firmware and serial details.
    pub async fn info(&self) -> Result<Value, HubError> {
        self.call("info", method::INFO, json!({})).await
    }

    /// Devices, items, scenes and rooms in one call.
    pub async fn data(&self) -> Result<Value, HubError> {
        let all = json!({"ids": []});
        self.call(
            "data",
            method::DATA_LIST,
            json!({"devices": all, "items": all, "scenes": all, "rooms": all}),
        )
        .await
    }

    pub async fn devices(&self) -> Result<Vec<Value>, HubError> {
        self.list("devices", method::DEVICES_LIST, json!({}), Some("devices"))
            .await
    }

    /// Device whose `name` equals `name`, if any.
    pub async fn device(&self, name: &str) -> Result<Option<Value>, HubError> {
        Ok(find_by_name(self.devices().await?, name))
    }

    /// Items of all devices, or of `device_id` only.
    pub async fn items(&self, device_id: Option<&str>) -> Result<Vec<Value>, HubError> {
        let params = match device_id {
            Some(id) => json!({"deviceIds": [id]}),
            None => json!({}),
        };
        self.list("items", method::ITEMS_LIST, params, Some("items"))
            .await
    }

    pub async fn item(
        &self,
        name: &str,
        device_id: Option<&str>,
    ) -> Result<Option<Value>, HubError> {
        Ok(find_by_name(self.items(device_id).await?, name))
    }

    pub async fn scenes(&self) -> Result<Vec<Value>, HubError> {
        self.list("scenes", method::SCENES_LIST, json!({}), Some("scenes"))
            .await
    }

    pub async fn scene(&self, name: &str) -> Result<Option<Value>, HubError> {
        Ok(find_by_name(self.scenes().await?, name))
    }

    pub async fn rooms(&self) -> Result<Vec<Value>, HubError> {
        self.list("rooms", method::ROOMS_LIST, json!({}), None).await
    }

    pub async fn room(&self, name: &str) -> Result<Option<Value>, HubError> {
        Ok(find_by_name(self.rooms().await?, name))
    }

    pub async fn house_modes(&self) -> Result<Vec<Value>, HubError> {
        self.list("house_modes", method::MODES_GET, json!({}), Some("modes"))
            .await
    }

    pub async fn house_mode(&self, name: &str) -> Result<Option<Value>, HubError> {
        Ok(find_by_name(self.house_modes().await?, name))
    }

    /// Id of the active house mode.
    pub async fn current_house_mode(&self) -> Result<String, HubError> {
        let operation = "current_house_mode";
        let result = self
            .call(operation, method::MODES_CURRENT_GET, json!({}))
            .await?;
        id_string(result.get("modeId")).ok_or_else(|| {
            self.error(
                operation,
                ErrorKind::UnexpectedResponse(format!("no `modeId` in {result}")),
            )
        })
    }

    pub async fn network_interfaces(&self) -> Result<Vec<Value>, HubError> {
        self.list(
            "network_interfaces",
            method::NETWORK_GET,
            json!({}),
            Some("interfaces"),
        )
        .await
    }

    /// Sets the value of one item or of several items at once.
    pub async fn set_item_value(
        &self,
        target: impl Into<ItemTarget>,
        value: Value,
    ) -> Result<Value, HubError> {
        let params = match target.into() {
            ItemTarget::One(id) => json!({"_id": id, "value": value}),
            ItemTarget::Many(ids) => json!({"ids": ids, "value": value}),
        };
        self.call("set_item_value", method::ITEM_VALUE_SET, params)
            .await
    }

    /// Runs a scene and waits until the hub reports it finished.
    ///
    /// Fails with a timeout when the finished broadcast does not arrive
    /// within the configured scene timeout after the hub accepted the
    /// request.
    pub async fn run_scene(&self, scene_id: &str) -> Result<String, HubError> {
        let operation = "run_scene";
        let completion = Completion::arm(&self.inner.observers, scene_finished(scene_id));
        self.call(operation, method::SCENES_RUN, json!({"sceneId": scene_id}))
            .await?;
        debug!(hub = %self.identity(), scene_id, "scene accepted, waiting for completion");

        completion
            .wait(self.inner.config.scene_timeout)
            .await
            .map_err(|kind| self.error(operation, kind))?;
        info!(hub = %self.identity(), scene_id, "scene finished");
        Ok(scene_id.to_string())
    }

    /// Switches the house mode and waits until the hub reports the switch
    /// done.
    ///
    /// Returns at once, without sending a switch request, when `mode_id`
    /// is already active. Otherwise waits for the hub-announced switch
    /// delay plus a grace period.
    ///
    /// Completion is matched on the destination mode only: overlapping
    /// calls switching to the same mode all complete on the first
    /// matching broadcast, whichever call triggered it.
    pub async fn set_house_mode(&self, mode_id: &str) -> Result<String, HubError> {
        let operation = "set_house_mode";
        let current = self
            .current_house_mode()
            .await
            .map_err(|e| e.during(operation))?;
        if current == mode_id {
            debug!(hub = %self.identity(), mode_id, "house mode already active");
            return Ok(current);
        }

        let completion = Completion::arm(&self.inner.observers, house_mode_switched(mode_id));
        let result = self
            .call(operation, method::MODES_SWITCH, json!({"modeId": mode_id}))
            .await?;
        let delay = result
            .get("switchToDelay")
            .and_then(Value::as_f64)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(Duration::ZERO);
        debug!(hub = %self.identity(), mode_id, ?delay, "mode switch accepted");

        completion
            .wait(delay + self.inner.config.mode_switch_grace)
            .await
            .map_err(|kind| self.error(operation, kind))?;
        info!(hub = %self.identity(), mode_id, "house mode switched");
        Ok(mode_id.to_string())
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(hub = %self.credentials.hub_identity, ?state, "state changed");
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn interrupted(&self, operation: &str) -> HubError {
        HubError::new(
            &self.credentials.hub_identity,
            operation,
            WsError::Closed.into(),
        )
    }

    /// Joins the in-flight attempt or starts one, provided no shutdown
    /// happened since `generation` was read.
    async fn connect_in(self: &Arc<Self>, generation: u64) -> Result<(), HubError> {
        let attempt = {
            let mut slot = lock(&self.connecting);
            if self.generation() != generation {
                return Err(self.interrupted("connect"));
            }
            if self.is_connected() {
                return Ok(());
            }
            match slot.as_ref() {
                Some(pending) => pending.attempt.clone(),
                None => {
                    self.set_state(ConnectionState::Connecting);
                    let inner = self.clone();
                    let task = tokio::spawn(async move {
                        let result = inner.establish(generation).await;
                        let mut slot = lock(&inner.connecting);
                        if slot.as_ref().is_some_and(|p| p.generation == generation) {
                            slot.take();
                        }
                        result
                    });
                    let hub = self.credentials.hub_identity.clone();
                    let attempt: BoxFuture<'static, Result<(), HubError>> =
                        Box::pin(async move {
                            task.await.unwrap_or_else(|e| {
                                warn!(hub = %hub, "connect task failed: {e}");
                                Err(HubError::new(hub, "connect", WsError::Closed.into()))
                            })
                        });
                    let attempt = attempt.shared();
                    *slot = Some(Pending {
                        generation,
                        attempt: attempt.clone(),
                    });
                    attempt
                }
            }
        };
        attempt.await
    }

    fn is_connected(&self) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|active| !active.client.is_closed())
    }

    fn current_client(&self) -> Option<Arc<WsClient>> {
        lock(&self.active)
            .as_ref()
            .filter(|active| !active.client.is_closed())
            .map(|active| active.client.clone())
    }

    /// One physical connect attempt: open, log in, arm the supervisor.
    ///
    /// A shutdown while the attempt runs discards the new link.
    async fn establish(self: &Arc<Self>, generation: u64) -> Result<(), HubError> {
        let hub = self.credentials.hub_identity.clone();
        info!(hub = %hub, url = %self.url, "connecting to hub");

        let client = match WsClient::open(
            self.connector.as_ref(),
            &self.url,
            self.observers.clone(),
            self.config.request_timeout,
        )
        .await
        {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!(hub = %hub, error = %e, "connection failed");
                self.settle_failed(generation);
                return Err(HubError::new(hub, "connect", e.into()));
            }
        };
        if self.generation() != generation {
            debug!(hub = %hub, "disconnected while connecting, dropping link");
            client.close();
            return Err(self.interrupted("connect"));
        }

        if let Err(kind) = login(&client, &self.credentials).await {
            warn!(hub = %hub, error = %kind, "login failed");
            client.close();
            self.settle_failed(generation);
            return Err(HubError::new(hub, "login", kind));
        }

        let supervisor = CancellationToken::new();
        let previous = {
            let mut active = lock(&self.active);
            if self.generation() != generation {
                drop(active);
                debug!(hub = %hub, "disconnected during login, dropping link");
                client.close();
                return Err(self.interrupted("login"));
            }
            let previous = active.replace(Active {
                client: client.clone(),
                supervisor: supervisor.clone(),
            });
            self.set_state(ConnectionState::Connected);
            previous
        };
        if let Some(previous) = previous {
            previous.supervisor.cancel();
            previous.client.close();
        }
        info!(hub = %hub, "connected");

        self.spawn_supervisor(client, supervisor);
        Ok(())
    }

    /// Drops back to `Disconnected` after a failed attempt, unless a
    /// shutdown already took over the state.
    fn settle_failed(&self, generation: u64) {
        let _slot = lock(&self.connecting);
        if self.generation() == generation {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, client: Arc<WsClient>, supervisor: CancellationToken) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.heartbeat_timeout;
        tokio::spawn(async move {
            let reason =
                heartbeat_watchdog(client.heartbeats(), client.closed_token(), supervisor, timeout)
                    .await;
            if let (Some(reason), Some(inner)) = (reason, weak.upgrade()) {
                inner.connection_lost(&client, reason);
            }
        });
    }

    /// Tears down `client` if it is still the live link and starts the
    /// reconnect loop.
    fn connection_lost(self: &Arc<Self>, client: &Arc<WsClient>, reason: LossReason) {
        let lost = {
            let mut active = lock(&self.active);
            match active.as_ref() {
                Some(current) if Arc::ptr_eq(&current.client, client) => active.take(),
                _ => None,
            }
        };
        let Some(lost) = lost else {
            return;
        };

        warn!(hub = %self.credentials.hub_identity, ?reason, "connection lost");
        lost.client.close();
        self.set_state(ConnectionState::Disconnected);
        self.start_reconnect_loop();
    }

    fn start_reconnect_loop(self: &Arc<Self>) {
        let cancel = {
            let mut slot = lock(&self.reconnect);
            if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let interval = self.config.reconnect_interval;
        let hub = self.credentials.hub_identity.clone();
        let generation = self.generation();
        let weak = Arc::downgrade(self);
        info!(hub = %hub, ?interval, "starting reconnect loop");

        tokio::spawn(async move {
            let is_connected = {
                let weak = weak.clone();
                move || weak.upgrade().is_none_or(|inner| inner.is_connected())
            };
            let attempt = move || reconnect_attempt(weak.clone(), hub.clone(), generation);
            reconnect_loop(interval, cancel, is_connected, attempt).await;
        });
    }

    /// Stops everything. Returns `true` if a link was open.
    fn shutdown(&self) -> bool {
        {
            let mut slot = lock(&self.connecting);
            self.generation.fetch_add(1, Ordering::SeqCst);
            slot.take();
        }
        if let Some(token) = lock(&self.reconnect).take() {
            token.cancel();
        }
        let active = lock(&self.active).take();
        let was_open = active.is_some();
        if let Some(active) = active {
            active.supervisor.cancel();
            active.client.close();
        }
        self.set_state(ConnectionState::Disconnected);
        was_open
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn reconnect_attempt(weak: Weak<Inner>, hub: String, generation: u64) -> bool {
    let Some(inner) = weak.upgrade() else {
        return true;
    };
    if inner.generation() != generation {
        return true;
    }
    match inner.connect_in(generation).await {
        Ok(()) => {
            info!(hub = %hub, "reconnected");
            true
        }
        Err(e) => {
            warn!(hub = %hub, error = %e, "reconnect attempt failed");
            false
        }
    }
}

/// Logs in on a fresh link. A hub that reports the session as already
/// logged in is accepted.
async fn login(client: &WsClient, credentials: &HubCredentials) -> Result<(), ErrorKind> {
    let request = Message::request(
        method::LOGIN,
        json!({"user": credentials.user, "token": credentials.token}),
    );
    match client.send_request(request).await {
        Ok(_) => Ok(()),
        Err(ErrorKind::Request { error, .. }) => {
            let reason = describe_error(&error);
            if reason.to_ascii_lowercase().contains(ALREADY_LOGGED_IN) {
                debug!("hub reports session already logged in");
                Ok(())
            } else {
                Err(ErrorKind::Login(reason))
            }
        }
        Err(other) => Err(other),
    }
}

fn find_by_name(entries: Vec<Value>, name: &str) -> Option<Value> {
    entries
        .into_iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(name))
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
