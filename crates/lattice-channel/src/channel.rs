//! The channel coordinator.
//!
//! [`StateChannel`] is the lifecycle root: it lazily builds the transport
//! and the state builder when the first subscriber arrives, pumps transport
//! events through a single dispatch task (all state mutation is serialized
//! there), fans notifications out to listener registries, and tears the
//! transport down when the last subscriber leaves. The builder survives
//! teardown so a later re-subscribe resumes from the in-memory graph.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lattice_core::{Instance, InstanceKey, InstancePayload, ModelMap};
use lattice_state::{ChannelState, StateBuilder};
use lattice_transport::{CloseReason, ServerFrame, Transport, TransportConfig, TransportEvent};

use crate::actions::{ActionError, CallIdGenerator, PendingActions};
use crate::config::ChannelConfig;
use crate::listeners::ListenerSet;

/// Live transport plus the dispatch task pumping its events.
struct ChannelLink {
    transport: Transport,
    _dispatch: JoinHandle<()>,
}

/// Coordinates one transport and one state builder.
pub struct StateChannel {
    config: ChannelConfig,
    model: ModelMap,
    anchor_type: String,
    many: bool,
    builder: Mutex<Option<StateBuilder>>,
    link: Mutex<Option<ChannelLink>>,
    subscriber_count: AtomicUsize,
    state_listeners: ListenerSet<ChannelState>,
    connection_listeners: ListenerSet<Option<i64>>,
    error_listeners: ListenerSet<String>,
    empty_listeners: ListenerSet<()>,
    system_listeners: ListenerSet<Value>,
    runtime_listeners: ListenerSet<HashMap<String, Value>>,
    instance_listeners: Mutex<HashMap<InstanceKey, Arc<ListenerSet<Arc<Instance>>>>>,
    runtime_state: Mutex<HashMap<String, Value>>,
    pending: PendingActions,
    call_ids: CallIdGenerator,
}

/// Whole-state subscription handle.
pub struct Subscription {
    channel: Arc<StateChannel>,
    state_id: u64,
    connection_id: Option<u64>,
}

impl Subscription {
    /// Remove this listener. Tears the transport down when it was the last
    /// subscriber; the builder state is retained for a later re-subscribe.
    pub fn unsubscribe(self) {
        let _ = self.channel.state_listeners.remove(self.state_id);
        if let Some(id) = self.connection_id {
            let _ = self.channel.connection_listeners.remove(id);
        }
        if self.channel.subscriber_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.channel.disconnect_with(CloseReason::NoSubscribers);
        }
    }
}

/// Per-instance subscription handle.
pub struct InstanceSubscription {
    channel: Arc<StateChannel>,
    key: InstanceKey,
    listener_id: u64,
}

impl InstanceSubscription {
    /// Remove this listener.
    pub fn unsubscribe(self) {
        let mut map = self.channel.instance_listeners.lock();
        if let Some(set) = map.get(&self.key).cloned() {
            let _ = set.remove(self.listener_id);
            if set.is_empty() {
                let _ = map.remove(&self.key);
            }
        }
    }
}

impl StateChannel {
    /// Create a coordinator. Nothing connects until the first subscriber.
    #[must_use]
    pub fn new(config: ChannelConfig, model: ModelMap, anchor_type: &str, many: bool) -> Self {
        Self {
            config,
            model,
            anchor_type: anchor_type.to_owned(),
            many,
            builder: Mutex::new(None),
            link: Mutex::new(None),
            subscriber_count: AtomicUsize::new(0),
            state_listeners: ListenerSet::new(),
            connection_listeners: ListenerSet::new(),
            error_listeners: ListenerSet::new(),
            empty_listeners: ListenerSet::new(),
            system_listeners: ListenerSet::new(),
            runtime_listeners: ListenerSet::new(),
            instance_listeners: Mutex::new(HashMap::new()),
            runtime_state: Mutex::new(HashMap::new()),
            pending: PendingActions::new(),
            call_ids: CallIdGenerator::new(),
        }
    }

    /// Lazily construct the builder and transport and start dispatching.
    /// Idempotent; no side effects after the first call.
    pub fn init(self: &Arc<Self>) {
        let mut link = self.link.lock();
        if link.is_some() {
            return;
        }
        {
            let mut builder = self.builder.lock();
            if builder.is_none() {
                *builder = Some(StateBuilder::new(
                    self.model.clone(),
                    &self.anchor_type,
                    self.many,
                ));
            }
        }
        let (transport, events) = Transport::connect(TransportConfig {
            url: self.config.url(),
            token: self.config.token.clone(),
            protocols: self.config.protocols.clone(),
            initial_backoff_ms: self.config.initial_backoff_ms,
            max_backoff_ms: self.config.max_backoff_ms,
        });
        let dispatch = tokio::spawn(Self::dispatch(Arc::clone(self), events));
        *link = Some(ChannelLink {
            transport,
            _dispatch: dispatch,
        });
    }

    /// Whether a transport is currently live.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Whether the handshake has completed on the current socket.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.transport.is_ready())
    }

    // ─── Subscriptions ───────────────────────────────────────────────────

    /// Register a whole-state listener. The first subscriber triggers
    /// [`StateChannel::init`].
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(ChannelState) + Send + Sync + 'static,
    ) -> Subscription {
        let state_id = self.state_listeners.add(listener);
        let _ = self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        self.init();
        Subscription {
            channel: Arc::clone(self),
            state_id,
            connection_id: None,
        }
    }

    /// [`StateChannel::subscribe`] plus a connection-change listener, which
    /// receives `None` when connected and the closure timestamp (unix
    /// milliseconds) when disconnected.
    pub fn subscribe_with_connection(
        self: &Arc<Self>,
        listener: impl Fn(ChannelState) + Send + Sync + 'static,
        connection_listener: impl Fn(Option<i64>) + Send + Sync + 'static,
    ) -> Subscription {
        let state_id = self.state_listeners.add(listener);
        let connection_id = Some(self.connection_listeners.add(connection_listener));
        let _ = self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        self.init();
        Subscription {
            channel: Arc::clone(self),
            state_id,
            connection_id,
        }
    }

    /// Register a listener for one instance, keyed by `"type:id"`. If the
    /// instance is already loaded the listener fires synchronously with the
    /// current reference.
    pub fn subscribe_instance(
        self: &Arc<Self>,
        listener: impl Fn(Arc<Instance>) + Send + Sync + 'static,
        id: i64,
        type_tag: &str,
    ) -> InstanceSubscription {
        let key = InstanceKey::new(type_tag, id);
        let callback: Arc<dyn Fn(Arc<Instance>) + Send + Sync> = Arc::new(listener);
        let set = {
            let mut map = self.instance_listeners.lock();
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let listener_id = set.add({
            let callback = Arc::clone(&callback);
            move |instance| callback(instance)
        });
        let loaded = self
            .builder
            .lock()
            .as_ref()
            .and_then(|builder| builder.instance(&key))
            .filter(|instance| instance.loaded);
        if let Some(instance) = loaded {
            callback(instance);
        }
        InstanceSubscription {
            channel: Arc::clone(self),
            key,
            listener_id,
        }
    }

    /// Register a listener fired whenever a runtime variable changes; it
    /// receives the merged mapping.
    pub fn subscribe_runtime_state(
        &self,
        listener: impl Fn(HashMap<String, Value>) + Send + Sync + 'static,
    ) -> u64 {
        self.runtime_listeners.add(listener)
    }

    /// Remove a runtime-state listener.
    pub fn unsubscribe_runtime_state(&self, id: u64) {
        let _ = self.runtime_listeners.remove(id);
    }

    /// Register an error listener (authentication failures, fatal state
    /// errors, server-sent status errors).
    pub fn subscribe_errors(&self, listener: impl Fn(String) + Send + Sync + 'static) -> u64 {
        self.error_listeners.add(listener)
    }

    /// Remove an error listener.
    pub fn unsubscribe_errors(&self, id: u64) {
        let _ = self.error_listeners.remove(id);
    }

    /// Register a listener for the empty multi-anchor signal.
    pub fn subscribe_empty(&self, listener: impl Fn(()) + Send + Sync + 'static) -> u64 {
        self.empty_listeners.add(listener)
    }

    /// Remove an empty-signal listener.
    pub fn unsubscribe_empty(&self, id: u64) {
        let _ = self.empty_listeners.remove(id);
    }

    /// Register a listener for system broadcast frames.
    pub fn subscribe_system(&self, listener: impl Fn(Value) + Send + Sync + 'static) -> u64 {
        self.system_listeners.add(listener)
    }

    /// Remove a system-broadcast listener.
    pub fn unsubscribe_system(&self, id: u64) {
        let _ = self.system_listeners.remove(id);
    }

    // ─── RPC ─────────────────────────────────────────────────────────────

    /// Call a server-side action and await its response. Responses are
    /// matched strictly by call id; concurrent calls are independent.
    pub async fn call_action(&self, name: &str, params: Vec<Value>) -> Result<Value, ActionError> {
        let call_id = self.call_ids.next();
        let rx = self.pending.register(call_id);
        let frame = serde_json::json!({
            "callId": call_id,
            "action": name,
            "params": params,
        })
        .to_string();
        let sent = self
            .link
            .lock()
            .as_ref()
            .is_some_and(|link| link.transport.send(frame));
        if !sent {
            let _ = self
                .pending
                .resolve(call_id, Err(ActionError::ChannelClosed));
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ActionError::ChannelClosed),
        }
    }

    // ─── State access ────────────────────────────────────────────────────

    /// The current derived state view, once the channel was initialized.
    #[must_use]
    pub fn state(&self) -> Option<ChannelState> {
        self.builder.lock().as_ref().map(StateBuilder::state)
    }

    /// The merged runtime-variable mapping.
    #[must_use]
    pub fn runtime_state(&self) -> HashMap<String, Value> {
        self.runtime_state.lock().clone()
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Terminally close the transport. The builder state is retained.
    pub fn disconnect(&self) {
        self.disconnect_with(CloseReason::ManualDisconnect);
    }

    fn disconnect_with(&self, reason: CloseReason) {
        if let Some(link) = self.link.lock().take() {
            link.transport.disconnect(reason);
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    async fn dispatch(channel: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => channel.connection_listeners.notify(&None),
                TransportEvent::AuthFailed(error) => channel.error_listeners.notify(&error),
                TransportEvent::Disconnected { at_ms, terminal } => {
                    channel.connection_listeners.notify(&Some(at_ms));
                    if terminal.is_some() {
                        // No reconnection follows: reject in-flight calls
                        // and release the dead transport so a later
                        // subscribe can start over.
                        channel.pending.drain();
                        let _ = channel.link.lock().take();
                    }
                }
                TransportEvent::Frame(frame) => channel.handle_frame(frame),
            }
        }
        debug!("dispatch loop ended");
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Instances(batch) => self.apply_batch(&batch),
            ServerFrame::ActionResponse {
                call_id,
                result,
                error,
            } => {
                let outcome = match error {
                    Some(error) => Err(ActionError::Remote(error)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if !self.pending.resolve(call_id, outcome) {
                    warn!(call_id, "unmatched action response, dropping");
                }
            }
            ServerFrame::RuntimeVar { name, value } => {
                let snapshot = {
                    let mut vars = self.runtime_state.lock();
                    if vars.get(&name) == Some(&value) {
                        None
                    } else {
                        let _ = vars.insert(name, value);
                        Some(vars.clone())
                    }
                };
                if let Some(snapshot) = snapshot {
                    self.runtime_listeners.notify(&snapshot);
                }
            }
            ServerFrame::InitialAnchors(ids) => {
                if let Some(builder) = self.builder.lock().as_mut() {
                    builder.set_anchors(&ids);
                }
                if ids.is_empty() {
                    self.empty_listeners.notify(&());
                }
            }
            ServerFrame::PrependAnchor(id) => {
                if let Some(builder) = self.builder.lock().as_mut() {
                    builder.prepend_anchor(id);
                }
            }
            ServerFrame::System(value) => self.system_listeners.notify(&value),
            // The transport already reconnects on maintenance frames.
            ServerFrame::Maintenance(_) => {}
            ServerFrame::Status { status_code, error } => {
                if let Some(error) = error {
                    self.error_listeners.notify(&error);
                } else if status_code == 200 {
                    self.connection_listeners.notify(&None);
                }
            }
        }
    }

    /// Apply one instance batch: builder update, then per-instance
    /// listeners (once per identity, post-batch state), then whole-state
    /// listeners.
    fn apply_batch(&self, batch: &[InstancePayload]) {
        let result = {
            let mut guard = self.builder.lock();
            let Some(builder) = guard.as_mut() else {
                return;
            };
            builder.update(batch)
        };
        if let Err(err) = result {
            warn!(error = %err, "fatal state error, closing channel");
            self.error_listeners.notify(&err.to_string());
            self.disconnect_with(CloseReason::ProtocolError);
            return;
        }

        let mut seen: HashSet<InstanceKey> = HashSet::new();
        for payload in batch {
            if payload.is_control() {
                continue;
            }
            let key = payload.key();
            if !seen.insert(key.clone()) {
                continue;
            }
            let set = self.instance_listeners.lock().get(&key).cloned();
            let Some(set) = set else { continue };
            let entry = self
                .builder
                .lock()
                .as_ref()
                .and_then(|builder| builder.instance(&key));
            if let Some(instance) = entry {
                set.notify(&instance);
            }
        }

        let state = self.builder.lock().as_ref().map(StateBuilder::state);
        if let Some(state) = state {
            self.state_listeners.notify(&state);
        }
    }
}
