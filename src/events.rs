//! Change broadcasting to live subscribers.
//!
//! Listeners register at tenant scope (every collection) or collection scope.
//! Publishing never blocks: each listener owns a small bounded queue and an
//! event that does not fit is dropped for that listener only. Delivery is
//! at-most-once with no replay.
//!
//! Registries live behind one reader/writer lock. Publishing takes the read
//! side; subscribe, unsubscribe and the stale-listener sweep take the write
//! side. A listener is terminated by removing its registry entry, which
//! signals its `done` channel and closes its queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{DocumentData, FieldType};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// What changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert {
        document_id: String,
        data: Arc<DocumentData>,
    },
    Update {
        document_id: String,
        data: Arc<DocumentData>,
    },
    Delete {
        document_id: String,
    },
    SchemaCreated {
        fields: BTreeMap<String, FieldType>,
    },
    SchemaDeleted,
}

/// Immutable notification of a mutation to a tenant's data or schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub database_id: String,
    pub collection: String,
    pub timestamp: DateTime<Utc>,
    pub change: Change,
}

impl ChangeEvent {
    pub fn new(database_id: &str, collection: &str, change: Change) -> Self {
        Self {
            database_id: database_id.to_string(),
            collection: collection.to_string(),
            timestamp: Utc::now(),
            change,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.change {
            Change::Insert { .. } => "insert",
            Change::Update { .. } => "update",
            Change::Delete { .. } => "delete",
            Change::SchemaCreated { .. } => "schema_created",
            Change::SchemaDeleted => "schema_deleted",
        }
    }

    /// Empty for schema events.
    pub fn document_id(&self) -> &str {
        match &self.change {
            Change::Insert { document_id, .. }
            | Change::Update { document_id, .. }
            | Change::Delete { document_id } => document_id,
            Change::SchemaCreated { .. } | Change::SchemaDeleted => "",
        }
    }

    fn data(&self) -> Option<serde_json::Value> {
        match &self.change {
            Change::Insert { data, .. } | Change::Update { data, .. } => {
                Some(serde_json::Value::Object(data.as_ref().clone()))
            }
            Change::Delete { .. } => None,
            Change::SchemaCreated { fields } => Some(serde_json::json!({
                "schema_name": self.collection,
                "fields": fields,
            })),
            Change::SchemaDeleted => Some(serde_json::json!({ "schema_name": self.collection })),
        }
    }
}

#[derive(Serialize)]
struct WireEvent<'a> {
    event_type: &'static str,
    database_id: &'a str,
    collection: &'a str,
    document_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl Serialize for ChangeEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEvent {
            event_type: self.event_type(),
            database_id: &self.database_id,
            collection: &self.collection,
            document_id: self.document_id(),
            data: self.data(),
            timestamp: self.timestamp,
        }
        .serialize(serializer)
    }
}

/// `event: change` block carrying the event as JSON.
pub fn format_sse(event: &ChangeEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_default();
    format!("event: change\ndata: {}\n\n", data)
}

/// Comment-only heartbeat line.
pub fn format_ping() -> &'static str {
    ": ping\n\n"
}

/// Greeting sent when a stream opens.
pub fn format_connected(database_id: &str, collection: Option<&str>) -> String {
    let mut data = serde_json::json!({
        "database_id": database_id,
        "timestamp": Utc::now(),
    });
    if let Some(collection) = collection {
        data["collection"] = collection.into();
    }
    format!("event: connected\ndata: {}\n\n", data)
}

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Tenant(String),
    Collection { tenant: String, collection: String },
}

#[derive(Debug)]
struct Liveness {
    last_ping: Mutex<Instant>,
}

impl Liveness {
    fn touch(&self) {
        *self.last_ping.lock() = Instant::now();
    }

    fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(*self.last_ping.lock()) > stale_after
    }
}

struct ListenerEntry {
    sender: mpsc::Sender<ChangeEvent>,
    liveness: Arc<Liveness>,
    done: watch::Sender<bool>,
}

impl ListenerEntry {
    fn deliver(&self, id: &Uuid, event: &ChangeEvent) {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(
                    listener = %id,
                    event_type = event.event_type(),
                    "listener queue full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn terminate(self) {
        self.done.send_replace(true);
    }
}

type ListenerSet = HashMap<Uuid, ListenerEntry>;

#[derive(Default)]
struct Registry {
    tenants: HashMap<String, ListenerSet>,
    collections: HashMap<String, HashMap<String, ListenerSet>>,
}

impl Registry {
    fn remove(&mut self, scope: &Scope, id: &Uuid) -> Option<ListenerEntry> {
        match scope {
            Scope::Tenant(tenant) => {
                let listeners = self.tenants.get_mut(tenant)?;
                let entry = listeners.remove(id);
                if listeners.is_empty() {
                    self.tenants.remove(tenant);
                }
                entry
            }
            Scope::Collection { tenant, collection } => {
                let collections = self.collections.get_mut(tenant)?;
                let mut entry = None;
                if let Some(listeners) = collections.get_mut(collection) {
                    entry = listeners.remove(id);
                    if listeners.is_empty() {
                        collections.remove(collection);
                    }
                }
                if collections.is_empty() {
                    self.collections.remove(tenant);
                }
                entry
            }
        }
    }

    fn evict_stale(&mut self, now: Instant, stale_after: Duration) -> Vec<(Uuid, ListenerEntry)> {
        fn drain(
            set: &mut ListenerSet,
            now: Instant,
            stale_after: Duration,
        ) -> Vec<(Uuid, ListenerEntry)> {
            let stale: Vec<Uuid> = set
                .iter()
                .filter(|(_, entry)| entry.liveness.is_stale(now, stale_after))
                .map(|(id, _)| *id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| set.remove(&id).map(|entry| (id, entry)))
                .collect()
        }

        let mut evicted = vec![];
        for listeners in self.tenants.values_mut() {
            evicted.extend(drain(listeners, now, stale_after));
        }
        self.tenants.retain(|_, listeners| !listeners.is_empty());

        for collections in self.collections.values_mut() {
            for listeners in collections.values_mut() {
                evicted.extend(drain(listeners, now, stale_after));
            }
            collections.retain(|_, listeners| !listeners.is_empty());
        }
        self.collections.retain(|_, collections| !collections.is_empty());

        evicted
    }
}

struct Inner {
    config: BroadcasterConfig,
    registry: RwLock<Registry>,
}

/// Fan-out hub for change events. Cheap to clone.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

impl Broadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.inner.config
    }

    /// Listen to every change in a tenant.
    pub fn subscribe(&self, tenant_id: &str) -> Listener {
        self.register(Scope::Tenant(tenant_id.to_string()))
    }

    /// Listen to changes of one collection.
    pub fn subscribe_collection(&self, tenant_id: &str, collection: &str) -> Listener {
        self.register(Scope::Collection {
            tenant: tenant_id.to_string(),
            collection: collection.to_string(),
        })
    }

    fn register(&self, scope: Scope) -> Listener {
        let id = Uuid::new_v4();
        let (sender, events) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let (done, done_rx) = watch::channel(false);
        let liveness = Arc::new(Liveness {
            last_ping: Mutex::new(Instant::now()),
        });
        let entry = ListenerEntry {
            sender,
            liveness: liveness.clone(),
            done,
        };

        {
            let mut registry = self.inner.registry.write();
            let set = match &scope {
                Scope::Tenant(tenant) => registry.tenants.entry(tenant.clone()).or_default(),
                Scope::Collection { tenant, collection } => registry
                    .collections
                    .entry(tenant.clone())
                    .or_default()
                    .entry(collection.clone())
                    .or_default(),
            };
            set.insert(id, entry);
        }
        debug!(listener = %id, ?scope, "listener subscribed");

        Listener {
            id,
            scope,
            events,
            done: done_rx,
            liveness,
            heartbeat_interval: self.inner.config.heartbeat_interval,
            ticker: None,
            broadcaster: self.clone(),
        }
    }

    /// Deregister a tenant-scope listener. Safe to repeat, and safe after the
    /// sweep already evicted it.
    pub fn unsubscribe(&self, tenant_id: &str, listener_id: Uuid) {
        self.remove(&Scope::Tenant(tenant_id.to_string()), &listener_id);
    }

    /// Deregister a collection-scope listener. Idempotent.
    pub fn unsubscribe_collection(&self, tenant_id: &str, collection: &str, listener_id: Uuid) {
        self.remove(
            &Scope::Collection {
                tenant: tenant_id.to_string(),
                collection: collection.to_string(),
            },
            &listener_id,
        );
    }

    fn remove(&self, scope: &Scope, id: &Uuid) {
        let removed = self.inner.registry.write().remove(scope, id);
        if let Some(entry) = removed {
            entry.terminate();
            debug!(listener = %id, "listener unsubscribed");
        }
    }

    /// Deliver to every tenant-scope listener of the event's tenant and every
    /// collection-scope listener of its collection. Never blocks.
    pub fn publish(&self, event: ChangeEvent) {
        let registry = self.inner.registry.read();
        if let Some(listeners) = registry.tenants.get(&event.database_id) {
            for (id, entry) in listeners {
                entry.deliver(id, &event);
            }
        }
        if let Some(listeners) = registry
            .collections
            .get(&event.database_id)
            .and_then(|collections| collections.get(&event.collection))
        {
            for (id, entry) in listeners {
                entry.deliver(id, &event);
            }
        }
    }

    /// Terminate every listener of a tenant, at both scopes.
    pub fn close_tenant(&self, tenant_id: &str) -> usize {
        let mut closed = vec![];
        {
            let mut registry = self.inner.registry.write();
            if let Some(listeners) = registry.tenants.remove(tenant_id) {
                closed.extend(listeners.into_values());
            }
            if let Some(collections) = registry.collections.remove(tenant_id) {
                closed.extend(collections.into_values().flat_map(|set| set.into_values()));
            }
        }
        let count = closed.len();
        for entry in closed {
            entry.terminate();
        }
        if count > 0 {
            debug!(tenant = tenant_id, closed = count, "tenant listeners closed");
        }
        count
    }

    /// Refresh a listener's liveness.
    pub fn heartbeat(&self, listener: &Listener) {
        listener.liveness.touch();
    }

    /// Evict every listener that has not heartbeated within the staleness
    /// threshold. Returns how many were evicted.
    pub fn sweep_stale(&self) -> usize {
        let evicted = self
            .inner
            .registry
            .write()
            .evict_stale(Instant::now(), self.inner.config.stale_after);
        let count = evicted.len();
        for (id, entry) in evicted {
            debug!(listener = %id, "stale listener evicted");
            entry.terminate();
        }
        if count > 0 {
            info!(evicted = count, "swept stale listeners");
        }
        count
    }

    /// Run [`Broadcaster::sweep_stale`] every sweep interval until the last
    /// broadcaster handle is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Broadcaster { inner }.sweep_stale();
            }
        })
    }

    /// Tenant-scope listeners for a tenant.
    pub fn listener_count(&self, tenant_id: &str) -> usize {
        self.inner
            .registry
            .read()
            .tenants
            .get(tenant_id)
            .map_or(0, |listeners| listeners.len())
    }

    pub fn collection_listener_count(&self, tenant_id: &str, collection: &str) -> usize {
        self.inner
            .registry
            .read()
            .collections
            .get(tenant_id)
            .and_then(|collections| collections.get(collection))
            .map_or(0, |listeners| listeners.len())
    }
}

/// What a delivery loop should write next.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Change(ChangeEvent),
    Heartbeat,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Listener {
    id: Uuid,
    scope: Scope,
    events: mpsc::Receiver<ChangeEvent>,
    done: watch::Receiver<bool>,
    liveness: Arc<Liveness>,
    heartbeat_interval: Duration,
    ticker: Option<Interval>,
    broadcaster: Broadcaster,
}

enum Step {
    Terminated,
    Event(Option<ChangeEvent>),
    Tick,
}

impl Listener {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_terminated(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait for the next event or heartbeat. Both refresh this listener's
    /// liveness, and a due heartbeat is not starved by queued events.
    /// Returns `None` once the listener is terminated; callers stop on client
    /// disconnect by dropping the future.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if self.is_terminated() {
            return None;
        }

        let period = self.heartbeat_interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let step = tokio::select! {
            biased;
            _ = self.done.changed() => Step::Terminated,
            _ = ticker.tick() => Step::Tick,
            event = self.events.recv() => Step::Event(event),
        };

        match step {
            Step::Terminated | Step::Event(None) => None,
            Step::Event(Some(event)) => {
                self.liveness.touch();
                Some(Delivery::Change(event))
            }
            Step::Tick => {
                self.broadcaster.heartbeat(self);
                Some(Delivery::Heartbeat)
            }
        }
    }

    /// Wait for the next change event, skipping heartbeats.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.recv().await? {
                Delivery::Change(event) => return Some(event),
                Delivery::Heartbeat => continue,
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.broadcaster.remove(&self.scope, &self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert_event(tenant: &str, collection: &str, id: &str) -> ChangeEvent {
        let data = json!({"name": "Alice"}).as_object().cloned().unwrap();
        ChangeEvent::new(
            tenant,
            collection,
            Change::Insert {
                document_id: id.to_string(),
                data: Arc::new(data),
            },
        )
    }

    fn quick_config() -> BroadcasterConfig {
        BroadcasterConfig {
            queue_capacity: 10,
            heartbeat_interval: Duration::from_secs(60),
            stale_after: Duration::from_millis(30),
            sweep_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_scopes_only() {
        let broadcaster = Broadcaster::default();
        let mut tenant_listener = broadcaster.subscribe("db_a");
        let mut users_listener = broadcaster.subscribe_collection("db_a", "users");
        let mut orders_listener = broadcaster.subscribe_collection("db_a", "orders");
        let mut other_tenant = broadcaster.subscribe("db_b");

        broadcaster.publish(insert_event("db_a", "users", "doc_1"));

        assert_eq!(
            tenant_listener.next_event().await.unwrap().document_id(),
            "doc_1"
        );
        assert_eq!(
            users_listener.next_event().await.unwrap().document_id(),
            "doc_1"
        );
        assert!(orders_listener.events.try_recv().is_err());
        assert!(other_tenant.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let broadcaster = Broadcaster::new(BroadcasterConfig {
            queue_capacity: 2,
            ..BroadcasterConfig::default()
        });
        let mut listener = broadcaster.subscribe("db_a");

        for i in 0..5 {
            broadcaster.publish(insert_event("db_a", "users", &format!("doc_{i}")));
        }

        assert_eq!(listener.next_event().await.unwrap().document_id(), "doc_0");
        assert_eq!(listener.next_event().await.unwrap().document_id(), "doc_1");
        assert!(listener.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_terminates() {
        let broadcaster = Broadcaster::default();
        let mut listener = broadcaster.subscribe_collection("db_a", "users");
        assert_eq!(broadcaster.collection_listener_count("db_a", "users"), 1);

        broadcaster.unsubscribe_collection("db_a", "users", listener.id());
        broadcaster.unsubscribe_collection("db_a", "users", listener.id());
        assert_eq!(broadcaster.collection_listener_count("db_a", "users"), 0);

        assert!(listener.is_terminated());
        assert!(listener.recv().await.is_none());
        drop(listener);
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let broadcaster = Broadcaster::default();
        let listener = broadcaster.subscribe("db_a");
        assert_eq!(broadcaster.listener_count("db_a"), 1);
        drop(listener);
        assert_eq!(broadcaster.listener_count("db_a"), 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_stale_listeners() {
        let broadcaster = Broadcaster::new(quick_config());
        let mut stale = broadcaster.subscribe("db_a");
        let fresh = broadcaster.subscribe_collection("db_a", "users");

        tokio::time::sleep(Duration::from_millis(60)).await;
        broadcaster.heartbeat(&fresh);

        assert_eq!(broadcaster.sweep_stale(), 1);
        assert_eq!(broadcaster.listener_count("db_a"), 0);
        assert_eq!(broadcaster.collection_listener_count("db_a", "users"), 1);
        assert!(stale.recv().await.is_none());

        // Dropping an already-evicted listener must not panic.
        drop(stale);
        drop(fresh);
    }

    #[tokio::test]
    async fn test_background_sweeper_terminates_listener() {
        let broadcaster = Broadcaster::new(quick_config());
        let _sweeper = broadcaster.spawn_sweeper();
        let mut listener = broadcaster.subscribe("db_a");

        let ended = tokio::time::timeout(Duration::from_secs(2), listener.recv()).await;
        assert_eq!(ended.unwrap(), None);
        assert_eq!(broadcaster.listener_count("db_a"), 0);
    }

    #[tokio::test]
    async fn test_idle_listener_heartbeats() {
        let broadcaster = Broadcaster::new(BroadcasterConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..BroadcasterConfig::default()
        });
        let mut listener = broadcaster.subscribe("db_a");
        assert_eq!(listener.recv().await, Some(Delivery::Heartbeat));
    }

    #[tokio::test]
    async fn test_busy_listener_stays_live_and_gets_pings() {
        let broadcaster = Broadcaster::new(BroadcasterConfig {
            queue_capacity: 10,
            heartbeat_interval: Duration::from_millis(20),
            stale_after: Duration::from_millis(80),
            sweep_interval: Duration::from_secs(60),
        });
        let mut listener = broadcaster.subscribe("db_a");

        let started = Instant::now();
        let (mut changes, mut pings) = (0, 0);
        while started.elapsed() < Duration::from_millis(300) {
            broadcaster.publish(insert_event("db_a", "users", "doc_1"));
            match listener.recv().await {
                Some(Delivery::Change(_)) => changes += 1,
                Some(Delivery::Heartbeat) => pings += 1,
                None => panic!("listener ended while consuming"),
            }
            tokio::task::yield_now().await;
        }

        assert!(changes > 0);
        assert!(pings > 0);
        assert_eq!(broadcaster.sweep_stale(), 0);
        assert_eq!(broadcaster.listener_count("db_a"), 1);
        assert!(!listener.is_terminated());
    }

    #[tokio::test]
    async fn test_close_tenant_ends_both_scopes() {
        let broadcaster = Broadcaster::default();
        let mut whole = broadcaster.subscribe("db_a");
        let mut users = broadcaster.subscribe_collection("db_a", "users");
        let _other = broadcaster.subscribe("db_b");

        assert_eq!(broadcaster.close_tenant("db_a"), 2);
        assert!(whole.recv().await.is_none());
        assert!(users.recv().await.is_none());
        assert_eq!(broadcaster.listener_count("db_a"), 0);
        assert_eq!(broadcaster.listener_count("db_b"), 1);
        assert_eq!(broadcaster.close_tenant("db_a"), 0);
    }

    #[test]
    fn test_wire_format() {
        let event = insert_event("db_a", "users", "doc_1");
        let text = format_sse(&event);
        assert!(text.starts_with("event: change\ndata: {"));
        assert!(text.ends_with("}\n\n"));

        let json_line = text.lines().nth(1).unwrap().trim_start_matches("data: ");
        let value: serde_json::Value = serde_json::from_str(json_line).unwrap();
        assert_eq!(value["event_type"], "insert");
        assert_eq!(value["database_id"], "db_a");
        assert_eq!(value["document_id"], "doc_1");
        assert_eq!(value["data"]["name"], "Alice");

        let delete = ChangeEvent::new(
            "db_a",
            "users",
            Change::Delete {
                document_id: "doc_1".into(),
            },
        );
        let value = serde_json::to_value(&delete).unwrap();
        assert!(value.get("data").is_none());

        assert_eq!(format_ping(), ": ping\n\n");
        assert!(format_connected("db_a", Some("users")).contains("\"collection\":\"users\""));
    }
}
