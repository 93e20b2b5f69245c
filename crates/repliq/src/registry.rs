//! The registry: a replicated `name -> endpoint` table.
//!
//! One node hosts the table as an ordinary source named
//! [`REGISTRY_NAME`]; every other node configured with the registry URL
//! holds a replica of it. Nodes announce their sources with `AddSource`
//! and withdraw them with `RemoveSource`. The host drops every entry a
//! connection announced when that connection closes.
//!
//! A name maps to exactly one endpoint. An announcement for a name that is
//! already taken by a different endpoint is refused and logged, and the
//! losing node drops the announcement.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use repliq_protocol::{CapabilityMap, Packet, PropertyModifier, SourceLocation, Value, ValueType};
use repliq_source::{Emitter, RemoteObject};
use repliq_transport::{ConnectionId, Endpoint};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::actor::Command;
use crate::RepliqError;

/// Name under which the registry source is hosted.
pub const REGISTRY_NAME: &str = "Registry";

/// Index of the `sourceLocations` property.
pub(crate) const LOCATIONS_PROPERTY: usize = 0;

/// Index of the `remoteObjectAdded(name, url)` signal. Signal 0 is the
/// derived `sourceLocationsChanged`.
pub(crate) const ADDED_SIGNAL: usize = 1;

/// Index of the `remoteObjectRemoved(name, url)` signal.
pub(crate) const REMOVED_SIGNAL: usize = 2;

/// Capability map of the registry type.
pub fn registry_capabilities() -> Arc<CapabilityMap> {
    static API: OnceLock<Arc<CapabilityMap>> = OnceLock::new();
    API.get_or_init(|| {
        Arc::new(
            CapabilityMap::builder("Registry")
                .property("sourceLocations", ValueType::Map, PropertyModifier::ReadOnly)
                .signal("remoteObjectAdded", [("name", ValueType::String), ("url", ValueType::String)])
                .signal("remoteObjectRemoved", [("name", ValueType::String), ("url", ValueType::String)])
                .build(),
        )
    })
    .clone()
}

fn table_value(table: &BTreeMap<String, SourceLocation>) -> Value {
    Value::Map(
        table
            .iter()
            .map(|(name, loc)| (name.clone(), Value::String(loc.endpoint.to_string())))
            .collect(),
    )
}

/// Parses the `sourceLocations` property. Malformed entries are skipped.
pub(crate) fn parse_table(value: &Value) -> BTreeMap<String, SourceLocation> {
    let Some(map) = value.as_map() else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(name, url)| {
            let endpoint = url.as_str().and_then(|raw| Endpoint::parse(raw).ok());
            if endpoint.is_none() {
                tracing::warn!(name, %url, "ignoring registry entry with a bad endpoint");
            }
            endpoint.map(|ep| (name.clone(), SourceLocation::new(name.clone(), ep)))
        })
        .collect()
}

fn location_args(args: &[Value]) -> Option<SourceLocation> {
    let [name, url] = args else {
        return None;
    };
    let endpoint = Endpoint::parse(url.as_str()?).ok()?;
    Some(SourceLocation::new(name.as_str()?, endpoint))
}

// ---------------------------------------------------------------------------
// RegistryObject (host side)
// ---------------------------------------------------------------------------

/// The table as hosted by the registry node.
#[derive(Debug, Default)]
pub(crate) struct RegistryObject {
    locations: BTreeMap<String, SourceLocation>,
    /// Which connection announced each entry; `None` for the host's own.
    owners: HashMap<String, Option<ConnectionId>>,
}

impl RegistryObject {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn locations(&self) -> &BTreeMap<String, SourceLocation> {
        &self.locations
    }

    /// Adds an entry. Returns `false` if the name belongs to another
    /// endpoint. Re-adding an identical entry changes nothing.
    pub(crate) fn add(
        &mut self,
        location: SourceLocation,
        owner: Option<ConnectionId>,
        signals: &mut Emitter,
    ) -> bool {
        if let Some(existing) = self.locations.get(&location.name) {
            if existing.endpoint != location.endpoint {
                tracing::warn!(
                    name = %location.name,
                    existing = %existing.endpoint,
                    rejected = %location.endpoint,
                    "registry name collision"
                );
                return false;
            }
            self.owners.insert(location.name.clone(), owner);
            return true;
        }
        tracing::info!(%location, "registry entry added");
        signals.emit(ADDED_SIGNAL, [Value::from(location.name.as_str()), Value::from(location.endpoint.to_string())]);
        self.owners.insert(location.name.clone(), owner);
        self.locations.insert(location.name.clone(), location);
        true
    }

    /// Removes an entry if it still points at `location.endpoint`.
    pub(crate) fn remove(&mut self, location: &SourceLocation, signals: &mut Emitter) -> bool {
        match self.locations.get(&location.name) {
            Some(existing) if existing.endpoint == location.endpoint => {}
            _ => return false,
        }
        self.drop_entry(&location.name, signals);
        true
    }

    /// Removes everything `conn` announced.
    pub(crate) fn remove_owned_by(&mut self, conn: ConnectionId, signals: &mut Emitter) -> usize {
        let owned: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == Some(conn))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            self.drop_entry(name, signals);
        }
        owned.len()
    }

    fn drop_entry(&mut self, name: &str, signals: &mut Emitter) {
        self.owners.remove(name);
        if let Some(location) = self.locations.remove(name) {
            tracing::info!(%location, "registry entry removed");
            signals.emit(
                REMOVED_SIGNAL,
                [Value::from(location.name.as_str()), Value::from(location.endpoint.to_string())],
            );
        }
    }
}

impl RemoteObject for RegistryObject {
    fn capabilities(&self) -> Arc<CapabilityMap> {
        registry_capabilities()
    }

    fn property(&self, index: usize) -> Value {
        match index {
            LOCATIONS_PROPERTY => table_value(&self.locations),
            _ => Value::Null,
        }
    }

    fn set_property(&mut self, _index: usize, _value: Value) -> Result<(), String> {
        Err("the registry table is read-only".into())
    }

    fn invoke(&mut self, _method: usize, _args: Vec<Value>, _signals: &mut Emitter) -> Result<Value, String> {
        Err("the registry has no methods".into())
    }
}

// ---------------------------------------------------------------------------
// RegistryClient (replica side)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Announced {
    location: SourceLocation,
    /// The host's table holds this entry.
    confirmed: bool,
}

/// What a non-hosting node knows about the registry.
///
/// Keeps the node's own announcements so they can be replayed whenever
/// the registry replica becomes valid again, and a mirror of the table.
#[derive(Debug, Default)]
pub(crate) struct RegistryClient {
    hosted: BTreeMap<String, Announced>,
    table: BTreeMap<String, SourceLocation>,
    online: bool,
}

impl RegistryClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn table(&self) -> &BTreeMap<String, SourceLocation> {
        &self.table
    }

    fn announce(location: &SourceLocation) -> Packet {
        Packet::AddSource {
            location: location.clone(),
        }
    }

    fn collides(&self, location: &SourceLocation) -> Option<&SourceLocation> {
        self.table
            .get(&location.name)
            .filter(|existing| existing.endpoint != location.endpoint)
    }

    /// Records a source to announce. Returns `false` (and no packet) if
    /// this node already announces the name elsewhere or the name is known
    /// to belong to another endpoint.
    pub(crate) fn add_source(&mut self, location: SourceLocation) -> (bool, Option<Packet>) {
        if let Some(current) = self.hosted.get(&location.name) {
            if current.location == location {
                return (true, None);
            }
            tracing::warn!(
                name = %location.name,
                existing = %current.location.endpoint,
                rejected = %location.endpoint,
                "this node already has a source by that name"
            );
            return (false, None);
        }
        if let Some(existing) = self.collides(&location) {
            tracing::warn!(
                name = %location.name,
                existing = %existing.endpoint,
                "registry already maps this name elsewhere"
            );
            return (false, None);
        }
        let confirmed = self.table.get(&location.name) == Some(&location);
        let packet = (self.online && !confirmed).then(|| Self::announce(&location));
        self.hosted.insert(
            location.name.clone(),
            Announced {
                location,
                confirmed,
            },
        );
        (true, packet)
    }

    /// Forgets an announcement. Returns the withdrawal to send, if any.
    pub(crate) fn remove_source(&mut self, name: &str) -> (bool, Option<Packet>) {
        let Some(announced) = self.hosted.remove(name) else {
            return (false, None);
        };
        let packet = self.online.then(|| Packet::RemoveSource {
            location: announced.location,
        });
        (true, packet)
    }

    /// The registry replica became valid: replays every announcement the
    /// host does not hold yet.
    pub(crate) fn on_valid(&mut self) -> Vec<Packet> {
        self.online = true;
        self.reconcile()
    }

    fn reconcile(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        let table = &self.table;
        self.hosted.retain(|name, announced| match table.get(name) {
            Some(existing) if existing.endpoint == announced.location.endpoint => {
                announced.confirmed = true;
                true
            }
            Some(existing) => {
                tracing::warn!(
                    name = %name,
                    existing = %existing.endpoint,
                    "not announcing; name taken in the registry"
                );
                false
            }
            None => {
                announced.confirmed = false;
                packets.push(Self::announce(&announced.location));
                true
            }
        });
        if !packets.is_empty() {
            tracing::debug!(count = packets.len(), "announcing sources to registry");
        }
        packets
    }

    /// Adopts a new copy of the table.
    pub(crate) fn on_table(&mut self, value: &Value) {
        self.table = parse_table(value);
        for announced in self.hosted.values_mut() {
            announced.confirmed = self.table.get(&announced.location.name) == Some(&announced.location);
        }
    }

    pub(crate) fn on_added(&mut self, args: &[Value]) {
        let Some(location) = location_args(args) else {
            return;
        };
        if let Some(announced) = self.hosted.get_mut(&location.name) {
            if announced.location == location {
                announced.confirmed = true;
            } else {
                tracing::warn!(
                    name = %location.name,
                    winner = %location.endpoint,
                    "registry kept another endpoint for our source; dropping it"
                );
                self.hosted.remove(&location.name);
            }
        }
        self.table.insert(location.name.clone(), location);
    }

    pub(crate) fn on_removed(&mut self, args: &[Value]) {
        let Some(location) = location_args(args) else {
            return;
        };
        self.table.remove(&location.name);
        if let Some(announced) = self.hosted.get_mut(&location.name)
            && announced.location == location
        {
            announced.confirmed = false;
        }
    }

    /// The link to the registry dropped.
    pub(crate) fn on_link_lost(&mut self) {
        self.online = false;
        for announced in self.hosted.values_mut() {
            announced.confirmed = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry (handle)
// ---------------------------------------------------------------------------

/// A change to the registry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(SourceLocation),
    Removed(SourceLocation),
}

pub(crate) struct RegistryShared {
    table: ArcSwap<BTreeMap<String, SourceLocation>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl RegistryShared {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            table: ArcSwap::from_pointee(BTreeMap::new()),
            events,
        }
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<Endpoint> {
        self.table.load().get(name).map(|loc| loc.endpoint.clone())
    }

    /// Publishes a new table and an event for every entry that changed.
    pub(crate) fn publish(&self, new: &BTreeMap<String, SourceLocation>) {
        let old = self.table.swap(Arc::new(new.clone()));
        for (name, loc) in old.iter() {
            if new.get(name) != Some(loc) {
                let _ = self.events.send(RegistryEvent::Removed(loc.clone()));
            }
        }
        for (name, loc) in new {
            if old.get(name) != Some(loc) {
                let _ = self.events.send(RegistryEvent::Added(loc.clone()));
            }
        }
    }
}

/// Handle to a node's view of the registry.
///
/// Obtained from [`Node::registry`](crate::Node::registry) on nodes that
/// host the registry or were built with a registry URL.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<RegistryShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Registry {
    pub(crate) fn new(shared: Arc<RegistryShared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { shared, commands }
    }

    /// Current table, as last seen by this node.
    pub fn source_locations(&self) -> Arc<BTreeMap<String, SourceLocation>> {
        self.shared.table.load_full()
    }

    /// Endpoint that hosts `name`, if the table has it.
    pub fn resolve(&self, name: &str) -> Option<Endpoint> {
        self.shared.resolve(name)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.events.subscribe()
    }

    /// Announces `name` at `endpoint`.
    ///
    /// Returns `false` when the name is known to belong to another
    /// endpoint. A `true` result means the announcement is queued; the
    /// table reflects it once the host accepts it.
    pub async fn add_source(&self, name: impl Into<String>, endpoint: Endpoint) -> Result<bool, RepliqError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RegistryAdd {
                location: SourceLocation::new(name, endpoint),
                reply: tx,
            })
            .map_err(|_| RepliqError::Shutdown)?;
        rx.await.map_err(|_| RepliqError::Shutdown)
    }

    /// Withdraws an announcement made by this node.
    pub async fn remove_source(&self, name: impl Into<String>) -> Result<bool, RepliqError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RegistryRemove {
                name: name.into(),
                reply: tx,
            })
            .map_err(|_| RepliqError::Shutdown)?;
        rx.await.map_err(|_| RepliqError::Shutdown)
    }

    /// Waits until `name` appears in the table.
    pub async fn wait_for(&self, name: &str) -> Option<SourceLocation> {
        let mut events = self.subscribe();
        loop {
            if let Some(loc) = self.shared.table.load().get(name) {
                return Some(loc.clone());
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.shared.table.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(name: &str, port: u16) -> SourceLocation {
        SourceLocation::new(name, Endpoint::parse(&format!("tcp://127.0.0.1:{port}")).unwrap())
    }

    fn args(location: &SourceLocation) -> Vec<Value> {
        vec![location.name.as_str().into(), location.endpoint.to_string().into()]
    }

    #[test]
    fn test_signal_indices() {
        let api = registry_capabilities();
        assert_eq!(api.property_index("sourceLocations"), Some(LOCATIONS_PROPERTY));
        assert_eq!(api.signal_index("remoteObjectAdded"), Some(ADDED_SIGNAL));
        assert_eq!(api.signal_index("remoteObjectRemoved"), Some(REMOVED_SIGNAL));
    }

    #[test]
    fn test_object_add_rejects_collision() {
        let mut reg = RegistryObject::new();
        let mut em = Emitter::new();
        assert!(reg.add(loc("alpha", 1), Some(ConnectionId::new(1)), &mut em));
        assert!(!reg.add(loc("alpha", 2), Some(ConnectionId::new(2)), &mut em));
        assert_eq!(reg.locations()["alpha"], loc("alpha", 1));
    }

    #[test]
    fn test_object_identical_add_is_noop() {
        let mut reg = RegistryObject::new();
        let mut em = Emitter::new();
        reg.add(loc("alpha", 1), None, &mut em);
        let mut again = Emitter::new();
        assert!(reg.add(loc("alpha", 1), None, &mut again));
        assert!(again.is_empty());
    }

    #[test]
    fn test_object_remove_owned_by_connection() {
        let mut reg = RegistryObject::new();
        let mut em = Emitter::new();
        reg.add(loc("alpha", 1), Some(ConnectionId::new(1)), &mut em);
        reg.add(loc("beta", 1), Some(ConnectionId::new(1)), &mut em);
        reg.add(loc("gamma", 2), Some(ConnectionId::new(2)), &mut em);

        assert_eq!(reg.remove_owned_by(ConnectionId::new(1), &mut em), 2);
        assert_eq!(reg.locations().keys().collect::<Vec<_>>(), ["gamma"]);
    }

    #[test]
    fn test_object_remove_ignores_other_endpoint() {
        let mut reg = RegistryObject::new();
        let mut em = Emitter::new();
        reg.add(loc("alpha", 1), None, &mut em);
        assert!(!reg.remove(&loc("alpha", 2), &mut em));
        assert!(reg.remove(&loc("alpha", 1), &mut em));
        assert!(reg.locations().is_empty());
    }

    #[test]
    fn test_table_value_round_trips() {
        let mut reg = RegistryObject::new();
        reg.add(loc("alpha", 1), None, &mut Emitter::new());
        let parsed = parse_table(&reg.property(LOCATIONS_PROPERTY));
        assert_eq!(&parsed, reg.locations());
    }

    #[test]
    fn test_client_resends_every_source_on_valid() {
        let mut client = RegistryClient::new();
        for i in 0..4 {
            let (ok, packet) = client.add_source(loc(&format!("s{i}"), 1));
            assert!(ok);
            assert!(packet.is_none(), "offline adds are queued");
        }
        assert_eq!(client.on_valid().len(), 4);

        // After a registry restart the new host's table is empty.
        client.on_link_lost();
        client.on_table(&Value::Map(Default::default()));
        assert_eq!(client.on_valid().len(), 4);
    }

    #[test]
    fn test_client_skips_confirmed_sources() {
        let mut client = RegistryClient::new();
        client.add_source(loc("alpha", 1));
        client.add_source(loc("beta", 1));
        let mut table = BTreeMap::new();
        table.insert("alpha".to_string(), loc("alpha", 1));
        client.on_table(&table_value(&table));

        let packets = client.on_valid();
        assert_eq!(packets, vec![Packet::AddSource { location: loc("beta", 1) }]);
    }

    #[test]
    fn test_client_refuses_known_collision() {
        let mut client = RegistryClient::new();
        client.on_valid();
        client.on_added(&args(&loc("alpha", 1)));
        let (ok, packet) = client.add_source(loc("alpha", 2));
        assert!(!ok);
        assert!(packet.is_none());
    }

    #[test]
    fn test_client_drops_source_that_lost_the_name() {
        let mut client = RegistryClient::new();
        client.add_source(loc("alpha", 2));
        let mut table = BTreeMap::new();
        table.insert("alpha".to_string(), loc("alpha", 1));
        client.on_table(&table_value(&table));

        assert!(client.on_valid().is_empty());
        assert!(!client.hosted.contains_key("alpha"));

        // The winner leaving does not revive the loser.
        client.on_removed(&args(&loc("alpha", 1)));
        client.on_link_lost();
        assert!(client.on_valid().is_empty());
    }

    #[test]
    fn test_client_drops_source_when_another_endpoint_is_added() {
        let mut client = RegistryClient::new();
        client.on_valid();
        let (_, packet) = client.add_source(loc("alpha", 2));
        assert!(packet.is_some());
        client.on_added(&args(&loc("alpha", 1)));
        assert!(!client.hosted.contains_key("alpha"));
        assert_eq!(client.table()["alpha"], loc("alpha", 1));
    }

    #[test]
    fn test_client_refuses_second_endpoint_for_own_name() {
        let mut client = RegistryClient::new();
        client.on_valid();
        assert!(client.add_source(loc("alpha", 1)).0);
        assert_eq!(client.add_source(loc("alpha", 2)), (false, None));
        assert_eq!(client.hosted["alpha"].location, loc("alpha", 1));
        assert_eq!(client.add_source(loc("alpha", 1)), (true, None));
    }

    #[test]
    fn test_client_remove_source_withdraws() {
        let mut client = RegistryClient::new();
        client.on_valid();
        client.add_source(loc("alpha", 1));
        let (removed, packet) = client.remove_source("alpha");
        assert!(removed);
        assert_eq!(packet, Some(Packet::RemoveSource { location: loc("alpha", 1) }));
        assert_eq!(client.remove_source("alpha"), (false, None));
    }

    #[tokio::test]
    async fn test_shared_publish_emits_diff() {
        let shared = RegistryShared::new(16);
        let mut rx = shared.events.subscribe();
        let mut table = BTreeMap::new();
        table.insert("alpha".to_string(), loc("alpha", 1));
        shared.publish(&table);
        table.remove("alpha");
        shared.publish(&table);

        assert_eq!(rx.recv().await.unwrap(), RegistryEvent::Added(loc("alpha", 1)));
        assert_eq!(rx.recv().await.unwrap(), RegistryEvent::Removed(loc("alpha", 1)));
        assert_eq!(shared.resolve("alpha"), None);
    }
}
