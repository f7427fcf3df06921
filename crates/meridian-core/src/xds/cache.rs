// This module is the resource cache for a single ADS stream. It's the guts of
// an ADS connection: it tracks every subscribed resource, the watchers
// interested in it, the last accepted value, and the ACK/NACK state of each
// resource. If you need to add or modify xDS behavior, it's likely you'll end
// up here.
//
// The cache is single-writer and owned by an AdsTask. Readers only ever see
// the status index through a CacheReader, which is safe for concurrent reads
// and is what backs client status dumps.
//
// # Subscriptions are Watchers
//
// There is no reference tracking between resources here. Every resource in
// the cache exists because something is watching it, and the entry is dropped
// as soon as the last watcher goes away. Following references from listeners
// to routes to clusters is up to the watchers, which turns this into a flat
// map of (type, name) to state.
//
// # Knowing When a Resource Doesn't Exist
//
// SotW never explicitly says a resource doesn't exist. A resource that's
// requested and not received within the resource timeout is declared missing.
// Listener and Cluster responses are full state, so a resource that was
// received and is then missing from a response has been deleted.
//
// https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol#knowing-when-a-requested-resource-does-not-exist

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use crossbeam_skiplist::SkipMap;
use enum_map::EnumMap;
use xds_api::pb::google::protobuf;

use super::{
    resources::{DecodedResource, ResourceValue},
    timer::Timers,
    watch::{ResourceEvent, WatchEvent, WatchSender, WatcherId},
    ResourceType, ResourceVersion,
};

/// The state of a cached resource, as reported through client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Subscribed, but nothing has been received yet.
    Requested,

    /// The latest version of the resource was accepted.
    Acked,

    /// The latest version of the resource was rejected and there is no
    /// previously accepted version.
    Nacked,

    /// The latest version was rejected, but a previous version is cached and
    /// still in use.
    NackedButCached,

    DoesNotExist,

    /// The server stopped sending the resource, but it's being kept because
    /// the server asked clients to ignore deletions.
    DoesNotExistButCached,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Requested => "requested",
            CacheStatus::Acked => "acked",
            CacheStatus::Nacked => "nacked",
            CacheStatus::NackedButCached => "nacked_but_cached",
            CacheStatus::DoesNotExist => "does_not_exist",
            CacheStatus::DoesNotExistButCached => "does_not_exist_but_cached",
        }
    }
}

/// A rejected version of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdsError {
    pub version: ResourceVersion,
    pub message: String,
    pub time: SystemTime,
}

/// A single xDS configuration object, with additional metadata about when it
/// was fetched and processed.
#[derive(Debug, Clone)]
pub struct XdsConfig {
    pub name: String,
    pub type_url: String,
    pub version: ResourceVersion,
    pub status: CacheStatus,
    pub xds: Option<protobuf::Any>,
    pub last_updated: Option<SystemTime>,
    pub last_error: Option<XdsError>,
}

/// A read-only handle to a [Cache]. `CacheReader`s are meant to passed around
/// and shared and are cheap to clone.
#[derive(Debug, Default, Clone)]
pub(crate) struct CacheReader {
    data: Arc<EnumMap<ResourceType, SkipMap<String, XdsConfig>>>,
}

impl CacheReader {
    pub(crate) fn iter_xds(&self) -> impl Iterator<Item = XdsConfig> + '_ {
        self.data
            .values()
            .flat_map(|configs| configs.iter().map(|e| e.value().clone()))
    }

    #[cfg(test)]
    pub(crate) fn get(&self, resource_type: ResourceType, name: &str) -> Option<XdsConfig> {
        self.data[resource_type]
            .get(name)
            .map(|e| e.value().clone())
    }
}

/// The cache readers for every ADS stream a client has open, keyed by server.
#[derive(Debug, Default, Clone)]
pub(crate) struct CacheReaders(Arc<SkipMap<String, CacheReader>>);

impl CacheReaders {
    pub(crate) fn insert(&self, server_uri: String, reader: CacheReader) {
        self.0.insert(server_uri, reader);
    }

    pub(crate) fn iter_xds(&self) -> impl Iterator<Item = XdsConfig> + '_ {
        self.0.iter().flat_map(|e| e.value().iter_xds().collect::<Vec<_>>())
    }
}

#[derive(Debug)]
struct CacheEntry {
    watchers: BTreeMap<WatcherId, WatchSender>,
    status: CacheStatus,
    version: ResourceVersion,
    value: Option<ResourceValue>,
    raw: Option<protobuf::Any>,
    last_updated: Option<SystemTime>,
    last_error: Option<XdsError>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            watchers: BTreeMap::new(),
            status: CacheStatus::Requested,
            version: ResourceVersion::default(),
            value: None,
            raw: None,
            last_updated: None,
            last_error: None,
        }
    }

    fn notify(&self, resource_type: ResourceType, name: &str, event: ResourceEvent<ResourceValue>) {
        for tx in self.watchers.values() {
            // a closed channel means an unwatch is already on its way.
            let _ = tx.send(WatchEvent {
                resource_type,
                name: name.to_string(),
                event: event.clone(),
            });
        }
    }

    /// The event a watcher should see when it starts watching this entry.
    fn current_event(&self) -> Option<ResourceEvent<ResourceValue>> {
        match (&self.value, self.status) {
            (Some(value), _) => Some(ResourceEvent::Changed(value.clone())),
            (None, CacheStatus::DoesNotExist) => Some(ResourceEvent::DoesNotExist),
            (None, CacheStatus::Nacked) => self
                .last_error
                .as_ref()
                .map(|e| ResourceEvent::Error(e.message.clone())),
            _ => None,
        }
    }

    fn to_config(&self, resource_type: ResourceType, name: &str) -> XdsConfig {
        XdsConfig {
            name: name.to_string(),
            type_url: resource_type.type_url().to_string(),
            version: self.version.clone(),
            status: self.status,
            xds: self.raw.clone(),
            last_updated: self.last_updated,
            last_error: self.last_error.clone(),
        }
    }
}

/// The result of handling a discovery response.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ResponseErrors(Vec<String>);

impl ResponseErrors {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The NACK message for these errors.
    pub(crate) fn nack_message(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(format!(
            "xDS response validation errors: [{}]",
            self.0.join("; ")
        ))
    }
}

/// The xDS state for a single ADS stream.
///
/// A [Cache] is modified by a single writer, with any number of
/// [CacheReader]s providing read-only access to resource status.
#[derive(Debug)]
pub(crate) struct Cache {
    entries: EnumMap<ResourceType, BTreeMap<String, CacheEntry>>,
    acked_versions: EnumMap<ResourceType, ResourceVersion>,
    // types whose subscribed names changed since the last request.
    dirty: EnumMap<ResourceType, bool>,
    timers: Timers<(ResourceType, String)>,
    resource_timeout: Duration,
    ignore_resource_deletion: bool,
    reader: CacheReader,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), false)
    }
}

// public API
impl Cache {
    pub(crate) fn new(resource_timeout: Duration, ignore_resource_deletion: bool) -> Self {
        Self {
            entries: Default::default(),
            acked_versions: Default::default(),
            dirty: Default::default(),
            timers: Timers::default(),
            resource_timeout,
            ignore_resource_deletion,
            reader: CacheReader::default(),
        }
    }

    pub(crate) fn reader(&self) -> CacheReader {
        self.reader.clone()
    }

    /// All subscribed names for a resource type, in sorted order.
    pub(crate) fn subscriptions(&self, resource_type: ResourceType) -> Vec<String> {
        self.entries[resource_type].keys().cloned().collect()
    }

    pub(crate) fn has_subscriptions(&self, resource_type: ResourceType) -> bool {
        !self.entries[resource_type].is_empty()
    }

    /// The last version of a resource type that was ACKed.
    pub(crate) fn acked_version(&self, resource_type: ResourceType) -> &ResourceVersion {
        &self.acked_versions[resource_type]
    }

    /// Returns and clears the set of types with changed subscriptions.
    pub(crate) fn take_dirty(&mut self) -> EnumMap<ResourceType, bool> {
        std::mem::take(&mut self.dirty)
    }

    /// Add a watcher for a resource, subscribing to it if this is the first
    /// watcher.
    ///
    /// If the resource is already cached, the watcher is immediately sent its
    /// current state.
    pub(crate) fn watch(
        &mut self,
        resource_type: ResourceType,
        name: &str,
        id: WatcherId,
        tx: WatchSender,
    ) {
        if !self.entries[resource_type].contains_key(name) {
            tracing::trace!(?resource_type, name, "subscribe");
            self.dirty[resource_type] = true;
        }
        let entry = self.entries[resource_type]
            .entry(name.to_string())
            .or_insert_with(CacheEntry::new);

        if let Some(event) = entry.current_event() {
            let _ = tx.send(WatchEvent {
                resource_type,
                name: name.to_string(),
                event,
            });
        }
        entry.watchers.insert(id, tx);
        self.publish(resource_type, name);
    }

    /// Remove a watcher, unsubscribing from the resource if this was the last
    /// watcher.
    pub(crate) fn unwatch(&mut self, resource_type: ResourceType, name: &str, id: WatcherId) {
        let Some(entry) = self.entries[resource_type].get_mut(name) else {
            return;
        };

        entry.watchers.remove(&id);
        if entry.watchers.is_empty() {
            tracing::trace!(?resource_type, name, "unsubscribe");
            self.entries[resource_type].remove(name);
            self.timers.cancel(&(resource_type, name.to_string()));
            self.reader.data[resource_type].remove(name);
            self.dirty[resource_type] = true;
        }
    }

    /// Start resource timers for every resource of this type that hasn't been
    /// received yet. Called when a request for the type is sent.
    pub(crate) fn start_timers(&mut self, resource_type: ResourceType, now: Instant) {
        let deadline = now + self.resource_timeout;

        for (name, entry) in &self.entries[resource_type] {
            let waiting = entry.value.is_none()
                && !matches!(entry.status, CacheStatus::DoesNotExist | CacheStatus::Nacked);
            let key = (resource_type, name.clone());

            if waiting && !self.timers.is_running(&key) {
                self.timers.start(key, deadline);
            }
        }
    }

    /// Stop every resource timer. Called when a stream disconnects, so that
    /// resources aren't declared missing while the server is unreachable.
    pub(crate) fn stop_timers(&mut self) {
        self.timers.clear();
    }

    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire any expired resource timers, marking their resources as missing.
    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        for (resource_type, name) in self.timers.expired(now) {
            let Some(entry) = self.entries[resource_type].get_mut(&name) else {
                continue;
            };
            if entry.value.is_some() {
                continue;
            }

            tracing::debug!(?resource_type, resource = name, "resource does not exist");
            entry.status = CacheStatus::DoesNotExist;
            entry.notify(resource_type, &name, ResourceEvent::DoesNotExist);
            self.publish(resource_type, &name);
        }
    }

    /// Report a connectivity error to every watcher of a resource that has no
    /// value yet.
    pub(crate) fn report_connection_error(&mut self, message: &str) {
        for (resource_type, entries) in &self.entries {
            for (name, entry) in entries {
                if entry.value.is_none() && entry.status != CacheStatus::DoesNotExist {
                    entry.notify(resource_type, name, ResourceEvent::Error(message.to_string()));
                }
            }
        }
    }

    /// Handle the resources in a discovery response.
    ///
    /// If any resource is invalid, no resource in the response is applied and
    /// every error is returned. Timers for every named resource are cancelled
    /// either way.
    pub(crate) fn handle_response(
        &mut self,
        resource_type: ResourceType,
        version: ResourceVersion,
        resources: Vec<Result<DecodedResource, String>>,
    ) -> ResponseErrors {
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(resources.len());
        let mut seen = BTreeSet::new();

        for (i, resource) in resources.into_iter().enumerate() {
            let resource = match resource {
                Ok(resource) => resource,
                Err(e) => {
                    errors.push(format!("resource index {i}: {e}"));
                    continue;
                }
            };

            self.timers.cancel(&(resource_type, resource.name.clone()));

            if !seen.insert(resource.name.clone()) {
                errors.push(format!(
                    "resource index {i}: {}: duplicate resource name",
                    resource.name
                ));
                continue;
            }

            match resource.value {
                Ok(value) => valid.push((resource.name, resource.raw, value)),
                Err(e) => {
                    errors.push(format!("resource index {i}: {}: {e}", resource.name));
                    self.set_error(resource_type, &resource.name, &version, e);
                }
            }
        }

        if !errors.is_empty() {
            return ResponseErrors(errors);
        }

        let now = SystemTime::now();
        for (name, raw, value) in valid {
            let Some(entry) = self.entries[resource_type].get_mut(&name) else {
                tracing::trace!(?resource_type, resource = name, "ignoring unsubscribed resource");
                continue;
            };

            entry.version = version.clone();
            entry.last_updated = Some(now);
            entry.last_error = None;

            let unchanged = entry.raw.as_ref().is_some_and(|r| r.value == raw.value);
            entry.status = CacheStatus::Acked;
            if !unchanged {
                entry.raw = Some(raw);
                entry.value = Some(value.clone());
                entry.notify(resource_type, &name, ResourceEvent::Changed(value));
            }
            self.publish(resource_type, &name);
        }

        if resource_type.is_full_state() {
            self.handle_deletions(resource_type, &seen);
        }

        self.acked_versions[resource_type] = version;
        ResponseErrors::default()
    }

    fn handle_deletions(&mut self, resource_type: ResourceType, present: &BTreeSet<String>) {
        let mut deleted = Vec::new();

        for (name, entry) in &mut self.entries[resource_type] {
            if present.contains(name) || entry.value.is_none() {
                continue;
            }

            if self.ignore_resource_deletion {
                if entry.status != CacheStatus::DoesNotExistButCached {
                    tracing::warn!(
                        ?resource_type,
                        resource = name,
                        "ignoring deletion of resource"
                    );
                    entry.status = CacheStatus::DoesNotExistButCached;
                    deleted.push(name.clone());
                }
                continue;
            }

            tracing::debug!(?resource_type, resource = name, "resource deleted");
            entry.status = CacheStatus::DoesNotExist;
            entry.value = None;
            entry.raw = None;
            entry.notify(resource_type, name, ResourceEvent::DoesNotExist);
            deleted.push(name.clone());
        }

        for name in deleted {
            self.publish(resource_type, &name);
        }
    }

    fn set_error(
        &mut self,
        resource_type: ResourceType,
        name: &str,
        version: &ResourceVersion,
        message: String,
    ) {
        let Some(entry) = self.entries[resource_type].get_mut(name) else {
            return;
        };

        entry.status = match entry.value {
            Some(_) => CacheStatus::NackedButCached,
            None => CacheStatus::Nacked,
        };
        entry.last_error = Some(XdsError {
            version: version.clone(),
            message: message.clone(),
            time: SystemTime::now(),
        });
        entry.notify(resource_type, name, ResourceEvent::Error(message));
        self.publish(resource_type, name);
    }

    fn publish(&self, resource_type: ResourceType, name: &str) {
        if let Some(entry) = self.entries[resource_type].get(name) {
            self.reader.data[resource_type]
                .insert(name.to_string(), entry.to_config(resource_type, name));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xds::test as xds_test;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn decode(resource_type: ResourceType, resources: Vec<protobuf::Any>) -> Vec<Result<DecodedResource, String>> {
        resources
            .into_iter()
            .map(|any| resource_type.decode(any))
            .collect()
    }

    fn any<M: prost::Name>(m: &M) -> protobuf::Any {
        protobuf::Any::from_msg(m).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> Vec<ResourceEvent<ResourceValue>> {
        let mut events = vec![];
        while let Ok(e) = rx.try_recv() {
            events.push(e.event);
        }
        events
    }

    fn watch(
        cache: &mut Cache,
        resource_type: ResourceType,
        name: &str,
    ) -> (WatcherId, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = WatcherId::next();
        cache.watch(resource_type, name, id, tx);
        (id, rx)
    }

    #[test]
    fn assert_reader_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CacheReader>();
    }

    #[test]
    fn test_watch_subscribes() {
        let mut cache = Cache::default();

        let (id_a, _rx_a) = watch(&mut cache, ResourceType::Cluster, "cluster-a");
        let (_id_b, _rx_b) = watch(&mut cache, ResourceType::Cluster, "cluster-a");
        assert!(cache.take_dirty()[ResourceType::Cluster]);
        assert_eq!(cache.subscriptions(ResourceType::Cluster), vec!["cluster-a"]);

        // removing one of two watchers doesn't unsubscribe
        cache.unwatch(ResourceType::Cluster, "cluster-a", id_a);
        assert!(!cache.take_dirty()[ResourceType::Cluster]);
        assert_eq!(
            cache.reader().get(ResourceType::Cluster, "cluster-a").map(|c| c.status),
            Some(CacheStatus::Requested)
        );
    }

    #[test]
    fn test_unwatch_last_watcher() {
        let mut cache = Cache::default();

        let (id, _rx) = watch(&mut cache, ResourceType::Cluster, "cluster-a");
        cache.take_dirty();

        cache.unwatch(ResourceType::Cluster, "cluster-a", id);
        assert!(cache.take_dirty()[ResourceType::Cluster]);
        assert!(!cache.has_subscriptions(ResourceType::Cluster));
        assert!(cache.reader().get(ResourceType::Cluster, "cluster-a").is_none());
    }

    #[test]
    fn test_update_notifies_once() {
        let mut cache = Cache::default();
        let (_, mut rx) = watch(&mut cache, ResourceType::Cluster, "cluster-a");

        let cluster = any(&xds_test::cluster!("cluster-a"));
        let errors = cache.handle_response(
            ResourceType::Cluster,
            "1".into(),
            decode(ResourceType::Cluster, vec![cluster.clone()]),
        );
        assert!(errors.is_empty());
        assert!(matches!(&drain(&mut rx)[..], [ResourceEvent::Changed(_)]));

        // the same bytes again don't notify, but do bump the version
        let errors = cache.handle_response(
            ResourceType::Cluster,
            "2".into(),
            decode(ResourceType::Cluster, vec![cluster]),
        );
        assert!(errors.is_empty());
        assert_eq!(drain(&mut rx), vec![]);

        let config = cache.reader().get(ResourceType::Cluster, "cluster-a").unwrap();
        assert_eq!(config.status, CacheStatus::Acked);
        assert_eq!(&*config.version, "2");
        assert_eq!(&**cache.acked_version(ResourceType::Cluster), "2");
    }

    #[test]
    fn test_new_watcher_gets_cached_value() {
        let mut cache = Cache::default();
        let (_, _rx) = watch(&mut cache, ResourceType::ClusterLoadAssignment, "cluster-a");

        cache.handle_response(
            ResourceType::ClusterLoadAssignment,
            "1".into(),
            decode(
                ResourceType::ClusterLoadAssignment,
                vec![any(&xds_test::cla!("cluster-a" => { "us-east-1" => ["10.0.0.1"] }))],
            ),
        );

        let (_, mut rx) = watch(&mut cache, ResourceType::ClusterLoadAssignment, "cluster-a");
        assert!(matches!(&drain(&mut rx)[..], [ResourceEvent::Changed(ResourceValue::Endpoints(_))]));
    }

    #[test]
    fn test_nack_applies_nothing() {
        let mut cache = Cache::default();
        let (_, mut rx_a) = watch(&mut cache, ResourceType::Listener, "listener-a");
        let (_, mut rx_b) = watch(&mut cache, ResourceType::Listener, "listener-b");
        let (_, mut rx_c) = watch(&mut cache, ResourceType::Listener, "listener-c");

        let invalid = xds_api::pb::envoy::config::listener::v3::Listener {
            name: "listener-b".to_string(),
            ..Default::default()
        };
        let also_invalid = xds_api::pb::envoy::config::listener::v3::Listener {
            name: "listener-c".to_string(),
            ..Default::default()
        };
        let errors = cache.handle_response(
            ResourceType::Listener,
            "1".into(),
            decode(
                ResourceType::Listener,
                vec![
                    any(&xds_test::listener!("listener-a", "route-a")),
                    any(&invalid),
                    any(&also_invalid),
                ],
            ),
        );

        assert_eq!(
            errors.nack_message().unwrap(),
            "xDS response validation errors: [\
             resource index 1: listener-b: listener has no api_listener; \
             resource index 2: listener-c: listener has no api_listener]"
        );

        // nothing was applied, and the valid listener's watcher saw nothing
        assert_eq!(drain(&mut rx_a), vec![]);
        assert_eq!(
            cache.reader().get(ResourceType::Listener, "listener-a").unwrap().status,
            CacheStatus::Requested
        );
        assert_eq!(&**cache.acked_version(ResourceType::Listener), "");

        // invalid listeners report errors
        assert_eq!(
            drain(&mut rx_b),
            vec![ResourceEvent::Error("listener has no api_listener".to_string())]
        );
        assert_eq!(drain(&mut rx_c).len(), 1);
        let config = cache.reader().get(ResourceType::Listener, "listener-b").unwrap();
        assert_eq!(config.status, CacheStatus::Nacked);
        assert_eq!(config.last_error.map(|e| e.version), Some("1".into()));
    }

    #[test]
    fn test_nack_keeps_cached_value() {
        let mut cache = Cache::default();
        let (_, mut rx) = watch(&mut cache, ResourceType::Listener, "listener-a");

        cache.handle_response(
            ResourceType::Listener,
            "1".into(),
            decode(
                ResourceType::Listener,
                vec![any(&xds_test::listener!("listener-a", "route-a"))],
            ),
        );
        drain(&mut rx);

        let invalid = xds_api::pb::envoy::config::listener::v3::Listener {
            name: "listener-a".to_string(),
            ..Default::default()
        };
        let errors = cache.handle_response(
            ResourceType::Listener,
            "2".into(),
            decode(ResourceType::Listener, vec![any(&invalid)]),
        );
        assert!(!errors.is_empty());
        assert_eq!(&**cache.acked_version(ResourceType::Listener), "1");

        let config = cache.reader().get(ResourceType::Listener, "listener-a").unwrap();
        assert_eq!(config.status, CacheStatus::NackedButCached);
        assert_eq!(&*config.version, "1");
        assert!(config.xds.is_some());
    }

    #[test]
    fn test_undecodable_resource() {
        let mut cache = Cache::default();
        let errors = cache.handle_response(
            ResourceType::Cluster,
            "1".into(),
            vec![Err("failed to decode resource: bad".to_string())],
        );
        assert_eq!(
            errors.nack_message().unwrap(),
            "xDS response validation errors: [resource index 0: failed to decode resource: bad]"
        );
    }

    #[test]
    fn test_resource_timeout() {
        let now = Instant::now();
        let mut cache = Cache::new(Duration::from_secs(15), false);
        let (_, mut rx) = watch(&mut cache, ResourceType::Cluster, "cluster-a");
        cache.start_timers(ResourceType::Cluster, now);

        assert_eq!(cache.next_deadline(), Some(now + Duration::from_secs(15)));

        cache.handle_timeout(now + Duration::from_secs(14));
        assert_eq!(drain(&mut rx), vec![]);

        cache.handle_timeout(now + Duration::from_secs(15));
        assert_eq!(drain(&mut rx), vec![ResourceEvent::DoesNotExist]);
        assert_eq!(
            cache.reader().get(ResourceType::Cluster, "cluster-a").unwrap().status,
            CacheStatus::DoesNotExist
        );

        // a new watcher sees that the resource doesn't exist
        let (_, mut rx) = watch(&mut cache, ResourceType::Cluster, "cluster-a");
        assert_eq!(drain(&mut rx), vec![ResourceEvent::DoesNotExist]);
    }

    #[test]
    fn test_response_cancels_timer() {
        let now = Instant::now();
        let mut cache = Cache::default();
        let (_, mut rx) = watch(&mut cache, ResourceType::Listener, "listener-a");
        cache.start_timers(ResourceType::Listener, now);

        // an invalid response still cancels the timer
        let invalid = xds_api::pb::envoy::config::listener::v3::Listener {
            name: "listener-a".to_string(),
            ..Default::default()
        };
        cache.handle_response(
            ResourceType::Listener,
            "1".into(),
            decode(ResourceType::Listener, vec![any(&invalid)]),
        );
        assert_eq!(cache.next_deadline(), None);

        cache.handle_timeout(now + Duration::from_secs(60));
        assert!(matches!(&drain(&mut rx)[..], [ResourceEvent::Error(_)]));
    }

    #[test]
    fn test_full_state_deletion() {
        let mut cache = Cache::default();
        let (_, mut rx_a) = watch(&mut cache, ResourceType::Cluster, "cluster-a");
        let (_, mut rx_b) = watch(&mut cache, ResourceType::Cluster, "cluster-b");

        cache.handle_response(
            ResourceType::Cluster,
            "1".into(),
            decode(ResourceType::Cluster, vec![any(&xds_test::cluster!("cluster-a"))]),
        );
        assert_eq!(drain(&mut rx_a).len(), 1);

        cache.handle_response(
            ResourceType::Cluster,
            "2".into(),
            decode(ResourceType::Cluster, vec![any(&xds_test::cluster!("cluster-b"))]),
        );
        assert_eq!(drain(&mut rx_a), vec![ResourceEvent::DoesNotExist]);
        assert_eq!(drain(&mut rx_b).len(), 1);

        let config = cache.reader().get(ResourceType::Cluster, "cluster-a").unwrap();
        assert_eq!(config.status, CacheStatus::DoesNotExist);
        assert!(config.xds.is_none());
    }

    #[test]
    fn test_ignore_resource_deletion() {
        let mut cache = Cache::new(Duration::from_secs(15), true);
        let (_, mut rx) = watch(&mut cache, ResourceType::Cluster, "cluster-a");

        let cluster = any(&xds_test::cluster!("cluster-a"));
        cache.handle_response(
            ResourceType::Cluster,
            "1".into(),
            decode(ResourceType::Cluster, vec![cluster.clone()]),
        );
        drain(&mut rx);

        cache.handle_response(ResourceType::Cluster, "2".into(), vec![]);
        assert_eq!(drain(&mut rx), vec![]);
        assert_eq!(
            cache.reader().get(ResourceType::Cluster, "cluster-a").unwrap().status,
            CacheStatus::DoesNotExistButCached
        );

        // coming back doesn't re-notify, the value never went away
        cache.handle_response(
            ResourceType::Cluster,
            "3".into(),
            decode(ResourceType::Cluster, vec![cluster]),
        );
        assert_eq!(drain(&mut rx), vec![]);
        assert_eq!(
            cache.reader().get(ResourceType::Cluster, "cluster-a").unwrap().status,
            CacheStatus::Acked
        );
    }

    #[test]
    fn test_endpoints_are_not_full_state() {
        let mut cache = Cache::default();
        let (_, mut rx) = watch(&mut cache, ResourceType::ClusterLoadAssignment, "cluster-a");

        cache.handle_response(
            ResourceType::ClusterLoadAssignment,
            "1".into(),
            decode(
                ResourceType::ClusterLoadAssignment,
                vec![any(&xds_test::cla!("cluster-a" => { "us-east-1" => ["10.0.0.1"] }))],
            ),
        );
        drain(&mut rx);

        cache.handle_response(ResourceType::ClusterLoadAssignment, "2".into(), vec![]);
        assert_eq!(drain(&mut rx), vec![]);
    }

    #[test]
    fn test_connection_error_only_without_value() {
        let mut cache = Cache::default();
        let (_, mut rx_a) = watch(&mut cache, ResourceType::Cluster, "cluster-a");
        let (_, mut rx_b) = watch(&mut cache, ResourceType::Cluster, "cluster-b");

        cache.handle_response(
            ResourceType::Cluster,
            "1".into(),
            decode(ResourceType::Cluster, vec![any(&xds_test::cluster!("cluster-a"))]),
        );
        drain(&mut rx_a);

        cache.report_connection_error("connection refused");
        assert_eq!(drain(&mut rx_a), vec![]);
        assert_eq!(
            drain(&mut rx_b),
            vec![ResourceEvent::Error("connection refused".to_string())]
        );
    }
}
