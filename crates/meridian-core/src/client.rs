//! The shared xDS client.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex, Weak},
};

use tokio::{sync::mpsc, task::JoinHandle};
use xds_api::pb::envoy::config::core::v3 as xds_core;

use crate::{
    balancer::{ClusterBalancer, Connector},
    bootstrap::{Bootstrap, BootstrapError, XdsClientConfig, XdsServer},
    error::{Error, Result},
    lrs::{ClusterStats, LoadReportStore, LrsTask},
    resolver::{DnsResolver, NameResolver},
    xds::{
        self, csds::CsdsError, name::XdsName, AdsTask, CacheReaders, Resource, ResourceType,
        ResourceWatcher, SubscriptionUpdate, WatchHandle, WatchSender, WatcherId, XdsConfig,
    },
};

/// A client for a set of xDS servers described by a [Bootstrap].
///
/// An `XdsClient` owns one ADS stream per xDS server it talks to, started the
/// first time a resource served by that server is watched. Resources are
/// shared between every watcher: watching a resource that's already cached
/// doesn't touch the network and immediately delivers the cached value.
///
/// `XdsClient`s are meant to be shared. Use an [XdsClientRegistry] to share a
/// single client between everything that uses the same bootstrap. Dropping the
/// last reference to a client shuts down all of its streams.
pub struct XdsClient {
    bootstrap: Bootstrap,
    config: XdsClientConfig,
    node: xds_core::Node,
    caches: CacheReaders,
    ads: Mutex<BTreeMap<String, AdsHandle>>,
    lrs: Mutex<BTreeMap<String, LrsHandle>>,
}

struct AdsHandle {
    subs: mpsc::UnboundedSender<SubscriptionUpdate>,
    task: JoinHandle<()>,
}

struct LrsHandle {
    store: Arc<LoadReportStore>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for XdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsClient")
            .field("node", &self.node.id)
            .field("servers", &self.bootstrap.xds_servers)
            .finish_non_exhaustive()
    }
}

impl Drop for XdsClient {
    fn drop(&mut self) {
        let ads = self.ads.get_mut().unwrap_or_else(|e| e.into_inner());
        for handle in ads.values() {
            handle.task.abort();
        }

        let lrs = self.lrs.get_mut().unwrap_or_else(|e| e.into_inner());
        for handle in lrs.values() {
            handle.task.abort();
        }
    }
}

impl XdsClient {
    /// Create a new client.
    ///
    /// No streams are started until a resource is watched, but watching
    /// requires a running tokio runtime.
    pub fn new(bootstrap: Bootstrap, config: XdsClientConfig) -> std::result::Result<Self, BootstrapError> {
        bootstrap.validate()?;
        let node = bootstrap.node_proto();

        Ok(Self {
            bootstrap,
            config,
            node,
            caches: CacheReaders::default(),
            ads: Mutex::new(BTreeMap::new()),
            lrs: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    pub fn config(&self) -> &XdsClientConfig {
        &self.config
    }

    /// Watch a resource.
    ///
    /// `xdstp://` names are sent to the server for their authority, and fail
    /// immediately if the authority isn't configured. All other names use the
    /// default server.
    pub fn watch<T: Resource>(&self, name: &str) -> Result<ResourceWatcher<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.watch_raw(T::TYPE, name, tx)?;
        Ok(ResourceWatcher::new(handle, rx))
    }

    /// Register a watch that delivers untyped events on an existing channel.
    pub(crate) fn watch_raw(
        &self,
        resource_type: ResourceType,
        name: &str,
        tx: WatchSender,
    ) -> Result<WatchHandle> {
        let name = XdsName::parse(resource_type, name)?;
        let server = self.server_for(name.authority.as_deref())?;
        let subs = self.ads_subs(server)?;

        let id = WatcherId::next();
        subs.send(SubscriptionUpdate::Watch {
            id,
            resource_type,
            name: name.canonical.clone(),
            tx,
        })
        .map_err(|_| Error::Shutdown)?;

        Ok(WatchHandle {
            id,
            resource_type,
            name: name.canonical,
            subs,
        })
    }

    /// Start balancing requests across a cluster.
    ///
    /// `LOGICAL_DNS` clusters are resolved with the system resolver.
    pub fn cluster_balancer<C: Connector>(
        self: &Arc<Self>,
        cluster: &str,
        connector: C,
    ) -> Result<ClusterBalancer> {
        self.cluster_balancer_with(cluster, connector, Arc::new(DnsResolver))
    }

    /// Start balancing requests across a cluster, resolving `LOGICAL_DNS`
    /// clusters with a custom [NameResolver].
    pub fn cluster_balancer_with<C: Connector>(
        self: &Arc<Self>,
        cluster: &str,
        connector: C,
        resolver: Arc<dyn NameResolver>,
    ) -> Result<ClusterBalancer> {
        XdsName::parse(ResourceType::Cluster, cluster)?;
        ClusterBalancer::start(self.clone(), cluster, connector, resolver)
    }

    /// The name of the listener resource for a target, built from the
    /// bootstrap's listener name templates.
    pub fn listener_name(&self, authority: Option<&str>, target: &str) -> Result<String> {
        xds::name::listener_name(&self.bootstrap, authority, target)
    }

    /// Dump the state of every subscribed resource.
    pub fn dump(&self) -> Vec<XdsConfig> {
        self.caches.iter_xds().collect()
    }

    /// Start a CSDS server on localhost that serves the same data as
    /// [dump][Self::dump].
    pub fn csds_server(
        &self,
        port: u16,
    ) -> impl Future<Output = std::result::Result<(), CsdsError>> + Send + 'static {
        xds::csds::local_server(self.caches.clone(), port)
    }

    /// Get the shared load stats for a cluster, reporting them to the default
    /// xDS server over LRS.
    ///
    /// The LRS stream starts the first time stats are requested.
    pub fn cluster_stats(&self, cluster_name: &str, eds_service_name: &str) -> Result<Arc<ClusterStats>> {
        let server = self.server_for(None)?;
        let mut lrs = self.lrs.lock().unwrap_or_else(|e| e.into_inner());

        let running = lrs
            .get(&server.server_uri)
            .is_some_and(|h| !h.task.is_finished());
        if !running {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
            let store = Arc::new(LoadReportStore::default());
            let task = LrsTask::new(
                &server.server_uri,
                self.node.clone(),
                store.clone(),
                self.config.backoff.clone(),
            )
            .map_err(|e| Error::Connection(e.to_string()))?;

            tracing::debug!(server = %server.server_uri, "starting LRS stream");
            let task = runtime.spawn(task.run());
            lrs.insert(server.server_uri.clone(), LrsHandle { store, task });
        }

        let handle = lrs.get(&server.server_uri).ok_or(Error::Shutdown)?;
        let now = tokio::time::Instant::now().into_std();
        Ok(handle.store.cluster_stats(cluster_name, eds_service_name, now))
    }

    fn server_for(&self, authority: Option<&str>) -> Result<&XdsServer> {
        match authority {
            Some(authority) => self
                .bootstrap
                .server_for_authority(authority)
                .ok_or_else(|| Error::UnknownAuthority(authority.to_string())),
            None => self
                .bootstrap
                .default_server()
                .ok_or_else(|| Error::UnknownAuthority(String::new())),
        }
    }

    // get the subscription channel for a server, starting its ADS task if
    // it isn't already running.
    fn ads_subs(&self, server: &XdsServer) -> Result<mpsc::UnboundedSender<SubscriptionUpdate>> {
        let mut ads = self.ads.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(handle) = ads.get(&server.server_uri) {
            if !handle.subs.is_closed() {
                return Ok(handle.subs.clone());
            }
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (subs, task) = AdsTask::new(server, self.node.clone(), &self.config)
            .map_err(|e| Error::Connection(e.to_string()))?;

        tracing::debug!(server = %server.server_uri, "starting ADS stream");
        self.caches.insert(server.server_uri.clone(), task.reader());
        let task = runtime.spawn(task.run());
        ads.insert(
            server.server_uri.clone(),
            AdsHandle {
                subs: subs.clone(),
                task,
            },
        );

        Ok(subs)
    }
}

/// A registry of [XdsClient]s, shared by bootstrap.
///
/// Callers that ask for a client with an identical [Bootstrap] get the same
/// client. The registry only holds weak references, so a client shuts down
/// once everyone using it has dropped it.
#[derive(Debug, Default)]
pub struct XdsClientRegistry {
    config: XdsClientConfig,
    clients: Mutex<HashMap<String, Weak<XdsClient>>>,
}

impl XdsClientRegistry {
    /// Create a registry whose clients all use `config`.
    pub fn new(config: XdsClientConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Return the client for a bootstrap, creating it if no live client
    /// exists.
    pub fn get_or_create(&self, bootstrap: Bootstrap) -> std::result::Result<Arc<XdsClient>, BootstrapError> {
        let identity = bootstrap.identity();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(client) = clients.get(&identity).and_then(Weak::upgrade) {
            return Ok(client);
        }

        clients.retain(|_, client| client.strong_count() > 0);

        let client = Arc::new(XdsClient::new(bootstrap, self.config.clone())?);
        clients.insert(identity, Arc::downgrade(&client));
        Ok(client)
    }

    /// The number of live clients in the registry.
    pub fn len(&self) -> usize {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.values().filter(|c| c.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
