//! Load balancing for a single xDS cluster.
//!
//! A [ClusterBalancer] is a handle to a background task that watches a
//! cluster and everything it depends on, keeps an LB policy tree up to date,
//! and publishes pickers. Picks happen on the caller's thread against the
//! latest picker and never wait on the task.
//!
//! Connections are owned by a [Connector] supplied by the caller.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use meridian_api::{cluster::Cluster, endpoint::EndpointSet};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};

use crate::{
    lb::{
        ChannelController, ConnectivityState, LbState, LoadBalancer, Pick, PickRequest,
        PickResult, PickerHandle, Subchannel, SubchannelState,
    },
    lrs::ClusterStats,
    resolver::{ClusterResolver, DnsTarget, NameResolver, Resolution},
    xds::{now, ResourceType, WatchEvent, WatchHandle, WatchSender},
    Error, Result, XdsClient,
};

/// Creates subchannels for a [ClusterBalancer].
///
/// A connector hands back a new, idle subchannel for every address. The
/// subchannel reports every state change through its
/// [SubchannelStateSender].
pub trait Connector: Send + 'static {
    fn new_subchannel(
        &mut self,
        address: SocketAddr,
        state: SubchannelStateSender,
    ) -> Arc<dyn Subchannel>;
}

/// Reports a subchannel's state back to the balancer that created it.
#[derive(Debug, Clone)]
pub struct SubchannelStateSender {
    id: u64,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl SubchannelStateSender {
    /// Report a new state. Returns `false` if the balancer is gone and the
    /// subchannel can be shut down.
    pub fn send(&self, state: SubchannelState) -> bool {
        self.events
            .send(TaskEvent::Subchannel(self.id, state))
            .is_ok()
    }
}

#[derive(Debug)]
enum TaskEvent {
    Subchannel(u64, SubchannelState),
    Dns(DnsTarget, std::result::Result<Vec<SocketAddr>, String>),
}

/// A load balancer for a single cluster.
///
/// Dropping the balancer stops its task and drops every subchannel it
/// created.
#[derive(Debug)]
pub struct ClusterBalancer {
    name: String,
    picker: PickerHandle,
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Drop for ClusterBalancer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ClusterBalancer {
    pub(crate) fn start<C: Connector>(
        client: Arc<XdsClient>,
        name: &str,
        connector: C,
        dns: Arc<dyn NameResolver>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let (task, watches, events) = ClusterTask::new(client, name, connector, dns);
        let picker = task.lb.picker();
        let notify = task.channel.notify.clone();
        let task = runtime.spawn(task.run(watches, events));

        Ok(Self {
            name: name.to_string(),
            picker,
            notify,
            task,
        })
    }

    /// The name of the cluster being balanced.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.picker.connectivity_state()
    }

    /// Pick a subchannel with the current picker.
    pub fn pick(&self, request: &PickRequest) -> PickResult {
        self.picker.pick(request)
    }

    /// Pick a subchannel, waiting for a new picker every time a pick is
    /// queued. Failed and dropped picks return an error immediately.
    pub async fn wait_for_pick(&self, request: &PickRequest<'_>) -> std::result::Result<Pick, tonic::Status> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.picker.pick(request) {
                PickResult::Pick(pick) => return Ok(pick),
                PickResult::Fail(status) | PickResult::Drop(status) => return Err(status),
                PickResult::Queue => notified.await,
            }
        }
    }
}

/// The task side of an LB tree: everything a policy can ask for.
struct Channel<C> {
    connector: C,
    subchannels: HashMap<u64, Arc<dyn Subchannel>>,
    next_id: u64,
    events: mpsc::UnboundedSender<TaskEvent>,
    notify: Arc<Notify>,
    resolution_requested: bool,
}

impl<C: Connector> ChannelController for Channel<C> {
    fn new_subchannel(&mut self, address: SocketAddr) -> Arc<dyn Subchannel> {
        self.next_id += 1;
        let state = SubchannelStateSender {
            id: self.next_id,
            events: self.events.clone(),
        };

        let subchannel = self.connector.new_subchannel(address, state);
        self.subchannels.insert(self.next_id, subchannel.clone());
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        tracing::trace!(state = %update.connectivity_state, "new picker");
        self.notify.notify_waiters();
    }

    fn request_resolution(&mut self) {
        self.resolution_requested = true;
    }
}

impl<C> Channel<C> {
    // the LB tree holds a reference to every subchannel it still uses.
    fn prune_subchannels(&mut self) {
        self.subchannels
            .retain(|_, subchannel| Arc::strong_count(subchannel) > 1);
    }
}

struct ClusterTask<C> {
    client: Arc<XdsClient>,
    resolver: ClusterResolver,
    dns: Arc<dyn NameResolver>,
    lb: LoadBalancer,
    channel: Channel<C>,

    watch_tx: WatchSender,
    cluster_watches: BTreeMap<String, WatchHandle>,
    endpoint_watches: BTreeMap<String, WatchHandle>,
    dns_targets: BTreeSet<DnsTarget>,
    dns_in_flight: BTreeSet<DnsTarget>,

    serving: bool,
    drain: Option<(Instant, Error)>,
}

impl<C: Connector> ClusterTask<C> {
    fn new(
        client: Arc<XdsClient>,
        name: &str,
        connector: C,
        dns: Arc<dyn NameResolver>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<WatchEvent>,
        mpsc::UnboundedReceiver<TaskEvent>,
    ) {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let lb = LoadBalancer::new(client.config());

        let task = Self {
            client,
            resolver: ClusterResolver::new(name),
            dns,
            lb,
            channel: Channel {
                connector,
                subchannels: HashMap::new(),
                next_id: 0,
                events: events_tx,
                notify: Arc::new(Notify::new()),
                resolution_requested: false,
            },
            watch_tx,
            cluster_watches: BTreeMap::new(),
            endpoint_watches: BTreeMap::new(),
            dns_targets: BTreeSet::new(),
            dns_in_flight: BTreeSet::new(),
            serving: false,
            drain: None,
        };

        (task, watch_rx, events_rx)
    }

    async fn run(
        mut self,
        mut watches: mpsc::UnboundedReceiver<WatchEvent>,
        mut events: mpsc::UnboundedReceiver<TaskEvent>,
    ) {
        tracing::debug!(cluster = self.resolver.root(), "starting cluster balancer");
        self.resolve(now());

        loop {
            let deadline = [self.lb.next_deadline(), self.drain.as_ref().map(|(d, _)| *d)]
                .into_iter()
                .flatten()
                .min();
            let timer = async move {
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                event = watches.recv() => {
                    let Some(event) = event else { return };
                    self.handle_watch_event(event);
                    self.resolve(now());
                }
                event = events.recv() => {
                    let Some(event) = event else { return };
                    self.handle_event(event, now());
                }
                _ = timer => {
                    self.handle_timeout(now());
                }
            }

            if std::mem::take(&mut self.channel.resolution_requested) {
                self.refresh_dns();
            }
            self.channel.prune_subchannels();
        }
    }

    fn handle_watch_event(&mut self, event: WatchEvent) {
        let WatchEvent {
            resource_type,
            name,
            event,
        } = event;

        // watches are registered under the name a cluster uses, but events
        // come back under the canonical resource name.
        match resource_type {
            ResourceType::Cluster => {
                let Some(event) = event.downcast::<Cluster>() else {
                    return;
                };
                for raw in watched_names(&self.cluster_watches, &name) {
                    self.resolver.handle_cluster(&raw, event.clone());
                }
            }
            ResourceType::ClusterLoadAssignment => {
                let Some(event) = event.downcast::<EndpointSet>() else {
                    return;
                };
                for raw in watched_names(&self.endpoint_watches, &name) {
                    self.resolver.handle_endpoints(&raw, event.clone());
                }
            }
            _ => (),
        }
    }

    fn handle_event(&mut self, event: TaskEvent, now: Instant) {
        match event {
            TaskEvent::Subchannel(id, state) => {
                let Some(subchannel) = self.channel.subchannels.get(&id).cloned() else {
                    return;
                };
                self.lb
                    .subchannel_update(&subchannel, &state, &mut self.channel, now);
            }
            TaskEvent::Dns(target, result) => {
                self.dns_in_flight.remove(&target);
                if let Err(e) = &result {
                    tracing::debug!(%target, err = %e, "DNS resolution failed");
                }
                self.resolver.handle_dns(&target, result);
                self.resolve(now);
            }
        }
    }

    fn handle_timeout(&mut self, now: Instant) {
        if self.drain.as_ref().is_some_and(|(deadline, _)| *deadline <= now) {
            if let Some((_, e)) = self.drain.take() {
                tracing::debug!(cluster = self.resolver.root(), err = %e, "drain grace time expired");
                self.fail(e);
            }
        }

        self.lb.work(&mut self.channel, now);
    }

    fn resolve(&mut self, now: Instant) {
        self.update_watches();

        let client = &self.client;
        let mut load_stats = |cluster: &Cluster| -> Option<Arc<ClusterStats>> {
            if !cluster.lrs_report_to_self {
                return None;
            }
            match client.cluster_stats(&cluster.name, cluster.eds_service_name()) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::warn!(cluster = cluster.name, err = %e, "failed to start load reporting");
                    None
                }
            }
        };

        match self.resolver.resolve(&mut load_stats) {
            Resolution::Pending => (),
            Resolution::Ready(config) => {
                self.serving = true;
                self.drain = None;
                if let Err(e) = self.lb.update(&config, &mut self.channel, now) {
                    tracing::warn!(cluster = self.resolver.root(), err = %e, "invalid LB config");
                }
            }
            Resolution::Failed(e) if self.serving => {
                if self.drain.is_none() {
                    tracing::debug!(cluster = self.resolver.root(), err = %e, "draining cluster");
                    let deadline = now + self.client.config().drain_grace_time;
                    self.drain = Some((deadline, e));
                }
            }
            Resolution::Failed(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: Error) {
        tracing::debug!(cluster = self.resolver.root(), err = %e, "cluster failed");
        self.serving = false;
        self.lb.fail_all(e.to_status());
        self.channel.notify.notify_waiters();
    }

    // sync watches with the resolver's current dependencies.
    fn update_watches(&mut self) {
        let deps = self.resolver.dependencies();

        self.cluster_watches
            .retain(|name, _| deps.clusters.contains(name));
        for name in &deps.clusters {
            if self.cluster_watches.contains_key(name) {
                continue;
            }
            match self
                .client
                .watch_raw(ResourceType::Cluster, name, self.watch_tx.clone())
            {
                Ok(handle) => {
                    self.cluster_watches.insert(name.clone(), handle);
                }
                Err(e) => self
                    .resolver
                    .handle_cluster(name, crate::xds::ResourceEvent::Error(e.to_string())),
            }
        }

        self.endpoint_watches
            .retain(|name, _| deps.endpoints.contains(name));
        for name in &deps.endpoints {
            if self.endpoint_watches.contains_key(name) {
                continue;
            }
            match self.client.watch_raw(
                ResourceType::ClusterLoadAssignment,
                name,
                self.watch_tx.clone(),
            ) {
                Ok(handle) => {
                    self.endpoint_watches.insert(name.clone(), handle);
                }
                Err(e) => self
                    .resolver
                    .handle_endpoints(name, crate::xds::ResourceEvent::Error(e.to_string())),
            }
        }

        let new_targets: Vec<_> = deps.dns.difference(&self.dns_targets).cloned().collect();
        self.dns_targets = deps.dns;
        for target in new_targets {
            self.start_dns(target);
        }
    }

    fn refresh_dns(&mut self) {
        let targets: Vec<_> = self.dns_targets.iter().cloned().collect();
        for target in targets {
            self.start_dns(target);
        }
    }

    fn start_dns(&mut self, target: DnsTarget) {
        if !self.dns_in_flight.insert(target.clone()) {
            return;
        }

        tracing::trace!(%target, "resolving");
        let lookup = self.dns.resolve(&target.hostname, target.port);
        let events = self.channel.events.clone();
        tokio::spawn(async move {
            let result = lookup.await.map_err(|e| e.to_string());
            let _ = events.send(TaskEvent::Dns(target, result));
        });
    }
}

fn watched_names(watches: &BTreeMap<String, WatchHandle>, canonical: &str) -> Vec<String> {
    watches
        .iter()
        .filter(|(_, handle)| handle.name() == canonical)
        .map(|(name, _)| name.clone())
        .collect()
}
