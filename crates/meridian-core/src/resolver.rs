//! Cluster resolution.
//!
//! A [ClusterResolver] turns a cluster name into an LB policy config. It
//! follows aggregate clusters down to their leaves, collects the endpoints
//! for every leaf from EDS or DNS, and builds a priority policy with one child
//! for every priority of every leaf cluster.
//!
//! The resolver doesn't do any IO. It says which resources it depends on,
//! gets told about them as they change, and builds a new config on request.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::Arc,
};

use meridian_api::{
    cluster::{Cluster, ClusterKind, LbPolicy},
    endpoint::{DropOverload, Endpoint, EndpointSet, HealthStatus, Locality, LocalityEndpoints},
};

use crate::{
    lb::{
        locality_map, ClusterImplConfig, LbConfig, PriorityConfig, RingHashConfig,
        RoundRobinConfig, WeightedEndpoint, WeightedTarget, WeightedTargetConfig,
    },
    lrs::ClusterStats,
    xds::{ResourceEvent, ResourceType},
    Error,
};

mod dns;
pub use dns::{DnsResolver, NameResolver};

/// Aggregate clusters can't nest deeper than this.
const MAX_AGGREGATE_DEPTH: usize = 16;

/// A host and port to resolve for a logical DNS cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DnsTarget {
    pub hostname: String,
    pub port: u16,
}

impl std::fmt::Display for DnsTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Everything a cluster currently depends on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Dependencies {
    pub(crate) clusters: BTreeSet<String>,
    pub(crate) endpoints: BTreeSet<String>,
    pub(crate) dns: BTreeSet<DnsTarget>,
}

#[derive(Debug)]
pub(crate) enum Resolution {
    /// Still waiting on at least one resource.
    Pending,

    Ready(LbConfig),

    Failed(Error),
}

#[derive(Debug)]
enum Slot<T> {
    Ready(Arc<T>),
    Failed(Error),
}

impl<T> Slot<T> {
    fn apply(
        slot: Option<&mut Self>,
        event: ResourceEvent<T>,
        resource_type: ResourceType,
        name: &str,
    ) -> Option<Self> {
        let new = match event {
            ResourceEvent::Changed(value) => Slot::Ready(value),
            ResourceEvent::DoesNotExist => Slot::Failed(Error::DoesNotExist {
                resource_type,
                name: name.to_string(),
            }),
            // errors don't replace a valid resource
            ResourceEvent::Error(message) => match slot {
                Some(Slot::Ready(_)) => return None,
                _ => Slot::Failed(Error::InvalidResource {
                    resource_type,
                    name: name.to_string(),
                    message,
                }),
            },
        };
        Some(new)
    }
}

/// Stable names for the priority children of a single leaf cluster.
///
/// Priorities get renumbered all the time: a priority disappears, or
/// localities shuffle between priorities. Reusing a child whenever it shares
/// a locality with a priority keeps connections alive across those changes.
#[derive(Debug, Default)]
struct ChildNames {
    numbers: Vec<usize>,
    localities: Vec<BTreeSet<Locality>>,
    next: usize,
}

impl ChildNames {
    fn update(&mut self, priorities: Vec<BTreeSet<Locality>>) {
        let mut locality_child: BTreeMap<&Locality, usize> = BTreeMap::new();
        let mut child_localities: BTreeMap<usize, Vec<&Locality>> = BTreeMap::new();
        for (localities, number) in self.localities.iter().zip(&self.numbers) {
            for locality in localities {
                locality_child.insert(locality, *number);
                child_localities.entry(*number).or_default().push(locality);
            }
        }

        let mut next = self.next;
        let mut numbers = Vec::with_capacity(priorities.len());
        for localities in &priorities {
            let mut number = None;
            for locality in localities {
                match number {
                    None => {
                        if let Some(n) = locality_child.remove(locality) {
                            number = Some(n);
                            // the child's old localities can't claim it for
                            // a later priority.
                            for old in child_localities.get(&n).into_iter().flatten() {
                                locality_child.remove(old);
                            }
                        }
                    }
                    Some(_) => {
                        locality_child.remove(locality);
                    }
                }
            }

            let number = match number {
                Some(n) => n,
                None => {
                    let mut n = next;
                    while child_localities.contains_key(&n) {
                        n += 1;
                    }
                    next = n + 1;
                    child_localities.insert(n, Vec::new());
                    n
                }
            };
            numbers.push(number);
        }

        self.numbers = numbers;
        self.localities = priorities;
        self.next = next;
    }

    fn name(&self, cluster: &str, priority: usize) -> String {
        format!("{cluster}#{}", self.numbers[priority])
    }
}

/// The endpoints for one leaf cluster.
struct LeafEndpoints<'a> {
    eds_service_name: &'a str,
    priorities: Vec<&'a [LocalityEndpoints]>,
    drop_overloads: &'a [DropOverload],
}

pub(crate) struct ClusterResolver {
    root: String,
    clusters: BTreeMap<String, Slot<Cluster>>,
    endpoints: BTreeMap<String, Slot<EndpointSet>>,
    dns: BTreeMap<DnsTarget, Slot<LocalityEndpoints>>,

    // the EDS resource each cluster last resolved with. kept until the
    // cluster's current EDS resource arrives.
    serving_eds: BTreeMap<String, String>,
    child_names: BTreeMap<String, ChildNames>,
}

impl ClusterResolver {
    pub(crate) fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            clusters: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            dns: BTreeMap::new(),
            serving_eds: BTreeMap::new(),
            child_names: BTreeMap::new(),
        }
    }

    pub(crate) fn root(&self) -> &str {
        &self.root
    }

    pub(crate) fn handle_cluster(&mut self, name: &str, event: ResourceEvent<Cluster>) {
        let slot = self.clusters.get_mut(name);
        if let Some(new) = Slot::apply(slot, event, ResourceType::Cluster, name) {
            self.clusters.insert(name.to_string(), new);
        }
    }

    pub(crate) fn handle_endpoints(&mut self, name: &str, event: ResourceEvent<EndpointSet>) {
        let slot = self.endpoints.get_mut(name);
        if let Some(new) = Slot::apply(slot, event, ResourceType::ClusterLoadAssignment, name) {
            self.endpoints.insert(name.to_string(), new);
        }
    }

    pub(crate) fn handle_dns(&mut self, target: &DnsTarget, result: Result<Vec<SocketAddr>, String>) {
        let slot = match result {
            Ok(addrs) => Slot::Ready(Arc::new(LocalityEndpoints {
                locality: Locality::default(),
                weight: 1,
                endpoints: addrs
                    .into_iter()
                    .map(|address| Endpoint {
                        address,
                        health: HealthStatus::Unknown,
                        weight: 1,
                        hash_key: None,
                    })
                    .collect(),
            })),
            Err(message) => match self.dns.get(target) {
                // keep serving the last good answer
                Some(Slot::Ready(_)) => return,
                _ => Slot::Failed(Error::Connection(format!(
                    "failed to resolve {target}: {message}"
                ))),
            },
        };
        self.dns.insert(target.clone(), slot);
    }

    /// Every resource needed to resolve the root cluster given what's known
    /// so far. Resources that aren't needed any more are forgotten.
    pub(crate) fn dependencies(&mut self) -> Dependencies {
        let mut deps = Dependencies::default();
        let mut path = Vec::new();
        self.walk_dependencies(&self.root, &mut path, &mut deps);

        self.clusters.retain(|name, _| deps.clusters.contains(name));
        self.endpoints.retain(|name, _| deps.endpoints.contains(name));
        self.dns.retain(|target, _| deps.dns.contains(target));
        self.serving_eds
            .retain(|cluster, _| deps.clusters.contains(cluster));

        deps
    }

    fn walk_dependencies(&self, name: &str, path: &mut Vec<String>, deps: &mut Dependencies) {
        if path.iter().any(|n| n == name) || path.len() >= MAX_AGGREGATE_DEPTH {
            return;
        }
        deps.clusters.insert(name.to_string());

        let Some(Slot::Ready(cluster)) = self.clusters.get(name) else {
            return;
        };

        match &cluster.kind {
            ClusterKind::Eds { .. } => {
                let eds_name = cluster.eds_service_name();
                deps.endpoints.insert(eds_name.to_string());

                if let Some(serving) = self.serving_eds.get(name) {
                    if serving != eds_name && !matches!(self.endpoints.get(eds_name), Some(Slot::Ready(_))) {
                        deps.endpoints.insert(serving.clone());
                    }
                }
            }
            ClusterKind::LogicalDns { hostname, port } => {
                deps.dns.insert(DnsTarget {
                    hostname: hostname.clone(),
                    port: *port,
                });
            }
            ClusterKind::Aggregate { clusters } => {
                path.push(name.to_string());
                for child in clusters {
                    self.walk_dependencies(child, path, deps);
                }
                path.pop();
            }
        }
    }

    /// Build an LB config from the current state of every dependency.
    ///
    /// `load_stats` is called for every leaf cluster to get the stats its
    /// calls should be reported to.
    pub(crate) fn resolve(
        &mut self,
        load_stats: &mut dyn FnMut(&Cluster) -> Option<Arc<ClusterStats>>,
    ) -> Resolution {
        let mut leaves = Vec::new();
        let mut path = Vec::new();
        match self.collect_leaves(&self.root, &mut path, &mut leaves) {
            Ok(true) => (),
            Ok(false) => return Resolution::Pending,
            Err(e) => return Resolution::Failed(e),
        }
        if leaves.is_empty() {
            return Resolution::Failed(Error::InvalidResource {
                resource_type: ResourceType::Cluster,
                name: self.root.clone(),
                message: "aggregate cluster graph has no leaf clusters".to_string(),
            });
        }

        let mut resolved = Vec::with_capacity(leaves.len());
        for cluster in &leaves {
            match leaf_endpoints(&self.endpoints, &self.dns, &self.serving_eds, cluster) {
                Ok(Some(endpoints)) => resolved.push((cluster.clone(), endpoints)),
                Ok(None) => return Resolution::Pending,
                Err(e) => return Resolution::Failed(e),
            }
        }

        // only switch EDS names once the new resource is actually used
        let mut config = PriorityConfig::default();
        let mut serving = BTreeMap::new();
        let mut localities = BTreeMap::new();
        for (cluster, endpoints) in &resolved {
            if let ClusterKind::Eds { .. } = cluster.kind {
                serving.insert(cluster.name.clone(), endpoints.eds_service_name.to_string());
            }
            localities.insert(
                cluster.name.clone(),
                endpoints
                    .priorities
                    .iter()
                    .map(|p| p.iter().map(|l| l.locality.clone()).collect())
                    .collect::<Vec<BTreeSet<_>>>(),
            );
        }

        for (cluster, priorities) in localities {
            self.child_names.entry(cluster).or_default().update(priorities);
        }
        self.child_names
            .retain(|name, _| resolved.iter().any(|(c, _)| &c.name == name));

        for (cluster, endpoints) in &resolved {
            let names = &self.child_names[&cluster.name];
            let stats = load_stats(cluster);

            for (priority, localities) in endpoints.priorities.iter().enumerate() {
                let name = names.name(&cluster.name, priority);
                let child = cluster_impl_config(cluster, endpoints, localities, stats.clone());
                config.priorities.push(name.clone());
                config.children.insert(name, child);
            }
        }

        self.serving_eds.extend(serving);
        Resolution::Ready(LbConfig::Priority(config))
    }

    /// Collect every leaf cluster under `name`, depth first. Returns
    /// `Ok(false)` if any cluster in the graph hasn't arrived yet.
    fn collect_leaves(
        &self,
        name: &str,
        path: &mut Vec<String>,
        leaves: &mut Vec<Arc<Cluster>>,
    ) -> Result<bool, Error> {
        if path.iter().any(|n| n == name) {
            return Err(Error::ClusterLoop(name.to_string()));
        }
        if path.len() >= MAX_AGGREGATE_DEPTH {
            return Err(Error::InvalidResource {
                resource_type: ResourceType::Cluster,
                name: name.to_string(),
                message: format!(
                    "aggregate cluster graph exceeds max depth of {MAX_AGGREGATE_DEPTH}"
                ),
            });
        }

        let cluster = match self.clusters.get(name) {
            None => return Ok(false),
            Some(Slot::Failed(e)) => return Err(e.clone()),
            Some(Slot::Ready(cluster)) => cluster,
        };

        let ClusterKind::Aggregate { clusters } = &cluster.kind else {
            // a cluster reachable through more than one aggregate is only
            // used once, at its highest priority.
            if !leaves.iter().any(|c| c.name == cluster.name) {
                leaves.push(cluster.clone());
            }
            return Ok(true);
        };

        path.push(name.to_string());
        let mut complete = true;
        for child in clusters {
            complete &= self.collect_leaves(child, path, leaves)?;
        }
        path.pop();

        Ok(complete)
    }
}

fn leaf_endpoints<'a>(
    endpoints: &'a BTreeMap<String, Slot<EndpointSet>>,
    dns: &'a BTreeMap<DnsTarget, Slot<LocalityEndpoints>>,
    serving_eds: &'a BTreeMap<String, String>,
    cluster: &'a Cluster,
) -> Result<Option<LeafEndpoints<'a>>, Error> {
    match &cluster.kind {
        ClusterKind::Eds { .. } => {
            let eds_name = cluster.eds_service_name();
            let slot = match endpoints.get(eds_name) {
                Some(slot) => Some((eds_name, slot)),
                None => serving_eds
                    .get(&cluster.name)
                    .and_then(|old| Some((old.as_str(), endpoints.get(old)?))),
            };

            match slot {
                None => Ok(None),
                Some((_, Slot::Failed(e))) => Err(e.clone()),
                Some((eds_service_name, Slot::Ready(endpoints))) => Ok(Some(LeafEndpoints {
                    eds_service_name,
                    priorities: endpoints
                        .priorities
                        .iter()
                        .map(|p| p.localities.as_slice())
                        .collect(),
                    drop_overloads: &endpoints.drop_overloads,
                })),
            }
        }
        ClusterKind::LogicalDns { hostname, port } => {
            let target = DnsTarget {
                hostname: hostname.clone(),
                port: *port,
            };
            match dns.get(&target) {
                None => Ok(None),
                Some(Slot::Failed(e)) => Err(e.clone()),
                Some(Slot::Ready(locality)) => Ok(Some(LeafEndpoints {
                    eds_service_name: "",
                    priorities: vec![std::slice::from_ref(locality.as_ref())],
                    drop_overloads: &[],
                })),
            }
        }
        ClusterKind::Aggregate { .. } => Ok(None),
    }
}

fn cluster_impl_config(
    cluster: &Cluster,
    endpoints: &LeafEndpoints,
    localities: &[LocalityEndpoints],
    load_stats: Option<Arc<ClusterStats>>,
) -> LbConfig {
    let child = match cluster.lb_policy {
        LbPolicy::RoundRobin => LbConfig::WeightedTarget(WeightedTargetConfig {
            targets: localities
                .iter()
                .map(|l| {
                    let child = LbConfig::RoundRobin(RoundRobinConfig {
                        endpoints: l
                            .usable_endpoints()
                            .map(|e| WeightedEndpoint::new(e.address, e.weight))
                            .collect(),
                    });
                    (
                        l.locality.to_string(),
                        WeightedTarget {
                            weight: l.weight,
                            child,
                        },
                    )
                })
                .collect(),
        }),
        LbPolicy::RingHash(ring) => LbConfig::RingHash(RingHashConfig {
            min_ring_size: ring.min_ring_size,
            max_ring_size: ring.max_ring_size,
            endpoints: localities
                .iter()
                .flat_map(|l| {
                    l.usable_endpoints().map(|e| WeightedEndpoint {
                        address: e.address,
                        weight: l.weight.max(1).saturating_mul(e.weight),
                        hash_key: e.hash_key.clone(),
                    })
                })
                .collect(),
        }),
    };

    LbConfig::ClusterImpl(ClusterImplConfig {
        cluster_name: cluster.name.clone(),
        eds_service_name: endpoints.eds_service_name.to_string(),
        max_requests: cluster.max_requests,
        drop_overloads: endpoints.drop_overloads.to_vec(),
        load_stats,
        localities: locality_map(localities),
        child: Box::new(child),
    })
}
