//! Per-cluster call accounting.
//!
//! The cluster_impl policy sits between a priority and its locality children.
//! It applies EDS drop overloads, enforces the cluster's max concurrent
//! requests, and wraps every pick in a [CallTracker] that records the call
//! for load reporting.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Instant,
};

use meridian_api::endpoint::{DropOverload, Locality};
use once_cell::sync::Lazy;

use crate::lrs::{ClusterStats, LocalityStats};

use super::{
    ChannelController, ChildManager, LbConfig, LbError, LbOptions, LbPolicy, LbState, Pick,
    PickRequest, PickResult, Picker, Subchannel, SubchannelState,
};

const CHILD: &str = "child";

#[derive(Clone)]
pub struct ClusterImplConfig {
    pub cluster_name: String,
    pub eds_service_name: String,

    /// The max number of concurrent requests to this cluster.
    pub max_requests: u32,

    /// Drop categories, evaluated in order.
    pub drop_overloads: Vec<DropOverload>,

    /// Where to report load. Calls are still counted for circuit breaking
    /// without this.
    pub load_stats: Option<Arc<ClusterStats>>,

    /// The locality of every endpoint in the child config, for load
    /// reporting.
    pub localities: BTreeMap<SocketAddr, Locality>,

    pub child: Box<LbConfig>,
}

impl fmt::Debug for ClusterImplConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterImplConfig")
            .field("cluster_name", &self.cluster_name)
            .field("eds_service_name", &self.eds_service_name)
            .field("max_requests", &self.max_requests)
            .field("drop_overloads", &self.drop_overloads)
            .field("load_reporting", &self.load_stats.is_some())
            .field("child", &self.child)
            .finish()
    }
}

// in-flight call counts are shared by every policy for the same cluster so
// that the limit holds across priorities and channels.
static CALL_COUNTERS: Lazy<Mutex<HashMap<(String, String), Weak<AtomicU32>>>> =
    Lazy::new(Default::default);

fn call_counter(cluster_name: &str, eds_service_name: &str) -> Arc<AtomicU32> {
    let mut counters = CALL_COUNTERS.lock().unwrap_or_else(|e| e.into_inner());
    let key = (cluster_name.to_string(), eds_service_name.to_string());

    if let Some(counter) = counters.get(&key).and_then(Weak::upgrade) {
        return counter;
    }

    counters.retain(|_, counter| counter.strong_count() > 0);
    let counter = Arc::new(AtomicU32::new(0));
    counters.insert(key, Arc::downgrade(&counter));
    counter
}

/// Everything a picker needs that only changes on a config update.
struct CallAccounting {
    cluster_name: String,
    max_requests: u32,
    drop_overloads: Vec<DropOverload>,
    in_flight: Arc<AtomicU32>,
    stats: Option<Arc<ClusterStats>>,
    localities: HashMap<SocketAddr, Arc<LocalityStats>>,
}

impl CallAccounting {
    fn from_config(config: &ClusterImplConfig) -> Self {
        let localities = match &config.load_stats {
            Some(stats) => config
                .localities
                .iter()
                .map(|(addr, locality)| (*addr, stats.locality(locality)))
                .collect(),
            None => HashMap::new(),
        };

        Self {
            cluster_name: config.cluster_name.clone(),
            max_requests: config.max_requests,
            drop_overloads: config.drop_overloads.clone(),
            in_flight: call_counter(&config.cluster_name, &config.eds_service_name),
            stats: config.load_stats.clone(),
            localities,
        }
    }

    fn record_drop(&self, category: Option<&str>) {
        if let Some(stats) = &self.stats {
            stats.add_drop(category);
        }
    }
}

pub(crate) struct ClusterImpl {
    children: ChildManager,
    accounting: Option<Arc<CallAccounting>>,
}

impl ClusterImpl {
    pub(crate) fn new(options: LbOptions) -> Self {
        Self {
            children: ChildManager::new(options),
            accounting: None,
        }
    }
}

impl LbPolicy for ClusterImpl {
    fn update(
        &mut self,
        config: &LbConfig,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) -> Result<(), LbError> {
        let LbConfig::ClusterImpl(config) = config else {
            return Err(LbError::invalid("xds_cluster_impl", "unexpected config type"));
        };

        self.accounting = Some(Arc::new(CallAccounting::from_config(config)));
        let result = self
            .children
            .update_child(CHILD, &config.child, controller, now);

        // always re-publish so the new drop config takes effect even if the
        // child didn't change.
        self.children.take_updated();
        self.report(controller);

        result
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) {
        self.children
            .subchannel_update(subchannel, state, controller, now);
        if !self.children.take_updated().is_empty() {
            self.report(controller);
        }
    }

    fn exit_idle(&mut self, controller: &mut dyn ChannelController) {
        self.children.exit_idle(controller);
        if !self.children.take_updated().is_empty() {
            self.report(controller);
        }
    }

    fn work(&mut self, controller: &mut dyn ChannelController, now: Instant) {
        self.children.work(controller, now);
        if !self.children.take_updated().is_empty() {
            self.report(controller);
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        self.children.next_deadline()
    }
}

impl ClusterImpl {
    fn report(&self, controller: &mut dyn ChannelController) {
        let (Some(accounting), Some(child)) = (&self.accounting, self.children.state(CHILD)) else {
            return;
        };

        controller.update_picker(LbState {
            connectivity_state: child.connectivity_state,
            picker: Arc::new(ClusterImplPicker {
                accounting: accounting.clone(),
                child: child.picker.clone(),
            }),
        });
    }
}

struct ClusterImplPicker {
    accounting: Arc<CallAccounting>,
    child: Arc<dyn Picker>,
}

impl Picker for ClusterImplPicker {
    fn pick(&self, request: &PickRequest) -> PickResult {
        let accounting = &self.accounting;

        for drop in &accounting.drop_overloads {
            if crate::rand::random_below(1_000_000) < drop.parts_per_million as u64 {
                accounting.record_drop(Some(&drop.category));
                return PickResult::Drop(tonic::Status::unavailable(format!(
                    "EDS-configured drop: {}",
                    drop.category
                )));
            }
        }

        let Some(mut tracker) = CallTracker::reserve(&accounting.in_flight, accounting.max_requests)
        else {
            accounting.record_drop(None);
            return PickResult::Drop(tonic::Status::resource_exhausted(format!(
                "circuit breaker max requests limit ({}) exceeded for cluster {}",
                accounting.max_requests, accounting.cluster_name,
            )));
        };

        // anything but a pick drops the tracker and releases its slot.
        match self.child.pick(request) {
            PickResult::Pick(pick) => {
                if let Some(locality) = accounting.localities.get(&pick.subchannel.address()) {
                    tracker.start(locality.clone());
                }
                PickResult::Pick(Pick {
                    tracker: Some(tracker),
                    subchannel: pick.subchannel,
                })
            }
            other => other,
        }
    }
}

/// Tracks a single call from pick to completion.
///
/// Counts towards the cluster's concurrent request limit until it's
/// finished. A tracker that's dropped without being finished counts as a
/// failed call.
#[derive(Debug)]
pub struct CallTracker {
    in_flight: Arc<AtomicU32>,
    locality: Option<Arc<LocalityStats>>,
    finished: bool,
}

impl CallTracker {
    /// Take one of the `max_requests` call slots, or return `None` if they're
    /// all in use.
    fn reserve(in_flight: &Arc<AtomicU32>, max_requests: u32) -> Option<Self> {
        in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_requests).then_some(n + 1)
            })
            .ok()?;

        Some(Self {
            in_flight: in_flight.clone(),
            locality: None,
            finished: false,
        })
    }

    fn start(&mut self, locality: Arc<LocalityStats>) {
        locality.call_started();
        self.locality = Some(locality);
    }

    /// Record the end of the call.
    pub fn finish(mut self, success: bool) {
        self.complete(success);
    }

    fn complete(&mut self, success: bool) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(locality) = &self.locality {
            locality.call_finished(success);
        }
    }
}

impl Drop for CallTracker {
    fn drop(&mut self) {
        self.complete(false);
    }
}
