//! Load balancing policies.
//!
//! Every cluster gets a tree of LB policies built from its config. For a
//! cluster using round robin, the tree looks like:
//!
//! ```text
//! priority
//! └── cluster_impl (one per priority)
//!     └── weighted_target
//!         └── round_robin (one per locality)
//! ```
//!
//! Ring hash clusters replace the `weighted_target` subtree with a single
//! `ring_hash` policy over every endpoint in the priority.
//!
//! Policies are sans-io. They create subchannels and publish pickers through
//! a [ChannelController], get told about subchannel state changes, and take
//! the current time as an argument instead of starting their own timers. The
//! root of the tree publishes every new picker into a [PickerHandle] that can
//! be shared between any number of threads making picks.

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;

mod child_manager;
pub(crate) use child_manager::ChildManager;

mod cluster_impl;
pub use cluster_impl::{CallTracker, ClusterImplConfig};

mod priority;
pub use priority::PriorityConfig;

mod ring_hash;
pub use ring_hash::RingHashConfig;

mod round_robin;
pub use round_robin::RoundRobinConfig;

mod weighted_target;
pub use weighted_target::{WeightedTarget, WeightedTargetConfig};


use crate::bootstrap::XdsClientConfig;

/// The connectivity state of a subchannel or an LB policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
        };
        f.write_str(name)
    }
}

/// A connection to a single address, owned by whatever is making calls.
///
/// Subchannels start out idle and only connect when asked to. `connect` may
/// be called from any thread, including from inside a [Picker].
pub trait Subchannel: Send + Sync + fmt::Debug {
    fn address(&self) -> SocketAddr;

    fn connect(&self);
}

// subchannels are compared by identity, not by address. two localities may
// both contain the same address.
pub(crate) fn subchannel_key(subchannel: &Arc<dyn Subchannel>) -> usize {
    Arc::as_ptr(subchannel) as *const () as usize
}

/// The state of a subchannel, as reported to the policy that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubchannelState {
    pub connectivity_state: ConnectivityState,

    /// The most recent connection error. Only set in `TransientFailure`.
    pub last_connection_error: Option<String>,
}

impl SubchannelState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(error.into()),
        }
    }
}

/// The per-call information available to a [Picker].
#[derive(Debug, Clone, Copy)]
pub struct PickRequest<'a> {
    pub headers: &'a http::HeaderMap,

    /// The hash computed from the selected route's hash policy. Only used by
    /// ring hash, which picks a random hash when this isn't set.
    pub request_hash: Option<u64>,
}

/// The outcome of a pick.
#[derive(Debug)]
pub enum PickResult {
    /// Use this subchannel.
    Pick(Pick),

    /// No subchannel is ready yet. Wait for the next picker and try again.
    Queue,

    /// Fail the call. Calls that wait for ready should stay queued.
    Fail(tonic::Status),

    /// Fail the call, even if it would otherwise wait for ready.
    Drop(tonic::Status),
}

/// A picked subchannel.
#[derive(Debug)]
pub struct Pick {
    pub subchannel: Arc<dyn Subchannel>,

    /// Tracks the call for circuit breaking and load reporting. Finish it
    /// when the call completes.
    pub tracker: Option<CallTracker>,
}

/// Picks a subchannel for each call.
///
/// Pickers are immutable snapshots of an LB policy's state. A new picker is
/// published every time that state changes, and calls in flight keep using
/// whichever picker they started with.
pub trait Picker: Send + Sync {
    fn pick(&self, request: &PickRequest) -> PickResult;
}

/// A policy's current state, as reported to its parent.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl fmt::Debug for LbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LbState")
            .field("connectivity_state", &self.connectivity_state)
            .finish_non_exhaustive()
    }
}

impl LbState {
    /// The state every policy starts in: connecting, with all picks queued.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker),
        }
    }

    /// A failing state where every pick fails with `status`.
    pub fn failing(status: tonic::Status) -> Self {
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker(status)),
        }
    }
}

/// Queues every pick.
pub(crate) struct QueuingPicker;

impl Picker for QueuingPicker {
    fn pick(&self, _: &PickRequest) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with the same status.
pub(crate) struct FailingPicker(tonic::Status);

impl Picker for FailingPicker {
    fn pick(&self, _: &PickRequest) -> PickResult {
        PickResult::Fail(self.0.clone())
    }
}

/// The interface an LB policy uses to talk to whatever owns it.
pub trait ChannelController {
    /// Create a new, idle subchannel.
    fn new_subchannel(&mut self, address: SocketAddr) -> Arc<dyn Subchannel>;

    /// Publish a new state and picker.
    fn update_picker(&mut self, update: LbState);

    /// Ask for addresses to be re-resolved.
    fn request_resolution(&mut self);
}

/// An endpoint address with its weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedEndpoint {
    pub address: SocketAddr,
    pub weight: u32,

    /// Overrides the address as the endpoint's key on a hash ring.
    pub hash_key: Option<String>,
}

impl WeightedEndpoint {
    pub fn new(address: SocketAddr, weight: u32) -> Self {
        Self {
            address,
            weight,
            hash_key: None,
        }
    }
}

/// The config for a single policy in an LB tree.
#[derive(Debug, Clone)]
pub enum LbConfig {
    RoundRobin(RoundRobinConfig),
    RingHash(RingHashConfig),
    WeightedTarget(WeightedTargetConfig),
    ClusterImpl(ClusterImplConfig),
    Priority(PriorityConfig),
}

impl LbConfig {
    /// The name of the policy this config is for.
    pub fn kind(&self) -> &'static str {
        match self {
            LbConfig::RoundRobin(_) => "round_robin",
            LbConfig::RingHash(_) => "ring_hash",
            LbConfig::WeightedTarget(_) => "weighted_target",
            LbConfig::ClusterImpl(_) => "xds_cluster_impl",
            LbConfig::Priority(_) => "priority",
        }
    }
}

/// Errors applying a config to an LB policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LbError {
    #[error("{policy}: {message}")]
    InvalidConfig {
        policy: &'static str,
        message: String,
    },

    #[error("errors from children: [{}]", .0.join("; "))]
    Children(Vec<String>),
}

impl LbError {
    fn invalid(policy: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            policy,
            message: message.into(),
        }
    }

    fn into_messages(self) -> Vec<String> {
        match self {
            LbError::Children(messages) => messages,
            e => vec![e.to_string()],
        }
    }
}

/// Options shared by every policy in a tree.
#[derive(Debug, Clone)]
pub(crate) struct LbOptions {
    pub(crate) ring_size_cap: u64,
    pub(crate) failover_timeout: Duration,
    pub(crate) child_retention_interval: Duration,
}

impl Default for LbOptions {
    fn default() -> Self {
        Self::from(&XdsClientConfig::default())
    }
}

impl From<&XdsClientConfig> for LbOptions {
    fn from(config: &XdsClientConfig) -> Self {
        Self {
            ring_size_cap: config.ring_size_cap,
            failover_timeout: config.priority_failover_timeout,
            child_retention_interval: config.child_retention_interval,
        }
    }
}

/// An LB policy.
///
/// Policies never block and never spawn tasks. Anything time-based is driven
/// by the owner calling [work][LbPolicy::work] once the time returned by
/// [next_deadline][LbPolicy::next_deadline] has passed.
pub(crate) trait LbPolicy: Send {
    /// Apply a new config. The config is always for this policy's kind.
    fn update(
        &mut self,
        config: &LbConfig,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) -> Result<(), LbError>;

    /// Handle a state change for a subchannel this policy created.
    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        controller: &mut dyn ChannelController,
        now: Instant,
    );

    /// Start connecting if the policy is idle.
    fn exit_idle(&mut self, controller: &mut dyn ChannelController);

    /// Handle any timers that have expired.
    fn work(&mut self, _controller: &mut dyn ChannelController, _now: Instant) {}

    /// The next time [work][LbPolicy::work] should be called.
    fn next_deadline(&mut self) -> Option<Instant> {
        None
    }
}

pub(crate) fn build_policy(config: &LbConfig, options: &LbOptions) -> Box<dyn LbPolicy> {
    match config {
        LbConfig::RoundRobin(_) => Box::new(round_robin::RoundRobin::default()),
        LbConfig::RingHash(_) => Box::new(ring_hash::RingHash::new(options.ring_size_cap)),
        LbConfig::WeightedTarget(_) => {
            Box::new(weighted_target::WeightedTargetLb::new(options.clone()))
        }
        LbConfig::ClusterImpl(_) => Box::new(cluster_impl::ClusterImpl::new(options.clone())),
        LbConfig::Priority(_) => Box::new(priority::Priority::new(options.clone())),
    }
}

/// Aggregate child states the way every parent policy does: ready if
/// anything is ready, then connecting, then idle, and only failing when
/// everything is failing.
pub(crate) fn aggregate_state(
    states: impl IntoIterator<Item = ConnectivityState>,
) -> ConnectivityState {
    let mut connecting = false;
    let mut idle = false;

    for state in states {
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => connecting = true,
            ConnectivityState::Idle => idle = true,
            ConnectivityState::TransientFailure => (),
        }
    }

    if connecting {
        ConnectivityState::Connecting
    } else if idle {
        ConnectivityState::Idle
    } else {
        ConnectivityState::TransientFailure
    }
}

/// A weighted list of items for random picks.
#[derive(Debug)]
pub(crate) struct WeightedList<T> {
    items: Vec<T>,
    cumulative: Vec<u64>,
}

impl<T> WeightedList<T> {
    /// Build a list, skipping anything with zero weight.
    pub(crate) fn new(items: impl IntoIterator<Item = (T, u32)>) -> Self {
        let mut total = 0u64;
        let mut list = Self {
            items: Vec::new(),
            cumulative: Vec::new(),
        };

        for (item, weight) in items {
            if weight == 0 {
                continue;
            }
            total += weight as u64;
            list.items.push(item);
            list.cumulative.push(total);
        }

        list
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn total(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Get the item that owns `n`, where `n` is in `[0, total)`.
    pub(crate) fn get(&self, n: u64) -> Option<&T> {
        let idx = self.cumulative.partition_point(|&c| c <= n);
        self.items.get(idx)
    }

    pub(crate) fn random(&self) -> Option<&T> {
        match self.total() {
            0 => None,
            total => self.get(crate::rand::random_below(total)),
        }
    }
}

/// A shared handle to the latest picker published by a [LoadBalancer].
#[derive(Clone)]
pub struct PickerHandle(Arc<ArcSwap<LbState>>);

impl fmt::Debug for PickerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PickerHandle")
            .field(&self.connectivity_state())
            .finish()
    }
}

impl PickerHandle {
    pub fn pick(&self, request: &PickRequest) -> PickResult {
        self.0.load().picker.pick(request)
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.0.load().connectivity_state
    }

    /// The current state, including the picker.
    pub fn state(&self) -> LbState {
        LbState::clone(&self.0.load())
    }
}

/// The root of an LB policy tree.
///
/// Owns the root policy, replacing it when the config asks for a different
/// kind of policy, and publishes every picker the tree produces to its
/// [PickerHandle].
pub struct LoadBalancer {
    options: LbOptions,
    root: Option<(&'static str, Box<dyn LbPolicy>)>,
    current: Arc<ArcSwap<LbState>>,
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("root", &self.root.as_ref().map(|(kind, _)| kind))
            .field("state", &self.current.load().connectivity_state)
            .finish()
    }
}

struct PublishingController<'a> {
    inner: &'a mut dyn ChannelController,
    current: &'a ArcSwap<LbState>,
}

impl ChannelController for PublishingController<'_> {
    fn new_subchannel(&mut self, address: SocketAddr) -> Arc<dyn Subchannel> {
        self.inner.new_subchannel(address)
    }

    fn update_picker(&mut self, update: LbState) {
        tracing::trace!(state = %update.connectivity_state, "publishing picker");
        self.current.store(Arc::new(update.clone()));
        self.inner.update_picker(update);
    }

    fn request_resolution(&mut self) {
        self.inner.request_resolution();
    }
}

impl LoadBalancer {
    pub fn new(config: &XdsClientConfig) -> Self {
        Self::with_options(LbOptions::from(config))
    }

    pub(crate) fn with_options(options: LbOptions) -> Self {
        Self {
            options,
            root: None,
            current: Arc::new(ArcSwap::from_pointee(LbState::initial())),
        }
    }

    pub fn picker(&self) -> PickerHandle {
        PickerHandle(self.current.clone())
    }

    pub fn update(
        &mut self,
        config: &LbConfig,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) -> Result<(), LbError> {
        let kind = config.kind();
        let policy = match &mut self.root {
            Some((root_kind, policy)) if *root_kind == kind => policy,
            root => {
                let (_, policy) = root.insert((kind, build_policy(config, &self.options)));
                policy
            }
        };

        let mut controller = PublishingController {
            inner: controller,
            current: &self.current,
        };
        policy.update(config, &mut controller, now)
    }

    pub fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) {
        if let Some((_, policy)) = &mut self.root {
            let mut controller = PublishingController {
                inner: controller,
                current: &self.current,
            };
            policy.subchannel_update(subchannel, state, &mut controller, now);
        }
    }

    pub fn exit_idle(&mut self, controller: &mut dyn ChannelController) {
        if let Some((_, policy)) = &mut self.root {
            let mut controller = PublishingController {
                inner: controller,
                current: &self.current,
            };
            policy.exit_idle(&mut controller);
        }
    }

    pub fn work(&mut self, controller: &mut dyn ChannelController, now: Instant) {
        if let Some((_, policy)) = &mut self.root {
            let mut controller = PublishingController {
                inner: controller,
                current: &self.current,
            };
            policy.work(&mut controller, now);
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.root.as_mut().and_then(|(_, p)| p.next_deadline())
    }

    /// Fail every new pick with `status` until the next config update.
    pub fn fail_all(&mut self, status: tonic::Status) {
        self.root = None;
        self.current.store(Arc::new(LbState::failing(status)));
    }
}

/// Build a map from endpoint address to locality for load reporting.
pub(crate) fn locality_map<'a>(
    localities: impl IntoIterator<Item = &'a meridian_api::endpoint::LocalityEndpoints>,
) -> BTreeMap<SocketAddr, meridian_api::endpoint::Locality> {
    let mut map = BTreeMap::new();
    for locality in localities {
        for endpoint in locality.usable_endpoints() {
            map.entry(endpoint.address)
                .or_insert_with(|| locality.locality.clone());
        }
    }
    map
}
