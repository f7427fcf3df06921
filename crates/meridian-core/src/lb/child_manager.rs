//! Bookkeeping for policies with children.
//!
//! A [ChildManager] owns a set of named child policies, routes subchannel
//! updates to whichever child created the subchannel, and remembers the
//! latest state each child reported. Parents decide what to do with those
//! states.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use super::{
    build_policy, subchannel_key, ChannelController, ConnectivityState, LbConfig, LbError,
    LbOptions, LbPolicy, LbState, Subchannel, SubchannelState,
};

struct Child {
    kind: &'static str,
    policy: Box<dyn LbPolicy>,
    state: LbState,
}

pub(crate) struct ChildManager {
    options: LbOptions,
    children: BTreeMap<String, Child>,
    subchannels: HashMap<usize, String>,
    updated: BTreeSet<String>,
}

/// Wraps a controller so that a parent can see what a child did with it.
///
/// Subchannels and resolution requests pass straight through. Picker updates
/// are captured and never reach the real controller.
struct CapturingController<'a> {
    inner: &'a mut dyn ChannelController,
    created: Vec<Arc<dyn Subchannel>>,
    picker_update: Option<LbState>,
}

impl<'a> CapturingController<'a> {
    fn new(inner: &'a mut dyn ChannelController) -> Self {
        Self {
            inner,
            created: Vec::new(),
            picker_update: None,
        }
    }

    fn into_parts(self) -> (Vec<Arc<dyn Subchannel>>, Option<LbState>) {
        (self.created, self.picker_update)
    }
}

impl ChannelController for CapturingController<'_> {
    fn new_subchannel(&mut self, address: SocketAddr) -> Arc<dyn Subchannel> {
        let subchannel = self.inner.new_subchannel(address);
        self.created.push(subchannel.clone());
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        self.inner.request_resolution();
    }
}

impl ChildManager {
    pub(crate) fn new(options: LbOptions) -> Self {
        Self {
            options,
            children: BTreeMap::new(),
            subchannels: HashMap::new(),
            updated: BTreeSet::new(),
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub(crate) fn state(&self, name: &str) -> Option<&LbState> {
        self.children.get(name).map(|c| &c.state)
    }

    pub(crate) fn connectivity_state(&self, name: &str) -> Option<ConnectivityState> {
        self.state(name).map(|s| s.connectivity_state)
    }

    /// Names of children that have published a new state since the last
    /// call.
    pub(crate) fn take_updated(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.updated)
    }

    /// Update a child, creating it if it doesn't exist. A child whose config
    /// changes to a different kind of policy is replaced.
    pub(crate) fn update_child(
        &mut self,
        name: &str,
        config: &LbConfig,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) -> Result<(), LbError> {
        let kind = config.kind();
        if self.children.get(name).is_some_and(|c| c.kind != kind) {
            self.remove_child(name);
        }

        if !self.children.contains_key(name) {
            tracing::trace!(child = name, kind, "creating child policy");
            self.updated.insert(name.to_string());
        }
        let options = &self.options;
        let child = self
            .children
            .entry(name.to_string())
            .or_insert_with(|| Child {
                kind,
                policy: build_policy(config, options),
                state: LbState::initial(),
            });

        let mut capturing = CapturingController::new(controller);
        let result = child.policy.update(config, &mut capturing, now);
        self.resolve(name, capturing.into_parts());

        result.map_err(|e| LbError::Children(vec![format!("{name}: {e}")]))
    }

    pub(crate) fn remove_child(&mut self, name: &str) {
        if self.children.remove(name).is_some() {
            tracing::trace!(child = name, "removing child policy");
            self.subchannels.retain(|_, owner| owner != name);
            self.updated.remove(name);
        }
    }

    /// Route a subchannel update to the child that created the subchannel.
    /// Updates for unknown subchannels are ignored.
    pub(crate) fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) {
        let Some(name) = self.subchannels.get(&subchannel_key(subchannel)).cloned() else {
            return;
        };
        let Some(child) = self.children.get_mut(&name) else {
            return;
        };

        let mut capturing = CapturingController::new(controller);
        child
            .policy
            .subchannel_update(subchannel, state, &mut capturing, now);
        self.resolve(&name, capturing.into_parts());
    }

    pub(crate) fn exit_idle_child(&mut self, name: &str, controller: &mut dyn ChannelController) {
        let Some(child) = self.children.get_mut(name) else {
            return;
        };

        let mut capturing = CapturingController::new(controller);
        child.policy.exit_idle(&mut capturing);
        self.resolve(name, capturing.into_parts());
    }

    pub(crate) fn exit_idle(&mut self, controller: &mut dyn ChannelController) {
        let names: Vec<_> = self.children.keys().cloned().collect();
        for name in names {
            self.exit_idle_child(&name, controller);
        }
    }

    pub(crate) fn work(&mut self, controller: &mut dyn ChannelController, now: Instant) {
        let names: Vec<_> = self.children.keys().cloned().collect();
        for name in names {
            let Some(child) = self.children.get_mut(&name) else {
                continue;
            };
            if !child.policy.next_deadline().is_some_and(|d| d <= now) {
                continue;
            }

            let mut capturing = CapturingController::new(controller);
            child.policy.work(&mut capturing, now);
            self.resolve(&name, capturing.into_parts());
        }
    }

    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        self.children
            .values_mut()
            .filter_map(|c| c.policy.next_deadline())
            .min()
    }

    fn resolve(&mut self, name: &str, (created, picker_update): (Vec<Arc<dyn Subchannel>>, Option<LbState>)) {
        for subchannel in created {
            self.subchannels
                .insert(subchannel_key(&subchannel), name.to_string());
        }

        if let Some(state) = picker_update {
            if let Some(child) = self.children.get_mut(name) {
                child.state = state;
                self.updated.insert(name.to_string());
            }
        }
    }
}
