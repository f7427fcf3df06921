//! Failover between prioritized children.
//!
//! The priority policy sends all traffic to the highest priority child that
//! is usable. A child that doesn't connect within the failover timeout is
//! treated as failed, and the next priority is tried while it keeps
//! connecting. Lower priorities that stop being needed are kept around for a
//! while in case traffic fails back to them.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use crate::xds::Timers;

use super::{
    ChannelController, ChildManager, ConnectivityState, LbConfig, LbError, LbOptions, LbPolicy,
    LbState, Subchannel, SubchannelState,
};

#[derive(Debug, Clone, Default)]
pub struct PriorityConfig {
    /// Child configs by name.
    pub children: BTreeMap<String, LbConfig>,

    /// Child names, from highest priority to lowest.
    pub priorities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum PriorityTimer {
    Failover,
    Retention,
}

#[derive(Debug)]
struct ChildInfo {
    seen_ready_or_idle: bool,
    failed_over: bool,
}

pub(crate) struct Priority {
    children: ChildManager,
    info: BTreeMap<String, ChildInfo>,
    timers: Timers<(String, PriorityTimer)>,
    config: PriorityConfig,
    options: LbOptions,
    current: Option<String>,
}

impl Priority {
    pub(crate) fn new(options: LbOptions) -> Self {
        Self {
            children: ChildManager::new(options.clone()),
            info: BTreeMap::new(),
            timers: Timers::default(),
            config: PriorityConfig::default(),
            options,
            current: None,
        }
    }
}

impl LbPolicy for Priority {
    fn update(
        &mut self,
        config: &LbConfig,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) -> Result<(), LbError> {
        let LbConfig::Priority(config) = config else {
            return Err(LbError::invalid("priority", "unexpected config type"));
        };
        if let Some(missing) = config
            .priorities
            .iter()
            .find(|name| !config.children.contains_key(*name))
        {
            return Err(LbError::invalid(
                "priority",
                format!("no config for child {missing}"),
            ));
        }

        self.config = config.clone();

        let mut errors = Vec::new();
        let existing: Vec<_> = self.children.names().map(str::to_string).collect();
        for name in existing {
            match self.config.children.get(&name) {
                Some(child) => {
                    if let Err(e) = self.children.update_child(&name, child, controller, now) {
                        errors.extend(e.into_messages());
                    }
                }
                None => self.deactivate(&name, now),
            }
        }
        self.sync_children(now);
        errors.extend(self.choose_priority(controller, now));

        match errors.is_empty() {
            true => Ok(()),
            false => Err(LbError::Children(errors)),
        }
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
        if self.sync_children(now) {
            self.choose_priority(controller, now);
        }
    }

    fn exit_idle(&mut self, controller: &mut dyn ChannelController) {
        let Some(current) = self.current.clone() else {
            return;
        };
        // picker updates from leaving idle are picked up by the next call
        // that has a clock.
        self.children.exit_idle_child(&current, controller);
    }

    fn work(&mut self, controller: &mut dyn ChannelController, now: Instant) {
        let mut changed = false;

        for (name, timer) in self.timers.expired(now) {
            match timer {
                PriorityTimer::Failover => {
                    tracing::debug!(child = name, "priority failover timer fired");
                    if let Some(info) = self.info.get_mut(&name) {
                        info.seen_ready_or_idle = false;
                        info.failed_over = true;
                    }
                    changed = true;
                }
                PriorityTimer::Retention => {
                    tracing::debug!(child = name, "removing deactivated priority child");
                    self.children.remove_child(&name);
                    self.info.remove(&name);
                    self.timers.cancel(&(name, PriorityTimer::Failover));
                }
            }
        }

        self.children.work(controller, now);
        changed |= self.sync_children(now);

        if changed {
            self.choose_priority(controller, now);
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        [self.timers.next_deadline(), self.children.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }
}

impl Priority {
    /// A child's state, with children whose failover timer fired reported
    /// as failing until they report something new.
    fn effective_state(&self, name: &str) -> Option<ConnectivityState> {
        let state = self.children.connectivity_state(name)?;
        let failed_over = self.info.get(name).is_some_and(|i| i.failed_over);

        match state {
            ConnectivityState::Connecting if failed_over => {
                Some(ConnectivityState::TransientFailure)
            }
            state => Some(state),
        }
    }

    /// Update failover bookkeeping for every child that published a new
    /// state. Returns true if anything changed.
    fn sync_children(&mut self, now: Instant) -> bool {
        let updated = self.children.take_updated();
        for name in &updated {
            let Some(state) = self.children.connectivity_state(name) else {
                continue;
            };
            let Some(info) = self.info.get_mut(name) else {
                continue;
            };
            let failover = (name.clone(), PriorityTimer::Failover);

            match state {
                ConnectivityState::Connecting => {
                    if info.seen_ready_or_idle && !self.timers.is_running(&failover) {
                        self.timers
                            .start(failover, now + self.options.failover_timeout);
                    }
                }
                ConnectivityState::Ready | ConnectivityState::Idle => {
                    info.seen_ready_or_idle = true;
                    info.failed_over = false;
                    self.timers.cancel(&failover);
                }
                ConnectivityState::TransientFailure => {
                    info.seen_ready_or_idle = false;
                    info.failed_over = false;
                    self.timers.cancel(&failover);
                }
            }
        }

        !updated.is_empty()
    }

    fn create_child(
        &mut self,
        name: &str,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) -> Vec<String> {
        let Some(config) = self.config.children.get(name) else {
            return vec![format!("no config for child {name}")];
        };

        tracing::debug!(child = name, "starting priority child");
        self.info.insert(
            name.to_string(),
            ChildInfo {
                seen_ready_or_idle: true,
                failed_over: false,
            },
        );
        self.timers.start(
            (name.to_string(), PriorityTimer::Failover),
            now + self.options.failover_timeout,
        );

        let result = self.children.update_child(name, config, controller, now);
        self.sync_children(now);
        result.err().map(LbError::into_messages).unwrap_or_default()
    }

    fn deactivate(&mut self, name: &str, now: Instant) {
        let retention = (name.to_string(), PriorityTimer::Retention);
        if self.children.contains(name) && !self.timers.is_running(&retention) {
            tracing::debug!(child = name, "deactivating priority child");
            self.timers.cancel(&(name.to_string(), PriorityTimer::Failover));
            self.timers
                .start(retention, now + self.options.child_retention_interval);
        }
    }

    fn choose_priority(&mut self, controller: &mut dyn ChannelController, now: Instant) -> Vec<String> {
        if self.config.priorities.is_empty() {
            self.current = None;
            controller.update_picker(LbState::failing(tonic::Status::unavailable(
                "priority policy has empty priority list",
            )));
            return Vec::new();
        }

        let mut errors = Vec::new();
        let priorities = self.config.priorities.clone();

        for (p, name) in priorities.iter().enumerate() {
            if self.children.contains(name) {
                self.timers
                    .cancel(&(name.clone(), PriorityTimer::Retention));
            } else {
                errors.extend(self.create_child(name, controller, now));
            }

            match self.effective_state(name) {
                Some(ConnectivityState::Ready | ConnectivityState::Idle) => {
                    for lower in &priorities[p + 1..] {
                        self.deactivate(lower, now);
                    }
                    self.set_current(name, controller);
                    return errors;
                }
                _ if self.timers.is_running(&(name.clone(), PriorityTimer::Failover)) => {
                    self.set_current(name, controller);
                    return errors;
                }
                _ => (),
            }
        }

        // nothing is usable or still inside its failover window. fall back
        // to the first child that's at least trying, and then to the lowest
        // priority.
        let fallback = priorities
            .iter()
            .find(|name| self.effective_state(name) == Some(ConnectivityState::Connecting))
            .or(priorities.last())
            .cloned();
        if let Some(name) = fallback {
            self.set_current(&name, controller);
        }

        errors
    }

    fn set_current(&mut self, name: &str, controller: &mut dyn ChannelController) {
        let (Some(state), Some(connectivity_state)) =
            (self.children.state(name), self.effective_state(name))
        else {
            return;
        };

        if self.current.as_deref() != Some(name) {
            tracing::debug!(child = name, "switching priority");
            self.current = Some(name.to_string());
        }

        controller.update_picker(LbState {
            connectivity_state,
            picker: state.picker.clone(),
        });
    }
}
