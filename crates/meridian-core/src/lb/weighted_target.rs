//! Weighted random choice between child policies.
//!
//! Used to spread traffic across localities: each target is a locality with
//! its own child policy, weighted by the locality weight.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use super::{
    aggregate_state, ChannelController, ChildManager, ConnectivityState, LbConfig, LbError,
    LbOptions, LbPolicy, LbState, PickRequest, PickResult, Picker, Subchannel, SubchannelState,
    WeightedList,
};

#[derive(Debug, Clone, Default)]
pub struct WeightedTargetConfig {
    pub targets: BTreeMap<String, WeightedTarget>,
}

#[derive(Debug, Clone)]
pub struct WeightedTarget {
    pub weight: u32,
    pub child: LbConfig,
}

pub(crate) struct WeightedTargetLb {
    children: ChildManager,
    weights: BTreeMap<String, u32>,
}

impl WeightedTargetLb {
    pub(crate) fn new(options: LbOptions) -> Self {
        Self {
            children: ChildManager::new(options),
            weights: BTreeMap::new(),
        }
    }
}

impl LbPolicy for WeightedTargetLb {
    fn update(
        &mut self,
        config: &LbConfig,
        controller: &mut dyn ChannelController,
        now: Instant,
    ) -> Result<(), LbError> {
        let LbConfig::WeightedTarget(config) = config else {
            return Err(LbError::invalid("weighted_target", "unexpected config type"));
        };

        let removed: Vec<_> = self
            .children
            .names()
            .filter(|name| !config.targets.contains_key(*name))
            .map(str::to_string)
            .collect();
        for name in removed {
            self.children.remove_child(&name);
        }

        let mut errors = Vec::new();
        for (name, target) in &config.targets {
            if let Err(e) = self
                .children
                .update_child(name, &target.child, controller, now)
            {
                errors.extend(e.into_messages());
            }
        }

        self.weights = config
            .targets
            .iter()
            .map(|(name, target)| (name.clone(), target.weight))
            .collect();

        self.children.take_updated();
        self.report(controller);

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

impl WeightedTargetLb {
    fn report(&self, controller: &mut dyn ChannelController) {
        let states: Vec<_> = self
            .weights
            .iter()
            .filter(|(_, weight)| **weight > 0)
            .filter_map(|(name, weight)| Some((self.children.state(name)?, *weight)))
            .collect();

        if states.is_empty() {
            controller.update_picker(LbState::failing(tonic::Status::unavailable(
                "weighted_target: no targets with non-zero weight",
            )));
            return;
        }

        let connectivity_state = aggregate_state(states.iter().map(|(s, _)| s.connectivity_state));
        let update = match connectivity_state {
            ConnectivityState::Connecting => LbState::initial(),
            state => {
                let pickers = WeightedList::new(
                    states
                        .iter()
                        .filter(|(s, _)| s.connectivity_state == state)
                        .map(|(s, weight)| (s.picker.clone(), *weight)),
                );
                LbState {
                    connectivity_state: state,
                    picker: Arc::new(WeightedPicker { pickers }),
                }
            }
        };

        controller.update_picker(update);
    }
}

struct WeightedPicker {
    pickers: WeightedList<Arc<dyn Picker>>,
}

impl Picker for WeightedPicker {
    fn pick(&self, request: &PickRequest) -> PickResult {
        match self.pickers.random() {
            Some(picker) => picker.pick(request),
            None => PickResult::Queue,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lb::{
        test::{pick_addr, TestController},
        RoundRobinConfig, WeightedEndpoint,
    };
    use pretty_assertions::assert_eq;

    fn target(weight: u32, addrs: &[&str]) -> WeightedTarget {
        WeightedTarget {
            weight,
            child: LbConfig::RoundRobin(RoundRobinConfig {
                endpoints: addrs
                    .iter()
                    .map(|a| WeightedEndpoint::new(a.parse().unwrap(), 1))
                    .collect(),
            }),
        }
    }

    fn config(targets: Vec<(&str, WeightedTarget)>) -> LbConfig {
        LbConfig::WeightedTarget(WeightedTargetConfig {
            targets: targets
                .into_iter()
                .map(|(name, t)| (name.to_string(), t))
                .collect(),
        })
    }

    fn ready(lb: &mut WeightedTargetLb, controller: &mut TestController, addr: &str) {
        let sc = controller.subchannel(addr);
        lb.subchannel_update(
            &sc,
            &SubchannelState::new(ConnectivityState::Ready),
            controller,
            Instant::now(),
        );
    }

    #[test]
    fn test_locality_weights() {
        let mut controller = TestController::default();
        let mut lb = WeightedTargetLb::new(LbOptions::default());
        lb.update(
            &config(vec![
                ("a", target(2, &["10.0.0.1:80"])),
                ("b", target(8, &["10.0.0.2:80"])),
            ]),
            &mut controller,
            Instant::now(),
        )
        .unwrap();
        ready(&mut lb, &mut controller, "10.0.0.1:80");
        ready(&mut lb, &mut controller, "10.0.0.2:80");

        let state = controller.last_picker().clone();
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);

        let picks = 10_000;
        let a = (0..picks)
            .filter(|_| pick_addr(&state) == Some("10.0.0.1:80".parse().unwrap()))
            .count();
        let ratio = a as f64 / picks as f64;
        assert!((0.17..0.23).contains(&ratio), "a got {ratio} of picks");
    }

    #[test]
    fn test_only_ready_targets_picked() {
        let mut controller = TestController::default();
        let mut lb = WeightedTargetLb::new(LbOptions::default());
        lb.update(
            &config(vec![
                ("a", target(1, &["10.0.0.1:80"])),
                ("b", target(1, &["10.0.0.2:80"])),
            ]),
            &mut controller,
            Instant::now(),
        )
        .unwrap();
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::Connecting
        );

        ready(&mut lb, &mut controller, "10.0.0.2:80");
        let state = controller.last_picker().clone();
        for _ in 0..20 {
            assert_eq!(pick_addr(&state), Some("10.0.0.2:80".parse().unwrap()));
        }
    }

    #[test]
    fn test_zero_weight_targets() {
        let mut controller = TestController::default();
        let mut lb = WeightedTargetLb::new(LbOptions::default());
        lb.update(
            &config(vec![
                ("a", target(0, &["10.0.0.1:80"])),
                ("b", target(1, &["10.0.0.2:80"])),
            ]),
            &mut controller,
            Instant::now(),
        )
        .unwrap();
        ready(&mut lb, &mut controller, "10.0.0.1:80");

        // a is ready but has no weight
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::Connecting
        );
    }

    #[test]
    fn test_removed_target() {
        let now = Instant::now();
        let mut controller = TestController::default();
        let mut lb = WeightedTargetLb::new(LbOptions::default());
        lb.update(
            &config(vec![
                ("a", target(1, &["10.0.0.1:80"])),
                ("b", target(1, &["10.0.0.2:80"])),
            ]),
            &mut controller,
            now,
        )
        .unwrap();
        ready(&mut lb, &mut controller, "10.0.0.1:80");

        lb.update(&config(vec![("b", target(1, &["10.0.0.2:80"]))]), &mut controller, now)
            .unwrap();
        assert_eq!(lb.children.names().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::Connecting
        );
    }

    #[test]
    fn test_all_targets_failing() {
        let now = Instant::now();
        let mut controller = TestController::default();
        let mut lb = WeightedTargetLb::new(LbOptions::default());
        lb.update(&config(vec![("a", target(1, &[]))]), &mut controller, now)
            .unwrap();

        let state = controller.last_picker();
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
        assert!(matches!(
            state.picker.pick(&crate::lb::test::request()),
            PickResult::Fail(_)
        ));
    }
}
