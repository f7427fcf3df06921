//! Weighted round robin over a flat list of endpoints.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use super::{
    subchannel_key, ChannelController, ConnectivityState, LbConfig, LbError, LbPolicy, LbState,
    Pick, PickRequest, PickResult, Picker, Subchannel, SubchannelState, WeightedEndpoint,
    WeightedList,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundRobinConfig {
    pub endpoints: Vec<WeightedEndpoint>,
}

struct Entry {
    address: SocketAddr,
    weight: u32,
    subchannel: Arc<dyn Subchannel>,
    state: SubchannelState,
}

/// Round robin connects to every endpoint as soon as it learns about it and
/// reconnects whenever a subchannel goes idle.
///
/// Once every subchannel has failed, the policy stays in transient failure
/// until a subchannel becomes ready, even if others start connecting again.
#[derive(Default)]
pub(crate) struct RoundRobin {
    entries: Vec<Entry>,
    state: Option<ConnectivityState>,
}

impl LbPolicy for RoundRobin {
    fn update(
        &mut self,
        config: &LbConfig,
        controller: &mut dyn ChannelController,
        _now: Instant,
    ) -> Result<(), LbError> {
        let LbConfig::RoundRobin(config) = config else {
            return Err(LbError::invalid("round_robin", "unexpected config type"));
        };

        let mut existing: HashMap<_, _> = std::mem::take(&mut self.entries)
            .into_iter()
            .map(|e| (e.address, e))
            .collect();

        for endpoint in &config.endpoints {
            if self.entries.iter().any(|e| e.address == endpoint.address) {
                continue;
            }

            let entry = match existing.remove(&endpoint.address) {
                Some(mut entry) => {
                    entry.weight = endpoint.weight;
                    entry
                }
                None => {
                    let subchannel = controller.new_subchannel(endpoint.address);
                    subchannel.connect();
                    Entry {
                        address: endpoint.address,
                        weight: endpoint.weight,
                        subchannel,
                        state: SubchannelState::new(ConnectivityState::Connecting),
                    }
                }
            };
            self.entries.push(entry);
        }

        self.report(controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        controller: &mut dyn ChannelController,
        _now: Instant,
    ) {
        let key = subchannel_key(subchannel);
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| subchannel_key(&e.subchannel) == key)
        else {
            return;
        };

        entry.state = state.clone();
        match state.connectivity_state {
            ConnectivityState::Idle => entry.subchannel.connect(),
            ConnectivityState::TransientFailure => controller.request_resolution(),
            _ => (),
        }

        self.report(controller);
    }

    fn exit_idle(&mut self, _controller: &mut dyn ChannelController) {
        for entry in &self.entries {
            if entry.state.connectivity_state == ConnectivityState::Idle {
                entry.subchannel.connect();
            }
        }
    }
}

impl RoundRobin {
    fn report(&mut self, controller: &mut dyn ChannelController) {
        if self.entries.is_empty() {
            self.state = Some(ConnectivityState::TransientFailure);
            controller.update_picker(LbState::failing(tonic::Status::unavailable(
                "round_robin: no endpoints",
            )));
            return;
        }

        let ready = WeightedList::new(
            self.entries
                .iter()
                .filter(|e| e.state.connectivity_state == ConnectivityState::Ready)
                .map(|e| (e.subchannel.clone(), e.weight.max(1))),
        );

        let all_failed = self
            .entries
            .iter()
            .all(|e| e.state.connectivity_state == ConnectivityState::TransientFailure);
        let sticky_failure = self.state == Some(ConnectivityState::TransientFailure);

        let update = if !ready.is_empty() {
            let next = crate::rand::random_below(ready.total());
            LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RoundRobinPicker {
                    subchannels: ready,
                    next: AtomicU64::new(next),
                }),
            }
        } else if all_failed || sticky_failure {
            let last_error = self
                .entries
                .iter()
                .rev()
                .find_map(|e| e.state.last_connection_error.as_deref())
                .unwrap_or("unknown error");
            LbState::failing(tonic::Status::unavailable(format!(
                "round_robin: connections to all backends failing; last error: {last_error}"
            )))
        } else {
            LbState::initial()
        };

        self.state = Some(update.connectivity_state);
        controller.update_picker(update);
    }
}

struct RoundRobinPicker {
    subchannels: WeightedList<Arc<dyn Subchannel>>,
    next: AtomicU64,
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _: &PickRequest) -> PickResult {
        let n = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.total();
        match self.subchannels.get(n) {
            Some(subchannel) => PickResult::Pick(Pick {
                subchannel: subchannel.clone(),
                tracker: None,
            }),
            None => PickResult::Queue,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lb::test::{pick_addr, TestController};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn config(endpoints: &[(&str, u32)]) -> LbConfig {
        LbConfig::RoundRobin(RoundRobinConfig {
            endpoints: endpoints
                .iter()
                .map(|(a, w)| WeightedEndpoint::new(a.parse().unwrap(), *w))
                .collect(),
        })
    }

    fn ready(
        lb: &mut RoundRobin,
        controller: &mut TestController,
        addr: &str,
    ) {
        let sc = controller.subchannel(addr);
        lb.subchannel_update(
            &sc,
            &SubchannelState::new(ConnectivityState::Ready),
            controller,
            Instant::now(),
        );
    }

    #[test]
    fn test_connects_eagerly() {
        let mut controller = TestController::default();
        let mut lb = RoundRobin::default();
        lb.update(
            &config(&[("10.0.0.1:80", 1), ("10.0.0.2:80", 1)]),
            &mut controller,
            Instant::now(),
        )
        .unwrap();

        assert_eq!(controller.connects("10.0.0.1:80"), 1);
        assert_eq!(controller.connects("10.0.0.2:80"), 1);
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::Connecting
        );
    }

    #[test]
    fn test_round_robin_across_ready() {
        let mut controller = TestController::default();
        let mut lb = RoundRobin::default();
        lb.update(
            &config(&[("10.0.0.1:80", 1), ("10.0.0.2:80", 1), ("10.0.0.3:80", 1)]),
            &mut controller,
            Instant::now(),
        )
        .unwrap();
        ready(&mut lb, &mut controller, "10.0.0.1:80");
        ready(&mut lb, &mut controller, "10.0.0.3:80");

        let state = controller.last_picker().clone();
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);

        let mut counts = BTreeMap::new();
        for _ in 0..100 {
            *counts.entry(pick_addr(&state).unwrap().to_string()).or_insert(0) += 1;
        }
        assert_eq!(
            counts,
            BTreeMap::from([("10.0.0.1:80".to_string(), 50), ("10.0.0.3:80".to_string(), 50)])
        );
    }

    #[test]
    fn test_endpoint_weights() {
        let mut controller = TestController::default();
        let mut lb = RoundRobin::default();
        lb.update(
            &config(&[("10.0.0.1:80", 1), ("10.0.0.2:80", 2)]),
            &mut controller,
            Instant::now(),
        )
        .unwrap();
        ready(&mut lb, &mut controller, "10.0.0.1:80");
        ready(&mut lb, &mut controller, "10.0.0.2:80");

        let state = controller.last_picker().clone();
        let mut counts = BTreeMap::new();
        for _ in 0..300 {
            *counts.entry(pick_addr(&state).unwrap().to_string()).or_insert(0) += 1;
        }
        assert_eq!(
            counts,
            BTreeMap::from([("10.0.0.1:80".to_string(), 100), ("10.0.0.2:80".to_string(), 200)])
        );
    }

    #[test]
    fn test_sticky_transient_failure() {
        let now = Instant::now();
        let mut controller = TestController::default();
        let mut lb = RoundRobin::default();
        lb.update(
            &config(&[("10.0.0.1:80", 1), ("10.0.0.2:80", 1)]),
            &mut controller,
            now,
        )
        .unwrap();

        for addr in ["10.0.0.1:80", "10.0.0.2:80"] {
            let sc = controller.subchannel(addr);
            lb.subchannel_update(&sc, &SubchannelState::failed("connection refused"), &mut controller, now);
        }
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::TransientFailure
        );
        assert_eq!(controller.resolution_requests, 2);

        // a subchannel going idle reconnects but doesn't leave failure
        let sc = controller.subchannel("10.0.0.1:80");
        lb.subchannel_update(
            &sc,
            &SubchannelState::new(ConnectivityState::Idle),
            &mut controller,
            now,
        );
        assert_eq!(controller.connects("10.0.0.1:80"), 2);
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::TransientFailure
        );

        ready(&mut lb, &mut controller, "10.0.0.1:80");
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::Ready
        );
    }

    #[test]
    fn test_failure_message() {
        let now = Instant::now();
        let mut controller = TestController::default();
        let mut lb = RoundRobin::default();
        lb.update(&config(&[("10.0.0.1:80", 1)]), &mut controller, now)
            .unwrap();
        let sc = controller.subchannel("10.0.0.1:80");
        lb.subchannel_update(&sc, &SubchannelState::failed("connection refused"), &mut controller, now);

        let PickResult::Fail(status) = controller.last_picker().picker.pick(&crate::lb::test::request()) else {
            panic!("expected a failed pick");
        };
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(
            status.message(),
            "round_robin: connections to all backends failing; last error: connection refused"
        );
    }

    #[test]
    fn test_update_keeps_subchannels() {
        let now = Instant::now();
        let mut controller = TestController::default();
        let mut lb = RoundRobin::default();
        lb.update(&config(&[("10.0.0.1:80", 1)]), &mut controller, now)
            .unwrap();
        ready(&mut lb, &mut controller, "10.0.0.1:80");

        lb.update(
            &config(&[("10.0.0.1:80", 1), ("10.0.0.2:80", 1)]),
            &mut controller,
            now,
        )
        .unwrap();
        assert_eq!(controller.subchannel_count(), 2);
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::Ready
        );
        assert_eq!(
            pick_addr(controller.last_picker()),
            Some("10.0.0.1:80".parse().unwrap())
        );
    }

    #[test]
    fn test_empty_endpoints() {
        let mut controller = TestController::default();
        let mut lb = RoundRobin::default();
        lb.update(&config(&[]), &mut controller, Instant::now()).unwrap();
        assert_eq!(
            controller.last_picker().connectivity_state,
            ConnectivityState::TransientFailure
        );
    }
}
