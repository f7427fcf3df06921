//! Consistent hashing with a ketama-style ring.
//!
//! Every endpoint is placed on the ring some number of times, proportional to
//! its weight. A request hash picks the first ring entry at or after it,
//! wrapping around. Endpoints are only connected to when a pick lands on
//! them, so picks on an idle endpoint queue while it connects.

use std::{sync::Arc, time::Instant};

use crate::hash::thread_local_xxhash;

use super::{
    subchannel_key, ChannelController, ConnectivityState, LbConfig, LbError, LbPolicy, LbState,
    Pick, PickRequest, PickResult, Picker, Subchannel, SubchannelState, WeightedEndpoint,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingHashConfig {
    pub min_ring_size: u64,
    pub max_ring_size: u64,
    pub endpoints: Vec<WeightedEndpoint>,
}

struct Entry {
    endpoint: WeightedEndpoint,
    subchannel: Arc<dyn Subchannel>,
    state: SubchannelState,
}

pub(crate) struct RingHash {
    ring_size_cap: u64,
    entries: Vec<Entry>,
    ring: Arc<Ring>,
    ring_params: Option<(u64, u64, Vec<WeightedEndpoint>)>,
}

impl RingHash {
    pub(crate) fn new(ring_size_cap: u64) -> Self {
        Self {
            ring_size_cap,
            entries: Vec::new(),
            ring: Arc::new(Ring::default()),
            ring_params: None,
        }
    }
}

impl LbPolicy for RingHash {
    fn update(
        &mut self,
        config: &LbConfig,
        controller: &mut dyn ChannelController,
        _now: Instant,
    ) -> Result<(), LbError> {
        let LbConfig::RingHash(config) = config else {
            return Err(LbError::invalid("ring_hash", "unexpected config type"));
        };
        if config.min_ring_size == 0 || config.min_ring_size > config.max_ring_size {
            return Err(LbError::invalid(
                "ring_hash",
                format!(
                    "invalid ring size range: [{}, {}]",
                    config.min_ring_size, config.max_ring_size
                ),
            ));
        }

        let mut existing = std::mem::take(&mut self.entries);
        for endpoint in &config.endpoints {
            if self.entries.iter().any(|e| e.endpoint.address == endpoint.address) {
                continue;
            }

            let entry = match existing
                .iter()
                .position(|e| e.endpoint.address == endpoint.address)
            {
                Some(idx) => {
                    let mut entry = existing.swap_remove(idx);
                    entry.endpoint = endpoint.clone();
                    entry
                }
                None => Entry {
                    endpoint: endpoint.clone(),
                    subchannel: controller.new_subchannel(endpoint.address),
                    state: SubchannelState::new(ConnectivityState::Idle),
                },
            };
            self.entries.push(entry);
        }

        let min_ring_size = config.min_ring_size.min(self.ring_size_cap);
        let max_ring_size = config.max_ring_size.min(self.ring_size_cap);
        let endpoints: Vec<_> = self.entries.iter().map(|e| e.endpoint.clone()).collect();
        let params = (min_ring_size, max_ring_size, endpoints);
        if self.ring_params.as_ref() != Some(&params) {
            self.ring = Arc::new(Ring::build(&params.2, min_ring_size, max_ring_size));
            tracing::trace!(ring_size = self.ring.entries.len(), "rebuilt hash ring");
            self.ring_params = Some(params);
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

        // a failed subchannel that goes idle is still failed as far as
        // aggregation is concerned, until it connects again.
        let was_failing = entry.state.connectivity_state == ConnectivityState::TransientFailure;
        if !(was_failing && state.connectivity_state == ConnectivityState::Idle) {
            entry.state = state.clone();
        } else {
            entry.subchannel.connect();
        }

        if state.connectivity_state == ConnectivityState::TransientFailure {
            controller.request_resolution();
        }

        self.report(controller);
    }

    fn exit_idle(&mut self, _controller: &mut dyn ChannelController) {
        if self.aggregate_state() == ConnectivityState::Idle {
            if let Some(entry) = self.entries.first() {
                entry.subchannel.connect();
            }
        }
    }
}

impl RingHash {
    fn count(&self, state: ConnectivityState) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state.connectivity_state == state)
            .count()
    }

    fn aggregate_state(&self) -> ConnectivityState {
        use ConnectivityState::*;

        if self.count(Ready) > 0 {
            return Ready;
        }
        let failing = self.count(TransientFailure);
        if failing >= 2 {
            return TransientFailure;
        }
        if self.count(Connecting) > 0 {
            return Connecting;
        }
        if failing == 1 && self.entries.len() > 1 {
            return Connecting;
        }
        if self.count(Idle) > 0 {
            return Idle;
        }
        TransientFailure
    }

    fn report(&mut self, controller: &mut dyn ChannelController) {
        if self.entries.is_empty() {
            controller.update_picker(LbState::failing(tonic::Status::unavailable(
                "ring_hash: no endpoints",
            )));
            return;
        }

        let connectivity_state = self.aggregate_state();

        // in failure, something has to be trying to connect or the policy
        // can only recover when a pick happens to land on an idle endpoint.
        if connectivity_state == ConnectivityState::TransientFailure
            && self.count(ConnectivityState::Connecting) == 0
        {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.state.connectivity_state == ConnectivityState::Idle)
            {
                entry.subchannel.connect();
            }
        }

        let endpoints = self
            .entries
            .iter()
            .map(|e| EndpointSnapshot {
                subchannel: e.subchannel.clone(),
                state: e.state.connectivity_state,
                last_error: e.state.last_connection_error.clone(),
            })
            .collect();

        controller.update_picker(LbState {
            connectivity_state,
            picker: Arc::new(RingHashPicker {
                ring: self.ring.clone(),
                endpoints,
            }),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingEntry {
    hash: u64,
    idx: usize,
}

#[derive(Debug, Default)]
struct Ring {
    entries: Vec<RingEntry>,
}

impl Ring {
    fn build(endpoints: &[WeightedEndpoint], min_ring_size: u64, max_ring_size: u64) -> Self {
        if endpoints.is_empty() {
            return Self::default();
        }

        let total: f64 = endpoints.iter().map(|e| e.weight.max(1) as f64).sum();
        let normalized: Vec<f64> = endpoints
            .iter()
            .map(|e| e.weight.max(1) as f64 / total)
            .collect();
        let min_normalized = normalized.iter().copied().fold(f64::INFINITY, f64::min);

        // scale so the smallest endpoint gets at least one entry, without
        // going over the max ring size.
        let scale = ((min_normalized * min_ring_size as f64).ceil() / min_normalized)
            .min(max_ring_size as f64);

        let mut entries = Vec::with_capacity(scale.ceil() as usize);
        let mut current = 0.0;
        let mut target = 0.0;
        for (idx, (endpoint, weight)) in endpoints.iter().zip(&normalized).enumerate() {
            let key = match &endpoint.hash_key {
                Some(key) => key.clone(),
                None => endpoint.address.to_string(),
            };

            target += scale * weight;
            let mut count = 0;
            while current < target {
                let hash = thread_local_xxhash::hash_bytes(format!("{key}_{count}").as_bytes());
                entries.push(RingEntry { hash, idx });
                count += 1;
                current += 1.0;
            }
        }

        entries.sort_by_key(|e| e.hash);
        Self { entries }
    }

    /// The position of the first entry at or after `hash`, wrapping around.
    fn position(&self, hash: u64) -> usize {
        let idx = self.entries.partition_point(|e| e.hash < hash);
        if idx == self.entries.len() {
            0
        } else {
            idx
        }
    }

    /// Ring entries in order, starting at `start`.
    fn walk(&self, start: usize) -> impl Iterator<Item = &RingEntry> {
        let (head, tail) = self.entries.split_at(start);
        tail.iter().chain(head)
    }
}

struct EndpointSnapshot {
    subchannel: Arc<dyn Subchannel>,
    state: ConnectivityState,
    last_error: Option<String>,
}

struct RingHashPicker {
    ring: Arc<Ring>,
    endpoints: Vec<EndpointSnapshot>,
}

impl RingHashPicker {
    fn pick_endpoint(&self, idx: usize) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.endpoints[idx].subchannel.clone(),
            tracker: None,
        })
    }

    fn all_failed(&self) -> PickResult {
        let first_error = self
            .endpoints
            .iter()
            .find_map(|e| e.last_error.as_deref())
            .unwrap_or("unknown error");
        PickResult::Fail(tonic::Status::unavailable(format!(
            "ring hash cannot find a connected endpoint; first failure: {first_error}"
        )))
    }

    fn pick_hashed(&self, hash: u64) -> PickResult {
        for entry in self.ring.walk(self.ring.position(hash)) {
            let endpoint = &self.endpoints[entry.idx];
            match endpoint.state {
                ConnectivityState::Ready => return self.pick_endpoint(entry.idx),
                ConnectivityState::Idle => {
                    endpoint.subchannel.connect();
                    return PickResult::Queue;
                }
                ConnectivityState::Connecting => return PickResult::Queue,
                ConnectivityState::TransientFailure => continue,
            }
        }

        self.all_failed()
    }

    // without a request hash, prefer anything already connected over
    // starting a new connection, and start at most one connection per pick.
    fn pick_random(&self) -> PickResult {
        let start = crate::rand::random_below(self.ring.entries.len() as u64) as usize;

        let mut idle = None;
        let mut connecting = false;
        for entry in self.ring.walk(start) {
            match self.endpoints[entry.idx].state {
                ConnectivityState::Ready => return self.pick_endpoint(entry.idx),
                ConnectivityState::Idle => {
                    idle.get_or_insert(entry.idx);
                }
                ConnectivityState::Connecting => connecting = true,
                ConnectivityState::TransientFailure => (),
            }
        }

        match idle {
            Some(idx) => {
                self.endpoints[idx].subchannel.connect();
                PickResult::Queue
            }
            None if connecting => PickResult::Queue,
            None => self.all_failed(),
        }
    }
}

impl Picker for RingHashPicker {
    fn pick(&self, request: &PickRequest) -> PickResult {
        if self.ring.entries.is_empty() {
            return PickResult::Fail(tonic::Status::unavailable("ring_hash: empty ring"));
        }

        match request.request_hash {
            Some(hash) => self.pick_hashed(hash),
            None => self.pick_random(),
        }
    }
}
