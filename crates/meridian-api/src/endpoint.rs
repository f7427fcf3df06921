//! Endpoint assignments for a cluster.

use std::{collections::BTreeSet, net::SocketAddr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// The full set of endpoints for a cluster, grouped by priority and
/// locality.
///
/// An `EndpointSet` always has contiguous priorities starting at zero, and a
/// locality appears at most once in any priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSet {
    pub cluster_name: String,

    /// Priorities, from highest (index 0) to lowest.
    pub priorities: Vec<Priority>,

    /// Drop categories, in the order they should be evaluated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_overloads: Vec<DropOverload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Priority {
    pub localities: Vec<LocalityEndpoints>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalityEndpoints {
    pub locality: Locality,
    pub weight: u32,
    pub endpoints: Vec<Endpoint>,
}

impl LocalityEndpoints {
    /// Endpoints that may receive traffic.
    pub fn usable_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.health.is_usable())
    }
}

/// A named failure domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Locality {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub sub_zone: String,
}

impl Locality {
    pub fn new(region: &str, zone: &str, sub_zone: &str) -> Self {
        Self {
            region: region.to_string(),
            zone: zone.to_string(),
            sub_zone: sub_zone.to_string(),
        }
    }
}

impl std::fmt::Display for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{region=\"{}\", zone=\"{}\", sub_zone=\"{}\"}}",
            self.region, self.zone, self.sub_zone
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: SocketAddr,

    #[serde(default)]
    pub health: HealthStatus,

    /// Relative weight within the endpoint's locality. Always non-zero.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Overrides the key used to place this endpoint on a hash ring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_key: Option<String>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
    Timeout,
    Degraded,
}

impl HealthStatus {
    /// Only endpoints that are healthy or have unknown health may be picked.
    pub fn is_usable(&self) -> bool {
        matches!(self, HealthStatus::Unknown | HealthStatus::Healthy)
    }
}

/// Drop a fraction of all requests to a cluster, reporting them under
/// `category`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropOverload {
    pub category: String,
    pub parts_per_million: u32,
}

impl EndpointSet {
    /// Build an `EndpointSet` from a flat list of `(priority, locality)`
    /// pairs, checking that priorities are contiguous and localities are not
    /// repeated within a priority.
    pub fn from_localities(
        cluster_name: impl Into<String>,
        localities: impl IntoIterator<Item = (u32, LocalityEndpoints)>,
        drop_overloads: Vec<DropOverload>,
    ) -> Result<Self, Error> {
        let mut priorities: Vec<Priority> = Vec::new();
        let mut seen: Vec<BTreeSet<Locality>> = Vec::new();

        for (priority, locality) in localities {
            let idx = priority as usize;
            if idx >= priorities.len() {
                priorities.resize_with(idx + 1, Default::default);
                seen.resize_with(idx + 1, Default::default);
            }

            if !seen[idx].insert(locality.locality.clone()) {
                return Err(Error::new(format!(
                    "duplicate locality {} found in priority {priority}",
                    locality.locality
                )));
            }

            let total: u64 = priorities[idx]
                .localities
                .iter()
                .map(|l| l.weight as u64)
                .sum::<u64>()
                + locality.weight as u64;
            if total > u32::MAX as u64 {
                return Err(Error::new(format!(
                    "sum of locality weights for priority {priority} exceeds uint32 max"
                )));
            }

            priorities[idx].localities.push(locality);
        }

        if priorities.iter().any(|p| p.localities.is_empty()) {
            return Err(Error::new_static("sparse priority list"));
        }

        Ok(Self {
            cluster_name: cluster_name.into(),
            priorities,
            drop_overloads,
        })
    }

    /// Every locality across all priorities, paired with its priority.
    pub fn localities(&self) -> impl Iterator<Item = (usize, &LocalityEndpoints)> {
        self.priorities
            .iter()
            .enumerate()
            .flat_map(|(p, priority)| priority.localities.iter().map(move |l| (p, l)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn locality(region: &str, addrs: &[&str]) -> LocalityEndpoints {
        LocalityEndpoints {
            locality: Locality::new(region, "", ""),
            weight: 1,
            endpoints: addrs
                .iter()
                .map(|a| Endpoint {
                    address: a.parse().unwrap(),
                    health: HealthStatus::Unknown,
                    weight: 1,
                    hash_key: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_sparse_priorities() {
        let err = EndpointSet::from_localities(
            "cluster",
            vec![
                (0, locality("us-east-1", &["10.0.0.1:80"])),
                (2, locality("us-west-2", &["10.0.0.2:80"])),
            ],
            vec![],
        )
        .unwrap_err();

        assert_eq!(err.to_string(), "sparse priority list");
    }

    #[test]
    fn test_duplicate_locality() {
        let err = EndpointSet::from_localities(
            "cluster",
            vec![
                (0, locality("us-east-1", &["10.0.0.1:80"])),
                (0, locality("us-east-1", &["10.0.0.2:80"])),
            ],
            vec![],
        )
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "duplicate locality {region=\"us-east-1\", zone=\"\", sub_zone=\"\"} found in priority 0"
        );
    }

    #[test]
    fn test_same_locality_across_priorities() {
        let endpoints = EndpointSet::from_localities(
            "cluster",
            vec![
                (1, locality("us-east-1", &["10.0.0.2:80"])),
                (0, locality("us-east-1", &["10.0.0.1:80"])),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(endpoints.priorities.len(), 2);
        assert_eq!(endpoints.localities().count(), 2);
    }

    #[test]
    fn test_unhealthy_locality_counts() {
        let mut unhealthy = locality("us-east-1", &["10.0.0.1:80"]);
        unhealthy.endpoints[0].health = HealthStatus::Unhealthy;

        let endpoints = EndpointSet::from_localities(
            "cluster",
            vec![(0, unhealthy), (1, locality("us-west-2", &["10.0.0.2:80"]))],
            vec![],
        )
        .unwrap();

        let (_, first) = endpoints.localities().next().unwrap();
        assert_eq!(first.usable_endpoints().count(), 0);
        assert_eq!(endpoints.priorities.len(), 2);
    }
}
