//! Load reporting.
//!
//! A [LoadReportStore] collects call counts for every cluster that reports
//! load to a server. Pickers hold on to an `Arc<ClusterStats>` and count
//! calls and drops lock-free. A single [LrsTask] per server periodically
//! drains the store and sends the counts over an LRS stream.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use meridian_api::endpoint::Locality;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;
use xds_api::pb::{
    envoy::{
        config::{core::v3 as xds_core, endpoint::v3 as xds_endpoint},
        service::load_stats::v3::{
            load_reporting_service_client::LoadReportingServiceClient, LoadStatsRequest,
            LoadStatsResponse,
        },
    },
    google::protobuf,
};

use crate::{bootstrap::BackoffConfig, xds::unwrap_io_error};

use crate::xds::Backoff;

/// The shortest reporting interval a server can ask for.
const MIN_LOAD_REPORTING_INTERVAL: Duration = Duration::from_secs(1);

/// Call counts for a single locality.
#[derive(Debug, Default)]
pub struct LocalityStats {
    issued: AtomicU64,
    succeeded: AtomicU64,
    errored: AtomicU64,
    in_progress: AtomicU64,
}

impl LocalityStats {
    /// Record the start of a call.
    pub fn call_started(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.in_progress.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a call.
    pub fn call_finished(&self, success: bool) {
        self.in_progress.fetch_sub(1, Ordering::Relaxed);
        match success {
            true => self.succeeded.fetch_add(1, Ordering::Relaxed),
            false => self.errored.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Current counts as `(issued, succeeded, errored, in_progress)`.
    #[cfg(test)]
    pub(crate) fn counts(&self) -> (u64, u64, u64, u64) {
        (
            self.issued.load(Ordering::Relaxed),
            self.succeeded.load(Ordering::Relaxed),
            self.errored.load(Ordering::Relaxed),
            self.in_progress.load(Ordering::Relaxed),
        )
    }

    fn snapshot(&self) -> LocalitySnapshot {
        LocalitySnapshot {
            issued: self.issued.swap(0, Ordering::Relaxed),
            succeeded: self.succeeded.swap(0, Ordering::Relaxed),
            errored: self.errored.swap(0, Ordering::Relaxed),
            in_progress: self.in_progress.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct LocalitySnapshot {
    issued: u64,
    succeeded: u64,
    errored: u64,
    in_progress: u64,
}

impl LocalitySnapshot {
    fn is_zero(&self) -> bool {
        *self == LocalitySnapshot::default()
    }
}

/// Call and drop counts for a single (cluster, EDS service name) pair.
#[derive(Debug, Default)]
pub struct ClusterStats {
    uncategorized_drops: AtomicU64,
    drops: Mutex<BTreeMap<String, u64>>,
    localities: Mutex<BTreeMap<Locality, Arc<LocalityStats>>>,
}

impl ClusterStats {
    /// Record a dropped call. Calls dropped for a named category are reported
    /// by category. Everything else, like calls rejected by a circuit
    /// breaker, only counts towards the total.
    pub fn add_drop(&self, category: Option<&str>) {
        match category {
            Some(category) => {
                let mut drops = self.drops.lock().unwrap_or_else(|e| e.into_inner());
                *drops.entry(category.to_string()).or_default() += 1;
            }
            None => {
                self.uncategorized_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Get the stats for a locality, creating them if necessary.
    pub fn locality(&self, locality: &Locality) -> Arc<LocalityStats> {
        let mut localities = self.localities.lock().unwrap_or_else(|e| e.into_inner());
        localities.entry(locality.clone()).or_default().clone()
    }

    fn report(
        &self,
        cluster_name: &str,
        eds_service_name: &str,
        interval: Duration,
    ) -> Option<xds_endpoint::ClusterStats> {
        let dropped_requests: Vec<_> = {
            let mut drops = self.drops.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *drops)
                .into_iter()
                .map(|(category, dropped_count)| {
                    xds_endpoint::cluster_stats::DroppedRequests {
                        category,
                        dropped_count,
                    }
                })
                .collect()
        };
        let uncategorized = self.uncategorized_drops.swap(0, Ordering::Relaxed);
        let total_dropped_requests =
            uncategorized + dropped_requests.iter().map(|d| d.dropped_count).sum::<u64>();

        let mut upstream_locality_stats = Vec::new();
        {
            let mut localities = self.localities.lock().unwrap_or_else(|e| e.into_inner());
            localities.retain(|locality, stats| {
                let snapshot = stats.snapshot();
                let in_use = Arc::strong_count(stats) > 1 || snapshot.in_progress > 0;

                if !snapshot.is_zero() {
                    upstream_locality_stats.push(xds_endpoint::UpstreamLocalityStats {
                        locality: Some(xds_core::Locality {
                            region: locality.region.clone(),
                            zone: locality.zone.clone(),
                            sub_zone: locality.sub_zone.clone(),
                        }),
                        total_successful_requests: snapshot.succeeded,
                        total_requests_in_progress: snapshot.in_progress,
                        total_error_requests: snapshot.errored,
                        total_issued_requests: snapshot.issued,
                        ..Default::default()
                    });
                }

                in_use
            });
        }

        if total_dropped_requests == 0 && upstream_locality_stats.is_empty() {
            return None;
        }

        Some(xds_endpoint::ClusterStats {
            cluster_name: cluster_name.to_string(),
            cluster_service_name: eds_service_name.to_string(),
            upstream_locality_stats,
            total_dropped_requests,
            dropped_requests,
            load_report_interval: Some(to_proto_duration(interval)),
        })
    }
}

#[derive(Debug)]
struct StoreEntry {
    stats: Arc<ClusterStats>,
    last_report: Instant,
}

/// Load stats for every cluster reporting to one LRS server.
#[derive(Debug, Default)]
pub(crate) struct LoadReportStore {
    clusters: Mutex<BTreeMap<(String, String), StoreEntry>>,
}

impl LoadReportStore {
    /// Get the stats for a cluster, creating them if they don't already
    /// exist.
    pub(crate) fn cluster_stats(
        &self,
        cluster_name: &str,
        eds_service_name: &str,
        now: Instant,
    ) -> Arc<ClusterStats> {
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        let key = (cluster_name.to_string(), eds_service_name.to_string());
        clusters
            .entry(key)
            .or_insert_with(|| StoreEntry {
                stats: Arc::new(ClusterStats::default()),
                last_report: now,
            })
            .stats
            .clone()
    }

    /// Build a report for every cluster the server wants to hear about and
    /// reset their counters.
    ///
    /// Stats that are no longer referenced outside the store are included in
    /// one last report and then removed.
    pub(crate) fn report(&self, wanted: &ReportedClusters, now: Instant) -> Vec<xds_endpoint::ClusterStats> {
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        let mut reports = Vec::new();

        clusters.retain(|(cluster_name, eds_service_name), entry| {
            if !wanted.contains(cluster_name) {
                return true;
            }

            let interval = now.saturating_duration_since(entry.last_report);
            entry.last_report = now;
            if let Some(report) = entry.stats.report(cluster_name, eds_service_name, interval) {
                reports.push(report);
            }

            Arc::strong_count(&entry.stats) > 1
        });

        reports
    }
}

/// The set of clusters an LRS server asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReportedClusters {
    All,
    Only(BTreeSet<String>),
}

impl ReportedClusters {
    fn contains(&self, cluster_name: &str) -> bool {
        match self {
            ReportedClusters::All => true,
            ReportedClusters::Only(names) => names.contains(cluster_name),
        }
    }
}

/// The reporting config most recently sent by an LRS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReportingConfig {
    pub(crate) clusters: ReportedClusters,
    pub(crate) interval: Duration,
}

impl ReportingConfig {
    pub(crate) fn from_response(response: &LoadStatsResponse) -> Self {
        let clusters = match response.send_all_clusters {
            true => ReportedClusters::All,
            false => ReportedClusters::Only(response.clusters.iter().cloned().collect()),
        };

        let interval = response
            .load_reporting_interval
            .as_ref()
            .and_then(from_proto_duration)
            .unwrap_or_default()
            .max(MIN_LOAD_REPORTING_INTERVAL);

        Self { clusters, interval }
    }
}

fn to_proto_duration(d: Duration) -> protobuf::Duration {
    protobuf::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

// None if the duration doesn't fit.
fn from_proto_duration(d: &protobuf::Duration) -> Option<Duration> {
    let seconds = Duration::from_secs(d.seconds.max(0) as u64);
    let nanos = Duration::from_nanos(d.nanos.max(0) as u64);
    seconds.checked_add(nanos)
}

#[derive(Debug, thiserror::Error)]
enum LrsError {
    #[error(transparent)]
    Connect(#[from] tonic::transport::Error),

    #[error(transparent)]
    Status(#[from] tonic::Status),

    #[error("LRS server closed the stream")]
    Disconnected,
}

/// The IO half of load reporting. Runs a single LRS stream to one server,
/// reconnecting with backoff.
pub(crate) struct LrsTask {
    server_uri: String,
    endpoint: Endpoint,
    node: xds_core::Node,
    store: Arc<LoadReportStore>,
    backoff: Backoff,
}

impl LrsTask {
    pub(crate) fn new(
        server_uri: &str,
        node: xds_core::Node,
        store: Arc<LoadReportStore>,
        backoff: BackoffConfig,
    ) -> Result<Self, tonic::transport::Error> {
        let endpoint = Endpoint::from_shared(server_uri.to_string())?
            .connect_timeout(Duration::from_secs(5))
            .tcp_nodelay(true);

        Ok(Self {
            server_uri: server_uri.to_string(),
            endpoint,
            node,
            store,
            backoff: Backoff::new(backoff),
        })
    }

    pub(crate) async fn run(mut self) {
        loop {
            let mut received_response = false;
            let err = match self.run_stream(&mut received_response).await {
                Ok(()) => return,
                Err(e) => e,
            };

            match &err {
                LrsError::Status(status)
                    if unwrap_io_error(status)
                        .is_some_and(|e| e.kind() == std::io::ErrorKind::BrokenPipe) =>
                {
                    tracing::trace!(server = %self.server_uri, %err, "LRS stream closed")
                }
                _ => tracing::debug!(server = %self.server_uri, %err, "LRS stream closed"),
            }

            if received_response {
                self.backoff.reset();
                continue;
            }
            tokio::time::sleep(self.backoff.next_backoff()).await;
        }
    }

    async fn run_stream(&mut self, received_response: &mut bool) -> Result<(), LrsError> {
        let (tx, rx) = mpsc::channel(4);

        let channel = self.endpoint.connect().await?;
        let mut client = LoadReportingServiceClient::new(channel);

        let initial = LoadStatsRequest {
            node: Some(self.node.clone()),
            cluster_stats: vec![],
        };
        tx.send(initial).await.map_err(|_| LrsError::Disconnected)?;

        let mut incoming = client
            .stream_load_stats(ReceiverStream::new(rx))
            .await?
            .into_inner();

        // nothing gets reported until the server says what it wants.
        let Some(response) = incoming.message().await? else {
            return Err(LrsError::Disconnected);
        };
        *received_response = true;
        let mut config = ReportingConfig::from_response(&response);
        tracing::debug!(server = %self.server_uri, ?config, "starting load reports");

        let mut next_report = tokio::time::Instant::now() + config.interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_report) => {
                    let now = tokio::time::Instant::now();
                    let cluster_stats = self.store.report(&config.clusters, now.into_std());
                    tracing::trace!(server = %self.server_uri, clusters = cluster_stats.len(), "sending load report");

                    let request = LoadStatsRequest {
                        node: None,
                        cluster_stats,
                    };
                    tx.send(request).await.map_err(|_| LrsError::Disconnected)?;
                    next_report = now + config.interval;
                }
                response = incoming.message() => {
                    let Some(response) = response? else {
                        return Err(LrsError::Disconnected);
                    };
                    let new_config = ReportingConfig::from_response(&response);
                    if new_config.interval != config.interval {
                        next_report = tokio::time::Instant::now() + new_config.interval;
                    }
                    tracing::debug!(server = %self.server_uri, config = ?new_config, "updated load reporting config");
                    config = new_config;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn locality(region: &str) -> Locality {
        Locality::new(region, "", "")
    }

    fn wanted(names: &[&str]) -> ReportedClusters {
        ReportedClusters::Only(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_reporting_config() {
        let config = ReportingConfig::from_response(&LoadStatsResponse {
            clusters: vec!["cluster-a".to_string()],
            send_all_clusters: false,
            load_reporting_interval: Some(protobuf::Duration {
                seconds: 0,
                nanos: 100_000_000,
            }),
            ..Default::default()
        });
        assert_eq!(
            config,
            ReportingConfig {
                clusters: wanted(&["cluster-a"]),
                interval: MIN_LOAD_REPORTING_INTERVAL,
            }
        );

        let config = ReportingConfig::from_response(&LoadStatsResponse {
            send_all_clusters: true,
            load_reporting_interval: Some(protobuf::Duration {
                seconds: 10,
                nanos: 0,
            }),
            ..Default::default()
        });
        assert_eq!(config.clusters, ReportedClusters::All);
        assert_eq!(config.interval, Duration::from_secs(10));

        // an interval too large to represent falls back to the minimum
        let config = ReportingConfig::from_response(&LoadStatsResponse {
            send_all_clusters: true,
            load_reporting_interval: Some(protobuf::Duration {
                seconds: i64::MAX,
                nanos: i32::MAX,
            }),
            ..Default::default()
        });
        assert_eq!(config.interval, MIN_LOAD_REPORTING_INTERVAL);
    }

    #[test]
    fn test_report_and_reset() {
        let start = Instant::now();
        let store = LoadReportStore::default();
        let stats = store.cluster_stats("cluster-a", "service-a", start);

        let east = stats.locality(&locality("us-east-1"));
        east.call_started();
        east.call_started();
        east.call_started();
        east.call_finished(true);
        east.call_finished(false);

        stats.add_drop(Some("lb"));
        stats.add_drop(Some("lb"));
        stats.add_drop(Some("throttle"));
        stats.add_drop(None);

        let reports = store.report(&ReportedClusters::All, start + Duration::from_secs(5));
        assert_eq!(reports.len(), 1);

        let report = &reports[0];
        assert_eq!(report.cluster_name, "cluster-a");
        assert_eq!(report.cluster_service_name, "service-a");
        assert_eq!(report.total_dropped_requests, 4);
        assert_eq!(
            report.dropped_requests,
            vec![
                xds_endpoint::cluster_stats::DroppedRequests {
                    category: "lb".to_string(),
                    dropped_count: 2,
                },
                xds_endpoint::cluster_stats::DroppedRequests {
                    category: "throttle".to_string(),
                    dropped_count: 1,
                },
            ]
        );
        assert_eq!(
            report.load_report_interval,
            Some(protobuf::Duration {
                seconds: 5,
                nanos: 0
            })
        );

        let locality_stats = &report.upstream_locality_stats[0];
        assert_eq!(locality_stats.total_issued_requests, 3);
        assert_eq!(locality_stats.total_successful_requests, 1);
        assert_eq!(locality_stats.total_error_requests, 1);
        assert_eq!(locality_stats.total_requests_in_progress, 1);

        // counters reset, but in-progress calls keep getting reported
        let reports = store.report(&ReportedClusters::All, start + Duration::from_secs(10));
        let locality_stats = &reports[0].upstream_locality_stats[0];
        assert_eq!(reports[0].total_dropped_requests, 0);
        assert_eq!(locality_stats.total_issued_requests, 0);
        assert_eq!(locality_stats.total_requests_in_progress, 1);
    }

    #[test]
    fn test_only_requested_clusters() {
        let now = Instant::now();
        let store = LoadReportStore::default();
        let a = store.cluster_stats("cluster-a", "", now);
        let b = store.cluster_stats("cluster-b", "", now);
        a.add_drop(None);
        b.add_drop(None);

        let reports = store.report(&wanted(&["cluster-b"]), now);
        let names: Vec<_> = reports.iter().map(|r| r.cluster_name.as_str()).collect();
        assert_eq!(names, vec!["cluster-b"]);

        // cluster-a's drop is still waiting to be reported
        let reports = store.report(&ReportedClusters::All, now);
        let names: Vec<_> = reports.iter().map(|r| r.cluster_name.as_str()).collect();
        assert_eq!(names, vec!["cluster-a"]);
    }

    #[test]
    fn test_unreferenced_stats_report_once_more() {
        let now = Instant::now();
        let store = LoadReportStore::default();

        let stats = store.cluster_stats("cluster-a", "", now);
        stats.add_drop(Some("lb"));
        drop(stats);

        let reports = store.report(&ReportedClusters::All, now);
        assert_eq!(reports.len(), 1);

        // the entry is gone, so asking again starts from scratch
        assert!(store.report(&ReportedClusters::All, now).is_empty());
        let stats = store.cluster_stats("cluster-a", "", now);
        assert_eq!(Arc::strong_count(&stats), 2);
    }

    #[test]
    fn test_shared_stats() {
        let now = Instant::now();
        let store = LoadReportStore::default();

        let a = store.cluster_stats("cluster-a", "service-a", now);
        let b = store.cluster_stats("cluster-a", "service-a", now);
        assert!(Arc::ptr_eq(&a, &b));

        let c = store.cluster_stats("cluster-a", "service-b", now);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
