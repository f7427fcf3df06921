//! Meridian xDS.
//!
//! This module contains the ADS half of the client: one [AdsTask] per xDS
//! server, each driving a SotW Aggregated Discovery Service stream and owning
//! the [cache] of every resource subscribed through that server.
//!
//! The stateful internals are written in a sans-io way as much as possible to
//! make it easier to test and verify the complexity of ADS. Resource state and
//! watchers live in the [Cache], and an [AdsConnection] wraps a cache for the
//! duration of a single stream, turning responses and subscription changes
//! into outgoing requests.
//!
//! An [AdsTask] is the actual io in this module. It connects, runs a new
//! [AdsConnection] every time it reconnects, and handles subscription changes
//! while it's disconnected.

use std::{io::ErrorKind, time::Duration};

use enum_map::EnumMap;
use futures::{FutureExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{transport::Endpoint, Streaming};
use xds_api::pb::{
    envoy::{
        config::core::v3 as xds_core,
        service::discovery::v3::{
            aggregated_discovery_service_client::AggregatedDiscoveryServiceClient,
            DiscoveryRequest, DiscoveryResponse,
        },
    },
    google::rpc::Status as GrpcStatus,
};

mod backoff;
pub(crate) use backoff::Backoff;

mod cache;
pub use cache::{CacheStatus, XdsConfig, XdsError};
pub(crate) use cache::{Cache, CacheReader, CacheReaders};

pub(crate) mod csds;

pub(crate) mod name;

mod resources;
pub(crate) use resources::ResourceValue;
pub use resources::{Resource, ResourceType, ResourceVersion};

mod timer;
pub(crate) use timer::Timers;

mod watch;
pub use watch::{ResourceEvent, ResourceWatcher};
pub(crate) use watch::{WatchEvent, WatchHandle, WatchSender, WatcherId};


use crate::bootstrap::{XdsClientConfig, XdsServer};

/// A change to the set of watched resources.
#[derive(Debug)]
pub(crate) enum SubscriptionUpdate {
    Watch {
        id: WatcherId,
        resource_type: ResourceType,
        name: String,
        tx: WatchSender,
    },
    Unwatch {
        id: WatcherId,
        resource_type: ResourceType,
        name: String,
    },
}

/// The IO-doing, gRPC adjacent part of running an ADS client.
pub(crate) struct AdsTask {
    server_uri: String,
    endpoint: Endpoint,
    node: xds_core::Node,
    cache: Cache,
    subs: mpsc::UnboundedReceiver<SubscriptionUpdate>,
    backoff: Backoff,
}

macro_rules! log_request {
    ($request:expr) => {
        tracing::debug!(
            nack = $request.error_detail.is_some(),
            "DiscoveryRequest(n={:?}, ty={:?}, v={:?}, r={:?})",
            $request.response_nonce,
            $request.type_url,
            $request.version_info,
            $request.resource_names,
        );
    };
}

macro_rules! log_response {
    ($response:expr) => {
        tracing::debug!(
            "DiscoveryResponse(n={:?}, ty={:?}, v={:?}, resources={})",
            $response.nonce,
            $response.type_url,
            $response.version_info,
            $response.resources.len(),
        );
    };
}

pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl AdsTask {
    /// Create a new task for a server, returning the task and the sender that
    /// feeds it subscription updates.
    ///
    /// This doesn't start any background work. Call [run][AdsTask::run] on
    /// the returned task to do that.
    pub(crate) fn new(
        server: &XdsServer,
        node: xds_core::Node,
        config: &XdsClientConfig,
    ) -> Result<(mpsc::UnboundedSender<SubscriptionUpdate>, AdsTask), tonic::transport::Error> {
        let endpoint = Endpoint::from_shared(server.server_uri.clone())?
            .connect_timeout(Duration::from_secs(5))
            .tcp_nodelay(true);

        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        let cache = Cache::new(config.resource_timeout, server.ignore_resource_deletion());

        let task = AdsTask {
            server_uri: server.server_uri.clone(),
            endpoint,
            node,
            cache,
            subs: sub_rx,
            backoff: Backoff::new(config.backoff.clone()),
        };

        Ok((sub_tx, task))
    }

    pub(crate) fn reader(&self) -> CacheReader {
        self.cache.reader()
    }

    /// Run until every subscription sender has been dropped, reconnecting
    /// forever on errors.
    pub(crate) async fn run(mut self) {
        loop {
            let mut received_response = false;
            let result = self.run_connection(&mut received_response).await;

            // resources can't time out while there's no stream
            self.cache.stop_timers();

            let err = match result {
                Ok(()) => return,
                Err(e) => e,
            };

            // The stream closed with a Tonic error. This is usually either a
            // broken pipe or some other kind of IO error. There's nothing to
            // do here but log it and try again.
            match &err {
                ConnectionError::Status(status)
                    if unwrap_io_error(status).is_some_and(|e| e.kind() == ErrorKind::BrokenPipe) =>
                {
                    tracing::trace!(server = %self.server_uri, err = %err, "ADS connection closed")
                }
                _ => tracing::debug!(server = %self.server_uri, err = %err, "ADS connection closed"),
            }

            // a stream that got far enough to hear from the server reconnects
            // immediately. one that didn't backs off and tells anyone waiting
            // on a resource that something is wrong.
            if received_response {
                self.backoff.reset();
                continue;
            }

            self.cache
                .report_connection_error(&format!("xDS stream error: {err}"));

            let wait = self.backoff.next_backoff();
            tracing::trace!(server = %self.server_uri, ?wait, "reconnecting after backoff");
            if !self.wait_disconnected(wait).await {
                return;
            }
        }
    }

    // handle subscription updates while there's no stream. returns false if
    // the task should shut down.
    async fn wait_disconnected(&mut self, wait: Duration) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                update = self.subs.recv() => match update {
                    Some(update) => handle_subscription_update(&mut self.cache, update),
                    None => return false,
                },
            }
        }
    }

    async fn run_connection(&mut self, received_response: &mut bool) -> Result<(), ConnectionError> {
        let (xds_tx, xds_rx) = mpsc::channel(ResourceType::all().len() * 2);

        let channel = self.endpoint.connect().await?;
        let mut client = AggregatedDiscoveryServiceClient::new(channel);

        // queue up the initial requests before starting the stream. some
        // servers won't respond with headers until the first request arrives.
        let (mut conn, initial_requests) =
            AdsConnection::new(self.node.clone(), &mut self.cache, now());
        for msg in initial_requests {
            log_request!(msg);
            if xds_tx.send(msg).await.is_err() {
                return Err(ConnectionError::AdsDisconnected);
            }
        }

        let stream_response = client
            .stream_aggregated_resources(ReceiverStream::new(xds_rx))
            .await?;
        let mut incoming = stream_response.into_inner();

        loop {
            tracing::trace!("handle_update_batch");
            let is_eof =
                handle_update_batch(&mut conn, &mut self.subs, &mut incoming, received_response)
                    .await?;
            if is_eof {
                return Ok(());
            }

            for msg in conn.outgoing(now()) {
                log_request!(msg);
                if xds_tx.send(msg).await.is_err() {
                    return Err(ConnectionError::AdsDisconnected);
                }
            }
        }
    }
}

// handle a batch of incoming messages/subscriptions/timers.
//
// awaits until an update is recvd from any input, and then immediately grabs
// any pending updates as well. returns as soon as there's nothing to
// immediately do and handling updates would block.
async fn handle_update_batch(
    conn: &mut AdsConnection<'_>,
    subs: &mut mpsc::UnboundedReceiver<SubscriptionUpdate>,
    incoming: &mut Streaming<DiscoveryResponse>,
    received_response: &mut bool,
) -> Result<bool, ConnectionError> {
    // handle the next possible input. runs a biased select over gRPC,
    // subscription, and timer inputs.
    //
    // this function is inlined here because abstracting a handle_batch method
    // over a bunch of mut references is miserable, and there's no reason to
    // run it by itself.
    async fn next_update(
        conn: &mut AdsConnection<'_>,
        subs: &mut mpsc::UnboundedReceiver<SubscriptionUpdate>,
        incoming: &mut Streaming<DiscoveryResponse>,
        received_response: &mut bool,
    ) -> Result<bool, ConnectionError> {
        let deadline = conn.next_deadline();
        let timer = async move {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => futures::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            xds_msg = incoming.try_next() => {
                // on GRPC status errors, the connection has died and we're
                // going to reconnect. pass the error up to reset things
                // and move on.
                let response = match xds_msg? {
                    Some(response) => response,
                    None => return Err(ConnectionError::AdsDisconnected),
                };
                log_response!(response);

                *received_response = true;
                conn.handle_response(response);
            }
            sub_update = subs.recv() => {
                let Some(sub_update) = sub_update else {
                    return Ok(true)
                };

                tracing::trace!(?sub_update, "ads connection: handle_subscription_update");
                conn.handle_subscription_update(sub_update);
            }
            _ = timer => {
                conn.handle_timeout(now());
            }
        }
        Ok(false)
    }

    // await the next update
    if next_update(conn, subs, incoming, received_response).await? {
        return Ok(true);
    }

    // try to handle any immediately pending updates. do not await, there is
    // probably some work to be done to handle effects now, so we should
    // return back to the caller.
    loop {
        let Some(should_exit) = next_update(conn, subs, incoming, received_response).now_or_never()
        else {
            break;
        };

        if should_exit? {
            return Ok(true);
        }
    }

    Ok(false)
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error(transparent)]
    Connect(#[from] tonic::transport::Error),

    #[error(transparent)]
    Status(#[from] tonic::Status),

    #[error("ADS server closed the stream")]
    AdsDisconnected,
}

/// Returns `true` if this tonic [Status] was caused by a [std::io::Error].
///
/// Adapted from the `tonic` examples.
///
/// https://github.com/hyperium/tonic/blob/941726cc46b995dcc393c9d2b462d440bd3514f3/examples/src/streaming/server.rs#L15
pub(crate) fn unwrap_io_error(status: &tonic::Status) -> Option<&std::io::Error> {
    let mut err: &(dyn std::error::Error + 'static) = status;

    loop {
        if let Some(e) = err.downcast_ref::<std::io::Error>() {
            return Some(e);
        }

        // https://github.com/hyperium/h2/pull/462
        if let Some(e) = err.downcast_ref::<h2::Error>().and_then(|e| e.get_io()) {
            return Some(e);
        }

        err = err.source()?;
    }
}

fn handle_subscription_update(cache: &mut Cache, update: SubscriptionUpdate) {
    match update {
        SubscriptionUpdate::Watch {
            id,
            resource_type,
            name,
            tx,
        } => cache.watch(resource_type, &name, id, tx),
        SubscriptionUpdate::Unwatch {
            id,
            resource_type,
            name,
        } => cache.unwatch(resource_type, &name, id),
    }
}

/// The state of a single ADS stream.
struct AdsConnection<'a> {
    cache: &'a mut Cache,
    node: Option<xds_core::Node>,
    // the last nonce received for each type
    nonces: EnumMap<ResourceType, String>,
    // whether a request for each type has been sent on this stream
    requested: EnumMap<ResourceType, bool>,
    acks: EnumMap<ResourceType, Option<AckState>>,
    unknown_types: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct AckState {
    nonce: String,
    error: Option<String>,
}

impl AckState {
    fn into_ack(self) -> (String, Option<GrpcStatus>) {
        let nonce = self.nonce;
        let error = self.error.map(|message| GrpcStatus {
            message,
            code: tonic::Code::InvalidArgument.into(),
            ..Default::default()
        });

        (nonce, error)
    }
}

impl<'a> AdsConnection<'a> {
    /// Start a new stream, returning the requests that subscribe to every
    /// resource the cache is already tracking.
    fn new(
        node: xds_core::Node,
        cache: &'a mut Cache,
        now: std::time::Instant,
    ) -> (Self, Vec<DiscoveryRequest>) {
        // everything dirty goes out as part of the initial requests
        cache.take_dirty();

        let mut conn = Self {
            cache,
            node: Some(node),
            nonces: Default::default(),
            requested: Default::default(),
            acks: Default::default(),
            unknown_types: Vec::new(),
        };

        let mut requests = Vec::with_capacity(ResourceType::all().len());
        for &rtype in ResourceType::all() {
            if !conn.cache.has_subscriptions(rtype) {
                continue;
            }
            requests.push(conn.request(rtype, String::new(), None, now));
        }

        (conn, requests)
    }

    fn next_deadline(&mut self) -> Option<std::time::Instant> {
        self.cache.next_deadline()
    }

    fn handle_timeout(&mut self, now: std::time::Instant) {
        self.cache.handle_timeout(now);
    }

    fn outgoing(&mut self, now: std::time::Instant) -> Vec<DiscoveryRequest> {
        let mut requests = Vec::with_capacity(ResourceType::all().len());

        // tee up invalid type messages.
        //
        // this should be a hyper rare ocurrence, so `take` the vec to reset the
        // allocation to nothing instead of `drain` which keeps the capacity.
        for (response_nonce, type_url) in std::mem::take(&mut self.unknown_types) {
            let error_detail = Some(GrpcStatus {
                code: tonic::Code::InvalidArgument.into(),
                message: "unknown type".to_string(),
                ..Default::default()
            });
            requests.push(DiscoveryRequest {
                node: self.node.take(),
                type_url,
                response_nonce,
                error_detail,
                ..Default::default()
            })
        }

        let dirty = self.cache.take_dirty();
        for &rtype in ResourceType::all() {
            let ack = self.acks[rtype].take();

            // never send an empty list as the first request for a type on a
            // stream. the server would read it as a wildcard subscription.
            let changed = dirty[rtype] && (self.requested[rtype] || self.cache.has_subscriptions(rtype));
            if ack.is_none() && !changed {
                continue;
            }

            let (nonce, error) = match ack {
                Some(ack) => ack.into_ack(),
                None => (self.nonces[rtype].clone(), None),
            };
            requests.push(self.request(rtype, nonce, error, now));
        }

        requests
    }

    fn request(
        &mut self,
        rtype: ResourceType,
        response_nonce: String,
        error_detail: Option<GrpcStatus>,
        now: std::time::Instant,
    ) -> DiscoveryRequest {
        self.requested[rtype] = true;
        self.cache.start_timers(rtype, now);

        DiscoveryRequest {
            node: self.node.take(),
            type_url: rtype.type_url().to_string(),
            resource_names: self.cache.subscriptions(rtype),
            version_info: self.cache.acked_version(rtype).to_string(),
            response_nonce,
            error_detail,
        }
    }

    fn handle_response(&mut self, response: DiscoveryResponse) {
        let Some(rtype) = ResourceType::from_type_url(&response.type_url) else {
            tracing::trace!(type_url = %response.type_url, "unknown type url");
            self.unknown_types.push((response.nonce, response.type_url));
            return;
        };

        self.nonces[rtype] = response.nonce.clone();

        let resources = response
            .resources
            .into_iter()
            .map(|any| rtype.decode(any))
            .collect();
        let errors = self
            .cache
            .handle_response(rtype, response.version_info.clone().into(), resources);

        let error = errors.nack_message();
        if let Some(error) = &error {
            tracing::warn!(
                type_url = %response.type_url,
                version = %response.version_info,
                nonce = %response.nonce,
                err = %error,
                "rejecting xDS response",
            );
        }

        self.acks[rtype] = Some(AckState {
            nonce: response.nonce,
            error,
        });
    }

    fn handle_subscription_update(&mut self, update: SubscriptionUpdate) {
        handle_subscription_update(self.cache, update)
    }
}
