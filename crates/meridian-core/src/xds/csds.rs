//! A server for [CSDS][csds].
//!
//! [csds]: https://www.envoyproxy.io/docs/envoy/latest/api-v3/service/status/v3/csds.proto

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
};

use futures::Stream;
use tonic::{Request, Response, Status, Streaming};
use xds_api::pb::envoy::{
    admin::v3::ClientResourceStatus,
    service::status::v3::{
        client_config::GenericXdsConfig,
        client_status_discovery_service_server::{
            ClientStatusDiscoveryService, ClientStatusDiscoveryServiceServer,
        },
        ClientConfig, ClientStatusRequest, ClientStatusResponse,
    },
};

use crate::xds::{CacheReaders, CacheStatus, XdsConfig};

/// An error starting or running a CSDS server.
#[derive(Debug, thiserror::Error)]
pub enum CsdsError {
    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

/// Run a CSDS server listening on `localhost` at the given port.
pub(crate) async fn local_server(caches: CacheReaders, port: u16) -> Result<(), CsdsError> {
    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(xds_api::FILE_DESCRIPTOR_SET)
        .with_service_name("envoy.service.status.v3.ClientStatusDiscoveryService")
        .build()?;

    tracing::info!(%socket_addr, "starting CSDS server");
    tonic::transport::Server::builder()
        .add_service(reflection)
        .add_service(ClientStatusDiscoveryServiceServer::new(Server { caches }))
        .serve(socket_addr)
        .await?;

    Ok(())
}

/// A CSDS Server that exposes the current state of a client's caches.
///
/// Unlike a standard CSDS server, this server only has a single node worth of
/// config to expose. Because there is no reasonable way to interpret a node
/// matcher, any request that sets `node_matchers` will return an error.
struct Server {
    caches: CacheReaders,
}

type ClientStatusResponseStream =
    Pin<Box<dyn Stream<Item = Result<ClientStatusResponse, Status>> + Send>>;

#[tonic::async_trait]
impl ClientStatusDiscoveryService for Server {
    type StreamClientStatusStream = ClientStatusResponseStream;

    async fn stream_client_status(
        &self,
        _request: Request<Streaming<ClientStatusRequest>>,
    ) -> Result<Response<Self::StreamClientStatusStream>, Status> {
        return Err(Status::unimplemented(
            "streaming client status is not supported",
        ));
    }

    async fn fetch_client_status(
        &self,
        request: Request<ClientStatusRequest>,
    ) -> Result<Response<ClientStatusResponse>, Status> {
        let request = request.into_inner();

        if !request.node_matchers.is_empty() {
            return Err(Status::invalid_argument(
                "node_matchers are unsupported for a single client CSDS endpoint",
            ));
        }

        Ok(Response::new(client_status(request.node, &self.caches)))
    }
}

fn client_status(
    node: Option<xds_api::pb::envoy::config::core::v3::Node>,
    caches: &CacheReaders,
) -> ClientStatusResponse {
    let generic_xds_configs = caches.iter_xds().map(to_generic_config).collect();

    ClientStatusResponse {
        config: vec![ClientConfig {
            node,
            generic_xds_configs,
            ..Default::default()
        }],
    }
}

/// Convert a cache entry to an xDS generic config.
///
/// A resource that was rejected but still has a previously accepted value is
/// reported as NACKed along with that value. A resource the server removed
/// but that's kept around anyway reports as not existing, also with its last
/// value.
pub(crate) fn to_generic_config(config: XdsConfig) -> GenericXdsConfig {
    let client_status = match config.status {
        CacheStatus::Requested => ClientResourceStatus::Requested,
        CacheStatus::Acked => ClientResourceStatus::Acked,
        CacheStatus::Nacked | CacheStatus::NackedButCached => ClientResourceStatus::Nacked,
        CacheStatus::DoesNotExist | CacheStatus::DoesNotExistButCached => {
            ClientResourceStatus::DoesNotExist
        }
    };

    GenericXdsConfig {
        type_url: config.type_url,
        name: config.name,
        version_info: config.version.to_string(),
        xds_config: config.xds,
        client_status: client_status.into(),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use std::time::SystemTime;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::xds::{ResourceType, XdsError};

    fn config(name: &str, status: CacheStatus) -> XdsConfig {
        XdsConfig {
            name: name.to_string(),
            type_url: ResourceType::Cluster.type_url().to_string(),
            version: "3".into(),
            status,
            xds: None,
            last_updated: None,
            last_error: None,
        }
    }

    #[test]
    fn test_status_mapping() {
        let statuses = [
            (CacheStatus::Requested, ClientResourceStatus::Requested),
            (CacheStatus::Acked, ClientResourceStatus::Acked),
            (CacheStatus::Nacked, ClientResourceStatus::Nacked),
            (CacheStatus::NackedButCached, ClientResourceStatus::Nacked),
            (CacheStatus::DoesNotExist, ClientResourceStatus::DoesNotExist),
            (CacheStatus::DoesNotExistButCached, ClientResourceStatus::DoesNotExist),
        ];

        for (status, expected) in statuses {
            let generic = to_generic_config(config("cluster-a", status));
            assert_eq!(generic.client_status, i32::from(expected), "{status:?}");
        }
    }

    #[test]
    fn test_generic_config_fields() {
        let mut c = config("cluster-a", CacheStatus::NackedButCached);
        c.last_error = Some(XdsError {
            version: "4".into(),
            message: "bad cluster".to_string(),
            time: SystemTime::now(),
        });

        let generic = to_generic_config(c);
        assert_eq!(generic.name, "cluster-a");
        assert_eq!(generic.version_info, "3");
        assert_eq!(generic.type_url, ResourceType::Cluster.type_url());
    }

    #[test]
    fn test_empty_client_status() {
        let resp = client_status(None, &CacheReaders::default());
        assert_eq!(resp.config.len(), 1);
        assert!(resp.config[0].generic_xds_configs.is_empty());
    }
}
