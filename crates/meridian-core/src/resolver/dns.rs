//! Name resolution for logical DNS clusters.

use std::net::SocketAddr;

use futures::future::BoxFuture;

/// Resolves a hostname to a list of addresses.
///
/// Logical DNS clusters re-resolve whenever their LB policy asks for it, so
/// implementations shouldn't cache answers for long.
pub trait NameResolver: Send + Sync + 'static {
    fn resolve(&self, hostname: &str, port: u16) -> BoxFuture<'static, std::io::Result<Vec<SocketAddr>>>;
}

/// Resolves names with the system resolver through [tokio::net::lookup_host].
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

impl NameResolver for DnsResolver {
    fn resolve(&self, hostname: &str, port: u16) -> BoxFuture<'static, std::io::Result<Vec<SocketAddr>>> {
        let target = format!("{hostname}:{port}");
        Box::pin(async move {
            let addrs: Vec<_> = tokio::net::lookup_host(target).await?.collect();
            if addrs.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses found",
                ));
            }
            Ok(addrs)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let addrs = DnsResolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
    }
}
