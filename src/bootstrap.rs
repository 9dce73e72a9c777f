// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The dial-handler capability: opening transport connections to the
//! configured endpoint.
//!
//! Bootstrap name resolution lives behind [`DialHandler`] so that the
//! upstream itself never resolves names through the DNS path it is a part
//! of. The built-in [`BootstrapResolver`] uses the system resolver via
//! [`tokio::net::lookup_host`]; embedders with their own bootstrap supply a
//! [`DialHandlerFactory`] through
//! [`UpstreamOptions::dialer_factory`](crate::UpstreamOptions::dialer_factory).

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use url::Url;

use crate::error::{ErrorKind, Result};
use crate::DEFAULT_PORT_DOH;

/// The transport-layer network a dial should use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    /// TCP, for TLS and HTTP/2
    Tcp,
    /// UDP, for QUIC and HTTP/3
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

/// An open transport-layer connection returned by a [`DialHandler`].
#[derive(Debug)]
pub enum DialedConn {
    /// A connected TCP stream
    Tcp(TcpStream),
    /// A connected UDP socket
    Udp(UdpSocket),
}

/// Opens a connection to the upstream endpoint.
///
/// An empty `address` means "the endpoint this handler was created for";
/// the handler performs any bootstrap resolution itself. A non-empty
/// `address` must be a socket address and is dialed as-is.
pub trait DialHandler: Send + Sync {
    /// Dial `address` (or the configured endpoint) over `network`.
    fn dial(&self, network: Network, address: &str) -> BoxFuture<'static, io::Result<DialedConn>>;
}

/// Yields a fresh [`DialHandler`] for each transport construction, giving
/// the bootstrap a chance to re-resolve the endpoint.
pub trait DialHandlerFactory: Send + Sync {
    /// Create a handler for the configured endpoint.
    fn handler(&self) -> BoxFuture<'static, Result<Arc<dyn DialHandler>>>;
}

/// The built-in dial handler: resolves the endpoint host with the system
/// resolver and connects to the first address.
#[derive(Clone, Debug)]
pub struct BootstrapResolver {
    host: String,
    port: u16,
}

impl BootstrapResolver {
    /// Creates a resolver-backed dialer for `url`'s host and port.
    pub fn new(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| ErrorKind::InvalidUrl(format!("{url}: missing host")))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT_DOH),
        })
    }

    async fn resolve(host: String, port: u16, address: String) -> io::Result<SocketAddr> {
        if !address.is_empty() {
            return address
                .parse()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{address}: {e}")));
        }

        lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {host}"),
                )
            })
    }
}

impl DialHandler for BootstrapResolver {
    fn dial(&self, network: Network, address: &str) -> BoxFuture<'static, io::Result<DialedConn>> {
        let host = self.host.clone();
        let port = self.port;
        let address = address.to_string();

        Box::pin(async move {
            let remote = Self::resolve(host, port, address).await?;
            match network {
                Network::Tcp => Ok(DialedConn::Tcp(TcpStream::connect(remote).await?)),
                Network::Udp => {
                    let bind: SocketAddr = if remote.is_ipv4() {
                        ([0, 0, 0, 0], 0).into()
                    } else {
                        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                    };
                    let socket = UdpSocket::bind(bind).await?;
                    socket.connect(remote).await?;
                    Ok(DialedConn::Udp(socket))
                }
            }
        })
    }
}

impl DialHandlerFactory for BootstrapResolver {
    fn handler(&self) -> BoxFuture<'static, Result<Arc<dyn DialHandler>>> {
        let handler = self.clone();
        Box::pin(async move { Ok(Arc::new(handler) as Arc<dyn DialHandler>) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_takes_host_and_port() {
        let url = Url::parse("https://dns.example:8443/dns-query").unwrap();
        let dialer = BootstrapResolver::new(&url).unwrap();
        assert_eq!(dialer.host, "dns.example");
        assert_eq!(dialer.port, 8443);

        let url = Url::parse("https://dns.example/dns-query").unwrap();
        let dialer = BootstrapResolver::new(&url).unwrap();
        assert_eq!(dialer.port, DEFAULT_PORT_DOH);
    }

    #[test]
    fn test_ipv6_hosts_lose_their_brackets() {
        let url = Url::parse("https://[2001:db8::1]/dns-query").unwrap();
        let dialer = BootstrapResolver::new(&url).unwrap();
        assert_eq!(dialer.host, "2001:db8::1");
    }

    #[tokio::test]
    async fn test_explicit_address_must_be_socket_addr() {
        let url = Url::parse("https://dns.example/dns-query").unwrap();
        let dialer = BootstrapResolver::new(&url).unwrap();

        let err = dialer
            .dial(Network::Udp, "not-an-address")
            .await
            .expect_err("dial should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
