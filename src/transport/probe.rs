// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The HTTP/3 probe: decide whether QUIC beats TLS to this endpoint right
//! now.
//!
//! Both handshakes run concurrently against the same endpoint and the
//! first to report wins the race. The outcome holds for the lifetime of
//! the client instance built from it; a client reset re-runs the probe.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use quinn::{Endpoint, VarInt};
use rustls::pki_types::ServerName;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::bootstrap::{DialHandler, DialedConn, Network};
use crate::error::{Error, ErrorKind, Result};
use crate::transport::Connector;
use crate::DIAL_TIMEOUT;

/// Resolves the UDP address of the endpoint and, when the configuration
/// also allows TCP-based HTTP, races a QUIC handshake against a TLS
/// handshake. Returns the address HTTP/3 should dial, or an error when
/// HTTP/3 lost (or never entered) the race.
pub(crate) async fn probe_h3(
    connector: &Connector,
    dialer: &Arc<dyn DialHandler>,
) -> Result<SocketAddr> {
    if !connector.supports_h3() {
        return Err(ErrorKind::H3NotEnabled.into());
    }

    let conn = dialer
        .dial(Network::Udp, "")
        .await
        .map_err(|e| ErrorKind::Bootstrap {
            addr: connector.addr_redacted.clone(),
            source: e,
        })?;
    let DialedConn::Udp(udp) = conn else {
        return Err(ErrorKind::Msg(format!(
            "not a UDP connection to {}",
            connector.addr_redacted
        ))
        .into());
    };
    // only the resolved remote address is needed; the socket was a probe
    let remote = udp.peer_addr()?;
    drop(udp);

    if connector.supports_h3() && !connector.supports_http() {
        return Ok(remote);
    }

    let probe_timeout = connector.timeout.unwrap_or(DIAL_TIMEOUT);
    let server_name = connector.tls.server_name().to_string();

    // probes get a config without the session cache or custom verifiers,
    // so they cannot disturb long-lived session state
    let probe_tls = connector.tls.probe_config()?;
    let quic_config = connector
        .quic_template()
        .probe_client_config(probe_tls.clone())?;

    let (quic_tx, quic_rx) = oneshot::channel();
    let (tls_tx, tls_rx) = oneshot::channel();

    {
        let server_name = server_name.clone();
        let addr_redacted = connector.addr_redacted.clone();
        tokio::spawn(async move {
            let result = probe_quic(remote, server_name, quic_config, probe_timeout).await;
            let _ = quic_tx.send(result.map_err(|e| {
                Error::from(ErrorKind::Msg(format!(
                    "opening quic connection to {addr_redacted}: {e}"
                )))
            }));
        });
    }
    {
        let dialer = Arc::clone(dialer);
        tokio::spawn(async move {
            let result = probe_tls_handshake(dialer, server_name, probe_tls, probe_timeout).await;
            let _ = tls_tx.send(result);
        });
    }

    tokio::select! {
        quic = quic_rx => match quic {
            Ok(Ok(())) => Ok(remote),
            Ok(Err(err)) => Err(err),
            // the probe task never drops its sender without sending
            Err(_) => Err(ErrorKind::Message("quic probe disappeared").into()),
        },
        tls = tls_rx => match tls {
            Ok(Ok(())) => Err(ErrorKind::TlsFaster.into()),
            Ok(Err(err)) => {
                debug!(error = %err, "probing tls");
                Ok(remote)
            }
            Err(_) => Ok(remote),
        },
    }
}

async fn probe_quic(
    remote: SocketAddr,
    server_name: String,
    config: quinn::ClientConfig,
    probe_timeout: std::time::Duration,
) -> Result<()> {
    let start = Instant::now();

    let bind: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(config);

    let connecting = endpoint.connect(remote, &server_name)?;
    let conn = match timeout(probe_timeout, connecting).await {
        Ok(conn) => conn?,
        Err(_) => {
            return Err(ErrorKind::Timeout {
                elapsed: start.elapsed(),
            }
            .into());
        }
    };
    conn.close(VarInt::from_u32(0), b"");

    debug!(elapsed = ?start.elapsed(), "quic connection established");
    Ok(())
}

async fn probe_tls_handshake(
    dialer: Arc<dyn DialHandler>,
    server_name: String,
    config: rustls::ClientConfig,
    probe_timeout: std::time::Duration,
) -> Result<()> {
    let start = Instant::now();

    let conn = dialer.dial(Network::Tcp, "").await?;
    let DialedConn::Tcp(tcp) = conn else {
        return Err(ErrorKind::Message("dial handler returned a non-TCP connection").into());
    };

    let server_name = ServerName::try_from(server_name)
        .map_err(|e| ErrorKind::Msg(format!("bad server name: {e}")))?;
    let connect = TlsConnector::from(Arc::new(config)).connect(server_name, tcp);
    let tls = match timeout(probe_timeout, connect).await {
        Ok(tls) => tls?,
        Err(_) => {
            return Err(ErrorKind::Timeout {
                elapsed: start.elapsed(),
            }
            .into());
        }
    };
    drop(tls);

    debug!(elapsed = ?start.elapsed(), "tls connection established");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use futures_util::future::BoxFuture;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::bootstrap::DialHandlerFactory;
    use crate::options::{parse_endpoint, redacted};
    use crate::quic::QuicTemplate;
    use crate::tls::TlsTemplate;
    use crate::test_util::subscribe;
    use crate::{HttpVersion, UpstreamOptions};

    /// Hands out connected UDP sockets and counts dials per network.
    struct CountingDialer {
        udp_dials: AtomicUsize,
        tcp_dials: AtomicUsize,
    }

    impl CountingDialer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                udp_dials: AtomicUsize::new(0),
                tcp_dials: AtomicUsize::new(0),
            })
        }
    }

    impl DialHandler for CountingDialer {
        fn dial(
            &self,
            network: Network,
            _address: &str,
        ) -> BoxFuture<'static, std::io::Result<DialedConn>> {
            match network {
                Network::Udp => {
                    self.udp_dials.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {
                        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
                        // connecting a UDP socket sends nothing
                        socket.connect((Ipv4Addr::LOCALHOST, 853)).await?;
                        Ok(DialedConn::Udp(socket))
                    })
                }
                Network::Tcp => {
                    self.tcp_dials.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            "no tcp in this test",
                        ))
                    })
                }
            }
        }
    }

    fn connector(addr: &str, versions: Vec<HttpVersion>) -> Connector {
        let opts = UpstreamOptions {
            http_versions: versions,
            ..UpstreamOptions::default()
        };
        let (url, versions) = parse_endpoint(addr, &opts).unwrap();
        let addr_redacted = redacted(&url);
        let server_name = url.host_str().unwrap().to_string();

        Connector {
            tls: TlsTemplate::new(server_name, &versions, &opts).unwrap(),
            quic: StdMutex::new(QuicTemplate::new(None)),
            dialer_factory: Arc::new(NoFactory),
            timeout: None,
            url,
            addr_redacted,
            versions,
        }
    }

    struct NoFactory;

    impl DialHandlerFactory for NoFactory {
        fn handler(&self) -> BoxFuture<'static, crate::Result<Arc<dyn DialHandler>>> {
            Box::pin(async { Err(ErrorKind::Message("not used in this test").into()) })
        }
    }

    #[tokio::test]
    async fn test_h3_only_skips_the_race() {
        subscribe();

        let connector = connector("https://dns.example/dns-query", vec![HttpVersion::Http3]);
        let dialer = CountingDialer::new();

        let remote = probe_h3(&connector, &(dialer.clone() as Arc<dyn DialHandler>))
            .await
            .expect("probe failed");

        assert_eq!(remote.port(), 853);
        assert_eq!(dialer.udp_dials.load(Ordering::SeqCst), 1);
        // no TLS probe may run when HTTP/3 is the only version
        assert_eq!(dialer.tcp_dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_requires_h3_in_versions() {
        subscribe();

        let connector = connector("https://dns.example/dns-query", vec![HttpVersion::Http2]);
        let dialer = CountingDialer::new();

        let err = probe_h3(&connector, &(dialer.clone() as Arc<dyn DialHandler>))
            .await
            .expect_err("probe must be skipped");
        assert!(matches!(err.kind(), ErrorKind::H3NotEnabled), "{err}");
        assert_eq!(dialer.udp_dials.load(Ordering::SeqCst), 0);
    }
}
