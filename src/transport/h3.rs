// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The HTTP/3 transport wrapper.
//!
//! Round trips prefer the cached QUIC connection and only dial when the
//! cache is empty or the cached connection has died, so a warm upstream
//! never pays a handshake. Close is deterministic: the state is guarded by
//! an RwLock, round trips hold it shared, and the closer takes it
//! exclusively, which drains pending round trips first.

use std::future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use h3::client::SendRequest;
use h3_quinn::OpenStreams;
use http::{Request, Response};
use quinn::{Endpoint, VarInt};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ErrorKind, Result};
use crate::request;
use crate::transport::Connector;

pub(crate) struct H3Transport {
    endpoint: Endpoint,
    remote: SocketAddr,
    server_name: Arc<str>,
    state: RwLock<H3State>,
}

#[derive(Default)]
struct H3State {
    closed: bool,
    conn: Option<H3Conn>,
}

#[derive(Clone)]
struct H3Conn {
    send_request: SendRequest<OpenStreams, Bytes>,
    quic: quinn::Connection,
    /// Set by the 0-RTT acceptance watcher if the server turned the early
    /// data down.
    zero_rtt_rejected: Arc<AtomicBool>,
}

impl H3Transport {
    /// Creates the transport around a fresh endpoint; the first round trip
    /// dials.
    pub(crate) fn new(connector: &Connector, remote: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let mut endpoint = Endpoint::client(bind)?;
        let client_config = connector
            .quic_template()
            .client_config(connector.tls.connection_config()?)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            remote,
            server_name: Arc::from(connector.tls.server_name()),
            state: RwLock::new(H3State::default()),
        })
    }

    pub(crate) async fn round_trip(&self, request: Request<()>) -> Result<Response<Bytes>> {
        // first pass: only a cached connection
        {
            let state = self.state.read().await;
            if state.closed {
                return Err(ErrorKind::Closed.into());
            }

            if let Some(conn) = state.conn.clone() {
                if conn.quic.close_reason().is_none() {
                    match Self::send(conn.clone(), request::duplicate(&request)).await {
                        Ok(response) => return Ok(response),
                        Err(_) if conn.zero_rtt_rejected.load(Ordering::Acquire) => {
                            return Err(ErrorKind::ZeroRttRejected.into());
                        }
                        Err(err) => {
                            debug!(error = %err, "cached h3 connection failed, dialing a fresh one");
                        }
                    }
                }
            }
        }

        // second pass: permit a fresh dial
        let conn = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(ErrorKind::Closed.into());
            }

            let conn = self.dial().await?;
            state.conn = Some(conn.clone());
            conn
        };

        let state = self.state.read().await;
        if state.closed {
            return Err(ErrorKind::Closed.into());
        }
        match Self::send(conn.clone(), request).await {
            Err(_) if conn.zero_rtt_rejected.load(Ordering::Acquire) => {
                Err(ErrorKind::ZeroRttRejected.into())
            }
            other => other,
        }
    }

    async fn send(conn: H3Conn, request: Request<()>) -> Result<Response<Bytes>> {
        let mut stream = conn.send_request.clone().send_request(request).await?;
        stream.finish().await?;

        let response = stream.recv_response().await?;
        let (parts, ()) = response.into_parts();

        let mut bytes = BytesMut::new();
        while let Some(mut chunk) = stream.recv_data().await? {
            bytes.put(&mut chunk);
            debug!("got {} h3 body bytes", bytes.len());
        }

        Ok(Response::from_parts(parts, bytes.freeze()))
    }

    /// Dials the remote, preferring a 0-RTT resumption when the session
    /// store has a usable ticket.
    async fn dial(&self) -> Result<H3Conn> {
        let connecting = self.endpoint.connect(self.remote, &self.server_name)?;
        let zero_rtt_rejected = Arc::new(AtomicBool::new(false));

        let quic = match connecting.into_0rtt() {
            Ok((conn, accepted)) => {
                let flag = Arc::clone(&zero_rtt_rejected);
                tokio::spawn(async move {
                    if !accepted.await {
                        debug!("server rejected 0-RTT data");
                        flag.store(true, Ordering::Release);
                    }
                });
                conn
            }
            Err(connecting) => connecting.await?,
        };

        let h3_connection = h3_quinn::Connection::new(quic.clone());
        let (mut driver, send_request) = h3::client::new(h3_connection).await?;

        debug!("h3 connection is ready: {}", self.remote);
        tokio::spawn(async move {
            let e = future::poll_fn(|cx| driver.poll_close(cx)).await;
            debug!("h3 connection closed: {e}");
        });

        Ok(H3Conn {
            send_request,
            quic,
            zero_rtt_rejected,
        })
    }

    /// Marks the transport closed and tears the connection down; pending
    /// round trips drain first, later ones fail deterministically.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.closed = true;

        if let Some(conn) = state.conn.take() {
            conn.quic.close(VarInt::from_u32(0), b"");
        }
        self.endpoint.close(VarInt::from_u32(0), b"");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use http::Method;

    use super::*;
    use crate::bootstrap::BootstrapResolver;
    use crate::options::{parse_endpoint, redacted};
    use crate::quic::QuicTemplate;
    use crate::tls::TlsTemplate;
    use crate::UpstreamOptions;

    fn connector(addr: &str) -> Connector {
        let opts = UpstreamOptions::default();
        let (url, versions) = parse_endpoint(addr, &opts).unwrap();
        let addr_redacted = redacted(&url);
        let server_name = url.host_str().unwrap().to_string();

        Connector {
            tls: TlsTemplate::new(server_name, &versions, &opts).unwrap(),
            quic: StdMutex::new(QuicTemplate::new(None)),
            dialer_factory: Arc::new(BootstrapResolver::new(&url).unwrap()),
            timeout: None,
            url,
            addr_redacted,
            versions,
        }
    }

    #[tokio::test]
    async fn test_round_trip_after_close_fails_deterministically() {
        let connector = connector("h3://dns.example/dns-query");
        let transport =
            H3Transport::new(&connector, ([192, 0, 2, 1], 443).into()).expect("transport");

        transport.close().await.expect("close failed");

        let mut request = Request::new(());
        *request.method_mut() = Method::GET;
        for _ in 0..2 {
            let err = transport
                .round_trip(request::duplicate(&request))
                .await
                .expect_err("closed transport must refuse");
            assert!(matches!(err.kind(), ErrorKind::Closed), "{err}");
        }
    }
}
