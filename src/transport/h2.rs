// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The HTTP/2 transport: one multiplexed connection over TLS.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{Request, Response};
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::bootstrap::{DialHandler, DialedConn, Network};
use crate::error::{ErrorKind, Result};
use crate::transport::Connector;
use crate::{DIAL_TIMEOUT, TCP_KEEPALIVE};

pub(crate) struct H2Transport {
    send_request: h2::client::SendRequest<Bytes>,
}

impl H2Transport {
    /// Dials the endpoint through the handler, performs the TLS and h2
    /// handshakes, and spawns the connection driver.
    pub(crate) async fn connect(
        connector: &Connector,
        dialer: &Arc<dyn DialHandler>,
    ) -> Result<Self> {
        let conn = dialer
            .dial(Network::Tcp, "")
            .await
            .map_err(|e| ErrorKind::Bootstrap {
                addr: connector.addr_redacted.clone(),
                source: e,
            })?;
        let DialedConn::Tcp(tcp) = conn else {
            return Err(ErrorKind::Msg(format!(
                "not a TCP connection to {}",
                connector.addr_redacted
            ))
            .into());
        };

        tcp.set_nodelay(true)?;
        SockRef::from(&tcp).set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;

        let server_name = ServerName::try_from(connector.tls.server_name().to_string())
            .map_err(|e| ErrorKind::Msg(format!("bad server name: {e}")))?;
        let tls_config = Arc::new(connector.tls.connection_config()?);

        let connect = TlsConnector::from(tls_config).connect(server_name, tcp);
        let tls = match timeout(DIAL_TIMEOUT, connect).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(ErrorKind::Timeout {
                    elapsed: DIAL_TIMEOUT,
                }
                .into());
            }
        };

        let mut handshake = h2::client::Builder::new();
        handshake.enable_push(false);
        let (send_request, driver) = handshake.handshake::<_, Bytes>(tls).await?;

        debug!("h2 connection established to {}", connector.addr_redacted);
        tokio::spawn(async {
            if let Err(e) = driver.await {
                warn!("h2 connection failed: {e}");
            }
        });

        Ok(Self { send_request })
    }

    pub(crate) async fn round_trip(&self, request: Request<()>) -> Result<Response<Bytes>> {
        let mut h2 = self.send_request.clone().ready().await?;

        // a GET carries no body, so the request stream ends immediately
        let (response, _) = h2.send_request(request, true)?;
        let response = response.await?;

        let (parts, mut body) = response.into_parts();
        let mut bytes = BytesMut::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            let _ = body.flow_control().release_capacity(chunk.len());
            bytes.extend_from_slice(&chunk);
        }

        Ok(Response::from_parts(parts, bytes.freeze()))
    }

    /// The connection closes once the driver sees all handles dropped;
    /// nothing to tear down eagerly.
    pub(crate) fn close(&self) -> Result<()> {
        debug!("dropping h2 connection handle");
        Ok(())
    }
}
