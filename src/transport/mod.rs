// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! HTTP transport construction and the client built on top of it.
//!
//! The factory prefers HTTP/3: construction runs the QUIC-vs-TLS probe and
//! only falls back to the HTTP/2 transport when the probe rules HTTP/3 out.
//! Whichever transport wins lives for the lifetime of the client instance;
//! the upstream rebuilds the client (and re-probes) on reset.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use http::{Request, Response, Version};
use tracing::debug;
use url::Url;

use crate::bootstrap::{DialHandler, DialHandlerFactory};
use crate::error::{ErrorKind, Result};
use crate::quic::QuicTemplate;
use crate::tls::TlsTemplate;
use crate::HttpVersion;

pub(crate) mod h2;
pub(crate) mod h3;
pub(crate) mod probe;

use self::h2::H2Transport;
use self::h3::H3Transport;

/// An HTTP client bound to one transport instance.
pub(crate) struct HttpClient {
    transport: HttpTransport,
}

pub(crate) enum HttpTransport {
    H2(H2Transport),
    H3(H3Transport),
    #[cfg(test)]
    Mock(MockTransport),
}

impl HttpClient {
    pub(crate) fn is_h3(&self) -> bool {
        matches!(self.transport, HttpTransport::H3(_))
    }

    pub(crate) fn http_version(&self) -> Version {
        match self.transport {
            HttpTransport::H3(_) => Version::HTTP_3,
            _ => Version::HTTP_2,
        }
    }

    pub(crate) async fn round_trip(&self, request: Request<()>) -> Result<Response<Bytes>> {
        match &self.transport {
            HttpTransport::H2(h2) => h2.round_trip(request).await,
            HttpTransport::H3(h3) => h3.round_trip(request).await,
            #[cfg(test)]
            HttpTransport::Mock(mock) => mock.round_trip(request),
        }
    }

    pub(crate) async fn close(&self) -> Result<()> {
        match &self.transport {
            HttpTransport::H2(h2) => h2.close(),
            HttpTransport::H3(h3) => h3.close().await,
            #[cfg(test)]
            HttpTransport::Mock(_) => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn mock(mock: MockTransport) -> Self {
        Self {
            transport: HttpTransport::Mock(mock),
        }
    }
}

/// Builds transports for one configured endpoint; owns the TLS and QUIC
/// templates the transports are derived from.
pub(crate) struct Connector {
    pub(crate) url: Url,
    pub(crate) addr_redacted: String,
    pub(crate) versions: Vec<HttpVersion>,
    pub(crate) tls: TlsTemplate,
    pub(crate) quic: StdMutex<QuicTemplate>,
    pub(crate) dialer_factory: Arc<dyn DialHandlerFactory>,
    pub(crate) timeout: Option<std::time::Duration>,
}

impl Connector {
    pub(crate) fn supports_h3(&self) -> bool {
        self.versions.contains(&HttpVersion::Http3)
    }

    pub(crate) fn supports_http(&self) -> bool {
        self.versions.contains(&HttpVersion::Http11)
            || self.versions.contains(&HttpVersion::Http2)
    }

    /// The QUIC template as of now; a clone, so an in-flight handshake is
    /// unaffected by a concurrent store replacement.
    pub(crate) fn quic_template(&self) -> QuicTemplate {
        self.quic.lock().expect("quic template poisoned").clone()
    }

    pub(crate) fn reset_quic_session_store(&self) {
        self.quic
            .lock()
            .expect("quic template poisoned")
            .reset_session_store();
    }

    pub(crate) async fn create_client(&self) -> Result<HttpClient> {
        Ok(HttpClient {
            transport: self.create_transport().await?,
        })
    }

    async fn create_transport(&self) -> Result<HttpTransport> {
        let dialer = self.dialer_factory.handler().await?;

        match self.create_transport_h3(&dialer).await {
            Ok(transport) => {
                debug!("using http/3 for this upstream, quic was faster");
                Ok(HttpTransport::H3(transport))
            }
            Err(err) => {
                debug!(error = %err, "got error, switching to http/2 for this upstream");
                if !self.supports_http() {
                    return Err(ErrorKind::NoSupportedHttpVersion.into());
                }

                let h2 = H2Transport::connect(self, &dialer).await?;
                Ok(HttpTransport::H2(h2))
            }
        }
    }

    async fn create_transport_h3(&self, dialer: &Arc<dyn DialHandler>) -> Result<H3Transport> {
        let remote = probe::probe_h3(self, dialer).await?;
        H3Transport::new(self, remote)
    }
}

/// A scripted transport for exercising the exchange and batch paths
/// without a network.
#[cfg(test)]
pub(crate) struct MockTransport {
    handler: Arc<dyn Fn(Request<()>) -> Result<Response<Bytes>> + Send + Sync>,
    calls: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl MockTransport {
    pub(crate) fn new(
        handler: impl Fn(Request<()>) -> Result<Response<Bytes>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            calls: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    fn round_trip(&self, request: Request<()>) -> Result<Response<Bytes>> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        (self.handler)(request)
    }
}
