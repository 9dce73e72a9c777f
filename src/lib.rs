// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A DNS-over-HTTPS (DoH, RFC 8484) upstream client.
//!
//! This crate implements the DoH leg of a DNS proxy's upstream set: queries
//! are resolved over HTTP/2 (TLS 1.2+) or HTTP/3 (QUIC), and the transport
//! is picked by racing a QUIC handshake against a TLS handshake to the same
//! endpoint. Connections are built lazily, replaced on transient transport
//! failures, and shared by both the single-shot [`DohUpstream::exchange`]
//! path and the batched [`DohUpstream::batch_exchange`] path.
//!
//! Endpoint URLs use the `https` scheme, or `h3` to pin the upstream to
//! HTTP/3:
//!
//! ```no_run
//! use doh_upstream::{DohUpstream, UpstreamOptions};
//! use hickory_proto::op::{Message, Query};
//! use hickory_proto::rr::{Name, RecordType};
//! use std::str::FromStr;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let upstream = DohUpstream::new(
//!     "https://dns.google/dns-query",
//!     UpstreamOptions::default(),
//! )?;
//!
//! let mut query = Message::new();
//! query.add_query(Query::query(Name::from_str("www.example.com.")?, RecordType::A));
//! let response = upstream.exchange(&query).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, clippy::print_stdout)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::time::Duration;

pub mod bootstrap;
mod batch;
mod error;
mod options;
mod quic;
mod request;
mod shape;
mod tls;
mod transport;
mod upstream;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::options::{HttpVersion, UpstreamOptions, DEFAULT_HTTP_VERSIONS};
pub use crate::shape::HeaderPolicy;
pub use crate::upstream::DohUpstream;

/// The default port for DNS-over-HTTPS.
pub const DEFAULT_PORT_DOH: u16 = 443;

/// Fallback deadline for dials and probes when no upstream timeout is set.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive period for the HTTP/2 transport's connection.
pub(crate) const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// QUIC keepalive period, under the server's usual 30s idle timeout.
pub(crate) const QUIC_KEEPALIVE: Duration = Duration::from_secs(20);

/// Retries after the initial attempt when a cached client fails transiently.
pub(crate) const MAX_TRANSIENT_RETRIES: usize = 2;

pub(crate) const MIME_APPLICATION_DNS: &str = "application/dns-message";

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Once;

    /// Registers a global default tracing subscriber when called for the
    /// first time. This is intended for use in tests.
    pub(crate) fn subscribe() {
        static INSTALL_TRACING_SUBSCRIBER: Once = Once::new();
        INSTALL_TRACING_SUBSCRIBER.call_once(|| {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .finish();
            tracing::subscriber::set_global_default(subscriber).unwrap();
        });
    }
}
