// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The QUIC configuration template for this upstream.
//!
//! The template is read-mostly: handshakes clone it under the owning mutex
//! and the session store is only ever replaced wholesale, never written in
//! place. quinn gates 0-RTT on the TLS session ticket, so the rustls client
//! session store plays the role of the 0-RTT token store here; flushing it
//! after a 0-RTT rejection forces the next handshake back to 1-RTT with a
//! fresh ticket.

use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, TransportConfig, VarInt};
use rustls::client::{ClientSessionMemoryCache, Resumption};

use crate::error::{ErrorKind, Result};
use crate::QUIC_KEEPALIVE;

/// Sessions kept for 0-RTT resumption; one endpoint only ever needs a few.
const ZERO_RTT_STORE_SIZE: usize = 8;

#[derive(Clone)]
pub(crate) struct QuicTemplate {
    transport: Arc<TransportConfig>,
    session_store: Arc<ClientSessionMemoryCache>,
}

impl QuicTemplate {
    pub(crate) fn new(transport_override: Option<Arc<TransportConfig>>) -> Self {
        Self {
            transport: transport_override.unwrap_or_else(|| Arc::new(default_transport())),
            session_store: Arc::new(ClientSessionMemoryCache::new(ZERO_RTT_STORE_SIZE)),
        }
    }

    /// Builds a quinn client config around `tls`, attaching the shared
    /// session store and enabling early data.
    pub(crate) fn client_config(&self, mut tls: rustls::ClientConfig) -> Result<ClientConfig> {
        tls.enable_early_data = true;
        tls.resumption = Resumption::store(
            Arc::clone(&self.session_store) as Arc<dyn rustls::client::ClientSessionStore>
        );

        self.build(tls)
    }

    /// Like [`Self::client_config`], but for probes: the transport
    /// parameters are shared while `tls` keeps whatever (disabled)
    /// resumption it came with, so a probe handshake never seeds the
    /// 0-RTT store.
    pub(crate) fn probe_client_config(&self, tls: rustls::ClientConfig) -> Result<ClientConfig> {
        self.build(tls)
    }

    fn build(&self, tls: rustls::ClientConfig) -> Result<ClientConfig> {
        let crypto = QuicClientConfig::try_from(tls)
            .map_err(|e| ErrorKind::Msg(format!("quic tls config: {e}")))?;
        let mut config = ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::clone(&self.transport));

        Ok(config)
    }

    /// Replaces the session store with an empty one; any stored ticket is
    /// assumed stale after a 0-RTT rejection.
    pub(crate) fn reset_session_store(&mut self) {
        self.session_store = Arc::new(ClientSessionMemoryCache::new(ZERO_RTT_STORE_SIZE));
    }

    #[cfg(test)]
    pub(crate) fn session_store_ptr(&self) -> *const ClientSessionMemoryCache {
        Arc::as_ptr(&self.session_store)
    }
}

/// Transport defaults for DoH3: keepalive pings under the server idle
/// timeout, no datagrams, stream limits sized for HTTP/3 control traffic.
fn default_transport() -> TransportConfig {
    let mut transport = TransportConfig::default();

    transport.keep_alive_interval(Some(QUIC_KEEPALIVE));
    transport.datagram_receive_buffer_size(None);
    transport.datagram_send_buffer_size(0);
    // clients never accept new bidirectional streams
    transport.max_concurrent_bidi_streams(VarInt::from_u32(3));
    // - SETTINGS
    // - QPACK encoder
    // - QPACK decoder
    // - RESERVED (GREASE)
    transport.max_concurrent_uni_streams(VarInt::from_u32(4));

    transport
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_replaces_the_store() {
        let mut template = QuicTemplate::new(None);
        let before = template.session_store_ptr();

        template.reset_session_store();
        assert_ne!(before, template.session_store_ptr());
    }

    #[test]
    fn test_clones_share_the_store_until_reset() {
        let template = QuicTemplate::new(None);
        let clone = template.clone();
        assert_eq!(template.session_store_ptr(), clone.session_store_ptr());

        let mut reset = template.clone();
        reset.reset_session_store();
        assert_ne!(template.session_store_ptr(), reset.session_store_ptr());
    }
}
