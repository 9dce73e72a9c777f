// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The TLS configuration template for this upstream.
//!
//! The template holds the parameters agreed at construction time; every
//! connection gets its own [`rustls::ClientConfig`] clone so that ALPN and
//! session state stay isolated, while the session cache handle is shared so
//! resumption works across reconnects.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ClientSessionMemoryCache, Resumption};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{ErrorKind, Result};
use crate::options::UpstreamOptions;
use crate::HttpVersion;

/// Sessions kept for TLS resumption and QUIC 0-RTT.
const SESSION_CACHE_SIZE: usize = 64;

pub(crate) struct TlsTemplate {
    server_name: String,
    roots: Arc<RootCertStore>,
    cipher_suites: Option<Vec<rustls::SupportedCipherSuite>>,
    alpn: Vec<Vec<u8>>,
    insecure_skip_verify: bool,
    verifier: Option<Arc<dyn ServerCertVerifier>>,
    session_cache: Arc<ClientSessionMemoryCache>,
}

impl TlsTemplate {
    pub(crate) fn new(
        server_name: String,
        versions: &[HttpVersion],
        opts: &UpstreamOptions,
    ) -> Result<Self> {
        let roots = match &opts.root_store {
            Some(roots) => Arc::clone(roots),
            None => Arc::new(default_root_store()?),
        };

        Ok(Self {
            server_name,
            roots,
            cipher_suites: opts.cipher_suites.clone(),
            alpn: versions.iter().map(|v| v.alpn().to_vec()).collect(),
            insecure_skip_verify: opts.insecure_skip_verify,
            verifier: opts.server_cert_verifier.clone(),
            session_cache: Arc::new(ClientSessionMemoryCache::new(SESSION_CACHE_SIZE)),
        })
    }

    pub(crate) fn server_name(&self) -> &str {
        &self.server_name
    }

    /// A fresh config for a long-lived connection: session cache attached,
    /// custom verifiers honored.
    pub(crate) fn connection_config(&self) -> Result<ClientConfig> {
        let mut config = self.base_config()?;
        config.resumption = Resumption::store(
            Arc::clone(&self.session_cache) as Arc<dyn rustls::client::ClientSessionStore>
        );

        if let Some(verifier) = &self.verifier {
            config
                .dangerous()
                .set_certificate_verifier(Arc::clone(verifier));
        } else if self.insecure_skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerify));
        }

        Ok(config)
    }

    /// A throwaway config for probing: no session cache, no custom
    /// verifiers, so a probe never touches long-lived state.
    pub(crate) fn probe_config(&self) -> Result<ClientConfig> {
        let mut config = self.base_config()?;
        config.resumption = Resumption::disabled();

        if self.insecure_skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerify));
        }

        Ok(config)
    }

    fn base_config(&self) -> Result<ClientConfig> {
        let mut provider = rustls::crypto::ring::default_provider();
        if let Some(suites) = &self.cipher_suites {
            provider
                .cipher_suites
                .retain(|candidate| suites.iter().any(|s| s.suite() == candidate.suite()));
            if provider.cipher_suites.is_empty() {
                return Err(ErrorKind::Msg("no usable cipher suites configured".into()).into());
            }
        }

        let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| ErrorKind::Msg(format!("tls protocol versions: {e}")))?
            .with_root_certificates(Arc::clone(&self.roots))
            .with_no_client_auth();

        config.alpn_protocols = self.alpn.clone();

        Ok(config)
    }
}

/// Builds the default trust anchors from the enabled root source.
fn default_root_store() -> Result<RootCertStore> {
    #[allow(unused_mut)]
    let mut root_store = RootCertStore::empty();

    #[cfg(feature = "native-certs")]
    {
        let result = rustls_native_certs::load_native_certs();
        let (added, ignored) = root_store.add_parsable_certificates(result.certs);
        if ignored > 0 {
            tracing::warn!("failed to parse {ignored} certificate(s) from the native root store");
        }
        if added == 0 && !result.errors.is_empty() {
            return Err(ErrorKind::Msg(format!(
                "loading native roots: {}",
                result.errors[0]
            ))
            .into());
        }
    }

    #[cfg(feature = "webpki-roots")]
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if root_store.is_empty() {
        return Err(ErrorKind::Message(
            "no root certificates available; enable the webpki-roots or native-certs feature",
        )
        .into());
    }

    Ok(root_store)
}

/// Certificate verifier that accepts any certificate. Only installed when
/// `insecure_skip_verify` is explicitly configured.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_HTTP_VERSIONS;

    fn template(versions: &[HttpVersion]) -> TlsTemplate {
        TlsTemplate::new(
            "dns.example".to_string(),
            versions,
            &UpstreamOptions::default(),
        )
        .expect("template")
    }

    #[test]
    fn test_alpn_follows_versions() {
        let tls = template(&[HttpVersion::Http2, HttpVersion::Http3]);
        let config = tls.connection_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"h3".to_vec()]);

        let tls = template(&[HttpVersion::Http3]);
        let config = tls.connection_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h3".to_vec()]);
    }

    #[test]
    fn test_probe_config_leaves_session_cache_alone() {
        let tls = template(&DEFAULT_HTTP_VERSIONS);
        let baseline = Arc::strong_count(&tls.session_cache);

        // a connection config holds the shared cache; a probe config must not
        let _conn = tls.connection_config().unwrap();
        assert_eq!(Arc::strong_count(&tls.session_cache), baseline + 1);

        let _probe = tls.probe_config().unwrap();
        assert_eq!(Arc::strong_count(&tls.session_cache), baseline + 1);
    }
}
