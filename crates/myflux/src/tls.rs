//! TLS upgrade hook.
//!
//! The MySQL TLS flow: after reading the server handshake the client sends
//! a 32-byte SSLRequest, upgrades the transport in place, then continues
//! with the handshake response over the encrypted stream. The upgrade
//! itself is feature-gated; without the `tls` feature a connection that
//! negotiates SSL fails cleanly.

use myflux_core::{ConnectionErrorKind, Error, Result};

use crate::config::Config;
use crate::engine::Channel;

#[cfg(not(feature = "tls"))]
pub(crate) async fn upgrade(_channel: &mut Channel, _config: &Config) -> Result<()> {
    Err(tls_error(
        "TLS negotiated but the driver was built without the 'tls' feature",
    ))
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Ssl, message)
}

#[cfg(feature = "tls")]
pub(crate) async fn upgrade(channel: &mut Channel, config: &Config) -> Result<()> {
    use std::sync::Arc;

    use tokio_rustls::TlsConnector;

    let client_config = build_client_config(config)?;

    let sni = config
        .tls
        .server_name
        .clone()
        .unwrap_or_else(|| config.host.clone());
    let server_name = rustls::pki_types::ServerName::try_from(sni.clone())
        .map_err(|e| tls_error(format!("invalid TLS server name '{}': {}", sni, e)))?;

    let stream = channel.take_stream();
    let connector = TlsConnector::from(Arc::new(client_config));
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| tls_error(format!("TLS handshake failed: {}", e)))?;

    channel.replace_stream(Box::new(tls_stream));
    Ok(())
}

/// Build the rustls client configuration for the configured SSL mode.
#[cfg(feature = "tls")]
fn build_client_config(config: &Config) -> Result<rustls::ClientConfig> {
    use std::sync::Arc;

    use crate::config::SslMode;

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    if config.tls.danger_skip_verify {
        return build_no_verify_config(&provider);
    }

    match config.ssl_mode {
        SslMode::Disabled => Err(tls_error("TLS upgrade requested with SSL disabled")),
        // Self-signed server certificates are the norm for MySQL; these
        // modes encrypt without verifying the peer.
        SslMode::Preferred | SslMode::Required => build_no_verify_config(&provider),
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if let Some(ca_path) = &config.tls.ca_cert_path {
                build_custom_ca_config(&provider, ca_path)
            } else {
                build_webpki_config(&provider)
            }
        }
    }
}

/// Accept any server certificate. Encryption without authentication.
#[cfg(feature = "tls")]
fn build_no_verify_config(
    provider: &std::sync::Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig> {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(std::sync::Arc::new(NoVerifier))
        .with_no_client_auth();

    Ok(config)
}

/// Verify against the standard webpki root bundle.
#[cfg(feature = "tls")]
fn build_webpki_config(
    provider: &std::sync::Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}

/// Verify against a caller-provided CA bundle.
#[cfg(feature = "tls")]
fn build_custom_ca_config(
    provider: &std::sync::Arc<rustls::crypto::CryptoProvider>,
    ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig> {
    use std::fs::File;
    use std::io::BufReader;

    let ca_file = File::open(ca_path).map_err(|e| {
        tls_error(format!(
            "cannot open CA certificate '{}': {}",
            ca_path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(ca_file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("cannot parse CA certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in '{}'",
            ca_path.display()
        )));
    }

    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("cannot add CA certificate: {}", e)))?;
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}
