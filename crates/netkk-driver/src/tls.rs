//! rustls configuration assembly for the TCP drivers.
//!
//! Clients verify against the system trust store, optionally widened by a
//! caller-supplied trust chain file, or skip verification entirely when asked
//! to. Servers either load a certificate/key pair from disk or fall back to a
//! freshly generated self-signed identity whose CA material is handed back to
//! the caller for publication.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::{DriverError, LoggingCallbacks, Options};

pub(crate) fn client_config(
    opts: &Options,
    log: &LoggingCallbacks,
) -> Result<ClientConfig, DriverError> {
    let builder = ClientConfig::builder();

    if opts.tls_skip_verify {
        let provider = builder.crypto_provider().clone();
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                // individual unparsable platform certs are not fatal
                let _ = roots.add(cert);
            }
        }
        Err(err) => log.warn(format!("could not load system trust roots: {err}")),
    }

    if let Some(path) = &opts.tls_trust_chain {
        let file = File::open(path).map_err(|err| {
            DriverError::TlsConfig(format!("could not read trust chain: {err}"))
        })?;
        let mut reader = BufReader::new(file);
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|err| {
                DriverError::TlsConfig(format!("could not read trust chain: {err}"))
            })?;
            if roots.add(cert).is_ok() {
                added += 1;
            }
        }
        if added == 0 {
            return Err(DriverError::TlsConfig(
                "could not parse any valid certificate authorities from trust chain file".into(),
            ));
        }
    }

    Ok(builder
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Server TLS material plus, when self-signed, the CA PEM to publish.
pub(crate) struct ServerTls {
    pub(crate) config: ServerConfig,
    pub(crate) generated_ca_pem: Option<String>,
}

pub(crate) fn server_config(opts: &Options) -> Result<ServerTls, DriverError> {
    let (cert_chain, key, generated_ca_pem) = match (
        &opts.tls_server_cert_file,
        &opts.tls_server_key_file,
    ) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_cert_chain(cert_path)?;
            let key = load_private_key(key_path)?;
            (chain, key, None)
        }
        _ => {
            // no certs were provided but TLS was requested; generate our own
            let identity = netkk_certs::generate_server_identity(
                opts.tls_server_cert_common_name.as_deref(),
                &opts.tls_server_cert_ips,
            )?;
            (identity.cert_chain, identity.key, Some(identity.ca_pem))
        }
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|err| DriverError::TlsConfig(err.to_string()))?;

    Ok(ServerTls {
        config,
        generated_ca_pem,
    })
}

fn load_cert_chain(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, DriverError> {
    let file = File::open(path)
        .map_err(|err| DriverError::TlsConfig(format!("could not read server cert: {err}")))?;
    let mut reader = BufReader::new(file);
    let chain: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| DriverError::TlsConfig(format!("could not parse server cert: {err}")))?;
    if chain.is_empty() {
        return Err(DriverError::TlsConfig(
            "server cert file contains no certificates".into(),
        ));
    }
    Ok(chain)
}

fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, DriverError> {
    let file = File::open(path)
        .map_err(|err| DriverError::TlsConfig(format!("could not read server key: {err}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| DriverError::TlsConfig(format!("could not parse server key: {err}")))?
        .ok_or_else(|| DriverError::TlsConfig("server key file contains no private key".into()))
}

/// Verifier behind `--insecure-skip-verify`: accepts every presented
/// certificate without looking at it.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
