//! Ephemeral TLS material for the netkk TCP server.
//!
//! When a listening endpoint is asked for TLS but the operator supplies no
//! certificate files, the server bootstraps its own trust anchor: a
//! short-lived certificate authority is generated in memory, a server
//! certificate is signed by it, and the CA's PEM encoding is handed back so
//! the caller can publish it for clients that want to opt in to trusting the
//! session.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

const CA_COMMON_NAME: &str = "netkk-generated certificate authority";
const DEFAULT_SERVER_COMMON_NAME: &str = "localhost";

/// Generated certificates are only meant to outlive a single interactive
/// session, so their validity window is kept deliberately short.
const VALIDITY_DAYS: i64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("could not generate CA: {0}")]
    CertificateAuthority(#[source] rcgen::Error),
    #[error("could not generate signed cert: {0}")]
    ServerCertificate(#[source] rcgen::Error),
    #[error("could not generate key pair: {0}")]
    KeyPair(#[source] rcgen::Error),
}

/// A freshly generated server identity, ready to be fed to rustls, plus the
/// PEM encoding of the CA that signed it.
pub struct ServerIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub ca_pem: String,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("ca_pem_len", &self.ca_pem.len())
            .finish()
    }
}

/// Create an ephemeral CA and a server certificate signed by it.
///
/// `common_name` defaults to `localhost`. `ips` replaces the default subject
/// alternative names (IPv4 and IPv6 loopback) entirely when non-empty, so a
/// caller binding a public interface must list every address clients will
/// dial.
pub fn generate_server_identity(
    common_name: Option<&str>,
    ips: &[IpAddr],
) -> Result<ServerIdentity, CertError> {
    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + Duration::days(VALIDITY_DAYS);

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, "Netkarkat");
    ca_params
        .distinguished_name
        .push(DnType::OrganizationalUnitName, "Generated CAs");
    ca_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;

    let ca_key = KeyPair::generate().map_err(CertError::KeyPair)?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(CertError::CertificateAuthority)?;

    let mut params = CertificateParams::default();
    params.distinguished_name.push(
        DnType::CommonName,
        common_name.unwrap_or(DEFAULT_SERVER_COMMON_NAME),
    );
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Netkarkat");
    params.subject_alt_names = if ips.is_empty() {
        vec![
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ]
    } else {
        ips.iter().copied().map(SanType::IpAddress).collect()
    };
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = not_before;
    params.not_after = not_after;

    let server_key = KeyPair::generate().map_err(CertError::KeyPair)?;
    let server_cert = params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(CertError::ServerCertificate)?;

    Ok(ServerIdentity {
        cert_chain: vec![server_cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der())),
        ca_pem: ca_cert.pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn generates_leaf_and_ca_material() {
        let identity = generate_server_identity(None, &[]).expect("generate identity");
        assert_eq!(identity.cert_chain.len(), 1);
        assert!(!identity.ca_pem.is_empty());

        let mut cursor = Cursor::new(identity.ca_pem.as_bytes());
        let ca_certs: Vec<_> = rustls_pemfile::certs(&mut cursor)
            .collect::<Result<_, _>>()
            .expect("parse CA pem");
        assert_eq!(ca_certs.len(), 1);
    }

    #[test]
    fn honors_custom_common_name_and_ips() {
        let ips = vec!["192.0.2.7".parse::<IpAddr>().expect("addr")];
        let identity =
            generate_server_identity(Some("internal.test"), &ips).expect("generate identity");
        assert_eq!(identity.cert_chain.len(), 1);
        // key must be usable as PKCS#8
        assert!(matches!(identity.key, PrivateKeyDer::Pkcs8(_)));
    }
}
