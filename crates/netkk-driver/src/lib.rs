//! Connection drivers for netkk.
//!
//! Every transport variant (outbound TCP, listening TCP, UDP in both
//! connected and half-open flavors) is exposed through the [`Endpoint`]
//! trait: an open bidirectional byte channel that owns a background reader
//! task. Received chunks are delivered to a caller-supplied handler; closure,
//! readiness, and timeout state are queryable at any time from any task.
//!
//! Ownership model: the socket is split between the caller's task (sends,
//! close requests) and the endpoint's reader task (receives, error
//! detection). The two coordinate through a pair of watch channels: `cancel`
//! asks the reader to stop, `done` reports that it has. Either side may be
//! the one to discover that the connection has died; the `closed` flag is
//! monotonic and the close path is idempotent.

mod server;
mod tcp;
mod tls;
mod udp;

pub use server::TcpServer;
pub use tcp::TcpEndpoint;
pub use udp::UdpEndpoint;

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Maximum number of bytes read from the network layer at once.
pub(crate) const READER_BUFFER_SIZE: usize = 1024;

/// How long a graceful close waits for the reader task to wind down before
/// the socket is forced shut.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_millis(99);

/// Ceiling on how long an accepted client may take to complete the TLS
/// handshake, independent of the configured connection timeout.
pub(crate) const MAX_TLS_HANDSHAKE_WAIT: Duration = Duration::from_secs(10);

/// Invoked with each received chunk. Handlers run on their own spawned task,
/// so a panicking handler cannot take the reader down with it, and handler
/// invocations may overlap.
pub type ReceiveHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked (on a detached task) when a listening endpoint admits a client.
pub type ClientConnectedHandler = Arc<dyn Fn(String) + Send + Sync>;

type LogFormatter = Arc<dyn Fn(String) + Send + Sync>;
type ErrorLogFormatter = Arc<dyn Fn(&DriverError, String) + Send + Sync>;

/// Level-tagged callbacks the drivers report through. All four are required;
/// the constructor is the only way to build one, so a partially-initialized
/// bundle cannot exist.
///
/// The error callback is the only way callers observe socket errors, since
/// reads happen on a background task.
#[derive(Clone)]
pub struct LoggingCallbacks {
    trace_cb: LogFormatter,
    debug_cb: LogFormatter,
    warn_cb: LogFormatter,
    error_cb: ErrorLogFormatter,
}

impl LoggingCallbacks {
    pub fn new(
        trace_cb: LogFormatter,
        debug_cb: LogFormatter,
        warn_cb: LogFormatter,
        error_cb: ErrorLogFormatter,
    ) -> Self {
        Self {
            trace_cb,
            debug_cb,
            warn_cb,
            error_cb,
        }
    }

    /// Bundle that swallows everything. Mostly useful in tests.
    pub fn disabled() -> Self {
        Self::new(
            Arc::new(|_| {}),
            Arc::new(|_| {}),
            Arc::new(|_| {}),
            Arc::new(|_, _| {}),
        )
    }

    pub(crate) fn trace(&self, msg: String) {
        (self.trace_cb)(msg);
    }

    pub(crate) fn debug(&self, msg: String) {
        (self.debug_cb)(msg);
    }

    pub(crate) fn warn(&self, msg: String) {
        (self.warn_cb)(msg);
    }

    pub(crate) fn error(&self, err: &DriverError, msg: String) {
        (self.error_cb)(err, msg);
    }
}

impl std::fmt::Debug for LoggingCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoggingCallbacks")
    }
}

/// Options common to all connection variants.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Enables TLS on the connection. Only applicable to TCP.
    pub tls_enabled: bool,

    /// Disables all server certificate verification. Not safe for production
    /// use. Ignored unless TLS is enabled.
    pub tls_skip_verify: bool,

    /// PEM file of additional certificate authorities trusted for host
    /// verification, on top of the system roots.
    pub tls_trust_chain: Option<PathBuf>,

    /// Server certificate path for listening TCP connections. If TLS is
    /// requested and either this or `tls_server_key_file` is absent, a
    /// self-signed certificate is generated instead.
    pub tls_server_cert_file: Option<PathBuf>,

    /// Server private key path, paired with `tls_server_cert_file`.
    pub tls_server_key_file: Option<PathBuf>,

    /// Common name for a generated self-signed certificate. Ignored when
    /// certificate files are supplied.
    pub tls_server_cert_common_name: Option<String>,

    /// Subject alternative IPs for a generated self-signed certificate.
    pub tls_server_cert_ips: Vec<IpAddr>,

    /// How long to wait for the initial connect, accept, or first datagram.
    /// `None` means wait forever.
    pub connection_timeout: Option<Duration>,

    /// Turn off TCP keepalive probes.
    pub disable_keepalives: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid connection options: {0}")]
    Configuration(String),
    #[error("could not resolve host {host:?}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("could not connect: {0}")]
    Connect(#[source] io::Error),
    #[error("connection timed out")]
    ConnectTimeout,
    #[error("could not listen for connections: {0}")]
    Listen(#[source] io::Error),
    #[error("problem with TLS configuration: {0}")]
    TlsConfig(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("client did not complete TLS handshake within the deadline")]
    HandshakeTimeout,
    #[error("host accepted connection but immediately closed it")]
    ImmediatelyClosed,
    #[error("this connection has been closed and can no longer be used to send")]
    Closed,
    #[error("this connection doesn't yet have a remote host to communicate with")]
    NoPeer,
    #[error("remote host closed the connection")]
    RemoteClosed,
    #[error("after writing {written} byte(s), got error in write: {source}")]
    Send {
        written: usize,
        #[source]
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),
    #[error(transparent)]
    Cert(#[from] netkk_certs::CertError),
}

/// An open connection to (or awaiting) a remote peer.
///
/// All methods are safe to call concurrently from one user task while the
/// endpoint's own reader task is running. A closed endpoint stays closed; it
/// is never reusable.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Send binary data to the peer. No response is waited for, though for
    /// TCP a successful return implies the transport acknowledged the bytes.
    /// A send failure closes the endpoint.
    async fn send(&self, data: &[u8]) -> Result<(), DriverError>;

    /// Gracefully shut the connection down. Safe to call any number of
    /// times; only the first call does any work.
    async fn close(&self) -> Result<(), DriverError>;

    /// Shut down only the active peer conversation. For listening variants
    /// this releases the admitted client; for everything else it is the same
    /// as [`Endpoint::close`].
    async fn close_active(&self) -> Result<(), DriverError>;

    /// Whether the connection has been closed. Monotonic.
    fn is_closed(&self) -> bool;

    /// Whether the connection can accept sends. False while a listening
    /// variant has no peer yet. Note that a closed connection may still
    /// report ready; check [`Endpoint::is_closed`] first.
    fn ready(&self) -> bool;

    /// Whether the initial connect/accept deadline expired, leaving the
    /// endpoint inoperable. It must still be closed.
    fn timed_out(&self) -> bool;

    /// Human-readable name of the remote side. Empty until a peer is known.
    fn remote_name(&self) -> String;

    /// Human-readable name of the local side of the connection.
    fn local_name(&self) -> String;
}

/// Resolve a host name or literal IP to a single address.
pub async fn resolve_host(value: &str) -> Result<IpAddr, DriverError> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(ip);
    }
    // lookup_host needs a port; it is discarded with the rest of the
    // candidate list.
    let mut addrs = tokio::net::lookup_host((value, 0))
        .await
        .map_err(|err| DriverError::Resolve {
            host: value.to_string(),
            source: err,
        })?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| DriverError::Resolve {
            host: value.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        })
}

pub(crate) fn hex_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_host_accepts_literal_ips() {
        let ip = resolve_host("127.0.0.1").await.expect("resolve v4");
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().expect("addr"));

        let ip = resolve_host("::1").await.expect("resolve v6");
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn resolve_host_resolves_localhost() {
        let ip = resolve_host("localhost").await.expect("resolve name");
        assert!(ip.is_loopback());
    }

    #[test]
    fn hex_string_formats_bytes() {
        assert_eq!("48494a", hex_string(&[0x48, 0x49, 0x4a]));
        assert_eq!("", hex_string(&[]));
    }
}
