//! Outbound TCP endpoint, optionally TLS-wrapped.
//!
//! The same type backs two roles: a dialed client connection, and the inner
//! connection a [`crate::TcpServer`] builds around an accepted socket. Both
//! share the reader task, close protocol, and send path; only construction
//! differs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{
    hex_string, tls, DriverError, Endpoint, LoggingCallbacks, Options, ReceiveHandler,
    CLOSE_GRACE, READER_BUFFER_SIZE,
};

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// Window after a successful dial in which an immediate remote hangup fails
/// construction instead of surfacing later.
const VALIDITY_PROBE: Duration = Duration::from_millis(100);

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Callback slot fired exactly once, on a detached task, when the endpoint
/// first transitions to closed. The TCP server uses it to release its
/// established-client slot.
pub(crate) type InvalidateHook = Box<dyn FnOnce() + Send>;

pub(crate) struct TcpShared {
    closed: AtomicBool,
    close_initiated: AtomicBool,
    close_mutex: Mutex<()>,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    recv_handler: ReceiveHandler,
    log: LoggingCallbacks,
    on_invalidate: std::sync::Mutex<Option<InvalidateHook>>,
}

impl TcpShared {
    fn close_initiated(&self) -> bool {
        self.close_initiated.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn fire_invalidate(&self) {
        if let Some(hook) = self.on_invalidate.lock().expect("invalidate lock").take() {
            tokio::spawn(async move { hook() });
        }
    }

    async fn force_close_socket(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// The close protocol shared by the user-facing close and the failure
    /// paths: mark the connection unusable, ask the reader to stop, give it a
    /// short grace period, then force the socket shut.
    pub(crate) async fn close(&self) -> Result<(), DriverError> {
        {
            let _guard = self.close_mutex.lock().await;
            if self.is_closed() {
                return Ok(()); // it's already been closed
            }
            // the reader exiting also sets closed, but set it here so future
            // callers instantly can no longer operate on this connection
            self.close_initiated.store(true, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            let _ = self.cancel_tx.send(true);
        }

        let mut done = self.done_rx.clone();
        let wait = async {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        if time::timeout(CLOSE_GRACE, wait).await.is_err() {
            self.log
                .trace("clean close timed out after short timeout; forcing unclean close".into());
        }

        self.force_close_socket().await;
        Ok(())
    }
}

/// An open TCP connection with its own reader task.
pub struct TcpEndpoint {
    shared: Arc<TcpShared>,
    remote_name: String,
    local_name: String,
}

impl TcpEndpoint {
    /// Dial a TCP server, optionally wrapping the stream in TLS.
    pub async fn connect(
        recv_handler: ReceiveHandler,
        log: LoggingCallbacks,
        remote_host: &str,
        remote_port: u16,
        opts: &Options,
    ) -> Result<Self, DriverError> {
        let ip = crate::resolve_host(remote_host).await?;
        let addr = std::net::SocketAddr::new(ip, remote_port);
        let remote_name = format!("{remote_host}:{remote_port}");

        let connect = TcpStream::connect(addr);
        let stream = match opts.connection_timeout {
            Some(limit) => time::timeout(limit, connect)
                .await
                .map_err(|_| DriverError::ConnectTimeout)?
                .map_err(DriverError::Connect)?,
            None => connect.await.map_err(DriverError::Connect)?,
        };
        configure_keepalive(&stream, !opts.disable_keepalives)?;
        let local_name = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let stream: BoxedStream = if opts.tls_enabled {
            let config = tls::client_config(opts, &log)?;
            let server_name = rustls::pki_types::ServerName::try_from(remote_host.to_string())
                .map_err(|err| DriverError::TlsConfig(format!("invalid server name: {err}")))?;
            let connector = TlsConnector::from(Arc::new(config));
            let handshake = connector.connect(server_name, stream);
            let tls_stream = match opts.connection_timeout {
                Some(limit) => time::timeout(limit, handshake)
                    .await
                    .map_err(|_| DriverError::ConnectTimeout)?
                    .map_err(DriverError::Handshake)?,
                None => handshake.await.map_err(DriverError::Handshake)?,
            };
            Box::new(tls_stream)
        } else {
            Box::new(stream)
        };

        let endpoint = Self::start(stream, recv_handler, log, remote_name, local_name, None);

        // There is no excuse for not checking that this is a valid
        // connection: when dialing a forwarded port whose backing service is
        // down, the listener accepts and instantly drops the connection.
        // Waiting a beat lets the reader observe that hangup. Peers slower
        // than the probe window are caught later by the normal error path.
        time::sleep(VALIDITY_PROBE).await;
        if endpoint.is_closed() {
            return Err(DriverError::ImmediatelyClosed);
        }

        Ok(endpoint)
    }

    /// Build the inner endpoint around a socket the [`crate::TcpServer`] just
    /// accepted, performing the server side of the TLS handshake within
    /// `handshake_wait` when TLS is configured.
    pub(crate) async fn from_accepted(
        stream: TcpStream,
        recv_handler: ReceiveHandler,
        log: LoggingCallbacks,
        keepalive: bool,
        tls_acceptor: Option<(TlsAcceptor, Duration)>,
        on_invalidate: InvalidateHook,
    ) -> Result<Self, DriverError> {
        configure_keepalive(&stream, keepalive)?;
        let remote_name = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local_name = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let stream: BoxedStream = match tls_acceptor {
            Some((acceptor, handshake_wait)) => {
                match time::timeout(handshake_wait, acceptor.accept(stream)).await {
                    Err(_) => return Err(DriverError::HandshakeTimeout),
                    Ok(Err(err)) => return Err(DriverError::Handshake(err)),
                    Ok(Ok(tls_stream)) => Box::new(tls_stream),
                }
            }
            None => Box::new(stream),
        };

        let endpoint = Self::start(
            stream,
            recv_handler,
            log,
            remote_name,
            local_name,
            Some(on_invalidate),
        );

        // same immediate-hangup probe as the dialing constructor
        time::sleep(VALIDITY_PROBE).await;
        if endpoint.is_closed() {
            return Err(DriverError::ImmediatelyClosed);
        }

        Ok(endpoint)
    }

    fn start(
        stream: BoxedStream,
        recv_handler: ReceiveHandler,
        log: LoggingCallbacks,
        remote_name: String,
        local_name: String,
        on_invalidate: Option<InvalidateHook>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let shared = Arc::new(TcpShared {
            closed: AtomicBool::new(false),
            close_initiated: AtomicBool::new(false),
            close_mutex: Mutex::new(()),
            cancel_tx,
            done_rx,
            writer: Mutex::new(Some(writer)),
            recv_handler,
            log,
            on_invalidate: std::sync::Mutex::new(on_invalidate),
        });

        spawn_reader(Arc::clone(&shared), reader, done_tx);

        Self {
            shared,
            remote_name,
            local_name,
        }
    }

}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn send(&self, data: &[u8]) -> Result<(), DriverError> {
        if self.shared.is_closed() {
            return Err(DriverError::Closed);
        }

        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(DriverError::Closed)?;

        let mut written = 0usize;
        while written < data.len() {
            match writer.write(&data[written..]).await {
                Ok(0) => {
                    drop(guard);
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        let _ = shared.close().await;
                    });
                    self.shared.fire_invalidate();
                    return Err(DriverError::Send {
                        written,
                        source: std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "socket accepted no bytes",
                        ),
                    });
                }
                Ok(n) => written += n,
                Err(err) => {
                    drop(guard);
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        let _ = shared.close().await;
                    });
                    self.shared.fire_invalidate();
                    return Err(DriverError::Send {
                        written,
                        source: err,
                    });
                }
            }
        }
        if let Err(err) = writer.flush().await {
            drop(guard);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let _ = shared.close().await;
            });
            self.shared.fire_invalidate();
            return Err(DriverError::Send {
                written,
                source: err,
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.shared.close().await
    }

    async fn close_active(&self) -> Result<(), DriverError> {
        self.close().await
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn ready(&self) -> bool {
        // a dialed connection always has its peer
        true
    }

    fn timed_out(&self) -> bool {
        // a dial timeout fails construction, so a live endpoint never saw one
        false
    }

    fn remote_name(&self) -> String {
        self.remote_name.clone()
    }

    fn local_name(&self) -> String {
        self.local_name.clone()
    }
}

fn configure_keepalive(stream: &TcpStream, enabled: bool) -> Result<(), DriverError> {
    if !enabled {
        return Ok(());
    }
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_PERIOD))
        .map_err(DriverError::Connect)
}

fn spawn_reader(
    shared: Arc<TcpShared>,
    mut reader: ReadHalf<BoxedStream>,
    done_tx: watch::Sender<bool>,
) {
    let mut cancel_rx = shared.cancel_tx.subscribe();
    tokio::spawn(async move {
        let mut buf = [0u8; READER_BUFFER_SIZE];
        loop {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    // close() asked us to stop; nothing to report
                    break;
                }
                res = reader.read(&mut buf) => match res {
                    Ok(0) => {
                        if shared.close_initiated() {
                            shared.log.debug("remote hung up during close".into());
                        } else {
                            let err = DriverError::RemoteClosed;
                            shared
                                .log
                                .error(&err, format!("socket closed unexpectedly: {err}"));
                        }
                        break;
                    }
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        shared
                            .log
                            .trace(format!("received bytes {}", hex_string(&data)));
                        // handler runs on its own task: a panicking handler
                        // must not kill future receive dispatch, and the
                        // reader can get back to the socket immediately
                        let handler = Arc::clone(&shared.recv_handler);
                        tokio::spawn(async move { handler(data) });
                    }
                    Err(err) => {
                        if shared.close_initiated() {
                            shared
                                .log
                                .debug(format!("while closing, got non-close error: {err}"));
                        } else {
                            let err = DriverError::Socket(err);
                            shared.log.error(&err, format!("{err}"));
                        }
                        break;
                    }
                }
            }
        }
        shared.closed.store(true, Ordering::SeqCst);
        let _ = done_tx.send(true);
        if !shared.close_initiated() {
            // the reader found the failure itself, so nobody else is going
            // to release the socket
            shared.force_close_socket().await;
        }
        shared.fire_invalidate();
    });
}
