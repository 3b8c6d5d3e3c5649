//! Listening TCP endpoint.
//!
//! The server admits exactly one client at a time: once a connection is
//! established (including the TLS handshake, when configured), later connects
//! are dropped on arrival. The accepted socket is wrapped in an inner
//! [`TcpEndpoint`] that does all the actual byte work; the server proper only
//! manages the listener, the established-client slot, and TLS material.
//!
//! When the admitted client goes away the listener does not resume
//! accepting; the server winds itself down and reports closed.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time;
use tokio_rustls::TlsAcceptor;

use crate::tcp::TcpEndpoint;
use crate::{
    tls, ClientConnectedHandler, DriverError, Endpoint, LoggingCallbacks, Options, ReceiveHandler,
    CLOSE_GRACE, MAX_TLS_HANDSHAKE_WAIT,
};

#[derive(Default)]
struct EstabSlot {
    endpoint: Option<Arc<TcpEndpoint>>,
    client_addr: Option<SocketAddr>,
}

struct ServerShared {
    log: LoggingCallbacks,
    on_recv: ReceiveHandler,
    on_connect: ClientConnectedHandler,
    keep_alives: bool,
    tls_acceptor: Option<TlsAcceptor>,
    timeout: Option<Duration>,
    timed_out: AtomicBool,
    closed: AtomicBool,
    close_initiated: AtomicBool,
    close_mutex: Mutex<()>,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    // all reads and writes of the established client go through this lock
    estab: StdMutex<EstabSlot>,
    admitted: AtomicBool,
}

impl ServerShared {
    fn close_initiated(&self) -> bool {
        self.close_initiated.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn client_is_connected(&self) -> bool {
        self.estab
            .lock()
            .expect("estab lock")
            .endpoint
            .as_ref()
            .map(|ep| !ep.is_closed())
            .unwrap_or(false)
    }

    fn client_addr(&self) -> Option<SocketAddr> {
        self.estab.lock().expect("estab lock").client_addr
    }

    fn current_endpoint(&self) -> Option<Arc<TcpEndpoint>> {
        self.estab.lock().expect("estab lock").endpoint.clone()
    }

    fn publish_estab(&self, endpoint: Arc<TcpEndpoint>, addr: SocketAddr) {
        let mut slot = self.estab.lock().expect("estab lock");
        slot.endpoint = Some(endpoint);
        slot.client_addr = Some(addr);
        self.admitted.store(true, Ordering::SeqCst);
    }

    /// The single writer that clears the established slot. Used by
    /// `close_active`, the full close path, and the inner endpoint's
    /// on-invalidate hook.
    async fn invalidate_estab(&self) -> Result<(), DriverError> {
        let taken = {
            let mut slot = self.estab.lock().expect("estab lock");
            slot.endpoint.take()
        };
        if let Some(endpoint) = taken {
            if let Err(err) = endpoint.close().await {
                self.log
                    .debug(format!("problem closing established after invalidation: {err}"));
                return Err(err);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        {
            let _guard = self.close_mutex.lock().await;
            if self.is_closed() {
                return Ok(()); // it's already been closed
            }
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

        self.invalidate_estab().await
    }
}

/// A TCP server that listens for exactly one client and then behaves like a
/// connection to that client.
pub struct TcpServer {
    shared: Arc<ServerShared>,
    local_name: String,
}

impl TcpServer {
    /// Bind and listen on the given address, then start accepting in the
    /// background. With TLS enabled and no certificate files configured, a
    /// self-signed identity is generated and its CA published to a
    /// `netkk-ca-<timestamp>.pem` file in the working directory before the
    /// first client can be accepted.
    pub async fn open(
        recv_handler: ReceiveHandler,
        on_connect: Option<ClientConnectedHandler>,
        log: LoggingCallbacks,
        bind_addr: Option<&str>,
        port: u16,
        opts: &Options,
    ) -> Result<Self, DriverError> {
        let bind_ip = match bind_addr {
            Some(addr) => crate::resolve_host(addr).await?,
            None => IpAddr::from([0u8, 0, 0, 0]),
        };

        let tls_acceptor = if opts.tls_enabled {
            let server_tls = tls::server_config(opts)?;
            if let Some(ca_pem) = &server_tls.generated_ca_pem {
                publish_ca_file(ca_pem, &log);
            }
            Some(TlsAcceptor::from(Arc::new(server_tls.config)))
        } else {
            None
        };

        let listener = TcpListener::bind(SocketAddr::new(bind_ip, port))
            .await
            .map_err(DriverError::Listen)?;
        let local_name = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let shared = Arc::new(ServerShared {
            log,
            on_recv: recv_handler,
            on_connect: on_connect.unwrap_or_else(|| Arc::new(|_| {})),
            keep_alives: !opts.disable_keepalives,
            tls_acceptor,
            timeout: opts.connection_timeout,
            timed_out: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_initiated: AtomicBool::new(false),
            close_mutex: Mutex::new(()),
            cancel_tx,
            done_rx,
            estab: StdMutex::new(EstabSlot::default()),
            admitted: AtomicBool::new(false),
        });

        spawn_accept_loop(Arc::clone(&shared), listener, done_tx);

        Ok(Self { shared, local_name })
    }
}

#[async_trait]
impl Endpoint for TcpServer {
    async fn send(&self, data: &[u8]) -> Result<(), DriverError> {
        if !self.ready() {
            return Err(DriverError::NoPeer);
        }
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        let endpoint = self.shared.current_endpoint().ok_or(DriverError::NoPeer)?;
        endpoint.send(data).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.shared.close().await
    }

    async fn close_active(&self) -> Result<(), DriverError> {
        self.shared.invalidate_estab().await
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn ready(&self) -> bool {
        self.shared.client_is_connected()
    }

    fn timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::SeqCst)
    }

    fn remote_name(&self) -> String {
        if !self.ready() {
            return String::new();
        }
        self.shared
            .client_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    fn local_name(&self) -> String {
        self.local_name.clone()
    }
}

/// Write the generated CA to the working directory so clients can opt in to
/// trusting it. Failure is only a warning: the server still works, there is
/// just no way to hand clients the trust anchor.
fn publish_ca_file(ca_pem: &str, log: &LoggingCallbacks) {
    let stamp = Utc::now()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
        .replace(':', "-");
    let filename = format!("netkk-ca-{stamp}.pem");
    match fs::write(&filename, ca_pem) {
        Ok(()) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&filename, fs::Permissions::from_mode(0o667));
            }
            println!("Wrote self-signed CA to {filename:?}");
        }
        Err(err) => {
            log.warn(format!(
                "could not write generated CA cert for self-signed cert: {err}"
            ));
        }
    }
}

fn spawn_accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    done_tx: watch::Sender<bool>,
) {
    let mut cancel_rx = shared.cancel_tx.subscribe();
    tokio::spawn(async move {
        loop {
            if shared.close_initiated() || shared.is_closed() {
                break;
            }

            shared.log.trace("listening for client connection...".into());
            let accepted = tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    if shared.close_initiated() {
                        // close requested while blocked in accept
                        continue;
                    }
                    // the admitted client disconnected; per the one-client
                    // policy the listener does not resume accepting
                    shared
                        .log
                        .debug("active client disconnected; no longer accepting".into());
                    break;
                }
                res = async {
                    match shared.timeout {
                        Some(limit) => time::timeout(limit, listener.accept()).await,
                        None => Ok(listener.accept().await),
                    }
                } => res,
            };

            let (client_sock, client_addr) = match accepted {
                Err(_elapsed) => {
                    if shared.close_initiated() {
                        continue;
                    }
                    if shared.client_is_connected() {
                        // the deadline only guards the wait for the first
                        // client
                        continue;
                    }
                    shared.timed_out.store(true, Ordering::SeqCst);
                    let err = DriverError::ConnectTimeout;
                    shared
                        .log
                        .error(&err, "timed out while waiting for connection".into());
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let _ = shared.close().await;
                    });
                    break;
                }
                Ok(Err(err)) => {
                    let err = DriverError::Socket(err);
                    shared
                        .log
                        .error(&err, format!("could not accept client connection: {err}"));
                    let shared_for_close = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let _ = shared_for_close.close().await;
                    });
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            if shared.client_is_connected() {
                // this is an interactive console; there can be no more than
                // one conversation partner
                shared.log.trace(format!(
                    "rejected connection from client at {client_addr} due to already being in \
                     active communication with another"
                ));
                drop(client_sock);
                continue;
            }

            handle_accept(&shared, client_sock, client_addr).await;
        }

        // release anything still admitted before reporting done
        let _ = shared.invalidate_estab().await;
        shared.closed.store(true, Ordering::SeqCst);
        let _ = done_tx.send(true);
    });
}

async fn handle_accept(shared: &Arc<ServerShared>, client_sock: TcpStream, client_addr: SocketAddr) {
    shared.log.trace("accepting connection...".into());

    let tls = shared.tls_acceptor.clone().map(|acceptor| {
        // a hostile client must not be able to stall the server by never
        // sending its hello; cap the handshake at the earlier of the fixed
        // ceiling and the remaining accept deadline
        let wait = match shared.timeout {
            Some(limit) => limit.min(MAX_TLS_HANDSHAKE_WAIT),
            None => MAX_TLS_HANDSHAKE_WAIT,
        };
        shared
            .log
            .debug(format!("waiting up to {wait:?} for TLS client hello..."));
        (acceptor, wait)
    });

    let hook_shared = Arc::clone(shared);
    let on_invalidate: crate::tcp::InvalidateHook = Box::new(move || {
        tokio::spawn(async move {
            let _ = hook_shared.invalidate_estab().await;
            // one client has come and gone; wake the accept loop so it can
            // wind the server down
            if hook_shared.admitted.load(Ordering::SeqCst) {
                let _ = hook_shared.cancel_tx.send(true);
            }
        });
    });

    let endpoint = TcpEndpoint::from_accepted(
        client_sock,
        Arc::clone(&shared.on_recv),
        shared.log.clone(),
        shared.keep_alives,
        tls,
        on_invalidate,
    )
    .await;

    match endpoint {
        Ok(endpoint) => {
            shared.publish_estab(Arc::new(endpoint), client_addr);
            // run the callback detached so it breaking doesn't blow up the
            // accept loop
            let on_connect = Arc::clone(&shared.on_connect);
            let addr = client_addr.to_string();
            tokio::spawn(async move { on_connect(addr) });
        }
        Err(DriverError::HandshakeTimeout) => {
            shared.log.debug(
                "abandoning connection; client did not send TLS hello within handshake timeout \
                 period"
                    .into(),
            );
        }
        Err(err) => {
            shared.log.debug(format!(
                "abandoning connection; could not create TCP connection to client: {err}"
            ));
        }
    }
}
