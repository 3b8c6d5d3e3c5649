//! UDP endpoint, in connected and half-open flavors.
//!
//! With a remote supplied at construction the socket is connected and behaves
//! like a dialed TCP endpoint minus the handshake. With only a local bind the
//! endpoint starts *half-open*: it listens with no peer, then pins the source
//! address of the first datagram it receives as the peer for the rest of its
//! life. Datagrams from any other source are dropped without delivery.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time;

use crate::{
    hex_string, DriverError, Endpoint, LoggingCallbacks, Options, ReceiveHandler, CLOSE_GRACE,
    READER_BUFFER_SIZE,
};

struct UdpShared {
    socket: Arc<UdpSocket>,
    started_half_open: bool,
    first_connected: StdMutex<Option<SocketAddr>>,
    remote_name: StdMutex<String>,
    timeout: Option<Duration>,
    timed_out: AtomicBool,
    closed: AtomicBool,
    close_initiated: AtomicBool,
    close_mutex: Mutex<()>,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    recv_handler: ReceiveHandler,
    log: LoggingCallbacks,
}

impl UdpShared {
    fn close_initiated(&self) -> bool {
        self.close_initiated.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pinned(&self) -> Option<SocketAddr> {
        *self.first_connected.lock().expect("pin lock")
    }
}

/// An open UDP socket exchanging datagrams with exactly one peer.
pub struct UdpEndpoint {
    shared: Arc<UdpShared>,
}

impl UdpEndpoint {
    /// Open a UDP endpoint.
    ///
    /// With `remote` given the socket is connected to that peer and is ready
    /// immediately. Without it, `local_port` must be non-zero and the
    /// endpoint listens half-open until the first datagram arrives. TLS is
    /// never available over UDP.
    pub async fn open(
        recv_handler: ReceiveHandler,
        log: LoggingCallbacks,
        remote: Option<(&str, u16)>,
        bind_addr: Option<&str>,
        local_port: u16,
        opts: &Options,
    ) -> Result<Self, DriverError> {
        if opts.tls_enabled {
            return Err(DriverError::Configuration(
                "TLS over UDP (DTLS) is not supported".into(),
            ));
        }

        let bind_ip = match bind_addr {
            Some(addr) => Some(crate::resolve_host(addr).await?),
            None => None,
        };

        let (socket, started_half_open, remote_name) = match remote {
            None => {
                if local_port == 0 {
                    return Err(DriverError::Configuration(
                        "need to provide a local port to listen on if not giving a remote host"
                            .into(),
                    ));
                }
                let bind = SocketAddr::new(
                    bind_ip.unwrap_or_else(|| IpAddr::from([0u8, 0, 0, 0])),
                    local_port,
                );
                let socket = UdpSocket::bind(bind).await.map_err(DriverError::Listen)?;
                (socket, true, String::new())
            }
            Some((remote_host, remote_port)) => {
                let remote_ip = crate::resolve_host(remote_host).await?;
                let bind = SocketAddr::new(
                    bind_ip.unwrap_or_else(|| unspecified_for(remote_ip)),
                    local_port,
                );
                let socket = UdpSocket::bind(bind).await.map_err(DriverError::Connect)?;
                socket
                    .connect(SocketAddr::new(remote_ip, remote_port))
                    .await
                    .map_err(DriverError::Connect)?;
                (socket, false, format!("{remote_host}:{remote_port}"))
            }
        };

        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let shared = Arc::new(UdpShared {
            socket: Arc::new(socket),
            started_half_open,
            first_connected: StdMutex::new(None),
            remote_name: StdMutex::new(remote_name),
            timeout: opts.connection_timeout,
            timed_out: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_initiated: AtomicBool::new(false),
            close_mutex: Mutex::new(()),
            cancel_tx,
            done_rx,
            recv_handler,
            log,
        });

        spawn_reader(Arc::clone(&shared), done_tx);

        Ok(Self { shared })
    }
}

#[async_trait]
impl Endpoint for UdpEndpoint {
    async fn send(&self, data: &[u8]) -> Result<(), DriverError> {
        if self.shared.is_closed() {
            return Err(DriverError::Closed);
        }
        if !self.ready() {
            return Err(DriverError::NoPeer);
        }

        let result = if self.shared.started_half_open {
            let peer = self.shared.pinned().ok_or(DriverError::NoPeer)?;
            self.shared.socket.send_to(data, peer).await
        } else {
            self.shared.socket.send(data).await
        };
        match result {
            Ok(_) => Ok(()),
            Err(err) => Err(DriverError::Send {
                written: 0,
                source: err,
            }),
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        {
            let _guard = self.shared.close_mutex.lock().await;
            if self.shared.is_closed() {
                return Ok(()); // it's already been closed
            }
            self.shared.close_initiated.store(true, Ordering::SeqCst);
            self.shared.closed.store(true, Ordering::SeqCst);
            let _ = self.shared.cancel_tx.send(true);
        }

        let mut done = self.shared.done_rx.clone();
        let wait = async {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        if time::timeout(CLOSE_GRACE, wait).await.is_err() {
            self.shared
                .log
                .trace("clean close timed out after short timeout; forcing unclean close".into());
        }
        // dropping the last socket reference releases it; the reader task
        // exits on the cancel signal and holds the only other reference
        Ok(())
    }

    async fn close_active(&self) -> Result<(), DriverError> {
        self.close().await
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn ready(&self) -> bool {
        if self.shared.started_half_open {
            return self.shared.pinned().is_some();
        }
        true
    }

    fn timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::SeqCst)
    }

    fn remote_name(&self) -> String {
        self.shared.remote_name.lock().expect("name lock").clone()
    }

    fn local_name(&self) -> String {
        self.shared
            .socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

fn unspecified_for(remote: IpAddr) -> IpAddr {
    match remote {
        IpAddr::V4(_) => IpAddr::from([0u8, 0, 0, 0]),
        IpAddr::V6(_) => IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 0]),
    }
}

fn spawn_reader(shared: Arc<UdpShared>, done_tx: watch::Sender<bool>) {
    let mut cancel_rx = shared.cancel_tx.subscribe();
    tokio::spawn(async move {
        let mut buf = [0u8; READER_BUFFER_SIZE];
        loop {
            let unpinned_half_open = shared.started_half_open && shared.pinned().is_none();

            let received = if unpinned_half_open {
                // while no peer is pinned the connect timeout doubles as the
                // first-datagram deadline
                let recv = shared.socket.recv_from(&mut buf);
                let res = tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    res = async {
                        match shared.timeout {
                            Some(limit) => time::timeout(limit, recv).await,
                            None => Ok(recv.await),
                        }
                    } => res,
                };
                match res {
                    Err(_elapsed) => {
                        if shared.close_initiated() {
                            // close was requested while still listening for
                            // the first peer; nothing to report
                            continue;
                        }
                        shared.timed_out.store(true, Ordering::SeqCst);
                        let err = DriverError::ConnectTimeout;
                        shared
                            .log
                            .error(&err, "timed out while waiting for connection".into());
                        break;
                    }
                    Ok(inner) => inner,
                }
            } else if shared.started_half_open {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    res = shared.socket.recv_from(&mut buf) => res,
                }
            } else {
                let res = tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    res = shared.socket.recv(&mut buf) => res,
                };
                res.map(|n| (n, SocketAddr::new(IpAddr::from([0u8, 0, 0, 0]), 0)))
            };

            let (n, source) = match received {
                Ok(pair) => pair,
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
            };

            if shared.started_half_open {
                let mut pinned = shared.first_connected.lock().expect("pin lock");
                match *pinned {
                    None => {
                        shared
                            .log
                            .debug(format!("first client has connected from {source}"));
                        *pinned = Some(source);
                        *shared.remote_name.lock().expect("name lock") = source.to_string();
                    }
                    // source identity is the full (address, zone, port) triple
                    Some(peer) if peer != source => {
                        shared
                            .log
                            .debug(format!("rejected data from non-first client {source}"));
                        continue;
                    }
                    Some(_) => {}
                }
            }

            if n > 0 {
                let data = buf[..n].to_vec();
                shared
                    .log
                    .trace(format!("received bytes {}", hex_string(&data)));
                let handler = Arc::clone(&shared.recv_handler);
                tokio::spawn(async move { handler(data) });
            }
        }
        shared.closed.store(true, Ordering::SeqCst);
        let _ = done_tx.send(true);
    });
}
