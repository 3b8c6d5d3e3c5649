//! Self-signed TLS bootstrap: the listening endpoint generates its own CA,
//! publishes it to the working directory, and only clients that opt in to
//! trusting that CA can complete the handshake.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time;

use netkk_driver::{
    DriverError, Endpoint, LoggingCallbacks, Options, ReceiveHandler, TcpEndpoint, TcpServer,
};

fn collector() -> (ReceiveHandler, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: ReceiveHandler = Arc::new(move |data: Vec<u8>| {
        sink.lock().expect("seen lock").extend_from_slice(&data);
    });
    (handler, seen)
}

async fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn ca_files() -> HashSet<String> {
    std::fs::read_dir(".")
        .expect("read cwd")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("netkk-ca-") && name.ends_with(".pem"))
        .collect()
}

#[tokio::test]
async fn self_signed_server_publishes_ca_and_requires_opt_in_trust() {
    let before = ca_files();

    let (server_handler, server_seen) = collector();
    let server_opts = Options {
        tls_enabled: true,
        ..Options::default()
    };
    let server = TcpServer::open(
        server_handler,
        None,
        LoggingCallbacks::disabled(),
        Some("127.0.0.1"),
        0,
        &server_opts,
    )
    .await
    .expect("open tls server");

    // the CA file must exist before any handshake is attempted
    let mut created: Vec<String> = ca_files().difference(&before).cloned().collect();
    assert_eq!(1, created.len(), "expected exactly one new CA file");
    let ca_file = created.pop().expect("one file");

    let server_addr: SocketAddr = server.local_name().parse().expect("local name");

    // a client that never opted in to the generated CA must fail verification
    let (untrusted_handler, _) = collector();
    let untrusted = TcpEndpoint::connect(
        untrusted_handler,
        LoggingCallbacks::disabled(),
        "127.0.0.1",
        server_addr.port(),
        &Options {
            tls_enabled: true,
            ..Options::default()
        },
    )
    .await;
    assert!(
        matches!(untrusted, Err(DriverError::Handshake(_))),
        "verification against system roots alone must fail"
    );

    // the rejected handshake must not have consumed the one-client slot
    let (client_handler, client_seen) = collector();
    let client_opts = Options {
        tls_enabled: true,
        tls_trust_chain: Some(ca_file.clone().into()),
        ..Options::default()
    };
    let client = TcpEndpoint::connect(
        client_handler,
        LoggingCallbacks::disabled(),
        "127.0.0.1",
        server_addr.port(),
        &client_opts,
    )
    .await
    .expect("tls connect with published CA");

    let admitted = wait_for(Duration::from_secs(2), || server.ready()).await;
    assert!(admitted, "trusting client never admitted");

    client.send(&[0x01, 0x02]).await.expect("client send");
    let to_server = wait_for(Duration::from_secs(2), || {
        *server_seen.lock().expect("seen lock") == vec![0x01, 0x02]
    })
    .await;
    assert!(to_server, "client bytes never crossed the TLS channel");

    server.send(&[0x03]).await.expect("server send");
    let to_client = wait_for(Duration::from_secs(2), || {
        *client_seen.lock().expect("seen lock") == vec![0x03]
    })
    .await;
    assert!(to_client, "server bytes never crossed the TLS channel");

    client.close().await.expect("client close");
    server.close().await.expect("server close");
    let _ = std::fs::remove_file(ca_file);
}
