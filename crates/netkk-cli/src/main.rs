//! netkk entry point: flag parsing, logging setup, endpoint wiring, and exit
//! code mapping.

use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{debug, error, trace, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use netkk_console::{
    execute_script, start_prompt, wait_until_ready, CommandRegistry, ConsoleError, SessionConfig,
    SessionState,
};
use netkk_driver::{
    ClientConnectedHandler, DriverError, Endpoint, LoggingCallbacks, Options, ReceiveHandler,
    TcpEndpoint, TcpServer, UdpEndpoint,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const EXIT_GENERIC_ERROR: u8 = 1;
const EXIT_SCRIPT_COMMAND_ERROR: u8 = 2;
const EXIT_ARGUMENTS_ERROR: u8 = 3;
const EXIT_IO_ERROR: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn label(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "netkk",
    version,
    about = "Interactive console for exchanging raw bytes with a remote host over TCP or UDP"
)]
struct Cli {
    /// Network protocol to speak.
    #[arg(long, value_enum, default_value_t = Protocol::Tcp)]
    protocol: Protocol,

    /// Dial out to a remote peer.
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "listen")]
    remote: Option<String>,

    /// Listen for a peer instead of dialing. A bare port binds 127.0.0.1.
    #[arg(long, value_name = "[BIND:]PORT")]
    listen: Option<String>,

    /// Seconds to wait for the initial connection or first datagram before
    /// giving up. 0 waits forever.
    #[arg(long, default_value_t = 10, value_name = "SECONDS")]
    timeout: u64,

    /// Enable TLS. TCP only.
    #[arg(long)]
    tls: bool,

    /// Do not verify server certificates when using TLS.
    #[arg(long)]
    insecure_skip_verify: bool,

    /// PEM file of additional certificate authorities to trust when using
    /// TLS.
    #[arg(long, value_name = "FILE")]
    trustchain: Option<PathBuf>,

    /// Server certificate for a TLS listener. Requires --server-key; when
    /// absent a self-signed certificate is generated.
    #[arg(long, value_name = "FILE")]
    server_cert: Option<PathBuf>,

    /// Server private key for a TLS listener.
    #[arg(long, value_name = "FILE")]
    server_key: Option<PathBuf>,

    /// Common name to embed in a generated self-signed certificate.
    #[arg(long, value_name = "NAME")]
    cert_common_name: Option<String>,

    /// Comma-separated IP addresses to embed in a generated self-signed
    /// certificate.
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    cert_ips: Vec<IpAddr>,

    /// Turn off TCP keepalive probes.
    #[arg(long)]
    no_keepalives: bool,

    /// Read statements until a line ends with a semicolon instead of sending
    /// each line.
    #[arg(long)]
    multiline: bool,

    /// Suppress prompt decorations; received data is prefixed with "> ".
    #[arg(long)]
    no_prompt: bool,

    /// Silence all output except for received data. Overrides verbose mode.
    #[arg(short, long)]
    quiet: bool,

    /// Make output more verbose; repeatable for more detail.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Command(s) to execute, after which the program exits. Runs before any
    /// script files.
    #[arg(short = 'C', long = "command", value_name = "STR")]
    commands: Vec<String>,

    /// Script file(s) to execute, after which the program exits.
    #[arg(short = 'f', long = "script-file", value_name = "FILE")]
    script_files: Vec<PathBuf>,

    /// Append a detailed log to the given file.
    #[arg(short = 'l', long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Macro definitions file to load at startup.
    #[arg(long, value_name = "FILE")]
    macrofile: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("{0}")]
    Arguments(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("{context}: {source}")]
    Script {
        context: String,
        source: ConsoleError,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Console(ConsoleError),
    #[error("{source}: got unexpected EOF")]
    PromptEof { source: ConsoleError },
}

impl AppError {
    fn exit_code(&self) -> u8 {
        match self {
            AppError::Arguments(_) => EXIT_ARGUMENTS_ERROR,
            AppError::Driver(_) => EXIT_GENERIC_ERROR,
            AppError::Script { .. } => EXIT_SCRIPT_COMMAND_ERROR,
            AppError::Io { .. } => EXIT_IO_ERROR,
            AppError::Console(_) => EXIT_IO_ERROR,
            AppError::PromptEof { .. } => EXIT_IO_ERROR,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_ARGUMENTS_ERROR,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<(), AppError> {
    init_tracing(&cli)?;

    let target = validate_flags(&cli)?;
    let interactive = cli.commands.is_empty() && cli.script_files.is_empty();

    let opts = Options {
        tls_enabled: cli.tls,
        tls_skip_verify: cli.insecure_skip_verify,
        tls_trust_chain: cli.trustchain.clone(),
        tls_server_cert_file: cli.server_cert.clone(),
        tls_server_key_file: cli.server_key.clone(),
        tls_server_cert_common_name: cli.cert_common_name.clone(),
        tls_server_cert_ips: cli.cert_ips.clone(),
        connection_timeout: (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout)),
        disable_keepalives: cli.no_keepalives,
    };

    // receive formatting happens here so the drivers stay policy-free
    let receive_prefix = if cli.no_prompt { "> " } else { "REMOTE>> " };
    let recv_handler: ReceiveHandler = Arc::new(move |data: Vec<u8>| {
        println!("{receive_prefix}{}", pretty_hex(&data));
    });

    // the reader task reports errors through the callbacks; an expected
    // remote EOF is remembered rather than printed so the session can
    // annotate its own exit instead
    let saw_remote_eof = Arc::new(AtomicBool::new(false));
    let log_callbacks = build_log_callbacks(Arc::clone(&saw_remote_eof));

    let chatty = interactive && !cli.quiet;
    match &target {
        Target::Remote(host, port) => {
            if chatty {
                println!("Connecting to {host}:{port}...");
            }
        }
        Target::Listen(bind, port) => {
            if chatty {
                println!("Listening on {bind}:{port}...");
            }
        }
    }

    let endpoint = open_endpoint(&cli, &target, recv_handler, log_callbacks, &opts).await?;

    let mut state = SessionState::new(interactive);
    if let Some(path) = &cli.macrofile {
        let file = File::open(path).map_err(|err| AppError::Io {
            context: format!("problem opening {path:?}"),
            source: err,
        })?;
        state
            .macros
            .import(BufReader::new(file), false)
            .map_err(|err| AppError::Arguments(format!("problem in macrofile {path:?}: {err}")))?;
    }

    let registry = CommandRegistry::new();
    let config = SessionConfig {
        version: VERSION.to_string(),
        multiline: cli.multiline,
        banner: chatty && !cli.no_prompt,
        history_path: interactive.then(|| history_path(cli.protocol)).flatten(),
    };

    let result = if interactive {
        run_interactive(&endpoint, &registry, &mut state, &config, &saw_remote_eof).await
    } else {
        run_batch(&cli, &endpoint, &registry, &mut state, &config).await
    };

    if chatty && result.is_ok() {
        println!("Closing connection...");
    }
    if let Err(err) = endpoint.close().await {
        warn!("{err}");
    }

    result
}

#[derive(Debug)]
enum Target {
    Remote(String, u16),
    Listen(String, u16),
}

fn validate_flags(cli: &Cli) -> Result<Target, AppError> {
    let target = match (&cli.remote, &cli.listen) {
        (Some(remote), None) => {
            let (host, port) = parse_host_port(remote)
                .ok_or_else(|| AppError::Arguments(format!("invalid --remote value {remote:?}")))?;
            Target::Remote(host, port)
        }
        (None, Some(listen)) => {
            let (bind, port) = parse_listen_spec(listen)
                .ok_or_else(|| AppError::Arguments(format!("invalid --listen value {listen:?}")))?;
            Target::Listen(bind, port)
        }
        (None, None) => {
            return Err(AppError::Arguments(
                "one of --remote or --listen must be given".into(),
            ))
        }
        (Some(_), Some(_)) => unreachable!("clap marks the flags as conflicting"),
    };

    if cli.tls && cli.protocol == Protocol::Udp {
        return Err(AppError::Arguments(
            "TLS over UDP (DTLS) is not supported".into(),
        ));
    }
    if cli.server_cert.is_some() != cli.server_key.is_some() {
        return Err(AppError::Arguments(
            "--server-cert and --server-key must be given together".into(),
        ));
    }
    if !cli.tls {
        if cli.trustchain.is_some() {
            warn!("--trustchain option given but TLS is not enabled; ignoring");
        }
        if cli.insecure_skip_verify {
            warn!("--insecure-skip-verify option set but TLS is not enabled; ignoring");
        }
        if cli.server_cert.is_some() {
            warn!("server certificate options given but TLS is not enabled; ignoring");
        }
    } else if cli.insecure_skip_verify {
        warn!("--insecure-skip-verify given; server certificate will not be verified");
    }

    Ok(target)
}

async fn open_endpoint(
    cli: &Cli,
    target: &Target,
    recv_handler: ReceiveHandler,
    log_callbacks: LoggingCallbacks,
    opts: &Options,
) -> Result<Arc<dyn Endpoint>, AppError> {
    let endpoint: Arc<dyn Endpoint> = match (cli.protocol, target) {
        (Protocol::Tcp, Target::Remote(host, port)) => {
            let connected =
                TcpEndpoint::connect(recv_handler, log_callbacks, host, *port, opts).await;
            match connected {
                Ok(endpoint) => Arc::new(endpoint),
                Err(err) => {
                    let tls_text = if cli.tls { "TLS" } else { "non-TLS" };
                    if !matches!(err, DriverError::ConnectTimeout) {
                        eprintln!(
                            "Ensure the remote server is up and supports {tls_text} TCP \
                             connections"
                        );
                    }
                    return Err(err.into());
                }
            }
        }
        (Protocol::Tcp, Target::Listen(bind, port)) => {
            let chatty = !cli.quiet;
            let on_connect: ClientConnectedHandler = Arc::new(move |addr: String| {
                if chatty {
                    println!("Client connected from {addr}");
                }
            });
            Arc::new(
                TcpServer::open(
                    recv_handler,
                    Some(on_connect),
                    log_callbacks,
                    Some(bind.as_str()),
                    *port,
                    opts,
                )
                .await?,
            )
        }
        (Protocol::Udp, Target::Remote(host, port)) => Arc::new(
            UdpEndpoint::open(
                recv_handler,
                log_callbacks,
                Some((host.as_str(), *port)),
                None,
                0,
                opts,
            )
            .await?,
        ),
        (Protocol::Udp, Target::Listen(bind, port)) => Arc::new(
            UdpEndpoint::open(
                recv_handler,
                log_callbacks,
                None,
                Some(bind.as_str()),
                *port,
                opts,
            )
            .await?,
        ),
    };
    Ok(endpoint)
}

async fn run_interactive(
    endpoint: &Arc<dyn Endpoint>,
    registry: &CommandRegistry,
    state: &mut SessionState,
    config: &SessionConfig,
    saw_remote_eof: &Arc<AtomicBool>,
) -> Result<(), AppError> {
    match start_prompt(Arc::clone(endpoint), registry, state, config).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let ConsoleError::ClosedBeforeReady = &err {
                if endpoint.timed_out() {
                    return Err(AppError::Driver(DriverError::ConnectTimeout));
                }
            }
            if saw_remote_eof.load(Ordering::SeqCst) {
                // the driver suppressed the expected-EOF report; surface it
                // with the session's own failure
                return Err(AppError::PromptEof { source: err });
            }
            Err(AppError::Console(err))
        }
    }
}

async fn run_batch(
    cli: &Cli,
    endpoint: &Arc<dyn Endpoint>,
    registry: &CommandRegistry,
    state: &mut SessionState,
    config: &SessionConfig,
) -> Result<(), AppError> {
    wait_until_ready(endpoint).await.map_err(|err| {
        if endpoint.timed_out() {
            AppError::Driver(DriverError::ConnectTimeout)
        } else {
            AppError::Console(err)
        }
    })?;

    for (idx, command) in cli.commands.iter().enumerate() {
        let input = std::io::Cursor::new(command.clone());
        execute_script(input, endpoint, registry, state, config)
            .await
            .map_err(|err| AppError::Script {
                context: format!("command #{}", idx + 1),
                source: err,
            })?;
    }

    for path in &cli.script_files {
        let file = File::open(path).map_err(|err| AppError::Io {
            context: format!("problem opening {path:?}"),
            source: err,
        })?;
        let lines = execute_script(BufReader::new(file), endpoint, registry, state, config)
            .await
            .map_err(|err| AppError::Script {
                context: format!("{}", path.display()),
                source: err,
            })?;
        debug!("executed {lines} lines in {path:?}");
    }

    Ok(())
}

fn init_tracing(cli: &Cli) -> Result<(), AppError> {
    let default_directive = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(
            default_directive
                .parse()
                .unwrap_or_else(|_| "info".parse().expect("static directive")),
        )
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &cli.log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| AppError::Io {
                    context: format!("could not open log file {path:?}"),
                    source: err,
                })?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file));
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init();
        }
    }
    Ok(())
}

fn build_log_callbacks(saw_remote_eof: Arc<AtomicBool>) -> LoggingCallbacks {
    LoggingCallbacks::new(
        Arc::new(|msg| trace!(target: "netkk::driver", "{msg}")),
        Arc::new(|msg| debug!(target: "netkk::driver", "{msg}")),
        Arc::new(|msg| warn!(target: "netkk::driver", "{msg}")),
        Arc::new(move |err, msg| {
            if matches!(err, DriverError::RemoteClosed) {
                saw_remote_eof.store(true, Ordering::SeqCst);
                debug!(target: "netkk::driver", "{msg}");
            } else {
                error!(target: "netkk::driver", "{msg}");
            }
        }),
    )
}

fn pretty_hex(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("0x{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse `HOST:PORT`, with IPv6 hosts in brackets.
fn parse_host_port(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Parse `[BIND:]PORT`; a bare port binds loopback.
fn parse_listen_spec(value: &str) -> Option<(String, u16)> {
    if let Ok(port) = value.parse::<u16>() {
        if port == 0 {
            return None;
        }
        return Some(("127.0.0.1".to_string(), port));
    }
    parse_host_port(value)
}

fn history_path(protocol: Protocol) -> Option<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)?;
    let app_dir = home.join(".netkk");
    if let Err(err) = std::fs::create_dir_all(&app_dir) {
        warn!("couldn't create ~/.netkk; command history will be limited to this session: {err}");
        return None;
    }
    Some(app_dir.join(format!("history-{}", protocol.label())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_pairs() {
        assert_eq!(
            Some(("example.com".to_string(), 8080)),
            parse_host_port("example.com:8080")
        );
        assert_eq!(
            Some(("::1".to_string(), 443)),
            parse_host_port("[::1]:443")
        );
        assert_eq!(None, parse_host_port("example.com"));
        assert_eq!(None, parse_host_port(":1234"));
        assert_eq!(None, parse_host_port("host:0"));
        assert_eq!(None, parse_host_port("host:notaport"));
    }

    #[test]
    fn listen_spec_defaults_to_loopback() {
        assert_eq!(
            Some(("127.0.0.1".to_string(), 42002)),
            parse_listen_spec("42002")
        );
        assert_eq!(
            Some(("0.0.0.0".to_string(), 42002)),
            parse_listen_spec("0.0.0.0:42002")
        );
        assert_eq!(None, parse_listen_spec("0"));
    }

    #[test]
    fn hex_output_matches_receive_format() {
        assert_eq!("0x48 0x49", pretty_hex(&[0x48, 0x49]));
        assert_eq!("", pretty_hex(&[]));
    }

    #[test]
    fn cli_parses_spec_surface() {
        let cli = Cli::try_parse_from([
            "netkk",
            "--protocol",
            "udp",
            "--listen",
            "127.0.0.1:42003",
            "--timeout",
            "5",
            "--multiline",
            "-vv",
        ])
        .expect("parse");
        assert_eq!(Protocol::Udp, cli.protocol);
        assert_eq!(Some("127.0.0.1:42003".to_string()), cli.listen);
        assert_eq!(5, cli.timeout);
        assert!(cli.multiline);
        assert_eq!(2, cli.verbose);
    }

    #[test]
    fn remote_and_listen_conflict() {
        let err = Cli::try_parse_from([
            "netkk",
            "--remote",
            "localhost:1",
            "--listen",
            "2",
        ])
        .expect_err("conflicting flags");
        assert_eq!(ErrorKind::ArgumentConflict, err.kind());
    }

    #[test]
    fn tls_over_udp_is_an_argument_error() {
        let cli = Cli::try_parse_from([
            "netkk",
            "--protocol",
            "udp",
            "--listen",
            "42003",
            "--tls",
        ])
        .expect("parse");
        let err = validate_flags(&cli).expect_err("must reject DTLS");
        assert!(matches!(err, AppError::Arguments(_)));
    }

    #[test]
    fn server_cert_requires_server_key() {
        let cli = Cli::try_parse_from([
            "netkk",
            "--listen",
            "42002",
            "--tls",
            "--server-cert",
            "cert.pem",
        ])
        .expect("parse");
        let err = validate_flags(&cli).expect_err("must reject lone cert");
        assert!(matches!(err, AppError::Arguments(_)));
    }
}
