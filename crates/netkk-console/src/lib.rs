//! The interactive session loop for netkk.
//!
//! A session wraps an [`Endpoint`] and drives the REPL: it waits for the
//! endpoint to become ready, reads statements (optionally spanning multiple
//! lines), dispatches built-in commands, and sends everything else to the
//! peer as bytes. Connection health is watched the whole time a prompt is
//! blocked, so a vanished peer surfaces immediately instead of after the next
//! keystroke.

mod commands;
pub mod parse;
mod prompt;

pub use commands::{CommandAction, CommandRegistry};

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{debug, trace};

use netkk_driver::{DriverError, Endpoint};
use netkk_macros::{MacroCollection, MacroError};
use parse::{normalize_line, parse_line_to_bytes, ParseError};
use prompt::{Prompt, PromptOutcome};

/// How often readiness is rechecked while waiting for the endpoint to come
/// up.
const READY_POLL: Duration = Duration::from_millis(101);

const FIRST_LEVEL_PREFIX: &str = "netkk> ";
const CONTINUATION_PREFIX: &str = "> ";

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("{}", closed_during_prompt_message(*.transient))]
    ClosedDuringPrompt {
        transient: bool,
        /// Whether the prompt prefix had already been written, so callers
        /// know to emit a newline before any further output.
        prefix_printed: bool,
    },
    #[error("connection was closed before it became ready")]
    ClosedBeforeReady,
    #[error("{0} command only available in interactive mode")]
    InteractiveOnly(String),
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Macro(#[from] MacroError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("prompt error: {0}")]
    Readline(String),
}

fn closed_during_prompt_message(transient: bool) -> &'static str {
    if transient {
        "connection lost while waiting for input"
    } else {
        "connection closed while waiting for input"
    }
}

/// Mutable state commands operate on.
pub struct SessionState {
    pub macros: MacroCollection,
    pub interactive: bool,
}

impl SessionState {
    pub fn new(interactive: bool) -> Self {
        Self {
            macros: MacroCollection::new(),
            interactive,
        }
    }
}

/// Knobs for the interactive loop.
pub struct SessionConfig {
    pub version: String,
    /// Accumulate lines until one ends with a semicolon.
    pub multiline: bool,
    /// Print the startup banner.
    pub banner: bool,
    /// Where command history is persisted, if anywhere.
    pub history_path: Option<PathBuf>,
}

/// Block until the endpoint can accept sends, or fail once it is closed.
pub async fn wait_until_ready(endpoint: &Arc<dyn Endpoint>) -> Result<(), ConsoleError> {
    loop {
        if endpoint.is_closed() {
            return Err(ConsoleError::ClosedBeforeReady);
        }
        if endpoint.ready() {
            return Ok(());
        }
        time::sleep(READY_POLL).await;
    }
}

enum Statement {
    Line { cmd: String, hist: String },
    Eof,
    Interrupted,
}

enum ExecOutcome {
    Continue,
    Exit,
    ClearHistory,
}

/// Run the interactive prompt until the user exits or the connection becomes
/// unusable.
pub async fn start_prompt(
    endpoint: Arc<dyn Endpoint>,
    registry: &CommandRegistry,
    state: &mut SessionState,
    config: &SessionConfig,
) -> Result<(), ConsoleError> {
    wait_until_ready(&endpoint).await?;

    if config.banner {
        print_splash(6);
        println!("[netkarkat v{}]", config.version);
        println!("HELP for help.");
    }

    let mut prompt = Prompt::new(registry.names(), config.history_path.clone());

    loop {
        let statement =
            match prompt_until_full_statement(&mut prompt, &endpoint, registry, config).await {
                Ok(statement) => statement,
                Err(ConsoleError::ClosedDuringPrompt {
                    transient: true,
                    prefix_printed,
                }) => {
                    if prefix_printed {
                        println!();
                    }
                    debug!("lost peer during prompt; rebuilding line editor");
                    prompt.reset_editor();
                    // pace the retry so a peerless endpoint doesn't spin
                    time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                Err(err) => {
                    if let ConsoleError::ClosedDuringPrompt { prefix_printed, .. } = &err {
                        if *prefix_printed {
                            println!();
                        }
                    }
                    return Err(err);
                }
            };

        match statement {
            Statement::Interrupted => {
                debug!("console was aborted");
                return Ok(());
            }
            Statement::Eof => {
                debug!("console hit EOF");
                // a server abandons its active peer; everything else is done
                if let Err(err) = endpoint.close_active().await {
                    eprintln!("{err}");
                }
                if endpoint.is_closed() {
                    return Ok(());
                }
                prompt.reset_editor();
                continue;
            }
            Statement::Line { cmd, hist } => {
                if cmd.trim().is_empty() {
                    trace!("ignoring empty input");
                    continue;
                }
                prompt.add_history(&hist);

                match execute_line(&endpoint, registry, state, &cmd).await {
                    Ok((ExecOutcome::Exit, output)) => {
                        print_output(output);
                        return Ok(());
                    }
                    Ok((ExecOutcome::ClearHistory, _)) => {
                        prompt.clear_history();
                        println!("Command history has been cleared");
                    }
                    Ok((ExecOutcome::Continue, output)) => print_output(output),
                    Err(err) => eprintln!("{err}"),
                }
            }
        }
    }
}

/// Read a full logical statement, spanning lines when multi-line mode needs
/// more input. History never sees the partial fragments; the caller gets the
/// statement with embedded newlines plus a single-line form for history.
async fn prompt_until_full_statement(
    prompt: &mut Prompt,
    endpoint: &Arc<dyn Endpoint>,
    registry: &CommandRegistry,
    config: &SessionConfig,
) -> Result<Statement, ConsoleError> {
    let mut cmd = String::new();
    let mut hist = String::new();
    let mut on_first_line = true;
    let mut prefix = FIRST_LEVEL_PREFIX;

    loop {
        match prompt.read_line(prefix, endpoint).await? {
            PromptOutcome::Eof => return Ok(Statement::Eof),
            PromptOutcome::Interrupted => {
                if on_first_line {
                    return Ok(Statement::Interrupted);
                }
                // abort the multi-line statement, but not the session
                cmd.clear();
                hist.clear();
                on_first_line = true;
                prefix = FIRST_LEVEL_PREFIX;
            }
            PromptOutcome::Line(partial) => {
                let (normal, _) = normalize_line(&partial);
                if normal.is_empty() {
                    continue;
                }
                cmd.push_str(&normal);
                hist.push_str(&normal);

                let more_input_required =
                    config.multiline && !is_complete_line(registry, &cmd);
                if !more_input_required {
                    return Ok(Statement::Line { cmd, hist });
                }
                cmd.push('\n');
                hist.push(' ');
                if on_first_line {
                    prefix = CONTINUATION_PREFIX;
                }
                on_first_line = false;
            }
        }
    }
}

fn is_complete_line(registry: &CommandRegistry, line: &str) -> bool {
    let (normal, skip_command_matching) = normalize_line(line);
    if !skip_command_matching && registry.parse_command(&normal).is_some() {
        return true;
    }
    normal.ends_with(';')
}

/// Execute one logical statement: a built-in command if the first word
/// matches one (and the `:>` prefix doesn't forbid it), otherwise a send.
async fn execute_line(
    endpoint: &Arc<dyn Endpoint>,
    registry: &CommandRegistry,
    state: &mut SessionState,
    line: &str,
) -> Result<(ExecOutcome, Option<String>), ConsoleError> {
    let (normal, skip_command_matching) = normalize_line(line);
    if normal.is_empty() {
        trace!("not sending empty escaped input");
        return Ok((ExecOutcome::Continue, None));
    }

    if !skip_command_matching {
        if let Some((canonical, argv)) = registry.parse_command(&normal) {
            let action = registry.execute(state, &canonical, &argv, &normal)?;
            return match action {
                CommandAction::Output(out) => {
                    let out = (!out.is_empty()).then_some(out);
                    Ok((ExecOutcome::Continue, out))
                }
                CommandAction::Send(data) => {
                    endpoint.send(&data).await?;
                    Ok((ExecOutcome::Continue, None))
                }
                CommandAction::ClearHistory => Ok((ExecOutcome::ClearHistory, None)),
                CommandAction::Exit => Ok((ExecOutcome::Exit, None)),
            };
        }
    }

    let expanded = state.macros.apply(&normal)?;
    let data = parse_line_to_bytes(&expanded)?;
    endpoint.send(&data).await?;
    Ok((ExecOutcome::Continue, None))
}

/// Execute script input from a reader: comments are ignored, and in
/// multi-line mode a semicolon ends each statement. Returns the number of
/// lines processed successfully; the first failing statement aborts.
pub async fn execute_script<R: BufRead>(
    input: R,
    endpoint: &Arc<dyn Endpoint>,
    registry: &CommandRegistry,
    state: &mut SessionState,
    config: &SessionConfig,
) -> Result<usize, ConsoleError> {
    let mut cmd = String::new();
    let mut line_num = 0usize;
    let mut lines_run = 0usize;

    for line in input.lines() {
        line_num += 1;
        let line = line?;
        let (normal, _) = normalize_line(&line);
        if normal.is_empty() {
            continue;
        }
        cmd.push_str(&normal);
        if config.multiline && !is_complete_line(registry, &cmd) {
            cmd.push('\n');
            continue;
        }
        let (_, output) = execute_line(endpoint, registry, state, &cmd).await?;
        if let Some(out) = output {
            println!("{out}");
        }
        lines_run = line_num;
        cmd.clear();
    }

    // run the final statement in case it did not end with a semicolon
    if !cmd.is_empty() {
        let (_, output) = execute_line(endpoint, registry, state, &cmd).await?;
        if let Some(out) = output {
            println!("{out}");
        }
        lines_run = line_num;
    }

    Ok(lines_run)
}

fn print_output(output: Option<String>) {
    if let Some(out) = output {
        if !out.is_empty() {
            println!("{out}");
        }
    }
}

fn splash_text_art() -> [&'static str; 4] {
    [
        "   _______________________   ",
        "  /                       \\  ",
        " |    NETKARKAT, HUMAN!   | ",
        "  \\_______________________/  ",
    ]
}

fn print_splash(x_coord: usize) {
    let tab = " ".repeat(x_coord);
    println!();
    for line in splash_text_art() {
        println!("{tab}{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Endpoint stub that records sends.
    struct RecordingEndpoint {
        sends: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
        ready: AtomicBool,
    }

    impl RecordingEndpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                ready: AtomicBool::new(true),
            })
        }

        fn sends(&self) -> Vec<Vec<u8>> {
            self.sends.lock().expect("sends lock").clone()
        }
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        async fn send(&self, data: &[u8]) -> Result<(), DriverError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(DriverError::Closed);
            }
            self.sends.lock().expect("sends lock").push(data.to_vec());
            Ok(())
        }

        async fn close(&self) -> Result<(), DriverError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close_active(&self) -> Result<(), DriverError> {
            self.close().await
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn timed_out(&self) -> bool {
            false
        }

        fn remote_name(&self) -> String {
            "stub".into()
        }

        fn local_name(&self) -> String {
            "stub".into()
        }
    }

    fn config(multiline: bool) -> SessionConfig {
        SessionConfig {
            version: "test".into(),
            multiline,
            banner: false,
            history_path: None,
        }
    }

    #[tokio::test]
    async fn bare_lines_are_sent_as_bytes() {
        let endpoint = RecordingEndpoint::new();
        let as_endpoint: Arc<dyn Endpoint> = endpoint.clone();
        let registry = CommandRegistry::new();
        let mut state = SessionState::new(false);

        let script = std::io::Cursor::new("\\x48\\x49\n");
        let lines = execute_script(script, &as_endpoint, &registry, &mut state, &config(false))
            .await
            .expect("script");
        assert_eq!(1, lines);
        assert_eq!(vec![vec![0x48, 0x49]], endpoint.sends());
    }

    #[tokio::test]
    async fn multiline_script_assembles_until_semicolon() {
        let endpoint = RecordingEndpoint::new();
        let as_endpoint: Arc<dyn Endpoint> = endpoint.clone();
        let registry = CommandRegistry::new();
        let mut state = SessionState::new(false);

        let script = std::io::Cursor::new("AB\nCD;\n");
        execute_script(script, &as_endpoint, &registry, &mut state, &config(true))
            .await
            .expect("script");
        // one send, with the statement terminator included in the payload
        assert_eq!(vec![b"ABCD;".to_vec()], endpoint.sends());
    }

    #[tokio::test]
    async fn script_defines_and_uses_macros() {
        let endpoint = RecordingEndpoint::new();
        let as_endpoint: Arc<dyn Endpoint> = endpoint.clone();
        let registry = CommandRegistry::new();
        let mut state = SessionState::new(false);

        let script = std::io::Cursor::new("DEFINE GREET \\x68\\x69\nGREET\n");
        execute_script(script, &as_endpoint, &registry, &mut state, &config(false))
            .await
            .expect("script");
        assert_eq!(vec![vec![0x68, 0x69]], endpoint.sends());
    }

    #[tokio::test]
    async fn script_continues_past_undefine_of_unknown_macro() {
        let endpoint = RecordingEndpoint::new();
        let as_endpoint: Arc<dyn Endpoint> = endpoint.clone();
        let registry = CommandRegistry::new();
        let mut state = SessionState::new(false);

        let script = std::io::Cursor::new("UNDEFINE NOSUCHMACRO\n\\x48\n");
        let lines = execute_script(script, &as_endpoint, &registry, &mut state, &config(false))
            .await
            .expect("unknown macro must not abort the script");
        assert_eq!(2, lines);
        assert_eq!(vec![vec![0x48]], endpoint.sends());
    }

    #[tokio::test]
    async fn literal_send_prefix_skips_command_matching() {
        let endpoint = RecordingEndpoint::new();
        let as_endpoint: Arc<dyn Endpoint> = endpoint.clone();
        let registry = CommandRegistry::new();
        let mut state = SessionState::new(false);

        let script = std::io::Cursor::new(":>LIST\n");
        execute_script(script, &as_endpoint, &registry, &mut state, &config(false))
            .await
            .expect("script");
        assert_eq!(vec![b"LIST".to_vec()], endpoint.sends());
    }

    #[tokio::test]
    async fn script_aborts_on_first_failure() {
        let endpoint = RecordingEndpoint::new();
        let as_endpoint: Arc<dyn Endpoint> = endpoint.clone();
        let registry = CommandRegistry::new();
        let mut state = SessionState::new(false);

        let script = std::io::Cursor::new("\\x48\n\\xzz\n\\x49\n");
        let err = execute_script(script, &as_endpoint, &registry, &mut state, &config(false))
            .await
            .expect_err("bad escape must fail");
        assert!(matches!(err, ConsoleError::Parse(_)));
        assert_eq!(vec![vec![0x48]], endpoint.sends());
    }

    #[tokio::test]
    async fn wait_until_ready_fails_once_closed() {
        let endpoint = RecordingEndpoint::new();
        endpoint.ready.store(false, Ordering::SeqCst);
        endpoint.closed.store(true, Ordering::SeqCst);
        let as_endpoint: Arc<dyn Endpoint> = endpoint;
        let err = wait_until_ready(&as_endpoint).await.expect_err("closed");
        assert!(matches!(err, ConsoleError::ClosedBeforeReady));
    }

    #[test]
    fn statement_completion_respects_commands_and_semicolons() {
        let registry = CommandRegistry::new();
        let cfg = config(true);
        assert!(is_complete_line(&registry, "EXIT"));
        assert!(is_complete_line(&registry, "abc;"));
        assert!(!is_complete_line(&registry, "abc"));
        // the prefix forces the command name to be treated as payload
        assert!(!is_complete_line(&registry, ":>EXIT"));
    }
}
