//! Line input that stays aware of connection health.
//!
//! A terminal line editor cannot be interrupted cleanly, so the blocking read
//! runs on its own task while the session polls the endpoint. If the
//! connection closes or loses its peer mid-prompt, the read is abandoned and
//! the caller decides whether to rebuild the editor and keep going. An
//! abandoned read still owns the editor (and the terminal's raw mode) until
//! it returns, so no new editor is constructed while one is outstanding.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustyline::completion::Completer;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Config, Context, Editor, Helper};
use tokio::task::JoinHandle;
use tokio::time;

use netkk_driver::Endpoint;

use crate::ConsoleError;

/// How often connection health is checked while a prompt is blocked.
const HEALTH_POLL: Duration = Duration::from_millis(10);

pub(crate) enum PromptOutcome {
    Line(String),
    Eof,
    Interrupted,
}

type ReadResult = (LineEditor, rustyline::Result<String>);

pub(crate) struct Prompt {
    editor: Option<LineEditor>,
    /// A blocking read that lost the health race. It keeps the previous
    /// editor (and the terminal) until it returns, so it must be drained
    /// before another editor may exist.
    abandoned: Option<JoinHandle<ReadResult>>,
    command_names: Vec<String>,
    history_path: Option<PathBuf>,
}

type LineEditor = Editor<PromptHelper, DefaultHistory>;

impl Prompt {
    pub(crate) fn new(command_names: Vec<String>, history_path: Option<PathBuf>) -> Self {
        Self {
            editor: None,
            abandoned: None,
            command_names,
            history_path,
        }
    }

    /// Throw away the current editor so the next read starts with a fresh
    /// one. Called after a prompt was abandoned mid-read.
    pub(crate) fn reset_editor(&mut self) {
        self.editor = None;
    }

    pub(crate) fn add_history(&mut self, entry: &str) {
        if let Some(editor) = self.editor.as_mut() {
            let _ = editor.add_history_entry(entry);
            if let Some(path) = &self.history_path {
                if let Err(err) = editor.save_history(path) {
                    tracing::warn!(error = %err, "couldn't write history file");
                }
            }
        }
    }

    pub(crate) fn clear_history(&mut self) {
        if let Some(editor) = self.editor.as_mut() {
            let _ = editor.clear_history();
            if let Some(path) = &self.history_path {
                if let Err(err) = editor.save_history(path) {
                    tracing::warn!(error = %err, "couldn't write history file");
                }
            }
        }
    }

    /// Read one line while watching the endpoint. Fails with
    /// [`ConsoleError::ClosedDuringPrompt`] the moment the endpoint closes
    /// (`transient: false`) or stops being ready (`transient: true`); the
    /// carried flag reports whether the prompt prefix had been written yet.
    pub(crate) async fn read_line(
        &mut self,
        prefix: &str,
        endpoint: &Arc<dyn Endpoint>,
    ) -> Result<PromptOutcome, ConsoleError> {
        self.drain_abandoned(endpoint).await?;

        let mut editor = match self.editor.take() {
            Some(editor) => editor,
            None => self.build_editor()?,
        };

        // flipped by the blocking task just before rustyline writes the
        // prefix, so race losses can report whether it ever appeared
        let prefix_printed = Arc::new(AtomicBool::new(false));
        let printed_flag = Arc::clone(&prefix_printed);
        let prefix = prefix.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            printed_flag.store(true, Ordering::SeqCst);
            let result = editor.readline(&prefix);
            (editor, result)
        });

        loop {
            if handle.is_finished() {
                let (editor, result) = handle
                    .await
                    .map_err(|err| ConsoleError::Readline(err.to_string()))?;
                self.editor = Some(editor);
                return match result {
                    Ok(line) => Ok(PromptOutcome::Line(line)),
                    Err(ReadlineError::Eof) => Ok(PromptOutcome::Eof),
                    Err(ReadlineError::Interrupted) => Ok(PromptOutcome::Interrupted),
                    Err(err) => Err(ConsoleError::Readline(err.to_string())),
                };
            }

            if endpoint.is_closed() {
                let printed = prefix_printed.load(Ordering::SeqCst);
                self.abandon(handle);
                return Err(ConsoleError::ClosedDuringPrompt {
                    transient: false,
                    prefix_printed: printed,
                });
            }
            if !endpoint.ready() {
                let printed = prefix_printed.load(Ordering::SeqCst);
                self.abandon(handle);
                return Err(ConsoleError::ClosedDuringPrompt {
                    transient: true,
                    prefix_printed: printed,
                });
            }

            time::sleep(HEALTH_POLL).await;
        }
    }

    /// Give up on an in-flight read. Aborting stops it outright if the
    /// closure never started; otherwise the read runs to completion in the
    /// background and is awaited before the next editor is built.
    fn abandon(&mut self, handle: JoinHandle<ReadResult>) {
        handle.abort();
        self.abandoned = Some(handle);
    }

    /// Wait for a previously abandoned read to give the terminal back. The
    /// endpoint is still watched while waiting; a failure here reports
    /// `prefix_printed: false` because this call's prompt never started.
    async fn drain_abandoned(
        &mut self,
        endpoint: &Arc<dyn Endpoint>,
    ) -> Result<(), ConsoleError> {
        let Some(handle) = self.abandoned.take() else {
            return Ok(());
        };

        while !handle.is_finished() {
            if endpoint.is_closed() {
                self.abandoned = Some(handle);
                return Err(ConsoleError::ClosedDuringPrompt {
                    transient: false,
                    prefix_printed: false,
                });
            }
            if !endpoint.ready() {
                self.abandoned = Some(handle);
                return Err(ConsoleError::ClosedDuringPrompt {
                    transient: true,
                    prefix_printed: false,
                });
            }
            time::sleep(HEALTH_POLL).await;
        }

        // completed or aborted-before-start; dropping the stale editor here
        // restores the terminal before a fresh one is constructed
        let _ = handle.await;
        Ok(())
    }

    fn build_editor(&self) -> Result<LineEditor, ConsoleError> {
        let config = Config::builder().auto_add_history(false).build();
        let mut editor = LineEditor::with_config(config)
            .map_err(|err| ConsoleError::Readline(err.to_string()))?;
        editor.set_helper(Some(PromptHelper {
            command_names: self.command_names.clone(),
        }));
        if let Some(path) = &self.history_path {
            if path.exists() {
                if let Err(err) = editor.load_history(path) {
                    tracing::warn!(error = %err, "couldn't read history file");
                }
            }
        }
        Ok(editor)
    }
}

/// Completes leading input against the command table, offering both the
/// lowercase and uppercase spellings.
struct PromptHelper {
    command_names: Vec<String>,
}

impl Completer for PromptHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let typed = &line[..pos];
        if typed.is_empty() || typed.contains(char::is_whitespace) {
            return Ok((0, Vec::new()));
        }

        let mut candidates = Vec::new();
        for word in &self.command_names {
            if word.to_lowercase().starts_with(typed) {
                candidates.push(word.to_lowercase());
            }
            if word.to_uppercase().starts_with(typed) {
                candidates.push(word.to_uppercase());
            }
        }
        if candidates.is_empty() {
            let upper_typed = typed.to_uppercase();
            for word in &self.command_names {
                if word.to_uppercase().starts_with(&upper_typed) {
                    candidates.push(word.to_uppercase());
                }
            }
        }
        Ok((0, candidates))
    }
}

impl Hinter for PromptHelper {
    type Hint = String;
}

impl Highlighter for PromptHelper {}
impl Validator for PromptHelper {}
impl Helper for PromptHelper {}
