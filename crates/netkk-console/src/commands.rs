//! Built-in console commands.
//!
//! The registry is an explicit value constructed at process start and
//! threaded into the session; command execution itself never touches the
//! endpoint. Instead each command resolves to a [`CommandAction`] that the
//! session applies, which keeps this module free of async plumbing.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;

use crate::parse::{parse_line_to_bytes, split_words};
use crate::{ConsoleError, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Help,
    Exit,
    ClearHist,
    Send,
    Define,
    Undefine,
    List,
    Show,
    Macroset,
    ListSets,
    Export,
    Import,
}

struct Command {
    kind: CommandKind,
    interactive_only: bool,
    help_invoke: &'static str,
    help_desc: &'static str,
    alias_for: Option<&'static str>,
}

/// What the session should do after a command executes.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandAction {
    /// Print this (possibly empty) output and keep going.
    Output(String),
    /// Send these bytes to the peer.
    Send(Vec<u8>),
    /// Wipe the line editor's history.
    ClearHistory,
    /// End the session.
    Exit,
}

pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Command>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut commands = BTreeMap::new();
        let mut add = |name: &'static str, cmd: Command| {
            commands.insert(name, cmd);
        };

        add(
            "HELP",
            Command {
                kind: CommandKind::Help,
                interactive_only: true,
                help_invoke: "",
                help_desc: "Show this help.",
                alias_for: None,
            },
        );
        add(
            "EXIT",
            Command {
                kind: CommandKind::Exit,
                interactive_only: true,
                help_invoke: "",
                help_desc: "Exit the interactive session.",
                alias_for: None,
            },
        );
        add(
            "QUIT",
            Command {
                kind: CommandKind::Exit,
                interactive_only: true,
                help_invoke: "",
                help_desc: "",
                alias_for: Some("EXIT"),
            },
        );
        add(
            "BYE",
            Command {
                kind: CommandKind::Exit,
                interactive_only: true,
                help_invoke: "",
                help_desc: "",
                alias_for: Some("EXIT"),
            },
        );
        add(
            "CLEARHIST",
            Command {
                kind: CommandKind::ClearHist,
                interactive_only: true,
                help_invoke: "",
                help_desc: "Clear the command history.",
                alias_for: None,
            },
        );
        add(
            "SEND",
            Command {
                kind: CommandKind::Send,
                interactive_only: false,
                help_invoke: "bytes...",
                help_desc: "Sends bytes. This command is assumed when no other command is \
                            given. It can be used to send literal bytes that would otherwise be \
                            interpreted as a command, such as `SEND LIST`, or to explicitly send \
                            0 bytes on the connection.",
                alias_for: None,
            },
        );
        add(
            "DEFINE",
            Command {
                kind: CommandKind::Define,
                interactive_only: false,
                help_invoke: "macro bytes...",
                help_desc: "Create a macro that can be typed instead of a sequence of bytes. \
                            Macros can be used inside other macro definitions. Macro names are \
                            case-insensitive.",
                alias_for: None,
            },
        );
        add(
            "UNDEFINE",
            Command {
                kind: CommandKind::Undefine,
                interactive_only: false,
                help_invoke: "[-r] macro",
                help_desc: "Remove an existing macro. Other macros that used it keep its name \
                            as literal bytes; give -r to instead splice in its previous contents.",
                alias_for: None,
            },
        );
        add(
            "LIST",
            Command {
                kind: CommandKind::List,
                interactive_only: false,
                help_invoke: "[-a] [-s macroset]",
                help_desc: "List the macros in the current macroset. -s names another macroset \
                            to show; -a includes all macrosets.",
                alias_for: None,
            },
        );
        add(
            "SHOW",
            Command {
                kind: CommandKind::Show,
                interactive_only: false,
                help_invoke: "macro",
                help_desc: "Show the contents of a macro in the current macroset.",
                alias_for: None,
            },
        );
        add(
            "MACROSET",
            Command {
                kind: CommandKind::Macroset,
                interactive_only: false,
                help_invoke: "[-d] [name]",
                help_desc: "Without arguments, give the name of the current macroset. With a \
                            name, switch to that macroset, creating it if needed. -d switches \
                            back to the default macroset.",
                alias_for: None,
            },
        );
        add(
            "LISTSETS",
            Command {
                kind: CommandKind::ListSets,
                interactive_only: false,
                help_invoke: "",
                help_desc: "List all macrosets that currently contain definitions.",
                alias_for: None,
            },
        );
        add(
            "EXPORT",
            Command {
                kind: CommandKind::Export,
                interactive_only: false,
                help_invoke: "[-c] [-s macroset] file",
                help_desc: "Export macro definitions to a file loadable with IMPORT or \
                            --macrofile. By default every macroset is included; -c selects the \
                            current macroset, -s a named one.",
                alias_for: None,
            },
        );
        add(
            "IMPORT",
            Command {
                kind: CommandKind::Import,
                interactive_only: false,
                help_invoke: "[-r] file",
                help_desc: "Import macro definitions from a file. By default they extend the \
                            ones already defined; with -r all macrosets are cleared first.",
                alias_for: None,
            },
        );

        Self { commands }
    }

    /// Command names, for autocompletion.
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().map(|k| k.to_string()).collect()
    }

    /// Try to read the first word of `line` as a command. Returns the
    /// canonical (alias-resolved) name and the split argument vector.
    pub fn parse_command(&self, line: &str) -> Option<(String, Vec<String>)> {
        let mut words = split_words(line).ok()?;
        let first = words.first()?.to_uppercase();
        let cmd = self.commands.get(first.as_str())?;
        let canonical = cmd.alias_for.unwrap_or_else(|| {
            self.commands
                .get_key_value(first.as_str())
                .map(|(k, _)| *k)
                .expect("just looked up")
        });
        words[0] = first;
        Some((canonical.to_string(), words))
    }

    fn aliases_of(&self, canonical: &str) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .commands
            .iter()
            .filter(|(_, c)| c.alias_for == Some(canonical))
            .map(|(name, _)| *name)
            .collect();
        names.sort_unstable();
        names
    }

    /// Execute a previously parsed command against the session state.
    pub fn execute(
        &self,
        state: &mut SessionState,
        canonical: &str,
        argv: &[String],
        line: &str,
    ) -> Result<CommandAction, ConsoleError> {
        let cmd = self
            .commands
            .get(canonical)
            .expect("canonical name comes from parse_command");

        if cmd.interactive_only && !state.interactive {
            let mut all = vec![canonical.to_string()];
            all.extend(self.aliases_of(canonical).iter().map(|s| s.to_string()));
            return Err(ConsoleError::InteractiveOnly(all.join("/")));
        }

        match cmd.kind {
            CommandKind::Help => Ok(CommandAction::Output(self.render_help())),
            CommandKind::Exit => Ok(CommandAction::Exit),
            CommandKind::ClearHist => Ok(CommandAction::ClearHistory),
            CommandKind::Send => execute_send(state, argv, line),
            CommandKind::Define => execute_define(state, argv, line),
            CommandKind::Undefine => execute_undefine(state, argv),
            CommandKind::List => execute_list(state, argv),
            CommandKind::Show => execute_show(state, argv),
            CommandKind::Macroset => execute_macroset(state, argv),
            CommandKind::ListSets => execute_listsets(state),
            CommandKind::Export => execute_export(state, argv),
            CommandKind::Import => execute_import(state, argv),
        }
    }

    fn render_help(&self) -> String {
        let mut out = String::from("Commands:\n");
        let mut ordered: Vec<&'static str> = self
            .commands
            .iter()
            .filter(|(_, c)| c.alias_for.is_none())
            .map(|(name, _)| *name)
            .collect();
        // HELP and EXIT read better at the end
        ordered.retain(|n| *n != "HELP" && *n != "EXIT");
        ordered.push("HELP");
        ordered.push("EXIT");

        for name in ordered {
            let cmd = &self.commands[name];
            let mut shown = vec![name.to_string()];
            shown.extend(self.aliases_of(name).iter().map(|s| s.to_string()));
            let mut heading = shown.join("/");
            if !cmd.help_invoke.is_empty() {
                heading.push(' ');
                heading.push_str(cmd.help_invoke);
            }
            out.push_str(&format!("  {heading}\n      {}\n", cmd.help_desc));
        }

        out.push_str(
            "\nAny input that does not match one of the built-in commands is sent to the\n\
             remote host and the results are displayed.\n\n\
             If \":>\" is put at the beginning of input, everything after it is sent to the\n\
             remote host regardless of whether it matches a built-in command. To send a\n\
             literal \":>\" at the start of input, double it, as in \":>:>input\".\n",
        );
        out
    }
}

fn execute_send(
    state: &mut SessionState,
    _argv: &[String],
    line: &str,
) -> Result<CommandAction, ConsoleError> {
    let rest = match line.find(char::is_whitespace) {
        Some(idx) => line[idx..].trim(),
        None => {
            tracing::trace!("being told to send empty string; skipping line parse");
            return Ok(CommandAction::Send(Vec::new()));
        }
    };
    let expanded = state.macros.apply(rest)?;
    let data = parse_line_to_bytes(&expanded)?;
    Ok(CommandAction::Send(data))
}

fn execute_define(
    state: &mut SessionState,
    _argv: &[String],
    line: &str,
) -> Result<CommandAction, ConsoleError> {
    let mut parts = line.split_whitespace();
    let _cmd = parts.next();
    let name = parts
        .next()
        .ok_or_else(|| ConsoleError::Usage("need to give name of macro to define".into()))?;
    let contents = parts.collect::<Vec<_>>().join(" ");
    if contents.is_empty() {
        return Err(ConsoleError::Usage(
            "empty macros are not allowed; give contents of macro after name".into(),
        ));
    }

    let already_exists = state.macros.is_defined(name);
    state.macros.define(name, &contents)?;
    let msg = if already_exists {
        format!("Updated {name:?} to new contents")
    } else {
        format!("Defined new macro {name:?}")
    };
    Ok(CommandAction::Output(msg))
}

fn execute_undefine(
    state: &mut SessionState,
    argv: &[String],
) -> Result<CommandAction, ConsoleError> {
    let (flags, args) = split_flags(&argv[1..]);
    let replace = flags.iter().any(|f| *f == "-r");
    let name = args
        .first()
        .ok_or_else(|| ConsoleError::Usage("need to give name of macro to undefine".into()))?;
    if !state.macros.undefine(name, replace) {
        // nothing to remove is not a failure; scripts keep going
        return Ok(CommandAction::Output(format!(
            "{name:?} is not currently a defined macro, so not doing anything"
        )));
    }
    Ok(CommandAction::Output(format!("Removed macro {name:?}")))
}

fn execute_list(state: &mut SessionState, argv: &[String]) -> Result<CommandAction, ConsoleError> {
    let mut sets: Vec<String> = Vec::new();
    let mut all = false;
    let mut iter = argv[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-a" => all = true,
            "-s" => {
                let name = iter
                    .next()
                    .ok_or_else(|| ConsoleError::Usage("-s requires a macroset name".into()))?;
                sets.push(name.to_uppercase());
            }
            other => {
                return Err(ConsoleError::Usage(format!("unknown argument {other:?}")));
            }
        }
    }
    if all {
        sets = state.macros.nonempty_set_names();
    } else if sets.is_empty() {
        sets.push(state.macros.current_set_name().to_string());
    }

    let mut out = String::new();
    for set_name in sets {
        let set = state
            .macros
            .set(&set_name)
            .ok_or_else(|| ConsoleError::Usage(format!("no macroset named {set_name:?}")))?;
        out.push_str(&format!("[{set_name}]\n"));
        if set.is_empty() {
            out.push_str("  (no macros defined)\n");
        }
        for name in set.names() {
            out.push_str(&format!("  {name}\n"));
        }
    }
    Ok(CommandAction::Output(out.trim_end().to_string()))
}

fn execute_show(state: &mut SessionState, argv: &[String]) -> Result<CommandAction, ConsoleError> {
    let name = argv
        .get(1)
        .ok_or_else(|| ConsoleError::Usage("need to give name of macro to show".into()))?;
    match state.macros.current_set().get(name) {
        Some(contents) => Ok(CommandAction::Output(format!("{name} = {contents}"))),
        None => Err(ConsoleError::Usage(format!(
            "no macro named {name:?} is defined"
        ))),
    }
}

fn execute_macroset(
    state: &mut SessionState,
    argv: &[String],
) -> Result<CommandAction, ConsoleError> {
    match argv.get(1).map(|s| s.as_str()) {
        None => Ok(CommandAction::Output(format!(
            "current macroset is {}",
            state.macros.current_set_name()
        ))),
        Some("-d") => {
            state.macros.switch_to_default_set();
            Ok(CommandAction::Output(
                "switched to the default macroset".into(),
            ))
        }
        Some(name) => {
            state.macros.switch_set(name)?;
            Ok(CommandAction::Output(format!(
                "current macroset is now {}",
                state.macros.current_set_name()
            )))
        }
    }
}

fn execute_listsets(state: &mut SessionState) -> Result<CommandAction, ConsoleError> {
    let names = state.macros.nonempty_set_names();
    if names.is_empty() {
        return Ok(CommandAction::Output("(no macros defined)".into()));
    }
    Ok(CommandAction::Output(names.join("\n")))
}

fn execute_export(state: &mut SessionState, argv: &[String]) -> Result<CommandAction, ConsoleError> {
    let mut sets: Vec<String> = Vec::new();
    let mut file: Option<&String> = None;
    let mut iter = argv[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" => sets.push(state.macros.current_set_name().to_string()),
            "-s" => {
                let name = iter
                    .next()
                    .ok_or_else(|| ConsoleError::Usage("-s requires a macroset name".into()))?;
                sets.push(name.to_uppercase());
            }
            _ => file = Some(arg),
        }
    }
    let file = file.ok_or_else(|| ConsoleError::Usage("need a file to export to".into()))?;

    let out = File::create(file)?;
    state.macros.export(out, &sets)?;
    Ok(CommandAction::Output(format!(
        "Exported macro definitions to {file:?}"
    )))
}

fn execute_import(state: &mut SessionState, argv: &[String]) -> Result<CommandAction, ConsoleError> {
    let (flags, args) = split_flags(&argv[1..]);
    let replace = flags.iter().any(|f| *f == "-r");
    let file = args
        .first()
        .ok_or_else(|| ConsoleError::Usage("need a file to import from".into()))?;

    let input = BufReader::new(File::open(file.as_str())?);
    let defined = state.macros.import(input, replace)?;
    Ok(CommandAction::Output(format!(
        "Imported {defined} macro definition(s) from {file:?}"
    )))
}

fn split_flags(args: &[String]) -> (Vec<&String>, Vec<&String>) {
    args.iter().partition(|a| a.starts_with('-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionState;

    fn state() -> SessionState {
        SessionState::new(true)
    }

    #[test]
    fn parses_commands_case_insensitively() {
        let registry = CommandRegistry::new();
        let (name, argv) = registry.parse_command("define GREET hi").expect("command");
        assert_eq!("DEFINE", name);
        assert_eq!("DEFINE", argv[0]);
    }

    #[test]
    fn resolves_aliases_to_canonical_name() {
        let registry = CommandRegistry::new();
        let (name, _) = registry.parse_command("quit").expect("command");
        assert_eq!("EXIT", name);
        let (name, _) = registry.parse_command("BYE").expect("command");
        assert_eq!("EXIT", name);
    }

    #[test]
    fn unknown_first_word_is_not_a_command() {
        let registry = CommandRegistry::new();
        assert!(registry.parse_command("hello world").is_none());
        assert!(registry.parse_command("").is_none());
    }

    #[test]
    fn define_show_undefine_round_trip() {
        let registry = CommandRegistry::new();
        let mut st = state();

        let action = registry
            .execute(&mut st, "DEFINE", &[], "DEFINE GREET \\x68\\x69")
            .expect("define");
        assert_eq!(
            CommandAction::Output("Defined new macro \"GREET\"".into()),
            action
        );

        let argv = vec!["SHOW".to_string(), "GREET".to_string()];
        let action = registry
            .execute(&mut st, "SHOW", &argv, "SHOW GREET")
            .expect("show");
        assert_eq!(
            CommandAction::Output("GREET = \\x68\\x69".into()),
            action
        );

        let argv = vec!["UNDEFINE".to_string(), "GREET".to_string()];
        registry
            .execute(&mut st, "UNDEFINE", &argv, "UNDEFINE GREET")
            .expect("undefine");
        assert!(!st.macros.is_defined("GREET"));
    }

    #[test]
    fn undefine_of_unknown_macro_reports_without_failing() {
        let registry = CommandRegistry::new();
        let mut st = state();
        let argv = vec!["UNDEFINE".to_string(), "NOSUCH".to_string()];
        let action = registry
            .execute(&mut st, "UNDEFINE", &argv, "UNDEFINE NOSUCH")
            .expect("must not be an error");
        assert_eq!(
            CommandAction::Output(
                "\"NOSUCH\" is not currently a defined macro, so not doing anything".into()
            ),
            action
        );
    }

    #[test]
    fn send_expands_macros_before_parsing() {
        let registry = CommandRegistry::new();
        let mut st = state();
        st.macros.define("GREET", "\\x68\\x69").expect("define");

        let action = registry
            .execute(&mut st, "SEND", &[], "SEND GREET")
            .expect("send");
        assert_eq!(CommandAction::Send(vec![0x68, 0x69]), action);
    }

    #[test]
    fn bare_send_sends_zero_bytes() {
        let registry = CommandRegistry::new();
        let mut st = state();
        let action = registry.execute(&mut st, "SEND", &[], "SEND").expect("send");
        assert_eq!(CommandAction::Send(Vec::new()), action);
    }

    #[test]
    fn interactive_only_commands_fail_in_scripts() {
        let registry = CommandRegistry::new();
        let mut st = SessionState::new(false);
        let err = registry
            .execute(&mut st, "EXIT", &[], "EXIT")
            .expect_err("must fail");
        assert!(matches!(err, ConsoleError::InteractiveOnly(_)));
    }
}
