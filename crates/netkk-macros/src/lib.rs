//! Reusable byte-sequence macros for the netkk console.
//!
//! A macro maps an identifier to replacement text. Macros live in named,
//! case-insensitive macrosets; one set is always "current" and receives new
//! definitions. Expansion replaces whole identifiers only, recursively, and
//! aborts when a macro ends up (directly or transitively) inside its own
//! expansion.

mod apply;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{BufRead, Write};
use std::sync::OnceLock;

use regex::Regex;

/// The fewest characters a macro or macroset name may have. Counted in
/// characters, not bytes.
pub const DEFAULT_MIN_LENGTH: usize = 3;

/// Name of the macroset that exists from the start and can always be switched
/// back to with `MACROSET -d`.
pub const DEFAULT_SET: &str = "DEFAULT";

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z$_][A-Za-z$_0-9]*$").expect("identifier regex"))
}

fn section_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[[A-Za-z$_][A-Za-z$_0-9]*\]$").expect("section regex"))
}

#[derive(Debug, thiserror::Error)]
pub enum MacroError {
    #[error("{0:?} is not a valid {1} name")]
    InvalidName(String, &'static str),
    #[error("{0} names must be at least {1} characters")]
    NameTooShort(&'static str, usize),
    #[error("no macroset named {0:?}")]
    UnknownSet(String),
    #[error("empty macros are not allowed")]
    EmptyContents,
    #[error("macro {0:?} recursively includes itself")]
    Loop(String),
    #[error("line {0}: {1}")]
    Import(usize, String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn validate_name(name: &str, object: &'static str, min_len: usize) -> Result<(), MacroError> {
    if !identifier_regex().is_match(name) {
        return Err(MacroError::InvalidName(name.to_string(), object));
    }
    if name.chars().count() < min_len {
        return Err(MacroError::NameTooShort(object, min_len));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Macro {
    /// Name as the user first typed it; lookups use the uppercased key.
    name: String,
    contents: String,
}

/// One named group of macro definitions.
#[derive(Debug, Clone, Default)]
pub struct MacroSet {
    macros: BTreeMap<String, Macro>,
}

impl MacroSet {
    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.macros.contains_key(&name.to_uppercase())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.macros
            .get(&name.to_uppercase())
            .map(|m| m.contents.as_str())
    }

    /// Names in definition order (alphabetical by uppercased key), rendered
    /// as the user originally typed them.
    pub fn names(&self) -> Vec<String> {
        self.macros.values().map(|m| m.name.clone()).collect()
    }

    fn define(&mut self, name: &str, contents: &str, min_len: usize) -> Result<(), MacroError> {
        validate_name(name, "macro", min_len)?;
        if contents.is_empty() {
            return Err(MacroError::EmptyContents);
        }
        self.macros.insert(
            name.to_uppercase(),
            Macro {
                name: name.to_string(),
                contents: contents.to_string(),
            },
        );
        Ok(())
    }

    /// Remove a macro. Returns false when no macro by that name exists,
    /// which is not an error.
    fn undefine(&mut self, name: &str, replace_usages: bool) -> bool {
        let key = name.to_uppercase();
        let Some(removed) = self.macros.remove(&key) else {
            return false;
        };
        if replace_usages {
            let replacement = removed.contents;
            for entry in self.macros.values_mut() {
                entry.contents = apply::replace_identifier(&entry.contents, &key, &replacement);
            }
        }
        true
    }
}

/// All macrosets known to a session, plus the cursor naming the current one.
#[derive(Debug, Clone)]
pub struct MacroCollection {
    sets: BTreeMap<String, MacroSet>,
    current: String,
    min_length: usize,
}

impl Default for MacroCollection {
    fn default() -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(DEFAULT_SET.to_string(), MacroSet::default());
        Self {
            sets,
            current: DEFAULT_SET.to_string(),
            min_length: DEFAULT_MIN_LENGTH,
        }
    }
}

impl MacroCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_set_name(&self) -> &str {
        &self.current
    }

    /// Switch the current macroset, creating it first if needed.
    pub fn switch_set(&mut self, name: &str) -> Result<(), MacroError> {
        let key = name.to_uppercase();
        if key != DEFAULT_SET {
            validate_name(&key, "macroset", self.min_length)?;
        }
        self.sets.entry(key.clone()).or_default();
        self.current = key;
        Ok(())
    }

    pub fn switch_to_default_set(&mut self) {
        self.current = DEFAULT_SET.to_string();
        self.sets.entry(self.current.clone()).or_default();
    }

    pub fn current_set(&self) -> &MacroSet {
        self.sets.get(&self.current).expect("current set exists")
    }

    pub fn set(&self, name: &str) -> Option<&MacroSet> {
        self.sets.get(&name.to_uppercase())
    }

    /// Names of macrosets that currently hold at least one definition.
    pub fn nonempty_set_names(&self) -> Vec<String> {
        self.sets
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.current_set().is_defined(name)
    }

    pub fn define(&mut self, name: &str, contents: &str) -> Result<(), MacroError> {
        let min_len = self.min_length;
        self.sets
            .get_mut(&self.current)
            .expect("current set exists")
            .define(name, contents, min_len)
    }

    /// Remove a macro from the current set. Returns false when no macro by
    /// that name exists.
    pub fn undefine(&mut self, name: &str, replace_usages: bool) -> bool {
        self.sets
            .get_mut(&self.current)
            .expect("current set exists")
            .undefine(name, replace_usages)
    }

    /// Expand every macro of the current set occurring in `text`.
    pub fn apply(&self, text: &str) -> Result<String, MacroError> {
        apply::apply(self.current_set(), text)
    }

    /// Serialize macrosets to the definitions file format. With `sets` empty,
    /// every non-empty macroset is exported.
    pub fn export<W: Write>(&self, mut out: W, sets: &[String]) -> Result<(), MacroError> {
        let selected: Vec<String> = if sets.is_empty() {
            self.nonempty_set_names()
        } else {
            sets.iter().map(|s| s.to_uppercase()).collect()
        };

        let mut body = String::new();
        writeln!(body, "# netkk macro definitions").expect("write to string");
        for set_name in selected {
            let set = self
                .sets
                .get(&set_name)
                .ok_or_else(|| MacroError::UnknownSet(set_name.clone()))?;
            writeln!(body, "\n[{set_name}]").expect("write to string");
            for name in set.names() {
                let contents = set.get(&name).expect("listed macro exists");
                writeln!(body, "{name} = {contents}").expect("write to string");
            }
        }
        out.write_all(body.as_bytes())?;
        Ok(())
    }

    /// Parse a definitions file. Definitions before any `[section]` header go
    /// to the default set. With `replace` set, all existing sets are dropped
    /// first.
    pub fn import<R: BufRead>(&mut self, input: R, replace: bool) -> Result<usize, MacroError> {
        if replace {
            self.sets.clear();
            self.sets.insert(DEFAULT_SET.to_string(), MacroSet::default());
            self.current = DEFAULT_SET.to_string();
        }

        let mut target = DEFAULT_SET.to_string();
        let mut defined = 0usize;
        for (idx, line) in input.lines().enumerate() {
            let line_num = idx + 1;
            let line = line?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if section_regex().is_match(line) {
                target = line[1..line.len() - 1].to_uppercase();
                self.sets.entry(target.clone()).or_default();
                continue;
            }
            let (name, contents) = line
                .split_once('=')
                .ok_or_else(|| MacroError::Import(line_num, "expected NAME = CONTENTS".into()))?;
            let name = name.trim();
            let contents = contents.trim();
            let min_len = self.min_length;
            self.sets
                .get_mut(&target)
                .expect("target set exists")
                .define(name, contents, min_len)
                .map_err(|err| MacroError::Import(line_num, err.to_string()))?;
            defined += 1;
        }
        Ok(defined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection_with(defs: &[(&str, &str)]) -> MacroCollection {
        let mut coll = MacroCollection::new();
        for (name, contents) in defs {
            coll.define(name, contents).expect("pre-test definition");
        }
        coll
    }

    #[test]
    fn apply_replaces_whole_identifiers() {
        let coll = collection_with(&[
            ("MACRO", "<macrofill 1>"),
            ("SUPERMACRO", "MACRO<with super>"),
            ("MACRO2", "2"),
            ("SUPERMACRO_OF_2", "MACRO MACRO2"),
        ]);

        let cases = [
            ("MACRO", "<macrofill 1>"),
            (" MACRO ", " <macrofill 1> "),
            ("  MACRO  ", "  <macrofill 1>  "),
            ("before MACRO", "before <macrofill 1>"),
            ("MACRO after", "<macrofill 1> after"),
            ("MACRO after\t", "<macrofill 1> after\t"),
            ("SUPERMACRO", "<macrofill 1><with super>"),
            ("SUPERMACRO_OF_2", "<macrofill 1> 2"),
            ("MACROX", "MACROX"),
        ];
        for (input, expected) in cases {
            let actual = coll.apply(input).expect("apply");
            assert_eq!(expected, actual, "input {input:?}");
        }
    }

    #[test]
    fn apply_is_case_insensitive() {
        let coll = collection_with(&[("greet", "hello")]);
        assert_eq!("hello there", coll.apply("GREET there").expect("apply"));
        assert_eq!("hello there", coll.apply("Greet there").expect("apply"));
    }

    #[test]
    fn apply_detects_loops() {
        let coll = collection_with(&[("AAA", "BBB"), ("BBB", "AAA")]);
        assert!(matches!(coll.apply("AAA"), Err(MacroError::Loop(_))));
    }

    #[test]
    fn define_rejects_bad_names() {
        let mut coll = MacroCollection::new();
        assert!(matches!(
            coll.define("9lives", "x"),
            Err(MacroError::InvalidName(..))
        ));
        assert!(matches!(
            coll.define("ab", "x"),
            Err(MacroError::NameTooShort(..))
        ));
        assert!(matches!(
            coll.define("okname", ""),
            Err(MacroError::EmptyContents)
        ));
    }

    #[test]
    fn undefine_with_replacement_inlines_contents() {
        let mut coll = collection_with(&[("INNER", "payload"), ("OUTER", "INNER tail")]);
        assert!(coll.undefine("INNER", true));
        assert_eq!("payload tail", coll.apply("OUTER").expect("apply"));
    }

    #[test]
    fn undefine_without_replacement_leaves_name_literal() {
        let mut coll = collection_with(&[("INNER", "payload"), ("OUTER", "INNER tail")]);
        assert!(coll.undefine("INNER", false));
        assert_eq!("INNER tail", coll.apply("OUTER").expect("apply"));
    }

    #[test]
    fn undefine_of_unknown_macro_is_a_no_op() {
        let mut coll = collection_with(&[("INNER", "payload")]);
        assert!(!coll.undefine("NOSUCH", false));
        assert!(!coll.undefine("NOSUCH", true));
        assert!(coll.is_defined("INNER"));
    }

    #[test]
    fn macrosets_are_independent() {
        let mut coll = collection_with(&[("GREET", "hello")]);
        coll.switch_set("alt").expect("switch");
        assert!(!coll.is_defined("GREET"));
        coll.define("GREET", "goodbye").expect("define");
        assert_eq!("goodbye", coll.apply("GREET").expect("apply"));
        coll.switch_to_default_set();
        assert_eq!("hello", coll.apply("GREET").expect("apply"));
    }

    #[test]
    fn export_import_round_trip() {
        let mut coll = collection_with(&[("GREET", "hello"), ("WAVE", "\\x77 \\x61 \\x76")]);
        coll.switch_set("alt").expect("switch");
        coll.define("GREET", "goodbye").expect("define");

        let mut buf = Vec::new();
        coll.export(&mut buf, &[]).expect("export");

        let mut restored = MacroCollection::new();
        let defined = restored
            .import(std::io::Cursor::new(buf), false)
            .expect("import");
        assert_eq!(3, defined);
        assert_eq!("hello", restored.apply("GREET").expect("apply"));
        restored.switch_set("alt").expect("switch");
        assert_eq!("goodbye", restored.apply("GREET").expect("apply"));
    }

    #[test]
    fn import_reports_line_numbers() {
        let mut coll = MacroCollection::new();
        let res = coll.import(std::io::Cursor::new("GOOD = fine\nbroken-line\n"), false);
        match res {
            Err(MacroError::Import(line, _)) => assert_eq!(2, line),
            other => panic!("expected import error, got {other:?}"),
        }
    }
}
