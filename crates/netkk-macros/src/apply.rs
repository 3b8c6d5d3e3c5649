//! Macro expansion over identifier tokens.
//!
//! Replacement is whole-identifier only: `MACRO2` never matches a macro named
//! `MACRO`. Nested macros expand recursively; the expansion stack carries
//! every macro name on the current path so direct and indirect loops are both
//! caught.

use crate::{MacroError, MacroSet};

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '$' || c == '_'
}

enum Token<'a> {
    Identifier(&'a str),
    Other(&'a str),
}

fn tokenize(text: &str) -> impl Iterator<Item = Token<'_>> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let first_is_ident = rest.chars().next().map(is_identifier_char).expect("nonempty");
        let split = rest
            .char_indices()
            .find(|(_, c)| is_identifier_char(*c) != first_is_ident)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(split);
        rest = tail;
        Some(if first_is_ident {
            Token::Identifier(run)
        } else {
            Token::Other(run)
        })
    })
}

pub(crate) fn apply(set: &MacroSet, text: &str) -> Result<String, MacroError> {
    let mut stack = Vec::new();
    expand(set, text, &mut stack)
}

fn expand(set: &MacroSet, text: &str, stack: &mut Vec<String>) -> Result<String, MacroError> {
    let mut out = String::with_capacity(text.len());
    for token in tokenize(text) {
        match token {
            Token::Identifier(word) => {
                let key = word.to_uppercase();
                match set.get(&key) {
                    Some(contents) => {
                        if stack.contains(&key) {
                            return Err(MacroError::Loop(word.to_string()));
                        }
                        stack.push(key);
                        let contents = contents.to_string();
                        let expanded = expand(set, &contents, stack)?;
                        stack.pop();
                        out.push_str(&expanded);
                    }
                    None => out.push_str(word),
                }
            }
            Token::Other(run) => out.push_str(run),
        }
    }
    Ok(out)
}

/// Replace every whole-identifier occurrence of `key` (an uppercased macro
/// name) in `text` with `replacement`, without expanding anything else. Used
/// when a macro is undefined with usage replacement requested.
pub(crate) fn replace_identifier(text: &str, key: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for token in tokenize(text) {
        match token {
            Token::Identifier(word) if word.to_uppercase() == key => out.push_str(replacement),
            Token::Identifier(word) => out.push_str(word),
            Token::Other(run) => out.push_str(run),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_preserves_every_byte() {
        let text = "  MACRO<with super> tail\t";
        let mut rebuilt = String::new();
        for token in tokenize(text) {
            match token {
                Token::Identifier(s) | Token::Other(s) => rebuilt.push_str(s),
            }
        }
        assert_eq!(text, rebuilt);
    }

    #[test]
    fn replace_identifier_is_whole_word() {
        assert_eq!(
            "x MACRO2 y",
            replace_identifier("x MACRO2 y", "MACRO", "nope")
        );
        assert_eq!("x nope y", replace_identifier("x MACRO y", "MACRO", "nope"));
    }
}
