//! Input normalization and the byte-escape lexer.
//!
//! Typed lines pass through three stages: comment and whitespace stripping
//! (with the `:>` prefix forcing literal-send), optional macro expansion, and
//! finally the escape lexer that turns the text into wire bytes.

use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    UnterminatedBackslash(usize),
    UnterminatedByteSequence(usize),
    MalformedByteSequence(usize, String),
    UnknownEscape(char),
    UnbalancedQuotes,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnterminatedBackslash(idx) => {
                write!(f, "unterminated backslash at char index {idx}")
            }
            ParseError::UnterminatedByteSequence(idx) => {
                write!(f, "unterminated byte sequence at char index {idx}")
            }
            ParseError::MalformedByteSequence(idx, detail) => {
                write!(f, "malformed byte sequence at char index {idx}: {detail}")
            }
            ParseError::UnknownEscape(c) => write!(f, "unknown escaped character: {c:?}"),
            ParseError::UnbalancedQuotes => write!(f, "unbalanced quotes in input"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Strip comments and surrounding whitespace, and detect the `:>` prefix
/// that forces the rest of the line to skip command matching.
pub fn normalize_line(line: &str) -> (String, bool) {
    let cmd = line.split('#').next().unwrap_or("");
    let cmd = cmd.split("//").next().unwrap_or("");
    let cmd = cmd.trim();

    if let Some(rest) = cmd.strip_prefix(":>") {
        (rest.trim().to_string(), true)
    } else {
        (cmd.to_string(), false)
    }
}

/// Turn escaped text into the bytes it denotes. Whitespace separates byte
/// groups and is never itself sent.
pub fn parse_line_to_bytes(line: &str) -> Result<Vec<u8>, ParseError> {
    let chars: Vec<char> = line.chars().collect();
    let mut data = Vec::new();
    let mut utf8 = [0u8; 4];

    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        if ch != '\\' {
            data.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            None => return Err(ParseError::UnterminatedBackslash(i)),
            Some('\\') => {
                data.push(b'\\');
                i += 2;
            }
            Some('x') => {
                if i + 3 >= chars.len() {
                    return Err(ParseError::UnterminatedByteSequence(i));
                }
                let hex: String = chars[i + 2..i + 4].iter().collect();
                let byte = u8::from_str_radix(&hex, 16)
                    .map_err(|err| ParseError::MalformedByteSequence(i, err.to_string()))?;
                data.push(byte);
                i += 4;
            }
            Some(other) => return Err(ParseError::UnknownEscape(*other)),
        }
    }

    Ok(data)
}

/// Split a command line into words, honoring single and double quotes.
/// Returns an error when a quote is left open.
pub fn split_words(line: &str) -> Result<Vec<String>, ParseError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(ParseError::UnbalancedQuotes);
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_to_bytes_vectors() {
        let cases: &[(&str, &[u8])] = &[
            ("", &[]),
            ("hello", &[0x68, 0x65, 0x6c, 0x6c, 0x6f]),
            ("\\x4f", &[0x4f]),
            ("\\x4f\\x2E", &[0x4f, 0x2e]),
            ("\\\\", &[0x5c]),
            ("he llo", &[0x68, 0x65, 0x6c, 0x6c, 0x6f]),
            ("\\x48 \\x49", &[0x48, 0x49]),
        ];
        for (input, expected) in cases {
            let actual = parse_line_to_bytes(input).expect("parse");
            assert_eq!(*expected, actual.as_slice(), "input {input:?}");
        }
    }

    #[test]
    fn parse_line_to_bytes_errors() {
        assert_eq!(
            parse_line_to_bytes("\\x4"),
            Err(ParseError::UnterminatedByteSequence(0))
        );
        assert_eq!(
            parse_line_to_bytes("\\x"),
            Err(ParseError::UnterminatedByteSequence(0))
        );
        assert_eq!(
            parse_line_to_bytes("\\"),
            Err(ParseError::UnterminatedBackslash(0))
        );
        assert_eq!(parse_line_to_bytes("\\a"), Err(ParseError::UnknownEscape('a')));
        assert!(matches!(
            parse_line_to_bytes("\\xzz"),
            Err(ParseError::MalformedByteSequence(0, _))
        ));
    }

    #[test]
    fn parse_line_to_bytes_encodes_multibyte_chars() {
        assert_eq!(
            "é".as_bytes().to_vec(),
            parse_line_to_bytes("é").expect("parse")
        );
    }

    #[test]
    fn normalize_strips_comments() {
        assert_eq!(("abc".to_string(), false), normalize_line("abc # comment"));
        assert_eq!(("abc".to_string(), false), normalize_line("abc // comment"));
        assert_eq!((String::new(), false), normalize_line("   "));
        assert_eq!((String::new(), false), normalize_line("# only comment"));
    }

    #[test]
    fn normalize_detects_literal_send_prefix() {
        assert_eq!(("LIST".to_string(), true), normalize_line(":>LIST"));
        assert_eq!((":>input".to_string(), true), normalize_line(":>:>input"));
        assert_eq!(("LIST".to_string(), false), normalize_line("LIST"));
    }

    #[test]
    fn split_words_honors_quotes() {
        assert_eq!(
            vec!["EXPORT", "my file.txt"],
            split_words("EXPORT \"my file.txt\"").expect("split")
        );
        assert_eq!(
            vec!["a", "b", "c"],
            split_words("  a  b\tc ").expect("split")
        );
        assert!(split_words("\"open").is_err());
    }
}
