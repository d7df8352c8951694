//! Bulk import/export formats: JSON, dotenv, flat YAML.
//!
//! Exporters produce deterministic text from `(key, value)` pairs. The
//! dotenv and YAML importers are small hand-written scanners, not full
//! grammars: one `key=value` / `key: value` pair per logical line, with
//! quote- and escape-aware value scanning driven by [`ScanState`].
//!
//! ## Quoting rules
//!
//! - dotenv: a value is double-quoted when it contains whitespace, `#`, `;`,
//!   a quote character or a backslash. Inside quotes `\`, `"`, newline and
//!   carriage return are backslash-escaped.
//! - YAML: a value is double-quoted when it is empty, has leading/trailing
//!   whitespace, contains a YAML indicator character or a control
//!   character, starts with `-` or `?`, or reads as a YAML keyword
//!   (`true`, `null`, `~`, ...). Same escapes as dotenv plus `\t`.

use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};

use serde::{Deserialize, Serialize};

use crate::error::VaultError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Dotenv,
    Yaml,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Dotenv => "dotenv",
            Self::Yaml => "yaml",
        })
    }
}

impl FromStr for Format {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "dotenv" | "env" | ".env" => Ok(Self::Dotenv),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(VaultError::InvalidInput(format!(
                "unsupported format: {other:?}"
            ))),
        }
    }
}

/// Output of an import parse: the pairs found plus per-entry problems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDocument {
    pub entries: Vec<(String, String)>,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

pub fn export<'a, I>(entries: I, format: Format) -> Result<String, VaultError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    match format {
        Format::Json => {
            let map: serde_json::Map<String, serde_json::Value> = entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect();
            Ok(serde_json::to_string_pretty(&map)?)
        }
        Format::Dotenv => Ok(entries
            .into_iter()
            .map(|(k, v)| format!("{k}={}\n", dotenv_value(v)))
            .collect()),
        Format::Yaml => Ok(entries
            .into_iter()
            .map(|(k, v)| format!("{}: {}\n", yaml_scalar(k), yaml_scalar(v)))
            .collect()),
    }
}

/// Quoted when the value holds whitespace, `#` or `;`, or would otherwise
/// read back as a quoted value. Unquoted values are written verbatim.
fn dotenv_value(value: &str) -> String {
    let needs_quotes = value.starts_with(['"', '\''])
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '#' | ';'));
    if needs_quotes {
        format!("\"{}\"", escape(value, false))
    } else {
        value.to_string()
    }
}

const YAML_INDICATORS: &[char] = &[
    ':', '#', '{', '}', '[', ']', ',', '&', '*', '!', '|', '>', '\'', '"', '%', '@', '`', '\\',
];

const YAML_KEYWORDS: &[&str] = &[
    "true", "false", "yes", "no", "on", "off", "null", "~",
];

fn yaml_scalar(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value != value.trim()
        || value.starts_with(['-', '?'])
        || value
            .chars()
            .any(|c| YAML_INDICATORS.contains(&c) || c.is_control())
        || YAML_KEYWORDS.contains(&value.to_ascii_lowercase().as_str());
    if needs_quotes {
        format!("\"{}\"", escape(value, true))
    } else {
        value.to_string()
    }
}

fn escape(value: &str, tabs: bool) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' if tabs => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

pub fn parse(data: &str, format: Format) -> Result<ParsedDocument, VaultError> {
    match format {
        Format::Json => parse_json(data),
        Format::Dotenv => Ok(parse_lines(data, Flavor::Dotenv)),
        Format::Yaml => Ok(parse_lines(data, Flavor::Yaml)),
    }
}

fn parse_json(data: &str) -> Result<ParsedDocument, VaultError> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| VaultError::InvalidInput(format!("invalid JSON: {e}")))?;
    let serde_json::Value::Object(map) = value else {
        return Err(VaultError::InvalidInput(
            "JSON import must be an object of key/value pairs".to_string(),
        ));
    };

    let mut doc = ParsedDocument::default();
    for (key, value) in map {
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                doc.errors
                    .push(format!("{key}: nested values are not supported"));
                continue;
            }
        };
        doc.entries.push((key, value));
    }
    Ok(doc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Dotenv,
    Yaml,
}

/// Value scanner states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Unquoted text up to end of line or an inline ` #` comment.
    Normal,
    /// Literal text up to the closing `'` (YAML: `''` is an escaped quote).
    InSingleQuote,
    /// Text up to the closing `"`, with backslash escapes.
    InDoubleQuote,
    /// The character after a backslash inside double quotes.
    Escaped,
}

struct Cursor<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn skip_inline_space(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
    }

    /// Consume through the next newline (or to the end).
    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    /// Collect the rest of the line without consuming the newline.
    fn rest_of_line(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }
}

fn parse_lines(data: &str, flavor: Flavor) -> ParsedDocument {
    let mut cur = Cursor::new(data);
    let mut doc = ParsedDocument::default();

    while cur.peek().is_some() {
        let line = cur.line;
        let key = match flavor {
            Flavor::Dotenv => scan_dotenv_key(&mut cur),
            Flavor::Yaml => scan_yaml_key(&mut cur),
        };
        let key = match key {
            Ok(Some(key)) => key,
            Ok(None) => continue,
            Err(msg) => {
                cur.skip_line();
                doc.errors.push(format!("line {line}: {msg}"));
                continue;
            }
        };
        match scan_value(&mut cur, flavor) {
            Ok(value) => doc.entries.push((key, value)),
            Err(msg) => doc.errors.push(format!("line {line}: {key}: {msg}")),
        }
    }
    doc
}

/// `None` for blank and comment lines, which are consumed.
fn scan_dotenv_key(cur: &mut Cursor<'_>) -> Result<Option<String>, String> {
    cur.skip_inline_space();
    match cur.peek() {
        None => return Ok(None),
        Some('\n' | '\r') => {
            cur.skip_line();
            return Ok(None);
        }
        Some('#') => {
            cur.skip_line();
            return Ok(None);
        }
        _ => {}
    }

    let mut raw = String::new();
    loop {
        match cur.peek() {
            Some('=') => {
                cur.bump();
                break;
            }
            None | Some('\n') => return Err("expected KEY=VALUE".to_string()),
            Some(c) => {
                raw.push(c);
                cur.bump();
            }
        }
    }

    let key = raw.trim();
    let key = key
        .strip_prefix("export")
        .filter(|rest| rest.starts_with([' ', '\t']))
        .map(str::trim_start)
        .unwrap_or(key);
    Ok(Some(key.to_string()))
}

/// `None` for blank lines, comments and document markers.
fn scan_yaml_key(cur: &mut Cursor<'_>) -> Result<Option<String>, String> {
    if matches!(cur.peek(), Some(' ' | '\t')) {
        cur.skip_inline_space();
        return match cur.peek() {
            None => Ok(None),
            Some('\n' | '\r' | '#') => {
                cur.skip_line();
                Ok(None)
            }
            _ => Err("nested structures are not supported".to_string()),
        };
    }

    match cur.peek() {
        None => return Ok(None),
        Some('\n' | '\r' | '#') => {
            cur.skip_line();
            return Ok(None);
        }
        Some(quote @ ('"' | '\'')) => {
            cur.bump();
            let state = if quote == '"' {
                ScanState::InDoubleQuote
            } else {
                ScanState::InSingleQuote
            };
            let key = scan_quoted(cur, state, Flavor::Yaml)?;
            cur.skip_inline_space();
            // Leave anything else, a newline included, for the caller to skip.
            if cur.peek() != Some(':') {
                return Err("expected ':' after quoted key".to_string());
            }
            cur.bump();
            return Ok(Some(key));
        }
        _ => {}
    }

    let mut raw = String::new();
    loop {
        match cur.peek() {
            Some(':') => {
                cur.bump();
                if matches!(cur.peek(), None | Some(' ' | '\t' | '\n' | '\r')) {
                    break;
                }
                raw.push(':');
            }
            None | Some('\n') => {
                let marker = raw.trim_end();
                if marker == "---" || marker == "..." {
                    cur.skip_line();
                    return Ok(None);
                }
                return Err("expected key: value".to_string());
            }
            Some(c) => {
                raw.push(c);
                cur.bump();
            }
        }
    }
    Ok(Some(raw.trim_end().to_string()))
}

/// Scan one value through the end of its line.
fn scan_value(cur: &mut Cursor<'_>, flavor: Flavor) -> Result<String, String> {
    cur.skip_inline_space();
    let state = match cur.peek() {
        Some('"') => ScanState::InDoubleQuote,
        Some('\'') => ScanState::InSingleQuote,
        _ => ScanState::Normal,
    };

    if state == ScanState::Normal {
        return Ok(scan_unquoted(cur));
    }

    cur.bump();
    let value = match scan_quoted(cur, state, flavor) {
        Ok(value) => value,
        Err(msg) => {
            cur.skip_line();
            return Err(msg);
        }
    };
    finish_line(cur)?;
    Ok(value)
}

fn scan_unquoted(cur: &mut Cursor<'_>) -> String {
    let mut out = String::new();
    while let Some(c) = cur.bump() {
        match c {
            '\n' => break,
            '#' if out.is_empty() || out.ends_with([' ', '\t']) => {
                cur.skip_line();
                break;
            }
            _ => out.push(c),
        }
    }
    out.trim_end().to_string()
}

/// Scan from just after an opening quote through the closing quote.
fn scan_quoted(cur: &mut Cursor<'_>, start: ScanState, flavor: Flavor) -> Result<String, String> {
    let mut state = start;
    let mut out = String::new();
    loop {
        let Some(c) = cur.bump() else {
            return Err("unterminated quoted value".to_string());
        };
        match state {
            ScanState::InDoubleQuote => match c {
                '\\' => state = ScanState::Escaped,
                '"' => return Ok(out),
                _ => out.push(c),
            },
            ScanState::Escaped => {
                match c {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                state = ScanState::InDoubleQuote;
            }
            ScanState::InSingleQuote => match c {
                '\'' if flavor == Flavor::Yaml && cur.peek() == Some('\'') => {
                    cur.bump();
                    out.push('\'');
                }
                '\'' => return Ok(out),
                _ => out.push(c),
            },
            ScanState::Normal => out.push(c),
        }
    }
}

/// After a closing quote only whitespace or a comment may follow.
fn finish_line(cur: &mut Cursor<'_>) -> Result<(), String> {
    cur.skip_inline_space();
    match cur.peek() {
        None => Ok(()),
        Some('\n') => {
            cur.bump();
            Ok(())
        }
        Some('\r') | Some('#') => {
            cur.skip_line();
            Ok(())
        }
        Some(_) => {
            let trailing = cur.rest_of_line();
            cur.skip_line();
            Err(format!("unexpected text after closing quote: {trailing:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(doc: &ParsedDocument) -> Vec<(&str, &str)> {
        doc.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    #[test]
    fn format_names() {
        assert_eq!("JSON".parse::<Format>().unwrap(), Format::Json);
        assert_eq!("env".parse::<Format>().unwrap(), Format::Dotenv);
        assert_eq!("yml".parse::<Format>().unwrap(), Format::Yaml);
        assert!(matches!(
            "toml".parse::<Format>(),
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn dotenv_export_quoting() {
        let out = export(
            [
                ("PLAIN", "abc"),
                ("SPACED", "a b"),
                ("HASH", "a#b"),
                ("SEMI", "a;b"),
                ("MULTI", "l1\nl2\r"),
                ("QUOTE", "say \"hi\""),
                ("EMPTY", ""),
            ],
            Format::Dotenv,
        )
        .unwrap();
        assert_eq!(
            out,
            "PLAIN=abc\nSPACED=\"a b\"\nHASH=\"a#b\"\nSEMI=\"a;b\"\nMULTI=\"l1\\nl2\\r\"\nQUOTE=\"say \\\"hi\\\"\"\nEMPTY=\n"
        );
    }

    #[test]
    fn dotenv_export_leaves_backslashes_and_inner_quotes_bare() {
        let out = export(
            [("DIR", "C:\\dir"), ("INNER", "a\"b'c"), ("LEAD", "'x")],
            Format::Dotenv,
        )
        .unwrap();
        assert_eq!(out, "DIR=C:\\dir\nINNER=a\"b'c\nLEAD=\"'x\"\n");

        let doc = parse(&out, Format::Dotenv).unwrap();
        assert!(doc.errors.is_empty(), "{:?}", doc.errors);
        assert_eq!(
            pairs(&doc),
            vec![("DIR", "C:\\dir"), ("INNER", "a\"b'c"), ("LEAD", "'x")]
        );
    }

    #[test]
    fn yaml_export_quoting() {
        let out = export(
            [
                ("HOST", "db.internal"),
                ("EMPTY", ""),
                ("URL", "http://x"),
                ("FLAG", "true"),
                ("DASH", "-v"),
            ],
            Format::Yaml,
        )
        .unwrap();
        assert_eq!(
            out,
            "HOST: db.internal\nEMPTY: \"\"\nURL: \"http://x\"\nFLAG: \"true\"\nDASH: \"-v\"\n"
        );
    }

    #[test]
    fn json_export_is_pretty_object() {
        let out = export([("A", "1"), ("B", "two")], Format::Json).unwrap();
        assert_eq!(out, "{\n  \"A\": \"1\",\n  \"B\": \"two\"\n}");
    }

    #[test]
    fn dotenv_parse_features() {
        let doc = parse(
            "# comment\n\nexport A=1\nB = two words # trailing\nC=\"x\\ny\" # c\nD='lit\\n'\nE=\nF=\"multi\nline\"\n",
            Format::Dotenv,
        )
        .unwrap();
        assert!(doc.errors.is_empty(), "{:?}", doc.errors);
        assert_eq!(
            pairs(&doc),
            vec![
                ("A", "1"),
                ("B", "two words"),
                ("C", "x\ny"),
                ("D", "lit\\n"),
                ("E", ""),
                ("F", "multi\nline"),
            ]
        );
    }

    #[test]
    fn dotenv_parse_errors_do_not_stop_scanning() {
        let doc = parse("GOOD=1\nno equals here\nBAD=\"x\" y\nALSO=2\n", Format::Dotenv).unwrap();
        assert_eq!(pairs(&doc), vec![("GOOD", "1"), ("ALSO", "2")]);
        assert_eq!(doc.errors.len(), 2);
        assert!(doc.errors[0].starts_with("line 2:"));
        assert!(doc.errors[1].starts_with("line 3: BAD:"));
    }

    #[test]
    fn dotenv_unterminated_quote() {
        let doc = parse("A=1\nB=\"open", Format::Dotenv).unwrap();
        assert_eq!(pairs(&doc), vec![("A", "1")]);
        assert_eq!(doc.errors, vec!["line 2: B: unterminated quoted value".to_string()]);
    }

    #[test]
    fn yaml_parse_features() {
        let doc = parse(
            "---\n# c\nA: plain value # note\n\"B:C\": \"x\\ty\"\nD: 'it''s'\nE: \"\"\nF:\nURL: http://h:80/p\n",
            Format::Yaml,
        )
        .unwrap();
        assert!(doc.errors.is_empty(), "{:?}", doc.errors);
        assert_eq!(
            pairs(&doc),
            vec![
                ("A", "plain value"),
                ("B:C", "x\ty"),
                ("D", "it's"),
                ("E", ""),
                ("F", ""),
                ("URL", "http://h:80/p"),
            ]
        );
    }

    #[test]
    fn yaml_rejects_nesting() {
        let doc = parse("A: 1\nB:\n  C: 2\nD: 3\n", Format::Yaml).unwrap();
        assert_eq!(pairs(&doc), vec![("A", "1"), ("B", ""), ("D", "3")]);
        assert_eq!(doc.errors, vec!["line 3: nested structures are not supported".to_string()]);
    }

    #[test]
    fn yaml_quoted_key_without_colon_keeps_next_line() {
        let doc = parse("\"A\"\nB: 1\n'C' x\nD: 2\n", Format::Yaml).unwrap();
        assert_eq!(pairs(&doc), vec![("B", "1"), ("D", "2")]);
        assert_eq!(
            doc.errors,
            vec![
                "line 1: expected ':' after quoted key".to_string(),
                "line 3: expected ':' after quoted key".to_string(),
            ]
        );
    }

    #[test]
    fn json_parse_scalars_and_nesting() {
        let doc = parse(
            r#"{"A": "x", "B": 5, "C": true, "D": null, "E": {"x": 1}}"#,
            Format::Json,
        )
        .unwrap();
        assert_eq!(
            pairs(&doc),
            vec![("A", "x"), ("B", "5"), ("C", "true"), ("D", "")]
        );
        assert_eq!(doc.errors, vec!["E: nested values are not supported".to_string()]);
        assert!(parse("[1, 2]", Format::Json).is_err());
        assert!(parse("{oops", Format::Json).is_err());
    }

    #[test]
    fn round_trip_every_format() {
        let original = [
            ("API_URL", "https://api.example.com/v1"),
            ("DB_PASSWORD", "p@ss w0rd;#1"),
            ("EMPTY", ""),
            ("QUOTED", "say \"hi\" and 'bye'"),
            ("REGION", "eu-west-1"),
        ];
        for format in [Format::Json, Format::Dotenv, Format::Yaml] {
            let text = export(original, format).unwrap();
            let doc = parse(&text, format).unwrap();
            assert!(doc.errors.is_empty(), "{format}: {:?}", doc.errors);
            assert_eq!(pairs(&doc), original.to_vec(), "{format}");
        }
    }
}
