//! Shell-style `KEY=value` file parser.
//!
//! Supported forms:
//!
//! ```text
//! # comment
//! GPDB_COORDINATOR_HOST=mdw
//! export GPDB_ADMIN_USER="gpadmin"
//! GPDB_DATA_DIR='/data'        # trailing comment
//! GPDB_SEGMENT_HOSTS=(sdw1 sdw2
//!                     "sdw 3")
//! ```
//!
//! No variable expansion is performed; `$HOME` stays literal.

use gpdeploy_utils::error::ConfigError;

/// Right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Scalar(String),
    Array(Vec<String>),
}

/// One assignment with the line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub key: String,
    pub value: RawValue,
    pub line: usize,
}

/// Parse `text`. `origin` names the source in error messages.
pub fn parse_str(text: &str, origin: &str) -> Result<Vec<RawEntry>, ConfigError> {
    let err = |line: usize, reason: String| ConfigError::Parse {
        path: origin.to_string(),
        line,
        reason,
    };

    let mut entries = Vec::new();
    let mut lines = text.lines().enumerate();

    while let Some((idx, raw_line)) = lines.next() {
        let line = idx + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let stmt = trimmed
            .strip_prefix("export ")
            .map_or(trimmed, str::trim_start);

        let Some((key, rest)) = stmt.split_once('=') else {
            return Err(err(line, format!("expected KEY=value, found '{stmt}'")));
        };
        let key = key.trim_end();
        if !is_identifier(key) {
            return Err(err(line, format!("invalid key '{key}'")));
        }
        let rest = rest.trim();

        let value = if let Some(body) = rest.strip_prefix('(') {
            let mut body = strip_comment(body).map_err(|r| err(line, r))?.to_string();
            loop {
                let close = find_unquoted(&body, |c, _| c == ')').map_err(|r| err(line, r))?;
                if let Some(pos) = close {
                    let trailing = body[pos + 1..].trim();
                    if !trailing.is_empty() {
                        return Err(err(line, format!("unexpected '{trailing}' after ')'")));
                    }
                    let words = shell_words::split(&body[..pos])
                        .map_err(|e| err(line, format!("invalid array: {e}")))?;
                    break RawValue::Array(words);
                }
                match lines.next() {
                    Some((_, next)) => {
                        body.push(' ');
                        body.push_str(strip_comment(next).map_err(|r| err(line, r))?);
                    }
                    None => return Err(err(line, format!("array {key} is missing ')'"))),
                }
            }
        } else {
            let value = strip_comment(rest).map_err(|r| err(line, r))?;
            let mut words = shell_words::split(value)
                .map_err(|e| err(line, format!("invalid value: {e}")))?;
            match words.len() {
                0 => RawValue::Scalar(String::new()),
                1 => RawValue::Scalar(words.remove(0)),
                _ => {
                    return Err(err(
                        line,
                        format!("value of {key} contains unquoted whitespace; quote it"),
                    ));
                }
            }
        };

        entries.push(RawEntry {
            key: key.to_string(),
            value,
            line,
        });
    }

    Ok(entries)
}

/// Parse a boolean flag value.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Drop an unquoted `#` comment that starts the text or follows whitespace.
fn strip_comment(s: &str) -> Result<&str, String> {
    let pos = find_unquoted(s, |c, prev| c == '#' && prev.is_none_or(char::is_whitespace))?;
    Ok(pos.map_or(s, |p| &s[..p]))
}

fn find_unquoted<F>(s: &str, target: F) -> Result<Option<usize>, String>
where
    F: Fn(char, Option<char>) -> bool,
{
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut prev: Option<char> = None;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else {
            match quote {
                Some('\'') => {
                    if c == '\'' {
                        quote = None;
                    }
                }
                Some(_) => match c {
                    '\\' => escaped = true,
                    '"' => quote = None,
                    _ => {}
                },
                None => match c {
                    '\\' => escaped = true,
                    '\'' | '"' => quote = Some(c),
                    _ if target(c, prev) => return Ok(Some(i)),
                    _ => {}
                },
            }
        }
        prev = Some(c);
    }

    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scalar(entries: &[RawEntry], key: &str) -> String {
        match &entries.iter().rfind(|e| e.key == key).unwrap().value {
            RawValue::Scalar(s) => s.clone(),
            RawValue::Array(_) => panic!("{key} is an array"),
        }
    }

    #[test]
    fn parses_scalars_quotes_and_comments() {
        let text = r#"
# cluster layout
GPDB_COORDINATOR_HOST=mdw
export GPDB_ADMIN_USER="gp admin"
GPDB_DATA_DIR='/data/gp'   # where segments live
GPDB_ARRAY_NAME=prod#1
EMPTY=
"#;
        let entries = parse_str(text, "gpdeploy.conf").unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(scalar(&entries, "GPDB_COORDINATOR_HOST"), "mdw");
        assert_eq!(scalar(&entries, "GPDB_ADMIN_USER"), "gp admin");
        assert_eq!(scalar(&entries, "GPDB_DATA_DIR"), "/data/gp");
        assert_eq!(scalar(&entries, "GPDB_ARRAY_NAME"), "prod#1");
        assert_eq!(scalar(&entries, "EMPTY"), "");
        assert_eq!(entries[0].line, 3);
    }

    #[test]
    fn parses_multiline_array_with_comments() {
        let text = "GPDB_SEGMENT_HOSTS=(sdw1   # rack a\n  sdw2\n  \"sdw 3\" )\nSSH_PORT=2222\n";
        let entries = parse_str(text, "t").unwrap();
        assert_eq!(
            entries[0].value,
            RawValue::Array(vec!["sdw1".into(), "sdw2".into(), "sdw 3".into()])
        );
        assert_eq!(entries[1].line, 4);
    }

    #[test]
    fn reports_line_of_unterminated_array() {
        let err = parse_str("A=1\nHOSTS=(a b\nc\n", "conf").unwrap_err();
        match err {
            ConfigError::Parse { line, path, .. } => {
                assert_eq!(line, 2);
                assert_eq!(path, "conf");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(parse_str("not an assignment", "t").is_err());
        assert!(parse_str("1KEY=x", "t").is_err());
        assert!(parse_str("KEY=two words", "t").is_err());
        assert!(parse_str("KEY=\"open", "t").is_err());
        assert!(parse_str("KEY=(a b) junk", "t").is_err());
    }

    #[test]
    fn bool_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    proptest! {
        #[test]
        fn array_preserves_host_order(hosts in proptest::collection::vec("[a-z][a-z0-9.-]{0,15}", 1..10)) {
            let text = format!("GPDB_SEGMENT_HOSTS=({})\n", hosts.join("\n  "));
            let entries = parse_str(&text, "t").unwrap();
            prop_assert_eq!(&entries[0].value, &RawValue::Array(hosts.clone()));
        }
    }
}
