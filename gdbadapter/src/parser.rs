/// GDB/MI output parser
///
/// This module turns single lines of GDB/MI protocol output into [`Record`]s.
/// A line that carries no known record sigil is "not a record" (`Ok(None)`);
/// a line that does but whose body is structurally broken is a [`ParseError`].

use crate::types::*;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Literal line GDB prints when it is idle and waiting for input
pub const PROMPT: &str = "(gdb)";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("mismatched closing bracket '{found}' at position {position}")]
    MismatchedBracket { found: char, position: usize },
    #[error("unclosed bracket '{0}'")]
    UnclosedBracket(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid value format: {0}")]
    InvalidValue(String),
    #[error("expected key=value, got: {0}")]
    MissingEquals(String),
    #[error("mixed result and value items in list: {0}")]
    MixedList(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

fn header_regex() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"(?s)^(\d*)([\^*+=~@&])(.*)$").expect("record header pattern is valid")
    })
}

/// Parse one line of GDB/MI output
pub fn parse_record(line: &str) -> Result<Option<Record>> {
    let line = line.trim();

    if line == PROMPT {
        return Ok(Some(Record::Prompt));
    }

    let Some(caps) = header_regex().captures(line) else {
        return Ok(None);
    };

    let token = match caps.get(1).map(|m| m.as_str()).filter(|t| !t.is_empty()) {
        Some(digits) => match digits.parse::<u64>() {
            Ok(token) => Some(token),
            Err(_) => return Ok(None),
        },
        None => None,
    };
    let sigil = caps[2].chars().next().unwrap_or_default();
    let body = caps.get(3).map_or("", |m| m.as_str());

    if sigil == '^' {
        return Ok(parse_result_record(body, token)?.map(Record::Result));
    }
    if let Some(kind) = AsyncKind::from_sigil(sigil) {
        return Ok(parse_async_record(body, kind, token)?.map(Record::Async));
    }
    Ok(StreamType::from_sigil(sigil).map(|stream_type| {
        Record::Stream(StreamRecord {
            stream_type,
            content: strip_quotes(body).to_string(),
        })
    }))
}

/// Parse the body of a result record (the text after `^`)
pub fn parse_result_record(body: &str, token: Option<u64>) -> Result<Option<ResultRecord>> {
    Ok(parse_class_and_payload(body)?.map(|(class, payload)| ResultRecord {
        token,
        class: ResultClass::from(class),
        payload,
    }))
}

/// Parse the body of an async record (the text after `*`, `+` or `=`)
pub fn parse_async_record(
    body: &str,
    kind: AsyncKind,
    token: Option<u64>,
) -> Result<Option<AsyncRecord>> {
    Ok(parse_class_and_payload(body)?.map(|(class, payload)| AsyncRecord {
        token,
        kind,
        class: class.to_string(),
        payload,
    }))
}

fn parse_class_and_payload(body: &str) -> Result<Option<(&str, Payload)>> {
    let (class, rest) = match body.split_once(',') {
        Some((class, rest)) => (class, Some(rest)),
        None => (body, None),
    };

    if class.is_empty() {
        return Ok(None);
    }

    let payload = match rest {
        Some(rest) => parse_tuple(rest)?,
        None => Payload::new(),
    };

    Ok(Some((class, payload)))
}

fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

/// Split a field list on commas that are not nested in brackets or strings
pub fn split_fields(s: &str) -> Result<Vec<&str>> {
    let mut fields = Vec::new();
    let mut brackets: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;

    for (position, ch) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => brackets.push(ch),
            '}' | ']' => {
                let open = if ch == '}' { '{' } else { '[' };
                if brackets.pop() != Some(open) {
                    return Err(ParseError::MismatchedBracket { found: ch, position });
                }
            }
            ',' if brackets.is_empty() => {
                fields.push(&s[start..position]);
                start = position + 1;
            }
            _ => {}
        }
    }

    if in_string {
        return Err(ParseError::UnterminatedString);
    }
    if let Some(&open) = brackets.last() {
        return Err(ParseError::UnclosedBracket(open));
    }

    if start < s.len() {
        fields.push(&s[start..]);
    }
    Ok(fields)
}

/// Split `key=value` at a `=` that comes before any string or bracket
fn split_key_value(field: &str) -> Option<(&str, &str)> {
    let position = field.find(['=', '"', '{', '['])?;
    if field[position..].starts_with('=') {
        Some((&field[..position], &field[position + 1..]))
    } else {
        None
    }
}

/// Parse a value (string, list, or tuple)
pub fn parse_value(s: &str) -> Result<Value> {
    if let Some(inner) = s.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        return parse_tuple(inner).map(Value::Tuple);
    }
    if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return parse_list(inner).map(Value::List);
    }
    if let Some(inner) = s.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Ok(Value::String(inner.to_string()));
    }
    Err(ParseError::InvalidValue(s.to_string()))
}

/// Parse the interior of a `[...]` list
///
/// Items are either all `key=value` results, each becoming a single-entry
/// tuple, or all bare values. Mixing the two is an error.
pub fn parse_list(s: &str) -> Result<Vec<Value>> {
    let fields = split_fields(s)?;
    let results = fields
        .iter()
        .filter(|field| split_key_value(field).is_some())
        .count();

    if results == fields.len() {
        fields
            .into_iter()
            .map(|field| parse_tuple(field).map(Value::Tuple))
            .collect()
    } else if results == 0 {
        fields.into_iter().map(parse_value).collect()
    } else {
        Err(ParseError::MixedList(s.to_string()))
    }
}

/// Parse the interior of a `{...}` tuple, or a top-level result list
pub fn parse_tuple(s: &str) -> Result<Payload> {
    let mut payload = Payload::new();
    for field in split_fields(s)? {
        let (key, value) = parse_key_value(field)?;
        payload.insert(key, value);
    }
    Ok(payload)
}

/// Parse a single `key=value` result
pub fn parse_key_value(s: &str) -> Result<(String, Value)> {
    let (key, value) =
        split_key_value(s).ok_or_else(|| ParseError::MissingEquals(s.to_string()))?;
    Ok((key.to_string(), parse_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    fn tuple(entries: &[(&str, Value)]) -> Payload {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_split_fields() {
        assert_eq!(split_fields("").unwrap(), Vec::<&str>::new());
        assert_eq!(split_fields("a,b,c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split_fields("a,{b,c},d").unwrap(), vec!["a", "{b,c}", "d"]);
        assert_eq!(
            split_fields(r#"a,{b,{c="d"}},[e,f],"g,h""#).unwrap(),
            vec!["a", r#"{b,{c="d"}}"#, "[e,f]", r#""g,h""#]
        );
    }

    #[test]
    fn test_split_fields_ignores_brackets_and_escaped_quotes_in_strings() {
        assert_eq!(
            split_fields(r#"msg="a \"b,c\" [d",e="f""#).unwrap(),
            vec![r#"msg="a \"b,c\" [d""#, r#"e="f""#]
        );
    }

    #[test]
    fn test_split_fields_rejects_mismatched_brackets() {
        assert_eq!(
            split_fields("a,b]"),
            Err(ParseError::MismatchedBracket { found: ']', position: 3 })
        );
        assert!(matches!(
            split_fields("{a,b]"),
            Err(ParseError::MismatchedBracket { found: ']', .. })
        ));
        assert!(matches!(
            split_fields("a}"),
            Err(ParseError::MismatchedBracket { found: '}', .. })
        ));
        assert_eq!(split_fields("{a,b"), Err(ParseError::UnclosedBracket('{')));
        assert_eq!(split_fields(r#"a="b"#), Err(ParseError::UnterminatedString));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value(r#""test""#).unwrap(), s("test"));
        assert_eq!(
            parse_value(r#"{a="1"}"#).unwrap(),
            Value::Tuple(tuple(&[("a", s("1"))]))
        );
        assert_eq!(
            parse_value(r#"["1","2","3"]"#).unwrap(),
            Value::List(vec![s("1"), s("2"), s("3")])
        );
        assert_eq!(parse_value(r#""""#).unwrap(), s(""));
        assert!(matches!(parse_value("bare"), Err(ParseError::InvalidValue(_))));
        assert!(matches!(parse_value("\""), Err(ParseError::InvalidValue(_))));
    }

    #[test]
    fn test_parse_value_does_not_unescape() {
        assert_eq!(parse_value(r#""a\nb""#).unwrap(), s(r"a\nb"));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("").unwrap(), vec![]);
        assert_eq!(
            parse_list(r#""a","b","c""#).unwrap(),
            vec![s("a"), s("b"), s("c")]
        );
        assert_eq!(
            parse_list(r#"{a="1"},{b="2",c="3"}"#).unwrap(),
            vec![
                Value::Tuple(tuple(&[("a", s("1"))])),
                Value::Tuple(tuple(&[("b", s("2")), ("c", s("3"))])),
            ]
        );
        assert_eq!(
            parse_list(r#""a",{b="1",c="2"},["d","e"]"#).unwrap(),
            vec![
                s("a"),
                Value::Tuple(tuple(&[("b", s("1")), ("c", s("2"))])),
                Value::List(vec![s("d"), s("e")]),
            ]
        );
    }

    #[test]
    fn test_parse_list_of_results() {
        assert_eq!(
            parse_list(r#"a="1",b={c="2",d="3"},e="4""#).unwrap(),
            vec![
                Value::Tuple(tuple(&[("a", s("1"))])),
                Value::Tuple(tuple(&[(
                    "b",
                    Value::Tuple(tuple(&[("c", s("2")), ("d", s("3"))]))
                )])),
                Value::Tuple(tuple(&[("e", s("4"))])),
            ]
        );
    }

    #[test]
    fn test_parse_list_rejects_mixed_items() {
        assert!(matches!(
            parse_list(r#"a="1","b""#),
            Err(ParseError::MixedList(_))
        ));
        // a quoted "=" is not a result separator
        assert_eq!(parse_list(r#""a=1","b""#).unwrap(), vec![s("a=1"), s("b")]);
    }

    #[test]
    fn test_parse_tuple() {
        assert_eq!(parse_tuple("").unwrap(), Payload::new());
        assert_eq!(
            parse_tuple(r#"a="1",b="2""#).unwrap(),
            tuple(&[("a", s("1")), ("b", s("2"))])
        );
        assert_eq!(
            parse_tuple(r#"a="1",b={c="2",d="3"}"#).unwrap(),
            tuple(&[
                ("a", s("1")),
                ("b", Value::Tuple(tuple(&[("c", s("2")), ("d", s("3"))]))),
            ])
        );
        assert!(matches!(
            parse_tuple(r#""1""#),
            Err(ParseError::MissingEquals(_))
        ));
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value(r#"a="1""#).unwrap(), ("a".to_string(), s("1")));
        assert_eq!(
            parse_key_value(r#"e=["4","5"]"#).unwrap(),
            ("e".to_string(), Value::List(vec![s("4"), s("5")]))
        );
        assert_eq!(
            parse_key_value(r#"x="a=b""#).unwrap(),
            ("x".to_string(), s("a=b"))
        );
    }

    #[test]
    fn test_parse_result_record() {
        let record = parse_record(r#"^done,name="test",value="42""#).unwrap();
        assert_eq!(
            record,
            Some(Record::Result(ResultRecord {
                token: None,
                class: ResultClass::Done,
                payload: tuple(&[("name", s("test")), ("value", s("42"))]),
            }))
        );
    }

    #[test]
    fn test_parse_result_without_payload() {
        match parse_record("^running").unwrap() {
            Some(Record::Result(result)) => {
                assert_eq!(result.class, ResultClass::Running);
                assert!(result.payload.is_empty());
            }
            other => panic!("Expected result record, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_token_prefix() {
        match parse_record("42^done").unwrap() {
            Some(Record::Result(result)) => assert_eq!(result.token, Some(42)),
            other => panic!("Expected result record, got {other:?}"),
        }
        match parse_record("7*running,thread-id=\"all\"").unwrap() {
            Some(Record::Async(record)) => {
                assert_eq!(record.token, Some(7));
                assert_eq!(record.kind, AsyncKind::Exec);
            }
            other => panic!("Expected async record, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_async_record() {
        let line = r#"*stopped,reason="breakpoint-hit",frame={addr="0x401000",func="main",args=[],arch="i386:x86-64"},thread-id="1""#;
        match parse_record(line).unwrap() {
            Some(Record::Async(record)) => {
                assert_eq!(record.kind, AsyncKind::Exec);
                assert_eq!(record.class, "stopped");
                assert_eq!(
                    record.payload,
                    tuple(&[
                        ("reason", s("breakpoint-hit")),
                        (
                            "frame",
                            Value::Tuple(tuple(&[
                                ("addr", s("0x401000")),
                                ("func", s("main")),
                                ("args", Value::List(vec![])),
                                ("arch", s("i386:x86-64")),
                            ]))
                        ),
                        ("thread-id", s("1")),
                    ])
                );
                assert_eq!(record.stop_reason(), Some(StopReason::BreakpointHit));
            }
            other => panic!("Expected async record, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_async_kinds() {
        let kinds = [
            ("*running", AsyncKind::Exec),
            ("+download", AsyncKind::Status),
            ("=thread-group-added,id=\"i1\"", AsyncKind::Notify),
        ];
        for (line, kind) in kinds {
            match parse_record(line).unwrap() {
                Some(Record::Async(record)) => assert_eq!(record.kind, kind),
                other => panic!("Expected async record for {line}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_stream_records() {
        let cases = [
            (r#"~"Hello, world!""#, StreamType::Console, "Hello, world!"),
            (r#"@"input""#, StreamType::Target, "input"),
            (r#"&"Error message""#, StreamType::Log, "Error message"),
        ];
        for (line, stream_type, content) in cases {
            assert_eq!(
                parse_record(line).unwrap(),
                Some(Record::Stream(StreamRecord {
                    stream_type,
                    content: content.to_string(),
                }))
            );
        }
    }

    #[test]
    fn test_parse_prompt_and_unknown() {
        assert_eq!(parse_record("(gdb)").unwrap(), Some(Record::Prompt));
        assert_eq!(parse_record("(gdb) ").unwrap(), Some(Record::Prompt));
        assert_eq!(parse_record("random garbage").unwrap(), None);
        assert_eq!(parse_record("").unwrap(), None);
        assert_eq!(parse_record("^").unwrap(), None);
    }

    #[test]
    fn test_malformed_body_is_an_error_not_none() {
        assert!(parse_record(r#"^done,bkpt={number="1""#).is_err());
        assert!(parse_record(r#"*stopped,reason=breakpoint"#).is_err());
    }
}
