//! Best-effort JSON recovery for model output.
//!
//! Chat models asked for JSON routinely wrap it in markdown fences, stop
//! mid-object when they hit a token limit, or emit trailing commas. This
//! parser accepts such input and produces the closest `serde_json::Value`:
//! unterminated strings, arrays and objects are closed at end of input,
//! trailing commas are ignored, and `NaN`-like garbage fails cleanly.

use serde_json::{Map, Number, Value};

/// Parses `input` into a JSON value, repairing common model damage.
///
/// Well-formed JSON round-trips unchanged (strict parse is attempted
/// first). Returns `None` when nothing resembling JSON can be recovered.
pub fn repair_json(input: &str) -> Option<Value> {
    let trimmed = strip_fences(input.trim());
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let mut parser = Repairer {
        chars: trimmed.chars().collect(),
        pos: 0,
    };
    parser.skip_whitespace();
    let value = parser.parse_value()?;
    Some(value)
}

/// Drops a surrounding markdown code fence (```json ... ```), if present.
fn strip_fences(input: &str) -> &str {
    let Some(rest) = input.strip_prefix("```") else {
        return input;
    };
    // skip the info string on the opening fence line
    let rest = match rest.find('\n') {
        Some(idx) => rest.get(idx.saturating_add(1)..).unwrap_or(""),
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

struct Repairer {
    chars: Vec<char>,
    pos: usize,
}

impl Repairer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos = self.pos.saturating_add(1);
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.next();
        }
    }

    fn parse_value(&mut self) -> Option<Value> {
        self.skip_whitespace();
        match self.peek()? {
            '{' => self.parse_object(),
            '[' => self.parse_array(),
            '"' | '\'' => Some(Value::String(self.parse_string())),
            c if c == '-' || c.is_ascii_digit() => self.parse_number(),
            _ => self.parse_keyword(),
        }
    }

    fn parse_object(&mut self) -> Option<Value> {
        self.next(); // consume '{'
        let mut map = Map::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => break, // truncated, close here
                Some('}') => {
                    self.next();
                    break;
                }
                Some(',') => {
                    self.next();
                    continue;
                }
                Some('"') | Some('\'') => {
                    let key = self.parse_string();
                    self.skip_whitespace();
                    if self.peek() == Some(':') {
                        self.next();
                    }
                    self.skip_whitespace();
                    if self.peek().is_none() {
                        // key without a value at end of input
                        map.insert(key, Value::Null);
                        break;
                    }
                    let value = self.parse_value().unwrap_or(Value::Null);
                    map.insert(key, value);
                }
                Some(_) => {
                    // not a quoted key; give up on this character
                    self.next();
                }
            }
        }
        Some(Value::Object(map))
    }

    fn parse_array(&mut self) -> Option<Value> {
        self.next(); // consume '['
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => break, // truncated, close here
                Some(']') => {
                    self.next();
                    break;
                }
                Some(',') => {
                    self.next();
                    continue;
                }
                Some(_) => match self.parse_value() {
                    Some(value) => items.push(value),
                    None => break,
                },
            }
        }
        Some(Value::Array(items))
    }

    /// Parses a string delimited by `"` or `'`; an unterminated string is
    /// closed at end of input.
    fn parse_string(&mut self) -> String {
        let quote = self.next().unwrap_or('"');
        let mut out = String::new();
        while let Some(c) = self.next() {
            match c {
                '\\' => match self.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('u') => {
                        let mut code = String::new();
                        for _ in 0..4 {
                            if let Some(h) = self.next() {
                                code.push(h);
                            }
                        }
                        if let Some(parsed) =
                            u32::from_str_radix(&code, 16).ok().and_then(char::from_u32)
                        {
                            out.push(parsed);
                        }
                    }
                    Some(escaped) => out.push(escaped),
                    None => break,
                },
                c if c == quote => return out,
                _ => out.push(c),
            }
        }
        out
    }

    fn parse_number(&mut self) -> Option<Value> {
        let mut literal = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                literal.push(c);
                self.next();
            } else {
                break;
            }
        }
        if let Ok(int) = literal.parse::<i64>() {
            return Some(Value::Number(Number::from(int)));
        }
        literal
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    }

    fn parse_keyword(&mut self) -> Option<Value> {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() {
                word.push(c);
                self.next();
            } else {
                break;
            }
        }
        match word.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            "null" => Some(Value::Null),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_json_round_trips() {
        let input = r#"{"points": [{"description": "a", "score": 3}]}"#;
        let strict: Value = serde_json::from_str(input).unwrap();
        assert_eq!(repair_json(input).unwrap(), strict);
    }

    #[test]
    fn test_markdown_fence_is_stripped() {
        let input = "```json\n{\"points\": []}\n```";
        assert_eq!(repair_json(input).unwrap(), json!({"points": []}));
    }

    #[test]
    fn test_truncated_object_is_closed() {
        let input = r#"{"points": [{"description": "partial ans"#;
        let value = repair_json(input).unwrap();
        assert_eq!(
            value,
            json!({"points": [{"description": "partial ans"}]})
        );
    }

    #[test]
    fn test_truncated_after_colon_yields_null() {
        let value = repair_json(r#"{"score":"#).unwrap();
        assert_eq!(value, json!({"score": null}));
    }

    #[test]
    fn test_trailing_comma_tolerated() {
        let value = repair_json(r#"{"a": 1, "b": [1, 2,],}"#).unwrap();
        assert_eq!(value, json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn test_single_quoted_strings() {
        let value = repair_json(r#"{'answer': 'yes'}"#).unwrap();
        assert_eq!(value, json!({"answer": "yes"}));
    }

    #[test]
    fn test_escapes_in_strings() {
        let value = repair_json(r#"{"a": "line\nbreak \"quoted\""}"#).unwrap();
        assert_eq!(value, json!({"a": "line\nbreak \"quoted\""}));
    }

    #[test]
    fn test_plain_prose_is_rejected() {
        assert!(repair_json("I could not produce JSON, sorry.").is_none());
        assert!(repair_json("").is_none());
    }

    #[test]
    fn test_numbers() {
        assert_eq!(repair_json("[1, -2, 3.5]").unwrap(), json!([1, -2, 3.5]));
    }
}
