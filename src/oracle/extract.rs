//! Pulling one JSON object out of free-text completions.
//!
//! Strategies are tried in order: the whole text, the body of a markdown
//! fence, the first balanced `{...}` that parses, and finally the slice from
//! the first `{` to the last `}`.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::OracleParseError;

const PREVIEW_CHARS: usize = 120;

/// Extract the JSON object carried by `text`.
pub fn extract_json_object(text: &str) -> Result<Value, OracleParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(OracleParseError::Empty);
    }

    if let Some(value) = parse_object(text) {
        return Ok(value);
    }

    if let Some(value) = fenced_block(text).and_then(parse_object) {
        return Ok(value);
    }

    if let Some(value) = balanced_objects(text).find_map(parse_object) {
        return Ok(value);
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Some(value) = parse_object(&text[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(OracleParseError::NoJson {
        preview: text.chars().take(PREVIEW_CHARS).collect(),
    })
}

/// Extract and deserialize into `T`.
pub fn extract_typed<T: DeserializeOwned>(text: &str) -> Result<T, OracleParseError> {
    let value = extract_json_object(text)?;
    serde_json::from_value(value).map_err(|e| OracleParseError::Shape {
        message: e.to_string(),
    })
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the language tag line, if any.
    let body_start = match after.find('\n') {
        Some(nl) if !after[..nl].contains('{') => nl + 1,
        _ => 0,
    };
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Every top-level `{...}` region, tracking string literals so braces
/// inside strings do not count.
fn balanced_objects(text: &str) -> impl Iterator<Item = &str> {
    let bytes = text.as_bytes();
    let mut pos = 0;

    std::iter::from_fn(move || {
        while pos < bytes.len() {
            let start = pos + text[pos..].find('{')?;
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;

            for (offset, &b) in bytes[start..].iter().enumerate() {
                if in_string {
                    match b {
                        _ if escaped => escaped = false,
                        b'\\' => escaped = true,
                        b'"' => in_string = false,
                        _ => {}
                    }
                    continue;
                }
                match b {
                    b'"' => in_string = true,
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            let end = start + offset + 1;
                            pos = end;
                            return Some(&text[start..end]);
                        }
                    }
                    _ => {}
                }
            }

            // Unbalanced from here on; try the next opening brace.
            pos = start + 1;
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_direct_json() {
        let value = extract_json_object(r#"{"result": "confirmed"}"#).unwrap();
        assert_eq!(value, json!({"result": "confirmed"}));
    }

    #[test]
    fn test_markdown_fence() {
        let text = "Here is my verdict:\n```json\n{\"result\": \"rejected\"}\n```\nDone.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["result"], "rejected");
    }

    #[test]
    fn test_fence_without_language_tag() {
        let text = "```\n{\"commands\": [\"!threads\"]}\n```";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["commands"][0], "!threads");
    }

    #[test]
    fn test_balanced_scan_ignores_braces_in_strings() {
        let text = r#"Thinking... {"reasoning": "saw } in output", "result": "inconclusive"} trailing {junk"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["result"], "inconclusive");
        assert_eq!(value["reasoning"], "saw } in output");
    }

    #[test]
    fn test_balanced_scan_skips_non_json_braces() {
        let text = r#"Use {placeholder} syntax. {"alternative_command": "!syncblk"}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["alternative_command"], "!syncblk");
    }

    #[test]
    fn test_no_json() {
        assert_eq!(extract_json_object("   "), Err(OracleParseError::Empty));
        assert!(matches!(
            extract_json_object("I cannot decide."),
            Err(OracleParseError::NoJson { .. })
        ));
        assert!(matches!(
            extract_json_object("[1, 2, 3]"),
            Err(OracleParseError::NoJson { .. })
        ));
    }

    #[test]
    fn test_typed_shape_error() {
        #[derive(Debug, Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            required: String,
        }

        let err = extract_typed::<Needs>(r#"{"other": 1}"#).unwrap_err();
        assert!(matches!(err, OracleParseError::Shape { .. }));
    }
}
