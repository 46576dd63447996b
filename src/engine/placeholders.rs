//! Placeholder substitution in planned commands.
//!
//! The oracle sometimes plans a command before the value it needs is known,
//! e.g. `!gcroot <address_of_largest_object>` or `!dumpheap -mt <MT_of_Foo>`.
//! Placeholders are filled from evidence text already gathered, searched
//! newest first. Hex values always carry a `0x` prefix.

use std::sync::OnceLock;

use regex::Regex;

/// Candidate values kept per placeholder before hint filtering gives up.
const MAX_CANDIDATES: usize = 10;
const MAX_FILTERED: usize = 5;
const MAX_SAMPLED: usize = 3;

const ANY_HEX: &str = r"(?i)\b(?:0x)?([0-9a-f]{8,16})\b";
const SIZE_WORDS: [&str; 6] = ["largest", "biggest", "large", "mb", "gb", "kb"];

/// What a placeholder stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    Address,
    MethodTable,
    Object,
    Thread,
    Module,
    Value,
}

impl PlaceholderKind {
    /// Kind named by the text between the angle brackets, if any.
    fn classify(inner: &str) -> Option<Self> {
        let lower = inner.to_ascii_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        if lower.contains("addr") {
            Some(Self::Address)
        } else if words.contains(&"mt")
            || lower.contains("methodtable")
            || lower.contains("method table")
        {
            Some(Self::MethodTable)
        } else if lower.contains("object") {
            Some(Self::Object)
        } else if lower.contains("thread") || lower.contains("tid") {
            Some(Self::Thread)
        } else if lower.contains("module") {
            Some(Self::Module)
        } else if lower.contains("val") {
            Some(Self::Value)
        } else {
            None
        }
    }

    /// Patterns tried in order; group 1 holds the value.
    fn extractors(self) -> &'static [Regex] {
        static ADDRESS: OnceLock<Vec<Regex>> = OnceLock::new();
        static METHOD_TABLE: OnceLock<Vec<Regex>> = OnceLock::new();
        static OBJECT: OnceLock<Vec<Regex>> = OnceLock::new();
        static THREAD: OnceLock<Vec<Regex>> = OnceLock::new();

        match self {
            Self::Address => ADDRESS.get_or_init(|| compile(&[ANY_HEX])),
            Self::MethodTable => METHOD_TABLE.get_or_init(|| {
                compile(&[
                    // !dumpheap -stat rows: MT Count TotalSize Class
                    r"(?im)^([0-9a-f]{8,16})\s+\d+\s+\d+",
                    r"(?i)MT:\s*(?:0x)?([0-9a-f]{8,16})",
                    ANY_HEX,
                ])
            }),
            Self::Object => OBJECT.get_or_init(|| {
                compile(&[
                    r"(?i)(?:Object|Address):\s*(?:0x)?([0-9a-f]{8,16})",
                    // !dumpheap -short prints one address per line
                    r"(?im)^(?:0x)?([0-9a-f]{8,16})$",
                    ANY_HEX,
                ])
            }),
            Self::Thread => THREAD.get_or_init(|| {
                compile(&[r"(?i)(?:Thread|TID):\s*(\d+)", r"(?m)^\s*(\d+)\s+\d+\s+"])
            }),
            Self::Module | Self::Value => &[],
        }
    }

    fn is_hex(self) -> bool {
        matches!(self, Self::Address | Self::MethodTable | Self::Object)
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// One `<...>` token found in a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Token as written, brackets included.
    pub text: String,
    pub kind: PlaceholderKind,
    /// Token text without brackets and kind prefix, e.g. `largest_object`.
    pub hint: String,
}

impl Placeholder {
    fn parse(token: &str) -> Option<Self> {
        let inner = token.trim_start_matches('<').trim_end_matches('>');
        let kind = PlaceholderKind::classify(inner)?;
        Some(Self {
            text: token.to_string(),
            kind,
            hint: context_hint(inner),
        })
    }
}

/// Angle-bracket tokens in `command`, in order of appearance.
fn tokens(command: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = command;
    while let Some(start) = rest.find('<') {
        let tail = &rest[start + 1..];
        let Some(end) = tail.find(|c: char| c == '<' || c == '>') else {
            break;
        };
        if end > 0 && tail[end..].starts_with('>') {
            found.push(&rest[start..start + end + 2]);
            rest = &tail[end + 1..];
        } else {
            rest = &tail[end..];
        }
    }
    found
}

fn context_hint(inner: &str) -> String {
    const PREFIXES: [&str; 8] = [
        "address_",
        "addr_",
        "methodtable_",
        "mt_",
        "object_",
        "thread_",
        "module_",
        "value_",
    ];
    let mut hint = inner;
    if let Some(prefix) = PREFIXES.iter().find(|p| starts_with_ignore_case(hint, p)) {
        hint = &hint[prefix.len()..];
    }
    if starts_with_ignore_case(hint, "of_") {
        hint = &hint[3..];
    }
    hint.to_string()
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Whether `command` carries any recognised placeholder.
pub fn has_placeholders(command: &str) -> bool {
    !find_placeholders(command).is_empty()
}

/// Recognised placeholders, de-duplicated by token text.
pub fn find_placeholders(command: &str) -> Vec<Placeholder> {
    let mut found: Vec<Placeholder> = Vec::new();
    for placeholder in tokens(command).into_iter().filter_map(Placeholder::parse) {
        if !found.iter().any(|p| p.text == placeholder.text) {
            found.push(placeholder);
        }
    }
    found
}

/// Candidate values for `placeholder`, drawn from `sources` (newest first).
pub fn candidates(placeholder: &Placeholder, sources: &[&str]) -> Vec<String> {
    let extractors = placeholder.kind.extractors();
    let mut values: Vec<String> = Vec::new();

    for text in sources {
        for pattern in extractors {
            for captures in pattern.captures_iter(text) {
                let Some(raw) = captures.get(1).map(|m| m.as_str().trim()) else {
                    continue;
                };
                if raw.is_empty() {
                    continue;
                }
                let value = if placeholder.kind.is_hex() {
                    format!("0x{}", raw.to_ascii_lowercase())
                } else {
                    raw.to_string()
                };
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }

        if !values.is_empty() && !placeholder.hint.is_empty() {
            let filtered = filter_by_hint(&values, &placeholder.hint, text);
            if !filtered.is_empty() {
                return filtered;
            }
        }
        if values.len() >= MAX_CANDIDATES {
            values.truncate(MAX_CANDIDATES);
            return values;
        }
    }
    values
}

/// First line of `text` mentioning `value` (with or without its `0x`).
fn line_with<'t>(text: &'t str, value: &str) -> Option<&'t str> {
    let bare = value.trim_start_matches("0x");
    text.lines().find(|line| line.to_ascii_lowercase().contains(bare))
}

fn filter_by_hint(values: &[String], hint: &str, text: &str) -> Vec<String> {
    // A capitalised segment names a type, e.g. `sample_SqlConnection`.
    let type_name = hint
        .split(|c: char| c == '_' || c.is_whitespace())
        .find(|w| w.len() > 1 && w.starts_with(|c: char| c.is_ascii_uppercase()));
    if let Some(type_name) = type_name {
        let filtered: Vec<String> = values
            .iter()
            .filter(|v| {
                let bare = v.trim_start_matches("0x");
                text.lines()
                    .any(|line| line.contains(type_name) && line.to_ascii_lowercase().contains(bare))
            })
            .take(MAX_FILTERED)
            .cloned()
            .collect();
        if !filtered.is_empty() {
            return filtered;
        }
    }

    let lower = hint.to_ascii_lowercase();
    if SIZE_WORDS.iter().any(|w| lower.contains(w)) {
        let mut scored: Vec<(&String, u64)> = values
            .iter()
            .filter_map(|v| {
                let line = line_with(text, v)?;
                let score = line
                    .split(|c: char| !c.is_ascii_alphanumeric())
                    .filter(|w| !w.is_empty() && w.chars().all(|c| c.is_ascii_digit()))
                    .filter_map(|w| w.parse::<u64>().ok())
                    .max()?;
                Some((v, score))
            })
            .collect();
        if !scored.is_empty() {
            scored.sort_by(|a, b| b.1.cmp(&a.1));
            return scored.into_iter().take(MAX_FILTERED).map(|(v, _)| v.clone()).collect();
        }
    }

    if lower.contains("first") || lower.contains("sample") {
        return values.iter().take(MAX_SAMPLED).cloned().collect();
    }
    Vec::new()
}

/// Replace every recognised placeholder in `command` with its first
/// candidate. On failure returns the tokens that found no value.
pub fn resolve(command: &str, sources: &[&str]) -> Result<String, Vec<String>> {
    let mut resolved = command.to_string();
    let mut unresolved = Vec::new();

    for placeholder in find_placeholders(command) {
        match candidates(&placeholder, sources).into_iter().next() {
            Some(value) => resolved = resolved.replace(&placeholder.text, &value),
            None => unresolved.push(placeholder.text),
        }
    }

    if unresolved.is_empty() {
        Ok(resolved)
    } else {
        Err(unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP_STAT: &str = "Statistics:\n\
              MT    Count    TotalSize Class Name\n\
        00007ff8a1b20010        3           72 System.Object\n\
        00007ff8a1b20020      120         9600 Contoso.Orders.Line\n\
        00007ff8a1b20030        2      6291456 System.Byte[]\n\
        Total 125 objects";

    #[test]
    fn test_find_placeholders_classifies_tokens() {
        let found = find_placeholders("!gcroot <address_of_largest_object>");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, PlaceholderKind::Address);
        assert_eq!(found[0].hint, "largest_object");

        let found = find_placeholders("!dumpheap -mt <MT_of_Contoso.Orders.Line>");
        assert_eq!(found[0].kind, PlaceholderKind::MethodTable);
        assert_eq!(found[0].hint, "Contoso.Orders.Line");

        assert_eq!(find_placeholders("~<thread_id>s")[0].kind, PlaceholderKind::Thread);
        assert_eq!(find_placeholders("!do <sample_object>")[0].kind, PlaceholderKind::Object);
        assert_eq!(find_placeholders("lmv m <module_name>")[0].kind, PlaceholderKind::Module);
    }

    #[test]
    fn test_commands_without_placeholders() {
        assert!(!has_placeholders("!dumpheap -stat"));
        assert!(!has_placeholders("!do <>"));
        assert!(!has_placeholders("dx <foo>"));
        assert_eq!(resolve("!threads", &[HEAP_STAT]), Ok("!threads".to_string()));
    }

    #[test]
    fn test_method_table_by_type_name() {
        let resolved = resolve("!dumpheap -mt <MT_of_Contoso.Orders.Line>", &[HEAP_STAT]);
        assert_eq!(resolved, Ok("!dumpheap -mt 0x00007ff8a1b20020".to_string()));
    }

    #[test]
    fn test_largest_hint_ranks_by_size() {
        let resolved = resolve("!dumpheap -mt <mt_of_largest_type>", &[HEAP_STAT]);
        assert_eq!(resolved, Ok("!dumpheap -mt 0x00007ff8a1b20030".to_string()));
    }

    #[test]
    fn test_newest_source_wins() {
        let older = "Object: 000001f2a3b40000";
        let newer = "Object: 0x000001f2a3b4ffff";
        let resolved = resolve("!gcroot <object>", &[newer, older]);
        assert_eq!(resolved, Ok("!gcroot 0x000001f2a3b4ffff".to_string()));
    }

    #[test]
    fn test_thread_ids_are_decimal() {
        let threads = "ThreadCount: 4\n   5    2 1a2c 000001f2a3b4c5d6  2a020 Preemptive";
        assert_eq!(resolve("~<thread_id>s", &[threads]), Ok("~5s".to_string()));
        assert_eq!(resolve("~<tid>s", &["Owning Thread: 7"]), Ok("~7s".to_string()));
    }

    #[test]
    fn test_repeated_token_replaced_everywhere() {
        let resolved = resolve("!do <object_addr>; !gcroot <object_addr>", &["Address: 1234abcd"]);
        assert_eq!(resolved, Ok("!do 0x1234abcd; !gcroot 0x1234abcd".to_string()));
    }

    #[test]
    fn test_unresolved_placeholders_reported() {
        let err = resolve("lmv m <module_name>", &[HEAP_STAT]).unwrap_err();
        assert_eq!(err, vec!["<module_name>"]);

        let err = resolve("!gcroot <address_of_leak>", &["no values here"]).unwrap_err();
        assert_eq!(err, vec!["<address_of_leak>"]);
    }
}
