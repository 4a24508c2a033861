//! Locating the command block inside free-text agent output.
//!
//! Marker conventions drift with model phrasing, so extraction sits behind
//! [`CommandExtractor`] and the scheduler never depends on a concrete format.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Marker line that introduces the command block.
pub const COMMAND_MARKER: &str = "MEMORY_COMMANDS:";

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t>*_`#-]*MEMORY_COMMANDS:[*_`]*").unwrap());

/// What an extractor found in the agent's final text.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// No block present.
    Absent,
    /// More than one marker; the block is ambiguous and ignored.
    Ambiguous { markers: usize },
    /// A marker was found but no JSON array followed it.
    Malformed { error: String },
    /// Exactly one block with its raw command objects.
    Block(Vec<Value>),
}

impl Extraction {
    /// Raw commands, empty unless exactly one well-formed block was found.
    pub fn commands(&self) -> &[Value] {
        match self {
            Self::Block(items) => items,
            _ => &[],
        }
    }
}

/// Strategy for turning raw agent text into raw command objects.
pub trait CommandExtractor {
    fn extract(&self, text: &str) -> Extraction;
}

/// Default extractor: a single `MEMORY_COMMANDS:` marker at the start of a
/// line (markdown decoration allowed), followed by a JSON array. The array
/// may start on the same line or a later one and may sit in a code fence.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerExtractor;

impl CommandExtractor for MarkerExtractor {
    fn extract(&self, text: &str) -> Extraction {
        let markers: Vec<_> = MARKER_RE.find_iter(text).collect();
        let marker = match markers.as_slice() {
            [] => return Extraction::Absent,
            [only] => only,
            many => {
                return Extraction::Ambiguous {
                    markers: many.len(),
                };
            }
        };

        let rest = skip_fence(&text[marker.end()..]);
        if !rest.starts_with('[') {
            return Extraction::Malformed {
                error: "expected a JSON array after the marker".to_string(),
            };
        }

        // Stream-parse so trailing prose after the array is ignored.
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Array(items))) => Extraction::Block(items),
            Some(Ok(_)) => Extraction::Malformed {
                error: "expected a JSON array after the marker".to_string(),
            },
            Some(Err(err)) => Extraction::Malformed {
                error: err.to_string(),
            },
            None => Extraction::Malformed {
                error: "empty command block".to_string(),
            },
        }
    }
}

/// Trim leading whitespace and an optional opening code fence (```json).
fn skip_fence(text: &str) -> &str {
    let trimmed = text.trim_start();
    let Some(after) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    body.trim_start()
}
