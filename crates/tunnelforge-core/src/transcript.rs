//! Session transcript records.
//!
//! A transcript is an append-only file with one JSON value per line. The first
//! line is a header object, every following line is an event array:
//!
//! ```text
//! {"version":2,"width":80,"height":24}
//! [0.25,"o","hello\r\n"]
//! [1.5,"r","100x30"]
//! ["exit",0,"session-id"]
//! ```
//!
//! Lines are decoded once into [`TranscriptRecord`]; nothing downstream looks
//! at raw array shapes again.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Transcript header (first line of the file).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptHeader {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    /// Any other header fields (timestamp, env, title, ...), preserved on replay.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TranscriptHeader {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            version: 2,
            width,
            height,
            extra: serde_json::Map::new(),
        }
    }

    /// Copy of this header reporting different dimensions.
    pub fn with_size(&self, cols: u16, rows: u16) -> Self {
        Self {
            width: cols,
            height: rows,
            ..self.clone()
        }
    }
}

/// One decoded transcript line.
#[derive(Clone, Debug, PartialEq)]
pub enum TranscriptRecord {
    Header(TranscriptHeader),
    Output { time: f64, data: String },
    Input { time: f64, data: String },
    Resize { time: f64, cols: u16, rows: u16 },
    Exit { code: i64, rest: Vec<Value> },
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized record: {0}")]
    Shape(String),
}

fn resize_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)x(\d+)$").expect("BUG: resize regex must compile"))
}

/// Parse a `COLSxROWS` resize payload.
pub fn parse_dimensions(payload: &str) -> Option<(u16, u16)> {
    let caps = resize_regex().captures(payload)?;
    let cols = caps[1].parse().ok()?;
    let rows = caps[2].parse().ok()?;
    Some((cols, rows))
}

/// Render a timestamp the way the writer does: whole seconds as integers.
fn time_value(time: f64) -> Value {
    if time.fract() == 0.0 && time.abs() < i64::MAX as f64 {
        Value::from(time as i64)
    } else {
        serde_json::Number::from_f64(time)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(0))
    }
}

impl TranscriptRecord {
    /// Decode one transcript line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        match value {
            Value::Object(ref map)
                if map.contains_key("version")
                    && map.contains_key("width")
                    && map.contains_key("height") =>
            {
                let header: TranscriptHeader = serde_json::from_value(value)?;
                Ok(Self::Header(header))
            }
            Value::Array(items) => Self::from_array(items),
            other => Err(ParseError::Shape(truncate(&other.to_string()))),
        }
    }

    fn from_array(mut items: Vec<Value>) -> Result<Self, ParseError> {
        if items.first().and_then(Value::as_str) == Some("exit") {
            let code = items
                .get(1)
                .and_then(Value::as_i64)
                .ok_or_else(|| ParseError::Shape("exit record without code".into()))?;
            let rest = items.split_off(2.min(items.len()));
            return Ok(Self::Exit { code, rest });
        }

        if items.len() < 3 {
            return Err(ParseError::Shape(format!("event with {} fields", items.len())));
        }
        let time = items[0]
            .as_f64()
            .ok_or_else(|| ParseError::Shape("event timestamp is not a number".into()))?;
        let kind = items[1]
            .as_str()
            .ok_or_else(|| ParseError::Shape("event kind is not a string".into()))?;
        let data = items[2]
            .as_str()
            .ok_or_else(|| ParseError::Shape("event payload is not a string".into()))?;

        match kind {
            "o" => Ok(Self::Output {
                time,
                data: data.to_string(),
            }),
            "i" => Ok(Self::Input {
                time,
                data: data.to_string(),
            }),
            "r" => {
                let (cols, rows) = parse_dimensions(data)
                    .ok_or_else(|| ParseError::Shape(format!("bad resize payload {:?}", data)))?;
                Ok(Self::Resize { time, cols, rows })
            }
            other => Err(ParseError::Shape(format!("unknown event kind {:?}", other))),
        }
    }

    /// Whether this record ends the session.
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }

    /// Copy of this event with its timestamp replaced. Headers and exits are
    /// returned unchanged.
    pub fn with_time(&self, new_time: f64) -> Self {
        match self {
            Self::Output { data, .. } => Self::Output {
                time: new_time,
                data: data.clone(),
            },
            Self::Input { data, .. } => Self::Input {
                time: new_time,
                data: data.clone(),
            },
            Self::Resize { cols, rows, .. } => Self::Resize {
                time: new_time,
                cols: *cols,
                rows: *rows,
            },
            other => other.clone(),
        }
    }

    /// Encode back into the transcript line format.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Header(header) => {
                serde_json::to_value(header).expect("BUG: TranscriptHeader must serialize")
            }
            Self::Output { time, data } => Value::Array(vec![
                time_value(*time),
                Value::from("o"),
                Value::from(data.as_str()),
            ]),
            Self::Input { time, data } => Value::Array(vec![
                time_value(*time),
                Value::from("i"),
                Value::from(data.as_str()),
            ]),
            Self::Resize { time, cols, rows } => Value::Array(vec![
                time_value(*time),
                Value::from("r"),
                Value::from(format!("{}x{}", cols, rows)),
            ]),
            Self::Exit { code, rest } => {
                let mut items = vec![Value::from("exit"), Value::from(*code)];
                items.extend(rest.iter().cloned());
                Value::Array(items)
            }
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Shorten a line for log output.
pub fn truncate(s: &str) -> String {
    const MAX: usize = 100;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...({} bytes total)", &s[..end], s.len())
}
