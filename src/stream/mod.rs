//! Line-delimited JSON record stream from an agent subprocess.
//!
//! The agent emits one self-contained JSON record per stdout line. This
//! module splits the byte stream on line boundaries, parses each line, and
//! hands records to the caller in arrival order. A malformed line never
//! aborts the stream: it becomes a synthetic `Error` record carrying the
//! raw text, and parsing continues with the next line.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::watch;
use tokio::time::Instant;

/// Classification of one record from the agent's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Thinking,
    Action,
    Output,
    Result,
    Error,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Action => "action",
            Self::Output => "output",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

/// One parsed record from agent stdout.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub kind: RecordKind,
    pub content: String,
    pub payload: Option<Value>,
}

impl RunRecord {
    /// Records that end a run's story: the agent's final result, or an
    /// error (agent-reported, parse-synthesized, or runner-synthesized).
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, RecordKind::Result | RecordKind::Error)
    }

    /// Synthetic record for a line that was not valid JSON.
    pub fn parse_error(line: &str, message: String) -> Self {
        Self {
            kind: RecordKind::Error,
            content: line.to_string(),
            payload: Some(serde_json::json!({ "parseError": message })),
        }
    }

    /// Synthetic terminal record for a runner-level failure.
    pub fn terminal_error(message: String) -> Self {
        Self {
            kind: RecordKind::Error,
            content: message,
            payload: None,
        }
    }
}

/// Parse a single stdout line into a record.
///
/// Rules, in order:
/// 1. Not valid JSON -> synthetic `Error` record with the raw line.
/// 2. JSON with `"type": "thinking"` -> `Thinking`, content from `content`.
/// 3. `"type": "tool_use"|"tool_result"|"action"` -> `Action`, content is a
///    short `tool file` summary.
/// 4. `"type": "result"` -> `Result`, content from `result`.
/// 5. `"type": "error"` -> `Error`, content from `error`/`message`.
/// 6. Any other JSON, typed or not -> `Output` with the payload preserved.
pub fn parse_line(line: &str) -> RunRecord {
    let trimmed = line.trim();

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => return RunRecord::parse_error(trimmed, format!("not valid JSON: {}", e)),
    };

    let kind_str = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let (kind, content) = match kind_str {
        "thinking" => (
            RecordKind::Thinking,
            value
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string(),
        ),
        "tool_use" | "tool_result" | "action" => {
            let summary = format!(
                "{} {}",
                value.get("tool").and_then(|t| t.as_str()).unwrap_or(""),
                value.get("file").and_then(|f| f.as_str()).unwrap_or(""),
            );
            (RecordKind::Action, summary.trim().to_string())
        }
        "result" => (
            RecordKind::Result,
            value
                .get("result")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string(),
        ),
        "error" => {
            let message = value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or(trimmed);
            (RecordKind::Error, message.to_string())
        }
        _ => (RecordKind::Output, trimmed.to_string()),
    };

    RunRecord {
        kind,
        content,
        payload: Some(value),
    }
}

/// Lazy, non-restartable record sequence over an agent's stdout.
///
/// Every line received — blank, malformed, or valid — stores "now" into the
/// shared activity channel so the runner's watchdog can observe silence.
pub struct RecordStream<R> {
    lines: Lines<BufReader<R>>,
    activity: watch::Sender<Instant>,
}

impl<R: AsyncRead + Unpin> RecordStream<R> {
    pub fn new(reader: R, activity: watch::Sender<Instant>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            activity,
        }
    }

    /// Next parsed record, skipping blank lines.
    ///
    /// `Ok(None)` once the underlying stream closes. A read error is
    /// terminal and propagates — distinct from per-line parse failures,
    /// which yield records.
    pub async fn next_record(&mut self) -> std::io::Result<Option<RunRecord>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) => {
                    let _ = self.activity.send(Instant::now());
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(parse_line(&line)));
                }
            }
        }
    }
}
