use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::ReplError;

/// A command sent to the Lean REPL.
///
/// The REPL expects `{"cmd": "<source>", "env": <id>}` followed by a blank
/// line. `env` is omitted for commands that start from a fresh environment
/// (such as the header itself).
#[derive(Debug, Clone, Serialize)]
pub struct ReplCommand {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<u64>,
}

impl ReplCommand {
    pub fn new(cmd: impl Into<String>, env: Option<u64>) -> Self {
        Self {
            cmd: cmd.into(),
            env,
        }
    }

    /// Serialize this command to a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// --- Response types ---

/// Line/column position in the submitted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pos {
    pub line: u64,
    pub column: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    #[serde(alias = "information")]
    Info,
}

/// A diagnostic reported by Lean.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub severity: Severity,
    pub pos: Pos,
    #[serde(default)]
    pub end_pos: Option<Pos>,
    pub data: String,
}

/// A `sorry` left in the submitted source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sorry {
    pub pos: Pos,
    #[serde(default)]
    pub end_pos: Option<Pos>,
    pub goal: String,
    #[serde(default)]
    pub proof_state: Option<u64>,
}

/// A response read from the REPL.
///
/// Successful commands carry `env` plus any diagnostics; REPL-level failures
/// (unknown environment, malformed command) carry only `message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sorries: Vec<Sorry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReplResponse {
    /// Parse one JSON response frame.
    pub fn parse(json: &str) -> Result<Self, ReplError> {
        serde_json::from_str(json)
            .map_err(|e| ReplError::Protocol(format!("Invalid JSON: {e}. Raw: {json}")))
    }

    /// Whether Lean reported at least one error-severity diagnostic.
    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(|m| m.severity == Severity::Error)
    }

    /// The first failure description: the REPL message, else the first error.
    pub fn first_error(&self) -> Option<&str> {
        self.message.as_deref().or_else(|| {
            self.messages
                .iter()
                .find(|m| m.severity == Severity::Error)
                .map(|m| m.data.as_str())
        })
    }
}

/// Write one JSON command followed by the blank line the REPL waits for.
pub async fn write_frame<W>(writer: &mut W, json: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n\n").await?;
    writer.flush().await
}

/// Read one response frame: everything up to the next blank line.
///
/// Blank lines before the payload are skipped. Returns `None` if the stream
/// ends before a complete frame is read.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame));
        }
        frame.push_str(&line);
    }
}
