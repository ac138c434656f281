//! Compiler worker message protocol.
//!
//! The host and the worker exchange newline-delimited JSON frames over the
//! worker's stdin/stdout. Every frame is `{id, type, payload}`; byte
//! payloads are base64-encoded so a frame never spans lines.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// One protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    /// Request id; replies carry the id of the request they answer
    pub id: u64,
    /// Message kind and payload
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Message kinds exchanged with the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum MessageBody {
    /// Host -> worker: compile a batch of sources against references.
    Compile(CompilePayload),
    /// Worker -> host: compiled bytes (absent on failure) plus raw compiler
    /// output for diagnostic scraping.
    Assembly(AssemblyPayload),
    /// Worker -> host: fatal worker-side message.
    Error(ErrorPayload),
    /// Worker -> host: handshake; the worker accepts requests from here on.
    Ready,
    /// Host -> worker: graceful shutdown request.
    Exit,
}

impl WorkerMessage {
    /// Short kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::Compile(_) => "compile",
            MessageBody::Assembly(_) => "assembly",
            MessageBody::Error(_) => "error",
            MessageBody::Ready => "ready",
            MessageBody::Exit => "exit",
        }
    }
}

/// Compile request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilePayload {
    /// Desired output name for the produced binary
    pub name: String,
    /// Source files to compile together
    pub sources: Vec<SourceFile>,
    /// Reference files shared by the whole batch
    #[serde(default)]
    pub references: Vec<ReferenceFile>,
}

/// One source file inside a compile request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    /// File name (used by the worker for diagnostics)
    pub name: String,
    /// Base64-encoded source bytes
    pub data: String,
}

impl SourceFile {
    /// Encode source bytes for transport.
    pub fn new(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self { name: name.into(), data: BASE64.encode(bytes) }
    }

    /// Decode the source bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// One reference file inside a compile request: either inline bytes (an
/// already-compiled dependency) or an on-disk path (a shared library).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceFile {
    /// Reference name
    pub name: String,
    /// Base64-encoded bytes, for in-memory references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// On-disk path, for file references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl ReferenceFile {
    /// Reference carried as inline bytes.
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self { name: name.into(), data: Some(BASE64.encode(bytes)), path: None }
    }

    /// Reference resolved to an on-disk file.
    pub fn from_path(name: impl Into<String>, path: PathBuf) -> Self {
        Self { name: name.into(), data: None, path: Some(path) }
    }
}

/// Assembly reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyPayload {
    /// Base64-encoded compiled bytes; absent when compilation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Raw compiler stdout, scraped for per-unit diagnostics
    #[serde(default)]
    pub output: String,
}

impl AssemblyPayload {
    /// Decode the compiled bytes, if present.
    pub fn bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.data.as_deref().map(|d| BASE64.decode(d)).transpose()
    }
}

/// Fatal worker error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable message
    pub message: String,
}

/// Write one frame followed by a newline.
pub async fn write_message<W>(writer: &mut W, message: &WorkerMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Read the next frame. Returns `None` on a clean end of stream.
pub async fn read_message<R>(
    reader: &mut BufReader<R>,
) -> std::io::Result<Option<WorkerMessage>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
    }
}
