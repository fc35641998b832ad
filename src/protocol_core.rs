//! Message types and length-prefixed JSON framing
//!
//! Generic over any async byte stream so the server, the client, and tests
//! (via `tokio::io::duplex`) share one implementation.

use crate::error::{Result, SyncError};
use crate::protocol::{msg, res, LEN_PREFIX, MAX_FRAME_SIZE};
use crate::snapshot::{normalize_separators, FileEntry, Snapshot};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Client → server command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMsg {
    pub msg_type: u32,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub dst_dir: String,
    #[serde(default)]
    pub sync_info: Option<FileEntry>,
}

impl CommandMsg {
    pub fn token(token: &str) -> Self {
        Self {
            msg_type: msg::TOKEN,
            token: token.to_string(),
            dst_dir: String::new(),
            sync_info: None,
        }
    }

    pub fn make_cache(dst_dir: &str) -> Self {
        Self {
            msg_type: msg::MAKECACHE,
            token: String::new(),
            dst_dir: dst_dir.to_string(),
            sync_info: None,
        }
    }

    pub fn sync(dst_dir: &str, entry: FileEntry) -> Self {
        Self {
            msg_type: msg::SYNC,
            token: String::new(),
            dst_dir: dst_dir.to_string(),
            sync_info: Some(entry),
        }
    }
}

/// Server → client response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMsg {
    pub msg_type: u32,
    #[serde(default)]
    pub res_code: i32,
    #[serde(default)]
    pub err: Option<String>,
    #[serde(default)]
    pub err_code: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub part_size: i64,
    #[serde(default)]
    pub file_infos: Option<Snapshot>,
}

impl ResponseMsg {
    pub fn success(msg_type: u32) -> Self {
        Self {
            msg_type,
            res_code: res::SUCCESS,
            err: None,
            err_code: None,
            offset: 0,
            part_size: 0,
            file_infos: None,
        }
    }

    pub fn failure(msg_type: u32, code: &str, message: impl Into<String>) -> Self {
        Self {
            res_code: res::FAILURE,
            err: Some(message.into()),
            err_code: Some(code.to_string()),
            ..Self::success(msg_type)
        }
    }

    pub fn file_part(offset: i64, part_size: i64) -> Self {
        Self {
            offset,
            part_size,
            ..Self::success(msg::FILEPART)
        }
    }

    pub fn with_file_infos(mut self, snapshot: Snapshot) -> Self {
        self.file_infos = Some(snapshot);
        self
    }

    pub fn is_success(&self) -> bool {
        self.res_code == res::SUCCESS
    }

    /// Human-readable failure text for logs and errors
    pub fn describe_error(&self) -> String {
        match (&self.err_code, &self.err) {
            (Some(c), Some(m)) => format!("{c}: {m}"),
            (None, Some(m)) => m.clone(),
            (Some(c), None) => c.clone(),
            (None, None) => format!("result code {}", self.res_code),
        }
    }
}

/// Validate frame body size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "frame body too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build the 4-byte big-endian length prefix
pub fn build_len_prefix(body_len: usize) -> Result<[u8; LEN_PREFIX]> {
    validate_frame_size(body_len)?;
    Ok((body_len as u32).to_be_bytes())
}

/// Parse a length prefix into a validated body length
pub fn parse_len_prefix(prefix: &[u8; LEN_PREFIX]) -> Result<usize> {
    let len = u32::from_be_bytes(*prefix) as usize;
    validate_frame_size(len)?;
    Ok(len)
}

/// Write one frame: the length prefix, then the body, as two ordered writes.
pub async fn write_frame<W>(stream: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let prefix = build_len_prefix(body.len())?;
    stream
        .write_all(&prefix)
        .await
        .map_err(|e| SyncError::transport("write frame length", e))?;
    stream
        .write_all(body)
        .await
        .map_err(|e| SyncError::transport("write frame body", e))?;
    stream
        .flush()
        .await
        .map_err(|e| SyncError::transport("flush frame", e))?;
    Ok(())
}

/// Read one frame body. `read_exact` loops over short reads until the
/// declared length is consumed.
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| SyncError::transport("read frame length", e))?;
    let len = parse_len_prefix(&prefix)?;
    let mut body = vec![0u8; len];
    if len > 0 {
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| SyncError::transport("read frame body", e))?;
    }
    Ok(body)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SyncError::Protocol(format!("encode: {}", e)))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| SyncError::Protocol(format!("decode: {}", e)))
}

pub async fn write_command<W>(stream: &mut W, cmd: &CommandMsg) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = encode(cmd)?;
    write_frame(stream, &body).await
}

/// Read a command; `dst_dir` is converted to the local separator convention.
pub async fn read_command<R>(stream: &mut R) -> Result<CommandMsg>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(stream).await?;
    let mut cmd: CommandMsg = decode(&body)?;
    if !cmd.dst_dir.is_empty() {
        cmd.dst_dir = normalize_separators(&cmd.dst_dir);
    }
    Ok(cmd)
}

pub async fn write_response<W>(stream: &mut W, resp: &ResponseMsg) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = encode(resp)?;
    write_frame(stream, &body).await
}

pub async fn read_response<R>(stream: &mut R) -> Result<ResponseMsg>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(stream).await?;
    decode(&body)
}
