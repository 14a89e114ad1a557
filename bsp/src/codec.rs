//! Content-Length framing for BSP traffic.
//!
//! Every frame on the wire is `Content-Length: N\r\n\r\n{json}`, the same
//! base-protocol framing LSP uses. [`MessageReader`] and [`MessageWriter`]
//! turn a byte stream into whole `serde_json::Value` frames and back.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Frame size cap. Source and dependency listings for large workspaces run
/// to megabytes, so this is far above anything a sane server sends.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io failure on the connection stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended inside a header block")]
    TruncatedHeaders,
    #[error("frame headers carry no Content-Length")]
    MissingContentLength,
    #[error("Content-Length `{0}` is not a byte count")]
    InvalidContentLength(String),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte cap")]
    Oversized(usize),
    #[error("frame body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads framed messages from the server's stdout.
pub struct MessageReader<R> {
    input: BufReader<R>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
        }
    }

    /// Next frame, or `Ok(None)` once the stream is cleanly closed.
    pub async fn read_message(&mut self) -> Result<Option<Value>, CodecError> {
        let Some(declared) = self.read_content_length().await? else {
            return Ok(None);
        };
        if declared > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(declared));
        }
        let mut body = vec![0u8; declared];
        self.input.read_exact(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Consumes one header block. `Ok(None)` only for EOF on a frame
    /// boundary; EOF after any header byte means the peer died mid-frame.
    async fn read_content_length(&mut self) -> Result<Option<usize>, CodecError> {
        let mut declared: Option<usize> = None;
        let mut line = String::new();
        let mut in_frame = false;

        loop {
            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                if in_frame {
                    return Err(CodecError::TruncatedHeaders);
                }
                return Ok(None);
            }
            in_frame = true;

            let header = line.trim();
            if header.is_empty() {
                // Blank separator line closes the header block.
                break;
            }
            let Some((name, value)) = header.split_once(':') else {
                // Treat junk lines like unknown headers and skip them.
                continue;
            };
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                declared = Some(
                    value
                        .parse()
                        .map_err(|_| CodecError::InvalidContentLength(value.to_owned()))?,
                );
            }
        }

        match declared {
            Some(len) => Ok(Some(len)),
            None => Err(CodecError::MissingContentLength),
        }
    }
}

/// Writes framed messages to the server's stdin.
pub struct MessageWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    /// Serializes one frame and flushes it.
    pub async fn write_message(&mut self, message: &Value) -> Result<(), CodecError> {
        let body = serde_json::to_vec(message)?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);
        self.output.write_all(&frame).await?;
        self.output.flush().await?;
        Ok(())
    }

    /// Flushes and closes the underlying stream. The peer sees EOF.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.output.shutdown().await?;
        Ok(())
    }
}
