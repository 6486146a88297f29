use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{ChannelError, ChannelResult};

const UPLOAD_CHUNK_SIZE: usize = 1024;
const MAX_UPLOAD_SIZE: u64 = 10 * 1024 * 1024;

/// A spawned remote shell, torn down after `idle_timeout` of inactivity and
/// respawned on the next `dn` frame, per spec 4.1 console topic. Output is
/// forwarded into `out_tx` as it is produced so the caller can push it as
/// `up {data}` frames without polling this struct directly.
pub struct RemoteShell {
    child: Child,
    stdin: tokio::process::ChildStdin,
    idle_timeout: Duration,
}

impl RemoteShell {
    pub fn spawn(idle_timeout: Duration, out_tx: mpsc::Sender<Vec<u8>>) -> ChannelResult<Self> {
        let mut child = Command::new("sh")
            .arg("-i")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let mut stdout = child.stdout.take().expect("stdout was piped");

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            idle_timeout,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub async fn write(&mut self, data: &[u8]) -> ChannelResult<()> {
        self.stdin
            .write_all(data)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))
    }

    pub async fn terminate(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Streams a local file in 1 KiB chunks over the console topic, bracketed
/// by `file-data/start` / `file-data/stop`, per spec 4.7. Rejects anything
/// over 10 MiB before starting.
pub struct Uploader {
    pub filename: String,
}

/// One 1 KiB chunk ready to push as `file-data {filename, chunk, data}`.
pub struct UploadChunk {
    pub chunk: u64,
    pub data_base64: String,
}

impl Uploader {
    pub async fn prepare(path: &Path) -> ChannelResult<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        if metadata.len() > MAX_UPLOAD_SIZE {
            return Err(ChannelError::Connection(format!(
                "file too large: {} bytes (max {MAX_UPLOAD_SIZE})",
                metadata.len()
            )));
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ChannelError::Connection("invalid filename".into()))?
            .to_string();
        Ok(Self { filename })
    }

    /// Reads `path` and emits one `UploadChunk` per 1 KiB via `on_chunk`.
    pub async fn stream(
        path: &Path,
        mut on_chunk: impl FnMut(UploadChunk),
    ) -> ChannelResult<()> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        let mut index = 0u64;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;
            if n == 0 {
                break;
            }
            on_chunk(UploadChunk {
                chunk: index,
                data_base64: BASE64.encode(&buf[..n]),
            });
            index += 1;
        }
        Ok(())
    }
}

/// The inbound mirror: `/start` truncates or creates the destination file,
/// `/data` appends decoded chunks, `/stop` finalizes.
pub struct Downloader {
    file: Option<tokio::fs::File>,
    path: PathBuf,
}

impl Downloader {
    pub fn new(path: PathBuf) -> Self {
        Self { file: None, path }
    }

    pub async fn start(&mut self) -> ChannelResult<()> {
        let file = tokio::fs::File::create(&self.path)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        self.file = Some(file);
        info!(path = %self.path.display(), "console file transfer started");
        Ok(())
    }

    pub async fn append(&mut self, data_base64: &str) -> ChannelResult<()> {
        let data = BASE64
            .decode(data_base64)
            .map_err(|e| ChannelError::MessageParsing(e.to_string()))?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ChannelError::Connection("file-data before /start".into()))?;
        file.write_all(&data)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))
    }

    pub async fn stop(&mut self) -> ChannelResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| ChannelError::Connection(e.to_string()))?;
        } else {
            warn!(path = %self.path.display(), "file-data/stop with no active transfer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn rejects_files_over_ten_mebibytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let file = tokio::fs::File::create(&path).await.unwrap();
        file.set_len(MAX_UPLOAD_SIZE + 1).await.unwrap();
        assert!(Uploader::prepare(&path).await.is_err());
    }

    #[tokio::test]
    async fn accepts_files_at_the_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exact.bin");
        let file = tokio::fs::File::create(&path).await.unwrap();
        file.set_len(MAX_UPLOAD_SIZE).await.unwrap();
        assert!(Uploader::prepare(&path).await.is_ok());
    }

    #[tokio::test]
    async fn streams_chunks_of_expected_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, vec![7u8; UPLOAD_CHUNK_SIZE * 2 + 10]).await.unwrap();

        let mut chunks = Vec::new();
        Uploader::stream(&path, |chunk| chunks.push(chunk)).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk, 0);
        assert_eq!(chunks[2].chunk, 2);
    }

    #[tokio::test]
    async fn inbound_transfer_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("received.bin");
        let mut downloader = Downloader::new(path.clone());
        downloader.start().await.unwrap();
        downloader.append(&BASE64.encode(b"hello ")).await.unwrap();
        downloader.append(&BASE64.encode(b"world")).await.unwrap();
        downloader.stop().await.unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"hello world");
    }
}
