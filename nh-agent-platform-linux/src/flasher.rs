//! Linux `Flasher` adapter: shells out to `fwup`, the external block-level
//! firmware writer the spec treats as an opaque collaborator.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use nh_agent_core::error::{FlashError, FlashResult};
use nh_agent_core::hal::{Flasher, FlasherEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Guards against two concurrent `fwup` invocations, per spec 5's
/// "flasher binary is a process-wide singleton" rule.
pub struct FwupFlasher {
    fwup_path: String,
    device_path: String,
    running: Arc<Mutex<()>>,
}

impl FwupFlasher {
    pub fn new(fwup_path: impl Into<String>, device_path: impl Into<String>) -> Self {
        Self {
            fwup_path: fwup_path.into(),
            device_path: device_path.into(),
            running: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait::async_trait]
impl Flasher for FwupFlasher {
    async fn write_stream(
        &self,
        task: &str,
        env: &[(String, String)],
    ) -> FlashResult<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<FlasherEvent>)> {
        let guard = Arc::clone(&self.running);
        let permit = guard
            .try_lock_owned()
            .map_err(|_| FlashError::AlreadyRunning)?;

        let mut cmd = Command::new(&self.fwup_path);
        cmd.arg("--apply")
            .arg("--no-unmount")
            .arg("-d")
            .arg(&self.device_path)
            .arg("--task")
            .arg(task)
            .arg("-i")
            .arg("-")
            .arg("--progress-low")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(FlashError::Io)?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(1);
        let (event_tx, event_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        let progress_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(percent) = parse_fwup_progress(&line) {
                    let _ = progress_tx.send(FlasherEvent::Progress(percent)).await;
                } else {
                    debug!(%line, "fwup output");
                }
            }
        });

        tokio::spawn(async move {
            let _permit = permit;
            match child.wait().await {
                Ok(status) if status.success() => {
                    let _ = event_tx.send(FlasherEvent::Ok).await;
                }
                Ok(status) => {
                    let _ = event_tx
                        .send(FlasherEvent::Error {
                            code: status.code().unwrap_or(-1),
                            message: format!("fwup exited with {status}"),
                        })
                        .await;
                }
                Err(err) => {
                    let _ = event_tx
                        .send(FlasherEvent::Error {
                            code: -1,
                            message: err.to_string(),
                        })
                        .await;
                }
            }
        });

        Ok((chunk_tx, event_rx))
    }

    async fn verify(&self, path: &Path, public_key_pem: &str) -> FlashResult<bool> {
        let key_file = tempfile::NamedTempFile::new().map_err(FlashError::Io)?;
        tokio::fs::write(key_file.path(), public_key_pem)
            .await
            .map_err(FlashError::Io)?;

        let status = Command::new(&self.fwup_path)
            .arg("--verify")
            .arg("-i")
            .arg(path)
            .arg("--public-key")
            .arg(key_file.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(FlashError::Io)?;

        if !status.success() {
            warn!(path = %path.display(), "fwup signature verification failed for this key");
        }
        Ok(status.success())
    }
}

/// `fwup --progress-low` emits bare percentage lines (`"42"`, sometimes
/// `"42\r"`); anything else is diagnostic chatter.
fn parse_fwup_progress(line: &str) -> Option<u8> {
    line.trim().trim_end_matches('%').parse::<u8>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_percentage_lines() {
        assert_eq!(parse_fwup_progress("42"), Some(42));
        assert_eq!(parse_fwup_progress("100%"), Some(100));
    }

    #[test]
    fn ignores_non_numeric_chatter() {
        assert_eq!(parse_fwup_progress("Upgrading partition B"), None);
    }
}
