use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RANGE, USER_AGENT};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::config::RetryConfig;
use crate::error::{DownloadError, DownloadResult};

const USER_AGENT_VALUE: &str = concat!("NHL/", env!("CARGO_PKG_VERSION"));

/// Action a data handler returns for each chunk; `Abort` stops the download
/// with a fatal `HandlerAborted` error, matching the source's
/// `{:error, reason}` escape hatch.
pub enum HandlerAction {
    Continue,
    Abort(String),
}

/// Callback invoked for every downloaded chunk and at completion. `percent`
/// already accounts for any bytes resumed from a prior attempt. Async so a
/// handler can apply real backpressure (e.g. waiting on the flasher's
/// per-chunk acknowledgement) instead of buffering unboundedly.
#[async_trait]
pub trait DownloadHandler: Send {
    async fn on_data(&mut self, bytes: &[u8], percent: u8) -> HandlerAction;
    async fn on_complete(&mut self);
}

/// Resumable GET with redirect handling and a three-layer timeout/retry
/// scheme, per spec 4.3.
pub struct Downloader {
    client: Client,
    retry: RetryConfig,
}

impl Downloader {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            retry,
        }
    }

    /// Runs the full download to completion (or a terminal error),
    /// resuming from `resume_from_bytes` if nonzero.
    pub async fn run(
        &self,
        url: &str,
        resume_from_bytes: u64,
        handler: &mut dyn DownloadHandler,
    ) -> DownloadResult<()> {
        let mut url = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
        let mut downloaded = resume_from_bytes;
        let mut total_len: Option<u64> = None;
        let mut retry_number: u32 = 0;
        let mut redirects: u8 = 0;

        let overall_deadline = Instant::now() + self.retry.max_timeout;
        let mut worst_case_deadline: Option<Instant> = None;

        loop {
            if Instant::now() >= overall_deadline {
                return Err(DownloadError::MaxTimeoutReached);
            }

            let request = self.build_request(&url, downloaded, total_len, retry_number)?;
            debug!(%url, downloaded, retry_number, "sending download request");

            let response = tokio::time::timeout(
                overall_deadline.saturating_duration_since(Instant::now()),
                self.client.execute(request),
            )
            .await
            .map_err(|_| DownloadError::MaxTimeoutReached)?
            .map_err(|e| DownloadError::Transport(e.to_string()))?;

            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > 2 {
                    return Err(DownloadError::Transport(
                        "too many redirects".to_string(),
                    ));
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| DownloadError::Transport("redirect without Location".into()))?;
                url = url
                    .join(location)
                    .map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
                retry_number = 0;
                continue;
            }

            if !status.is_success() {
                return Err(DownloadError::HttpStatus(status.as_u16()));
            }

            if total_len.is_none() {
                total_len = response.content_length().map(|len| len + downloaded);
                if let Some(total) = total_len {
                    let worst_case = Duration::from_secs(
                        (total / self.retry.worst_case_download_speed_bytes_per_sec.max(1))
                            .max(60),
                    );
                    worst_case_deadline = Some(Instant::now() + worst_case);
                }
                if status != StatusCode::PARTIAL_CONTENT && downloaded > 0 {
                    warn!("server did not honor Range request, accept-ranges mismatch");
                }
            }

            match self
                .stream_body(response, &mut downloaded, total_len, handler, worst_case_deadline, overall_deadline)
                .await
            {
                Ok(()) => {
                    handler.on_complete().await;
                    return Ok(());
                }
                Err(StreamOutcome::Aborted(reason)) => {
                    return Err(DownloadError::HandlerAborted(reason));
                }
                Err(StreamOutcome::Retry) => {
                    retry_number += 1;
                    if retry_number > self.retry.max_disconnects {
                        return Err(DownloadError::MaxDisconnectsReached(
                            self.retry.max_disconnects,
                        ));
                    }
                    tokio::time::sleep(self.retry.time_between_retries).await;
                    continue;
                }
                Err(StreamOutcome::WorstCase) => {
                    return Err(DownloadError::MaxTimeoutReached);
                }
            }
        }
    }

    fn build_request(
        &self,
        url: &Url,
        downloaded: u64,
        total_len: Option<u64>,
        retry_number: u32,
    ) -> DownloadResult<reqwest::Request> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert(
            "X-Retry-Number",
            HeaderValue::from_str(&retry_number.to_string())
                .map_err(|e| DownloadError::Transport(e.to_string()))?,
        );

        if downloaded > 0 {
            let range = match total_len {
                Some(total) => format!("bytes={downloaded}-{total}"),
                None => format!("bytes={downloaded}-"),
            };
            headers.insert(
                RANGE,
                HeaderValue::from_str(&range).map_err(|e| DownloadError::Transport(e.to_string()))?,
            );
        }

        self.client
            .get(url.clone())
            .headers(headers)
            .build()
            .map_err(|e| DownloadError::Transport(e.to_string()))
    }

    async fn stream_body(
        &self,
        response: reqwest::Response,
        downloaded: &mut u64,
        total_len: Option<u64>,
        handler: &mut dyn DownloadHandler,
        worst_case_deadline: Option<Instant>,
        overall_deadline: Instant,
    ) -> Result<(), StreamOutcome> {
        let mut stream = response.bytes_stream();
        let idle_timeout = self.retry.idle_timeout;

        loop {
            let deadline = match worst_case_deadline {
                Some(d) => d.min(overall_deadline),
                None => overall_deadline,
            };
            if Instant::now() >= deadline {
                return Err(StreamOutcome::WorstCase);
            }

            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(_))) => return Err(StreamOutcome::Retry),
                Ok(None) => return Ok(()),
                Err(_) => return Err(StreamOutcome::Retry),
            };

            *downloaded += chunk.len() as u64;
            let percent = match total_len {
                Some(total) if total > 0 => ((*downloaded * 100) / total).min(100) as u8,
                _ => 0,
            };

            match handler.on_data(&chunk, percent).await {
                HandlerAction::Continue => {}
                HandlerAction::Abort(reason) => return Err(StreamOutcome::Aborted(reason)),
            }
        }
    }
}

enum StreamOutcome {
    Retry,
    Aborted(String),
    WorstCase,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingHandler {
        received: Vec<u8>,
        percents: Vec<u8>,
        completed: bool,
    }

    #[async_trait]
    impl DownloadHandler for CollectingHandler {
        async fn on_data(&mut self, bytes: &[u8], percent: u8) -> HandlerAction {
            self.received.extend_from_slice(bytes);
            self.percents.push(percent);
            HandlerAction::Continue
        }

        async fn on_complete(&mut self) {
            self.completed = true;
        }
    }

    #[test]
    fn percent_is_monotonic_given_monotonic_downloaded() {
        let mut percents = Vec::new();
        let total = 100u64;
        for downloaded in [0u64, 10, 50, 100, 150] {
            percents.push(((downloaded * 100) / total).min(100) as u8);
        }
        assert_eq!(percents, vec![0, 10, 50, 100, 100]);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn invalid_url_is_rejected() {
        let downloader = Downloader::new(RetryConfig::default());
        let result = Url::parse("not a url");
        assert!(result.is_err());
        let _ = downloader;
    }

    #[tokio::test]
    async fn handler_abort_surfaces_reason() {
        let mut handler = CollectingHandler {
            received: Vec::new(),
            percents: Vec::new(),
            completed: false,
        };
        if let HandlerAction::Abort(reason) = handler.on_data(b"x", 1).await {
            panic!("unexpected abort: {reason}");
        }
        assert_eq!(handler.received, b"x");
        assert!(!handler.completed);
    }
}
