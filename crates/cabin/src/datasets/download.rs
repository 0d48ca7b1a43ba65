//! Downloading file artifacts over HTTP.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use cabin_engine::{BuildContext, ProducedArtifact, TransformError, Transformation};
use cabin_store::ArtifactLocation;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Request timeout for a single attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of a failed attempt.
enum AttemptError {
    /// Worth retrying (network errors, 5xx, 429).
    Transient(TransformError),
    /// Retrying will not help (other 4xx, local IO).
    Permanent(TransformError),
}

/// Size of a downloaded file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Downloaded {
    bytes: u64,
    /// Newline-terminated lines, counting a trailing partial line.
    lines: u64,
}

impl Downloaded {
    fn record(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        self.lines += chunk.iter().filter(|b| **b == b'\n').count() as u64;
    }

    fn finish(mut self, last: Option<u8>) -> Self {
        if last.is_some_and(|b| b != b'\n') {
            self.lines += 1;
        }
        self
    }
}

/// Fetches `url_template` (with `{root}` substituted) into the output file.
pub struct HttpDownload {
    url_template: String,
    initial_interval: Duration,
    max_elapsed: Duration,
}

impl HttpDownload {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            initial_interval: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(120),
        }
    }

    /// Override the retry schedule.
    pub fn retrying(mut self, initial_interval: Duration, max_elapsed: Duration) -> Self {
        self.initial_interval = initial_interval;
        self.max_elapsed = max_elapsed;
        self
    }

    /// URL for a given root.
    pub fn url(&self, root: &str) -> String {
        self.url_template.replace("{root}", root)
    }

    fn client(&self) -> Result<reqwest::Client, TransformError> {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("cabin/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransformError::Failed(format!("failed to build HTTP client: {}", e)))
    }

    async fn fetch(&self, http: &reqwest::Client, url: &str, path: &Path) -> Result<Downloaded, TransformError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        loop {
            match Self::attempt(http, url, path).await {
                Ok(downloaded) => return Ok(downloaded),
                Err(AttemptError::Permanent(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => match backoff.next_backoff() {
                    Some(wait) => {
                        warn!(url = %url, error = %e, wait_ms = wait.as_millis() as u64, "download failed, retrying");
                        tokio::time::sleep(wait).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    async fn attempt(http: &reqwest::Client, url: &str, path: &Path) -> Result<Downloaded, AttemptError> {
        let mut response = http
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptError::Transient(TransformError::Failed(format!("GET {}: {}", url, e))))?;

        let status = response.status();
        if !status.is_success() {
            let err = TransformError::Failed(format!("GET {}: HTTP {}", url, status));
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                AttemptError::Transient(err)
            } else {
                AttemptError::Permanent(err)
            });
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| AttemptError::Permanent(e.into()))?;
        let mut downloaded = Downloaded::default();
        let mut last = None;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AttemptError::Transient(TransformError::Failed(format!("GET {}: {}", url, e))))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Permanent(e.into()))?;
            downloaded.record(&chunk);
            last = chunk.last().copied().or(last);
        }
        file.flush().await.map_err(|e| AttemptError::Permanent(e.into()))?;
        let downloaded = downloaded.finish(last);
        debug!(url = %url, bytes = downloaded.bytes, lines = downloaded.lines, "downloaded");
        Ok(downloaded)
    }
}

#[async_trait]
impl Transformation for HttpDownload {
    async fn produce(&self, ctx: &BuildContext) -> Result<ProducedArtifact, TransformError> {
        let ArtifactLocation::File(path) = &ctx.output else {
            return Err(TransformError::Failed(format!(
                "{} downloads into a file, not {:?}",
                ctx.dataset(),
                ctx.output
            )));
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let http = self.client()?;
        let url = self.url(ctx.root());
        info!(dataset = %ctx.dataset(), url = %url, "downloading");
        let downloaded = tokio::select! {
            downloaded = self.fetch(&http, &url, path) => downloaded?,
            _ = ctx.cancel.cancelled() => return Err(TransformError::Cancelled),
        };

        Ok(ProducedArtifact {
            row_count: downloaded.lines,
            byte_size: downloaded.bytes,
        })
    }

    async fn check(&self, ctx: &BuildContext, artifact: &ProducedArtifact) -> Result<(), TransformError> {
        if artifact.byte_size == 0 {
            return Err(TransformError::Check(format!("{} downloaded an empty file", ctx.dataset())));
        }
        Ok(())
    }

    fn formula_content(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "url": self.url_template }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabin_engine::Cancellation;
    use cabin_store::{Fingerprint, VersionKey};
    use tokio::sync::watch;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context(output: ArtifactLocation) -> BuildContext {
        BuildContext {
            key: VersionKey::new("Download", "2011", Fingerprint::of(b"download")),
            dataset_version: "1".to_string(),
            output,
            inputs: Vec::new(),
            cancel: Cancellation::never(),
        }
    }

    fn quick(url: String) -> HttpDownload {
        HttpDownload::new(url).retrying(Duration::from_millis(5), Duration::from_millis(200))
    }

    #[test]
    fn test_url_substitutes_root() {
        let dl = HttpDownload::new("https://example.com/events_{root}.csv");
        assert_eq!(dl.url("2012"), "https://example.com/events_2012.csv");
    }

    #[test]
    fn test_url_template_is_formula_content() {
        let a = HttpDownload::new("https://a/{root}");
        let b = HttpDownload::new("https://b/{root}");
        assert_ne!(a.formula_content(), b.formula_content());
    }

    #[tokio::test]
    async fn test_download_writes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events_2011.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a,b\n1,2\n3,4\n"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("events.csv");
        let dl = quick(format!("{}/events_{{root}}.csv", server.uri()));

        let artifact = dl.produce(&context(ArtifactLocation::File(out.clone()))).await.unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "a,b\n1,2\n3,4\n");
        assert_eq!(artifact.row_count, 3);
        assert_eq!(artifact.byte_size, 12);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dl = quick(format!("{}/missing_{{root}}", server.uri()));

        let err = dl
            .produce(&context(ArtifactLocation::File(dir.path().join("x"))))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x\n"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("retry.csv");
        let dl = HttpDownload::new(format!("{}/{{root}}", server.uri()))
            .retrying(Duration::from_millis(5), Duration::from_secs(10));

        let artifact = dl.produce(&context(ArtifactLocation::File(out))).await.unwrap();
        assert_eq!(artifact.row_count, 1);
    }

    #[test]
    fn test_lines_counted_across_chunks() {
        let mut downloaded = Downloaded::default();
        downloaded.record(b"a,b\n1,");
        downloaded.record(b"2\n3,4");
        assert_eq!(downloaded.finish(Some(b'4')), Downloaded { bytes: 11, lines: 3 });

        let mut terminated = Downloaded::default();
        terminated.record(b"x\n");
        assert_eq!(terminated.finish(Some(b'\n')).lines, 1);
        assert_eq!(Downloaded::default().finish(None).lines, 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_a_stalled_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dl = quick(format!("{}/{{root}}", server.uri()));
        let (tx, rx) = watch::channel(false);
        let mut ctx = context(ArtifactLocation::File(dir.path().join("stalled.csv")));
        ctx.cancel = Cancellation::from(rx);

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(dl.produce(&ctx), cancel);

        assert!(matches!(result, Err(TransformError::Cancelled)));
    }

    #[tokio::test]
    async fn test_table_output_is_rejected() {
        let dl = HttpDownload::new("http://unused/{root}");
        let err = dl
            .produce(&context(ArtifactLocation::Table("t".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Failed(_)));
    }

    #[tokio::test]
    async fn test_check_rejects_empty_download() {
        let dl = HttpDownload::new("http://unused/{root}");
        let ctx = context(ArtifactLocation::Nothing);
        assert!(dl.check(&ctx, &ProducedArtifact::default()).await.is_err());
        let ok = ProducedArtifact { row_count: 1, byte_size: 3 };
        assert!(dl.check(&ctx, &ok).await.is_ok());
    }
}
