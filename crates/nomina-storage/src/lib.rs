//! Period archive retrieval and table decoding for the payroll loader.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use nomina_core::Period;
use thiserror::Error;
use tracing::debug;

pub mod decode;

pub use decode::{
    decode_period_archive, extract_period_table, DecodeError, DecodedTable, EncodingError,
    RecordDecoder, RowRejection, SourceEncoding,
};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("archive not found at {0}")]
    Missing(String),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Hands the pipeline the raw archive bytes for a period.
#[async_trait]
pub trait PeriodSource: Send + Sync {
    /// Stable identifier of the period's archive; recorded in the ingestion ledger.
    fn locator(&self, period: &Period) -> String;

    async fn fetch_archive(&self, period: &Period) -> Result<Vec<u8>, RetrievalError>;
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub resource: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            resource: "https://datos.hacienda.gov.py/odmh-core/rest/nomina/datos".to_string(),
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

/// Fetches `{resource}/nomina_{period}.zip` with a single GET per period.
#[derive(Debug)]
pub struct HttpSource {
    client: reqwest::Client,
    resource: String,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            resource: config.resource.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PeriodSource for HttpSource {
    fn locator(&self, period: &Period) -> String {
        format!("{}/{}", self.resource, period.archive_file_name())
    }

    async fn fetch_archive(&self, period: &Period) -> Result<Vec<u8>, RetrievalError> {
        let url = self.locator(period);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RetrievalError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(%period, %url, bytes = body.len(), "fetched period archive");
        Ok(body)
    }
}

/// Reads period archives from a local mirror directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_path(&self, period: &Period) -> PathBuf {
        self.root.join(period.archive_file_name())
    }
}

#[async_trait]
impl PeriodSource for DirectorySource {
    fn locator(&self, period: &Period) -> String {
        self.archive_path(period).display().to_string()
    }

    async fn fetch_archive(&self, period: &Period) -> Result<Vec<u8>, RetrievalError> {
        let path = self.archive_path(period);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(RetrievalError::Missing(path.display().to_string()))
            }
            Err(source) => Err(RetrievalError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn http_locator_joins_resource_and_archive_name() {
        let source = HttpSource::new(HttpSourceConfig {
            resource: "https://example.org/nomina/datos/".to_string(),
            ..Default::default()
        })
        .expect("client");
        let period: Period = "2017-05".parse().unwrap();
        assert_eq!(
            source.locator(&period),
            "https://example.org/nomina/datos/nomina_2017-05.zip"
        );
    }

    fn http_source_for(server: &MockServer) -> HttpSource {
        HttpSource::new(HttpSourceConfig {
            resource: format!("{}/datos", server.uri()),
            timeout: Duration::from_secs(5),
            user_agent: Some("nomina-test".to_string()),
        })
        .expect("client")
    }

    #[tokio::test]
    async fn http_source_returns_archive_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datos/nomina_2017-05.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zip-bytes".to_vec()))
            .mount(&server)
            .await;

        let source = http_source_for(&server);
        let period: Period = "2017-05".parse().unwrap();
        let bytes = source.fetch_archive(&period).await.expect("fetch");
        assert_eq!(bytes, b"zip-bytes");
    }

    #[tokio::test]
    async fn http_source_reports_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datos/nomina_2017-06.zip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = http_source_for(&server);
        let period: Period = "2017-06".parse().unwrap();
        let err = source.fetch_archive(&period).await.unwrap_err();
        match err {
            RetrievalError::HttpStatus { status, url } => {
                assert_eq!(status, 404);
                assert!(url.ends_with("/datos/nomina_2017-06.zip"));
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_source_reads_and_reports_missing_archives() {
        let dir = tempdir().expect("tempdir");
        let source = DirectorySource::new(dir.path());
        let present: Period = "2017-05".parse().unwrap();
        let absent: Period = "2017-06".parse().unwrap();
        std::fs::write(dir.path().join("nomina_2017-05.zip"), b"zip-bytes").expect("write");

        let bytes = source.fetch_archive(&present).await.expect("present archive");
        assert_eq!(bytes, b"zip-bytes");
        assert!(source.locator(&present).ends_with("nomina_2017-05.zip"));

        let err = source.fetch_archive(&absent).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Missing(_)));
    }
}
