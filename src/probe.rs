//! HTTP header probe used to learn the content type of a download URL.
//!
//! Probing blocks, so it only ever runs on the event loop's thread pool.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;

use crate::error::{Error, Result};

/// Timeout for a single probe request
const PROBE_TIMEOUT_SECS: u64 = 30;

/// What a header probe found out about a URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    /// HTTP status of the final response
    pub status: u16,
    /// URL after following redirects
    pub updated_url: String,
    /// MIME type without parameters, if the server sent one
    pub content_type: Option<String>,
}

/// Fetches the headers of a URL
pub trait HeaderProbe: Send + Sync {
    /// Blocking header fetch
    fn probe(&self, url: &str) -> Result<HeaderInfo>;
}

/// [`HeaderProbe`] backed by a blocking reqwest client
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    /// Build the HTTP client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                Error::Io(std::io::Error::other(format!(
                    "Failed to create HTTP client: {}",
                    e
                )))
            })?;
        Ok(Self { client })
    }
}

impl HeaderProbe for HttpProbe {
    fn probe(&self, url: &str) -> Result<HeaderInfo> {
        let mut response = self.client.head(url).send()?;

        // Some servers refuse HEAD; ask for the body instead and never read it
        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            tracing::debug!(url, status = %response.status(), "HEAD refused, retrying with GET");
            response = self.client.get(url).send()?;
        }

        Ok(header_info(&response))
    }
}

fn header_info(response: &Response) -> HeaderInfo {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().to_ascii_lowercase())
        .filter(|mime| !mime.is_empty());

    HeaderInfo {
        status: response.status().as_u16(),
        updated_url: response.url().to_string(),
        content_type,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn probe(url: String) -> Result<HeaderInfo> {
        tokio::task::spawn_blocking(move || HttpProbe::new()?.probe(&url))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reports_content_type_without_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/show.mp4"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Content-Type", "Video/MP4; charset=binary"),
            )
            .mount(&server)
            .await;

        let info = probe(format!("{}/show.mp4", server.uri())).await.unwrap();
        assert_eq!(info.status, 200);
        assert_eq!(info.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(info.updated_url, format!("{}/show.mp4", server.uri()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/old.torrent"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/new.torrent", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/new.torrent"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Content-Type", "application/x-bittorrent"),
            )
            .mount(&server)
            .await;

        let info = probe(format!("{}/old.torrent", server.uri())).await.unwrap();
        assert_eq!(info.updated_url, format!("{}/new.torrent", server.uri()));
        assert_eq!(info.content_type.as_deref(), Some("application/x-bittorrent"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn falls_back_to_get_when_head_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a.ogg"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "audio/ogg"))
            .mount(&server)
            .await;

        let info = probe(format!("{}/a.ogg", server.uri())).await.unwrap();
        assert_eq!(info.content_type.as_deref(), Some("audio/ogg"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_content_type_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let info = probe(format!("{}/gone", server.uri())).await.unwrap();
        assert_eq!(info.status, 404);
        assert!(info.content_type.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connection_failure_is_an_error() {
        let result = probe("http://127.0.0.1:1/unreachable".to_string()).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
