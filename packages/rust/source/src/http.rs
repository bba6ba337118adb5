//! Source that downloads a session manifest and its documents over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use legisflow_shared::{LegisflowError, Result, RetryPolicy, SessionId};
use reqwest::{Client, StatusCode};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{
    AmendmentDocument, BillDocuments, BillListing, Document, DocumentSource, MANIFEST_FILE,
    Manifest, media_type_of,
};

/// User-Agent sent with every request.
const USER_AGENT: &str = concat!("legisflow/", env!("CARGO_PKG_VERSION"));

/// Fetches `{base}/{session}/bills.json`; document references resolve
/// against the manifest URL.
pub struct HttpManifestSource {
    base: Url,
    client: Client,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

/// Outcome of one request attempt.
enum Attempt {
    Done(Vec<u8>),
    Retry(String),
}

impl HttpManifestSource {
    /// `max_inflight` bounds concurrent requests across all callers.
    pub fn new(
        base: Url,
        timeout: Duration,
        max_inflight: usize,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| LegisflowError::Fetch(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base: with_trailing_slash(base),
            client,
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            retry,
        })
    }

    fn manifest_url(&self, session: &SessionId) -> Result<Url> {
        self.base
            .join(&format!("{session}/{MANIFEST_FILE}"))
            .map_err(|e| LegisflowError::Fetch(format!("bad manifest URL: {e}")))
    }

    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.attempt(url).await? {
                Attempt::Done(bytes) => return Ok(bytes),
                Attempt::Retry(reason) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(%url, attempt, ?delay, %reason, "transient fetch failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Attempt::Retry(reason) => {
                    return Err(LegisflowError::Fetch(format!(
                        "{url}: giving up after {} attempts: {reason}",
                        attempt + 1
                    )));
                }
            }
        }
    }

    /// A single request. Permanent failures are errors; transient ones ask
    /// for a retry.
    async fn attempt(&self, url: &Url) -> Result<Attempt> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LegisflowError::Fetch("fetch limiter closed".into()))?;
        debug!(%url, "fetching");

        let response = match self.client.get(url.as_str()).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                return Ok(Attempt::Retry(e.to_string()));
            }
            Err(e) => return Err(LegisflowError::Fetch(format!("{url}: {e}"))),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Ok(Attempt::Retry(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(LegisflowError::Fetch(format!("{url}: HTTP {status}")));
        }

        match response.bytes().await {
            Ok(bytes) => Ok(Attempt::Done(bytes.to_vec())),
            Err(e) => Ok(Attempt::Retry(format!("body read failed: {e}"))),
        }
    }

    async fn get_document(&self, manifest: &Url, reference: &str) -> Result<Document> {
        let url = manifest
            .join(reference)
            .map_err(|e| LegisflowError::Fetch(format!("bad document reference {reference:?}: {e}")))?;
        let bytes = self.get_bytes(&url).await?;
        Ok(Document {
            media_type: media_type_of(url.path()),
            bytes,
            origin: url.to_string(),
        })
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[async_trait]
impl DocumentSource for HttpManifestSource {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(session = %session))]
    async fn list_bills(&self, session: &SessionId) -> Result<Vec<BillListing>> {
        let url = self.manifest_url(session)?;
        let bytes = self.get_bytes(&url).await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| LegisflowError::Fetch(format!("{url} is malformed: {e}")))?;
        Ok(manifest.bills)
    }

    async fn fetch_documents(
        &self,
        session: &SessionId,
        listing: &BillListing,
    ) -> Result<BillDocuments> {
        let manifest = self.manifest_url(session)?;
        let bill = self.get_document(&manifest, &listing.document).await?;

        let fiscal_note = match &listing.fiscal_note {
            Some(reference) => Some(self.get_document(&manifest, reference).await?),
            None => None,
        };

        let mut amendments = Vec::with_capacity(listing.amendments.len());
        for amendment in &listing.amendments {
            amendments.push(AmendmentDocument {
                meta: amendment.meta.clone(),
                document: self.get_document(&manifest, &amendment.document).await?,
            });
        }

        Ok(BillDocuments {
            bill,
            fiscal_note,
            amendments,
        })
    }
}

#[cfg(test)]
mod tests {
    use legisflow_shared::MediaType;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::fixtures::manifest_json;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn source(server: &MockServer) -> HttpManifestSource {
        // Base without trailing slash on purpose.
        let base = Url::parse(&format!("{}/legislation", server.uri())).unwrap();
        HttpManifestSource::new(base, Duration::from_secs(5), 2, fast_retry()).unwrap()
    }

    async fn mount_ok(server: &MockServer, at: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn fetches_manifest_and_documents() {
        let server = MockServer::start().await;
        mount_ok(&server, "/legislation/2026rs/bills.json", manifest_json()).await;
        mount_ok(&server, "/legislation/2026rs/HB0100.md", "# HB0100").await;
        mount_ok(&server, "/legislation/2026rs/HB0100_fn.txt", "Fiscal note").await;
        for id in ["A1", "A2", "W1"] {
            mount_ok(
                &server,
                &format!("/legislation/2026rs/amendments/HB0100-{id}.md"),
                &format!("Amendment {id}"),
            )
            .await;
        }

        let source = source(&server);
        let session: SessionId = "2026rs".parse().unwrap();
        let listings = source.list_bills(&session).await.unwrap();
        let hb = listings.iter().find(|l| l.metadata.number == "HB0100").unwrap();

        let docs = source.fetch_documents(&session, hb).await.unwrap();
        assert_eq!(docs.bill.bytes, b"# HB0100");
        assert_eq!(docs.bill.media_type, MediaType::Markdown);
        assert_eq!(docs.fiscal_note.unwrap().bytes, b"Fiscal note");
        let adopted: Vec<String> = docs
            .amendments
            .iter()
            .filter(|a| a.meta.adopted)
            .map(|a| String::from_utf8(a.document.bytes.clone()).unwrap())
            .collect();
        assert_eq!(adopted, vec!["Amendment A2", "Amendment A1"]);
    }

    #[tokio::test]
    async fn retries_transient_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/legislation/2026rs/bills.json"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_ok(&server, "/legislation/2026rs/bills.json", manifest_json()).await;

        let listings = source(&server)
            .list_bills(&"2026rs".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(listings.len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/legislation/2026rs/bills.json"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = source(&server)
            .list_bills(&"2026rs".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LegisflowError::Fetch(_)));
        assert!(err.to_string().contains("giving up after 3 attempts"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/legislation/2026rs/bills.json"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = source(&server)
            .list_bills(&"2026rs".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_permit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/legislation/2026rs/bills.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(manifest_json())
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(4)
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/legislation", server.uri())).unwrap();
        let source = HttpManifestSource::new(base, Duration::from_secs(5), 1, fast_retry()).unwrap();
        let session: SessionId = "2026rs".parse().unwrap();

        let start = std::time::Instant::now();
        let (a, b, c, d) = tokio::join!(
            source.list_bills(&session),
            source.list_bills(&session),
            source.list_bills(&session),
            source.list_bills(&session),
        );
        let elapsed = start.elapsed();

        for listings in [a, b, c, d] {
            assert_eq!(listings.unwrap().len(), 2);
        }
        // One permit serializes the four delayed responses.
        assert!(elapsed >= Duration::from_millis(380), "took {elapsed:?}");
    }
}
