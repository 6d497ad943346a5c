//! HTTP access to the archive and per-file transfer.

use crate::auth::Credentials;
use crate::downloader::config::{ArchiveEndpoints, CONNECT_TIMEOUT, MAX_REDIRECTS, READ_TIMEOUT};
use crate::store::StoreError;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RANGE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

pub mod file;

pub use file::{FetchReport, FileFetcher};

const USER_AGENT_VALUE: &str =
    "archive-batch-downloader/0.2 (+https://github.com/archive-batch-downloader)";

/// Classification of a failure, recorded on the file row and used to pick
/// the recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, DNS, resets, 5xx other than 503; retried with per-file
    /// exponential backoff.
    TransientNet,
    /// HTTP 429; trips the global backoff gate.
    Throttled,
    /// HTTP 503; trips the global backoff gate.
    Overloaded,
    /// HTTP 401/403; terminal for the file.
    Auth,
    /// HTTP 404; terminal, recorded as `missing`.
    NotFound,
    /// Size or digest mismatch (including 416); partial discarded, retried.
    Integrity,
    /// Local disk errors; terminal for the file.
    Io,
    /// Store corruption or disk-full; aborts the job.
    Fatal,
}

impl ErrorKind {
    /// Stable label stored on the file row.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNet => "transient-net",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "missing",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Io => "io",
            ErrorKind::Fatal => "fatal",
        }
    }

    /// Whether the fetcher may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNet
                | ErrorKind::Throttled
                | ErrorKind::Overloaded
                | ErrorKind::Integrity
        )
    }
}

/// Errors raised while talking to the archive or writing the destination.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure (timeout, reset, DNS).
    #[error("network error: {0}")]
    Network(String),

    /// Response with a status the protocol does not accept.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code.
        status: u16,
        /// Short description.
        message: String,
    },

    /// Size or digest disagreement at finalize.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// Local filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest body failed to parse.
    #[error("manifest parse error: {0}")]
    Parse(String),

    /// State store failure; fatal for the job.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job was cancelled mid-operation.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Classify into the recovery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(_) => ErrorKind::TransientNet,
            FetchError::Http { status, .. } => match status {
                429 => ErrorKind::Throttled,
                503 => ErrorKind::Overloaded,
                401 | 403 => ErrorKind::Auth,
                404 => ErrorKind::NotFound,
                416 => ErrorKind::Integrity,
                _ => ErrorKind::TransientNet,
            },
            FetchError::Integrity(_) => ErrorKind::Integrity,
            FetchError::Io(_) => ErrorKind::Io,
            FetchError::Parse(_) => ErrorKind::TransientNet,
            FetchError::Store(_) => ErrorKind::Fatal,
            FetchError::Cancelled => ErrorKind::TransientNet,
        }
    }

    /// The HTTP status behind this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for fetcher operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Shared HTTP client for all archive interactions.
///
/// One client per job: connection pooling and the credential header are
/// shared across workers, and the explicit connect/read timeouts prevent
/// indefinite hangs mid-body.
pub struct ArchiveClient {
    client: Client,
    endpoints: ArchiveEndpoints,
    has_credentials: bool,
}

impl ArchiveClient {
    /// Build a client for the given endpoints, attaching the archive's
    /// `LOW access:secret` authorization header when credentials are set.
    pub fn new(
        endpoints: ArchiveEndpoints,
        credentials: Option<&Credentials>,
    ) -> FetchResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        if let Some(creds) = credentials {
            let value = HeaderValue::from_str(&creds.authorization_header())
                .map_err(|e| FetchError::Network(format!("invalid credential bytes: {e}")))?;
            default_headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(default_headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoints,
            has_credentials: credentials.is_some(),
        })
    }

    /// Whether a credential header is attached to every request.
    pub fn has_credentials(&self) -> bool {
        self.has_credentials
    }

    /// Metadata document URL for an item.
    pub fn metadata_url(&self, identifier: &str) -> String {
        format!("{}/{}", self.endpoints.metadata_base, identifier)
    }

    /// Download URL for one file of an item.
    pub fn download_url(&self, identifier: &str, remote_name: &str) -> String {
        format!("{}/{}/{}", self.endpoints.download_base, identifier, remote_name)
    }

    /// GET a JSON document. Non-success statuses are surfaced unclassified
    /// for the caller's retry policy.
    pub async fn get_json<T>(&self, url: &str) -> FetchResult<T>
    where
        T: DeserializeOwned,
    {
        debug!(url, "fetching JSON document");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                message: format!("unexpected status for {url}"),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }

    /// Issue the payload GET, with an open-ended inclusive range header when
    /// resuming past byte zero. Status handling is the caller's job.
    pub async fn get_file(&self, url: &str, resume_from: Option<u64>) -> FetchResult<Response> {
        let mut request = self.client.get(url);
        if let Some(offset) = resume_from.filter(|&p| p > 0) {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))
    }
}

/// Map an unexpected payload status into a [`FetchError`].
pub(crate) fn status_error(status: StatusCode, context: &str) -> FetchError {
    FetchError::Http {
        status: status.as_u16(),
        message: context.to_string(),
    }
}
