//! In-process archive fixture for end-to-end tests.
//!
//! Serves the two endpoints the engine talks to: `/metadata/{id}` and
//! `/download/{id}/{name}`. Per-file behaviors simulate throttling,
//! range-ignoring servers, and missing objects; every download hit is
//! recorded with its parsed range offset so tests can assert byte-level
//! resume behavior.

use archive_batch_downloader::downloader::ArchiveEndpoints;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// How the fixture answers download requests for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Honor ranges with 206, otherwise 200.
    Normal,
    /// Always answer 200 with the full body, ignoring any range header.
    IgnoreRange,
    /// Answer 429 once, then behave normally.
    ThrottleOnce,
    /// Answer 503 once, then behave normally.
    OverloadOnce,
    /// Always answer 404.
    NotFound,
}

/// One file served by the fixture.
#[derive(Debug, Clone)]
pub struct FixtureFile {
    pub name: String,
    pub body: Vec<u8>,
    /// Size advertised in the manifest (usually `body.len()`).
    pub advertised_size: u64,
    /// Digest advertised in the manifest, if any.
    pub advertised_md5: Option<String>,
    pub behavior: Behavior,
}

impl FixtureFile {
    /// A well-behaved file whose manifest entries match its body.
    pub fn normal(name: &str, body: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            body: body.to_vec(),
            advertised_size: body.len() as u64,
            advertised_md5: Some(format!("{:x}", md5::compute(body))),
            behavior: Behavior::Normal,
        }
    }

    /// Override the served behavior.
    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Advertise a digest that the body will never produce.
    pub fn with_bogus_md5(mut self) -> Self {
        self.advertised_md5 = Some("0".repeat(32));
        self
    }
}

/// One recorded download request.
#[derive(Debug, Clone)]
pub struct DownloadHit {
    pub identifier: String,
    pub name: String,
    /// Parsed start of a `bytes=p-` range header, if one was sent.
    pub range_start: Option<u64>,
}

#[derive(Default)]
struct FixtureState {
    items: HashMap<String, Vec<FixtureFile>>,
    hits: Vec<DownloadHit>,
    throttled_once: HashMap<(String, String), bool>,
}

/// Running fixture server.
pub struct FakeArchive {
    addr: SocketAddr,
    state: Arc<Mutex<FixtureState>>,
}

impl FakeArchive {
    /// Start the fixture with the given items.
    pub async fn start(items: Vec<(&str, Vec<FixtureFile>)>) -> Self {
        let mut map = HashMap::new();
        for (identifier, files) in items {
            map.insert(identifier.to_string(), files);
        }
        let state = Arc::new(Mutex::new(FixtureState {
            items: map,
            ..Default::default()
        }));

        let router = Router::new()
            .route("/metadata/:id", get(metadata_handler))
            .route("/download/:id/:name", get(download_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("fixture bind");
        let addr = listener.local_addr().expect("fixture addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        Self { addr, state }
    }

    /// Endpoint configuration pointing the engine at this fixture.
    pub fn endpoints(&self) -> ArchiveEndpoints {
        ArchiveEndpoints {
            metadata_base: format!("http://{}/metadata", self.addr),
            download_base: format!("http://{}/download", self.addr),
        }
    }

    /// All recorded download requests so far.
    pub fn download_hits(&self) -> Vec<DownloadHit> {
        self.state.lock().unwrap().hits.clone()
    }

    /// Recorded download requests for one file.
    pub fn hits_for(&self, identifier: &str, name: &str) -> Vec<DownloadHit> {
        self.download_hits()
            .into_iter()
            .filter(|h| h.identifier == identifier && h.name == name)
            .collect()
    }
}

async fn metadata_handler(
    State(state): State<Arc<Mutex<FixtureState>>>,
    Path(id): Path<String>,
) -> Response {
    let state = state.lock().unwrap();
    let Some(files) = state.items.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let entries: Vec<serde_json::Value> = files
        .iter()
        .map(|f| {
            serde_json::json!({
                "name": f.name,
                "size": f.advertised_size,
                "md5": f.advertised_md5,
            })
        })
        .collect();

    axum::Json(serde_json::json!({ "files": entries })).into_response()
}

fn parse_range_start(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

async fn download_handler(
    State(state): State<Arc<Mutex<FixtureState>>>,
    Path((id, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let range_start = parse_range_start(&headers);

    let (file, throttle_now) = {
        let mut state = state.lock().unwrap();
        state.hits.push(DownloadHit {
            identifier: id.clone(),
            name: name.clone(),
            range_start,
        });

        let Some(file) = state
            .items
            .get(&id)
            .and_then(|files| files.iter().find(|f| f.name == name))
            .cloned()
        else {
            return StatusCode::NOT_FOUND.into_response();
        };

        let throttle_now = matches!(
            file.behavior,
            Behavior::ThrottleOnce | Behavior::OverloadOnce
        ) && !state
            .throttled_once
            .get(&(id.clone(), name.clone()))
            .copied()
            .unwrap_or(false);
        if throttle_now {
            state.throttled_once.insert((id.clone(), name.clone()), true);
        }
        (file, throttle_now)
    };

    match file.behavior {
        Behavior::NotFound => StatusCode::NOT_FOUND.into_response(),
        Behavior::ThrottleOnce if throttle_now => StatusCode::TOO_MANY_REQUESTS.into_response(),
        Behavior::OverloadOnce if throttle_now => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Behavior::IgnoreRange => file.body.clone().into_response(),
        _ => match range_start {
            Some(start) if (start as usize) < file.body.len() => {
                let total = file.body.len();
                let tail = file.body[start as usize..].to_vec();
                (
                    StatusCode::PARTIAL_CONTENT,
                    [(
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{}/{total}", total - 1),
                    )],
                    tail,
                )
                    .into_response()
            }
            Some(_) => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
            None => file.body.clone().into_response(),
        },
    }
}
