//! Helpers for testing request handlers against real HTTP endpoints.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`ApiServer`], make sure that the server is held until all requests to the
//!    server have been made. If the server is dropped, the ports remain open and all
//!    connections to it will time out. To avoid this, assign it to a variable:
//!    `let server = ApiServer::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

/// The secret all test tokens are signed with.
pub const JWT_SECRET: &[u8] = b"resourcer-test-secret";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `resourcer_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("resourcer_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Creates a token for `subject` signed with [`JWT_SECRET`], expiring at `exp`.
pub fn make_jwt(subject: &str, exp: Option<DateTime<Utc>>) -> String {
    let claims = Claims {
        sub: subject.to_owned(),
        exp: exp.map(|exp| exp.timestamp()),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET),
    )
    .unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving `router`.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An item served by [`ApiServer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    /// Who the token presented for this item was issued to.
    pub owner: String,
    /// How often the item was served so far, including this time.
    pub served: usize,
}

#[derive(Debug, Serialize)]
struct ServerTime {
    now: f64,
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

#[derive(Clone)]
struct ApiState {
    hits: Hits,
    served: Arc<Mutex<BTreeMap<String, usize>>>,
    clock_offset: chrono::TimeDelta,
}

/// A fake API with authorized items, a time endpoint and failure modes.
///
/// - `/items/:id` serves an [`Item`] when presented a valid, unexpired bearer token signed with
///   [`JWT_SECRET`], and `401` otherwise. The id `missing` is always `404`.
/// - `/time` answers `{"now": <seconds>}`, shifted by the configured clock offset.
/// - `/respond_statuscode/:num` answers with the given status. `429` comes with
///   `Retry-After: 2`.
/// - `/delay/:millis` answers an item after the given delay.
/// - `/garbage` answers a body which is not JSON.
pub struct ApiServer {
    server: Server,
    hits: Hits,
}

impl ApiServer {
    pub fn new() -> Self {
        Self::with_clock_offset(chrono::TimeDelta::zero())
    }

    /// A server whose clock is `offset` ahead of the local one.
    pub fn with_clock_offset(offset: chrono::TimeDelta) -> Self {
        let hits = Hits::default();
        let state = ApiState {
            hits: Arc::clone(&hits),
            served: Default::default(),
            clock_offset: offset,
        };

        let router = Router::new()
            .route("/items/:id", get(item))
            .route("/time", get(time))
            .route(
                "/respond_statuscode/:num",
                get(|extract::Path(num): extract::Path<u16>| async move {
                    let status = StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        (status, [(header::RETRY_AFTER, "2")]).into_response()
                    } else {
                        status.into_response()
                    }
                }),
            )
            .route(
                "/delay/:millis",
                get(|extract::Path(millis): extract::Path<u64>| async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Json(Item {
                        id: "delayed".into(),
                        owner: String::new(),
                        served: 1,
                    })
                }),
            )
            .route("/garbage", get(|| async { "this is not json" }))
            .layer(middleware::from_fn_with_state(state.clone(), count_hits))
            .with_state(state);

        Self {
            server: Server::with_router(router),
            hits,
        }
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The number of requests served since the last call.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Requests per path served since the last call.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }
}

impl Default for ApiServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn count_hits(
    State(state): State<ApiState>,
    extract::OriginalUri(uri): extract::OriginalUri,
    request: extract::Request,
    next: middleware::Next,
) -> Response {
    {
        let mut hits = state.hits.lock().unwrap();
        *hits.entry(uri.path().to_owned()).or_default() += 1;
    }
    next.run(request).await
}

async fn item(
    State(state): State<ApiState>,
    extract::Path(id): extract::Path<String>,
    headers: HeaderMap,
) -> Response {
    if id == "missing" {
        return StatusCode::NOT_FOUND.into_response();
    }

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let mut validation = Validation::default();
    validation.leeway = 0;
    validation.required_spec_claims.clear();
    let claims = match jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(JWT_SECRET),
        &validation,
    ) {
        Ok(data) => data.claims,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let served = {
        let mut served = state.served.lock().unwrap();
        let served = served.entry(id.clone()).or_default();
        *served += 1;
        *served
    };

    Json(Item {
        id,
        owner: claims.sub,
        served,
    })
    .into_response()
}

async fn time(State(state): State<ApiState>) -> Json<ServerTime> {
    let now = Utc::now() + state.clock_offset;
    Json(ServerTime {
        now: now.timestamp_millis() as f64 / 1000.0,
    })
}
