//! Helpers for testing the cache and its clients.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`UsersServer`], make sure that the server is held until all requests to
//!    the server have been made. The server is shut down when dropped, and all connections to
//!    it will fail afterwards. To avoid this, assign it to a variable: `let server =
//!    UsersServer::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `flightcache` crates and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "flightcache=trace,flightcache_clients=trace,flightcli=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A local HTTP server that is aborted when dropped.
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Serves the `router` on an ephemeral port of localhost.
    ///
    /// Must be called from within a tokio runtime.
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

#[derive(Debug, Default)]
struct UsersState {
    users: BTreeMap<u64, String>,
    delay: Duration,
    hits: Mutex<BTreeMap<String, usize>>,
    failures: Mutex<BTreeMap<u64, usize>>,
}

impl UsersState {
    fn hit(&self, uri: &Uri) {
        let mut hits = self.hits.lock().unwrap();
        *hits.entry(uri.path().to_owned()).or_default() += 1;
    }
}

/// A users service speaking the `/v1/users/{id}` API.
///
/// The server knows the users `1: Alice`, `2: Bob` and `3: Carol`, and answers every request
/// after a short delay so that concurrent requests overlap. It also serves:
///
///  - `/garbage/v1/users/{id}`: responds with a body that is not a user.
///
/// All requests are counted per path, see [`accesses`](Self::accesses) and
/// [`all_hits`](Self::all_hits).
pub struct UsersServer {
    server: Server,
    state: Arc<UsersState>,
}

impl UsersServer {
    /// Starts a users server with a `50ms` response delay.
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(50))
    }

    /// Starts a users server that waits `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        let users = [(1, "Alice"), (2, "Bob"), (3, "Carol")]
            .into_iter()
            .map(|(id, name)| (id, name.to_owned()))
            .collect();
        let state = Arc::new(UsersState {
            users,
            delay,
            ..Default::default()
        });

        let router = Router::new()
            .route("/v1/users/:id", get(get_user))
            .route(
                "/garbage/*tail",
                get(
                    |State(state): State<Arc<UsersState>>, uri: Uri| async move {
                        state.hit(&uri);
                        uri.path().to_owned()
                    },
                ),
            )
            .with_state(Arc::clone(&state));

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// Makes the next `count` requests for user `id` fail with a `500` status.
    pub fn fail_next(&self, id: u64, count: usize) {
        self.state.failures.lock().unwrap().insert(id, count);
    }

    /// Returns the number of requests made since the last call, and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests made per path since the last call, and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for UsersServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn get_user(
    State(state): State<Arc<UsersState>>,
    Path(id): Path<String>,
    uri: Uri,
) -> Response {
    state.hit(&uri);
    tokio::time::sleep(state.delay).await;

    let Ok(id) = id.parse::<u64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    {
        let mut failures = state.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&id).filter(|remaining| **remaining > 0) {
            *remaining -= 1;
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    match state.users.get(&id) {
        Some(name) => Json(serde_json::json!({ "userId": id, "name": name })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
