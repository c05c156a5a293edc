//! In-process HTTP server standing in for S3 and the CDN in tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

pub struct FakeResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Wait before answering at all.
    pub delay: Duration,
    /// Send the body one byte at a time with this gap before each byte.
    pub trickle: Option<Duration>,
}

impl FakeResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
            trickle: None,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn trickled(mut self, gap: Duration) -> Self {
        self.trickle = Some(gap);
        self
    }
}

type Responder = dyn Fn(&Method, &str, &str) -> FakeResponse + Send + Sync;

struct Logged {
    line: String,
    authorization: Option<String>,
}

#[derive(Clone)]
struct FakeState {
    responder: Arc<Responder>,
    log: Arc<Mutex<Vec<Logged>>>,
}

pub struct FakeServer {
    pub url: String,
    log: Arc<Mutex<Vec<Logged>>>,
}

impl FakeServer {
    /// Bind to an ephemeral port and answer every request with `responder(method, path, query)`.
    pub async fn spawn<F>(responder: F) -> Self
    where
        F: Fn(&Method, &str, &str) -> FakeResponse + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = FakeState {
            responder: Arc::new(responder),
            log: Arc::new(Mutex::new(Vec::new())),
        };
        let log = state.log.clone();
        let app = Router::new().fallback(handle).with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{}", addr),
            log,
        }
    }

    /// Every request seen so far as `METHOD /path?query`.
    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|l| l.line.clone()).collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.requests().iter().filter(|l| l.starts_with(prefix)).count()
    }

    pub fn exact_count(&self, line: &str) -> usize {
        self.requests().iter().filter(|l| *l == line).count()
    }

    pub fn authorizations(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|l| l.authorization.clone())
            .collect()
    }
}

/// A URL on a port nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

async fn handle(State(state): State<FakeState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let line = if query.is_empty() {
        format!("{} {}", method, path)
    } else {
        format!("{} {}?{}", method, path, query)
    };
    state.log.lock().unwrap().push(Logged {
        line,
        authorization,
    });

    let fake = (state.responder)(&method, &path, &query);
    let status = StatusCode::from_u16(fake.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if !fake.delay.is_zero() {
        tokio::time::sleep(fake.delay).await;
    }
    let Some(gap) = fake.trickle else {
        return (status, fake.body).into_response();
    };

    let (mut writer, reader) = tokio::io::duplex(64);
    let body = fake.body;
    tokio::spawn(async move {
        for byte in body {
            tokio::time::sleep(gap).await;
            if writer.write_all(&[byte]).await.is_err() {
                return;
            }
        }
    });
    (status, Body::from_stream(ReaderStream::new(reader))).into_response()
}
