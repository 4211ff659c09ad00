#![allow(dead_code)]

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
    Router,
};
use metered_gateway::{
    build_router,
    config::Config,
    credentials::{ApiKeyRecord, KeyPolicy},
    db,
    owners::{NewOwner, Owner},
    AppState,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tower::ServiceExt;

pub struct Harness {
    pub state: Arc<AppState>,
    router: Router,
    _dir: TempDir,
}

impl Harness {
    /// A gateway backed by a fresh on-disk database, forwarding to `upstream`.
    pub async fn start(upstream: &str, env: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("gateway.db");

        let mut vars: HashMap<String, String> = HashMap::from([
            ("UPSTREAM_URL".to_string(), upstream.to_string()),
            ("COST_PER_1K_TOKENS".to_string(), "1.0".to_string()),
            ("DATABASE_PATH".to_string(), db_path.display().to_string()),
        ]);
        for (k, v) in env {
            vars.insert(k.to_string(), v.to_string());
        }
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();

        let pool = db::connect(&config.database_path, 4).await.unwrap();
        let state = AppState::new(Arc::new(config), pool).unwrap();
        let router = build_router(state.clone());
        Self {
            state,
            router,
            _dir: dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Serve the router on an ephemeral local port, so callers can hang up
    /// the way a real client does.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// An active owner with a single key under `policy`.
    pub async fn owner_with_key(&self, username: &str, policy: KeyPolicy) -> (Owner, ApiKeyRecord, String) {
        let owner = self
            .state
            .owners
            .create(NewOwner::named(username))
            .await
            .unwrap();
        let (key, secret) = self.state.credentials.issue(owner.id, policy).await.unwrap();
        (owner, key, secret)
    }

    /// Poll until the key has `count` usage records; streamed calls settle
    /// after the response body has been handed back.
    pub async fn wait_for_usage(&self, key_id: i64, count: usize) {
        for _ in 0..250 {
            let records = self
                .state
                .usage
                .list_by_key(key_id, Default::default(), Default::default())
                .await
                .unwrap();
            if records.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("usage for key {key_id} never reached {count} records");
    }
}

pub fn chat_request(secret: &str, body: serde_json::Value) -> Request<Body> {
    Request::post("/v1/chat/completions")
        .header("authorization", format!("Bearer {secret}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> bytes::Bytes {
    to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// What a scripted upstream does after writing its canned reply.
#[derive(Clone)]
pub enum AfterReply {
    /// Keep the connection open and silent.
    Hang,
    /// Close the connection.
    Close,
    /// Write these bytes every 100 ms until the gateway goes away.
    Trickle(&'static [u8]),
}

/// A bare TCP upstream answering every request with `reply` verbatim, for
/// responses httpmock cannot shape (truncated bodies, open-ended streams).
pub async fn scripted_upstream(reply: &'static [u8], after: AfterReply) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let after = after.clone();
            tokio::spawn(async move {
                read_request(&mut stream).await;
                if stream.write_all(reply).await.is_err() {
                    return;
                }
                match after {
                    AfterReply::Hang => tokio::time::sleep(Duration::from_secs(30)).await,
                    AfterReply::Close => {
                        let _ = stream.shutdown().await;
                    }
                    AfterReply::Trickle(bytes) => {
                        for _ in 0..100 {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            if stream.write_all(bytes).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    format!("http://{addr}")
}

/// Consume one request: headers plus a `content-length` body.
async fn read_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + length {
            return;
        }
    }
}
