//! In-process stand-in for the regulator API.
//!
//! `POST /submit` answers from a script of queued responses and falls back to
//! an accepted response with a fresh timestamp. `POST /auth/refresh` hands out
//! `fresh-token`.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};

#[derive(Debug, Clone)]
pub struct Submission {
    pub body: Value,
    pub authorization: Option<String>,
    pub api_key: Option<String>,
    pub signature: Option<String>,
}

#[derive(Default)]
struct RegulatorState {
    script: Mutex<VecDeque<(StatusCode, Value)>>,
    submissions: Mutex<Vec<Submission>>,
    refreshes: AtomicUsize,
    accepted: AtomicUsize,
}

pub struct MockRegulator {
    addr: SocketAddr,
    state: Arc<RegulatorState>,
    handle: JoinHandle<()>,
}

impl MockRegulator {
    pub async fn start() -> Self {
        let state = Arc::new(RegulatorState::default());
        let router = Router::new()
            .route("/submit", post(submit))
            .route("/auth/refresh", post(refresh))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, state, handle }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queue the next response for `/submit`.
    pub fn respond_with(&self, status: u16, body: Value) {
        self.state
            .script
            .lock()
            .unwrap()
            .push_back((StatusCode::from_u16(status).unwrap(), body));
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.submissions.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> usize {
        self.state.refreshes.load(Ordering::SeqCst)
    }
}

impl Drop for MockRegulator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn submit(
    State(state): State<Arc<RegulatorState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.submissions.lock().unwrap().push(Submission {
        body,
        authorization: header(&headers, "authorization"),
        api_key: header(&headers, "x-api-key"),
        signature: header(&headers, "x-signature"),
    });

    let scripted = state.script.lock().unwrap().pop_front();
    match scripted {
        Some((status, body)) => (status, Json(body)),
        None => {
            let n = state.accepted.fetch_add(1, Ordering::SeqCst) + 1;
            (
                StatusCode::OK,
                Json(json!({
                    "status": "accepted",
                    "transmission_id": format!("FIRS-{n}"),
                    "timestamp": Utc::now().timestamp(),
                })),
            )
        }
    }
}

async fn refresh(State(state): State<Arc<RegulatorState>>) -> Json<Value> {
    state.refreshes.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "session_token": "fresh-token" }))
}
