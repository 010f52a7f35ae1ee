//! In-process stand-in for the Kubernetes API server.

use http::{Request, Response};
use http_body_util::BodyExt;
use kube::{Client, client::Body};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};
use tower::Service;

/// Watch requests are answered after this delay, so a watcher re-watching a
/// finished response does not spin.
const WATCH_DELAY: Duration = Duration::from_millis(50);

/// A request the mock received.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: String,
}

/// Answers requests with canned responses keyed by exact method and path.
/// Unmatched requests get a 404 Status, unmatched watches an empty stream.
#[derive(Clone, Default)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, method: &str, path: &str, status: u16, body: String) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), (status, body));
        self
    }

    pub fn on_get(self, path: &str, status: u16, body: String) -> Self {
        self.on("GET", path, status, body)
    }

    /// Serve `events`, newline separated watch events, to every watch of `path`.
    pub fn on_watch(self, path: &str, events: &[serde_json::Value]) -> Self {
        let body: String = events.iter().map(|e| format!("{}\n", e)).collect();
        self.on("WATCH", path, 200, body)
    }

    pub fn client(&self) -> Client {
        Client::new(self.clone(), "default")
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of reads of `path`, watches excluded.
    pub fn gets(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == "GET" && r.path == path)
            .count()
    }

    /// Requests other than reads and watches.
    pub fn writes(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != "GET" && r.method != "WATCH")
            .collect()
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let watch = req
            .uri()
            .query()
            .is_some_and(|q| q.split('&').any(|p| p == "watch=true"));
        let method = if watch {
            "WATCH".to_string()
        } else {
            req.method().to_string()
        };
        let path = req.uri().path().to_string();
        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&(method.clone(), path.clone()))
            .cloned();
        let requests = self.requests.clone();
        Box::pin(async move {
            if watch {
                tokio::time::sleep(WATCH_DELAY).await;
            }
            let body = match req.into_body().collect().await {
                Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).to_string(),
                Err(_) => String::new(),
            };
            requests.lock().unwrap().push(Recorded {
                method,
                path: path.clone(),
                body,
            });
            let (status, body) = match response {
                Some(response) => response,
                None if watch => (200, String::new()),
                None => (404, status_json(404, &path)),
            };
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// A `metav1.Status` failure body.
pub fn status_json(code: u16, message: &str) -> String {
    let reason = match code {
        404 => "NotFound",
        409 => "Conflict",
        _ => "InternalError",
    };
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code
    })
    .to_string()
}

pub fn pod_json(namespace: &str, name: &str, uid: &str) -> String {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": uid
        }
    })
    .to_string()
}
