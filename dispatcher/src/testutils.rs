use crate::config::Config;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

/// A request as seen by a mock backend.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    /// Path and query
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub struct MockBackend {
    pub url: Url,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockBackend {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

type Handler = dyn Fn(&RecordedRequest) -> Response<Full<Bytes>> + Send + Sync;

/// Serves every request with `handler`, recording what it received.
pub async fn spawn_backend<F>(handler: F) -> MockBackend
where
    F: Fn(&RecordedRequest) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let handler: Arc<Handler> = Arc::new(handler);

    let counted = connections.clone();
    let recorded = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counted.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            let recorded = recorded.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                let recorded = recorded.clone();
                async move {
                    let (parts, body) = req.into_parts();
                    let body = body
                        .collect()
                        .await
                        .map(|collected| collected.to_bytes())
                        .unwrap_or_default();
                    let request = RecordedRequest {
                        method: parts.method,
                        uri: parts.uri.to_string(),
                        headers: parts.headers,
                        body,
                    };
                    let response = handler(&request);
                    recorded.lock().unwrap().push(request);
                    Ok::<_, Infallible>(response)
                }
            });
            tokio::spawn(async move {
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    MockBackend {
        url,
        connections,
        requests,
    }
}

/// Accepts connections and never answers.
pub async fn spawn_stalling_backend(hold: Duration) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counted = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                drop(stream);
            });
        }
    });

    MockBackend {
        url,
        connections,
        requests: Arc::new(Mutex::new(Vec::new())),
    }
}

/// Answers the head of every request with `507 Insufficient Storage`, before any body
/// is sent.
pub async fn spawn_full_backend() -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counted = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 507 Insufficient Storage\r\nContent-Length: 0\r\n\r\n")
                    .await;
            });
        }
    });

    MockBackend {
        url,
        connections,
        requests: Arc::new(Mutex::new(Vec::new())),
    }
}

pub fn response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

pub fn response_with_headers(
    status: StatusCode,
    headers: &[(&'static str, &str)],
    body: &'static str,
) -> Response<Full<Bytes>> {
    let mut response = response(status, body);
    for (name, value) in headers {
        response
            .headers_mut()
            .append(*name, value.parse().unwrap());
    }
    response
}

pub fn rules_file(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Dispatcher config listening on 127.0.0.1:8000 with the given rule file.
pub fn test_config(relay_rule: &Path) -> Config {
    let yaml = format!(
        r#"
listener: {{host: "127.0.0.1", port: 8000}}
admin_listener: {{host: "127.0.0.1", port: 8001}}
relay_rule: {}
min_reload_interval_ms: 0
timeouts: {{connect_ms: 500, expect_secs: 2, client_secs: 2, node_secs: 2}}
response_retry: {{attempts: 2, backoff_ms: 10}}
"#,
        relay_rule.display()
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.validate().unwrap();
    config
}
