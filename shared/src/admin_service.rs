use crate::http::{make_error_response, make_text_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

/// What `/ready` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

/// Serves `/health` (always ok) and `/ready` (driven by the probe) on the admin listener.
pub struct AdminService<F> {
    probe: F,
}

impl<F> AdminService<F>
where
    F: Fn() -> Readiness,
{
    pub fn new(probe: F) -> Self {
        Self { probe }
    }
}

impl<F> Service<Request<Incoming>> for AdminService<F>
where
    F: Fn() -> Readiness + Send + Sync + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = if req.method() != Method::GET && req.method() != Method::HEAD {
            make_error_response(StatusCode::METHOD_NOT_ALLOWED)
        } else {
            match req.uri().path() {
                "/health" => make_text_response(StatusCode::OK, "ok\n".to_string()),
                "/ready" => match (self.probe)() {
                    Readiness::Ready => make_text_response(StatusCode::OK, "ok\n".to_string()),
                    Readiness::NotReady(reason) => {
                        make_text_response(StatusCode::SERVICE_UNAVAILABLE, format!("{reason}\n"))
                    }
                },
                _ => make_error_response(StatusCode::NOT_FOUND),
            }
        };

        Box::pin(async move { Ok(res) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::run_http_service;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let fresh = Arc::new(AtomicBool::new(true));
        let probe_flag = fresh.clone();
        let service = AdminService::new(move || {
            if probe_flag.load(Ordering::Relaxed) {
                Readiness::Ready
            } else {
                Readiness::NotReady("relay rules are stale".to_string())
            }
        });

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        tokio::spawn(run_http_service("127.0.0.1", port, service, None));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(get(port, "/health").await.starts_with("HTTP/1.1 200"));
        assert!(get(port, "/ready").await.starts_with("HTTP/1.1 200"));

        fresh.store(false, Ordering::Relaxed);
        let response = get(port, "/ready").await;
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.ends_with("relay rules are stale\n"));

        assert!(get(port, "/other").await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_error_body() {
        let res = make_error_response::<Infallible>(StatusCode::NOT_FOUND);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"Not Found");
    }
}
