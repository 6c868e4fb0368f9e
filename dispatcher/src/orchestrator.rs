use crate::body::{BackendResponse, RequestBody};
use crate::errors::RelayError;
use crate::metrics_defs::{RELAY_ATTEMPTS, RELAY_FAILOVERS};
use crate::transport::{Target, Transport, authority};
use http::header::{ACCEPT_RANGES, HeaderName, HeaderValue, LOCATION};
use http::{HeaderMap, Method};
use location::Location;
use shared::counter;
use url::Url;
use uuid::Uuid;

pub const X_OBJECT_MANIFEST: HeaderName = HeaderName::from_static("x-object-manifest");

/// A client request on its way to one cluster.
#[derive(Debug)]
pub struct RelayRequest {
    /// Correlation id carried by every log line of this request
    pub id: Uuid,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// `scheme://host:port` clients use to reach the dispatcher
    pub client_origin: String,
    pub routing_prefix: Option<String>,
}

impl RelayRequest {
    pub fn new(
        method: Method,
        headers: HeaderMap,
        body: RequestBody,
        client_origin: String,
        routing_prefix: Option<String>,
    ) -> Self {
        RelayRequest {
            id: Uuid::new_v4(),
            method,
            headers,
            body,
            client_origin,
            routing_prefix,
        }
    }

    /// Another request on behalf of the same client request.
    pub fn derive(&self, method: Method, headers: HeaderMap, body: RequestBody) -> Self {
        RelayRequest {
            id: self.id,
            method,
            headers,
            body,
            client_origin: self.client_origin.clone(),
            routing_prefix: self.routing_prefix.clone(),
        }
    }
}

/// Relays requests to the replicas of one cluster, failing over between them.
pub struct Orchestrator {
    transport: Transport,
    separator: char,
}

impl Orchestrator {
    pub fn new(transport: Transport, separator: char) -> Self {
        Orchestrator {
            transport,
            separator,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Sends `request` to the first candidate that answers.
    ///
    /// `segments` is the path the backend sees, already stripped of the routing prefix and
    /// of any container prefix.
    pub async fn relay(
        &self,
        request: &mut RelayRequest,
        target: &Url,
        segments: &[String],
        candidates: &[Url],
        location: &Location,
    ) -> Result<BackendResponse, RelayError> {
        let mut headers = request.headers.clone();
        if location.is_merged() {
            strip_manifest_prefix(&mut headers, self.separator);
        }

        for (attempt, server) in candidates.iter().enumerate() {
            let url = connect_url(server, target, segments);
            let proxy = location.cache_proxy_for(server).cloned();
            tracing::info!(
                relay_id = %request.id,
                method = %request.method,
                backend = %url,
                attempt = attempt + 1,
                "Relaying request"
            );

            let sent = self
                .transport
                .send(
                    &request.method,
                    &Target {
                        url: url.clone(),
                        proxy,
                    },
                    &headers,
                    &mut request.body,
                )
                .await;

            match sent {
                Ok(mut response) => {
                    counter!(RELAY_ATTEMPTS, "result" => "ok").increment(1);
                    tracing::info!(
                        relay_id = %request.id,
                        backend = %url,
                        status = response.status.as_u16(),
                        "Relay completed"
                    );
                    self.rewrite_location(&mut response, request, &url);
                    if response.body.is_streamed() {
                        response
                            .headers
                            .insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                    }
                    return Ok(response);
                }
                Err(e) => {
                    counter!(RELAY_ATTEMPTS, "result" => e.kind()).increment(1);
                    let remaining = candidates.len() - attempt - 1;
                    if remaining == 0 || !e.is_retryable() || request.body.is_consumed() {
                        tracing::info!(
                            relay_id = %request.id,
                            backend = %url,
                            error = %e,
                            "Relay failed"
                        );
                        return Err(e);
                    }
                    tracing::warn!(
                        relay_id = %request.id,
                        backend = %url,
                        error = %e,
                        remaining,
                        "Backend failed, trying the next replica"
                    );
                    counter!(RELAY_FAILOVERS, "error" => e.kind()).increment(1);
                }
            }
        }
        Err(RelayError::NoCandidates)
    }

    /// Points a `Location` header at the dispatcher when it names the backend just contacted.
    fn rewrite_location(&self, response: &mut BackendResponse, request: &RelayRequest, contacted: &Url) {
        let Some(location) = response.header_str(&LOCATION) else {
            return;
        };
        let Ok(location) = Url::parse(location) else {
            return;
        };
        let (Ok(ours), Ok(theirs)) = (authority(contacted), authority(&location)) else {
            return;
        };
        if ours != theirs {
            return;
        }

        let mut rewritten = request.client_origin.clone();
        if let Some(prefix) = &request.routing_prefix {
            rewritten.push('/');
            rewritten.push_str(prefix);
        }
        rewritten.push_str(location.path());
        if let Some(query) = location.query() {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            response.headers.insert(LOCATION, value);
        }
    }
}

/// Backend URL of one attempt: the server's scheme and authority with the relayed path
/// and the client's query.
pub fn connect_url(server: &Url, target: &Url, segments: &[String]) -> Url {
    let mut path = format!("/{}", segments.join("/"));
    if !segments.is_empty() && target.path().ends_with('/') && !path.ends_with('/') {
        path.push('/');
    }
    let mut url = server.clone();
    url.set_path(&path);
    url.set_query(target.query());
    url.set_fragment(None);
    url
}

/// `<prefix><sep><container>/<object>` becomes `<container>/<object>`.
fn strip_manifest_prefix(headers: &mut HeaderMap, separator: char) {
    let Some(manifest) = headers
        .get(X_OBJECT_MANIFEST)
        .and_then(|v| v.to_str().ok())
    else {
        return;
    };
    let manifest = manifest.trim_start_matches('/');
    let (container, rest) = match manifest.split_once('/') {
        Some((container, rest)) => (container, Some(rest)),
        None => (manifest, None),
    };
    let Some((_, container)) = container.split_once(separator) else {
        return;
    };
    let stripped = match rest {
        Some(rest) => format!("{container}/{rest}"),
        None => container.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&stripped) {
        headers.insert(X_OBJECT_MANIFEST, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutils::{
        RecordedRequest, response, response_with_headers, rules_file, spawn_backend,
        spawn_full_backend, spawn_stalling_backend, test_config,
    };
    use http::header::CONTENT_LENGTH;
    use http_body_util::Full;
    use bytes::Bytes;
    use http::StatusCode;
    use location::{LocationTable, Rules};
    use std::time::Duration;

    fn config() -> (tempfile::NamedTempFile, Config) {
        let rules = rules_file("locations: {}\n");
        let config = test_config(rules.path());
        (rules, config)
    }

    fn orchestrator(node_timeout: Duration) -> Orchestrator {
        let (_rules, config) = config();
        let transport = Transport::from_config(&config, None).with_node_timeout(node_timeout);
        Orchestrator::new(transport, ':')
    }

    fn location(yaml: &str, prefix: &str) -> Location {
        let table = LocationTable::build(Rules::from_yaml(yaml).unwrap(), ':').unwrap();
        table.get(prefix).unwrap().as_ref().clone()
    }

    fn request(method: Method, body: RequestBody) -> RelayRequest {
        RelayRequest::new(
            method,
            HeaderMap::new(),
            body,
            "http://dispatcher:8000".to_string(),
            Some("tokyo".to_string()),
        )
    }

    fn segments(path: &str) -> Vec<String> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_connect_url() {
        let server = Url::parse("https://swift-a1:8443").unwrap();
        let target = Url::parse("http://dispatcher:8000/tokyo/v1.0/AUTH_a/c/?format=json").unwrap();
        let url = connect_url(&server, &target, &segments("v1.0/AUTH_a/c"));
        assert_eq!(url.as_str(), "https://swift-a1:8443/v1.0/AUTH_a/c/?format=json");

        let target = Url::parse("http://dispatcher:8000/tokyo/v1.0/AUTH_a/c/o%20bj").unwrap();
        let url = connect_url(&server, &target, &segments("v1.0/AUTH_a/c/o%20bj"));
        assert_eq!(url.as_str(), "https://swift-a1:8443/v1.0/AUTH_a/c/o%20bj");
    }

    #[test]
    fn test_strip_manifest_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(X_OBJECT_MANIFEST, HeaderValue::from_static("a:videos_segments/movie/"));
        strip_manifest_prefix(&mut headers, ':');
        assert_eq!(headers.get(X_OBJECT_MANIFEST).unwrap(), "videos_segments/movie/");

        let mut headers = HeaderMap::new();
        headers.insert(X_OBJECT_MANIFEST, HeaderValue::from_static("plain/movie"));
        strip_manifest_prefix(&mut headers, ':');
        assert_eq!(headers.get(X_OBJECT_MANIFEST).unwrap(), "plain/movie");
    }

    #[tokio::test]
    async fn test_relay_and_location_rewrite() {
        let backend = spawn_backend(|req: &RecordedRequest| {
            let location = format!("http://{}{}", req.header("host").unwrap(), "/v1.0/AUTH_a/c/o?x=1");
            let mut resp = response_with_headers(StatusCode::CREATED, &[], "");
            resp.headers_mut()
                .insert(LOCATION, HeaderValue::from_str(&location).unwrap());
            resp
        })
        .await;
        let yaml = format!("locations:\n  tokyo:\n    clusters:\n      - servers: [{}]\n", backend.url);
        let location = location(&yaml, "tokyo");

        let target = Url::parse("http://dispatcher:8000/tokyo/v1.0/AUTH_a/c/o").unwrap();
        let mut request = request(Method::POST, RequestBody::Empty);
        let response = orchestrator(Duration::from_secs(2))
            .relay(
                &mut request,
                &target,
                &segments("v1.0/AUTH_a/c/o"),
                &location.clusters()[0],
                &location,
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(
            response.header_str(&LOCATION),
            Some("http://dispatcher:8000/tokyo/v1.0/AUTH_a/c/o?x=1")
        );
        assert_eq!(backend.requests()[0].uri, "/v1.0/AUTH_a/c/o");
    }

    #[tokio::test]
    async fn test_failover_to_third_replica() {
        let first = spawn_stalling_backend(Duration::from_secs(5)).await;
        let second = spawn_stalling_backend(Duration::from_secs(5)).await;
        let third = spawn_backend(|_: &RecordedRequest| response(StatusCode::OK, "found")).await;
        let yaml = format!(
            "locations:\n  tokyo:\n    clusters:\n      - servers: [{}, {}, {}]\n",
            first.url, second.url, third.url
        );
        let location = location(&yaml, "tokyo");

        let target = Url::parse("http://dispatcher:8000/tokyo/v1.0/AUTH_a/c/o").unwrap();
        let mut request = request(Method::GET, RequestBody::Empty);
        let response = orchestrator(Duration::from_millis(200))
            .relay(
                &mut request,
                &target,
                &segments("v1.0/AUTH_a/c/o"),
                &location.clusters()[0],
                &location,
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.collect().await.unwrap(), Bytes::from("found"));
        assert_eq!(first.connections(), 1);
        assert_eq!(second.connections(), 1);
        assert_eq!(third.connections(), 1);
    }

    #[tokio::test]
    async fn test_failover_on_insufficient_storage() {
        let full = spawn_full_backend().await;
        let second = spawn_backend(|_: &RecordedRequest| response(StatusCode::CREATED, "")).await;
        let yaml = format!(
            "locations:\n  tokyo:\n    clusters:\n      - servers: [{}, {}]\n",
            full.url, second.url
        );
        let location = location(&yaml, "tokyo");

        let target = Url::parse("http://dispatcher:8000/tokyo/v1.0/AUTH_a/c/o").unwrap();
        let body = RequestBody::from_body(Full::new(Bytes::from_static(b"meow")));
        let mut request = request(Method::PUT, body);
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("4"));
        let response = orchestrator(Duration::from_secs(2))
            .relay(
                &mut request,
                &target,
                &segments("v1.0/AUTH_a/c/o"),
                &location.clusters()[0],
                &location,
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(full.connections(), 1);
        let seen = second.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].uri, "/v1.0/AUTH_a/c/o");
        assert_eq!(seen[0].body, "meow");
        assert!(request.body.is_consumed());
    }

    #[tokio::test]
    async fn test_last_error_is_returned() {
        let first = spawn_stalling_backend(Duration::from_secs(5)).await;
        let yaml = format!("locations:\n  tokyo:\n    clusters:\n      - servers: [{}]\n", first.url);
        let location = location(&yaml, "tokyo");

        let target = Url::parse("http://dispatcher:8000/tokyo/v1.0/AUTH_a/c/o").unwrap();
        let mut request = request(Method::GET, RequestBody::Empty);
        let err = orchestrator(Duration::from_millis(100))
            .relay(
                &mut request,
                &target,
                &segments("v1.0/AUTH_a/c/o"),
                &location.clusters()[0],
                &location,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NodeTimeout(_)));
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let location = location(
            "locations:\n  tokyo:\n    clusters:\n      - servers: [http://127.0.0.1:9]\n",
            "tokyo",
        );
        let target = Url::parse("http://dispatcher:8000/tokyo/v1.0/AUTH_a").unwrap();
        let mut request = request(Method::GET, RequestBody::Empty);
        let err = orchestrator(Duration::from_secs(1))
            .relay(&mut request, &target, &segments("v1.0/AUTH_a"), &[], &location)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoCandidates));
    }

    #[tokio::test]
    async fn test_streamed_response_accepts_ranges() {
        let big: &'static str = Box::leak("x".repeat(10_000).into_boxed_str());
        let backend = spawn_backend(move |_: &RecordedRequest| response(StatusCode::OK, big)).await;
        let yaml = format!("locations:\n  tokyo:\n    clusters:\n      - servers: [{}]\n", backend.url);
        let location = location(&yaml, "tokyo");

        let target = Url::parse("http://dispatcher:8000/tokyo/v1.0/AUTH_a/c/big").unwrap();
        let mut request = request(Method::GET, RequestBody::Empty);
        let response = orchestrator(Duration::from_secs(2))
            .relay(
                &mut request,
                &target,
                &segments("v1.0/AUTH_a/c/big"),
                &location.clusters()[0],
                &location,
            )
            .await
            .unwrap();
        assert!(response.body.is_streamed());
        assert_eq!(response.header_str(&ACCEPT_RANGES), Some("bytes"));
        assert_eq!(response.body.collect().await.unwrap().len(), big.len());
    }
}
