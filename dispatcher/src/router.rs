use crate::body::{BackendResponse, DispatchBody, RequestBody, ResponseBody};
use crate::config::Config;
use crate::copy::{CopyJob, CrossClusterCopy};
use crate::errors::{DispatchError, RelayError, Result};
use crate::merger::{
    Merger, X_AUTH_TOKEN, X_STORAGE_TOKEN, X_STORAGE_URL, check_error_resp, split_token,
    with_cluster_token,
};
use crate::metrics_defs::{MERGED_REQUESTS, REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::orchestrator::{Orchestrator, RelayRequest};
use crate::paths::{
    MergePath, RequestPath, X_COPY_FROM, copy_to_put, replace_query_param, request_token,
};
use crate::rewrite::{PublicOrigin, add_manifest_prefix};
use crate::transport::Transport;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use http::request::Parts;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use location::{Location, LocationResolver};
use shared::http::{make_error_response, make_text_response};
use shared::{counter, gauge, histogram};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tokio::task::JoinSet;
use url::Url;

/// Added to every response the dispatcher produces.
pub const X_COLONY_DISPATCHER: HeaderName = HeaderName::from_static("x-colony-dispatcher");

/// Routes each client request to the clusters of its location and shapes the answer.
pub struct Dispatcher {
    resolver: Arc<LocationResolver>,
    orchestrator: Arc<Orchestrator>,
    merger: Merger,
    origin: PublicOrigin,
    separator: char,
    segment_size: u64,
    inflight: AtomicI64,
}

/// Counts one request as in flight until dropped, also when the client goes away
/// mid-request and the handler future is cancelled.
struct InflightGuard<'a> {
    count: &'a AtomicI64,
}

impl<'a> InflightGuard<'a> {
    fn enter(count: &'a AtomicI64) -> Self {
        let now = count.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!(REQUESTS_INFLIGHT).set(now as f64);
        InflightGuard { count }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let now = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        gauge!(REQUESTS_INFLIGHT).set(now as f64);
    }
}

impl Dispatcher {
    pub fn new(config: &Config, resolver: Arc<LocationResolver>, transport: Transport) -> Self {
        let scheme = if config.tls.is_some() { "https" } else { "http" };
        let origin = PublicOrigin::new(scheme, config.public_host(), config.listener.port);
        let separator = config.separator();
        Dispatcher {
            resolver,
            orchestrator: Arc::new(Orchestrator::new(transport, separator)),
            merger: Merger::new(origin.clone(), separator),
            origin,
            separator,
            segment_size: config.segment_size(),
            inflight: AtomicI64::new(0),
        }
    }

    /// Requests currently being handled.
    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Picks up relay rule changes. The rule source is read on the blocking pool.
    async fn reload_rules(&self) {
        if !self.resolver.reload_due() {
            return;
        }
        let resolver = self.resolver.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || resolver.reload()).await {
            tracing::error!(error = %e, "Relay rule reload task failed");
        }
    }

    pub async fn handle<B>(&self, request: Request<B>) -> Response<DispatchBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<crate::body::BoxError>,
    {
        let start = Instant::now();
        let _inflight = InflightGuard::enter(&self.inflight);
        self.reload_rules().await;

        let (parts, body) = request.into_parts();
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let path = RequestPath::parse(uri.path());
        let location = path
            .prefix
            .as_deref()
            .and_then(|prefix| self.resolver.resolve(prefix));

        let (mode, result) = match location {
            None => ("none", Err(DispatchError::NotFound)),
            Some(location) if location.is_merged() => {
                let body = RequestBody::from_body(body);
                let result = self
                    .dispatch_merged(parts, body, path.segments, location)
                    .await;
                ("merged", result)
            }
            Some(location) => {
                let body = RequestBody::from_body(body);
                let result = self
                    .dispatch_normal(parts, body, path.segments, location)
                    .await;
                ("normal", result)
            }
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::info!(method = %method, uri = %uri, error = %e, "Request failed");
                error_response(&e)
            }
        };
        response.headers_mut().insert(
            X_COLONY_DISPATCHER,
            HeaderValue::from_static("dispatcher processed"),
        );

        histogram!(
            REQUEST_DURATION,
            "mode" => mode,
            "status" => response.status().as_str().to_string()
        )
        .record(start.elapsed().as_secs_f64());
        response
    }

    /// One cluster: relay, then move storage URLs under the dispatcher.
    async fn dispatch_normal(
        &self,
        parts: Parts,
        body: RequestBody,
        segments: Vec<String>,
        location: Arc<Location>,
    ) -> Result<Response<DispatchBody>> {
        let target = self.client_target(&parts.uri)?;
        let (method, headers, segments) = rewrite_copy(parts.method, parts.headers, segments)?;
        let mut request = self.relay_request(method, headers, body, &location);
        let candidates = location
            .clusters()
            .first()
            .ok_or(RelayError::NoCandidates)?;

        let mut response = self
            .orchestrator
            .relay(&mut request, &target, &segments, candidates, &location)
            .await?;

        let prefix = Some(location.prefix());
        self.origin
            .rewrite_storage_header(&mut response.headers, prefix);
        let carries_storage = [X_STORAGE_URL, X_AUTH_TOKEN, X_STORAGE_TOKEN]
            .iter()
            .all(|name| response.headers.contains_key(name));
        if carries_storage && response.content_length().is_some_and(|len| len > 0) {
            let body = std::mem::replace(&mut response.body, ResponseBody::Buffered(Bytes::new()))
                .collect()
                .await?;
            let body = self
                .origin
                .rewrite_storage_body(&body, prefix)
                .unwrap_or(body);
            response
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            response.body = ResponseBody::Buffered(body);
        }
        Ok(response.into_response())
    }

    async fn dispatch_merged(
        &self,
        parts: Parts,
        body: RequestBody,
        segments: Vec<String>,
        location: Arc<Location>,
    ) -> Result<Response<DispatchBody>> {
        let target = self.client_target(&parts.uri)?;
        let (method, headers, mut segments) =
            rewrite_copy(parts.method, parts.headers, segments)?;
        let mut request = self.relay_request(method, headers, body, &location);

        let Some(token) = request_token(&request.headers).map(str::to_owned) else {
            counter!(MERGED_REQUESTS, "kind" => "auth").increment(1);
            return self
                .merged_auth(&mut request, &target, &segments, &location)
                .await;
        };
        let tokens = || split_token(&token).ok_or(DispatchError::Unauthorized);

        let shape = MergePath::parse(
            &request.method,
            &segments,
            target.query(),
            &request.headers,
            self.separator,
        );
        match shape {
            MergePath::Account { .. } => {
                counter!(MERGED_REQUESTS, "kind" => "listing").increment(1);
                self.merged_account(&mut request, &target, &segments, &location, &tokens()?)
                    .await
            }
            MergePath::AccountWithMarker { marker, .. } => {
                counter!(MERGED_REQUESTS, "kind" => "listing").increment(1);
                self.merged_marker(
                    &mut request,
                    &target,
                    &segments,
                    &location,
                    &marker,
                    &tokens()?,
                )
                .await
            }
            MergePath::ContainerObject { container, .. } => {
                counter!(MERGED_REQUESTS, "kind" => "object").increment(1);
                let index = cluster_of(&location, &container.prefix)?;
                let token = cluster_token(&tokens()?, index)?;
                request.headers = with_cluster_token(&request.headers, token);
                segments[2] = container.container;

                let mut response = self
                    .orchestrator
                    .relay(
                        &mut request,
                        &target,
                        &segments,
                        &location.clusters()[index],
                        &location,
                    )
                    .await?;
                add_manifest_prefix(&mut response.headers, &container.prefix, self.separator);
                Ok(response.into_response())
            }
            MergePath::Copy {
                account,
                container,
                object,
                source,
            } => {
                counter!(MERGED_REQUESTS, "kind" => "copy").increment(1);
                let source = source.ok_or(DispatchError::NotFound)?;
                let tokens = tokens()?;

                if source.container.prefix != container.prefix {
                    let copy = CrossClusterCopy {
                        orchestrator: &self.orchestrator,
                        location: &location,
                        segment_size: self.segment_size,
                    };
                    let job = CopyJob {
                        version: &segments[0],
                        account: &account,
                        source: &source,
                        destination: &container,
                        object: &object,
                    };
                    return Ok(copy.run(&mut request, &tokens, &job).await?.into_response());
                }

                let index = cluster_of(&location, &container.prefix)?;
                let token = cluster_token(&tokens, index)?;
                let mut headers = with_cluster_token(&request.headers, token);
                let copy_from = format!("/{}/{}", source.container.container, source.object);
                let copy_from = HeaderValue::from_str(&copy_from)
                    .map_err(|e| DispatchError::BadRequest(e.to_string()))?;
                headers.insert(X_COPY_FROM, copy_from);
                request.headers = headers;
                segments[2] = container.container;

                let response = self
                    .orchestrator
                    .relay(
                        &mut request,
                        &target,
                        &segments,
                        &location.clusters()[index],
                        &location,
                    )
                    .await?;
                Ok(response.into_response())
            }
            MergePath::UnprefixedContainer | MergePath::Unroutable => Err(DispatchError::NotFound),
        }
    }

    /// Authenticates against every cluster and joins the tokens.
    async fn merged_auth(
        &self,
        request: &mut RelayRequest,
        target: &Url,
        segments: &[String],
        location: &Arc<Location>,
    ) -> Result<Response<DispatchBody>> {
        let mut responses = self
            .fan_out(request, target, segments, location, None)
            .await?;
        if let Some(worst) = check_error_resp(&mut responses) {
            return Ok(worst.into_response());
        }
        responses.retain(|r| r.status == StatusCode::OK);

        let (headers, bodies) = collect_responses(responses).await?;
        let headers: Vec<&HeaderMap> = headers.iter().collect();
        let merged = self.merger.merge_headers(location.prefix(), &headers);
        let body = self
            .merger
            .merge_storage_body(location.prefix(), &bodies)
            .unwrap_or_default();
        Ok(merged_response(merged, body))
    }

    /// Lists the account on every cluster and merges the listings.
    async fn merged_account(
        &self,
        request: &mut RelayRequest,
        target: &Url,
        segments: &[String],
        location: &Arc<Location>,
        tokens: &[&str],
    ) -> Result<Response<DispatchBody>> {
        let mut responses = self
            .fan_out(request, target, segments, location, Some(tokens))
            .await?;
        if let Some(worst) = check_error_resp(&mut responses) {
            return Ok(worst.into_response());
        }
        let prefixes: Vec<&str> = location
            .container_prefixes()
            .map(Option::unwrap_or_default)
            .collect();
        self.merge_listing(request.method == Method::GET, location, responses, &prefixes)
            .await
    }

    /// Continues a listing on the cluster owning the marker's container prefix.
    async fn merged_marker(
        &self,
        request: &mut RelayRequest,
        target: &Url,
        segments: &[String],
        location: &Arc<Location>,
        marker: &str,
        tokens: &[&str],
    ) -> Result<Response<DispatchBody>> {
        let (prefix, bare_marker) = marker
            .split_once(self.separator)
            .ok_or(DispatchError::NotFound)?;
        let index = cluster_of(location, prefix)?;
        let token = cluster_token(tokens, index)?;
        request.headers = with_cluster_token(&request.headers, token);

        let query = replace_query_param(target.query(), "marker", bare_marker);
        let mut target = target.clone();
        target.set_query(Some(&query));

        let response = self
            .orchestrator
            .relay(
                request,
                &target,
                segments,
                &location.clusters()[index],
                location,
            )
            .await?;
        if !response.is_success() {
            return Ok(response.into_response());
        }
        self.merge_listing(
            request.method == Method::GET,
            location,
            vec![response],
            &[prefix],
        )
        .await
    }

    async fn merge_listing(
        &self,
        with_body: bool,
        location: &Location,
        responses: Vec<BackendResponse>,
        prefixes: &[&str],
    ) -> Result<Response<DispatchBody>> {
        let (headers, bodies) = collect_responses(responses).await?;
        let headers: Vec<&HeaderMap> = headers.iter().collect();
        let merged = self.merger.merge_headers(location.prefix(), &headers);

        let content_type = merged
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = match content_type {
            Some(content_type) if with_body => self
                .merger
                .merge_container_listings(&content_type, &bodies, prefixes)?
                .unwrap_or_default(),
            _ => Bytes::new(),
        };
        Ok(merged_response(merged, body))
    }

    /// Sends `request` to every cluster of `location` concurrently. Responses come back in
    /// cluster order; a cluster that could not be reached is represented by an error
    /// response carrying the status of the failure.
    async fn fan_out(
        &self,
        request: &mut RelayRequest,
        target: &Url,
        segments: &[String],
        location: &Arc<Location>,
        tokens: Option<&[&str]>,
    ) -> Result<Vec<BackendResponse>> {
        let transport = self.orchestrator.transport();
        let limit = transport.max_file_size();
        let declared_length = request
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if declared_length.is_some_and(|length| length > limit) {
            return Err(RelayError::PayloadTooLarge { limit }.into());
        }
        request
            .body
            .buffer(limit, transport.client_timeout())
            .await?;

        let clusters = location.clusters();
        let mut tasks = JoinSet::new();
        for (index, servers) in clusters.iter().enumerate() {
            let headers = match tokens {
                Some(tokens) => with_cluster_token(&request.headers, cluster_token(tokens, index)?),
                None => request.headers.clone(),
            };
            let body = request.body.take();
            let method = request.method.clone();
            let mut relayed = request.derive(method, headers, body);

            let orchestrator = self.orchestrator.clone();
            let location = location.clone();
            let target = target.clone();
            let segments = segments.to_vec();
            let servers = servers.clone();
            tasks.spawn(async move {
                let result = orchestrator
                    .relay(&mut relayed, &target, &segments, &servers, &location)
                    .await;
                (index, result)
            });
        }

        let mut responses: Vec<Option<BackendResponse>> = clusters.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| DispatchError::Internal(e.to_string()))?;
            responses[index] = Some(result.unwrap_or_else(|e| failed_response(&e)));
        }
        Ok(responses.into_iter().flatten().collect())
    }

    fn relay_request(
        &self,
        method: Method,
        headers: HeaderMap,
        body: RequestBody,
        location: &Location,
    ) -> RelayRequest {
        RelayRequest::new(
            method,
            headers,
            body,
            self.origin.as_str().to_string(),
            Some(location.prefix().to_string()),
        )
    }

    /// The client's URL as seen through the dispatcher.
    fn client_target(&self, uri: &Uri) -> Result<Url> {
        Url::parse(&self.origin.url_for(None, uri.path(), uri.query()))
            .map_err(|e| DispatchError::BadRequest(e.to_string()))
    }
}

/// Turns `COPY` into a `PUT` with `X-Copy-From`; other requests pass through.
fn rewrite_copy(
    method: Method,
    mut headers: HeaderMap,
    segments: Vec<String>,
) -> Result<(Method, HeaderMap, Vec<String>)> {
    if method.as_str() != "COPY" {
        return Ok((method, headers, segments));
    }
    let segments = copy_to_put(&segments, &mut headers).map_err(DispatchError::CopyRequest)?;
    Ok((Method::PUT, headers, segments))
}

fn cluster_of(location: &Location, prefix: &str) -> Result<usize> {
    location
        .cluster_index_by_container_prefix(prefix)
        .ok_or(DispatchError::NotFound)
}

fn cluster_token<'t>(tokens: &[&'t str], index: usize) -> Result<&'t str> {
    tokens
        .get(index)
        .copied()
        .ok_or(DispatchError::Unauthorized)
}

async fn collect_responses(
    responses: Vec<BackendResponse>,
) -> Result<(Vec<HeaderMap>, Vec<Bytes>)> {
    let mut headers = Vec::with_capacity(responses.len());
    let mut bodies = Vec::with_capacity(responses.len());
    for response in responses {
        headers.push(response.headers);
        bodies.push(response.body.collect().await?);
    }
    Ok((headers, bodies))
}

fn failed_response(error: &RelayError) -> BackendResponse {
    let status = error.status();
    let reason = status.canonical_reason().unwrap_or("an error occurred");
    BackendResponse::buffered(status, HeaderMap::new(), Bytes::from_static(reason.as_bytes()))
}

fn merged_response(mut headers: HeaderMap, body: Bytes) -> Response<DispatchBody> {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    BackendResponse::buffered(StatusCode::OK, headers, body).into_response()
}

fn error_response(error: &DispatchError) -> Response<DispatchBody> {
    match error {
        DispatchError::CopyRequest(message) => make_text_response(error.status(), message.clone()),
        _ => make_error_response(error.status()),
    }
}

/// hyper entry point wrapping a shared [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherService {
    dispatcher: Arc<Dispatcher>,
}

impl DispatcherService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        DispatcherService { dispatcher }
    }
}

impl Service<Request<Incoming>> for DispatcherService {
    type Response = Response<DispatchBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move { Ok(dispatcher.handle(request).await) })
    }
}
