//! Copying an object between two clusters of a merged location.
//!
//! Clusters cannot copy from each other, so the dispatcher reads the source object
//! and writes it to the destination cluster itself. Objects of at least
//! `segment_size` bytes are written as segments plus a manifest object.

use crate::body::{BackendResponse, RequestBody};
use crate::errors::{DispatchError, RelayError, Result};
use crate::merger::with_cluster_token;
use crate::orchestrator::{Orchestrator, RelayRequest, X_OBJECT_MANIFEST};
use crate::paths::{CopySource, PrefixedContainer, X_COPY_FROM, decode, encode_path};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use location::Location;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Source and destination of one cross-cluster copy.
pub struct CopyJob<'a> {
    pub version: &'a str,
    pub account: &'a str,
    pub source: &'a CopySource,
    pub destination: &'a PrefixedContainer,
    /// Percent-encoded destination object name
    pub object: &'a str,
}

pub struct CrossClusterCopy<'a> {
    pub orchestrator: &'a Orchestrator,
    pub location: &'a Location,
    pub segment_size: u64,
}

impl CrossClusterCopy<'_> {
    /// Runs `job` on behalf of `request`. A failing backend answer ends the copy and is
    /// returned as is; segments written before it stay on the destination cluster.
    pub async fn run(
        &self,
        request: &mut RelayRequest,
        tokens: &[&str],
        job: &CopyJob<'_>,
    ) -> Result<BackendResponse> {
        let (source_index, source_token) = self.cluster(&job.source.container.prefix, tokens)?;
        let (dest_index, dest_token) = self.cluster(&job.destination.prefix, tokens)?;

        let mut headers = with_cluster_token(&request.headers, source_token);
        headers.remove(CONTENT_LENGTH);
        headers.remove(X_COPY_FROM);
        let source_segments =
            self.object_segments(job, &job.source.container.container, &job.source.object);
        let response = self
            .send(
                request,
                Method::GET,
                headers,
                RequestBody::Empty,
                &source_segments,
                source_index,
            )
            .await?;
        if response.status != StatusCode::OK {
            return Ok(response);
        }
        let limit = self.orchestrator.transport().max_file_size();
        if response.content_length().is_some_and(|length| length > limit) {
            return Err(RelayError::PayloadTooLarge { limit }.into());
        }
        let body = response.body.collect_limited(limit).await?;
        let size = body.len() as u64;

        let mut headers = with_cluster_token(&request.headers, dest_token);
        headers.remove(X_COPY_FROM);
        if size < self.segment_size {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
            let segments = self.object_segments(job, &job.destination.container, job.object);
            return self
                .send(
                    request,
                    Method::PUT,
                    headers,
                    RequestBody::Buffered(body),
                    &segments,
                    dest_index,
                )
                .await;
        }

        tracing::info!(
            relay_id = %request.id,
            size,
            segment_size = self.segment_size,
            "Copying object across clusters as segments"
        );
        self.put_segmented(request, headers, dest_token, body, job, dest_index)
            .await
    }

    async fn put_segmented(
        &self,
        request: &mut RelayRequest,
        mut headers: HeaderMap,
        token: &str,
        body: Bytes,
        job: &CopyJob<'_>,
        index: usize,
    ) -> Result<BackendResponse> {
        let segment_container = format!("{}_segments", job.destination.container);
        let mut container_headers = with_cluster_token(&HeaderMap::new(), token);
        container_headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        let container_path = vec![
            job.version.to_string(),
            job.account.to_string(),
            segment_container.clone(),
        ];
        let response = self
            .send(
                request,
                Method::PUT,
                container_headers,
                RequestBody::Empty,
                &container_path,
                index,
            )
            .await?;
        if !matches!(response.status, StatusCode::CREATED | StatusCode::ACCEPTED) {
            return Ok(self.abandon(request, response));
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let stamp = encode_path(&format!(
            "{}/{timestamp:.5}/{}",
            decode(job.object),
            body.len()
        ));
        let segment_size = usize::try_from(self.segment_size).unwrap_or(usize::MAX);

        for (i, chunk) in body.chunks(segment_size).enumerate() {
            let chunk = body.slice_ref(chunk);
            let mut segment_headers = with_cluster_token(&HeaderMap::new(), token);
            segment_headers.insert(CONTENT_LENGTH, HeaderValue::from(chunk.len()));
            let mut path = container_path.clone();
            path.extend(format!("{stamp}/{i:08}").split('/').map(String::from));
            let response = self
                .send(
                    request,
                    Method::PUT,
                    segment_headers,
                    RequestBody::Buffered(chunk),
                    &path,
                    index,
                )
                .await?;
            if response.status != StatusCode::CREATED {
                return Ok(self.abandon(request, response));
            }
        }

        let manifest = format!("{segment_container}/{stamp}/");
        let manifest = HeaderValue::from_str(&manifest)
            .map_err(|e| DispatchError::BadRequest(e.to_string()))?;
        headers.insert(X_OBJECT_MANIFEST, manifest);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        let segments = self.object_segments(job, &job.destination.container, job.object);
        self.send(
            request,
            Method::PUT,
            headers,
            RequestBody::Empty,
            &segments,
            index,
        )
        .await
    }

    fn abandon(&self, request: &RelayRequest, response: BackendResponse) -> BackendResponse {
        tracing::warn!(
            relay_id = %request.id,
            status = response.status.as_u16(),
            "Segmented copy failed, written segments are left in place"
        );
        response
    }

    fn cluster<'t>(&self, prefix: &str, tokens: &[&'t str]) -> Result<(usize, &'t str)> {
        let index = self
            .location
            .cluster_index_by_container_prefix(prefix)
            .ok_or(DispatchError::NotFound)?;
        let token = tokens
            .get(index)
            .copied()
            .ok_or(DispatchError::Unauthorized)?;
        Ok((index, token))
    }

    fn object_segments(&self, job: &CopyJob<'_>, container: &str, object: &str) -> Vec<String> {
        let mut segments = vec![
            job.version.to_string(),
            job.account.to_string(),
            container.to_string(),
        ];
        segments.extend(object.split('/').map(String::from));
        segments
    }

    async fn send(
        &self,
        request: &mut RelayRequest,
        method: Method,
        headers: HeaderMap,
        body: RequestBody,
        segments: &[String],
        index: usize,
    ) -> Result<BackendResponse> {
        let target = Url::parse(&format!("{}/{}", request.client_origin, segments.join("/")))
            .map_err(|e| DispatchError::BadRequest(e.to_string()))?;
        let mut relayed = request.derive(method, headers, body);
        let response = self
            .orchestrator
            .relay(
                &mut relayed,
                &target,
                segments,
                &self.location.clusters()[index],
                self.location,
            )
            .await?;
        Ok(response)
    }
}
