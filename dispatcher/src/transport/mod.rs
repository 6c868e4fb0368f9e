//! One HTTP/1.1 request/response cycle against one backend.
//!
//! Requests are written straight onto the connection so that uploads can wait for
//! `100 Continue` before the body is released, and so that a failing backend is noticed
//! while the client is still streaming.

mod conn;
mod wire;

pub use conn::{BackendStream, authority, connect};

use crate::body::{BackendResponse, ChannelBody, RequestBody, ResponseBody, next_data};
use crate::config::Config;
use crate::errors::RelayError;
use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, HOST, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use shared::http::filter_hop_by_hop;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use url::Url;
use wire::{BodyReader, Framing, ResponseHead};

/// Responses with a known length below this are read into memory.
pub const INLINE_BODY_LIMIT: u64 = 4096;

const UPLOAD_QUEUE: usize = 10;
const RESPONSE_QUEUE: usize = 10;

/// Where one attempt goes: the backend URL, and the cache proxy in front of it if any.
#[derive(Clone, Debug)]
pub struct Target {
    pub url: Url,
    pub proxy: Option<Url>,
}

impl Target {
    pub fn direct(url: Url) -> Self {
        Target { url, proxy: None }
    }
}

pub struct Transport {
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
    expect_timeout: Duration,
    client_timeout: Duration,
    node_timeout: Duration,
    read_attempts: u32,
    read_backoff: Duration,
    max_file_size: u64,
    chunk_size: usize,
}

impl Transport {
    pub fn from_config(config: &Config, tls: Option<TlsConnector>) -> Self {
        Transport {
            tls,
            connect_timeout: config.timeouts.connect(),
            expect_timeout: config.timeouts.expect(),
            client_timeout: config.timeouts.client(),
            node_timeout: config.timeouts.node(),
            read_attempts: config.response_retry.attempts,
            read_backoff: config.response_retry.backoff(),
            max_file_size: config.max_file_size,
            chunk_size: config.client_chunk_size,
        }
    }

    pub fn with_node_timeout(mut self, node_timeout: Duration) -> Self {
        self.node_timeout = node_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_client_timeout(mut self, client_timeout: Duration) -> Self {
        self.client_timeout = client_timeout;
        self
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    /// Sends one request and returns the backend's response.
    ///
    /// A streaming `body` is left `Consumed` once the backend accepted it, so the caller
    /// can tell whether another attempt is still possible.
    pub async fn send(
        &self,
        method: &Method,
        target: &Target,
        headers: &HeaderMap,
        body: &mut RequestBody,
    ) -> Result<BackendResponse, RelayError> {
        if body.is_consumed() {
            return Err(RelayError::BodyConsumed);
        }
        let declared_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(length) = declared_length
            && length > self.max_file_size
        {
            return Err(RelayError::PayloadTooLarge {
                limit: self.max_file_size,
            });
        }

        let object_path = is_object_path(&target.url);
        let (connect_url, request_target) = match &target.proxy {
            Some(proxy) if method == Method::GET && object_path => {
                (proxy, target.url.as_str().to_string())
            }
            _ => (&target.url, origin_form(&target.url)),
        };

        let chunked_in = is_chunked(headers);
        let mut headers = headers.clone();
        filter_hop_by_hop(&mut headers, Version::HTTP_11);
        let (host, port) = authority(&target.url)?;
        let host = HeaderValue::from_str(&format!("{host}:{port}"))
            .map_err(|_| RelayError::InvalidTarget(target.url.to_string()))?;
        headers.insert(HOST, host);
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        let upload = (method == Method::PUT || method == Method::POST)
            && object_path
            && !body.is_empty();

        if upload {
            self.upload(method, connect_url, &request_target, headers, body, chunked_in, declared_length)
                .await
        } else {
            self.exchange(method, connect_url, &request_target, headers, body)
                .await
        }
    }

    /// Request whose body, if any, is small enough to be written in one go.
    async fn exchange(
        &self,
        method: &Method,
        connect_url: &Url,
        request_target: &str,
        mut headers: HeaderMap,
        body: &mut RequestBody,
    ) -> Result<BackendResponse, RelayError> {
        body.buffer(self.max_file_size, self.client_timeout).await?;
        let payload = match body.take() {
            RequestBody::Buffered(bytes) => bytes,
            _ => Bytes::new(),
        };
        if !payload.is_empty() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(payload.len()));
        }

        let name = target_name(connect_url);
        let mut stream = connect(connect_url, self.tls.as_ref(), self.connect_timeout).await?;

        let mut request = wire::encode_head(method, request_target, &headers);
        request.extend_from_slice(&payload);
        match timeout(self.node_timeout, stream.write_all(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(RelayError::Write {
                    target: name,
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(RelayError::NodeTimeout(name)),
        }

        let mut buf = BytesMut::new();
        let head = match timeout(self.node_timeout, read_final_head(&mut stream, &mut buf)).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                return Err(RelayError::ResponseRead {
                    target: name,
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(RelayError::NodeTimeout(name)),
        };
        self.finish(method, stream, buf, head, name).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload(
        &self,
        method: &Method,
        connect_url: &Url,
        request_target: &str,
        mut headers: HeaderMap,
        body: &mut RequestBody,
        chunked_in: bool,
        declared_length: Option<u64>,
    ) -> Result<BackendResponse, RelayError> {
        let length = match (&*body, declared_length) {
            (RequestBody::Buffered(bytes), None) => Some(bytes.len() as u64),
            (_, declared) => declared,
        };
        let chunked = chunked_in || length.is_none();
        if chunked {
            headers.remove(CONTENT_LENGTH);
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        } else if let Some(length) = length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        if length.is_some_and(|l| l > 0) && !headers.contains_key(EXPECT) {
            headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        }

        let name = target_name(connect_url);
        let mut stream = connect(connect_url, self.tls.as_ref(), self.connect_timeout).await?;
        let head = wire::encode_head(method, request_target, &headers);
        match timeout(self.node_timeout, stream.write_all(&head)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(RelayError::Write {
                    target: name,
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(RelayError::NodeTimeout(name)),
        }

        let mut buf = BytesMut::new();
        if headers.contains_key(EXPECT) {
            let expect_error = |reason: String| RelayError::Expect {
                target: name.clone(),
                reason,
            };
            let interim = timeout(self.expect_timeout, wire::read_head(&mut stream, &mut buf))
                .await
                .map_err(|_| expect_error("timed out waiting for 100 Continue".to_string()))?
                .map_err(|e| expect_error(e.to_string()))?;
            match interim.status {
                StatusCode::CONTINUE => {}
                StatusCode::INSUFFICIENT_STORAGE => {
                    tracing::error!(backend = %name, "Backend reported insufficient storage");
                    return Err(RelayError::InsufficientStorage(name));
                }
                status if status.is_informational() => {
                    return Err(expect_error(format!("unexpected interim status {status}")));
                }
                // The backend answered without wanting the body
                _ => return self.finish(method, stream, buf, interim, name).await,
            }
        }

        let (mut reader, writer) = tokio::io::split(stream);
        let failed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(UPLOAD_QUEUE);
        let sender = tokio::spawn(drain_to_backend(
            writer,
            rx,
            failed.clone(),
            self.node_timeout,
            name.clone(),
        ));

        let pumped = self.pump(body.take(), &tx, &failed, chunked).await;
        drop(tx);
        let (writer, write_error) = sender.await.map_err(|e| RelayError::Write {
            target: name.clone(),
            reason: e.to_string(),
        })?;
        pumped?;

        let mut stream = reader.unsplit(writer);
        let retry = ReadRetry {
            attempts: self.read_attempts,
            window: self.node_timeout / self.read_attempts.max(1),
            backoff: self.read_backoff,
        };
        let read = read_head_with_retry(&mut stream, &mut buf, retry, &name);
        let head = match timeout(self.node_timeout, read).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(write_error.unwrap_or(RelayError::NodeTimeout(name)));
            }
            Ok(Err(e)) => {
                return Err(write_error.unwrap_or(RelayError::ResponseRead {
                    target: name,
                    reason: e.to_string(),
                }));
            }
            Err(_) => return Err(write_error.unwrap_or(RelayError::NodeTimeout(name))),
        };
        self.finish(method, stream, buf, head, name).await
    }

    /// Feeds the client body into the sender task's queue.
    async fn pump(
        &self,
        body: RequestBody,
        tx: &mpsc::Sender<Bytes>,
        failed: &AtomicBool,
        chunked: bool,
    ) -> Result<(), RelayError> {
        let mut sent = 0u64;
        match body {
            RequestBody::Empty => {}
            RequestBody::Consumed => return Err(RelayError::BodyConsumed),
            RequestBody::Buffered(bytes) => {
                let mut offset = 0;
                while offset < bytes.len() {
                    let end = (offset + self.chunk_size).min(bytes.len());
                    if !self
                        .forward(bytes.slice(offset..end), tx, failed, chunked, &mut sent)
                        .await?
                    {
                        return Ok(());
                    }
                    offset = end;
                }
            }
            RequestBody::Streaming(mut stream) => {
                while let Some(data) = next_data(&mut stream, self.client_timeout).await? {
                    if !self.forward(data, tx, failed, chunked, &mut sent).await? {
                        return Ok(());
                    }
                }
            }
        }
        if chunked
            && !failed.load(Ordering::Acquire)
            && tx.send(Bytes::from_static(wire::LAST_CHUNK)).await.is_err()
        {
            failed.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Queues one piece of the body. `Ok(false)` means the backend side gave up.
    async fn forward(
        &self,
        data: Bytes,
        tx: &mpsc::Sender<Bytes>,
        failed: &AtomicBool,
        chunked: bool,
        sent: &mut u64,
    ) -> Result<bool, RelayError> {
        if data.is_empty() {
            return Ok(true);
        }
        *sent += data.len() as u64;
        if *sent > self.max_file_size {
            failed.store(true, Ordering::Release);
            return Err(RelayError::PayloadTooLarge {
                limit: self.max_file_size,
            });
        }
        if failed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let framed = if chunked {
            wire::encode_chunk(&data)
        } else {
            data
        };
        if tx.send(framed).await.is_err() {
            failed.store(true, Ordering::Release);
            return Ok(false);
        }
        Ok(true)
    }

    /// Turns a response head into a `BackendResponse`, reading or streaming its body.
    async fn finish(
        &self,
        method: &Method,
        stream: BackendStream,
        buf: BytesMut,
        head: ResponseHead,
        name: String,
    ) -> Result<BackendResponse, RelayError> {
        let framing = Framing::of(method, &head);
        let ResponseHead {
            status,
            mut headers,
        } = head;
        filter_hop_by_hop(&mut headers, Version::HTTP_11);

        let mut reader = BodyReader::new(stream, buf, framing);
        match framing {
            Framing::Empty => Ok(BackendResponse::buffered(status, headers, Bytes::new())),
            Framing::Length(length) if length < INLINE_BODY_LIMIT => {
                let body = timeout(self.node_timeout, reader.read_to_end(self.chunk_size))
                    .await
                    .map_err(|_| RelayError::NodeTimeout(name.clone()))?
                    .map_err(|e| RelayError::ResponseRead {
                        target: name,
                        reason: e.to_string(),
                    })?;
                Ok(BackendResponse::buffered(status, headers, body))
            }
            _ => {
                let (tx, channel) = ChannelBody::channel(RESPONSE_QUEUE);
                tokio::spawn(stream_response(
                    reader,
                    tx,
                    self.client_timeout,
                    self.chunk_size,
                    name,
                ));
                Ok(BackendResponse {
                    status,
                    headers,
                    body: ResponseBody::Streamed(channel),
                })
            }
        }
    }
}

async fn drain_to_backend(
    mut writer: WriteHalf<BackendStream>,
    mut rx: mpsc::Receiver<Bytes>,
    failed: Arc<AtomicBool>,
    write_timeout: Duration,
    name: String,
) -> (WriteHalf<BackendStream>, Option<RelayError>) {
    let mut error = None;
    while let Some(chunk) = rx.recv().await {
        if failed.load(Ordering::Acquire) {
            continue;
        }
        if let Err(e) = write_within(&mut writer, &chunk, write_timeout, &name).await {
            failed.store(true, Ordering::Release);
            error = Some(e);
        }
    }
    if error.is_none() {
        match timeout(write_timeout, writer.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error = Some(RelayError::Write {
                    target: name,
                    reason: e.to_string(),
                })
            }
            Err(_) => error = Some(RelayError::NodeTimeout(name)),
        }
    }
    (writer, error)
}

async fn write_within(
    writer: &mut WriteHalf<BackendStream>,
    chunk: &[u8],
    write_timeout: Duration,
    name: &str,
) -> Result<(), RelayError> {
    match timeout(write_timeout, writer.write_all(chunk)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::Write {
            target: name.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(RelayError::Write {
            target: name.to_string(),
            reason: "timed out".to_string(),
        }),
    }
}

async fn stream_response(
    mut reader: BodyReader<BackendStream>,
    tx: mpsc::Sender<Result<Bytes, RelayError>>,
    chunk_timeout: Duration,
    chunk_size: usize,
    name: String,
) {
    loop {
        let item = match timeout(chunk_timeout, reader.next_chunk(chunk_size)).await {
            Ok(Ok(Some(data))) => Ok(data),
            Ok(Ok(None)) => return,
            Ok(Err(e)) => Err(RelayError::ResponseRead {
                target: name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RelayError::NodeTimeout(name.clone())),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() {
            tracing::debug!(backend = %name, "Client went away, dropping backend response");
            return;
        }
        if failed {
            return;
        }
    }
}

/// Reads heads until a final (non 1xx) one arrives.
async fn read_final_head<R>(stream: &mut R, buf: &mut BytesMut) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    loop {
        let head = wire::read_head(stream, buf).await?;
        if !head.status.is_informational() {
            return Ok(head);
        }
    }
}

/// How long to wait for the response head after an upload.
#[derive(Clone, Copy, Debug)]
struct ReadRetry {
    attempts: u32,
    /// How long one attempt waits for the head
    window: Duration,
    backoff: Duration,
}

/// Waits for the final response head in up to `retry.attempts` windows.
///
/// A head that arrived in part stays in `buf` and parsing resumes from it, so a backend
/// that is slow to answer costs an attempt but no bytes. Running out of attempts is a
/// `TimedOut` error.
async fn read_head_with_retry<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    retry: ReadRetry,
    name: &str,
) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let mut attempt = 1;
    loop {
        let result = match timeout(retry.window, read_final_head(stream, buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "response not ready",
            )),
        };
        match result {
            Err(e) if is_transient(&e) && attempt < retry.attempts => {
                tracing::debug!(backend = %name, attempt, error = %e, "Response not ready, retrying");
                attempt += 1;
                sleep(retry.backoff).await;
            }
            result => return result,
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// `/<ver>/<account>/<container>/<object>` or deeper.
fn is_object_path(url: &Url) -> bool {
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).count() >= 4)
        .unwrap_or(false)
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn target_name(url: &Url) -> String {
    match authority(url) {
        Ok((host, port)) => format!("{host}:{port}"),
        Err(_) => url.to_string(),
    }
}
