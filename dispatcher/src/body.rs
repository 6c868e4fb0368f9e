use crate::errors::RelayError;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HeaderName};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of the responses the dispatcher hands back to hyper
pub type DispatchBody = BoxBody<Bytes, BoxError>;

/// Where the bytes of a relayed request come from.
pub enum RequestBody {
    Empty,
    Buffered(Bytes),
    Streaming(UnsyncBoxBody<Bytes, BoxError>),
    /// A stream that was handed to a backend already and cannot be replayed.
    Consumed,
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            RequestBody::Streaming(_) => write!(f, "Streaming"),
            RequestBody::Consumed => write!(f, "Consumed"),
        }
    }
}

impl RequestBody {
    pub fn from_body<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if body.is_end_stream() {
            RequestBody::Empty
        } else {
            RequestBody::Streaming(body.map_err(Into::into).boxed_unsync())
        }
    }

    /// The body for the next attempt. Buffered bodies can be sent any number of
    /// times, a stream only once.
    pub fn take(&mut self) -> RequestBody {
        match self {
            RequestBody::Empty => RequestBody::Empty,
            RequestBody::Buffered(bytes) => RequestBody::Buffered(bytes.clone()),
            RequestBody::Consumed => RequestBody::Consumed,
            RequestBody::Streaming(_) => std::mem::replace(self, RequestBody::Consumed),
        }
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self, RequestBody::Consumed)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Buffered(bytes) => bytes.is_empty(),
            RequestBody::Streaming(_) | RequestBody::Consumed => false,
        }
    }

    /// Reads a streaming body into memory so it can be sent to several backends.
    pub async fn buffer(&mut self, limit: u64, frame_timeout: Duration) -> Result<(), RelayError> {
        match self.take() {
            RequestBody::Streaming(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = next_data(&mut stream, frame_timeout).await? {
                    if (buf.len() + chunk.len()) as u64 > limit {
                        return Err(RelayError::PayloadTooLarge { limit });
                    }
                    buf.extend_from_slice(&chunk);
                }
                *self = RequestBody::Buffered(buf.freeze());
                Ok(())
            }
            RequestBody::Consumed => Err(RelayError::BodyConsumed),
            _ => Ok(()),
        }
    }
}

/// Next data frame of a client body, skipping trailers.
pub(crate) async fn next_data(
    stream: &mut UnsyncBoxBody<Bytes, BoxError>,
    frame_timeout: Duration,
) -> Result<Option<Bytes>, RelayError> {
    loop {
        let frame = timeout(frame_timeout, stream.frame())
            .await
            .map_err(|_| RelayError::ClientTimeout)?;
        match frame {
            None => return Ok(None),
            Some(Err(e)) => return Err(RelayError::ClientBody(e.to_string())),
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    return Ok(Some(data));
                }
            }
        }
    }
}

/// Response body fed by a reader task holding the backend connection.
///
/// Dropping it closes the channel, which makes the reader task stop and release
/// the connection.
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<Result<Bytes, RelayError>>,
}

impl ChannelBody {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Bytes, RelayError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, ChannelBody { rx })
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|chunk| chunk.map(Frame::data)))
    }
}

#[derive(Debug)]
pub enum ResponseBody {
    Buffered(Bytes),
    Streamed(ChannelBody),
}

impl ResponseBody {
    pub fn is_streamed(&self) -> bool {
        matches!(self, ResponseBody::Streamed(_))
    }

    pub async fn collect(self) -> Result<Bytes, RelayError> {
        self.collect_limited(u64::MAX).await
    }

    /// Reads the whole body, giving up once it grows past `limit` bytes.
    pub async fn collect_limited(self, limit: u64) -> Result<Bytes, RelayError> {
        match self {
            ResponseBody::Buffered(bytes) if bytes.len() as u64 > limit => {
                Err(RelayError::PayloadTooLarge { limit })
            }
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streamed(mut channel) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = channel.rx.recv().await {
                    let chunk = chunk?;
                    if (buf.len() + chunk.len()) as u64 > limit {
                        return Err(RelayError::PayloadTooLarge { limit });
                    }
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }

    pub fn into_dispatch_body(self) -> DispatchBody {
        match self {
            ResponseBody::Buffered(bytes) => Full::new(bytes).map_err(|e| match e {}).boxed(),
            ResponseBody::Streamed(channel) => channel.map_err(Into::into).boxed(),
        }
    }
}

/// Result of one successful relay cycle
#[derive(Debug)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl BackendResponse {
    pub fn buffered(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        BackendResponse {
            status,
            headers,
            body: ResponseBody::Buffered(body),
        }
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str(&CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn into_response(self) -> Response<DispatchBody> {
        let mut response = Response::new(self.body.into_dispatch_body());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
