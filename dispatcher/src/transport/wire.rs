//! HTTP/1.1 framing for backend connections.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_LINE_SIZE: usize = 8 * 1024;
const READ_SIZE: usize = 16 * 1024;

pub fn encode_head(method: &Method, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(method.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Frames one chunk of a chunked request body.
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(data.len() + 12);
    framed.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    framed.extend_from_slice(data);
    framed.extend_from_slice(b"\r\n");
    framed.freeze()
}

pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Reads one response head. Bytes following it stay in `buf`.
pub async fn read_head<R>(stream: &mut R, buf: &mut BytesMut) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(head) = parse_head(buf)? {
            return Ok(head);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(invalid("response head too large"));
        }
        buf.reserve(READ_SIZE);
        if stream.read_buf(buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the response head",
            ));
        }
    }
}

fn parse_head(buf: &mut BytesMut) -> io::Result<Option<ResponseHead>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let consumed = match response.parse(&buf[..]) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(invalid(e.to_string())),
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid("invalid status code"))?;
    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| invalid(e.to_string()))?;
        let value = HeaderValue::from_bytes(header.value).map_err(|e| invalid(e.to_string()))?;
        headers.append(name, value);
    }

    buf.advance(consumed);
    Ok(Some(ResponseHead { status, headers }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    Close,
}

impl Framing {
    pub fn of(method: &Method, head: &ResponseHead) -> Framing {
        if method == Method::HEAD
            || head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            return Framing::Empty;
        }
        let chunked = head
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return Framing::Chunked;
        }
        match head
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            Some(length) => Framing::Length(length),
            None => Framing::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Decodes a response body off the connection.
pub struct BodyReader<R> {
    stream: R,
    buf: BytesMut,
    framing: Framing,
    remaining: u64,
    chunk: ChunkState,
}

impl<R> BodyReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R, buf: BytesMut, framing: Framing) -> Self {
        let remaining = match framing {
            Framing::Length(n) => n,
            _ => 0,
        };
        BodyReader {
            stream,
            buf,
            framing,
            remaining,
            chunk: ChunkState::Size,
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_SIZE);
        self.stream.read_buf(&mut self.buf).await
    }

    async fn fill_or_eof(&mut self) -> io::Result<()> {
        if self.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of the response body",
            ));
        }
        Ok(())
    }

    async fn read_line(&mut self) -> io::Result<BytesMut> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let mut line = self.buf.split_to(pos + 2);
                line.truncate(pos);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_SIZE {
                return Err(invalid("chunk line too long"));
            }
            self.fill_or_eof().await?;
        }
    }

    /// Returns the next piece of the body, at most `max` bytes, or `None` at the end.
    pub async fn next_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        match self.framing {
            Framing::Empty => Ok(None),
            Framing::Length(_) => {
                if self.remaining == 0 {
                    return Ok(None);
                }
                if self.buf.is_empty() {
                    self.fill_or_eof().await?;
                }
                let take = (self.buf.len() as u64).min(self.remaining).min(max as u64) as usize;
                self.remaining -= take as u64;
                Ok(Some(self.buf.split_to(take).freeze()))
            }
            Framing::Close => {
                if self.buf.is_empty() && self.fill().await? == 0 {
                    return Ok(None);
                }
                let take = self.buf.len().min(max);
                Ok(Some(self.buf.split_to(take).freeze()))
            }
            Framing::Chunked => self.next_chunked(max).await,
        }
    }

    async fn next_chunked(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        loop {
            match self.chunk {
                ChunkState::Size => {
                    let line = self.read_line().await?;
                    let line = std::str::from_utf8(&line).map_err(|e| invalid(e.to_string()))?;
                    let size = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size, 16)
                        .map_err(|_| invalid(format!("invalid chunk size {size:?}")))?;
                    self.chunk = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(left) => {
                    if self.buf.is_empty() {
                        self.fill_or_eof().await?;
                    }
                    let take = (self.buf.len() as u64).min(left).min(max as u64) as usize;
                    let left = left - take as u64;
                    self.chunk = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    return Ok(Some(self.buf.split_to(take).freeze()));
                }
                ChunkState::DataEnd => {
                    let line = self.read_line().await?;
                    if !line.is_empty() {
                        return Err(invalid("missing CRLF after chunk data"));
                    }
                    self.chunk = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    // trailers are dropped
                    if self.read_line().await?.is_empty() {
                        self.chunk = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(None),
            }
        }
    }

    pub async fn read_to_end(&mut self, max: usize) -> io::Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next_chunk(max).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}
