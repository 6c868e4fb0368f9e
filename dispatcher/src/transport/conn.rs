use crate::errors::RelayError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use url::Url;

/// A connection to one backend (or cache proxy), plain or TLS.
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// `host:port` of a backend URL, with the scheme's default port filled in.
pub fn authority(url: &Url) -> Result<(String, u16), RelayError> {
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::InvalidTarget(url.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RelayError::InvalidTarget(url.to_string()))?;
    Ok((host.to_string(), port))
}

/// Opens a connection, including the TLS handshake for `https`, within `connect_timeout`.
pub async fn connect(
    url: &Url,
    tls: Option<&TlsConnector>,
    connect_timeout: Duration,
) -> Result<BackendStream, RelayError> {
    let (host, port) = authority(url)?;
    let target = format!("{host}:{port}");
    let connect_error = |reason: String| RelayError::Connect {
        target: target.clone(),
        reason,
    };
    // IPv6 literals come bracketed out of the URL
    let bare_host = host.trim_start_matches('[').trim_end_matches(']');

    let handshake = async {
        let tcp = TcpStream::connect((bare_host, port))
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        let _ = tcp.set_nodelay(true);

        match url.scheme() {
            "https" => {
                let connector = tls.ok_or_else(|| {
                    connect_error("no CA bundle configured for https backends".to_string())
                })?;
                let server_name = shared::tls::server_name(bare_host)
                    .map_err(|e| connect_error(e.to_string()))?;
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| connect_error(e.to_string()))?;
                Ok(BackendStream::Tls(Box::new(stream)))
            }
            _ => Ok(BackendStream::Plain(tcp)),
        }
    };

    timeout(connect_timeout, handshake)
        .await
        .map_err(|_| connect_error("timed out".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority() {
        let url = Url::parse("http://swift-a1:8080/v1.0").unwrap();
        assert_eq!(authority(&url).unwrap(), ("swift-a1".to_string(), 8080));

        let url = Url::parse("https://swift-b1/").unwrap();
        assert_eq!(authority(&url).unwrap(), ("swift-b1".to_string(), 443));

        let url = Url::parse("http://[::1]:8080/").unwrap();
        assert_eq!(authority(&url).unwrap(), ("[::1]".to_string(), 8080));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let result = connect(&url, None, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RelayError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_https_without_ca() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let url = Url::parse(&format!("https://127.0.0.1:{port}/")).unwrap();
        let result = connect(&url, None, Duration::from_secs(1)).await;
        match result {
            Err(RelayError::Connect { reason, .. }) => assert!(reason.contains("CA bundle")),
            _ => panic!("expected a connect error"),
        }
    }
}
