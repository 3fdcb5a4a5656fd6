//! HTTP timing probe.
//!
//! Issues a single `GET` over a fresh connection and records how long each
//! phase took: name lookup, TCP connect, TLS handshake (https only), time to
//! first response byte and the full body transfer. Failures are reported in
//! the result rather than as errors.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{header, Request};
use hyper_util::rt::TokioIo;
use reqwest::Url;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_util::task::AbortOnDropHandle;

/// Phase of an HTTP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpPhase {
    Request,
    DnsLookup,
    TcpConnect,
    TlsHandshake,
    FirstByte,
    BodyTransfer,
}

impl fmt::Display for HttpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpPhase::Request => "request",
            HttpPhase::DnsLookup => "dns_lookup",
            HttpPhase::TcpConnect => "tcp_connect",
            HttpPhase::TlsHandshake => "tls_handshake",
            HttpPhase::FirstByte => "first_byte",
            HttpPhase::BodyTransfer => "body_transfer",
        };
        f.write_str(name)
    }
}

/// Why an HTTP probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpFailure {
    Timeout,
    Network,
}

/// Final status of an HTTP probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HttpStatus {
    Success {
        status_code: u16,
        body_bytes: u64,
    },
    Failed {
        kind: HttpFailure,
        phase: HttpPhase,
        message: String,
    },
}

/// Phase-level timing of one HTTP attempt.
///
/// Phase durations are disjoint; the cumulative accessors mirror the usual
/// `namelookup <= connect <= pretransfer <= starttransfer <= total` ordering.
/// Phases that were never reached stay zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpTiming {
    pub started_at: DateTime<Utc>,
    pub url: String,
    pub dns_lookup: Duration,
    pub tcp_connection: Duration,
    /// `None` for plain http.
    pub tls_handshake: Option<Duration>,
    pub server_processing: Duration,
    pub content_transfer: Duration,
    pub total: Duration,
    pub status: HttpStatus,
}

impl HttpTiming {
    fn new(url: &str) -> Self {
        Self {
            started_at: Utc::now(),
            url: url.to_string(),
            dns_lookup: Duration::ZERO,
            tcp_connection: Duration::ZERO,
            tls_handshake: None,
            server_processing: Duration::ZERO,
            content_transfer: Duration::ZERO,
            total: Duration::ZERO,
            status: HttpStatus::Failed {
                kind: HttpFailure::Network,
                phase: HttpPhase::Request,
                message: "not started".to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, HttpStatus::Success { .. })
    }

    pub fn name_lookup(&self) -> Duration {
        self.dns_lookup
    }

    pub fn connect(&self) -> Duration {
        self.name_lookup() + self.tcp_connection
    }

    pub fn pretransfer(&self) -> Duration {
        self.connect() + self.tls_handshake.unwrap_or_default()
    }

    pub fn start_transfer(&self) -> Duration {
        self.pretransfer() + self.server_processing
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

struct PhaseError {
    kind: HttpFailure,
    phase: HttpPhase,
    message: String,
}

impl PhaseError {
    fn network(phase: HttpPhase, err: impl fmt::Display) -> Self {
        Self {
            kind: HttpFailure::Network,
            phase,
            message: err.to_string(),
        }
    }

    fn timeout(phase: HttpPhase, timeout: Duration) -> Self {
        Self {
            kind: HttpFailure::Timeout,
            phase,
            message: format!("timed out after {:?}", timeout),
        }
    }
}

/// Await `fut` until the probe deadline, tagging failures with `phase`.
async fn bounded<T, E: fmt::Display>(
    deadline: Instant,
    timeout: Duration,
    phase: HttpPhase,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, PhaseError> {
    match timeout_at(deadline, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(PhaseError::network(phase, e)),
        Err(_) => Err(PhaseError::timeout(phase, timeout)),
    }
}

/// Run an HTTP probe against `url`, bounded by `timeout` overall.
///
/// The response body is read to the end and discarded.
pub async fn run_http_probe(url: &str, timeout: Duration) -> HttpTiming {
    let mut timing = HttpTiming::new(url);
    let start = Instant::now();
    let deadline = start + timeout;

    let outcome = timed_get(url, timeout, deadline, &mut timing).await;
    timing.status = match outcome {
        Ok((status_code, body_bytes)) => HttpStatus::Success {
            status_code,
            body_bytes,
        },
        Err(e) => HttpStatus::Failed {
            kind: e.kind,
            phase: e.phase,
            message: e.message,
        },
    };
    timing.total = start.elapsed();
    timing
}

async fn timed_get(
    url: &str,
    timeout: Duration,
    deadline: Instant,
    timing: &mut HttpTiming,
) -> Result<(u16, u64), PhaseError> {
    let parsed = Url::parse(url).map_err(|e| PhaseError::network(HttpPhase::Request, e))?;
    let tls = match parsed.scheme() {
        "http" => false,
        "https" => true,
        other => {
            return Err(PhaseError::network(
                HttpPhase::Request,
                format!("unsupported scheme: {}", other),
            ))
        }
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| PhaseError::network(HttpPhase::Request, "url has no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| PhaseError::network(HttpPhase::Request, "url has no port"))?;

    let mark = Instant::now();
    let addr: SocketAddr = bounded(deadline, timeout, HttpPhase::DnsLookup, async {
        tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| std::io::Error::other(format!("no addresses found for {}", host)))
    })
    .await?;
    timing.dns_lookup = mark.elapsed();

    let mark = Instant::now();
    let tcp = bounded(deadline, timeout, HttpPhase::TcpConnect, TcpStream::connect(addr)).await?;
    timing.tcp_connection = mark.elapsed();

    let stream: Box<dyn Stream> = if tls {
        let mark = Instant::now();
        let connector = tokio_native_tls::native_tls::TlsConnector::new()
            .map_err(|e| PhaseError::network(HttpPhase::TlsHandshake, e))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let stream = bounded(
            deadline,
            timeout,
            HttpPhase::TlsHandshake,
            connector.connect(&host, tcp),
        )
        .await?;
        timing.tls_handshake = Some(mark.elapsed());
        Box::new(stream)
    } else {
        Box::new(tcp)
    };

    let mark = Instant::now();
    let (mut sender, connection) = bounded(
        deadline,
        timeout,
        HttpPhase::FirstByte,
        http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream)),
    )
    .await?;
    // The connection task goes away with the probe, whichever way it ends.
    let _connection = AbortOnDropHandle::new(tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("HTTP connection closed with error: {}", e);
        }
    }));

    let request = build_request(&parsed)?;
    let response = bounded(
        deadline,
        timeout,
        HttpPhase::FirstByte,
        sender.send_request(request),
    )
    .await?;
    timing.server_processing = mark.elapsed();
    let status_code = response.status().as_u16();

    let mark = Instant::now();
    let mut body = response.into_body();
    let mut body_bytes = 0u64;
    while let Some(frame) = bounded(deadline, timeout, HttpPhase::BodyTransfer, async {
        body.frame().await.transpose()
    })
    .await?
    {
        if let Some(chunk) = frame.data_ref() {
            body_bytes += chunk.len() as u64;
        }
    }
    timing.content_transfer = mark.elapsed();

    Ok((status_code, body_bytes))
}

fn build_request(url: &Url) -> Result<Request<Empty<Bytes>>, PhaseError> {
    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };
    let host = match url.port() {
        Some(p) => format!("{}:{}", url.host_str().unwrap_or_default(), p),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    Request::get(path)
        .header(header::HOST, host)
        .header(
            header::USER_AGENT,
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
        )
        .header(header::ACCEPT, "*/*")
        .header(header::CONNECTION, "close")
        .body(Empty::new())
        .map_err(|e| PhaseError::network(HttpPhase::Request, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response on a local port and return its URL.
    async fn serve_once(response: &'static [u8], delay: Duration) -> String {
        serve_in_pieces(vec![response], delay, Duration::ZERO).await
    }

    /// Like `serve_once`, but writes the response in `pieces`, pausing `gap`
    /// between them.
    async fn serve_in_pieces(
        pieces: Vec<&'static [u8]>,
        delay: Duration,
        gap: Duration,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 1024];
            let _ = socket.read(&mut req).await;
            tokio::time::sleep(delay).await;
            for (i, piece) in pieces.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(gap).await;
                }
                let _ = socket.write_all(piece).await;
                let _ = socket.flush().await;
            }
            let _ = socket.shutdown().await;
        });
        format!("http://{}/health", addr)
    }

    #[tokio::test]
    async fn test_http_probe_success_drains_body() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
            Duration::ZERO,
        )
        .await;

        let timing = run_http_probe(&url, Duration::from_secs(5)).await;

        assert_eq!(
            timing.status,
            HttpStatus::Success {
                status_code: 200,
                body_bytes: 5
            }
        );
        assert!(timing.tls_handshake.is_none());
        assert!(timing.name_lookup() <= timing.connect());
        assert!(timing.connect() <= timing.pretransfer());
        assert!(timing.pretransfer() <= timing.start_transfer());
        assert!(timing.start_transfer() <= timing.total);
    }

    #[tokio::test]
    async fn test_http_probe_status_line_split_across_reads() {
        let url = serve_in_pieces(
            vec![
                &b"HTTP/1.1 200 OK"[..],
                &b"\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"[..],
            ],
            Duration::ZERO,
            Duration::from_millis(100),
        )
        .await;

        let timing = run_http_probe(&url, Duration::from_secs(5)).await;

        assert!(timing.is_success(), "got {:?}", timing.status);
        assert_eq!(
            timing.status,
            HttpStatus::Success {
                status_code: 200,
                body_bytes: 2
            }
        );
    }

    #[tokio::test]
    async fn test_http_probe_headers_split_across_reads() {
        let url = serve_in_pieces(
            vec![
                &b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n"[..],
                &b"X-Padding: aaaaaaaaaaaaaaaaaaaaaaaa\r\nConnection: close\r\n\r\n"[..],
                &b"hello world"[..],
            ],
            Duration::ZERO,
            Duration::from_millis(100),
        )
        .await;

        let timing = run_http_probe(&url, Duration::from_secs(5)).await;

        // Only the bytes after the blank line count as body.
        assert_eq!(
            timing.status,
            HttpStatus::Success {
                status_code: 200,
                body_bytes: 11
            }
        );
        assert!(timing.content_transfer >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_http_probe_reports_server_errors_as_completed() {
        let url = serve_once(b"HTTP/1.1 500 Internal Server Error\r\n\r\n", Duration::ZERO).await;
        let timing = run_http_probe(&url, Duration::from_secs(5)).await;
        assert!(matches!(
            timing.status,
            HttpStatus::Success { status_code: 500, .. }
        ));
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        let url = serve_once(b"HTTP/1.1 200 OK\r\n\r\n", Duration::from_secs(10)).await;

        let timing = run_http_probe(&url, Duration::from_millis(200)).await;

        match timing.status {
            HttpStatus::Failed { kind, phase, .. } => {
                assert_eq!(kind, HttpFailure::Timeout);
                assert_eq!(phase, HttpPhase::FirstByte);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(timing.total >= Duration::from_millis(200));
        assert!(timing.total < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let timing = run_http_probe(&format!("http://127.0.0.1:{}/", port), Duration::from_secs(2)).await;

        assert!(!timing.is_success());
        assert!(matches!(
            timing.status,
            HttpStatus::Failed {
                kind: HttpFailure::Network,
                phase: HttpPhase::TcpConnect,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let timing = run_http_probe("ftp://example.com/", Duration::from_millis(100)).await;
        assert!(matches!(
            timing.status,
            HttpStatus::Failed {
                phase: HttpPhase::Request,
                ..
            }
        ));
    }
}
