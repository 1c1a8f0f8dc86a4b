use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::{ProxyError, Result};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// The request line and destination of one proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    /// Absolute URL for plain HTTP, `host:port` authority for CONNECT.
    pub target: String,
    pub host: String,
    pub port: u16,
    /// Declared body length, if any.
    pub content_length: Option<usize>,
    /// Offset of the first body byte in the raw request.
    pub head_len: usize,
}

impl ProxyRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Body bytes still on the client socket after `buffered` bytes were read.
    pub fn remaining_body(&self, buffered: usize) -> usize {
        self.content_length
            .map(|len| (self.head_len + len).saturating_sub(buffered))
            .unwrap_or(0)
    }
}

/// Reads from `stream` until the end of the request head.
///
/// Bytes received after the head are kept in the returned buffer. A client
/// that closes early yields whatever was read so far; an empty buffer means
/// the client sent nothing.
pub async fn read_request_head<R>(
    stream: &mut R,
    buffer_size: usize,
    max_header_size: usize,
    read_timeout: Duration,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut request = Vec::with_capacity(buffer_size);
    let outcome = timeout(
        read_timeout,
        accumulate_head(stream, &mut request, buffer_size, max_header_size),
    )
    .await;

    match outcome {
        Ok(Ok(())) => Ok(request),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProxyError::ReadTimeout),
    }
}

async fn accumulate_head<R>(
    stream: &mut R,
    request: &mut Vec<u8>,
    buffer_size: usize,
    max_header_size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; buffer_size.max(1)];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }

        // Only rescan the region that could complete the terminator.
        let scan_from = request.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
        request.extend_from_slice(&chunk[..n]);

        if find_subslice(&request[scan_from..], HEADER_TERMINATOR).is_some() {
            return Ok(());
        }

        if request.len() > max_header_size {
            return Err(ProxyError::HeaderTooLarge {
                limit: max_header_size,
            });
        }
    }
}

/// Parses the request line and destination out of a raw request head.
pub fn parse_request(data: &[u8]) -> Result<ProxyRequest> {
    let head_len = find_subslice(data, HEADER_TERMINATOR)
        .map(|idx| idx + HEADER_TERMINATOR.len())
        .unwrap_or(data.len());
    let head = String::from_utf8_lossy(&data[..head_len]);
    let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));

    let request_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| ProxyError::Parse("Empty request".into()))?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(ProxyError::Parse(format!(
            "Invalid request line: {:?}",
            request_line
        )));
    }

    let method = parts[0].to_string();
    let target = parts[1].to_string();
    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let default_port = if is_connect { 443 } else { 80 };

    let mut host_header = None;
    let mut content_length = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("host") && host_header.is_none() {
            host_header = Some(value.to_string());
        } else if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value.parse().ok();
        }
    }

    let authority = match host_header.filter(|h| !h.is_empty()) {
        Some(host) => host,
        None if is_connect => target.clone(),
        None => url_authority(&target)
            .ok_or_else(|| ProxyError::Parse("Missing Host header".into()))?
            .to_string(),
    };

    let (host, port) = split_host_port(&authority, default_port)?;

    Ok(ProxyRequest {
        method,
        target,
        host,
        port,
        content_length,
        head_len,
    })
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ProxyError::Parse(format!("Invalid port {:?}", p)))
    };

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::Parse(format!("Unclosed IPv6 literal {:?}", authority)))?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None => default_port,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, p)) => (host, parse_port(p)?),
            None => (authority, default_port),
        }
    };

    if host.is_empty() {
        return Err(ProxyError::Parse("Host cannot be empty".into()));
    }

    Ok((host.to_string(), port))
}

fn url_authority(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("://")?;
    let end = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
    let authority = &rest[..end];
    // drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    (!authority.is_empty()).then_some(authority)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_request() {
        let raw = b"GET http://example.test/page HTTP/1.1\r\nHost: example.test\r\n\r\n";
        let request = parse_request(raw).unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "http://example.test/page");
        assert_eq!(request.host, "example.test");
        assert_eq!(request.port, 80);
        assert!(!request.is_connect());
        assert_eq!(request.head_len, raw.len());
    }

    #[test]
    fn test_parse_connect_request() {
        let request = parse_request(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n").unwrap();

        assert!(request.is_connect());
        assert_eq!(request.target, "example.test:443");
        assert_eq!(request.host, "example.test");
        assert_eq!(request.port, 443);
    }

    #[test]
    fn test_connect_defaults_to_443_from_host_header() {
        let raw = b"CONNECT example.test HTTP/1.1\r\nHost: example.test\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.port, 443);
    }

    #[test]
    fn test_host_header_port_wins() {
        let raw = b"GET http://example.test/ HTTP/1.1\r\nhost: example.test:8081\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.host, "example.test");
        assert_eq!(request.port, 8081);
    }

    #[test]
    fn test_missing_host_falls_back_to_url() {
        let raw = b"GET http://user@example.test:8000/x?y HTTP/1.1\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.host, "example.test");
        assert_eq!(request.port, 8000);
    }

    #[test]
    fn test_missing_host_on_origin_form_is_an_error() {
        let raw = b"GET /index.html HTTP/1.1\r\n\r\n";
        assert!(matches!(parse_request(raw), Err(ProxyError::Parse(_))));
    }

    #[test]
    fn test_malformed_request_line() {
        assert!(parse_request(b"").is_err());
        assert!(parse_request(b"GARBAGE\r\n\r\n").is_err());
    }

    #[test]
    fn test_content_length_and_remaining_body() {
        let raw = b"POST http://example.test/ HTTP/1.1\r\nHost: example.test\r\nContent-Length: 10\r\n\r\nabc";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.content_length, Some(10));
        assert_eq!(request.remaining_body(raw.len()), 7);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("[::1]:8443", 443).unwrap(),
            ("::1".to_string(), 8443)
        );
        assert_eq!(split_host_port("[::1]", 80).unwrap(), ("::1".to_string(), 80));
        assert!(split_host_port("example.test:0", 80).is_err());
        assert!(split_host_port("example.test:http", 80).is_err());
        assert!(split_host_port(":80", 80).is_err());
    }

    #[tokio::test]
    async fn test_read_head_across_fragments() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"GET http://a.test/ HTTP/1.1\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"Host: a.test\r").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"\n\r\n").await.unwrap();
            // Keep the pipe open; the reader must stop at the terminator.
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let head = read_request_head(&mut server, 16, 1024, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(parse_request(&head).unwrap().host, "a.test");
    }

    #[tokio::test]
    async fn test_read_head_rejects_oversized_headers() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client.write_all(&[b'a'; 600]).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let result = read_request_head(&mut server, 64, 256, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ProxyError::HeaderTooLarge { limit: 256 })));
    }

    #[tokio::test]
    async fn test_read_head_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let result = read_request_head(&mut server, 64, 1024, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProxyError::ReadTimeout)));
    }
}
