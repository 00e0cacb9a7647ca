//! Plain HTTP forwarding.
//!
//! Allowed plain-HTTP requests are re-issued to the origin with the upstream
//! client and the origin's answer is streamed back chunk by chunk.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Method, Url};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};
use crate::request::RequestHead;
use crate::response::Response;
use crate::whitelist::{host_without_port, split_authority};

/// Response headers that describe the origin connection rather than the
/// payload. The body is re-framed by connection close, so these are dropped.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

/// Forwards requests to origins.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// Builds a forwarder. `timeout` bounds connecting to the origin and
    /// each wait for more response bytes; a body that keeps arriving may
    /// take as long as it needs. `None` leaves both unbounded.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        // Redirects go back to the client untouched and the proxy never
        // chains through another proxy from the environment.
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .no_proxy();
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout).read_timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Sends the request to `url` and streams the answer to `client`.
    /// Failures reaching the origin are answered with a 500.
    ///
    /// Returns the status code sent to the client.
    pub async fn forward<W>(&self, head: &RequestHead, url: Url, client: &mut W) -> Result<u16>
    where
        W: AsyncWrite + Unpin,
    {
        let method = Method::from_bytes(head.method.as_bytes())
            .map_err(|_| ProxyError::BadRequest(format!("invalid method: {}", head.method)))?;

        tracing::debug!("Forwarding {} {}", method, url);

        let response = match self
            .client
            .request(method, url.clone())
            .headers(upstream_headers(head))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Upstream request to {} failed: {}", url, e);
                let response = Response::internal_error(&e);
                response.write_to(client).await?;
                return Ok(response.status());
            }
        };

        let status = response.status();
        client.write_all(&response_head(status, response.headers())).await?;

        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            client.write_all(&chunk).await?;
        }
        client.flush().await?;

        tracing::debug!("Forwarded {} -> {}", url, status.as_u16());

        Ok(status.as_u16())
    }
}

/// Builds the origin URL for a request carrying `Host: {authority}`.
///
/// The authority must be a plain `host[:port]` and the parsed URL must name
/// the same host, so the host the whitelist is asked about is the host that
/// gets contacted.
pub fn upstream_url(authority: &str, path: &str) -> Result<Url> {
    let invalid_host = || ProxyError::BadRequest(format!("invalid Host: {}", authority));

    let (host, _) = split_authority(authority).ok_or_else(invalid_host)?;
    if !path.starts_with('/') {
        return Err(ProxyError::BadRequest(format!(
            "invalid request target: {}",
            path
        )));
    }

    let url = Url::parse(&format!("http://{}{}", authority, path))
        .map_err(|e| ProxyError::BadRequest(format!("invalid URL: {}", e)))?;

    match url.host_str() {
        Some(parsed) if host_without_port(parsed).eq_ignore_ascii_case(host) => Ok(url),
        _ => Err(invalid_host()),
    }
}

/// Copies every request header except `Host`, which the client derives from the URL.
fn upstream_headers(head: &RequestHead) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }

        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::debug!("Dropping unrepresentable header {:?}", name),
        }
    }
    headers
}

/// Serializes the origin's status line and headers for the client.
fn response_head(status: reqwest::StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();

    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    head.extend_from_slice(b"Connection: close\r\n\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn get(target: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Serves one canned response and returns the request head it received.
    async fn one_shot_origin(
        response: &'static [u8],
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                head.push_str(&line);
            }
            reader.get_mut().write_all(response).await.unwrap();
            head
        });

        (addr.to_string(), handle)
    }

    #[test]
    fn upstream_headers_drop_host() {
        let head = get("/", &[("Host", "a.com"), ("Accept", "text/html"), ("X-Id", "7")]);
        let headers = upstream_headers(&head);

        assert!(headers.get("host").is_none());
        assert_eq!(headers.get("accept").unwrap(), "text/html");
        assert_eq!(headers.get("x-id").unwrap(), "7");
    }

    #[test]
    fn response_head_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));

        let head = String::from_utf8(response_head(reqwest::StatusCode::NOT_FOUND, &headers))
            .unwrap();

        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("content-type: text/plain\r\n"));
        assert!(!head.contains("chunked"));
        assert!(!head.contains("keep-alive"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
    }

    #[tokio::test]
    async fn forwards_and_streams_response() {
        let (origin, handle) = one_shot_origin(
            b"HTTP/1.1 201 Created\r\nContent-Length: 5\r\nX-Origin: yes\r\n\r\nhello",
        )
        .await;

        let forwarder = Forwarder::new(Some(Duration::from_secs(5))).unwrap();
        let head = get(
            &format!("http://{}/path?q=1", origin),
            &[("Host", origin.as_str()), ("X-Client", "abc")],
        );

        let mut out = Vec::new();
        let url = upstream_url(&origin, head.path()).unwrap();
        let status = forwarder.forward(&head, url, &mut out).await.unwrap();
        assert_eq!(status, 201);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("x-origin: yes\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));

        let seen = handle.await.unwrap();
        assert!(seen.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(seen.to_ascii_lowercase().contains("x-client: abc"));
    }

    #[tokio::test]
    async fn unreachable_origin_is_500() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let forwarder = Forwarder::new(Some(Duration::from_secs(5))).unwrap();
        let mut out = Vec::new();
        let url = upstream_url(&addr, "/").unwrap();
        let status = forwarder
            .forward(&get("/", &[("Host", addr.as_str())]), url, &mut out)
            .await
            .unwrap();

        assert_eq!(status, 500);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("\r\n\r\nError: "));
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let (origin, handle) = one_shot_origin(
            b"HTTP/1.1 302 Found\r\nLocation: http://elsewhere.invalid/\r\nContent-Length: 0\r\n\r\n",
        )
        .await;

        let forwarder = Forwarder::new(None).unwrap();
        let mut out = Vec::new();
        let url = upstream_url(&origin, "/").unwrap();
        let status = forwarder
            .forward(&get("/", &[("Host", origin.as_str())]), url, &mut out)
            .await
            .unwrap();

        assert_eq!(status, 302);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("location: http://elsewhere.invalid/\r\n"));
        handle.await.unwrap();
    }

    #[test]
    fn upstream_url_keeps_checked_host() {
        let url = upstream_url("Docs.rs:8080", "/a?b=1").unwrap();
        assert_eq!(url.host_str(), Some("docs.rs"));
        assert_eq!(url.port(), Some(8080));
        assert_eq!(url.path(), "/a");
        assert_eq!(url.query(), Some("b=1"));

        let url = upstream_url("[::1]:80", "/").unwrap();
        assert_eq!(url.host_str(), Some("[::1]"));
    }

    #[test]
    fn upstream_url_rejects_host_smuggling() {
        for authority in [
            "127.0.0.1:1/?.allowed.test",
            "evil.com?.allowed.test",
            "evil.com#.allowed.test",
            "evil.com\\.allowed.test",
            "evil.com@allowed.test",
            "allowed.test@evil.com",
        ] {
            assert!(
                matches!(upstream_url(authority, "/"), Err(ProxyError::BadRequest(_))),
                "{}",
                authority
            );
        }

        // A path that does not start at the root could carry userinfo.
        assert!(upstream_url("allowed.test", "@evil.com/").is_err());
        // Numeric forms the URL parser rewrites no longer match the host checked.
        assert!(upstream_url("0x7f.1", "/").is_err());
    }

    #[tokio::test]
    async fn slow_body_streams_past_the_idle_bound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }

            let stream = reader.get_mut();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await
                .unwrap();
            // Each gap stays under the bound, the whole body does not.
            for part in ["one", "two", "three", "four"] {
                stream
                    .write_all(format!("{:x}\r\n{}\r\n", part.len(), part).as_bytes())
                    .await
                    .unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
            stream.write_all(b"0\r\n\r\n").await.unwrap();
        });

        let forwarder = Forwarder::new(Some(Duration::from_secs(1))).unwrap();
        let head = get("/", &[("Host", origin.as_str())]);
        let url = upstream_url(&origin, "/").unwrap();

        let mut out = Vec::new();
        let status = forwarder.forward(&head, url, &mut out).await.unwrap();
        assert_eq!(status, 200);

        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("\r\n\r\nonetwothreefour"), "{}", text);
        handle.await.unwrap();
    }
}
