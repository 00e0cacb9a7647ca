//! HTTP/1 request head parsing.
//!
//! Only the head is parsed here. For `CONNECT` everything after the head
//! belongs to the tunnel, so the reader is left positioned on the first byte
//! after the blank line.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

/// Maximum size of a request line plus headers.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Maximum size of a request body the proxy reads itself.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// A parsed request line and header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the `Host` header, if present and non-empty.
    pub fn host(&self) -> Option<&str> {
        self.header("host").map(str::trim).filter(|h| !h.is_empty())
    }

    /// Returns the path and query of the target.
    ///
    /// Proxied requests carry an absolute-form target (`http://host/path`);
    /// only the part after the authority is returned for those.
    pub fn path(&self) -> &str {
        let Some((_, rest)) = self.target.split_once("://") else {
            return &self.target;
        };

        match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        }
    }

    /// Returns the declared body length, or zero when absent.
    pub fn content_length(&self) -> Result<usize> {
        match self.header("content-length") {
            None => Ok(0),
            Some(value) => value.trim().parse().map_err(|_| {
                ProxyError::BadRequest(format!("invalid Content-Length: {}", value))
            }),
        }
    }
}

/// Reads a request head. Returns `None` if the peer closed before sending anything.
pub async fn read_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0usize;

    let Some(request_line) = read_line(reader, &mut consumed).await? else {
        return Ok(None);
    };

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::BadRequest(format!(
            "malformed request line: {}",
            request_line
        )));
    };

    if !version.starts_with("HTTP/") {
        return Err(ProxyError::BadRequest(format!(
            "unsupported protocol: {}",
            version
        )));
    }

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, &mut consumed)
            .await?
            .ok_or_else(|| ProxyError::BadRequest("connection closed inside headers".into()))?;

        if line.is_empty() {
            break;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::BadRequest(format!("malformed header: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    }))
}

/// Reads a body of exactly `len` bytes.
pub async fn read_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if len > MAX_BODY_SIZE {
        return Err(ProxyError::BadRequest(format!(
            "body of {} bytes exceeds {} bytes",
            len, MAX_BODY_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Reads one CRLF- or LF-terminated line without its terminator, keeping the
/// running total of the head under [`MAX_HEAD_SIZE`].
async fn read_line<R>(reader: &mut R, consumed: &mut usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = MAX_HEAD_SIZE.saturating_sub(*consumed) as u64;
    let mut line = Vec::new();
    let n = (&mut *reader).take(remaining).read_until(b'\n', &mut line).await?;
    *consumed += n;

    if n == 0 {
        if remaining == 0 {
            return Err(ProxyError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        return Ok(None);
    }

    if line.last() != Some(&b'\n') {
        if *consumed >= MAX_HEAD_SIZE {
            return Err(ProxyError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        return Err(ProxyError::BadRequest("connection closed mid-line".into()));
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}
