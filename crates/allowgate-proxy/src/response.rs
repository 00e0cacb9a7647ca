//! Responses the proxy answers itself.
//!
//! Every connection serves a single request, so every response announces
//! `Connection: close`.

use std::borrow::Cow;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Sent once a tunnel to the origin is open. No headers, no body.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// A locally generated HTTP/1.1 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    reason: Cow<'static, str>,
    headers: Vec<(Cow<'static, str>, Cow<'static, str>)>,
    body: Vec<u8>,
    head_only: bool,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Vec::new(),
            body: Vec::new(),
            head_only: false,
        }
    }

    /// `200 OK` carrying an HTML page.
    pub fn html(body: Vec<u8>) -> Self {
        Self::new(200, "OK")
            .header("Content-Type", "text/html; charset=utf-8")
            .body(body)
    }

    /// A plain-text response.
    pub fn text(status: u16, reason: &'static str, body: impl Into<String>) -> Self {
        Self::new(status, reason)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.into().into_bytes())
    }

    /// `400 Bad Request` with the error text as body.
    pub fn bad_request(error: impl std::fmt::Display) -> Self {
        Self::text(400, "Bad Request", format!("Error: {}", error))
    }

    /// `500 Internal Server Error` with the error text as body.
    pub fn internal_error(error: impl std::fmt::Display) -> Self {
        Self::text(500, "Internal Server Error", format!("Error: {}", error))
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn header(
        mut self,
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
    ) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Drops the body and its length, as for a `HEAD` answer.
    pub fn head_only(mut self) -> Self {
        self.body.clear();
        self.head_only = true;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Serializes the status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.head_only {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Writes the response and flushes the writer.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}
