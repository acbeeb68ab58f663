//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses, serializing
//! them to a byte buffer for transmission over TCP, and parsing the replies
//! that come back from backends.

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use thiserror::Error;

use super::{Headers, Method, StatusCode};

/// Framing headers owned by the serializer; stripped from parsed upstream replies.
const FRAMING: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
];

/// Errors produced while parsing a backend's response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete: more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("unrecognized status code {0}")]
    UnknownStatus(u16),

    #[error("malformed chunked body")]
    InvalidChunk,
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use switchyard::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// Creates a response with a JSON body and `Content-Type: application/json`.
    ///
    /// Serialization failures degrade to an empty `500` rather than panicking.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .header("Content-Type", "application/json")
                .body_bytes(body),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response");
                Self::new(StatusCode::InternalServerError)
            }
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body as raw bytes.
    pub fn payload(&self) -> &[u8] {
        &self.body
    }

    /// Returns the body as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses a complete HTTP/1.1 response, as read from a backend that closed
    /// the connection after replying.
    ///
    /// The body is delimited by `Content-Length` when present, decoded when
    /// `Transfer-Encoding: chunked`, and otherwise runs to the end of `buf`.
    /// Framing headers are dropped because [`into_bytes`](Self::into_bytes)
    /// regenerates them.
    pub fn parse(buf: &[u8]) -> Result<Self, ResponseError> {
        Self::parse_for(buf, &Method::Get)
    }

    /// Like [`parse`](Self::parse), for the reply to a `method` request.
    ///
    /// Replies to HEAD, and 1xx, 204 and 304 replies, carry no body whatever
    /// their framing headers say. Their `Content-Length` is kept so the
    /// relayed reply still advertises it.
    pub fn parse_for(buf: &[u8], method: &Method) -> Result<Self, ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete),
        };

        let code = raw.code.ok_or(ResponseError::Incomplete)?;
        let status = StatusCode::from_u16(code).ok_or(ResponseError::UnknownStatus(code))?;

        let bodiless = *method == Method::Head
            || code < 200
            || matches!(status, StatusCode::NoContent | StatusCode::NotModified);

        let mut header_map = Headers::with_capacity(raw.headers.len());
        let mut content_length = None;
        let mut chunked = false;
        for header in raw.headers.iter() {
            let Ok(value) = std::str::from_utf8(header.value) else {
                continue;
            };
            let name = header.name.to_ascii_lowercase();
            if name == "content-length" {
                content_length = value.trim().parse::<usize>().ok();
            } else if name == "transfer-encoding" {
                chunked = value.to_ascii_lowercase().contains("chunked");
            }
            let keep = !FRAMING.contains(&name.as_str())
                || (bodiless && name == "content-length");
            if keep {
                header_map.insert(header.name, value);
            }
        }

        let rest = &buf[body_offset..];
        let body = if bodiless {
            Vec::new()
        } else if chunked {
            decode_chunked(rest)?
        } else if let Some(len) = content_length {
            if rest.len() < len {
                return Err(ResponseError::Incomplete);
            }
            rest[..len].to_vec()
        } else {
            rest.to_vec()
        };

        Ok(Self {
            status,
            headers: header_map,
            body,
            keep_alive: true,
        })
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written). A bodiless response keeps an
    ///   explicit `Content-Length`, as relayed replies to HEAD do.
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = if self.body.is_empty() {
            self.headers
                .get("content-length")
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0)
        } else {
            self.body.len()
        };

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        // Body
        if !self.body.is_empty() {
            buf.put(self.body.as_slice());
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

// Decode a `Transfer-Encoding: chunked` body; trailers are discarded.
fn decode_chunked(mut input: &[u8]) -> Result<Vec<u8>, ResponseError> {
    let mut out = Vec::new();
    loop {
        let line_end = find_crlf(input).ok_or(ResponseError::Incomplete)?;
        let size_line = std::str::from_utf8(&input[..line_end])
            .map_err(|_| ResponseError::InvalidChunk)?;
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size =
            usize::from_str_radix(size_hex, 16).map_err(|_| ResponseError::InvalidChunk)?;
        input = &input[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }
        if input.len() < size + 2 {
            return Err(ResponseError::Incomplete);
        }
        out.extend_from_slice(&input[..size]);
        if &input[size..size + 2] != b"\r\n" {
            return Err(ResponseError::InvalidChunk);
        }
        input = &input[size + 2..];
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
