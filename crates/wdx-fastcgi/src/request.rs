//! One FastCGI request with strict phase ordering.
//!
//! The phase only ever moves forward:
//! `initial → accepted → sending_status → sending_headers → sending_body →
//! finished`. Every terminal path reaches `finished`; dropping a request in
//! any earlier phase force-finishes it so the web server is never left with
//! a dangling connection.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

use tracing::{debug, error, warn};

use crate::error::FcgiError;
use crate::http::{HttpMethod, HttpResponse, Uri, percent_decode};
use crate::record::{
    BeginRequestBody, FLAG_KEEP_CONN, MAX_RECORD_CONTENT, ROLE_RESPONDER, RecordType,
    STATUS_REQUEST_COMPLETE, STATUS_UNKNOWN_ROLE, end_request_body, parse_name_value_pairs,
    read_record, write_record,
};

/// Largest request body accepted, in bytes.
pub const MAX_CONTENT: u64 = 1024 * 1024;

const PARAMS_LIMIT: usize = 256 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Phase {
    Initial,
    Accepted,
    SendingStatus,
    SendingHeaders,
    SendingBody,
    Finished,
}

/// One accepted FastCGI connection carrying one request.
pub struct Request {
    stream: UnixStream,
    request_id: u16,
    keep_connection: bool,
    params: HashMap<String, String>,
    method: HttpMethod,
    uri: Uri,
    query_parameters: HashMap<String, String>,
    remote_host: String,
    content_length: u64,
    content_consumed: bool,
    stdin_buffer: Vec<u8>,
    stdin_position: usize,
    stdin_done: bool,
    response_headers: Vec<(String, String)>,
    phase: Phase,
}

enum ContentLengthCheck {
    Valid(u64),
    Malformed,
    TooLarge,
}

fn check_content_length(raw: Option<&String>) -> ContentLengthCheck {
    let Some(raw) = raw.filter(|raw| !raw.is_empty()) else {
        return ContentLengthCheck::Valid(0);
    };
    match raw.parse::<u64>() {
        Ok(length) if length > MAX_CONTENT => ContentLengthCheck::TooLarge,
        Ok(length) => ContentLengthCheck::Valid(length),
        Err(_) => ContentLengthCheck::Malformed,
    }
}

impl Request {
    /// Wraps an accepted connection; the handshake happens in
    /// [`Request::accept`].
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            request_id: 0,
            keep_connection: false,
            params: HashMap::new(),
            method: HttpMethod::Get,
            uri: Uri::default(),
            query_parameters: HashMap::new(),
            remote_host: String::new(),
            content_length: 0,
            content_consumed: false,
            stdin_buffer: Vec::new(),
            stdin_position: 0,
            stdin_done: false,
            response_headers: Vec::new(),
            phase: Phase::Initial,
        }
    }

    /// Performs the FastCGI accept handshake and reads the parameter map.
    ///
    /// Returns whether the request should be dispatched. A malformed
    /// `CONTENT_LENGTH` is answered with 400, a body beyond
    /// [`MAX_CONTENT`] with 413; both cases return `false` with the request
    /// already responded.
    pub fn accept(&mut self) -> Result<bool, FcgiError> {
        if self.phase != Phase::Initial {
            return Err(FcgiError::Phase {
                operation: "accept",
            });
        }

        let (header, content) = read_record(&mut self.stream)?.ok_or(FcgiError::UnexpectedEof)?;
        if header.record_type != RecordType::BeginRequest {
            return Err(FcgiError::UnexpectedRecord(header.record_type.name()));
        }
        self.request_id = header.request_id;
        let begin = BeginRequestBody::parse(&content)?;
        self.keep_connection = (begin.flags & FLAG_KEEP_CONN) != 0;
        if begin.role != ROLE_RESPONDER {
            let _ = write_record(
                &mut self.stream,
                RecordType::EndRequest,
                self.request_id,
                &end_request_body(1, STATUS_UNKNOWN_ROLE),
            );
            self.phase = Phase::Finished;
            return Ok(false);
        }

        let mut raw_params = Vec::new();
        loop {
            let (header, content) =
                read_record(&mut self.stream)?.ok_or(FcgiError::UnexpectedEof)?;
            if header.request_id != self.request_id {
                continue;
            }
            match header.record_type {
                RecordType::Params => {
                    if content.is_empty() {
                        break;
                    }
                    raw_params.extend_from_slice(&content);
                    if raw_params.len() > PARAMS_LIMIT {
                        return Err(FcgiError::OversizedParams);
                    }
                }
                RecordType::Stdin => {
                    // body records arriving before the params terminator
                    if content.is_empty() {
                        self.stdin_done = true;
                    } else {
                        self.stdin_buffer.extend_from_slice(&content);
                    }
                }
                RecordType::AbortRequest => {
                    self.finish_unchecked();
                    return Ok(false);
                }
                other => return Err(FcgiError::UnexpectedRecord(other.name())),
            }
        }
        parse_name_value_pairs(&raw_params, &mut self.params)?;
        self.phase = Phase::Accepted;

        self.remote_host = format!(
            "{}:{}",
            self.param("REMOTE_ADDR").unwrap_or_default(),
            self.param("REMOTE_PORT").unwrap_or_default()
        );
        self.method = HttpMethod::parse(self.param("REQUEST_METHOD").unwrap_or_default());
        let raw_uri = self.param("REQUEST_URI").unwrap_or_default();
        debug!(uri = raw_uri, "accept request");
        self.uri = Uri::parse(raw_uri);
        self.query_parameters = self.uri.query_parameters();
        debug!(
            remote = %self.remote_host,
            method = %self.method,
            path = self.uri.path(),
            query = self.uri.query(),
            "received request"
        );

        match check_content_length(self.params.get("CONTENT_LENGTH")) {
            ContentLengthCheck::Valid(length) => {
                self.content_length = length;
                Ok(true)
            }
            ContentLengthCheck::Malformed => {
                warn!(
                    value = self.params.get("CONTENT_LENGTH").map(String::as_str),
                    "rejecting request with malformed CONTENT_LENGTH"
                );
                self.reject(400);
                Ok(false)
            }
            ContentLengthCheck::TooLarge => {
                warn!(
                    value = self.params.get("CONTENT_LENGTH").map(String::as_str),
                    "rejecting request with oversized body"
                );
                self.reject(413);
                Ok(false)
            }
        }
    }

    /// Raw FastCGI parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// True when the front webserver terminated TLS for this request.
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.param("HTTPS") == Some("on")
    }

    /// True for requests from the local machine.
    #[must_use]
    pub fn is_localhost(&self) -> bool {
        // every host part after 127.0.0. is a valid IPv4 localhost address
        self.param("REMOTE_ADDR")
            .is_some_and(|addr| addr.starts_with("127.0.0.") || addr == "::1")
    }

    /// HTTP method of the request.
    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Request URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Peer address and port, for log correlation.
    #[must_use]
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// True when the query string carries `name`.
    #[must_use]
    pub fn has_query_parameter(&self, name: &str) -> bool {
        self.query_parameters.contains_key(name)
    }

    /// Query parameter value, percent-decoded on request.
    #[must_use]
    pub fn query_parameter(&self, name: &str, decode: bool) -> Option<String> {
        let value = self.query_parameters.get(name)?;
        Some(if decode {
            percent_decode(value)
        } else {
            value.clone()
        })
    }

    /// True when the client sent the HTTP header `name`.
    #[must_use]
    pub fn has_header(&self, name: &str) -> bool {
        self.params.contains_key(&canonical_header_name(name))
    }

    /// Client HTTP header by name, case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.params
            .get(&canonical_header_name(name))
            .map(String::as_str)
    }

    /// The client's `Accept` header, or empty.
    #[must_use]
    pub fn accepted_types(&self) -> &str {
        self.header("Accept").unwrap_or_default()
    }

    /// The request's content type, or empty.
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.param("CONTENT_TYPE").unwrap_or_default()
    }

    /// Validated body length in bytes.
    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Hands out the single-shot body stream.
    pub fn content_stream(&mut self) -> Result<ContentStream<'_>, FcgiError> {
        if self.content_consumed {
            return Err(FcgiError::ContentConsumed);
        }
        self.content_consumed = true;
        if !self.params.contains_key("CONTENT_TYPE") {
            warn!("request body requested but no Content-Type header is set");
        }
        Ok(ContentStream { request: self })
    }

    /// Reads the whole body; subject to the same single-shot rule.
    pub fn content(&mut self) -> Result<Vec<u8>, FcgiError> {
        let mut stream = self.content_stream()?;
        let mut body = Vec::new();
        stream.read_to_end(&mut body)?;
        Ok(body)
    }

    /// Queues a header to be written ahead of the response's own headers.
    pub fn add_response_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), FcgiError> {
        if self.phase != Phase::Accepted && self.phase != Phase::SendingHeaders {
            return Err(FcgiError::Phase {
                operation: "add_response_header",
            });
        }
        self.response_headers.push((name.into(), value.into()));
        Ok(())
    }

    /// Writes status line, headers and body of `response`.
    ///
    /// A connection failure mid-response force-finishes the request; there
    /// is no way to rescue a partially written answer.
    pub fn respond(&mut self, response: &HttpResponse) -> Result<(), FcgiError> {
        if self.phase != Phase::Accepted {
            error!("failed to respond: request in wrong state (not accepted)");
            return Err(FcgiError::Phase {
                operation: "respond",
            });
        }
        debug!(
            remote = %self.remote_host,
            method = %self.method,
            path = self.uri.path(),
            status = response.status(),
            "respond to request"
        );

        let result = self.write_response(response);
        if let Err(error) = &result {
            error!(%error, "failed to respond, force-finishing the request");
            self.finish_unchecked();
        }
        result
    }

    fn write_response(&mut self, response: &HttpResponse) -> Result<(), FcgiError> {
        self.phase = Phase::SendingStatus;
        let status_line = format!("Status: {}\r\n", response.status_line());
        self.write_stdout(status_line.as_bytes())?;

        self.phase = Phase::SendingHeaders;
        let mut head = String::new();
        for (name, value) in &self.response_headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        for (name, value) in response.headers() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.write_stdout(head.as_bytes())?;

        self.phase = Phase::SendingBody;
        if !response.body().is_empty() {
            self.send_data(response.body())?;
        }
        Ok(())
    }

    /// Writes raw body data; legal only while sending the body.
    pub fn send_data(&mut self, data: &[u8]) -> Result<(), FcgiError> {
        if self.phase != Phase::SendingBody {
            return Err(FcgiError::Phase {
                operation: "send_data",
            });
        }
        self.write_stdout(data)
    }

    /// True once a status line has been written.
    #[must_use]
    pub fn is_responded(&self) -> bool {
        self.phase > Phase::Accepted
    }

    /// Completes the response; legal only after the body phase started.
    pub fn finish(&mut self) -> Result<(), FcgiError> {
        match self.phase {
            Phase::SendingBody => {
                self.finish_unchecked();
                Ok(())
            }
            Phase::Finished => Err(FcgiError::AlreadyFinished),
            _ => Err(FcgiError::Phase {
                operation: "finish",
            }),
        }
    }

    fn reject(&mut self, status: u16) {
        if self.respond(&HttpResponse::new(status)).is_ok() {
            let _ = self.finish();
        }
    }

    fn write_stdout(&mut self, data: &[u8]) -> Result<(), FcgiError> {
        for chunk in data.chunks(MAX_RECORD_CONTENT) {
            write_record(&mut self.stream, RecordType::Stdout, self.request_id, chunk)?;
        }
        Ok(())
    }

    fn finish_unchecked(&mut self) {
        self.phase = Phase::Finished;
        let _ = write_record(&mut self.stream, RecordType::Stdout, self.request_id, &[]);
        let _ = write_record(
            &mut self.stream,
            RecordType::EndRequest,
            self.request_id,
            &end_request_body(0, STATUS_REQUEST_COMPLETE),
        );
        let _ = self.stream.flush();
        if !self.keep_connection {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
        debug!(
            remote = %self.remote_host,
            method = %self.method,
            path = self.uri.path(),
            "finished request"
        );
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.phase != Phase::Finished {
            self.finish_unchecked();
        }
    }
}

/// Header-name canonicalization: uppercase, `-` to `_`, `HTTP_` prefix.
fn canonical_header_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len() + 5);
    canonical.push_str("HTTP_");
    for c in name.chars() {
        canonical.push(match c {
            '-' => '_',
            other => other.to_ascii_uppercase(),
        });
    }
    canonical
}

/// Single-shot reader over the request body's stdin records.
pub struct ContentStream<'a> {
    request: &'a mut Request,
}

impl Read for ContentStream<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let request = &mut *self.request;
            if request.stdin_position < request.stdin_buffer.len() {
                let available = &request.stdin_buffer[request.stdin_position..];
                let count = available.len().min(out.len());
                out[..count].copy_from_slice(&available[..count]);
                request.stdin_position += count;
                if request.stdin_position == request.stdin_buffer.len() {
                    request.stdin_buffer.clear();
                    request.stdin_position = 0;
                }
                return Ok(count);
            }
            if request.stdin_done {
                return Ok(0);
            }
            match read_record(&mut request.stream) {
                Ok(Some((header, content))) => {
                    if header.request_id != request.request_id {
                        continue;
                    }
                    match header.record_type {
                        RecordType::Stdin => {
                            if content.is_empty() {
                                request.stdin_done = true;
                            } else {
                                request.stdin_buffer = content;
                                request.stdin_position = 0;
                            }
                        }
                        RecordType::AbortRequest => request.stdin_done = true,
                        _ => {}
                    }
                }
                Ok(None) => request.stdin_done = true,
                Err(FcgiError::Io(error)) => return Err(error),
                Err(other) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, other.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_validation() {
        assert!(matches!(
            check_content_length(None),
            ContentLengthCheck::Valid(0)
        ));
        assert!(matches!(
            check_content_length(Some(&String::new())),
            ContentLengthCheck::Valid(0)
        ));
        assert!(matches!(
            check_content_length(Some(&"42".to_owned())),
            ContentLengthCheck::Valid(42)
        ));
        assert!(matches!(
            check_content_length(Some(&"12foo".to_owned())),
            ContentLengthCheck::Malformed
        ));
        assert!(matches!(
            check_content_length(Some(&"-3".to_owned())),
            ContentLengthCheck::Malformed
        ));
        assert!(matches!(
            check_content_length(Some(&(MAX_CONTENT + 1).to_string())),
            ContentLengthCheck::TooLarge
        ));
        assert!(matches!(
            check_content_length(Some(&MAX_CONTENT.to_string())),
            ContentLengthCheck::Valid(MAX_CONTENT)
        ));
    }

    #[test]
    fn header_names_are_canonicalized() {
        assert_eq!(canonical_header_name("Authorization"), "HTTP_AUTHORIZATION");
        assert_eq!(canonical_header_name("X-Request-Id"), "HTTP_X_REQUEST_ID");
        assert_eq!(canonical_header_name("accept"), "HTTP_ACCEPT");
    }
}
