//! HTTP-level value types used at the FastCGI boundary.

use std::collections::HashMap;
use std::fmt;

use wdx_core::status::http_status_text;

/// HTTP request methods.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    /// Anything else; carried for logging, rejected by routing.
    Unknown,
}

impl HttpMethod {
    /// Parses a `REQUEST_METHOD` value.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            _ => Self::Unknown,
        }
    }

    /// Canonical method name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request URI split into path and query.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Uri {
    raw: String,
    path: String,
    query: String,
}

impl Uri {
    /// Parses a `REQUEST_URI` value.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, query),
            None => (raw, ""),
        };
        Self {
            raw: raw.to_owned(),
            path: path.to_owned(),
            query: query.to_owned(),
        }
    }

    /// The URI as received.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Path component.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query component without the leading `?`.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Query parameters, undecoded. A key without `=` maps to an empty
    /// value.
    #[must_use]
    pub fn query_parameters(&self) -> HashMap<String, String> {
        let mut parameters = HashMap::new();
        for pair in self.query.split('&').filter(|pair| !pair.is_empty()) {
            match pair.split_once('=') {
                Some((name, value)) => parameters.insert(name.to_owned(), value.to_owned()),
                None => parameters.insert(pair.to_owned(), String::new()),
            };
        }
        parameters
    }
}

/// Percent-decodes a query component; `+` decodes to a space.
#[must_use]
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut position = 0;
    while position < bytes.len() {
        match bytes[position] {
            b'%' => {
                let decoded_byte = bytes
                    .get(position + 1..position + 3)
                    .and_then(|pair| str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok());
                match decoded_byte {
                    Some(byte) => {
                        decoded.push(byte);
                        position += 3;
                    }
                    None => {
                        decoded.push(b'%');
                        position += 1;
                    }
                }
            }
            b'+' => {
                decoded.push(b' ');
                position += 1;
            }
            byte => {
                decoded.push(byte);
                position += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// A response to write through the request object.
#[derive(Clone, Debug, Default)]
pub struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    /// A bodyless response with the given status.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Adds a response header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body plus its `Content-Type` and `Content-Length` headers.
    #[must_use]
    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        self.headers
            .push(("Content-Type".to_owned(), content_type.to_owned()));
        self.headers
            .push(("Content-Length".to_owned(), body.len().to_string()));
        self.body = body;
        self
    }

    /// A JSON response.
    #[must_use]
    pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status).with_body("application/json", body)
    }

    /// HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Status line text, e.g. `400 Bad Request`.
    #[must_use]
    pub fn status_line(&self) -> String {
        format!("{} {}", self.status, http_status_text(self.status))
    }

    /// Response headers in insertion order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Response body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_splits_path_and_query() {
        let uri = Uri::parse("/wda/parameters?id=3&full");
        assert_eq!(uri.path(), "/wda/parameters");
        assert_eq!(uri.query(), "id=3&full");
        let parameters = uri.query_parameters();
        assert_eq!(parameters["id"], "3");
        assert_eq!(parameters["full"], "");
    }

    #[test]
    fn uri_without_query_has_an_empty_map() {
        let uri = Uri::parse("/wda/parameters");
        assert_eq!(uri.path(), "/wda/parameters");
        assert!(uri.query_parameters().is_empty());
    }

    #[test]
    fn percent_decoding_handles_escapes_and_plus() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("%2Fpath%3Fx"), "/path?x");
        assert_eq!(percent_decode("broken%2"), "broken%2");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn methods_parse_case_sensitively() {
        assert_eq!(HttpMethod::parse("GET"), HttpMethod::Get);
        assert_eq!(HttpMethod::parse("DELETE"), HttpMethod::Delete);
        assert_eq!(HttpMethod::parse("get"), HttpMethod::Unknown);
    }

    #[test]
    fn body_sets_content_headers() {
        let response = HttpResponse::json(200, r#"{"ok":true}"#);
        assert_eq!(response.status_line(), "200 OK");
        let headers = response.headers();
        assert!(
            headers
                .iter()
                .any(|(name, value)| name == "Content-Type" && value == "application/json")
        );
        assert!(
            headers
                .iter()
                .any(|(name, value)| name == "Content-Length" && value == "11")
        );
    }
}
