//! Thin HTTP request model.
//!
//! Only the request representation lives here; parsing request bytes and
//! serving responses belong to the server layer above the networking
//! core. The model mirrors what a parser needs to deposit: method,
//! version, path, query, receive time and a header map.

use crate::time::Timestamp;

use std::collections::HashMap;

/// Request method. `Invalid` is the unset/unknown state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Invalid,
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    fn parse(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "HEAD" => Method::Head,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            _ => Method::Invalid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Invalid => "UNKNOWN",
        }
    }
}

/// Protocol version of the request line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Unknown,
    Http10,
    Http11,
}

/// One parsed HTTP request.
///
/// Header names are case-sensitive and later insertions of the same name
/// win; header values are stored with surrounding whitespace trimmed.
#[derive(Debug)]
pub struct HttpRequest {
    method: Method,
    version: Version,
    path: String,
    query: String,
    receive_time: Timestamp,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest {
            method: Method::Invalid,
            version: Version::Unknown,
            path: String::new(),
            query: String::new(),
            receive_time: Timestamp::invalid(),
            headers: HashMap::new(),
        }
    }

    /// Sets the method from its request-line token. Returns whether the
    /// token named a known method.
    ///
    /// # Panics
    ///
    /// Panics if a method was already set; a parser sets it exactly once.
    pub fn set_method(&mut self, token: &str) -> bool {
        assert_eq!(self.method, Method::Invalid, "request method set twice");
        self.method = Method::parse(token);
        self.method != Method::Invalid
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_query(&mut self, query: &str) {
        self.query = query.to_string();
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn set_receive_time(&mut self, receive_time: Timestamp) {
        self.receive_time = receive_time;
    }

    pub fn receive_time(&self) -> Timestamp {
        self.receive_time
    }

    /// Stores a header. The value keeps its inner whitespace but loses
    /// leading and trailing whitespace; a repeated name overwrites.
    pub fn add_header(&mut self, field: &str, value: &str) {
        self.headers
            .insert(field.to_string(), value.trim().to_string());
    }

    /// Looks a header up by exact, case-sensitive name.
    pub fn get_header(&self, field: &str) -> Option<&str> {
        self.headers.get(field).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

impl Default for HttpRequest {
    fn default() -> HttpRequest {
        HttpRequest::new()
    }
}
