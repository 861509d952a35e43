//! Parsed HTTP/1.1 request/response line-and-header representation, plus
//! the completed exchange record C5 hands to C8.

use std::collections::BTreeMap;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub path: String,
    pub query: BTreeMap<String, Vec<String>>,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A fully captured request/response exchange (§3 `HttpPair`), ready for
/// C8 to re-parse into a canonical record.
#[derive(Debug, Clone)]
pub struct HttpPair {
    pub request_bytes: Vec<u8>,
    pub response_bytes: Vec<u8>,
    pub request_at_ms: i64,
    pub response_at_ms: i64,
    pub destination_port: u16,
}

pub fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn parse_query(url: &str) -> (String, BTreeMap<String, Vec<String>>) {
    let mut query = BTreeMap::new();
    let Some((path, query_string)) = url.split_once('?') else {
        return (url.to_owned(), query);
    };

    for pair in query_string.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        query.entry(key.to_owned()).or_insert_with(Vec::new).push(value.to_owned());
    }

    (path.to_owned(), query)
}

fn parse_header_lines(lines: &[&str]) -> Result<Vec<(String, String)>, EngineError> {
    let mut headers = Vec::with_capacity(lines.len());
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or(EngineError::ProtocolViolation("header line missing ':'"))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
    Ok(headers)
}

/// Parses everything up to and including the blank line terminator.
/// `head` must not include the body.
pub fn parse_request_head(head: &[u8]) -> Result<HttpRequest, EngineError> {
    let text = std::str::from_utf8(head).map_err(|_| EngineError::ProtocolViolation("request head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(EngineError::ProtocolViolation("missing request line"))?;
    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or(EngineError::ProtocolViolation("missing method"))?.to_owned();
    let url = parts.next().ok_or(EngineError::ProtocolViolation("missing url"))?.to_owned();
    let version = parts.next().unwrap_or("HTTP/1.1").to_owned();

    let header_lines: Vec<&str> = lines.filter(|line| !line.is_empty()).collect();
    let headers = parse_header_lines(&header_lines)?;

    let (path, query) = parse_query(&url);

    Ok(HttpRequest {
        method,
        url,
        path,
        query,
        version,
        headers,
        body: Vec::new(),
    })
}

pub fn parse_response_head(head: &[u8]) -> Result<HttpResponse, EngineError> {
    let text = std::str::from_utf8(head).map_err(|_| EngineError::ProtocolViolation("response head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(EngineError::ProtocolViolation("missing status line"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(EngineError::ProtocolViolation("missing version"))?.to_owned();
    let status: u16 = parts
        .next()
        .ok_or(EngineError::ProtocolViolation("missing status code"))?
        .parse()
        .map_err(|_| EngineError::ProtocolViolation("status code is not a number"))?;
    let reason = parts.next().unwrap_or("").to_owned();

    let header_lines: Vec<&str> = lines.filter(|line| !line.is_empty()).collect();
    let headers = parse_header_lines(&header_lines)?;

    Ok(HttpResponse {
        version,
        status,
        reason,
        headers,
        body: Vec::new(),
    })
}

pub fn render_request_line_and_headers(request: &HttpRequest) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", request.method, request.url, request.version).into_bytes();
    for (name, value) in &request.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub fn render_response(response: &HttpResponse) -> Vec<u8> {
    let status_line = format!("{} {} {}\r\n", response.version, response.status, response.reason);
    let mut out = status_line.into_bytes();
    for (name, value) in &response.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out
}

pub fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    if let Some(entry) = headers.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(name)) {
        entry.1 = value;
    } else {
        headers.push((name.to_owned(), value));
    }
}
