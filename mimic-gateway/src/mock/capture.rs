//! Mock Capture Sink (C8): turns a completed `HttpPair` into a canonical
//! record and hands it to the outbound mock stream.

use std::collections::BTreeMap;

use mock_sink::{CanonicalPayload, CapturedMock, MockKind, MockSinkSender};
use tracing::debug;

use crate::bypass::is_pass_through;
use crate::config::CompiledBypassRule;
use crate::error::EngineError;
use crate::http::gzip;
use crate::http::message::{header_lookup, parse_request_head, parse_response_head, HttpPair};

/// Re-parses completed exchanges, applies a final bypass check, and
/// forwards survivors to the sink's unbounded channel. Never blocks the
/// HTTP engine: `capture` only enqueues.
pub struct CaptureSink {
    sender: MockSinkSender,
    bypass_rules: Vec<CompiledBypassRule>,
}

impl CaptureSink {
    pub fn new(sender: MockSinkSender, bypass_rules: Vec<CompiledBypassRule>) -> Self {
        Self { sender, bypass_rules }
    }

    pub fn capture(&self, pair: HttpPair) {
        if let Err(error) = self.try_capture(pair) {
            debug!(%error, "dropping malformed captured exchange");
        }
    }

    fn try_capture(&self, pair: HttpPair) -> Result<(), EngineError> {
        let (request_head, request_body) = split_head_and_body(&pair.request_bytes)?;
        let request = parse_request_head(request_head)?;
        let host = header_lookup(&request.headers, "Host");

        if is_pass_through(host, Some(request.path.as_str()), pair.destination_port, &self.bypass_rules) {
            return Ok(());
        }

        let (response_head, response_body) = split_head_and_body(&pair.response_bytes)?;
        let response = parse_response_head(response_head)?;

        let response_body = if header_lookup(&response.headers, "Content-Encoding").is_some_and(|v| v.eq_ignore_ascii_case("gzip")) {
            gzip::decompress(response_body)?
        } else {
            response_body.to_vec()
        };

        self.sender.send(CapturedMock {
            kind: MockKind::Http,
            request: CanonicalPayload {
                status_or_method: request.method.clone(),
                url_or_empty: request.url.clone(),
                headers: canonicalize_headers(&request.headers),
                query: request.query.clone(),
                body: request_body.to_vec(),
            },
            response: CanonicalPayload {
                status_or_method: response.status.to_string(),
                url_or_empty: String::new(),
                headers: canonicalize_headers(&response.headers),
                query: BTreeMap::new(),
                body: response_body,
            },
            request_at_ms: pair.request_at_ms,
            response_at_ms: pair.response_at_ms,
            destination_port: pair.destination_port,
        });

        Ok(())
    }
}

fn split_head_and_body(bytes: &[u8]) -> Result<(&[u8], &[u8]), EngineError> {
    let pos = bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(EngineError::ProtocolViolation("missing header terminator in captured bytes"))?;
    Ok((&bytes[..pos + 4], &bytes[pos + 4..]))
}

fn canonicalize_headers(headers: &[(String, String)]) -> BTreeMap<String, String> {
    headers.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.clone())).collect()
}
