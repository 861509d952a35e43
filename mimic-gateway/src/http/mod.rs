//! HTTP Engine (C5): full HTTP/1.1 request/response framing, record and
//! mock modes.
//!
//! The header-terminator scan lives in [`framing`], adapted from
//! `proxy-http`'s `Frame::read`; everything above it (chunked/
//! content-length dispatch, Expect/100-continue, gzip, the keep-alive
//! loop) is new, since there is no server-side HTTP client/server
//! framing layer to draw on for the record/mock request-response cycle.

pub mod framing;
pub mod gzip;
pub mod message;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::bypass::is_pass_through;
use crate::config::CompiledBypassRule;
use crate::error::EngineError;
use crate::mock::{match_request, CaptureSink, MatchOutcome, MockKind, MockStoreHandle, RequestPayload};
use message::{header_lookup, parse_request_head, parse_response_head, render_request_line_and_headers, render_response, set_header, HttpPair, HttpRequest, HttpResponse};

enum BodyFraming {
    ContentLength(usize),
    Chunked,
    None,
}

fn body_framing(headers: &[(String, String)]) -> Result<BodyFraming, EngineError> {
    if header_lookup(headers, "Transfer-Encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
        return Ok(BodyFraming::Chunked);
    }
    if let Some(len) = header_lookup(headers, "Content-Length") {
        let len: usize = len.trim().parse().map_err(|_| EngineError::ProtocolViolation("bad Content-Length"))?;
        return Ok(BodyFraming::ContentLength(len));
    }
    Ok(BodyFraming::None)
}

async fn read_body<R>(reader: &mut R, leftover: Vec<u8>, headers: &[(String, String)], idle_deadline: Duration) -> Result<Vec<u8>, EngineError>
where
    R: AsyncRead + Unpin,
{
    match body_framing(headers)? {
        BodyFraming::ContentLength(len) => framing::read_content_length_body(reader, leftover, len).await,
        BodyFraming::Chunked => framing::read_chunked_body(reader, leftover, idle_deadline).await,
        BodyFraming::None => Ok(leftover),
    }
}

fn wants_continue(headers: &[(String, String)]) -> bool {
    header_lookup(headers, "Expect").is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
}

/// A parsed request head whose body has not been read yet, so the caller
/// can react to `Expect: 100-continue` before committing to a body read.
pub struct PendingRequest {
    pub request: HttpRequest,
    leftover: Vec<u8>,
}

impl PendingRequest {
    pub fn wants_continue(&self) -> bool {
        wants_continue(&self.request.headers)
    }

    pub async fn into_request<R>(self, reader: &mut R, idle_deadline: Duration) -> Result<HttpRequest, EngineError>
    where
        R: AsyncRead + Unpin,
    {
        let mut request = self.request;
        request.body = read_body(reader, self.leftover, &request.headers, idle_deadline).await?;
        Ok(request)
    }
}

pub async fn read_request_head<R>(reader: &mut R) -> Result<PendingRequest, EngineError>
where
    R: AsyncRead + Unpin,
{
    let (head, leftover) = framing::read_until_header_terminator(reader).await?;
    let request = parse_request_head(&head)?;
    Ok(PendingRequest { request, leftover })
}

pub async fn read_response<R>(reader: &mut R, idle_deadline: Duration) -> Result<HttpResponse, EngineError>
where
    R: AsyncRead + Unpin,
{
    let (head, leftover) = framing::read_until_header_terminator(reader).await?;
    let mut response = parse_response_head(&head)?;
    response.body = read_body(reader, leftover, &response.headers, idle_deadline).await?;
    Ok(response)
}

fn request_bytes(request: &HttpRequest) -> Vec<u8> {
    let mut out = render_request_line_and_headers(request);
    out.extend_from_slice(&request.body);
    out
}

/// Tees every byte read from `inner` into `captured`, so record mode can
/// relay the origin's response to the client verbatim (including chunked
/// wire framing a re-render from the decoded body would lose) while a
/// separately decoded copy goes to the capture sink.
struct TeeRead<'a, R> {
    inner: &'a mut R,
    captured: Vec<u8>,
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeRead<'_, R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if poll.is_ready() {
            this.captured.extend_from_slice(&buf.filled()[before..]);
        }
        poll
    }
}

/// Reads one response the way [`read_response`] does, additionally
/// returning the exact bytes consumed off the wire for verbatim relay.
async fn read_response_verbatim<R>(reader: &mut R, idle_deadline: Duration) -> Result<(HttpResponse, Vec<u8>), EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut tee = TeeRead { inner: reader, captured: Vec::new() };
    let response = read_response(&mut tee, idle_deadline).await?;
    Ok((response, tee.captured))
}

/// Stateless HTTP/1.1 engine: one instance is shared across connections;
/// all per-connection state lives in the sockets and locals passed in.
pub struct HttpEngine {
    bypass_rules: Vec<CompiledBypassRule>,
    idle_read_deadline: Duration,
}

impl HttpEngine {
    pub fn new(bypass_rules: Vec<CompiledBypassRule>, idle_read_deadline: Duration) -> Self {
        Self {
            bypass_rules,
            idle_read_deadline,
        }
    }

    fn is_bypassed(&self, request: &HttpRequest, destination_port: u16) -> bool {
        let host = header_lookup(&request.headers, "Host");
        is_pass_through(host, Some(request.path.as_str()), destination_port, &self.bypass_rules)
    }

    /// RECORD mode: relay client<->server for each request/response cycle
    /// on the connection, emitting an `HttpPair` to `capture` after each
    /// complete cycle. Exits cleanly on client EOF.
    pub async fn run_record<C, S>(
        &self,
        mut client: C,
        mut server: S,
        destination_port: u16,
        capture: &CaptureSink,
        now_ms: impl Fn() -> i64,
    ) -> Result<(), EngineError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let pending = match read_request_head(&mut client).await {
                Ok(pending) => pending,
                Err(EngineError::Cancelled) => return Ok(()),
                Err(error) => return Err(error),
            };

            if self.is_bypassed(&pending.request, destination_port) {
                let request = pending.into_request(&mut client, self.idle_read_deadline).await?;
                server.write_all(&request_bytes(&request)).await.map_err(EngineError::from_io)?;
                tokio::io::copy_bidirectional(&mut client, &mut server).await.map_err(EngineError::from_io)?;
                return Ok(());
            }

            let request_at_ms = now_ms();
            let request = if pending.wants_continue() {
                server
                    .write_all(&render_request_line_and_headers(&pending.request))
                    .await
                    .map_err(EngineError::from_io)?;
                let (interim, interim_bytes) = read_response_verbatim(&mut server, self.idle_read_deadline).await?;

                if interim.status == 100 {
                    client.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(EngineError::from_io)?;
                    let request = pending.into_request(&mut client, self.idle_read_deadline).await?;
                    server.write_all(&request.body).await.map_err(EngineError::from_io)?;
                    request
                } else {
                    client.write_all(&interim_bytes).await.map_err(EngineError::from_io)?;
                    continue;
                }
            } else {
                let request = pending.into_request(&mut client, self.idle_read_deadline).await?;
                server.write_all(&request_bytes(&request)).await.map_err(EngineError::from_io)?;
                request
            };

            let (response, response_bytes_verbatim) = match read_response_verbatim(&mut server, self.idle_read_deadline).await {
                Ok(pair) => pair,
                Err(error) if error.is_expected_disconnect() => return Ok(()),
                Err(error) => return Err(error),
            };

            client.write_all(&response_bytes_verbatim).await.map_err(EngineError::from_io)?;
            let response_at_ms = now_ms();

            capture.capture(HttpPair {
                request_bytes: request_bytes(&request),
                response_bytes: render_response(&response),
                request_at_ms,
                response_at_ms,
                destination_port,
            });
        }
    }

    /// TEST mode: consults the matcher against `store`; on a match,
    /// synthesizes the response; on a miss, either relays to the original
    /// destination via `dial_origin` (if one is resolvable and not a
    /// bypass) or surfaces `MatchNotFound`.
    pub async fn run_mock<C, D, S, Fut>(
        &self,
        mut client: C,
        destination_port: u16,
        store: &MockStoreHandle,
        dial_origin: D,
    ) -> Result<(), EngineError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        D: Fn() -> Fut,
        Fut: std::future::Future<Output = Option<S>>,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let pending = match read_request_head(&mut client).await {
                Ok(pending) => pending,
                Err(EngineError::Cancelled) => return Ok(()),
                Err(error) => return Err(error),
            };

            if self.is_bypassed(&pending.request, destination_port) {
                let request = pending.into_request(&mut client, self.idle_read_deadline).await?;
                return self.relay_to_origin(client, request, dial_origin).await;
            }

            let request = if pending.wants_continue() {
                client.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(EngineError::from_io)?;
                pending.into_request(&mut client, self.idle_read_deadline).await?
            } else {
                pending.into_request(&mut client, self.idle_read_deadline).await?
            };

            let payload = to_request_payload(&request);

            match match_request(store, MockKind::Http, &payload).await {
                MatchOutcome::Matched(mock) => {
                    let response = synthesize_response(&mock.response)?;
                    client.write_all(&render_response(&response)).await.map_err(EngineError::from_io)?;
                }
                MatchOutcome::NoMatch => {
                    return self.relay_to_origin(client, request, dial_origin).await;
                }
            }
        }
    }

    async fn relay_to_origin<C, D, S, Fut>(&self, mut client: C, request: HttpRequest, dial_origin: D) -> Result<(), EngineError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        D: Fn() -> Fut,
        Fut: std::future::Future<Output = Option<S>>,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match dial_origin().await {
            Some(mut server) => {
                server.write_all(&request_bytes(&request)).await.map_err(EngineError::from_io)?;
                tokio::io::copy_bidirectional(&mut client, &mut server).await.map_err(EngineError::from_io)?;
                Ok(())
            }
            None => Err(EngineError::MatchNotFound),
        }
    }
}

fn to_request_payload(request: &HttpRequest) -> RequestPayload {
    let headers: BTreeMap<String, String> = request.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    RequestPayload {
        method: request.method.clone(),
        url: request.url.clone(),
        headers,
        query: request.query.clone(),
        body: request.body.clone(),
    }
}

/// Rewrites a stored mock's response into wire bytes: recompresses the
/// body if the mock declares gzip, and recomputes `Content-Length` to
/// match the transformed body length.
fn synthesize_response(response: &crate::mock::ResponsePayload) -> Result<HttpResponse, EngineError> {
    let body = if response.gzip { gzip::compress(&response.body) } else { response.body.clone() };

    let mut headers: Vec<(String, String)> = response.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    set_header(&mut headers, "Content-Length", body.len().to_string());

    Ok(HttpResponse {
        version: "HTTP/1.1".to_owned(),
        status: response.status,
        reason: reason_phrase(response.status).to_owned(),
        headers,
        body,
    })
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}
