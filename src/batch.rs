use crate::gmail;
use log::{debug, trace, warn};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Hard cap on the number of sub-requests per multi-request, per the Gmail
/// batch endpoint limits for content and modify calls.
pub const MAX_CONTENT_BATCH: usize = 50;

/// Consecutive connection failures tolerated before the run is aborted.
const MAX_CONN_ERRORS: u32 = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Remote returned fatal HTTP status {}", status))]
    RemoteStatus { status: u16 },

    #[snafu(display(
        "Giving up after {} consecutive connection errors, last: {}",
        count,
        source
    ))]
    TooManyConnectionErrors {
        count: u32,
        source: TransportFault,
    },

    #[snafu(display("Could not interpret batch response: {}", reason))]
    MalformedResponse { reason: String },

    #[snafu(display("Could not process batch reply for `{}': {}", id, message))]
    Sink { id: gmail::Id, message: String },

    #[snafu(display("Interrupted"))]
    Interrupted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned by per-reply sinks; converted to `Error::Sink` by the
/// driver.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// A transport-level failure: the request never produced an HTTP status.
/// Status-bearing responses, including 4xx/5xx, are `HttpReply`s.
#[derive(Debug, Snafu)]
#[snafu(display("{}", message))]
pub struct TransportFault {
    pub message: String,
}

/// One round trip against the batch endpoint.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

/// The single network seam of the driver. `remote::HttpWrapper` implements
/// this over the persistent agent; tests script it.
pub trait Transport {
    fn round_trip(&self, content_type: &str, body: &str) -> Result<HttpReply, TransportFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// A single sub-request of a multi-request, addressed by absolute path and
/// query under the API host.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub method: Method,
    pub path_and_query: String,
    /// Pre-serialized JSON body, if any.
    pub body: Option<String>,
}

/// Outcome delivered to the sink, exactly once per work-set entry.
#[derive(Debug)]
pub enum Reply {
    Payload(serde_json::Value),
    /// HTTP 400/404 on this sub-request alone: the message is skipped, the
    /// batch carries on.
    BadMessage { status: u16 },
}

/// Adaptive concurrency and backoff state, owned by the driver loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchState {
    batch_size: usize,
    max_batch_size: usize,
    good_batches: u32,
    conn_errors: u32,
    /// Seconds slept before the next batch is submitted.
    pause: u64,
}

impl BatchState {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            batch_size: max_batch_size,
            max_batch_size,
            good_batches: 0,
            conn_errors: 0,
            pause: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pause_seconds(&self) -> u64 {
        self.pause
    }

    fn on_batch_success(&mut self) {
        self.conn_errors = 0;
        if self.good_batches > 10 {
            self.pause /= 2;
            self.batch_size = (self.batch_size * 2).min(self.max_batch_size);
            self.good_batches = 0;
        } else {
            self.good_batches += 1;
        }
    }

    fn on_rate_limited(&mut self) {
        self.pause = (1 + self.pause * 2).max(30);
        self.batch_size = (self.batch_size / 2).max(1);
    }

    /// Returns true once the consecutive-error limit is exceeded.
    fn on_connection_error(&mut self) -> bool {
        self.conn_errors += 1;
        if self.conn_errors > MAX_CONN_ERRORS {
            return true;
        }
        self.pause = 1 + self.pause * 2;
        false
    }
}

/// Drive `work` to completion against `transport`.
///
/// Every entry's sink is invoked exactly once on success or bad-message
/// drop; rate limits and connection errors are retried internally with
/// backoff. `cancel` is honored between batches; a mid-flight batch
/// completes and its successes are final.
pub fn run<T, F>(
    transport: &T,
    work: HashMap<gmail::Id, SubRequest>,
    state: &mut BatchState,
    cancel: &AtomicBool,
    sink: F,
) -> Result<()>
where
    T: Transport,
    F: FnMut(&gmail::Id, Reply) -> Result<(), SinkError>,
{
    run_with_sleeper(transport, work, state, cancel, sink, |d| thread::sleep(d))
}

fn run_with_sleeper<T, F, S>(
    transport: &T,
    mut work: HashMap<gmail::Id, SubRequest>,
    state: &mut BatchState,
    cancel: &AtomicBool,
    mut sink: F,
    mut sleep: S,
) -> Result<()>
where
    T: Transport,
    F: FnMut(&gmail::Id, Reply) -> Result<(), SinkError>,
    S: FnMut(Duration),
{
    const BOUNDARY: &str = "batch_notmuch_gmail";

    while !work.is_empty() {
        ensure!(!cancel.load(Ordering::Relaxed), InterruptedSnafu);

        if state.pause > 0 {
            debug!("pausing {}s before next batch", state.pause);
            sleep(Duration::from_secs(state.pause));
        }

        // Assemble a batch. Order is irrelevant; keys stay in the work set
        // until their reply has been dispatched.
        let batch_ids: Vec<gmail::Id> = work.keys().take(state.batch_size).cloned().collect();
        let body = encode_batch(&batch_ids, &work, BOUNDARY);
        let content_type = format!("multipart/mixed; boundary={}", BOUNDARY);
        trace!("submitting batch of {} requests", batch_ids.len());

        let reply = match transport.round_trip(&content_type, &body) {
            Ok(reply) => reply,
            Err(fault) => {
                warn!("connection error on batch: {}", fault);
                if state.on_connection_error() {
                    return Err(Error::TooManyConnectionErrors {
                        count: state.conn_errors,
                        source: fault,
                    });
                }
                continue;
            }
        };

        match reply.status {
            200..=299 => {}
            403 | 429 => {
                warn!(
                    "rate limited (HTTP {}), backing off {}s",
                    reply.status,
                    (1 + state.pause * 2).max(30)
                );
                state.on_rate_limited();
                continue;
            }
            status => return RemoteStatusSnafu { status }.fail(),
        }

        let parts = parse_batch_response(&reply.content_type, &reply.body)?;
        let mut rate_limited = false;
        let mut dispatched = 0usize;
        for part in parts {
            let id = gmail::Id(part.request_id);
            if !work.contains_key(&id) {
                // A duplicate or stray part; its reply was already dispatched.
                continue;
            }
            match part.status {
                200..=299 => {
                    let payload: serde_json::Value =
                        serde_json::from_str(&part.body).map_err(|e| Error::MalformedResponse {
                            reason: format!("sub-response for `{}' is not JSON: {}", id, e),
                        })?;
                    sink(&id, Reply::Payload(payload)).map_err(|e| Error::Sink {
                        id: id.clone(),
                        message: e.to_string(),
                    })?;
                    work.remove(&id);
                    dispatched += 1;
                }
                400 | 404 => {
                    debug!("skipping bad message `{}' (HTTP {})", id, part.status);
                    sink(&id, Reply::BadMessage { status: part.status }).map_err(|e| {
                        Error::Sink {
                            id: id.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    work.remove(&id);
                    dispatched += 1;
                }
                403 | 429 => {
                    rate_limited = true;
                }
                status => return RemoteStatusSnafu { status }.fail(),
            }
        }

        if rate_limited {
            warn!("rate limited inside batch, backing off");
            state.on_rate_limited();
        } else if dispatched == 0 {
            // A 2xx reply that answers none of our sub-requests would spin
            // this loop forever.
            return MalformedResponseSnafu {
                reason: "no sub-responses matched the batch",
            }
            .fail();
        } else {
            state.on_batch_success();
        }
    }
    Ok(())
}

fn encode_batch(
    batch_ids: &[gmail::Id],
    work: &HashMap<gmail::Id, SubRequest>,
    boundary: &str,
) -> String {
    let mut out = String::new();
    for id in batch_ids {
        let request = &work[id];
        out.push_str(&format!(
            "--{}\r\nContent-Type: application/http\r\nContent-ID: <item:{}>\r\n\r\n",
            boundary, id
        ));
        out.push_str(&format!(
            "{} {} HTTP/1.1\r\n",
            request.method.as_str(),
            request.path_and_query
        ));
        match &request.body {
            Some(body) => {
                out.push_str(&format!(
                    "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}\r\n",
                    body.len(),
                    body
                ));
            }
            None => out.push_str("\r\n"),
        }
    }
    out.push_str(&format!("--{}--\r\n", boundary));
    out
}

#[derive(Debug, PartialEq, Eq)]
struct BatchPart {
    request_id: String,
    status: u16,
    body: String,
}

/// Pick the boundary parameter out of a `multipart/mixed` content type.
fn response_boundary(content_type: &str) -> Result<&str> {
    content_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("boundary="))
        .map(|value| value.trim_matches('"'))
        .next()
        .ok_or_else(|| Error::MalformedResponse {
            reason: format!("no boundary in content type `{}'", content_type),
        })
}

fn parse_batch_response(content_type: &str, body: &str) -> Result<Vec<BatchPart>> {
    let boundary = response_boundary(content_type)?;
    let delimiter = format!("--{}", boundary);

    let mut parts = Vec::new();
    // The first chunk is the preamble, the last the epilogue after the
    // closing delimiter.
    for chunk in body.split(delimiter.as_str()).skip(1) {
        if chunk.starts_with("--") {
            break;
        }
        let chunk = chunk.trim_start_matches("\r\n").trim_start_matches('\n');
        if chunk.trim().is_empty() {
            continue;
        }
        parts.push(parse_batch_part(chunk)?);
    }
    Ok(parts)
}

fn parse_batch_part(part: &str) -> Result<BatchPart> {
    let (outer_headers, embedded) = split_headers(part).ok_or_else(|| Error::MalformedResponse {
        reason: "part without header/payload separator".to_string(),
    })?;

    let request_id = outer_headers
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if !name.eq_ignore_ascii_case("content-id") {
                return None;
            }
            let value = value.trim().trim_start_matches('<').trim_end_matches('>');
            // The server echoes our `item:<id>` IDs back as
            // `response-item:<id>`.
            Some(
                value
                    .trim_start_matches("response-")
                    .trim_start_matches("item:")
                    .to_string(),
            )
        })
        .next()
        .ok_or_else(|| Error::MalformedResponse {
            reason: "part without Content-ID".to_string(),
        })?;

    // The payload is itself an HTTP response: status line, headers, body.
    let status_line = embedded.lines().next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::MalformedResponse {
            reason: format!("bad status line `{}'", status_line),
        })?;

    let body = split_headers(embedded).map(|(_, body)| body).unwrap_or("");

    Ok(BatchPart {
        request_id,
        status,
        body: body.trim().to_string(),
    })
}

/// Split an HTTP-style message at the first blank line, tolerating both CRLF
/// and bare LF.
fn split_headers(message: &str) -> Option<(&str, &str)> {
    if let Some(index) = message.find("\r\n\r\n") {
        return Some((&message[..index], &message[index + 4..]));
    }
    message
        .find("\n\n")
        .map(|index| (&message[..index], &message[index + 2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;

    fn get_request(path: &str) -> SubRequest {
        SubRequest {
            method: Method::Get,
            path_and_query: path.to_string(),
            body: None,
        }
    }

    fn work_of(ids: &[&str]) -> HashMap<gmail::Id, SubRequest> {
        ids.iter()
            .map(|id| {
                (
                    gmail::Id(id.to_string()),
                    get_request(&format!("/gmail/v1/users/me/messages/{}", id)),
                )
            })
            .collect()
    }

    /// Render a well-formed batch response serving the given
    /// (id, status, json) triples.
    fn canned_response(items: &[(&str, u16, &str)]) -> HttpReply {
        let mut body = String::new();
        for (id, status, json) in items {
            body.push_str(&format!(
                "--reply_boundary\r\nContent-Type: application/http\r\n\
                 Content-ID: <response-item:{}>\r\n\r\n\
                 HTTP/1.1 {} whatever\r\nContent-Type: application/json\r\n\r\n{}\r\n",
                id, status, json
            ));
        }
        body.push_str("--reply_boundary--\r\n");
        HttpReply {
            status: 200,
            content_type: "multipart/mixed; boundary=reply_boundary".to_string(),
            body,
        }
    }

    /// Transport scripted with a fixed sequence of outcomes. Batches beyond
    /// the script serve every requested id with an empty JSON payload.
    struct Scripted {
        script: RefCell<Vec<ScriptedReply>>,
        requests_seen: RefCell<Vec<Vec<String>>>,
    }

    enum ScriptedReply {
        Reply(HttpReply),
        Fault,
        ServeAll,
    }

    impl Scripted {
        fn new(script: Vec<ScriptedReply>) -> Self {
            Self {
                script: RefCell::new(script),
                requests_seen: RefCell::new(Vec::new()),
            }
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.requests_seen.borrow().iter().map(Vec::len).collect()
        }
    }

    fn requested_ids(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|line| line.strip_prefix("Content-ID: <item:"))
            .map(|rest| rest.trim_end_matches('>').to_string())
            .collect()
    }

    impl Transport for Scripted {
        fn round_trip(&self, _content_type: &str, body: &str) -> Result<HttpReply, TransportFault> {
            let ids = requested_ids(body);
            self.requests_seen.borrow_mut().push(ids.clone());
            let mut script = self.script.borrow_mut();
            let next = if script.is_empty() {
                ScriptedReply::ServeAll
            } else {
                script.remove(0)
            };
            match next {
                ScriptedReply::Reply(reply) => Ok(reply),
                ScriptedReply::Fault => Err(TransportFault {
                    message: "connection reset".to_string(),
                }),
                ScriptedReply::ServeAll => {
                    let items: Vec<(&str, u16, &str)> =
                        ids.iter().map(|id| (id.as_str(), 200, "{}")).collect();
                    Ok(canned_response(&items))
                }
            }
        }
    }

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn state_rate_limit_backoff() {
        let mut state = BatchState::new(50);
        state.on_rate_limited();
        assert_eq!(state.pause_seconds(), 30);
        assert_eq!(state.batch_size(), 25);

        // Repeated throttling keeps doubling the pause and halving the batch
        // down to the floor of one.
        for _ in 0..10 {
            state.on_rate_limited();
        }
        assert!(state.pause_seconds() > 30);
        assert_eq!(state.batch_size(), 1);
    }

    #[test]
    fn state_recovers_after_sustained_success() {
        let mut state = BatchState::new(50);
        state.on_rate_limited();
        state.on_rate_limited();
        let throttled_pause = state.pause_seconds();
        let throttled_size = state.batch_size();

        for _ in 0..12 {
            state.on_batch_success();
        }
        assert!(state.pause_seconds() < throttled_pause);
        assert!(state.batch_size() > throttled_size);

        // Recovery never exceeds the configured maximum.
        for _ in 0..200 {
            state.on_batch_success();
        }
        assert_eq!(state.batch_size(), 50);
        assert_eq!(state.pause_seconds(), 0);
    }

    #[test]
    fn state_connection_error_escalation() {
        let mut state = BatchState::new(50);
        for _ in 0..MAX_CONN_ERRORS {
            assert!(!state.on_connection_error());
        }
        assert!(state.on_connection_error());
    }

    #[test]
    fn every_id_sinked_exactly_once() {
        let transport = Scripted::new(vec![]);
        let mut seen: Vec<String> = Vec::new();
        let mut state = BatchState::new(3);
        run(
            &transport,
            work_of(&["a1", "b2", "c3", "d4", "e5"]),
            &mut state,
            &no_cancel(),
            |id, reply| {
                assert!(matches!(reply, Reply::Payload(_)));
                seen.push(id.0.clone());
                Ok(())
            },
        )
        .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a1", "b2", "c3", "d4", "e5"]);
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn bad_messages_are_dropped_not_retried() {
        let reply = canned_response(&[
            ("a1", 200, r#"{"id": "a1"}"#),
            ("b2", 404, r#"{"error": {"code": 404}}"#),
        ]);
        let transport = Scripted::new(vec![ScriptedReply::Reply(reply)]);
        let mut state = BatchState::new(50);
        let mut outcomes = Vec::new();
        run(
            &transport,
            work_of(&["a1", "b2"]),
            &mut state,
            &no_cancel(),
            |id, reply| {
                outcomes.push((id.0.clone(), matches!(reply, Reply::BadMessage { .. })));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(transport.batch_sizes(), vec![2]);
        outcomes.sort();
        assert_eq!(
            outcomes,
            vec![("a1".to_string(), false), ("b2".to_string(), true)]
        );
    }

    #[test]
    fn rate_limited_batch_is_retried_whole() {
        let throttle = HttpReply {
            status: 429,
            content_type: "application/json".to_string(),
            body: "{}".to_string(),
        };
        let transport = Scripted::new(vec![ScriptedReply::Reply(throttle)]);
        let mut state = BatchState::new(50);
        let ids: Vec<String> = (0..20).map(|n| format!("{:02x}", n)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let mut slept = Vec::new();
        let mut delivered = 0;
        run_with_sleeper(
            &transport,
            work_of(&id_refs),
            &mut state,
            &no_cancel(),
            |_, _| {
                delivered += 1;
                Ok(())
            },
            |duration| slept.push(duration),
        )
        .unwrap();

        // Same 20 ids submitted again after the throttled attempt.
        let sizes = transport.batch_sizes();
        assert_eq!(sizes, vec![20, 20]);
        assert_eq!(delivered, 20);
        assert!(slept.contains(&Duration::from_secs(30)));
        assert_eq!(state.batch_size(), 25);
    }

    #[test]
    fn fatal_after_too_many_connection_errors() {
        let script = (0..=MAX_CONN_ERRORS).map(|_| ScriptedReply::Fault).collect();
        let transport = Scripted::new(script);
        let mut state = BatchState::new(50);
        let err = run_with_sleeper(
            &transport,
            work_of(&["a1"]),
            &mut state,
            &no_cancel(),
            |_, _| Ok(()),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::TooManyConnectionErrors { .. }));
    }

    #[test]
    fn unexpected_status_is_fatal() {
        let reply = HttpReply {
            status: 500,
            content_type: "application/json".to_string(),
            body: "{}".to_string(),
        };
        let transport = Scripted::new(vec![ScriptedReply::Reply(reply)]);
        let mut state = BatchState::new(50);
        let err = run(&transport, work_of(&["a1"]), &mut state, &no_cancel(), |_, _| {
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::RemoteStatus { status: 500 }));
    }

    #[test]
    fn cancellation_honored_between_batches() {
        let transport = Scripted::new(vec![]);
        let mut state = BatchState::new(50);
        let cancel = AtomicBool::new(true);
        let err = run(&transport, work_of(&["a1"]), &mut state, &cancel, |_, _| {
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert!(transport.batch_sizes().is_empty());
    }

    #[test]
    fn encode_includes_json_bodies() {
        let mut work = HashMap::new();
        work.insert(
            gmail::Id("a1".to_string()),
            SubRequest {
                method: Method::Post,
                path_and_query: "/gmail/v1/users/me/messages/a1/modify".to_string(),
                body: Some(r#"{"addLabelIds":["STARRED"]}"#.to_string()),
            },
        );
        let ids = vec![gmail::Id("a1".to_string())];
        let body = encode_batch(&ids, &work, "b");
        assert!(body.contains("POST /gmail/v1/users/me/messages/a1/modify HTTP/1.1"));
        assert!(body.contains("Content-ID: <item:a1>"));
        assert!(body.contains(r#"{"addLabelIds":["STARRED"]}"#));
        assert!(body.ends_with("--b--\r\n"));
    }

    #[test]
    fn parse_handles_quoted_boundary_and_lf_parts() {
        let body = "--frontier\nContent-Type: application/http\n\
                    Content-ID: <response-item:a1>\n\n\
                    HTTP/1.1 200 OK\nContent-Type: application/json\n\n\
                    {\"id\":\"a1\"}\n--frontier--\n";
        let parts = parse_batch_response("multipart/mixed; boundary=\"frontier\"", body).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].request_id, "a1");
        assert_eq!(parts[0].status, 200);
        assert_eq!(parts[0].body, "{\"id\":\"a1\"}");
    }
}
