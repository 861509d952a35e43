//! Matcher (C7): schema filter -> exact body -> JSON key-subset -> fuzzy.
//!
//! New: no prior module here did request/mock matching;
//! `strsim` provides Levenshtein distance and `serde_json` backs the JSON
//! key-subset step, both confirmed idiomatic choices for this kind of
//! fuzzy-matching pipeline via the retrieval pack's manifests.

use std::collections::HashSet;

use serde_json::Value;

use super::{Mock, MockKind, MockStoreHandle, RequestPayload};

const RESERVED_HEADER_KEYS: [&str; 2] = ["keploy-test-id", "keploy-test-set-id"];

/// Baseline body length (bytes) the adaptive shingle size is scaled
/// against; chosen so a typical small JSON/text body lands near k=5.
const SHINGLE_BASELINE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(Mock),
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyContentType {
    Json,
    Xml,
    Csv,
    Html,
    TextPlain,
    Unknown,
}

fn detect_body_content_type(body: &[u8]) -> BodyContentType {
    let trimmed = body.iter().position(|b| !b.is_ascii_whitespace()).map(|start| &body[start..]).unwrap_or(body);

    if trimmed.is_empty() {
        return BodyContentType::Unknown;
    }
    if (trimmed.starts_with(b"{") || trimmed.starts_with(b"[")) && serde_json::from_slice::<Value>(trimmed).is_ok() {
        return BodyContentType::Json;
    }
    if trimmed.starts_with(b"<") {
        let lower_prefix: Vec<u8> = trimmed.iter().take(32).map(u8::to_ascii_lowercase).collect();
        if lower_prefix.windows(5).any(|w| w == b"html>" || w == b"<html") {
            return BodyContentType::Html;
        }
        return BodyContentType::Xml;
    }
    if trimmed.is_ascii() && trimmed.contains(&b',') && trimmed.contains(&b'\n') {
        return BodyContentType::Csv;
    }
    if trimmed.is_ascii() {
        return BodyContentType::TextPlain;
    }
    BodyContentType::Unknown
}

fn header_key_set(headers: &std::collections::BTreeMap<String, String>) -> HashSet<String> {
    headers
        .keys()
        .map(|k| k.to_ascii_lowercase())
        .filter(|k| !RESERVED_HEADER_KEYS.contains(&k.as_str()))
        .collect()
}

fn schema_matches(mock: &Mock, request: &RequestPayload) -> bool {
    if let Some(content_type) = request.headers.get("Content-Type").or_else(|| request.headers.get("content-type")) {
        let mock_content_type = mock
            .request
            .headers
            .get("Content-Type")
            .or_else(|| mock.request.headers.get("content-type"));
        if mock_content_type != Some(content_type) {
            return false;
        }
    }

    if detect_body_content_type(&mock.request.body) != detect_body_content_type(&request.body) {
        return false;
    }

    if mock.request.url != request.url {
        return false;
    }

    if mock.request.method != request.method {
        return false;
    }

    if header_key_set(&mock.request.headers) != header_key_set(&request.headers) {
        return false;
    }

    let mock_query_keys: HashSet<&String> = mock.request.query.keys().collect();
    let request_query_keys: HashSet<&String> = request.query.keys().collect();
    if mock_query_keys != request_query_keys {
        return false;
    }

    true
}

fn is_ascii_printable(body: &[u8]) -> bool {
    body.iter().all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
}

fn shingle_size(len: usize) -> usize {
    let ratio = (len.max(1) as f64) / (SHINGLE_BASELINE_LEN as f64);
    let k = 5.0 + ratio.log2();
    k.round().clamp(3.0, 8.0) as usize
}

fn shingles(body: &[u8], k: usize) -> HashSet<&[u8]> {
    if body.len() < k {
        return HashSet::from([body]);
    }
    body.windows(k).collect()
}

fn jaccard_similarity(a: &[u8], b: &[u8]) -> f64 {
    let k = shingle_size(a.len().max(b.len()));
    let sa = shingles(a, k);
    let sb = shingles(b, k);

    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();

    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

fn json_top_level_keys(body: &[u8]) -> Option<HashSet<String>> {
    match serde_json::from_slice::<Value>(body).ok()? {
        Value::Object(map) => Some(map.keys().cloned().collect()),
        _ => None,
    }
}

async fn try_promote(store: &MockStoreHandle, mock: &Mock) -> Option<Mock> {
    let won = store.promote(mock.id, mock.version, mock.clone()).await;
    if won {
        let mut promoted = mock.clone();
        promoted.filtered = false;
        promoted.version += 1;
        Some(promoted)
    } else {
        None
    }
}

/// Runs the full matching pipeline against the store's current filtered
/// snapshot. Restarts from step 1 whenever a `promote` race is lost,
/// since the loser must not return the mock another caller just claimed
/// (§8 scenario 6).
pub async fn match_request(store: &MockStoreHandle, kind: MockKind, request: &RequestPayload) -> MatchOutcome {
    loop {
        let filtered = store.all_filtered().await;
        let schema_passed: Vec<&Mock> = filtered.iter().filter(|mock| mock.kind == kind && schema_matches(mock, request)).collect();

        if schema_passed.is_empty() {
            return MatchOutcome::NoMatch;
        }

        if let Some(mock) = schema_passed.iter().find(|mock| mock.request.body == request.body) {
            match try_promote(store, mock).await {
                Some(mock) => return MatchOutcome::Matched(mock),
                None => continue,
            }
        }

        let shortlist: Vec<&Mock> = match json_top_level_keys(&request.body) {
            Some(request_keys) => {
                let subset: Vec<&Mock> = schema_passed
                    .iter()
                    .filter(|mock| match json_top_level_keys(&mock.request.body) {
                        Some(mock_keys) => mock_keys.is_subset(&request_keys),
                        None => false,
                    })
                    .copied()
                    .collect();

                match subset.len() {
                    0 => return MatchOutcome::NoMatch,
                    1 => {
                        match try_promote(store, subset[0]).await {
                            Some(mock) => return MatchOutcome::Matched(mock),
                            None => continue,
                        }
                    }
                    _ => subset,
                }
            }
            None => schema_passed,
        };

        if let Some(mock) = shortlist.iter().find(|mock| mock.request.body == request.body) {
            match try_promote(store, mock).await {
                Some(mock) => return MatchOutcome::Matched(mock),
                None => continue,
            }
        }

        let best = if is_ascii_printable(&request.body) {
            shortlist
                .iter()
                .min_by_key(|mock| strsim::levenshtein(&String::from_utf8_lossy(&mock.request.body), &String::from_utf8_lossy(&request.body)))
        } else {
            shortlist
                .iter()
                .max_by(|a, b| {
                    let sim_a = jaccard_similarity(&a.request.body, &request.body);
                    let sim_b = jaccard_similarity(&b.request.body, &request.body);
                    sim_a.partial_cmp(&sim_b).unwrap_or(std::cmp::Ordering::Equal)
                })
        };

        match best {
            Some(mock) => match try_promote(store, mock).await {
                Some(mock) => return MatchOutcome::Matched(mock),
                None => continue,
            },
            None => return MatchOutcome::NoMatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use mimic_task::Task as _;

    use super::*;
    use crate::mock::{Mock, MockId, MockStore, RequestPayload, ResponsePayload};

    fn request(method: &str, url: &str, body: &[u8]) -> RequestPayload {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_owned(), "application/json".to_owned());
        RequestPayload {
            method: method.to_owned(),
            url: url.to_owned(),
            headers,
            query: BTreeMap::new(),
            body: body.to_vec(),
        }
    }

    fn mock(id: u64, method: &str, url: &str, body: &[u8]) -> Mock {
        let mut response_headers = BTreeMap::new();
        response_headers.insert("Content-Type".to_owned(), "application/json".to_owned());
        Mock::new(
            MockId(id),
            MockKind::Http,
            request(method, url, body),
            ResponsePayload {
                status: 200,
                headers: response_headers,
                body: b"{}".to_vec(),
                gzip: false,
            },
            id as i64,
        )
    }

    #[tokio::test]
    async fn json_subset_breaks_a_schema_tie() {
        let (store, handle) = MockStore::new();
        let (shutdown, signal) = mimic_task::ShutdownHandle::new();
        let task = tokio::spawn(store.run(signal));

        handle
            .replace_filtered(vec![mock(1, "POST", "/x", br#"{"a":1}"#), mock(2, "POST", "/x", br#"{"a":1,"b":2}"#)])
            .await;

        let outcome = match_request(&handle, MockKind::Http, &request("POST", "/x", br#"{"a":1,"b":2}"#)).await;

        match outcome {
            MatchOutcome::Matched(mock) => assert_eq!(mock.id, MockId(2)),
            MatchOutcome::NoMatch => panic!("expected a match"),
        }

        shutdown.signal();
        let _ = task.await;
    }

    #[tokio::test]
    async fn no_schema_match_returns_no_match() {
        let (store, handle) = MockStore::new();
        let (shutdown, signal) = mimic_task::ShutdownHandle::new();
        let task = tokio::spawn(store.run(signal));

        handle.replace_filtered(vec![mock(1, "GET", "/other", b"")]).await;

        let outcome = match_request(&handle, MockKind::Http, &request("POST", "/x", b"{}")).await;
        assert_eq!(outcome, MatchOutcome::NoMatch);

        shutdown.signal();
        let _ = task.await;
    }

    /// One `#[case]` per step of the decision table: schema filter, exact
    /// body, JSON key-subset (unique and tied), and the fuzzy fallback for
    /// both the ASCII-printable (Levenshtein) and binary (Jaccard) paths.
    #[rstest::rstest]
    #[case::schema_mismatch_on_method(
        vec![mock(1, "GET", "/x", b"{}")],
        request("POST", "/x", b"{}"),
        None,
    )]
    #[case::schema_mismatch_on_url(
        vec![mock(1, "POST", "/other", b"{}")],
        request("POST", "/x", b"{}"),
        None,
    )]
    #[case::exact_body_wins_over_fuzzy_candidates(
        vec![mock(1, "POST", "/x", br#"{"a":1}"#), mock(2, "POST", "/x", br#"{"a":9}"#)],
        request("POST", "/x", br#"{"a":1}"#),
        Some(MockId(1)),
    )]
    #[case::unique_json_subset_wins(
        vec![mock(1, "POST", "/x", br#"{"a":1}"#), mock(2, "POST", "/x", br#"{"a":1,"b":2,"c":3}"#)],
        request("POST", "/x", br#"{"a":1,"b":2}"#),
        Some(MockId(1)),
    )]
    #[case::no_json_subset_is_no_match(
        vec![mock(1, "POST", "/x", br#"{"z":1}"#)],
        request("POST", "/x", br#"{"a":1,"b":2}"#),
        None,
    )]
    #[case::tied_json_subset_falls_back_to_levenshtein(
        vec![mock(1, "POST", "/x", br#"{"a":"aaaaa"}"#), mock(2, "POST", "/x", br#"{"a":"zzzzz"}"#)],
        request("POST", "/x", br#"{"a":"aaaab"}"#),
        Some(MockId(1)),
    )]
    #[tokio::test]
    async fn decision_table(#[case] mocks: Vec<Mock>, #[case] incoming: RequestPayload, #[case] expected: Option<MockId>) {
        let (store, handle) = MockStore::new();
        let (shutdown, signal) = mimic_task::ShutdownHandle::new();
        let task = tokio::spawn(store.run(signal));

        handle.replace_filtered(mocks).await;
        let outcome = match_request(&handle, MockKind::Http, &incoming).await;

        match (outcome, expected) {
            (MatchOutcome::Matched(mock), Some(id)) => assert_eq!(mock.id, id),
            (MatchOutcome::NoMatch, None) => {}
            (outcome, expected) => panic!("unexpected outcome {outcome:?} for expected {expected:?}"),
        }

        shutdown.signal();
        let _ = task.await;
    }

    #[tokio::test]
    async fn fuzzy_fallback_picks_the_closer_binary_body_by_jaccard_similarity() {
        let (store, handle) = MockStore::new();
        let (shutdown, signal) = mimic_task::ShutdownHandle::new();
        let task = tokio::spawn(store.run(signal));

        // Non-ASCII bodies (no valid UTF-8, no JSON keys to subset on) so
        // both candidates reach the fuzzy step's Jaccard-over-shingles arm.
        let close = vec![0xffu8, 0xfe, 0xaa, 0xab, 0xac, 0xad, 0xae];
        let far = vec![0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let incoming_body = vec![0xffu8, 0xfe, 0xaa, 0xab, 0xac, 0xad, 0xaf];

        handle.replace_filtered(vec![mock(1, "POST", "/x", &close), mock(2, "POST", "/x", &far)]).await;

        let outcome = match_request(&handle, MockKind::Http, &request("POST", "/x", &incoming_body)).await;
        match outcome {
            MatchOutcome::Matched(mock) => assert_eq!(mock.id, MockId(1)),
            MatchOutcome::NoMatch => panic!("expected the closer binary body to match"),
        }

        shutdown.signal();
        let _ = task.await;
    }
}
