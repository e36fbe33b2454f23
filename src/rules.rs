// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Ordered match rules evaluated against in-flight transactions.
//!
//! Rules are evaluated in ascending priority order; the first enabled
//! matching rule is terminal. The whole set is replaced atomically: readers
//! take one `Arc` snapshot per evaluation and never observe a partial
//! update.

use crate::error::ProxyError;
use crate::transaction::{RequestInfo, ResponseInfo, Transaction};
use http::header::{HeaderName, HeaderValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Field/pattern predicates; all present predicates must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Matcher {
    /// Suffix match on the origin host, e.g. "example.test" or ".cdn.test".
    #[serde(default)]
    pub host: Option<String>,
    /// Substring match on the request path.
    #[serde(default)]
    pub path: Option<String>,
    /// Exact method, case-insensitive.
    #[serde(default)]
    pub method: Option<String>,
    /// Request header name plus a substring its value must contain.
    #[serde(default)]
    pub header: Option<HeaderMatch>,
    /// Regex over the request body (lossy UTF-8).
    #[serde(default)]
    pub body: Option<String>,
    /// Response status: exact ("404") or class ("4xx"). A rule with a
    /// status predicate only matches once a response exists.
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HeaderMatch {
    pub name: String,
    pub contains: String,
}

/// Declarative, pure rewrite of a request and/or response.
///
/// Framing headers are off limits; the codec re-derives `content-length`
/// from the transformed body, and a transform naming them is rejected at
/// load time (and again defensively at apply time).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Transform {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub set_request_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_request_headers: Vec<String>,
    #[serde(default)]
    pub set_response_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_response_headers: Vec<String>,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub response_body: Option<String>,
}

impl Transform {
    fn touches_request(&self) -> bool {
        !self.set_request_headers.is_empty()
            || !self.remove_request_headers.is_empty()
            || self.request_body.is_some()
    }

    fn touches_response(&self) -> bool {
        self.status.is_some()
            || !self.set_response_headers.is_empty()
            || !self.remove_response_headers.is_empty()
            || self.response_body.is_some()
    }

    fn validate(&self) -> Result<(), ProxyError> {
        let names = self
            .set_request_headers
            .keys()
            .chain(self.remove_request_headers.iter())
            .chain(self.set_response_headers.keys())
            .chain(self.remove_response_headers.iter());
        for name in names {
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                return Err(ProxyError::RuleEvaluation(format!(
                    "transform may not set framing header '{name}'"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Pass,
    Block,
    Modify(Transform),
}

/// One ordered rule. Lower `priority` evaluates first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub priority: u32,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub match_on: Matcher,
    pub action: Action,
}

fn default_enabled() -> bool {
    true
}

/// Terminal decision for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Name of the matched rule, `None` for the default pass.
    pub rule: Option<String>,
    pub action: Action,
}

impl Verdict {
    fn default_pass() -> Self {
        Self {
            rule: None,
            action: Action::Pass,
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    body_re: Option<Regex>,
}

/// Immutable, priority-sorted rule set snapshot.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compile and sort a rule list; invalid regexes and framing-header
    /// transforms are rejected here so evaluation never fails on them.
    pub fn compile(rules: Vec<Rule>) -> Result<Self, ProxyError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Action::Modify(transform) = &rule.action {
                transform.validate()?;
            }
            let body_re = match &rule.match_on.body {
                Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                    ProxyError::RuleEvaluation(format!(
                        "rule '{}' has invalid body pattern: {e}",
                        rule.name
                    ))
                })?),
                None => None,
            };
            compiled.push(CompiledRule { rule, body_re });
        }
        compiled.sort_by_key(|c| c.rule.priority);
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn matches_request(&self, c: &CompiledRule, tx: &Transaction) -> bool {
        let m = &c.rule.match_on;
        if let Some(host) = &m.host {
            if !tx.origin_host().ends_with(host.as_str()) {
                return false;
            }
        }
        if let Some(path) = &m.path {
            if !tx.request.path().contains(path.as_str()) {
                return false;
            }
        }
        if let Some(method) = &m.method {
            if !tx.request.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(h) = &m.header {
            let found = tx
                .request
                .headers
                .get_all(h.name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| v.contains(h.contains.as_str()));
            if !found {
                return false;
            }
        }
        if let Some(re) = &c.body_re {
            if !re.is_match(&String::from_utf8_lossy(&tx.request.body)) {
                return false;
            }
        }
        true
    }

    /// Evaluate the request phase. Rules carrying a status predicate are
    /// skipped here: they can only decide once a response exists.
    pub fn evaluate_request(&self, tx: &Transaction) -> Verdict {
        for c in &self.rules {
            if !c.rule.enabled || c.rule.match_on.status.is_some() {
                continue;
            }
            if self.matches_request(c, tx) {
                return Verdict {
                    rule: Some(c.rule.name.clone()),
                    action: c.rule.action.clone(),
                };
            }
        }
        Verdict::default_pass()
    }

    /// Evaluate the response phase: the first enabled modify rule with a
    /// status predicate matching the completed exchange. Status-less rules
    /// never re-enter here; they were terminal (or not) at request time.
    pub fn evaluate_response(&self, tx: &Transaction, response: &ResponseInfo) -> Option<Verdict> {
        for c in &self.rules {
            if !c.rule.enabled {
                continue;
            }
            if !matches!(&c.rule.action, Action::Modify(t) if t.touches_response()) {
                continue;
            }
            let Some(pattern) = &c.rule.match_on.status else {
                continue;
            };
            if status_matches(pattern, response.status) && self.matches_request(c, tx) {
                return Some(Verdict {
                    rule: Some(c.rule.name.clone()),
                    action: c.rule.action.clone(),
                });
            }
        }
        None
    }
}

/// "404" matches exactly; "4xx" matches the whole class.
fn status_matches(pattern: &str, status: u16) -> bool {
    let status_str = status.to_string();
    if let Some(class) = pattern.strip_suffix("xx") {
        return status_str.starts_with(class);
    }
    pattern == status_str
}

/// Process-wide rule engine holding the current snapshot.
pub struct RuleEngine {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleEngine {
    pub fn new(set: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// One consistent snapshot for the duration of an evaluation.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Atomically replace the whole set; in-flight evaluations keep the
    /// snapshot they already hold.
    pub fn replace(&self, set: RuleSet) {
        let set = Arc::new(set);
        match self.current.write() {
            Ok(mut guard) => *guard = set,
            Err(poisoned) => *poisoned.into_inner() = set,
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(RuleSet::empty())
    }
}

/// Apply the request half of a transform, keeping framing consistent:
/// a replaced body gets a matching `content-length`.
pub fn apply_request_transform(
    req: &RequestInfo,
    t: &Transform,
) -> Result<RequestInfo, ProxyError> {
    t.validate()?;
    if !t.touches_request() {
        return Ok(req.clone());
    }
    let mut out = req.clone();
    for name in &t.remove_request_headers {
        out.headers.remove(name.as_str());
    }
    for (name, value) in &t.set_request_headers {
        out.headers.insert(parse_name(name)?, parse_value(value)?);
    }
    if let Some(body) = &t.request_body {
        out.body = bytes::Bytes::from(body.clone().into_bytes());
        out.body_length = out.body.len() as u64;
        out.headers.insert(
            http::header::CONTENT_LENGTH,
            parse_value(&out.body.len().to_string())?,
        );
    }
    Ok(out)
}

/// Apply the response half of a transform; same framing guarantee.
pub fn apply_response_transform(
    resp: &ResponseInfo,
    t: &Transform,
) -> Result<ResponseInfo, ProxyError> {
    t.validate()?;
    let mut out = resp.clone();
    if let Some(status) = t.status {
        out.status = status;
    }
    for name in &t.remove_response_headers {
        out.headers.remove(name.as_str());
    }
    for (name, value) in &t.set_response_headers {
        out.headers.insert(parse_name(name)?, parse_value(value)?);
    }
    if let Some(body) = &t.response_body {
        out.body = bytes::Bytes::from(body.clone().into_bytes());
        out.body_length = out.body.len() as u64;
        out.headers.insert(
            http::header::CONTENT_LENGTH,
            parse_value(&out.body.len().to_string())?,
        );
    }
    Ok(out)
}

fn parse_name(name: &str) -> Result<HeaderName, ProxyError> {
    name.parse::<HeaderName>()
        .map_err(|_| ProxyError::RuleEvaluation(format!("invalid header name '{name}'")))
}

fn parse_value(value: &str) -> Result<HeaderValue, ProxyError> {
    value
        .parse::<HeaderValue>()
        .map_err(|_| ProxyError::RuleEvaluation(format!("invalid header value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_test_transaction, make_tx_for};
    use rstest::rstest;

    fn rule(priority: u32, name: &str, match_on: Matcher, action: Action) -> Rule {
        Rule {
            priority,
            name: name.to_string(),
            enabled: true,
            match_on,
            action,
        }
    }

    #[test]
    fn empty_set_defaults_to_pass() {
        let set = RuleSet::empty();
        let verdict = set.evaluate_request(&make_test_transaction());
        assert_eq!(verdict.action, Action::Pass);
        assert!(verdict.rule.is_none());
    }

    #[test]
    fn lower_priority_value_wins() -> anyhow::Result<()> {
        let set = RuleSet::compile(vec![
            rule(20, "late-block", Matcher::default(), Action::Block),
            rule(10, "early-pass", Matcher::default(), Action::Pass),
        ])?;
        let verdict = set.evaluate_request(&make_test_transaction());
        assert_eq!(verdict.rule.as_deref(), Some("early-pass"));
        assert_eq!(verdict.action, Action::Pass);
        Ok(())
    }

    #[test]
    fn first_match_is_terminal() -> anyhow::Result<()> {
        let set = RuleSet::compile(vec![
            rule(1, "block-api", Matcher {
                path: Some("/api".into()),
                ..Default::default()
            }, Action::Block),
            rule(2, "block-everything", Matcher::default(), Action::Block),
        ])?;
        let tx = make_tx_for("GET", "http://example.test/api/v1", "example.test:80");
        let verdict = set.evaluate_request(&tx);
        assert_eq!(verdict.rule.as_deref(), Some("block-api"));
        Ok(())
    }

    #[test]
    fn disabled_rules_are_skipped() -> anyhow::Result<()> {
        let mut r = rule(1, "off", Matcher::default(), Action::Block);
        r.enabled = false;
        let set = RuleSet::compile(vec![r])?;
        assert_eq!(
            set.evaluate_request(&make_test_transaction()).action,
            Action::Pass
        );
        Ok(())
    }

    #[rstest]
    #[case::host_suffix(Matcher { host: Some("example.test".into()), ..Default::default() }, true)]
    #[case::host_miss(Matcher { host: Some("other.test".into()), ..Default::default() }, false)]
    #[case::path_substring(Matcher { path: Some("/a".into()), ..Default::default() }, true)]
    #[case::method(Matcher { method: Some("get".into()), ..Default::default() }, true)]
    #[case::method_miss(Matcher { method: Some("POST".into()), ..Default::default() }, false)]
    fn matcher_predicates(#[case] match_on: Matcher, #[case] hits: bool) {
        let set = RuleSet::compile(vec![rule(1, "r", match_on, Action::Block)]).unwrap();
        let tx = make_tx_for("GET", "http://example.test/a", "example.test:80");
        let expected = if hits { Action::Block } else { Action::Pass };
        assert_eq!(set.evaluate_request(&tx).action, expected);
    }

    #[test]
    fn header_and_body_predicates() -> anyhow::Result<()> {
        let set = RuleSet::compile(vec![rule(
            1,
            "token-leak",
            Matcher {
                header: Some(HeaderMatch {
                    name: "authorization".into(),
                    contains: "Bearer".into(),
                }),
                body: Some(r"secret-\d+".into()),
                ..Default::default()
            },
            Action::Block,
        )])?;

        let mut tx = make_tx_for("POST", "http://example.test/a", "example.test:80");
        tx.request
            .headers
            .insert("authorization", "Bearer abc".parse()?);
        tx.request.body = bytes::Bytes::from_static(b"payload secret-42 end");
        assert_eq!(set.evaluate_request(&tx).action, Action::Block);

        tx.request.body = bytes::Bytes::from_static(b"nothing here");
        assert_eq!(set.evaluate_request(&tx).action, Action::Pass);
        Ok(())
    }

    #[test]
    fn status_rules_skip_request_phase() -> anyhow::Result<()> {
        let set = RuleSet::compile(vec![rule(
            1,
            "rewrite-404",
            Matcher {
                status: Some("4xx".into()),
                ..Default::default()
            },
            Action::Modify(Transform {
                status: Some(200),
                ..Default::default()
            }),
        )])?;
        let tx = make_test_transaction();
        assert_eq!(set.evaluate_request(&tx).action, Action::Pass);

        let resp = ResponseInfo::new(404);
        let verdict = set.evaluate_response(&tx, &resp).expect("response match");
        assert_eq!(verdict.rule.as_deref(), Some("rewrite-404"));

        let ok = ResponseInfo::new(200);
        assert!(set.evaluate_response(&tx, &ok).is_none());
        Ok(())
    }

    #[rstest]
    #[case("404", 404, true)]
    #[case("404", 403, false)]
    #[case("4xx", 404, true)]
    #[case("4xx", 500, false)]
    #[case("5xx", 502, true)]
    fn status_patterns(#[case] pattern: &str, #[case] status: u16, #[case] hits: bool) {
        assert_eq!(status_matches(pattern, status), hits);
    }

    #[test]
    fn compile_rejects_framing_transforms() {
        let mut t = Transform::default();
        t.set_response_headers
            .insert("Content-Length".into(), "0".into());
        let err = RuleSet::compile(vec![rule(1, "bad", Matcher::default(), Action::Modify(t))])
            .expect_err("framing header must be rejected");
        assert_eq!(err.kind(), "RuleEvaluationError");
    }

    #[test]
    fn compile_rejects_invalid_body_regex() {
        let err = RuleSet::compile(vec![rule(
            1,
            "bad-re",
            Matcher {
                body: Some("(unclosed".into()),
                ..Default::default()
            },
            Action::Block,
        )])
        .expect_err("invalid regex must be rejected");
        assert_eq!(err.kind(), "RuleEvaluationError");
    }

    #[test]
    fn request_transform_updates_length_header() -> anyhow::Result<()> {
        let mut req = RequestInfo::new("POST", "/submit");
        req.body = bytes::Bytes::from_static(b"old");
        req.body_length = 3;
        req.headers
            .insert(http::header::CONTENT_LENGTH, "3".parse()?);

        let t = Transform {
            request_body: Some("a much longer body".into()),
            ..Default::default()
        };
        let out = apply_request_transform(&req, &t)?;
        assert_eq!(out.body_length, 18);
        assert_eq!(
            out.headers
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok()),
            Some("18")
        );
        Ok(())
    }

    #[test]
    fn response_transform_rewrites_status_and_headers() -> anyhow::Result<()> {
        let resp = ResponseInfo::new(404);
        let mut t = Transform {
            status: Some(200),
            response_body: Some("patched".into()),
            ..Default::default()
        };
        t.set_response_headers
            .insert("x-rewritten".into(), "1".into());

        let out = apply_response_transform(&resp, &t)?;
        assert_eq!(out.status, 200);
        assert_eq!(&out.body[..], b"patched");
        assert_eq!(
            out.headers.get("x-rewritten").and_then(|v| v.to_str().ok()),
            Some("1")
        );
        Ok(())
    }

    #[test]
    fn engine_swap_is_atomic_for_held_snapshots() -> anyhow::Result<()> {
        let engine = RuleEngine::new(RuleSet::compile(vec![rule(
            1,
            "block-all",
            Matcher::default(),
            Action::Block,
        )])?);

        let held = engine.snapshot();
        engine.replace(RuleSet::empty());

        // The held snapshot still sees the old set; new readers see the swap.
        assert_eq!(held.len(), 1);
        assert!(engine.snapshot().is_empty());
        Ok(())
    }

    #[test]
    fn rules_deserialize_from_toml() -> anyhow::Result<()> {
        let toml = r#"
priority = 5
name = "rewrite-errors"
match_on = { host = "example.test", status = "5xx" }
action = { type = "modify", status = 503, response_body = "maintenance" }
"#;
        let rule: Rule = toml::from_str(toml)?;
        assert_eq!(rule.priority, 5);
        assert!(rule.enabled);
        match rule.action {
            Action::Modify(t) => {
                assert_eq!(t.status, Some(503));
                assert_eq!(t.response_body.as_deref(), Some("maintenance"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
        Ok(())
    }
}
