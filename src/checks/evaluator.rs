//! Automatic evaluators over a bridge dump.
//!
//! Each evaluator is a plain function of the dump; none of them keep state,
//! so they can run in any order. [`evaluate_automatic`] runs them in
//! registration order so the resulting check list is deterministic.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::{ids, Check, Severity};
use crate::bridge::log::LogEntry;
use crate::bridge::protocol::{Direction, MessageType};
use crate::bridge::{BridgeDump, WAIT_TIMEOUT_KEY};

/// Inputs shared by all evaluators.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    /// Longest acceptable INIT → READY latency.
    pub ready_budget_ms: u64,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self {
            ready_budget_ms: 5_000,
        }
    }
}

pub type Evaluator = fn(&BridgeDump, &EvalContext) -> Vec<Check>;

/// Registered automatic evaluators, in execution order.
pub const AUTOMATIC: &[(&str, Evaluator)] = &[
    ("harness_timeout", harness_timeout),
    ("handshake_ready", handshake_ready),
    ("result_shape", result_shape),
    ("state_shape", state_shape),
    ("retry_idempotent", retry_idempotent),
    ("harness_errors", harness_errors),
];

/// Run every automatic evaluator over `dump`.
pub fn evaluate_automatic(dump: &BridgeDump, ctx: &EvalContext) -> Vec<Check> {
    AUTOMATIC
        .iter()
        .flat_map(|(_, evaluate)| evaluate(dump, ctx))
        .collect()
}

/// The harness records [`WAIT_TIMEOUT_KEY`] in the dump metadata when a wait
/// on the frame expired. That makes the run's verdict untrustworthy.
pub fn harness_timeout(dump: &BridgeDump, _ctx: &EvalContext) -> Vec<Check> {
    match dump.metadata.get(WAIT_TIMEOUT_KEY) {
        Some(v) if !v.is_null() => vec![Check::fail(
            ids::INFRA_HARNESS_TIMEOUT,
            Severity::Blocker,
            "timed out waiting for a harness message",
        )
        .with_details(v.clone())],
        _ => vec![Check::pass(ids::INFRA_HARNESS_TIMEOUT, Severity::Blocker)],
    }
}

/// qa01: the build answers the latest INIT with READY within budget.
pub fn handshake_ready(dump: &BridgeDump, ctx: &EvalContext) -> Vec<Check> {
    let init = dump
        .entries
        .iter()
        .rev()
        .find(|e| e.kind == MessageType::Init && e.direction == Direction::Outbound);
    let Some(init) = init else {
        return vec![Check::fail(
            ids::HANDSHAKE_READY,
            Severity::Blocker,
            "harness never sent INIT",
        )];
    };

    let ready = dump
        .inbound(MessageType::Ready)
        .find(|e| e.seq > init.seq);
    let Some(ready) = ready else {
        return vec![Check::fail(
            ids::HANDSHAKE_READY,
            Severity::Blocker,
            "no READY after INIT",
        )
        .with_details(json!({ "initSeq": init.seq }))];
    };

    let ready_ms = (ready.at - init.at).num_milliseconds().max(0) as u64;
    let details = json!({ "readyMs": ready_ms, "budgetMs": ctx.ready_budget_ms });
    if ready_ms <= ctx.ready_budget_ms {
        vec![Check::pass(ids::HANDSHAKE_READY, Severity::Blocker).with_details(details)]
    } else {
        vec![Check::fail(
            ids::HANDSHAKE_READY,
            Severity::Blocker,
            format!("READY took {ready_ms} ms (budget {} ms)", ctx.ready_budget_ms),
        )
        .with_details(details)]
    }
}

fn result_violation(entry: &LogEntry) -> Option<String> {
    let Some(Value::Object(obj)) = &entry.payload else {
        return Some("payload is not an object".to_string());
    };
    match obj.get("score") {
        Some(Value::Number(n)) if n.as_f64().is_some_and(|s| s >= 0.0) => {}
        Some(_) => return Some("score must be a non-negative number".to_string()),
        None => return Some("missing score".to_string()),
    }
    match obj.get("completed") {
        Some(Value::Bool(_)) => None,
        Some(_) => Some("completed must be a boolean".to_string()),
        None => Some("missing completed".to_string()),
    }
}

/// qa02: every RESULT payload carries a non-negative `score` and a boolean
/// `completed`, and at least one RESULT was sent.
pub fn result_shape(dump: &BridgeDump, _ctx: &EvalContext) -> Vec<Check> {
    let results: Vec<&LogEntry> = dump.inbound(MessageType::Result).collect();
    if results.is_empty() {
        return vec![Check::fail(
            ids::RESULT_SHAPE,
            Severity::Blocker,
            "build never sent RESULT",
        )];
    }

    let violations: Vec<Value> = results
        .iter()
        .filter_map(|e| result_violation(e).map(|reason| json!({ "seq": e.seq, "reason": reason })))
        .collect();
    if violations.is_empty() {
        vec![Check::pass(ids::RESULT_SHAPE, Severity::Blocker)
            .with_details(json!({ "results": results.len() }))]
    } else {
        vec![Check::fail(
            ids::RESULT_SHAPE,
            Severity::Blocker,
            format!("{} malformed RESULT message(s)", violations.len()),
        )
        .with_details(json!({ "results": results.len(), "violations": violations }))]
    }
}

/// qa02 (advisory): STATE payloads are objects.
pub fn state_shape(dump: &BridgeDump, _ctx: &EvalContext) -> Vec<Check> {
    let bad: Vec<u64> = dump
        .inbound(MessageType::State)
        .filter(|e| !matches!(e.payload, Some(Value::Object(_))))
        .map(|e| e.seq)
        .collect();
    if bad.is_empty() {
        vec![Check::pass(ids::STATE_SHAPE, Severity::Warning)]
    } else {
        vec![Check::fail(
            ids::STATE_SHAPE,
            Severity::Warning,
            format!("{} STATE message(s) without an object payload", bad.len()),
        )
        .with_details(json!({ "seqs": bad }))]
    }
}

/// qa04: a RESULT re-sent for the same `attemptId` must carry the same
/// payload as the first one.
pub fn retry_idempotent(dump: &BridgeDump, _ctx: &EvalContext) -> Vec<Check> {
    let mut attempts: BTreeMap<String, Vec<&LogEntry>> = BTreeMap::new();
    for entry in dump.inbound(MessageType::Result) {
        let attempt = entry
            .payload
            .as_ref()
            .and_then(|p| p.get("attemptId"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        if let Some(attempt) = attempt {
            attempts.entry(attempt).or_default().push(entry);
        }
    }

    let retried = attempts.values().filter(|v| v.len() > 1).count();
    let diverging: Vec<&String> = attempts
        .iter()
        .filter(|(_, entries)| entries.windows(2).any(|w| w[0].payload != w[1].payload))
        .map(|(attempt, _)| attempt)
        .collect();

    let details = json!({ "attempts": attempts.len(), "retried": retried });
    if diverging.is_empty() {
        vec![Check::pass(ids::RETRY_IDEMPOTENT, Severity::Blocker).with_details(details)]
    } else {
        vec![Check::fail(
            ids::RETRY_IDEMPOTENT,
            Severity::Blocker,
            format!("{} attempt(s) produced different results on retry", diverging.len()),
        )
        .with_details(json!({
            "attempts": attempts.len(),
            "retried": retried,
            "diverging": diverging,
        }))]
    }
}

/// Advisory: the build reported no ERROR and sent nothing undecodable.
pub fn harness_errors(dump: &BridgeDump, _ctx: &EvalContext) -> Vec<Check> {
    let errors = dump.inbound(MessageType::Error).count();
    let invalid = dump.inbound(MessageType::Invalid).count();
    if errors + invalid == 0 {
        return vec![Check::pass(ids::HARNESS_ERRORS, Severity::Warning)];
    }
    let first = dump
        .inbound(MessageType::Error)
        .next()
        .and_then(|e| e.payload.clone());
    vec![Check::fail(
        ids::HARNESS_ERRORS,
        Severity::Warning,
        format!("{errors} ERROR and {invalid} undecodable message(s)"),
    )
    .with_details(json!({ "errors": errors, "invalid": invalid, "firstError": first }))]
}
