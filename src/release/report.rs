//! QC reports: the evidence a QC decision is made on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checks::manual::ManualValidation;
use crate::checks::{ids, Check};
use crate::summary::{RunStatus, Summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Fail,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pass => "pass",
            Decision::Fail => "fail",
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" => Ok(Decision::Pass),
            "fail" => Ok(Decision::Fail),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// One qa group of a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QcGroup {
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl QcGroup {
    /// Group backed by a single check. A missing check does not pass.
    fn from_check(check: Option<&Check>, id: &str) -> Self {
        match check {
            Some(c) => Self {
                pass: c.ok,
                reason: if c.ok { None } else { c.message.clone() },
                metrics: match &c.details {
                    Some(Value::Object(m)) => m.clone(),
                    _ => Map::new(),
                },
            },
            None => Self {
                pass: false,
                reason: Some(format!("{id} was not evaluated")),
                metrics: Map::new(),
            },
        }
    }
}

/// qa01 handshake timing, qa02 data shape, qa03 manual presentation,
/// qa04 idempotency under retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QcReport {
    pub qa01: QcGroup,
    pub qa02: QcGroup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa03: Option<QcGroup>,
    pub qa04: QcGroup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<ManualValidation>,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub run_status: Option<RunStatus>,
    pub created_at: DateTime<Utc>,
}

impl QcReport {
    /// A report with nothing passing. Mostly useful as a starting point.
    pub fn empty() -> Self {
        Self {
            qa01: QcGroup::default(),
            qa02: QcGroup::default(),
            qa03: None,
            qa04: QcGroup::default(),
            manual: None,
            decision: None,
            run_id: None,
            run_status: None,
            created_at: Utc::now(),
        }
    }

    /// Build the automatic part of a report from a run summary. The
    /// decision is the run's verdict: pass only for a passing run.
    pub fn from_summary(summary: &Summary) -> Self {
        let qa01 = QcGroup::from_check(summary.check(ids::HANDSHAKE_READY), ids::HANDSHAKE_READY);

        let mut qa02 = QcGroup::from_check(summary.check(ids::RESULT_SHAPE), ids::RESULT_SHAPE);
        if let Some(state) = summary.check(ids::STATE_SHAPE) {
            qa02.metrics
                .insert("stateShapeOk".to_string(), Value::Bool(state.ok));
        }

        let qa04 = QcGroup::from_check(summary.check(ids::RETRY_IDEMPOTENT), ids::RETRY_IDEMPOTENT);

        let decision = if summary.status == RunStatus::Pass {
            Decision::Pass
        } else {
            Decision::Fail
        };

        Self {
            qa01,
            qa02,
            qa03: None,
            qa04,
            manual: None,
            decision: Some(decision),
            run_id: Some(summary.run.run_id.clone()),
            run_status: Some(summary.status),
            created_at: Utc::now(),
        }
    }

    /// A new report carrying the same automatic groups plus the manual pass.
    pub fn with_manual(&self, manual: ManualValidation) -> Self {
        let mut metrics = Map::new();
        metrics.insert("noAutoplay".to_string(), Value::Bool(manual.no_autoplay));
        metrics.insert("noBlankFrame".to_string(), Value::Bool(manual.no_blank_frame));
        metrics.insert("touchGestureOk".to_string(), Value::Bool(manual.touch_gesture_ok));
        let failed = manual.failed_items();

        Self {
            qa03: Some(QcGroup {
                pass: failed.is_empty(),
                reason: (!failed.is_empty()).then(|| format!("not confirmed: {}", failed.join(", "))),
                metrics,
            }),
            manual: Some(manual),
            created_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::Severity;
    use crate::summary::{ResultAggregator, Run};
    use serde_json::json;

    fn summary(handshake_ok: bool) -> Summary {
        let mut agg = ResultAggregator::new(Run::new("run-9", "https://g/", "https://h/"));
        let handshake = if handshake_ok {
            Check::pass(ids::HANDSHAKE_READY, Severity::Blocker)
        } else {
            Check::fail(ids::HANDSHAKE_READY, Severity::Blocker, "no READY after INIT")
        };
        agg.upsert_check(handshake.with_details(json!({ "readyMs": 120, "budgetMs": 5000 })));
        agg.upsert_check(Check::pass(ids::RESULT_SHAPE, Severity::Blocker));
        agg.upsert_check(Check::fail(ids::STATE_SHAPE, Severity::Warning, "bad state"));
        agg.upsert_check(
            Check::pass(ids::RETRY_IDEMPOTENT, Severity::Blocker)
                .with_details(json!({ "attempts": 2, "retried": 1 })),
        );
        agg.finalize()
    }

    #[test]
    fn test_from_passing_summary() {
        let report = QcReport::from_summary(&summary(true));
        assert!(report.qa01.pass);
        assert_eq!(report.qa01.metrics["readyMs"], 120);
        assert!(report.qa02.pass);
        assert_eq!(report.qa02.metrics["stateShapeOk"], false);
        assert!(report.qa04.pass);
        assert_eq!(report.qa04.metrics["retried"], 1);
        assert!(report.qa03.is_none());
        assert_eq!(report.decision, Some(Decision::Pass));
        assert_eq!(report.run_id.as_deref(), Some("run-9"));
    }

    #[test]
    fn test_from_failing_summary() {
        let report = QcReport::from_summary(&summary(false));
        assert!(!report.qa01.pass);
        assert_eq!(report.qa01.reason.as_deref(), Some("no READY after INIT"));
        assert_eq!(report.decision, Some(Decision::Fail));
    }

    #[test]
    fn test_missing_check_does_not_pass() {
        let s = ResultAggregator::new(Run::new("r", "g", "h")).finalize();
        let report = QcReport::from_summary(&s);
        assert!(!report.qa04.pass);
        assert!(report.qa04.reason.unwrap().contains(ids::RETRY_IDEMPOTENT));
    }

    #[test]
    fn test_with_manual_keeps_automatic_groups() {
        let auto = QcReport::from_summary(&summary(true));
        let manual = auto.with_manual(ManualValidation {
            no_autoplay: true,
            no_blank_frame: false,
            touch_gesture_ok: true,
            reviewer: Some("lead".to_string()),
            notes: None,
        });
        assert_eq!(manual.qa01, auto.qa01);
        assert_eq!(manual.run_id, auto.run_id);
        let qa03 = manual.qa03.unwrap();
        assert!(!qa03.pass);
        assert_eq!(qa03.metrics["noBlankFrame"], false);
    }

    #[test]
    fn test_report_json_shape() {
        let json = serde_json::to_value(QcReport::from_summary(&summary(true))).unwrap();
        assert_eq!(json["qa01"]["pass"], true);
        assert_eq!(json["decision"], "pass");
        assert_eq!(json["runId"], "run-9");
        assert!(json.get("qa03").is_none());
    }
}
