//! Checks: named boolean assertions produced during a run, and the
//! evaluators that derive them from bridge logs and harness state.

pub mod evaluator;
pub mod manual;

use serde::{Deserialize, Serialize};

/// Ids with this prefix describe the test infrastructure rather than the
/// build. A failing one means the verdict itself cannot be trusted.
pub const INFRA_PREFIX: &str = "infra.";

/// Check ids emitted by this crate.
pub mod ids {
    pub const HANDSHAKE_READY: &str = "qa01.handshake_ready";
    pub const RESULT_SHAPE: &str = "qa02.result_shape";
    pub const STATE_SHAPE: &str = "qa02.state_shape";
    pub const NO_AUTOPLAY: &str = "qa03.no_autoplay";
    pub const NO_BLANK_FRAME: &str = "qa03.no_blank_frame";
    pub const TOUCH_GESTURE: &str = "qa03.touch_gesture";
    pub const RETRY_IDEMPOTENT: &str = "qa04.retry_idempotent";
    pub const HARNESS_ERRORS: &str = "harness.no_errors";
    pub const DRIVER_EXIT: &str = "driver.exit_code";

    pub const INFRA_DRIVER_SPAWN: &str = "infra.driver_spawn";
    pub const INFRA_BRIDGE_LOG: &str = "infra.bridge_log";
    pub const INFRA_HARNESS_TIMEOUT: &str = "infra.harness_timeout";
    pub const INFRA_ARTIFACT_UPLOAD: &str = "infra.artifact_upload";
}

/// How much a failing check matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Blocker,
}

/// One named assertion evaluated during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: String,
    pub severity: Severity,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Check {
    pub fn pass(id: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            severity,
            ok: true,
            message: None,
            details: None,
        }
    }

    pub fn fail(id: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            ok: false,
            message: Some(message.into()),
            details: None,
        }
    }

    /// Builder-style setter for `message`.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Builder-style setter for `details`.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_infra(&self) -> bool {
        self.id.starts_with(INFRA_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infra_tagging() {
        assert!(Check::pass(ids::INFRA_DRIVER_SPAWN, Severity::Blocker).is_infra());
        assert!(!Check::pass(ids::HANDSHAKE_READY, Severity::Blocker).is_infra());
        assert!(!Check::pass("infrastructure", Severity::Blocker).is_infra());
    }

    #[test]
    fn test_severity_wire_format() {
        assert_eq!(serde_json::to_string(&Severity::Blocker).unwrap(), "\"blocker\"");
        let sev: Severity = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(sev, Severity::Warning);
        assert!(Severity::Blocker > Severity::Warning);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = serde_json::to_string(&Check::pass("x", Severity::Warning)).unwrap();
        assert!(!json.contains("message"));
        assert!(!json.contains("details"));
    }
}
