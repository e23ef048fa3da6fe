//! Operator-attested presentation checks.

use serde::{Deserialize, Serialize};

use super::{ids, Check, Severity};

/// What a reviewer confirmed by hand on a real device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualValidation {
    /// No audio or video started without a user gesture.
    pub no_autoplay: bool,
    /// No blank frame between load and first interaction.
    pub no_blank_frame: bool,
    /// Touch gestures work as intended.
    pub touch_gesture_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ManualValidation {
    pub fn all_ok(&self) -> bool {
        self.no_autoplay && self.no_blank_frame && self.touch_gesture_ok
    }

    /// Names of the attestations that were not confirmed.
    pub fn failed_items(&self) -> Vec<&'static str> {
        [
            ("no_autoplay", self.no_autoplay),
            ("no_blank_frame", self.no_blank_frame),
            ("touch_gesture_ok", self.touch_gesture_ok),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect()
    }
}

/// Turn a manual validation into checks of the same shape as automatic ones.
pub fn evaluate_manual(manual: &ManualValidation) -> Vec<Check> {
    let item = |id: &str, ok: bool, what: &str| {
        if ok {
            Check::pass(id, Severity::Blocker)
        } else {
            Check::fail(id, Severity::Blocker, format!("reviewer reported {what}"))
        }
    };
    vec![
        item(ids::NO_AUTOPLAY, manual.no_autoplay, "unexpected autoplay"),
        item(ids::NO_BLANK_FRAME, manual.no_blank_frame, "a blank frame"),
        item(ids::TOUCH_GESTURE, manual.touch_gesture_ok, "broken touch gestures"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_checks() {
        let manual = ManualValidation {
            no_autoplay: true,
            no_blank_frame: false,
            touch_gesture_ok: true,
            reviewer: Some("qa-lead".to_string()),
            notes: None,
        };
        assert!(!manual.all_ok());
        assert_eq!(manual.failed_items(), vec!["no_blank_frame"]);

        let checks = evaluate_manual(&manual);
        assert_eq!(checks.len(), 3);
        assert!(checks[0].ok);
        assert!(!checks[1].ok);
        assert_eq!(checks[1].id, ids::NO_BLANK_FRAME);
    }

    #[test]
    fn test_wire_names() {
        let manual: ManualValidation = serde_json::from_str(
            r#"{"noAutoplay":true,"noBlankFrame":true,"touchGestureOk":true}"#,
        )
        .unwrap();
        assert!(manual.all_ok());
        assert!(manual.failed_items().is_empty());
    }
}
