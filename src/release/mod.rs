//! Game version lifecycle.
//!
//! A version moves through a fixed graph:
//!
//! ```text
//! draft -> uploaded -> qc_processing -> qc_passed -> approved -> published -> archived
//!              ^              |                                      ^            |
//!              +- qc_failed <-+                                      +------------+
//! ```
//!
//! Transitions are requested as [`Action`]s. Each action has exactly one
//! target state and a fixed set of source states; anything else is rejected
//! without touching the record.

pub mod report;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use self::report::{Decision, QcGroup, QcReport};
pub use self::store::{AuditEntry, GameVersion, NewVersion, ReleaseStore, Transition};

// ---------------------------------------------------------------------------
// VersionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Uploaded,
    QcProcessing,
    QcPassed,
    QcFailed,
    Approved,
    Published,
    Archived,
}

impl VersionStatus {
    pub const ALL: [VersionStatus; 8] = [
        VersionStatus::Draft,
        VersionStatus::Uploaded,
        VersionStatus::QcProcessing,
        VersionStatus::QcPassed,
        VersionStatus::QcFailed,
        VersionStatus::Approved,
        VersionStatus::Published,
        VersionStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Uploaded => "uploaded",
            VersionStatus::QcProcessing => "qc_processing",
            VersionStatus::QcPassed => "qc_passed",
            VersionStatus::QcFailed => "qc_failed",
            VersionStatus::Approved => "approved",
            VersionStatus::Published => "published",
            VersionStatus::Archived => "archived",
        }
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, to: VersionStatus) -> bool {
        use VersionStatus::*;
        matches!(
            (self, to),
            (Draft, Uploaded)
                | (QcFailed, Uploaded)
                | (Uploaded, QcProcessing)
                | (QcProcessing, QcPassed)
                | (QcProcessing, QcFailed)
                | (QcPassed, Approved)
                | (Approved, Published)
                | (Published, Archived)
                | (Archived, Published)
        )
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionStatus::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown version status: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Permissions and actors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Approve,
    Publish,
    Archive,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Approve => "approve",
            Permission::Publish => "publish",
            Permission::Archive => "archive",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Permission::Approve),
            "publish" => Ok(Permission::Publish),
            "archive" => Ok(Permission::Archive),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub permissions: Vec<Permission>,
}

impl Actor {
    pub fn new(id: impl Into<String>, permissions: Vec<Permission>) -> Self {
        Self {
            id: id.into(),
            permissions,
        }
    }

    /// The pipeline itself, used for automated QC decisions.
    pub fn system() -> Self {
        Self::new("system:qc-pipeline", Vec::new())
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

// ---------------------------------------------------------------------------
// Attestations
// ---------------------------------------------------------------------------

/// Uploader's statement that the build is ready for QC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attestations {
    pub device_tested: bool,
    pub audio_tested: bool,
    pub gameplay_complete: bool,
    pub content_verified: bool,
}

impl Attestations {
    pub fn all() -> Self {
        Self {
            device_tested: true,
            audio_tested: true,
            gameplay_complete: true,
            content_verified: true,
        }
    }

    /// Names of the attestations still missing.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("device_tested", self.device_tested),
            ("audio_tested", self.audio_tested),
            ("gameplay_complete", self.gameplay_complete),
            ("content_verified", self.content_verified),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect()
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A requested lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SubmitToQc,
    StartQc,
    RecordDecision(Decision),
    Approve,
    Publish,
    Archive,
    Republish,
}

impl Action {
    pub fn target(&self) -> VersionStatus {
        match self {
            Action::SubmitToQc => VersionStatus::Uploaded,
            Action::StartQc => VersionStatus::QcProcessing,
            Action::RecordDecision(Decision::Pass) => VersionStatus::QcPassed,
            Action::RecordDecision(Decision::Fail) => VersionStatus::QcFailed,
            Action::Approve => VersionStatus::Approved,
            Action::Publish | Action::Republish => VersionStatus::Published,
            Action::Archive => VersionStatus::Archived,
        }
    }

    /// States this action may start from.
    pub fn sources(&self) -> &'static [VersionStatus] {
        use VersionStatus::*;
        match self {
            Action::SubmitToQc => &[Draft, QcFailed],
            Action::StartQc => &[Uploaded],
            Action::RecordDecision(_) => &[QcProcessing],
            Action::Approve => &[QcPassed],
            Action::Publish => &[Approved],
            Action::Archive => &[Published],
            Action::Republish => &[Archived],
        }
    }

    pub fn required_permission(&self) -> Option<Permission> {
        match self {
            Action::Approve => Some(Permission::Approve),
            Action::Publish | Action::Republish => Some(Permission::Publish),
            Action::Archive => Some(Permission::Archive),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::SubmitToQc => "submit",
            Action::StartQc => "start_qc",
            Action::RecordDecision(_) => "qc_decision",
            Action::Approve => "approve",
            Action::Publish => "publish",
            Action::Archive => "archive",
            Action::Republish => "republish",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("version not found: {0}")]
    NotFound(String),

    #[error("invalid version: {0}")]
    Invalid(String),

    #[error("cannot {action} a version in status {from}")]
    InvalidTransition {
        action: &'static str,
        from: VersionStatus,
    },

    #[error("attestations missing: {}", missing.join(", "))]
    Incomplete { missing: Vec<&'static str> },

    #[error("QC gate {gate} failed: {reason}")]
    GateFailed { gate: String, reason: String },

    #[error("no QC report recorded for this version")]
    NoQcReport,

    #[error("missing permission: {permission}")]
    Forbidden { permission: Permission },

    #[error("version changed concurrently; expected status {expected}")]
    Stale { expected: VersionStatus },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ReleaseError {
    /// Stable machine-readable code for API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ReleaseError::NotFound(_) => "not_found",
            ReleaseError::Invalid(_) => "invalid",
            ReleaseError::InvalidTransition { .. } => "invalid_transition",
            ReleaseError::Incomplete { .. } => "incomplete",
            ReleaseError::GateFailed { .. } => "gate_failed",
            ReleaseError::NoQcReport => "no_qc_report",
            ReleaseError::Forbidden { .. } => "forbidden",
            ReleaseError::Stale { .. } => "stale",
            ReleaseError::Storage(_) => "storage",
        }
    }
}

impl From<rusqlite::Error> for ReleaseError {
    fn from(e: rusqlite::Error) -> Self {
        ReleaseError::Storage(e.into())
    }
}

impl From<r2d2::Error> for ReleaseError {
    fn from(e: r2d2::Error) -> Self {
        ReleaseError::Storage(e.into())
    }
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// The `qc_processing -> qc_passed` gate over the latest report.
///
/// qa01, qa02 and qa04 must pass. If manual validation was recorded, all of
/// its items must be confirmed too. The first failing gate is reported.
pub fn qc_gate(report: &QcReport) -> Result<(), ReleaseError> {
    for (gate, group) in [("qa01", &report.qa01), ("qa02", &report.qa02), ("qa04", &report.qa04)] {
        if !group.pass {
            return Err(ReleaseError::GateFailed {
                gate: gate.to_string(),
                reason: group
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("{gate} did not pass")),
            });
        }
    }
    if let Some(manual) = &report.manual {
        let failed = manual.failed_items();
        if !failed.is_empty() {
            return Err(ReleaseError::GateFailed {
                gate: "qa03".to_string(),
                reason: format!("manual validation not confirmed: {}", failed.join(", ")),
            });
        }
    }
    Ok(())
}

/// Check the preconditions of `action` against a version in `from` state.
///
/// `report` is the latest QC report, only consulted for a pass decision.
pub fn check_transition(
    action: Action,
    from: VersionStatus,
    attestations: &Attestations,
    report: Option<&QcReport>,
    actor: &Actor,
) -> Result<VersionStatus, ReleaseError> {
    if let Some(permission) = action.required_permission() {
        if !actor.has(permission) {
            return Err(ReleaseError::Forbidden { permission });
        }
    }

    if !action.sources().contains(&from) {
        return Err(ReleaseError::InvalidTransition {
            action: action.name(),
            from,
        });
    }
    let to = action.target();
    debug_assert!(from.can_transition_to(to));

    match action {
        Action::SubmitToQc => {
            let missing = attestations.missing();
            if !missing.is_empty() {
                return Err(ReleaseError::Incomplete { missing });
            }
        }
        Action::RecordDecision(Decision::Pass) => {
            let report = report.ok_or(ReleaseError::NoQcReport)?;
            qc_gate(report)?;
        }
        _ => {}
    }
    Ok(to)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
