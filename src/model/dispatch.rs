use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::unit::Unit;
use crate::model::user::UserProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatusKind {
    Unspecified,
    New,
    Unassigned,
    UnitAssigned,
    UnitUnassigned,
    UnitAccepted,
    UnitDeclined,
    EnRoute,
    OnScene,
    NeedAssistance,
    Completed,
    Cancelled,
    Archived,
    Deleted,
}

pub const TERMINAL_DISPATCH_STATUSES: [DispatchStatusKind; 4] = [
    DispatchStatusKind::Completed,
    DispatchStatusKind::Cancelled,
    DispatchStatusKind::Archived,
    DispatchStatusKind::Deleted,
];

impl DispatchStatusKind {
    pub fn is_terminal(&self) -> bool {
        TERMINAL_DISPATCH_STATUSES.contains(self)
    }

    /// Statuses that no longer apply once a dispatch reached a terminal state.
    pub fn is_dropped_when_terminal(&self) -> bool {
        matches!(
            self,
            DispatchStatusKind::Unassigned
                | DispatchStatusKind::UnitUnassigned
                | DispatchStatusKind::UnitAccepted
                | DispatchStatusKind::UnitDeclined
        )
    }

    /// Statuses whose identical repetition is suppressed.
    pub fn is_repeat_suppressed(&self) -> bool {
        matches!(self, DispatchStatusKind::New | DispatchStatusKind::Unassigned)
    }

    /// Statuses in which a dispatch without units is waiting for one.
    pub fn is_waiting_for_unit(&self) -> bool {
        matches!(
            self,
            DispatchStatusKind::Unspecified
                | DispatchStatusKind::New
                | DispatchStatusKind::Unassigned
                | DispatchStatusKind::UnitUnassigned
                | DispatchStatusKind::UnitDeclined
        )
    }
}

impl std::fmt::Display for DispatchStatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DispatchStatusKind::Unspecified => "unspecified",
            DispatchStatusKind::New => "new",
            DispatchStatusKind::Unassigned => "unassigned",
            DispatchStatusKind::UnitAssigned => "unit_assigned",
            DispatchStatusKind::UnitUnassigned => "unit_unassigned",
            DispatchStatusKind::UnitAccepted => "unit_accepted",
            DispatchStatusKind::UnitDeclined => "unit_declined",
            DispatchStatusKind::EnRoute => "en_route",
            DispatchStatusKind::OnScene => "on_scene",
            DispatchStatusKind::NeedAssistance => "need_assistance",
            DispatchStatusKind::Completed => "completed",
            DispatchStatusKind::Cancelled => "cancelled",
            DispatchStatusKind::Archived => "archived",
            DispatchStatusKind::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchAttribute {
    Multiple,
    Duplicate,
    TooOld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    Referenced,
    DuplicateOf,
    DuplicatedBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchReference {
    pub target_dispatch_id: u64,
    pub reference_type: ReferenceType,
}

impl DispatchReference {
    pub fn new(target_dispatch_id: u64, reference_type: ReferenceType) -> Self {
        Self {
            target_dispatch_id,
            reference_type,
        }
    }
}

/// One row of a dispatch's status history. Only the highest id is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchStatus {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub dispatch_id: u64,
    pub status: DispatchStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal: Option<String>,
}

/// Requested status change for a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchStatusInput {
    pub status: DispatchStatusKind,
    pub reason: Option<String>,
    pub code: Option<String>,
    pub unit_id: Option<u64>,
    pub user_id: Option<u64>,
}

impl DispatchStatusInput {
    pub fn new(status: DispatchStatusKind) -> Self {
        Self {
            status,
            reason: None,
            code: None,
            unit_id: None,
            user_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_unit(mut self, unit_id: u64) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn with_user(mut self, user_id: Option<u64>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// A unit assigned to a dispatch, with an optional confirmation deadline.
///
/// `unit` is a value snapshot taken when the assignment was resolved; the
/// authoritative record lives in the unit store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAssignment {
    pub dispatch_id: u64,
    pub unit_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl DispatchAssignment {
    pub fn is_pending(&self) -> bool {
        self.expires_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Jobs that can see and act on this dispatch.
    #[serde(default)]
    pub jobs: Vec<String>,
    /// Legacy single-job field, folded into `jobs` by [`Dispatch::normalize_jobs`].
    #[serde(default, skip_serializing)]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DispatchStatus>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: BTreeSet<DispatchAttribute>,
    #[serde(default)]
    pub references: Vec<DispatchReference>,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal: Option<String>,
    #[serde(default)]
    pub anon: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<UserProfile>,
    #[serde(default)]
    pub units: Vec<DispatchAssignment>,
}

impl Dispatch {
    pub fn new(jobs: Vec<String>, message: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            updated_at: None,
            jobs,
            job: None,
            status: None,
            message: message.into(),
            description: None,
            attributes: BTreeSet::new(),
            references: Vec::new(),
            x,
            y,
            postal: None,
            anon: false,
            creator_id: None,
            creator: None,
            units: Vec::new(),
        }
    }

    /// Fold the legacy `job` field into `jobs`, dropping duplicates and blanks.
    pub fn normalize_jobs(&mut self) {
        if let Some(job) = self.job.take() {
            if !job.is_empty() && !self.jobs.contains(&job) {
                self.jobs.insert(0, job);
            }
        }
        let mut seen = BTreeSet::new();
        self.jobs.retain(|j| !j.is_empty() && seen.insert(j.clone()));
    }

    pub fn current_status(&self) -> DispatchStatusKind {
        self.status
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(DispatchStatusKind::Unspecified)
    }

    pub fn is_terminal(&self) -> bool {
        self.current_status().is_terminal()
    }

    /// Waiting for a unit: no assignments and a pre-assignment status.
    pub fn is_unassigned(&self) -> bool {
        self.units.is_empty() && self.current_status().is_waiting_for_unit()
    }

    pub fn is_visible_to(&self, job: &str) -> bool {
        self.jobs.iter().any(|j| j == job)
    }

    pub fn has_unit(&self, unit_id: u64) -> bool {
        self.units.iter().any(|u| u.unit_id == unit_id)
    }

    pub fn assignment(&self, unit_id: u64) -> Option<&DispatchAssignment> {
        self.units.iter().find(|u| u.unit_id == unit_id)
    }

    pub fn unit_ids(&self) -> Vec<u64> {
        self.units.iter().map(|u| u.unit_id).collect()
    }

    /// Copy of the dispatch safe to hand to other users.
    pub fn public_view(&self) -> Dispatch {
        let mut dsp = self.clone();
        if dsp.anon {
            dsp.creator_id = None;
            dsp.creator = None;
        }
        dsp
    }
}
