use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::access::UnitAccess;
use crate::model::user::UserProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatusKind {
    Unspecified,
    UserAdded,
    UserRemoved,
    Unavailable,
    Available,
    OnBreak,
    Busy,
}

impl UnitStatusKind {
    /// Real availability states, as opposed to membership pseudo-events.
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            UnitStatusKind::Unavailable
                | UnitStatusKind::Available
                | UnitStatusKind::OnBreak
                | UnitStatusKind::Busy
        )
    }

    /// Availability states a STATIC unit may be driven into.
    pub fn allowed_for_static(&self) -> bool {
        matches!(
            self,
            UnitStatusKind::Busy | UnitStatusKind::OnBreak | UnitStatusKind::Unavailable
        )
    }
}

impl std::fmt::Display for UnitStatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitStatusKind::Unspecified => "unspecified",
            UnitStatusKind::UserAdded => "user_added",
            UnitStatusKind::UserRemoved => "user_removed",
            UnitStatusKind::Unavailable => "unavailable",
            UnitStatusKind::Available => "available",
            UnitStatusKind::OnBreak => "on_break",
            UnitStatusKind::Busy => "busy",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitAttribute {
    Static,
    NoDispatchAutoAssign,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitAssignment {
    pub unit_id: u64,
    pub user_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub unit_id: u64,
    pub status: UnitStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// User the event is about (joined/left member).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    /// User who caused the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<u64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitStatusInput {
    pub status: UnitStatusKind,
    pub reason: Option<String>,
    pub code: Option<String>,
    pub user_id: Option<u64>,
    pub creator_id: Option<u64>,
}

impl UnitStatusInput {
    pub fn new(status: UnitStatusKind) -> Self {
        Self {
            status,
            reason: None,
            code: None,
            user_id: None,
            creator_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_user(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_creator(mut self, creator_id: Option<u64>) -> Self {
        self.creator_id = creator_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub job: String,
    pub name: String,
    pub initials: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: BTreeSet<UnitAttribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_postal: Option<String>,
    #[serde(default)]
    pub users: Vec<UnitAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UnitStatus>,
    #[serde(default)]
    pub access: UnitAccess,
    /// Creator always passes the unit's access gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<u64>,
}

impl Unit {
    pub fn new(job: &str, name: &str, initials: &str) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            updated_at: None,
            job: job.to_string(),
            name: name.to_string(),
            initials: initials.to_string(),
            color: "#000000".to_string(),
            description: None,
            attributes: BTreeSet::new(),
            home_postal: None,
            users: Vec::new(),
            status: None,
            access: UnitAccess::default(),
            creator_id: None,
        }
    }

    pub fn current_status(&self) -> UnitStatusKind {
        self.status
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(UnitStatusKind::Unspecified)
    }

    pub fn is_static(&self) -> bool {
        self.attributes.contains(&UnitAttribute::Static)
    }

    pub fn has_user(&self, user_id: u64) -> bool {
        self.users.iter().any(|u| u.user_id == user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn user_ids(&self) -> Vec<u64> {
        self.users.iter().map(|u| u.user_id).collect()
    }

    /// Copy suitable for embedding in a dispatch assignment.
    pub fn snapshot(&self) -> Unit {
        let mut unit = self.clone();
        unit.access = UnitAccess::default();
        unit
    }
}

/// Secondary record answering "which unit is this user in".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserUnitMapping {
    pub user_id: u64,
    pub unit_id: u64,
    pub job: String,
    pub created_at: DateTime<Utc>,
}
