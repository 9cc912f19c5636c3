//! Access-control entries for units and the reconciliation of entry lists.
//!
//! Three entry shapes exist (job + minimum grade, direct user, qualification).
//! The diff between the stored and the desired list is computed once, against
//! the [`AccessEntry`] trait, for all of them.

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::model::user::UserInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    Unspecified,
    Blocked,
    Join,
}

/// Common shape of every access entry.
pub trait AccessEntry: Clone {
    type Key: Eq + Hash + Clone;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
    fn target_id(&self) -> u64;
    fn set_target_id(&mut self, target_id: u64);
    fn access(&self) -> AccessLevel;
    fn set_access(&mut self, access: AccessLevel);
    /// Identity of the grant independent of its database id.
    fn natural_key(&self) -> Self::Key;
}

pub trait JobAccessEntry: AccessEntry {
    fn job(&self) -> &str;
    fn minimum_grade(&self) -> i32;
}

pub trait UserAccessEntry: AccessEntry {
    fn user_id(&self) -> u64;
}

pub trait QualificationAccessEntry: AccessEntry {
    fn qualification_id(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitJobAccess {
    pub id: u64,
    pub target_id: u64,
    pub job: String,
    pub minimum_grade: i32,
    pub access: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitUserAccess {
    pub id: u64,
    pub target_id: u64,
    pub user_id: u64,
    pub access: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitQualificationAccess {
    pub id: u64,
    pub target_id: u64,
    pub qualification_id: u64,
    pub access: AccessLevel,
}

macro_rules! impl_access_entry {
    ($ty:ty, $key:ty, |$s:ident| $natural:expr) => {
        impl AccessEntry for $ty {
            type Key = $key;

            fn id(&self) -> u64 {
                self.id
            }
            fn set_id(&mut self, id: u64) {
                self.id = id;
            }
            fn target_id(&self) -> u64 {
                self.target_id
            }
            fn set_target_id(&mut self, target_id: u64) {
                self.target_id = target_id;
            }
            fn access(&self) -> AccessLevel {
                self.access
            }
            fn set_access(&mut self, access: AccessLevel) {
                self.access = access;
            }
            fn natural_key(&self) -> Self::Key {
                let $s = self;
                $natural
            }
        }
    };
}

impl_access_entry!(UnitJobAccess, (String, i32), |s| (s.job.clone(), s.minimum_grade));
impl_access_entry!(UnitUserAccess, u64, |s| s.user_id);
impl_access_entry!(UnitQualificationAccess, u64, |s| s.qualification_id);

impl JobAccessEntry for UnitJobAccess {
    fn job(&self) -> &str {
        &self.job
    }
    fn minimum_grade(&self) -> i32 {
        self.minimum_grade
    }
}

impl UserAccessEntry for UnitUserAccess {
    fn user_id(&self) -> u64 {
        self.user_id
    }
}

impl QualificationAccessEntry for UnitQualificationAccess {
    fn qualification_id(&self) -> u64 {
        self.qualification_id
    }
}

/// Entries to create, update and delete to turn `current` into `desired`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessChanges<T> {
    pub to_create: Vec<T>,
    pub to_update: Vec<T>,
    pub to_delete: Vec<T>,
}

impl<T> AccessChanges<T> {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

impl<T> Default for AccessChanges<T> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
        }
    }
}

/// Diff two entry lists by natural key.
///
/// Updated entries keep the id of the stored entry; created entries are
/// bound to `target_id`.
pub fn reconcile<T: AccessEntry>(target_id: u64, current: &[T], desired: &[T]) -> AccessChanges<T> {
    let mut changes = AccessChanges::default();
    let mut existing: HashMap<T::Key, &T> =
        current.iter().map(|e| (e.natural_key(), e)).collect();

    for want in desired {
        match existing.remove(&want.natural_key()) {
            Some(have) => {
                if have.access() != want.access() {
                    let mut updated = have.clone();
                    updated.set_access(want.access());
                    changes.to_update.push(updated);
                }
            }
            None => {
                let mut created = want.clone();
                created.set_id(0);
                created.set_target_id(target_id);
                changes.to_create.push(created);
            }
        }
    }

    // Keep deletion order stable for callers and tests
    let mut leftover: Vec<T> = existing.into_values().cloned().collect();
    leftover.sort_by_key(|e| e.id());
    changes.to_delete = leftover;
    changes
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitAccess {
    #[serde(default)]
    pub jobs: Vec<UnitJobAccess>,
    #[serde(default)]
    pub users: Vec<UnitUserAccess>,
    #[serde(default)]
    pub qualifications: Vec<UnitQualificationAccess>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitAccessChanges {
    pub jobs: AccessChanges<UnitJobAccess>,
    pub users: AccessChanges<UnitUserAccess>,
    pub qualifications: AccessChanges<UnitQualificationAccess>,
}

impl UnitAccessChanges {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.users.is_empty() && self.qualifications.is_empty()
    }
}

impl UnitAccess {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.users.is_empty() && self.qualifications.is_empty()
    }

    pub fn diff(&self, target_id: u64, desired: &UnitAccess) -> UnitAccessChanges {
        UnitAccessChanges {
            jobs: reconcile(target_id, &self.jobs, &desired.jobs),
            users: reconcile(target_id, &self.users, &desired.users),
            qualifications: reconcile(target_id, &self.qualifications, &desired.qualifications),
        }
    }

    /// Whether any grant in this list admits `user` at `required` level.
    ///
    /// An empty list admits everyone.
    pub fn allows(&self, user: &UserInfo, required: AccessLevel) -> bool {
        if user.superuser || self.is_empty() {
            return true;
        }

        let user_grant = self
            .users
            .iter()
            .any(|e| e.user_id() == user.user_id && e.access() >= required);
        let job_grant = self.jobs.iter().any(|e| {
            e.job() == user.job && user.job_grade >= e.minimum_grade() && e.access() >= required
        });
        let qualification_grant = self.qualifications.iter().any(|e| {
            user.qualifications.contains(&e.qualification_id()) && e.access() >= required
        });

        user_grant || job_grant || qualification_grant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_entry(id: u64, job: &str, grade: i32, access: AccessLevel) -> UnitJobAccess {
        UnitJobAccess {
            id,
            target_id: 1,
            job: job.to_string(),
            minimum_grade: grade,
            access,
        }
    }

    fn user_entry(id: u64, user_id: u64, access: AccessLevel) -> UnitUserAccess {
        UnitUserAccess {
            id,
            target_id: 1,
            user_id,
            access,
        }
    }

    #[test]
    fn reconcile_creates_updates_and_deletes() {
        let current = vec![
            job_entry(1, "police", 0, AccessLevel::Join),
            job_entry(2, "police", 5, AccessLevel::Join),
            job_entry(3, "ambulance", 0, AccessLevel::Join),
        ];
        let desired = vec![
            job_entry(0, "police", 0, AccessLevel::Join),
            job_entry(0, "police", 5, AccessLevel::Blocked),
            job_entry(0, "doj", 2, AccessLevel::Join),
        ];

        let changes = reconcile(1, &current, &desired);
        assert_eq!(changes.to_create.len(), 1);
        assert_eq!(changes.to_create[0].job, "doj");
        assert_eq!(changes.to_create[0].target_id, 1);
        assert_eq!(changes.to_update.len(), 1);
        assert_eq!(changes.to_update[0].id, 2);
        assert_eq!(changes.to_update[0].access, AccessLevel::Blocked);
        assert_eq!(changes.to_delete.len(), 1);
        assert_eq!(changes.to_delete[0].id, 3);
    }

    #[test]
    fn reconcile_identical_lists_is_empty() {
        let current = vec![user_entry(1, 10, AccessLevel::Join)];
        let desired = vec![user_entry(0, 10, AccessLevel::Join)];
        assert!(reconcile(1, &current, &desired).is_empty());
    }

    #[test]
    fn empty_access_admits_everyone() {
        let access = UnitAccess::default();
        assert!(access.allows(&UserInfo::new(1, "police", 0), AccessLevel::Join));
    }

    #[test]
    fn job_grade_grant() {
        let access = UnitAccess {
            jobs: vec![job_entry(1, "police", 3, AccessLevel::Join)],
            ..Default::default()
        };
        assert!(access.allows(&UserInfo::new(1, "police", 3), AccessLevel::Join));
        assert!(!access.allows(&UserInfo::new(1, "police", 2), AccessLevel::Join));
        assert!(!access.allows(&UserInfo::new(1, "ambulance", 9), AccessLevel::Join));
    }

    #[test]
    fn user_and_qualification_grants() {
        let access = UnitAccess {
            users: vec![user_entry(1, 42, AccessLevel::Join)],
            qualifications: vec![UnitQualificationAccess {
                id: 1,
                target_id: 1,
                qualification_id: 7,
                access: AccessLevel::Join,
            }],
            ..Default::default()
        };
        assert!(access.allows(&UserInfo::new(42, "police", 0), AccessLevel::Join));
        assert!(access.allows(
            &UserInfo::new(5, "police", 0).with_qualifications(vec![7]),
            AccessLevel::Join
        ));
        assert!(!access.allows(&UserInfo::new(5, "police", 0), AccessLevel::Join));
    }

    #[test]
    fn blocked_grant_does_not_admit() {
        let access = UnitAccess {
            users: vec![user_entry(1, 42, AccessLevel::Blocked)],
            ..Default::default()
        };
        assert!(!access.allows(&UserInfo::new(42, "police", 0), AccessLevel::Join));

        let mut superuser = UserInfo::new(42, "police", 0);
        superuser.superuser = true;
        assert!(superuser.superuser);
        assert!(access.allows(&superuser, AccessLevel::Join));
    }
}
