use serde::{Deserialize, Serialize};

/// Display profile of a user, resolved through the user resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: u64,
    pub firstname: String,
    pub lastname: String,
    pub job: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,
    pub job_grade: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_grade_label: Option<String>,
}

impl UserProfile {
    pub fn new(user_id: u64, firstname: &str, lastname: &str, job: &str, job_grade: i32) -> Self {
        Self {
            user_id,
            firstname: firstname.to_string(),
            lastname: lastname.to_string(),
            job: job.to_string(),
            job_label: None,
            job_grade,
            job_grade_label: None,
        }
    }
}

/// Identity of the caller performing an action, used for access checks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
    pub user_id: u64,
    pub job: String,
    pub job_grade: i32,
    pub superuser: bool,
    /// Qualifications the user has successfully passed.
    pub qualifications: Vec<u64>,
}

impl UserInfo {
    pub fn new(user_id: u64, job: &str, job_grade: i32) -> Self {
        Self {
            user_id,
            job: job.to_string(),
            job_grade,
            ..Default::default()
        }
    }

    pub fn with_qualifications(mut self, qualifications: Vec<u64>) -> Self {
        self.qualifications = qualifications;
        self
    }
}

/// Last known position of a user as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserMarker {
    pub x: f64,
    pub y: f64,
    pub hidden: bool,
}
