use serde::{Deserialize, Serialize};

use crate::model::user::UserProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CentrumMode {
    #[default]
    Manual,
    /// Only disponents assign; units cannot take dispatches themselves.
    CentralCommand,
    AutoRoundRobin,
    Simplified,
}

impl std::fmt::Display for CentrumMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CentrumMode::Manual => write!(f, "manual"),
            CentrumMode::CentralCommand => write!(f, "central_command"),
            CentrumMode::AutoRoundRobin => write!(f, "auto_round_robin"),
            CentrumMode::Simplified => write!(f, "simplified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Seconds an unanswered dispatch may wait.
    pub dispatch_max_wait: u64,
    pub require_unit: bool,
    pub require_unit_reminder_seconds: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            dispatch_max_wait: 900,
            require_unit: false,
            require_unit_reminder_seconds: 180,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredefinedStatuses {
    #[serde(default)]
    pub unit_status: Vec<String>,
    #[serde(default)]
    pub dispatch_status: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentrumSettings {
    pub job: String,
    pub enabled: bool,
    pub mode: CentrumMode,
    pub fallback_mode: CentrumMode,
    #[serde(default)]
    pub predefined_statuses: PredefinedStatuses,
    #[serde(default)]
    pub timings: Timings,
}

impl CentrumSettings {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            enabled: false,
            mode: CentrumMode::Manual,
            fallback_mode: CentrumMode::AutoRoundRobin,
            predefined_statuses: PredefinedStatuses::default(),
            timings: Timings::default(),
        }
    }

    pub fn with_mode(mut self, mode: CentrumMode, fallback_mode: CentrumMode) -> Self {
        self.enabled = true;
        self.mode = mode;
        self.fallback_mode = fallback_mode;
        self
    }

    pub fn is_central_command(&self) -> bool {
        self.mode == CentrumMode::CentralCommand
    }

    /// Whether the auto-assignment bot should serve this job.
    pub fn bot_should_run(&self, disponent_count: usize) -> bool {
        self.enabled
            && (self.mode == CentrumMode::AutoRoundRobin
                || (self.fallback_mode == CentrumMode::AutoRoundRobin && disponent_count == 0))
    }
}

/// Dispatcher users currently directing a job's dispatch center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDisponents {
    pub job: String,
    #[serde(default)]
    pub disponents: Vec<UserProfile>,
}

impl JobDisponents {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            disponents: Vec::new(),
        }
    }

    pub fn contains(&self, user_id: u64) -> bool {
        self.disponents.iter().any(|d| d.user_id == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_runs_in_round_robin_mode() {
        let settings = CentrumSettings::new("police")
            .with_mode(CentrumMode::AutoRoundRobin, CentrumMode::Manual);
        assert!(settings.bot_should_run(0));
        assert!(settings.bot_should_run(3));
    }

    #[test]
    fn bot_runs_in_fallback_only_without_disponents() {
        let settings = CentrumSettings::new("police")
            .with_mode(CentrumMode::Manual, CentrumMode::AutoRoundRobin);
        assert!(settings.bot_should_run(0));
        assert!(!settings.bot_should_run(1));
    }

    #[test]
    fn disabled_settings_never_run_bot() {
        let mut settings = CentrumSettings::new("police")
            .with_mode(CentrumMode::AutoRoundRobin, CentrumMode::AutoRoundRobin);
        settings.enabled = false;
        assert!(!settings.bot_should_run(0));
    }
}
