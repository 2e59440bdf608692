//! Admission types: the active set and the coordinator's decisions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobKind;

/// One admitted job and the models it reserves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub models: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// The set of currently admitted jobs.
///
/// Each entry is complete on its own: there is never a job id without its
/// model set. `version` increases on every successful write and is the
/// compare-and-swap token for durable stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveState {
    #[serde(default)]
    pub jobs: Vec<ActiveJob>,
    #[serde(default)]
    pub version: u64,
}

impl ActiveState {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.jobs.iter().any(|j| j.job_id == job_id)
    }

    pub fn get(&self, job_id: Uuid) -> Option<&ActiveJob> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    /// Union of every active job's models, in admission order.
    pub fn active_models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = Vec::new();
        for job in &self.jobs {
            for model in &job.models {
                if !models.contains(&model.as_str()) {
                    models.push(model.as_str());
                }
            }
        }
        models
    }

    /// First model in `required` that an active job already holds, with the holder.
    pub fn first_conflict<'a>(
        &'a self,
        required: &'a [String],
    ) -> Option<(&'a str, &'a ActiveJob)> {
        required.iter().find_map(|model| {
            self.jobs
                .iter()
                .find(|j| j.models.iter().any(|m| m == model))
                .map(|holder| (model.as_str(), holder))
        })
    }

    pub fn insert(&mut self, job: ActiveJob) {
        self.jobs.retain(|j| j.job_id != job.job_id);
        self.jobs.push(job);
    }

    /// Remove a job, returning its entry if it was active.
    pub fn remove(&mut self, job_id: Uuid) -> Option<ActiveJob> {
        let idx = self.jobs.iter().position(|j| j.job_id == job_id)?;
        Some(self.jobs.remove(idx))
    }
}

/// How the coordinator treats jobs whose models are disjoint from the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Admit alongside active jobs when no model overlaps.
    #[default]
    Partitioned,
    /// At most one active job system-wide.
    SingleFlight,
}

impl fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionMode::Partitioned => write!(f, "partitioned"),
            AdmissionMode::SingleFlight => write!(f, "single_flight"),
        }
    }
}

impl FromStr for AdmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "partitioned" => Ok(AdmissionMode::Partitioned),
            "single_flight" => Ok(AdmissionMode::SingleFlight),
            other => Err(format!("invalid admission mode: '{other}'")),
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    Rejected {
        /// Active job the caller is waiting on (absent for terminal jobs).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocked_by: Option<Uuid>,
        reason: String,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    pub fn blocked_by(&self) -> Option<Uuid> {
        match self {
            Admission::Admitted => None,
            Admission::Rejected { blocked_by, .. } => *blocked_by,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Admission::Admitted => None,
            Admission::Rejected { reason, .. } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(models: &[&str]) -> ActiveJob {
        ActiveJob {
            job_id: Uuid::now_v7(),
            kind: JobKind::Workflow,
            models: models.iter().map(|m| m.to_string()).collect(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn active_models_is_deduplicated_union() {
        let mut state = ActiveState::default();
        state.insert(active(&["gen-x", "upscaler"]));
        state.insert(active(&["upscaler", "motion"]));
        assert_eq!(state.active_models(), vec!["gen-x", "upscaler", "motion"]);
    }

    #[test]
    fn first_conflict_reports_holder() {
        let mut state = ActiveState::default();
        let holder = active(&["gen-x"]);
        let holder_id = holder.job_id;
        state.insert(holder);

        let required = vec!["motion".to_string(), "gen-x".to_string()];
        let (model, job) = state.first_conflict(&required).unwrap();
        assert_eq!(model, "gen-x");
        assert_eq!(job.job_id, holder_id);

        assert!(state.first_conflict(&["other".to_string()]).is_none());
    }

    #[test]
    fn first_conflict_follows_request_order() {
        let mut state = ActiveState::default();
        let holder = active(&["gen-x", "upscaler"]);
        let holder_id = holder.job_id;
        state.insert(holder);

        let required: Vec<String> = ["upscaler", "gen-x"].iter().map(|m| m.to_string()).collect();
        let reason = state
            .first_conflict(&required)
            .map(|(model, holder)| format!("{model} in use by {}", holder.job_id));
        assert_eq!(reason, Some(format!("upscaler in use by {holder_id}")));
    }

    #[test]
    fn insert_replaces_existing_entry() {
        let mut state = ActiveState::default();
        let mut job = active(&["a"]);
        state.insert(job.clone());
        job.models = vec!["b".to_string()];
        state.insert(job.clone());
        assert_eq!(state.jobs.len(), 1);
        assert_eq!(state.get(job.job_id).unwrap().models, vec!["b"]);
    }

    #[test]
    fn remove_returns_entry() {
        let mut state = ActiveState::default();
        let job = active(&["a"]);
        let id = job.job_id;
        state.insert(job);
        assert!(state.remove(id).is_some());
        assert!(state.remove(id).is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn admission_mode_parse() {
        assert_eq!(
            "single-flight".parse::<AdmissionMode>().unwrap(),
            AdmissionMode::SingleFlight
        );
        assert_eq!(AdmissionMode::default(), AdmissionMode::Partitioned);
        assert!("fifo".parse::<AdmissionMode>().is_err());
    }

    #[test]
    fn rejected_admission_accessors() {
        let blocker = Uuid::now_v7();
        let decision = Admission::Rejected {
            blocked_by: Some(blocker),
            reason: "gen-x in use".to_string(),
        };
        assert!(!decision.is_admitted());
        assert_eq!(decision.blocked_by(), Some(blocker));
        assert_eq!(decision.reason(), Some("gen-x in use"));
        assert!(Admission::Admitted.reason().is_none());
    }
}
