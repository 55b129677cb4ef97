use crate::error::JobError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub(crate) enum JobState {
    Queued,
    Running {
        attempt: u8,
    },
    Succeeded {
        result: serde_json::Value,
    },
    Failed {
        kind: &'static str,
        http_status: u16,
        error: String,
    },
}

impl JobState {
    fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded { .. } | JobState::Failed { .. })
    }
}

#[derive(Clone, Debug, serde::Serialize)]
/// What clients get to see about a submitted job when polling by job ID.
pub(crate) struct JobRecord {
    pub(crate) job_id: String,
    pub(crate) queue: &'static str,
    pub(crate) action: &'static str,
    #[serde(flatten)]
    pub(crate) state: JobState,
    pub(crate) submitted_at: chrono::DateTime<chrono::Utc>,
    pub(crate) updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug)]
/// In-memory record of every job's latest state, shared between the queues
/// and the HTTP handlers. Terminal records expire after `ttl`.
pub(crate) struct JobStore {
    records: Arc<parking_lot::RwLock<HashMap<String, JobRecord>>>,
    ttl: chrono::TimeDelta,
}

impl JobStore {
    pub(crate) fn new(ttl: chrono::TimeDelta) -> Self {
        Self {
            records: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub(crate) fn queued(&self, job_id: &str, queue: &'static str, action: &'static str) {
        let now = chrono::Utc::now();
        let mut records = self.records.write();
        Self::prune(&mut records, self.ttl, now);

        // Job IDs are not required to be unique, a resubmission takes over.
        records.insert(
            job_id.to_string(),
            JobRecord {
                job_id: job_id.to_string(),
                queue,
                action,
                state: JobState::Queued,
                submitted_at: now,
                updated_at: now,
            },
        );
    }

    pub(crate) fn running(&self, job_id: &str, attempt: u8) {
        self.transition(job_id, JobState::Running { attempt });
    }

    pub(crate) fn succeeded(&self, job_id: &str, result: &impl serde::Serialize) {
        let result = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                event!(Level::WARN, "Failed to serialize result of job {job_id}: {e}");
                serde_json::Value::Null
            }
        };
        self.transition(job_id, JobState::Succeeded { result });
    }

    pub(crate) fn failed(&self, job_id: &str, err: &JobError) {
        self.transition(
            job_id,
            JobState::Failed {
                kind: err.kind(),
                http_status: err.status_code().as_u16(),
                error: err.to_string(),
            },
        );
    }

    pub(crate) fn remove(&self, job_id: &str) {
        self.records.write().remove(job_id);
    }

    pub(crate) fn get(&self, job_id: &str) -> Option<JobRecord> {
        let now = chrono::Utc::now();
        self.records
            .read()
            .get(job_id)
            .filter(|r| !Self::expired(r, self.ttl, now))
            .cloned()
    }

    fn transition(&self, job_id: &str, state: JobState) {
        let now = chrono::Utc::now();
        let mut records = self.records.write();
        Self::prune(&mut records, self.ttl, now);

        match records.get_mut(job_id) {
            Some(record) => {
                record.state = state;
                record.updated_at = now;
            }
            None => {
                event!(
                    Level::DEBUG,
                    "No record for job {job_id} in job store, dropping state update"
                );
            }
        }
    }

    fn expired(
        record: &JobRecord,
        ttl: chrono::TimeDelta,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        record.state.is_terminal() && now.signed_duration_since(record.updated_at) > ttl
    }

    fn prune(
        records: &mut HashMap<String, JobRecord>,
        ttl: chrono::TimeDelta,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        records.retain(|_, r| !Self::expired(r, ttl, now));
    }
}
