use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{QueueError, Result};
use crate::jobs::model::{Job, Payload};
use crate::jobs::registry::JobError;

/// A typed payload bound to exactly one job type.
///
/// The queue stores payloads as opaque JSON objects; producers and workers
/// share a struct implementing this trait instead of passing loose maps around.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    const JOB_TYPE: &'static str;

    fn to_payload(&self) -> Result<Payload> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(QueueError::InvalidPayload(format!(
                "{} payload must serialize to a JSON object, got {}",
                Self::JOB_TYPE,
                kind_of(&other)
            ))),
        }
    }
}

impl Job {
    /// Decode the stored payload. Failures are validation errors, so the job is
    /// never retried with the same bad input.
    pub fn payload_as<P: DeserializeOwned>(&self) -> std::result::Result<P, JobError> {
        serde_json::from_value(Value::Object(self.payload.0.clone())).map_err(|err| {
            JobError::validation(format!("invalid {} payload: {err}", self.job_type))
        })
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::failure::FailureType;
    use crate::jobs::model::JobStatus;
    use chrono::Utc;
    use serde::Deserialize;
    use sqlx::types::Json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct PlaylistDownload {
        playlist_url: String,
        max_items: Option<u32>,
    }

    impl JobPayload for PlaylistDownload {
        const JOB_TYPE: &'static str = "playlist_download";
    }

    #[derive(Serialize, Deserialize)]
    struct NotAnObject(u32);

    impl JobPayload for NotAnObject {
        const JOB_TYPE: &'static str = "broken";
    }

    fn job_with(payload: Payload) -> Job {
        Job {
            id: 1,
            job_type: PlaylistDownload::JOB_TYPE.into(),
            payload: Json(payload),
            status: JobStatus::Running,
            priority: 5,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            last_error_traceback: None,
            failure_type: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            worker_id: None,
            timeout_seconds: None,
            parent_job_id: None,
            dead_letter_reason: None,
            moved_to_dead_letter_at: None,
            log_file_path: None,
        }
    }

    #[test]
    fn typed_payload_decodes_from_job() {
        let p = PlaylistDownload {
            playlist_url: "https://example.invalid/list=PL1".into(),
            max_items: Some(25),
        };
        let job = job_with(p.to_payload().unwrap());
        assert_eq!(job.payload_as::<PlaylistDownload>().unwrap(), p);
    }

    #[test]
    fn missing_field_is_validation_error() {
        let job = job_with(Payload::new());
        let err = job.payload_as::<PlaylistDownload>().unwrap_err();
        assert_eq!(err.kind(), FailureType::ValidationError);
        assert!(err.message().contains("playlist_url"));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = NotAnObject(3).to_payload().unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload(_)));
    }
}
