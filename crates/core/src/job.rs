//! Indexing jobs carried over the broker.
//!
//! A job travels as two parts: the JSON body `{"recordId": <id>}` and an
//! `attempts` header. The header is owned by the retry path; producers never
//! set it, so an absent header means "first delivery".

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::RecordId;

/// Header carrying the retry counter.
pub const ATTEMPTS_HEADER: &str = "attempts";

/// Wire shape of the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub record_id: RecordId,
}

/// A unit of indexing work for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Job {
    record_id: RecordId,
    attempts: u32,
}

impl Job {
    /// A freshly enqueued job (`attempts = 0`).
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            attempts: 0,
        }
    }

    pub fn with_attempts(record_id: RecordId, attempts: u32) -> Self {
        Self {
            record_id,
            attempts,
        }
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The job as it is republished after a failed attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            record_id: self.record_id,
            attempts: self.attempts.saturating_add(1),
        }
    }

    pub fn payload(&self) -> JobPayload {
        JobPayload {
            record_id: self.record_id,
        }
    }

    /// Serialized message body.
    pub fn encode_body(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(&self.payload())
            .map_err(|e| DomainError::malformed_payload(e.to_string()))
    }

    /// Header value for [`ATTEMPTS_HEADER`].
    pub fn attempts_header(&self) -> String {
        self.attempts.to_string()
    }

    /// Rebuild a job from a delivered body and its `attempts` header.
    ///
    /// A missing or unreadable header counts as zero attempts; a body that is
    /// not a valid payload is a [`DomainError::MalformedPayload`].
    pub fn decode(body: &[u8], attempts_header: Option<&str>) -> DomainResult<Self> {
        let payload: JobPayload = serde_json::from_slice(body)
            .map_err(|e| DomainError::malformed_payload(e.to_string()))?;

        let attempts = attempts_header
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(0);

        Ok(Self::with_attempts(payload.record_id, attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_uses_camel_case_record_id() {
        let body = Job::new(RecordId::new(42)).encode_body().unwrap();
        assert_eq!(body, br#"{"recordId":42}"#.to_vec());
    }

    #[test]
    fn absent_attempts_header_means_first_delivery() {
        let job = Job::decode(br#"{"recordId":7}"#, None).unwrap();
        assert_eq!(job.record_id(), RecordId::new(7));
        assert_eq!(job.attempts(), 0);
    }

    #[test]
    fn attempts_header_is_carried_over() {
        let job = Job::decode(br#"{"recordId":7}"#, Some("2")).unwrap();
        assert_eq!(job.attempts(), 2);
        assert_eq!(job.next_attempt().attempts(), 3);
    }

    #[test]
    fn garbage_attempts_header_counts_as_zero() {
        let job = Job::decode(br#"{"recordId":7}"#, Some("many")).unwrap();
        assert_eq!(job.attempts(), 0);
    }

    #[test]
    fn missing_record_id_is_malformed() {
        let err = Job::decode(br#"{"newsId":7}"#, None).unwrap_err();
        assert!(matches!(err, DomainError::MalformedPayload(_)));

        let err = Job::decode(b"not json", None).unwrap_err();
        assert!(matches!(err, DomainError::MalformedPayload(_)));
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn decode_never_panics_on_arbitrary_input(
                body in proptest::collection::vec(any::<u8>(), 0..64),
                header in proptest::option::of(".{0,12}"),
            ) {
                let _ = Job::decode(&body, header.as_deref());
            }

            #[test]
            fn encoded_job_decodes_with_its_header(id in any::<i64>(), attempts in 0u32..1000) {
                let job = Job::with_attempts(RecordId::new(id), attempts);
                let body = job.encode_body().unwrap();
                let header = job.attempts_header();
                prop_assert_eq!(Job::decode(&body, Some(&header)).unwrap(), job);
            }
        }
    }
}
