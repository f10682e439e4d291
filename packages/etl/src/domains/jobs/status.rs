//! Job record lifecycle.
//!
//! Every stage selects its work by status, so the full set of states and the
//! edges between them live here as one validated table. Transitions are
//! forward-only with one exception: the retry policy may roll a record back
//! one step to its domain's entry status, and nothing else.

use std::fmt;
use std::str::FromStr;

use sqlx::decode::Decode;
use sqlx::encode::{Encode, IsNull};
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Postgres, Type};
use thiserror::Error;

/// Lifecycle status of a job record, stored as TEXT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Freshly ingested, awaiting workplace classification
    Ingested,
    /// Queued into one or more workplace classification batches
    LlmBatchesGenerated,
    /// Workplace type written, awaiting location normalization
    WorkplaceClassified,
    /// Queued into one or more location normalization batches
    LocationBatchesGenerated,
    /// Normalized city/state/country written, awaiting geocoding
    LocationClassified,
    /// Coordinates resolved (or knowingly absent), awaiting embedding
    Geocoded,
    /// Queued into one or more embedding batches
    EmbeddingBatchesGenerated,
    /// Fully enriched; visible to downstream search
    Embedded,
    /// Excluded during geocoding (non-US record surfaced late)
    Invalid,
    /// Excluded by the location classifier returning a non-US country
    InvalidNonUsLocation,
    /// Workplace classification failed after exhausting retries
    FailedWorkplaceGeneration,
    /// Location normalization failed after exhausting retries
    FailedLocationGeneration,
}

/// An unrecognized status string read from storage.
#[derive(Debug, Error)]
#[error("unknown job status: {0:?}")]
pub struct UnknownStatus(String);

/// A status write that is not an edge of the lifecycle graph.
#[derive(Debug, Error)]
#[error("invalid job status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ingested => "ingested",
            JobStatus::LlmBatchesGenerated => "llm_batches_generated",
            JobStatus::WorkplaceClassified => "workplace_classified",
            JobStatus::LocationBatchesGenerated => "location_batches_generated",
            JobStatus::LocationClassified => "location_classified",
            JobStatus::Geocoded => "geocoded",
            JobStatus::EmbeddingBatchesGenerated => "embedding_batches_generated",
            JobStatus::Embedded => "embedded",
            JobStatus::Invalid => "invalid",
            JobStatus::InvalidNonUsLocation => "invalid - non-us-location",
            JobStatus::FailedWorkplaceGeneration => "failed - llm-workplace-generation",
            JobStatus::FailedLocationGeneration => "failed - llm-location-generation",
        }
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, to),
            (Ingested, LlmBatchesGenerated)
                | (LlmBatchesGenerated, WorkplaceClassified)
                | (LlmBatchesGenerated, Ingested)
                | (LlmBatchesGenerated, FailedWorkplaceGeneration)
                // lookup-cache hits skip location batch generation entirely
                | (WorkplaceClassified, LocationBatchesGenerated)
                | (WorkplaceClassified, LocationClassified)
                | (LocationBatchesGenerated, LocationClassified)
                | (LocationBatchesGenerated, WorkplaceClassified)
                | (LocationBatchesGenerated, FailedLocationGeneration)
                | (LocationBatchesGenerated, InvalidNonUsLocation)
                | (LocationClassified, Geocoded)
                | (LocationClassified, Invalid)
                | (Geocoded, EmbeddingBatchesGenerated)
                | (EmbeddingBatchesGenerated, Embedded)
                | (EmbeddingBatchesGenerated, Geocoded)
        )
    }

    /// Validate a transition, for callers that construct updates dynamically.
    pub fn transition_to(&self, to: JobStatus) -> Result<JobStatus, InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: *self, to })
        }
    }

    /// Whether this transition is a retry rollback to a domain entry status.
    pub fn is_rollback_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, to),
            (LlmBatchesGenerated, Ingested)
                | (LocationBatchesGenerated, WorkplaceClassified)
                | (EmbeddingBatchesGenerated, Geocoded)
        )
    }

    /// No stage ever moves a record out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Embedded
                | JobStatus::Invalid
                | JobStatus::InvalidNonUsLocation
                | JobStatus::FailedWorkplaceGeneration
                | JobStatus::FailedLocationGeneration
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingested" => Ok(JobStatus::Ingested),
            "llm_batches_generated" => Ok(JobStatus::LlmBatchesGenerated),
            "workplace_classified" => Ok(JobStatus::WorkplaceClassified),
            "location_batches_generated" => Ok(JobStatus::LocationBatchesGenerated),
            "location_classified" => Ok(JobStatus::LocationClassified),
            "geocoded" => Ok(JobStatus::Geocoded),
            "embedding_batches_generated" => Ok(JobStatus::EmbeddingBatchesGenerated),
            "embedded" => Ok(JobStatus::Embedded),
            "invalid" => Ok(JobStatus::Invalid),
            "invalid - non-us-location" => Ok(JobStatus::InvalidNonUsLocation),
            "failed - llm-workplace-generation" => Ok(JobStatus::FailedWorkplaceGeneration),
            "failed - llm-location-generation" => Ok(JobStatus::FailedLocationGeneration),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl Type<Postgres> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as Type<Postgres>>::compatible(ty)
    }
}

impl<'q> Encode<'q, Postgres> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <&str as Encode<'q, Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

impl<'r> Decode<'r, Postgres> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as Decode<'r, Postgres>>::decode(value)?;
        Ok(s.parse::<JobStatus>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::JobStatus::*;
    use super::*;

    const ALL: [JobStatus; 12] = [
        Ingested,
        LlmBatchesGenerated,
        WorkplaceClassified,
        LocationBatchesGenerated,
        LocationClassified,
        Geocoded,
        EmbeddingBatchesGenerated,
        Embedded,
        Invalid,
        InvalidNonUsLocation,
        FailedWorkplaceGeneration,
        FailedLocationGeneration,
    ];

    #[test]
    fn wire_strings_round_trip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_string_is_rejected() {
        assert!("pending".parse::<JobStatus>().is_err());
        assert!("".parse::<JobStatus>().is_err());
    }

    #[test]
    fn happy_path_advances_through_every_stage() {
        let path = [
            Ingested,
            LlmBatchesGenerated,
            WorkplaceClassified,
            LocationBatchesGenerated,
            LocationClassified,
            Geocoded,
            EmbeddingBatchesGenerated,
            Embedded,
        ];

        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn lookup_cache_skip_edge_is_allowed() {
        assert!(WorkplaceClassified.can_transition_to(LocationClassified));
    }

    #[test]
    fn only_retry_rollbacks_move_backwards() {
        let forward_order = |s: JobStatus| {
            [
                Ingested,
                LlmBatchesGenerated,
                WorkplaceClassified,
                LocationBatchesGenerated,
                LocationClassified,
                Geocoded,
                EmbeddingBatchesGenerated,
                Embedded,
            ]
            .iter()
            .position(|x| *x == s)
        };

        for from in ALL {
            for to in ALL {
                let (Some(a), Some(b)) = (forward_order(from), forward_order(to)) else {
                    continue;
                };
                if b < a && from.can_transition_to(to) {
                    assert!(
                        from.is_rollback_to(to),
                        "{} -> {} moves backwards but is not a sanctioned rollback",
                        from,
                        to
                    );
                }
            }
        }

        assert!(LlmBatchesGenerated.is_rollback_to(Ingested));
        assert!(LocationBatchesGenerated.is_rollback_to(WorkplaceClassified));
        assert!(EmbeddingBatchesGenerated.is_rollback_to(Geocoded));
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{} is terminal but transitions to {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn transition_to_rejects_skips() {
        assert!(Ingested.transition_to(WorkplaceClassified).is_err());
        assert!(Ingested.transition_to(Embedded).is_err());
        assert!(Geocoded.transition_to(Embedded).is_err());
    }
}
