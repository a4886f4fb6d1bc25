//! Data-integrity validation (DIV).
//!
//! Every producer stamps its records with a GUID plus a `(segment, sequence)`
//! position; within a segment, sequences are consecutive. The validator
//! tracks the last validated position per producer and classifies each
//! incoming record:
//!
//! - **valid**: the next expected position; the caller records the new
//!   position into the offset record's pending-transformers map so
//!   validation state survives restarts;
//! - **duplicate**: at or before the tracked position, or from an already
//!   finished segment; skipped and counted;
//! - **fatal**: a gap. Sequences were skipped or a segment started past its
//!   beginning. Fatal before end-of-push fails the partition; after
//!   end-of-push it is logged and counted but ingestion continues, since the
//!   version is already serving traffic.
//!
//! Validator state is per partition and rebuildable from the last
//! checkpointed [`OffsetRecord`].

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{IngestionError, Result};
use crate::ingestion::message::MessageEnvelope;
use crate::ingestion::offsets::{OffsetRecord, ProducerPosition};
use crate::types::ProducerGuid;

/// Classification of a record that did not fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Record is the next expected one; carries the position to checkpoint.
    Valid(ProducerPosition),
    /// Record was already validated once; skip it.
    Duplicate,
}

/// Per-partition DIV state.
#[derive(Debug)]
pub struct DataIntegrityValidator {
    partition: u32,
    producers: HashMap<ProducerGuid, ProducerPosition>,
}

impl DataIntegrityValidator {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            producers: HashMap::new(),
        }
    }

    /// Rebuild validation state from a checkpointed offset record.
    pub fn restore_from(partition: u32, offset_record: &OffsetRecord) -> Self {
        let mut producers = HashMap::new();
        for (hex, position) in offset_record.producer_positions() {
            match ProducerGuid::from_hex(hex) {
                Some(guid) => {
                    producers.insert(guid, *position);
                }
                None => warn!(
                    partition,
                    guid = %hex,
                    "Dropping unparseable producer position from checkpoint"
                ),
            }
        }
        Self {
            partition,
            producers,
        }
    }

    /// Number of producers currently tracked.
    pub fn tracked_producers(&self) -> usize {
        self.producers.len()
    }

    /// Validate one record and advance the tracked position on success.
    pub fn validate(&mut self, envelope: &MessageEnvelope) -> Result<ValidationOutcome> {
        let meta = &envelope.producer_metadata;
        let incoming = ProducerPosition {
            segment_number: meta.segment_number,
            sequence_number: meta.sequence_number,
        };

        let previous = match self.producers.get(&meta.guid) {
            Some(previous) => *previous,
            None => {
                // First sighting of this producer. Checkpoints only carry
                // positions validated since the last sync, so an unknown
                // producer mid-stream is expected after a restore; accept its
                // current position and track from here.
                debug!(
                    partition = self.partition,
                    producer = %meta.guid,
                    segment = incoming.segment_number,
                    sequence = incoming.sequence_number,
                    "Tracking new producer"
                );
                self.producers.insert(meta.guid, incoming);
                return Ok(ValidationOutcome::Valid(incoming));
            }
        };

        if incoming.segment_number > previous.segment_number {
            // A new segment must start from sequence zero; anything else
            // means records of the previous or current segment were lost.
            if incoming.sequence_number == 0 {
                self.producers.insert(meta.guid, incoming);
                return Ok(ValidationOutcome::Valid(incoming));
            }
            return Err(IngestionError::FatalDataValidation {
                partition: self.partition,
                message: format!(
                    "producer {} jumped to segment {} sequence {} from segment {} sequence {}",
                    meta.guid,
                    incoming.segment_number,
                    incoming.sequence_number,
                    previous.segment_number,
                    previous.sequence_number
                ),
            });
        }

        if incoming.segment_number < previous.segment_number {
            // Replay of a finished segment.
            return Ok(ValidationOutcome::Duplicate);
        }

        let expected = previous.sequence_number + 1;
        if incoming.sequence_number == expected {
            self.producers.insert(meta.guid, incoming);
            Ok(ValidationOutcome::Valid(incoming))
        } else if incoming.sequence_number <= previous.sequence_number {
            Ok(ValidationOutcome::Duplicate)
        } else {
            Err(IngestionError::FatalDataValidation {
                partition: self.partition,
                message: format!(
                    "producer {} skipped from sequence {} to {} in segment {}",
                    meta.guid,
                    previous.sequence_number,
                    incoming.sequence_number,
                    incoming.segment_number
                ),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::message::{MessagePayload, ProducerMetadata};

    fn envelope(guid: ProducerGuid, segment: i32, sequence: i32) -> MessageEnvelope {
        MessageEnvelope {
            producer_metadata: ProducerMetadata {
                guid,
                segment_number: segment,
                sequence_number: sequence,
                message_timestamp_ms: 0,
                upstream_offset: -1,
            },
            leader_metadata: None,
            payload: MessagePayload::Delete,
        }
    }

    fn guid(tag: u8) -> ProducerGuid {
        ProducerGuid([tag; 16])
    }

    #[test]
    fn test_sequential_records_valid() {
        let mut validator = DataIntegrityValidator::new(0);
        for sequence in 0..5 {
            let outcome = validator.validate(&envelope(guid(1), 0, sequence)).unwrap();
            assert_eq!(
                outcome,
                ValidationOutcome::Valid(ProducerPosition {
                    segment_number: 0,
                    sequence_number: sequence,
                })
            );
        }
    }

    #[test]
    fn test_duplicate_sequence_detected() {
        let mut validator = DataIntegrityValidator::new(0);
        validator.validate(&envelope(guid(1), 0, 0)).unwrap();
        validator.validate(&envelope(guid(1), 0, 1)).unwrap();
        let outcome = validator.validate(&envelope(guid(1), 0, 1)).unwrap();
        assert_eq!(outcome, ValidationOutcome::Duplicate);
        let outcome = validator.validate(&envelope(guid(1), 0, 0)).unwrap();
        assert_eq!(outcome, ValidationOutcome::Duplicate);
        // The duplicate did not corrupt tracking.
        let outcome = validator.validate(&envelope(guid(1), 0, 2)).unwrap();
        assert!(matches!(outcome, ValidationOutcome::Valid(_)));
    }

    #[test]
    fn test_sequence_gap_is_fatal() {
        let mut validator = DataIntegrityValidator::new(7);
        validator.validate(&envelope(guid(1), 0, 0)).unwrap();
        let err = validator.validate(&envelope(guid(1), 0, 5)).unwrap_err();
        assert!(matches!(
            err,
            IngestionError::FatalDataValidation { partition: 7, .. }
        ));
    }

    #[test]
    fn test_new_segment_starts_at_zero() {
        let mut validator = DataIntegrityValidator::new(0);
        validator.validate(&envelope(guid(1), 0, 3)).unwrap();
        let outcome = validator.validate(&envelope(guid(1), 1, 0)).unwrap();
        assert!(matches!(outcome, ValidationOutcome::Valid(_)));
    }

    #[test]
    fn test_new_segment_with_nonzero_start_is_fatal() {
        let mut validator = DataIntegrityValidator::new(0);
        validator.validate(&envelope(guid(1), 0, 3)).unwrap();
        let err = validator.validate(&envelope(guid(1), 1, 4)).unwrap_err();
        assert!(matches!(err, IngestionError::FatalDataValidation { .. }));
    }

    #[test]
    fn test_older_segment_is_duplicate() {
        let mut validator = DataIntegrityValidator::new(0);
        validator.validate(&envelope(guid(1), 2, 0)).unwrap();
        let outcome = validator.validate(&envelope(guid(1), 1, 9)).unwrap();
        assert_eq!(outcome, ValidationOutcome::Duplicate);
    }

    #[test]
    fn test_independent_producers() {
        let mut validator = DataIntegrityValidator::new(0);
        validator.validate(&envelope(guid(1), 0, 0)).unwrap();
        // A second producer starts fresh without affecting the first.
        validator.validate(&envelope(guid(2), 0, 0)).unwrap();
        validator.validate(&envelope(guid(1), 0, 1)).unwrap();
        validator.validate(&envelope(guid(2), 0, 1)).unwrap();
        assert_eq!(validator.tracked_producers(), 2);
    }

    #[test]
    fn test_restore_from_checkpoint() {
        let mut offset_record = OffsetRecord::new();
        offset_record.record_producer_position(
            &guid(1),
            ProducerPosition {
                segment_number: 0,
                sequence_number: 4,
            },
        );

        let mut validator = DataIntegrityValidator::restore_from(3, &offset_record);
        assert_eq!(validator.tracked_producers(), 1);
        // Continues exactly where the checkpoint left off.
        let outcome = validator.validate(&envelope(guid(1), 0, 5)).unwrap();
        assert!(matches!(outcome, ValidationOutcome::Valid(_)));
        let outcome = validator.validate(&envelope(guid(1), 0, 4)).unwrap();
        assert_eq!(outcome, ValidationOutcome::Duplicate);
    }

    #[test]
    fn test_unknown_producer_mid_stream_accepted() {
        let mut validator = DataIntegrityValidator::new(0);
        // Restored state may not know this producer; accept mid-segment.
        let outcome = validator.validate(&envelope(guid(9), 3, 17)).unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::Valid(ProducerPosition {
                segment_number: 3,
                sequence_number: 17,
            })
        );
    }
}
