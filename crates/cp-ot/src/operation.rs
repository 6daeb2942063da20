use chrono::{DateTime, Utc};
use cp_base::{DocumentId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OtError, Result};

/// A single OT operation: `INSERT(position, text)`,
/// `DELETE(position, count)`, or `RETAIN(position, count)`.
///
/// Modeled as a sum type rather than a struct with optional `text`/
/// `count` fields (preferring sum types over nullability with sentinel
/// values).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Insert { position: u64, text: String },
    Delete { position: u64, count: u64 },
    Retain { position: u64, count: u64 },
}

impl Operation {
    pub fn position(&self) -> u64 {
        match self {
            Operation::Insert { position, .. }
            | Operation::Delete { position, .. }
            | Operation::Retain { position, .. } => *position,
        }
    }

    /// The half-open `[start, end)` range this operation claims in the
    /// pre-operation document, for the batch overlap check. An insert
    /// claims a zero-width point (it doesn't consume existing content).
    pub fn range(&self) -> (u64, u64) {
        match self {
            Operation::Insert { position, .. } => (*position, *position),
            Operation::Delete { position, count } | Operation::Retain { position, count } => {
                (*position, *position + count)
            }
        }
    }

    /// Validates the invariants: `position >= 0` is implied by
    /// the unsigned type; INSERT requires non-empty text, DELETE/RETAIN
    /// require a positive count.
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::Insert { text, .. } if text.is_empty() => {
                Err(OtError::InvalidOperation {
                    reason: "INSERT requires non-empty text".to_string(),
                })
            }
            Operation::Delete { count, .. } if *count == 0 => Err(OtError::InvalidOperation {
                reason: "DELETE requires count > 0".to_string(),
            }),
            Operation::Retain { count, .. } if *count == 0 => Err(OtError::InvalidOperation {
                reason: "RETAIN requires count > 0".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Where a batch originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSource {
    User,
    Undo,
    Redo,
    Server,
}

/// An atomic group of operations composed against a single document
/// version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub id: Uuid,
    pub user_id: UserId,
    pub document_id: DocumentId,
    pub version: u64,
    pub operations: Vec<Operation>,
    pub source: BatchSource,
    pub timestamp: DateTime<Utc>,
}

impl OperationBatch {
    /// JSON wire form used by the collaboration gateway's message
    /// envelope.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Builds a batch, sorting its operations by position and rejecting
    /// any that overlap once sorted.
    ///
    /// Resolves INSERT/DELETE interleave conservatively: two ranges
    /// overlapping after sorting is a hard validation error rather than
    /// a silent no-op.
    pub fn new(
        user_id: UserId,
        document_id: DocumentId,
        version: u64,
        mut operations: Vec<Operation>,
        source: BatchSource,
    ) -> Result<Self> {
        for op in &operations {
            op.validate()?;
        }
        operations.sort_by_key(|op| op.position());
        for i in 0..operations.len() {
            for j in (i + 1)..operations.len() {
                if ranges_overlap(operations[i].range(), operations[j].range()) {
                    return Err(OtError::OverlappingOperations);
                }
            }
        }
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            document_id,
            version,
            operations,
            source,
            timestamp: Utc::now(),
        })
    }
}

/// Two inserts at the identical position are ambiguous (which one lands
/// first is undefined without a tie-break), so they count as
/// overlapping even though both ranges are the single zero-width point.
/// Anything else uses ordinary half-open interval overlap.
fn ranges_overlap(a: (u64, u64), b: (u64, u64)) -> bool {
    let a_is_point = a.0 == a.1;
    let b_is_point = b.0 == b.1;
    if a_is_point && b_is_point {
        return a.0 == b.0;
    }
    a.0 < b.1 && b.0 < a.1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ops: Vec<Operation>) -> Result<OperationBatch> {
        OperationBatch::new(UserId::new(), DocumentId::new("doc-1"), 0, ops, BatchSource::User)
    }

    #[test]
    fn sorts_operations_by_position() {
        let b = batch(vec![
            Operation::Insert { position: 5, text: "b".into() },
            Operation::Insert { position: 1, text: "a".into() },
        ])
        .unwrap();
        assert_eq!(b.operations[0].position(), 1);
        assert_eq!(b.operations[1].position(), 5);
    }

    #[test]
    fn rejects_overlapping_deletes() {
        let err = batch(vec![
            Operation::Delete { position: 0, count: 5 },
            Operation::Delete { position: 3, count: 5 },
        ])
        .unwrap_err();
        assert!(matches!(err, OtError::OverlappingOperations));
    }

    #[test]
    fn rejects_empty_insert_text() {
        let err = batch(vec![Operation::Insert { position: 0, text: String::new() }]).unwrap_err();
        assert!(matches!(err, OtError::InvalidOperation { .. }));
    }

    #[test]
    fn json_round_trips_a_batch() {
        let b = batch(vec![Operation::Insert { position: 0, text: "hi".into() }]).unwrap();
        let raw = b.to_json().unwrap();
        let back = OperationBatch::from_json(&raw).unwrap();
        assert_eq!(back.operations, b.operations);
        assert_eq!(back.version, b.version);
    }

    #[test]
    fn allows_adjacent_non_overlapping_operations() {
        let b = batch(vec![
            Operation::Delete { position: 0, count: 3 },
            Operation::Delete { position: 3, count: 2 },
        ])
        .unwrap();
        assert_eq!(b.operations.len(), 2);
    }
}
