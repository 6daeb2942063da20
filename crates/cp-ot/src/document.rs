use std::collections::BTreeMap;

use cp_base::DocumentId;

use crate::error::{OtError, Result};
use crate::operation::{Operation, OperationBatch};

/// A document's full edit history plus periodic content checkpoints.
///
/// Content is kept as a plain `String`, not a rope: a rope earns its keep
/// editing files measured in megabytes under an interactive cursor;
/// collaboration documents here are chat-scale, so the extra complexity
/// buys nothing (dropped from the dependency stack — see DESIGN.md).
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub content: String,
    pub version: u64,
    pub history: Vec<OperationBatch>,
    pub checkpoints: BTreeMap<u64, String>,
    pub checkpoint_interval: u64,
}

impl Document {
    pub fn new(id: DocumentId, checkpoint_interval: u64) -> Self {
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(0, String::new());
        Self {
            id,
            content: String::new(),
            version: 0,
            history: Vec::new(),
            checkpoints,
            checkpoint_interval,
        }
    }

    pub fn with_content(id: DocumentId, content: String, checkpoint_interval: u64) -> Self {
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(0, content.clone());
        Self {
            id,
            content,
            version: 0,
            history: Vec::new(),
            checkpoints,
            checkpoint_interval,
        }
    }

    /// Applies a batch already composed against `self.version`, bumping
    /// the version by one and appending a checkpoint every
    /// `checkpoint_interval` versions.
    ///
    /// Operations within a batch apply in reverse (highest position
    /// first), matching `Document.apply_batch` in the Python ancestor:
    /// applying later-in-the-document edits first means earlier
    /// positions in the same batch stay valid without re-indexing.
    pub fn apply_batch(&mut self, batch: OperationBatch) -> Result<()> {
        if batch.version > self.version {
            return Err(OtError::VersionAhead {
                batch_version: batch.version,
                document_version: self.version,
            });
        }
        if batch.version < self.version {
            return Err(OtError::VersionMismatch {
                batch_version: batch.version,
                document_version: self.version,
            });
        }

        let mut content = std::mem::take(&mut self.content);
        for op in batch.operations.iter().rev() {
            content = apply_operation(&content, op);
        }
        self.content = content;
        self.version += 1;
        self.history.push(batch);

        if self.version % self.checkpoint_interval == 0 {
            self.checkpoints.insert(self.version, self.content.clone());
        }

        Ok(())
    }

    /// Replays from the nearest checkpoint at or before `version` up to
    /// the requested version, for audit/undo/diff purposes.
    pub fn content_at_version(&self, version: u64) -> Result<String> {
        if version > self.version {
            return Err(OtError::VersionNotFound { version });
        }
        if version == self.version {
            return Ok(self.content.clone());
        }

        let (checkpoint_version, mut content) = self
            .checkpoints
            .range(..=version)
            .next_back()
            .map(|(v, c)| (*v, c.clone()))
            .ok_or(OtError::VersionNotFound { version })?;

        for batch in &self.history[checkpoint_version as usize..version as usize] {
            for op in batch.operations.iter().rev() {
                content = apply_operation(&content, op);
            }
        }
        Ok(content)
    }
}

/// Applies one operation to `content`, indexing by character position
/// (not byte offset, so multi-byte text stays correct). Out-of-range
/// positions clamp to the end of the content rather than erroring,
/// matching the forgiving-slice behavior of the Python ancestor.
pub(crate) fn apply_operation(content: &str, op: &Operation) -> String {
    match op {
        Operation::Insert { position, text } => {
            let idx = char_byte_index(content, *position);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..idx]);
            out.push_str(text);
            out.push_str(&content[idx..]);
            out
        }
        Operation::Delete { position, count } => {
            let start = char_byte_index(content, *position);
            let end = char_byte_index(content, *position + *count);
            let mut out = String::with_capacity(content.len().saturating_sub(end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            out
        }
        Operation::Retain { .. } => content.to_string(),
    }
}

fn char_byte_index(content: &str, char_pos: u64) -> usize {
    content
        .char_indices()
        .nth(char_pos as usize)
        .map(|(i, _)| i)
        .unwrap_or(content.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::BatchSource;
    use cp_base::UserId;

    fn batch(doc: &Document, ops: Vec<Operation>) -> OperationBatch {
        OperationBatch::new(UserId::new(), doc.id.clone(), doc.version, ops, BatchSource::User).unwrap()
    }

    #[test]
    fn applies_insert_and_delete_in_the_same_batch() {
        let mut doc = Document::with_content(DocumentId::new("d1"), "hello world".into(), 100);
        let b = batch(
            &doc,
            vec![
                Operation::Insert { position: 5, text: ",".into() },
                Operation::Delete { position: 6, count: 6 },
            ],
        );
        doc.apply_batch(b).unwrap();
        assert_eq!(doc.content, "hello,");
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn rejects_stale_batch_version() {
        let mut doc = Document::with_content(DocumentId::new("d1"), "abc".into(), 100);
        doc.version = 3;
        let b = OperationBatch::new(
            UserId::new(),
            doc.id.clone(),
            1,
            vec![Operation::Insert { position: 0, text: "x".into() }],
            BatchSource::User,
        )
        .unwrap();
        let err = doc.apply_batch(b).unwrap_err();
        assert!(matches!(err, OtError::VersionMismatch { .. }));
    }

    #[test]
    fn checkpoints_every_n_versions() {
        let mut doc = Document::with_content(DocumentId::new("d1"), "x".into(), 2);
        for _ in 0..4 {
            let b = batch(&doc, vec![Operation::Insert { position: 0, text: "y".into() }]);
            doc.apply_batch(b).unwrap();
        }
        assert_eq!(doc.version, 4);
        assert!(doc.checkpoints.contains_key(&2));
        assert!(doc.checkpoints.contains_key(&4));
        assert!(!doc.checkpoints.contains_key(&3));
    }

    #[test]
    fn content_at_version_replays_from_the_nearest_checkpoint() {
        let mut doc = Document::with_content(DocumentId::new("d1"), String::new(), 2);
        for ch in ["a", "b", "c", "d"] {
            let b = batch(&doc, vec![Operation::Insert { position: doc.content.len() as u64, text: ch.into() }]);
            doc.apply_batch(b).unwrap();
        }
        assert_eq!(doc.content, "abcd");
        assert_eq!(doc.content_at_version(2).unwrap(), "ab");
        assert_eq!(doc.content_at_version(0).unwrap(), "");
        assert_eq!(doc.content_at_version(4).unwrap(), "abcd");
    }

    #[test]
    fn handles_multibyte_content_by_character_index() {
        let mut doc = Document::with_content(DocumentId::new("d1"), "héllo".into(), 100);
        let b = batch(&doc, vec![Operation::Delete { position: 1, count: 1 }]);
        doc.apply_batch(b).unwrap();
        assert_eq!(doc.content, "hllo");
    }
}
