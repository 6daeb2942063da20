use cp_base::UserId;

use crate::operation::{Operation, OperationBatch};

/// Which side of an insertion point a cursor sticks to when an
/// operation lands exactly on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Left,
    Right,
}

/// A user's caret and optional selection within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub user_id: UserId,
    pub position: u64,
    pub selection_start: Option<u64>,
    pub selection_end: Option<u64>,
}

impl Cursor {
    pub fn new(user_id: UserId, position: u64) -> Self {
        Self { user_id, position, selection_start: None, selection_end: None }
    }

    pub fn has_selection(&self) -> bool {
        self.selection_start.is_some() && self.selection_end.is_some()
    }
}

/// Moves a single position through one operation with the given bias.
fn transform_position(position: u64, op: &Operation, bias: Bias) -> u64 {
    match op {
        Operation::Insert { position: ins_pos, text } => {
            let len = text.chars().count() as u64;
            if *ins_pos < position {
                position + len
            } else if *ins_pos > position {
                position
            } else {
                match bias {
                    Bias::Right => position + len,
                    Bias::Left => position,
                }
            }
        }
        Operation::Delete { position: del_pos, count } => {
            let del_end = del_pos + count;
            if position <= *del_pos {
                position
            } else if position >= del_end {
                position - count
            } else {
                *del_pos
            }
        }
        Operation::Retain { .. } => position,
    }
}

/// Moves a cursor through one operation.
///
/// Resolves a bare (non-selection) caret
/// sitting exactly at an insertion point: the inserting user's own
/// caret sticks to the right of their own text (so continuing to type
/// stays after what was just typed), while every other user's caret
/// stays put to its left, per `CursorTransformer.transform_cursor` in
/// the Python ancestor. A selection's start/end bounds always use
/// `Left`/`Right` respectively regardless of ownership, so a selection
/// spanning an insertion point grows to include the inserted text no
/// matter who typed it.
pub fn transform_cursor(cursor: &Cursor, op: &Operation, is_own_operation: bool) -> Cursor {
    let bare_bias = if is_own_operation { Bias::Right } else { Bias::Left };
    let position = transform_position(cursor.position, op, bare_bias);
    let selection_start = cursor.selection_start.map(|s| transform_position(s, op, Bias::Left));
    let selection_end = cursor.selection_end.map(|e| transform_position(e, op, Bias::Right));
    Cursor { user_id: cursor.user_id, position, selection_start, selection_end }
}

/// Folds a cursor through every operation in a batch, in order.
pub fn transform_cursor_batch(cursor: &Cursor, batch: &OperationBatch) -> Cursor {
    let is_own = cursor.user_id == batch.user_id;
    let mut current = *cursor;
    for op in &batch.operations {
        current = transform_cursor(&current, op, is_own);
    }
    current
}

/// Transforms every cursor in `cursors` through a batch, by user id.
pub fn transform_all_cursors(
    cursors: impl IntoIterator<Item = Cursor>,
    batch: &OperationBatch,
) -> Vec<Cursor> {
    cursors.into_iter().map(|c| transform_cursor_batch(&c, batch)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::BatchSource;
    use cp_base::DocumentId;

    #[test]
    fn own_insert_pushes_own_caret_right_of_inserted_text() {
        let user = UserId::new();
        let cursor = Cursor::new(user, 5);
        let op = Operation::Insert { position: 5, text: "abc".into() };
        let moved = transform_cursor(&cursor, &op, true);
        assert_eq!(moved.position, 8);
    }

    #[test]
    fn other_users_caret_stays_left_of_an_insert_at_the_same_point() {
        let user = UserId::new();
        let other = UserId::new();
        let cursor = Cursor::new(user, 5);
        let op = Operation::Insert { position: 5, text: "abc".into() };
        let moved = transform_cursor(&cursor, &op, false);
        assert_eq!(moved.position, 5);
        let _ = other;
    }

    #[test]
    fn selection_bounds_always_grow_around_an_insert_regardless_of_ownership() {
        let user = UserId::new();
        let mut cursor = Cursor::new(user, 5);
        cursor.selection_start = Some(3);
        cursor.selection_end = Some(5);
        let op = Operation::Insert { position: 5, text: "xyz".into() };
        let moved = transform_cursor(&cursor, &op, false);
        assert_eq!(moved.selection_start, Some(3));
        assert_eq!(moved.selection_end, Some(8));
    }

    #[test]
    fn caret_inside_a_deleted_range_collapses_to_the_deletes_start() {
        let user = UserId::new();
        let cursor = Cursor::new(user, 5);
        let op = Operation::Delete { position: 2, count: 10 };
        let moved = transform_cursor(&cursor, &op, false);
        assert_eq!(moved.position, 2);
    }

    #[test]
    fn transform_cursor_batch_folds_through_every_operation() {
        let user = UserId::new();
        let author = UserId::new();
        let cursor = Cursor::new(user, 10);
        let batch = OperationBatch::new(
            author,
            DocumentId::new("d1"),
            0,
            vec![
                Operation::Insert { position: 0, text: "AA".into() },
                Operation::Delete { position: 12, count: 2 },
            ],
            BatchSource::User,
        )
        .unwrap();
        let moved = transform_cursor_batch(&cursor, &batch);
        assert_eq!(moved.position, 12);
    }
}
