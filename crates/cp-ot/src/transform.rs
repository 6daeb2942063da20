use crate::operation::Operation;

/// Which side wins a position tie between two INSERTs.
/// The batch that reached the server first (in server arrival order)
/// takes `Left` priority and keeps its position; the other is pushed
/// right of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Left,
    Right,
}

/// Transforms operation `a` against concurrent operation `b`, both
/// composed against the same document version, returning the adjusted
/// forms of each so that `apply(apply(doc, a), b')` and
/// `apply(apply(doc, b), a')` converge (TP1).
///
/// `None` means the operation was fully subsumed by the other side (an
/// INSERT that landed inside a DELETE's range, or a DELETE consumed
/// entirely by an overlapping DELETE) and drops out of the batch.
pub fn transform_pair(a: &Operation, b: &Operation, priority: Priority) -> (Option<Operation>, Option<Operation>) {
    match (a, b) {
        (Operation::Insert { .. }, Operation::Insert { .. }) => {
            let (a2, b2) = transform_insert_insert(a, b, priority);
            (Some(a2), Some(b2))
        }
        (Operation::Insert { .. }, Operation::Delete { .. }) => {
            let (a2, b2) = transform_insert_delete(a, b);
            (a2, Some(b2))
        }
        (Operation::Delete { .. }, Operation::Insert { .. }) => {
            let (b2, a2) = transform_insert_delete(b, a);
            (Some(a2), b2)
        }
        (Operation::Delete { .. }, Operation::Delete { .. }) => transform_delete_delete(a, b),
        // RETAIN never mutates content, so it has no effect on the other
        // side and nothing can transform it.
        (Operation::Retain { .. }, _) => (Some(a.clone()), Some(b.clone())),
        (_, Operation::Retain { .. }) => (Some(a.clone()), Some(b.clone())),
    }
}

fn transform_insert_insert(a: &Operation, b: &Operation, priority: Priority) -> (Operation, Operation) {
    let (a_pos, a_text) = insert_parts(a);
    let (b_pos, b_text) = insert_parts(b);

    if a_pos < b_pos {
        (a.clone(), Operation::Insert { position: b_pos + a_text.chars().count() as u64, text: b_text.to_string() })
    } else if a_pos > b_pos {
        (Operation::Insert { position: a_pos + b_text.chars().count() as u64, text: a_text.to_string() }, b.clone())
    } else {
        match priority {
            Priority::Left => (
                a.clone(),
                Operation::Insert { position: b_pos + a_text.chars().count() as u64, text: b_text.to_string() },
            ),
            Priority::Right => (
                Operation::Insert { position: a_pos + b_text.chars().count() as u64, text: a_text.to_string() },
                b.clone(),
            ),
        }
    }
}

/// `ins` and `del` are both composed against the same pre-operation
/// document. Returns the transformed insert (`None` if it landed inside
/// the deleted range) and the transformed delete (its range only ever
/// grows or shifts, never disappears here).
fn transform_insert_delete(ins: &Operation, del: &Operation) -> (Option<Operation>, Operation) {
    let (ins_pos, ins_text) = insert_parts(ins);
    let (del_pos, del_count) = delete_parts(del);
    let del_end = del_pos + del_count;

    if ins_pos <= del_pos {
        (Some(ins.clone()), Operation::Delete { position: del_pos + ins_text.chars().count() as u64, count: del_count })
    } else if ins_pos >= del_end {
        (
            Some(Operation::Insert { position: ins_pos - del_count, text: ins_text.to_string() }),
            del.clone(),
        )
    } else {
        (None, Operation::Delete { position: del_pos, count: del_count + ins_text.chars().count() as u64 })
    }
}

/// General delete/delete transform. Computes, for each side, how much
/// of the *other* delete's range lies strictly before its own start
/// (shifting its position left by that much) and how much overlaps its
/// own range (shrinking its count by that much). This single formula
/// covers the disjoint, overlapping, containing, and identical cases
/// from one shared formula without branching on which case applies.
fn transform_delete_delete(a: &Operation, b: &Operation) -> (Option<Operation>, Option<Operation>) {
    let (a_pos, a_count) = delete_parts(a);
    let (b_pos, b_count) = delete_parts(b);
    let a_end = a_pos + a_count;
    let b_end = b_pos + b_count;

    let overlap_start = max(a_pos, b_pos);
    let overlap_end = min(a_end, b_end);
    let overlap = if overlap_end > overlap_start { overlap_end - overlap_start } else { 0 };

    let b_before_a_end = min(b_end, a_pos);
    let before_a = if b_before_a_end > b_pos { b_before_a_end - b_pos } else { 0 };

    let a_before_b_end = min(a_end, b_pos);
    let before_b = if a_before_b_end > a_pos { a_before_b_end - a_pos } else { 0 };

    let a_new_count = a_count.saturating_sub(overlap);
    let b_new_count = b_count.saturating_sub(overlap);

    let a2 = if a_new_count == 0 {
        None
    } else {
        Some(Operation::Delete { position: a_pos.saturating_sub(before_a), count: a_new_count })
    };
    let b2 = if b_new_count == 0 {
        None
    } else {
        Some(Operation::Delete { position: b_pos.saturating_sub(before_b), count: b_new_count })
    };
    (a2, b2)
}

/// Threads every operation of batch `a` through every operation of
/// batch `b`, each fold step transforming the current form of the `a`
/// operation against the current form of the corresponding `b`
/// operation and carrying both forward, so later pairs see the effects
/// of earlier ones. Operations dropped by subsumption contribute
/// nothing further.
pub fn transform_batch(a_ops: &[Operation], b_ops: &[Operation], priority: Priority) -> (Vec<Operation>, Vec<Operation>) {
    let mut a_result = Vec::with_capacity(a_ops.len());
    let mut b_current: Vec<Operation> = b_ops.to_vec();

    for a_op in a_ops {
        let mut a_cur = Some(a_op.clone());
        let mut next_b = Vec::with_capacity(b_current.len());
        for b_op in &b_current {
            match a_cur {
                Some(ref a_val) => {
                    let (na, nb) = transform_pair(a_val, b_op, priority);
                    a_cur = na;
                    if let Some(b_val) = nb {
                        next_b.push(b_val);
                    }
                }
                None => next_b.push(b_op.clone()),
            }
        }
        if let Some(a_val) = a_cur {
            a_result.push(a_val);
        }
        b_current = next_b;
    }

    (a_result, b_current)
}

fn insert_parts(op: &Operation) -> (u64, &str) {
    match op {
        Operation::Insert { position, text } => (*position, text.as_str()),
        _ => unreachable!("insert_parts called on a non-insert operation"),
    }
}

fn delete_parts(op: &Operation) -> (u64, u64) {
    match op {
        Operation::Delete { position, count } => (*position, *count),
        _ => unreachable!("delete_parts called on a non-delete operation"),
    }
}

fn min(a: u64, b: u64) -> u64 {
    if a < b { a } else { b }
}

fn max(a: u64, b: u64) -> u64 {
    if a > b { a } else { b }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::apply_operation;

    #[test]
    fn insert_insert_tie_break_left_priority_keeps_position() {
        let a = Operation::Insert { position: 3, text: "A".into() };
        let b = Operation::Insert { position: 3, text: "B".into() };
        let (a2, b2) = transform_pair(&a, &b, Priority::Left);
        assert_eq!(a2, Some(a));
        assert_eq!(b2, Some(Operation::Insert { position: 4, text: "B".into() }));
    }

    #[test]
    fn insert_inside_delete_range_is_subsumed_and_delete_grows() {
        let ins = Operation::Insert { position: 5, text: "X".into() };
        let del = Operation::Delete { position: 2, count: 6 };
        let (ins2, del2) = transform_pair(&ins, &del, Priority::Left);
        assert_eq!(ins2, None);
        assert_eq!(del2, Some(Operation::Delete { position: 2, count: 7 }));
    }

    #[test]
    fn delete_delete_disjoint_shifts_the_later_one_left() {
        let a = Operation::Delete { position: 2, count: 3 };
        let b = Operation::Delete { position: 10, count: 3 };
        let (a2, b2) = transform_pair(&a, &b, Priority::Left);
        assert_eq!(a2, Some(a));
        assert_eq!(b2, Some(Operation::Delete { position: 7, count: 3 }));
    }

    #[test]
    fn delete_delete_identical_ranges_both_drop() {
        let a = Operation::Delete { position: 2, count: 3 };
        let b = Operation::Delete { position: 2, count: 3 };
        let (a2, b2) = transform_pair(&a, &b, Priority::Left);
        assert_eq!(a2, None);
        assert_eq!(b2, None);
    }

    #[test]
    fn delete_delete_full_containment_subsumes_the_smaller() {
        let a = Operation::Delete { position: 0, count: 10 };
        let b = Operation::Delete { position: 2, count: 2 };
        let (a2, b2) = transform_pair(&a, &b, Priority::Left);
        assert_eq!(a2, Some(Operation::Delete { position: 0, count: 8 }));
        assert_eq!(b2, None);
    }

    /// TP1 convergence: applying `a` then `transform(b against a)` must
    /// produce the same document as applying `b` then `transform(a
    /// against b)`.
    fn converges(content: &str, a: Operation, b: Operation, priority: Priority) -> bool {
        let (a2, b2) = transform_pair(&a, &b, priority);
        let (b3, a3) = transform_pair(&b, &a, opposite(priority));

        let mut left = content.to_string();
        left = apply_operation(&left, &a);
        if let Some(b2) = &b2 {
            left = apply_operation(&left, b2);
        }

        let mut right = content.to_string();
        right = apply_operation(&right, &b);
        if let Some(a3) = &a3 {
            right = apply_operation(&right, a3);
        }

        let _ = (a2, b3);
        left == right
    }

    fn opposite(p: Priority) -> Priority {
        match p {
            Priority::Left => Priority::Right,
            Priority::Right => Priority::Left,
        }
    }

    #[test]
    fn tp1_holds_for_concurrent_inserts() {
        assert!(converges(
            "0123456789",
            Operation::Insert { position: 5, text: "AA".into() },
            Operation::Insert { position: 5, text: "BB".into() },
            Priority::Left,
        ));
    }

    #[test]
    fn tp1_holds_for_insert_and_overlapping_delete() {
        assert!(converges(
            "0123456789",
            Operation::Insert { position: 5, text: "X".into() },
            Operation::Delete { position: 2, count: 6 },
            Priority::Left,
        ));
    }

    #[test]
    fn tp1_holds_for_two_overlapping_deletes() {
        assert!(converges(
            "0123456789",
            Operation::Delete { position: 2, count: 5 },
            Operation::Delete { position: 4, count: 5 },
            Priority::Left,
        ));
    }

    mod convergence_properties {
        use super::*;
        use proptest::prelude::*;

        const CONTENT: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

        fn arb_op() -> impl Strategy<Value = Operation> {
            prop_oneof![
                (0u64..CONTENT.len() as u64, "[a-zé日🦀]{1,4}").prop_map(|(position, text)| Operation::Insert {
                    position,
                    text,
                }),
                (0u64..CONTENT.len() as u64 - 1, 1u64..6).prop_map(|(position, count)| {
                    let count = count.min(CONTENT.len() as u64 - position);
                    Operation::Delete { position, count: count.max(1) }
                }),
            ]
        }

        proptest! {
            #[test]
            fn tp1_holds_for_arbitrary_operation_pairs(a in arb_op(), b in arb_op()) {
                prop_assert!(converges(CONTENT, a, b, Priority::Left));
            }
        }
    }
}
