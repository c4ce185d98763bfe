//! Rebasing concurrent operations against each other.
//!
//! [`transform`] takes two operations built against the *same* base text
//! and produces counterparts that apply after the other side's edit, such
//! that both application orders converge on the identical result:
//!
//! ```text
//!        base ──a──► A              (a', b') = transform(a, b)
//!        base ──b──► B
//!        A ──b'──► C  and  B ──a'──► C      (same C)
//! ```
//!
//! This module is the single home of conflict-resolution policy. When both
//! operations insert at the same position, the **left** argument's
//! insertion lands first; callers pick the system-wide total order purely
//! by argument position. The document authority orders arguments by stable
//! client-id comparison, so the committed outcome does not depend on which
//! submission happened to arrive first.

use crate::operation::{char_len, OpComponent, Operation, OtError};

/// Width of a retain/delete component; character count of an insert.
fn component_len(c: &OpComponent) -> usize {
    match c {
        OpComponent::Retain(n) | OpComponent::Delete(n) => *n,
        OpComponent::Insert(text) => char_len(text),
    }
}

/// Shorten a retain/delete component by `by` characters.
fn shrink(c: &mut OpComponent, by: usize) {
    if let OpComponent::Retain(n) | OpComponent::Delete(n) = c {
        *n -= by;
    }
}

/// Rebase two concurrent operations against each other.
///
/// Both operations must have been built against the same base text
/// (equal base lengths, else [`OtError::BaseLengthMismatch`]). Returns
/// `(a', b')` with `apply(apply(base, a), b') == apply(apply(base, b), a')`.
///
/// Insertions pass through the other operation untouched, splitting the
/// opposing component where necessary; simultaneous same-position inserts
/// are ordered left argument first.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    if a.base_len() != b.base_len() {
        return Err(OtError::BaseLengthMismatch {
            left: a.base_len(),
            right: b.base_len(),
        });
    }

    let mut a_prime = Operation::new();
    let mut b_prime = Operation::new();

    let mut ops_a = a.components().iter();
    let mut ops_b = b.components().iter();
    let mut cur_a = ops_a.next().cloned();
    let mut cur_b = ops_b.next().cloned();

    loop {
        // Inserts consume no base text and are never split by the other
        // side. The left argument's insert is taken first.
        if let Some(OpComponent::Insert(text)) = &cur_a {
            a_prime.insert(text);
            b_prime.retain(char_len(text));
            cur_a = ops_a.next().cloned();
            continue;
        }
        if let Some(OpComponent::Insert(text)) = &cur_b {
            a_prime.retain(char_len(text));
            b_prime.insert(text);
            cur_b = ops_b.next().cloned();
            continue;
        }

        if cur_a.is_none() && cur_b.is_none() {
            break;
        }
        let (Some(ca), Some(cb)) = (&mut cur_a, &mut cur_b) else {
            // Equal base lengths exhaust together; a one-sided remainder
            // means the pair was not built against the same text.
            return Err(OtError::BaseLengthMismatch {
                left: a.base_len(),
                right: b.base_len(),
            });
        };

        // Both sides now hold a retain or delete; consume the shorter
        // prefix of the base text from each.
        let len_a = component_len(ca);
        let len_b = component_len(cb);
        let n = len_a.min(len_b);

        let a_deletes = matches!(ca, OpComponent::Delete(_));
        let b_deletes = matches!(cb, OpComponent::Delete(_));
        match (a_deletes, b_deletes) {
            (false, false) => {
                a_prime.retain(n);
                b_prime.retain(n);
            }
            // Characters deleted by both sides appear in neither output.
            (true, true) => {}
            (true, false) => a_prime.delete(n),
            (false, true) => b_prime.delete(n),
        }

        if len_a == n {
            cur_a = ops_a.next().cloned();
        } else {
            shrink(ca, n);
        }
        if len_b == n {
            cur_b = ops_b.next().cloned();
        } else if let Some(cb) = cur_b.as_mut() {
            shrink(cb, n);
        }
    }

    Ok((a_prime, b_prime))
}

/// Move a cursor position across an applied operation.
///
/// `index` is a character offset into the operation's base text; the
/// result is the equivalent offset in the produced text. Retained text
/// before the cursor leaves it in place. An insertion strictly before the
/// cursor shifts it right; an insertion exactly at the cursor shifts it
/// only when `is_owner` is set (a caret follows its own typing but stays
/// put in front of someone else's). A deletion overlapping the cursor
/// clamps it to the deletion's start.
pub fn transform_cursor(index: usize, op: &Operation, is_owner: bool) -> usize {
    let mut result = index;
    let mut pos = 0usize; // characters of the base text consumed so far
    for component in op.components() {
        if pos > index {
            break;
        }
        match component {
            OpComponent::Retain(n) => pos += n,
            OpComponent::Insert(text) => {
                if pos < index || (pos == index && is_owner) {
                    result += char_len(text);
                }
            }
            OpComponent::Delete(n) => {
                if index > pos {
                    result -= (*n).min(index - pos);
                }
                pos += n;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn op(build: impl FnOnce(&mut Operation)) -> Operation {
        let mut operation = Operation::new();
        build(&mut operation);
        operation
    }

    /// Assert both application orders converge for a pair over `base`.
    fn assert_converges(base: &str, a: &Operation, b: &Operation) -> String {
        let (a_prime, b_prime) = transform(a, b).unwrap();
        let via_a = b_prime.apply(&a.apply(base).unwrap()).unwrap();
        let via_b = a_prime.apply(&b.apply(base).unwrap()).unwrap();
        assert_eq!(via_a, via_b, "transform of {a:?} / {b:?} over {base:?} diverged");
        via_a
    }

    #[test]
    fn test_transform_requires_equal_base_lengths() {
        let a = op(|o| o.retain(3));
        let b = op(|o| o.retain(5));
        assert_eq!(
            transform(&a, &b),
            Err(OtError::BaseLengthMismatch { left: 3, right: 5 })
        );
    }

    #[test]
    fn test_insert_against_delete() {
        // a appends " world", b deletes "hello": the rebased delete keeps
        // the appended text intact.
        let a = op(|o| {
            o.retain(5);
            o.insert(" world");
        });
        let b = op(|o| o.delete(5));
        let result = assert_converges("hello", &a, &b);
        assert_eq!(result, " world");

        let (_, b_prime) = transform(&a, &b).unwrap();
        assert_eq!(
            b_prime.components(),
            &[OpComponent::Delete(5), OpComponent::Retain(6)]
        );
    }

    #[test]
    fn test_simultaneous_insert_left_argument_first() {
        let a = op(|o| o.insert("A"));
        let b = op(|o| o.insert("B"));

        let (a_prime, b_prime) = transform(&a, &b).unwrap();
        assert_eq!(b_prime.apply(&a.apply("").unwrap()).unwrap(), "AB");
        assert_eq!(a_prime.apply(&b.apply("").unwrap()).unwrap(), "AB");

        // Swapping the arguments swaps the winner, identically on both paths.
        let (b_prime, a_prime) = transform(&b, &a).unwrap();
        assert_eq!(a_prime.apply(&b.apply("").unwrap()).unwrap(), "BA");
        assert_eq!(b_prime.apply(&a.apply("").unwrap()).unwrap(), "BA");
    }

    #[test]
    fn test_simultaneous_insert_mid_document() {
        let a = op(|o| {
            o.retain(2);
            o.insert("xx");
            o.retain(2);
        });
        let b = op(|o| {
            o.retain(2);
            o.insert("yy");
            o.retain(2);
        });
        let result = assert_converges("abcd", &a, &b);
        assert_eq!(result, "abxxyycd");
    }

    #[test]
    fn test_overlapping_deletes() {
        // a deletes chars 1..4, b deletes chars 2..5 of "abcde".
        let a = op(|o| {
            o.retain(1);
            o.delete(3);
            o.retain(1);
        });
        let b = op(|o| {
            o.retain(2);
            o.delete(3);
        });
        let result = assert_converges("abcde", &a, &b);
        assert_eq!(result, "a");
    }

    #[test]
    fn test_delete_across_concurrent_insert() {
        // b deletes a range into which a concurrently inserted text; the
        // insertion survives because inserts are never consumed.
        let a = op(|o| {
            o.retain(2);
            o.insert("XY");
            o.retain(3);
        });
        let b = op(|o| {
            o.retain(1);
            o.delete(3);
            o.retain(1);
        });
        let result = assert_converges("abcde", &a, &b);
        assert_eq!(result, "aXYe");
    }

    #[test]
    fn test_identity_transform() {
        let a = op(|o| o.retain(4));
        let b = op(|o| {
            o.retain(1);
            o.insert("z");
            o.retain(3);
        });
        let result = assert_converges("text", &a, &b);
        assert_eq!(result, "tzext");
    }

    #[test]
    fn test_transform_unicode() {
        let a = op(|o| {
            o.retain(1);
            o.insert("🦀");
            o.retain(1);
        });
        let b = op(|o| {
            o.delete(1);
            o.retain(1);
        });
        let result = assert_converges("éø", &a, &b);
        assert_eq!(result, "🦀ø");
    }

    #[test]
    fn test_cursor_unmoved_by_pure_retain() {
        let o = op(|o| o.retain(10));
        for idx in [0, 3, 10] {
            assert_eq!(transform_cursor(idx, &o, false), idx);
            assert_eq!(transform_cursor(idx, &o, true), idx);
        }
    }

    #[test]
    fn test_cursor_shifts_past_insert_before_it() {
        let o = op(|o| {
            o.retain(2);
            o.insert("abc");
            o.retain(3);
        });
        assert_eq!(transform_cursor(4, &o, false), 7);
    }

    #[test]
    fn test_cursor_at_insert_position_pins_unless_owner() {
        let o = op(|o| {
            o.retain(3);
            o.insert("xy");
            o.retain(2);
        });
        assert_eq!(transform_cursor(3, &o, false), 3);
        assert_eq!(transform_cursor(3, &o, true), 5);
    }

    #[test]
    fn test_cursor_clamps_to_deletion_start() {
        let o = op(|o| {
            o.retain(2);
            o.delete(4);
            o.retain(2);
        });
        // Inside the deleted range.
        assert_eq!(transform_cursor(4, &o, false), 2);
        assert_eq!(transform_cursor(6, &o, false), 2);
        // Past it: shifted left by the deleted width.
        assert_eq!(transform_cursor(8, &o, false), 4);
        // Before it: untouched.
        assert_eq!(transform_cursor(1, &o, false), 1);
    }

    #[test]
    fn test_cursor_mixed_components() {
        let o = op(|o| {
            o.insert("> ");
            o.retain(3);
            o.delete(2);
            o.retain(1);
        });
        // Cursor at 5 (inside the deletion: covers base chars 3..5).
        // Insert before shifts +2, deletion clamps to its start (3) → 5.
        assert_eq!(transform_cursor(5, &o, false), 5);
        // Cursor at 6, past the deletion: +2 -2 = 6.
        assert_eq!(transform_cursor(6, &o, false), 6);
    }

    // Random-operation generation: a move list folded against a fixed
    // base length always yields a valid operation.
    fn build_op(base_len: usize, moves: &[(u8, usize, String)]) -> Operation {
        let mut op = Operation::new();
        let mut remaining = base_len;
        for (kind, n, text) in moves {
            match kind % 3 {
                0 => {
                    let k = (*n).min(remaining);
                    op.retain(k);
                    remaining -= k;
                }
                1 => {
                    let k = (*n).min(remaining);
                    op.delete(k);
                    remaining -= k;
                }
                _ => op.insert(text),
            }
        }
        op.retain(remaining);
        op
    }

    fn arb_moves() -> impl Strategy<Value = Vec<(u8, usize, String)>> {
        prop::collection::vec((any::<u8>(), 1usize..5, "[a-z🦀]{1,4}"), 0..10)
    }

    proptest! {
        #[test]
        fn convergence_property(
            base in "[a-zé ]{0,24}",
            moves_a in arb_moves(),
            moves_b in arb_moves(),
        ) {
            let base_len = base.chars().count();
            let a = build_op(base_len, &moves_a);
            let b = build_op(base_len, &moves_b);

            let (a_prime, b_prime) = transform(&a, &b).unwrap();
            prop_assert_eq!(a_prime.base_len(), b.target_len());
            prop_assert_eq!(b_prime.base_len(), a.target_len());

            let via_a = b_prime.apply(&a.apply(&base).unwrap()).unwrap();
            let via_b = a_prime.apply(&b.apply(&base).unwrap()).unwrap();
            prop_assert_eq!(via_a, via_b);
        }

        #[test]
        fn cursor_stays_within_result(
            base in "[a-z]{0,16}",
            moves in arb_moves(),
            index in 0usize..20,
        ) {
            let base_len = base.chars().count();
            let index = index.min(base_len);
            let op = build_op(base_len, &moves);
            let cursor = transform_cursor(index, &op, false);
            prop_assert!(cursor <= op.target_len());
        }
    }
}
