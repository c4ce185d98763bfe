//! Text operations: ordered retain/insert/delete component sequences.
//!
//! An [`Operation`] describes an edit as a walk over the base text:
//! `Retain(n)` keeps the next `n` characters, `Delete(n)` removes them,
//! `Insert(text)` adds new text at the current position. The walk must
//! consume the base text exactly — the sum of retained and deleted
//! characters is the operation's *base length*, and applying it to a text
//! of any other length fails with [`OtError::LengthMismatch`].
//!
//! All lengths count Unicode characters (scalar values), never bytes.
//!
//! Operations are immutable values once built. The builder methods merge
//! adjacent components of the same kind and order an insert before an
//! adjacent delete, so two operations describing the same edit always
//! hold the identical component sequence and serialize identically.

use serde::{Deserialize, Serialize};

/// A single operation component. Lengths are character counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpComponent {
    /// Keep the next `n` characters of the base text.
    Retain(usize),
    /// Add literal text at the current position.
    Insert(String),
    /// Remove the next `n` characters of the base text.
    Delete(usize),
}

/// Errors for building, applying, and transforming operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// The operation consumes a different number of characters than the
    /// text it was applied to holds.
    LengthMismatch { expected: usize, actual: usize },
    /// Two operations handed to `transform` were built against texts of
    /// different lengths.
    BaseLengthMismatch { left: usize, right: usize },
    /// A component that does nothing: `Retain(0)`, `Delete(0)`, or an
    /// empty insert.
    EmptyComponent,
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtError::LengthMismatch { expected, actual } => {
                write!(f, "operation consumes {expected} characters but text has {actual}")
            }
            OtError::BaseLengthMismatch { left, right } => {
                write!(f, "operations have different base lengths: {left} vs {right}")
            }
            OtError::EmptyComponent => write!(f, "operation contains an empty component"),
        }
    }
}

impl std::error::Error for OtError {}

/// Number of characters in a string.
pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`-th character boundary in `s`.
fn char_boundary(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}

/// An immutable edit against a text of a fixed length.
///
/// Built either incrementally through [`retain`](Operation::retain) /
/// [`insert`](Operation::insert) / [`delete`](Operation::delete), or from a
/// raw component list via `TryFrom<Vec<OpComponent>>` (which rejects empty
/// components and canonicalizes the rest). Serialization is the flat
/// component list: `[{"retain":5},{"insert":" world"}]` in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<OpComponent>", into = "Vec<OpComponent>")]
pub struct Operation {
    components: Vec<OpComponent>,
    base_len: usize,
    target_len: usize,
}

impl Operation {
    /// An empty operation, valid against the empty text.
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            base_len: 0,
            target_len: 0,
        }
    }

    /// Keep the next `n` characters. Zero is ignored.
    pub fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(OpComponent::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(OpComponent::Retain(n));
        }
    }

    /// Add `text` at the current position. Empty text is ignored.
    pub fn insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.target_len += char_len(text);
        let n = self.components.len();
        if let Some(OpComponent::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
            return;
        }
        if matches!(self.components.last(), Some(OpComponent::Delete(_))) {
            // "delete then insert" and "insert then delete" are the same
            // edit; the canonical order is insert first.
            if n >= 2 {
                if let OpComponent::Insert(prev) = &mut self.components[n - 2] {
                    prev.push_str(text);
                    return;
                }
            }
            self.components.insert(n - 1, OpComponent::Insert(text.to_owned()));
            return;
        }
        self.components.push(OpComponent::Insert(text.to_owned()));
    }

    /// Remove the next `n` characters. Zero is ignored.
    pub fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(OpComponent::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(OpComponent::Delete(n));
        }
    }

    /// Length of the text this operation applies to.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the text this operation produces.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// The canonical component sequence.
    pub fn components(&self) -> &[OpComponent] {
        &self.components
    }

    /// True when applying this operation changes nothing.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, OpComponent::Retain(_)))
    }

    /// Apply this operation to `base`, producing the edited text.
    ///
    /// Fails with [`OtError::LengthMismatch`] iff the operation's base
    /// length differs from the character count of `base`.
    pub fn apply(&self, base: &str) -> Result<String, OtError> {
        let actual = char_len(base);
        if actual != self.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut out = String::with_capacity(base.len());
        let mut rest = base;
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => {
                    let split = char_boundary(rest, *n);
                    out.push_str(&rest[..split]);
                    rest = &rest[split..];
                }
                OpComponent::Insert(text) => out.push_str(text),
                OpComponent::Delete(n) => {
                    rest = &rest[char_boundary(rest, *n)..];
                }
            }
        }
        Ok(out)
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Vec<OpComponent>> for Operation {
    type Error = OtError;

    fn try_from(components: Vec<OpComponent>) -> Result<Self, OtError> {
        let mut op = Operation::new();
        for component in components {
            match component {
                OpComponent::Retain(0) | OpComponent::Delete(0) => {
                    return Err(OtError::EmptyComponent)
                }
                OpComponent::Insert(ref s) if s.is_empty() => {
                    return Err(OtError::EmptyComponent)
                }
                OpComponent::Retain(n) => op.retain(n),
                OpComponent::Insert(s) => op.insert(&s),
                OpComponent::Delete(n) => op.delete(n),
            }
        }
        Ok(op)
    }
}

impl From<Operation> for Vec<OpComponent> {
    fn from(op: Operation) -> Self {
        op.components
    }
}
