//! Operational transformation for plain-text documents.
//!
//! An edit is a [`TextOperation`]: an ordered list of retain/insert/delete
//! components that walks the entire document it was generated against.
//! Offsets and lengths count Unicode scalar values, never bytes.
//!
//! Concurrent edits are reconciled with [`TextOperation::transform`], which
//! satisfies `apply(apply(s, a), b') == apply(apply(s, b), a')`. Inserts at
//! the same position are ordered by author id so every replica breaks ties
//! the same way regardless of the order in which edits arrive.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ParticipantId;

/// Errors raised by the transform engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("Base length mismatch: operation expects {expected} chars, document has {actual}")]
    BaseLengthMismatch { expected: usize, actual: usize },

    #[error("Offset {offset} out of range for document of length {len}")]
    OutOfRange { offset: usize, len: usize },

    #[error("Operations are not composable: first produces {first_target} chars, second expects {second_base}")]
    NotComposable {
        first_target: usize,
        second_base: usize,
    },

    #[error("Operations are not concurrent: base lengths {0} and {1} differ")]
    NotConcurrent(usize, usize),
}

/// A single step of a text operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    /// Skip over `n` characters
    Retain(usize),
    /// Insert text at the current position
    Insert(String),
    /// Remove `n` characters at the current position
    Delete(usize),
}

/// A normalized sequence of components over a document of `base_len` chars.
///
/// Adjacent components of the same kind are merged, empty components are
/// dropped, and an insert directly following a delete is moved in front of
/// it, so equal edits always have equal representations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Component>", into = "Vec<Component>")]
pub struct TextOperation {
    components: Vec<Component>,
    base_len: usize,
    target_len: usize,
}

impl From<Vec<Component>> for TextOperation {
    fn from(components: Vec<Component>) -> Self {
        let mut op = TextOperation::new();
        for component in components {
            op.push(component);
        }
        op
    }
}

impl From<TextOperation> for Vec<Component> {
    fn from(op: TextOperation) -> Self {
        op.components
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Continue with the rest of a partially consumed component, or the next one.
fn remainder<I>(len: usize, used: usize, rebuild: fn(usize) -> Component, iter: &mut I) -> Option<Component>
where
    I: Iterator<Item = Component>,
{
    if len > used {
        Some(rebuild(len - used))
    } else {
        iter.next()
    }
}

impl TextOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an operation inserting `text` at `offset` in a document of `doc_len` chars.
    pub fn insert_at(doc_len: usize, offset: usize, text: &str) -> Result<Self, OperationError> {
        if offset > doc_len {
            return Err(OperationError::OutOfRange { offset, len: doc_len });
        }
        let mut op = Self::new();
        op.retain(offset).insert(text).retain(doc_len - offset);
        Ok(op)
    }

    /// Build an operation deleting `len` chars starting at `offset`.
    pub fn delete_at(doc_len: usize, offset: usize, len: usize) -> Result<Self, OperationError> {
        Self::replace_at(doc_len, offset, len, "")
    }

    /// Build an operation replacing `len` chars at `offset` with `text`.
    pub fn replace_at(doc_len: usize, offset: usize, len: usize, text: &str) -> Result<Self, OperationError> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= doc_len)
            .ok_or(OperationError::OutOfRange {
                offset: offset.saturating_add(len),
                len: doc_len,
            })?;
        let mut op = Self::new();
        op.retain(offset).insert(text).delete(len).retain(doc_len - end);
        Ok(op)
    }

    /// Skip `n` characters
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Retain(n));
        }
        self
    }

    /// Insert `text` at the current position
    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        self.target_len += char_len(text);
        if let Some(Component::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
            return self;
        }
        if matches!(self.components.last(), Some(Component::Delete(_))) {
            let idx = self.components.len() - 1;
            if let Some(Component::Insert(before)) = idx.checked_sub(1).and_then(|i| self.components.get_mut(i)) {
                before.push_str(text);
            } else {
                self.components.insert(idx, Component::Insert(text.to_string()));
            }
            return self;
        }
        self.components.push(Component::Insert(text.to_string()));
        self
    }

    /// Remove `n` characters at the current position
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Delete(n));
        }
        self
    }

    fn push(&mut self, component: Component) -> &mut Self {
        match component {
            Component::Retain(n) => self.retain(n),
            Component::Insert(text) => self.insert(&text),
            Component::Delete(n) => self.delete(n),
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Length of the document this operation applies to
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the document after applying this operation
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// An operation that leaves every document unchanged
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Apply this operation to `text`.
    pub fn apply(&self, text: &str) -> Result<String, OperationError> {
        let actual = char_len(text);
        if actual != self.base_len {
            return Err(OperationError::BaseLengthMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut chars = text.chars();
        let mut out = String::with_capacity(text.len());
        for component in &self.components {
            match component {
                Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Component::Insert(s) => out.push_str(s),
                Component::Delete(n) => {
                    chars.by_ref().take(*n).for_each(drop);
                }
            }
        }
        Ok(out)
    }

    /// Merge `self` followed by `next` into one operation.
    pub fn compose(&self, next: &TextOperation) -> Result<TextOperation, OperationError> {
        if self.target_len != next.base_len {
            return Err(OperationError::NotComposable {
                first_target: self.target_len,
                second_base: next.base_len,
            });
        }

        let mut result = TextOperation::new();
        let mut first = self.components.iter().cloned();
        let mut second = next.components.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Component::Delete(n)), b_cur) => {
                    result.delete(n);
                    a = first.next();
                    b = b_cur;
                }
                (a_cur, Some(Component::Insert(text))) => {
                    result.insert(&text);
                    a = a_cur;
                    b = second.next();
                }
                (None, _) | (_, None) => {
                    return Err(OperationError::NotComposable {
                        first_target: self.target_len,
                        second_base: next.base_len,
                    });
                }
                (Some(Component::Retain(x)), Some(Component::Retain(y))) => {
                    let n = x.min(y);
                    result.retain(n);
                    a = remainder(x, n, Component::Retain, &mut first);
                    b = remainder(y, n, Component::Retain, &mut second);
                }
                (Some(Component::Insert(text)), Some(Component::Delete(y))) => {
                    let len = char_len(&text);
                    let n = len.min(y);
                    a = if len > n {
                        Some(Component::Insert(text.chars().skip(n).collect()))
                    } else {
                        first.next()
                    };
                    b = remainder(y, n, Component::Delete, &mut second);
                }
                (Some(Component::Insert(text)), Some(Component::Retain(y))) => {
                    let len = char_len(&text);
                    let n = len.min(y);
                    let kept: String = text.chars().take(n).collect();
                    result.insert(&kept);
                    a = if len > n {
                        Some(Component::Insert(text.chars().skip(n).collect()))
                    } else {
                        first.next()
                    };
                    b = remainder(y, n, Component::Retain, &mut second);
                }
                (Some(Component::Retain(x)), Some(Component::Delete(y))) => {
                    let n = x.min(y);
                    result.delete(n);
                    a = remainder(x, n, Component::Retain, &mut first);
                    b = remainder(y, n, Component::Delete, &mut second);
                }
            }
        }

        Ok(result)
    }

    /// Transform two concurrent operations against each other.
    ///
    /// Returns `(a', b')` such that applying `a` then `b'` yields the same
    /// document as applying `b` then `a'`. `a_first` decides which insert is
    /// placed first when both insert at the same position.
    pub fn transform(
        a: &TextOperation,
        b: &TextOperation,
        a_first: bool,
    ) -> Result<(TextOperation, TextOperation), OperationError> {
        if a.base_len != b.base_len {
            return Err(OperationError::NotConcurrent(a.base_len, b.base_len));
        }

        let mut a_prime = TextOperation::new();
        let mut b_prime = TextOperation::new();
        let mut a_iter = a.components.iter().cloned();
        let mut b_iter = b.components.iter().cloned();
        let mut x = a_iter.next();
        let mut y = b_iter.next();

        loop {
            match (x.take(), y.take()) {
                (None, None) => break,
                (Some(Component::Insert(text)), y_cur)
                    if a_first || !matches!(y_cur, Some(Component::Insert(_))) =>
                {
                    a_prime.insert(&text);
                    b_prime.retain(char_len(&text));
                    x = a_iter.next();
                    y = y_cur;
                }
                (x_cur, Some(Component::Insert(text))) => {
                    a_prime.retain(char_len(&text));
                    b_prime.insert(&text);
                    x = x_cur;
                    y = b_iter.next();
                }
                (None, _) | (_, None) | (Some(Component::Insert(_)), _) => {
                    return Err(OperationError::NotConcurrent(a.base_len, b.base_len));
                }
                (Some(Component::Retain(m)), Some(Component::Retain(n))) => {
                    let k = m.min(n);
                    a_prime.retain(k);
                    b_prime.retain(k);
                    x = remainder(m, k, Component::Retain, &mut a_iter);
                    y = remainder(n, k, Component::Retain, &mut b_iter);
                }
                (Some(Component::Delete(m)), Some(Component::Delete(n))) => {
                    // Both sides removed the same range: nothing left to do for it.
                    let k = m.min(n);
                    x = remainder(m, k, Component::Delete, &mut a_iter);
                    y = remainder(n, k, Component::Delete, &mut b_iter);
                }
                (Some(Component::Delete(m)), Some(Component::Retain(n))) => {
                    let k = m.min(n);
                    a_prime.delete(k);
                    x = remainder(m, k, Component::Delete, &mut a_iter);
                    y = remainder(n, k, Component::Retain, &mut b_iter);
                }
                (Some(Component::Retain(m)), Some(Component::Delete(n))) => {
                    let k = m.min(n);
                    b_prime.delete(k);
                    x = remainder(m, k, Component::Retain, &mut a_iter);
                    y = remainder(n, k, Component::Delete, &mut b_iter);
                }
            }
        }

        Ok((a_prime, b_prime))
    }
}

/// An edit submitted by a client against a known document version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Version of the document the client had when it generated this edit
    pub base_version: u64,
    /// The edit itself
    pub payload: TextOperation,
    /// Participant that authored the edit
    pub author_id: ParticipantId,
    /// Per-author sequence number used for de-duplication
    pub client_seq: u64,
}

impl Operation {
    pub fn new(
        author_id: impl Into<String>,
        client_seq: u64,
        base_version: u64,
        payload: TextOperation,
    ) -> Self {
        Self {
            base_version,
            payload,
            author_id: author_id.into(),
            client_seq,
        }
    }

    /// Whether this edit's inserts go first when colliding with `other_author`'s.
    pub fn has_priority_over(&self, other_author: &str) -> bool {
        self.author_id.as_str() < other_author
    }

    /// Rebase this edit onto an operation committed after its base version.
    pub fn rebase_onto(&self, committed: &CommittedOperation) -> Result<Operation, OperationError> {
        let (payload, _) = TextOperation::transform(
            &self.payload,
            &committed.operation.payload,
            self.has_priority_over(&committed.operation.author_id),
        )?;
        Ok(Operation {
            base_version: committed.version,
            payload,
            author_id: self.author_id.clone(),
            client_seq: self.client_seq,
        })
    }
}

/// An accepted operation together with the version it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedOperation {
    pub version: u64,
    pub operation: Operation,
}

/// Rebase `operation` over every operation committed since its base version.
///
/// `concurrent` must be in commit order. The result is valid against the
/// version produced by the last entry.
pub fn rebase(operation: &Operation, concurrent: &[CommittedOperation]) -> Result<Operation, OperationError> {
    concurrent
        .iter()
        .filter(|c| c.version > operation.base_version)
        .try_fold(operation.clone(), |op, committed| op.rebase_onto(committed))
}
