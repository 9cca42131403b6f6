//! Rebase: transforming changesets past edits they did not know about
//!
//! Changesets are lowered into a retain/insert/delete component sequence
//! spanning the whole document, transformed there, and raised back into
//! absolute-offset operations. Inserts are kept ahead of adjacent deletes
//! so every sequence has exactly one canonical shape.

use std::collections::VecDeque;

use crate::changeset::{Changeset, ClientId, Operation};
use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Retain,
    Insert,
    Delete,
}

impl Component {
    fn head(&self) -> (Kind, usize) {
        match self {
            Self::Retain(n) => (Kind::Retain, *n),
            Self::Insert(text) => (Kind::Insert, text.chars().count()),
            Self::Delete(n) => (Kind::Delete, *n),
        }
    }

    /// Split after `n` units; `n` must be less than the component length
    fn split(self, n: usize) -> (Self, Self) {
        match self {
            Self::Retain(len) => (Self::Retain(n), Self::Retain(len - n)),
            Self::Delete(len) => (Self::Delete(n), Self::Delete(len - n)),
            Self::Insert(mut text) => {
                let at = text
                    .char_indices()
                    .nth(n)
                    .map_or(text.len(), |(idx, _)| idx);
                let rest = text.split_off(at);
                (Self::Insert(text), Self::Insert(rest))
            }
        }
    }
}

/// Cursor over a component list that can hand out partial components
struct Cursor {
    rest: std::vec::IntoIter<Component>,
    current: Option<Component>,
}

impl Cursor {
    fn new(components: Vec<Component>) -> Self {
        let mut rest = components.into_iter();
        let current = rest.next();
        Self { rest, current }
    }

    fn head(&self) -> Option<(Kind, usize)> {
        self.current.as_ref().map(Component::head)
    }

    fn advance(&mut self) -> Option<Component> {
        let next = self.rest.next();
        std::mem::replace(&mut self.current, next)
    }

    fn take(&mut self, n: usize) -> Option<Component> {
        let current = self.current.take()?;
        if n >= current.head().1 {
            self.current = self.rest.next();
            return Some(current);
        }
        let (first, rest) = current.split(n);
        self.current = Some(rest);
        Some(first)
    }
}

/// Component sequence covering a whole document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OpSeq {
    components: Vec<Component>,
    base_len: usize,
    target_len: usize,
}

impl OpSeq {
    fn identity(len: usize) -> Self {
        let mut seq = Self::default();
        seq.retain(len);
        seq
    }

    fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Component::Retain(count)) = self.components.last_mut() {
            *count += n;
        } else {
            self.components.push(Component::Retain(n));
        }
    }

    fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(Component::Delete(count)) = self.components.last_mut() {
            *count += n;
        } else {
            self.components.push(Component::Delete(n));
        }
    }

    fn insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.target_len += text.chars().count();

        let n = self.components.len();
        if let Some(Component::Insert(prev)) = self.components.last_mut() {
            prev.push_str(text);
            return;
        }
        if let Some(Component::Delete(_)) = self.components.last() {
            if n >= 2 {
                if let Component::Insert(prev) = &mut self.components[n - 2] {
                    prev.push_str(text);
                    return;
                }
            }
            self.components.insert(n - 1, Component::Insert(text.to_owned()));
            return;
        }
        self.components.push(Component::Insert(text.to_owned()));
    }

    fn from_operation(op: &Operation, len: usize) -> Result<Self, ProtocolError> {
        op.target_len(len)?;
        let mut seq = Self::default();
        match op {
            Operation::Insert { offset, text } => {
                seq.retain(*offset);
                seq.insert(text);
                seq.retain(len - offset);
            }
            Operation::Delete { offset, len: span } => {
                seq.retain(*offset);
                seq.delete(*span);
                seq.retain(len - offset - span);
            }
        }
        Ok(seq)
    }

    fn from_changeset(changeset: &Changeset, base_len: usize) -> Result<Self, ProtocolError> {
        changeset
            .operations
            .iter()
            .try_fold(Self::identity(base_len), |acc, op| {
                let step = Self::from_operation(op, acc.target_len)?;
                Ok(acc.compose(step))
            })
    }

    fn into_changeset(self, origin_client_id: ClientId) -> Changeset {
        let mut operations = Vec::new();
        let mut pos = 0;
        for component in self.components {
            match component {
                Component::Retain(n) => pos += n,
                Component::Insert(text) => {
                    let len = text.chars().count();
                    operations.push(Operation::Insert { offset: pos, text });
                    pos += len;
                }
                Component::Delete(len) => operations.push(Operation::Delete { offset: pos, len }),
            }
        }
        Changeset::new(origin_client_id, operations)
    }

    /// Sequence equivalent to applying `self` then `other`
    fn compose(self, other: Self) -> Self {
        debug_assert_eq!(self.target_len, other.base_len);

        let mut out = Self::default();
        let mut a = Cursor::new(self.components);
        let mut b = Cursor::new(other.components);

        loop {
            match (a.head(), b.head()) {
                (None, None) => break,
                (Some((Kind::Delete, n)), _) => {
                    a.advance();
                    out.delete(n);
                }
                (_, Some((Kind::Insert, _))) => {
                    if let Some(Component::Insert(text)) = b.advance() {
                        out.insert(&text);
                    }
                }
                (Some((_, la)), Some((_, lb))) => {
                    let n = la.min(lb);
                    match (a.take(n), b.take(n)) {
                        (Some(Component::Retain(_)), Some(Component::Retain(_))) => out.retain(n),
                        (Some(Component::Retain(_)), Some(Component::Delete(_))) => out.delete(n),
                        (Some(Component::Insert(text)), Some(Component::Retain(_))) => {
                            out.insert(&text);
                        }
                        // Inserted by `self`, removed again by `other`
                        (Some(Component::Insert(_)), Some(Component::Delete(_))) => {}
                        _ => unreachable!("deletes in `self` and inserts in `other` are handled above"),
                    }
                }
                (None, Some(_)) | (Some(_), None) => {
                    debug_assert!(false, "compose length mismatch");
                    break;
                }
            }
        }
        out
    }

    /// Transform two sequences over the same base
    ///
    /// Returns `(a', b')` where `a'` applies after `b` and `b'` after `a`.
    /// Inserts of `a` land before inserts of `b` at the same position.
    fn transform(a: Self, b: Self) -> (Self, Self) {
        debug_assert_eq!(a.base_len, b.base_len);

        let mut a_prime = Self::default();
        let mut b_prime = Self::default();
        let mut a = Cursor::new(a.components);
        let mut b = Cursor::new(b.components);

        loop {
            match (a.head(), b.head()) {
                (None, None) => break,
                (Some((Kind::Insert, n)), _) => {
                    if let Some(Component::Insert(text)) = a.advance() {
                        a_prime.insert(&text);
                        b_prime.retain(n);
                    }
                }
                (_, Some((Kind::Insert, n))) => {
                    if let Some(Component::Insert(text)) = b.advance() {
                        a_prime.retain(n);
                        b_prime.insert(&text);
                    }
                }
                (Some((ka, la)), Some((kb, lb))) => {
                    let n = la.min(lb);
                    a.take(n);
                    b.take(n);
                    match (ka, kb) {
                        (Kind::Retain, Kind::Retain) => {
                            a_prime.retain(n);
                            b_prime.retain(n);
                        }
                        (Kind::Delete, Kind::Retain) => a_prime.delete(n),
                        (Kind::Retain, Kind::Delete) => b_prime.delete(n),
                        // Both removed the same text
                        (Kind::Delete, Kind::Delete) => {}
                        _ => unreachable!("inserts are handled above"),
                    }
                }
                (None, Some(_)) | (Some(_), None) => {
                    debug_assert!(false, "transform length mismatch");
                    break;
                }
            }
        }
        (a_prime, b_prime)
    }
}

/// Transform two changesets made against the same `base_len`-char document
///
/// Returns `(priority', other')`: `priority'` applies after `other`, and
/// `other'` after `priority`. Where both insert at one position the text
/// of `priority` comes first.
pub fn transform(
    priority: &Changeset,
    other: &Changeset,
    base_len: usize,
) -> Result<(Changeset, Changeset), ProtocolError> {
    let a = OpSeq::from_changeset(priority, base_len)?;
    let b = OpSeq::from_changeset(other, base_len)?;
    let (a_prime, b_prime) = OpSeq::transform(a, b);
    Ok((
        a_prime.into_changeset(priority.origin_client_id),
        b_prime.into_changeset(other.origin_client_id),
    ))
}

/// Outcome of integrating one authoritative log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrated {
    /// Someone else's entry, rewritten to apply on top of the pending queue
    Remote(Changeset),
    /// The head of the pending queue, now part of the log
    Confirmed(Changeset),
}

/// One client's changesets that the log has not confirmed yet
///
/// `base_len` is the document length at the last integrated log entry;
/// the queued changesets apply one after another on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChanges {
    origin: ClientId,
    base_len: usize,
    tip_len: usize,
    queue: VecDeque<Changeset>,
}

impl PendingChanges {
    pub const fn new(origin: ClientId, base_len: usize) -> Self {
        Self {
            origin,
            base_len,
            tip_len: base_len,
            queue: VecDeque::new(),
        }
    }

    pub const fn origin(&self) -> ClientId {
        self.origin
    }

    /// Length of the last integrated log state
    pub const fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length after every queued changeset
    pub const fn tip_len(&self) -> usize {
        self.tip_len
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn changesets(&self) -> impl ExactSizeIterator<Item = &Changeset> {
        self.queue.iter()
    }

    pub fn into_changesets(self) -> Vec<Changeset> {
        self.queue.into()
    }

    /// Drop everything queued and restart from a document of `base_len`
    pub fn reset(&mut self, base_len: usize) {
        self.queue.clear();
        self.base_len = base_len;
        self.tip_len = base_len;
    }

    /// Queue a changeset made on top of the current tip
    pub fn push(&mut self, changeset: Changeset) -> Result<(), ProtocolError> {
        self.tip_len = changeset.target_len(self.tip_len)?;
        self.queue.push_back(changeset);
        Ok(())
    }

    /// Fold the next log entry (based at `base_len`) into the queue
    ///
    /// On error the queue is left exactly as it was.
    pub fn integrate(&mut self, entry: &Changeset) -> Result<Integrated, ProtocolError> {
        let entry_len = entry.target_len(self.base_len)?;

        if entry.origin_client_id == self.origin {
            if let Some(head) = self.queue.front() {
                if head != entry {
                    return Err(ProtocolError::Diverged {
                        client_id: self.origin.0,
                    });
                }
                self.base_len = entry_len;
                return Ok(Integrated::Confirmed(self.queue.pop_front().unwrap_or_else(
                    || entry.clone(),
                )));
            }
        }

        let mut remote = entry.clone();
        let mut base = self.base_len;
        let mut rebased = VecDeque::with_capacity(self.queue.len());
        for queued in &self.queue {
            let queued_len = queued.target_len(base)?;
            let (remote_prime, queued_prime) = transform(&remote, queued, base)?;
            remote = remote_prime;
            rebased.push_back(queued_prime);
            base = queued_len;
        }
        let tip_len = remote.target_len(base)?;

        self.queue = rebased;
        self.base_len = entry_len;
        self.tip_len = tip_len;
        Ok(Integrated::Remote(remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn apply(text: &str, cs: &Changeset) -> String {
        Document::from(text).apply(cs).unwrap().into_text()
    }

    #[test]
    fn same_offset_inserts_keep_log_entry_first() {
        let first = Changeset::insert(A, 0, "A");
        let second = Changeset::insert(B, 0, "B");
        let (_, rebased) = transform(&first, &second, 0).unwrap();
        assert_eq!(rebased, Changeset::insert(B, 1, "B"));
        assert_eq!(apply(&apply("", &first), &rebased), "AB");
    }

    #[test]
    fn transform_converges_on_overlapping_deletes() {
        let base = "abcdefgh";
        let a = Changeset::delete(A, 1, 4);
        let b = Changeset::delete(B, 3, 4);
        let (a2, b2) = transform(&a, &b, 8).unwrap();
        let left = apply(&apply(base, &a), &b2);
        let right = apply(&apply(base, &b), &a2);
        assert_eq!(left, right);
        assert_eq!(left, "ah");
    }

    #[test]
    fn insert_inside_concurrently_deleted_range_survives() {
        let base = "hello world";
        let del = Changeset::delete(A, 2, 6);
        let ins = Changeset::insert(B, 5, "!!");
        let (del2, ins2) = transform(&del, &ins, 11).unwrap();
        let left = apply(&apply(base, &del), &ins2);
        let right = apply(&apply(base, &ins), &del2);
        assert_eq!(left, right);
        assert!(left.contains("!!"));
    }

    #[test]
    fn multi_operation_changesets_transform() {
        let base = "0123456789";
        let a = Changeset::new(
            A,
            vec![
                Operation::Insert {
                    offset: 2,
                    text: "xx".into(),
                },
                Operation::Delete { offset: 6, len: 3 },
            ],
        );
        let b = Changeset::replace(B, 3, 4, "yyy");
        let (a2, b2) = transform(&a, &b, 10).unwrap();
        assert_eq!(
            apply(&apply(base, &a), &b2),
            apply(&apply(base, &b), &a2)
        );
    }

    #[test]
    fn transform_rejects_out_of_bounds_input() {
        let a = Changeset::insert(A, 0, "x");
        let b = Changeset::delete(B, 0, 5);
        assert!(matches!(
            transform(&a, &b, 2),
            Err(ProtocolError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn canonical_form_puts_insert_before_delete() {
        let cs = Changeset::new(
            A,
            vec![
                Operation::Delete { offset: 0, len: 2 },
                Operation::Insert {
                    offset: 0,
                    text: "z".into(),
                },
            ],
        );
        let seq = OpSeq::from_changeset(&cs, 3).unwrap();
        assert_eq!(
            seq.components,
            vec![
                Component::Insert("z".into()),
                Component::Delete(2),
                Component::Retain(1)
            ]
        );
        let raised = seq.into_changeset(A);
        assert_eq!(apply("abc", &raised), apply("abc", &cs));
    }

    #[test]
    fn pending_confirms_own_entries() {
        let mut pending = PendingChanges::new(A, 0);
        let mine = Changeset::insert(A, 0, "hi");
        pending.push(mine.clone()).unwrap();
        assert_eq!(
            pending.integrate(&mine).unwrap(),
            Integrated::Confirmed(mine)
        );
        assert!(pending.is_empty());
        assert_eq!(pending.base_len(), 2);
    }

    #[test]
    fn pending_rebases_queue_over_remote_entries() {
        let mut pending = PendingChanges::new(A, 3);
        pending.push(Changeset::insert(A, 3, "!")).unwrap();
        pending.push(Changeset::delete(A, 0, 1)).unwrap();

        let remote = Changeset::insert(B, 0, ">>");
        let Integrated::Remote(local_view) = pending.integrate(&remote).unwrap() else {
            panic!("expected remote entry");
        };

        // Local replica: "abc" + "!" - "a" = "bc!"
        assert_eq!(apply("bc!", &local_view), ">>bc!");
        // Authority: "abc" + remote, then the rebased queue
        let mut doc = apply("abc", &remote);
        for cs in pending.changesets() {
            doc = apply(&doc, cs);
        }
        assert_eq!(doc, ">>bc!");
        assert_eq!(pending.base_len(), 5);
        assert_eq!(pending.tip_len(), 5);
    }

    #[test]
    fn failed_integration_leaves_queue_untouched() {
        let mut pending = PendingChanges::new(A, 3);
        pending.push(Changeset::insert(A, 3, "!")).unwrap();
        // Inconsistent with the tip; only reachable by bypassing `push`.
        pending.queue.push_back(Changeset::delete(A, 10, 1));
        let before: Vec<Changeset> = pending.changesets().cloned().collect();

        assert!(matches!(
            pending.integrate(&Changeset::insert(B, 0, ">>")),
            Err(ProtocolError::OutOfBounds { .. })
        ));
        assert_eq!(pending.changesets().cloned().collect::<Vec<_>>(), before);
        assert_eq!(pending.base_len(), 3);
        assert_eq!(pending.tip_len(), 4);
    }

    #[test]
    fn pending_reports_divergence() {
        let mut pending = PendingChanges::new(A, 0);
        pending.push(Changeset::insert(A, 0, "x")).unwrap();
        assert_eq!(
            pending.integrate(&Changeset::insert(A, 0, "y")),
            Err(ProtocolError::Diverged { client_id: 1 })
        );
    }

    #[test]
    fn own_entry_with_empty_queue_is_remote() {
        let mut pending = PendingChanges::new(A, 0);
        let entry = Changeset::insert(A, 0, "x");
        assert_eq!(
            pending.integrate(&entry).unwrap(),
            Integrated::Remote(Changeset::insert(A, 0, "x"))
        );
    }
}
