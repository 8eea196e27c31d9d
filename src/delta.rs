//! Deltas: one author's atomic batch of operations, and contiguous runs of
//! them.
//!
//! A client submits a [`WaveletDelta`] against the version it knows. Once
//! the server accepts it, the ops gain contexts and the delta becomes a
//! [`TransformedWaveletDelta`] spanning two hashed versions. A
//! [`DeltaSequence`] is a run of transformed deltas with no gaps - every
//! constructor checks contiguity, and a violation is a panic, because a gap
//! that went unnoticed would corrupt every history reconstruction built on
//! top.

use std::fmt::{Display, Formatter};

use crate::version::HashedVersion;
use crate::wave::{ParticipantId, WaveletOp, WaveletOperation};
use crate::Timestamp;

/// A client-submitted delta: ops without contexts, targeted at the version
/// the client believes is current.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WaveletDelta {
    pub author: ParticipantId,
    pub target_version: HashedVersion,
    pub ops: Vec<WaveletOp>,
}

impl WaveletDelta {
    pub fn new(author: ParticipantId, target_version: HashedVersion, ops: Vec<WaveletOp>) -> Self {
        WaveletDelta { author, target_version, ops }
    }

    /// Deterministic byte rendering, the input to the history hash chain.
    /// Not a wire format - only the chain and equality tests consume it.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        fn put_str(out: &mut Vec<u8>, s: &str) {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        let mut out = Vec::new();
        put_str(&mut out, self.author.address());
        out.extend_from_slice(&self.target_version.version.to_le_bytes());
        out.extend_from_slice(&self.target_version.history_hash);
        out.extend_from_slice(&(self.ops.len() as u32).to_le_bytes());
        for op in &self.ops {
            match op {
                WaveletOp::AddParticipant(p) => {
                    out.push(0);
                    put_str(&mut out, p.address());
                }
                WaveletOp::RemoveParticipant(p) => {
                    out.push(1);
                    put_str(&mut out, p.address());
                }
                WaveletOp::Blip { blip_id, op } => {
                    out.push(2);
                    put_str(&mut out, blip_id);
                    // The concise form is canonical per component, which is
                    // all the hash needs.
                    put_str(&mut out, &op.to_string());
                }
                WaveletOp::NoOp => out.push(3),
                WaveletOp::VersionUpdate => out.push(4),
            }
        }
        out
    }

    /// Total items this delta's blip ops touch; a cheap size measure for
    /// logging and quota decisions.
    pub fn op_size(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                WaveletOp::Blip { op, .. } => {
                    op.components().map(|c| c.pre_len().max(c.post_len())).sum::<usize>()
                }
                _ => 1,
            })
            .sum()
    }
}

/// A delta the server has accepted: contextualized ops spanning
/// `applied_at` to `resulting`. Immutable once constructed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransformedWaveletDelta {
    pub author: ParticipantId,
    pub applied_at: HashedVersion,
    pub resulting: HashedVersion,
    pub application_timestamp: Timestamp,
    pub ops: Vec<WaveletOperation>,
}

impl TransformedWaveletDelta {
    /// Panics if the version span disagrees with the sum of the ops'
    /// increments; a delta that lies about its span would silently corrupt
    /// the chain.
    pub fn new(
        author: ParticipantId,
        applied_at: HashedVersion,
        resulting: HashedVersion,
        application_timestamp: Timestamp,
        ops: Vec<WaveletOperation>,
    ) -> Self {
        let total: i64 = ops.iter().map(|op| op.context.version_increment).sum();
        assert_eq!(
            applied_at.version.checked_add_signed(total),
            Some(resulting.version),
            "delta version span {} -> {} disagrees with op increments totalling {}",
            applied_at,
            resulting,
            total
        );
        TransformedWaveletDelta { author, applied_at, resulting, application_timestamp, ops }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Display for TransformedWaveletDelta {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "delta by {} [{} -> {}], {} ops",
            self.author,
            self.applied_at,
            self.resulting,
            self.ops.len()
        )
    }
}

/// An ordered, gap-free run of transformed deltas. A pure value: never
/// mutated in place, never observable mid-construction.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DeltaSequence {
    deltas: Vec<TransformedWaveletDelta>,
}

impl DeltaSequence {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Panics unless every adjacent pair is contiguous
    /// (`deltas[i].resulting.version == deltas[i+1].applied_at.version`).
    pub fn of(deltas: Vec<TransformedWaveletDelta>) -> Self {
        for pair in deltas.windows(2) {
            assert_eq!(
                pair[0].resulting.version, pair[1].applied_at.version,
                "non-contiguous deltas: {} followed by {}",
                pair[0], pair[1]
            );
        }
        DeltaSequence { deltas }
    }

    pub fn single(delta: TransformedWaveletDelta) -> Self {
        DeltaSequence { deltas: vec![delta] }
    }

    /// Panics unless `a` ends exactly where `b` starts. Either side may be
    /// empty, in which case the other is returned unchanged.
    pub fn join(a: DeltaSequence, b: DeltaSequence) -> DeltaSequence {
        if a.is_empty() {
            return b;
        }
        if b.is_empty() {
            return a;
        }
        assert_eq!(
            a.end_version().version,
            b.start_version(),
            "cannot join delta sequences: first ends at {}, second starts at {}",
            a.end_version(),
            b.start_version()
        );
        let mut deltas = a.deltas;
        deltas.extend(b.deltas);
        DeltaSequence { deltas }
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn get(&self, i: usize) -> &TransformedWaveletDelta {
        &self.deltas[i]
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TransformedWaveletDelta> {
        self.deltas.iter()
    }

    /// Version the first delta applies at. Panics on an empty sequence.
    pub fn start_version(&self) -> u64 {
        self.deltas.first().expect("empty delta sequence has no start version").applied_at.version
    }

    /// Hashed version after the last delta. Panics on an empty sequence.
    pub fn end_version(&self) -> &HashedVersion {
        &self.deltas.last().expect("empty delta sequence has no end version").resulting
    }

    /// The leading run of `n` deltas (used to scope fan-out to participants
    /// removed partway through a sequence).
    pub fn prefix(&self, n: usize) -> DeltaSequence {
        DeltaSequence { deltas: self.deltas[..n].to_vec() }
    }
}

impl<'a> IntoIterator for &'a DeltaSequence {
    type Item = &'a TransformedWaveletDelta;
    type IntoIter = std::slice::Iter<'a, TransformedWaveletDelta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.iter()
    }
}

impl Display for DeltaSequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "[no deltas]")
        } else {
            write!(
                f,
                "[{} deltas, {} -> {}]",
                self.len(),
                self.start_version(),
                self.end_version()
            )
        }
    }
}
