//! Wavelet operations: the closed set of things a delta can do to a
//! wavelet, each carried with its application context.

use std::fmt::{Display, Formatter};

use smartstring::alias::String as SmartString;

use crate::doc::OpError;
use crate::docop::{invert, DocOp};
use crate::version::HashedVersion;
use crate::Timestamp;

use super::data::WaveletData;
use super::ids::ParticipantId;

/// Metadata attached to one applied operation: who, when, and how the
/// wavelet version moved. Created once per application and never mutated.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WaveletOperationContext {
    pub creator: ParticipantId,
    pub timestamp: Timestamp,
    pub version_increment: i64,
    /// The hashed version after this op. Only the closing op of a delta
    /// carries one; intermediate versions have no hash of their own.
    pub hashed_version: Option<HashedVersion>,
}

impl WaveletOperationContext {
    pub fn new(
        creator: ParticipantId,
        timestamp: Timestamp,
        version_increment: i64,
        hashed_version: Option<HashedVersion>,
    ) -> Self {
        WaveletOperationContext { creator, timestamp, version_increment, hashed_version }
    }
}

/// The payload of a wavelet operation, without context. This is the form
/// clients submit; the server attaches contexts when it transforms a delta.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WaveletOp {
    AddParticipant(ParticipantId),
    RemoveParticipant(ParticipantId),
    /// Applies a document operation to the named blip.
    Blip { blip_id: SmartString, op: DocOp },
    NoOp,
    /// Advances the version without touching state. Used by the server to
    /// reconcile version skew; never submitted by clients and not
    /// invertible.
    VersionUpdate,
}

impl Display for WaveletOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WaveletOp::AddParticipant(p) => write!(f, "addParticipant({})", p),
            WaveletOp::RemoveParticipant(p) => write!(f, "removeParticipant({})", p),
            WaveletOp::Blip { blip_id, op } => write!(f, "blip({}, {})", blip_id, op),
            WaveletOp::NoOp => write!(f, "noOp()"),
            WaveletOp::VersionUpdate => write!(f, "versionUpdate()"),
        }
    }
}

/// A failure to apply a wavelet operation to a particular snapshot.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WaveletOpError {
    ParticipantAlreadyPresent(ParticipantId),
    ParticipantNotPresent(ParticipantId),
    Doc(OpError),
}

impl Display for WaveletOpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WaveletOpError::ParticipantAlreadyPresent(p) => {
                write!(f, "participant {} is already on the wavelet", p)
            }
            WaveletOpError::ParticipantNotPresent(p) => {
                write!(f, "participant {} is not on the wavelet", p)
            }
            WaveletOpError::Doc(e) => write!(f, "blip op failed: {}", e),
        }
    }
}

impl std::error::Error for WaveletOpError {}

impl From<OpError> for WaveletOpError {
    fn from(e: OpError) -> Self {
        WaveletOpError::Doc(e)
    }
}

/// A contextualized operation, as stored in transformed deltas.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WaveletOperation {
    pub context: WaveletOperationContext,
    pub op: WaveletOp,
}

impl WaveletOperation {
    pub fn new(context: WaveletOperationContext, op: WaveletOp) -> Self {
        WaveletOperation { context, op }
    }

    /// Applies the operation to a snapshot, advancing its version metadata.
    ///
    /// On error no document content or participant state has changed, but a
    /// failed blip op may have left an empty blip record behind. Callers
    /// needing strict atomicity (the server does) apply to a copy and
    /// discard it on failure.
    pub fn apply(&self, wavelet: &mut WaveletData) -> Result<(), WaveletOpError> {
        match &self.op {
            WaveletOp::AddParticipant(p) => {
                if !wavelet.add_participant(p) {
                    return Err(WaveletOpError::ParticipantAlreadyPresent(p.clone()));
                }
            }
            WaveletOp::RemoveParticipant(p) => {
                if !wavelet.remove_participant(p) {
                    return Err(WaveletOpError::ParticipantNotPresent(p.clone()));
                }
            }
            WaveletOp::Blip { blip_id, op } => {
                let timestamp = self.context.timestamp;
                let modified_version =
                    wavelet.version().saturating_add_signed(self.context.version_increment);
                let blip = wavelet.blip_for_update(blip_id, &self.context.creator, timestamp);
                blip.content.apply(op)?;
                blip.last_modified_time = timestamp;
                blip.last_modified_version = modified_version;
            }
            WaveletOp::NoOp | WaveletOp::VersionUpdate => {}
        }
        wavelet.update_version(
            self.context.version_increment,
            self.context.hashed_version.as_ref(),
            self.context.timestamp,
        );
        Ok(())
    }

    /// The operation that undoes this one.
    ///
    /// The produced context negates the version increment but deliberately
    /// reuses the forward operation's timestamp and reports the hashed
    /// version of the state *after* the forward op. It is consistent with
    /// neither its own resulting version nor its own time; rollback
    /// consumers must count version decrements and ignore the hash field.
    ///
    /// Panics on [`WaveletOp::VersionUpdate`]: there is nothing meaningful
    /// to restore a version update to.
    pub fn inverted(&self) -> WaveletOperation {
        let context = WaveletOperationContext {
            creator: self.context.creator.clone(),
            timestamp: self.context.timestamp,
            version_increment: -self.context.version_increment,
            hashed_version: self.context.hashed_version.clone(),
        };
        let op = match &self.op {
            WaveletOp::AddParticipant(p) => WaveletOp::RemoveParticipant(p.clone()),
            WaveletOp::RemoveParticipant(p) => WaveletOp::AddParticipant(p.clone()),
            WaveletOp::Blip { blip_id, op } => {
                WaveletOp::Blip { blip_id: blip_id.clone(), op: invert(op) }
            }
            WaveletOp::NoOp => WaveletOp::NoOp,
            WaveletOp::VersionUpdate => panic!("version update operations cannot be inverted"),
        };
        WaveletOperation { context, op }
    }
}
