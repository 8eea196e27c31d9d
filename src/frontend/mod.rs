//! The server-facing client synchronization contract and its state.
//!
//! Two RPCs define the boundary: `submit_request` takes a client delta and
//! returns how the wavelet advanced; `open_request` subscribes a client to
//! a wave and streams ordered, contiguous updates - snapshots or delta runs
//! - relative to what the client already knows, with a marker once it is
//! caught up. Behind the contract sit [`WaveletInfo`] (per-wavelet version
//! and participant state, with a fatal contiguity assertion on every
//! advance) and [`UserManager`] (per-user subscription fan-out).

mod frontend_impl;
mod user_manager;
mod wavelet_info;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub use frontend_impl::ClientFrontendImpl;
pub use user_manager::{UserManager, WaveViewSubscription};
pub use wavelet_info::WaveletInfo;

use crate::delta::{DeltaSequence, WaveletDelta};
use crate::version::HashedVersion;
use crate::wave::{IdFilter, ParticipantId, WaveId, WaveletData, WaveletId, WaveletName};
use crate::Timestamp;

/// A snapshot plus the version up to which the wavelet's history is known
/// durable.
#[derive(Debug, Clone)]
pub struct CommittedWaveletSnapshot {
    pub snapshot: WaveletData,
    pub committed_version: HashedVersion,
}

/// What a successful submit did to the wavelet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubmitResult {
    pub operations_applied: usize,
    pub hashed_version_after_application: HashedVersion,
    pub application_timestamp: Timestamp,
}

/// An internal wave-server failure (storage, lookup). Distinct from the
/// error strings handed to clients, which are deliberately opaque.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WaveServerError(pub String);

impl Display for WaveServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "wave server error: {}", self.0)
    }
}

impl std::error::Error for WaveServerError {}

/// The storage/application collaborator the frontend consumes. Concurrent
/// delta *transformation* happens behind this boundary (or not at all, in
/// which case stale submits are simply rejected).
pub trait WaveletProvider: Send + Sync {
    /// The latest snapshot, or `None` for a wavelet that doesn't exist.
    fn snapshot(&self, name: &WaveletName) -> Result<Option<CommittedWaveletSnapshot>, WaveServerError>;

    /// The contiguous delta run `start..end`. Fails if either endpoint does
    /// not lie on the stored chain (wrong version or wrong hash); the caller
    /// falls back to sending a snapshot.
    fn history(
        &self,
        name: &WaveletName,
        start: &HashedVersion,
        end: &HashedVersion,
    ) -> Result<DeltaSequence, WaveServerError>;

    /// Validates, applies and commits a client delta. The error string goes
    /// back to the submitting client verbatim.
    fn submit_request(&self, name: &WaveletName, delta: WaveletDelta) -> Result<SubmitResult, String>;

    fn wavelet_ids(&self, wave_id: &WaveId) -> Result<Vec<WaveletId>, WaveServerError>;

    fn check_access_permission(
        &self,
        name: &WaveletName,
        user: &ParticipantId,
    ) -> Result<bool, WaveServerError>;
}

/// Receives the update stream of an open wave view.
///
/// Contract: `channel_id` is present in the very first message only; a
/// `marker` of `true` means "you are now caught up"; deltas within one call
/// are contiguous, and successive calls for one wavelet are contiguous with
/// each other.
pub trait OpenListener: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn on_update(
        &self,
        wavelet_name: &WaveletName,
        snapshot: Option<&CommittedWaveletSnapshot>,
        deltas: &DeltaSequence,
        committed_version: Option<&HashedVersion>,
        marker: bool,
        channel_id: Option<&str>,
    );

    fn on_failure(&self, error: &str);
}

/// The client synchronization protocol.
pub trait ClientFrontend {
    /// Opens a wave view: subscribes the listener and streams the initial
    /// state (snapshots or catch-up deltas per visible wavelet, then the
    /// caught-up marker).
    fn open_request(
        &self,
        user: &ParticipantId,
        wave_id: &WaveId,
        wavelet_filter: &IdFilter,
        known_wavelets: &[(WaveletId, HashedVersion)],
        listener: Arc<dyn OpenListener>,
    );

    /// Submits a delta on an open channel.
    fn submit_request(
        &self,
        user: &ParticipantId,
        wavelet_name: &WaveletName,
        delta: WaveletDelta,
        channel_id: &str,
    ) -> Result<SubmitResult, String>;
}
