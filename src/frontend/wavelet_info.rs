//! Per-wavelet synchronization state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::info;

use crate::delta::DeltaSequence;
use crate::version::{HashedVersion, HashedVersionFactory};
use crate::wave::{IdFilter, ParticipantId, WaveId, WaveletId, WaveletName};

use super::{WaveServerError, WaveletProvider};

/// What the frontend holds in memory for one wavelet. All fields live
/// behind the record's own mutex; see [`WaveletInfo`].
#[derive(Debug)]
struct PerWavelet {
    #[allow(dead_code)]
    version0: HashedVersion,
    current_version: HashedVersion,
    explicit_participants: HashSet<ParticipantId>,
    /// Participants who merely opened the wave and listen for updates
    /// without being on the participant list.
    implicit_participants: HashSet<ParticipantId>,
}

impl PerWavelet {
    fn new(version0: HashedVersion) -> Self {
        PerWavelet {
            current_version: version0.clone(),
            version0,
            explicit_participants: HashSet::new(),
            implicit_participants: HashSet::new(),
        }
    }
}

/// Tracks the current hashed version and participant sets of every wavelet
/// the frontend has touched.
///
/// Records are created lazily per (wave, wavelet) pair and live for the
/// process lifetime. The two-level map is only locked long enough to find
/// or insert a record; all state sits behind each record's own mutex, so
/// operations on unrelated wavelets never contend.
pub struct WaveletInfo {
    version_factory: HashedVersionFactory,
    provider: Arc<dyn WaveletProvider>,
    per_wavelet: Mutex<HashMap<WaveId, HashMap<WaveletId, Arc<Mutex<PerWavelet>>>>>,
}

impl WaveletInfo {
    pub fn new(version_factory: HashedVersionFactory, provider: Arc<dyn WaveletProvider>) -> Self {
        WaveletInfo { version_factory, provider, per_wavelet: Mutex::new(HashMap::new()) }
    }

    fn wavelet(&self, name: &WaveletName) -> Arc<Mutex<PerWavelet>> {
        let mut map = self.per_wavelet.lock().unwrap();
        let wave = map.entry(name.wave_id.clone()).or_default();
        wave.entry(name.wavelet_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PerWavelet::new(self.version_factory.version_zero(name))))
            })
            .clone()
    }

    /// Seeds frontend state for a wave from the provider, if this is the
    /// first time the wave is seen.
    pub fn initialise_wave(&self, wave_id: &WaveId) -> Result<(), WaveServerError> {
        {
            let map = self.per_wavelet.lock().unwrap();
            if map.contains_key(wave_id) {
                return Ok(());
            }
        }
        for wavelet_id in self.provider.wavelet_ids(wave_id)? {
            let name = WaveletName::new(wave_id.clone(), wavelet_id);
            let snapshot = self.provider.snapshot(&name)?;
            let record = self.wavelet(&name);
            if let Some(committed) = snapshot {
                let mut record = record.lock().unwrap();
                record.current_version = committed.snapshot.hashed_version().clone();
                record
                    .explicit_participants
                    .extend(committed.snapshot.participants().iter().cloned());
            }
        }
        // An empty wave still gets its entry so we don't re-scan on every
        // open.
        self.per_wavelet.lock().unwrap().entry(wave_id.clone()).or_default();
        Ok(())
    }

    /// The wavelets in a wave this user may see through the given filter.
    pub fn visible_wavelets_for(
        &self,
        wave_id: &WaveId,
        filter: &IdFilter,
        user: &ParticipantId,
    ) -> Result<Vec<WaveletId>, WaveServerError> {
        let candidates: Vec<WaveletId> = {
            let map = self.per_wavelet.lock().unwrap();
            map.get(wave_id).map(|w| w.keys().cloned().collect()).unwrap_or_default()
        };
        let mut visible = Vec::new();
        for wavelet_id in candidates {
            if !filter.includes(&wavelet_id) {
                continue;
            }
            let name = WaveletName::new(wave_id.clone(), wavelet_id.clone());
            if self.provider.check_access_permission(&name, user)? {
                visible.push(wavelet_id);
            }
        }
        visible.sort();
        Ok(visible)
    }

    /// Advances the tracked version across `new_deltas`.
    ///
    /// Panics if the deltas do not start exactly at the tracked current
    /// version: that means a delta was missed or delivered out of order,
    /// and advancing anyway would silently desynchronize every subscriber.
    pub fn sync_wavelet_version(&self, name: &WaveletName, new_deltas: &DeltaSequence) {
        let record = self.wavelet(name);
        let mut record = record.lock().unwrap();
        assert_eq!(
            record.current_version.version,
            new_deltas.start_version(),
            "contiguity violation on {}: expected deltas starting at {}, got {}",
            name,
            record.current_version,
            new_deltas.start_version()
        );
        record.current_version = new_deltas.end_version().clone();
    }

    pub fn current_wavelet_version(&self, name: &WaveletName) -> HashedVersion {
        self.wavelet(name).lock().unwrap().current_version.clone()
    }

    /// The explicit participants, as last observed from applied deltas.
    pub fn wavelet_participants(&self, name: &WaveletName) -> Vec<ParticipantId> {
        let record = self.wavelet(name);
        let record = record.lock().unwrap();
        record.explicit_participants.iter().cloned().collect()
    }

    /// Everyone who should hear about updates: explicit plus implicit
    /// participants.
    pub fn interested_participants(&self, name: &WaveletName) -> Vec<ParticipantId> {
        let record = self.wavelet(name);
        let record = record.lock().unwrap();
        record
            .explicit_participants
            .union(&record.implicit_participants)
            .cloned()
            .collect()
    }

    pub fn notify_added_explicit_participant(&self, name: &WaveletName, participant: &ParticipantId) {
        let record = self.wavelet(name);
        record.lock().unwrap().explicit_participants.insert(participant.clone());
    }

    pub fn notify_removed_explicit_participant(
        &self,
        name: &WaveletName,
        participant: &ParticipantId,
    ) {
        let record = self.wavelet(name);
        record.lock().unwrap().explicit_participants.remove(participant);
    }

    /// Records a participant who opened the wave without being on it.
    pub fn notify_added_implicit_participant(&self, name: &WaveletName, participant: &ParticipantId) {
        let record = self.wavelet(name);
        let mut record = record.lock().unwrap();
        if !record.explicit_participants.contains(participant)
            && record.implicit_participants.insert(participant.clone())
        {
            info!("implicit participant {} now listening on {}", participant, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::test_util::noop_delta;
    use crate::delta::{DeltaSequence, WaveletDelta};
    use crate::frontend::{CommittedWaveletSnapshot, SubmitResult};

    struct NoProvider;

    impl WaveletProvider for NoProvider {
        fn snapshot(
            &self,
            _name: &WaveletName,
        ) -> Result<Option<CommittedWaveletSnapshot>, WaveServerError> {
            Ok(None)
        }
        fn history(
            &self,
            _name: &WaveletName,
            _start: &HashedVersion,
            _end: &HashedVersion,
        ) -> Result<DeltaSequence, WaveServerError> {
            Ok(DeltaSequence::empty())
        }
        fn submit_request(
            &self,
            _name: &WaveletName,
            _delta: WaveletDelta,
        ) -> Result<SubmitResult, String> {
            Err("read-only provider".to_string())
        }
        fn wavelet_ids(&self, _wave_id: &WaveId) -> Result<Vec<WaveletId>, WaveServerError> {
            Ok(Vec::new())
        }
        fn check_access_permission(
            &self,
            _name: &WaveletName,
            _user: &ParticipantId,
        ) -> Result<bool, WaveServerError> {
            Ok(true)
        }
    }

    fn info() -> WaveletInfo {
        WaveletInfo::new(HashedVersionFactory::new(), Arc::new(NoProvider))
    }

    fn name() -> WaveletName {
        WaveletName::new(
            WaveId::new("example.com", "w+abc").unwrap(),
            WaveletId::new("example.com", "conv+root").unwrap(),
        )
    }

    #[test]
    fn version_advances_across_contiguous_deltas() {
        let info = info();
        assert_eq!(info.current_wavelet_version(&name()).version, 0);

        // Wavelet at version 5: advance the record there first.
        info.sync_wavelet_version(&name(), &DeltaSequence::single(noop_delta("a@x.com", 0, 5)));
        assert_eq!(info.current_wavelet_version(&name()).version, 5);

        // delta(start=5, end=6) advances to 6.
        info.sync_wavelet_version(&name(), &DeltaSequence::single(noop_delta("a@x.com", 5, 1)));
        assert_eq!(info.current_wavelet_version(&name()).version, 6);
    }

    #[test]
    #[should_panic(expected = "contiguity violation")]
    fn stale_deltas_are_fatal() {
        let info = info();
        info.sync_wavelet_version(&name(), &DeltaSequence::single(noop_delta("a@x.com", 0, 5)));
        info.sync_wavelet_version(&name(), &DeltaSequence::single(noop_delta("a@x.com", 5, 1)));
        // A second delta claiming to start at 5 is stale and must not be
        // absorbed.
        info.sync_wavelet_version(&name(), &DeltaSequence::single(noop_delta("a@x.com", 5, 1)));
    }

    #[test]
    fn participant_bookkeeping() {
        let info = info();
        let alice = ParticipantId::new("alice@example.com").unwrap();
        let bob = ParticipantId::new("bob@example.com").unwrap();

        info.notify_added_explicit_participant(&name(), &alice);
        info.notify_added_implicit_participant(&name(), &bob);
        // An explicit participant is not demoted to implicit.
        info.notify_added_implicit_participant(&name(), &alice);

        assert_eq!(info.wavelet_participants(&name()), vec![alice.clone()]);
        let mut interested = info.interested_participants(&name());
        interested.sort();
        assert_eq!(interested, vec![alice.clone(), bob]);

        info.notify_removed_explicit_participant(&name(), &alice);
        assert!(info.wavelet_participants(&name()).is_empty());
    }
}
