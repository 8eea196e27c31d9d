//! An in-memory wave server: the [`WaveletProvider`] the frontend consumes.
//!
//! Each wavelet lives behind its own lock and advances through a strictly
//! ordered, hash-chained history. Submits are validated (author membership,
//! head version, schema conformance of every blip op), applied to a copy of
//! the snapshot, and committed atomically; accepted deltas fan out to wave
//! bus subscribers after the wavelet lock is released.
//!
//! Concurrent-delta *transformation* is not implemented here: a delta that
//! targets anything but the current head is rejected with an error string,
//! and the client resubmits against the new head. Persistence is likewise
//! out of scope - "committed" means applied in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::delta::{DeltaSequence, TransformedWaveletDelta, WaveletDelta};
use crate::docop::{validate, DocumentSchema};
use crate::doc::Document;
use crate::frontend::{CommittedWaveletSnapshot, SubmitResult, WaveServerError, WaveletProvider};
use crate::version::{HashedVersion, HashedVersionFactory};
use crate::wave::{
    ParticipantId, WaveId, WaveletData, WaveletId, WaveletName, WaveletOp, WaveletOperation,
    WaveletOperationContext,
};
use crate::Timestamp;

/// Time source, threaded in explicitly so tests can pin it.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// Receives accepted deltas and commit notices, in order, per wavelet.
pub trait WaveBusSubscriber: Send + Sync {
    fn wavelet_update(&self, wavelet: &WaveletData, deltas: &DeltaSequence);
    fn wavelet_committed(&self, name: &WaveletName, version: &HashedVersion);
}

struct WaveletContainer {
    wavelet: WaveletData,
    history: Vec<TransformedWaveletDelta>,
    committed_version: HashedVersion,
}

/// The server. One lock per wavelet container; the wave map lock is held
/// only to find or create containers, so traffic on unrelated wavelets
/// never contends.
pub struct WaveServer {
    schema: Box<dyn DocumentSchema + Send + Sync>,
    version_factory: HashedVersionFactory,
    clock: Box<dyn Clock>,
    waves: Mutex<HashMap<WaveId, HashMap<WaveletId, Arc<Mutex<WaveletContainer>>>>>,
    subscribers: Mutex<Vec<Arc<dyn WaveBusSubscriber>>>,
}

impl WaveServer {
    pub fn new(schema: Box<dyn DocumentSchema + Send + Sync>, clock: Box<dyn Clock>) -> Self {
        WaveServer {
            schema,
            version_factory: HashedVersionFactory::new(),
            clock,
            waves: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn version_factory(&self) -> &HashedVersionFactory {
        &self.version_factory
    }

    pub fn subscribe(&self, subscriber: Arc<dyn WaveBusSubscriber>) {
        self.subscribers.lock().unwrap().push(subscriber);
    }

    fn container(&self, name: &WaveletName) -> Option<Arc<Mutex<WaveletContainer>>> {
        let waves = self.waves.lock().unwrap();
        waves.get(&name.wave_id).and_then(|w| w.get(&name.wavelet_id)).cloned()
    }

    /// Finds the container, creating an empty wavelet when the submitted
    /// delta legitimately starts a new one (target version 0).
    fn container_for_submit(
        &self,
        name: &WaveletName,
        delta: &WaveletDelta,
        timestamp: Timestamp,
    ) -> Result<Arc<Mutex<WaveletContainer>>, String> {
        let mut waves = self.waves.lock().unwrap();
        let wave = waves.entry(name.wave_id.clone()).or_default();
        if let Some(container) = wave.get(&name.wavelet_id) {
            return Ok(container.clone());
        }
        if delta.target_version.version != 0 {
            return Err(format!("wavelet {} does not exist", name));
        }
        let version_zero = self.version_factory.version_zero(name);
        info!("creating wavelet {} for {}", name, delta.author);
        let container = Arc::new(Mutex::new(WaveletContainer {
            wavelet: WaveletData::new(
                name.clone(),
                delta.author.clone(),
                timestamp,
                version_zero.clone(),
            ),
            history: Vec::new(),
            committed_version: version_zero,
        }));
        wave.insert(name.wavelet_id.clone(), container.clone());
        Ok(container)
    }

    fn check_delta(
        &self,
        container: &WaveletContainer,
        delta: &WaveletDelta,
    ) -> Result<(), String> {
        let wavelet = &container.wavelet;
        if !delta.target_version.matches(wavelet.hashed_version()) {
            return Err(format!(
                "delta targets version {}, wavelet {} is at {}",
                delta.target_version,
                wavelet.name(),
                wavelet.hashed_version()
            ));
        }
        if wavelet.version() == 0 {
            // A fresh wavelet: the first op must put the creator on it.
            match delta.ops.first() {
                Some(WaveletOp::AddParticipant(p)) if p == &delta.author => {}
                _ => {
                    return Err(
                        "first delta of a new wavelet must begin by adding its creator".to_string()
                    )
                }
            }
        } else if !wavelet.has_participant(&delta.author) {
            return Err(format!("{} is not a participant of {}", delta.author, wavelet.name()));
        }
        for op in &delta.ops {
            if let WaveletOp::Blip { blip_id, op } = op {
                let empty = Document::new();
                let doc = wavelet.blip(blip_id).map(|b| &b.content).unwrap_or(&empty);
                let (result, violations) = validate(op, doc, self.schema.as_ref());
                if !result.is_valid() {
                    return Err(format!(
                        "invalid operation on blip {}: {}",
                        blip_id,
                        violations.first_description().unwrap_or("unspecified violation")
                    ));
                }
            }
        }
        Ok(())
    }
}

impl WaveletProvider for WaveServer {
    fn snapshot(
        &self,
        name: &WaveletName,
    ) -> Result<Option<CommittedWaveletSnapshot>, WaveServerError> {
        Ok(self.container(name).map(|c| {
            let container = c.lock().unwrap();
            CommittedWaveletSnapshot {
                snapshot: container.wavelet.clone(),
                committed_version: container.committed_version.clone(),
            }
        }))
    }

    fn history(
        &self,
        name: &WaveletName,
        start: &HashedVersion,
        end: &HashedVersion,
    ) -> Result<DeltaSequence, WaveServerError> {
        let container = self
            .container(name)
            .ok_or_else(|| WaveServerError(format!("unknown wavelet {}", name)))?;
        let container = container.lock().unwrap();
        if start.version == end.version {
            return Ok(DeltaSequence::empty());
        }
        let deltas: Vec<TransformedWaveletDelta> = container
            .history
            .iter()
            .filter(|d| d.applied_at.version >= start.version && d.resulting.version <= end.version)
            .cloned()
            .collect();
        match deltas.first() {
            Some(first) if start.matches(&first.applied_at) => {}
            _ => {
                return Err(WaveServerError(format!(
                    "version {} does not lie on the history of {}",
                    start, name
                )))
            }
        }
        match deltas.last() {
            Some(last) if end.matches(&last.resulting) => {}
            _ => {
                return Err(WaveServerError(format!(
                    "version {} does not lie on the history of {}",
                    end, name
                )))
            }
        }
        Ok(DeltaSequence::of(deltas))
    }

    fn submit_request(
        &self,
        name: &WaveletName,
        delta: WaveletDelta,
    ) -> Result<SubmitResult, String> {
        if delta.ops.is_empty() {
            return Err("empty delta".to_string());
        }
        let timestamp = self.clock.now_millis();
        let container = self.container_for_submit(name, &delta, timestamp)?;

        let (updated_wavelet, transformed) = {
            let mut container = container.lock().unwrap();
            self.check_delta(&container, &delta)?;

            let applied_at = container.wavelet.hashed_version().clone();
            let resulting = self.version_factory.next(
                &applied_at,
                &delta.canonical_bytes(),
                delta.ops.len(),
            );

            let op_count = delta.ops.len();
            let ops: Vec<WaveletOperation> = delta
                .ops
                .iter()
                .enumerate()
                .map(|(i, op)| {
                    // Only the delta's closing op carries the resulting hash.
                    let hashed = (i == op_count - 1).then(|| resulting.clone());
                    WaveletOperation::new(
                        WaveletOperationContext::new(delta.author.clone(), timestamp, 1, hashed),
                        op.clone(),
                    )
                })
                .collect();

            let mut updated = container.wavelet.clone();
            for op in &ops {
                op.apply(&mut updated).map_err(|e| e.to_string())?;
            }

            let transformed = TransformedWaveletDelta::new(
                delta.author.clone(),
                applied_at,
                resulting.clone(),
                timestamp,
                ops,
            );

            container.wavelet = updated.clone();
            container.history.push(transformed.clone());
            container.committed_version = resulting;
            (updated, transformed)
        };

        let resulting = transformed.resulting.clone();
        let operations_applied = transformed.len();
        let deltas = DeltaSequence::single(transformed);
        let subscribers: Vec<Arc<dyn WaveBusSubscriber>> =
            self.subscribers.lock().unwrap().clone();
        for subscriber in &subscribers {
            subscriber.wavelet_update(&updated_wavelet, &deltas);
            subscriber.wavelet_committed(name, &resulting);
        }

        Ok(SubmitResult {
            operations_applied,
            hashed_version_after_application: resulting,
            application_timestamp: timestamp,
        })
    }

    fn wavelet_ids(&self, wave_id: &WaveId) -> Result<Vec<WaveletId>, WaveServerError> {
        let waves = self.waves.lock().unwrap();
        let mut ids: Vec<WaveletId> =
            waves.get(wave_id).map(|w| w.keys().cloned().collect()).unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    fn check_access_permission(
        &self,
        name: &WaveletName,
        user: &ParticipantId,
    ) -> Result<bool, WaveServerError> {
        match self.container(name) {
            Some(container) => {
                let container = container.lock().unwrap();
                let allowed = container.wavelet.has_participant(user);
                if !allowed {
                    warn!("{} denied access to {}", user, name);
                }
                Ok(allowed)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docop::{DocOpBuilder, NoSchemaConstraints};

    struct FixedClock(Timestamp);

    impl Clock for FixedClock {
        fn now_millis(&self) -> Timestamp {
            self.0
        }
    }

    fn server() -> WaveServer {
        WaveServer::new(Box::new(NoSchemaConstraints), Box::new(FixedClock(42_000)))
    }

    fn alice() -> ParticipantId {
        ParticipantId::new("alice@example.com").unwrap()
    }

    fn name() -> WaveletName {
        WaveletName::new(
            WaveId::new("example.com", "w+abc").unwrap(),
            WaveletId::new("example.com", "conv+root").unwrap(),
        )
    }

    fn create_wavelet(server: &WaveServer) -> SubmitResult {
        let delta = WaveletDelta::new(
            alice(),
            HashedVersion::unsigned(0),
            vec![WaveletOp::AddParticipant(alice())],
        );
        server.submit_request(&name(), delta).unwrap()
    }

    #[test]
    fn create_and_edit_advances_the_chain() {
        let server = server();
        let r1 = create_wavelet(&server);
        assert_eq!(r1.operations_applied, 1);
        assert_eq!(r1.hashed_version_after_application.version, 1);

        let edit = WaveletDelta::new(
            alice(),
            r1.hashed_version_after_application.clone(),
            vec![WaveletOp::Blip {
                blip_id: "b+1".into(),
                op: DocOpBuilder::new().characters("hi").build().unwrap(),
            }],
        );
        let r2 = server.submit_request(&name(), edit).unwrap();
        assert_eq!(r2.hashed_version_after_application.version, 2);
        assert_ne!(
            r1.hashed_version_after_application.history_hash,
            r2.hashed_version_after_application.history_hash
        );

        let snapshot = server.snapshot(&name()).unwrap().unwrap();
        assert_eq!(snapshot.snapshot.blip("b+1").unwrap().content.to_xml_string(), "hi");
        assert_eq!(snapshot.committed_version.version, 2);
    }

    #[test]
    fn stale_submits_are_rejected() {
        let server = server();
        let r1 = create_wavelet(&server);

        let edit = WaveletDelta::new(
            alice(),
            r1.hashed_version_after_application.clone(),
            vec![WaveletOp::NoOp],
        );
        server.submit_request(&name(), edit.clone()).unwrap();

        // Resubmitting against the old version is a contiguity error, not a
        // merge.
        let err = server.submit_request(&name(), edit).unwrap_err();
        assert!(err.contains("targets version"), "{}", err);
    }

    #[test]
    fn wrong_history_hash_is_rejected() {
        let server = server();
        let r1 = create_wavelet(&server);
        let mut forged = r1.hashed_version_after_application.clone();
        forged.history_hash[0] ^= 0xff;
        let edit = WaveletDelta::new(alice(), forged, vec![WaveletOp::NoOp]);
        assert!(server.submit_request(&name(), edit).is_err());
    }

    #[test]
    fn non_participants_cannot_submit() {
        let server = server();
        create_wavelet(&server);
        let eve = ParticipantId::new("eve@example.com").unwrap();
        let delta = WaveletDelta::new(eve, HashedVersion::unsigned(1), vec![WaveletOp::NoOp]);
        let err = server.submit_request(&name(), delta).unwrap_err();
        assert!(err.contains("not a participant"), "{}", err);
    }

    #[test]
    fn new_wavelet_must_add_its_creator() {
        let server = server();
        let delta =
            WaveletDelta::new(alice(), HashedVersion::unsigned(0), vec![WaveletOp::NoOp]);
        let err = server.submit_request(&name(), delta).unwrap_err();
        assert!(err.contains("adding its creator"), "{}", err);
    }

    #[test]
    fn history_returns_contiguous_runs_with_matching_hashes() {
        let server = server();
        let r1 = create_wavelet(&server);
        let v0 = server.version_factory().version_zero(&name());

        for _ in 0..3 {
            let head = server.snapshot(&name()).unwrap().unwrap().committed_version;
            let delta = WaveletDelta::new(alice(), head, vec![WaveletOp::NoOp]);
            server.submit_request(&name(), delta).unwrap();
        }

        let head = server.snapshot(&name()).unwrap().unwrap().committed_version;
        let full = server.history(&name(), &v0, &head).unwrap();
        assert_eq!(full.len(), 4);
        assert_eq!(full.start_version(), 0);
        assert_eq!(full.end_version(), &head);

        let partial = server
            .history(&name(), &r1.hashed_version_after_application, &head)
            .unwrap();
        assert_eq!(partial.start_version(), 1);

        // A forged start hash does not lie on the chain.
        let mut forged = r1.hashed_version_after_application.clone();
        forged.history_hash[0] ^= 1;
        assert!(server.history(&name(), &forged, &head).is_err());
    }
}
