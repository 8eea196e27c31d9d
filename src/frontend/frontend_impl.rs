//! The client frontend implementation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::delta::{DeltaSequence, WaveletDelta};
use crate::version::HashedVersion;
use crate::wave::{
    IdFilter, ParticipantId, WaveId, WaveletData, WaveletId, WaveletName, WaveletOp,
};

use super::user_manager::UserManagers;
use super::{ClientFrontend, OpenListener, SubmitResult, WaveletInfo, WaveletProvider};

/// Routes submits to the provider and update streams to subscribed
/// listeners, keeping [`WaveletInfo`] authoritative about versions and
/// participants along the way.
pub struct ClientFrontendImpl {
    provider: Arc<dyn WaveletProvider>,
    wavelet_info: Arc<WaveletInfo>,
    per_user: UserManagers,
    channel_counter: AtomicU64,
}

impl ClientFrontendImpl {
    pub fn new(provider: Arc<dyn WaveletProvider>, wavelet_info: Arc<WaveletInfo>) -> Self {
        ClientFrontendImpl {
            provider,
            wavelet_info,
            per_user: UserManagers::default(),
            channel_counter: AtomicU64::new(0),
        }
    }

    fn generate_channel_id(&self) -> String {
        format!("ch{}", self.channel_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// The catch-up payload for one wavelet: the minimal contiguous delta
    /// run from the client's known version, or a full snapshot when the gap
    /// cannot be bridged.
    fn send_wavelet_state(
        &self,
        name: &WaveletName,
        known: Option<&HashedVersion>,
        listener: &Arc<dyn OpenListener>,
        channel_id: Option<&str>,
    ) {
        let current = self.wavelet_info.current_wavelet_version(name);
        if let Some(known) = known {
            if known.version == current.version && known.matches(&current) {
                // Already caught up; just confirm the committed version.
                listener.on_update(name, None, &DeltaSequence::empty(), Some(&current), false, channel_id);
                return;
            }
            if known.version < current.version {
                match self.provider.history(name, known, &current) {
                    Ok(deltas) if !deltas.is_empty() => {
                        info!(
                            "catching {} up from {} with {} deltas",
                            name,
                            known,
                            deltas.len()
                        );
                        listener.on_update(name, None, &deltas, Some(&current), false, channel_id);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        info!("cannot bridge {} from {}: {}; sending snapshot", name, known, e);
                    }
                }
            }
            // Known version ahead of us or off-chain: fall through to a
            // snapshot resync.
        }
        match self.provider.snapshot(name) {
            Ok(Some(committed)) => {
                let committed_version = committed.committed_version.clone();
                listener.on_update(
                    name,
                    Some(&committed),
                    &DeltaSequence::empty(),
                    Some(&committed_version),
                    false,
                    channel_id,
                );
            }
            Ok(None) => {
                listener.on_update(name, None, &DeltaSequence::empty(), None, false, channel_id);
            }
            Err(e) => {
                warn!("failed to retrieve snapshot for {}: {}", name, e);
                listener.on_failure("wave server failure retrieving wavelet");
            }
        }
    }

    /// Routes one participant's view of a delta run, updating the
    /// participant bookkeeping around it.
    fn participant_update(
        &self,
        name: &WaveletName,
        participant: &ParticipantId,
        deltas: &DeltaSequence,
        added: bool,
        removed: bool,
    ) {
        if added {
            self.wavelet_info.notify_added_explicit_participant(name, participant);
        }
        self.per_user.get(participant).on_update(name, deltas);
        if removed {
            self.wavelet_info.notify_removed_explicit_participant(name, participant);
        }
    }

    /// Called by the wave bus for every accepted delta run. Asserts
    /// contiguity, then fans out: participants removed partway through get
    /// the prefix up to their removal, everyone else the full run.
    pub fn wavelet_update(&self, wavelet: &WaveletData, new_deltas: &DeltaSequence) {
        if new_deltas.is_empty() {
            return;
        }
        let name = wavelet.name();
        self.wavelet_info.sync_wavelet_version(name, new_deltas);

        let mut remaining: HashSet<ParticipantId> =
            self.wavelet_info.wavelet_participants(name).into_iter().collect();
        let mut new_participants: HashSet<ParticipantId> = HashSet::new();

        for (i, delta) in new_deltas.iter().enumerate() {
            for op in &delta.ops {
                match &op.op {
                    WaveletOp::AddParticipant(p) => {
                        remaining.insert(p.clone());
                        new_participants.insert(p.clone());
                    }
                    WaveletOp::RemoveParticipant(p) => {
                        remaining.remove(p);
                        let was_new = new_participants.remove(p);
                        self.participant_update(name, p, &new_deltas.prefix(i + 1), was_new, true);
                    }
                    _ => {}
                }
            }
        }

        for p in &remaining {
            let is_new = new_participants.contains(p);
            self.participant_update(name, p, new_deltas, is_new, false);
        }

        // Implicit participants hear about everything too.
        for p in self.wavelet_info.interested_participants(name) {
            if !remaining.contains(&p) && !self.wavelet_info.wavelet_participants(name).contains(&p) {
                self.per_user.get(&p).on_update(name, new_deltas);
            }
        }
    }

    /// Called by the wave bus when a version becomes durable.
    pub fn wavelet_committed(&self, name: &WaveletName, version: &HashedVersion) {
        for p in self.wavelet_info.interested_participants(name) {
            self.per_user.get(&p).on_commit(name, version);
        }
    }

    fn dummy_wavelet_name(wave_id: &WaveId) -> WaveletName {
        let wavelet_id = WaveletId::new(wave_id.domain(), "dummy+root")
            .expect("wave domain is always a valid wavelet domain");
        WaveletName::new(wave_id.clone(), wavelet_id)
    }
}

impl crate::server::WaveBusSubscriber for ClientFrontendImpl {
    fn wavelet_update(&self, wavelet: &WaveletData, deltas: &DeltaSequence) {
        ClientFrontendImpl::wavelet_update(self, wavelet, deltas);
    }

    fn wavelet_committed(&self, name: &WaveletName, version: &HashedVersion) {
        ClientFrontendImpl::wavelet_committed(self, name, version);
    }
}

impl ClientFrontend for ClientFrontendImpl {
    fn open_request(
        &self,
        user: &ParticipantId,
        wave_id: &WaveId,
        wavelet_filter: &IdFilter,
        known_wavelets: &[(WaveletId, HashedVersion)],
        listener: Arc<dyn OpenListener>,
    ) {
        info!("open from {} for {}, filter {}", user, wave_id, wavelet_filter);

        if let Err(e) = self.wavelet_info.initialise_wave(wave_id) {
            warn!("wave server failed lookup for {}: {}", wave_id, e);
            listener.on_failure("wave server failed to look up wave");
            return;
        }

        let channel_id = self.generate_channel_id();
        self.per_user.get(user).subscribe(
            wave_id.clone(),
            wavelet_filter.clone(),
            channel_id.clone(),
            listener.clone(),
        );

        let visible = match self.wavelet_info.visible_wavelets_for(wave_id, wavelet_filter, user) {
            Ok(visible) => visible,
            Err(e) => {
                warn!("failed to retrieve visible wavelets for {}: {}", user, e);
                Vec::new()
            }
        };

        let mut first_message_channel = Some(channel_id.as_str());
        for wavelet_id in &visible {
            let name = WaveletName::new(wave_id.clone(), wavelet_id.clone());
            // Listeners without membership still receive updates.
            self.wavelet_info.notify_added_implicit_participant(&name, user);
            let known = known_wavelets
                .iter()
                .find(|(id, _)| id == wavelet_id)
                .map(|(_, version)| version);
            self.send_wavelet_state(&name, known, &listener, first_message_channel.take());
        }

        let dummy = Self::dummy_wavelet_name(wave_id);
        if let Some(channel) = first_message_channel {
            // Nothing visible: the client still needs its channel id.
            listener.on_update(&dummy, None, &DeltaSequence::empty(), None, false, Some(channel));
        }
        // And finally: caught up.
        listener.on_update(&dummy, None, &DeltaSequence::empty(), None, true, None);
    }

    fn submit_request(
        &self,
        user: &ParticipantId,
        wavelet_name: &WaveletName,
        delta: WaveletDelta,
        channel_id: &str,
    ) -> Result<SubmitResult, String> {
        if &delta.author != user {
            return Err("Author field on delta must match logged in user".to_string());
        }
        let manager = self.per_user.get(user);
        manager.submit_request(channel_id, wavelet_name);
        let result = self.provider.submit_request(wavelet_name, delta);
        match &result {
            Ok(r) => info!(
                "submit on {} applied {} ops -> {}",
                wavelet_name, r.operations_applied, r.hashed_version_after_application
            ),
            Err(e) => warn!("submit on {} rejected: {}", wavelet_name, e),
        }
        manager.submit_response(channel_id, wavelet_name);
        result
    }
}
