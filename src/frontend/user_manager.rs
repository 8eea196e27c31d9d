//! Per-user subscription state.
//!
//! A user may hold several wave views open at once. Each subscription pins
//! a channel id and a wavelet filter; updates are fanned out to every
//! matching subscription. While a submit is in flight on a channel, updates
//! for that wavelet are held back and flushed once the submit response has
//! been delivered, so the client always sees its own submit acknowledged
//! before the resulting delta arrives on the stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::delta::DeltaSequence;
use crate::version::HashedVersion;
use crate::wave::{IdFilter, ParticipantId, WaveId, WaveletName};

use super::OpenListener;

#[derive(Debug, Default)]
struct ChannelState {
    outstanding_submits: usize,
    held_back: Vec<DeltaSequence>,
}

/// One open wave view: a filter, a channel and the listener to deliver to.
pub struct WaveViewSubscription {
    wave_id: WaveId,
    filter: IdFilter,
    channel_id: String,
    listener: Arc<dyn OpenListener>,
    channels: Mutex<HashMap<WaveletName, ChannelState>>,
}

impl WaveViewSubscription {
    fn new(
        wave_id: WaveId,
        filter: IdFilter,
        channel_id: String,
        listener: Arc<dyn OpenListener>,
    ) -> Self {
        WaveViewSubscription { wave_id, filter, channel_id, listener, channels: Mutex::new(HashMap::new()) }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn includes(&self, name: &WaveletName) -> bool {
        name.wave_id == self.wave_id && self.filter.includes(&name.wavelet_id)
    }

    fn submit_request(&self, name: &WaveletName) {
        let mut channels = self.channels.lock().unwrap();
        channels.entry(name.clone()).or_default().outstanding_submits += 1;
    }

    /// Marks a submit as answered and flushes updates held back meanwhile.
    fn submit_response(&self, name: &WaveletName) {
        let held: Vec<DeltaSequence> = {
            let mut channels = self.channels.lock().unwrap();
            let state = channels.entry(name.clone()).or_default();
            state.outstanding_submits = state.outstanding_submits.saturating_sub(1);
            if state.outstanding_submits > 0 {
                return;
            }
            std::mem::take(&mut state.held_back)
        };
        for deltas in held {
            debug!("flushing held-back update for {} on channel {}", name, self.channel_id);
            self.listener.on_update(name, None, &deltas, None, false, None);
        }
    }

    fn on_update(&self, name: &WaveletName, deltas: &DeltaSequence) {
        {
            let mut channels = self.channels.lock().unwrap();
            if let Some(state) = channels.get_mut(name) {
                if state.outstanding_submits > 0 {
                    state.held_back.push(deltas.clone());
                    return;
                }
            }
        }
        self.listener.on_update(name, None, deltas, None, false, None);
    }

    fn on_commit(&self, name: &WaveletName, version: &HashedVersion) {
        self.listener
            .on_update(name, None, &DeltaSequence::empty(), Some(version), false, None);
    }
}

/// All of one user's subscriptions. Lazily created per participant and kept
/// for the process lifetime, like the per-wavelet records.
#[derive(Default)]
pub struct UserManager {
    subscriptions: Mutex<Vec<Arc<WaveViewSubscription>>>,
}

impl UserManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        wave_id: WaveId,
        filter: IdFilter,
        channel_id: String,
        listener: Arc<dyn OpenListener>,
    ) -> Arc<WaveViewSubscription> {
        let subscription =
            Arc::new(WaveViewSubscription::new(wave_id, filter, channel_id, listener));
        self.subscriptions.lock().unwrap().push(subscription.clone());
        subscription
    }

    fn matching(&self, name: &WaveletName) -> Vec<Arc<WaveViewSubscription>> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.includes(name))
            .cloned()
            .collect()
    }

    /// Notes an in-flight submit on the given channel.
    pub fn submit_request(&self, channel_id: &str, name: &WaveletName) {
        for s in self.matching(name) {
            if s.channel_id() == channel_id {
                s.submit_request(name);
            }
        }
    }

    /// Completes an in-flight submit (successfully or not).
    pub fn submit_response(&self, channel_id: &str, name: &WaveletName) {
        for s in self.matching(name) {
            if s.channel_id() == channel_id {
                s.submit_response(name);
            }
        }
    }

    /// Delivers new deltas to every subscription watching this wavelet.
    pub fn on_update(&self, name: &WaveletName, deltas: &DeltaSequence) {
        for s in self.matching(name) {
            s.on_update(name, deltas);
        }
    }

    /// Delivers a commit notice to every subscription watching this wavelet.
    pub fn on_commit(&self, name: &WaveletName, version: &HashedVersion) {
        for s in self.matching(name) {
            s.on_commit(name, version);
        }
    }
}

/// Keyed store of user managers with get-or-insert semantics; the map lock
/// is held only for the lookup, never while delivering.
#[derive(Default)]
pub(crate) struct UserManagers {
    managers: Mutex<HashMap<ParticipantId, Arc<UserManager>>>,
}

impl UserManagers {
    pub fn get(&self, user: &ParticipantId) -> Arc<UserManager> {
        self.managers
            .lock()
            .unwrap()
            .entry(user.clone())
            .or_insert_with(|| Arc::new(UserManager::new()))
            .clone()
    }
}
