//! Wavelet snapshots: participants, blips and version metadata.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use smartstring::alias::String as SmartString;

use crate::doc::Document;
use crate::version::HashedVersion;
use crate::Timestamp;

use super::ids::{ParticipantId, WaveletName};

/// One document inside a wavelet, with its contribution metadata.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlipData {
    pub id: SmartString,
    pub content: Document,
    pub author: ParticipantId,
    /// Everyone who has applied an op to this blip, in first-contribution
    /// order.
    pub contributors: Vec<ParticipantId>,
    pub creation_time: Timestamp,
    pub last_modified_time: Timestamp,
    pub last_modified_version: u64,
}

impl BlipData {
    fn new(id: SmartString, author: ParticipantId, creation_time: Timestamp) -> Self {
        BlipData {
            id,
            content: Document::new(),
            author,
            contributors: Vec::new(),
            creation_time,
            last_modified_time: creation_time,
            last_modified_version: 0,
        }
    }

    fn add_contributor(&mut self, participant: &ParticipantId) {
        if !self.contributors.contains(participant) {
            self.contributors.push(participant.clone());
        }
    }
}

/// A wavelet snapshot: the full state at one hashed version.
///
/// The participant list is insertion-ordered and duplicate-free; blips are
/// keyed by id. Mutation happens only through operation application - the
/// synchronization layer otherwise treats snapshots as values to copy.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WaveletData {
    name: WaveletName,
    creator: ParticipantId,
    creation_time: Timestamp,
    participants: Vec<ParticipantId>,
    blips: BTreeMap<SmartString, BlipData>,
    hashed_version: HashedVersion,
    last_modified_time: Timestamp,
}

impl WaveletData {
    pub fn new(
        name: WaveletName,
        creator: ParticipantId,
        creation_time: Timestamp,
        version_zero: HashedVersion,
    ) -> Self {
        assert_eq!(version_zero.version, 0, "wavelet must start at version zero");
        WaveletData {
            name,
            creator,
            creation_time,
            participants: Vec::new(),
            blips: BTreeMap::new(),
            hashed_version: version_zero,
            last_modified_time: creation_time,
        }
    }

    pub fn name(&self) -> &WaveletName {
        &self.name
    }

    pub fn creator(&self) -> &ParticipantId {
        &self.creator
    }

    pub fn creation_time(&self) -> Timestamp {
        self.creation_time
    }

    pub fn version(&self) -> u64 {
        self.hashed_version.version
    }

    pub fn hashed_version(&self) -> &HashedVersion {
        &self.hashed_version
    }

    pub fn last_modified_time(&self) -> Timestamp {
        self.last_modified_time
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    pub fn has_participant(&self, participant: &ParticipantId) -> bool {
        self.participants.contains(participant)
    }

    pub fn blip(&self, id: &str) -> Option<&BlipData> {
        self.blips.get(id)
    }

    pub fn blip_ids(&self) -> impl Iterator<Item = &str> {
        self.blips.keys().map(|k| k.as_str())
    }

    pub fn blips(&self) -> impl Iterator<Item = &BlipData> {
        self.blips.values()
    }

    pub(crate) fn add_participant(&mut self, participant: &ParticipantId) -> bool {
        if self.participants.contains(participant) {
            return false;
        }
        self.participants.push(participant.clone());
        true
    }

    pub(crate) fn remove_participant(&mut self, participant: &ParticipantId) -> bool {
        match self.participants.iter().position(|p| p == participant) {
            Some(i) => {
                self.participants.remove(i);
                true
            }
            None => false,
        }
    }

    /// The blip to apply a doc op to, created empty on first touch.
    pub(crate) fn blip_for_update(
        &mut self,
        id: &str,
        author: &ParticipantId,
        timestamp: Timestamp,
    ) -> &mut BlipData {
        let blip = self
            .blips
            .entry(id.into())
            .or_insert_with(|| BlipData::new(id.into(), author.clone(), timestamp));
        blip.add_contributor(author);
        blip
    }

    /// Advances version metadata after an op. The hash is adopted from the
    /// context only when it is consistent with the new version number -
    /// inverse-op contexts deliberately carry the forward op's hash, and
    /// rollback counts version decrements instead of trusting it.
    pub(crate) fn update_version(
        &mut self,
        version_increment: i64,
        hashed_version: Option<&HashedVersion>,
        timestamp: Timestamp,
    ) {
        let new_version = self
            .hashed_version
            .version
            .checked_add_signed(version_increment)
            .expect("version increment underflowed");
        match hashed_version {
            Some(hv) if hv.version == new_version => self.hashed_version = hv.clone(),
            _ => self.hashed_version = HashedVersion::unsigned(new_version),
        }
        self.last_modified_time = timestamp;
    }

    /// Stamps the authoritative hashed version, e.g. after a rollback
    /// reconstruction has counted its way to the right number.
    pub(crate) fn set_hashed_version(&mut self, version: HashedVersion) {
        assert_eq!(
            self.hashed_version.version, version.version,
            "hashed version stamp disagrees with counted version"
        );
        self.hashed_version = version;
    }
}

impl Display for WaveletData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wavelet {} v{} ({} participants, {} blips)",
            self.name,
            self.hashed_version,
            self.participants.len(),
            self.blips.len()
        )
    }
}
