//! Identifiers: participants, waves, wavelets and the id filter used when
//! opening a wave view.

use std::fmt::{Display, Formatter};

use smartstring::alias::String as SmartString;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InvalidId(pub String);

impl Display for InvalidId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid id: {}", self.0)
    }
}

impl std::error::Error for InvalidId {}

/// A participant address, `local@domain`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParticipantId(SmartString);

impl ParticipantId {
    pub fn new(address: &str) -> Result<Self, InvalidId> {
        let (local, domain) = address
            .split_once('@')
            .ok_or_else(|| InvalidId(format!("participant address without @: {:?}", address)))?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(InvalidId(format!("malformed participant address: {:?}", address)));
        }
        Ok(ParticipantId(address.into()))
    }

    pub fn address(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        self.0.split_once('@').map(|(_, d)| d).unwrap_or("")
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_token(kind: &str, domain: &str, id: &str) -> Result<(), InvalidId> {
    if domain.is_empty() || id.is_empty() {
        return Err(InvalidId(format!("{} with empty domain or id: {:?}/{:?}", kind, domain, id)));
    }
    if domain.contains('/') || id.contains('/') {
        return Err(InvalidId(format!("{} may not contain '/': {:?}/{:?}", kind, domain, id)));
    }
    Ok(())
}

/// Identifies a wave: a domain plus an id token unique within it.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WaveId {
    domain: SmartString,
    id: SmartString,
}

impl WaveId {
    pub fn new(domain: &str, id: &str) -> Result<Self, InvalidId> {
        check_token("wave id", domain, id)?;
        Ok(WaveId { domain: domain.into(), id: id.into() })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Display for WaveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.id)
    }
}

/// Identifies a wavelet within a wave.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WaveletId {
    domain: SmartString,
    id: SmartString,
}

impl WaveletId {
    pub fn new(domain: &str, id: &str) -> Result<Self, InvalidId> {
        check_token("wavelet id", domain, id)?;
        Ok(WaveletId { domain: domain.into(), id: id.into() })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Display for WaveletId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.id)
    }
}

/// The globally unique name of a wavelet. Its canonical string form is the
/// input to the version-zero history hash, so the rendering here is part of
/// the protocol.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WaveletName {
    pub wave_id: WaveId,
    pub wavelet_id: WaveletId,
}

impl WaveletName {
    pub fn new(wave_id: WaveId, wavelet_id: WaveletId) -> Self {
        WaveletName { wave_id, wavelet_id }
    }
}

impl Display for WaveletName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.wave_id, self.wavelet_id)
    }
}

/// Selects wavelets within a wave by exact id or id prefix.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct IdFilter {
    ids: Vec<WaveletId>,
    prefixes: Vec<SmartString>,
}

impl IdFilter {
    /// Accepts every wavelet (the empty prefix matches everything).
    pub fn all() -> Self {
        IdFilter { ids: Vec::new(), prefixes: vec!["".into()] }
    }

    pub fn of_ids<I: IntoIterator<Item = WaveletId>>(ids: I) -> Self {
        IdFilter { ids: ids.into_iter().collect(), prefixes: Vec::new() }
    }

    pub fn of_prefixes<'a, I: IntoIterator<Item = &'a str>>(prefixes: I) -> Self {
        IdFilter { ids: Vec::new(), prefixes: prefixes.into_iter().map(Into::into).collect() }
    }

    pub fn includes(&self, id: &WaveletId) -> bool {
        self.ids.contains(id) || self.prefixes.iter().any(|p| id.id().starts_with(p.as_str()))
    }
}

impl Display for IdFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "filter(ids: {:?}, prefixes: {:?})", self.ids, self.prefixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_addresses_validate() {
        assert!(ParticipantId::new("alice@example.com").is_ok());
        assert!(ParticipantId::new("alice").is_err());
        assert!(ParticipantId::new("@example.com").is_err());
        assert!(ParticipantId::new("a@b@c").is_err());
        assert_eq!(ParticipantId::new("bob@acme.org").unwrap().domain(), "acme.org");
    }

    #[test]
    fn wavelet_name_canonical_form() {
        let name = WaveletName::new(
            WaveId::new("example.com", "w+abc").unwrap(),
            WaveletId::new("example.com", "conv+root").unwrap(),
        );
        assert_eq!(name.to_string(), "example.com/w+abc/example.com/conv+root");
    }

    #[test]
    fn filters() {
        let conv = WaveletId::new("example.com", "conv+root").unwrap();
        let user_data = WaveletId::new("example.com", "user+alice").unwrap();
        assert!(IdFilter::all().includes(&conv));
        assert!(IdFilter::of_prefixes(["conv"]).includes(&conv));
        assert!(!IdFilter::of_prefixes(["conv"]).includes(&user_data));
        assert!(IdFilter::of_ids([conv.clone()]).includes(&conv));
        assert!(!IdFilter::default().includes(&conv));
    }
}
