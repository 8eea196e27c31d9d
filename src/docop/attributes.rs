//! Element attributes and attribute updates.
//!
//! Both types are immutable sorted maps: keys are strictly ascending, so
//! iteration order is deterministic and equality is structural. Ops that
//! carry them can be compared and hashed byte-for-byte.

use std::fmt::{Display, Formatter};

use smallvec::SmallVec;
use smartstring::alias::String as SmartString;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An immutable string-to-string map with strictly ascending keys.
///
/// Most elements carry zero, one or two attributes, so the entries live
/// inline.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Attributes(SmallVec<[(SmartString, SmartString); 2]>);

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DuplicateKey(pub String);

impl Display for DuplicateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "duplicate key {:?}", self.0)
    }
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorts the pairs by key. Duplicate keys are an error - there is no
    /// sensible winner to pick.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, DuplicateKey>
    where
        K: Into<SmartString>,
        V: Into<SmartString>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut entries: SmallVec<[(SmartString, SmartString); 2]> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for w in entries.windows(2) {
            if w[0].0 == w[1].0 {
                return Err(DuplicateKey(w[0].0.to_string()));
            }
        }
        Ok(Attributes(entries))
    }

    pub fn single(key: &str, value: &str) -> Self {
        Attributes(smallvec::smallvec![(key.into(), value.into())])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.0[i].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a copy with the update applied: a change to `None` removes the
    /// key, anything else inserts or replaces.
    pub fn updated_with(&self, update: &AttributesUpdate) -> Attributes {
        let mut entries = self.0.clone();
        for change in update.iter() {
            let slot = entries.binary_search_by(|(k, _)| k.as_str().cmp(&change.key));
            match (&change.new, slot) {
                (Some(v), Ok(i)) => entries[i].1 = v.clone(),
                (Some(v), Err(i)) => entries.insert(i, (change.key.clone(), v.clone())),
                (None, Ok(i)) => {
                    entries.remove(i);
                }
                (None, Err(_)) => {}
            }
        }
        Attributes(entries)
    }
}

impl Display for Attributes {
    // The concise form used in op dumps: `{ k="v", k2="v2" }`.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{ ")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", k, literal_string(v))?;
        }
        f.write_str(" }")
    }
}

/// One attribute transition: `old` is what the document is expected to hold,
/// `new` what it will hold afterwards. `None` on either side means absent.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AttributeChange {
    pub key: SmartString,
    pub old: Option<SmartString>,
    pub new: Option<SmartString>,
}

/// An immutable set of attribute transitions with strictly ascending keys.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AttributesUpdate(SmallVec<[AttributeChange; 2]>);

impl AttributesUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_changes<I>(changes: I) -> Result<Self, DuplicateKey>
    where
        I: IntoIterator<Item = AttributeChange>,
    {
        let mut entries: SmallVec<[AttributeChange; 2]> = changes.into_iter().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        for w in entries.windows(2) {
            if w[0].key == w[1].key {
                return Err(DuplicateKey(w[0].key.to_string()));
            }
        }
        Ok(AttributesUpdate(entries))
    }

    pub fn single(key: &str, old: Option<&str>, new: Option<&str>) -> Self {
        AttributesUpdate(smallvec::smallvec![AttributeChange {
            key: key.into(),
            old: old.map(Into::into),
            new: new.map(Into::into),
        }])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeChange> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Option<&AttributeChange> {
        self.0
            .binary_search_by(|c| c.key.as_str().cmp(key))
            .ok()
            .map(|i| &self.0[i])
    }

    /// Sequential composition: for a key present in both, the pre-image comes
    /// from `self` and the post-image from `other`.
    pub fn compose_with(&self, other: &AttributesUpdate) -> AttributesUpdate {
        let mut entries: SmallVec<[AttributeChange; 2]> = SmallVec::new();
        let (mut a, mut b) = (self.0.iter().peekable(), other.0.iter().peekable());
        loop {
            match (a.peek(), b.peek()) {
                (Some(x), Some(y)) => match x.key.cmp(&y.key) {
                    std::cmp::Ordering::Less => entries.push((*a.next().unwrap()).clone()),
                    std::cmp::Ordering::Greater => entries.push((*b.next().unwrap()).clone()),
                    std::cmp::Ordering::Equal => {
                        let x = a.next().unwrap();
                        let y = b.next().unwrap();
                        entries.push(AttributeChange {
                            key: x.key.clone(),
                            old: x.old.clone(),
                            new: y.new.clone(),
                        });
                    }
                },
                (Some(_), None) => entries.push((*a.next().unwrap()).clone()),
                (None, Some(_)) => entries.push((*b.next().unwrap()).clone()),
                (None, None) => break,
            }
        }
        AttributesUpdate(entries)
    }

    /// Swaps old and new on every change.
    pub fn inverted(&self) -> AttributesUpdate {
        AttributesUpdate(
            self.0
                .iter()
                .map(|c| AttributeChange {
                    key: c.key.clone(),
                    old: c.new.clone(),
                    new: c.old.clone(),
                })
                .collect(),
        )
    }
}

impl Display for AttributesUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{ ")?;
        for (i, c) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{}: {} -> {}",
                c.key,
                opt_literal_string(c.old.as_deref()),
                opt_literal_string(c.new.as_deref())
            )?;
        }
        f.write_str(" }")
    }
}

pub(crate) fn literal_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn opt_literal_string(s: Option<&str>) -> String {
    match s {
        Some(s) => literal_string(s),
        None => "null".to_string(),
    }
}
