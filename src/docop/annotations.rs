//! Annotation boundaries.
//!
//! Annotations are key/value ranges layered over the document items (think
//! `style/fontWeight=bold` over a span of text). An op doesn't carry ranges
//! directly; instead it emits *boundary* components at the positions where
//! the set of active annotations changes, and the items in between inherit
//! whatever is active.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use smallvec::SmallVec;
use smartstring::alias::String as SmartString;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::attributes::{literal_string, opt_literal_string, DuplicateKey};

/// One annotation transition at a boundary: the span for `key` begins here
/// (or changes value), asserting the document currently holds `old`.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnnotationChange {
    pub key: SmartString,
    pub old: Option<SmartString>,
    pub new: Option<SmartString>,
}

/// A single boundary event: the keys whose spans end here, and the keys whose
/// spans begin or change value here. Both lists are strictly ascending and a
/// key never appears in both.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnnotationBoundary {
    end_keys: SmallVec<[SmartString; 2]>,
    changes: SmallVec<[AnnotationChange; 2]>,
}

impl AnnotationBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts<E, C>(end_keys: E, changes: C) -> Result<Self, DuplicateKey>
    where
        E: IntoIterator<Item = SmartString>,
        C: IntoIterator<Item = AnnotationChange>,
    {
        let mut ends: SmallVec<[SmartString; 2]> = end_keys.into_iter().collect();
        let mut changes: SmallVec<[AnnotationChange; 2]> = changes.into_iter().collect();
        ends.sort();
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        for w in ends.windows(2) {
            if w[0] == w[1] {
                return Err(DuplicateKey(w[0].to_string()));
            }
        }
        for w in changes.windows(2) {
            if w[0].key == w[1].key {
                return Err(DuplicateKey(w[0].key.to_string()));
            }
        }
        for end in &ends {
            if changes.iter().any(|c| &c.key == end) {
                return Err(DuplicateKey(end.to_string()));
            }
        }
        Ok(AnnotationBoundary { end_keys: ends, changes })
    }

    pub fn is_empty(&self) -> bool {
        self.end_keys.is_empty() && self.changes.is_empty()
    }

    pub fn end_keys(&self) -> impl Iterator<Item = &str> {
        self.end_keys.iter().map(|k| k.as_str())
    }

    pub fn changes(&self) -> impl Iterator<Item = &AnnotationChange> {
        self.changes.iter()
    }

    pub fn end_count(&self) -> usize {
        self.end_keys.len()
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Old and new values swapped on every change; ends stay ends.
    pub fn inverted(&self) -> AnnotationBoundary {
        AnnotationBoundary {
            end_keys: self.end_keys.clone(),
            changes: self
                .changes
                .iter()
                .map(|c| AnnotationChange {
                    key: c.key.clone(),
                    old: c.new.clone(),
                    new: c.old.clone(),
                })
                .collect(),
        }
    }
}

/// Convenience builder mirroring the shape ops are usually written in.
#[derive(Debug, Default)]
pub struct AnnotationBoundaryBuilder {
    end_keys: SmallVec<[SmartString; 2]>,
    changes: SmallVec<[AnnotationChange; 2]>,
}

impl AnnotationBoundaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn end(mut self, key: &str) -> Self {
        self.end_keys.push(key.into());
        self
    }

    pub fn change(mut self, key: &str, old: Option<&str>, new: Option<&str>) -> Self {
        self.changes.push(AnnotationChange {
            key: key.into(),
            old: old.map(Into::into),
            new: new.map(Into::into),
        });
        self
    }

    pub fn build(self) -> Result<AnnotationBoundary, DuplicateKey> {
        AnnotationBoundary::from_parts(self.end_keys, self.changes)
    }
}

impl Display for AnnotationBoundary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{ ")?;
        let mut first = true;
        for key in self.end_keys() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            f.write_str(&literal_string(key))?;
        }
        for c in self.changes() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(
                f,
                "{}: {} -> {}",
                literal_string(&c.key),
                opt_literal_string(c.old.as_deref()),
                opt_literal_string(c.new.as_deref())
            )?;
        }
        f.write_str(" }")
    }
}

/// The value map a run of document items carries. Keys with no entry are
/// unannotated; values are never "present but null".
pub type AnnotationMap = BTreeMap<SmartString, SmartString>;

/// The running composition of the annotation boundaries seen so far while
/// walking an op: key -> (asserted old value, value being written).
///
/// This is the state the validation automaton and the document apply loop
/// both track. Ends remove keys; changes insert or overwrite them.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AnnotationsUpdate {
    changes: BTreeMap<SmartString, (Option<SmartString>, Option<SmartString>)>,
}

impl AnnotationsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    pub fn first_key(&self) -> Option<&str> {
        self.changes.keys().next().map(|k| k.as_str())
    }

    /// Iterates `(key, old, new)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>, Option<&str>)> {
        self.changes
            .iter()
            .map(|(k, (old, new))| (k.as_str(), old.as_deref(), new.as_deref()))
    }

    pub fn compose_with(&mut self, boundary: &AnnotationBoundary) {
        for key in boundary.end_keys() {
            self.changes.remove(key);
        }
        for c in boundary.changes() {
            self.changes
                .insert(c.key.clone(), (c.old.clone(), c.new.clone()));
        }
    }

    /// Applies the new-value side onto an annotation map (the map inherited
    /// from the left neighbour, for inserted or retained content).
    pub fn apply_to(&self, map: &mut AnnotationMap) {
        for (key, (_, new)) in &self.changes {
            match new {
                Some(v) => {
                    map.insert(key.clone(), v.clone());
                }
                None => {
                    map.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_sorts_and_rejects_duplicates() {
        let b = AnnotationBoundaryBuilder::new()
            .change("style/b", None, Some("bold"))
            .change("style/a", None, Some("x"))
            .build()
            .unwrap();
        let keys: Vec<_> = b.changes().map(|c| c.key.to_string()).collect();
        assert_eq!(keys, ["style/a", "style/b"]);

        assert!(AnnotationBoundaryBuilder::new()
            .end("k")
            .change("k", None, Some("v"))
            .build()
            .is_err());
    }

    #[test]
    fn update_composition_and_application() {
        let mut update = AnnotationsUpdate::new();
        update.compose_with(
            &AnnotationBoundaryBuilder::new()
                .change("a", None, Some("1"))
                .change("b", Some("old"), None)
                .build()
                .unwrap(),
        );
        assert!(update.contains_key("a"));

        let mut map = AnnotationMap::new();
        map.insert("b".into(), "old".into());
        update.apply_to(&mut map);
        assert_eq!(map.get("a").map(|s| s.as_str()), Some("1"));
        assert!(!map.contains_key("b"));

        // Ending a key drops it from the running update.
        update.compose_with(&AnnotationBoundaryBuilder::new().end("a").build().unwrap());
        assert!(!update.contains_key("a"));
        assert!(update.contains_key("b"));
    }
}
