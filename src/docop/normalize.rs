//! Op normalization: merge adjacent runs, drop no-op annotation boundaries.
//!
//! Two ops that do the same thing normalize to the same component sequence,
//! which is what lets higher layers compare ops (and hash deltas) by value.
//! The composer also funnels its output through here so that composed ops
//! come out in canonical form.

use std::collections::BTreeMap;

use smartstring::alias::String as SmartString;

use super::annotations::{AnnotationBoundary, AnnotationChange, AnnotationBoundaryBuilder};
use super::attributes::{Attributes, AttributesUpdate};
use super::components::{DocOp, DocOpCursor, OpComponent};

#[derive(Debug, Clone, Eq, PartialEq)]
enum Pending {
    Change(Option<SmartString>, Option<SmartString>),
    End,
}

/// A cursor that accumulates a normalized op.
///
/// Range normalization: adjacent retains, characters and delete-characters
/// runs merge; empty runs vanish. Annotation normalization: boundary events
/// are buffered and only emitted (merged, minimal) immediately before the
/// next item-bearing component, so no two boundaries are ever adjacent and
/// boundaries that restate the already-active values disappear.
#[derive(Debug, Default)]
pub struct OpNormalizer {
    components: Vec<OpComponent>,
    /// Annotation changes currently in force in the output.
    active: BTreeMap<SmartString, (Option<SmartString>, Option<SmartString>)>,
    /// Boundary events seen since the last item-bearing component.
    pending: BTreeMap<SmartString, Pending>,
}

impl OpNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush_boundary(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut b = AnnotationBoundaryBuilder::new();
        let mut emitted = false;
        for (key, pending) in std::mem::take(&mut self.pending) {
            match pending {
                Pending::Change(old, new) => {
                    if self.active.get(&key) != Some(&(old.clone(), new.clone())) {
                        b = b.change(&key, old.as_deref(), new.as_deref());
                        self.active.insert(key, (old, new));
                        emitted = true;
                    }
                }
                Pending::End => {
                    if self.active.remove(&key).is_some() {
                        b = b.end(&key);
                        emitted = true;
                    }
                }
            }
        }
        if emitted {
            // Keys are unique within `pending`, so this cannot fail.
            let boundary = b.build().unwrap();
            self.components.push(OpComponent::AnnotationBoundary(boundary));
        }
    }

    fn push(&mut self, c: OpComponent) {
        self.flush_boundary();
        match c {
            OpComponent::Retain(0) => {}
            OpComponent::Retain(n) => {
                if let Some(OpComponent::Retain(prev)) = self.components.last_mut() {
                    *prev += n;
                } else {
                    self.components.push(OpComponent::Retain(n));
                }
            }
            OpComponent::Characters(s) => {
                if s.is_empty() {
                    return;
                }
                if let Some(OpComponent::Characters(prev)) = self.components.last_mut() {
                    prev.push_str(&s);
                } else {
                    self.components.push(OpComponent::Characters(s));
                }
            }
            OpComponent::DeleteCharacters(s) => {
                if s.is_empty() {
                    return;
                }
                if let Some(OpComponent::DeleteCharacters(prev)) = self.components.last_mut() {
                    prev.push_str(&s);
                } else {
                    self.components.push(OpComponent::DeleteCharacters(s));
                }
            }
            other => self.components.push(other),
        }
    }

    /// The normalized op. Trailing boundary events are flushed; a trailing
    /// annotation boundary (ending open keys) is legal and preserved.
    pub fn finish(mut self) -> DocOp {
        self.flush_boundary();
        DocOp::from_components(self.components)
    }
}

impl DocOpCursor for OpNormalizer {
    fn retain(&mut self, item_count: usize) {
        self.push(OpComponent::Retain(item_count));
    }

    fn characters(&mut self, chars: &str) {
        self.push(OpComponent::Characters(chars.into()));
    }

    fn delete_characters(&mut self, chars: &str) {
        self.push(OpComponent::DeleteCharacters(chars.into()));
    }

    fn element_start(&mut self, tag: &str, attrs: &Attributes) {
        self.push(OpComponent::ElementStart(tag.into(), attrs.clone()));
    }

    fn element_end(&mut self) {
        self.push(OpComponent::ElementEnd);
    }

    fn delete_element_start(&mut self, tag: &str, attrs: &Attributes) {
        self.push(OpComponent::DeleteElementStart(tag.into(), attrs.clone()));
    }

    fn delete_element_end(&mut self) {
        self.push(OpComponent::DeleteElementEnd);
    }

    fn replace_attributes(&mut self, old: &Attributes, new: &Attributes) {
        self.push(OpComponent::ReplaceAttributes(old.clone(), new.clone()));
    }

    fn update_attributes(&mut self, update: &AttributesUpdate) {
        self.push(OpComponent::UpdateAttributes(update.clone()));
    }

    fn annotation_boundary(&mut self, boundary: &AnnotationBoundary) {
        for key in boundary.end_keys() {
            self.pending.insert(key.into(), Pending::End);
        }
        for AnnotationChange { key, old, new } in boundary.changes() {
            self.pending
                .insert(key.clone(), Pending::Change(old.clone(), new.clone()));
        }
    }
}

/// Canonicalizes an op; see [`OpNormalizer`].
pub fn normalize(op: &DocOp) -> DocOp {
    let mut n = OpNormalizer::new();
    op.apply(&mut n);
    n.finish()
}

#[cfg(test)]
mod tests {
    use super::super::builder::UncheckedDocOpBuilder;
    use super::super::AnnotationBoundaryBuilder;
    use super::*;

    #[test]
    fn adjacent_runs_merge() {
        let op = UncheckedDocOpBuilder::new()
            .component(OpComponent::Retain(2))
            .component(OpComponent::Retain(3))
            .component(OpComponent::Characters("ab".into()))
            .component(OpComponent::Characters("cd".into()))
            .component(OpComponent::DeleteCharacters("x".into()))
            .component(OpComponent::DeleteCharacters("y".into()))
            .build();
        let n = normalize(&op);
        assert_eq!(n.to_string(), "__5; ++\"abcd\"; --\"xy\"; ");
    }

    #[test]
    fn redundant_boundaries_vanish() {
        let open = AnnotationBoundaryBuilder::new()
            .change("k", None, Some("v"))
            .build()
            .unwrap();
        let close = AnnotationBoundaryBuilder::new().end("k").build().unwrap();

        // Restating the active change in the middle is a no-op.
        let op = UncheckedDocOpBuilder::new()
            .component(OpComponent::AnnotationBoundary(open.clone()))
            .component(OpComponent::Retain(1))
            .component(OpComponent::AnnotationBoundary(open.clone()))
            .component(OpComponent::Retain(1))
            .component(OpComponent::AnnotationBoundary(close.clone()))
            .build();
        // The restated boundary disappears and the retains merge across it.
        let n = normalize(&op);
        assert_eq!(n.size(), 3);
        assert!(matches!(n.component(1), OpComponent::Retain(2)));

        // Open immediately followed by close cancels out entirely.
        let op = UncheckedDocOpBuilder::new()
            .component(OpComponent::Retain(1))
            .component(OpComponent::AnnotationBoundary(open))
            .component(OpComponent::AnnotationBoundary(close))
            .component(OpComponent::Retain(1))
            .build();
        let n = normalize(&op);
        assert_eq!(n.to_string(), "__2; ");
    }

    #[test]
    fn zero_length_runs_disappear() {
        let op = UncheckedDocOpBuilder::new()
            .component(OpComponent::Retain(0))
            .component(OpComponent::Characters("".into()))
            .component(OpComponent::Retain(4))
            .build();
        assert_eq!(normalize(&op).to_string(), "__4; ");
    }
}
