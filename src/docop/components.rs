//! The document operation itself: a closed sum of component kinds, replayed
//! through a cursor.
//!
//! Positions are counted in *items*: one element start, one element end, or
//! one character each occupy a single item slot. An op walks the whole
//! document it applies to - the read-side lengths of its components must sum
//! to exactly the document length.

use std::fmt::{Display, Formatter};

use smartstring::alias::String as SmartString;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::annotations::AnnotationBoundary;
use super::attributes::{Attributes, AttributesUpdate};

/// One component of a document operation.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OpComponent {
    Retain(usize),
    Characters(SmartString),
    DeleteCharacters(SmartString),
    ElementStart(SmartString, Attributes),
    ElementEnd,
    DeleteElementStart(SmartString, Attributes),
    DeleteElementEnd,
    ReplaceAttributes(Attributes, Attributes),
    UpdateAttributes(AttributesUpdate),
    AnnotationBoundary(AnnotationBoundary),
}

impl OpComponent {
    /// Item count this component consumes from the document it applies to.
    pub fn pre_len(&self) -> usize {
        match self {
            OpComponent::Retain(n) => *n,
            OpComponent::Characters(_) | OpComponent::ElementStart(..) | OpComponent::ElementEnd => 0,
            OpComponent::DeleteCharacters(s) => s.chars().count(),
            OpComponent::DeleteElementStart(..) | OpComponent::DeleteElementEnd => 1,
            OpComponent::ReplaceAttributes(..) | OpComponent::UpdateAttributes(_) => 1,
            OpComponent::AnnotationBoundary(_) => 0,
        }
    }

    /// Item count this component produces in the resulting document.
    pub fn post_len(&self) -> usize {
        match self {
            OpComponent::Retain(n) => *n,
            OpComponent::Characters(s) => s.chars().count(),
            OpComponent::ElementStart(..) | OpComponent::ElementEnd => 1,
            OpComponent::DeleteCharacters(_)
            | OpComponent::DeleteElementStart(..)
            | OpComponent::DeleteElementEnd => 0,
            OpComponent::ReplaceAttributes(..) | OpComponent::UpdateAttributes(_) => 1,
            OpComponent::AnnotationBoundary(_) => 0,
        }
    }
}

/// Consumes op components one callback at a time. The same interface replays
/// ops onto documents and accumulates them in builders, so anything that can
/// receive an op can also be fed component-by-component by a producer.
pub trait DocOpCursor {
    fn retain(&mut self, item_count: usize);
    fn characters(&mut self, chars: &str);
    fn delete_characters(&mut self, chars: &str);
    fn element_start(&mut self, tag: &str, attrs: &Attributes);
    fn element_end(&mut self);
    fn delete_element_start(&mut self, tag: &str, attrs: &Attributes);
    fn delete_element_end(&mut self);
    fn replace_attributes(&mut self, old: &Attributes, new: &Attributes);
    fn update_attributes(&mut self, update: &AttributesUpdate);
    fn annotation_boundary(&mut self, boundary: &AnnotationBoundary);
}

/// An immutable document operation. Once built it is shared freely and never
/// mutated; all transformation produces fresh ops.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DocOp {
    components: Box<[OpComponent]>,
}

impl DocOp {
    pub(crate) fn from_components(components: Vec<OpComponent>) -> Self {
        DocOp { components: components.into_boxed_slice() }
    }

    pub fn size(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn component(&self, i: usize) -> &OpComponent {
        &self.components[i]
    }

    pub fn components(&self) -> impl Iterator<Item = &OpComponent> {
        self.components.iter()
    }

    pub fn apply<C: DocOpCursor + ?Sized>(&self, cursor: &mut C) {
        for c in self.components.iter() {
            apply_component(c, cursor);
        }
    }

    pub fn apply_component<C: DocOpCursor + ?Sized>(&self, i: usize, cursor: &mut C) {
        apply_component(&self.components[i], cursor);
    }

    /// Number of items of the document this op applies to.
    pub fn initial_doc_length(&self) -> usize {
        self.components.iter().map(|c| c.pre_len()).sum()
    }

    /// Number of items of the document this op produces.
    pub fn resulting_doc_length(&self) -> usize {
        self.components.iter().map(|c| c.post_len()).sum()
    }

    /// True if the op only ever inserts: the form a document snapshot takes
    /// when shipped as an operation against the empty document.
    pub fn is_initialization(&self) -> bool {
        self.components.iter().all(|c| {
            matches!(
                c,
                OpComponent::Characters(_)
                    | OpComponent::ElementStart(..)
                    | OpComponent::ElementEnd
                    | OpComponent::AnnotationBoundary(_)
            )
        })
    }
}

pub fn apply_component<C: DocOpCursor + ?Sized>(c: &OpComponent, cursor: &mut C) {
    match c {
        OpComponent::Retain(n) => cursor.retain(*n),
        OpComponent::Characters(s) => cursor.characters(s),
        OpComponent::DeleteCharacters(s) => cursor.delete_characters(s),
        OpComponent::ElementStart(tag, attrs) => cursor.element_start(tag, attrs),
        OpComponent::ElementEnd => cursor.element_end(),
        OpComponent::DeleteElementStart(tag, attrs) => cursor.delete_element_start(tag, attrs),
        OpComponent::DeleteElementEnd => cursor.delete_element_end(),
        OpComponent::ReplaceAttributes(old, new) => cursor.replace_attributes(old, new),
        OpComponent::UpdateAttributes(update) => cursor.update_attributes(update),
        OpComponent::AnnotationBoundary(boundary) => cursor.annotation_boundary(boundary),
    }
}

impl Display for DocOp {
    /// The concise dump format, one `; `-terminated chunk per component:
    /// `__3; ++"abc"; << body {}; >>; --"x"; `.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use super::attributes::literal_string;
        for c in self.components.iter() {
            match c {
                OpComponent::Retain(n) => write!(f, "__{}; ", n)?,
                OpComponent::Characters(s) => write!(f, "++{}; ", literal_string(s))?,
                OpComponent::DeleteCharacters(s) => write!(f, "--{}; ", literal_string(s))?,
                OpComponent::ElementStart(tag, attrs) => write!(f, "<< {} {}; ", tag, attrs)?,
                OpComponent::ElementEnd => write!(f, ">>; ")?,
                OpComponent::DeleteElementStart(tag, attrs) => write!(f, "x< {} {}; ", tag, attrs)?,
                OpComponent::DeleteElementEnd => write!(f, "x>; ")?,
                OpComponent::ReplaceAttributes(old, new) => write!(f, "r@ {} {}; ", old, new)?,
                OpComponent::UpdateAttributes(update) => write!(f, "u@ {}; ", update)?,
                OpComponent::AnnotationBoundary(b) => write!(f, "|| {}; ", b)?,
            }
        }
        Ok(())
    }
}
