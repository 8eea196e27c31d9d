//! The concrete document representation ops are validated against and
//! applied to.
//!
//! A document is a flat sequence of items - element starts, element ends and
//! single characters - plus one annotation map per item. The flat form is
//! what the op cursor protocol walks, so keeping the document in the same
//! shape makes validation and application a single lock-step pass. Tree
//! queries (enclosing tags, matching ends) are answered by scanning; blip
//! documents are small and the scans are bounded by nesting depth in
//! practice.

use std::fmt::{Display, Formatter};

use smartstring::alias::String as SmartString;

use crate::docop::{
    AnnotationMap, AnnotationsUpdate, Attributes, DocOp, OpComponent, UncheckedDocOpBuilder,
};

mod xml;

pub use xml::{document_from_xml, XmlParseError};

/// One item slot of a document.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DocItem {
    Open { tag: SmartString, attrs: Attributes },
    Close,
    Char(char),
}

/// A failure to apply an op to this particular document. The op was
/// well-formed but asserted pre-state the document doesn't have.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OpError {
    RetainPastEnd { doc_len: usize, attempted: usize },
    MissingRetainToEnd { doc_len: usize, consumed: usize },
    NotCharactersHere { pos: usize },
    DeletedCharacterMismatch { pos: usize, in_doc: char, in_op: char },
    NoElementStartHere { pos: usize },
    NoElementEndHere { pos: usize },
    DeletedElementMismatch { pos: usize },
    OldAttributesDiffer { pos: usize },
}

impl Display for OpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::RetainPastEnd { doc_len, attempted } => {
                write!(f, "retain past end of document (length {}, retained {})", doc_len, attempted)
            }
            OpError::MissingRetainToEnd { doc_len, consumed } => {
                write!(f, "op shorter than document (length {}, consumed {})", doc_len, consumed)
            }
            OpError::NotCharactersHere { pos } => {
                write!(f, "no characters to delete at position {}", pos)
            }
            OpError::DeletedCharacterMismatch { pos, in_doc, in_op } => write!(
                f,
                "attempt to delete character {:?} at position {} where document has {:?}",
                in_op, pos, in_doc
            ),
            OpError::NoElementStartHere { pos } => {
                write!(f, "no element start at position {}", pos)
            }
            OpError::NoElementEndHere { pos } => write!(f, "no element end at position {}", pos),
            OpError::DeletedElementMismatch { pos } => {
                write!(f, "deleted element differs from document at position {}", pos)
            }
            OpError::OldAttributesDiffer { pos } => {
                write!(f, "old attributes differ from document at position {}", pos)
            }
        }
    }
}

impl std::error::Error for OpError {}

/// A structured document: items plus per-item annotations.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Document {
    items: Vec<DocItem>,
    annotations: Vec<AnnotationMap>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Item count. Characters, element starts and element ends each occupy
    /// one slot.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, pos: usize) -> Option<&DocItem> {
        self.items.get(pos)
    }

    /// The tag of the element whose start occupies `pos`, if any.
    pub fn element_starting_at(&self, pos: usize) -> Option<(&str, &Attributes)> {
        match self.items.get(pos) {
            Some(DocItem::Open { tag, attrs }) => Some((tag.as_str(), attrs)),
            _ => None,
        }
    }

    /// The tag of the element whose end occupies `pos`, found by matching the
    /// close back to its open.
    pub fn element_ending_at(&self, pos: usize) -> Option<&str> {
        match self.items.get(pos) {
            Some(DocItem::Close) => {}
            _ => return None,
        }
        let mut depth = 0usize;
        for i in (0..pos).rev() {
            match &self.items[i] {
                DocItem::Close => depth += 1,
                DocItem::Open { tag, .. } => {
                    if depth == 0 {
                        return Some(tag.as_str());
                    }
                    depth -= 1;
                }
                DocItem::Char(_) => {}
            }
        }
        None
    }

    pub fn char_at(&self, pos: usize) -> Option<char> {
        match self.items.get(pos) {
            Some(DocItem::Char(c)) => Some(*c),
            _ => None,
        }
    }

    /// The tag of the element enclosing the insertion point `pos`, `depth`
    /// levels up (0 = innermost). `None` means the top level.
    pub fn nth_enclosing_element_tag(&self, pos: usize, mut depth: usize) -> Option<&str> {
        let mut skip = 0usize;
        for i in (0..pos.min(self.items.len())).rev() {
            match &self.items[i] {
                DocItem::Close => skip += 1,
                DocItem::Open { tag, .. } => {
                    if skip > 0 {
                        skip -= 1;
                    } else if depth == 0 {
                        return Some(tag.as_str());
                    } else {
                        depth -= 1;
                    }
                }
                DocItem::Char(_) => {}
            }
        }
        None
    }

    /// Number of consecutive character items starting at `pos` before the
    /// next structural item.
    pub fn remaining_characters_in_element(&self, pos: usize) -> usize {
        self.items[pos.min(self.items.len())..]
            .iter()
            .take_while(|i| matches!(i, DocItem::Char(_)))
            .count()
    }

    pub fn annotations_at(&self, pos: usize) -> &AnnotationMap {
        static EMPTY: AnnotationMap = AnnotationMap::new();
        self.annotations.get(pos).unwrap_or(&EMPTY)
    }

    pub fn annotation(&self, pos: usize, key: &str) -> Option<&str> {
        self.annotations_at(pos).get(key).map(|v| v.as_str())
    }

    /// First position in `start..end` where the annotation for `key` differs
    /// from `from`, or `None` if the whole range matches.
    pub fn first_annotation_change(
        &self,
        start: usize,
        end: usize,
        key: &str,
        from: Option<&str>,
    ) -> Option<usize> {
        (start..end.min(self.items.len())).find(|&pos| self.annotation(pos, key) != from)
    }

    /// Applies an op, strictly checking every asserted pre-state. On error
    /// the document is unchanged.
    pub fn apply(&mut self, op: &DocOp) -> Result<(), OpError> {
        let mut pos = 0usize;
        let mut out_items: Vec<DocItem> = Vec::with_capacity(op.resulting_doc_length());
        let mut out_annotations: Vec<AnnotationMap> = Vec::with_capacity(out_items.capacity());
        let mut update = AnnotationsUpdate::new();

        // Annotations inherited by content inserted at the current position:
        // whatever the left neighbour in the pre-application document holds.
        let inherited = |pos: usize| -> AnnotationMap {
            if pos == 0 {
                AnnotationMap::new()
            } else {
                self.annotations_at(pos - 1).clone()
            }
        };

        for c in op.components() {
            match c {
                OpComponent::Retain(n) => {
                    if pos + n > self.items.len() {
                        return Err(OpError::RetainPastEnd { doc_len: self.items.len(), attempted: *n });
                    }
                    for _ in 0..*n {
                        let mut anns = self.annotations[pos].clone();
                        update.apply_to(&mut anns);
                        out_items.push(self.items[pos].clone());
                        out_annotations.push(anns);
                        pos += 1;
                    }
                }
                OpComponent::Characters(s) => {
                    let mut anns = inherited(pos);
                    update.apply_to(&mut anns);
                    for ch in s.chars() {
                        out_items.push(DocItem::Char(ch));
                        out_annotations.push(anns.clone());
                    }
                }
                OpComponent::DeleteCharacters(s) => {
                    for ch in s.chars() {
                        match self.items.get(pos) {
                            Some(DocItem::Char(in_doc)) => {
                                if *in_doc != ch {
                                    return Err(OpError::DeletedCharacterMismatch {
                                        pos,
                                        in_doc: *in_doc,
                                        in_op: ch,
                                    });
                                }
                            }
                            _ => return Err(OpError::NotCharactersHere { pos }),
                        }
                        pos += 1;
                    }
                }
                OpComponent::ElementStart(tag, attrs) => {
                    let mut anns = inherited(pos);
                    update.apply_to(&mut anns);
                    out_items.push(DocItem::Open { tag: tag.clone(), attrs: attrs.clone() });
                    out_annotations.push(anns);
                }
                OpComponent::ElementEnd => {
                    let mut anns = inherited(pos);
                    update.apply_to(&mut anns);
                    out_items.push(DocItem::Close);
                    out_annotations.push(anns);
                }
                OpComponent::DeleteElementStart(tag, attrs) => {
                    match self.items.get(pos) {
                        Some(DocItem::Open { tag: t, attrs: a }) => {
                            if t != tag || a != attrs {
                                return Err(OpError::DeletedElementMismatch { pos });
                            }
                        }
                        _ => return Err(OpError::NoElementStartHere { pos }),
                    }
                    pos += 1;
                }
                OpComponent::DeleteElementEnd => {
                    match self.items.get(pos) {
                        Some(DocItem::Close) => {}
                        _ => return Err(OpError::NoElementEndHere { pos }),
                    }
                    pos += 1;
                }
                OpComponent::ReplaceAttributes(old, new) => {
                    let (tag, actual) = match self.items.get(pos) {
                        Some(DocItem::Open { tag, attrs }) => (tag.clone(), attrs),
                        _ => return Err(OpError::NoElementStartHere { pos }),
                    };
                    if actual != old {
                        return Err(OpError::OldAttributesDiffer { pos });
                    }
                    let mut anns = self.annotations[pos].clone();
                    update.apply_to(&mut anns);
                    out_items.push(DocItem::Open { tag, attrs: new.clone() });
                    out_annotations.push(anns);
                    pos += 1;
                }
                OpComponent::UpdateAttributes(u) => {
                    let (tag, actual) = match self.items.get(pos) {
                        Some(DocItem::Open { tag, attrs }) => (tag.clone(), attrs.clone()),
                        _ => return Err(OpError::NoElementStartHere { pos }),
                    };
                    for change in u.iter() {
                        if actual.get(&change.key) != change.old.as_deref() {
                            return Err(OpError::OldAttributesDiffer { pos });
                        }
                    }
                    let mut anns = self.annotations[pos].clone();
                    update.apply_to(&mut anns);
                    out_items.push(DocItem::Open { tag, attrs: actual.updated_with(u) });
                    out_annotations.push(anns);
                    pos += 1;
                }
                OpComponent::AnnotationBoundary(boundary) => {
                    update.compose_with(boundary);
                }
            }
        }

        if pos != self.items.len() {
            return Err(OpError::MissingRetainToEnd { doc_len: self.items.len(), consumed: pos });
        }

        self.items = out_items;
        self.annotations = out_annotations;
        Ok(())
    }

    /// The insert-only op that builds this document from empty, annotation
    /// boundaries included. Replaying it onto `Document::new()` reproduces
    /// the document exactly.
    pub fn to_initialization(&self) -> DocOp {
        let mut b = UncheckedDocOpBuilder::new();
        let mut active = AnnotationMap::new();
        let mut chars = SmartString::new();

        for (pos, item) in self.items.iter().enumerate() {
            let here = &self.annotations[pos];
            if here != &active {
                if !chars.is_empty() {
                    b = b.component(OpComponent::Characters(std::mem::take(&mut chars)));
                }
                b = b.component(OpComponent::AnnotationBoundary(xml::annotation_diff(
                    &active, here,
                )));
                active = here.clone();
            }
            match item {
                DocItem::Char(c) => chars.push(*c),
                DocItem::Open { tag, attrs } => {
                    if !chars.is_empty() {
                        b = b.component(OpComponent::Characters(std::mem::take(&mut chars)));
                    }
                    b = b.component(OpComponent::ElementStart(tag.clone(), attrs.clone()));
                }
                DocItem::Close => {
                    if !chars.is_empty() {
                        b = b.component(OpComponent::Characters(std::mem::take(&mut chars)));
                    }
                    b = b.component(OpComponent::ElementEnd);
                }
            }
        }
        if !chars.is_empty() {
            b = b.component(OpComponent::Characters(chars));
        }
        if !active.is_empty() {
            b = b.component(OpComponent::AnnotationBoundary(xml::annotation_close(&active)));
        }
        b.build()
    }

    /// Canonical XML rendering; see [`xml`] for the exact format. Equal
    /// documents render to equal strings, so this doubles as a cheap equality
    /// fingerprint in tests and logs.
    pub fn to_xml_string(&self) -> String {
        xml::to_xml_string(self)
    }

    pub(crate) fn items(&self) -> &[DocItem] {
        &self.items
    }

    pub(crate) fn push_item(&mut self, item: DocItem, annotations: AnnotationMap) {
        self.items.push(item);
        self.annotations.push(annotations);
    }
}

impl Display for Document {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_xml_string())
    }
}
