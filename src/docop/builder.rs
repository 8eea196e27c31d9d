//! Op builders and the structural well-formedness check.
//!
//! Well-formedness is the document-independent half of validity: balanced
//! element starts/ends, no inserts inside deletes, positive retains, no
//! adjacent annotation boundaries, annotations that end having started. The
//! checked builder refuses to produce an ill-formed op; whether the op then
//! *fits a particular document* is the validator's job.

use std::fmt::{Display, Formatter};

use smallvec::SmallVec;
use smartstring::alias::String as SmartString;

use super::annotations::AnnotationBoundary;
use super::attributes::{Attributes, AttributesUpdate};
use super::components::{DocOp, OpComponent};

/// A structural defect that makes an op meaningless against any document.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IllFormed {
    pub description: String,
    /// Index of the offending component, or the component count for defects
    /// only visible at the end (unclosed elements, unended annotations).
    pub component_index: usize,
}

impl Display for IllFormed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ill-formed op: {} (component {})", self.description, self.component_index)
    }
}

impl std::error::Error for IllFormed {}

pub(crate) fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Annotation keys are slash-separated paths; `?` and `@` are reserved by the
/// canonical text form.
pub(crate) fn is_valid_annotation_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('?') && !key.contains('@')
}

struct WellFormednessChecker {
    insertion_stack: SmallVec<[SmartString; 4]>,
    deletion_depth: usize,
    open_annotations: SmallVec<[SmartString; 2]>,
    after_boundary: bool,
}

impl WellFormednessChecker {
    fn new() -> Self {
        WellFormednessChecker {
            insertion_stack: SmallVec::new(),
            deletion_depth: 0,
            open_annotations: SmallVec::new(),
            after_boundary: false,
        }
    }

    fn check_attrs(&self, attrs: &Attributes) -> Result<(), String> {
        for (key, _) in attrs.iter() {
            if !is_xml_name(key) {
                return Err(format!("attribute name is not an XML Name: {:?}", key));
            }
        }
        Ok(())
    }

    fn step(&mut self, c: &OpComponent) -> Result<(), String> {
        let was_after_boundary = self.after_boundary;
        self.after_boundary = false;
        match c {
            OpComponent::Retain(n) => {
                if *n == 0 {
                    return Err("retain item count not positive".into());
                }
                if !self.insertion_stack.is_empty() || self.deletion_depth > 0 {
                    return Err("retain inside insert or delete".into());
                }
            }
            OpComponent::Characters(s) => {
                if s.is_empty() {
                    return Err("characters is empty".into());
                }
                if self.deletion_depth > 0 {
                    return Err("insertion inside deletion".into());
                }
            }
            OpComponent::DeleteCharacters(s) => {
                if s.is_empty() {
                    return Err("delete characters is empty".into());
                }
                if !self.insertion_stack.is_empty() {
                    return Err("deletion inside insertion".into());
                }
            }
            OpComponent::ElementStart(tag, attrs) => {
                if !is_xml_name(tag) {
                    return Err(format!("element type is not an XML Name: {:?}", tag));
                }
                self.check_attrs(attrs)?;
                if self.deletion_depth > 0 {
                    return Err("insertion inside deletion".into());
                }
                self.insertion_stack.push(tag.clone());
            }
            OpComponent::ElementEnd => {
                if self.deletion_depth > 0 {
                    return Err("insertion inside deletion".into());
                }
                if self.insertion_stack.pop().is_none() {
                    return Err("elementEnd with no matching elementStart".into());
                }
            }
            OpComponent::DeleteElementStart(tag, attrs) => {
                if !is_xml_name(tag) {
                    return Err(format!("element type is not an XML Name: {:?}", tag));
                }
                self.check_attrs(attrs)?;
                if !self.insertion_stack.is_empty() {
                    return Err("deletion inside insertion".into());
                }
                self.deletion_depth += 1;
            }
            OpComponent::DeleteElementEnd => {
                if !self.insertion_stack.is_empty() {
                    return Err("deletion inside insertion".into());
                }
                if self.deletion_depth == 0 {
                    return Err("deleteElementEnd with no matching deleteElementStart".into());
                }
                self.deletion_depth -= 1;
            }
            OpComponent::ReplaceAttributes(old, new) => {
                self.check_attrs(old)?;
                self.check_attrs(new)?;
                if !self.insertion_stack.is_empty() || self.deletion_depth > 0 {
                    return Err("attribute change inside insert or delete".into());
                }
            }
            OpComponent::UpdateAttributes(update) => {
                for change in update.iter() {
                    if !is_xml_name(&change.key) {
                        return Err(format!("attribute name is not an XML Name: {:?}", change.key));
                    }
                }
                if !self.insertion_stack.is_empty() || self.deletion_depth > 0 {
                    return Err("attribute change inside insert or delete".into());
                }
            }
            OpComponent::AnnotationBoundary(boundary) => {
                if was_after_boundary {
                    return Err("adjacent annotation boundaries".into());
                }
                for key in boundary.end_keys() {
                    if !is_valid_annotation_key(key) {
                        return Err(format!("invalid character in annotation key: {:?}", key));
                    }
                    match self.open_annotations.iter().position(|k| k == key) {
                        Some(i) => {
                            self.open_annotations.remove(i);
                        }
                        None => {
                            return Err(format!(
                                "annotation of key {:?} ends without having started",
                                key
                            ));
                        }
                    }
                }
                for change in boundary.changes() {
                    if !is_valid_annotation_key(&change.key) {
                        return Err(format!(
                            "invalid character in annotation key: {:?}",
                            change.key
                        ));
                    }
                    if !self.open_annotations.iter().any(|k| k == &change.key) {
                        self.open_annotations.push(change.key.clone());
                    }
                }
                self.after_boundary = true;
            }
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), String> {
        if let Some(tag) = self.insertion_stack.first() {
            return Err(format!("elementStart {:?} with no matching elementEnd", tag));
        }
        if self.deletion_depth > 0 {
            return Err("deleteElementStart with no matching deleteElementEnd".into());
        }
        if let Some(key) = self.open_annotations.first() {
            return Err(format!("annotation of key {:?} starts but never ends", key));
        }
        Ok(())
    }
}

pub fn check_well_formed(components: &[OpComponent]) -> Result<(), IllFormed> {
    let mut checker = WellFormednessChecker::new();
    for (i, c) in components.iter().enumerate() {
        checker
            .step(c)
            .map_err(|description| IllFormed { description, component_index: i })?;
    }
    checker
        .finish()
        .map_err(|description| IllFormed { description, component_index: components.len() })
}

/// Checked builder: accumulates components, verifies well-formedness on
/// `build`. The component methods mirror [`DocOpCursor`](super::DocOpCursor)
/// so producers can drive either one.
#[derive(Debug, Default)]
pub struct DocOpBuilder {
    components: Vec<OpComponent>,
}

impl DocOpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(mut self, item_count: usize) -> Self {
        self.components.push(OpComponent::Retain(item_count));
        self
    }

    pub fn characters(mut self, chars: &str) -> Self {
        self.components.push(OpComponent::Characters(chars.into()));
        self
    }

    pub fn delete_characters(mut self, chars: &str) -> Self {
        self.components.push(OpComponent::DeleteCharacters(chars.into()));
        self
    }

    pub fn element_start(mut self, tag: &str, attrs: Attributes) -> Self {
        self.components.push(OpComponent::ElementStart(tag.into(), attrs));
        self
    }

    pub fn element_end(mut self) -> Self {
        self.components.push(OpComponent::ElementEnd);
        self
    }

    pub fn delete_element_start(mut self, tag: &str, attrs: Attributes) -> Self {
        self.components.push(OpComponent::DeleteElementStart(tag.into(), attrs));
        self
    }

    pub fn delete_element_end(mut self) -> Self {
        self.components.push(OpComponent::DeleteElementEnd);
        self
    }

    pub fn replace_attributes(mut self, old: Attributes, new: Attributes) -> Self {
        self.components.push(OpComponent::ReplaceAttributes(old, new));
        self
    }

    pub fn update_attributes(mut self, update: AttributesUpdate) -> Self {
        self.components.push(OpComponent::UpdateAttributes(update));
        self
    }

    pub fn annotation_boundary(mut self, boundary: AnnotationBoundary) -> Self {
        self.components.push(OpComponent::AnnotationBoundary(boundary));
        self
    }

    pub fn component(mut self, c: OpComponent) -> Self {
        self.components.push(c);
        self
    }

    pub fn build(self) -> Result<DocOp, IllFormed> {
        check_well_formed(&self.components)?;
        Ok(DocOp::from_components(self.components))
    }
}

/// Skips the well-formedness check. For hot paths where the input is known
/// good, and for tests that need to construct deliberately broken ops.
#[derive(Debug, Default)]
pub struct UncheckedDocOpBuilder {
    components: Vec<OpComponent>,
}

impl UncheckedDocOpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component(mut self, c: OpComponent) -> Self {
        self.components.push(c);
        self
    }

    pub fn build(self) -> DocOp {
        DocOp::from_components(self.components)
    }
}

#[cfg(test)]
mod tests {
    use super::super::annotations::AnnotationBoundaryBuilder;
    use super::*;

    #[test]
    fn balanced_op_builds() {
        let op = DocOpBuilder::new()
            .element_start("body", Attributes::new())
            .characters("hello")
            .element_end()
            .build()
            .unwrap();
        assert_eq!(op.size(), 3);
    }

    #[test]
    fn unbalanced_end_is_rejected() {
        let err = DocOpBuilder::new().element_end().build().unwrap_err();
        assert!(err.description.contains("no matching elementStart"), "{}", err);
    }

    #[test]
    fn unclosed_start_is_rejected() {
        let err = DocOpBuilder::new()
            .element_start("p", Attributes::new())
            .build()
            .unwrap_err();
        assert!(err.description.contains("no matching elementEnd"), "{}", err);
        assert_eq!(err.component_index, 1);
    }

    #[test]
    fn insert_inside_delete_is_rejected() {
        let err = DocOpBuilder::new()
            .delete_element_start("p", Attributes::new())
            .characters("x")
            .delete_element_end()
            .build()
            .unwrap_err();
        assert!(err.description.contains("insertion inside deletion"), "{}", err);
    }

    #[test]
    fn zero_retain_is_rejected() {
        assert!(DocOpBuilder::new().retain(0).build().is_err());
    }

    #[test]
    fn annotation_lifecycle() {
        // Ends must match an open change, and open changes must be closed.
        let open = AnnotationBoundaryBuilder::new()
            .change("style/b", None, Some("bold"))
            .build()
            .unwrap();
        let close = AnnotationBoundaryBuilder::new().end("style/b").build().unwrap();

        assert!(DocOpBuilder::new()
            .annotation_boundary(open.clone())
            .retain(2)
            .annotation_boundary(close.clone())
            .build()
            .is_ok());

        let unended = DocOpBuilder::new()
            .annotation_boundary(open.clone())
            .retain(2)
            .build()
            .unwrap_err();
        assert!(unended.description.contains("starts but never ends"), "{}", unended);

        let unstarted = DocOpBuilder::new()
            .retain(2)
            .annotation_boundary(close)
            .build()
            .unwrap_err();
        assert!(unstarted.description.contains("without having started"), "{}", unstarted);

        // Boundaries may not be adjacent; they should have been merged.
        let adjacent = DocOpBuilder::new()
            .annotation_boundary(open.clone())
            .annotation_boundary(open)
            .build()
            .unwrap_err();
        assert!(adjacent.description.contains("adjacent annotation boundaries"), "{}", adjacent);
    }
}
