//! Validation of a candidate op against a document and a schema.
//!
//! The validator is a state machine walked in lock-step with the op's
//! components: it tracks the insertion stack, the deletion depth, the
//! running annotations update and the outstanding "required first child"
//! obligation, and checks every component against the document and the
//! schema before (conceptually) performing it.
//!
//! Validation *returns* its verdict - it never panics and never errors on
//! bad input. Ops from buggy or hostile clients are expected, and rejecting
//! them is a normal result, not exceptional control flow. Callers get the
//! merged [`ValidationResult`] plus the full [`ViolationCollector`] and
//! decide whether to reject, log, or attempt recovery.

use smartstring::alias::String as SmartString;

use crate::doc::Document;

use super::annotations::{AnnotationBoundary, AnnotationMap, AnnotationsUpdate};
use super::attributes::{Attributes, AttributesUpdate};
use super::builder::{is_valid_annotation_key, is_xml_name};
use super::components::{DocOp, OpComponent};

/// What kind of text content an element may directly contain.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PermittedChars {
    /// No text at all.
    None,
    /// Blip text: anything except control characters. Newlines are structure
    /// (line elements), not text.
    BlipText,
    /// Anything.
    Any,
}

/// Structural constraints on documents. A pure set of predicates; the
/// validator consults it, never the other way around.
///
/// `None` for a parent/enclosing tag means the top level of the document.
pub trait DocumentSchema {
    fn permits_child(&self, parent: Option<&str>, child: &str) -> bool;
    fn permits_attribute(&self, tag: &str, key: &str, value: &str) -> bool;
    fn permitted_chars(&self, tag: Option<&str>) -> PermittedChars;
    /// Elements the given element must start with, in order. At most one
    /// required child is supported.
    fn required_initial_children(&self, tag: Option<&str>) -> Vec<SmartString>;
}

/// The schema that permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchemaConstraints;

impl DocumentSchema for NoSchemaConstraints {
    fn permits_child(&self, _parent: Option<&str>, _child: &str) -> bool {
        true
    }
    fn permits_attribute(&self, _tag: &str, _key: &str, _value: &str) -> bool {
        true
    }
    fn permitted_chars(&self, _tag: Option<&str>) -> PermittedChars {
        PermittedChars::Any
    }
    fn required_initial_children(&self, _tag: Option<&str>) -> Vec<SmartString> {
        Vec::new()
    }
}

/// Overall verdict, ordered most severe first so that merging two results
/// is just `min`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ValidationResult {
    /// The component sequence is meaningless against *any* document: bad
    /// nesting, illegal values. Applying it is undefined.
    IllFormed,
    /// Well-formed, but asserts pre-state this document doesn't have.
    InvalidDocument,
    /// Well-formed and applicable, but the result would violate the schema.
    InvalidSchema,
    Valid,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        *self == ValidationResult::Valid
    }

    pub fn is_ill_formed(&self) -> bool {
        *self == ValidationResult::IllFormed
    }

    pub fn merge(self, other: ValidationResult) -> ValidationResult {
        self.min(other)
    }
}

/// One reason the op is not valid, with positions for diagnostics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Violation {
    pub result: ValidationResult,
    pub description: String,
    /// Position in the document the op applies to.
    pub original_pos: usize,
    /// Position in the document the op produces.
    pub resulting_pos: usize,
}

/// Accumulates violations; the merged result is the most severe one seen.
#[derive(Debug, Clone, Default)]
pub struct ViolationCollector {
    violations: Vec<Violation>,
}

impl ViolationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(&self) -> ValidationResult {
        self.violations
            .iter()
            .map(|v| v.result)
            .fold(ValidationResult::Valid, ValidationResult::merge)
    }

    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn first_description(&self) -> Option<&str> {
        self.violations.first().map(|v| v.description.as_str())
    }
}

enum DocSymbol {
    Character,
    Open,
    Close,
    End,
}

/// The validation state machine. `check_*` methods report whether a
/// transition is acceptable; `do_*` methods perform it. Ill-formed
/// transitions must not be performed; invalid ones may be, but the validity
/// of everything after them is undefined (the driver keeps walking to
/// collect further diagnostics anyway).
pub struct DocOpAutomaton<'a, S: DocumentSchema + ?Sized> {
    doc: &'a Document,
    schema: &'a S,

    effective_pos: usize,
    insertion_stack: Vec<SmartString>,
    next_required_element: Option<SmartString>,
    deletion_depth: usize,
    annotations_update: AnnotationsUpdate,
    after_annotation_boundary: bool,
    /// The annotation values deleted content is required to be restated
    /// against. `None` once the op has run off the end of the document.
    deletion_target_annotations: Option<AnnotationMap>,

    // Tracked only for diagnostics.
    resulting_pos: usize,
}

impl<'a, S: DocumentSchema + ?Sized> DocOpAutomaton<'a, S> {
    pub fn new(doc: &'a Document, schema: &'a S) -> Self {
        let next_required_element = required_first_child(schema, None);
        DocOpAutomaton {
            doc,
            schema,
            effective_pos: 0,
            insertion_stack: Vec::new(),
            next_required_element,
            deletion_depth: 0,
            annotations_update: AnnotationsUpdate::new(),
            after_annotation_boundary: false,
            deletion_target_annotations: Some(AnnotationMap::new()),
            resulting_pos: 0,
        }
    }

    fn ill_formed(&self, v: &mut ViolationCollector, description: String) -> ValidationResult {
        self.record(v, ValidationResult::IllFormed, description)
    }

    fn invalid(&self, v: &mut ViolationCollector, description: String) -> ValidationResult {
        self.record(v, ValidationResult::InvalidDocument, description)
    }

    fn schema_violation(&self, v: &mut ViolationCollector, description: String) -> ValidationResult {
        self.record(v, ValidationResult::InvalidSchema, description)
    }

    fn record(
        &self,
        v: &mut ViolationCollector,
        result: ValidationResult,
        description: String,
    ) -> ValidationResult {
        v.violations.push(Violation {
            result,
            description,
            original_pos: self.effective_pos,
            resulting_pos: self.resulting_pos,
        });
        result
    }

    // Primitive state readers.

    fn effective_doc_symbol(&self) -> DocSymbol {
        if self.effective_pos >= self.doc.len() {
            DocSymbol::End
        } else if self.doc.element_starting_at(self.effective_pos).is_some() {
            DocSymbol::Open
        } else if self.doc.element_ending_at(self.effective_pos).is_some() {
            DocSymbol::Close
        } else {
            DocSymbol::Character
        }
    }

    fn insertion_stack_is_empty(&self) -> bool {
        self.insertion_stack.is_empty()
    }

    fn deletion_stack_is_empty(&self) -> bool {
        self.deletion_depth == 0
    }

    /// The element enclosing the current position, counting any elements
    /// opened by the op itself. `None` at the top level.
    fn effective_enclosing_element_tag(&self) -> Option<SmartString> {
        if let Some(tag) = self.insertion_stack.last() {
            return Some(tag.clone());
        }
        if self.effective_pos > self.doc.len() {
            return None;
        }
        self.doc
            .nth_enclosing_element_tag(self.effective_pos, 0)
            .map(Into::into)
    }

    fn max_retain_item_count(&self) -> usize {
        self.doc.len().saturating_sub(self.effective_pos)
    }

    fn inherited_annotations(&self) -> AnnotationMap {
        if self.effective_pos == 0 || self.effective_pos > self.doc.len() {
            AnnotationMap::new()
        } else {
            self.doc.annotations_at(self.effective_pos - 1).clone()
        }
    }

    fn update_deletion_target_annotations(&mut self) {
        if self.effective_pos > self.doc.len() {
            self.deletion_target_annotations = None;
        } else {
            let mut target = self.inherited_annotations();
            self.annotations_update.apply_to(&mut target);
            self.deletion_target_annotations = Some(target);
        }
    }

    fn advance(&mut self, distance: usize) {
        // No bounds assertion here: the op may be deliberately invalid, and
        // the check methods have already recorded that.
        self.effective_pos += distance;
    }

    // Shared sub-checks.

    fn check_annotations_for_retain(
        &self,
        v: &mut ViolationCollector,
        item_count: usize,
    ) -> ValidationResult {
        for (key, old, _) in self.annotations_update.iter() {
            if let Some(first_change) = self.doc.first_annotation_change(
                self.effective_pos,
                self.effective_pos + item_count,
                key,
                old,
            ) {
                return self.invalid(
                    v,
                    format!(
                        "old annotations differ from document: purported old value for key {:?} \
                         is {:?}, actual value is {:?}",
                        key,
                        old,
                        self.doc.annotation(first_change, key)
                    ),
                );
            }
        }
        ValidationResult::Valid
    }

    fn check_annotations_for_insertion(&self, v: &mut ViolationCollector) -> ValidationResult {
        if self.effective_pos > self.doc.len() {
            // Already invalid; nothing sensible to check.
            return ValidationResult::Valid;
        }
        for (key, old, _) in self.annotations_update.iter() {
            let inherited = if self.effective_pos == 0 {
                None
            } else {
                self.doc.annotation(self.effective_pos - 1, key)
            };
            if old != inherited {
                return self.invalid(
                    v,
                    format!(
                        "old annotations differ from document: purported old value for key {:?} \
                         is {:?}, inherited value is {:?}",
                        key, old, inherited
                    ),
                );
            }
        }
        ValidationResult::Valid
    }

    fn check_annotations_for_deletion(
        &self,
        v: &mut ViolationCollector,
        item_count: usize,
    ) -> ValidationResult {
        let target = match &self.deletion_target_annotations {
            Some(target) => target,
            // Already invalid; nothing to check.
            None => return ValidationResult::Valid,
        };

        for (key, old, new) in self.annotations_update.iter() {
            if let Some(first_change) = self.doc.first_annotation_change(
                self.effective_pos,
                self.effective_pos + item_count,
                key,
                old,
            ) {
                return self.invalid(
                    v,
                    format!(
                        "old annotations differ from document: purported old value for key {:?} \
                         is {:?}, actual value is {:?}",
                        key,
                        old,
                        self.doc.annotation(first_change, key)
                    ),
                );
            }
            if new != target.get(key).map(|s| s.as_str()) {
                return self.invalid(v, "new annotation value incorrect for deletion".to_string());
            }
        }

        // A deletion only needs to restate annotations that differ from the
        // target map; every differing key must appear in the update. This
        // relative form is a size optimization inherited from the wire
        // format and is load-bearing for compatibility.
        for offset in 0..item_count {
            let pos = self.effective_pos + offset;
            if pos >= self.doc.len() {
                break;
            }
            let here = self.doc.annotations_at(pos);
            for key in here.keys().chain(target.keys()) {
                let in_doc = here.get(key);
                let required = target.get(key);
                if in_doc != required && !self.annotations_update.contains_key(key) {
                    return self.invalid(
                        v,
                        format!(
                            "deletion does not reset value for key {:?} from {:?} to {:?}",
                            key, in_doc, required
                        ),
                    );
                }
            }
        }
        ValidationResult::Valid
    }

    fn check_attrs_schema(
        &self,
        v: &mut ViolationCollector,
        tag: &str,
        attrs: &Attributes,
    ) -> ValidationResult {
        for (key, value) in attrs.iter() {
            if !self.schema.permits_attribute(tag, key, value) {
                return self.schema_violation(
                    v,
                    format!(
                        "type {:?} does not permit attribute {:?} with value {:?}",
                        tag, key, value
                    ),
                );
            }
        }
        ValidationResult::Valid
    }

    fn check_attr_names(&self, v: &mut ViolationCollector, attrs: &Attributes) -> ValidationResult {
        for (key, _) in attrs.iter() {
            if !is_xml_name(key) {
                return self.ill_formed(v, format!("attribute name is not an XML Name: {:?}", key));
            }
        }
        ValidationResult::Valid
    }

    fn check_insertion_before_required_child(&self, v: &mut ViolationCollector) -> ValidationResult {
        if self.effective_pos < self.doc.len() && self.insertion_stack_is_empty() {
            let parent = self.doc.nth_enclosing_element_tag(self.effective_pos, 0);
            let required = required_first_child(self.schema, parent);
            let is_first_child = self.effective_pos == 0
                || self.doc.element_starting_at(self.effective_pos - 1).is_some();
            if is_first_child && required.is_some() {
                return self
                    .schema_violation(v, "attempt to insert before required child".to_string());
            }
        }
        ValidationResult::Valid
    }

    // check/do pairs, one per component kind.

    pub fn check_retain(&self, item_count: usize, v: &mut ViolationCollector) -> ValidationResult {
        if item_count == 0 {
            return self.ill_formed(v, "retain item count not positive".to_string());
        }
        if !self.insertion_stack_is_empty() || !self.deletion_stack_is_empty() {
            return self.ill_formed(v, "retain inside insert or delete".to_string());
        }
        if item_count > self.max_retain_item_count() {
            return self.invalid(
                v,
                format!(
                    "retain past end of document, document length {}, retain item count {}",
                    self.doc.len(),
                    item_count
                ),
            );
        }
        self.check_annotations_for_retain(v, item_count)
    }

    pub fn do_retain(&mut self, item_count: usize) {
        self.advance(item_count);
        self.update_deletion_target_annotations();
        self.resulting_pos += item_count;
        self.after_annotation_boundary = false;
    }

    pub fn check_characters(&self, chars: &str, v: &mut ViolationCollector) -> ValidationResult {
        if chars.is_empty() {
            return self.ill_formed(v, "characters is empty".to_string());
        }
        if !self.deletion_stack_is_empty() {
            return self.ill_formed(v, "insertion inside deletion".to_string());
        }
        let r = self.check_annotations_for_insertion(v);
        if !r.is_valid() {
            return r;
        }
        if let Some(required) = &self.next_required_element {
            return self
                .schema_violation(v, format!("child element required, expected type {:?}", required));
        }
        let r = self.check_insertion_before_required_child(v);
        if !r.is_valid() {
            return r;
        }
        let enclosing = self.effective_enclosing_element_tag();
        match self.schema.permitted_chars(enclosing.as_deref()) {
            PermittedChars::None => self.schema_violation(
                v,
                format!("element type {:?} does not allow text content", enclosing),
            ),
            PermittedChars::BlipText => {
                if chars.chars().any(|c| c.is_control()) {
                    self.schema_violation(
                        v,
                        format!(
                            "element type {:?} only allows blip text content, not arbitrary \
                             characters",
                            enclosing
                        ),
                    )
                } else {
                    ValidationResult::Valid
                }
            }
            PermittedChars::Any => ValidationResult::Valid,
        }
    }

    pub fn do_characters(&mut self, chars: &str) {
        self.update_deletion_target_annotations();
        self.resulting_pos += chars.chars().count();
        self.after_annotation_boundary = false;
    }

    pub fn check_element_start(
        &self,
        tag: &str,
        attrs: &Attributes,
        v: &mut ViolationCollector,
    ) -> ValidationResult {
        if !is_xml_name(tag) {
            return self.ill_formed(v, format!("element type is not an XML Name: {:?}", tag));
        }
        let r = self.check_attr_names(v, attrs);
        if !r.is_valid() {
            return r;
        }
        if !self.deletion_stack_is_empty() {
            return self.ill_formed(v, "insertion inside deletion".to_string());
        }
        let r = self.check_annotations_for_insertion(v);
        if !r.is_valid() {
            return r;
        }
        let r = self.check_attrs_schema(v, tag, attrs);
        if !r.is_valid() {
            return r;
        }
        let parent = self.effective_enclosing_element_tag();
        if !self.schema.permits_child(parent.as_deref(), tag) {
            return match parent {
                None => self.schema_violation(
                    v,
                    format!("element type {:?} not permitted at top level", tag),
                ),
                Some(parent) => self.schema_violation(
                    v,
                    format!(
                        "element type {:?} does not permit subelement type {:?}",
                        parent, tag
                    ),
                ),
            };
        }
        let r = self.check_insertion_before_required_child(v);
        if !r.is_valid() {
            return r;
        }
        if let Some(required) = &self.next_required_element {
            if required != tag {
                return self.schema_violation(
                    v,
                    format!("element of type {:?} required, not {:?}", required, tag),
                );
            }
        }
        ValidationResult::Valid
    }

    pub fn do_element_start(&mut self, tag: &str, _attrs: &Attributes) {
        self.update_deletion_target_annotations();
        self.insertion_stack.push(tag.into());
        self.next_required_element = required_first_child(self.schema, Some(tag));
        self.resulting_pos += 1;
        self.after_annotation_boundary = false;
    }

    pub fn check_element_end(&self, v: &mut ViolationCollector) -> ValidationResult {
        if !self.deletion_stack_is_empty() {
            return self.ill_formed(v, "insertion inside deletion".to_string());
        }
        if self.insertion_stack_is_empty() {
            return self.ill_formed(v, "elementEnd with no matching elementStart".to_string());
        }
        let r = self.check_annotations_for_insertion(v);
        if !r.is_valid() {
            return r;
        }
        if let Some(required) = &self.next_required_element {
            return self
                .schema_violation(v, format!("child element required, expected type {:?}", required));
        }
        ValidationResult::Valid
    }

    pub fn do_element_end(&mut self) {
        self.update_deletion_target_annotations();
        self.insertion_stack.pop();
        self.resulting_pos += 1;
        self.after_annotation_boundary = false;
    }

    pub fn check_delete_characters(&self, chars: &str, v: &mut ViolationCollector) -> ValidationResult {
        if chars.is_empty() {
            return self.ill_formed(v, "delete characters is empty".to_string());
        }
        if !self.insertion_stack_is_empty() {
            return self.ill_formed(v, "deletion inside insertion".to_string());
        }
        for (offset, in_op) in chars.chars().enumerate() {
            match self.doc.char_at(self.effective_pos + offset) {
                None => {
                    return self.invalid(
                        v,
                        format!("cannot delete {} characters, only {} available", chars.chars().count(), offset),
                    );
                }
                Some(in_doc) if in_doc != in_op => {
                    return self.invalid(
                        v,
                        format!(
                            "attempt to delete character {:?} when the actual character is {:?}",
                            in_op, in_doc
                        ),
                    );
                }
                Some(_) => {}
            }
        }
        self.check_annotations_for_deletion(v, chars.chars().count())
    }

    pub fn do_delete_characters(&mut self, chars: &str) {
        self.advance(chars.chars().count());
        self.after_annotation_boundary = false;
    }

    pub fn check_delete_element_start(
        &self,
        tag: &str,
        attrs: &Attributes,
        v: &mut ViolationCollector,
    ) -> ValidationResult {
        if !is_xml_name(tag) {
            return self.ill_formed(v, format!("element type is not an XML Name: {:?}", tag));
        }
        let r = self.check_attr_names(v, attrs);
        if !r.is_valid() {
            return r;
        }
        if !self.insertion_stack_is_empty() {
            return self.ill_formed(v, "deletion inside insertion".to_string());
        }
        let (doc_tag, doc_attrs) = match self.doc.element_starting_at(self.effective_pos) {
            Some(found) => found,
            None => return self.invalid(v, "no element start to delete here".to_string()),
        };
        if doc_tag != tag {
            return self.invalid(v, "old element type differs from document".to_string());
        }
        if doc_attrs != attrs {
            return self.invalid(v, "old attributes differ from document".to_string());
        }
        let r = self.check_annotations_for_deletion(v, 1);
        if !r.is_valid() {
            return r;
        }
        if self.deletion_depth == 0 && self.effective_pos < self.doc.len() {
            let parent = self.doc.nth_enclosing_element_tag(self.effective_pos, 0);
            let required = required_first_child(self.schema, parent);
            let is_first_child = self.effective_pos == 0
                || self.doc.element_starting_at(self.effective_pos - 1).is_some();
            if is_first_child && required.is_some() {
                return self.schema_violation(v, "attempt to delete required child".to_string());
            }
        }
        ValidationResult::Valid
    }

    pub fn do_delete_element_start(&mut self, _tag: &str, _attrs: &Attributes) {
        self.deletion_depth += 1;
        self.advance(1);
        self.after_annotation_boundary = false;
    }

    pub fn check_delete_element_end(&self, v: &mut ViolationCollector) -> ValidationResult {
        if !self.insertion_stack_is_empty() {
            return self.ill_formed(v, "deletion inside insertion".to_string());
        }
        if self.deletion_stack_is_empty() {
            return self
                .ill_formed(v, "deleteElementEnd with no matching deleteElementStart".to_string());
        }
        if !matches!(self.effective_doc_symbol(), DocSymbol::Close) {
            return self.invalid(v, "no element end to delete here".to_string());
        }
        self.check_annotations_for_deletion(v, 1)
    }

    pub fn do_delete_element_end(&mut self) {
        self.deletion_depth -= 1;
        self.advance(1);
        self.after_annotation_boundary = false;
    }

    pub fn check_update_attributes(
        &self,
        update: &AttributesUpdate,
        v: &mut ViolationCollector,
    ) -> ValidationResult {
        for change in update.iter() {
            if !is_xml_name(&change.key) {
                return self
                    .ill_formed(v, format!("attribute name is not an XML Name: {:?}", change.key));
            }
        }
        if !self.insertion_stack_is_empty() || !self.deletion_stack_is_empty() {
            return self.ill_formed(v, "attribute change inside insert or delete".to_string());
        }
        let (tag, old_attrs) = match self.doc.element_starting_at(self.effective_pos) {
            Some(found) => found,
            None => return self.invalid(v, "no element start to change attributes here".to_string()),
        };
        for change in update.iter() {
            if old_attrs.get(&change.key) != change.old.as_deref() {
                return self.invalid(v, "old attributes differ from document".to_string());
            }
        }
        let r = self.check_annotations_for_retain(v, 1);
        if !r.is_valid() {
            return r;
        }
        for change in update.iter() {
            if let Some(value) = &change.new {
                if !self.schema.permits_attribute(tag, &change.key, value) {
                    return self.schema_violation(
                        v,
                        format!(
                            "type {:?} does not permit attribute {:?} with value {:?}",
                            tag, change.key, value
                        ),
                    );
                }
            }
        }
        ValidationResult::Valid
    }

    pub fn do_update_attributes(&mut self, _update: &AttributesUpdate) {
        self.advance(1);
        self.update_deletion_target_annotations();
        self.resulting_pos += 1;
        self.after_annotation_boundary = false;
    }

    pub fn check_replace_attributes(
        &self,
        old: &Attributes,
        new: &Attributes,
        v: &mut ViolationCollector,
    ) -> ValidationResult {
        let r = self.check_attr_names(v, old);
        if !r.is_valid() {
            return r;
        }
        let r = self.check_attr_names(v, new);
        if !r.is_valid() {
            return r;
        }
        if !self.insertion_stack_is_empty() || !self.deletion_stack_is_empty() {
            return self.ill_formed(v, "attribute change inside insert or delete".to_string());
        }
        let (tag, doc_attrs) = match self.doc.element_starting_at(self.effective_pos) {
            Some(found) => found,
            None => return self.invalid(v, "no element start to change attributes here".to_string()),
        };
        if doc_attrs != old {
            return self.invalid(v, "old attributes differ from document".to_string());
        }
        let r = self.check_annotations_for_retain(v, 1);
        if !r.is_valid() {
            return r;
        }
        self.check_attrs_schema(v, tag, new)
    }

    pub fn do_replace_attributes(&mut self, _old: &Attributes, _new: &Attributes) {
        self.advance(1);
        self.update_deletion_target_annotations();
        self.resulting_pos += 1;
        self.after_annotation_boundary = false;
    }

    pub fn check_annotation_boundary(
        &self,
        boundary: &AnnotationBoundary,
        v: &mut ViolationCollector,
    ) -> ValidationResult {
        if self.after_annotation_boundary {
            return self.ill_formed(v, "adjacent annotation boundaries".to_string());
        }
        for key in boundary.end_keys() {
            if !is_valid_annotation_key(key) {
                return self.ill_formed(v, format!("invalid character in annotation key: {:?}", key));
            }
            if !self.annotations_update.contains_key(key) {
                return self
                    .ill_formed(v, format!("annotation of key {:?} ends without having started", key));
            }
        }
        for change in boundary.changes() {
            if !is_valid_annotation_key(&change.key) {
                return self
                    .ill_formed(v, format!("invalid character in annotation key: {:?}", change.key));
            }
        }
        // Key ordering and end/change disjointness are construction
        // invariants of AnnotationBoundary, so there is nothing further to
        // check here.
        ValidationResult::Valid
    }

    pub fn do_annotation_boundary(&mut self, boundary: &AnnotationBoundary) {
        self.annotations_update.compose_with(boundary);
        self.after_annotation_boundary = true;
    }

    /// Whether ending the op here would leave everything balanced and the
    /// whole document consumed.
    pub fn check_finish(&self, v: &mut ViolationCollector) -> ValidationResult {
        if let Some(tag) = self.insertion_stack.first() {
            return self
                .ill_formed(v, format!("elementStart {:?} with no matching elementEnd", tag));
        }
        if !self.deletion_stack_is_empty() {
            return self
                .ill_formed(v, "deleteElementStart with no matching deleteElementEnd".to_string());
        }
        if let Some(key) = self.annotations_update.first_key() {
            return self.ill_formed(v, format!("annotation of key {:?} starts but never ends", key));
        }
        if self.effective_pos != self.doc.len() {
            return self.invalid(
                v,
                format!(
                    "operation shorter than document, document length {}, length of input of \
                     operation {}",
                    self.doc.len(),
                    self.effective_pos
                ),
            );
        }
        ValidationResult::Valid
    }
}

fn required_first_child<S: DocumentSchema + ?Sized>(
    schema: &S,
    tag: Option<&str>,
) -> Option<SmartString> {
    let mut list = schema.required_initial_children(tag);
    match list.len() {
        0 => None,
        1 => Some(list.remove(0)),
        _ => panic!("schema requires multiple initial children"),
    }
}

/// Walks the op through the automaton, collecting violations. The walk stops
/// at the first ill-formed component (performing one is undefined); merely
/// invalid components are performed so that later diagnostics stay useful.
pub fn validate<S: DocumentSchema + ?Sized>(
    op: &DocOp,
    doc: &Document,
    schema: &S,
) -> (ValidationResult, ViolationCollector) {
    let mut v = ViolationCollector::new();
    let mut a = DocOpAutomaton::new(doc, schema);

    for c in op.components() {
        let r = match c {
            OpComponent::Retain(n) => a.check_retain(*n, &mut v),
            OpComponent::Characters(s) => a.check_characters(s, &mut v),
            OpComponent::DeleteCharacters(s) => a.check_delete_characters(s, &mut v),
            OpComponent::ElementStart(tag, attrs) => a.check_element_start(tag, attrs, &mut v),
            OpComponent::ElementEnd => a.check_element_end(&mut v),
            OpComponent::DeleteElementStart(tag, attrs) => {
                a.check_delete_element_start(tag, attrs, &mut v)
            }
            OpComponent::DeleteElementEnd => a.check_delete_element_end(&mut v),
            OpComponent::ReplaceAttributes(old, new) => a.check_replace_attributes(old, new, &mut v),
            OpComponent::UpdateAttributes(update) => a.check_update_attributes(update, &mut v),
            OpComponent::AnnotationBoundary(boundary) => a.check_annotation_boundary(boundary, &mut v),
        };
        if r.is_ill_formed() {
            return (ValidationResult::IllFormed, v);
        }
        match c {
            OpComponent::Retain(n) => a.do_retain(*n),
            OpComponent::Characters(s) => a.do_characters(s),
            OpComponent::DeleteCharacters(s) => a.do_delete_characters(s),
            OpComponent::ElementStart(tag, attrs) => a.do_element_start(tag, attrs),
            OpComponent::ElementEnd => a.do_element_end(),
            OpComponent::DeleteElementStart(tag, attrs) => a.do_delete_element_start(tag, attrs),
            OpComponent::DeleteElementEnd => a.do_delete_element_end(),
            OpComponent::ReplaceAttributes(old, new) => a.do_replace_attributes(old, new),
            OpComponent::UpdateAttributes(update) => a.do_update_attributes(update),
            OpComponent::AnnotationBoundary(boundary) => a.do_annotation_boundary(boundary),
        }
    }
    a.check_finish(&mut v);
    (v.result(), v)
}
