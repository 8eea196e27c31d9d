//! Composition of sequential ops.
//!
//! `compose(a, b)` produces the single op equivalent to applying `a` and
//! then `b`. The engine is a two-sided state machine: *pre* states consume
//! components of `a`, *post* states consume components of `b`, and an
//! outstanding partially-consumed component (a retain, an insertion, a
//! pending attribute change) is the state that flips the machine between
//! sides. Insertions of `a` cancel against deletions of `b`; attribute
//! changes fuse; annotation boundaries are queued per side and rewritten
//! against the other side's active annotations before they reach the output
//! normalizer.
//!
//! The composed op is byte-identical (after normalization) to what the two
//! ops produce applied in sequence - that equivalence is what lets the
//! synchronization layer batch local edits into one delta op.

use std::collections::BTreeMap;

use smartstring::alias::String as SmartString;

use super::annotations::{AnnotationBoundary, AnnotationBoundaryBuilder};
use super::attributes::{Attributes, AttributesUpdate};
use super::builder::check_well_formed;
use super::components::{DocOp, DocOpCursor, OpComponent};
use super::normalize::OpNormalizer;

/// The two ops cannot be sequentially applied: `b` does not fit the document
/// `a` produces.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ComposeError {
    pub description: String,
}

impl std::fmt::Display for ComposeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal composition: {}", self.description)
    }
}

impl std::error::Error for ComposeError {}

fn illegal<T>(what: &str) -> Result<T, ComposeError> {
    Err(ComposeError { description: what.to_string() })
}

/// Splits `s` after `n` characters (not bytes).
fn split_chars(s: &str, n: usize) -> (&str, &str) {
    match s.char_indices().nth(n) {
        Some((byte, _)) => s.split_at(byte),
        None => (s, ""),
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// The outstanding half-consumed component, if any. Pre states feed on the
/// first op, post states on the second.
#[derive(Debug)]
enum Target {
    DefaultPre,
    /// Remainder of a retain from the second op, consuming first-op output.
    RetainPre(usize),
    /// Remainder of a delete-characters from the second op.
    DeleteCharsPre(SmartString),
    /// Remainder of a retain from the first op, consuming second-op input.
    RetainPost(usize),
    /// Remainder of characters inserted by the first op.
    CharsPost(SmartString),
    ElementStartPost(SmartString, Attributes),
    ElementEndPost,
    ReplaceAttributesPost(Attributes, Attributes),
    UpdateAttributesPost(AttributesUpdate),
    /// The first op is exhausted; only insertions of the second op remain.
    FinisherPost,
}

impl Target {
    fn is_post(&self) -> bool {
        matches!(
            self,
            Target::RetainPost(_)
                | Target::CharsPost(_)
                | Target::ElementStartPost(..)
                | Target::ElementEndPost
                | Target::ReplaceAttributesPost(..)
                | Target::UpdateAttributesPost(_)
                | Target::FinisherPost
        )
    }
}

struct Composer {
    normalizer: OpNormalizer,
    /// Active annotation changes of the first op: key -> (old, new).
    pre_annotations: BTreeMap<SmartString, (Option<SmartString>, Option<SmartString>)>,
    /// Active annotation changes of the second op.
    post_annotations: BTreeMap<SmartString, (Option<SmartString>, Option<SmartString>)>,
    pre_queue: Vec<AnnotationBoundary>,
    post_queue: Vec<AnnotationBoundary>,
    target: Target,
}

impl Composer {
    fn new() -> Self {
        Composer {
            normalizer: OpNormalizer::new(),
            pre_annotations: BTreeMap::new(),
            post_annotations: BTreeMap::new(),
            pre_queue: Vec::new(),
            post_queue: Vec::new(),
            target: Target::DefaultPre,
        }
    }

    /// Emits a queued first-op boundary, rewritten against the second op's
    /// active annotations: an end while the other side still writes the key
    /// becomes a restatement of the other side's change, and a change's new
    /// value is overridden by the other side's.
    fn flush_pre_queue(&mut self) {
        for map in std::mem::take(&mut self.pre_queue) {
            let mut b = AnnotationBoundaryBuilder::new();
            for key in map.end_keys() {
                match self.post_annotations.get(key) {
                    Some((old, new)) => {
                        b = b.change(key, old.as_deref(), new.as_deref());
                    }
                    None => {
                        b = b.end(key);
                    }
                }
                self.pre_annotations.remove(key);
            }
            for change in map.changes() {
                let new = match self.post_annotations.get(change.key.as_str()) {
                    Some((_, post_new)) => post_new.as_deref(),
                    None => change.new.as_deref(),
                };
                b = b.change(&change.key, change.old.as_deref(), new);
                self.pre_annotations
                    .insert(change.key.clone(), (change.old.clone(), change.new.clone()));
            }
            self.normalizer.annotation_boundary(&b.build().unwrap());
        }
    }

    fn flush_post_queue(&mut self) {
        for map in std::mem::take(&mut self.post_queue) {
            let mut b = AnnotationBoundaryBuilder::new();
            for key in map.end_keys() {
                match self.pre_annotations.get(key) {
                    Some((old, new)) => {
                        b = b.change(key, old.as_deref(), new.as_deref());
                    }
                    None => {
                        b = b.end(key);
                    }
                }
                self.post_annotations.remove(key);
            }
            for change in map.changes() {
                let old = match self.pre_annotations.get(change.key.as_str()) {
                    Some((pre_old, _)) => pre_old.as_deref(),
                    None => change.old.as_deref(),
                };
                b = b.change(&change.key, old, change.new.as_deref());
                self.post_annotations
                    .insert(change.key.clone(), (change.old.clone(), change.new.clone()));
            }
            self.normalizer.annotation_boundary(&b.build().unwrap());
        }
    }

    fn flush_annotations(&mut self) {
        self.flush_pre_queue();
        self.flush_post_queue();
    }

    /// Feeds one component of the first op. Only called in a pre state.
    fn consume_pre(&mut self, c: &OpComponent) -> Result<(), ComposeError> {
        // Deletions of the first op pass straight through, whatever the
        // specific pre state; so do queued annotation boundaries.
        match c {
            OpComponent::DeleteCharacters(s) => {
                self.flush_pre_queue();
                self.normalizer.delete_characters(s);
                return Ok(());
            }
            OpComponent::DeleteElementStart(tag, attrs) => {
                self.flush_pre_queue();
                self.normalizer.delete_element_start(tag, attrs);
                return Ok(());
            }
            OpComponent::DeleteElementEnd => {
                self.flush_pre_queue();
                self.normalizer.delete_element_end();
                return Ok(());
            }
            OpComponent::AnnotationBoundary(b) => {
                self.pre_queue.push(b.clone());
                return Ok(());
            }
            _ => {}
        }

        match std::mem::replace(&mut self.target, Target::DefaultPre) {
            Target::DefaultPre => {
                self.target = match c {
                    OpComponent::Retain(n) => Target::RetainPost(*n),
                    OpComponent::Characters(s) => Target::CharsPost(s.clone()),
                    OpComponent::ElementStart(tag, attrs) => {
                        Target::ElementStartPost(tag.clone(), attrs.clone())
                    }
                    OpComponent::ElementEnd => Target::ElementEndPost,
                    OpComponent::ReplaceAttributes(old, new) => {
                        Target::ReplaceAttributesPost(old.clone(), new.clone())
                    }
                    OpComponent::UpdateAttributes(u) => Target::UpdateAttributesPost(u.clone()),
                    _ => unreachable!(),
                };
            }
            Target::RetainPre(rem) => {
                self.flush_annotations();
                match c {
                    OpComponent::Retain(n) => {
                        if *n <= rem {
                            self.normalizer.retain(*n);
                            self.cancel_retain_pre(rem, *n);
                        } else {
                            self.normalizer.retain(rem);
                            self.target = Target::RetainPost(n - rem);
                        }
                    }
                    OpComponent::Characters(s) => {
                        let len = char_len(s);
                        if len <= rem {
                            self.normalizer.characters(s);
                            self.cancel_retain_pre(rem, len);
                        } else {
                            let (head, tail) = split_chars(s, rem);
                            self.normalizer.characters(head);
                            self.target = Target::CharsPost(tail.into());
                        }
                    }
                    OpComponent::ElementStart(tag, attrs) => {
                        self.normalizer.element_start(tag, attrs);
                        self.cancel_retain_pre(rem, 1);
                    }
                    OpComponent::ElementEnd => {
                        self.normalizer.element_end();
                        self.cancel_retain_pre(rem, 1);
                    }
                    OpComponent::ReplaceAttributes(old, new) => {
                        self.normalizer.replace_attributes(old, new);
                        self.cancel_retain_pre(rem, 1);
                    }
                    OpComponent::UpdateAttributes(u) => {
                        self.normalizer.update_attributes(u);
                        self.cancel_retain_pre(rem, 1);
                    }
                    _ => unreachable!(),
                }
            }
            Target::DeleteCharsPre(chars) => {
                self.flush_annotations();
                match c {
                    OpComponent::Retain(n) => {
                        let len = char_len(&chars);
                        if *n <= len {
                            let (head, tail) = split_chars(&chars, *n);
                            self.normalizer.delete_characters(head);
                            if !tail.is_empty() {
                                self.target = Target::DeleteCharsPre(tail.into());
                            }
                        } else {
                            self.normalizer.delete_characters(&chars);
                            self.target = Target::RetainPost(n - len);
                        }
                    }
                    OpComponent::Characters(s) => {
                        // Content inserted by the first op and deleted by the
                        // second cancels without reaching the output.
                        let ins = char_len(s);
                        let del = char_len(&chars);
                        if ins <= del {
                            let (_, tail) = split_chars(&chars, ins);
                            if !tail.is_empty() {
                                self.target = Target::DeleteCharsPre(tail.into());
                            }
                        } else {
                            let (_, tail) = split_chars(s, del);
                            self.target = Target::CharsPost(tail.into());
                        }
                    }
                    _ => return illegal("structural component against pending character deletion"),
                }
            }
            post => {
                // Pre components are never fed while a post state is active.
                self.target = post;
                unreachable!("pre component fed to post state");
            }
        }
        Ok(())
    }

    fn cancel_retain_pre(&mut self, rem: usize, consumed: usize) {
        if consumed < rem {
            self.target = Target::RetainPre(rem - consumed);
        }
    }

    /// Feeds one component of the second op. Only called in a post state.
    fn consume_post(&mut self, c: &OpComponent) -> Result<(), ComposeError> {
        // Insertions of the second op pass straight through.
        match c {
            OpComponent::Characters(s) => {
                self.flush_post_queue();
                self.normalizer.characters(s);
                return Ok(());
            }
            OpComponent::ElementStart(tag, attrs) => {
                self.flush_post_queue();
                self.normalizer.element_start(tag, attrs);
                return Ok(());
            }
            OpComponent::ElementEnd => {
                self.flush_post_queue();
                self.normalizer.element_end();
                return Ok(());
            }
            OpComponent::AnnotationBoundary(b) => {
                self.post_queue.push(b.clone());
                return Ok(());
            }
            _ => {}
        }

        match std::mem::replace(&mut self.target, Target::DefaultPre) {
            Target::RetainPost(rem) => {
                self.flush_annotations();
                match c {
                    OpComponent::Retain(n) => {
                        if *n <= rem {
                            self.normalizer.retain(*n);
                            self.cancel_retain_post(rem, *n);
                        } else {
                            self.normalizer.retain(rem);
                            self.target = Target::RetainPre(n - rem);
                        }
                    }
                    OpComponent::DeleteCharacters(s) => {
                        let len = char_len(s);
                        if len <= rem {
                            self.normalizer.delete_characters(s);
                            self.cancel_retain_post(rem, len);
                        } else {
                            let (head, tail) = split_chars(s, rem);
                            self.normalizer.delete_characters(head);
                            self.target = Target::DeleteCharsPre(tail.into());
                        }
                    }
                    OpComponent::DeleteElementStart(tag, attrs) => {
                        self.normalizer.delete_element_start(tag, attrs);
                        self.cancel_retain_post(rem, 1);
                    }
                    OpComponent::DeleteElementEnd => {
                        self.normalizer.delete_element_end();
                        self.cancel_retain_post(rem, 1);
                    }
                    OpComponent::ReplaceAttributes(old, new) => {
                        self.normalizer.replace_attributes(old, new);
                        self.cancel_retain_post(rem, 1);
                    }
                    OpComponent::UpdateAttributes(u) => {
                        self.normalizer.update_attributes(u);
                        self.cancel_retain_post(rem, 1);
                    }
                    _ => unreachable!(),
                }
            }
            Target::CharsPost(chars) => {
                self.flush_annotations();
                match c {
                    OpComponent::Retain(n) => {
                        let len = char_len(&chars);
                        if *n <= len {
                            let (head, tail) = split_chars(&chars, *n);
                            self.normalizer.characters(head);
                            if !tail.is_empty() {
                                self.target = Target::CharsPost(tail.into());
                            }
                        } else {
                            self.normalizer.characters(&chars);
                            self.target = Target::RetainPre(n - len);
                        }
                    }
                    OpComponent::DeleteCharacters(s) => {
                        let del = char_len(s);
                        let ins = char_len(&chars);
                        if del <= ins {
                            let (_, tail) = split_chars(&chars, del);
                            if !tail.is_empty() {
                                self.target = Target::CharsPost(tail.into());
                            }
                        } else {
                            let (_, tail) = split_chars(s, ins);
                            self.target = Target::DeleteCharsPre(tail.into());
                        }
                    }
                    _ => return illegal("structural component against pending character insertion"),
                }
            }
            Target::ElementStartPost(tag, attrs) => {
                self.flush_annotations();
                match c {
                    OpComponent::Retain(n) => {
                        self.normalizer.element_start(&tag, &attrs);
                        if *n > 1 {
                            self.target = Target::RetainPre(n - 1);
                        }
                    }
                    OpComponent::DeleteElementStart(..) => {
                        // Inserted then deleted: both vanish.
                    }
                    OpComponent::ReplaceAttributes(_, new) => {
                        self.normalizer.element_start(&tag, new);
                    }
                    OpComponent::UpdateAttributes(u) => {
                        self.normalizer.element_start(&tag, &attrs.updated_with(u));
                    }
                    _ => return illegal("component against pending element start"),
                }
            }
            Target::ElementEndPost => {
                self.flush_annotations();
                match c {
                    OpComponent::Retain(n) => {
                        self.normalizer.element_end();
                        if *n > 1 {
                            self.target = Target::RetainPre(n - 1);
                        }
                    }
                    OpComponent::DeleteElementEnd => {}
                    _ => return illegal("component against pending element end"),
                }
            }
            Target::ReplaceAttributesPost(old, new) => {
                self.flush_annotations();
                match c {
                    OpComponent::Retain(n) => {
                        self.normalizer.replace_attributes(&old, &new);
                        if *n > 1 {
                            self.target = Target::RetainPre(n - 1);
                        }
                    }
                    OpComponent::DeleteElementStart(tag, _) => {
                        // The delete must restate what the document held
                        // before the first op touched it.
                        self.normalizer.delete_element_start(tag, &old);
                    }
                    OpComponent::ReplaceAttributes(_, second_new) => {
                        self.normalizer.replace_attributes(&old, second_new);
                    }
                    OpComponent::UpdateAttributes(u) => {
                        self.normalizer.replace_attributes(&old, &new.updated_with(u));
                    }
                    _ => return illegal("component against pending attribute replacement"),
                }
            }
            Target::UpdateAttributesPost(update) => {
                self.flush_annotations();
                match c {
                    OpComponent::Retain(n) => {
                        self.normalizer.update_attributes(&update);
                        if *n > 1 {
                            self.target = Target::RetainPre(n - 1);
                        }
                    }
                    OpComponent::DeleteElementStart(tag, attrs) => {
                        self.normalizer
                            .delete_element_start(tag, &attrs.updated_with(&update.inverted()));
                    }
                    OpComponent::ReplaceAttributes(old, new) => {
                        self.normalizer
                            .replace_attributes(&old.updated_with(&update.inverted()), new);
                    }
                    OpComponent::UpdateAttributes(u) => {
                        self.normalizer.update_attributes(&update.compose_with(u));
                    }
                    _ => return illegal("component against pending attribute update"),
                }
            }
            Target::FinisherPost => {
                return illegal("second op longer than first op's output");
            }
            pre => {
                self.target = pre;
                unreachable!("post component fed to pre state");
            }
        }
        Ok(())
    }

    fn cancel_retain_post(&mut self, rem: usize, consumed: usize) {
        if consumed < rem {
            self.target = Target::RetainPost(rem - consumed);
        }
    }

    fn compose(mut self, a: &DocOp, b: &DocOp) -> Result<DocOp, ComposeError> {
        let mut i2 = 0usize;
        for i1 in 0..a.size() {
            self.consume_pre(a.component(i1))?;
            while self.target.is_post() {
                if i2 >= b.size() {
                    return illegal(&format!(
                        "document size mismatch: op1 resulting length={}, op2 initial length={}",
                        a.resulting_doc_length(),
                        b.initial_doc_length()
                    ));
                }
                self.consume_post(b.component(i2))?;
                i2 += 1;
            }
        }
        if i2 < b.size() {
            self.target = Target::FinisherPost;
            while i2 < b.size() {
                self.consume_post(b.component(i2))?;
                i2 += 1;
            }
        } else if !matches!(self.target, Target::DefaultPre | Target::FinisherPost) {
            // A leftover retain or deletion from the second op means it was
            // built against a longer document than the first op produces.
            return illegal(&format!(
                "document size mismatch: op1 resulting length={}, op2 initial length={}",
                a.resulting_doc_length(),
                b.initial_doc_length()
            ));
        }
        self.flush_annotations();
        Ok(self.normalizer.finish())
    }
}

/// Composes two sequential ops into one, verifying the result is
/// well-formed.
pub fn compose(a: &DocOp, b: &DocOp) -> Result<DocOp, ComposeError> {
    let op = compose_unchecked(a, b)?;
    check_well_formed_result(&op)?;
    Ok(op)
}

/// Composes without the final well-formedness pass. Only worth it when the
/// inputs are known good and the output feeds straight into another compose.
pub fn compose_unchecked(a: &DocOp, b: &DocOp) -> Result<DocOp, ComposeError> {
    Composer::new().compose(a, b)
}

fn check_well_formed_result(op: &DocOp) -> Result<(), ComposeError> {
    let components: Vec<OpComponent> = op.components().cloned().collect();
    check_well_formed(&components)
        .map_err(|e| ComposeError { description: format!("composed op is ill-formed: {}", e) })
}

/// Left fold of [`compose`] over a run of ops. An empty run composes to the
/// empty op (which only applies to the empty document).
pub fn compose_all<'a, I>(ops: I) -> Result<DocOp, ComposeError>
where
    I: IntoIterator<Item = &'a DocOp>,
{
    let mut iter = ops.into_iter();
    let mut acc = match iter.next() {
        Some(first) => first.clone(),
        None => return Ok(DocOp::default()),
    };
    for op in iter {
        acc = compose(&acc, op)?;
    }
    Ok(acc)
}
