//! Structural inversion of an op.
//!
//! Because delete components restate exactly what they delete, an op carries
//! everything needed to undo itself: swap inserts with deletes and swap the
//! old/new sides of attribute and annotation transitions. The inverse
//! restores document *content*; it says nothing about metadata like
//! timestamps or versions (see the wavelet-level inverter for how those are
//! deliberately fudged during rollback).

use super::components::{DocOp, OpComponent};

/// The op that structurally undoes `op`: for any document `d` that `op`
/// applies to, `apply(invert(op), apply(op, d)) == d`.
pub fn invert(op: &DocOp) -> DocOp {
    let components = op
        .components()
        .map(|c| match c {
            OpComponent::Retain(n) => OpComponent::Retain(*n),
            OpComponent::Characters(s) => OpComponent::DeleteCharacters(s.clone()),
            OpComponent::DeleteCharacters(s) => OpComponent::Characters(s.clone()),
            OpComponent::ElementStart(tag, attrs) => {
                OpComponent::DeleteElementStart(tag.clone(), attrs.clone())
            }
            OpComponent::ElementEnd => OpComponent::DeleteElementEnd,
            OpComponent::DeleteElementStart(tag, attrs) => {
                OpComponent::ElementStart(tag.clone(), attrs.clone())
            }
            OpComponent::DeleteElementEnd => OpComponent::ElementEnd,
            OpComponent::ReplaceAttributes(old, new) => {
                OpComponent::ReplaceAttributes(new.clone(), old.clone())
            }
            OpComponent::UpdateAttributes(update) => {
                OpComponent::UpdateAttributes(update.inverted())
            }
            OpComponent::AnnotationBoundary(boundary) => {
                OpComponent::AnnotationBoundary(boundary.inverted())
            }
        })
        .collect();
    DocOp::from_components(components)
}

#[cfg(test)]
mod tests {
    use super::super::annotations::AnnotationBoundaryBuilder;
    use super::super::attributes::{Attributes, AttributesUpdate};
    use super::super::builder::DocOpBuilder;
    use super::*;
    use crate::doc::Document;

    fn assert_round_trips(doc: &Document, op: &DocOp) {
        let mut modified = doc.clone();
        modified.apply(op).unwrap();
        modified.apply(&invert(op)).unwrap();
        assert_eq!(&modified, doc, "inverse of {} did not restore the document", op);
    }

    fn base_doc() -> Document {
        let mut doc = Document::new();
        doc.apply(
            &DocOpBuilder::new()
                .element_start("body", Attributes::new())
                .element_start("line", Attributes::single("id", "1"))
                .element_end()
                .characters("hello")
                .element_end()
                .build()
                .unwrap(),
        )
        .unwrap();
        doc
    }

    #[test]
    fn insert_and_delete_round_trip() {
        let doc = base_doc();
        let insert = DocOpBuilder::new()
            .retain(3)
            .characters("xy")
            .retain(doc.len() - 3)
            .build()
            .unwrap();
        assert_round_trips(&doc, &insert);

        let delete = DocOpBuilder::new()
            .retain(3)
            .delete_characters("he")
            .retain(doc.len() - 5)
            .build()
            .unwrap();
        assert_round_trips(&doc, &delete);
    }

    #[test]
    fn structure_round_trips() {
        let doc = base_doc();
        let op = DocOpBuilder::new()
            .retain(1)
            .delete_element_start("line", Attributes::single("id", "1"))
            .delete_element_end()
            .retain(doc.len() - 3)
            .build()
            .unwrap();
        assert_round_trips(&doc, &op);
    }

    #[test]
    fn attribute_changes_round_trip() {
        let doc = base_doc();
        let replace = DocOpBuilder::new()
            .retain(1)
            .replace_attributes(Attributes::single("id", "1"), Attributes::single("id", "9"))
            .retain(doc.len() - 2)
            .build()
            .unwrap();
        assert_round_trips(&doc, &replace);

        let update = DocOpBuilder::new()
            .retain(1)
            .update_attributes(AttributesUpdate::single("id", Some("1"), None))
            .retain(doc.len() - 2)
            .build()
            .unwrap();
        assert_round_trips(&doc, &update);
    }

    #[test]
    fn annotation_changes_round_trip() {
        let doc = base_doc();
        let op = DocOpBuilder::new()
            .retain(3)
            .annotation_boundary(
                AnnotationBoundaryBuilder::new()
                    .change("style/b", None, Some("bold"))
                    .build()
                    .unwrap(),
            )
            .retain(3)
            .annotation_boundary(AnnotationBoundaryBuilder::new().end("style/b").build().unwrap())
            .retain(doc.len() - 6)
            .build()
            .unwrap();
        assert_round_trips(&doc, &op);
    }

    #[test]
    fn inverse_of_inverse_is_identity() {
        let op = DocOpBuilder::new()
            .retain(2)
            .characters("ab")
            .delete_characters("cd")
            .retain(1)
            .build()
            .unwrap();
        assert_eq!(invert(&invert(&op)), op);
    }
}
