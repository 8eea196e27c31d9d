//! Document operations: representation, building, validation, composition
//! and inversion.
//!
//! A [`DocOp`] is an ordered sequence of components - retains, character and
//! element insertions/deletions, attribute changes and annotation boundaries
//! - that walks a document from start to end. Ops are immutable values; they
//! are built through [`DocOpBuilder`] (which enforces structural
//! well-formedness), checked against a document and a [`DocumentSchema`] by
//! [`validate`], combined by [`compose`], and undone via [`invert`].

mod annotations;
mod attributes;
mod builder;
mod components;
mod compose;
mod invert;
mod normalize;
mod validate;

pub use annotations::{
    AnnotationBoundary, AnnotationBoundaryBuilder, AnnotationChange, AnnotationMap,
    AnnotationsUpdate,
};
pub use attributes::{AttributeChange, Attributes, AttributesUpdate, DuplicateKey};
pub use builder::{check_well_formed, DocOpBuilder, IllFormed, UncheckedDocOpBuilder};
pub use components::{DocOp, DocOpCursor, OpComponent};
pub use compose::{compose, compose_all, compose_unchecked, ComposeError};
pub use invert::invert;
pub use normalize::{normalize, OpNormalizer};
pub use validate::{
    validate, DocOpAutomaton, DocumentSchema, NoSchemaConstraints, PermittedChars,
    ValidationResult, Violation, ViolationCollector,
};
