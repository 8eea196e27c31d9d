//! Swell is an operational-transformation engine for wave-style collaborative
//! documents. Multiple participants concurrently edit structured XML-ish
//! documents ("blips") inside versioned containers ("wavelets"), and a server
//! coordinates convergence by advancing each wavelet through a strictly
//! ordered, hash-chained sequence of deltas.
//!
//! The crate is built from a few layers, leaves first:
//!
//! 1. [`docop`] - the atomic, replayable representation of a document edit
//!    (retain / insert / delete runs, element structure, attribute changes,
//!    annotation boundaries), plus validation against a [`docop::DocumentSchema`],
//!    composition and inversion.
//! 2. [`doc`] - the concrete document substrate ops are validated against and
//!    applied to: a flat sequence of items with per-item annotations.
//! 3. [`wave`], [`version`], [`delta`] - wavelet-level operations with their
//!    application contexts, the SHA-256 history hash chain, and contiguous
//!    delta sequences.
//! 4. [`passive`], [`frontend`], [`server`] - rollback-capable delta
//!    containers for passive consumers, per-wavelet synchronization state with
//!    the client open/submit contract, and an in-memory wave server tying it
//!    all together.
//!
//! ## Example
//!
//! Build a document operation, validate it, and apply it:
//!
//! ```
//! use swell::doc::Document;
//! use swell::docop::{DocOpBuilder, NoSchemaConstraints, validate};
//!
//! let mut doc = Document::new();
//! let op = DocOpBuilder::new()
//!     .element_start("body", Default::default())
//!     .characters("hi")
//!     .element_end()
//!     .build()
//!     .unwrap();
//!
//! let (result, _violations) = validate(&op, &doc, &NoSchemaConstraints);
//! assert!(result.is_valid());
//! doc.apply(&op).unwrap();
//! assert_eq!(doc.to_xml_string(), "<body>hi</body>");
//! ```
//!
//! Versioning invariants are deliberately unforgiving: delta sequences must be
//! contiguous (end version of one run == start version of the next), and the
//! history hash at version N is derivable only from the hash at N-1 plus the
//! content of delta N. A gap or a hash mismatch is never papered over - it
//! means a missed delta or divergent state, and the synchronization layer
//! treats it as fatal rather than guessing.

pub mod doc;
pub mod docop;
pub mod wave;
pub mod version;
pub mod delta;
pub mod passive;
pub mod frontend;
pub mod server;

/// Milliseconds since the unix epoch. The operation and delta layers never
/// read a clock; the server takes an explicit [`server::Clock`].
pub type Timestamp = i64;
