//! Randomized op testing: generate streams of random (valid) ops against
//! evolving documents and check the core algebraic properties hold at every
//! step.

use rand::prelude::*;

use swell::doc::{document_from_xml, Document};
use swell::docop::{
    compose, invert, validate, Attributes, DocOp, DocOpBuilder, NoSchemaConstraints,
};

fn random_str(len: usize, rng: &mut SmallRng) -> String {
    let alphabet: Vec<char> = "abcdefghijklmnop_".chars().collect();
    (0..len).map(|_| alphabet[rng.gen_range(0..alphabet.len())]).collect()
}

fn random_tag(rng: &mut SmallRng) -> String {
    ["p", "line", "item", "note"][rng.gen_range(0..4)].to_string()
}

fn random_attrs(rng: &mut SmallRng) -> Attributes {
    if rng.gen_bool(0.5) {
        Attributes::new()
    } else {
        Attributes::single("id", &random_str(3, rng))
    }
}

/// The length of the run of character items starting at `pos`.
fn char_run_len(doc: &Document, pos: usize) -> usize {
    doc.remaining_characters_in_element(pos)
}

fn chars_at(doc: &Document, pos: usize, len: usize) -> String {
    (pos..pos + len).map(|i| doc.char_at(i).unwrap()).collect()
}

/// Builds a random op that is valid against `doc`: retains, text inserts,
/// empty-element inserts and character-run deletions. Element deletion is
/// left to the deterministic tests; generating balanced structural deletes
/// isn't worth the complexity here.
fn random_op(doc: &Document, rng: &mut SmallRng) -> DocOp {
    let mut b = DocOpBuilder::new();
    let mut pos = 0usize;
    loop {
        // Maybe insert something at the current point.
        if rng.gen_bool(0.3) {
            if rng.gen_bool(0.7) {
                b = b.characters(&random_str(rng.gen_range(1..5), rng));
            } else {
                b = b.element_start(&random_tag(rng), random_attrs(rng)).element_end();
            }
        }
        if pos >= doc.len() {
            break;
        }
        let run = char_run_len(doc, pos);
        if run > 0 && rng.gen_bool(0.3) {
            // Delete part of this character run.
            let del = rng.gen_range(1..=run.min(4));
            b = b.delete_characters(&chars_at(doc, pos, del));
            pos += del;
        } else {
            // Retain a chunk.
            let step = rng.gen_range(1..=(doc.len() - pos).min(5));
            b = b.retain(step);
            pos += step;
        }
    }
    b.build().expect("generator produced an ill-formed op")
}

fn seeded_doc(seed: u64) -> (Document, SmallRng) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut doc = Document::new();
    for _ in 0..rng.gen_range(2..6) {
        let op = random_op(&doc, &mut rng);
        doc.apply(&op).unwrap();
    }
    (doc, rng)
}

#[test]
fn random_ops_validate_and_apply() {
    for seed in 0..50 {
        let (mut doc, mut rng) = seeded_doc(seed);
        for _ in 0..20 {
            let op = random_op(&doc, &mut rng);
            let (result, violations) = validate(&op, &doc, &NoSchemaConstraints);
            assert!(
                result.is_valid(),
                "seed {}: generated op invalid: {:?}\nop: {}\ndoc: {}",
                seed,
                violations.first_description(),
                op,
                doc
            );
            doc.apply(&op).unwrap_or_else(|e| {
                panic!("seed {}: valid op failed to apply: {}\nop: {}", seed, e, op)
            });
        }
    }
}

#[test]
fn random_ops_invert_cleanly() {
    for seed in 0..50 {
        let (mut doc, mut rng) = seeded_doc(seed);
        for _ in 0..10 {
            let op = random_op(&doc, &mut rng);
            let before = doc.clone();
            doc.apply(&op).unwrap();
            let mut undone = doc.clone();
            undone.apply(&invert(&op)).unwrap_or_else(|e| {
                panic!("seed {}: inverse failed to apply: {}\nop: {}", seed, e, op)
            });
            assert_eq!(undone, before, "seed {}: inverse did not restore, op: {}", seed, op);
        }
    }
}

#[test]
fn random_compose_matches_sequential_application() {
    for seed in 0..50 {
        let (mut doc, mut rng) = seeded_doc(seed);
        for _ in 0..10 {
            let a = random_op(&doc, &mut rng);
            let mut mid = doc.clone();
            mid.apply(&a).unwrap();
            let b = random_op(&mid, &mut rng);

            let ab = compose(&a, &b).unwrap_or_else(|e| {
                panic!("seed {}: compose failed: {}\na: {}\nb: {}", seed, e, a, b)
            });

            let mut sequential = doc.clone();
            sequential.apply(&a).unwrap();
            sequential.apply(&b).unwrap();
            let mut composed = doc.clone();
            composed.apply(&ab).unwrap_or_else(|e| {
                panic!("seed {}: composed op failed: {}\nab: {}", seed, e, ab)
            });
            assert_eq!(
                composed, sequential,
                "seed {}: compose diverged\na: {}\nb: {}\nab: {}",
                seed, a, b, ab
            );

            doc = sequential;
        }
    }
}

#[test]
fn random_documents_survive_the_xml_round_trip() {
    for seed in 0..100 {
        let (doc, _) = seeded_doc(seed);
        let xml = doc.to_xml_string();
        let parsed = document_from_xml(&xml)
            .unwrap_or_else(|e| panic!("seed {}: reparse failed: {}\nxml: {}", seed, e, xml));
        assert_eq!(parsed, doc, "seed {}: xml round trip diverged: {}", seed, xml);
        // Items survive individually too.
        assert_eq!(parsed.len(), doc.len());
        for i in 0..doc.len() {
            assert_eq!(parsed.item(i), doc.item(i));
        }
    }
}

#[test]
fn random_initializations_replay() {
    for seed in 0..50 {
        let (doc, _) = seeded_doc(seed);
        let init = doc.to_initialization();
        assert!(init.is_initialization(), "seed {}: {}", seed, init);
        let mut rebuilt = Document::new();
        rebuilt.apply(&init).unwrap();
        assert_eq!(rebuilt, doc, "seed {}", seed);
    }
}
