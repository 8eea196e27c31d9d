//! Canonical XML text form.
//!
//! The rendering is minimal and normalized: attributes in key order, empty
//! elements self-closed, annotations as an `<?a ...?>` processing
//! instruction at each position where the active annotation set changes.
//! Equal documents produce byte-identical strings, which is what makes the
//! form safe to use for equality comparison in tests.
//!
//! Escaping rules, in text: `& < >`; in attribute values: `"`; in annotation
//! keys and values: `\` `"` and `?` (as `\q`, so a value can never terminate
//! the processing instruction early).

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use smartstring::alias::String as SmartString;

use crate::docop::{AnnotationBoundary, AnnotationChange, AnnotationMap, Attributes};

use super::{DocItem, Document};

/// Target name of the annotation processing instruction.
pub const ANNOTATION_PI_TARGET: &str = "a";

pub(crate) fn xml_text_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub(crate) fn xml_text_unescape(text: &str) -> String {
    text.replace("&gt;", ">").replace("&lt;", "<").replace("&amp;", "&")
}

pub(crate) fn xml_attr_escape(value: &str) -> String {
    value.replace('"', "&quot;")
}

pub(crate) fn xml_attr_unescape(value: &str) -> String {
    value.replace("&quot;", "\"")
}

pub(crate) fn annotation_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('?', "\\q")
}

pub(crate) fn annotation_unescape(value: &str) -> String {
    value.replace("\\q", "?").replace("\\\"", "\"").replace("\\\\", "\\")
}

/// The boundary taking the annotation state from `from` to `to`, with
/// initialization semantics (pre-image always absent).
pub(crate) fn annotation_diff(from: &AnnotationMap, to: &AnnotationMap) -> AnnotationBoundary {
    let mut ends: Vec<SmartString> = Vec::new();
    let mut changes: Vec<AnnotationChange> = Vec::new();
    for (key, value) in to {
        if from.get(key) != Some(value) {
            changes.push(AnnotationChange { key: key.clone(), old: None, new: Some(value.clone()) });
        }
    }
    for key in from.keys() {
        if !to.contains_key(key) {
            ends.push(key.clone());
        }
    }
    AnnotationBoundary::from_parts(ends, changes).unwrap()
}

/// The boundary closing every key in `active`.
pub(crate) fn annotation_close(active: &AnnotationMap) -> AnnotationBoundary {
    AnnotationBoundary::from_parts(active.keys().cloned(), []).unwrap()
}

fn attribute_string(attrs: &Attributes) -> String {
    let mut b = String::new();
    for (i, (key, value)) in attrs.iter().enumerate() {
        if i > 0 {
            b.push(' ');
        }
        b.push_str(key);
        b.push_str("=\"");
        b.push_str(&xml_attr_escape(value));
        b.push('"');
    }
    b
}

pub(crate) fn to_xml_string(doc: &Document) -> String {
    let mut b = String::new();
    // Buffered element start, so `<p` can become either `<p>` or `<p/>`.
    let mut element_part: Option<String> = None;
    let mut tags: Vec<SmartString> = Vec::new();
    let mut current = AnnotationMap::new();

    let flush = |b: &mut String, part: &mut Option<String>| {
        if let Some(p) = part.take() {
            b.push_str(&p);
            b.push('>');
        }
    };

    for (pos, item) in doc.items().iter().enumerate() {
        let here = doc.annotations_at(pos);
        if here != &current {
            // key -> Some(new value) for starts/changes, None for ends.
            let mut changes: BTreeMap<&SmartString, Option<&SmartString>> = BTreeMap::new();
            for (key, value) in here {
                if current.get(key) != Some(value) {
                    changes.insert(key, Some(value));
                }
            }
            for key in current.keys() {
                if !here.contains_key(key) {
                    changes.insert(key, None);
                }
            }
            flush(&mut b, &mut element_part);
            b.push_str("<?");
            b.push_str(ANNOTATION_PI_TARGET);
            for (key, value) in &changes {
                b.push_str(" \"");
                b.push_str(&xml_text_escape(&annotation_escape(key)));
                b.push('"');
                if let Some(value) = value {
                    b.push_str("=\"");
                    b.push_str(&xml_text_escape(&annotation_escape(value)));
                    b.push('"');
                }
            }
            b.push_str("?>");
            current = here.clone();
        }

        match item {
            DocItem::Open { tag, attrs } => {
                flush(&mut b, &mut element_part);
                let mut part = String::new();
                part.push('<');
                part.push_str(tag);
                if !attrs.is_empty() {
                    part.push(' ');
                    part.push_str(&attribute_string(attrs));
                }
                element_part = Some(part);
                tags.push(tag.clone());
            }
            DocItem::Close => {
                let tag = tags.pop().expect("unbalanced document");
                if let Some(p) = element_part.take() {
                    b.push_str(&p);
                    b.push_str("/>");
                } else {
                    b.push_str("</");
                    b.push_str(&tag);
                    b.push('>');
                }
            }
            DocItem::Char(c) => {
                flush(&mut b, &mut element_part);
                b.push_str(&xml_text_escape(&c.to_string()));
            }
        }
    }
    b
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct XmlParseError {
    pub description: String,
    pub position: usize,
}

impl Display for XmlParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "xml parse error at {}: {}", self.position, self.description)
    }
}

impl std::error::Error for XmlParseError {}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn err<T>(&self, description: impl Into<String>) -> Result<T, XmlParseError> {
        Err(XmlParseError { description: description.into(), position: self.pos })
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn eat(&mut self, expected: char) -> Result<(), XmlParseError> {
        match self.next() {
            Some(c) if c == expected => Ok(()),
            Some(c) => self.err(format!("expected {:?}, found {:?}", expected, c)),
            None => self.err(format!("expected {:?}, found end of input", expected)),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn name(&mut self) -> Result<SmartString, XmlParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')) {
            self.pos += 1;
        }
        if self.pos == start {
            return self.err("expected a name");
        }
        Ok(self.chars[start..self.pos].iter().copied().collect())
    }

    /// A `"..."` token; the caller unescapes.
    fn quoted(&mut self) -> Result<String, XmlParseError> {
        self.eat('"')?;
        let start = self.pos;
        loop {
            match self.peek() {
                Some('"') => break,
                Some(_) => self.pos += 1,
                None => return self.err("unterminated string"),
            }
        }
        let raw: String = self.chars[start..self.pos].iter().collect();
        self.eat('"')?;
        Ok(raw)
    }
}

/// Parses the canonical XML form back into a document. Inverse of
/// [`Document::to_xml_string`] on its own output; rejects anything outside
/// the canonical subset (no comments, no CDATA, no doctypes).
pub fn document_from_xml(text: &str) -> Result<Document, XmlParseError> {
    let mut p = Parser { chars: text.chars().collect(), pos: 0 };
    let mut doc = Document::new();
    let mut current = AnnotationMap::new();
    let mut stack: Vec<SmartString> = Vec::new();

    while let Some(c) = p.peek() {
        if c == '<' {
            p.pos += 1;
            match p.peek() {
                Some('?') => {
                    p.pos += 1;
                    let target = p.name()?;
                    if target != ANNOTATION_PI_TARGET {
                        return p.err(format!("unknown processing instruction {:?}", target));
                    }
                    loop {
                        p.skip_whitespace();
                        match p.peek() {
                            Some('?') => {
                                p.pos += 1;
                                p.eat('>')?;
                                break;
                            }
                            Some('"') => {
                                let key: SmartString =
                                    annotation_unescape(&xml_text_unescape(&p.quoted()?)).into();
                                if p.peek() == Some('=') {
                                    p.pos += 1;
                                    let value =
                                        annotation_unescape(&xml_text_unescape(&p.quoted()?));
                                    current.insert(key, value.into());
                                } else {
                                    current.remove(&key);
                                }
                            }
                            _ => return p.err("malformed annotation instruction"),
                        }
                    }
                }
                Some('/') => {
                    p.pos += 1;
                    let tag = p.name()?;
                    p.eat('>')?;
                    match stack.pop() {
                        Some(open) if open == tag => {}
                        Some(open) => {
                            return p.err(format!("mismatched close tag {:?}, expected {:?}", tag, open))
                        }
                        None => return p.err(format!("close tag {:?} with nothing open", tag)),
                    }
                    doc.push_item(DocItem::Close, current.clone());
                }
                Some(_) => {
                    let tag = p.name()?;
                    let mut pairs: Vec<(SmartString, SmartString)> = Vec::new();
                    let self_closing;
                    loop {
                        p.skip_whitespace();
                        match p.peek() {
                            Some('>') => {
                                p.pos += 1;
                                self_closing = false;
                                break;
                            }
                            Some('/') => {
                                p.pos += 1;
                                p.eat('>')?;
                                self_closing = true;
                                break;
                            }
                            Some(_) => {
                                let key = p.name()?;
                                p.eat('=')?;
                                let value = xml_attr_unescape(&p.quoted()?);
                                pairs.push((key, value.into()));
                            }
                            None => return p.err("unterminated element start"),
                        }
                    }
                    let attrs = match Attributes::from_pairs(pairs) {
                        Ok(attrs) => attrs,
                        Err(e) => return p.err(e.to_string()),
                    };
                    doc.push_item(DocItem::Open { tag: tag.clone(), attrs }, current.clone());
                    if self_closing {
                        doc.push_item(DocItem::Close, current.clone());
                    } else {
                        stack.push(tag);
                    }
                }
                None => return p.err("unterminated markup"),
            }
        } else {
            let start = p.pos;
            while matches!(p.peek(), Some(c) if c != '<') {
                p.pos += 1;
            }
            let raw: String = p.chars[start..p.pos].iter().collect();
            for ch in xml_text_unescape(&raw).chars() {
                doc.push_item(DocItem::Char(ch), current.clone());
            }
        }
    }

    if let Some(open) = stack.pop() {
        return p.err(format!("element {:?} never closed", open));
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(xml: &str) {
        let doc = document_from_xml(xml).unwrap();
        assert_eq!(doc.to_xml_string(), xml);
        // And once more through the parser for good measure.
        assert_eq!(document_from_xml(&doc.to_xml_string()).unwrap(), doc);
    }

    #[test]
    fn basic_round_trips() {
        round_trip("<body><line/>hello</body>");
        round_trip("<body ver=\"2\"><line by=\"alice@example.com\"/>hi</body>");
        round_trip("");
    }

    #[test]
    fn escaping_round_trips() {
        round_trip("<body>a &amp; b &lt;c&gt;</body>");
        round_trip("<body q=\"say &quot;hi&quot;\">x</body>");
    }

    #[test]
    fn annotations_round_trip() {
        round_trip("<body><?a \"style/b\"=\"bold\"?>ab<?a \"style/b\"?>cd</body>");
        // Annotation values with reserved characters survive.
        round_trip("<body><?a \"k\"=\"what\\q no\"?>x<?a \"k\"?></body>");
    }

    #[test]
    fn rejects_garbage() {
        assert!(document_from_xml("<body>").is_err());
        assert!(document_from_xml("</body>").is_err());
        assert!(document_from_xml("<a></b>").is_err());
        assert!(document_from_xml("<?pi x?>").is_err());
    }

    #[test]
    fn initialization_matches_parser() {
        let doc = document_from_xml("<body><?a \"k\"=\"v\"?>hi<?a \"k\"?><line/></body>").unwrap();
        let init = doc.to_initialization();
        let mut rebuilt = Document::new();
        rebuilt.apply(&init).unwrap();
        assert_eq!(rebuilt, doc);
        assert!(init.is_initialization());
    }
}
