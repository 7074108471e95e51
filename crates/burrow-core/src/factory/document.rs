//! Thin owned element tree over quick-xml.
//!
//! The resolver wants a document it can walk repeatedly (the offsets
//! subtree is walked twice per version), so the event stream is folded
//! into plain owned `Element`s up front. Parse failures carry the
//! quick-xml description plus the line/column of the failing byte.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn first_child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }
}

fn position_of(text: &str, byte_offset: usize) -> (usize, usize) {
    let clamped = byte_offset.min(text.len());
    let prefix = &text.as_bytes()[..clamped];
    let line = memchr::memchr_iter(b'\n', prefix).count() + 1;
    let column = memchr::memrchr(b'\n', prefix)
        .map(|nl| clamped - nl)
        .unwrap_or(clamped + 1);
    (line, column)
}

fn parse_error(text: &str, offset: usize, message: impl ToString) -> Error {
    let (line, column) = position_of(text, offset);
    Error::Document {
        message: message.to_string(),
        line,
        column,
    }
}

fn element_from(text: &str, offset: usize, start: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| parse_error(text, offset, e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| parse_error(text, offset, e))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
    })
}

/// Parse a document and return its single root element.
pub fn parse(text: &str) -> Result<Element> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let offset = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                stack.push(element_from(text, offset, &start)?);
            }
            Ok(Event::Empty(start)) => {
                let elem = element_from(text, offset, &start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(elem),
                    None if root.is_none() => root = Some(elem),
                    None => {
                        return Err(parse_error(text, offset, "multiple root elements"));
                    }
                }
            }
            Ok(Event::End(_)) => {
                let done = stack
                    .pop()
                    .ok_or_else(|| parse_error(text, offset, "unbalanced end tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None if root.is_none() => root = Some(done),
                    None => {
                        return Err(parse_error(text, offset, "multiple root elements"));
                    }
                }
            }
            Ok(Event::Eof) => break,
            // text, comments, declarations and PIs carry nothing we use
            Ok(_) => {}
            Err(e) => return Err(parse_error(text, offset, e)),
        }
    }

    if !stack.is_empty() {
        return Err(parse_error(text, text.len(), "unexpected end of document"));
    }
    root.ok_or_else(|| parse_error(text, 0, "empty document"))
}
