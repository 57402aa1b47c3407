//! Structured decoding of store responses.
//!
//! Responses are small, tag-delimited documents. They are parsed once into an
//! element tree, and callers pull values out by tag name instead of scanning
//! raw text.

use crate::{Result, TapError};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    name: String,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn new(name: String) -> Self {
        Self {
            name,
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unescaped character data directly inside this element.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn children(&self, tag: &str) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter(move |child| child.name == tag)
    }

    pub fn child(&self, tag: &str) -> Option<&XmlElement> {
        self.children(tag).next()
    }

    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).map(XmlElement::text)
    }

    fn collect<'a>(&'a self, tag: &str, out: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.name == tag {
                out.push(child);
            }
            child.collect(tag, out);
        }
    }

    fn find_first(&self, tag: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.name == tag {
                return Some(child);
            }
            if let Some(found) = child.find_first(tag) {
                return Some(found);
            }
        }
        None
    }
}

/// A parsed response body.
#[derive(Debug, Clone, Default)]
pub struct ResponseDocument {
    root: XmlElement,
}

impl ResponseDocument {
    pub fn parse(body: &str) -> Result<Self> {
        let mut reader = Reader::from_str(body);
        let mut stack = vec![XmlElement::new(String::new())];

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                    stack.push(XmlElement::new(name));
                }
                Event::Empty(empty) => {
                    let name = String::from_utf8_lossy(empty.local_name().as_ref()).into_owned();
                    current(&mut stack)?.children.push(XmlElement::new(name));
                }
                Event::End(_) => {
                    let finished = stack
                        .pop()
                        .ok_or_else(|| TapError::Xml("unbalanced end tag".to_string()))?;
                    current(&mut stack)?.children.push(finished);
                }
                Event::Text(text) => {
                    let value = text.unescape()?;
                    current(&mut stack)?.text.push_str(&value);
                }
                Event::CData(data) => {
                    let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    current(&mut stack)?.text.push_str(&value);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if stack.len() != 1 {
            return Err(TapError::Xml(format!(
                "unexpected end of document inside <{}>",
                stack.last().map(XmlElement::name).unwrap_or_default()
            )));
        }

        let root = stack
            .pop()
            .ok_or_else(|| TapError::Xml("empty document".to_string()))?;
        Ok(Self { root })
    }

    /// Text of the first element named `tag`, at any depth.
    pub fn extract_first(&self, tag: &str) -> Option<String> {
        self.root.find_first(tag).map(|element| element.text.clone())
    }

    /// Text of every element named `tag`, in document order.
    pub fn extract_all(&self, tag: &str) -> Vec<String> {
        self.elements(tag)
            .into_iter()
            .map(|element| element.text.clone())
            .collect()
    }

    pub fn elements(&self, tag: &str) -> Vec<&XmlElement> {
        let mut out = Vec::new();
        self.root.collect(tag, &mut out);
        out
    }
}

fn current(stack: &mut [XmlElement]) -> Result<&mut XmlElement> {
    stack
        .last_mut()
        .ok_or_else(|| TapError::Xml("content outside of document".to_string()))
}
