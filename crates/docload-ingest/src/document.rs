//! In-memory element tree for staged XML payloads
//!
//! Payloads are parsed once with `quick-xml` into a small owned tree. Selection
//! and extraction walk the tree with slash-separated paths:
//!
//! - `/Provenir/Request/CustData` is absolute; its first segment must name the
//!   document root.
//! - `contact/address` is relative to the element currently in scope.
//! - `.` (or an empty path) is the scope element itself.
//!
//! Attribute and text lookups trim whitespace and treat blank as absent.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::DocumentError;

/// One XML element with its attributes, text content and child elements
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// Trimmed attribute value; blank values are reported as absent
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Trimmed text content; blank text is reported as absent
    pub fn text(&self) -> Option<&str> {
        let trimmed = self.text.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// All descendants reached by following `path` from this element
    pub fn select(&self, path: &ElementPath) -> Vec<&Element> {
        let mut current: Vec<&Element> = vec![self];
        for segment in path.segments() {
            current = current
                .into_iter()
                .flat_map(|el| el.children.iter().filter(|child| child.name == *segment))
                .collect();
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// First element reached by `path`, in document order
    pub fn select_first(&self, path: &ElementPath) -> Option<&Element> {
        self.select(path).into_iter().next()
    }

    fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.push((name.to_string(), value.to_string()));
        self
    }
}

/// A parsed slash-separated element path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementPath {
    absolute: bool,
    segments: Vec<String>,
}

impl ElementPath {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let absolute = trimmed.starts_with('/');
        let segments = trimmed
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect();
        Self { absolute, segments }
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_self(&self) -> bool {
        !self.absolute && self.segments.is_empty()
    }

    /// Path below the document root, with the root segment removed
    fn below_root(&self) -> ElementPath {
        ElementPath {
            absolute: false,
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }
}

impl std::fmt::Display for ElementPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.absolute {
            f.write_str("/")?;
        }
        if self.segments.is_empty() && !self.absolute {
            return f.write_str(".");
        }
        f.write_str(&self.segments.join("/"))
    }
}

/// A parsed staged document
#[derive(Debug, Clone)]
pub struct Document {
    root: Element,
}

impl Document {
    /// Parse a raw XML payload into an element tree
    pub fn parse(payload: &str) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_str(payload);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => stack.push(element_from_start(&start)?),
                Ok(Event::Empty(start)) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack.pop().ok_or_else(|| {
                        DocumentError::Malformed("closing tag without opening tag".to_string())
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(text)) => {
                    if let Some(top) = stack.last_mut() {
                        let unescaped = text
                            .unescape()
                            .map_err(|e| DocumentError::Malformed(e.to_string()))?;
                        top.text.push_str(&unescaped);
                    }
                }
                Ok(Event::CData(data)) => {
                    if let Some(top) = stack.last_mut() {
                        top.text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(DocumentError::Malformed(format!(
                        "{} at position {}",
                        e,
                        reader.error_position()
                    )))
                }
            }
        }

        if let Some(open) = stack.last() {
            return Err(DocumentError::Malformed(format!(
                "unclosed element <{}>",
                open.name
            )));
        }

        root.map(|root| Self { root }).ok_or(DocumentError::Empty)
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Resolve an absolute path against the document root. Returns nothing when
    /// the first segment does not name the root element.
    pub fn select_absolute(&self, path: &ElementPath) -> Vec<&Element> {
        match path.segments().first() {
            Some(first) if *first == self.root.name => self.root.select(&path.below_root()),
            _ => Vec::new(),
        }
    }

    /// Resolve a path from `scope`, or from the document root when absolute
    pub fn resolve<'a>(&'a self, scope: &'a Element, path: &ElementPath) -> Vec<&'a Element> {
        if path.is_absolute() {
            self.select_absolute(path)
        } else {
            scope.select(path)
        }
    }

    /// Build a document directly from an element tree
    pub fn from_root(root: Element) -> Self {
        Self { root }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, DocumentError> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| DocumentError::Malformed(e.to_string()))?
        .to_string();
    let mut element = Element::new(name);

    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| DocumentError::Malformed(e.to_string()))?;
        let key = std::str::from_utf8(attribute.key.as_ref())
            .map_err(|e| DocumentError::Malformed(e.to_string()))?
            .to_string();
        let value = attribute
            .unescape_value()
            .map_err(|e| DocumentError::Malformed(e.to_string()))?;
        element = element.with_attribute(&key, &value);
    }

    Ok(element)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), DocumentError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(DocumentError::Malformed(format!(
            "second root element <{}>",
            element.name
        ))),
    }
}
