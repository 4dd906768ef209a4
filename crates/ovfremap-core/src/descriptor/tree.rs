//! Mutable XML element tree backed by quick-xml.
//!
//! The tree keeps element order, attribute order, text, CDATA, comments and
//! processing instructions, plus everything around the root element (the XML
//! declaration, a doctype, outer comments), so that a descriptor survives a
//! parse/serialize cycle with only the edits the remapping passes make.
//! Namespace prefixes are kept verbatim in names; all lookups go through local
//! names.

use std::io::Write;

use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};

/// A node inside an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A child element.
    Element(Element),
    /// Character data, stored unescaped.
    Text(String),
    /// A CDATA section.
    CData(String),
    /// A comment, stored as written.
    Comment(String),
    /// A processing instruction, content between `<?` and `?>`.
    ProcessingInstruction(String),
    /// The XML declaration, content between `<?` and `?>`.
    Declaration(String),
    /// A document type declaration, content after `<!DOCTYPE`.
    DocType(String),
}

/// An XML element with qualified name, ordered attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Qualified name as written (e.g. `rasd:InstanceId`).
    pub name: String,
    /// Attributes in document order, values unescaped.
    pub attributes: Vec<(String, String)>,
    /// Child nodes in document order.
    pub children: Vec<Node>,
}

/// Strip a namespace prefix from a qualified name or typed value.
pub fn local_name(qualified: &str) -> &str {
    qualified
        .rsplit_once(':')
        .map(|(_, local)| local)
        .unwrap_or(qualified)
}

impl Element {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// The element name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        local_name(&self.name)
    }

    /// Look up an attribute by local name.
    pub fn attr(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| local_name(key) == local)
            .map(|(_, value)| value.as_str())
    }

    /// Overwrite an existing attribute, matched by local name.
    ///
    /// Returns `false` if the element has no such attribute.
    pub fn set_attr(&mut self, local: &str, value: impl Into<String>) -> bool {
        match self
            .attributes
            .iter_mut()
            .find(|(key, _)| local_name(key) == local)
        {
            Some((_, slot)) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    /// Concatenated text and CDATA content of this element.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) | Node::CData(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replace all text content with `text`, keeping child elements and comments.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children
            .retain(|node| !matches!(node, Node::Text(_) | Node::CData(_)));
        self.children.insert(0, Node::Text(text.into()));
    }

    /// Iterate over child elements.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// Iterate mutably over child elements.
    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// Iterate over child elements with the given local name.
    pub fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |e| e.local_name() == local)
    }

    /// Iterate mutably over child elements with the given local name.
    pub fn children_named_mut<'a>(
        &'a mut self,
        local: &'a str,
    ) -> impl Iterator<Item = &'a mut Element> {
        self.elements_mut().filter(move |e| e.local_name() == local)
    }

    /// First child element with the given local name.
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.elements().find(|e| e.local_name() == local)
    }

    /// First child element with the given local name, mutably.
    pub fn child_mut(&mut self, local: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.local_name() == local)
    }

    /// Remove every child element matching `predicate`.
    ///
    /// Whitespace-only text directly preceding a removed element goes with it
    /// so the serialized document does not accumulate blank lines. Returns the
    /// number of elements removed.
    pub fn remove_elements<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&Element) -> bool,
    {
        let mut kept: Vec<Node> = Vec::with_capacity(self.children.len());
        let mut removed = 0;

        for node in self.children.drain(..) {
            match node {
                Node::Element(ref e) if predicate(e) => {
                    if matches!(kept.last(), Some(Node::Text(t)) if t.trim().is_empty()) {
                        kept.pop();
                    }
                    removed += 1;
                }
                other => kept.push(other),
            }
        }

        self.children = kept;
        removed
    }
}

/// A parsed XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    prolog: Vec<Node>,
    root: Element,
    epilog: Vec<Node>,
}

impl Document {
    /// Wrap a root element.
    pub fn new(root: Element) -> Self {
        Self {
            prolog: Vec::new(),
            root,
            epilog: Vec::new(),
        }
    }

    /// Parse a document from text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseFailure`] if the text is not well-formed XML or
    /// does not contain exactly one root element.
    pub fn parse(input: &str) -> Result<Self> {
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        let mut prolog: Vec<Node> = Vec::new();
        let mut epilog: Vec<Node> = Vec::new();

        loop {
            let event = reader.read_event().map_err(|e| {
                Error::parse(format!("at byte {}: {}", reader.buffer_position(), e))
            })?;

            // Nodes outside the root go before or after it.
            let node = match event {
                Event::Start(start) => {
                    stack.push(element_from_start(&start)?);
                    continue;
                }
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                    continue;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::parse("closing tag without matching start"))?;
                    attach(&mut stack, &mut root, element)?;
                    continue;
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| Error::parse(e.to_string()))?
                        .into_owned();
                    if stack.is_empty() && !text.trim().is_empty() {
                        return Err(Error::parse("text content outside the root element"));
                    }
                    Node::Text(text)
                }
                Event::CData(data) => {
                    if stack.is_empty() {
                        return Err(Error::parse("CDATA outside the root element"));
                    }
                    let data = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| Error::parse(e.to_string()))?;
                    Node::CData(data)
                }
                Event::Comment(comment) => {
                    Node::Comment(String::from_utf8_lossy(&comment).into_owned())
                }
                Event::PI(pi) => {
                    Node::ProcessingInstruction(String::from_utf8_lossy(&pi).into_owned())
                }
                Event::Decl(decl) => Node::Declaration(String::from_utf8_lossy(&decl).into_owned()),
                Event::DocType(doctype) => {
                    Node::DocType(String::from_utf8_lossy(&doctype).into_owned())
                }
                Event::Eof => break,
            };

            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None if root.is_none() => prolog.push(node),
                None => epilog.push(node),
            }
        }

        if let Some(open) = stack.last() {
            return Err(Error::parse(format!(
                "unexpected end of document inside <{}>",
                open.name
            )));
        }

        let root = root.ok_or_else(|| Error::parse("document has no root element"))?;
        Ok(Self {
            prolog,
            root,
            epilog,
        })
    }

    /// The root element.
    pub fn root(&self) -> &Element {
        &self.root
    }

    /// The root element, mutably.
    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    /// Serialize the document.
    ///
    /// Everything around the root is written back as parsed. A document
    /// without an XML declaration gets a UTF-8 one.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        if !self
            .prolog
            .iter()
            .any(|node| matches!(node, Node::Declaration(_)))
        {
            writer
                .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
                .map_err(write_failed)?;
            writer.get_mut().write_all(b"\n")?;
        }

        for node in &self.prolog {
            write_node(&mut writer, node)?;
        }
        write_element(&mut writer, &self.root)?;
        for node in &self.epilog {
            write_node(&mut writer, node)?;
        }
        if self.epilog.is_empty() {
            writer.get_mut().write_all(b"\n")?;
        }

        String::from_utf8(writer.into_inner()).map_err(|e| Error::parse(e.to_string()))
    }
}

/// Build an element (without children) from a start tag.
fn element_from_start(start: &BytesStart<'_>) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());

    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::parse(e.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }

    Ok(element)
}

/// Attach a completed element to its parent, or make it the root.
fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => return Err(Error::parse("document has more than one root element")),
    }
    Ok(())
}

fn write_element<W: Write>(writer: &mut Writer<W>, element: &Element) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        writer.write_event(Event::Empty(start)).map_err(write_failed)?;
        return Ok(());
    }

    writer.write_event(Event::Start(start)).map_err(write_failed)?;
    for child in &element.children {
        write_node(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(write_failed)?;

    Ok(())
}

fn write_node<W: Write>(writer: &mut Writer<W>, node: &Node) -> Result<()> {
    match node {
        Node::Element(e) => write_element(writer, e)?,
        Node::Text(t) => writer
            .write_event(Event::Text(BytesText::from_escaped(partial_escape(t.as_str()))))
            .map_err(write_failed)?,
        Node::CData(c) => writer
            .write_event(Event::CData(BytesCData::new(c.as_str())))
            .map_err(write_failed)?,
        Node::Comment(c) => writer
            .write_event(Event::Comment(BytesText::from_escaped(c.as_str())))
            .map_err(write_failed)?,
        Node::ProcessingInstruction(raw) | Node::Declaration(raw) => {
            write!(writer.get_mut(), "<?{}?>", raw)?
        }
        Node::DocType(raw) => writer
            .write_event(Event::DocType(BytesText::from_escaped(raw.as_str())))
            .map_err(write_failed)?,
    }
    Ok(())
}

fn write_failed<E: std::fmt::Display>(e: E) -> Error {
    Error::io_simple(std::io::Error::other(e.to_string()))
}
