//! In-memory case definition tree.
//!
//! The tree keeps every node quick-xml reports (text, comments, CDATA,
//! processing instructions) so that writing it back only changes the
//! attribute values the binder touched.
//!
//! Node selection understands the subset of ElementTree paths the contract
//! files use: `./a/b`, `a/b`, `.//b`, `*` and `.`. Absolute paths, `..` and
//! bracket predicates are rejected with `InvalidPath`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::errors::{CalResult, CalibrationError};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
    CData(String),
    ProcessingInstruction(String),
    DocType(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Overwrite an existing attribute. Returns `false` when the attribute is
    /// absent; new attributes are never created.
    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) -> bool {
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, slot)) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    pub fn child_elements(&self) -> impl Iterator<Item = (usize, &Element)> {
        self.children.iter().enumerate().filter_map(|(i, n)| match n {
            Node::Element(e) => Some((i, e)),
            _ => None,
        })
    }

    fn child_element_mut(&mut self, index: usize) -> Option<&mut Element> {
        match self.children.get_mut(index) {
            Some(Node::Element(e)) => Some(e),
            _ => None,
        }
    }
}

/// Location of an element as child indices from the root.
pub type ElementPath = Vec<usize>;

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    /// Raw declaration body (`xml version="1.0" ...`), if present.
    declaration: Option<String>,
    prolog: Vec<Node>,
    root: Element,
    epilog: Vec<Node>,
}

impl ConfigDocument {
    pub fn load(path: &Path) -> CalResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> CalResult<Self> {
        let mut reader = Reader::from_str(text);
        reader.trim_text(false);

        let mut declaration = None;
        let mut prolog = Vec::new();
        let mut epilog = Vec::new();
        let mut root: Option<Element> = None;
        let mut stack: Vec<Element> = Vec::new();

        loop {
            let node = match reader.read_event()? {
                Event::Eof => break,
                Event::Decl(decl) => {
                    declaration = Some(String::from_utf8_lossy(&decl).into_owned());
                    continue;
                }
                Event::Start(start) => {
                    stack.push(element_from_start(&start)?);
                    continue;
                }
                Event::Empty(start) => Node::Element(element_from_start(&start)?),
                Event::End(_) => match stack.pop() {
                    Some(element) => Node::Element(element),
                    None => {
                        return Err(CalibrationError::Validation(
                            "unbalanced closing tag in document".into(),
                        ))
                    }
                },
                Event::Text(text) => Node::Text(text.unescape()?.into_owned()),
                Event::CData(data) => {
                    Node::CData(String::from_utf8_lossy(&data.into_inner()).into_owned())
                }
                Event::Comment(comment) => Node::Comment(String::from_utf8_lossy(&comment).into_owned()),
                Event::PI(pi) => Node::ProcessingInstruction(String::from_utf8_lossy(&pi).into_owned()),
                Event::DocType(doctype) => Node::DocType(String::from_utf8_lossy(&doctype).into_owned()),
            };

            match (stack.last_mut(), node) {
                (Some(parent), node) => parent.children.push(node),
                (None, Node::Element(element)) if root.is_none() => root = Some(element),
                (None, Node::Element(element)) => {
                    return Err(CalibrationError::Validation(format!(
                        "second root element <{}> in document",
                        element.name
                    )))
                }
                (None, node) if root.is_none() => prolog.push(node),
                (None, node) => epilog.push(node),
            }
        }

        if let Some(open) = stack.last() {
            return Err(CalibrationError::Validation(format!(
                "element <{}> is never closed",
                open.name
            )));
        }
        let root = root.ok_or_else(|| CalibrationError::Validation("document has no root element".into()))?;
        Ok(Self {
            declaration,
            prolog,
            root,
            epilog,
        })
    }

    pub fn to_xml_string(&self) -> CalResult<String> {
        let mut buffer = Vec::new();
        if let Some(decl) = &self.declaration {
            buffer.extend_from_slice(format!("<?{decl}?>").as_bytes());
        }
        let mut writer = Writer::new(buffer);
        for node in &self.prolog {
            write_node(&mut writer, node)?;
        }
        write_element(&mut writer, &self.root)?;
        for node in &self.epilog {
            write_node(&mut writer, node)?;
        }
        let bytes = writer.into_inner();
        String::from_utf8(bytes)
            .map_err(|e| CalibrationError::Validation(format!("document is not UTF-8: {e}")))
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn element(&self, path: &[usize]) -> Option<&Element> {
        let mut current = &self.root;
        for &index in path {
            current = match current.children.get(index) {
                Some(Node::Element(e)) => e,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn element_mut(&mut self, path: &[usize]) -> Option<&mut Element> {
        let mut current = &mut self.root;
        for &index in path {
            current = current.child_element_mut(index)?;
        }
        Some(current)
    }

    /// Elements matching `node_id`, in document order.
    pub fn select(&self, node_id: &str) -> CalResult<Vec<ElementPath>> {
        let steps = parse_steps(node_id)?;
        let mut current: Vec<ElementPath> = vec![Vec::new()];
        let mut descend = false;

        for step in steps {
            match step {
                Step::SelfNode => continue,
                Step::Descendants => {
                    descend = true;
                    continue;
                }
                Step::Tag(tag) => {
                    let mut seen = HashSet::new();
                    let mut next = Vec::new();
                    for base in &current {
                        let Some(element) = self.element(base) else { continue };
                        let mut found = Vec::new();
                        if descend {
                            collect_descendants(element, base, tag, &mut found);
                        } else {
                            for (i, child) in element.child_elements() {
                                if tag_matches(tag, &child.name) {
                                    let mut path = base.clone();
                                    path.push(i);
                                    found.push(path);
                                }
                            }
                        }
                        for path in found {
                            if seen.insert(path.clone()) {
                                next.push(path);
                            }
                        }
                    }
                    current = next;
                    descend = false;
                }
            }
        }
        Ok(current)
    }

    pub fn find_all(&self, node_id: &str) -> CalResult<Vec<&Element>> {
        Ok(self
            .select(node_id)?
            .iter()
            .filter_map(|p| self.element(p))
            .collect())
    }

    /// Depth-first walk over every element below the root, passing its
    /// `./a/b/tag` path.
    pub fn walk<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &Element),
    {
        fn recurse<F: FnMut(&str, &Element)>(element: &Element, prefix: &str, visit: &mut F) {
            for (_, child) in element.child_elements() {
                let path = format!("{prefix}/{}", child.name);
                visit(&path, child);
                recurse(child, &path, visit);
            }
        }
        recurse(&self.root, ".", &mut visit);
    }
}

// ---------------------------------------------------------------------------
// Path parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Step<'a> {
    SelfNode,
    Descendants,
    Tag(&'a str),
}

fn parse_steps(node_id: &str) -> CalResult<Vec<Step<'_>>> {
    let invalid = |reason: &str| CalibrationError::InvalidPath {
        path: node_id.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = node_id.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty path"));
    }
    if trimmed.starts_with('/') {
        return Err(invalid("absolute paths are not supported"));
    }
    if trimmed.contains('[') || trimmed.contains('@') {
        return Err(invalid("predicates are not supported"));
    }
    if trimmed.ends_with('/') {
        return Err(invalid("trailing separator"));
    }

    let mut steps = Vec::new();
    let mut previous_empty = false;
    for (i, segment) in trimmed.split('/').enumerate() {
        match segment {
            "" if i == 0 => return Err(invalid("absolute paths are not supported")),
            "" if previous_empty => return Err(invalid("empty step")),
            "" => {
                previous_empty = true;
                steps.push(Step::Descendants);
                continue;
            }
            "." => steps.push(Step::SelfNode),
            ".." => return Err(invalid("parent steps are not supported")),
            tag => steps.push(Step::Tag(tag)),
        }
        previous_empty = false;
    }
    Ok(steps)
}

fn tag_matches(pattern: &str, name: &str) -> bool {
    pattern == "*" || pattern == name
}

fn collect_descendants(element: &Element, base: &ElementPath, tag: &str, out: &mut Vec<ElementPath>) {
    for (i, child) in element.child_elements() {
        let mut path = base.clone();
        path.push(i);
        if tag_matches(tag, &child.name) {
            out.push(path.clone());
        }
        collect_descendants(child, &path, tag, out);
    }
}

// ---------------------------------------------------------------------------
// quick-xml glue
// ---------------------------------------------------------------------------

fn element_from_start(start: &BytesStart<'_>) -> CalResult<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> CalResult<()> {
    match node {
        Node::Element(element) => write_element(writer, element)?,
        Node::Text(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
        Node::Comment(text) => writer.write_event(Event::Comment(BytesText::from_escaped(text.as_str())))?,
        Node::CData(text) => writer.write_event(Event::CData(BytesCData::new(text.as_str())))?,
        Node::ProcessingInstruction(text) => {
            writer.write_event(Event::PI(BytesText::from_escaped(text.as_str())))?
        }
        Node::DocType(text) => writer.write_event(Event::DocType(BytesText::from_escaped(text.as_str())))?,
    }
    Ok(())
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> CalResult<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    for child in &element.children {
        write_node(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}
