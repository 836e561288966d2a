//! Small extensions to `xmltree::Element` for the DAV: XML dialect.

use std::io::{Read, Write};

use xml::writer::{EventWriter, XmlEvent as XmlWEvent};
use xmltree::{Element, XMLNode};

use crate::errors::DavError;
use crate::DavResult;

pub(crate) trait ElementExt {
    /// Build an element from a possibly prefixed name like `D:href`.
    fn new2(name: &str) -> Element;
    /// Consume self, adding a text child.
    fn text(self, text: impl Into<String>) -> Element;
    /// The child elements (text/comment nodes skipped).
    fn elements(&self) -> Vec<&Element>;
    /// Remove and return the first child element with this local name.
    fn take_elem(&mut self, name: &str) -> Option<Element>;
    /// Serialize to an xml-rs event writer.
    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> Result<(), xml::writer::Error>;
    /// Parse, mapping errors to a protocol 400.
    fn parse2<R: Read>(r: R) -> DavResult<Element>;
}

impl ElementExt for Element {
    fn new2(name: &str) -> Element {
        match name.split_once(':') {
            Some((prefix, local)) => {
                let mut e = Element::new(local);
                e.prefix = Some(prefix.to_string());
                e
            }
            None => Element::new(name),
        }
    }

    fn text(mut self, text: impl Into<String>) -> Element {
        self.children.push(XMLNode::Text(text.into()));
        self
    }

    fn elements(&self) -> Vec<&Element> {
        self.children
            .iter()
            .filter_map(|n| n.as_element())
            .collect()
    }

    fn take_elem(&mut self, name: &str) -> Option<Element> {
        let pos = self.children.iter().position(|n| {
            n.as_element()
                .map(|e| e.name == name)
                .unwrap_or(false)
        })?;
        match self.children.remove(pos) {
            XMLNode::Element(e) => Some(e),
            _ => None,
        }
    }

    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> Result<(), xml::writer::Error> {
        let fullname = match &self.prefix {
            Some(p) => format!("{}:{}", p, self.name),
            None => self.name.clone(),
        };
        let mut ev = XmlWEvent::start_element(fullname.as_str());
        if let Some(ns) = &self.namespace {
            ev = match &self.prefix {
                Some(prefix) => ev.ns(prefix.as_str(), ns.as_str()),
                None => ev.default_ns(ns.as_str()),
            };
        }
        for (key, value) in &self.attributes {
            ev = ev.attr(key.as_str(), value.as_str());
        }
        emitter.write(ev)?;
        for node in &self.children {
            match node {
                XMLNode::Element(e) => e.write_ev(emitter)?,
                XMLNode::Text(t) => emitter.write(XmlWEvent::characters(t))?,
                _ => {}
            }
        }
        emitter.write(XmlWEvent::end_element())
    }

    fn parse2<R: Read>(r: R) -> DavResult<Element> {
        Element::parse(r).map_err(|_| DavError::XmlReadError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn prefixed_name_roundtrip() {
        let e = Element::new2("D:lockscope");
        assert_eq!(e.prefix.as_deref(), Some("D"));
        assert_eq!(e.name, "lockscope");
    }

    #[test]
    fn take_elem_removes_child() {
        let xml = br#"<a><b>one</b><c/></a>"#;
        let mut e = Element::parse2(Cursor::new(&xml[..])).unwrap();
        let b = e.take_elem("b").unwrap();
        assert_eq!(b.get_text().as_deref(), Some("one"));
        assert!(e.take_elem("b").is_none());
    }
}
