// ── Owned XML element tree ──
//
// NETCONF payloads are small XML documents. Inbound messages are parsed
// with roxmltree and converted into this owned tree so they can outlive
// the receive buffer (the last-synced device snapshot is held for the
// lifetime of a session). Outbound messages are built by the `rpc`
// module and serialised back to text here.

use crate::error::ProtoError;

/// An owned XML element: resolved namespace, attributes, element
/// children and text content.
///
/// Attribute names are stored as written (prefixed names like
/// `nc:operation` survive serialisation; on parse the resolved local
/// name is kept). Namespace *declarations* are not kept as attributes;
/// each element carries its resolved namespace URI instead and the
/// serialiser re-emits `xmlns` where the namespace changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub namespace: Option<String>,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: Option<String>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attrs: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn element(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::new(name)
        }
    }

    // ── Builder helpers ──────────────────────────────────────────────

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// First element child with the given (local) name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// All element children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Walk a path of child names, e.g. `["data", "netconf-state", "schemas"]`.
    pub fn find(&self, path: &[&str]) -> Option<&XmlNode> {
        let mut cur = self;
        for name in path {
            cur = cur.child(name)?;
        }
        Some(cur)
    }

    /// Text content of this element, if any.
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Text content of the first child with the given name.
    pub fn child_body(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.body())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value.into();
        } else {
            self.attrs.push((name, value.into()));
        }
    }

    /// Sort element children recursively by (name, `<name>` key body).
    ///
    /// Gives list entries a stable order so structural comparison and
    /// diffing do not depend on device emission order.
    pub fn sort_recurse(&mut self) {
        for c in &mut self.children {
            c.sort_recurse();
        }
        self.children.sort_by(|a, b| {
            (a.name.as_str(), a.child_body("name"))
                .cmp(&(b.name.as_str(), b.child_body("name")))
        });
    }

    // ── Parsing ──────────────────────────────────────────────────────

    /// Parse an XML document into an owned tree.
    pub fn parse(input: &str) -> Result<XmlNode, ProtoError> {
        let doc = roxmltree::Document::parse(input)?;
        Ok(convert(doc.root_element()))
    }

    // ── Serialisation ────────────────────────────────────────────────

    /// Serialise to a string, emitting `xmlns` declarations where the
    /// namespace differs from the parent's.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(None, &mut out);
        out
    }

    fn write_into(&self, inherited: Option<&str>, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        if let Some(ns) = self.namespace.as_deref() {
            if inherited != Some(ns) {
                out.push_str(" xmlns=\"");
                push_escaped(ns, out);
                out.push('"');
            }
        }
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            push_escaped(value, out);
            out.push('"');
        }
        let ns = self.namespace.as_deref().or(inherited);
        if self.children.is_empty() && self.text.is_none() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(text) = &self.text {
            push_escaped(text, out);
        }
        for child in &self.children {
            child.write_into(ns, out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn convert(elem: roxmltree::Node<'_, '_>) -> XmlNode {
    let mut node = XmlNode::new(elem.tag_name().name());
    node.namespace = elem.tag_name().namespace().map(str::to_string);
    for attr in elem.attributes() {
        node.attrs
            .push((attr.name().to_string(), attr.value().to_string()));
    }
    let mut text = String::new();
    for child in elem.children() {
        if child.is_element() {
            node.children.push(convert(child));
        } else if child.is_text() {
            if let Some(t) = child.text() {
                text.push_str(t);
            }
        }
    }
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        node.text = Some(trimmed.to_string());
    }
    node
}

fn push_escaped(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_namespaces() {
        let node = XmlNode::parse(
            "<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\
             <capabilities><capability>urn:ietf:params:netconf:base:1.1</capability>\
             </capabilities></hello>",
        )
        .unwrap();
        assert_eq!(node.name, "hello");
        assert_eq!(
            node.namespace.as_deref(),
            Some("urn:ietf:params:xml:ns:netconf:base:1.0")
        );
        let cap = node.find(&["capabilities", "capability"]).unwrap();
        assert_eq!(cap.body(), Some("urn:ietf:params:netconf:base:1.1"));
    }

    #[test]
    fn serialise_emits_xmlns_on_namespace_change() {
        let node = XmlNode::element("rpc", "urn:a")
            .with_attr("message-id", "7")
            .with_child(XmlNode::element("get-schema", "urn:b").with_child(
                XmlNode::element("identifier", "urn:b").with_text("m1"),
            ));
        let xml = node.to_xml();
        assert!(xml.starts_with("<rpc xmlns=\"urn:a\" message-id=\"7\">"));
        assert!(xml.contains("<get-schema xmlns=\"urn:b\">"));
        // identifier inherits urn:b, no re-declaration
        assert!(xml.contains("<identifier>m1</identifier>"));
    }

    #[test]
    fn roundtrip_preserves_structure() {
        let xml = "<config xmlns=\"urn:x\"><interfaces><interface><name>eth0</name>\
                   <mtu>1500</mtu></interface></interfaces></config>";
        let node = XmlNode::parse(xml).unwrap();
        let reparsed = XmlNode::parse(&node.to_xml()).unwrap();
        assert_eq!(node, reparsed);
    }

    #[test]
    fn text_is_entity_decoded_on_parse() {
        let node = XmlNode::parse("<data>a &lt; b &amp; c</data>").unwrap();
        assert_eq!(node.body(), Some("a < b & c"));
        assert!(node.to_xml().contains("a &lt; b &amp; c"));
    }

    #[test]
    fn sort_recurse_orders_list_entries_by_key() {
        let mut node = XmlNode::parse(
            "<root><item><name>b</name></item><item><name>a</name></item></root>",
        )
        .unwrap();
        node.sort_recurse();
        assert_eq!(node.children[0].child_body("name"), Some("a"));
        assert_eq!(node.children[1].child_body("name"), Some("b"));
    }
}
