//! Minimal namespace-aware XML tree over the raw message text.
//!
//! The tree is used to locate elements (by name or by `ID`) and read their
//! content. Each element remembers the byte span it occupies in the source,
//! so signed subtrees are canonicalized from the bytes the IdP actually sent.
//! Comments, processing instructions and the XML declaration are dropped;
//! document type declarations are rejected.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::ops::Range;
use xml_canonicalization::Canonicalizer;

pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Deepest element nesting `parse` accepts. SAML messages stay well below it.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Qualified name as written (`ID`, `xml:lang`, `xsi:type`).
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Element {
    /// Qualified name as written (`saml:Assertion`).
    pub name: String,
    /// Resolved namespace URI of the element name.
    pub namespace: Option<String>,
    /// Attributes other than namespace declarations.
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
    /// In-scope namespace bindings, `""` is the default namespace.
    scope: BTreeMap<String, String>,
    /// Prefixes declared on this element's own start tag.
    declared: Vec<String>,
    /// Byte range of the element in the parsed source, tags included.
    span: Range<usize>,
}

impl Element {
    pub fn prefix(&self) -> &str {
        self.name.split_once(':').map(|(p, _)| p).unwrap_or("")
    }

    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map(|(_, l)| l)
            .unwrap_or(&self.name)
    }

    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.local_name() == local_name && self.namespace.as_deref() == Some(namespace)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn children_named<'a, 'n>(
        &'a self,
        namespace: &'n str,
        local_name: &'n str,
    ) -> impl Iterator<Item = &'a Element> + 'n
    where
        'a: 'n,
    {
        self.child_elements()
            .filter(move |e| e.is(namespace, local_name))
    }

    pub fn child(&self, namespace: &str, local_name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.is(namespace, local_name))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Trimmed text content, `None` when empty.
    pub fn trimmed_text(&self) -> Option<String> {
        let text = self.text();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    pub fn resolve_prefix(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NS);
        }
        self.scope
            .get(prefix)
            .map(String::as_str)
            .filter(|uri| !uri.is_empty())
    }

    /// Depth-first search for the element carrying `ID="id"`.
    pub fn find_by_id(&self, id: &str) -> Option<&Element> {
        if self.attr("ID") == Some(id) {
            return Some(self);
        }
        self.child_elements().find_map(|c| c.find_by_id(id))
    }

    /// Every `ID` attribute value in the subtree, in document order.
    pub fn collect_ids<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Some(id) = self.attr("ID") {
            out.push(id);
        }
        for child in self.child_elements() {
            child.collect_ids(out);
        }
    }

    /// Bindings inherited from ancestors, as declarations to re-attach when
    /// the element is cut out of its document.
    fn inherited_declarations(&self) -> String {
        let mut out = String::new();
        for (prefix, uri) in &self.scope {
            if uri.is_empty() || self.declared.contains(prefix) {
                continue;
            }
            push_declaration(prefix, &escape_attr(uri), &mut out);
        }
        out
    }
}

/// Parse a document into its root element.
pub fn parse(xml: &str) -> Result<Element, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let offset = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                check_depth(&stack)?;
                let mut element = open_element(&e, stack.last())?;
                element.span.start = offset;
                stack.push(element);
            }
            Ok(Event::Empty(e)) => {
                check_depth(&stack)?;
                let mut element = open_element(&e, stack.last())?;
                element.span = offset..reader.buffer_position() as usize;
                close_element(element, &mut stack, &mut root)?;
            }
            Ok(Event::End(_)) => {
                let mut element = stack.pop().ok_or("unexpected closing tag")?;
                element.span.end = reader.buffer_position() as usize;
                close_element(element, &mut stack, &mut root)?;
            }
            Ok(Event::Text(t)) => {
                let raw = std::str::from_utf8(&t).map_err(|e| e.to_string())?;
                let text = quick_xml::escape::unescape(&normalize_line_endings(raw))
                    .map_err(|e| e.to_string())?
                    .into_owned();
                push_text(&mut stack, &text)?;
            }
            Ok(Event::CData(c)) => {
                let bytes = c.into_inner();
                let text = std::str::from_utf8(&bytes).map_err(|e| e.to_string())?;
                push_text(&mut stack, &normalize_line_endings(text))?;
            }
            Ok(Event::DocType(_)) => {
                return Err("document type declarations are not allowed".to_string());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(format!(
                    "XML parse error at byte {}: {}",
                    reader.buffer_position(),
                    e
                ));
            }
        }
    }

    if !stack.is_empty() {
        return Err("unclosed element".to_string());
    }
    root.ok_or_else(|| "empty document".to_string())
}

fn check_depth(stack: &[Element]) -> Result<(), String> {
    if stack.len() >= MAX_DEPTH {
        return Err(format!("elements nested deeper than {}", MAX_DEPTH));
    }
    Ok(())
}

/// XML end-of-line handling: `\r\n` and lone `\r` become `\n`.
fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

fn open_element(start: &BytesStart<'_>, parent: Option<&Element>) -> Result<Element, String> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| e.to_string())?
        .to_string();

    let mut scope = parent.map(|p| p.scope.clone()).unwrap_or_default();
    let mut declared = Vec::new();
    let mut attributes = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = std::str::from_utf8(attr.key.as_ref()).map_err(|e| e.to_string())?;
        let raw = std::str::from_utf8(&attr.value).map_err(|e| e.to_string())?;
        // Attribute-value normalization: literal whitespace becomes a space,
        // character references survive.
        let normalized = normalize_line_endings(raw).replace(['\t', '\n'], " ");
        let value = quick_xml::escape::unescape(&normalized)
            .map_err(|e| e.to_string())?
            .into_owned();

        if key == "xmlns" {
            scope.insert(String::new(), value);
            declared.push(String::new());
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.insert(prefix.to_string(), value);
            declared.push(prefix.to_string());
        } else {
            attributes.push(Attribute {
                name: key.to_string(),
                value,
            });
        }
    }

    let mut element = Element {
        name,
        namespace: None,
        attributes,
        children: Vec::new(),
        scope,
        declared,
        span: 0..0,
    };

    let prefix = element.prefix().to_string();
    element.namespace = element.resolve_prefix(&prefix).map(str::to_string);
    if !prefix.is_empty() && element.namespace.is_none() {
        return Err(format!("unbound namespace prefix '{}'", prefix));
    }
    for attr in &element.attributes {
        if let Some((p, _)) = attr.name.split_once(':') {
            if element.resolve_prefix(p).is_none() {
                return Err(format!("unbound namespace prefix '{}'", p));
            }
        }
    }

    Ok(element)
}

fn close_element(
    element: Element,
    stack: &mut [Element],
    root: &mut Option<Element>,
) -> Result<(), String> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(element));
        Ok(())
    } else if root.is_some() {
        Err("multiple root elements".to_string())
    } else {
        *root = Some(element);
        Ok(())
    }
}

fn push_text(stack: &mut [Element], text: &str) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => {
            if let Some(Node::Text(existing)) = parent.children.last_mut() {
                existing.push_str(text);
            } else {
                parent.children.push(Node::Text(text.to_string()));
            }
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err("text outside the root element".to_string()),
    }
}

fn push_declaration(prefix: &str, escaped_uri: &str, out: &mut String) {
    if prefix.is_empty() {
        out.push_str(" xmlns=\"");
    } else {
        out.push_str(" xmlns:");
        out.push_str(prefix);
        out.push_str("=\"");
    }
    out.push_str(escaped_uri);
    out.push('"');
}

/// Exclusive XML Canonicalization (without comments) of `element`, which
/// must come from `parse(source)`.
///
/// `exclude` is a descendant cut out before canonicalizing (the
/// enveloped-signature transform). `inclusive_prefixes` is the
/// `InclusiveNamespaces PrefixList`, with `#default` naming the default
/// namespace.
pub fn canonicalize(
    source: &str,
    element: &Element,
    exclude: Option<&Element>,
    inclusive_prefixes: &[String],
) -> Result<String, String> {
    let raw = match exclude {
        Some(cut) if cut.span.start >= element.span.start && cut.span.end <= element.span.end => {
            let head = source.get(element.span.start..cut.span.start);
            let tail = source.get(cut.span.end..element.span.end);
            match (head, tail) {
                (Some(head), Some(tail)) => format!("{}{}", head, tail),
                _ => return Err("element span outside the source".to_string()),
            }
        }
        Some(_) => return Err("excluded element is not inside the signed element".to_string()),
        None => source
            .get(element.span.clone())
            .ok_or("element span outside the source")?
            .to_string(),
    };

    // The subtree is cut out of its document; carry the ancestors' bindings
    // onto its start tag so exclusive c14n can decide which ones it uses.
    let name_end = 1 + element.name.len();
    if raw.get(..name_end) != Some(format!("<{}", element.name).as_str()) {
        return Err("element span does not start with its tag".to_string());
    }
    let standalone = format!(
        "{}{}{}",
        &raw[..name_end],
        element.inherited_declarations(),
        &raw[name_end..]
    );

    let mut output = Vec::new();
    Canonicalizer::read_from_str(&normalize_line_endings(&standalone))
        .write_to_writer(&mut output)
        .canonicalize(false)
        .map_err(|e| format!("canonicalization failed: {}", e))?;
    let canonical = String::from_utf8(output).map_err(|e| e.to_string())?;

    if inclusive_prefixes.is_empty() {
        return Ok(canonical);
    }
    include_prefixes(canonical, element, inclusive_prefixes)
}

/// Render the `InclusiveNamespaces` bindings on the apex element, next to
/// whatever declarations exclusive c14n kept there.
fn include_prefixes(
    canonical: String,
    element: &Element,
    inclusive_prefixes: &[String],
) -> Result<String, String> {
    let mut reader = Reader::from_str(&canonical);
    let start = match reader.read_event() {
        Ok(Event::Start(start)) => start.into_owned(),
        _ => return Err("canonical form does not open with a start tag".to_string()),
    };
    let apex_end = reader.buffer_position() as usize;

    let mut declarations: BTreeMap<String, String> = BTreeMap::new();
    let mut attributes = String::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = std::str::from_utf8(attr.key.as_ref()).map_err(|e| e.to_string())?;
        let value = std::str::from_utf8(&attr.value).map_err(|e| e.to_string())?;
        if key == "xmlns" {
            declarations.insert(String::new(), value.to_string());
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declarations.insert(prefix.to_string(), value.to_string());
        } else {
            attributes.push(' ');
            attributes.push_str(key);
            attributes.push_str("=\"");
            attributes.push_str(value);
            attributes.push('"');
        }
    }

    for prefix in inclusive_prefixes {
        let prefix = if prefix == "#default" { "" } else { prefix.as_str() };
        if let Some(uri) = element.scope.get(prefix).filter(|uri| !uri.is_empty()) {
            declarations
                .entry(prefix.to_string())
                .or_insert_with(|| escape_attr(uri));
        }
    }

    let mut out = String::with_capacity(canonical.len());
    out.push('<');
    out.push_str(&element.name);
    for (prefix, uri) in &declarations {
        push_declaration(prefix, uri, &mut out);
    }
    out.push_str(&attributes);
    out.push('>');
    out.push_str(canonical.get(apex_end..).unwrap_or_default());
    Ok(out)
}

/// Attribute value escaping as canonical XML writes it.
fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c14n(xml: &str) -> String {
        canonicalize(xml, &parse(xml).unwrap(), None, &[]).unwrap()
    }

    #[test]
    fn test_parse_resolves_namespaces() {
        let doc = parse(
            r#"<?xml version="1.0"?>
<samlp:Response xmlns:samlp="urn:p" xmlns:saml="urn:a" ID="r1">
  <saml:Issuer>idp</saml:Issuer>
</samlp:Response>"#,
        )
        .unwrap();
        assert!(doc.is("urn:p", "Response"));
        assert_eq!(doc.attr("ID"), Some("r1"));
        let issuer = doc.child("urn:a", "Issuer").unwrap();
        assert_eq!(issuer.trimmed_text().as_deref(), Some("idp"));
        assert_eq!(doc.children_named("urn:a", "Issuer").count(), 1);
    }

    #[test]
    fn test_parse_rejects_doctype() {
        let err = parse(r#"<!DOCTYPE x [<!ENTITY a "b">]><x>&a;</x>"#).unwrap_err();
        assert!(err.contains("document type"));
    }

    #[test]
    fn test_parse_rejects_unbound_prefix() {
        assert!(parse("<a:b/>").is_err());
    }

    #[test]
    fn test_parse_limits_nesting_depth() {
        let nested = |depth: usize| format!("{}{}", "<a>".repeat(depth), "</a>".repeat(depth));
        assert!(parse(&nested(MAX_DEPTH)).is_ok());

        let err = parse(&nested(MAX_DEPTH + 1)).unwrap_err();
        assert!(err.contains("nested deeper"));

        // Far past the limit, as a hostile client would send it.
        assert!(parse(&nested(36_000)).is_err());
        let self_closing = format!("{}<b/>{}", "<a>".repeat(MAX_DEPTH), "</a>".repeat(MAX_DEPTH));
        assert!(parse(&self_closing).is_err());
    }

    #[test]
    fn test_parse_normalizes_line_endings() {
        let doc = parse("<a x=\"v1\r\nv2\">line1\r\nline2\rline3&#xD;</a>").unwrap();
        assert_eq!(doc.text(), "line1\nline2\nline3\r");
        assert_eq!(doc.attr("x"), Some("v1 v2"));
    }

    #[test]
    fn test_c14n_renders_only_used_namespaces() {
        assert_eq!(
            c14n(r#"<root xmlns="urn:a" xmlns:b="urn:b" z="1" a="2"><b:child/></root>"#),
            r#"<root xmlns="urn:a" a="2" z="1"><b:child xmlns:b="urn:b"></b:child></root>"#
        );
    }

    #[test]
    fn test_c14n_subtree_pulls_inherited_namespace() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:p" xmlns:saml="urn:a"><saml:Assertion ID="x"><saml:Issuer>idp</saml:Issuer></saml:Assertion></samlp:Response>"#;
        let doc = parse(xml).unwrap();
        let assertion = doc.find_by_id("x").unwrap();
        assert_eq!(
            canonicalize(xml, assertion, None, &[]).unwrap(),
            r#"<saml:Assertion xmlns:saml="urn:a" ID="x"><saml:Issuer>idp</saml:Issuer></saml:Assertion>"#
        );
    }

    #[test]
    fn test_c14n_sorts_attributes_by_namespace() {
        assert_eq!(
            c14n(r#"<e xmlns:x="urn:x" x:b="1" c="3" a="2"/>"#),
            r#"<e xmlns:x="urn:x" a="2" c="3" x:b="1"></e>"#
        );
    }

    #[test]
    fn test_c14n_escaping() {
        assert_eq!(
            c14n(r#"<a t="x&amp;y&quot;">1 &lt; 2 &gt; 0 &amp;</a>"#),
            r#"<a t="x&amp;y&quot;">1 &lt; 2 &gt; 0 &amp;</a>"#
        );
    }

    #[test]
    fn test_c14n_normalizes_crlf_text() {
        assert_eq!(c14n("<a>line1\r\nline2</a>"), "<a>line1\nline2</a>");
    }

    #[test]
    fn test_c14n_excludes_enveloped_element() {
        let xml = "<a><sig/><b>t</b></a>";
        let doc = parse(xml).unwrap();
        let sig = doc.child_elements().next().unwrap();
        assert_eq!(canonicalize(xml, &doc, Some(sig), &[]).unwrap(), "<a><b>t</b></a>");
    }

    #[test]
    fn test_c14n_inclusive_prefix_list() {
        let xml = r#"<r xmlns:xs="urn:xs" k="v"><v>1</v></r>"#;
        let doc = parse(xml).unwrap();
        assert_eq!(c14n(xml), r#"<r k="v"><v>1</v></r>"#);
        assert_eq!(
            canonicalize(xml, &doc, None, &["xs".to_string()]).unwrap(),
            r#"<r xmlns:xs="urn:xs" k="v"><v>1</v></r>"#
        );
    }

    #[test]
    fn test_c14n_rejects_foreign_exclusion() {
        let xml = "<a><b/></a>";
        let doc = parse(xml).unwrap();
        let other = parse("<x><y/></x>").unwrap();
        let b = doc.child_elements().next().unwrap();
        assert!(canonicalize(xml, b, Some(&doc), &[]).is_err());
        assert!(canonicalize("<a>", &other, None, &[]).is_err());
    }

    #[test]
    fn test_collect_ids() {
        let doc = parse(r#"<a ID="1"><b ID="2"/><c><d ID="3"/></c></a>"#).unwrap();
        let mut ids = Vec::new();
        doc.collect_ids(&mut ids);
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}
