use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};

/// Byte range of one element inside a document, end tag included
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ElementSpan {
    pub start: usize,
    pub end: usize,
    /// Offset right after the start tag
    pub content_start: usize,
    /// Offset of the end tag
    pub content_end: usize,
    /// Qualified name as written
    pub name: String,
    /// Written as `<name/>`
    pub empty: bool,
    /// Namespace bindings in scope at the parent, prefix `""` for the default
    pub inherited_ns: BTreeMap<String, String>,
}

/// What a search predicate can see of a start tag
pub(crate) struct StartTag<'a> {
    /// Number of ancestors, `0` for the document element
    pub depth: usize,
    pub local_name: &'a str,
    pub namespace: Option<&'a str>,
    pub element: &'a BytesStart<'a>,
}

impl StartTag<'_> {
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.local_name == local_name && self.namespace == Some(namespace)
    }

    /// Value of an `Id`/`ID` attribute, whatever its prefix
    pub fn id(&self) -> Option<String> {
        element_id(self.element)
    }
}

pub(crate) fn element_id(element: &BytesStart<'_>) -> Option<String> {
    element
        .attributes()
        .filter_map(|a| a.ok())
        .find(|attr| matches!(attr.key.local_name().as_ref(), b"Id" | b"ID"))
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

fn prefix_and_local(name: &str) -> (&str, &str) {
    name.split_once(':').unwrap_or(("", name))
}

fn xml_error(err: impl std::fmt::Display) -> Error {
    Error::MalformedXml(err.to_string())
}

/// Every outermost element matching `predicate`, in document order.
pub(crate) fn find_elements<F>(xml: &str, mut predicate: F) -> Result<Vec<ElementSpan>>
where
    F: FnMut(&StartTag<'_>) -> bool,
{
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    reader.config_mut().expand_empty_elements = true;

    let mut scopes: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    let mut found = Vec::new();
    let mut capture: Option<(ElementSpan, usize)> = None;

    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event()? {
            Event::Start(e) => {
                let after = reader.buffer_position() as usize;
                let parent = scopes.last().cloned().unwrap_or_default();
                let mut scope = parent.clone();
                for attr in e.attributes().with_checks(false) {
                    let attr = attr?;
                    let key = std::str::from_utf8(attr.key.as_ref())?;
                    let value = attr.unescape_value().map_err(xml_error)?.into_owned();
                    if key == "xmlns" {
                        scope.insert(String::new(), value);
                    } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                        scope.insert(prefix.to_owned(), value);
                    }
                }

                match capture.as_mut() {
                    Some((_, depth)) => *depth += 1,
                    None => {
                        let name = std::str::from_utf8(e.name().as_ref())?.to_owned();
                        let (prefix, local_name) = prefix_and_local(&name);
                        let namespace = scope.get(prefix).map(String::as_str).filter(|ns| !ns.is_empty());
                        let tag = StartTag {
                            depth: scopes.len() - 1,
                            local_name,
                            namespace,
                            element: &e,
                        };
                        if predicate(&tag) {
                            let span = ElementSpan {
                                start: before,
                                end: after,
                                content_start: after,
                                content_end: after,
                                empty: xml[before..after].ends_with("/>"),
                                name,
                                inherited_ns: parent,
                            };
                            capture = Some((span, 1));
                        }
                    }
                }
                scopes.push(scope);
            }
            Event::End(_) => {
                scopes.pop();
                if let Some((span, depth)) = capture.as_mut() {
                    *depth -= 1;
                    if *depth == 0 {
                        span.content_end = if span.empty { span.content_start } else { before };
                        span.end = reader.buffer_position() as usize;
                        if let Some((span, _)) = capture.take() {
                            found.push(span);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(found)
}

/// The first element matching `predicate`
pub(crate) fn find_element<F>(xml: &str, mut predicate: F) -> Result<Option<ElementSpan>>
where
    F: FnMut(&StartTag<'_>) -> bool,
{
    let mut matched = false;
    let spans = find_elements(xml, |tag| {
        if !matched {
            matched = predicate(tag);
            return matched;
        }
        false
    })?;
    Ok(spans.into_iter().next())
}

/// The document element
pub(crate) fn root_element(xml: &str) -> Result<ElementSpan> {
    find_element(xml, |_| true)?
        .ok_or_else(|| Error::MalformedXml("document has no root element".into()))
}

/// How many elements anywhere in the document carry `id`
fn count_id(xml: &str, id: &str) -> Result<usize> {
    let mut reader = Reader::from_str(xml);
    let mut count = 0;
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if element_id(&e).as_deref() == Some(id) => count += 1,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(count)
}

/// The element carrying `id`. An identifier used by more than one element
/// cannot be resolved.
pub(crate) fn find_by_id(xml: &str, id: &str) -> Result<Option<ElementSpan>> {
    match count_id(xml, id)? {
        0 => Ok(None),
        1 => find_element(xml, |tag| tag.id().as_deref() == Some(id)),
        n => Err(Error::ReferenceMismatch(format!(
            "identifier '{id}' is carried by {n} elements"
        ))),
    }
}

/// Namespace declarations written on a start tag, prefix `""` for the default
fn declared_prefixes(start_tag: &str) -> Result<BTreeSet<String>> {
    let mut reader = Reader::from_str(start_tag);
    let element = match reader.read_event()? {
        Event::Start(e) | Event::Empty(e) => e,
        other => {
            return Err(Error::MalformedXml(format!(
                "expected a start tag, found {other:?}"
            )));
        }
    };
    let mut prefixes = BTreeSet::new();
    for attr in element.attributes().with_checks(false) {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())?;
        if key == "xmlns" {
            prefixes.insert(String::new());
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            prefixes.insert(prefix.to_owned());
        }
    }
    Ok(prefixes)
}

/// The element's markup with every inherited namespace binding declared on it,
/// so that it can be canonicalized on its own.
pub(crate) fn subtree_with_ns(xml: &str, span: &ElementSpan) -> Result<String> {
    let fragment = &xml[span.start..span.end];
    let name_end = 1 + span.name.len();
    let own = declared_prefixes(&fragment[..span.content_start - span.start])?;

    let mut decls = String::new();
    for (prefix, uri) in span.inherited_ns.iter().filter(|(p, _)| !own.contains(*p)) {
        if prefix.is_empty() {
            let _ = write!(decls, " xmlns=\"{}\"", escape(uri.as_str()));
        } else {
            let _ = write!(decls, " xmlns:{prefix}=\"{}\"", escape(uri.as_str()));
        }
    }

    let mut out = String::with_capacity(fragment.len() + decls.len());
    out.push_str(&fragment[..name_end]);
    out.push_str(&decls);
    out.push_str(&fragment[name_end..]);
    Ok(out)
}

/// The document without the element
pub(crate) fn strip_span(xml: &str, span: &ElementSpan) -> String {
    let mut out = String::with_capacity(xml.len() - (span.end - span.start));
    out.push_str(&xml[..span.start]);
    out.push_str(&xml[span.end..]);
    out
}

/// Start tag of an empty element rewritten as an open tag
fn opened_start_tag<'a>(xml: &'a str, span: &ElementSpan) -> &'a str {
    xml[span.start..span.end]
        .strip_suffix("/>")
        .unwrap_or(&xml[span.start..span.end])
        .trim_end()
}

fn insert_child(xml: &str, span: &ElementSpan, fragment: &str, last: bool) -> String {
    let mut out = String::with_capacity(xml.len() + fragment.len() + span.name.len() + 3);
    if span.empty {
        out.push_str(&xml[..span.start]);
        out.push_str(opened_start_tag(xml, span));
        out.push('>');
        out.push_str(fragment);
        let _ = write!(out, "</{}>", span.name);
        out.push_str(&xml[span.end..]);
    } else {
        let at = if last { span.content_end } else { span.content_start };
        out.push_str(&xml[..at]);
        out.push_str(fragment);
        out.push_str(&xml[at..]);
    }
    out
}

/// Inserts `fragment` as the last child of the element
pub(crate) fn append_child(xml: &str, span: &ElementSpan, fragment: &str) -> String {
    insert_child(xml, span, fragment, true)
}

/// Inserts `fragment` as the first child of the element
pub(crate) fn prepend_child(xml: &str, span: &ElementSpan, fragment: &str) -> String {
    insert_child(xml, span, fragment, false)
}

/// Inserts `fragment` right before the element
pub(crate) fn insert_before(xml: &str, span: &ElementSpan, fragment: &str) -> String {
    let mut out = String::with_capacity(xml.len() + fragment.len());
    out.push_str(&xml[..span.start]);
    out.push_str(fragment);
    out.push_str(&xml[span.start..]);
    out
}

/// Replaces the element's start tag with the one `f` builds from it.
pub(crate) fn rewrite_start_tag<F>(xml: &str, span: &ElementSpan, f: F) -> Result<String>
where
    F: FnOnce(&BytesStart<'_>) -> Result<BytesStart<'static>>,
{
    let mut reader = Reader::from_str(&xml[span.start..span.content_start]);
    let start = match reader.read_event()? {
        Event::Start(e) | Event::Empty(e) => e,
        other => {
            return Err(Error::MalformedXml(format!(
                "expected a start tag, found {other:?}"
            )));
        }
    };
    let rewritten = f(&start)?;

    let mut writer = Writer::new(Vec::new());
    if span.empty {
        writer.write_event(Event::Empty(rewritten))?;
    } else {
        writer.write_event(Event::Start(rewritten))?;
    }
    let tag = String::from_utf8(writer.into_inner())?;

    let mut out = String::with_capacity(xml.len() + tag.len());
    out.push_str(&xml[..span.start]);
    out.push_str(&tag);
    out.push_str(&xml[span.content_start..]);
    Ok(out)
}

/// Text content of the element with references resolved
pub(crate) fn element_text(xml: &str, span: &ElementSpan) -> Result<String> {
    let mut reader = Reader::from_str(&xml[span.content_start..span.content_end]);
    reader.config_mut().trim_text(false);
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(e) => text.push_str(&e.xml_content().map_err(xml_error)?),
            Event::CData(e) => text.push_str(std::str::from_utf8(&e.into_inner())?),
            Event::GeneralRef(e) => {
                if let Some(ch) = e.resolve_char_ref().map_err(xml_error)? {
                    text.push(ch);
                } else {
                    let name = e.decode().map_err(xml_error)?;
                    let value = quick_xml::escape::resolve_predefined_entity(&name)
                        .ok_or_else(|| Error::MalformedXml(format!("undeclared entity &{name};")))?;
                    text.push_str(value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(text)
}
