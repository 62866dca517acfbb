use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Write};
use std::str;

use crate::error::{Error, Result};

const XML_NS: &[u8] = b"http://www.w3.org/XML/1998/namespace";

type NsMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Exclusive XML Canonicalization 1.0 without comments.
///
/// `inclusive_ns` is the `InclusiveNamespaces PrefixList` of the transform.
pub fn canonicalize(xml: impl AsRef<str>, inclusive_ns: Option<&[&str]>) -> Result<String> {
    let mut reader = Reader::from_str(xml.as_ref());
    reader.config_mut().trim_text(false);
    reader.config_mut().expand_empty_elements = true;

    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();

    // Stack of declared namespace maps
    let mut ns_declared_stack: Vec<NsMap> = vec![BTreeMap::new()];
    // Stack of rendered namespace maps
    let mut ns_rendered_stack: Vec<NsMap> = vec![BTreeMap::new()];
    let mut depth = 0usize;
    let mut seen_root = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if depth == 0 && seen_root {
                    return Err(Error::MalformedXml("more than one root element".into()));
                }
                seen_root = true;
                depth += 1;
                handle_start(
                    &mut writer,
                    &e,
                    &mut ns_declared_stack,
                    &mut ns_rendered_stack,
                    inclusive_ns,
                )?;
            }
            Event::End(e) => {
                writer.write_event(Event::End(e))?;
                depth = depth.saturating_sub(1);
                ns_declared_stack.pop();
                ns_rendered_stack.pop();
            }
            // Whitespace around the document element is not part of the canonical form
            Event::Text(_) | Event::GeneralRef(_) if depth == 0 => {}
            Event::Text(e) => {
                let text = e.xml_content().map_err(xml_error)?;
                let esc = escape_text_value(text.as_bytes())?;
                writer.get_mut().write_all(esc.as_bytes()).map_err(io_error)?;
            }
            Event::CData(e) => {
                // CDATA is normalized to text content
                let v = e.into_inner();
                let normalized = normalize_line_endings(&v);
                let esc = escape_text_value(&normalized)?;
                writer.get_mut().write_all(esc.as_bytes()).map_err(io_error)?;
            }
            Event::GeneralRef(e) => {
                let resolved = resolve_reference(&e)?;
                let esc = escape_text_value(resolved.as_bytes())?;
                writer.get_mut().write_all(esc.as_bytes()).map_err(io_error)?;
            }
            Event::PI(e) if depth > 0 => writer.write_event(Event::PI(e))?,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !seen_root {
        return Err(Error::MalformedXml("document has no root element".into()));
    }
    if depth != 0 {
        return Err(Error::MalformedXml("unclosed element at end of document".into()));
    }
    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

fn io_error(err: std::io::Error) -> Error {
    Error::MalformedXml(err.to_string())
}

fn xml_error(err: impl std::fmt::Display) -> Error {
    Error::MalformedXml(err.to_string())
}

/// Replaces a character or predefined entity reference with its value
fn resolve_reference(reference: &BytesRef<'_>) -> Result<String> {
    if let Some(ch) = reference.resolve_char_ref().map_err(xml_error)? {
        return Ok(ch.to_string());
    }
    let name = reference.decode().map_err(xml_error)?;
    resolve_predefined_entity(&name)
        .map(str::to_owned)
        .ok_or_else(|| Error::MalformedXml(format!("undeclared entity &{name};")))
}

/// Line endings become LF
fn normalize_line_endings(text: &[u8]) -> Cow<'_, [u8]> {
    if !text.contains(&b'\r') {
        return Cow::Borrowed(text);
    }

    let mut result = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        if text[i] == b'\r' {
            // CRLF and lone CR both become LF
            result.push(b'\n');
            i += if text.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
        } else {
            result.push(text[i]);
            i += 1;
        }
    }
    Cow::Owned(result)
}

/// Normalizes an attribute value as a parser would: literal whitespace
/// becomes a space, character references are kept as written.
fn attribute_value(raw: &[u8]) -> Result<Vec<u8>> {
    let spaced: Vec<u8> = normalize_line_endings(raw)
        .iter()
        .map(|&b| if matches!(b, b'\t' | b'\n') { b' ' } else { b })
        .collect();
    let text = str::from_utf8(&spaced)?;
    Ok(unescape(text).map_err(xml_error)?.into_owned().into_bytes())
}

/// Escape attribute value per C14N rules.
fn escape_attr_value(v: &[u8]) -> Result<String> {
    let s = str::from_utf8(v)?;
    let mut out = String::with_capacity(s.len() + s.len() / 4);
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
    Ok(out)
}

/// Escape text node value per C14N rules.
fn escape_text_value(v: &[u8]) -> Result<String> {
    let s = str::from_utf8(v)?;
    let mut out = String::with_capacity(s.len() + s.len() / 4);
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
    Ok(out)
}

fn prefix_of(name: &[u8]) -> Option<&[u8]> {
    name.iter().position(|&b| b == b':').map(|pos| &name[..pos])
}

/// Writes the start tag with canonicalized attributes and namespaces.
fn handle_start<W: Write>(
    writer: &mut Writer<W>,
    e: &BytesStart,
    ns_declared_stack: &mut Vec<NsMap>,
    ns_rendered_stack: &mut Vec<NsMap>,
    inclusive_namespaces: Option<&[&str]>,
) -> Result<()> {
    let mut current_declared = ns_declared_stack.last().cloned().unwrap_or_default();
    let ns_rendered = ns_rendered_stack.last().cloned().unwrap_or_default();

    let mut regular_attrs = vec![];
    let mut local_ns_decls = vec![];

    for attr in e.attributes().with_checks(false) {
        let attr = attr?;
        let key = attr.key.as_ref();
        let value = attribute_value(&attr.value)?;
        if key == b"xmlns" {
            local_ns_decls.push((vec![], value));
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            local_ns_decls.push((prefix.to_vec(), value));
        } else {
            regular_attrs.push((key.to_vec(), value));
        }
    }

    for (prefix, uri) in local_ns_decls {
        if uri.is_empty() {
            current_declared.remove(&prefix);
        } else {
            current_declared.insert(prefix, uri);
        }
    }

    // Visibly utilized prefixes: the element's own and those of its attributes
    let mut visibly_utilized = BTreeSet::new();
    let name = e.name();
    let name_bytes = name.as_ref();
    visibly_utilized.insert(prefix_of(name_bytes).unwrap_or_default().to_vec());

    for (key_bytes, _) in &regular_attrs {
        if let Some(prefix) = prefix_of(key_bytes)
            && prefix != b"xml"
        {
            visibly_utilized.insert(prefix.to_vec());
        }
    }

    if let Some(prefixes) = inclusive_namespaces {
        for prefix_str in prefixes {
            let prefix = if *prefix_str == "#default" { "" } else { prefix_str };
            if current_declared.contains_key(prefix.as_bytes()) {
                visibly_utilized.insert(prefix.as_bytes().to_vec());
            }
        }
    }

    let mut render_ns = Vec::new();
    for prefix in &visibly_utilized {
        match current_declared.get(prefix) {
            Some(current_uri) => {
                if ns_rendered.get(prefix) != Some(current_uri) {
                    render_ns.push((prefix.clone(), current_uri.clone()));
                }
            }
            // An unprefixed element whose ancestor rendered a default namespace
            None if prefix.is_empty() && ns_rendered.get(prefix).is_some_and(|u| !u.is_empty()) => {
                render_ns.push((vec![], vec![]));
            }
            None => {}
        }
    }
    // BTreeSet iteration already yields prefixes in lexical order

    let name_str = str::from_utf8(name_bytes)?;
    let mut tag_start = format!("<{name_str}");

    for (prefix, uri) in &render_ns {
        if prefix.is_empty() {
            tag_start.push_str(" xmlns=\"");
        } else {
            tag_start.push_str(&format!(" xmlns:{}=\"", str::from_utf8(prefix)?));
        }
        tag_start.push_str(&escape_attr_value(uri)?);
        tag_start.push('"');
    }

    // Attributes sort by namespace URI, then local name
    let mut attr_info = vec![];
    for (key_bytes, value_bytes) in regular_attrs {
        let (ns_uri, local_name) = match prefix_of(&key_bytes) {
            Some(prefix) => {
                let uri = if prefix == b"xml" {
                    XML_NS.to_vec()
                } else {
                    current_declared.get(prefix).cloned().unwrap_or_default()
                };
                (uri, key_bytes[prefix.len() + 1..].to_vec())
            }
            None => (vec![], key_bytes.clone()),
        };
        attr_info.push((ns_uri, local_name, key_bytes, value_bytes));
    }
    attr_info.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    for (_, _, key_bytes, value_bytes) in &attr_info {
        tag_start.push(' ');
        tag_start.push_str(str::from_utf8(key_bytes)?);
        tag_start.push_str("=\"");
        tag_start.push_str(&escape_attr_value(value_bytes)?);
        tag_start.push('"');
    }

    tag_start.push('>');
    writer.get_mut().write_all(tag_start.as_bytes()).map_err(io_error)?;

    ns_declared_stack.push(current_declared);

    let mut new_rendered = ns_rendered;
    for (prefix, uri) in render_ns {
        new_rendered.insert(prefix, uri);
    }
    ns_rendered_stack.push(new_rendered);
    Ok(())
}
