// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Minimal domain XML editing: read or replace the text of one element
//! addressed by its path from the root, e.g. `["domain", "memory"]`.
//! Everything else in the document is copied through untouched.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum XmlError {
    #[error("reading XML failed: {0}")]
    Read(String),
    #[error("writing XML failed: {0}")]
    Write(String),
    #[error("element {0} not found")]
    ElementNotFound(String),
}

fn matches_path(stack: &[String], path: &[&str]) -> bool {
    stack.len() == path.len() && stack.iter().zip(path).all(|(a, b)| a == b)
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

/// Text content of the first element at `path`, `None` if absent.
pub fn element_text(xml: &str, path: &[&str]) -> Result<Option<String>, XmlError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut text: Option<String> = None;

    loop {
        match reader
            .read_event()
            .map_err(|e| XmlError::Read(e.to_string()))?
        {
            Event::Start(e) => {
                stack.push(element_name(&e));
                if matches_path(&stack, path) {
                    text = Some(String::new());
                }
            }
            Event::Empty(e) => {
                stack.push(element_name(&e));
                if matches_path(&stack, path) {
                    return Ok(Some(String::new()));
                }
                stack.pop();
            }
            Event::Text(e) => {
                if let Some(t) = text.as_mut() {
                    if matches_path(&stack, path) {
                        t.push_str(&e.unescape().map_err(|e| XmlError::Read(e.to_string()))?);
                    }
                }
            }
            Event::End(_) => {
                if matches_path(&stack, path) {
                    return Ok(text.map(|t| t.trim().to_owned()));
                }
                stack.pop();
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Value of attribute `attr` on the first element at `path`.
pub fn element_attr(xml: &str, path: &[&str], attr: &str) -> Result<Option<String>, XmlError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| XmlError::Read(e.to_string()))?;
        let (e, empty) = match event {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => {
                stack.pop();
                continue;
            }
            Event::Eof => return Ok(None),
            _ => continue,
        };

        stack.push(element_name(&e));
        if matches_path(&stack, path) {
            for a in e.attributes().flatten() {
                if a.key.as_ref() == attr.as_bytes() {
                    let value = a
                        .unescape_value()
                        .map_err(|e| XmlError::Read(e.to_string()))?;
                    return Ok(Some(value.into_owned()));
                }
            }
            return Ok(None);
        }
        if empty {
            stack.pop();
        }
    }
}

/// Replaces the text of the first element at `path` and sets the given
/// attributes on it, keeping its other attributes.
pub fn set_element(
    xml: &str,
    path: &[&str],
    text: &str,
    attrs: &[(&str, &str)],
) -> Result<String, XmlError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut stack: Vec<String> = Vec::new();
    let mut replaced = false;
    // Depth of the element being replaced while its old content is skipped
    let mut skipping: Option<usize> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| XmlError::Read(e.to_string()))?;

        if let Some(depth) = skipping {
            match event {
                Event::Start(_) => stack.push(String::new()),
                Event::End(e) => {
                    if stack.len() == depth {
                        skipping = None;
                        write(&mut writer, Event::Text(BytesText::new(text)))?;
                        write(&mut writer, Event::End(e))?;
                    }
                    stack.pop();
                }
                Event::Eof => return Err(XmlError::Read("unexpected end of document".into())),
                _ => {}
            }
            continue;
        }

        match event {
            Event::Start(e) => {
                stack.push(element_name(&e));
                if !replaced && matches_path(&stack, path) {
                    replaced = true;
                    skipping = Some(stack.len());
                    write(&mut writer, Event::Start(with_attrs(&e, attrs)))?;
                } else {
                    write(&mut writer, Event::Start(e))?;
                }
            }
            Event::Empty(e) => {
                stack.push(element_name(&e));
                if !replaced && matches_path(&stack, path) {
                    replaced = true;
                    let start = with_attrs(&e, attrs);
                    let name = element_name(&start);
                    write(&mut writer, Event::Start(start))?;
                    write(&mut writer, Event::Text(BytesText::new(text)))?;
                    write(&mut writer, Event::End(BytesEnd::new(name)))?;
                } else {
                    write(&mut writer, Event::Empty(e))?;
                }
                stack.pop();
            }
            Event::End(e) => {
                stack.pop();
                write(&mut writer, Event::End(e))?;
            }
            Event::Eof => break,
            e => write(&mut writer, e)?,
        }
    }

    if !replaced {
        return Err(XmlError::ElementNotFound(path.join("/")));
    }

    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| XmlError::Write(e.to_string()))
}

pub fn set_element_text(xml: &str, path: &[&str], text: &str) -> Result<String, XmlError> {
    set_element(xml, path, text, &[])
}

fn with_attrs(e: &BytesStart, attrs: &[(&str, &str)]) -> BytesStart<'static> {
    let mut start = BytesStart::new(element_name(e));
    for a in e.attributes().flatten() {
        if attrs.iter().any(|(k, _)| k.as_bytes() == a.key.as_ref()) {
            continue;
        }
        start.push_attribute(a);
    }
    for (k, v) in attrs {
        start.push_attribute((*k, *v));
    }
    start.into_owned()
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event) -> Result<(), XmlError> {
    writer
        .write_event(event)
        .map_err(|e| XmlError::Write(e.to_string()))
}
