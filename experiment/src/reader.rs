// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::io::Read;

use xml::reader::{ParserConfig, XmlEvent};

use crate::error::{Error, Result};

///
/// An owned element tree: the minimal shape the typed conversion pass needs.
/// Comments are dropped, CDATA folds into text, and surrounding whitespace is
/// trimmed.
///
#[derive(Clone, Debug)]
pub(crate) struct Element {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Text of the first child with the given tag, if any.
    pub fn find_text(&self, tag: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|child| child.tag == tag)
            .map(|child| child.text.as_str())
    }
}

pub(crate) fn parse_element_tree<R: Read>(input: R) -> Result<Element> {
    let reader = ParserConfig::new()
        .trim_whitespace(true)
        .cdata_to_characters(true)
        .create_reader(input);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    for event in reader {
        let event =
            event.map_err(|e| Error::syntax(format!("malformed experiment XML: {e}")))?;
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                stack.push(Element {
                    tag: name.local_name,
                    attrs: attributes
                        .into_iter()
                        .map(|attr| (attr.name.local_name, attr.value))
                        .collect(),
                    text: String::new(),
                    children: Vec::new(),
                });
            }
            XmlEvent::Characters(text) => {
                if let Some(top) = stack.last_mut() {
                    if !top.text.is_empty() {
                        top.text.push(' ');
                    }
                    top.text.push_str(text.trim());
                }
            }
            XmlEvent::EndElement { .. } => {
                let done = stack.pop().expect("parser guarantees balanced elements");
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => root = Some(done),
                }
            }
            _ => (),
        }
    }

    root.ok_or_else(|| Error::syntax("experiment document is empty"))
}
