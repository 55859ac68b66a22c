//! Whole-document parsing into a [`Node`] tree.

use super::node::{ElementBuilder, Field, Node};
use super::options::ParserOptions;
use super::tokenizer::{Token, Tokenizer, is_blank};
use crate::error::{Error, Result};

/// Parse a complete XML document.
///
/// The result has a single key, the root element's tag key, holding the
/// root element. The root itself is never wrapped in a sequence.
pub fn parse_document(data: &[u8], options: &ParserOptions) -> Result<Node> {
    let mut tokenizer = Tokenizer::new();
    tokenizer.feed(data);
    tokenizer.finish();

    let mut stack: Vec<(String, ElementBuilder)> = Vec::new();
    let mut root: Option<Node> = None;

    while let Some(token) = tokenizer.next_token()? {
        let offset = tokenizer.token_offset();
        match token {
            Token::StartTag {
                name,
                attributes,
                self_closing,
            } => {
                if stack.is_empty() && root.is_some() {
                    return Err(Error::xml(offset, format!("second root element <{name}>")));
                }
                let builder = ElementBuilder::new(attributes);
                if self_closing {
                    close(&mut stack, &mut root, name, builder, options);
                } else {
                    stack.push((name, builder));
                }
            }
            Token::EndTag { name } => match stack.pop() {
                Some((open, builder)) if open == name => {
                    close(&mut stack, &mut root, name, builder, options);
                }
                Some((open, _)) => {
                    return Err(Error::xml(
                        offset,
                        format!("closing tag </{name}> does not match <{open}>"),
                    ));
                }
                None => {
                    return Err(Error::xml(offset, format!("unexpected closing tag </{name}>")));
                }
            },
            Token::Text(text) => match stack.last_mut() {
                Some((_, builder)) => builder.push_text(&text),
                None if is_blank(&text) => {}
                None => return Err(Error::xml(offset, "text outside the root element")),
            },
            Token::CData(text) => match stack.last_mut() {
                Some((_, builder)) => builder.push_cdata(&text),
                None if is_blank(&text) => {}
                None => return Err(Error::xml(offset, "CDATA outside the root element")),
            },
        }
    }

    if let Some((open, _)) = stack.last() {
        return Err(Error::xml(
            data.len() as u64,
            format!("document ends inside <{open}>"),
        ));
    }
    root.ok_or_else(|| Error::xml(0, "document has no root element"))
}

fn close(
    stack: &mut [(String, ElementBuilder)],
    root: &mut Option<Node>,
    name: String,
    builder: ElementBuilder,
    options: &ParserOptions,
) {
    let key = options.tag_key(&name);
    let value = builder.into_value(options);
    match stack.last_mut() {
        Some((_, parent)) => parent.push_child(key, value),
        None => {
            let mut document = Node::new();
            document.insert(key, Field::Single(value));
            *root = Some(document);
        }
    }
}
