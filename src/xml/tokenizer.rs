//! Resumable XML tokenizer.
//!
//! Input is pushed in arbitrary chunks with [`Tokenizer::feed`]; tokens are
//! pulled with [`Tokenizer::next_token`], which returns `Ok(None)` when the
//! buffered bytes end inside a token. Consumed bytes are released on the
//! next feed, so the buffer only ever holds the token being assembled.
//!
//! Comments, processing instructions and the DOCTYPE declaration are
//! skipped. CDATA sections are reported verbatim as their own token.

use memchr::{memchr, memmem};

use super::entities;
use crate::error::{Error, Result};

/// A markup or text token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    StartTag {
        name: String,
        attributes: Vec<(String, String)>,
        self_closing: bool,
    },
    EndTag {
        name: String,
    },
    /// Entity-decoded character data, whitespace preserved
    Text(String),
    /// Contents of a CDATA section, verbatim
    CData(String),
}

/// What kind of markup starts at the current position.
enum Markup {
    Declaration(&'static [u8]),
    Comment,
    CData,
    DocType,
    EndTag,
    StartTag,
}

#[derive(Debug, Default)]
pub struct Tokenizer {
    buf: Vec<u8>,
    /// Start of the next token in `buf`
    pos: usize,
    /// Absolute offset of `buf[0]`
    base: u64,
    /// Where to resume searching for the current token's terminator
    scan_from: usize,
    /// Quote open at `scan_from` inside a tag or DOCTYPE
    scan_quote: Option<u8>,
    /// Bracket depth at `scan_from` inside a DOCTYPE
    scan_depth: usize,
    /// Absolute offset of the last token returned
    token_offset: u64,
    eof: bool,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of input.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.base += self.pos as u64;
            self.scan_from = self.scan_from.saturating_sub(self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Mark the end of input; incomplete markup becomes an error.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// Bytes held for a token that is not complete yet.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Absolute offset where the most recent token started.
    pub fn token_offset(&self) -> u64 {
        self.token_offset
    }

    /// Next complete token, or `None` if more input is needed (or, after
    /// [`finish`](Self::finish), if the input is exhausted).
    pub fn next_token(&mut self) -> Result<Option<Token>> {
        loop {
            if self.pos >= self.buf.len() {
                return Ok(None);
            }
            self.token_offset = self.base + self.pos as u64;

            if self.buf[self.pos] != b'<' {
                return self.text();
            }

            let Some(markup) = self.classify()? else {
                return Ok(None);
            };

            let token = match markup {
                Markup::Declaration(terminator) => self.skip_until(terminator)?.map(|_| None),
                Markup::Comment => self.skip_until(b"-->")?.map(|_| None),
                Markup::CData => self.cdata()?.map(Some),
                Markup::DocType => self.doctype()?.map(|_| None),
                Markup::EndTag => self.end_tag()?.map(Some),
                Markup::StartTag => self.start_tag()?.map(Some),
            };

            match token {
                // markup not complete yet
                None => return Ok(None),
                // skipped construct
                Some(None) => continue,
                Some(Some(token)) => return Ok(Some(token)),
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::xml(self.token_offset, message)
    }

    fn need_more<T>(&self, what: &str) -> Result<Option<T>> {
        if self.eof {
            Err(self.error(format!("unterminated {what}")))
        } else {
            Ok(None)
        }
    }

    /// Consume the current token ending just before `end`.
    fn advance_to(&mut self, end: usize) {
        self.pos = end;
        self.scan_from = 0;
        self.scan_quote = None;
        self.scan_depth = 0;
    }

    fn classify(&mut self) -> Result<Option<Markup>> {
        const COMMENT: &[u8] = b"<!--";
        const CDATA: &[u8] = b"<![CDATA[";
        const DOCTYPE: &[u8] = b"<!DOCTYPE";

        let rest = &self.buf[self.pos..];
        let Some(&second) = rest.get(1) else {
            return self.need_more("markup");
        };

        Ok(Some(match second {
            b'?' => Markup::Declaration(b"?>"),
            b'/' => Markup::EndTag,
            b'!' if rest.starts_with(COMMENT) => Markup::Comment,
            b'!' if rest.starts_with(CDATA) => Markup::CData,
            b'!' if rest.starts_with(DOCTYPE) => Markup::DocType,
            b'!' if [COMMENT, CDATA, DOCTYPE].iter().any(|m| m.starts_with(rest)) => {
                return self.need_more("markup");
            }
            b'!' => Markup::Declaration(b">"),
            _ => Markup::StartTag,
        }))
    }

    /// Find `needle` at or after `start`, remembering how far was searched.
    fn find(&mut self, start: usize, needle: &[u8]) -> Option<usize> {
        let from = start.max(self.scan_from);
        match memmem::find(&self.buf[from..], needle) {
            Some(i) => Some(from + i),
            None => {
                self.scan_from = start.max(self.buf.len().saturating_sub(needle.len() - 1));
                None
            }
        }
    }

    fn utf8<'a>(&self, bytes: &'a [u8]) -> Result<&'a str> {
        std::str::from_utf8(bytes).map_err(|e| self.error(format!("invalid UTF-8: {e}")))
    }

    fn text(&mut self) -> Result<Option<Token>> {
        let start = self.pos;
        let from = start.max(self.scan_from);
        let end = match memchr(b'<', &self.buf[from..]) {
            Some(i) => from + i,
            None if self.eof => self.buf.len(),
            None => {
                self.scan_from = self.buf.len();
                return Ok(None);
            }
        };

        let text = entities::decode(self.utf8(&self.buf[start..end])?).into_owned();
        self.advance_to(end);
        Ok(Some(Token::Text(text)))
    }

    fn skip_until(&mut self, terminator: &[u8]) -> Result<Option<()>> {
        match self.find(self.pos + 2, terminator) {
            Some(i) => {
                self.advance_to(i + terminator.len());
                Ok(Some(()))
            }
            None => self.need_more("declaration or comment"),
        }
    }

    fn cdata(&mut self) -> Result<Option<Token>> {
        let start = self.pos + b"<![CDATA[".len();
        match self.find(start, b"]]>") {
            Some(end) => {
                let text = self.utf8(&self.buf[start..end])?.to_string();
                self.advance_to(end + 3);
                Ok(Some(Token::CData(text)))
            }
            None => self.need_more("CDATA section"),
        }
    }

    /// Skip a DOCTYPE, including an internal subset in brackets.
    fn doctype(&mut self) -> Result<Option<()>> {
        let from = (self.pos + 2).max(self.scan_from);
        let mut quote = self.scan_quote;
        let mut depth = self.scan_depth;
        for (i, &b) in self.buf[from..].iter().enumerate() {
            match (quote, b) {
                (Some(q), _) if b == q => quote = None,
                (Some(_), _) => {}
                (None, b'"' | b'\'') => quote = Some(b),
                (None, b'[') => depth += 1,
                (None, b']') => depth = depth.saturating_sub(1),
                (None, b'>') if depth == 0 => {
                    self.advance_to(from + i + 1);
                    return Ok(Some(()));
                }
                _ => {}
            }
        }
        self.suspend_scan(quote, depth);
        self.need_more("DOCTYPE declaration")
    }

    /// Remember how far a quote-aware scan got before the input ran out.
    fn suspend_scan(&mut self, quote: Option<u8>, depth: usize) {
        self.scan_from = self.buf.len();
        self.scan_quote = quote;
        self.scan_depth = depth;
    }

    fn end_tag(&mut self) -> Result<Option<Token>> {
        let Some(end) = self.find(self.pos + 2, b">") else {
            return self.need_more("closing tag");
        };
        let name = self.utf8(&self.buf[self.pos + 2..end])?.trim_end();
        validate_name(name).map_err(|m| self.error(m))?;
        let name = name.to_string();
        self.advance_to(end + 1);
        Ok(Some(Token::EndTag { name }))
    }

    fn start_tag(&mut self) -> Result<Option<Token>> {
        // '>' may appear inside quoted attribute values
        let from = (self.pos + 1).max(self.scan_from);
        let mut quote = self.scan_quote;
        let mut close = None;
        for (i, &b) in self.buf[from..].iter().enumerate() {
            match (quote, b) {
                (Some(q), _) if b == q => quote = None,
                (Some(_), _) => {}
                (None, b'"' | b'\'') => quote = Some(b),
                (None, b'<') => return Err(self.error("'<' inside a tag")),
                (None, b'>') => {
                    close = Some(from + i);
                    break;
                }
                _ => {}
            }
        }
        let Some(end) = close else {
            self.suspend_scan(quote, 0);
            return self.need_more("tag");
        };

        let mut inner = self.utf8(&self.buf[self.pos + 1..end])?;
        let self_closing = inner.ends_with('/');
        if self_closing {
            inner = &inner[..inner.len() - 1];
        }

        let (name, attributes) = parse_tag(inner).map_err(|m| self.error(m))?;
        self.advance_to(end + 1);
        Ok(Some(Token::StartTag {
            name,
            attributes,
            self_closing,
        }))
    }
}

fn validate_name(name: &str) -> std::result::Result<(), String> {
    let Some(first) = name.chars().next() else {
        return Err("empty element name".to_string());
    };
    let bad_start = first.is_ascii_digit() || matches!(first, '-' | '.');
    let bad_char = name
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '/' | '"' | '\'' | '='));
    if bad_start || bad_char {
        return Err(format!("invalid element name '{name}'"));
    }
    Ok(())
}

/// Whether character data carries no content (whitespace or a byte order mark).
pub(crate) fn is_blank(text: &str) -> bool {
    text.chars().all(|c| c.is_whitespace() || c == '\u{feff}')
}

/// Split the inside of a start tag into its name and attributes.
fn parse_tag(inner: &str) -> std::result::Result<(String, Vec<(String, String)>), String> {
    let name_end = inner
        .find(|c: char| c.is_whitespace())
        .unwrap_or(inner.len());
    let name = &inner[..name_end];
    validate_name(name)?;

    let mut attributes: Vec<(String, String)> = Vec::new();
    let mut rest = inner[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("attribute without value in <{name}>"))?;
        let attr = rest[..eq].trim_end();
        if attr.is_empty() || attr.contains(char::is_whitespace) {
            return Err(format!("malformed attribute in <{name}>"));
        }

        rest = rest[eq + 1..].trim_start();
        let quote = rest
            .chars()
            .next()
            .filter(|c| matches!(c, '"' | '\''))
            .ok_or_else(|| format!("unquoted value for attribute '{attr}' in <{name}>"))?;
        let close = rest[1..]
            .find(quote)
            .ok_or_else(|| format!("unterminated value for attribute '{attr}' in <{name}>"))?;
        let value = entities::decode(&rest[1..1 + close]).into_owned();

        // a repeated attribute keeps its last value
        match attributes.iter_mut().find(|entry| entry.0 == attr) {
            Some(entry) => entry.1 = value,
            None => attributes.push((attr.to_string(), value)),
        }
        rest = rest[close + 2..].trim_start();
    }

    Ok((name.to_string(), attributes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens_in_chunks(input: &[u8], chunk: usize) -> Result<Vec<Token>> {
        let mut tokenizer = Tokenizer::new();
        let mut tokens = Vec::new();
        for piece in input.chunks(chunk) {
            tokenizer.feed(piece);
            while let Some(token) = tokenizer.next_token()? {
                tokens.push(token);
            }
        }
        tokenizer.finish();
        while let Some(token) = tokenizer.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn start(name: &str, attributes: &[(&str, &str)], self_closing: bool) -> Token {
        Token::StartTag {
            name: name.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            self_closing,
        }
    }

    fn end(name: &str) -> Token {
        Token::EndTag {
            name: name.to_string(),
        }
    }

    #[test]
    fn basic_document() {
        let tokens =
            tokens_in_chunks(br#"<?xml version="1.0"?><a x="1"><b/>hi &amp; bye</a>"#, 1024)
                .unwrap();
        assert_eq!(
            tokens,
            vec![
                start("a", &[("x", "1")], false),
                start("b", &[], true),
                Token::Text("hi & bye".to_string()),
                end("a"),
            ]
        );
    }

    #[test]
    fn every_chunk_size_gives_same_tokens() {
        let input = br#"<!DOCTYPE r [<!ENTITY e "v">]><r a='1' b="x > y"><!-- c > --><![CDATA[<raw>]]><i id="2"/></r>"#;
        let expected = tokens_in_chunks(input, input.len()).unwrap();
        for chunk in 1..input.len() {
            assert_eq!(tokens_in_chunks(input, chunk).unwrap(), expected, "chunk size {chunk}");
        }
        assert_eq!(
            expected,
            vec![
                start("r", &[("a", "1"), ("b", "x > y")], false),
                Token::CData("<raw>".to_string()),
                start("i", &[("id", "2")], true),
                end("r"),
            ]
        );
    }

    #[test]
    fn multibyte_text_split_across_chunks() {
        let input = "<t>héllo wörld</t>".as_bytes();
        let tokens = tokens_in_chunks(input, 3).unwrap();
        assert_eq!(tokens[1], Token::Text("héllo wörld".to_string()));
    }

    #[test]
    fn quote_state_survives_between_feeds() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.feed(b"<a title=\"x >");
        assert_eq!(tokenizer.next_token().unwrap(), None);
        tokenizer.feed(b" y\" n='>'");
        assert_eq!(tokenizer.next_token().unwrap(), None);
        tokenizer.feed(b">");
        assert_eq!(
            tokenizer.next_token().unwrap(),
            Some(start("a", &[("title", "x > y"), ("n", ">")], false))
        );
    }

    #[test]
    fn doctype_subset_split_across_feeds() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.feed(b"<!DOCTYPE r [<!ENTITY e \"]>\"");
        assert_eq!(tokenizer.next_token().unwrap(), None);
        tokenizer.feed(b">]><r/>");
        assert_eq!(tokenizer.next_token().unwrap(), Some(start("r", &[], true)));
    }

    #[test]
    fn large_tag_in_small_chunks() {
        let value = "v".repeat(256 * 1024);
        let input = format!("<row data=\"{value}\"/>");
        let tokens = tokens_in_chunks(input.as_bytes(), 16).unwrap();
        assert_eq!(tokens, vec![start("row", &[("data", value.as_str())], true)]);
    }

    #[test]
    fn cdata_is_reported_separately() {
        let tokens = tokens_in_chunks(b"<a>x<![CDATA[ ]]>y</a>", 5).unwrap();
        assert_eq!(tokens[2], Token::CData(" ".to_string()));
    }

    #[test]
    fn unterminated_tag_is_error_at_eof() {
        let err = tokens_in_chunks(b"<a><b id=\"1\"", 4).unwrap_err();
        assert!(matches!(err, Error::XmlSyntax { offset: 3, .. }), "{err}");
    }

    #[test]
    fn unquoted_attribute_is_error() {
        assert!(tokens_in_chunks(b"<a id=1/>", 64).is_err());
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(tokens_in_chunks(b"<1a/>", 64).is_err());
        assert!(tokens_in_chunks(b"<a></>", 64).is_err());
    }

    #[test]
    fn buffer_is_released_after_tokens() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.feed(b"<root><item id=\"1\"/><item");
        while tokenizer.next_token().unwrap().is_some() {}
        assert_eq!(tokenizer.buffered(), 5);
        tokenizer.feed(b" id=\"2\"/>");
        assert!(matches!(
            tokenizer.next_token().unwrap(),
            Some(Token::StartTag { self_closing: true, .. })
        ));
        assert_eq!(tokenizer.buffered(), 0);
    }
}
