//! Streaming extraction of rows for one element name.
//!
//! [`RowExtractor`] consumes XML in arbitrary chunks and emits a [`Row`] as
//! soon as an element with the target name closes. Only the path of open
//! elements is kept; a matched element's data is released once its row is
//! emitted, and nothing outside an open match is retained at all.
//!
//! A row holds the element's attributes, its own text and its leaf
//! children (children without child elements of their own), keyed the same
//! way as in [`parse_document`](super::parse_document). A match nested in
//! another match becomes a row of its own and is left out of the outer row.

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::node::{ElementBuilder, Row, RowBatch};
use super::options::ParserOptions;
use super::tokenizer::{Token, Tokenizer, is_blank};
use crate::error::{Error, Result};
use crate::zip::ZipEntryReader;

/// One element on the open path.
struct OpenElement {
    name: String,
    is_target: bool,
    /// Present for matches and for direct children of a match
    builder: Option<ElementBuilder>,
    has_element_children: bool,
}

/// Push-fed row extractor for a single document.
pub struct RowExtractor {
    tokenizer: Tokenizer,
    target: String,
    options: ParserOptions,
    stack: Vec<OpenElement>,
    ready: Vec<Row>,
    root_closed: bool,
}

impl RowExtractor {
    pub fn new(target: impl Into<String>, options: ParserOptions) -> Self {
        Self {
            tokenizer: Tokenizer::new(),
            target: target.into(),
            options,
            stack: Vec::new(),
            ready: Vec::new(),
            root_closed: false,
        }
    }

    /// Consume a chunk of the document.
    ///
    /// Rows completed before an error remain available from
    /// [`take_rows`](Self::take_rows).
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.tokenizer.feed(chunk);
        self.drain_tokens()
    }

    /// Signal the end of the document; unclosed elements are an error.
    pub fn finish(&mut self) -> Result<()> {
        self.tokenizer.finish();
        self.drain_tokens()?;

        if !self.stack.is_empty() {
            let open: Vec<_> = self.stack.iter().map(|e| e.name.as_str()).collect();
            return Err(Error::xml(
                self.tokenizer.token_offset(),
                format!("document ends inside <{}>", open.join("> <")),
            ));
        }
        Ok(())
    }

    /// Rows completed so far, in document order.
    pub fn take_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.ready)
    }

    /// Depth of the open element path.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn matches(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.target)
            || (!name.is_ascii() && name.to_lowercase() == self.target.to_lowercase())
    }

    fn drain_tokens(&mut self) -> Result<()> {
        while let Some(token) = self.tokenizer.next_token()? {
            let offset = self.tokenizer.token_offset();
            match token {
                Token::StartTag {
                    name,
                    attributes,
                    self_closing,
                } => {
                    if self.stack.is_empty() && self.root_closed {
                        return Err(Error::xml(offset, format!("second root element <{name}>")));
                    }
                    let element = self.open(name, attributes);
                    if self_closing {
                        self.close(element);
                    } else {
                        self.stack.push(element);
                    }
                }
                Token::EndTag { name } => match self.stack.pop() {
                    Some(element) if element.name == name => self.close(element),
                    Some(element) => {
                        return Err(Error::xml(
                            offset,
                            format!("closing tag </{}> does not match <{}>", name, element.name),
                        ));
                    }
                    None => {
                        return Err(Error::xml(offset, format!("unexpected closing tag </{name}>")));
                    }
                },
                Token::Text(text) => match self.stack.last_mut() {
                    Some(top) => {
                        if let Some(builder) = top.builder.as_mut() {
                            builder.push_text(&text);
                        }
                    }
                    None if is_blank(&text) => {}
                    None => return Err(Error::xml(offset, "text outside the root element")),
                },
                Token::CData(text) => match self.stack.last_mut() {
                    Some(top) => {
                        if let Some(builder) = top.builder.as_mut() {
                            builder.push_cdata(&text);
                        }
                    }
                    None if is_blank(&text) => {}
                    None => return Err(Error::xml(offset, "CDATA outside the root element")),
                },
            }
        }
        Ok(())
    }

    fn open(&mut self, name: String, attributes: Vec<(String, String)>) -> OpenElement {
        let is_target = self.matches(&name);
        let parent_is_target = match self.stack.last_mut() {
            Some(parent) => {
                parent.has_element_children = true;
                parent.is_target
            }
            None => false,
        };

        let builder = (is_target || parent_is_target).then(|| ElementBuilder::new(attributes));
        OpenElement {
            name,
            is_target,
            builder,
            has_element_children: false,
        }
    }

    fn close(&mut self, element: OpenElement) {
        if self.stack.is_empty() {
            self.root_closed = true;
        }
        let Some(builder) = element.builder else {
            return;
        };

        if element.is_target {
            self.ready.push(builder.into_node(&self.options));
        } else if !element.has_element_children
            && let Some(parent) = self.stack.last_mut()
            && let Some(parent_builder) = parent.builder.as_mut()
        {
            parent_builder.push_child(
                self.options.tag_key(&element.name),
                builder.into_value(&self.options),
            );
        }
    }
}

/// Extract every row of an in-memory document.
pub fn extract_rows(data: &[u8], target: &str, options: &ParserOptions) -> Result<Vec<Row>> {
    let mut extractor = RowExtractor::new(target, options.clone());
    extractor.push(data)?;
    extractor.finish()?;
    Ok(extractor.take_rows())
}

/// A source of byte chunks, ending with `None`.
#[async_trait]
pub trait ChunkRead: Send {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
impl<'a, R: AsyncRead + Unpin + Send> ChunkRead for ZipEntryReader<'a, R> {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        ZipEntryReader::read_chunk(self).await
    }
}

/// Chunks from any [`AsyncRead`], for documents outside an archive.
pub struct ReaderChunks<R> {
    reader: R,
    chunk_size: usize,
}

impl<R: AsyncRead + Unpin + Send> ReaderChunks<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkRead for ReaderChunks<R> {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.chunk_size];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

/// Rows of one document delivered in batches as its bytes arrive.
///
/// Each chunk read from the source is tokenized immediately and the rows it
/// completes are returned, at most `batch_size` at a time. Concatenating
/// all batches gives every row in document order.
pub struct RowStream<S> {
    source: S,
    extractor: RowExtractor,
    ready: VecDeque<Row>,
    batch_size: usize,
    pending_error: Option<Error>,
    done: bool,
}

impl<S: ChunkRead> RowStream<S> {
    pub fn new(source: S, target: &str, options: ParserOptions) -> Self {
        let batch_size = options.batch_size.max(1);
        Self {
            source,
            extractor: RowExtractor::new(target, options),
            ready: VecDeque::new(),
            batch_size,
            pending_error: None,
            done: false,
        }
    }

    /// Next non-empty batch, or `None` after the last one.
    ///
    /// A syntax or read error is returned after the rows completed before
    /// it, and ends the stream.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        loop {
            if !self.ready.is_empty() {
                let n = self.ready.len().min(self.batch_size);
                let batch: RowBatch = self.ready.drain(..n).collect();
                trace!(rows = batch.len(), depth = self.extractor.depth(), "row batch");
                return Ok(Some(batch));
            }
            if let Some(e) = self.pending_error.take() {
                return Err(e);
            }
            if self.done {
                return Ok(None);
            }

            let step = match self.source.read_chunk().await {
                Ok(Some(chunk)) => self.extractor.push(&chunk),
                Ok(None) => {
                    self.done = true;
                    self.extractor.finish()
                }
                Err(e) => Err(e),
            };
            self.ready.extend(self.extractor.take_rows());
            if let Err(e) = step {
                self.pending_error = Some(e);
                self.done = true;
            }
        }
    }

    /// Read to the end and concatenate all batches.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            rows.extend(batch);
        }
        Ok(rows)
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn rows_json(xml: &str, tag: &str) -> Vec<Value> {
        extract_rows(xml.as_bytes(), tag, &ParserOptions::default())
            .unwrap()
            .iter()
            .map(Row::to_json)
            .collect()
    }

    #[test]
    fn attribute_rows_in_order() {
        assert_eq!(
            rows_json(r#"<data><item id="1" name="a"/><item id="2" name="b"/></data>"#, "item"),
            vec![json!({"$id": "1", "$name": "a"}), json!({"$id": "2", "$name": "b"})]
        );
    }

    #[test]
    fn tag_match_is_case_insensitive() {
        assert_eq!(rows_json(r#"<r><ITEM a="1"/><Item a="2"/></r>"#, "item").len(), 2);
    }

    #[test]
    fn leaf_children_and_text_are_merged() {
        let xml = r#"<inv><item sku="A1"><name>Bolt</name><size w="2" h="3"/><tag>x</tag><tag>y</tag><deep><x/></deep>note</item></inv>"#;
        assert_eq!(
            rows_json(xml, "item"),
            vec![json!({
                "$sku": "A1",
                "NAME": "Bolt",
                "SIZE": {"$w": "2", "$h": "3"},
                "TAG": ["x", "y"],
                "_": "note"
            })]
        );
    }

    #[test]
    fn always_array_wraps_single_leaf_children() {
        let xml = r#"<inv><item sku="A1"><name>Bolt</name><size w="2"/><tag>x</tag><tag>y</tag></item></inv>"#;
        let options = ParserOptions::default().with_always_array(true);
        let rows: Vec<Value> = extract_rows(xml.as_bytes(), "item", &options)
            .unwrap()
            .iter()
            .map(Row::to_json)
            .collect();
        assert_eq!(
            rows,
            vec![json!({
                "$sku": "A1",
                "NAME": ["Bolt"],
                "SIZE": [{"$w": "2"}],
                "TAG": ["x", "y"]
            })]
        );
    }

    #[test]
    fn always_array_leaves_attributes_and_text_single() {
        let options = ParserOptions::default().with_always_array(true);
        let rows = extract_rows(br#"<r><item id="1">note</item></r>"#, "item", &options).unwrap();
        assert_eq!(rows[0].to_json(), json!({"$id": "1", "_": "note"}));
    }

    #[test]
    fn text_next_to_text_key_child_is_kept() {
        assert_eq!(
            rows_json("<r><item>note<_>child</_></item></r>", "item"),
            vec![json!({"_": ["child", "note"]})]
        );
    }

    #[test]
    fn cdata_whitespace_is_kept_inside_text() {
        assert_eq!(
            rows_json("<r><item><v>foo<![CDATA[ ]]>bar</v></item></r>", "item"),
            vec![json!({"V": "foo bar"})]
        );
    }

    #[test]
    fn nested_matches_emit_separately() {
        let xml = r#"<r><item id="outer"><item id="inner"/></item></r>"#;
        assert_eq!(
            rows_json(xml, "item"),
            vec![json!({"$id": "inner"}), json!({"$id": "outer"})]
        );
    }

    #[test]
    fn empty_element_is_empty_row() {
        assert_eq!(rows_json("<r><item/></r>", "item"), vec![json!({})]);
    }

    #[test]
    fn rows_are_emitted_as_soon_as_they_close() {
        let mut extractor = RowExtractor::new("row", ParserOptions::default());
        extractor.push(br#"<t><row n="1"/><ro"#).unwrap();
        assert_eq!(extractor.take_rows().len(), 1);
        assert_eq!(extractor.depth(), 1);
        extractor.push(br#"w n="2">"#).unwrap();
        assert!(extractor.take_rows().is_empty());
        extractor.push(b"</row></t>").unwrap();
        assert_eq!(extractor.take_rows()[0].text("$n"), Some("2"));
        extractor.finish().unwrap();
    }

    #[test]
    fn unclosed_document_fails_on_finish() {
        let mut extractor = RowExtractor::new("row", ParserOptions::default());
        extractor.push(br#"<t><row n="1"/>"#).unwrap();
        assert_eq!(extractor.take_rows().len(), 1);
        assert!(matches!(extractor.finish(), Err(Error::XmlSyntax { .. })));
    }

    #[test]
    fn mismatched_close_is_error() {
        let mut extractor = RowExtractor::new("row", ParserOptions::default());
        assert!(extractor.push(b"<t><row></t>").is_err());
    }

    #[test]
    fn empty_input_has_no_rows() {
        assert!(rows_json("", "row").is_empty());
    }

    #[tokio::test]
    async fn stream_respects_batch_size() {
        let xml = br#"<t><r i="1"/><r i="2"/><r i="3"/><r i="4"/><r i="5"/></t>"#;
        let options = ParserOptions::default().with_batch_size(2);
        let mut stream = RowStream::new(ReaderChunks::new(&xml[..], 1024), "r", options);

        let mut sizes = Vec::new();
        let mut ids = Vec::new();
        while let Some(batch) = stream.next_batch().await.unwrap() {
            sizes.push(batch.len());
            ids.extend(batch.iter().map(|r| r.text("$i").unwrap().to_string()));
        }
        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(ids, ["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn stream_delivers_rows_before_error() {
        let xml = br#"<t><r i="1"/><r i="2"/></x>"#;
        let mut stream = RowStream::new(
            ReaderChunks::new(&xml[..], 1024),
            "r",
            ParserOptions::default(),
        );
        assert_eq!(stream.next_batch().await.unwrap().unwrap().len(), 2);
        assert!(stream.next_batch().await.is_err());
        assert!(stream.next_batch().await.unwrap().is_none());
    }
}
