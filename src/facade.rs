//! Entry points combining archive reading with XML parsing.
//!
//! [`XmlZipParser`] offers three ways to read the XML members of an archive:
//!
//! - [`parse_from_zip`](XmlZipParser::parse_from_zip): an in-memory archive,
//!   every matching member parsed into a tree.
//! - [`read_streams_from_zip`](XmlZipParser::read_streams_from_zip): a
//!   streamed archive, each matching member handed out as a byte stream.
//! - [`row_streams_from_zip`](XmlZipParser::row_streams_from_zip): a
//!   streamed archive, each matching member handed out as batches of rows
//!   for one element name.
//!
//! Members are named by their base name in every mode.

use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::Result;
use crate::io::{MemoryReader, ReadAt};
use crate::xml::{Node, ParserOptions, RowStream, parse_document};
use crate::zip::{EntryFilter, ZipEntryReader, ZipExtractor, ZipStreamReader, base_name};

/// One member parsed in buffer mode.
#[derive(Debug)]
pub struct ParsedFile {
    /// Base name of the member
    pub name: String,
    /// The parsed document, or why this member could not be read or parsed
    pub parsed_data: Result<Node>,
}

/// Reads XML members of ZIP archives.
#[derive(Debug, Clone, Default)]
pub struct XmlZipParser {
    options: ParserOptions,
    filter: EntryFilter,
}

impl XmlZipParser {
    /// A parser with default options accepting `.xml` members.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: ParserOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_filter(mut self, filter: EntryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    pub fn filter(&self) -> &EntryFilter {
        &self.filter
    }

    /// Parse every matching member of an in-memory archive.
    ///
    /// A malformed archive fails the whole call. A member that cannot be
    /// decompressed or is not well-formed XML gets its own error in
    /// [`ParsedFile::parsed_data`] and does not affect the others.
    pub async fn parse_from_zip(&self, buffer: impl Into<Vec<u8>>) -> Result<Vec<ParsedFile>> {
        self.parse_from_reader(Arc::new(MemoryReader::new(buffer)))
            .await
    }

    /// Parse every matching member of an archive on any random-access source.
    ///
    /// Only the members the filter accepts are read from the source.
    pub async fn parse_from_reader<R: ReadAt>(&self, reader: Arc<R>) -> Result<Vec<ParsedFile>> {
        let extractor = ZipExtractor::new(reader);
        let entries = extractor.entries_matching(&self.filter).await?;

        let files: Vec<_> = entries
            .into_iter()
            .map(|entry| {
                let parsed_data = entry
                    .bytes()
                    .and_then(|data| parse_document(data, &self.options));
                debug!(name = %entry.name, ok = parsed_data.is_ok(), "parsed entry");
                ParsedFile {
                    name: entry.name,
                    parsed_data,
                }
            })
            .collect();
        Ok(files)
    }

    /// Hand out the matching members of a streamed archive as byte streams.
    pub fn read_streams_from_zip<R: AsyncRead + Unpin>(&self, stream: R) -> EntryStreams<R> {
        EntryStreams {
            archive: ZipStreamReader::new(stream),
            filter: self.filter.clone(),
        }
    }

    /// Hand out the matching members of a streamed archive as row batches
    /// for elements named `tag` (compared case-insensitively).
    pub fn row_streams_from_zip<R: AsyncRead + Unpin>(
        &self,
        stream: R,
        tag: impl Into<String>,
    ) -> RowStreams<R> {
        RowStreams {
            entries: self.read_streams_from_zip(stream),
            tag: tag.into(),
            options: self.options.clone(),
        }
    }
}

/// Matching members of a streamed archive, in archive order.
///
/// Only one member is readable at a time. Requesting the next one skips
/// whatever is left of the current member, so members can be ignored or
/// abandoned part way.
pub struct EntryStreams<R> {
    archive: ZipStreamReader<R>,
    filter: EntryFilter,
}

/// A member's base name and its decompressed bytes.
pub struct NamedEntry<'a, R: AsyncRead + Unpin> {
    pub name: String,
    pub reader: ZipEntryReader<'a, R>,
}

impl<R: AsyncRead + Unpin> EntryStreams<R> {
    /// Use an already configured stream reader, for example one built with
    /// [`ZipStreamReader::with_capacity`].
    pub fn new(archive: ZipStreamReader<R>, filter: EntryFilter) -> Self {
        Self { archive, filter }
    }

    /// The next matching member, or `None` at the end of the archive.
    ///
    /// A malformed archive is reported once; later calls return `None`.
    pub async fn next_entry(&mut self) -> Result<Option<NamedEntry<'_, R>>> {
        let filter = &self.filter;
        let next = self
            .archive
            .next_entry_where(|path| filter.accept(path, path.ends_with('/')).is_some())
            .await?;

        Ok(next.map(|reader| NamedEntry {
            name: base_name(reader.name()).to_string(),
            reader,
        }))
    }

    pub fn into_inner(self) -> ZipStreamReader<R> {
        self.archive
    }
}

/// Matching members of a streamed archive as row streams.
pub struct RowStreams<R> {
    entries: EntryStreams<R>,
    tag: String,
    options: ParserOptions,
}

/// A member's base name and the rows extracted from it.
pub struct ParsedEntry<'a, R: AsyncRead + Unpin> {
    pub name: String,
    pub rows: RowStream<ZipEntryReader<'a, R>>,
}

impl<R: AsyncRead + Unpin + Send> RowStreams<R> {
    pub fn new(entries: EntryStreams<R>, tag: impl Into<String>, options: ParserOptions) -> Self {
        Self {
            entries,
            tag: tag.into(),
            options,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The next matching member, or `None` at the end of the archive.
    pub async fn next_entry(&mut self) -> Result<Option<ParsedEntry<'_, R>>> {
        let Some(entry) = self.entries.next_entry().await? else {
            return Ok(None);
        };
        Ok(Some(ParsedEntry {
            name: entry.name,
            rows: RowStream::new(entry.reader, &self.tag, self.options.clone()),
        }))
    }

    pub fn into_inner(self) -> ZipStreamReader<R> {
        self.entries.into_inner()
    }
}
