//! # xmlzip
//!
//! Read XML documents out of ZIP archives, either whole or as a stream of
//! rows.
//!
//! Archives can come from memory, a local file or an HTTP server (read with
//! Range requests, so only the needed parts are downloaded), or from any
//! non-seekable async byte stream. Matching members are selected by
//! extension and named by their base name.
//!
//! ## Features
//!
//! - Whole-document parsing into a [`Node`] tree
//! - Streaming extraction of rows for one element name, delivered in
//!   batches while the archive is still arriving
//! - ZIP64, STORED and DEFLATE, data descriptors in streamed archives
//! - CRC-32 and size verification for every member
//!
//! ## Example
//!
//! ```no_run
//! use xmlzip::XmlZipParser;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let parser = XmlZipParser::new();
//!
//!     // Whole documents from an in-memory archive
//!     let archive = std::fs::read("data.zip")?;
//!     for file in parser.parse_from_zip(archive).await? {
//!         println!("{}: {:?}", file.name, file.parsed_data.map(|n| n.to_json()));
//!     }
//!
//!     // Rows of <item> elements from a streamed archive
//!     let stream = tokio::fs::File::open("data.zip").await?;
//!     let mut entries = parser.row_streams_from_zip(stream, "item");
//!     while let Some(mut entry) = entries.next_entry().await? {
//!         while let Some(batch) = entry.rows.next_batch().await? {
//!             println!("{}: {} rows", entry.name, batch.len());
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod facade;
pub mod io;
pub mod xml;
pub mod zip;

pub use cli::Cli;
pub use error::{Error, Result};
pub use facade::{EntryStreams, NamedEntry, ParsedEntry, ParsedFile, RowStreams, XmlZipParser};
pub use io::{HttpRangeReader, LocalFileReader, MemoryReader, ReadAt, RetryPolicy};
pub use xml::{Node, ParserOptions, Row, RowBatch, TagCase};
pub use zip::{EntryFilter, ZipEntryReader, ZipExtractor, ZipStreamReader};
