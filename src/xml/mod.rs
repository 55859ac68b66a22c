//! XML to record conversion.
//!
//! Two consumers share one resumable [`Tokenizer`] and one set of
//! [`ParserOptions`]:
//!
//! - [`parse_document`] builds the whole document as a [`Node`] tree.
//! - [`RowExtractor`] and [`RowStream`] emit one [`Row`] per element with
//!   a target name while the document is still arriving.
//!
//! Element names become keys in the configured case, attributes are keyed
//! with a prefix, and a key maps to a sequence when it occurs more than
//! once under the same parent or when `always_array` is set.

mod entities;
mod node;
mod options;
mod rows;
mod tokenizer;
mod tree;

pub use entities::decode as decode_entities;
pub use node::{Field, Node, Row, RowBatch, Value};
pub use options::{ParserOptions, TagCase};
pub use rows::{ChunkRead, ReaderChunks, RowExtractor, RowStream, extract_rows};
pub use tokenizer::{Token, Tokenizer};
pub use tree::parse_document;
