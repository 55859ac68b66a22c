//! ZIP archive reading.
//!
//! Archives can be read two ways:
//!
//! - Buffer mode, through the central directory: [`ZipParser`] locates the
//!   End of Central Directory record (ZIP64 included) on any
//!   [`ReadAt`](crate::io::ReadAt) source and [`ZipExtractor`] decompresses
//!   the members. Only the bytes that are needed are read, which keeps
//!   remote archives cheap over HTTP Range requests.
//! - Stream mode, front to back: [`ZipStreamReader`] walks local file
//!   headers of a non-seekable [`AsyncRead`](tokio::io::AsyncRead) and
//!   hands out one [`ZipEntryReader`] at a time.
//!
//! STORED and DEFLATE are decoded; the recorded CRC-32 and size are
//! checked in both modes. Encrypted entries and other compression methods
//! are reported as unreadable entries. Multi-disk archives are not
//! supported.

mod extractor;
mod filter;
mod parser;
mod stream;
mod structures;

pub use extractor::{ArchiveEntry, ZipExtractor};
pub use filter::{EntryFilter, base_name};
pub use parser::ZipParser;
pub use stream::{DEFAULT_CHUNK_SIZE, ZipEntryReader, ZipStreamReader};
pub use structures::*;
