use flate2::Crc;
use flate2::read::DeflateDecoder;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::filter::{EntryFilter, base_name};
use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

/// Upper bound on deflate expansion used to size the output buffer
const MAX_INFLATE_RATIO: u64 = 1032;

/// One archive member with its payload fully decompressed.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Name exposed to callers; the full path until a filter rewrites it
    pub name: String,
    pub is_directory: bool,
    /// Decompressed payload, or the error that prevented reading it
    pub data: Result<Vec<u8>, String>,
}

impl ArchiveEntry {
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }

    /// Payload bytes, or an [`Error::EntryRead`] naming this entry.
    pub fn bytes(&self) -> Result<&[u8]> {
        self.data
            .as_deref()
            .map_err(|message| Error::entry(&self.name, message.clone()))
    }
}

/// Reads members of an archive through its central directory
pub struct ZipExtractor<R: ReadAt> {
    parser: ZipParser<R>,
}

impl<R: ReadAt> ZipExtractor<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            parser: ZipParser::new(reader),
        }
    }

    /// List all entries in the archive
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        self.parser.list_files().await
    }

    /// Every entry in archive order with its decompressed payload.
    ///
    /// A broken central directory fails the whole call; a broken payload
    /// is recorded on its own entry.
    pub async fn entries(&self) -> Result<Vec<ArchiveEntry>> {
        let files = self.list_files().await?;
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let name = file.file_name.clone();
            entries.push(self.load(&file, name).await?);
        }
        Ok(entries)
    }

    /// The entries `filter` accepts, named by their base names.
    ///
    /// Rejected entries are never read, so a damaged or oversized member
    /// that is filtered out cannot affect the result.
    pub async fn entries_matching(&self, filter: &EntryFilter) -> Result<Vec<ArchiveEntry>> {
        let files = self.list_files().await?;
        let mut entries = Vec::new();
        for file in &files {
            let Some(name) = filter.accept(&file.file_name, file.is_directory) else {
                trace!(name = %file.file_name, "entry filtered out");
                continue;
            };
            entries.push(self.load(file, name.to_string()).await?);
        }
        Ok(entries)
    }

    async fn load(&self, file: &ZipFileEntry, name: String) -> Result<ArchiveEntry> {
        let data = if file.is_directory {
            Ok(Vec::new())
        } else {
            match self.extract_to_memory(file).await {
                Ok(data) => Ok(data),
                Err(Error::EntryRead { message, .. }) => Err(message),
                Err(e) => return Err(e),
            }
        };
        Ok(ArchiveEntry {
            name,
            is_directory: file.is_directory,
            data,
        })
    }

    /// Decompress one entry into memory, verifying its size and CRC-32.
    pub async fn extract_to_memory(&self, entry: &ZipFileEntry) -> Result<Vec<u8>> {
        if entry.is_encrypted() {
            return Err(Error::entry(&entry.file_name, "encrypted entries are not supported"));
        }

        let data_offset = match self.parser.get_data_offset(entry).await {
            Ok(offset) => offset,
            Err(Error::ContainerFormat(message)) => {
                return Err(Error::entry(&entry.file_name, message));
            }
            Err(e) => return Err(e),
        };

        // Sizes come from the central directory and are checked against the
        // source before anything is allocated.
        let source_size = self.parser.reader().size();
        let data_end = data_offset.checked_add(entry.compressed_size);
        if data_end.is_none_or(|end| end > source_size) {
            return Err(Error::entry(
                &entry.file_name,
                format!(
                    "{} compressed bytes at offset {} exceed the archive size {}",
                    entry.compressed_size, data_offset, source_size
                ),
            ));
        }

        let mut raw = vec![0u8; entry.compressed_size as usize];
        self.parser
            .reader()
            .read_exact_at(data_offset, &mut raw)
            .await
            .map_err(|e| Error::entry(&entry.file_name, e.to_string()))?;

        let data = match entry.compression_method {
            CompressionMethod::Stored => raw,
            CompressionMethod::Deflate => {
                let capacity = entry
                    .uncompressed_size
                    .min(entry.compressed_size.saturating_mul(MAX_INFLATE_RATIO));
                let mut out = Vec::with_capacity(capacity as usize);
                DeflateDecoder::new(raw.as_slice())
                    .take(entry.uncompressed_size.saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(|e| Error::entry(&entry.file_name, format!("corrupt deflate data: {e}")))?;
                out
            }
            CompressionMethod::Unknown(method) => {
                return Err(Error::entry(
                    &entry.file_name,
                    format!("unsupported compression method {method}"),
                ));
            }
        };

        verify_payload(&entry.file_name, &data, entry.crc32, entry.uncompressed_size)?;
        debug!(name = %entry.file_name, bytes = data.len(), "extracted entry");
        Ok(data)
    }
}

/// Check decompressed bytes against the sizes and CRC the archive recorded.
fn verify_payload(name: &str, data: &[u8], crc32: u32, size: u64) -> Result<()> {
    if data.len() as u64 != size {
        return Err(Error::entry(
            name,
            format!("expected {} bytes, got {}", size, data.len()),
        ));
    }
    let mut crc = Crc::new();
    crc.update(data);
    if crc.sum() != crc32 {
        return Err(Error::entry(
            name,
            format!("CRC mismatch: expected {:08x}, got {:08x}", crc32, crc.sum()),
        ));
    }
    Ok(())
}
