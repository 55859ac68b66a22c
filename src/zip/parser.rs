//! Central-directory ZIP parser.
//!
//! This module reads archive metadata from any source implementing
//! [`ReadAt`], which is how whole-buffer parsing and remote archives are
//! served.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Read the Central Directory to get metadata for all files
//! 4. For extraction, read each file's Local File Header and data

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Low-level central directory parser.
///
/// Typically used through [`ZipExtractor`](super::ZipExtractor)
/// rather than directly.
pub struct ZipParser<R: ReadAt> {
    reader: Arc<R>,
    size: u64,
}

impl<R: ReadAt> ZipParser<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Returns the record together with its offset in the archive.
    pub async fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        let eocd_size = EndOfCentralDirectory::SIZE as u64;
        if self.size < eocd_size {
            return Err(Error::ContainerFormat(format!(
                "{} bytes is too small for a ZIP archive",
                self.size
            )));
        }

        // Common case first: no archive comment.
        let offset = self.size - eocd_size;
        let mut buf = vec![0u8; EndOfCentralDirectory::SIZE];
        self.reader.read_exact_at(offset, &mut buf).await?;
        if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && buf[20..22] == [0, 0] {
            return Ok((EndOfCentralDirectory::from_bytes(&buf)?, offset));
        }

        let search_size = (MAX_COMMENT_SIZE + eocd_size).min(self.size);
        let search_start = self.size - search_size;

        let mut buf = vec![0u8; search_size as usize];
        self.reader.read_exact_at(search_start, &mut buf).await?;

        // The comment length must account for every byte after the record.
        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
                let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
                if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                    let eocd = EndOfCentralDirectory::from_bytes(
                        &buf[i..i + EndOfCentralDirectory::SIZE],
                    )?;
                    return Ok((eocd, search_start + i as u64));
                }
            }
        }

        Err(Error::ContainerFormat(
            "End of Central Directory record not found".to_string(),
        ))
    }

    /// Read the ZIP64 End of Central Directory record that precedes the
    /// regular EOCD at `eocd_offset`.
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> Result<Zip64EOCD> {
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| Error::ContainerFormat("missing ZIP64 locator".to_string()))?;
        let mut locator_buf = vec![0u8; Zip64EOCDLocator::SIZE];
        self.reader
            .read_exact_at(locator_offset, &mut locator_buf)
            .await?;
        let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;

        let mut eocd64_buf = vec![0u8; Zip64EOCD::MIN_SIZE];
        self.reader
            .read_exact_at(locator.eocd64_offset, &mut eocd64_buf)
            .await?;

        Zip64EOCD::from_bytes(&eocd64_buf)
    }

    /// List all entries in archive order.
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        let (eocd, eocd_offset) = self.find_eocd().await?;

        let (cd_offset, cd_size, total_entries) = if eocd.is_zip64() {
            let eocd64 = self.read_zip64_eocd(eocd_offset).await?;
            (eocd64.cd_offset, eocd64.cd_size, eocd64.total_entries)
        } else {
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
            )
        };

        if cd_offset.saturating_add(cd_size) > self.size {
            return Err(Error::ContainerFormat(format!(
                "central directory ({} bytes at {}) exceeds archive size {}",
                cd_size, cd_offset, self.size
            )));
        }

        // One read for the whole directory keeps remote sources to a single request.
        let mut cd_data = vec![0u8; cd_size as usize];
        self.reader.read_exact_at(cd_offset, &mut cd_data).await?;

        let mut entries = Vec::with_capacity(total_entries.min(u16::MAX as u64) as usize);
        let mut cursor = Cursor::new(cd_data.as_slice());
        for _ in 0..total_entries {
            entries.push(parse_cdfh(&mut cursor)?);
        }

        debug!(entries = entries.len(), cd_offset, "read central directory");
        Ok(entries)
    }

    /// Offset of the first payload byte for `entry`.
    ///
    /// The local header's name and extra field lengths may differ from
    /// the central directory copy, so they are read from the local header.
    pub async fn get_data_offset(&self, entry: &ZipFileEntry) -> Result<u64> {
        let mut lfh_buf = vec![0u8; LFH_SIZE];
        self.reader
            .read_exact_at(entry.lfh_offset, &mut lfh_buf)
            .await?;

        if &lfh_buf[0..4] != LFH_SIGNATURE {
            return Err(Error::ContainerFormat(format!(
                "invalid Local File Header for '{}'",
                entry.file_name
            )));
        }

        let header = LocalFileHeader::from_body(&lfh_buf[4..])?;
        Ok(entry.lfh_offset
            + LFH_SIZE as u64
            + header.file_name_length as u64
            + header.extra_field_length as u64)
    }

    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }
}

/// Parse one Central Directory File Header at the cursor position.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> Result<ZipFileEntry> {
    let truncated = |_| Error::ContainerFormat("truncated Central Directory".to_string());

    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig).map_err(truncated)?;
    if sig != CDFH_SIGNATURE {
        return Err(Error::ContainerFormat(
            "invalid Central Directory File Header".to_string(),
        ));
    }

    let mut fixed = [0u8; CDFH_MIN_SIZE - 4];
    cursor.read_exact(&mut fixed).map_err(truncated)?;
    let mut header = Cursor::new(&fixed[..]);

    let _version_made_by = header.read_u16::<LittleEndian>()?;
    let _version_needed = header.read_u16::<LittleEndian>()?;
    let flags = header.read_u16::<LittleEndian>()?;
    let compression_method = header.read_u16::<LittleEndian>()?;
    let _last_mod_time = header.read_u16::<LittleEndian>()?;
    let _last_mod_date = header.read_u16::<LittleEndian>()?;
    let crc32 = header.read_u32::<LittleEndian>()?;
    let compressed_size = header.read_u32::<LittleEndian>()? as u64;
    let uncompressed_size = header.read_u32::<LittleEndian>()? as u64;
    let file_name_length = header.read_u16::<LittleEndian>()? as usize;
    let extra_field_length = header.read_u16::<LittleEndian>()? as usize;
    let file_comment_length = header.read_u16::<LittleEndian>()? as usize;
    let _disk_number_start = header.read_u16::<LittleEndian>()?;
    let _internal_attrs = header.read_u16::<LittleEndian>()?;
    let _external_attrs = header.read_u32::<LittleEndian>()?;
    let lfh_offset = header.read_u32::<LittleEndian>()? as u64;

    let mut variable = vec![0u8; file_name_length + extra_field_length + file_comment_length];
    cursor.read_exact(&mut variable).map_err(truncated)?;

    // Lossy conversion keeps non-UTF8 names readable.
    let file_name = String::from_utf8_lossy(&variable[..file_name_length]).into_owned();
    let is_directory = file_name.ends_with('/');

    let mut fields = Zip64Fields {
        uncompressed_size,
        compressed_size,
        lfh_offset,
    };
    fields.apply_extra(&variable[file_name_length..file_name_length + extra_field_length])?;

    Ok(ZipFileEntry {
        file_name,
        flags,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size: fields.compressed_size,
        uncompressed_size: fields.uncompressed_size,
        crc32,
        lfh_offset: fields.lfh_offset,
        is_directory,
    })
}
