use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// General purpose flag: entry is encrypted
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// General purpose flag: sizes and CRC follow the data in a descriptor
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// Marker value for 32-bit fields whose real value lives in the ZIP64 extra field
const ZIP64_MARKER_U32: u32 = 0xFFFF_FFFF;
const ZIP64_EXTRA_ID: u16 = 0x0001;

fn container(message: &str) -> Error {
    Error::ContainerFormat(message.to_string())
}

/// End of Central Directory (EOCD) - 22 bytes minimum
pub struct EndOfCentralDirectory {
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(container("invalid End of Central Directory"));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let _disk_number = cursor.read_u16::<LittleEndian>()?;
        let _disk_with_cd = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == ZIP64_MARKER_U32
            || self.cd_offset == ZIP64_MARKER_U32
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub eocd64_offset: u64,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(container("invalid ZIP64 locator"));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let _disk_with_eocd64 = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
pub struct Zip64EOCD {
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(container("invalid ZIP64 End of Central Directory"));
        }

        // record size, versions, disk numbers and per-disk count precede the totals
        let mut cursor = Cursor::new(&data[32..]);

        Ok(Self {
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Optional signature in front of a data descriptor
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8] = b"PK\x07\x08";

/// Sizes and offset that may be widened by a ZIP64 extra field.
///
/// The extra field only carries the values whose 32-bit header field holds
/// the `0xFFFFFFFF` marker, in this fixed order.
#[derive(Debug, Clone, Copy)]
pub struct Zip64Fields {
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub lfh_offset: u64,
}

impl Zip64Fields {
    pub fn apply_extra(&mut self, extra: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(extra);
        while cursor.position() + 4 <= extra.len() as u64 {
            let header_id = cursor.read_u16::<LittleEndian>()?;
            let field_size = cursor.read_u16::<LittleEndian>()? as u64;
            let field_end = (cursor.position() + field_size).min(extra.len() as u64);

            if header_id == ZIP64_EXTRA_ID {
                for value in [
                    &mut self.uncompressed_size,
                    &mut self.compressed_size,
                    &mut self.lfh_offset,
                ] {
                    if *value == ZIP64_MARKER_U32 as u64 && cursor.position() + 8 <= field_end {
                        *value = cursor.read_u64::<LittleEndian>()?;
                    }
                }
            }

            cursor.set_position(field_end);
        }
        Ok(())
    }
}

/// Parsed central directory entry
#[derive(Debug, Clone)]
pub struct ZipFileEntry {
    pub file_name: String,
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub lfh_offset: u64,
    pub is_directory: bool,
}

impl ZipFileEntry {
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

/// Fixed part of a Local File Header, without its signature.
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    /// Bytes following the signature
    pub const BODY_SIZE: usize = LFH_SIZE - 4;

    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() < Self::BODY_SIZE {
            return Err(container("truncated Local File Header"));
        }

        let mut cursor = Cursor::new(body);
        let _version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let compression_method = cursor.read_u16::<LittleEndian>()?;
        let _last_mod_time = cursor.read_u16::<LittleEndian>()?;
        let _last_mod_date = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            flags,
            compression_method: CompressionMethod::from_u16(compression_method),
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()? as u64,
            uncompressed_size: cursor.read_u32::<LittleEndian>()? as u64,
            file_name_length: cursor.read_u16::<LittleEndian>()?,
            extra_field_length: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Widen the sizes from a ZIP64 extra field, if any.
    pub fn apply_extra(&mut self, extra: &[u8]) -> Result<()> {
        let mut fields = Zip64Fields {
            uncompressed_size: self.uncompressed_size,
            compressed_size: self.compressed_size,
            lfh_offset: 0,
        };
        fields.apply_extra(extra)?;
        self.uncompressed_size = fields.uncompressed_size;
        self.compressed_size = fields.compressed_size;
        Ok(())
    }

    pub fn is_zip64(&self) -> bool {
        self.compressed_size == ZIP64_MARKER_U32 as u64
            || self.uncompressed_size == ZIP64_MARKER_U32 as u64
    }
}

/// Trailing CRC and sizes of an entry written with [`FLAG_DATA_DESCRIPTOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    /// Parse a descriptor whose optional signature has already been removed.
    pub fn from_bytes(data: &[u8], zip64: bool) -> Result<Self> {
        let needed = if zip64 { 20 } else { 12 };
        if data.len() < needed {
            return Err(container("truncated data descriptor"));
        }

        let mut cursor = Cursor::new(data);
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let (compressed_size, uncompressed_size) = if zip64 {
            (
                cursor.read_u64::<LittleEndian>()?,
                cursor.read_u64::<LittleEndian>()?,
            )
        } else {
            (
                cursor.read_u32::<LittleEndian>()? as u64,
                cursor.read_u32::<LittleEndian>()? as u64,
            )
        };

        Ok(Self {
            crc32,
            compressed_size,
            uncompressed_size,
        })
    }
}
