//! In-memory ZIP archives for tests.

#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Crc;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;

/// How one entry is written.
#[derive(Debug, Clone, Copy)]
pub struct EntryLayout {
    /// Compression method code: 0 stored, 8 deflate, anything else raw
    pub method: u16,
    /// Write sizes and CRC in a trailing data descriptor (deflate only)
    pub descriptor: bool,
    /// Prefix the data descriptor with its optional signature
    pub signed_descriptor: bool,
    /// Record this CRC instead of the real one
    pub crc_override: Option<u32>,
    pub extra_flags: u16,
    /// Mark sizes with 0xFFFFFFFF and carry them in a ZIP64 extra field
    pub zip64: bool,
    /// Compressed and uncompressed sizes the central directory claims
    pub recorded_sizes: Option<(u64, u64)>,
    /// Local header offset the central directory claims
    pub recorded_offset: Option<u32>,
}

impl EntryLayout {
    pub fn stored() -> Self {
        Self {
            method: 0,
            descriptor: false,
            signed_descriptor: false,
            crc_override: None,
            extra_flags: 0,
            zip64: false,
            recorded_sizes: None,
            recorded_offset: None,
        }
    }

    pub fn deflated() -> Self {
        Self {
            method: 8,
            ..Self::stored()
        }
    }

    pub fn with_descriptor(mut self, signed: bool) -> Self {
        self.descriptor = true;
        self.signed_descriptor = signed;
        self
    }

    pub fn with_crc(mut self, crc: u32) -> Self {
        self.crc_override = Some(crc);
        self
    }

    pub fn with_method(mut self, method: u16) -> Self {
        self.method = method;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.extra_flags |= 0x0001;
        self
    }

    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    /// Record sizes in the central directory that differ from the payload.
    pub fn with_recorded_sizes(mut self, compressed: u64, uncompressed: u64) -> Self {
        self.recorded_sizes = Some((compressed, uncompressed));
        self
    }

    pub fn with_recorded_offset(mut self, offset: u32) -> Self {
        self.recorded_offset = Some(offset);
        self
    }
}

const MARKER: u32 = 0xFFFF_FFFF;

/// A ZIP64 extended information field carrying both sizes.
fn zip64_extra(uncompressed: u64, compressed: u64) -> Vec<u8> {
    let mut extra = Vec::with_capacity(20);
    extra.write_u16::<LittleEndian>(0x0001).unwrap();
    extra.write_u16::<LittleEndian>(16).unwrap();
    extra.write_u64::<LittleEndian>(uncompressed).unwrap();
    extra.write_u64::<LittleEndian>(compressed).unwrap();
    extra
}

/// 32-bit header fields, or markers when the values live in the extra field.
fn header_sizes(compressed: u64, uncompressed: u64, zip64: bool) -> (u32, u32) {
    if zip64 {
        (MARKER, MARKER)
    } else {
        (compressed as u32, uncompressed as u32)
    }
}

/// Writes local headers as entries are added, then the central directory.
#[derive(Default)]
pub struct ZipBuilder {
    out: Vec<u8>,
    central: Vec<u8>,
    count: u16,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, EntryLayout::stored())
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, EntryLayout::deflated())
    }

    pub fn directory(self, name: &str) -> Self {
        self.entry(name, b"", EntryLayout::stored())
    }

    pub fn entry(mut self, name: &str, data: &[u8], layout: EntryLayout) -> Self {
        let payload = match layout.method {
            8 => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).unwrap();
                encoder.finish().unwrap()
            }
            _ => data.to_vec(),
        };
        let mut crc = Crc::new();
        crc.update(data);
        let crc32 = layout.crc_override.unwrap_or(crc.sum());

        let mut flags = layout.extra_flags;
        if layout.descriptor {
            flags |= 0x0008;
        }
        let offset = self.out.len() as u32;
        let compressed = payload.len() as u64;
        let uncompressed = data.len() as u64;

        let (header_crc, local_csize, local_usize) = if layout.descriptor {
            (0, 0, 0)
        } else {
            (crc32, compressed, uncompressed)
        };
        let (header_csize, header_usize) = header_sizes(local_csize, local_usize, layout.zip64);
        let local_extra = if layout.zip64 {
            zip64_extra(local_usize, local_csize)
        } else {
            Vec::new()
        };

        let out = &mut self.out;
        out.write_u32::<LittleEndian>(0x04034b50).unwrap();
        out.write_u16::<LittleEndian>(if layout.zip64 { 45 } else { 20 }).unwrap();
        out.write_u16::<LittleEndian>(flags).unwrap();
        out.write_u16::<LittleEndian>(layout.method).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap(); // time
        out.write_u16::<LittleEndian>(0x21).unwrap(); // date
        out.write_u32::<LittleEndian>(header_crc).unwrap();
        out.write_u32::<LittleEndian>(header_csize).unwrap();
        out.write_u32::<LittleEndian>(header_usize).unwrap();
        out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(local_extra.len() as u16).unwrap();
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&local_extra);
        out.extend_from_slice(&payload);

        if layout.descriptor {
            if layout.signed_descriptor {
                out.write_u32::<LittleEndian>(0x08074b50).unwrap();
            }
            out.write_u32::<LittleEndian>(crc32).unwrap();
            if layout.zip64 {
                out.write_u64::<LittleEndian>(compressed).unwrap();
                out.write_u64::<LittleEndian>(uncompressed).unwrap();
            } else {
                out.write_u32::<LittleEndian>(compressed as u32).unwrap();
                out.write_u32::<LittleEndian>(uncompressed as u32).unwrap();
            }
        }

        let (cd_csize, cd_usize) = layout.recorded_sizes.unwrap_or((compressed, uncompressed));
        let cd_zip64 =
            layout.zip64 || cd_csize >= MARKER as u64 || cd_usize >= MARKER as u64;
        let (field_csize, field_usize) = header_sizes(cd_csize, cd_usize, cd_zip64);
        let cd_extra = if cd_zip64 {
            zip64_extra(cd_usize, cd_csize)
        } else {
            Vec::new()
        };
        let cd_offset = layout.recorded_offset.unwrap_or(offset);

        let cd = &mut self.central;
        cd.write_u32::<LittleEndian>(0x02014b50).unwrap();
        cd.write_u16::<LittleEndian>(20).unwrap();
        cd.write_u16::<LittleEndian>(if cd_zip64 { 45 } else { 20 }).unwrap();
        cd.write_u16::<LittleEndian>(flags).unwrap();
        cd.write_u16::<LittleEndian>(layout.method).unwrap();
        cd.write_u16::<LittleEndian>(0).unwrap();
        cd.write_u16::<LittleEndian>(0x21).unwrap();
        cd.write_u32::<LittleEndian>(crc32).unwrap();
        cd.write_u32::<LittleEndian>(field_csize).unwrap();
        cd.write_u32::<LittleEndian>(field_usize).unwrap();
        cd.write_u16::<LittleEndian>(name.len() as u16).unwrap();
        cd.write_u16::<LittleEndian>(cd_extra.len() as u16).unwrap();
        cd.write_u16::<LittleEndian>(0).unwrap(); // comment
        cd.write_u16::<LittleEndian>(0).unwrap(); // disk
        cd.write_u16::<LittleEndian>(0).unwrap(); // internal attributes
        let external = if name.ends_with('/') { 0x10 } else { 0 };
        cd.write_u32::<LittleEndian>(external).unwrap();
        cd.write_u32::<LittleEndian>(cd_offset).unwrap();
        cd.extend_from_slice(name.as_bytes());
        cd.extend_from_slice(&cd_extra);

        self.count += 1;
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let cd_offset = self.out.len() as u32;
        let cd_size = self.central.len() as u32;
        self.out.extend_from_slice(&self.central);

        let out = &mut self.out;
        out.write_u32::<LittleEndian>(0x06054b50).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(self.count).unwrap();
        out.write_u16::<LittleEndian>(self.count).unwrap();
        out.write_u32::<LittleEndian>(cd_size).unwrap();
        out.write_u32::<LittleEndian>(cd_offset).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        self.out
    }
}

/// A flat document with `n` `<row>` elements under `<root>`.
pub fn rows_document(n: usize) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<root>\n");
    for i in 0..n {
        xml.push_str(&format!("  <row id=\"{i}\" name=\"r{i}\"/>\n"));
    }
    xml.push_str("</root>\n");
    xml
}
