//! Sequential ZIP reader for non-seekable sources.
//!
//! A streamed archive can only be read front to back, so entries are
//! discovered through their local file headers and handed out one at a
//! time. Each [`ZipEntryReader`] mutably borrows the [`ZipStreamReader`]
//! it came from: the next entry cannot be requested while the current one
//! is alive. Dropping an entry before reading it to the end is allowed;
//! the reader skips the rest of its payload itself on the next call to
//! [`ZipStreamReader::next_entry`].

use flate2::{Crc, Decompress, FlushDecompress, Status};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

use super::structures::*;

/// Default read-buffer and inflate chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Where the reader is in the archive.
enum DemuxState {
    /// Positioned at a record signature
    Idle,
    /// An entry has been handed out and is being read
    EntryActive(ActiveEntry),
    /// The entry was dropped unfinished; its payload must be skipped
    EntryDraining(ActiveEntry),
    /// The central directory was reached
    Exhausted,
    /// A fatal error occurred; `pending` holds one not yet reported
    Errored { pending: Option<String> },
}

/// Decoding state for the entry currently being read.
struct ActiveEntry {
    name: String,
    header: LocalFileHeader,
    zip64: bool,
    inflater: Option<Decompress>,
    /// Compressed bytes left, `None` when delimited by a data descriptor
    remaining: Option<u64>,
    crc: Crc,
    produced: u64,
    /// Payload cannot be decoded; reads fail and drains skip raw bytes
    unreadable: Option<String>,
    deflate_ended: bool,
    finished: bool,
    /// The position of the next record is no longer known
    boundary_lost: bool,
}

impl ActiveEntry {
    fn fail(&mut self, message: impl Into<String>) -> Error {
        let message = message.into();
        if self.remaining.is_some() {
            self.unreadable = Some(message.clone());
        } else {
            self.boundary_lost = true;
        }
        Error::entry(&self.name, message)
    }

    fn truncated(&mut self) -> Error {
        self.boundary_lost = true;
        Error::entry(&self.name, "archive ended inside entry data")
    }
}

/// Streaming ZIP reader yielding one entry at a time.
pub struct ZipStreamReader<R> {
    reader: BufReader<R>,
    chunk_size: usize,
    state: DemuxState,
    entries_read: usize,
}

impl<R: AsyncRead + Unpin> ZipStreamReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_capacity(DEFAULT_CHUNK_SIZE, reader)
    }

    /// Use `capacity` for the read buffer and for decompressed chunks.
    pub fn with_capacity(capacity: usize, reader: R) -> Self {
        let capacity = capacity.max(1);
        Self {
            reader: BufReader::with_capacity(capacity, reader),
            chunk_size: capacity,
            state: DemuxState::Idle,
            entries_read: 0,
        }
    }

    /// Number of entries handed out so far.
    pub fn entries_read(&self) -> usize {
        self.entries_read
    }

    /// Advance to the next entry in archive order.
    ///
    /// Any unread part of the previous entry is skipped first. Returns
    /// `Ok(None)` once the central directory is reached. A malformed header
    /// is reported once; every later call returns `Ok(None)`.
    pub async fn next_entry(&mut self) -> Result<Option<ZipEntryReader<'_, R>>> {
        self.next_entry_where(|_| true).await
    }

    /// Like [`next_entry`](Self::next_entry), but entries whose full path
    /// `accept` rejects are skipped without being handed out.
    pub async fn next_entry_where<F>(&mut self, mut accept: F) -> Result<Option<ZipEntryReader<'_, R>>>
    where
        F: FnMut(&str) -> bool,
    {
        loop {
            self.finish_current().await?;

            match &mut self.state {
                DemuxState::Exhausted => return Ok(None),
                DemuxState::Errored { pending } => {
                    return match pending.take() {
                        Some(reason) => Err(Error::ContainerFormat(reason)),
                        None => Ok(None),
                    };
                }
                _ => {}
            }

            match self.read_header().await {
                Ok(Some(entry)) => {
                    self.entries_read += 1;
                    if !accept(&entry.name) {
                        debug!(name = %entry.name, "entry skipped");
                        self.state = DemuxState::EntryDraining(entry);
                        continue;
                    }
                    debug!(
                        name = %entry.name,
                        method = entry.header.compression_method.as_u16(),
                        descriptor = entry.header.has_data_descriptor(),
                        "entry header"
                    );
                    let name = entry.name.clone();
                    let compression_method = entry.header.compression_method;
                    self.state = DemuxState::EntryActive(entry);
                    return Ok(Some(ZipEntryReader {
                        archive: self,
                        name,
                        compression_method,
                    }));
                }
                Ok(None) => {
                    debug!(entries = self.entries_read, "reached central directory");
                    self.state = DemuxState::Exhausted;
                    return Ok(None);
                }
                Err(e) => {
                    self.state = DemuxState::Errored { pending: None };
                    return Err(e);
                }
            }
        }
    }

    /// Skip whatever is left of the current entry and return to `Idle`.
    async fn finish_current(&mut self) -> Result<()> {
        let entry = match &mut self.state {
            DemuxState::EntryActive(entry) | DemuxState::EntryDraining(entry) => entry,
            _ => return Ok(()),
        };

        let result = drain(&mut self.reader, entry, self.chunk_size).await;
        match result {
            Ok(()) => {
                self.state = DemuxState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = DemuxState::Errored { pending: None };
                Err(Error::ContainerFormat(e.to_string()))
            }
        }
    }

    /// Read the next record signature and, for a local file, its header.
    async fn read_header(&mut self) -> Result<Option<ActiveEntry>> {
        let mut signature = [0u8; 4];
        read_record(&mut self.reader, &mut signature, "record signature").await?;

        match &signature[..] {
            LFH_SIGNATURE => {}
            CDFH_SIGNATURE => return Ok(None),
            sig if sig == EndOfCentralDirectory::SIGNATURE || sig == Zip64EOCD::SIGNATURE => {
                return Ok(None);
            }
            other => {
                return Err(Error::ContainerFormat(format!(
                    "unexpected record signature {:02x?} after {} entries",
                    other, self.entries_read
                )));
            }
        }

        let mut body = [0u8; LocalFileHeader::BODY_SIZE];
        read_record(&mut self.reader, &mut body, "local file header").await?;
        let mut header = LocalFileHeader::from_body(&body)?;

        let mut variable =
            vec![0u8; header.file_name_length as usize + header.extra_field_length as usize];
        read_record(&mut self.reader, &mut variable, "local file header").await?;
        let name = String::from_utf8_lossy(&variable[..header.file_name_length as usize]).into_owned();
        let extra = &variable[header.file_name_length as usize..];

        let zip64 = header.is_zip64() || has_zip64_extra(extra);
        header.apply_extra(extra)?;

        let has_descriptor = header.has_data_descriptor();
        let mut unreadable = None;
        if header.is_encrypted() {
            unreadable = Some("encrypted entries are not supported".to_string());
        } else if let CompressionMethod::Unknown(method) = header.compression_method {
            unreadable = Some(format!("unsupported compression method {method}"));
        }

        let inflater = (header.compression_method == CompressionMethod::Deflate
            && unreadable.is_none()
            && (has_descriptor || header.compressed_size > 0))
            .then(|| Decompress::new(false));

        let remaining = if inflater.is_some() && has_descriptor {
            None
        } else if has_descriptor && header.compressed_size == 0 && !name.ends_with('/') {
            return Err(Error::ContainerFormat(format!(
                "entry '{}' has no recorded size and cannot be delimited in a stream",
                name
            )));
        } else {
            Some(header.compressed_size)
        };

        Ok(Some(ActiveEntry {
            name,
            header,
            zip64,
            inflater,
            remaining,
            crc: Crc::new(),
            produced: 0,
            unreadable,
            deflate_ended: false,
            finished: false,
            boundary_lost: false,
        }))
    }

    /// Next decompressed chunk of the active entry.
    async fn read_entry_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let entry = match &mut self.state {
            DemuxState::EntryActive(entry) | DemuxState::EntryDraining(entry) => entry,
            _ => return Ok(None),
        };

        let result = payload_chunk(&mut self.reader, entry, self.chunk_size).await;
        let (finished, boundary_lost) = (entry.finished, entry.boundary_lost);

        match &result {
            Ok(Some(_)) => {}
            Ok(None) => self.state = DemuxState::Idle,
            Err(e) if boundary_lost => {
                self.state = DemuxState::Errored {
                    pending: Some(e.to_string()),
                };
            }
            Err(_) if finished => self.state = DemuxState::Idle,
            Err(_) => {}
        }
        result
    }

    fn mark_discarded(&mut self) {
        self.state = match std::mem::replace(&mut self.state, DemuxState::Idle) {
            DemuxState::EntryActive(entry) => {
                trace!(name = %entry.name, "entry discarded before end of data");
                DemuxState::EntryDraining(entry)
            }
            other => other,
        };
    }
}

/// One archive member being read from a [`ZipStreamReader`].
///
/// Dropping the reader early discards the rest of the entry.
pub struct ZipEntryReader<'a, R: AsyncRead + Unpin> {
    archive: &'a mut ZipStreamReader<R>,
    name: String,
    compression_method: CompressionMethod,
}

impl<'a, R: AsyncRead + Unpin> ZipEntryReader<'a, R> {
    /// Full path of the entry as stored in the archive.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_directory(&self) -> bool {
        self.name().ends_with('/')
    }

    pub fn compression_method(&self) -> CompressionMethod {
        self.compression_method
    }

    /// Next chunk of decompressed bytes, `None` at the end of the entry.
    ///
    /// The CRC-32 and size recorded in the archive are checked when the end
    /// is reached; a mismatch is returned as [`Error::EntryRead`].
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.archive.read_entry_chunk().await
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Skip the rest of the entry now instead of on the next `next_entry`.
    pub async fn autodrain(self) -> Result<()> {
        self.archive.finish_current().await
    }
}

impl<R: AsyncRead + Unpin> Drop for ZipEntryReader<'_, R> {
    fn drop(&mut self) {
        self.archive.mark_discarded();
    }
}

async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    reader.read_exact(buf).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            Error::ContainerFormat(format!("archive ended inside {what}"))
        }
        _ => Error::Io(e),
    })?;
    Ok(())
}

fn has_zip64_extra(extra: &[u8]) -> bool {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let size = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        if id == 0x0001 {
            return true;
        }
        pos += 4 + size;
    }
    false
}

/// Produce the next decompressed chunk, or finish the entry.
async fn payload_chunk<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    entry: &mut ActiveEntry,
    chunk_size: usize,
) -> Result<Option<Vec<u8>>> {
    if entry.finished {
        return Ok(None);
    }
    if let Some(message) = &entry.unreadable {
        return Err(Error::entry(&entry.name, message.clone()));
    }

    let chunk = if entry.inflater.is_some() {
        inflate_chunk(reader, entry, chunk_size).await?
    } else {
        stored_chunk(reader, entry, chunk_size).await?
    };

    match chunk {
        Some(data) => {
            entry.crc.update(&data);
            entry.produced += data.len() as u64;
            Ok(Some(data))
        }
        None => {
            finish_entry(reader, entry).await?;
            Ok(None)
        }
    }
}

async fn stored_chunk<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    entry: &mut ActiveEntry,
    chunk_size: usize,
) -> Result<Option<Vec<u8>>> {
    let remaining = entry.remaining.unwrap_or(0);
    if remaining == 0 {
        return Ok(None);
    }

    let available = match reader.fill_buf().await {
        Ok(buf) => buf,
        Err(_) => return Err(entry.truncated()),
    };
    if available.is_empty() {
        return Err(entry.truncated());
    }

    let n = available.len().min(chunk_size).min(remaining as usize);
    let data = available[..n].to_vec();
    reader.consume(n);
    entry.remaining = Some(remaining - n as u64);
    Ok(Some(data))
}

async fn inflate_chunk<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    entry: &mut ActiveEntry,
    chunk_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut out = vec![0u8; chunk_size];

    loop {
        if entry.deflate_ended {
            return Ok(None);
        }

        let available = match reader.fill_buf().await {
            Ok(buf) => buf,
            Err(_) => return Err(entry.truncated()),
        };
        let limit = match entry.remaining {
            Some(remaining) => available.len().min(remaining as usize),
            None => available.len(),
        };
        let input = &available[..limit];
        let at_end = input.is_empty();

        let Some(inflater) = entry.inflater.as_mut() else {
            return Ok(None);
        };
        let (in_before, out_before) = (inflater.total_in(), inflater.total_out());
        let status = inflater.decompress(input, &mut out, FlushDecompress::None);
        let consumed = (inflater.total_in() - in_before) as usize;
        let produced = (inflater.total_out() - out_before) as usize;

        reader.consume(consumed);
        if let Some(remaining) = entry.remaining.as_mut() {
            *remaining -= consumed as u64;
        }

        match status {
            Ok(Status::StreamEnd) => entry.deflate_ended = true,
            Ok(_) => {}
            Err(e) => return Err(entry.fail(format!("corrupt deflate data: {e}"))),
        }

        if produced > 0 {
            out.truncate(produced);
            return Ok(Some(out));
        }
        if consumed == 0 && !entry.deflate_ended {
            return Err(if !at_end {
                entry.fail("deflate decoder made no progress")
            } else if entry.remaining == Some(0) {
                entry.fail("deflate stream ends before its final block")
            } else {
                entry.truncated()
            });
        }
    }
}

/// Skip trailing bytes, read the data descriptor and verify the totals.
async fn finish_entry<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    entry: &mut ActiveEntry,
) -> Result<()> {
    if let Some(remaining) = entry.remaining.take() {
        skip_raw(reader, entry, remaining).await?;
    }
    let (crc32, size) = expected_totals(reader, entry).await?;
    entry.finished = true;

    if entry.produced != size {
        return Err(Error::entry(
            &entry.name,
            format!("expected {} bytes, got {}", size, entry.produced),
        ));
    }
    let actual = entry.crc.sum();
    if actual != crc32 {
        return Err(Error::entry(
            &entry.name,
            format!("CRC mismatch: expected {:08x}, got {:08x}", crc32, actual),
        ));
    }
    Ok(())
}

/// CRC and size to check against, from the descriptor if the entry has one.
async fn expected_totals<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    entry: &mut ActiveEntry,
) -> Result<(u32, u64)> {
    if !entry.header.has_data_descriptor() {
        return Ok((entry.header.crc32, entry.header.uncompressed_size));
    }

    let len = if entry.zip64 { 20 } else { 12 };
    let mut buf = vec![0u8; len];
    if reader.read_exact(&mut buf[..4]).await.is_err() {
        return Err(entry.truncated());
    }
    // The descriptor signature is optional.
    let rest = if buf[..4] == *DATA_DESCRIPTOR_SIGNATURE {
        &mut buf[..]
    } else {
        &mut buf[4..]
    };
    if reader.read_exact(rest).await.is_err() {
        return Err(entry.truncated());
    }

    let descriptor = DataDescriptor::from_bytes(&buf, entry.zip64)?;
    Ok((descriptor.crc32, descriptor.uncompressed_size))
}

async fn skip_raw<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    entry: &mut ActiveEntry,
    mut remaining: u64,
) -> Result<()> {
    while remaining > 0 {
        let available = match reader.fill_buf().await {
            Ok(buf) if !buf.is_empty() => buf.len(),
            _ => return Err(entry.truncated()),
        };
        let n = available.min(remaining as usize);
        reader.consume(n);
        remaining -= n as u64;
    }
    Ok(())
}

/// Consume the rest of an entry without returning its data.
///
/// Entry-scoped failures are logged and the entry skipped; only a lost
/// record boundary is returned as an error.
async fn drain<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    entry: &mut ActiveEntry,
    chunk_size: usize,
) -> Result<()> {
    while !entry.finished {
        if entry.unreadable.is_some() {
            let remaining = entry.remaining.take().unwrap_or(0);
            skip_raw(reader, entry, remaining).await?;
            if entry.header.has_data_descriptor() {
                expected_totals(reader, entry).await?;
            }
            entry.finished = true;
            break;
        }

        match payload_chunk(reader, entry, chunk_size).await {
            Ok(_) => {}
            Err(e) if entry.boundary_lost => return Err(e),
            Err(e) => warn!(name = %entry.name, error = %e, "skipping unreadable entry"),
        }
    }
    Ok(())
}
