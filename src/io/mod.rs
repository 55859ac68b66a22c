//! Random-access archive sources.
//!
//! The central-directory reader only needs positioned reads, so any source
//! that can serve a byte range works: an in-memory buffer, a local file or a
//! remote file fetched with HTTP Range requests.

mod http;
mod local;
mod memory;

pub use http::{HttpRangeReader, RetryPolicy};
pub use local::LocalFileReader;
pub use memory::MemoryReader;

use crate::error::{Error, Result};
use async_trait::async_trait;

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Fill `buf` completely starting at `offset`.
    ///
    /// Fails with [`Error::ContainerFormat`] when the source ends first,
    /// since every caller reads ranges the archive itself pointed at.
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::ContainerFormat(format!(
                    "range {}..{} lies beyond the end of the archive ({} bytes)",
                    offset,
                    offset + buf.len() as u64,
                    self.size()
                )));
            }
            filled += n;
        }
        Ok(())
    }
}
