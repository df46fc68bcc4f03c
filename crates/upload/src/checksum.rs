use std::io::ErrorKind;

use snapvault_store::{Crc32c, Crc32cHasher};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::UploadError;

/// Reads exactly `len` bytes from the current position of `source` and
/// returns their CRC32C.
///
/// The stream is left positioned after the last byte read; callers rewind
/// before transmitting. A pending read is abandoned as soon as `cancel` fires.
pub async fn checksum_source<R>(
    source: &mut R,
    len: u64,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<Crc32c, UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Crc32cHasher::new();
    let mut buf = vec![0u8; buffer_size.max(1)];

    while hasher.len() < len {
        let want = (len - hasher.len()).min(buf.len() as u64) as usize;
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            read = source.read(&mut buf[..want]) => {
                read.map_err(|e| UploadError::read(hasher.len(), e))?
            }
        };
        if n == 0 {
            return Err(UploadError::read(
                hasher.len(),
                std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("source ended after {} of {len} bytes", hasher.len()),
                ),
            ));
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}
