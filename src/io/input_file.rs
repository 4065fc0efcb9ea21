//! Random-access input file: ranged GET reads with optional HEAD elision.
//!
//! Grounded on `S3Transport::read_file`/`S3Transport::metadata`
//! (`head_object`/`get_object`), generalized from "always read the whole
//! object" (Conserve's objects are bounded archive blocks) into ranged,
//! seekable random access.

use std::sync::Arc;

use aws_sdk_s3::Client;
use bytes::Bytes;

use crate::client::holder::ClientHolder;
use crate::error::{from_sdk_error, Error, Result};
use crate::file_info::{metadata_from_head, FileInfo, ObjectMetadata};
use crate::path::Path;

/// A random-access, seekable handle onto one S3 object.
pub struct InputFile {
    holder: Arc<ClientHolder<Client>>,
    path: Path,
    size: i64,
    metadata: ObjectMetadata,
    sse_customer_key: Option<String>,
    position: i64,
    closed: bool,
}

impl InputFile {
    /// Open `path`. If `info` carries a non-negative `size`, HEAD is
    /// skipped entirely and `metadata()` reads back empty, per §4.F's open
    /// policy.
    pub async fn open(
        holder: Arc<ClientHolder<Client>>,
        path: Path,
        info: Option<&FileInfo>,
        sse_customer_key: Option<String>,
    ) -> Result<Self> {
        let known_size = info.map(|i| i.size).filter(|&size| size >= 0);
        let (size, metadata) = match known_size {
            Some(size) => (size, ObjectMetadata::new()),
            None => head(&holder, &path, sse_customer_key.as_deref()).await?,
        };
        Ok(InputFile {
            holder,
            path,
            size,
            metadata,
            sse_customer_key,
            position: 0,
            closed: false,
        })
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn metadata(&self) -> &ObjectMetadata {
        &self.metadata
    }

    pub fn seek(&mut self, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(Error::invalid_input(format!("seek offset must be non-negative: {offset}")));
        }
        self.position = offset;
        Ok(())
    }

    /// Read up to `nbytes` starting at the current position, advancing it by
    /// however many bytes were actually returned.
    pub async fn read(&mut self, nbytes: usize) -> Result<Bytes> {
        let bytes = self.read_at(self.position, nbytes).await?;
        self.position += bytes.len() as i64;
        Ok(bytes)
    }

    /// Read exactly `min(nbytes, size - offset)` bytes via a single ranged
    /// GET, independent of the stream's current position.
    pub async fn read_at(&self, offset: i64, nbytes: usize) -> Result<Bytes> {
        if self.closed {
            return Err(Error::invalid_state("read on a closed input stream"));
        }
        if offset < 0 {
            return Err(Error::invalid_input(format!("read offset must be non-negative: {offset}")));
        }
        let Some((offset, last_byte)) = clamped_read_range(offset, nbytes, self.size) else {
            return Ok(Bytes::new());
        };

        let client = self.holder.lock().await?.move_out();
        let mut request = client
            .get_object()
            .bucket(self.path.bucket_name())
            .key(self.path.key())
            .range(format!("bytes={offset}-{last_byte}"));
        if let Some(ref key) = self.sse_customer_key {
            request = request.sse_customer_key(key).sse_customer_algorithm("AES256");
        }
        let response = request
            .send()
            .await
            .map_err(|e| from_sdk_error("GetObject", self.path.clone(), e))?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| Error::io("GetObject", self.path.clone(), e))?;
        Ok(body.into_bytes())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// The inclusive byte range to request for a read of `nbytes` at `offset`
/// against an object of `size` bytes, or `None` if the read is past EOF or
/// empty, per §4.F's read policy ("reads past EOF are truncated").
fn clamped_read_range(offset: i64, nbytes: usize, size: i64) -> Option<(i64, i64)> {
    if nbytes == 0 || offset >= size {
        return None;
    }
    let want = (nbytes as i64).min(size - offset);
    Some((offset, offset + want - 1))
}

async fn head(
    holder: &Arc<ClientHolder<Client>>,
    path: &Path,
    sse_customer_key: Option<&str>,
) -> Result<(i64, ObjectMetadata)> {
    let client = holder.lock().await?.move_out();
    let mut request = client.head_object().bucket(path.bucket_name()).key(path.key());
    if let Some(key) = sse_customer_key {
        request = request.sse_customer_key(key).sse_customer_algorithm("AES256");
    }
    let response = request
        .send()
        .await
        .map_err(|e| from_sdk_error("HeadObject", path.clone(), e))?;
    let content_length = response.content_length().unwrap_or(0);
    let metadata = metadata_from_head(
        content_length,
        response.cache_control(),
        response.content_type(),
        response.content_language(),
        response.e_tag(),
        response.version_id(),
        response.last_modified().and_then(|dt| {
            aws_smithy_types_convert::date_time::DateTimeExt::to_time(*dt).ok()
        }),
        response.expires_string(),
    );
    Ok((content_length, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamped_range_truncates_at_eof() {
        assert_eq!(clamped_read_range(0, 100, 10), Some((0, 9)));
        assert_eq!(clamped_read_range(5, 100, 10), Some((5, 9)));
    }

    #[test]
    fn clamped_range_is_none_past_eof_or_empty() {
        assert_eq!(clamped_read_range(10, 5, 10), None);
        assert_eq!(clamped_read_range(0, 0, 10), None);
    }

    #[test]
    fn clamped_range_within_bounds_uses_requested_size() {
        assert_eq!(clamped_read_range(2, 3, 100), Some((2, 4)));
    }
}
