use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::digest::{ContentDigest, DigestSource};
use crate::core::error::CheckError;
use crate::logging::LogThrottle;

/// Buffer size for file I/O operations (128KB for optimal throughput)
pub(crate) const BUFFER_SIZE: usize = 128 * 1024;

/// Minimum interval between transfer progress log lines
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

/// Streams the test file onto the device while incrementally digesting it.
///
/// The copy is chunked so cancellation is observed between chunks; the output
/// file is fsynced after writing so the readback exercises the medium rather
/// than the page cache. The digest of the copied bytes is available after a
/// successful `transfer`.
pub struct TransferStage {
    source: PathBuf,
    dest: PathBuf,
    digests: Arc<dyn DigestSource>,
    cancel: CancellationToken,
    digest: Option<ContentDigest>,
}

impl TransferStage {
    pub fn new(
        source: PathBuf,
        dest: PathBuf,
        digests: Arc<dyn DigestSource>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            dest,
            digests,
            cancel,
            digest: None,
        }
    }

    /// Copy the source file to the destination, feeding every chunk through a
    /// fresh digest sink. Blocks until the copy completes, fails, or is
    /// canceled. Overwrites any previous output at the destination.
    pub fn transfer(&mut self) -> Result<ContentDigest, CheckError> {
        if self.cancel.is_cancelled() {
            return Err(CheckError::Canceled);
        }

        let source_file = File::open(&self.source).map_err(|e| {
            CheckError::io(format!("failed to open test file {}", self.source.display()), e)
        })?;
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

        let dest_file = File::create(&self.dest).map_err(|e| {
            CheckError::io(format!("failed to create output file {}", self.dest.display()), e)
        })?;
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

        let mut sink = self.digests.new_digest();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut bytes_copied: u64 = 0;
        let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);

        loop {
            if self.cancel.is_cancelled() {
                return Err(CheckError::Canceled);
            }

            let bytes_read = reader.read(&mut buffer).map_err(|e| {
                CheckError::io(format!("failed to read test file {}", self.source.display()), e)
            })?;
            if bytes_read == 0 {
                break;
            }

            sink.update(&buffer[..bytes_read]);
            writer.write_all(&buffer[..bytes_read]).map_err(|e| {
                CheckError::io(format!("failed to write to {}", self.dest.display()), e)
            })?;

            bytes_copied += bytes_read as u64;
            if throttle.should_log() {
                debug!(dest = %self.dest.display(), bytes_copied, "transfer progress");
            }
        }

        writer.flush().map_err(|e| {
            CheckError::io(format!("failed to flush {}", self.dest.display()), e)
        })?;

        // Push the bytes onto the medium; a counterfeit drive that only ever
        // sees the page cache would otherwise verify clean.
        let inner = writer.into_inner().map_err(|e| {
            CheckError::io(
                format!("failed to finish writing {}", self.dest.display()),
                e.into_error(),
            )
        })?;
        inner.sync_all().map_err(|e| {
            CheckError::io(format!("failed to sync {}", self.dest.display()), e)
        })?;

        debug!(dest = %self.dest.display(), bytes_copied, "transfer complete");

        let digest = sink.finish();
        self.digest = Some(digest);
        Ok(digest)
    }

    /// The digest of the copied bytes; `None` until `transfer` has succeeded.
    pub fn digest(&self) -> Option<&ContentDigest> {
        self.digest.as_ref()
    }

    /// Cooperative cancel; unblocks the copy loop at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
