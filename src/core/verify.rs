use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::digest::{ContentDigest, DigestSource};
use crate::core::error::CheckError;
use crate::core::transfer::BUFFER_SIZE;

/// Reads a written file back from the device and compares its digest against
/// the one captured during transfer.
pub struct VerifyStage {
    path: PathBuf,
    digests: Arc<dyn DigestSource>,
    cancel: CancellationToken,
}

impl VerifyStage {
    pub fn new(path: PathBuf, digests: Arc<dyn DigestSource>, cancel: CancellationToken) -> Self {
        Self {
            path,
            digests,
            cancel,
        }
    }

    /// Stream the file through a fresh digest sink and compare. Blocks until
    /// the readback completes, fails, or is canceled.
    pub fn check(&self, expected: &ContentDigest) -> Result<bool, CheckError> {
        if self.cancel.is_cancelled() {
            return Err(CheckError::Canceled);
        }

        let file = File::open(&self.path).map_err(|e| {
            CheckError::io(format!("failed to open {} for readback", self.path.display()), e)
        })?;
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);

        let mut sink = self.digests.new_digest();
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            if self.cancel.is_cancelled() {
                return Err(CheckError::Canceled);
            }

            let bytes_read = reader.read(&mut buffer).map_err(|e| {
                CheckError::io(format!("failed to read back {}", self.path.display()), e)
            })?;
            if bytes_read == 0 {
                break;
            }
            sink.update(&buffer[..bytes_read]);
        }

        let actual = sink.finish();
        let matches = actual == *expected;
        debug!(
            path = %self.path.display(),
            expected = %expected,
            actual = %actual,
            matches,
            "readback digest computed"
        );
        Ok(matches)
    }

    /// Cooperative cancel; unblocks the readback loop at the next chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::Blake3Source;
    use std::fs;
    use tempfile::tempdir;

    fn stage(path: &std::path::Path) -> VerifyStage {
        VerifyStage::new(
            path.to_path_buf(),
            Arc::new(Blake3Source),
            CancellationToken::new(),
        )
    }

    #[test]
    fn matching_digest_passes() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("out.bin");
        fs::write(&path, b"written to the device").unwrap();

        let expected = blake3::hash(b"written to the device").into();
        assert!(stage(&path).check(&expected).unwrap());
    }

    #[test]
    fn different_digest_fails() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("out.bin");
        fs::write(&path, b"what the drive actually stored").unwrap();

        let expected = blake3::hash(b"what we wrote").into();
        assert!(!stage(&path).check(&expected).unwrap());
    }

    #[test]
    fn missing_file_is_io_error() {
        let temp = tempdir().unwrap();
        let verify = stage(&temp.path().join("gone.bin"));

        let expected = blake3::hash(b"anything").into();
        assert!(matches!(verify.check(&expected), Err(CheckError::Io { .. })));
    }

    #[test]
    fn canceled_before_start_does_no_io() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("out.bin");
        fs::write(&path, b"content").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let verify = VerifyStage::new(path, Arc::new(Blake3Source), token);

        let expected = blake3::hash(b"content").into();
        assert!(matches!(verify.check(&expected), Err(CheckError::Canceled)));
    }
}
