use std::fmt;
use std::fs;
use std::io;
use std::path::{self, Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::digest::DigestSource;
use crate::core::error::CheckError;
use crate::core::transfer::TransferStage;
use crate::core::verify::VerifyStage;

/// Lifecycle of one device check. Terminal once Success, Failed or Canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl CheckStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

struct CheckState {
    status: CheckStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Drives repeated transfer/verify cycles against one device.
///
/// A check runs at most once. `cancel` may be called from any thread at any
/// time; every internal status write goes through a guarded check-and-set, so
/// a cancellation can never be overwritten by an in-flight Success or Failed
/// transition. The run loop holds no lock while performing I/O.
pub struct DeviceCheck {
    device: PathBuf,
    test_file: PathBuf,
    digests: Arc<dyn DigestSource>,
    cancel: CancellationToken,
    state: Mutex<CheckState>,
    iterations: AtomicU32,
    output: Mutex<Option<PathBuf>>,
}

impl DeviceCheck {
    pub fn new(device: PathBuf, test_file: PathBuf, digests: Arc<dyn DigestSource>) -> Self {
        Self {
            device,
            test_file,
            digests,
            cancel: CancellationToken::new(),
            state: Mutex::new(CheckState {
                status: CheckStatus::Pending,
                started_at: None,
                finished_at: None,
            }),
            iterations: AtomicU32::new(0),
            output: Mutex::new(None),
        }
    }

    /// Run transfer/verify cycles until `max_iterations` complete
    /// (`0` = until canceled), an error occurs, or the check is canceled.
    ///
    /// Blocks for the duration; call from a blocking-capable context. The
    /// output file is removed before this returns, whatever the outcome. A
    /// passing loop whose output file cannot be removed returns
    /// [`CheckError::Cleanup`] while the status remains `Success`.
    pub fn run(&self, max_iterations: u32) -> Result<(), CheckError> {
        {
            let state = self.lock_state();
            match state.status {
                CheckStatus::Pending => {}
                CheckStatus::Canceled => return Err(CheckError::Canceled),
                status => return Err(CheckError::AlreadyRun { status }),
            }
        }

        let result = self.run_cycles(max_iterations);
        let cleanup = self.release();

        match result {
            Ok(()) => cleanup,
            Err(err) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(
                        device = %self.device.display(),
                        error = %cleanup_err,
                        "cleanup failed after check error"
                    );
                }
                Err(err)
            }
        }
    }

    /// Request cancellation. Idempotent; safe to call concurrently with
    /// `run`. Returns false if the check already reached a terminal status.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.status.is_terminal() {
                return false;
            }
            state.status = CheckStatus::Canceled;
        }
        // Unblocks whichever stage is mid-I/O.
        self.cancel.cancel();
        debug!(device = %self.device.display(), "check canceled");
        true
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn status(&self) -> CheckStatus {
        self.lock_state().status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().finished_at
    }

    /// Number of transfer/verify cycles that have fully passed so far.
    pub fn iterations_completed(&self) -> u32 {
        self.iterations.load(Ordering::Relaxed)
    }

    fn run_cycles(&self, max_iterations: u32) -> Result<(), CheckError> {
        match self.try_cycles(max_iterations) {
            Ok(()) => self.set_status_unless_canceled(CheckStatus::Success),
            Err(CheckError::Canceled) => Err(CheckError::Canceled),
            Err(err) => {
                // A cancel that lands here still wins over the failure.
                self.set_status_unless_canceled(CheckStatus::Failed)?;
                Err(err)
            }
        }
    }

    fn try_cycles(&self, max_iterations: u32) -> Result<(), CheckError> {
        self.set_status_unless_canceled(CheckStatus::Running)?;
        let output = self.prepare()?;

        loop {
            let mut transfer = TransferStage::new(
                self.test_file.clone(),
                output.clone(),
                self.digests.clone(),
                self.cancel.child_token(),
            );
            let digest = transfer.transfer()?;

            // Observe a cancel that landed between the stages.
            self.set_status_unless_canceled(CheckStatus::Running)?;

            let verify = VerifyStage::new(
                output.clone(),
                self.digests.clone(),
                self.cancel.child_token(),
            );
            if !verify.check(&digest)? {
                return Err(CheckError::DigestMismatch {
                    iteration: self.iterations_completed() + 1,
                });
            }

            let completed = self.iterations.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                device = %self.device.display(),
                iteration = completed,
                "verification cycle passed"
            );
            if max_iterations > 0 && completed >= max_iterations {
                break;
            }
        }
        Ok(())
    }

    fn prepare(&self) -> Result<PathBuf, CheckError> {
        {
            let mut state = self.lock_state();
            state.started_at = Some(Utc::now());
            state.finished_at = None;
        }
        self.iterations.store(0, Ordering::Relaxed);

        let output = self.output_path()?;
        debug!(
            device = %self.device.display(),
            output = %output.display(),
            "output file resolved"
        );
        *self.lock_output() = Some(output.clone());
        Ok(output)
    }

    /// Delete the output file and stamp the completion time. Runs on every
    /// exit path of `run`.
    fn release(&self) -> Result<(), CheckError> {
        self.lock_state().finished_at = Some(Utc::now());

        let Some(output) = self.lock_output().take() else {
            return Ok(());
        };
        if !output.exists() {
            return Ok(());
        }
        fs::remove_file(&output).map_err(|e| CheckError::Cleanup {
            path: output.clone(),
            source: e,
        })?;
        debug!(output = %output.display(), "output file removed");
        Ok(())
    }

    fn output_path(&self) -> Result<PathBuf, CheckError> {
        let name = self.test_file.file_name().ok_or_else(|| {
            CheckError::io(
                format!("test file {} has no file name", self.test_file.display()),
                io::Error::new(io::ErrorKind::InvalidInput, "missing file name"),
            )
        })?;
        let target = self.device.join(name);

        let source_abs = path::absolute(&self.test_file).map_err(|e| {
            CheckError::io(
                format!("failed to resolve test file {}", self.test_file.display()),
                e,
            )
        })?;
        let target_abs = path::absolute(&target).map_err(|e| {
            CheckError::io(format!("failed to resolve output {}", target.display()), e)
        })?;
        if source_abs == target_abs {
            return Err(CheckError::PathConflict { path: target });
        }
        Ok(target)
    }

    /// Rejects any status write after a cancellation has been observed.
    fn set_status_unless_canceled(&self, next: CheckStatus) -> Result<(), CheckError> {
        let mut state = self.lock_state();
        if state.status == CheckStatus::Canceled {
            return Err(CheckError::Canceled);
        }
        state.status = next;
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CheckState> {
        self.state.lock().expect("check state lock poisoned")
    }

    fn lock_output(&self) -> std::sync::MutexGuard<'_, Option<PathBuf>> {
        self.output.lock().expect("output path lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::{Blake3Source, ContentDigest, DigestSink};
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn new_check(device: &Path, test_file: &Path) -> DeviceCheck {
        DeviceCheck::new(
            device.to_path_buf(),
            test_file.to_path_buf(),
            Arc::new(Blake3Source),
        )
    }

    fn write_test_file(dir: &Path) -> PathBuf {
        let path = dir.join("probe.bin");
        fs::write(&path, vec![0x5au8; 64 * 1024]).unwrap();
        path
    }

    /// Digest source that corrupts the digest produced by one specific sink,
    /// counted from zero across the whole check.
    struct CorruptingSource {
        inner: Blake3Source,
        corrupt_call: u32,
        calls: AtomicU32,
    }

    impl CorruptingSource {
        fn new(corrupt_call: u32) -> Self {
            Self {
                inner: Blake3Source,
                corrupt_call,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl DigestSource for CorruptingSource {
        fn new_digest(&self) -> Box<dyn DigestSink> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let sink = self.inner.new_digest();
            if call == self.corrupt_call {
                Box::new(CorruptingSink(sink))
            } else {
                sink
            }
        }
    }

    struct CorruptingSink(Box<dyn DigestSink>);

    impl DigestSink for CorruptingSink {
        fn update(&mut self, chunk: &[u8]) {
            self.0.update(chunk);
        }

        fn finish(self: Box<Self>) -> ContentDigest {
            let mut bytes = *self.0.finish().as_bytes();
            bytes[0] ^= 0xff;
            ContentDigest::from_bytes(bytes)
        }
    }

    #[test]
    fn successful_run_completes_requested_cycles() {
        let device = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let test_file = write_test_file(source_dir.path());

        let check = new_check(device.path(), &test_file);
        check.run(3).unwrap();

        assert_eq!(check.status(), CheckStatus::Success);
        assert_eq!(check.iterations_completed(), 3);
        assert!(!device.path().join("probe.bin").exists());

        let started = check.started_at().unwrap();
        let finished = check.finished_at().unwrap();
        assert!(started <= finished);
    }

    #[test]
    fn second_run_is_rejected_without_touching_state() {
        let device = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let test_file = write_test_file(source_dir.path());

        let check = new_check(device.path(), &test_file);
        check.run(1).unwrap();
        let finished = check.finished_at();

        match check.run(1) {
            Err(CheckError::AlreadyRun { status }) => assert_eq!(status, CheckStatus::Success),
            other => panic!("expected AlreadyRun, got {other:?}"),
        }
        assert_eq!(check.iterations_completed(), 1);
        assert_eq!(check.finished_at(), finished);
    }

    #[test]
    fn cancel_before_run_skips_all_io() {
        let device = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let test_file = write_test_file(source_dir.path());

        let check = new_check(device.path(), &test_file);
        assert!(check.cancel());
        assert!(!check.cancel(), "second cancel must be a no-op");

        assert!(matches!(check.run(5), Err(CheckError::Canceled)));
        assert_eq!(check.status(), CheckStatus::Canceled);
        assert!(check.started_at().is_none());
        assert!(!device.path().join("probe.bin").exists());
    }

    #[test]
    fn output_path_equal_to_source_is_rejected() {
        let device = tempdir().unwrap();
        // Test file lives on the "device" itself, so the output path collides.
        let test_file = write_test_file(device.path());

        let check = new_check(device.path(), &test_file);
        assert!(matches!(check.run(1), Err(CheckError::PathConflict { .. })));
        assert_eq!(check.status(), CheckStatus::Failed);
        // The test file itself must survive.
        assert!(test_file.exists());
    }

    #[test]
    fn digest_mismatch_fails_and_still_cleans_up() {
        let device = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let test_file = write_test_file(source_dir.path());

        // Sink 0 digests the transfer, sink 1 the readback.
        let check = DeviceCheck::new(
            device.path().to_path_buf(),
            test_file,
            Arc::new(CorruptingSource::new(1)),
        );

        match check.run(1) {
            Err(CheckError::DigestMismatch { iteration }) => assert_eq!(iteration, 1),
            other => panic!("expected DigestMismatch, got {other:?}"),
        }
        assert_eq!(check.status(), CheckStatus::Failed);
        assert_eq!(check.iterations_completed(), 0);
        assert!(!device.path().join("probe.bin").exists());
    }

    #[test]
    fn mismatch_on_later_iteration_keeps_earlier_count() {
        let device = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let test_file = write_test_file(source_dir.path());

        // Calls 0/1 serve iteration one, call 3 is iteration two's readback.
        let check = DeviceCheck::new(
            device.path().to_path_buf(),
            test_file,
            Arc::new(CorruptingSource::new(3)),
        );

        match check.run(5) {
            Err(CheckError::DigestMismatch { iteration }) => assert_eq!(iteration, 2),
            other => panic!("expected DigestMismatch, got {other:?}"),
        }
        assert_eq!(check.iterations_completed(), 1);
    }

    #[test]
    fn concurrent_cancel_always_wins() {
        let device = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let test_file = write_test_file(source_dir.path());

        let check = Arc::new(new_check(device.path(), &test_file));
        let runner = Arc::clone(&check);
        // 0 = loop until canceled; the run can only end via the cancel below.
        let handle = std::thread::spawn(move || runner.run(0));

        let deadline = Instant::now() + Duration::from_secs(10);
        while check.iterations_completed() < 1 {
            assert!(Instant::now() < deadline, "check never made progress");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(check.cancel());
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(CheckError::Canceled)));
        assert_eq!(check.status(), CheckStatus::Canceled);
        assert!(!device.path().join("probe.bin").exists());
    }

    /// Digest source that parks one specific sink request until the test
    /// releases it, so the test can mutate the filesystem mid-run.
    struct GatedSource {
        inner: Blake3Source,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        gate_call: u32,
        calls: AtomicU32,
    }

    impl DigestSource for GatedSource {
        fn new_digest(&self) -> Box<dyn DigestSink> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.gate_call {
                if let Some(rx) = self.gate.lock().unwrap().take() {
                    let _ = rx.recv_timeout(Duration::from_secs(10));
                }
            }
            self.inner.new_digest()
        }
    }

    #[cfg(unix)]
    #[test]
    fn cleanup_failure_after_pass_is_reported_distinctly() {
        use std::os::unix::fs::PermissionsExt;

        let device = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let test_file = write_test_file(source_dir.path());

        let (tx, rx) = mpsc::channel();
        let check = Arc::new(DeviceCheck::new(
            device.path().to_path_buf(),
            test_file,
            Arc::new(GatedSource {
                inner: Blake3Source,
                gate: Mutex::new(Some(rx)),
                gate_call: 1, // park at the readback of the only iteration
                calls: AtomicU32::new(0),
            }),
        ));

        let runner = Arc::clone(&check);
        let handle = std::thread::spawn(move || runner.run(1));

        // While the check is parked, make the device directory undeletable-in.
        let deadline = Instant::now() + Duration::from_secs(10);
        while !device.path().join("probe.bin").exists() {
            assert!(Instant::now() < deadline, "output file never appeared");
            std::thread::sleep(Duration::from_millis(5));
        }
        fs::set_permissions(device.path(), fs::Permissions::from_mode(0o555)).unwrap();
        tx.send(()).unwrap();

        let result = handle.join().unwrap();
        // Restore so the tempdir can be dropped.
        fs::set_permissions(device.path(), fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(result, Err(CheckError::Cleanup { .. })));
        assert_eq!(check.status(), CheckStatus::Success);
        assert_eq!(check.iterations_completed(), 1);
    }
}
