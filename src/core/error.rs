use std::io::{self, ErrorKind};
use std::path::PathBuf;

use crate::core::check::CheckStatus;

/// Errors raised by a device check or one of its stages.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// `run` was invoked on a check that is not pending.
    #[error("check is {status} and can only be run once")]
    AlreadyRun { status: CheckStatus },

    /// The computed output path is the test file itself.
    #[error("output path {path} is the same as the test file")]
    PathConflict { path: PathBuf },

    /// The readback digest did not match the digest captured during transfer.
    #[error("digest mismatch on readback (iteration {iteration})")]
    DigestMismatch { iteration: u32 },

    /// A concurrent cancel request was observed.
    #[error("check canceled")]
    Canceled,

    /// The cycle loop passed but the output file could not be removed.
    #[error("check passed but removing {path} failed: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Any other read/write/delete failure.
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl CheckError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the underlying I/O failure looks like the medium was yanked
    /// mid-check rather than an ordinary filesystem error.
    pub fn device_removed(&self) -> bool {
        match self {
            Self::Io { source, .. } | Self::Cleanup { source, .. } => {
                is_device_removed_error(source)
            }
            _ => false,
        }
    }
}

/// Check if an I/O error indicates the device has been removed.
pub fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound => true,
        ErrorKind::PermissionDenied => false,
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => true,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO
                        | libc::ENODEV
                        | libc::ENXIO
                        | libc::ENOMEDIUM
                        | libc::EMEDIUMTYPE
                )
            } else {
                false
            }
        }
    }
}
