pub mod batch;
pub mod check;
pub mod digest;
pub mod error;
pub mod transfer;
pub mod verify;

pub use batch::{BatchListener, BatchRunner};
pub use check::{CheckStatus, DeviceCheck};
pub use digest::{Blake3Source, ContentDigest, DigestSink, DigestSource};
pub use error::CheckError;
pub use transfer::TransferStage;
pub use verify::VerifyStage;
