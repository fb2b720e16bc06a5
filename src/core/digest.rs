use std::fmt;

/// A fixed-size content fingerprint of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<blake3::Hash> for ContentDigest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

/// An incremental digest over a stream of chunks.
pub trait DigestSink: Send {
    fn update(&mut self, chunk: &[u8]);
    fn finish(self: Box<Self>) -> ContentDigest;
}

/// Stateless factory producing a fresh digest per stage invocation.
///
/// The transfer and verify stages each pull a new sink from the same source,
/// so a test double here is the seam for injecting digest mismatches.
pub trait DigestSource: Send + Sync {
    fn new_digest(&self) -> Box<dyn DigestSink>;
}

/// BLAKE3-backed digest source used by the real tool.
pub struct Blake3Source;

impl DigestSource for Blake3Source {
    fn new_digest(&self) -> Box<dyn DigestSink> {
        Box::new(Blake3Sink(blake3::Hasher::new()))
    }
}

struct Blake3Sink(blake3::Hasher);

impl DigestSink for Blake3Sink {
    fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    fn finish(self: Box<Self>) -> ContentDigest {
        self.0.finalize().into()
    }
}
