use std::fmt;
use std::sync::Arc;

/// One mutated byte sequence submitted to the target for a single execution.
///
/// The bytes are frozen at construction; cloning shares the same allocation.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CandidateInput {
    bytes: Arc<[u8]>,
}

impl CandidateInput {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex MD5 digest of the input bytes.
    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(&self.bytes))
    }
}

impl From<Vec<u8>> for CandidateInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl From<&[u8]> for CandidateInput {
    fn from(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl AsRef<[u8]> for CandidateInput {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for CandidateInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 16;
        let shown = &self.bytes[..self.bytes.len().min(PREVIEW)];
        f.debug_struct("CandidateInput")
            .field("len", &self.bytes.len())
            .field("head", &shown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_input_exposes_bytes() {
        let data = CandidateInput::from(vec![1u8, 2, 3]);
        let empty = CandidateInput::from(Vec::new());
        assert_eq!(data.as_bytes(), &[1, 2, 3]);
        assert_eq!(data.len(), 3);
        assert!(!data.is_empty());
        assert!(empty.is_empty());
    }

    #[test]
    fn clones_share_the_same_bytes() {
        let original = CandidateInput::from(&b"GOOD"[..]);
        let copy = original.clone();
        assert_eq!(original, copy);
        assert!(std::ptr::eq(original.as_bytes(), copy.as_bytes()));
    }

    #[test]
    fn digest_is_md5_hex() {
        let input = CandidateInput::from(&b"abc"[..]);
        assert_eq!(input.digest(), "900150983cd24fb0d6963f7d28e17f72");
    }
}
