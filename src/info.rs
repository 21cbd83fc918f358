//! `Info` key-value option bags.
//!
//! Kept deliberately small: this is the one external collaborator spec.md names a contract for
//! without asking for a full subsystem (no precedence rules, no typed values, no wildcard
//! matching) — just the handful of recognized keys the dispatcher and progress engine consult.

use std::collections::HashMap;

/// Recognized `Info` keys. Unrecognized keys are stored but never read back by the library.
pub mod keys {
    /// Forces the pointer classifier's backend choice when more than one backend would claim a
    /// pointer. Value names a registered backend.
    pub const GPU_DRIVER: &str = "yaksa_gpu_driver";

    /// Precomputed pointer attribute for the `inbuf` side, skipping a probe.
    pub const CUDA_INBUF_PTR_ATTR: &str = "yaksa_cuda_inbuf_ptr_attr";

    /// Precomputed pointer attribute for the `outbuf` side, skipping a probe.
    pub const CUDA_OUTBUF_PTR_ATTR: &str = "yaksa_cuda_outbuf_ptr_attr";

    /// Overrides the maximum datatype tree nesting depth for constructors called with this info.
    pub const NESTING_LEVEL: &str = "yaksa_nesting_level";
}

/// An opaque options bag passed to constructors and pack/unpack/accumulate calls.
#[derive(Debug, Clone, Default)]
pub struct Info {
    entries: HashMap<String, Vec<u8>>,
}

impl Info {
    pub fn create() -> Self {
        Self::default()
    }

    /// Appends a key-value pair. Screen-13-style builders would return `&mut Self`, but the
    /// original's `yaksa_info_keyval_append` is append-only and never shadows a previous value
    /// for the same key, so duplicate keys are kept in insertion order via a `Vec` fallback isn't
    /// needed here: last write wins, matching the reference implementation's hash-table storage.
    pub fn keyval_append(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get_str(key).and_then(|s| s.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyval_round_trips() {
        let mut info = Info::create();
        info.keyval_append(keys::NESTING_LEVEL, "5".as_bytes().to_vec());
        assert_eq!(info.get_usize(keys::NESTING_LEVEL), Some(5));
    }

    #[test]
    fn last_write_wins() {
        let mut info = Info::create();
        info.keyval_append("k", b"a".to_vec());
        info.keyval_append("k", b"b".to_vec());
        assert_eq!(info.get_str("k"), Some("b"));
    }
}
