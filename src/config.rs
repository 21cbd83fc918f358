//! Builder-driven configuration for a [`Context`](crate::context::Context): temporary-slab sizing.
//!
//! The datatype nesting limit (spec.md §4.1) stays on the `Info`-key path (`yaksa_nesting_level`)
//! since spec.md's external-interface section names it as an `Info` key explicitly; slab sizing has
//! no such contract, so it's a plain builder the way the teacher builds `BufferInfo`/`ImageInfo`
//! (`src/pool/mod.rs`) instead of overloading `Info` with a key spec.md never lists.

use derive_builder::Builder;

use crate::progress::slab::DEFAULT_SLAB_SIZE;

/// Sizing for the progress engine's temporary ring buffers: one pinned-host slab shared per
/// backend, and one device slab per `(backend, device)` pair a request actually touches.
///
/// Both default to [`DEFAULT_SLAB_SIZE`] (16 MiB, spec.md §3's `TMPBUF_SLAB_SIZE`). Tests that want
/// to observe chunking without allocating tens of megabytes (e.g. spec.md §8 scenario 6's staged
/// D2D progress test) build a `SlabConfig` with much smaller values instead.
#[derive(Debug, Clone, Copy, Builder)]
#[builder(pattern = "owned")]
pub struct SlabConfig {
    #[builder(default = "DEFAULT_SLAB_SIZE")]
    pub host_bytes: usize,
    #[builder(default = "DEFAULT_SLAB_SIZE")]
    pub device_bytes: usize,
}

impl Default for SlabConfig {
    fn default() -> Self {
        SlabConfig {
            host_bytes: DEFAULT_SLAB_SIZE,
            device_bytes: DEFAULT_SLAB_SIZE,
        }
    }
}

/// Bundles every constructor-time knob a `Context` accepts, beyond what `Info` already covers —
/// today that's just [`SlabConfig`], but it's the single place a future tunable (e.g. a per-backend
/// slab count) would join it rather than growing `Context::create`'s argument list.
#[derive(Debug, Clone, Default, Builder)]
#[builder(pattern = "owned")]
pub struct EngineConfig {
    #[builder(default)]
    pub slab: SlabConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_tmpbuf_slab_size() {
        let config = SlabConfigBuilder::default().build().unwrap();
        assert_eq!(config.host_bytes, DEFAULT_SLAB_SIZE);
        assert_eq!(config.device_bytes, DEFAULT_SLAB_SIZE);
    }

    #[test]
    fn builder_overrides_one_field_independently() {
        let config = SlabConfigBuilder::default()
            .device_bytes(1024 * 1024)
            .build()
            .unwrap();
        assert_eq!(config.device_bytes, 1024 * 1024);
        assert_eq!(config.host_bytes, DEFAULT_SLAB_SIZE);
    }
}
