//! Compile-time layout and lifecycle constants, generated by `build.rs`
//! from `slabcfg.toml` (or the file named by the `SLAB_CLASSES` env var).
//!
//! This is the crate's only source of page size, header-reserve size, and
//! epoch ring width — nothing here is duplicated by hand elsewhere.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
