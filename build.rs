use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Bytes reserved at the front of every slab page for the header (magic,
/// era, object size/count, free_count, list identity, generation,
/// next-link) plus the bitmap words. Kept in sync with
/// `Slab::HEADER_RESERVE` in `src/slab.rs` — both sides are physical
/// layout constants for the same page, not independently configurable.
const HEADER_RESERVE: usize = 128;

struct ClassDef {
    size: usize,
    cache_capacity: usize,
}

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    epoch_ring_width: Option<usize>,
    default_cache_capacity: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<usize>,
    #[serde(default, rename = "class")]
    class_full: Vec<ClassFull>,
}

#[derive(Deserialize)]
struct ClassFull {
    size: usize,
    cache_capacity: Option<usize>,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    epoch_ring_width: usize,
    default_cache_capacity: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(4096);
    assert!(
        page_size > 0 && page_size.is_power_of_two(),
        "page_size ({page_size}) must be a power of 2"
    );
    assert!(page_size >= 4096, "page_size ({page_size}) must be >= 4096");
    assert!(
        page_size > HEADER_RESERVE,
        "page_size ({page_size}) must exceed the header reserve ({HEADER_RESERVE})"
    );

    let epoch_ring_width = cfg.epoch_ring_width.unwrap_or(16);
    assert!(
        epoch_ring_width > 0 && epoch_ring_width.is_power_of_two(),
        "epoch_ring_width ({epoch_ring_width}) must be a power of 2"
    );

    let default_cache_capacity = cfg.default_cache_capacity.unwrap_or(64);
    assert!(
        default_cache_capacity > 0,
        "default_cache_capacity must be > 0"
    );

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        epoch_ring_width,
        default_cache_capacity,
    }
}

fn parse_classes(config: &Config, default_cache_capacity: usize) -> Vec<ClassDef> {
    if !config.classes.is_empty() && !config.class_full.is_empty() {
        panic!("SLAB_CLASSES: use either `classes = [...]` or `[[class]]`, not both");
    }

    let defs: Vec<ClassDef> = if !config.classes.is_empty() {
        config
            .classes
            .iter()
            .map(|&size| ClassDef {
                size,
                cache_capacity: default_cache_capacity,
            })
            .collect()
    } else if !config.class_full.is_empty() {
        config
            .class_full
            .iter()
            .map(|c| ClassDef {
                size: c.size,
                cache_capacity: c.cache_capacity.unwrap_or(default_cache_capacity),
            })
            .collect()
    } else {
        panic!("SLAB_CLASSES: config must contain `classes` or `[[class]]` entries");
    };

    validate_classes(&defs);
    defs
}

fn validate_classes(defs: &[ClassDef]) {
    assert!(!defs.is_empty(), "SLAB_CLASSES: no size classes defined");
    assert!(
        defs.len() < 64,
        "SLAB_CLASSES: too many classes ({}, max 63)",
        defs.len()
    );
    for (i, d) in defs.iter().enumerate() {
        assert!(d.size > 0, "class {i}: size must be > 0");
        assert!(d.size % 8 == 0, "class {i}: size {} must be 8-byte aligned", d.size);
        assert!(d.cache_capacity > 0, "class {i}: cache_capacity must be > 0");
        if i > 0 {
            assert!(
                d.size > defs[i - 1].size,
                "class {i}: size {} must be > previous size {}",
                d.size,
                defs[i - 1].size
            );
        }
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{manifest_dir}/slabcfg.toml")
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    // Worst case: every class is the minimum allowed 8-byte-aligned size
    // (8 bytes), so a slab could hold up to page_size / 8 objects. The
    // bitmap array in `Slab` is sized once, at compile time, for that
    // worst case so it can be a plain fixed-size field.
    let max_bitmap_words = (cfg.page_size / 8).div_ceil(32).max(1);

    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const HEADER_RESERVE: usize = {};\n\
         pub const MAX_BITMAP_WORDS: usize = {};\n\
         pub const EPOCH_RING_WIDTH: usize = {};\n\
         pub const DEFAULT_CACHE_CAPACITY: usize = {};\n",
        cfg.page_shift,
        cfg.page_size,
        HEADER_RESERVE,
        max_bitmap_words,
        cfg.epoch_ring_width,
        cfg.default_cache_capacity,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], page_size: usize, out_path: &Path) {
    let num_size_classes = defs.len() + 1;

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");
    code.push_str(&format!(
        "pub static SIZE_CLASSES: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ size: 0, objects_per_slab: 0, cache_capacity: 0 }}, // sentinel\n",
    ));
    for d in defs {
        let objects_per_slab = (page_size - HEADER_RESERVE) / d.size;
        assert!(
            objects_per_slab > 0,
            "class size {} leaves no room for objects in a {}-byte page",
            d.size,
            page_size
        );
        code.push_str(&format!(
            "    SizeClassInfo {{ size: {}, objects_per_slab: {}, cache_capacity: {} }},\n",
            d.size, objects_per_slab, d.cache_capacity
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=SLAB_CLASSES");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("SLAB_CLASSES").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={config_path}");
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {config_path}: {e}"));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    let defs = parse_classes(&config, resolved.default_cache_capacity);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&defs, resolved.page_size, &Path::new(&out_dir).join("size_class_gen.rs"));
}
