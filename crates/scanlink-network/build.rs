//! Generates the C header for the `ffi` feature with cbindgen

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/ffi.rs");

    if env::var("CARGO_FEATURE_FFI").is_err() {
        return;
    }

    let crate_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Warning: CARGO_MANIFEST_DIR unavailable: {e}");
            return;
        }
    };
    let out_dir = PathBuf::from(&crate_dir).join("include");
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        eprintln!("Warning: unable to create {}: {e}", out_dir.display());
        return;
    }
    let output_file = out_dir.join("scanlink_network.h");

    let result = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_header(
            r#"/*
 * scanlink-network C API
 *
 * Embeds the reconnecting mesh streaming client in a native scanning app.
 * Every call is safe from any thread; sends are dropped while disconnected.
 */"#,
        )
        .with_include_guard("SCANLINK_NETWORK_H")
        .with_cpp_compat(true)
        .with_documentation(true)
        .with_parse_deps(false)
        .generate();

    match result {
        Ok(bindings) => {
            bindings.write_to_file(&output_file);
            println!("Generated C header at: {}", output_file.display());
        }
        Err(e) => eprintln!("Warning: unable to generate C bindings: {e}"),
    }
}
