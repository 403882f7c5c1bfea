// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

fn main() {
    #[cfg(feature = "cbindgen")]
    generate_and_configure_header("stack_sampler.h");
}

/// Writes the header to `<target>/include/datadog/`, configured by the
/// crate's `cbindgen.toml`. The target directory is `CARGO_TARGET_DIR`, or
/// `target` at the workspace root.
#[cfg(feature = "cbindgen")]
fn generate_and_configure_header(header_name: &str) {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    let crate_dir = PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let cargo_target_dir = match env::var_os("CARGO_TARGET_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => crate_dir
            .parent()
            .expect("Failed to find workspace root directory")
            .join("target"),
    };
    println!("cargo:rerun-if-env-changed=CARGO_TARGET_DIR");

    let output_path = cargo_target_dir.join("include/datadog").join(header_name);
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).expect("Failed to create output directory");
    }

    cbindgen::Builder::new()
        .with_crate(crate_dir.clone())
        .with_config(cbindgen::Config::from_root_or_default(&crate_dir))
        .generate()
        .expect("Unable to generate bindings")
        .write_to_file(output_path);

    println!("cargo:rerun-if-changed=cbindgen.toml");
}
