//! Build script for gateway-core.
//!
//! Compiles the ext-proc protobuf contract into Rust code.
#![allow(clippy::disallowed_methods)]
#![allow(clippy::disallowed_macros)]

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .file_descriptor_set_path(out_dir.join("ext_proc_descriptor.bin"))
        .compile_protos(&["proto/ext_proc.proto"], &["proto/"])?;

    println!("cargo:rerun-if-changed=proto/");

    Ok(())
}
