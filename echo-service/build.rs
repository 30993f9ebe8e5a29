use prost::Message;
use std::env::var;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    // List of proto files containing a message definition
    let proto_files = &[
        // Services
        "echo.proto",
    ];

    // Name of the folder containing the proto definitions
    let proto_folder = "proto";
    let out_dir = var("OUT_DIR")?;
    let descriptors_path = format!("{}/descriptors.bin", out_dir);

    println!("cargo:rerun-if-changed={}", proto_folder);

    // protox compiles in-process, so building this crate does not need `protoc`.
    let mut compiler = protox::Compiler::new([proto_folder])?;
    compiler.include_imports(true).open_files(proto_files)?;

    // The reflection server needs the well-known imports to answer dependency lookups.
    let descriptor_set = compiler.file_descriptor_set();
    std::fs::write(descriptors_path, descriptor_set.encode_to_vec())?;

    let mut codegen_set = descriptor_set;
    codegen_set
        .file
        .retain(|file| !file.name().starts_with("google/protobuf/"));

    tonic_prost_build::configure()
        .build_client(false)
        .compile_fds(codegen_set)?;

    Ok(())
}
