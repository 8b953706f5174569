use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = PathBuf::from("proto");
    let proto = proto_dir.join("bootcode.proto");

    if !proto.exists() {
        panic!("Proto file not found: {}", proto.display());
    }

    // Use the vendored protoc unless the environment already provides one
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()
            .map_err(|e| format!("vendored protoc unavailable: {:?}", e))?;
        std::env::set_var("PROTOC", protoc);
    }

    // Descriptor set feeds the reflection service
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("bootcode_descriptor.bin"))
        .compile_protos(&[&proto], &[&proto_dir])?;

    println!("cargo:rerun-if-changed={}", proto.display());
    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
