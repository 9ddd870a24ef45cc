fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use vendored protoc binary, no system installation required
    let protoc_path = protoc_bin_vendored::protoc_bin_path()
        .expect("protoc-bin-vendored: no binary for this platform");
    std::env::set_var("PROTOC", protoc_path);

    // Only clients are generated: the policy and audit services live elsewhere.
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(false)
        .compile_protos(&["src/proto/odrive.proto"], &["src/proto"])?;

    println!("cargo:rerun-if-changed=src/proto/odrive.proto");
    Ok(())
}
