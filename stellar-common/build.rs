fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile proto files
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../proto/stellarstation.proto"], &["../proto"])?;

    println!("cargo:rerun-if-changed=../proto/stellarstation.proto");
    Ok(())
}
