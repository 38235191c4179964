fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let proto_file = "proto/chat.proto";
    let proto_dir = "proto";

    println!("cargo:rerun-if-changed={proto_file}");

    if !std::path::Path::new(proto_file).exists() {
        return Err(format!(
            "proto file not found at '{proto_file}' (cwd: {:?})",
            std::env::current_dir().unwrap_or_default(),
        )
        .into());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_file], &[proto_dir])?;

    Ok(())
}
