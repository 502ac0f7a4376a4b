fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let builder = tonic_build::configure()
        .build_client(true)
        .build_server(true);

    // Kubelet plugin registration, DRA node plugin and the container runtime
    // lifecycle event contract. Clients are generated as well so tests can
    // drive the served sockets.
    builder.compile_protos(
        &[
            "proto/pluginregistration/v1/pluginregistration.proto",
            "proto/draplugin/v1beta1/draplugin.proto",
            "proto/runtime/v1/runtime.proto",
        ],
        &[
            "proto/pluginregistration/v1",
            "proto/draplugin/v1beta1",
            "proto/runtime/v1",
        ],
    )?;

    Ok(())
}
