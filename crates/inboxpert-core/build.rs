/// Builds the gRPC client and server code for the categorization and
/// prediction protocols using `tonic-prost-build`.
///
/// Both services are compiled in one pass so that a single encoded file
/// descriptor set covers them. The set is written to `OUT_DIR` and exposed as
/// `proto::FILE_DESCRIPTOR_SET` for gRPC reflection.
///
/// # Files and Paths
///
/// - Proto files: `proto/categorization.proto`, `proto/prediction.proto`
/// - Includes: `proto/`
///
/// # Panics
///
/// Panics if code generation fails (for example when `protoc` is missing).
///
/// # Output
///
/// ```rust,ignore
/// pub mod categorization {
///     tonic::include_proto!("inboxpert.categorization.v1");
/// }
/// pub mod prediction {
///     tonic::include_proto!("inboxpert.prediction.v1");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("inboxpert_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(
            config,
            &["proto/categorization.proto", "proto/prediction.proto"],
            &["proto"],
        )
        .unwrap();
}
