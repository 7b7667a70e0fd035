use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
  // protoc is not assumed to be installed on build hosts; use the vendored
  // binary and its well-known-types include directory.
  let protoc = protoc_bin_vendored::protoc_bin_path()?;
  let includes = protoc_bin_vendored::include_path()?;
  std::env::set_var("PROTOC", protoc);

  tonic_build::configure()
    .build_client(true)
    .build_server(true)
    .compile_protos(
      &[PathBuf::from("proto/csi.proto")],
      &[PathBuf::from("proto"), includes],
    )?;

  println!("cargo:rerun-if-changed=proto/csi.proto");
  Ok(())
}
