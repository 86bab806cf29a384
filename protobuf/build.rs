fn main() {
    println!("cargo:rerun-if-changed=./jobforge.proto");
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }
    tonic_build::compile_protos("./jobforge.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
