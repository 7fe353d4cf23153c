fn main() {
    println!("cargo:rerun-if-changed=proto/packet.proto");
    prost_build::compile_protos(&["proto/packet.proto"], &["proto/"])
        .expect("failed to compile packet.proto");
}
