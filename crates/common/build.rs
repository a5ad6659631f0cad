// build.rs - compiles the Cosmos control-plane protocol definitions.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile(&["../../proto/cosmos.proto"], &["../../proto"])?;

    println!("cargo:rerun-if-changed=../../proto/cosmos.proto");
    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
