fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Client-facing raw key-value service
    tonic_prost_build::configure().compile_protos(&["proto/tinykvpb.proto"], &["proto"])?;

    // Peer-to-peer Raft transport
    tonic_prost_build::configure().compile_protos(&["proto/raft_serverpb.proto"], &["proto"])?;

    // Scheduler surface consumed by the replicated engine
    tonic_prost_build::configure().compile_protos(&["proto/schedulerpb.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto");
    Ok(())
}
