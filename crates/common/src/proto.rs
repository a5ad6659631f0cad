//! Generated protobuf/tonic types for the control-plane protocol (§6).
tonic::include_proto!("cosmos");
