//! Generated gRPC code for the silo protobuf definitions.

/// v1 flat lookup API (GetValues).
pub mod v1 {
    tonic::include_proto!("silo.v1");
}

/// v2 partitioned lookup API (GetValues, GetValuesHttp, BinaryHttpGetValues,
/// ObliviousGetValues).
pub mod v2 {
    tonic::include_proto!("silo.v2");
}

/// Internal shard-to-shard lookup plane.
pub mod lookup {
    tonic::include_proto!("silo.internal_lookup");
}

/// Host-hook binary response message.
pub mod hooks {
    tonic::include_proto!("silo.hooks");
}
