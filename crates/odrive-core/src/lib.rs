pub mod config;
pub mod error;
pub mod flatten;
pub mod types;

pub use error::{ErrorKind, OdriveError, OdriveResult};
pub use flatten::flatten;

/// Generated gRPC types and clients (from odrive.proto)
pub mod proto {
    tonic::include_proto!("odrive");
}
