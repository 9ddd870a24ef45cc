//! odrive-storage: OpenDAL storage abstraction behind the BlobStore seam

pub mod blob;
pub mod health;
pub mod operator;

pub use blob::{open_blob_store, BlobError, BlobStore, NullBlobStore, OpendalBlobStore};
pub use health::check_health;
pub use operator::{build_operator, S3Config};
