//! odrived: the Object Drive daemon
//!
//! Request flow for an upload:
//!
//! ```text
//! multipart ─► ObjectMetadata ─► ACM flatten + authorize
//!           └► file part ─► AES-256-CTR ─► <connector>.uploading
//!                                          └► .uploaded ─► metadata commit ─► drain queue
//! ```
//!
//! Downloads reverse it: metadata + read grant ─► unwrap key ─► ACM check ─►
//! local `.cached`/`.uploaded` (refilled from the blob store on a miss) ─►
//! decrypting body stream.

pub mod caller;
pub mod contenttype;
pub mod daemon;
pub mod download;
pub mod error;
pub mod lifecycle;
pub mod list;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod share;
pub mod transfer;
pub mod upload;
pub mod usercache;

pub use caller::{Caller, CallerContext};
pub use error::ApiError;
pub use server::{router, Action, AppServer};
