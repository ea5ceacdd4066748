//! Data models shared by the transfer engine.
//!
//! Wire types deserialize with `serde` and tolerate unknown fields, so the
//! client keeps working when the server adds metadata.

pub mod multipart;
pub mod object;
pub mod options;

pub use multipart::{Part, UploadSession};
pub use object::{ObjectDescription, ObjectState, PartDescription, TransferObject};
pub use options::{PartLimits, UploadOptions, UploadOptionsBuilder};
