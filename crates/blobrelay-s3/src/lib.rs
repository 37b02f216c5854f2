//! S3 adapters for the blobrelay replication engine.
//!
//! [`S3Source`] reads objects with ranged `GetObject` calls. [`S3Destination`]
//! stages temporary objects as multipart uploads and promotes them by
//! streaming the completed temp into a conditional `PutObject`.

pub mod client;
pub mod destination;
pub mod error;
pub mod source;

pub use client::{S3ClientOptions, build_client};
pub use destination::{MIN_PART_SIZE, S3Destination};
pub use source::S3Source;
