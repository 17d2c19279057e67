//! Object-Store Client (§4.B): a typed façade over S3-compatible multipart
//! upload.

pub mod s3;
pub mod traits;

pub use s3::{S3Endpoint, S3ObjectStore};
pub use traits::{ObjectStoreClient, PartReceipt, MAX_PART_NUMBER, MIN_PART_NUMBER};
