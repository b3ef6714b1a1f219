//! opless-blob — staging area between uploads and image builds.
//!
//! Uploads land in a TTL'd tmp bucket, lambda archives are extracted into a
//! per-function tree, and `tar_context` packs a tree plus its runtime
//! Dockerfile into the build context the container host consumes.

pub mod archive;
pub mod error;
pub mod store;

pub use archive::ArchiveFormat;
pub use error::{BlobError, BlobResult};
pub use store::{BlobConfig, BlobStore};
