//! On-demand archive assembly for VaultDrop.
//!
//! Turns every object stored under one transfer into a single streamed zip
//! response, decrypting transparently through the storage gateway. The
//! container is store-only (no compression): entries are streamed straight
//! through, trading archive size for CPU and time-to-first-byte.
//!
//! Partial delivery is preferred over total failure: a file that cannot be
//! fetched, or that exceeds its per-file timeout, is skipped and recorded in
//! the [`ArchiveSummary`] instead of failing the whole archive.

pub mod assembly;
pub mod zip;

pub use assembly::{
    assemble, Archive, ArchiveConfig, ArchiveSummary, OmittedFile, TimeoutPolicy,
};
pub use zip::{estimate_archive_size, ZipWriter};
