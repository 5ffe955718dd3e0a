// src/packages/mod.rs

//! Package artifacts and the catalogs they are fetched from
//!
//! An artifact is the published form of a package: metadata (name, type,
//! version, dependencies, platform constraint) plus the payload objects the
//! package establishes once installed. Catalogs implement `ArtifactFetcher`.

pub mod directory;
pub mod image_config;
pub mod memory;
pub mod traits;

pub use directory::DirectoryFetcher;
pub use image_config::{
    FetchedPackage, ResolvedSource, fetch_package, fetch_resolved, resolve_source,
    resolved_versions,
};
pub use memory::{ArtifactBuilder, MemoryFetcher};
pub use traits::{ArtifactFetcher, ArtifactMeta, PackageArtifact, PayloadObject};
