//! Binary contracts for the pakrat runtime: the `PAKR` container archive and
//! the manifest tables the packaging pipeline hands to the loader. The runtime
//! crate consumes the read side; the write side exists for tools, tests, and
//! demos that need to produce packs.

mod error;
pub use error::PakratError;
pub use error::PakratResult;

mod reader;
pub use reader::ByteReader;

pub mod archive;
pub use archive::ArchiveWriter;
pub use archive::PakArchive;

pub mod manifest;
pub use manifest::ManifestWriter;
pub use manifest::PackManifest;
pub use manifest::ASSET_TABLE;
pub use manifest::BUNDLE_DEPENDENCY_TABLE;
pub use manifest::BUNDLE_TABLE;
pub use manifest::DEPENDENCY_TABLE;
pub use manifest::MANIFEST_BUNDLE;
