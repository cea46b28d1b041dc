//! Registry client and `docker load` archive builder.
//!
//! The pieces are used in this order: resolve an [`ImageReference`] to a
//! [`SingleManifest`] through the [`RegistryClient`], download the config and
//! the layer blobs, then hand both to an [`ArchiveBuilder`].

pub mod archive;
pub mod error;
pub mod layer;
pub mod manifest;
pub mod normalize;
pub mod reference;
pub mod registry;

pub use archive::{ArchiveBuilder, ArchiveManifestEntry, BuildReport};
pub use error::{OciError, Result};
pub use layer::{BuiltLayer, LayerBlob, LayerVerification};
pub use manifest::{ManifestEnvelope, Platform, PlatformMatch, SingleManifest};
pub use reference::{Architecture, ImageReference};
pub use registry::{DownloadedBlob, RegistryClient, RegistryConfig};
