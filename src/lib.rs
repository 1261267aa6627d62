//! methane-finder: Landsat retrieval, local band catalog and methane diagnostics
//!
//! Queries the USGS M2M archive for scenes covering a point, downloads and
//! extracts the band rasters into a `<tile>/<date>` tree, indexes that tree,
//! and derives a B6/B7 band-ratio index that highlights methane plumes.

pub mod types;
pub mod config;
pub mod report;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BandId, BandImage, RgbImage, DownloadUrl, ProductId, SceneRecord, DownloadDescriptor,
    LonLat, FinderError, FinderResult
};

pub use config::{FinderConfig, ClientConfig, DownloadConfig};
pub use report::{StatusReporter, StatusObserver};
pub use io::{RemoteCatalogClient, QueryFilter, QueryOutcome, Downloader, ArchiveExtractor, LocalCatalog, CatalogEntry, RasterSource};
