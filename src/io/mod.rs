//! I/O modules: remote catalog protocol, downloads, archives and the local catalog

pub mod m2m;
pub mod download;
pub mod archive;
pub mod catalog;
pub mod raster;

pub use m2m::{RemoteCatalogClient, QueryFilter, QueryOutcome, Session, Transport, HttpTransport, ApiEnvelope};
pub use download::{Downloader, DownloadOutcome, DownloadReport, CancelToken};
pub use archive::{ArchiveExtractor, ArchiveKind, ExtractionOutcome};
pub use catalog::{LocalCatalog, CatalogEntry, DirectoryListing, FsListing};
pub use raster::RasterSource;
