//! Local catalog of extracted Landsat bands.
//!
//! Layout grammar under the root directory:
//!
//! ```text
//! <root>/<tile>/<YYYYMMDD>/<name>_B<n>.TIF
//! ```
//!
//! A date directory becomes a [`CatalogEntry`] only when it holds at least
//! [`MIN_BANDS`] distinct bands. The in-memory index is always rebuilt from
//! scratch; nothing but the directory tree is persisted.

use crate::core::band_ratio;
use crate::io::raster::RasterSource;
use crate::report::StatusReporter;
use crate::types::{BandId, BandImage, FinderError, FinderResult, RgbImage};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Fewest distinct bands a date directory needs to be cataloged
pub const MIN_BANDS: usize = 6;

/// Directory enumeration used by the catalog parser
pub trait DirectoryListing {
    /// Names of the immediate subdirectories of `dir`
    fn subdirectories(&self, dir: &Path) -> std::io::Result<Vec<String>>;

    /// Names of the regular files directly inside `dir`
    fn files(&self, dir: &Path) -> std::io::Result<Vec<String>>;

    /// Make sure `dir` exists before it is scanned
    fn ensure_dir(&self, _dir: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

/// [`DirectoryListing`] backed by the real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsListing;

impl FsListing {
    fn names(dir: &Path, want_dirs: bool) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let keep = if want_dirs {
                file_type.is_dir()
            } else {
                file_type.is_file()
            };
            if keep {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl DirectoryListing for FsListing {
    fn subdirectories(&self, dir: &Path) -> std::io::Result<Vec<String>> {
        Self::names(dir, true)
    }

    fn files(&self, dir: &Path) -> std::io::Result<Vec<String>> {
        Self::names(dir, false)
    }

    fn ensure_dir(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)
    }
}

fn band_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_B(\d+)\.(?i:tif)$").expect("valid band file pattern"))
}

/// Band carried by a file name such as `LC08_..._SR_B4.TIF`
pub fn parse_band_file(name: &str) -> Option<BandId> {
    band_file_regex()
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|digits| digits.as_str().parse::<u8>().ok())
        .map(BandId)
}

/// `YYYYMMDD` → `YYYY/MM/DD`; `None` unless the token is a real calendar date
pub fn format_date_token(token: &str) -> Option<String> {
    if token.len() != 8 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(token, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y/%m/%d").to_string())
}

#[derive(Debug, Clone, Default)]
struct DerivedCache {
    band_ratio: OnceLock<BandImage>,
    rgb: OnceLock<RgbImage>,
}

/// Bands of one tile on one acquisition date, plus lazily derived products
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    tile: String,
    date_token: String,
    date: String,
    bands: BTreeMap<BandId, PathBuf>,
    derived: DerivedCache,
}

// Equality is structural; derived products are a cache.
impl PartialEq for CatalogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.tile == other.tile
            && self.date_token == other.date_token
            && self.date == other.date
            && self.bands == other.bands
    }
}

impl Eq for CatalogEntry {}

impl CatalogEntry {
    pub fn tile(&self) -> &str {
        &self.tile
    }

    /// Compact date token, also the directory name
    pub fn date_token(&self) -> &str {
        &self.date_token
    }

    /// Human-readable acquisition date (`YYYY/MM/DD`)
    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn bands(&self) -> &BTreeMap<BandId, PathBuf> {
        &self.bands
    }

    pub fn band_path(&self, band: BandId) -> FinderResult<&Path> {
        self.bands
            .get(&band)
            .map(PathBuf::as_path)
            .ok_or_else(|| FinderError::MissingBand {
                tile: self.tile.clone(),
                date: self.date_token.clone(),
                band,
            })
    }

    /// B6/B7 band-ratio index, computed on first use and cached
    pub fn band_ratio_index(&self, source: &dyn RasterSource) -> FinderResult<&BandImage> {
        if let Some(index) = self.derived.band_ratio.get() {
            return Ok(index);
        }

        let low = source.read_band(self.band_path(BandId::B6)?)?;
        let high = source.read_band(self.band_path(BandId::B7)?)?;
        let index = band_ratio::band_ratio_index(&low, &high)?;
        Ok(self.derived.band_ratio.get_or_init(|| index))
    }

    /// B4/B3/B2 true-color composite, computed on first use and cached
    pub fn rgb_composite(&self, source: &dyn RasterSource) -> FinderResult<&RgbImage> {
        if let Some(rgb) = self.derived.rgb.get() {
            return Ok(rgb);
        }

        let red = source.read_band(self.band_path(BandId::B4)?)?;
        let green = source.read_band(self.band_path(BandId::B3)?)?;
        let blue = source.read_band(self.band_path(BandId::B2)?)?;
        let rgb = band_ratio::rgb_composite(&red, &green, &blue)?;
        Ok(self.derived.rgb.get_or_init(|| rgb))
    }

    pub fn cached_band_ratio_index(&self) -> Option<&BandImage> {
        self.derived.band_ratio.get()
    }

    pub fn cached_rgb_composite(&self) -> Option<&RgbImage> {
        self.derived.rgb.get()
    }
}

/// tile → date token → entry
pub type CatalogIndex = BTreeMap<String, BTreeMap<String, CatalogEntry>>;

/// In-memory index rebuilt from the directory tree under `root`.
///
/// Not safe to read while [`LocalCatalog::parse`] runs; `&mut self` on the
/// rebuild enforces that.
pub struct LocalCatalog<L: DirectoryListing = FsListing> {
    root: PathBuf,
    listing: L,
    index: CatalogIndex,
    reporter: StatusReporter,
}

impl LocalCatalog<FsListing> {
    /// Open (creating if needed) and scan the catalog rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> FinderResult<Self> {
        Self::with_listing(root, FsListing)
    }
}

impl<L: DirectoryListing> LocalCatalog<L> {
    pub fn with_listing<P: AsRef<Path>>(root: P, listing: L) -> FinderResult<Self> {
        let mut catalog = Self {
            root: root.as_ref().to_path_buf(),
            listing,
            index: CatalogIndex::new(),
            reporter: StatusReporter::new(),
        };
        catalog.listing.ensure_dir(&catalog.root)?;
        catalog.parse()?;
        Ok(catalog)
    }

    pub fn set_reporter(&mut self, reporter: StatusReporter) {
        self.reporter = reporter;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Point the catalog at another root and rebuild synchronously
    pub fn set_root<P: AsRef<Path>>(&mut self, root: P) -> FinderResult<()> {
        self.root = root.as_ref().to_path_buf();
        self.listing.ensure_dir(&self.root)?;
        self.parse()
    }

    /// Full rebuild: clear and rescan two directory levels under the root.
    ///
    /// Entries are replaced wholesale, so derived products cached on the
    /// previous entries are dropped.
    pub fn parse(&mut self) -> FinderResult<()> {
        self.reporter
            .info(&format!("parsing folder: {}", self.root.display()));
        self.index.clear();

        for tile in self.listing.subdirectories(&self.root)? {
            self.reporter.debug(&format!(" path/row: {}", tile));
            let tile_dir = self.root.join(&tile);
            let dates = match self.listing.subdirectories(&tile_dir) {
                Ok(dates) => dates,
                Err(e) => {
                    self.reporter
                        .warn(&format!("cannot list {}: {}", tile_dir.display(), e));
                    continue;
                }
            };

            let mut entries = BTreeMap::new();
            for date_token in dates {
                if let Some(entry) = self.scan_date(&tile, &tile_dir, &date_token) {
                    entries.insert(date_token, entry);
                }
            }
            self.index.insert(tile, entries);
        }

        let total: usize = self.index.values().map(BTreeMap::len).sum();
        self.reporter.info(&format!(
            "catalog holds {} tile(s), {} acquisition(s)",
            self.index.len(),
            total
        ));
        Ok(())
    }

    fn scan_date(&self, tile: &str, tile_dir: &Path, date_token: &str) -> Option<CatalogEntry> {
        self.reporter.debug(&format!("  date: {}", date_token));

        let date = match format_date_token(date_token) {
            Some(date) => date,
            None => {
                self.reporter
                    .warn(&format!("skipping {}/{}: not a YYYYMMDD date", tile, date_token));
                return None;
            }
        };

        let date_dir = tile_dir.join(date_token);
        let files = match self.listing.files(&date_dir) {
            Ok(files) => files,
            Err(e) => {
                self.reporter
                    .warn(&format!("cannot list {}: {}", date_dir.display(), e));
                return None;
            }
        };

        let bands: BTreeMap<BandId, PathBuf> = files
            .iter()
            .filter_map(|name| parse_band_file(name).map(|band| (band, date_dir.join(name))))
            .collect();

        if bands.len() < MIN_BANDS {
            self.reporter.debug(&format!(
                "  excluding {}/{}: {} of {} bands",
                tile,
                date_token,
                bands.len(),
                MIN_BANDS
            ));
            return None;
        }

        Some(CatalogEntry {
            tile: tile.to_string(),
            date_token: date_token.to_string(),
            date,
            bands,
            derived: DerivedCache::default(),
        })
    }

    /// Band map for (tile, date token)
    pub fn lookup(&self, tile: &str, date: &str) -> FinderResult<&BTreeMap<BandId, PathBuf>> {
        self.entry(tile, date).map(CatalogEntry::bands)
    }

    pub fn entry(&self, tile: &str, date: &str) -> FinderResult<&CatalogEntry> {
        self.index
            .get(tile)
            .and_then(|dates| dates.get(date))
            .ok_or_else(|| FinderError::NotFound(format!("{}/{}", tile, date)))
    }

    pub fn index(&self) -> &CatalogIndex {
        &self.index
    }

    pub fn tiles(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn dates(&self, tile: &str) -> FinderResult<impl Iterator<Item = &str>> {
        self.index
            .get(tile)
            .map(|dates| dates.keys().map(String::as_str))
            .ok_or_else(|| FinderError::NotFound(tile.to_string()))
    }

    /// Number of cataloged (tile, date) entries
    pub fn len(&self) -> usize {
        self.index.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
