use crate::types::{BandImage, FinderResult};
use std::path::Path;

/// Decodes a single-band raster file into a pixel grid.
///
/// GeoTIFF decoding and georeferencing live outside this crate; callers
/// plug their decoder in through this trait.
pub trait RasterSource {
    fn read_band(&self, path: &Path) -> FinderResult<BandImage>;
}

impl<F> RasterSource for F
where
    F: Fn(&Path) -> FinderResult<BandImage>,
{
    fn read_band(&self, path: &Path) -> FinderResult<BandImage> {
        self(path)
    }
}
