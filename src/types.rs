use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 16-bit single-band raster (rows x cols)
pub type BandImage = Array2<u16>;

/// 8-bit interleaved RGB raster (rows x cols x 3)
pub type RgbImage = Array3<u8>;

/// Spectral band identifier (`B1` .. `B11` for Landsat 8/9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BandId(pub u8);

impl BandId {
    pub const B2: BandId = BandId(2);
    pub const B3: BandId = BandId(3);
    pub const B4: BandId = BandId(4);
    pub const B6: BandId = BandId(6);
    pub const B7: BandId = BandId(7);

    pub fn number(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for BandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl std::str::FromStr for BandId {
    type Err = FinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('B')
            .or_else(|| s.strip_prefix('b'))
            .and_then(|n| n.parse::<u8>().ok())
            .map(BandId)
            .ok_or_else(|| FinderError::Processing(format!("Invalid band identifier: {}", s)))
    }
}

/// Geographic point as (longitude, latitude) in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl LonLat {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// Scene returned by a scene search; lives only for the duration of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneRecord {
    pub entity_id: String,
    #[serde(default)]
    pub display_id: String,
    pub cloud_cover: f64,
}

/// (entity id, product id) pair submitted in a download request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadDescriptor {
    pub entity_id: String,
    pub product_id: String,
}

/// Landsat product identifier, e.g. `LC08_L2SP_163033_20181104_20200830_02_T1`
///
/// Underscore-separated; token 2 is the WRS path/row tile and token 3 the
/// acquisition date. Those two tokens name the directory the asset lands in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProductId(String);

impl ProductId {
    pub fn parse(id: &str) -> FinderResult<Self> {
        let tokens: Vec<&str> = id.split('_').collect();
        if tokens.len() < 4 || tokens[2].is_empty() || tokens[3].is_empty() {
            return Err(FinderError::InvalidUrl(format!(
                "product id '{}' does not carry tile and date tokens",
                id
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Location tile token (path/row)
    pub fn tile(&self) -> &str {
        self.0.split('_').nth(2).unwrap_or_default()
    }

    /// Compact acquisition date token (`YYYYMMDD`)
    pub fn acquisition_date(&self) -> &str {
        self.0.split('_').nth(3).unwrap_or_default()
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Download URL handed out by the remote service.
///
/// Opaque apart from its `product_id` query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadUrl(String);

impl DownloadUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract and validate the `product_id` query parameter
    pub fn product_id(&self) -> FinderResult<ProductId> {
        let parsed = reqwest::Url::parse(&self.0)
            .map_err(|e| FinderError::InvalidUrl(format!("{}: {}", self.0, e)))?;

        let id = parsed
            .query_pairs()
            .find(|(key, _)| key == "product_id")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| FinderError::InvalidUrl(format!("{}: missing product_id", self.0)))?;

        ProductId::parse(&id)
    }
}

impl std::fmt::Display for DownloadUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DownloadUrl {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

/// Error types for retrieval, cataloging and derivation
#[derive(Debug, thiserror::Error)]
pub enum FinderError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Not logged in to the remote catalog")]
    NotAuthenticated,

    #[error("Query step '{endpoint}' failed ({code}): {message}")]
    Query {
        endpoint: String,
        code: String,
        message: String,
    },

    #[error("Invalid download URL: {0}")]
    InvalidUrl(String),

    #[error("Archive error for {}: {reason}", .path.display())]
    Archive { path: PathBuf, reason: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not found in catalog: {0}")]
    NotFound(String),

    #[error("Band {band} missing for {tile}/{date}")]
    MissingBand {
        tile: String,
        date: String,
        band: BandId,
    },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for methane-finder operations
pub type FinderResult<T> = Result<T, FinderError>;
