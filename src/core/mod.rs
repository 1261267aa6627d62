//! Derived raster products

pub mod band_ratio;

// Re-export main functions
pub use band_ratio::{band_ratio_index, rgb_composite, fit_linear, LinearFit};
