//! Band-ratio methane index and true-color composite kernels.

use crate::types::{BandImage, FinderError, FinderResult, RgbImage};
use ndarray::{Array2, Array3, Zip};
use num_traits::ToPrimitive;

/// Lower cumulative-fraction cut for contrast clipping
pub const LOW_PERCENTILE: f64 = 0.02;
/// Upper cumulative-fraction cut for contrast clipping
pub const HIGH_PERCENTILE: f64 = 0.98;

/// First-degree least-squares fit `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

/// Fit `y` against `x` over all pixel pairs.
///
/// A constant `x` has no defined slope; the fit degrades to the mean of `y`.
pub fn fit_linear(x: &Array2<f64>, y: &Array2<f64>) -> FinderResult<LinearFit> {
    check_shapes(x.dim(), y.dim())?;

    let n = x.len() as f64;
    let mean_x = x.sum() / n;
    let mean_y = y.sum() / n;

    let (sxx, sxy) = Zip::from(x)
        .and(y)
        .fold((0.0, 0.0), |(sxx, sxy), &xi, &yi| {
            let dx = xi - mean_x;
            (sxx + dx * dx, sxy + dx * (yi - mean_y))
        });

    if sxx == 0.0 {
        return Ok(LinearFit {
            slope: 0.0,
            intercept: mean_y,
        });
    }

    let slope = sxy / sxx;
    Ok(LinearFit {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}

/// Cumulative-distribution cut points of a non-negative grid.
///
/// Values are binned by integer truncation. `lo` is the first bin whose
/// cumulative fraction reaches `low`, `hi` the first bin whose cumulative
/// fraction exceeds `high`. Bins are read off the sorted truncated values,
/// so memory follows the pixel count, not the value range.
pub fn percentile_bounds(values: &Array2<f64>, low: f64, high: f64) -> (f64, f64) {
    let bins = sorted_bins(values);
    let total = values.len() as f64;

    // After the first k + 1 sorted values the cumulative fraction is (k + 1) / total
    let first_reaching = |reached: &dyn Fn(f64) -> bool| {
        (0..bins.len())
            .find(|&k| reached((k + 1) as f64 / total))
            .map(|k| bins[k])
    };

    let lo = first_reaching(&|fraction: f64| fraction >= low).unwrap_or(0.0);
    let hi = first_reaching(&|fraction: f64| fraction > high)
        .unwrap_or_else(|| bins.last().copied().unwrap_or(0.0));
    (lo, hi)
}

/// Regression-residual index of two co-registered bands.
///
/// `high` is predicted from `low` with a linear fit; the residual
/// `(slope * low + intercept) - high` is shifted to start at zero, clipped to
/// its 2nd..98th percentile and stretched to the full 16-bit range. A flat
/// residual yields an all-zero image.
pub fn band_ratio_index<T>(low: &Array2<T>, high: &Array2<T>) -> FinderResult<BandImage>
where
    T: ToPrimitive + Copy + Send + Sync,
{
    check_shapes(low.dim(), high.dim())?;
    log::info!("Computing band-ratio index for {}x{} grid", low.nrows(), low.ncols());

    let low = to_f64(low);
    let high = to_f64(high);
    let fit = fit_linear(&low, &high)?;
    log::debug!("Linear fit: slope={:.6}, intercept={:.6}", fit.slope, fit.intercept);

    let mut residual = residual(&low, &high, fit);
    let min = residual.iter().fold(f64::INFINITY, |acc, &v| acc.min(v));
    residual.mapv_inplace(|v| v - min);

    let (lo, hi) = percentile_bounds(&residual, LOW_PERCENTILE, HIGH_PERCENTILE);
    log::debug!("Clipping residual to [{}, {}]", lo, hi);
    residual.mapv_inplace(|v| v.max(lo).min(hi));

    let (r_min, r_max) = residual
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(mn, mx), &v| (mn.min(v), mx.max(v)));
    let span = r_max - r_min;

    if !(span > 0.0) {
        log::warn!("Band-ratio residual is flat, returning an all-zero index");
        return Ok(BandImage::zeros(residual.dim()));
    }

    Ok(residual.mapv(|v| ((v - r_min) / span * 65535.0) as u16))
}

/// Interleave three 16-bit bands into an 8-bit RGB image (`value / 256`)
pub fn rgb_composite(red: &BandImage, green: &BandImage, blue: &BandImage) -> FinderResult<RgbImage> {
    check_shapes(red.dim(), green.dim())?;
    check_shapes(red.dim(), blue.dim())?;

    let (rows, cols) = red.dim();
    let channels = [red, green, blue];
    Ok(Array3::from_shape_fn((rows, cols, 3), |(i, j, c)| {
        (channels[c][[i, j]] / 256) as u8
    }))
}

#[cfg(feature = "parallel")]
fn residual(low: &Array2<f64>, high: &Array2<f64>, fit: LinearFit) -> Array2<f64> {
    Zip::from(low)
        .and(high)
        .par_map_collect(|&l, &h| (fit.slope * l + fit.intercept) - h)
}

#[cfg(not(feature = "parallel"))]
fn residual(low: &Array2<f64>, high: &Array2<f64>, fit: LinearFit) -> Array2<f64> {
    Zip::from(low)
        .and(high)
        .map_collect(|&l, &h| (fit.slope * l + fit.intercept) - h)
}

/// Finite non-negative values truncated to integers, ascending
#[cfg(feature = "parallel")]
fn sorted_bins(values: &Array2<f64>) -> Vec<f64> {
    use rayon::prelude::*;

    let mut bins: Vec<f64> = values
        .par_iter()
        .filter(|v| v.is_finite() && **v >= 0.0)
        .map(|v| v.trunc())
        .collect();
    bins.par_sort_unstable_by(f64::total_cmp);
    bins
}

#[cfg(not(feature = "parallel"))]
fn sorted_bins(values: &Array2<f64>) -> Vec<f64> {
    let mut bins: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite() && **v >= 0.0)
        .map(|v| v.trunc())
        .collect();
    bins.sort_unstable_by(f64::total_cmp);
    bins
}

fn to_f64<T: ToPrimitive + Copy>(grid: &Array2<T>) -> Array2<f64> {
    grid.mapv(|v| v.to_f64().unwrap_or(0.0))
}

fn check_shapes(a: (usize, usize), b: (usize, usize)) -> FinderResult<()> {
    if a != b {
        return Err(FinderError::Processing(format!(
            "Band shapes differ: {}x{} vs {}x{}",
            a.0, a.1, b.0, b.1
        )));
    }
    if a.0 == 0 || a.1 == 0 {
        return Err(FinderError::Processing("Band grid is empty".to_string()));
    }
    Ok(())
}
