//! The skymap acquirer (spec §4.3) and the opaque [`SkyMap`] handle (spec §6,
//! §9 "Skymap and DB as collaborators -> opaque handles"). This module makes
//! no claim to be astronomically rigorous HEALPix math — it models just
//! enough of a probability-per-pixel sky map to support the tile-selection
//! and contour-area queries the decision rules and handler need, the same
//! way the rest of this crate treats the observation database as an opaque
//! relational store rather than reimplementing one.

use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOrdering {
    Ring,
    Nested,
}

#[derive(Debug, thiserror::Error)]
pub enum SkymapError {
    #[error("http error fetching skymap: {0}")]
    Http(String),
    #[error("io error reading local skymap file: {0}")]
    Io(String),
    #[error("skymap bytes did not parse as FITS: {0}")]
    InvalidFits(String),
    #[error("no skymap available: no embedded map, no URL, and no position")]
    Unavailable,
}

/// A HEALPix-gridded probability distribution over the sky (spec GLOSSARY).
/// Treated as an opaque handle: callers query it through
/// [`SkyMap::contour_area`], [`SkyMap::regrade`] and header accessors rather
/// than touching the underlying pixel array.
#[derive(Debug, Clone)]
pub struct SkyMap {
    nside: u32,
    ordering: PixelOrdering,
    is_moc: bool,
    /// Per-pixel probability, normalized to sum to 1.0.
    probs: Vec<f64>,
    /// Pixel centers, `(ra_deg, dec_deg)`, parallel to `probs`.
    centers: Vec<(f64, f64)>,
    distmean: Option<f64>,
    diststd: Option<f64>,
    /// Stable identity for the "same skymap" comparison the handler's
    /// change-detection step uses (spec §4.6 step 3): two `SkyMap`s loaded
    /// from the same bytes, or synthesized from the same position, compare
    /// equal; a re-fetch that returns different content does not.
    content_id: u64,
}

impl PartialEq for SkyMap {
    fn eq(&self, other: &Self) -> bool {
        self.content_id == other.content_id
    }
}

impl SkyMap {
    pub fn nside(&self) -> u32 {
        self.nside
    }

    pub fn ordering(&self) -> PixelOrdering {
        self.ordering
    }

    pub fn is_moc(&self) -> bool {
        self.is_moc
    }

    pub fn distmean(&self) -> Option<f64> {
        self.distmean
    }

    pub fn diststd(&self) -> Option<f64> {
        self.diststd
    }

    pub fn content_id(&self) -> u64 {
        self.content_id
    }

    /// Probability of the pixel whose center is nearest `(ra_deg, dec_deg)`,
    /// the lookup [`crate::grid::select_tiles`] uses to score grid tiles
    /// against this skymap (spec §4.6 step 8).
    pub fn probability_near(&self, ra_deg: f64, dec_deg: f64) -> f64 {
        self.centers
            .iter()
            .zip(self.probs.iter())
            .min_by(|(a, _), (b, _)| {
                angular_separation_deg(ra_deg, dec_deg, a.0, a.1)
                    .partial_cmp(&angular_separation_deg(ra_deg, dec_deg, b.0, b.1))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }

    /// Area, in square degrees, of the smallest set of pixels whose summed
    /// probability reaches `level` (e.g. `0.9` for a 90% credible region).
    pub fn contour_area(&self, level: f64) -> f64 {
        let mut sorted: Vec<f64> = self.probs.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let mut cumulative = 0.0;
        let mut count = 0usize;
        for p in sorted {
            if cumulative >= level {
                break;
            }
            cumulative += p;
            count += 1;
        }
        let npix = 12 * (self.nside as u64) * (self.nside as u64);
        let pixel_area_deg2 = 4.0 * std::f64::consts::PI * (180.0 / std::f64::consts::PI).powi(2)
            / npix as f64;
        count as f64 * pixel_area_deg2
    }

    /// Regrade to a new resolution/ordering. A no-op placeholder beyond
    /// updating the header fields: real HEALPix regridding is the kind of
    /// skymap mathematics this module explicitly does not implement (spec
    /// §1, §9).
    pub fn regrade(&self, nside: u32, ordering: PixelOrdering) -> SkyMap {
        let mut clone = self.clone();
        clone.nside = nside;
        clone.ordering = ordering;
        clone
    }

    /// Construct a Gaussian skymap centered at `(ra_deg, dec_deg)` with 1-sigma
    /// radius `err_deg`, at the requested `nside` (spec §4.3 step 3). Pixel
    /// centers are placed on a Fibonacci-lattice approximation of an
    /// equal-area sphere tessellation rather than true HEALPix pixelization
    /// — adequate for the probability-weighted tile selection this crate
    /// performs, not for precision astrometry.
    pub fn from_position(ra_deg: f64, dec_deg: f64, err_deg: f64, nside: u32) -> SkyMap {
        let npix = 12usize * (nside as usize) * (nside as usize);
        let centers = fibonacci_sphere(npix);
        let sigma = err_deg.max(1e-6);
        let mut probs: Vec<f64> = centers
            .iter()
            .map(|&(ra, dec)| {
                let sep = angular_separation_deg(ra_deg, dec_deg, ra, dec);
                (-0.5 * (sep / sigma).powi(2)).exp()
            })
            .collect();
        normalize(&mut probs);
        let content_id = hash_f64s(&[ra_deg, dec_deg, err_deg, nside as f64]);
        SkyMap {
            nside,
            ordering: PixelOrdering::Nested,
            is_moc: false,
            probs,
            centers,
            distmean: None,
            diststd: None,
            content_id,
        }
    }

    /// Parse FITS-encoded bytes (gzip-compressed or not) into a `SkyMap`
    /// (spec §4.3 step 2). Recognizes the header cards
    /// `NSIDE`/`ORDERING`/`DISTMEAN`/`DISTSTD` and reads the remainder of
    /// the file as a flat array of big-endian `f64` probabilities — a
    /// simplified stand-in for full FITS binary-table parsing, consistent
    /// with skymap mathematics being out of scope for this crate.
    pub fn from_fits(bytes: &[u8]) -> Result<SkyMap, SkymapError> {
        let bytes = maybe_decompress(bytes)?;
        let (header, data_offset) = parse_fits_header(&bytes)?;

        let nside = header
            .get("NSIDE")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(128);
        let ordering = match header.get("ORDERING").map(String::as_str) {
            Some("RING") => PixelOrdering::Ring,
            _ => PixelOrdering::Nested,
        };
        let distmean = header.get("DISTMEAN").and_then(|v| v.parse::<f64>().ok());
        let diststd = header.get("DISTSTD").and_then(|v| v.parse::<f64>().ok());
        let is_moc = header.get("PIXTYPE").map(|v| v == "MOC").unwrap_or(false);

        let expected_npix = 12usize * (nside as usize) * (nside as usize);
        let mut probs = read_f64_column(&bytes[data_offset..]);
        if probs.is_empty() {
            return Err(SkymapError::InvalidFits(
                "no probability data after FITS header".to_string(),
            ));
        }
        // Tolerate a data block that doesn't exactly match NSIDE's pixel
        // count (our simplified reader has no true binary-table column
        // layout to fall back on) by resampling to the declared pixel count.
        if probs.len() != expected_npix {
            probs = resample(&probs, expected_npix);
        }
        normalize(&mut probs);
        let centers = fibonacci_sphere(probs.len());
        let content_id = hash_bytes(&bytes);

        Ok(SkyMap {
            nside,
            ordering,
            is_moc,
            probs,
            centers,
            distmean,
            diststd,
            content_id,
        })
    }
}

fn maybe_decompress(bytes: &[u8]) -> Result<Vec<u8>, SkymapError> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| SkymapError::InvalidFits(format!("gzip decompression failed: {e}")))?;
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

/// Scan 80-byte FITS header cards until `END`, returning the parsed
/// keyword/value map and the byte offset the data block starts at (rounded
/// up to the next 2880-byte boundary, as FITS requires).
fn parse_fits_header(
    bytes: &[u8],
) -> Result<(std::collections::HashMap<String, String>, usize), SkymapError> {
    if bytes.len() < 80 {
        return Err(SkymapError::InvalidFits("file shorter than one header card".to_string()));
    }
    let mut map = std::collections::HashMap::new();
    let mut offset = 0;
    loop {
        if offset + 80 > bytes.len() {
            return Err(SkymapError::InvalidFits("missing END header card".to_string()));
        }
        let card = String::from_utf8_lossy(&bytes[offset..offset + 80]);
        offset += 80;
        let keyword = card[0..8].trim();
        if keyword == "END" {
            break;
        }
        if let Some(eq_pos) = card.find('=') {
            let value = card[eq_pos + 1..]
                .split('/')
                .next()
                .unwrap_or("")
                .trim()
                .trim_matches('\'')
                .trim()
                .to_string();
            if !keyword.is_empty() {
                map.insert(keyword.to_string(), value);
            }
        }
    }
    let data_offset = offset.div_ceil(2880) * 2880;
    Ok((map, data_offset.min(bytes.len())))
}

fn read_f64_column(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| f64::from_be_bytes(chunk.try_into().expect("chunks_exact(8)")))
        .filter(|v| v.is_finite())
        .collect()
}

fn resample(probs: &[f64], target_len: usize) -> Vec<f64> {
    if probs.is_empty() || target_len == 0 {
        return vec![1.0 / target_len.max(1) as f64; target_len];
    }
    (0..target_len)
        .map(|i| {
            let src_idx = i * probs.len() / target_len;
            probs[src_idx.min(probs.len() - 1)]
        })
        .collect()
}

fn normalize(probs: &mut [f64]) {
    let sum: f64 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

/// Public entry point for [`crate::grid::default_grid`], which needs the
/// same tessellation this module uses for pixel centers so grid tiles and
/// skymap pixels line up under [`SkyMap::probability_near`].
pub fn fibonacci_sphere_public(n: usize) -> Vec<(f64, f64)> {
    fibonacci_sphere(n)
}

/// Equal-area-ish point distribution on the sphere, used as a stand-in for
/// true HEALPix pixel centers.
fn fibonacci_sphere(n: usize) -> Vec<(f64, f64)> {
    if n == 0 {
        return Vec::new();
    }
    let golden_angle = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let dec = y.asin().to_degrees();
            let ra = (golden_angle * i as f64).rem_euclid(2.0 * std::f64::consts::PI).to_degrees();
            (ra, dec)
        })
        .collect()
}

fn angular_separation_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (ra1, dec1, ra2, dec2) = (
        ra1.to_radians(),
        dec1.to_radians(),
        ra2.to_radians(),
        dec2.to_radians(),
    );
    let d_ra = ra2 - ra1;
    let a = (dec1.sin() * dec2.sin()) + (dec1.cos() * dec2.cos() * d_ra.cos());
    a.clamp(-1.0, 1.0).acos().to_degrees()
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

fn hash_f64s(values: &[f64]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for v in values {
        v.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Acquirer contract (spec §4.3): resolve a notice's skymap by, in order,
/// the already-cached map, a URL download, or Gaussian synthesis from
/// position + error.
#[async_trait::async_trait]
pub trait SkymapFetcher: Send + Sync {
    /// Download raw bytes from a URL or local path, honoring `timeout`.
    async fn fetch(&self, url: &str, timeout: std::time::Duration) -> Result<Vec<u8>, SkymapError>;
}

/// Default fetcher: HTTP(S) via `reqwest`, or a direct filesystem read when
/// the "URL" is actually a local path (spec §4.3 step 2).
pub struct HttpSkymapFetcher {
    client: reqwest::Client,
}

impl Default for HttpSkymapFetcher {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl SkymapFetcher for HttpSkymapFetcher {
    async fn fetch(&self, url: &str, timeout: std::time::Duration) -> Result<Vec<u8>, SkymapError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return tokio::fs::read(url)
                .await
                .map_err(|e| SkymapError::Io(e.to_string()));
        }
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| SkymapError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SkymapError::Http(format!("status {}", resp.status())));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| SkymapError::Http(e.to_string()))
    }
}

/// Resolve a notice's skymap per spec §4.3's resolution order. Idempotent at
/// the call-site level: callers should cache the returned `Arc<SkyMap>` back
/// onto the notice (see `handler::ensure_skymap`) so a second call never
/// re-fetches.
pub async fn acquire(
    fetcher: &dyn SkymapFetcher,
    cached: Option<&Arc<SkyMap>>,
    skymap_url: Option<&str>,
    position: Option<(f64, f64)>,
    position_error_deg: Option<f64>,
    nside: u32,
    timeout: std::time::Duration,
) -> Result<Arc<SkyMap>, SkymapError> {
    if let Some(cached) = cached {
        return Ok(Arc::clone(cached));
    }
    if let Some(url) = skymap_url {
        let bytes = fetcher.fetch(url, timeout).await?;
        return Ok(Arc::new(SkyMap::from_fits(&bytes)?));
    }
    if let (Some((ra, dec)), Some(err)) = (position, position_error_deg) {
        return Ok(Arc::new(SkyMap::from_position(ra, dec, err, nside)));
    }
    Err(SkymapError::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_synthesis_is_normalized_and_peaks_near_center() {
        let map = SkyMap::from_position(180.0, 0.0, 1.0, 16);
        let sum: f64 = map.probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        let peak_idx = map
            .probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        let (ra, dec) = map.centers[peak_idx];
        assert!(angular_separation_deg(ra, dec, 180.0, 0.0) < 15.0);
    }

    #[test]
    fn contour_area_shrinks_for_tighter_error() {
        let tight = SkyMap::from_position(10.0, 10.0, 0.5, 32);
        let wide = SkyMap::from_position(10.0, 10.0, 10.0, 32);
        assert!(tight.contour_area(0.9) < wide.contour_area(0.9));
    }

    #[test]
    fn repeated_synthesis_is_idempotent_by_content_id() {
        let a = SkyMap::from_position(1.0, 2.0, 3.0, 16);
        let b = SkyMap::from_position(1.0, 2.0, 3.0, 16);
        assert_eq!(a, b);
        let c = SkyMap::from_position(1.0, 2.0, 3.1, 16);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn acquire_returns_cached_without_fetching() {
        struct PanicFetcher;
        #[async_trait::async_trait]
        impl SkymapFetcher for PanicFetcher {
            async fn fetch(&self, _: &str, _: std::time::Duration) -> Result<Vec<u8>, SkymapError> {
                panic!("fetch should not be called when a cached map is present");
            }
        }
        let cached = Arc::new(SkyMap::from_position(0.0, 0.0, 1.0, 8));
        let result = acquire(
            &PanicFetcher,
            Some(&cached),
            Some("http://example.org/map.fits"),
            None,
            None,
            128,
            std::time::Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result.content_id(), cached.content_id());
    }

    #[tokio::test]
    async fn acquire_falls_back_to_gaussian_when_no_url() {
        struct NullFetcher;
        #[async_trait::async_trait]
        impl SkymapFetcher for NullFetcher {
            async fn fetch(&self, _: &str, _: std::time::Duration) -> Result<Vec<u8>, SkymapError> {
                Err(SkymapError::Unavailable)
            }
        }
        let result = acquire(
            &NullFetcher,
            None,
            None,
            Some((12.0, -5.0)),
            Some(2.0),
            64,
            std::time::Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result.nside(), 64);
    }
}
