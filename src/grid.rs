//! The sky grid / GridTile (spec GLOSSARY): a fixed tessellation of the sky
//! used for tile selection (spec §4.6 step 8). Per spec §1/§9 the
//! observation-database schema is an opaque collaborator — this module only
//! supplies the default in-process tessellation [`InMemoryObsDb`] serves
//! from `current_grid()`; a real deployment's grid lives in its own table
//! and is queried through [`crate::db::ObsDb::current_grid`] instead.

use crate::db::{GridTile, SelectedTile};
use crate::skymap::SkyMap;

/// `nside` for the default in-memory grid: coarse enough to keep tile
/// counts manageable for a reference store, matching the resolution the
/// handler regrades skymaps to before tile selection (spec §4.6 step 8).
const DEFAULT_GRID_NSIDE: u32 = 16;

/// Build the default all-sky tile grid, one tile per pixel of a
/// Fibonacci-lattice tessellation at [`DEFAULT_GRID_NSIDE`] (the same
/// construction [`SkyMap::from_position`] uses for pixel centers).
pub fn default_grid() -> Vec<GridTile> {
    let npix = 12usize * (DEFAULT_GRID_NSIDE as usize) * (DEFAULT_GRID_NSIDE as usize);
    let centers = crate::skymap::fibonacci_sphere_public(npix);
    centers
        .into_iter()
        .enumerate()
        .map(|(i, (ra, dec))| GridTile {
            name: format!("T{i:05}"),
            ra_deg: ra,
            dec_deg: dec,
        })
        .collect()
}

/// Apply a skymap to a grid (spec §4.6 step 8): score every tile by the
/// skymap's probability nearest its center, keep only tiles within
/// `contour` of the cumulative probability and above `min_tile_prob`, sort
/// descending by probability, and cap at `max_tiles`.
pub fn select_tiles(
    grid: &[GridTile],
    skymap: &SkyMap,
    contour: f64,
    max_tiles: usize,
    min_tile_prob: f64,
) -> Vec<SelectedTile> {
    let mut scored: Vec<SelectedTile> = grid
        .iter()
        .map(|tile| SelectedTile {
            tile: tile.clone(),
            prob: skymap.probability_near(tile.ra_deg, tile.dec_deg),
        })
        .filter(|s| s.prob >= min_tile_prob)
        .collect();
    scored.sort_by(|a, b| b.prob.partial_cmp(&a.prob).unwrap_or(std::cmp::Ordering::Equal));

    let mut selected = Vec::new();
    let mut cumulative = 0.0;
    for tile in scored {
        if selected.len() >= max_tiles {
            break;
        }
        if cumulative >= contour && !selected.is_empty() {
            break;
        }
        cumulative += tile.prob;
        selected.push(tile);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skymap::SkyMap;

    #[test]
    fn default_grid_covers_whole_sky() {
        let grid = default_grid();
        assert!(!grid.is_empty());
        assert!(grid.iter().any(|t| t.dec_deg > 60.0));
        assert!(grid.iter().any(|t| t.dec_deg < -60.0));
    }

    #[test]
    fn select_tiles_respects_max_tiles_and_sorts_descending() {
        let grid = default_grid();
        let skymap = SkyMap::from_position(180.0, 0.0, 2.0, 16);
        let selected = select_tiles(&grid, &skymap, 0.9, 10, 0.0);
        assert!(selected.len() <= 10);
        for pair in selected.windows(2) {
            assert!(pair[0].prob >= pair[1].prob);
        }
    }

    #[test]
    fn select_tiles_filters_below_min_prob() {
        let grid = default_grid();
        let skymap = SkyMap::from_position(0.0, 0.0, 1.0, 16);
        let selected = select_tiles(&grid, &skymap, 0.9, 10_000, 1.0);
        assert!(selected.is_empty());
    }
}
