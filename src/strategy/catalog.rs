//! The static strategy catalog (spec §6): a table mapping strategy key to
//! template. In the reference implementation this lives in a
//! `strategies.json` data file shipped alongside the package; here it is a
//! compiled table for the same reason the reference implementation's
//! `get_strategy_details` validates required keys at lookup time — the
//! catalog is closed and known at build time, so there is no configuration
//! surface for it to go missing from at runtime.

use std::collections::HashMap;

/// One entry in a [`Cadence`] template, before the time fields are expanded
/// against an anchor time (see [`super::expand_cadence`]).
#[derive(Debug, Clone)]
pub struct CadenceTemplate {
    pub num_todo: u32,
    pub wait_hours: f64,
    pub rank_change: i32,
    pub valid_hours: f64,
}

#[derive(Debug, Clone)]
pub struct ConstraintsTemplate {
    pub min_alt: f64,
    pub max_sunalt: f64,
    pub max_moon: String,
    pub min_moonsep: f64,
}

#[derive(Debug, Clone)]
pub struct ExposureSetTemplate {
    pub num_exp: u32,
    pub exptime: f64,
    pub filt: String,
}

#[derive(Debug, Clone)]
pub struct StrategyTemplate {
    pub rank: i32,
    pub cadence: Vec<CadenceTemplate>,
    pub constraints: ConstraintsTemplate,
    pub exposure_sets: Vec<ExposureSetTemplate>,
    pub on_grid: bool,
    pub tile_limit: usize,
    pub prob_limit: f64,
    pub skymap_contour: f64,
    /// Added to every cadence entry's `start_time` (spec §4.4).
    pub delay_hours: Option<f64>,
    pub wakeup_alert: bool,
}

fn default_constraints() -> ConstraintsTemplate {
    ConstraintsTemplate {
        min_alt: 30.0,
        max_sunalt: -15.0,
        max_moon: "B".to_string(),
        min_moonsep: 10.0,
    }
}

fn default_exposure_sets() -> Vec<ExposureSetTemplate> {
    vec![ExposureSetTemplate {
        num_exp: 3,
        exptime: 60.0,
        filt: "L".to_string(),
    }]
}

fn gw_template(rank: i32, tile_limit: usize, wakeup_alert: bool) -> StrategyTemplate {
    StrategyTemplate {
        rank,
        cadence: vec![
            CadenceTemplate {
                num_todo: 1,
                wait_hours: 0.0,
                rank_change: 0,
                valid_hours: 24.0,
            },
            CadenceTemplate {
                num_todo: 1,
                wait_hours: 24.0,
                rank_change: 1,
                valid_hours: 24.0,
            },
        ],
        constraints: default_constraints(),
        exposure_sets: default_exposure_sets(),
        on_grid: true,
        tile_limit,
        prob_limit: 0.01,
        skymap_contour: 0.9,
        delay_hours: None,
        wakeup_alert,
    }
}

fn grb_template(rank: i32, tile_limit: usize) -> StrategyTemplate {
    StrategyTemplate {
        rank,
        cadence: vec![CadenceTemplate {
            num_todo: 1,
            wait_hours: 0.0,
            rank_change: 0,
            valid_hours: 12.0,
        }],
        constraints: default_constraints(),
        exposure_sets: default_exposure_sets(),
        on_grid: true,
        tile_limit,
        prob_limit: 0.01,
        skymap_contour: 0.9,
        delay_hours: None,
        wakeup_alert: false,
    }
}

fn nu_template(rank: i32) -> StrategyTemplate {
    StrategyTemplate {
        rank,
        cadence: vec![CadenceTemplate {
            num_todo: 1,
            wait_hours: 0.0,
            rank_change: 0,
            valid_hours: 6.0,
        }],
        constraints: default_constraints(),
        exposure_sets: default_exposure_sets(),
        on_grid: false,
        tile_limit: 1,
        prob_limit: 0.0,
        skymap_contour: 0.9,
        delay_hours: None,
        wakeup_alert: true,
    }
}

/// Look up a strategy template by key. Built fresh on every call: the
/// templates are a handful of small structs, and rebuilding them is cheaper
/// than the synchronization a cached static would need for the same result.
pub fn lookup(key: &str) -> Option<StrategyTemplate> {
    build_catalog().remove(key)
}

fn build_catalog() -> HashMap<&'static str, StrategyTemplate> {
    let mut m = HashMap::new();
    m.insert("GW_RANK_1_NARROW", gw_template(1, 50, true));
    m.insert("GW_RANK_1_WIDE", gw_template(1, 250, true));
    m.insert("GW_RANK_2_NARROW", gw_template(2, 50, true));
    m.insert("GW_RANK_2_WIDE", gw_template(2, 250, true));
    m.insert("GW_RANK_3_NARROW", gw_template(3, 50, false));
    m.insert("GW_RANK_3_WIDE", gw_template(3, 250, false));
    m.insert("GW_RANK_4_NARROW", gw_template(4, 50, false));
    m.insert("GW_RANK_4_WIDE", gw_template(4, 250, false));
    m.insert("GW_RANK_5_NARROW", gw_template(5, 50, false));
    m.insert("GW_RANK_5_WIDE", gw_template(5, 250, false));
    // Legacy keys retained from the original decision tables (spec §6);
    // no longer produced by the current decision rules in §4.5 but kept
    // resolvable so archived strategy keys still expand.
    m.insert("GW_CLOSE_NS", gw_template(2, 50, true));
    m.insert("GW_FAR_NS", gw_template(3, 50, false));
    m.insert("GW_CLOSE_BH", gw_template(5, 50, false));
    m.insert("GW_FAR_BH", gw_template(5, 250, false));
    m.insert("GW_BURST", gw_template(4, 50, false));
    m.insert("GRB_SWIFT", grb_template(3, 50));
    m.insert("GRB_FERMI_NARROW", grb_template(3, 50));
    m.insert("GRB_FERMI_WIDE", grb_template(3, 250));
    m.insert("GRB_OTHER", grb_template(4, 50));
    m.insert("NU_ICECUBE_GOLD", nu_template(2));
    m.insert("NU_ICECUBE_BRONZE", nu_template(3));
    m.insert("NU_ICECUBE_CASCADE", nu_template(4));
    m.insert(
        "DEFAULT",
        StrategyTemplate {
            rank: 5,
            cadence: vec![CadenceTemplate {
                num_todo: 1,
                wait_hours: 0.0,
                rank_change: 0,
                valid_hours: 24.0,
            }],
            constraints: default_constraints(),
            exposure_sets: default_exposure_sets(),
            on_grid: false,
            tile_limit: 1,
            prob_limit: 0.0,
            skymap_contour: 0.9,
            delay_hours: None,
            wakeup_alert: false,
        },
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_decision_rule_key_resolves() {
        for key in [
            "GW_RANK_1_NARROW",
            "GW_RANK_2_WIDE",
            "GW_RANK_3_NARROW",
            "GW_RANK_4_WIDE",
            "GW_RANK_5_NARROW",
            "GRB_SWIFT",
            "GRB_FERMI_NARROW",
            "GRB_FERMI_WIDE",
            "GRB_OTHER",
            "NU_ICECUBE_GOLD",
            "NU_ICECUBE_BRONZE",
            "NU_ICECUBE_CASCADE",
            "DEFAULT",
        ] {
            assert!(lookup(key).is_some(), "missing catalog entry for {key}");
        }
    }

    #[test]
    fn unknown_key_is_none() {
        assert!(lookup("NOT_A_REAL_KEY").is_none());
    }
}
