//! Strategy resolver (spec §4.4): expands a strategy key into a fully
//! materialized [`StrategyDict`] anchored at an event time.

mod catalog;

pub use catalog::{CadenceTemplate, ConstraintsTemplate, ExposureSetTemplate, StrategyTemplate};

use chrono::{DateTime, Duration, Utc};

pub const IGNORE: &str = "IGNORE";
pub const RETRACTION: &str = "RETRACTION";

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("unknown strategy key: {0}")]
    Undefined(String),
    #[error("strategy decision rule failed: {0}")]
    DecisionFailed(String),
    #[error("strategy template for {key} is missing required field {field}")]
    MissingField { key: String, field: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cadence {
    pub num_todo: u32,
    pub wait_hours: f64,
    pub rank_change: i32,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Constraints {
    pub min_alt: f64,
    pub max_sunalt: f64,
    pub max_moon: String,
    pub min_moonsep: f64,
}

#[derive(Debug, Clone)]
pub struct ExposureSet {
    pub num_exp: u32,
    pub exptime: f64,
    pub filt: String,
}

/// A fully materialized strategy plan, all timestamps absolute (spec §3,
/// `StrategyDict`).
#[derive(Debug, Clone)]
pub struct StrategyDict {
    pub strategy_key: String,
    pub rank: i32,
    pub cadence: Vec<Cadence>,
    pub constraints: Constraints,
    pub exposure_sets: Vec<ExposureSet>,
    pub on_grid: bool,
    pub tile_limit: usize,
    pub prob_limit: f64,
    pub skymap_contour: f64,
    pub wakeup_alert: bool,
}

impl StrategyDict {
    pub fn first_start_time(&self) -> DateTime<Utc> {
        self.cadence[0].start_time
    }

    pub fn last_stop_time(&self) -> DateTime<Utc> {
        self.cadence[self.cadence.len() - 1].stop_time
    }
}

/// Resolve a strategy key against an anchor time. `IGNORE` and `RETRACTION`
/// are reserved sentinels that always resolve to `Ok(None)` (spec §4.4).
pub fn resolve(key: &str, anchor_time: DateTime<Utc>) -> Result<Option<StrategyDict>, StrategyError> {
    if key == IGNORE || key == RETRACTION {
        return Ok(None);
    }
    let template = catalog::lookup(key).ok_or_else(|| StrategyError::Undefined(key.to_string()))?;
    if template.cadence.is_empty() {
        return Err(StrategyError::MissingField {
            key: key.to_string(),
            field: "cadence",
        });
    }
    if template.exposure_sets.is_empty() {
        return Err(StrategyError::MissingField {
            key: key.to_string(),
            field: "exposure_sets",
        });
    }

    let cadence = expand_cadence(&template, anchor_time);

    Ok(Some(StrategyDict {
        strategy_key: key.to_string(),
        rank: template.rank,
        cadence,
        constraints: Constraints {
            min_alt: template.constraints.min_alt,
            max_sunalt: template.constraints.max_sunalt,
            max_moon: template.constraints.max_moon.clone(),
            min_moonsep: template.constraints.min_moonsep,
        },
        exposure_sets: template
            .exposure_sets
            .iter()
            .map(|e| ExposureSet {
                num_exp: e.num_exp,
                exptime: e.exptime,
                filt: e.filt.clone(),
            })
            .collect(),
        on_grid: template.on_grid,
        tile_limit: template.tile_limit,
        prob_limit: template.prob_limit,
        skymap_contour: template.skymap_contour,
        wakeup_alert: template.wakeup_alert,
    }))
}

/// Expansion rule for `cadence` (spec §4.4):
///
/// - entry 0 starts at `anchor_time` plus the template's optional
///   `delay_hours`;
/// - entry `i > 0` starts at entry `i-1`'s start_time, plus `delay_hours`
///   again if the template sets one;
/// - `stop_time = start_time + valid_hours` for every entry.
fn expand_cadence(template: &StrategyTemplate, anchor_time: DateTime<Utc>) -> Vec<Cadence> {
    let delay = template
        .delay_hours
        .map(hours)
        .unwrap_or_else(Duration::zero);

    let mut start_time = anchor_time + delay;
    let mut cadence = Vec::with_capacity(template.cadence.len());
    for (i, entry) in template.cadence.iter().enumerate() {
        if i > 0 {
            start_time += delay;
        }
        let stop_time = start_time + hours(entry.valid_hours);
        cadence.push(Cadence {
            num_todo: entry.num_todo,
            wait_hours: entry.wait_hours,
            rank_change: entry.rank_change,
            start_time,
            stop_time,
        });
    }
    cadence
}

fn hours(h: f64) -> Duration {
    Duration::milliseconds((h * 3_600_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 18, hour, 0, 0).unwrap()
    }

    #[test]
    fn ignore_and_retraction_resolve_to_none() {
        assert!(resolve(IGNORE, t(0)).unwrap().is_none());
        assert!(resolve(RETRACTION, t(0)).unwrap().is_none());
    }

    #[test]
    fn unknown_key_is_an_error() {
        assert!(matches!(
            resolve("NOT_REAL", t(0)),
            Err(StrategyError::Undefined(_))
        ));
    }

    #[test]
    fn cadence_stop_time_matches_valid_hours() {
        let plan = resolve("GW_RANK_2_NARROW", t(0)).unwrap().unwrap();
        for entry in &plan.cadence {
            let valid = (entry.stop_time - entry.start_time).num_seconds();
            assert!(valid > 0);
        }
        // Two-entry cadence: start times strictly increasing.
        assert!(plan.cadence[1].start_time >= plan.cadence[0].start_time);
    }

    #[test]
    fn single_cadence_entry_collapses_naturally() {
        let plan = resolve("GRB_SWIFT", t(0)).unwrap().unwrap();
        assert_eq!(plan.cadence.len(), 1);
        assert_eq!(plan.first_start_time(), plan.cadence[0].start_time);
        assert_eq!(plan.last_stop_time(), plan.cadence[0].stop_time);
    }
}
