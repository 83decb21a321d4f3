//! Gravitational-wave notices (`LVC`/LIGO-Virgo-KAGRA), both transports: the
//! classic VOEvent packets and the newer Kafka GW notice JSON envelope
//! (spec §3, §4.5).

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::voevent::VoEventDoc;
use super::{ClassifyError, EventType, Notice, NoticeCore, NoticeKind, Role};
use crate::skymap::SkyMap;
use crate::strategy::{IGNORE, RETRACTION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GwGroup {
    Cbc,
    Burst,
}

/// A coincident external (non-GW) trigger reported alongside this
/// superevent, e.g. a Fermi-GBM sub-threshold GRB (spec §3,
/// `ExternalCoincidence`).
#[derive(Debug, Clone)]
pub struct ExternalCoincidence {
    pub instrument: String,
    pub combined_skymap_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GwExt {
    pub group: GwGroup,
    /// False alarm rate, in Hz, as reported by the pipeline.
    pub far: Option<f64>,
    pub significant: bool,
    /// Source classification probabilities (`BNS`, `NSBH`, `BBH`, `Terrestrial`).
    pub classification: HashMap<String, f64>,
    /// Source properties (`HasNS`, `HasRemnant`, ...).
    pub properties: HashMap<String, f64>,
    pub gracedb_url: Option<String>,
    pub external: Option<ExternalCoincidence>,
    pub distmean: Option<f64>,
    pub diststd: Option<f64>,
}

impl GwExt {
    /// `far_yrs` per the recorded decision: `far (Hz) * 365 * 86400`, applied
    /// uniformly everywhere this crate needs a yearly rate (see DESIGN.md).
    pub fn far_yrs(&self) -> Option<f64> {
        self.far.map(|f| f * 365.0 * 86_400.0)
    }

    fn observable_metric(&self) -> f64 {
        let has_remnant = self.properties.get("HasRemnant").copied().unwrap_or(0.0);
        let bns = self.classification.get("BNS").copied().unwrap_or(0.0);
        let nsbh = self.classification.get("NSBH").copied().unwrap_or(0.0);
        has_remnant * (bns + nsbh)
    }

    fn distance(&self) -> f64 {
        match (self.distmean, self.diststd) {
            (Some(mean), Some(std)) => mean - std,
            _ => f64::INFINITY,
        }
    }

    /// The strategy decision tree (spec §4.5): resolve to a strategy catalog
    /// key, or to `IGNORE` when the event fails the significance/observability
    /// gates. An externally-coincident event is always promoted to rank 1.
    pub fn decide_strategy_key(&self, skymap: &SkyMap) -> String {
        if self.external.is_some() {
            let narrow = skymap.contour_area(0.9) < 1000.0;
            return format!("GW_RANK_1_{}", if narrow { "NARROW" } else { "WIDE" });
        }

        let far_yrs = self.far_yrs().unwrap_or(f64::INFINITY);
        let area90 = skymap.contour_area(0.9);
        let narrow = if area90 < 1000.0 { "NARROW" } else { "WIDE" };

        match self.group {
            GwGroup::Cbc => {
                if far_yrs > 12.0 && !self.significant {
                    return IGNORE.to_string();
                }
                let close_and_small = area90 < 5000.0 && self.distance() < 250.0;
                let rank = if self.observable_metric() > 0.5 {
                    if close_and_small {
                        2
                    } else {
                        3
                    }
                } else if close_and_small {
                    5
                } else {
                    return IGNORE.to_string();
                };
                format!("GW_RANK_{rank}_{narrow}")
            }
            GwGroup::Burst => {
                if far_yrs > 1.0 && !self.significant {
                    return IGNORE.to_string();
                }
                if area90 < 5000.0 {
                    format!("GW_RANK_4_{narrow}")
                } else {
                    IGNORE.to_string()
                }
            }
        }
    }
}

fn param_value(doc: &VoEventDoc, name: &str) -> Option<String> {
    if let Some(p) = doc.top_params.get(name) {
        return Some(p.value.clone());
    }
    doc.group_params
        .values()
        .find_map(|g| g.params.get(name).map(|p| p.value.clone()))
}

fn param_f64(doc: &VoEventDoc, name: &str) -> Option<f64> {
    param_value(doc, name).and_then(|v| v.parse().ok())
}

fn param_bool(doc: &VoEventDoc, name: &str) -> bool {
    param_value(doc, name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false)
}

/// Construct a GW notice from a classic VOEvent packet. Retraction packets
/// (`AlertType=Retraction`) short-circuit straight to `GwRetraction` (spec
/// §4.5 "GW-Retraction: RETRACTION") since a retraction carries no
/// classification fields worth keeping.
pub fn from_voevent(mut core: NoticeCore, doc: &VoEventDoc) -> Result<(NoticeCore, NoticeKind), ClassifyError> {
    core.event_type = EventType::Gw;
    core.event_time = doc.event_time;

    let alert_type = param_value(doc, "AlertType").unwrap_or_default();
    if alert_type.eq_ignore_ascii_case("retraction") {
        core.type_ = RETRACTION.to_string();
        return Ok((core, NoticeKind::GwRetraction));
    }

    let group = match param_value(doc, "Group").as_deref() {
        Some("Burst") => GwGroup::Burst,
        _ => GwGroup::Cbc,
    };
    core.type_ = match group {
        GwGroup::Cbc => "CBC".to_string(),
        GwGroup::Burst => "Burst".to_string(),
    };
    core.event_id = param_value(doc, "GraceID").or_else(|| param_value(doc, "Superevent_id"));

    let mut classification = HashMap::new();
    for key in ["BNS", "NSBH", "BBH", "Terrestrial"] {
        if let Some(v) = param_f64(doc, key) {
            classification.insert(key.to_string(), v);
        }
    }
    let mut properties = HashMap::new();
    for key in ["HasNS", "HasRemnant", "HasMassGap"] {
        if let Some(v) = param_f64(doc, key) {
            properties.insert(key.to_string(), v);
        }
    }

    let ext = GwExt {
        group,
        far: param_f64(doc, "FAR"),
        significant: param_bool(doc, "Significant"),
        classification,
        properties,
        gracedb_url: param_value(doc, "EventPage"),
        external: None,
        distmean: param_f64(doc, "Distance"),
        diststd: param_f64(doc, "Distance_Error"),
    };

    core.skymap_url = param_value(doc, "skymap_fits");

    Ok((core, NoticeKind::Gw(ext)))
}

/// Construct a GW notice from the newer Kafka GW notice JSON envelope (spec
/// §3): a top-level `superevent_id`/`alert_type` with an embedded
/// `event`/`external_coinc` block. Unlike the VOEvent path this constructor
/// cannot fail into `InvalidNotice` — a malformed envelope degrades to the
/// base Generic notice instead, since the envelope's presence (not its
/// internal shape) is what routed the payload here.
pub fn from_kafka_json(value: &serde_json::Value, local_ivo: &str, now: DateTime<Utc>) -> Notice {
    let superevent_id = value
        .get("superevent_id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("UNKNOWN");
    let alert_type = value
        .get("alert_type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");

    let notice_time = value
        .get("time_created")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(now);

    let ivorn = super::synthesize_ivorn(local_ivo, "LVC", superevent_id, notice_time);

    let event_time = value
        .get("event")
        .and_then(|e| e.get("time"))
        .and_then(serde_json::Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));

    let mut core = NoticeCore {
        ivorn,
        source: "LVC".to_string(),
        role: Role::Observation,
        notice_time,
        event_type: EventType::Gw,
        type_: String::new(),
        event_id: Some(superevent_id.to_string()),
        event_time,
        position: None,
        position_error_deg: None,
        skymap_url: None,
        skymap: None,
    };

    if alert_type.eq_ignore_ascii_case("retraction") {
        core.type_ = RETRACTION.to_string();
        return Notice {
            core,
            kind: NoticeKind::GwRetraction,
        };
    }

    let event = value.get("event");
    let group = match event
        .and_then(|e| e.get("group"))
        .and_then(serde_json::Value::as_str)
    {
        Some("Burst") => GwGroup::Burst,
        _ => GwGroup::Cbc,
    };
    core.type_ = match group {
        GwGroup::Cbc => "CBC".to_string(),
        GwGroup::Burst => "Burst".to_string(),
    };

    let classification = event
        .and_then(|e| e.get("classification"))
        .and_then(serde_json::Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
                .collect()
        })
        .unwrap_or_default();
    let properties = event
        .and_then(|e| e.get("properties"))
        .and_then(serde_json::Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
                .collect()
        })
        .unwrap_or_default();

    let external = value.get("external_coinc").and_then(|e| {
        e.get("instrument")
            .and_then(serde_json::Value::as_str)
            .map(|instrument| ExternalCoincidence {
                instrument: instrument.to_string(),
                combined_skymap_url: e
                    .get("combined_skymap")
                    .and_then(serde_json::Value::as_str)
                    .map(String::from),
            })
    });

    let ext = GwExt {
        group,
        far: event.and_then(|e| e.get("far")).and_then(serde_json::Value::as_f64),
        significant: event
            .and_then(|e| e.get("significant"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        classification,
        properties,
        gracedb_url: value
            .get("urls")
            .and_then(|u| u.get("gracedb"))
            .and_then(serde_json::Value::as_str)
            .map(String::from),
        external,
        distmean: event
            .and_then(|e| e.get("distmean"))
            .and_then(serde_json::Value::as_f64),
        diststd: event
            .and_then(|e| e.get("diststd"))
            .and_then(serde_json::Value::as_f64),
    };

    // The embedded skymap in this envelope is base64-encoded FITS bytes
    // rather than a URL; `handler::ensure_skymap` decodes and parses it the
    // same way the URL-fetch path parses a downloaded FITS file.
    if let Some(b64) = event
        .and_then(|e| e.get("skymap"))
        .and_then(serde_json::Value::as_str)
    {
        core.skymap_url = Some(format!("data:base64,{b64}"));
    }

    Notice {
        core,
        kind: NoticeKind::Gw(ext),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::voevent::ParamValue;

    fn core_fixture() -> NoticeCore {
        NoticeCore {
            ivorn: "ivo://nasa.gsfc.gcn/LVC#S230518h-1-Preliminary".to_string(),
            source: "LVC".to_string(),
            role: Role::Observation,
            notice_time: Utc::now(),
            event_type: EventType::Unknown,
            type_: String::new(),
            event_id: None,
            event_time: None,
            position: None,
            position_error_deg: None,
            skymap_url: None,
            skymap: None,
        }
    }

    fn doc_with_params(pairs: &[(&str, &str)]) -> VoEventDoc {
        let mut doc = VoEventDoc::default();
        for (k, v) in pairs {
            doc.top_params.insert(
                k.to_string(),
                ParamValue {
                    value: v.to_string(),
                    unit: None,
                    ucd: None,
                },
            );
        }
        doc
    }

    #[test]
    fn retraction_alert_type_short_circuits() {
        let doc = doc_with_params(&[("AlertType", "Retraction")]);
        let (core, kind) = from_voevent(core_fixture(), &doc).unwrap();
        assert!(matches!(kind, NoticeKind::GwRetraction));
        assert_eq!(core.type_, RETRACTION);
    }

    #[test]
    fn cbc_high_far_and_insignificant_is_ignored() {
        let ext = GwExt {
            group: GwGroup::Cbc,
            far: Some(1e-6),
            significant: false,
            classification: HashMap::new(),
            properties: HashMap::new(),
            gracedb_url: None,
            external: None,
            distmean: None,
            diststd: None,
        };
        let map = SkyMap::from_position(0.0, 0.0, 1.0, 16);
        assert_eq!(ext.decide_strategy_key(&map), IGNORE);
    }

    #[test]
    fn external_coincidence_forces_rank_1() {
        let ext = GwExt {
            group: GwGroup::Cbc,
            far: Some(1e-9),
            significant: true,
            classification: HashMap::new(),
            properties: HashMap::new(),
            gracedb_url: None,
            external: Some(ExternalCoincidence {
                instrument: "Fermi-GBM".to_string(),
                combined_skymap_url: None,
            }),
            distmean: None,
            diststd: None,
        };
        let map = SkyMap::from_position(0.0, 0.0, 1.0, 16);
        assert!(ext.decide_strategy_key(&map).starts_with("GW_RANK_1_"));
    }

    #[test]
    fn cbc_bbh_dominated_close_and_small_gets_rank_5() {
        let ext = GwExt {
            group: GwGroup::Cbc,
            far: Some(1e-9),
            significant: true,
            classification: HashMap::new(),
            properties: HashMap::new(),
            gracedb_url: None,
            external: None,
            distmean: Some(100.0),
            diststd: Some(10.0),
        };
        let map = SkyMap::from_position(0.0, 0.0, 1.0, 16);
        assert_eq!(ext.decide_strategy_key(&map), "GW_RANK_5_NARROW");
    }

    #[test]
    fn cbc_bbh_dominated_far_or_large_is_ignored() {
        let ext = GwExt {
            group: GwGroup::Cbc,
            far: Some(1e-9),
            significant: true,
            classification: HashMap::new(),
            properties: HashMap::new(),
            gracedb_url: None,
            external: None,
            distmean: Some(1000.0),
            diststd: Some(10.0),
        };
        let map = SkyMap::from_position(0.0, 0.0, 1.0, 16);
        assert_eq!(ext.decide_strategy_key(&map), IGNORE);
    }

    #[test]
    fn burst_wide_area_is_ignored() {
        let ext = GwExt {
            group: GwGroup::Burst,
            far: Some(1e-9),
            significant: true,
            classification: HashMap::new(),
            properties: HashMap::new(),
            gracedb_url: None,
            external: None,
            distmean: None,
            diststd: None,
        };
        let map = SkyMap::from_position(0.0, 0.0, 80.0, 8);
        assert_eq!(ext.decide_strategy_key(&map), IGNORE);
    }
}
