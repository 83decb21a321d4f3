//! The Notice model: a tagged union over the eight notice variants this
//! sentinel understands, replacing the reference implementation's runtime
//! subclass dispatch with an explicit discriminant (`source` x `sub-type`).
//! All variants share [`NoticeCore`]; a single VOEvent flattener
//! ([`voevent`]) and a single payload deserializer ([`deserialize`]) feed
//! every variant constructor.

pub mod deserialize;
mod einstein_probe;
mod gecam;
mod grb;
mod gw;
mod icecube;
pub mod voevent;

pub use deserialize::{deserialize, DeserializeError, DeserializedPayload};
pub use gecam::GecamExt;
pub use grb::{FermiExt, FERMI_SYSTEMATIC_ERR_DEG};
pub use gw::{ExternalCoincidence, GwExt, GwGroup};
pub use icecube::{IceCubeExt, IceCubeSubtype, ICECUBE_SYSTEMATIC_ERR_DEG};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::skymap::SkyMap;
use voevent::VoEventDoc;

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("notice rejected by {source} constructor: {reason}")]
    InvalidNotice { source: String, reason: String },
}

/// Where a notice falls in the publisher's role taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Observation,
    Test,
    Utility,
    Unknown,
}

impl Role {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "observation" => Role::Observation,
            "test" => Role::Test,
            "utility" => Role::Utility,
            _ => Role::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Observation => "observation",
            Role::Test => "test",
            Role::Utility => "utility",
            Role::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Gw,
    Grb,
    Nu,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

/// Fields shared by every notice variant (spec §3, `Notice`).
#[derive(Debug, Clone)]
pub struct NoticeCore {
    pub ivorn: String,
    pub source: String,
    pub role: Role,
    pub notice_time: DateTime<Utc>,
    pub event_type: EventType,
    /// Variant-specific sub-type, e.g. `"CBC"`, `"GBM_FIN_POS"`, `"ASTROTRACK_GOLD"`.
    pub type_: String,
    pub event_id: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub position: Option<Position>,
    pub position_error_deg: Option<f64>,
    pub skymap_url: Option<String>,
    pub skymap: Option<Arc<SkyMap>>,
}

impl NoticeCore {
    /// `event_name` per spec §3: `"{source}_{event_id}"`, falling back to
    /// `"{source}_{event_time_isot}"`, falling back to `"{source}_<unknown>"`.
    pub fn event_name(&self) -> String {
        if let Some(id) = &self.event_id {
            return format!("{}_{}", self.source, id);
        }
        if let Some(t) = &self.event_time {
            return format!("{}_{}", self.source, t.format("%Y-%m-%dT%H:%M:%S%.3f"));
        }
        format!("{}_<unknown>", self.source)
    }
}

/// Variant-specific payload, tagging the discriminant the reference
/// implementation expressed as a subclass.
#[derive(Debug, Clone)]
pub enum NoticeKind {
    Generic,
    Gw(GwExt),
    GwRetraction,
    Fermi(FermiExt),
    Swift,
    Gecam(GecamExt),
    EinsteinProbe,
    IceCube(IceCubeExt),
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub core: NoticeCore,
    pub kind: NoticeKind,
}

impl Notice {
    pub fn event_name(&self) -> String {
        self.core.event_name()
    }

    /// `true` once the IVORN carries the Fermi follow-up suffix (spec §4.8,
    /// §4.9): re-probing an already-resolved notice would loop forever.
    pub fn has_new_skymap_suffix(&self) -> bool {
        self.core.ivorn.ends_with("_new_skymap")
    }

    /// Clone this notice with `_new_skymap` appended to its IVORN and the
    /// skymap cache cleared, for Fermi follow-up re-enqueue (spec §4.9).
    pub fn with_new_skymap_suffix(&self) -> Notice {
        let mut clone = self.clone();
        clone.core.ivorn = format!("{}_new_skymap", self.core.ivorn);
        clone.core.skymap = None;
        clone
    }

    /// The per-variant strategy decision rule (spec §4.5), dispatched over
    /// the tagged union in place of the reference implementation's
    /// per-subclass method. Variants whose rule needs the skymap
    /// (GW-detection, Fermi-GRB) fail with `DecisionFailed` when none is
    /// available; the handler maps that failure to `IGNORE` (spec §7).
    pub fn decide_strategy_key(
        &self,
        skymap: Option<&SkyMap>,
    ) -> Result<String, crate::strategy::StrategyError> {
        use crate::strategy::StrategyError;
        match &self.kind {
            NoticeKind::GwRetraction => Ok(crate::strategy::RETRACTION.to_string()),
            NoticeKind::Gw(ext) => {
                let skymap = skymap.ok_or_else(|| {
                    StrategyError::DecisionFailed("GW-detection requires a skymap".to_string())
                })?;
                Ok(ext.decide_strategy_key(skymap))
            }
            NoticeKind::Fermi(ext) => {
                let skymap = skymap.ok_or_else(|| {
                    StrategyError::DecisionFailed("Fermi-GRB requires a skymap".to_string())
                })?;
                Ok(ext.decide_strategy_key(skymap))
            }
            NoticeKind::Swift => Ok("GRB_SWIFT".to_string()),
            NoticeKind::Gecam(_) | NoticeKind::EinsteinProbe => Ok("GRB_OTHER".to_string()),
            NoticeKind::IceCube(ext) => Ok(ext.subtype.strategy_key().to_string()),
            NoticeKind::Generic => Ok("DEFAULT".to_string()),
        }
    }
}

/// Synthesize a stable IVORN for a payload that did not carry one, per spec
/// §3: `"ivo://{local_ivo_authority}/{source}#{sub_type}_{event_time}"`.
pub fn synthesize_ivorn(local_ivo: &str, source: &str, sub_type: &str, event_time: DateTime<Utc>) -> String {
    format!(
        "{}/{}#{}_{}",
        local_ivo.trim_end_matches('/'),
        source,
        sub_type,
        event_time.format("%Y%m%dT%H%M%S")
    )
}

/// Extract the normalized `source` shortname (`LVC`, `Fermi`, `Swift`,
/// `GECAM`, `EinsteinProbe`, `IceCube`) from an IVORN's authority path, the
/// way GCN/TAN notices encode it: `ivo://nasa.gsfc.gcn/LVC#S230518h...`.
fn source_from_ivorn(ivorn: &str) -> Option<String> {
    let without_local = ivorn.split('#').next()?;
    without_local.rsplit('/').next().map(str::to_string)
}

/// Build the base [`NoticeCore`] from a flattened VOEvent document.
fn core_from_voevent(doc: &VoEventDoc, local_ivo: &str, now: DateTime<Utc>) -> NoticeCore {
    let source = doc
        .ivorn
        .as_deref()
        .and_then(source_from_ivorn)
        .unwrap_or_else(|| "UNKNOWN".to_string());
    let notice_time = doc.notice_time.unwrap_or(now);
    let ivorn = doc.ivorn.clone().unwrap_or_else(|| {
        synthesize_ivorn(local_ivo, &source, "notice", notice_time)
    });
    NoticeCore {
        ivorn,
        source,
        role: doc
            .role
            .as_deref()
            .map(Role::from_str)
            .unwrap_or(Role::Unknown),
        notice_time,
        event_type: EventType::Unknown,
        type_: String::new(),
        event_id: None,
        event_time: doc.event_time,
        position: doc
            .position
            .map(|(ra_deg, dec_deg)| Position { ra_deg, dec_deg }),
        position_error_deg: doc.position_error_deg,
        skymap_url: None,
        skymap: None,
    }
}

/// Classify a deserialized payload into a [`Notice`], dispatching by
/// `source` (case-insensitive), splitting out GW-retraction by an explicit
/// `AlertType=RETRACTION`, and routing AMON notices whose IVORN contains
/// `ICECUBE` to the IceCube variant. A variant constructor that rejects an
/// otherwise-well-formed message (`InvalidNotice`) falls back to the base
/// Generic notice rather than failing the whole ingest (spec §4.2, §7).
pub fn classify(payload: DeserializedPayload, local_ivo: &str, now: DateTime<Utc>) -> Notice {
    match payload {
        DeserializedPayload::VoEvent(doc) => classify_voevent(doc, local_ivo, now),
        DeserializedPayload::Json(value) => classify_json(value, local_ivo, now),
    }
}

fn classify_voevent(doc: VoEventDoc, local_ivo: &str, now: DateTime<Utc>) -> Notice {
    let mut core = core_from_voevent(&doc, local_ivo, now);
    let source_upper = core.source.to_ascii_uppercase();

    let result: Result<(NoticeCore, NoticeKind), ClassifyError> = match source_upper.as_str() {
        "LVC" => gw::from_voevent(core.clone(), &doc),
        "FERMI" | "FERMI_GBM" => grb::fermi_from_voevent(core.clone(), &doc),
        "SWIFT" => grb::swift_from_voevent(core.clone(), &doc),
        "GECAM" => gecam::from_voevent(core.clone(), &doc),
        "EINSTEINPROBE" | "EP" => einstein_probe::from_voevent(core.clone(), &doc),
        "AMON" if core.ivorn.to_ascii_uppercase().contains("ICECUBE") => {
            icecube::from_voevent(core.clone(), &doc)
        }
        _ => Ok((core.clone(), NoticeKind::Generic)),
    };

    match result {
        Ok((new_core, kind)) => {
            core = new_core;
            Notice { core, kind }
        }
        Err(e) => {
            tracing::warn!(ivorn = %core.ivorn, error = %e, "variant constructor rejected notice, falling back to Generic");
            Notice {
                core,
                kind: NoticeKind::Generic,
            }
        }
    }
}

fn classify_json(value: serde_json::Value, local_ivo: &str, now: DateTime<Utc>) -> Notice {
    // The newer Kafka GW notice format is JSON but not VOEvent-shaped; it is
    // recognized by its distinctive `superevent_id`/`alert_type` envelope.
    if value.get("superevent_id").is_some() {
        return gw::from_kafka_json(&value, local_ivo, now);
    }
    let source = value
        .get("source")
        .or_else(|| value.get("instrument"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();
    let notice_time = now;
    let ivorn = value
        .get("ivorn")
        .and_then(serde_json::Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| synthesize_ivorn(local_ivo, &source, "notice", notice_time));
    let core = NoticeCore {
        ivorn,
        source,
        role: Role::from_str(
            value
                .get("role")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("observation"),
        ),
        notice_time,
        event_type: EventType::Unknown,
        type_: String::new(),
        event_id: None,
        event_time: None,
        position: None,
        position_error_deg: None,
        skymap_url: None,
        skymap: None,
    };
    Notice {
        core,
        kind: NoticeKind::Generic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_prefers_event_id() {
        let core = NoticeCore {
            ivorn: "ivo://test/x#1".to_string(),
            source: "LVC".to_string(),
            role: Role::Observation,
            notice_time: Utc::now(),
            event_type: EventType::Gw,
            type_: "CBC".to_string(),
            event_id: Some("S230518h".to_string()),
            event_time: None,
            position: None,
            position_error_deg: None,
            skymap_url: None,
            skymap: None,
        };
        assert_eq!(core.event_name(), "LVC_S230518h");
    }

    #[test]
    fn event_name_falls_back_to_event_time_then_unknown() {
        let mut core = NoticeCore {
            ivorn: "ivo://test/x#1".to_string(),
            source: "Fermi".to_string(),
            role: Role::Observation,
            notice_time: Utc::now(),
            event_type: EventType::Grb,
            type_: String::new(),
            event_id: None,
            event_time: Some(
                DateTime::parse_from_rfc3339("2023-05-18T01:02:03Z")
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            position: None,
            position_error_deg: None,
            skymap_url: None,
            skymap: None,
        };
        assert_eq!(core.event_name(), "Fermi_2023-05-18T01:02:03.000");
        core.event_time = None;
        assert_eq!(core.event_name(), "Fermi_<unknown>");
    }

    #[test]
    fn source_extracted_from_ivorn_authority() {
        assert_eq!(
            source_from_ivorn("ivo://nasa.gsfc.gcn/LVC#S230518h-1-Preliminary"),
            Some("LVC".to_string())
        );
        assert_eq!(
            source_from_ivorn("ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos_12345-678"),
            Some("SWIFT".to_string())
        );
    }

    #[test]
    fn unmatched_source_falls_back_to_generic() {
        let doc = VoEventDoc {
            ivorn: Some("ivo://example.org/Unknown#1".to_string()),
            role: Some("observation".to_string()),
            ..VoEventDoc::default()
        };
        let notice = classify_voevent(doc, "ivo://localhost/alert-sentinel", Utc::now());
        assert!(matches!(notice.kind, NoticeKind::Generic));
    }
}
