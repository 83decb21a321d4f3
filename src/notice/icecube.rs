//! IceCube neutrino notices, routed here from AMON-sourced VOEvents whose
//! IVORN contains `ICECUBE` (spec §4.2). Sub-type drives both the combined
//! systematic position error and the strategy key (spec §3, §4.5).

use super::voevent::VoEventDoc;
use super::{ClassifyError, EventType, NoticeCore, NoticeKind, Position};

/// IceCube's combined systematic error for track-like events (spec §3,
/// "IceCube non-CASCADE: 0.2°"); cascade events get no additional term.
pub const ICECUBE_SYSTEMATIC_ERR_DEG: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceCubeSubtype {
    AstrotrackGold,
    AstrotrackBronze,
    Cascade,
}

impl IceCubeSubtype {
    fn from_ivorn(ivorn: &str) -> IceCubeSubtype {
        let upper = ivorn.to_ascii_uppercase();
        if upper.contains("CASCADE") {
            IceCubeSubtype::Cascade
        } else if upper.contains("BRONZE") {
            IceCubeSubtype::AstrotrackBronze
        } else {
            IceCubeSubtype::AstrotrackGold
        }
    }

    /// `NU_ICECUBE_GOLD | _BRONZE | _CASCADE` (spec §4.5).
    pub fn strategy_key(self) -> &'static str {
        match self {
            IceCubeSubtype::AstrotrackGold => "NU_ICECUBE_GOLD",
            IceCubeSubtype::AstrotrackBronze => "NU_ICECUBE_BRONZE",
            IceCubeSubtype::Cascade => "NU_ICECUBE_CASCADE",
        }
    }

    fn systematic_err_deg(self) -> f64 {
        match self {
            IceCubeSubtype::Cascade => 0.0,
            _ => ICECUBE_SYSTEMATIC_ERR_DEG,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IceCubeExt {
    pub subtype: IceCubeSubtype,
    pub signalness: Option<f64>,
    pub far: Option<f64>,
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

fn combine_quadrature(stat: f64, systematic: f64) -> f64 {
    (stat * stat + systematic * systematic).sqrt()
}

pub fn from_voevent(mut core: NoticeCore, doc: &VoEventDoc) -> Result<(NoticeCore, NoticeKind), ClassifyError> {
    core.event_type = EventType::Nu;
    core.event_time = doc.event_time;
    let subtype = IceCubeSubtype::from_ivorn(&core.ivorn);
    core.type_ = match subtype {
        IceCubeSubtype::AstrotrackGold => "ASTROTRACK_GOLD".to_string(),
        IceCubeSubtype::AstrotrackBronze => "ASTROTRACK_BRONZE".to_string(),
        IceCubeSubtype::Cascade => "CASCADE".to_string(),
    };
    core.event_id = param_value(doc, "event_id").or_else(|| param_value(doc, "AMON_ID"));

    if let Some((ra, dec)) = doc.position {
        core.position = Some(Position { ra_deg: ra, dec_deg: dec });
    }
    let stat_err = doc.position_error_deg.unwrap_or(0.0);
    core.position_error_deg = Some(combine_quadrature(stat_err, subtype.systematic_err_deg()));
    core.skymap_url = param_value(doc, "skymap_fits");

    Ok((
        core,
        NoticeKind::IceCube(IceCubeExt {
            subtype,
            signalness: param_f64(doc, "signalness"),
            far: param_f64(doc, "FAR"),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::{EventType, Role};
    use chrono::Utc;

    fn core_fixture(ivorn: &str) -> NoticeCore {
        NoticeCore {
            ivorn: ivorn.to_string(),
            source: "AMON".to_string(),
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

    #[test]
    fn gold_subtype_gets_systematic_error() {
        let mut doc = VoEventDoc::default();
        doc.position_error_deg = Some(0.1);
        let (core, kind) =
            from_voevent(core_fixture("ivo://nasa.gsfc.gcn/AMON#ICECUBE_ASTROTRACK_GOLD_12345"), &doc).unwrap();
        let expected = combine_quadrature(0.1, ICECUBE_SYSTEMATIC_ERR_DEG);
        assert!((core.position_error_deg.unwrap() - expected).abs() < 1e-9);
        match kind {
            NoticeKind::IceCube(ext) => {
                assert_eq!(ext.subtype.strategy_key(), "NU_ICECUBE_GOLD");
            }
            _ => panic!("expected IceCube"),
        }
    }

    #[test]
    fn cascade_subtype_has_no_systematic_error() {
        let mut doc = VoEventDoc::default();
        doc.position_error_deg = Some(0.3);
        let (core, _) =
            from_voevent(core_fixture("ivo://nasa.gsfc.gcn/AMON#ICECUBE_CASCADE_999"), &doc).unwrap();
        assert_eq!(core.position_error_deg, Some(0.3));
    }

    #[test]
    fn bronze_subtype_detected_from_ivorn() {
        let doc = VoEventDoc::default();
        let (_, kind) =
            from_voevent(core_fixture("ivo://nasa.gsfc.gcn/AMON#ICECUBE_ASTROTRACK_BRONZE_1"), &doc).unwrap();
        match kind {
            NoticeKind::IceCube(ext) => assert_eq!(ext.subtype.strategy_key(), "NU_ICECUBE_BRONZE"),
            _ => panic!("expected IceCube"),
        }
    }
}
