//! GECAM (Gravitational wave high-energy Electromagnetic Counterpart All-sky
//! Monitor) gamma-ray burst notices (spec §3, §4.5: fixed strategy key
//! `GRB_OTHER`, no instrument-specific systematic error term).

use super::voevent::VoEventDoc;
use super::{ClassifyError, EventType, NoticeCore, NoticeKind, Position};

#[derive(Debug, Clone, Default)]
pub struct GecamExt {
    pub instrument: Option<String>,
}

fn param_value(doc: &VoEventDoc, name: &str) -> Option<String> {
    if let Some(p) = doc.top_params.get(name) {
        return Some(p.value.clone());
    }
    doc.group_params
        .values()
        .find_map(|g| g.params.get(name).map(|p| p.value.clone()))
}

pub fn from_voevent(mut core: NoticeCore, doc: &VoEventDoc) -> Result<(NoticeCore, NoticeKind), ClassifyError> {
    if let Some(src_class) = param_value(doc, "SRC_CLASS") {
        if src_class != "GRB" {
            return Err(ClassifyError::InvalidNotice {
                source: "GECAM".to_string(),
                reason: format!("SRC_CLASS={src_class}"),
            });
        }
    }

    core.event_type = EventType::Grb;
    core.event_time = doc.event_time;
    core.type_ = param_value(doc, "Packet_Type").unwrap_or_else(|| "GECAM_FLT".to_string());
    core.event_id = param_value(doc, "TrigID").or_else(|| param_value(doc, "burst_id"));

    if let Some((ra, dec)) = doc.position {
        core.position = Some(Position { ra_deg: ra, dec_deg: dec });
    }
    // No combined systematic term for GECAM (spec §3, "others: 0°").
    core.position_error_deg = doc.position_error_deg.or(Some(0.0));
    core.skymap_url = param_value(doc, "skymap_fits");

    Ok((
        core,
        NoticeKind::Gecam(GecamExt {
            instrument: param_value(doc, "Instrument"),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::{EventType, Role};
    use chrono::Utc;

    #[test]
    fn gecam_has_no_systematic_error_added() {
        let mut doc = VoEventDoc::default();
        doc.position_error_deg = Some(1.2);
        let core = NoticeCore {
            ivorn: "ivo://nasa.gsfc.gcn/GECAM#1".to_string(),
            source: "GECAM".to_string(),
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
        };
        let (core, kind) = from_voevent(core, &doc).unwrap();
        assert_eq!(core.position_error_deg, Some(1.2));
        assert!(matches!(kind, NoticeKind::Gecam(_)));
    }

    #[test]
    fn non_grb_src_class_is_invalid() {
        let mut doc = VoEventDoc::default();
        doc.top_params.insert(
            "SRC_CLASS".to_string(),
            crate::notice::voevent::ParamValue {
                value: "SGR".to_string(),
                unit: None,
                ucd: None,
            },
        );
        let core = NoticeCore {
            ivorn: "ivo://nasa.gsfc.gcn/GECAM#1".to_string(),
            source: "GECAM".to_string(),
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
        };
        let err = from_voevent(core, &doc).unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidNotice { .. }));
    }
}
