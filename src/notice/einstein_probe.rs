//! Einstein Probe X-ray transient notices (spec §3, §4.5: fixed strategy
//! key `GRB_OTHER`, no instrument-specific systematic error term).

use super::voevent::VoEventDoc;
use super::{ClassifyError, EventType, NoticeCore, NoticeKind, Position};

fn param_value(doc: &VoEventDoc, name: &str) -> Option<String> {
    if let Some(p) = doc.top_params.get(name) {
        return Some(p.value.clone());
    }
    doc.group_params
        .values()
        .find_map(|g| g.params.get(name).map(|p| p.value.clone()))
}

pub fn from_voevent(mut core: NoticeCore, doc: &VoEventDoc) -> Result<(NoticeCore, NoticeKind), ClassifyError> {
    core.event_type = EventType::Grb;
    core.event_time = doc.event_time;
    core.type_ = param_value(doc, "Packet_Type").unwrap_or_else(|| "EP_WXT".to_string());
    core.event_id = param_value(doc, "TrigID").or_else(|| param_value(doc, "ep_id"));

    if let Some((ra, dec)) = doc.position {
        core.position = Some(Position { ra_deg: ra, dec_deg: dec });
    }
    // No combined systematic term (spec §3, "others: 0°").
    core.position_error_deg = doc.position_error_deg.or(Some(0.0));
    core.skymap_url = param_value(doc, "skymap_fits");

    Ok((core, NoticeKind::EinsteinProbe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::{EventType, Role};
    use chrono::Utc;

    #[test]
    fn einstein_probe_classifies_as_generic_grb_kind() {
        let mut doc = VoEventDoc::default();
        doc.position = Some((55.0, -30.0));
        let core = NoticeCore {
            ivorn: "ivo://nasa.gsfc.gcn/EP#1".to_string(),
            source: "EinsteinProbe".to_string(),
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
        assert_eq!(core.position.unwrap().ra_deg, 55.0);
        assert!(matches!(kind, NoticeKind::EinsteinProbe));
    }
}
