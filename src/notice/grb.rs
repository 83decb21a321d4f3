//! Gamma-ray burst notices from Fermi-GBM and Swift-BAT (spec §3, §4.2,
//! §4.5). Both constructors normalize position error by combining the
//! reported statistical error with a fixed per-instrument systematic term;
//! only Fermi's strategy decision needs the skymap itself.

use super::voevent::VoEventDoc;
use super::{ClassifyError, EventType, NoticeCore, NoticeKind, Position};
use crate::skymap::SkyMap;

/// Fermi-GBM's combined systematic error, added in quadrature to the
/// reported statistical error (spec §3, "Fermi: 5.6°").
pub const FERMI_SYSTEMATIC_ERR_DEG: f64 = 5.6;

#[derive(Debug, Clone)]
pub struct FermiExt {
    /// The official HEALPix skymap URL guessed from `LightCurve_URL` (spec
    /// §4.2), when that param was present.
    pub guessed_skymap_url: Option<String>,
}

impl FermiExt {
    /// `GRB_FERMI_NARROW` if the 68% contour is tighter than 100 deg², else
    /// `GRB_FERMI_WIDE` (spec §4.5).
    pub fn decide_strategy_key(&self, skymap: &SkyMap) -> String {
        if skymap.contour_area(0.68) < 100.0 {
            "GRB_FERMI_NARROW".to_string()
        } else {
            "GRB_FERMI_WIDE".to_string()
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

fn combine_quadrature(stat: f64, systematic: f64) -> f64 {
    (stat * stat + systematic * systematic).sqrt()
}

/// Guess the official HEALPix skymap URL from the light curve URL (spec
/// §4.2): `lc_medres34 -> healpix_all`, `.gif -> .fit`. Fragile by design
/// (spec §9 open question c) — a wrong guess either 404s (handled by the
/// Fermi follow-up task, §4.9) or returns an unrelated FITS file, which this
/// crate cannot detect.
pub fn guess_skymap_url(lightcurve_url: &str) -> Option<String> {
    if !lightcurve_url.contains("lc_medres34") {
        return None;
    }
    Some(
        lightcurve_url
            .replace("lc_medres34", "healpix_all")
            .replace(".gif", ".fit"),
    )
}

pub fn fermi_from_voevent(mut core: NoticeCore, doc: &VoEventDoc) -> Result<(NoticeCore, NoticeKind), ClassifyError> {
    core.event_type = EventType::Grb;
    core.event_time = doc.event_time;
    core.type_ = param_value(doc, "Packet_Type")
        .unwrap_or_else(|| "GBM_FIN_POS".to_string());
    core.event_id = param_value(doc, "TrigID").or_else(|| param_value(doc, "GCN_Notice_ID"));

    if let Some((ra, dec)) = doc.position {
        core.position = Some(Position { ra_deg: ra, dec_deg: dec });
    }
    let stat_err = doc.position_error_deg.unwrap_or(0.0);
    core.position_error_deg = Some(combine_quadrature(stat_err, FERMI_SYSTEMATIC_ERR_DEG));

    let guessed = param_value(doc, "LightCurve_URL").and_then(|url| guess_skymap_url(&url));
    core.skymap_url = guessed.clone();

    Ok((
        core,
        NoticeKind::Fermi(FermiExt {
            guessed_skymap_url: guessed,
        }),
    ))
}

pub fn swift_from_voevent(mut core: NoticeCore, doc: &VoEventDoc) -> Result<(NoticeCore, NoticeKind), ClassifyError> {
    if param_value(doc, "StarTrack_Lost_Lock")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false)
    {
        return Err(ClassifyError::InvalidNotice {
            source: "Swift".to_string(),
            reason: "StarTrack_Lost_Lock".to_string(),
        });
    }

    core.event_type = EventType::Grb;
    core.event_time = doc.event_time;
    core.type_ = param_value(doc, "Packet_Type").unwrap_or_else(|| "BAT_GRB_Pos".to_string());
    core.event_id = param_value(doc, "TrigID").or_else(|| param_value(doc, "GCN_Notice_ID"));

    if let Some((ra, dec)) = doc.position {
        core.position = Some(Position { ra_deg: ra, dec_deg: dec });
    }
    // Swift carries no additional systematic term (spec §3, "others: 0°").
    core.position_error_deg = doc.position_error_deg.or(Some(0.0));
    core.skymap_url = param_value(doc, "skymap_fits");

    let _ = param_f64(doc, "Burst_Inten");
    Ok((core, NoticeKind::Swift))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::voevent::ParamValue;
    use crate::notice::{EventType, Role};
    use chrono::Utc;

    fn core_fixture(source: &str) -> NoticeCore {
        NoticeCore {
            ivorn: format!("ivo://nasa.gsfc.gcn/{source}#1"),
            source: source.to_string(),
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
    fn fermi_combines_systematic_error() {
        let mut doc = VoEventDoc::default();
        doc.position = Some((10.0, 20.0));
        doc.position_error_deg = Some(3.0);
        let (core, _) = fermi_from_voevent(core_fixture("Fermi"), &doc).unwrap();
        let expected = combine_quadrature(3.0, FERMI_SYSTEMATIC_ERR_DEG);
        assert!((core.position_error_deg.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn fermi_guesses_skymap_url_from_lightcurve() {
        let mut doc = VoEventDoc::default();
        doc.top_params.insert(
            "LightCurve_URL".to_string(),
            ParamValue {
                value: "https://heasarc.gsfc.nasa.gov/FTP/fermi/data/gbm/bn12345_lc_medres34.gif".to_string(),
                unit: None,
                ucd: None,
            },
        );
        let (core, kind) = fermi_from_voevent(core_fixture("Fermi"), &doc).unwrap();
        assert_eq!(
            core.skymap_url.as_deref(),
            Some("https://heasarc.gsfc.nasa.gov/FTP/fermi/data/gbm/bn12345_healpix_all.fit")
        );
        assert!(matches!(kind, NoticeKind::Fermi(_)));
    }

    #[test]
    fn fermi_without_lightcurve_param_has_no_guessed_url() {
        let doc = VoEventDoc::default();
        let (core, _) = fermi_from_voevent(core_fixture("Fermi"), &doc).unwrap();
        assert!(core.skymap_url.is_none());
    }

    #[test]
    fn swift_zero_systematic_error() {
        let mut doc = VoEventDoc::default();
        doc.position_error_deg = Some(0.05);
        let (core, kind) = swift_from_voevent(core_fixture("Swift"), &doc).unwrap();
        assert_eq!(core.position_error_deg, Some(0.05));
        assert!(matches!(kind, NoticeKind::Swift));
    }

    #[test]
    fn swift_lost_lock_is_invalid() {
        let mut doc = VoEventDoc::default();
        doc.top_params.insert(
            "StarTrack_Lost_Lock".to_string(),
            ParamValue {
                value: "true".to_string(),
                unit: None,
                ucd: None,
            },
        );
        let err = swift_from_voevent(core_fixture("Swift"), &doc).unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidNotice { .. }));
    }

    #[test]
    fn fermi_event_time_propagated_from_doc() {
        let mut doc = VoEventDoc::default();
        doc.event_time = Some(Utc::now());
        let (core, _) = fermi_from_voevent(core_fixture("Fermi"), &doc).unwrap();
        assert_eq!(core.event_time, doc.event_time);
    }
}
