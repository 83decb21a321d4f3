//! VOEvent `What`/`WhereWhen` flattening, shared by every notice variant
//! constructor regardless of transport (XML packet or VOEvent-shaped JSON).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde_json::Value as JsonValue;

use super::DeserializeError;

/// A single `<Param>` element, flattened to its value plus the attributes
/// the decision rules care about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamValue {
    pub value: String,
    pub unit: Option<String>,
    pub ucd: Option<String>,
}

/// A `<Group>` element: its declared type plus the params nested inside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamGroup {
    pub group_type: Option<String>,
    pub params: HashMap<String, ParamValue>,
}

/// The flattened content of a VOEvent packet that every notice variant
/// constructor consumes.
#[derive(Debug, Clone, Default)]
pub struct VoEventDoc {
    pub ivorn: Option<String>,
    pub role: Option<String>,
    pub notice_time: Option<DateTime<Utc>>,
    /// The event's own timestamp, `WhereWhen/.../AstroCoords/Time/TimeInstant/ISOTime`
    /// — distinct from `notice_time` (the publisher's send time, `Who/Date`).
    pub event_time: Option<DateTime<Utc>>,
    pub top_params: HashMap<String, ParamValue>,
    pub group_params: HashMap<String, ParamGroup>,
    pub position: Option<(f64, f64)>,
    pub position_error_deg: Option<f64>,
}

/// Parse a raw VOEvent XML document (the legacy socket transport, and the
/// fallback trial after Avro/JSON have failed).
pub fn parse_xml(bytes: &[u8]) -> Result<VoEventDoc, DeserializeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| DeserializeError::Xml(format!("not valid utf-8: {e}")))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut doc = VoEventDoc::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current_group: Option<String> = None;
    let mut in_what = false;
    let mut in_wherewhen = false;
    let mut pending_text_target: Option<String> = None;
    let mut text_buf = String::new();
    let mut seen_top: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut seen_group: HashMap<String, std::collections::HashSet<String>> = HashMap::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| DeserializeError::Xml(e.to_string()))?;
        // Self-closing elements (`<Param .../>`, `<Group/>`) never produce a
        // matching `End`, so they must not be pushed onto the nesting stack
        // and any state they opened (What/WhereWhen/Group) must close again
        // immediately — otherwise the stack desynchronizes from the next
        // real `End` event.
        let self_closing = matches!(event, Event::Empty(_));
        match event {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => {
                let name = local_name(e.name().as_ref());

                match name.as_str() {
                    "VOEvent" => {
                        for attr in e.attributes().flatten() {
                            let key = local_name(attr.key.as_ref());
                            let val = String::from_utf8_lossy(&attr.value).to_string();
                            match key.as_str() {
                                "ivorn" => doc.ivorn = Some(val),
                                "role" => doc.role = Some(val),
                                _ => {}
                            }
                        }
                    }
                    "What" => in_what = true,
                    "WhereWhen" => in_wherewhen = true,
                    "Group" if in_what => {
                        let mut group_name = None;
                        let mut group_type = None;
                        for attr in e.attributes().flatten() {
                            let key = local_name(attr.key.as_ref());
                            let val = String::from_utf8_lossy(&attr.value).to_string();
                            match key.as_str() {
                                "name" => group_name = Some(val),
                                "type" => group_type = Some(val),
                                _ => {}
                            }
                        }
                        let group_name = group_name.unwrap_or_else(|| "default".to_string());
                        doc.group_params
                            .entry(group_name.clone())
                            .or_insert_with(|| ParamGroup {
                                group_type,
                                params: HashMap::new(),
                            });
                        current_group = Some(group_name);
                    }
                    "Param" if in_what => {
                        let mut name = None;
                        let mut value = String::new();
                        let mut unit = None;
                        let mut ucd = None;
                        for attr in e.attributes().flatten() {
                            let key = local_name(attr.key.as_ref());
                            let val = String::from_utf8_lossy(&attr.value).to_string();
                            match key.as_str() {
                                "name" => name = Some(val),
                                "value" => value = val,
                                "unit" => unit = Some(val),
                                "ucd" => ucd = Some(val),
                                _ => {}
                            }
                        }
                        if let Some(name) = name {
                            let param = ParamValue { value, unit, ucd };
                            if let Some(group_name) = &current_group {
                                let seen = seen_group.entry(group_name.clone()).or_default();
                                if !seen.insert(name.clone()) {
                                    return Err(DeserializeError::DuplicateParam {
                                        scope: group_name.clone(),
                                        name,
                                    });
                                }
                                if let Some(group) = doc.group_params.get_mut(group_name) {
                                    group.params.insert(name, param);
                                }
                            } else {
                                if !seen_top.insert(name.clone()) {
                                    return Err(DeserializeError::DuplicateParam {
                                        scope: "top".to_string(),
                                        name,
                                    });
                                }
                                doc.top_params.insert(name, param);
                            }
                        }
                    }
                    "Date" if stack.iter().any(|s| s == "Who") => {
                        pending_text_target = Some("date".to_string());
                        text_buf.clear();
                    }
                    "C1" if in_wherewhen => {
                        pending_text_target = Some("c1".to_string());
                        text_buf.clear();
                    }
                    "C2" if in_wherewhen => {
                        pending_text_target = Some("c2".to_string());
                        text_buf.clear();
                    }
                    "Error2Radius" if in_wherewhen => {
                        pending_text_target = Some("err".to_string());
                        text_buf.clear();
                    }
                    "ISOTime" if in_wherewhen => {
                        pending_text_target = Some("isotime".to_string());
                        text_buf.clear();
                    }
                    _ => {}
                }

                if self_closing {
                    if name == "What" {
                        in_what = false;
                    }
                    if name == "WhereWhen" {
                        in_wherewhen = false;
                    }
                    if name == "Group" {
                        current_group = None;
                    }
                } else {
                    stack.push(name);
                }
            }
            Event::Text(t) => {
                if pending_text_target.is_some() {
                    text_buf.push_str(&t.unescape().unwrap_or_default());
                }
            }
            Event::End(e) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "What" => in_what = false,
                    "WhereWhen" => in_wherewhen = false,
                    "Group" => current_group = None,
                    "Date" => {
                        if pending_text_target.as_deref() == Some("date") {
                            if let Ok(dt) = DateTime::parse_from_rfc3339(text_buf.trim()) {
                                doc.notice_time = Some(dt.with_timezone(&Utc));
                            }
                            pending_text_target = None;
                        }
                    }
                    "C1" => {
                        if pending_text_target.as_deref() == Some("c1") {
                            let ra: f64 = text_buf.trim().parse().unwrap_or_default();
                            let (_, dec) = doc.position.unwrap_or((0.0, 0.0));
                            doc.position = Some((ra, dec));
                            pending_text_target = None;
                        }
                    }
                    "C2" => {
                        if pending_text_target.as_deref() == Some("c2") {
                            let dec: f64 = text_buf.trim().parse().unwrap_or_default();
                            let (ra, _) = doc.position.unwrap_or((0.0, 0.0));
                            doc.position = Some((ra, dec));
                            pending_text_target = None;
                        }
                    }
                    "Error2Radius" => {
                        if pending_text_target.as_deref() == Some("err") {
                            doc.position_error_deg = text_buf.trim().parse().ok();
                            pending_text_target = None;
                        }
                    }
                    "ISOTime" => {
                        if pending_text_target.as_deref() == Some("isotime") {
                            if let Ok(dt) = DateTime::parse_from_rfc3339(text_buf.trim()) {
                                doc.event_time = Some(dt.with_timezone(&Utc));
                            }
                            pending_text_target = None;
                        }
                    }
                    _ => {}
                }
                stack.pop();
            }
            _ => {}
        }
    }

    Ok(doc)
}

fn local_name(qname: &[u8]) -> String {
    let full = String::from_utf8_lossy(qname);
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

/// Flatten a VOEvent-shaped JSON document (the newer Kafka "VOEvent-in-JSON"
/// packaging) the same way the XML parser does, so downstream code never
/// needs to know which transport produced the document.
pub fn parse_voevent_json(value: &JsonValue) -> Result<VoEventDoc, DeserializeError> {
    let mut doc = VoEventDoc::default();
    doc.ivorn = value
        .get("ivorn")
        .and_then(JsonValue::as_str)
        .map(String::from);
    doc.role = value
        .get("role")
        .and_then(JsonValue::as_str)
        .map(String::from);

    if let Some(date) = value
        .pointer("/Who/Date")
        .or_else(|| value.get("notice_time"))
        .and_then(JsonValue::as_str)
    {
        doc.notice_time = DateTime::parse_from_rfc3339(date)
            .ok()
            .map(|d| d.with_timezone(&Utc));
    }

    if let Some(iso_time) = value
        .pointer("/WhereWhen/ObsDataLocation/ObservationLocation/AstroCoords/Time/TimeInstant/ISOTime")
        .or_else(|| value.get("event_time"))
        .and_then(JsonValue::as_str)
    {
        doc.event_time = DateTime::parse_from_rfc3339(iso_time)
            .ok()
            .map(|d| d.with_timezone(&Utc));
    }

    if let Some(what) = value.get("What").and_then(JsonValue::as_object) {
        if let Some(params) = what.get("Param") {
            flatten_json_params(params, &mut doc.top_params, "top")?;
        }
        if let Some(groups) = what.get("Group") {
            let groups_iter: Vec<&JsonValue> = match groups {
                JsonValue::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for group in groups_iter {
                let name = group
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("default")
                    .to_string();
                let group_type = group
                    .get("type")
                    .and_then(JsonValue::as_str)
                    .map(String::from);
                let mut params = HashMap::new();
                if let Some(p) = group.get("Param") {
                    flatten_json_params(p, &mut params, &name)?;
                }
                doc.group_params
                    .insert(name, ParamGroup { group_type, params });
            }
        }
    }

    Ok(doc)
}

fn flatten_json_params(
    params: &JsonValue,
    out: &mut HashMap<String, ParamValue>,
    scope: &str,
) -> Result<(), DeserializeError> {
    let items: Vec<&JsonValue> = match params {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for item in items {
        let name = match item.get("name").and_then(JsonValue::as_str) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let value = item
            .get("value")
            .map(json_value_to_string)
            .unwrap_or_default();
        let unit = item
            .get("unit")
            .and_then(JsonValue::as_str)
            .map(String::from);
        let ucd = item
            .get("ucd")
            .and_then(JsonValue::as_str)
            .map(String::from);
        if out
            .insert(name.clone(), ParamValue { value, unit, ucd })
            .is_some()
        {
            return Err(DeserializeError::DuplicateParam {
                scope: scope.to_string(),
                name,
            });
        }
    }
    Ok(())
}

fn json_value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWIFT_SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<voe:VOEvent xmlns:voe="http://www.ivoa.net/xml/VOEvent/v2.0"
  ivorn="ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos_12345-678" role="observation">
  <Who><Date>2023-05-10T12:00:00</Date></Who>
  <What>
    <Param name="StarTrack_Lost_Lock" value="false"/>
    <Group name="Detection" type="Burst">
      <Param name="Packet_Type" value="61"/>
    </Group>
  </What>
  <WhereWhen>
    <ObsDataLocation>
      <ObservationLocation>
        <AstroCoords>
          <Time unit="s">
            <TimeInstant>
              <ISOTime>2023-05-10T11:58:30.12Z</ISOTime>
            </TimeInstant>
          </Time>
          <Position2D>
            <Value2><C1>123.4</C1><C2>-12.3</C2></Value2>
            <Error2Radius>0.05</Error2Radius>
          </Position2D>
        </AstroCoords>
      </ObservationLocation>
    </ObsDataLocation>
  </WhereWhen>
</voe:VOEvent>"#;

    #[test]
    fn parses_ivorn_role_and_top_params() {
        let doc = parse_xml(SWIFT_SAMPLE.as_bytes()).expect("parse");
        assert_eq!(
            doc.ivorn.as_deref(),
            Some("ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos_12345-678")
        );
        assert_eq!(doc.role.as_deref(), Some("observation"));
        assert_eq!(
            doc.top_params.get("StarTrack_Lost_Lock").map(|p| p.value.as_str()),
            Some("false")
        );
    }

    #[test]
    fn parses_group_params_and_position() {
        let doc = parse_xml(SWIFT_SAMPLE.as_bytes()).expect("parse");
        let group = doc.group_params.get("Detection").expect("group present");
        assert_eq!(group.group_type.as_deref(), Some("Burst"));
        assert_eq!(
            group.params.get("Packet_Type").map(|p| p.value.as_str()),
            Some("61")
        );
        assert_eq!(doc.position, Some((123.4, -12.3)));
        assert_eq!(doc.position_error_deg, Some(0.05));
    }

    #[test]
    fn parses_event_time_from_isotime() {
        let doc = parse_xml(SWIFT_SAMPLE.as_bytes()).expect("parse");
        assert_eq!(
            doc.event_time,
            Some(
                DateTime::parse_from_rfc3339("2023-05-10T11:58:30.12Z")
                    .unwrap()
                    .with_timezone(&Utc)
            )
        );
    }

    #[test]
    fn rejects_duplicate_top_level_param() {
        let xml = SWIFT_SAMPLE.replace(
            r#"<Param name="StarTrack_Lost_Lock" value="false"/>"#,
            r#"<Param name="StarTrack_Lost_Lock" value="false"/><Param name="StarTrack_Lost_Lock" value="true"/>"#,
        );
        let err = parse_xml(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, DeserializeError::DuplicateParam { .. }));
    }
}
