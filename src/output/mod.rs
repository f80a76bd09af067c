use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::drivers::{props, AnalyzeReport};
use crate::meters::Meter;
use crate::telegram::{media_name, Telegram};
use crate::units::Unit;

/// What the decoder side hands over to the printer task.
#[derive(Debug)]
pub enum Transmission {
    Update(MeterUpdate),
    Shutdown,
}

/// One rendered meter update, ready for any of the output formats.
#[derive(Debug)]
pub struct MeterUpdate {
    pub meter_name: String,
    pub json: Map<String, Value>,
    pub fields_line: String,
    pub hr_line: String,
    pub envs: Vec<(String, String)>,
    pub shell: Option<String>,
}

/// Output format selected by the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Hr,
    Json,
    Fields,
}

impl Format {
    pub fn parse(s: &str) -> Option<Format> {
        match s {
            "hr" => Some(Format::Hr),
            "json" => Some(Format::Json),
            "fields" => Some(Format::Fields),
            _ => None,
        }
    }
}

/// Time-like numeric values render as strings in all outputs.
pub fn format_time_value(v: f64, unit: Unit) -> String {
    let dt = DateTime::<Utc>::from_timestamp(v as i64, 0);
    let Some(dt) = dt else { return "null".to_string() };
    match unit {
        Unit::DateLT => dt.format("%Y-%m-%d").to_string(),
        Unit::DateTimeLT | Unit::DateTimeUTC => dt.format("%Y-%m-%d %H:%M").to_string(),
        Unit::TimeLT => dt.format("%H:%M").to_string(),
        _ => format!("{}", v as i64),
    }
}

fn is_time_unit(unit: Unit) -> bool {
    matches!(unit, Unit::DateLT | Unit::DateTimeLT | Unit::DateTimeUTC | Unit::TimeLT)
}

fn numeric_json(v: f64) -> Value {
    if v.is_nan() || v.is_infinite() {
        return Value::Null;
    }
    if v.fract() == 0.0 && v.abs() < 9e15 {
        return Value::from(v as i64);
    }
    Value::from(v)
}

fn hidden(m: &Meter, name: &str) -> bool {
    m.driver
        .fields
        .iter()
        .any(|f| f.expand_vname(None) == name && f.props & props::HIDE != 0)
}

/// The json document: the reserved keys media/meter/name/id/timestamp plus
/// one key per extracted field, numeric keys suffixed with their display
/// unit.
pub fn render_json(m: &Meter, t: &Telegram) -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert("media".to_string(), Value::from(media_name(t.dll_media)));
    doc.insert("meter".to_string(), Value::from(m.driver.name));
    doc.insert("name".to_string(), Value::from(m.name.clone()));
    doc.insert("id".to_string(), Value::from(t.dll_id.clone()));

    for (name, nv) in m.numeric_values() {
        if hidden(m, name) {
            continue;
        }
        let key = format!("{}_{}", name, nv.unit.suffix());
        if is_time_unit(nv.unit) {
            doc.insert(key, Value::from(format_time_value(nv.value, nv.unit)));
        } else {
            doc.insert(key, numeric_json(nv.value));
        }
    }
    for (name, s) in m.string_values() {
        if hidden(m, name) {
            continue;
        }
        doc.insert(name.clone(), Value::from(s.clone()));
    }
    for (k, v) in &m.extra_constant_fields {
        doc.insert(k.clone(), Value::from(v.clone()));
    }

    doc.insert(
        "timestamp".to_string(),
        Value::from(t.about.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    if t.about.rssi_dbm != 0 {
        doc.insert("rssi_dbm".to_string(), Value::from(t.about.rssi_dbm));
    }
    doc
}

/// Resolve one selected field name against the meter state.
fn field_value(m: &Meter, t: &Telegram, name: &str) -> Option<String> {
    match name {
        "name" => return Some(m.name.clone()),
        "id" => return Some(t.dll_id.clone()),
        "media" => return Some(media_name(t.dll_media).to_string()),
        "meter" => return Some(m.driver.name.to_string()),
        "timestamp" => {
            return Some(t.about.timestamp.format("%Y-%m-%d %H:%M.%S").to_string())
        }
        _ => {}
    }
    if let Some(s) = m.string_value(name) {
        return Some(s.to_string());
    }
    /* Numeric fields are selected with their unit suffix. */
    for (vname, nv) in m.numeric_values() {
        let with_suffix = format!("{}_{}", vname, nv.unit.suffix());
        if with_suffix == name || vname == name {
            if is_time_unit(nv.unit) {
                return Some(format_time_value(nv.value, nv.unit));
            }
            if nv.value.is_nan() {
                return None;
            }
            let v = numeric_json(nv.value);
            return Some(v.to_string());
        }
    }
    for (k, v) in &m.extra_constant_fields {
        if k == name {
            return Some(v.clone());
        }
    }
    None
}

/// The delimited output: selected fields in order, missing values are null.
pub fn render_fields(m: &Meter, t: &Telegram, separator: char) -> String {
    let selection: Vec<String> = if m.selected_fields.is_empty() {
        m.driver.default_fields.split(',').map(|s| s.to_string()).collect()
    } else {
        m.selected_fields.clone()
    };
    let mut cols = Vec::new();
    for name in &selection {
        cols.push(field_value(m, t, name).unwrap_or_else(|| "null".to_string()));
    }
    cols.join(&separator.to_string())
}

/// The human readable one liner.
pub fn render_hr(m: &Meter, t: &Telegram) -> String {
    let mut parts = vec![m.name.clone(), t.dll_id.clone()];
    for f in &m.driver.fields {
        if f.props & props::IMPORTANT == 0 {
            continue;
        }
        let name = f.expand_vname(None);
        if let Some(nv) = m.numeric_value(&name) {
            if is_time_unit(nv.unit) {
                parts.push(format_time_value(nv.value, nv.unit));
            } else {
                parts.push(format!("{} {}", nv.value, nv.unit.suffix()));
            }
        } else if let Some(s) = m.string_value(&name) {
            parts.push(s.to_string());
        }
    }
    parts.push(t.about.timestamp.format("%Y-%m-%d %H:%M.%S").to_string());
    parts.join(" ")
}

/// Environment variables for telegram-triggered shell commands: every json
/// key uppercased with a METER_ prefix, plus the whole document.
pub fn shell_envs(json: &Map<String, Value>) -> Vec<(String, String)> {
    let mut envs = Vec::new();
    envs.push(("METER_JSON".to_string(), Value::Object(json.clone()).to_string()));
    for (k, v) in json {
        let value = match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        envs.push((format!("METER_{}", k.to_uppercase()), value));
    }
    envs
}

pub fn build_update(m: &Meter, t: &Telegram) -> MeterUpdate {
    let json = render_json(m, t);
    let envs = shell_envs(&json);
    MeterUpdate {
        meter_name: m.name.clone(),
        fields_line: render_fields(m, t, ';'),
        hr_line: render_hr(m, t),
        json,
        envs,
        shell: m.shell.clone(),
    }
}

/// The analyze mode report, comparing auto detected, best scoring and the
/// driver actually in use.
pub fn render_analyze(r: &AnalyzeReport) -> String {
    let mut out = String::new();
    out += &format!(
        "Auto driver  : {}\n",
        r.auto_detected.unwrap_or("not found!")
    );
    out += &format!(
        "Best driver  : {} {:02.1}%\n",
        r.best.unwrap_or("none"),
        r.best_score * 100.0
    );
    out += &format!("Using driver : {} {:02.1}%\n", r.using, r.using_score * 100.0);
    for s in &r.scores {
        out += &format!("{:20} {:02.1}%\n", s.name, s.ratio() * 100.0);
    }
    out += &serde_json::to_string_pretty(&Value::Object(r.rendered.clone())).unwrap_or_default();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressExpression;
    use crate::drivers::find_driver;
    use crate::telegram::{self, AboutTelegram};

    fn meter_and_telegram() -> (Meter, Telegram) {
        let d = find_driver("multical603").unwrap();
        let mut m = Meter::new("Heat", d, vec![AddressExpression::parse("36363636").unwrap()], None);
        let frame = hex::decode(
            "42442D2C3636363635048D20E18025B62087D0780406A500000004FF072B01000004FF089C000000041421020000043B120000000259D014025D000904FF2200000000",
        ).unwrap();
        let mut t = telegram::parse(&frame, AboutTelegram::new("im871a", -71), None, false).unwrap();
        m.process_telegram(&mut t);
        (m, t)
    }

    #[test]
    fn json_has_reserved_keys_and_unit_suffixes() {
        let (m, t) = meter_and_telegram();
        let doc = render_json(&m, &t);
        assert_eq!(doc["media"], "heat");
        assert_eq!(doc["meter"], "multical603");
        assert_eq!(doc["name"], "Heat");
        assert_eq!(doc["id"], "36363636");
        assert_eq!(doc["total_energy_consumption_kwh"], 165);
        assert_eq!(doc["total_volume_m3"], 5.45);
        assert_eq!(doc["t1_temperature_c"], 53.28);
        assert_eq!(doc["status"], "OK");
        assert_eq!(doc["current_status"], "");
        assert!(doc.contains_key("timestamp"));
    }

    #[test]
    fn fields_line_follows_default_selection() {
        let (m, t) = meter_and_telegram();
        let line = render_fields(&m, &t, ';');
        let cols: Vec<&str> = line.split(';').collect();
        assert_eq!(cols[0], "Heat");
        assert_eq!(cols[1], "36363636");
        assert_eq!(cols[2], "165");
        assert_eq!(cols[3], "5.45");
        /* volume_flow_m3h then temperatures then empty current_status. */
        assert_eq!(cols[4], "0.018");
        assert_eq!(cols[7], "");
    }

    #[test]
    fn missing_numeric_becomes_null() {
        let d = find_driver("waterstarm").unwrap();
        let mut m = Meter::new("W", d, vec![AddressExpression::parse("*").unwrap()], None);
        m.selected_fields = vec!["name".to_string(), "total_m3".to_string()];
        let frame = hex::decode(
            "2E44FA129999551100077A070020252F2F046D0F28C22404139540000002FD17000001FD481D2F2F2F2F2F2F2F2F2F",
        ).unwrap();
        let mut t = telegram::parse(&frame, AboutTelegram::new("t", -70), None, false).unwrap();
        m.process_telegram(&mut t);
        assert_eq!(render_fields(&m, &t, ';'), "W;16.533");

        let mut empty = Meter::new("W2", d, vec![AddressExpression::parse("*").unwrap()], None);
        empty.selected_fields = vec!["name".to_string(), "total_m3".to_string()];
        /* No telegram processed for this one, the value is missing. */
        assert_eq!(render_fields(&empty, &t, ';'), "W2;null");
    }

    #[test]
    fn shell_envs_prefix_and_uppercase() {
        let (m, t) = meter_and_telegram();
        let doc = render_json(&m, &t);
        let envs = shell_envs(&doc);
        assert!(envs.iter().any(|(k, _)| k == "METER_JSON"));
        assert!(envs.iter().any(|(k, v)| k == "METER_ID" && v == "36363636"));
        assert!(envs
            .iter()
            .any(|(k, v)| k == "METER_TOTAL_ENERGY_CONSUMPTION_KWH" && v == "165"));
    }
}
