use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc::Sender;

use crate::address::AddressExpression;
use crate::drivers::{self, props, DriverInfo, FieldInfo, FieldKind, Translate, TranslateType};
use crate::output::{self, Transmission};
use crate::telegram::vif::vif_unit_and_factor;
use crate::telegram::{self, AboutTelegram, Telegram};
use crate::units::{convert, Quantity, Unit};

pub mod calculator;

use calculator::{CalcValue, FieldResolver};

/// A numeric reading: the magnitude in the field's display unit.
#[derive(Debug, Clone, Copy)]
pub struct NumericValue {
    pub value: f64,
    pub unit: Unit,
    pub quantity: Quantity,
}

/// A runtime binding between address expressions and a driver, holding the
/// latest extracted values.
pub struct Meter {
    pub name: String,
    pub driver: &'static DriverInfo,
    pub expressions: Vec<AddressExpression>,
    pub key: Option<Vec<u8>>,
    pub bus: String,
    pub poll_interval_s: Option<u64>,
    pub selected_fields: Vec<String>,
    /// Constant json_/field_ additions from the configuration.
    pub extra_constant_fields: Vec<(String, String)>,
    /// calculate_<name>_<unit> formulas from the configuration.
    pub extra_calculated_fields: Vec<(String, String)>,
    pub shell: Option<String>,
    pub alarm_shell: Option<String>,

    numeric_values: BTreeMap<String, NumericValue>,
    string_values: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub num_updates: u64,
}

impl Meter {
    pub fn new(
        name: &str,
        driver: &'static DriverInfo,
        expressions: Vec<AddressExpression>,
        key: Option<Vec<u8>>,
    ) -> Meter {
        Meter {
            name: name.to_string(),
            driver,
            expressions,
            key,
            bus: String::new(),
            poll_interval_s: None,
            selected_fields: Vec::new(),
            extra_constant_fields: Vec::new(),
            extra_calculated_fields: Vec::new(),
            shell: None,
            alarm_shell: None,
            numeric_values: BTreeMap::new(),
            string_values: BTreeMap::new(),
            updated_at: None,
            num_updates: 0,
        }
    }

    /// A throwaway meter used by analyze mode.
    pub fn for_analysis(driver: &'static DriverInfo) -> Meter {
        let exprs = vec![AddressExpression::parse("*").unwrap()];
        Meter::new("analysis", driver, exprs, None)
    }

    pub fn set_numeric_value(&mut self, name: &str, unit: Unit, value: f64) {
        let quantity = self
            .driver
            .fields
            .iter()
            .find(|f| f.expand_vname(None) == name || f.vname == name)
            .map(|f| f.quantity)
            .unwrap_or(Quantity::Dimensionless);
        self.numeric_values
            .insert(name.to_string(), NumericValue { value, unit, quantity });
    }

    pub fn set_string_value(&mut self, name: &str, value: &str) {
        self.string_values.insert(name.to_string(), value.to_string());
    }

    pub fn numeric_value(&self, name: &str) -> Option<&NumericValue> {
        self.numeric_values.get(name)
    }

    pub fn string_value(&self, name: &str) -> Option<&str> {
        self.string_values.get(name).map(|s| s.as_str())
    }

    pub fn numeric_values(&self) -> &BTreeMap<String, NumericValue> {
        &self.numeric_values
    }

    pub fn string_values(&self) -> &BTreeMap<String, String> {
        &self.string_values
    }

    /// Run the full extraction pipeline for one telegram: the driver hook,
    /// the declarative extractors, status joining and calculated fields.
    pub fn process_telegram(&mut self, t: &mut Telegram) {
        if let Some(hook) = self.driver.process_content {
            hook(self, t);
        }

        let mut written: Vec<String> = Vec::new();
        let fields = self.driver.fields.clone();
        for f in &fields {
            let Some(matcher) = &f.matcher else { continue };
            /* One extractor may feed many fields through counter
               placeholders, so keep scanning after the first hit. The
               first matching entry wins for any given expanded name. */
            let matching: Vec<usize> = t
                .dv_entries
                .iter()
                .enumerate()
                .filter(|(_, e)| matcher.matches(e))
                .map(|(i, _)| i)
                .collect();
            for i in matching {
                let e = t.dv_entries[i].clone();
                let name = f.expand_vname(Some(&e));
                if written.contains(&name) {
                    continue;
                }
                if f.formula.is_some() {
                    /* Calculated fields run after extraction. */
                    continue;
                }
                if self.extract_field(f, &name, &e) {
                    written.push(name);
                    if t.understood_offsets.insert(e.offset) {
                        t.understood += e.total_len;
                    }
                }
            }
        }

        self.join_status_fields(t);
        self.run_calculated_fields(t);

        self.updated_at = Some(t.about.timestamp);
        self.num_updates += 1;
    }

    fn extract_field(&mut self, f: &FieldInfo, name: &str, e: &telegram::DVEntry) -> bool {
        match f.kind {
            FieldKind::Numeric => {
                if f.quantity == Quantity::PointInTime {
                    let Some(ts) = e.as_unix_ts() else { return false };
                    self.numeric_values.insert(
                        name.to_string(),
                        NumericValue { value: ts as f64, unit: f.display_unit, quantity: f.quantity },
                    );
                    return true;
                }
                let Some(raw) = e.as_f64(f.vif_scaling.is_signed()) else {
                    return false;
                };
                let value = if f.vif_scaling.is_auto() {
                    match vif_unit_and_factor(e.vif) {
                        Some((vunit, factor)) => convert(raw * factor, vunit, f.display_unit)
                            .unwrap_or(f64::NAN),
                        None => raw,
                    }
                } else {
                    raw
                };
                self.numeric_values.insert(
                    name.to_string(),
                    NumericValue { value, unit: f.display_unit, quantity: f.quantity },
                );
                true
            }
            FieldKind::String => {
                let value = if let Some(lookup) = &f.lookup {
                    let Some(raw) = e.as_f64(false) else { return false };
                    lookup.apply(raw as u64)
                } else if e.vif == 0x6c || e.vif == 0x6d {
                    match e.as_date_string() {
                        Some(s) => s,
                        None => return false,
                    }
                } else if e.dif_lo == 0xd {
                    e.as_text()
                } else {
                    e.as_hex_string()
                };
                self.string_values.insert(name.to_string(), value);
                true
            }
        }
    }

    /// Status fields merge their own lookup result with the decoded tpl
    /// status byte and every JOIN_INTO_STATUS field, deduplicated and
    /// collapsed to "OK" when nothing is wrong.
    fn join_status_fields(&mut self, t: &Telegram) {
        let tpl_status = t.tpl_status();
        let mut tpl_tokens = telegram::decode_tpl_status_standard_bits(tpl_status);
        let mfct_table = self.driver.mfct_tpl_status.clone().unwrap_or(Translate {
            name: "TPL_MFCT",
            ttype: TranslateType::BitToString,
            mask: 0xe0,
            default: "",
            entries: vec![],
        });
        let mfct = mfct_table.apply(tpl_status as u64);
        tpl_tokens.extend(tokenize_status(&mfct));

        let join_into: Vec<String> = self
            .driver
            .fields
            .iter()
            .filter(|f| f.props & props::JOIN_INTO_STATUS != 0)
            .filter_map(|f| self.string_values.get(&f.expand_vname(None)).cloned())
            .flat_map(|v| tokenize_status(&v))
            .collect();

        let status_fields: Vec<FieldInfo> = self
            .driver
            .fields
            .iter()
            .filter(|f| f.props & props::STATUS != 0)
            .cloned()
            .collect();
        for f in status_fields {
            let name = f.expand_vname(None);
            let mut tokens = tokenize_status(self.string_values.get(&name).map(|s| s.as_str()).unwrap_or(""));
            if f.props & props::JOIN_TPL_STATUS != 0 {
                tokens.extend(tpl_tokens.clone());
            }
            tokens.extend(join_into.clone());
            tokens.retain(|s| s != "OK" && !s.is_empty());
            tokens.sort();
            tokens.dedup();
            let joined = if tokens.is_empty() { "OK".to_string() } else { tokens.join(" ") };
            self.string_values.insert(name, joined);
        }
    }

    fn run_calculated_fields(&mut self, t: &Telegram) {
        let fields = self.driver.fields.clone();
        for f in &fields {
            let Some(formula) = f.formula else { continue };
            match &f.matcher {
                Some(matcher) => {
                    for e in t.dv_entries.iter().filter(|e| matcher.matches(e)) {
                        let name = f.expand_vname(Some(e));
                        if self.numeric_values.contains_key(&name) {
                            continue;
                        }
                        let bound = BoundResolver {
                            meter: self,
                            counters: Some((e.storage_nr, e.tariff_nr, e.subunit_nr)),
                        };
                        match calculator::evaluate(formula, &bound) {
                            Ok(v) => {
                                let value = v.in_unit(f.display_unit).unwrap_or(f64::NAN);
                                self.numeric_values.insert(
                                    name,
                                    NumericValue {
                                        value,
                                        unit: f.display_unit,
                                        quantity: f.quantity,
                                    },
                                );
                            }
                            Err(e) => debug!("({}) formula failed: {e}", self.driver.name),
                        }
                    }
                }
                None => {
                    let bound = BoundResolver { meter: self, counters: None };
                    match calculator::evaluate(formula, &bound) {
                        Ok(v) => {
                            let value = v.in_unit(f.display_unit).unwrap_or(f64::NAN);
                            self.numeric_values.insert(
                                f.vname.to_string(),
                                NumericValue { value, unit: f.display_unit, quantity: f.quantity },
                            );
                        }
                        Err(e) => debug!("({}) formula failed: {e}", self.driver.name),
                    }
                }
            }
        }

        /* Configuration supplied calculate_<name>_<unit> entries. */
        let extras = self.extra_calculated_fields.clone();
        for (name, formula) in &extras {
            let Some((base, unit)) = split_name_unit(name) else {
                warn!("({}) calculated field {name} has no known unit suffix", self.name);
                continue;
            };
            let bound = BoundResolver { meter: self, counters: None };
            match calculator::evaluate(formula, &bound) {
                Ok(v) => {
                    let value = v.in_unit(unit).unwrap_or(f64::NAN);
                    self.numeric_values.insert(
                        base,
                        NumericValue { value, unit, quantity: Quantity::Dimensionless },
                    );
                }
                Err(e) => debug!("({}) calculated field {name} failed: {e}", self.name),
            }
        }
    }
}

/// Warn once per unseen (mfct, media, version) triple so an unknown meter
/// family does not flood the log.
fn warn_unknown_triple(mfct: u16, media: u8, version: u8) {
    use std::collections::HashSet;
    use std::sync::Mutex;
    lazy_static::lazy_static! {
        static ref WARNED: Mutex<HashSet<(u16, u8, u8)>> = Mutex::new(HashSet::new());
    }
    let mut warned = WARNED.lock().unwrap();
    if warned.insert((mfct, media, version)) {
        warn!(
            "no driver for mfct={} ({mfct:04x}) media={media:02x} version={version:02x}, \
             falling back to auto. Please open an issue so a driver can be added.",
            crate::address::mfct_flag(mfct)
        );
    }
}

/// "history_3_date" -> ("history_3", DateLT)
fn split_name_unit(name: &str) -> Option<(String, Unit)> {
    let (base, suffix) = name.rsplit_once('_')?;
    let unit = Unit::from_suffix(suffix).ok()?;
    Some((base.to_string(), unit))
}

fn tokenize_status(s: &str) -> Vec<String> {
    s.split([' ', ','])
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

struct BoundResolver<'a> {
    meter: &'a Meter,
    counters: Option<(u32, u32, u32)>,
}

impl<'a> FieldResolver for BoundResolver<'a> {
    fn resolve(&self, name: &str) -> Option<CalcValue> {
        if let Some((storage, tariff, subunit)) = self.counters {
            match name {
                "storage_counter" => return Some(CalcValue::number(storage as f64)),
                "tariff_counter" => return Some(CalcValue::number(tariff as f64)),
                "subunit_counter" => return Some(CalcValue::number(subunit as f64)),
                _ => {}
            }
        }
        /* Try the bare vname first, then names carrying a unit suffix. */
        if let Some(nv) = self.meter.numeric_values.get(name) {
            return Some(CalcValue::with_unit(nv.value, nv.unit));
        }
        for (vname, nv) in self.meter.numeric_values.iter() {
            if format!("{}_{}", vname, nv.unit.suffix()) == name {
                return Some(CalcValue::with_unit(nv.value, nv.unit));
            }
        }
        None
    }
}

/// Owns every configured meter, matches arriving telegrams to them and
/// forwards rendered updates to the printer task.
pub struct MeterManager {
    meters: RwLock<Vec<Meter>>,
    sender: Sender<Transmission>,
    pub ignore_duplicates: bool,
    /// When no meters are configured, build them on the fly with the
    /// detected driver.
    pub auto_mode: bool,
    last_frames: RwLock<HashMap<String, Vec<u8>>>,
}

impl MeterManager {
    pub fn new(sender: Sender<Transmission>) -> MeterManager {
        MeterManager {
            meters: RwLock::new(Vec::new()),
            sender,
            ignore_duplicates: false,
            auto_mode: false,
            last_frames: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_meter(&self, m: Meter) {
        self.meters.write().unwrap().push(m);
    }

    pub fn meter_count(&self) -> usize {
        self.meters.read().unwrap().len()
    }

    /// The union of link modes all meters want their dongles to listen to.
    pub fn wanted_link_modes(&self) -> crate::linkmode::LinkModeSet {
        let meters = self.meters.read().unwrap();
        let mut set = crate::linkmode::LinkModeSet::empty();
        for m in meters.iter() {
            set = set.union(m.driver.link_modes);
        }
        set
    }

    /// Every configured meter has seen at least one update, oneshot can exit.
    pub fn all_meters_updated(&self) -> bool {
        let meters = self.meters.read().unwrap();
        !meters.is_empty() && meters.iter().all(|m| m.num_updates > 0)
    }

    /// Route one crc-stripped frame: decode, match, extract and emit.
    /// Returns true when some meter handled it.
    pub async fn handle_frame(&self, frame: &[u8], about: AboutTelegram) -> bool {
        /* A keyless best effort parse recovers the addresses even when the
           payload is encrypted. */
        let probe = match telegram::parse(frame, about.clone(), None, true) {
            Ok(t) => t,
            Err(e) => {
                warn!("({}) telegram not understood: {e}", about.bus);
                return false;
            }
        };
        let addresses = probe.addresses();

        if self.ignore_duplicates {
            let mut last = self.last_frames.write().unwrap();
            if last.get(&probe.dll_id).map(|f| f.as_slice()) == Some(frame) {
                debug!("({}) ignoring duplicate telegram from {}", about.bus, probe.dll_id);
                return true;
            }
            last.insert(probe.dll_id.clone(), frame.to_vec());
        }

        let mut updates = Vec::new();
        {
            let mut meters = self.meters.write().unwrap();
            for m in meters.iter_mut() {
                let (matched, used_wildcard) =
                    crate::address::telegram_matches(&addresses, &m.expressions);
                if !matched {
                    continue;
                }
                if !m.bus.is_empty() && m.bus != about.bus {
                    continue;
                }
                match telegram::parse(frame, about.clone(), m.key.as_deref(), false) {
                    Ok(mut t) => {
                        if used_wildcard {
                            debug!("({}) matched {} via wildcard", m.name, t.dll_id);
                        }
                        m.process_telegram(&mut t);
                        updates.push(output::build_update(m, &t));
                    }
                    Err(e) => {
                        warn!("({}) telegram for {} failed to parse: {e}", about.bus, m.name);
                    }
                }
            }

            if updates.is_empty() && self.auto_mode {
                let detected =
                    drivers::detect_driver(probe.dll_mfct, probe.dll_media, probe.dll_version);
                if detected.is_none() {
                    warn_unknown_triple(probe.dll_mfct, probe.dll_media, probe.dll_version);
                }
                if let Some(driver) = detected.or_else(|| drivers::find_driver("auto")) {
                    let id = probe.dll_id.clone();
                    let expr = AddressExpression::parse(&id);
                    if let Ok(expr) = expr {
                        info!("started meter {} ({}) on first telegram", id, driver.name);
                        let mut m = Meter::new(&id, driver, vec![expr], None);
                        if let Ok(mut t) = telegram::parse(frame, about.clone(), None, true) {
                            m.process_telegram(&mut t);
                            updates.push(output::build_update(&m, &t));
                        }
                        meters.push(m);
                    }
                }
            }
        }

        let handled = !updates.is_empty();
        for u in updates {
            let _ = self.sender.send(Transmission::Update(u)).await;
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::find_driver;

    fn process(driver: &str, frame_hex: &str, key: Option<&str>) -> (Meter, Telegram) {
        let d = find_driver(driver).unwrap();
        let mut m = Meter::new("Test", d, vec![AddressExpression::parse("*").unwrap()],
            key.map(|k| hex::decode(k).unwrap()));
        let frame = hex::decode(frame_hex.replace(['_', '|'], "")).unwrap();
        let mut t = telegram::parse(&frame, AboutTelegram::new("t", -70), m.key.as_deref(), false)
            .unwrap();
        m.process_telegram(&mut t);
        (m, t)
    }

    #[test]
    fn multical603_heat_vector() {
        let (m, _) = process(
            "multical603",
            "42442D2C3636363635048D20E18025B62087D0780406A500000004FF072B01000004FF089C000000041421020000043B120000000259D014025D000904FF2200000000",
            None,
        );
        assert_eq!(m.numeric_value("total_energy_consumption").unwrap().value, 165.0);
        assert!((m.numeric_value("total_volume").unwrap().value - 5.45).abs() < 1e-9);
        assert!((m.numeric_value("volume_flow").unwrap().value - 0.018).abs() < 1e-9);
        assert!((m.numeric_value("t1_temperature").unwrap().value - 53.28).abs() < 1e-9);
        assert!((m.numeric_value("t2_temperature").unwrap().value - 23.04).abs() < 1e-9);
        assert_eq!(m.string_value("current_status").unwrap(), "");
        assert_eq!(m.string_value("status").unwrap(), "OK");
        assert_eq!(m.numeric_value("forward_energy").unwrap().value, 299.0);
        assert_eq!(m.numeric_value("return_energy").unwrap().value, 156.0);
    }

    #[test]
    fn waterstarm_decrypts_and_extracts() {
        let (m, t) = process(
            "waterstarm",
            "3944FA122162092002067A3600202567C94D48D00DC47B11213E23383DB51968A705AAFA60C60E263D50CD259D7C9A03FD0C08000002FD0B0011",
            Some("BEDB81B52C29B5C143388CBB0D15A051"),
        );
        assert!(!t.bad);
        assert!((m.numeric_value("total").unwrap().value - 0.106).abs() < 1e-9);
        assert_eq!(m.numeric_value("total_backwards").unwrap().value, 0.0);
        assert_eq!(m.string_value("status").unwrap(), "OK");
        assert_eq!(m.string_value("meter_version").unwrap(), "000008");
        assert_eq!(m.string_value("parameter_set").unwrap(), "1100");
        /* meter_datetime is numeric PointInTime rendered as datetime. */
        let dt = m.numeric_value("meter").unwrap();
        assert_eq!(dt.unit, Unit::DateTimeLT);
        let rendered = output::format_time_value(dt.value, dt.unit);
        assert_eq!(rendered, "2020-07-30 10:40");
    }

    #[test]
    fn waterstarm_tpl_status_joins() {
        let (m, _) = process(
            "waterstarm",
            "3944FA122162092002067A3604202567C94D48D00DC47B11213E23383DB51968A705AAFA60C60E263D50CD259D7C9A03FD0C08000002FD0B0011",
            Some("BEDB81B52C29B5C143388CBB0D15A051"),
        );
        assert_eq!(m.string_value("status").unwrap(), "POWER_LOW");
        assert_eq!(m.string_value("current_status").unwrap(), "POWER_LOW");
    }

    #[test]
    fn qwater_standard_records() {
        let (m, _) = process(
            "qwater",
            "374493444836351218067AC70000200C13911900004C1391170000426CBF2CCC081391170000C2086CBF2C02BB560000326CFFFF046D1E02DE21FED0",
            None,
        );
        assert!((m.numeric_value("total").unwrap().value - 1.991).abs() < 1e-9);
        assert!((m.numeric_value("due_date").unwrap().value - 1.791).abs() < 1e-9);
        let due = m.numeric_value("due").unwrap();
        assert_eq!(output::format_time_value(due.value, due.unit), "2021-12-31");
        assert_eq!(m.string_value("status").unwrap(), "OK");
        let err = m.numeric_value("error").unwrap();
        assert_eq!(output::format_time_value(err.value, err.unit), "2128-03-31");
        assert_eq!(m.numeric_value("volume_flow").unwrap().value, 0.0);
    }

    #[test]
    fn ei6500_smoke_vector() {
        let (m, _) = process(
            "ei6500",
            "58442515747209010C1A7A8B0000000BFD0F070101046D2A06D82502FD17000082206CD825426CD0238440FF2C000F11008250FD61000082506C01018260FD6100008360FD3100000082606C01018270FD61000082706C0101",
            None,
        );
        assert_eq!(m.string_value("status").unwrap(), "OK");
        assert_eq!(m.numeric_value("alarm").unwrap().value, 0.0);
        assert_eq!(m.string_value("installation_date").unwrap(), "2022-05-24");
        assert_eq!(m.string_value("last_sound_check_date").unwrap(), "2022-03-16");
        assert_eq!(m.string_value("dust_level").unwrap(), "DUST_0");
        assert_eq!(m.string_value("battery_level").unwrap(), "3.00V");
        assert_eq!(m.string_value("software_version").unwrap(), "010107");
        assert_eq!(m.string_value("message_datetime").unwrap(), "2022-05-24 06:42");
        assert_eq!(m.string_value("last_alarm_date").unwrap(), "2000-01-01");
    }

    #[test]
    fn amiplus_electricity_vector() {
        let (m, _) = process(
            "amiplus",
            "4E4401061010101002027A00004005_2F2F0E035040691500000B2B300300066D00790C7423400C78371204860BABC8FC100000000E833C8074000000000BAB3C0000000AFDC9FC0136022F2F2F2F2F",
            None,
        );
        assert!((m.numeric_value("total_energy_consumption").unwrap().value - 15694.05).abs() < 1e-6);
        assert!((m.numeric_value("current_power_consumption").unwrap().value - 0.33).abs() < 1e-9);
        assert_eq!(m.numeric_value("voltage_at_phase_1").unwrap().value, 236.0);
        assert_eq!(m.string_value("device_date_time").unwrap(), "2019-03-20 12:57:00");
    }

    #[test]
    fn waterstarm_history_calculated_dates() {
        let (m, _) = process(
            "waterstarm",
            "9644FA126606052000067A1E000020046D3B2ED729041340D8000002FD17000001FD481D426CBF2C4413026C000084011348D20000C40113F3CB0000840213DCC40000C40213B8B60000840313849B0000C403138B8C0000840413E3800000C4041337770000840513026C0000C40513D65F00008406134F560000C40613604700008407139D370000C407137F3300008408135B2C0000",
            None,
        );
        assert!((m.numeric_value("total").unwrap().value - 55.36).abs() < 1e-9);
        assert!((m.numeric_value("consumption_at_history_1").unwrap().value - 53.832).abs() < 1e-9);
        assert!((m.numeric_value("consumption_at_history_15").unwrap().value - 11.355).abs() < 1e-9);
        let h1 = m.numeric_value("history_1").unwrap();
        assert_eq!(h1.unit, Unit::DateLT);
        assert_eq!(output::format_time_value(h1.value, h1.unit), "2022-08-23");
        let h15 = m.numeric_value("history_15").unwrap();
        assert_eq!(output::format_time_value(h15.value, h15.unit), "2021-06-23");
        assert!((m.numeric_value("battery").unwrap().value - 2.9).abs() < 1e-9);
    }
}
