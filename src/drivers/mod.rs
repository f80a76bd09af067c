use lazy_static::lazy_static;
use log::debug;

use crate::linkmode::{LinkMode, LinkModeSet};
use crate::meters::Meter;
use crate::telegram::dv::DVEntry;
use crate::telegram::vif::{VifCombinable, VifRange};
use crate::telegram::{MeasurementType, Telegram};
use crate::units::{Quantity, Unit};

mod amiplus;
mod apator162;
mod auto;
mod ei6500;
mod hydrodigit;
mod izar;
mod multical603;
mod qsmoke;
mod qwater;
mod waterstarm;

/// Print property bits controlling where a field shows up.
pub mod props {
    pub const JSON: u32 = 1 << 0;
    pub const FIELD: u32 = 1 << 1;
    pub const IMPORTANT: u32 = 1 << 2;
    pub const OPTIONAL: u32 = 1 << 3;
    pub const STATUS: u32 = 1 << 4;
    pub const JOIN_TPL_STATUS: u32 = 1 << 5;
    pub const JOIN_INTO_STATUS: u32 = 1 << 6;
    pub const HIDE: u32 = 1 << 7;
    pub const DEPRECATED: u32 = 1 << 8;

    pub const DEFAULT: u32 = JSON | FIELD;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VifScaling {
    None,
    NoneSigned,
    Auto,
    AutoSigned,
}

impl VifScaling {
    pub fn is_auto(&self) -> bool {
        matches!(self, VifScaling::Auto | VifScaling::AutoSigned)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, VifScaling::NoneSigned | VifScaling::AutoSigned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterType {
    WaterMeter,
    HeatMeter,
    ElectricityMeter,
    GasMeter,
    SmokeDetector,
    EnvironmentalSensor,
    UnknownMeter,
}

/// Predicate over one dv entry. Unset storage/tariff/subunit constraints
/// default to zero; a matcher that names no combinables only accepts
/// entries without any.
#[derive(Debug, Clone)]
pub struct FieldMatcher {
    pub measurement_type: MeasurementType,
    pub vif_range: Option<VifRange>,
    pub storage_nr: (u32, u32),
    pub tariff_nr: (u32, u32),
    pub subunit_nr: (u32, u32),
    pub dif_vif_key: Option<&'static str>,
    pub required_combinables: Vec<VifCombinable>,
    pub forbidden_combinables: Vec<VifCombinable>,
}

impl FieldMatcher {
    pub fn build() -> Self {
        FieldMatcher {
            measurement_type: MeasurementType::Any,
            vif_range: None,
            storage_nr: (0, 0),
            tariff_nr: (0, 0),
            subunit_nr: (0, 0),
            dif_vif_key: None,
            required_combinables: Vec::new(),
            forbidden_combinables: Vec::new(),
        }
    }

    pub fn mtype(mut self, mt: MeasurementType) -> Self {
        self.measurement_type = mt;
        self
    }

    pub fn vif(mut self, r: VifRange) -> Self {
        self.vif_range = Some(r);
        self
    }

    pub fn storage(mut self, nr: u32) -> Self {
        self.storage_nr = (nr, nr);
        self
    }

    pub fn storage_range(mut self, lo: u32, hi: u32) -> Self {
        self.storage_nr = (lo, hi);
        self
    }

    pub fn tariff(mut self, nr: u32) -> Self {
        self.tariff_nr = (nr, nr);
        self
    }

    pub fn subunit(mut self, nr: u32) -> Self {
        self.subunit_nr = (nr, nr);
        self
    }

    pub fn key(mut self, k: &'static str) -> Self {
        self.dif_vif_key = Some(k);
        self
    }

    pub fn combinable(mut self, c: VifCombinable) -> Self {
        self.required_combinables.push(c);
        self
    }

    pub fn without_combinable(mut self, c: VifCombinable) -> Self {
        self.forbidden_combinables.push(c);
        self
    }

    pub fn matches(&self, e: &DVEntry) -> bool {
        /* An exact dif+vif key pins the record down completely. */
        if let Some(k) = self.dif_vif_key {
            return e.key == k;
        }
        if !self.measurement_type.matches(e.measurement_type) {
            return false;
        }
        match self.vif_range {
            Some(r) if !r.contains(e.vif) => return false,
            None if self.required_combinables.is_empty() => return false,
            _ => {}
        }
        if !(self.storage_nr.0..=self.storage_nr.1).contains(&e.storage_nr) {
            return false;
        }
        if !(self.tariff_nr.0..=self.tariff_nr.1).contains(&e.tariff_nr) {
            return false;
        }
        if !(self.subunit_nr.0..=self.subunit_nr.1).contains(&e.subunit_nr) {
            return false;
        }

        let entry_combinables: Vec<VifCombinable> = e
            .combinables
            .iter()
            .map(|v| VifCombinable::from_value(*v))
            .collect();
        for c in &self.required_combinables {
            if !entry_combinables.contains(c) {
                return false;
            }
        }
        for c in &self.forbidden_combinables {
            if entry_combinables.contains(c) {
                return false;
            }
        }
        if self.required_combinables.is_empty() && !entry_combinables.is_empty() {
            return false;
        }
        true
    }
}

/// How a translated bit triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestBit {
    Set,
    NotSet,
}

#[derive(Debug, Clone)]
pub struct TEntry {
    pub bits: u64,
    pub name: &'static str,
    pub test: TestBit,
}

impl TEntry {
    pub fn new(bits: u64, name: &'static str) -> TEntry {
        TEntry { bits, name, test: TestBit::Set }
    }

    pub fn when_not_set(bits: u64, name: &'static str) -> TEntry {
        TEntry { bits, name, test: TestBit::NotSet }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateType {
    BitToString,
    IndexToString,
}

/// A bit-mask or index based integer to string table.
#[derive(Debug, Clone)]
pub struct Translate {
    pub name: &'static str,
    pub ttype: TranslateType,
    pub mask: u64,
    /// Printed when nothing triggers, "OK" for status fields.
    pub default: &'static str,
    pub entries: Vec<TEntry>,
}

impl Translate {
    pub fn apply(&self, value: u64) -> String {
        let masked = value & self.mask;
        match self.ttype {
            TranslateType::BitToString => {
                let mut leftover = masked;
                let mut parts = Vec::new();
                for e in &self.entries {
                    match e.test {
                        TestBit::Set => {
                            if leftover & e.bits == e.bits && e.bits != 0 {
                                if !e.name.is_empty() {
                                    parts.push(e.name.to_string());
                                }
                                leftover &= !e.bits;
                            }
                        }
                        TestBit::NotSet => {
                            if masked & e.bits == 0 {
                                if !e.name.is_empty() {
                                    parts.push(e.name.to_string());
                                }
                            } else {
                                leftover &= !e.bits;
                            }
                        }
                    }
                }
                if leftover != 0 {
                    parts.push(format!("UNKNOWN_{leftover:X}"));
                }
                if parts.is_empty() {
                    return self.default.to_string();
                }
                parts.sort();
                parts.join(" ")
            }
            TranslateType::IndexToString => {
                for e in &self.entries {
                    if e.bits == masked {
                        return e.name.to_string();
                    }
                }
                if self.entries.is_empty() {
                    /* No table yet, print the shifted index under the mask. */
                    let shift = self.mask.trailing_zeros();
                    return format!("{}_{}", self.name, masked >> shift);
                }
                format!("{}_{masked:X}", self.name)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Numeric,
    String,
}

/// A declarative field extractor. Names may contain counter placeholders
/// like "{storage_counter - 1 counter}" expanded from the matched entry.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub vname: &'static str,
    pub help: &'static str,
    pub props: u32,
    pub kind: FieldKind,
    pub quantity: Quantity,
    pub display_unit: Unit,
    pub vif_scaling: VifScaling,
    pub matcher: Option<FieldMatcher>,
    pub lookup: Option<Translate>,
    pub formula: Option<&'static str>,
}

impl FieldInfo {
    pub fn numeric(
        vname: &'static str,
        help: &'static str,
        props: u32,
        quantity: Quantity,
        vif_scaling: VifScaling,
        matcher: FieldMatcher,
    ) -> FieldInfo {
        FieldInfo {
            vname,
            help,
            props,
            kind: FieldKind::Numeric,
            quantity,
            display_unit: quantity.default_unit(),
            vif_scaling,
            matcher: Some(matcher),
            lookup: None,
            formula: None,
        }
    }

    pub fn string(
        vname: &'static str,
        help: &'static str,
        props: u32,
        matcher: FieldMatcher,
    ) -> FieldInfo {
        FieldInfo {
            vname,
            help,
            props,
            kind: FieldKind::String,
            quantity: Quantity::Text,
            display_unit: Unit::Txt,
            vif_scaling: VifScaling::None,
            matcher: Some(matcher),
            lookup: None,
            formula: None,
        }
    }

    pub fn string_with_lookup(
        vname: &'static str,
        help: &'static str,
        props: u32,
        matcher: FieldMatcher,
        lookup: Translate,
    ) -> FieldInfo {
        let mut f = FieldInfo::string(vname, help, props, matcher);
        f.lookup = Some(lookup);
        f
    }

    /// A string field without an extractor: filled by a process_content
    /// hook, or for status fields assembled from the tpl status byte alone.
    pub fn string_plain(vname: &'static str, help: &'static str, props: u32) -> FieldInfo {
        FieldInfo {
            vname,
            help,
            props,
            kind: FieldKind::String,
            quantity: Quantity::Text,
            display_unit: Unit::Txt,
            vif_scaling: VifScaling::None,
            matcher: None,
            lookup: None,
            formula: None,
        }
    }

    /// Set only by a process_content hook.
    pub fn numeric_hook(
        vname: &'static str,
        help: &'static str,
        props: u32,
        quantity: Quantity,
    ) -> FieldInfo {
        FieldInfo {
            vname,
            help,
            props,
            kind: FieldKind::Numeric,
            quantity,
            display_unit: quantity.default_unit(),
            vif_scaling: VifScaling::None,
            matcher: None,
            lookup: None,
            formula: None,
        }
    }

    pub fn numeric_calculated(
        vname: &'static str,
        help: &'static str,
        props: u32,
        quantity: Quantity,
        formula: &'static str,
    ) -> FieldInfo {
        FieldInfo {
            vname,
            help,
            props,
            kind: FieldKind::Numeric,
            quantity,
            display_unit: quantity.default_unit(),
            vif_scaling: VifScaling::None,
            matcher: None,
            lookup: None,
            formula: Some(formula),
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> FieldInfo {
        self.display_unit = unit;
        self
    }

    pub fn with_matcher(mut self, matcher: FieldMatcher) -> FieldInfo {
        self.matcher = Some(matcher);
        self
    }

    /// Expand counter placeholders against a matched entry.
    pub fn expand_vname(&self, e: Option<&DVEntry>) -> String {
        expand_placeholders(self.vname, e)
    }
}

fn expand_placeholders(vname: &str, e: Option<&DVEntry>) -> String {
    if !vname.contains('{') {
        return vname.to_string();
    }
    lazy_static! {
        static ref PLACEHOLDER: regex::Regex = regex::Regex::new(
            r"\{(storage_counter|tariff_counter|subunit_counter)(\s*-\s*(\d+))?[a-z ]*\}"
        )
        .unwrap();
    }
    PLACEHOLDER
        .replace_all(vname, |caps: &regex::Captures| {
            let base = match (&caps[1], e) {
                ("storage_counter", Some(e)) => e.storage_nr as i64,
                ("tariff_counter", Some(e)) => e.tariff_nr as i64,
                ("subunit_counter", Some(e)) => e.subunit_nr as i64,
                _ => 0,
            };
            let offset: i64 = caps
                .get(3)
                .map(|m| m.as_str().parse().unwrap_or(0))
                .unwrap_or(0);
            format!("{}", base - offset)
        })
        .to_string()
}

/// A detection triple. Media and version of -1 act as wildcards.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub mfct: u16,
    pub media: i16,
    pub version: i16,
}

pub type ProcessContentHook = fn(&mut Meter, &mut Telegram);

/// The static description of one meter family.
pub struct DriverInfo {
    pub name: &'static str,
    pub meter_type: MeterType,
    pub link_modes: LinkModeSet,
    pub detections: Vec<Detection>,
    pub fields: Vec<FieldInfo>,
    /// Field names printed by the delimited output when no selectfields
    /// were configured.
    pub default_fields: &'static str,
    pub mfct_tpl_status: Option<Translate>,
    pub process_content: Option<ProcessContentHook>,
}

impl DriverInfo {
    pub fn new(name: &'static str, meter_type: MeterType) -> DriverInfo {
        DriverInfo {
            name,
            meter_type,
            link_modes: LinkModeSet::empty(),
            detections: Vec::new(),
            fields: Vec::new(),
            default_fields: "name,id,timestamp",
            mfct_tpl_status: None,
            process_content: None,
        }
    }

    pub fn link_mode(mut self, lm: LinkMode) -> DriverInfo {
        self.link_modes.add(lm);
        self
    }

    pub fn detect(mut self, mfct: u16, media: i16, version: i16) -> DriverInfo {
        self.detections.push(Detection { mfct, media, version });
        self
    }

    pub fn default_fields(mut self, f: &'static str) -> DriverInfo {
        self.default_fields = f;
        self
    }

    pub fn field(mut self, f: FieldInfo) -> DriverInfo {
        self.fields.push(f);
        self
    }

    pub fn mfct_tpl_status(mut self, t: Translate) -> DriverInfo {
        self.mfct_tpl_status = Some(t);
        self
    }

    pub fn process_content(mut self, hook: ProcessContentHook) -> DriverInfo {
        self.process_content = Some(hook);
        self
    }

    pub fn detects(&self, mfct: u16, media: u8, version: u8) -> bool {
        self.detections.iter().any(|d| {
            d.mfct == mfct
                && (d.media == -1 || d.media == media as i16)
                && (d.version == -1 || d.version == version as i16)
        })
    }

    /// Whether the media byte is at all plausible for this meter type,
    /// used to filter candidates in analyze mode.
    pub fn media_plausible(&self, media: u8) -> bool {
        match self.meter_type {
            MeterType::WaterMeter => {
                matches!(media, 0x06 | 0x07 | 0x15 | 0x16 | 0x17 | 0x28)
            }
            MeterType::HeatMeter => matches!(media, 0x04 | 0x0a | 0x0b | 0x0c | 0x0d),
            MeterType::ElectricityMeter => media == 0x02,
            MeterType::GasMeter => media == 0x03,
            MeterType::SmokeDetector => media == 0x1a,
            MeterType::EnvironmentalSensor => matches!(media, 0x1b | 0x1d),
            MeterType::UnknownMeter => true,
        }
    }
}

/// Every driver, registered exactly once in a stable order. First
/// registration wins when detection triples overlap.
pub fn register_all() -> Vec<DriverInfo> {
    vec![
        auto::driver(),
        amiplus::driver(),
        apator162::driver(),
        ei6500::driver(),
        hydrodigit::driver(),
        izar::driver(),
        multical603::driver(),
        qsmoke::driver(),
        qwater::driver(),
        waterstarm::driver(),
    ]
}

lazy_static! {
    static ref DRIVERS: Vec<DriverInfo> = register_all();
}

pub fn all_drivers() -> &'static [DriverInfo] {
    &DRIVERS
}

pub fn find_driver(name: &str) -> Option<&'static DriverInfo> {
    DRIVERS.iter().find(|d| d.name == name)
}

/// Best fit for a (mfct, media, version) triple: exact triple first, then
/// wildcard matches, registration order breaking ties.
pub fn detect_driver(mfct: u16, media: u8, version: u8) -> Option<&'static DriverInfo> {
    let exact = DRIVERS.iter().find(|d| {
        d.detections
            .iter()
            .any(|t| t.mfct == mfct && t.media == media as i16 && t.version == version as i16)
    });
    if exact.is_some() {
        return exact;
    }
    DRIVERS
        .iter()
        .find(|d| d.name != "auto" && d.detects(mfct, media, version))
}

/// One driver's score against one telegram in analyze mode.
#[derive(Debug)]
pub struct DriverScore {
    pub name: &'static str,
    pub understood: usize,
    pub total: usize,
}

impl DriverScore {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.understood as f64 / self.total as f64
    }
}

#[derive(Debug)]
pub struct AnalyzeReport {
    pub auto_detected: Option<&'static str>,
    pub using: &'static str,
    pub using_score: f64,
    pub best: Option<&'static str>,
    pub best_score: f64,
    pub scores: Vec<DriverScore>,
    /// The json the in-use driver produced.
    pub rendered: serde_json::Map<String, serde_json::Value>,
}

/// Try every media-compatible driver against one frame and score each by
/// bytes understood over total payload bytes.
pub fn analyze(
    frame: &[u8],
    about: crate::telegram::AboutTelegram,
    forced_driver: Option<&str>,
    key: Option<&[u8]>,
) -> Result<AnalyzeReport, crate::telegram::TelegramParseError> {
    let probe = crate::telegram::parse(frame, about.clone(), key, true)?;
    let auto_detected =
        detect_driver(probe.dll_mfct, probe.dll_media, probe.dll_version).map(|d| d.name);

    let mut scores = Vec::new();
    for d in DRIVERS.iter() {
        if d.name == "auto" || !d.media_plausible(probe.dll_media) {
            continue;
        }
        let mut t = crate::telegram::parse(frame, about.clone(), key, true)?;
        let mut meter = Meter::for_analysis(d);
        meter.process_telegram(&mut t);
        scores.push(DriverScore {
            name: d.name,
            understood: t.understood.min(t.payload.len()),
            total: t.payload.len(),
        });
    }
    scores.sort_by(|a, b| b.ratio().partial_cmp(&a.ratio()).unwrap_or(std::cmp::Ordering::Equal));

    let using_name = forced_driver
        .and_then(find_driver)
        .map(|d| d.name)
        .or(auto_detected)
        .unwrap_or("auto");
    let using = find_driver(using_name).unwrap_or_else(|| find_driver("auto").unwrap());

    let mut t = crate::telegram::parse(frame, about, key, true)?;
    let mut meter = Meter::for_analysis(using);
    meter.process_telegram(&mut t);
    let rendered = crate::output::render_json(&meter, &t);
    let using_score = if t.payload.is_empty() {
        0.0
    } else {
        t.understood.min(t.payload.len()) as f64 / t.payload.len() as f64
    };

    debug!("analyze: auto {:?} best {:?}", auto_detected, scores.first().map(|s| s.name));

    Ok(AnalyzeReport {
        auto_detected,
        using: using.name,
        using_score,
        best: scores.first().map(|s| s.name),
        best_score: scores.first().map(|s| s.ratio()).unwrap_or(0.0),
        scores,
        rendered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::pack_mfct;

    #[test]
    fn registry_has_stable_names() {
        let names: Vec<&str> = all_drivers().iter().map(|d| d.name).collect();
        assert!(names.contains(&"auto"));
        assert!(names.contains(&"multical603"));
        assert!(names.contains(&"izar"));
        /* Names are unique. */
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len());
    }

    #[test]
    fn detection_exact_and_wildcard() {
        let kam = pack_mfct(b'K', b'A', b'M');
        let d = detect_driver(kam, 0x04, 0x35).unwrap();
        assert_eq!(d.name, "multical603");

        /* Sappel/Diehl izar registers a wildcard version. */
        let sap = pack_mfct(b'S', b'A', b'P');
        let d = detect_driver(sap, 0x15, 0x99).unwrap();
        assert_eq!(d.name, "izar");

        assert!(detect_driver(0x0001, 0x99, 0x99).is_none());
    }

    #[test]
    fn placeholder_expansion() {
        use crate::telegram::dv;
        let payload = hex::decode("8401131234567842").unwrap();
        let walk = dv::walk(&payload);
        let e = &walk.entries[0];
        assert_eq!(e.storage_nr, 2);
        assert_eq!(
            expand_placeholders("consumption_at_history_{storage_counter - 1 counter}", Some(e)),
            "consumption_at_history_1"
        );
        assert_eq!(
            expand_placeholders("total_tariff_{tariff_counter}", Some(e)),
            "total_tariff_0"
        );
    }

    #[test]
    fn field_names_are_unique_per_driver() {
        for d in all_drivers() {
            let mut names: Vec<&str> = d.fields.iter().map(|f| f.vname).collect();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), d.fields.len(), "duplicate field in {}", d.name);
        }
    }

    #[test]
    fn bit_lookup_with_default_and_unknown() {
        let t = Translate {
            name: "ERROR_FLAGS",
            ttype: TranslateType::BitToString,
            mask: 0xffff,
            default: "OK",
            entries: vec![TEntry::new(0x01, "SW_ERROR"), TEntry::new(0x40, "LEAKAGE_OR_NO_USAGE")],
        };
        assert_eq!(t.apply(0), "OK");
        assert_eq!(t.apply(0x40), "LEAKAGE_OR_NO_USAGE");
        assert_eq!(t.apply(0x41), "LEAKAGE_OR_NO_USAGE SW_ERROR");
        assert_eq!(t.apply(0x8000), "UNKNOWN_8000");
    }

    #[test]
    fn index_lookup_falls_back_to_counter_name() {
        let t = Translate {
            name: "DUST",
            ttype: TranslateType::IndexToString,
            mask: 0x1f,
            default: "",
            entries: vec![],
        };
        assert_eq!(t.apply(0x00110f00), "DUST_0");
        assert_eq!(t.apply(3), "DUST_3");
    }

    #[test]
    fn matcher_defaults_reject_extra_dimensions() {
        use crate::telegram::dv;
        /* Storage 1 entry must not satisfy a default matcher. */
        let payload = hex::decode("4C1391170000").unwrap();
        let walk = dv::walk(&payload);
        let m = FieldMatcher::build()
            .mtype(MeasurementType::Instantaneous)
            .vif(VifRange::Volume);
        assert!(!m.matches(&walk.entries[0]));
        assert!(m.clone().storage(1).matches(&walk.entries[0]));

        /* An entry with a combinable is rejected unless asked for. */
        let payload = hex::decode("04933C00000000").unwrap();
        let walk = dv::walk(&payload);
        let m = FieldMatcher::build()
            .mtype(MeasurementType::Instantaneous)
            .vif(VifRange::AnyVolumeVIF);
        assert!(!m.matches(&walk.entries[0]));
        assert!(m
            .clone()
            .combinable(VifCombinable::BackwardFlow)
            .matches(&walk.entries[0]));
    }
}
