use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::AddressExpression;
use crate::drivers;
use crate::linkmode::LinkModeSet;
use crate::meters::Meter;
use crate::output::Format;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("meter name \"{0}\" must not contain a colon")]
    BadMeterName(String),
    #[error("unknown driver \"{0}\"")]
    UnknownDriver(String),
    #[error("key must be 32 hex characters or NOKEY, got \"{0}\"")]
    BadKey(String),
    #[error("invalid value \"{1}\" for {0}")]
    BadValue(&'static str, String),
    #[error(transparent)]
    BadAddressExpression(#[from] crate::address::AddressError),
    #[error("cannot read {0}: {1}")]
    Io(String, std::io::Error),
}

/// Which family a configured bus device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Im871a,
    Iu880b,
    Iu891a,
    Amb3665,
    Rc1180,
    Cul,
    RtlWmbus,
    Rtl433,
    Stdin,
    File,
    Simulation,
    Auto,
}

impl DeviceKind {
    pub fn parse(s: &str) -> Option<DeviceKind> {
        match s {
            "im871a" => Some(DeviceKind::Im871a),
            "iu880b" => Some(DeviceKind::Iu880b),
            "iu891a" => Some(DeviceKind::Iu891a),
            "amb3665" => Some(DeviceKind::Amb3665),
            "rc1180" => Some(DeviceKind::Rc1180),
            "cul" => Some(DeviceKind::Cul),
            "rtlwmbus" => Some(DeviceKind::RtlWmbus),
            "rtl433" => Some(DeviceKind::Rtl433),
            "auto" => Some(DeviceKind::Auto),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Im871a => "im871a",
            DeviceKind::Iu880b => "iu880b",
            DeviceKind::Iu891a => "iu891a",
            DeviceKind::Amb3665 => "amb3665",
            DeviceKind::Rc1180 => "rc1180",
            DeviceKind::Cul => "cul",
            DeviceKind::RtlWmbus => "rtlwmbus",
            DeviceKind::Rtl433 => "rtl433",
            DeviceKind::Stdin => "stdin",
            DeviceKind::File => "file",
            DeviceKind::Simulation => "simulation",
            DeviceKind::Auto => "auto",
        }
    }
}

/// One configured bus: a tty path, stdin, a file, a simulation or an sdr
/// pipeline command, with the optional type and frequency suffixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusDeviceSpec {
    pub alias: String,
    pub device: String,
    pub kind: DeviceKind,
    pub fq: Option<String>,
}

impl BusDeviceSpec {
    /// The shell command for sdr back ends, built from the frequency
    /// override when one was given.
    pub fn command_line(&self) -> String {
        if self.device.contains(' ') {
            return self.device.clone();
        }
        let fq = self.fq.as_deref().unwrap_or("868.95M");
        match self.kind {
            DeviceKind::Rtl433 => format!("rtl_433 -F csv -f {fq}"),
            _ => format!("rtl_sdr -f {fq} -s 1.6e6 - 2>/dev/null | rtl_wmbus -s"),
        }
    }
}

/// Parse a bus uri: <device_or_command>[:<type>[:<fq>]]. A /dev/rtlsdr
/// path is canonicalised to the rtlwmbus pipeline.
pub fn parse_bus_uri(uri: &str) -> Result<BusDeviceSpec, ConfigError> {
    let uri = uri.trim();

    if uri == "stdin" {
        return Ok(BusDeviceSpec {
            alias: "stdin".to_string(),
            device: String::new(),
            kind: DeviceKind::Stdin,
            fq: None,
        });
    }
    if let Some(path) = uri.strip_prefix("file:") {
        return Ok(BusDeviceSpec {
            alias: path.to_string(),
            device: path.to_string(),
            kind: DeviceKind::File,
            fq: None,
        });
    }
    if let Some(path) = uri.strip_prefix("sim:") {
        return Ok(BusDeviceSpec {
            alias: path.to_string(),
            device: path.to_string(),
            kind: DeviceKind::Simulation,
            fq: None,
        });
    }
    if uri.starts_with("rtlwmbus") || uri.starts_with("rtl433") {
        let kind = if uri.starts_with("rtl433") { DeviceKind::Rtl433 } else { DeviceKind::RtlWmbus };
        /* Either the bare word, or a full command after a colon. */
        let device = uri.split_once(':').map(|(_, c)| c.to_string()).unwrap_or_default();
        return Ok(BusDeviceSpec {
            alias: kind.name().to_string(),
            device: if device.is_empty() { kind.name().to_string() } else { device },
            kind,
            fq: None,
        });
    }
    if uri.starts_with("/dev/rtlsdr") {
        debug!("canonicalising {uri} to rtlwmbus");
        return Ok(BusDeviceSpec {
            alias: "rtlwmbus".to_string(),
            device: "rtlwmbus".to_string(),
            kind: DeviceKind::RtlWmbus,
            fq: None,
        });
    }

    let mut parts = uri.splitn(3, ':');
    let device = parts.next().unwrap_or("").to_string();
    if device.is_empty() {
        return Err(ConfigError::BadValue("device", uri.to_string()));
    }
    let kind = match parts.next() {
        Some(t) => DeviceKind::parse(t).ok_or_else(|| ConfigError::BadValue("device type", t.to_string()))?,
        None => DeviceKind::Auto,
    };
    let fq = parts.next().map(|s| s.to_string());
    Ok(BusDeviceSpec {
        alias: kind.name().to_string(),
        device,
        kind,
        fq,
    })
}

/// One meter block from the configuration tree, key value pairs, one per
/// line, a hash starts a comment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterConfig {
    pub name: String,
    pub driver: String,
    pub ids: String,
    pub key: String,
    pub bus: String,
    pub poll_interval_s: Option<u64>,
    pub shell: Option<String>,
    pub alarm_shell: Option<String>,
    pub selected_fields: Vec<String>,
    pub extra_constant_fields: Vec<(String, String)>,
    pub extra_calculated_fields: Vec<(String, String)>,
}

impl MeterConfig {
    pub fn parse(text: &str) -> Result<MeterConfig, ConfigError> {
        let mut mc = MeterConfig::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::BadValue("meter config line", line.to_string()));
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "name" => {
                    if value.contains(':') {
                        return Err(ConfigError::BadMeterName(value.to_string()));
                    }
                    mc.name = value.to_string();
                }
                "driver" | "type" => mc.driver = value.to_string(),
                "id" => {
                    /* Fail fast on a bad expression. */
                    AddressExpression::parse_sequence(value)?;
                    mc.ids = value.to_string();
                }
                "key" => mc.key = value.to_string(),
                "bus" => mc.bus = value.to_string(),
                "pollinterval" => {
                    let secs: u64 = value
                        .trim_end_matches('s')
                        .parse()
                        .map_err(|_| ConfigError::BadValue("pollinterval", value.to_string()))?;
                    if secs > 0 {
                        mc.poll_interval_s = Some(secs);
                    }
                }
                "shell" => mc.shell = Some(value.to_string()),
                "alarmshell" => mc.alarm_shell = Some(value.to_string()),
                "selectfields" => {
                    mc.selected_fields = value.split(',').map(|s| s.trim().to_string()).collect();
                }
                _ => {
                    if let Some(field) = key.strip_prefix("json_").or_else(|| key.strip_prefix("field_")) {
                        mc.extra_constant_fields.push((field.to_string(), value.to_string()));
                    } else if let Some(field) = key.strip_prefix("calculate_") {
                        mc.extra_calculated_fields.push((field.to_string(), value.to_string()));
                    } else {
                        return Err(ConfigError::BadValue("meter config key", key.to_string()));
                    }
                }
            }
        }
        Ok(mc)
    }

    /// Decode the aes key. Zero or sixteen bytes are the valid lengths.
    pub fn key_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        if self.key.is_empty() || self.key == "NOKEY" {
            return Ok(None);
        }
        let bytes = hex::decode(&self.key).map_err(|_| ConfigError::BadKey(self.key.clone()))?;
        if bytes.len() != 16 {
            return Err(ConfigError::BadKey(self.key.clone()));
        }
        Ok(Some(bytes))
    }

    /// Bind this configuration to a driver and build the runtime meter.
    pub fn build(&self) -> Result<Meter, ConfigError> {
        let driver_name = if self.driver.is_empty() { "auto" } else { &self.driver };
        let driver = drivers::find_driver(driver_name)
            .ok_or_else(|| ConfigError::UnknownDriver(driver_name.to_string()))?;
        let expressions = AddressExpression::parse_sequence(if self.ids.is_empty() {
            "*"
        } else {
            &self.ids
        })?;
        let mut m = Meter::new(&self.name, driver, expressions, self.key_bytes()?);
        m.bus = self.bus.clone();
        m.poll_interval_s = self.poll_interval_s;
        m.selected_fields = self.selected_fields.clone();
        m.extra_constant_fields = self.extra_constant_fields.clone();
        m.extra_calculated_fields = self.extra_calculated_fields.clone();
        m.shell = self.shell.clone();
        m.alarm_shell = self.alarm_shell.clone();
        Ok(m)
    }
}

/// When log timestamps are attached to output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogTimestamps {
    Never,
    Always,
    Important,
}

/// The global configuration, a subset of keys in the same key value
/// format as the meter blocks.
#[derive(Debug, Clone)]
pub struct Config {
    pub loglevel: String,
    pub devices: Vec<BusDeviceSpec>,
    pub listento: LinkModeSet,
    pub exitafter: Option<Duration>,
    pub oneshot: bool,
    pub logtelegrams: bool,
    pub logsummary: bool,
    pub meterfiles: Option<String>,
    pub meterfiles_action: String,
    pub meterfiles_naming: String,
    pub meterfiles_timestamp: String,
    pub format: Format,
    pub separator: char,
    pub logtimestamps: LogTimestamps,
    pub resetafter: Option<Duration>,
    pub donotprobe: Vec<String>,
    pub ignoreduplicates: bool,
    pub meters: Vec<MeterConfig>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            loglevel: "normal".to_string(),
            devices: Vec::new(),
            listento: LinkModeSet::empty(),
            exitafter: None,
            oneshot: false,
            logtelegrams: false,
            logsummary: false,
            meterfiles: None,
            meterfiles_action: "overwrite".to_string(),
            meterfiles_naming: "name".to_string(),
            meterfiles_timestamp: "day".to_string(),
            format: Format::Json,
            separator: ';',
            logtimestamps: LogTimestamps::Never,
            resetafter: None,
            donotprobe: Vec::new(),
            ignoreduplicates: false,
            meters: Vec::new(),
        }
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    let (num, factor) = match value.chars().last()? {
        's' => (&value[..value.len() - 1], 1),
        'm' => (&value[..value.len() - 1], 60),
        'h' => (&value[..value.len() - 1], 3600),
        _ => (value, 1),
    };
    num.parse::<u64>().ok().map(|v| Duration::from_secs(v * factor))
}

impl Config {
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut c = Config::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::BadValue("config line", line.to_string()));
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "loglevel" => c.loglevel = value.to_string(),
                "device" => c.devices.push(parse_bus_uri(value)?),
                "listento" => {
                    c.listento = LinkModeSet::parse(value)
                        .ok_or_else(|| ConfigError::BadValue("listento", value.to_string()))?;
                }
                "exitafter" => {
                    c.exitafter = Some(
                        parse_duration(value)
                            .ok_or_else(|| ConfigError::BadValue("exitafter", value.to_string()))?,
                    );
                }
                "oneshot" => c.oneshot = value == "true",
                "logtelegrams" => c.logtelegrams = value == "true",
                "logsummary" => c.logsummary = value == "true",
                "meterfiles" => c.meterfiles = Some(value.to_string()),
                "meterfilesaction" => c.meterfiles_action = value.to_string(),
                "meterfilesnaming" => c.meterfiles_naming = value.to_string(),
                "meterfilestimestamp" => c.meterfiles_timestamp = value.to_string(),
                "format" => {
                    c.format = Format::parse(value)
                        .ok_or_else(|| ConfigError::BadValue("format", value.to_string()))?;
                }
                "separator" => {
                    c.separator = value
                        .chars()
                        .next()
                        .ok_or_else(|| ConfigError::BadValue("separator", value.to_string()))?;
                }
                "logtimestamps" => {
                    c.logtimestamps = match value {
                        "never" => LogTimestamps::Never,
                        "always" => LogTimestamps::Always,
                        "important" => LogTimestamps::Important,
                        _ => return Err(ConfigError::BadValue("logtimestamps", value.to_string())),
                    };
                }
                "resetafter" => {
                    c.resetafter = Some(
                        parse_duration(value)
                            .ok_or_else(|| ConfigError::BadValue("resetafter", value.to_string()))?,
                    );
                }
                "donotprobe" => c.donotprobe.push(value.to_string()),
                "ignoreduplicates" => c.ignoreduplicates = value == "true",
                other => {
                    debug!("ignoring unknown config key {other}");
                }
            }
        }
        Ok(c)
    }

    /// Load the config root: an etc-style main file plus one meter block
    /// per file in its meters subdirectory.
    pub fn load(root: &str) -> Result<Config, ConfigError> {
        let main = format!("{root}/wmbus2json.conf");
        let text = std::fs::read_to_string(&main).map_err(|e| ConfigError::Io(main.clone(), e))?;
        let mut c = Config::parse(&text)?;

        let meters_dir = format!("{root}/wmbus2json.d");
        if let Ok(entries) = std::fs::read_dir(&meters_dir) {
            let mut paths: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            paths.sort();
            for path in paths {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
                c.meters.push(MeterConfig::parse(&text)?);
            }
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_uris() {
        let s = parse_bus_uri("/dev/ttyUSB0:im871a").unwrap();
        assert_eq!(s.kind, DeviceKind::Im871a);
        assert_eq!(s.device, "/dev/ttyUSB0");

        let s = parse_bus_uri("/dev/ttyUSB1:rc1180:38400").unwrap();
        assert_eq!(s.kind, DeviceKind::Rc1180);
        assert_eq!(s.fq.as_deref(), Some("38400"));

        let s = parse_bus_uri("stdin").unwrap();
        assert_eq!(s.kind, DeviceKind::Stdin);

        let s = parse_bus_uri("sim:replay.txt").unwrap();
        assert_eq!(s.kind, DeviceKind::Simulation);
        assert_eq!(s.device, "replay.txt");

        let s = parse_bus_uri("/dev/rtlsdr_3").unwrap();
        assert_eq!(s.kind, DeviceKind::RtlWmbus);

        let s = parse_bus_uri("/dev/ttyUSB2").unwrap();
        assert_eq!(s.kind, DeviceKind::Auto);

        assert!(parse_bus_uri("/dev/ttyUSB0:quantum").is_err());
    }

    #[test]
    fn meter_block_roundtrip() {
        let mc = MeterConfig::parse(
            "# my heat meter\n\
             name=Heat\n\
             driver=multical603\n\
             id=36363636\n\
             key=NOKEY\n\
             pollinterval=3600\n\
             selectfields=name,id,total_energy_consumption_kwh\n\
             json_floor=2\n\
             calculate_approx_power_kw=total_energy_consumption / 1000 h\n",
        )
        .unwrap();
        assert_eq!(mc.name, "Heat");
        assert_eq!(mc.driver, "multical603");
        assert_eq!(mc.poll_interval_s, Some(3600));
        assert_eq!(mc.extra_constant_fields[0].0, "floor");
        assert_eq!(mc.extra_calculated_fields[0].0, "approx_power_kw");
        let meter = mc.build().unwrap();
        assert_eq!(meter.driver.name, "multical603");
        assert_eq!(meter.selected_fields.len(), 3);
    }

    #[test]
    fn invalid_meter_inputs_fail_fast() {
        assert!(MeterConfig::parse("name=with:colon\n").is_err());
        assert!(MeterConfig::parse("id=zz*q\n").is_err());
        let mc = MeterConfig::parse("name=X\ndriver=nosuchdriver\nid=12345678\n").unwrap();
        assert!(mc.build().is_err());
        let mc = MeterConfig::parse("name=X\ndriver=auto\nid=12345678\nkey=1234\n").unwrap();
        assert!(mc.build().is_err());
    }

    #[test]
    fn load_reads_main_file_and_meter_blocks() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join("wmbus2json.conf"),
            "loglevel=normal\ndevice=stdin\nformat=json\n",
        )
        .unwrap();
        let meters = root.path().join("wmbus2json.d");
        std::fs::create_dir(&meters).unwrap();
        std::fs::write(
            meters.join("heat"),
            "name=Heat\ndriver=multical603\nid=36363636\nkey=NOKEY\n",
        )
        .unwrap();
        std::fs::write(
            meters.join("water"),
            "name=Water\ndriver=qwater\nid=12353648\n",
        )
        .unwrap();

        let c = Config::load(root.path().to_str().unwrap()).unwrap();
        assert_eq!(c.devices.len(), 1);
        assert_eq!(c.meters.len(), 2);
        assert_eq!(c.meters[0].name, "Heat");
        assert_eq!(c.meters[1].driver, "qwater");
    }

    #[test]
    fn global_config_subset() {
        let c = Config::parse(
            "loglevel=debug\n\
             device=/dev/ttyUSB0:im871a\n\
             listento=c1,t1\n\
             format=fields\n\
             separator=,\n\
             exitafter=2h\n\
             ignoreduplicates=true\n\
             logtimestamps=important\n",
        )
        .unwrap();
        assert_eq!(c.devices.len(), 1);
        assert_eq!(c.format, Format::Fields);
        assert_eq!(c.separator, ',');
        assert_eq!(c.exitafter, Some(Duration::from_secs(7200)));
        assert!(c.ignoreduplicates);
        assert_eq!(c.logtimestamps, LogTimestamps::Important);
        assert!(c.listento.has(crate::linkmode::LinkMode::C1));
    }
}
