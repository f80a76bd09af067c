use super::{DriverInfo, MeterType};

/// The synthetic fallback driver used when no meter configuration names a
/// real one. It decodes the header and prints id, media, manufacturer and
/// version only.
pub fn driver() -> DriverInfo {
    DriverInfo::new("auto", MeterType::UnknownMeter).default_fields("name,id,timestamp")
}
