use crate::units::Unit;

/// A vif value normalised into one number space: 0x00..0x7f are the plain
/// vifs, 0x100|x came from the 0xFD extension table, 0x200|x from the 0xFB
/// extension table. 0x7f and 0xff are manufacturer specific.
pub const VIF_FD: u16 = 0x100;
pub const VIF_FB: u16 = 0x200;
pub const VIF_MFCT: u16 = 0x7f;

/// Abstract equivalence classes over concrete vifs. A matcher set to one
/// of these accepts every vif in the class regardless of scale digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VifRange {
    Any,
    EnergyWh,
    EnergyMJ,
    AnyEnergyVIF,
    Volume,
    AnyVolumeVIF,
    Mass,
    OnTime,
    OperatingTime,
    PowerW,
    PowerJh,
    AnyPowerVIF,
    VolumeFlow,
    VolumeFlowExt,
    FlowTemperature,
    ReturnTemperature,
    TemperatureDifference,
    ExternalTemperature,
    Pressure,
    Date,
    DateTime,
    HeatCostAllocation,
    AveragingDuration,
    ActualityDuration,
    FabricationNo,
    EnhancedIdentification,
    AccessNumber,
    Medium,
    Manufacturer,
    ParameterSet,
    ModelVersion,
    HardwareVersion,
    FirmwareVersion,
    SoftwareVersion,
    ErrorFlags,
    ErrorMask,
    DigitalOutput,
    DigitalInput,
    StorageInterval,
    DurationSinceReadout,
    DurationOfTariff,
    Voltage,
    Amperage,
    ResetCounter,
    CumulationCounter,
    RemainingBattery,
    RelativeHumidity,
    ManufacturerSpecific,
}

impl VifRange {
    pub fn contains(&self, vif: u16) -> bool {
        let (lo, hi) = match self {
            VifRange::Any => return true,
            VifRange::EnergyWh => (0x00, 0x07),
            VifRange::EnergyMJ => (0x08, 0x0f),
            VifRange::AnyEnergyVIF => {
                return (0x00..=0x0f).contains(&vif)
                    || (VIF_FB..=VIF_FB + 1).contains(&vif)
                    || (VIF_FB + 8..=VIF_FB + 9).contains(&vif);
            }
            VifRange::Volume => (0x10, 0x17),
            VifRange::AnyVolumeVIF => {
                return (0x10..=0x17).contains(&vif)
                    || (VIF_FB + 0x10..=VIF_FB + 0x11).contains(&vif)
                    || (VIF_FB + 0x21..=VIF_FB + 0x23).contains(&vif);
            }
            VifRange::Mass => (0x18, 0x1f),
            VifRange::OnTime => (0x20, 0x23),
            VifRange::OperatingTime => (0x24, 0x27),
            VifRange::PowerW => (0x28, 0x2f),
            VifRange::PowerJh => (0x30, 0x37),
            VifRange::AnyPowerVIF => {
                return (0x28..=0x37).contains(&vif)
                    || (VIF_FB + 0x28..=VIF_FB + 0x29).contains(&vif)
                    || (VIF_FB + 0x30..=VIF_FB + 0x31).contains(&vif);
            }
            VifRange::VolumeFlow => (0x38, 0x3f),
            VifRange::VolumeFlowExt => (0x40, 0x4f),
            VifRange::FlowTemperature => (0x58, 0x5b),
            VifRange::ReturnTemperature => (0x5c, 0x5f),
            VifRange::TemperatureDifference => (0x60, 0x63),
            VifRange::ExternalTemperature => (0x64, 0x67),
            VifRange::Pressure => (0x68, 0x6b),
            VifRange::Date => (0x6c, 0x6c),
            VifRange::DateTime => (0x6d, 0x6d),
            VifRange::HeatCostAllocation => (0x6e, 0x6e),
            VifRange::AveragingDuration => (0x70, 0x73),
            VifRange::ActualityDuration => (0x74, 0x77),
            VifRange::FabricationNo => (0x78, 0x78),
            VifRange::EnhancedIdentification => (0x79, 0x79),
            VifRange::AccessNumber => (VIF_FD + 0x08, VIF_FD + 0x08),
            VifRange::Medium => (VIF_FD + 0x09, VIF_FD + 0x09),
            VifRange::Manufacturer => (VIF_FD + 0x0a, VIF_FD + 0x0a),
            VifRange::ParameterSet => (VIF_FD + 0x0b, VIF_FD + 0x0b),
            VifRange::ModelVersion => (VIF_FD + 0x0c, VIF_FD + 0x0c),
            VifRange::HardwareVersion => (VIF_FD + 0x0d, VIF_FD + 0x0d),
            VifRange::FirmwareVersion => (VIF_FD + 0x0e, VIF_FD + 0x0e),
            VifRange::SoftwareVersion => (VIF_FD + 0x0f, VIF_FD + 0x0f),
            VifRange::ErrorFlags => (VIF_FD + 0x17, VIF_FD + 0x17),
            VifRange::ErrorMask => (VIF_FD + 0x18, VIF_FD + 0x18),
            VifRange::DigitalOutput => (VIF_FD + 0x1a, VIF_FD + 0x1a),
            VifRange::DigitalInput => (VIF_FD + 0x1b, VIF_FD + 0x1b),
            VifRange::StorageInterval => (VIF_FD + 0x24, VIF_FD + 0x27),
            VifRange::DurationSinceReadout => (VIF_FD + 0x2c, VIF_FD + 0x2f),
            VifRange::DurationOfTariff => (VIF_FD + 0x31, VIF_FD + 0x33),
            VifRange::Voltage => (VIF_FD + 0x40, VIF_FD + 0x4f),
            VifRange::Amperage => (VIF_FD + 0x50, VIF_FD + 0x5f),
            VifRange::ResetCounter => (VIF_FD + 0x60, VIF_FD + 0x60),
            VifRange::CumulationCounter => (VIF_FD + 0x61, VIF_FD + 0x61),
            VifRange::RemainingBattery => (VIF_FD + 0x74, VIF_FD + 0x74),
            VifRange::RelativeHumidity => (VIF_FB + 0x1a, VIF_FB + 0x1b),
            VifRange::ManufacturerSpecific => return vif == VIF_MFCT,
        };
        (lo..=hi).contains(&vif)
    }
}

/// The intrinsic unit of a vif and the factor that takes the raw number
/// into that unit. Auto scaling multiplies by the factor and then converts
/// from this unit to the field's display unit.
pub fn vif_unit_and_factor(vif: u16) -> Option<(Unit, f64)> {
    let n = (vif & 0x07) as i32;
    let nn = (vif & 0x03) as i32;
    let nnnn = (vif & 0x0f) as i32;

    let r = match vif {
        0x00..=0x07 => (Unit::Wh, pow10(n - 3)),
        0x08..=0x0f => (Unit::Mj, pow10(n - 6)),
        0x10..=0x17 => (Unit::M3, pow10(n - 6)),
        0x18..=0x1f => (Unit::Kg, pow10(n - 3)),
        0x20..=0x23 | 0x24..=0x27 | 0x70..=0x73 | 0x74..=0x77 => {
            let unit = match vif & 0x03 {
                0 => Unit::Second,
                1 => Unit::Minute,
                2 => Unit::Hour,
                _ => Unit::Day,
            };
            (unit, 1.0)
        }
        0x28..=0x2f => (Unit::W, pow10(n - 3)),
        0x30..=0x37 => (Unit::Jh, pow10(n)),
        0x38..=0x3f => (Unit::M3h, pow10(n - 6)),
        0x40..=0x47 => (Unit::M3h, 60.0 * pow10(n - 7)),
        0x48..=0x4f => (Unit::M3h, 3600.0 * pow10(n - 9)),
        0x58..=0x5b | 0x5c..=0x5f | 0x64..=0x67 => (Unit::Celsius, pow10(nn - 3)),
        0x60..=0x63 => (Unit::Kelvin, pow10(nn - 3)),
        0x68..=0x6b => (Unit::Bar, pow10(nn - 3)),
        0x6c => (Unit::DateLT, 1.0),
        0x6d => (Unit::DateTimeLT, 1.0),
        0x6e => (Unit::Hca, 1.0),
        0x78 | 0x79 => (Unit::Number, 1.0),

        /* Second extension table, 0xFD. */
        v if (VIF_FD + 0x40..=VIF_FD + 0x4f).contains(&v) => {
            (Unit::Volt, pow10(nnnn - 9))
        }
        v if (VIF_FD + 0x50..=VIF_FD + 0x5f).contains(&v) => {
            (Unit::Ampere, pow10(nnnn - 12))
        }
        v if (VIF_FD + 0x31..=VIF_FD + 0x33).contains(&v) => {
            let unit = match v & 0x03 {
                1 => Unit::Minute,
                2 => Unit::Hour,
                _ => Unit::Day,
            };
            (unit, 1.0)
        }
        v if v == VIF_FD + 0x60 || v == VIF_FD + 0x61 => (Unit::Counter, 1.0),
        v if v == VIF_FD + 0x08 => (Unit::Counter, 1.0),
        v if v == VIF_FD + 0x17 || v == VIF_FD + 0x18 => (Unit::Number, 1.0),

        /* First extension table, 0xFB. */
        v if v == VIF_FB || v == VIF_FB + 1 => (Unit::Kwh, 1000.0 * pow10(n - 1)),
        v if v == VIF_FB + 0x08 || v == VIF_FB + 0x09 => (Unit::Gj, pow10(n - 1)),
        v if v == VIF_FB + 0x10 || v == VIF_FB + 0x11 => (Unit::M3, pow10(n + 2)),
        v if v == VIF_FB + 0x1a || v == VIF_FB + 0x1b => (Unit::Rh, pow10((vif & 1) as i32 - 1)),

        _ => return None,
    };
    Some(r)
}

fn pow10(e: i32) -> f64 {
    10f64.powi(e)
}

/// Orthogonal (combinable) vifes that qualify the vif they follow.
/// 0x7C escapes into a second table, represented here as 0x7C00|next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VifCombinable {
    PerSecond,
    PerMinute,
    PerHour,
    PerDay,
    PerWeek,
    PerMonth,
    PerYear,
    ForwardFlow,
    BackwardFlow,
    DurationExceedsLowerLast,
    AtPhase1,
    AtPhase2,
    AtPhase3,
    Raw(u16),
}

impl VifCombinable {
    pub fn from_value(v: u16) -> VifCombinable {
        match v {
            0x20 => VifCombinable::PerSecond,
            0x21 => VifCombinable::PerMinute,
            0x22 => VifCombinable::PerHour,
            0x23 => VifCombinable::PerDay,
            0x24 => VifCombinable::PerWeek,
            0x25 => VifCombinable::PerMonth,
            0x26 => VifCombinable::PerYear,
            0x3b => VifCombinable::ForwardFlow,
            0x3c => VifCombinable::BackwardFlow,
            0x56 => VifCombinable::DurationExceedsLowerLast,
            0x7c01 => VifCombinable::AtPhase1,
            0x7c02 => VifCombinable::AtPhase2,
            0x7c03 => VifCombinable::AtPhase3,
            other => VifCombinable::Raw(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_class_spans_scales() {
        assert!(VifRange::AnyEnergyVIF.contains(0x06));
        assert!(VifRange::AnyEnergyVIF.contains(0x0e));
        assert!(VifRange::AnyEnergyVIF.contains(VIF_FB + 1));
        assert!(!VifRange::AnyEnergyVIF.contains(0x13));
    }

    #[test]
    fn kwh_scale_from_vif() {
        /* 0x06: energy 10^(6-3) Wh = kWh steps. */
        let (unit, factor) = vif_unit_and_factor(0x06).unwrap();
        assert_eq!(unit, Unit::Wh);
        assert_eq!(factor, 1000.0);
    }

    #[test]
    fn temperature_centi_degrees() {
        let (unit, factor) = vif_unit_and_factor(0x59).unwrap();
        assert_eq!(unit, Unit::Celsius);
        assert_eq!(factor, 0.01);
    }

    #[test]
    fn fd_voltage_scale() {
        let (unit, factor) = vif_unit_and_factor(VIF_FD + 0x49).unwrap();
        assert_eq!(unit, Unit::Volt);
        assert_eq!(factor, 1.0);
    }

    #[test]
    fn combinables_decode() {
        assert_eq!(VifCombinable::from_value(0x7c01), VifCombinable::AtPhase1);
        assert_eq!(VifCombinable::from_value(0x3c), VifCombinable::BackwardFlow);
        assert_eq!(VifCombinable::from_value(0x42), VifCombinable::Raw(0x42));
    }
}
