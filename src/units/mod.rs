use std::fmt;
use thiserror::Error;

/// What kind of physical quantity a field carries. Each quantity has a
/// default display unit that drivers can override per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Energy,
    Volume,
    Power,
    Flow,
    Temperature,
    Voltage,
    Amperage,
    Frequency,
    Pressure,
    Mass,
    Time,
    PointInTime,
    Text,
    Counter,
    Dimensionless,
}

impl Quantity {
    pub fn default_unit(&self) -> Unit {
        match self {
            Quantity::Energy => Unit::Kwh,
            Quantity::Volume => Unit::M3,
            Quantity::Power => Unit::Kw,
            Quantity::Flow => Unit::M3h,
            Quantity::Temperature => Unit::Celsius,
            Quantity::Voltage => Unit::Volt,
            Quantity::Amperage => Unit::Ampere,
            Quantity::Frequency => Unit::Hz,
            Quantity::Pressure => Unit::Bar,
            Quantity::Mass => Unit::Kg,
            Quantity::Time => Unit::Hour,
            Quantity::PointInTime => Unit::DateTimeLT,
            Quantity::Text => Unit::Txt,
            Quantity::Counter => Unit::Counter,
            Quantity::Dimensionless => Unit::Number,
        }
    }
}

/// Exponent vector over the SI base dimensions plus the extra dimensions
/// needed for meter data: kelvin/celsius/fahrenheit are kept apart so that
/// offset conversions stay explicit, and month/year/unix_timestamp make
/// calendar arithmetic typecheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SiExp {
    pub s: i8,
    pub m: i8,
    pub kg: i8,
    pub a: i8,
    pub mol: i8,
    pub cd: i8,
    pub k: i8,
    pub c: i8,
    pub f: i8,
    pub month: i8,
    pub year: i8,
    pub unix_timestamp: i8,
}

impl SiExp {
    pub fn new() -> Self {
        SiExp::default()
    }

    pub fn s(mut self, e: i8) -> Self { self.s = e; self }
    pub fn m(mut self, e: i8) -> Self { self.m = e; self }
    pub fn kg(mut self, e: i8) -> Self { self.kg = e; self }
    pub fn a(mut self, e: i8) -> Self { self.a = e; self }
    pub fn k(mut self, e: i8) -> Self { self.k = e; self }
    pub fn c(mut self, e: i8) -> Self { self.c = e; self }
    pub fn f(mut self, e: i8) -> Self { self.f = e; self }
    pub fn month(mut self, e: i8) -> Self { self.month = e; self }
    pub fn year(mut self, e: i8) -> Self { self.year = e; self }
    pub fn unix_timestamp(mut self, e: i8) -> Self { self.unix_timestamp = e; self }

    pub fn is_dimensionless(&self) -> bool {
        *self == SiExp::default()
    }

    /// Exponents add under multiplication.
    pub fn mul(&self, o: &SiExp) -> SiExp {
        SiExp {
            s: self.s + o.s,
            m: self.m + o.m,
            kg: self.kg + o.kg,
            a: self.a + o.a,
            mol: self.mol + o.mol,
            cd: self.cd + o.cd,
            k: self.k + o.k,
            c: self.c + o.c,
            f: self.f + o.f,
            month: self.month + o.month,
            year: self.year + o.year,
            unix_timestamp: self.unix_timestamp + o.unix_timestamp,
        }
    }

    /// Exponents subtract under division.
    pub fn div(&self, o: &SiExp) -> SiExp {
        SiExp {
            s: self.s - o.s,
            m: self.m - o.m,
            kg: self.kg - o.kg,
            a: self.a - o.a,
            mol: self.mol - o.mol,
            cd: self.cd - o.cd,
            k: self.k - o.k,
            c: self.c - o.c,
            f: self.f - o.f,
            month: self.month - o.month,
            year: self.year - o.year,
            unix_timestamp: self.unix_timestamp - o.unix_timestamp,
        }
    }

    /// Square root halves every exponent. Odd exponents cannot be halved.
    pub fn sqrt(&self) -> Option<SiExp> {
        let all = [self.s, self.m, self.kg, self.a, self.mol, self.cd,
                   self.k, self.c, self.f, self.month, self.year, self.unix_timestamp];
        if all.iter().any(|e| e % 2 != 0) {
            return None;
        }
        Some(SiExp {
            s: self.s / 2,
            m: self.m / 2,
            kg: self.kg / 2,
            a: self.a / 2,
            mol: self.mol / 2,
            cd: self.cd / 2,
            k: self.k / 2,
            c: self.c / 2,
            f: self.f / 2,
            month: self.month / 2,
            year: self.year / 2,
            unix_timestamp: self.unix_timestamp / 2,
        })
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum UnitError {
    #[error("cannot convert from {0} to {1}")]
    IncompatibleUnits(String, String),
    #[error("unknown unit \"{0}\"")]
    UnknownUnit(String),
}

/// All units a driver or the VIF tables can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Wh,
    Kwh,
    Mj,
    Gj,
    M3c,   // volume times temperature, kamstrup forward/return energy
    W,
    Kw,
    Jh,
    M3,
    Litre,
    M3h,
    Lh,
    Celsius,
    Kelvin,
    Fahrenheit,
    Volt,
    Ampere,
    Hz,
    Pa,
    Bar,
    Kg,
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
    UnixTimestamp,
    DateTimeUTC,
    DateTimeLT,
    DateLT,
    TimeLT,
    Hca,
    Rh,
    Counter,
    Factor,
    Number,
    Percentage,
    Txt,
}

impl Unit {
    /// Scale factor to the base unit of the same exponent vector.
    pub fn scale(&self) -> f64 {
        match self {
            Unit::Wh => 3.6e3,
            Unit::Kwh => 3.6e6,
            Unit::Mj => 1.0e6,
            Unit::Gj => 1.0e9,
            Unit::M3c => 1.0,
            Unit::W => 1.0,
            Unit::Kw => 1000.0,
            Unit::Jh => 1.0 / 3600.0,
            Unit::M3 => 1.0,
            Unit::Litre => 0.001,
            Unit::M3h => 3600.0,
            Unit::Lh => 3.6,
            Unit::Celsius => 1.0,
            Unit::Kelvin => 1.0,
            Unit::Fahrenheit => 1.0,
            Unit::Volt => 1.0,
            Unit::Ampere => 1.0,
            Unit::Hz => 1.0,
            Unit::Pa => 1.0,
            Unit::Bar => 100000.0,
            Unit::Kg => 1.0,
            Unit::Second => 1.0,
            Unit::Minute => 60.0,
            Unit::Hour => 3600.0,
            Unit::Day => 3600.0 * 24.0,
            Unit::Month => 1.0,
            Unit::Year => 1.0,
            Unit::UnixTimestamp => 1.0,
            Unit::DateTimeUTC => 1.0,
            Unit::DateTimeLT => 1.0,
            Unit::DateLT => 1.0,
            Unit::TimeLT => 1.0,
            Unit::Hca => 1.0,
            Unit::Rh => 1.0,
            Unit::Counter => 1.0,
            Unit::Factor => 1.0,
            Unit::Number => 1.0,
            Unit::Percentage => 1.0,
            Unit::Txt => 1.0,
        }
    }

    pub fn exp(&self) -> SiExp {
        match self {
            Unit::Wh | Unit::Kwh | Unit::Mj | Unit::Gj => SiExp::new().kg(1).m(2).s(-2),
            Unit::M3c => SiExp::new().m(3).c(1),
            Unit::W | Unit::Kw | Unit::Jh => SiExp::new().kg(1).m(2).s(-3),
            Unit::M3 | Unit::Litre => SiExp::new().m(3),
            Unit::M3h | Unit::Lh => SiExp::new().m(3).s(-1),
            Unit::Celsius => SiExp::new().c(1),
            Unit::Kelvin => SiExp::new().k(1),
            Unit::Fahrenheit => SiExp::new().f(1),
            Unit::Volt => SiExp::new().kg(1).m(2).s(-3).a(-1),
            Unit::Ampere => SiExp::new().a(1),
            Unit::Hz => SiExp::new().s(-1),
            Unit::Pa | Unit::Bar => SiExp::new().kg(1).m(-1).s(-2),
            Unit::Kg => SiExp::new().kg(1),
            Unit::Second | Unit::Minute | Unit::Hour | Unit::Day => SiExp::new().s(1),
            Unit::Month => SiExp::new().month(1),
            Unit::Year => SiExp::new().year(1),
            Unit::UnixTimestamp | Unit::DateTimeUTC | Unit::DateTimeLT | Unit::DateLT | Unit::TimeLT => {
                SiExp::new().unix_timestamp(1)
            }
            Unit::Hca | Unit::Rh | Unit::Counter | Unit::Factor | Unit::Number
            | Unit::Percentage | Unit::Txt => SiExp::new(),
        }
    }

    /// The lowercase suffix appended to json field names, eg total_energy_kwh.
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::Wh => "wh",
            Unit::Kwh => "kwh",
            Unit::Mj => "mj",
            Unit::Gj => "gj",
            Unit::M3c => "m3c",
            Unit::W => "w",
            Unit::Kw => "kw",
            Unit::Jh => "jh",
            Unit::M3 => "m3",
            Unit::Litre => "l",
            Unit::M3h => "m3h",
            Unit::Lh => "lh",
            Unit::Celsius => "c",
            Unit::Kelvin => "k",
            Unit::Fahrenheit => "f",
            Unit::Volt => "v",
            Unit::Ampere => "a",
            Unit::Hz => "hz",
            Unit::Pa => "pa",
            Unit::Bar => "bar",
            Unit::Kg => "kg",
            Unit::Second => "s",
            Unit::Minute => "min",
            Unit::Hour => "h",
            Unit::Day => "d",
            Unit::Month => "month",
            Unit::Year => "y",
            Unit::UnixTimestamp => "ut",
            Unit::DateTimeUTC => "utc",
            Unit::DateTimeLT => "datetime",
            Unit::DateLT => "date",
            Unit::TimeLT => "time",
            Unit::Hca => "hca",
            Unit::Rh => "rh",
            Unit::Counter => "counter",
            Unit::Factor => "factor",
            Unit::Number => "number",
            Unit::Percentage => "pct",
            Unit::Txt => "txt",
        }
    }

    /// Lookup from the suffix form used in selectfields and calculate_ keys.
    pub fn from_suffix(s: &str) -> Result<Unit, UnitError> {
        let all = [
            Unit::Wh, Unit::Kwh, Unit::Mj, Unit::Gj, Unit::M3c, Unit::W, Unit::Kw, Unit::Jh,
            Unit::M3, Unit::Litre, Unit::M3h, Unit::Lh, Unit::Celsius, Unit::Kelvin,
            Unit::Fahrenheit, Unit::Volt, Unit::Ampere, Unit::Hz, Unit::Pa, Unit::Bar, Unit::Kg,
            Unit::Second, Unit::Minute, Unit::Hour, Unit::Day, Unit::Month, Unit::Year,
            Unit::UnixTimestamp, Unit::DateTimeUTC, Unit::DateTimeLT, Unit::DateLT, Unit::TimeLT,
            Unit::Hca, Unit::Rh, Unit::Counter, Unit::Factor, Unit::Number, Unit::Percentage,
            Unit::Txt,
        ];
        for u in all {
            if u.suffix() == s {
                return Ok(u);
            }
        }
        Err(UnitError::UnknownUnit(s.to_string()))
    }

    fn is_kcf(&self) -> bool {
        matches!(self, Unit::Celsius | Unit::Kelvin | Unit::Fahrenheit)
    }

    /// Scale and offset mapping this temperature unit onto kelvin.
    fn kelvin_scale_offset(&self) -> (f64, f64) {
        match self {
            Unit::Kelvin => (1.0, 0.0),
            Unit::Celsius => (1.0, 273.15),
            Unit::Fahrenheit => (5.0 / 9.0, -32.0 * 5.0 / 9.0 + 273.15),
            _ => (1.0, 0.0),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Convert a value between two units. Same exponent vector means a pure
/// scale ratio, the temperature triple gets its offsets, anything else is
/// an error which callers render as NaN/null.
pub fn convert(value: f64, from: Unit, to: Unit) -> Result<f64, UnitError> {
    if from == to {
        return Ok(value);
    }

    if from.is_kcf() && to.is_kcf() {
        let (fs, fo) = from.kelvin_scale_offset();
        let (ts, to_off) = to.kelvin_scale_offset();
        let kelvin = value * fs + fo;
        return Ok((kelvin - to_off) / ts);
    }

    if from.exp() == to.exp() {
        return Ok(value * from.scale() / to.scale());
    }

    Err(UnitError::IncompatibleUnits(
        from.suffix().to_string(),
        to.suffix().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_scaling() {
        assert_eq!(convert(1000.0, Unit::Wh, Unit::Kwh).unwrap(), 1.0);
        assert_eq!(convert(1.0, Unit::Kwh, Unit::Wh).unwrap(), 1000.0);
        assert!((convert(1.0, Unit::Kwh, Unit::Gj).unwrap() - 0.0036).abs() < 1e-12);
    }

    #[test]
    fn volume_and_flow() {
        assert_eq!(convert(1.0, Unit::M3, Unit::Litre).unwrap(), 1000.0);
        assert_eq!(convert(500.0, Unit::Lh, Unit::M3h).unwrap(), 0.5);
    }

    #[test]
    fn temperature_offsets_roundtrip() {
        let c = 21.5;
        let k = convert(c, Unit::Celsius, Unit::Kelvin).unwrap();
        assert!((k - 294.65).abs() < 1e-9);
        let f = convert(k, Unit::Kelvin, Unit::Fahrenheit).unwrap();
        let back = convert(f, Unit::Fahrenheit, Unit::Celsius).unwrap();
        assert!((back - c).abs() < 1e-9);
    }

    #[test]
    fn roundtrip_within_ulp() {
        let pairs = [
            (Unit::Wh, Unit::Kwh),
            (Unit::M3, Unit::Litre),
            (Unit::Kw, Unit::W),
            (Unit::Hour, Unit::Second),
            (Unit::Bar, Unit::Pa),
        ];
        for (a, b) in pairs {
            let v = 123.456;
            let there = convert(v, a, b).unwrap();
            let back = convert(there, b, a).unwrap();
            assert!((back - v).abs() <= f64::EPSILON * v.abs() * 4.0, "{a} <-> {b}");
        }
    }

    #[test]
    fn incompatible_is_an_error() {
        assert!(convert(1.0, Unit::Kwh, Unit::M3).is_err());
        assert!(convert(1.0, Unit::UnixTimestamp, Unit::Volt).is_err());
    }

    #[test]
    fn exponent_arithmetic() {
        let power = Unit::Kw.exp();
        let time = Unit::Hour.exp();
        assert_eq!(power.mul(&time), Unit::Kwh.exp());
        assert_eq!(Unit::Kwh.exp().div(&time), power);
        assert_eq!(Unit::M3.exp().div(&Unit::Hour.exp()), Unit::M3h.exp());
    }

    #[test]
    fn sqrt_halves_exponents() {
        let area = SiExp::new().m(2);
        assert_eq!(area.sqrt().unwrap(), SiExp::new().m(1));
        assert!(SiExp::new().m(3).sqrt().is_none());
    }
}
