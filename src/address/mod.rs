use thiserror::Error;

/// Wildcard sentinels. A manufacturer of 0xffff or a version/type of 0xff
/// in an expression means "match anything".
pub const MFCT_ANY: u16 = 0xffff;
pub const VERSION_ANY: u8 = 0xff;
pub const TYPE_ANY: u8 = 0xff;

#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("invalid address expression \"{0}\"")]
    InvalidExpression(String),
    #[error("invalid qualifier \"{0}\" in address expression")]
    InvalidQualifier(String),
}

/// Pack three uppercase letters @..Z into the 15 bit m-field.
pub fn pack_mfct(a: u8, b: u8, c: u8) -> u16 {
    (((a - 64) as u16) << 10) | (((b - 64) as u16) << 5) | ((c - 64) as u16)
}

/// The three letter flag for an m-field, eg 0x2d2c -> "KAM".
pub fn mfct_flag(mfct: u16) -> String {
    let a = ((mfct / 1024) % 32) as u8 + 64;
    let b = ((mfct / 32) % 32) as u8 + 64;
    let c = (mfct % 32) as u8 + 64;
    String::from_utf8(vec![a, b, c]).unwrap_or_else(|_| "???".to_string())
}

fn flag_to_mfct(s: &str) -> Option<u16> {
    let b = s.as_bytes();
    if b.len() != 3 {
        return None;
    }
    for c in b {
        if !(b'@'..=b'Z').contains(c) {
            return None;
        }
    }
    Some(pack_mfct(b[0], b[1], b[2]))
}

/// One address as seen on the wire, either from the dll or the tpl header.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    /// Eight bcd/hex digits printed big endian.
    pub id: String,
    pub mfct: u16,
    pub version: u8,
    pub r#type: u8,
    pub mbus_primary: bool,
}

impl Address {
    /// Decode an 8 byte wmbus address block where the m-field comes first:
    /// M M A A A A V T.
    pub fn decode_mfct_first(b: &[u8]) -> Address {
        Address {
            mfct: (b[1] as u16) << 8 | b[0] as u16,
            id: format!("{:02x}{:02x}{:02x}{:02x}", b[5], b[4], b[3], b[2]),
            version: b[6],
            r#type: b[7],
            mbus_primary: false,
        }
    }

    /// Decode an 8 byte tpl address block where the a-field comes first:
    /// A A A A M M V T.
    pub fn decode_id_first(b: &[u8]) -> Address {
        Address {
            id: format!("{:02x}{:02x}{:02x}{:02x}", b[3], b[2], b[1], b[0]),
            mfct: (b[5] as u16) << 8 | b[4] as u16,
            version: b[6],
            r#type: b[7],
            mbus_primary: false,
        }
    }

    pub fn str(&self) -> String {
        let mut s = self.id.clone();
        if self.mfct != MFCT_ANY {
            s += &format!(".M={}", mfct_flag(self.mfct));
        }
        if self.version != VERSION_ANY {
            s += &format!(".V={:02x}", self.version);
        }
        if self.r#type != TYPE_ANY {
            s += &format!(".T={:02x}", self.r#type);
        }
        s
    }
}

/// Which parts of an observed address an auto-generated gating expression
/// should bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    None,
    Id,
    IdMfct,
    Full,
}

impl IdentityMode {
    pub fn parse(s: &str) -> Option<IdentityMode> {
        match s {
            "none" => Some(IdentityMode::None),
            "id" => Some(IdentityMode::Id),
            "id-mfct" => Some(IdentityMode::IdMfct),
            "full" => Some(IdentityMode::Full),
            _ => None,
        }
    }
}

/// A single parsed match expression like "12345678", "1234*.M=KAM",
/// "!22*", "R76543210.V=01.T=07" or "p0" for an mbus primary address.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressExpression {
    pub id: String,
    pub mfct: u16,
    pub version: u8,
    pub r#type: u8,
    pub mbus_primary: bool,
    pub has_wildcard: bool,
    /// A match on this expression filters the telegram out.
    pub filter_out: bool,
    /// At least one required expression must match or the telegram is rejected.
    pub required: bool,
}

impl AddressExpression {
    pub fn parse(input: &str) -> Result<AddressExpression, AddressError> {
        let mut s = input.trim();
        if s.is_empty() {
            return Err(AddressError::InvalidExpression(input.to_string()));
        }

        let mut filter_out = false;
        let mut required = false;

        if let Some(rest) = s.strip_prefix('!') {
            filter_out = true;
            s = rest;
            if s.starts_with('!') {
                return Err(AddressError::InvalidExpression(input.to_string()));
            }
        } else if let Some(rest) = s.strip_prefix('R') {
            required = true;
            s = rest;
        }

        let mut parts = s.split('.');
        let mut id = parts.next().unwrap_or("").to_string();
        if id == "ANYID" {
            id = "*".to_string();
        }

        let mut has_wildcard = false;
        let mut mbus_primary = false;
        if !is_valid_id_pattern(&id, &mut has_wildcard) {
            // Not a long id, check the p0..p250 mbus primary form.
            let ok = id.len() >= 2
                && id.starts_with('p')
                && id[1..].chars().all(|c| c.is_ascii_digit())
                && id[1..].parse::<u32>().map(|v| v <= 250).unwrap_or(false);
            if !ok {
                return Err(AddressError::InvalidExpression(input.to_string()));
            }
            mbus_primary = true;
        }

        let mut mfct = MFCT_ANY;
        let mut version = VERSION_ANY;
        let mut r#type = TYPE_ANY;

        for q in parts {
            let (key, value) = match q.split_once('=') {
                Some(kv) => kv,
                None => return Err(AddressError::InvalidQualifier(q.to_string())),
            };
            match (key, value.len()) {
                ("V", 2) => {
                    let b = hex::decode(value)
                        .map_err(|_| AddressError::InvalidQualifier(q.to_string()))?;
                    version = b[0];
                }
                ("T", 2) => {
                    let b = hex::decode(value)
                        .map_err(|_| AddressError::InvalidQualifier(q.to_string()))?;
                    r#type = b[0];
                }
                ("M", 3) => {
                    mfct = flag_to_mfct(value)
                        .ok_or_else(|| AddressError::InvalidQualifier(q.to_string()))?;
                }
                ("M", 4) => {
                    // Explicit hex m-field, stored little endian in the expression.
                    let b = hex::decode(value)
                        .map_err(|_| AddressError::InvalidQualifier(q.to_string()))?;
                    mfct = (b[1] as u16) << 8 | b[0] as u16;
                }
                _ => return Err(AddressError::InvalidQualifier(q.to_string())),
            }
        }

        Ok(AddressExpression {
            id,
            mfct,
            version,
            r#type,
            mbus_primary,
            has_wildcard,
            filter_out,
            required,
        })
    }

    /// Parse a comma separated sequence of expressions.
    pub fn parse_sequence(input: &str) -> Result<Vec<AddressExpression>, AddressError> {
        let mut r = Vec::new();
        for part in input.split(',') {
            r.push(AddressExpression::parse(part)?);
        }
        Ok(r)
    }

    pub fn str(&self) -> String {
        let mut s = String::new();
        if self.filter_out {
            s.push('!');
        }
        if self.required {
            s.push('R');
        }
        s.push_str(&self.id);
        if self.mfct != MFCT_ANY {
            s += &format!(".M={}", mfct_flag(self.mfct));
        }
        if self.version != VERSION_ANY {
            s += &format!(".V={:02x}", self.version);
        }
        if self.r#type != TYPE_ANY {
            s += &format!(".T={:02x}", self.r#type);
        }
        s
    }

    /// Does this expression match the given concrete address fields?
    pub fn matches(&self, id: &str, mfct: u16, version: u8, r#type: u8) -> bool {
        if self.mfct != MFCT_ANY && self.mfct != mfct {
            return false;
        }
        if self.version != VERSION_ANY && self.version != version {
            return false;
        }
        if self.r#type != TYPE_ANY && self.r#type != r#type {
            return false;
        }
        id_matches_pattern(id, &self.id)
    }

    /// Rebind this expression from the most recently observed address,
    /// wildcarding everything the identity mode does not pin down.
    pub fn trim_to_identity(&mut self, mode: IdentityMode, a: &Address) {
        match mode {
            IdentityMode::Full => {
                self.id = a.id.clone();
                self.mfct = a.mfct;
                self.version = a.version;
                self.r#type = a.r#type;
                self.required = true;
            }
            IdentityMode::IdMfct => {
                self.id = a.id.clone();
                self.mfct = a.mfct;
                self.version = VERSION_ANY;
                self.r#type = TYPE_ANY;
                self.required = true;
            }
            IdentityMode::Id => {
                self.id = a.id.clone();
                self.mfct = MFCT_ANY;
                self.version = VERSION_ANY;
                self.r#type = TYPE_ANY;
                self.required = true;
            }
            IdentityMode::None => {}
        }
    }
}

/// An id pattern is 8 bcd/hex digits, or up to 7 digits followed by '*'.
/// Some non-compliant meters use full hex in the id so hex is accepted.
fn is_valid_id_pattern(id: &str, has_wildcard: &mut bool) -> bool {
    if id.is_empty() {
        return false;
    }
    let mut digits = 0;
    let mut rest = id;
    while let Some(c) = rest.chars().next() {
        if c.is_ascii_digit() || ('a'..='f').contains(&c) {
            digits += 1;
            rest = &rest[1..];
        } else {
            break;
        }
    }
    let wildcard = rest == "*";
    if !wildcard && !rest.is_empty() {
        return false;
    }
    if wildcard {
        *has_wildcard = true;
        return digits <= 7;
    }
    digits == 8
}

fn id_matches_pattern(id: &str, pattern: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => id.starts_with(prefix),
        None => id == pattern,
    }
}

/// Evaluate an expression set against every address a telegram exposes.
/// A positive match anywhere wins, a negative match anywhere kills the
/// telegram, and every required expression must be satisfied somewhere.
/// Returns (matched, used_wildcard). Every address is walked even after
/// an early match, and each matching address overwrites the wildcard
/// flag, so the last winning match decides how it was won.
pub fn telegram_matches(
    addresses: &[Address],
    expressions: &[AddressExpression],
) -> (bool, bool) {
    let mut matched = false;
    let mut used_wildcard = false;
    let mut filtered_out = false;
    let mut required_found = false;
    let mut required_ok = false;

    for a in addresses {
        let mut found_match = false;
        let mut exact_match = false;
        for ae in expressions {
            if ae.required {
                required_found = true;
            }
            let m = ae.matches(&a.id, a.mfct, a.version, a.r#type);
            if !m {
                continue;
            }
            if ae.filter_out {
                filtered_out = true;
            } else if ae.required {
                required_ok = true;
            } else {
                found_match = true;
                if !ae.has_wildcard {
                    exact_match = true;
                }
            }
        }
        if found_match {
            matched = true;
            used_wildcard = !exact_match;
        }
    }

    if filtered_out || (required_found && !required_ok) {
        return (false, false);
    }
    (matched, matched && used_wildcard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: &str, mfct: u16, version: u8, t: u8) -> Address {
        Address { id: id.to_string(), mfct, version, r#type: t, mbus_primary: false }
    }

    #[test]
    fn parse_simple_id() {
        let ae = AddressExpression::parse("12345678").unwrap();
        assert_eq!(ae.id, "12345678");
        assert!(!ae.has_wildcard);
        assert_eq!(ae.mfct, MFCT_ANY);
    }

    #[test]
    fn parse_wildcards() {
        assert!(AddressExpression::parse("*").unwrap().has_wildcard);
        assert!(AddressExpression::parse("1234*").unwrap().has_wildcard);
        // Without wildcard the id must be exactly 8 digits.
        assert!(AddressExpression::parse("1234567").is_err());
        // With wildcard at most 7.
        assert!(AddressExpression::parse("12345678*").is_err());
    }

    #[test]
    fn parse_qualifiers() {
        let ae = AddressExpression::parse("12345678.M=KAM.V=1b.T=16").unwrap();
        assert_eq!(ae.mfct, pack_mfct(b'K', b'A', b'M'));
        assert_eq!(ae.version, 0x1b);
        assert_eq!(ae.r#type, 0x16);

        let hexed = AddressExpression::parse("12345678.M=2d2c").unwrap();
        assert_eq!(hexed.mfct, 0x2c2d);
    }

    #[test]
    fn anyid_is_rewritten() {
        let ae = AddressExpression::parse("ANYID").unwrap();
        assert_eq!(ae.id, "*");
        assert!(ae.has_wildcard);
    }

    #[test]
    fn mbus_primary_form() {
        let ae = AddressExpression::parse("p0").unwrap();
        assert!(ae.mbus_primary);
        assert!(AddressExpression::parse("p251").is_err());
        assert!(AddressExpression::parse("p").is_err());
    }

    #[test]
    fn negation_and_required_flags() {
        assert!(AddressExpression::parse("!12345678").unwrap().filter_out);
        assert!(AddressExpression::parse("R12345678").unwrap().required);
        assert!(AddressExpression::parse("!!12345678").is_err());
    }

    #[test]
    fn stringify_roundtrip() {
        for s in ["12345678", "1234*", "!22222222", "R12345678.M=KAM.V=1b.T=16", "*"] {
            let ae = AddressExpression::parse(s).unwrap();
            let again = AddressExpression::parse(&ae.str()).unwrap();
            assert_eq!(ae, again, "{s}");
        }
    }

    #[test]
    fn matching_with_qualifiers() {
        let ae = AddressExpression::parse("76543210.M=KAM").unwrap();
        let kam = pack_mfct(b'K', b'A', b'M');
        assert!(ae.matches("76543210", kam, 0x1b, 0x16));
        assert!(!ae.matches("76543210", 0x1111, 0x1b, 0x16));
    }

    #[test]
    fn negative_match_kills_telegram() {
        let exprs = AddressExpression::parse_sequence("*,!12345678").unwrap();
        let (m, _) = telegram_matches(&[addr("11111111", 1, 1, 1)], &exprs);
        assert!(m);
        let (m, _) = telegram_matches(&[addr("12345678", 1, 1, 1)], &exprs);
        assert!(!m);
    }

    #[test]
    fn required_gate() {
        let exprs = AddressExpression::parse_sequence("*,R12345678").unwrap();
        let (m, _) = telegram_matches(&[addr("11111111", 1, 1, 1)], &exprs);
        assert!(!m, "required expression missing, reject");
        let (m, _) = telegram_matches(&[addr("12345678", 1, 1, 1)], &exprs);
        assert!(m);
    }

    #[test]
    fn wildcard_flag_reported() {
        let exprs = AddressExpression::parse_sequence("1234*").unwrap();
        let (m, wild) = telegram_matches(&[addr("12345678", 1, 1, 1)], &exprs);
        assert!(m && wild);
        let exprs = AddressExpression::parse_sequence("12345678").unwrap();
        let (m, wild) = telegram_matches(&[addr("12345678", 1, 1, 1)], &exprs);
        assert!(m && !wild);
    }

    #[test]
    fn last_matching_address_decides_wildcard_flag() {
        /* Both addresses match, the first via wildcard, the second
           exactly; each matching address overwrites the flag. */
        let exprs = AddressExpression::parse_sequence("11*,22222222").unwrap();
        let (m, wild) =
            telegram_matches(&[addr("11111111", 1, 1, 1), addr("22222222", 1, 1, 1)], &exprs);
        assert!(m && !wild);
        let (m, wild) =
            telegram_matches(&[addr("22222222", 1, 1, 1), addr("11111111", 1, 1, 1)], &exprs);
        assert!(m && wild);
    }

    #[test]
    fn trim_to_identity_modes() {
        let a = addr("12345678", 0x2c2d, 0x1b, 0x16);
        let mut ae = AddressExpression::parse("*").unwrap();
        ae.trim_to_identity(IdentityMode::IdMfct, &a);
        assert_eq!(ae.id, "12345678");
        assert_eq!(ae.mfct, 0x2c2d);
        assert_eq!(ae.version, VERSION_ANY);
        assert!(ae.required);
    }

    #[test]
    fn mfct_flag_roundtrip() {
        let kam = pack_mfct(b'K', b'A', b'M');
        assert_eq!(mfct_flag(kam), "KAM");
        assert_eq!(flag_to_mfct("KAM"), Some(kam));
    }
}
