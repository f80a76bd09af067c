use std::fmt;

/// Radio link modes a dongle can listen or transmit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    C1,
    C2,
    T1,
    T2,
    S1,
    S1m,
    S2,
    N1a,
    N1b,
    N1c,
    N1d,
    N1e,
    N1f,
    Mbus,
    Lora,
    Unknown,
}

impl LinkMode {
    fn bit(&self) -> u32 {
        match self {
            LinkMode::C1 => 1 << 0,
            LinkMode::C2 => 1 << 1,
            LinkMode::T1 => 1 << 2,
            LinkMode::T2 => 1 << 3,
            LinkMode::S1 => 1 << 4,
            LinkMode::S1m => 1 << 5,
            LinkMode::S2 => 1 << 6,
            LinkMode::N1a => 1 << 7,
            LinkMode::N1b => 1 << 8,
            LinkMode::N1c => 1 << 9,
            LinkMode::N1d => 1 << 10,
            LinkMode::N1e => 1 << 11,
            LinkMode::N1f => 1 << 12,
            LinkMode::Mbus => 1 << 13,
            LinkMode::Lora => 1 << 14,
            LinkMode::Unknown => 0,
        }
    }

    pub fn from_str(s: &str) -> Option<LinkMode> {
        match s {
            "c1" => Some(LinkMode::C1),
            "c2" => Some(LinkMode::C2),
            "t1" => Some(LinkMode::T1),
            "t2" => Some(LinkMode::T2),
            "s1" => Some(LinkMode::S1),
            "s1m" => Some(LinkMode::S1m),
            "s2" => Some(LinkMode::S2),
            "n1a" => Some(LinkMode::N1a),
            "n1b" => Some(LinkMode::N1b),
            "n1c" => Some(LinkMode::N1c),
            "n1d" => Some(LinkMode::N1d),
            "n1e" => Some(LinkMode::N1e),
            "n1f" => Some(LinkMode::N1f),
            "mbus" => Some(LinkMode::Mbus),
            "lora" => Some(LinkMode::Lora),
            _ => None,
        }
    }
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkMode::C1 => "c1",
            LinkMode::C2 => "c2",
            LinkMode::T1 => "t1",
            LinkMode::T2 => "t2",
            LinkMode::S1 => "s1",
            LinkMode::S1m => "s1m",
            LinkMode::S2 => "s2",
            LinkMode::N1a => "n1a",
            LinkMode::N1b => "n1b",
            LinkMode::N1c => "n1c",
            LinkMode::N1d => "n1d",
            LinkMode::N1e => "n1e",
            LinkMode::N1f => "n1f",
            LinkMode::Mbus => "mbus",
            LinkMode::Lora => "lora",
            LinkMode::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A set of link modes. Each dongle family declares which subset and how
/// many simultaneous modes it can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkModeSet(u32);

impl LinkModeSet {
    pub fn empty() -> Self {
        LinkModeSet(0)
    }

    pub fn all() -> Self {
        LinkModeSet(u32::MAX >> 17)
    }

    pub fn add(&mut self, lm: LinkMode) -> &mut Self {
        self.0 |= lm.bit();
        self
    }

    pub fn with(mut self, lm: LinkMode) -> Self {
        self.0 |= lm.bit();
        self
    }

    pub fn has(&self, lm: LinkMode) -> bool {
        self.0 & lm.bit() != 0
    }

    pub fn union(&self, o: LinkModeSet) -> LinkModeSet {
        LinkModeSet(self.0 | o.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if every mode in `wanted` is present in this set.
    pub fn covers(&self, wanted: LinkModeSet) -> bool {
        self.0 & wanted.0 == wanted.0
    }

    pub fn modes(&self) -> Vec<LinkMode> {
        let all = [
            LinkMode::C1, LinkMode::C2, LinkMode::T1, LinkMode::T2, LinkMode::S1,
            LinkMode::S1m, LinkMode::S2, LinkMode::N1a, LinkMode::N1b, LinkMode::N1c,
            LinkMode::N1d, LinkMode::N1e, LinkMode::N1f, LinkMode::Mbus, LinkMode::Lora,
        ];
        all.into_iter().filter(|m| self.has(*m)).collect()
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Parse "c1,t1" style lists, "any" meaning everything.
    pub fn parse(s: &str) -> Option<LinkModeSet> {
        let mut set = LinkModeSet::empty();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part == "any" {
                return Some(LinkModeSet::all());
            }
            set.add(LinkMode::from_str(part)?);
        }
        Some(set)
    }

    pub fn hr(&self) -> String {
        let v: Vec<String> = self.modes().iter().map(|m| m.to_string()).collect();
        if v.is_empty() {
            "none".to_string()
        } else {
            v.join(",")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_print() {
        let set = LinkModeSet::parse("c1,t1").unwrap();
        assert!(set.has(LinkMode::C1));
        assert!(set.has(LinkMode::T1));
        assert!(!set.has(LinkMode::S1));
        assert_eq!(set.hr(), "c1,t1");
        assert!(LinkModeSet::parse("c1,bogus").is_none());
    }

    #[test]
    fn covers_checks_subset() {
        let caps = LinkModeSet::parse("c1,t1,s1").unwrap();
        assert!(caps.covers(LinkModeSet::parse("c1,t1").unwrap()));
        assert!(!LinkModeSet::parse("c1").unwrap().covers(caps));
    }
}
