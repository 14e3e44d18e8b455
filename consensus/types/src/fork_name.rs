use std::fmt;
use std::str::FromStr;

/// The name of a consensus-layer hard fork.
///
/// Ordering follows activation order, so range checks like
/// `fork >= ForkName::Altair` are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ForkName {
    Base,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
    Electra,
}

impl ForkName {
    pub fn list_all() -> Vec<ForkName> {
        vec![
            ForkName::Base,
            ForkName::Altair,
            ForkName::Bellatrix,
            ForkName::Capella,
            ForkName::Deneb,
            ForkName::Electra,
        ]
    }

    /// Stable numeric tag used by the recovery log to pick the SSZ decoder.
    pub fn as_u8(self) -> u8 {
        match self {
            ForkName::Base => 1,
            ForkName::Altair => 2,
            ForkName::Bellatrix => 3,
            ForkName::Capella => 4,
            ForkName::Deneb => 5,
            ForkName::Electra => 6,
        }
    }

    pub fn from_u8(tag: u8) -> Option<ForkName> {
        match tag {
            1 => Some(ForkName::Base),
            2 => Some(ForkName::Altair),
            3 => Some(ForkName::Bellatrix),
            4 => Some(ForkName::Capella),
            5 => Some(ForkName::Deneb),
            6 => Some(ForkName::Electra),
            _ => None,
        }
    }
}

impl fmt::Display for ForkName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ForkName::Base => "phase0".fmt(f),
            ForkName::Altair => "altair".fmt(f),
            ForkName::Bellatrix => "bellatrix".fmt(f),
            ForkName::Capella => "capella".fmt(f),
            ForkName::Deneb => "deneb".fmt(f),
            ForkName::Electra => "electra".fmt(f),
        }
    }
}

impl FromStr for ForkName {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Ok(match name.to_lowercase().as_str() {
            "phase0" | "base" => ForkName::Base,
            "altair" => ForkName::Altair,
            "bellatrix" | "merge" => ForkName::Bellatrix,
            "capella" => ForkName::Capella,
            "deneb" => ForkName::Deneb,
            "electra" => ForkName::Electra,
            other => return Err(format!("unknown fork name: {other}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(ForkName::Altair < ForkName::Capella);
        assert!(ForkName::Electra >= ForkName::Deneb);
    }

    #[test]
    fn tag_round_trip() {
        for fork in ForkName::list_all() {
            assert_eq!(ForkName::from_u8(fork.as_u8()), Some(fork));
        }
        assert_eq!(ForkName::from_u8(0), None);
    }
}
