use anyhow::{anyhow, Error, Result};

/// A transport protocol as it appears in a policy port declaration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

/// A protocol with an optional numeric port; no port means every port of the
/// protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtocolPort {
    pub protocol: Protocol,
    pub port: Option<u16>,
}

// === impl Protocol ===

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("sctp") {
            Ok(Self::Sctp)
        } else {
            Err(anyhow!("invalid protocol: {:?}", s))
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => "tcp".fmt(f),
            Self::Udp => "udp".fmt(f),
            Self::Sctp => "sctp".fmt(f),
        }
    }
}
