use anyhow::{bail, Context, Error, Result};

/// A validated node-port range, rendered as `low:high` for multiport
/// matches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodePortRange {
    pub low: u16,
    pub high: u16,
}

// === impl NodePortRange ===

impl std::str::FromStr for NodePortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (low, high) = s
            .split_once(|c: char| c == ':' || c == '-')
            .ok_or_else(|| anyhow::anyhow!("invalid node-port range: {:?}", s))?;
        let low = low
            .trim()
            .parse::<u16>()
            .with_context(|| format!("parsing first port of range {:?}", s))?;
        let high = high
            .trim()
            .parse::<u16>()
            .with_context(|| format!("parsing second port of range {:?}", s))?;
        if low >= high {
            bail!("first port must be less than second port in range {:?}", s);
        }
        Ok(Self { low, high })
    }
}

impl std::fmt::Display for NodePortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}
