use ipnet::IpNet;
use std::net::IpAddr;

/// A CIDR with a list of excluded sub-networks, as declared by a policy
/// rule's `ipBlock` peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NetworkMatch {
    /// The network to match against.
    pub net: IpNet,

    /// Networks to exclude from the match.
    pub except: Vec<IpNet>,
}

// === impl NetworkMatch ===

impl From<IpAddr> for NetworkMatch {
    fn from(net: IpAddr) -> Self {
        IpNet::from(net).into()
    }
}

impl From<IpNet> for NetworkMatch {
    fn from(net: IpNet) -> Self {
        Self {
            net,
            except: vec![],
        }
    }
}

impl NetworkMatch {
    /// Expands the match into the set of CIDRs that cover `net` minus every
    /// `except` network, so it can be expressed as plain address matches.
    pub fn allowed_nets(&self) -> Vec<IpNet> {
        let mut nets = vec![self.net];
        for except in &self.except {
            nets = nets
                .into_iter()
                .flat_map(|net| subtract(net, except))
                .collect();
        }
        nets
    }
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    // CIDRs are aligned, so two networks overlap iff one contains the
    // other's network address.
    a.contains(&b.network()) || b.contains(&a.network())
}

fn subtract(net: IpNet, except: &IpNet) -> Vec<IpNet> {
    if !overlaps(&net, except) {
        return vec![net];
    }
    if except.prefix_len() <= net.prefix_len() {
        return vec![];
    }
    net.subnets(net.prefix_len() + 1)
        .expect("the exception's longer prefix bounds this below the address width")
        .flat_map(|half| subtract(half, except))
        .collect()
}
