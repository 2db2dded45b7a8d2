use ipnet::IpNet;
use rand::RngCore;
use std::net::IpAddr;

/// Error type for bind-range configuration
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("invalid bind address or CIDR: {0}")]
    Invalid(String),

    #[error("unsupported subnet to bind to: size must be a multiple of 8")]
    UnalignedPrefix,
}

/// A source-address range for outbound connections.
///
/// Configured as a CIDR whose prefix length is a whole number of octets, or
/// as a bare IP (a host-length range). Each dial picks a fresh address by
/// keeping the network prefix and randomizing the suffix octets.
#[derive(Debug, Clone)]
pub struct BindRange {
    net: IpNet,
}

impl BindRange {
    pub fn parse(s: &str) -> Result<Self, BindError> {
        if let Ok(net) = s.parse::<IpNet>() {
            if net.prefix_len() % 8 != 0 {
                return Err(BindError::UnalignedPrefix);
            }
            return Ok(Self { net });
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            let max = match ip {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            let net = IpNet::new(ip, max).map_err(|e| BindError::Invalid(e.to_string()))?;
            return Ok(Self { net });
        }
        Err(BindError::Invalid(s.to_string()))
    }

    /// Whether the range holds more than a single address.
    #[allow(dead_code)]
    pub fn is_single_address(&self) -> bool {
        match self.net {
            IpNet::V4(net) => net.prefix_len() == 32,
            IpNet::V6(net) => net.prefix_len() == 128,
        }
    }

    /// Pick a source address: network prefix octets are kept, the
    /// remaining octets come from the RNG.
    pub fn source_ip<R: RngCore>(&self, rng: &mut R) -> IpAddr {
        let prefix_octets = (self.net.prefix_len() / 8) as usize;
        match self.net.network() {
            IpAddr::V4(v4) => {
                let mut octets = v4.octets();
                rng.fill_bytes(&mut octets[prefix_octets..]);
                IpAddr::from(octets)
            }
            IpAddr::V6(v6) => {
                let mut octets = v6.octets();
                rng.fill_bytes(&mut octets[prefix_octets..]);
                IpAddr::from(octets)
            }
        }
    }
}
