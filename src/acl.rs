use ipnet::IpNet;
use std::net::IpAddr;

/// Outcome of matching one rule against a `(hostname, ip)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    NoMatch,
}

/// Error raised when an ACL subject cannot be compiled
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("empty ACL subject")]
    EmptySubject,

    #[error("invalid CIDR in ACL subject {subject:?}: {source}")]
    InvalidCidr {
        subject: String,
        source: ipnet::AddrParseError,
    },
}

/// One compiled access-control rule.
///
/// Subjects compile to one of three variants: a CIDR block (subject
/// contains `/`), the `*` catch-all, or an exact hostname. Hostnames are
/// stored lowercased and compared case-insensitively.
#[derive(Debug, Clone)]
pub enum AclRule {
    Cidr { net: IpNet, allow: bool },
    Host { name: String, allow: bool },
    All { allow: bool },
}

impl AclRule {
    pub fn parse(subject: &str, allow: bool) -> Result<Self, AclError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(AclError::EmptySubject);
        }
        if subject == "*" {
            return Ok(AclRule::All { allow });
        }
        if subject.contains('/') {
            let net = subject.parse::<IpNet>().map_err(|source| AclError::InvalidCidr {
                subject: subject.to_string(),
                source,
            })?;
            return Ok(AclRule::Cidr { net, allow });
        }
        Ok(AclRule::Host {
            name: subject.to_ascii_lowercase(),
            allow,
        })
    }

    pub fn try_match(&self, ip: IpAddr, hostname: &str) -> Decision {
        match self {
            AclRule::Cidr { net, allow } => {
                if net.contains(&ip) {
                    decision(*allow)
                } else {
                    Decision::NoMatch
                }
            }
            AclRule::Host { name, allow } => {
                if hostname.eq_ignore_ascii_case(name) {
                    decision(*allow)
                } else {
                    Decision::NoMatch
                }
            }
            AclRule::All { allow } => decision(*allow),
        }
    }
}

fn decision(allow: bool) -> Decision {
    if allow {
        Decision::Allow
    } else {
        Decision::Deny
    }
}

/// One `allow`/`deny` configuration directive before compilation
#[derive(Debug, Clone)]
pub struct AclDirective {
    pub subjects: Vec<String>,
    pub allow: bool,
}

/// Private, loopback and link-local ranges denied after all user rules.
/// First match wins, so a user-supplied allow rule placed earlier still
/// opens any of these deliberately.
const BUILTIN_DENIES: &[&str] = &[
    "10.0.0.0/8",
    "127.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "::1/128",
    "fe80::/10",
];

/// Ordered access-control list, evaluated first-match-wins
#[derive(Debug)]
pub struct Acl {
    rules: Vec<AclRule>,
}

impl Acl {
    /// Compile user directives and append the built-in denies plus the
    /// final `*` allow catch-all.
    pub fn build(directives: &[AclDirective]) -> Result<Self, AclError> {
        let mut rules = Vec::new();
        for directive in directives {
            for subject in &directive.subjects {
                rules.push(AclRule::parse(subject, directive.allow)?);
            }
        }
        for cidr in BUILTIN_DENIES {
            rules.push(AclRule::parse(cidr, false)?);
        }
        rules.push(AclRule::All { allow: true });
        Ok(Self { rules })
    }

    /// First decisive rule wins; no decisive rule means deny.
    pub fn is_allowed(&self, hostname: &str, ip: IpAddr) -> bool {
        for rule in &self.rules {
            match rule.try_match(ip, hostname) {
                Decision::Allow => return true,
                Decision::Deny => return false,
                Decision::NoMatch => {}
            }
        }
        false
    }
}

/// Destination port check: an empty allow-list admits any non-zero port
pub fn port_is_allowed(allowed: &[u16], port: u16) -> bool {
    if port == 0 {
        return false;
    }
    allowed.is_empty() || allowed.contains(&port)
}
