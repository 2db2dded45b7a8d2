use crate::acl::AclDirective;
use crate::auth::BasicCredentials;
use crate::bind::BindRange;
use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::warn;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Forward HTTP proxy",
    long_about = "fwdproxy accepts standard HTTP proxy requests (absolute-URI or CONNECT),\n\
authenticates clients, filters targets through an ordered ACL and port\n\
allow-list, and relays bytes to the target or through an upstream\n\
HTTP(S) CONNECT proxy.\n\n\
Features:\n\
- HTTP Basic proxy authentication (constant-time credential check)\n\
- Probe resistance: hide the proxy from unauthenticated scanners\n\
- PAC file endpoint\n\
- Non-local source binding within a CIDR (Linux free-bind)\n\
- Hostname rewriting at dial time\n"
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// IP address to bind the listener
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Proxy credentials in the format "user:pass"; repeatable. Presence
    /// enables proxy authentication.
    #[arg(long = "basic-auth", value_name = "USER:PASS")]
    pub basic_auth: Vec<String>,

    /// Hostnames this proxy instance is reachable as
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Allowed destination ports (empty allows all)
    #[arg(long, value_delimiter = ',')]
    pub ports: Vec<u16>,

    /// Do not augment the Forwarded header with the client address
    #[arg(long = "hide-ip")]
    pub hide_ip: bool,

    /// Do not add a Via header
    #[arg(long = "hide-via")]
    pub hide_via: bool,

    /// Enable probe resistance, optionally with a secret domain serving
    /// the hidden page. Requires --basic-auth.
    #[arg(long = "probe-resistance", value_name = "DOMAIN", num_args = 0..=1, default_missing_value = "")]
    pub probe_resistance: Option<String>,

    /// Serve a PAC file at the given path
    #[arg(long = "serve-pac", value_name = "PATH", num_args = 0..=1, default_missing_value = "/proxy.pac", action = clap::ArgAction::Append)]
    pub serve_pac: Vec<String>,

    /// Timeout in seconds for initial TCP connections
    #[arg(long = "dial-timeout", default_value_t = 30)]
    pub dial_timeout: u64,

    /// Upstream proxy URL; non-localhost upstreams must be https://
    #[arg(long, value_name = "URL", action = clap::ArgAction::Append)]
    pub upstream: Vec<String>,

    /// ACL entry; ACTION is allow, deny, allow_file or deny_file.
    /// Repeatable, evaluated in order.
    #[arg(long = "acl", num_args = 2, value_names = ["ACTION", "SUBJECT"], action = clap::ArgAction::Append)]
    pub acl: Vec<String>,

    /// Default source IP or CIDR for outbound connections (CIDR prefix
    /// must be a multiple of 8)
    #[arg(long, value_name = "IP|CIDR")]
    pub bind: Option<String>,

    /// Rewrite a target hostname at dial time. Repeatable.
    #[arg(long = "host-override", num_args = 2, value_names = ["HOST", "TARGET"], action = clap::ArgAction::Append)]
    pub host_override: Vec<String>,
}

/// Probe resistance settings
#[derive(Debug, Clone)]
pub struct ProbeResistance {
    /// Secret domain that serves the hidden page; may be empty, in which
    /// case only the auth-failure fallthrough behavior applies.
    pub domain: String,
}

/// Proxy configuration derived from CLI arguments
#[derive(Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub hosts: HashSet<String>,
    pub pac_path: Option<String>,
    pub hide_ip: bool,
    pub hide_via: bool,
    pub probe_resistance: Option<ProbeResistance>,
    pub dial_timeout: Duration,
    pub upstream: Option<String>,
    pub acl: Vec<AclDirective>,
    pub allowed_ports: Vec<u16>,
    pub default_bind: Option<BindRange>,
    pub auth_required: bool,
    pub credentials: BasicCredentials,
    pub host_override: HashMap<String, String>,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Result<Self> {
        let listen_addr = SocketAddr::from((args.listen_ip, args.port));

        let mut credentials = BasicCredentials::new();
        for entry in &args.basic_auth {
            let (user, pass) = entry
                .split_once(':')
                .ok_or_else(|| eyre!("invalid --basic-auth {entry:?}, expected user:pass"))?;
            credentials
                .add(user, pass)
                .map_err(|e| eyre!("invalid --basic-auth {entry:?}: {e}"))?;
        }
        let auth_required = !credentials.is_empty();

        let hosts = args
            .hosts
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect::<HashSet<_>>();

        for port in &args.ports {
            if *port == 0 {
                return Err(eyre!("ports are expected to be in the 1-65535 range"));
            }
        }

        let probe_resistance = match args.probe_resistance {
            Some(domain) => {
                if !auth_required {
                    return Err(eyre!("probe resistance requires authentication"));
                }
                if domain.chars().any(|c| c.is_ascii_uppercase()) {
                    warn!("secret domain appears to have uppercase letters in it, which are not visitable");
                }
                Some(ProbeResistance {
                    domain: domain.to_ascii_lowercase(),
                })
            }
            None => None,
        };

        if args.serve_pac.len() > 1 {
            return Err(eyre!("--serve-pac specified twice"));
        }
        let pac_path = args.serve_pac.into_iter().next().map(|path| {
            if path.starts_with('/') {
                path
            } else {
                format!("/{path}")
            }
        });

        if args.upstream.len() > 1 {
            return Err(eyre!("--upstream specified more than once"));
        }
        let upstream = args.upstream.into_iter().next();

        let mut acl = Vec::new();
        for pair in args.acl.chunks(2) {
            let [action, subject] = pair else {
                return Err(eyre!("--acl expects an action and a subject"));
            };
            let (subjects, allow) = match action.as_str() {
                "allow" => (vec![subject.clone()], true),
                "deny" => (vec![subject.clone()], false),
                "allow_file" => (read_subjects_from_file(subject)?, true),
                "deny_file" => (read_subjects_from_file(subject)?, false),
                other => {
                    return Err(eyre!(
                        "expected acl action allow/deny/allow_file/deny_file, got: {other}"
                    ))
                }
            };
            acl.push(AclDirective { subjects, allow });
        }

        let default_bind = args
            .bind
            .as_deref()
            .map(BindRange::parse)
            .transpose()
            .map_err(|e| eyre!("invalid --bind: {e}"))?;

        let mut host_override = HashMap::new();
        for pair in args.host_override.chunks(2) {
            let [host, target] = pair else {
                return Err(eyre!("--host-override expects a host and a target"));
            };
            host_override.insert(host.to_ascii_lowercase(), target.clone());
        }

        Ok(Self {
            listen_addr,
            hosts,
            pac_path,
            hide_ip: args.hide_ip,
            hide_via: args.hide_via,
            probe_resistance,
            dial_timeout: Duration::from_secs(args.dial_timeout),
            upstream,
            acl,
            allowed_ports: args.ports,
            default_bind,
            auth_required,
            credentials,
            host_override,
        })
    }
}

/// Read ACL subjects from a file, one per line.
fn read_subjects_from_file(filename: &str) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(filename)
        .map_err(|e| eyre!("failed to read ACL file {filename}: {e}"))?;
    Ok(content
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}
