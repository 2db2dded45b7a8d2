use crate::acl::{port_is_allowed, Acl};
use crate::auth::{AuthError, AuthUser, BasicCredentials};
use crate::config::{ProbeResistance, ProxyConfig};
use crate::dialer::Dialer;
use crate::error::{ProxyError, ProxyResult, PROXY_AUTHENTICATE_VALUE};
use crate::stream::ProxyStream;
use crate::upstream::{build_tls_connector, UpstreamProxy};
use crate::{forward, tunnel};
use bytes::Bytes;
use color_eyre::eyre::{eyre, Result};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, FORWARDED, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, SERVER};
use hyper::{Method, Request, Response, StatusCode, Version};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Response body type used throughout the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Per-request bind override header
const PROXY_NONLOCAL_SOURCE: &str = "proxy-nonlocal-source";

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// Handler invoked for requests addressed to the proxy host itself rather
/// than through the proxy (the colocated site).
pub type NextHandler = Arc<
    dyn Fn(Request<Incoming>) -> Pin<Box<dyn Future<Output = Response<ProxyBody>> + Send>>
        + Send
        + Sync,
>;

fn default_next() -> NextHandler {
    Arc::new(|_req| {
        Box::pin(async {
            let mut response = Response::new(full("404 page not found"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        })
    })
}

/// A provisioned forward-proxy instance.
///
/// Immutable after construction; serves many concurrent requests for the
/// process lifetime.
pub struct Handler {
    pub(crate) hosts: HashSet<String>,
    pub(crate) pac_path: Option<String>,
    pub(crate) hide_ip: bool,
    pub(crate) hide_via: bool,
    pub(crate) probe_resistance: Option<ProbeResistance>,
    pub(crate) auth_required: bool,
    pub(crate) credentials: BasicCredentials,
    pub(crate) acl: Acl,
    pub(crate) allowed_ports: Vec<u16>,
    pub(crate) host_override: HashMap<String, String>,
    pub(crate) dialer: Dialer,
    pub(crate) upstream: Option<UpstreamProxy>,
    pub(crate) origin_tls: TlsConnector,
    pub(crate) next: NextHandler,
}

impl Handler {
    /// Validate the configuration, compile the ACL and construct the
    /// dialers.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let acl = Acl::build(&config.acl).map_err(|e| eyre!("invalid ACL: {e}"))?;
        let dialer = Dialer::new(config.dial_timeout, config.default_bind.clone());
        let upstream = config
            .upstream
            .as_deref()
            .map(UpstreamProxy::from_url)
            .transpose()?;
        let origin_tls = build_tls_connector(false)?;

        if let Some(probe) = &config.probe_resistance {
            if !probe.domain.is_empty() {
                info!("secret domain used to connect to the proxy: {}", probe.domain);
            }
        }

        Ok(Self {
            hosts: config.hosts,
            pac_path: config.pac_path,
            hide_ip: config.hide_ip,
            hide_via: config.hide_via,
            probe_resistance: config.probe_resistance,
            auth_required: config.auth_required,
            credentials: config.credentials,
            acl,
            allowed_ports: config.allowed_ports,
            host_override: config.host_override,
            dialer,
            upstream,
            origin_tls,
            next: default_next(),
        })
    }

    /// Replace the colocated-site handler.
    pub fn with_next(mut self, next: NextHandler) -> Self {
        self.next = next;
        self
    }

    /// Classify and serve one request.
    pub async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> ProxyResult<Response<ProxyBody>> {
        let raw_host = request_host(&req).unwrap_or_default();
        let req_host = host_only(&raw_host);

        let mut auth_err: Option<AuthError> = None;
        if self.auth_required {
            match self.credentials.check(req.headers().get(PROXY_AUTHORIZATION)) {
                Ok(user) => {
                    debug!(user = %user, "proxy client authenticated");
                    req.extensions_mut().insert(AuthUser(user));
                }
                Err(e) => auth_err = Some(e),
            }
        }

        // Secret domain serves the hidden page whether or not the client
        // is authenticated; the page itself reveals which.
        if let Some(probe) = &self.probe_resistance {
            if !probe.domain.is_empty() && req_host == probe.domain {
                return Ok(serve_hidden_page(auth_err.is_none()));
            }
        }

        // Requests TO the proxy host: always for non-CONNECT, and for
        // CONNECT only when unauthenticated (probe resistance keeps the
        // hostname looking like an ordinary site).
        if self.hosts.contains(&req_host)
            && (req.method() != Method::CONNECT || auth_err.is_some())
        {
            if let Some(pac_path) = &self.pac_path {
                if req.uri().path() == pac_path {
                    return Ok(serve_pac_file(&raw_host));
                }
            }
            return Ok((self.next)(req).await);
        }

        if let Some(err) = auth_err {
            if self.probe_resistance.is_some() {
                // requested URI does not match the secret domain; act like
                // this proxy handler does not even exist
                return Ok((self.next)(req).await);
            }
            return Err(ProxyError::AuthRequired(err.to_string()));
        }

        match req.version() {
            Version::HTTP_10 | Version::HTTP_11 | Version::HTTP_2 | Version::HTTP_3 => {}
            version => return Err(ProxyError::VersionNotSupported(version)),
        }

        let ctx_headers = if self.hide_ip {
            Vec::new()
        } else {
            forwarded_context(req.headers(), client_addr)
        };
        let bind = parse_bind_override(req.headers().get(PROXY_NONLOCAL_SOURCE));

        if req.method() == Method::CONNECT {
            tunnel::handle_connect(self.as_ref(), req, bind, ctx_headers).await
        } else {
            forward::handle_forward(self.as_ref(), req, client_addr, bind, ctx_headers).await
        }
    }

    /// Enforce the access-control pipeline, then dial.
    ///
    /// With an upstream proxy configured, resolution and policy are
    /// delegated to it. Otherwise: port allow-list, hostname override,
    /// DNS, then per-address ACL consultation with dial fallback across
    /// the resolved addresses.
    pub(crate) async fn dial_context_check_acl(
        &self,
        network: &str,
        host_port: &str,
        bind: Option<IpAddr>,
        ctx_headers: &[(String, String)],
    ) -> ProxyResult<ProxyStream> {
        if network != "tcp" && network != "tcp4" && network != "tcp6" {
            return Err(ProxyError::BadRequest(format!(
                "network {network} is not supported"
            )));
        }

        let (host, port) = split_host_port(host_port).ok_or_else(|| {
            ProxyError::BadRequest(format!("malformed target address {host_port:?}"))
        })?;

        if let Some(upstream) = &self.upstream {
            // upstreaming: do not resolve locally nor consult the ACL
            let stream = upstream
                .connect(&self.dialer, host_port, ctx_headers)
                .await
                .map_err(|e| ProxyError::BadGateway(format!("failed to dial upstream: {e}")))?;
            return Ok(ProxyStream::Tunneled(stream));
        }

        let port_num = port
            .parse::<u16>()
            .ok()
            .filter(|p| port_is_allowed(&self.allowed_ports, *p));
        let Some(port_num) = port_num else {
            return Err(ProxyError::Forbidden(format!("port {port} is not allowed")));
        };

        let host = host.to_ascii_lowercase();
        let host = self.host_override.get(&host).cloned().unwrap_or(host);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port_num))
            .await
            .map_err(|e| ProxyError::BadGateway(format!("lookup of {host} failed: {e}")))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            if !self.acl.is_allowed(&host, addr.ip()) {
                continue;
            }
            match self.dialer.dial(addr, bind).await {
                Ok(stream) => return Ok(ProxyStream::Direct(stream)),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(e) = last_err {
            return Err(ProxyError::BadGateway(format!("dial failed: {e}")));
        }
        Err(ProxyError::Forbidden(format!(
            "no allowed IP addresses for {host}"
        )))
    }
}

/// Host of the request: URI authority when present (absolute-form and
/// CONNECT), otherwise the Host header.
fn request_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Strip a trailing port and IPv6 brackets, lowercase the rest.
fn host_only(host: &str) -> String {
    let host = match split_host_port(host) {
        Some((host, _port)) => host,
        None => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string(),
    };
    host.to_ascii_lowercase()
}

/// Split `host:port`, handling bracketed IPv6 literals. Returns None when
/// no port is present.
pub(crate) fn split_host_port(host_port: &str) -> Option<(String, String)> {
    let (host, port) = host_port.rsplit_once(':')?;
    if port.contains(']') {
        // the colon belonged to an unported "[v6]" literal
        return None;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string();
    Some((host, port.to_string()))
}

/// Capture pre-existing Forwarded/X-Forwarded-For values and append the
/// client address. The upstream dialer replays these on its CONNECT.
fn forwarded_context(headers: &HeaderMap, client_addr: SocketAddr) -> Vec<(String, String)> {
    let mut ctx = Vec::new();
    for value in headers.get_all(FORWARDED) {
        if let Ok(v) = value.to_str() {
            ctx.push(("Forwarded".to_string(), v.to_string()));
        }
    }
    for value in headers.get_all("x-forwarded-for") {
        if let Ok(v) = value.to_str() {
            ctx.push(("X-Forwarded-For".to_string(), v.to_string()));
        }
    }
    ctx.push(("Forwarded".to_string(), format!("for=\"{client_addr}\"")));
    ctx
}

/// Parse the `Proxy-Nonlocal-Source` header: `ip:port` form first, bare
/// IP fallback. Unparseable values are ignored.
fn parse_bind_override(value: Option<&HeaderValue>) -> Option<IpAddr> {
    let value = value?.to_str().ok()?;
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    value.parse::<IpAddr>().ok()
}

fn serve_pac_file(host: &str) -> Response<ProxyBody> {
    let body = format!(
        "\nfunction FindProxyForURL(url, host) {{\n\
         \tif (host === \"127.0.0.1\" || host === \"::1\" || host === \"localhost\")\n\
         \t\treturn \"DIRECT\";\n\
         \treturn \"HTTPS {host}\";\n\
         }}\n"
    );
    Response::new(full(body))
}

fn serve_hidden_page(authenticated: bool) -> Response<ProxyBody> {
    const AUTH_FAIL: &str = "Please authenticate yourself to the proxy.";
    const AUTH_OK: &str =
        "Congratulations, you are successfully authenticated to the proxy! Go browse all the things!";

    let message = if authenticated { AUTH_OK } else { AUTH_FAIL };
    let body = format!(
        "<html>\n<head>\n  <title>Hidden Proxy Page</title>\n</head>\n<body>\n\
         <h1>Hidden Proxy Page!</h1>\n{message}<br/>\n</body>\n</html>"
    );
    let mut response = Response::new(full(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    response
        .headers_mut()
        .insert(SERVER, HeaderValue::from_static("Caddy"));
    if !authenticated {
        *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
        response.headers_mut().insert(
            PROXY_AUTHENTICATE,
            HeaderValue::from_static(PROXY_AUTHENTICATE_VALUE),
        );
    }
    response
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal config: no auth, no ACL directives, defaults everywhere.
    pub(crate) fn base_config() -> ProxyConfig {
        ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            hosts: HashSet::new(),
            pac_path: None,
            hide_ip: false,
            hide_via: false,
            probe_resistance: None,
            dial_timeout: Duration::from_secs(5),
            upstream: None,
            acl: Vec::new(),
            allowed_ports: Vec::new(),
            default_bind: None,
            auth_required: false,
            credentials: BasicCredentials::new(),
            host_override: HashMap::new(),
        }
    }

    /// Allow the loopback range so tests can proxy to local origins.
    pub(crate) fn allow_loopback(config: &mut ProxyConfig) {
        config.acl.push(crate::acl::AclDirective {
            subjects: vec!["127.0.0.0/8".to_string()],
            allow: true,
        });
    }

    pub(crate) fn add_credentials(config: &mut ProxyConfig, user: &str, pass: &str) {
        config.credentials.add(user, pass).unwrap();
        config.auth_required = true;
    }

    pub(crate) fn basic_auth_header(user: &str, pass: &str) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    /// Serve `handler` on an ephemeral port, mirroring the main loop.
    pub(crate) async fn spawn_proxy(handler: Handler) -> SocketAddr {
        let handler = Arc::new(handler);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer_addr)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move {
                            match handler.handle(req, peer_addr).await {
                                Ok(resp) => Ok::<_, Infallible>(resp),
                                Err(err) => Ok(err.into_response()),
                            }
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });
        addr
    }

    /// Origin that answers every request with 200 and echoes the request
    /// head back as the body, with some hop-by-hop headers of its own.
    pub(crate) async fn spawn_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let Some(head) = read_head(&mut stream).await else {
                        return;
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\n\
                         Content-Length: {}\r\n\
                         Content-Type: text/plain\r\n\
                         Server: test-origin\r\n\
                         Keep-Alive: timeout=5\r\n\
                         Proxy-Connection: keep-alive\r\n\
                         Connection: close\r\n\r\n",
                        head.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.write_all(head.as_bytes()).await;
                });
            }
        });
        addr
    }

    /// TCP echo server for CONNECT tunnel tests. Echoes until EOF, then
    /// half-closes its own write side.
    pub(crate) async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = stream.shutdown().await;
                });
            }
        });
        addr
    }

    /// Read an HTTP head (through the blank line) from a stream.
    pub(crate) async fn read_head(stream: &mut TcpStream) -> Option<String> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read_exact(&mut byte).await {
                Ok(_) => head.push(byte[0]),
                Err(_) => return None,
            }
        }
        String::from_utf8(head).ok()
    }

    /// Send raw bytes to the proxy and collect the whole response.
    pub(crate) async fn raw_request(proxy: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    /// Send raw bytes and read only the response head. CONNECT error
    /// responses may leave the connection open, so reading to EOF is not
    /// an option there.
    pub(crate) async fn raw_request_head(proxy: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        read_head(&mut stream).await.unwrap()
    }
}
