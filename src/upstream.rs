use crate::dialer::Dialer;
use crate::stream::{MaybeTlsStream, Prebuffered};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use color_eyre::eyre::{eyre, Result};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;

/// Upper bound on the upstream proxy's CONNECT response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// An upstream HTTP(S) proxy that all target connections tunnel through.
///
/// Built once at provisioning from a `http://` or `https://` URL. A
/// non-localhost upstream must use `https`; for localhost `https`
/// upstreams certificate verification is disabled, since a self-signed
/// loopback certificate is the common case there.
pub struct UpstreamProxy {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    proxy_auth: Option<String>,
}

impl UpstreamProxy {
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| eyre!("bad upstream URL: {e}"))?;
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(eyre!("unsupported upstream scheme: {scheme}"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| eyre!("upstream URL has no host"))?
            .to_string();
        if !is_localhost(&host) && scheme != "https" {
            return Err(eyre!("insecure schemes are only allowed to localhost upstreams"));
        }
        let port = url
            .port()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        let proxy_auth = if url.username().is_empty() {
            None
        } else {
            let creds = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            Some(format!("Basic {}", STANDARD.encode(creds)))
        };

        let tls = if scheme == "https" {
            let insecure = is_localhost(&host);
            if insecure {
                info!("localhost upstream detected, disabling verification of TLS certificate");
            }
            Some(build_tls_connector(insecure)?)
        } else {
            None
        };

        Ok(Self {
            host,
            port,
            tls,
            proxy_auth,
        })
    }

    /// Whether the upstream URL carried userinfo.
    pub fn proxy_auth(&self) -> Option<&str> {
        self.proxy_auth.as_deref()
    }

    /// Open a tunnel to `target` (a `host:port` string) through the
    /// upstream proxy.
    ///
    /// `extra_headers` are appended to the CONNECT request verbatim; the
    /// dispatcher uses this to carry captured `Forwarded` headers over.
    /// Response bytes read past the header section stay readable from the
    /// returned stream.
    pub async fn connect(
        &self,
        dialer: &Dialer,
        target: &str,
        extra_headers: &[(String, String)],
    ) -> io::Result<Prebuffered<MaybeTlsStream>> {
        let stream = self.dial_upstream(dialer).await?;
        let stream = match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.host.clone())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let tls = connector.connect(name, stream).await?;
                MaybeTlsStream::Tls(Box::new(tls))
            }
            None => MaybeTlsStream::Plain(stream),
        };
        let mut stream = Prebuffered::new(stream, MAX_RESPONSE_HEAD);

        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = &self.proxy_auth {
            request.push_str("Proxy-Authorization: ");
            request.push_str(auth);
            request.push_str("\r\n");
        }
        for (name, value) in extra_headers {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        self.read_connect_response(&mut stream).await?;
        debug!("upstream tunnel to {target} established via {}:{}", self.host, self.port);
        Ok(stream)
    }

    async fn dial_upstream(&self, dialer: &Dialer) -> io::Result<tokio::net::TcpStream> {
        let addrs: Vec<_> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .collect();
        let mut last_err = None;
        for addr in addrs {
            match dialer.dial_direct(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for upstream {}", self.host),
            )
        }))
    }

    /// Read the CONNECT response head and accept any 2xx status. Bytes
    /// buffered past the blank line are left in the stream's prebuffer.
    async fn read_connect_response(
        &self,
        stream: &mut Prebuffered<MaybeTlsStream>,
    ) -> io::Result<()> {
        let head_end = loop {
            if let Some(pos) = find_head_end(stream.buffer()) {
                break pos;
            }
            if stream.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "upstream proxy response head too large",
                ));
            }
            let n = stream.buffer_more().await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream proxy closed connection during CONNECT",
                ));
            }
        };

        let head = String::from_utf8_lossy(&stream.buffer()[..head_end]).into_owned();
        let status_line = head.lines().next().unwrap_or("").trim().to_string();
        let status = parse_status_code(&status_line)?;
        if !(200..300).contains(&status) {
            return Err(io::Error::other(format!(
                "upstream proxy refused CONNECT: {status_line}"
            )));
        }
        stream.discard(head_end + 4);
        Ok(())
    }
}

/// Locate the `\r\n\r\n` separating head from payload.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the status code out of an HTTP response status line.
fn parse_status_code(line: &str) -> io::Result<u16> {
    let mut parts = line.split_whitespace();
    let _version = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty upstream response"))?;
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed upstream response line: {line}"),
            )
        })
}

pub(crate) fn is_localhost(hostname: &str) -> bool {
    hostname == "localhost" || hostname == "127.0.0.1" || hostname == "::1"
}

/// Build a TLS connector with the ring provider. `insecure` drops
/// certificate verification (localhost upstreams only).
pub(crate) fn build_tls_connector(insecure: bool) -> Result<TlsConnector> {
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| eyre!("TLS config error: {e}"))?;

    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// A `ServerCertVerifier` that accepts any certificate.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
