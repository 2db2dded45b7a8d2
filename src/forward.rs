use crate::error::{ProxyError, ProxyResult};
use crate::handler::{full, split_host_port, Handler, ProxyBody};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, FORWARDED, HOST, PROXY_AUTHORIZATION, VIA};
use hyper::{Method, Request, Response, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Time allowed for a TLS handshake with an https origin
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hop-by-hop headers stripped from requests and responses, in addition
/// to anything named by a Connection header.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "upgrade",
    "connection",
    "proxy-connection",
    "proxy-nonlocal-source",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Forward a non-CONNECT request to its target and relay the response.
pub(crate) async fn handle_forward(
    handler: &Handler,
    req: Request<Incoming>,
    client_addr: SocketAddr,
    bind: Option<IpAddr>,
    ctx_headers: Vec<(String, String)>,
) -> ProxyResult<Response<ProxyBody>> {
    // `http` is assumed when the client left the scheme out: this leg is
    // plain HTTP regardless of what client and target speak afterwards.
    let scheme = req.uri().scheme_str().unwrap_or("http").to_string();
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| ProxyError::BadRequest("request has no host".to_string()))?;
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let (mut parts, body) = req.into_parts();

    // Normalize to an HTTP/1.1 origin-form request
    parts.version = Version::HTTP_11;
    parts.uri = path_and_query
        .parse()
        .map_err(|e| ProxyError::BadRequest(format!("bad request path: {e}")))?;

    remove_hop_by_hop(&mut parts.headers);
    parts.headers.insert(
        HOST,
        HeaderValue::from_str(&authority)
            .map_err(|_| ProxyError::BadRequest("invalid host".to_string()))?,
    );
    if !handler.hide_ip {
        parts
            .headers
            .append(FORWARDED, forwarded_for_value(client_addr));
    }
    // https://tools.ietf.org/html/rfc7230#section-5.7.1
    if !handler.hide_via {
        parts.headers.append(VIA, HeaderValue::from_static("1.1 caddy"));
    }

    // Idempotent methods are not supposed to have a body, but when they
    // do, buffer it so the request could be written again.
    let outbound_body: ProxyBody = if parts.method == Method::GET
        || parts.method == Method::HEAD
        || parts.method == Method::OPTIONS
        || parts.method == Method::TRACE
    {
        let collected = body.collect().await.map_err(|e| {
            ProxyError::BadRequest(format!("failed to read request body: {e}"))
        })?;
        full(collected.to_bytes())
    } else {
        body.boxed()
    };

    let response = if handler.upstream.is_some() {
        forward_via_upstream(handler, parts, outbound_body, &authority, bind, &ctx_headers).await?
    } else {
        forward_direct(
            handler,
            parts,
            outbound_body,
            &scheme,
            &authority,
            bind,
            &ctx_headers,
        )
        .await?
    };

    Ok(forward_response(response))
}

/// Dial the target through the ACL pipeline and exchange one request.
async fn forward_direct(
    handler: &Handler,
    parts: http::request::Parts,
    body: ProxyBody,
    scheme: &str,
    authority: &str,
    bind: Option<IpAddr>,
    ctx_headers: &[(String, String)],
) -> ProxyResult<Response<Incoming>> {
    let default_port = if scheme == "https" { "443" } else { "80" };
    let addr = if split_host_port(authority).is_some() {
        authority.to_string()
    } else {
        format!("{authority}:{default_port}")
    };

    let stream = handler
        .dial_context_check_acl("tcp", &addr, bind, ctx_headers)
        .await?;
    let req = Request::from_parts(parts, body);

    if scheme == "https" {
        let host = split_host_port(&addr)
            .map(|(host, _)| host)
            .unwrap_or_else(|| addr.clone());
        let name = ServerName::try_from(host)
            .map_err(|e| ProxyError::BadRequest(format!("invalid TLS server name: {e}")))?;
        let tls = tokio::time::timeout(
            TLS_HANDSHAKE_TIMEOUT,
            handler.origin_tls.connect(name, stream),
        )
        .await
        .map_err(|_| ProxyError::BadGateway("TLS handshake with origin timed out".to_string()))?
        .map_err(|e| ProxyError::BadGateway(format!("TLS handshake with origin failed: {e}")))?;
        roundtrip(tls, req).await
    } else {
        roundtrip(stream, req).await
    }
}

/// Write the request over a CONNECT tunnel through the upstream proxy and
/// read a single response. Bypasses per-origin connection pooling so one
/// upstream CONNECT is not spawned per origin host.
async fn forward_via_upstream(
    handler: &Handler,
    mut parts: http::request::Parts,
    body: ProxyBody,
    authority: &str,
    bind: Option<IpAddr>,
    ctx_headers: &[(String, String)],
) -> ProxyResult<Response<Incoming>> {
    if let Some(upstream) = &handler.upstream {
        if let Some(auth) = upstream.proxy_auth() {
            parts.headers.insert(
                PROXY_AUTHORIZATION,
                HeaderValue::from_str(auth).map_err(|_| {
                    ProxyError::Internal("invalid upstream credentials".to_string())
                })?,
            );
        }
    }

    let addr = if split_host_port(authority).is_some() {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };

    let stream = handler
        .dial_context_check_acl("tcp", &addr, bind, ctx_headers)
        .await?;
    let req = Request::from_parts(parts, body);
    roundtrip(stream, req).await
}

/// One HTTP/1.1 exchange over an established stream.
async fn roundtrip<S>(stream: S, req: Request<ProxyBody>) -> ProxyResult<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await
        .map_err(|e| ProxyError::BadGateway(format!("failed to reach target: {e}")))?;

    // The driver must keep running to stream the response body; it winds
    // down once the sender is dropped and the body is exhausted.
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("target connection ended with error: {err}");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::BadGateway(format!("failed to read response: {e}")))
}

/// Strip hop-by-hop headers and add the proxy's Via before the response
/// goes back to the client.
fn forward_response(response: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    let via = response_via_value(parts.version);
    remove_hop_by_hop(&mut parts.headers);
    parts.headers.append(VIA, via);
    Response::from_parts(parts, body.boxed())
}

/// Via entry for the response direction, named after the protocol the
/// target actually answered with.
fn response_via_value(version: Version) -> HeaderValue {
    match version {
        Version::HTTP_09 => HeaderValue::from_static("0.9 caddy"),
        Version::HTTP_10 => HeaderValue::from_static("1.0 caddy"),
        Version::HTTP_2 => HeaderValue::from_static("2.0 caddy"),
        Version::HTTP_3 => HeaderValue::from_static("3.0 caddy"),
        _ => HeaderValue::from_static("1.1 caddy"),
    }
}

/// Remove headers named by Connection, then the fixed hop-by-hop set.
fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    for name in connection_named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn forwarded_for_value(client_addr: SocketAddr) -> HeaderValue {
    HeaderValue::from_str(&format!("for=\"{client_addr}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("for=unknown"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_util::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_remove_hop_by_hop_fixed_set() {
        let mut headers = HeaderMap::new();
        headers.insert("keep-alive", HeaderValue::from_static("300"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("x-kept", HeaderValue::from_static("1"));

        remove_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-kept"));
    }

    #[test]
    fn test_response_via_tracks_protocol() {
        assert_eq!(
            response_via_value(Version::HTTP_10).to_str().unwrap(),
            "1.0 caddy"
        );
        assert_eq!(
            response_via_value(Version::HTTP_11).to_str().unwrap(),
            "1.1 caddy"
        );
        assert_eq!(
            response_via_value(Version::HTTP_2).to_str().unwrap(),
            "2.0 caddy"
        );
    }

    #[test]
    fn test_remove_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("x-droppable, x-also"));
        headers.insert("x-droppable", HeaderValue::from_static("1"));
        headers.insert("x-also", HeaderValue::from_static("2"));
        headers.insert("x-kept", HeaderValue::from_static("3"));

        remove_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-kept"));
    }

    #[tokio::test]
    async fn test_forward_adds_via_and_forwarded() {
        let origin = spawn_origin().await;
        let mut config = base_config();
        allow_loopback(&mut config);
        let proxy = spawn_proxy(Handler::new(config).unwrap()).await;

        let response = raw_request(
            proxy,
            &format!(
                "GET http://127.0.0.1:{port}/x HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
                 Proxy-Authorization: Basic c3B5OnNweQ==\r\n\
                 Proxy-Connection: keep-alive\r\n\
                 Te: trailers\r\n\
                 Keep-Alive: 300\r\n\
                 Connection: close\r\n\r\n",
                port = origin.port()
            ),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200"));
        // Response gained the proxy's Via
        assert!(response.contains("Via: 1.1 caddy"));
        // The echoed request head shows what reached the origin
        assert!(response.contains("GET /x HTTP/1.1"));
        assert!(response.contains(&format!("Host: 127.0.0.1:{}", origin.port())));
        assert!(response.contains("Forwarded: for=\"127.0.0.1:"));
        // Hop-by-hop request headers never reached the origin, and the
        // origin's own hop-by-hop response headers were dropped
        assert!(!response.contains("Proxy-Authorization"));
        assert!(!response.contains("Proxy-Connection"));
        assert!(!response.contains("Te:"));
        assert!(!response.contains("Keep-Alive"));
    }

    #[tokio::test]
    async fn test_forward_hide_ip_and_via() {
        let origin = spawn_origin().await;
        let mut config = base_config();
        allow_loopback(&mut config);
        config.hide_ip = true;
        config.hide_via = true;
        let proxy = spawn_proxy(Handler::new(config).unwrap()).await;

        let response = raw_request(
            proxy,
            &format!(
                "GET http://127.0.0.1:{port}/x HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n",
                port = origin.port()
            ),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(!response.contains("Forwarded:"));
        // The echoed request head must not carry Via either; the response
        // direction keeps it, so look only inside the body
        let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
        assert!(!body.contains("Via:"));
    }

    #[tokio::test]
    async fn test_host_override_rewrites_dial_target_only() {
        let origin = spawn_origin().await;
        let mut config = base_config();
        allow_loopback(&mut config);
        config
            .host_override
            .insert("origin.test".to_string(), "127.0.0.1".to_string());
        let proxy = spawn_proxy(Handler::new(config).unwrap()).await;

        let response = raw_request(
            proxy,
            &format!(
                "GET http://origin.test:{port}/x HTTP/1.1\r\nHost: origin.test:{port}\r\nConnection: close\r\n\r\n",
                port = origin.port()
            ),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200"));
        // The origin still sees the client's hostname
        assert!(response.contains(&format!("Host: origin.test:{}", origin.port())));
    }

    #[tokio::test]
    async fn test_forward_without_host_is_400() {
        let proxy = spawn_proxy(Handler::new(base_config()).unwrap()).await;

        let response = raw_request(proxy, "GET / HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_forward_unresolvable_host_is_502() {
        let proxy = spawn_proxy(Handler::new(base_config()).unwrap()).await;

        let response = raw_request(
            proxy,
            "GET http://does-not-exist.invalid/ HTTP/1.1\r\nHost: does-not-exist.invalid\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 502"));
    }

    #[tokio::test]
    async fn test_forward_via_upstream_injects_credentials() {
        use tokio::net::TcpListener;

        // Fake upstream proxy: accept the CONNECT, then answer the inner
        // request with its head echoed back.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let (heads_tx, heads_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let connect_head = read_head(&mut stream).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let inner_head = read_head(&mut stream).await.unwrap();
            heads_tx.send((connect_head, inner_head)).unwrap();
            let body = "ok";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            // Give the proxy time to drain before the socket drops
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let mut config = base_config();
        config.upstream = Some(format!(
            "http://user:pw@127.0.0.1:{}",
            upstream_addr.port()
        ));
        let proxy = spawn_proxy(Handler::new(config).unwrap()).await;

        let response = raw_request(
            proxy,
            "GET http://t.test/x HTTP/1.1\r\nHost: t.test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        let (connect_head, inner_head) = heads_rx.await.unwrap();
        // Target port defaults to 80 when the URL has none
        assert!(connect_head.starts_with("CONNECT t.test:80 HTTP/1.1\r\n"));
        assert!(connect_head.contains("Proxy-Authorization: Basic "));
        // The inner request is origin-form and carries the upstream
        // credentials too
        assert!(inner_head.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(inner_head.contains("Host: t.test"));
        assert!(inner_head.contains("Proxy-Authorization: Basic "));
    }
}
