use crate::buffer_pool;
use crate::error::{ProxyError, ProxyResult};
use crate::handler::{empty, Handler, ProxyBody};
use crate::stream::ProxyStream;
use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderValue, HOST, SERVER};
use hyper::{Request, Response, Version};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Handle a CONNECT request: enforce policy, dial the target, then relay
/// bytes until either side finishes.
pub(crate) async fn handle_connect(
    handler: &Handler,
    req: Request<Incoming>,
    bind: Option<IpAddr>,
    ctx_headers: Vec<(String, String)>,
) -> ProxyResult<Response<ProxyBody>> {
    let version = req.version();
    if matches!(version, Version::HTTP_2 | Version::HTTP_3)
        && (req.uri().scheme().is_some() || req.uri().path_and_query().is_some())
    {
        return Err(ProxyError::BadRequest(
            "CONNECT request has :scheme and/or :path pseudo-header fields".to_string(),
        ));
    }

    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| ProxyError::BadRequest("missing CONNECT target".to_string()))?;

    let target_conn = handler
        .dial_context_check_acl("tcp", &target, bind, &ctx_headers)
        .await?;

    match version {
        // http2/http3: keep reading the request body and writing into the
        // same response, flushing per frame
        Version::HTTP_2 | Version::HTTP_3 => Ok(serve_stream(req, target_conn)),
        // http1: hijack the whole connection
        _ => Ok(serve_hijack(req, target_conn)),
    }
}

/// HTTP/1.x CONNECT: answer 200, then take over the raw connection via
/// hyper's upgrade mechanism and run the bidirectional copy.
///
/// Client bytes that arrived before the upgrade completed are replayed by
/// the upgraded stream, so nothing is lost to the parser's read buffer.
fn serve_hijack(req: Request<Incoming>, target: ProxyStream) -> Response<ProxyBody> {
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                if let Err(e) = dual_stream(client, target).await {
                    debug!("tunnel closed with error: {e}");
                }
            }
            Err(e) => warn!("connection hijack failed: {e}"),
        }
    });

    let mut response = Response::new(empty());
    response
        .headers_mut()
        .insert(SERVER, HeaderValue::from_static("Caddy"));
    response
}

/// HTTP/2 and HTTP/3 CONNECT: the request body is the client→target
/// stream and the response body carries target→client frames.
fn serve_stream(req: Request<Incoming>, target: ProxyStream) -> Response<ProxyBody> {
    let (frame_tx, frame_rx) = mpsc::channel::<Result<Frame<Bytes>, hyper::Error>>(1);
    let (mut target_read, mut target_write) = tokio::io::split(target);
    let mut client_body = req.into_body();

    // client -> target; half-close the target once the client is done
    tokio::spawn(async move {
        while let Some(frame) = client_body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("tunnel request body error: {e}");
                    break;
                }
            };
            if let Ok(data) = frame.into_data() {
                if target_write.write_all(&data).await.is_err() {
                    return;
                }
            }
        }
        let _ = target_write.shutdown().await;
    });

    // target -> client, one response frame per read
    tokio::spawn(async move {
        let mut buf = buffer_pool::get_buffer().await;
        loop {
            match target_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if frame_tx.send(Ok(Frame::data(chunk))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("tunnel target read error: {e}");
                    break;
                }
            }
        }
        buffer_pool::return_buffer(buf).await;
        // dropping the sender ends the response body
    });

    let body = StreamBody::new(ReceiverStream::new(frame_rx));
    Response::new(BodyExt::boxed(body))
}

/// Copy bytes in both directions between `client` and `target`.
///
/// The client→target direction runs on its own task and may outlive this
/// call; the return value is the target→client direction's result. Each
/// direction half-closes its writer when its reader reaches EOF.
pub(crate) async fn dual_stream<C, T>(client: C, target: T) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);
    tokio::spawn(copy_with_shutdown(client_read, target_write));
    copy_with_shutdown(target_read, client_write).await
}

/// Pump `reader` into `writer` with a pooled buffer, then shut the writer
/// down so the peer sees EOF. Returns the first non-EOF error.
async fn copy_with_shutdown<R, W>(mut reader: R, mut writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = buffer_pool::get_buffer().await;
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }
    };
    let _ = writer.shutdown().await;
    buffer_pool::return_buffer(buf).await;
    result
}
