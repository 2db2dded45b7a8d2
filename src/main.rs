mod acl;
mod auth;
mod bind;
mod buffer_pool;
mod config;
mod dialer;
mod error;
mod forward;
mod handler;
mod stream;
mod tunnel;
mod upstream;

use crate::config::{Cli, ProxyConfig};
use crate::handler::Handler;
use clap::Parser;
use color_eyre::eyre::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fwdproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args)?;
    let listen_addr = config.listen_addr;

    if config.auth_required {
        info!("proxy authentication enabled");
    }
    if let Some(upstream) = &config.upstream {
        info!("all targets will be dialed through upstream {upstream}");
    }

    let handler = Arc::new(Handler::new(config)?);
    let listener = TcpListener::bind(listen_addr).await?;
    info!("forward proxy listening on http://{listen_addr}");

    // Graceful shutdown signal handling
    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        info!("shutdown signal received");
    };

    // Main server loop
    let server = async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let handler = handler.clone();
                    tokio::task::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let handler = handler.clone();
                            async move {
                                match handler.handle(req, peer_addr).await {
                                    Ok(response) => Ok::<_, Infallible>(response),
                                    Err(err) => {
                                        debug!("request from {peer_addr} failed: {err}");
                                        Ok(err.into_response())
                                    }
                                }
                            }
                        });

                        if let Err(err) = http1::Builder::new()
                            .preserve_header_case(true)
                            .title_case_headers(true)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            // Only log connection errors, not normal endings
                            if !err.to_string().contains("connection closed") {
                                warn!("connection from {peer_addr} error: {err:?}");
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("accept error: {e} (continuing)");
                    continue;
                }
            }
        }
    };

    // Run the server until the shutdown signal is received
    tokio::select! {
        _ = server => {
            warn!("server loop terminated");
        }
        _ = shutdown => {
            info!("server shutdown complete");
        }
    }

    Ok(())
}
