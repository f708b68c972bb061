use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Extension, Query},
    http::StatusCode,
    response::Response,
    routing::get,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::dns::DnsPacket;
use crate::metrics::Metrics;
use crate::pipeline::{PipelineHandle, Transport};
use crate::tls;

const DOH_MIME: &str = "application/dns-message";
const DOH_PATH: &str = "/dns-query";

/// Shared state for the DoH handlers.
#[derive(Clone)]
pub struct DohContext {
    pub pipeline: PipelineHandle,
    pub ttl: u32,
    pub timeout: Duration,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, serde::Deserialize)]
struct DohQueryParams {
    /// Base64url-encoded DNS query in wire format.
    dns: Option<String>,
}

/// RFC 8484 endpoint: GET with `?dns=`, POST with a wire-format body.
/// Everything off `/dns-query` is 404; other methods on it are 400.
pub fn router(ctx: DohContext) -> Router {
    Router::new()
        .route(
            DOH_PATH,
            get(handle_get).post(handle_post).fallback(bad_method),
        )
        .fallback(not_found)
        .layer(Extension(ctx))
}

/// Run the DoH listener until shutdown fires. With TLS enabled the
/// connections are accepted by hand so the rustls handshake happens before
/// hyper sees the stream.
pub async fn run(
    server_config: config::DohServer,
    ttl: u32,
    pipeline: PipelineHandle,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ctx = DohContext {
        pipeline,
        ttl,
        timeout: Duration::from_millis(server_config.timeout_ms.max(1)),
        metrics,
    };
    let app = router(ctx);

    let listener = TcpListener::bind(&server_config.bind).await?;

    if !server_config.tls.enabled {
        info!("doh server listening on {} (http)", server_config.bind);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("doh server shutting down");
            })
            .await?;
        return Ok(());
    }

    let acceptor = tls::build_acceptor(
        &server_config.tls.cert_path,
        &server_config.tls.key_path,
    )?;
    info!("doh server listening on {} (https)", server_config.bind);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("doh server shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("doh accept error: {}", err);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            debug!("tls handshake with {} failed: {}", peer, err);
                            return;
                        }
                    };
                    let service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );
                    if let Err(err) = builder
                        .serve_connection(hyper_util::rt::TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!("doh connection from {} ended: {}", peer, err);
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_get(
    Query(params): Query<DohQueryParams>,
    Extension(ctx): Extension<DohContext>,
) -> Response<Body> {
    let Some(encoded) = params.dns else {
        return status_reply(&ctx, StatusCode::BAD_REQUEST, "no 'dns' query parameter");
    };
    let Ok(wire) = URL_SAFE_NO_PAD.decode(&encoded) else {
        return status_reply(&ctx, StatusCode::BAD_REQUEST, "bad base64url in 'dns'");
    };
    answer_wire_query(&ctx, &wire).await
}

async fn handle_post(Extension(ctx): Extension<DohContext>, body: Bytes) -> Response<Body> {
    answer_wire_query(&ctx, &body).await
}

async fn bad_method(Extension(ctx): Extension<DohContext>) -> Response<Body> {
    status_reply(&ctx, StatusCode::BAD_REQUEST, "unexpected method")
}

async fn not_found(Extension(ctx): Extension<DohContext>) -> Response<Body> {
    status_reply(&ctx, StatusCode::NOT_FOUND, "")
}

async fn answer_wire_query(ctx: &DohContext, wire: &[u8]) -> Response<Body> {
    let packet = match DnsPacket::parse(wire) {
        Ok(packet) => packet,
        Err(err) => {
            warn!("error when serving doh request: {}", err);
            return status_reply(ctx, StatusCode::BAD_REQUEST, "undecodable dns message");
        }
    };

    let reply = tokio::time::timeout(ctx.timeout, ctx.pipeline.process(Transport::Http, packet))
        .await
        .ok()
        .flatten();
    // RFC 8484 section 4.2.1: 500 signals that the chain produced no
    // response message at all.
    let Some(reply) = reply else {
        return status_reply(ctx, StatusCode::INTERNAL_SERVER_ERROR, "no response");
    };

    let bytes = match reply.to_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("failed to serialise doh reply: {}", err);
            return status_reply(ctx, StatusCode::INTERNAL_SERVER_ERROR, "no response");
        }
    };

    ctx.metrics
        .doh_responses
        .with_label_values(&[StatusCode::OK.as_str()])
        .inc();
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, DOH_MIME)
        .header(
            http::header::CACHE_CONTROL,
            format!("max-age={}", ctx.ttl),
        )
        .body(Body::from(bytes))
        .unwrap_or_default()
}

fn status_reply(ctx: &DohContext, status: StatusCode, message: &str) -> Response<Body> {
    ctx.metrics
        .doh_responses
        .with_label_values(&[status.as_str()])
        .inc();
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}
