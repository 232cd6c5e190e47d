use std::{convert::Infallible, net::SocketAddr};

use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Bytes, header::CONTENT_TYPE,
    server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

fn serve_req<B>(req: Request<B>, registry: &Registry) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }
    let encoder = TextEncoder::new();
    let mut result = Vec::new();
    match encoder.encode(&registry.gather(), &mut result) {
        Ok(_) => {
            if let Ok(content_type) = encoder.format_type().parse() {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            *response.body_mut() = Full::new(Bytes::from(result));
        }
        Err(e) => {
            error!("{}", e);
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    response
}

/// Serve the metrics of `registry` on `http://<addr>/metrics` until the task is dropped.
pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving metrics on http://{}/metrics", addr);
    loop {
        let (stream, _) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = serve_req(req, &registry);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection error: {}", e);
            }
        });
    }
}
