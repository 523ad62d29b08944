use engine::Engine;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use shared::http::{ResponseBody, json_response, make_error_response, text_response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum AdminError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct ProbeSummary {
    probed: usize,
}

/// Operator endpoints: liveness, egress pool state, and an on-demand probe.
pub struct AdminService {
    engine: Arc<Engine>,
}

impl AdminService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ResponseBody>;
    type Error = AdminError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let engine = self.engine.clone();

        Box::pin(async move { Ok(handle(&engine, req.method(), req.uri().path()).await) })
    }
}

async fn handle(engine: &Engine, method: &Method, path: &str) -> Response<ResponseBody> {
    match (method, path) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok\n"),
        (&Method::GET, "/egress") => json_response(StatusCode::OK, &engine.pool_snapshot()),
        (&Method::POST, "/probe") => match engine.trigger_probe_now().await {
            Ok(probed) => json_response(StatusCode::OK, &ProbeSummary { probed }),
            Err(e) => {
                tracing::error!(error = %e, "On-demand probe failed");
                make_error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        _ => make_error_response(StatusCode::NOT_FOUND),
    }
}
