//! Built-in status application
//!
//! Served by the binary when no other application is linked in. Answers
//! liveness probes so the container can be health-checked.

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};

use super::{AppError, AppResponse, Application, RequestContext};

pub struct StatusApp {
    service_name: String,
}

impl StatusApp {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Route a request by method and path.
    pub fn respond(
        &self,
        method: &Method,
        path: &str,
        ctx: RequestContext,
    ) -> Result<AppResponse, AppError> {
        if *method != Method::GET && *method != Method::HEAD {
            return build(
                StatusCode::METHOD_NOT_ALLOWED,
                "text/plain",
                "405 Method Not Allowed".to_string(),
            );
        }
        match path {
            "/health" | "/healthz" => {
                let body = serde_json::json!({
                    "status": "healthy",
                    "service": self.service_name,
                });
                build(StatusCode::OK, "application/json", body.to_string())
            }
            "/" => build(
                StatusCode::OK,
                "text/plain",
                format!("{} served by worker {}\n", self.service_name, ctx.worker),
            ),
            _ => build(StatusCode::NOT_FOUND, "text/plain", "404 Not Found".to_string()),
        }
    }
}

#[async_trait]
impl Application for StatusApp {
    async fn call(
        &self,
        req: Request<Incoming>,
        ctx: RequestContext,
    ) -> Result<AppResponse, AppError> {
        self.respond(req.method(), req.uri().path(), ctx)
    }
}

fn build(status: StatusCode, content_type: &str, body: String) -> Result<AppResponse, AppError> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| AppError(format!("Failed to build {status} response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::WorkerId;
    use http_body_util::BodyExt;

    fn ctx() -> RequestContext {
        RequestContext {
            worker: WorkerId::new(7),
            peer: "127.0.0.1:40000".parse().unwrap(),
        }
    }

    async fn body_string(resp: AppResponse) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_healthy() {
        let app = StatusApp::new("prefork");
        let resp = app.respond(&Method::GET, "/health", ctx()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["service"], "prefork");
    }

    #[tokio::test]
    async fn test_root_names_worker() {
        let app = StatusApp::new("prefork");
        let resp = app.respond(&Method::GET, "/", ctx()).unwrap();
        assert!(body_string(resp).await.contains("worker 7"));
    }

    #[test]
    fn test_unknown_path_is_404() {
        let app = StatusApp::new("prefork");
        let resp = app.respond(&Method::GET, "/missing", ctx()).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_post_is_405() {
        let app = StatusApp::new("prefork");
        let resp = app.respond(&Method::POST, "/health", ctx()).unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
