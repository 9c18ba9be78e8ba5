//! Application seam
//!
//! The pool serves any HTTP application implementing [`Application`]. The
//! server core places no constraint on what the application does with a
//! request beyond it being an awaited call that may fail.

mod status;

pub use status::StatusApp;

use std::net::SocketAddr;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use thiserror::Error;

use crate::server::WorkerId;

pub type AppResponse = Response<Full<Bytes>>;

/// Abnormal termination of a request inside the application.
///
/// Returning this from [`Application::call`] discards the connection and
/// costs the worker its life; the supervisor spawns a replacement.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct AppError(pub String);

/// Per-request facts the worker knows and the application may want.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub worker: WorkerId,
    pub peer: SocketAddr,
}

/// An HTTP application served by the worker pool.
///
/// A worker makes one call at a time, driven on a thread of the blocking
/// pool, so a call may block its thread freely. When the call outlives the
/// request timeout its worker is killed: the connection is closed without a
/// response and a replacement starts serving at once. The abandoned call is
/// cancelled at its next suspension point; code blocking its thread runs
/// until it returns and its result is dropped.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn call(
        &self,
        req: Request<Incoming>,
        ctx: RequestContext,
    ) -> Result<AppResponse, AppError>;
}
