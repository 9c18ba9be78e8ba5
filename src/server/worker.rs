// Worker module
// Accepts from the shared listener and serves one connection at a time

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Version};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::listener::{AcceptError, Listener};
use super::watchdog::InFlightRegistry;
use super::WorkerId;
use crate::app::{AppError, AppResponse, Application, RequestContext};
use crate::error::WorkerExit;
use crate::logger::{self, AccessLogEntry};

/// Pause after a failed accept (EMFILE and friends) before retrying
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Everything one worker needs; built by the supervisor per spawn.
pub struct Worker {
    pub id: WorkerId,
    pub listener: Arc<Listener>,
    pub app: Arc<dyn Application>,
    pub registry: Arc<InFlightRegistry>,
    /// Cancelled by the supervisor to ask the worker to exit once idle
    pub terminate: CancellationToken,
    /// Serve at most this many requests, then exit `Recycled`
    pub max_requests: Option<u64>,
    /// Access log format, `None` when access logging is off
    pub access_log: Option<Arc<str>>,
    pub ready_tx: mpsc::UnboundedSender<WorkerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionOutcome {
    /// The peer went away before a complete request arrived
    NoRequest,
    Served,
    Fault,
    /// The watchdog claimed the record first; no response was written
    Claimed,
}

impl Worker {
    /// Accept/serve loop. Returns when terminated, recycled, or faulted.
    ///
    /// Termination is only observed between requests; a busy worker can
    /// only be stopped mid-request by aborting its task.
    pub async fn run(self) -> WorkerExit {
        // The supervisor may already be gone during teardown
        let _ = self.ready_tx.send(self.id);
        let mut served: u64 = 0;

        loop {
            if self.max_requests.is_some_and(|limit| served >= limit) {
                return WorkerExit::Recycled;
            }

            let (stream, peer) = tokio::select! {
                biased;
                () = self.terminate.cancelled() => return WorkerExit::Stopped,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(AcceptError::Closed) => return WorkerExit::Stopped,
                    Err(AcceptError::Io(e)) => {
                        logger::log_accept_error(self.id, &e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            let seq = self.registry.begin(self.id, peer);
            match self.serve_connection(stream, peer, seq).await {
                ConnectionOutcome::Served => served += 1,
                ConnectionOutcome::NoRequest => {
                    if !self.registry.finish(self.id, seq, false) {
                        return WorkerExit::TimedOut;
                    }
                }
                ConnectionOutcome::Fault => return WorkerExit::Fault,
                // The abort is on its way
                ConnectionOutcome::Claimed => return WorkerExit::TimedOut,
            }
        }
    }

    /// Serve a single HTTP/1.1 request; keep-alive is off so the connection
    /// closes after one response.
    ///
    /// The in-flight record is settled as soon as the application returns
    /// and before anything is written, so a claimed request never answers.
    async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        seq: u64,
    ) -> ConnectionOutcome {
        let outcome = Arc::new(Mutex::new(ConnectionOutcome::NoRequest));
        let ctx = RequestContext {
            worker: self.id,
            peer,
        };

        let service = {
            let app = Arc::clone(&self.app);
            let registry = Arc::clone(&self.registry);
            let outcome = Arc::clone(&outcome);
            let access_log = self.access_log.clone();
            service_fn(move |req: Request<Incoming>| {
                let app = Arc::clone(&app);
                let registry = Arc::clone(&registry);
                let outcome = Arc::clone(&outcome);
                let access_log = access_log.clone();
                async move {
                    let started = Instant::now();
                    let entry = access_log.as_ref().map(|_| access_entry(&req, ctx));
                    let result = call_off_runtime(app, req, ctx).await;

                    if !registry.finish(ctx.worker, seq, result.is_ok()) {
                        *outcome.lock() = ConnectionOutcome::Claimed;
                        return Err(AppError("request timed out".to_string()));
                    }
                    match result {
                        Ok(resp) => {
                            *outcome.lock() = ConnectionOutcome::Served;
                            if let (Some(format), Some(mut entry)) = (access_log, entry) {
                                entry.status = resp.status().as_u16();
                                entry.body_bytes = resp.body().size_hint().exact().unwrap_or(0);
                                entry.request_time_us =
                                    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                                logger::log_access(&entry, &format);
                            }
                            Ok(resp)
                        }
                        Err(e) => {
                            *outcome.lock() = ConnectionOutcome::Fault;
                            error!(worker = %ctx.worker, peer = %ctx.peer, "Application error: {e}");
                            Err(e)
                        }
                    }
                }
            })
        };

        let result = http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(stream), service)
            .await;

        let outcome = *outcome.lock();
        if let Err(e) = result {
            match outcome {
                // Reported by the service or the timeout kill
                ConnectionOutcome::Fault | ConnectionOutcome::Claimed => {}
                _ if e.is_incomplete_message() || e.is_closed() => {
                    debug!(worker = %self.id, "Peer closed connection early: {e}");
                }
                _ => logger::log_connection_error(self.id, &e),
            }
        }
        outcome
    }
}

/// Run one application call on the blocking pool.
///
/// A handler that blocks its thread therefore never stalls the runtime
/// that drives the supervisor, the watchdog and the other workers. When the
/// returned future is dropped (the worker was killed) the call is cancelled
/// at its next suspension point; a call stuck in blocking code keeps its
/// thread until it returns, and its result is discarded.
async fn call_off_runtime(
    app: Arc<dyn Application>,
    req: Request<Incoming>,
    ctx: RequestContext,
) -> Result<AppResponse, AppError> {
    let abandoned = CancellationToken::new();
    let _abandon_on_drop = abandoned.clone().drop_guard();
    let runtime = Handle::current();

    let call = tokio::task::spawn_blocking(move || {
        runtime.block_on(async move {
            tokio::select! {
                () = abandoned.cancelled() => Err(AppError("request abandoned".to_string())),
                result = app.call(req, ctx) => result,
            }
        })
    });

    match call.await {
        Ok(result) => result,
        // Surface the panic on the worker task so the supervisor sees it
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(AppError(format!("request task failed: {e}"))),
    }
}

fn access_entry(req: &Request<Incoming>, ctx: RequestContext) -> AccessLogEntry {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    let mut entry = AccessLogEntry::new(
        ctx.peer.ip().to_string(),
        ctx.worker,
        req.method().to_string(),
        req.uri().path().to_string(),
    );
    entry.query = req.uri().query().map(ToString::to_string);
    entry.http_version = if req.version() == Version::HTTP_10 { "1.0" } else { "1.1" }.to_string();
    entry.referer = header("referer");
    entry.user_agent = header("user-agent");
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::watchdog::Expired;
    use async_trait::async_trait;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::Response;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait]
    impl Application for Echo {
        async fn call(
            &self,
            req: Request<Incoming>,
            ctx: RequestContext,
        ) -> Result<AppResponse, AppError> {
            let body = format!("{} {}", ctx.worker, req.uri().path());
            Ok(Response::new(Full::new(Bytes::from(body))))
        }
    }

    struct Failing;

    #[async_trait]
    impl Application for Failing {
        async fn call(
            &self,
            _req: Request<Incoming>,
            _ctx: RequestContext,
        ) -> Result<AppResponse, AppError> {
            Err(AppError("boom".to_string()))
        }
    }

    struct Slow;

    #[async_trait]
    impl Application for Slow {
        async fn call(
            &self,
            _req: Request<Incoming>,
            _ctx: RequestContext,
        ) -> Result<AppResponse, AppError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Response::new(Full::new(Bytes::from("late"))))
        }
    }

    struct Harness {
        listener: Arc<Listener>,
        registry: Arc<InFlightRegistry>,
        terminate: CancellationToken,
        ready_rx: mpsc::UnboundedReceiver<WorkerId>,
        task: tokio::task::JoinHandle<WorkerExit>,
    }

    fn start(app: Arc<dyn Application>, max_requests: Option<u64>) -> Harness {
        let listener = Arc::new(Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap());
        let registry = Arc::new(InFlightRegistry::new());
        let terminate = CancellationToken::new();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            id: WorkerId::new(1),
            listener: Arc::clone(&listener),
            app,
            registry: Arc::clone(&registry),
            terminate: terminate.clone(),
            max_requests,
            access_log: None,
            ready_tx,
        };
        let task = tokio::spawn(worker.run());
        Harness {
            listener,
            registry,
            terminate,
            ready_rx,
            task,
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response).await;
        response
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reports_ready_and_serves_sequentially() {
        let mut h = start(Arc::new(Echo), None);
        assert_eq!(h.ready_rx.recv().await, Some(WorkerId::new(1)));

        let addr = h.listener.local_addr();
        let first = get(addr, "/one").await;
        let second = get(addr, "/two").await;
        assert!(first.starts_with("HTTP/1.1 200"), "got: {first}");
        assert!(first.ends_with("1 /one"), "got: {first}");
        assert!(second.ends_with("1 /two"), "got: {second}");

        h.terminate.cancel();
        assert_eq!(h.task.await.unwrap(), WorkerExit::Stopped);
        assert_eq!(h.registry.completed(), 2);
        assert_eq!(h.registry.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handler_error_exits_with_fault() {
        let h = start(Arc::new(Failing), None);
        let response = get(h.listener.local_addr(), "/").await;
        assert!(!response.contains("200"), "got: {response}");
        assert_eq!(h.task.await.unwrap(), WorkerExit::Fault);
        assert_eq!(h.registry.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recycles_after_quota() {
        let h = start(Arc::new(Echo), Some(2));
        let addr = h.listener.local_addr();
        get(addr, "/a").await;
        get(addr, "/b").await;
        assert_eq!(h.task.await.unwrap(), WorkerExit::Recycled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_without_request_is_not_completed() {
        let h = start(Arc::new(Echo), None);
        let addr = h.listener.local_addr();

        drop(TcpStream::connect(addr).await.unwrap());
        let response = get(addr, "/after").await;
        assert!(response.ends_with("1 /after"), "got: {response}");

        h.terminate.cancel();
        assert_eq!(h.task.await.unwrap(), WorkerExit::Stopped);
        assert_eq!(h.registry.completed(), 1);
        assert_eq!(h.registry.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_claimed_request_is_never_answered() {
        let h = start(Arc::new(Slow), None);
        let addr = h.listener.local_addr();
        let client = tokio::spawn(async move { get(addr, "/").await });

        let worker = WorkerId::new(1);
        let record = loop {
            if let Some(record) = h.registry.get(worker) {
                break record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(h.registry.claim(Expired { worker, seq: record.seq }).is_some());

        assert_eq!(h.task.await.unwrap(), WorkerExit::TimedOut);
        let response = client.await.unwrap();
        assert!(response.is_empty(), "got: {response}");
        assert_eq!(h.registry.completed(), 0);
    }

    #[tokio::test]
    async fn test_listener_close_stops_idle_worker() {
        let h = start(Arc::new(Echo), None);
        h.listener.close();
        assert_eq!(h.task.await.unwrap(), WorkerExit::Stopped);
    }
}
