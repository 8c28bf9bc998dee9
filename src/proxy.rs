//! HTTP(S) proxy data path
//!
//! Every inbound request is matched against the registry, the backend is
//! lazily launched through the supervisor, and the request is forwarded over
//! a freshly dialed loopback connection. Responses stream back to the
//! client; a backend 5xx or any backend I/O failure schedules the backend's
//! teardown so the next request starts a fresh child.

use crate::acme::AcmeManager;
use crate::error::{failure_response, full_body, ProxyFailure, ResponseBody};
use crate::process::{RunningSite, Supervisor, WorkingGuard, WARMUP};
use crate::registry::Registry;
use crate::static_files;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, HOST, LOCATION, STRICT_TRANSPORT_SECURITY};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const HSTS_VALUE: &str = "max-age=63072000; includeSubDomains";

/// Shared state the data path needs on every request.
pub struct ProxyContext {
    pub registry: Arc<Registry>,
    pub supervisor: Arc<Supervisor>,
    pub acme: Option<Arc<AcmeManager>>,
}

/// One listening front-end (plain HTTP or TLS).
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(listener: TcpListener, ctx: Arc<ProxyContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            listener,
            ctx,
            tls_acceptor: None,
            shutdown_rx,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "https" } else { "http" };
        info!(addr = %self.listener.local_addr()?, protocol, "proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let tls_acceptor = self.tls_acceptor.clone();
                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(err) = handle_connection(tls_stream, addr, ctx, true).await {
                                                debug!(addr = %addr, error = %err, "tls connection error");
                                            }
                                        }
                                        Err(err) => debug!(addr = %addr, error = %err, "tls handshake failed"),
                                    }
                                } else if let Err(err) = handle_connection(stream, addr, ctx, false).await {
                                    debug!(addr = %addr, error = %err, "connection error");
                                }
                            });
                        }
                        Err(err) => error!(error = %err, "accept failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(protocol, "proxy shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|err| anyhow::anyhow!("connection error: {}", err))?;
    Ok(())
}

pub(crate) async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // ACME HTTP-01 challenges are answered before any routing.
    if !is_tls {
        if let Some(acme) = &ctx.acme {
            if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
                if let Some(key_auth) = acme.http01_key_auth(token) {
                    debug!(token, "answering ACME HTTP-01 challenge");
                    return Ok(Response::builder()
                        .status(StatusCode::OK)
                        .header(hyper::header::CONTENT_TYPE, "text/plain")
                        .body(full_body(key_auth))
                        .expect("static response parts are valid"));
                }
            }
        }
    }

    let matched = host_of(&req).and_then(|host| {
        ctx.registry
            .match_site(&host, &target)
            .map(|(site, running)| (host, site, running))
    });
    let Some((host, site, running)) = matched else {
        return Ok(finish(&method, &target, started, failure_response(ProxyFailure::NoRoute), Some("no route")));
    };

    if site.https_only && !is_tls {
        let location = format!("https://{}{}", host, target);
        info!(%location, "redirected to https");
        let response = Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, location)
            .body(full_body(""))
            .expect("static response parts are valid");
        return Ok(finish(&method, &target, started, response, None));
    }

    if site.is_static() {
        let response = static_files::serve(&site, &target).await;
        return Ok(finish(&method, &target, started, response, None));
    }

    let run = match running {
        Some(run) if !run.error() => run,
        _ => ctx.supervisor.ensure_running(&site).await,
    };

    if run.error() {
        return Ok(finish(
            &method,
            &target,
            started,
            failure_response(ProxyFailure::AppInError),
            Some(ProxyFailure::AppInError.log_cause()),
        ));
    }

    // From here every exit path decrements the in-flight counter: the guard
    // travels into the response body once the backend answers.
    let guard = WorkingGuard::new(run.clone());

    let stream = match dial_backend(&run).await {
        Ok(stream) => stream,
        Err(err) => {
            ctx.supervisor.stop(&site, &run, Some(err));
            drop(guard);
            return Ok(finish(
                &method,
                &target,
                started,
                failure_response(ProxyFailure::Connect),
                Some(ProxyFailure::Connect.log_cause()),
            ));
        }
    };

    append_forwarded_for(&mut req, client_addr);
    if req.headers().get(HOST).is_none() {
        // h2 requests carry the authority in the URI, not a Host header.
        if let Ok(value) = HeaderValue::from_str(&host) {
            req.headers_mut().insert(HOST, value);
        }
    }
    *req.version_mut() = Version::HTTP_11;
    strip_to_origin_form(&mut req);

    let io = TokioIo::new(stream);
    let handshake = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(io)
        .await;
    let (mut sender, conn) = match handshake {
        Ok(parts) => parts,
        Err(err) => {
            ctx.supervisor.stop(&site, &run, Some(err.into()));
            drop(guard);
            return Ok(finish(
                &method,
                &target,
                started,
                backend_failure_response(ProxyFailure::Forward, is_tls),
                Some(ProxyFailure::Forward.log_cause()),
            ));
        }
    };
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(error = %err, "backend connection ended");
        }
    });

    let backend_response = match sender.send_request(req).await {
        Ok(response) => response,
        Err(err) => {
            let failure = classify_send_error(&err);
            ctx.supervisor.stop(&site, &run, Some(err.into()));
            drop(guard);
            return Ok(finish(
                &method,
                &target,
                started,
                backend_failure_response(failure, is_tls),
                Some(failure.log_cause()),
            ));
        }
    };

    let status = backend_response.status();

    // A 5xx means the app is probably broken: bleed this backend out and let
    // the next request launch a fresh one. The reply still goes through.
    if status.as_u16() >= 500 {
        ctx.supervisor.stop(&site, &run, None);
    }

    let (mut parts, body) = backend_response.into_parts();
    if is_tls {
        parts.headers.insert(STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS_VALUE));
    }

    let supervisor = Arc::clone(&ctx.supervisor);
    let stop_site = site.clone();
    let stop_run = run.clone();
    let body = ProxiedBody {
        inner: body,
        _guard: guard,
        on_read_error: Some(Box::new(move || {
            supervisor.stop(&stop_site, &stop_run, None);
        })),
    };

    info!(method = %method, target = %target, status = status.as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "request");
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Streamed backend response body: holds the in-flight guard until the
/// stream ends and tears the backend down if the backend dies mid-stream.
/// A client-side write failure merely drops the body, which is the
/// logging-only case.
struct ProxiedBody {
    inner: Incoming,
    _guard: WorkingGuard,
    on_read_error: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Body for ProxiedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Err(err))) => {
                warn!(error = %err, cause = ProxyFailure::Read.log_cause(), "backend died mid-stream");
                if let Some(stop) = this.on_read_error.take() {
                    stop();
                }
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Failing to parse the backend's response head is a read failure; anything
/// else on the send path counts as a write failure.
fn classify_send_error(err: &hyper::Error) -> ProxyFailure {
    if err.is_parse() || err.is_parse_status() || err.is_incomplete_message() {
        ProxyFailure::Read
    } else {
        ProxyFailure::Forward
    }
}

/// A 500 for a failure on the backend hop. Over TLS the strict-transport
/// header goes out on these too, since it is set before the backend write.
fn backend_failure_response(failure: ProxyFailure, is_tls: bool) -> Response<ResponseBody> {
    let mut response = failure_response(failure);
    if is_tls {
        response
            .headers_mut()
            .insert(STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS_VALUE));
    }
    response
}

/// Dial the backend, retrying every 100 ms while the warm-up window from the
/// launch stamp is still open. After the window a single attempt decides.
async fn dial_backend(run: &RunningSite) -> anyhow::Result<TcpStream> {
    if run.start.elapsed() < WARMUP {
        loop {
            match TcpStream::connect(&run.addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if run.start.elapsed() >= WARMUP {
                        return Err(err.into());
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    Ok(TcpStream::connect(&run.addr).await?)
}

/// Host the request addresses: the Host header (port stripped) or, for h2,
/// the URI authority.
fn host_of(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())?;
    let host = raw.split(':').next().unwrap_or(raw);
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

/// Append the client IP to X-Forwarded-For, or set it when absent.
fn append_forwarded_for(req: &mut Request<Incoming>, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let prior: Vec<String> = req
        .headers()
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();
    let combined = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        req.headers_mut().insert(X_FORWARDED_FOR, value);
    }
}

/// Reduce an absolute-form request target to origin-form for the backend hop.
fn strip_to_origin_form(req: &mut Request<Incoming>) {
    if req.method() == Method::CONNECT {
        return;
    }
    if req.uri().scheme().is_some() || req.uri().authority().is_some() {
        let origin = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        if let Ok(uri) = origin.parse::<Uri>() {
            *req.uri_mut() = uri;
        }
    }
}

fn finish(
    method: &Method,
    target: &str,
    started: Instant,
    response: Response<ResponseBody>,
    cause: Option<&str>,
) -> Response<ResponseBody> {
    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match cause {
        Some(cause) => info!(method = %method, target = %target, status, elapsed_ms, cause, "request"),
        None => info!(method = %method, target = %target, status, elapsed_ms, "request"),
    }
    response
}
