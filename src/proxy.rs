use std::{convert::Infallible, fs, net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    http::request::Parts,
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use regex::Regex;
use tokio::{
    net::TcpListener,
    sync::{Mutex as AsyncMutex, oneshot},
    task::JoinSet,
};

use crate::{
    config::{Config, EndpointConfig, HeaderReplacement},
    redact::Redactor,
    store::{HEAD_SHA, RecordInteraction, RecordStore, RecordedRequest, RecordedResponse},
    websocket,
};

type UpstreamConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<UpstreamConnector, Full<Bytes>>;

/// Running recorder: one listener per configured endpoint.
#[derive(Debug)]
pub struct RecorderHandle {
    /// Bound addresses, in endpoint order. Useful when `source_port = 0`.
    pub listen_addrs: Vec<SocketAddr>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl RecorderHandle {
    /// Stops accepting new connections and waits for every endpoint
    /// listener to halt. In-flight requests complete best-effort.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        self.join.await.context("join endpoint supervisor")?
    }
}

/// Serves every endpoint until the first endpoint error or a shutdown
/// signal (SIGINT/SIGTERM/SIGQUIT); signals produce a clean `Ok` exit.
pub async fn run(config: &Config, recording_dir: &Path, redactor: Redactor) -> anyhow::Result<()> {
    let handle = serve(config, recording_dir, redactor).await?;
    let mut join = handle.join;
    tokio::select! {
        result = &mut join => {
            return result.context("join endpoint supervisor")?;
        }
        signal = shutdown_signal() => {
            tracing::info!(signal, "shutting down");
            let _ = handle.shutdown_tx.send(());
        }
    }
    let _ = join.await;
    Ok(())
}

/// Binds one listener per endpoint and starts recording. The first
/// error from any endpoint cancels its siblings and surfaces through
/// [`RecorderHandle::shutdown`].
pub async fn serve(
    config: &Config,
    recording_dir: &Path,
    redactor: Redactor,
) -> anyhow::Result<RecorderHandle> {
    init_tls_crypto()?;
    create_recording_dir(recording_dir)?;
    tracing::info!(recording_dir = %recording_dir.display(), "recording started");

    let client = build_upstream_client()?;
    let redactor = Arc::new(redactor);

    let mut proxies = Vec::with_capacity(config.endpoints.len());
    let mut listen_addrs = Vec::with_capacity(config.endpoints.len());
    for endpoint in &config.endpoints {
        let addr = SocketAddr::from(([0, 0, 0, 0], endpoint.source_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let listen_addr = listener.local_addr().context("get local_addr")?;
        tracing::info!(
            listen = %listen_addr,
            target = %endpoint.upstream_url(""),
            "endpoint listener started"
        );
        listen_addrs.push(listen_addr);
        proxies.push((
            listener,
            Arc::new(RecordingProxy::new(
                endpoint.clone(),
                recording_dir,
                Arc::clone(&redactor),
                client.clone(),
            )?),
        ));
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(supervise(proxies, shutdown_rx));

    Ok(RecorderHandle {
        listen_addrs,
        shutdown_tx,
        join,
    })
}

async fn supervise(
    proxies: Vec<(TcpListener, Arc<RecordingProxy>)>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let mut endpoints = JoinSet::new();
    for (listener, proxy) in proxies {
        endpoints.spawn(accept_loop(listener, proxy));
    }

    let result = loop {
        tokio::select! {
            _ = &mut shutdown_rx => break Ok(()),
            joined = endpoints.join_next() => match joined {
                Some(Ok(Ok(()))) | None => break Ok(()),
                Some(Ok(Err(err))) => break Err(err),
                Some(Err(err)) => break Err(anyhow::anyhow!("endpoint task panicked: {err}")),
            }
        }
    };
    endpoints.shutdown().await;
    result
}

async fn accept_loop(listener: TcpListener, proxy: Arc<RecordingProxy>) -> anyhow::Result<()> {
    loop {
        let (stream, _peer) = listener
            .accept()
            .await
            .with_context(|| format!("accept on port {}", proxy.endpoint.source_port))?;
        let io = TokioIo::new(stream);
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(Arc::clone(&proxy), req));
            let builder = ConnectionBuilder::new(TokioExecutor::new());
            if let Err(err) = builder.serve_connection_with_upgrades(io, service).await {
                tracing::debug!("connection error: {err}");
            }
        });
    }
}

async fn handle_request(
    proxy: Arc<RecordingProxy>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == proxy.endpoint.health_path {
        return Ok(plain_response(StatusCode::OK, Bytes::new()));
    }
    tracing::info!(method = %req.method(), uri = %req.uri(), "recording request");

    match proxy.record_request(req).await {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::error!(
                source_port = proxy.endpoint.source_port,
                "record request: {err:#}"
            );
            Ok(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("record request: {err:#}"),
            ))
        }
    }
}

struct RecordingProxy {
    endpoint: EndpointConfig,
    rewrites: Vec<HeaderRewrite>,
    redactor: Arc<Redactor>,
    client: HttpClient,
    /// Guards the whole canonicalize/forward/record/advance sequence;
    /// chain links come out wrong if two requests on the same endpoint
    /// interleave anywhere inside it.
    chain: AsyncMutex<ChainState>,
}

struct ChainState {
    prev_sha: String,
    store: RecordStore,
}

impl RecordingProxy {
    fn new(
        endpoint: EndpointConfig,
        recording_dir: &Path,
        redactor: Arc<Redactor>,
        client: HttpClient,
    ) -> anyhow::Result<Self> {
        let rewrites = endpoint
            .response_header_replacements
            .iter()
            .map(HeaderRewrite::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            endpoint,
            rewrites,
            redactor,
            client,
            chain: AsyncMutex::new(ChainState {
                prev_sha: HEAD_SHA.to_owned(),
                store: RecordStore::new(recording_dir),
            }),
        })
    }

    async fn record_request(
        self: &Arc<Self>,
        req: Request<Incoming>,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let (mut parts, body) = req.into_parts();
        let body_bytes = body.collect().await.context("read request body")?.to_bytes();

        let mut chain = self.chain.lock().await;
        let mut recorded =
            RecordedRequest::from_parts(&parts, &body_bytes, &chain.prev_sha, &self.endpoint);
        recorded.drop_headers(&self.endpoint.redact_request_headers);
        recorded.redact(&self.redactor);

        let file_name = recorded.recording_file_name();
        if !chain.store.contains(&file_name) {
            // First request of a fresh recording roots a new chain.
            recorded.previous_request = HEAD_SHA.to_owned();
        }

        if is_websocket_upgrade(&parts.headers) {
            let log_path = chain.store.websocket_log_path(&file_name);
            drop(chain);
            tracing::info!(log = %log_path.display(), "upgrading connection to websocket");
            return websocket::proxy_upgrade(
                &mut parts,
                &self.endpoint,
                Arc::clone(&self.redactor),
                log_path,
            )
            .await;
        }

        let (status, headers, upstream_body) = self.forward_upstream(&parts, body_bytes).await?;

        let sha_sum = recorded.compute_sum();
        let mut response = RecordedResponse::new(status.as_u16(), &headers, upstream_body.to_vec());
        response.redact(&self.redactor);
        chain
            .store
            .append(
                &file_name,
                RecordInteraction {
                    request: recorded,
                    sha_sum: sha_sum.clone(),
                    response,
                },
            )
            .await?;
        chain.prev_sha = sha_sum;
        drop(chain);

        // The client gets the upstream body untouched, compression and all.
        let mut client_response = Response::new(Full::new(upstream_body));
        *client_response.status_mut() = status;
        *client_response.headers_mut() = headers;
        Ok(client_response)
    }

    async fn forward_upstream(
        &self,
        parts: &Parts,
        body: Bytes,
    ) -> anyhow::Result<(StatusCode, hyper::HeaderMap, Bytes)> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = self.endpoint.upstream_url(path_and_query);
        let uri: Uri = url
            .parse()
            .with_context(|| format!("parse upstream url {url}"))?;

        let mut upstream_req = Request::builder()
            .method(parts.method.clone())
            .uri(uri.clone())
            .body(Full::new(body))
            .context("build upstream request")?;
        *upstream_req.headers_mut() = parts.headers.clone();
        drop_connection_headers(upstream_req.headers_mut());
        // The client addressed the proxy; upstream gets its own authority.
        if let Some(authority) = uri.authority() {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                upstream_req.headers_mut().insert(header::HOST, host);
            }
        }

        let upstream_res = self
            .client
            .request(upstream_req)
            .await
            .with_context(|| format!("dispatch upstream request to {url}"))?;
        let (mut res_parts, res_body) = upstream_res.into_parts();
        let body_bytes = res_body
            .collect()
            .await
            .context("read upstream response body")?
            .to_bytes();

        drop_connection_headers(&mut res_parts.headers);
        apply_header_rewrites(&self.rewrites, &mut res_parts.headers);
        Ok((res_parts.status, res_parts.headers, body_bytes))
    }
}

#[derive(Debug)]
struct HeaderRewrite {
    header: HeaderName,
    regex: Regex,
    replace: String,
}

impl HeaderRewrite {
    fn compile(replacement: &HeaderReplacement) -> anyhow::Result<Self> {
        Ok(Self {
            header: replacement
                .header
                .parse()
                .with_context(|| format!("invalid response header name `{}`", replacement.header))?,
            regex: Regex::new(&replacement.regex).with_context(|| {
                format!("compile response header regex `{}`", replacement.regex)
            })?,
            replace: replacement.replace.clone(),
        })
    }
}

/// Applies each configured rewrite, in order, to every value of its
/// named response header. Absent headers are left alone.
fn apply_header_rewrites(rewrites: &[HeaderRewrite], headers: &mut hyper::HeaderMap) {
    for rewrite in rewrites {
        let mut values: Vec<HeaderValue> =
            headers.get_all(&rewrite.header).iter().cloned().collect();
        if values.is_empty() {
            continue;
        }
        for value in &mut values {
            let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
            let replaced = rewrite.regex.replace_all(&text, rewrite.replace.as_str());
            if let Ok(rewritten) = HeaderValue::from_bytes(replaced.as_bytes()) {
                *value = rewritten;
            }
        }
        headers.remove(&rewrite.header);
        for value in values {
            headers.append(rewrite.header.clone(), value);
        }
    }
}

/// Recordings are fixtures other tools read back; the directory mode is
/// pinned to 0755 instead of whatever the process umask yields.
fn create_recording_dir(recording_dir: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    let result = {
        use std::os::unix::fs::DirBuilderExt as _;

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(recording_dir)
    };
    #[cfg(not(unix))]
    let result = fs::create_dir_all(recording_dir);

    result.with_context(|| format!("create recording directory {}", recording_dir.display()))
}

/// rustls wants a process-wide crypto provider before the first TLS
/// config is built; install ring unless one is already in place.
fn init_tls_crypto() -> anyhow::Result<()> {
    use rustls::crypto::{CryptoProvider, ring};

    if CryptoProvider::get_default().is_some() {
        return Ok(());
    }
    // A concurrent install elsewhere loses the race but still counts.
    if ring::default_provider().install_default().is_ok()
        || CryptoProvider::get_default().is_some()
    {
        return Ok(());
    }
    anyhow::bail!("no rustls crypto provider could be installed")
}

fn build_upstream_client() -> anyhow::Result<HttpClient> {
    let tls = HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("load native TLS roots for the upstream client")?;
    let connector = tls.https_or_http().enable_http1().enable_http2().build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

pub(crate) fn is_websocket_upgrade(headers: &hyper::HeaderMap) -> bool {
    match headers.get(header::UPGRADE).map(HeaderValue::to_str) {
        Some(Ok(upgrade)) => upgrade.eq_ignore_ascii_case("websocket"),
        _ => false,
    }
}

/// Connection-scoped (RFC 7230 hop-by-hop) headers never cross the
/// proxy: both legs of the upstream exchange re-frame the message, so
/// the fixed set below and anything the Connection header names are
/// dropped before forwarding.
const CONNECTION_SCOPED_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("proxy-connection"),
];

fn drop_connection_headers(headers: &mut hyper::HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &CONNECTION_SCOPED_HEADERS {
        headers.remove(name);
    }
}

fn plain_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("install SIGQUIT handler");

    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    }
}

#[cfg(test)]
mod tests {
    use hyper::header::{self, HeaderValue};

    use super::{
        HeaderRewrite, apply_header_rewrites, drop_connection_headers, is_websocket_upgrade,
    };
    use crate::config::HeaderReplacement;

    fn rewrite(header: &str, regex: &str, replace: &str) -> HeaderRewrite {
        HeaderRewrite::compile(&HeaderReplacement {
            header: header.to_owned(),
            regex: regex.to_owned(),
            replace: replace.to_owned(),
        })
        .expect("rewrite should compile")
    }

    #[test]
    fn rewrites_every_match_in_every_value() {
        let rewrites = vec![rewrite("Set-Cookie", "sessionid=[^;]+", "sessionid=X")];
        let mut headers = hyper::HeaderMap::new();
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("sessionid=abc; Path=/"),
        );
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("theme=dark; Path=/"),
        );

        apply_header_rewrites(&rewrites, &mut headers);

        let values: Vec<_> = headers.get_all(header::SET_COOKIE).iter().collect();
        assert_eq!(values[0], "sessionid=X; Path=/");
        assert_eq!(values[1], "theme=dark; Path=/");
    }

    #[test]
    fn rewrites_apply_in_configured_order() {
        let rewrites = vec![
            rewrite("X-Trace", "id=[0-9]+", "id=N"),
            rewrite("X-Trace", "N", "masked"),
        ];
        let mut headers = hyper::HeaderMap::new();
        headers.insert("x-trace", HeaderValue::from_static("id=1234"));

        apply_header_rewrites(&rewrites, &mut headers);

        assert_eq!(headers.get("x-trace").unwrap(), "id=masked");
    }

    #[test]
    fn absent_header_is_left_alone() {
        let rewrites = vec![rewrite("Set-Cookie", ".*", "gone")];
        let mut headers = hyper::HeaderMap::new();
        headers.insert("x-other", HeaderValue::from_static("kept"));

        apply_header_rewrites(&rewrites, &mut headers);

        assert_eq!(headers.get("x-other").unwrap(), "kept");
        assert!(headers.get(header::SET_COOKIE).is_none());
    }

    #[test]
    fn invalid_rewrite_regex_fails_compile() {
        let err = HeaderRewrite::compile(&HeaderReplacement {
            header: "Set-Cookie".to_owned(),
            regex: "sessionid=[".to_owned(),
            replace: String::new(),
        })
        .unwrap_err();
        assert!(
            err.to_string().contains("compile response header regex"),
            "{err}"
        );
    }

    #[test]
    fn websocket_upgrade_detection_is_case_insensitive() {
        let mut headers = hyper::HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn drops_connection_scoped_and_connection_named_headers() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-hop"));
        headers.insert("x-hop", HeaderValue::from_static("secret"));
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        headers.insert("x-end", HeaderValue::from_static("kept"));

        drop_connection_headers(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-hop").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get("x-end").unwrap(), "kept");
    }
}
