use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use bytes::Bytes;
use futures_util::{Sink, SinkExt as _, Stream, StreamExt as _};
use http_body_util::Full;
use hyper::{
    Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
    http::request::Parts,
    upgrade::OnUpgrade,
};
use hyper_util::rt::TokioIo;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _},
    sync::mpsc,
};
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest as _,
        error::ProtocolError,
        handshake::derive_accept_key,
        protocol::{Role, WebSocketConfig},
    },
};

use crate::{config::EndpointConfig, redact::Redactor};

/// Handshake headers the upstream dial regenerates instead of forwarding
/// from the client.
const UNFORWARDED_HEADERS: &[&str] = &[
    "sec-websocket-version",
    "sec-websocket-key",
    "sec-websocket-extensions",
    "connection",
    "upgrade",
    "test-name",
    "host",
];

const READ_BUFFER_SIZE: usize = 1024;
const WRITE_BUFFER_SIZE: usize = 1024;

/// Dials the upstream WebSocket, accepts the client upgrade, and tees
/// frames in both directions into `log_path` while passing the original
/// bytes through untouched.
///
/// A dial failure surfaces before the client upgrade completes, so the
/// client sees a plain HTTP error rather than a half-open socket.
pub(crate) async fn proxy_upgrade(
    parts: &mut Parts,
    endpoint: &EndpointConfig,
    redactor: Arc<Redactor>,
    log_path: PathBuf,
) -> anyhow::Result<Response<Full<Bytes>>> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = endpoint.upstream_websocket_url(path_and_query);

    let mut dial_request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("build upstream websocket request {url}"))?;
    for (name, value) in forwarded_dial_headers(&parts.headers) {
        dial_request.headers_mut().append(name, value);
    }
    let (upstream, _handshake_response) = connect_async(dial_request)
        .await
        .with_context(|| format!("dial upstream websocket {url}"))?;

    let key = parts
        .headers
        .get(header::SEC_WEBSOCKET_KEY)
        .context("missing Sec-WebSocket-Key header")?;
    let accept_key = derive_accept_key(key.as_bytes());
    let on_upgrade = parts
        .extensions
        .remove::<OnUpgrade>()
        .context("connection does not support upgrades")?;
    let log_file = File::create(&log_path)
        .await
        .with_context(|| format!("create websocket log {}", log_path.display()))?;

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::error!("upgrade client websocket connection: {err}");
                return;
            }
        };
        let config = WebSocketConfig::default()
            .read_buffer_size(READ_BUFFER_SIZE)
            .write_buffer_size(WRITE_BUFFER_SIZE);
        let client =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(config))
                .await;
        if let Err(err) = tee(client, upstream, redactor, log_file).await {
            tracing::error!(log = %log_path.display(), "websocket tee aborted: {err:#}");
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Full::new(Bytes::new()))
        .context("build switching protocols response")
}

fn forwarded_dial_headers(headers: &hyper::HeaderMap) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| !UNFORWARDED_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Pumps frames both ways and serializes log records through a single
/// writer task. The writer finishes once both pumps have dropped their
/// senders; a log write error cancels the pumps, which tears down both
/// connections.
async fn tee<C, U>(
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    redactor: Arc<Redactor>,
    mut log_file: File,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (upstream_sink, upstream_stream) = upstream.split();
    let (client_sink, client_stream) = client.split();
    let (log_tx, mut log_rx) = mpsc::channel::<Vec<u8>>(32);

    let client_to_upstream = pump(
        client_stream,
        upstream_sink,
        log_tx.clone(),
        Arc::clone(&redactor),
        '>',
    );
    let upstream_to_client = pump(upstream_stream, client_sink, log_tx, redactor, '<');
    let pumps = async {
        tokio::join!(client_to_upstream, upstream_to_client);
        Ok::<_, anyhow::Error>(())
    };
    let writer = async {
        while let Some(record) = log_rx.recv().await {
            log_file
                .write_all(&record)
                .await
                .context("write websocket recording log")?;
        }
        log_file
            .flush()
            .await
            .context("flush websocket recording log")?;
        Ok::<_, anyhow::Error>(())
    };

    tokio::try_join!(pumps, writer)?;
    Ok(())
}

/// Reads messages from `src`, logs a redacted copy, and forwards the
/// original to `dst`. `direction` is `>` for client→upstream and `<` for
/// upstream→client.
async fn pump<S, D>(
    mut src: S,
    mut dst: D,
    log_tx: mpsc::Sender<Vec<u8>>,
    redactor: Arc<Redactor>,
    direction: char,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    D: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(next) = src.next().await {
        let message = match next {
            Ok(message) => message,
            // Expected terminations: orderly close or the peer dropping
            // the socket without a closing handshake.
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => break,
            Err(err) => {
                tracing::warn!(%direction, "read from websocket: {err}");
                break;
            }
        };

        if message.is_close() {
            let _ = dst.send(message).await;
            break;
        }
        let payload = match &message {
            Message::Text(text) => Some(text.as_bytes().to_vec()),
            Message::Binary(data) => Some(data.to_vec()),
            // Ping/pong keepalives pass through without a log record.
            _ => None,
        };
        let Some(mut payload) = payload else {
            if let Err(err) = dst.send(message).await {
                tracing::warn!(%direction, "write to websocket: {err}");
                break;
            }
            continue;
        };

        payload.push(b'\n');
        if log_tx
            .send(frame_record(direction, &payload, &redactor))
            .await
            .is_err()
        {
            // Writer failed; the tee is tearing the connection down.
            break;
        }
        if let Err(err) = dst.send(message).await {
            tracing::warn!(%direction, "write to websocket: {err}");
            break;
        }
    }
}

/// `<dir><len> <redacted-bytes>` where the payload already carries the
/// appended `\n` and `<len>` counts the redacted bytes including it.
fn frame_record(direction: char, payload_with_newline: &[u8], redactor: &Redactor) -> Vec<u8> {
    let redacted = redactor.redact_bytes(payload_with_newline);
    let mut record = format!("{direction}{} ", redacted.len()).into_bytes();
    record.extend_from_slice(&redacted);
    record
}

#[cfg(test)]
mod tests {
    use hyper::header::{HeaderName, HeaderValue};

    use super::{forwarded_dial_headers, frame_record};
    use crate::redact::Redactor;

    #[test]
    fn frame_record_counts_redacted_bytes_with_newline() {
        let redactor = Redactor::new(["secret".to_owned()]);
        let record = frame_record('>', b"hello-secret\n", &redactor);
        assert_eq!(record, b">15 hello-REDACTED\n".to_vec());
    }

    #[test]
    fn frame_record_without_secrets_keeps_original_length() {
        let redactor = Redactor::default();
        let record = frame_record('<', b"ping\n", &redactor);
        assert_eq!(record, b"<5 ping\n".to_vec());
    }

    #[test]
    fn dial_headers_exclude_handshake_and_test_headers() {
        let mut headers = hyper::HeaderMap::new();
        for (name, value) in [
            ("host", "proxy.local"),
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("sec-websocket-version", "13"),
            ("sec-websocket-extensions", "permessage-deflate"),
            ("test-name", "scenario-1"),
            ("authorization", "Bearer token"),
            ("x-custom", "kept"),
        ] {
            headers.append(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }

        let forwarded = forwarded_dial_headers(&headers);
        let mut names: Vec<&str> = forwarded.iter().map(|(name, _)| name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["authorization", "x-custom"]);
    }
}
