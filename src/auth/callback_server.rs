//! OAuth2 redirect listener
//!
//! A short-lived local HTTP server that captures the authorization code from
//! the browser redirect. Each connection is served on its own task, so a
//! browser's idle pre-connect cannot hold up the redirect. The first GET
//! carrying a `code` (or an OAuth `error`) is handed to the caller through a
//! one-shot channel; the caller then stops the listener.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use url::Url;
use crate::Result;
use crate::error::Error;

/// Default callback port
pub const CALLBACK_PORT: u16 = 8239;

/// How long a connection may stay silent before it is dropped
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_BYTES: usize = 8192;

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>muon | Signed in</title></head>
<body style="font-family: system-ui, sans-serif; text-align: center; margin-top: 20vh;">
    <h1>Authentication successful</h1>
    <p>You can close this tab and return to your terminal.</p>
</body>
</html>"#;

const ERROR_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>muon | Sign-in failed</title></head>
<body style="font-family: system-ui, sans-serif; text-align: center; margin-top: 20vh;">
    <h1>Authentication failed</h1>
    <p>Check your terminal for details and try again.</p>
</body>
</html>"#;

const WAITING_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>muon</title></head>
<body style="font-family: system-ui, sans-serif; text-align: center; margin-top: 20vh;">
    <p>Waiting for the identity provider redirect...</p>
</body>
</html>"#;

/// Authorization code result from the callback
#[derive(Debug, Clone)]
pub struct AuthorizationResult {
    pub code: String,
    pub state: Option<String>,
}

/// What a single incoming request means for the login
#[derive(Debug)]
enum Callback {
    /// Anything other than GET
    NotAllowed,
    /// A GET without `code` or `error`, e.g. a favicon request
    Pending,
    /// The redirect we were waiting for
    Completed(Result<AuthorizationResult>),
}

/// Redirect URI registered with the identity provider for `port`
pub fn redirect_uri(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

/// Bind the listener on the loopback interface
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = format!("127.0.0.1:{}", port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::OAuth(format!("Failed to start callback server on {}: {}", addr, e)))
}

/// Serve `listener` until the redirect arrives or `timeout` elapses
///
/// Ctrl-C while waiting stops the listener and yields [`Error::Cancelled`].
pub async fn wait_for_callback(
    listener: TcpListener,
    expected_state: Option<&str>,
    timeout: Duration,
) -> Result<AuthorizationResult> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Callback server listening on http://{}", addr);
    }

    let (tx, rx) = oneshot::channel();
    let server = tokio::spawn(serve(listener, expected_state.map(str::to_string), tx));

    let outcome = tokio::select! {
        received = tokio::time::timeout(timeout, rx) => match received {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::OAuth("Callback server stopped before receiving a redirect".to_string())),
            Err(_) => Err(Error::LoginTimeout(timeout.as_secs())),
        },
        _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
    };

    server.abort();
    outcome
}

type ResultSlot = Arc<Mutex<Option<oneshot::Sender<Result<AuthorizationResult>>>>>;

async fn serve(
    listener: TcpListener,
    expected_state: Option<String>,
    tx: oneshot::Sender<Result<AuthorizationResult>>,
) {
    let slot: ResultSlot = Arc::new(Mutex::new(Some(tx)));
    let expected_state: Arc<Option<String>> = Arc::new(expected_state);

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                deliver(&slot, Err(Error::OAuth(format!("Failed to accept connection: {}", e))));
                return;
            }
        };

        let slot = slot.clone();
        let expected_state = expected_state.clone();
        tokio::spawn(async move {
            handle_connection(socket, &expected_state, &slot).await;
            tracing::trace!("Closed callback connection from {}", peer);
        });
    }
}

async fn handle_connection(mut socket: TcpStream, expected_state: &Option<String>, slot: &ResultSlot) {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut socket)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            tracing::debug!("Dropping unreadable callback request: {}", e);
            return;
        }
        Err(_) => {
            tracing::debug!("Dropping idle callback connection");
            return;
        }
    };

    match classify(&request, expected_state.as_deref()) {
        Callback::NotAllowed => {
            respond(&mut socket, "405 Method Not Allowed", "").await;
        }
        Callback::Pending => {
            respond(&mut socket, "200 OK", WAITING_HTML).await;
        }
        Callback::Completed(result) => {
            let (status, body) = match &result {
                Ok(_) => ("200 OK", SUCCESS_HTML),
                Err(_) => ("400 Bad Request", ERROR_HTML),
            };
            respond(&mut socket, status, body).await;
            deliver(slot, result);
        }
    }
}

/// Hand `result` to the waiting caller; only the first one is kept
fn deliver(slot: &ResultSlot, result: Result<AuthorizationResult>) {
    let sender = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(_) => None,
    };
    if let Some(tx) = sender {
        let _ = tx.send(result);
    }
}

/// Read the request head, up to the blank line or [`MAX_REQUEST_BYTES`]
async fn read_request(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn respond(socket: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

fn classify(request: &str, expected_state: Option<&str>) -> Callback {
    let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or("/");

    if method != "GET" {
        return Callback::NotAllowed;
    }

    let url = match Url::parse(&format!("http://localhost{}", target)) {
        Ok(url) => url,
        Err(e) => {
            return Callback::Completed(Err(Error::OAuth(format!(
                "Failed to parse callback URL: {}",
                e
            ))))
        }
    };

    let has = |name: &str| url.query_pairs().any(|(key, _)| key == name);
    if !has("code") && !has("error") {
        return Callback::Pending;
    }

    Callback::Completed(parse_callback_query(&url, expected_state))
}

/// Extract the authorization code from the redirect URL
fn parse_callback_query(url: &Url, expected_state: Option<&str>) -> Result<AuthorizationResult> {
    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut error_description = None;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.to_string()),
            "state" => state = Some(value.to_string()),
            "error" => error = Some(value.to_string()),
            "error_description" => error_description = Some(value.to_string()),
            _ => {}
        }
    }

    if let Some(err) = error {
        let description = error_description.unwrap_or_else(|| "Unknown error".to_string());
        return Err(Error::OAuth(format!("Authorization failed: {} - {}", err, description)));
    }

    if let Some(expected) = expected_state {
        match &state {
            Some(s) if s == expected => {}
            Some(s) => return Err(Error::OAuth(format!("State mismatch: expected {}, got {}", expected, s))),
            None => return Err(Error::OAuth("Missing state parameter".to_string())),
        }
    }

    let code = code.ok_or_else(|| Error::OAuth("Missing authorization code".to_string()))?;

    Ok(AuthorizationResult { code, state })
}
