//! [`BridgeServer`] – HTTP + WebSocket listener for the control front-end.
//!
//! Listens on `0.0.0.0:3000` (configurable via [`BridgeServer::with_port`]).
//!
//! * WebSocket upgrades (any path) → handed to the [`SocketHub`].
//! * `GET` requests → the fixed page routes, or a file from the frontend
//!   directory.
//!
//! | Path | File |
//! |---|---|
//! | `/` | `index.html` (login) |
//! | `/menu` | `menu.html` |
//! | `/controle` | `manual.html` (manual control) |
//! | `/manutencao` | `manutencao.html` (maintenance) |

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use robobridge_types::BridgeError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::hub::SocketHub;

/// Default TCP port for pages and the WebSocket endpoint.
pub const DEFAULT_PORT: u16 = 3000;

/// Largest request head read for a plain HTTP request.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Named page routes and the file each one serves.
const PAGE_ROUTES: [(&str, &str); 4] = [
    ("/", "index.html"),
    ("/menu", "menu.html"),
    ("/controle", "manual.html"),
    ("/manutencao", "manutencao.html"),
];

// ---------------------------------------------------------------------------
// BridgeServer
// ---------------------------------------------------------------------------

/// Accept loop shared by the static pages and the socket hub.
pub struct BridgeServer {
    hub: SocketHub,
    port: u16,
    frontend_dir: PathBuf,
}

impl BridgeServer {
    /// Server for `hub` on [`DEFAULT_PORT`], serving pages from `./frontend`.
    pub fn new(hub: SocketHub) -> Self {
        Self {
            hub,
            port: DEFAULT_PORT,
            frontend_dir: PathBuf::from("frontend"),
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the directory static pages are read from (builder-style).
    pub fn with_frontend_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.frontend_dir = dir.into();
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn frontend_dir(&self) -> &Path {
        &self.frontend_dir
    }

    /// Bind `0.0.0.0:<port>` and serve forever.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Socket`] if the listener cannot bind.
    pub async fn run(self) -> Result<(), BridgeError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Socket(format!("bind error on {addr}: {e}")))?;
        info!(port = self.port, "listening on http://localhost:{}", self.port);
        self.serve(listener).await;
        Ok(())
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let hub = self.hub.clone();
                    let frontend_dir = self.frontend_dir.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, hub, &frontend_dir).await {
                            warn!(peer = %peer, error = %e, "client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    hub: SocketHub,
    frontend_dir: &Path,
) -> Result<(), BridgeError> {
    let head = read_request_head(&mut stream).await?;
    if head.is_empty() {
        return Ok(());
    }

    if is_websocket_upgrade(&head) {
        // The head has already been consumed; replay it ahead of the socket
        // so tungstenite's handshake sees the whole request.
        let (read_half, write_half) = stream.into_split();
        let replayed = tokio::io::join(Cursor::new(head).chain(read_half), write_half);
        let ws = accept_async(replayed)
            .await
            .map_err(|e| BridgeError::Socket(format!("WS handshake from {peer}: {e}")))?;
        hub.serve(ws, peer).await;
        Ok(())
    } else {
        serve_static(stream, &head, frontend_dir).await
    }
}

fn is_websocket_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

// ---------------------------------------------------------------------------
// Plain HTTP: static pages
// ---------------------------------------------------------------------------

async fn serve_static(mut stream: TcpStream, head: &[u8], frontend_dir: &Path) -> Result<(), BridgeError> {
    let head = String::from_utf8_lossy(head);
    let Some((method, target)) = parse_request_line(&head) else {
        return write_response(&mut stream, "400 Bad Request", "text/plain; charset=utf-8", b"Bad Request", true).await;
    };

    if method != "GET" && method != "HEAD" {
        return write_response(&mut stream, "405 Method Not Allowed", "text/plain; charset=utf-8", b"Method Not Allowed", true)
            .await;
    }
    let with_body = method == "GET";

    let Some(path) = resolve_route(frontend_dir, target) else {
        debug!(target = %target, "rejected request path");
        return write_response(&mut stream, "404 Not Found", "text/plain; charset=utf-8", b"Not Found", with_body).await;
    };

    match tokio::fs::read(&path).await {
        Ok(body) => write_response(&mut stream, "200 OK", content_type(&path), &body, with_body).await,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "static file unavailable");
            write_response(&mut stream, "404 Not Found", "text/plain; charset=utf-8", b"Not Found", with_body).await
        }
    }
}

/// Read until the blank line ending the request head, or [`MAX_REQUEST_HEAD`].
async fn read_request_head(stream: &mut TcpStream) -> Result<Vec<u8>, BridgeError> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") || head.len() >= MAX_REQUEST_HEAD {
            break;
        }
    }
    Ok(head)
}

/// `"GET /menu?x=1 HTTP/1.1"` → `("GET", "/menu?x=1")`.
fn parse_request_line(head: &str) -> Option<(&str, &str)> {
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    Some((method, target))
}

/// Map a request target to a file under `frontend_dir`.
///
/// Named page routes win; anything else is looked up relative to the
/// directory. Targets that try to leave the directory yield `None`.
pub fn resolve_route(frontend_dir: &Path, target: &str) -> Option<PathBuf> {
    let path = target.split(['?', '#']).next().unwrap_or("/");

    if let Some((_, file)) = PAGE_ROUTES.iter().find(|(route, _)| *route == path) {
        return Some(frontend_dir.join(file));
    }

    let relative = Path::new(path.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return None;
    }
    if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(frontend_dir.join(relative))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
    with_body: bool,
) -> Result<(), BridgeError> {
    let head = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    if with_body {
        stream.write_all(body).await?;
    }
    stream.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
