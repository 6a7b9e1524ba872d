//! Development server with live reload support.
//!
//! Built on `tiny_http`:
//!
//! - Static file serving from the build output directory
//! - `index.html` and `<path>.html` resolution
//! - Reload client injected into every HTML response
//! - File watching and incremental rebuilds (via `watch` module)
//! - Graceful shutdown on Ctrl+C
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │   Main Thread   │   │  Watcher Thread  │   │  Reload Thread   │
//! │  (HTTP Server)  │   │  (rebuilds)      │   │  (WebSocket)     │
//! └────────┬────────┘   └────────┬─────────┘   └────────▲─────────┘
//!          │                     │   push_update        │
//!          ▼                     └──────────────────────┘
//!    serve output dir
//! ```
//!
//! Ctrl+C unblocks the server; the watcher and the reload endpoint are then
//! stopped and joined in that order.

use crate::{
    build::Orchestrator,
    config::SiteConfig,
    log,
    reload::{LiveReload, client_script},
    watch::Watch,
};
use anyhow::{Context, Result};
use std::{
    fs,
    io::Cursor,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};
use tiny_http::{Header, Request, Response, Server, StatusCode};

/// Try binding to port, retry with incremented port if in use
const MAX_PORT_RETRIES: u16 = 10;

// ============================================================================
// Server Entry Point
// ============================================================================

/// Seed the output, then serve it while watching for changes.
///
/// Blocks until Ctrl+C is received.
pub fn serve_site(config: &SiteConfig) -> Result<()> {
    let interface: IpAddr = config
        .serve
        .interface
        .parse()
        .with_context(|| format!("[serve.interface] `{}` is not an IP address", config.serve.interface))?;

    let reload = Arc::new(LiveReload::serve(
        interface,
        config.serve.reload_port,
        config.output_root().to_path_buf(),
    )?);
    log!("reload"; "ws://{}", reload.addr());

    let mut orchestrator = Orchestrator::new(config, reload.clone())?;
    orchestrator.validate()?;
    orchestrator.seed(config.serve.seed_assets)?.log_result();

    let (server, addr) = try_bind_port(interface, config.serve.port, MAX_PORT_RETRIES)?;
    let server = Arc::new(server);

    let server_for_signal = Arc::clone(&server);
    ctrlc::set_handler(move || {
        log!("serve"; "shutting down...");
        server_for_signal.unblock();
    })
    .context("Failed to set Ctrl+C handler")?;

    log!("serve"; "http://{}", addr);

    let watch = if config.serve.watch {
        Some(Watch::start(orchestrator, config)?)
    } else {
        None
    };

    let site = Site {
        root: config.output_root().to_path_buf(),
        reload_port: reload.addr().port(),
    };
    for request in server.incoming_requests() {
        if let Err(e) = site.handle(request) {
            log!("serve"; "request error: {e}");
        }
    }

    if let Some(watch) = watch {
        watch.stop();
    }
    reload.shutdown();
    log!("serve"; "stopped");
    Ok(())
}

/// Try to bind to a port, retrying with incremented port numbers if in use.
fn try_bind_port(interface: IpAddr, base_port: u16, max_retries: u16) -> Result<(Server, SocketAddr)> {
    let mut last_error = None;
    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        let addr = SocketAddr::new(interface, port);

        match Server::http(addr) {
            Ok(server) => {
                if offset > 0 {
                    log!("serve"; "port {} in use, using {} instead", base_port, port);
                }
                return Ok((server, addr));
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(anyhow::anyhow!(
        "Failed to bind after {} attempts (ports {}-{}): {}",
        max_retries,
        base_port,
        base_port.saturating_add(max_retries.saturating_sub(1)),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}

// ============================================================================
// Request Handling
// ============================================================================

/// The output tree as seen by browsers.
struct Site {
    root: PathBuf,
    reload_port: u16,
}

impl Site {
    /// Map a request URL to a file.
    ///
    /// Resolution order: exact file, `<dir>/index.html`, `<path>.html`.
    fn resolve(&self, url: &str) -> Option<PathBuf> {
        // Decode URL-encoded characters (e.g., %20 → space)
        let decoded = urlencoding::decode(url)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_default();
        // Strip query string used for cache busting (e.g. `?t=123`)
        let path = decoded.split('?').next().unwrap_or(&decoded);
        let request_path = path.trim_matches('/');
        if request_path.split('/').any(|part| part == "..") {
            return None;
        }

        let local = self.root.join(request_path);
        [
            local.clone(),
            local.join("index.html"),
            local.with_extension("html"),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
    }

    fn handle(&self, request: Request) -> Result<()> {
        match self.resolve(request.url()) {
            Some(path) => self.serve_file(request, &path),
            None => serve_not_found(request),
        }
    }

    /// Serve a file with appropriate content type.
    fn serve_file(&self, request: Request, path: &Path) -> Result<()> {
        let mut content =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let content_type = guess_content_type(path);
        if content_type.starts_with("text/html") {
            content = inject_reload(content, &client_script(self.reload_port));
        }

        let response = Response::from_data(content).with_header(header(content_type));
        request.respond(response)?;
        Ok(())
    }
}

/// Insert `script` before the last `</body>`, or append it.
fn inject_reload(mut html: Vec<u8>, script: &str) -> Vec<u8> {
    const BODY_END: &[u8] = b"</body>";
    match html.windows(BODY_END.len()).rposition(|w| w == BODY_END) {
        Some(at) => {
            html.splice(at..at, script.bytes());
        }
        None => html.extend_from_slice(script.as_bytes()),
    }
    html
}

fn header(content_type: &'static str) -> Header {
    // Only called with the ASCII literals above.
    Header::from_bytes("Content-Type", content_type).unwrap()
}

/// Serve 404 Not Found response.
fn serve_not_found(request: Request) -> Result<()> {
    let response = Response::new(
        StatusCode(404),
        vec![header("text/plain")],
        Cursor::new("404 Not Found"),
        Some(13),
        None,
    );
    request.respond(response)?;
    Ok(())
}

// ============================================================================
// Content Type Detection
// ============================================================================

/// Guess MIME content type from file extension.
///
/// Returns `application/octet-stream` for unknown extensions.
fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        // Web content
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "application/javascript; charset=utf-8",
        Some("json" | "map") => "application/json; charset=utf-8",
        Some("xml") => "application/xml; charset=utf-8",

        // Images
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("ico") => "image/x-icon",

        // Fonts
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",

        Some("txt") => "text/plain; charset=utf-8",

        // Default binary
        _ => "application/octet-stream",
    }
}
