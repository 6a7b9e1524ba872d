//! Live reload notification.
//!
//! Stage runners report the outputs they wrote to a [`Notifier`]. In
//! development the notifier is a [`LiveReload`] endpoint that forwards each
//! update to connected browsers over a WebSocket:
//!
//! ```text
//! StageRunner ──push_update──► LiveReload ──{"kind":"css"|"reload"}──► browsers
//! ```
//!
//! A stylesheet-only update is hot swapped by the client script; anything
//! else reloads the page. Notifier failures are logged by the caller and
//! never fail a build.

use crate::{log, pipeline::OutputFile};
use anyhow::{Context, Result, bail};
use kiln_core::glob::to_slash;
use parking_lot::Mutex;
use std::{
    io,
    net::{IpAddr, SocketAddr, TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tungstenite::{Message, WebSocket};

/// Client script injected into served pages.
const CLIENT_SCRIPT: &str = include_str!("embed/reload.js");

/// How often the accept loop checks for shutdown.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// A slow browser must not stall the build.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest wait for a peer's upgrade request.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives the outputs of every stage run.
pub trait Notifier: Send + Sync {
    fn push_update(&self, outputs: &[OutputFile]) -> Result<()>;
}

/// Production builds have nobody to notify.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn push_update(&self, _outputs: &[OutputFile]) -> Result<()> {
        Ok(())
    }
}

/// `<script>` tag connecting a page to the reload endpoint on `port`.
pub fn client_script(port: u16) -> String {
    format!(
        "<script>{}</script>",
        CLIENT_SCRIPT.replace("__KILN_RELOAD_PORT__", &port.to_string())
    )
}

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// WebSocket endpoint broadcasting output updates.
pub struct LiveReload {
    addr: SocketAddr,
    output_root: PathBuf,
    clients: Clients,
    shutdown: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl LiveReload {
    /// Bind `interface:port` and start accepting browsers.
    ///
    /// `output_root` turns output paths into the URL paths clients see.
    pub fn serve(interface: IpAddr, port: u16, output_root: PathBuf) -> Result<Self> {
        let listener = TcpListener::bind((interface, port))
            .with_context(|| format!("Failed to bind live reload port {port}"))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let clients = Clients::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let acceptor = thread::Builder::new()
            .name("kiln-reload".into())
            .spawn({
                let clients = Arc::clone(&clients);
                let shutdown = Arc::clone(&shutdown);
                move || accept_loop(&listener, &clients, &shutdown)
            })
            .context("Failed to spawn live reload thread")?;

        Ok(Self {
            addr,
            output_root,
            clients,
            shutdown,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connected browsers.
    pub fn clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Stop accepting, join the acceptor and close every client.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
        for mut client in self.clients.lock().drain(..) {
            let _ = client.close(None);
            let _ = client.flush();
        }
    }

    fn message(&self, outputs: &[OutputFile]) -> String {
        let kind = if outputs.iter().all(OutputFile::is_stylesheet) {
            "css"
        } else {
            "reload"
        };
        let paths: Vec<String> = outputs
            .iter()
            .map(|output| url_path(&self.output_root, &output.path))
            .collect();
        serde_json::json!({ "kind": kind, "paths": paths }).to_string()
    }
}

impl Notifier for LiveReload {
    fn push_update(&self, outputs: &[OutputFile]) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        let message = self.message(outputs);

        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain_mut(|client| client.send(Message::text(message.clone())).is_ok());

        let dropped = before - clients.len();
        if dropped > 0 {
            bail!("dropped {dropped} disconnected client(s)");
        }
        Ok(())
    }
}

impl Drop for LiveReload {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &TcpListener, clients: &Clients, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handshake(stream).map(|ws| clients.lock().push(ws)) {
                    log!("reload"; "{peer}: {err:#}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                log!("reload"; "accept failed: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handshake(stream: TcpStream) -> Result<WebSocket<TcpStream>> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    tungstenite::accept(stream).map_err(|err| anyhow::anyhow!("handshake failed: {err}"))
}

/// `/out/assets/css/a.min.css` → `/assets/css/a.min.css`.
fn url_path(output_root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(output_root).unwrap_or(path);
    format!("/{}", to_slash(rel).trim_start_matches('/'))
}
