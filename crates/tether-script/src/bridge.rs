//! Script delivery over a local socket.
//!
//! The listening side runs inside a payload that owns its own engine. Each
//! connection carries exactly one script body: connect, write everything,
//! close. Nothing is ever sent back.

use std::{
    io::{Read as _, Write as _},
    net::Shutdown,
    os::unix::{
        fs::FileTypeExt as _,
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{BridgeError, ScriptEngine};

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tether.sock";

/// Default interval between two scheduler ticks of the payload engine.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(16);

/// Default limit on how long a peer may stay silent while sending a body.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of a [`DeliveryChannel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Socket path.
    pub path: PathBuf,

    /// Interval between two scheduler ticks.
    pub tick_interval: Duration,

    /// Read timeout of an accepted connection. Zero disables it.
    pub read_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SOCKET_PATH),
            tick_interval: DEFAULT_TICK_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Listening end of the delivery socket.
pub struct DeliveryChannel {
    path: PathBuf,
    engine: Arc<ScriptEngine>,
    running: Arc<AtomicBool>,
    connection: Arc<Mutex<Option<UnixStream>>>,
    accept: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl DeliveryChannel {
    /// Starts the engine, binds the socket and spawns the accept loop and
    /// the ticker.
    pub fn start(config: ChannelConfig, engine: ScriptEngine) -> Result<Self, BridgeError> {
        let engine = Arc::new(engine);
        engine.init()?;

        remove_stale_socket(&config.path)?;
        let listener =
            UnixListener::bind(&config.path).map_err(|source| socket_error(&config.path, source))?;

        let running = Arc::new(AtomicBool::new(true));
        let connection = Arc::new(Mutex::new(None));

        let accept = std::thread::Builder::new()
            .name(String::from("tether-accept"))
            .spawn({
                let accept = AcceptLoop {
                    engine: engine.clone(),
                    running: running.clone(),
                    connection: connection.clone(),
                    read_timeout: Some(config.read_timeout).filter(|timeout| !timeout.is_zero()),
                };

                move || accept.run(listener)
            })
            .map_err(|source| socket_error(&config.path, source))?;

        let ticker = std::thread::Builder::new()
            .name(String::from("tether-ticker"))
            .spawn({
                let engine = engine.clone();
                let running = running.clone();
                let interval = config.tick_interval;
                move || {
                    while running.load(Ordering::SeqCst) {
                        engine.tick();
                        std::thread::sleep(interval);
                    }
                }
            })
            .map_err(|source| socket_error(&config.path, source))?;

        tracing::info!(path = %config.path.display(), "delivery channel listening");

        Ok(Self {
            path: config.path,
            engine,
            running,
            connection,
            accept: Some(accept),
            ticker: Some(ticker),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the payload engine.
    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    /// Checks whether the channel accepts connections.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the threads, removes the socket and tears down the engine.
    ///
    /// A connection still being read is closed and a running script or task
    /// is asked to stop; neither is waited for to complete.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.interrupt();

        // Unblock the accept loop.
        let _ = UnixStream::connect(&self.path);
        std::thread::yield_now();

        for handle in [self.accept.take(), self.ticker.take()].into_iter().flatten() {
            // A script started after the first request clears the stop flag,
            // so keep asking until the thread is out.
            while !handle.is_finished() {
                self.interrupt();
                std::thread::sleep(Duration::from_millis(5));
            }

            if handle.join().is_err() {
                tracing::error!("delivery channel thread panicked");
            }
        }

        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to remove socket");
        }

        self.engine.shutdown();
        tracing::info!(path = %self.path.display(), "delivery channel stopped");
    }
}

impl DeliveryChannel {
    fn interrupt(&self) {
        self.engine.request_stop();

        if let Some(stream) = self.connection.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for DeliveryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct AcceptLoop {
    engine: Arc<ScriptEngine>,
    running: Arc<AtomicBool>,
    connection: Arc<Mutex<Option<UnixStream>>>,
    read_timeout: Option<Duration>,
}

impl AcceptLoop {
    fn run(self, listener: UnixListener) {
        let counter = AtomicU64::new(0);

        for stream in listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            };

            let body = match self.read_body(stream) {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(%err, "failed to read script body");
                    continue;
                }
            };

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let body = String::from_utf8_lossy(&body);
            if body.trim().is_empty() {
                continue;
            }

            let name = format!("delivered-{}", counter.fetch_add(1, Ordering::Relaxed));
            tracing::debug!(%name, len = body.len(), "script received");

            // The observer has already seen the error.
            if let Err(err) = self.engine.execute(&body, &name) {
                tracing::debug!(%name, %err, "delivered script failed");
            }
        }
    }

    /// Reads one body while the stream is reachable from `shutdown`.
    fn read_body(&self, mut stream: UnixStream) -> std::io::Result<Vec<u8>> {
        stream.set_read_timeout(self.read_timeout)?;
        *self.connection.lock() = Some(stream.try_clone()?);

        // Closed in between by a shutdown that did not see the stream yet.
        if !self.running.load(Ordering::SeqCst) {
            self.connection.lock().take();
            return Ok(Vec::new());
        }

        let mut body = Vec::new();
        let result = stream.read_to_end(&mut body);
        self.connection.lock().take();

        result.map(|_| body)
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), BridgeError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(socket_error(path, err)),
    };

    if !metadata.file_type().is_socket() {
        return Err(socket_error(
            path,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "path exists and is not a socket",
            ),
        ));
    }

    tracing::debug!(path = %path.display(), "removing stale socket");
    std::fs::remove_file(path).map_err(|source| socket_error(path, source))
}

fn socket_error(path: &Path, source: std::io::Error) -> BridgeError {
    BridgeError::Socket {
        path: path.to_owned(),
        source,
    }
}

/// Sends one script body to a listening channel.
pub fn deliver(path: impl AsRef<Path>, body: &str) -> Result<(), BridgeError> {
    let path = path.as_ref();

    let mut stream = UnixStream::connect(path).map_err(|source| socket_error(path, source))?;
    stream
        .write_all(body.as_bytes())
        .and_then(|()| stream.shutdown(Shutdown::Write))
        .map_err(|source| socket_error(path, source))
}
