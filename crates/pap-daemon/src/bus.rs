//! Unix-socket endpoint for the PDP topic.
//!
//! PDPs connect to one socket; each line is one JSON envelope. Outbound
//! messages fan out to every connection; a connection that cannot keep up
//! has the line dropped rather than stalling the rest of the fleet.
//! Inbound lines are handed, still on the reader task, to the message
//! dispatcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pap_core::comm::{BusError, BusSink, MessageTypeDispatcher};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-connection outbound buffer, in lines.
const CONNECTION_BUFFER: usize = 256;

struct Registry {
    connections: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn register(&self, sender: mpsc::Sender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .expect("lock poisoned")
            .insert(id, sender);
        id
    }

    fn unregister(&self, id: u64) {
        self.connections.lock().expect("lock poisoned").remove(&id);
    }

    fn fanout(&self, line: &str) {
        let connections: Vec<(u64, mpsc::Sender<String>)> = self
            .connections
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();

        for (id, sender) in connections {
            match sender.try_send(line.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(connection = id, "slow PDP connection; dropping line");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.unregister(id);
                }
            }
        }
    }
}

/// [`BusSink`] handle writing through the bus server.
#[derive(Clone)]
pub struct BusSinkHandle {
    registry: Arc<Registry>,
}

impl BusSink for BusSinkHandle {
    fn send(&self, _topic: &str, payload: &str) -> Result<(), BusError> {
        // topic membership is the socket itself; no subscribers means the
        // message falls on the floor, as on a pub/sub bus
        self.registry.fanout(payload);
        Ok(())
    }
}

/// The PDP topic endpoint.
pub struct BusServer {
    registry: Arc<Registry>,
    accept_task: JoinHandle<()>,
    socket_path: PathBuf,
}

impl BusServer {
    /// Bind the socket and start accepting PDP connections.
    ///
    /// Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be bound.
    pub fn bind(
        socket_path: &Path,
        dispatcher: Arc<MessageTypeDispatcher>,
    ) -> std::io::Result<Self> {
        // a stale socket from an unclean shutdown blocks the bind
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(socket = %socket_path.display(), "PDP bus endpoint listening");

        let registry = Arc::new(Registry {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });

        let accept_task = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let registry = Arc::clone(&registry);
                            let dispatcher = Arc::clone(&dispatcher);
                            tokio::spawn(serve_connection(stream, registry, dispatcher));
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    }
                }
            })
        };

        Ok(Self {
            registry,
            accept_task,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// A [`BusSink`] writing to every connected PDP.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn BusSink> {
        Arc::new(BusSinkHandle {
            registry: Arc::clone(&self.registry),
        })
    }

    /// Number of connected PDPs.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.connections.lock().expect("lock poisoned").len()
    }

    /// Stop accepting, drop all connections and remove the socket file.
    pub fn stop(&self) {
        self.accept_task.abort();
        self.registry
            .connections
            .lock()
            .expect("lock poisoned")
            .clear();
        if let Err(err) = std::fs::remove_file(&self.socket_path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = %err, "failed to remove bus socket");
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    registry: Arc<Registry>,
    dispatcher: Arc<MessageTypeDispatcher>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (sender, mut receiver) = mpsc::channel::<String>(CONNECTION_BUFFER);
    let id = registry.register(sender);
    debug!(connection = id, "PDP connected");

    let writer = tokio::spawn(async move {
        while let Some(line) = receiver.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatcher.on_receive(&line),
            Ok(None) => break,
            Err(err) => {
                warn!(connection = id, error = %err, "read failed");
                break;
            }
        }
    }

    debug!(connection = id, "PDP disconnected");
    registry.unregister(id);
    writer.abort();
}
