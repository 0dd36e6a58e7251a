//! The owning side of the receiver.
//!
//! [`StreamHost`] owns the registry, the dispatcher, the picture table and at
//! most one network worker. Whoever calls [`StreamHost::tick`] is the owning
//! thread: session creation and every consumer call happen there and nowhere
//! else.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use crate::config::Config;
use crate::decoder::DecoderFactory;
use crate::dispatch::{DispatchTask, Dispatcher};
use crate::protocol::{ProtocolError, ProtocolReader, ReaderStats};
use crate::resources::{PictureTable, ResourceConsumer};
use crate::router::MessageRouter;
use crate::session::{Lookup, RegistryError, StreamRegistry};

pub const NETWORK_THREAD_NAME: &str = "beach-reel-net";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("a connection is already attached")]
    AlreadyConnected,
    #[error("host already shut down")]
    ShutDown,
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to spawn network thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug)]
pub enum ConnectionEvent {
    /// The network thread has stopped reading. `error` is `None` only when
    /// the host asked it to stop before the stream failed.
    Closed {
        error: Option<ProtocolError>,
        stats: ReaderStats,
        shutdown_requested: bool,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub tasks: usize,
    pub sessions_created: usize,
    pub duplicate_creations: usize,
    pub failed_creations: usize,
    pub uploads: usize,
}

struct NetworkWorker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    socket: Option<TcpStream>,
}

impl NetworkWorker {
    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if let Some(socket) = &self.socket {
            // Fails a read that is blocked waiting for bytes.
            if let Err(err) = socket.shutdown(Shutdown::Both) {
                if err.kind() != io::ErrorKind::NotConnected {
                    tracing::debug!(target: "beach_reel::host", error = %err, "socket shutdown failed");
                }
            }
        }
        if self.handle.join().is_err() {
            tracing::error!(target: "beach_reel::host", "network thread panicked");
        }
    }
}

pub struct StreamHost {
    config: Config,
    registry: Arc<StreamRegistry>,
    dispatcher: Arc<Dispatcher<DispatchTask>>,
    pictures: PictureTable,
    network: Option<NetworkWorker>,
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
}

impl StreamHost {
    /// Builds the host and queues creation of every prewarmed stream. Those
    /// sessions exist after the first `tick`.
    pub fn new(config: Config, factory: Arc<dyn DecoderFactory>) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_high_water(config.queue_warn_depth));
        let registry = Arc::new(
            StreamRegistry::new(factory, dispatcher.clone()).with_max_resolution(config.max_resolution),
        );
        for prewarm in &config.prewarm {
            if matches!(registry.lookup_or_request(prewarm.stream), Lookup::Queued) {
                dispatcher.enqueue(DispatchTask::CreateSession {
                    stream: prewarm.stream,
                    resolution: prewarm.resolution,
                });
            }
        }
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            registry,
            dispatcher,
            pictures: PictureTable::new(),
            network: None,
            events_tx,
            events_rx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<DispatchTask>> {
        &self.dispatcher
    }

    pub fn pictures(&self) -> &PictureTable {
        &self.pictures
    }

    /// Connection lifecycle notifications from the network thread.
    pub fn events(&self) -> Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.network
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Connects to the configured server and starts reading.
    pub fn connect(&mut self) -> Result<(), HostError> {
        let addr = self.config.server.clone();
        tracing::info!(target: "beach_reel::host", %addr, "connecting");
        let stream = TcpStream::connect(&addr).map_err(|source| HostError::Connect { addr, source })?;
        self.attach(stream)
    }

    /// Starts reading from an already connected socket.
    pub fn attach(&mut self, stream: TcpStream) -> Result<(), HostError> {
        stream.set_nodelay(true).map_err(HostError::Socket)?;
        let control = stream.try_clone().map_err(HostError::Socket)?;
        self.spawn_reader(stream, Some(control))
    }

    /// Starts reading from any byte source. Without a socket to shut down,
    /// [`StreamHost::shutdown`] waits for `source` to reach EOF or fail.
    pub fn attach_reader<S>(&mut self, source: S) -> Result<(), HostError>
    where
        S: Read + Send + 'static,
    {
        self.spawn_reader(source, None)
    }

    fn spawn_reader<S>(&mut self, source: S, socket: Option<TcpStream>) -> Result<(), HostError>
    where
        S: Read + Send + 'static,
    {
        if self.registry.is_released() {
            return Err(HostError::ShutDown);
        }
        if self.is_connected() {
            return Err(HostError::AlreadyConnected);
        }
        if let Some(previous) = self.network.take() {
            previous.stop();
        }

        let reader = ProtocolReader::new(source).with_max_payload_len(self.config.max_payload_len);
        let router = MessageRouter::new(self.registry.clone(), self.dispatcher.clone());
        let stop = Arc::new(AtomicBool::new(false));
        let events = self.events_tx.clone();
        let handle = thread::Builder::new()
            .name(NETWORK_THREAD_NAME.into())
            .spawn({
                let stop = stop.clone();
                move || run_network(reader, router, stop, events)
            })
            .map_err(HostError::Spawn)?;

        self.network = Some(NetworkWorker {
            handle,
            stop,
            socket,
        });
        Ok(())
    }

    /// Runs every queued task on the calling thread, in order.
    pub fn tick(&mut self, consumer: &mut dyn ResourceConsumer) -> TickReport {
        let mut report = TickReport::default();
        let registry = &self.registry;
        let pictures = &mut self.pictures;
        let tasks = self.dispatcher.drain(|task| match task {
            DispatchTask::CreateSession { stream, resolution } => {
                match registry.complete_creation(stream, resolution) {
                    Ok(()) => {
                        pictures.ensure(consumer, stream, resolution);
                        report.sessions_created += 1;
                    }
                    Err(RegistryError::DuplicateSessionCreation(_)) => {
                        tracing::debug!(target: "beach_reel::host", stream, "duplicate session creation ignored");
                        report.duplicate_creations += 1;
                    }
                    Err(RegistryError::Released) => {}
                    Err(err) => {
                        tracing::warn!(target: "beach_reel::host", stream, error = %err, "session creation failed");
                        report.failed_creations += 1;
                    }
                }
            }
            DispatchTask::UploadPlanes {
                stream,
                resolution,
                luma,
                chroma,
            } => {
                pictures.upload(consumer, stream, resolution, &luma, &chroma);
                report.uploads += 1;
            }
        });
        report.tasks = tasks;
        report
    }

    /// Stops the network thread, waits for it, then releases every session.
    /// Returns how many sessions were released; later calls return 0.
    pub fn shutdown(&mut self) -> usize {
        if let Some(worker) = self.network.take() {
            worker.stop();
        }
        let released = self.registry.release_all();
        let discarded = self.dispatcher.take().len();
        self.pictures.clear();
        if released > 0 || discarded > 0 {
            tracing::info!(target: "beach_reel::host", released, discarded, "stream host shut down");
        }
        released
    }
}

impl Drop for StreamHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_network<S: Read>(
    mut reader: ProtocolReader<S>,
    router: MessageRouter,
    stop: Arc<AtomicBool>,
    events: Sender<ConnectionEvent>,
) {
    tracing::debug!(target: "beach_reel::host", "network thread started");
    let error = loop {
        if stop.load(Ordering::Acquire) {
            break None;
        }
        match reader.read_message() {
            Ok(message) => {
                router.route(message);
            }
            Err(err) => break Some(err),
        }
    };

    let shutdown_requested = stop.load(Ordering::Acquire);
    let stats = reader.stats();
    match &error {
        Some(err) if !shutdown_requested => tracing::warn!(
            target: "beach_reel::host",
            reason = err.reason(),
            error = %err,
            messages = stats.messages,
            "connection ended"
        ),
        _ => tracing::debug!(target: "beach_reel::host", messages = stats.messages, "network thread stopped"),
    }
    let _ = events.send(ConnectionEvent::Closed {
        error: if shutdown_requested { None } else { error },
        stats,
        shutdown_requested,
    });
}
