//! Link client with automatic reconnection
//!
//! Used by the capture stage and the supervisor relay. The client retries
//! after a fixed delay, indefinitely, until its handle is shut down. Frames
//! queued while disconnected are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{read_frame, write_frame};
use super::messages::{Envelope, MessageKind};
use super::LinkConfig;
use crate::error::TransportError;

/// Connection lifecycle and inbound traffic, in arrival order
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Message(Envelope),
    Disconnected,
}

/// Reconnecting client factory
pub struct LinkClient {
    addr: String,
    config: LinkConfig,
}

impl LinkClient {
    pub fn new(addr: impl Into<String>, config: LinkConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }

    /// Start the connection loop in the background
    pub fn spawn(self) -> LinkHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let (events_tx, events_rx) = mpsc::channel(self.config.outbound_queue.max(16));
        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dropped = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(connection_loop(
            self.addr,
            self.config,
            outbound_rx,
            events_tx,
            connected_tx,
            shutdown_rx,
            dropped.clone(),
        ));

        LinkHandle {
            outbound: outbound_tx,
            events: Some(events_rx),
            connected: connected_rx,
            shutdown: shutdown_tx,
            dropped,
            task: Some(task),
        }
    }
}

/// Owner side of a running client
pub struct LinkHandle {
    outbound: mpsc::Sender<Envelope>,
    events: Option<mpsc::Receiver<LinkEvent>>,
    connected: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    dropped: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl LinkHandle {
    /// Queue a frame. Returns false (and counts a drop) when disconnected or
    /// the outbound queue is full.
    pub fn send(&self, msg: Envelope) -> bool {
        if !self.is_connected() || self.outbound.try_send(msg).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Take the event receiver (owner will use this to handle traffic)
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.events.take()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until connected or the timeout elapses
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut rx = self.connected.clone();
        tokio::time::timeout(limit, rx.wait_for(|c| *c))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Frames dropped because the link was down or saturated
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop reconnecting and close the connection
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn connection_loop(
    addr: String,
    config: LinkConfig,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    events_tx: mpsc::Sender<LinkEvent>,
    connected_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    dropped: Arc<AtomicU64>,
) {
    let delay = config.reconnect_delay();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match connect(&addr, config.connect_timeout()).await {
            Ok(stream) => {
                info!("Connected to link hub at {}", addr);
                connected_tx.send_replace(true);
                let _ = events_tx.send(LinkEvent::Connected).await;

                let result = run_session(
                    stream,
                    &config,
                    &mut outbound_rx,
                    &events_tx,
                    &mut shutdown_rx,
                )
                .await;

                connected_tx.send_replace(false);
                match result {
                    Ok(()) => debug!("Link session to {} closed", addr),
                    Err(e) => warn!("Link to {} lost: {}", addr, e),
                }

                // In-flight frames are not replayed on the next connection
                let mut discarded = 0;
                while outbound_rx.try_recv().is_ok() {
                    discarded += 1;
                }
                if discarded > 0 {
                    dropped.fetch_add(discarded, Ordering::Relaxed);
                    debug!("Discarded {} queued frames after disconnect", discarded);
                }

                let _ = events_tx.send(LinkEvent::Disconnected).await;
            }
            Err(e) => {
                debug!("Link connect failed: {}", e);
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }
        info!("Reconnecting to {} in {:?}", addr, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    connected_tx.send_replace(false);
    info!("Link client to {} stopped", addr);
}

async fn connect(addr: &str, limit: Duration) -> Result<TcpStream, TransportError> {
    let attempt = tokio::time::timeout(limit, TcpStream::connect(addr)).await;
    let stream = match attempt {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(TransportError::Connect {
                addr: addr.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(TransportError::Connect {
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Run one connected session until the peer closes, a write fails, or shutdown
async fn run_session(
    stream: TcpStream,
    config: &LinkConfig,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    events_tx: &mpsc::Sender<LinkEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let (mut reader, mut writer) = stream.into_split();

    // Reads run in their own task since read_frame is not cancel-safe
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Result<Envelope, TransportError>>(64);
    let max_frame = config.max_frame_bytes;
    let reader_task = tokio::spawn(async move {
        loop {
            let result = read_frame(&mut reader, max_frame).await;
            let fatal = matches!(
                result,
                Err(TransportError::Closed | TransportError::Io(_) | TransportError::FrameTooLarge { .. })
            );
            if inbound_tx.send(result).await.is_err() || fatal {
                break;
            }
        }
    });

    let mut ping = config.ping_interval().map(tokio::time::interval);
    if let Some(ping) = ping.as_mut() {
        // The first tick fires immediately
        ping.tick().await;
    }

    let result = loop {
        tokio::select! {
            msg = outbound_rx.recv() => {
                match msg {
                    Some(msg) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            break Err(e);
                        }
                    }
                    // Every handle dropped
                    None => break Ok(()),
                }
            }
            inbound = inbound_rx.recv() => {
                match inbound {
                    Some(Ok(msg)) => match msg.kind {
                        MessageKind::Ping => {
                            if let Err(e) = write_frame(&mut writer, &Envelope::pong()).await {
                                break Err(e);
                            }
                        }
                        MessageKind::Pong => debug!("Received Pong"),
                        _ => {
                            if events_tx.send(LinkEvent::Message(msg)).await.is_err() {
                                break Ok(());
                            }
                        }
                    },
                    Some(Err(TransportError::Malformed(e))) => {
                        warn!("Dropping malformed frame: {}", e);
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(TransportError::Closed),
                }
            }
            _ = tick(&mut ping) => {
                if let Err(e) = write_frame(&mut writer, &Envelope::ping()).await {
                    break Err(e);
                }
            }
            _ = shutdown_rx.changed() => break Ok(()),
        }
    };

    reader_task.abort();
    result
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
