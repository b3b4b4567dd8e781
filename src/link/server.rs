//! Link hub
//!
//! Accepts subscribers over TCP:
//! - Each connection gets a bounded outbound queue in the subscriber set
//! - `publish` fans a message out to every connection
//! - Inbound frames are handed to the owner as [`HubEvent`]s
//! - Ping frames are answered here and never surface

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::codec::{read_frame, write_frame};
use super::messages::{Envelope, MessageKind};
use super::subscribers::{SubscriberId, SubscriberSet};
use super::{LinkConfig, PROTOCOL_VERSION};
use crate::error::TransportError;

/// Something a subscriber did
#[derive(Debug, Clone)]
pub enum HubEvent {
    Connected(SubscriberId),
    Message(SubscriberId, Envelope),
    Disconnected(SubscriberId),
}

/// Hub side of a StreamLink
pub struct LinkHub {
    local_addr: SocketAddr,
    subscribers: Arc<SubscriberSet<Envelope>>,
    shutdown_tx: watch::Sender<bool>,
}

impl LinkHub {
    /// Bind the hub and start accepting. Returns the hub plus its event stream.
    pub async fn bind(
        addr: &str,
        config: &LinkConfig,
    ) -> Result<(Self, mpsc::Receiver<HubEvent>), TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("Link hub listening on {}", local_addr);

        let subscribers = Arc::new(SubscriberSet::new(config.outbound_queue));
        let (events_tx, events_rx) = mpsc::channel(config.outbound_queue.max(16));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(
            listener,
            subscribers.clone(),
            events_tx,
            shutdown_rx,
            config.max_frame_bytes,
        ));

        Ok((
            Self {
                local_addr,
                subscribers,
                shutdown_tx,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Broadcast to all subscribers. Returns the number reached.
    pub fn publish(&self, msg: &Envelope) -> usize {
        self.subscribers.publish(msg)
    }

    /// Send to a single subscriber
    pub fn send_to(&self, id: SubscriberId, msg: Envelope) -> bool {
        self.subscribers.send_to(id, msg)
    }

    /// Close one subscriber's connection
    pub fn disconnect(&self, id: SubscriberId) {
        self.subscribers.unsubscribe(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.subscribers.clear();
    }
}

impl Drop for LinkHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    subscribers: Arc<SubscriberSet<Envelope>>,
    events_tx: mpsc::Sender<HubEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame: usize,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            subscribers.clone(),
                            events_tx.clone(),
                            max_frame,
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("Link hub shutting down");
                break;
            }
        }
    }
}

/// Drive one subscriber: a reader task plus the outbound writer loop
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    subscribers: Arc<SubscriberSet<Envelope>>,
    events_tx: mpsc::Sender<HubEvent>,
    max_frame: usize,
) {
    let (id, mut outbound) = subscribers.subscribe();
    info!("Subscriber {} connected from {}", id, peer);
    let _ = events_tx.send(HubEvent::Connected(id)).await;

    let (reader, mut writer) = stream.into_split();
    let reader_task = tokio::spawn(read_loop(
        id,
        reader,
        subscribers.clone(),
        events_tx.clone(),
        max_frame,
    ));

    // Ends when the subscriber is removed from the set or the socket fails
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!("Failed to send to subscriber {}: {}", id, e);
            break;
        }
    }

    reader_task.abort();
    subscribers.unsubscribe(id);
    let _ = events_tx.send(HubEvent::Disconnected(id)).await;
    info!("Subscriber {} disconnected", id);
}

async fn read_loop(
    id: SubscriberId,
    mut reader: OwnedReadHalf,
    subscribers: Arc<SubscriberSet<Envelope>>,
    events_tx: mpsc::Sender<HubEvent>,
    max_frame: usize,
) {
    loop {
        match read_frame(&mut reader, max_frame).await {
            Ok(msg) => {
                if msg.version != PROTOCOL_VERSION {
                    warn!("Subscriber {} sent protocol version {}", id, msg.version);
                }
                match msg.kind {
                    MessageKind::Ping => {
                        subscribers.send_to(id, Envelope::pong());
                    }
                    MessageKind::Pong => {}
                    _ => {
                        if events_tx.send(HubEvent::Message(id, msg)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(TransportError::Malformed(e)) => {
                warn!("Subscriber {} sent malformed frame: {}", id, e);
            }
            Err(e) => {
                debug!("Subscriber {} read ended: {}", id, e);
                break;
            }
        }
    }
    // Closing the outbound queue ends the writer loop
    subscribers.unsubscribe(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::messages::ControlCommand;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn hub() -> (LinkHub, mpsc::Receiver<HubEvent>) {
        LinkHub::bind("127.0.0.1:0", &LinkConfig::default())
            .await
            .unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<HubEvent>) -> HubEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_publish_reaches_connected_subscriber() {
        let (hub, mut events) = hub().await;
        let mut stream = TcpStream::connect(hub.local_addr()).await.unwrap();

        assert!(matches!(next_event(&mut events).await, HubEvent::Connected(_)));
        assert_eq!(hub.publish(&Envelope::control(ControlCommand::StartCapture)), 1);

        let env = timeout(Duration::from_secs(5), read_frame(&mut stream, 1 << 20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ControlCommand::from_payload(&env.payload),
            Some(ControlCommand::StartCapture)
        );
    }

    #[tokio::test]
    async fn test_inbound_messages_and_ping() {
        let (hub, mut events) = hub().await;
        let mut stream = TcpStream::connect(hub.local_addr()).await.unwrap();
        let id = match next_event(&mut events).await {
            HubEvent::Connected(id) => id,
            other => panic!("unexpected: {:?}", other),
        };

        write_frame(&mut stream, &Envelope::ping()).await.unwrap();
        let pong = timeout(Duration::from_secs(5), read_frame(&mut stream, 1 << 20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong.kind, MessageKind::Pong);

        write_frame(&mut stream, &Envelope::control(ControlCommand::StopCapture))
            .await
            .unwrap();
        match next_event(&mut events).await {
            HubEvent::Message(from, env) => {
                assert_eq!(from, id);
                assert_eq!(env.kind, MessageKind::Control);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_removes_subscriber() {
        let (hub, mut events) = hub().await;
        let stream = TcpStream::connect(hub.local_addr()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, HubEvent::Connected(_)));
        assert_eq!(hub.subscriber_count(), 1);

        drop(stream);
        assert!(matches!(next_event(&mut events).await, HubEvent::Disconnected(_)));
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(&Envelope::ping()), 0);
    }
}
