//! Per-connection session handling.
//!
//! A session decodes packets from its connection, dispatches them against
//! the shared broker state and writes replies. It also drains its outbound
//! queue, so it is the only writer of its socket.
//!
//! State transitions:
//!
//! | from | packet | to |
//! |------|--------|----|
//! | AwaitingFirstPacket | CONNECT | Established |
//! | Established | CONNECT | Established |
//! | any open state | DISCONNECT | Closed |
//! | any open state | other | unchanged |
//! | any | decode error / EOF | Closed |
//!
//! SUBSCRIBE and PUBLISH are accepted before CONNECT. Such a session gets
//! its SUBACK and can publish, but it is not in the client registry, so
//! nothing is delivered to it until it connects.

use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::broker::BrokerState;
use crate::error::{Error, Result};
use crate::protocol::{self, Packet};
use crate::registry::Outbox;
use crate::types::{Message, SessionId};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingFirstPacket,
    Established,
    Closed,
}

impl SessionState {
    /// Next state after receiving `packet`.
    pub fn on_packet(self, packet: &Packet) -> SessionState {
        match (self, packet) {
            (SessionState::Closed, _) => SessionState::Closed,
            (_, Packet::Connect(_)) => SessionState::Established,
            (_, Packet::Disconnect) => SessionState::Closed,
            (state, _) => state,
        }
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

pub(crate) struct Session {
    id: SessionId,
    state: SessionState,
    outbox: Outbox,
    broker: Arc<BrokerState>,
    cleaned_up: bool,
}

impl Session {
    pub(crate) fn new(id: SessionId, outbox: Outbox, broker: Arc<BrokerState>) -> Self {
        Self {
            id,
            state: SessionState::AwaitingFirstPacket,
            outbox,
            broker,
            cleaned_up: false,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Dispatch one decoded packet, returning the reply to send, if any.
    pub(crate) fn handle_packet(&mut self, packet: Packet) -> Option<Packet> {
        if self.state.is_closed() {
            return None;
        }
        self.state = self.state.on_packet(&packet);

        match packet {
            Packet::Connect(_) => {
                self.broker.connect(&self.id, self.outbox.clone());
                Some(protocol::create_connack())
            }
            Packet::Subscribe(subscribe) => {
                self.broker.subscribe(&self.id, &subscribe.filter);
                Some(protocol::create_suback(subscribe.pkid))
            }
            Packet::Publish(publish) => {
                let msg = Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                self.broker.publish(&self.id, msg);
                None
            }
            Packet::PingReq => Some(protocol::create_pingresp()),
            Packet::Disconnect => None,
            other => {
                trace!("Ignoring {} from {}", other.name(), self.id);
                None
            }
        }
    }

    /// Move to Closed and run cleanup once.
    pub(crate) fn close(&mut self) {
        self.state = SessionState::Closed;
        if !self.cleaned_up {
            self.cleaned_up = true;
            self.broker.cleanup(&self.id);
        }
    }

    async fn drive<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        rx: &mut mpsc::Receiver<Message>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut read_buf = BytesMut::with_capacity(256);

        loop {
            tokio::select! {
                packet = protocol::read_packet(reader, &mut read_buf) => {
                    let packet = match packet {
                        Ok(packet) => packet,
                        Err(Error::ConnectionClosed) => return Ok(()),
                        Err(e) => return Err(e),
                    };
                    trace!("Received {} from {}", packet.name(), self.id);

                    if let Some(reply) = self.handle_packet(packet) {
                        protocol::write_packet(writer, &reply).await?;
                    }
                    if self.state().is_closed() {
                        return Ok(());
                    }
                }

                Some(msg) = rx.recv() => {
                    let packet = protocol::create_publish(&msg.topic, msg.payload);
                    match packet.check_size() {
                        Ok(()) => protocol::write_packet(writer, &packet).await?,
                        Err(e) => warn!("Dropping message on {} for {}: {}", msg.topic, self.id, e),
                    }
                }
            }
        }
    }
}

/// Run a session over `stream` until it closes, then clean it up.
pub(crate) async fn run<S>(broker: Arc<BrokerState>, stream: S, id: SessionId) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Message>(broker.queue_capacity);

    let mut session = Session::new(id, tx, broker);
    let result = session.drive(&mut reader, &mut writer, &mut rx).await;
    session.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn new_session(broker: &Arc<BrokerState>, id: &str) -> (Session, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (Session::new(SessionId::from(id), tx, Arc::clone(broker)), rx)
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        let connect = Packet::Connect(Bytes::new());
        let publish = protocol::create_publish("t", "x");

        assert_eq!(AwaitingFirstPacket.on_packet(&connect), Established);
        assert_eq!(AwaitingFirstPacket.on_packet(&publish), AwaitingFirstPacket);
        assert_eq!(AwaitingFirstPacket.on_packet(&Packet::Disconnect), Closed);
        assert_eq!(Established.on_packet(&connect), Established);
        assert_eq!(Established.on_packet(&Packet::PingReq), Established);
        assert_eq!(Established.on_packet(&Packet::Disconnect), Closed);
        assert_eq!(Closed.on_packet(&connect), Closed);
    }

    #[test]
    fn test_connect_registers_and_acks() {
        let broker = Arc::new(BrokerState::for_tests(8));
        let (mut session, _rx) = new_session(&broker, "a");

        let reply = session.handle_packet(Packet::Connect(Bytes::from_static(b"garbage")));
        assert_eq!(reply, Some(protocol::create_connack()));
        assert_eq!(session.state(), SessionState::Established);
        assert!(broker.is_registered(&SessionId::from("a")));
    }

    #[test]
    fn test_subscribe_before_connect_is_acked_but_not_deliverable() {
        let broker = Arc::new(BrokerState::for_tests(8));
        let (mut session, mut rx) = new_session(&broker, "early");

        let reply = session.handle_packet(protocol::create_subscribe(3, "t"));
        assert_eq!(reply, Some(protocol::create_suback(3)));
        assert_eq!(session.state(), SessionState::AwaitingFirstPacket);
        assert_eq!(broker.subscribers("t"), vec![SessionId::from("early")]);

        let delivery = broker.route(&Message::new("t", "x"));
        assert_eq!(delivery.skipped, 1);
        assert!(rx.try_recv().is_err());

        // Once connected, the existing subscription starts receiving.
        session.handle_packet(Packet::Connect(Bytes::new()));
        let delivery = broker.route(&Message::new("t", "y"));
        assert_eq!(delivery.delivered, 1);
        assert_eq!(rx.try_recv().unwrap().payload.as_ref(), b"y");
    }

    #[test]
    fn test_publish_counts_and_routes() {
        let broker = Arc::new(BrokerState::for_tests(8));
        let (mut sub, mut sub_rx) = new_session(&broker, "sub");
        let (mut publisher, _pub_rx) = new_session(&broker, "pub");

        sub.handle_packet(Packet::Connect(Bytes::new()));
        sub.handle_packet(protocol::create_subscribe(1, "sensor/data"));

        let reply = publisher.handle_packet(protocol::create_publish("sensor/data", "{\"v\":1}"));
        assert_eq!(reply, None);
        assert_eq!(broker.message_count(), 1);

        let msg = sub_rx.try_recv().unwrap();
        assert_eq!(msg.topic, "sensor/data");
        assert_eq!(msg.payload.as_ref(), b"{\"v\":1}");
    }

    #[test]
    fn test_pingreq_and_ignored_packets() {
        let broker = Arc::new(BrokerState::for_tests(8));
        let (mut session, _rx) = new_session(&broker, "a");

        assert_eq!(session.handle_packet(Packet::PingReq), Some(Packet::PingResp));
        let unsupported = Packet::Unsupported {
            packet_type: 10,
            flags: 2,
            body: Bytes::from_static(&[0, 1]),
        };
        assert_eq!(session.handle_packet(unsupported), None);
        assert_eq!(session.handle_packet(Packet::PingResp), None);
        assert_eq!(session.state(), SessionState::AwaitingFirstPacket);
    }

    #[test]
    fn test_close_is_idempotent() {
        let broker = Arc::new(BrokerState::for_tests(8));
        let (mut session, _rx) = new_session(&broker, "a");
        session.handle_packet(Packet::Connect(Bytes::new()));
        session.handle_packet(protocol::create_subscribe(1, "a/b"));

        session.close();
        session.close();
        assert!(!broker.is_registered(&SessionId::from("a")));
        assert!(broker.subscribers("a/b").is_empty());
        assert_eq!(session.handle_packet(Packet::PingReq), None);
    }

    #[tokio::test]
    async fn test_run_over_duplex() {
        let broker = Arc::new(BrokerState::for_tests(8));
        let (mut client, server) = tokio::io::duplex(1024);
        let handle = tokio::spawn(run(Arc::clone(&broker), server, SessionId::from("duplex")));

        // CONNECT with an empty body, SUBSCRIBE id 7, PINGREQ.
        client.write_all(&[0x10, 0x00]).await.unwrap();
        client
            .write_all(&protocol::create_subscribe(7, "a/b").to_bytes().unwrap())
            .await
            .unwrap();
        client.write_all(&[0xC0, 0x00]).await.unwrap();

        let mut reply = [0u8; 11];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            [0x20, 0x02, 0x00, 0x00, 0x90, 0x03, 0x00, 0x07, 0x00, 0xD0, 0x00]
        );

        // A routed message comes out as a PUBLISH on the same stream.
        let delivery = broker.route(&Message::new("a/b", "hi"));
        assert_eq!(delivery.delivered, 1);
        let mut publish = [0u8; 9];
        client.read_exact(&mut publish).await.unwrap();
        assert_eq!(publish, [0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']);

        drop(client);
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!broker.is_registered(&SessionId::from("duplex")));
        assert!(broker.subscribers("a/b").is_empty());
    }

    #[tokio::test]
    async fn test_run_closes_on_out_of_range_length() {
        let broker = Arc::new(BrokerState::for_tests(8));
        let (mut client, server) = tokio::io::duplex(1024);
        let handle = tokio::spawn(run(Arc::clone(&broker), server, SessionId::from("bad")));

        client.write_all(&[0x10, 0x00]).await.unwrap();
        client
            .write_all(&protocol::create_subscribe(1, "a/b").to_bytes().unwrap())
            .await
            .unwrap();
        // PUBLISH declaring 130 bytes of body.
        client.write_all(&[0x30, 0x82, 0x01]).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::RemainingLengthOutOfRange(0x82))));
        assert!(!broker.is_registered(&SessionId::from("bad")));
        assert!(broker.subscribers("a/b").is_empty());
        assert_eq!(broker.message_count(), 0);
    }

    #[tokio::test]
    async fn test_run_disconnect_packet_ends_session() {
        let broker = Arc::new(BrokerState::for_tests(8));
        let (mut client, server) = tokio::io::duplex(1024);
        let handle = tokio::spawn(run(Arc::clone(&broker), server, SessionId::from("bye")));

        client.write_all(&[0x10, 0x00, 0xE0, 0x00]).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!broker.is_registered(&SessionId::from("bye")));
    }
}
