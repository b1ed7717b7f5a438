//! Minimal QoS 0 client for the supported MQTT subset.
//!
//! Used by the command-line tools and the integration tests. Every packet the
//! client sends fits the single-byte remaining length, so topics and payloads
//! are limited accordingly.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{self, Packet, CONNECT_ACCEPTED};
use crate::types::Message;

/// Default keep alive advertised in CONNECT, in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;

/// Default time allowed for TCP connect plus CONNACK.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address (host:port).
    pub addr: String,
    /// Client ID sent in CONNECT.
    pub client_id: String,
    /// Keep alive interval in seconds.
    pub keep_alive: u16,
    /// Time allowed for the TCP connect and the CONNACK.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Create a new client config.
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: client_id.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// QoS 0 client.
pub struct Client {
    reader: Mutex<ReadHalf<TcpStream>>,
    writer: Mutex<WriteHalf<TcpStream>>,
    read_buf: Mutex<BytesMut>,
    /// Publishes that arrived while waiting for a SUBACK.
    pending: Mutex<VecDeque<Message>>,
    client_id: String,
    next_pkid: AtomicU16,
}

impl Client {
    /// Connect to a broker and wait for its CONNACK.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        debug!("Connecting to {} as {}", config.addr, config.client_id);

        let timeout = config.connect_timeout;
        match tokio::time::timeout(timeout, Self::handshake(config)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("no CONNACK within {:?}", timeout))),
        }
    }

    async fn handshake(config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(&config.addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let connect = protocol::create_connect(&config.client_id, config.keep_alive);
        protocol::write_packet(&mut writer, &connect).await?;

        let mut read_buf = BytesMut::with_capacity(256);
        match protocol::read_packet(&mut reader, &mut read_buf).await? {
            Packet::ConnAck(connack) => {
                if connack.code != CONNECT_ACCEPTED {
                    return Err(Error::ConnectionRefused(connack.code));
                }
                debug!("Connected, session_present={}", connack.session_present);
            }
            other => {
                return Err(Error::UnexpectedPacket {
                    expected: "CONNACK".to_string(),
                    got: other.name().to_string(),
                });
            }
        }

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            read_buf: Mutex::new(read_buf),
            pending: Mutex::new(VecDeque::new()),
            client_id: config.client_id,
            next_pkid: AtomicU16::new(1),
        })
    }

    /// Get the client ID.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publish a message (QoS 0, fire and forget).
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        let packet = protocol::create_publish(topic, payload);
        trace!("Publishing to {} ({} bytes)", topic, packet.size());
        self.send(&packet).await
    }

    /// Subscribe to a single topic and wait for the SUBACK.
    ///
    /// Returns the granted return code.
    pub async fn subscribe(&self, topic: &str) -> Result<u8> {
        let pkid = self.next_pkid();
        debug!("Subscribing to {} with pkid={}", topic, pkid);
        self.send(&protocol::create_subscribe(pkid, topic)).await?;

        loop {
            match self.read().await? {
                Packet::SubAck(suback) if suback.pkid == pkid => {
                    debug!("Received SUBACK for pkid={}: {:#04x}", pkid, suback.return_code);
                    return Ok(suback.return_code);
                }
                Packet::Publish(publish) => {
                    self.pending.lock().await.push_back(Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Packet::PingResp => trace!("Received PINGRESP"),
                other => {
                    return Err(Error::UnexpectedPacket {
                        expected: "SUBACK".to_string(),
                        got: other.name().to_string(),
                    });
                }
            }
        }
    }

    /// Receive the next message.
    pub async fn recv(&self) -> Result<Message> {
        if let Some(msg) = self.pending.lock().await.pop_front() {
            return Ok(msg);
        }

        loop {
            match self.read().await? {
                Packet::Publish(publish) => {
                    trace!("Received message on {}", publish.topic);
                    return Ok(Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Packet::PingResp => trace!("Received PINGRESP"),
                Packet::Disconnect => return Err(Error::ConnectionClosed),
                other => trace!("Ignoring {}", other.name()),
            }
        }
    }

    /// Receive a message with timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Send a ping request.
    ///
    /// The PINGRESP is consumed by the next [`Client::recv`].
    pub async fn ping(&self) -> Result<()> {
        trace!("Sending PINGREQ");
        self.send(&protocol::create_pingreq()).await
    }

    /// Send a ping request and wait for its PINGRESP.
    ///
    /// Publishes that arrive first are kept for [`Client::recv`].
    pub async fn ping_wait(&self) -> Result<()> {
        self.ping().await?;
        loop {
            match self.read().await? {
                Packet::PingResp => return Ok(()),
                Packet::Publish(publish) => {
                    self.pending.lock().await.push_back(Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                other => trace!("Ignoring {}", other.name()),
            }
        }
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) -> Result<()> {
        debug!("Disconnecting");
        self.send(&protocol::create_disconnect()).await
    }

    fn next_pkid(&self) -> u16 {
        // Packet identifiers are non-zero.
        loop {
            let pkid = self.next_pkid.fetch_add(1, Ordering::SeqCst);
            if pkid != 0 {
                return pkid;
            }
        }
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        protocol::write_packet(&mut *writer, packet).await
    }

    async fn read(&self) -> Result<Packet> {
        let mut reader = self.reader.lock().await;
        let mut read_buf = self.read_buf.lock().await;
        protocol::read_packet(&mut *reader, &mut *read_buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_client_config() {
        let config = ClientConfig::new("127.0.0.1:1883", "test-client")
            .with_keep_alive(30)
            .with_connect_timeout(Duration::from_millis(250));

        assert_eq!(config.addr, "127.0.0.1:1883");
        assert_eq!(config.client_id, "test-client");
        assert_eq!(config.keep_alive, 30);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));

        let config = ClientConfig::new("h:1", "c");
        assert_eq!(config.keep_alive, DEFAULT_KEEP_ALIVE);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_connect_refused_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            // CONNACK, not authorized.
            stream.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
        });

        let err = Client::connect(ClientConfig::new(addr, "c")).await.err().unwrap();
        assert!(matches!(err, Error::ConnectionRefused(5)));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_connack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = ClientConfig::new(addr, "c").with_connect_timeout(Duration::from_millis(200));
        let err = Client::connect(config).await.err().unwrap();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_subscribe_buffers_early_publish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let _ = stream.read(&mut buf).await.unwrap();
            // A PUBLISH sneaks in ahead of the SUBACK for pkid 1.
            stream
                .write_all(&[0x30, 0x06, 0x00, 0x01, b't', b'a', b'b', b'c'])
                .await
                .unwrap();
            stream.write_all(&[0x90, 0x03, 0x00, 0x01, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let client = Client::connect(ClientConfig::new(addr, "c")).await.unwrap();
        assert_eq!(client.subscribe("t").await.unwrap(), 0);

        let msg = client.recv_timeout(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(msg.topic, "t");
        assert_eq!(msg.payload.as_ref(), b"abc");
    }
}
