//! Integration tests for the client lifecycle.
//!
//! The far end is a bare `std::net::TcpListener` so each test controls
//! exactly when the server side goes away.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use framed_messaging::{
    Client, ClientConfig, ClientHandle, ClientHandler, Error, Header, Message, MessageKind,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Ping,
    Pong,
    Bye,
}

impl MessageKind for Kind {
    fn to_wire(self) -> u32 {
        match self {
            Kind::Ping => 10,
            Kind::Pong => 11,
            Kind::Bye => 12,
        }
    }

    fn from_wire(tag: u32) -> Option<Self> {
        match tag {
            10 => Some(Kind::Ping),
            11 => Some(Kind::Pong),
            12 => Some(Kind::Bye),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connected(String, u16),
    Disconnected,
    Lost,
    Message(Kind, u64),
}

struct Recorder {
    events: Sender<Event>,
}

impl ClientHandler<Kind> for Recorder {
    fn on_connect(&mut self, _client: &ClientHandle<Kind>, host: &str, port: u16) {
        let _ = self.events.send(Event::Connected(host.to_string(), port));
    }

    fn on_disconnect(&mut self, _client: &ClientHandle<Kind>) {
        let _ = self.events.send(Event::Disconnected);
    }

    fn on_connection_lost(&mut self, _client: &ClientHandle<Kind>) {
        let _ = self.events.send(Event::Lost);
    }

    fn on_message(&mut self, client: &ClientHandle<Kind>, mut message: Message<Kind>) {
        let value = message.pop::<u64>().unwrap_or_default();
        match message.kind() {
            Kind::Ping => {
                let mut reply = Message::new(Kind::Pong);
                reply.push(value + 1);
                client.send(reply);
            }
            Kind::Bye => {
                client.disconnect();
            }
            Kind::Pong => {}
        }
        let _ = self.events.send(Event::Message(message.kind(), value));
    }
}

fn recording_client() -> (Client<Kind, Recorder>, Receiver<Event>) {
    let (tx, rx) = unbounded();
    (Client::new(Recorder { events: tx }), rx)
}

fn write_frame(stream: &mut TcpStream, message: &Message<Kind>) -> Result<()> {
    stream.write_all(&message.header(u32::MAX)?.encode())?;
    stream.write_all(message.body())?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<(Header, Vec<u8>)> {
    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw)?;
    let header = Header::decode(&raw);
    let mut body = vec![0u8; header.size as usize];
    stream.read_exact(&mut body)?;
    Ok((header, body))
}

/// Dispatches inbound messages until `predicate` holds.
fn wait_until(client: &Client<Kind, Recorder>, mut predicate: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > TIMEOUT {
            anyhow::bail!("timeout waiting for client condition");
        }
        client.process_message();
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

#[test]
fn test_integration_connect_reports_peer() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (mut client, events) = recording_client();

    client.connect("127.0.0.1", port)?;
    let _server_side = listener.accept()?;

    assert!(client.is_connected());
    assert_eq!(events.recv_timeout(TIMEOUT)?, Event::Connected("127.0.0.1".into(), port));
    Ok(())
}

#[test]
fn test_integration_connect_while_connected_fails() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (mut client, _events) = recording_client();

    client.connect("127.0.0.1", port)?;
    assert!(matches!(
        client.connect("127.0.0.1", port),
        Err(Error::AlreadyConnected)
    ));
    assert!(client.is_connected());
    Ok(())
}

#[test]
fn test_integration_connect_to_closed_port_fails() -> Result<()> {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let (tx, events) = unbounded();
    let mut client = Client::with_config(
        Recorder { events: tx },
        ClientConfig::default().with_connect_timeout(Duration::from_secs(1)),
    );

    let err = client
        .connect("127.0.0.1", port)
        .err()
        .context("connecting to a closed port should fail")?;
    assert!(matches!(err, Error::Connect { .. }), "unexpected error: {err}");
    assert!(!client.is_connected());
    assert!(events.try_recv().is_err());
    Ok(())
}

#[test]
fn test_integration_messages_flow_both_ways() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (mut client, events) = recording_client();
    client.connect("127.0.0.1", port)?;
    let (mut server_side, _) = listener.accept()?;
    server_side.set_read_timeout(Some(TIMEOUT))?;
    assert!(matches!(events.recv_timeout(TIMEOUT)?, Event::Connected(..)));

    let mut ping = Message::new(Kind::Ping);
    ping.push(41u64);
    write_frame(&mut server_side, &ping)?;

    wait_until(&client, || !events.is_empty())?;
    assert_eq!(events.try_recv()?, Event::Message(Kind::Ping, 41));

    let (header, body) = read_frame(&mut server_side)?;
    assert_eq!(header.tag, Kind::Pong.to_wire());
    assert_eq!(body, 42u64.to_le_bytes());
    Ok(())
}

#[test]
fn test_integration_server_close_is_reported_once() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (mut client, events) = recording_client();
    client.connect("127.0.0.1", port)?;
    let (server_side, _) = listener.accept()?;
    assert!(matches!(events.recv_timeout(TIMEOUT)?, Event::Connected(..)));

    drop(server_side);

    assert_eq!(events.recv_timeout(TIMEOUT)?, Event::Lost);
    wait_until(&client, || !client.is_connected())?;
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());

    // Sending after the loss is silently ignored.
    client.send(Message::new(Kind::Pong));

    // An explicit disconnect afterwards has nothing left to close.
    client.disconnect();
    assert!(events.try_recv().is_err());
    Ok(())
}

#[test]
fn test_integration_disconnect_is_not_a_loss() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (mut client, events) = recording_client();
    client.connect("127.0.0.1", port)?;
    let (mut server_side, _) = listener.accept()?;
    server_side.set_read_timeout(Some(TIMEOUT))?;
    assert!(matches!(events.recv_timeout(TIMEOUT)?, Event::Connected(..)));

    client.disconnect();
    assert!(!client.is_connected());
    assert_eq!(events.recv_timeout(TIMEOUT)?, Event::Disconnected);

    client.disconnect();
    client.send(Message::new(Kind::Pong));
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());

    // The socket is released, so the server side reads end-of-stream.
    let mut buf = [0u8; 1];
    assert_eq!(server_side.read(&mut buf)?, 0);
    Ok(())
}

#[test]
fn test_integration_disconnect_from_callback_is_reported() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (mut client, events) = recording_client();
    client.connect("127.0.0.1", port)?;
    let (mut server_side, _) = listener.accept()?;
    server_side.set_read_timeout(Some(TIMEOUT))?;
    assert!(matches!(events.recv_timeout(TIMEOUT)?, Event::Connected(..)));

    write_frame(&mut server_side, &Message::new(Kind::Bye))?;

    wait_until(&client, || !client.is_connected())?;
    assert_eq!(events.recv_timeout(TIMEOUT)?, Event::Message(Kind::Bye, 0));
    assert_eq!(events.recv_timeout(TIMEOUT)?, Event::Disconnected);
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());

    // Nothing is left for a later explicit disconnect to report.
    client.disconnect();
    assert!(events.try_recv().is_err());
    Ok(())
}

#[test]
fn test_integration_connect_is_reported_before_immediate_loss() -> Result<()> {
    const ROUNDS: usize = 10;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let closer = thread::spawn(move || {
        for _ in 0..ROUNDS {
            drop(listener.accept());
        }
    });

    let (mut client, events) = recording_client();
    for _ in 0..ROUNDS {
        client.connect("127.0.0.1", port)?;
        assert_eq!(events.recv_timeout(TIMEOUT)?, Event::Connected("127.0.0.1".into(), port));
        assert_eq!(events.recv_timeout(TIMEOUT)?, Event::Lost);
        wait_until(&client, || !client.is_connected())?;
    }

    closer
        .join()
        .map_err(|_| anyhow::anyhow!("closer thread panicked"))?;
    Ok(())
}

#[test]
fn test_integration_reconnect_after_loss() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (mut client, events) = recording_client();

    client.connect("127.0.0.1", port)?;
    let (first, _) = listener.accept()?;
    drop(first);
    wait_until(&client, || !client.is_connected())?;

    client.connect("127.0.0.1", port)?;
    let _second = listener.accept()?;
    assert!(client.is_connected());

    let seen: Vec<Event> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            Event::Connected("127.0.0.1".into(), port),
            Event::Lost,
            Event::Connected("127.0.0.1".into(), port),
        ]
    );
    Ok(())
}

#[test]
fn test_integration_client_id_is_settable() -> Result<()> {
    let (client, _events) = recording_client();
    assert_eq!(client.id(), 0);
    client.handle().set_id(1003);
    assert_eq!(client.id(), 1003);
    assert!(!client.process_message());
    assert!(!client.available());
    Ok(())
}
