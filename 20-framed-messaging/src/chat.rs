//! Demo chat relay built on the framework.
//!
//! The server hands every accepted client its connection id, refuses clients
//! beyond a configured limit, and relays `Text` messages to one client or to
//! everyone else. Handlers report what they see over a `crossbeam_channel`
//! so a console front end (or a test) can consume it on its own thread.

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::client::{ClientHandle, ClientHandler};
use crate::connection::{Connection, ConnectionId};
use crate::error::WireError;
use crate::message::{Message, MessageKind};
use crate::server::{ServerHandle, ServerHandler};

/// Reason sent with [`ChatKind::ServerRefuse`] when the server is at capacity.
pub const SERVER_FULL: &str = "server full";

/// Text a [`ChatClient`] sends to the server once it has been accepted.
pub const GREETING: &str = "hello from client ";

const RECIPIENT_SERVER: u32 = 0;
const RECIPIENT_EVERYONE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    /// Server to client: accepted, body carries the client's id.
    ServerAccept,
    /// Server to client: refused, body carries the reason.
    ServerRefuse,
    /// Either direction: a [`TextMessage`].
    Text,
}

impl MessageKind for ChatKind {
    fn to_wire(self) -> u32 {
        match self {
            ChatKind::ServerAccept => 0,
            ChatKind::ServerRefuse => 1,
            ChatKind::Text => 2,
        }
    }

    fn from_wire(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(ChatKind::ServerAccept),
            1 => Some(ChatKind::ServerRefuse),
            2 => Some(ChatKind::Text),
            _ => None,
        }
    }
}

/// Who a [`TextMessage`] is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// Only the server reads it.
    Server,
    /// Every connected client except the sender.
    Everyone,
    Client(ConnectionId),
}

impl Recipient {
    fn to_wire(self) -> u32 {
        match self {
            Recipient::Server => RECIPIENT_SERVER,
            Recipient::Everyone => RECIPIENT_EVERYONE,
            Recipient::Client(id) => id,
        }
    }

    fn from_wire(raw: u32) -> Self {
        match raw {
            RECIPIENT_SERVER => Recipient::Server,
            RECIPIENT_EVERYONE => Recipient::Everyone,
            id => Recipient::Client(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub sender: ConnectionId,
    pub recipient: Recipient,
    pub text: String,
}

impl TextMessage {
    pub fn new(sender: ConnectionId, recipient: Recipient, text: impl Into<String>) -> Self {
        Self {
            sender,
            recipient,
            text: text.into(),
        }
    }

    /// Packs the text first so the ids sit on top of the stack.
    pub fn encode(&self) -> Result<Message<ChatKind>, WireError> {
        let mut message = Message::new(ChatKind::Text);
        message
            .push_str(&self.text)?
            .push(self.recipient.to_wire())
            .push(self.sender);
        Ok(message)
    }

    pub fn decode(mut message: Message<ChatKind>) -> Result<Self, WireError> {
        let sender = message.pop::<u32>()?;
        let recipient = Recipient::from_wire(message.pop::<u32>()?);
        let text = message.pop_string()?;
        Ok(Self {
            sender,
            recipient,
            text,
        })
    }
}

pub fn accept_message(id: ConnectionId) -> Message<ChatKind> {
    let mut message = Message::new(ChatKind::ServerAccept);
    message.push(id);
    message
}

pub fn refuse_message(reason: &str) -> Result<Message<ChatKind>, WireError> {
    let mut message = Message::new(ChatKind::ServerRefuse);
    message.push_str(reason)?;
    Ok(message)
}

/// What a chat handler observed, in the order it observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Joined(ConnectionId),
    Left(ConnectionId),
    Accepted(ConnectionId),
    Refused(String),
    Text(TextMessage),
    Lost,
}

/// Server handler that relays text between clients.
pub struct RelayServer {
    max_clients: Option<usize>,
    events: Option<Sender<ChatEvent>>,
}

impl RelayServer {
    pub fn new(max_clients: Option<usize>) -> Self {
        Self {
            max_clients,
            events: None,
        }
    }

    /// Reports joins, leaves and server-bound text on `events`.
    pub fn with_events(mut self, events: Sender<ChatEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: ChatEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn relay(&self, server: &ServerHandle<ChatKind>, text: TextMessage) {
        let message = match text.encode() {
            Ok(message) => message,
            Err(error) => {
                warn!(sender = text.sender, %error, "failed to re-encode text");
                return;
            }
        };

        match text.recipient {
            Recipient::Server => {
                info!(sender = text.sender, text = %text.text, "message for server");
                self.emit(ChatEvent::Text(text));
            }
            Recipient::Everyone => server.send_all(&message, Some(text.sender)),
            Recipient::Client(id) => {
                if !server.send(id, message) {
                    debug!(sender = text.sender, recipient = id, "recipient not connected");
                }
            }
        }
    }
}

impl ServerHandler<ChatKind> for RelayServer {
    fn on_listen(&mut self, _server: &ServerHandle<ChatKind>, addr: std::net::SocketAddr) {
        info!(%addr, "chat relay ready");
    }

    fn on_client_connect(
        &mut self,
        server: &ServerHandle<ChatKind>,
        connection: &Connection<ChatKind>,
    ) -> bool {
        let full = self
            .max_clients
            .is_some_and(|max| server.connection_count() >= max);
        if !full {
            return true;
        }

        match refuse_message(SERVER_FULL) {
            Ok(message) => server.send_to(connection, message),
            Err(error) => warn!(%error, "failed to encode refusal"),
        }
        false
    }

    fn on_client_accepted(
        &mut self,
        server: &ServerHandle<ChatKind>,
        connection: &Connection<ChatKind>,
    ) {
        self.emit(ChatEvent::Joined(connection.id()));
        server.send_to(connection, accept_message(connection.id()));
    }

    fn on_client_disconnect(
        &mut self,
        _server: &ServerHandle<ChatKind>,
        connection: &Connection<ChatKind>,
    ) {
        self.emit(ChatEvent::Left(connection.id()));
    }

    fn on_message(
        &mut self,
        server: &ServerHandle<ChatKind>,
        sender: ConnectionId,
        message: Message<ChatKind>,
    ) {
        if message.kind() != ChatKind::Text {
            warn!(sender, kind = ?message.kind(), "ignoring unexpected message kind");
            return;
        }
        match TextMessage::decode(message) {
            // The connection id is authoritative, whatever the client claimed.
            Ok(text) => self.relay(server, TextMessage { sender, ..text }),
            Err(error) => warn!(sender, %error, "malformed text message"),
        }
    }
}

/// Client handler that records the accepted id, greets the server and
/// forwards events.
pub struct ChatClient {
    events: Sender<ChatEvent>,
}

impl ChatClient {
    pub fn new(events: Sender<ChatEvent>) -> Self {
        Self { events }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

impl ClientHandler<ChatKind> for ChatClient {
    fn on_connection_lost(&mut self, _client: &ClientHandle<ChatKind>) {
        self.emit(ChatEvent::Lost);
    }

    fn on_message(&mut self, client: &ClientHandle<ChatKind>, mut message: Message<ChatKind>) {
        let event = match message.kind() {
            ChatKind::ServerAccept => message.pop::<u32>().map(|id| {
                client.set_id(id);
                match TextMessage::new(id, Recipient::Server, GREETING).encode() {
                    Ok(greeting) => client.send(greeting),
                    Err(error) => warn!(%error, "failed to encode greeting"),
                }
                ChatEvent::Accepted(id)
            }),
            ChatKind::ServerRefuse => message.pop_string().map(ChatEvent::Refused),
            ChatKind::Text => TextMessage::decode(message).map(ChatEvent::Text),
        };
        match event {
            Ok(event) => self.emit(event),
            Err(error) => warn!(%error, "malformed message from server"),
        }
    }
}

/// One line typed into the console client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Exit,
    Say(Recipient, String),
}

impl ConsoleCommand {
    /// `exit`, `all:<text>`, `to:<id> <text>`, or plain text for the server.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        if line.trim() == "exit" {
            return Some(ConsoleCommand::Exit);
        }
        if let Some(text) = line.strip_prefix("all:") {
            return Some(ConsoleCommand::Say(Recipient::Everyone, text.to_string()));
        }
        if let Some(rest) = line.strip_prefix("to:") {
            let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
            if let Ok(id) = id.parse::<u32>() {
                return Some(ConsoleCommand::Say(Recipient::from_wire(id), text.to_string()));
            }
        }
        Some(ConsoleCommand::Say(Recipient::Server, line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_survives_encoding() {
        let text = TextMessage::new(1001, Recipient::Client(1002), "hello there");
        let message = text.encode().unwrap();
        assert_eq!(message.kind(), ChatKind::Text);
        assert_eq!(TextMessage::decode(message).unwrap(), text);
    }

    #[test]
    fn text_message_pops_sender_first() {
        let mut message = TextMessage::new(1005, Recipient::Everyone, "x").encode().unwrap();
        assert_eq!(message.pop::<u32>().unwrap(), 1005);
        assert_eq!(message.pop::<u32>().unwrap(), u32::MAX);
        assert_eq!(message.pop_string().unwrap(), "x");
        assert!(message.is_empty());
    }

    #[test]
    fn recipient_wire_values() {
        assert_eq!(Recipient::from_wire(0), Recipient::Server);
        assert_eq!(Recipient::from_wire(u32::MAX), Recipient::Everyone);
        assert_eq!(Recipient::from_wire(1000), Recipient::Client(1000));
        assert_eq!(Recipient::Everyone.to_wire(), u32::MAX);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(ChatKind::from_wire(2), Some(ChatKind::Text));
        assert_eq!(ChatKind::from_wire(3), None);
    }

    #[test]
    fn accept_and_refuse_bodies() {
        let mut accept = accept_message(1000);
        assert_eq!(accept.pop::<u32>().unwrap(), 1000);

        let mut refuse = refuse_message(SERVER_FULL).unwrap();
        assert_eq!(refuse.kind(), ChatKind::ServerRefuse);
        assert_eq!(refuse.pop_string().unwrap(), "server full");
    }

    #[test]
    fn truncated_text_is_an_error() {
        let mut message = Message::new(ChatKind::Text);
        message.push(7u32);
        assert!(TextMessage::decode(message).is_err());
    }

    #[test]
    fn console_commands() {
        assert_eq!(ConsoleCommand::parse("exit\n"), Some(ConsoleCommand::Exit));
        assert_eq!(ConsoleCommand::parse("   "), None);
        assert_eq!(
            ConsoleCommand::parse("all:hi everyone"),
            Some(ConsoleCommand::Say(Recipient::Everyone, "hi everyone".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("to:1001 psst"),
            Some(ConsoleCommand::Say(Recipient::Client(1001), "psst".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("to:bob hi"),
            Some(ConsoleCommand::Say(Recipient::Server, "to:bob hi".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("status?"),
            Some(ConsoleCommand::Say(Recipient::Server, "status?".into()))
        );
    }
}
