/// Client session plumbing: the opaque connection seam, the decoded
/// command vocabulary, and the per-session reader/writer tasks.
///
/// A session is two tasks around one byte pipe. The reader turns inbound
/// frames into [`ClientCommand`]s and feeds them to the hub; the writer
/// drains the session's outbound queue onto the wire. Neither touches
/// shared state: everything the hub needs to know arrives as a
/// [`SessionEvent`] on its command channel.
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::codec::LobbyCodec;
use super::packet::{Packet, PacketError};

/// An opaque bidirectional byte pipe.
///
/// TCP streams in production; `tokio::io::duplex` halves in tests.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

/// Hub-local identifier of one connection's session.
pub(crate) type SessionId = u64;

/// An inbound packet decoded into the command vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Login {
        protocol: i64,
        name: String,
        build: String,
        registered: bool,
        secret: Option<String>,
    },
    Chat {
        body: String,
        recipient: String,
    },
    Motd {
        text: String,
    },
    Clients,
    Pong,
    Disconnect {
        reason: String,
    },
}

/// Why an inbound packet could not become a [`ClientCommand`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The command name is not part of the protocol.
    #[error("unknown command '{0}'")]
    Unknown(String),
    /// A field accessor failed while reading the command's arguments.
    /// The source's `Display` form goes to the peer verbatim.
    #[error("{source}")]
    BadArgument {
        command: &'static str,
        source: PacketError,
    },
}

impl ClientCommand {
    /// Decode a framed packet into a command.
    pub fn parse(mut packet: Packet) -> Result<Self, CommandError> {
        let bad = |command| move |source| CommandError::BadArgument { command, source };

        let name = packet.read_string().map_err(bad("GARBAGE_RECEIVED"))?;
        match name.as_str() {
            "LOGIN" => {
                let protocol = packet.read_int().map_err(bad("LOGIN"))?;
                let name = packet.read_string().map_err(bad("LOGIN"))?;
                let build = packet.read_string().map_err(bad("LOGIN"))?;
                let registered = packet.read_bool().map_err(bad("LOGIN"))?;
                let secret = if registered {
                    Some(packet.read_string().map_err(bad("LOGIN"))?)
                } else {
                    None
                };
                Ok(ClientCommand::Login {
                    protocol,
                    name,
                    build,
                    registered,
                    secret,
                })
            }
            "CHAT" => {
                let body = packet.read_string().map_err(bad("CHAT"))?;
                let recipient = packet.read_string().map_err(bad("CHAT"))?;
                Ok(ClientCommand::Chat { body, recipient })
            }
            "MOTD" => {
                let text = packet.read_string().map_err(bad("MOTD"))?;
                Ok(ClientCommand::Motd { text })
            }
            "CLIENTS" => Ok(ClientCommand::Clients),
            "PONG" => Ok(ClientCommand::Pong),
            "DISCONNECT" => {
                let reason = packet.read_string().map_err(bad("DISCONNECT"))?;
                Ok(ClientCommand::Disconnect { reason })
            }
            _ => Err(CommandError::Unknown(name)),
        }
    }
}

/// What a session's I/O tasks report to the hub.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A well-formed inbound command.
    Command {
        session: SessionId,
        command: ClientCommand,
    },
    /// An inbound packet that failed command decoding.
    Malformed {
        session: SessionId,
        error: CommandError,
    },
    /// The transport closed or faulted; no more inbound traffic.
    Gone { session: SessionId },
}

/// Handles the hub keeps per live session.
#[derive(Debug)]
pub(crate) struct SessionIo {
    /// Enqueue an outbound packet. Dropping this closes the writer
    /// after the already-queued packets have drained.
    pub queue: Option<mpsc::UnboundedSender<Packet>>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl SessionIo {
    /// Enqueue a packet; silently ignored once the session is closing.
    pub fn send(&self, packet: Packet) {
        if let Some(queue) = &self.queue {
            let _ = queue.send(packet);
        }
    }
}

/// Split a connection and spawn its reader and writer tasks.
pub(crate) fn spawn_io(
    session: SessionId,
    conn: Box<dyn Connection>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> SessionIo {
    let (read_half, write_half) = tokio::io::split(conn);
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Packet>();

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        let mut framed = FramedRead::new(read_half, LobbyCodec);
        loop {
            let event = match framed.next().await {
                Some(Ok(packet)) => {
                    debug!(session, %packet, "inbound");
                    match ClientCommand::parse(packet) {
                        Ok(command) => SessionEvent::Command { session, command },
                        Err(error) => SessionEvent::Malformed { session, error },
                    }
                }
                Some(Err(e)) => {
                    warn!(session, "transport error: {e}");
                    SessionEvent::Gone { session }
                }
                None => SessionEvent::Gone { session },
            };
            let gone = matches!(event, SessionEvent::Gone { .. });
            if reader_events.send(event).is_err() || gone {
                break;
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, LobbyCodec);
        while let Some(packet) = queue_rx.recv().await {
            if let Err(e) = framed.send(packet).await {
                warn!(session, "write failed: {e}");
                let _ = events.send(SessionEvent::Gone { session });
                return;
            }
        }
        // Queue closed: the hub is done with this session. Flush what
        // made it into the transport and close our end.
        let mut transport = framed.into_inner();
        let _ = transport.shutdown().await;
    });

    SessionIo {
        queue: Some(queue_tx),
        reader,
        writer,
    }
}
