/// Lobby hub — the serial command loop owning the roster, the MOTD and
/// every session's lifecycle.
///
/// All roster and MOTD mutation happens on one task that consumes a
/// single command channel, so check-then-insert sequences (name-collision
/// probing, the already-logged-in test) need no locks, and every
/// broadcast caused by a mutation is enqueued before the next mutation
/// runs. Liveness deadlines are recomputed each loop iteration and fed
/// through the same `select!` as inbound commands, which gives "a packet
/// arrived just as the ping expired" a deterministic outcome.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::client::{
    self, ClientCommand, CommandError, Connection, SessionEvent, SessionId, SessionIo,
};
use super::directory::{Privilege, UserDirectory};
use super::packet::Packet;

/// The only protocol revision the server speaks.
const PROTOCOL_VERSION: i64 = 0;

/// Production liveness defaults; tests override with sub-second values.
const DEFAULT_PING_CYCLE: Duration = Duration::from_secs(30);
const DEFAULT_SENDING_TIMEOUT: Duration = Duration::from_secs(90);

/// Sleep bound for the hub loop when no liveness deadline is pending.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Control messages from the [`Server`] handle to the hub task.
enum Control {
    Accept(Box<dyn Connection>),
    SetPingCycle(Duration),
    SetSendingTimeout(Duration),
    Shutdown,
}

/// Handle to a running lobby server.
///
/// Cheap to clone pieces: dropping the last handle also shuts the hub
/// down, since its control channel closes.
pub struct Server {
    control: mpsc::UnboundedSender<Control>,
    shutdown: watch::Receiver<bool>,
    nr_clients: Arc<AtomicUsize>,
}

impl Server {
    /// Spawn the hub task. Must run inside a tokio runtime.
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let nr_clients = Arc::new(AtomicUsize::new(0));

        let hub = Hub {
            directory,
            events: events_tx,
            sessions: HashMap::new(),
            roster: HashMap::new(),
            order: Vec::new(),
            motd: String::new(),
            ping_cycle: DEFAULT_PING_CYCLE,
            sending_timeout: DEFAULT_SENDING_TIMEOUT,
            next_id: 1,
            nr_clients: Arc::clone(&nr_clients),
            draining: Vec::new(),
            closing: false,
        };
        tokio::spawn(hub.run(control_rx, events_rx, shutdown_tx));

        Server {
            control: control_tx,
            shutdown: shutdown_rx,
            nr_clients,
        }
    }

    /// Hand a freshly accepted byte pipe to the hub.
    pub fn accept(&self, conn: impl Connection) {
        let _ = self.control.send(Control::Accept(Box::new(conn)));
    }

    /// Number of clients currently in the roster.
    pub fn nr_clients(&self) -> usize {
        self.nr_clients.load(Ordering::Relaxed)
    }

    pub fn set_ping_cycle_time(&self, period: Duration) {
        let _ = self.control.send(Control::SetPingCycle(period));
    }

    pub fn set_client_sending_timeout(&self, timeout: Duration) {
        let _ = self.control.send(Control::SetSendingTimeout(timeout));
    }

    /// Ask the hub to close every session and stop.
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    /// Block until the hub has drained every session and stopped.
    pub async fn wait_till_shutdown(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|done| *done).await;
    }
}

/// Roster attributes of a logged-in client. Privilege never changes for
/// the lifetime of the record.
#[derive(Debug)]
struct ClientInfo {
    name: String,
    build: String,
    privilege: Privilege,
    login_time: SystemTime,
}

#[derive(Debug)]
enum SessionState {
    /// Connection open, no LOGIN accepted yet.
    Handshake,
    /// Present in the roster.
    Connected(ClientInfo),
}

#[derive(Debug)]
struct Session {
    io: SessionIo,
    state: SessionState,
    /// Instant of the last inbound packet.
    last_activity: Instant,
    /// A PING is in flight and unanswered.
    pending_ping: bool,
    /// When the in-flight PING was sent. Meaningful only while
    /// `pending_ping` is set.
    ping_sent: Instant,
}

struct Hub {
    directory: Arc<dyn UserDirectory>,
    events: mpsc::UnboundedSender<SessionEvent>,
    sessions: HashMap<SessionId, Session>,
    /// Roster: assigned name to session. At most one record per name.
    roster: HashMap<String, SessionId>,
    /// Login order of connected sessions, for broadcast snapshots.
    order: Vec<SessionId>,
    motd: String,
    ping_cycle: Duration,
    sending_timeout: Duration,
    next_id: SessionId,
    nr_clients: Arc<AtomicUsize>,
    /// Tasks of sessions in their terminal phase: queue closed, reader
    /// aborted, writer flushing its tail. Finished handles are reaped
    /// whenever another session closes; the rest are awaited at
    /// shutdown.
    draining: Vec<JoinHandle<()>>,
    closing: bool,
}

impl Hub {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        shutdown_tx: watch::Sender<bool>,
    ) {
        loop {
            let deadline = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_TICK);
            tokio::select! {
                cmd = control.recv() => match cmd {
                    Some(Control::Accept(conn)) => self.accept(conn),
                    Some(Control::SetPingCycle(period)) => self.ping_cycle = period,
                    Some(Control::SetSendingTimeout(timeout)) => self.sending_timeout = timeout,
                    Some(Control::Shutdown) | None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = time::sleep_until(deadline) => self.check_liveness(),
            }
        }
        self.shutdown_all().await;
        let _ = shutdown_tx.send(true);
    }

    fn accept(&mut self, conn: Box<dyn Connection>) {
        let id = self.next_id;
        self.next_id += 1;
        info!(session = id, "new connection");
        let io = client::spawn_io(id, conn, self.events.clone());
        self.sessions.insert(
            id,
            Session {
                io,
                state: SessionState::Handshake,
                last_activity: Instant::now(),
                pending_ping: false,
                ping_sent: Instant::now(),
            },
        );
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command { session, command } => self.handle_command(session, command),
            SessionEvent::Malformed { session, error } => self.handle_malformed(session, error),
            SessionEvent::Gone { session } => {
                if self.sessions.contains_key(&session) {
                    debug!(session, "transport closed");
                    self.close_session(session);
                }
            }
        }
    }

    fn handle_command(&mut self, id: SessionId, command: ClientCommand) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        // Any inbound packet counts as liveness: reset the ping cycle
        // and clear an outstanding PING.
        session.last_activity = Instant::now();
        session.pending_ping = false;
        let connected = matches!(session.state, SessionState::Connected(_));

        match (connected, command) {
            (
                false,
                ClientCommand::Login {
                    protocol,
                    name,
                    build,
                    registered,
                    secret,
                },
            ) => self.handle_login(id, protocol, name, build, registered, secret),
            (true, ClientCommand::Chat { body, recipient }) => {
                self.handle_chat(id, body, recipient)
            }
            (true, ClientCommand::Motd { text }) => self.handle_motd(id, text),
            (true, ClientCommand::Clients) => self.handle_clients(id),
            (true, ClientCommand::Pong) => {}
            (true, ClientCommand::Disconnect { reason }) => {
                debug!(session = id, reason = %reason, "client disconnecting");
                self.close_session(id);
            }
            // A second LOGIN while connected, or anything but LOGIN
            // during the handshake.
            _ => self.error_close(id, "GARBAGE_RECEIVED", "INVALID_CMD"),
        }
    }

    fn handle_malformed(&mut self, id: SessionId, error: CommandError) {
        if !self.sessions.contains_key(&id) {
            return;
        }
        let (context, diagnostic) = match error {
            CommandError::Unknown(command) => {
                warn!(session = id, command = %command, "unknown command");
                ("GARBAGE_RECEIVED", "INVALID_CMD".to_owned())
            }
            CommandError::BadArgument { command, source } => (command, source.to_string()),
        };
        self.error_close(id, context, &diagnostic);
    }

    fn handle_login(
        &mut self,
        id: SessionId,
        protocol: i64,
        name: String,
        build: String,
        registered: bool,
        secret: Option<String>,
    ) {
        if protocol != PROTOCOL_VERSION {
            return self.error_close(id, "LOGIN", "UNSUPPORTED_PROTOCOL");
        }

        let (assigned, privilege) = if registered {
            let Some(entry) = self.directory.lookup(&name) else {
                return self.error_close(id, "LOGIN", "WRONG_PASSWORD");
            };
            if !entry.verify(secret.as_deref().unwrap_or_default()) {
                return self.error_close(id, "LOGIN", "WRONG_PASSWORD");
            }
            if self.roster.contains_key(&name) {
                return self.error_close(id, "LOGIN", "ALREADY_LOGGED_IN");
            }
            (name, entry.privilege)
        } else {
            (self.resolve_name(&name), Privilege::Unregistered)
        };

        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.state = SessionState::Connected(ClientInfo {
            name: assigned.clone(),
            build,
            privilege,
            login_time: SystemTime::now(),
        });
        self.roster.insert(assigned.clone(), id);
        self.order.push(id);
        self.nr_clients.store(self.roster.len(), Ordering::Relaxed);
        info!(session = id, name = %assigned, privilege = privilege.tag(), "logged in");

        if let Some(session) = self.sessions.get(&id) {
            let mut login = Packet::new();
            login.add("LOGIN");
            login.add(&assigned);
            login.add(privilege.tag());
            session.io.send(login);

            let mut time = Packet::new();
            time.add("TIME");
            time.add(unix_now());
            session.io.send(time);
        }

        self.broadcast_clients_update();

        if !self.motd.is_empty() {
            if let Some(session) = self.sessions.get(&id) {
                session.io.send(system_chat(&self.motd));
            }
        }
    }

    /// Pick the name an anonymous login will actually carry: the
    /// requested name if free, else the smallest positive integer
    /// suffix that frees it. Names of registered users are reserved
    /// even while their owner is offline.
    fn resolve_name(&self, wanted: &str) -> String {
        if !wanted.is_empty() && !self.name_taken(wanted) {
            return wanted.to_owned();
        }
        let mut n: u64 = 1;
        loop {
            let candidate = format!("{wanted}{n}");
            if !self.name_taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        self.roster.contains_key(name) || self.directory.lookup(name).is_some()
    }

    fn handle_chat(&mut self, id: SessionId, body: String, recipient: String) {
        let Some(sender) = self.client_name(id) else {
            return;
        };
        // The one sanitization rule of the protocol: '<' becomes "&lt;".
        let body = body.replace('<', "&lt;");

        if recipient.is_empty() {
            let mut chat = Packet::new();
            chat.add("CHAT");
            chat.add(&sender);
            chat.add(&body);
            chat.add("public");
            self.broadcast(chat);
        } else if let Some(&target) = self.roster.get(&recipient) {
            let mut chat = Packet::new();
            chat.add("CHAT");
            chat.add(&sender);
            chat.add(&body);
            chat.add("private");
            if let Some(session) = self.sessions.get(&target) {
                session.io.send(chat);
            }
        } else {
            // No such recipient: drop silently, no echo, no error.
            debug!(session = id, recipient = %recipient, "private chat to unknown recipient dropped");
        }
    }

    fn handle_motd(&mut self, id: SessionId, text: String) {
        let is_superuser = matches!(
            self.sessions.get(&id).map(|s| &s.state),
            Some(SessionState::Connected(info)) if info.privilege == Privilege::Superuser
        );
        if !is_superuser {
            // The one recoverable command fault: stay connected.
            if let Some(session) = self.sessions.get(&id) {
                let mut error = Packet::new();
                error.add("ERROR");
                error.add("MOTD");
                error.add("DEFICIENT_PERMISSION");
                session.io.send(error);
            }
            return;
        }
        info!(session = id, "motd updated");
        self.motd = text;
        self.broadcast(system_chat(&self.motd));
    }

    /// Roster snapshot reply, in login order.
    fn handle_clients(&self, id: SessionId) {
        let mut reply = Packet::new();
        reply.add("CLIENTS");
        reply.add(self.order.len());
        for sid in &self.order {
            if let Some(SessionState::Connected(info)) =
                self.sessions.get(sid).map(|s| &s.state)
            {
                reply.add(&info.name);
                reply.add(&info.build);
                reply.add(info.privilege.tag());
            }
        }
        if let Some(session) = self.sessions.get(&id) {
            session.io.send(reply);
        }
    }

    fn client_name(&self, id: SessionId) -> Option<String> {
        match self.sessions.get(&id).map(|s| &s.state) {
            Some(SessionState::Connected(info)) => Some(info.name.clone()),
            _ => None,
        }
    }

    /// Enqueue a copy to every connected session, in login order.
    fn broadcast(&self, packet: Packet) {
        for sid in &self.order {
            if let Some(session) = self.sessions.get(sid) {
                session.io.send(packet.clone());
            }
        }
    }

    fn broadcast_clients_update(&self) {
        if self.closing {
            return;
        }
        let mut update = Packet::new();
        update.add("CLIENTS_UPDATE");
        self.broadcast(update);
    }

    /// Send a final diagnostic and tear the session down.
    fn error_close(&mut self, id: SessionId, context: &str, diagnostic: &str) {
        if let Some(session) = self.sessions.get(&id) {
            let mut error = Packet::new();
            error.add("ERROR");
            error.add(context);
            error.add(diagnostic);
            session.io.send(error);
        }
        self.close_session(id);
    }

    /// Terminal transition: cancel timers (the session leaves the
    /// deadline scan), close the outbound queue after the in-flight
    /// tail, unblock the reader, drop the roster record and notify the
    /// survivors.
    fn close_session(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        // Reap tasks of previously closed sessions so the list stays
        // bounded on a long-running server.
        self.draining.retain(|handle| !handle.is_finished());
        session.io.queue = None;
        session.io.reader.abort();
        self.draining.push(session.io.reader);
        self.draining.push(session.io.writer);

        match session.state {
            SessionState::Connected(info) => {
                self.roster.remove(&info.name);
                self.order.retain(|&sid| sid != id);
                self.nr_clients.store(self.roster.len(), Ordering::Relaxed);
                let online_secs = info
                    .login_time
                    .elapsed()
                    .unwrap_or_default()
                    .as_secs();
                info!(session = id, name = %info.name, online_secs, "client left");
                self.broadcast_clients_update();
            }
            SessionState::Handshake => {
                debug!(session = id, "connection closed before login");
            }
        }
    }

    /// Scan liveness deadlines: send due PINGs, time out the silent.
    fn check_liveness(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();

        for (&id, session) in self.sessions.iter_mut() {
            if !matches!(session.state, SessionState::Connected(_)) {
                continue;
            }
            if now >= session.last_activity + self.sending_timeout {
                expired.push(id);
                continue;
            }
            let ping_base = if session.pending_ping {
                session.ping_sent
            } else {
                session.last_activity
            };
            if now >= ping_base + self.ping_cycle {
                if session.pending_ping {
                    // Second expiry with the PING still unanswered.
                    expired.push(id);
                } else {
                    session.pending_ping = true;
                    session.ping_sent = now;
                    let mut ping = Packet::new();
                    ping.add("PING");
                    session.io.send(ping);
                    debug!(session = id, "ping");
                }
            }
        }

        for id in expired {
            self.timeout_session(id);
        }
    }

    fn timeout_session(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get(&id) {
            let mut disconnect = Packet::new();
            disconnect.add("DISCONNECT");
            disconnect.add("CLIENT_TIMEOUT");
            session.io.send(disconnect);
        }
        warn!(session = id, "liveness timeout");
        self.close_session(id);
    }

    /// Earliest instant at which any connected session needs attention.
    fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter(|s| matches!(s.state, SessionState::Connected(_)))
            .map(|s| {
                let ping_base = if s.pending_ping {
                    s.ping_sent
                } else {
                    s.last_activity
                };
                let ping_deadline = ping_base + self.ping_cycle;
                let timeout_deadline = s.last_activity + self.sending_timeout;
                ping_deadline.min(timeout_deadline)
            })
            .min()
    }

    /// Close every session, then wait for all I/O tasks to finish.
    async fn shutdown_all(&mut self) {
        self.closing = true;
        if !self.sessions.is_empty() {
            info!(sessions = self.sessions.len(), "closing all sessions");
        }
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(session) = self.sessions.get(&id) {
                if matches!(session.state, SessionState::Connected(_)) {
                    let mut disconnect = Packet::new();
                    disconnect.add("DISCONNECT");
                    disconnect.add("SERVER_SHUTDOWN");
                    session.io.send(disconnect);
                }
            }
            self.close_session(id);
        }
        for handle in self.draining.drain(..) {
            let _ = handle.await;
        }
        self.nr_clients.store(0, Ordering::Relaxed);
        info!("lobby shut down");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn system_chat(text: &str) -> Packet {
    let mut chat = Packet::new();
    chat.add("CHAT");
    chat.add("");
    chat.add(text);
    chat.add("system");
    chat
}
