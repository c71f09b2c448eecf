//! The connection runtime
//!
//! A [`Connection`] owns the authenticated socket and three registries:
//! the call table correlating replies by serial, the refcounted match
//! table, and the export table of served objects. One reader task
//! demultiplexes inbound frames; writers serialize behind an async write
//! lock so outbound serials hit the wire in order.

use crate::address::BusAddress;
use crate::auth::{self, AuthMechanism};
use crate::error::{Error, Result};
use crate::interface::Interface;
use crate::match_rule::MatchRule;
use crate::service::{self, ObjectRegistry};
use crate::transport::Transport;
use bytes::{Buf, BytesMut};
use dbus_wire::{Message, MessageType, Signature, Value, WireError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

/// Per-call reply deadline unless the caller overrides it
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Closed,
}

struct MatchEntry {
    rule: MatchRule,
    count: usize,
}

struct Subscription {
    id: u64,
    /// `None` taps every inbound message
    rule: Option<MatchRule>,
    tx: mpsc::UnboundedSender<Message>,
}

pub(crate) struct ConnectionInner {
    transport: Transport,
    write_lock: tokio::sync::Mutex<()>,
    serial: AtomicU32,
    state: RwLock<ConnectionState>,
    unique_name: RwLock<Option<String>>,
    guid: String,
    is_bus: bool,
    default_timeout: Duration,
    calls: Mutex<HashMap<u32, oneshot::Sender<Result<Message>>>>,
    matches: Mutex<Vec<MatchEntry>>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    pub(crate) owned_names: Mutex<HashSet<String>>,
    pub(crate) registry: ObjectRegistry,
}

/// A handle to one bus (or peer-to-peer) connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

/// Removes the call-table slot if the caller gives up before the reply
struct CallSlotGuard {
    inner: Arc<ConnectionInner>,
    serial: u32,
}

impl Drop for CallSlotGuard {
    fn drop(&mut self) {
        self.inner.calls.lock().remove(&self.serial);
    }
}

/// A stream of messages delivered to one subscription
pub struct MessageStream {
    conn: Connection,
    id: u64,
    rule: Option<MatchRule>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageStream {
    /// The next matching message, or `None` once the connection closes
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.conn
            .inner
            .subscriptions
            .lock()
            .retain(|s| s.id != self.id);
        if let Some(rule) = self.rule.take() {
            // Release the bus-side match without blocking the drop
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let conn = self.conn.clone();
                handle.spawn(async move {
                    let _ = conn.remove_match(&rule).await;
                });
            }
        }
    }
}

impl Connection {
    /// Connect to the session bus with default options
    pub async fn session() -> Result<Self> {
        ConnectionBuilder::session().build().await
    }

    /// Connect to the system bus with default options
    pub async fn system() -> Result<Self> {
        ConnectionBuilder::system().build().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// The unique name the daemon assigned at `Hello`
    pub fn unique_name(&self) -> Option<String> {
        self.inner.unique_name.read().clone()
    }

    pub(crate) fn set_unique_name(&self, name: String) {
        *self.inner.unique_name.write() = Some(name);
    }

    /// The server GUID from authentication
    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    /// Whether the peer is a message bus (as opposed to a direct peer)
    pub fn is_bus(&self) -> bool {
        self.inner.is_bus
    }

    /// Whether fd passing was negotiated
    pub fn fd_passing(&self) -> bool {
        self.inner.transport.fd_passing()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state() != ConnectionState::Ready {
            return Err(Error::InvalidState("ready"));
        }
        Ok(())
    }

    /// Next outgoing serial: strictly increasing, wraps past zero
    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.inner.serial.fetch_add(1, Ordering::SeqCst);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Fire-and-forget send. Returns the assigned serial.
    pub async fn send(&self, mut msg: Message) -> Result<u32> {
        self.ensure_ready()?;
        if !msg.fds.is_empty() && !self.inner.transport.fd_passing() {
            return Err(Error::FdPassingDisabled);
        }
        let _guard = self.inner.write_lock.lock().await;
        if msg.serial == 0 {
            msg.serial = self.next_serial();
        }
        let frame = msg.encode()?;
        self.inner.transport.write_all(&frame, &msg.fds).await?;
        trace!(serial = msg.serial, "message sent");
        Ok(msg.serial)
    }

    /// One-shot method call with the connection's default timeout
    pub async fn call(&self, msg: Message) -> Result<Option<Message>> {
        self.call_with_timeout(msg, Some(self.inner.default_timeout))
            .await
    }

    /// One-shot method call.
    ///
    /// Resolves with the METHOD_RETURN, rejects with
    /// [`Error::MethodError`] on an ERROR reply, [`Error::Disconnected`]
    /// if the connection closes first, or [`Error::Timeout`] past the
    /// deadline. A call flagged `NO_REPLY_EXPECTED` resolves to `None`
    /// right after the write. Dropping the returned future cancels the
    /// call: the slot is removed and a late reply is discarded silently.
    pub async fn call_with_timeout(
        &self,
        mut msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        self.ensure_ready()?;
        if !msg.expects_reply() {
            self.send(msg).await?;
            return Ok(None);
        }
        if !msg.fds.is_empty() && !self.inner.transport.fd_passing() {
            return Err(Error::FdPassingDisabled);
        }

        let (tx, rx) = oneshot::channel();
        let slot;
        {
            let _guard = self.inner.write_lock.lock().await;
            let serial = self.next_serial();
            msg.serial = serial;
            let frame = msg.encode()?;
            self.inner.calls.lock().insert(serial, tx);
            // The guard exists before the first await so cancelling the
            // call mid-write still clears the slot.
            slot = CallSlotGuard {
                inner: Arc::clone(&self.inner),
                serial,
            };
            self.inner.transport.write_all(&frame, &msg.fds).await?;
        }
        let _slot = slot;
        let outcome = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(received) => received,
                Err(_) => return Err(Error::Timeout),
            },
            None => rx.await,
        };
        match outcome {
            Ok(result) => result.map(Some),
            // Sender dropped without resolution: the connection went away
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Register a match rule. The first registration of a rule sends
    /// `AddMatch` to the bus; further ones only bump a refcount.
    pub async fn add_match(&self, rule: MatchRule) -> Result<()> {
        let first = {
            let mut matches = self.inner.matches.lock();
            match matches.iter_mut().find(|e| e.rule == rule) {
                Some(entry) => {
                    entry.count += 1;
                    false
                }
                None => {
                    matches.push(MatchEntry {
                        rule: rule.clone(),
                        count: 1,
                    });
                    true
                }
            }
        };
        if first && self.inner.is_bus {
            if let Err(e) = self.bus_add_match(&rule.to_string()).await {
                self.release_match_entry(&rule);
                return Err(e);
            }
        }
        Ok(())
    }

    fn release_match_entry(&self, rule: &MatchRule) -> bool {
        let mut matches = self.inner.matches.lock();
        if let Some(at) = matches.iter().position(|e| &e.rule == rule) {
            matches[at].count -= 1;
            if matches[at].count == 0 {
                matches.remove(at);
                return true;
            }
        }
        false
    }

    /// Release one registration of a rule. The last release sends
    /// `RemoveMatch` to the bus.
    pub async fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        let last = self.release_match_entry(rule);
        if last && self.inner.is_bus && self.state() == ConnectionState::Ready {
            self.bus_remove_match(&rule.to_string()).await?;
        }
        Ok(())
    }

    /// Subscribe to messages matching `rule`
    pub async fn subscribe(&self, rule: MatchRule) -> Result<MessageStream> {
        self.ensure_ready()?;
        self.add_match(rule.clone()).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner.subscriptions.lock().push(Subscription {
            id,
            rule: Some(rule.clone()),
            tx,
        });
        Ok(MessageStream {
            conn: self.clone(),
            id,
            rule: Some(rule),
            rx,
        })
    }

    /// Low-level tap over every inbound message
    pub fn monitor(&self) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner.subscriptions.lock().push(Subscription {
            id,
            rule: None,
            tx,
        });
        MessageStream {
            conn: self.clone(),
            id,
            rule: None,
            rx,
        }
    }

    /// Export `interface` on the object at `path`.
    ///
    /// If an ObjectManager is enabled on an ancestor, `InterfacesAdded`
    /// is emitted for the addition.
    pub async fn export(&self, path: &str, interface: Interface) -> Result<()> {
        dbus_wire::validate_object_path(path)?;
        let interface = Arc::new(interface);
        self.inner.registry.export(path, Arc::clone(&interface));
        service::announce_added(self, path, &[interface]).await;
        Ok(())
    }

    /// Remove one interface (or the whole object when `interface` is
    /// `None`) from `path`, emitting `InterfacesRemoved` when managed.
    pub async fn unexport(&self, path: &str, interface: Option<&str>) -> Result<bool> {
        dbus_wire::validate_object_path(path)?;
        let removed = self.inner.registry.unexport(path, interface);
        if !removed.is_empty() {
            service::announce_removed(self, path, &removed).await;
        }
        Ok(!removed.is_empty())
    }

    /// Enable `org.freedesktop.DBus.ObjectManager` on `path`
    pub fn enable_object_manager(&self, path: &str) -> Result<()> {
        dbus_wire::validate_object_path(path)?;
        self.inner.registry.add_manager(path);
        Ok(())
    }

    /// Emit a declared signal from an exported interface. `member` may be
    /// the implementation id or the declared name; the declared name goes
    /// on the wire.
    pub async fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        values: &[Value],
    ) -> Result<u32> {
        let iface = self
            .inner
            .registry
            .lookup(path, interface)
            .ok_or_else(|| Error::UnknownMember {
                interface: interface.to_string(),
                member: member.to_string(),
            })?;
        let spec = iface.signal(member).ok_or_else(|| Error::UnknownMember {
            interface: interface.to_string(),
            member: member.to_string(),
        })?;
        let sig: Signature = values.iter().map(Value::ty).collect();
        if sig != spec.sig {
            return Err(Error::Wire(WireError::TypeMismatch {
                expected: spec.sig.to_string(),
                found: sig.to_string(),
            }));
        }
        let msg = Message::signal(path, interface, spec.name())?.with_body(values)?;
        self.send(msg).await
    }

    /// Close the connection. Pending calls fail with `Disconnected`.
    pub async fn disconnect(&self) {
        {
            let mut state = self.inner.state.write();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        self.inner.transport.shutdown();
        // The reader task observes EOF and finishes the teardown; do the
        // same work here in case it already exited.
        self.teardown();
    }

    fn teardown(&self) {
        *self.inner.state.write() = ConnectionState::Closed;
        let pending: Vec<_> = {
            let mut calls = self.inner.calls.lock();
            calls.drain().collect()
        };
        for (serial, tx) in pending {
            trace!(serial, "failing pending call on disconnect");
            let _ = tx.send(Err(Error::Disconnected));
        }
        self.inner.subscriptions.lock().clear();
        self.inner.matches.lock().clear();
        self.inner.owned_names.lock().clear();
    }

    /// Number of calls awaiting replies (diagnostics and tests)
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.lock().len()
    }
}

/// The reader task: framing, fd attachment and dispatch
async fn read_loop(conn: Connection) {
    let inner = &conn.inner;
    let mut buf = BytesMut::with_capacity(4096);
    let mut fd_queue: VecDeque<RawFd> = VecDeque::new();

    let reason: Option<Error> = loop {
        match Message::decode(&buf) {
            Ok((decoded, consumed)) => {
                buf.advance(consumed);
                match decoded {
                    Some(mut msg) => {
                        let want = msg.unix_fds as usize;
                        if want > fd_queue.len() {
                            error!(
                                want,
                                have = fd_queue.len(),
                                "message declared more fds than received"
                            );
                            break Some(Error::Disconnected);
                        }
                        msg.fds = fd_queue.drain(..want).collect();
                        dispatch(&conn, msg);
                    }
                    None => debug!("skipping frame of unknown type"),
                }
            }
            Err(WireError::Incomplete { .. }) => {
                match inner.transport.read_buf(&mut buf, &mut fd_queue).await {
                    Ok(0) => break None,
                    Ok(_) => {}
                    Err(e) if e.is_disconnect() => break None,
                    Err(e) => break Some(e),
                }
            }
            Err(e) => {
                // A frame we cannot decode poisons the stream
                error!(error = %e, "dropping connection on malformed frame");
                break Some(e.into());
            }
        }
    };

    match reason {
        None => debug!("connection closed"),
        Some(e) => warn!(error = %e, "connection failed"),
    }
    inner.transport.shutdown();
    conn.teardown();
}

/// Demultiplex one inbound message
fn dispatch(conn: &Connection, msg: Message) {
    let inner = &conn.inner;

    // Taps and signal subscriptions; closed receivers fall out here
    {
        let mut subs = inner.subscriptions.lock();
        subs.retain(|sub| {
            let wanted = match &sub.rule {
                None => true,
                Some(rule) => rule.matches(&msg),
            };
            if wanted {
                sub.tx.send(msg.clone()).is_ok()
            } else {
                true
            }
        });
    }

    match msg.message_type {
        MessageType::MethodReturn | MessageType::Error => {
            let reply_serial = match msg.reply_serial {
                Some(serial) => serial,
                None => return,
            };
            let slot = inner.calls.lock().remove(&reply_serial);
            match slot {
                Some(tx) => {
                    let outcome = if msg.message_type == MessageType::Error {
                        Err(error_from_reply(&msg))
                    } else {
                        Ok(msg)
                    };
                    let _ = tx.send(outcome);
                }
                // Cancelled or timed-out call: drop silently
                None => trace!(reply_serial, "discarding late reply"),
            }
        }
        MessageType::MethodCall => {
            let conn = conn.clone();
            tokio::spawn(async move {
                service::handle_call(conn, msg).await;
            });
        }
        MessageType::Signal => {
            trace!(
                member = msg.member.as_deref().unwrap_or(""),
                "signal delivered"
            );
        }
    }
}

fn error_from_reply(msg: &Message) -> Error {
    let name = msg
        .error_name
        .clone()
        .unwrap_or_else(|| crate::error::fault::FAILED.to_string());
    let text = msg
        .body_values()
        .ok()
        .and_then(|values| values.into_iter().next())
        .and_then(|v| match v {
            Value::Str(s) => Some(s),
            _ => None,
        })
        .unwrap_or_default();
    Error::MethodError {
        name,
        message: text,
    }
}

enum Target {
    Session,
    System,
    Address(BusAddress),
    PeerClient(tokio::net::UnixStream),
    PeerServer(tokio::net::UnixStream, String),
}

/// Configures and opens a [`Connection`]
pub struct ConnectionBuilder {
    target: Target,
    mechanisms: Vec<AuthMechanism>,
    negotiate_unix_fd: bool,
    default_timeout: Duration,
}

impl ConnectionBuilder {
    fn new(target: Target) -> Self {
        Self {
            target,
            mechanisms: AuthMechanism::default_order(),
            negotiate_unix_fd: true,
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Connect to the session bus
    pub fn session() -> Self {
        Self::new(Target::Session)
    }

    /// Connect to the system bus
    pub fn system() -> Self {
        Self::new(Target::System)
    }

    /// Connect to an explicit address string
    pub fn address(address: &str) -> Result<Self> {
        Ok(Self::new(Target::Address(BusAddress::parse(address)?)))
    }

    /// Client end of a direct peer-to-peer stream (no daemon, no Hello)
    pub fn peer_client(stream: tokio::net::UnixStream) -> Self {
        Self::new(Target::PeerClient(stream))
    }

    /// Server end of a direct peer-to-peer stream
    pub fn peer_server(stream: tokio::net::UnixStream, guid: Option<String>) -> Self {
        let guid = guid.unwrap_or_else(auth::generate_guid);
        Self::new(Target::PeerServer(stream, guid))
    }

    /// Mechanisms to offer, in order
    pub fn auth_mechanisms(mut self, mechanisms: &[AuthMechanism]) -> Self {
        self.mechanisms = mechanisms.to_vec();
        self
    }

    pub fn negotiate_unix_fd(mut self, negotiate: bool) -> Self {
        self.negotiate_unix_fd = negotiate;
        self
    }

    /// Default reply deadline for [`Connection::call`]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Open the transport, authenticate, spawn the reader and (on bus
    /// connections) say `Hello`.
    pub async fn build(self) -> Result<Connection> {
        let (transport, is_bus, server_guid) = match self.target {
            Target::Session => (Transport::connect(&BusAddress::session()?).await?, true, None),
            Target::System => (Transport::connect(&BusAddress::system()?).await?, true, None),
            Target::Address(addr) => (Transport::connect(&addr).await?, true, None),
            Target::PeerClient(stream) => (Transport::from_unix(stream), false, None),
            Target::PeerServer(stream, guid) => {
                (Transport::from_unix(stream), false, Some(guid))
            }
        };

        debug!(server = server_guid.is_some(), "authenticating");
        let auth_result = match &server_guid {
            Some(guid) => auth::authenticate_server(&transport, guid).await?,
            None => {
                auth::authenticate_client(&transport, &self.mechanisms, self.negotiate_unix_fd)
                    .await?
            }
        };
        transport.set_fd_passing(auth_result.unix_fd);

        let inner = Arc::new(ConnectionInner {
            transport,
            write_lock: tokio::sync::Mutex::new(()),
            serial: AtomicU32::new(1),
            state: RwLock::new(ConnectionState::Ready),
            unique_name: RwLock::new(None),
            guid: auth_result.guid,
            is_bus,
            default_timeout: self.default_timeout,
            calls: Mutex::new(HashMap::new()),
            matches: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            owned_names: Mutex::new(HashSet::new()),
            registry: ObjectRegistry::new(),
        });
        let conn = Connection { inner };
        tokio::spawn(read_loop(conn.clone()));

        if is_bus {
            let name = conn.hello().await?;
            debug!(unique_name = %name, "bus connection ready");
        }
        Ok(conn)
    }
}
