//! Presence directory
//!
//! Turns the raw multicast datagram stream into a roster of nearby devices
//! and runs the call offer/accept handshake.
//!
//! ## Protocol
//!
//! ```text
//! Device X                               Device Y
//!   │                                       │
//!   │──── NotifyState (every 2 s) ─────────>│  Y adds X to its roster
//!   │<─── NotifyState (reply, debounced) ───│  X adds Y to its roster
//!   │                                       │
//!   │──── OfferCall (every 1 s) ───────────>│  Y: CallEvent::Offered(X)
//!   │──── OfferCall ───────────────────────>│
//!   │<─── AcceptCall ───────────────────────│  X: CallEvent::Accepted(Y)
//!   │                                       │
//!   │  call_accepted() stops the offers     │
//!   │<════ signaling stream (TCP) ═════════>│
//! ```
//!
//! All protocol state lives in [`PresenceState`], which is driven by a single
//! task. Control methods on [`PresenceDirectory`] are queued into that task,
//! so the roster never has more than one writer.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PresenceConfig;
use crate::network::discovery::resolve_local_address;
use crate::network::multicast::{Datagram, GroupTransport, PresenceLink};
use crate::protocol::{PresenceKind, PresenceMessage};

/// Call events queued for the application before it drains them
const CALL_EVENT_CAPACITY: usize = 32;

/// Last known state of a nearby device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: Ipv4Addr,
    pub busy: bool,
    pub last_seen: Instant,
}

/// Known peers, one record per address, in discovery order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    peers: Vec<PeerRecord>,
}

impl Roster {
    /// Insert or replace the record for `record.address`.
    /// Returns true if the address was not known before.
    pub fn upsert(&mut self, record: PeerRecord) -> bool {
        match self.peers.iter_mut().find(|p| p.address == record.address) {
            Some(existing) => {
                *existing = record;
                false
            }
            None => {
                self.peers.push(record);
                true
            }
        }
    }

    pub fn get(&self, address: Ipv4Addr) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.address == address)
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop peers not seen within `ttl`. Returns the number removed.
    pub fn prune(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.peers.len();
        self.peers
            .retain(|p| now.saturating_duration_since(p.last_seen) < ttl);
        before - self.peers.len()
    }
}

/// Call handshake notification for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// The peer wants to call us; the application decides whether to accept
    Offered(PeerRecord),
    /// The peer accepted our offer; we are the caller
    Accepted(PeerRecord),
}

impl CallEvent {
    pub fn peer(&self) -> &PeerRecord {
        match self {
            CallEvent::Offered(peer) | CallEvent::Accepted(peer) => peer,
        }
    }

    pub fn we_were_offered(&self) -> bool {
        matches!(self, CallEvent::Offered(_))
    }
}

/// Result of processing one incoming datagram
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Message to send back to the group
    pub reply: Option<PresenceMessage>,
    /// Event for the application
    pub event: Option<CallEvent>,
    /// The roster was modified
    pub roster_changed: bool,
}

/// Protocol state of one directory, free of I/O
pub struct PresenceState {
    local_address: Ipv4Addr,
    announce_interval: Duration,
    peer_ttl: Option<Duration>,
    roster: Roster,
    busy: bool,
    /// Time of our last NotifyState, for the debounce
    last_notify: Option<Instant>,
    /// Peer we are currently offering a call to
    offering: Option<Ipv4Addr>,
    /// Peer whose offer we saw most recently
    last_offerer: Option<Ipv4Addr>,
}

impl PresenceState {
    pub fn new(local_address: Ipv4Addr, config: &PresenceConfig) -> Self {
        Self {
            local_address,
            announce_interval: config.announce_interval(),
            peer_ttl: config.peer_ttl(),
            roster: Roster::default(),
            busy: false,
            last_notify: None,
            offering: None,
            last_offerer: None,
        }
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.local_address
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn is_offering(&self) -> bool {
        self.offering.is_some()
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Our NotifyState, unless one went out less than an interval ago
    pub fn announce(&mut self, now: Instant) -> Option<PresenceMessage> {
        if let Some(last) = self.last_notify {
            if now.saturating_duration_since(last) < self.announce_interval {
                return None;
            }
        }
        self.last_notify = Some(now);
        Some(PresenceMessage::notify(self.local_address, self.busy))
    }

    /// Apply one incoming datagram
    pub fn process(&mut self, datagram: &Datagram, now: Instant) -> Outcome {
        if datagram.sender.ip() == IpAddr::V4(self.local_address) {
            return Outcome::default();
        }

        let message = match PresenceMessage::decode(&datagram.message) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Can't parse presence message from {}: {}", datagram.sender, e);
                return Outcome::default();
            }
        };

        if message.address == self.local_address {
            return Outcome::default();
        }

        tracing::debug!("Presence {:?} from {}", message.kind, message.address);

        let record = PeerRecord {
            address: message.address,
            busy: message.busy,
            last_seen: now,
        };
        if self.roster.upsert(record.clone()) {
            tracing::info!("Discovered peer {}", record.address);
        }

        let mut outcome = Outcome {
            roster_changed: true,
            ..Default::default()
        };

        match message.kind {
            PresenceKind::Notify => {
                outcome.reply = self.announce(now);
            }
            PresenceKind::OfferCall => {
                if !message.is_for(self.local_address) {
                    return outcome;
                }
                if self.offering == Some(record.address) {
                    // Both sides offered at once: the higher address stays caller
                    if self.local_address > record.address {
                        tracing::info!("Ignoring crossed offer from {}, keeping caller role", record.address);
                        return outcome;
                    }
                    tracing::info!("Crossed offer from {}, yielding caller role", record.address);
                    self.offering = None;
                }
                self.last_offerer = Some(record.address);
                outcome.event = Some(CallEvent::Offered(record));
            }
            PresenceKind::AcceptCall => {
                // Only the peer we are calling can accept
                if message.is_for(self.local_address) && self.offering == Some(record.address) {
                    outcome.event = Some(CallEvent::Accepted(record));
                } else {
                    tracing::debug!("Ignoring AcceptCall from {}, no offer to it", record.address);
                }
            }
        }

        outcome
    }

    /// Start offering a call to `target`; returns the first OfferCall
    pub fn offer(&mut self, target: Ipv4Addr) -> PresenceMessage {
        self.offering = Some(target);
        PresenceMessage::offer_call(self.local_address, target)
    }

    /// The OfferCall to retransmit, while an offer is active
    pub fn retry_offer(&self) -> Option<PresenceMessage> {
        self.offering
            .map(|target| PresenceMessage::offer_call(self.local_address, target))
    }

    /// Stop retransmitting the current offer
    pub fn call_accepted(&mut self) {
        self.offering = None;
    }

    /// AcceptCall addressed to the most recent offerer, if there is one
    pub fn accept(&self) -> Option<PresenceMessage> {
        self.last_offerer
            .map(|offerer| PresenceMessage::accept_call(self.local_address, Some(offerer)))
    }

    /// Expire stale peers if a TTL is configured. Returns true if any were removed.
    pub fn prune(&mut self, now: Instant) -> bool {
        match self.peer_ttl {
            Some(ttl) => {
                let removed = self.roster.prune(now, ttl);
                if removed > 0 {
                    tracing::info!("Expired {} stale peer(s)", removed);
                }
                removed > 0
            }
            None => false,
        }
    }
}

/// Requests from directory handles to the owning task
#[derive(Debug)]
enum Command {
    OfferCall(Ipv4Addr),
    CallAccepted,
    AcceptCall,
    SetBusy(bool),
}

/// Running presence directory
pub struct PresenceDirectory {
    local_address: Ipv4Addr,
    commands: mpsc::UnboundedSender<Command>,
    roster: watch::Receiver<Roster>,
    link: Arc<dyn PresenceLink>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PresenceDirectory {
    /// Resolve the local address, join the multicast group and start the
    /// directory task.
    ///
    /// Only address resolution failure is fatal. A group that cannot be joined
    /// yet is retried on every announce tick.
    pub fn start(
        config: &PresenceConfig,
    ) -> crate::Result<(Self, mpsc::Receiver<CallEvent>)> {
        let local_address = resolve_local_address(config)?;
        tracing::info!("Local presence address {}", local_address);

        let transport = Arc::new(GroupTransport::new(config.clone()));
        Self::with_link(local_address, config, transport)
    }

    /// Start a directory on an arbitrary datagram link.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_link(
        local_address: Ipv4Addr,
        config: &PresenceConfig,
        link: Arc<dyn PresenceLink>,
    ) -> crate::Result<(Self, mpsc::Receiver<CallEvent>)> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(CALL_EVENT_CAPACITY);
        let (roster_tx, roster_rx) = watch::channel(Roster::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            state: PresenceState::new(local_address, config),
            link: link.clone(),
            incoming: None,
            roster: roster_tx,
            events: events_tx,
        };
        let task = tokio::spawn(driver.run(
            commands_rx,
            shutdown_rx,
            config.announce_interval(),
            config.offer_retry_interval(),
        ));

        let directory = Self {
            local_address,
            commands: commands_tx,
            roster: roster_rx,
            link,
            shutdown: shutdown_tx,
            task,
        };
        Ok((directory, events_rx))
    }

    /// Address this device advertises
    pub fn local_address(&self) -> Ipv4Addr {
        self.local_address
    }

    /// Current roster snapshot
    pub fn roster(&self) -> Roster {
        self.roster.borrow().clone()
    }

    /// Observe roster updates
    pub fn subscribe_roster(&self) -> watch::Receiver<Roster> {
        self.roster.clone()
    }

    /// Offer a call to `peer`, retransmitting until [`call_accepted`](Self::call_accepted)
    pub fn send_offer_call(&self, peer: &PeerRecord) -> crate::Result<()> {
        self.command(Command::OfferCall(peer.address))
    }

    /// Stop retransmitting the current offer
    pub fn call_accepted(&self) -> crate::Result<()> {
        self.command(Command::CallAccepted)
    }

    /// Accept the most recent offer with a single AcceptCall
    pub fn send_accept_call(&self) -> crate::Result<()> {
        self.command(Command::AcceptCall)
    }

    /// Busy flag carried in our announcements
    pub fn set_busy(&self, busy: bool) -> crate::Result<()> {
        self.command(Command::SetBusy(busy))
    }

    /// Check if the directory task is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the directory task and close the link. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::info!("Closing presence directory");
        }
        self.link.close();
    }

    fn command(&self, command: Command) -> crate::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| crate::Error::DirectoryClosed)
    }
}

impl Drop for PresenceDirectory {
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the directory task
struct Driver {
    state: PresenceState,
    link: Arc<dyn PresenceLink>,
    incoming: Option<BoxStream<'static, Datagram>>,
    roster: watch::Sender<Roster>,
    events: mpsc::Sender<CallEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: watch::Receiver<bool>,
        announce_interval: Duration,
        retry_interval: Duration,
    ) {
        self.reopen();

        let mut announce = tokio::time::interval(announce_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = tokio::time::interval(retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Commands win over timers so call_accepted() takes effect
                // before the next retransmission
                biased;

                _ = shutdown.changed() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &mut retry),
                    None => break,
                },

                datagram = next_datagram(&mut self.incoming) => match datagram {
                    Some(datagram) => {
                        let outcome = self.state.process(&datagram, Instant::now());
                        self.apply(outcome);
                    }
                    None => {
                        tracing::warn!("Presence link closed, reopening on next announce");
                        self.incoming = None;
                    }
                },

                _ = announce.tick() => self.on_announce_tick(),

                _ = retry.tick(), if self.state.is_offering() => {
                    if let Some(message) = self.state.retry_offer() {
                        tracing::debug!("Resending offer to {:?}", message.target);
                        self.send(&message);
                    }
                }
            }
        }

        self.link.close();
        tracing::debug!("Presence directory task stopped");
    }

    fn on_announce_tick(&mut self) {
        if self.incoming.is_none() {
            self.reopen();
        }
        // Debounce against when the announcement actually goes out, not
        // when the tick was due
        let now = Instant::now();
        if self.state.prune(now) {
            self.publish_roster();
        }
        if let Some(message) = self.state.announce(now) {
            self.send(&message);
        }
    }

    fn handle_command(&mut self, command: Command, retry: &mut tokio::time::Interval) {
        match command {
            Command::OfferCall(target) => {
                tracing::info!("Offering call to {}", target);
                let message = self.state.offer(target);
                self.send(&message);
                retry.reset();
            }
            Command::CallAccepted => {
                tracing::info!("Call accepted, stopping offers");
                self.state.call_accepted();
            }
            Command::AcceptCall => match self.state.accept() {
                Some(message) => {
                    tracing::info!("Accepting call from {:?}", message.target);
                    self.send(&message);
                }
                None => tracing::warn!("No call offer to accept"),
            },
            Command::SetBusy(busy) => self.state.set_busy(busy),
        }
    }

    fn apply(&mut self, outcome: Outcome) {
        if outcome.roster_changed {
            self.publish_roster();
        }
        if let Some(reply) = outcome.reply {
            self.send(&reply);
        }
        if let Some(event) = outcome.event {
            if let Err(e) = self.events.try_send(event) {
                tracing::warn!("Dropping call event: {}", e);
            }
        }
    }

    fn reopen(&mut self) {
        match self.link.open() {
            Ok(stream) => self.incoming = Some(stream),
            Err(e) => tracing::warn!("Presence link unavailable: {}", e),
        }
    }

    fn send(&self, message: &PresenceMessage) {
        match message.encode() {
            Ok(text) => self.link.send(&text),
            Err(e) => tracing::warn!("Can't encode presence message: {}", e),
        }
    }

    fn publish_roster(&self) {
        self.roster.send_replace(self.state.roster().clone());
    }
}

/// Next datagram, or pending forever while the link is down
async fn next_datagram(incoming: &mut Option<BoxStream<'static, Datagram>>) -> Option<Datagram> {
    match incoming {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
