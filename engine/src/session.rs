//! Reconciliation sessions.
//!
//! A [`Session`] drives the range protocol for one owner with one peer. It
//! performs no IO: the caller feeds it decoded [`Message`]s together with a
//! [`Replica`] (the local stores and clock) and sends whatever it returns.
//!
//! ```text
//! Idle ──start──► RangesSent ──ranges──► Comparing ──► Recursing ─┐
//!                                            ▲                     │
//!                                            └──────ranges─────────┘
//! Comparing ──(converged, entries pending)──► ExchangingEntries ──► Idle
//! Comparing ──(converged)──► Idle
//! any ──abort / error──► Aborted
//! ```
//!
//! A responder starts in `AwaitingPeerRanges` and otherwise follows the same
//! path. Advertisements are numbered within a cycle: round 0 opens one, so a
//! responder always restarts from scratch when the initiator retries, and
//! any other round must be the one the session is waiting for.
//! [`SessionSet`] multiplexes sessions of one connection by owner.

use crate::clock::{Clock, TimeSource};
use crate::error::{ClockError, Result, SyncError};
use crate::listeners::ErrorListeners;
use crate::message::{Message, Range};
use crate::payload::{Entry, PayloadStore};
use crate::protocol::{initial_ranges, process_ranges, SyncConfig};
use crate::store::EventStore;
use crate::timestamp::{BinaryTimestamp, OwnerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    RangesSent,
    AwaitingPeerRanges,
    Comparing,
    Recursing,
    ExchangingEntries,
    Aborted,
}

/// The local side of a reconciliation: stores, clock and wall time.
pub struct Replica<'a, S, P, T> {
    pub store: &'a mut S,
    pub payloads: &'a mut P,
    pub clock: &'a mut Clock,
    pub time: &'a T,
}

impl<'a, S, P, T> Replica<'a, S, P, T>
where
    S: EventStore,
    P: PayloadStore,
    T: TimeSource,
{
    pub fn new(store: &'a mut S, payloads: &'a mut P, clock: &'a mut Clock, time: &'a T) -> Self {
        Self {
            store,
            payloads,
            clock,
            time,
        }
    }

    fn now(&self) -> u64 {
        self.time.now_millis()
    }

    /// Load the entries for `timestamps`. Timestamps without a stored
    /// payload come back in the second list.
    fn load_entries(
        &self,
        owner: &OwnerId,
        timestamps: &[BinaryTimestamp],
    ) -> Result<(Vec<Entry>, Vec<BinaryTimestamp>)> {
        let mut entries = Vec::with_capacity(timestamps.len());
        let mut missing = Vec::new();
        for timestamp in timestamps {
            match self.payloads.read_payload(owner, timestamp)? {
                Some(payload) => entries.push(Entry::new(*timestamp, payload)),
                None => {
                    warn!(%owner, ?timestamp, "no payload stored for timestamp");
                    missing.push(*timestamp);
                }
            }
        }
        Ok((entries, missing))
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Reconciliation cycles started
    pub cycles: usize,
    /// Range advertisements processed
    pub rounds: usize,
    pub entries_sent: usize,
    pub entries_received: usize,
    /// Entries refused by the clock
    pub entries_rejected: usize,
    /// Requested entries the peer could not serve
    pub entries_unavailable: usize,
}

/// What handling one message produced.
#[derive(Debug, Default)]
pub struct Handled {
    /// Messages to send to the peer, in order
    pub messages: Vec<Message>,
    /// Entries newly stored locally
    pub applied: Vec<Entry>,
    /// Clock failures for entries that were refused
    pub rejected: Vec<ClockError>,
    /// A reconciliation cycle finished with this message
    pub completed: bool,
}

/// Reconciliation state for one owner and one peer.
#[derive(Debug, Clone)]
pub struct Session {
    owner: OwnerId,
    role: Role,
    state: SessionState,
    config: SyncConfig,
    /// Round of the next advertisement expected from the peer
    round: u32,
    outstanding: BTreeSet<BinaryTimestamp>,
    exchanged: bool,
    verify: bool,
    verifying: bool,
    last_activity: u64,
    stats: SessionStats,
}

impl Session {
    pub fn new(owner: OwnerId, role: Role, config: SyncConfig) -> Self {
        let state = match role {
            Role::Initiator => SessionState::Idle,
            Role::Responder => SessionState::AwaitingPeerRanges,
        };
        Self {
            owner,
            role,
            state,
            config,
            round: 0,
            outstanding: BTreeSet::new(),
            exchanged: false,
            verify: true,
            verifying: false,
            last_activity: 0,
            stats: SessionStats::default(),
        }
    }

    pub fn initiator(owner: OwnerId, config: SyncConfig) -> Self {
        Self::new(owner, Role::Initiator, config)
    }

    pub fn responder(owner: OwnerId, config: SyncConfig) -> Self {
        Self::new(owner, Role::Responder, config)
    }

    /// Whether an initiator re-runs the top-level comparison after entries
    /// were exchanged. On by default.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    /// Timestamps requested from the peer and not yet received.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether the session is waiting on the peer mid-cycle.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.state,
            SessionState::RangesSent
                | SessionState::Comparing
                | SessionState::Recursing
                | SessionState::ExchangingEntries
        )
    }

    /// Open a reconciliation cycle with the top-level advertisement.
    pub fn start<S, P, T>(&mut self, replica: &mut Replica<'_, S, P, T>) -> Result<Vec<Message>>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        match self.state {
            SessionState::Aborted => return Err(SyncError::Aborted),
            SessionState::Idle if self.role == Role::Initiator => {}
            state => {
                return Err(SyncError::UnexpectedMessage {
                    state,
                    message: "start",
                })
            }
        }
        self.last_activity = replica.now();
        self.stats.cycles += 1;
        self.exchanged = false;
        self.verifying = false;
        let message = self.open_cycle(replica).inspect_err(|e| self.fail(e))?;
        debug!(owner = %self.owner, "reconciliation started");
        Ok(vec![message])
    }

    /// Process one message from the peer.
    ///
    /// Errors abort the session, except entries refused by the clock which
    /// are reported in [`Handled::rejected`].
    pub fn handle<S, P, T>(
        &mut self,
        replica: &mut Replica<'_, S, P, T>,
        message: Message,
    ) -> Result<Handled>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        if self.state == SessionState::Aborted {
            return Err(SyncError::Aborted);
        }
        self.last_activity = replica.now();

        let result = match message {
            Message::Ranges { round, ranges, .. } => self.on_ranges(replica, round, &ranges),
            Message::Entries {
                entries,
                need,
                missing,
                ..
            } => self.on_entries(replica, entries, &need, &missing),
            Message::Abort { .. } => {
                info!(owner = %self.owner, "peer aborted reconciliation");
                self.reset();
                self.state = SessionState::Aborted;
                return Ok(Handled::default());
            }
        };
        result.inspect_err(|e| self.fail(e))
    }

    /// Give up on the current cycle after the peer went quiet. Stored data
    /// is kept; the session returns to its starting state.
    pub fn timeout(&mut self) {
        if self.state == SessionState::Aborted {
            return;
        }
        debug!(owner = %self.owner, state = ?self.state, "reconciliation timed out");
        self.reset();
    }

    /// Tear the session down, returning the notice for the peer.
    pub fn abort(&mut self) -> Message {
        self.reset();
        self.state = SessionState::Aborted;
        Message::Abort { owner: self.owner }
    }

    fn open_cycle<S, P, T>(&mut self, replica: &mut Replica<'_, S, P, T>) -> Result<Message>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        let ranges = initial_ranges(&*replica.store, &self.owner, &self.config)?;
        self.round = 1;
        self.state = SessionState::RangesSent;
        Ok(Message::Ranges {
            owner: self.owner,
            round: 0,
            ranges,
        })
    }

    fn on_ranges<S, P, T>(
        &mut self,
        replica: &mut Replica<'_, S, P, T>,
        round: u32,
        ranges: &[Range],
    ) -> Result<Handled>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        match (self.role, self.state) {
            // Whatever the responder was doing belongs to a cycle the peer
            // has abandoned.
            (Role::Responder, _) if round == 0 => {
                self.outstanding.clear();
                self.exchanged = false;
                self.stats.cycles += 1;
            }
            (Role::Initiator, SessionState::RangesSent | SessionState::Recursing)
            | (Role::Responder, SessionState::Recursing) => {
                if round != self.round {
                    return Err(SyncError::UnexpectedRound {
                        expected: self.round,
                        actual: round,
                    });
                }
            }
            (_, state) => {
                return Err(SyncError::UnexpectedMessage {
                    state,
                    message: "ranges",
                })
            }
        }

        let incoming_converged = ranges.iter().all(Range::is_skip);
        let mut handled = Handled::default();

        if self.verifying {
            if incoming_converged {
                info!(owner = %self.owner, "replicas verified identical");
            } else {
                warn!(owner = %self.owner, "fingerprints still differ after exchange");
            }
            self.finish(&mut handled);
            return Ok(handled);
        }

        self.state = SessionState::Comparing;
        // Each side handles every other round, so this is how many
        // advertisements this side has already answered in the cycle.
        let depth = (round / 2) as usize;
        let outcome = process_ranges(&*replica.store, &self.owner, ranges, depth, &self.config)?;
        self.round = round.saturating_add(2);
        self.stats.rounds += 1;

        let (entries, missing) = replica.load_entries(&self.owner, &outcome.send)?;
        if !entries.is_empty() || !outcome.need.is_empty() {
            self.exchanged = true;
        }
        if !entries.is_empty() || !outcome.need.is_empty() || !missing.is_empty() {
            self.stats.entries_sent += entries.len();
            self.outstanding.extend(outcome.need.iter().copied());
            handled.messages.push(Message::Entries {
                owner: self.owner,
                entries,
                need: outcome.need.clone(),
                missing,
            });
        }

        let converged = outcome.is_converged();
        if !incoming_converged {
            handled.messages.push(Message::Ranges {
                owner: self.owner,
                round: round.saturating_add(1),
                ranges: outcome.ranges,
            });
        }
        if incoming_converged || converged {
            self.ranges_done(replica, &mut handled)?;
        } else {
            self.state = SessionState::Recursing;
        }
        debug!(
            owner = %self.owner,
            round,
            state = ?self.state,
            "processed range advertisement"
        );
        Ok(handled)
    }

    fn on_entries<S, P, T>(
        &mut self,
        replica: &mut Replica<'_, S, P, T>,
        entries: Vec<Entry>,
        need: &[BinaryTimestamp],
        missing: &[BinaryTimestamp],
    ) -> Result<Handled>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        let mut handled = Handled::default();
        let mut fresh = Vec::with_capacity(entries.len());

        for entry in entries {
            self.outstanding.remove(&entry.timestamp);
            if replica.store.contains(&self.owner, &entry.timestamp) {
                continue;
            }
            match replica
                .clock
                .receive(replica.time, &entry.timestamp.to_timestamp())
            {
                Ok(_) => fresh.push(entry),
                Err(e) => {
                    warn!(owner = %self.owner, timestamp = ?entry.timestamp, error = %e, "rejected entry");
                    self.stats.entries_rejected += 1;
                    handled.rejected.push(e);
                }
            }
        }

        if !fresh.is_empty() {
            for entry in &fresh {
                replica
                    .payloads
                    .write_payload(&self.owner, entry.timestamp, entry.payload.clone())?;
            }
            let timestamps: Vec<BinaryTimestamp> = fresh.iter().map(|e| e.timestamp).collect();
            replica.store.insert_batch(&self.owner, &timestamps)?;
            self.stats.entries_received += fresh.len();
            self.exchanged = true;
            debug!(owner = %self.owner, count = fresh.len(), "applied entries");
        }
        handled.applied = fresh;

        for timestamp in missing {
            if self.outstanding.remove(timestamp) {
                warn!(owner = %self.owner, ?timestamp, "peer cannot serve requested entry");
                self.stats.entries_unavailable += 1;
            }
        }

        if !need.is_empty() {
            let (reply, missing) = replica.load_entries(&self.owner, need)?;
            if !reply.is_empty() || !missing.is_empty() {
                self.stats.entries_sent += reply.len();
                handled.messages.push(Message::Entries {
                    owner: self.owner,
                    entries: reply,
                    need: Vec::new(),
                    missing,
                });
            }
        }

        if self.state == SessionState::ExchangingEntries && self.outstanding.is_empty() {
            self.complete(replica, &mut handled)?;
        }
        Ok(handled)
    }

    fn ranges_done<S, P, T>(
        &mut self,
        replica: &mut Replica<'_, S, P, T>,
        handled: &mut Handled,
    ) -> Result<()>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        if self.outstanding.is_empty() {
            self.complete(replica, handled)
        } else {
            self.state = SessionState::ExchangingEntries;
            Ok(())
        }
    }

    fn complete<S, P, T>(
        &mut self,
        replica: &mut Replica<'_, S, P, T>,
        handled: &mut Handled,
    ) -> Result<()>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        if self.role == Role::Initiator && self.verify && self.exchanged && !self.verifying {
            self.verifying = true;
            let message = self.open_cycle(replica)?;
            handled.messages.push(message);
            return Ok(());
        }
        self.finish(handled);
        Ok(())
    }

    fn finish(&mut self, handled: &mut Handled) {
        debug!(owner = %self.owner, stats = ?self.stats, "reconciliation complete");
        self.reset();
        handled.completed = true;
    }

    fn reset(&mut self) {
        self.state = match self.role {
            Role::Initiator => SessionState::Idle,
            Role::Responder => SessionState::AwaitingPeerRanges,
        };
        self.round = 0;
        self.outstanding.clear();
        self.exchanged = false;
        self.verifying = false;
    }

    fn fail(&mut self, error: &SyncError) {
        warn!(owner = %self.owner, state = ?self.state, error = %error, "reconciliation aborted");
        self.reset();
        self.state = SessionState::Aborted;
    }
}

/// The sessions of one peer connection, keyed by owner.
#[derive(Debug)]
pub struct SessionSet {
    config: SyncConfig,
    verify: bool,
    sessions: HashMap<OwnerId, Session>,
    listeners: ErrorListeners,
}

impl SessionSet {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            verify: true,
            sessions: HashMap::new(),
            listeners: ErrorListeners::new(),
        }
    }

    /// Report errors to `listeners` instead of a private registry.
    pub fn with_listeners(mut self, listeners: ErrorListeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn listeners(&self) -> &ErrorListeners {
        &self.listeners
    }

    pub fn get(&self, owner: &OwnerId) -> Option<&Session> {
        self.sessions.get(owner)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Start reconciling `owner` as the initiator.
    pub fn start<S, P, T>(
        &mut self,
        replica: &mut Replica<'_, S, P, T>,
        owner: OwnerId,
    ) -> Result<Vec<Message>>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        let replace = match self.sessions.get(&owner) {
            Some(session) => !session.is_in_progress(),
            None => true,
        };
        if replace {
            let session = Session::initiator(owner, self.config).with_verification(self.verify);
            self.sessions.insert(owner, session);
        }
        let result = match self.sessions.get_mut(&owner) {
            Some(session) => session.start(replica),
            None => Err(SyncError::Aborted),
        };
        result.inspect_err(|e| {
            self.listeners.notify(e);
        })
    }

    /// Route a decoded message to its owner's session, creating a responder
    /// on first contact.
    pub fn handle<S, P, T>(
        &mut self,
        replica: &mut Replica<'_, S, P, T>,
        message: Message,
    ) -> Result<Handled>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        let owner = *message.owner();
        let (config, verify) = (self.config, self.verify);
        let session = self
            .sessions
            .entry(owner)
            .or_insert_with(|| Session::responder(owner, config).with_verification(verify));
        // Either side may open the next cycle, including after an abort.
        let reopen = session.state() == SessionState::Aborted
            || (session.role() == Role::Initiator && !session.is_in_progress());
        if reopen && matches!(message, Message::Ranges { round: 0, .. }) {
            *session = Session::responder(owner, config).with_verification(verify);
        }

        match session.handle(replica, message) {
            Ok(handled) => {
                for rejected in &handled.rejected {
                    self.listeners.notify(&SyncError::Clock(*rejected));
                }
                Ok(handled)
            }
            Err(e) => {
                self.listeners.notify(&e);
                Err(e)
            }
        }
    }

    /// Decode a frame and handle it.
    ///
    /// A frame that cannot be decoded cannot be attributed to an owner; the
    /// caller is expected to answer with [`SessionSet::abort_all`].
    pub fn handle_frame<S, P, T>(
        &mut self,
        replica: &mut Replica<'_, S, P, T>,
        frame: &[u8],
    ) -> Result<Handled>
    where
        S: EventStore,
        P: PayloadStore,
        T: TimeSource,
    {
        match Message::decode(frame) {
            Ok(message) => self.handle(replica, message),
            Err(e) => {
                let error = SyncError::Decode(e);
                warn!(error = %error, "undecodable frame");
                self.listeners.notify(&error);
                Err(error)
            }
        }
    }

    /// Abort the session for `owner`, returning the notice for the peer if it
    /// was live.
    pub fn abort(&mut self, owner: &OwnerId) -> Option<Message> {
        self.sessions
            .get_mut(owner)
            .filter(|s| s.state() != SessionState::Aborted)
            .map(Session::abort)
    }

    /// Abort every live session, returning the notices for the peer.
    pub fn abort_all(&mut self) -> Vec<Message> {
        self.sessions
            .values_mut()
            .filter(|s| s.state() != SessionState::Aborted)
            .map(Session::abort)
            .collect()
    }

    /// Time out sessions that have been mid-cycle without activity for at
    /// least `timeout_millis`. Returns the affected owners.
    pub fn expire(&mut self, now: u64, timeout_millis: u64) -> Vec<OwnerId> {
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            if session.is_in_progress() && now.saturating_sub(session.last_activity()) >= timeout_millis
            {
                session.timeout();
                expired.push(*session.owner());
            }
        }
        expired
    }
}
