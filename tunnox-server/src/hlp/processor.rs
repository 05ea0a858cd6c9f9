//! # HLP Stream Processor
//!
//! One processor exists per logical HLP connection. To the session layer
//! it is an ordinary [`PacketStream`]; internally it bridges that stream
//! onto the push/poll request cycle with three bounded outbound fragment
//! queues (one per tunnel type), a queue of whole control packets
//! delivered via the `X-Tunnel-Package` response header, and a fragment
//! table reassembling inbound multi-fragment pushes.
//!
//! At most one poll may be parked per tunnel type; a newer poll preempts
//! the older one, which completes as a timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;
use tunnox_protocol::codec;
use tunnox_protocol::envelope::{FragmentBody, TunnelType};
use tunnox_protocol::fragment::{split, Fragment, Reassembler, ReassemblyOutcome};
use tunnox_protocol::packet::{PacketType, TransferPacket, TunnelDataPayload};

use crate::error::GatewayError;
use crate::stream::{PacketStream, StreamError};

// ─── Outcome of a Poll ──────────────────────────────────────────

/// What a parked poll resolved to.
#[derive(Debug)]
pub enum PollOutcome {
    /// At least one of the two slots is filled.
    Ready {
        fragment: Option<Fragment>,
        control: Option<TransferPacket>,
    },
    /// Deadline passed or a newer poll preempted this one.
    TimedOut,
    /// The processor closed while the poll was parked.
    Closed,
}

// ─── Internal Queues ────────────────────────────────────────────

/// Bounded fragment queue: mutex-protected deque plus wakeup pair.
struct WriteQueue {
    items: Mutex<VecDeque<Fragment>>,
    capacity: usize,
    /// Notified on push; consumed by parked polls.
    ready: Notify,
    /// Notified on pop; consumed by writers blocked on a full queue.
    space: Notify,
}

impl WriteQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    fn try_pop(&self) -> Option<Fragment> {
        let popped = self.items.lock().expect("write queue poisoned").pop_front();
        if popped.is_some() {
            self.space.notify_one();
        }
        popped
    }

    fn len(&self) -> usize {
        self.items.lock().expect("write queue poisoned").len()
    }
}

/// Preemption token handed to each parked poll.
struct PollToken {
    preempted: AtomicBool,
    notify: Notify,
}

impl PollToken {
    fn preempt(&self) {
        self.preempted.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

fn queue_index(tunnel_type: TunnelType) -> usize {
    match tunnel_type {
        TunnelType::Control => 0,
        TunnelType::Data => 1,
        TunnelType::Keepalive => 2,
    }
}

// ─── The Processor ──────────────────────────────────────────────

pub struct HlpProcessor {
    connection_id: String,
    client_id: AtomicI64,
    mapping_id: RwLock<String>,

    fragment_size: usize,

    /// Outbound fragment queues indexed by [`queue_index`].
    queues: [WriteQueue; 3],
    /// Whole control packets awaiting header delivery on a control poll.
    control_out: Mutex<VecDeque<TransferPacket>>,

    /// One parked poll per tunnel type; newer polls preempt older ones.
    pending_polls: Mutex<HashMap<TunnelType, Arc<PollToken>>>,

    /// Packets for the session layer's `read_packet`.
    inbound: Mutex<VecDeque<TransferPacket>>,
    inbound_ready: Notify,

    reassembler: Reassembler,

    closed: AtomicBool,
    closed_notify: Notify,
    last_activity: Mutex<Instant>,
}

impl HlpProcessor {
    pub fn new(
        connection_id: impl Into<String>,
        fragment_size: usize,
        queue_capacity: usize,
        inbound_byte_budget: usize,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            client_id: AtomicI64::new(0),
            mapping_id: RwLock::new(String::new()),
            fragment_size: fragment_size.max(1),
            queues: [
                WriteQueue::new(queue_capacity),
                WriteQueue::new(queue_capacity),
                WriteQueue::new(queue_capacity),
            ],
            control_out: Mutex::new(VecDeque::new()),
            pending_polls: Mutex::new(HashMap::new()),
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Notify::new(),
            reassembler: Reassembler::new(inbound_byte_budget),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn client_id(&self) -> i64 {
        self.client_id.load(Ordering::Acquire)
    }

    pub fn mapping_id(&self) -> String {
        self.mapping_id.read().expect("mapping_id poisoned").clone()
    }

    /// Adopts the client/mapping binding an envelope carries. Zero and
    /// empty values never clear an existing binding.
    pub fn bind_identity(&self, client_id: i64, mapping_id: &str) {
        if client_id != 0 {
            self.client_id.store(client_id, Ordering::Release);
        }
        if !mapping_id.is_empty() {
            let mut bound = self.mapping_id.write().expect("mapping_id poisoned");
            if bound.as_str() != mapping_id {
                *bound = mapping_id.to_string();
            }
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("last_activity poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last_activity poisoned")
            .elapsed()
    }

    /// Fragments buffered toward the next polls, across all types.
    pub fn queued_fragments(&self) -> usize {
        self.queues.iter().map(WriteQueue::len).sum()
    }

    // ── Inbound: push side ──

    /// Accepts the body of a `push` request, routing multi-fragment
    /// bodies through the reassembler. Returns `true` once a complete
    /// payload was handed to the upper layer.
    pub fn accept_body(
        &self,
        tunnel_type: TunnelType,
        body: &FragmentBody,
    ) -> Result<bool, GatewayError> {
        self.touch();
        if body.is_multi_fragment() {
            let fragment = body.to_fragment()?;
            let group_id = fragment.group_id.clone();
            let group = self.reassembler.add_fragment(fragment)?;
            match group.is_complete_and_reassemble() {
                ReassemblyOutcome::Reassembled(payload) => {
                    self.reassembler.remove_group(&group_id);
                    self.push_data(tunnel_type, payload)?;
                    Ok(true)
                }
                ReassemblyOutcome::Incomplete => Ok(false),
                ReassemblyOutcome::AlreadyReassembled => Ok(false),
            }
        } else {
            self.push_data(tunnel_type, body.decode_data()?)?;
            Ok(true)
        }
    }

    /// Enqueues a complete inbound payload for the session layer and
    /// wakes any reader blocked in `read_packet`.
    pub fn push_data(&self, tunnel_type: TunnelType, payload: Vec<u8>) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let packet = match tunnel_type {
            TunnelType::Data => TransferPacket::tunnel_data(&TunnelDataPayload {
                mapping_id: self.mapping_id(),
                data: payload,
            }),
            // A control-channel body is a complete encoded packet that was
            // too large for the envelope header.
            TunnelType::Control => codec::decode(&payload).map_err(GatewayError::Codec)?,
            TunnelType::Keepalive => TransferPacket::heartbeat(),
        };
        self.inbound
            .lock()
            .expect("inbound queue poisoned")
            .push_back(packet);
        self.inbound_ready.notify_one();
        Ok(())
    }

    /// Drops expired inbound fragment groups; returns their ids.
    pub fn sweep_fragments(&self, ttl: Duration) -> Vec<String> {
        self.reassembler.sweep_expired(ttl)
    }

    // ── Outbound: poll side ──

    fn pop_control(&self) -> Option<TransferPacket> {
        self.control_out
            .lock()
            .expect("control queue poisoned")
            .pop_front()
    }

    /// Parks until a fragment for `tunnel_type` and/or a pending control
    /// packet is available, the deadline passes, a newer poll preempts
    /// this one, or the processor closes. Control packets are only
    /// delivered on control polls.
    pub async fn handle_poll_request(
        &self,
        deadline: Instant,
        _request_id: &str,
        tunnel_type: TunnelType,
    ) -> PollOutcome {
        self.touch();

        let token = Arc::new(PollToken {
            preempted: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let previous = self
            .pending_polls
            .lock()
            .expect("pending polls poisoned")
            .insert(tunnel_type, Arc::clone(&token));
        if let Some(previous) = previous {
            previous.preempt();
        }

        let outcome = self.poll_loop(deadline, tunnel_type, &token).await;

        // Deregister, unless a newer poll already replaced us.
        let mut polls = self.pending_polls.lock().expect("pending polls poisoned");
        if let Some(current) = polls.get(&tunnel_type) {
            if Arc::ptr_eq(current, &token) {
                polls.remove(&tunnel_type);
            }
        }
        drop(polls);

        self.touch();
        outcome
    }

    async fn poll_loop(
        &self,
        deadline: Instant,
        tunnel_type: TunnelType,
        token: &PollToken,
    ) -> PollOutcome {
        let queue = &self.queues[queue_index(tunnel_type)];
        let wants_control = tunnel_type == TunnelType::Control;

        let sleep = tokio::time::sleep_until(deadline.into());
        tokio::pin!(sleep);

        loop {
            // Arm the wakeups before checking, so a push between the
            // check and the await is never lost.
            let ready = queue.ready.notified();
            let preempted = token.notify.notified();
            let closing = self.closed_notify.notified();
            tokio::pin!(ready, preempted, closing);

            if token.preempted.load(Ordering::Acquire) {
                return PollOutcome::TimedOut;
            }

            let fragment = queue.try_pop();
            let control = if wants_control { self.pop_control() } else { None };
            if fragment.is_some() || control.is_some() {
                return PollOutcome::Ready { fragment, control };
            }
            if self.is_closed() {
                return PollOutcome::Closed;
            }

            tokio::select! {
                _ = &mut sleep => return PollOutcome::TimedOut,
                _ = &mut preempted => return PollOutcome::TimedOut,
                _ = &mut closing => return PollOutcome::Closed,
                _ = &mut ready => {}
            }
        }
    }

    async fn enqueue(&self, tunnel_type: TunnelType, fragment: Fragment) -> Result<(), StreamError> {
        let queue = &self.queues[queue_index(tunnel_type)];
        loop {
            if self.is_closed() {
                return Err(StreamError::Closed);
            }
            let space = queue.space.notified();
            let closing = self.closed_notify.notified();
            tokio::pin!(space, closing);

            {
                let mut items = queue.items.lock().expect("write queue poisoned");
                if items.len() < queue.capacity {
                    items.push_back(fragment);
                    drop(items);
                    queue.ready.notify_one();
                    return Ok(());
                }
            }

            // Queue full: block the writer until a poll drains a slot.
            tokio::select! {
                _ = &mut space => {}
                _ = &mut closing => return Err(StreamError::Closed),
            }
        }
    }
}

// ─── PacketStream ───────────────────────────────────────────────

#[async_trait]
impl PacketStream for HlpProcessor {
    async fn read_packet(&self) -> Result<TransferPacket, StreamError> {
        loop {
            let ready = self.inbound_ready.notified();
            let closing = self.closed_notify.notified();
            tokio::pin!(ready, closing);

            if let Some(packet) = self
                .inbound
                .lock()
                .expect("inbound queue poisoned")
                .pop_front()
            {
                return Ok(packet);
            }
            if self.is_closed() {
                return Err(StreamError::Closed);
            }

            tokio::select! {
                _ = &mut ready => {}
                _ = &mut closing => return Err(StreamError::Closed),
            }
        }
    }

    async fn write_packet(&self, packet: TransferPacket) -> Result<usize, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let buffered = packet.payload.len();

        match packet.packet_type {
            PacketType::TunnelData => {
                // Only the forwarded bytes ride poll bodies; the mapping
                // context travels in the envelope the handler builds.
                let payload = packet
                    .parse_tunnel_data()
                    .ok_or_else(|| StreamError::Io("tunnel data payload unreadable".into()))?;
                for fragment in split(&payload.data, self.fragment_size) {
                    self.enqueue(TunnelType::Data, fragment).await?;
                }
            }
            PacketType::Heartbeat => {
                for fragment in split(&packet.payload, self.fragment_size) {
                    self.enqueue(TunnelType::Keepalive, fragment).await?;
                }
            }
            _ => {
                self.control_out
                    .lock()
                    .expect("control queue poisoned")
                    .push_back(packet);
                self.queues[queue_index(TunnelType::Control)]
                    .ready
                    .notify_one();
            }
        }
        Ok(buffered)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.queued_fragments();
        if dropped > 0 {
            warn!(
                connection_id = %self.connection_id,
                dropped, "closing HLP processor with undelivered fragments"
            );
        }
        self.closed_notify.notify_waiters();
        self.inbound_ready.notify_waiters();
        for queue in &self.queues {
            queue.ready.notify_waiters();
            queue.space.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
