//! Announce scheduler - the single run loop driving the pipeline
//!
//! One task owns the registry, the ACK manager and the per-target sequence
//! counters. Periodic ticks, retry deadlines, inbound acknowledgments and
//! control requests are all serialized through one `tokio::select!`, so no
//! shared state needs a lock. Only the socket receive path runs in its own
//! task, feeding decoded acknowledgments through a single-consumer queue.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::ack_manager::{AckManager, AckOutcome, RetryAction};
use crate::codec::PacketCodec;
use crate::config::AnnouncerConfig;
use crate::contracts::{AnnounceEvent, GlobalProperties, ReceiverTarget, Record, RecordId, TargetId};
use crate::errors::{RecsyncError, Result};
use crate::registry::RecordRegistry;
use crate::transport::{canonical_addr, receive_loop, route_for, send_packet, InboundAck, Transport, UdpTransport};

/// Capacity of the control request queue
const CONTROL_QUEUE_DEPTH: usize = 32;

/// A receiver target and its sequence counter
#[derive(Debug)]
struct TargetSlot {
    target: ReceiverTarget,
    /// Destination handed to the socket; differs from `target.address` when
    /// an IPv6 socket reaches an IPv4 receiver
    route: SocketAddr,
    next_sequence: u32,
}

impl TargetSlot {
    fn new(address: SocketAddr, local: SocketAddr) -> Self {
        let address = canonical_addr(address);
        Self {
            target: ReceiverTarget::new(address),
            route: route_for(local, address),
            next_sequence: rand::random(),
        }
    }

    fn allocate(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }
}

enum ControlRequest {
    Register {
        record: Record,
        reply: oneshot::Sender<Result<RecordId>>,
    },
    AddGlobalProperty {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle for talking to a running [`Announcer`].
///
/// Requests are served by the run loop; issued before `run` starts they wait
/// until it does.
#[derive(Clone)]
pub struct AnnouncerHandle {
    control: mpsc::Sender<ControlRequest>,
}

impl AnnouncerHandle {
    /// Register a record while running; triggers an immediate announce.
    ///
    /// # Errors
    /// `DuplicateRecord`, `InvalidRecord` or `PacketTooLarge` from the
    /// registration itself, `Stopped` if the run loop has ended.
    pub async fn register(&self, record: Record) -> Result<RecordId> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlRequest::Register { record, reply })
            .await
            .map_err(|_| RecsyncError::Stopped)?;
        response.await.map_err(|_| RecsyncError::Stopped)?
    }

    /// Global properties are fixed once running; always fails with
    /// `AlreadyRunning` while the loop is active.
    pub async fn add_global_property(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlRequest::AddGlobalProperty {
                key: key.into(),
                value: value.into(),
                reply,
            })
            .await
            .map_err(|_| RecsyncError::Stopped)?;
        response.await.map_err(|_| RecsyncError::Stopped)?
    }
}

/// Record announcement engine.
pub struct Announcer<T: Transport = UdpTransport> {
    config: AnnouncerConfig,
    transport: Arc<T>,
    targets: Vec<TargetSlot>,
    registry: RecordRegistry,
    tracker: AckManager,
    codec: PacketCodec,
    events: broadcast::Sender<AnnounceEvent>,
    control_tx: mpsc::Sender<ControlRequest>,
    control_rx: mpsc::Receiver<ControlRequest>,
}

impl Announcer<UdpTransport> {
    /// Resolve receivers, open the socket and register the initial records.
    ///
    /// # Errors
    /// Any configuration, resolution or registration error, or
    /// `RecsyncError::Transport` if the socket cannot be bound.
    pub async fn setup(
        records: Vec<Record>,
        properties: GlobalProperties,
        config: AnnouncerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind_address.as_str()).await?;
        let targets = config.resolve_receivers_for(transport.local_addr()?).await?;

        let mut announcer = Self::with_transport(transport, targets, config)?;
        announcer.set_global_properties(properties)?;
        for record in records {
            announcer.register(record)?;
        }
        Ok(announcer)
    }
}

impl<T: Transport> Announcer<T> {
    /// Build an engine over an already-open transport.
    pub fn with_transport(transport: T, targets: Vec<SocketAddr>, config: AnnouncerConfig) -> Result<Self> {
        config.validate_tuning()?;
        if targets.is_empty() {
            return Err(RecsyncError::Config("at least one receiver is required".into()));
        }

        let local = transport.local_addr()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        Ok(Self {
            transport: Arc::new(transport),
            registry: RecordRegistry::new(targets.len()),
            targets: targets.into_iter().map(|addr| TargetSlot::new(addr, local)).collect(),
            tracker: AckManager::new(config.retry_policy()),
            codec: PacketCodec::new(config.max_packet_size),
            events,
            control_tx,
            control_rx,
            config,
        })
    }

    /// Register a record before the run loop starts.
    pub fn register(&mut self, record: Record) -> Result<RecordId> {
        self.codec.check_fits(&record, self.registry.global_properties())?;
        let name = record.name.clone();
        let id = self.registry.register(record)?;
        debug!(record = %name, id = id.0, "Record registered");
        Ok(id)
    }

    /// Replace the global properties. Fails with `AlreadyRunning` once
    /// announcing has begun.
    pub fn set_global_properties(&mut self, properties: GlobalProperties) -> Result<()> {
        if self.registry.is_frozen() {
            return Err(RecsyncError::AlreadyRunning);
        }
        self.codec.check_globals(&properties)?;
        for (_, record) in self.registry.records() {
            self.codec.check_fits(record, &properties)?;
        }
        self.registry.set_global_properties(properties)
    }

    /// Add one global property. Fails with `AlreadyRunning` once announcing
    /// has begun.
    pub fn add_global_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let properties = self.registry.global_properties().clone().with(key, value);
        self.set_global_properties(properties)
    }

    pub fn handle(&self) -> AnnouncerHandle {
        AnnouncerHandle {
            control: self.control_tx.clone(),
        }
    }

    /// Subscribe to send/ack/failure events
    pub fn subscribe(&self) -> broadcast::Receiver<AnnounceEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &RecordRegistry {
        &self.registry
    }

    pub fn targets(&self) -> impl Iterator<Item = &ReceiverTarget> {
        self.targets.iter().map(|slot| &slot.target)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Announce until `shutdown` turns `true` or its sender is dropped.
    ///
    /// In-flight packets are abandoned on shutdown and their records revert
    /// to `Pending`. The socket is closed before this returns. The final
    /// registry is handed back for inspection.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RecordRegistry {
        self.registry.freeze();
        info!(
            local = ?self.transport.local_addr().ok(),
            targets = self.targets.len(),
            records = self.registry.len(),
            "Announcer started"
        );

        let (inbound_tx, mut inbound_rx) = mpsc::channel(self.config.inbound_queue_depth);
        let receiver = tokio::spawn(receive_loop(Arc::clone(&self.transport), inbound_tx));

        let mut ticker = tokio::time::interval(self.config.announce_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = self.tracker.next_deadline();

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                        break;
                    }
                }
                Some(inbound) = inbound_rx.recv() => self.handle_inbound(inbound),
                Some(request) = self.control_rx.recv() => self.handle_control(request).await,
                _ = retry_deadline(deadline) => self.check_retries().await,
                _ = ticker.tick() => self.announce_cycle().await,
            }
        }

        receiver.abort();
        let _ = receiver.await;
        drop(inbound_rx);

        let abandoned = self.tracker.abandon_all(&mut self.registry);
        info!(abandoned, "Announcer stopped");

        let Announcer { registry, transport, .. } = self;
        drop(transport);
        registry
    }

    /// Send every unsent record to every target
    async fn announce_cycle(&mut self) {
        for index in 0..self.targets.len() {
            let target = TargetId(index);
            let (ids, packets) = {
                let unsent = self.registry.unsent_for(target);
                if unsent.is_empty() {
                    continue;
                }
                let ids: Vec<RecordId> = unsent.iter().map(|(id, _)| *id).collect();
                let refs: Vec<&Record> = unsent.iter().map(|(_, record)| *record).collect();
                let slot = &mut self.targets[index];
                match self
                    .codec
                    .encode(&refs, self.registry.global_properties(), || slot.allocate())
                {
                    Ok(packets) => (ids, packets),
                    Err(e) => {
                        error!(address = %slot.target.address, error = %e, "Cannot encode announcement");
                        continue;
                    }
                }
            };

            debug!(
                address = %self.targets[index].target.address,
                records = ids.len(),
                packets = packets.len(),
                "Announcing"
            );
            for packet in packets {
                let records = ids[packet.records.clone()].to_vec();
                self.dispatch(target, packet.sequence, records, packet.bytes).await;
            }
        }
    }

    /// First transmission of a packet
    async fn dispatch(&mut self, target: TargetId, sequence: u32, records: Vec<RecordId>, bytes: bytes::Bytes) {
        let slot = &self.targets[target.0];
        let (address, route) = (slot.target.address, slot.route);
        let count = records.len();
        self.registry.mark_in_flight(&records, target, sequence);

        match send_packet(self.transport.as_ref(), &bytes, route).await {
            Ok(_) => self.emit(AnnounceEvent::Sent {
                target: address,
                sequence,
                attempt: 1,
                records: count,
            }),
            // retried on timeout like a lost datagram
            Err(e) => warn!(%address, sequence, error = %e, "Send failed"),
        }
        self.tracker.track(target, address, sequence, records, bytes, Instant::now());
    }

    async fn check_retries(&mut self) {
        let actions = self.tracker.poll_timeouts(Instant::now(), &mut self.registry);
        for action in actions {
            match action {
                RetryAction::Retransmit {
                    target,
                    address,
                    sequence,
                    attempt,
                    records,
                    bytes,
                } => match send_packet(self.transport.as_ref(), &bytes, self.targets[target.0].route).await {
                    Ok(_) => self.emit(AnnounceEvent::Sent {
                        target: address,
                        sequence,
                        attempt,
                        records,
                    }),
                    Err(e) => warn!(%address, sequence, attempt, error = %e, "Retransmission failed"),
                },
                RetryAction::Failed(error) => self.emit(AnnounceEvent::Failed { error }),
            }
        }
    }

    fn handle_inbound(&mut self, inbound: InboundAck) {
        let InboundAck { from, ack } = inbound;
        let from = canonical_addr(from);
        let Some(index) = self.targets.iter().position(|slot| slot.target.address == from) else {
            trace!(%from, "Ignoring datagram from unknown source");
            return;
        };
        let target = TargetId(index);

        match self.tracker.on_ack(target, &ack, Instant::now(), &mut self.registry) {
            AckOutcome::Acknowledged { records, attempts, rtt } => {
                self.targets[index].target.last_seen_ack_sequence = Some(ack.sequence);
                debug!(
                    address = %from,
                    sequence = ack.sequence,
                    records = records.len(),
                    attempts,
                    rtt_ms = rtt.as_millis() as u64,
                    "Packet acknowledged"
                );
                let names = self.registry.names(&records);
                self.emit(AnnounceEvent::Acknowledged {
                    target: from,
                    sequence: ack.sequence,
                    records: names,
                });
            }
            AckOutcome::Rejected(error) => {
                self.targets[index].target.last_seen_ack_sequence = Some(ack.sequence);
                self.emit(AnnounceEvent::Failed { error });
            }
            AckOutcome::Ignored => {}
        }
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Register { record, reply } => {
                let result = self.register(record);
                let registered = result.is_ok();
                let _ = reply.send(result);
                if registered {
                    self.announce_cycle().await;
                }
            }
            ControlRequest::AddGlobalProperty { key, value, reply } => {
                let _ = reply.send(self.add_global_property(key, value));
            }
        }
    }

    fn emit(&self, event: AnnounceEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn retry_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use crate::contracts::AnnouncementState;
    use crate::receiver::Receiver;
    use crate::transport::{RecvFuture, SendFuture};

    /// UDP transport whose first `failures` sends error out
    struct FlakyTransport {
        inner: UdpTransport,
        failures: AtomicU32,
    }

    impl FlakyTransport {
        async fn bind(failures: u32) -> Self {
            Self {
                inner: UdpTransport::bind("127.0.0.1:0").await.unwrap(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl Transport for FlakyTransport {
        fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Box::pin(async { Err(io::Error::new(io::ErrorKind::Other, "network unreachable")) })
            } else {
                self.inner.send_to(buf, target)
            }
        }

        fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
            self.inner.recv_from(buf)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    /// Loopback receiver acknowledging everything; returns its address
    async fn acking_receiver() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; 2048];
            loop {
                if let Ok((announcement, _, from)) = Receiver::receive(&socket, &mut buffer).await {
                    let _ = Receiver::send_ack(&socket, announcement.sequence, from).await;
                }
            }
        });
        (addr, task)
    }

    async fn collect_until<F>(events: &mut broadcast::Receiver<AnnounceEvent>, done: F) -> Vec<AnnounceEvent>
    where
        F: Fn(&AnnounceEvent) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
    }

    fn sent_attempts(events: &[AnnounceEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                AnnounceEvent::Sent { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    fn config() -> AnnouncerConfig {
        AnnouncerConfig::new().with_announce_interval(Duration::from_secs(60))
    }

    async fn announcer() -> Announcer {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        Announcer::with_transport(transport, vec![target], config()).unwrap()
    }

    #[tokio::test]
    async fn test_setup_registers_records_and_properties() {
        let records = vec![Record::new("A", "ai"), Record::new("B", "longin").with_alias("B:ALIAS")];
        let props = GlobalProperties::new().with("ENGINEER", "X");
        let config = config()
            .with_receiver("127.0.0.1:9")
            .with_bind_address("127.0.0.1:0");

        let announcer = Announcer::setup(records, props, config).await.unwrap();
        assert_eq!(announcer.registry().len(), 2);
        assert_eq!(announcer.registry().global_properties().get("ENGINEER"), Some("X"));
        assert_eq!(announcer.targets().count(), 1);
        assert!(announcer.local_addr().unwrap().port() != 0);
    }

    #[tokio::test]
    async fn test_setup_rejects_duplicates() {
        let records = vec![Record::new("A", "ai"), Record::new("A", "bo")];
        let config = config()
            .with_receiver("127.0.0.1:9")
            .with_bind_address("127.0.0.1:0");
        let result = Announcer::setup(records, GlobalProperties::new(), config).await;
        assert!(matches!(result, Err(RecsyncError::DuplicateRecord(_))));
    }

    #[tokio::test]
    async fn test_with_transport_requires_target() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        assert!(Announcer::with_transport(transport, vec![], config()).is_err());
    }

    #[tokio::test]
    async fn test_global_properties_must_fit_existing_records() {
        let mut announcer = announcer().await;
        announcer
            .register(Record::new("A", "ai").with_property("recordDesc", "x".repeat(1000)))
            .unwrap();
        let result = announcer.add_global_property("HOSTNAME", "h".repeat(600));
        assert!(matches!(result, Err(RecsyncError::PacketTooLarge { .. })));
        assert!(announcer.registry().global_properties().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_record_rejected_at_registration() {
        let mut announcer = announcer().await;
        let result = announcer.register(Record::new("BIG", "waveform").with_property("v", "x".repeat(4000)));
        assert!(matches!(result, Err(RecsyncError::PacketTooLarge { .. })));
        assert!(announcer.registry().is_empty());
    }

    #[tokio::test]
    async fn test_send_errors_retried_on_backoff() {
        let (target, receiver) = acking_receiver().await;
        let config = config().with_backoff(Duration::from_millis(20), 2.0, Duration::from_secs(5));
        let mut announcer =
            Announcer::with_transport(FlakyTransport::bind(2).await, vec![target], config).unwrap();
        announcer.register(Record::new("A", "ai")).unwrap();
        let mut events = announcer.subscribe();

        let (tx, rx) = watch::channel(false);
        let started = Instant::now();
        let task = tokio::spawn(announcer.run(rx));

        let seen = collect_until(&mut events, |e| matches!(e, AnnounceEvent::Acknowledged { .. })).await;
        // sends 1 and 2 failed locally, the third went out after 20ms + 40ms of backoff
        assert_eq!(sent_attempts(&seen), vec![3]);
        assert!(started.elapsed() >= Duration::from_millis(60));

        tx.send(true).unwrap();
        let registry = task.await.unwrap();
        assert!(registry.all_acked(TargetId(0)));
        receiver.abort();
    }

    #[tokio::test]
    async fn test_persistent_send_errors_exhaust_retries() {
        let (target, receiver) = acking_receiver().await;
        let config = config()
            .with_backoff(Duration::from_millis(10), 2.0, Duration::from_secs(5))
            .with_max_attempts(3);
        let mut announcer =
            Announcer::with_transport(FlakyTransport::bind(u32::MAX).await, vec![target], config).unwrap();
        let id = announcer.register(Record::new("A", "ai")).unwrap();
        let mut events = announcer.subscribe();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(announcer.run(rx));

        let seen = collect_until(&mut events, |e| matches!(e, AnnounceEvent::Failed { .. })).await;
        assert!(sent_attempts(&seen).is_empty());
        match seen.last() {
            Some(AnnounceEvent::Failed {
                error: RecsyncError::RetryExhausted { target: failed, attempts, .. },
            }) => {
                assert_eq!(*failed, target);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }

        tx.send(true).unwrap();
        let registry = task.await.unwrap();
        assert_eq!(registry.state(TargetId(0), id), Some(AnnouncementState::Pending));
        receiver.abort();
    }

    #[test]
    fn test_sequence_allocation_wraps() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut slot = TargetSlot::new("127.0.0.1:9".parse().unwrap(), local);
        slot.next_sequence = u32::MAX;
        assert_eq!(slot.allocate(), u32::MAX);
        assert_eq!(slot.allocate(), 0);
        assert_eq!(slot.allocate(), 1);
    }

    #[tokio::test]
    async fn test_handle_after_stop_reports_stopped() {
        let announcer = announcer().await;
        let handle = announcer.handle();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let registry = announcer.run(rx).await;
        assert!(registry.is_frozen());
        assert_eq!(handle.register(Record::new("C", "ai")).await, Err(RecsyncError::Stopped));
    }
}
