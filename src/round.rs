//! One DC-net round, from either side.
//!
//! A round runs an optional control phase and then the data phase, one (slot, attempt) at a
//! time. Every (slot, attempt) is a full barrier: a client sends its masked slot to its server
//! and waits for the revealed plaintext; a server gathers its clients' ciphertexts, adds its
//! own pad, swaps aggregates with every peer server and sends the result back down. Only then
//! does anyone move on, because each keystream cursor must advance in lock-step with the one
//! on the other side of its secret.
//!
//! Any transport error aborts the round: the remaining pads could no longer cancel.
//!
//! Keystream desynchronization cannot be detected directly. It shows up as every non-empty
//! slot of the round failing its checksum, and such a round should be treated as failed.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cipher::KeystreamCipher;
use crate::config::DcNetConfig;
use crate::constants::{MAX_CLIENTS, PROGRESS_INTERVAL};
use crate::control::ControlSlot;
use crate::error::{DcNetError, Result};
use crate::event::{EventSink, RoundEvent};
use crate::slot;
use crate::transport::{self, PeerLink};

/// Which side of the protocol a coordinator plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Client { id: usize },
    Server { id: usize },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client { id } => write!(f, "client {}", id),
            Role::Server { id } => write!(f, "server {}", id),
        }
    }
}

/// Counters for one round.
///
/// Slots are counted once each: `filled` slots revealed valid content in some attempt,
/// `collisions` slots failed a checksum in some attempt (a slot can be both), and `empty`
/// slots did neither.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoundStatistics {
    /// Data slots run, after any pruning.
    pub slots: usize,
    /// Data slots scheduled before the control phase.
    pub scheduled_slots: usize,
    pub attempts: usize,
    /// Data phase bytes, one slot per (slot, attempt).
    pub bytes: usize,
    pub control_bytes: usize,
    pub elapsed: Duration,
    pub control_elapsed: Duration,
    pub collisions: usize,
    pub empty: usize,
    pub filled: usize,
}

impl fmt::Display for RoundStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slots={} ({}), bytes={} ({}), time={}ms ({}ms), collisions={}, empty={}, filled={}",
            self.slots,
            self.scheduled_slots,
            self.bytes,
            self.control_bytes,
            self.elapsed.as_millis(),
            self.control_elapsed.as_millis(),
            self.collisions,
            self.empty,
            self.filled
        )
    }
}

/// What a round revealed.
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    /// First valid content of each data slot, indexed like the (possibly pruned) data phase.
    pub outputs: Vec<Option<Vec<u8>>>,
    pub statistics: RoundStatistics,
}

impl RoundOutcome {
    /// Every revealed element, in slot order.
    pub fn revealed(&self) -> impl Iterator<Item = &[u8]> {
        self.outputs.iter().filter_map(|o| o.as_deref())
    }
}

/// Classification of a fully combined slot.
enum Revealed {
    Empty,
    Valid(usize),
    Collision,
}

fn classify(buffer: &[u8]) -> Revealed {
    let meta = slot::decode(buffer);
    match (meta.is_empty(), meta.valid) {
        (true, true) => Revealed::Empty,
        (false, true) => Revealed::Valid(meta.length),
        (_, false) => Revealed::Collision,
    }
}

/// Accumulates the outcome of the data phase for both roles.
struct Tally {
    outputs: Vec<Option<Vec<u8>>>,
    collided: Vec<bool>,
}

impl Tally {
    fn new(slots: usize) -> Self {
        Tally {
            outputs: vec![None; slots],
            collided: vec![false; slots],
        }
    }

    fn record<E: EventSink>(&mut self, sink: &mut E, slot: usize, attempt: usize, buffer: &[u8]) {
        match classify(buffer) {
            Revealed::Empty => {}
            Revealed::Valid(length) => {
                sink.record(RoundEvent::Revealed {
                    slot,
                    attempt,
                    length,
                });
                if self.outputs[slot].is_none() {
                    self.outputs[slot] = Some(slot::to_bytes(buffer));
                }
            }
            Revealed::Collision => {
                sink.record(RoundEvent::Collision { slot, attempt });
                self.collided[slot] = true;
            }
        }
    }

    fn finish(self, stats: &mut RoundStatistics) -> Vec<Option<Vec<u8>>> {
        stats.filled = self.outputs.iter().filter(|o| o.is_some()).count();
        stats.collisions = self.collided.iter().filter(|&&c| c).count();
        stats.empty = self
            .outputs
            .iter()
            .zip(&self.collided)
            .filter(|(output, &collided)| output.is_none() && !collided)
            .count();
        self.outputs
    }
}

/// Runs rounds for one participant.
///
/// The coordinator owns the participant's keystreams, so it lives for exactly one round:
/// build a new one for the next round.
pub struct RoundCoordinator<E: EventSink> {
    role: Role,
    slot_length: usize,
    cipher: KeystreamCipher,
    sink: E,
}

impl<E: EventSink> RoundCoordinator<E> {
    /// Coordinator for client `client_id` in a deployment of `num_servers` servers.
    ///
    /// # Arguments
    ///
    /// * `config` - Settings shared by the whole deployment.
    /// * `client_id` - This client's id. Ids above `MAX_CLIENTS - 1` are rejected: they would
    ///   share secrets with a lower id.
    /// * `num_servers` - Number of servers, which is also the number of keystreams.
    /// * `sink` - Receives the round events.
    ///
    /// # Returns
    ///
    /// The coordinator, or `Configuration` when the settings cannot run a round.
    pub fn client(
        config: &DcNetConfig,
        client_id: usize,
        num_servers: usize,
        sink: E,
    ) -> Result<Self> {
        config.validate()?;
        if num_servers == 0 {
            return Err(DcNetError::Configuration(
                "a client needs at least one server".to_string(),
            ));
        }
        if client_id >= MAX_CLIENTS {
            return Err(DcNetError::Configuration(format!(
                "client id {} exceeds the largest supported id {}",
                client_id,
                MAX_CLIENTS - 1
            )));
        }
        let block_size = config.keystream.block_size;
        Ok(RoundCoordinator {
            role: Role::Client { id: client_id },
            slot_length: config.slot.length,
            cipher: KeystreamCipher::for_client(client_id, num_servers, block_size),
            sink,
        })
    }

    /// Coordinator for server `server_id` in a deployment of `num_clients` clients in total.
    ///
    /// The server holds one keystream per client of the deployment, connected to it or not,
    /// so `num_clients` is capped at `MAX_CLIENTS`.
    pub fn server(
        config: &DcNetConfig,
        server_id: usize,
        num_clients: usize,
        sink: E,
    ) -> Result<Self> {
        config.validate()?;
        if num_clients > MAX_CLIENTS {
            return Err(DcNetError::Configuration(format!(
                "{} clients exceed the supported maximum of {}",
                num_clients, MAX_CLIENTS
            )));
        }
        let block_size = config.keystream.block_size;
        Ok(RoundCoordinator {
            role: Role::Server { id: server_id },
            slot_length: config.slot.length,
            cipher: KeystreamCipher::for_server(server_id, num_clients, block_size),
            sink,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sink(&self) -> &E {
        &self.sink
    }

    pub fn into_sink(self) -> E {
        self.sink
    }

    /// Runs a client round against the assigned server.
    pub async fn run_client<S>(
        &mut self,
        strategy: &mut dyn ControlSlot,
        server: &mut S,
    ) -> Result<RoundOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let mut stats = RoundStatistics {
            scheduled_slots: strategy.scheduled_slot_count(),
            ..RoundStatistics::default()
        };
        self.sink.record(RoundEvent::RoundStarted {
            role: self.role,
            slots: stats.scheduled_slots,
        });

        let control_len = strategy.control_len();
        if control_len > 0 {
            let mut control = vec![0u8; control_len];
            strategy.control_message(&mut control);
            self.cipher.apply(&mut control);

            transport::send(server, &control).await?;
            transport::receive(server, &mut control).await?;
            strategy.set_result(&control)?;
            self.control_resolved(&mut stats, control_len, strategy.slot_count(), started);
        }

        let slots = strategy.slot_count();
        let attempts = strategy.attempts();
        let mut tally = Tally::new(slots);
        let data_started = Instant::now();

        for index in 0..slots {
            self.progress(index, data_started);
            for attempt in 0..attempts {
                let mut buffer = vec![0u8; self.slot_length];
                strategy.write_slot(index, &mut buffer);
                self.cipher.apply(&mut buffer);

                transport::send(server, &buffer).await?;
                transport::receive(server, &mut buffer).await?;
                stats.bytes += buffer.len();

                tally.record(&mut self.sink, index, attempt, &buffer);
            }
        }

        Ok(self.complete(stats, tally, slots, attempts, started))
    }

    /// Runs a server round over its share of clients and every peer server.
    ///
    /// `strategy` must be built over a schedule that holds no content, sized and configured
    /// like the clients'.
    pub async fn run_server<C, P>(
        &mut self,
        strategy: &mut dyn ControlSlot,
        clients: &mut [C],
        peers: &mut [PeerLink<P>],
    ) -> Result<RoundOutcome>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        P: AsyncRead + AsyncWrite + Unpin,
    {
        let server_id = match self.role {
            Role::Server { id } => id,
            Role::Client { .. } => {
                return Err(DcNetError::Configuration(
                    "run_server called on a client coordinator".to_string(),
                ))
            }
        };
        peers.sort_by_key(|peer| peer.id);

        let started = Instant::now();
        let mut stats = RoundStatistics {
            scheduled_slots: strategy.scheduled_slot_count(),
            ..RoundStatistics::default()
        };
        self.sink.record(RoundEvent::RoundStarted {
            role: self.role,
            slots: stats.scheduled_slots,
        });

        let control_len = strategy.control_len();
        if control_len > 0 {
            let mut control = vec![0u8; control_len];
            self.combine(server_id, clients, peers, &mut control).await?;
            strategy.set_result(&control)?;
            transport::broadcast(clients, &control).await?;
            self.control_resolved(&mut stats, control_len, strategy.slot_count(), started);
        }

        let slots = strategy.slot_count();
        let attempts = strategy.attempts();
        let mut tally = Tally::new(slots);
        let data_started = Instant::now();

        for index in 0..slots {
            self.progress(index, data_started);
            for attempt in 0..attempts {
                let mut buffer = vec![0u8; self.slot_length];
                self.combine(server_id, clients, peers, &mut buffer).await?;
                stats.bytes += buffer.len();

                tally.record(&mut self.sink, index, attempt, &buffer);
                transport::broadcast(clients, &buffer).await?;
            }
        }

        Ok(self.complete(stats, tally, slots, attempts, started))
    }

    /// Folds every client's ciphertext, this server's pad and every peer's aggregate into
    /// `buffer`, which must start zeroed.
    async fn combine<C, P>(
        &mut self,
        server_id: usize,
        clients: &mut [C],
        peers: &mut [PeerLink<P>],
        buffer: &mut [u8],
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        P: AsyncRead + AsyncWrite + Unpin,
    {
        transport::gather(clients, buffer).await?;
        self.cipher.apply(buffer);

        let local = buffer.to_vec();
        transport::exchange(server_id, peers, &local, buffer).await?;
        Ok(())
    }

    fn control_resolved(
        &mut self,
        stats: &mut RoundStatistics,
        control_len: usize,
        won_slots: usize,
        started: Instant,
    ) {
        stats.control_bytes = control_len;
        stats.control_elapsed = started.elapsed();
        self.sink.record(RoundEvent::ControlResolved {
            control_bytes: control_len,
            won_slots,
            elapsed: stats.control_elapsed,
        });
    }

    fn progress(&mut self, slot: usize, data_started: Instant) {
        if slot == 0 || slot % PROGRESS_INTERVAL != 0 {
            return;
        }
        let elapsed = data_started.elapsed().as_secs_f64();
        let slots_per_sec = if elapsed > 0.0 {
            slot as f64 / elapsed
        } else {
            f64::INFINITY
        };
        self.sink.record(RoundEvent::Progress {
            slot,
            slots_per_sec,
        });
    }

    fn complete(
        &mut self,
        mut stats: RoundStatistics,
        tally: Tally,
        slots: usize,
        attempts: usize,
        started: Instant,
    ) -> RoundOutcome {
        stats.slots = slots;
        stats.attempts = attempts;
        let outputs = tally.finish(&mut stats);
        stats.elapsed = started.elapsed();
        self.sink.record(RoundEvent::RoundCompleted(stats.clone()));

        RoundOutcome {
            outputs,
            statistics: stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::METADATA_BYTES;
    use crate::control::{control_slot, ControlMode};
    use crate::event::MemorySink;
    use crate::scheduler::fixed::FixedScheduler;
    use crate::scheduler::{ElementScheduler, Scheduler, ServerScheduler};
    use futures::future::join_all;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::io::{duplex, DuplexStream};

    /// Sends whatever the schedule holds, in a single attempt per slot.
    struct AlwaysSend<'a, S: ?Sized> {
        scheduler: &'a S,
    }

    impl<'a, S: Scheduler + ?Sized> ControlSlot for AlwaysSend<'a, S> {
        fn control_len(&self) -> usize {
            0
        }

        fn control_message(&self, _buffer: &mut [u8]) {}

        fn set_result(&mut self, _result: &[u8]) -> Result<()> {
            Ok(())
        }

        fn slot_count(&self) -> usize {
            self.scheduler.slot_count()
        }

        fn attempts(&self) -> usize {
            1
        }

        fn is_empty(&self, index: usize) -> bool {
            self.scheduler.is_empty(index)
        }

        fn length(&self, index: usize) -> usize {
            self.scheduler.length(index)
        }

        fn write_slot(&mut self, index: usize, buffer: &mut [u8]) -> bool {
            self.scheduler.write_slot(index, buffer);
            !self.scheduler.is_empty(index)
        }
    }

    fn test_config(slot_length: usize) -> DcNetConfig {
        let mut config = DcNetConfig::default();
        config.slot.length = slot_length;
        config
    }

    /// Connections for a deployment: client ends, each server's client ends, and the mesh.
    struct Wiring {
        clients: Vec<DuplexStream>,
        server_clients: Vec<Vec<DuplexStream>>,
        server_peers: Vec<Vec<PeerLink<DuplexStream>>>,
    }

    fn wire(num_clients: usize, num_servers: usize) -> Wiring {
        let mut clients = Vec::new();
        let mut server_clients: Vec<Vec<DuplexStream>> =
            (0..num_servers).map(|_| Vec::new()).collect();
        for client in 0..num_clients {
            let (near, far) = duplex(1 << 16);
            clients.push(near);
            server_clients[transport::server_for_client(client, num_servers)].push(far);
        }

        let mut server_peers: Vec<Vec<PeerLink<DuplexStream>>> =
            (0..num_servers).map(|_| Vec::new()).collect();
        for a in 0..num_servers {
            for b in a + 1..num_servers {
                let (ab, ba) = duplex(1 << 16);
                server_peers[a].push(PeerLink::new(b, ab));
                server_peers[b].push(PeerLink::new(a, ba));
            }
        }

        Wiring {
            clients,
            server_clients,
            server_peers,
        }
    }

    /// Runs one round in which client `i` drives `strategies[i]` and every server runs
    /// `mode` over an empty schedule of `slot_count` slots.
    async fn run_round(
        config: &DcNetConfig,
        num_servers: usize,
        strategies: Vec<Box<dyn ControlSlot + '_>>,
        slot_count: usize,
        attempts: usize,
    ) -> (Vec<RoundOutcome>, Vec<(RoundOutcome, MemorySink)>) {
        let num_clients = strategies.len();
        let wiring = wire(num_clients, num_servers);
        let server_schedule = ServerScheduler::new(slot_count);

        let client_runs = strategies
            .into_iter()
            .zip(wiring.clients)
            .enumerate()
            .map(|(id, (mut strategy, mut stream))| async move {
                let mut coordinator =
                    RoundCoordinator::client(config, id, num_servers, MemorySink::new()).unwrap();
                coordinator
                    .run_client(strategy.as_mut(), &mut stream)
                    .await
                    .unwrap()
            });

        let server_schedule = &server_schedule;
        let server_runs = wiring
            .server_clients
            .into_iter()
            .zip(wiring.server_peers)
            .enumerate()
            .map(|(id, (mut clients, mut peers))| async move {
                let mut strategy = control_slot(
                    config.slot.control,
                    server_schedule,
                    attempts,
                    StdRng::seed_from_u64(id as u64),
                )
                .unwrap();
                let mut coordinator =
                    RoundCoordinator::server(config, id, num_clients, MemorySink::new()).unwrap();
                let outcome = coordinator
                    .run_server(strategy.as_mut(), &mut clients, &mut peers)
                    .await
                    .unwrap();
                (outcome, coordinator.into_sink())
            });

        tokio::join!(join_all(client_runs), join_all(server_runs))
    }

    #[tokio::test]
    async fn test_single_writer_is_revealed() {
        let config = test_config(64);
        let writer = FixedScheduler::new(16, &[(3, b"hello")]);
        let idle = FixedScheduler::new(16, &[]);
        let strategies: Vec<Box<dyn ControlSlot + '_>> = vec![
            Box::new(AlwaysSend { scheduler: &writer }),
            Box::new(AlwaysSend { scheduler: &idle }),
        ];

        let (clients, servers) = run_round(&config, 1, strategies, 16, 1).await;
        let (server, sink) = &servers[0];

        assert_eq!(server.outputs[3].as_deref(), Some(&b"hello"[..]));
        assert_eq!(server.statistics.collisions, 0);
        assert_eq!(server.statistics.filled, 1);
        assert_eq!(server.statistics.empty, 15);
        assert_eq!(server.statistics.bytes, 16 * 64);
        assert_eq!(sink.collisions(), 0);

        for client in &clients {
            assert_eq!(client.outputs, server.outputs);
            assert_eq!(client.statistics.filled, 1);
        }
    }

    #[tokio::test]
    async fn test_same_slot_collides() {
        let config = test_config(64);
        let first = FixedScheduler::new(8, &[(5, b"hello"), (1, b"solo")]);
        let second = FixedScheduler::new(8, &[(5, b"goodbye")]);
        let strategies: Vec<Box<dyn ControlSlot + '_>> = vec![
            Box::new(AlwaysSend { scheduler: &first }),
            Box::new(AlwaysSend { scheduler: &second }),
        ];

        let (_, servers) = run_round(&config, 1, strategies, 8, 1).await;
        let (server, sink) = &servers[0];

        assert!(server.outputs[5].is_none());
        assert_eq!(server.outputs[1].as_deref(), Some(&b"solo"[..]));
        assert_eq!(server.statistics.collisions, 1);
        assert_eq!(server.statistics.filled, 1);
        assert_eq!(sink.collisions(), 1);
    }

    #[tokio::test]
    async fn test_equal_length_collision_is_detected() {
        let config = test_config(64);
        let first = FixedScheduler::new(4, &[(2, b"hello")]);
        let second = FixedScheduler::new(4, &[(2, b"world")]);
        let strategies: Vec<Box<dyn ControlSlot + '_>> = vec![
            Box::new(AlwaysSend { scheduler: &first }),
            Box::new(AlwaysSend { scheduler: &second }),
        ];

        let (_, servers) = run_round(&config, 2, strategies, 4, 1).await;
        for (server, _) in &servers {
            assert_eq!(server.statistics.collisions, 1);
            assert_eq!(server.statistics.filled, 0);
            assert_eq!(server.statistics.empty, 3);
        }
    }

    #[tokio::test]
    async fn test_dummy_round_across_servers() {
        let config = test_config(128);
        let slot_count = config.slot_count();
        let attempts = config.slot.attempts_per_slot;

        let mut sender = ElementScheduler::with_rng(32, 0.05, 128, StdRng::seed_from_u64(1));
        sender.add(b"alpha");
        sender.add(b"beta");
        sender.finalize(None);
        let idle = ElementScheduler::with_rng(32, 0.05, 128, StdRng::seed_from_u64(2));

        let strategies = vec![
            control_slot(ControlMode::Dummy, &sender, attempts, StdRng::seed_from_u64(10)).unwrap(),
            control_slot(ControlMode::Dummy, &idle, attempts, StdRng::seed_from_u64(11)).unwrap(),
        ];

        let (clients, servers) = run_round(&config, 2, strategies, slot_count, attempts).await;

        for (server, _) in &servers {
            let revealed: Vec<&[u8]> = server.revealed().collect();
            assert!(revealed.contains(&&b"alpha"[..]));
            assert!(revealed.contains(&&b"beta"[..]));
            assert_eq!(server.statistics.collisions, 0);
            assert_eq!(server.statistics.attempts, attempts);
            assert_eq!(server.outputs, servers[0].0.outputs);
        }
        for client in &clients {
            assert_eq!(client.outputs, servers[0].0.outputs);
        }
    }

    #[tokio::test]
    async fn test_pruning_round() {
        let mut config = test_config(96);
        config.slot.control = ControlMode::Pruning;
        config.slot.estimated_elements_per_round = 16;
        let slot_count = config.slot_count();
        let attempts = config.slot.attempts_per_slot;

        let inputs: Vec<Vec<Vec<u8>>> = (0..3)
            .map(|client| {
                (0..4)
                    .map(|i| format!("client{}-element{}", client, i).into_bytes())
                    .collect()
            })
            .collect();

        let schedules: Vec<ElementScheduler> = inputs
            .iter()
            .enumerate()
            .map(|(client, elements)| {
                let mut scheduler =
                    ElementScheduler::with_rng(16, 0.05, 96, StdRng::seed_from_u64(client as u64));
                for element in elements {
                    assert!(scheduler.add(element));
                }
                scheduler.finalize(Some(2));
                scheduler
            })
            .collect();

        let strategies = schedules
            .iter()
            .enumerate()
            .map(|(client, scheduler)| {
                control_slot(
                    ControlMode::Pruning,
                    scheduler,
                    attempts,
                    StdRng::seed_from_u64(100 + client as u64),
                )
                .unwrap()
            })
            .collect();

        let (clients, servers) = run_round(&config, 2, strategies, slot_count, attempts).await;

        let reference = &servers[0].0;
        let stats = &reference.statistics;
        assert_eq!(stats.scheduled_slots, slot_count);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.control_bytes, slot_count * attempts / 8);
        assert!(stats.slots <= slot_count);
        assert!(stats.filled > 0);
        assert_eq!(
            stats.filled,
            reference.outputs.iter().filter(|o| o.is_some()).count()
        );

        let all_inputs: Vec<&Vec<u8>> = inputs.iter().flatten().collect();
        for element in reference.revealed() {
            assert!(all_inputs.iter().any(|input| input.as_slice() == element));
        }

        for (server, sink) in &servers {
            assert_eq!(server.outputs, reference.outputs);
            assert_eq!(server.statistics.slots, stats.slots);
            assert_eq!(server.statistics.scheduled_slots, slot_count);
            assert!(matches!(
                sink.events.first(),
                Some(RoundEvent::RoundStarted { slots, .. }) if *slots == slot_count
            ));
        }
        for client in &clients {
            assert_eq!(client.outputs, reference.outputs);
            assert_eq!(client.statistics.slots, stats.slots);
            assert_eq!(client.statistics.scheduled_slots, slot_count);
        }
    }

    #[tokio::test]
    async fn test_binary_round() {
        let mut config = test_config(64);
        config.slot.control = ControlMode::Binary;
        let slot_count = config.slot_count();
        let attempts = config.slot.attempts_per_slot;

        // A lone writer in several slots; each is lost only if all its coin flips are 0.
        let writer = FixedScheduler::new(
            slot_count,
            &[(3, b"hello"), (4, b"hello"), (5, b"hello"), (6, b"hello")],
        );
        let idle_a = FixedScheduler::new(slot_count, &[]);
        let idle_b = FixedScheduler::new(slot_count, &[]);
        let strategies = [&writer, &idle_a, &idle_b]
            .into_iter()
            .enumerate()
            .map(|(client, scheduler)| {
                control_slot(
                    ControlMode::Binary,
                    scheduler,
                    attempts,
                    StdRng::seed_from_u64(200 + client as u64),
                )
                .unwrap()
            })
            .collect();

        let (clients, servers) = run_round(&config, 2, strategies, slot_count, attempts).await;

        let reference = &servers[0].0;
        let stats = &reference.statistics;
        assert_eq!(stats.slots, slot_count);
        assert_eq!(stats.scheduled_slots, slot_count);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.control_bytes, slot_count * attempts / 8);
        assert_eq!(stats.collisions, 0);
        assert!(stats.filled > 0);
        for (index, output) in reference.outputs.iter().enumerate() {
            if let Some(content) = output {
                assert!((3..=6).contains(&index));
                assert_eq!(content.as_slice(), b"hello");
            }
        }

        for (server, _) in &servers {
            assert_eq!(server.outputs, reference.outputs);
        }
        for client in &clients {
            assert_eq!(client.outputs, reference.outputs);
        }
    }

    #[tokio::test]
    async fn test_dropped_client_aborts_server_round() {
        let config = test_config(64);
        let schedule = ServerScheduler::new(4);
        let mut strategy =
            control_slot(ControlMode::Dummy, &schedule, 1, StdRng::seed_from_u64(0)).unwrap();

        let (_alive, alive_far) = duplex(1024);
        let (dropped, dropped_far) = duplex(1024);
        drop(dropped);

        let mut clients = vec![alive_far, dropped_far];
        let mut peers: Vec<PeerLink<DuplexStream>> = Vec::new();
        let mut coordinator = RoundCoordinator::server(&config, 0, 2, MemorySink::new()).unwrap();

        let result = coordinator
            .run_server(strategy.as_mut(), &mut clients, &mut peers)
            .await;
        assert!(matches!(result, Err(DcNetError::Transport(_))));
    }

    #[tokio::test]
    async fn test_client_fails_without_server() {
        let config = test_config(64);
        let schedule = FixedScheduler::new(4, &[(0, b"x")]);
        let mut strategy = AlwaysSend { scheduler: &schedule };

        let (mut stream, server_end) = duplex(1024);
        drop(server_end);

        let mut coordinator = RoundCoordinator::client(&config, 0, 1, MemorySink::new()).unwrap();
        let result = coordinator.run_client(&mut strategy, &mut stream).await;
        assert!(matches!(result, Err(DcNetError::Transport(_))));
    }

    #[test]
    fn test_client_needs_servers() {
        let config = test_config(64);
        assert!(RoundCoordinator::client(&config, 0, 0, MemorySink::new()).is_err());
    }

    #[test]
    fn test_client_ids_past_secret_width_are_rejected() {
        let mut config = test_config(64);
        // A server keeps one keystream block per client.
        config.keystream.block_size = 8;
        let last = MAX_CLIENTS - 1;
        assert!(RoundCoordinator::client(&config, last, 1, MemorySink::new()).is_ok());
        assert!(matches!(
            RoundCoordinator::client(&config, MAX_CLIENTS, 1, MemorySink::new()),
            Err(DcNetError::Configuration(_))
        ));

        assert!(RoundCoordinator::server(&config, 0, MAX_CLIENTS, MemorySink::new()).is_ok());
        assert!(matches!(
            RoundCoordinator::server(&config, 0, MAX_CLIENTS + 1, MemorySink::new()),
            Err(DcNetError::Configuration(_))
        ));
    }

    #[test]
    fn test_tally_counts_slots_once() {
        let mut sink = MemorySink::new();
        let mut tally = Tally::new(3);

        let mut valid = vec![0u8; 32];
        valid[METADATA_BYTES..METADATA_BYTES + 2].copy_from_slice(b"ok");
        slot::encode(&mut valid, 2);
        let mut corrupt = valid.clone();
        corrupt[20] ^= 0xFF;

        tally.record(&mut sink, 0, 0, &corrupt);
        tally.record(&mut sink, 0, 1, &valid);
        tally.record(&mut sink, 1, 0, &corrupt);
        tally.record(&mut sink, 1, 1, &corrupt);
        tally.record(&mut sink, 2, 0, &vec![0u8; 32]);

        let mut stats = RoundStatistics::default();
        let outputs = tally.finish(&mut stats);
        assert_eq!(outputs[0].as_deref(), Some(&b"ok"[..]));
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.collisions, 2);
        assert_eq!(stats.empty, 1);
        assert_eq!(sink.collisions(), 3);
    }
}
