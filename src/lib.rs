//! # DC-net: Anonymous Broadcast over Dining-Cryptographers Rounds
//!
//! This library implements a round-based dining-cryptographers network. A set of clients
//! broadcast short messages through a set of cooperating servers such that no coalition of
//! fewer than all the servers can link a message to its sender, while the combination of every
//! server's output reveals the content of any slot used by exactly one client.
//!
//! ## How a Round Works
//!
//! Every client shares a secret with every server. Both sides expand the secret into the same
//! keystream, so each pad is XORed into the round exactly twice and cancels out:
//!
//! ```ignore
//! revealed = ⊕ clients (content ⊕ pad(c, s0) ⊕ ... ⊕ pad(c, sN))
//!          ⊕ ⊕ servers (pad(c0, s) ⊕ ... ⊕ pad(cM, s))
//!          = ⊕ clients content
//! ```
//!
//! Clients place their elements into slots by Bloom filter hashing. A slot carries a length and
//! a checksum, so when two clients write the same slot the combination fails its checksum and
//! the collision is detected without learning who collided.
//!
//! ### Control Slots
//!
//! With a binary control mode, clients first run a small round of coin flips, one bit per
//! (slot, attempt). A slot whose combined bits show exactly one flip at a client's chosen
//! attempt is won, and only the winner transmits in it. The pruning mode also drops every slot
//! nobody won, so the data phase shrinks to the slots that carry content.
//!
//! ## Usage in the Code
//!
//! ```rust
//! use dcnet::cipher::KeystreamCipher;
//! use dcnet::slot;
//!
//! // One client, one server: the client masks a slot, the server adds its pad.
//! let mut client = KeystreamCipher::for_client(0, 1, 1024);
//! let mut server = KeystreamCipher::for_server(0, 1, 1024);
//!
//! let mut buffer = vec![0u8; 64];
//! buffer[12..17].copy_from_slice(b"hello");
//! slot::encode(&mut buffer, 5);
//!
//! client.apply(&mut buffer);
//! server.apply(&mut buffer);
//!
//! let meta = slot::decode(&buffer);
//! assert!(meta.valid);
//! assert_eq!(slot::payload(&buffer), b"hello");
//! ```
//!
//! ## Modules
//!
//! - `cipher`: Per-pair keystreams and their ordered sets.
//! - `slot`: Length and checksum framing of a slot.
//! - `scheduler`: Bloom filter assignment of elements to slots.
//! - `control`: Collision avoidance strategies.
//! - `round`: The round protocol for clients and servers.
//! - `transport`: Lock-step stream exchange and TCP bootstrapping.
//!
//! [More detailed documentation and examples are provided in each module.]

/// The `cipher` module derives the keystream a client and a server share, and the ordered set of
/// keystreams each participant masks its traffic with.
pub mod cipher;

/// The `config` module loads the settings every participant of a deployment must agree on.
pub mod config;

/// The `constants` module defines various constants used in the library.
pub mod constants;

/// The `control` module implements the control slot strategies that decide, per slot and
/// attempt, whether a client transmits.
pub mod control;

/// The `error` module defines the library's error type.
pub mod error;

/// The `event` module defines the events a round emits and the sinks that consume them.
pub mod event;

/// The `round` module runs one DC-net round as a client or as a server, and reports what was
/// revealed together with the round statistics.
pub mod round;

/// The `scheduler` module assigns a client's elements to slots.
pub mod scheduler;

/// The `slot` module frames slot content with its length and checksum.
pub mod slot;

/// The `transport` module moves fixed-size buffers between participants in lock-step and sets
/// up the connections of a deployment.
pub mod transport;

/// Element files, round outputs and slot dumps.
pub mod util;
