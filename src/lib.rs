//! A standalone TCP protocol engine.
//!
//! `tcpcore` is the hard middle of a TCP implementation with everything
//! around it left out: no sockets, no IP layer, no threads, no clock, no
//! entropy of its own. The engine consumes decoded segments labelled with
//! their addresses and the current time, and produces updated connection
//! state plus the segments it wants transmitted. Sockets, schedulers and
//! the datagram transport are the host's business.
//!
//! What *is* in here: the per-connection state machine (nine states;
//! LISTEN is a port set on the engine and CLOSED is the absence of a
//! connection), segment validation and per-state dispatch, out-of-order
//! reassembly with coalescing, round-trip estimation, retransmission with
//! exponential backoff, zero-window probing, window scaling, and the
//! defenses of RFC 5961 (challenge ACKs) and RFC 1337 (TIME_WAIT reset
//! immunity).
//!
//! ## Structure
//!
//! * [`wire`]: byte-level segment access, options, the internet checksum.
//! * [`time`]: explicit instants and deadlines; time is always an argument.
//! * [`engine`]: the state proper: connections, listeners, rules, timers.
//!
//! ## Driving the engine
//!
//! ```
//! use tcpcore::engine::Engine;
//! use tcpcore::time::Instant;
//! use tcpcore::wire::Ipv4Address;
//!
//! // Randomness is injected; hand the engine your CSPRNG.
//! let mut engine = Engine::new("example", |n| vec![0xa5; n]);
//! engine.listen(80);
//!
//! let now = Instant::from_millis(0);
//! let local = Ipv4Address::new(10, 0, 0, 1).into();
//! let peer = Ipv4Address::new(10, 0, 0, 2).into();
//!
//! // Feed a raw TCP payload; collect answers and events.
//! let (outs, events) = engine.handle(now, peer, local, &[]);
//! assert!(outs.is_empty() && events.is_empty()); // too short, dropped
//! ```
//!
//! Every public operation has the same shape: state in, `(state',
//! segments, events)` out, with mutation standing in for the primed
//! state. The host adapter is expected to serialise calls per engine and
//! to park user tasks on the returned [`engine::Event`]s.

#[macro_use]
mod macros;

pub mod engine;
pub mod time;
pub mod wire;

pub use engine::{Engine, Event};
