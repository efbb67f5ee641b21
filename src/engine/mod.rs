//! The protocol engine.
//!
//! Everything stateful lives here: the listener port set and the map of
//! four-tuples to connections. The engine has no transport of its own.
//! Segments come in through [`handle`], time comes in as an explicit
//! argument, randomness comes in as a closure handed to the constructor,
//! and everything the engine wants transmitted comes back out as
//! [`Transmit`] values for the caller's internet layer.
//!
//! The main difference to a socket layer is that nothing here ever blocks
//! or wakes anybody. Where a socket API would park the caller, an operation
//! returns empty-handed, and the [`Event`]s produced by [`handle`] and
//! [`timer`] tell the host adapter which connections are worth another
//! attempt.
//!
//! Relevant material for reading:
//! Main TCP rfc (skip if confident): https://tools.ietf.org/html/rfc9293
//! Errata and comments: https://tools.ietf.org/html/rfc1122#section-4.2
//! Window scaling: https://tools.ietf.org/html/rfc7323
//! Attack avoidance: https://tools.ietf.org/html/rfc5961
//! TIME_WAIT assassination: https://tools.ietf.org/html/rfc1337
//! RST handling specifically: https://www.snellman.net/blog/archive/2016-02-01-tcp-rst/
//!
//! [`handle`]: struct.Engine.html#method.handle
//! [`timer`]: struct.Engine.html#method.timer
//! [`Transmit`]: struct.Transmit.html
//! [`Event`]: enum.Event.html
use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use crate::time::{Duration, Expiration, Instant};
use crate::wire::{IpAddress, TcpPacket, TcpRepr, TcpSeqNumber};

mod connection;
mod input;
mod output;
mod reassembly;
mod rtt;
mod segment;
mod timer;

pub use connection::{
    Connection, ControlBlock, Rexmt, RexmtMode, SoftError, TcpState, Timed,
};
pub use reassembly::ReassemblyQueue;
pub use rtt::RttEstimator;

/// Retransmissions beyond this shift abandon the connection.
pub(crate) const MAX_RXT_SHIFT: u8 = 12;

/// Timeout multipliers per consecutive expiry.
pub(crate) const BACKOFF: [u32; 13] = [1, 2, 4, 8, 16, 32, 64, 64, 64, 64, 64, 64, 64];

/// Maximum segment lifetime; TIME_WAIT lingers for twice this.
pub(crate) const MSL: Duration = Duration::from_secs(30);

/// How long an acknowledgement may be delayed.
pub(crate) const DELACK_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a handshake may take before the connection is abandoned.
pub(crate) const CONN_EST_TIMEOUT: Duration = Duration::from_secs(75);

/// How long a half-closed FIN_WAIT_2 connection is kept around.
pub(crate) const FIN_WAIT_2_TIMEOUT: Duration = Duration::from_secs(600);

/// Bounds on the persist (window probe) timer.
pub(crate) const PERSIST_MIN: Duration = Duration::from_secs(5);
pub(crate) const PERSIST_MAX: Duration = Duration::from_secs(60);

/// The sender maximum segment size assumed of a peer that offers none (RFC 1122).
pub(crate) const DEFAULT_MSS: u32 = 536;

/// No peer talks us below this segment size, whatever its option says.
pub(crate) const MIN_MSS: u32 = 64;

/// The maximum segment size we advertise.
pub(crate) const DEFAULT_ADVMSS: u32 = 1460;

/// Default cap for the send and receive buffers.
pub(crate) const DEFAULT_BUFSIZE: usize = 64 * 1024;

/// Slow start begins with the threshold effectively unbounded.
pub(crate) const INITIAL_SSTHRESH: u32 = 1 << 30;

/// RFC 7323 bounds the window-scale shift.
pub(crate) const MAX_WINDOW_SCALE: u8 = 14;

const EPHEMERAL_MIN: u16 = 49152;

/// The four-tuple identifying a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourTuple {
    pub local: IpAddress,
    pub remote: IpAddress,
    pub local_port: u16,
    pub remote_port: u16,
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.local, self.local_port, self.remote, self.remote_port
        )
    }
}

/// An outbound segment, addressed for the internet layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmit {
    pub src: IpAddress,
    pub dst: IpAddress,
    pub segment: TcpRepr,
    pub payload: Vec<u8>,
}

impl Transmit {
    /// Encode the segment into wire bytes, checksum filled in.
    pub fn emit(&self) -> Vec<u8> {
        debug_assert_eq!(usize::from(self.segment.payload_len), self.payload.len());
        let mut bytes = vec![0; self.segment.buffer_len()];
        let mut packet = TcpPacket::new_unchecked(&mut bytes[..]);
        self.segment.emit(&mut packet);
        packet.payload_mut_slice().copy_from_slice(&self.payload);
        packet.fill_checksum(self.src, self.dst);
        bytes
    }
}

/// Why a connection was removed from the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The retransmission shift passed its limit.
    RetransmissionExceeded,

    /// The TIME_WAIT linger ran out.
    Timer2msl,

    /// The handshake did not complete in time.
    TimerConnectionEstablished,

    /// The peer never closed its side of a half-closed connection.
    TimerFinWait2,

    /// An acceptable RST arrived.
    Reset,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DropReason::RetransmissionExceeded => write!(f, "retransmission limit exceeded"),
            DropReason::Timer2msl => write!(f, "2msl timer expired"),
            DropReason::TimerConnectionEstablished => write!(f, "connection establishment timed out"),
            DropReason::TimerFinWait2 => write!(f, "fin_wait_2 timer expired"),
            DropReason::Reset => write!(f, "connection reset"),
        }
    }
}

/// Notifications for the host adapter.
///
/// These wake whoever is parked on the named connection; the engine itself
/// never parks anyone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The handshake completed; `connect` or accept waiters may proceed.
    Established(FourTuple),

    /// In-order data or an end-of-stream marker arrived; readers may proceed.
    Received(FourTuple),

    /// The connection was removed; everybody waiting on it may give up.
    Drop(FourTuple, DropReason),
}

/// The error type for user operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The peer closed its direction and everything received was consumed.
    Eof,

    /// No connection with this id.
    NotFound,

    /// The four-tuple is already connected or the port is taken.
    InUse,

    /// No ephemeral port could be found.
    Exhausted,

    /// The send direction was already shut down.
    Shutdown,

    /// A stored lower-layer fault, surfaced on failure.
    Soft(SoftError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Eof => write!(f, "end of stream"),
            Error::NotFound => write!(f, "no such connection"),
            Error::InUse => write!(f, "address in use"),
            Error::Exhausted => write!(f, "no free local port"),
            Error::Shutdown => write!(f, "send side already shut down"),
            Error::Soft(err) => write!(f, "{}", err),
        }
    }
}

/// The result type for user operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The engine: listener ports, connections, and injected randomness.
pub struct Engine {
    host: String,
    rng: Box<dyn FnMut(usize) -> Vec<u8> + Send>,
    listeners: BTreeSet<u16>,
    connections: BTreeMap<FourTuple, Connection>,
    sndbufsize: usize,
    rcvbufsize: usize,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Engine")
            .field("host", &self.host)
            .field("listeners", &self.listeners)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Engine {
    /// Create an empty engine.
    ///
    /// `host` names this engine in log lines. `rng` must return the
    /// requested number of uniformly random bytes; it seeds initial
    /// sequence numbers and ephemeral ports, so its quality is the
    /// engine's RFC 6528 story.
    pub fn new(host: impl Into<String>, rng: impl FnMut(usize) -> Vec<u8> + Send + 'static) -> Self {
        Engine {
            host: host.into(),
            rng: Box::new(rng),
            listeners: BTreeSet::new(),
            connections: BTreeMap::new(),
            sndbufsize: DEFAULT_BUFSIZE,
            rcvbufsize: DEFAULT_BUFSIZE,
        }
    }

    /// Set the buffer caps applied to connections created from now on.
    pub fn set_buffer_sizes(&mut self, sndbufsize: usize, rcvbufsize: usize) {
        self.sndbufsize = sndbufsize;
        self.rcvbufsize = rcvbufsize;
    }

    /// The name this engine logs under.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Start accepting connection requests on `port`.
    pub fn listen(&mut self, port: u16) {
        net_trace!("{}: listening on port {}", self.host, port);
        self.listeners.insert(port);
    }

    /// Stop accepting connection requests on `port`.
    ///
    /// Connections already past their initial SYN are unaffected.
    pub fn unlisten(&mut self, port: u16) {
        net_trace!("{}: closing listener on port {}", self.host, port);
        self.listeners.remove(&port);
    }

    /// Whether `port` currently accepts connection requests.
    pub fn is_listening(&self, port: u16) -> bool {
        self.listeners.contains(&port)
    }

    /// Inspect a connection.
    ///
    /// The engine and its user are on the same side of the protection
    /// boundary, so there is no reason to hide connection internals from
    /// tests or diagnostics.
    pub fn connection(&self, id: &FourTuple) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// The ids of all live connections.
    pub fn connection_ids(&self) -> impl Iterator<Item = &FourTuple> {
        self.connections.keys()
    }

    /// Actively open a connection to `remote:remote_port`.
    ///
    /// Allocates an ephemeral local port, creates the connection in
    /// SYN_SENT and returns the initial SYN for transmission. The
    /// handshake completes asynchronously; wait for
    /// [`Event::Established`].
    ///
    /// [`Event::Established`]: enum.Event.html
    pub fn connect(
        &mut self,
        now: Instant,
        local: IpAddress,
        remote: IpAddress,
        remote_port: u16,
    ) -> Result<(FourTuple, Transmit)> {
        let local_port = self.ephemeral_port(local, remote, remote_port).ok_or(Error::Exhausted)?;
        let id = FourTuple { local, remote, local_port, remote_port };
        if self.connections.contains_key(&id) {
            return Err(Error::InUse);
        }

        let mut conn = Connection::new(TcpState::SynSent, now, self.sndbufsize, self.rcvbufsize);
        let iss = self.fresh_isn();
        let window = conn.receive_window();
        let cb = &mut conn.cb;
        cb.iss = iss;
        cb.snd_una = iss;
        cb.snd_nxt = iss + 1;
        cb.snd_max = iss + 1;
        cb.snd_recover = iss;
        cb.rcv_wnd = window;
        cb.request_r_scale = Some(ControlBlock::scale_for(conn.rcvbufsize));
        cb.snd_cwnd = initial_cwnd(cb.t_maxseg);
        cb.tt_conn_est = Expiration::When(now + CONN_EST_TIMEOUT);
        cb.tt_rexmt = Some(Timed::new(
            Rexmt { mode: RexmtMode::SynRexmt, shift: 0 },
            now + cb.t_rttinf.rto(),
        ));
        cb.t_rttseg = Some((now, cb.snd_nxt));

        let repr = segment::syn(&conn.cb, &id);
        net_trace!("{}: {} connecting, {}", self.host, id, repr);
        self.connections.insert(id, conn);

        Ok((id, Transmit { src: local, dst: remote, segment: repr, payload: Vec::new() }))
    }

    /// Queue bytes for sending.
    ///
    /// Returns how many bytes were accepted (the send buffer is a cap,
    /// not an allocator) along with any segments ready to go out. A
    /// short count means the caller should park until acknowledgements
    /// free buffer space.
    pub fn send(&mut self, now: Instant, id: &FourTuple, data: &[u8]) -> Result<(usize, Vec<Transmit>)> {
        let conn = self.connections.get_mut(id).ok_or(Error::NotFound)?;
        if conn.cantsndmore {
            return Err(match conn.cb.t_softerror.take() {
                Some(soft) => Error::Soft(soft),
                None => Error::Shutdown,
            });
        }

        let room = conn.sndbufsize.saturating_sub(conn.sndq.len());
        let accepted = room.min(data.len());
        conn.sndq.extend_from_slice(&data[..accepted]);

        let outs = output::flush(now, id, conn);
        Ok((accepted, outs))
    }

    /// Drain everything received in order.
    ///
    /// An empty result with the connection intact means the caller should
    /// park until [`Event::Received`]. `Err(Eof)` marks the end of the
    /// stream. Draining the receive buffer may open the advertised window
    /// enough to warrant an immediate window update.
    ///
    /// [`Event::Received`]: enum.Event.html
    pub fn recv(&mut self, now: Instant, id: &FourTuple) -> Result<(Vec<u8>, Vec<Transmit>)> {
        let conn = self.connections.get_mut(id).ok_or(Error::NotFound)?;

        if conn.rcvq.is_empty() {
            return if conn.cantrcvmore { Err(Error::Eof) } else { Ok((Vec::new(), Vec::new())) };
        }

        let data = core::mem::replace(&mut conn.rcvq, Vec::new());
        conn.cb.rcv_wnd = conn.receive_window();

        // A window update is worth a segment once the advertised edge lags
        // half the buffer behind what we could offer.
        let mut outs = Vec::new();
        let advertised = conn.cb.rcv_adv.distance(conn.cb.rcv_nxt).max(0) as usize;
        if conn.state.synchronised() && advertised < conn.rcvbufsize / 2 {
            conn.cb.ack_now = true;
            outs = output::flush(now, id, conn);
        }

        Ok((data, outs))
    }

    /// Shut down the send direction and begin closing.
    ///
    /// The FIN goes out once the send queue drains. Receiving continues
    /// until the peer closes its direction; repeated closes are no-ops.
    pub fn close(&mut self, now: Instant, id: &FourTuple) -> Result<Vec<Transmit>> {
        let mut conn = self.connections.remove(id).ok_or(Error::NotFound)?;
        if conn.cantsndmore {
            self.connections.insert(*id, conn);
            return Ok(Vec::new());
        }
        conn.cantsndmore = true;

        match conn.state {
            TcpState::SynSent => {
                // Nothing was ever synchronised; just forget the connection.
                net_trace!("{}: {} closed before handshake", self.host, id);
                return Ok(Vec::new());
            }
            TcpState::SynReceived | TcpState::Established => conn.state = TcpState::FinWait1,
            TcpState::CloseWait => conn.state = TcpState::LastAck,
            _ => (),
        }
        net_trace!("{}: {} -> {}", self.host, id, conn.state);

        let outs = output::flush(now, id, &mut conn);
        self.connections.insert(*id, conn);
        Ok(outs)
    }

    /// Store a fault reported by a lower layer (e.g. ICMP) for `id`.
    pub fn soft_error(&mut self, id: &FourTuple, error: SoftError) {
        if let Some(conn) = self.connections.get_mut(id) {
            net_debug!("{}: {} soft error: {}", self.host, id, error);
            conn.record_soft_error(error);
        }
    }

    /// Draw a fresh initial sequence number from the injected randomness.
    pub(crate) fn fresh_isn(&mut self) -> TcpSeqNumber {
        let bytes = (self.rng)(4);
        let mut word = [0u8; 4];
        for (slot, byte) in word.iter_mut().zip(bytes.iter()) {
            *slot = *byte;
        }
        TcpSeqNumber(i32::from_be_bytes(word))
    }

    fn ephemeral_port(&mut self, local: IpAddress, remote: IpAddress, remote_port: u16) -> Option<u16> {
        let span = u32::from(u16::max_value() - EPHEMERAL_MIN) + 1;
        for _ in 0..32 {
            let bytes = (self.rng)(2);
            let raw = u16::from(*bytes.get(0).unwrap_or(&0)) << 8 | u16::from(*bytes.get(1).unwrap_or(&0));
            let port = EPHEMERAL_MIN + (u32::from(raw) % span) as u16;
            if self.listeners.contains(&port) {
                continue;
            }
            let id = FourTuple { local, remote, local_port: port, remote_port };
            if !self.connections.contains_key(&id) {
                return Some(port);
            }
        }
        None
    }
}

/// The initial congestion window of RFC 3390.
pub(crate) fn initial_cwnd(maxseg: u32) -> u32 {
    (4 * maxseg).min((2 * maxseg).max(4380))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::Ipv4Address;

    fn fixed_rng(bytes: &'static [u8]) -> impl FnMut(usize) -> Vec<u8> + Send {
        let mut at = 0;
        move |n| {
            let out = bytes.iter().cycle().skip(at).take(n).cloned().collect();
            at += n;
            out
        }
    }

    #[test]
    fn listener_set() {
        let mut engine = Engine::new("host", fixed_rng(&[1, 2, 3, 4]));
        engine.listen(80);
        assert!(engine.is_listening(80));
        engine.unlisten(80);
        assert!(!engine.is_listening(80));
    }

    #[test]
    fn isn_is_rng_output() {
        let mut engine = Engine::new("host", fixed_rng(&[0x12, 0x34, 0x56, 0x78]));
        assert_eq!(engine.fresh_isn(), TcpSeqNumber(0x12345678));
    }

    #[test]
    fn connect_creates_syn_sent() {
        let mut engine = Engine::new("host", fixed_rng(&[7; 16]));
        let now = Instant::from_millis(0);
        let local = IpAddress::Ipv4(Ipv4Address::new(10, 0, 0, 1));
        let remote = IpAddress::Ipv4(Ipv4Address::new(10, 0, 0, 2));
        let (id, syn) = engine.connect(now, local, remote, 80).unwrap();

        assert!(id.local_port >= 49152);
        let conn = engine.connection(&id).unwrap();
        assert_eq!(conn.state, TcpState::SynSent);
        assert!(syn.segment.flags.syn());
        assert!(!syn.segment.flags.ack());
        assert_eq!(syn.segment.seq_number, conn.cb.iss);
        assert_eq!(syn.segment.max_seg_size, Some(DEFAULT_ADVMSS as u16));
        assert!(syn.segment.window_scale.is_some());
    }

    #[test]
    fn initial_window() {
        assert_eq!(initial_cwnd(536), 2144);
        assert_eq!(initial_cwnd(1460), 4380);
        assert_eq!(initial_cwnd(4000), 8000);
    }
}
