//! Per-connection state.
//!
//! The control block groups the sequence-space scalars, negotiated
//! parameters, timers and recovery state of one connection; `Connection`
//! wraps it together with the user-visible stream state (shutdown flags and
//! the send/receive queues). Listening is not a connection state here: the
//! engine keeps a plain port set, and a connection that would reach CLOSED
//! is removed from the engine instead.
use core::fmt;

use super::rtt::RttEstimator;
use super::reassembly::ReassemblyQueue;
use super::{INITIAL_SSTHRESH, MAX_WINDOW_SCALE};
use crate::time::{Expiration, Instant};
use crate::wire::TcpSeqNumber;

/// The state of a connection's state machine.
///
/// LISTEN and CLOSED are deliberately absent. A listening port has no
/// control block to put in a state, and a closed connection has no entry
/// to carry one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// An open connection request.
    SynSent,

    /// Connection request we intend to answer, waiting on ack.
    SynReceived,

    /// An open connection.
    Established,

    /// Other side closed its direction.
    CloseWait,

    /// Closed our side, FIN not yet acknowledged.
    FinWait1,

    /// Closed our side, FIN acknowledged.
    FinWait2,

    /// Closed both sides but we don't know the other knows.
    Closing,

    /// Closed after the other side closed its direction already.
    LastAck,

    /// Both sides recognized the connection as closed.
    TimeWait,
}

impl TcpState {
    /// Whether sequence numbers have been synchronised with the peer.
    pub fn synchronised(self) -> bool {
        !matches!(self, TcpState::SynSent | TcpState::SynReceived)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// A value paired with the deadline at which it applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timed<T> {
    pub value: T,
    pub expires: Instant,
}

impl<T> Timed<T> {
    pub fn new(value: T, expires: Instant) -> Self {
        Timed { value, expires }
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.expires <= now
    }
}

/// What the retransmission timer is counting down towards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RexmtMode {
    /// Retransmit the initial SYN or SYN+ACK.
    SynRexmt,

    /// Retransmit from the oldest unacknowledged byte.
    Rexmt,

    /// Probe a zero receive window with a single byte.
    Persist,
}

/// The retransmission timer value: its mode and consecutive-expiry count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rexmt {
    pub mode: RexmtMode,
    pub shift: u8,
}

/// A transient fault reported by a lower layer.
///
/// Stored on the connection and surfaced when a user operation fails;
/// a lone ICMP error never kills a connection by itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftError {
    HostUnreachable,
    PortUnreachable,
    TtlExceeded,
}

impl fmt::Display for SoftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SoftError::HostUnreachable => write!(f, "host unreachable"),
            SoftError::PortUnreachable => write!(f, "port unreachable"),
            SoftError::TtlExceeded => write!(f, "time to live exceeded"),
        }
    }
}

/// The per-connection protocol scalars.
///
/// Field names follow the classic control-block vocabulary (`snd_*`,
/// `rcv_*`, `t_*`, `tt_*`) since every rule in the input and output paths
/// is written against them.
#[derive(Clone, Debug)]
pub struct ControlBlock {
    /// Oldest unacknowledged sequence number.
    pub snd_una: TcpSeqNumber,

    /// Next sequence number to send.
    pub snd_nxt: TcpSeqNumber,

    /// Highest sequence number ever sent.
    pub snd_max: TcpSeqNumber,

    /// Segment sequence number of the last window update.
    pub snd_wl1: TcpSeqNumber,

    /// Segment acknowledgement number of the last window update.
    pub snd_wl2: TcpSeqNumber,

    /// Initial send sequence number.
    pub iss: TcpSeqNumber,

    /// Send window advertised by the peer, scaled.
    pub snd_wnd: u32,

    /// Congestion window.
    pub snd_cwnd: u32,

    /// Slow-start threshold.
    pub snd_ssthresh: u32,

    /// End marker for fast recovery.
    pub snd_recover: TcpSeqNumber,

    /// Next sequence number expected from the peer.
    pub rcv_nxt: TcpSeqNumber,

    /// Receive window we advertise, scaled.
    pub rcv_wnd: u32,

    /// Right edge of the window last advertised.
    pub rcv_adv: TcpSeqNumber,

    /// Initial receive sequence number.
    pub irs: TcpSeqNumber,

    /// Acknowledgement number in the last segment we sent.
    pub last_ack_sent: TcpSeqNumber,

    /// Whether the last advertised window was zero.
    pub rxwin0_sent: bool,

    /// Negotiated maximum segment size for sending.
    pub t_maxseg: u32,

    /// The maximum segment size we advertise.
    pub t_advmss: u32,

    /// Both sides agreed to window scaling.
    pub doing_ws: bool,

    /// Scale applied to windows the peer advertises.
    pub snd_scale: u8,

    /// Scale applied to windows we advertise.
    pub rcv_scale: u8,

    /// The scale we ask for while negotiating.
    pub request_r_scale: Option<u8>,

    /// Retransmission / persist timer.
    pub tt_rexmt: Option<Timed<Rexmt>>,

    /// TIME_WAIT linger deadline.
    pub tt_2msl: Expiration,

    /// Delayed acknowledgement deadline.
    pub tt_delack: Expiration,

    /// Handshake abandonment deadline.
    pub tt_conn_est: Expiration,

    /// FIN_WAIT_2 abandonment deadline.
    pub tt_fin_wait_2: Expiration,

    /// Last time a segment arrived for this connection.
    pub t_idletime: Instant,

    /// The send time and end sequence of the segment being timed.
    pub t_rttseg: Option<(Instant, TcpSeqNumber)>,

    /// Round-trip estimator.
    pub t_rttinf: RttEstimator,

    /// Consecutive duplicate acknowledgements seen.
    pub t_dupacks: u8,

    /// Deadline within which an ack proves the last retransmit spurious.
    pub t_badrxtwin: Expiration,

    /// Congestion window saved for spurious-retransmit recovery.
    pub snd_cwnd_prev: u32,

    /// Slow-start threshold saved for spurious-retransmit recovery.
    pub snd_ssthresh_prev: u32,

    /// Stored lower-layer fault, surfaced on user-operation failure.
    pub t_softerror: Option<SoftError>,

    /// An acknowledgement must go out as soon as possible.
    pub ack_now: bool,

    /// Our FIN has been transmitted at least once.
    pub fin_sent: bool,
}

impl ControlBlock {
    /// A zeroed control block; the opener fills in the sequence state.
    pub fn new(now: Instant) -> Self {
        ControlBlock {
            snd_una: TcpSeqNumber::default(),
            snd_nxt: TcpSeqNumber::default(),
            snd_max: TcpSeqNumber::default(),
            snd_wl1: TcpSeqNumber::default(),
            snd_wl2: TcpSeqNumber::default(),
            iss: TcpSeqNumber::default(),
            snd_wnd: 0,
            snd_cwnd: 0,
            snd_ssthresh: INITIAL_SSTHRESH,
            snd_recover: TcpSeqNumber::default(),
            rcv_nxt: TcpSeqNumber::default(),
            rcv_wnd: 0,
            rcv_adv: TcpSeqNumber::default(),
            irs: TcpSeqNumber::default(),
            last_ack_sent: TcpSeqNumber::default(),
            rxwin0_sent: false,
            t_maxseg: super::DEFAULT_MSS,
            t_advmss: super::DEFAULT_ADVMSS,
            doing_ws: false,
            snd_scale: 0,
            rcv_scale: 0,
            request_r_scale: None,
            tt_rexmt: None,
            tt_2msl: Expiration::Never,
            tt_delack: Expiration::Never,
            tt_conn_est: Expiration::Never,
            tt_fin_wait_2: Expiration::Never,
            t_idletime: now,
            t_rttseg: None,
            t_rttinf: RttEstimator::default(),
            t_dupacks: 0,
            t_badrxtwin: Expiration::Never,
            snd_cwnd_prev: 0,
            snd_ssthresh_prev: 0,
            t_softerror: None,
            ack_now: false,
            fin_sent: false,
        }
    }

    /// The window-scale shift that makes `bufsize` advertisable.
    pub fn scale_for(bufsize: usize) -> u8 {
        let mut scale = 0;
        while scale < MAX_WINDOW_SCALE && (0xffff_usize << scale) < bufsize {
            scale += 1;
        }
        scale
    }

    /// The sequence number one past the last byte of the stream, once the
    /// user has shut the send side down. The FIN occupies this number.
    pub fn fin_seq(&self, sndq_len: usize) -> TcpSeqNumber {
        self.snd_una + sndq_len
    }

    /// Cancel every timer; used on transitions that settle the connection.
    pub fn cancel_timers(&mut self) {
        self.tt_rexmt = None;
        self.tt_delack.cancel();
        self.tt_conn_est.cancel();
        self.tt_fin_wait_2.cancel();
    }
}

/// One connection: state machine state, control block and stream buffers.
#[derive(Clone, Debug)]
pub struct Connection {
    /// The current state machine state.
    pub state: TcpState,

    /// Protocol scalars.
    pub cb: ControlBlock,

    /// The receive direction was shut down (FIN seen or user shutdown).
    pub cantrcvmore: bool,

    /// The send direction was shut down by the user.
    pub cantsndmore: bool,

    /// Cap on bytes buffered for sending.
    pub sndbufsize: usize,

    /// Cap on bytes buffered for receiving.
    pub rcvbufsize: usize,

    /// Bytes accepted from the user, not yet acknowledged by the peer.
    /// The front of the queue sits at `snd_una`.
    pub sndq: Vec<u8>,

    /// Bytes received in order, not yet consumed by the user.
    pub rcvq: Vec<u8>,

    /// Segments received ahead of `rcv_nxt`.
    pub reasm: ReassemblyQueue,
}

impl Connection {
    pub fn new(state: TcpState, now: Instant, sndbufsize: usize, rcvbufsize: usize) -> Self {
        Connection {
            state,
            cb: ControlBlock::new(now),
            cantrcvmore: false,
            cantsndmore: false,
            sndbufsize,
            rcvbufsize,
            sndq: Vec::new(),
            rcvq: Vec::new(),
            reasm: ReassemblyQueue::new(),
        }
    }

    /// The receive window backed by actual buffer space.
    pub fn receive_window(&self) -> u32 {
        self.rcvbufsize.saturating_sub(self.rcvq.len() + self.reasm.len_bytes()) as u32
    }

    /// Record a fault from a lower layer for later surfacing.
    pub fn record_soft_error(&mut self, error: SoftError) {
        self.cb.t_softerror = Some(error);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scale_covers_buffer() {
        assert_eq!(ControlBlock::scale_for(0xffff), 0);
        assert_eq!(ControlBlock::scale_for(0x10000), 1);
        assert_eq!(ControlBlock::scale_for(64 * 1024), 1);
        assert_eq!(ControlBlock::scale_for(1 << 30), 14);
        assert_eq!(ControlBlock::scale_for(usize::max_value()), 14);
    }

    #[test]
    fn synchronised_states() {
        assert!(!TcpState::SynSent.synchronised());
        assert!(!TcpState::SynReceived.synchronised());
        assert!(TcpState::Established.synchronised());
        assert!(TcpState::TimeWait.synchronised());
    }
}
