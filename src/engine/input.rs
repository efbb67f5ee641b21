//! The input path.
//!
//! One decoded segment flows through three stages: validation (checksum
//! and shape), classification (which connection, which state), and a rule
//! chosen by that state. The rule granularity follows the Netsem TCP1
//! decomposition (`deliver_in_1` for a passive open, `deliver_in_2*` for
//! SYN_SENT, `deliver_in_3*` for synchronised states) because every rule
//! has its own acceptance conditions and the flat structure keeps each one
//! testable on its own.
//!
//! Nothing in here transmits. Rules record what they owe the peer in the
//! control block (`ack_now`, queued data, a state that implies a FIN) and
//! the output path turns that into segments.
use super::connection::{Connection, ControlBlock, Rexmt, RexmtMode, TcpState, Timed};
use super::{output, segment, DropReason, Event, FourTuple, Transmit, CONN_EST_TIMEOUT, DELACK_TIMEOUT, MSL};
use crate::time::{Expiration, Instant};
use crate::wire::{IpAddress, TcpChecksum, TcpRepr, TcpSeqNumber};

/// What should happen to the connection after a rule ran.
enum Disposition {
    Keep,
    Destroy,
}

impl super::Engine {
    /// Process one TCP payload delivered by the internet layer.
    ///
    /// `src` and `dst` are the addresses of the datagram that carried
    /// `data`; the checksum is verified against them. Returns the segments
    /// to transmit in response and the events to wake waiters with.
    pub fn handle(
        &mut self,
        now: Instant,
        src: IpAddress,
        dst: IpAddress,
        data: &[u8],
    ) -> (Vec<Transmit>, Vec<Event>) {
        let mut outs = Vec::new();
        let mut events = Vec::new();

        let checksum = TcpChecksum::Manual { src_addr: src, dst_addr: dst };
        let repr = match TcpRepr::parse(data, &checksum) {
            Ok(repr) => repr,
            Err(error) => {
                net_debug!("{}: dropping segment from {}: {}", self.host, src, error);
                return (outs, events);
            }
        };
        let payload = &data[data.len() - usize::from(repr.payload_len)..];

        let id = FourTuple {
            local: dst,
            remote: src,
            local_port: repr.dst_port,
            remote_port: repr.src_port,
        };

        let mut conn = match self.connections.remove(&id) {
            Some(conn) => conn,
            None => {
                self.deliver_no_connection(now, id, &repr, &mut outs);
                return (outs, events);
            }
        };

        net_trace!("{}: {} in {} got {}", self.host, id, conn.state, repr);
        let disposition = match conn.state {
            TcpState::SynSent => {
                self.deliver_syn_sent(now, &id, &mut conn, &repr, &mut outs, &mut events)
            }
            TcpState::SynReceived => {
                self.deliver_syn_received(now, &id, &mut conn, &repr, payload, &mut outs, &mut events)
            }
            _ => self.deliver_synchronised(now, &id, &mut conn, &repr, payload, &mut outs, &mut events),
        };

        match disposition {
            Disposition::Keep => {
                self.connections.insert(id, conn);
            }
            Disposition::Destroy => {
                net_debug!("{}: {} destroyed", self.host, id);
            }
        }

        (outs, events)
    }

    /// No connection matches: a passive open if a listener wants the SYN,
    /// a reset otherwise.
    fn deliver_no_connection(
        &mut self,
        now: Instant,
        id: FourTuple,
        repr: &TcpRepr,
        outs: &mut Vec<Transmit>,
    ) {
        let (syn, fin, rst, ack) = repr.flags.control();
        if self.listeners.contains(&id.local_port) && syn && !fin && !rst && !ack {
            self.deliver_passive_open(now, id, repr, outs);
            return;
        }

        // Not for us. Answer with a reset unless the offender was one.
        match segment::reset_for(repr) {
            Some(reset) => {
                net_debug!("{}: resetting stray segment from {}:{}", self.host, id.remote, id.remote_port);
                outs.push(Transmit {
                    src: id.local,
                    dst: id.remote,
                    segment: reset,
                    payload: Vec::new(),
                });
            }
            None => {
                net_trace!("{}: ignoring stray reset from {}:{}", self.host, id.remote, id.remote_port);
            }
        }
    }

    /// `deliver_in_1`: a SYN for a listening port opens a connection in
    /// SYN_RECEIVED and answers with SYN+ACK.
    fn deliver_passive_open(
        &mut self,
        now: Instant,
        id: FourTuple,
        repr: &TcpRepr,
        outs: &mut Vec<Transmit>,
    ) {
        let mut conn = Connection::new(TcpState::SynReceived, now, self.sndbufsize, self.rcvbufsize);
        let iss = self.fresh_isn();
        let window = conn.receive_window();

        let cb = &mut conn.cb;
        cb.iss = iss;
        cb.snd_una = iss;
        cb.snd_nxt = iss + 1;
        cb.snd_max = iss + 1;
        cb.snd_recover = iss;
        cb.irs = repr.seq_number;
        cb.rcv_nxt = repr.seq_number + 1;
        cb.rcv_wnd = window;
        cb.rcv_adv = cb.rcv_nxt + window as usize;
        cb.last_ack_sent = cb.rcv_nxt;
        negotiate(cb, repr, conn.rcvbufsize);
        cb.snd_wnd = u32::from(repr.window_len);
        cb.snd_wl1 = repr.seq_number;
        cb.tt_conn_est = Expiration::When(now + CONN_EST_TIMEOUT);
        cb.tt_rexmt = Some(Timed::new(
            Rexmt { mode: RexmtMode::SynRexmt, shift: 0 },
            now + cb.t_rttinf.rto(),
        ));
        cb.t_rttseg = Some((now, cb.snd_nxt));

        let answer = segment::syn_ack(&conn.cb, &id);
        net_trace!("{}: {} passive open, answering {}", self.host, id, answer);
        outs.push(Transmit { src: id.local, dst: id.remote, segment: answer, payload: Vec::new() });
        self.connections.insert(id, conn);
    }

    /// `deliver_in_2` and friends: everything that can reach SYN_SENT.
    fn deliver_syn_sent(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        repr: &TcpRepr,
        outs: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) -> Disposition {
        let (syn, fin, rst, ack) = repr.flags.control();

        match (syn, fin, rst, ack) {
            // The expected SYN+ACK completes the handshake.
            (true, false, false, true) if repr.ack_number == Some(conn.cb.snd_nxt) => {
                let cb = &mut conn.cb;
                cb.snd_una = repr.ack_number.unwrap();
                cb.irs = repr.seq_number;
                cb.rcv_nxt = repr.seq_number + 1;
                negotiate(cb, repr, conn.rcvbufsize);
                cb.snd_wnd = u32::from(repr.window_len);
                cb.snd_wl1 = repr.seq_number;
                cb.snd_wl2 = repr.ack_number.unwrap();
                if let Some((sent, timed_seq)) = cb.t_rttseg {
                    if cb.snd_una.distance(timed_seq) >= 0 {
                        cb.t_rttinf.sample((now - sent).as_millis() as u32);
                        cb.t_rttseg = None;
                    }
                }
                cb.tt_rexmt = None;
                cb.tt_conn_est.cancel();
                cb.ack_now = true;
                conn.state = TcpState::Established;
                net_trace!("{}: {} established", self.host, id);
                events.push(Event::Established(*id));
                outs.extend(output::flush(now, id, conn));
                Disposition::Keep
            }

            // `deliver_in_2b`: a bare SYN crossing ours, the simultaneous
            // open. Both ends answer SYN+ACK and meet in SYN_RECEIVED.
            (true, false, false, false) => {
                let cb = &mut conn.cb;
                cb.irs = repr.seq_number;
                cb.rcv_nxt = repr.seq_number + 1;
                negotiate(cb, repr, conn.rcvbufsize);
                cb.snd_wnd = u32::from(repr.window_len);
                cb.snd_wl1 = repr.seq_number;
                cb.tt_rexmt = Some(Timed::new(
                    Rexmt { mode: RexmtMode::SynRexmt, shift: 0 },
                    now + cb.t_rttinf.rto(),
                ));
                conn.state = TcpState::SynReceived;
                let answer = segment::syn_ack(cb, id);
                net_trace!("{}: {} simultaneous open, answering {}", self.host, id, answer);
                cb.last_ack_sent = cb.rcv_nxt;
                outs.push(Transmit { src: id.local, dst: id.remote, segment: answer, payload: Vec::new() });
                Disposition::Keep
            }

            // `deliver_in_2a`: the connection was refused. No answer.
            (false, false, true, true) if repr.ack_number == Some(conn.cb.snd_nxt) => {
                net_debug!("{}: {} refused by peer", self.host, id);
                events.push(Event::Drop(*id, DropReason::Reset));
                Disposition::Destroy
            }

            // Anything else is noise while our SYN is in flight.
            _ => {
                net_trace!("{}: {} dropping {} in SYN_SENT", self.host, id, repr);
                Disposition::Keep
            }
        }
    }

    /// `deliver_in_3c`/`3d`: the handshake acknowledgement for a passive
    /// or simultaneous open. The acceptance conditions are strict; an
    /// unexpected segment tears the half-open connection down.
    fn deliver_syn_received(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        repr: &TcpRepr,
        payload: &[u8],
        outs: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) -> Disposition {
        let (syn, fin, rst, ack) = repr.flags.control();
        let acceptable = repr.seq_number == conn.cb.rcv_nxt
            && !syn
            && !fin
            && !rst
            && ack
            && repr.ack_number == Some(conn.cb.snd_nxt);

        if !acceptable {
            net_debug!("{}: {} bad handshake ack, resetting", self.host, id);
            if let Some(reset) = segment::reset_for(repr) {
                outs.push(Transmit { src: id.local, dst: id.remote, segment: reset, payload: Vec::new() });
            }
            events.push(Event::Drop(*id, DropReason::Reset));
            return Disposition::Destroy;
        }

        {
            let cb = &mut conn.cb;
            cb.snd_una = repr.ack_number.unwrap();
            cb.snd_wnd = u32::from(repr.window_len) << if cb.doing_ws { cb.snd_scale } else { 0 };
            cb.snd_wl1 = repr.seq_number;
            cb.snd_wl2 = repr.ack_number.unwrap();
            if let Some((sent, timed_seq)) = cb.t_rttseg {
                if cb.snd_una.distance(timed_seq) >= 0 {
                    cb.t_rttinf.sample((now - sent).as_millis() as u32);
                    cb.t_rttseg = None;
                }
            }
            cb.tt_rexmt = None;
            cb.tt_conn_est.cancel();
        }
        conn.state = TcpState::Established;
        net_trace!("{}: {} established", self.host, id);
        events.push(Event::Established(*id));

        // The acknowledgement may carry data; run it through the
        // synchronised path now that we are established.
        self.deliver_synchronised(now, id, conn, repr, payload, outs, events)
    }

    /// The synchronised-state entry: RFC 793 acceptability, RFC 5961
    /// challenge ACKs, RFC 1337 TIME_WAIT immunity, then `deliver_in_3`.
    fn deliver_synchronised(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        repr: &TcpRepr,
        payload: &[u8],
        outs: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) -> Disposition {
        let (syn, fin, rst, ack) = repr.flags.control();
        conn.cb.t_idletime = now;

        // A reset can not assassinate TIME_WAIT (RFC 1337). The segment
        // still proves the peer is talking, so the linger restarts.
        if rst && conn.state == TcpState::TimeWait {
            net_debug!("{}: {} ignoring reset in TIME_WAIT", self.host, id);
            conn.cb.tt_2msl = Expiration::When(now + 2 * MSL);
            return Disposition::Keep;
        }

        if !in_window(&conn.cb, repr) {
            // Out-of-window segments are dropped but answered, so a peer
            // that lost synchronisation can resynchronise from the
            // acknowledgement (and a blind attacker learns nothing).
            net_debug!("{}: {} out-of-window {}", self.host, id, repr);
            if conn.state == TcpState::TimeWait {
                // A retransmitted FIN lands below the window; it still
                // proves the peer has not seen our last acknowledgement.
                conn.cb.tt_2msl = Expiration::When(now + 2 * MSL);
            }
            conn.cb.ack_now = true;
            outs.extend(output::flush(now, id, conn));
            return Disposition::Keep;
        }

        if rst {
            if repr.seq_number == conn.cb.rcv_nxt {
                net_debug!("{}: {} reset by peer", self.host, id);
                events.push(Event::Drop(*id, DropReason::Reset));
                return Disposition::Destroy;
            }
            // In window but not exactly at rcv_nxt: challenge it (RFC 5961).
            net_debug!("{}: {} challenging in-window reset", self.host, id);
            conn.cb.ack_now = true;
            outs.extend(output::flush(now, id, conn));
            return Disposition::Keep;
        }

        if syn {
            // A SYN in a synchronised state never destroys the connection;
            // the challenge ACK tells an honest peer to reset properly
            // (RFC 5961).
            net_debug!("{}: {} challenging in-window syn", self.host, id);
            conn.cb.ack_now = true;
            outs.extend(output::flush(now, id, conn));
            return Disposition::Keep;
        }

        if !ack {
            // Past the handshake every segment carries an acknowledgement.
            net_trace!("{}: {} dropping ackless segment", self.host, id);
            return Disposition::Keep;
        }

        self.deliver_in_3(now, id, conn, repr, payload, fin, outs, events)
    }

    /// `deliver_in_3`: acknowledgement processing, data processing, and
    /// the state chart.
    #[allow(clippy::too_many_arguments)]
    fn deliver_in_3(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        repr: &TcpRepr,
        payload: &[u8],
        fin: bool,
        outs: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) -> Disposition {
        let ack = match repr.ack_number {
            Some(ack) => ack,
            None => return Disposition::Keep,
        };
        let seg_wnd = u32::from(repr.window_len) << if conn.cb.doing_ws { conn.cb.snd_scale } else { 0 };

        // di3_ackstuff.
        let mut ourfinisacked = false;
        let una_dist = ack.distance(conn.cb.snd_una);
        if una_dist < 0 {
            // An old acknowledgement carries no news at all.
        } else if ack.distance(conn.cb.snd_max) > 0 {
            net_debug!("{}: {} acked unsent data", self.host, id);
            conn.cb.ack_now = true;
            outs.extend(output::flush(now, id, conn));
            return Disposition::Keep;
        } else if una_dist == 0 {
            self.di3_dupack(now, id, conn, repr, payload, fin, seg_wnd, outs);
        } else {
            ourfinisacked = self.di3_newack(now, id, conn, ack);
        }

        // Window update (RFC 793: only from segments not older than the
        // last one that updated it).
        if conn.cb.snd_wl1.distance(repr.seq_number) < 0
            || (conn.cb.snd_wl1 == repr.seq_number && conn.cb.snd_wl2.distance(ack) <= 0)
        {
            conn.cb.snd_wnd = seg_wnd;
            conn.cb.snd_wl1 = repr.seq_number;
            conn.cb.snd_wl2 = ack;
            if seg_wnd > 0 {
                if let Some(Timed { value: Rexmt { mode: RexmtMode::Persist, .. }, .. }) = conn.cb.tt_rexmt {
                    conn.cb.tt_rexmt = None;
                }
            }
        }

        // di3_datastuff.
        let (delivered, fin_now) = di3_datastuff(now, conn, repr, payload, fin);
        if delivered || fin_now {
            events.push(Event::Received(*id));
        }
        if fin_now {
            conn.cantrcvmore = true;
        }

        // di3_ststuff.
        let disposition = self.di3_ststuff(now, id, conn, fin_now, ourfinisacked);
        if let Disposition::Destroy = disposition {
            return Disposition::Destroy;
        }

        outs.extend(output::flush(now, id, conn));
        Disposition::Keep
    }

    /// A pure duplicate of `snd_una` counts towards fast retransmit; three
    /// of them mean the segment after `snd_una` is gone, not merely late.
    #[allow(clippy::too_many_arguments)]
    fn di3_dupack(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        repr: &TcpRepr,
        payload: &[u8],
        fin: bool,
        seg_wnd: u32,
        outs: &mut Vec<Transmit>,
    ) {
        let outstanding = conn.cb.snd_max.distance(conn.cb.snd_una) > 0;
        let rexmt_armed = matches!(
            conn.cb.tt_rexmt,
            Some(Timed { value: Rexmt { mode: RexmtMode::Rexmt, .. }, .. })
                | Some(Timed { value: Rexmt { mode: RexmtMode::SynRexmt, .. }, .. })
        );
        let counts = payload.is_empty()
            && !fin
            && seg_wnd == conn.cb.snd_wnd
            && rexmt_armed
            && outstanding;
        if !counts {
            conn.cb.t_dupacks = 0;
            return;
        }

        conn.cb.t_dupacks += 1;
        if conn.cb.t_dupacks == 3 {
            // Fast retransmit: halve the threshold, resend the missing
            // segment, then inflate by the three segments known to have
            // left the network.
            let cb = &mut conn.cb;
            let halved = (cb.snd_wnd.min(cb.snd_cwnd) / 2 / cb.t_maxseg).max(2) * cb.t_maxseg;
            cb.snd_ssthresh = halved;
            cb.snd_recover = cb.snd_max;
            cb.t_rttseg = None;
            let onxt = cb.snd_nxt;
            cb.snd_nxt = cb.snd_una;
            cb.snd_cwnd = cb.t_maxseg;
            cb.ack_now = true;
            net_debug!("{}: {} fast retransmit at {}", self.host, id, conn.cb.snd_una);
            outs.extend(output::flush(now, id, conn));
            let cb = &mut conn.cb;
            cb.snd_nxt = cb.snd_nxt.latest(onxt);
            cb.snd_cwnd = cb.snd_ssthresh + 3 * cb.t_maxseg;
        } else if conn.cb.t_dupacks > 3 {
            // Every further duplicate is another segment gone from flight.
            conn.cb.snd_cwnd += conn.cb.t_maxseg;
            outs.extend(output::flush(now, id, conn));
        }
    }

    /// A new acknowledgement: feed the estimators, open the congestion
    /// window, drop acknowledged bytes and manage the retransmit timer.
    fn di3_newack(&mut self, now: Instant, id: &FourTuple, conn: &mut Connection, ack: TcpSeqNumber) -> bool {
        let cb = &mut conn.cb;

        if cb.t_dupacks >= 3 {
            // Fast recovery ends; deflate to the halved threshold.
            cb.snd_cwnd = cb.snd_cwnd.min(cb.snd_ssthresh);
        }
        cb.t_dupacks = 0;

        // An acknowledgement arriving inside the bad-retransmit window can
        // only be for the original transmission: the timeout was spurious,
        // so the congestion state it clobbered comes back.
        if let Expiration::When(deadline) = cb.t_badrxtwin {
            if now < deadline {
                net_debug!("{}: {} spurious retransmit, restoring window", self.host, id);
                cb.snd_cwnd = cb.snd_cwnd_prev;
                cb.snd_ssthresh = cb.snd_ssthresh_prev;
                cb.snd_nxt = cb.snd_max;
            }
            cb.t_badrxtwin = Expiration::Never;
        }

        if let Some((sent, timed_seq)) = cb.t_rttseg {
            if ack.distance(timed_seq) >= 0 {
                cb.t_rttinf.sample((now - sent).as_millis() as u32);
                cb.t_rttseg = None;
            }
        }

        if cb.snd_cwnd < cb.snd_ssthresh {
            cb.snd_cwnd += cb.t_maxseg;
        } else {
            cb.snd_cwnd += (cb.t_maxseg * cb.t_maxseg / cb.snd_cwnd).max(1);
        }
        cb.snd_cwnd = cb.snd_cwnd.min(super::INITIAL_SSTHRESH);

        let acked = ack.distance(cb.snd_una) as usize;
        let data_acked = acked.min(conn.sndq.len());
        conn.sndq.drain(..data_acked);
        let cb = &mut conn.cb;
        cb.snd_una = ack;
        if cb.snd_nxt.distance(cb.snd_una) < 0 {
            cb.snd_nxt = cb.snd_una;
        }

        if ack == cb.snd_max {
            cb.tt_rexmt = None;
        } else {
            // A partial acknowledgement restarts the timer from scratch.
            cb.tt_rexmt = Some(Timed::new(
                Rexmt { mode: RexmtMode::Rexmt, shift: 0 },
                now + cb.t_rttinf.rto(),
            ));
        }

        cb.t_softerror = None;
        cb.fin_sent && ack == cb.snd_max
    }

    /// The `di3_ststuff` chart: where the FIN exchange leaves the state.
    fn di3_ststuff(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        fin_now: bool,
        ourfinisacked: bool,
    ) -> Disposition {
        let before = conn.state;
        match conn.state {
            TcpState::Established if fin_now => conn.state = TcpState::CloseWait,
            TcpState::FinWait1 => match (fin_now, ourfinisacked) {
                (false, true) => {
                    conn.state = TcpState::FinWait2;
                    conn.cb.tt_fin_wait_2 = Expiration::When(now + super::FIN_WAIT_2_TIMEOUT);
                }
                (true, false) => conn.state = TcpState::Closing,
                (true, true) => enter_time_wait(now, conn),
                (false, false) => (),
            },
            TcpState::FinWait2 if fin_now => enter_time_wait(now, conn),
            TcpState::Closing if ourfinisacked => enter_time_wait(now, conn),
            TcpState::LastAck if ourfinisacked => {
                // The final acknowledgement of the close handshake; the
                // connection simply ceases to exist.
                net_trace!("{}: {} close handshake finished", self.host, id);
                return Disposition::Destroy;
            }
            TcpState::TimeWait => {
                conn.cb.tt_2msl = Expiration::When(now + 2 * MSL);
            }
            _ => (),
        }
        if before != conn.state {
            net_trace!("{}: {} {} -> {}", self.host, id, before, conn.state);
        }
        Disposition::Keep
    }
}

/// Fold the options of a peer's SYN into the control block.
///
/// The maximum segment size we may send is bounded by what the peer
/// advertises, 536 when it stays silent. Window scaling is all or
/// nothing: both sides must carry the option or neither scale applies.
fn negotiate(cb: &mut ControlBlock, repr: &TcpRepr, rcvbufsize: usize) {
    let peer_mss = u32::from(repr.max_seg_size.unwrap_or(super::DEFAULT_MSS as u16));
    cb.t_maxseg = peer_mss.min(cb.t_advmss).max(super::MIN_MSS);
    cb.snd_cwnd = super::initial_cwnd(cb.t_maxseg);
    if cb.request_r_scale.is_none() {
        cb.request_r_scale = Some(ControlBlock::scale_for(rcvbufsize));
    }
    match repr.window_scale {
        Some(scale) => {
            cb.doing_ws = true;
            cb.snd_scale = scale;
            cb.rcv_scale = cb.request_r_scale.unwrap_or(0);
        }
        None => {
            cb.doing_ws = false;
            cb.snd_scale = 0;
            cb.rcv_scale = 0;
        }
    }
}

fn enter_time_wait(now: Instant, conn: &mut Connection) {
    conn.state = TcpState::TimeWait;
    conn.cb.cancel_timers();
    conn.cb.tt_2msl = Expiration::When(now + 2 * MSL);
}

/// The RFC 793 acceptability test, generalised for zero windows.
fn in_window(cb: &ControlBlock, repr: &TcpRepr) -> bool {
    let seg_len = usize::from(repr.payload_len) + repr.flags.sequence_len();
    let seq = repr.seq_number;
    let wnd_edge = cb.rcv_nxt + cb.rcv_wnd as usize;

    let in_recv_window = |seq: TcpSeqNumber| {
        seq.distance(cb.rcv_nxt) >= 0 && seq.distance(wnd_edge) < 0
    };

    match (seg_len, cb.rcv_wnd) {
        (0, 0) => seq == cb.rcv_nxt,
        (0, _) => in_recv_window(seq),
        (_, 0) => false,
        (_, _) => in_recv_window(seq) || in_recv_window(seq + (seg_len - 1)),
    }
}

/// `di3_datastuff`: in-order delivery, reassembly, and the delayed-ack
/// policy. Returns whether data was delivered and whether the stream end
/// was reached.
fn di3_datastuff(
    now: Instant,
    conn: &mut Connection,
    repr: &TcpRepr,
    payload: &[u8],
    fin: bool,
) -> (bool, bool) {
    let mut seg_seq = repr.seq_number;
    let mut data = payload;
    let mut seg_fin = fin;
    let had_payload = !payload.is_empty();

    // Trim the duplicate prefix.
    let stale = conn.cb.rcv_nxt.distance(seg_seq);
    if stale > 0 {
        let stale = stale as usize;
        if stale > data.len() || (stale == data.len() && !seg_fin) {
            // Nothing new at all; a duplicate still deserves an immediate
            // acknowledgement so the peer stops resending it.
            conn.cb.ack_now = true;
            return (false, false);
        }
        if stale >= data.len() {
            data = &[];
        } else {
            data = &data[stale..];
        }
        seg_seq = conn.cb.rcv_nxt;
    }

    // Trim the part beyond the advertised window; a FIN past the window
    // edge does not count yet.
    let wnd_edge = conn.cb.rcv_nxt + conn.cb.rcv_wnd as usize;
    let overflow = (seg_seq + data.len()).distance(wnd_edge);
    if overflow > 0 {
        let keep = data.len().saturating_sub(overflow as usize);
        data = &data[..keep];
        seg_fin = false;
    }

    let mut delivered = false;
    let mut fin_now = false;

    if !data.is_empty() || seg_fin {
        if seg_seq == conn.cb.rcv_nxt {
            // In order: straight into the receive queue.
            if !data.is_empty() {
                conn.cb.rcv_nxt += data.len();
                if !conn.cantrcvmore {
                    conn.rcvq.extend_from_slice(data);
                    delivered = true;
                }
                if conn.cb.tt_delack.is_armed() {
                    // At most every second data segment rides the delack.
                    conn.cb.ack_now = true;
                } else {
                    conn.cb.tt_delack = Expiration::When(now + DELACK_TIMEOUT);
                }
            }
            if seg_fin {
                conn.cb.rcv_nxt += 1usize;
                conn.cb.ack_now = true;
                fin_now = true;
            }
        } else {
            // Out of order: park it and tell the peer where we stand.
            conn.reasm.insert(seg_seq, seg_fin, data);
            conn.cb.ack_now = true;
        }
    } else if had_payload {
        conn.cb.ack_now = true;
    }

    // Pull whatever just became contiguous.
    loop {
        match conn.reasm.maybe_take(conn.cb.rcv_nxt) {
            Some((bytes, reasm_fin)) => {
                conn.cb.rcv_nxt += bytes.len();
                conn.cb.ack_now = true;
                if !bytes.is_empty() && !conn.cantrcvmore {
                    conn.rcvq.extend_from_slice(&bytes);
                    delivered = true;
                }
                if reasm_fin {
                    conn.cb.rcv_nxt += 1usize;
                    fin_now = true;
                    break;
                }
            }
            None => break,
        }
    }

    conn.cb.rcv_wnd = conn.receive_window();
    (delivered, fin_now)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::time::Instant;
    use crate::wire::{TcpFlags, TcpSeqNumber};

    fn block() -> ControlBlock {
        let mut cb = ControlBlock::new(Instant::from_millis(0));
        cb.rcv_nxt = TcpSeqNumber(1000);
        cb.rcv_wnd = 100;
        cb
    }

    fn probe(seq: i32, payload_len: u16) -> TcpRepr {
        TcpRepr {
            src_port: 1,
            dst_port: 2,
            flags: {
                let mut flags = TcpFlags::default();
                flags.set_ack(true);
                flags
            },
            seq_number: TcpSeqNumber(seq),
            ack_number: Some(TcpSeqNumber(0)),
            window_len: 0,
            window_scale: None,
            max_seg_size: None,
            payload_len,
        }
    }

    #[test]
    fn acceptability_empty_segment() {
        let cb = block();
        assert!(in_window(&cb, &probe(1000, 0)));
        assert!(in_window(&cb, &probe(1099, 0)));
        assert!(!in_window(&cb, &probe(1100, 0)));
        assert!(!in_window(&cb, &probe(999, 0)));
    }

    #[test]
    fn acceptability_data_segment() {
        let cb = block();
        assert!(in_window(&cb, &probe(1000, 10)));
        // Only the tail reaches the window.
        assert!(in_window(&cb, &probe(990, 11)));
        assert!(!in_window(&cb, &probe(980, 10)));
        assert!(!in_window(&cb, &probe(1100, 10)));
    }

    #[test]
    fn acceptability_zero_window() {
        let mut cb = block();
        cb.rcv_wnd = 0;
        assert!(in_window(&cb, &probe(1000, 0)));
        assert!(!in_window(&cb, &probe(1001, 0)));
        assert!(!in_window(&cb, &probe(1000, 1)));
    }
}
