//! The timer tick.
//!
//! The host calls [`timer`] periodically; nothing in the engine schedules
//! itself. Every connection owns at most five deadlines: the combined
//! retransmit/persist timer, the delayed-ack timer, and the three
//! one-shot destructors (handshake establishment, FIN_WAIT_2, 2MSL). A
//! due retransmission consumes the connection's tick; the destructors
//! fire on the quiet ticks in between.
//!
//! [`timer`]: ../struct.Engine.html#method.timer
use super::connection::{Connection, Rexmt, RexmtMode, TcpState, Timed};
use super::{output, segment, DropReason, Event, FourTuple, Transmit, BACKOFF, MAX_RXT_SHIFT};
use crate::time::Instant;

impl super::Engine {
    /// Fire every expired timer.
    ///
    /// Returns the segments to transmit and the drops that occurred, each
    /// drop naming its cause so the host can wake waiters with a precise
    /// error.
    pub fn timer(&mut self, now: Instant) -> (Vec<Transmit>, Vec<Event>) {
        let mut outs = Vec::new();
        let mut events = Vec::new();

        let ids: Vec<FourTuple> = self.connections.keys().cloned().collect();
        for id in ids {
            let mut conn = match self.connections.remove(&id) {
                Some(conn) => conn,
                None => continue,
            };
            match self.tick(now, &id, &mut conn, &mut outs) {
                None => {
                    self.connections.insert(id, conn);
                }
                Some(reason) => {
                    net_debug!("{}: {} dropped: {}", self.host, id, reason);
                    events.push(Event::Drop(id, reason));
                }
            }
        }

        (outs, events)
    }

    fn tick(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        outs: &mut Vec<Transmit>,
    ) -> Option<DropReason> {
        // The retransmit ladder consumes the tick when it is due. The
        // destructors below only see ticks on which the connection was
        // not busy retransmitting, so a backlogged retransmission is
        // accounted against the retransmit limit, not against a
        // wall-clock destructor racing it.
        if let Some(timed) = conn.cb.tt_rexmt {
            if timed.expired(now) {
                return match timed.value.mode {
                    RexmtMode::Persist => {
                        self.persist_fire(now, id, conn, timed.value.shift, outs);
                        None
                    }
                    mode => self.rexmt_fire(now, id, conn, mode, timed.value.shift, outs),
                };
            }
        }

        if conn.cb.tt_conn_est.is_due(now) {
            return Some(DropReason::TimerConnectionEstablished);
        }
        if conn.cb.tt_2msl.is_due(now) {
            return Some(DropReason::Timer2msl);
        }
        if conn.cb.tt_fin_wait_2.is_due(now) {
            return Some(DropReason::TimerFinWait2);
        }

        if conn.cb.tt_delack.is_due(now) {
            conn.cb.tt_delack.cancel();
            conn.cb.ack_now = true;
            outs.extend(output::flush(now, id, conn));
        }

        None
    }

    /// The retransmission timeout proper: back off, collapse the
    /// congestion window, go back to `snd_una`.
    fn rexmt_fire(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        mode: RexmtMode,
        shift: u8,
        outs: &mut Vec<Transmit>,
    ) -> Option<DropReason> {
        let shift = shift + 1;
        if shift > MAX_RXT_SHIFT {
            return Some(DropReason::RetransmissionExceeded);
        }

        {
            let cb = &mut conn.cb;
            if shift == 1 {
                // If an acknowledgement of the original transmission beats
                // the retransmitted copy back, the timeout was spurious.
                // Remember what it cost so it can be undone.
                cb.snd_cwnd_prev = cb.snd_cwnd;
                cb.snd_ssthresh_prev = cb.snd_ssthresh;
                let half_srtt = u64::from(cb.t_rttinf.srtt() / 2).max(1);
                cb.t_badrxtwin =
                    crate::time::Expiration::When(now + crate::time::Duration::from_millis(half_srtt));
            }

            // Van Jacobson: half the flight size becomes the threshold,
            // the window collapses to one segment.
            let halved = (cb.snd_wnd.min(cb.snd_cwnd) / 2 / cb.t_maxseg).max(2) * cb.t_maxseg;
            cb.snd_ssthresh = halved;
            cb.snd_cwnd = cb.t_maxseg;
            cb.t_rttseg = None;
            cb.t_rttinf.on_backoff(shift);
            cb.t_dupacks = 0;
            if mode == RexmtMode::Rexmt {
                cb.snd_nxt = cb.snd_una;
            }
            cb.tt_rexmt = Some(Timed::new(
                Rexmt { mode, shift },
                now + cb.t_rttinf.rto_backed_off(shift),
            ));
        }

        match mode {
            RexmtMode::SynRexmt => {
                let repr = match conn.state {
                    TcpState::SynSent => segment::syn(&conn.cb, id),
                    _ => segment::syn_ack(&conn.cb, id),
                };
                net_debug!("{}: {} retransmitting handshake, shift {}", self.host, id, shift);
                outs.push(Transmit { src: id.local, dst: id.remote, segment: repr, payload: Vec::new() });
            }
            RexmtMode::Rexmt => {
                net_debug!("{}: {} retransmitting from {}, shift {}", self.host, id, conn.cb.snd_una, shift);
                conn.cb.ack_now = true;
                outs.extend(output::flush(now, id, conn));
            }
            RexmtMode::Persist => unreachable!("persist expiry is handled separately"),
        }

        None
    }

    /// The persist timeout: probe the zero window with one byte.
    ///
    /// The probe never gives up on the connection. A peer advertising a
    /// zero window is acknowledging the probes, which is proof of life;
    /// the shift merely saturates at the top of the backoff table.
    fn persist_fire(
        &mut self,
        now: Instant,
        id: &FourTuple,
        conn: &mut Connection,
        shift: u8,
        outs: &mut Vec<Transmit>,
    ) {
        let shift = shift.saturating_add(1).min((BACKOFF.len() - 1) as u8);
        let timeout = output::persist_timeout(conn, shift);
        conn.cb.tt_rexmt = Some(Timed::new(Rexmt { mode: RexmtMode::Persist, shift }, now + timeout));

        net_debug!("{}: {} window probe, shift {}", self.host, id, shift);
        if let Some(probe) = output::window_probe(now, id, conn) {
            outs.push(probe);
        }
    }
}
