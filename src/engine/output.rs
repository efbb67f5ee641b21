//! The output path.
//!
//! `flush` looks at one connection and emits whatever the protocol allows
//! right now: data up to the effective window in maximum-segment slices, a
//! FIN once the queue drains after shutdown, or a bare acknowledgement when
//! one is owed. Every emitted segment refreshes the receive-side
//! advertisement bookkeeping, so this is the single place segments of a
//! live connection come from.
use super::connection::{Connection, Rexmt, RexmtMode, Timed};
use super::{FourTuple, Transmit, PERSIST_MAX, PERSIST_MIN};
use crate::time::{Expiration, Instant};
use crate::wire::{TcpFlags, TcpRepr};

pub(crate) fn flush(now: Instant, id: &FourTuple, conn: &mut Connection) -> Vec<Transmit> {
    let mut outs = Vec::new();
    if !conn.state.synchronised() {
        // Handshake segments are built by their rules, not here.
        return outs;
    }

    // A connection that went idle past a timeout restarts slow-start; the
    // old congestion window says nothing about the path anymore.
    if conn.cb.snd_max == conn.cb.snd_una
        && !conn.sndq.is_empty()
        && now - conn.cb.t_idletime >= conn.cb.t_rttinf.rto()
    {
        conn.cb.snd_cwnd = super::initial_cwnd(conn.cb.t_maxseg);
    }

    loop {
        let window = conn.cb.snd_wnd.min(conn.cb.snd_cwnd) as usize;
        let off = conn.cb.snd_nxt.distance(conn.cb.snd_una).max(0) as usize;
        let pending = conn.sndq.len().saturating_sub(off);
        let usable = window.saturating_sub(off);
        let len = pending.min(usable).min(conn.cb.t_maxseg as usize);
        let reaches_end = off + len == conn.sndq.len();

        // The FIN occupies the sequence number one past the stream. It is
        // due when the segment under construction reaches the stream end,
        // unless it is already out and acknowledged.
        let fin_seq = conn.cb.fin_seq(conn.sndq.len());
        let fin_outstanding = conn.cb.fin_sent && conn.cb.snd_max.distance(conn.cb.snd_una) > 0;
        let send_fin = conn.cantsndmore
            && reaches_end
            && (!conn.cb.fin_sent || (fin_outstanding && conn.cb.snd_nxt.distance(fin_seq) <= 0));

        let full_segment = len > 0 && len == conn.cb.t_maxseg as usize;
        let emits_tail = len > 0 && reaches_end;
        if !(full_segment || emits_tail || send_fin || conn.cb.ack_now) {
            break;
        }

        let advert = (conn.cb.rcv_wnd >> conn.cb.rcv_scale).min(0xffff) as u16;
        let mut flags = TcpFlags::default();
        flags.set_ack(true);
        if len > 0 && reaches_end {
            flags.set_psh(true);
        }
        if send_fin {
            flags.set_fin(true);
        }

        let repr = TcpRepr {
            src_port: id.local_port,
            dst_port: id.remote_port,
            flags,
            seq_number: conn.cb.snd_nxt,
            ack_number: Some(conn.cb.rcv_nxt),
            window_len: advert,
            window_scale: None,
            max_seg_size: None,
            payload_len: len as u16,
        };
        let payload = conn.sndq[off..off + len].to_vec();

        let advance = len + if send_fin { 1 } else { 0 };
        let new_nxt = conn.cb.snd_nxt + advance;
        let new_data = new_nxt.distance(conn.cb.snd_max) > 0;
        conn.cb.snd_nxt = new_nxt;
        if new_data {
            conn.cb.snd_max = new_nxt;
        }
        if send_fin {
            conn.cb.fin_sent = true;
        }

        // Time one new segment per round trip.
        if conn.cb.t_rttseg.is_none() && advance > 0 && new_data {
            conn.cb.t_rttseg = Some((now, new_nxt));
        }

        if advance > 0 {
            let rexmt_armed = matches!(
                conn.cb.tt_rexmt,
                Some(Timed { value: Rexmt { mode: RexmtMode::Rexmt, .. }, .. })
            );
            if !rexmt_armed {
                conn.cb.tt_rexmt = Some(Timed::new(
                    Rexmt { mode: RexmtMode::Rexmt, shift: 0 },
                    now + conn.cb.t_rttinf.rto(),
                ));
            }
        }

        conn.cb.rcv_adv = conn.cb.rcv_nxt + ((u32::from(advert) << conn.cb.rcv_scale) as usize);
        conn.cb.rxwin0_sent = advert == 0;
        conn.cb.last_ack_sent = conn.cb.rcv_nxt;
        conn.cb.ack_now = false;
        conn.cb.tt_delack.cancel();

        net_trace!("{}: out {}", id, repr);
        outs.push(Transmit { src: id.local, dst: id.remote, segment: repr, payload });

        if advance == 0 {
            break;
        }
    }

    // A zero send window with data waiting and no retransmission in flight
    // is kept alive by the persist timer.
    let off = conn.cb.snd_nxt.distance(conn.cb.snd_una).max(0) as usize;
    if conn.cb.snd_wnd == 0 && conn.sndq.len() > off && conn.cb.tt_rexmt.is_none() {
        let timeout = persist_timeout(conn, 0);
        conn.cb.tt_rexmt = Some(Timed::new(
            Rexmt { mode: RexmtMode::Persist, shift: 0 },
            now + timeout,
        ));
    }

    outs
}

/// The persist timer interval after `shift` consecutive probes.
pub(crate) fn persist_timeout(conn: &Connection, shift: u8) -> crate::time::Duration {
    conn.cb.t_rttinf.rto_backed_off(shift).max(PERSIST_MIN).min(PERSIST_MAX)
}

/// Send a single probe byte into a zero window.
///
/// The probe lives beyond the advertised window on purpose; the peer must
/// either acknowledge it or re-advertise its closed window, and either
/// answer tells us the connection is alive.
pub(crate) fn window_probe(now: Instant, id: &FourTuple, conn: &mut Connection) -> Option<Transmit> {
    conn.cb.snd_nxt = conn.cb.snd_una;
    let off = 0;
    if conn.sndq.len() <= off {
        return None;
    }

    let advert = (conn.cb.rcv_wnd >> conn.cb.rcv_scale).min(0xffff) as u16;
    let mut flags = TcpFlags::default();
    flags.set_ack(true);
    let repr = TcpRepr {
        src_port: id.local_port,
        dst_port: id.remote_port,
        flags,
        seq_number: conn.cb.snd_nxt,
        ack_number: Some(conn.cb.rcv_nxt),
        window_len: advert,
        window_scale: None,
        max_seg_size: None,
        payload_len: 1,
    };
    let payload = vec![conn.sndq[off]];

    conn.cb.snd_nxt = conn.cb.snd_nxt + 1usize;
    conn.cb.snd_max = conn.cb.snd_max.latest(conn.cb.snd_nxt);
    conn.cb.last_ack_sent = conn.cb.rcv_nxt;
    conn.cb.tt_delack = Expiration::Never;
    conn.cb.ack_now = false;

    net_trace!("{}: window probe {}", id, repr);
    Some(Transmit { src: id.local, dst: id.remote, segment: repr, payload })
}
