//! Retransmission, backoff, and the destructor timers.
mod support;

use support::*;
use tcpcore::engine::{DropReason, Event, RexmtMode, TcpState};
use tcpcore::time::{Duration, Instant};

fn rexmt_deadline(engine: &tcpcore::engine::Engine, id: &tcpcore::engine::FourTuple) -> Instant {
    engine.connection(id).unwrap().cb.tt_rexmt.expect("retransmit timer armed").expires
}

#[test]
fn syn_is_retransmitted() {
    let mut engine = engine();
    let now = Instant::from_millis(0);
    let (id, syn) = engine.connect(now, local(), peer(), 80).unwrap();

    let deadline = rexmt_deadline(&engine, &id);
    let (outs, events) = engine.timer(deadline);
    assert!(events.is_empty());
    assert_eq!(outs.len(), 1);
    assert_eq!(outs[0].segment, syn.segment, "the same SYN goes out again");

    let rexmt = engine.connection(&id).unwrap().cb.tt_rexmt.unwrap();
    assert_eq!(rexmt.value.shift, 1);
    assert_eq!(rexmt.value.mode, RexmtMode::SynRexmt);
}

#[test]
fn syn_ack_is_retransmitted() {
    let mut engine = engine();
    engine.listen(80);
    let now = Instant::from_millis(0);

    let syn = peer_repr(80, "syn", tcpcore::wire::TcpSeqNumber(1000), None);
    let (outs, _) = deliver(&mut engine, now, &syn, &[]);
    let syn_ack = outs[0].segment;

    let id = tcpcore::engine::FourTuple {
        local: local(),
        remote: peer(),
        local_port: 80,
        remote_port: 80,
    };
    let deadline = rexmt_deadline(&engine, &id);
    let (outs, _) = engine.timer(deadline);
    assert_eq!(outs.len(), 1);
    assert_eq!(outs[0].segment, syn_ack);
}

#[test]
fn handshake_gives_up_with_retransmission_cause() {
    let mut engine = engine();
    let now = Instant::from_millis(0);
    let (id, _) = engine.connect(now, local(), peer(), 80).unwrap();

    // Walk the backoff ladder deadline by deadline. The thirteenth expiry
    // passes the shift limit and surfaces the precise cause.
    let mut fires = 0;
    loop {
        let deadline = rexmt_deadline(&engine, &id);
        let (_, events) = engine.timer(deadline);
        fires += 1;
        if !events.is_empty() {
            assert_eq!(events, vec![Event::Drop(id, DropReason::RetransmissionExceeded)]);
            break;
        }
        assert!(fires < 20, "the ladder must end");
    }
    assert_eq!(fires, 13);
    assert!(engine.connection(&id).is_none());
}

#[test]
fn handshake_gives_up_on_wall_clock() {
    let mut engine = engine();
    let now = Instant::from_millis(0);
    let (id, _) = engine.connect(now, local(), peer(), 80).unwrap();

    // Walk the ladder until the next retransmission would be due past the
    // establishment deadline, then tick in the gap between the two: the
    // establishment timer is the one that notices.
    loop {
        let deadline = rexmt_deadline(&engine, &id);
        if deadline > Instant::from_millis(76_000) {
            break;
        }
        engine.timer(deadline);
    }
    let (_, events) = engine.timer(Instant::from_millis(76_000));
    assert_eq!(events, vec![Event::Drop(id, DropReason::TimerConnectionEstablished)]);
    assert!(engine.connection(&id).is_none());
}

#[test]
fn data_retransmits_with_collapsed_window() {
    let mut engine = engine();
    let now = Instant::from_millis(0);
    let (id, _) = established_active(&mut engine, now);

    engine.send(now, &id, &vec![0x77; 2920]).unwrap();
    let snd_una = engine.connection(&id).unwrap().cb.snd_una;
    assert_eq!(engine.connection(&id).unwrap().cb.snd_cwnd, 4380);

    let deadline = rexmt_deadline(&engine, &id);
    let (outs, events) = engine.timer(deadline);
    assert!(events.is_empty());
    assert!(!outs.is_empty());
    assert_eq!(outs[0].segment.seq_number, snd_una, "retransmission starts over");

    let cb = &engine.connection(&id).unwrap().cb;
    assert_eq!(cb.snd_cwnd, 1460, "the window collapses to one segment");
    assert_eq!(cb.tt_rexmt.unwrap().value.shift, 1);
}

#[test]
fn backoff_doubles_the_interval() {
    let mut engine = engine();
    let now = Instant::from_millis(0);
    let (id, _) = engine.connect(now, local(), peer(), 80).unwrap();

    let first = rexmt_deadline(&engine, &id);
    engine.timer(first);
    let second = rexmt_deadline(&engine, &id);
    engine.timer(second);
    let third = rexmt_deadline(&engine, &id);

    let initial = first - now;
    assert_eq!(second - first, 2 * initial);
    assert_eq!(third - second, 4 * initial);
}

#[test]
fn delayed_ack_fires_once() {
    let mut engine = engine();
    let now = Instant::from_millis(0);
    let (id, peer_seq) = established_active(&mut engine, now);
    let snd_nxt = engine.connection(&id).unwrap().cb.snd_nxt;

    let data = peer_repr(id.local_port, "ack", peer_seq, Some(snd_nxt));
    let (outs, _) = deliver(&mut engine, now, &data, b"abc");
    assert!(outs.is_empty());

    let (outs, _) = engine.timer(now + Duration::from_millis(120));
    assert_eq!(outs.len(), 1);
    assert_eq!(outs[0].segment.ack_number, Some(peer_seq + 3));

    // Nothing left to acknowledge on the next tick.
    let (outs, _) = engine.timer(now + Duration::from_millis(240));
    assert!(outs.is_empty());
}

#[test]
fn fin_wait_2_does_not_linger_forever() {
    let mut engine = engine();
    let now = Instant::from_millis(0);
    let (id, peer_seq) = established_active(&mut engine, now);
    let iss = engine.connection(&id).unwrap().cb.iss;

    engine.close(now, &id).unwrap();
    let fin_ack = peer_repr(id.local_port, "ack", peer_seq, Some(iss + 2));
    deliver(&mut engine, now, &fin_ack, &[]);
    assert_eq!(engine.connection(&id).unwrap().state, TcpState::FinWait2);

    let (_, events) = engine.timer(now + Duration::from_secs(601));
    assert_eq!(events, vec![Event::Drop(id, DropReason::TimerFinWait2)]);
    assert!(engine.connection(&id).is_none());
}

#[test]
fn persist_probe_never_gives_up() {
    let mut engine = engine();
    let now = Instant::from_millis(0);
    let (id, peer_seq) = established_active(&mut engine, now);
    let snd_nxt = engine.connection(&id).unwrap().cb.snd_nxt;

    let mut closed = peer_repr(id.local_port, "ack", peer_seq, Some(snd_nxt));
    closed.window_len = 0;
    deliver(&mut engine, now, &closed, &[]);
    engine.send(now, &id, b"patience").unwrap();

    // Far more probes than the retransmission limit would allow.
    for _ in 0..20 {
        let deadline = rexmt_deadline(&engine, &id);
        let (outs, events) = engine.timer(deadline);
        assert!(events.is_empty());
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].payload.len(), 1);
    }

    let conn = engine.connection(&id).unwrap();
    assert_eq!(conn.cb.tt_rexmt.unwrap().value.mode, RexmtMode::Persist);
    assert_eq!(conn.state, TcpState::Established);
}
