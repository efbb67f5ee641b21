//! Shared harness for the integration tests.
//!
//! Segments are exchanged at the wire level: the peer side of every test
//! builds raw bytes with a valid checksum and feeds them to the engine,
//! exactly as an internet layer would.
#![allow(dead_code)]

use tcpcore::engine::{Engine, Event, FourTuple, TcpState, Transmit};
use tcpcore::time::Instant;
use tcpcore::wire::{IpAddress, Ipv4Address, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber};

pub const PEER_PORT: u16 = 80;

pub fn local() -> IpAddress {
    Ipv4Address::new(10, 0, 0, 1).into()
}

pub fn peer() -> IpAddress {
    Ipv4Address::new(10, 0, 0, 2).into()
}

/// An engine with a deterministic byte source: 0x0b repeated.
///
/// Every ISN drawn from it is 0x0b0b0b0b.
pub fn engine() -> Engine {
    Engine::new("test", |n| vec![0x0b; n])
}

pub const RNG_ISN: TcpSeqNumber = TcpSeqNumber(0x0b0b_0b0b);

/// Encode a segment from the peer into checksummed wire bytes.
pub fn wire(repr: &TcpRepr, payload: &[u8]) -> Vec<u8> {
    let mut repr = *repr;
    repr.payload_len = payload.len() as u16;
    let mut bytes = vec![0; repr.buffer_len()];
    let mut packet = TcpPacket::new_unchecked(&mut bytes[..]);
    repr.emit(&mut packet);
    packet.payload_mut_slice().copy_from_slice(payload);
    packet.fill_checksum(peer(), local());
    bytes
}

/// A segment representation from the peer towards `local_port`.
pub fn peer_repr(local_port: u16, flags: &str, seq: TcpSeqNumber, ack: Option<TcpSeqNumber>) -> TcpRepr {
    let mut parsed = TcpFlags::default();
    for flag in flags.split('+') {
        match flag {
            "syn" => parsed.set_syn(true),
            "ack" => parsed.set_ack(true),
            "fin" => parsed.set_fin(true),
            "rst" => parsed.set_rst(true),
            "psh" => parsed.set_psh(true),
            "" => (),
            other => panic!("unknown flag {:?}", other),
        }
    }
    TcpRepr {
        src_port: PEER_PORT,
        dst_port: local_port,
        flags: parsed,
        seq_number: seq,
        ack_number: ack,
        window_len: 0xffff,
        window_scale: None,
        max_seg_size: None,
        payload_len: 0,
    }
}

/// Feed one peer segment to the engine.
pub fn deliver(
    engine: &mut Engine,
    now: Instant,
    repr: &TcpRepr,
    payload: &[u8],
) -> (Vec<Transmit>, Vec<Event>) {
    let bytes = wire(repr, payload);
    engine.handle(now, peer(), local(), &bytes)
}

/// Drive an active open to ESTABLISHED.
///
/// Returns the connection id and the peer's `rcv_nxt`-to-be (the sequence
/// number the peer will send data at).
pub fn established_active(engine: &mut Engine, now: Instant) -> (FourTuple, TcpSeqNumber) {
    let (id, syn) = engine.connect(now, local(), peer(), PEER_PORT).unwrap();
    let iss = syn.segment.seq_number;

    let peer_iss = TcpSeqNumber(90_000);
    let mut synack = peer_repr(id.local_port, "syn+ack", peer_iss, Some(iss + 1));
    synack.max_seg_size = Some(1460);

    let (outs, events) = deliver(engine, now, &synack, &[]);
    assert_eq!(events, vec![Event::Established(id)]);
    assert_eq!(outs.len(), 1, "the handshake ends with our acknowledgement");
    assert_eq!(outs[0].segment.ack_number, Some(peer_iss + 1));
    assert_eq!(engine.connection(&id).unwrap().state, TcpState::Established);

    (id, peer_iss + 1)
}
