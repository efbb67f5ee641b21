//! Segment constructors.
//!
//! Handshake and control segments are built here from the control block;
//! data-bearing segments are assembled by the output path. The window
//! field of a SYN or SYN+ACK is never scaled: the scale option only
//! applies once both sides have seen it.
use super::connection::ControlBlock;
use super::FourTuple;
use crate::wire::{TcpFlags, TcpRepr, TcpSeqNumber};

fn unscaled_window(cb: &ControlBlock) -> u16 {
    cb.rcv_wnd.min(0xffff) as u16
}

/// The initial SYN of an active open.
pub(crate) fn syn(cb: &ControlBlock, id: &FourTuple) -> TcpRepr {
    TcpRepr {
        src_port: id.local_port,
        dst_port: id.remote_port,
        flags: {
            let mut flags = TcpFlags::default();
            flags.set_syn(true);
            flags
        },
        seq_number: cb.iss,
        ack_number: None,
        window_len: unscaled_window(cb),
        window_scale: cb.request_r_scale,
        max_seg_size: Some(cb.t_advmss as u16),
        payload_len: 0,
    }
}

/// The SYN+ACK answering a connection request.
pub(crate) fn syn_ack(cb: &ControlBlock, id: &FourTuple) -> TcpRepr {
    TcpRepr {
        src_port: id.local_port,
        dst_port: id.remote_port,
        flags: {
            let mut flags = TcpFlags::default();
            flags.set_syn(true);
            flags.set_ack(true);
            flags
        },
        seq_number: cb.iss,
        ack_number: Some(cb.rcv_nxt),
        window_len: unscaled_window(cb),
        window_scale: if cb.doing_ws { cb.request_r_scale } else { None },
        max_seg_size: Some(cb.t_advmss as u16),
        payload_len: 0,
    }
}

/// The reset answering an offending segment, if one is warranted.
///
/// A segment that itself carries RST is never answered, so that two
/// confused endpoints cannot keep a reset ping-pong going. An offender
/// with ACK is answered at the sequence number it acknowledged; one
/// without gets sequence zero and an acknowledgement covering its whole
/// sequence length.
pub(crate) fn reset_for(offender: &TcpRepr) -> Option<TcpRepr> {
    if offender.flags.rst() {
        return None;
    }

    let reply = match offender.ack_number {
        Some(ack) => TcpRepr {
            src_port: offender.dst_port,
            dst_port: offender.src_port,
            flags: {
                let mut flags = TcpFlags::default();
                flags.set_rst(true);
                flags
            },
            seq_number: ack,
            ack_number: None,
            window_len: 0,
            window_scale: None,
            max_seg_size: None,
            payload_len: 0,
        },
        None => TcpRepr {
            src_port: offender.dst_port,
            dst_port: offender.src_port,
            flags: {
                let mut flags = TcpFlags::default();
                flags.set_rst(true);
                flags.set_ack(true);
                flags
            },
            seq_number: TcpSeqNumber(0),
            ack_number: Some(offender.seq_number + offender.sequence_len()),
            window_len: 0,
            window_scale: None,
            max_seg_size: None,
            payload_len: 0,
        },
    };
    Some(reply)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::time::Instant;

    fn offender(ack: Option<TcpSeqNumber>, rst: bool) -> TcpRepr {
        TcpRepr {
            src_port: 4000,
            dst_port: 80,
            flags: {
                let mut flags = TcpFlags::default();
                flags.set_syn(!rst);
                flags.set_rst(rst);
                flags.set_ack(ack.is_some());
                flags
            },
            seq_number: TcpSeqNumber(1000),
            ack_number: ack,
            window_len: 512,
            window_scale: None,
            max_seg_size: None,
            payload_len: 10,
        }
    }

    #[test]
    fn no_reset_for_reset() {
        assert_eq!(reset_for(&offender(None, true)), None);
    }

    #[test]
    fn reset_without_ack_covers_sequence() {
        let reply = reset_for(&offender(None, false)).unwrap();
        assert!(reply.flags.rst());
        assert_eq!(reply.seq_number, TcpSeqNumber(0));
        // 10 payload bytes plus the SYN.
        assert_eq!(reply.ack_number, Some(TcpSeqNumber(1011)));
        assert_eq!((reply.src_port, reply.dst_port), (80, 4000));
    }

    #[test]
    fn reset_with_ack_echoes_it() {
        let reply = reset_for(&offender(Some(TcpSeqNumber(555)), false)).unwrap();
        assert!(reply.flags.rst());
        assert_eq!(reply.seq_number, TcpSeqNumber(555));
        assert_eq!(reply.ack_number, None);
    }

    #[test]
    fn syn_carries_options() {
        let mut cb = ControlBlock::new(Instant::from_millis(0));
        cb.iss = TcpSeqNumber(42);
        cb.rcv_wnd = 0x40000;
        cb.request_r_scale = Some(2);
        let id = FourTuple {
            local: crate::wire::Ipv4Address::new(10, 0, 0, 1).into(),
            remote: crate::wire::Ipv4Address::new(10, 0, 0, 2).into(),
            local_port: 4000,
            remote_port: 80,
        };
        let repr = syn(&cb, &id);
        assert_eq!(repr.seq_number, TcpSeqNumber(42));
        assert_eq!(repr.window_len, 0xffff);
        assert_eq!(repr.window_scale, Some(2));
        assert_eq!(repr.flags.sequence_len(), 1);
    }
}
