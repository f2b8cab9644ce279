//! The framed message pump (spec §4.7): turns a byte stream into whole
//! frames, then drains them to the application under a fixed per-tick budget.
//!
//! Grounded in `Common/SessionBase.go`'s ring-buffer header loop and its
//! `maxPacketCountPerUpdate = 5` queue-swap drain.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use bytes::{Buf, Bytes, BytesMut};
use tracing::error;

use crate::handler::Action;
use crate::packet::Packet;

pub const FRAME_HEADER_LEN: usize = 6;
pub const MAX_PACKETS_PER_UPDATE: usize = 5;

/// The enumerated frame types a header may legally carry (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    GameLogic = 0x00,
    Broadcast = 0x10,
    GameLogicEncrypted = 0x20,
    NetworkInternal = 0x30,
    Fragment = 0x40,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x00 => Some(FrameType::GameLogic),
            0x10 => Some(FrameType::Broadcast),
            0x20 => Some(FrameType::GameLogicEncrypted),
            0x30 => Some(FrameType::NetworkInternal),
            0x40 => Some(FrameType::Fragment),
            _ => None,
        }
    }
}

/// Per-session pump state. The ring buffer and received-queue are only ever
/// appended to from the session's owning loop (single caller), so the locks
/// here are uncontended in practice; they exist to satisfy `&self` call
/// sites, not to arbitrate real concurrency, per spec §3's described
/// layout (buffer, received-queue, update-queue, one mutex).
pub struct FramedPump {
    buffer: StdMutex<BytesMut>,
    received: StdMutex<VecDeque<Packet>>,
    update: StdMutex<VecDeque<Packet>>,
}

impl Default for FramedPump {
    fn default() -> Self {
        FramedPump::new()
    }
}

impl FramedPump {
    pub fn new() -> Self {
        FramedPump {
            buffer: StdMutex::new(BytesMut::new()),
            received: StdMutex::new(VecDeque::new()),
            update: StdMutex::new(VecDeque::new()),
        }
    }

    /// Appends `bytes` and parses as many whole frames as are available.
    /// Returns `Action::Close` the instant an invalid frame type is seen
    /// (before allocating for that frame's body, per the invariant in spec
    /// §3); otherwise `Action::None`.
    pub fn on_recv_msg(&self, bytes: &[u8]) -> Action {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend_from_slice(bytes);

        let mut parsed = Vec::new();
        loop {
            if buffer.len() < FRAME_HEADER_LEN {
                break;
            }
            let body_len = u32::from_le_bytes(buffer[0..4].try_into().unwrap()) as usize;
            let msg_type = u16::from_le_bytes(buffer[4..6].try_into().unwrap());

            if FrameType::from_u16(msg_type).is_none() {
                return Action::Close;
            }
            if body_len == 0 {
                buffer.advance(FRAME_HEADER_LEN);
                continue;
            }
            if buffer.len() < FRAME_HEADER_LEN + body_len {
                break;
            }
            buffer.advance(FRAME_HEADER_LEN);
            let body: Bytes = buffer.split_to(body_len).freeze();
            parsed.push(Packet::new(msg_type, body));
        }

        if !parsed.is_empty() {
            self.received.lock().unwrap().extend(parsed);
        }
        Action::None
    }

    /// Drains up to [`MAX_PACKETS_PER_UPDATE`] packets, calling `handle` for
    /// each in order. Whenever the update-queue runs dry before the budget is
    /// reached, it is swapped in from the received-queue again (the
    /// received-queue lock is held only across each swap) and draining
    /// resumes, matching the original's drain/swap-if-empty/drain-again loop
    /// rather than a single swap-then-drain pass. A panic inside `handle` is
    /// caught and logged (spec §7) rather than propagating into the tick
    /// driver. Returns the number delivered.
    pub fn drain_tick<F: FnMut(Packet)>(&self, session_id: u64, mut handle: F) -> usize {
        let mut update = self.update.lock().unwrap();
        let mut delivered = 0;
        loop {
            if update.is_empty() {
                let mut received = self.received.lock().unwrap();
                std::mem::swap(&mut *update, &mut *received);
                if update.is_empty() {
                    break;
                }
            }
            while delivered < MAX_PACKETS_PER_UPDATE {
                let Some(packet) = update.pop_front() else { break };
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle(packet)));
                if outcome.is_err() {
                    error!(session_id, "panic inside tick message handler, recovered");
                }
                delivered += 1;
            }
            if delivered >= MAX_PACKETS_PER_UPDATE {
                break;
            }
        }
        delivered
    }

    /// Total packets still waiting (queued + delivered-pending), for tests
    /// asserting exact per-tick drain counts.
    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.update.lock().unwrap().len() + self.received.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(msg_type: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&msg_type.to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn delivers_one_whole_frame() {
        let pump = FramedPump::new();
        let bytes = frame(0x00, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(pump.on_recv_msg(&bytes), Action::None);

        let mut delivered = Vec::new();
        pump.drain_tick(1, |p| delivered.push(p));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(delivered[0].msg_type(), 0x00);
    }

    #[test]
    fn invalid_type_closes_with_no_delivery() {
        let pump = FramedPump::new();
        let bytes = frame(0x9999u16 as u16, &[0xAA, 0xBB]);
        assert_eq!(pump.on_recv_msg(&bytes), Action::Close);
        assert_eq!(pump.pending_len(), 0);
    }

    #[test]
    fn zero_body_frame_consumes_header_with_no_delivery() {
        let pump = FramedPump::new();
        let mut bytes = frame(0x10, &[]);
        bytes.extend_from_slice(&frame(0x00, &[0x01, 0x02, 0x03]));
        assert_eq!(pump.on_recv_msg(&bytes), Action::None);

        let mut delivered = Vec::new();
        pump.drain_tick(1, |p| delivered.push(p));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn frame_split_across_reads_still_parses() {
        let pump = FramedPump::new();
        let whole = frame(0x20, &[1, 2, 3, 4, 5]);
        let (first, second) = whole.split_at(4);
        assert_eq!(pump.on_recv_msg(first), Action::None);
        assert_eq!(pump.pending_len(), 0);
        assert_eq!(pump.on_recv_msg(second), Action::None);

        let mut delivered = Vec::new();
        pump.drain_tick(1, |p| delivered.push(p));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn twelve_frames_drain_across_three_ticks() {
        let pump = FramedPump::new();
        for i in 0..12u8 {
            let bytes = frame(0x00, &[i]);
            assert_eq!(pump.on_recv_msg(&bytes), Action::None);
        }

        let mut order = Vec::new();
        let first = pump.drain_tick(1, |p| order.push(p.body()[0]));
        let second = pump.drain_tick(1, |p| order.push(p.body()[0]));
        let third = pump.drain_tick(1, |p| order.push(p.body()[0]));

        assert_eq!((first, second, third), (5, 5, 2));
        assert_eq!(order, (0..12).collect::<Vec<u8>>());
    }

    #[test]
    fn leftover_update_queue_tops_up_from_received_within_one_tick() {
        // First tick: 8 queued messages, budget 5 -> update-queue left with
        // 3 undelivered (0,1,2 pending out of 0..8). Before the second tick,
        // 2 more messages arrive on the received-queue. The second tick must
        // still deliver the full budget of 5 (the 3 leftover plus 2 fresh),
        // re-swapping mid-drain rather than stopping once the update-queue
        // it started with runs dry.
        let pump = FramedPump::new();
        for i in 0..8u8 {
            pump.on_recv_msg(&frame(0x00, &[i]));
        }
        let mut order = Vec::new();
        let first = pump.drain_tick(1, |p| order.push(p.body()[0]));
        assert_eq!(first, 5);
        assert_eq!(order, vec![0, 1, 2, 3, 4]);

        pump.on_recv_msg(&frame(0x00, &[8]));
        pump.on_recv_msg(&frame(0x00, &[9]));

        let second = pump.drain_tick(1, |p| order.push(p.body()[0]));
        assert_eq!(second, 5, "leftover (5,6,7) plus fresh (8,9) must fill the budget");
        assert_eq!(order, (0..10).collect::<Vec<u8>>());
        assert_eq!(pump.pending_len(), 0);
    }

    #[test]
    fn panic_in_handler_is_recovered() {
        let pump = FramedPump::new();
        let bytes = frame(0x00, &[1]);
        pump.on_recv_msg(&bytes);
        let delivered = pump.drain_tick(1, |_| panic!("boom"));
        assert_eq!(delivered, 1);
    }
}
