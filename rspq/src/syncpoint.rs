use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use rspq_sys::{CommandKey, Opcode, StatusFlags};

use crate::diagnostics::SpinWait;
use crate::ring::RingWriter;
use crate::status::StatusWord;
use crate::transport::Transport;

/// A ticket into the monotonic syncpoint counter (spec.md §4.6). Tickets
/// are assigned in issue order; completion is checked with wrap-safe
/// signed comparison so the counter can cycle through `u32::MAX` without
/// ever reporting a completed syncpoint as pending again.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Syncpoint(pub(crate) u32);

/// Issues and checks syncpoints. Shares `done` with [`crate::interrupt::InterruptGlue`],
/// which is the only writer; this side only ever reads it.
pub struct SyncpointEngine {
	next_ticket: u32,
	done: Arc<AtomicU32>,
	impatience_threshold: u32,
}

impl SyncpointEngine {
	pub(crate) fn new(done: Arc<AtomicU32>, impatience_threshold: u32) -> Self {
		SyncpointEngine {
			// ticket 0 is never issued, so a default/sentinel `Syncpoint`
			// reads as already-reached against a freshly-zeroed counter.
			next_ticket: 1,
			done,
			impatience_threshold,
		}
	}

	/// Emit a `TEST_WRITE_STATUS` that waits for any previous, still
	/// unacknowledged syncpoint interrupt to clear before raising this
	/// one — otherwise two syncpoints completing before the CPU handles
	/// the first could stomp the same edge-triggered bit (spec.md §4.6,
	/// §4.8).
	pub fn new_syncpoint(&mut self, writer: &mut RingWriter, status: &StatusWord, transport: &dyn Transport) -> Syncpoint {
		let ticket = self.next_ticket;
		self.next_ticket = self.next_ticket.wrapping_add(1);

		let cw = writer.reserve(status, transport, Opcode::TestWriteStatus.words());
		cw.write_payload(1, (StatusFlags::SYNCPOINT | StatusFlags::INTR).bits());
		cw.write_payload(2, StatusFlags::SYNCPOINT.bits());
		cw.finish(CommandKey::new(0, Opcode::TestWriteStatus as u8), 0);

		log::trace!("syncpoint: issued ticket {}", ticket);
		Syncpoint(ticket)
	}

	/// `true` once the consumer has reached and acknowledged `point`.
	pub fn check(&self, point: Syncpoint) -> bool {
		let done = self.done.load(Ordering::Acquire) as i32;
		done.wrapping_sub(point.0 as i32) >= 0
	}

	/// Spin until `check(point)` is true, dumping diagnostics if it takes
	/// an unreasonable number of attempts (spec.md §7).
	pub fn wait(&self, point: Syncpoint) {
		let mut spin = SpinWait::new(self.impatience_threshold, "syncpoint_wait");
		while !self.check(point) {
			if spin.tick() {
				log::error!("syncpoint_wait: ticket {} not reached after {} spins (done={})", point.0, self.impatience_threshold, self.done.load(Ordering::Relaxed));
			}
			std::hint::spin_loop();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sim::SimTransport;

	#[test]
	fn tickets_are_issued_in_order() {
		let done = Arc::new(AtomicU32::new(0));
		let mut engine = SyncpointEngine::new(done, 1000);
		let status = StatusWord::new();
		let transport = SimTransport::new();
		let mut ring = RingWriter::new(64, StatusFlags::BUFDONE_LOW, "test", 1000);

		let a = engine.new_syncpoint(&mut ring, &status, &transport);
		let b = engine.new_syncpoint(&mut ring, &status, &transport);
		assert_ne!(a, b);
		assert_eq!(b.0, a.0 + 1);
	}

	#[test]
	fn check_compares_with_wrap_safe_signed_arithmetic() {
		let done = Arc::new(AtomicU32::new(u32::MAX - 1));
		let engine = SyncpointEngine::new(done.clone(), 1000);

		let a = Syncpoint(u32::MAX - 1);
		let b = Syncpoint(0); // one past a, having wrapped around u32::MAX

		assert!(engine.check(a));
		assert!(!engine.check(b));

		done.store(0, Ordering::Release);
		assert!(engine.check(b), "counter wrapped past zero, b should now read as reached");
	}

	#[test]
	fn emits_test_write_status_with_syncpoint_mask() {
		let done = Arc::new(AtomicU32::new(0));
		let mut engine = SyncpointEngine::new(done, 1000);
		let status = StatusWord::new();
		let transport = SimTransport::new();
		let mut ring = RingWriter::new(64, StatusFlags::BUFDONE_LOW, "test", 1000);

		engine.new_syncpoint(&mut ring, &status, &transport);

		let buf = ring.active_buffer();
		let (key, _) = CommandKey::decode_word(buf.load(0, Ordering::Acquire));
		assert_eq!(key.local_index(), Opcode::TestWriteStatus as u8);
		assert_eq!(buf.load(1, Ordering::Relaxed), (StatusFlags::SYNCPOINT | StatusFlags::INTR).bits());
		assert_eq!(buf.load(2, Ordering::Relaxed), StatusFlags::SYNCPOINT.bits());
	}
}
