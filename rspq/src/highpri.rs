use rspq_sys::{CommandKey, Opcode, StatusFlags};

use crate::ring::RingWriter;
use crate::status::StatusWord;
use crate::transport::Transport;

/// A second ring-writer context that preempts the normal stream via
/// `SWAP_BUFFERS` (spec.md §4.5). Grounded on [`crate::ring::RingWriter`]
/// itself: the high-priority stream is a ring exactly like the normal one,
/// just entered and left through a different pair of save slots instead
/// of always running from word zero.
pub struct PrioritySwitcher {
	ring: RingWriter,
	active: bool,
	pending_exit_addr: Option<u32>,
	slot_lowpri: u32,
	slot_highpri: u32,
	impatience_threshold: u32,
}

impl PrioritySwitcher {
	pub(crate) fn new(ring_words: u32, max_nesting: u32, impatience_threshold: u32, transport: &dyn Transport) -> Self {
		let ring = RingWriter::new(ring_words, StatusFlags::BUFDONE_HIGH, "highpri", impatience_threshold);
		let slot_lowpri = max_nesting;
		let slot_highpri = max_nesting + 1;

		// The very first switch into high-priority mode loads its target
		// from `slot_highpri` exactly like every later one; prime it now
		// so that load isn't reading an undefined slot.
		transport.prime_slot(slot_highpri, ring.current_addr());

		PrioritySwitcher {
			ring,
			active: false,
			pending_exit_addr: None,
			slot_lowpri,
			slot_highpri,
			impatience_threshold,
		}
	}

	pub fn is_active(&self) -> bool {
		self.active
	}

	pub(crate) fn ring_mut(&mut self) -> &mut RingWriter {
		&mut self.ring
	}

	/// Switch the consumer onto the high-priority stream. If a previous
	/// session's exit epilog is still sitting unconsumed in the
	/// high-priority ring, this patches that epilog's `JUMP` target in
	/// place to point at wherever this session's commands continue,
	/// coalescing back-to-back `highpri_begin` calls into one preemption
	/// instead of appending a fresh entry/exit pair (spec.md §4.5
	/// "Multiple pending high-priority segments").
	pub fn begin(&mut self, normal: &mut RingWriter, status: &StatusWord, transport: &dyn Transport) {
		if let Some(target_addr) = self.pending_exit_addr.take() {
			// The epilog's JUMP header word is already committed; only its
			// target argument word changes, so this is the single
			// naturally-aligned word store spec.md §9 requires — the
			// consumer never observes a torn JUMP.
			let new_target = self.ring.current_addr();
			crate::addr_space::store(target_addr, new_target, std::sync::atomic::Ordering::Release);
			self.active = true;
			status.set(StatusFlags::HIGHPRI_REQUESTED);
			transport.wake_consumer();
			log::debug!("highpri: coalesced overlapping begin, patched epilog jump at {:#x} to {:#x}", target_addr, new_target);
			return;
		}

		self.active = true;
		status.set(StatusFlags::HIGHPRI_REQUESTED);

		let cw = normal.reserve(status, transport, Opcode::SwapBuffers.words());
		cw.write_payload(1, self.slot_lowpri << 2);
		cw.write_payload(2, self.slot_highpri << 2);
		cw.write_payload(3, StatusFlags::HIGHPRI_RUNNING.bits());
		cw.finish(CommandKey::new(0, Opcode::SwapBuffers as u8), 0);

		transport.wake_consumer();
		log::debug!("highpri: entering high-priority stream");
	}

	/// End the current high-priority session: append an epilog `JUMP`
	/// that targets its own following `SWAP_BUFFERS` (forcing a re-fetch)
	/// and then the `SWAP_BUFFERS` that returns control to wherever the
	/// normal stream has grown to by the time the consumer gets there. A
	/// later `begin()` can patch the `JUMP`'s target word in place to
	/// skip the exit entirely instead of round-tripping through it.
	pub fn end(&mut self, status: &StatusWord, transport: &dyn Transport) {
		debug_assert!(self.active, "highpri_end called without a matching highpri_begin");
		self.active = false;

		let jump = self.ring.reserve(status, transport, Opcode::Jump.words());
		let epilog_addr = jump.addr();
		let swap_addr = epilog_addr + Opcode::Jump.words() * 4;
		jump.write_payload(1, swap_addr);
		jump.finish(CommandKey::new(0, Opcode::Jump as u8), 0);

		let cw = self.ring.reserve(status, transport, Opcode::SwapBuffers.words());
		cw.write_payload(1, self.slot_highpri << 2);
		cw.write_payload(2, self.slot_lowpri << 2);
		cw.write_payload(3, StatusFlags::HIGHPRI_RUNNING.bits());
		cw.finish(CommandKey::new(0, Opcode::SwapBuffers as u8), 0);

		self.pending_exit_addr = Some(epilog_addr + 4);
		transport.wake_consumer();
		log::debug!("highpri: leaving high-priority stream");
	}

	/// Spin until the high-priority stream has fully drained (spec.md §5
	/// suspension points): no entry is requested and the consumer isn't
	/// currently running one. Checking only `HIGHPRI_RUNNING` would read
	/// false, and return early, during the window after `begin()` sets
	/// `HIGHPRI_REQUESTED` but before the consumer has observed it.
	pub fn sync(&self, status: &StatusWord) {
		let mut spin = crate::diagnostics::SpinWait::new(self.impatience_threshold, "highpri_sync");
		while status.test(StatusFlags::HIGHPRI_REQUESTED) || status.test(StatusFlags::HIGHPRI_RUNNING) {
			if spin.tick() {
				log::error!("highpri_sync: stuck waiting for HIGHPRI_REQUESTED/HIGHPRI_RUNNING to clear");
			}
			std::hint::spin_loop();
		}
	}
}
