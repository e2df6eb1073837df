use std::sync::atomic::{AtomicU32, Ordering};

use rspq_sys::{CommandKey, Opcode, StatusFlags};

use crate::diagnostics::{DiagnosticDump, SpinWait};
use crate::status::StatusWord;
use crate::transport::Transport;

/// A single fixed-size word buffer, zero-initialized before activation
/// (spec.md §3 invariant). Used both for ring-writer halves and for block
/// chunks (§4.4) — both need the same "reserve, fill payload, release
/// header" discipline.
pub(crate) struct WordBuffer {
	words: Box<[AtomicU32]>,
}

impl WordBuffer {
	pub(crate) fn new(len: u32) -> Self {
		let mut words = Vec::with_capacity(len as usize);
		words.resize_with(len as usize, || AtomicU32::new(0));
		let buf = WordBuffer {
			words: words.into_boxed_slice(),
		};
		crate::addr_space::register(buf.addr(), buf.words.as_ptr(), len);
		buf
	}

	/// Opaque 32-bit address token for this buffer. The real target is a
	/// 32-bit MIPS core, so truncating the host pointer is only a
	/// simulation shortcut for the parts of this crate that never
	/// dereference it (CALL/JUMP targets are opaque words to us too, per
	/// spec.md §1).
	pub(crate) fn addr(&self) -> u32 {
		self.words.as_ptr() as usize as u32
	}

	pub(crate) fn len_words(&self) -> u32 {
		self.words.len() as u32
	}

	pub(crate) fn zero(&self) {
		for w in self.words.iter() {
			w.store(0, Ordering::Relaxed);
		}
	}

	fn store(&self, offset: u32, value: u32, order: Ordering) {
		self.words[offset as usize].store(value, order);
	}

	pub(crate) fn load(&self, offset: u32, order: Ordering) -> u32 {
		self.words[offset as usize].load(order)
	}

	pub(crate) fn snapshot(&self, start: u32, count: u32) -> Vec<u32> {
		let end = (start + count).min(self.len_words());
		(start..end).map(|i| self.load(i, Ordering::Relaxed)).collect()
	}
}

/// Spec.md §4.1's write contract as an RAII guard: payload words go in
/// first (`Relaxed`), the header word is released last. Grounded on the
/// teacher's `BulkSubmission`, which fills a submission entry and
/// publishes it on drop — here the "publish" is the header store itself,
/// so `finish` takes `self` by value instead of relying on `Drop`.
pub struct CommandWriter<'a> {
	buf: &'a WordBuffer,
	base: u32,
	len: u32,
}

impl<'a> CommandWriter<'a> {
	pub(crate) fn new(buf: &'a WordBuffer, base: u32, len: u32) -> Self {
		CommandWriter { buf, base, len }
	}

	/// Address of this command's header word, for callers that need to
	/// hand it out as a `CALL`/`JUMP` target (blocks do).
	pub fn addr(&self) -> u32 {
		self.buf.addr() + self.base * 4
	}

	/// Write payload word at `index` (1-based: 0 is the header). May be
	/// called in any order, per spec.md §4.1 step 2.
	pub fn write_payload(&self, index: u32, value: u32) {
		debug_assert!(index >= 1 && index < self.len, "payload index {} out of bounds for {}-word command", index, self.len);
		self.buf.store(self.base + index, value, Ordering::Relaxed);
	}

	/// Write the header word last, with release ordering, making every
	/// payload word visible to a consumer that `Acquire`-loads this same
	/// word (spec.md §4.1 step 3, §9 "header-last write ordering").
	pub fn finish(self, key: CommandKey, header_payload: u32) {
		self.buf.store(self.base, key.header_word(header_payload), Ordering::Release);
	}
}

/// CPU-side double-buffered writer (spec.md §4.1).
pub struct RingWriter {
	buffers: [WordBuffer; 2],
	active: usize,
	write_ptr: u32,
	sentinel: u32,
	bufdone_bit: StatusFlags,
	label: &'static str,
	impatience_threshold: u32,
}

/// Words reserved at the tail of every ring half for the rotation stitch:
/// one `WRITE_STATUS` (2 words) and one `JUMP` (2 words).
const ROTATION_STITCH_WORDS: u32 = 4;

impl RingWriter {
	pub(crate) fn new(ring_words: u32, bufdone_bit: StatusFlags, label: &'static str, impatience_threshold: u32) -> Self {
		assert!(ring_words > ROTATION_STITCH_WORDS, "ring too small to hold the rotation stitch");
		RingWriter {
			buffers: [WordBuffer::new(ring_words), WordBuffer::new(ring_words)],
			active: 0,
			write_ptr: 0,
			sentinel: ring_words - ROTATION_STITCH_WORDS,
			bufdone_bit,
			label,
			impatience_threshold,
		}
	}

	pub fn current_addr(&self) -> u32 {
		self.buffers[self.active].addr() + self.write_ptr * 4
	}

	pub(crate) fn active_buffer(&self) -> &WordBuffer {
		&self.buffers[self.active]
	}

	pub(crate) fn buffer(&self, idx: usize) -> &WordBuffer {
		&self.buffers[idx]
	}

	pub(crate) fn active_index(&self) -> usize {
		self.active
	}

	/// Reserve `n_words` in the active buffer, rotating first if the
	/// command wouldn't fit before the sentinel (spec.md §4.1).
	pub fn reserve(&mut self, status: &StatusWord, transport: &dyn Transport, n_words: u32) -> CommandWriter<'_> {
		debug_assert!(n_words >= 1);
		if self.write_ptr + n_words > self.sentinel {
			self.rotate(status, transport);
		}
		let base = self.write_ptr;
		self.write_ptr += n_words;
		CommandWriter::new(&self.buffers[self.active], base, n_words)
	}

	fn rotate(&mut self, status: &StatusWord, transport: &dyn Transport) {
		log::debug!("{}: rotating buffers at write_ptr={:#x}", self.label, self.write_ptr);

		let mut spin = SpinWait::new(self.impatience_threshold, self.label);
		while !status.test_and_clear(self.bufdone_bit) {
			transport.wake_consumer();
			if spin.tick() {
				self.dump("ring rotation stuck waiting for bufdone").log();
			}
			std::hint::spin_loop();
		}

		let old_active = self.active;
		let old_ptr = self.write_ptr;
		self.active ^= 1;
		self.buffers[self.active].zero();
		let new_addr = self.buffers[self.active].addr();

		let old_buf = &self.buffers[old_active];
		let write_status = CommandWriter::new(old_buf, old_ptr, Opcode::WriteStatus.words());
		write_status.write_payload(1, self.bufdone_bit.bits());
		write_status.finish(CommandKey::new(0, Opcode::WriteStatus as u8), 0);

		let jump = CommandWriter::new(old_buf, old_ptr + Opcode::WriteStatus.words(), Opcode::Jump.words());
		jump.write_payload(1, new_addr);
		jump.finish(CommandKey::new(0, Opcode::Jump as u8), 0);

		self.write_ptr = 0;
		transport.wake_consumer();
		log::trace!("{}: rotated to buffer {} ({:#x})", self.label, self.active, new_addr);
	}

	fn dump(&self, what: &'static str) -> DiagnosticDump {
		let buf = &self.buffers[self.active];
		let start = self.write_ptr.saturating_sub(4);
		DiagnosticDump {
			what,
			write_ptr: self.write_ptr,
			sentinel: self.sentinel,
			last_window: buf.snapshot(start, 8),
			current_overlay: 0,
		}
	}

	/// Writes "more data pending" and repeats after a short delay, to
	/// defeat the narrow race where the consumer reads status immediately
	/// before halting (spec.md §4.1 "Fail-safe flush").
	pub fn flush(&self, status: &StatusWord, transport: &dyn Transport) {
		status.set(StatusFlags::MORE_PENDING);
		transport.wake_consumer();
		for _ in 0..10 {
			std::hint::spin_loop();
		}
		status.set(StatusFlags::MORE_PENDING);
		transport.wake_consumer();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sim::SimTransport;

	fn key(word: u32) -> (u8, u8) {
		let (key, _payload) = CommandKey::decode_word(word);
		(key.overlay_id(), key.local_index())
	}

	#[test]
	fn header_written_after_payload_is_observable() {
		let status = StatusWord::new();
		let transport = SimTransport::new();
		let mut ring = RingWriter::new(64, StatusFlags::BUFDONE_LOW, "test", 1000);

		let cw = ring.reserve(&status, &transport, 3);
		cw.write_payload(1, 0xdead_beef);
		cw.write_payload(2, 0xcafe_babe);
		cw.finish(CommandKey::new(0xa, 0x1), 0x01);

		let buf = ring.active_buffer();
		assert_eq!(key(buf.load(0, Ordering::Acquire)), (0xa, 0x1));
		assert_eq!(buf.load(1, Ordering::Relaxed), 0xdead_beef);
		assert_eq!(buf.load(2, Ordering::Relaxed), 0xcafe_babe);
	}

	#[test]
	fn rotation_stitches_write_status_then_jump() {
		let status = StatusWord::new();
		let transport = SimTransport::new();
		let mut ring = RingWriter::new(16, StatusFlags::BUFDONE_LOW, "test", 1000);
		status.set(StatusFlags::BUFDONE_LOW);

		// 1-word commands; sentinel = 16 - 4 = 12, so the 13th command forces rotation.
		for i in 0..13u32 {
			let cw = ring.reserve(&status, &transport, 1);
			cw.finish(CommandKey::new(0, 0x1), i);
			status.set(StatusFlags::BUFDONE_LOW); // pretend the consumer keeps marking done
		}

		let old_buf = ring.buffer(0);
		let (write_status_key, _) = CommandKey::decode_word(old_buf.load(12, Ordering::Acquire));
		assert_eq!(write_status_key.local_index(), Opcode::WriteStatus as u8);
		let (jump_key, _) = CommandKey::decode_word(old_buf.load(14, Ordering::Acquire));
		assert_eq!(jump_key.local_index(), Opcode::Jump as u8);
		assert_eq!(ring.active_index(), 1);
	}

	#[test]
	fn concurrent_observer_never_sees_torn_command() {
		use std::sync::Arc;
		use std::sync::atomic::AtomicBool;

		struct Shared {
			buf: WordBuffer,
		}

		let shared = Arc::new(Shared { buf: WordBuffer::new(8) });
		let done = Arc::new(AtomicBool::new(false));

		let writer_shared = shared.clone();
		let writer_done = done.clone();
		let writer = std::thread::spawn(move || {
			for round in 0..20_000u32 {
				let cw = CommandWriter::new(&writer_shared.buf, 0, 3);
				cw.write_payload(1, 0xdead_beef);
				cw.write_payload(2, 0xcafe_babe ^ round);
				cw.finish(CommandKey::new(0xa, 0x1), 0);
				writer_shared.buf.store(0, 0, Ordering::Release); // reset for next round
			}
			writer_done.store(true, Ordering::Release);
		});

		let reader_shared = shared.clone();
		let reader = std::thread::spawn(move || {
			while !done.load(Ordering::Acquire) {
				let header = reader_shared.buf.load(0, Ordering::Acquire);
				if header != 0 {
					let p1 = reader_shared.buf.load(1, Ordering::Relaxed);
					assert_eq!(p1, 0xdead_beef, "observed a torn command: header visible but payload stale");
				}
			}
		});

		writer.join().unwrap();
		reader.join().unwrap();
	}
}
