use std::sync::atomic::{AtomicU32, Ordering};

use rspq_sys::StatusFlags;

/// The single synchronization primitive between producer and consumer
/// (spec.md glossary). Each bit has a designated producer, so plain atomic
/// set/clear masks are enough; no bit is ever read-modify-written from both
/// sides (spec.md §5).
#[derive(Default)]
pub struct StatusWord(AtomicU32);

impl StatusWord {
	pub fn new() -> Self {
		StatusWord(AtomicU32::new(0))
	}

	pub fn set(&self, mask: StatusFlags) {
		self.0.fetch_or(mask.bits(), Ordering::AcqRel);
	}

	pub fn clear(&self, mask: StatusFlags) {
		self.0.fetch_and(!mask.bits(), Ordering::AcqRel);
	}

	/// Flip every bit in `mask`. `SWAP_BUFFERS` uses this (not `set`) so
	/// the same mask value drives both halves of a preemption: entering
	/// high-priority mode flips a clear bit on, leaving flips it back off
	/// (spec.md §4.5).
	pub fn toggle(&self, mask: StatusFlags) {
		self.0.fetch_xor(mask.bits(), Ordering::AcqRel);
	}

	pub fn test(&self, mask: StatusFlags) -> bool {
		self.0.load(Ordering::Acquire) & mask.bits() != 0
	}

	/// Atomically clear `mask` and report whether it was set beforehand.
	/// Used by ring rotation to consume a `bufdone` bit exactly once.
	pub fn test_and_clear(&self, mask: StatusFlags) -> bool {
		let prev = self.0.fetch_and(!mask.bits(), Ordering::AcqRel);
		prev & mask.bits() != 0
	}

	pub fn load(&self) -> StatusFlags {
		StatusFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_and_clear_are_independent_per_bit() {
		let status = StatusWord::new();
		status.set(StatusFlags::SYNCPOINT);
		status.set(StatusFlags::HIGHPRI_REQUESTED);
		assert!(status.test(StatusFlags::SYNCPOINT));
		assert!(status.test(StatusFlags::HIGHPRI_REQUESTED));

		status.clear(StatusFlags::SYNCPOINT);
		assert!(!status.test(StatusFlags::SYNCPOINT));
		assert!(status.test(StatusFlags::HIGHPRI_REQUESTED));
	}

	#[test]
	fn test_and_clear_reports_prior_value_once() {
		let status = StatusWord::new();
		assert!(!status.test_and_clear(StatusFlags::BUFDONE_LOW));
		status.set(StatusFlags::BUFDONE_LOW);
		assert!(status.test_and_clear(StatusFlags::BUFDONE_LOW));
		assert!(!status.test_and_clear(StatusFlags::BUFDONE_LOW));
	}
}
