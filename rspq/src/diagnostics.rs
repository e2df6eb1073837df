/// A crash dump produced when a spin-wait's impatience counter trips
/// (spec.md §7 "Diagnostic"). Not fatal by itself, logged via
/// `log::error!` and the caller keeps polling.
#[derive(Debug)]
pub struct DiagnosticDump {
	pub what: &'static str,
	pub write_ptr: u32,
	pub sentinel: u32,
	pub last_window: Vec<u32>,
	pub current_overlay: u8,
}

impl DiagnosticDump {
	pub fn log(&self) {
		log::error!(
			"rspq impatience dump ({}): write_ptr={:#x} sentinel={:#x} overlay={} last_window={:?}",
			self.what,
			self.write_ptr,
			self.sentinel,
			self.current_overlay,
			self.last_window,
		);
	}
}

/// Shared "have we been spinning too long" counter for every suspension
/// point listed in spec.md §5: ring overflow, `syncpoint_wait`,
/// `highpri_sync`, `wait()`. Counts attempts, not wall-clock time, since
/// this crate has no notion of a hardware cycle counter.
pub(crate) struct SpinWait {
	attempts: u32,
	threshold: u32,
	label: &'static str,
	dumped: bool,
}

impl SpinWait {
	pub(crate) fn new(threshold: u32, label: &'static str) -> Self {
		SpinWait {
			attempts: 0,
			threshold,
			label,
			dumped: false,
		}
	}

	/// Call once per poll iteration. Returns `true` the first time the
	/// threshold is crossed (so the caller logs exactly one dump per
	/// stuck wait, not one per iteration).
	pub(crate) fn tick(&mut self) -> bool {
		self.attempts += 1;
		if self.attempts >= self.threshold && !self.dumped {
			self.dumped = true;
			log::warn!("rspq: {} has spun {} times, dumping diagnostics", self.label, self.attempts);
			return true;
		}
		false
	}
}
