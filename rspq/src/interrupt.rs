use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use rspq_sys::StatusFlags;

use crate::status::StatusWord;

/// The single handler spec.md §4.8 describes: it reads the status word,
/// acknowledges whichever of the two interrupt-carrying bits are set, and
/// updates the counters [`crate::syncpoint::SyncpointEngine`] and
/// [`crate::deferred::DeferredCallList`] read. Production embedders call
/// `fire` from their real interrupt vector; nothing here assumes that —
/// it only touches atomics, so it's safe to call from any context,
/// matching the "only concurrent CPU context" model in spec.md §5.
pub struct InterruptGlue {
	syncpoints_done: Arc<AtomicU32>,
	downstream_done: Arc<AtomicU32>,
	downstream_hook: Option<Box<dyn Fn() + Send + Sync>>,
}

impl InterruptGlue {
	pub(crate) fn new(syncpoints_done: Arc<AtomicU32>, downstream_done: Arc<AtomicU32>) -> Self {
		InterruptGlue {
			syncpoints_done,
			downstream_done,
			downstream_hook: None,
		}
	}

	/// Register a callback invoked every time the downstream fence
	/// (`SIG0`) fires, in addition to bumping the counter
	/// `call_deferred_after_downstream` gates on.
	pub fn set_downstream_hook(&mut self, hook: impl Fn() + Send + Sync + 'static) {
		self.downstream_hook = Some(Box::new(hook));
	}

	/// Service one interrupt. Returns `true` if either bit was set.
	pub fn fire(&self, status: &StatusWord) -> bool {
		let mut handled = false;

		if status.test_and_clear(StatusFlags::SYNCPOINT) {
			let n = self.syncpoints_done.fetch_add(1, Ordering::Release) + 1;
			log::trace!("interrupt glue: syncpoint acknowledged, done counter now {}", n);
			handled = true;
		}

		if status.test_and_clear(StatusFlags::SIG0) {
			let n = self.downstream_done.fetch_add(1, Ordering::Release) + 1;
			log::trace!("interrupt glue: downstream fence acknowledged, counter now {}", n);
			if let Some(hook) = &self.downstream_hook {
				hook();
			}
			handled = true;
		}

		handled
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fire_acknowledges_both_bits_independently() {
		let syncpoints_done = Arc::new(AtomicU32::new(0));
		let downstream_done = Arc::new(AtomicU32::new(0));
		let glue = InterruptGlue::new(syncpoints_done.clone(), downstream_done.clone());
		let status = StatusWord::new();

		status.set(StatusFlags::SYNCPOINT);
		assert!(glue.fire(&status));
		assert_eq!(syncpoints_done.load(Ordering::Acquire), 1);
		assert_eq!(downstream_done.load(Ordering::Acquire), 0);
		assert!(!status.test(StatusFlags::SYNCPOINT));

		assert!(!glue.fire(&status), "nothing pending the second time");
	}

	#[test]
	fn downstream_hook_runs_alongside_the_counter_bump() {
		let syncpoints_done = Arc::new(AtomicU32::new(0));
		let downstream_done = Arc::new(AtomicU32::new(0));
		let mut glue = InterruptGlue::new(syncpoints_done, downstream_done.clone());
		let hook_ran = Arc::new(AtomicU32::new(0));

		let hook_ran_clone = hook_ran.clone();
		glue.set_downstream_hook(move || {
			hook_ran_clone.fetch_add(1, Ordering::Release);
		});

		let status = StatusWord::new();
		status.set(StatusFlags::SIG0);
		assert!(glue.fire(&status));
		assert_eq!(downstream_done.load(Ordering::Acquire), 1);
		assert_eq!(hook_ran.load(Ordering::Acquire), 1);
	}
}
