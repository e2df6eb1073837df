use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::syncpoint::{Syncpoint, SyncpointEngine};

/// One pending CPU-side callback, gated on a syncpoint and optionally a
/// downstream fence (spec.md §4.7). `FnOnce` replaces the original's
/// function-pointer-plus-opaque-argument pair — the closure captures
/// whatever state it needs instead of the caller packing it into a raw
/// pointer.
struct DeferredCall {
	callback: Box<dyn FnOnce() + Send>,
	sync: Syncpoint,
	downstream_threshold: Option<u32>,
}

/// Ordered queue of deferred calls (spec.md §4.7), run one per `poll()`.
/// `poll()` walks from the head and stops at the first entry whose
/// syncpoint isn't reached yet — that much blocks everything behind it.
/// An entry that additionally waits on the downstream fence is skipped
/// instead, since later entries may still be callable before the fence
/// catches up. Shares `downstream_done` with
/// [`crate::interrupt::InterruptGlue`], which is the only writer.
pub struct DeferredCallList {
	calls: VecDeque<DeferredCall>,
	downstream_done: Arc<AtomicU32>,
}

impl DeferredCallList {
	pub(crate) fn new(downstream_done: Arc<AtomicU32>) -> Self {
		DeferredCallList {
			calls: VecDeque::new(),
			downstream_done,
		}
	}

	/// Run `callback` once `sync` is reached.
	pub fn call_deferred(&mut self, sync: Syncpoint, callback: impl FnOnce() + Send + 'static) {
		self.calls.push_back(DeferredCall {
			callback: Box::new(callback),
			sync,
			downstream_threshold: None,
		});
	}

	/// Run `callback` once `sync` is reached *and* the downstream fence
	/// (spec.md glossary: e.g. a display's own completion signal) has
	/// fired at least once more after this call was registered.
	pub fn call_deferred_after_downstream(&mut self, sync: Syncpoint, callback: impl FnOnce() + Send + 'static) {
		let threshold = self.downstream_done.load(Ordering::Acquire).wrapping_add(1);
		self.calls.push_back(DeferredCall {
			callback: Box::new(callback),
			sync,
			downstream_threshold: Some(threshold),
		});
	}

	pub fn is_empty(&self) -> bool {
		self.calls.is_empty()
	}

	/// Run at most one ready callback. Walks forward from the head,
	/// stopping entirely at the first entry whose syncpoint hasn't been
	/// reached yet — entries never run out of syncpoint order. An entry
	/// whose syncpoint *is* reached but whose downstream fence hasn't
	/// caught up is skipped rather than stopped on, so a later entry with
	/// no downstream requirement (or one that's already satisfied) can
	/// still run in the same call.
	pub fn poll(&mut self, syncpoints: &SyncpointEngine) -> bool {
		let mut index = 0;
		while let Some(call) = self.calls.get(index) {
			if !syncpoints.check(call.sync) {
				return false;
			}
			let downstream_ok = match call.downstream_threshold {
				Some(threshold) => (self.downstream_done.load(Ordering::Acquire) as i32).wrapping_sub(threshold as i32) >= 0,
				None => true,
			};
			if !downstream_ok {
				index += 1;
				continue;
			}
			let call = self.calls.remove(index).expect("index was just checked present");
			log::trace!("deferred call list: running callback gated on ticket {}", call.sync.0);
			(call.callback)();
			return true;
		}
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sim::SimTransport;
	use crate::status::StatusWord;
	use rspq_sys::StatusFlags;
	use std::sync::Mutex;

	#[test]
	fn callbacks_run_in_order_and_not_ahead_of_a_blocked_head() {
		let done = Arc::new(AtomicU32::new(0));
		let mut syncpoints = SyncpointEngine::new(done.clone(), 1000);
		let status = StatusWord::new();
		let transport = SimTransport::new();
		let mut ring = crate::ring::RingWriter::new(64, StatusFlags::BUFDONE_LOW, "test", 1000);

		let a = syncpoints.new_syncpoint(&mut ring, &status, &transport);
		let b = syncpoints.new_syncpoint(&mut ring, &status, &transport);

		let mut list = DeferredCallList::new(Arc::new(AtomicU32::new(0)));
		let order = Arc::new(Mutex::new(Vec::new()));

		let order_a = order.clone();
		list.call_deferred(a, move || order_a.lock().unwrap().push("a"));
		let order_b = order.clone();
		list.call_deferred(b, move || order_b.lock().unwrap().push("b"));

		// b's syncpoint would already be reached once a is, but it must
		// wait behind a in line.
		assert!(!list.poll(&syncpoints));
		assert!(order.lock().unwrap().is_empty());

		done.store(a.0, Ordering::Release);
		assert!(list.poll(&syncpoints));
		assert_eq!(*order.lock().unwrap(), vec!["a"]);

		done.store(b.0, Ordering::Release);
		assert!(list.poll(&syncpoints));
		assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
		assert!(list.is_empty());
	}

	#[test]
	fn downstream_gated_call_waits_for_the_fence_to_advance() {
		let done = Arc::new(AtomicU32::new(0));
		let syncpoints = SyncpointEngine::new(done, 1000);
		let downstream_done = Arc::new(AtomicU32::new(5));
		let mut list = DeferredCallList::new(downstream_done.clone());
		let ran = Arc::new(AtomicU32::new(0));

		let ran_clone = ran.clone();
		list.call_deferred_after_downstream(Syncpoint(0), move || {
			ran_clone.store(1, Ordering::Release);
		});

		assert!(!list.poll(&syncpoints), "downstream fence hasn't advanced past registration yet");
		assert_eq!(ran.load(Ordering::Acquire), 0);

		downstream_done.fetch_add(1, Ordering::Release);
		assert!(list.poll(&syncpoints));
		assert_eq!(ran.load(Ordering::Acquire), 1);
	}

	#[test]
	fn downstream_gated_head_does_not_starve_a_plain_call_behind_it() {
		// mirrors spec.md's scenario of a downstream-gated callback
		// sitting in front of one that only needs its syncpoint reached.
		let done = Arc::new(AtomicU32::new(0));
		let mut syncpoints = SyncpointEngine::new(done.clone(), 1000);
		let status = StatusWord::new();
		let transport = SimTransport::new();
		let mut ring = crate::ring::RingWriter::new(64, StatusFlags::BUFDONE_LOW, "test", 1000);

		let a = syncpoints.new_syncpoint(&mut ring, &status, &transport);
		let b = syncpoints.new_syncpoint(&mut ring, &status, &transport);

		let downstream_done = Arc::new(AtomicU32::new(5));
		let mut list = DeferredCallList::new(downstream_done.clone());
		let order = Arc::new(Mutex::new(Vec::new()));

		let order_a = order.clone();
		list.call_deferred_after_downstream(a, move || order_a.lock().unwrap().push("a"));
		let order_b = order.clone();
		list.call_deferred(b, move || order_b.lock().unwrap().push("b"));

		done.store(b.0, Ordering::Release);

		// a's syncpoint is reached but its downstream fence hasn't caught
		// up; b behind it has no downstream requirement and should still run.
		assert!(list.poll(&syncpoints));
		assert_eq!(*order.lock().unwrap(), vec!["b"]);

		downstream_done.fetch_add(1, Ordering::Release);
		assert!(list.poll(&syncpoints));
		assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
		assert!(list.is_empty());
	}
}
