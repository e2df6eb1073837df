//! Safe producer-side implementation of a lockless CPU/coprocessor command
//! queue: a double-buffered ring feeding a dispatcher-driven consumer,
//! plus record/replay blocks, high-priority preemption, syncpoints, and
//! deferred CPU callbacks built on top of it.

pub mod addr_space;
pub mod block;
pub mod config;
pub mod deferred;
pub mod diagnostics;
pub mod error;
pub mod highpri;
pub mod interrupt;
pub mod overlay;
pub mod ring;
pub mod sim;
pub mod status;
pub mod syncpoint;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use rspq_sys::{Opcode, StatusFlags};

pub use block::BlockHandle;
pub use config::QueueConfig;
pub use error::QueueError;
pub use overlay::OverlayImage;
pub use ring::CommandWriter;
pub use rspq_sys::CommandKey;
pub use syncpoint::Syncpoint;
pub use transport::Transport;

use block::BlockRecorder;
use deferred::DeferredCallList;
use highpri::PrioritySwitcher;
use interrupt::InterruptGlue;
use overlay::OverlayRegistry;
use ring::RingWriter;
use status::StatusWord;
use syncpoint::SyncpointEngine;

/// The producer half of the queue (spec.md §2). Single-threaded by
/// construction — every method other than the handle returned by
/// [`Queue::interrupt_glue`] assumes one CPU thread is doing the writing,
/// matching spec.md §5's concurrency model.
pub struct Queue<T: Transport> {
	transport: T,
	status: StatusWord,
	normal: RingWriter,
	highpri: PrioritySwitcher,
	overlays: OverlayRegistry,
	blocks: BlockRecorder,
	syncpoints: SyncpointEngine,
	deferred: DeferredCallList,
	interrupt: InterruptGlue,
}

impl<T: Transport> Queue<T> {
	pub fn new(transport: T) -> Self {
		Self::with_config(QueueConfig::default(), transport)
	}

	pub fn with_config(config: QueueConfig, transport: T) -> Self {
		let syncpoints_done = Arc::new(AtomicU32::new(0));
		let downstream_done = Arc::new(AtomicU32::new(0));

		let normal = RingWriter::new(config.ring_words, StatusFlags::BUFDONE_LOW, "normal", config.impatience_threshold);
		let highpri = PrioritySwitcher::new(config.ring_words, config.max_nesting, config.impatience_threshold, &transport);

		Queue {
			transport,
			status: StatusWord::new(),
			normal,
			highpri,
			overlays: OverlayRegistry::new(config.dispatch_table_slots),
			blocks: BlockRecorder::new(config.block_chunk_min_words, config.block_chunk_max_words, config.max_nesting),
			syncpoints: SyncpointEngine::new(syncpoints_done.clone(), config.impatience_threshold),
			deferred: DeferredCallList::new(downstream_done.clone()),
			interrupt: InterruptGlue::new(syncpoints_done, downstream_done),
		}
	}

	/// The status word's raw view, for embedders that want to poll it
	/// directly (e.g. from their own interrupt vector setup code).
	pub fn status(&self) -> &StatusWord {
		&self.status
	}

	/// The handle an embedder's real interrupt vector calls into
	/// (spec.md §4.8). `Send + Sync` regardless of `T`, since it only
	/// touches the shared atomics.
	pub fn interrupt_glue(&self) -> &InterruptGlue {
		&self.interrupt
	}

	/// Where the normal ring currently starts. An embedder reads this once
	/// at boot to point its consumer's read pointer before the first
	/// command is ever appended.
	pub fn ring_start_addr(&self) -> u32 {
		self.normal.current_addr()
	}

	/// Reserve `n_words` for a generic, overlay-specific command (spec.md
	/// §3 "Command word"). This is the primitive overlay wrapper code is
	/// built on, mirroring the original implementation's
	/// `rspq_write_begin`/`rspq_write_arg`/`rspq_write_end` trio —
	/// `write_payload` plays `_arg`, `finish` plays `_end`. Routes to
	/// whichever destination is currently active: a block recording takes
	/// priority, then the high-priority ring, then the normal ring.
	pub fn command_begin(&mut self, n_words: u32) -> ring::CommandWriter<'_> {
		if self.blocks.is_recording() {
			self.blocks.reserve(n_words)
		} else if self.highpri.is_active() {
			self.highpri.ring_mut().reserve(&self.status, &self.transport, n_words)
		} else {
			self.normal.reserve(&self.status, &self.transport, n_words)
		}
	}

	/// Append a single no-op command (spec.md §6).
	pub fn noop(&mut self) {
		let cw = if self.highpri.is_active() {
			self.highpri.ring_mut().reserve(&self.status, &self.transport, Opcode::Noop.words())
		} else {
			self.normal.reserve(&self.status, &self.transport, Opcode::Noop.words())
		};
		cw.finish(CommandKey::new(0, Opcode::Noop as u8), 0);
	}

	/// Nudge the consumer and repeat shortly after, defeating the narrow
	/// race where it reads status right before halting (spec.md §4.1).
	pub fn flush(&mut self) {
		self.normal.flush(&self.status, &self.transport);
		if self.highpri.is_active() {
			self.highpri.ring_mut().flush(&self.status, &self.transport);
		}
	}

	/// Drain everything queued so far: flush, then spin until the normal
	/// ring, the high-priority ring (if active), and every syncpoint
	/// issued up to this point have all been reached (spec.md §4.9).
	pub fn wait(&mut self) {
		self.flush();
		let drain_point = self.syncpoint_new();
		self.syncpoint_wait(drain_point);
		if self.highpri.is_active() {
			self.highpri.sync(&self.status);
		}
	}

	// --- overlays (spec.md §4.2) ---

	pub fn overlay_register(&mut self, image: &mut OverlayImage<'_>) -> Result<u8, QueueError> {
		self.overlays.register(image, None, &self.transport)
	}

	pub fn overlay_register_static(&mut self, image: &mut OverlayImage<'_>, id: u8) -> Result<(), QueueError> {
		self.overlays.register(image, Some(id), &self.transport).map(|_| ())
	}

	pub fn overlay_unregister(&mut self, id: u8) -> Result<(), QueueError> {
		self.overlays.unregister(id, &self.transport)
	}

	pub fn overlay_command_base(&self, id: u8) -> u32 {
		self.overlays.command_base(id)
	}

	// --- blocks (spec.md §4.4) ---

	pub fn block_begin(&mut self) {
		debug_assert!(!self.highpri.is_active(), "block recording is not allowed while a high-priority session is active");
		self.blocks.begin();
	}

	pub fn block_end(&mut self) -> BlockHandle {
		self.blocks.end()
	}

	pub fn block_run(&mut self, handle: BlockHandle) {
		if self.blocks.is_recording() {
			self.blocks.record_call(handle);
			return;
		}
		debug_assert!(!self.highpri.is_active(), "block_run is not allowed while a high-priority session is active");
		let cw = self.normal.reserve(&self.status, &self.transport, Opcode::Call.words());
		cw.write_payload(1, handle.start_addr());
		cw.write_payload(2, handle.level() << 2);
		cw.finish(CommandKey::new(0, Opcode::Call as u8), 0);
	}

	pub fn block_free(&mut self, handle: BlockHandle) {
		self.blocks.free(handle);
	}

	// --- high-priority preemption (spec.md §4.5) ---

	pub fn highpri_begin(&mut self) {
		debug_assert!(!self.blocks.is_recording(), "highpri_begin is not allowed while recording a block");
		// A call while a previous session's exit is still pending is not
		// misuse: it's the normal overlapping-segment case, which
		// `PrioritySwitcher::begin` coalesces instead of rejecting.
		self.highpri.begin(&mut self.normal, &self.status, &self.transport);
	}

	pub fn highpri_end(&mut self) {
		self.highpri.end(&self.status, &self.transport);
	}

	pub fn highpri_sync(&self) {
		self.highpri.sync(&self.status);
	}

	// --- syncpoints (spec.md §4.6) ---

	pub fn syncpoint_new(&mut self) -> Syncpoint {
		debug_assert!(!self.blocks.is_recording(), "syncpoint_new is not allowed while recording a block");
		if self.highpri.is_active() {
			self.syncpoints.new_syncpoint(self.highpri.ring_mut(), &self.status, &self.transport)
		} else {
			self.syncpoints.new_syncpoint(&mut self.normal, &self.status, &self.transport)
		}
	}

	pub fn syncpoint_check(&self, point: Syncpoint) -> bool {
		self.syncpoints.check(point)
	}

	pub fn syncpoint_wait(&self, point: Syncpoint) {
		self.syncpoints.wait(point);
	}

	// --- deferred calls (spec.md §4.7) ---

	/// Defer `callback` until the stream reaches this point. Issues its
	/// own syncpoint internally (spec.md §4.7 "`defer()` issues a new
	/// syncpoint and appends...") — callers don't supply one.
	pub fn call_deferred(&mut self, callback: impl FnOnce() + Send + 'static) {
		debug_assert!(!self.blocks.is_recording(), "call_deferred is not allowed while recording a block");
		let point = self.syncpoint_new();
		self.deferred.call_deferred(point, callback);
	}

	/// Like [`Queue::call_deferred`], but additionally gated on the
	/// downstream fence reaching this point.
	pub fn call_deferred_after_downstream(&mut self, callback: impl FnOnce() + Send + 'static) {
		debug_assert!(!self.blocks.is_recording(), "call_deferred_after_downstream is not allowed while recording a block");
		let point = self.syncpoint_new();
		self.deferred.call_deferred_after_downstream(point, callback);
	}

	/// Run at most one ready deferred callback. Embedders call this from
	/// their idle/frame loop, not from interrupt context.
	pub fn poll_deferred(&mut self) -> bool {
		self.deferred.poll(&self.syncpoints)
	}
}
