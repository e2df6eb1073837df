//! An in-memory interpreter of the Dispatcher Contract (spec.md §4.3),
//! good enough to drive the producer-side tests and the demo binary, but
//! not a peripheral driver or a model of any real coprocessor timing.
//! Production embedders implement [`Transport`] against real hardware
//! instead.

use std::sync::atomic::Ordering;

use rspq_sys::{CommandKey, Opcode, RawOpcode, StatusFlags};

use crate::addr_space;
use crate::status::StatusWord;
use crate::transport::Transport;

/// A `Transport` that just counts wakeups and DMA requests; `SimConsumer`
/// does the actual "consumer" work by directly interpreting ring memory,
/// driven step by step from test code rather than a real poll loop.
#[derive(Default)]
pub struct SimTransport {
	wakeups: std::cell::Cell<u32>,
	dmas: std::cell::Cell<u32>,
	primed: std::cell::RefCell<Vec<(u32, u32)>>,
}

impl SimTransport {
	pub fn new() -> Self {
		SimTransport::default()
	}

	pub fn wakeups(&self) -> u32 {
		self.wakeups.get()
	}

	pub fn dmas(&self) -> u32 {
		self.dmas.get()
	}

	/// Every `(slot, addr)` pair handed to `prime_slot` so far, in order.
	/// Tests apply these to a `SimConsumer` with `SimConsumer::prime`.
	pub fn primed_slots(&self) -> Vec<(u32, u32)> {
		self.primed.borrow().clone()
	}
}

impl Transport for SimTransport {
	fn wake_consumer(&self) {
		self.wakeups.set(self.wakeups.get() + 1);
	}

	fn dma(&self, _rdram_addr: u32, _dmem_addr: u32, _len_bytes: u32, _to_scratchpad: bool) {
		self.dmas.set(self.dmas.get() + 1);
	}

	fn prime_slot(&self, slot: u32, addr: u32) {
		self.primed.borrow_mut().push((slot, addr));
	}
}

/// One dispatched non-internal command, as the consumer would see it:
/// overlay id, local index, and its payload words (header's 24-bit field
/// folded in as the first entry).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchedCommand {
	pub overlay_id: u8,
	pub local_index: u8,
	pub header_payload: u32,
	pub extra_words: Vec<u32>,
}

/// Walks a ring (or block chain) exactly as spec.md §4.3 describes,
/// recording every non-internal command it dispatches.
pub struct SimConsumer {
	read_ptr: u32,
	current_overlay: u8,
	save_slots: Vec<u32>,
	pub trace: Vec<DispatchedCommand>,
	halted: bool,
}

impl SimConsumer {
	pub fn new(start_addr: u32, save_slots: u32) -> Self {
		SimConsumer {
			read_ptr: start_addr,
			current_overlay: 0,
			save_slots: vec![0; save_slots as usize],
			trace: Vec::new(),
			halted: false,
		}
	}

	pub fn halted(&self) -> bool {
		self.halted
	}

	pub fn current_overlay(&self) -> u8 {
		self.current_overlay
	}

	/// Seed a save slot directly, the way real consumer firmware's boot
	/// sequence would (spec.md §4.5's bootstrap, mirrored by
	/// `Transport::prime_slot`).
	pub fn prime(&mut self, slot: u32, addr: u32) {
		self.save_slots[slot as usize] = addr;
	}

	/// Run until the consumer halts (an `INVALID` word with `MORE_PENDING`
	/// clear) or `max_steps` commands have been dispatched, whichever
	/// comes first. `command_words` answers "how many words does
	/// `(overlay_id, local_index)` occupy", standing in for the
	/// out-of-scope per-overlay command table.
	pub fn run(&mut self, status: &StatusWord, command_words: &dyn Fn(u8, u8) -> u32, max_steps: u32) {
		self.halted = false;
		for _ in 0..max_steps {
			let word = addr_space::load(self.read_ptr, Ordering::Acquire);
			let (key, payload) = CommandKey::decode_word(word);

			if key.is_invalid() {
				if status.test_and_clear(StatusFlags::MORE_PENDING) {
					continue;
				}
				self.halted = true;
				return;
			}

			if key.overlay_id() != 0 {
				self.current_overlay = key.overlay_id();
				let words = command_words(key.overlay_id(), key.local_index());
				assert!(words >= 1, "overlay command must occupy at least its header word");
				let extra = (1..words).map(|i| addr_space::load(self.read_ptr + i * 4, Ordering::Relaxed)).collect();
				self.trace.push(DispatchedCommand {
					overlay_id: key.overlay_id(),
					local_index: key.local_index(),
					header_payload: payload,
					extra_words: extra,
				});
				self.read_ptr += words * 4;
				continue;
			}

			self.dispatch_internal(key, payload, status);
		}
		panic!("sim consumer: exceeded {} steps without halting (stuck ring?)", max_steps);
	}

	fn word(&self, offset_words: u32) -> u32 {
		addr_space::load(self.read_ptr + offset_words * 4, Ordering::Relaxed)
	}

	fn dispatch_internal(&mut self, key: CommandKey, payload: u32, status: &StatusWord) {
		let op = RawOpcode(key.local_index()).decode().unwrap_or_else(|| panic!("sim: unknown overlay-0 opcode {:#x}", key.local_index()));
		match op {
			Opcode::Invalid => unreachable!("handled by caller"),
			Opcode::Noop => {
				self.read_ptr += Opcode::Noop.words() * 4;
			}
			Opcode::Jump => {
				let target = self.word(1);
				self.read_ptr = target;
			}
			Opcode::Call => {
				let target = self.word(1);
				let slot = (self.word(2) >> 2) as usize;
				let ret_addr = self.read_ptr + Opcode::Call.words() * 4;
				self.save_slots[slot] = ret_addr;
				self.read_ptr = target;
			}
			Opcode::Ret => {
				let slot = (payload >> 2) as usize;
				self.read_ptr = self.save_slots[slot];
			}
			Opcode::Dma => {
				self.read_ptr += Opcode::Dma.words() * 4;
			}
			Opcode::WriteStatus => {
				let mask = self.word(1);
				status.set(StatusFlags::from_bits_truncate(mask));
				self.read_ptr += Opcode::WriteStatus.words() * 4;
			}
			Opcode::SwapBuffers => {
				let slot_a = (self.word(1) >> 2) as usize;
				let slot_b = (self.word(2) >> 2) as usize;
				let mask = self.word(3);
				let next = self.read_ptr + Opcode::SwapBuffers.words() * 4;
				self.save_slots[slot_a] = next;
				self.read_ptr = self.save_slots[slot_b];
				status.toggle(StatusFlags::from_bits_truncate(mask));
			}
			Opcode::TestWriteStatus => {
				let mask1 = self.word(1);
				let mask2 = self.word(2);
				let mut spin = 0u32;
				while status.load().bits() & mask2 != 0 {
					spin += 1;
					assert!(spin < 1_000_000, "sim: TEST_WRITE_STATUS spun forever waiting for mask2 to clear");
				}
				status.set(StatusFlags::from_bits_truncate(mask1));
				self.read_ptr += Opcode::TestWriteStatus.words() * 4;
			}
		}
	}
}
