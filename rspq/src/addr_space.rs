//! Maps the opaque 32-bit address tokens `WordBuffer` hands out back to the
//! actual heap allocation, so [`crate::sim`] can follow `JUMP`/`CALL`
//! targets the way a real consumer follows RDRAM pointers. Nothing outside
//! this crate's own tests and demo touches this: production embedders
//! drive real hardware and never need to resolve these tokens back to Rust
//! memory.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

thread_local! {
	static REGISTRY: RefCell<BTreeMap<u32, (usize, u32)>> = RefCell::new(BTreeMap::new());
}

pub(crate) fn register(addr: u32, ptr: *const AtomicU32, len_words: u32) {
	REGISTRY.with(|r| {
		r.borrow_mut().insert(addr, (ptr as usize, len_words));
	});
}

/// Load the word at `addr`, wherever it falls within a registered buffer.
pub(crate) fn load(addr: u32, order: Ordering) -> u32 {
	REGISTRY.with(|r| {
		let map = r.borrow();
		let (&base, &(ptr, len)) = map
			.range(..=addr)
			.next_back()
			.unwrap_or_else(|| panic!("sim: address {:#x} is not in any registered buffer", addr));
		let offset = (addr - base) / 4;
		assert!(offset < len, "sim: address {:#x} is past the end of its buffer", addr);
		let atomic_ptr = ptr as *const AtomicU32;
		unsafe { (*atomic_ptr.add(offset as usize)).load(order) }
	})
}

/// Store a word at `addr`, wherever it falls within a registered buffer.
/// Used to patch an already-written command in place (high-priority
/// epilog coalescing is the only caller).
pub(crate) fn store(addr: u32, value: u32, order: Ordering) {
	REGISTRY.with(|r| {
		let map = r.borrow();
		let (&base, &(ptr, len)) = map
			.range(..=addr)
			.next_back()
			.unwrap_or_else(|| panic!("sim: address {:#x} is not in any registered buffer", addr));
		let offset = (addr - base) / 4;
		assert!(offset < len, "sim: address {:#x} is past the end of its buffer", addr);
		let atomic_ptr = ptr as *const AtomicU32;
		unsafe { (*atomic_ptr.add(offset as usize)).store(value, order) }
	})
}
