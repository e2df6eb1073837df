/// Stands in for the collaborators spec.md §1 declares out of scope: the
/// consumer's wakeup line and its DMA engine. Production embedders
/// implement this against real hardware registers; [`crate::sim`] gives
/// tests and the demo binary something to drive the Dispatcher Contract
/// against.
pub trait Transport {
	/// Nudge the consumer out of its halted/idle poll loop (spec.md §4.1
	/// "wake the consumer").
	fn wake_consumer(&self);

	/// Enqueue a DMA copy between RDRAM and the consumer's scratchpad.
	/// `to_scratchpad` selects the direction; `rdram_addr` and
	/// `dmem_addr` are opaque 32-bit addresses per spec.md §1 ("treated
	/// as opaque 32-bit words").
	fn dma(&self, rdram_addr: u32, dmem_addr: u32, len_bytes: u32, to_scratchpad: bool);

	/// Seed a `CALL`/`SWAP_BUFFERS` save slot with an initial address
	/// before any command ever writes to it. Stands in for the boot-time
	/// initialization real consumer firmware performs so the very first
	/// high-priority switch has somewhere valid to load from (spec.md
	/// §4.5).
	fn prime_slot(&self, slot: u32, addr: u32);
}

impl<T: Transport + ?Sized> Transport for std::rc::Rc<T> {
	fn wake_consumer(&self) {
		(**self).wake_consumer()
	}

	fn dma(&self, rdram_addr: u32, dmem_addr: u32, len_bytes: u32, to_scratchpad: bool) {
		(**self).dma(rdram_addr, dmem_addr, len_bytes, to_scratchpad)
	}

	fn prime_slot(&self, slot: u32, addr: u32) {
		(**self).prime_slot(slot, addr)
	}
}
