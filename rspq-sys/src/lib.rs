#![no_std]

mod macros;

mod opcode;
pub use opcode::{
	Opcode,
	RawOpcode,
};

mod key;
pub use key::CommandKey;

#[cfg(test)]
mod tests;

use bitflags::bitflags;

use core::mem::size_of;

static_assert!(
	size_of::<OverlayHeader>() == 16,
	true
);

/// Command key `0x00`: unwritten memory, never a valid command.
pub const INVALID_KEY: u8 = 0;

/// Number of local command indices (bottom nibble of the command key) per
/// overlay ID.
pub const COMMANDS_PER_OVERLAY: u32 = 16;

/// Number of dispatch-table slots (one per overlay ID nibble value).
pub const DISPATCH_TABLE_SLOTS: usize = 16;

/// Command-size ceiling (spec.md §3): the longest command, in words,
/// including its header, that any overlay may declare. Chosen generously
/// above the longest internal opcode ([`Opcode::Dma`], 5 words).
pub const MAX_COMMAND_WORDS: u32 = 16;

/// Magic stamped into `OverlayHeader::signature` by overlays built against
/// this crate's command ABI. A mismatch means the overlay blob was built
/// against a different (or no) `rspq` revision.
pub const OVERLAY_ABI_SIGNATURE: u32 = 0x5253_5051; // "RSPQ" in ASCII, read as LE u32

bitflags! {
	/// Status-word bit plan (spec.md §6). Every bit here has a disjoint
	/// mask, so a multi-bit `WRITE_STATUS`/`TEST_WRITE_STATUS` update is a
	/// single atomic read-modify-free store.
	#[derive(Default)]
	pub struct StatusFlags: u32 {
		/// Producer has more commands queued past the current `INVALID` word.
		const MORE_PENDING = 1 << 0;
		/// Consumer finished the low-priority ring's other buffer.
		const BUFDONE_LOW = 1 << 1;
		/// Consumer finished the high-priority ring's other buffer.
		const BUFDONE_HIGH = 1 << 2;
		/// A syncpoint interrupt is pending acknowledgement.
		const SYNCPOINT = 1 << 3;
		/// CPU requested a switch into the high-priority stream.
		const HIGHPRI_REQUESTED = 1 << 4;
		/// Consumer is currently executing the high-priority stream.
		const HIGHPRI_RUNNING = 1 << 5;
		/// Downstream-fence hook (e.g. a graphics trace completion).
		const SIG0 = 1 << 6;
		/// Consumer halted, awaiting a wakeup.
		const HALT = 1 << 7;
		/// Consumer hit a fatal condition; diagnostic dump follows.
		const BROKE = 1 << 8;
		/// Raise a CPU interrupt when this word is written.
		const INTR = 1 << 9;

		// don't truncate any bits
		#[doc(hidden)]
		const _ALL = !0;
	}
}

/// Header of an overlay's data image (spec.md §3, §9 "Overlay base address
/// packing"). Lives at a fixed offset inside the overlay's own data blob;
/// `command_base` is patched there at registration time.
///
/// C: mirrors the `rsp_ucode` common header the original implementation
/// checks with `rsp_check`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OverlayHeader {
	/// must equal [`OVERLAY_ABI_SIGNATURE`]
	pub signature: u32,
	/// `command_base` is written here by the registry: `id << 5` (id in
	/// the top 4 bits of the key, shifted into the command-word's command
	/// base field; see `CommandKey`).
	pub command_base_offset: u32,
	/// byte offset, within this overlay's data image, of the region the
	/// consumer saves/restores across an overlay switch
	pub state_start: u32,
	/// byte length of that saved-state region
	pub state_size: u32,
}
