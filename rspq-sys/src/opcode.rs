use core::fmt;

/// Internal (overlay 0) dispatch opcodes, spec.md §6. Each occupies the
/// bottom nibble of a command key; the consumer treats overlay ID `0` as
/// built-in regardless of which overlay is currently loaded.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Opcode {
	/// reserved; marks unwritten memory
	Invalid = 0x0,
	/// 1 word: no-op
	Noop = 0x1,
	/// 2 words: set read pointer to arg
	Jump = 0x2,
	/// 3 words: save read pointer in slot `arg2 >> 2`, jump to `arg1`
	Call = 0x3,
	/// 1 word: restore read pointer from slot `arg >> 2`
	Ret = 0x4,
	/// 5 words: DMA bytes between RDRAM and consumer scratchpad
	Dma = 0x5,
	/// 2 words: write mask into the status word
	WriteStatus = 0x6,
	/// 4 words: save current pointer to slot A, load from slot B, apply mask
	SwapBuffers = 0x7,
	/// 3 words: wait until `(status & mask2) == 0`, then write mask1
	TestWriteStatus = 0x8,
}

impl Opcode {
	/// Command length in words, including the header word.
	pub fn words(self) -> u32 {
		match self {
			Opcode::Invalid => 0,
			Opcode::Noop => 1,
			Opcode::Jump => 2,
			Opcode::Call => 3,
			Opcode::Ret => 1,
			Opcode::Dma => 5,
			Opcode::WriteStatus => 2,
			Opcode::SwapBuffers => 4,
			Opcode::TestWriteStatus => 3,
		}
	}
}

impl Default for Opcode {
	fn default() -> Self {
		Opcode::Invalid
	}
}

/// Undecoded local-index nibble, kept around the way `RawOperation` keeps
/// an undecoded io_uring opcode byte: overlay-specific commands (local
/// index paired with a non-zero overlay ID) aren't in this enum at all.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RawOpcode(pub u8);

impl RawOpcode {
	pub fn decode(self) -> Option<Opcode> {
		Some(match self.0 {
			0x0 => Opcode::Invalid,
			0x1 => Opcode::Noop,
			0x2 => Opcode::Jump,
			0x3 => Opcode::Call,
			0x4 => Opcode::Ret,
			0x5 => Opcode::Dma,
			0x6 => Opcode::WriteStatus,
			0x7 => Opcode::SwapBuffers,
			0x8 => Opcode::TestWriteStatus,
			_ => return None,
		})
	}
}

impl From<Opcode> for RawOpcode {
	fn from(op: Opcode) -> Self {
		RawOpcode(op as u8)
	}
}

impl fmt::Debug for RawOpcode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self.decode() {
			Some(op) => op.fmt(f),
			None => f.debug_tuple("RawOpcode").field(&self.0).finish(),
		}
	}
}
