use std::sync::atomic::Ordering;

use rspq_sys::{CommandKey, Opcode, RawOpcode};

use crate::ring::{CommandWriter, WordBuffer};

/// A block's backing storage: a singly-chained sequence of word buffers,
/// growing by doubling (spec.md §4.4) from `chunk_min_words` up to
/// `chunk_max_words`, stitched together with `JUMP`s exactly like ring
/// rotation — except a block is never replayed live while still being
/// written, so no `bufdone` handshake is needed between chunks.
struct BlockChain {
	chunks: Vec<WordBuffer>,
	write_ptr: u32,
	chunk_max_words: u32,
}

/// Words reserved at the tail of every chunk but the last for the
/// inter-chunk `JUMP` stitch.
const CHUNK_STITCH_WORDS: u32 = 2;

impl BlockChain {
	fn new(chunk_min_words: u32) -> Self {
		BlockChain {
			chunks: vec![WordBuffer::new(chunk_min_words)],
			write_ptr: 0,
			chunk_max_words: chunk_min_words,
		}
	}

	fn start_addr(&self) -> u32 {
		self.chunks[0].addr()
	}

	fn current(&self) -> &WordBuffer {
		self.chunks.last().unwrap()
	}

	fn reserve(&mut self, n_words: u32, chunk_max_words: u32) -> CommandWriter<'_> {
		let capacity = self.current().len_words();
		if self.write_ptr + n_words + CHUNK_STITCH_WORDS > capacity {
			self.grow(chunk_max_words);
		}
		let base = self.write_ptr;
		self.write_ptr += n_words;
		CommandWriter::new(self.current(), base, n_words)
	}

	fn grow(&mut self, chunk_max_words: u32) {
		let next_size = (self.current().len_words() * 2).min(chunk_max_words);
		let next = WordBuffer::new(next_size);

		let jump = CommandWriter::new(self.current(), self.write_ptr, Opcode::Jump.words());
		jump.write_payload(1, next.addr());
		jump.finish(CommandKey::new(0, Opcode::Jump as u8), 0);

		self.chunks.push(next);
		self.write_ptr = 0;
		self.chunk_max_words = chunk_max_words;
		log::trace!("block recorder: grew to a {}-word chunk", self.chunks.last().unwrap().len_words());
	}

	fn finish(&mut self, slot: u32) {
		let ret = self.reserve(Opcode::Ret.words(), self.chunk_max_words);
		ret.finish(CommandKey::new(0, Opcode::Ret as u8), slot << 2);
	}
}

/// Opaque handle to a recorded block, returned by [`BlockRecorder::end`].
/// `level` is the nesting depth computed at `end()` time (spec.md §4.4):
/// zero for a block with no nested `block_run` calls, otherwise one more
/// than the deepest block it calls. That level doubles as the CALL/RET
/// save slot, so a block is always entered and returned from through the
/// same slot no matter which context calls it — only the slot budget
/// (`QueueConfig::max_nesting`) bounds how deep blocks may call blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandle {
	id: u32,
	start_addr: u32,
	level: u32,
}

impl BlockHandle {
	pub(crate) fn start_addr(self) -> u32 {
		self.start_addr
	}

	pub(crate) fn level(self) -> u32 {
		self.level
	}
}

struct ActiveRecording {
	chain: BlockChain,
	max_child_level: u32,
}

/// Records command sequences for later replay via `CALL`/`RET` (spec.md
/// §4.4). Only one recording may be active at a time; nesting comes from
/// calling already-finished blocks via [`BlockRecorder::record_call`]
/// while a new one is being built, not from nesting `begin`/`end` itself.
pub struct BlockRecorder {
	active: Option<ActiveRecording>,
	blocks: Vec<Option<BlockChain>>,
	chunk_min_words: u32,
	chunk_max_words: u32,
	max_nesting: u32,
}

impl BlockRecorder {
	pub(crate) fn new(chunk_min_words: u32, chunk_max_words: u32, max_nesting: u32) -> Self {
		BlockRecorder {
			active: None,
			blocks: Vec::new(),
			chunk_min_words,
			chunk_max_words,
			max_nesting,
		}
	}

	pub fn is_recording(&self) -> bool {
		self.active.is_some()
	}

	pub fn begin(&mut self) {
		debug_assert!(self.active.is_none(), "block_begin called while another block recording is already open");
		self.active = Some(ActiveRecording {
			chain: BlockChain::new(self.chunk_min_words),
			max_child_level: 0,
		});
	}

	/// Reserve `n_words` in whichever block is currently being recorded.
	/// Panics (via `debug_assert` upstream) if called with no recording
	/// active; callers (`Queue`) are expected to check `is_recording`
	/// first and route to the ring writer otherwise.
	pub fn reserve(&mut self, n_words: u32) -> CommandWriter<'_> {
		let recording = self.active.as_mut().expect("reserve called with no block recording active");
		recording.chain.reserve(n_words, self.chunk_max_words)
	}

	/// Emit the `CALL` for invoking `target` from whatever is currently
	/// being recorded, and fold its level into this block's own.
	pub fn record_call(&mut self, target: BlockHandle) {
		let recording = self.active.as_mut().expect("record_call called with no block recording active");
		recording.max_child_level = recording.max_child_level.max(target.level() + 1);
		let call = recording.chain.reserve(Opcode::Call.words(), self.chunk_max_words);
		call.write_payload(1, target.start_addr());
		call.write_payload(2, target.level() << 2);
		call.finish(CommandKey::new(0, Opcode::Call as u8), 0);
	}

	/// Close the active recording, appending its terminating `RET` and
	/// handing back a handle other code can `CALL` into.
	pub fn end(&mut self) -> BlockHandle {
		let mut recording = self.active.take().expect("block_end called with no block recording active");
		debug_assert!(
			recording.max_child_level < self.max_nesting,
			"block nesting depth {} exceeds the configured ceiling of {}",
			recording.max_child_level,
			self.max_nesting
		);
		recording.chain.finish(recording.max_child_level);

		let start_addr = recording.chain.start_addr();
		let level = recording.max_child_level;
		let id = self.blocks.len() as u32;
		self.blocks.push(Some(recording.chain));

		log::debug!("block recorder: finished block {} at level {} ({} chunk(s))", id, level, self.blocks[id as usize].as_ref().unwrap().chunks.len());
		BlockHandle { id, start_addr, level }
	}

	/// Release the storage backing `handle`. The handle must not be
	/// `block_run` again afterward (misuse, matching spec.md §7).
	///
	/// Walks the chunk chain the way spec.md §4.4 describes: scan each
	/// chunk from its end back to the first non-zero word. A `JUMP`
	/// there names the next chunk, a `RET` ends the chain, and anything
	/// else means the zero-padding invariant (spec.md §9 "Buffer chain
	/// freeing") was violated. Every chunk is already owned in `chain`,
	/// so this validates the chain's own `JUMP` targets against it
	/// rather than following raw addresses through [`crate::addr_space`].
	pub fn free(&mut self, handle: BlockHandle) {
		let mut chain = match self.blocks.get_mut(handle.id as usize) {
			Some(slot) if slot.is_some() => slot.take().unwrap(),
			_ => {
				debug_assert!(false, "block_free called on an unknown or already-freed block");
				return;
			}
		};

		for (i, chunk) in chain.chunks.iter().enumerate() {
			let term = scan_chunk_terminator(chunk);
			let is_last = i + 1 == chain.chunks.len();
			match (term, is_last) {
				(ChunkTerminator::Jump(target), false) => {
					debug_assert_eq!(target, chain.chunks[i + 1].addr(), "block chunk chain JUMP target does not match the next chunk's address");
				}
				(ChunkTerminator::Ret, true) => {}
				(term, _) => panic!(
					"block_free: chunk {} of block {} ends in {:?}, expected {}",
					i,
					handle.id,
					term,
					if is_last { "RET" } else { "JUMP" }
				),
			}
		}

		while chain.chunks.pop().is_some() {}
	}
}

/// What the scan-backward pass in [`BlockRecorder::free`] found at the
/// tail of a chunk.
#[derive(Debug)]
enum ChunkTerminator {
	/// A `JUMP`'s target word, naming the next chunk in the chain.
	Jump(u32),
	Ret,
	Other(CommandKey),
}

/// Scan `buf` backward from its end to the first non-zero word (spec.md
/// §4.4's free algorithm). That word is either a one-word `RET`, or the
/// target word of a two-word `JUMP` whose header sits immediately before
/// it — which one is determined by checking whether the preceding word
/// decodes as a `JUMP` header.
fn scan_chunk_terminator(buf: &WordBuffer) -> ChunkTerminator {
	let mut idx = buf.len_words();
	let last_nonzero = loop {
		assert!(idx > 0, "block chunk at {:#x} has no non-zero terminator word", buf.addr());
		idx -= 1;
		let word = buf.load(idx, Ordering::Relaxed);
		if word != 0 {
			break word;
		}
	};

	if idx > 0 {
		let (header, _) = CommandKey::decode_word(buf.load(idx - 1, Ordering::Relaxed));
		if header.overlay_id() == 0 && RawOpcode(header.local_index()).decode() == Some(Opcode::Jump) {
			return ChunkTerminator::Jump(last_nonzero);
		}
	}

	let (key, _) = CommandKey::decode_word(last_nonzero);
	if key.overlay_id() == 0 && RawOpcode(key.local_index()).decode() == Some(Opcode::Ret) {
		ChunkTerminator::Ret
	} else {
		ChunkTerminator::Other(key)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sim::SimConsumer;
	use crate::status::StatusWord;

	fn decode_at(buf: &WordBuffer, word: u32) -> (u8, u8) {
		let (key, _) = CommandKey::decode_word(buf.load(word, Ordering::Acquire));
		(key.overlay_id(), key.local_index())
	}

	#[test]
	fn leaf_block_gets_level_zero_and_ends_in_ret() {
		let mut recorder = BlockRecorder::new(64, 4096, 8);
		recorder.begin();
		let cw = recorder.reserve(1);
		cw.finish(CommandKey::new(3, 0x1), 0x42);
		let handle = recorder.end();

		assert_eq!(handle.level(), 0);
		let chain = recorder.blocks[handle.id as usize].as_ref().unwrap();
		assert_eq!(decode_at(&chain.chunks[0], 1), (0, Opcode::Ret as u8));
	}

	#[test]
	fn calling_a_child_block_raises_the_parent_level() {
		let mut recorder = BlockRecorder::new(64, 4096, 8);

		recorder.begin();
		let leaf = recorder.end(); // level 0, empty body

		recorder.begin();
		recorder.record_call(leaf);
		let parent = recorder.end();

		assert_eq!(leaf.level(), 0);
		assert_eq!(parent.level(), 1);
	}

	#[test]
	fn nesting_ceiling_trips_an_assertion() {
		let mut recorder = BlockRecorder::new(64, 4096, 1);
		recorder.begin();
		let leaf = recorder.end(); // level 0

		recorder.begin();
		let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
			recorder.record_call(leaf);
			recorder.end()
		}));
		assert!(result.is_err(), "expected nesting ceiling overflow to panic");
	}

	#[test]
	fn recorded_block_replays_through_sim_consumer() {
		let mut recorder = BlockRecorder::new(64, 4096, 8);
		recorder.begin();
		let cw = recorder.reserve(2);
		cw.write_payload(1, 0x1234);
		cw.finish(CommandKey::new(5, 0x2), 0);
		let handle = recorder.end();

		// Drive the block the way a real caller would: CALL it from a
		// tiny top-level buffer so RET has a real return address to land
		// on (a zeroed, never-written word, which reads back as HALT).
		let main = WordBuffer::new(4);
		let call = CommandWriter::new(&main, 0, Opcode::Call.words());
		call.write_payload(1, handle.start_addr());
		call.write_payload(2, handle.level() << 2);
		call.finish(CommandKey::new(0, Opcode::Call as u8), 0);

		let status = StatusWord::new();
		let mut consumer = SimConsumer::new(main.addr(), 8);
		consumer.run(&status, &|overlay, local| if overlay == 5 && local == 2 { 2 } else { 1 }, 100);

		assert!(consumer.halted());
		assert_eq!(consumer.trace.len(), 1);
		assert_eq!(consumer.trace[0].overlay_id, 5);
		assert_eq!(consumer.trace[0].extra_words, vec![0x1234]);
	}

	#[test]
	fn free_walks_a_multi_chunk_chain_via_its_jump_stitches() {
		// chunk_min_words is small enough that a handful of 2-word
		// commands force at least one grow(), giving free() a real
		// JUMP to scan past before it reaches the terminating RET.
		let mut recorder = BlockRecorder::new(4, 4096, 8);
		recorder.begin();
		for i in 0..4u32 {
			let cw = recorder.reserve(2);
			cw.write_payload(1, 0x1000 + i);
			cw.finish(CommandKey::new(3, 0x1), i);
		}
		let handle = recorder.end();

		assert!(recorder.blocks[handle.id as usize].as_ref().unwrap().chunks.len() > 1, "expected recording to have grown into a second chunk");

		recorder.free(handle);
		assert!(recorder.blocks[handle.id as usize].is_none());
	}
}
