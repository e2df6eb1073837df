/// Tunables that spec.md leaves as "a configuration constant in the
/// source" (§9, Open Questions) rather than hard-coded magic numbers.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
	/// Words per ring buffer half (each ring is double-buffered, so the
	/// total backing storage is `2 * ring_words`).
	pub ring_words: u32,
	/// Smallest block chunk the recorder allocates (spec.md §4.4).
	pub block_chunk_min_words: u32,
	/// Largest block chunk the recorder will grow to before capping
	/// doubling (spec.md §4.4).
	pub block_chunk_max_words: u32,
	/// Maximum block nesting depth; also the number of `CALL`/`RET` save
	/// slots (spec.md §9 Open Question, resolved: one slot per level).
	pub max_nesting: u32,
	/// Number of overlay dispatch-table slots (spec.md §3: "typical 16").
	pub dispatch_table_slots: u32,
	/// Spin-wait iterations before a wait is considered "impatient" and
	/// triggers a diagnostic dump (spec.md §7 "Diagnostic").
	pub impatience_threshold: u32,
}

impl Default for QueueConfig {
	fn default() -> Self {
		QueueConfig {
			ring_words: 0x1000,
			block_chunk_min_words: 64,
			block_chunk_max_words: 4096,
			max_nesting: 8,
			dispatch_table_slots: 16,
			impatience_threshold: 100_000,
		}
	}
}
