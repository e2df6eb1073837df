use crate::*;

#[test]
fn status_bits_are_disjoint() {
	let all = [
		StatusFlags::MORE_PENDING,
		StatusFlags::BUFDONE_LOW,
		StatusFlags::BUFDONE_HIGH,
		StatusFlags::SYNCPOINT,
		StatusFlags::HIGHPRI_REQUESTED,
		StatusFlags::HIGHPRI_RUNNING,
		StatusFlags::SIG0,
		StatusFlags::HALT,
		StatusFlags::BROKE,
		StatusFlags::INTR,
	];
	let mut seen = StatusFlags::empty();
	for &bit in &all {
		assert!((seen & bit).is_empty(), "bit {:?} overlaps a previous one", bit);
		seen |= bit;
	}
}

#[test]
fn opcode_word_counts_match_spec() {
	assert_eq!(Opcode::Noop.words(), 1);
	assert_eq!(Opcode::Jump.words(), 2);
	assert_eq!(Opcode::Call.words(), 3);
	assert_eq!(Opcode::Ret.words(), 1);
	assert_eq!(Opcode::Dma.words(), 5);
	assert_eq!(Opcode::WriteStatus.words(), 2);
	assert_eq!(Opcode::SwapBuffers.words(), 4);
	assert_eq!(Opcode::TestWriteStatus.words(), 3);
}

#[test]
fn command_base_shifts_by_overlay_span() {
	assert_eq!(CommandKey::command_base(0), 0);
	assert_eq!(CommandKey::command_base(1), 32);
	assert_eq!(CommandKey::command_base(5), 160);
}
