//! Minimal walkthrough of the command queue against the in-memory `sim`
//! transport: register a toy overlay, queue a few of its commands, record
//! and run a block, issue a syncpoint, preempt with a high-priority
//! command, then replay the whole stream through `SimConsumer` and print
//! what it dispatched.

use std::rc::Rc;

use rspq::sim::{SimConsumer, SimTransport};
use rspq::{CommandKey, OverlayImage, Queue};
use rspq_sys::{OverlayHeader, OVERLAY_ABI_SIGNATURE};

const TOY_OVERLAY_COMMAND_WORDS: u32 = 2;

fn main() {
	env_logger::init();

	let transport = Rc::new(SimTransport::new());
	let mut queue = Queue::new(transport.clone());

	let mut data = [0u8; 16];
	let mut image = OverlayImage {
		header: OverlayHeader {
			signature: OVERLAY_ABI_SIGNATURE,
			command_base_offset: 0,
			state_start: 4,
			state_size: 12,
		},
		code: &[],
		data: &mut data,
		command_count: 16,
	};
	let ovl_id = queue.overlay_register(&mut image).expect("register toy overlay");
	println!("registered toy overlay at id {} (command_base {:#x})", ovl_id, queue.overlay_command_base(ovl_id));

	for i in 0..3u32 {
		let cw = queue.command_begin(TOY_OVERLAY_COMMAND_WORDS);
		cw.write_payload(1, 0xa000 + i);
		cw.finish(CommandKey::new(ovl_id, 0x1), i);
	}

	queue.block_begin();
	let cw = queue.command_begin(TOY_OVERLAY_COMMAND_WORDS);
	cw.write_payload(1, 0xb000);
	cw.finish(CommandKey::new(ovl_id, 0x2), 0);
	let block = queue.block_end();
	queue.block_run(block);

	let drain_point = queue.syncpoint_new();

	queue.highpri_begin();
	let cw = queue.command_begin(TOY_OVERLAY_COMMAND_WORDS);
	cw.write_payload(1, 0xc000);
	cw.finish(CommandKey::new(ovl_id, 0x3), 0);
	queue.highpri_end();

	queue.flush();

	let mut consumer = SimConsumer::new(queue.ring_start_addr(), 16);
	for (slot, addr) in transport.primed_slots() {
		consumer.prime(slot, addr);
	}
	consumer.run(queue.status(), &|overlay, _local| if overlay == ovl_id { TOY_OVERLAY_COMMAND_WORDS } else { 1 }, 1000);

	println!("dispatched {} command(s):", consumer.trace.len());
	for cmd in &consumer.trace {
		println!("  overlay {} local {:#x} header_payload {:#x} extra {:x?}", cmd.overlay_id, cmd.local_index, cmd.header_payload, cmd.extra_words);
	}

	// The real interrupt vector would call `queue.interrupt_glue().fire(...)`;
	// here we service it directly since nothing is actually interrupting us.
	queue.interrupt_glue().fire(queue.status());
	println!("syncpoint reached: {}", queue.syncpoint_check(drain_point));

	queue.block_free(block);
}
