use rspq_sys::{CommandKey, OverlayHeader, OVERLAY_ABI_SIGNATURE};

use crate::error::QueueError;
use crate::transport::Transport;

/// An overlay image as handed to [`OverlayRegistry::register`]: the
/// consumer-side code/data blobs (opaque per spec.md §1), the command
/// count they export, and the header the registry validates and patches.
/// `data` is mutable because registration writes `command_base` into it
/// (spec.md §9 "Overlay base address packing").
pub struct OverlayImage<'a> {
	pub header: OverlayHeader,
	pub code: &'a [u8],
	pub data: &'a mut [u8],
	pub command_count: u32,
}

/// CPU-side bookkeeping for one registered overlay.
#[derive(Clone, Copy, Debug)]
struct OverlayDescriptor {
	id: u8,
	slot_count: u32,
}

/// Maps 4-bit overlay IDs to registered images and tracks which dispatch
/// slots are free (spec.md §4.2).
pub struct OverlayRegistry {
	slots: Vec<Option<OverlayDescriptor>>,
}

impl OverlayRegistry {
	pub(crate) fn new(slot_count: u32) -> Self {
		OverlayRegistry {
			slots: vec![None; slot_count as usize],
		}
	}

	fn find_free_run(&self, n: u32) -> Option<u8> {
		let n = n as usize;
		if n == 0 || n > self.slots.len() {
			return None;
		}
		'outer: for start in 0..=(self.slots.len() - n) {
			for slot in &self.slots[start..start + n] {
				if slot.is_some() {
					continue 'outer;
				}
			}
			return Some(start as u8);
		}
		None
	}

	/// Validate `image`, find (or take) a dispatch-table run, patch
	/// `command_base` into the overlay's own data image, and enqueue the
	/// table-update `DMA` so the consumer picks it up lazily (spec.md
	/// §4.2: "without synchronization").
	pub fn register(&mut self, image: &mut OverlayImage<'_>, fixed_id: Option<u8>, transport: &dyn Transport) -> Result<u8, QueueError> {
		self.validate(image)?;

		let slot_count = (image.command_count + rspq_sys::COMMANDS_PER_OVERLAY - 1) / rspq_sys::COMMANDS_PER_OVERLAY;
		let slot_count = slot_count.max(1);

		let id = match fixed_id {
			Some(id) => {
				let range = id as usize..(id as usize + slot_count as usize);
				if range.end > self.slots.len() || self.slots[range.clone()].iter().any(Option::is_some) {
					log::warn!("overlay registry: slot {} already occupied or out of range", id);
					return Err(QueueError::OverlaySlotOccupied { id });
				}
				id
			}
			None => self.find_free_run(slot_count).ok_or_else(|| {
				log::warn!("overlay registry: no run of {} consecutive free slots", slot_count);
				QueueError::OverlayFull
			})?,
		};

		for slot in &mut self.slots[id as usize..id as usize + slot_count as usize] {
			*slot = Some(OverlayDescriptor { id, slot_count });
		}

		self.patch_command_base(image, id);

		// The table update itself DMAs lazily into the consumer's
		// scratchpad; the exact layout of that table is consumer-side
		// and out of scope (spec.md §1), so we only request the copy.
		transport.dma(image.data.as_ptr() as usize as u32, CommandKey::command_base(id), image.data.len() as u32, true);

		log::debug!("overlay registry: registered overlay {} across {} slot(s)", id, slot_count);
		Ok(id)
	}

	pub fn unregister(&mut self, id: u8, transport: &dyn Transport) -> Result<(), QueueError> {
		let descriptor = self.slots.get(id as usize).copied().flatten().ok_or(QueueError::OverlayNotRegistered { id })?;
		for slot in &mut self.slots[descriptor.id as usize..descriptor.id as usize + descriptor.slot_count as usize] {
			*slot = None;
		}
		transport.dma(0, CommandKey::command_base(id), 0, true);
		log::debug!("overlay registry: unregistered overlay {}", id);
		Ok(())
	}

	pub fn command_base(&self, id: u8) -> u32 {
		CommandKey::command_base(id)
	}

	fn validate(&self, image: &OverlayImage<'_>) -> Result<(), QueueError> {
		if image.header.signature != OVERLAY_ABI_SIGNATURE {
			log::error!("overlay registry: header signature {:#x} does not match runtime ABI", image.header.signature);
			return Err(QueueError::OverlayAbiMismatch);
		}
		let state_end = image.header.state_start.checked_add(image.header.state_size);
		if state_end.map_or(true, |end| end as usize > image.data.len()) {
			log::error!("overlay registry: saved-state region falls outside the overlay's data image");
			return Err(QueueError::OverlayStateOutOfBounds);
		}
		Ok(())
	}

	fn patch_command_base(&self, image: &mut OverlayImage<'_>, id: u8) {
		let offset = image.header.command_base_offset as usize;
		let base = CommandKey::command_base(id);
		debug_assert!(offset + 4 <= image.data.len(), "command_base_offset validated before this point");
		image.data[offset..offset + 4].copy_from_slice(&base.to_le_bytes());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sim::SimTransport;

	fn image(data: &mut [u8], command_count: u32) -> OverlayImage<'_> {
		OverlayImage {
			header: OverlayHeader {
				signature: OVERLAY_ABI_SIGNATURE,
				command_base_offset: 0,
				state_start: 4,
				state_size: data.len() as u32 - 4,
			},
			code: &[],
			data,
			command_count,
		}
	}

	#[test]
	fn register_patches_command_base_into_data_image() {
		let mut registry = OverlayRegistry::new(16);
		let transport = SimTransport::new();
		let mut data = [0u8; 16];
		let mut img = image(&mut data, 4);

		let id = registry.register(&mut img, None, &transport).unwrap();
		assert_eq!(id, 0);
		assert_eq!(u32::from_le_bytes(data[0..4].try_into().unwrap()), CommandKey::command_base(0));
		assert_eq!(transport.dmas(), 1);
	}

	#[test]
	fn rejects_signature_mismatch() {
		let mut registry = OverlayRegistry::new(16);
		let transport = SimTransport::new();
		let mut data = [0u8; 16];
		let mut img = image(&mut data, 1);
		img.header.signature = 0xdead_beef;

		assert!(matches!(registry.register(&mut img, None, &transport), Err(QueueError::OverlayAbiMismatch)));
	}

	#[test]
	fn fixed_id_collision_is_reported() {
		let mut registry = OverlayRegistry::new(16);
		let transport = SimTransport::new();
		let mut data_a = [0u8; 16];
		let mut img_a = image(&mut data_a, 1);
		registry.register(&mut img_a, Some(2), &transport).unwrap();

		let mut data_b = [0u8; 16];
		let mut img_b = image(&mut data_b, 1);
		assert!(matches!(registry.register(&mut img_b, Some(2), &transport), Err(QueueError::OverlaySlotOccupied { id: 2 })));
	}

	#[test]
	fn unregister_frees_slots_for_reuse() {
		let mut registry = OverlayRegistry::new(16);
		let transport = SimTransport::new();
		let mut data = [0u8; 16];
		let mut img = image(&mut data, 16 * 3);
		let id = registry.register(&mut img, None, &transport).unwrap();
		registry.unregister(id, &transport).unwrap();

		let mut data2 = [0u8; 16];
		let mut img2 = image(&mut data2, 16 * 3);
		assert_eq!(registry.register(&mut img2, None, &transport).unwrap(), id);
	}
}
