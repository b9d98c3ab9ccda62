//! Buffer management for vertex data and uniforms
//!
//! A [`Buffer`] is one device allocation holding `instance_count` instances of
//! `instance_size` bytes, each starting on a multiple of `alignment_size`. That
//! is how a single uniform buffer backs one UBO per frame slot: instance `i`
//! lives at byte offset `i * alignment_size`.
//!
//! Host access goes through an explicit mapping. Writes and reads on an
//! unmapped buffer return [`VulkanError::NotMapped`]; [`MappedScope`] unmaps on
//! every exit path.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use super::arena::BufferKey;
use super::device::Device;
use super::error::{VulkanError, VulkanResult};

/// Round `instance_size` up to a multiple of `min_offset_alignment`
///
/// An alignment of 0 means no constraint. Non-zero alignments must be powers of
/// two, which every device reports.
pub fn alignment(instance_size: vk::DeviceSize, min_offset_alignment: vk::DeviceSize) -> vk::DeviceSize {
    if min_offset_alignment == 0 {
        return instance_size;
    }
    assert!(
        min_offset_alignment.is_power_of_two(),
        "minimum offset alignment {min_offset_alignment} is not a power of two"
    );
    (instance_size + min_offset_alignment - 1) & !(min_offset_alignment - 1)
}

/// End of `offset..offset + len`, or `OutOfBounds` when it passes `capacity`
fn checked_end(offset: vk::DeviceSize, len: vk::DeviceSize, capacity: vk::DeviceSize) -> VulkanResult<vk::DeviceSize> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(end),
        _ => Err(VulkanError::OutOfBounds {
            offset,
            size: len,
            capacity,
        }),
    }
}

fn round_down(value: vk::DeviceSize, atom: vk::DeviceSize) -> vk::DeviceSize {
    value / atom * atom
}

fn round_up(value: vk::DeviceSize, atom: vk::DeviceSize) -> vk::DeviceSize {
    value.div_ceil(atom) * atom
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    /// Host address of `offset`
    ptr: NonNull<u8>,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    /// Known end of the range mapped on the device
    device_end: vk::DeviceSize,
    /// The device mapping runs to the end of the memory object
    to_memory_end: bool,
}

/// Buffer wrapper with memory management
pub struct Buffer {
    device: Arc<Device>,
    key: BufferKey,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapping: Option<Mapping>,
    buffer_size: vk::DeviceSize,
    instance_count: u32,
    instance_size: vk::DeviceSize,
    alignment_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
}

impl Buffer {
    /// Create a buffer of `instance_count` aligned instances
    pub fn new(
        device: &Arc<Device>,
        instance_size: vk::DeviceSize,
        instance_count: u32,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        min_offset_alignment: vk::DeviceSize,
    ) -> VulkanResult<Self> {
        if instance_size == 0 || instance_count == 0 {
            return Err(VulkanError::invalid("buffer with zero instance size or count"));
        }
        let alignment_size = alignment(instance_size, min_offset_alignment);
        let buffer_size = alignment_size * vk::DeviceSize::from(instance_count);
        let allocated = device.create_buffer(buffer_size, usage, memory_properties)?;

        Ok(Self {
            device: Arc::clone(device),
            key: allocated.key,
            buffer: allocated.buffer,
            memory: allocated.memory,
            mapping: None,
            buffer_size,
            instance_count,
            instance_size,
            alignment_size,
            usage,
            memory_flags: allocated.memory_flags,
        })
    }

    /// Host-visible staging buffer holding a copy of `data`
    pub fn staging_with_data(device: &Arc<Device>, data: &[u8]) -> VulkanResult<Self> {
        let mut staging = Self::new(
            device,
            data.len() as vk::DeviceSize,
            1,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            0,
        )?;
        {
            let mut mapped = staging.mapped_scope()?;
            mapped.write_to_buffer(data, 0)?;
        }
        Ok(staging)
    }

    /// Map the whole buffer
    pub fn map(&mut self) -> VulkanResult<()> {
        self.map_range(vk::WHOLE_SIZE, 0)
    }

    /// Map `size` bytes starting at `offset`
    pub fn map_range(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        if self.mapping.is_some() {
            return Err(VulkanError::invalid("buffer is already mapped"));
        }
        let size = if size == vk::WHOLE_SIZE {
            self.buffer_size.saturating_sub(offset)
        } else {
            size
        };
        let end = checked_end(offset, size, self.buffer_size)?;

        // Non-coherent mappings cover whole atoms so every flush range inside
        // them can be widened to atom boundaries.
        let atom = self.non_coherent_atom();
        let (device_offset, device_size, device_end, to_memory_end) = if self.is_coherent() {
            (offset, size, end, false)
        } else {
            let start = round_down(offset, atom);
            let atom_end = round_up(end, atom);
            if atom_end <= self.buffer_size {
                (start, atom_end - start, atom_end, false)
            } else {
                (start, vk::WHOLE_SIZE, self.buffer_size, true)
            }
        };

        let base = self.device.map_buffer(self.key, device_offset, device_size)?;
        let base = NonNull::new(base).ok_or(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        // `offset - device_offset` is less than one atom and inside the mapping.
        let ptr = unsafe { base.as_ptr().add((offset - device_offset) as usize) };
        let ptr = NonNull::new(ptr).ok_or(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        self.mapping = Some(Mapping {
            ptr,
            offset,
            size,
            device_end,
            to_memory_end,
        });
        Ok(())
    }

    /// Unmap; a no-op when not mapped
    pub fn unmap(&mut self) {
        if self.mapping.take().is_some() {
            self.device.unmap_buffer(self.key);
        }
    }

    /// Whether the buffer currently has a host mapping
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Map the whole buffer until the returned guard drops
    pub fn mapped_scope(&mut self) -> VulkanResult<MappedScope<'_>> {
        self.map()?;
        Ok(MappedScope { buffer: self })
    }

    fn mapped_range(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> VulkanResult<NonNull<u8>> {
        let mapping = self.mapping.ok_or(VulkanError::NotMapped)?;
        checked_end(offset, len, mapping.size)?;
        // In bounds of the mapping checked above.
        let ptr = unsafe { mapping.ptr.as_ptr().add(offset as usize) };
        NonNull::new(ptr).ok_or(VulkanError::NotMapped)
    }

    /// Copy `data` into the mapping at `offset` (relative to the mapped range)
    pub fn write_to_buffer(&mut self, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        let dst = self.mapped_range(offset, data.len() as vk::DeviceSize)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of the mapping at `offset`
    pub fn read_from_buffer(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<Vec<u8>> {
        let src = self.mapped_range(offset, len as vk::DeviceSize)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Make host writes visible to the device; a no-op on coherent memory
    ///
    /// `offset` is relative to the mapped range and `size` may be
    /// `vk::WHOLE_SIZE`. The range handed to the device is widened to
    /// `non_coherent_atom_size` boundaries.
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        let Some((offset, size)) = self.atom_range(size, offset)? else {
            return Ok(());
        };
        self.device
            .raw()
            .flush_memory(self.memory, offset, size)
            .map_err(VulkanError::from)
    }

    /// Make device writes visible to the host; a no-op on coherent memory
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        let Some((offset, size)) = self.atom_range(size, offset)? else {
            return Ok(());
        };
        self.device
            .raw()
            .invalidate_memory(self.memory, offset, size)
            .map_err(VulkanError::from)
    }

    fn non_coherent_atom(&self) -> vk::DeviceSize {
        self.device.limits().non_coherent_atom_size.max(1)
    }

    /// Memory range to flush or invalidate, `None` on coherent memory
    fn atom_range(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<Option<(vk::DeviceSize, vk::DeviceSize)>> {
        let mapping = self.mapping.ok_or(VulkanError::NotMapped)?;
        let size = if size == vk::WHOLE_SIZE {
            mapping.size.saturating_sub(offset)
        } else {
            size
        };
        let end = checked_end(offset, size, mapping.size)?;
        if self.is_coherent() {
            return Ok(None);
        }

        let atom = self.non_coherent_atom();
        let start = round_down(mapping.offset + offset, atom);
        let atom_end = round_up(mapping.offset + end, atom);
        if atom_end <= mapping.device_end {
            Ok(Some((start, atom_end - start)))
        } else if mapping.to_memory_end {
            Ok(Some((start, vk::WHOLE_SIZE)))
        } else {
            Ok(Some((start, mapping.device_end - start)))
        }
    }

    /// Descriptor covering `size` bytes at `offset`
    pub fn descriptor_info(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset,
            range: size,
        }
    }

    fn index_offset(&self, index: u32) -> VulkanResult<vk::DeviceSize> {
        if index >= self.instance_count {
            return Err(VulkanError::invalid(format!(
                "instance index {index} out of range for {} instances",
                self.instance_count
            )));
        }
        Ok(vk::DeviceSize::from(index) * self.alignment_size)
    }

    /// Write exactly one instance at `index * alignment_size`
    pub fn write_to_index(&mut self, data: &[u8], index: u32) -> VulkanResult<()> {
        if data.len() as vk::DeviceSize != self.instance_size {
            return Err(VulkanError::invalid(format!(
                "instance write of {} bytes, expected {}",
                data.len(),
                self.instance_size
            )));
        }
        let offset = self.index_offset(index)?;
        self.write_to_buffer(data, offset)
    }

    /// Write a plain-old-data value as instance `index`
    pub fn write_value<T: Pod>(&mut self, value: &T, index: u32) -> VulkanResult<()> {
        self.write_to_index(bytemuck::bytes_of(value), index)
    }

    /// Read instance `index` back from the mapping
    pub fn read_index(&self, index: u32) -> VulkanResult<Vec<u8>> {
        let offset = self.index_offset(index)?;
        self.read_from_buffer(offset, self.instance_size as usize)
    }

    /// Flush instance `index`
    pub fn flush_index(&self, index: u32) -> VulkanResult<()> {
        let offset = self.index_offset(index)?;
        self.flush(self.alignment_size, offset)
    }

    /// Invalidate instance `index`
    pub fn invalidate_index(&self, index: u32) -> VulkanResult<()> {
        let offset = self.index_offset(index)?;
        self.invalidate(self.alignment_size, offset)
    }

    /// Descriptor covering instance `index`
    pub fn descriptor_info_for_index(&self, index: u32) -> vk::DescriptorBufferInfo {
        self.descriptor_info(
            self.alignment_size,
            vk::DeviceSize::from(index) * self.alignment_size,
        )
    }

    /// Whether the chosen memory type is host coherent
    pub fn is_coherent(&self) -> bool {
        self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Total size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer_size
    }

    /// Number of instances
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Unpadded instance size
    pub fn instance_size(&self) -> vk::DeviceSize {
        self.instance_size
    }

    /// Stride between instances
    pub fn alignment_size(&self) -> vk::DeviceSize {
        self.alignment_size
    }

    /// Usage flags
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Memory property flags of the chosen type
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.unmap();
        self.device.destroy_buffer(self.key);
    }
}

/// Guard keeping a [`Buffer`] mapped for its lifetime
pub struct MappedScope<'a> {
    buffer: &'a mut Buffer,
}

impl Deref for MappedScope<'_> {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.buffer
    }
}

impl DerefMut for MappedScope<'_> {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer
    }
}

impl Drop for MappedScope<'_> {
    fn drop(&mut self) {
        self.buffer.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::headless::{HeadlessDevice, HeadlessEvent};

    fn device() -> (Arc<Device>, HeadlessDevice) {
        let headless = HeadlessDevice::new();
        (Device::new(Box::new(headless.clone())), headless)
    }

    fn host_buffer(device: &Arc<Device>, instance_size: vk::DeviceSize, count: u32, flags: vk::MemoryPropertyFlags) -> Buffer {
        Buffer::new(device, instance_size, count, vk::BufferUsageFlags::UNIFORM_BUFFER, flags, 256).unwrap()
    }

    #[test]
    fn test_alignment_examples() {
        assert_eq!(alignment(64, 256), 256);
        assert_eq!(alignment(300, 256), 512);
        assert_eq!(alignment(256, 256), 256);
        assert_eq!(alignment(100, 0), 100);
        assert_eq!(alignment(7, 1), 7);
    }

    #[test]
    fn test_alignment_invariant() {
        for min_alignment in [1u64, 2, 4, 16, 64, 256, 1024] {
            for instance_size in 1..=2048u64 {
                let aligned = alignment(instance_size, min_alignment);
                assert!(aligned >= instance_size);
                assert_eq!(aligned % min_alignment, 0);
                assert!(aligned - instance_size < min_alignment);
            }
        }
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn test_alignment_rejects_non_power_of_two() {
        alignment(64, 48);
    }

    #[test]
    fn test_size_is_alignment_times_count() {
        let (device, _) = device();
        let buffer = host_buffer(&device, 100, 3, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(buffer.alignment_size(), 256);
        assert_eq!(buffer.size(), 768);
        assert_eq!(buffer.descriptor_info_for_index(2).offset, 512);
        assert_eq!(buffer.descriptor_info_for_index(2).range, 256);
    }

    #[test]
    fn test_write_to_index_round_trip() {
        let (device, _) = device();
        let mut buffer = host_buffer(&device, 40, 4, vk::MemoryPropertyFlags::HOST_VISIBLE);
        buffer.map().unwrap();
        for i in 0..4u32 {
            let data: Vec<u8> = (0..40).map(|b| (b as u8).wrapping_mul(i as u8 + 3)).collect();
            buffer.write_to_index(&data, i).unwrap();
        }
        for i in 0..4u32 {
            let expected: Vec<u8> = (0..40).map(|b| (b as u8).wrapping_mul(i as u8 + 3)).collect();
            assert_eq!(buffer.read_index(i).unwrap(), expected);
            let raw = buffer
                .read_from_buffer(u64::from(i) * buffer.alignment_size(), 40)
                .unwrap();
            assert_eq!(raw, expected);
        }
    }

    #[test]
    fn test_write_requires_mapping() {
        let (device, _) = device();
        let mut buffer = host_buffer(&device, 16, 1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(buffer.write_to_index(&[0; 16], 0), Err(VulkanError::NotMapped)));
        assert!(matches!(buffer.flush_index(0), Err(VulkanError::NotMapped)));

        buffer.map().unwrap();
        assert!(matches!(buffer.map(), Err(VulkanError::InvalidOperation { .. })));
        buffer.unmap();
        assert!(matches!(buffer.read_index(0), Err(VulkanError::NotMapped)));
    }

    #[test]
    fn test_write_rejects_bad_sizes_and_indices() {
        let (device, _) = device();
        let mut buffer = host_buffer(&device, 16, 2, vk::MemoryPropertyFlags::HOST_VISIBLE);
        buffer.map().unwrap();
        assert!(buffer.write_to_index(&[0; 8], 0).is_err());
        assert!(buffer.write_to_index(&[0; 16], 2).is_err());
        assert!(matches!(
            buffer.write_to_buffer(&[0; 16], 500),
            Err(VulkanError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_mapped_scope_unmaps_on_error_path() {
        let (device, headless) = device();
        let mut buffer = host_buffer(&device, 16, 1, vk::MemoryPropertyFlags::HOST_VISIBLE);

        let result: VulkanResult<()> = (|| {
            let mut mapped = buffer.mapped_scope()?;
            mapped.write_to_index(&[1; 16], 0)?;
            mapped.write_to_index(&[1; 4], 0)?;
            Ok(())
        })();
        assert!(result.is_err());
        assert!(!buffer.is_mapped());

        buffer.map().unwrap();
        assert_eq!(buffer.read_index(0).unwrap(), vec![1; 16]);
        assert!(headless.validation_errors().is_empty());
    }

    #[test]
    fn test_flush_skips_coherent_memory() {
        let (device, headless) = device();
        let mut coherent = host_buffer(
            &device,
            16,
            2,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        coherent.map().unwrap();
        coherent.flush_index(1).unwrap();
        assert!(coherent.is_coherent());

        let mut cached = host_buffer(
            &device,
            16,
            2,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        );
        cached.map().unwrap();
        cached.flush_index(1).unwrap();
        cached.invalidate_index(1).unwrap();

        let flushes: Vec<_> = headless
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::FlushMemory { offset, size, .. } => Some((offset, size)),
                _ => None,
            })
            .collect();
        assert_eq!(flushes, vec![(256, 256)]);
    }

    fn memory_ranges(headless: &HeadlessDevice) -> (Vec<(u64, u64)>, Vec<(u64, u64)>) {
        let mut flushes = Vec::new();
        let mut invalidates = Vec::new();
        for event in headless.events() {
            match event {
                HeadlessEvent::FlushMemory { offset, size, .. } => flushes.push((offset, size)),
                HeadlessEvent::InvalidateMemory { offset, size, .. } => invalidates.push((offset, size)),
                _ => {}
            }
        }
        (flushes, invalidates)
    }

    #[test]
    fn test_flush_widens_to_atom_boundaries() {
        let (device, headless) = device();
        assert_eq!(device.limits().non_coherent_atom_size, 64);
        // 112-byte stride: instance 1 starts mid-atom and ends at the buffer end
        let mut buffer = Buffer::new(
            &device,
            100,
            2,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
            16,
        )
        .unwrap();
        assert!(!buffer.is_coherent());
        assert_eq!(buffer.size(), 224);

        buffer.map().unwrap();
        buffer.write_to_index(&[3; 100], 1).unwrap();
        buffer.flush_index(0).unwrap();
        buffer.flush_index(1).unwrap();
        buffer.invalidate_index(1).unwrap();
        assert_eq!(buffer.read_index(1).unwrap(), vec![3; 100]);

        let (flushes, invalidates) = memory_ranges(&headless);
        assert_eq!(flushes, vec![(0, 128), (64, vk::WHOLE_SIZE)]);
        assert_eq!(invalidates, vec![(64, vk::WHOLE_SIZE)]);
        assert!(headless.validation_errors().is_empty(), "{:?}", headless.validation_errors());
    }

    #[test]
    fn test_partial_mapping_of_non_coherent_memory() {
        let (device, headless) = device();
        let mut buffer = Buffer::new(
            &device,
            224,
            1,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
            0,
        )
        .unwrap();

        buffer.map_range(50, 70).unwrap();
        buffer.write_to_buffer(&[7; 50], 0).unwrap();
        assert!(matches!(
            buffer.write_to_buffer(&[7; 8], 46),
            Err(VulkanError::OutOfBounds { .. })
        ));
        buffer.flush(vk::WHOLE_SIZE, 0).unwrap();
        buffer.unmap();

        buffer.map().unwrap();
        assert_eq!(buffer.read_from_buffer(70, 50).unwrap(), vec![7; 50]);
        assert_eq!(buffer.read_from_buffer(64, 6).unwrap(), vec![0; 6]);

        let (flushes, _) = memory_ranges(&headless);
        assert_eq!(flushes, vec![(64, 64)]);
        assert!(headless.validation_errors().is_empty(), "{:?}", headless.validation_errors());
    }

    #[test]
    fn test_huge_offsets_are_out_of_bounds() {
        let (device, _) = device();
        let mut buffer = host_buffer(&device, 16, 1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(
            buffer.map_range(16, u64::MAX - 7),
            Err(VulkanError::OutOfBounds { .. })
        ));
        assert!(!buffer.is_mapped());

        buffer.map().unwrap();
        assert!(matches!(
            buffer.write_to_buffer(&[0xAB; 16], u64::MAX - 7),
            Err(VulkanError::OutOfBounds { .. })
        ));
        assert!(matches!(
            buffer.read_from_buffer(u64::MAX - 7, 16),
            Err(VulkanError::OutOfBounds { .. })
        ));
        assert!(matches!(
            buffer.flush(16, u64::MAX - 7),
            Err(VulkanError::OutOfBounds { .. })
        ));
        assert_eq!(buffer.read_index(0).unwrap(), vec![0; 16]);
    }

    #[test]
    fn test_drop_releases_arena_entry() {
        let (device, headless) = device();
        {
            let mut buffer = host_buffer(&device, 16, 1, vk::MemoryPropertyFlags::HOST_VISIBLE);
            buffer.map().unwrap();
            assert_eq!(device.arena_stats().buffers, 1);
        }
        assert_eq!(device.arena_stats().buffers, 0);
        assert_eq!(headless.live_object_count(), 0);
        assert!(headless.validation_errors().is_empty());
    }
}
