//! Descriptor set layouts, pools and writes.

use ash::vk;

use crate::error::Result;

/// Accumulates bindings for one descriptor set layout.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding of `count` descriptors.
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Storage image read and written by shaders in `GENERAL` layout.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    pub fn combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    /// Pool sizes able to hold `max_sets` sets of this layout, one entry per
    /// descriptor type.
    pub fn pool_sizes(&self, max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.descriptor_count * max_sets;
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: count,
                }),
            }
        }
        sizes
    }

    /// Create the layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };
        Ok(layout)
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };
        Ok(Self { pool })
    }

    /// Pool sized for `max_sets` sets of the builder's layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn for_layout(
        device: &ash::Device,
        builder: &DescriptorSetLayoutBuilder,
        max_sets: u32,
    ) -> Result<Self> {
        unsafe { Self::new(device, max_sets, &builder.pool_sizes(max_sets)) }
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one set per layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info)? };
        Ok(sets)
    }

    /// Reset the pool, freeing all descriptor sets.
    ///
    /// # Safety
    /// No set from the pool may be in use.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())?;
        }
        Ok(())
    }

    /// # Safety
    /// The pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
    }
}

unsafe fn write_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    descriptor_type: vk::DescriptorType,
    buffer: vk::Buffer,
    range: u64,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(0)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(descriptor_type)
        .buffer_info(std::slice::from_ref(&buffer_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Point `binding` at `range` bytes of a uniform buffer.
///
/// # Safety
/// Device, set and buffer must be valid.
pub unsafe fn write_uniform_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    range: u64,
) {
    unsafe {
        write_buffer(
            device,
            dst_set,
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
            buffer,
            range,
        );
    }
}

/// Point `binding` at `range` bytes of a storage buffer.
///
/// # Safety
/// Device, set and buffer must be valid.
pub unsafe fn write_storage_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    range: u64,
) {
    unsafe {
        write_buffer(
            device,
            dst_set,
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
            buffer,
            range,
        );
    }
}

/// Point `binding` at a sampled view in `SHADER_READ_ONLY_OPTIMAL`.
///
/// # Safety
/// Device, set, view and sampler must be valid.
pub unsafe fn write_combined_image_sampler(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(view)
        .sampler(sampler)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(std::slice::from_ref(&image_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Point `binding` at a storage view that shaders access in `GENERAL` layout.
///
/// # Safety
/// Device, set and view must be valid.
pub unsafe fn write_storage_image(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(view)
        .image_layout(vk::ImageLayout::GENERAL);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .image_info(std::slice::from_ref(&image_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_merge_by_type() {
        let builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
            .uniform_buffer(2, vk::ShaderStageFlags::FRAGMENT)
            .add_binding(
                3,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                4,
                vk::ShaderStageFlags::FRAGMENT,
            );

        let sizes = builder.pool_sizes(10);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 20);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 50);
    }

    #[test]
    fn bindings_keep_insertion_order() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_buffer(4, vk::ShaderStageFlags::COMPUTE)
            .uniform_buffer(1, vk::ShaderStageFlags::COMPUTE);
        let bindings: Vec<_> = builder.bindings().iter().map(|b| b.binding).collect();
        assert_eq!(bindings, vec![4, 1]);
    }

    #[test]
    fn storage_image_binding_is_single_descriptor() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::COMPUTE);
        let binding = builder.bindings()[0];
        assert_eq!(binding.descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::COMPUTE);

        let sizes = builder.pool_sizes(2);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].descriptor_count, 2);
    }
}
