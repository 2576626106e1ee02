//! Frame-delayed destruction of device objects.
//!
//! Released and garbage-collected objects may still be referenced by work
//! the GPU has not finished. They wait in a [`ReleaseQueue`] until enough
//! frames have retired:
//! - `process` runs after the frame fence wait and destroys items older
//!   than the frames-in-flight window
//! - `drain_all` runs at shutdown, after the device went idle, newest first

use std::collections::VecDeque;

use ash::vk;

use crate::descriptor_pool::DescriptorPoolChain;
use crate::memory::{MemoryAllocation, MemoryPool};
use crate::resources::{Buffer, ShaderProgram, Texture};

struct Pending<T> {
    item: T,
    frame_queued: u64,
}

/// FIFO of items waiting for the frames that may use them to retire.
pub struct ReleaseQueue<T> {
    pending: VecDeque<Pending<T>>,
    frames_in_flight: u64,
}

impl<T> ReleaseQueue<T> {
    /// Create a queue that holds items for `frames_in_flight` frames.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight: frames_in_flight as u64,
        }
    }

    /// Queue `item`, released during frame `frame_count`.
    pub fn push(&mut self, item: T, frame_count: u64) {
        self.pending.push_back(Pending {
            item,
            frame_queued: frame_count,
        });
    }

    /// Hand every item that no in-flight frame can reference to `destroy`.
    ///
    /// An item queued in frame `F` matures once frame
    /// `F + frames_in_flight` starts, since every frame up to `F` has then
    /// signaled its fence.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn process(&mut self, frame_count: u64, mut destroy: impl FnMut(T)) -> usize {
        let mut destroyed = 0;
        while let Some(front) = self.pending.front() {
            if front.frame_queued + self.frames_in_flight > frame_count {
                break;
            }
            if let Some(pending) = self.pending.pop_front() {
                destroy(pending.item);
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Remove everything, newest first.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.pending.drain(..).rev().map(|p| p.item).collect()
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Back-end objects detached from their handle table, awaiting destruction.
#[derive(Debug)]
pub enum ReleasedObject {
    Buffer {
        buffer: vk::Buffer,
        allocation: MemoryAllocation,
    },
    Texture {
        image: vk::Image,
        view: vk::ImageView,
        sampler: vk::Sampler,
        allocation: Option<MemoryAllocation>,
    },
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Pipeline(vk::Pipeline),
    ShaderModule(vk::ShaderModule),
    ShaderProgram {
        set_layouts: Vec<vk::DescriptorSetLayout>,
        pipeline_layout: vk::PipelineLayout,
    },
    DescriptorSet {
        link: u64,
    },
}

impl ReleasedObject {
    /// Destroy the back-end objects and return their memory.
    ///
    /// Swapchain textures own only their view; their image belongs to the
    /// swapchain.
    ///
    /// # Safety
    /// No pending GPU work may reference the object.
    pub unsafe fn destroy(
        self,
        device: &ash::Device,
        memory: &mut MemoryPool,
        descriptors: &mut DescriptorPoolChain,
    ) {
        match self {
            Self::Buffer { buffer, allocation } => {
                device.destroy_buffer(buffer, None);
                memory.free(&allocation);
            }
            Self::Texture {
                image,
                view,
                sampler,
                allocation,
            } => {
                if sampler != vk::Sampler::null() {
                    device.destroy_sampler(sampler, None);
                }
                device.destroy_image_view(view, None);
                if let Some(allocation) = allocation {
                    device.destroy_image(image, None);
                    memory.free(&allocation);
                }
            }
            Self::RenderPass(render_pass) => device.destroy_render_pass(render_pass, None),
            Self::Framebuffer(framebuffer) => device.destroy_framebuffer(framebuffer, None),
            Self::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
            Self::ShaderModule(module) => device.destroy_shader_module(module, None),
            Self::ShaderProgram {
                set_layouts,
                pipeline_layout,
            } => {
                device.destroy_pipeline_layout(pipeline_layout, None);
                for layout in set_layouts {
                    device.destroy_descriptor_set_layout(layout, None);
                }
            }
            Self::DescriptorSet { link } => {
                if let Some(pool) = descriptors.release(link) {
                    device.destroy_descriptor_pool(pool, None);
                }
            }
        }
    }
}

impl From<Buffer> for ReleasedObject {
    fn from(buffer: Buffer) -> Self {
        Self::Buffer {
            buffer: buffer.handle,
            allocation: buffer.allocation,
        }
    }
}

impl From<Texture> for ReleasedObject {
    fn from(texture: Texture) -> Self {
        Self::Texture {
            image: texture.image,
            view: texture.view,
            sampler: texture.sampler,
            allocation: texture.allocation,
        }
    }
}

impl From<ShaderProgram> for ReleasedObject {
    fn from(program: ShaderProgram) -> Self {
        Self::ShaderProgram {
            set_layouts: program.set_layouts,
            pipeline_layout: program.pipeline_layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_wait_for_the_in_flight_window() {
        let mut queue = ReleaseQueue::new(2);
        queue.push("a", 5);
        queue.push("b", 6);

        let mut destroyed = Vec::new();
        assert_eq!(queue.process(6, |item| destroyed.push(item)), 0);
        assert_eq!(queue.process(7, |item| destroyed.push(item)), 1);
        assert_eq!(destroyed, vec!["a"]);
        assert_eq!(queue.process(8, |item| destroyed.push(item)), 1);
        assert_eq!(destroyed, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn process_stops_at_the_first_young_item() {
        let mut queue = ReleaseQueue::new(1);
        queue.push(1, 10);
        queue.push(2, 20);
        queue.push(3, 11);

        let mut destroyed = Vec::new();
        queue.process(15, |item| destroyed.push(item));
        assert_eq!(destroyed, vec![1]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drain_all_is_newest_first() {
        let mut queue = ReleaseQueue::new(3);
        for (item, frame) in [("x", 0), ("y", 1), ("z", 1)] {
            queue.push(item, frame);
        }
        assert_eq!(queue.drain_all(), vec!["z", "y", "x"]);
        assert!(queue.is_empty());
    }
}
