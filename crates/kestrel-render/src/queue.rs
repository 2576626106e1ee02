//! Sort-keyed render queues.
//!
//! Draws are recorded once, then submitted with a depth or layer that
//! becomes part of a 64-bit key. [`RenderQueue::execute`] radix-sorts the
//! keys and replays each command, followed by any commands linked behind
//! it, into a [`DrawEncoder`].

use std::mem::size_of;
use std::ops::Range;

use kestrel_gpu::{Buffer, DrawCallPipeline, Handle, IndexType};

use crate::command::{
    DescriptorBind, DrawArrays, DrawEncoder, DrawIndexed, VertexBufferBinding, CAMERA_SET,
    LIGHT_SET, MATERIAL_SET, OBJECT_SET,
};
use crate::error::{RenderError, Result};
use crate::keys::{alpha_key, handle_bits, material_bits, opaque_key, overlay_key};
use crate::sort::{radix_sort, SortEntry};

/// Ordering policy of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderQueueType {
    /// State-sorted, then front to back.
    Opaque,
    /// Back to front, then state-sorted.
    AlphaBlending,
    /// Caller-supplied layer, then state-sorted.
    ScreenOverlay,
}

/// Byte budgets of a queue's two regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderQueueConfig {
    /// Sort keys plus the sort's scratch copy.
    pub key_bytes: usize,
    /// Recorded commands plus their vertex buffer bindings.
    pub command_bytes: usize,
}

impl Default for RenderQueueConfig {
    fn default() -> Self {
        Self {
            key_bytes: 1024 * 1024,
            command_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Identifies a command recorded into a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(u32);

/// View-wide bindings made whenever the shader program changes.
#[derive(Debug, Clone, Default)]
pub struct RenderView {
    pub camera: Option<DescriptorBind>,
    pub lights: Option<DescriptorBind>,
}

/// Region usage of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueUsage {
    pub key_bytes: usize,
    pub command_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
enum Draw {
    Arrays {
        first_vertex: u32,
        vertex_count: u32,
    },
    Indexed {
        index_buffer: Handle<Buffer>,
        index_type: IndexType,
        index_offset: u64,
        first_index: u32,
        index_count: u32,
        vertex_offset: i32,
    },
}

#[derive(Debug, Clone)]
struct RecordedCommand {
    pipeline: DrawCallPipeline,
    material: Option<DescriptorBind>,
    object: Option<DescriptorBind>,
    vertex_buffers: Range<usize>,
    draw: Draw,
    next: Option<CommandId>,
}

const ENTRY_BYTES: usize = size_of::<SortEntry>();
const COMMAND_BYTES: usize = size_of::<RecordedCommand>();
const BINDING_BYTES: usize = size_of::<VertexBufferBinding>();

/// A queue of draw commands executed in sort-key order.
pub struct RenderQueue {
    kind: RenderQueueType,
    config: RenderQueueConfig,
    entries: Vec<SortEntry>,
    scratch: Vec<SortEntry>,
    commands: Vec<RecordedCommand>,
    vertex_bindings: Vec<VertexBufferBinding>,
    sorted: bool,
}

impl RenderQueue {
    /// Create a queue with the default budgets.
    pub fn new(kind: RenderQueueType) -> Self {
        Self::with_config(kind, RenderQueueConfig::default())
    }

    /// Create a queue with explicit budgets.
    pub fn with_config(kind: RenderQueueType, config: RenderQueueConfig) -> Self {
        Self {
            kind,
            config,
            entries: Vec::new(),
            scratch: Vec::new(),
            commands: Vec::new(),
            vertex_bindings: Vec::new(),
            sorted: true,
        }
    }

    /// Ordering policy of this queue.
    pub fn kind(&self) -> RenderQueueType {
        self.kind
    }

    /// Record a non-indexed draw. It runs only once submitted or linked
    /// behind a submitted command.
    pub fn draw_arrays(&mut self, draw: DrawArrays<'_>) -> Result<CommandId> {
        self.record(
            draw.pipeline,
            draw.material,
            draw.object,
            draw.vertex_buffers,
            Draw::Arrays {
                first_vertex: draw.first_vertex,
                vertex_count: draw.vertex_count,
            },
        )
    }

    /// Record an indexed draw.
    pub fn draw_indexed(&mut self, draw: DrawIndexed<'_>) -> Result<CommandId> {
        self.record(
            draw.pipeline,
            draw.material,
            draw.object,
            draw.vertex_buffers,
            Draw::Indexed {
                index_buffer: draw.index_buffer,
                index_type: draw.index_type,
                index_offset: draw.index_offset,
                first_index: draw.first_index,
                index_count: draw.index_count,
                vertex_offset: draw.vertex_offset,
            },
        )
    }

    fn record(
        &mut self,
        pipeline: DrawCallPipeline,
        material: Option<DescriptorBind>,
        object: Option<DescriptorBind>,
        vertex_buffers: &[VertexBufferBinding],
        draw: Draw,
    ) -> Result<CommandId> {
        let needed = self.command_bytes() + COMMAND_BYTES + vertex_buffers.len() * BINDING_BYTES;
        if needed > self.config.command_bytes {
            return Err(RenderError::QueueFull {
                region: "command",
                capacity: self.config.command_bytes,
            });
        }

        let start = self.vertex_bindings.len();
        self.vertex_bindings.extend_from_slice(vertex_buffers);
        let id = CommandId(self.commands.len() as u32);
        self.commands.push(RecordedCommand {
            pipeline,
            material,
            object,
            vertex_buffers: start..self.vertex_bindings.len(),
            draw,
            next: None,
        });
        Ok(id)
    }

    /// Run `next` right after `first` whenever `first` executes. `next` is
    /// not sorted on its own unless it is also submitted.
    pub fn link(&mut self, first: CommandId, next: CommandId) -> Result<()> {
        self.command(next)?;
        if self.command(first)?.next.is_some() {
            return Err(RenderError::AlreadyLinked(first));
        }

        let mut cursor = Some(next);
        while let Some(id) = cursor {
            if id == first {
                return Err(RenderError::LinkCycle(first));
            }
            cursor = self.command(id)?.next;
        }

        if let Some(command) = self.commands.get_mut(first.0 as usize) {
            command.next = Some(next);
        }
        Ok(())
    }

    /// Submit a command to an opaque or alpha-blended queue at `depth`, its
    /// distance from the viewer.
    pub fn submit(&mut self, command: CommandId, depth: f32) -> Result<()> {
        let recorded = self.command(command)?;
        let shader = handle_bits(recorded.pipeline.program);
        let vertex_format = handle_bits(recorded.pipeline.vertex_layout);
        let material = material_bits(recorded.material.as_ref());
        let key = match self.kind {
            RenderQueueType::Opaque => opaque_key(shader, vertex_format, material, depth),
            RenderQueueType::AlphaBlending => alpha_key(shader, vertex_format, material, depth),
            RenderQueueType::ScreenOverlay => {
                return Err(RenderError::WrongQueueType(self.kind));
            }
        };
        self.push_key(key, command)
    }

    /// Submit a command to a screen overlay queue on `layer`. Higher layers
    /// draw later.
    pub fn submit_layer(&mut self, command: CommandId, layer: u16) -> Result<()> {
        if self.kind != RenderQueueType::ScreenOverlay {
            return Err(RenderError::WrongQueueType(self.kind));
        }
        let recorded = self.command(command)?;
        let shader = handle_bits(recorded.pipeline.program);
        let material = material_bits(recorded.material.as_ref());
        self.push_key(overlay_key(layer, shader, material), command)
    }

    fn push_key(&mut self, key: u64, command: CommandId) -> Result<()> {
        // The sort needs an equally sized scratch copy from the same region.
        if (self.entries.len() + 1) * ENTRY_BYTES * 2 > self.config.key_bytes {
            return Err(RenderError::QueueFull {
                region: "key",
                capacity: self.config.key_bytes,
            });
        }
        self.entries.push(SortEntry {
            key,
            command: command.0,
        });
        self.sorted = false;
        Ok(())
    }

    fn command(&self, id: CommandId) -> Result<&RecordedCommand> {
        self.commands
            .get(id.0 as usize)
            .ok_or(RenderError::UnknownCommand(id))
    }

    /// Sort the submitted keys and replay their commands into `encoder`.
    ///
    /// The queue keeps its contents, so it can be executed again until
    /// [`clear`](Self::clear) is called.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn execute(&mut self, encoder: &mut impl DrawEncoder, view: &RenderView) {
        if !self.sorted {
            radix_sort(&mut self.entries, &mut self.scratch);
            self.sorted = true;
        }

        let mut bound_program = None;
        let mut executed = 0usize;
        for entry in &self.entries {
            let mut cursor = Some(CommandId(entry.command));
            while let Some(id) = cursor {
                let Some(command) = self.commands.get(id.0 as usize) else {
                    break;
                };

                encoder.bind_draw_call_pipeline(&command.pipeline);
                if executed == 0 || command.pipeline.program != bound_program {
                    bound_program = command.pipeline.program;
                    if let Some(camera) = &view.camera {
                        encoder.bind(CAMERA_SET, camera);
                    }
                    if let Some(lights) = &view.lights {
                        encoder.bind(LIGHT_SET, lights);
                    }
                }
                self.replay(encoder, command);

                executed += 1;
                cursor = command.next;
            }
        }
        tracing::trace!(
            "Executed {} commands from {} keys ({:?})",
            executed,
            self.entries.len(),
            self.kind
        );
    }

    fn replay(&self, encoder: &mut impl DrawEncoder, command: &RecordedCommand) {
        if let Some(material) = &command.material {
            encoder.bind(MATERIAL_SET, material);
        }
        if let Some(object) = &command.object {
            encoder.bind(OBJECT_SET, object);
        }
        let buffers = &self.vertex_bindings[command.vertex_buffers.clone()];
        if !buffers.is_empty() {
            encoder.bind_vertex_buffers(0, buffers);
        }

        match command.draw {
            Draw::Arrays {
                first_vertex,
                vertex_count,
            } => encoder.draw(first_vertex, vertex_count),
            Draw::Indexed {
                index_buffer,
                index_type,
                index_offset,
                first_index,
                index_count,
                vertex_offset,
            } => {
                encoder.bind_index_buffer(index_buffer, index_offset, index_type);
                encoder.draw_indexed(first_index, index_count, vertex_offset);
            }
        }
    }

    /// Drop every key and command.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.commands.clear();
        self.vertex_bindings.clear();
        self.sorted = true;
    }

    /// Number of submitted keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was submitted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of recorded commands, submitted or not.
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    fn command_bytes(&self) -> usize {
        self.commands.len() * COMMAND_BYTES + self.vertex_bindings.len() * BINDING_BYTES
    }

    /// Bytes used in each region.
    pub fn usage(&self) -> QueueUsage {
        QueueUsage {
            key_bytes: self.entries.len() * ENTRY_BYTES * 2,
            command_bytes: self.command_bytes(),
        }
    }
}
