//! Window, device and scenario bookkeeping.

use anyhow::bail;
use kestrel_gpu::{CacheStats, DeviceConfig, GpuDevice, GpuDeviceBuilder, Handle, WindowSurface};
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

use crate::scene::TriangleScene;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
/// Frame after which the resize scenario changes the window size.
const RESIZE_AT_FRAME: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scenario {
    #[default]
    Triangle,
    CacheReuse,
    Resize,
}

#[derive(Debug, Clone, Default)]
pub struct ViewerOptions {
    pub scenario: Scenario,
    pub frames: Option<u64>,
    pub vsync: bool,
}

impl ViewerOptions {
    fn frame_limit(&self) -> Option<u64> {
        self.frames.or(match self.scenario {
            Scenario::Triangle => None,
            Scenario::CacheReuse | Scenario::Resize => Some(10),
        })
    }
}

/// Frame-by-frame observations checked when the viewer exits.
#[derive(Debug, Default)]
struct Observations {
    first_frame: Option<CacheStats>,
    last_frame: Option<CacheStats>,
    image_count: usize,
    skipped_frames: u64,
    rendered_after_resize: u64,
    resized: bool,
}

struct ViewerState {
    // Dropped before the window, which must outlive the surface.
    device: GpuDevice,
    surface: Handle<WindowSurface>,
    scene: Option<TriangleScene>,
    window: Window,
    rendered: u64,
    seen: Observations,
}

pub struct ViewerApp {
    options: ViewerOptions,
    state: Option<ViewerState>,
    failure: Option<anyhow::Error>,
    observations: Option<Observations>,
}

impl ViewerApp {
    pub fn new(options: ViewerOptions) -> Self {
        Self {
            options,
            state: None,
            failure: None,
            observations: None,
        }
    }

    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<ViewerState> {
        let attributes = Window::default_attributes()
            .with_title("Kestrel Viewer")
            .with_inner_size(PhysicalSize::new(WIDTH, HEIGHT));
        let window = event_loop.create_window(attributes)?;
        let size = window.inner_size();

        let config = DeviceConfig {
            vsync: self.options.vsync,
            ..DeviceConfig::default()
        };
        let (mut device, surface) = GpuDeviceBuilder::new()
            .app_name("Kestrel Viewer")
            .config(config)
            .build_with_window(&window, size.width, size.height)?;
        info!("GPU: {}", device.adapter().summary());

        let scene = TriangleScene::new(&mut device)?;
        Ok(ViewerState {
            device,
            surface,
            scene: Some(scene),
            window,
            rendered: 0,
            seen: Observations::default(),
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.failure.get_or_insert(err);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            if let Some(scene) = state.scene.take() {
                if let Err(err) = scene.release(&mut state.device) {
                    warn!("Releasing scene failed: {err:#}");
                }
            }
            self.observations = Some(std::mem::take(&mut state.seen));
        }
        event_loop.exit();
    }

    /// Check what the scenario observed. Called after the event loop ends.
    pub fn finish(mut self) -> anyhow::Result<()> {
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        let Some(seen) = self.observations.take() else {
            return Ok(());
        };
        check_scenario(self.options.scenario, &seen)
    }
}

fn check_scenario(scenario: Scenario, seen: &Observations) -> anyhow::Result<()> {
    let Some(first) = seen.first_frame else {
        bail!("no frame was rendered");
    };
    if (first.render_passes, first.framebuffers, first.pipelines, first.descriptor_sets) != (1, 1, 1, 0) {
        bail!("first frame created {first:?}, expected one pass, framebuffer and pipeline");
    }

    match scenario {
        Scenario::Triangle => {}
        Scenario::CacheReuse => {
            let Some(last) = seen.last_frame else {
                bail!("no frame was rendered");
            };
            // Every swapchain image has its own framebuffer.
            let framebuffer_limit = seen.image_count.max(1);
            if last.pipeline_creations != first.pipeline_creations
                || last.render_passes != 1
                || last.pipelines != 1
                || last.framebuffers > framebuffer_limit
            {
                bail!("cache grew while rendering unchanged frames: {first:?} -> {last:?}");
            }
        }
        Scenario::Resize => {
            if !seen.resized {
                bail!("the window was never resized");
            }
            if seen.rendered_after_resize == 0 {
                bail!("rendering did not resume after the resize");
            }
        }
    }

    info!(
        "{scenario:?} passed after {} skipped frames: {:?}",
        seen.skipped_frames, seen.last_frame
    );
    Ok(())
}

impl ViewerState {
    fn render(&mut self) -> anyhow::Result<()> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        if !self.device.begin_frame(self.surface)? {
            self.seen.skipped_frames += 1;
            return Ok(());
        }

        let mut cmd = self.device.request_command_list(self.surface, 0)?;
        cmd.begin()?;
        scene.record(&mut cmd)?;
        cmd.submit()?;
        self.device.end_frame(self.surface)?;

        self.rendered += 1;
        if self.seen.resized {
            self.seen.rendered_after_resize += 1;
        }
        let stats = self.device.cache_stats();
        if self.rendered == 1 {
            info!("First frame caches: {stats:?}");
            self.seen.first_frame = Some(stats);
        }
        self.seen.last_frame = Some(stats);
        if let Some(surface) = self.device.surface(self.surface) {
            self.seen.image_count = surface.image_count();
        }
        Ok(())
    }

    fn resize(&mut self, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        self.device.resize_surface(self.surface, size.width, size.height)?;
        Ok(())
    }
}

impl ApplicationHandler for ViewerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Viewer ready");
            }
            Err(err) => self.fail(event_loop, err),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = self.state.as_mut() else {
            return;
        };

        let result = match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
                return;
            }
            WindowEvent::Resized(size) => state.resize(size),
            WindowEvent::RedrawRequested => state.render(),
            _ => Ok(()),
        };
        if let Err(err) = result {
            self.fail(event_loop, err);
            return;
        }

        if self.options.scenario == Scenario::Resize
            && state.rendered == RESIZE_AT_FRAME
            && !state.seen.resized
        {
            let size = state.window.inner_size();
            let target = PhysicalSize::new(size.width * 3 / 4, size.height * 3 / 4);
            info!("Resizing to {}x{}", target.width, target.height);
            // The platform may resize asynchronously or not at all, so the
            // surface is told directly as well.
            let _ = state.window.request_inner_size(target);
            state.seen.resized = true;
            if let Err(err) = state.resize(target) {
                self.fail(event_loop, err);
                return;
            }
        }

        if self.options.frame_limit().is_some_and(|limit| state.rendered >= limit) {
            info!("Rendered {} frames", state.rendered);
            self.shutdown(event_loop);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(framebuffers: usize, pipeline_creations: u64) -> CacheStats {
        CacheStats {
            render_passes: 1,
            framebuffers,
            pipelines: 1,
            descriptor_sets: 0,
            pipeline_creations,
        }
    }

    #[test]
    fn cache_reuse_allows_one_framebuffer_per_image() {
        let seen = Observations {
            first_frame: Some(stats(1, 1)),
            last_frame: Some(stats(3, 1)),
            image_count: 3,
            ..Observations::default()
        };
        assert!(check_scenario(Scenario::CacheReuse, &seen).is_ok());
    }

    #[test]
    fn cache_reuse_rejects_new_pipelines() {
        let seen = Observations {
            first_frame: Some(stats(1, 1)),
            last_frame: Some(stats(1, 2)),
            image_count: 3,
            ..Observations::default()
        };
        assert!(check_scenario(Scenario::CacheReuse, &seen).is_err());
    }

    #[test]
    fn resize_needs_frames_after_the_resize() {
        let mut seen = Observations {
            first_frame: Some(stats(1, 1)),
            resized: true,
            ..Observations::default()
        };
        assert!(check_scenario(Scenario::Resize, &seen).is_err());
        seen.rendered_after_resize = 2;
        assert!(check_scenario(Scenario::Resize, &seen).is_ok());
    }

    #[test]
    fn scenarios_need_a_rendered_frame() {
        assert!(check_scenario(Scenario::Triangle, &Observations::default()).is_err());
    }

    #[test]
    fn scripted_scenarios_stop_by_default() {
        let options = ViewerOptions {
            scenario: Scenario::CacheReuse,
            ..ViewerOptions::default()
        };
        assert_eq!(options.frame_limit(), Some(10));
        assert_eq!(ViewerOptions::default().frame_limit(), None);
    }
}
