//! Kestrel demo viewer
//!
//! Opens a window and renders a triangle through the GPU layer and an
//! opaque render queue, checking object cache behavior as it goes.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p kestrel-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--scenario <NAME>`: `triangle` (default), `cache` or `resize`
//! - `--frames <N>`: Frames to render before exiting (default: run until closed;
//!   `cache` and `resize` default to 10)
//! - `--vsync`: Enable vsync
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod scene;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;
use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::{Scenario, ViewerApp, ViewerOptions};

fn parse_args() -> anyhow::Result<Option<ViewerOptions>> {
    let mut options = ViewerOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--scenario" => {
                let name = args.next().context("--scenario needs a value")?;
                options.scenario = match name.as_str() {
                    "triangle" => Scenario::Triangle,
                    "cache" => Scenario::CacheReuse,
                    "resize" => Scenario::Resize,
                    other => bail!("unknown scenario {other:?}"),
                };
            }
            "--frames" => {
                let frames = args.next().context("--frames needs a value")?;
                options.frames = Some(frames.parse().context("--frames must be a number")?);
            }
            "--vsync" => options.vsync = true,
            other => bail!("unknown argument {other:?}, see --help"),
        }
    }
    Ok(Some(options))
}

fn main() -> anyhow::Result<()> {
    let Some(options) = parse_args()? else {
        print_help();
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Kestrel viewer starting ({:?})", options.scenario);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ViewerApp::new(options);
    event_loop.run_app(&mut app)?;
    app.finish()
}

fn print_help() {
    eprintln!(
        "Kestrel demo viewer

USAGE:
    cargo run -p kestrel-viewer -- [OPTIONS]

OPTIONS:
    --scenario <NAME>   triangle (default), cache or resize
    --frames <N>        Frames to render before exiting
    --vsync             Enable vsync
    -h, --help          Print this help message

SCENARIOS:
    triangle            Clear and draw one triangle; checks that the first frame
                        creates one render pass, framebuffer and pipeline
    cache               Render unchanged frames and check that no further
                        pipelines are created
    resize              Resize the window mid-run and check that rendering
                        resumes after the swapchain is recreated

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
