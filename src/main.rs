use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use glam::{Vec2, Vec3};
use prism::camera::{CameraControl, Projection};
use prism::engine::{FrameOutcome, HybridRenderer};
use prism::gpu::wgpu_backend::WgpuDevice;
use prism::gpu::{Extent2d, GpuContext};
use prism::options::Options;
use prism::scene::assets::demo_scene;
use prism::scene::Scene;
use prism::PrismError;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

const OPTIONS_PATH: &str = "prism.toml";
const DEMO_CUBES: usize = 4;

/// Everything that exists once the window does.
struct Viewer {
    window: Arc<Window>,
    renderer: HybridRenderer<WgpuDevice>,
    scene: Scene,
}

struct ViewerApp {
    options: Options,
    viewer: Option<Viewer>,
    camera: CameraControl,
    dragging: bool,
    last_mouse_pos: Option<Vec2>,
    failure: Option<PrismError>,
}

impl ViewerApp {
    fn new(options: Options) -> Self {
        Self {
            options,
            viewer: None,
            camera: CameraControl::orbit(Vec3::ZERO, 8.0),
            dragging: false,
            last_mouse_pos: None,
            failure: None,
        }
    }

    fn start(&self, event_loop: &ActiveEventLoop) -> Result<Viewer, PrismError> {
        let attrs = Window::default_attributes()
            .with_title("Prism")
            .with_inner_size(winit::dpi::LogicalSize::new(1280, 720));
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .map_err(|e| PrismError::Viewer(e.to_string()))?,
        );
        let size = window.inner_size();
        let device = WgpuDevice::new_blocking(
            Arc::clone(&window),
            Extent2d::new(size.width, size.height),
        )?;
        let mut ctx = GpuContext::new(device);
        let scene = demo_scene(&mut ctx, DEMO_CUBES)?;
        let renderer = HybridRenderer::new(ctx, self.options.clone(), &scene)?;
        window.request_redraw();
        Ok(Viewer {
            window,
            renderer,
            scene,
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: PrismError) {
        log::error!("fatal: {error}");
        self.failure = Some(error);
        event_loop.exit();
    }

    fn redraw(&mut self) -> Result<(), PrismError> {
        let Some(viewer) = &mut self.viewer else {
            return Ok(());
        };
        let extent = viewer.renderer.render_extent();
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        let camera = self.camera.state(aspect, Projection::default());
        match viewer.renderer.render_frame(&viewer.scene, &camera)? {
            FrameOutcome::Resized | FrameOutcome::Dropped => {
                log::debug!("surface rebuilt at {}", viewer.renderer.render_extent());
            }
            FrameOutcome::Presented | FrameOutcome::Minimized => {}
        }
        viewer.window.request_redraw();
        Ok(())
    }

    fn toggle_ray_tracing(&mut self) -> Result<(), PrismError> {
        let Some(viewer) = &mut self.viewer else {
            return Ok(());
        };
        self.options.render.ray_tracing = !self.options.render.ray_tracing;
        viewer.renderer.set_options(self.options.clone())
    }
}

impl ApplicationHandler for ViewerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.viewer.is_some() {
            return;
        }
        match self.start(event_loop) {
            Ok(viewer) => self.viewer = Some(viewer),
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(viewer) = &mut self.viewer {
                    viewer
                        .renderer
                        .device_mut()
                        .set_window_extent(Extent2d::new(size.width, size.height));
                    viewer.window.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e);
                }
            }

            WindowEvent::MouseInput { button, state, .. } => {
                if button == MouseButton::Left {
                    self.dragging = state == ElementState::Pressed;
                }
            }

            WindowEvent::CursorMoved { position, .. } => {
                let position = Vec2::new(position.x as f32, position.y as f32);
                if let Some(last) = self.last_mouse_pos {
                    if self.dragging {
                        self.camera.rotate(position - last);
                    }
                }
                self.last_mouse_pos = Some(position);
            }

            WindowEvent::MouseWheel { delta, .. } => match delta {
                MouseScrollDelta::LineDelta(_, y) => self.camera.zoom(y),
                MouseScrollDelta::PixelDelta(pos) => {
                    self.camera.zoom(pos.y as f32 * 0.01);
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state != ElementState::Pressed || event.repeat {
                    return;
                }
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::Escape) => event_loop.exit(),
                    PhysicalKey::Code(KeyCode::KeyR) => {
                        if let Err(e) = self.toggle_ray_tracing() {
                            self.fail(event_loop, e);
                        }
                    }
                    _ => {}
                }
            }

            _ => (),
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        let Some(Viewer {
            renderer, scene, ..
        }) = self.viewer.take()
        else {
            return;
        };
        let stats = renderer.stats();
        log::info!(
            "{} frames presented, {} dropped",
            stats.presented,
            stats.dropped
        );
        let mut ctx = renderer.shutdown();
        scene.destroy(&mut ctx);
        let leaked = ctx.allocator.leaked_labels();
        if !leaked.is_empty() {
            log::warn!("objects alive at exit: {}", leaked.join(", "));
        }
    }
}

fn load_options() -> Result<Options, PrismError> {
    let path = Path::new(OPTIONS_PATH);
    if path.exists() {
        log::info!("loading options from {}", path.display());
        Options::load(path)
    } else {
        Ok(Options::default())
    }
}

fn run() -> Result<(), PrismError> {
    let options = load_options()?;
    let mut app = ViewerApp::new(options);
    let event_loop =
        EventLoop::new().map_err(|e| PrismError::Viewer(e.to_string()))?;
    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop
        .run_app(&mut app)
        .map_err(|e| PrismError::Viewer(e.to_string()))?;
    app.failure.map_or(Ok(()), Err)
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
