//! legacy_render 演示程序
//!
//! 打开一个 winit 窗口，按配置选择后端创建驱动，用批处理引擎每帧绘制一个三角形。
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件（config.toml 不存在时使用默认配置）
//! cargo run
//!
//! # 命令行覆盖后端和窗口尺寸
//! cargo run -- --backend software --width 1280 --height 720
//! ```
//!
//! # 帧流程
//!
//! ```text
//! begin_frame → execute_batch → end_frame → present
//!      │
//!      └─ DeviceLost / SwapchainLost → resize_swap_chain(窗口尺寸) 后重试
//! ```

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, warn};
use winit::dpi::PhysicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::WindowBuilder;

use legacy_render::batch::BatchEngine;
use legacy_render::compat::fvf::{self, FVF_UNLIT_VERTEX};
use legacy_render::compat::{BufferUsage, VertexBufferClass};
use legacy_render::core::{log, Config, DriverError};
use legacy_render::gfx::handle::{BatchHandle, Handle, ShaderHandle};
use legacy_render::gfx::types::{Color, PrimitiveType};
use legacy_render::gfx::{GraphicsContext, SharedDriver, WindowTarget};
use legacy_render::{engine_error, engine_info, engine_warn};

/// 与 `FVF_UNLIT_VERTEX` 布局一致的顶点
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UnlitVertex {
    position: [f32; 3],
    diffuse: u32,
    uv: [f32; 2],
}

const TRIANGLE: [UnlitVertex; 3] = [
    UnlitVertex { position: [0.0, -0.5, 0.0], diffuse: 0xFFFF_0000, uv: [0.5, 0.0] },
    UnlitVertex { position: [0.5, 0.5, 0.0], diffuse: 0xFF00_FF00, uv: [1.0, 1.0] },
    UnlitVertex { position: [-0.5, 0.5, 0.0], diffuse: 0xFF00_00FF, uv: [0.0, 1.0] },
];

/// 每帧重放的场景
struct Demo {
    driver: SharedDriver,
    engine: BatchEngine,
    batch: BatchHandle,
    shader: ShaderHandle,
    _vertices: VertexBufferClass,
    frames: u64,
}

impl Demo {
    fn new(driver: SharedDriver, config: &Config) -> Result<Self> {
        let vertices = VertexBufferClass::new(&driver, FVF_UNLIT_VERTEX, TRIANGLE.len() as u32, BufferUsage::Default)?;
        vertices.write_lock()?.copy_from_slice(bytemuck::cast_slice(&TRIANGLE));

        let shader = {
            let mut d = driver.borrow_mut();
            let format = d.create_vertex_format(&fvf::vertex_elements(FVF_UNLIT_VERTEX))?;
            d.set_vertex_format(format)?;
            d.set_stream_source(0, vertices.handle(), 0, 0)?;
            d.set_clear_color(Color::new(0.1, 0.1, 0.15, 1.0));

            match (&config.graphics.vertex_shader, &config.graphics.fragment_shader) {
                (Some(vs), Some(fs)) => {
                    let vs = std::fs::read(vs).with_context(|| format!("Failed to read vertex shader {vs}"))?;
                    let fs = std::fs::read(fs).with_context(|| format!("Failed to read fragment shader {fs}"))?;
                    let shader = d.create_shader_program(&vs, &fs)?;
                    d.set_shader_program(shader)?;
                    shader
                }
                _ => ShaderHandle::invalid(),
            }
        };

        let mut engine = BatchEngine::from_config(&config.graphics);
        let batch = engine.create_batch();
        engine.begin_batch(batch)?;
        engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 1)?;
        engine.end_batch(batch)?;

        Ok(Self {
            driver,
            engine,
            batch,
            shader,
            _vertices: vertices,
            frames: 0,
        })
    }

    fn render(&mut self) -> Result<(), DriverError> {
        let mut driver = self.driver.borrow_mut();
        driver.begin_frame()?;
        let executed = self.engine.execute_batch(&mut **driver, self.batch);
        // 录制失败也要结束这一帧
        let ended = driver.end_frame();
        executed?;
        ended?;
        driver.present()?;
        self.frames += 1;
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let Err(err) = self.driver.borrow_mut().resize_swap_chain(width, height) {
            warn!(error = %err, width, height, "Swap chain resize failed");
        }
    }
}

impl Drop for Demo {
    fn drop(&mut self) {
        let stats = self.engine.stats();
        info!(
            frames = self.frames,
            draw_calls = stats.total_draw_calls,
            triangles = stats.total_triangles_drawn,
            "Demo finished"
        );
        if let Ok(mut driver) = self.driver.try_borrow_mut() {
            if let Err(err) = driver.wait_for_gpu() {
                debug!(error = %err, "Wait for GPU at exit failed");
            }
            if self.shader.is_valid() {
                let _ = driver.destroy_shader_program(self.shader);
            }
        }
    }
}

fn main() -> Result<()> {
    // 配置在日志之前加载
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args());
    config.validate()?;

    let log_file = config.logging.file_output.then_some(config.logging.log_file.as_str());
    log::init_logger(config.logging.level, config.logging.file_output, log_file)?;
    engine_info!(version = env!("CARGO_PKG_VERSION"), "legacy_render starting");
    info!(
        backend = ?config.graphics.backend,
        width = config.window.width,
        height = config.window.height,
        "Graphics configuration"
    );

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let window = WindowBuilder::new()
        .with_title(config.window.title.as_str())
        .with_inner_size(PhysicalSize::new(config.window.width, config.window.height))
        .with_resizable(config.window.resizable)
        .build(&event_loop)
        .context("Failed to create window")?;

    let mut context = GraphicsContext::new();
    let driver = context.create_driver(&config.graphics, None);
    {
        let size = window.inner_size();
        let target = WindowTarget::from_window(&window)?;
        let mut d = driver.borrow_mut();
        d.initialize(Some(target), size.width, size.height, config.window.fullscreen)
            .with_context(|| format!("Failed to initialize {} driver", d.backend_name()))?;
        info!(backend = d.backend_name(), version = %d.version_string(), "Driver ready");
    }

    let mut demo = Some(Demo::new(driver, &config)?);
    info!("Entering main loop...");

    event_loop.run(move |event, elwt| match event {
        Event::WindowEvent { event: WindowEvent::CloseRequested, .. } => {
            info!("Close requested, shutting down...");
            demo.take();
            context.shutdown();
            elwt.exit();
        }
        Event::WindowEvent { event: WindowEvent::Resized(size), .. } => {
            debug!(width = size.width, height = size.height, "Window resized");
            if let Some(demo) = demo.as_mut() {
                demo.resize(size.width, size.height);
            }
        }
        Event::WindowEvent { event: WindowEvent::RedrawRequested, .. } => {
            let Some(demo) = demo.as_mut() else { return };
            match demo.render() {
                Ok(()) => {}
                Err(err) if err.requires_reset() => {
                    engine_warn!(error = %err, "Device needs reset, rebuilding the swap chain");
                    let size = window.inner_size();
                    demo.resize(size.width, size.height);
                }
                Err(err) => {
                    engine_error!(error = %err, "Frame failed");
                    elwt.exit();
                }
            }
        }
        Event::AboutToWait => window.request_redraw(),
        _ => {}
    })?;

    Ok(())
}
