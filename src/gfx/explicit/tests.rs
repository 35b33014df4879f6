use super::*;
use crate::gfx::device::SPIRV_MAGIC;
use crate::gfx::headless::HeadlessDevice;
use crate::gfx::state::Topology;
use crate::gfx::types::{CullMode, FillMode};

type TestDriver = ExplicitDriver<HeadlessDevice>;

fn driver() -> TestDriver {
    let mut driver = ExplicitDriver::new(HeadlessDevice::new(), DriverSettings::default());
    driver.initialize(None, 640, 480, false).unwrap();
    driver
}

/// 只有 float3 位置的顶点格式，跨度 12
fn position_format(driver: &mut TestDriver) -> VertexFormatHandle {
    driver.create_vertex_format(&[VertexElement::default()]).unwrap()
}

/// 一个三角形的顶点缓冲区，绑定到 0 号流
fn bind_triangle(driver: &mut TestDriver) -> VertexBufferHandle {
    let format = position_format(driver);
    driver.set_vertex_format(format).unwrap();
    let vertices: Vec<u8> = [0.0f32, 0.5, 0.0, -0.5, -0.5, 0.0, 0.5, -0.5, 0.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let buffer = driver.create_vertex_buffer(vertices.len(), false, Some(&vertices)).unwrap();
    driver.set_stream_source(0, buffer, 0, 12).unwrap();
    buffer
}

fn run_frame(driver: &mut TestDriver, body: impl FnOnce(&mut TestDriver)) {
    driver.begin_frame().unwrap();
    body(driver);
    driver.end_frame().unwrap();
    driver.present().unwrap();
}

fn spirv_stub() -> Vec<u8> {
    let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
    bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
    bytes
}

#[test]
fn test_handle_valid_iff_creation_succeeded() {
    let mut driver = driver();
    assert!(driver.create_vertex_buffer(0, false, None).is_err());
    assert!(!driver.last_error().is_empty());

    let buffer = driver.create_vertex_buffer(64, true, None).unwrap();
    assert!(buffer.is_valid());
    assert_eq!(driver.vertex_buffer_size(buffer).unwrap(), 64);

    // 初始数据超出容量
    assert!(driver.create_index_buffer(2, IndexFormat::U16, false, Some(&[0; 4])).is_err());
}

#[test]
fn test_destroyed_handle_never_aliases() {
    let mut driver = driver();
    let first = driver.create_vertex_buffer(16, false, None).unwrap();
    driver.destroy_vertex_buffer(first).unwrap();
    let second = driver.create_vertex_buffer(16, false, None).unwrap();

    assert_ne!(first, second);
    assert!(matches!(
        driver.lock_vertex_buffer(first, 0, 0),
        Err(DriverError::InvalidHandle { kind: "vertex buffer", .. })
    ));
    assert!(driver.last_error().contains("vertex buffer"));
    assert!(driver.destroy_vertex_buffer(first).is_err());
    assert!(driver.lock_vertex_buffer(second, 0, 0).is_ok());
}

#[test]
fn test_not_initialized() {
    let mut driver = ExplicitDriver::new(HeadlessDevice::new(), DriverSettings::default());
    assert!(!driver.is_initialized());
    assert_eq!(driver.begin_frame(), Err(DriverError::NotInitialized));
    assert!(driver.create_vertex_buffer(16, false, None).is_err());
    assert_eq!(driver.last_error(), "Driver not initialized");
}

#[test]
fn test_frame_state_machine() {
    let mut driver = driver();
    assert_eq!(driver.frame_state(), FrameState::Idle);
    assert!(driver.end_frame().is_err());
    assert!(driver.present().is_err());

    driver.begin_frame().unwrap();
    assert_eq!(driver.frame_state(), FrameState::Recording);
    assert_eq!(driver.begin_frame(), Err(DriverError::state("Frame already in progress")));
    assert_eq!(driver.last_error(), "Frame already in progress");
    assert!(driver.present().is_err());

    driver.end_frame().unwrap();
    assert_eq!(driver.frame_state(), FrameState::Submitted);
    assert!(driver.begin_frame().is_err());

    driver.present().unwrap();
    assert_eq!(driver.frame_state(), FrameState::Idle);
    assert_eq!(driver.device().presents(), 1);
}

#[test]
fn test_slot_reused_only_after_fence_of_frame_two_back() {
    let mut driver = driver();
    for _ in 0..4 {
        run_frame(&mut driver, |_| {});
    }
    let slots: Vec<usize> = driver.device().submissions().iter().map(|s| s.slot).collect();
    assert_eq!(slots, vec![0, 1, 0, 1]);
    // 第 2 帧等待第 0 帧（槽位 0），第 3 帧等待第 1 帧（槽位 1）
    assert_eq!(driver.device().fence_waits(), &[0, 1]);
}

#[test]
fn test_fence_wait_is_bounded() {
    let mut driver = driver();
    run_frame(&mut driver, |_| {});
    run_frame(&mut driver, |_| {});

    driver.device_mut().stall_fences(true);
    assert_eq!(driver.begin_frame(), Err(DriverError::Timeout(1000)));
    assert_eq!(driver.frame_state(), FrameState::Idle);
    assert!(driver.last_error().contains("timed out"));

    driver.device_mut().stall_fences(false);
    run_frame(&mut driver, |_| {});
}

#[test]
fn test_draw_requires_recording_frame() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    assert_eq!(
        driver.draw_primitive(PrimitiveType::TriangleList, 0, 1),
        Err(DriverError::state("No frame is recording"))
    );
}

#[test]
fn test_draw_records_command() {
    let mut driver = driver();
    let buffer = bind_triangle(&mut driver);
    let buffer_id = driver.vertex_buffer_object(buffer).unwrap().id();
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });

    let draws = driver.device().draws();
    assert_eq!(draws.len(), 1);
    let draw = &draws[0];
    assert_eq!(draw.params.topology, Topology::TriangleList);
    assert_eq!(draw.params.element_count, 3);
    assert_eq!(draw.params.instance_count, 1);
    assert!(!draw.params.indexed);
    assert_eq!(draw.vertex_buffers, vec![(0, buffer_id, 0, 12)]);
    assert_eq!(driver.device().submissions()[0].draw_count, 1);
}

#[test]
fn test_draw_range_validated() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    driver.begin_frame().unwrap();
    // 第二个三角形超出 36 字节的缓冲区
    assert!(driver.draw_primitive(PrimitiveType::TriangleList, 0, 2).is_err());
    assert!(driver.draw_primitive(PrimitiveType::TriangleList, 0, 0).is_err());
    assert!(driver.device().draws().is_empty());
}

#[test]
fn test_draw_without_vertex_format_is_skipped() {
    let mut driver = driver();
    let buffer = driver.create_vertex_buffer(36, false, None).unwrap();
    driver.set_stream_source(0, buffer, 0, 12).unwrap();
    driver.begin_frame().unwrap();
    assert_eq!(
        driver.draw_primitive(PrimitiveType::TriangleList, 0, 1),
        Err(DriverError::state("No vertex format set"))
    );
}

#[test]
fn test_stride_defaults_to_vertex_format() {
    let mut driver = driver();
    let buffer = bind_triangle(&mut driver);
    driver.set_stream_source(0, buffer, 0, 0).unwrap();
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::PointList, 0, 3).unwrap();
    });
    assert_eq!(driver.device().draws()[0].vertex_buffers[0].3, 12);
}

#[test]
fn test_pipeline_rebuilt_lazily() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    driver.begin_frame().unwrap();

    driver.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    driver.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    assert_eq!(driver.device().pipelines_created(), 1);

    // 雾颜色不属于管线状态
    driver.set_render_state(RenderState::FogColor, 0x00FF_0000).unwrap();
    driver.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    assert_eq!(driver.device().pipelines_created(), 1);

    driver.set_render_state(RenderState::CullMode, CullMode::None.raw()).unwrap();
    driver.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    assert_eq!(driver.device().pipelines_created(), 2);

    // 回到旧状态时复用缓存
    driver
        .set_render_state(RenderState::CullMode, CullMode::CounterClockwise.raw())
        .unwrap();
    driver.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    assert_eq!(driver.device().pipelines_created(), 2);

    driver.draw_primitive(PrimitiveType::LineList, 0, 1).unwrap();
    assert_eq!(driver.device().pipelines_created(), 3);
    assert_eq!(driver.cached_pipelines(), 3);

    let draws = driver.device().draws();
    assert_eq!(draws[0].pipeline, draws[1].pipeline);
    assert_eq!(draws[0].pipeline, draws[4].pipeline);
    assert_ne!(draws[0].pipeline, draws[3].pipeline);
}

#[test]
fn test_rasterizer_state_feeds_pipeline_key() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    driver
        .set_rasterizer_state(&RasterizerStateDescriptor {
            fill_mode: FillMode::Wireframe,
            cull_mode: CullMode::None,
            depth_bias: 0,
            slope_scaled_depth_bias: 0.0,
            scissor_enable: false,
        })
        .unwrap();
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    assert_eq!(driver.render_state(RenderState::FillMode), FillMode::Wireframe.raw());
    assert_eq!(driver.render_state(RenderState::CullMode), CullMode::None.raw());
}

#[test]
fn test_quad_list_drawn_as_triangle_list() {
    let mut driver = driver();
    let format = position_format(&mut driver);
    driver.set_vertex_format(format).unwrap();
    let buffer = driver.create_vertex_buffer(48, false, None).unwrap();
    driver.set_stream_source(0, buffer, 0, 12).unwrap();
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::QuadList, 0, 1).unwrap();
    });
    let params = driver.device().draws()[0].params;
    assert_eq!(params.topology, Topology::TriangleList);
    assert_eq!(params.element_count, 4);
}

#[test]
fn test_indexed_draw_applies_base_index() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    let indices: Vec<u8> = [0u16, 1, 2, 2, 1, 0].iter().flat_map(|i| i.to_le_bytes()).collect();
    let ib = driver
        .create_index_buffer(indices.len(), IndexFormat::U16, false, Some(&indices))
        .unwrap();
    driver.set_index_buffer(ib, 3).unwrap();

    driver.begin_frame().unwrap();
    driver.draw_indexed_primitive(PrimitiveType::TriangleList, 0, 0, 1).unwrap();
    // 3 + 1 + 3 > 6
    assert!(driver.draw_indexed_primitive(PrimitiveType::TriangleList, 0, 1, 1).is_err());
    driver.end_frame().unwrap();
    driver.present().unwrap();

    let draw = &driver.device().draws()[0];
    assert!(draw.params.indexed);
    assert_eq!(draw.params.first_index, 3);
    assert_eq!(draw.params.element_count, 3);
    assert!(draw.index_buffer.is_some());
}

#[test]
fn test_indexed_draw_requires_index_buffer() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    driver.begin_frame().unwrap();
    assert_eq!(
        driver.draw_indexed_primitive(PrimitiveType::TriangleList, 0, 0, 1),
        Err(DriverError::state("No index buffer bound"))
    );
}

#[test]
fn test_oversized_primitive_counts_rejected() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    let indices: Vec<u8> = [0u16, 1, 2].iter().flat_map(|i| i.to_le_bytes()).collect();
    let ib = driver
        .create_index_buffer(indices.len(), IndexFormat::U16, false, Some(&indices))
        .unwrap();
    driver.set_index_buffer(ib, 1).unwrap();

    driver.begin_frame().unwrap();
    let limit = driver.max_primitive_count();
    assert!(matches!(
        driver.draw_primitive(PrimitiveType::TriangleList, 0, limit + 1),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(driver.last_error().contains("exceeds device limit"));
    assert!(matches!(
        driver.draw_primitive_up(PrimitiveType::TriangleList, 0x6000_0000, &[0; 36], 12),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(matches!(
        driver.draw_indexed_primitive(PrimitiveType::TriangleList, 0, u32::MAX, 1),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(driver.last_error().contains("overflows"));
    assert!(driver.device().draws().is_empty());
}

#[test]
fn test_vertex_count_overflow_rejected_without_cap() {
    let caps = DriverCaps { max_primitive_count: u32::MAX, ..DriverCaps::default() };
    let mut driver = ExplicitDriver::new(HeadlessDevice::with_caps(caps), DriverSettings::default());
    driver.initialize(None, 640, 480, false).unwrap();
    bind_triangle(&mut driver);

    driver.begin_frame().unwrap();
    assert!(matches!(
        driver.draw_primitive(PrimitiveType::TriangleList, 0, 0x6000_0000),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(driver.last_error().contains("overflow the vertex count"));
    assert!(driver.device().draws().is_empty());
}

#[test]
fn test_instanced_draw() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    let instances = driver.create_vertex_buffer(160, true, None).unwrap();
    driver.set_stream_source(1, instances, 0, 16).unwrap();
    run_frame(&mut driver, |d| {
        d.draw_primitive_instanced(PrimitiveType::TriangleList, 0, 1, 10, 2).unwrap();
        assert!(d.draw_primitive_instanced(PrimitiveType::TriangleList, 0, 1, 0, 0).is_err());
    });
    let draw = &driver.device().draws()[0];
    assert_eq!(draw.params.instance_count, 10);
    assert_eq!(draw.params.first_instance, 2);
    assert_eq!(draw.vertex_buffers.len(), 2);
    assert_eq!(draw.vertex_buffers[1].0, 1);
}

#[test]
fn test_user_pointer_draw_uses_transient_buffer() {
    let mut driver = driver();
    let format = position_format(&mut driver);
    driver.set_vertex_format(format).unwrap();
    let vertices = [0u8; 36];

    driver.begin_frame().unwrap();
    driver
        .draw_primitive_up(PrimitiveType::TriangleList, 1, &vertices, 12)
        .unwrap();
    assert!(driver.draw_primitive_up(PrimitiveType::TriangleList, 2, &vertices, 12).is_err());
    // 临时缓冲区随当前帧延迟释放
    assert_eq!(driver.pending_destructions(), 1);
    driver.end_frame().unwrap();
    driver.present().unwrap();

    let transient = driver.device().draws()[0].vertex_buffers[0].1;
    assert!(driver.device().buffer_contents(transient).is_some());
    run_frame(&mut driver, |_| {});
    run_frame(&mut driver, |_| {});
    assert!(driver.device().buffer_contents(transient).is_none());
    assert_eq!(driver.pending_destructions(), 0);
}

#[test]
fn test_indexed_user_pointer_draw() {
    let mut driver = driver();
    let format = position_format(&mut driver);
    driver.set_vertex_format(format).unwrap();
    let vertices = [0u8; 48];
    let indices: Vec<u8> = [0u32, 1, 2, 0, 2, 3].iter().flat_map(|i| i.to_le_bytes()).collect();

    run_frame(&mut driver, |d| {
        d.draw_indexed_primitive_up(
            PrimitiveType::TriangleList,
            0,
            4,
            2,
            &indices,
            IndexFormat::U32,
            &vertices,
            12,
        )
        .unwrap();
        // 索引数据不足
        assert!(d
            .draw_indexed_primitive_up(
                PrimitiveType::TriangleList,
                0,
                4,
                3,
                &indices,
                IndexFormat::U32,
                &vertices,
                12,
            )
            .is_err());
    });
    let draw = &driver.device().draws()[0];
    assert!(draw.params.indexed);
    assert_eq!(draw.params.element_count, 6);
    assert!(draw.index_buffer.is_some());
}

#[test]
fn test_double_lock_returns_previous_window() {
    let mut driver = driver();
    let buffer = driver.create_vertex_buffer(32, true, None).unwrap();

    let first = driver.lock_vertex_buffer(buffer, 8, 8).unwrap().as_ptr();
    let second = driver.lock_vertex_buffer(buffer, 0, 4).unwrap();
    assert_eq!(second.len(), 8);
    assert_eq!(second.as_ptr(), first);
    second.fill(0x5A);
    driver.unlock_vertex_buffer(buffer).unwrap();
    assert!(driver.unlock_vertex_buffer(buffer).is_err());

    let id = driver.vertex_buffer_object(buffer).unwrap().id();
    let contents = driver.device().buffer_contents(id).unwrap();
    assert!(contents[..8].iter().all(|b| *b == 0));
    assert!(contents[8..16].iter().all(|b| *b == 0x5A));
    assert!(contents[16..].iter().all(|b| *b == 0));
}

#[test]
fn test_lock_range_validated() {
    let mut driver = driver();
    let buffer = driver.create_index_buffer(16, IndexFormat::U16, false, None).unwrap();
    assert!(driver.lock_index_buffer(buffer, 8, 16).is_err());
    assert!(driver.lock_index_buffer(buffer, 16, 0).is_err());
    assert_eq!(driver.lock_index_buffer(buffer, 4, 0).unwrap().len(), 12);
    assert_eq!(driver.locked_index_data(buffer).map(|d| d.len()), Some(12));
    driver.unlock_index_buffer(buffer).unwrap();
    assert!(driver.locked_index_data(buffer).is_none());
}

#[test]
fn test_write_to_in_flight_buffer_renames() {
    let mut driver = driver();
    let buffer = bind_triangle(&mut driver);
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    let old_id = driver.vertex_buffer_object(buffer).unwrap().id();

    driver.lock_vertex_buffer(buffer, 0, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
    driver.unlock_vertex_buffer(buffer).unwrap();

    let new_id = driver.vertex_buffer_object(buffer).unwrap().id();
    assert_ne!(old_id, new_id);
    assert_eq!(driver.pending_destructions(), 1);
    // 旧对象保持 GPU 看到的内容，新对象包含完整的新内容
    assert_ne!(&driver.device().buffer_contents(old_id).unwrap()[..4], &[1, 2, 3, 4]);
    let contents = driver.device().buffer_contents(new_id).unwrap();
    assert_eq!(&contents[..4], &[1, 2, 3, 4]);
    assert_eq!(contents.len(), 36);
}

#[test]
fn test_deferred_destruction_waits_for_fence() {
    let mut driver = driver();
    let buffer = bind_triangle(&mut driver);
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    let id = driver.vertex_buffer_object(buffer).unwrap().id();
    let live = driver.device().live_objects();

    driver.destroy_vertex_buffer(buffer).unwrap();
    assert_eq!(driver.pending_destructions(), 1);
    assert_eq!(driver.device().live_objects(), live);
    assert!(driver.vertex_buffer_object(buffer).is_err());

    // 下一帧使用另一个槽位，缓冲区仍然存活
    run_frame(&mut driver, |_| {});
    assert!(driver.device().buffer_contents(id).is_some());

    // 回到槽位 0 前等待其 Fence，随后释放
    driver.begin_frame().unwrap();
    assert!(driver.device().buffer_contents(id).is_none());
    assert_eq!(driver.device().live_objects(), live - 1);
}

#[test]
fn test_destroy_when_idle_releases_immediately() {
    let mut driver = driver();
    let live = driver.device().live_objects();
    let buffer = driver.create_vertex_buffer(16, false, None).unwrap();
    assert_eq!(driver.device().live_objects(), live + 1);
    driver.destroy_vertex_buffer(buffer).unwrap();
    assert_eq!(driver.device().live_objects(), live);
    assert_eq!(driver.pending_destructions(), 0);
}

#[test]
fn test_destroy_unbinds_stream() {
    let mut driver = driver();
    let buffer = bind_triangle(&mut driver);
    driver.destroy_vertex_buffer(buffer).unwrap();
    driver.begin_frame().unwrap();
    assert_eq!(
        driver.draw_primitive(PrimitiveType::TriangleList, 0, 1),
        Err(DriverError::state("No vertex buffer bound to stream 0"))
    );
}

#[test]
fn test_scissor_rect_validation() {
    let mut driver = driver();
    assert!(driver.set_scissor_rect(Rect::new(10, 10, 5, 20)).is_err());
    assert!(driver.set_scissor_rect(Rect::new(10, 10, 20, 10)).is_err());
    assert!(driver.last_error().contains("scissor"));
    assert!(driver.set_scissor_rect(Rect::new(0, 0, 100, 100)).is_ok());
}

#[test]
fn test_scissor_applied_when_enabled() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    driver.set_scissor_rect(Rect::new(0, 0, 32, 32)).unwrap();
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
        d.set_render_state(RenderState::ScissorTestEnable, 1).unwrap();
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    let draws = driver.device().draws();
    assert_eq!(draws[0].scissor, None);
    assert_eq!(draws[1].scissor, Some(Rect::new(0, 0, 32, 32)));
}

#[test]
fn test_device_lost_requires_resize() {
    let mut driver = driver();
    run_frame(&mut driver, |_| {});
    driver.device_mut().inject_device_lost();

    let err = driver.begin_frame().unwrap_err();
    assert!(matches!(err, DriverError::DeviceLost(_)));
    assert!(driver.last_error().starts_with("Device lost"));
    assert!(driver.begin_frame().is_err());

    driver.resize_swap_chain(800, 600).unwrap();
    assert_eq!(driver.display_size(), (800, 600));
    assert_eq!(driver.viewport().width, 800);
    run_frame(&mut driver, |_| {});
}

#[test]
fn test_swapchain_lost_requires_resize() {
    let mut driver = driver();
    driver.device_mut().invalidate_swapchain();
    assert_eq!(driver.begin_frame(), Err(DriverError::SwapchainLost));
    assert_eq!(driver.frame_state(), FrameState::Idle);
    assert_eq!(driver.begin_frame(), Err(DriverError::SwapchainLost));
    driver.resize_swap_chain(640, 480).unwrap();
    assert_eq!(driver.device().swapchain_rebuilds(), 1);
    run_frame(&mut driver, |_| {});
}

#[test]
fn test_clear_is_frame_scoped() {
    let mut driver = driver();
    assert!(driver.clear(Color::WHITE, true).is_err());
    driver.set_clear_color(Color::new(0.1, 0.2, 0.3, 1.0));
    run_frame(&mut driver, |d| d.clear(Color::WHITE, false).unwrap());
    let clears = driver.device().clears();
    assert_eq!(clears.len(), 2);
    assert_eq!(clears[0].color, Some(Color::new(0.1, 0.2, 0.3, 1.0)));
    assert_eq!(clears[1].color, Some(Color::WHITE));
    assert_eq!(clears[1].depth, None);
}

#[test]
fn test_dxt1_texture_lock_pitch() {
    let mut driver = driver();
    let desc = TextureDescriptor::new_2d(130, 130, TextureFormat::Dxt1, 1);
    let texture = driver.create_texture(&desc, None).unwrap();
    let lock = driver.lock_texture(texture, 0).unwrap();
    assert_eq!(lock.pitch, 264);
    assert_eq!(lock.data.len(), 8712);
    driver.unlock_texture(texture, 0).unwrap();
    assert!(driver.unlock_texture(texture, 0).is_err());
    assert!(driver.lock_texture(texture, 1).is_err());
}

#[test]
fn test_texture_full_mip_chain_and_initial_data() {
    let mut driver = driver();
    let desc = TextureDescriptor::new_2d(4, 4, TextureFormat::A8R8G8B8, 0);
    let data: Vec<u8> = (0..84u8).collect();
    let texture = driver.create_texture(&desc, Some(&data)).unwrap();
    assert_eq!(driver.texture_descriptor(texture).unwrap().mip_levels, 3);

    let image = driver.texture_object(texture).unwrap();
    assert_eq!(image.level(1).unwrap(), (64..80u8).collect::<Vec<_>>());
    assert_eq!(image.level(2).unwrap(), vec![80, 81, 82, 83]);

    assert!(driver.create_texture(&desc, Some(&[0u8; 85])).is_err());
}

#[test]
fn test_texture_validation() {
    let mut driver = driver();
    let too_big = TextureDescriptor::new_2d(8192, 8192, TextureFormat::A8R8G8B8, 1);
    assert!(driver.create_texture(&too_big, None).is_err());
    let palettized = TextureDescriptor::new_2d(8, 8, TextureFormat::P8, 1);
    assert!(matches!(
        driver.create_texture(&palettized, None),
        Err(DriverError::Unsupported(_))
    ));
    assert!(!driver.supports_texture_format(TextureFormat::P8));
    assert!(driver.supports_texture_format(TextureFormat::Dxt5));
}

#[test]
fn test_update_texture_subregion() {
    let mut driver = driver();
    let desc = TextureDescriptor::new_2d(4, 4, TextureFormat::A8R8G8B8, 1);
    let texture = driver.create_texture(&desc, None).unwrap();
    driver
        .update_texture(texture, Rect::new(1, 1, 3, 3), &[0xAB; 16])
        .unwrap();
    assert!(driver.update_texture(texture, Rect::new(2, 2, 5, 3), &[0; 12]).is_err());
    assert!(driver.update_texture(texture, Rect::new(0, 0, 2, 2), &[0; 8]).is_err());

    let level = driver.texture_object(texture).unwrap().level(0).unwrap();
    // 第 1 行：像素 1..3 被写入
    assert!(level[16..20].iter().all(|b| *b == 0));
    assert!(level[20..28].iter().all(|b| *b == 0xAB));
    assert!(level[28..32].iter().all(|b| *b == 0));
    assert!(level[36..44].iter().all(|b| *b == 0xAB));
    assert!(level[48..].iter().all(|b| *b == 0));
}

#[test]
fn test_texture_binding_unbound_on_destroy() {
    let mut driver = driver();
    let desc = TextureDescriptor::new_2d(8, 8, TextureFormat::A8R8G8B8, 1);
    let texture = driver.create_texture(&desc, None).unwrap();
    driver.set_texture(0, texture).unwrap();
    assert_eq!(driver.texture(0), texture);
    assert!(driver.set_texture(MAX_TEXTURE_STAGES as u32, texture).is_err());

    driver.destroy_texture(texture).unwrap();
    assert!(!driver.texture(0).is_valid());
    assert!(driver.set_texture(0, texture).is_err());
}

#[test]
fn test_texture_passed_to_draw() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    let desc = TextureDescriptor::new_2d(8, 8, TextureFormat::A8R8G8B8, 1);
    let texture = driver.create_texture(&desc, None).unwrap();
    let image_id = driver.texture_object(texture).unwrap().id();
    driver.set_texture(0, texture).unwrap();
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    assert_eq!(driver.device().draws()[0].textures, vec![(0, image_id)]);
}

#[test]
fn test_render_target_and_depth_stencil() {
    let mut driver = driver();
    assert!(driver.create_render_target(64, 64, TextureFormat::D24S8).is_err());
    assert!(driver.create_depth_stencil(64, 64, TextureFormat::A8R8G8B8).is_err());

    let target = driver.create_render_target(64, 64, TextureFormat::A8R8G8B8).unwrap();
    let depth = driver.create_depth_stencil(64, 64, TextureFormat::D24S8).unwrap();
    driver.set_render_target(0, target).unwrap();
    driver.set_depth_stencil(depth).unwrap();
    assert_eq!(driver.render_target(0), target);
    assert_eq!(driver.depth_stencil(), depth);
    assert!(driver.set_render_target(4, target).is_err());

    driver.destroy_render_target(target).unwrap();
    driver.destroy_depth_stencil(depth).unwrap();
    assert!(!driver.render_target(0).is_valid());
    assert!(!driver.depth_stencil().is_valid());
}

#[test]
fn test_shader_program_lifecycle() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    assert!(driver.create_shader_program(&[1, 2, 3], &spirv_stub()).is_err());

    let shader = driver.create_shader_program(&spirv_stub(), &spirv_stub()).unwrap();
    driver.set_shader_program(shader).unwrap();
    assert_eq!(driver.shader_program(), shader);
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    assert!(driver.device().draws()[0].shader.is_some());
    assert_eq!(driver.cached_pipelines(), 1);

    driver.destroy_shader_program(shader).unwrap();
    assert!(!driver.shader_program().is_valid());
    assert_eq!(driver.cached_pipelines(), 0);
    assert!(driver.set_shader_program(shader).is_err());
}

#[test]
fn test_vertex_format_destroy_evicts_pipelines() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    let format = driver.state.vertex_format();
    driver.destroy_vertex_format(format).unwrap();
    assert_eq!(driver.cached_pipelines(), 0);
    assert!(driver.set_vertex_format(format).is_err());
    assert!(driver.create_vertex_format(&[]).is_err());
}

#[test]
fn test_lighting_constants() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    let material = Material {
        diffuse: Color::new(1.0, 0.0, 0.0, 1.0),
        ..Material::default()
    };
    driver.set_material(material);
    driver.set_transform(TransformType::World, Matrix4::new_scaling(2.0));
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
        d.set_render_state(RenderState::Lighting, 0).unwrap();
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    let draws = driver.device().draws();
    assert_eq!(draws[0].constants.diffuse, [1.0, 0.0, 0.0, 1.0]);
    assert_eq!(draws[0].constants.world_view_projection[0][0], 2.0);
    assert_eq!(draws[1].constants.diffuse, [1.0; 4]);
}

#[test]
fn test_lights_and_caps() {
    let mut driver = driver();
    assert_eq!(driver.max_lights(), 8);
    driver.set_light(7, &Light::default()).unwrap();
    assert!(driver.is_light_enabled(7));
    driver.disable_light(7).unwrap();
    assert!(!driver.is_light_enabled(7));
    assert!(matches!(
        driver.set_light(8, &Light::default()),
        Err(DriverError::CapacityExceeded { what: "light", limit: 8 })
    ));
    assert!(driver.supports_hardware_transform_and_light());
    assert_eq!(driver.max_texture_size(), (4096, 4096));
}

#[test]
fn test_sampler_states() {
    let mut driver = driver();
    driver.set_sampler_state(0, SamplerState::MagFilter, 2).unwrap();
    assert_eq!(driver.sampler_state(0, SamplerState::MagFilter), Ok(2));
    assert!(driver.set_sampler_state(8, SamplerState::MagFilter, 2).is_err());
    assert!(driver.sampler_state(8, SamplerState::MagFilter).is_err());
}

#[test]
fn test_viewport_validation() {
    let mut driver = driver();
    assert_eq!(driver.viewport(), Viewport::new(0, 0, 640, 480));
    assert!(driver.set_viewport(Viewport::new(0, 0, 0, 10)).is_err());
    driver.set_viewport(Viewport::new(10, 10, 100, 100)).unwrap();
    assert_eq!(driver.viewport().x, 10);
}

#[test]
fn test_flush_and_wait_for_gpu_release_resources() {
    let mut driver = driver();
    let buffer = bind_triangle(&mut driver);
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    driver.destroy_vertex_buffer(buffer).unwrap();
    assert_eq!(driver.pending_destructions(), 1);
    driver.flush().unwrap();
    assert_eq!(driver.pending_destructions(), 0);

    run_frame(&mut driver, |_| {});
    driver.wait_for_gpu().unwrap();
    assert!(!driver.device().is_slot_in_flight(0));
    assert!(!driver.device().is_slot_in_flight(1));
}

#[test]
fn test_shutdown_is_idempotent_and_releases_everything() {
    let mut driver = driver();
    bind_triangle(&mut driver);
    let desc = TextureDescriptor::new_2d(8, 8, TextureFormat::A8R8G8B8, 1);
    driver.create_texture(&desc, None).unwrap();
    run_frame(&mut driver, |d| {
        d.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    });
    driver.begin_frame().unwrap();

    driver.shutdown();
    assert!(!driver.is_initialized());
    assert_eq!(driver.device().live_objects(), 0);
    assert_eq!(driver.frame_state(), FrameState::Idle);
    driver.shutdown();

    // 可以重新初始化
    driver.initialize(None, 320, 240, false).unwrap();
    assert_eq!(driver.display_size(), (320, 240));
}

#[test]
fn test_initialize_twice_fails() {
    let mut driver = driver();
    assert!(driver.initialize(None, 640, 480, false).is_err());
    assert_eq!(driver.last_error(), "Driver already initialized");
    assert!(driver.backend_name() == "Software");
    assert_eq!(driver.backend_type(), BackendType::Software);
}

#[test]
fn test_fullscreen_flag() {
    let mut driver = driver();
    assert!(!driver.is_fullscreen());
    driver.set_fullscreen(true).unwrap();
    assert!(driver.is_fullscreen());
}
