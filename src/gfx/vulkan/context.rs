//! Vulkan 设备上下文
//!
//! 负责实例、窗口表面、物理设备选择、逻辑设备和各类分配器。
//! 交换链和帧资源由 [`VulkanDevice`](super::VulkanDevice) 管理。
//!
//! # 初始化流程
//!
//! 1. 加载 Vulkan 库，启用加载器支持的表面扩展
//! 2. 用 ash 按窗口句柄的平台创建 `VkSurfaceKHR`，再包装为 vulkano `Surface`
//! 3. 选择物理设备（独立显卡优先，队列族必须支持图形和该表面）
//! 4. 创建逻辑设备和队列，按设备能力启用可选特性
//! 5. 创建内存、命令缓冲区和描述符集分配器

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{debug, info};
use vulkano::command_buffer::allocator::{
    StandardCommandBufferAllocator, StandardCommandBufferAllocatorCreateInfo,
};
use vulkano::descriptor_set::allocator::StandardDescriptorSetAllocator;
use vulkano::device::physical::{PhysicalDevice, PhysicalDeviceType};
use vulkano::device::{
    Device, DeviceCreateInfo, DeviceExtensions, Features, Queue, QueueCreateInfo, QueueFlags,
};
use vulkano::instance::{Instance, InstanceCreateInfo, InstanceExtensions};
use vulkano::memory::allocator::StandardMemoryAllocator;
use vulkano::swapchain::{Surface, SurfaceApi};
use vulkano::{VulkanLibrary, VulkanObject};

use crate::core::error::{DriverError, DriverResult};
use crate::gfx::driver::WindowTarget;

/// Vulkan 核心对象
pub struct VulkanContext {
    pub instance: Arc<Instance>,
    pub physical: Arc<PhysicalDevice>,
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    pub surface: Arc<Surface>,
    pub memory_allocator: Arc<StandardMemoryAllocator>,
    pub command_buffer_allocator: StandardCommandBufferAllocator,
    pub descriptor_allocator: StandardDescriptorSetAllocator,
    /// 是否启用了线框/点填充
    pub non_solid_fill: bool,
}

impl VulkanContext {
    pub fn new(target: &WindowTarget) -> DriverResult<Self> {
        let library = VulkanLibrary::new()
            .map_err(|e| init_error(format!("Failed to load Vulkan library: {:?}", e)))?;

        // 只启用加载器实际支持的表面扩展
        let wanted = InstanceExtensions {
            khr_surface: true,
            khr_win32_surface: true,
            khr_xlib_surface: true,
            khr_xcb_surface: true,
            khr_wayland_surface: true,
            ..InstanceExtensions::empty()
        };
        let enabled_extensions = wanted.intersection(library.supported_extensions());
        if !enabled_extensions.khr_surface {
            return Err(init_error("Vulkan loader has no VK_KHR_surface support"));
        }

        let instance = Instance::new(
            library,
            InstanceCreateInfo {
                application_name: Some(env!("CARGO_PKG_NAME").to_string()),
                enabled_extensions,
                ..Default::default()
            },
        )
        .map_err(|e| init_error(format!("Failed to create Vulkan instance: {:?}", e)))?;

        debug!("Vulkan instance created");

        let surface = create_surface(&instance, target)?;

        debug!("Vulkan surface created");

        let device_extensions = DeviceExtensions {
            khr_swapchain: true,
            ..DeviceExtensions::empty()
        };

        // 优先级：独立显卡 > 集成显卡 > 虚拟显卡 > CPU > 其他
        let (physical, queue_family_index) = instance
            .enumerate_physical_devices()
            .map_err(|e| init_error(format!("Failed to enumerate physical devices: {:?}", e)))?
            .filter(|p| p.supported_extensions().contains(&device_extensions))
            .filter_map(|p| {
                p.queue_family_properties()
                    .iter()
                    .enumerate()
                    .position(|(i, q)| {
                        q.queue_flags.intersects(QueueFlags::GRAPHICS)
                            && p.surface_support(i as u32, &surface).unwrap_or(false)
                    })
                    .map(|i| (p, i as u32))
            })
            .min_by_key(|(p, _)| match p.properties().device_type {
                PhysicalDeviceType::DiscreteGpu => 0,
                PhysicalDeviceType::IntegratedGpu => 1,
                PhysicalDeviceType::VirtualGpu => 2,
                PhysicalDeviceType::Cpu => 3,
                PhysicalDeviceType::Other => 4,
                _ => 5,
            })
            .ok_or_else(|| init_error("No suitable physical device found"))?;

        info!(
            device_name = physical.properties().device_name,
            device_type = ?physical.properties().device_type,
            "Using device"
        );
        debug!(queue_family_index, "Queue family index");

        let supported = physical.supported_features();
        let enabled_features = Features {
            fill_mode_non_solid: supported.fill_mode_non_solid,
            texture_compression_bc: supported.texture_compression_bc,
            sampler_anisotropy: supported.sampler_anisotropy,
            ..Features::empty()
        };

        let (device, mut queues) = Device::new(
            Arc::clone(&physical),
            DeviceCreateInfo {
                enabled_extensions: device_extensions,
                enabled_features,
                queue_create_infos: vec![QueueCreateInfo {
                    queue_family_index,
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .map_err(|e| init_error(format!("Failed to create logical device: {:?}", e)))?;

        let queue = queues
            .next()
            .ok_or_else(|| init_error("Logical device returned no queue"))?;

        let memory_allocator = Arc::new(StandardMemoryAllocator::new_default(device.clone()));
        let command_buffer_allocator = StandardCommandBufferAllocator::new(
            device.clone(),
            StandardCommandBufferAllocatorCreateInfo::default(),
        );
        let descriptor_allocator =
            StandardDescriptorSetAllocator::new(device.clone(), Default::default());

        info!(
            non_solid_fill = enabled_features.fill_mode_non_solid,
            bc_textures = enabled_features.texture_compression_bc,
            "Vulkan context initialized"
        );

        Ok(Self {
            instance,
            physical,
            device,
            queue,
            surface,
            memory_allocator,
            command_buffer_allocator,
            descriptor_allocator,
            non_solid_fill: enabled_features.fill_mode_non_solid,
        })
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue.queue_family_index()
    }
}

fn init_error(message: impl Into<String>) -> DriverError {
    DriverError::Initialization(message.into())
}

/// 按窗口句柄的平台创建表面
///
/// winit 0.29 提供 raw-window-handle 0.6 的句柄，vulkano 0.34 只接受 0.5，
/// 所以直接通过 ash 调用平台表面扩展。
fn create_surface(instance: &Arc<Instance>, target: &WindowTarget) -> DriverResult<Arc<Surface>> {
    let extensions = instance.enabled_extensions();
    let entry = unsafe { ash::Entry::load() }
        .map_err(|e| init_error(format!("Failed to load Vulkan entry: {}", e)))?;
    let ash_instance = unsafe { ash::Instance::load(entry.static_fn(), instance.handle()) };

    let (created, api) = match (target.window, target.display) {
        (RawWindowHandle::Win32(window), _) if extensions.khr_win32_surface => {
            let loader = ash::extensions::khr::Win32Surface::new(&entry, &ash_instance);
            let hinstance = window.hinstance.map_or(0, |h| h.get());
            let info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance as vk::HINSTANCE)
                .hwnd(window.hwnd.get() as vk::HWND);
            (unsafe { loader.create_win32_surface(&info, None) }, SurfaceApi::Win32)
        }
        (RawWindowHandle::Xlib(window), RawDisplayHandle::Xlib(display))
            if extensions.khr_xlib_surface =>
        {
            let dpy = display
                .display
                .ok_or_else(|| init_error("Xlib display handle is null"))?;
            let loader = ash::extensions::khr::XlibSurface::new(&entry, &ash_instance);
            let info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut vk::Display)
                .window(window.window);
            (unsafe { loader.create_xlib_surface(&info, None) }, SurfaceApi::Xlib)
        }
        (RawWindowHandle::Xcb(window), RawDisplayHandle::Xcb(display))
            if extensions.khr_xcb_surface =>
        {
            let connection = display
                .connection
                .ok_or_else(|| init_error("XCB connection handle is null"))?;
            let loader = ash::extensions::khr::XcbSurface::new(&entry, &ash_instance);
            let info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr() as *mut vk::xcb_connection_t)
                .window(window.window.get());
            (unsafe { loader.create_xcb_surface(&info, None) }, SurfaceApi::Xcb)
        }
        (RawWindowHandle::Wayland(window), RawDisplayHandle::Wayland(display))
            if extensions.khr_wayland_surface =>
        {
            let loader = ash::extensions::khr::WaylandSurface::new(&entry, &ash_instance);
            let info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut vk::wl_display)
                .surface(window.surface.as_ptr() as *mut vk::wl_surface);
            (unsafe { loader.create_wayland_surface(&info, None) }, SurfaceApi::Wayland)
        }
        (window, _) => {
            return Err(DriverError::Unsupported(format!(
                "No Vulkan surface extension for window handle {:?}",
                window
            )))
        }
    };

    let handle = created.map_err(|e| init_error(format!("Failed to create surface: {:?}", e)))?;
    // 表面句柄由 vulkano 接管，drop 时销毁
    let surface = unsafe { Surface::from_handle(Arc::clone(instance), handle, api, None) };
    Ok(Arc::new(surface))
}
