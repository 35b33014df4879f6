//! 交换链、渲染通道和帧缓冲
//!
//! 每个帧槽位有自己的深度图像，帧缓冲按 `[槽位][交换链图像]` 组织，
//! 两个在飞的帧不会共享深度附件。

use std::sync::Arc;

use tracing::{debug, info, warn};
use vulkano::format::Format;
use vulkano::image::view::ImageView;
use vulkano::image::{Image, ImageCreateInfo, ImageType, ImageUsage};
use vulkano::memory::allocator::AllocationCreateInfo;
use vulkano::render_pass::{Framebuffer, FramebufferCreateInfo, RenderPass};
use vulkano::swapchain::{PresentMode, Swapchain, SwapchainCreateInfo};

use super::context::VulkanContext;
use super::convert::classify;
use crate::core::error::{DriverError, DriverResult};
use crate::gfx::sync::FRAMES_IN_FLIGHT;

pub const DEPTH_FORMAT: Format = Format::D32_SFLOAT;

pub struct SwapchainTargets {
    pub swapchain: Arc<Swapchain>,
    pub render_pass: Arc<RenderPass>,
    /// `[槽位][交换链图像]`
    pub framebuffers: Vec<Vec<Arc<Framebuffer>>>,
    pub extent: [u32; 2],
}

impl SwapchainTargets {
    pub fn new(context: &VulkanContext, extent: [u32; 2], vsync: bool) -> DriverResult<Self> {
        let caps = context
            .physical
            .surface_capabilities(&context.surface, Default::default())
            .map_err(|e| classify("Failed to get surface capabilities", e))?;
        let formats = context
            .physical
            .surface_formats(&context.surface, Default::default())
            .map_err(|e| classify("Failed to get surface formats", e))?;

        let image_format = formats
            .iter()
            .map(|(format, _)| *format)
            .find(|format| *format == Format::B8G8R8A8_UNORM)
            .or_else(|| formats.first().map(|(format, _)| *format))
            .ok_or_else(|| DriverError::Initialization("No surface formats available".into()))?;

        let composite_alpha = caps
            .supported_composite_alpha
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Initialization("No supported composite alpha modes".into()))?;

        let mut min_image_count = caps.min_image_count.max(2);
        if let Some(max) = caps.max_image_count {
            min_image_count = min_image_count.min(max);
        }
        let image_extent = caps.current_extent.unwrap_or(extent);

        let create = |present_mode: PresentMode| {
            Swapchain::new(
                context.device.clone(),
                context.surface.clone(),
                SwapchainCreateInfo {
                    min_image_count,
                    image_format,
                    image_extent,
                    image_usage: ImageUsage::COLOR_ATTACHMENT,
                    composite_alpha,
                    present_mode,
                    ..Default::default()
                },
            )
        };

        // Fifo 是唯一保证支持的模式
        let created = if vsync {
            create(PresentMode::Fifo)
        } else {
            create(PresentMode::Mailbox).or_else(|e| {
                warn!(error = ?e, "Mailbox present mode unavailable, using Fifo");
                create(PresentMode::Fifo)
            })
        };
        let (swapchain, images) =
            created.map_err(|e| classify("Failed to create swapchain", e))?;

        let render_pass = vulkano::single_pass_renderpass!(
            context.device.clone(),
            attachments: {
                color: {
                    format: swapchain.image_format(),
                    samples: 1,
                    load_op: Clear,
                    store_op: Store,
                },
                depth: {
                    format: DEPTH_FORMAT,
                    samples: 1,
                    load_op: Clear,
                    store_op: DontCare,
                }
            },
            pass: {
                color: [color],
                depth_stencil: {depth}
            }
        )
        .map_err(|e| classify("Failed to create render pass", e))?;

        let framebuffers = framebuffers(context, &render_pass, &images)?;

        info!(
            width = image_extent[0],
            height = image_extent[1],
            images = images.len(),
            format = ?image_format,
            vsync,
            "Swapchain created"
        );

        Ok(Self {
            swapchain,
            render_pass,
            framebuffers,
            extent: image_extent,
        })
    }

    /// 按新尺寸重建交换链和帧缓冲，渲染通道保持不变
    pub fn rebuild(&mut self, context: &VulkanContext, extent: [u32; 2]) -> DriverResult<()> {
        let (swapchain, images) = self
            .swapchain
            .recreate(SwapchainCreateInfo {
                image_extent: extent,
                ..self.swapchain.create_info()
            })
            .map_err(|e| classify("Failed to recreate swapchain", e))?;

        self.framebuffers = framebuffers(context, &self.render_pass, &images)?;
        self.swapchain = swapchain;
        self.extent = extent;

        debug!(
            width = extent[0],
            height = extent[1],
            images = images.len(),
            "Swapchain recreated"
        );
        Ok(())
    }
}

fn framebuffers(
    context: &VulkanContext,
    render_pass: &Arc<RenderPass>,
    images: &[Arc<Image>],
) -> DriverResult<Vec<Vec<Arc<Framebuffer>>>> {
    let extent = images
        .first()
        .map(|image| image.extent())
        .ok_or_else(|| DriverError::Backend("Swapchain has no images".into()))?;

    (0..FRAMES_IN_FLIGHT)
        .map(|_| {
            let depth_image = Image::new(
                context.memory_allocator.clone(),
                ImageCreateInfo {
                    image_type: ImageType::Dim2d,
                    format: DEPTH_FORMAT,
                    extent: [extent[0], extent[1], 1],
                    usage: ImageUsage::DEPTH_STENCIL_ATTACHMENT,
                    ..Default::default()
                },
                AllocationCreateInfo::default(),
            )
            .map_err(|e| classify("Failed to create depth image", e))?;
            let depth_view = ImageView::new_default(depth_image)
                .map_err(|e| classify("Failed to create depth image view", e))?;

            images
                .iter()
                .map(|image| {
                    let view = ImageView::new_default(image.clone())
                        .map_err(|e| classify("Failed to create image view", e))?;
                    Framebuffer::new(
                        render_pass.clone(),
                        FramebufferCreateInfo {
                            attachments: vec![view, depth_view.clone()],
                            ..Default::default()
                        },
                    )
                    .map_err(|e| classify("Failed to create framebuffer", e))
                })
                .collect::<DriverResult<Vec<_>>>()
        })
        .collect()
}
