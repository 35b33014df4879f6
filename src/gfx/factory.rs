//! 驱动工厂
//!
//! `GraphicsContext` 取代全局驱动指针：它创建并持有唯一的驱动实例，
//! 调用方通过 `driver()` 拿到共享引用，关闭顺序由它负责。
//!
//! # 后端选择
//!
//! 优先级：显式请求 → `GRAPHICS_DRIVER` 环境变量 → 配置 → 平台默认（Vulkan）。
//! 名称大小写不敏感并接受常见别名；不支持的后端回退到第一个受支持的后端并给出警告。

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, warn};

use super::driver::GraphicsDriver;
use super::explicit::{DriverSettings, ExplicitDriver};
use super::headless::HeadlessDevice;
use super::types::BackendType;
use super::vulkan::VulkanDevice;
use crate::core::config::GraphicsConfig;

/// 读取后端名称的环境变量
pub const DRIVER_ENV_VAR: &str = "GRAPHICS_DRIVER";

/// 共享的驱动实例
pub type SharedDriver = Rc<RefCell<Box<dyn GraphicsDriver>>>;

/// 本构建可以实例化的后端，按回退优先级排列
pub fn supported_backends() -> Vec<BackendType> {
    BackendType::ALL
        .into_iter()
        .filter(|ty| is_supported_backend(*ty))
        .collect()
}

pub fn is_supported_backend(ty: BackendType) -> bool {
    matches!(ty, BackendType::Vulkan | BackendType::Software)
}

pub fn backend_display_name(ty: BackendType) -> &'static str {
    ty.display_name()
}

/// 名称到后端类型，未知名称返回 `None`
pub fn backend_type(name: &str) -> Option<BackendType> {
    BackendType::from_name(name)
}

/// 规范化后端名称（如 `"DX12"` → `"directx12"`）
pub fn normalize_backend_name(name: &str) -> Option<&'static str> {
    backend_type(name).map(|ty| ty.name())
}

/// 按优先级选择后端
///
/// `env` 是环境变量的原始值；无法识别的名称被忽略并警告。
pub fn select_backend(
    requested: Option<BackendType>,
    env: Option<&str>,
    configured: Option<BackendType>,
) -> BackendType {
    let from_env = env.and_then(|name| {
        let parsed = backend_type(name);
        if parsed.is_none() {
            warn!(name, var = DRIVER_ENV_VAR, "Unknown backend name in environment, ignoring");
        }
        parsed
    });

    let wanted = requested
        .or(from_env)
        .or(configured)
        .unwrap_or(BackendType::Vulkan);

    if is_supported_backend(wanted) {
        return wanted;
    }

    let fallback = supported_backends()
        .first()
        .copied()
        .unwrap_or(BackendType::Software);
    warn!(
        requested = backend_display_name(wanted),
        fallback = backend_display_name(fallback),
        "Requested backend is not supported, falling back"
    );
    fallback
}

/// 实例化后端驱动（尚未初始化）
pub fn create_backend_driver(ty: BackendType, settings: DriverSettings) -> Box<dyn GraphicsDriver> {
    match ty {
        BackendType::Vulkan => Box::new(ExplicitDriver::new(VulkanDevice::new(), settings)),
        _ => Box::new(ExplicitDriver::new(HeadlessDevice::new(), settings)),
    }
}

/// 图形上下文
///
/// 同一时刻最多持有一个驱动。
#[derive(Default)]
pub struct GraphicsContext {
    driver: Option<SharedDriver>,
}

impl GraphicsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置创建驱动
    ///
    /// 已有驱动时不会创建第二个：记录警告并返回现有驱动。
    pub fn create_driver(
        &mut self,
        config: &GraphicsConfig,
        requested: Option<BackendType>,
    ) -> SharedDriver {
        if let Some(existing) = &self.driver {
            warn!(
                backend = existing.borrow().backend_name(),
                "create_driver called while a driver exists; call shutdown first"
            );
            return Rc::clone(existing);
        }

        let env = std::env::var(DRIVER_ENV_VAR).ok();
        let ty = select_backend(requested, env.as_deref(), Some(config.backend));
        let driver: SharedDriver = Rc::new(RefCell::new(create_backend_driver(
            ty,
            DriverSettings::from_config(config),
        )));
        info!(backend = backend_display_name(ty), "Graphics driver created");
        self.driver = Some(Rc::clone(&driver));
        driver
    }

    /// 当前驱动
    pub fn driver(&self) -> Option<SharedDriver> {
        self.driver.clone()
    }

    pub fn has_driver(&self) -> bool {
        self.driver.is_some()
    }

    pub fn backend(&self) -> Option<BackendType> {
        self.driver.as_ref().map(|d| d.borrow().backend_type())
    }

    /// 替换当前驱动，替换一个不同的现有驱动时警告
    pub fn set_driver(&mut self, driver: Option<SharedDriver>) {
        if let (Some(current), Some(new)) = (&self.driver, &driver) {
            if !Rc::ptr_eq(current, new) {
                warn!(
                    old = current.borrow().backend_name(),
                    new = new.borrow().backend_name(),
                    "Replacing the active graphics driver"
                );
            }
        }
        self.driver = driver;
    }

    /// 关闭并释放驱动，可重复调用
    pub fn shutdown(&mut self) {
        if let Some(driver) = self.driver.take() {
            let mut driver = driver.borrow_mut();
            let backend = driver.backend_name().to_string();
            driver.shutdown();
            info!(backend = %backend, "Graphics context shut down");
        }
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
