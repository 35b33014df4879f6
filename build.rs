/// Build script for legacy_render
///
/// # Shader Compilation Strategy:
/// - Vulkan: the default fixed-function shaders are GLSL compiled at build time via the vulkano_shaders macro
/// - Caller shaders are SPIR-V blobs handed to the driver at runtime
fn main() {
    // Trigger rebuild if shader files change
    println!("cargo:rerun-if-changed=src/gfx/vulkan/shaders/fixed.vert");
    println!("cargo:rerun-if-changed=src/gfx/vulkan/shaders/fixed.frag");
}
