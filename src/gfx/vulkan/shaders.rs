// 固定管线着色器
// 使用 vulkano_shaders 宏在编译期从 GLSL 源文件生成 SPIR-V

pub mod fixed_vs {
    vulkano_shaders::shader! {
        ty: "vertex",
        path: "src/gfx/vulkan/shaders/fixed.vert",
    }
}

pub mod fixed_fs {
    vulkano_shaders::shader! {
        ty: "fragment",
        path: "src/gfx/vulkan/shaders/fixed.frag",
    }
}
