use crate::error::Result;

/// GPU operations the presenter needs, independent of the graphics API.
///
/// Every method runs on the render thread. Handles are opaque to the
/// presenter and only ever passed back to the backend that created them.
pub trait RenderBackend {
    type Program;
    type Texture;

    /// Build a program drawing the textured quad.
    ///
    /// Vertex attributes are bound at fixed locations (position = 0,
    /// tex_coord = 1); the fragment stage samples the texture at binding 0
    /// through the sampler at binding 1. Compile or link failures come back
    /// as [`PipelineError::ShaderCompile`](crate::PipelineError::ShaderCompile).
    fn compile_program(&mut self, label: &str, vertex: &str, fragment: &str)
        -> Result<Self::Program>;

    /// Allocate an RGBA8 sRGB texture.
    fn create_texture(&mut self, width: u32, height: u32) -> Result<Self::Texture>;

    fn destroy_texture(&mut self, texture: Self::Texture);

    /// Replace the whole texture with tightly packed RGBA8 `rgba`.
    fn upload_texture(
        &mut self,
        texture: &Self::Texture,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<()>;

    /// Draw the two-triangle quad with `program` sampling `texture`, then
    /// present. With no texture the surface is only cleared.
    fn draw_quad(&mut self, program: &Self::Program, texture: Option<&Self::Texture>)
        -> Result<()>;

    fn resize_surface(&mut self, width: u32, height: u32);
}
