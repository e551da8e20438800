use crate::blit::{self, STAGING_STRIDE};
use crate::{PresentError, PresenterInitError, STAGING_DIM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectMode {
    /// Stretch to fill the surface.
    Stretch,
    /// Preserve aspect ratio (letterboxing/pillarboxing).
    #[default]
    FitKeepAspect,
    /// Preserve aspect ratio using an integer scale factor when possible.
    ///
    /// Falls back to `FitKeepAspect` when the surface is smaller than the
    /// frame.
    IntegerScale,
}

impl AspectMode {
    fn as_u32(self) -> u32 {
        match self {
            AspectMode::Stretch => 0,
            AspectMode::FitKeepAspect => 1,
            AspectMode::IntegerScale => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfaceAcquireErrorAction {
    /// Drop the frame and continue rendering.
    DropFrame,
    /// Reconfigure the surface and retry once.
    ReconfigureAndRetry,
    /// Treat the error as fatal.
    Fatal,
}

fn surface_acquire_error_action(err: &wgpu::SurfaceError) -> SurfaceAcquireErrorAction {
    match err {
        wgpu::SurfaceError::Timeout => SurfaceAcquireErrorAction::DropFrame,
        wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => {
            SurfaceAcquireErrorAction::ReconfigureAndRetry
        }
        wgpu::SurfaceError::OutOfMemory => SurfaceAcquireErrorAction::Fatal,
    }
}

/// Presents the emulator framebuffer to a `wgpu` surface.
///
/// The staging texture is created once at full capacity; resolution changes
/// only move the uploaded sub-region and the sampled UV extent, so no GPU
/// resources are recreated when the guest resizes.
pub struct Presenter<'s> {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'s>,
    config: wgpu::SurfaceConfiguration,
    srgb_encode: bool,

    pipeline: wgpu::RenderPipeline,
    bind_group: wgpu::BindGroup,
    uniform_buffer: wgpu::Buffer,
    staging_texture: wgpu::Texture,
    /// CPU staging image, fixed stride.
    staging: Vec<u8>,

    frame_width: u32,
    frame_height: u32,
    aspect_mode: AspectMode,
}

impl<'s> Presenter<'s> {
    pub async fn new(
        instance: &wgpu::Instance,
        surface: wgpu::Surface<'s>,
        surface_width: u32,
        surface_height: u32,
    ) -> Result<Self, PresenterInitError> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                force_fallback_adapter: false,
                compatible_surface: Some(&surface),
            })
            .await
            .ok_or(PresenterInitError::NoAdapter)?;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("varvara presenter device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = preferred_surface_format(&surface_caps.formats);
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: surface_width.max(1),
            height: surface_height.max(1),
            present_mode: preferred_present_mode(&surface_caps.present_modes),
            alpha_mode: preferred_composite_alpha_mode(&surface_caps.alpha_modes),
            desired_maximum_frame_latency: 2,
            view_formats: vec![],
        };
        surface.configure(&device, &config);
        let srgb_encode = !surface_format.is_srgb();

        let uniform_min_binding_size =
            wgpu::BufferSize::new(std::mem::size_of::<PresentUniforms>() as u64);
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("varvara presenter bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: uniform_min_binding_size,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("varvara presenter shader"),
            source: wgpu::ShaderSource::Wgsl(PRESENT_WGSL.into()),
        });

        let pipeline = create_present_pipeline(&device, &bind_group_layout, &shader, surface_format);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("varvara presenter sampler"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("varvara presenter uniforms"),
            size: std::mem::size_of::<PresentUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let staging_texture = create_staging_texture(&device);
        let view = staging_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("varvara presenter bind group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        let mut presenter = Self {
            device,
            queue,
            surface,
            config,
            srgb_encode,
            pipeline,
            bind_group,
            uniform_buffer,
            staging_texture,
            staging: vec![0; STAGING_STRIDE * STAGING_DIM as usize],
            frame_width: 0,
            frame_height: 0,
            aspect_mode: AspectMode::default(),
        };
        presenter.write_uniforms();
        Ok(presenter)
    }

    pub fn set_aspect_mode(&mut self, mode: AspectMode) {
        self.aspect_mode = mode;
        self.write_uniforms();
    }

    /// Called when the host window changes size.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.surface.configure(&self.device, &self.config);
        self.write_uniforms();
    }

    /// Called once per resolution change, when the resize flag is observed.
    /// Rederives the quad geometry and the sampled UV extent.
    pub fn set_frame_size(&mut self, width: u32, height: u32) -> Result<(), PresentError> {
        if width > STAGING_DIM || height > STAGING_DIM {
            return Err(PresentError::FrameTooLarge { width, height });
        }
        self.frame_width = width;
        self.frame_height = height;
        self.write_uniforms();
        Ok(())
    }

    /// Converts, uploads, and draws one BGRA frame at the current frame
    /// size. Recoverable surface trouble is handled here: timeouts drop the
    /// frame, lost or outdated swapchains reconfigure and retry once.
    pub fn present_bgra(&mut self, pixels: &[u8]) -> Result<(), PresentError> {
        let (w, h) = (self.frame_width, self.frame_height);
        if w == 0 || h == 0 {
            return Ok(());
        }
        let expected = w as usize * h as usize * 4;
        if pixels.len() != expected {
            return Err(PresentError::InvalidFramebufferLength {
                expected,
                actual: pixels.len(),
            });
        }
        blit::blit_bgra(pixels, w, h, &mut self.staging);
        upload_frame(&self.queue, &self.staging_texture, &self.staging, w, h);
        self.draw()
    }

    /// Maps a surface position to frame coordinates through the same
    /// geometry the shader uses. The result may fall outside the frame;
    /// callers clamp.
    pub fn surface_to_frame(&self, x: f64, y: f64) -> (i32, i32) {
        let mapped = surface_to_frame(
            [self.config.width as f32, self.config.height as f32],
            [self.frame_width as f32, self.frame_height as f32],
            self.aspect_mode,
            [x as f32, y as f32],
        );
        (mapped[0].floor() as i32, mapped[1].floor() as i32)
    }

    fn write_uniforms(&mut self) {
        let uniforms = PresentUniforms {
            output_size: [self.config.width as f32, self.config.height as f32],
            input_size: [self.frame_width as f32, self.frame_height as f32],
            uv_extent: [
                self.frame_width as f32 / STAGING_DIM as f32,
                self.frame_height as f32 / STAGING_DIM as f32,
            ],
            mode: self.aspect_mode.as_u32(),
            srgb_encode: if self.srgb_encode { 1 } else { 0 },
            _pad: [0; 2],
        };
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
    }

    fn draw(&mut self) -> Result<(), PresentError> {
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(err) => match surface_acquire_error_action(&err) {
                SurfaceAcquireErrorAction::DropFrame => {
                    tracing::warn!("surface timeout during present; dropping frame");
                    return Ok(());
                }
                SurfaceAcquireErrorAction::ReconfigureAndRetry => {
                    // Window resize / swap chain invalidation.
                    self.surface.configure(&self.device, &self.config);
                    match self.surface.get_current_texture() {
                        Ok(frame) => frame,
                        Err(err) => match surface_acquire_error_action(&err) {
                            SurfaceAcquireErrorAction::Fatal => return Err(err.into()),
                            SurfaceAcquireErrorAction::DropFrame
                            | SurfaceAcquireErrorAction::ReconfigureAndRetry => {
                                tracing::warn!(
                                    "surface acquire failed after reconfigure; dropping frame: {err:?}"
                                );
                                return Ok(());
                            }
                        },
                    }
                }
                SurfaceAcquireErrorAction::Fatal => return Err(err.into()),
            },
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("varvara presenter encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("varvara presenter pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        frame.present();
        Ok(())
    }
}

/// The one render pipeline this crate needs: a vertex-bufferless fullscreen
/// triangle with the aspect-mode fragment shader writing opaque color.
fn create_present_pipeline(
    device: &wgpu::Device,
    bind_group_layout: &wgpu::BindGroupLayout,
    shader: &wgpu::ShaderModule,
    color_format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("varvara presenter pipeline layout"),
        bind_group_layouts: &[bind_group_layout],
        push_constant_ranges: &[],
    });
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("varvara presenter pipeline"),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: "vs_main",
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format: color_format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
    })
}

fn create_staging_texture(device: &wgpu::Device) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("varvara presenter staging texture"),
        size: wgpu::Extent3d {
            width: STAGING_DIM,
            height: STAGING_DIM,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

/// Uploads the valid `width x height` sub-region of the staging buffer.
/// The fixed row stride is already 256-byte aligned, so no repack copy is
/// needed.
fn upload_frame(
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    staging: &[u8],
    width: u32,
    height: u32,
) {
    if width == 0 || height == 0 {
        return;
    }
    let needed = (height as usize - 1) * STAGING_STRIDE + width as usize * 4;
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &staging[..needed],
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(STAGING_STRIDE as u32),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}

/// Inverse of the shader's quad placement: surface position to frame
/// coordinates.
fn surface_to_frame(surface: [f32; 2], frame: [f32; 2], mode: AspectMode, pos: [f32; 2]) -> [f32; 2] {
    if frame[0] <= 0.0 || frame[1] <= 0.0 {
        return [0.0, 0.0];
    }
    if mode == AspectMode::Stretch {
        return [
            pos[0] / surface[0] * frame[0],
            pos[1] / surface[1] * frame[1],
        ];
    }
    let mut scale = (surface[0] / frame[0]).min(surface[1] / frame[1]);
    if mode == AspectMode::IntegerScale {
        let int_scale = scale.floor();
        if int_scale >= 1.0 {
            scale = int_scale;
        }
    }
    let scaled = [frame[0] * scale, frame[1] * scale];
    let offset = [(surface[0] - scaled[0]) * 0.5, (surface[1] - scaled[1]) * 0.5];
    [(pos[0] - offset[0]) / scale, (pos[1] - offset[1]) / scale]
}

fn preferred_surface_format(formats: &[wgpu::TextureFormat]) -> wgpu::TextureFormat {
    // Explicit preference order so behavior is deterministic even if the
    // backend enumerates formats in different orders.
    for &preferred in [
        wgpu::TextureFormat::Bgra8UnormSrgb,
        wgpu::TextureFormat::Rgba8UnormSrgb,
        wgpu::TextureFormat::Bgra8Unorm,
        wgpu::TextureFormat::Rgba8Unorm,
    ]
    .iter()
    {
        if formats.contains(&preferred) {
            return preferred;
        }
    }
    formats
        .first()
        .copied()
        .unwrap_or(wgpu::TextureFormat::Bgra8Unorm)
}

fn preferred_present_mode(modes: &[wgpu::PresentMode]) -> wgpu::PresentMode {
    // Fifo is universally supported and gives vsync pacing.
    if modes.contains(&wgpu::PresentMode::Fifo) {
        return wgpu::PresentMode::Fifo;
    }
    modes.first().copied().unwrap_or(wgpu::PresentMode::Fifo)
}

fn preferred_composite_alpha_mode(modes: &[wgpu::CompositeAlphaMode]) -> wgpu::CompositeAlphaMode {
    if modes.contains(&wgpu::CompositeAlphaMode::Opaque) {
        return wgpu::CompositeAlphaMode::Opaque;
    }
    modes
        .first()
        .copied()
        .unwrap_or(wgpu::CompositeAlphaMode::Opaque)
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PresentUniforms {
    output_size: [f32; 2],
    input_size: [f32; 2],
    uv_extent: [f32; 2],
    mode: u32,
    srgb_encode: u32,
    _pad: [u32; 2],
}

const PRESENT_WGSL: &str = r#"
struct Uniforms {
    output_size: vec2<f32>,
    input_size: vec2<f32>,
    uv_extent: vec2<f32>,
    mode: u32,
    srgb_encode: u32,
    _pad: vec2<u32>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(0) @binding(1) var src_tex: texture_2d<f32>;
@group(0) @binding(2) var src_samp: sampler;

fn linear_to_srgb_channel(x: f32) -> f32 {
    let xc = max(x, 0.0);
    if (xc <= 0.0031308) {
        return xc * 12.92;
    }
    return 1.055 * pow(xc, 1.0 / 2.4) - 0.055;
}

fn encode_output(color: vec4<f32>) -> vec4<f32> {
    // Scanout is opaque regardless of the source alpha.
    if (u.srgb_encode == 0u) {
        return vec4<f32>(color.rgb, 1.0);
    }
    return vec4<f32>(
        linear_to_srgb_channel(color.r),
        linear_to_srgb_channel(color.g),
        linear_to_srgb_channel(color.b),
        1.0,
    );
}

fn sample_frame(uv: vec2<f32>) -> vec4<f32> {
    // Only the valid sub-region of the staging image is ever sampled.
    return textureSample(src_tex, src_samp, uv * u.uv_extent);
}

@vertex
fn vs_main(@builtin(vertex_index) idx: u32) -> @builtin(position) vec4<f32> {
    var pos = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>( 3.0, -1.0),
        vec2<f32>(-1.0,  3.0),
    );
    return vec4<f32>(pos[idx], 0.0, 1.0);
}

@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    if (u.mode == 0u) {
        return encode_output(sample_frame(pos.xy / u.output_size));
    }

    let dst = u.output_size;
    let src = u.input_size;

    var scale = min(dst.x / src.x, dst.y / src.y);
    if (u.mode == 2u) {
        let int_scale = floor(scale);
        if (int_scale >= 1.0) {
            scale = int_scale;
        }
    }

    let scaled = src * scale;
    let offset = (dst - scaled) * 0.5;
    let p = pos.xy - offset;

    if (p.x < 0.0 || p.y < 0.0 || p.x >= scaled.x || p.y >= scaled.y) {
        return encode_output(vec4<f32>(0.0, 0.0, 0.0, 1.0));
    }

    return encode_output(sample_frame(p / scaled));
}
"#;
