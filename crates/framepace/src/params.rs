//! Per-frame parameter buffer.
//!
//! The parameter buffer travels next to the pixel buffer and carries the
//! shader inputs the compositor's renderer consumes. Its layout is fixed and
//! shared with the renderer:
//!
//! ```text
//! offset  size  field
//! ──────  ────  ─────────────────────────────────────────────
//!      0    64  proj      mat4, row-major identity
//!     64     4  alpha     float
//!     68     8  size      vec2 (width, height)
//!     76    64  4 × { position: vec2, texcoord: vec2 }
//!               top-left, bottom-left, top-right, bottom-right
//! ──────  ────
//!           140 bytes total (35 floats)
//! ```
//!
//! Floats are native-endian; both ends of the shared mapping run on the same
//! machine.

/// Number of bytes in one encoded parameter block.
pub const PARAMETER_BLOCK_SIZE: usize = 140;

/// Byte offset of the transform matrix.
pub const TRANSFORM_OFFSET: usize = 0;
/// Byte offset of the opacity scalar.
pub const OPACITY_OFFSET: usize = 64;
/// Byte offset of the size vector.
pub const SIZE_OFFSET: usize = 68;
/// Byte offset of the first vertex.
pub const VERTICES_OFFSET: usize = 76;
/// Bytes per vertex (position + texcoord).
pub const VERTEX_STRIDE: usize = 16;
/// Vertices in the quad.
pub const QUAD_VERTICES: usize = 4;

/// Row-major 4×4 identity.
pub const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

// =============================================================================
// Layout description
// =============================================================================

/// Size class of a shader variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableSize {
    Float,
    Vec2,
    Mat4,
}

impl VariableSize {
    /// Number of f32 components.
    pub const fn floats(self) -> usize {
        match self {
            Self::Float => 1,
            Self::Vec2 => 2,
            Self::Mat4 => 16,
        }
    }

    pub const fn bytes(self) -> usize {
        self.floats() * size_of::<f32>()
    }
}

/// How the renderer binds a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Written once per block.
    Uniform,
    /// Written once per vertex, interleaved with the other attributes.
    VertexAttribute,
}

/// A named field of the parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterField {
    pub name: &'static str,
    pub binding: Binding,
    pub size: VariableSize,
}

/// Ordered description of a parameter block, as declared to the compositor.
///
/// Uniforms come first in declaration order, followed by `vertex_count`
/// interleaved copies of the vertex attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    fields: &'static [ParameterField],
    vertex_count: usize,
}

/// The quad layout the pipeline uses.
pub const QUAD_LAYOUT: ParameterLayout = ParameterLayout {
    fields: &[
        ParameterField {
            name: "proj",
            binding: Binding::Uniform,
            size: VariableSize::Mat4,
        },
        ParameterField {
            name: "alpha",
            binding: Binding::Uniform,
            size: VariableSize::Float,
        },
        ParameterField {
            name: "size",
            binding: Binding::Uniform,
            size: VariableSize::Vec2,
        },
        ParameterField {
            name: "position",
            binding: Binding::VertexAttribute,
            size: VariableSize::Vec2,
        },
        ParameterField {
            name: "texcoord",
            binding: Binding::VertexAttribute,
            size: VariableSize::Vec2,
        },
    ],
    vertex_count: QUAD_VERTICES,
};

const _: () = assert!(QUAD_LAYOUT.total_size() == PARAMETER_BLOCK_SIZE);
const _: () = assert!(VERTICES_OFFSET + QUAD_VERTICES * VERTEX_STRIDE == PARAMETER_BLOCK_SIZE);

impl ParameterLayout {
    pub const fn fields(&self) -> &'static [ParameterField] {
        self.fields
    }

    pub const fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// Total encoded size in bytes.
    pub const fn total_size(&self) -> usize {
        let mut uniforms = 0;
        let mut per_vertex = 0;
        let mut i = 0;
        while i < self.fields.len() {
            let field = &self.fields[i];
            match field.binding {
                Binding::Uniform => uniforms += field.size.bytes(),
                Binding::VertexAttribute => per_vertex += field.size.bytes(),
            }
            i += 1;
        }
        uniforms + per_vertex * self.vertex_count
    }

    pub fn uniforms(&self) -> impl Iterator<Item = &ParameterField> {
        self.fields
            .iter()
            .filter(|f| f.binding == Binding::Uniform)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &ParameterField> {
        self.fields
            .iter()
            .filter(|f| f.binding == Binding::VertexAttribute)
    }
}

// =============================================================================
// Block values
// =============================================================================

/// One corner of the quad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub texcoord: [f32; 2],
}

/// Decoded contents of a parameter block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterBlock {
    pub transform: [f32; 16],
    pub opacity: f32,
    pub size: [f32; 2],
    pub vertices: [QuadVertex; QUAD_VERTICES],
}

impl ParameterBlock {
    /// Identity transform and a quad covering `(0,0)-(width,height)`.
    pub fn quad(width: f32, height: f32, opacity: f32) -> Self {
        let corner = |x: f32, y: f32| QuadVertex {
            position: [x * width, y * height],
            texcoord: [x, y],
        };

        Self {
            transform: IDENTITY,
            opacity,
            size: [width, height],
            vertices: [
                corner(0.0, 0.0),
                corner(0.0, 1.0),
                corner(1.0, 0.0),
                corner(1.0, 1.0),
            ],
        }
    }

    /// Write the block at the start of `buf`. Returns the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, LayoutError> {
        let buf = block_mut(buf)?;

        let mut w = FloatWriter { buf, offset: 0 };
        w.put_all(&self.transform);
        w.put(self.opacity);
        w.put_all(&self.size);
        for vertex in &self.vertices {
            w.put_all(&vertex.position);
            w.put_all(&vertex.texcoord);
        }
        debug_assert_eq!(w.offset, PARAMETER_BLOCK_SIZE);

        Ok(PARAMETER_BLOCK_SIZE)
    }

    /// Read a block from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        if buf.len() < PARAMETER_BLOCK_SIZE {
            return Err(LayoutError::BufferTooSmall {
                len: buf.len(),
                required: PARAMETER_BLOCK_SIZE,
            });
        }

        let float = |offset: usize| {
            f32::from_ne_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ])
        };
        let vec2 = |offset: usize| [float(offset), float(offset + 4)];

        let transform = std::array::from_fn(|i| float(TRANSFORM_OFFSET + i * 4));
        let vertices = std::array::from_fn(|i| {
            let base = VERTICES_OFFSET + i * VERTEX_STRIDE;
            QuadVertex {
                position: vec2(base),
                texcoord: vec2(base + 8),
            }
        });

        Ok(Self {
            transform,
            opacity: float(OPACITY_OFFSET),
            size: vec2(SIZE_OFFSET),
            vertices,
        })
    }
}

/// Encode the quad parameters for a `width × height` surface into `buf`.
pub fn encode(buf: &mut [u8], width: f32, height: f32, opacity: f32) -> Result<usize, LayoutError> {
    ParameterBlock::quad(width, height, opacity).encode_into(buf)
}

/// Decode a parameter block from `buf`.
pub fn decode(buf: &[u8]) -> Result<ParameterBlock, LayoutError> {
    ParameterBlock::decode(buf)
}

fn block_mut(buf: &mut [u8]) -> Result<&mut [u8], LayoutError> {
    let len = buf.len();
    buf.get_mut(..PARAMETER_BLOCK_SIZE)
        .ok_or(LayoutError::BufferTooSmall {
            len,
            required: PARAMETER_BLOCK_SIZE,
        })
}

struct FloatWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl FloatWriter<'_> {
    #[inline]
    fn put(&mut self, value: f32) {
        self.buf[self.offset..self.offset + 4].copy_from_slice(&value.to_ne_bytes());
        self.offset += 4;
    }

    fn put_all(&mut self, values: &[f32]) {
        for &v in values {
            self.put(v);
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from encoding or decoding a parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// The buffer cannot hold a full block.
    BufferTooSmall { len: usize, required: usize },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferTooSmall { len, required } => {
                write!(
                    f,
                    "parameter buffer too small: {} bytes, need {}",
                    len, required
                )
            }
        }
    }
}

impl std::error::Error for LayoutError {}
