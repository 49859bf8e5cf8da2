//! Closure "shaders" and the registry-backed compiler.
//!
//! The software driver cannot run SPIR-V; instead, shaders are Rust closures
//! registered under a name. [`SoftCompiler`] implements the core's
//! `ShaderCompiler` interface: compiling `ShaderSource::Text(name)` looks the
//! name up and returns the registered reflection plus an 8-byte bytecode
//! blob holding the registry key. The core never inspects bytecode, so the
//! scheme is invisible to it.

use chroma_render::driver::{
    CompiledShader, DebugTraceBinding, FeatureFlags, ShaderCompiler, ShaderSource,
};
use chroma_render::error::{Error, Result};
use chroma_render::pipeline::{ShaderReflection, ShaderStage};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Execution context of one compute invocation.
pub struct ComputeInvocation<'a> {
    pub global_id: [u32; 3],
    pub local_id: [u32; 3],
    pub workgroup_id: [u32; 3],
    pub num_workgroups: [u32; 3],
    pub local_size: [u32; 3],
    pub(crate) push_constants: &'a [u8],
    pub(crate) access: &'a mut dyn InvocationAccess,
}

/// Resource access granted to shader closures, resolved from the bound
/// descriptor sets by the interpreter.
pub(crate) trait InvocationAccess {
    fn image_store(&mut self, set: u32, binding: u32, coord: [i32; 3], texel: [f32; 4]);
    fn image_load(&mut self, set: u32, binding: u32, coord: [i32; 3]) -> [f32; 4];
    fn buffer_write(&mut self, set: u32, binding: u32, offset: u64, data: &[u8]);
    fn buffer_read(&mut self, set: u32, binding: u32, offset: u64, out: &mut [u8]);
    /// Appends a trace record if tracing is active for this invocation.
    fn trace(&mut self, line: u32, type_tag: u32, name: &str, values: &[u32]);
    fn trace_active(&self) -> bool;
}

impl<'a> ComputeInvocation<'a> {
    pub fn push_constants(&self) -> &[u8] {
        self.push_constants
    }

    pub fn push_f32(&self, offset: usize) -> f32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.push_constants[offset..offset + 4]);
        f32::from_bits(u32::from_le_bytes(b))
    }

    pub fn push_i32(&self, offset: usize) -> i32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.push_constants[offset..offset + 4]);
        i32::from_le_bytes(b)
    }

    pub fn image_store(&mut self, set: u32, binding: u32, coord: [i32; 3], texel: [f32; 4]) {
        self.access.image_store(set, binding, coord, texel);
    }

    pub fn image_load(&mut self, set: u32, binding: u32, coord: [i32; 3]) -> [f32; 4] {
        self.access.image_load(set, binding, coord)
    }

    pub fn buffer_write(&mut self, set: u32, binding: u32, offset: u64, data: &[u8]) {
        self.access.buffer_write(set, binding, offset, data);
    }

    pub fn buffer_write_f32(&mut self, set: u32, binding: u32, index: u64, value: f32) {
        self.access
            .buffer_write(set, binding, index * 4, &value.to_bits().to_le_bytes());
    }

    pub fn buffer_read(&mut self, set: u32, binding: u32, offset: u64, out: &mut [u8]) {
        self.access.buffer_read(set, binding, offset, out);
    }

    /// True when shader debugging selected this invocation.
    pub fn trace_active(&self) -> bool {
        self.access.trace_active()
    }

    pub fn trace_uint(&mut self, line: u32, name: &str, values: &[u32]) {
        self.access
            .trace(line, chroma_render::debug::TRACE_TYPE_UINT, name, values);
    }

    pub fn trace_float(&mut self, line: u32, name: &str, values: &[f32]) {
        let bits: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        self.access
            .trace(line, chroma_render::debug::TRACE_TYPE_FLOAT, name, &bits);
    }

    pub fn trace_void(&mut self, line: u32, name: &str) {
        self.access
            .trace(line, chroma_render::debug::TRACE_TYPE_VOID, name, &[]);
    }
}

/// Input of one vertex-shader invocation.
pub struct VertexInput<'a> {
    pub vertex_index: u32,
    pub instance_index: u32,
    pub push_constants: &'a [u8],
}

/// Clip-space position plus one vec4 varying, interpolated for fragments.
#[derive(Copy, Clone, Debug, Default)]
pub struct VertexOutput {
    pub position: [f32; 4],
    pub varying: [f32; 4],
}

/// Input of one fragment-shader invocation.
pub struct FragmentInput<'a> {
    pub frag_coord: [f32; 2],
    pub varying: [f32; 4],
    pub push_constants: &'a [u8],
}

pub type ComputeFn = Arc<dyn Fn(&mut ComputeInvocation<'_>) + Send + Sync>;
pub type VertexFn = Arc<dyn Fn(&VertexInput<'_>) -> VertexOutput + Send + Sync>;
pub type FragmentFn = Arc<dyn Fn(&FragmentInput<'_>) -> [f32; 4] + Send + Sync>;

#[derive(Clone)]
pub(crate) enum SoftShaderKind {
    Compute(ComputeFn),
    Vertex(VertexFn),
    Fragment(FragmentFn),
}

#[derive(Clone)]
pub(crate) struct SoftShader {
    pub kind: SoftShaderKind,
    pub reflection: ShaderReflection,
    pub trace_binding: Option<DebugTraceBinding>,
}

/// Shared shader registry; the compiler and the driver both hold it.
#[derive(Default)]
pub struct ShaderRegistry {
    shaders: Mutex<FxHashMap<String, (u64, SoftShader)>>,
    by_key: Mutex<FxHashMap<u64, SoftShader>>,
    next_key: Mutex<u64>,
}

impl ShaderRegistry {
    pub fn new() -> Arc<ShaderRegistry> {
        Arc::new(Default::default())
    }

    fn register(&self, name: &str, shader: SoftShader) {
        let key = {
            let mut next = self.next_key.lock();
            *next += 1;
            *next
        };
        self.by_key.lock().insert(key, shader.clone());
        self.shaders.lock().insert(name.to_owned(), (key, shader));
    }

    /// Registers a compute shader closure under `name`.
    pub fn register_compute(&self, name: &str, reflection: ShaderReflection, f: ComputeFn) {
        self.register(
            name,
            SoftShader {
                kind: SoftShaderKind::Compute(f),
                reflection,
                trace_binding: None,
            },
        );
    }

    /// Registers an *instrumented* compute shader: compiling it reports a
    /// debug-trace binding and the closure may call the `trace_*` helpers.
    pub fn register_compute_traced(
        &self,
        name: &str,
        reflection: ShaderReflection,
        trace_binding: DebugTraceBinding,
        f: ComputeFn,
    ) {
        self.register(
            name,
            SoftShader {
                kind: SoftShaderKind::Compute(f),
                reflection,
                trace_binding: Some(trace_binding),
            },
        );
    }

    pub fn register_vertex(&self, name: &str, reflection: ShaderReflection, f: VertexFn) {
        self.register(
            name,
            SoftShader {
                kind: SoftShaderKind::Vertex(f),
                reflection,
                trace_binding: None,
            },
        );
    }

    pub fn register_fragment(&self, name: &str, reflection: ShaderReflection, f: FragmentFn) {
        self.register(
            name,
            SoftShader {
                kind: SoftShaderKind::Fragment(f),
                reflection,
                trace_binding: None,
            },
        );
    }

    pub(crate) fn lookup_name(&self, name: &str) -> Option<(u64, SoftShader)> {
        self.shaders.lock().get(name).cloned()
    }

    pub(crate) fn lookup_key(&self, key: u64) -> Option<SoftShader> {
        self.by_key.lock().get(&key).cloned()
    }
}

pub(crate) fn bytecode_key(bytecode: &[u8]) -> Option<u64> {
    if bytecode.len() != 8 {
        return None;
    }
    let mut b = [0u8; 8];
    b.copy_from_slice(bytecode);
    Some(u64::from_le_bytes(b))
}

/// `ShaderCompiler` over the registry.
pub struct SoftCompiler {
    registry: Arc<ShaderRegistry>,
}

impl SoftCompiler {
    pub fn new(registry: Arc<ShaderRegistry>) -> SoftCompiler {
        SoftCompiler { registry }
    }
}

impl ShaderCompiler for SoftCompiler {
    fn compile(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        entry_point: &str,
        _features: FeatureFlags,
    ) -> Result<CompiledShader> {
        let name = match source {
            ShaderSource::Text(name) => name.as_str(),
            ShaderSource::Bytecode(_) => {
                return Err(Error::CompileFailed(
                    "the software compiler only accepts registered shader names".to_owned(),
                ));
            }
        };
        let (key, shader) = self.registry.lookup_name(name).ok_or_else(|| {
            Error::CompileFailed(format!("unknown shader {:?}", name))
        })?;
        let expected = match shader.kind {
            SoftShaderKind::Compute(_) => ShaderStage::Compute,
            SoftShaderKind::Vertex(_) => ShaderStage::Vertex,
            SoftShaderKind::Fragment(_) => ShaderStage::Fragment,
        };
        if expected != stage {
            return Err(Error::CompileFailed(format!(
                "shader {:?} is a {:?} shader, requested {:?}",
                name, expected, stage
            )));
        }
        Ok(CompiledShader {
            stage,
            entry_point: entry_point.to_owned(),
            bytecode: Arc::from(key.to_le_bytes().to_vec().into_boxed_slice()),
            reflection: shader.reflection.clone(),
            fingerprint: chroma_render::content_hash(name),
            debug_trace_binding: shader.trace_binding,
        })
    }
}
