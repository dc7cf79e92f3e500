//! Runtime loaded from a shared library at run time.
//!
//! The library exports a small C ABI:
//!
//! ```text
//! u32 gemm_runtime_abi_version(void);
//! i32 gemm_runtime_session_create(const u8 *model, usize model_len,
//!                                 u32 backend, void **out_session);
//! u32 gemm_runtime_session_backend(void *session);
//! i32 gemm_runtime_session_run(void *session,
//!                              const f32 *a, usize a_len,
//!                              const f32 *b, usize b_len,
//!                              f32 *c, usize c_len);
//! void gemm_runtime_session_destroy(void *session);
//! ```
//!
//! Backends are encoded as `0` for CPU and `1` for GPU. A non-zero status is
//! a failure.

use super::onnx::{self, MatMulGraph};
use super::{ExecutionBackend, InferenceSession, RuntimeLoader, SessionBackend, Tensor, find_input};
use crate::errors::{HarnessError, HarnessResult};
use libloading::Library;
use log::info;
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::Arc;

pub const PLUGIN_ABI_VERSION: u32 = 1;

const BACKEND_CPU: u32 = 0;
const BACKEND_GPU: u32 = 1;

type SessionHandle = *mut c_void;

type AbiVersionFn = unsafe extern "C" fn() -> u32;
type SessionCreateFn = unsafe extern "C" fn(
    model: *const u8,
    model_len: usize,
    backend: u32,
    out_session: *mut SessionHandle,
) -> i32;
type SessionBackendFn = unsafe extern "C" fn(session: SessionHandle) -> u32;
type SessionRunFn = unsafe extern "C" fn(
    session: SessionHandle,
    a: *const f32,
    a_len: usize,
    b: *const f32,
    b_len: usize,
    c: *mut f32,
    c_len: usize,
) -> i32;
type SessionDestroyFn = unsafe extern "C" fn(session: SessionHandle);

#[derive(Clone, Copy)]
struct PluginFns {
    create: SessionCreateFn,
    backend: SessionBackendFn,
    run: SessionRunFn,
    destroy: SessionDestroyFn,
}

/// Opens the shared library at `path` when loaded.
#[derive(Debug, Clone)]
pub struct PluginRuntimeLoader {
    path: PathBuf,
}

impl PluginRuntimeLoader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RuntimeLoader for PluginRuntimeLoader {
    fn describe(&self) -> String {
        format!("runtime plugin {}", self.path.display())
    }

    fn load(&self) -> HarnessResult<Arc<dyn SessionBackend>> {
        // SAFETY: loading runs the library's initializers; the path is operator supplied.
        let lib = unsafe { Library::new(&self.path) }.map_err(|e| {
            HarnessError::runtime_load(format!("failed to open {}: {}", self.path.display(), e))
        })?;

        let abi_version: AbiVersionFn = load_symbol(&lib, b"gemm_runtime_abi_version\0")?;
        // SAFETY: the symbol takes no arguments and returns a plain integer.
        let version = unsafe { abi_version() };
        if version != PLUGIN_ABI_VERSION {
            return Err(HarnessError::runtime_load(format!(
                "{} exports ABI version {}, expected {}",
                self.path.display(),
                version,
                PLUGIN_ABI_VERSION
            )));
        }

        let fns = PluginFns {
            create: load_symbol(&lib, b"gemm_runtime_session_create\0")?,
            backend: load_symbol(&lib, b"gemm_runtime_session_backend\0")?,
            run: load_symbol(&lib, b"gemm_runtime_session_run\0")?,
            destroy: load_symbol(&lib, b"gemm_runtime_session_destroy\0")?,
        };
        info!("Loaded runtime plugin {}", self.path.display());

        Ok(Arc::new(PluginRuntime {
            name: self.describe(),
            fns,
            lib: Arc::new(lib),
        }))
    }
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> HarnessResult<T> {
    // SAFETY: symbol types match the plugin ABI documented above.
    let symbol = unsafe { lib.get::<T>(name) }.map_err(|e| {
        HarnessError::runtime_load(format!(
            "failed to resolve symbol {}: {}",
            String::from_utf8_lossy(&name[..name.len() - 1]),
            e
        ))
    })?;
    Ok(*symbol)
}

fn encode_backend(backend: ExecutionBackend) -> u32 {
    match backend {
        ExecutionBackend::Cpu => BACKEND_CPU,
        ExecutionBackend::Gpu => BACKEND_GPU,
    }
}

fn decode_backend(code: u32) -> ExecutionBackend {
    if code == BACKEND_GPU {
        ExecutionBackend::Gpu
    } else {
        ExecutionBackend::Cpu
    }
}

struct PluginRuntime {
    name: String,
    fns: PluginFns,
    lib: Arc<Library>,
}

impl SessionBackend for PluginRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_session(
        &self,
        model: &[u8],
        preference: ExecutionBackend,
    ) -> HarnessResult<Box<dyn InferenceSession>> {
        let graph = onnx::decode_matmul_model(model)?;

        let mut handle: SessionHandle = std::ptr::null_mut();
        // SAFETY: `model` outlives the call and `handle` is a valid out pointer.
        let status = unsafe {
            (self.fns.create)(
                model.as_ptr(),
                model.len(),
                encode_backend(preference),
                &mut handle as *mut SessionHandle,
            )
        };
        if status != 0 || handle.is_null() {
            return Err(HarnessError::session(format!(
                "plugin failed to create a session (status {})",
                status
            )));
        }

        // SAFETY: `handle` was just created by the plugin.
        let backend = decode_backend(unsafe { (self.fns.backend)(handle) });
        Ok(Box::new(PluginSession {
            fns: self.fns,
            handle: handle as usize,
            backend,
            graph,
            _lib: Arc::clone(&self.lib),
        }))
    }
}

struct PluginSession {
    fns: PluginFns,
    handle: usize,
    backend: ExecutionBackend,
    graph: MatMulGraph,
    _lib: Arc<Library>,
}

impl InferenceSession for PluginSession {
    fn selected_backend(&self) -> ExecutionBackend {
        self.backend
    }

    fn input_names(&self) -> Vec<String> {
        self.graph.input_names()
    }

    fn run(&mut self, inputs: &[Tensor]) -> HarnessResult<Vec<Tensor>> {
        let a = find_input(inputs, &self.graph.inputs[0].name)?;
        let b = find_input(inputs, &self.graph.inputs[1].name)?;
        let (m, _, n) = self.graph.dims();
        let mut c = vec![0.0f32; m * n];

        // SAFETY: every pointer is valid for the length passed alongside it.
        let status = unsafe {
            (self.fns.run)(
                self.handle as SessionHandle,
                a.data.as_ptr(),
                a.data.len(),
                b.data.as_ptr(),
                b.data.len(),
                c.as_mut_ptr(),
                c.len(),
            )
        };
        if status != 0 {
            return Err(HarnessError::session(format!(
                "plugin inference failed (status {})",
                status
            )));
        }

        Ok(vec![Tensor::new(self.graph.output.name.clone(), vec![m, n], c)?])
    }
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        // SAFETY: the handle is destroyed exactly once, before the library unloads.
        unsafe { (self.fns.destroy)(self.handle as SessionHandle) };
        self.handle = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_runtime_load_error() {
        let loader = PluginRuntimeLoader::new(PathBuf::from("/nonexistent/libgemm_runtime.so"));
        assert!(matches!(
            loader.load(),
            Err(HarnessError::RuntimeLoadError { .. })
        ));
    }

    #[test]
    fn test_backend_codes() {
        assert_eq!(decode_backend(encode_backend(ExecutionBackend::Gpu)), ExecutionBackend::Gpu);
        assert_eq!(decode_backend(encode_backend(ExecutionBackend::Cpu)), ExecutionBackend::Cpu);
        assert_eq!(decode_backend(7), ExecutionBackend::Cpu);
    }
}

/// Drives the session path through an in-process implementation of the ABI.
#[cfg(all(test, unix))]
mod plugin_session_tests {
    use super::*;
    use crate::runtime::onnx::encode_matmul_model;
    use std::slice;
    use std::sync::Mutex;

    /// Dimensions of every session the fake runtime has destroyed.
    static DESTROYED: Mutex<Vec<(usize, usize, usize)>> = Mutex::new(Vec::new());

    struct FakeSession {
        m: usize,
        k: usize,
        n: usize,
        backend: u32,
    }

    extern "C" fn fake_create(
        model: *const u8,
        model_len: usize,
        backend: u32,
        out_session: *mut SessionHandle,
    ) -> i32 {
        let model = unsafe { slice::from_raw_parts(model, model_len) };
        let Ok(graph) = onnx::decode_matmul_model(model) else {
            return 1;
        };
        let (m, k, n) = graph.dims();
        let session = Box::new(FakeSession { m, k, n, backend });
        unsafe { *out_session = Box::into_raw(session) as SessionHandle };
        0
    }

    extern "C" fn refusing_create(
        _model: *const u8,
        _model_len: usize,
        _backend: u32,
        _out_session: *mut SessionHandle,
    ) -> i32 {
        4
    }

    extern "C" fn fake_backend(session: SessionHandle) -> u32 {
        unsafe { (*(session as *const FakeSession)).backend }
    }

    extern "C" fn fake_run(
        session: SessionHandle,
        a: *const f32,
        a_len: usize,
        b: *const f32,
        b_len: usize,
        c: *mut f32,
        c_len: usize,
    ) -> i32 {
        let s = unsafe { &*(session as *const FakeSession) };
        if a_len != s.m * s.k || b_len != s.k * s.n || c_len != s.m * s.n {
            return 3;
        }
        let (a, b, c) = unsafe {
            (
                slice::from_raw_parts(a, a_len),
                slice::from_raw_parts(b, b_len),
                slice::from_raw_parts_mut(c, c_len),
            )
        };
        for row in 0..s.m {
            for col in 0..s.n {
                c[row * s.n + col] = (0..s.k).map(|i| a[row * s.k + i] * b[i * s.n + col]).sum();
            }
        }
        0
    }

    extern "C" fn fake_destroy(session: SessionHandle) {
        let session = unsafe { Box::from_raw(session as *mut FakeSession) };
        DESTROYED
            .lock()
            .unwrap()
            .push((session.m, session.k, session.n));
    }

    fn runtime(create: SessionCreateFn) -> PluginRuntime {
        PluginRuntime {
            name: "fake plugin".to_string(),
            fns: PluginFns {
                create,
                backend: fake_backend,
                run: fake_run,
                destroy: fake_destroy,
            },
            lib: Arc::new(libloading::os::unix::Library::this().into()),
        }
    }

    #[test]
    fn test_session_runs_and_is_destroyed_on_drop() {
        let runtime = runtime(fake_create);
        let model = encode_matmul_model(2, 3, 2);
        let mut session = runtime.create_session(&model, ExecutionBackend::Gpu).unwrap();
        assert_eq!(session.selected_backend(), ExecutionBackend::Gpu);
        assert_eq!(session.input_names(), vec!["A", "B"]);

        let feeds = vec![
            Tensor::new("A", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
            Tensor::new("B", vec![3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap(),
        ];
        let outputs = session.run(&feeds).unwrap();
        assert_eq!(outputs[0].name, "C");
        assert_eq!(outputs[0].dims, vec![2, 2]);
        assert_eq!(outputs[0].data, vec![4.0, 5.0, 10.0, 11.0]);

        assert!(!DESTROYED.lock().unwrap().contains(&(2, 3, 2)));
        drop(session);
        assert!(DESTROYED.lock().unwrap().contains(&(2, 3, 2)));
    }

    #[test]
    fn test_cpu_request_reports_cpu_backend() {
        let runtime = runtime(fake_create);
        let session = runtime
            .create_session(&encode_matmul_model(4, 4, 4), ExecutionBackend::Cpu)
            .unwrap();
        assert_eq!(session.selected_backend(), ExecutionBackend::Cpu);
    }

    #[test]
    fn test_nonzero_run_status_is_session_error() {
        let runtime = runtime(fake_create);
        let mut session = runtime
            .create_session(&encode_matmul_model(2, 3, 4), ExecutionBackend::Cpu)
            .unwrap();
        let feeds = vec![
            Tensor::new("A", vec![2, 2], vec![1.0; 4]).unwrap(),
            Tensor::new("B", vec![3, 4], vec![1.0; 12]).unwrap(),
        ];

        let err = session.run(&feeds).unwrap_err();
        assert!(matches!(err, HarnessError::SessionError { .. }));
        assert!(err.to_string().contains("status 3"));
    }

    #[test]
    fn test_refused_create_is_session_error() {
        let runtime = runtime(refusing_create);
        let err = runtime
            .create_session(&encode_matmul_model(2, 2, 2), ExecutionBackend::Gpu)
            .err()
            .unwrap();
        assert!(err.to_string().contains("status 4"));
    }

    #[test]
    fn test_malformed_model_never_reaches_the_plugin() {
        let runtime = runtime(refusing_create);
        let err = runtime
            .create_session(b"not a model", ExecutionBackend::Gpu)
            .err()
            .unwrap();
        assert!(err.to_string().contains("malformed model"));
    }
}
