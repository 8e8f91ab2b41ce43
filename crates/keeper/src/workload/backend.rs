//! Compute backends for one work unit: a `dim x dim` f32 matrix multiply
//! followed by sum/mean/stddev reductions.
//!
//! The backend is picked once per device at generator construction: CUDA via
//! cudarc when the driver is reachable, otherwise a CPU fallback.

use std::hint::black_box;
use std::sync::{Arc, Mutex};

use cudarc::cublas::sys::cublasOperation_t;
use cudarc::cublas::{CudaBlas, Gemm, GemmConfig};
use cudarc::driver::{CudaContext, CudaSlice, CudaStream};
use rand::Rng;

use crate::error::GeneratorError;
use crate::DeviceId;

pub trait ComputeBackend: Send + Sync {
    fn label(&self) -> &'static str;

    /// Performs one compute-heavy work unit. Blocking; run on a blocking
    /// thread.
    fn run_unit(&self) -> Result<(), GeneratorError>;
}

/// Tries the CUDA backend for `device`, falling back to CPU compute with a
/// warning when the driver or device is unavailable.
pub fn select_backend(device: DeviceId, dim: usize) -> Arc<dyn ComputeBackend> {
    match CudaBackend::new(device, dim) {
        Ok(backend) => {
            tracing::info!(device, dim, "using CUDA compute backend");
            Arc::new(backend)
        }
        Err(e) => {
            tracing::warn!(device, "CUDA backend unavailable ({e}), falling back to CPU compute");
            Arc::new(CpuBackend::new(dim))
        }
    }
}

fn random_matrix(elements: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..elements).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Sum, mean, and standard deviation; kept live through `black_box` so the
/// arithmetic cannot be optimized away.
fn reductions(values: &[f32]) -> (f64, f64, f64) {
    let sum: f64 = values.iter().map(|&v| v as f64).sum();
    let mean = sum / values.len() as f64;
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    black_box((sum, mean, variance.sqrt()))
}

/// GPU work unit: cuBLAS sgemm on device-resident operands, result reduced
/// on the host. Operands are allocated once; only the output buffer mutates.
pub struct CudaBackend {
    device: DeviceId,
    dim: usize,
    stream: Arc<CudaStream>,
    blas: CudaBlas,
    a: CudaSlice<f32>,
    b: CudaSlice<f32>,
    c: Mutex<CudaSlice<f32>>,
}

impl CudaBackend {
    pub fn new(device: DeviceId, dim: usize) -> Result<Self, GeneratorError> {
        let driver = |source| GeneratorError::Driver { device, source };
        let cublas = |source| GeneratorError::Cublas { device, source };

        let ctx = CudaContext::new(device as usize).map_err(driver)?;
        let stream = ctx.default_stream();
        let blas = CudaBlas::new(stream.clone()).map_err(cublas)?;

        let elements = dim * dim;
        let a = stream.memcpy_stod(&random_matrix(elements)).map_err(driver)?;
        let b = stream.memcpy_stod(&random_matrix(elements)).map_err(driver)?;
        let c = stream.alloc_zeros::<f32>(elements).map_err(driver)?;

        Ok(Self {
            device,
            dim,
            stream,
            blas,
            a,
            b,
            c: Mutex::new(c),
        })
    }
}

impl ComputeBackend for CudaBackend {
    fn label(&self) -> &'static str {
        "cuda"
    }

    fn run_unit(&self) -> Result<(), GeneratorError> {
        let driver = |source| GeneratorError::Driver {
            device: self.device,
            source,
        };
        let cublas = |source| GeneratorError::Cublas {
            device: self.device,
            source,
        };

        let n = self.dim as i32;
        let cfg = GemmConfig {
            transa: cublasOperation_t::CUBLAS_OP_N,
            transb: cublasOperation_t::CUBLAS_OP_N,
            m: n,
            n,
            k: n,
            alpha: 1.0f32,
            lda: n,
            ldb: n,
            beta: 0.0f32,
            ldc: n,
        };

        let mut c = self.c.lock().expect("poisoned");
        unsafe { self.blas.gemm(cfg, &self.a, &self.b, &mut *c) }.map_err(cublas)?;
        self.stream.synchronize().map_err(driver)?;

        let host = self.stream.memcpy_dtov(&*c).map_err(driver)?;
        reductions(&host);
        Ok(())
    }
}

/// CPU fallback: naive matmul over preallocated random operands.
pub struct CpuBackend {
    dim: usize,
    a: Vec<f32>,
    b: Vec<f32>,
}

impl CpuBackend {
    pub fn new(dim: usize) -> Self {
        let elements = dim * dim;
        Self {
            dim,
            a: random_matrix(elements),
            b: random_matrix(elements),
        }
    }
}

impl ComputeBackend for CpuBackend {
    fn label(&self) -> &'static str {
        "cpu"
    }

    fn run_unit(&self) -> Result<(), GeneratorError> {
        let n = self.dim;
        let mut c = vec![0.0f32; n * n];
        for i in 0..n {
            for k in 0..n {
                let aik = self.a[i * n + k];
                let row = &self.b[k * n..(k + 1) * n];
                let out = &mut c[i * n..(i + 1) * n];
                for j in 0..n {
                    out[j] += aik * row[j];
                }
            }
        }
        reductions(&c);
        Ok(())
    }
}
