use burn::tensor::backend::Backend;
use burn_ndarray::NdArrayDevice;
use clap::ValueEnum;
use models::Architecture;
use std::path::PathBuf;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::NdArray => "nd-array",
            BackendKind::Wgpu => "wgpu",
        }
    }
}

/// Reconcile the requested backend with the ones compiled in. Asking for
/// WGPU without the `backend-wgpu` feature falls back to ndarray.
pub fn validate_backend_choice(kind: BackendKind) -> BackendKind {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            tracing::warn!(
                "backend-wgpu feature not enabled; falling back to the ndarray backend (rebuild with --features backend-wgpu)"
            );
            BackendKind::NdArray
        }
        (kind, _) => kind,
    }
}

/// Device a run executes on, resolved at runtime.
#[derive(Debug, Clone)]
pub enum RunDevice {
    Host(NdArrayDevice),
    #[cfg(feature = "backend-wgpu")]
    Wgpu(burn_wgpu::WgpuDevice),
}

impl RunDevice {
    pub fn kind(&self) -> BackendKind {
        match self {
            RunDevice::Host(_) => BackendKind::NdArray,
            #[cfg(feature = "backend-wgpu")]
            RunDevice::Wgpu(_) => BackendKind::Wgpu,
        }
    }
}

/// Pick the device for `kind`. An accelerator that cannot execute a trivial
/// tensor op is replaced by the host device with a warning.
pub fn resolve_device(kind: BackendKind, gpu: usize) -> RunDevice {
    match validate_backend_choice(kind) {
        BackendKind::NdArray => {
            if gpu != 0 {
                tracing::debug!("--gpu {gpu} has no effect on the ndarray backend");
            }
            RunDevice::Host(NdArrayDevice::Cpu)
        }
        #[cfg(feature = "backend-wgpu")]
        BackendKind::Wgpu => {
            let device = burn_wgpu::WgpuDevice::DiscreteGpu(gpu);
            if wgpu_usable(&device) {
                RunDevice::Wgpu(device)
            } else {
                tracing::warn!("no usable WGPU adapter for gpu {gpu}; falling back to the ndarray backend");
                RunDevice::Host(NdArrayDevice::Cpu)
            }
        }
        #[cfg(not(feature = "backend-wgpu"))]
        BackendKind::Wgpu => RunDevice::Host(NdArrayDevice::Cpu),
    }
}

/// Adapter selection in burn-wgpu panics when no adapter matches.
#[cfg(feature = "backend-wgpu")]
fn wgpu_usable(device: &burn_wgpu::WgpuDevice) -> bool {
    use burn::tensor::Tensor;
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        Tensor::<burn_wgpu::Wgpu<f32>, 1>::zeros([1], device).into_data()
    }))
    .is_ok()
}

/// Seed the backend RNG used for parameter initialization.
pub fn seed_backend<B: Backend>(seed: u64, _device: &B::Device) {
    B::seed(seed);
}

/// Default stage-1 checkpoint location for `arch` and `seed`.
pub fn default_checkpoint_path(arch: Architecture, seed: u64) -> PathBuf {
    PathBuf::from("checkpoints").join(format!("erm_{arch}_seed{seed}.bin"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_matches_build() {
        let built = cfg!(feature = "backend-wgpu");
        let expected = if built {
            BackendKind::Wgpu
        } else {
            BackendKind::NdArray
        };
        assert_eq!(validate_backend_choice(BackendKind::Wgpu), expected);
        assert_eq!(validate_backend_choice(BackendKind::NdArray), BackendKind::NdArray);
    }

    #[test]
    fn explicit_host_request_always_runs_on_host() {
        let device = resolve_device(BackendKind::NdArray, 3);
        assert_eq!(device.kind(), BackendKind::NdArray);
    }

    #[cfg(not(feature = "backend-wgpu"))]
    #[test]
    fn accelerator_request_without_feature_runs_on_host() {
        assert!(matches!(
            resolve_device(BackendKind::Wgpu, 0),
            RunDevice::Host(NdArrayDevice::Cpu)
        ));
    }

    #[test]
    fn checkpoint_path_names_arch_and_seed() {
        assert_eq!(
            default_checkpoint_path(Architecture::Cnn, 3),
            PathBuf::from("checkpoints/erm_cnn_seed3.bin")
        );
    }
}
