use burn_tensor::backend::Backend;

use crate::{DeviceKind, DeviceSpec, ShardError};

/// Maps the devices named in placements to backend devices.
pub trait DeviceResolver<B: Backend>: Send + Sync {
    /// Number of devices of the given kind on this host.
    fn device_count(&self, kind: &DeviceKind) -> usize;

    /// The backend device for a placement's device.
    fn resolve(&self, device: &DeviceSpec) -> Result<B::Device, ShardError>;
}

/// A host exposing `count` cpu devices and nothing else.
///
/// Every cpu device maps to the backend's default device, which lets a CPU backend
/// stand in for one device per rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostDevices {
    count: usize,
}

impl HostDevices {
    /// Creates a host with `count` cpu devices.
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl<B: Backend> DeviceResolver<B> for HostDevices {
    fn device_count(&self, kind: &DeviceKind) -> usize {
        match kind {
            DeviceKind::Cpu => self.count,
            _ => 0,
        }
    }

    fn resolve(&self, device: &DeviceSpec) -> Result<B::Device, ShardError> {
        let available = match (device.kind(), device.index()) {
            (DeviceKind::Cpu, None) => self.count > 0,
            (DeviceKind::Cpu, Some(index)) => index < self.count,
            _ => false,
        };

        if available {
            Ok(B::Device::default())
        } else {
            Err(ShardError::DeviceUnavailable(device.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_host_devices_only_expose_cpus() {
        let host = HostDevices::new(2);

        assert_eq!(DeviceResolver::<TestBackend>::device_count(&host, &DeviceKind::Cpu), 2);
        assert_eq!(DeviceResolver::<TestBackend>::device_count(&host, &DeviceKind::Cuda), 0);
    }

    #[test]
    fn test_host_devices_resolve() {
        let host = HostDevices::new(2);
        let resolve = |device: DeviceSpec| DeviceResolver::<TestBackend>::resolve(&host, &device);

        assert_eq!(resolve(DeviceSpec::cpu(1)), Ok(NdArrayDevice::Cpu));
        assert_eq!(resolve(DeviceSpec::new(DeviceKind::Cpu, None)), Ok(NdArrayDevice::Cpu));
        assert_eq!(
            resolve(DeviceSpec::cpu(2)),
            Err(ShardError::DeviceUnavailable(DeviceSpec::cpu(2)))
        );
        assert_eq!(
            resolve(DeviceSpec::cuda(0)),
            Err(ShardError::DeviceUnavailable(DeviceSpec::cuda(0)))
        );
    }
}
