use test_case::test_case;

use crate::allocator::Allocator;
use crate::registry::{self, DeviceRegistry};
use crate::{DeviceSpec, DeviceSpecExt, Error};

#[test_case("CPU", DeviceSpec::Cpu ; "cpu")]
#[test_case(" cpu ", DeviceSpec::Cpu ; "cpu lowercase padded")]
#[test_case("cuda", DeviceSpec::Cuda { device_id: 0 } ; "cuda default ordinal")]
#[test_case("CUDA:3", DeviceSpec::Cuda { device_id: 3 } ; "cuda ordinal")]
#[test_case("gpu:1", DeviceSpec::Cuda { device_id: 1 } ; "gpu alias")]
fn test_parse_device(input: &str, expected: DeviceSpec) {
    assert_eq!(<DeviceSpec as DeviceSpecExt>::parse(input).unwrap(), expected);
}

#[test_case("TPU" ; "unknown kind")]
#[test_case("CUDA:x" ; "bad ordinal")]
#[test_case("CPU:0:1" ; "too many parts")]
fn test_parse_device_invalid(input: &str) {
    assert!(matches!(<DeviceSpec as DeviceSpecExt>::parse(input), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_parse_roundtrips_canonical_form() {
    for spec in [DeviceSpec::Cpu, DeviceSpec::Cuda { device_id: 2 }] {
        assert_eq!(<DeviceSpec as DeviceSpecExt>::parse(&spec.canonicalize()).unwrap(), spec);
    }
}

#[test]
fn test_registry_cpu() {
    let allocator = registry::cpu().unwrap();
    assert_eq!(allocator.name(), "CPU");
}

#[test]
fn test_registry_returns_same_allocator() {
    let registry = DeviceRegistry::new();
    let a = registry.get(&DeviceSpec::Cpu).unwrap();
    let b = registry.get_device("cpu").unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
}

#[test]
fn test_cpu_device_count() {
    assert_eq!(registry::device_count(&DeviceSpec::Cpu).unwrap(), 1);
}

#[cfg(not(feature = "cuda"))]
#[test]
fn test_cuda_unavailable_without_feature() {
    assert_eq!(registry::device_count(&DeviceSpec::Cuda { device_id: 0 }).unwrap(), 0);
    let result = DeviceRegistry::new().get(&DeviceSpec::Cuda { device_id: 0 });
    assert!(matches!(result, Err(Error::InvalidDevice { .. })));
}

#[cfg(feature = "cuda")]
#[test]
fn test_registry_cuda() {
    let allocator = match registry::cuda(0) {
        Ok(allocator) => allocator,
        Err(_) => {
            eprintln!("CUDA not available, skipping test");
            return;
        }
    };
    assert_eq!(allocator.name(), "CUDA");
}
