use test_case::test_case;

use crate::test::helpers::allocator;
use crate::{DeviceArray, Error};

#[test]
fn test_roundtrip_scalar() {
    let mut array = DeviceArray::<f32>::new(allocator(), 4).unwrap();
    array.to_device(&[1.0, -2.5, 3.0, 0.125]).unwrap();
    assert_eq!(array.to_host().unwrap(), vec![1.0, -2.5, 3.0, 0.125]);
}

#[test]
fn test_roundtrip_blocked_elements() {
    let values: Vec<i64> = (0..2 * 3 * 2 * 2).collect();
    let array = DeviceArray::<i64, 3, 2, 2>::from_host(allocator(), &values).unwrap();

    assert_eq!(array.len(), 2);
    assert_eq!(array.shape(), [2, 3, 2, 2]);
    assert_eq!(array.buf_size(), 24 * 8);
    assert_eq!(array.to_host().unwrap(), values);
}

#[test]
fn test_zero_clears_everything() {
    let mut array = DeviceArray::<f64, 2>::from_host(allocator(), &[1.0, 2.0, 3.0, 4.0]).unwrap();
    array.zero().unwrap();
    assert_eq!(array.to_host().unwrap(), vec![0.0; 4]);
}

#[test_case(3 ; "too short")]
#[test_case(5 ; "too long")]
fn test_to_device_wrong_length(len: usize) {
    let mut array = DeviceArray::<i32>::new(allocator(), 4).unwrap();
    let result = array.to_device(&vec![1; len]);
    assert!(matches!(result, Err(Error::SizeMismatch { expected: 4, actual }) if actual == len));
}

#[test]
fn test_from_host_partial_element() {
    let result = DeviceArray::<f32, 2, 2>::from_host(allocator(), &[1.0; 6]);
    assert!(matches!(result, Err(Error::PartialElement { len: 6, block: 4 })));
}

#[test]
fn test_empty_array() {
    let mut array = DeviceArray::<f32, 3>::new(allocator(), 0).unwrap();
    assert!(array.is_empty());
    assert_eq!(array.buf_size(), 0);
    array.zero().unwrap();
    array.to_device(&[]).unwrap();
    assert!(array.to_host().unwrap().is_empty());
}

#[test]
fn test_copy_from_at_element() {
    let mut dst = DeviceArray::<i32, 2>::from_host(allocator(), &[0; 8]).unwrap();
    let src = DeviceArray::<i32>::from_host(allocator(), &[5, 6, 7, 8, 9]).unwrap();

    dst.copy_from(1, &src, 3).unwrap();
    assert_eq!(dst.to_host().unwrap(), vec![0, 0, 5, 6, 7, 0, 0, 0]);
}

#[test]
fn test_copy_from_zero_count() {
    let mut dst = DeviceArray::<f32>::from_host(allocator(), &[1.0, 2.0]).unwrap();
    let src = DeviceArray::<f32>::new(allocator(), 0).unwrap();

    dst.copy_from(2, &src, 0).unwrap();
    assert_eq!(dst.to_host().unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_copy_from_out_of_range() {
    let mut dst = DeviceArray::<f32>::new(allocator(), 4).unwrap();
    let src = DeviceArray::<f32>::new(allocator(), 4).unwrap();

    let result = dst.copy_from(2, &src, 3);
    assert!(matches!(result, Err(Error::OutOfRange { operation: "copy destination", start: 2, count: 3, len: 4 })));

    let small = DeviceArray::<f32>::new(allocator(), 1).unwrap();
    assert!(matches!(dst.copy_from(0, &small, 2), Err(Error::OutOfRange { operation: "copy source", .. })));
}

#[test_case(usize::MAX, 1 ; "index overflows the scalar offset")]
#[test_case(usize::MAX / 2, 1 ; "offset overflows with the block")]
#[test_case(1, usize::MAX ; "count overflows the end")]
fn test_copy_from_huge_offsets_rejected(index: usize, count: usize) {
    let mut dst = DeviceArray::<f64, 3>::new(allocator(), 4).unwrap();
    let src = DeviceArray::<f64, 3>::new(allocator(), 4).unwrap();

    let result = dst.copy_from(index, &src, count);
    assert!(matches!(result, Err(Error::OutOfRange { operation: "copy destination", len: 12, .. })));
}
