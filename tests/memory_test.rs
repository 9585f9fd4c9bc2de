//! Memory pool tests: host and file-backed pools, alone and under dispatch.

mod common;

use std::sync::Arc;

use nnrt_core::execution::{ErrorStatus, Request, RequestArgument};
use nnrt_core::memory::{FileMemory, HostMemory, MemoryError, MemoryPool};

use common::*;

#[test]
fn host_memory_clones_share_bytes() {
    let memory = HostMemory::new(8);
    let handle = memory.clone();
    let mut mapping = memory.map().unwrap();
    mapping.write(4, &[1, 2, 3, 4]).unwrap();
    mapping.flush().unwrap();
    assert_eq!(handle.read_at(4, 4).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(handle.size(), 8);
}

#[test]
fn host_memory_rejects_out_of_bounds_access() {
    let memory = HostMemory::new(8);
    let mapping = memory.map().unwrap();
    let mut dest = [0u8; 4];
    assert!(matches!(
        mapping.read(6, &mut dest),
        Err(MemoryError::OutOfBounds { offset: 6, len: 4, size: 8 })
    ));
    assert!(memory.write_at(usize::MAX, &[1]).is_err());
}

#[test]
fn file_memory_reopens_with_written_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.bin");
    let pool = FileMemory::create(&path, 16).unwrap();
    {
        let mut mapping = pool.map().unwrap();
        mapping.write(0, &f32_bytes(&[1.5, -2.0])).unwrap();
        mapping.flush().unwrap();
    }
    let reopened = FileMemory::open(&path).unwrap();
    assert_eq!(reopened.size(), 16);
    let mapping = reopened.map().unwrap();
    let mut dest = [0u8; 8];
    mapping.read(0, &mut dest).unwrap();
    assert_eq!(bytes_f32(&dest), vec![1.5, -2.0]);
}

#[test]
fn empty_file_pool_maps() {
    let dir = tempfile::tempdir().unwrap();
    let pool = FileMemory::create(dir.path().join("empty.bin"), 0).unwrap();
    let mapping = pool.map().unwrap();
    assert!(mapping.is_empty());
}

#[test]
fn request_spanning_host_and_file_pools() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outputs.bin");
    let outputs = FileMemory::create(&path, 32).unwrap();
    let input = [3.0, 1.0, -4.0, 0.25];
    let inputs = HostMemory::from_bytes(f32_bytes(&input));

    let prepared = local_driver().prepare_model(add_relu_model()).unwrap();
    let request = Request::new(
        vec![RequestArgument::new(0, 0, 16)],
        vec![RequestArgument::new(1, 8, 16)],
    )
    .with_pool(Arc::new(inputs))
    .with_pool(Arc::new(outputs));
    let result = prepared.execute_sync(request);
    assert_eq!(result.status, ErrorStatus::None);

    let written = std::fs::read(&path).unwrap();
    assert_eq!(&written[..8], &[0; 8]);
    assert_eq!(bytes_f32(&written[8..24]), add_relu_expected(&input));
}
