use mtds_memory::CuFileMemoryAllocator;
use mtds_storage::*;
use mtds_types::config::{GDS_BACKEND, LOCAL_CPU_BACKEND, LOCAL_DISK_BACKEND, WEKA_GDS_BACKEND};
use mtds_types::EngineConfig;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::{Builder, Runtime};

fn test_key() -> CacheEngineKey {
    CacheEngineKey::new(
        "vllm",
        "meta-llama/Llama-3.1-70B-Instruct",
        8,
        0,
        "e3229141e680fb413d2c5d3ebb416c4ad300d381e309fc9e417757b91406c157",
    )
}

/// A runtime that only makes progress inside `block_on`, so the in-flight
/// window of a put can be observed deterministically
fn paused_runtime() -> Runtime {
    Builder::new_current_thread().enable_all().build().unwrap()
}

fn cufile_config(dir: &TempDir, weka: bool) -> EngineConfig {
    let root = Some(dir.path().join("cache").to_string_lossy().into_owned());
    let mut config = EngineConfig {
        cufile_buffer_size: Some(128),
        max_local_cpu_size: 1.0,
        ..EngineConfig::default()
    };
    if weka {
        config.weka_path = root;
    } else {
        config.gds_path = root;
    }
    config
}

fn direct_storage_sanity(weka: bool, backend_name: &str) {
    let dir = TempDir::new().unwrap();
    let config = cufile_config(&dir, weka);
    let rt = paused_runtime();

    let allocator = create_memory_allocator(&config).unwrap();
    let backends = create_storage_backends(&config, rt.handle().clone(), allocator).unwrap();
    assert_eq!(backends.len(), 2);
    assert_eq!(backends.names(), vec![LOCAL_CPU_BACKEND, backend_name]);

    let backend = backends.get(backend_name).unwrap();
    assert!(backend
        .memory_allocator()
        .as_any()
        .downcast_ref::<CuFileMemoryAllocator>()
        .is_some());

    let key = test_key();
    assert!(!backend.contains(&key, false));
    assert!(!backend.exists_in_put_tasks(&key));

    let obj = backend
        .memory_allocator()
        .allocate(&[2048, 2048], DataType::U8)
        .unwrap();
    obj.data_mut().fill(0x5a);

    let put = backend.submit_put_task(&key, &obj).unwrap();
    assert!(backend.exists_in_put_tasks(&key));
    assert!(!backend.contains(&key, false));
    assert!(backend.contains(&key, true));

    rt.block_on(put).unwrap();
    assert!(backend.contains(&key, false));
    assert!(!backend.exists_in_put_tasks(&key));

    let fetched = backend.get_blocking(&key).unwrap();
    assert_eq!(fetched.shape(), &[2048, 2048]);
    assert_eq!(fetched.dtype(), DataType::U8);
    assert_eq!(fetched.size_bytes(), obj.size_bytes());
    assert!(fetched.data().iter().all(|&b| b == 0x5a));
    drop(fetched);

    let task = backend.get_non_blocking(&key).unwrap();
    let fetched = rt.block_on(task).unwrap();
    assert_eq!(fetched.shape(), obj.shape());
    assert_eq!(fetched.dtype(), obj.dtype());
    assert_eq!(fetched.size_bytes(), obj.size_bytes());
}

#[test]
fn gds_backend_sanity() {
    direct_storage_sanity(false, GDS_BACKEND);
}

#[test]
fn weka_backend_sanity() {
    direct_storage_sanity(true, WEKA_GDS_BACKEND);
}

#[test]
fn duplicate_put_is_rejected_while_in_flight() {
    let dir = TempDir::new().unwrap();
    let config = cufile_config(&dir, false);
    let rt = paused_runtime();
    let allocator = create_memory_allocator(&config).unwrap();
    let backends = create_storage_backends(&config, rt.handle().clone(), allocator).unwrap();
    let backend = backends.get(GDS_BACKEND).unwrap();

    let key = test_key();
    let obj = backend.memory_allocator().allocate(&[64], DataType::U8).unwrap();
    let first = backend.submit_put_task(&key, &obj).unwrap();

    let err = backend.submit_put_task(&key, &obj).unwrap_err();
    assert!(matches!(err, MtdsError::AlreadyExists { .. }));
    assert!(backend.exists_in_put_tasks(&key));

    rt.block_on(first).unwrap();
    assert!(!backend.exists_in_put_tasks(&key));
    let again = backend.submit_put_task(&key, &obj).unwrap();
    rt.block_on(again).unwrap();
}

#[test]
fn dropped_runtime_cancels_pending_put() {
    let dir = TempDir::new().unwrap();
    let config = cufile_config(&dir, true);
    let rt = paused_runtime();
    let allocator = create_memory_allocator(&config).unwrap();
    let backends = create_storage_backends(&config, rt.handle().clone(), allocator).unwrap();
    let backend = backends.get(WEKA_GDS_BACKEND).unwrap().clone();

    let key = test_key();
    let obj = backend.memory_allocator().allocate(&[64], DataType::U8).unwrap();
    let put = backend.submit_put_task(&key, &obj).unwrap();
    drop(rt);

    let err = put.wait().unwrap_err();
    assert!(matches!(err, MtdsError::Cancelled { .. }));
    assert!(!backend.exists_in_put_tasks(&key));
    assert!(!backend.contains(&key, true));
}

#[test]
fn get_of_absent_key_fails_fast() {
    let dir = TempDir::new().unwrap();
    let config = cufile_config(&dir, false);
    let rt = paused_runtime();
    let allocator = create_memory_allocator(&config).unwrap();
    let backends = create_storage_backends(&config, rt.handle().clone(), allocator).unwrap();

    for (_, backend) in backends.iter() {
        assert!(matches!(
            backend.get_blocking(&test_key()),
            Err(MtdsError::NotFound { .. })
        ));
        assert!(matches!(
            backend.get_non_blocking(&test_key()),
            Err(MtdsError::NotFound { .. })
        ));
    }
}

#[test]
fn index_is_recovered_from_disk() {
    let dir = TempDir::new().unwrap();
    let rt = Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap();
    let config = EngineConfig {
        local_cpu: false,
        local_disk: Some(dir.path().to_string_lossy().into_owned()),
        max_local_disk_size: 1.0,
        ..EngineConfig::default()
    };

    let keys: Vec<CacheEngineKey> = (0..3)
        .map(|i| CacheEngineKey::new("vllm", "model", 1, 0, format!("hash{}", i)))
        .collect();
    {
        let allocator = create_memory_allocator(&config).unwrap();
        let backends =
            create_storage_backends(&config, rt.handle().clone(), allocator.clone()).unwrap();
        let backend = backends.get(LOCAL_DISK_BACKEND).unwrap();
        let obj = allocator.allocate(&[16, 4], DataType::BF16).unwrap();
        for key in &keys {
            backend.submit_put_task(key, &obj).unwrap().wait().unwrap();
        }
    }

    // A stale staging file and a foreign file must not be indexed
    std::fs::write(dir.path().join("partial.kvcache.safetensors.tmp"), b"junk").unwrap();
    std::fs::write(dir.path().join("README"), b"hello").unwrap();

    let allocator = create_memory_allocator(&config).unwrap();
    let backends = create_storage_backends(&config, rt.handle().clone(), allocator).unwrap();
    let backend = backends.get(LOCAL_DISK_BACKEND).unwrap();
    let mut recovered = backend.keys();
    recovered.sort();
    assert_eq!(recovered, keys);
    assert!(!dir.path().join("partial.kvcache.safetensors.tmp").exists());

    let obj = backend.get_blocking(&keys[1]).unwrap();
    assert_eq!(obj.shape(), &[16, 4]);
    assert_eq!(obj.dtype(), DataType::BF16);
}

#[test]
fn chunk_files_open_as_single_tensor_files() {
    let dir = TempDir::new().unwrap();
    let config = cufile_config(&dir, false);
    let rt = paused_runtime();
    let allocator = create_memory_allocator(&config).unwrap();
    let backends = create_storage_backends(&config, rt.handle().clone(), allocator).unwrap();
    let backend = backends.get(GDS_BACKEND).unwrap();

    let key = test_key();
    let obj = backend.memory_allocator().allocate(&[3, 10], DataType::F32).unwrap();
    rt.block_on(backend.submit_put_task(&key, &obj).unwrap()).unwrap();

    let path = layout::chunk_path(&dir.path().join("cache"), &key);
    let bytes = std::fs::read(path).unwrap();
    let meta = unpack_metadata(&bytes).unwrap();
    assert_eq!(meta.shape, vec![3, 10]);
    assert_eq!(meta.nbytes, 120);
    assert_eq!(meta.version(), Some(FORMAT_VERSION));
    assert_eq!(bytes.len(), metadata::METADATA_REGION_BYTES + 120);
}

#[test]
fn misconfigured_backends_abort_construction() {
    let rt = paused_runtime();

    let unknown = EngineConfig {
        storage_backends: vec!["S3Backend".to_string()],
        ..EngineConfig::default()
    };
    let allocator = Arc::new(mtds_memory::HostMemoryAllocator::new(1 << 20).unwrap());
    let err = create_storage_backends(&unknown, rt.handle().clone(), allocator.clone()).unwrap_err();
    assert!(err.is_fatal());

    let missing_path = EngineConfig {
        storage_backends: vec![GDS_BACKEND.to_string()],
        cufile_buffer_size: Some(8),
        ..EngineConfig::default()
    };
    assert!(create_storage_backends(&missing_path, rt.handle().clone(), allocator).is_err());
}
