use mtds_controller::*;
use mtds_types::{DataType, EngineConfig, EngineMetadata};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Runtime;

#[derive(Default)]
struct CountingEngine {
    calls: AtomicUsize,
    entries: AtomicUsize,
}

impl CacheEngine for CountingEngine {
    fn clear(&self, tokens: Option<&[u32]>) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match tokens {
            Some(tokens) => Ok(tokens.len().min(self.entries.swap(0, Ordering::SeqCst))),
            None => Ok(self.entries.swap(0, Ordering::SeqCst)),
        }
    }
}

struct PanickingEngine;

impl CacheEngine for PanickingEngine {
    fn clear(&self, _tokens: Option<&[u32]>) -> Result<usize> {
        panic!("clear blew up")
    }
}

fn weak<E: CacheEngine + 'static>(engine: &Arc<E>) -> Weak<dyn CacheEngine> {
    let weak: Weak<E> = Arc::downgrade(engine);
    weak
}

fn worker_config(controller: &PullSocket) -> EngineConfig {
    EngineConfig {
        enable_controller: true,
        controller_url: Some(controller.local_addr().to_string()),
        worker_port: Some(0),
        instance_id: "test-instance".to_string(),
        ..EngineConfig::default()
    }
}

fn metadata() -> EngineMetadata {
    EngineMetadata::new("model", 1, 0, "vllm", DataType::BF16)
}

async fn next_messages(pull: &mut PullSocket) -> Vec<Msg> {
    let parts = tokio::time::timeout(Duration::from_secs(5), pull.recv_multipart())
        .await
        .expect("controller received nothing")
        .expect("pull socket closed");
    parts.iter().map(|p| Msg::decode(p).unwrap()).collect()
}

#[test]
fn worker_registers_serves_and_deregisters() {
    let rt = Runtime::new().unwrap();
    let mut pull = rt.block_on(PullSocket::bind("127.0.0.1:0")).unwrap();
    let engine = Arc::new(CountingEngine::default());
    engine.entries.store(3, Ordering::SeqCst);

    let mut worker = Worker::new(&worker_config(&pull), &metadata(), weak(&engine)).unwrap();
    let port = worker.port();
    assert_ne!(port, 0);

    rt.block_on(async {
        let msgs = next_messages(&mut pull).await;
        assert_eq!(
            msgs[0],
            Msg::Register(RegisterMsg {
                instance_id: "test-instance".to_string(),
                worker_id: 0,
                ip: worker.ip().to_string(),
                port,
            })
        );

        let mut req = RequestSocket::connect(&format!("127.0.0.1:{}", port))
            .await
            .unwrap();
        let clear = Msg::from(ClearWorkerMsg {
            tokens: Some(vec![1, 2, 3]),
        });
        let reply = Msg::decode(&req.request(&clear.encode().unwrap()).await.unwrap()).unwrap();
        assert_eq!(reply, Msg::ClearWorkerRet(ClearWorkerRetMsg { success: true }));

        // Nothing left to remove
        let reply = Msg::decode(&req.request(&clear.encode().unwrap()).await.unwrap()).unwrap();
        assert_eq!(reply, Msg::ClearWorkerRet(ClearWorkerRetMsg { success: false }));
    });
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);

    worker.close();
    rt.block_on(async {
        let msgs = next_messages(&mut pull).await;
        assert!(matches!(msgs.last(), Some(Msg::DeRegister(m)) if m.port == port));
    });
    assert!(worker.put_msg(ErrorMsg { error: "late".into() }).is_err());
}

#[test]
fn unknown_request_gets_exactly_one_error_reply() {
    let rt = Runtime::new().unwrap();
    let pull = rt.block_on(PullSocket::bind("127.0.0.1:0")).unwrap();
    let engine = Arc::new(CountingEngine::default());
    let worker = Worker::new(&worker_config(&pull), &metadata(), weak(&engine)).unwrap();

    rt.block_on(async {
        let mut req = RequestSocket::connect(&format!("127.0.0.1:{}", worker.port()))
            .await
            .unwrap();

        let mut unknown = Vec::new();
        ciborium::into_writer(
            &ciborium::Value::Map(vec![(
                ciborium::Value::Text("type".into()),
                ciborium::Value::Text("LookupMsg".into()),
            )]),
            &mut unknown,
        )
        .unwrap();
        let reply = Msg::decode(&req.request(&unknown).await.unwrap()).unwrap();
        assert!(matches!(reply, Msg::Error(ref e) if e.error.contains("LookupMsg")));

        // The loop survives and keeps answering
        let reply = Msg::decode(&req.request(b"garbage").await.unwrap()).unwrap();
        assert!(matches!(reply, Msg::Error(_)));
        let clear = Msg::from(ClearWorkerMsg { tokens: None }).encode().unwrap();
        let reply = Msg::decode(&req.request(&clear).await.unwrap()).unwrap();
        assert_eq!(reply, Msg::ClearWorkerRet(ClearWorkerRetMsg { success: false }));
    });
}

#[test]
fn queued_events_reach_controller_in_order() {
    let rt = Runtime::new().unwrap();
    let mut pull = rt.block_on(PullSocket::bind("127.0.0.1:0")).unwrap();
    let engine = Arc::new(CountingEngine::default());
    let worker = Worker::new(&worker_config(&pull), &metadata(), weak(&engine)).unwrap();

    for i in 0..5 {
        worker
            .put_msg(KvAdmitMsg {
                instance_id: "test-instance".to_string(),
                worker_id: 0,
                key: format!("vllm@model@1@0@{}", i),
                location: "LocalCPUBackend".to_string(),
            })
            .unwrap();
    }

    let received = rt.block_on(async {
        let mut received = Vec::new();
        while received.len() < 6 {
            let batch = next_messages(&mut pull).await;
            assert!(batch.len() <= MAX_BATCH);
            received.extend(batch);
        }
        received
    });
    assert!(matches!(received[0], Msg::Register(_)));
    for (i, msg) in received[1..].iter().enumerate() {
        match msg {
            Msg::KvAdmit(m) => assert!(m.key.ends_with(&format!("@{}", i))),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn unreachable_controller_does_not_stop_worker() {
    let rt = Runtime::new().unwrap();
    let addr = {
        let pull = rt.block_on(PullSocket::bind("127.0.0.1:0")).unwrap();
        pull.local_addr()
    };
    let config = EngineConfig {
        enable_controller: true,
        controller_url: Some(addr.to_string()),
        worker_port: Some(0),
        ..EngineConfig::default()
    };
    let engine = Arc::new(CountingEngine::default());
    engine.entries.store(1, Ordering::SeqCst);
    let mut worker = Worker::new(&config, &metadata(), weak(&engine)).unwrap();

    rt.block_on(async {
        let mut req = RequestSocket::connect(&format!("127.0.0.1:{}", worker.port()))
            .await
            .unwrap();
        let clear = Msg::from(ClearWorkerMsg { tokens: None }).encode().unwrap();
        let reply = Msg::decode(&req.request(&clear).await.unwrap()).unwrap();
        assert_eq!(reply, Msg::ClearWorkerRet(ClearWorkerRetMsg { success: true }));
    });
    worker.close();
}

#[test]
fn missing_controller_settings_are_config_errors() {
    let config = EngineConfig::default();
    let engine = Arc::new(CountingEngine::default());
    let err = Worker::new(&config, &metadata(), weak(&engine)).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn worker_survives_panicking_handler() {
    let rt = Runtime::new().unwrap();
    let pull = rt.block_on(PullSocket::bind("127.0.0.1:0")).unwrap();
    let engine = Arc::new(PanickingEngine);
    let mut worker = Worker::new(&worker_config(&pull), &metadata(), weak(&engine)).unwrap();

    rt.block_on(async {
        let mut req = RequestSocket::connect(&format!("127.0.0.1:{}", worker.port()))
            .await
            .unwrap();
        let clear = Msg::from(ClearWorkerMsg { tokens: None }).encode().unwrap();
        for _ in 0..2 {
            let reply = Msg::decode(&req.request(&clear).await.unwrap()).unwrap();
            assert!(matches!(reply, Msg::Error(ref e) if e.error.contains("clear blew up")));
        }
    });
    worker.close();
}

#[test]
fn requests_after_engine_drop_get_error_reply() {
    let rt = Runtime::new().unwrap();
    let pull = rt.block_on(PullSocket::bind("127.0.0.1:0")).unwrap();
    let engine = Arc::new(CountingEngine::default());
    let mut worker = Worker::new(&worker_config(&pull), &metadata(), weak(&engine)).unwrap();
    drop(engine);

    rt.block_on(async {
        let mut req = RequestSocket::connect(&format!("127.0.0.1:{}", worker.port()))
            .await
            .unwrap();
        let clear = Msg::from(ClearWorkerMsg { tokens: None }).encode().unwrap();
        let reply = Msg::decode(&req.request(&clear).await.unwrap()).unwrap();
        assert!(matches!(reply, Msg::Error(_)));
    });
    worker.close();
}
