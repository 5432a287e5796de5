//! Per-process control-plane worker
//!
//! The worker owns a dedicated thread running a single-threaded tokio
//! runtime. Callers talk to it only through [`Worker::put_msg`] and
//! [`Worker::close`]; everything else happens on the worker thread:
//!
//! * the push loop drains the outgoing queue in batches of up to
//!   [`MAX_BATCH`] messages and sends each batch as one multipart message;
//! * the request loop answers controller requests one at a time, always with
//!   exactly one reply.

use crate::message::{
    ClearWorkerRetMsg, DeRegisterMsg, DecodeError, ErrorMsg, Msg, RegisterMsg,
};
use crate::transport::{local_ip_for, PushSocket, ReplySocket};
use mtds_types::{EngineConfig, EngineMetadata, MtdsError, Result};
use std::any::Any;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Weak;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Most messages sent in one multipart push
pub const MAX_BATCH: usize = 50;

/// Cache operations the controller may trigger
pub trait CacheEngine: Send + Sync {
    /// Drop cached chunks for `tokens`, or every chunk when `None`.
    /// Returns how many entries were removed.
    fn clear(&self, tokens: Option<&[u32]>) -> Result<usize>;
}

/// Control-plane client of one cache worker
#[derive(Debug)]
pub struct Worker {
    instance_id: String,
    worker_id: u32,
    ip: String,
    port: u16,
    tx: mpsc::UnboundedSender<Msg>,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread, bind the reply socket on
    /// `worker_port + worker_id` and queue the registration.
    ///
    /// The worker only holds a weak handle to `engine`, so the engine may own
    /// the worker. Requests arriving after the engine is gone get an error
    /// reply.
    ///
    /// Fails if the controller settings are missing or the port cannot be
    /// bound.
    pub fn new(
        config: &EngineConfig,
        metadata: &EngineMetadata,
        engine: Weak<dyn CacheEngine>,
    ) -> Result<Self> {
        let controller_url = config
            .controller_url
            .clone()
            .ok_or_else(|| MtdsError::config("Worker requires controller_url"))?;
        let base_port = config
            .worker_port
            .ok_or_else(|| MtdsError::config("Worker requires worker_port"))?;
        let port = u16::try_from(u32::from(base_port) + metadata.worker_id).map_err(|_| {
            MtdsError::config(format!(
                "worker_port {} + worker_id {} is not a valid port",
                base_port, metadata.worker_id
            ))
        })?;
        let worker_id = metadata.worker_id;
        let ip = local_ip_for(&controller_url).to_string();

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<SocketAddr>>();

        let thread_shutdown = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(format!("mtds-worker-{}", worker_id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(MtdsError::internal(format!(
                            "Failed to build worker runtime: {}",
                            e
                        ))));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let reply = match ReplySocket::bind(&format!("0.0.0.0:{}", port)).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(reply.local_addr()));
                    info!("Starting MTDS worker {} on port {}", worker_id, reply.local_addr().port());

                    let push = PushSocket::new(controller_url);
                    tokio::join!(
                        push_loop(push, rx, thread_shutdown.clone()),
                        request_loop(reply, engine, thread_shutdown),
                    );
                    debug!("Worker {} loops exited", worker_id);
                });
            })
            .map_err(|e| MtdsError::internal(format!("Failed to spawn worker thread: {}", e)))?;

        let bound = ready_rx
            .recv()
            .map_err(|_| MtdsError::internal("Worker thread exited during startup"))
            .and_then(|r| r);
        let local_addr = match bound {
            Ok(addr) => addr,
            Err(e) => {
                let _ = thread.join();
                return Err(e);
            }
        };

        let worker = Self {
            instance_id: config.instance_id.clone(),
            worker_id,
            ip,
            port: local_addr.port(),
            tx,
            shutdown,
            thread: Some(thread),
        };
        worker.register()?;
        Ok(worker)
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Address advertised to the controller
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Port the reply socket is bound to
    pub fn port(&self) -> u16 {
        self.port
    }

    fn register(&self) -> Result<()> {
        info!(
            "Registering MTDS instance-worker: ({}, {})",
            self.instance_id, self.worker_id
        );
        self.put_msg(RegisterMsg {
            instance_id: self.instance_id.clone(),
            worker_id: self.worker_id,
            ip: self.ip.clone(),
            port: self.port,
        })
    }

    fn deregister(&self) -> Result<()> {
        self.put_msg(DeRegisterMsg {
            instance_id: self.instance_id.clone(),
            worker_id: self.worker_id,
            ip: self.ip.clone(),
            port: self.port,
        })
    }

    /// Queue a message for the push loop; safe to call from any thread
    pub fn put_msg(&self, msg: impl Into<Msg>) -> Result<()> {
        self.tx
            .send(msg.into())
            .map_err(|_| MtdsError::network("Worker is closed"))
    }

    /// Queue the deregistration, stop both loops and join the worker thread.
    /// Messages already queued are still pushed.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if let Err(e) = self.deregister() {
            warn!("Failed to queue deregistration: {}", e);
        }
        self.shutdown.cancel();
        // Closing from a request handler on the worker thread itself; the
        // loops exit on their own once the handler returns
        if thread.thread().id() == std::thread::current().id() {
            info!("Worker {} closing from its own thread", self.worker_id);
            return;
        }
        if thread.join().is_err() {
            error!("Worker {} thread panicked", self.worker_id);
        }
        info!("Worker {} closed", self.worker_id);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wait for one message, then take whatever else is already queued, up to
/// `max_batch`. Returns an empty batch on shutdown once the queue is drained.
pub(crate) async fn batched_recv(
    rx: &mut mpsc::UnboundedReceiver<Msg>,
    max_batch: usize,
    shutdown: &CancellationToken,
) -> Vec<Msg> {
    let mut batch = Vec::new();
    let first = tokio::select! {
        biased;
        msg = rx.recv() => msg,
        _ = shutdown.cancelled() => None,
    };
    let Some(first) = first else {
        return batch;
    };
    batch.push(first);
    while batch.len() < max_batch {
        match rx.try_recv() {
            Ok(msg) => batch.push(msg),
            Err(_) => break,
        }
    }
    batch
}

async fn push_loop(
    mut push: PushSocket,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    shutdown: CancellationToken,
) {
    loop {
        let batch = batched_recv(&mut rx, MAX_BATCH, &shutdown).await;
        if batch.is_empty() {
            break;
        }
        debug!("Sending {} messages", batch.len());

        let parts: Vec<Vec<u8>> = batch
            .iter()
            .filter_map(|msg| match msg.encode() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    error!("Push error: {}", e);
                    None
                }
            })
            .collect();
        if let Err(e) = push.send_multipart(&parts).await {
            error!("Push error: {}", e);
        }
    }
}

async fn request_loop(
    mut reply: ReplySocket,
    engine: Weak<dyn CacheEngine>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = reply.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let response = match engine.upgrade() {
            Some(engine) => handle_request(engine.as_ref(), request.payload()),
            None => {
                warn!("Request received after the cache engine was dropped");
                ErrorMsg {
                    error: "Worker error: cache engine is gone".to_string(),
                }
                .into()
            }
        };
        let bytes = response.encode().unwrap_or_else(|e| {
            error!("Failed to encode reply: {}", e);
            Msg::from(ErrorMsg {
                error: format!("Worker error: {}", e),
            })
            .encode()
            .unwrap_or_default()
        });
        request.respond(bytes);
    }
}

/// Serve one control request; always produces a reply
pub fn handle_request(engine: &dyn CacheEngine, payload: &[u8]) -> Msg {
    let request = match Msg::decode(payload) {
        Ok(request) => request,
        Err(DecodeError::UnknownTag(tag)) => {
            error!("Unknown message: {}", tag);
            return ErrorMsg {
                error: format!("Unknown message: {}", tag),
            }
            .into();
        }
        Err(e @ DecodeError::Malformed(_)) => {
            error!("Worker error: {}", e);
            return ErrorMsg {
                error: format!("Worker error: {}", e),
            }
            .into();
        }
    };
    debug!("Received message: {:?}", request);

    match request {
        Msg::ClearWorker(clear) => match clear_guarded(engine, clear.tokens.as_deref()) {
            Ok(removed) => ClearWorkerRetMsg {
                success: removed > 0,
            }
            .into(),
            Err(e) => {
                error!("Worker error: {}", e);
                ErrorMsg {
                    error: format!("Worker error: {}", e),
                }
                .into()
            }
        },
        other => {
            error!("Unknown message: {}", other.tag());
            ErrorMsg {
                error: format!("Unknown message: {}", other.tag()),
            }
            .into()
        }
    }
}

/// Run the engine's clear, turning a panic into an error so the request
/// loop keeps serving
fn clear_guarded(engine: &dyn CacheEngine, tokens: Option<&[u32]>) -> Result<usize> {
    catch_unwind(AssertUnwindSafe(|| engine.clear(tokens))).unwrap_or_else(|panic| {
        Err(MtdsError::internal(format!(
            "clear panicked: {}",
            panic_message(panic.as_ref())
        )))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
