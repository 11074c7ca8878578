//! The ingress loop: sockets, poll, demux, dispatch, drain.
//!
//! One thread owns both sockets. It polls the command socket together with
//! two wake fds (shutdown, outbound doorbell), parses each inbound frame with
//! zero copy, publishes the ack synchronously, hands the task to the worker
//! pool, and drains the outbound MPSC queue onto the publish socket. Workers
//! never touch a socket.
//!
//! # Ordering
//!
//! The ack for a request is published before its task is submitted, so it
//! precedes that request's response on the wire. Responses from different
//! requests are unordered relative to each other.
//!
//! # Back-pressure
//!
//! Publishes are non-blocking with a high-water mark; the transport sheds
//! frames beyond it and the server logs the drop. Inbound frames are never
//! dropped at ingress: a refused worker submission turns into an error
//! response for the caller.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::codec::{self, FrameBuf, CODE_APP_ERROR};
use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, ResponseSink, Task};
use crate::pipeline::PipelineBackend;
use crate::shutdown::{ShutdownController, WakePipe};
use crate::stdx::mpsc_queue::{self, MpscConsumer};
use crate::stdx::object_pool::{ObjectPool, Pooled};
use crate::workers::{SubmitError, WorkerPool, WorkerPoolConfig};

// ============================================================================
// Errors
// ============================================================================

/// Fatal server failures (initialization and transport teardown).
#[derive(Debug)]
#[non_exhaustive]
pub enum ServerError {
    /// ZeroMQ socket or context failure.
    Transport(zmq::Error),
    /// Wake primitive creation failed.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

impl From<zmq::Error> for ServerError {
    fn from(err: zmq::Error) -> Self {
        Self::Transport(err)
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Default)]
struct ServerStats {
    received: u64,
    acks: u64,
    responses: u64,
    parse_errors: u64,
    busy_rejections: u64,
    publish_drops: u64,
}

pub struct Server {
    // Sockets keep the context alive; held anyway for explicit teardown order.
    _ctx: zmq::Context,
    pub_socket: zmq::Socket,
    sub_socket: zmq::Socket,
    shutdown: Arc<ShutdownController>,
    doorbell: Arc<WakePipe>,
    out_rx: MpscConsumer<Pooled<FrameBuf>>,
    workers: WorkerPool,
    task_pool: ObjectPool<Task>,
    frame_pool: ObjectPool<FrameBuf>,
    stats: ServerStats,
}

impl Server {
    /// Bind sockets and bring up pools, queue, and workers.
    ///
    /// Socket options follow the deployment profile: 1 MiB kernel buffers,
    /// high-water mark 1000, linger 0; the publisher drops frames for
    /// not-yet-connected peers instead of queueing them.
    pub fn new(
        cfg: &ServerConfig,
        backend: Arc<dyn PipelineBackend>,
        shutdown: Arc<ShutdownController>,
    ) -> Result<Self, ServerError> {
        cfg.validate();

        let ctx = zmq::Context::new();

        let pub_socket = ctx.socket(zmq::PUB)?;
        pub_socket.set_sndbuf(1024 * 1024)?;
        pub_socket.set_sndhwm(1000)?;
        pub_socket.set_linger(0)?;
        pub_socket.set_immediate(true)?;
        pub_socket.bind(&cfg.pub_endpoint)?;

        let sub_socket = ctx.socket(zmq::SUB)?;
        sub_socket.set_rcvbuf(1024 * 1024)?;
        sub_socket.set_rcvhwm(1000)?;
        sub_socket.set_linger(0)?;
        sub_socket.bind(&cfg.sub_endpoint)?;
        sub_socket.set_subscribe(b"")?;

        let task_pool: ObjectPool<Task> = ObjectPool::new(cfg.task_pool);
        let frame_pool: ObjectPool<FrameBuf> = ObjectPool::with_reset(
            cfg.frame_pool,
            Some(FrameBuf::reset as fn(&mut FrameBuf)),
        );
        if let Some(interval) = cfg.scavenge_interval {
            task_pool.start_scavenger(interval);
            frame_pool.start_scavenger(interval);
        }

        let (out_tx, out_rx) = mpsc_queue::channel();
        let doorbell = Arc::new(WakePipe::new()?);
        let sink = ResponseSink::new(frame_pool.clone(), out_tx, Arc::clone(&doorbell));
        let dispatcher = Arc::new(Dispatcher::new(backend, cfg.benchmark));
        let workers = WorkerPool::new(
            WorkerPoolConfig {
                workers: cfg.workers,
                queue_cap: cfg.queue_cap,
                ..WorkerPoolConfig::default()
            },
            dispatcher,
            sink,
            task_pool.clone(),
            frame_pool.clone(),
        );

        eprintln!(
            "server listening cmd={} pub={} workers={}",
            cfg.sub_endpoint, cfg.pub_endpoint, cfg.workers
        );

        Ok(Self {
            _ctx: ctx,
            pub_socket,
            sub_socket,
            shutdown,
            doorbell,
            out_rx,
            workers,
            task_pool,
            frame_pool,
            stats: ServerStats::default(),
        })
    }

    /// Run the poll loop until shutdown, then drain and tear down.
    pub fn run(&mut self) -> Result<(), ServerError> {
        // Ingress allocates acks and task records, so it registers with the
        // pools like any worker.
        let task_reg = self.task_pool.register_thread();
        let frame_reg = self.frame_pool.register_thread();

        loop {
            let (cmd_ready, wake_ready, bell_ready);
            {
                let mut items = [
                    self.sub_socket.as_poll_item(zmq::POLLIN),
                    zmq::PollItem::from_fd(self.shutdown.wake_fd(), zmq::POLLIN),
                    zmq::PollItem::from_fd(self.doorbell.read_fd(), zmq::POLLIN),
                ];
                match zmq::poll(&mut items, -1) {
                    Ok(_) => {}
                    Err(zmq::Error::EINTR) => continue,
                    Err(zmq::Error::ETERM) => break,
                    Err(err) => {
                        eprintln!("poll error: {err}");
                        continue;
                    }
                }
                cmd_ready = items[0].is_readable();
                wake_ready = items[1].is_readable();
                bell_ready = items[2].is_readable();
            }

            // POLLIN on the wake fd is the authoritative shutdown signal.
            if wake_ready {
                self.shutdown.drain();
                break;
            }
            if cmd_ready {
                self.drain_commands();
            }
            if bell_ready {
                self.doorbell.drain();
            }
            self.drain_outbound();
        }

        // Stop accepting, finish queued work, flush, release.
        self.workers.stop();
        self.drain_outbound();
        drop(task_reg);
        drop(frame_reg);
        self.task_pool.shutdown();
        self.frame_pool.shutdown();

        eprintln!(
            "server stopped received={} acks={} responses={} parse_errors={} busy={} publish_drops={}",
            self.stats.received,
            self.stats.acks,
            self.stats.responses,
            self.stats.parse_errors,
            self.stats.busy_rejections,
            self.stats.publish_drops,
        );
        Ok(())
    }

    /// Pull every pending command frame without blocking.
    fn drain_commands(&mut self) {
        loop {
            if self.shutdown.requested() {
                break;
            }
            let msg = match self.sub_socket.recv_msg(zmq::DONTWAIT) {
                Ok(msg) => msg,
                Err(zmq::Error::EAGAIN) => break,
                Err(err) => {
                    eprintln!("recv error: {err}");
                    self.publish_frame(|buf| {
                        codec::write_error(buf, -1, CODE_APP_ERROR, "Receive error");
                    });
                    break;
                }
            };
            self.stats.received += 1;
            self.handle_frame(msg);
        }
    }

    fn handle_frame(&mut self, msg: zmq::Message) {
        let parsed = match codec::parse(&msg) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.stats.parse_errors += 1;
                eprintln!("rejected frame: {err}");
                let (id, code) = (err.response_id(), err.code());
                self.publish_frame(|buf| {
                    codec::write_error(buf, id, code, codec::canonical_message(code));
                });
                return;
            }
        };

        let req_id = parsed.req_id;
        // First promise to the client: the ack is on the wire before the
        // task can produce anything.
        self.stats.acks += 1;
        self.publish_frame(|buf| codec::write_ack(buf, req_id));

        let task = match self.task_pool.acquire(Task::new(parsed, msg)) {
            Ok(task) => task,
            Err(err) => {
                self.publish_frame(|buf| {
                    codec::write_error(
                        buf,
                        req_id as i64,
                        CODE_APP_ERROR,
                        &format!("Handler error: {err}"),
                    );
                });
                return;
            }
        };

        match self.workers.submit(task) {
            Ok(()) => {}
            Err(SubmitError::Busy(task)) => {
                self.stats.busy_rejections += 1;
                drop(task);
                self.publish_frame(|buf| {
                    codec::write_error(
                        buf,
                        req_id as i64,
                        CODE_APP_ERROR,
                        "Handler error: worker pool busy",
                    );
                });
            }
        }
    }

    /// Publish every frame the workers have queued.
    fn drain_outbound(&mut self) {
        while let Some(frame) = self.out_rx.pop() {
            self.stats.responses += 1;
            self.publish(frame.as_bytes());
            // Dropping the frame returns its record to this thread's cache.
        }
    }

    /// Format into a pool record and publish synchronously. Falls back to a
    /// stack buffer when the pool is dry: acks and ingress errors must not
    /// depend on pool headroom.
    fn publish_frame(&mut self, fill: impl FnOnce(&mut FrameBuf)) {
        match self.frame_pool.acquire(FrameBuf::new()) {
            Ok(mut frame) => {
                fill(&mut frame);
                self.publish(frame.as_bytes());
            }
            Err(_) => {
                let mut frame = FrameBuf::new();
                fill(&mut frame);
                self.publish(frame.as_bytes());
            }
        }
    }

    fn publish(&mut self, bytes: &[u8]) {
        match self.pub_socket.send(bytes, zmq::DONTWAIT) {
            Ok(()) => {}
            Err(zmq::Error::EAGAIN) => {
                // High-water mark: the transport sheds, we log.
                self.stats.publish_drops += 1;
            }
            Err(err) => {
                self.stats.publish_drops += 1;
                eprintln!("publish error: {err}");
            }
        }
    }
}
