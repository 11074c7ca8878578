//! Pub/sub RPC dispatch server for multimedia pipeline control.
//!
//! Commands arrive as binary frames on a subscribe socket, run on a fixed
//! pool of worker threads, and produce JSON-RPC 2.0 acks, results, errors,
//! and log notifications on a publish socket. The dispatch core is
//! payload-agnostic; pipeline execution sits behind a backend trait.
//!
//! Request flow:
//! 1) Ingress polls the command socket plus two wake fds (shutdown,
//!    outbound doorbell).
//! 2) Each frame is parsed zero-copy and acked synchronously.
//! 3) The task (parsed views + owning frame, as one pool record) goes to
//!    the worker pool's bounded FIFO.
//! 4) Handlers emit responses through the MPSC outbound queue; ingress is
//!    the sole writer on the publish socket and drains it.
//!
//! Allocation on the hot path goes through the lock-free object pool in
//! [`stdx::object_pool`]; the outbound queue is [`stdx::mpsc_queue`].

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod pipeline;
pub mod server;
pub mod shutdown;
pub mod stdx;
pub mod workers;

pub use config::ServerConfig;
pub use pipeline::{PipelineBackend, PipelineError, PipelineId, PipelineRegistry};
pub use server::{Server, ServerError};
pub use shutdown::ShutdownController;
