//! Method dispatch: tasks, the response sink, and the handler table.
//!
//! A [`Task`] couples the parsed parameters with the frame buffer they point
//! into, so the zero-copy views and their backing storage move (and die)
//! together. Tasks are pool records: one worker owns a task from submission
//! to completion, and dropping it releases both the record and the frame.
//!
//! Handlers never touch sockets. They receive a [`ResponseSink`], which
//! formats outbound frames into pool records and hands them to the MPSC
//! queue; the ingress thread is the only socket writer.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::codec::{self, FrameBuf, Params, ParsedFrame, CODE_APP_ERROR};
use crate::pipeline::{PipelineBackend, PipelineId};
use crate::shutdown::WakePipe;
use crate::stdx::mpsc_queue::MpscProducer;
use crate::stdx::object_pool::{AcquireError, ObjectPool, Pooled};

// ============================================================================
// Task
// ============================================================================

/// One unit of work: a validated request plus its owning frame.
pub struct Task {
    pub req_id: u64,
    pub params: Params,
    frame: zmq::Message,
}

impl Task {
    pub fn new(parsed: ParsedFrame, frame: zmq::Message) -> Self {
        Self {
            req_id: parsed.req_id,
            params: parsed.params,
            frame,
        }
    }

    /// Start descriptor view into the owning frame. `None` for control
    /// methods.
    pub fn descriptor(&self) -> Option<&str> {
        match &self.params {
            Params::Start { descriptor } => Some(
                std::str::from_utf8(&self.frame[descriptor.clone()])
                    .expect("descriptor validated at parse"),
            ),
            _ => None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("req_id", &self.req_id)
            .field("method", &self.params.method().name())
            .finish()
    }
}

// ============================================================================
// ResponseSink
// ============================================================================

/// Handle through which handlers (and the ingress thread) enqueue outbound
/// frames.
///
/// Every emission allocates a [`FrameBuf`] record from the frame pool,
/// formats into it, pushes it onto the outbound MPSC queue, and rings the
/// doorbell so a poller blocked on its sockets wakes up to drain.
pub struct ResponseSink {
    frames: ObjectPool<FrameBuf>,
    out: MpscProducer<Pooled<FrameBuf>>,
    doorbell: Arc<WakePipe>,
}

impl Clone for ResponseSink {
    fn clone(&self) -> Self {
        Self {
            frames: self.frames.clone(),
            out: self.out.clone(),
            doorbell: Arc::clone(&self.doorbell),
        }
    }
}

impl ResponseSink {
    pub fn new(
        frames: ObjectPool<FrameBuf>,
        out: MpscProducer<Pooled<FrameBuf>>,
        doorbell: Arc<WakePipe>,
    ) -> Self {
        Self {
            frames,
            out,
            doorbell,
        }
    }

    /// Enqueue a result frame for `req_id`. `result_json` must be well-formed
    /// JSON.
    pub fn respond(&self, req_id: u64, result_json: &str) -> Result<(), AcquireError> {
        self.emit(|buf| codec::write_response(buf, req_id, result_json))
    }

    /// Enqueue an error frame.
    pub fn error(&self, id: i64, code: i32, message: &str) -> Result<(), AcquireError> {
        self.emit(|buf| codec::write_error(buf, id, code, message))
    }

    /// Enqueue a log notification.
    pub fn log(&self, level: &str, message: &str) -> Result<(), AcquireError> {
        self.emit(|buf| codec::write_log(buf, level, message))
    }

    fn emit(&self, fill: impl FnOnce(&mut FrameBuf)) -> Result<(), AcquireError> {
        let mut frame = self.frames.acquire(FrameBuf::new())?;
        fill(&mut frame);
        self.out.push(frame);
        self.doorbell.ring();
        Ok(())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Maps a task's method tag to its backend call and formats the outcome.
///
/// Unknown methods never reach this point: the method id is a closed enum,
/// so the codec rejects out-of-range ids with `-32601` before a task exists.
pub struct Dispatcher {
    backend: Arc<dyn PipelineBackend>,
    benchmark: bool,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn PipelineBackend>, benchmark: bool) -> Self {
        Self { backend, benchmark }
    }

    /// Execute one task and enqueue its response or error.
    ///
    /// Backend failures become `-32000` errors carrying the request id. When
    /// the frame pool is exhausted the response is dropped; the client keeps
    /// the ack, which the delivery contract permits.
    pub fn dispatch(&self, task: &Task, sink: &ResponseSink) {
        let started = self.benchmark.then(Instant::now);
        let req_id = task.req_id;

        let outcome = match &task.params {
            Params::Start { .. } => {
                let descriptor = task.descriptor().expect("start params carry a descriptor");
                self.backend.start(descriptor).map(start_result)
            }
            Params::Pause { pipeline_id } => self
                .backend
                .pause(*pipeline_id)
                .map(|()| control_result(*pipeline_id, "Pipeline paused")),
            Params::Resume { pipeline_id } => self
                .backend
                .resume(*pipeline_id)
                .map(|()| control_result(*pipeline_id, "Pipeline resumed")),
            Params::Stop { pipeline_id } => self
                .backend
                .stop(*pipeline_id)
                .map(|()| control_result(*pipeline_id, "Pipeline stopped")),
        };

        let sent = match outcome {
            Ok(result_json) => sink.respond(req_id, &result_json),
            Err(err) => sink.error(req_id as i64, CODE_APP_ERROR, &err.to_string()),
        };
        if let Err(err) = sent {
            eprintln!("response dropped req_id={req_id}: {err}");
        }

        if let Some(started) = started {
            let _ = sink.log(
                "INFO",
                &format!(
                    "{} latency: {}us",
                    task.params.method().name(),
                    started.elapsed().as_micros()
                ),
            );
        }
    }
}

fn start_result(id: PipelineId) -> String {
    format!("{{\"status\":\"success\",\"pipelineId\":{id},\"details\":\"Pipeline started\"}}")
}

fn control_result(id: PipelineId, details: &str) -> String {
    format!("{{\"status\":\"success\",\"pipelineId\":{id},\"details\":\"{details}\"}}")
}

// ============================================================================
// Tests
// ============================================================================
