//! End-to-end scenarios over loopback TCP: ack-then-response ordering,
//! protocol errors, graceful shutdown under load, pool exhaustion.
//!
//! Each test uses its own port pair so the suite can run in parallel. PUB/SUB
//! joins settle asynchronously, so clients sleep briefly after connecting
//! before publishing commands.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mediactl_rs::codec::{self, Method};
use mediactl_rs::pipeline::{PipelineBackend, PipelineError, PipelineId};
use mediactl_rs::stdx::object_pool::PoolConfig;
use mediactl_rs::{PipelineRegistry, Server, ServerConfig, ShutdownController};

const SETTLE: Duration = Duration::from_millis(300);

fn base_cfg() -> ServerConfig {
    ServerConfig {
        workers: 2,
        queue_cap: 64,
        scavenge_interval: None,
        ..ServerConfig::default()
    }
}

struct TestServer {
    shutdown: Arc<ShutdownController>,
    handle: Option<JoinHandle<()>>,
    cmd: zmq::Socket,
    events: zmq::Socket,
    _ctx: zmq::Context,
}

impl TestServer {
    fn spawn(
        mut cfg: ServerConfig,
        backend: Arc<dyn PipelineBackend>,
        port_base: u16,
    ) -> TestServer {
        cfg.pub_endpoint = format!("tcp://127.0.0.1:{port_base}");
        cfg.sub_endpoint = format!("tcp://127.0.0.1:{}", port_base + 1);

        let shutdown = Arc::new(ShutdownController::new().expect("controller"));
        let mut server = Server::new(&cfg, backend, Arc::clone(&shutdown)).expect("server init");
        let handle = thread::spawn(move || server.run().expect("server run"));

        let ctx = zmq::Context::new();
        let cmd = ctx.socket(zmq::PUB).expect("cmd socket");
        cmd.set_linger(0).expect("linger");
        cmd.connect(&cfg.sub_endpoint).expect("connect cmd");

        let events = ctx.socket(zmq::SUB).expect("events socket");
        events.set_linger(0).expect("linger");
        events.set_rcvtimeo(3_000).expect("rcvtimeo");
        events.connect(&cfg.pub_endpoint).expect("connect events");
        events.set_subscribe(b"").expect("subscribe");

        thread::sleep(SETTLE);

        TestServer {
            shutdown,
            handle: Some(handle),
            cmd,
            events,
            _ctx: ctx,
        }
    }

    fn send(&self, frame: &[u8]) {
        self.cmd.send(frame, 0).expect("send command");
    }

    /// Next event frame as JSON, or `None` on receive timeout.
    fn recv_json(&self) -> Option<serde_json::Value> {
        match self.events.recv_bytes(0) {
            Ok(bytes) => {
                Some(serde_json::from_slice(&bytes).expect("server emitted invalid JSON"))
            }
            Err(zmq::Error::EAGAIN) => None,
            Err(err) => panic!("event recv failed: {err}"),
        }
    }

    /// Assert no further frame arrives within a short window.
    fn expect_silence(&self) {
        self.events.set_rcvtimeo(300).expect("rcvtimeo");
        assert!(
            self.recv_json().is_none(),
            "expected no further frames on the event stream"
        );
        self.events.set_rcvtimeo(3_000).expect("rcvtimeo");
    }

    fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            handle.join().expect("server thread");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

#[test]
fn start_then_stop_acks_before_responses() {
    let mut ts = TestServer::spawn(base_cfg(), Arc::new(PipelineRegistry::new()), 7710);

    ts.send(&codec::encode_start(1, "videotestsrc ! fakesink"));
    let ack = ts.recv_json().expect("ack for request 1");
    assert_eq!(ack["jsonrpc"], "2.0");
    assert_eq!(ack["ack"], 1);
    assert_eq!(ack["id"], 1);

    let response = ts.recv_json().expect("response for request 1");
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["status"], "success");
    let pipeline_id = response["result"]["pipelineId"].as_u64().expect("id") as u32;

    ts.send(&codec::encode_control(2, Method::PipelineStop, pipeline_id));
    let ack = ts.recv_json().expect("ack for request 2");
    assert_eq!(ack["ack"], 1);
    assert_eq!(ack["id"], 2);
    let response = ts.recv_json().expect("response for request 2");
    assert_eq!(response["id"], 2);
    assert_eq!(response["result"]["details"], "Pipeline stopped");

    ts.expect_silence();
    ts.stop();
}

#[test]
fn unknown_method_gets_exactly_one_error() {
    let mut ts = TestServer::spawn(base_cfg(), Arc::new(PipelineRegistry::new()), 7720);

    let mut frame = codec::encode_start(42, "");
    frame[8] = 0xFE;
    ts.send(&frame);

    let error = ts.recv_json().expect("error frame");
    assert_eq!(error["jsonrpc"], "2.0");
    assert_eq!(error["id"], 42);
    assert_eq!(error["error"]["code"], -32601);
    assert_eq!(error["error"]["message"], "Method not found");

    // No ack, no response, nothing else.
    ts.expect_silence();
    ts.stop();
}

#[test]
fn malformed_frame_gets_parse_error_with_unknown_id() {
    let mut ts = TestServer::spawn(base_cfg(), Arc::new(PipelineRegistry::new()), 7730);

    ts.send(&[0x01, 0x02, 0x03]);

    let error = ts.recv_json().expect("error frame");
    assert_eq!(error["id"], -1);
    assert_eq!(error["error"]["code"], -32700);
    assert_eq!(error["error"]["message"], "Parse error");

    ts.expect_silence();
    ts.stop();
}

#[test]
fn graceful_shutdown_under_load_answers_every_acked_request() {
    let cfg = ServerConfig {
        workers: 4,
        queue_cap: 256,
        task_pool: PoolConfig {
            prealloc: 256,
            max_thread_cache: 16,
            dynamic_expansion: true,
            max_total_objects: 1024,
        },
        frame_pool: PoolConfig {
            prealloc: 512,
            max_thread_cache: 16,
            dynamic_expansion: true,
            max_total_objects: 2048,
        },
        scavenge_interval: Some(Duration::from_millis(200)),
        ..ServerConfig::default()
    };
    let mut ts = TestServer::spawn(cfg, Arc::new(PipelineRegistry::new()), 7740);

    // Line-rate traffic with a shutdown landing mid-stream. The pause before
    // the trigger lets the ingress dequeue the first burst, so the test has
    // acked traffic to make promises about.
    for req_id in 1..=250u64 {
        ts.send(&codec::encode_start(req_id, "videotestsrc ! fakesink"));
    }
    thread::sleep(Duration::from_millis(150));
    ts.shutdown.trigger();
    for req_id in 251..=500u64 {
        ts.send(&codec::encode_start(req_id, "videotestsrc ! fakesink"));
    }
    ts.stop();

    // Collect everything that made it onto the wire.
    let mut acked: HashSet<u64> = HashSet::new();
    let mut answered: HashSet<u64> = HashSet::new();
    ts.events.set_rcvtimeo(500).expect("rcvtimeo");
    while let Some(frame) = ts.recv_json() {
        let id = frame["id"].as_u64().expect("positive id on load test frames");
        if frame.get("ack").is_some() {
            assert!(acked.insert(id), "duplicate ack for {id}");
        } else {
            assert!(
                frame.get("result").is_some() || frame.get("error").is_some(),
                "unexpected frame shape: {frame}"
            );
            assert!(answered.insert(id), "duplicate answer for {id}");
            assert!(
                acked.contains(&id),
                "response for {id} arrived before its ack"
            );
        }
    }

    // Every dequeued request was acked and every submitted task completed:
    // the answered set must match the acked set exactly.
    assert!(!acked.is_empty(), "no request was processed before shutdown");
    let unanswered: Vec<_> = acked.difference(&answered).collect();
    assert!(
        unanswered.is_empty(),
        "acked requests left unanswered: {unanswered:?}"
    );
    let unacked: Vec<_> = answered.difference(&acked).collect();
    assert!(unacked.is_empty(), "answers without acks: {unacked:?}");
}

#[test]
fn task_pool_exhaustion_surfaces_as_handler_errors() {
    struct SlowBackend {
        inner: PipelineRegistry,
        delay: Duration,
    }
    impl PipelineBackend for SlowBackend {
        fn start(&self, descriptor: &str) -> Result<PipelineId, PipelineError> {
            thread::sleep(self.delay);
            self.inner.start(descriptor)
        }
        fn stop(&self, id: PipelineId) -> Result<(), PipelineError> {
            self.inner.stop(id)
        }
        fn pause(&self, id: PipelineId) -> Result<(), PipelineError> {
            self.inner.pause(id)
        }
        fn resume(&self, id: PipelineId) -> Result<(), PipelineError> {
            self.inner.resume(id)
        }
    }

    let cfg = ServerConfig {
        workers: 1,
        queue_cap: 32,
        task_pool: PoolConfig {
            prealloc: 4,
            max_thread_cache: 4,
            dynamic_expansion: false,
            max_total_objects: 4,
        },
        scavenge_interval: None,
        ..ServerConfig::default()
    };
    let backend = Arc::new(SlowBackend {
        inner: PipelineRegistry::new(),
        delay: Duration::from_millis(150),
    });
    let mut ts = TestServer::spawn(cfg, backend, 7750);

    for req_id in 1..=6u64 {
        ts.send(&codec::encode_start(req_id, "videotestsrc ! fakesink"));
    }

    // 6 acks + 4 successes + 2 exhaustion errors.
    let mut acks = 0usize;
    let mut successes = 0usize;
    let mut exhausted = 0usize;
    let deadline = Instant::now() + Duration::from_secs(10);
    while acks + successes + exhausted < 12 {
        assert!(Instant::now() < deadline, "timed out collecting frames");
        let Some(frame) = ts.recv_json() else { continue };
        if frame.get("ack").is_some() {
            acks += 1;
        } else if frame.get("result").is_some() {
            successes += 1;
        } else {
            let message = frame["error"]["message"].as_str().expect("message");
            assert!(
                message.contains("exhausted"),
                "expected an exhaustion-flavored error, got: {message}"
            );
            exhausted += 1;
        }
    }
    assert_eq!(acks, 6);
    assert_eq!(successes, 4);
    assert_eq!(exhausted, 2);

    ts.expect_silence();
    ts.stop();
}
