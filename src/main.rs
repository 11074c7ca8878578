use std::env;
use std::process;
use std::sync::Arc;

use mediactl_rs::{PipelineRegistry, Server, ServerConfig, ShutdownController};

fn main() {
    let mut args = env::args_os();
    let exe = args.next().unwrap_or_else(|| "mediactl-rs".into());
    let mut benchmark = false;

    for arg in args {
        match arg.to_str() {
            Some("--benchmark") => benchmark = true,
            Some("--help") | Some("-h") => {
                eprintln!("usage: {} [--benchmark]", exe.to_string_lossy());
                process::exit(0);
            }
            _ => {
                eprintln!("unknown argument: {}", arg.to_string_lossy());
                eprintln!("usage: {} [--benchmark]", exe.to_string_lossy());
                process::exit(2);
            }
        }
    }

    let mut cfg = ServerConfig::from_env();
    cfg.benchmark = benchmark;

    let shutdown = match ShutdownController::new() {
        Ok(ctl) => Arc::new(ctl),
        Err(err) => {
            eprintln!("failed to create shutdown controller: {err}");
            process::exit(1);
        }
    };
    shutdown.install_signal_handlers();

    let backend = Arc::new(PipelineRegistry::new());
    let mut server = match Server::new(&cfg, backend, Arc::clone(&shutdown)) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("initialization failed: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = server.run() {
        eprintln!("server failed: {err}");
        process::exit(1);
    }
}
