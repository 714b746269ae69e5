// src/server.rs
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::EmberResult;
use crate::pool::WorkerPool;
use crate::reactor::Engine;
use crate::syscalls;

/// Pending-connection backlog handed to listen(2).
const LISTEN_BACKLOG: i32 = 5;

/// A bound server, ready to run. Binding and running are split so callers
/// (and tests) can learn the actual port and obtain a shutdown handle
/// before the loop starts.
pub struct Server {
    config: Config,
    engine: Arc<Engine>,
    port: u16,
}

/// Clonable handle that stops the server from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    engine: Arc<Engine>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

impl Server {
    pub fn bind(config: Config) -> EmberResult<Self> {
        config.validate()?;
        syscalls::ignore_sigpipe();

        let listen_fd =
            syscalls::create_listen_socket(&config.host, config.port, LISTEN_BACKLOG)?;
        let port = syscalls::local_port(listen_fd)?;

        let engine = Arc::new(Engine::new(
            listen_fd,
            config.doc_root.clone(),
            config.max_connections,
            config.read_buf_size,
            config.write_buf_size,
            config.idle_timeout_secs,
        )?);

        Ok(Self {
            config,
            engine,
            port,
        })
    }

    /// The bound port; differs from the configured one when binding port 0.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            engine: self.engine.clone(),
        }
    }

    /// Run the event loop on the calling thread until shutdown or a fatal
    /// readiness-polling failure. Per-connection errors never reach here.
    pub fn run(self) -> EmberResult<()> {
        let workers = self.config.worker_count();
        let pool = WorkerPool::spawn(workers, self.engine.queue.clone(), self.engine.clone())?;

        tracing::info!(
            host = %self.config.host,
            port = self.port,
            workers,
            max_connections = self.config.max_connections,
            root = %self.config.doc_root.display(),
            "ember listening"
        );

        spawn_metrics_reporter(self.engine.clone());

        let result = self.engine.run();
        if let Err(e) = &result {
            tracing::error!(error = %e, "event loop failed");
        }

        // Loop is done: release the workers, then tear down whatever is
        // still parked. Nothing is checked out once the pool has joined.
        self.engine.queue.close();
        pool.join();
        self.engine.shutdown_cleanup();

        tracing::info!("ember shut down");
        result
    }
}

fn spawn_metrics_reporter(engine: Arc<Engine>) {
    thread::Builder::new()
        .name("ember-metrics".to_string())
        .spawn(move || {
            loop {
                for _ in 0..5 {
                    thread::sleep(Duration::from_secs(1));
                    if engine.is_shutting_down() {
                        return;
                    }
                }
                tracing::info!(
                    active_connections = engine.metrics.active_conns.load(Ordering::Relaxed),
                    total_requests = engine.metrics.total_requests.load(Ordering::Relaxed),
                    bytes_sent = engine.metrics.bytes_sent.load(Ordering::Relaxed),
                    "metrics"
                );
            }
        })
        .ok();
}
