//! The worker pool.
//!
//! Workers drain a shared MPMC run queue of connection handles. A worker
//! takes one connection and processes at most K frames from its queue
//! before handing the connection back, so one busy client cannot starve
//! the others. The pool starts at its configured initial size; a janitor
//! grows it toward the maximum while the run queue backs up, and growth
//! workers retire themselves after sitting idle.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::dispatch;
use crate::session::{self, Connection};
use crate::Server;

/// Spawns the initial worker set and the janitor. Called once at server
/// start.
pub fn start(server: &Arc<Server>) {
    for index in 0..server.config.workers_initial {
        spawn_worker(server, index, false);
    }
    server.worker_count.store(server.config.workers_initial, Ordering::Release);
    spawn_janitor(server);
}

fn spawn_worker(server: &Arc<Server>, index: usize, temporary: bool) {
    let server = Arc::clone(server);
    tokio::spawn(async move {
        let idle_patience = Duration::from_secs(server.config.worker_idle_secs.max(1));
        loop {
            let received = if temporary {
                match tokio::time::timeout(idle_patience, server.run_rx().recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        // Idle past the threshold: shrink back to the base
                        // pool size.
                        server.worker_count.fetch_sub(1, Ordering::AcqRel);
                        trace!(index, "idle worker retired");
                        return;
                    }
                }
            } else {
                server.run_rx().recv().await
            };
            let Ok(connection) = received else { return };
            run_connection(&server, &connection).await;
        }
    });
}

/// One packet run: up to K frames from this connection's queue.
async fn run_connection(server: &Arc<Server>, connection: &Arc<Connection>) {
    let budget = server.config.max_packets_per_run;
    for _ in 0..budget {
        let Some(request) = connection.queue.pop() else { break };
        if dispatch::process(server, connection, request).await.is_err() {
            debug!(connection = connection.id, "fatal protocol error");
            session::teardown_connection(server, connection).await;
            server.forget_connection(connection.id);
            return;
        }
        if connection.closing.load(Ordering::Acquire) {
            return;
        }
    }
    connection.finish_run(server);
}

fn spawn_janitor(server: &Arc<Server>) {
    let server = Arc::clone(server);
    tokio::spawn(async move {
        let stale = Duration::from_secs(server.config.transaction_stale_secs);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            // Grow while requests queue faster than workers drain them.
            let backlog = server.run_rx().len();
            let workers = server.worker_count.load(Ordering::Acquire);
            if backlog > 0 && workers < server.config.workers_maximum {
                server.worker_count.fetch_add(1, Ordering::AcqRel);
                spawn_worker(&server, workers, true);
                trace!(workers = workers + 1, backlog, "worker pool grown");
            }

            // Abandoned transaction reassemblies go stale and get dropped.
            for connection in server.connections_snapshot() {
                let dropped = crate::trans::reap_stale(&connection, stale);
                if dropped > 0 {
                    debug!(connection = connection.id, dropped, "stale transactions reaped");
                }
            }
        }
    });
}
