// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic liveness tasks.
//!
//! - **Heartbeat**: every `heartbeat_timeout / 3`, ping every connected
//!   agent through a pinger pool and disconnect the ones silent for longer
//!   than `heartbeat_timeout`.
//! - **Eviction**: every `eviction_timeout / 3`, forget dynamic agents that
//!   stayed disconnected for `eviction_timeout`. Disabled by default.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, error, info, trace, warn};

use crate::config::RouterConfig;
use crate::dispatch::{Task, TaskSender};
use crate::metrics::RouterMetrics;
use crate::protocol::Message;
use crate::registry::{AgentRegistry, Client, SendError};

/// One heartbeat to deliver.
struct PingJob {
    client: Arc<Client>,
    heartbeat_id: u64,
    done: Sender<()>,
}

/// Running liveness threads.
pub struct LivenessManager {
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl LivenessManager {
    /// Start the heartbeat task, and the eviction task when enabled.
    pub fn start(
        config: &RouterConfig,
        registry: Arc<AgentRegistry>,
        metrics: Arc<RouterMetrics>,
        tasks: TaskSender,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let mut threads = Vec::new();

        let (ping_tx, ping_rx) = channel::unbounded::<PingJob>();
        for index in 0..config.heartbeat_sender_threads {
            let rx = ping_rx.clone();
            let metrics = metrics.clone();
            let tasks = tasks.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("hdds-router-pinger-{}", index))
                    .spawn(move || pinger_loop(rx, metrics, tasks))?,
            );
        }

        let heartbeat = HeartbeatTask {
            timeout: config.heartbeat_timeout(),
            period: config.heartbeat_period(),
            next_id: AtomicU64::new(1),
            registry: registry.clone(),
            metrics: metrics.clone(),
            tasks,
            pings: ping_tx,
        };
        let rx = stop_rx.clone();
        threads.push(
            thread::Builder::new()
                .name("hdds-router-heartbeat".to_string())
                .spawn(move || {
                    let period = heartbeat.period;
                    run_periodic("heartbeat", period, rx, || heartbeat.tick());
                })?,
        );

        if let Some(timeout) = config.eviction_timeout() {
            let period = (timeout / 3).max(Duration::from_millis(1));
            let rx = stop_rx.clone();
            threads.push(
                thread::Builder::new()
                    .name("hdds-router-eviction".to_string())
                    .spawn(move || {
                        run_periodic("eviction", period, rx, || {
                            let evicted = registry.evict_stale(timeout, Instant::now());
                            if !evicted.is_empty() {
                                metrics.record_evictions(evicted.len());
                                info!("[LIVENESS] evicted agents {:?}", evicted);
                            }
                        });
                    })?,
            );
        }

        debug!(
            "[LIVENESS] started: heartbeat every {:?}, eviction {:?}",
            config.heartbeat_period(),
            config.eviction_timeout()
        );

        Ok(Self {
            stop: Some(stop_tx),
            threads,
        })
    }

    /// Stop every liveness thread and wait for them.
    pub fn stop(&mut self) {
        // Disconnecting the stop channel wakes every select.
        self.stop.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("[LIVENESS] thread panicked");
            }
        }
    }
}

impl Drop for LivenessManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `tick` every `period` until `stop` disconnects.
fn run_periodic<F: FnMut()>(name: &str, period: Duration, stop: Receiver<()>, mut tick: F) {
    let ticker = channel::tick(period);
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {
                if panic::catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
                    error!("[LIVENESS] {} tick panicked", name);
                }
            }
        }
    }
    trace!("[LIVENESS] {} task stopped", name);
}

// ============================================================================
// Heartbeat
// ============================================================================

struct HeartbeatTask {
    timeout: Duration,
    period: Duration,
    next_id: AtomicU64,
    registry: Arc<AgentRegistry>,
    metrics: Arc<RouterMetrics>,
    tasks: TaskSender,
    pings: Sender<PingJob>,
}

impl HeartbeatTask {
    fn tick(&self) {
        let started = Instant::now();
        let deadline = started + self.period;
        let heartbeat_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let clients = self.registry.snapshot();

        let backlog = self.tasks.queued();
        if backlog > 0 {
            warn!(
                "[LIVENESS] heartbeat #{}: {} tasks waiting, {} workers busy",
                heartbeat_id,
                backlog,
                self.metrics.busy_workers()
            );
        }

        let (done_tx, done_rx) = channel::unbounded();
        let mut submitted = 0usize;
        for client in clients.iter().filter(|c| c.is_connected()) {
            let job = PingJob {
                client: client.clone(),
                heartbeat_id,
                done: done_tx.clone(),
            };
            if self.pings.send(job).is_ok() {
                submitted += 1;
            }
        }
        drop(done_tx);

        for client in &clients {
            if client.silence(started) > self.timeout && client.disconnect() {
                warn!(
                    "[LIVENESS] agent {} silent for {:?}, disconnecting",
                    client.agent_id(),
                    client.silence(started)
                );
                self.metrics.record_heartbeat_disconnection();
                self.tasks.submit(Task::BroadcastDisconnection {
                    agent: client.agent_id(),
                });
            }
        }

        let mut completed = 0usize;
        while completed < submitted {
            match done_rx.recv_deadline(deadline) {
                Ok(()) => completed += 1,
                Err(_) => break,
            }
        }
        if completed < submitted {
            warn!(
                "[LIVENESS] heartbeat #{}: {} of {} sends still pending after {:?}",
                heartbeat_id,
                submitted - completed,
                submitted,
                self.period
            );
        }
    }
}

fn pinger_loop(jobs: Receiver<PingJob>, metrics: Arc<RouterMetrics>, tasks: TaskSender) {
    for job in jobs.iter() {
        let agent = job.client.agent_id();
        let ping = Message::heartbeat_router(agent, job.heartbeat_id).encode();
        match job.client.send_message(&ping) {
            Ok(()) => metrics.record_heartbeat_sent(),
            Err(SendError::NotConnected(_)) => {}
            Err(e) => {
                debug!("[LIVENESS] heartbeat to agent {} failed: {}", agent, e);
                if matches!(e, SendError::Broken { .. }) {
                    tasks.submit(Task::BroadcastDisconnection { agent });
                }
            }
        }
        let _ = job.done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::test_pair;
    use crate::dispatch::{Dispatcher, WorkerPool};
    use crate::protocol::{AgentId, MagicCookie, MessageAssembler, MessageType};
    use std::io::Read;

    fn config(heartbeat_ms: u64, eviction_ms: i64) -> RouterConfig {
        RouterConfig {
            heartbeat_timeout_ms: heartbeat_ms,
            client_eviction_timeout_ms: eviction_ms,
            heartbeat_sender_threads: 2,
            worker_threads: 1,
            ..RouterConfig::default()
        }
    }

    fn setup() -> (Arc<AgentRegistry>, Arc<RouterMetrics>, WorkerPool) {
        let registry = Arc::new(AgentRegistry::new(None));
        let metrics = Arc::new(RouterMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(1, 300, registry.clone(), metrics.clone()));
        let pool = WorkerPool::spawn(1, dispatcher).unwrap();
        (registry, metrics, pool)
    }

    #[test]
    fn test_heartbeats_reach_connected_agents() {
        let (registry, metrics, pool) = setup();
        let client = Arc::new(Client::new(
            registry.next_dynamic_id(),
            MagicCookie::from_text("c").unwrap(),
        ));
        registry.add(client.clone());
        let (attachment, mut peer) = test_pair(1);
        client.attach(attachment, b"").unwrap();

        let mut liveness =
            LivenessManager::start(&config(3000, -1), registry, metrics, pool.sender().unwrap())
                .unwrap();

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut assembler = MessageAssembler::default();
        let mut buf = [0u8; 256];
        let frame = loop {
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0);
            if let Some(frame) = assembler.push_buffer(&buf[..n]).unwrap().pop() {
                break frame;
            }
        };
        let msg = frame.decode().unwrap();
        assert_eq!(msg.msg_type, MessageType::HeartbeatRouter);
        assert_eq!(msg.recipient, Some(client.agent_id()));
        assert!(msg.message_id >= 1);

        liveness.stop();
    }

    #[test]
    fn test_silent_agent_is_disconnected() {
        let (registry, metrics, pool) = setup();
        let client = Arc::new(Client::new(
            AgentId::new(5000).unwrap(),
            MagicCookie::from_text("c").unwrap(),
        ));
        registry.add(client.clone());
        let (attachment, _peer) = test_pair(1);
        client.attach(attachment.clone(), b"").unwrap();

        let mut liveness = LivenessManager::start(
            &config(300, -1),
            registry,
            metrics.clone(),
            pool.sender().unwrap(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!client.is_connected());
        assert!(attachment.is_disconnected());
        assert!(metrics.snapshot().heartbeat_disconnections >= 1);

        liveness.stop();
    }

    #[test]
    fn test_eviction_task() {
        let (registry, metrics, pool) = setup();
        let agent = registry.next_dynamic_id();
        registry.add(Arc::new(Client::new(
            agent,
            MagicCookie::from_text("c").unwrap(),
        )));

        let mut liveness = LivenessManager::start(
            &config(3000, 30),
            registry.clone(),
            metrics.clone(),
            pool.sender().unwrap(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.get(agent).is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(registry.get(agent).is_none());
        assert_eq!(metrics.snapshot().evictions, 1);

        liveness.stop();
    }
}
