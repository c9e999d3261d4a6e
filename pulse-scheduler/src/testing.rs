//! Shared setup for the scheduler's unit tests

use crate::handler::run_inbound_loop;
use crate::scheduler::TaskScheduler;
use pulse_core::{NodeCapabilities, TaskId, TaskInfo};
use pulse_test_utils::fixtures;
use pulse_test_utils::{MockGovernor, MockInference};
use pulse_transport::{InboundStream, MemoryNetwork, PeerRegistry};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

static NEXT_PORT: AtomicU16 = AtomicU16::new(20_000);

pub(crate) struct Harness {
    pub scheduler: Arc<TaskScheduler>,
    pub governor: Arc<MockGovernor>,
    pub inference: Arc<MockInference>,
    pub net: MemoryNetwork,
    inbox: Mutex<Option<InboundStream>>,
    shutdown_tx: watch::Sender<bool>,
}

pub(crate) fn harness(node_id: &str, capabilities: NodeCapabilities) -> Harness {
    build(MemoryNetwork::new(), node_id, capabilities)
}

fn build(net: MemoryNetwork, node_id: &str, capabilities: NodeCapabilities) -> Harness {
    let (connector, inbox) = net.join(node_id);
    let config = fixtures::test_config(node_id);
    let registry = Arc::new(PeerRegistry::new(config.transport.clone(), Arc::new(connector)));
    let governor = Arc::new(MockGovernor::allow_all());
    let inference = Arc::new(MockInference::default());
    let scheduler = Arc::new(TaskScheduler::new(
        config,
        capabilities,
        registry,
        governor.clone(),
        inference.clone(),
    ));
    let (shutdown_tx, _) = watch::channel(false);
    Harness {
        scheduler,
        governor,
        inference,
        net,
        inbox: Mutex::new(Some(inbox)),
        shutdown_tx,
    }
}

impl Harness {
    /// Register `peer_id` in this node's registry without attaching it.
    pub fn add_peer(&self, peer_id: &str, capabilities: NodeCapabilities) {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        self.scheduler
            .registry()
            .upsert(fixtures::peer(peer_id, port, capabilities));
    }

    /// Attach a peer that never answers; its inbox is returned for
    /// inspection.
    pub fn add_silent_peer(&self, peer_id: &str, capabilities: NodeCapabilities) -> InboundStream {
        let (_, inbox) = self.net.join(peer_id);
        self.add_peer(peer_id, capabilities);
        inbox
    }

    /// Attach a fully working peer and start both nodes' inbound loops.
    pub fn join_worker(&self, peer_id: &str, capabilities: NodeCapabilities) -> Harness {
        let worker = build(self.net.clone(), peer_id, capabilities.clone());
        self.add_peer(peer_id, capabilities);
        worker.add_peer(self.scheduler.local_id(), self.scheduler.local_capabilities());
        self.start_inbound_loop();
        worker.start_inbound_loop();
        worker
    }

    pub fn take_inbox(&self) -> InboundStream {
        self.inbox
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .expect("inbox already taken")
    }

    pub fn start_inbound_loop(&self) {
        let inbox = self.take_inbox();
        tokio::spawn(run_inbound_loop(
            Arc::clone(&self.scheduler),
            inbox,
            self.shutdown_tx.subscribe(),
        ));
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Poll until the task reaches a terminal state.
pub(crate) async fn wait_terminal(scheduler: &TaskScheduler, task_id: TaskId) -> TaskInfo {
    for _ in 0..500 {
        if let Some(info) = scheduler.task(&task_id) {
            if info.status.is_terminal() {
                return info;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not finish: {:?}", scheduler.task(&task_id));
}
