//! Dispatch strategies deciding which thread runs detection for which camera.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::pool::{CameraLane, PoolShared};

/// Sleep between scans when a shared worker found nothing to do.
const WORKER_IDLE_SLEEP: Duration = Duration::from_millis(2);

/// How detection work is spread over threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One dedicated thread per camera
    PerCamera,
    /// A fixed number of threads shared by all cameras
    WorkerPool { workers: usize },
}

impl DispatchMode {
    pub(crate) fn strategy(self) -> Box<dyn DispatchStrategy> {
        match self {
            DispatchMode::PerCamera => Box::new(PerCameraDispatch),
            DispatchMode::WorkerPool { workers } => Box::new(WorkerPoolDispatch {
                workers: workers.max(1),
            }),
        }
    }
}

/// Spawns the detection loops for a pool.
///
/// Loops must exit promptly once `shared.is_running()` turns false.
pub(crate) trait DispatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn spawn(&self, shared: &Arc<PoolShared>) -> Vec<(String, JoinHandle<()>)>;
}

struct PerCameraDispatch;

impl DispatchStrategy for PerCameraDispatch {
    fn name(&self) -> &'static str {
        "per-camera"
    }

    fn spawn(&self, shared: &Arc<PoolShared>) -> Vec<(String, JoinHandle<()>)> {
        shared
            .lanes()
            .iter()
            .map(|lane| {
                let name = format!("detection[{}]", lane.camera_id());
                let shared = Arc::clone(shared);
                let lane = Arc::clone(lane);
                let handle = thread::spawn(move || per_camera_loop(&shared, &lane));
                (name, handle)
            })
            .collect()
    }
}

fn per_camera_loop(shared: &PoolShared, lane: &CameraLane) {
    let timeout = shared.settings().dequeue_timeout;
    while shared.is_running() {
        if let Some(frame) = lane.queue().pop_timeout(timeout) {
            shared.process(lane, frame);
        }
    }
}

struct WorkerPoolDispatch {
    workers: usize,
}

impl DispatchStrategy for WorkerPoolDispatch {
    fn name(&self) -> &'static str {
        "worker-pool"
    }

    fn spawn(&self, shared: &Arc<PoolShared>) -> Vec<(String, JoinHandle<()>)> {
        (0..self.workers)
            .map(|i| {
                let shared = Arc::clone(shared);
                let handle = thread::spawn(move || worker_pool_loop(&shared));
                (format!("detection-worker[{}]", i), handle)
            })
            .collect()
    }
}

/// Scan every camera; process one frame from each camera this worker can claim.
///
/// Claiming a camera keeps its frames in FIFO order even with several workers.
fn worker_pool_loop(shared: &PoolShared) {
    while shared.is_running() {
        let mut did_work = false;
        for lane in shared.lanes() {
            if !lane.try_claim() {
                continue;
            }
            if let Some(frame) = lane.queue().try_pop() {
                shared.process(lane, frame);
                did_work = true;
            }
            lane.release();
        }
        if !did_work {
            thread::sleep(WORKER_IDLE_SLEEP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_selection() {
        assert_eq!(DispatchMode::PerCamera.strategy().name(), "per-camera");
        assert_eq!(
            DispatchMode::WorkerPool { workers: 0 }.strategy().name(),
            "worker-pool"
        );
    }
}
