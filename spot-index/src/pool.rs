//  Copyright 2024 SRA Tools Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The fixed-size worker pool (§5) shared by background batch construction (§4.3) and
//! parallel frozen-batch search (§4.4 step 3). One pool, one job queue: both consumers
//! just submit closures.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-width pool of worker threads draining one shared job queue.
///
/// Dropping the pool closes the queue and joins every worker, so a `WorkerPool` should
/// outlive any job it was handed - in practice it is owned for the lifetime of one load,
/// shared via `Arc` between the ingest coordinator and every group's batch search.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` worker threads (the default width is 4-8 per §5).
    pub fn new(threads: usize) -> Arc<Self> {
        let threads = threads.max(1);
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(threads * 4);
        let workers = (0..threads)
            .map(|id| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("spot-index-worker-{id}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn spot-index worker thread")
            })
            .collect();
        Arc::new(Self { sender: Some(sender), workers })
    }

    /// Submits a job to the shared queue. Blocks briefly if every worker is currently
    /// busy and the queue is momentarily full; never drops a submitted job.
    pub fn spawn(&self, job: Job) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }

    pub fn width(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("width", &self.workers.len()).finish()
    }
}
