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

//! The ingest coordinator (C5, §4.5): a dedicated decoder thread feeding decoded records
//! to the processor thread over a bounded channel, so decoding (I/O- and CPU-bound on the
//! BAM codec) overlaps with the state machine in [`crate::processor`] instead of
//! serializing behind it.
//!
//! `find_or_insert` and every other index mutation stay on the processor thread - the
//! decoder thread only decodes and enqueues. §5's "shared resources" note restricts
//! `hot_map`/`hot_metadata` mutation to the processor thread; handing the decoder thread
//! a pre-resolved `(group, row)` would violate that, so this coordinator is deliberately
//! thinner than a literal reading of §4.5 might suggest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use spot_common::error::{LoaderError, Result};
use tracing::{debug, warn};

use crate::collaborators::BamDecoder;
use crate::record::AlignmentRecord;

/// How long [`IngestCoordinator::recv`] waits for a record before re-checking the
/// cancellation flag. Keeps shutdown responsive without burning a spin loop.
const RECV_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// One message on the decode channel: a record, a terminal error, or end of input.
enum Message {
    Record(AlignmentRecord),
    Done,
}

/// Runs a [`BamDecoder`] on its own thread, handing decoded records to the processor
/// thread through a bounded channel (§4.5's "decouples decode latency from processing
/// latency"). Bounded so a slow processor applies backpressure to the decoder rather than
/// letting unbounded decoded records pile up in memory.
pub struct IngestCoordinator {
    receiver: Receiver<Result<Message>>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl IngestCoordinator {
    /// Spawns the decoder thread. `capacity` is [`crate::config::LoaderConfig::ingest_queue_capacity`].
    pub fn spawn<D>(mut decoder: D, capacity: usize) -> Self
    where
        D: BamDecoder + Send + 'static,
    {
        let (sender, receiver): (Sender<Result<Message>>, Receiver<Result<Message>>) = bounded(capacity.max(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = cancel.clone();
        let worker = std::thread::Builder::new()
            .name("spot-loader-decoder".to_string())
            .spawn(move || {
                let mut count = 0u64;
                loop {
                    if worker_cancel.load(Ordering::Acquire) {
                        debug!(count, "decoder thread observed cancellation; stopping");
                        return;
                    }
                    match decoder.next_record() {
                        Ok(Some(record)) => {
                            count += 1;
                            if sender.send(Ok(Message::Record(record))).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            let _ = sender.send(Ok(Message::Done));
                            return;
                        }
                        Err(err) => {
                            warn!(error = %err, count, "decoder thread failed; propagating to the processor");
                            let _ = sender.send(Err(err));
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn spot-loader decoder thread");
        Self { receiver, cancel, worker: Some(worker) }
    }

    /// Blocks for the next decoded record. `Ok(None)` means the decoder reached end of
    /// input; an error from the decoder itself propagates as-is.
    ///
    /// Polls on a short timeout so a cancellation requested from another thread (e.g. the
    /// memory-budget sampler tripping [`LoaderError::OutOfMemoryPrediction`]) is observed
    /// even while the decoder has nothing queued yet.
    pub fn recv(&self) -> Result<Option<AlignmentRecord>> {
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(LoaderError::Cancelled);
            }
            match self.receiver.recv_timeout(RECV_POLL_INTERVAL) {
                Ok(Ok(Message::Record(record))) => return Ok(Some(record)),
                Ok(Ok(Message::Done)) => return Ok(None),
                Ok(Err(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    /// Requests the decoder thread stop at its next opportunity and wakes any blocked
    /// [`Self::recv`] call. Idempotent.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// A clone of the shared cancellation flag, for callers (the umbrella loader's memory
    /// budget check) that need to trip cancellation without holding a `&IngestCoordinator`.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

impl Drop for IngestCoordinator {
    fn drop(&mut self) {
        self.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Flags, Platform};
    use std::sync::Mutex;

    struct VecDecoder {
        records: Mutex<std::vec::IntoIter<AlignmentRecord>>,
    }

    impl VecDecoder {
        fn new(records: Vec<AlignmentRecord>) -> Self {
            Self { records: Mutex::new(records.into_iter()) }
        }
    }

    impl BamDecoder for VecDecoder {
        fn next_record(&mut self) -> Result<Option<AlignmentRecord>> {
            Ok(self.records.lock().unwrap().next())
        }
    }

    fn minimal_record(name: &[u8]) -> AlignmentRecord {
        AlignmentRecord {
            name: name.to_vec(),
            group_key: Vec::new(),
            platform: Platform::Illumina,
            flags: Flags::empty(),
            reference_id: None,
            reference_pos: None,
            mapping_quality: 0,
            cigar: Vec::new(),
            sequence: Vec::new(),
            qualities: Vec::new(),
            original_qualities: None,
            mate_reference_id: None,
            mate_pos: None,
            template_len: 0,
            color_space: false,
            linkage_group: None,
            barcode: None,
        }
    }

    struct FailingDecoder;
    impl BamDecoder for FailingDecoder {
        fn next_record(&mut self) -> Result<Option<AlignmentRecord>> {
            Err(LoaderError::Decode(Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed record"))))
        }
    }

    #[test]
    fn yields_every_record_then_none() {
        let decoder = VecDecoder::new(vec![minimal_record(b"a"), minimal_record(b"b")]);
        let coordinator = IngestCoordinator::spawn(decoder, 4);
        let first = coordinator.recv().unwrap().unwrap();
        let second = coordinator.recv().unwrap().unwrap();
        assert_eq!(first.name, b"a");
        assert_eq!(second.name, b"b");
        assert!(coordinator.recv().unwrap().is_none());
    }

    #[test]
    fn propagates_a_decode_error() {
        let coordinator = IngestCoordinator::spawn(FailingDecoder, 4);
        let err = coordinator.recv().unwrap_err();
        assert!(matches!(err, LoaderError::Decode(_)));
    }

    #[test]
    fn cancel_unblocks_a_pending_recv() {
        struct NeverDecoder;
        impl BamDecoder for NeverDecoder {
            fn next_record(&mut self) -> Result<Option<AlignmentRecord>> {
                std::thread::sleep(std::time::Duration::from_secs(5));
                Ok(None)
            }
        }
        let coordinator = IngestCoordinator::spawn(NeverDecoder, 4);
        let cancel = coordinator.cancel_handle();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            cancel.store(true, Ordering::Release);
        });
        let result = coordinator.recv();
        assert!(matches!(result, Err(LoaderError::Cancelled)));
        handle.join().unwrap();
    }
}
