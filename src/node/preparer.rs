//! PoW verification worker pool.
//!
//! CPU-bound block preparation runs on dedicated OS threads so the
//! event loop never stalls on a slow hash. The cross-thread surface is
//! deliberately tiny: one job queue and one results map under a single
//! mutex, a condvar for idle workers, and an event-loop wake after each
//! completed block.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tokio::sync::Notify;
use tracing::info;

use crate::pow::PowContext;
use crate::primitives::{BlockTemplate, Hash, PreparedBlock, RawBlock};

pub struct PrepareJob {
    pub bid: Hash,
    /// False inside the checkpoint zone: parsing only, no slow hash.
    pub verify_pow: bool,
    pub raw: RawBlock,
    pub template: BlockTemplate,
}

#[derive(Default)]
struct PrepareQueue {
    work: VecDeque<PrepareJob>,
    prepared: HashMap<Hash, PreparedBlock>,
    quit: bool,
}

struct Shared {
    queue: Mutex<PrepareQueue>,
    have_work: Condvar,
    /// Wakes the event loop so it runs the idle drain.
    wake: Arc<Notify>,
}

pub struct Preparer {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Preparer {
    pub fn new(thread_count: usize, wake: Arc<Notify>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(PrepareQueue::default()),
            have_work: Condvar::new(),
            wake,
        });
        info!(threads = thread_count, "starting PoW verification workers");
        let threads = (0..thread_count)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("pow-verify-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn pow worker")
            })
            .collect();
        Self { shared, threads }
    }

    pub fn add_work(&self, job: PrepareJob) {
        let mut queue = self.shared.queue.lock().expect("preparer lock");
        queue.work.push_back(job);
        self.shared.have_work.notify_all();
    }

    /// Take everything the workers finished since the last call.
    pub fn take_prepared(&self) -> HashMap<Hash, PreparedBlock> {
        let mut queue = self.shared.queue.lock().expect("preparer lock");
        std::mem::take(&mut queue.prepared)
    }
}

impl Drop for Preparer {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().expect("preparer lock");
            queue.quit = true;
            self.shared.have_work.notify_all();
        }
        for handle in self.threads.drain(..) {
            handle.join().expect("pow worker panicked");
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    // Scratchpad allocation survives across blocks.
    let mut ctx = PowContext::new();
    let mut guard = shared.queue.lock().expect("preparer lock");
    loop {
        if guard.quit {
            return;
        }
        let Some(job) = guard.work.pop_front() else {
            guard = shared.have_work.wait(guard).expect("preparer lock");
            continue;
        };
        drop(guard);

        // Heavy work strictly outside the lock.
        let pow_hash = job.verify_pow.then(|| ctx.slow_hash(&job.raw.block));
        let prepared = PreparedBlock {
            bid: job.bid,
            template: job.template,
            raw: job.raw,
            pow_hash,
        };

        guard = shared.queue.lock().expect("preparer lock");
        guard.prepared.insert(prepared.bid, prepared);
        shared.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::sha256;
    use std::time::Duration;

    fn job(tag: &[u8], verify_pow: bool) -> (Hash, PrepareJob) {
        let template = BlockTemplate {
            major_version: 1,
            minor_version: 0,
            timestamp: 1,
            previous_block_hash: sha256(tag),
            nonce: 0,
            coinbase: vec![1],
            transaction_hashes: Vec::new(),
        };
        let raw = RawBlock {
            block: template.encode(),
            transactions: Vec::new(),
        };
        let bid = template.hash();
        (
            bid,
            PrepareJob {
                bid,
                verify_pow,
                raw,
                template,
            },
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prepares_jobs_and_wakes() {
        let wake = Arc::new(Notify::new());
        let preparer = Preparer::new(2, Arc::clone(&wake));

        let (bid_a, job_a) = job(b"a", true);
        let (bid_b, job_b) = job(b"b", false);
        preparer.add_work(job_a);
        preparer.add_work(job_b);

        let mut done = HashMap::new();
        while done.len() < 2 {
            tokio::time::timeout(Duration::from_secs(10), wake.notified())
                .await
                .expect("worker wake");
            done.extend(preparer.take_prepared());
        }
        assert!(done[&bid_a].pow_hash.is_some());
        assert!(done[&bid_b].pow_hash.is_none());
        // Recomputed bid matches the job's bid.
        assert_eq!(done[&bid_a].template.hash(), bid_a);
    }

    #[test]
    fn shutdown_joins_workers() {
        let preparer = Preparer::new(3, Arc::new(Notify::new()));
        drop(preparer); // must not hang
    }
}
