//! Seek-and-build synchronization.
//!
//! Wanted hashes are kept in one map, so a hash is requested at most once
//! however many triggers name it. A background thread drains them by
//! priority into `request_blocks` broadcasts and re-sends requests that go
//! unanswered.

use blockchain::Identified;
use blocknet::MessageService;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use sync_extra::{CondvarExtra, MutexExtra};
use tracing::{debug, trace, warn};

use crate::messages::{BlockList, HashList, Payload};
use crate::{Acceptance, Block, Chain, ChainError, Error, Hash, SeekConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Ancestors referenced by a block, fetched ahead of need.
    Related,
    /// Blocks something is waiting on right now.
    Now,
}

#[derive(Debug)]
struct SeekRequest {
    priority: Priority,
    sent_at: Option<Instant>,
    attempts: u32,
}

#[derive(Default)]
struct SeekState {
    requests: HashMap<Hash, SeekRequest>,
    // May hold stale entries for upgraded or already sent requests. They are
    // skipped when popped.
    queue: BinaryHeap<(Priority, Reverse<u64>, Hash)>,
    next_seq: u64,
    shutdown: bool,
}

impl SeekState {
    fn push(&mut self, hash: Hash, priority: Priority) {
        self.queue.push((priority, Reverse(self.next_seq), hash));
        self.next_seq += 1;
    }

    /// Returns whether there is something new to send.
    fn enqueue(&mut self, hash: Hash, priority: Priority) -> bool {
        if self.shutdown {
            return false;
        }

        match self.requests.get_mut(&hash) {
            Some(request) if request.priority >= priority => false,
            Some(request) => {
                request.priority = priority;
                request.sent_at = None;
                self.push(hash, priority);
                true
            }
            None => {
                self.requests.insert(
                    hash,
                    SeekRequest {
                        priority,
                        sent_at: None,
                        attempts: 0,
                    },
                );
                self.push(hash, priority);
                true
            }
        }
    }

    fn next_batch<B: Block>(
        &mut self,
        chain: &Chain<B>,
        config: &SeekConfig,
        now: Instant,
    ) -> Vec<Hash> {
        let timeout = config.request_timeout();
        let mut expired = Vec::new();

        self.requests.retain(|hash, request| {
            if chain.has_block_hash(hash) {
                return false;
            }
            let Some(sent_at) = request.sent_at else {
                return true;
            };
            if now.saturating_duration_since(sent_at) < timeout {
                return true;
            }
            if request.attempts >= config.max_attempts {
                warn!(%hash, attempts = request.attempts, "Giving up on block");
                return false;
            }

            request.sent_at = None;
            expired.push((*hash, request.priority));
            true
        });

        for (hash, priority) in expired {
            debug!(%hash, "Retrying block request");
            self.push(hash, priority);
        }

        let mut batch = Vec::new();
        while batch.len() < config.max_batch.max(1) {
            let Some((priority, _, hash)) = self.queue.pop() else {
                break;
            };
            let Some(request) = self.requests.get_mut(&hash) else {
                continue;
            };
            if request.sent_at.is_some() || request.priority != priority {
                continue;
            }

            request.sent_at = Some(now);
            request.attempts += 1;
            batch.push(hash);
        }
        batch
    }
}

struct Shared {
    state: Mutex<SeekState>,
    signal: Condvar,
}

/// Fetches missing blocks and feeds everything it obtains into the chain.
pub struct SeekNBuild<B: Block, T: MessageService> {
    chain: Arc<Chain<B>>,
    transport: Arc<T>,
    config: SeekConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Block, T: MessageService + 'static> SeekNBuild<B, T> {
    pub fn new(chain: Arc<Chain<B>>, transport: Arc<T>, config: SeekConfig) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SeekState::default()),
            signal: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            let chain = chain.clone();
            let transport = transport.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("seek".into())
                .spawn(move || run(&shared, &chain, transport.as_ref(), &config))?
        };

        Ok(Self {
            chain,
            transport,
            config,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl<B: Block, T: MessageService> SeekNBuild<B, T> {
    pub fn chain(&self) -> &Arc<Chain<B>> {
        &self.chain
    }

    /// Request `hash` ahead of anything else, unless it is already known.
    pub fn seek_hash_now(&self, hash: Hash) {
        self.seek_many_with_priority([hash], Priority::Now);
    }

    /// Request every hash in `hashes` that is not attached yet. A hash held
    /// as an orphan stands for the missing root of its pending chain. Hashes
    /// already wanted at a lower priority are promoted.
    pub fn seek_many_with_priority(&self, hashes: impl IntoIterator<Item = Hash>, priority: Priority) {
        let wanted = hashes
            .into_iter()
            .filter(|hash| !hash.is_zero())
            .filter_map(|hash| self.chain.missing_ancestor(&hash))
            .collect::<Vec<_>>();
        if wanted.is_empty() {
            return;
        }

        let mut changed = false;
        {
            let mut state = self.shared.state.lock_unwrap();
            for hash in wanted {
                if state.enqueue(hash, priority) {
                    trace!(%hash, ?priority, "Seeking block");
                    changed = true;
                }
            }
        }

        if changed {
            self.shared.signal.notify_all();
        }
    }

    /// Hand a block to the chain. Orphans trigger a seek for their parent,
    /// newly attached blocks are relayed to peers and their related blocks
    /// are sought.
    pub fn add_block(&self, block: B) -> Result<Acceptance, ChainError> {
        let hash = block.id();
        let acceptance = self.chain.add_block(block)?;

        match &acceptance {
            Acceptance::Duplicate => {}
            Acceptance::Orphan { missing } => {
                self.shared.state.lock_unwrap().requests.remove(&hash);
                self.seek_hash_now(*missing);
            }
            Acceptance::Accepted { imported, .. } => {
                {
                    let mut state = self.shared.state.lock_unwrap();
                    for hash in imported {
                        state.requests.remove(hash);
                    }
                }

                let blocks = imported
                    .iter()
                    .map(|hash| self.chain.get_block(hash))
                    .collect::<Result<Vec<_>, _>>()?;
                self.relay(&blocks);
                self.seek_many_with_priority(
                    blocks.iter().flat_map(|block| block.related_blocks()),
                    Priority::Related,
                );
            }
        }

        Ok(acceptance)
    }

    fn relay(&self, blocks: &[B]) {
        for chunk in blocks.chunks(self.config.max_batch.max(1)) {
            let list = BlockList(chunk.iter().map(|block| block.serialize()).collect());
            let sent = list
                .to_message()
                .map_err(|e| e.to_string())
                .and_then(|message| self.transport.broadcast(message).map_err(|e| e.to_string()));
            if let Err(e) = sent {
                warn!(count = chunk.len(), "Failed to relay blocks: {}", e);
            }
        }
    }

    pub fn is_seeking(&self, hash: &Hash) -> bool {
        self.shared.state.lock_unwrap().requests.contains_key(hash)
    }

    pub fn priority_of(&self, hash: &Hash) -> Option<Priority> {
        self.shared
            .state
            .lock_unwrap()
            .requests
            .get(hash)
            .map(|request| request.priority)
    }

    /// Number of wanted hashes, sent or not.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock_unwrap().requests.len()
    }

    /// Stop the fetch loop and wait for it. Blocks already in the chain are
    /// unaffected, pending requests are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock_unwrap();
            state.shutdown = true;
            state.requests.clear();
            state.queue.clear();
        }
        self.shared.signal.notify_all();

        if let Some(worker) = self.worker.lock_unwrap().take() {
            if worker.join().is_err() {
                warn!("Seek worker panicked");
            }
        }
    }
}

impl<B: Block, T: MessageService> Drop for SeekNBuild<B, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<B: Block, T: MessageService>(
    shared: &Shared,
    chain: &Chain<B>,
    transport: &T,
    config: &SeekConfig,
) {
    debug!("Seek worker started");

    loop {
        let batch = {
            let mut state = shared.state.lock_unwrap();
            loop {
                if state.shutdown {
                    debug!("Seek worker stopped");
                    return;
                }

                let batch = state.next_batch(chain, config, Instant::now());
                if !batch.is_empty() {
                    break batch;
                }
                let (guard, _) = shared.signal.wait_timeout_unwrap(state, config.tick());
                state = guard;
            }
        };

        debug!(count = batch.len(), "Requesting blocks");
        let sent = HashList(batch)
            .to_message()
            .map_err(|e| e.to_string())
            .and_then(|message| transport.broadcast(message).map_err(|e| e.to_string()));
        if let Err(e) = sent {
            // Requests stay in flight and are retried on timeout.
            warn!("Failed to request blocks: {}", e);
        }
    }
}
