//! Cancellable proof-of-work search.
//!
//! Workers share one candidate per head, each searching its own slice of the
//! nonce space, and hand solutions to [`SeekNBuild::add_block`]. Every head change bumps a
//! generation counter; searches compare against it every few hundred nonces
//! and start over when it moved. Between jobs a worker sleeps on a condition
//! variable until the next restart.

use blockchain::Identified;
use blocknet::MessageService;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use sync_extra::{CondvarExtra, MutexExtra};
use tracing::{debug, info, trace, warn};

use crate::{Block, Chain, ChainError, Error, HeadObserver, SeekNBuild};

/// Nonces tried between two looks at the restart signal.
const POLL_INTERVAL: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Mining,
    Found,
    Restarting,
    ShuttingDown,
}

struct Control {
    state: Mutex<MinerState>,
    signal: Condvar,
    generation: AtomicU64,
    shutdown: AtomicBool,
    jobs: AtomicU64,
}

impl Control {
    fn interrupted(&self, generation: u64) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation
    }

    fn set_state(&self, next: MinerState) {
        let mut state = self.state.lock_unwrap();
        if *state != MinerState::ShuttingDown {
            *state = next;
        }
    }

    /// Block until the generation moves past `generation` or shutdown.
    fn idle(&self, generation: u64) {
        let mut state = self.state.lock_unwrap();
        if self.interrupted(generation) {
            return;
        }

        *state = MinerState::Idle;
        while !self.interrupted(generation) {
            state = self.signal.wait_unwrap(state);
        }
    }
}

/// Restarts the miner. Subscribed to the chain so every head change reaches
/// the workers.
#[derive(Clone)]
pub struct MinerHandle {
    control: Arc<Control>,
}

impl MinerHandle {
    pub fn restart(&self) {
        let mut state = self.control.state.lock_unwrap();
        self.control.generation.fetch_add(1, Ordering::SeqCst);
        if *state != MinerState::ShuttingDown {
            *state = MinerState::Restarting;
        }
        self.control.signal.notify_all();
    }
}

impl<B: Block> HeadObserver<B> for MinerHandle {
    fn head_changed(&self, head: &B) {
        trace!(hash = %head.id(), "Restarting miner on new head");
        self.restart();
    }
}

/// The candidate all workers search for one generation.
struct Job<B> {
    generation: u64,
    block: B,
}

type JobSlot<B> = Mutex<Option<Job<B>>>;

enum Outcome<B> {
    Found(B),
    Interrupted,
}

fn search<B: Block>(
    mut block: B,
    control: &Control,
    generation: u64,
    offset: u64,
    stride: u64,
) -> Outcome<B> {
    for _ in 0..offset {
        block.increment_nonce();
    }

    let mut tried = 0u64;
    loop {
        if block.valid_proof() {
            return Outcome::Found(block);
        }
        for _ in 0..stride {
            block.increment_nonce();
        }

        tried += 1;
        if tried % POLL_INTERVAL == 0 && control.interrupted(generation) {
            return Outcome::Interrupted;
        }
    }
}

pub struct Miner<B: Block, T: MessageService> {
    chain: Arc<Chain<B>>,
    seek: Arc<SeekNBuild<B, T>>,
    threads: usize,
    control: Arc<Control>,
    job: Arc<JobSlot<B>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Block, T: MessageService + 'static> Miner<B, T> {
    pub fn new(seek: Arc<SeekNBuild<B, T>>, threads: usize) -> Self {
        Self {
            chain: seek.chain().clone(),
            seek,
            threads: threads.max(1),
            control: Arc::new(Control {
                state: Mutex::new(MinerState::Idle),
                signal: Condvar::new(),
                generation: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                jobs: AtomicU64::new(0),
            }),
            job: Arc::new(Mutex::new(None)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the workers. Calling it again while they run does nothing.
    pub fn run(&self) -> Result<(), Error> {
        let mut workers = self.workers.lock_unwrap();
        if !workers.is_empty() || self.control.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let stride = self.threads as u64;
        for index in 0..self.threads {
            let chain = self.chain.clone();
            let seek = self.seek.clone();
            let control = self.control.clone();
            let job = self.job.clone();
            let offset = index as u64;

            let worker = thread::Builder::new()
                .name(format!("miner-{}", index))
                .spawn(move || mine(&chain, &seek, &control, &job, offset, stride))?;
            workers.push(worker);
        }

        info!(threads = self.threads, "Miner started");
        Ok(())
    }

    /// Search for a genesis block on the calling thread. `None` if the miner
    /// is shut down first.
    pub fn mine_genesis(&self) -> Option<B> {
        while !self.control.shutdown.load(Ordering::SeqCst) {
            let generation = self.control.generation.load(Ordering::SeqCst);
            match search(B::unmined_genesis(), &self.control, generation, 0, 1) {
                Outcome::Found(genesis) => match genesis.assert_internal_consistency() {
                    Ok(()) => {
                        info!(hash = %genesis.id(), "Mined genesis");
                        return Some(genesis);
                    }
                    Err(e) => warn!("Discarding mined genesis: {}", e),
                },
                Outcome::Interrupted => {}
            }
        }
        None
    }
}

impl<B: Block, T: MessageService> Miner<B, T> {
    pub fn handle(&self) -> MinerHandle {
        MinerHandle {
            control: self.control.clone(),
        }
    }

    /// Abandon the current candidate and draw a new one from the head.
    pub fn restart(&self) {
        self.handle().restart();
    }

    pub fn state(&self) -> MinerState {
        *self.control.state.lock_unwrap()
    }

    /// Candidates drawn so far. Workers of one generation share a single
    /// candidate.
    pub fn jobs(&self) -> u64 {
        self.control.jobs.load(Ordering::SeqCst)
    }

    /// The unsolved candidate of the latest job, if any was drawn.
    pub fn current_job(&self) -> Option<B> {
        self.job.lock_unwrap().as_ref().map(|job| job.block.clone())
    }

    /// Stop and join all workers. No mined block reaches the chain after
    /// this returns.
    pub fn shutdown(&self) {
        {
            let mut state = self.control.state.lock_unwrap();
            self.control.shutdown.store(true, Ordering::SeqCst);
            *state = MinerState::ShuttingDown;
            self.control.signal.notify_all();
        }

        let workers = std::mem::take(&mut *self.workers.lock_unwrap());
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!("Miner worker panicked");
            }
        }
        info!("Miner stopped");
    }
}

impl<B: Block, T: MessageService> Drop for Miner<B, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The shared candidate for `generation`, drawn from the head by whichever
/// worker gets here first. `None` if a newer generation already took over.
fn draw<B: Block>(
    chain: &Chain<B>,
    control: &Control,
    slot: &JobSlot<B>,
    generation: u64,
) -> Result<Option<B>, ChainError> {
    let mut job = slot.lock_unwrap();
    match job.as_ref() {
        Some(current) if current.generation == generation => Ok(Some(current.block.clone())),
        Some(current) if current.generation > generation => Ok(None),
        _ => {
            let block = chain.candidate()?;
            control.jobs.fetch_add(1, Ordering::SeqCst);
            debug!(height = block.height(), generation, "New mining job");
            *job = Some(Job {
                generation,
                block: block.clone(),
            });
            Ok(Some(block))
        }
    }
}

fn mine<B: Block, T: MessageService>(
    chain: &Chain<B>,
    seek: &SeekNBuild<B, T>,
    control: &Control,
    slot: &JobSlot<B>,
    offset: u64,
    stride: u64,
) {
    while !control.shutdown.load(Ordering::SeqCst) {
        let generation = control.generation.load(Ordering::SeqCst);
        let candidate = match draw(chain, control, slot, generation) {
            Ok(Some(candidate)) => candidate,
            Ok(None) => continue,
            Err(e) => {
                warn!("No candidate to mine: {}", e);
                control.idle(generation);
                continue;
            }
        };

        control.set_state(MinerState::Mining);

        let block = match search(candidate, control, generation, offset, stride) {
            Outcome::Found(block) => block,
            Outcome::Interrupted => continue,
        };
        if let Err(e) = block.assert_internal_consistency() {
            // Same job, same solution. Wait for the next head.
            warn!(hash = %block.id(), "Discarding mined block: {}", e);
            control.idle(generation);
            continue;
        }
        if control.shutdown.load(Ordering::SeqCst) {
            break;
        }

        control.set_state(MinerState::Found);
        info!(hash = %block.id(), height = block.height(), "Mined block");
        if let Err(e) = seek.add_block(block) {
            warn!("Mined block rejected: {}", e);
        }

        control.idle(generation);
    }
}
