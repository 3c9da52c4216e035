pub mod dcall;
pub mod load;
pub mod message_queue;
pub mod pollable;
pub mod registry;

pub use dcall::{CallAction, Callable, DCId};
pub use message_queue::{Message, Semaphore, MESSAGE_QUEUE_CAPACITY};
pub use pollable::{PollActions, PollContext, PollEvents, Pollable, PollableKind, WorkerId};
pub use registry::{running_workers, WorkerRegistry};

use crate::classifier::cache;
use crate::worker::dcall::{DCall, DelayedCalls};
use crate::worker::load::WorkerLoad;

use crossbeam_channel::{bounded, Receiver, Sender};
use hashbrown::HashMap;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

static NEXT_WORKER_ID: AtomicI32 = AtomicI32::new(1);

fn next_worker_id() -> WorkerId {
    NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)
}

/// An end-of-iteration callback. Receives the worker so queued work can
/// use the full worker API without aliasing the reactor's borrow.
pub type LCall = Box<dyn FnOnce(&mut Worker)>;

thread_local! {
    static CURRENT_WORKER_ID: Cell<WorkerId> = const { Cell::new(-1) };
    static LCALLS: RefCell<VecDeque<LCall>> = RefCell::new(VecDeque::new());
}

const WAKER_TOKEN: Token = Token(usize::MAX);

pub const MAXNFDS: usize = 10;
pub const N_QUEUE_TIMES: usize = 30;

/// Per-worker event and dispatch statistics, admin visible.
#[derive(Debug, Clone)]
pub struct WorkerStatistics {
    pub n_polls: u64,
    pub n_pollev: u64,
    pub evq_avg: i64,
    pub evq_max: i64,
    pub n_fds: [u64; MAXNFDS],
    pub qtimes: [u64; N_QUEUE_TIMES + 1],
    pub exectimes: [u64; N_QUEUE_TIMES + 1],
    pub maxqtime: i64,
    pub maxexectime: i64,
    pub n_accept: u64,
    pub n_read: u64,
    pub n_write: u64,
    pub n_hup: u64,
    pub n_error: u64,
    pub n_incomplete_read: u64,
}

impl Default for WorkerStatistics {
    fn default() -> Self {
        WorkerStatistics {
            n_polls: 0,
            n_pollev: 0,
            evq_avg: 0,
            evq_max: 0,
            n_fds: [0; MAXNFDS],
            qtimes: [0; N_QUEUE_TIMES + 1],
            exectimes: [0; N_QUEUE_TIMES + 1],
            maxqtime: 0,
            maxexectime: 0,
            n_accept: 0,
            n_read: 0,
            n_write: 0,
            n_hup: 0,
            n_error: 0,
            n_incomplete_read: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    /// Run synchronously on the worker. Only valid from the worker's own
    /// thread; from elsewhere the call fails.
    Direct,
    /// Direct when already on the worker, queued otherwise.
    Auto,
    /// Always through the message queue.
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOp {
    Add,
    Modify,
    Delete,
}

struct PendingPoll {
    events: PollEvents,
    pollable: Rc<RefCell<dyn Pollable>>,
}

/// Cross-thread face of a worker. Cheap to clone; all members are either
/// lock-free or array-backed, so `post_message` and `shutdown` stay signal
/// safe.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: Sender<Message>,
    waker: Arc<Waker>,
    should_shutdown: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        CURRENT_WORKER_ID.with(|c| c.get()) == self.id
    }

    pub fn has_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Signal-safe: array-backed enqueue plus an eventfd write. Returns
    /// true only if the worker has not finished.
    pub fn post_message(&self, id: u32, arg1: usize, arg2: usize) -> bool {
        if self.has_finished() {
            return false;
        }
        if self.tx.try_send(Message::User { id, arg1, arg2 }).is_err() {
            return false;
        }
        self.waker.wake().is_ok()
    }

    /// Run `task` on the worker. With `Direct` or `Auto` on the worker's
    /// own thread the task joins the end of the current reactor iteration;
    /// code already running on the worker holds `&mut Worker` and calls
    /// [`Worker::execute_direct`] instead.
    pub fn execute<F>(&self, task: F, sem: Option<Arc<Semaphore>>, mode: ExecuteMode) -> bool
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        if self.has_finished() {
            return false;
        }
        match mode {
            ExecuteMode::Direct | ExecuteMode::Auto if self.is_current() => {
                Worker::lcall_current(Box::new(move |worker| {
                    task(worker);
                    if let Some(sem) = sem {
                        sem.post();
                    }
                }))
            }
            ExecuteMode::Direct => false,
            _ => {
                let posted = self
                    .tx
                    .try_send(Message::Task {
                        task: Box::new(task),
                        sem,
                    })
                    .is_ok();
                posted && self.waker.wake().is_ok()
            }
        }
    }

    /// Queued execution plus a wait for completion. Must not be called
    /// from the worker's own thread.
    pub fn call<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        debug_assert!(!self.is_current());
        let sem = Arc::new(Semaphore::new());
        if self.execute(task, Some(Arc::clone(&sem)), ExecuteMode::Queued) {
            sem.wait();
            true
        } else {
            false
        }
    }

    /// Signal-safe, idempotent. The reactor exits at its next iteration.
    pub fn shutdown(&self) {
        if !self.should_shutdown.swap(true, Ordering::Release) {
            let _ = self.waker.wake();
        }
    }
}

/// A started worker: its handle plus the join handle of its thread.
pub struct WorkerThread {
    handle: WorkerHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerThread {
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// An epoll-backed single-threaded reactor. One OS thread runs [`run`];
/// every object the worker polls is owned by that thread. The only members
/// other threads may touch are the ones exposed through [`WorkerHandle`].
pub struct Worker {
    id: WorkerId,
    poll: Poll,
    max_events: usize,
    waker: Arc<Waker>,
    mq_tx: Sender<Message>,
    mq_rx: Receiver<Message>,
    pollables: HashMap<RawFd, Rc<RefCell<dyn Pollable>>>,
    scheduled_polls: HashMap<RawFd, PendingPoll>,
    incomplete_polls: HashMap<RawFd, PendingPoll>,
    dcalls: DelayedCalls,
    current_dcall: Option<DCId>,
    current_dcall_cancelled: bool,
    load: WorkerLoad,
    statistics: WorkerStatistics,
    random_engine: StdRng,
    epoch: Instant,
    epoll_tick_now: Instant,
    min_timeout: Duration,
    should_shutdown: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    n_current_descriptors: i64,
    n_total_descriptors: i64,
    message_handler: Option<Box<dyn FnMut(&mut Worker, u32, usize, usize)>>,
    tick_hook: Option<Box<dyn FnMut(&mut Worker)>>,
    nfds_total: i64,
    npolls_effective: i64,
}

// The worker moves into its thread once; afterwards only that thread
// touches it.
unsafe impl Send for Worker {}

pub const DEFAULT_MAX_EVENTS: usize = 1000;
pub const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(100);

impl Worker {
    pub fn new(max_events: usize) -> io::Result<Worker> {
        assert!(max_events > 0);
        let poll = Poll::new().map_err(|e| {
            error!("Could not create epoll instance for worker, system will not work: {e}");
            e
        })?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (mq_tx, mq_rx) = bounded(MESSAGE_QUEUE_CAPACITY);
        let id = next_worker_id();
        let now = Instant::now();

        Ok(Worker {
            id,
            poll,
            max_events,
            waker,
            mq_tx,
            mq_rx,
            pollables: HashMap::new(),
            scheduled_polls: HashMap::new(),
            incomplete_polls: HashMap::new(),
            dcalls: DelayedCalls::new(id),
            current_dcall: None,
            current_dcall_cancelled: false,
            load: WorkerLoad::new(now),
            statistics: WorkerStatistics::default(),
            random_engine: StdRng::from_entropy(),
            epoch: now,
            epoll_tick_now: now,
            min_timeout: DEFAULT_MIN_TIMEOUT,
            should_shutdown: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            n_current_descriptors: 0,
            n_total_descriptors: 0,
            message_handler: None,
            tick_hook: None,
            nfds_total: 0,
            npolls_effective: 0,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id,
            tx: self.mq_tx.clone(),
            waker: Arc::clone(&self.waker),
            should_shutdown: Arc::clone(&self.should_shutdown),
            finished: Arc::clone(&self.finished),
        }
    }

    pub fn statistics(&self) -> &WorkerStatistics {
        &self.statistics
    }

    pub fn load_1s(&self) -> i64 {
        self.load.percentage_1s()
    }

    pub fn load_1m(&self) -> i64 {
        self.load.percentage_1m()
    }

    pub fn load_1h(&self) -> i64 {
        self.load.percentage_1h()
    }

    pub fn current_fd_count(&self) -> i64 {
        self.n_current_descriptors
    }

    pub fn total_fd_count(&self) -> i64 {
        self.n_total_descriptors
    }

    pub fn random_engine(&mut self) -> &mut StdRng {
        &mut self.random_engine
    }

    pub fn gen_random_bytes(&mut self, output: &mut [u8]) {
        self.random_engine.fill_bytes(output);
    }

    pub fn set_message_handler(
        &mut self,
        handler: Box<dyn FnMut(&mut Worker, u32, usize, usize)>,
    ) {
        self.message_handler = Some(handler);
    }

    pub fn set_tick_hook(&mut self, hook: Box<dyn FnMut(&mut Worker)>) {
        self.tick_hook = Some(hook);
    }

    pub fn set_min_timeout(&mut self, min_timeout: Duration) {
        self.min_timeout = min_timeout;
    }

    /// Monotonic milliseconds on this worker's clock.
    pub fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Id of the worker running the calling thread, if any.
    pub fn current_id() -> Option<WorkerId> {
        let id = CURRENT_WORKER_ID.with(|c| c.get());
        (id >= 0).then_some(id)
    }

    pub fn on_worker_thread() -> bool {
        Self::current_id().is_some()
    }

    pub fn is_current(&self) -> bool {
        Self::current_id() == Some(self.id)
    }

    /// Append to the end of the current reactor iteration. Works from any
    /// code running on a worker thread; returns false elsewhere.
    pub fn lcall_current(f: LCall) -> bool {
        if !Self::on_worker_thread() {
            return false;
        }
        LCALLS.with(|q| q.borrow_mut().push_back(f));
        true
    }

    /// Schedule `f` to run once at the end of this reactor iteration,
    /// after all fd events and scheduled polls but before the next poll.
    pub fn lcall(&mut self, f: LCall) {
        debug_assert!(self.is_current() || !Self::on_worker_thread());
        LCALLS.with(|q| q.borrow_mut().push_back(f));
    }

    /// Run `task` immediately. The `&mut self` receiver is what makes this
    /// sound: only code already on the worker can call it.
    pub fn execute_direct<F: FnOnce(&mut Worker)>(&mut self, task: F) {
        task(self);
    }

    //
    // Poll registration
    //

    pub fn add_pollable(&mut self, events: PollEvents, pollable: Rc<RefCell<dyn Pollable>>) -> bool {
        debug_assert!(!self.finished.load(Ordering::Acquire));
        {
            let p = pollable.borrow();
            debug_assert!(p.kind() == PollableKind::Shared || p.polling_worker().is_none());
        }
        let fd = pollable.borrow().poll_fd();
        let interests = interests_from(events);

        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interests)
        {
            Ok(()) => {
                self.n_current_descriptors += 1;
                self.n_total_descriptors += 1;
                {
                    let mut p = pollable.borrow_mut();
                    if p.kind() == PollableKind::Unique {
                        p.set_polling_worker(Some(self.id));
                    }
                }
                self.pollables.insert(fd, pollable);
                true
            }
            Err(e) => {
                resolve_poll_error(fd, &e, PollOp::Add);
                false
            }
        }
    }

    pub fn modify_pollable(
        &mut self,
        events: PollEvents,
        pollable: &Rc<RefCell<dyn Pollable>>,
    ) -> bool {
        let fd = pollable.borrow().poll_fd();
        {
            let p = pollable.borrow();
            debug_assert!(p.kind() == PollableKind::Shared || p.polling_worker() == Some(self.id));
        }
        match self.poll.registry().reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            interests_from(events),
        ) {
            Ok(()) => true,
            Err(e) => {
                resolve_poll_error(fd, &e, PollOp::Modify);
                false
            }
        }
    }

    /// Deregister. Does not close the fd; the caller owns it again.
    pub fn remove_pollable(&mut self, pollable: &Rc<RefCell<dyn Pollable>>) -> bool {
        let fd = pollable.borrow().poll_fd();
        match self.poll.registry().deregister(&mut SourceFd(&fd)) {
            Ok(()) => {
                self.n_current_descriptors -= 1;
                self.scheduled_polls.remove(&fd);
                self.incomplete_polls.remove(&fd);
                self.pollables.remove(&fd);
                let mut p = pollable.borrow_mut();
                if p.kind() == PollableKind::Unique {
                    p.set_polling_worker(None);
                }
                true
            }
            Err(e) => {
                resolve_poll_error(fd, &e, PollOp::Delete);
                false
            }
        }
    }

    pub fn pollable(&self, fd: RawFd) -> Option<Rc<RefCell<dyn Pollable>>> {
        self.pollables.get(&fd).cloned()
    }

    //
    // Delayed calls
    //

    pub fn delayed_call<F>(&mut self, owner: Callable, delay: Duration, f: F) -> DCId
    where
        F: FnMut(CallAction, &mut Worker) -> bool + 'static,
    {
        let id = self.dcalls.next_id();
        let interval = delay.as_millis() as i64;
        self.dcalls.add(DCall {
            id,
            owner,
            at_ms: self.now_ms() + interval,
            interval_ms: interval,
            f: Box::new(f),
        });
        id
    }

    /// Cancel one delayed call. `invoke_cancel=false` suppresses the
    /// CANCEL invocation, for teardown paths where the owner is already
    /// half gone.
    pub fn cancel_dcall(&mut self, id: DCId, invoke_cancel: bool) -> bool {
        if self.current_dcall == Some(id) {
            // Cancelling the running call: just keep it from re-arming.
            self.current_dcall_cancelled = true;
            return true;
        }
        match self.dcalls.remove(id) {
            Some(mut call) => {
                if invoke_cancel {
                    (call.f)(CallAction::Cancel, self);
                }
                true
            }
            None => {
                warn!("Attempt to remove a delayed call with non-existing id {id}.");
                false
            }
        }
    }

    pub fn cancel_dcalls(&mut self, owner: Callable, invoke_cancel: bool) {
        for id in self.dcalls.owner_ids(owner) {
            self.cancel_dcall(id, invoke_cancel);
        }
    }

    pub fn suspend_dcalls(&mut self, owner: Callable) {
        self.dcalls.suspend_owner(owner);
    }

    pub fn resume_dcalls(&mut self, owner: Callable) {
        self.dcalls.resume_owner(owner);
    }

    pub fn dcall_count(&self) -> usize {
        self.dcalls.len()
    }

    //
    // The reactor
    //

    /// Spawn the worker thread and wait until its loop is about to start.
    pub fn start(mut self, name: &str) -> io::Result<WorkerThread> {
        let handle = self.handle();
        let sem = Arc::new(Semaphore::new());
        let sem_started = Arc::clone(&sem);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                self.run(Some(sem_started));
            })?;
        sem.wait();
        Ok(WorkerThread {
            handle,
            join: Some(join),
        })
    }

    pub fn run(&mut self, started: Option<Arc<Semaphore>>) {
        CURRENT_WORKER_ID.with(|c| c.set(self.id));
        cache::thread_init();
        registry::worker_started();

        if let Some(sem) = started {
            sem.post();
        }

        self.poll_waitevents();

        self.finished.store(true, Ordering::Release);
        registry::worker_finished();

        // Pending calls get a CANCEL so owners can release resources.
        for mut call in self.dcalls.drain_all() {
            (call.f)(CallAction::Cancel, self);
        }

        cache::thread_finish();
        CURRENT_WORKER_ID.with(|c| c.set(-1));
        info!("Worker {} has shut down.", self.id);
    }

    fn poll_waitevents(&mut self) {
        let mut events = Events::with_capacity(self.max_events);
        self.load.reset(Instant::now());

        while !self.should_shutdown.load(Ordering::Acquire) {
            self.statistics.n_polls += 1;

            let now = Instant::now();
            let mut timeout = self.load.about_to_wait(now).max(self.min_timeout);
            if let Some(due_ms) = self.dcalls.next_due_ms() {
                let until_due =
                    Duration::from_millis((due_ms - self.now_ms()).max(0) as u64);
                timeout = timeout.min(until_due);
            }
            if !self.incomplete_polls.is_empty() {
                // pending carried-over polls: return immediately
                timeout = Duration::ZERO;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("Worker {}: poll returned an error: {e}", self.id);
                }
            }

            self.epoll_tick_now = Instant::now();
            self.load.about_to_work(self.epoll_tick_now);
            let cycle_start = time_in_100ms_ticks(self.epoll_tick_now);

            let nfds = events.iter().count() as i64;
            if nfds > 0 {
                self.npolls_effective += 1;
                self.nfds_total += nfds;
                if self.nfds_total <= 0 {
                    // wrapped, reset the situation
                    self.nfds_total = nfds;
                    self.npolls_effective = 1;
                }
                self.statistics.evq_avg = self.nfds_total / self.npolls_effective;
                self.statistics.evq_max = self.statistics.evq_max.max(nfds);
                self.statistics.n_pollev += 1;
                self.statistics.n_fds[((nfds as usize) - 1).min(MAXNFDS - 1)] += 1;
            }

            debug_assert!(self.scheduled_polls.is_empty());
            std::mem::swap(&mut self.scheduled_polls, &mut self.incomplete_polls);

            let mut drain_messages = false;
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    drain_messages = true;
                    continue;
                }
                let fd = event.token().0 as RawFd;
                let Some(pollable) = self.pollables.get(&fd).cloned() else {
                    continue;
                };
                let mut pollable_events = poll_events_from(event);
                if !self.scheduled_polls.is_empty() {
                    if let Some(pending) = self.scheduled_polls.remove(&fd) {
                        // events were already pending for this fd, merge
                        pollable_events |= pending.events;
                    }
                }
                self.deliver_events(cycle_start, pollable, pollable_events, PollContext::NewCall);
            }

            if drain_messages {
                self.handle_messages();
            }

            // Cannot iterate in place, a handler may remove pollables.
            while let Some(fd) = self.scheduled_polls.keys().next().copied() {
                let pending = self.scheduled_polls.remove(&fd).unwrap();
                self.deliver_events(
                    cycle_start,
                    pending.pollable,
                    pending.events,
                    PollContext::RepeatedCall,
                );
            }

            self.run_lcalls();
            self.tick();
            self.call_epoll_tick();
        }
    }

    fn deliver_events(
        &mut self,
        cycle_start: i64,
        pollable: Rc<RefCell<dyn Pollable>>,
        events: PollEvents,
        context: PollContext,
    ) {
        let started = time_in_100ms_ticks(Instant::now());
        let qtime = started - cycle_start;
        self.statistics.qtimes[(qtime.max(0) as usize).min(N_QUEUE_TIMES)] += 1;
        self.statistics.maxqtime = self.statistics.maxqtime.max(qtime);

        let fd = pollable.borrow().poll_fd();
        let actions = pollable
            .borrow_mut()
            .handle_poll_events(self, events, context);

        self.statistics.n_accept += actions.contains(PollActions::ACCEPT) as u64;
        self.statistics.n_read += actions.contains(PollActions::READ) as u64;
        self.statistics.n_write += actions.contains(PollActions::WRITE) as u64;
        self.statistics.n_hup += actions.contains(PollActions::HUP) as u64;
        self.statistics.n_error += actions.contains(PollActions::ERROR) as u64;

        if actions.intersects(PollActions::HUP | PollActions::ERROR) {
            // The handler cannot deregister itself while it is being
            // dispatched; it signals through the action mask instead and
            // the removal happens here, after its borrow has ended.
            self.remove_pollable(&pollable);
        } else if actions.contains(PollActions::INCOMPLETE_READ) {
            self.statistics.n_incomplete_read += 1;
            self.incomplete_polls.insert(
                fd,
                PendingPoll {
                    events: PollEvents::IN,
                    pollable,
                },
            );
        }

        let exectime = time_in_100ms_ticks(Instant::now()) - started;
        self.statistics.exectimes[(exectime.max(0) as usize).min(N_QUEUE_TIMES)] += 1;
        self.statistics.maxexectime = self.statistics.maxexectime.max(exectime);
    }

    fn handle_messages(&mut self) {
        while let Ok(message) = self.mq_rx.try_recv() {
            match message {
                Message::Task { task, sem } => {
                    task(self);
                    if let Some(sem) = sem {
                        sem.post();
                    }
                }
                Message::User { id, arg1, arg2 } => {
                    if let Some(mut handler) = self.message_handler.take() {
                        handler(self, id, arg1, arg2);
                        if self.message_handler.is_none() {
                            self.message_handler = Some(handler);
                        }
                    } else {
                        error!("Worker {} received unhandled message {id}.", self.id);
                    }
                }
            }
        }
    }

    fn run_lcalls(&mut self) {
        // An lcall may append further lcalls; they run in this drain too.
        loop {
            let next = LCALLS.with(|q| q.borrow_mut().pop_front());
            match next {
                Some(f) => f(self),
                None => break,
            }
        }
    }

    fn tick(&mut self) {
        let now_ms = self.now_ms();
        let mut repeating: Vec<DCall> = Vec::new();

        while let Some(mut call) = self.dcalls.pop_due(now_ms) {
            self.current_dcall = Some(call.id);
            self.current_dcall_cancelled = false;
            let repeat = (call.f)(CallAction::Execute, self);
            self.current_dcall = None;

            if repeat && !self.current_dcall_cancelled {
                repeating.push(call);
            }
        }

        for call in repeating {
            // rearm parks the call instead if its owner suspended itself
            // during the execution
            self.dcalls.rearm(call, now_ms);
        }
    }

    fn call_epoll_tick(&mut self) {
        if let Some(mut hook) = self.tick_hook.take() {
            hook(self);
            if self.tick_hook.is_none() {
                self.tick_hook = Some(hook);
            }
        }
    }
}

fn interests_from(events: PollEvents) -> Interest {
    let readable = events.contains(PollEvents::IN);
    let writable = events.contains(PollEvents::OUT);
    match (readable, writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // HUP/ERR are always reported; poll on readable by default
        _ => Interest::READABLE,
    }
}

fn poll_events_from(event: &mio::event::Event) -> PollEvents {
    let mut events = PollEvents::empty();
    if event.is_readable() {
        events |= PollEvents::IN;
    }
    if event.is_writable() {
        events |= PollEvents::OUT;
    }
    if event.is_read_closed() || event.is_write_closed() {
        events |= PollEvents::HUP;
    }
    if event.is_error() {
        events |= PollEvents::ERR;
    }
    events
}

fn time_in_100ms_ticks(t: Instant) -> i64 {
    // Only deltas of these are meaningful.
    thread_local! {
        static EPOCH: Instant = Instant::now();
    }
    EPOCH.with(|e| t.saturating_duration_since(*e).as_millis() as i64 / 100)
}

/// Categorized epoll failure handling: bookkeeping errors are survivable,
/// a corrupt poll set is not, as it would silently misroute traffic.
fn resolve_poll_error(fd: RawFd, e: &io::Error, op: PollOp) {
    let errnum = e.raw_os_error().unwrap_or(0);
    if op == PollOp::Add {
        if errnum == libc::EEXIST {
            error!("File descriptor {fd} already present in an epoll instance.");
            return;
        }
        if errnum == libc::ENOSPC {
            error!(
                "The limit imposed by /proc/sys/fs/epoll/max_user_watches was reached when \
                 trying to add file descriptor {fd} to an epoll instance."
            );
            return;
        }
    } else if errnum == libc::ENOENT {
        error!("File descriptor {fd} was not found in epoll instance.");
        return;
    }

    // Common checks for add or remove - crash the process.
    match errnum {
        e if e == libc::EBADF || e == libc::EINVAL || e == libc::ENOMEM || e == libc::EPERM => {
            error!("Unrecoverable epoll error {e} on fd {fd}, aborting.");
            std::process::abort();
        }
        _ => {
            error!("Undocumented epoll error {errnum} on fd {fd}, aborting.");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn started_worker() -> WorkerThread {
        Worker::new(DEFAULT_MAX_EVENTS)
            .unwrap()
            .start("test-worker")
            .unwrap()
    }

    #[test]
    fn queued_execution_runs_on_worker_thread() {
        let wt = started_worker();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        assert!(wt.handle().call(move |worker| {
            *seen2.lock().unwrap() = Worker::current_id().map(|id| id == worker.id());
        }));
        assert_eq!(*seen.lock().unwrap(), Some(true));
        wt.shutdown();
        wt.join();
    }

    #[test]
    fn post_message_reaches_handler_in_fifo_order() {
        let wt = started_worker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        wt.handle().call(move |worker| {
            let log3 = Arc::clone(&log2);
            worker.set_message_handler(Box::new(move |_, id, a1, a2| {
                log3.lock().unwrap().push((id, a1, a2));
            }));
        });

        for i in 0..10usize {
            assert!(wt.handle().post_message(7, i, i * 2));
        }
        // barrier: a queued call drains after the posted messages
        wt.handle().call(|_| {});

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.len(), 10);
        for (i, (id, a1, a2)) in seen.iter().enumerate() {
            assert_eq!(*id, 7);
            assert_eq!(*a1, i);
            assert_eq!(*a2, i * 2);
        }
        wt.shutdown();
        wt.join();
    }

    #[test]
    fn post_message_fails_after_finish() {
        let wt = started_worker();
        let handle = wt.handle().clone();
        wt.shutdown();
        wt.join();
        assert!(!handle.post_message(1, 0, 0));
    }

    #[test]
    fn delayed_calls_fire_in_order_and_repeat() {
        let wt = started_worker();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));

        let fired_a = Arc::clone(&fired);
        let fired_b = Arc::clone(&fired);
        let count2 = Arc::clone(&count);
        wt.handle().call(move |worker| {
            let owner = Callable::new();
            worker.delayed_call(owner, Duration::from_millis(30), move |action, _| {
                if action == CallAction::Execute {
                    fired_a.lock().unwrap().push("slow");
                }
                false
            });
            worker.delayed_call(owner, Duration::from_millis(5), move |action, _| {
                if action == CallAction::Execute {
                    fired_b.lock().unwrap().push("fast");
                }
                false
            });
            worker.delayed_call(owner, Duration::from_millis(10), move |action, _| {
                action == CallAction::Execute
                    && count2.fetch_add(1, Ordering::SeqCst) < 2
            });
        });

        std::thread::sleep(Duration::from_millis(120));
        wt.handle().call(|_| {});
        let seen = fired.lock().unwrap().clone();
        assert_eq!(seen, vec!["fast", "slow"]);
        assert!(count.load(Ordering::SeqCst) >= 3);
        wt.shutdown();
        wt.join();
    }

    #[test]
    fn cancel_dcall_from_other_thread_is_posted() {
        let wt = started_worker();
        let fired = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let cancelled2 = Arc::clone(&cancelled);
        let id = Arc::new(Mutex::new(0u64));
        let id2 = Arc::clone(&id);
        wt.handle().call(move |worker| {
            let owner = Callable::new();
            let dcid = worker.delayed_call(owner, Duration::from_secs(60), move |action, _| {
                match action {
                    CallAction::Execute => fired2.fetch_add(1, Ordering::SeqCst),
                    CallAction::Cancel => cancelled2.fetch_add(1, Ordering::SeqCst),
                };
                false
            });
            *id2.lock().unwrap() = dcid;
        });

        let dcid = *id.lock().unwrap();
        wt.handle().call(move |worker| {
            assert!(worker.cancel_dcall(dcid, true));
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        wt.shutdown();
        wt.join();
    }

    #[test]
    fn lcall_runs_within_iteration_and_may_append() {
        let wt = started_worker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        wt.handle().call(move |worker| {
            let log3 = Arc::clone(&log2);
            let log4 = Arc::clone(&log2);
            worker.lcall(Box::new(move |_| {
                log3.lock().unwrap().push(1);
                // an lcall appending an lcall runs in the same drain
                let log5 = Arc::clone(&log4);
                Worker::lcall_current(Box::new(move |_| {
                    log5.lock().unwrap().push(2);
                }));
            }));
        });
        std::thread::sleep(Duration::from_millis(50));
        wt.handle().call(|_| {});
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        wt.shutdown();
        wt.join();
    }

    #[test]
    fn suspend_and_resume_dcalls() {
        let wt = started_worker();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let owner = Callable::new();
        wt.handle().call(move |worker| {
            worker.delayed_call(owner, Duration::from_millis(5), move |action, _| {
                if action == CallAction::Execute {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }
                false
            });
            worker.suspend_dcalls(owner);
        });
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wt.handle().call(move |worker| {
            worker.resume_dcalls(owner);
        });
        std::thread::sleep(Duration::from_millis(60));
        wt.handle().call(|_| {});
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wt.shutdown();
        wt.join();
    }

    #[test]
    fn running_worker_count_tracks_lifecycle() {
        // other tests run workers concurrently, so only relative claims
        // are safe here
        let wt = started_worker();
        assert!(running_workers() >= 1);
        let handle = wt.handle().clone();
        wt.shutdown();
        wt.join();
        assert!(handle.has_finished());
    }
}
