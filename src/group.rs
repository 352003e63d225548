//! Asynchronous channel group.
//!
//! A `ChannelGroup` drives many channels from one dedicated selector thread.
//! The selector never performs I/O itself: readiness events are matched
//! against each channel's pending operations and the actual read/write
//! attempts (and every user callback) run on a bounded worker pool. A shared
//! timer thread arms per-operation deadlines.
//!
//! Cross-thread registration follows the handoff-queue pattern: callers
//! enqueue a command and wake the selector, which drains the queue once per
//! loop iteration. Workers that hit a flow-control signal post the readiness
//! they need as an atomically-ORed bitmask on the channel; the selector
//! consumes the mask when the matching readiness event arrives.
//!
//! At most one read and one write may be pending per channel; starting a
//! second is rejected. For every started operation exactly one of success,
//! timeout failure, error failure, or observed cancellation occurs.

use crate::channel::TlsChannel;
use crate::error::{ChannelError, GroupError};
use crate::timer::{Timer, TimerKey};
use crate::transport::Duplex;
use crate::vectored::{GatherBuf, ScatterBuf};
use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};
use slab::Slab;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Completion handler for an asynchronous operation. Receives the buffer set
/// back in success and failure alike.
pub type CompletionHandler = Box<dyn FnOnce(Vec<BytesMut>, Result<usize, GroupError>) + Send>;

const WAKE_TOKEN: Token = Token(usize::MAX);

// Readiness a pending operation is waiting for. A read usually waits for
// readable and a write for writable, but a handshake in flight can invert
// either.
const READ_ON_READABLE: u8 = 0b0001;
const READ_ON_WRITABLE: u8 = 0b0010;
const WRITE_ON_READABLE: u8 = 0b0100;
const WRITE_ON_WRITABLE: u8 = 0b1000;

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_SHUTDOWN_NOW: u8 = 2;
const STATE_TERMINATED: u8 = 3;

enum Cmd {
    Register(Arc<RegisteredChannel>),
    Deregister(Arc<RegisteredChannel>),
}

enum WorkerMsg {
    Job(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Type-erased channel as the group sees it.
trait GroupChannel: Send + Sync {
    fn read(&self, dst: &mut ScatterBuf<'_, '_>) -> Result<usize, ChannelError>;
    fn write(&self, src: &mut GatherBuf<'_>) -> Result<usize, ChannelError>;
    fn close(&self);
}

impl<S> GroupChannel for TlsChannel<S>
where
    S: Duplex + AsRawFd + Send + Sync,
{
    fn read(&self, dst: &mut ScatterBuf<'_, '_>) -> Result<usize, ChannelError> {
        TlsChannel::read(self, dst)
    }

    fn write(&self, src: &mut GatherBuf<'_>) -> Result<usize, ChannelError> {
        TlsChannel::write(self, src)
    }

    fn close(&self) {
        TlsChannel::close(self)
    }
}

struct PendingRead {
    id: u64,
    bufs: Vec<BytesMut>,
    handler: CompletionHandler,
    timer: Option<TimerKey>,
}

struct PendingWrite {
    id: u64,
    bufs: Vec<BytesMut>,
    written: usize,
    handler: CompletionHandler,
    timer: Option<TimerKey>,
}

/// A channel registered with a group.
///
/// Holds at most one pending read and one pending write at a time. The
/// attach gate blocks operations started before the selector thread has
/// picked the channel up.
pub struct RegisteredChannel {
    channel: Box<dyn GroupChannel>,
    fd: RawFd,
    token: Mutex<Option<Token>>,
    attached: Condvar,
    pending_read: Mutex<Option<PendingRead>>,
    pending_write: Mutex<Option<PendingWrite>>,
    interest: AtomicU8,
    ops: AtomicU64,
    closed: AtomicBool,
    /// Still counted against the group's registered-channel total.
    counted: AtomicBool,
}

impl RegisteredChannel {
    /// True once the channel has been closed (explicitly or by group
    /// shutdown).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wait_attached(&self) -> Result<(), GroupError> {
        let mut token = self.token.lock();
        loop {
            if token.is_some() {
                return Ok(());
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(GroupError::Channel(ChannelError::Closed));
            }
            self.attached.wait(&mut token);
        }
    }

    fn has_pending_read(&self) -> bool {
        match self.pending_read.try_lock() {
            Some(slot) => slot.is_some(),
            // An attempt is in flight; submitting another is harmless.
            None => true,
        }
    }

    fn has_pending_write(&self) -> bool {
        match self.pending_write.try_lock() {
            Some(slot) => slot.is_some(),
            None => true,
        }
    }
}

struct Shared {
    waker: Waker,
    cmd_tx: Sender<Cmd>,
    job_tx: Sender<WorkerMsg>,
    state: AtomicU8,
    /// Channels registered (including those still queued for attachment).
    channels: AtomicUsize,
    terminated: Mutex<bool>,
    term_cv: Condvar,
    task_warned: AtomicBool,
}

impl Shared {
    fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.job_tx.send(WorkerMsg::Job(Box::new(job)));
    }

    fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// Builder for a `ChannelGroup`.
pub struct GroupBuilder {
    workers: usize,
    name: String,
}

impl GroupBuilder {
    /// Number of worker threads executing I/O attempts and callbacks.
    /// Default: available parallelism.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Thread-name prefix for the selector, workers, and timer.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn build(self) -> io::Result<ChannelGroup> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<WorkerMsg>();

        let shared = Arc::new(Shared {
            waker,
            cmd_tx,
            job_tx,
            state: AtomicU8::new(STATE_RUNNING),
            channels: AtomicUsize::new(0),
            terminated: Mutex::new(false),
            term_cv: Condvar::new(),
            task_warned: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let rx = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", self.name, worker_id))
                .spawn(move || worker_loop(rx))?;
            workers.push(handle);
        }

        let selector_shared = shared.clone();
        let worker_count = self.workers;
        let selector = std::thread::Builder::new()
            .name(format!("{}-selector", self.name))
            .spawn(move || selector_loop(selector_shared, poll, cmd_rx, worker_count))?;

        let timer = Timer::new(&format!("{}-timer", self.name));

        Ok(ChannelGroup {
            shared,
            timer,
            selector: Mutex::new(Some(selector)),
            workers: Mutex::new(workers),
        })
    }
}

/// A single-selector-thread scheduler for many channels.
pub struct ChannelGroup {
    shared: Arc<Shared>,
    timer: Timer,
    selector: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelGroup {
    pub fn builder() -> GroupBuilder {
        GroupBuilder {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            name: "tls-group".to_string(),
        }
    }

    /// Build a group with default settings.
    pub fn new() -> io::Result<ChannelGroup> {
        Self::builder().build()
    }

    /// Register a channel. Registration is asynchronous: the selector thread
    /// attaches the channel on its next iteration, and operations started
    /// before then block on a one-shot gate until attachment completes.
    pub fn register<S>(&self, channel: TlsChannel<S>) -> Result<Arc<RegisteredChannel>, GroupError>
    where
        S: Duplex + AsRawFd + Send + Sync + 'static,
    {
        if self.shared.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(GroupError::Shutdown);
        }
        let fd = channel.get_ref().as_raw_fd();
        let reg = Arc::new(RegisteredChannel {
            channel: Box::new(channel),
            fd,
            token: Mutex::new(None),
            attached: Condvar::new(),
            pending_read: Mutex::new(None),
            pending_write: Mutex::new(None),
            interest: AtomicU8::new(0),
            ops: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            counted: AtomicBool::new(true),
        });
        self.shared.channels.fetch_add(1, Ordering::AcqRel);
        if self.shared.cmd_tx.send(Cmd::Register(reg.clone())).is_err() {
            self.shared.channels.fetch_sub(1, Ordering::AcqRel);
            return Err(GroupError::Shutdown);
        }
        self.shared.wake();
        Ok(reg)
    }

    /// Start an asynchronous read into the spare capacity of `bufs`.
    ///
    /// Completes once with the bytes read (0 is end-of-stream), a timeout,
    /// or an error; the handler receives the buffers back in every case.
    /// Returns a token accepted by `cancel_read`.
    pub fn start_read(
        &self,
        reg: &Arc<RegisteredChannel>,
        bufs: Vec<BytesMut>,
        timeout: Option<Duration>,
        handler: impl FnOnce(Vec<BytesMut>, Result<usize, GroupError>) + Send + 'static,
    ) -> Result<u64, GroupError> {
        self.check_accepting()?;
        if reg.is_closed() {
            return Err(GroupError::Channel(ChannelError::Closed));
        }
        let id = reg.ops.fetch_add(1, Ordering::Relaxed) + 1;

        // A destination with no space succeeds trivially without touching
        // the channel.
        let space: usize = bufs.iter().map(|b| b.capacity() - b.len()).sum();
        if space == 0 {
            self.shared.submit(move || handler(bufs, Ok(0)));
            return Ok(id);
        }

        reg.wait_attached()?;
        {
            let mut slot = reg.pending_read.lock();
            if slot.is_some() {
                return Err(GroupError::ReadPending);
            }
            let timer = timeout.map(|delay| {
                let shared = self.shared.clone();
                let reg = reg.clone();
                self.timer.schedule(delay, move || {
                    let reg = reg.clone();
                    shared.submit(move || expire_read(&reg, id));
                })
            });
            *slot = Some(PendingRead {
                id,
                bufs,
                handler: Box::new(handler),
                timer,
            });
        }
        // Kick an immediate attempt: plaintext may already be buffered in
        // the channel, and readiness edges fire only on transitions.
        let shared = self.shared.clone();
        let reg = reg.clone();
        self.shared.submit(move || attempt_read(&shared, &reg));
        Ok(id)
    }

    /// Start an asynchronous write of the readable bytes of `bufs`.
    ///
    /// Completes once the entire source has been consumed, or fails with a
    /// timeout or error. Returns a token accepted by `cancel_write`.
    pub fn start_write(
        &self,
        reg: &Arc<RegisteredChannel>,
        bufs: Vec<BytesMut>,
        timeout: Option<Duration>,
        handler: impl FnOnce(Vec<BytesMut>, Result<usize, GroupError>) + Send + 'static,
    ) -> Result<u64, GroupError> {
        self.check_accepting()?;
        if reg.is_closed() {
            return Err(GroupError::Channel(ChannelError::Closed));
        }
        let id = reg.ops.fetch_add(1, Ordering::Relaxed) + 1;

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            self.shared.submit(move || handler(bufs, Ok(0)));
            return Ok(id);
        }

        reg.wait_attached()?;
        {
            let mut slot = reg.pending_write.lock();
            if slot.is_some() {
                return Err(GroupError::WritePending);
            }
            let timer = timeout.map(|delay| {
                let shared = self.shared.clone();
                let reg = reg.clone();
                self.timer.schedule(delay, move || {
                    let reg = reg.clone();
                    shared.submit(move || expire_write(&reg, id));
                })
            });
            *slot = Some(PendingWrite {
                id,
                bufs,
                written: 0,
                handler: Box::new(handler),
                timer,
            });
        }
        let shared = self.shared.clone();
        let reg = reg.clone();
        self.shared.submit(move || attempt_write(&shared, &reg));
        Ok(id)
    }

    /// Cancel a pending read. Returns false if the operation already
    /// completed (or the token is stale). No callback is invoked: the
    /// canceller already knows.
    pub fn cancel_read(&self, reg: &Arc<RegisteredChannel>, token: u64) -> bool {
        let mut slot = reg.pending_read.lock();
        match slot.as_ref() {
            Some(op) if op.id == token => {}
            _ => return false,
        }
        let op = slot.take().unwrap();
        drop(slot);
        if let Some(timer) = &op.timer {
            timer.cancel();
        }
        true
    }

    /// Cancel a pending write. See `cancel_read`.
    pub fn cancel_write(&self, reg: &Arc<RegisteredChannel>, token: u64) -> bool {
        let mut slot = reg.pending_write.lock();
        match slot.as_ref() {
            Some(op) if op.id == token => {}
            _ => return false,
        }
        let op = slot.take().unwrap();
        drop(slot);
        if let Some(timer) = &op.timer {
            timer.cancel();
        }
        true
    }

    /// Close a registered channel: cancels its pending operations (their
    /// handlers fire with `Cancelled`), closes the underlying channel, and
    /// deregisters it from the selector. Safe from any thread, including
    /// completion callbacks.
    pub fn close_channel(&self, reg: &Arc<RegisteredChannel>) {
        close_registered(&self.shared, reg);
    }

    /// Channels currently registered (including those queued for
    /// attachment).
    pub fn channel_count(&self) -> usize {
        self.shared.channels.load(Ordering::Acquire)
    }

    /// Graceful shutdown: stop accepting registrations, let in-flight work
    /// finish, and terminate once no channels remain registered.
    pub fn shutdown(&self) {
        self.shared
            .state
            .fetch_max(STATE_SHUTTING_DOWN, Ordering::AcqRel);
        self.shared.wake();
    }

    /// Immediate shutdown: force-close every registered channel.
    pub fn shutdown_now(&self) {
        self.shared
            .state
            .fetch_max(STATE_SHUTDOWN_NOW, Ordering::AcqRel);
        self.shared.wake();
    }

    /// Wait up to `timeout` for the group to terminate. Returns true once
    /// terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut terminated = self.shared.terminated.lock();
        while !*terminated {
            if self
                .shared
                .term_cv
                .wait_until(&mut terminated, deadline)
                .timed_out()
            {
                return *terminated;
            }
        }
        true
    }

    fn check_accepting(&self) -> Result<(), GroupError> {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_RUNNING | STATE_SHUTTING_DOWN => Ok(()),
            _ => Err(GroupError::Shutdown),
        }
    }
}

impl Drop for ChannelGroup {
    fn drop(&mut self) {
        self.shutdown_now();
        if let Some(handle) = self.selector.lock().take() {
            let _ = handle.join();
        }
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        self.timer.stop();
    }
}

// ── worker side ─────────────────────────────────────────────────────────

fn worker_loop(rx: Receiver<WorkerMsg>) {
    loop {
        match rx.recv() {
            Ok(WorkerMsg::Job(job)) => job(),
            Ok(WorkerMsg::Shutdown) | Err(_) => return,
        }
    }
}

/// Spare capacity of `buf` as a writable slice.
fn spare_of(buf: &mut BytesMut) -> &mut [u8] {
    let len = buf.len();
    let cap = buf.capacity();
    // Safety: completion commits exactly the bytes the channel wrote here.
    unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().add(len), cap - len) }
}

/// Extend buffer lengths to cover `n` bytes written into their spare
/// capacity, in order.
fn commit_read(bufs: &mut [BytesMut], mut n: usize) {
    for buf in bufs {
        if n == 0 {
            break;
        }
        let spare = buf.capacity() - buf.len();
        let take = spare.min(n);
        // Safety: `take` bytes were written into this buffer's spare
        // capacity by the read attempt.
        unsafe {
            buf.set_len(buf.len() + take);
        }
        n -= take;
    }
    debug_assert_eq!(n, 0);
}

fn run_surfaced_tasks(shared: &Arc<Shared>, tasks: Vec<crate::engine::Task>) {
    if !shared.task_warned.swap(true, Ordering::AcqRel) {
        warn!(
            "channel surfaces delegated tasks but is driven by a group; \
             running them on a worker thread"
        );
    }
    for task in tasks {
        task.run();
    }
}

fn attempt_read(shared: &Arc<Shared>, reg: &Arc<RegisteredChannel>) {
    loop {
        let mut slot = reg.pending_read.lock();
        let Some(op) = slot.as_mut() else { return };

        let result = {
            let mut slices: Vec<&mut [u8]> = op.bufs.iter_mut().map(spare_of).collect();
            let mut dst = ScatterBuf::new(&mut slices);
            reg.channel.read(&mut dst)
        };

        match result {
            Ok(n) => {
                let mut op = slot.take().unwrap();
                drop(slot);
                if let Some(timer) = &op.timer {
                    timer.cancel();
                }
                commit_read(&mut op.bufs, n);
                (op.handler)(op.bufs, Ok(n));
                return;
            }
            Err(ChannelError::NeedsRead) => {
                drop(slot);
                reg.interest.fetch_or(READ_ON_READABLE, Ordering::AcqRel);
                return;
            }
            Err(ChannelError::NeedsWrite) => {
                drop(slot);
                reg.interest.fetch_or(READ_ON_WRITABLE, Ordering::AcqRel);
                return;
            }
            Err(ChannelError::NeedsTask(tasks)) => {
                drop(slot);
                run_surfaced_tasks(shared, tasks);
                // Tasks done; try again right away.
            }
            Err(e) => {
                let op = slot.take().unwrap();
                drop(slot);
                if let Some(timer) = &op.timer {
                    timer.cancel();
                }
                (op.handler)(op.bufs, Err(GroupError::Channel(e)));
                return;
            }
        }
    }
}

fn attempt_write(shared: &Arc<Shared>, reg: &Arc<RegisteredChannel>) {
    loop {
        let mut slot = reg.pending_write.lock();
        let Some(op) = slot.as_mut() else { return };

        let total: usize = op.bufs.iter().map(|b| b.len()).sum();
        let written = op.written;
        let result = {
            let slices: Vec<&[u8]> = op.bufs.iter().map(|b| &b[..]).collect();
            let mut src = GatherBuf::new(&slices);
            src.advance(written);
            reg.channel.write(&mut src)
        };

        match result {
            Ok(n) => {
                op.written += n;
                if op.written >= total {
                    let op = slot.take().unwrap();
                    drop(slot);
                    if let Some(timer) = &op.timer {
                        timer.cancel();
                    }
                    let written = op.written;
                    (op.handler)(op.bufs, Ok(written));
                    return;
                }
                // Short write: the transport made some progress, try the
                // remainder immediately.
            }
            Err(ChannelError::NeedsRead) => {
                drop(slot);
                reg.interest.fetch_or(WRITE_ON_READABLE, Ordering::AcqRel);
                return;
            }
            Err(ChannelError::NeedsWrite) => {
                drop(slot);
                reg.interest.fetch_or(WRITE_ON_WRITABLE, Ordering::AcqRel);
                return;
            }
            Err(ChannelError::NeedsTask(tasks)) => {
                drop(slot);
                run_surfaced_tasks(shared, tasks);
            }
            Err(e) => {
                let op = slot.take().unwrap();
                drop(slot);
                if let Some(timer) = &op.timer {
                    timer.cancel();
                }
                (op.handler)(op.bufs, Err(GroupError::Channel(e)));
                return;
            }
        }
    }
}

fn expire_read(reg: &Arc<RegisteredChannel>, id: u64) {
    let mut slot = reg.pending_read.lock();
    match slot.as_ref() {
        Some(op) if op.id == id => {}
        // Completed or replaced; the timeout loses the race.
        _ => return,
    }
    let op = slot.take().unwrap();
    drop(slot);
    (op.handler)(op.bufs, Err(GroupError::Timeout));
}

fn expire_write(reg: &Arc<RegisteredChannel>, id: u64) {
    let mut slot = reg.pending_write.lock();
    match slot.as_ref() {
        Some(op) if op.id == id => {}
        _ => return,
    }
    let op = slot.take().unwrap();
    drop(slot);
    (op.handler)(op.bufs, Err(GroupError::Timeout));
}

fn close_registered(shared: &Arc<Shared>, reg: &Arc<RegisteredChannel>) {
    {
        // Take the attach-gate lock so a starter cannot miss the closed
        // flag between its check and its wait.
        let _gate = reg.token.lock();
        if reg.closed.swap(true, Ordering::AcqRel) {
            return;
        }
    }
    reg.attached.notify_all();

    if let Some(op) = reg.pending_read.lock().take() {
        if let Some(timer) = &op.timer {
            timer.cancel();
        }
        let handler = op.handler;
        let bufs = op.bufs;
        shared.submit(move || handler(bufs, Err(GroupError::Cancelled)));
    }
    if let Some(op) = reg.pending_write.lock().take() {
        if let Some(timer) = &op.timer {
            timer.cancel();
        }
        let handler = op.handler;
        let bufs = op.bufs;
        shared.submit(move || handler(bufs, Err(GroupError::Cancelled)));
    }

    reg.channel.close();
    let _ = shared.cmd_tx.send(Cmd::Deregister(reg.clone()));
    shared.wake();
}

// ── selector side ───────────────────────────────────────────────────────

fn selector_loop(
    shared: Arc<Shared>,
    mut poll: Poll,
    cmd_rx: Receiver<Cmd>,
    worker_count: usize,
) {
    let mut events = Events::with_capacity(256);
    let mut channels: Slab<Arc<RegisteredChannel>> = Slab::with_capacity(64);

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %e, "selector poll failed");
            break;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            if let Some(reg) = channels.get(event.token().0) {
                dispatch_event(&shared, reg, event);
            }
        }

        // Attach newly-registered channels, then apply deregistrations.
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                Cmd::Register(reg) => attach(&mut poll, &mut channels, &shared, reg),
                Cmd::Deregister(reg) => detach(&mut poll, &mut channels, &shared, &reg),
            }
        }

        let state = shared.state.load(Ordering::Acquire);
        if state == STATE_SHUTDOWN_NOW {
            let regs: Vec<_> = channels.iter().map(|(_, reg)| reg.clone()).collect();
            for reg in regs {
                close_registered(&shared, &reg);
            }
            // The deregister commands just queued arrive with the waker.
        }
        if state != STATE_RUNNING && shared.channels.load(Ordering::Acquire) == 0 {
            break;
        }
    }

    for _ in 0..worker_count {
        let _ = shared.job_tx.send(WorkerMsg::Shutdown);
    }
    shared.state.store(STATE_TERMINATED, Ordering::Release);
    let mut terminated = shared.terminated.lock();
    *terminated = true;
    shared.term_cv.notify_all();
    debug!("selector terminated");
}

fn dispatch_event(shared: &Arc<Shared>, reg: &Arc<RegisteredChannel>, event: &mio::event::Event) {
    let bits = reg.interest.swap(0, Ordering::AcqRel);
    let mut unconsumed = bits;

    let readable = event.is_readable() || event.is_read_closed() || event.is_error();
    let writable = event.is_writable() || event.is_write_closed() || event.is_error();

    let mut run_read = false;
    let mut run_write = false;

    if readable {
        if reg.has_pending_read() {
            run_read = true;
        }
        if bits & WRITE_ON_READABLE != 0 {
            run_write = true;
        }
        unconsumed &= !(READ_ON_READABLE | WRITE_ON_READABLE);
    }
    if writable {
        if reg.has_pending_write() {
            run_write = true;
        }
        if bits & READ_ON_WRITABLE != 0 {
            run_read = true;
        }
        unconsumed &= !(WRITE_ON_WRITABLE | READ_ON_WRITABLE);
    }

    if unconsumed != 0 {
        reg.interest.fetch_or(unconsumed, Ordering::AcqRel);
    }

    if run_read {
        let job_shared = shared.clone();
        let reg = reg.clone();
        shared.submit(move || attempt_read(&job_shared, &reg));
    }
    if run_write {
        let job_shared = shared.clone();
        let reg = reg.clone();
        shared.submit(move || attempt_write(&job_shared, &reg));
    }
}

fn uncount(shared: &Arc<Shared>, reg: &Arc<RegisteredChannel>) {
    if reg.counted.swap(false, Ordering::AcqRel) {
        shared.channels.fetch_sub(1, Ordering::AcqRel);
    }
}

fn attach(
    poll: &mut Poll,
    channels: &mut Slab<Arc<RegisteredChannel>>,
    shared: &Arc<Shared>,
    reg: Arc<RegisteredChannel>,
) {
    if reg.is_closed() || shared.state.load(Ordering::Acquire) == STATE_SHUTDOWN_NOW {
        // Closed (or force-shutdown) before attachment; never registers.
        close_registered(shared, &reg);
        uncount(shared, &reg);
        return;
    }

    let entry = channels.vacant_entry();
    let token = Token(entry.key());
    // Registration is edge-triggered with both interests held for the
    // channel's lifetime; readiness is matched against the posted interest
    // bits instead of reregistering.
    match poll
        .registry()
        .register(&mut SourceFd(&reg.fd), token, Interest::READABLE | Interest::WRITABLE)
    {
        Ok(()) => {
            entry.insert(reg.clone());
            let mut slot = reg.token.lock();
            *slot = Some(token);
            drop(slot);
            reg.attached.notify_all();
        }
        Err(e) => {
            warn!(error = %e, "failed to attach channel to selector");
            close_registered(shared, &reg);
            uncount(shared, &reg);
        }
    }
}

fn detach(
    poll: &mut Poll,
    channels: &mut Slab<Arc<RegisteredChannel>>,
    shared: &Arc<Shared>,
    reg: &Arc<RegisteredChannel>,
) {
    let token = *reg.token.lock();
    let Some(token) = token else {
        // Never attached; the register command handles the bookkeeping.
        return;
    };
    if channels.contains(token.0) {
        channels.remove(token.0);
        let _ = poll.registry().deregister(&mut SourceFd(&reg.fd));
        uncount(shared, reg);
    }
}
