//! Display thread: swaps the display on its own schedule and renders queued
//! frames right before the swap they are meant for.
//!
//! Other threads talk to it through a command queue (crossbeam channel) and
//! observe it through update events and queued-frame completion callbacks.
//!
//! Loop, per iteration:
//!
//! 1. run pending commands
//! 2. emit an [`UpdateEvent`] to observers
//! 3. when swapping and owning the rendering context: finish fences of
//!    swapped frames, render the front queued frame if it is due, and swap
//!    once the next refresh is within the pre-swap safety buffer

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::time::Time;
use crate::display::swap_timing::{SwapTiming, DEFAULT_PRE_SWAP_SAFETY_BUFFER};
use crate::display::DisplayCore;
use crate::error::{Error, Result};
use crate::render::backend::SlideContent;
use crate::render::fence::FenceSync;
use crate::sync::data_client::DataClientConfig;
use crate::sync::swap_data::SwapData;

/// Work the display thread performs on request.
pub enum DisplayCommand {
    SetSwapInterval(u32),
    /// Acquire (`true`) or release (`false`) the rendering context.
    AcquireRenderingContext(bool),
    ExecuteFunction(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for DisplayCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayCommand::SetSwapInterval(interval) => f.debug_tuple("SetSwapInterval").field(interval).finish(),
            DisplayCommand::AcquireRenderingContext(acquire) => {
                f.debug_tuple("AcquireRenderingContext").field(acquire).finish()
            }
            DisplayCommand::ExecuteFunction(_) => f.write_str("ExecuteFunction(..)"),
        }
    }
}

/// Called with whether the command succeeded.
pub type CommandCallback = Box<dyn FnOnce(bool) + Send>;

/// Emitted once per display thread loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateEvent {
    pub now: Time,
    pub last_swap: Option<SwapData>,
}

pub type UpdateObserver = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;

/// Outcome of a queued frame, delivered after its swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedFrameResult {
    pub desired_start_frame: u64,
    pub actual_start_frame: u64,
    /// Time of the swap that put the frame on screen.
    pub start_time: Time,
    /// Whether the GPU reported when rendering completed.
    pub render_time_valid: bool,
    /// Zero when `render_time_valid` is false.
    pub render_complete_time: Time,
}

pub type QueuedFrameCallback = Box<dyn FnOnce(QueuedFrameResult) + Send>;

struct Envelope {
    command: DisplayCommand,
    on_complete: Option<CommandCallback>,
}

struct QueuedFrame {
    content: SlideContent,
    start_frame: u64,
    on_complete: Option<QueuedFrameCallback>,
}

/// A frame rendered into the back buffer, waiting for its swap and fence.
struct RenderedFrame {
    desired_start_frame: u64,
    fence: FenceSync,
    swap: Option<SwapData>,
    on_complete: Option<QueuedFrameCallback>,
}

impl RenderedFrame {
    /// Deliver the result once the fence resolved. Returns true when done.
    fn try_complete(&mut self) -> bool {
        let Some(swap) = self.swap else {
            return false;
        };
        if self.fence.is_syncing() && !self.fence.update_sync() && !self.fence.sync_failed() {
            return false;
        }
        let result = QueuedFrameResult {
            desired_start_frame: self.desired_start_frame,
            actual_start_frame: swap.unit,
            start_time: swap.time,
            render_time_valid: self.fence.sync_success(),
            render_complete_time: self.fence.complete_time().unwrap_or(Time::ZERO),
        };
        if result.actual_start_frame != result.desired_start_frame {
            warn!(
                "Queued frame for {} went on screen at {}",
                result.desired_start_frame, result.actual_start_frame
            );
        }
        if let Some(callback) = self.on_complete.take() {
            callback(result);
        }
        true
    }
}

struct ThreadShared {
    running: AtomicBool,
    swapping: AtomicBool,
    thread_id: Mutex<Option<ThreadId>>,
    command_tx: Sender<Envelope>,
    command_rx: Receiver<Envelope>,
    queued: Mutex<VecDeque<QueuedFrame>>,
    rendered: Mutex<Option<RenderedFrame>>,
    swapped: Mutex<Vec<RenderedFrame>>,
    observers: Mutex<Vec<(u64, UpdateObserver)>>,
    next_observer_id: AtomicU64,
    lock_owner: Mutex<Option<String>>,
    swap_timing: Mutex<SwapTiming>,
}

const COMMAND_PENDING: u8 = 0;
const COMMAND_OK: u8 = 1;
const COMMAND_FAILED: u8 = 2;

/// Handle to a display's swapping thread.
pub struct DisplayThread {
    core: Arc<DisplayCore>,
    shared: Arc<ThreadShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DisplayThread {
    pub(crate) fn new(core: Arc<DisplayCore>) -> Self {
        let (command_tx, command_rx) = channel::unbounded();
        let swap_timing = SwapTiming::new(
            core.swap_data().clone(),
            core.frame_period(),
            DataClientConfig::default(),
            DEFAULT_PRE_SWAP_SAFETY_BUFFER,
        );
        Self {
            shared: Arc::new(ThreadShared {
                running: AtomicBool::new(false),
                swapping: AtomicBool::new(false),
                thread_id: Mutex::new(None),
                command_tx,
                command_rx,
                queued: Mutex::new(VecDeque::new()),
                rendered: Mutex::new(None),
                swapped: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
                next_observer_id: AtomicU64::new(1),
                lock_owner: Mutex::new(None),
                swap_timing: Mutex::new(swap_timing),
            }),
            core,
            handle: Mutex::new(None),
        }
    }

    /// Start the thread if it is not running.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the thread cannot be spawned.
    pub fn start_thread(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let core = self.core.clone();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("display".to_string())
            .spawn(move || run(core, shared));
        match spawned {
            Ok(join) => {
                *handle = Some(join);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(Error::Io(e))
            }
        }
    }

    /// Ask the thread to stop; with `wait`, join it.
    pub fn stop_thread(&self, wait: bool) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.swapping.store(false, Ordering::SeqCst);
        if !wait || self.on_display_thread() {
            return;
        }
        if let Some(join) = self.handle.lock().take() {
            if join.join().is_err() {
                error!("Display thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn set_swapping(&self, swapping: bool) {
        self.shared.swapping.store(swapping, Ordering::SeqCst);
    }

    pub fn is_swapping(&self) -> bool {
        self.shared.swapping.load(Ordering::SeqCst)
    }

    pub fn set_pre_swap_safety_buffer(&self, buffer: Time) {
        self.shared.swap_timing.lock().set_pre_swap_safety_buffer(buffer);
    }

    /// Queue `command`. With `wait`, spin (yielding) until it ran and return
    /// whether it succeeded; without, return whether it was queued.
    pub fn queue_command(&self, command: DisplayCommand, wait: bool) -> bool {
        if self.on_display_thread() {
            return execute(&self.core, command);
        }
        if !wait {
            return self.send(command, None);
        }
        let state = Arc::new(AtomicU8::new(COMMAND_PENDING));
        let flag = state.clone();
        let callback: CommandCallback = Box::new(move |ok| {
            flag.store(if ok { COMMAND_OK } else { COMMAND_FAILED }, Ordering::SeqCst);
        });
        if !self.send(command, Some(callback)) {
            return false;
        }
        loop {
            match state.load(Ordering::SeqCst) {
                COMMAND_OK => return true,
                COMMAND_FAILED => return false,
                _ if !self.is_running() => {
                    warn!("Display thread stopped while a command was pending");
                    return false;
                }
                _ => thread::yield_now(),
            }
        }
    }

    /// Queue `command` and call `on_complete` on the display thread once it ran.
    pub fn queue_command_with_callback(&self, command: DisplayCommand, on_complete: CommandCallback) -> bool {
        self.send(command, Some(on_complete))
    }

    fn send(&self, command: DisplayCommand, on_complete: Option<CommandCallback>) -> bool {
        if !self.is_running() {
            error!("Command {:?} sent while the display thread is not running", command);
            return false;
        }
        self.shared.command_tx.send(Envelope { command, on_complete }).is_ok()
    }

    /// Move the rendering context from the calling thread to the display thread.
    pub(crate) fn hand_over_context(&self) -> Result<()> {
        if self.on_display_thread() {
            return self.core.context().acquire();
        }
        self.core.context().release();
        if self.queue_command(DisplayCommand::AcquireRenderingContext(true), true) {
            Ok(())
        } else {
            let _ = self.core.context().acquire();
            Err(Error::ContextAcquisition(
                "display thread could not acquire the rendering context".to_string(),
            ))
        }
    }

    /// Move the rendering context from the display thread to the calling thread.
    pub(crate) fn take_back_context(&self) -> Result<()> {
        if self.is_running() && !self.queue_command(DisplayCommand::AcquireRenderingContext(false), true) {
            warn!("Display thread did not release the rendering context");
        }
        self.core.context().acquire()
    }

    /// Queue `content` to be rendered right before the swap that reaches
    /// `start_frame`. `on_complete` runs on the display thread after that swap.
    pub fn queue_frame(
        &self,
        content: SlideContent,
        start_frame: u64,
        on_complete: impl FnOnce(QueuedFrameResult) + Send + 'static,
    ) {
        let mut queued = self.shared.queued.lock();
        if let Some(back) = queued.back() {
            if back.start_frame >= start_frame {
                warn!(
                    "Queued frame for {} is not after the previous one ({})",
                    start_frame, back.start_frame
                );
            }
        }
        queued.push_back(QueuedFrame {
            content,
            start_frame,
            on_complete: Some(Box::new(on_complete)),
        });
    }

    pub fn queued_frame_count(&self) -> usize {
        self.shared.queued.lock().len()
    }

    /// Whether frames are queued, rendered or waiting for their fence.
    pub fn has_pending_frames(&self) -> bool {
        if !self.shared.queued.lock().is_empty() {
            return true;
        }
        if self.shared.rendered.lock().is_some() {
            return true;
        }
        !self.shared.swapped.lock().is_empty()
    }

    /// Drop every queued frame that has not been rendered yet.
    pub fn clear_queued_frames(&self) {
        let dropped = {
            let mut queued = self.shared.queued.lock();
            let count = queued.len();
            queued.clear();
            count
        };
        if dropped > 0 {
            debug!("Cleared {} queued frames", dropped);
        }
    }

    /// Register an observer of update events. Returns its id.
    pub fn add_update_observer(&self, observer: UpdateObserver) -> u64 {
        let id = self.shared.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.shared.observers.lock().push((id, observer));
        id
    }

    pub fn remove_update_observer(&self, id: u64) -> bool {
        let mut observers = self.shared.observers.lock();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    /// Label of whoever currently holds the display for exclusive use.
    pub fn lock_owner(&self) -> Option<String> {
        self.shared.lock_owner.lock().clone()
    }

    pub fn set_lock_owner(&self, owner: Option<String>) {
        *self.shared.lock_owner.lock() = owner;
    }

    fn on_display_thread(&self) -> bool {
        *self.shared.thread_id.lock() == Some(thread::current().id())
    }
}

impl Drop for DisplayThread {
    fn drop(&mut self) {
        self.stop_thread(true);
    }
}

fn execute(core: &DisplayCore, command: DisplayCommand) -> bool {
    match command {
        DisplayCommand::SetSwapInterval(interval) => match core.backend().set_swap_interval(interval) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to set swap interval {}: {}", interval, e);
                false
            }
        },
        DisplayCommand::AcquireRenderingContext(true) => match core.context().acquire() {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                false
            }
        },
        DisplayCommand::AcquireRenderingContext(false) => {
            core.context().release();
            true
        }
        DisplayCommand::ExecuteFunction(function) => {
            function();
            true
        }
    }
}

fn run(core: Arc<DisplayCore>, shared: Arc<ThreadShared>) {
    *shared.thread_id.lock() = Some(thread::current().id());
    info!("Display thread started");

    while shared.running.load(Ordering::SeqCst) {
        while let Ok(envelope) = shared.command_rx.try_recv() {
            let ok = execute(&core, envelope.command);
            if let Some(callback) = envelope.on_complete {
                callback(ok);
            }
        }

        let event = UpdateEvent {
            now: core.now(),
            last_swap: core.swap_data().last_swap_data(),
        };
        let observers: Vec<UpdateObserver> = shared.observers.lock().iter().map(|(_, o)| o.clone()).collect();
        for observer in &observers {
            observer(&event);
        }

        if shared.swapping.load(Ordering::SeqCst) && core.context().is_current() {
            let mut swapped = std::mem::take(&mut *shared.swapped.lock());
            swapped.retain_mut(|frame| !frame.try_complete());
            shared.swapped.lock().extend(swapped);
            render_due_frame(&core, &shared);
            let due = shared.swap_timing.lock().should_swap(core.now());
            if due {
                match core.swap_buffers() {
                    Ok(data) => {
                        let rendered = shared.rendered.lock().take();
                        if let Some(mut frame) = rendered {
                            frame.swap = Some(data);
                            if !frame.try_complete() {
                                shared.swapped.lock().push(frame);
                            }
                        }
                    }
                    Err(e) => {
                        error!("Display thread swap failed: {}", e);
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                continue;
            }
        }
        thread::yield_now();
    }

    while let Ok(envelope) = shared.command_rx.try_recv() {
        if let Some(callback) = envelope.on_complete {
            callback(false);
        }
    }
    core.context().release();
    *shared.thread_id.lock() = None;
    info!("Display thread stopped");
}

/// Render the front queued frame if its start frame is the next swap or earlier.
fn render_due_frame(core: &DisplayCore, shared: &ThreadShared) {
    if shared.rendered.lock().is_some() {
        return;
    }
    let next_unit = core.swap_data().next_swap_unit();
    let frame = {
        let mut queued = shared.queued.lock();
        if queued.front().is_some_and(|front| front.start_frame <= next_unit) {
            queued.pop_front()
        } else {
            None
        }
    };
    let Some(frame) = frame else {
        return;
    };
    if frame.start_frame < next_unit {
        warn!(
            "Queued frame for {} rendered late, next swap reaches {}",
            frame.start_frame, next_unit
        );
    }
    let mut fence = FenceSync::new();
    match core.render_content(&frame.content).and_then(|_| core.insert_fence()) {
        Ok(gpu_fence) => fence.start_sync(gpu_fence, core.now()),
        Err(e) => error!("Failed to render queued frame for {}: {}", frame.start_frame, e),
    }
    *shared.rendered.lock() = Some(RenderedFrame {
        desired_start_frame: frame.start_frame,
        fence,
        swap: None,
        on_complete: frame.on_complete,
    });
}
