//! # Render Coordinator
//!
//! Pipelines preparation of frame N+1 on the caller's thread against
//! issuance of frame N on a dedicated draw thread.
//!
//! ## Frame Handoff
//!
//! ```text
//!  caller thread                          draw thread
//!  ─────────────                          ───────────
//!  begin_frame ─► fill batches
//!  end_draw:
//!    wait uploads of N ◄──────────────────  flush generators (N)
//!    reset generators, prepare N+1              │
//!    wait draw of N    ◄──────────────────  issue N, present, dispose N
//!    swap slots
//!    send N+1 ───────────────────────────►  flush generators (N+1) ...
//! ```
//!
//! Exactly one frame is in flight on the draw thread at a time. Every wait
//! is bounded by `coordinator.draw_wait_timeout_ms`.
//!
//! ## Device Loss
//!
//! Issuance runs under the device-use lock and uploads under the
//! device-creation lock. A reset takes both, so no upload or draw overlaps
//! it. While the device is lost, or for a settle window after a reset,
//! frames are prepared and disposed but never issued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use prism_core::{CompletionCell, DoubleBuffer, SyncError};

use crate::device::DeviceStatus;
use crate::error::{RenderError, RenderResult};
use crate::frame::Frame;
use crate::manager::RenderManager;
use crate::stats::FrameStats;

/// One-shot work queued against the pipeline.
pub type FrameHandler = Box<dyn FnOnce() + Send>;

type DeviceGuard = ArcMutexGuard<RawMutex, ()>;

/// Completion cells of the frame currently handed to the draw routine.
#[derive(Clone)]
struct InFlight {
    frame_index: u64,
    uploads_done: Arc<CompletionCell<()>>,
    done: Arc<CompletionCell<Result<(), RenderError>>>,
}

impl InFlight {
    fn new(frame_index: u64) -> Self {
        Self {
            frame_index,
            uploads_done: Arc::new(CompletionCell::new()),
            done: Arc::new(CompletionCell::new()),
        }
    }
}

struct DrawRequest {
    frame: Arc<Frame>,
    in_flight: InFlight,
}

enum DrawMessage {
    Draw(DrawRequest),
    Shutdown,
}

#[derive(Default)]
struct HandlerQueues {
    before_prepare: Mutex<Vec<FrameHandler>>,
    before_issue: Mutex<Vec<FrameHandler>>,
    before_present: Mutex<Vec<FrameHandler>>,
    after_present: Mutex<Vec<FrameHandler>>,
}

fn run_handlers(queue: &Mutex<Vec<FrameHandler>>) {
    let handlers = std::mem::take(&mut *queue.lock());
    for handler in handlers {
        handler();
    }
}

/// State shared between the caller and the draw thread.
struct Shared {
    manager: Arc<RenderManager>,
    frames: DoubleBuffer<Arc<Frame>>,
    draw_lock: Mutex<()>,
    use_lock: Arc<Mutex<()>>,
    create_lock: Arc<Mutex<()>>,
    reset_guards: Mutex<Option<(DeviceGuard, DeviceGuard)>>,
    device_lost: AtomicBool,
    last_reset: Mutex<Option<Instant>>,
    handlers: HandlerQueues,
    pending_disposals: Mutex<Vec<FrameHandler>>,
    last_draw_error: Mutex<Option<RenderError>>,
    last_frame_stats: Mutex<FrameStats>,
    frames_drawn: AtomicU64,
    frames_skipped: AtomicU64,
}

impl Shared {
    fn wait_timeout(&self) -> Duration {
        self.manager.config().coordinator.draw_wait_timeout()
    }

    fn is_settling(&self) -> bool {
        let settle = self.manager.config().coordinator.device_settle();
        self.last_reset
            .lock()
            .is_some_and(|reset| reset.elapsed() < settle)
    }

    /// Decides whether this frame may touch the device.
    fn can_issue(&self) -> bool {
        match self.manager.device().status() {
            DeviceStatus::Lost => {
                if !self.device_lost.swap(true, Ordering::AcqRel) {
                    tracing::warn!("graphics device lost; skipping draws");
                }
                false
            }
            DeviceStatus::Normal => {
                if self.device_lost.swap(false, Ordering::AcqRel) {
                    tracing::info!("graphics device available again; resuming draws");
                }
                !self.is_settling()
            }
        }
    }

    /// Issues one frame. Runs on the draw thread, or inline.
    fn draw(&self, request: DrawRequest) {
        let DrawRequest { frame, in_flight } = request;
        let result = self.draw_frame(&frame, &in_flight);

        // A skipped or failed draw must still unblock the next preparation.
        in_flight.uploads_done.complete(());

        if let Err(error) = frame.dispose(&self.manager) {
            tracing::warn!("failed to dispose frame {}: {}", in_flight.frame_index, error);
        }
        self.frames.draw_slot().take();

        if let Err(error) = &result {
            tracing::error!("frame {} failed to draw: {}", in_flight.frame_index, error);
            *self.last_draw_error.lock() = Some(error.clone());
        }
        in_flight.done.complete(result);
    }

    fn draw_frame(&self, frame: &Frame, in_flight: &InFlight) -> RenderResult<()> {
        let _draw = self.draw_lock.lock();
        run_handlers(&self.handlers.before_issue);

        let timeout = self.wait_timeout();
        let Some(_use) = self.use_lock.try_lock_for(timeout) else {
            self.frames_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "frame {} skipped: device busy resetting",
                in_flight.frame_index
            );
            return Ok(());
        };

        if !self.can_issue() {
            self.frames_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("frame {} skipped: device unavailable", in_flight.frame_index);
            self.run_pending_disposals();
            return Ok(());
        }

        let stats = {
            let _create = self.create_lock.lock();
            let flushed = self.manager.flush_buffer_generators();
            in_flight.uploads_done.complete(());
            flushed?;
            frame.draw(&self.manager, self.manager.device().as_ref())?
        };

        run_handlers(&self.handlers.before_present);
        self.manager.device().present()?;
        run_handlers(&self.handlers.after_present);

        self.run_pending_disposals();
        *self.last_frame_stats.lock() = stats;
        self.frames_drawn.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn run_pending_disposals(&self) {
        let _create = self.create_lock.lock();
        run_handlers(&self.pending_disposals);
    }
}

fn draw_loop(shared: &Shared, receiver: &Receiver<DrawMessage>) {
    tracing::info!("draw thread started");
    for message in receiver {
        match message {
            DrawMessage::Draw(request) => shared.draw(request),
            DrawMessage::Shutdown => break,
        }
    }
    tracing::info!("draw thread stopped");
}

/// Double-buffered prepare/draw pipeline over one [`RenderManager`].
///
/// # Example
///
/// ```rust,ignore
/// let coordinator = RenderCoordinator::new(manager.clone())?;
///
/// loop {
///     let frame = coordinator.begin_frame(None)?;
///     // producers add batches to `frame`
///     coordinator.end_draw()?;
/// }
/// ```
pub struct RenderCoordinator {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<DrawMessage>>>,
    draw_thread: Mutex<Option<JoinHandle<()>>>,
    in_flight: Mutex<Option<InFlight>>,
    disposed: AtomicBool,
}

impl RenderCoordinator {
    /// Creates a coordinator, starting the draw thread when issuance is
    /// threaded.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::DrawThread`] if the thread cannot be spawned.
    pub fn new(manager: Arc<RenderManager>) -> RenderResult<Self> {
        let threaded = manager.config().coordinator.threaded_issue;
        let shared = Arc::new(Shared {
            manager,
            frames: DoubleBuffer::new(),
            draw_lock: Mutex::new(()),
            use_lock: Arc::new(Mutex::new(())),
            create_lock: Arc::new(Mutex::new(())),
            reset_guards: Mutex::new(None),
            device_lost: AtomicBool::new(false),
            last_reset: Mutex::new(None),
            handlers: HandlerQueues::default(),
            pending_disposals: Mutex::new(Vec::new()),
            last_draw_error: Mutex::new(None),
            last_frame_stats: Mutex::new(FrameStats::default()),
            frames_drawn: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
        });

        let (sender, draw_thread) = if threaded {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let thread_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("prism-draw".to_owned())
                .spawn(move || draw_loop(&thread_shared, &receiver))
                .map_err(|e| RenderError::DrawThread(e.to_string()))?;
            (Some(sender), Some(handle))
        } else {
            (None, None)
        };

        tracing::info!(
            "render coordinator started ({} issue)",
            if threaded { "threaded" } else { "inline" }
        );
        Ok(Self {
            shared,
            sender: Mutex::new(sender),
            draw_thread: Mutex::new(draw_thread),
            in_flight: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// The render manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<RenderManager> {
        &self.shared.manager
    }

    fn ensure_live(&self) -> RenderResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RenderError::CoordinatorDisposed);
        }
        Ok(())
    }

    // =========================================================================
    // Frame pipeline
    // =========================================================================

    /// Starts filling a new frame.
    ///
    /// # Errors
    ///
    /// - [`RenderError::CoordinatorDisposed`] after shutdown
    /// - [`RenderError::FrameInProgress`] if the previous frame was never
    ///   ended
    pub fn begin_frame(&self, label: Option<&str>) -> RenderResult<Arc<Frame>> {
        self.ensure_live()?;
        let mut slot = self.shared.frames.prepare_slot();
        if slot.is_some() {
            return Err(RenderError::FrameInProgress);
        }
        let frame = self.shared.manager.create_frame(label);
        *slot = Some(Arc::clone(&frame));
        Ok(frame)
    }

    /// The frame currently being filled.
    #[must_use]
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.shared.frames.prepare_slot().clone()
    }

    /// Prepares the frame being filled and hands it to the draw routine.
    ///
    /// Blocks until the previous frame's uploads finish before preparing,
    /// and until the previous draw finishes before the handoff.
    ///
    /// # Errors
    ///
    /// - [`RenderError::NoFrameInProgress`] without a [`begin_frame`]
    /// - [`RenderError::DrawTimeout`] if the previous draw is stuck
    /// - Any preparation error; the frame is disposed
    ///
    /// [`begin_frame`]: RenderCoordinator::begin_frame
    pub fn end_draw(&self) -> RenderResult<()> {
        self.ensure_live()?;
        let frame = self
            .shared
            .frames
            .prepare_slot()
            .clone()
            .ok_or(RenderError::NoFrameInProgress)?;

        run_handlers(&self.shared.handlers.before_prepare);

        let previous = self.in_flight.lock().clone();
        let timeout = self.shared.wait_timeout();
        if let Some(previous) = &previous {
            wait_draw(&previous.uploads_done, timeout)?;
        }

        let manager = &self.shared.manager;
        manager.reset_buffer_generators(frame.index());
        if let Err(error) = frame.prepare(manager, manager.config().prepare.threaded) {
            self.shared.frames.prepare_slot().take();
            if let Err(dispose_error) = frame.dispose(manager) {
                tracing::warn!("failed to dispose frame {}: {}", frame.index(), dispose_error);
            }
            return Err(error);
        }

        if let Some(previous) = &previous {
            // Draw failures are kept for `take_draw_error`.
            let _ = wait_draw(&previous.done, timeout)?;
        }

        self.shared.frames.swap();
        let in_flight = InFlight::new(frame.index());
        *self.in_flight.lock() = Some(in_flight.clone());
        let request = DrawRequest { frame, in_flight };

        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender.send(DrawMessage::Draw(request)).map_err(|_| {
                tracing::error!("draw thread is gone");
                RenderError::CoordinatorDisposed
            }),
            None => {
                self.shared.draw(request);
                Ok(())
            }
        }
    }

    /// Waits for the frame on the draw routine to finish.
    ///
    /// # Errors
    ///
    /// [`RenderError::DrawTimeout`] if it does not finish in time.
    pub fn wait_for_active_draws(&self) -> RenderResult<()> {
        let in_flight = self.in_flight.lock().clone();
        if let Some(in_flight) = in_flight {
            let _ = wait_draw(&in_flight.done, self.shared.wait_timeout())?;
        }
        Ok(())
    }

    /// Takes the most recent draw failure.
    pub fn take_draw_error(&self) -> Option<RenderError> {
        self.shared.last_draw_error.lock().take()
    }

    /// Statistics of the most recently issued frame.
    #[must_use]
    pub fn last_frame_stats(&self) -> FrameStats {
        *self.shared.last_frame_stats.lock()
    }

    /// Frames issued to the device.
    #[must_use]
    pub fn frames_drawn(&self) -> u64 {
        self.shared.frames_drawn.load(Ordering::Relaxed)
    }

    /// Frames prepared but not issued because the device was unavailable.
    #[must_use]
    pub fn frames_skipped(&self) -> u64 {
        self.shared.frames_skipped.load(Ordering::Relaxed)
    }

    /// Frames handed from preparation to drawing.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.shared.frames.frame_count()
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Runs `handler` on the caller's thread before the next preparation.
    pub fn queue_before_prepare(&self, handler: impl FnOnce() + Send + 'static) {
        self.shared.handlers.before_prepare.lock().push(Box::new(handler));
    }

    /// Runs `handler` on the draw routine before the next frame is issued.
    pub fn queue_before_issue(&self, handler: impl FnOnce() + Send + 'static) {
        self.shared.handlers.before_issue.lock().push(Box::new(handler));
    }

    /// Runs `handler` after the next frame is issued, before it is presented.
    pub fn queue_before_present(&self, handler: impl FnOnce() + Send + 'static) {
        self.shared.handlers.before_present.lock().push(Box::new(handler));
    }

    /// Runs `handler` after the next frame is presented.
    pub fn queue_after_present(&self, handler: impl FnOnce() + Send + 'static) {
        self.shared.handlers.after_present.lock().push(Box::new(handler));
    }

    /// Releases a device resource after the next draw, under the
    /// device-creation lock.
    pub fn dispose_resource(&self, dispose: impl FnOnce() + Send + 'static) {
        self.shared.pending_disposals.lock().push(Box::new(dispose));
    }

    // =========================================================================
    // Device loss and reset
    // =========================================================================

    /// Records that the device was lost. The next draw re-reads the device
    /// status and skips only while it still reports lost.
    pub fn on_device_lost(&self) {
        if !self.shared.device_lost.swap(true, Ordering::AcqRel) {
            tracing::warn!("graphics device reported lost");
        }
    }

    /// Takes the device-use and device-creation locks ahead of a reset.
    ///
    /// The locks stay held until [`on_device_reset`].
    ///
    /// # Errors
    ///
    /// A lock timeout if a draw or upload does not finish in time.
    ///
    /// [`on_device_reset`]: RenderCoordinator::on_device_reset
    pub fn on_device_resetting(&self) -> RenderResult<()> {
        let mut guards = self.shared.reset_guards.lock();
        if guards.is_some() {
            return Ok(());
        }
        let timeout = self.shared.wait_timeout();
        let use_guard = lock_device(&self.shared.use_lock, "device use", timeout)?;
        let create_guard = lock_device(&self.shared.create_lock, "device creation", timeout)?;
        *guards = Some((use_guard, create_guard));
        tracing::info!("device reset started");
        Ok(())
    }

    /// Forgets every device buffer, starts the settle window and releases
    /// the reset locks.
    ///
    /// # Returns
    ///
    /// `false` if no reset was in progress.
    pub fn on_device_reset(&self) -> bool {
        let Some((use_guard, create_guard)) = self.shared.reset_guards.lock().take() else {
            return false;
        };
        self.shared.manager.discard_device_buffers();
        self.shared.device_lost.store(false, Ordering::Release);
        *self.shared.last_reset.lock() = Some(Instant::now());
        drop(create_guard);
        drop(use_guard);
        tracing::info!("device reset finished");
        true
    }

    /// Resets the device between [`on_device_resetting`] and
    /// [`on_device_reset`].
    ///
    /// # Errors
    ///
    /// A lock timeout, or the device's reset error.
    ///
    /// [`on_device_resetting`]: RenderCoordinator::on_device_resetting
    /// [`on_device_reset`]: RenderCoordinator::on_device_reset
    pub fn reset_device(&self) -> RenderResult<()> {
        self.on_device_resetting()?;
        let result = self.shared.manager.device().reset();
        self.on_device_reset();
        result.map_err(Into::into)
    }

    /// Returns true while draws are skipped for a lost device.
    #[must_use]
    pub fn is_device_lost(&self) -> bool {
        self.shared.device_lost.load(Ordering::Acquire)
    }

    /// Returns true while the reset locks are held.
    #[must_use]
    pub fn is_resetting(&self) -> bool {
        self.shared.reset_guards.lock().is_some()
    }

    /// Returns true during the settle window after a reset.
    #[must_use]
    pub fn is_waiting_for_device_to_settle(&self) -> bool {
        self.shared.is_settling()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Waits for the active draw, stops the draw thread and disposes any
    /// frame still held. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(error) = self.wait_for_active_draws() {
            tracing::warn!("shutting down with a draw still active: {}", error);
        }

        if let Some(sender) = self.sender.lock().take() {
            // A closed channel means the thread is already gone.
            let _ = sender.send(DrawMessage::Shutdown);
        }
        if let Some(handle) = self.draw_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("draw thread panicked");
            }
        }

        let (prepared, drawn) = self.shared.frames.drain();
        for frame in prepared.into_iter().chain(drawn) {
            if frame.state() != crate::frame::FrameState::Disposed {
                if let Err(error) = frame.dispose(&self.shared.manager) {
                    tracing::warn!("failed to dispose frame {}: {}", frame.index(), error);
                }
            }
        }
        run_handlers(&self.shared.pending_disposals);
        tracing::info!("render coordinator stopped");
    }
}

fn wait_draw<T: Clone>(cell: &CompletionCell<T>, timeout: Duration) -> RenderResult<T> {
    cell.wait_timeout(timeout).map_err(|error| match error {
        SyncError::CompletionTimeout { waited_ms } => RenderError::DrawTimeout { waited_ms },
        other => RenderError::Sync(other),
    })
}

fn lock_device(lock: &Arc<Mutex<()>>, name: &'static str, timeout: Duration) -> RenderResult<DeviceGuard> {
    lock.try_lock_arc_for(timeout).ok_or_else(|| {
        RenderError::Sync(SyncError::LockTimeout {
            name,
            waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
    })
}

impl Drop for RenderCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RenderCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCoordinator")
            .field("frames", &self.shared.frames)
            .field("device_lost", &self.is_device_lost())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
