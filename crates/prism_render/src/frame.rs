//! # Frames
//!
//! A frame owns one render pass's batches from the moment they are added
//! until the frame is disposed.
//!
//! ```text
//! Initialized ──prepare──► Preparing ──► Prepared ──draw──► Drawing ──► Drawn
//!      │                                                                  │
//!      └────────────────────────── dispose (any state) ──────► Disposed ◄─┘
//! ```
//!
//! Preparation combines and sorts the batches once, then prepares them.
//! Drawing issues them in that order, runs queued readbacks and drains the
//! manager's deferred release queue. Disposal releases every handed-off
//! batch, detaches batches kept for reuse and returns the frame to the
//! manager's pool.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::SlabSet;

use crate::batch::{BatchContainer, BatchRef, ContainerId};
use crate::device::{DeviceError, GraphicsDevice, TextureId};
use crate::error::{RenderError, RenderResult};
use crate::manager::RenderManager;
use crate::prepare::PrepareContext;
use crate::stats::FrameStats;

/// Frame lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameState {
    /// Accepting batches.
    Initialized = 0,
    /// Combining, sorting and preparing.
    Preparing = 1,
    /// Ready to draw.
    Prepared = 2,
    /// Issuing batches.
    Drawing = 3,
    /// Issued.
    Drawn = 4,
    /// Pooled.
    Disposed = 5,
}

impl FrameState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialized,
            1 => Self::Preparing,
            2 => Self::Prepared,
            3 => Self::Drawing,
            4 => Self::Drawn,
            _ => Self::Disposed,
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Preparing => "Preparing",
            Self::Prepared => "Prepared",
            Self::Drawing => "Drawing",
            Self::Drawn => "Drawn",
            Self::Disposed => "Disposed",
        }
    }
}

/// Destination for texture contents read back after a frame is drawn.
pub type ReadbackTarget = Arc<Mutex<Vec<u8>>>;

struct ReadbackRequest {
    source: TextureId,
    size: usize,
    destination: ReadbackTarget,
}

/// One render pass's ordered collection of batches.
pub struct Frame {
    index: AtomicU64,
    state: AtomicU8,
    label: Mutex<Option<String>>,
    batches: Mutex<Vec<BatchRef>>,
    combined: Mutex<Vec<BatchRef>>,
    readbacks: Mutex<Vec<ReadbackRequest>>,
    slabs: SlabSet,
    stats: Mutex<FrameStats>,
}

impl Frame {
    /// A pooled frame, in the `Disposed` state.
    pub(crate) fn pooled() -> Self {
        Self {
            index: AtomicU64::new(0),
            state: AtomicU8::new(FrameState::Disposed as u8),
            label: Mutex::new(None),
            batches: Mutex::new(Vec::new()),
            combined: Mutex::new(Vec::new()),
            readbacks: Mutex::new(Vec::new()),
            slabs: SlabSet::new(),
            stats: Mutex::new(FrameStats::default()),
        }
    }

    /// Arms a pooled frame.
    pub(crate) fn begin(&self, index: u64, label: Option<&str>) {
        self.index.store(index, Ordering::Release);
        *self.label.lock() = label.map(str::to_owned);
        *self.stats.lock() = FrameStats::default();
        self.state.store(FrameState::Initialized as u8, Ordering::Release);
    }

    /// Frame index.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        self.label.lock().clone()
    }

    /// Sets the diagnostic label.
    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.lock() = Some(label.into());
    }

    /// Batches in issue order once prepared.
    #[must_use]
    pub fn batches(&self) -> Vec<BatchRef> {
        self.batches.lock().clone()
    }

    /// Number of batches still to issue.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Batches absorbed by combining.
    #[must_use]
    pub fn combined_count(&self) -> usize {
        self.combined.lock().len()
    }

    /// Per-frame scratch memory, reset when the frame is disposed.
    #[must_use]
    pub fn slabs(&self) -> &SlabSet {
        &self.slabs
    }

    /// Counters for this frame.
    #[must_use]
    pub fn stats(&self) -> FrameStats {
        *self.stats.lock()
    }

    fn transition(&self, from: FrameState, to: FrameState, expected: &'static str) -> RenderResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| RenderError::InvalidFrameState {
                frame: self.index(),
                expected,
                actual: FrameState::from_u8(actual).name(),
            })
    }

    /// Queues a copy of `source` into `destination`, run after the frame's
    /// batches are issued.
    ///
    /// # Errors
    ///
    /// - [`RenderError::Device`] if the texture is unknown
    /// - [`RenderError::ReadbackTooSmall`] if `destination` cannot hold it
    /// - [`RenderError::InvalidFrameState`] once drawing has started
    pub fn request_readback(
        &self,
        device: &dyn GraphicsDevice,
        source: TextureId,
        destination: ReadbackTarget,
    ) -> RenderResult<()> {
        let size = device
            .texture_size(source)
            .ok_or(DeviceError::UnknownTexture(source))?;
        let actual = destination.lock().len();
        if actual < size {
            return Err(RenderError::ReadbackTooSmall {
                required: size,
                actual,
            });
        }
        match self.state() {
            FrameState::Drawing | FrameState::Drawn | FrameState::Disposed => {
                return Err(RenderError::InvalidFrameState {
                    frame: self.index(),
                    expected: "Initialized, Preparing or Prepared",
                    actual: self.state().name(),
                });
            }
            _ => {}
        }
        self.readbacks.lock().push(ReadbackRequest {
            source,
            size,
            destination,
        });
        Ok(())
    }

    /// Combines, sorts and prepares the frame's batches.
    ///
    /// Holds the manager's global preparation lock for the duration. A failed
    /// preparation leaves the frame in `Preparing`; it can only be disposed.
    ///
    /// # Errors
    ///
    /// - [`RenderError::InvalidFrameState`] unless `Initialized`
    /// - A lock timeout if another preparation is still running
    /// - The first batch preparation error
    pub fn prepare(&self, manager: &RenderManager, parallel: bool) -> RenderResult<()> {
        let _prepare = manager.preparer().lock_for_prepare()?;
        self.transition(FrameState::Initialized, FrameState::Preparing, "Initialized")?;

        let mut batches = std::mem::take(&mut *self.batches.lock());
        let added = batches.len();
        let absorbed = {
            let mut combined = self.combined.lock();
            manager.combine(&mut batches, &mut combined)
        };

        let ctx = PrepareContext::new(manager, parallel && manager.config().prepare.threaded);
        let result = manager.preparer().prepare_many(&batches, &ctx);
        let prepared = batches.len();
        *self.batches.lock() = batches;
        result?;

        {
            let mut stats = self.stats.lock();
            stats.batches = added as u32;
            stats.combined = absorbed as u32;
            stats.prepared = prepared as u32;
        }
        self.state.store(FrameState::Prepared as u8, Ordering::Release);
        tracing::debug!(
            "frame {} prepared: {} batches ({} combined)",
            self.index(),
            prepared,
            absorbed
        );
        Ok(())
    }

    /// Issues every batch in sorted order, then runs readbacks and the
    /// manager's deferred releases.
    ///
    /// Issuance stops at the first failing batch. The frame reaches `Drawn`
    /// either way.
    ///
    /// # Errors
    ///
    /// - [`RenderError::InvalidFrameState`] unless `Prepared`
    /// - [`RenderError::IssueFailed`] naming the failing batch
    pub fn draw(&self, manager: &RenderManager, device: &dyn GraphicsDevice) -> RenderResult<FrameStats> {
        self.transition(FrameState::Prepared, FrameState::Drawing, "Prepared")?;

        let mut issued = 0_u32;
        let mut draw_calls = 0_u32;
        let mut failure = None;
        {
            let batches = self.batches.lock();
            for batch in batches.iter() {
                match batch.issue(device) {
                    Ok(calls) => {
                        issued += 1;
                        draw_calls += calls;
                    }
                    Err(error) => {
                        failure = Some(error.issue_failed(batch.to_string()));
                        break;
                    }
                }
            }
        }

        if failure.is_none() {
            failure = self.run_readbacks(device).err();
        }
        manager.drain_release_queue();

        let stats = {
            let mut stats = self.stats.lock();
            stats.issued = issued;
            stats.draw_calls = draw_calls;
            *stats
        };
        self.state.store(FrameState::Drawn as u8, Ordering::Release);
        tracing::debug!(
            "frame {} drawn: {} batches, {} draw calls",
            self.index(),
            issued,
            draw_calls
        );

        match failure {
            Some(error) => Err(error),
            None => Ok(stats),
        }
    }

    fn run_readbacks(&self, device: &dyn GraphicsDevice) -> RenderResult<()> {
        for request in std::mem::take(&mut *self.readbacks.lock()) {
            let mut destination = request.destination.lock();
            if destination.len() < request.size {
                return Err(RenderError::ReadbackTooSmall {
                    required: request.size,
                    actual: destination.len(),
                });
            }
            device.read_texture(request.source, &mut destination[..request.size])?;
        }
        Ok(())
    }

    /// Releases or detaches every batch and returns the frame to the
    /// manager's pool.
    ///
    /// Release failures are logged; disposal always completes.
    ///
    /// # Errors
    ///
    /// [`RenderError::InvalidFrameState`] if the frame is already disposed.
    pub fn dispose(self: &Arc<Self>, manager: &RenderManager) -> RenderResult<()> {
        let previous = self.state.swap(FrameState::Disposed as u8, Ordering::AcqRel);
        if previous == FrameState::Disposed as u8 {
            return Err(RenderError::InvalidFrameState {
                frame: self.index(),
                expected: "not Disposed",
                actual: FrameState::Disposed.name(),
            });
        }

        let batches = std::mem::take(&mut *self.batches.lock());
        let combined = std::mem::take(&mut *self.combined.lock());
        for batch in batches.iter().chain(combined.iter()) {
            if let Err(error) = batch.release_or_detach() {
                tracing::warn!("frame {}: failed to release {}: {}", self.index(), batch, error);
            }
        }
        self.readbacks.lock().clear();
        self.slabs.reset();
        *self.label.lock() = None;

        manager.release_frame(Arc::clone(self));
        Ok(())
    }
}

impl BatchContainer for Frame {
    fn container_id(&self) -> ContainerId {
        ContainerId::Frame(self.index())
    }

    fn add(&self, batch: &BatchRef) -> RenderResult<()> {
        let reject = |actual: FrameState| RenderError::InvalidFrameState {
            frame: self.index(),
            expected: "Initialized",
            actual: actual.name(),
        };
        let state = self.state();
        if state != FrameState::Initialized {
            return Err(reject(state));
        }

        let mut batches = self.batches.lock();
        let state = self.state();
        if state != FrameState::Initialized {
            return Err(reject(state));
        }
        batch.attach_to(self.container_id())?;
        batches.push(Arc::clone(batch));
        Ok(())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index())
            .field("state", &self.state())
            .field("label", &self.label())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchKind, BatchPhase};
    use crate::config::RenderConfig;
    use crate::device::{HeadlessDevice, ScissorRect};

    fn setup() -> (Arc<HeadlessDevice>, Arc<RenderManager>) {
        let device = Arc::new(HeadlessDevice::new());
        let manager = RenderManager::new(RenderConfig::single_threaded(), device.clone()).unwrap();
        (device, manager)
    }

    fn scissor(manager: &RenderManager, frame: &Frame, layer: i32) -> BatchRef {
        let rect = ScissorRect {
            x: layer,
            y: 0,
            width: 1,
            height: 1,
        };
        let batch = manager.new_scissor(Some(frame), layer, Some(rect)).unwrap();
        batch.dispose().unwrap();
        batch
    }

    #[test]
    fn test_prepare_sorts_by_layer_then_creation() {
        let (_, manager) = setup();
        let frame = manager.create_frame(None);
        let a = scissor(&manager, &frame, 3);
        let b = scissor(&manager, &frame, 1);
        let c = scissor(&manager, &frame, 2);
        let d = scissor(&manager, &frame, 1);

        frame.prepare(&manager, false).unwrap();

        let order: Vec<_> = frame.batches().iter().map(|x| x.creation_index()).collect();
        let expected: Vec<_> = [&b, &d, &c, &a].iter().map(|x| x.creation_index()).collect();
        assert_eq!(order, expected);
        assert_eq!(frame.state(), FrameState::Prepared);
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let (device, manager) = setup();
        let frame = manager.create_frame(None);

        assert!(matches!(
            frame.draw(&manager, &*device),
            Err(RenderError::InvalidFrameState { expected: "Prepared", .. })
        ));
        frame.prepare(&manager, false).unwrap();
        assert!(matches!(
            frame.prepare(&manager, false),
            Err(RenderError::InvalidFrameState { expected: "Initialized", .. })
        ));

        let late = manager.allocate_batch(BatchKind::Scissor);
        late.initialize(None, 0, None).unwrap();
        assert!(matches!(
            frame.add(&late),
            Err(RenderError::InvalidFrameState { actual: "Prepared", .. })
        ));
    }

    #[test]
    fn test_draw_issues_and_dispose_releases() {
        let (device, manager) = setup();
        let frame = manager.create_frame(Some("main"));
        let batch = scissor(&manager, &frame, 0);

        frame.prepare(&manager, false).unwrap();
        manager.flush_buffer_generators().unwrap();
        let stats = frame.draw(&manager, &*device).unwrap();

        assert_eq!(stats.issued, 1);
        assert_eq!(batch.phase(), BatchPhase::Issued);
        assert_eq!(batch.times_issued(), 1);

        frame.dispose(&manager).unwrap();
        assert!(batch.is_released());
        assert_eq!(frame.state(), FrameState::Disposed);
        assert!(matches!(
            frame.dispose(&manager),
            Err(RenderError::InvalidFrameState { .. })
        ));
    }

    #[test]
    fn test_dispose_detaches_batches_kept_for_reuse() {
        let (_, manager) = setup();
        let frame = manager.create_frame(None);
        let kept = manager.new_scissor(Some(&*frame), 0, None).unwrap();

        frame.dispose(&manager).unwrap();

        assert!(!kept.is_released());
        assert_eq!(kept.container(), None);

        let next = manager.create_frame(None);
        kept.reuse(Some(&*next), None).unwrap();
        assert_eq!(kept.container(), Some(ContainerId::Frame(next.index())));
    }

    #[test]
    fn test_batch_cannot_join_two_frames() {
        let (_, manager) = setup();
        let first = manager.create_frame(None);
        let second = manager.create_frame(None);
        let batch = scissor(&manager, &first, 0);

        assert!(matches!(
            second.add(&batch),
            Err(RenderError::AlreadyContained { .. })
        ));
    }

    #[test]
    fn test_readback_runs_after_issue() {
        let (device, manager) = setup();
        device.add_texture(TextureId(9), vec![1, 2, 3, 4]);
        let frame = manager.create_frame(None);
        let target: ReadbackTarget = Arc::new(Mutex::new(vec![0; 4]));

        assert!(matches!(
            frame.request_readback(&*device, TextureId(9), Arc::new(Mutex::new(vec![0; 2]))),
            Err(RenderError::ReadbackTooSmall { required: 4, actual: 2 })
        ));
        assert!(matches!(
            frame.request_readback(&*device, TextureId(1), Arc::clone(&target)),
            Err(RenderError::Device(DeviceError::UnknownTexture(_)))
        ));
        frame
            .request_readback(&*device, TextureId(9), Arc::clone(&target))
            .unwrap();

        frame.prepare(&manager, false).unwrap();
        frame.draw(&manager, &*device).unwrap();
        assert_eq!(*target.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_slabs_reset_on_dispose() {
        let (_, manager) = setup();
        let frame = manager.create_frame(None);
        let span = frame.slabs().allocate(&[1_u32, 2, 3]);
        assert_eq!(frame.slabs().with(span, |s| s.to_vec()), Some(vec![1, 2, 3]));

        let epoch = frame.slabs().epoch();
        frame.dispose(&manager).unwrap();
        assert!(frame.slabs().epoch() > epoch);
    }
}
