//! # Batches
//!
//! A batch is one deferred unit of draw work. Every kind shares a single
//! state machine; what a batch draws lives in a closed payload variant.
//!
//! ## Lifecycle
//!
//! ```text
//!            initialize            prepare               issue
//! Uninitialized ───► Initialized ───► PrepareQueued ───► Prepared ───► Issued
//!      ▲                  ▲                                              │
//!      │                  └───────────────── reuse ──────────────────────┘
//!      └──── release_resources (after dispose, once the frame drains)
//! ```
//!
//! `Combined` and `Released` are orthogonal flags. A combined batch is
//! skipped at issue; a released batch rejects everything except
//! `initialize`.
//!
//! ## Lock Order
//!
//! `core` before `suspend`. A group's `core` before its children's.

mod payload;
mod pool;

pub use payload::{IssueCallback, QuadItem, Vertex, QUAD_INDICES, QUAD_VERTICES};
pub use pool::BatchPool;

pub(crate) use pool::PayloadLists;

use payload::{BatchPayload, GeometryPayload};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use prism_core::CompletionCell;

use crate::device::{ClearRequest, GraphicsDevice, MaterialId, RenderStates, ScissorRect};
use crate::error::{RenderError, RenderResult};
use crate::prepare::PrepareContext;

/// Shared handle to a pooled batch.
pub type BatchRef = Arc<Batch>;

/// The closed set of batch kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchKind {
    /// Clears color, depth and/or stencil.
    Clear,
    /// Sets or resets the scissor rectangle.
    Scissor,
    /// Textured quads uploaded through the buffer generator.
    Geometry,
    /// Nested container of child batches.
    Group,
}

impl BatchKind {
    /// Every kind, in type-tag order.
    pub const ALL: [Self; 4] = [Self::Clear, Self::Scissor, Self::Geometry, Self::Group];

    /// Stable numeric type tag.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::Scissor => "Scissor",
            Self::Geometry => "Geometry",
            Self::Group => "Group",
        }
    }
}

/// Batch lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchPhase {
    /// Pooled or never initialized.
    Uninitialized,
    /// Accepting draw data.
    Initialized,
    /// Preparation has started.
    PrepareQueued,
    /// Ready to issue.
    Prepared,
    /// Issued this frame.
    Issued,
}

impl BatchPhase {
    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initialized => "Initialized",
            Self::PrepareQueued => "PrepareQueued",
            Self::Prepared => "Prepared",
            Self::Issued => "Issued",
        }
    }
}

/// Identifies the frame or group that owns a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerId {
    /// A frame, by frame index.
    Frame(u64),
    /// A group batch, by creation index.
    Group(u64),
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(index) => write!(f, "frame {index}"),
            Self::Group(index) => write!(f, "group #{index}"),
        }
    }
}

/// Issue order: layer, then material, then creation index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SortKey {
    /// Layer.
    pub layer: i32,
    /// Material; `None` sorts first.
    pub material: Option<MaterialId>,
    /// Creation index.
    pub creation_index: u64,
}

/// Observable batch state, excluding the creation index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchSnapshot {
    /// Kind.
    pub kind: BatchKind,
    /// Lifecycle state.
    pub phase: BatchPhase,
    /// Merged into a sibling.
    pub combined: bool,
    /// Returned to its pool.
    pub released: bool,
    /// Handed off by its producer.
    pub release_after_draw: bool,
    /// Waiting on its producer.
    pub suspended: bool,
    /// Layer.
    pub layer: i32,
    /// Material.
    pub material: Option<MaterialId>,
    /// Owner.
    pub container: Option<ContainerId>,
    /// Creation index of the batch this one was merged into.
    pub combined_into: Option<u64>,
    /// Diagnostic name.
    pub name: Option<String>,
    /// Times issued since initialization.
    pub times_issued: u64,
    /// Draw items carried.
    pub item_count: usize,
    /// Holds prepared device geometry.
    pub has_prepared_geometry: bool,
}

/// Anything batches can be added to.
pub trait BatchContainer {
    /// Identity recorded on added batches.
    fn container_id(&self) -> ContainerId;

    /// Takes ownership of an initialized batch.
    ///
    /// # Errors
    ///
    /// Fails if the container no longer accepts batches, or if the batch is
    /// released, combined, uninitialized or already owned.
    fn add(&self, batch: &BatchRef) -> RenderResult<()>;
}

struct BatchCore {
    phase: BatchPhase,
    combined: bool,
    released: bool,
    release_after_draw: bool,
    layer: i32,
    material: Option<MaterialId>,
    container: Option<ContainerId>,
    combined_into: Option<u64>,
    name: Option<String>,
    times_issued: u64,
    payload: BatchPayload,
}

impl BatchCore {
    fn pooled(kind: BatchKind) -> Self {
        Self {
            phase: BatchPhase::Uninitialized,
            combined: false,
            released: true,
            release_after_draw: false,
            layer: 0,
            material: None,
            container: None,
            combined_into: None,
            name: None,
            times_issued: 0,
            payload: BatchPayload::empty(kind),
        }
    }
}

/// A deferred unit of draw work.
///
/// Batches come out of a [`BatchPool`] via the render manager and go back to
/// it through [`Batch::release_resources`]. Identity (equality and hashing)
/// is the creation index.
pub struct Batch {
    kind: BatchKind,
    creation_index: AtomicU64,
    sequence: Arc<AtomicU64>,
    core: Mutex<BatchCore>,
    suspend: Mutex<Option<Arc<CompletionCell<()>>>>,
    pool: Weak<BatchPool>,
}

impl Batch {
    pub(crate) fn new_pooled(kind: BatchKind, sequence: Arc<AtomicU64>, pool: Weak<BatchPool>) -> Self {
        Self {
            kind,
            creation_index: AtomicU64::new(0),
            sequence,
            core: Mutex::new(BatchCore::pooled(kind)),
            suspend: Mutex::new(None),
            pool,
        }
    }

    /// Kind of work this batch carries.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Creation index assigned by the last `initialize`.
    #[inline]
    #[must_use]
    pub fn creation_index(&self) -> u64 {
        self.creation_index.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn phase(&self) -> BatchPhase {
        self.core.lock().phase
    }

    /// Returns true if the batch was merged into a sibling.
    #[must_use]
    pub fn is_combined(&self) -> bool {
        self.core.lock().combined
    }

    /// Returns true if the batch is pooled.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.core.lock().released
    }

    /// Returns true once the producer has handed the batch off.
    #[must_use]
    pub fn is_release_after_draw(&self) -> bool {
        self.core.lock().release_after_draw
    }

    /// Returns true while preparation would wait on the producer.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspend
            .lock()
            .as_ref()
            .is_some_and(|cell| !cell.is_complete())
    }

    /// Layer.
    #[must_use]
    pub fn layer(&self) -> i32 {
        self.core.lock().layer
    }

    /// Material.
    #[must_use]
    pub fn material(&self) -> Option<MaterialId> {
        self.core.lock().material
    }

    /// Issue-order key.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        let core = self.core.lock();
        SortKey {
            layer: core.layer,
            material: core.material,
            creation_index: self.creation_index(),
        }
    }

    /// Current owner.
    #[must_use]
    pub fn container(&self) -> Option<ContainerId> {
        self.core.lock().container
    }

    /// Creation index of the batch this one was merged into.
    #[must_use]
    pub fn combined_into(&self) -> Option<u64> {
        self.core.lock().combined_into
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.core.lock().name.clone()
    }

    /// Sets the diagnostic name shown in errors and logs.
    pub fn set_name(&self, name: impl Into<String>) {
        self.core.lock().name = Some(name.into());
    }

    /// Times issued since the last `initialize`.
    #[must_use]
    pub fn times_issued(&self) -> u64 {
        self.core.lock().times_issued
    }

    /// Draw items carried: quads for geometry, children for groups.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.core.lock().payload.item_count()
    }

    /// Fixed-function state of a geometry batch.
    #[must_use]
    pub fn render_states(&self) -> Option<RenderStates> {
        match &self.core.lock().payload {
            BatchPayload::Geometry(geometry) => Some(geometry.states),
            _ => None,
        }
    }

    /// Copy of a geometry batch's quads.
    #[must_use]
    pub fn quads(&self) -> Vec<QuadItem> {
        match &self.core.lock().payload {
            BatchPayload::Geometry(geometry) => geometry.items.clone(),
            _ => Vec::new(),
        }
    }

    /// Children of a group batch, in issue order once prepared.
    #[must_use]
    pub fn children(&self) -> Vec<BatchRef> {
        match &self.core.lock().payload {
            BatchPayload::Group(group) => group.children.clone(),
            _ => Vec::new(),
        }
    }

    /// Captures the observable state.
    #[must_use]
    pub fn snapshot(&self) -> BatchSnapshot {
        let core = self.core.lock();
        let has_prepared_geometry = matches!(
            &core.payload,
            BatchPayload::Geometry(GeometryPayload { prepared: Some(_), .. })
        );
        BatchSnapshot {
            kind: self.kind,
            phase: core.phase,
            combined: core.combined,
            released: core.released,
            release_after_draw: core.release_after_draw,
            suspended: self.is_suspended(),
            layer: core.layer,
            material: core.material,
            container: core.container,
            combined_into: core.combined_into,
            name: core.name.clone(),
            times_issued: core.times_issued,
            item_count: core.payload.item_count(),
            has_prepared_geometry,
        }
    }

    fn invalid_state(&self, core: &BatchCore, expected: &'static str) -> RenderError {
        RenderError::InvalidBatchState {
            batch: describe(self, core),
            expected,
            actual: core.phase.name().to_owned(),
        }
    }

    /// Arms a pooled batch for a new frame.
    ///
    /// Assigns a fresh creation index and, if given, adds the batch to
    /// `container`.
    ///
    /// # Errors
    ///
    /// - [`RenderError::InvalidBatchState`] unless the batch is uninitialized
    /// - Any error from `container.add`
    pub fn initialize(
        self: &Arc<Self>,
        container: Option<&dyn BatchContainer>,
        layer: i32,
        material: Option<MaterialId>,
    ) -> RenderResult<()> {
        {
            let mut core = self.core.lock();
            if core.phase != BatchPhase::Uninitialized {
                return Err(self.invalid_state(&core, "Uninitialized"));
            }
            let index = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
            self.creation_index.store(index, Ordering::Release);
            core.phase = BatchPhase::Initialized;
            core.combined = false;
            core.released = false;
            core.release_after_draw = false;
            core.layer = layer;
            core.material = material;
            core.container = None;
            core.combined_into = None;
            core.times_issued = 0;
            core.payload.clear_prepared();
        }
        *self.suspend.lock() = None;

        match container {
            Some(container) => container.add(self),
            None => Ok(()),
        }
    }

    /// Re-arms a drawn batch that was kept for reuse.
    ///
    /// Draw data is kept; prepared geometry is dropped so the batch is
    /// prepared again.
    ///
    /// # Errors
    ///
    /// - [`RenderError::BatchReleased`] / [`RenderError::BatchCombined`]
    /// - [`RenderError::InvalidBatchState`] if the batch was never
    ///   initialized, is mid-preparation or was handed off with `dispose`
    pub fn reuse(
        self: &Arc<Self>,
        container: Option<&dyn BatchContainer>,
        layer: Option<i32>,
    ) -> RenderResult<()> {
        {
            let mut core = self.core.lock();
            if core.released {
                return Err(RenderError::BatchReleased(describe(self, &core)));
            }
            if core.combined {
                return Err(RenderError::BatchCombined(describe(self, &core)));
            }
            match core.phase {
                BatchPhase::Uninitialized | BatchPhase::PrepareQueued => {
                    return Err(self.invalid_state(&core, "Initialized, Prepared or Issued"));
                }
                _ => {}
            }
            if core.release_after_draw {
                return Err(RenderError::InvalidBatchState {
                    batch: describe(self, &core),
                    expected: "kept for reuse",
                    actual: "handed off".to_owned(),
                });
            }
            core.phase = BatchPhase::Initialized;
            if let Some(layer) = layer {
                core.layer = layer;
            }
            core.payload.clear_prepared();
        }

        match container {
            Some(container) => container.add(self),
            None => Ok(()),
        }
    }

    /// Defers preparation until the producer calls [`dispose`] or
    /// [`resume`].
    ///
    /// [`dispose`]: Batch::dispose
    /// [`resume`]: Batch::resume
    ///
    /// # Errors
    ///
    /// - [`RenderError::AlreadySuspended`] on a second call
    /// - [`RenderError::BatchReleased`] if the batch is pooled
    /// - [`RenderError::InvalidBatchState`] if preparation already ran
    pub fn suspend(&self) -> RenderResult<()> {
        let core = self.core.lock();
        if core.released {
            return Err(RenderError::BatchReleased(describe(self, &core)));
        }
        if core.phase != BatchPhase::Initialized {
            return Err(self.invalid_state(&core, "Initialized"));
        }
        let mut suspend = self.suspend.lock();
        if suspend.is_some() {
            return Err(RenderError::AlreadySuspended(describe(self, &core)));
        }
        *suspend = Some(Arc::new(CompletionCell::new()));
        Ok(())
    }

    /// Lets a suspended batch be prepared without handing it off.
    ///
    /// # Returns
    ///
    /// `true` if a pending suspension was completed.
    pub fn resume(&self) -> bool {
        self.suspend
            .lock()
            .as_ref()
            .is_some_and(|cell| cell.complete(()))
    }

    /// Hands the batch off: it is released after the frame that owns it has
    /// drawn. Completes any pending suspension.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::BatchReleased`] if the batch is pooled.
    pub fn dispose(&self) -> RenderResult<()> {
        {
            let mut core = self.core.lock();
            if core.released {
                return Err(RenderError::BatchReleased(describe(self, &core)));
            }
            core.release_after_draw = true;
        }
        self.resume();
        Ok(())
    }

    /// Returns true if combining may merge into or out of this batch.
    #[must_use]
    pub fn is_combinable(&self) -> bool {
        let core = self.core.lock();
        core.release_after_draw
            && core.phase == BatchPhase::Initialized
            && !core.combined
            && !core.released
            && !self.is_suspended()
    }

    fn editable(&self, core: &BatchCore, operation: &'static str, kind: BatchKind) -> RenderResult<()> {
        if self.kind != kind {
            return Err(RenderError::UnsupportedOperation {
                batch: describe(self, core),
                operation,
            });
        }
        if core.released {
            return Err(RenderError::BatchReleased(describe(self, core)));
        }
        if core.combined {
            return Err(RenderError::BatchCombined(describe(self, core)));
        }
        match core.phase {
            BatchPhase::Initialized | BatchPhase::PrepareQueued => Ok(()),
            _ => Err(self.invalid_state(core, "Initialized or PrepareQueued")),
        }
    }

    /// Sets what a clear batch clears.
    ///
    /// # Errors
    ///
    /// [`RenderError::EmptyClear`] if `request` clears nothing, or any
    /// state error.
    pub fn set_clear(&self, request: ClearRequest) -> RenderResult<()> {
        let mut core = self.core.lock();
        self.editable(&core, "set_clear", BatchKind::Clear)?;
        if request.is_empty() {
            return Err(RenderError::EmptyClear);
        }
        core.payload = BatchPayload::Clear(request);
        Ok(())
    }

    /// Sets the rectangle a scissor batch applies; `None` resets it.
    ///
    /// # Errors
    ///
    /// Fails on a non-scissor batch or from the wrong state.
    pub fn set_scissor(&self, rect: Option<ScissorRect>) -> RenderResult<()> {
        let mut core = self.core.lock();
        self.editable(&core, "set_scissor", BatchKind::Scissor)?;
        core.payload = BatchPayload::Scissor(rect);
        Ok(())
    }

    /// Sets a geometry batch's fixed-function state.
    ///
    /// # Errors
    ///
    /// Fails on a non-geometry batch or from the wrong state.
    pub fn set_render_states(&self, states: RenderStates) -> RenderResult<()> {
        let mut core = self.core.lock();
        self.editable(&core, "set_render_states", BatchKind::Geometry)?;
        if let BatchPayload::Geometry(geometry) = &mut core.payload {
            geometry.states = states;
        }
        Ok(())
    }

    /// Appends a quad.
    ///
    /// # Errors
    ///
    /// Fails on a non-geometry batch or from the wrong state.
    pub fn add_quad(&self, quad: QuadItem) -> RenderResult<()> {
        self.add_quads(std::iter::once(quad))
    }

    /// Appends quads. Allowed while a suspended batch waits in preparation.
    ///
    /// # Errors
    ///
    /// Fails on a non-geometry batch or from the wrong state.
    pub fn add_quads(&self, quads: impl IntoIterator<Item = QuadItem>) -> RenderResult<()> {
        let mut core = self.core.lock();
        self.editable(&core, "add_quads", BatchKind::Geometry)?;
        if let BatchPayload::Geometry(geometry) = &mut core.payload {
            geometry.items.extend(quads);
        }
        Ok(())
    }

    /// Sets device work run before and after a group's children.
    ///
    /// # Errors
    ///
    /// Fails on a non-group batch or from the wrong state.
    pub fn set_group_callbacks(
        &self,
        before: Option<IssueCallback>,
        after: Option<IssueCallback>,
    ) -> RenderResult<()> {
        let mut core = self.core.lock();
        self.editable(&core, "set_group_callbacks", BatchKind::Group)?;
        if let BatchPayload::Group(group) = &mut core.payload {
            group.before = before;
            group.after = after;
        }
        Ok(())
    }

    /// Records `container` as the owner.
    pub(crate) fn attach_to(&self, container: ContainerId) -> RenderResult<()> {
        let mut core = self.core.lock();
        if core.released {
            return Err(RenderError::BatchReleased(describe(self, &core)));
        }
        if core.combined {
            return Err(RenderError::BatchCombined(describe(self, &core)));
        }
        if core.phase == BatchPhase::Uninitialized {
            return Err(self.invalid_state(&core, "Initialized"));
        }
        if let Some(current) = core.container {
            return Err(RenderError::AlreadyContained {
                batch: describe(self, &core),
                container: current.to_string(),
            });
        }
        core.container = Some(container);
        Ok(())
    }

    /// Gives pooled list storage to a batch leaving its pool.
    pub(crate) fn attach_lists(&self, lists: &PayloadLists) {
        let mut core = self.core.lock();
        match &mut core.payload {
            BatchPayload::Geometry(geometry) if geometry.items.capacity() == 0 => {
                geometry.items = lists.quads.allocate(None);
            }
            BatchPayload::Group(group) if group.children.capacity() == 0 => {
                group.children = lists.children.allocate(None);
            }
            _ => {}
        }
    }

    /// Merges `other`'s draw data into this batch and marks it combined.
    pub(crate) fn absorb(&self, other: &Batch) -> RenderResult<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        // Lower creation index first; combining never runs on two threads
        // over the same pair, but the order keeps it deadlock free if it did.
        let self_first = self.creation_index() < other.creation_index();
        let (mut target, mut source) = if self_first {
            let target = self.core.lock();
            (target, other.core.lock())
        } else {
            let source = other.core.lock();
            (self.core.lock(), source)
        };

        match (&mut target.payload, &mut source.payload) {
            (BatchPayload::Geometry(into), BatchPayload::Geometry(from)) => {
                into.items.append(&mut from.items);
                from.prepared = None;
                from.runs.clear();
            }
            _ => {
                return Err(RenderError::UnsupportedOperation {
                    batch: describe(other, &source),
                    operation: "combine",
                });
            }
        }
        source.combined = true;
        source.combined_into = Some(self.creation_index());
        Ok(())
    }

    /// Runs the preparation phase.
    ///
    /// Combined batches are skipped; a batch already queued or prepared is
    /// left alone. A suspended batch is waited on for at most the configured
    /// suspend timeout.
    ///
    /// # Errors
    ///
    /// - [`RenderError::BatchReleased`] or [`RenderError::InvalidBatchState`]
    /// - [`RenderError::SuspendTimeout`] if the producer never resumed
    /// - Any payload failure. The batch returns to `Initialized` so it can
    ///   still be released.
    pub(crate) fn prepare(self: &Arc<Self>, ctx: &PrepareContext<'_>) -> RenderResult<()> {
        {
            let mut core = self.core.lock();
            if core.released {
                return Err(RenderError::BatchReleased(describe(self, &core)));
            }
            if core.combined {
                return Ok(());
            }
            match core.phase {
                BatchPhase::Uninitialized => return Err(self.invalid_state(&core, "Initialized")),
                BatchPhase::PrepareQueued | BatchPhase::Prepared | BatchPhase::Issued => {
                    return Ok(())
                }
                BatchPhase::Initialized => core.phase = BatchPhase::PrepareQueued,
            }
        }

        let pending = self.suspend.lock().clone();
        if let Some(cell) = pending {
            let timeout = ctx.suspend_timeout();
            if cell.wait_timeout(timeout).is_err() {
                let mut core = self.core.lock();
                core.phase = BatchPhase::Initialized;
                return Err(RenderError::SuspendTimeout {
                    batch: describe(self, &core),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }

        let result = self.prepare_payload(ctx);
        let mut core = self.core.lock();
        match result {
            Ok(()) => {
                core.phase = BatchPhase::Prepared;
                drop(core);
                *self.suspend.lock() = None;
                Ok(())
            }
            Err(error) => {
                core.phase = BatchPhase::Initialized;
                Err(error)
            }
        }
    }

    fn prepare_payload(&self, ctx: &PrepareContext<'_>) -> RenderResult<()> {
        if self.kind != BatchKind::Group {
            let mut core = self.core.lock();
            if let BatchPayload::Geometry(geometry) = &mut core.payload {
                geometry.prepare(&ctx.manager().vertex_generator())?;
            }
            return Ok(());
        }

        let (mut children, mut combined) = {
            let mut core = self.core.lock();
            match &mut core.payload {
                BatchPayload::Group(group) => (
                    std::mem::take(&mut group.children),
                    std::mem::take(&mut group.combined),
                ),
                _ => return Ok(()),
            }
        };

        ctx.manager().combine(&mut children, &mut combined);
        let result = ctx.manager().preparer().prepare_many(&children, &ctx.nested());

        let mut core = self.core.lock();
        if let BatchPayload::Group(group) = &mut core.payload {
            group.children = children;
            group.combined = combined;
        }
        result
    }

    /// Sends the prepared work to the device.
    ///
    /// # Returns
    ///
    /// Number of indexed draw calls issued. Combined batches issue nothing.
    ///
    /// # Errors
    ///
    /// - [`RenderError::BatchReleased`] if pooled
    /// - [`RenderError::InvalidBatchState`] unless prepared this frame
    /// - Any device failure
    pub(crate) fn issue(&self, device: &dyn GraphicsDevice) -> RenderResult<u32> {
        let mut core = self.core.lock();
        if core.released {
            return Err(RenderError::BatchReleased(describe(self, &core)));
        }
        if core.combined {
            return Ok(0);
        }
        if core.phase != BatchPhase::Prepared {
            return Err(self.invalid_state(&core, "Prepared"));
        }

        let draws = match &core.payload {
            BatchPayload::Clear(request) => {
                device.clear(request)?;
                0
            }
            BatchPayload::Scissor(rect) => {
                device.set_scissor(*rect)?;
                0
            }
            BatchPayload::Geometry(geometry) => {
                geometry.issue(device, core.material, || describe(self, &core))?
            }
            BatchPayload::Group(group) => {
                let before = group.before.clone();
                let after = group.after.clone();
                let children = group.children.clone();
                drop(core);

                if let Some(before) = before {
                    before(device)?;
                }
                let mut draws = 0;
                for child in &children {
                    draws += child
                        .issue(device)
                        .map_err(|e| e.issue_failed(child.to_string()))?;
                }
                if let Some(after) = after {
                    after(device)?;
                }

                core = self.core.lock();
                draws
            }
        };

        core.phase = BatchPhase::Issued;
        core.times_issued += 1;
        Ok(draws)
    }

    /// Returns a handed-off batch to its pool.
    ///
    /// Pooled lists go back to the list pools and a group releases its
    /// children. Back-references are cleared.
    ///
    /// # Returns
    ///
    /// `false` if the batch was not handed off with `dispose` and was left
    /// alone.
    ///
    /// # Errors
    ///
    /// - [`RenderError::BatchReleased`] on a second release
    /// - [`RenderError::InvalidBatchState`] if never initialized or
    ///   mid-preparation
    pub fn release_resources(self: &Arc<Self>) -> RenderResult<bool> {
        let mut core = self.core.lock();
        if core.released {
            return Err(RenderError::BatchReleased(describe(self, &core)));
        }
        match core.phase {
            BatchPhase::Uninitialized | BatchPhase::PrepareQueued => {
                return Err(self.invalid_state(&core, "Initialized, Prepared or Issued"));
            }
            _ => {}
        }
        if !core.release_after_draw {
            return Ok(false);
        }

        let payload = std::mem::replace(&mut *core, BatchCore::pooled(self.kind)).payload;
        drop(core);
        *self.suspend.lock() = None;

        let pool = self.pool.upgrade();
        match payload {
            BatchPayload::Geometry(geometry) => {
                if let Some(pool) = &pool {
                    pool.lists().quads.release(geometry.items);
                }
            }
            BatchPayload::Group(mut group) => {
                for child in group.children.drain(..).chain(group.combined.drain(..)) {
                    if let Err(error) = child.release_or_detach() {
                        tracing::warn!("failed to release child {}: {}", child, error);
                    }
                }
                if let Some(pool) = &pool {
                    pool.lists().children.release(group.children);
                    pool.lists().children.release(group.combined);
                }
            }
            BatchPayload::Clear(_) | BatchPayload::Scissor(_) => {}
        }
        self.attach_pooled_lists();

        if let Some(pool) = pool {
            pool.recycle(Arc::clone(self));
        }
        Ok(true)
    }

    fn attach_pooled_lists(&self) {
        if let Some(pool) = self.pool.upgrade() {
            self.attach_lists(pool.lists());
        }
    }

    /// Releases a handed-off batch, or detaches one kept for reuse from its
    /// container.
    pub(crate) fn release_or_detach(self: &Arc<Self>) -> RenderResult<()> {
        if self.release_resources()? {
            return Ok(());
        }
        self.core.lock().container = None;
        Ok(())
    }
}

fn describe(batch: &Batch, core: &BatchCore) -> String {
    let mut text = format!("{}#{}", batch.kind.name(), batch.creation_index());
    if let Some(name) = &core.name {
        text.push_str(&format!(" '{name}'"));
    }
    text.push_str(&format!(" (layer {}, {}", core.layer, core.phase.name()));
    if core.combined {
        text.push_str(", combined");
    }
    if core.released {
        text.push_str(", released");
    }
    text.push(')');
    text
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core.try_lock() {
            Some(core) => f.write_str(&describe(self, &core)),
            None => write!(f, "{}#{} (busy)", self.kind.name(), self.creation_index()),
        }
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch({self})")
    }
}

impl PartialEq for Batch {
    fn eq(&self, other: &Self) -> bool {
        self.creation_index() == other.creation_index()
    }
}

impl Eq for Batch {}

impl Hash for Batch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.creation_index().hash(state);
    }
}

impl BatchContainer for Batch {
    fn container_id(&self) -> ContainerId {
        ContainerId::Group(self.creation_index())
    }

    fn add(&self, batch: &BatchRef) -> RenderResult<()> {
        let mut core = self.core.lock();
        self.editable(&core, "add", BatchKind::Group)?;
        if core.phase != BatchPhase::Initialized {
            return Err(self.invalid_state(&core, "Initialized"));
        }
        if std::ptr::eq(self, Arc::as_ptr(batch)) {
            return Err(RenderError::UnsupportedOperation {
                batch: describe(self, &core),
                operation: "adding a group to itself",
            });
        }
        batch.attach_to(self.container_id())?;
        if let BatchPayload::Group(group) = &mut core.payload {
            group.children.push(Arc::clone(batch));
        }
        Ok(())
    }
}
