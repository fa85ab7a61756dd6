#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
}

impl DType {
    #[must_use]
    pub const fn itemsize(self) -> usize {
        match self {
            Self::F64 => 8,
            Self::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
    Xla,
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    Contiguous,
    Preserve,
}

/// Row-major strides for a shape: last dimension is fastest-moving.
/// A rank-0 shape yields an empty stride list.
#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    let mut running = 1usize;
    for (slot, dim) in strides.iter_mut().zip(shape.iter()).rev() {
        *slot = running;
        running = match running.checked_mul(*dim) {
            Some(next) => next,
            None => {
                // A shape whose element count overflows usize cannot back a
                // real layout; span checks downstream reject it too.
                debug_assert!(false, "stride overflow for shape {shape:?}");
                usize::MAX
            }
        };
    }
    strides
}

/// Tightly-packed contiguous byte footprint implied by a shape, an element
/// size, and a storage offset. Returns `None` on arithmetic overflow.
#[must_use]
pub fn storage_nbytes_contiguous(
    shape: &[usize],
    itemsize: usize,
    storage_offset: usize,
) -> Option<usize> {
    let mut numel = 1usize;
    for dim in shape {
        numel = numel.checked_mul(*dim)?;
    }
    storage_offset.checked_add(numel)?.checked_mul(itemsize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankMismatch {
        shape_rank: usize,
        stride_rank: usize,
    },
    SpanOverflow {
        dim: usize,
        size: usize,
        stride: usize,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
    LengthMismatch {
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankMismatch {
                shape_rank,
                stride_rank,
            } => write!(
                f,
                "shape rank {shape_rank} does not match stride rank {stride_rank}"
            ),
            Self::SpanOverflow { dim, size, stride } => write!(
                f,
                "storage span overflow at dim={dim}: size={size}, stride={stride}"
            ),
            Self::IndexRankMismatch { expected, actual } => {
                write!(f, "index rank mismatch: expected={expected}, actual={actual}")
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(f, "index out of bounds at dim={dim}: index={index}, size={size}")
            }
            Self::LengthMismatch { expected, actual } => {
                write!(f, "value length mismatch: expected={expected}, actual={actual}")
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn contiguous(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device,
        }
    }

    pub fn strided(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        if shape.len() != strides.len() {
            return Err(TensorMetaError::RankMismatch {
                shape_rank: shape.len(),
                stride_rank: strides.len(),
            });
        }
        let meta = Self {
            shape,
            strides,
            storage_offset,
            dtype,
            device,
        };
        meta.required_span()?;
        Ok(meta)
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }

    /// Number of storage cells this layout can touch, counted from cell 0.
    /// Zero for empty tensors.
    pub fn required_span(&self) -> Result<usize, TensorMetaError> {
        if self.numel() == 0 {
            return Ok(0);
        }
        let mut last = self.storage_offset;
        for (dim, (size, stride)) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            let reach = stride
                .checked_mul(size - 1)
                .and_then(|span| last.checked_add(span));
            match reach {
                Some(value) => last = value,
                None => return Err(TensorMetaError::SpanOverflow { dim, size, stride }),
            }
        }
        last.checked_add(1).ok_or(TensorMetaError::SpanOverflow {
            dim: self.shape.len(),
            size: 0,
            stride: 0,
        })
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            match expected.checked_mul(size) {
                Some(next) => expected = next,
                None => return false,
            }
        }
        true
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }
        let mut linear = self.storage_offset;
        for (dim, ((idx, size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size,
                });
            }
            linear += idx * stride;
        }
        Ok(linear)
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.strides.hash(&mut hasher);
        self.storage_offset.hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.device.hash(&mut hasher);
        hasher.finish()
    }
}

/// Iterates all multi-indices of a shape in row-major order.
#[derive(Debug, Clone)]
pub struct RowMajorIndices {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl RowMajorIndices {
    #[must_use]
    pub fn new(shape: &[usize]) -> Self {
        let next = if shape.iter().any(|dim| *dim == 0) {
            None
        } else {
            Some(vec![0; shape.len()])
        };
        Self {
            shape: shape.to_vec(),
            next,
        }
    }
}

impl Iterator for RowMajorIndices {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.clone()?;
        let mut bumped = current.clone();
        let mut carried = true;
        for dim in (0..self.shape.len()).rev() {
            bumped[dim] += 1;
            if bumped[dim] < self.shape[dim] {
                carried = false;
                break;
            }
            bumped[dim] = 0;
        }
        self.next = if carried { None } else { Some(bumped) };
        Some(current)
    }
}

/// Reference-counted storage of scalar cells plus the element size the
/// allocation was made for. Byte capacity is `len * itemsize`.
#[derive(Debug, Clone)]
pub struct Storage {
    cells: Rc<RefCell<Vec<f64>>>,
    itemsize: usize,
    id: u64,
}

impl Storage {
    #[must_use]
    pub fn allocate(len: usize, itemsize: usize) -> Self {
        Self::from_cells(vec![0.0; len], itemsize)
    }

    #[must_use]
    pub fn from_cells(cells: Vec<f64>, itemsize: usize) -> Self {
        Self {
            cells: Rc::new(RefCell::new(cells)),
            itemsize,
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.borrow().is_empty()
    }

    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.len() * self.itemsize
    }

    #[must_use]
    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    #[must_use]
    pub fn read(&self, index: usize) -> Option<f64> {
        self.cells.borrow().get(index).copied()
    }

    pub fn write(&self, index: usize, value: f64) -> bool {
        let mut cells = self.cells.borrow_mut();
        match cells.get_mut(index) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<f64> {
        self.cells.borrow().clone()
    }

    #[must_use]
    pub fn shares_allocation(&self, other: &Storage) -> bool {
        Rc::ptr_eq(&self.cells, &other.cells)
    }
}

/// A plain value tensor: meta plus shared storage. Cloning a `DenseTensor`
/// clones the handle; the storage allocation stays shared.
#[derive(Debug, Clone)]
pub struct DenseTensor {
    id: u64,
    storage: Storage,
    meta: TensorMeta,
    version: u64,
}

impl DenseTensor {
    pub fn from_values(
        shape: Vec<usize>,
        values: Vec<f64>,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = TensorMeta::contiguous(shape, dtype, device);
        if values.len() != meta.numel() {
            return Err(TensorMetaError::LengthMismatch {
                expected: meta.numel(),
                actual: values.len(),
            });
        }
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage: Storage::from_cells(values, dtype.itemsize()),
            meta,
            version: 0,
        })
    }

    #[must_use]
    pub fn from_parts(storage: Storage, meta: TensorMeta) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage,
            meta,
            version: 0,
        }
    }

    /// New tensor handle over the same storage with a different layout.
    #[must_use]
    pub fn view_with_meta(&self, meta: TensorMeta) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage: self.storage.clone(),
            meta,
            version: self.version,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn element(&self, index: &[usize]) -> Result<f64, TensorMetaError> {
        let linear = self.meta.storage_index_for(index)?;
        self.storage
            .read(linear)
            .ok_or(TensorMetaError::IndexOutOfBounds {
                dim: 0,
                index: linear,
                size: self.storage.len(),
            })
    }

    pub fn set_element(&mut self, index: &[usize], value: f64) -> Result<(), TensorMetaError> {
        let linear = self.meta.storage_index_for(index)?;
        if !self.storage.write(linear, value) {
            return Err(TensorMetaError::IndexOutOfBounds {
                dim: 0,
                index: linear,
                size: self.storage.len(),
            });
        }
        self.version = self.version.saturating_add(1);
        Ok(())
    }

    /// Materialize the logical contents in row-major order.
    pub fn contiguous_values(&self) -> Result<Vec<f64>, TensorMetaError> {
        let mut out = Vec::with_capacity(self.meta.numel());
        for index in RowMajorIndices::new(self.meta.shape()) {
            out.push(self.element(&index)?);
        }
        Ok(out)
    }

    /// Swap the backing storage and layout in place while keeping the handle
    /// identity. Used by the growth path of functionalized resize.
    pub fn replace_with(&mut self, other: &DenseTensor) {
        self.storage = other.storage.clone();
        self.meta = other.meta.clone();
        self.version = self.version.saturating_add(1);
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.meta.fingerprint64().hash(&mut hasher);
        self.storage.id().hash(&mut hasher);
        for cell in self.storage.snapshot() {
            cell.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Clean,
    Dirty,
}

#[derive(Debug, Clone)]
pub enum FunctionalError {
    Replay { reason: String },
    OutstandingViews { pending: usize },
    Meta(TensorMetaError),
}

impl fmt::Display for FunctionalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replay { reason } => write!(f, "view replay failed: {reason}"),
            Self::OutstandingViews { pending } => write!(
                f,
                "operation requires an empty view chain, {pending} descriptor(s) pending"
            ),
            Self::Meta(error) => write!(f, "tensor meta failure: {error}"),
        }
    }
}

impl std::error::Error for FunctionalError {}

impl From<TensorMetaError> for FunctionalError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

type ForwardFn = dyn Fn(&DenseTensor) -> Result<DenseTensor, FunctionalError>;
type ReverseFn = dyn Fn(&DenseTensor, &DenseTensor) -> Result<DenseTensor, FunctionalError>;

/// One view operation captured symbolically: a pure forward transform that
/// re-derives the view from a base, and a pure reverse transform that
/// scatters a mutated view back into the base. Immutable once built; the
/// closures must capture parameters by value, never the base itself.
pub struct ViewMeta {
    label: &'static str,
    forward: Box<ForwardFn>,
    reverse: Box<ReverseFn>,
}

impl ViewMeta {
    pub fn new<F, R>(label: &'static str, forward: F, reverse: R) -> Self
    where
        F: Fn(&DenseTensor) -> Result<DenseTensor, FunctionalError> + 'static,
        R: Fn(&DenseTensor, &DenseTensor) -> Result<DenseTensor, FunctionalError> + 'static,
    {
        Self {
            label,
            forward: Box::new(forward),
            reverse: Box::new(reverse),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn apply(&self, base: &DenseTensor) -> Result<DenseTensor, FunctionalError> {
        (self.forward)(base)
    }

    pub fn scatter(
        &self,
        base: &DenseTensor,
        mutated_view: &DenseTensor,
    ) -> Result<DenseTensor, FunctionalError> {
        (self.reverse)(base, mutated_view)
    }
}

impl fmt::Debug for ViewMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewMeta").field("label", &self.label).finish()
    }
}

#[derive(Debug)]
struct FunctionalState {
    value: DenseTensor,
    base: DenseTensor,
    view_metas: Vec<ViewMeta>,
    sync_state: SyncState,
    storage_epoch: u64,
}

/// Tensor decorator that defers in-place mutation: instead of aliasing
/// storage, it records replayable view descriptors and resolves them on
/// synchronization. Cloning clones the handle, not the state.
#[derive(Debug, Clone)]
pub struct FunctionalTensor {
    id: u64,
    inner: Rc<RefCell<FunctionalState>>,
}

impl FunctionalTensor {
    #[must_use]
    pub fn wrap(value: DenseTensor) -> Self {
        let base = value.clone();
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            inner: Rc::new(RefCell::new(FunctionalState {
                value,
                base,
                view_metas: Vec::new(),
                sync_state: SyncState::Clean,
                storage_epoch: 0,
            })),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.inner.borrow().sync_state
    }

    #[must_use]
    pub fn storage_epoch(&self) -> u64 {
        self.inner.borrow().storage_epoch
    }

    #[must_use]
    pub fn view_chain_len(&self) -> usize {
        self.inner.borrow().view_metas.len()
    }

    #[must_use]
    pub fn same_handle(&self, other: &FunctionalTensor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current value tensor without synchronizing. Callers that hand the
    /// value to a physical kernel must call [`FunctionalTensor::sync`] first.
    #[must_use]
    pub fn value_snapshot(&self) -> DenseTensor {
        self.inner.borrow().value.clone()
    }

    /// Resolve pending view descriptors so the value tensor is current.
    /// A no-op when already clean.
    pub fn sync(&self) -> Result<(), FunctionalError> {
        let mut state = self.inner.borrow_mut();
        if state.sync_state == SyncState::Clean {
            return Ok(());
        }
        let mut current = state.base.clone();
        for meta in &state.view_metas {
            current = meta.apply(&current)?;
        }
        state.value = current;
        state.sync_state = SyncState::Clean;
        Ok(())
    }

    /// Synchronize, then unwrap the inner value tensor.
    pub fn sync_and_unwrap(&self) -> Result<DenseTensor, FunctionalError> {
        self.sync()?;
        Ok(self.value_snapshot())
    }

    /// Record one more view descriptor on this tensor. The value tensor is
    /// stale until the next synchronization.
    pub fn mutate_view_meta(&self, meta: ViewMeta) {
        let mut state = self.inner.borrow_mut();
        state.view_metas.push(meta);
        state.sync_state = SyncState::Dirty;
    }

    /// Growth-path storage swap: the handle identity is unchanged, the value
    /// and base point at the new allocation, and the storage epoch is
    /// bumped. Only legal when no view descriptors are outstanding.
    pub fn replace_storage(&self, replacement: DenseTensor) -> Result<(), FunctionalError> {
        let mut state = self.inner.borrow_mut();
        if !state.view_metas.is_empty() {
            return Err(FunctionalError::OutstandingViews {
                pending: state.view_metas.len(),
            });
        }
        state.base = replacement.clone();
        state.value = replacement;
        state.sync_state = SyncState::Clean;
        state.storage_epoch += 1;
        Ok(())
    }

    /// Propagate a mutated version of this tensor's view back into the base
    /// through the reverse transforms, innermost descriptor first. The base
    /// is replaced wholesale; descriptors are never modified.
    pub fn propagate_view_mutation(
        &self,
        mutated_view: DenseTensor,
    ) -> Result<(), FunctionalError> {
        let mut state = self.inner.borrow_mut();
        let mut intermediates = Vec::with_capacity(state.view_metas.len());
        let mut current = state.base.clone();
        for meta in &state.view_metas {
            intermediates.push(current.clone());
            current = meta.apply(&current)?;
        }
        let mut carried = mutated_view;
        for (meta, base_value) in state.view_metas.iter().zip(intermediates.iter()).rev() {
            carried = meta.scatter(base_value, &carried)?;
        }
        state.base = carried;
        state.sync_state = SyncState::Dirty;
        Ok(())
    }

    /// Base value the view chain replays against. Exposed for tests and for
    /// evidence digests; mutation goes through the propagate/replace paths.
    #[must_use]
    pub fn base_snapshot(&self) -> DenseTensor {
        self.inner.borrow().base.clone()
    }
}
