#![forbid(unsafe_code)]

use std::fmt;

use fz_core::{
    DType, DenseTensor, Device, MemoryFormat, RowMajorIndices, Storage, TensorMeta,
    TensorMetaError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Meta(TensorMetaError),
    ShapeMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    DTypeMismatch {
        lhs: DType,
        rhs: DType,
    },
    DeviceMismatch {
        lhs: Device,
        rhs: Device,
    },
    StorageTooSmall {
        needed: usize,
        available: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(error) => write!(f, "tensor meta failure: {error}"),
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::StorageTooSmall { needed, available } => {
                write!(f, "storage too small: needed={needed}, available={available}")
            }
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorMetaError> for KernelError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

fn ensure_same_typed(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), KernelError> {
    if lhs.meta().dtype() != rhs.meta().dtype() {
        return Err(KernelError::DTypeMismatch {
            lhs: lhs.meta().dtype(),
            rhs: rhs.meta().dtype(),
        });
    }
    if lhs.meta().device() != rhs.meta().device() {
        return Err(KernelError::DeviceMismatch {
            lhs: lhs.meta().device(),
            rhs: rhs.meta().device(),
        });
    }
    if lhs.meta().shape() != rhs.meta().shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.meta().shape().to_vec(),
            rhs: rhs.meta().shape().to_vec(),
        });
    }
    Ok(())
}

fn elementwise<F>(lhs: &DenseTensor, rhs: &DenseTensor, op: F) -> Result<DenseTensor, KernelError>
where
    F: Fn(f64, f64) -> f64,
{
    ensure_same_typed(lhs, rhs)?;
    let left = lhs.contiguous_values()?;
    let right = rhs.contiguous_values()?;
    let out = left
        .iter()
        .zip(right.iter())
        .map(|(a, b)| op(*a, *b))
        .collect();
    Ok(DenseTensor::from_values(
        lhs.meta().shape().to_vec(),
        out,
        lhs.meta().dtype(),
        lhs.meta().device(),
    )?)
}

/// Pure elementwise addition; output gets fresh contiguous storage.
pub fn add(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, KernelError> {
    elementwise(lhs, rhs, |a, b| a + b)
}

/// Pure elementwise multiplication; output gets fresh contiguous storage.
pub fn mul(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, KernelError> {
    elementwise(lhs, rhs, |a, b| a * b)
}

/// Alias-free fill: same shape as the source, every element set to `value`,
/// fresh storage.
pub fn fill(src: &DenseTensor, value: f64) -> Result<DenseTensor, KernelError> {
    Ok(DenseTensor::from_values(
        src.meta().shape().to_vec(),
        vec![value; src.meta().numel()],
        src.meta().dtype(),
        src.meta().device(),
    )?)
}

/// Factory: contiguous tensor filled with a constant.
pub fn full(
    shape: Vec<usize>,
    fill_value: f64,
    dtype: DType,
    device: Device,
) -> Result<DenseTensor, KernelError> {
    let numel: usize = shape.iter().product();
    Ok(DenseTensor::from_values(
        shape,
        vec![fill_value; numel],
        dtype,
        device,
    )?)
}

fn ensure_span_fits(tensor: &DenseTensor, meta: &TensorMeta) -> Result<(), KernelError> {
    let needed = meta.required_span()?;
    let available = tensor.storage().len();
    if needed > available {
        return Err(KernelError::StorageTooSmall { needed, available });
    }
    Ok(())
}

/// Zero-copy strided view over the source's storage.
pub fn as_strided(
    src: &DenseTensor,
    shape: Vec<usize>,
    strides: Vec<usize>,
) -> Result<DenseTensor, KernelError> {
    let meta = TensorMeta::strided(
        shape,
        strides,
        src.meta().storage_offset(),
        src.meta().dtype(),
        src.meta().device(),
    )?;
    ensure_span_fits(src, &meta)?;
    Ok(src.view_with_meta(meta))
}

/// Alias-free variant of [`as_strided`]: same logical result, fresh storage.
pub fn as_strided_copy(
    src: &DenseTensor,
    shape: Vec<usize>,
    strides: Vec<usize>,
) -> Result<DenseTensor, KernelError> {
    let view = as_strided(src, shape.clone(), strides)?;
    Ok(DenseTensor::from_values(
        shape,
        view.contiguous_values()?,
        src.meta().dtype(),
        src.meta().device(),
    )?)
}

/// Writes `mutated_view` into a copy of `base` at the strided positions the
/// equivalent `as_strided(base, shape, strides)` view would read from.
/// `base` itself is untouched.
pub fn as_strided_scatter(
    base: &DenseTensor,
    mutated_view: &DenseTensor,
    shape: Vec<usize>,
    strides: Vec<usize>,
) -> Result<DenseTensor, KernelError> {
    if mutated_view.meta().shape() != shape.as_slice() {
        return Err(KernelError::ShapeMismatch {
            lhs: mutated_view.meta().shape().to_vec(),
            rhs: shape,
        });
    }
    let window = TensorMeta::strided(
        shape.clone(),
        strides,
        base.meta().storage_offset(),
        base.meta().dtype(),
        base.meta().device(),
    )?;
    ensure_span_fits(base, &window)?;

    let storage = Storage::from_cells(base.storage().snapshot(), base.meta().dtype().itemsize());
    let out = DenseTensor::from_parts(storage, base.meta().clone());
    for index in RowMajorIndices::new(&shape) {
        let linear = window.storage_index_for(&index)?;
        let value = mutated_view.element(&index)?;
        if !out.storage().write(linear, value) {
            return Err(KernelError::StorageTooSmall {
                needed: linear + 1,
                available: out.storage().len(),
            });
        }
    }
    Ok(out)
}

/// Storage-aware out-of-place resize: fresh contiguous tensor of `new_size`
/// whose leading row-major elements copy the source's, zero-filled past the
/// source's extent.
pub fn resize(
    src: &DenseTensor,
    new_size: &[usize],
    _memory_format: Option<MemoryFormat>,
) -> Result<DenseTensor, KernelError> {
    let numel: usize = new_size.iter().product();
    let source = src.contiguous_values()?;
    let mut values = vec![0.0; numel];
    let keep = numel.min(source.len());
    values[..keep].copy_from_slice(&source[..keep]);
    Ok(DenseTensor::from_values(
        new_size.to_vec(),
        values,
        src.meta().dtype(),
        src.meta().device(),
    )?)
}

/// In-place resize for tensors outside the functional regime. Shrinking
/// restrides over the existing allocation; growing swaps in new storage.
pub fn resize_in_place(
    tensor: &mut DenseTensor,
    new_size: &[usize],
    memory_format: Option<MemoryFormat>,
) -> Result<(), KernelError> {
    let meta = TensorMeta::contiguous(
        new_size.to_vec(),
        tensor.meta().dtype(),
        tensor.meta().device(),
    )
    .with_storage_offset(tensor.meta().storage_offset());
    let needed = meta.required_span()?;
    if needed <= tensor.storage().len() {
        let restrided = tensor.view_with_meta(meta);
        tensor.replace_with(&restrided);
        return Ok(());
    }
    let grown = resize(tensor, new_size, memory_format)?;
    tensor.replace_with(&grown);
    Ok(())
}

/// Conversion copy across dtype/device. Layout, pinning and memory-format
/// requests are accepted for schema compatibility but do not change the
/// contiguous output this backend produces.
pub fn to_copy(
    src: &DenseTensor,
    dtype: Option<DType>,
    device: Option<Device>,
    _pin_memory: Option<bool>,
    _non_blocking: bool,
    _memory_format: Option<MemoryFormat>,
) -> Result<DenseTensor, KernelError> {
    let out_dtype = dtype.unwrap_or(src.meta().dtype());
    let out_device = device.unwrap_or(src.meta().device());
    Ok(DenseTensor::from_values(
        src.meta().shape().to_vec(),
        src.contiguous_values()?,
        out_dtype,
        out_device,
    )?)
}
