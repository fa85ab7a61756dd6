#![forbid(unsafe_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;

use fz_core::{DType, DenseTensor, Device, FunctionalError, FunctionalTensor, MemoryFormat};
use fz_kernel_cpu::KernelError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpId(&'static str);

impl OpId {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A tensor slot on the boxed stack: either a raw value tensor or one
/// wrapped into the functional regime.
#[derive(Debug, Clone)]
pub enum TensorValue {
    Dense(DenseTensor),
    Functional(FunctionalTensor),
}

impl TensorValue {
    #[must_use]
    pub fn is_functional(&self) -> bool {
        matches!(self, Self::Functional(_))
    }

    pub fn as_dense(&self) -> Result<&DenseTensor, DispatchError> {
        match self {
            Self::Dense(tensor) => Ok(tensor),
            Self::Functional(_) => Err(DispatchError::SlotKindMismatch {
                slot: usize::MAX,
                expected: "dense tensor",
            }),
        }
    }

    pub fn as_functional(&self) -> Result<&FunctionalTensor, DispatchError> {
        match self {
            Self::Dense(_) => Err(DispatchError::SlotKindMismatch {
                slot: usize::MAX,
                expected: "functional tensor",
            }),
            Self::Functional(tensor) => Ok(tensor),
        }
    }
}

/// One slot of a boxed argument/return stack.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(TensorValue),
    TensorList(Vec<TensorValue>),
    OptionalTensorList(Vec<Option<TensorValue>>),
    Int(i64),
    IntList(Vec<i64>),
    Float(f64),
    Bool(bool),
    BoolOpt(Option<bool>),
    DTypeOpt(Option<DType>),
    DeviceOpt(Option<Device>),
    MemoryFormatOpt(Option<MemoryFormat>),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Tensor,
    TensorList,
    OptionalTensorList,
    Other,
}

/// Schema-declared aliasing behavior of one argument, mirroring the alias
/// annotations an operator registry attaches to mutating/view signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasAnnotation {
    pub is_write: bool,
}

#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub alias: Option<AliasAnnotation>,
}

impl ArgSpec {
    #[must_use]
    pub const fn plain(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            alias: None,
        }
    }

    #[must_use]
    pub const fn aliased(name: &'static str, kind: ArgKind, is_write: bool) -> Self {
        Self {
            name,
            kind,
            alias: Some(AliasAnnotation { is_write }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpSchema {
    name: &'static str,
    args: Vec<ArgSpec>,
    returns: Vec<ArgKind>,
}

impl OpSchema {
    #[must_use]
    pub fn new(name: &'static str, args: Vec<ArgSpec>, returns: Vec<ArgKind>) -> Self {
        Self {
            name,
            args,
            returns,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    #[must_use]
    pub fn returns(&self) -> &[ArgKind] {
        &self.returns
    }

    #[must_use]
    pub fn has_any_alias_info(&self) -> bool {
        self.args.iter().any(|arg| arg.alias.is_some())
    }
}

/// Ordered argument/return slots. Callers push arguments, the invoked kernel
/// pops them and pushes returns; slots are addressable by absolute position
/// for in-place replacement during unwrap/rewrap.
#[derive(Debug, Default)]
pub struct BoxedStack {
    slots: Vec<Value>,
}

impl BoxedStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: Value) {
        self.slots.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, DispatchError> {
        self.slots.pop().ok_or(DispatchError::StackUnderflow {
            needed: 1,
            available: 0,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Result<&Value, DispatchError> {
        self.slots
            .get(index)
            .ok_or(DispatchError::StackUnderflow {
                needed: index + 1,
                available: self.slots.len(),
            })
    }

    pub fn set_slot(&mut self, index: usize, value: Value) -> Result<(), DispatchError> {
        let available = self.slots.len();
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(DispatchError::StackUnderflow {
                needed: index + 1,
                available,
            }),
        }
    }

    /// Index of the first of the `count` trailing slots.
    pub fn base_of_last(&self, count: usize) -> Result<usize, DispatchError> {
        self.slots
            .len()
            .checked_sub(count)
            .ok_or(DispatchError::StackUnderflow {
                needed: count,
                available: self.slots.len(),
            })
    }
}

#[derive(Debug, Clone)]
pub enum DispatchError {
    UnknownOp { name: String },
    DuplicateOp { name: String },
    StackUnderflow { needed: usize, available: usize },
    SlotKindMismatch { slot: usize, expected: &'static str },
    ContractViolation { reason: String },
    Kernel(KernelError),
    Functional(FunctionalError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOp { name } => write!(f, "unknown operation '{name}'"),
            Self::DuplicateOp { name } => write!(f, "operation '{name}' already registered"),
            Self::StackUnderflow { needed, available } => {
                write!(f, "boxed stack underflow: needed={needed}, available={available}")
            }
            Self::SlotKindMismatch { slot, expected } => {
                write!(f, "boxed stack slot {slot} is not a {expected}")
            }
            Self::ContractViolation { reason } => {
                write!(f, "dispatch contract violation: {reason}")
            }
            Self::Kernel(error) => write!(f, "physical kernel failure: {error}"),
            Self::Functional(error) => write!(f, "functionalization failure: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<FunctionalError> for DispatchError {
    fn from(value: FunctionalError) -> Self {
        Self::Functional(value)
    }
}

thread_local! {
    static SKIP_FUNCTIONALIZE: Cell<bool> = const { Cell::new(false) };
    static FUNCTIONALIZE_INCLUDED: Cell<bool> = const { Cell::new(true) };
}

/// True while a handler is executing its single physical call; dispatch
/// routes straight to the physical kernel instead of re-entering the
/// interception layer.
#[must_use]
pub fn functionalize_skipped() -> bool {
    SKIP_FUNCTIONALIZE.with(Cell::get)
}

/// Scoped bypass around a physical kernel invocation. Restores the previous
/// state on drop, including on error propagation.
#[derive(Debug)]
pub struct SkipFunctionalizeGuard {
    previous: bool,
}

impl SkipFunctionalizeGuard {
    #[must_use]
    pub fn new() -> Self {
        let previous = SKIP_FUNCTIONALIZE.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Default for SkipFunctionalizeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SkipFunctionalizeGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        SKIP_FUNCTIONALIZE.with(|flag| flag.set(previous));
    }
}

/// Whether the functionalization key is included on the current call path.
/// A lazy/graph backend that drives functionalization itself excludes the
/// key while it runs; the device-copy escape hatch reads this.
#[must_use]
pub fn functionalize_included() -> bool {
    FUNCTIONALIZE_INCLUDED.with(Cell::get)
}

/// Scoped exclusion of the functionalization key for the current thread.
#[derive(Debug)]
pub struct ExcludeFunctionalizeGuard {
    previous: bool,
}

impl ExcludeFunctionalizeGuard {
    #[must_use]
    pub fn new() -> Self {
        let previous = FUNCTIONALIZE_INCLUDED.with(|flag| flag.replace(false));
        Self { previous }
    }
}

impl Default for ExcludeFunctionalizeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExcludeFunctionalizeGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        FUNCTIONALIZE_INCLUDED.with(|flag| flag.set(previous));
    }
}

pub type KernelFn = Box<dyn Fn(&mut BoxedStack) -> Result<(), DispatchError>>;
pub type InterceptFn = Box<dyn Fn(&OpRegistry, &OpId, &mut BoxedStack) -> Result<(), DispatchError>>;

struct OpEntry {
    schema: OpSchema,
    kernel: KernelFn,
    intercept: Option<InterceptFn>,
}

impl fmt::Debug for OpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpEntry")
            .field("schema", &self.schema)
            .field("intercepted", &self.intercept.is_some())
            .finish()
    }
}

/// Open dispatch table: every operation carries its schema and physical
/// kernel; interception handlers are per-operation overrides, with one
/// fallback for everything else. Exact match wins over the fallback; the
/// bypass flag wins over both.
#[derive(Default)]
pub struct OpRegistry {
    ops: HashMap<OpId, OpEntry>,
    fallback: Option<InterceptFn>,
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("ops", &self.ops)
            .field("fallback_registered", &self.fallback.is_some())
            .finish()
    }
}

impl OpRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_op(&mut self, schema: OpSchema, kernel: KernelFn) -> Result<OpId, DispatchError> {
        let op = OpId::new(schema.name());
        if self.ops.contains_key(&op) {
            return Err(DispatchError::DuplicateOp {
                name: schema.name().to_string(),
            });
        }
        self.ops.insert(
            op.clone(),
            OpEntry {
                schema,
                kernel,
                intercept: None,
            },
        );
        Ok(op)
    }

    pub fn register_intercept(
        &mut self,
        op: &OpId,
        handler: InterceptFn,
    ) -> Result<(), DispatchError> {
        match self.ops.get_mut(op) {
            Some(entry) => {
                entry.intercept = Some(handler);
                Ok(())
            }
            None => Err(DispatchError::UnknownOp {
                name: op.name().to_string(),
            }),
        }
    }

    pub fn register_fallback(&mut self, handler: InterceptFn) {
        self.fallback = Some(handler);
    }

    pub fn schema(&self, op: &OpId) -> Result<&OpSchema, DispatchError> {
        self.ops
            .get(op)
            .map(|entry| &entry.schema)
            .ok_or(DispatchError::UnknownOp {
                name: op.name().to_string(),
            })
    }

    /// Dispatch an operation at the interception boundary.
    pub fn call(&self, op: &OpId, stack: &mut BoxedStack) -> Result<(), DispatchError> {
        if functionalize_skipped() {
            return self.call_physical(op, stack);
        }
        let entry = self.ops.get(op).ok_or(DispatchError::UnknownOp {
            name: op.name().to_string(),
        })?;
        if let Some(handler) = &entry.intercept {
            return handler(self, op, stack);
        }
        if let Some(fallback) = &self.fallback {
            return fallback(self, op, stack);
        }
        self.call_physical(op, stack)
    }

    /// Invoke the physical kernel directly, skipping interception entirely.
    pub fn call_physical(&self, op: &OpId, stack: &mut BoxedStack) -> Result<(), DispatchError> {
        let entry = self.ops.get(op).ok_or(DispatchError::UnknownOp {
            name: op.name().to_string(),
        })?;
        let args_base = stack.base_of_last(entry.schema.args().len())?;
        debug_assert_eq!(args_base + entry.schema.args().len(), stack.len());
        (entry.kernel)(stack)
    }
}
