#![forbid(unsafe_code)]

use fz_core::{DType, DenseTensor, Device, FunctionalTensor, MemoryFormat};
use fz_dispatch::{
    BoxedStack, DispatchError, InterceptFn, KernelFn, OpId, OpRegistry, OpSchema, TensorValue,
    Value,
};
use fz_functionalize::{
    register_default_ops, register_functionalization, OP_ADD, OP_FILL, OP_FULL, OP_LIFT,
    OP_MUL, OP_RESIZE, OP_TO_COPY,
};
use fz_runtime::{
    EvidenceEntry, EvidenceKind, FunctionalizeConfig, RuntimeContext, RuntimeError,
};

/// One functionalized program: an operator registry with the interception
/// layer wired in, plus the evidence ledger for everything it observed.
#[derive(Debug)]
pub struct FunczillaSession {
    registry: OpRegistry,
    runtime: RuntimeContext,
}

impl FunczillaSession {
    pub fn new(config: FunctionalizeConfig) -> Result<Self, DispatchError> {
        let mut registry = OpRegistry::new();
        register_default_ops(&mut registry)?;
        let runtime = RuntimeContext::new(config);
        register_functionalization(&mut registry, &runtime)?;
        Ok(Self { registry, runtime })
    }

    pub fn with_defaults() -> Result<Self, DispatchError> {
        Self::new(FunctionalizeConfig::default())
    }

    #[must_use]
    pub fn config(&self) -> FunctionalizeConfig {
        self.runtime.config()
    }

    /// Register an additional physical operation; alias-free schemas are
    /// picked up by the interception fallback automatically.
    pub fn register_op(
        &mut self,
        schema: OpSchema,
        kernel: KernelFn,
    ) -> Result<OpId, DispatchError> {
        self.registry.register_op(schema, kernel)
    }

    pub fn register_intercept(
        &mut self,
        op: &OpId,
        handler: InterceptFn,
    ) -> Result<(), DispatchError> {
        self.registry.register_intercept(op, handler)
    }

    /// Dispatch an already-populated boxed stack through the interception
    /// layer. The stack is left holding the operation's returns.
    pub fn call(&self, op: &OpId, stack: &mut BoxedStack) -> Result<(), DispatchError> {
        self.registry.call(op, stack)
    }

    /// Admit a raw tensor into the functional regime.
    pub fn lift(&self, tensor: DenseTensor) -> Result<FunctionalTensor, DispatchError> {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(TensorValue::Dense(tensor)));
        self.registry.call(&OP_LIFT, &mut stack)?;
        match stack.pop()? {
            Value::Tensor(TensorValue::Functional(functional)) => Ok(functional),
            _ => Err(DispatchError::SlotKindMismatch {
                slot: 0,
                expected: "functional tensor",
            }),
        }
    }

    pub fn add(
        &self,
        lhs: TensorValue,
        rhs: TensorValue,
    ) -> Result<TensorValue, DispatchError> {
        self.binary(&OP_ADD, lhs, rhs)
    }

    pub fn mul(
        &self,
        lhs: TensorValue,
        rhs: TensorValue,
    ) -> Result<TensorValue, DispatchError> {
        self.binary(&OP_MUL, lhs, rhs)
    }

    pub fn fill(
        &self,
        tensor: TensorValue,
        value: f64,
    ) -> Result<TensorValue, DispatchError> {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(tensor));
        stack.push(Value::Float(value));
        self.registry.call(&OP_FILL, &mut stack)?;
        pop_tensor(&mut stack)
    }

    pub fn full(&self, size: &[usize], fill_value: f64) -> Result<TensorValue, DispatchError> {
        let mut stack = BoxedStack::new();
        stack.push(Value::IntList(size.iter().map(|dim| *dim as i64).collect()));
        stack.push(Value::Float(fill_value));
        stack.push(Value::DTypeOpt(None));
        stack.push(Value::DeviceOpt(None));
        self.registry.call(&OP_FULL, &mut stack)?;
        pop_tensor(&mut stack)
    }

    pub fn resize(
        &self,
        tensor: TensorValue,
        new_size: &[usize],
    ) -> Result<TensorValue, DispatchError> {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(tensor));
        stack.push(Value::IntList(
            new_size.iter().map(|dim| *dim as i64).collect(),
        ));
        stack.push(Value::MemoryFormatOpt(None));
        self.registry.call(&OP_RESIZE, &mut stack)?;
        pop_tensor(&mut stack)
    }

    pub fn to_copy(
        &self,
        tensor: TensorValue,
        dtype: Option<DType>,
        device: Option<Device>,
    ) -> Result<TensorValue, DispatchError> {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(tensor));
        stack.push(Value::DTypeOpt(dtype));
        stack.push(Value::None);
        stack.push(Value::DeviceOpt(device));
        stack.push(Value::BoolOpt(None));
        stack.push(Value::Bool(false));
        stack.push(Value::MemoryFormatOpt(Some(MemoryFormat::Preserve)));
        self.registry.call(&OP_TO_COPY, &mut stack)?;
        pop_tensor(&mut stack)
    }

    /// Resolve a wrapper's pending descriptors and return the raw result.
    pub fn sync(&self, tensor: &FunctionalTensor) -> Result<DenseTensor, DispatchError> {
        let value = tensor.sync_and_unwrap()?;
        self.runtime.record(
            EvidenceKind::Sync,
            format!("session sync of tensor id={}", tensor.id()),
        );
        Ok(value)
    }

    #[must_use]
    pub fn evidence(&self) -> Vec<EvidenceEntry> {
        self.runtime.evidence()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.evidence_len()
    }

    #[must_use]
    pub fn evidence_count_of(&self, kind: EvidenceKind) -> usize {
        self.runtime.evidence_count_of(kind)
    }

    pub fn export_evidence_json(&self) -> Result<String, RuntimeError> {
        self.runtime.export_evidence_json()
    }

    fn binary(
        &self,
        op: &OpId,
        lhs: TensorValue,
        rhs: TensorValue,
    ) -> Result<TensorValue, DispatchError> {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(lhs));
        stack.push(Value::Tensor(rhs));
        self.registry.call(op, &mut stack)?;
        pop_tensor(&mut stack)
    }
}

fn pop_tensor(stack: &mut BoxedStack) -> Result<TensorValue, DispatchError> {
    let index = stack.len().saturating_sub(1);
    match stack.pop()? {
        Value::Tensor(tensor) => Ok(tensor),
        _ => Err(DispatchError::SlotKindMismatch {
            slot: index,
            expected: "tensor",
        }),
    }
}
