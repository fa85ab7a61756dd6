#![forbid(unsafe_code)]

use fz_core::{
    contiguous_strides, storage_nbytes_contiguous, DType, DenseTensor, Device, FunctionalError,
    FunctionalTensor, MemoryFormat, ViewMeta,
};
use fz_dispatch::{
    functionalize_included, ArgKind, ArgSpec, BoxedStack, DispatchError, InterceptFn, OpId,
    OpRegistry, OpSchema, SkipFunctionalizeGuard, TensorValue, Value,
};
use fz_kernel_cpu as kernels;
use fz_runtime::{EvidenceKind, RuntimeContext};

pub const OP_RESIZE: OpId = OpId::new("resize");
pub const OP_LIFT: OpId = OpId::new("lift");
pub const OP_TO_COPY: OpId = OpId::new("to_copy");
pub const OP_ADD: OpId = OpId::new("add");
pub const OP_MUL: OpId = OpId::new("mul");
pub const OP_FILL: OpId = OpId::new("fill");
pub const OP_FULL: OpId = OpId::new("full");

/// A target device opts into functional semantics when it is one of the
/// lazy/graph execution kinds. An absent target means the output stays on
/// the source device.
#[must_use]
pub fn device_opted_into_functionalization(
    self_device: Device,
    target_device: Option<Device>,
) -> bool {
    matches!(
        target_device.unwrap_or(self_device),
        Device::Xla | Device::Lazy
    )
}

fn size_from_i64(values: &[i64]) -> Result<Vec<usize>, DispatchError> {
    values
        .iter()
        .map(|value| {
            usize::try_from(*value).map_err(|_| DispatchError::ContractViolation {
                reason: format!("negative dimension {value} in size argument"),
            })
        })
        .collect()
}

fn expect_tensor(stack: &BoxedStack, index: usize) -> Result<TensorValue, DispatchError> {
    match stack.slot(index)? {
        Value::Tensor(tensor) => Ok(tensor.clone()),
        _ => Err(DispatchError::SlotKindMismatch {
            slot: index,
            expected: "tensor",
        }),
    }
}

fn expect_int_list(stack: &BoxedStack, index: usize) -> Result<Vec<i64>, DispatchError> {
    match stack.slot(index)? {
        Value::IntList(values) => Ok(values.clone()),
        _ => Err(DispatchError::SlotKindMismatch {
            slot: index,
            expected: "int list",
        }),
    }
}

fn expect_memory_format(
    stack: &BoxedStack,
    index: usize,
) -> Result<Option<MemoryFormat>, DispatchError> {
    match stack.slot(index)? {
        Value::MemoryFormatOpt(format) => Ok(*format),
        Value::None => Ok(None),
        _ => Err(DispatchError::SlotKindMismatch {
            slot: index,
            expected: "memory format",
        }),
    }
}

fn expect_device_opt(stack: &BoxedStack, index: usize) -> Result<Option<Device>, DispatchError> {
    match stack.slot(index)? {
        Value::DeviceOpt(device) => Ok(*device),
        Value::None => Ok(None),
        _ => Err(DispatchError::SlotKindMismatch {
            slot: index,
            expected: "device",
        }),
    }
}

fn pop_dense(stack: &mut BoxedStack) -> Result<DenseTensor, DispatchError> {
    let index = stack.len().saturating_sub(1);
    match stack.pop()? {
        Value::Tensor(TensorValue::Dense(tensor)) => Ok(tensor),
        _ => Err(DispatchError::SlotKindMismatch {
            slot: index,
            expected: "dense tensor",
        }),
    }
}

/// Register the physical operations this layer intercepts, plus the
/// alias-free math and factory ops exercised through the fallback.
pub fn register_default_ops(registry: &mut OpRegistry) -> Result<(), DispatchError> {
    registry.register_op(
        OpSchema::new(
            "add",
            vec![
                ArgSpec::plain("lhs", ArgKind::Tensor),
                ArgSpec::plain("rhs", ArgKind::Tensor),
            ],
            vec![ArgKind::Tensor],
        ),
        Box::new(|stack| {
            let rhs = pop_dense(stack)?;
            let lhs = pop_dense(stack)?;
            let out = kernels::add(&lhs, &rhs)?;
            stack.push(Value::Tensor(TensorValue::Dense(out)));
            Ok(())
        }),
    )?;

    registry.register_op(
        OpSchema::new(
            "mul",
            vec![
                ArgSpec::plain("lhs", ArgKind::Tensor),
                ArgSpec::plain("rhs", ArgKind::Tensor),
            ],
            vec![ArgKind::Tensor],
        ),
        Box::new(|stack| {
            let rhs = pop_dense(stack)?;
            let lhs = pop_dense(stack)?;
            let out = kernels::mul(&lhs, &rhs)?;
            stack.push(Value::Tensor(TensorValue::Dense(out)));
            Ok(())
        }),
    )?;

    registry.register_op(
        OpSchema::new(
            "fill",
            vec![
                ArgSpec::plain("self", ArgKind::Tensor),
                ArgSpec::plain("value", ArgKind::Other),
            ],
            vec![ArgKind::Tensor],
        ),
        Box::new(|stack| {
            let value = match stack.pop()? {
                Value::Float(value) => value,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 1,
                        expected: "float",
                    })
                }
            };
            let tensor = pop_dense(stack)?;
            let out = kernels::fill(&tensor, value)?;
            stack.push(Value::Tensor(TensorValue::Dense(out)));
            Ok(())
        }),
    )?;

    registry.register_op(
        OpSchema::new(
            "full",
            vec![
                ArgSpec::plain("size", ArgKind::Other),
                ArgSpec::plain("fill_value", ArgKind::Other),
                ArgSpec::plain("dtype", ArgKind::Other),
                ArgSpec::plain("device", ArgKind::Other),
            ],
            vec![ArgKind::Tensor],
        ),
        Box::new(|stack| {
            let device = match stack.pop()? {
                Value::DeviceOpt(device) => device,
                Value::None => None,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 3,
                        expected: "device",
                    })
                }
            };
            let dtype = match stack.pop()? {
                Value::DTypeOpt(dtype) => dtype,
                Value::None => None,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 2,
                        expected: "dtype",
                    })
                }
            };
            let fill_value = match stack.pop()? {
                Value::Float(value) => value,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 1,
                        expected: "float",
                    })
                }
            };
            let size = match stack.pop()? {
                Value::IntList(values) => size_from_i64(&values)?,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 0,
                        expected: "int list",
                    })
                }
            };
            let out = kernels::full(
                size,
                fill_value,
                dtype.unwrap_or(DType::F64),
                device.unwrap_or(Device::Cpu),
            )?;
            stack.push(Value::Tensor(TensorValue::Dense(out)));
            Ok(())
        }),
    )?;

    // resize declares a write alias on self: it must never reach the
    // generic fallback, only its dedicated handler or the physical kernel.
    registry.register_op(
        OpSchema::new(
            "resize",
            vec![
                ArgSpec::aliased("self", ArgKind::Tensor, true),
                ArgSpec::plain("size", ArgKind::Other),
                ArgSpec::plain("memory_format", ArgKind::Other),
            ],
            vec![ArgKind::Tensor],
        ),
        Box::new(|stack| {
            let memory_format = match stack.pop()? {
                Value::MemoryFormatOpt(format) => format,
                Value::None => None,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 2,
                        expected: "memory format",
                    })
                }
            };
            let size = match stack.pop()? {
                Value::IntList(values) => size_from_i64(&values)?,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 1,
                        expected: "int list",
                    })
                }
            };
            let mut tensor = pop_dense(stack)?;
            kernels::resize_in_place(&mut tensor, &size, memory_format)?;
            stack.push(Value::Tensor(TensorValue::Dense(tensor)));
            Ok(())
        }),
    )?;

    registry.register_op(
        OpSchema::new(
            "lift",
            vec![ArgSpec::plain("self", ArgKind::Tensor)],
            vec![ArgKind::Tensor],
        ),
        Box::new(|stack| {
            let tensor = pop_dense(stack)?;
            stack.push(Value::Tensor(TensorValue::Dense(tensor)));
            Ok(())
        }),
    )?;

    registry.register_op(
        OpSchema::new(
            "to_copy",
            vec![
                ArgSpec::plain("self", ArgKind::Tensor),
                ArgSpec::plain("dtype", ArgKind::Other),
                ArgSpec::plain("layout", ArgKind::Other),
                ArgSpec::plain("device", ArgKind::Other),
                ArgSpec::plain("pin_memory", ArgKind::Other),
                ArgSpec::plain("non_blocking", ArgKind::Other),
                ArgSpec::plain("memory_format", ArgKind::Other),
            ],
            vec![ArgKind::Tensor],
        ),
        Box::new(|stack| {
            let memory_format = match stack.pop()? {
                Value::MemoryFormatOpt(format) => format,
                Value::None => None,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 6,
                        expected: "memory format",
                    })
                }
            };
            let non_blocking = match stack.pop()? {
                Value::Bool(flag) => flag,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 5,
                        expected: "bool",
                    })
                }
            };
            let pin_memory = match stack.pop()? {
                Value::BoolOpt(flag) => flag,
                Value::None => None,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 4,
                        expected: "bool",
                    })
                }
            };
            let device = match stack.pop()? {
                Value::DeviceOpt(device) => device,
                Value::None => None,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 3,
                        expected: "device",
                    })
                }
            };
            let _layout = stack.pop()?;
            let dtype = match stack.pop()? {
                Value::DTypeOpt(dtype) => dtype,
                Value::None => None,
                _ => {
                    return Err(DispatchError::SlotKindMismatch {
                        slot: 1,
                        expected: "dtype",
                    })
                }
            };
            let tensor = pop_dense(stack)?;
            let out = kernels::to_copy(
                &tensor,
                dtype,
                device,
                pin_memory,
                non_blocking,
                memory_format,
            )?;
            stack.push(Value::Tensor(TensorValue::Dense(out)));
            Ok(())
        }),
    )?;

    Ok(())
}

fn sync_and_unwrap_value(
    tensor: &TensorValue,
    synced: &mut usize,
) -> Result<TensorValue, DispatchError> {
    match tensor {
        TensorValue::Dense(_) => Ok(tensor.clone()),
        TensorValue::Functional(functional) => {
            *synced += 1;
            Ok(TensorValue::Dense(functional.sync_and_unwrap()?))
        }
    }
}

/// The catch-all handler for alias-free operations: unwrap functional
/// tensor arguments in place, invoke the physical kernel exactly once under
/// a bypass scope, then wrap qualifying outputs back into the functional
/// regime.
#[must_use]
pub fn functionalize_fallback(ctx: RuntimeContext) -> InterceptFn {
    Box::new(move |registry, op, stack| {
        let schema = registry.schema(op)?;
        if schema.has_any_alias_info() {
            return Err(DispatchError::ContractViolation {
                reason: format!(
                    "operation '{op}' declares alias/mutation annotations; \
                     the generic fallback only accepts alias-free schemas"
                ),
            });
        }
        let num_arguments = schema.args().len();
        let num_returns = schema.returns().len();
        let arguments_begin = stack.base_of_last(num_arguments)?;

        let mut any_tensor_inputs = false;
        let mut any_functional_inputs = false;
        let mut synced = 0usize;
        for (idx, arg) in schema.args().iter().enumerate() {
            if !matches!(
                arg.kind,
                ArgKind::Tensor | ArgKind::TensorList | ArgKind::OptionalTensorList
            ) {
                continue;
            }
            // A declared tensor argument counts even when the slot holds an
            // undefined tensor; only defined functional tensors get
            // unwrapped.
            any_tensor_inputs = true;
            let slot_index = arguments_begin + idx;
            let replacement = match stack.slot(slot_index)? {
                Value::Tensor(tensor) => {
                    if tensor.is_functional() {
                        any_functional_inputs = true;
                        Some(Value::Tensor(sync_and_unwrap_value(tensor, &mut synced)?))
                    } else {
                        None
                    }
                }
                Value::TensorList(tensors) => {
                    if tensors.iter().any(TensorValue::is_functional) {
                        any_functional_inputs = true;
                        let unwrapped = tensors
                            .iter()
                            .map(|tensor| sync_and_unwrap_value(tensor, &mut synced))
                            .collect::<Result<Vec<_>, _>>()?;
                        Some(Value::TensorList(unwrapped))
                    } else {
                        None
                    }
                }
                Value::OptionalTensorList(tensors) => {
                    let has_functional = tensors
                        .iter()
                        .flatten()
                        .any(TensorValue::is_functional);
                    if has_functional {
                        any_functional_inputs = true;
                        let unwrapped = tensors
                            .iter()
                            .map(|entry| {
                                entry
                                    .as_ref()
                                    .map(|tensor| sync_and_unwrap_value(tensor, &mut synced))
                                    .transpose()
                            })
                            .collect::<Result<Vec<_>, _>>()?;
                        Some(Value::OptionalTensorList(unwrapped))
                    } else {
                        None
                    }
                }
                _ => None,
            };
            if let Some(value) = replacement {
                stack.set_slot(slot_index, value)?;
            }
        }

        // A zero-tensor-input operation is a factory; its output enters the
        // functional regime so downstream consumers see a wrapped tensor.
        let should_wrap_outputs = !any_tensor_inputs || any_functional_inputs;
        if synced > 0 {
            ctx.record(
                EvidenceKind::Sync,
                format!("op={op} synchronized {synced} functional input(s)"),
            );
        }

        {
            let _guard = SkipFunctionalizeGuard::new();
            registry.call_physical(op, stack)?;
        }

        let returns_begin = stack.base_of_last(num_returns)?;
        if should_wrap_outputs {
            for idx in 0..num_returns {
                let slot_index = returns_begin + idx;
                let replacement = match stack.slot(slot_index)? {
                    Value::Tensor(TensorValue::Dense(tensor)) => Some(Value::Tensor(
                        TensorValue::Functional(FunctionalTensor::wrap(tensor.clone())),
                    )),
                    Value::TensorList(tensors) => Some(Value::TensorList(
                        tensors
                            .iter()
                            .map(|tensor| match tensor {
                                TensorValue::Dense(dense) => TensorValue::Functional(
                                    FunctionalTensor::wrap(dense.clone()),
                                ),
                                TensorValue::Functional(_) => tensor.clone(),
                            })
                            .collect(),
                    )),
                    Value::OptionalTensorList(tensors) => Some(Value::OptionalTensorList(
                        tensors
                            .iter()
                            .map(|entry| {
                                entry.as_ref().map(|tensor| match tensor {
                                    TensorValue::Dense(dense) => TensorValue::Functional(
                                        FunctionalTensor::wrap(dense.clone()),
                                    ),
                                    TensorValue::Functional(_) => tensor.clone(),
                                })
                            })
                            .collect(),
                    )),
                    // Undefined outputs stay unwrapped rather than becoming
                    // a wrapped null.
                    _ => None,
                };
                if let Some(value) = replacement {
                    stack.set_slot(slot_index, value)?;
                }
            }
        }

        ctx.record(
            EvidenceKind::Interception,
            format!(
                "op={op} any_tensor_inputs={any_tensor_inputs} \
                 any_functional_inputs={any_functional_inputs} \
                 wrap_outputs={should_wrap_outputs}"
            ),
        );
        Ok(())
    })
}

/// Dedicated handler for resize: shrinking is a view over existing storage,
/// growing is a genuine mutation that swaps the backing allocation.
#[must_use]
pub fn resize_handler(ctx: RuntimeContext) -> InterceptFn {
    Box::new(move |_registry, op, stack| {
        let arguments_begin = stack.base_of_last(3)?;
        let self_value = expect_tensor(stack, arguments_begin)?;
        let new_size = size_from_i64(&expect_int_list(stack, arguments_begin + 1)?)?;
        let memory_format = expect_memory_format(stack, arguments_begin + 2)?;

        let result = match &self_value {
            TensorValue::Dense(dense) => {
                // Outside the functional regime: plain in-place resize.
                let mut tensor = dense.clone();
                {
                    let _guard = SkipFunctionalizeGuard::new();
                    kernels::resize_in_place(&mut tensor, &new_size, memory_format)?;
                }
                TensorValue::Dense(tensor)
            }
            TensorValue::Functional(functional) => {
                let unwrapped = functional.sync_and_unwrap()?;
                let resized = {
                    let _guard = SkipFunctionalizeGuard::new();
                    kernels::resize(&unwrapped, &new_size, memory_format)?
                };

                let itemsize = unwrapped.meta().dtype().itemsize();
                let storage_offset = unwrapped.meta().storage_offset();
                let new_size_bytes =
                    storage_nbytes_contiguous(&new_size, itemsize, storage_offset).ok_or(
                        DispatchError::ContractViolation {
                            reason: format!("byte footprint overflow for size {new_size:?}"),
                        },
                    )?;

                if new_size_bytes > unwrapped.storage().nbytes() {
                    // Growth is a mutation: swap the wrapper's storage in
                    // place. Only legal with no outstanding derived views;
                    // replace_storage checks and fails closed.
                    functional.replace_storage(resized)?;
                    ctx.record(
                        EvidenceKind::Storage,
                        format!(
                            "op={op} growth to {new_size:?} bumped storage epoch to {}",
                            functional.storage_epoch()
                        ),
                    );
                } else {
                    // Shrink or equal: a re-view of existing storage,
                    // replayed as a contiguous sub-tensor. The reapply
                    // policy is baked in at descriptor construction.
                    let policy = ctx.config().reapply_views;
                    let forward_size = new_size.clone();
                    let reverse_size = new_size.clone();
                    let view_meta = ViewMeta::new(
                        "resize",
                        move |base| {
                            let strides = contiguous_strides(&forward_size);
                            let derived = match policy {
                                fz_runtime::ReapplyViewsPolicy::ZeroCopy => {
                                    kernels::as_strided(base, forward_size.clone(), strides)
                                }
                                fz_runtime::ReapplyViewsPolicy::Materialize => {
                                    kernels::as_strided_copy(base, forward_size.clone(), strides)
                                }
                            };
                            derived.map_err(|error| FunctionalError::Replay {
                                reason: error.to_string(),
                            })
                        },
                        move |base, mutated_view| {
                            let strides = contiguous_strides(&reverse_size);
                            kernels::as_strided_scatter(
                                base,
                                mutated_view,
                                reverse_size.clone(),
                                strides,
                            )
                            .map_err(|error| FunctionalError::Replay {
                                reason: error.to_string(),
                            })
                        },
                    );
                    functional.mutate_view_meta(view_meta);
                    ctx.record(
                        EvidenceKind::Interception,
                        format!("op={op} resize to {new_size:?} classified as view"),
                    );
                }
                TensorValue::Functional(functional.clone())
            }
        };

        stack.pop()?;
        stack.pop()?;
        stack.pop()?;
        stack.push(Value::Tensor(result));
        Ok(())
    })
}

/// Dedicated handler for lift: the unique entry point admitting a raw
/// tensor into the functional regime. No physical kernel runs.
#[must_use]
pub fn lift_handler(ctx: RuntimeContext) -> InterceptFn {
    Box::new(move |_registry, op, stack| {
        let arguments_begin = stack.base_of_last(1)?;
        let tensor = match expect_tensor(stack, arguments_begin)? {
            TensorValue::Functional(_) => {
                return Err(DispatchError::ContractViolation {
                    reason: format!("operation '{op}' requires a non-functional input tensor"),
                })
            }
            TensorValue::Dense(dense) => dense,
        };
        stack.pop()?;
        let wrapped = FunctionalTensor::wrap(tensor);
        ctx.record(
            EvidenceKind::Interception,
            format!("op={op} admitted tensor id={} into the functional regime", wrapped.id()),
        );
        stack.push(Value::Tensor(TensorValue::Functional(wrapped)));
        Ok(())
    })
}

/// Dedicated handler for the conversion copy that may cross the functional
/// boundary: when functionalization is excluded on this path and the target
/// device does not opt in, the raw copy escapes unwrapped.
#[must_use]
pub fn to_copy_handler(ctx: RuntimeContext) -> InterceptFn {
    Box::new(move |registry, op, stack| {
        let arguments_begin = stack.base_of_last(7)?;
        let self_value = expect_tensor(stack, arguments_begin)?;
        let target_device = expect_device_opt(stack, arguments_begin + 3)?;

        let self_device = match &self_value {
            TensorValue::Dense(dense) => dense.meta().device(),
            TensorValue::Functional(functional) => {
                let unwrapped = functional.sync_and_unwrap()?;
                let device = unwrapped.meta().device();
                stack.set_slot(
                    arguments_begin,
                    Value::Tensor(TensorValue::Dense(unwrapped)),
                )?;
                device
            }
        };

        {
            let _guard = SkipFunctionalizeGuard::new();
            registry.call_physical(op, stack)?;
        }

        // Functionalize excluded on this path means a lazy/graph backend is
        // driving; copying to a device outside the opt-in set ends the
        // functional regime here.
        if !functionalize_included()
            && !device_opted_into_functionalization(self_device, target_device)
        {
            ctx.record(
                EvidenceKind::Interception,
                format!("op={op} escaped functionalization (target={target_device:?})"),
            );
            return Ok(());
        }

        let return_index = stack.base_of_last(1)?;
        if let Value::Tensor(TensorValue::Dense(tensor)) = stack.slot(return_index)? {
            let wrapped = FunctionalTensor::wrap(tensor.clone());
            stack.set_slot(
                return_index,
                Value::Tensor(TensorValue::Functional(wrapped)),
            )?;
        }
        ctx.record(
            EvidenceKind::Interception,
            format!("op={op} wrapped conversion copy (target={target_device:?})"),
        );
        Ok(())
    })
}

/// Wire the functionalization pass into a registry: the fallback for every
/// operation under this interception key, plus the three dedicated
/// handlers, which take precedence over the fallback.
pub fn register_functionalization(
    registry: &mut OpRegistry,
    ctx: &RuntimeContext,
) -> Result<(), DispatchError> {
    registry.register_fallback(functionalize_fallback(ctx.clone()));
    registry.register_intercept(&OP_RESIZE, resize_handler(ctx.clone()))?;
    registry.register_intercept(&OP_LIFT, lift_handler(ctx.clone()))?;
    registry.register_intercept(&OP_TO_COPY, to_copy_handler(ctx.clone()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use fz_core::{DType, DenseTensor, Device, SyncState};
    use fz_dispatch::{
        ArgKind, ArgSpec, BoxedStack, DispatchError, ExcludeFunctionalizeGuard, OpId, OpRegistry,
        OpSchema, TensorValue, Value,
    };
    use fz_runtime::{
        EvidenceKind, FunctionalizeConfig, ReapplyViewsPolicy, RuntimeContext,
    };
    use proptest::prelude::*;

    use super::{
        device_opted_into_functionalization, register_default_ops, register_functionalization,
        OP_ADD, OP_FILL, OP_FULL, OP_LIFT, OP_RESIZE, OP_TO_COPY,
    };

    fn test_context(policy: ReapplyViewsPolicy) -> RuntimeContext {
        RuntimeContext::new(FunctionalizeConfig {
            reapply_views: policy,
        })
    }

    fn functional_registry(policy: ReapplyViewsPolicy) -> (OpRegistry, RuntimeContext) {
        let mut registry = OpRegistry::new();
        register_default_ops(&mut registry).expect("default ops should register");
        let ctx = test_context(policy);
        register_functionalization(&mut registry, &ctx)
            .expect("functionalization should register");
        (registry, ctx)
    }

    fn tensor_1d(values: &[f64]) -> DenseTensor {
        DenseTensor::from_values(vec![values.len()], values.to_vec(), DType::F64, Device::Cpu)
            .expect("1d tensor should build")
    }

    fn lift(registry: &OpRegistry, tensor: DenseTensor) -> fz_core::FunctionalTensor {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(TensorValue::Dense(tensor)));
        registry
            .call(&OP_LIFT, &mut stack)
            .expect("lift should succeed");
        match stack.pop().expect("lift should return") {
            Value::Tensor(TensorValue::Functional(functional)) => functional,
            other => panic!("lift returned {other:?}"),
        }
    }

    fn call_resize(
        registry: &OpRegistry,
        tensor: TensorValue,
        new_size: &[i64],
    ) -> Result<TensorValue, DispatchError> {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(tensor));
        stack.push(Value::IntList(new_size.to_vec()));
        stack.push(Value::MemoryFormatOpt(None));
        registry.call(&OP_RESIZE, &mut stack)?;
        match stack.pop()? {
            Value::Tensor(tensor) => Ok(tensor),
            other => panic!("resize returned {other:?}"),
        }
    }

    fn call_to_copy(
        registry: &OpRegistry,
        tensor: TensorValue,
        target_device: Option<Device>,
    ) -> TensorValue {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(tensor));
        stack.push(Value::DTypeOpt(None));
        stack.push(Value::None);
        stack.push(Value::DeviceOpt(target_device));
        stack.push(Value::BoolOpt(None));
        stack.push(Value::Bool(false));
        stack.push(Value::MemoryFormatOpt(None));
        registry
            .call(&OP_TO_COPY, &mut stack)
            .expect("to_copy should succeed");
        match stack.pop().expect("to_copy should return") {
            Value::Tensor(tensor) => tensor,
            other => panic!("to_copy returned {other:?}"),
        }
    }

    fn call_add(
        registry: &OpRegistry,
        lhs: TensorValue,
        rhs: TensorValue,
    ) -> TensorValue {
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(lhs));
        stack.push(Value::Tensor(rhs));
        registry.call(&OP_ADD, &mut stack).expect("add should succeed");
        match stack.pop().expect("add should return") {
            Value::Tensor(tensor) => tensor,
            other => panic!("add returned {other:?}"),
        }
    }

    fn unwrap_values(tensor: &TensorValue) -> Vec<f64> {
        match tensor {
            TensorValue::Dense(dense) => dense.contiguous_values().expect("values"),
            TensorValue::Functional(functional) => functional
                .sync_and_unwrap()
                .expect("sync should succeed")
                .contiguous_values()
                .expect("values"),
        }
    }

    #[test]
    fn opt_in_predicate_covers_lazy_kinds() {
        assert!(device_opted_into_functionalization(Device::Cpu, Some(Device::Xla)));
        assert!(device_opted_into_functionalization(Device::Cpu, Some(Device::Lazy)));
        assert!(!device_opted_into_functionalization(Device::Cpu, Some(Device::Cuda)));
        // Absent target defaults to the source device.
        assert!(device_opted_into_functionalization(Device::Lazy, None));
        assert!(!device_opted_into_functionalization(Device::Cpu, None));
    }

    #[test]
    fn fallback_round_trip_matches_raw_execution() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let lhs = tensor_1d(&[1.0, 2.0, 3.0]);
        let rhs = tensor_1d(&[10.0, 20.0, 30.0]);
        let raw = kernels_add(&lhs, &rhs);

        let wrapped_lhs = lift(&registry, lhs);
        let wrapped_rhs = lift(&registry, rhs);
        let out = call_add(
            &registry,
            TensorValue::Functional(wrapped_lhs),
            TensorValue::Functional(wrapped_rhs),
        );
        assert!(out.is_functional());
        assert_eq!(unwrap_values(&out), raw);
    }

    fn kernels_add(lhs: &DenseTensor, rhs: &DenseTensor) -> Vec<f64> {
        fz_kernel_cpu::add(lhs, rhs)
            .expect("raw add should succeed")
            .contiguous_values()
            .expect("values")
    }

    #[test]
    fn factory_output_enters_functional_regime() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let mut stack = BoxedStack::new();
        stack.push(Value::IntList(vec![2, 2]));
        stack.push(Value::Float(3.5));
        stack.push(Value::DTypeOpt(None));
        stack.push(Value::DeviceOpt(None));
        registry
            .call(&OP_FULL, &mut stack)
            .expect("factory should succeed");
        match stack.pop().expect("factory should return") {
            Value::Tensor(tensor) => {
                assert!(tensor.is_functional());
                assert_eq!(unwrap_values(&tensor), vec![3.5; 4]);
            }
            other => panic!("factory returned {other:?}"),
        }
    }

    #[test]
    fn fill_propagates_functionality_through_fallback() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0, 3.0]));
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(TensorValue::Functional(wrapped)));
        stack.push(Value::Float(4.0));
        registry
            .call(&OP_FILL, &mut stack)
            .expect("fill should succeed");
        match stack.pop().expect("fill should return") {
            Value::Tensor(tensor) => {
                assert!(tensor.is_functional());
                assert_eq!(unwrap_values(&tensor), vec![4.0; 3]);
            }
            other => panic!("fill returned {other:?}"),
        }
    }

    #[test]
    fn raw_inputs_produce_raw_outputs() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let out = call_add(
            &registry,
            TensorValue::Dense(tensor_1d(&[1.0])),
            TensorValue::Dense(tensor_1d(&[2.0])),
        );
        assert!(!out.is_functional());
        assert_eq!(unwrap_values(&out), vec![3.0]);
    }

    #[test]
    fn mixed_inputs_propagate_functionality() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0]));
        let out = call_add(
            &registry,
            TensorValue::Functional(wrapped),
            TensorValue::Dense(tensor_1d(&[5.0, 5.0])),
        );
        assert!(out.is_functional());
        assert_eq!(unwrap_values(&out), vec![6.0, 7.0]);
    }

    #[test]
    fn fallback_invokes_physical_kernel_exactly_once() {
        let mut registry = OpRegistry::new();
        register_default_ops(&mut registry).expect("default ops should register");
        let calls = Rc::new(Cell::new(0u32));
        let probe_calls = Rc::clone(&calls);
        registry
            .register_op(
                OpSchema::new(
                    "probe",
                    vec![ArgSpec::plain("self", ArgKind::Tensor)],
                    vec![ArgKind::Tensor],
                ),
                Box::new(move |stack| {
                    probe_calls.set(probe_calls.get() + 1);
                    let value = stack.pop()?;
                    stack.push(value);
                    Ok(())
                }),
            )
            .expect("probe should register");
        let ctx = test_context(ReapplyViewsPolicy::ZeroCopy);
        register_functionalization(&mut registry, &ctx).expect("registration should succeed");

        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(TensorValue::Dense(tensor_1d(&[1.0]))));
        registry
            .call(&OpId::new("probe"), &mut stack)
            .expect("probe call should succeed");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn fallback_rejects_alias_annotated_schema() {
        let mut registry = OpRegistry::new();
        register_default_ops(&mut registry).expect("default ops should register");
        registry
            .register_op(
                OpSchema::new(
                    "mutating_probe",
                    vec![ArgSpec::aliased("self", ArgKind::Tensor, true)],
                    vec![ArgKind::Tensor],
                ),
                Box::new(|_stack| Ok(())),
            )
            .expect("probe should register");
        let ctx = test_context(ReapplyViewsPolicy::ZeroCopy);
        register_functionalization(&mut registry, &ctx).expect("registration should succeed");

        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(TensorValue::Dense(tensor_1d(&[1.0]))));
        let err = registry
            .call(&OpId::new("mutating_probe"), &mut stack)
            .expect_err("alias-annotated op must not reach the fallback");
        assert!(matches!(err, DispatchError::ContractViolation { .. }));
    }

    #[test]
    fn fallback_skips_wrapping_undefined_outputs() {
        let mut registry = OpRegistry::new();
        register_default_ops(&mut registry).expect("default ops should register");
        registry
            .register_op(
                OpSchema::new("make_nothing", vec![], vec![ArgKind::Tensor]),
                Box::new(|stack| {
                    stack.push(Value::None);
                    Ok(())
                }),
            )
            .expect("op should register");
        let ctx = test_context(ReapplyViewsPolicy::ZeroCopy);
        register_functionalization(&mut registry, &ctx).expect("registration should succeed");

        let mut stack = BoxedStack::new();
        registry
            .call(&OpId::new("make_nothing"), &mut stack)
            .expect("call should succeed");
        assert!(matches!(stack.pop().expect("return"), Value::None));
    }

    #[test]
    fn undefined_tensor_input_keeps_outputs_raw() {
        let mut registry = OpRegistry::new();
        register_default_ops(&mut registry).expect("default ops should register");
        registry
            .register_op(
                OpSchema::new(
                    "maybe_make",
                    vec![ArgSpec::plain("self", ArgKind::Tensor)],
                    vec![ArgKind::Tensor],
                ),
                Box::new(|stack| {
                    stack.pop()?;
                    stack.push(Value::Tensor(TensorValue::Dense(tensor_1d(&[1.0]))));
                    Ok(())
                }),
            )
            .expect("op should register");
        let ctx = test_context(ReapplyViewsPolicy::ZeroCopy);
        register_functionalization(&mut registry, &ctx).expect("registration should succeed");

        // An undefined self is still a tensor input: the op is not a
        // factory, so its output stays raw.
        let mut stack = BoxedStack::new();
        stack.push(Value::None);
        registry
            .call(&OpId::new("maybe_make"), &mut stack)
            .expect("call should succeed");
        match stack.pop().expect("return") {
            Value::Tensor(tensor) => assert!(!tensor.is_functional()),
            other => panic!("unexpected return {other:?}"),
        }
    }

    #[test]
    fn tensor_list_arguments_unwrap_and_rewrap() {
        let mut registry = OpRegistry::new();
        register_default_ops(&mut registry).expect("default ops should register");
        registry
            .register_op(
                OpSchema::new(
                    "stack_first",
                    vec![ArgSpec::plain("tensors", ArgKind::TensorList)],
                    vec![ArgKind::Tensor],
                ),
                Box::new(|stack| {
                    let list = match stack.pop()? {
                        Value::TensorList(list) => list,
                        _ => {
                            return Err(DispatchError::SlotKindMismatch {
                                slot: 0,
                                expected: "tensor list",
                            })
                        }
                    };
                    let first = list.first().cloned().ok_or(DispatchError::StackUnderflow {
                        needed: 1,
                        available: 0,
                    })?;
                    let dense = first.as_dense()?.clone();
                    stack.push(Value::Tensor(TensorValue::Dense(dense)));
                    Ok(())
                }),
            )
            .expect("op should register");
        let ctx = test_context(ReapplyViewsPolicy::ZeroCopy);
        register_functionalization(&mut registry, &ctx).expect("registration should succeed");

        let wrapped = fz_core::FunctionalTensor::wrap(tensor_1d(&[7.0]));
        let mut stack = BoxedStack::new();
        stack.push(Value::TensorList(vec![
            TensorValue::Functional(wrapped),
            TensorValue::Dense(tensor_1d(&[8.0])),
        ]));
        registry
            .call(&OpId::new("stack_first"), &mut stack)
            .expect("call should succeed");
        match stack.pop().expect("return") {
            Value::Tensor(tensor) => {
                assert!(tensor.is_functional());
                assert_eq!(unwrap_values(&tensor), vec![7.0]);
            }
            other => panic!("unexpected return {other:?}"),
        }
    }

    #[test]
    fn resize_growth_keeps_identity_and_bumps_epoch() {
        let (registry, ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0]));
        let out = call_resize(
            &registry,
            TensorValue::Functional(wrapped.clone()),
            &[4],
        )
        .expect("growth resize should succeed");

        let out = out.as_functional().expect("growth keeps functional").clone();
        assert!(out.same_handle(&wrapped));
        assert_eq!(wrapped.storage_epoch(), 1);
        assert_eq!(wrapped.view_chain_len(), 0);
        assert_eq!(
            unwrap_values(&TensorValue::Functional(wrapped)),
            vec![1.0, 2.0, 0.0, 0.0]
        );
        assert_eq!(ctx.evidence_count_of(EvidenceKind::Storage), 1);
    }

    #[test]
    fn resize_shrink_is_a_view_descriptor() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0, 3.0, 4.0]));
        let out = call_resize(
            &registry,
            TensorValue::Functional(wrapped.clone()),
            &[2],
        )
        .expect("shrink resize should succeed");

        let out = out.as_functional().expect("shrink keeps functional").clone();
        assert!(out.same_handle(&wrapped));
        assert_eq!(wrapped.storage_epoch(), 0);
        assert_eq!(wrapped.view_chain_len(), 1);
        assert_eq!(wrapped.sync_state(), SyncState::Dirty);
        assert_eq!(
            unwrap_values(&TensorValue::Functional(wrapped.clone())),
            vec![1.0, 2.0]
        );
        assert_eq!(wrapped.sync_state(), SyncState::Clean);
    }

    #[test]
    fn resize_equal_size_is_also_a_view() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0]));
        call_resize(&registry, TensorValue::Functional(wrapped.clone()), &[2])
            .expect("equal resize should succeed");
        assert_eq!(wrapped.view_chain_len(), 1);
        assert_eq!(wrapped.storage_epoch(), 0);
    }

    #[test]
    fn resize_growth_with_outstanding_views_fails_closed() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0, 3.0, 4.0]));
        call_resize(&registry, TensorValue::Functional(wrapped.clone()), &[2])
            .expect("shrink should succeed");
        let err = call_resize(&registry, TensorValue::Functional(wrapped), &[8])
            .expect_err("growth over outstanding views must fail");
        assert!(matches!(err, DispatchError::Functional(_)));
    }

    #[test]
    fn resize_zero_copy_policy_shares_base_storage() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0, 3.0]));
        call_resize(&registry, TensorValue::Functional(wrapped.clone()), &[2])
            .expect("shrink should succeed");
        let synced = wrapped.sync_and_unwrap().expect("sync");
        assert!(synced
            .storage()
            .shares_allocation(wrapped.base_snapshot().storage()));
    }

    #[test]
    fn resize_materialize_policy_detaches_storage() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::Materialize);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0, 3.0]));
        call_resize(&registry, TensorValue::Functional(wrapped.clone()), &[2])
            .expect("shrink should succeed");
        let synced = wrapped.sync_and_unwrap().expect("sync");
        assert!(!synced
            .storage()
            .shares_allocation(wrapped.base_snapshot().storage()));
        assert_eq!(
            synced.contiguous_values().expect("values"),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn resize_passthrough_for_raw_tensor() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let tensor = tensor_1d(&[1.0, 2.0, 3.0, 4.0]);
        let storage_id = tensor.storage().id();
        let out = call_resize(&registry, TensorValue::Dense(tensor), &[2])
            .expect("raw resize should succeed");
        match out {
            TensorValue::Dense(dense) => {
                assert_eq!(dense.storage().id(), storage_id);
                assert_eq!(dense.contiguous_values().expect("values"), vec![1.0, 2.0]);
            }
            TensorValue::Functional(_) => panic!("raw resize must stay raw"),
        }
    }

    #[test]
    fn lift_wraps_raw_tensor() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[5.0]));
        assert_eq!(wrapped.sync_state(), SyncState::Clean);
        assert_eq!(wrapped.view_chain_len(), 0);
    }

    #[test]
    fn lift_rejects_already_functional_tensor() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[5.0]));
        let mut stack = BoxedStack::new();
        stack.push(Value::Tensor(TensorValue::Functional(wrapped)));
        let err = registry
            .call(&OP_LIFT, &mut stack)
            .expect_err("double lift must fail");
        assert!(matches!(err, DispatchError::ContractViolation { .. }));
    }

    #[test]
    fn to_copy_wraps_when_functionalize_included() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let out = call_to_copy(
            &registry,
            TensorValue::Dense(tensor_1d(&[1.0, 2.0])),
            Some(Device::Cuda),
        );
        assert!(out.is_functional());
        assert_eq!(unwrap_values(&out), vec![1.0, 2.0]);
    }

    #[test]
    fn to_copy_escapes_when_excluded_and_target_not_opted_in() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0, 2.0]));
        let _guard = ExcludeFunctionalizeGuard::new();
        let out = call_to_copy(
            &registry,
            TensorValue::Functional(wrapped),
            Some(Device::Cpu),
        );
        assert!(!out.is_functional());
        assert_eq!(unwrap_values(&out), vec![1.0, 2.0]);
    }

    #[test]
    fn to_copy_wraps_for_opted_in_target_even_when_excluded() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let _guard = ExcludeFunctionalizeGuard::new();
        let out = call_to_copy(
            &registry,
            TensorValue::Dense(tensor_1d(&[3.0])),
            Some(Device::Lazy),
        );
        assert!(out.is_functional());
    }

    #[test]
    fn to_copy_escape_defaults_target_to_source_device() {
        let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let lazy_src = DenseTensor::from_values(vec![1], vec![4.0], DType::F64, Device::Lazy)
            .expect("tensor should build");
        let _guard = ExcludeFunctionalizeGuard::new();
        let out = call_to_copy(&registry, TensorValue::Dense(lazy_src), None);
        assert!(out.is_functional());
    }

    #[test]
    fn sync_evidence_is_recorded_for_functional_inputs() {
        let (registry, ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
        let wrapped = lift(&registry, tensor_1d(&[1.0]));
        call_add(
            &registry,
            TensorValue::Functional(wrapped),
            TensorValue::Dense(tensor_1d(&[1.0])),
        );
        assert_eq!(ctx.evidence_count_of(EvidenceKind::Sync), 1);
        assert!(ctx.evidence_count_of(EvidenceKind::Interception) >= 1);
    }

    proptest! {
        #[test]
        fn prop_fallback_round_trip_bit_identical(
            values in prop::collection::vec(-1e6f64..1e6, 1..=12),
        ) {
            let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
            let lhs = tensor_1d(&values);
            let rhs = tensor_1d(&values);
            let raw = kernels_add(&lhs, &rhs);

            let out = call_add(
                &registry,
                TensorValue::Functional(lift(&registry, lhs)),
                TensorValue::Functional(lift(&registry, rhs)),
            );
            let observed = unwrap_values(&out);
            prop_assert_eq!(observed.len(), raw.len());
            for (a, b) in observed.iter().zip(raw.iter()) {
                prop_assert_eq!(a.to_bits(), b.to_bits());
            }
        }

        #[test]
        fn prop_resize_shrink_equals_contiguous_prefix(
            values in prop::collection::vec(-100.0f64..100.0, 2..=10),
            keep_ratio in 0.1f64..=1.0,
        ) {
            let keep = ((values.len() as f64 * keep_ratio) as usize).max(1);
            let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
            let wrapped = lift(&registry, tensor_1d(&values));
            call_resize(
                &registry,
                TensorValue::Functional(wrapped.clone()),
                &[keep as i64],
            )
            .expect("shrink should succeed");

            let observed = unwrap_values(&TensorValue::Functional(wrapped));
            prop_assert_eq!(observed, values[..keep].to_vec());
        }

        #[test]
        fn prop_resize_growth_zero_fills_tail(
            values in prop::collection::vec(-100.0f64..100.0, 1..=6),
            extra in 1usize..=6,
        ) {
            let (registry, _ctx) = functional_registry(ReapplyViewsPolicy::ZeroCopy);
            let wrapped = lift(&registry, tensor_1d(&values));
            let target = values.len() + extra;
            call_resize(
                &registry,
                TensorValue::Functional(wrapped.clone()),
                &[target as i64],
            )
            .expect("growth should succeed");

            prop_assert_eq!(wrapped.storage_epoch(), 1);
            prop_assert_eq!(wrapped.view_chain_len(), 0);
            let mut expected = values.clone();
            expected.resize(target, 0.0);
            prop_assert_eq!(
                unwrap_values(&TensorValue::Functional(wrapped)),
                expected
            );
        }
    }
}
