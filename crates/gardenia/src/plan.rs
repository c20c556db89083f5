//! Tape planning: a symbolic pass over a function body that decides which
//! intermediate values the backward pass will need, and lays out the
//! per-function tape struct that will carry them.
//!
//! The planner walks the body once, abstracting every subexpression into a
//! [`Value`]. Locals are tracked SSA-style: a `local.set` rebinds the
//! variable to the abstract value of its right-hand side, and the first
//! `local.get` of an untouched variable becomes the expression the tape
//! records if that value is ever needed.

use std::collections::HashMap;

use crate::{
    ErrorImpl,
    ir::{self, Expr, ExprId, Func, HeapDef, HeapId, Literal, RefType, ValType},
    types::TypeMapper,
    util::u32_to_usize,
};

/// The abstract value of a subexpression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// An unevaluated initial local binding.
    Param,
    /// No value; the expression is in statement position.
    Void,
    /// A numeric literal known at plan time.
    Const(Literal),
    /// The value of the given expression node.
    Expr(ExprId),
}

/// How the backward pass obtains a primal or gradient value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Load {
    Const(Literal),
    Field(u32),
}

/// The planning result for one function.
#[derive(Debug, Default, PartialEq)]
pub struct TapePlan {
    /// Type of each tape struct field, indexed by field number.
    pub fields: Vec<ValType>,
    /// Forward-pass expressions whose value is teed into a tape field.
    pub stores: HashMap<ExprId, u32>,
    /// Expressions whose in-forward gradient value is saved into a tape field.
    pub grads: HashMap<ExprId, u32>,
    /// For each differentiating `array.set`, the field holding the overwritten
    /// element's gradient prior to the store.
    pub sets: HashMap<ExprId, u32>,
    /// The field holding the callee's sub-tape for each call site.
    pub calls: HashMap<ExprId, u32>,
    /// For every backward-pass use of a primal, how to obtain it.
    pub loads: HashMap<ExprId, Load>,
    /// Like `loads`, for gradients that must be reloaded.
    pub grad_loads: HashMap<ExprId, Load>,
}

/// Plan one function. `tapes` maps every function index to its (possibly not
/// yet filled-in) tape struct type, so call sites can type their sub-tape
/// fields before the callee has been planned.
pub fn function(
    types: &mut Vec<HeapDef>,
    mapper: &mut TypeMapper,
    funcs: &[Func],
    tapes: &[HeapId],
    index: u32,
) -> crate::Result<TapePlan> {
    let func = &funcs[u32_to_usize(index)];
    let name = match &func.name {
        Some(name) => name.clone(),
        None => index.to_string(),
    };
    let mut planner = Planner {
        types,
        mapper,
        tapes,
        func,
        name,
        vars: vec![Value::Param; func.locals.len()],
        plan: TapePlan::default(),
        store_fields: HashMap::new(),
        grad_fields: HashMap::new(),
    };
    planner.plan(func.body)?;
    Ok(planner.plan)
}

struct Planner<'a> {
    types: &'a mut Vec<HeapDef>,
    mapper: &'a mut TypeMapper,
    tapes: &'a [HeapId],
    func: &'a Func,
    name: String,
    vars: Vec<Value>,
    plan: TapePlan,
    /// Tape field already allocated for a stored expression.
    store_fields: HashMap<ExprId, u32>,
    /// Tape field already allocated for an expression's gradient.
    grad_fields: HashMap<ExprId, u32>,
}

impl Planner<'_> {
    fn plan(&mut self, e: ExprId) -> crate::Result<Value> {
        match *self.func.expr(e) {
            Expr::Block(ref children) => {
                let mut value = Value::Void;
                for &child in children.iter() {
                    value = self.plan(child)?;
                }
                Ok(value)
            }
            Expr::Const(literal) => Ok(Value::Const(literal)),
            Expr::LocalGet(local) => {
                let i = u32_to_usize(local);
                if let Value::Param = self.vars[i] {
                    // Lift the unevaluated binding to this first read, so the
                    // read becomes the tape source for later uses.
                    self.vars[i] = Value::Expr(e);
                }
                Ok(self.vars[i])
            }
            Expr::LocalSet { local, value } => {
                let v = self.plan(value)?;
                self.vars[u32_to_usize(local)] = v;
                Ok(Value::Void)
            }
            Expr::LocalTee { local, value } => {
                let v = self.plan(value)?;
                self.vars[u32_to_usize(local)] = v;
                Ok(v)
            }
            Expr::Binary { op, left, right } => {
                if !op.is_float() {
                    self.plan(left)?;
                    self.plan(right)?;
                    return Ok(Value::Expr(e));
                }
                use crate::ir::BinaryOp::*;
                match op {
                    F32Add | F64Add | F32Sub | F64Sub => {
                        // Neither operand's primal appears in the reverse
                        // rule.
                        self.plan(left)?;
                        self.plan(right)?;
                    }
                    F32Mul | F64Mul => {
                        self.save(left)?;
                        self.save(right)?;
                    }
                    F32Div | F64Div => {
                        // The reverse rule reads the divisor and the quotient
                        // itself.
                        self.plan(left)?;
                        self.save(right)?;
                        self.mark(e, Value::Expr(e))?;
                    }
                    _ => unreachable!("integer operators are filtered above"),
                }
                Ok(Value::Expr(e))
            }
            Expr::Call { target, ref operands } => {
                for &operand in operands.iter() {
                    self.plan(operand)?;
                }
                let tape = *self.tapes.get(u32_to_usize(target)).ok_or_else(|| {
                    ErrorImpl::UnresolvedName {
                        func: self.name.clone(),
                        target,
                    }
                })?;
                let field = self.field(ValType::Ref(RefType {
                    nullable: false,
                    heap: tape,
                }));
                self.plan.calls.insert(e, field);
                Ok(Value::Expr(e))
            }
            Expr::StructNew { ref operands, .. } => {
                if !operands.is_empty() {
                    return Err(ErrorImpl::InvalidInit {
                        func: self.name.clone(),
                    });
                }
                Ok(Value::Expr(e))
            }
            Expr::StructNewDefault { .. } => Ok(Value::Expr(e)),
            Expr::ArrayNewDefault { size, .. } => {
                self.plan(size)?;
                Ok(Value::Expr(e))
            }
            Expr::ArrayGet { ty, array, index } => {
                self.plan(array)?;
                let elem = ir::array_elem(self.types, ty).ty;
                if TypeMapper::differentiable(elem) {
                    self.mark_grad(array)?;
                    self.save(index)?;
                } else {
                    self.plan(index)?;
                }
                Ok(Value::Expr(e))
            }
            Expr::ArraySet { ty, array, index, value } => {
                self.plan(array)?;
                // The index is saved even when the element gradient is empty;
                // the tape is correct, not minimal.
                self.save(index)?;
                self.plan(value)?;
                let elem = ir::array_elem(self.types, ty).ty;
                let grad = self.mapper.value(self.types, &self.name, elem)?;
                if let Some(grad) = grad {
                    self.mark_grad(array)?;
                    self.mark_grad(value)?;
                    let field = self.field(grad);
                    self.plan.sets.insert(e, field);
                }
                Ok(Value::Void)
            }
            Expr::ArrayLen(array) => {
                self.plan(array)?;
                Ok(Value::Expr(e))
            }
            Expr::TupleMake(ref children) => {
                for &child in children.iter() {
                    self.plan(child)?;
                }
                Ok(Value::Expr(e))
            }
            Expr::StructGet { .. }
            | Expr::TupleExtract { .. }
            | Expr::RefNull(_) => Err(ErrorImpl::UnsupportedExpression {
                func: self.name.clone(),
                what: format!("{:?}", self.func.expr(e)),
            }),
        }
    }

    /// Record that the backward pass will need `value` at `at`.
    fn mark(&mut self, at: ExprId, value: Value) -> crate::Result<()> {
        match value {
            Value::Const(literal) => {
                self.plan.loads.insert(at, Load::Const(literal));
                Ok(())
            }
            Value::Expr(stored) => {
                let field = match self.store_fields.get(&stored) {
                    Some(&field) => field,
                    None => {
                        let ty = self.single_ty(stored)?;
                        let field = self.field(ty);
                        self.store_fields.insert(stored, field);
                        self.plan.stores.insert(stored, field);
                        field
                    }
                };
                self.plan.loads.insert(at, Load::Field(field));
                Ok(())
            }
            Value::Param | Value::Void => Err(ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "marked a value with no expression",
            }),
        }
    }

    /// Plan a subexpression and mark its value for tape storage.
    fn save(&mut self, e: ExprId) -> crate::Result<()> {
        let value = self.plan(e)?;
        self.mark(e, value)
    }

    /// Allocate (or reuse) a tape field for the gradient of `e`, to be saved
    /// during the forward pass and reloaded in the backward pass.
    fn mark_grad(&mut self, e: ExprId) -> crate::Result<()> {
        let field = match self.grad_fields.get(&e) {
            Some(&field) => field,
            None => {
                let ty = self.single_ty(e)?;
                let grad = self.mapper.value(self.types, &self.name, ty)?.ok_or(
                    ErrorImpl::InternalInvariant {
                        func: self.name.clone(),
                        msg: "requested the gradient of a gradient-free value",
                    },
                )?;
                let field = self.field(grad);
                self.grad_fields.insert(e, field);
                self.plan.grads.insert(e, field);
                field
            }
        };
        self.plan.grad_loads.insert(e, Load::Field(field));
        Ok(())
    }

    fn field(&mut self, ty: ValType) -> u32 {
        let i = u32::try_from(self.plan.fields.len()).unwrap();
        self.plan.fields.push(ty);
        i
    }

    fn single_ty(&self, e: ExprId) -> crate::Result<ValType> {
        match self.func.ty(e) {
            [ty] => Ok(*ty),
            _ => Err(ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "taped a value that is not single-valued",
            }),
        }
    }
}
