//! Paired emission of the forward and backward passes from a tape plan.
//!
//! Every original expression is translated once, yielding the forward
//! expression for its primal, a forward local holding its in-forward gradient
//! (materialized for values like gradient arrays that downstream code must
//! see), and a backward local accumulating its reverse-mode gradient. The
//! backward body is collected forward and reversed en bloc; each expression
//! contributes at most one block so reversal preserves its internal order.

use std::collections::HashMap;

use crate::{
    ErrorImpl,
    ir::{
        self, BinaryOp, Expr, ExprId, Func, FuncSig, HeapDef, HeapId, Literal, RefType, Tuple,
        ValType,
    },
    plan::{Load, TapePlan},
    types::TypeMapper,
    util::u32_to_usize,
};

pub struct Pair {
    pub fwd: Func,
    pub bwd: Func,
}

/// Local indices tracking one original local across the two new functions.
#[derive(Clone, Copy)]
struct Var {
    /// The primal copy in the forward pass.
    fwd: u32,
    /// The in-forward gradient copy, when the gradient type is nonempty.
    grad: Option<u32>,
    /// The accumulating gradient in the backward pass, rewritten after each
    /// store to mimic SSA in the reversed body.
    bwd: Option<u32>,
}

/// The translation of one expression.
struct Emit {
    fwd: ExprId,
    /// Forward gradient local per primal result component.
    grad: Box<[Option<u32>]>,
    /// Backward accumulator local per primal result component.
    bwd: Box<[Option<u32>]>,
}

impl Emit {
    fn value(fwd: ExprId, grad: Option<u32>, bwd: Option<u32>) -> Self {
        Self {
            fwd,
            grad: Box::new([grad]),
            bwd: Box::new([bwd]),
        }
    }

    fn void(fwd: ExprId) -> Self {
        Self {
            fwd,
            grad: Box::new([]),
            bwd: Box::new([]),
        }
    }

    fn grad1(&self) -> Option<u32> {
        self.grad.first().copied().flatten()
    }

    fn bwd1(&self) -> Option<u32> {
        self.bwd.first().copied().flatten()
    }
}

/// Generate the forward and backward passes for the function at `index`.
///
/// `num_funcs` is the original function count; pairs are appended after the
/// originals, so the forward and backward passes of function `i` live at
/// `num_funcs + 2 * i` and `num_funcs + 2 * i + 1`.
pub fn function(
    types: &mut Vec<HeapDef>,
    mapper: &mut TypeMapper,
    funcs: &[Func],
    tapes: &[HeapId],
    plans: &[TapePlan],
    index: u32,
    num_funcs: u32,
) -> crate::Result<Pair> {
    let src = &funcs[u32_to_usize(index)];
    let name = match &src.name {
        Some(name) => name.clone(),
        None => index.to_string(),
    };
    let (params, results) = match &types[u32_to_usize(src.sig)] {
        HeapDef::Func(sig) => (sig.params.clone(), sig.results.clone()),
        _ => {
            return Err(ErrorImpl::InternalInvariant {
                func: name,
                msg: "function signature is not a func type",
            });
        }
    };
    let gparams = mapper.tuple(types, &name, &params)?;
    let gresults = mapper.tuple(types, &name, &results)?;
    let tape_ref = ValType::Ref(RefType {
        nullable: false,
        heap: tapes[u32_to_usize(index)],
    });

    let fwd_sig = FuncSig {
        params: concat(&[&params, &gparams]),
        results: concat(&[&results, &gresults, &[tape_ref]]),
    };
    let bwd_sig = FuncSig {
        params: concat(&[&gparams, &gresults, &[tape_ref]]),
        results: gparams.clone(),
    };
    let fwd_sig_id = push_type(types, HeapDef::Func(fwd_sig));
    let bwd_sig_id = push_type(types, HeapDef::Func(bwd_sig));

    let mut fwd = Func::new(fwd_sig_id);
    let mut bwd = Func::new(bwd_sig_id);

    // Forward parameters: the original parameters, then their gradients.
    for &p in params.iter() {
        fwd.local([p]);
    }
    let mut fwd_grad_params = Vec::new();
    for &g in gparams.iter() {
        fwd_grad_params.push(fwd.local([g]));
    }
    // Backward parameters: input gradients, result gradients, then the tape.
    let mut bwd_grad_params = Vec::new();
    for &g in gparams.iter() {
        bwd_grad_params.push(bwd.local([g]));
    }
    for &g in gresults.iter() {
        bwd.local([g]);
    }
    let tape_param = bwd.local([tape_ref]);

    let mut gen = Generate {
        types,
        mapper,
        funcs,
        tapes,
        plan: &plans[u32_to_usize(index)],
        src,
        name: name.clone(),
        num_funcs,
        fwd,
        bwd,
        vars: Vec::new(),
        fwd_fields: Vec::new(),
        bwd_fields: Vec::new(),
        stmts: Vec::new(),
        zeros: HashMap::new(),
    };

    let np = params.len();
    let mut grad_pos = 0;
    for (i, local) in src.locals.iter().enumerate() {
        let ty = match **local {
            [ty] => ty,
            _ => {
                return Err(ErrorImpl::InternalInvariant {
                    func: name.clone(),
                    msg: "input function has a multivalue local",
                });
            }
        };
        let gty = gen.mapper.value(gen.types, &gen.name, ty)?;
        let var = if i < np {
            let (grad, bwd) = match gty {
                Some(_) => {
                    let slot = grad_pos;
                    grad_pos += 1;
                    (
                        Some(fwd_grad_params[slot]),
                        ty.is_float().then(|| bwd_grad_params[slot]),
                    )
                }
                None => (None, None),
            };
            Var {
                fwd: u32::try_from(i).unwrap(),
                grad,
                bwd,
            }
        } else {
            Var {
                fwd: gen.fwd.local([ty]),
                grad: gty.map(|g| gen.fwd.local([g])),
                bwd: ty.is_float().then(|| gen.bwd.local([ty])),
            }
        };
        gen.vars.push(var);
    }
    for &field in &gen.plan.fields {
        gen.fwd_fields.push(gen.fwd.local([field]));
        gen.bwd_fields.push(gen.bwd.local([field]));
    }

    let body = gen.expr(src.body)?;
    gen.assemble(body, &params, &results, &gresults, tape_ref, index, tape_param)?;

    Ok(Pair {
        fwd: gen.fwd,
        bwd: gen.bwd,
    })
}

fn concat(parts: &[&[ValType]]) -> Tuple {
    parts
        .iter()
        .flat_map(|part| part.iter().copied())
        .collect::<Vec<ValType>>()
        .into()
}

fn push_type(types: &mut Vec<HeapDef>, def: HeapDef) -> HeapId {
    let id = u32::try_from(types.len()).unwrap();
    types.push(def);
    id
}

struct Generate<'a> {
    types: &'a mut Vec<HeapDef>,
    mapper: &'a mut TypeMapper,
    funcs: &'a [Func],
    tapes: &'a [HeapId],
    plan: &'a TapePlan,
    src: &'a Func,
    name: String,
    num_funcs: u32,
    fwd: Func,
    bwd: Func,
    vars: Vec<Var>,
    /// Forward local receiving each tape field's value.
    fwd_fields: Vec<u32>,
    /// Backward local each tape field is reloaded into on entry.
    bwd_fields: Vec<u32>,
    /// Backward statements in forward order; reversed at assembly.
    stmts: Vec<ExprId>,
    /// Lazily created zero-valued forward locals, one per float type.
    zeros: HashMap<ValType, u32>,
}

impl Generate<'_> {
    fn expr(&mut self, e: ExprId) -> crate::Result<Emit> {
        let emit = self.expr_inner(e)?;
        self.store(e, emit)
    }

    fn expr_inner(&mut self, e: ExprId) -> crate::Result<Emit> {
        match self.src.expr(e).clone() {
            Expr::Block(children) => {
                let mut emitted = Vec::with_capacity(children.len());
                let mut last = None;
                for &child in children.iter() {
                    let em = self.expr(child)?;
                    emitted.push(em.fwd);
                    last = Some(em);
                }
                let ty: Tuple = self.src.ty(e).into();
                let fwd = self.fwd.push(Expr::Block(emitted.into()), ty);
                Ok(match last {
                    Some(em) => Emit {
                        fwd,
                        grad: em.grad,
                        bwd: em.bwd,
                    },
                    None => Emit::void(fwd),
                })
            }
            Expr::Const(literal) => {
                let fwd = self.fwd.push(Expr::Const(literal), [literal.ty()]);
                if !literal.ty().is_float() {
                    return Ok(Emit::value(fwd, None, None));
                }
                let grad = self.zero(literal.ty());
                let bwd = match self.plan.grad_loads.get(&e) {
                    Some(&Load::Field(i)) => {
                        if !literal.is_zero() {
                            return Err(ErrorImpl::NonZeroGradientConstant {
                                func: self.name.clone(),
                            });
                        }
                        self.bwd_fields[u32_to_usize(i)]
                    }
                    _ => self.bwd.local([literal.ty()]),
                };
                Ok(Emit::value(fwd, Some(grad), Some(bwd)))
            }
            Expr::LocalGet(local) => {
                let var = self.vars[u32_to_usize(local)];
                let ty = self.local_ty(local)?;
                let fwd = self.fwd.push(Expr::LocalGet(var.fwd), [ty]);
                Ok(Emit::value(fwd, var.grad, var.bwd))
            }
            Expr::LocalSet { local, value } => {
                let fwd = self.assign(local, value)?;
                Ok(Emit::void(fwd))
            }
            Expr::LocalTee { local, value } => {
                let set = self.assign(local, value)?;
                let var = self.vars[u32_to_usize(local)];
                let ty = self.local_ty(local)?;
                let get = self.fwd.push(Expr::LocalGet(var.fwd), [ty]);
                let fwd = self.fwd.push(Expr::Block(Box::new([set, get])), [ty]);
                Ok(Emit::value(fwd, var.grad, var.bwd))
            }
            Expr::Binary { op, left, right } => {
                let el = self.expr(left)?;
                let er = self.expr(right)?;
                let fwd = self.fwd.push(
                    Expr::Binary {
                        op,
                        left: el.fwd,
                        right: er.fwd,
                    },
                    [op.result()],
                );
                if !op.is_float() {
                    return Ok(Emit::value(fwd, None, None));
                }
                let ty = op.result();
                let dl = self.bwd1(&el)?;
                let dr = self.bwd1(&er)?;
                let dz = self.bwd.local([ty]);
                use BinaryOp::*;
                let block = match op {
                    F32Add | F64Add => {
                        let a = self.accumulate(dl, ty, |g| g.bwd_get(dz, ty))?;
                        let b = self.accumulate(dr, ty, |g| g.bwd_get(dz, ty))?;
                        vec![a, b]
                    }
                    F32Sub | F64Sub => {
                        let a = self.accumulate(dl, ty, |g| g.bwd_get(dz, ty))?;
                        let b = self.deduct(dr, ty, |g| g.bwd_get(dz, ty))?;
                        vec![a, b]
                    }
                    F32Mul | F64Mul => {
                        let a = self.accumulate(dl, ty, |g| {
                            let x = g.bwd_get(dz, ty)?;
                            let y = g.load_of(right, ty)?;
                            Ok(g.bwd_binary(BinaryOp::mul(ty), x, y))
                        })?;
                        let b = self.accumulate(dr, ty, |g| {
                            let x = g.bwd_get(dz, ty)?;
                            let y = g.load_of(left, ty)?;
                            Ok(g.bwd_binary(BinaryOp::mul(ty), x, y))
                        })?;
                        vec![a, b]
                    }
                    F32Div | F64Div => {
                        // dx1 = dz / y; dx += dx1; dy -= dx1 * z, where y and
                        // z come off the tape.
                        let dx1 = self.bwd.local([ty]);
                        let quotient = {
                            let x = self.bwd_get(dz, ty)?;
                            let y = self.load_of(right, ty)?;
                            self.bwd_binary(BinaryOp::div(ty), x, y)
                        };
                        let set = self.bwd.push(
                            Expr::LocalSet {
                                local: dx1,
                                value: quotient,
                            },
                            [],
                        );
                        let a = self.accumulate(dl, ty, |g| g.bwd_get(dx1, ty))?;
                        let b = self.deduct(dr, ty, |g| {
                            let x = g.bwd_get(dx1, ty)?;
                            let z = g.load_of(e, ty)?;
                            Ok(g.bwd_binary(BinaryOp::mul(ty), x, z))
                        })?;
                        vec![set, a, b]
                    }
                    _ => unreachable!("integer operators are filtered above"),
                };
                self.push_block(block);
                Ok(Emit::value(fwd, Some(self.zero(ty)), Some(dz)))
            }
            Expr::Call { target, operands } => self.call(e, target, &operands),
            Expr::StructNew { ty, ref operands } => {
                if !operands.is_empty() {
                    return Err(ErrorImpl::InvalidInit {
                        func: self.name.clone(),
                    });
                }
                self.allocation(Expr::StructNew {
                    ty,
                    operands: Box::new([]),
                }, ty)
            }
            Expr::StructNewDefault { ty } => self.allocation(Expr::StructNewDefault { ty }, ty),
            Expr::ArrayNewDefault { ty, size } => {
                let es = self.expr(size)?;
                let g = self.mapper.heap(self.types, &self.name, ty)?;
                let gref = ValType::Ref(RefType {
                    nullable: true,
                    heap: g,
                });
                let len = self.fwd.local([ValType::I32]);
                let gl = self.fwd.local([gref]);
                let set_len = self.fwd.push(
                    Expr::LocalSet {
                        local: len,
                        value: es.fwd,
                    },
                    [],
                );
                let len_get = self.fwd.push(Expr::LocalGet(len), [ValType::I32]);
                // An array of gradient-free elements collapses to an empty
                // struct, so allocate whichever shape the mapped type has.
                let galloc = match &self.types[u32_to_usize(g)] {
                    HeapDef::Array(_) => self.fwd.push(
                        Expr::ArrayNewDefault { ty: g, size: len_get },
                        [ValType::Ref(RefType {
                            nullable: false,
                            heap: g,
                        })],
                    ),
                    _ => self.fwd.push(
                        Expr::StructNewDefault { ty: g },
                        [ValType::Ref(RefType {
                            nullable: false,
                            heap: g,
                        })],
                    ),
                };
                let set_grad = self.fwd.push(
                    Expr::LocalSet {
                        local: gl,
                        value: galloc,
                    },
                    [],
                );
                let len_get2 = self.fwd.push(Expr::LocalGet(len), [ValType::I32]);
                let pref = ValType::Ref(RefType {
                    nullable: false,
                    heap: ty,
                });
                let primal = self
                    .fwd
                    .push(Expr::ArrayNewDefault { ty, size: len_get2 }, [pref]);
                let fwd = self.fwd.push(
                    Expr::Block(Box::new([set_len, set_grad, primal])),
                    [pref],
                );
                Ok(Emit::value(fwd, Some(gl), None))
            }
            Expr::ArrayGet { ty, array, index } => self.array_get(ty, array, index),
            Expr::ArraySet { ty, array, index, value } => {
                self.array_set(e, ty, array, index, value)
            }
            Expr::ArrayLen(array) => {
                let ea = self.expr(array)?;
                let fwd = self.fwd.push(Expr::ArrayLen(ea.fwd), [ValType::I32]);
                Ok(Emit::value(fwd, None, None))
            }
            Expr::TupleMake(children) => {
                let mut fwds = Vec::with_capacity(children.len());
                let mut grads = Vec::new();
                let mut bwds = Vec::new();
                for &child in children.iter() {
                    let em = self.expr(child)?;
                    fwds.push(em.fwd);
                    grads.extend(em.grad.iter().copied());
                    bwds.extend(em.bwd.iter().copied());
                }
                let ty: Tuple = self.src.ty(e).into();
                let fwd = self.fwd.push(Expr::TupleMake(fwds.into()), ty);
                Ok(Emit {
                    fwd,
                    grad: grads.into(),
                    bwd: bwds.into(),
                })
            }
            Expr::StructGet { .. } | Expr::TupleExtract { .. } | Expr::RefNull(_) => {
                unreachable!("the planner rejects generator-only expressions in input functions")
            }
        }
    }

    /// Translate a `local.set`, updating the variable's gradient plumbing.
    fn assign(&mut self, local: u32, value: ExprId) -> crate::Result<ExprId> {
        let v = self.expr(value)?;
        let var = self.vars[u32_to_usize(local)];
        let ty = self.local_ty(local)?;
        let set = self.fwd.push(
            Expr::LocalSet {
                local: var.fwd,
                value: v.fwd,
            },
            [],
        );
        let fwd = match var.grad {
            None => set,
            Some(grad) => {
                let vg = v.grad1().ok_or(ErrorImpl::InternalInvariant {
                    func: self.name.clone(),
                    msg: "assignment value has no forward gradient",
                })?;
                let gty = self.mapper.value(self.types, &self.name, ty)?.ok_or(
                    ErrorImpl::InternalInvariant {
                        func: self.name.clone(),
                        msg: "gradient local for a gradient-free type",
                    },
                )?;
                let get = self.fwd.push(Expr::LocalGet(vg), [gty]);
                let set_grad = self.fwd.push(
                    Expr::LocalSet {
                        local: grad,
                        value: get,
                    },
                    [],
                );
                self.fwd.push(Expr::Block(Box::new([set, set_grad])), [])
            }
        };
        if ty.is_float() {
            let vb = self.bwd1(&v)?;
            // A fresh accumulator mimics SSA: later uses of the variable
            // deposit adjoint here, and the reversed transfer below folds it
            // back into the assigned value's accumulator. Accumulating (not
            // overwriting) matters when the value is a `local.get`, whose
            // accumulator is shared with the source variable.
            let next = self.bwd.local([ty]);
            let stmt = self.accumulate(vb, ty, |g| g.bwd_get(next, ty))?;
            self.stmts.push(stmt);
            self.vars[u32_to_usize(local)].bwd = Some(next);
        }
        Ok(fwd)
    }

    fn call(&mut self, e: ExprId, target: u32, operands: &[ExprId]) -> crate::Result<Emit> {
        let mut ops = Vec::with_capacity(operands.len());
        for &operand in operands {
            ops.push(self.expr(operand)?);
        }
        let (params, results) = match &self.types[u32_to_usize(self.funcs[u32_to_usize(target)].sig)]
        {
            HeapDef::Func(sig) => (sig.params.clone(), sig.results.clone()),
            _ => {
                return Err(ErrorImpl::InternalInvariant {
                    func: self.name.clone(),
                    msg: "call target signature is not a func type",
                });
            }
        };
        let gparams = self.mapper.tuple(self.types, &self.name, &params)?;
        let gresults = self.mapper.tuple(self.types, &self.name, &results)?;
        let callee_tape = ValType::Ref(RefType {
            nullable: false,
            heap: self.tapes[u32_to_usize(target)],
        });
        let call_field = *self
            .plan
            .calls
            .get(&e)
            .ok_or(ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "call site has no tape field",
            })?;

        // Forward: call the callee's forward pass, passing each operand's
        // in-forward gradient along with its primal.
        let mut args = Vec::with_capacity(params.len() + gparams.len());
        for op in &ops {
            args.push(op.fwd);
        }
        let mut gradient_args = Vec::new();
        for (k, &p) in params.iter().enumerate() {
            if let Some(g) = self.mapper.value(self.types, &self.name, p)? {
                let local = ops[k].grad1().ok_or(ErrorImpl::InternalInvariant {
                    func: self.name.clone(),
                    msg: "call operand has no forward gradient",
                })?;
                gradient_args.push(self.fwd.push(Expr::LocalGet(local), [g]));
            }
        }
        args.extend(gradient_args);
        let call_ty = concat(&[&results, &gresults, &[callee_tape]]);
        let call = self.fwd.push(
            Expr::Call {
                target: self.num_funcs + 2 * target,
                operands: args.into(),
            },
            call_ty.clone(),
        );
        let tl = self.fwd.local(call_ty.clone());
        let mut children = vec![self.fwd.push(
            Expr::LocalSet {
                local: tl,
                value: call,
            },
            [],
        )];
        let tape_index = u32::try_from(results.len() + gresults.len()).unwrap();
        let tuple_get = self.fwd.push(Expr::LocalGet(tl), call_ty.clone());
        let tape_val = self.fwd.push(
            Expr::TupleExtract {
                tuple: tuple_get,
                index: tape_index,
            },
            [callee_tape],
        );
        children.push(self.fwd.push(
            Expr::LocalSet {
                local: self.fwd_fields[u32_to_usize(call_field)],
                value: tape_val,
            },
            [],
        ));
        // Extract the result gradients into fresh locals.
        let mut grads = Vec::with_capacity(results.len());
        let mut gpos = 0;
        for &r in results.iter() {
            match self.mapper.value(self.types, &self.name, r)? {
                None => grads.push(None),
                Some(g) => {
                    let local = self.fwd.local([g]);
                    let tuple_get = self.fwd.push(Expr::LocalGet(tl), call_ty.clone());
                    let extract = self.fwd.push(
                        Expr::TupleExtract {
                            tuple: tuple_get,
                            index: u32::try_from(results.len() + gpos).unwrap(),
                        },
                        [g],
                    );
                    children.push(self.fwd.push(
                        Expr::LocalSet {
                            local,
                            value: extract,
                        },
                        [],
                    ));
                    grads.push(Some(local));
                    gpos += 1;
                }
            }
        }
        // Leave the primal results as the block's value.
        let fwd = match results.len() {
            0 => self.fwd.push(Expr::Block(children.into()), []),
            1 => {
                let tuple_get = self.fwd.push(Expr::LocalGet(tl), call_ty.clone());
                let extract = self.fwd.push(
                    Expr::TupleExtract {
                        tuple: tuple_get,
                        index: 0,
                    },
                    [results[0]],
                );
                children.push(extract);
                self.fwd
                    .push(Expr::Block(children.into()), [results[0]])
            }
            _ => {
                let mut extracts = Vec::with_capacity(results.len());
                for (k, &r) in results.iter().enumerate() {
                    let tuple_get = self.fwd.push(Expr::LocalGet(tl), call_ty.clone());
                    extracts.push(self.fwd.push(
                        Expr::TupleExtract {
                            tuple: tuple_get,
                            index: u32::try_from(k).unwrap(),
                        },
                        [r],
                    ));
                }
                let make = self
                    .fwd
                    .push(Expr::TupleMake(extracts.into()), results.clone());
                children.push(make);
                self.fwd.push(Expr::Block(children.into()), results.clone())
            }
        };

        // Backward: invoke the callee's backward pass with zero input-gradient
        // seeds and the accumulated result cotangents, then distribute the
        // returned gradients into the operand accumulators.
        let mut bwds = Vec::with_capacity(results.len());
        for &r in results.iter() {
            bwds.push(r.is_float().then(|| self.bwd.local([r])));
        }
        let mut bargs = Vec::new();
        for &g in gparams.iter() {
            bargs.push(self.bwd_zero_value(g));
        }
        for (k, &r) in results.iter().enumerate() {
            if let Some(g) = self.mapper.value(self.types, &self.name, r)? {
                let arg = match bwds[k] {
                    Some(local) => self.bwd.push(Expr::LocalGet(local), [r]),
                    None => self.bwd_zero_value(g),
                };
                bargs.push(arg);
            }
        }
        let tape_get = self.bwd.push(
            Expr::LocalGet(self.bwd_fields[u32_to_usize(call_field)]),
            [callee_tape],
        );
        bargs.push(tape_get);
        let bcall = self.bwd.push(
            Expr::Call {
                target: self.num_funcs + 2 * target + 1,
                operands: bargs.into(),
            },
            gparams.clone(),
        );
        let mut block = Vec::new();
        if gparams.is_empty() {
            block.push(bcall);
        } else {
            let itl = self.bwd.local(gparams.clone());
            block.push(self.bwd.push(
                Expr::LocalSet {
                    local: itl,
                    value: bcall,
                },
                [],
            ));
            let mut gpos = 0;
            for (k, &p) in params.iter().enumerate() {
                if self.mapper.value(self.types, &self.name, p)?.is_none() {
                    continue;
                }
                if p.is_float() {
                    let db = self.bwd1(&ops[k])?;
                    let stmt = self.accumulate(db, p, |g| {
                        let tuple = g.bwd.push(Expr::LocalGet(itl), gparams.clone());
                        Ok(g.bwd.push(
                            Expr::TupleExtract {
                                tuple,
                                index: gpos,
                            },
                            [p],
                        ))
                    })?;
                    block.push(stmt);
                }
                gpos += 1;
            }
        }
        self.push_block(block);

        Ok(Emit {
            fwd,
            grad: grads.into(),
            bwd: bwds.into(),
        })
    }

    /// A zero-operand struct allocation: allocate the gradient struct
    /// alongside the primal.
    fn allocation(&mut self, primal: Expr, ty: HeapId) -> crate::Result<Emit> {
        let g = self.mapper.heap(self.types, &self.name, ty)?;
        let gref = ValType::Ref(RefType {
            nullable: true,
            heap: g,
        });
        let gl = self.fwd.local([gref]);
        let galloc = self.fwd.push(
            Expr::StructNewDefault { ty: g },
            [ValType::Ref(RefType {
                nullable: false,
                heap: g,
            })],
        );
        let set = self.fwd.push(
            Expr::LocalSet {
                local: gl,
                value: galloc,
            },
            [],
        );
        let pref = ValType::Ref(RefType {
            nullable: false,
            heap: ty,
        });
        let value = self.fwd.push(primal, [pref]);
        let fwd = self.fwd.push(Expr::Block(Box::new([set, value])), [pref]);
        Ok(Emit::value(fwd, Some(gl), None))
    }

    fn array_get(&mut self, ty: HeapId, array: ExprId, index: ExprId) -> crate::Result<Emit> {
        let ea = self.expr(array)?;
        let elem = ir::array_elem(self.types, ty).ty;
        if elem.is_float() {
            let ei = self.expr(index)?;
            let fwd = self.fwd.push(
                Expr::ArrayGet {
                    ty,
                    array: ea.fwd,
                    index: ei.fwd,
                },
                [elem],
            );
            let g = self.mapper.heap(self.types, &self.name, ty)?;
            let dz = self.bwd.local([elem]);
            // grad_arr[i] += dz
            let garr = self.grad_ref(array)?;
            let i1 = self.bwd_load(self.load_ref(index)?, ValType::I32);
            let garr2 = self.grad_ref(array)?;
            let i2 = self.bwd_load(self.load_ref(index)?, ValType::I32);
            let old = self.bwd.push(
                Expr::ArrayGet {
                    ty: g,
                    array: garr2,
                    index: i2,
                },
                [elem],
            );
            let dzg = self.bwd_get(dz, elem)?;
            let sum = self.bwd_binary(BinaryOp::add(elem), old, dzg);
            let stmt = self.bwd.push(
                Expr::ArraySet {
                    ty: g,
                    array: garr,
                    index: i1,
                    value: sum,
                },
                [],
            );
            self.push_block(vec![stmt]);
            return Ok(Emit::value(fwd, Some(self.zero(elem)), Some(dz)));
        }
        match self.mapper.value(self.types, &self.name, elem)? {
            None => {
                let ei = self.expr(index)?;
                let fwd = self.fwd.push(
                    Expr::ArrayGet {
                        ty,
                        array: ea.fwd,
                        index: ei.fwd,
                    },
                    [elem],
                );
                Ok(Emit::value(fwd, None, None))
            }
            Some(gelem) => {
                // Reference elements: read the matching element of the
                // gradient array during the forward pass so downstream code
                // can keep accumulating into it.
                let ei = self.expr(index)?;
                let aty = self.single_src_ty(array)?;
                let g = self.mapper.heap(self.types, &self.name, ty)?;
                let al = self.fwd.local([aty]);
                let il = self.fwd.local([ValType::I32]);
                let gl = self.fwd.local([gelem]);
                let ga = ea.grad1().ok_or(ErrorImpl::InternalInvariant {
                    func: self.name.clone(),
                    msg: "array operand has no gradient array",
                })?;
                let gaty = self.mapper.value(self.types, &self.name, aty)?.ok_or(
                    ErrorImpl::InternalInvariant {
                        func: self.name.clone(),
                        msg: "array type has no gradient type",
                    },
                )?;
                let set_a = {
                    let v = ea.fwd;
                    self.fwd.push(Expr::LocalSet { local: al, value: v }, [])
                };
                let set_i = {
                    let v = ei.fwd;
                    self.fwd.push(Expr::LocalSet { local: il, value: v }, [])
                };
                let ga_get = self.fwd.push(Expr::LocalGet(ga), [gaty]);
                let i_get = self.fwd.push(Expr::LocalGet(il), [ValType::I32]);
                let gread = self.fwd.push(
                    Expr::ArrayGet {
                        ty: g,
                        array: ga_get,
                        index: i_get,
                    },
                    [gelem],
                );
                let set_g = self
                    .fwd
                    .push(Expr::LocalSet { local: gl, value: gread }, []);
                let a_get = self.fwd.push(Expr::LocalGet(al), [aty]);
                let i_get2 = self.fwd.push(Expr::LocalGet(il), [ValType::I32]);
                let primal = self.fwd.push(
                    Expr::ArrayGet {
                        ty,
                        array: a_get,
                        index: i_get2,
                    },
                    [elem],
                );
                let fwd = self.fwd.push(
                    Expr::Block(Box::new([set_a, set_i, set_g, primal])),
                    [elem],
                );
                Ok(Emit::value(fwd, Some(gl), None))
            }
        }
    }

    fn array_set(
        &mut self,
        e: ExprId,
        ty: HeapId,
        array: ExprId,
        index: ExprId,
        value: ExprId,
    ) -> crate::Result<Emit> {
        let ea = self.expr(array)?;
        let ei = self.expr(index)?;
        let ev = self.expr(value)?;
        let elem = ir::array_elem(self.types, ty).ty;
        let gelem = self.mapper.value(self.types, &self.name, elem)?;
        let Some(gelem) = gelem else {
            let fwd = self.fwd.push(
                Expr::ArraySet {
                    ty,
                    array: ea.fwd,
                    index: ei.fwd,
                    value: ev.fwd,
                },
                [],
            );
            return Ok(Emit::void(fwd));
        };
        let field = *self.plan.sets.get(&e).ok_or(ErrorImpl::InternalInvariant {
            func: self.name.clone(),
            msg: "array.set has no saved-gradient field",
        })?;
        let g = self.mapper.heap(self.types, &self.name, ty)?;
        let aty = self.single_src_ty(array)?;
        let ga = ea.grad1().ok_or(ErrorImpl::InternalInvariant {
            func: self.name.clone(),
            msg: "array operand has no gradient array",
        })?;
        let gaty = self.mapper.value(self.types, &self.name, aty)?.ok_or(
            ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "array type has no gradient type",
            },
        )?;
        let gv = ev.grad1().ok_or(ErrorImpl::InternalInvariant {
            func: self.name.clone(),
            msg: "stored value has no forward gradient",
        })?;
        let al = self.fwd.local([aty]);
        let il = self.fwd.local([ValType::I32]);
        let vl = self.fwd.local([elem]);
        let set_a = {
            let v = ea.fwd;
            self.fwd.push(Expr::LocalSet { local: al, value: v }, [])
        };
        let set_i = {
            let v = ei.fwd;
            self.fwd.push(Expr::LocalSet { local: il, value: v }, [])
        };
        let set_v = {
            let v = ev.fwd;
            self.fwd.push(Expr::LocalSet { local: vl, value: v }, [])
        };
        let primal = {
            let a = self.fwd.push(Expr::LocalGet(al), [aty]);
            let i = self.fwd.push(Expr::LocalGet(il), [ValType::I32]);
            let v = self.fwd.push(Expr::LocalGet(vl), [elem]);
            self.fwd.push(
                Expr::ArraySet {
                    ty,
                    array: a,
                    index: i,
                    value: v,
                },
                [],
            )
        };
        // Save the element's gradient slot before overwriting it with the new
        // value's forward gradient.
        let save = {
            let ga_get = self.fwd.push(Expr::LocalGet(ga), [gaty]);
            let i = self.fwd.push(Expr::LocalGet(il), [ValType::I32]);
            let read = self.fwd.push(
                Expr::ArrayGet {
                    ty: g,
                    array: ga_get,
                    index: i,
                },
                [gelem],
            );
            self.fwd.push(
                Expr::LocalSet {
                    local: self.fwd_fields[u32_to_usize(field)],
                    value: read,
                },
                [],
            )
        };
        let overwrite = {
            let ga_get = self.fwd.push(Expr::LocalGet(ga), [gaty]);
            let i = self.fwd.push(Expr::LocalGet(il), [ValType::I32]);
            let v = self.fwd.push(Expr::LocalGet(gv), [gelem]);
            self.fwd.push(
                Expr::ArraySet {
                    ty: g,
                    array: ga_get,
                    index: i,
                    value: v,
                },
                [],
            )
        };
        let fwd = self.fwd.push(
            Expr::Block(Box::new([set_a, set_i, set_v, primal, save, overwrite])),
            [],
        );

        // Backward, in execution order after reversal: drain the slot into
        // the value's accumulator, then restore the slot to its saved
        // pre-store gradient.
        let mut block = Vec::new();
        if elem.is_float() {
            let db = self.bwd1(&ev)?;
            let stmt = self.accumulate(db, elem, |gen| {
                let garr = gen.grad_ref(array)?;
                let i = gen.bwd_load(gen.load_ref(index)?, ValType::I32);
                Ok(gen.bwd.push(
                    Expr::ArrayGet {
                        ty: g,
                        array: garr,
                        index: i,
                    },
                    [elem],
                ))
            })?;
            block.push(stmt);
        }
        let restore = {
            let garr = self.grad_ref(array)?;
            let i = self.bwd_load(self.load_ref(index)?, ValType::I32);
            let saved = self.bwd.push(
                Expr::LocalGet(self.bwd_fields[u32_to_usize(field)]),
                [gelem],
            );
            self.bwd.push(
                Expr::ArraySet {
                    ty: g,
                    array: garr,
                    index: i,
                    value: saved,
                },
                [],
            )
        };
        block.push(restore);
        self.push_block(block);
        Ok(Emit::void(fwd))
    }

    /// Wrap an emitted value so its primal (and saved gradient) land in the
    /// tape field locals the planner assigned.
    fn store(&mut self, e: ExprId, emit: Emit) -> crate::Result<Emit> {
        let store = self.plan.stores.get(&e).copied();
        let grad = self.plan.grads.get(&e).copied();
        if store.is_none() && grad.is_none() {
            return Ok(emit);
        }
        let ty = self.single_src_ty(e)?;
        let slot = match store {
            Some(i) => self.fwd_fields[u32_to_usize(i)],
            None => self.fwd.local([ty]),
        };
        let mut children = vec![self.fwd.push(
            Expr::LocalSet {
                local: slot,
                value: emit.fwd,
            },
            [],
        )];
        if let Some(i) = grad {
            let gl = emit.grad1().ok_or(ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "saved gradient of a value that has none",
            })?;
            let gty = self.plan.fields[u32_to_usize(i)];
            let get = self.fwd.push(Expr::LocalGet(gl), [gty]);
            children.push(self.fwd.push(
                Expr::LocalSet {
                    local: self.fwd_fields[u32_to_usize(i)],
                    value: get,
                },
                [],
            ));
        }
        children.push(self.fwd.push(Expr::LocalGet(slot), [ty]));
        let fwd = self.fwd.push(Expr::Block(children.into()), [ty]);
        Ok(Emit {
            fwd,
            grad: emit.grad,
            bwd: emit.bwd,
        })
    }

    /// Assemble the two bodies.
    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &mut self,
        body: Emit,
        params: &[ValType],
        results: &[ValType],
        gresults: &[ValType],
        tape_ref: ValType,
        index: u32,
        tape_param: u32,
    ) -> crate::Result<()> {
        // Forward: run the body into `out`, then return the primals, their
        // gradients, and the freshly built tape struct.
        let mut stmts = Vec::new();
        let out = if results.is_empty() {
            stmts.push(body.fwd);
            None
        } else {
            let out = self.fwd.local(results.to_vec());
            stmts.push(self.fwd.push(
                Expr::LocalSet {
                    local: out,
                    value: body.fwd,
                },
                [],
            ));
            Some(out)
        };
        let mut components = Vec::new();
        if let Some(out) = out {
            for (k, &r) in results.iter().enumerate() {
                let tuple = self.fwd.push(Expr::LocalGet(out), results.to_vec());
                components.push(self.fwd.push(
                    Expr::TupleExtract {
                        tuple,
                        index: u32::try_from(k).unwrap(),
                    },
                    [r],
                ));
            }
        }
        for (k, &r) in results.iter().enumerate() {
            if self.mapper.value(self.types, &self.name, r)?.is_some() {
                let g = body.grad[k].ok_or(ErrorImpl::InternalInvariant {
                    func: self.name.clone(),
                    msg: "result component has no forward gradient",
                })?;
                let gty = self
                    .mapper
                    .value(self.types, &self.name, r)?
                    .expect("checked above");
                components.push(self.fwd.push(Expr::LocalGet(g), [gty]));
            }
        }
        let plan = self.plan;
        let mut tape_fields = Vec::with_capacity(plan.fields.len());
        for (i, &ty) in plan.fields.iter().enumerate() {
            let local = self.fwd_fields[i];
            tape_fields.push(self.fwd.push(Expr::LocalGet(local), [ty]));
        }
        components.push(self.fwd.push(
            Expr::StructNew {
                ty: self.tapes[u32_to_usize(index)],
                operands: tape_fields.into(),
            },
            [tape_ref],
        ));
        let fwd_results = concat(&[results, gresults, &[tape_ref]]);
        let value = if components.len() == 1 {
            components.pop().expect("one component")
        } else {
            self.fwd
                .push(Expr::TupleMake(components.into()), fwd_results.clone())
        };
        stmts.push(value);
        self.fwd.body = self
            .fwd
            .push(Expr::Block(stmts.into()), fwd_results);

        // Backward: reload the tape, seed the result cotangents, then run the
        // reversed statement list and return the parameter gradients.
        let mut stmts = Vec::new();
        for (i, &ty) in plan.fields.iter().enumerate() {
            let object = self.bwd.push(Expr::LocalGet(tape_param), [tape_ref]);
            let get = self.bwd.push(
                Expr::StructGet {
                    ty: self.tapes[u32_to_usize(index)],
                    object,
                    field: u32::try_from(i).unwrap(),
                },
                [ty],
            );
            stmts.push(self.bwd.push(
                Expr::LocalSet {
                    local: self.bwd_fields[i],
                    value: get,
                },
                [],
            ));
        }
        let ngp = {
            let mut n = 0;
            for &p in params {
                if self.mapper.value(self.types, &self.name, p)?.is_some() {
                    n += 1;
                }
            }
            n
        };
        let mut gpos = 0;
        for (k, &r) in results.iter().enumerate() {
            if self.mapper.value(self.types, &self.name, r)?.is_none() {
                continue;
            }
            if r.is_float() {
                let b = body.bwd[k].ok_or(ErrorImpl::InternalInvariant {
                    func: self.name.clone(),
                    msg: "result component has no backward accumulator",
                })?;
                let slot = u32::try_from(ngp + gpos).unwrap();
                let stmt = self.accumulate(b, r, |g| Ok(g.bwd.push(Expr::LocalGet(slot), [r])))?;
                stmts.push(stmt);
            }
            gpos += 1;
        }
        let mut reversed = std::mem::take(&mut self.stmts);
        reversed.reverse();
        stmts.extend(reversed);
        let gparams: Vec<ValType> = {
            let mut tys = Vec::new();
            for &p in params {
                if let Some(g) = self.mapper.value(self.types, &self.name, p)? {
                    tys.push(g);
                }
            }
            tys
        };
        let body_ty: Tuple = gparams.clone().into();
        match gparams.len() {
            0 => {}
            1 => {
                stmts.push(self.bwd.push(Expr::LocalGet(0), [gparams[0]]));
            }
            _ => {
                let gets: Vec<ExprId> = gparams
                    .iter()
                    .enumerate()
                    .map(|(j, &g)| {
                        self.bwd
                            .push(Expr::LocalGet(u32::try_from(j).unwrap()), [g])
                    })
                    .collect();
                stmts.push(
                    self.bwd
                        .push(Expr::TupleMake(gets.into()), gparams.clone()),
                );
            }
        }
        self.bwd.body = self.bwd.push(Expr::Block(stmts.into()), body_ty);
        Ok(())
    }

    fn local_ty(&self, local: u32) -> crate::Result<ValType> {
        match *self.src.locals[u32_to_usize(local)] {
            [ty] => Ok(ty),
            _ => Err(ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "input function has a multivalue local",
            }),
        }
    }

    fn single_src_ty(&self, e: ExprId) -> crate::Result<ValType> {
        match *self.src.ty(e) {
            [ty] => Ok(ty),
            _ => Err(ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "expected a single-valued expression",
            }),
        }
    }

    fn bwd1(&self, emit: &Emit) -> crate::Result<u32> {
        emit.bwd1().ok_or(ErrorImpl::InternalInvariant {
            func: self.name.clone(),
            msg: "float-typed value has no backward accumulator",
        })
    }

    /// The zero-valued forward local of the given float type.
    fn zero(&mut self, ty: ValType) -> u32 {
        if let Some(&local) = self.zeros.get(&ty) {
            return local;
        }
        let local = self.fwd.local([ty]);
        self.zeros.insert(ty, local);
        local
    }

    fn bwd_get(&mut self, local: u32, ty: ValType) -> crate::Result<ExprId> {
        Ok(self.bwd.push(Expr::LocalGet(local), [ty]))
    }

    fn bwd_binary(&mut self, op: BinaryOp, left: ExprId, right: ExprId) -> ExprId {
        self.bwd.push(Expr::Binary { op, left, right }, [op.result()])
    }

    /// `local += rhs` in the backward pass.
    fn accumulate<F>(&mut self, local: u32, ty: ValType, rhs: F) -> crate::Result<ExprId>
    where
        F: FnOnce(&mut Self) -> crate::Result<ExprId>,
    {
        let get = self.bwd_get(local, ty)?;
        let rhs = rhs(self)?;
        let sum = self.bwd_binary(BinaryOp::add(ty), get, rhs);
        Ok(self.bwd.push(Expr::LocalSet { local, value: sum }, []))
    }

    /// `local -= rhs` in the backward pass.
    fn deduct<F>(&mut self, local: u32, ty: ValType, rhs: F) -> crate::Result<ExprId>
    where
        F: FnOnce(&mut Self) -> crate::Result<ExprId>,
    {
        let get = self.bwd_get(local, ty)?;
        let rhs = rhs(self)?;
        let diff = self.bwd_binary(BinaryOp::sub(ty), get, rhs);
        Ok(self.bwd.push(Expr::LocalSet { local, value: diff }, []))
    }

    /// The tape load for a primal the backward pass needs at `e`.
    fn load_ref(&self, e: ExprId) -> crate::Result<Load> {
        self.plan
            .loads
            .get(&e)
            .copied()
            .ok_or(ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "backward pass needs a value the planner did not tape",
            })
    }

    fn bwd_load(&mut self, load: Load, ty: ValType) -> ExprId {
        match load {
            Load::Const(literal) => self.bwd.push(Expr::Const(literal), [literal.ty()]),
            Load::Field(i) => self
                .bwd
                .push(Expr::LocalGet(self.bwd_fields[u32_to_usize(i)]), [ty]),
        }
    }

    fn load_of(&mut self, e: ExprId, ty: ValType) -> crate::Result<ExprId> {
        let load = self.load_ref(e)?;
        Ok(self.bwd_load(load, ty))
    }

    /// The gradient-array reference saved for the array operand at `e`.
    fn grad_ref(&mut self, e: ExprId) -> crate::Result<ExprId> {
        match self.plan.grad_loads.get(&e).copied() {
            Some(Load::Field(i)) => {
                let ty = self.plan.fields[u32_to_usize(i)];
                Ok(self
                    .bwd
                    .push(Expr::LocalGet(self.bwd_fields[u32_to_usize(i)]), [ty]))
            }
            _ => Err(ErrorImpl::InternalInvariant {
                func: self.name.clone(),
                msg: "backward pass needs a gradient the planner did not tape",
            }),
        }
    }

    /// A zero cotangent seed of the given gradient type.
    fn bwd_zero_value(&mut self, ty: ValType) -> ExprId {
        match ty {
            ValType::Ref(r) => self.bwd.push(Expr::RefNull(r.heap), [ty]),
            _ => self
                .bwd
                .push(Expr::Const(Literal::zero(ty)), [ty]),
        }
    }

    /// Push one backward contribution; multi-statement contributions become a
    /// block so that reversing the list preserves their order.
    fn push_block(&mut self, mut stmts: Vec<ExprId>) {
        match stmts.len() {
            0 => {}
            1 => self.stmts.push(stmts.pop().expect("one statement")),
            _ => {
                let block = self.bwd.push(Expr::Block(stmts.into()), []);
                self.stmts.push(block);
            }
        }
    }
}
