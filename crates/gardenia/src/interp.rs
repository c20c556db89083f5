//! A small tree-walking evaluator for the IR, used by the tests as a numeric
//! oracle for both input modules and transformed modules.

use std::{cell::RefCell, rc::Rc};

use crate::{
    ir::{BinaryOp, Expr, ExprId, Func, HeapDef, Literal, Module, ValType},
    util::u32_to_usize,
};

#[derive(Clone, Debug)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Null,
    Obj(Rc<RefCell<Obj>>),
}

#[derive(Debug)]
pub enum Obj {
    Struct(Vec<Val>),
    Array(Vec<Val>),
}

impl Val {
    pub fn f64(&self) -> f64 {
        match self {
            Val::F64(x) => *x,
            other => panic!("expected an f64, got {other:?}"),
        }
    }

    pub fn i32(&self) -> i32 {
        match self {
            Val::I32(x) => *x,
            other => panic!("expected an i32, got {other:?}"),
        }
    }

    fn obj(&self) -> Rc<RefCell<Obj>> {
        match self {
            Val::Obj(obj) => Rc::clone(obj),
            other => panic!("expected a reference, got {other:?}"),
        }
    }

    fn default(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0.),
            ValType::F64 => Val::F64(0.),
            ValType::Ref(_) => Val::Null,
        }
    }
}

/// Call the function at `index` with the given arguments.
pub fn call(m: &Module, index: u32, args: &[Val]) -> Vec<Val> {
    let func = &m.funcs[u32_to_usize(index)];
    let num_params = match m.heap(func.sig) {
        HeapDef::Func(sig) => sig.params.len(),
        _ => panic!("function signature is not a func type"),
    };
    assert_eq!(args.len(), num_params);
    let mut locals: Vec<Vec<Val>> = Vec::with_capacity(func.locals.len());
    for (i, local) in func.locals.iter().enumerate() {
        if i < num_params {
            locals.push(vec![args[i].clone()]);
        } else {
            locals.push(local.iter().map(|&ty| Val::default(ty)).collect());
        }
    }
    eval(m, func, &mut locals, func.body)
}

fn eval(m: &Module, func: &Func, locals: &mut Vec<Vec<Val>>, id: ExprId) -> Vec<Val> {
    match func.expr(id) {
        Expr::Block(children) => {
            let mut out = Vec::new();
            for &child in children.iter() {
                out = eval(m, func, locals, child);
            }
            out
        }
        Expr::Const(literal) => vec![match *literal {
            Literal::I32(x) => Val::I32(x),
            Literal::I64(x) => Val::I64(x),
            Literal::F32(x) => Val::F32(x),
            Literal::F64(x) => Val::F64(x),
        }],
        Expr::LocalGet(local) => locals[u32_to_usize(*local)].clone(),
        Expr::LocalSet { local, value } => {
            let v = eval(m, func, locals, *value);
            locals[u32_to_usize(*local)] = v;
            Vec::new()
        }
        Expr::LocalTee { local, value } => {
            let v = eval(m, func, locals, *value);
            locals[u32_to_usize(*local)] = v.clone();
            v
        }
        Expr::Binary { op, left, right } => {
            let l = single(eval(m, func, locals, *left));
            let r = single(eval(m, func, locals, *right));
            vec![binary(*op, l, r)]
        }
        Expr::Call { target, operands } => {
            let mut args = Vec::with_capacity(operands.len());
            for &operand in operands.iter() {
                args.push(single(eval(m, func, locals, operand)));
            }
            call(m, *target, &args)
        }
        Expr::StructNew { operands, .. } => {
            let mut fields = Vec::with_capacity(operands.len());
            for &operand in operands.iter() {
                fields.push(single(eval(m, func, locals, operand)));
            }
            vec![Val::Obj(Rc::new(RefCell::new(Obj::Struct(fields))))]
        }
        Expr::StructNewDefault { ty } => {
            let fields = match m.heap(*ty) {
                HeapDef::Struct(fields) => fields.iter().map(|f| Val::default(f.ty)).collect(),
                _ => panic!("struct.new_default on a non-struct type"),
            };
            vec![Val::Obj(Rc::new(RefCell::new(Obj::Struct(fields))))]
        }
        Expr::StructGet { object, field, .. } => {
            let obj = single(eval(m, func, locals, *object)).obj();
            let obj = obj.borrow();
            match &*obj {
                Obj::Struct(fields) => vec![fields[u32_to_usize(*field)].clone()],
                Obj::Array(_) => panic!("struct.get on an array"),
            }
        }
        Expr::ArrayNewDefault { ty, size } => {
            let n = single(eval(m, func, locals, *size)).i32();
            let elem = Val::default(crate::ir::array_elem(&m.types, *ty).ty);
            let n = usize::try_from(n).expect("negative array length");
            vec![Val::Obj(Rc::new(RefCell::new(Obj::Array(vec![elem; n]))))]
        }
        Expr::ArrayGet { array, index, .. } => {
            let arr = single(eval(m, func, locals, *array)).obj();
            let i = single(eval(m, func, locals, *index)).i32();
            let arr = arr.borrow();
            match &*arr {
                Obj::Array(elems) => {
                    vec![elems[usize::try_from(i).expect("negative index")].clone()]
                }
                Obj::Struct(_) => panic!("array.get on a struct"),
            }
        }
        Expr::ArraySet { array, index, value, .. } => {
            let arr = single(eval(m, func, locals, *array)).obj();
            let i = single(eval(m, func, locals, *index)).i32();
            let v = single(eval(m, func, locals, *value));
            let mut arr = arr.borrow_mut();
            match &mut *arr {
                Obj::Array(elems) => {
                    elems[usize::try_from(i).expect("negative index")] = v;
                }
                Obj::Struct(_) => panic!("array.set on a struct"),
            }
            Vec::new()
        }
        Expr::ArrayLen(array) => {
            let arr = single(eval(m, func, locals, *array)).obj();
            let arr = arr.borrow();
            match &*arr {
                Obj::Array(elems) => vec![Val::I32(i32::try_from(elems.len()).unwrap())],
                Obj::Struct(_) => panic!("array.len on a struct"),
            }
        }
        Expr::TupleMake(children) => {
            let mut out = Vec::new();
            for &child in children.iter() {
                out.extend(eval(m, func, locals, child));
            }
            out
        }
        Expr::TupleExtract { tuple, index } => {
            let v = eval(m, func, locals, *tuple);
            vec![v[u32_to_usize(*index)].clone()]
        }
        Expr::RefNull(_) => vec![Val::Null],
    }
}

fn single(mut vals: Vec<Val>) -> Val {
    assert_eq!(vals.len(), 1, "expected a single value");
    vals.pop().expect("one value")
}

fn binary(op: BinaryOp, l: Val, r: Val) -> Val {
    use BinaryOp::*;
    match op {
        I32Add => Val::I32(l.i32().wrapping_add(r.i32())),
        I32Sub => Val::I32(l.i32().wrapping_sub(r.i32())),
        I32Mul => Val::I32(l.i32().wrapping_mul(r.i32())),
        I32DivS => Val::I32(l.i32().wrapping_div(r.i32())),
        I32DivU => Val::I32(((l.i32() as u32) / (r.i32() as u32)) as i32),
        I64Add => Val::I64(i64_of(&l).wrapping_add(i64_of(&r))),
        I64Sub => Val::I64(i64_of(&l).wrapping_sub(i64_of(&r))),
        I64Mul => Val::I64(i64_of(&l).wrapping_mul(i64_of(&r))),
        I64DivS => Val::I64(i64_of(&l).wrapping_div(i64_of(&r))),
        I64DivU => Val::I64(((i64_of(&l) as u64) / (i64_of(&r) as u64)) as i64),
        F32Add => Val::F32(f32_of(&l) + f32_of(&r)),
        F32Sub => Val::F32(f32_of(&l) - f32_of(&r)),
        F32Mul => Val::F32(f32_of(&l) * f32_of(&r)),
        F32Div => Val::F32(f32_of(&l) / f32_of(&r)),
        F64Add => Val::F64(l.f64() + r.f64()),
        F64Sub => Val::F64(l.f64() - r.f64()),
        F64Mul => Val::F64(l.f64() * r.f64()),
        F64Div => Val::F64(l.f64() / r.f64()),
    }
}

fn i64_of(v: &Val) -> i64 {
    match v {
        Val::I64(x) => *x,
        other => panic!("expected an i64, got {other:?}"),
    }
}

fn f32_of(v: &Val) -> f32 {
    match v {
        Val::F32(x) => *x,
        other => panic!("expected an f32, got {other:?}"),
    }
}
