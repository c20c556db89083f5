//! Re-encoding the IR as a binary module.
//!
//! All heap types are emitted as a single recursion group: the per-function
//! tape structs may reference each other through call sub-tape fields, and a
//! group with extra members is still a valid module. Tuple-typed locals from
//! the generator are flattened to runs of scalar Wasm locals.

use wasm_encoder::{
    CodeSection, CompositeInnerType, CompositeType, ExportKind, ExportSection, FieldType,
    Function, FunctionSection, Module, StorageType, StructType, SubType, TypeSection,
};

use crate::{
    ir::{self, BinaryOp, Expr, ExprId, HeapDef, Literal, ValType},
    util::u32_to_usize,
};

pub fn module(m: &ir::Module) -> Vec<u8> {
    let mut types = TypeSection::new();
    types.ty().rec(m.types.iter().map(subtype));
    let mut functions = FunctionSection::new();
    for func in &m.funcs {
        functions.function(func.sig);
    }
    let mut exports = ExportSection::new();
    for export in &m.exports {
        exports.export(&export.name, ExportKind::Func, export.func);
    }
    let mut code = CodeSection::new();
    for func in &m.funcs {
        code.function(&function(m, func));
    }
    let mut module = Module::new();
    module.section(&types);
    module.section(&functions);
    module.section(&exports);
    module.section(&code);
    module.finish()
}

fn subtype(def: &HeapDef) -> SubType {
    let inner = match def {
        HeapDef::Func(sig) => CompositeInnerType::Func(wasm_encoder::FuncType::new(
            sig.params.iter().map(|&ty| val_type(ty)),
            sig.results.iter().map(|&ty| val_type(ty)),
        )),
        HeapDef::Struct(fields) => CompositeInnerType::Struct(StructType {
            fields: fields.iter().map(field).collect(),
        }),
        HeapDef::Array(elem) => CompositeInnerType::Array(wasm_encoder::ArrayType(field(elem))),
    };
    SubType {
        is_final: true,
        supertype_idx: None,
        composite_type: CompositeType {
            inner,
            shared: false,
        },
    }
}

fn field(f: &ir::Field) -> FieldType {
    FieldType {
        element_type: StorageType::Val(val_type(f.ty)),
        mutable: f.mutable,
    }
}

fn val_type(ty: ValType) -> wasm_encoder::ValType {
    match ty {
        ValType::I32 => wasm_encoder::ValType::I32,
        ValType::I64 => wasm_encoder::ValType::I64,
        ValType::F32 => wasm_encoder::ValType::F32,
        ValType::F64 => wasm_encoder::ValType::F64,
        ValType::Ref(r) => wasm_encoder::ValType::Ref(wasm_encoder::RefType {
            nullable: r.nullable,
            heap_type: wasm_encoder::HeapType::Concrete(r.heap),
        }),
    }
}

fn function(m: &ir::Module, func: &ir::Func) -> Function {
    // Flatten tuple-typed locals: `base[i]` is the first Wasm local index of
    // IR local `i`.
    let num_params = match m.heap(func.sig) {
        HeapDef::Func(sig) => sig.params.len(),
        _ => unreachable!("function signature indices always name func types"),
    };
    let mut base = Vec::with_capacity(func.locals.len());
    let mut next = 0u32;
    for local in &func.locals {
        base.push(next);
        next += u32::try_from(local.len()).unwrap();
    }
    let locals: Vec<(u32, wasm_encoder::ValType)> = func
        .locals
        .iter()
        .skip(num_params)
        .flat_map(|local| local.iter().map(|&ty| (1, val_type(ty))))
        .collect();
    let mut f = Function::new(locals);
    expr(func, &base, &mut f, func.body);
    f.instructions().end();
    f
}

fn expr(func: &ir::Func, base: &[u32], f: &mut Function, id: ExprId) {
    match func.expr(id) {
        Expr::Block(children) => {
            for &child in children.iter() {
                expr(func, base, f, child);
            }
        }
        Expr::Const(literal) => {
            match *literal {
                Literal::I32(x) => f.instructions().i32_const(x),
                Literal::I64(x) => f.instructions().i64_const(x),
                Literal::F32(x) => f.instructions().f32_const(x),
                Literal::F64(x) => f.instructions().f64_const(x),
            };
        }
        Expr::LocalGet(local) => {
            let b = base[u32_to_usize(*local)];
            for k in 0..arity(func, *local) {
                f.instructions().local_get(b + k);
            }
        }
        Expr::LocalSet { local, value } => {
            expr(func, base, f, *value);
            let b = base[u32_to_usize(*local)];
            for k in (0..arity(func, *local)).rev() {
                f.instructions().local_set(b + k);
            }
        }
        Expr::LocalTee { local, value } => {
            expr(func, base, f, *value);
            f.instructions().local_tee(base[u32_to_usize(*local)]);
        }
        Expr::Binary { op, left, right } => {
            expr(func, base, f, *left);
            expr(func, base, f, *right);
            binary(f, *op);
        }
        Expr::Call { target, operands } => {
            for &operand in operands.iter() {
                expr(func, base, f, operand);
            }
            f.instructions().call(*target);
        }
        Expr::StructNew { ty, operands } => {
            for &operand in operands.iter() {
                expr(func, base, f, operand);
            }
            f.instructions().struct_new(*ty);
        }
        Expr::StructNewDefault { ty } => {
            f.instructions().struct_new_default(*ty);
        }
        Expr::StructGet { ty, object, field } => {
            expr(func, base, f, *object);
            f.instructions().struct_get(*ty, *field);
        }
        Expr::ArrayNewDefault { ty, size } => {
            expr(func, base, f, *size);
            f.instructions().array_new_default(*ty);
        }
        Expr::ArrayGet { ty, array, index } => {
            expr(func, base, f, *array);
            expr(func, base, f, *index);
            f.instructions().array_get(*ty);
        }
        Expr::ArraySet { ty, array, index, value } => {
            expr(func, base, f, *array);
            expr(func, base, f, *index);
            expr(func, base, f, *value);
            f.instructions().array_set(*ty);
        }
        Expr::ArrayLen(array) => {
            expr(func, base, f, *array);
            f.instructions().array_len();
        }
        Expr::TupleMake(children) => {
            for &child in children.iter() {
                expr(func, base, f, child);
            }
        }
        Expr::TupleExtract { tuple, index } => match func.expr(*tuple) {
            // The generator only extracts from tuple-local reads, which
            // flatten to a single scalar read.
            Expr::LocalGet(local) => {
                f.instructions()
                    .local_get(base[u32_to_usize(*local)] + index);
            }
            _ => unreachable!("tuple extraction is only generated over local reads"),
        },
        Expr::RefNull(heap) => {
            f.instructions()
                .ref_null(wasm_encoder::HeapType::Concrete(*heap));
        }
    }
}

fn arity(func: &ir::Func, local: u32) -> u32 {
    u32::try_from(func.locals[u32_to_usize(local)].len()).unwrap()
}

fn binary(f: &mut Function, op: BinaryOp) {
    use BinaryOp::*;
    match op {
        I32Add => f.instructions().i32_add(),
        I32Sub => f.instructions().i32_sub(),
        I32Mul => f.instructions().i32_mul(),
        I32DivS => f.instructions().i32_div_s(),
        I32DivU => f.instructions().i32_div_u(),
        I64Add => f.instructions().i64_add(),
        I64Sub => f.instructions().i64_sub(),
        I64Mul => f.instructions().i64_mul(),
        I64DivS => f.instructions().i64_div_s(),
        I64DivU => f.instructions().i64_div_u(),
        F32Add => f.instructions().f32_add(),
        F32Sub => f.instructions().f32_sub(),
        F32Mul => f.instructions().f32_mul(),
        F32Div => f.instructions().f32_div(),
        F64Add => f.instructions().f64_add(),
        F64Sub => f.instructions().f64_sub(),
        F64Mul => f.instructions().f64_mul(),
        F64Div => f.instructions().f64_div(),
    };
}
