//! Decoding a binary module into the expression IR.
//!
//! Function bodies are tree-ified from the operator stream with an operand
//! stack of expression ids. Only the constructs the differentiator understands
//! are accepted; anything else fails the whole transformation up front.

use wasmparser::{
    CompositeInnerType, ExternalKind, FunctionBody, KnownCustom, Operator, Parser, Payload,
};

use crate::{
    ErrorImpl,
    ir::{self, BinaryOp, Expr, Field, FuncSig, HeapDef, HeapId, Literal, RefType, ValType},
    util::u32_to_usize,
};

pub fn module(wasm: &[u8]) -> crate::Result<ir::Module> {
    let mut module = ir::Module::default();
    let mut func_sigs: Vec<HeapId> = Vec::new();
    for payload in Parser::new(0).parse_all(wasm) {
        match payload? {
            Payload::Version { .. } | Payload::End(_) | Payload::CodeSectionStart { .. } => {}
            Payload::TypeSection(section) => {
                for group in section {
                    for sub in group?.into_types() {
                        if sub.supertype_idx.is_some() || !sub.is_final {
                            return Err(ErrorImpl::Unsupported("subtyping declarations"));
                        }
                        if sub.composite_type.shared {
                            return Err(ErrorImpl::Unsupported("shared composite types"));
                        }
                        let def = match sub.composite_type.inner {
                            CompositeInnerType::Func(f) => {
                                let params = tuple("(types)", f.params())?;
                                let results = tuple("(types)", f.results())?;
                                HeapDef::Func(FuncSig { params, results })
                            }
                            CompositeInnerType::Struct(s) => {
                                let mut fields = Vec::new();
                                for f in s.fields.iter() {
                                    fields.push(field("(types)", f)?);
                                }
                                HeapDef::Struct(fields)
                            }
                            CompositeInnerType::Array(a) => HeapDef::Array(field("(types)", &a.0)?),
                            _ => {
                                return Err(ErrorImpl::Unsupported("composite type kind"));
                            }
                        };
                        module.push_type(def);
                    }
                }
            }
            Payload::FunctionSection(section) => {
                for type_index in section {
                    func_sigs.push(type_index?);
                }
            }
            Payload::ExportSection(section) => {
                for export in section {
                    let e = export?;
                    match e.kind {
                        ExternalKind::Func => module.exports.push(ir::Export {
                            name: e.name.to_string(),
                            func: e.index,
                        }),
                        _ => return Err(ErrorImpl::Unsupported("non-function exports")),
                    }
                }
            }
            Payload::CodeSectionEntry(body) => {
                let index = u32::try_from(module.funcs.len()).unwrap();
                let func = function(&module.types, &func_sigs, index, body)?;
                module.funcs.push(func);
            }
            Payload::CustomSection(section) => {
                if let KnownCustom::Name(reader) = section.as_known() {
                    for entry in reader {
                        if let wasmparser::Name::Function(names) = entry? {
                            for naming in names {
                                let naming = naming?;
                                if let Some(f) =
                                    module.funcs.get_mut(u32_to_usize(naming.index))
                                {
                                    f.name = Some(naming.name.to_string());
                                }
                            }
                        }
                    }
                }
            }
            Payload::ImportSection(_) => return Err(ErrorImpl::Unsupported("imports")),
            _ => return Err(ErrorImpl::Unsupported("section kind")),
        }
    }
    Ok(module)
}

fn tuple(func: &str, tys: &[wasmparser::ValType]) -> crate::Result<ir::Tuple> {
    tys.iter()
        .map(|&ty| val_type(func, ty))
        .collect::<crate::Result<Vec<ValType>>>()
        .map(Into::into)
}

fn val_type(func: &str, ty: wasmparser::ValType) -> crate::Result<ValType> {
    match ty {
        wasmparser::ValType::I32 => Ok(ValType::I32),
        wasmparser::ValType::I64 => Ok(ValType::I64),
        wasmparser::ValType::F32 => Ok(ValType::F32),
        wasmparser::ValType::F64 => Ok(ValType::F64),
        wasmparser::ValType::V128 => Err(ErrorImpl::UnsupportedType {
            func: func.to_string(),
            kind: "v128".to_string(),
        }),
        wasmparser::ValType::Ref(r) => match r.heap_type() {
            wasmparser::HeapType::Concrete(idx) => match idx {
                wasmparser::UnpackedIndex::Module(heap) => Ok(ValType::Ref(RefType {
                    nullable: r.is_nullable(),
                    heap,
                })),
                _ => Err(ErrorImpl::InternalInvariant {
                    func: func.to_string(),
                    msg: "unresolved type index escaped the parser",
                }),
            },
            wasmparser::HeapType::Abstract { .. } => Err(ErrorImpl::UnsupportedType {
                func: func.to_string(),
                kind: format!("{:?}", r),
            }),
        },
    }
}

fn field(func: &str, ft: &wasmparser::FieldType) -> crate::Result<Field> {
    match ft.element_type {
        wasmparser::StorageType::Val(ty) => Ok(Field {
            ty: val_type(func, ty)?,
            mutable: ft.mutable,
        }),
        wasmparser::StorageType::I8 | wasmparser::StorageType::I16 => {
            Err(ErrorImpl::UnsupportedType {
                func: func.to_string(),
                kind: "packed storage".to_string(),
            })
        }
    }
}

struct Body<'a> {
    types: &'a [HeapDef],
    func_sigs: &'a [HeapId],
    name: String,
    func: ir::Func,
    /// Expressions whose values are conceptually on the operand stack.
    stack: Vec<ir::ExprId>,
    /// Completed statements, in source order.
    stmts: Vec<ir::ExprId>,
}

fn function(
    types: &[HeapDef],
    func_sigs: &[HeapId],
    index: u32,
    body: FunctionBody,
) -> crate::Result<ir::Func> {
    let name = index.to_string();
    let sig = *func_sigs.get(u32_to_usize(index)).ok_or(ErrorImpl::Unsupported(
        "function and code section lengths disagree",
    ))?;
    let params = match &types[u32_to_usize(sig)] {
        HeapDef::Func(sig) => sig.params.clone(),
        _ => {
            return Err(ErrorImpl::UnsupportedType {
                func: name,
                kind: "non-function signature".to_string(),
            });
        }
    };
    let mut func = ir::Func::new(sig);
    for &param in params.iter() {
        func.local([param]);
    }
    let mut locals = body.get_locals_reader()?;
    for _ in 0..locals.get_count() {
        let (count, ty) = locals.read()?;
        let ty = val_type(&name, ty)?;
        for _ in 0..count {
            func.local([ty]);
        }
    }
    let mut b = Body {
        types,
        func_sigs,
        name,
        func,
        stack: Vec::new(),
        stmts: Vec::new(),
    };
    let mut operators = body.get_operators_reader()?;
    while !operators.eof() {
        let op = operators.read()?;
        if matches!(op, Operator::End) && operators.eof() {
            break;
        }
        b.instruction(op)?;
    }
    b.finish()
}

impl Body<'_> {
    fn instruction(&mut self, op: Operator<'_>) -> crate::Result<()> {
        match op {
            Operator::I32Const { value } => self.push_const(Literal::I32(value)),
            Operator::I64Const { value } => self.push_const(Literal::I64(value)),
            Operator::F32Const { value } => {
                self.push_const(Literal::F32(f32::from_bits(value.bits())))
            }
            Operator::F64Const { value } => {
                self.push_const(Literal::F64(f64::from_bits(value.bits())))
            }
            Operator::LocalGet { local_index } => {
                let ty = self.local_ty(local_index)?;
                let e = self.func.push(Expr::LocalGet(local_index), ty);
                self.stack.push(e);
            }
            Operator::LocalSet { local_index } => {
                let value = self.pop()?;
                let e = self
                    .func
                    .push(Expr::LocalSet { local: local_index, value }, []);
                self.stmts.push(e);
            }
            Operator::LocalTee { local_index } => {
                let value = self.pop()?;
                let ty = self.local_ty(local_index)?;
                let e = self
                    .func
                    .push(Expr::LocalTee { local: local_index, value }, ty);
                self.stack.push(e);
            }
            Operator::I32Add => self.binary(BinaryOp::I32Add)?,
            Operator::I32Sub => self.binary(BinaryOp::I32Sub)?,
            Operator::I32Mul => self.binary(BinaryOp::I32Mul)?,
            Operator::I32DivS => self.binary(BinaryOp::I32DivS)?,
            Operator::I32DivU => self.binary(BinaryOp::I32DivU)?,
            Operator::I64Add => self.binary(BinaryOp::I64Add)?,
            Operator::I64Sub => self.binary(BinaryOp::I64Sub)?,
            Operator::I64Mul => self.binary(BinaryOp::I64Mul)?,
            Operator::I64DivS => self.binary(BinaryOp::I64DivS)?,
            Operator::I64DivU => self.binary(BinaryOp::I64DivU)?,
            Operator::F32Add => self.binary(BinaryOp::F32Add)?,
            Operator::F32Sub => self.binary(BinaryOp::F32Sub)?,
            Operator::F32Mul => self.binary(BinaryOp::F32Mul)?,
            Operator::F32Div => self.binary(BinaryOp::F32Div)?,
            Operator::F64Add => self.binary(BinaryOp::F64Add)?,
            Operator::F64Sub => self.binary(BinaryOp::F64Sub)?,
            Operator::F64Mul => self.binary(BinaryOp::F64Mul)?,
            Operator::F64Div => self.binary(BinaryOp::F64Div)?,
            Operator::Call { function_index } => {
                let sig = *self.func_sigs.get(u32_to_usize(function_index)).ok_or(
                    ErrorImpl::UnresolvedName {
                        func: self.name.clone(),
                        target: function_index,
                    },
                )?;
                let (params, results) = match &self.types[u32_to_usize(sig)] {
                    HeapDef::Func(sig) => (sig.params.clone(), sig.results.clone()),
                    _ => {
                        return Err(ErrorImpl::InternalInvariant {
                            func: self.name.clone(),
                            msg: "call target signature is not a function type",
                        });
                    }
                };
                let operands = self.pop_many(params.len())?;
                let e = self.func.push(
                    Expr::Call {
                        target: function_index,
                        operands,
                    },
                    results.clone(),
                );
                if results.is_empty() {
                    self.stmts.push(e);
                } else {
                    self.stack.push(e);
                }
            }
            Operator::ReturnCall { .. }
            | Operator::ReturnCallIndirect { .. }
            | Operator::ReturnCallRef { .. } => {
                return Err(ErrorImpl::TailCall {
                    func: self.name.clone(),
                });
            }
            Operator::StructNew { struct_type_index } => {
                let n = match &self.types[u32_to_usize(struct_type_index)] {
                    HeapDef::Struct(fields) => fields.len(),
                    _ => {
                        return Err(ErrorImpl::InternalInvariant {
                            func: self.name.clone(),
                            msg: "struct.new names a non-struct type",
                        });
                    }
                };
                let operands = self.pop_many(n)?;
                let e = self.func.push(
                    Expr::StructNew {
                        ty: struct_type_index,
                        operands,
                    },
                    [self.ref_to(struct_type_index)],
                );
                self.stack.push(e);
            }
            Operator::StructNewDefault { struct_type_index } => {
                let e = self.func.push(
                    Expr::StructNewDefault {
                        ty: struct_type_index,
                    },
                    [self.ref_to(struct_type_index)],
                );
                self.stack.push(e);
            }
            Operator::ArrayNew { .. } | Operator::ArrayNewFixed { .. } => {
                return Err(ErrorImpl::InvalidInit {
                    func: self.name.clone(),
                });
            }
            Operator::ArrayNewDefault { array_type_index } => {
                let size = self.pop()?;
                let e = self.func.push(
                    Expr::ArrayNewDefault {
                        ty: array_type_index,
                        size,
                    },
                    [self.ref_to(array_type_index)],
                );
                self.stack.push(e);
            }
            Operator::ArrayGet { array_type_index } => {
                let index = self.pop()?;
                let array = self.pop()?;
                let elem = match &self.types[u32_to_usize(array_type_index)] {
                    HeapDef::Array(f) => f.ty,
                    _ => {
                        return Err(ErrorImpl::InternalInvariant {
                            func: self.name.clone(),
                            msg: "array.get names a non-array type",
                        });
                    }
                };
                let e = self.func.push(
                    Expr::ArrayGet {
                        ty: array_type_index,
                        array,
                        index,
                    },
                    [elem],
                );
                self.stack.push(e);
            }
            Operator::ArraySet { array_type_index } => {
                let value = self.pop()?;
                let index = self.pop()?;
                let array = self.pop()?;
                let e = self.func.push(
                    Expr::ArraySet {
                        ty: array_type_index,
                        array,
                        index,
                        value,
                    },
                    [],
                );
                self.stmts.push(e);
            }
            Operator::ArrayLen => {
                let array = self.pop()?;
                let e = self.func.push(Expr::ArrayLen(array), [ValType::I32]);
                self.stack.push(e);
            }
            Operator::V128Const { .. } => {
                return Err(ErrorImpl::UnsupportedConstant {
                    func: self.name.clone(),
                    kind: "v128",
                });
            }
            Operator::RefNull { .. } => {
                return Err(ErrorImpl::UnsupportedConstant {
                    func: self.name.clone(),
                    kind: "null reference",
                });
            }
            Operator::RefFunc { .. } => {
                return Err(ErrorImpl::UnsupportedConstant {
                    func: self.name.clone(),
                    kind: "function reference",
                });
            }
            other => {
                return Err(ErrorImpl::UnsupportedExpression {
                    func: self.name.clone(),
                    what: format!("{other:?}"),
                });
            }
        }
        Ok(())
    }

    fn finish(mut self) -> crate::Result<ir::Func> {
        let mut children = std::mem::take(&mut self.stmts);
        let results = std::mem::take(&mut self.stack);
        let body = match (children.len(), results.len()) {
            (0, 1) => results[0],
            (_, n) => {
                let ty: ir::Tuple = match n {
                    0 => Box::new([]),
                    1 => {
                        children.push(results[0]);
                        self.func.ty(results[0]).into()
                    }
                    _ => {
                        let ty: Vec<ValType> = results
                            .iter()
                            .flat_map(|&e| self.func.ty(e).iter().copied())
                            .collect();
                        let e = self
                            .func
                            .push(Expr::TupleMake(results.into()), ty.clone());
                        children.push(e);
                        ty.into()
                    }
                };
                self.func.push(Expr::Block(children.into()), ty)
            }
        };
        self.func.body = body;
        Ok(self.func)
    }

    fn push_const(&mut self, literal: Literal) {
        let e = self.func.push(Expr::Const(literal), [literal.ty()]);
        self.stack.push(e);
    }

    fn binary(&mut self, op: BinaryOp) -> crate::Result<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let e = self
            .func
            .push(Expr::Binary { op, left, right }, [op.result()]);
        self.stack.push(e);
        Ok(())
    }

    fn pop(&mut self) -> crate::Result<ir::ExprId> {
        self.stack.pop().ok_or(ErrorImpl::UnsupportedExpression {
            func: self.name.clone(),
            what: "operand stack underflow".to_string(),
        })
    }

    fn pop_many(&mut self, n: usize) -> crate::Result<Box<[ir::ExprId]>> {
        let mut operands = Vec::with_capacity(n);
        for _ in 0..n {
            operands.push(self.pop()?);
        }
        operands.reverse();
        Ok(operands.into())
    }

    fn local_ty(&self, index: u32) -> crate::Result<ir::Tuple> {
        self.func
            .locals
            .get(u32_to_usize(index))
            .cloned()
            .ok_or(ErrorImpl::UnsupportedExpression {
                func: self.name.clone(),
                what: "local index out of range".to_string(),
            })
    }

    fn ref_to(&self, heap: HeapId) -> ValType {
        ValType::Ref(RefType {
            nullable: false,
            heap,
        })
    }
}
