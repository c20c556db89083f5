//! An expression-tree intermediate representation for WebAssembly GC modules.
//!
//! The transformation in [`crate::plan`] and [`crate::generate`] rewrites this
//! IR rather than raw instruction streams: every expression lives in a
//! per-function arena and carries its result type, so the planner can key tape
//! decisions on expression identity and the generator can splice new trees in
//! without renumbering anything.

use crate::util::u32_to_usize;

/// Index of a heap type in a [`Module`]'s type arena.
pub type HeapId = u32;

/// Index of an expression in a [`Func`]'s arena.
pub type ExprId = u32;

/// A result type: zero values for statements, one for ordinary expressions,
/// more for multivalue calls and returns.
pub type Tuple = Box<[ValType]>;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    Ref(RefType),
}

impl ValType {
    /// Whether a gradient can be accumulated directly into a value of this
    /// type.
    pub fn is_float(self) -> bool {
        matches!(self, ValType::F32 | ValType::F64)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapId,
}

/// A struct field or array element type. Packed storage is not modeled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub ty: ValType,
    pub mutable: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FuncSig {
    pub params: Tuple,
    pub results: Tuple,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeapDef {
    Func(FuncSig),
    Struct(Vec<Field>),
    Array(Field),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Literal {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Literal {
    pub fn ty(self) -> ValType {
        match self {
            Literal::I32(_) => ValType::I32,
            Literal::I64(_) => ValType::I64,
            Literal::F32(_) => ValType::F32,
            Literal::F64(_) => ValType::F64,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Literal::I32(x) => x == 0,
            Literal::I64(x) => x == 0,
            Literal::F32(x) => x == 0.,
            Literal::F64(x) => x == 0.,
        }
    }

    /// The zero of the given numeric type.
    pub fn zero(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Literal::I32(0),
            ValType::I64 => Literal::I64(0),
            ValType::F32 => Literal::F32(0.),
            ValType::F64 => Literal::F64(0.),
            ValType::Ref(_) => unreachable!("reference types have no literal zero"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinaryOp {
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64DivU,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
}

impl BinaryOp {
    pub fn result(self) -> ValType {
        use BinaryOp::*;
        match self {
            I32Add | I32Sub | I32Mul | I32DivS | I32DivU => ValType::I32,
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU => ValType::I64,
            F32Add | F32Sub | F32Mul | F32Div => ValType::F32,
            F64Add | F64Sub | F64Mul | F64Div => ValType::F64,
        }
    }

    pub fn is_float(self) -> bool {
        self.result().is_float()
    }

    /// The `add` operator on the same type, used for gradient accumulation.
    pub fn add(ty: ValType) -> Self {
        match ty {
            ValType::F32 => BinaryOp::F32Add,
            ValType::F64 => BinaryOp::F64Add,
            _ => unreachable!("gradients only accumulate in float locals"),
        }
    }

    /// The `sub` operator on the same float type.
    pub fn sub(ty: ValType) -> Self {
        match ty {
            ValType::F32 => BinaryOp::F32Sub,
            ValType::F64 => BinaryOp::F64Sub,
            _ => unreachable!("gradients only accumulate in float locals"),
        }
    }

    pub fn mul(ty: ValType) -> Self {
        match ty {
            ValType::F32 => BinaryOp::F32Mul,
            ValType::F64 => BinaryOp::F64Mul,
            _ => unreachable!("gradients only accumulate in float locals"),
        }
    }

    pub fn div(ty: ValType) -> Self {
        match ty {
            ValType::F32 => BinaryOp::F32Div,
            ValType::F64 => BinaryOp::F64Div,
            _ => unreachable!("gradients only accumulate in float locals"),
        }
    }
}

/// An expression node. Children are arena indices into the owning [`Func`].
///
/// `StructGet`, `TupleMake`, `TupleExtract`, `RefNull`, and `StructNew` with
/// operands never come out of the parser for function bodies under
/// differentiation; they exist so the generator can build tape plumbing and
/// multivalue returns.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Block(Box<[ExprId]>),
    Const(Literal),
    LocalGet(u32),
    LocalSet { local: u32, value: ExprId },
    LocalTee { local: u32, value: ExprId },
    Binary { op: BinaryOp, left: ExprId, right: ExprId },
    Call { target: u32, operands: Box<[ExprId]> },
    StructNew { ty: HeapId, operands: Box<[ExprId]> },
    StructNewDefault { ty: HeapId },
    StructGet { ty: HeapId, object: ExprId, field: u32 },
    ArrayNewDefault { ty: HeapId, size: ExprId },
    ArrayGet { ty: HeapId, array: ExprId, index: ExprId },
    ArraySet { ty: HeapId, array: ExprId, index: ExprId, value: ExprId },
    ArrayLen(ExprId),
    TupleMake(Box<[ExprId]>),
    TupleExtract { tuple: ExprId, index: u32 },
    RefNull(HeapId),
}

/// A function: a signature, locals (parameters first), and a body expression
/// in a private arena.
///
/// Locals are tuple-typed; the parser only produces single-value locals, but
/// the generator uses wider ones to hold multivalue call results. The encoder
/// flattens them back to runs of scalar Wasm locals.
#[derive(Clone, Debug)]
pub struct Func {
    pub name: Option<String>,
    /// Index of this function's [`HeapDef::Func`] signature in the module.
    pub sig: HeapId,
    pub locals: Vec<Tuple>,
    pub body: ExprId,
    exprs: Vec<Expr>,
    tys: Vec<Tuple>,
}

impl Func {
    pub fn new(sig: HeapId) -> Self {
        Self {
            name: None,
            sig,
            locals: Vec::new(),
            body: 0,
            exprs: Vec::new(),
            tys: Vec::new(),
        }
    }

    /// Add an expression with its result type, returning its id.
    pub fn push(&mut self, expr: Expr, ty: impl Into<Tuple>) -> ExprId {
        let id = u32::try_from(self.exprs.len()).unwrap();
        self.exprs.push(expr);
        self.tys.push(ty.into());
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[u32_to_usize(id)]
    }

    pub fn ty(&self, id: ExprId) -> &[ValType] {
        &self.tys[u32_to_usize(id)]
    }

    /// Add a local of the given type, returning its index.
    pub fn local(&mut self, ty: impl Into<Tuple>) -> u32 {
        let i = u32::try_from(self.locals.len()).unwrap();
        self.locals.push(ty.into());
        i
    }
}

#[derive(Clone, Debug)]
pub struct Export {
    pub name: String,
    pub func: u32,
}

/// A module: a heap type arena shared by all functions, the functions
/// themselves, and function exports.
#[derive(Debug, Default)]
pub struct Module {
    pub types: Vec<HeapDef>,
    pub funcs: Vec<Func>,
    pub exports: Vec<Export>,
}

impl Module {
    pub fn push_type(&mut self, def: HeapDef) -> HeapId {
        let id = u32::try_from(self.types.len()).unwrap();
        self.types.push(def);
        id
    }

    pub fn heap(&self, id: HeapId) -> &HeapDef {
        &self.types[u32_to_usize(id)]
    }
}

/// The element field of an array heap type. Only called on type indices the
/// parser has already classified.
pub fn array_elem(types: &[HeapDef], id: HeapId) -> &Field {
    match &types[u32_to_usize(id)] {
        HeapDef::Array(field) => field,
        _ => unreachable!("array instructions always name array types"),
    }
}
