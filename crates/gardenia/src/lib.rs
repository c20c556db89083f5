//! Reverse-mode automatic differentiation for WebAssembly GC modules.
//!
//! See [`Autodiff`] for the entry point: for every function `F` in the input
//! module, the transformation appends a forward pass computing `F`'s result
//! alongside a tape of intermediate values, and a backward pass turning a
//! result cotangent plus that tape into input gradients.

mod api;
mod encode;
mod generate;
#[cfg(test)]
pub(crate) mod interp;
mod ir;
mod name;
mod parse;
mod plan;
mod reverse;
mod types;
mod util;
mod validate;

use wasmparser::BinaryReaderError;

pub use api::*;

#[derive(Debug, thiserror::Error)]
enum ErrorImpl {
    #[error("Wasm parsing or validation error: {0}")]
    Parse(#[from] BinaryReaderError),

    #[error("unsupported Wasm module: {0}")]
    Unsupported(&'static str),

    #[error("function {func}: unsupported type: {kind}")]
    UnsupportedType { func: String, kind: String },

    #[error("function {func}: unsupported expression: {what}")]
    UnsupportedExpression { func: String, what: String },

    #[error("function {func}: unsupported constant: {kind}")]
    UnsupportedConstant { func: String, kind: &'static str },

    #[error("function {func}: non-zero constant was assigned a taped gradient")]
    NonZeroGradientConstant { func: String },

    #[error("function {func}: tail calls cannot be differentiated")]
    TailCall { func: String },

    #[error("function {func}: non-default initializer in a differentiated allocation")]
    InvalidInit { func: String },

    #[error("function {func}: call target {target} does not name a function in this module")]
    UnresolvedName { func: String, target: u32 },

    #[error("function {func}: internal invariant violated: {msg}")]
    InternalInvariant { func: String, msg: &'static str },
}

type Result<T> = std::result::Result<T, ErrorImpl>;

struct Validate;

struct NoValidate;
