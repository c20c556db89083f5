use crate::{ErrorImpl, NoValidate, Validate, reverse::ReverseTransform};

/// An error that occurred during code transformation.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error {
    inner: ErrorImpl,
}

/// WebAssembly code transformation to perform reverse mode automatic
/// differentiation.
///
/// Use [`Autodiff::new`] to create a config, then [`Autodiff::transform`] to
/// process a Wasm module. For every function `square` in the input, the output
/// additionally exports `square_fwd` (which returns the original result, the
/// forward gradients, and an opaque tape reference) and `square_bwd` (which
/// takes gradient seeds, the result cotangents, and the tape, and returns the
/// input gradients).
///
/// For example, if you have [`wat`][] installed:
///
/// ```
/// let input = wat::parse_str(r#"
/// (module
///   (func (export "square") (param f64) (result f64)
///     (f64.mul (local.get 0) (local.get 0))))
/// "#).unwrap();
///
/// let ad = gardenia::Autodiff::new();
/// let output = ad.transform(&input).unwrap();
///
/// let text = wasmprinter::print_bytes(&output).unwrap();
/// assert!(text.contains("square_fwd"));
/// assert!(text.contains("square_bwd"));
/// ```
///
/// [`wat`]: https://crates.io/crates/wat
pub struct Autodiff {
    runner: Box<dyn ReverseTransform>,
}

impl Default for Autodiff {
    fn default() -> Self {
        Self {
            runner: Box::new(Validate),
        }
    }
}

impl Autodiff {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Do not validate input Wasm.
    pub fn no_validate() -> Self {
        Self {
            runner: Box::new(NoValidate),
        }
    }

    /// Transform a WebAssembly module using this configuration.
    pub fn transform(&self, wasm: &[u8]) -> Result<Vec<u8>, Error> {
        self.runner
            .transform(wasm)
            .map_err(|inner| Error { inner })
    }
}
