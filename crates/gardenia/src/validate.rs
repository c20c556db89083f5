//! Optional validation of the input module before transformation.

use wasmparser::{Validator, WasmFeatures};

/// Validation seam: either a real [`wasmparser::Validator`] or `()` to skip.
pub trait ModuleValidator {
    fn validate(&mut self, wasm: &[u8]) -> wasmparser::Result<()>;
}

impl ModuleValidator for () {
    fn validate(&mut self, _: &[u8]) -> wasmparser::Result<()> {
        Ok(())
    }
}

impl ModuleValidator for Validator {
    fn validate(&mut self, wasm: &[u8]) -> wasmparser::Result<()> {
        self.validate_all(wasm)?;
        Ok(())
    }
}

/// The feature set the transformation expects from input modules.
pub fn features() -> WasmFeatures {
    WasmFeatures::default()
        | WasmFeatures::MULTI_VALUE
        | WasmFeatures::REFERENCE_TYPES
        | WasmFeatures::FUNCTION_REFERENCES
        | WasmFeatures::GC
}

pub fn validator() -> Validator {
    Validator::new_with_features(features())
}
