//! The driver: plan every function, build the tape struct types, mint names
//! for the new passes, generate them, and re-encode the module.

#[cfg(test)]
mod tests;

use crate::{
    NoValidate, Validate, encode, generate,
    ir::{Export, Field, HeapDef, HeapId, Module},
    name::NameSet,
    parse, plan,
    types::TypeMapper,
    util::u32_to_usize,
    validate::{self, ModuleValidator},
};

pub trait ReverseTransform {
    fn transform(&self, wasm: &[u8]) -> crate::Result<Vec<u8>>;
}

impl ReverseTransform for Validate {
    fn transform(&self, wasm: &[u8]) -> crate::Result<Vec<u8>> {
        transform(validate::validator(), wasm)
    }
}

impl ReverseTransform for NoValidate {
    fn transform(&self, wasm: &[u8]) -> crate::Result<Vec<u8>> {
        transform((), wasm)
    }
}

pub fn transform(validator: impl ModuleValidator, wasm: &[u8]) -> crate::Result<Vec<u8>> {
    let module = transform_ir(validator, wasm)?;
    Ok(encode::module(&module))
}

/// The whole transformation, stopping just short of binary encoding.
pub fn transform_ir(
    mut validator: impl ModuleValidator,
    wasm: &[u8],
) -> crate::Result<Module> {
    validator.validate(wasm)?;
    let mut module = parse::module(wasm)?;
    let num_funcs = u32::try_from(module.funcs.len()).unwrap();

    // Reserve one tape struct type per function up front: call sites type
    // their sub-tape fields against the callee's tape before the callee has
    // been planned, and the single shared type arena plays the role of one
    // big recursion group.
    let tapes: Vec<HeapId> = (0..num_funcs)
        .map(|_| module.push_type(HeapDef::Struct(Vec::new())))
        .collect();

    let mut mapper = TypeMapper::new();
    let mut plans = Vec::with_capacity(u32_to_usize(num_funcs));
    for i in 0..num_funcs {
        let plan = {
            let Module { types, funcs, .. } = &mut module;
            plan::function(types, &mut mapper, funcs, &tapes, i)?
        };
        let fields = plan
            .fields
            .iter()
            .map(|&ty| Field { ty, mutable: false })
            .collect();
        module.types[u32_to_usize(tapes[u32_to_usize(i)])] = HeapDef::Struct(fields);
        plans.push(plan);
    }

    // Mint forward/backward names against everything already taken.
    let mut names = NameSet::new();
    for export in &module.exports {
        names.insert(&export.name);
    }
    for func in &module.funcs {
        if let Some(name) = &func.name {
            names.insert(name);
        }
    }
    let mut minted = Vec::with_capacity(u32_to_usize(num_funcs));
    for (i, func) in module.funcs.iter().enumerate() {
        let export = module
            .exports
            .iter()
            .find(|e| u32_to_usize(e.func) == i)
            .map(|e| e.name.as_str());
        let base = match (export, &func.name) {
            (Some(name), _) => name.to_string(),
            (None, Some(name)) => name.clone(),
            (None, None) => format!("f{i}"),
        };
        minted.push((
            names.fresh(&format!("{base}_fwd")),
            names.fresh(&format!("{base}_bwd")),
        ));
    }

    let mut pairs = Vec::with_capacity(u32_to_usize(num_funcs));
    for i in 0..num_funcs {
        let Module { types, funcs, .. } = &mut module;
        pairs.push(generate::function(
            types, &mut mapper, funcs, &tapes, &plans, i, num_funcs,
        )?);
    }
    let exported: Vec<u32> = {
        let mut seen = Vec::new();
        for export in &module.exports {
            if !seen.contains(&export.func) {
                seen.push(export.func);
            }
        }
        seen
    };
    for (i, (mut pair, (fwd_name, bwd_name))) in
        pairs.into_iter().zip(minted.into_iter()).enumerate()
    {
        pair.fwd.name = Some(fwd_name);
        pair.bwd.name = Some(bwd_name);
        module.funcs.push(pair.fwd);
        module.funcs.push(pair.bwd);
        let i = u32::try_from(i).unwrap();
        if exported.contains(&i) {
            for k in 0..2u32 {
                let func = num_funcs + 2 * i + k;
                let name = module.funcs[u32_to_usize(func)]
                    .name
                    .clone()
                    .expect("generated functions are always named");
                module.exports.push(Export { name, func });
            }
        }
    }
    Ok(module)
}
