//! Mapping from primal types to gradient types.
//!
//! Floats are their own gradients; integers carry no gradient; structs and
//! arrays map structurally, dropping fields whose gradient is empty. A field
//! that survives becomes mutable whenever the primal was mutable or the primal
//! type is a float, so the backward pass can accumulate in place.

use std::collections::HashMap;

use crate::{
    ErrorImpl,
    ir::{Field, HeapDef, HeapId, RefType, Tuple, ValType},
};

/// Memoized gradient typing. One mapper is shared across a whole module
/// transformation so that equal primal heap types get equal gradient heap
/// types.
#[derive(Default)]
pub struct TypeMapper {
    memo: HashMap<HeapId, HeapId>,
}

impl TypeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether differentiating a value of this type forces mutability onto
    /// its gradient storage.
    pub fn differentiable(ty: ValType) -> bool {
        ty.is_float()
    }

    /// The gradient of a value type, or `None` when it carries no gradient.
    pub fn value(
        &mut self,
        types: &mut Vec<HeapDef>,
        func: &str,
        ty: ValType,
    ) -> crate::Result<Option<ValType>> {
        Ok(match ty {
            ValType::F32 | ValType::F64 => Some(ty),
            ValType::I32 | ValType::I64 => None,
            ValType::Ref(r) => Some(ValType::Ref(RefType {
                // Gradient references are nullable so the backward pass can
                // seed reference-typed arguments with `ref.null`.
                nullable: true,
                heap: self.heap(types, func, r.heap)?,
            })),
        })
    }

    /// Map a tuple element-wise, dropping components without a gradient.
    pub fn tuple(
        &mut self,
        types: &mut Vec<HeapDef>,
        func: &str,
        tys: &[ValType],
    ) -> crate::Result<Tuple> {
        let mut out = Vec::new();
        for &ty in tys {
            if let Some(g) = self.value(types, func, ty)? {
                out.push(g);
            }
        }
        Ok(out.into())
    }

    /// The gradient heap type of a struct or array heap type, creating it in
    /// the arena on first use.
    pub fn heap(
        &mut self,
        types: &mut Vec<HeapDef>,
        func: &str,
        id: HeapId,
    ) -> crate::Result<HeapId> {
        if let Some(&g) = self.memo.get(&id) {
            return Ok(g);
        }
        // Reserve the arena slot before recursing so self-referential heap
        // types terminate.
        let g = u32::try_from(types.len()).unwrap();
        types.push(HeapDef::Struct(Vec::new()));
        self.memo.insert(id, g);
        let def = match types[crate::util::u32_to_usize(id)].clone() {
            HeapDef::Func(_) => {
                return Err(ErrorImpl::UnsupportedType {
                    func: func.to_string(),
                    kind: "function reference".to_string(),
                });
            }
            HeapDef::Struct(fields) => {
                let mut mapped = Vec::new();
                for field in fields {
                    if let Some(ty) = self.value(types, func, field.ty)? {
                        mapped.push(Field {
                            ty,
                            mutable: field.mutable || Self::differentiable(field.ty),
                        });
                    }
                }
                HeapDef::Struct(mapped)
            }
            HeapDef::Array(elem) => match self.value(types, func, elem.ty)? {
                // An array whose elements carry no gradient collapses to an
                // empty struct.
                None => HeapDef::Struct(Vec::new()),
                Some(ty) => HeapDef::Array(Field {
                    ty,
                    mutable: elem.mutable || Self::differentiable(elem.ty),
                }),
            },
        };
        types[crate::util::u32_to_usize(g)] = def;
        Ok(g)
    }
}

#[cfg(test)]
mod tests {
    use super::TypeMapper;
    use crate::ir::{Field, FuncSig, HeapDef, RefType, ValType};

    #[test]
    fn test_floats_fixed() {
        let mut types = Vec::new();
        let mut mapper = TypeMapper::new();
        for ty in [ValType::F32, ValType::F64] {
            assert_eq!(mapper.value(&mut types, "f", ty).unwrap(), Some(ty));
        }
    }

    #[test]
    fn test_integers_unit() {
        let mut types = Vec::new();
        let mut mapper = TypeMapper::new();
        for ty in [ValType::I32, ValType::I64] {
            assert_eq!(mapper.value(&mut types, "f", ty).unwrap(), None);
        }
    }

    #[test]
    fn test_tuple_drops_units() {
        let mut types = Vec::new();
        let mut mapper = TypeMapper::new();
        let mapped = mapper
            .tuple(
                &mut types,
                "f",
                &[ValType::F64, ValType::I32, ValType::F32],
            )
            .unwrap();
        assert_eq!(&*mapped, &[ValType::F64, ValType::F32]);
        assert_eq!(&*mapper.tuple(&mut types, "f", &[ValType::I64]).unwrap(), &[]);
    }

    #[test]
    fn test_struct_drops_units_and_flips_mutability() {
        let mut types = vec![HeapDef::Struct(vec![
            Field {
                ty: ValType::F64,
                mutable: false,
            },
            Field {
                ty: ValType::I32,
                mutable: true,
            },
        ])];
        let mut mapper = TypeMapper::new();
        let g = mapper.heap(&mut types, "f", 0).unwrap();
        assert_eq!(
            types[g as usize],
            HeapDef::Struct(vec![Field {
                ty: ValType::F64,
                mutable: true,
            }])
        );
    }

    #[test]
    fn test_integer_array_collapses() {
        let mut types = vec![HeapDef::Array(Field {
            ty: ValType::I64,
            mutable: true,
        })];
        let mut mapper = TypeMapper::new();
        let g = mapper.heap(&mut types, "f", 0).unwrap();
        assert_eq!(types[g as usize], HeapDef::Struct(Vec::new()));
    }

    #[test]
    fn test_float_array_stays_array() {
        let mut types = vec![HeapDef::Array(Field {
            ty: ValType::F64,
            mutable: false,
        })];
        let mut mapper = TypeMapper::new();
        let g = mapper.heap(&mut types, "f", 0).unwrap();
        assert_eq!(
            types[g as usize],
            HeapDef::Array(Field {
                ty: ValType::F64,
                mutable: true,
            })
        );
    }

    #[test]
    fn test_gradient_idempotent() {
        let mut types = vec![HeapDef::Array(Field {
            ty: ValType::F32,
            mutable: false,
        })];
        let mut mapper = TypeMapper::new();
        let g = mapper.heap(&mut types, "f", 0).unwrap();
        let gg = mapper.heap(&mut types, "f", g).unwrap();
        assert_eq!(types[g as usize], types[gg as usize]);
    }

    #[test]
    fn test_memoized() {
        let mut types = vec![HeapDef::Array(Field {
            ty: ValType::F64,
            mutable: true,
        })];
        let mut mapper = TypeMapper::new();
        let g1 = mapper.heap(&mut types, "f", 0).unwrap();
        let g2 = mapper.heap(&mut types, "f", 0).unwrap();
        assert_eq!(g1, g2);
    }

    #[test]
    fn test_function_reference_rejected() {
        let mut types = vec![HeapDef::Func(FuncSig {
            params: Box::new([]),
            results: Box::new([]),
        })];
        assert!(
            TypeMapper::new()
                .value(
                    &mut types.clone(),
                    "f",
                    ValType::Ref(RefType {
                        nullable: false,
                        heap: 0,
                    }),
                )
                .is_err()
        );
        assert!(TypeMapper::new().heap(&mut types, "f", 0).is_err());
    }
}
