use rstest::rstest;

use crate::{
    Autodiff, encode,
    interp::{self, Val},
    ir::{HeapDef, Module},
    parse, plan,
    reverse::transform_ir,
    types::TypeMapper,
    validate,
};

/// Transform a wat module and validate the encoded output.
fn compile(wat: &str) -> Module {
    let wasm = wat::parse_str(wat).unwrap();
    let module = transform_ir(validate::validator(), &wasm).unwrap();
    let bytes = encode::module(&module);
    wasmparser::Validator::new_with_features(validate::features())
        .validate_all(&bytes)
        .unwrap();
    module
}

fn export(module: &Module, name: &str) -> u32 {
    module
        .exports
        .iter()
        .find(|e| e.name == name)
        .unwrap_or_else(|| panic!("no export named {name}"))
        .func
}

/// Run the forward pass of an all-`f64` function with zero input gradients.
fn forward(module: &Module, name: &str, inputs: &[f64]) -> Vec<Val> {
    let mut args: Vec<Val> = inputs.iter().map(|&x| Val::F64(x)).collect();
    args.extend(inputs.iter().map(|_| Val::F64(0.)));
    interp::call(module, export(module, &format!("{name}_fwd")), &args)
}

/// Run the backward pass with the given seeds, cotangents, and tape.
fn backward(
    module: &Module,
    name: &str,
    seeds: &[f64],
    cotangents: &[f64],
    tape: Val,
) -> Vec<f64> {
    let mut args: Vec<Val> = seeds.iter().map(|&x| Val::F64(x)).collect();
    args.extend(cotangents.iter().map(|&x| Val::F64(x)));
    args.push(tape);
    interp::call(module, export(module, &format!("{name}_bwd")), &args)
        .iter()
        .map(Val::f64)
        .collect()
}

struct Backprop {
    wat: &'static str,
    name: &'static str,
    input: Vec<f64>,
    output: f64,
    cotangent: f64,
    gradient: Vec<f64>,
}

impl Backprop {
    fn test(self) {
        let module = compile(self.wat);
        let result = forward(&module, self.name, &self.input);
        assert_eq!(result[0].f64(), self.output);
        // With zero input gradients, the forward gradient of the result is
        // zero.
        assert_eq!(result[1].f64(), 0.);
        let tape = result.last().unwrap().clone();
        let seeds = vec![0.; self.input.len()];
        let gradient = backward(&module, self.name, &seeds, &[self.cotangent], tape);
        assert_eq!(gradient, self.gradient);
    }
}

#[test]
fn test_square() {
    Backprop {
        wat: include_str!("../wat/square.wat"),
        name: "square",
        input: vec![3.],
        output: 9.,
        cotangent: 1.,
        gradient: vec![6.],
    }
    .test()
}

#[test]
fn test_square_seed() {
    let module = compile(include_str!("../wat/square.wat"));
    let result = forward(&module, "square", &[3.]);
    let tape = result.last().unwrap().clone();
    // Input gradient seeds accumulate on top of the propagated cotangent.
    let gradient = backward(&module, "square", &[5.], &[1.], tape);
    assert_eq!(gradient, vec![11.]);
}

#[test]
fn test_sub() {
    Backprop {
        wat: include_str!("../wat/sub.wat"),
        name: "sub",
        input: vec![5., 3.],
        output: 2.,
        cotangent: 1.,
        gradient: vec![1., -1.],
    }
    .test()
}

#[test]
fn test_div() {
    Backprop {
        wat: include_str!("../wat/div.wat"),
        name: "div",
        input: vec![3., 2.],
        output: 1.5,
        cotangent: 1.,
        gradient: vec![0.5, -0.75],
    }
    .test()
}

#[test]
fn test_tesseract() {
    Backprop {
        wat: include_str!("../wat/tesseract.wat"),
        name: "tesseract",
        input: vec![5.],
        output: 625.,
        cotangent: 1.,
        gradient: vec![500.],
    }
    .test()
}

#[test]
fn test_polynomial() {
    Backprop {
        wat: include_str!("../wat/polynomial.wat"),
        name: "polynomial",
        input: vec![2., 2.],
        output: 109.,
        cotangent: 1.,
        gradient: vec![88., 100.],
    }
    .test()
}

#[test]
fn test_compose_gf() {
    Backprop {
        wat: include_str!("../wat/compose.wat"),
        name: "gf",
        input: vec![5.],
        output: 26.,
        cotangent: 1.,
        gradient: vec![10.],
    }
    .test()
}

#[test]
fn test_compose_fg() {
    Backprop {
        wat: include_str!("../wat/compose.wat"),
        name: "fg",
        input: vec![5.],
        output: 36.,
        cotangent: 1.,
        gradient: vec![12.],
    }
    .test()
}

#[test]
fn test_local_set_alias() {
    // y = x; x * y must see both factors' contributions.
    Backprop {
        wat: include_str!("../wat/alias.wat"),
        name: "alias",
        input: vec![3.],
        output: 9.,
        cotangent: 1.,
        gradient: vec![6.],
    }
    .test()
}

#[test]
fn test_local_set_clobber() {
    let module = compile(include_str!("../wat/clobber.wat"));
    let result = forward(&module, "clobber", &[1., 2.]);
    assert_eq!(result[0].f64(), 2.);
    assert_eq!(result[1].f64(), 2.);
    let tape = result.last().unwrap().clone();
    let gradient = backward(&module, "clobber", &[0., 0.], &[3., 4.], tape);
    assert_eq!(gradient, vec![0., 7.]);
}

#[test]
fn test_quartic_array() {
    Backprop {
        wat: include_str!("../wat/quartic.wat"),
        name: "quartic",
        input: vec![2.],
        output: 16.,
        cotangent: 1.,
        gradient: vec![32.],
    }
    .test()
}

#[test]
fn test_integer_array() {
    let module = compile(include_str!("../wat/pick.wat"));
    // Integer parameters carry no gradient, so the forward pass takes only
    // the primal and the backward pass consumes only the tape.
    let result = interp::call(&module, export(&module, "pick_fwd"), &[Val::I32(7)]);
    assert_eq!(result[0].i32(), 7);
    let tape = result.last().unwrap().clone();
    let gradient = interp::call(&module, export(&module, "pick_bwd"), &[tape]);
    assert!(gradient.is_empty());
}

#[test]
fn test_struct_new() {
    let module = compile(
        r#"
(module
  (type $s (struct))
  (func (export "mk") (result (ref $s))
    (struct.new $s)))
"#,
    );
    let result = interp::call(&module, export(&module, "mk_fwd"), &[]);
    assert!(matches!(result[0], Val::Obj(_)));
    let tape = result.last().unwrap().clone();
    // The result cotangent is reference-typed; a null stands in for "no
    // adjoint".
    let gradient = interp::call(&module, export(&module, "mk_bwd"), &[Val::Null, tape]);
    assert!(gradient.is_empty());
}

#[test]
fn test_tape_isolation() {
    let module = compile(include_str!("../wat/square.wat"));
    let first = forward(&module, "square", &[3.]);
    let second = forward(&module, "square", &[4.]);
    let tape1 = first.last().unwrap().clone();
    let tape2 = second.last().unwrap().clone();
    // Consuming the tapes out of order still pairs each with its own call.
    assert_eq!(backward(&module, "square", &[0.], &[1.], tape2), vec![8.]);
    assert_eq!(backward(&module, "square", &[0.], &[1.], tape1), vec![6.]);
}

#[rstest]
#[case(2., 2.)]
#[case(0.5, -1.25)]
#[case(-3., 0.25)]
fn test_polynomial_jacobian(#[case] x: f64, #[case] y: f64) {
    let wat = include_str!("../wat/polynomial.wat");
    let wasm = wat::parse_str(wat).unwrap();
    let original = parse::module(&wasm).unwrap();
    let primal = export(&original, "polynomial");
    let module = compile(wat);
    let result = forward(&module, "polynomial", &[x, y]);
    let tape = result.last().unwrap().clone();
    let gradient = backward(&module, "polynomial", &[0., 0.], &[1.], tape);
    let h = 1e-5;
    for k in 0..2 {
        let mut hi = [x, y];
        let mut lo = [x, y];
        hi[k] += h;
        lo[k] -= h;
        let f = |args: &[f64]| {
            let vals: Vec<Val> = args.iter().map(|&v| Val::F64(v)).collect();
            interp::call(&original, primal, &vals)[0].f64()
        };
        let estimate = (f(&hi) - f(&lo)) / (2. * h);
        assert!(
            (gradient[k] - estimate).abs() < 1e-6,
            "gradient {k}: {} vs finite difference {estimate}",
            gradient[k],
        );
    }
}

#[test]
fn test_primal_preserved() {
    let wat = include_str!("../wat/polynomial.wat");
    let wasm = wat::parse_str(wat).unwrap();
    let original = parse::module(&wasm).unwrap();
    let primal = export(&original, "polynomial");
    let module = compile(wat);
    for (x, y) in [(2., 2.), (1.5, -0.5), (0., 3.)] {
        let direct = interp::call(&original, primal, &[Val::F64(x), Val::F64(y)])[0].f64();
        let result = forward(&module, "polynomial", &[x, y]);
        assert_eq!(result[0].f64(), direct);
    }
}

#[test]
fn test_name_collisions() {
    let module = compile(include_str!("../wat/names.wat"));
    let mut names: Vec<&str> = module.exports.iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    let before = names.len();
    names.dedup();
    assert_eq!(names.len(), before, "duplicate export names: {names:?}");
    // The existing `square_fwd` export forces a suffixed mint.
    assert!(names.contains(&"square_fwd2"));
}

#[test]
fn test_planning_deterministic() {
    let wasm = wat::parse_str(include_str!("../wat/polynomial.wat")).unwrap();
    let mut module = parse::module(&wasm).unwrap();
    let n = u32::try_from(module.funcs.len()).unwrap();
    let tapes: Vec<u32> = (0..n)
        .map(|_| module.push_type(HeapDef::Struct(Vec::new())))
        .collect();
    let mut mapper = TypeMapper::new();
    let Module { types, funcs, .. } = &mut module;
    let first = plan::function(types, &mut mapper, funcs, &tapes, 0).unwrap();
    let second = plan::function(types, &mut mapper, funcs, &tapes, 0).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_transform_deterministic() {
    let wasm = wat::parse_str(include_str!("../wat/compose.wat")).unwrap();
    let ad = Autodiff::new();
    assert_eq!(ad.transform(&wasm).unwrap(), ad.transform(&wasm).unwrap());
}

#[test]
fn test_loop_rejected() {
    let wasm = wat::parse_str(
        r#"
(module
  (func (export "spin")
    (loop)))
"#,
    )
    .unwrap();
    let err = Autodiff::new().transform(&wasm).unwrap_err();
    assert!(err.to_string().contains("unsupported expression"));
}

#[test]
fn test_sqrt_rejected() {
    let wasm = wat::parse_str(
        r#"
(module
  (func (export "sqrt") (param f64) (result f64)
    (f64.sqrt (local.get 0))))
"#,
    )
    .unwrap();
    let err = Autodiff::new().transform(&wasm).unwrap_err();
    assert!(err.to_string().contains("unsupported expression"));
}

#[test]
fn test_tail_call_rejected() {
    let wasm = wat::parse_str(
        r#"
(module
  (func $f (param f64) (result f64)
    (return_call $f (local.get 0))))
"#,
    )
    .unwrap();
    let err = Autodiff::new().transform(&wasm).unwrap_err();
    assert!(err.to_string().contains("tail calls"));
}

#[test]
fn test_imports_rejected() {
    let wasm = wat::parse_str(
        r#"
(module
  (import "env" "f" (func (param f64) (result f64))))
"#,
    )
    .unwrap();
    let err = Autodiff::new().transform(&wasm).unwrap_err();
    assert!(err.to_string().contains("imports"));
}

#[test]
fn test_struct_new_with_operands_rejected() {
    let wasm = wat::parse_str(
        r#"
(module
  (type $s (struct (field f64)))
  (func (export "mk") (param f64) (result (ref $s))
    (struct.new $s (local.get 0))))
"#,
    )
    .unwrap();
    let err = Autodiff::new().transform(&wasm).unwrap_err();
    assert!(err.to_string().contains("non-default initializer"));
}
