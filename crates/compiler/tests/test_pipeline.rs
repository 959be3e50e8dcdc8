//! End-to-end pipeline tests: source text in, verified artifacts out.

use moltc::backend::sandbox::build_sandbox;
use moltc::lir::LOp;
use moltc::{compile_source, compile_to_ir, BuildConfig};

fn config() -> BuildConfig {
    BuildConfig::default().with_module("demo", "1.0.0")
}

#[test]
fn test_deterministic_build_bytes() {
    // The same program, manifest, and seed produce byte-identical
    // sandbox artifacts and IR text.
    let src = "def greet(name):\n    return \"hello \" + name\n\nx = greet(\"world\")\nprint(x)\n";
    let build = || {
        let program = compile_source(src, "m.mt", "m", &config()).unwrap();
        let art = build_sandbox(&program.lir, &config()).unwrap();
        (art.module.encode().unwrap(), art.manifest.to_json().unwrap())
    };
    let (mod_a, man_a) = build();
    let (mod_b, man_b) = build();
    assert_eq!(mod_a, mod_b);
    assert_eq!(man_a, man_b);

    let ir_a = compile_to_ir(src, &config()).unwrap();
    let ir_b = compile_to_ir(src, &config()).unwrap();
    assert_eq!(ir_a, ir_b);
}

#[test]
fn test_shape_specialization_emits_fixed_offsets() {
    // Every call site passes a literal {"x": int, "y": int}: the
    // specialized body must read both fields at fixed offsets with no
    // hash-lookup intrinsic.
    let src = "def f(p):\n    return p[\"x\"] + p[\"y\"]\n\na = f({\"x\": 3, \"y\": 4})\nb = f({\"x\": 1, \"y\": 2})\nprint(a)\n";
    let program = compile_source(src, "m.mt", "m", &config()).unwrap();
    let spec = program
        .lir
        .functions
        .iter()
        .find(|f| f.name.starts_with("m.f$spec"))
        .expect("specialized variant of f");
    let field_loads = spec
        .blocks
        .iter()
        .flat_map(|b| &b.ops)
        .filter(|op| matches!(op, LOp::LoadField { .. }))
        .count();
    assert_eq!(field_loads, 2);
    let hash_lookups = spec.blocks.iter().flat_map(|b| &b.ops).any(|op| {
        matches!(
            op,
            LOp::CallIntrinsic {
                id: molt_core::Intrinsic::MapGet,
                ..
            }
        )
    });
    assert!(!hash_lookups);
}

#[test]
fn test_retain_release_balance_is_verified() {
    // The pipeline runs the LIR verifier; a program exercising
    // branches, loops, exceptions, and early returns must pass it.
    let src = r#"def work(items):
    total = 0
    for item in items:
        try:
            total = total + item["n"]
        except KeyError:
            continue
    return total

def risky(flag):
    xs = [1, 2, 3]
    if flag:
        return 0
    return len(xs)

a = work([{"n": 1}, {"n": 2}])
b = risky(True)
c = risky(False)
print(a + b + c)
"#;
    compile_source(src, "m.mt", "m", &config()).expect("verified pipeline");
}

#[test]
fn test_lowering_rejects_dynamic_execution() {
    let err = compile_source("x = eval(\"1+1\")\n", "m.mt", "m", &config()).unwrap_err();
    assert!(err.message.contains("dynamic code execution"));
    assert_eq!(err.span.unwrap().line, 1);
}

#[test]
fn test_lowering_rejects_malformed_unpacking() {
    let err = compile_source("*a, *b = xs\n", "m.mt", "m", &config()).unwrap_err();
    assert!(err.message.contains("starred"));
}

#[test]
fn test_capability_gated_call_flagged_in_manifest() {
    let src = "def fetch(path):\n    h = open(path, \"r\")\n    data = read(h, 64)\n    close(h)\n    return data\n\nd = fetch(\"/etc/hostname\")\n";
    // Without the manifest grant, lowering rejects the call outright.
    let err = compile_source(src, "m.mt", "m", &config()).unwrap_err();
    assert!(err.message.contains("fs.read"));

    let granted = config().with_caps(
        molt_core::CapabilitySet::empty().with(molt_core::Capability::FsRead),
    );
    let program = compile_source(src, "m.mt", "m", &granted).unwrap();
    let art = build_sandbox(&program.lir, &config()).unwrap();
    let export = art
        .manifest
        .exports
        .iter()
        .find(|e| e.name == "fetch")
        .expect("fetch exported");
    assert!(export.capabilities.contains(&"fs.read".to_string()));
    assert!(!export.capabilities.contains(&"fs.write".to_string()));
}

#[test]
fn test_imports_resolve_eagerly() {
    // An import must resolve to a file under the module roots at
    // compile time; there is no runtime module lookup to fall back to.
    let err = compile_source("import util\n", "m.mt", "m", &config()).unwrap_err();
    assert!(err.message.contains("util"));

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("util.mt"), "x = 1\n").unwrap();
    let mut cfg = config();
    cfg.module_roots = vec![dir.path().to_path_buf()];
    compile_source("import util\n", "m.mt", "m", &cfg).expect("import resolves");
}

#[test]
fn test_generators_lower_to_state_machines() {
    let src = "def counter(n):\n    i = 0\n    while i < n:\n        yield i\n        i = i + 1\n\ng = counter(3)\n";
    let program = compile_source(src, "m.mt", "m", &config()).unwrap();
    let gen = program
        .lir
        .functions
        .iter()
        .find(|f| f.name == "m.counter")
        .expect("generator present");
    assert!(gen.is_generator);
    // Entry state plus one resume point per yield.
    assert_eq!(gen.resume_points.len(), 2);
}

#[test]
fn test_class_methods_dispatch_statically() {
    let src = r#"class Counter:
    def __init__(self, start):
        self.count = start
    def bump(self):
        self.count = self.count + 1
        return self.count

c = Counter(10)
a = c.bump()
b = c.bump()
print(b)
"#;
    let program = compile_source(src, "m.mt", "m", &config()).unwrap();
    let init_fn = program
        .lir
        .functions
        .iter()
        .find(|f| f.name == "m.__init__")
        .expect("module init");
    // Method calls became direct static calls, no dynamic dispatch.
    let statics = init_fn
        .blocks
        .iter()
        .flat_map(|b| &b.ops)
        .filter(|op| matches!(op, LOp::CallStatic { .. }))
        .count();
    assert!(statics >= 2);
    let dynamics = init_fn
        .blocks
        .iter()
        .flat_map(|b| &b.ops)
        .any(|op| matches!(op, LOp::CallDynamic { .. }));
    assert!(!dynamics);
}

#[test]
fn test_guarded_dispatch_records_frame_descriptor() {
    let src = r#"def ident(a):
    return a

def pick(flag):
    if flag:
        v = 1
    else:
        v = 2.5
    return ident(v)

x = pick(True)
y = ident(7)
z = ident(8)
"#;
    let program = compile_source(src, "m.mt", "m", &config()).unwrap();
    let pick = program
        .lir
        .functions
        .iter()
        .find(|f| f.name == "m.pick")
        .expect("pick present");
    let guarded = pick
        .blocks
        .iter()
        .flat_map(|b| &b.ops)
        .find_map(|op| match op {
            LOp::CallGuarded { frame, .. } => Some(*frame),
            _ => None,
        });
    let frame = guarded.expect("guarded call site");
    let descriptor = &pick.frames[frame];
    assert_eq!(descriptor.function, "m.pick");
    assert!(descriptor.line > 0);
}

#[test]
fn test_comprehensions_and_unpacking_compile() {
    let src = r#"def squares(xs):
    return [x * x for x in xs if x > 0]

def split_ends(xs):
    first, *mid, last = xs
    return (first, len(mid), last)

a = squares([1, 2, 3])
b = split_ends([10, 20, 30, 40])
print(b)
"#;
    compile_source(src, "m.mt", "m", &config()).expect("pipeline");
}

#[test]
fn test_match_compiles_to_decision_tree() {
    let src = r#"def kind(v):
    match v:
        case 0:
            return "zero"
        case (a, b):
            return "pair"
        case _:
            return "other"

x = kind(0)
y = kind((1, 2))
print(x)
"#;
    compile_source(src, "m.mt", "m", &config()).expect("pipeline");
}
