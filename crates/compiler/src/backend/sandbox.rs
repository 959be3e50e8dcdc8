//! Sandbox backend
//!
//! Lowers LIR into the portable stack-machine module format of
//! [`molt_core::abi`] plus the JSON sidecar manifest. Pointers inside a
//! module are offsets; values cross the boundary through the default
//! structured codec; external objects cross as handles only.
//!
//! Guest exports are synchronous request/response functions. A function
//! qualifies when it is self-contained: no calls to other functions, no
//! suspension points, no raise-and-catch control flow, and no nominal
//! instances (records travel as plain mappings). Everything else stays
//! native-only; the manifest simply does not list it.

use std::collections::BTreeMap;

use molt_core::abi::{
    ExportEntry, GuestConst, GuestFunction, GuestOp, ModuleManifest, SandboxModule,
    DEFAULT_CODEC, SANDBOX_ABI_VERSION,
};
use molt_core::{CapabilitySet, Intrinsic};

use crate::config::BuildConfig;
use crate::diag::{CompileError, Stage};
use crate::lir::{LBlockId, LOp, LTerm, LirFunc, LirModule};

type SResult<T> = Result<T, CompileError>;

/// The sole input schema this toolchain emits today; selection rule 3
/// (exactly one declared schema) applies at the host.
pub const ARGS_SCHEMA: &str = "args/v1";
pub const RESULT_SCHEMA: &str = "result/v1";

/// Why a function cannot be exported to the sandbox target.
fn export_blocker(f: &LirFunc) -> Option<&'static str> {
    if f.is_generator {
        return Some("generators");
    }
    if f.value_count > u8::MAX as u32 {
        return Some("local-slot budget");
    }
    for block in &f.blocks {
        match block.term {
            LTerm::Yield { .. } | LTerm::Await { .. } => return Some("suspension"),
            LTerm::Raise(_) => return Some("raise"),
            _ => {}
        }
        for op in &block.ops {
            match op {
                LOp::CallStatic { .. }
                | LOp::CallGuarded { .. }
                | LOp::CallDynamic { .. }
                | LOp::MakeCallable { .. } => return Some("nested calls"),
                LOp::AllocInstance { .. }
                | LOp::LoadField { .. }
                | LOp::StoreField { .. } => return Some("nominal instances"),
                LOp::ConstBigInt { .. } => return Some("big integer literals"),
                LOp::ErrIsA { .. } | LOp::SetErrCause { .. } => return Some("handlers"),
                LOp::CallIntrinsic { id, .. } if id.def().effects.suspends() => {
                    return Some("suspension")
                }
                _ => {}
            }
        }
    }
    None
}

/// Capabilities an exported function needs, from its intrinsic calls.
fn required_caps(f: &LirFunc) -> CapabilitySet {
    let mut caps = CapabilitySet::empty();
    for block in &f.blocks {
        for op in &block.ops {
            if let LOp::CallIntrinsic { id, .. } = op {
                for cap in id.def().caps.iter() {
                    caps.grant(cap);
                }
            }
        }
    }
    caps
}

fn is_deterministic(f: &LirFunc) -> bool {
    !f.blocks.iter().flat_map(|b| &b.ops).any(|op| {
        matches!(
            op,
            LOp::CallIntrinsic {
                id: Intrinsic::TimeWall | Intrinsic::RandomSecure | Intrinsic::TimeMonotonic
                    | Intrinsic::TimePerf,
                ..
            }
        )
    })
}

pub struct SandboxArtifact {
    pub module: SandboxModule,
    pub manifest: ModuleManifest,
}

pub fn build_sandbox(lir: &LirModule, config: &BuildConfig) -> SResult<SandboxArtifact> {
    let mut data: Vec<u8> = Vec::new();
    let mut functions = Vec::new();
    let mut exports = Vec::new();

    for (idx, f) in lir.functions.iter().enumerate() {
        // Synthesized bodies (module init, comprehension helpers,
        // specialized variants) never appear in the export surface.
        if idx == lir.entry || f.name.contains('$') {
            continue;
        }
        if export_blocker(f).is_some() {
            continue;
        }
        let guest = compile_guest(f, idx as u32, &mut data)?;
        let short = f.name.rsplit('.').next().unwrap_or(&f.name).to_string();
        exports.push(ExportEntry {
            function_id: idx as u32,
            name: short,
            input_schemas: vec![ARGS_SCHEMA.to_string()],
            output_schema: RESULT_SCHEMA.to_string(),
            default_schema: None,
            codec: DEFAULT_CODEC.to_string(),
            deterministic: is_deterministic(f),
            capabilities: required_caps(f).iter().map(|c| c.name().to_string()).collect(),
        });
        functions.push(guest);
    }

    if exports.is_empty() {
        return Err(CompileError::new(
            Stage::Backend,
            "no function qualifies for the sandbox export surface",
            None,
        ));
    }

    let module = SandboxModule {
        abi_version: SANDBOX_ABI_VERSION,
        module_name: config.module_name.clone(),
        module_version: config.module_version.clone(),
        functions,
        data,
    };
    let manifest = ModuleManifest {
        abi_version: SANDBOX_ABI_VERSION,
        module_name: config.module_name.clone(),
        module_version: config.module_version.clone(),
        exports,
        schemas: vec![ARGS_SCHEMA.to_string(), RESULT_SCHEMA.to_string()],
    };
    Ok(SandboxArtifact { module, manifest })
}

/// Translate one function into guest bytecode.
fn compile_guest(f: &LirFunc, id: u32, data: &mut Vec<u8>) -> SResult<GuestFunction> {
    let mut consts: Vec<GuestConst> = Vec::new();
    // Dedupe constant-pool entries by rendering.
    let mut const_index: BTreeMap<String, u16> = BTreeMap::new();
    let mut intern = |c: GuestConst, consts: &mut Vec<GuestConst>| -> u16 {
        let key = format!("{:?}", c);
        if let Some(i) = const_index.get(&key) {
            return *i;
        }
        consts.push(c);
        let i = (consts.len() - 1) as u16;
        const_index.insert(key, i);
        i
    };

    let mut code: Vec<GuestOp> = Vec::new();
    let mut block_offsets: Vec<u16> = vec![0; f.blocks.len()];
    // (code index to patch, target block)
    let mut fixups: Vec<(usize, LBlockId)> = Vec::new();

    for (bi, block) in f.blocks.iter().enumerate() {
        block_offsets[bi] = code.len() as u16;
        for op in &block.ops {
            match op {
                LOp::ConstInt { dst, value } => {
                    let c = intern(GuestConst::Int(*value), &mut consts);
                    code.push(GuestOp::Const(c));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                LOp::ConstFloat { dst, value } => {
                    let c = intern(GuestConst::Float(*value), &mut consts);
                    code.push(GuestOp::Const(c));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                LOp::ConstBool { dst, value } => {
                    let c = intern(GuestConst::Bool(*value), &mut consts);
                    code.push(GuestOp::Const(c));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                LOp::ConstNull { dst } => {
                    let c = intern(GuestConst::Null, &mut consts);
                    code.push(GuestOp::Const(c));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                LOp::ConstStr { dst, value } => {
                    let offset = data.len() as u32;
                    data.extend_from_slice(value.as_bytes());
                    let c = intern(
                        GuestConst::Str {
                            offset,
                            len: value.len() as u32,
                        },
                        &mut consts,
                    );
                    code.push(GuestOp::Const(c));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                // Reference counts are host-managed across the
                // boundary; guest code carries no RC traffic.
                LOp::Retain(_) | LOp::Release(_) => {}
                LOp::AllocList { dst, elems } => {
                    code.push(GuestOp::Intrinsic(Intrinsic::ListNew as u16));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                    for e in elems {
                        code.push(GuestOp::LoadLocal(*dst as u8));
                        code.push(GuestOp::LoadLocal(*e as u8));
                        code.push(GuestOp::Intrinsic(Intrinsic::ListPush as u16));
                        code.push(GuestOp::Pop);
                    }
                }
                LOp::AllocSet { dst, elems } => {
                    code.push(GuestOp::Intrinsic(Intrinsic::SetNew as u16));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                    for e in elems {
                        code.push(GuestOp::LoadLocal(*dst as u8));
                        code.push(GuestOp::LoadLocal(*e as u8));
                        code.push(GuestOp::Intrinsic(Intrinsic::SetAdd as u16));
                        code.push(GuestOp::Pop);
                    }
                }
                LOp::AllocTuple { dst, elems } => {
                    // Tuples build through a scratch list.
                    code.push(GuestOp::Intrinsic(Intrinsic::ListNew as u16));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                    for e in elems {
                        code.push(GuestOp::LoadLocal(*dst as u8));
                        code.push(GuestOp::LoadLocal(*e as u8));
                        code.push(GuestOp::Intrinsic(Intrinsic::ListPush as u16));
                        code.push(GuestOp::Pop);
                    }
                    code.push(GuestOp::LoadLocal(*dst as u8));
                    code.push(GuestOp::Intrinsic(Intrinsic::TupleNew as u16));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                LOp::AllocMap {
                    dst, keys, values, ..
                } => {
                    // Records travel as plain mappings in the sandbox.
                    code.push(GuestOp::Intrinsic(Intrinsic::MapNew as u16));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                    for (k, v) in keys.iter().zip(values.iter()) {
                        code.push(GuestOp::LoadLocal(*dst as u8));
                        code.push(GuestOp::LoadLocal(*k as u8));
                        code.push(GuestOp::LoadLocal(*v as u8));
                        code.push(GuestOp::Intrinsic(Intrinsic::MapSet as u16));
                        code.push(GuestOp::Pop);
                    }
                }
                LOp::CallIntrinsic { dst, id, args } => {
                    for a in args {
                        code.push(GuestOp::LoadLocal(*a as u8));
                    }
                    code.push(GuestOp::Intrinsic(*id as u16));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                LOp::ResolveHandle { dst, handle } => {
                    // Handle resolution is a host import in the guest
                    // memory space; model it as the identity move here
                    // and let the host-side import do the copying.
                    code.push(GuestOp::LoadLocal(*handle as u8));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                LOp::Move { dst, src } => {
                    code.push(GuestOp::LoadLocal(*src as u8));
                    code.push(GuestOp::StoreLocal(*dst as u8));
                }
                other => {
                    return Err(CompileError::new(
                        Stage::Backend,
                        format!(
                            "{}: operation not representable in a sandbox module: {:?}",
                            f.name, other
                        ),
                        None,
                    ))
                }
            }
        }
        match &block.term {
            LTerm::Jump { to, args } => {
                let params = f.blocks[*to as usize].params.clone();
                for (p, a) in params.iter().zip(args.iter()) {
                    code.push(GuestOp::LoadLocal(*a as u8));
                    code.push(GuestOp::StoreLocal(*p as u8));
                }
                fixups.push((code.len(), *to));
                code.push(GuestOp::Jump(0));
            }
            LTerm::Branch {
                cond,
                then_to,
                then_args,
                else_to,
                else_args,
            } => {
                code.push(GuestOp::LoadLocal(*cond as u8));
                let else_patch = code.len();
                code.push(GuestOp::JumpIfFalse(0));
                let params = f.blocks[*then_to as usize].params.clone();
                for (p, a) in params.iter().zip(then_args.iter()) {
                    code.push(GuestOp::LoadLocal(*a as u8));
                    code.push(GuestOp::StoreLocal(*p as u8));
                }
                fixups.push((code.len(), *then_to));
                code.push(GuestOp::Jump(0));
                // Else path starts here; patch the conditional.
                let here = code.len() as u16;
                code[else_patch] = GuestOp::JumpIfFalse(here);
                let params = f.blocks[*else_to as usize].params.clone();
                for (p, a) in params.iter().zip(else_args.iter()) {
                    code.push(GuestOp::LoadLocal(*a as u8));
                    code.push(GuestOp::StoreLocal(*p as u8));
                }
                fixups.push((code.len(), *else_to));
                code.push(GuestOp::Jump(0));
            }
            LTerm::Return(v) => {
                code.push(GuestOp::LoadLocal(*v as u8));
                code.push(GuestOp::Return);
            }
            other => {
                return Err(CompileError::new(
                    Stage::Backend,
                    format!("{}: terminator not representable: {:?}", f.name, other),
                    None,
                ))
            }
        }
    }

    for (at, target) in fixups {
        code[at] = GuestOp::Jump(block_offsets[target as usize]);
    }

    Ok(GuestFunction {
        id,
        name: f.name.clone(),
        params: f.params.len() as u8,
        locals: (f.value_count as u8).saturating_sub(f.params.len() as u8),
        consts,
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::testutil::lower_source;

    fn build(src: &str) -> SandboxArtifact {
        let lir = lower_source(src);
        build_sandbox(&lir, &BuildConfig::default().with_module("demo", "1.0.0"))
            .expect("sandbox build")
    }

    #[test]
    fn test_simple_function_exports() {
        let art = build("def double(a):\n    return a + a\n\nx = double(2)\n");
        // The general variant exports; specialized clones do not.
        let export = art
            .manifest
            .exports
            .iter()
            .find(|e| e.name == "double")
            .expect("double exported");
        assert_eq!(export.input_schemas, vec![ARGS_SCHEMA.to_string()]);
        assert_eq!(export.codec, DEFAULT_CODEC);
        assert!(export.deterministic);
        assert!(export.capabilities.is_empty());
        assert!(art
            .module
            .functions
            .iter()
            .any(|f| f.id == export.function_id));
    }

    #[test]
    fn test_module_bytes_deterministic() {
        let a = build("def f(a):\n    return a + 1\n\nx = f(1)\n");
        let b = build("def f(a):\n    return a + 1\n\nx = f(1)\n");
        assert_eq!(a.module.encode().unwrap(), b.module.encode().unwrap());
        assert_eq!(
            a.manifest.to_json().unwrap(),
            b.manifest.to_json().unwrap()
        );
    }

    #[test]
    fn test_capability_recorded_in_manifest() {
        let art = build(
            "def probe(path):\n    h = open(path, \"r\")\n    d = read(h, 16)\n    close(h)\n    return d\n\nx = probe(\"/tmp/f\")\n",
        );
        let export = art
            .manifest
            .exports
            .iter()
            .find(|e| e.name == "probe")
            .expect("probe exported");
        assert!(export.capabilities.contains(&"fs.read".to_string()));
    }

    #[test]
    fn test_suspending_functions_excluded() {
        let lir = lower_source(
            "def waiter():\n    sleep(0.1)\n    return 1\n\ndef pure(a):\n    return a\n\nx = pure(1)\nt = spawn(waiter)\n",
        );
        let art = build_sandbox(&lir, &BuildConfig::default()).expect("build");
        assert!(art.manifest.exports.iter().any(|e| e.name == "pure"));
        assert!(!art.manifest.exports.iter().any(|e| e.name == "waiter"));
    }

    #[test]
    fn test_nondeterministic_export_flagged() {
        let art = build(
            "def stamp(x):\n    return wall_clock()\n\ndef pure(a):\n    return a\n\ny = pure(1)\n",
        );
        let stamp = art
            .manifest
            .exports
            .iter()
            .find(|e| e.name == "stamp")
            .expect("stamp exported");
        assert!(!stamp.deterministic);
        assert!(stamp.capabilities.contains(&"time.wall".to_string()));
    }
}
