//! Sandbox module host
//!
//! Loads and drives portable sandbox modules in the shared ABI
//! ([`molt_core::abi`]): a compact stack-machine bytecode plus a JSON
//! sidecar manifest describing exports. Guest values cross the boundary
//! through the default structured codec; external objects cross as
//! handles only. The host never keeps references into guest memory past
//! a call: payloads are copied.
//!
//! ## Host imports
//!
//! Mandatory: `alloc`, `free` (linear-memory management) and
//! `handle_resolve`. Optional imports are the capability-gated
//! intrinsics, reached through the shared intrinsic table; their
//! capability requirements are enforced per call with the out-pointer +
//! status-code convention.

use molt_core::abi::{
    select_schema, GuestConst, GuestFunction, GuestOp, HostStatus, ModuleManifest, SandboxModule,
    SANDBOX_ABI_VERSION,
};
use molt_core::{ErrorKind, Intrinsic};

use crate::codec::{self, TypedValue};
use crate::errors::RtError;
use crate::intrinsics;
use crate::runtime::Runtime;
use crate::value::Value;

/// Step budget per invocation; a guest that exceeds it is defective.
const STEP_BUDGET: u64 = 50_000_000;

/// Map a runtime error onto the ABI status set.
pub fn status_of(e: &RtError) -> HostStatus {
    match e.kind {
        ErrorKind::Cancelled => HostStatus::Cancelled,
        ErrorKind::Timeout => HostStatus::Timeout,
        ErrorKind::CapabilityDenied => HostStatus::CapabilityDenied,
        ErrorKind::Value | ErrorKind::Type => HostStatus::InvalidInput,
        _ => HostStatus::Internal,
    }
}

/// Loaded module plus its linear memory.
pub struct SandboxHost<'rt> {
    rt: &'rt Runtime,
    module: SandboxModule,
    manifest: ModuleManifest,
    /// Guest linear memory; pointers handed to the guest are offsets
    /// into this buffer.
    memory: Vec<u8>,
    /// Bump watermark for `alloc`.
    brk: usize,
}

impl<'rt> SandboxHost<'rt> {
    pub fn load(
        rt: &'rt Runtime,
        module_bytes: &[u8],
        manifest_json: &str,
    ) -> Result<SandboxHost<'rt>, RtError> {
        let module = SandboxModule::decode(module_bytes).map_err(crate::errors::value_error)?;
        if module.abi_version != SANDBOX_ABI_VERSION {
            return Err(crate::errors::value_error(format!(
                "unsupported sandbox ABI version {}",
                module.abi_version
            )));
        }
        let manifest = ModuleManifest::from_json(manifest_json)
            .map_err(crate::errors::value_error)?;
        Ok(SandboxHost {
            rt,
            module,
            manifest,
            memory: vec![0; 64 * 1024],
            brk: 8, // offset 0 is the guest null pointer
        })
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    // --- mandatory host imports ---------------------------------------------

    /// `alloc(size) -> ptr`: bump allocation in linear memory.
    pub fn host_alloc(&mut self, size: usize) -> u32 {
        let aligned = (self.brk + 7) & !7;
        if aligned + size > self.memory.len() {
            self.memory.resize((aligned + size).next_power_of_two(), 0);
        }
        self.brk = aligned + size;
        aligned as u32
    }

    /// `free(ptr, len)`: the bump allocator only reclaims the tail.
    pub fn host_free(&mut self, ptr: u32, len: usize) {
        if ptr as usize + len == self.brk {
            self.brk = ptr as usize;
        }
    }

    /// `handle_resolve(handle) -> ptr`: copies the handle's value,
    /// encoded with the default codec, into guest memory. Returns the
    /// guest pointer and length, or `InvalidInput` for a stale handle.
    pub fn host_handle_resolve(&mut self, handle: u64) -> Result<(u32, u32), HostStatus> {
        let h = molt_core::Handle::from_word(handle);
        let addr = self
            .rt
            .handles
            .resolve(h)
            .ok_or(HostStatus::InvalidInput)?;
        let value = Value::from_heap(addr as *mut crate::value::HeapObj);
        let typed =
            codec::to_typed(&self.rt.shapes, value).map_err(|_| HostStatus::EncodeError)?;
        let bytes = codec::encode(&typed).map_err(|_| HostStatus::EncodeError)?;
        let ptr = self.host_alloc(bytes.len());
        self.memory[ptr as usize..ptr as usize + bytes.len()].copy_from_slice(&bytes);
        Ok((ptr, bytes.len() as u32))
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    // --- invocation ---------------------------------------------------------

    /// Invoke an exported function. The payload is a codec-encoded
    /// argument list; the result is the codec-encoded return value.
    /// Never panics across the boundary: every failure is a status.
    pub fn invoke(
        &mut self,
        function_id: u32,
        schema: Option<&str>,
        payload: &[u8],
    ) -> (HostStatus, Vec<u8>) {
        let Some(export) = self
            .manifest
            .exports
            .iter()
            .find(|e| e.function_id == function_id)
        else {
            return (HostStatus::InvalidInput, Vec::new());
        };
        if select_schema(export, schema).is_err() {
            return (HostStatus::InvalidInput, Vec::new());
        }

        // Capability pre-check from the manifest; intrinsic dispatch
        // re-checks per call.
        let caps = match molt_core::CapabilitySet::from_names(
            export.capabilities.iter().map(|s| s.as_str()),
        ) {
            Ok(caps) => caps,
            Err(_) => return (HostStatus::Internal, Vec::new()),
        };
        if !self.rt.config.trusted && self.rt.config.caps.first_missing(caps).is_some() {
            return (HostStatus::CapabilityDenied, Vec::new());
        }

        let args = match codec::decode(payload) {
            Ok(TypedValue::List(items)) => items,
            Ok(other) => vec![other],
            Err(_) => return (HostStatus::DecodeError, Vec::new()),
        };

        let Some(func) = self.module.functions.iter().find(|f| f.id == function_id) else {
            return (HostStatus::InvalidInput, Vec::new());
        };
        if args.len() != func.params as usize {
            return (HostStatus::InvalidInput, Vec::new());
        }

        match run_guest(self.rt, &self.module, func, &args) {
            Ok(value) => {
                let typed = match codec::to_typed(&self.rt.shapes, value) {
                    Ok(t) => t,
                    Err(_) => return (HostStatus::EncodeError, Vec::new()),
                };
                match codec::encode(&typed) {
                    Ok(bytes) => (HostStatus::Ok, bytes),
                    Err(_) => (HostStatus::EncodeError, Vec::new()),
                }
            }
            Err(e) => (status_of(&e), Vec::new()),
        }
    }
}

/// The guest interpreter: a small strict stack machine. Suspending
/// intrinsics are not reachable from guest code; the export surface is
/// synchronous request/response. Values built during an invocation are
/// owned by the host runtime and reclaimed with it; hosts are
/// per-request in the deployment model this serves.
fn run_guest(
    rt: &Runtime,
    module: &SandboxModule,
    func: &GuestFunction,
    args: &[TypedValue],
) -> Result<Value, RtError> {
    let heap = &rt.heap;
    let mut locals = vec![Value::null(); func.params as usize + func.locals as usize];
    for (i, arg) in args.iter().enumerate() {
        locals[i] = codec::from_typed(heap, &rt.shapes, rt.config.hash_seed, arg);
    }
    let mut stack: Vec<Value> = Vec::new();
    let mut pc = 0usize;
    let mut steps = 0u64;

    while pc < func.code.len() {
        steps += 1;
        if steps > STEP_BUDGET {
            return Err(crate::errors::internal("guest exceeded step budget"));
        }
        match func.code[pc] {
            GuestOp::Const(idx) => {
                let c = func
                    .consts
                    .get(idx as usize)
                    .ok_or_else(|| crate::errors::internal("bad constant index"))?;
                let v = match c {
                    GuestConst::Null => Value::null(),
                    GuestConst::Bool(b) => Value::bool(*b),
                    GuestConst::Int(n) => heap.int(*n),
                    GuestConst::Float(f) => Value::float(*f),
                    GuestConst::Str { offset, len } => {
                        let lo = *offset as usize;
                        let hi = lo + *len as usize;
                        let bytes = module
                            .data
                            .get(lo..hi)
                            .ok_or_else(|| crate::errors::internal("bad data offset"))?;
                        let s = std::str::from_utf8(bytes)
                            .map_err(|_| crate::errors::internal("non-UTF-8 constant"))?;
                        heap.str(s)
                    }
                };
                stack.push(v);
            }
            GuestOp::LoadLocal(i) => {
                let v = *locals
                    .get(i as usize)
                    .ok_or_else(|| crate::errors::internal("bad local index"))?;
                stack.push(v);
            }
            GuestOp::StoreLocal(i) => {
                let v = stack
                    .pop()
                    .ok_or_else(|| crate::errors::internal("store from empty stack"))?;
                *locals
                    .get_mut(i as usize)
                    .ok_or_else(|| crate::errors::internal("bad local index"))? = v;
            }
            GuestOp::Intrinsic(wire) => {
                let id = Intrinsic::from_u16(wire)
                    .ok_or_else(|| crate::errors::internal("unknown intrinsic id"))?;
                let arity = id.def().params.len();
                if stack.len() < arity {
                    return Err(crate::errors::internal("intrinsic underflow"));
                }
                let at = stack.len() - arity;
                let call_args: Vec<Value> = stack.split_off(at);
                let result = intrinsics::call(rt, id, &call_args)?;
                stack.push(result);
            }
            GuestOp::Jump(target) => {
                pc = target as usize;
                continue;
            }
            GuestOp::JumpIfFalse(target) => {
                let v = stack
                    .pop()
                    .ok_or_else(|| crate::errors::internal("branch on empty stack"))?;
                if !v.truthy() {
                    pc = target as usize;
                    continue;
                }
            }
            GuestOp::Pop => {
                stack.pop();
            }
            GuestOp::Return => {
                return Ok(stack.pop().unwrap_or_else(Value::null));
            }
        }
        pc += 1;
    }
    Ok(Value::null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use molt_core::abi::{ExportEntry, DEFAULT_CODEC};
    use molt_core::CapabilitySet;

    fn simple_manifest(caps: Vec<String>) -> ModuleManifest {
        ModuleManifest {
            abi_version: SANDBOX_ABI_VERSION,
            module_name: "demo".into(),
            module_version: "1.0.0".into(),
            exports: vec![ExportEntry {
                function_id: 1,
                name: "run".into(),
                input_schemas: vec!["args/1".into()],
                output_schema: "result/1".into(),
                default_schema: None,
                codec: DEFAULT_CODEC.into(),
                deterministic: true,
                capabilities: caps,
            }],
            schemas: vec!["args/1".into(), "result/1".into()],
        }
    }

    fn add_module() -> SandboxModule {
        // fn run(a, b) { return a + b }
        SandboxModule {
            abi_version: SANDBOX_ABI_VERSION,
            module_name: "demo".into(),
            module_version: "1.0.0".into(),
            functions: vec![GuestFunction {
                id: 1,
                name: "run".into(),
                params: 2,
                locals: 0,
                consts: vec![],
                code: vec![
                    GuestOp::LoadLocal(0),
                    GuestOp::LoadLocal(1),
                    GuestOp::Intrinsic(Intrinsic::IntAdd as u16),
                    GuestOp::Return,
                ],
            }],
            data: vec![],
        }
    }

    fn invoke_args(host: &mut SandboxHost, args: Vec<TypedValue>) -> (HostStatus, Vec<u8>) {
        let payload = codec::encode(&TypedValue::List(args)).unwrap();
        host.invoke(1, Some("args/1"), &payload)
    }

    #[test]
    fn test_guest_add_roundtrip() {
        let rt = Runtime::new(RuntimeConfig::default());
        let module_bytes = add_module().encode().unwrap();
        let manifest = simple_manifest(vec![]).to_json().unwrap();
        let mut host = SandboxHost::load(&rt, &module_bytes, &manifest).unwrap();

        let (status, out) =
            invoke_args(&mut host, vec![TypedValue::Int(30), TypedValue::Int(12)]);
        assert_eq!(status, HostStatus::Ok);
        assert_eq!(codec::decode(&out).unwrap(), TypedValue::Int(42));
    }

    #[test]
    fn test_guest_loop_and_branch() {
        // fn run(n) { total = 0; while n: total += n; n -= 1; return total }
        let rt = Runtime::new(RuntimeConfig::default());
        let module = SandboxModule {
            abi_version: SANDBOX_ABI_VERSION,
            module_name: "demo".into(),
            module_version: "1.0.0".into(),
            functions: vec![GuestFunction {
                id: 1,
                name: "run".into(),
                params: 1,
                locals: 1,
                consts: vec![GuestConst::Int(0), GuestConst::Int(1)],
                code: vec![
                    GuestOp::Const(0),                            // 0: total = 0
                    GuestOp::StoreLocal(1),                       // 1
                    GuestOp::LoadLocal(0),                        // 2: while n
                    GuestOp::JumpIfFalse(13),                     // 3
                    GuestOp::LoadLocal(1),                        // 4: total += n
                    GuestOp::LoadLocal(0),                        // 5
                    GuestOp::Intrinsic(Intrinsic::IntAdd as u16), // 6
                    GuestOp::StoreLocal(1),                       // 7
                    GuestOp::LoadLocal(0),                        // 8: n -= 1
                    GuestOp::Const(1),                            // 9
                    GuestOp::Intrinsic(Intrinsic::IntSub as u16), // 10
                    GuestOp::StoreLocal(0),                       // 11
                    GuestOp::Jump(2),                             // 12
                    GuestOp::LoadLocal(1),                        // 13: return total
                    GuestOp::Return,                              // 14
                ],
            }],
            data: vec![],
        };
        let module_bytes = module.encode().unwrap();
        let manifest = simple_manifest(vec![]).to_json().unwrap();
        let mut host = SandboxHost::load(&rt, &module_bytes, &manifest).unwrap();
        let (status, out) = invoke_args(&mut host, vec![TypedValue::Int(10)]);
        assert_eq!(status, HostStatus::Ok);
        assert_eq!(codec::decode(&out).unwrap(), TypedValue::Int(55));
    }

    #[test]
    fn test_capability_denied_status() {
        // Guest calls io_open without fs.read granted: status 6 and no
        // side effects.
        let rt = Runtime::new(RuntimeConfig::default());
        let data = b"/tmp/molt-sandbox-test-file".to_vec();
        let path_len = data.len() as u32;
        let module = SandboxModule {
            abi_version: SANDBOX_ABI_VERSION,
            module_name: "demo".into(),
            module_version: "1.0.0".into(),
            functions: vec![GuestFunction {
                id: 1,
                name: "run".into(),
                params: 0,
                locals: 0,
                consts: vec![
                    GuestConst::Str {
                        offset: 0,
                        len: path_len,
                    },
                    GuestConst::Str { offset: 0, len: 1 },
                ],
                code: vec![
                    GuestOp::Const(0),
                    GuestOp::Const(1),
                    GuestOp::Intrinsic(Intrinsic::IoOpen as u16),
                    GuestOp::Return,
                ],
            }],
            data,
        };
        let manifest = simple_manifest(vec![]).to_json().unwrap();
        let module_bytes = module.encode().unwrap();
        let mut host = SandboxHost::load(&rt, &module_bytes, &manifest).unwrap();
        let (status, out) = invoke_args(&mut host, vec![]);
        assert_eq!(status, HostStatus::CapabilityDenied);
        assert!(out.is_empty());
    }

    #[test]
    fn test_manifest_capability_precheck() {
        let rt = Runtime::new(RuntimeConfig::default());
        let module_bytes = add_module().encode().unwrap();
        let manifest = simple_manifest(vec!["fs.read".into()]).to_json().unwrap();
        let mut host = SandboxHost::load(&rt, &module_bytes, &manifest).unwrap();
        let (status, _) = invoke_args(&mut host, vec![TypedValue::Int(1), TypedValue::Int(2)]);
        assert_eq!(status, HostStatus::CapabilityDenied);

        // Granting the capability unblocks the same module.
        let rt2 = Runtime::new(RuntimeConfig::default().with_caps(
            CapabilitySet::empty().with(molt_core::Capability::FsRead),
        ));
        let manifest = simple_manifest(vec!["fs.read".into()]).to_json().unwrap();
        let mut host2 = SandboxHost::load(&rt2, &module_bytes, &manifest).unwrap();
        let payload = codec::encode(&TypedValue::List(vec![
            TypedValue::Int(1),
            TypedValue::Int(2),
        ]))
        .unwrap();
        let (status, _) = host2.invoke(1, Some("args/1"), &payload);
        assert_eq!(status, HostStatus::Ok);
    }

    #[test]
    fn test_bad_payload_is_decode_error() {
        let rt = Runtime::new(RuntimeConfig::default());
        let module_bytes = add_module().encode().unwrap();
        let manifest = simple_manifest(vec![]).to_json().unwrap();
        let mut host = SandboxHost::load(&rt, &module_bytes, &manifest).unwrap();
        let (status, _) = host.invoke(1, Some("args/1"), b"\xFF\xFF\xFF");
        assert_eq!(status, HostStatus::DecodeError);
    }

    #[test]
    fn test_unknown_function_and_schema() {
        let rt = Runtime::new(RuntimeConfig::default());
        let module_bytes = add_module().encode().unwrap();
        let manifest = simple_manifest(vec![]).to_json().unwrap();
        let mut host = SandboxHost::load(&rt, &module_bytes, &manifest).unwrap();
        let payload = codec::encode(&TypedValue::List(vec![])).unwrap();
        assert_eq!(
            host.invoke(99, None, &payload).0,
            HostStatus::InvalidInput
        );
        assert_eq!(
            host.invoke(1, Some("nope/9"), &payload).0,
            HostStatus::InvalidInput
        );
    }

    #[test]
    fn test_linear_memory_alloc() {
        let rt = Runtime::new(RuntimeConfig::default());
        let module_bytes = add_module().encode().unwrap();
        let manifest = simple_manifest(vec![]).to_json().unwrap();
        let mut host = SandboxHost::load(&rt, &module_bytes, &manifest).unwrap();
        let a = host.host_alloc(100);
        let b = host.host_alloc(50);
        assert!(b >= a + 100);
        // Freeing the tail allows reuse.
        host.host_free(b, 50);
        let c = host.host_alloc(10);
        assert_eq!(c, b);
    }

    #[test]
    fn test_handle_resolve_copies_into_guest_memory() {
        let rt = Runtime::new(RuntimeConfig::default());
        let value = rt.heap.str("shared");
        let addr = value.obj_ptr().unwrap() as usize;
        let handle = rt.handles.register(addr);

        let module_bytes = add_module().encode().unwrap();
        let manifest = simple_manifest(vec![]).to_json().unwrap();
        let mut host = SandboxHost::load(&rt, &module_bytes, &manifest).unwrap();

        let (ptr, len) = host.host_handle_resolve(handle.to_word()).unwrap();
        let bytes = &host.memory()[ptr as usize..(ptr + len) as usize];
        assert_eq!(
            codec::decode(bytes).unwrap(),
            TypedValue::Str("shared".into())
        );

        rt.handles.release(handle);
        assert_eq!(
            host.host_handle_resolve(handle.to_word()),
            Err(HostStatus::InvalidInput)
        );
    }
}
