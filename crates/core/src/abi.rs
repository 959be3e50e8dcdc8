//! Sandbox module ABI
//!
//! The wire contract between the compiler's sandbox backend and the
//! runtime's sandbox host: the binary module format, the sidecar
//! manifest, host status codes, and deterministic schema selection.
//! Both sides build against these definitions, so a mismatch is a
//! compile error rather than a decode surprise.

use serde::{Deserialize, Serialize};

/// ABI version stamped into every module; the host rejects others.
pub const SANDBOX_ABI_VERSION: u16 = 1;

/// Step codes of the native calling convention.
///
/// Compiled functions are resumable step functions:
/// `fn(frame: *mut u64, out: *mut [u64; 4]) -> i32`, with `frame[0]`
/// the resume state, `frame[1]` the resume payload, and values in the
/// slots above. The return code tells the scheduler what happened; the
/// `out` words carry the step's payloads (result word, channel word,
/// duration bits).
pub mod step {
    /// Function returned; `out[1]` is the result word.
    pub const RETURN: i32 = 0;
    /// Function raised; the error is in the thread error slot.
    pub const RAISE: i32 = 1;
    /// Generator yield; `out[1]` is the yielded word.
    pub const YIELD: i32 = 2;
    /// Sleep; `out[1]` is the f64 duration in seconds (bit pattern).
    pub const SLEEP: i32 = 3;
    /// Channel send; `out[1]` channel word, `out[2]` value word.
    pub const CHAN_SEND: i32 = 4;
    /// Channel receive; `out[1]` channel word.
    pub const CHAN_RECV: i32 = 5;
    /// Join; `out[1]` task word.
    pub const JOIN: i32 = 6;
    /// Cooperative yield to the scheduler.
    pub const YIELD_NOW: i32 = 7;
}

/// Codec identifier written into manifests by this toolchain.
pub const DEFAULT_CODEC: &str = "molt-bincode/1";

/// Host call status codes (the out-pointer + status convention).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Ok = 0,
    InvalidInput = 1,
    DecodeError = 2,
    EncodeError = 3,
    Cancelled = 4,
    Timeout = 5,
    CapabilityDenied = 6,
    Internal = 7,
}

/// Constant-pool entry. Strings index the module data section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GuestConst {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str { offset: u32, len: u32 },
}

/// Stack-machine instruction set for portable modules. Pointers inside
/// a module are offsets; external objects cross as handles only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum GuestOp {
    /// Push constant-pool entry.
    Const(u16),
    LoadLocal(u8),
    StoreLocal(u8),
    /// Call an intrinsic by wire id; arity comes from the shared table.
    Intrinsic(u16),
    /// Unconditional jump to an absolute instruction index.
    Jump(u16),
    /// Pop; jump when falsy.
    JumpIfFalse(u16),
    Pop,
    Return,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestFunction {
    pub id: u32,
    pub name: String,
    pub params: u8,
    pub locals: u8,
    pub consts: Vec<GuestConst>,
    pub code: Vec<GuestOp>,
}

/// One binary sandbox module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxModule {
    pub abi_version: u16,
    pub module_name: String,
    pub module_version: String,
    pub functions: Vec<GuestFunction>,
    /// String/bytes pool referenced by `GuestConst::Str`.
    pub data: Vec<u8>,
}

impl SandboxModule {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| format!("module encode failed: {}", e))
    }

    pub fn decode(bytes: &[u8]) -> Result<SandboxModule, String> {
        bincode::deserialize(bytes).map_err(|e| format!("module decode failed: {}", e))
    }
}

/// Export table entry in the sidecar manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEntry {
    pub function_id: u32,
    pub name: String,
    pub input_schemas: Vec<String>,
    pub output_schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schema: Option<String>,
    pub codec: String,
    pub deterministic: bool,
    pub capabilities: Vec<String>,
}

/// The sidecar manifest shipped next to a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub abi_version: u16,
    pub module_name: String,
    pub module_version: String,
    pub exports: Vec<ExportEntry>,
    pub schemas: Vec<String>,
}

impl ModuleManifest {
    /// Deterministic JSON form (stable field order via serde).
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|e| format!("manifest encode failed: {}", e))
    }

    pub fn from_json(json: &str) -> Result<ModuleManifest, String> {
        serde_json::from_str(json).map_err(|e| format!("manifest parse failed: {}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaError {
    UnknownSchema,
    SchemaRequired,
}

/// Deterministic schema selection: the caller's schema id, else the
/// export's `default_schema`, else the sole declared input schema, else
/// `SchemaRequired`. There is no runtime "latest schema"; latest-binding
/// is resolved at build time and baked into the manifest.
pub fn select_schema<'a>(
    export: &'a ExportEntry,
    requested: Option<&str>,
) -> Result<&'a str, SchemaError> {
    if let Some(req) = requested {
        return export
            .input_schemas
            .iter()
            .find(|s| s.as_str() == req)
            .map(|s| s.as_str())
            .ok_or(SchemaError::UnknownSchema);
    }
    if let Some(default) = &export.default_schema {
        return Ok(default.as_str());
    }
    if export.input_schemas.len() == 1 {
        return Ok(export.input_schemas[0].as_str());
    }
    Err(SchemaError::SchemaRequired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(schemas: &[&str], default: Option<&str>) -> ExportEntry {
        ExportEntry {
            function_id: 1,
            name: "f".into(),
            input_schemas: schemas.iter().map(|s| s.to_string()).collect(),
            output_schema: "r/1".into(),
            default_schema: default.map(|s| s.to_string()),
            codec: DEFAULT_CODEC.into(),
            deterministic: true,
            capabilities: vec![],
        }
    }

    #[test]
    fn test_schema_selection_order() {
        let e = export(&["a/1", "a/2"], None);
        assert_eq!(select_schema(&e, Some("a/2")), Ok("a/2"));
        assert_eq!(select_schema(&e, Some("a/9")), Err(SchemaError::UnknownSchema));
        assert_eq!(select_schema(&e, None), Err(SchemaError::SchemaRequired));

        let e = export(&["a/1", "a/2"], Some("a/1"));
        assert_eq!(select_schema(&e, None), Ok("a/1"));

        let e = export(&["only/1"], None);
        assert_eq!(select_schema(&e, None), Ok("only/1"));
    }

    #[test]
    fn test_module_roundtrip() {
        let module = SandboxModule {
            abi_version: SANDBOX_ABI_VERSION,
            module_name: "m".into(),
            module_version: "0.1.0".into(),
            functions: vec![GuestFunction {
                id: 7,
                name: "f".into(),
                params: 1,
                locals: 0,
                consts: vec![GuestConst::Int(3)],
                code: vec![GuestOp::Const(0), GuestOp::Return],
            }],
            data: b"pool".to_vec(),
        };
        let bytes = module.encode().unwrap();
        let back = SandboxModule::decode(&bytes).unwrap();
        assert_eq!(back.functions[0].id, 7);
        assert_eq!(back.data, b"pool");
        // Deterministic: same module, same bytes.
        assert_eq!(bytes, back.encode().unwrap());
    }

    #[test]
    fn test_manifest_json_roundtrip() {
        let manifest = ModuleManifest {
            abi_version: SANDBOX_ABI_VERSION,
            module_name: "m".into(),
            module_version: "0.1.0".into(),
            exports: vec![export(&["a/1"], None)],
            schemas: vec!["a/1".into(), "r/1".into()],
        };
        let json = manifest.to_json().unwrap();
        let back = ModuleManifest::from_json(&json).unwrap();
        assert_eq!(back.exports[0].input_schemas, vec!["a/1".to_string()]);
    }
}
