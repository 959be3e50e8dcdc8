//! Molt core: the bit-level contract between compiler and runtime
//!
//! Everything the compiler must know about the runtime's representation
//! lives here, with no heap and no scheduler:
//! - RawValue: the 64-bit NaN-boxed value word
//! - ObjectHeader: heap object header layout (tag, RC, color, shape)
//! - Handle: opaque indirection word crossing compilation units
//! - Intrinsic table: numeric ids, signatures, effects, capabilities
//! - Capability bitmap and the error-kind taxonomy with exit codes
//! - Deterministic seeded hashing and symbol identity

pub mod abi;
pub mod caps;
pub mod error;
pub mod handle;
pub mod hash;
pub mod intrinsics;
pub mod nanbox;
pub mod object;

pub use abi::{
    select_schema, ExportEntry, GuestConst, GuestFunction, GuestOp, HostStatus, ModuleManifest,
    SandboxModule, SchemaError, DEFAULT_CODEC, SANDBOX_ABI_VERSION,
};
pub use caps::{Capability, CapabilitySet};
pub use error::{ErrorKind, EXIT_CAPABILITY, EXIT_COMPILE, EXIT_DETERMINISM, EXIT_OK, EXIT_RUNTIME};
pub use handle::{Handle, HANDLE_SHARDS};
pub use hash::{hash_bytes, symbol_identity, SeededHasher};
pub use intrinsics::{EffectSet, Intrinsic, IntrinsicDef, ValueKind};
pub use nanbox::{RawValue, Singleton, MAX_SMALL_INT, MIN_SMALL_INT};
pub use object::{GcColor, ObjectHeader, SizeClass, TypeTag};
