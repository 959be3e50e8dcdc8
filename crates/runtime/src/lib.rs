//! Molt runtime substrate
//!
//! Linked into every artifact the compiler produces: the NaN-boxed
//! object model, the reference-counted heap with deferred cycle
//! collection, the sharded handle registry, the cooperative scheduler
//! with hierarchical cancellation, bounded channels, the intrinsic
//! library, capability enforcement, the default structured codec, and
//! the sandbox-module host.
//!
//! Key design principles:
//! - Values are single 64-bit words; ownership is explicit RC, never
//!   Rust `Drop`.
//! - All user-visible state mutation happens under the runtime lock.
//! - Collection triggers are byte counters; nothing in reclamation
//!   reads a clock.
//! - Identity that crosses a compilation unit or the sandbox boundary
//!   is a handle, never a pointer.

pub mod arena;
pub mod cancel;
pub mod channel;
pub mod codec;
pub mod cycle;
pub mod diagnostics;
pub mod errors;
pub mod ffi;
pub mod handles;
pub mod heap;
pub mod intrinsics;
pub mod parallel;
pub mod poller;
pub mod rtlock;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod task;
pub mod value;

pub use cancel::CancelToken;
pub use channel::{ChannelStats, RecvOutcome, SendOutcome};
pub use codec::{decode, encode, CodecError, TypedKey, TypedValue};
pub use errors::{FrameEntry, RtError};
pub use handles::HandleRegistry;
pub use heap::{Heap, HeapStats, ShapeTable};
pub use runtime::{Runtime, RuntimeConfig};
pub use molt_core::abi::{
    select_schema, ExportEntry, GuestConst, GuestFunction, GuestOp, HostStatus, ModuleManifest,
    SandboxModule, SchemaError, DEFAULT_CODEC, SANDBOX_ABI_VERSION,
};
pub use sandbox::{status_of, SandboxHost};
pub use scheduler::TaskGroup;
pub use task::{Fiber, IoInterest, Resume, Step, TaskId};
pub use value::{value_display, value_eq, value_hash, value_repr, Payload, Value};
