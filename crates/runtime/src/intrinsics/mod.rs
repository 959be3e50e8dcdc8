//! Intrinsic dispatch
//!
//! Lowered code invokes intrinsics by numeric id; this module routes an
//! id to its implementation. Capability requirements from the shared
//! table are re-checked here at call time (the compiler already refused
//! to lower ungranted calls, but artifacts can be run under a narrower
//! manifest than they were built with).
//!
//! Suspending intrinsics (sleep, join, channel send/receive, spawn,
//! parallel kernels) are not dispatched through [`call`]: the compiler
//! lowers them to scheduler suspension sites ([`crate::task::Step`]),
//! because a synchronous call cannot yield.

pub mod any_ops;
pub mod containers;
pub mod io;
pub mod num;
pub mod str_ops;

use std::time::Instant;

use molt_core::{ErrorKind, Intrinsic};

use crate::errors::{internal, type_error, value_error, RtError};
use crate::runtime::Runtime;
use crate::value::{value_eq, value_hash, Payload, Value};

/// Process-start anchor for the monotonic clocks.
static MONO_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

fn mono_now() -> f64 {
    let start = *MONO_START.get_or_init(Instant::now);
    start.elapsed().as_secs_f64()
}

fn chan_id(v: Value) -> Result<u64, RtError> {
    match v.obj().map(|o| &o.payload) {
        Some(Payload::Channel(id)) => Ok(*id),
        _ => Err(type_error(format!(
            "expected channel, got {}",
            v.type_name()
        ))),
    }
}

/// Dispatch a non-suspending intrinsic call.
pub fn call(rt: &Runtime, id: Intrinsic, args: &[Value]) -> Result<Value, RtError> {
    let def = id.def();
    if args.len() != def.params.len() {
        return Err(type_error(format!(
            "{} takes {} arguments, got {}",
            def.name,
            def.params.len(),
            args.len()
        )));
    }
    if let Some(missing) = rt.config.caps.first_missing(def.caps) {
        if !rt.config.trusted {
            return Err(crate::errors::capability_denied(missing));
        }
    }
    let heap = &rt.heap;
    let shapes = &rt.shapes;
    let seed = rt.config.hash_seed;
    match id {
        // --- integer arithmetic
        Intrinsic::IntAdd => num::int_add(heap, args[0], args[1]),
        Intrinsic::IntSub => num::int_sub(heap, args[0], args[1]),
        Intrinsic::IntMul => num::int_mul(heap, args[0], args[1]),
        Intrinsic::IntDiv => num::int_div(heap, args[0], args[1]),
        Intrinsic::IntMod => num::int_mod(heap, args[0], args[1]),
        Intrinsic::IntNeg => num::int_neg(heap, args[0]),
        Intrinsic::IntAnd => num::int_and(heap, args[0], args[1]),
        Intrinsic::IntOr => num::int_or(heap, args[0], args[1]),
        Intrinsic::IntXor => num::int_xor(heap, args[0], args[1]),
        Intrinsic::IntShl => num::int_shl(heap, args[0], args[1]),
        Intrinsic::IntShr => num::int_shr(heap, args[0], args[1]),
        Intrinsic::IntInvert => num::int_invert(heap, args[0]),

        // --- float arithmetic
        Intrinsic::FloatAdd => num::float_add(args[0], args[1]),
        Intrinsic::FloatSub => num::float_sub(args[0], args[1]),
        Intrinsic::FloatMul => num::float_mul(args[0], args[1]),
        Intrinsic::FloatDiv => num::float_div(args[0], args[1]),
        Intrinsic::FloatNeg => num::float_neg(args[0]),

        // --- boolean / comparison / hashing
        Intrinsic::BoolNot => num::bool_not(args[0]),
        Intrinsic::CmpEq => Ok(Value::bool(value_eq(args[0], args[1]))),
        Intrinsic::CmpLt => num::cmp_lt(args[0], args[1]),
        Intrinsic::CmpLe => num::cmp_le(args[0], args[1]),
        Intrinsic::ValueHash => {
            value_hash(seed, args[0]).map(|h| heap.int((h as i64).wrapping_abs()))
        }

        // --- dynamic-path operators (deopt targets)
        Intrinsic::AnyAdd => any_ops::any_add(heap, args[0], args[1]),
        Intrinsic::AnySub => any_ops::any_sub(heap, args[0], args[1]),
        Intrinsic::AnyMul => any_ops::any_mul(heap, args[0], args[1]),
        Intrinsic::AnyDiv => any_ops::any_div(args[0], args[1]),
        Intrinsic::AnyFloorDiv => any_ops::any_floordiv(heap, args[0], args[1]),
        Intrinsic::AnyMod => any_ops::any_mod(heap, args[0], args[1]),
        Intrinsic::AnyNeg => any_ops::any_neg(heap, args[0]),
        Intrinsic::AnyNot => any_ops::any_not(args[0]),
        Intrinsic::AnyContains => any_ops::any_contains(shapes, seed, args[0], args[1]),
        Intrinsic::AnyLen => any_ops::any_len(heap, args[0]),
        Intrinsic::AnyGetItem => any_ops::any_get_item(heap, shapes, seed, args[0], args[1]),
        Intrinsic::AnySetItem => {
            any_ops::any_set_item(heap, shapes, seed, args[0], args[1], args[2])
        }
        Intrinsic::AnyGetAttr => any_ops::any_get_attr(rt, args[0], args[1]),
        Intrinsic::AnySetAttr => any_ops::any_set_attr(rt, args[0], args[1], args[2]),

        // --- containers
        Intrinsic::ListNew => Ok(heap.list(vec![])),
        Intrinsic::ListPush => containers::list_push(heap, args[0], args[1]),
        Intrinsic::ListPop => containers::list_pop(heap, args[0]),
        Intrinsic::ListGet => containers::list_get(args[0], args[1]),
        Intrinsic::ListSet => containers::list_set(heap, args[0], args[1], args[2]),
        Intrinsic::ListLen => containers::list_len(heap, args[0]),
        Intrinsic::TupleNew => containers::tuple_new(heap, args[0]),
        Intrinsic::TupleGet => containers::tuple_get(args[0], args[1]),
        Intrinsic::TupleLen => containers::tuple_len(heap, args[0]),
        Intrinsic::MapNew => Ok(heap.map()),
        Intrinsic::MapGet => containers::map_get(shapes, seed, args[0], args[1]),
        Intrinsic::MapSet => containers::map_set(heap, shapes, seed, args[0], args[1], args[2]),
        Intrinsic::MapDel => containers::map_del(heap, shapes, seed, args[0], args[1]),
        Intrinsic::MapHas => containers::map_has(shapes, seed, args[0], args[1]),
        Intrinsic::MapLen => containers::map_len(heap, args[0]),
        Intrinsic::MapKeys => containers::map_keys(heap, shapes, args[0]),
        Intrinsic::SetNew => Ok(heap.set()),
        Intrinsic::SetAdd => containers::set_add(heap, seed, args[0], args[1]),
        Intrinsic::SetHas => containers::set_has(seed, args[0], args[1]),
        Intrinsic::SetLen => containers::set_len(heap, args[0]),
        Intrinsic::IterNew => containers::iter_new(heap, args[0]),
        Intrinsic::IterNext => containers::iter_next(heap, shapes, args[0]),

        // --- strings and bytes
        Intrinsic::StrLen => str_ops::str_len(heap, args[0]),
        Intrinsic::StrConcat => str_ops::str_concat(heap, args[0], args[1]),
        Intrinsic::StrFind => str_ops::str_find(heap, args[0], args[1]),
        Intrinsic::StrSplit => str_ops::str_split(heap, args[0], args[1]),
        Intrinsic::StrReplace => str_ops::str_replace(heap, args[0], args[1], args[2]),
        Intrinsic::StrCasefold => str_ops::str_casefold(heap, args[0]),
        Intrinsic::StrEncode => str_ops::str_encode(heap, args[0]),
        Intrinsic::BytesDecode => str_ops::bytes_decode(heap, args[0]),
        Intrinsic::StrIndex => str_ops::str_index(heap, args[0], args[1]),
        Intrinsic::StrFormat => str_ops::str_format(heap, args[0], args[1]),
        Intrinsic::NumFormat => str_ops::num_format(heap, args[0], args[1]),

        // --- I/O and environment
        Intrinsic::Print => io::print(rt, args[0]),
        Intrinsic::IoOpen => io::io_open(rt, args[0], args[1]),
        Intrinsic::IoRead => io::io_read(rt, args[0], args[1]),
        Intrinsic::IoWrite => io::io_write(rt, args[0], args[1]),
        Intrinsic::IoClose => io::io_close(rt, args[0]),
        Intrinsic::EnvGet => io::env_get(rt, args[0]),
        Intrinsic::EnvSet => io::env_set(rt, args[0], args[1]),

        // --- scheduler-adjacent, non-suspending
        Intrinsic::TaskCurrent => match rt.current_task() {
            Some(id) => Ok(heap.alloc(Payload::Task(id))),
            None => Err(value_error("no running task")),
        },
        Intrinsic::TaskCancel => {
            let task_id = match args[0].obj().map(|o| &o.payload) {
                Some(Payload::Task(id)) => *id,
                _ => return Err(type_error("expected task")),
            };
            rt.cancel_task(task_id);
            Ok(Value::null())
        }
        Intrinsic::ChanNew => {
            let bound = args[0].expect_i64()?;
            if bound < 1 {
                return Err(value_error("channel bound must be at least 1"));
            }
            let id = rt
                .chans
                .lock()
                .expect("channel table poisoned")
                .create(bound as usize)?;
            Ok(heap.alloc(Payload::Channel(id)))
        }
        Intrinsic::ChanTrySend => {
            let id = chan_id(args[0])?;
            let (outcome, wake) = rt
                .chans
                .lock()
                .expect("channel table poisoned")
                .try_send(id, args[1])?;
            rt.apply_channel_wake(wake);
            match outcome {
                crate::channel::SendOutcome::Sent => Ok(Value::bool(true)),
                crate::channel::SendOutcome::Full => Ok(Value::bool(false)),
                crate::channel::SendOutcome::Closed => Err(value_error("channel is closed")),
            }
        }
        Intrinsic::ChanTryRecv => {
            let id = chan_id(args[0])?;
            let (outcome, wake) = rt
                .chans
                .lock()
                .expect("channel table poisoned")
                .try_recv(id)?;
            rt.apply_channel_wake(wake);
            match outcome {
                crate::channel::RecvOutcome::Received(v) => {
                    Ok(heap.tuple(vec![v, Value::bool(true)]))
                }
                crate::channel::RecvOutcome::Empty => {
                    Ok(heap.tuple(vec![Value::null(), Value::bool(false)]))
                }
                crate::channel::RecvOutcome::Closed => Err(value_error("channel is closed")),
            }
        }
        Intrinsic::ChanClose => {
            let id = chan_id(args[0])?;
            let wakes = rt
                .chans
                .lock()
                .expect("channel table poisoned")
                .close(id)?;
            for wake in wakes {
                rt.apply_channel_wake(Some(wake));
            }
            Ok(Value::null())
        }

        // --- time and randomness
        Intrinsic::TimeMonotonic => Ok(Value::float(mono_now())),
        Intrinsic::TimePerf => Ok(Value::float(mono_now())),
        Intrinsic::TimeWall => {
            rt.require_nondeterminism("wall-clock time")?;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_err(|_| internal("system clock before epoch"))?;
            Ok(Value::float(now.as_secs_f64()))
        }
        Intrinsic::RandomSecure => {
            rt.require_nondeterminism("secure randomness")?;
            let n = args[0].expect_i64()?;
            if n < 0 {
                return Err(value_error("byte count must be non-negative"));
            }
            use rand::RngCore;
            let mut buf = vec![0u8; n as usize];
            rand::rngs::OsRng.fill_bytes(&mut buf);
            Ok(heap.bytes(buf))
        }

        // --- error construction
        Intrinsic::ErrNew => {
            let kind_name = args[0].expect_str()?;
            let kind = ErrorKind::parse(kind_name)
                .ok_or_else(|| value_error(format!("unknown error kind '{}'", kind_name)))?;
            let message = args[1].expect_str()?;
            Ok(heap.error(kind, message, None, Vec::new()))
        }

        // --- suspension sites; never dispatched synchronously
        Intrinsic::TaskSpawn
        | Intrinsic::TaskSleep
        | Intrinsic::TaskJoin
        | Intrinsic::TaskYield
        | Intrinsic::ChanSend
        | Intrinsic::ChanRecv
        | Intrinsic::ParallelFor
        | Intrinsic::ParallelReduce => Err(internal(format!(
            "{} is a suspension site and must be lowered, not called",
            def.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;

    fn rt() -> Runtime {
        Runtime::new(RuntimeConfig::default())
    }

    #[test]
    fn test_dispatch_arith() {
        let rt = rt();
        let r = call(&rt, Intrinsic::IntAdd, &[rt.heap.int(2), rt.heap.int(3)]).unwrap();
        assert_eq!(r.expect_i64().unwrap(), 5);
    }

    #[test]
    fn test_arity_checked() {
        let rt = rt();
        let err = call(&rt, Intrinsic::IntAdd, &[rt.heap.int(2)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn test_capability_rechecked_at_dispatch() {
        let rt = rt();
        let path = rt.heap.str("/etc/hosts");
        let mode = rt.heap.str("r");
        let err = call(&rt, Intrinsic::IoOpen, &[path, mode]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CapabilityDenied);
    }

    #[test]
    fn test_deterministic_mode_blocks_wall_time() {
        let mut config = RuntimeConfig::default();
        config.deterministic = true;
        config.caps = molt_core::CapabilitySet::all();
        let rt = Runtime::new(config);
        let err = call(&rt, Intrinsic::TimeWall, &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeterminismViolation);
        // Monotonic time stays available.
        assert!(call(&rt, Intrinsic::TimeMonotonic, &[]).is_ok());
    }

    #[test]
    fn test_suspending_ids_rejected() {
        let rt = rt();
        let err = call(&rt, Intrinsic::TaskYield, &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn test_err_new() {
        let rt = rt();
        let kind = rt.heap.str("KeyError");
        let msg = rt.heap.str("'x'");
        let e = call(&rt, Intrinsic::ErrNew, &[kind, msg]).unwrap();
        match &e.obj().unwrap().payload {
            Payload::Error(data) => {
                assert_eq!(data.kind, ErrorKind::Key);
                assert_eq!(data.message, "'x'");
            }
            other => panic!("expected error object, got {:?}", other.tag()),
        }
    }
}
