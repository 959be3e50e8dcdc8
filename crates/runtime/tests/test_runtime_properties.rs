//! Cross-module runtime properties: the behaviors the object model,
//! scheduler, channels, and collector promise each other.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use molt_runtime::task::{Resume, Step};
use molt_runtime::value::{value_eq, value_hash, Payload};
use molt_runtime::{Runtime, RuntimeConfig, Value};

fn rt() -> Runtime {
    Runtime::new(RuntimeConfig::default())
}

#[test]
fn test_type_stable_across_retain_release() {
    let rt = rt();
    let v = rt.heap.str("stable");
    let before = v.type_name();
    for _ in 0..64 {
        rt.heap.retain(v);
    }
    for _ in 0..64 {
        rt.heap.release(v);
    }
    assert_eq!(v.type_name(), before);
    assert_eq!(v.as_str(), Some("stable"));
    rt.heap.release(v);
}

#[test]
fn test_hash_idempotent_under_fixed_seed() {
    let rt = rt();
    let values = [
        rt.heap.str("molt"),
        rt.heap.int(42),
        Value::float(2.5),
        rt.heap.tuple(vec![rt.heap.int(1), rt.heap.str("x")]),
    ];
    for v in values {
        let a = value_hash(7, v).unwrap();
        let b = value_hash(7, v).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn test_channel_bound_never_exceeded() {
    // Producer floods a bound-2 channel; at every scheduler step the
    // queue depth stays within the bound.
    let rt = rt();
    let chan = rt.channel_create(2).unwrap();

    let mut remaining = 10i64;
    rt.spawn(Box::new(move |_rt, _resume| {
        if remaining == 0 {
            return Step::Done(Ok(Value::null()));
        }
        remaining -= 1;
        Step::WaitChanSend(chan, Value::small_int(remaining))
    }));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let mut pending = 10usize;
    rt.spawn(Box::new(move |rt, resume| {
        if let Resume::Ready(v) = resume {
            if !v.is_null() {
                sink.lock().unwrap().push(v.expect_i64().unwrap());
                pending -= 1;
            }
        }
        // The bound invariant holds at every suspension point.
        let depth = rt.channel_depth(chan).unwrap();
        assert!(depth <= 2, "queue depth {} exceeded the bound", depth);
        if pending == 0 {
            Step::Done(Ok(Value::null()))
        } else {
            Step::WaitChanRecv(chan)
        }
    }));

    rt.run();
    let got = received.lock().unwrap().clone();
    assert_eq!(got.len(), 10);
    // FIFO per sender: the producer's own order is preserved.
    let mut sorted = got.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(got, sorted);
}

#[test]
fn test_group_cancellation_wall_time() {
    // Child B fails fast; sibling A must observe cancellation at its
    // sleep long before the sleep elapses.
    let rt = rt();
    let started = Instant::now();
    let mut group = rt.group();
    rt.group_spawn(
        &mut group,
        Box::new(|_rt, resume| match resume {
            Resume::Start => Step::Sleep(Duration::from_millis(100)),
            Resume::Cancelled(e) => Step::Done(Err(e)),
            _ => Step::Done(Ok(Value::null())),
        }),
    );
    rt.group_spawn(
        &mut group,
        Box::new(|_rt, resume| match resume {
            Resume::Start => Step::Sleep(Duration::from_millis(10)),
            _ => Step::Done(Err(molt_runtime::errors::value_error("b failed"))),
        }),
    );
    let result = rt.run_main(Runtime::group_join_fiber(group));
    assert_eq!(result.unwrap_err().message, "b failed");
    assert!(
        started.elapsed() < Duration::from_millis(50),
        "cancellation took {:?}",
        started.elapsed()
    );
}

#[test]
fn test_cycle_reclaim_returns_to_baseline() {
    let rt = rt();
    let baseline = rt.heap.live_bytes();

    // a = []; a.append(a); del a
    let a = rt.heap.list(vec![]);
    if let Payload::List(items) = &a.obj().unwrap().payload {
        items.borrow_mut().push(a);
    }
    rt.heap.retain(a);
    rt.heap.release(a);

    assert!(rt.heap.live_bytes() > baseline);
    molt_runtime::cycle::collect_cycles(&rt.heap);
    assert_eq!(rt.heap.live_bytes(), baseline);

    // A second pass with no intervening allocation reclaims nothing.
    assert_eq!(molt_runtime::cycle::collect_cycles(&rt.heap), 0);
}

#[test]
fn test_codec_roundtrip_over_representable_values() {
    let rt = rt();
    let m = rt.heap.map();
    let k = rt.heap.str("items");
    let list = rt.heap.list(vec![
        rt.heap.int(1),
        Value::float(2.5),
        rt.heap.str("three"),
        Value::null(),
        Value::bool(true),
        rt.heap.bytes(vec![9, 8, 7]),
    ]);
    molt_runtime::intrinsics::containers::map_set(&rt.heap, &rt.shapes, 0, m, k, list).unwrap();

    let typed = molt_runtime::codec::to_typed(&rt.shapes, m).unwrap();
    let bytes = molt_runtime::encode(&typed).unwrap();
    let back = molt_runtime::decode(&bytes).unwrap();
    assert_eq!(typed, back);

    let rebuilt = molt_runtime::codec::from_typed(&rt.heap, &rt.shapes, 0, &back);
    let k2 = rt.heap.str("items");
    let original = molt_runtime::intrinsics::containers::map_get(&rt.shapes, 0, m, k2).unwrap();
    let round = molt_runtime::intrinsics::containers::map_get(&rt.shapes, 0, rebuilt, k2).unwrap();
    assert!(value_eq(original, round));
}

#[test]
fn test_call_soon_fifo_within_tick() {
    let rt = rt();
    let log = Arc::new(Mutex::new(Vec::new()));
    for n in 0..8 {
        let log = Arc::clone(&log);
        rt.call_soon(Box::new(move |_rt| log.lock().unwrap().push(n)));
    }
    rt.run();
    assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
}
