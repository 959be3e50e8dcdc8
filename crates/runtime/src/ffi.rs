//! C ABI for native artifacts
//!
//! The native backend emits calls to these symbols; the runtime is
//! linked in as a static library. Values cross this boundary as raw
//! 64-bit NaN-box words.
//!
//! Errors never unwind across the boundary: a failing call stores the
//! error in thread-local state and returns a nonzero status. Generated
//! code checks the status and branches to its unwind path, which reads
//! and clears the slot.

use std::cell::RefCell;
use std::ffi::CString;
use std::sync::{Arc, OnceLock};

use molt_core::{CapabilitySet, Intrinsic};

use crate::errors::RtError;
use crate::runtime::{Runtime, RuntimeConfig};
use crate::value::Value;

static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

thread_local! {
    /// Last error raised through the FFI on this thread.
    static LAST_ERROR: RefCell<Option<RtError>> = const { RefCell::new(None) };

    /// Cached rendering for molt_rt_error_render (keeps the pointer
    /// valid until the next error operation).
    static ERROR_CSTRING: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn runtime() -> &'static Arc<Runtime> {
    RUNTIME.get().expect("molt_rt_init not called")
}

fn set_error(e: RtError) {
    ERROR_CSTRING.with(|c| *c.borrow_mut() = None);
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(e));
}

/// Take the pending error (used by generated unwind paths and tests).
pub fn take_error() -> Option<RtError> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Initialize the process runtime with the manifest capability mask.
/// Idempotent; later calls keep the first configuration.
#[no_mangle]
pub extern "C" fn molt_rt_init(caps_mask: u16) {
    let _ = RUNTIME.get_or_init(|| {
        let config = RuntimeConfig::from_env(CapabilitySet::from_mask(caps_mask));
        let rt = Arc::new(Runtime::new(config));
        crate::diagnostics::install_for(&rt);
        rt
    });
}

/// Shutdown: release handles, final cycle pass. Returns the exit code
/// for a pending uncaught error, or 0.
#[no_mangle]
pub extern "C" fn molt_rt_shutdown() -> i32 {
    let rt = runtime();
    rt.shutdown();
    match take_error() {
        Some(e) => {
            eprintln!("{}", e.render());
            e.exit_code()
        }
        None => molt_core::EXIT_OK,
    }
}

/// Build a string value from constant data.
///
/// # Safety
/// `ptr` must reference `len` bytes of valid UTF-8 (the compiler emits
/// only checked literals).
#[no_mangle]
pub unsafe extern "C" fn molt_rt_str_const(ptr: *const u8, len: usize) -> u64 {
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    let s = std::str::from_utf8(bytes).expect("compiler emitted invalid UTF-8 literal");
    runtime().heap.str(s).0.to_bits()
}

/// Build an integer value (promotes past the immediate range).
#[no_mangle]
pub extern "C" fn molt_rt_int(n: i64) -> u64 {
    runtime().heap.int(n).0.to_bits()
}

#[no_mangle]
pub extern "C" fn molt_rt_retain(word: u64) {
    let rt = runtime();
    let _guard = rt.lock.lock();
    rt.heap.retain(Value(molt_core::RawValue::from_bits(word)));
}

#[no_mangle]
pub extern "C" fn molt_rt_release(word: u64) {
    let rt = runtime();
    let _guard = rt.lock.lock();
    rt.heap.release(Value(molt_core::RawValue::from_bits(word)));
}

/// Dispatch a non-suspending intrinsic. Returns 0 and writes the result
/// through `out` on success; returns 1 and stores the error otherwise.
///
/// # Safety
/// `args` must point to `argc` words; `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_intrinsic(
    id: u16,
    argc: u32,
    args: *const u64,
    out: *mut u64,
) -> i32 {
    let rt = runtime();
    let Some(intrinsic) = Intrinsic::from_u16(id) else {
        set_error(crate::errors::internal(format!("unknown intrinsic {}", id)));
        return 1;
    };
    let words = unsafe { std::slice::from_raw_parts(args, argc as usize) };
    let values: Vec<Value> = words
        .iter()
        .map(|w| Value(molt_core::RawValue::from_bits(*w)))
        .collect();
    match crate::intrinsics::call(rt, intrinsic, &values) {
        Ok(v) => {
            unsafe { *out = v.0.to_bits() };
            0
        }
        Err(e) => {
            set_error(e);
            1
        }
    }
}

/// True when an error is pending on this thread.
#[no_mangle]
pub extern "C" fn molt_rt_has_error() -> bool {
    LAST_ERROR.with(|slot| slot.borrow().is_some())
}

/// Record a traceback frame on the pending error while unwinding.
///
/// # Safety
/// Pointers must reference valid UTF-8 of the given lengths.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_error_push_frame(
    func_ptr: *const u8,
    func_len: usize,
    file_ptr: *const u8,
    file_len: usize,
    line: u32,
) {
    let func = unsafe { std::slice::from_raw_parts(func_ptr, func_len) };
    let file = unsafe { std::slice::from_raw_parts(file_ptr, file_len) };
    LAST_ERROR.with(|slot| {
        if let Some(e) = slot.borrow_mut().as_mut() {
            e.push_frame(
                std::str::from_utf8(func).unwrap_or("?"),
                std::str::from_utf8(file).unwrap_or("?"),
                line,
            );
        }
    });
}

// =============================================================================
// Constructors and accessors for generated code
// =============================================================================

/// Arbitrary-precision integer constant from its decimal text.
///
/// # Safety
/// `ptr` must reference `len` ASCII decimal bytes.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_bigint_const(ptr: *const u8, len: usize) -> u64 {
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    let text = std::str::from_utf8(bytes).expect("compiler emitted invalid digits");
    let n = text
        .parse::<num_bigint::BigInt>()
        .expect("compiler emitted invalid integer literal");
    runtime().heap.big_int(n).0.to_bits()
}

unsafe fn words<'a>(argc: u32, argv: *const u64) -> Vec<Value> {
    unsafe { std::slice::from_raw_parts(argv, argc as usize) }
        .iter()
        .map(|w| Value(molt_core::RawValue::from_bits(*w)))
        .collect()
}

/// List constructor; element references are retained.
///
/// # Safety
/// `argv` must point to `argc` words.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_list(argc: u32, argv: *const u64) -> u64 {
    let rt = runtime();
    let items = unsafe { words(argc, argv) };
    for v in &items {
        rt.heap.retain(*v);
    }
    rt.heap.list(items).0.to_bits()
}

/// Tuple constructor; element references are retained.
///
/// # Safety
/// `argv` must point to `argc` words.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_tuple(argc: u32, argv: *const u64) -> u64 {
    let rt = runtime();
    let items = unsafe { words(argc, argv) };
    for v in &items {
        rt.heap.retain(*v);
    }
    rt.heap.tuple(items).0.to_bits()
}

/// Set constructor. Status-returning: unhashable elements raise.
///
/// # Safety
/// `argv` must point to `argc` words; `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_set(argc: u32, argv: *const u64, out: *mut u64) -> i32 {
    let rt = runtime();
    let items = unsafe { words(argc, argv) };
    let set = rt.heap.set();
    for v in items {
        if let Err(e) =
            crate::intrinsics::containers::set_add(&rt.heap, rt.config.hash_seed, set, v)
        {
            rt.heap.release(set);
            set_error(e);
            return 1;
        }
    }
    unsafe { *out = set.0.to_bits() };
    0
}

/// Dynamic mapping constructor from parallel key/value arrays.
///
/// # Safety
/// `keys`/`vals` must point to `argc` words each; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_map_new(
    argc: u32,
    keys: *const u64,
    vals: *const u64,
    out: *mut u64,
) -> i32 {
    let rt = runtime();
    let keys = unsafe { words(argc, keys) };
    let vals = unsafe { words(argc, vals) };
    let map = rt.heap.map();
    for (k, v) in keys.into_iter().zip(vals) {
        if let Err(e) = crate::intrinsics::containers::map_set(
            &rt.heap,
            &rt.shapes,
            rt.config.hash_seed,
            map,
            k,
            v,
        ) {
            rt.heap.release(map);
            set_error(e);
            return 1;
        }
    }
    unsafe { *out = map.0.to_bits() };
    0
}

/// Shape-stable record constructor: one slot per shape key, in shape
/// order. Value references are retained.
///
/// # Safety
/// `vals` must point to `argc` words.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_shaped_map(shape: u32, argc: u32, vals: *const u64) -> u64 {
    let rt = runtime();
    let slots = unsafe { words(argc, vals) };
    for v in &slots {
        rt.heap.retain(*v);
    }
    rt.heap.shaped_map(shape, slots).0.to_bits()
}

/// Instance allocation with null-initialized field slots.
#[no_mangle]
pub extern "C" fn molt_rt_instance(class: u32, field_count: u32) -> u64 {
    let rt = runtime();
    rt.heap
        .instance(class, vec![Value::null(); field_count as usize])
        .0
        .to_bits()
}

/// Fixed-offset load from a shaped map or instance. Borrowed result.
#[no_mangle]
pub extern "C" fn molt_rt_load_field(obj: u64, offset: u32) -> u64 {
    let v = Value(molt_core::RawValue::from_bits(obj));
    let loaded = match v.obj().map(|o| &o.payload) {
        Some(crate::value::Payload::Map(m)) => {
            m.borrow().slots.get(offset as usize).copied()
        }
        Some(crate::value::Payload::Instance(i)) => {
            i.fields.borrow().get(offset as usize).copied()
        }
        _ => None,
    };
    loaded.unwrap_or_else(Value::null).0.to_bits()
}

/// Fixed-offset store into a shaped map or instance; retains the new
/// value, releases the old.
#[no_mangle]
pub extern "C" fn molt_rt_store_field(obj: u64, offset: u32, value: u64) {
    let rt = runtime();
    let obj = Value(molt_core::RawValue::from_bits(obj));
    let value = Value(molt_core::RawValue::from_bits(value));
    let _guard = rt.lock.lock();
    match obj.obj().map(|o| &o.payload) {
        Some(crate::value::Payload::Map(m)) => {
            let mut m = m.borrow_mut();
            if let Some(slot) = m.slots.get_mut(offset as usize) {
                rt.heap.retain(value);
                let old = *slot;
                *slot = value;
                rt.heap.release(old);
            }
        }
        Some(crate::value::Payload::Instance(i)) => {
            let mut fields = i.fields.borrow_mut();
            if let Some(slot) = fields.get_mut(offset as usize) {
                rt.heap.retain(value);
                let old = *slot;
                *slot = value;
                rt.heap.release(old);
            }
        }
        _ => {}
    }
}

/// Resolve a handle word to its object value; null when stale.
#[no_mangle]
pub extern "C" fn molt_rt_handle_resolve(word: u64) -> u64 {
    let rt = runtime();
    let v = Value(molt_core::RawValue::from_bits(word));
    if !v.0.is_handle() {
        return Value::null().0.to_bits();
    }
    match rt.handles.resolve(v.0.as_handle()) {
        Some(addr) => Value::from_heap(addr as *mut crate::value::HeapObj)
            .0
            .to_bits(),
        None => Value::null().0.to_bits(),
    }
}

/// A module function as a callable value.
#[no_mangle]
pub extern "C" fn molt_rt_callable(func: u32) -> u64 {
    runtime().heap.callable(func, vec![]).0.to_bits()
}

/// Error-kind test against the taxonomy.
///
/// # Safety
/// `kind_ptr` must reference `kind_len` bytes of valid UTF-8.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_err_is_a(err: u64, kind_ptr: *const u8, kind_len: usize) -> i32 {
    let bytes = unsafe { std::slice::from_raw_parts(kind_ptr, kind_len) };
    let Some(kind) = std::str::from_utf8(bytes).ok().and_then(molt_core::ErrorKind::parse)
    else {
        return 0;
    };
    let v = Value(molt_core::RawValue::from_bits(err));
    match v.obj().map(|o| &o.payload) {
        Some(crate::value::Payload::Error(e)) => e.kind.is_a(kind) as i32,
        _ => 0,
    }
}

/// Attach a cause to an error value; returns the error word.
#[no_mangle]
pub extern "C" fn molt_rt_err_set_cause(err: u64, cause: u64) -> u64 {
    let rt = runtime();
    let e = Value(molt_core::RawValue::from_bits(err));
    let c = Value(molt_core::RawValue::from_bits(cause));
    match e.obj().map(|o| &o.payload) {
        Some(crate::value::Payload::Error(data)) => {
            let rebuilt = rt.heap.error(
                data.kind,
                data.message.clone(),
                Some(c),
                data.frames.clone(),
            );
            rt.heap.retain(c);
            rebuilt.0.to_bits()
        }
        _ => err,
    }
}

/// Guard test for specialized dispatch: 0=int 1=float 2=bool 3=str
/// 4=class (with `class` as the id).
#[no_mangle]
pub extern "C" fn molt_rt_guard(word: u64, kind: u32, class: u32) -> i32 {
    let v = Value(molt_core::RawValue::from_bits(word));
    let hit = match kind {
        0 => v.as_int().is_some() && !v.0.is_bool(),
        1 => v.0.is_float(),
        2 => v.0.is_bool(),
        3 => v.as_str().is_some(),
        4 => matches!(
            v.obj().map(|o| &o.payload),
            Some(crate::value::Payload::Instance(i)) if i.class_id == class
        ),
        _ => false,
    };
    hit as i32
}

/// Register a shape descriptor (called in shape-index order at
/// startup).
///
/// # Safety
/// `ptrs`/`lens` must describe `count` UTF-8 strings.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_register_shape(
    count: u32,
    ptrs: *const *const u8,
    lens: *const usize,
) -> u32 {
    let mut keys = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let ptr = unsafe { *ptrs.add(i) };
        let len = unsafe { *lens.add(i) };
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        keys.push(String::from_utf8_lossy(bytes).into_owned());
    }
    runtime().shapes.intern(keys)
}

// =============================================================================
// Compiled-code bridge
// =============================================================================
//
// Compiled functions follow the step convention in molt_core::abi::step:
// `fn(frame: *mut u64, out: *mut [u64; 4]) -> i32` with frame[0] the
// resume state and frame[1] the resume payload. The adapters below let
// the scheduler drive compiled tasks and let compiled code call
// through callable values.

/// A compiled step function.
pub type StepFn = unsafe extern "C" fn(*mut u64, *mut u64) -> i32;

static FUNC_TABLE: std::sync::Mutex<Vec<Option<StepFn>>> = std::sync::Mutex::new(Vec::new());

/// Register a compiled function under its artifact function id.
/// Called from generated startup code before any task runs.
///
/// # Safety
/// `ptr` must follow the step convention for the whole process life.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_register_function(id: u32, ptr: StepFn) {
    let mut table = FUNC_TABLE.lock().expect("function table poisoned");
    if table.len() <= id as usize {
        table.resize(id as usize + 1, None);
    }
    table[id as usize] = Some(ptr);
}

fn lookup_function(id: u32) -> Option<StepFn> {
    FUNC_TABLE
        .lock()
        .expect("function table poisoned")
        .get(id as usize)
        .copied()
        .flatten()
}

/// Register a class field (called per field, in slot order).
///
/// # Safety
/// `ptr` must reference `len` bytes of valid UTF-8.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_register_class(field_count: u32, fields: *const *const u8, lens: *const usize) -> u32 {
    let mut names = Vec::with_capacity(field_count as usize);
    for i in 0..field_count as usize {
        let ptr = unsafe { *fields.add(i) };
        let len = unsafe { *lens.add(i) };
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        names.push(String::from_utf8_lossy(bytes).into_owned());
    }
    runtime().register_class(names)
}

/// Allocate a frame slab of `slots` words, zeroed.
#[no_mangle]
pub extern "C" fn molt_rt_frame_alloc(slots: usize) -> *mut u64 {
    let mut slab: Box<[u64]> = vec![0u64; slots.max(2)].into_boxed_slice();
    let ptr = slab.as_mut_ptr();
    std::mem::forget(slab);
    ptr
}

/// Free a frame slab allocated with `molt_rt_frame_alloc`.
///
/// # Safety
/// `ptr`/`slots` must match a prior allocation.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_frame_free(ptr: *mut u64, slots: usize) {
    let slots = slots.max(2);
    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, slots)) });
}

/// Truthiness of a value word.
#[no_mangle]
pub extern "C" fn molt_rt_truthy(word: u64) -> i32 {
    Value(molt_core::RawValue::from_bits(word)).truthy() as i32
}

/// Convert the pending thread error into a heap error value (for
/// handler entry). Clears the slot.
#[no_mangle]
pub extern "C" fn molt_rt_take_error_value() -> u64 {
    let rt = runtime();
    match take_error() {
        Some(e) => {
            let cause = None;
            rt.heap
                .error(e.kind, e.message, cause, e.frames)
                .0
                .to_bits()
        }
        None => Value::null().0.to_bits(),
    }
}

/// Raise an error value (a heap Error object) into the thread slot.
#[no_mangle]
pub extern "C" fn molt_rt_raise_value(word: u64) {
    let v = Value(molt_core::RawValue::from_bits(word));
    let err = match v.obj().map(|o| &o.payload) {
        Some(crate::value::Payload::Error(e)) => {
            let mut rt_err = RtError::new(e.kind, e.message.clone());
            rt_err.frames = e.frames.clone();
            rt_err
        }
        _ => crate::errors::type_error("raise of a non-error value"),
    };
    set_error(err);
}

/// Spawn a task driving a callable value on the scheduler.
#[no_mangle]
pub extern "C" fn molt_rt_spawn_callable(callee: u64) -> u64 {
    let rt = runtime();
    let callee = Value(molt_core::RawValue::from_bits(callee));
    match compiled_fiber(callee) {
        Ok(fiber) => {
            let id = rt.spawn(fiber);
            rt.heap.alloc(crate::value::Payload::Task(id)).0.to_bits()
        }
        Err(e) => {
            set_error(e);
            Value::null().0.to_bits()
        }
    }
}

/// Drive a callable value synchronously (dynamic call sites). A callee
/// that suspends from a synchronous call is a defect.
///
/// # Safety
/// `args` must point to `argc` words; `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_call_value(
    callee: u64,
    argc: u32,
    args: *const u64,
    out: *mut u64,
) -> i32 {
    let callee = Value(molt_core::RawValue::from_bits(callee));
    let payload = match callee.obj() {
        Some(obj) => &obj.payload,
        None => {
            set_error(crate::errors::type_error("call of a non-callable value"));
            return 1;
        }
    };
    let data = match payload {
        crate::value::Payload::Callable(data) => data,
        _ => {
            set_error(crate::errors::type_error("call of a non-callable value"));
            return 1;
        }
    };
    let Some(step_fn) = lookup_function(data.function_id) else {
        set_error(crate::errors::internal(format!(
            "function {} not registered",
            data.function_id
        )));
        return 1;
    };
    // Frame layout: [state, resume, params..., capture slots are the
    // callee's own business]. 256 local slots covers the compiler's
    // frame budget; generated code never indexes past its value count.
    let frame = molt_rt_frame_alloc(FRAME_SLOTS);
    unsafe {
        for i in 0..argc as usize {
            *frame.add(2 + i) = *args.add(i);
        }
        let mut step_out = [0u64; 4];
        let status = step_fn(frame, step_out.as_mut_ptr());
        molt_rt_frame_free(frame, FRAME_SLOTS);
        match status {
            molt_core::abi::step::RETURN => {
                *out = step_out[1];
                0
            }
            molt_core::abi::step::RAISE => 1,
            _ => {
                set_error(crate::errors::internal(
                    "callee suspended inside a synchronous call",
                ));
                1
            }
        }
    }
}

/// Default frame slab size for compiled calls (in words).
const FRAME_SLOTS: usize = 256;

/// Wrap a callable value as a scheduler fiber that drives the compiled
/// step function, translating step codes into scheduler suspensions.
fn compiled_fiber(callee: Value) -> Result<crate::task::Fiber, RtError> {
    use crate::task::{Resume, Step};
    use molt_core::abi::step;

    let (function_id, captures): (u32, Vec<Value>) = match callee.obj().map(|o| &o.payload) {
        Some(crate::value::Payload::Callable(data)) => {
            (data.function_id, data.captures.to_vec())
        }
        _ => return Err(crate::errors::type_error("spawn of a non-callable value")),
    };
    let Some(step_fn) = lookup_function(function_id) else {
        return Err(crate::errors::internal(format!(
            "function {} not registered",
            function_id
        )));
    };

    struct FrameBox(*mut u64);
    // The frame is owned by this fiber alone; the scheduler runs it
    // from one thread at a time.
    unsafe impl Send for FrameBox {}
    impl Drop for FrameBox {
        fn drop(&mut self) {
            unsafe { molt_rt_frame_free(self.0, FRAME_SLOTS) };
        }
    }

    let frame = FrameBox(molt_rt_frame_alloc(FRAME_SLOTS));
    unsafe {
        for (i, c) in captures.iter().enumerate() {
            *frame.0.add(2 + i) = c.0.to_bits();
        }
    }

    Ok(Box::new(move |rt: &crate::runtime::Runtime, resume: Resume| {
        let frame = &frame;
        let frame_ptr = frame.0;
        unsafe {
            // Resume payload into frame[1]; errors re-raise through the
            // thread slot so compiled handlers can observe them.
            match resume {
                Resume::Start => {}
                Resume::Ready(v) => *frame_ptr.add(1) = v.0.to_bits(),
                Resume::Err(e) | Resume::Cancelled(e) => {
                    set_error(e);
                    *frame_ptr.add(1) = Value::null().0.to_bits();
                }
            }
            let mut out = [0u64; 4];
            let status = step_fn(frame_ptr, out.as_mut_ptr());
            let word = |w: u64| Value(molt_core::RawValue::from_bits(w));
            match status {
                step::RETURN => Step::Done(Ok(word(out[1]))),
                step::RAISE => Step::Done(Err(take_error()
                    .unwrap_or_else(|| crate::errors::internal("raise without error")))),
                step::YIELD => {
                    // Generators driven as tasks deliver their values
                    // through the scheduler like any other suspension.
                    let _ = rt;
                    Step::Yield
                }
                step::SLEEP => {
                    let secs = word(out[1]).as_f64().unwrap_or(0.0).max(0.0);
                    Step::Sleep(std::time::Duration::from_secs_f64(secs))
                }
                step::CHAN_SEND => {
                    let chan = word(out[1]);
                    match chan.obj().map(|o| &o.payload) {
                        Some(crate::value::Payload::Channel(id)) => {
                            Step::WaitChanSend(*id, word(out[2]))
                        }
                        _ => Step::Done(Err(crate::errors::type_error("send on non-channel"))),
                    }
                }
                step::CHAN_RECV => {
                    let chan = word(out[1]);
                    match chan.obj().map(|o| &o.payload) {
                        Some(crate::value::Payload::Channel(id)) => Step::WaitChanRecv(*id),
                        _ => Step::Done(Err(crate::errors::type_error("recv on non-channel"))),
                    }
                }
                step::JOIN => {
                    let task = word(out[1]);
                    match task.obj().map(|o| &o.payload) {
                        Some(crate::value::Payload::Task(id)) => Step::WaitJoin(*id),
                        _ => Step::Done(Err(crate::errors::type_error("join on non-task"))),
                    }
                }
                step::YIELD_NOW => Step::Yield,
                other => Step::Done(Err(crate::errors::internal(format!(
                    "unknown step code {}",
                    other
                )))),
            }
        }
    }))
}

/// Data-parallel kernel loop over the worker pool. The body callable
/// is driven synchronously per index; cancellation is observed at
/// chunk boundaries.
#[no_mangle]
pub extern "C" fn molt_rt_parallel_for(start: i64, end: i64, body: u64) -> i32 {
    let rt = runtime();
    let token = rt
        .current_token()
        .unwrap_or_else(crate::cancel::CancelToken::root);
    let result = crate::parallel::parallel_for(start, end, &token, move |i| {
        let arg = runtime().heap.int(i).0.to_bits();
        let mut out = 0u64;
        let status = unsafe { molt_rt_call_value(body, 1, &arg, &mut out) };
        if status == 0 {
            Ok(())
        } else {
            Err(take_error().unwrap_or_else(|| crate::errors::internal("kernel body failed")))
        }
    });
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_error(e);
            1
        }
    }
}

/// Data-parallel reduction; partials combine in strict chunk-index
/// order so deterministic builds are schedule-invariant.
///
/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn molt_rt_parallel_reduce(
    start: i64,
    end: i64,
    body: u64,
    identity: u64,
    combine: u64,
    out: *mut u64,
) -> i32 {
    let rt = runtime();
    let token = rt
        .current_token()
        .unwrap_or_else(crate::cancel::CancelToken::root);
    let result = crate::parallel::parallel_reduce(
        start,
        end,
        &token,
        identity,
        move |i| {
            let arg = runtime().heap.int(i).0.to_bits();
            let mut o = 0u64;
            let status = unsafe { molt_rt_call_value(body, 1, &arg, &mut o) };
            if status == 0 {
                Ok(o)
            } else {
                Err(take_error()
                    .unwrap_or_else(|| crate::errors::internal("kernel body failed")))
            }
        },
        move |a, b| {
            let args = [a, b];
            let mut o = 0u64;
            let status = unsafe { molt_rt_call_value(combine, 2, args.as_ptr(), &mut o) };
            if status == 0 {
                o
            } else {
                // Combine must be total; a failure surfaces as the
                // identity so the error in the slot propagates below.
                a
            }
        },
    );
    match result {
        Ok(v) => {
            unsafe { *out = v };
            0
        }
        Err(e) => {
            set_error(e);
            1
        }
    }
}

/// Run a registered function as the top-level task and return the
/// process exit code.
#[no_mangle]
pub extern "C" fn molt_rt_run_toplevel(func_id: u32) -> i32 {
    let rt = runtime();
    let callee = rt.heap.callable(func_id, vec![]);
    let fiber = match compiled_fiber(callee) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{}", e.render());
            return e.exit_code();
        }
    };
    match rt.run_main(fiber) {
        Ok(_) => {
            rt.shutdown();
            molt_core::EXIT_OK
        }
        Err(e) => {
            rt.shutdown();
            eprintln!("{}", e.render());
            e.exit_code()
        }
    }
}

/// Render the pending error as a C string.
///
/// The pointer is valid until the next error operation on this thread.
/// Returns null when nothing is pending.
#[no_mangle]
pub extern "C" fn molt_rt_error_render() -> *const std::os::raw::c_char {
    LAST_ERROR.with(|slot| match slot.borrow().as_ref() {
        Some(e) => {
            let text = e.render().replace('\0', "?");
            ERROR_CSTRING.with(|c| {
                let cstring = CString::new(text).expect("null bytes replaced");
                let ptr = cstring.as_ptr();
                *c.borrow_mut() = Some(cstring);
                ptr
            })
        }
        None => std::ptr::null(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_and_intrinsic_roundtrip() {
        molt_rt_init(0);
        let a = molt_rt_int(20);
        let b = molt_rt_int(22);
        let args = [a, b];
        let mut out = 0u64;
        let status = unsafe {
            molt_rt_intrinsic(
                Intrinsic::IntAdd as u16,
                2,
                args.as_ptr(),
                &mut out as *mut u64,
            )
        };
        assert_eq!(status, 0);
        let v = Value(molt_core::RawValue::from_bits(out));
        assert_eq!(v.expect_i64().unwrap(), 42);
    }

    #[test]
    #[serial]
    fn test_error_path_sets_status_and_slot() {
        molt_rt_init(0);
        let a = molt_rt_int(1);
        let b = molt_rt_int(0);
        let args = [a, b];
        let mut out = 0u64;
        let status = unsafe {
            molt_rt_intrinsic(
                Intrinsic::IntDiv as u16,
                2,
                args.as_ptr(),
                &mut out as *mut u64,
            )
        };
        assert_eq!(status, 1);
        assert!(molt_rt_has_error());
        let err = take_error().unwrap();
        assert_eq!(err.kind, molt_core::ErrorKind::ZeroDivision);
        assert!(!molt_rt_has_error());
    }
}
