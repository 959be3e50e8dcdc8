//! I/O and environment intrinsics
//!
//! Open files are heap objects owned by a handle: `io_open` registers
//! the file object in the handle registry and lowered code carries the
//! handle, never the pointer. Reads and writes are blocking host calls
//! and therefore must not be made while the runtime lock is held; the
//! scheduler guarantees that by construction (intrinsics run from
//! fibers, outside the lock).

use std::io::{Read, Write};

use molt_core::Capability;

use crate::errors::{os_error, type_error, value_error, RtError};
use crate::runtime::Runtime;
use crate::value::{Payload, Value};

/// Write a line to stdout. No capability: the standard streams belong
/// to the process, not the host boundary.
pub fn print(rt: &Runtime, v: Value) -> Result<Value, RtError> {
    let text = crate::value::value_display(v);
    let mut out = std::io::stdout().lock();
    out.write_all(text.as_bytes())
        .and_then(|_| out.write_all(b"\n"))
        .map_err(|e| os_error(format!("stdout write failed: {}", e)))?;
    let _ = rt;
    Ok(Value::null())
}

/// Open a file, returning a handle. Mode is "r", "w", or "a"; write
/// modes additionally require `fs.write`.
pub fn io_open(rt: &Runtime, path: Value, mode: Value) -> Result<Value, RtError> {
    let path = path.expect_str()?;
    let mode = mode.expect_str()?;
    rt.require_cap(Capability::FsRead)?;
    let file = match mode {
        "r" => std::fs::File::open(path),
        "w" => {
            rt.require_cap(Capability::FsWrite)?;
            std::fs::File::create(path)
        }
        "a" => {
            rt.require_cap(Capability::FsWrite)?;
            std::fs::OpenOptions::new().append(true).create(true).open(path)
        }
        _ => return Err(value_error(format!("invalid open mode '{}'", mode))),
    }
    .map_err(|e| os_error(format!("cannot open '{}': {}", path, e)))?;

    let obj = rt
        .heap
        .alloc(Payload::File(std::cell::RefCell::new(Some(file))));
    let addr = obj.obj_ptr().expect("file object is heap") as usize;
    let handle = rt.handles.register(addr);
    Ok(Value::handle(handle))
}

fn file_of(rt: &Runtime, handle: Value) -> Result<Value, RtError> {
    if !handle.0.is_handle() {
        return Err(type_error(format!(
            "expected file handle, got {}",
            handle.type_name()
        )));
    }
    let addr = rt
        .handles
        .resolve(handle.0.as_handle())
        .ok_or_else(|| value_error("stale file handle"))?;
    Ok(Value::from_heap(addr as *mut crate::value::HeapObj))
}

/// Read up to `n` bytes.
pub fn io_read(rt: &Runtime, handle: Value, n: Value) -> Result<Value, RtError> {
    rt.require_cap(Capability::FsRead)?;
    let n = n.expect_i64()?;
    if n < 0 {
        return Err(value_error("read size must be non-negative"));
    }
    let obj = file_of(rt, handle)?;
    let Some(Payload::File(file)) = obj.obj().map(|o| &o.payload) else {
        return Err(type_error("handle does not refer to a file"));
    };
    let mut guard = file.borrow_mut();
    let file = guard.as_mut().ok_or_else(|| value_error("file is closed"))?;
    let mut buf = vec![0u8; n as usize];
    let read = file
        .read(&mut buf)
        .map_err(|e| os_error(format!("read failed: {}", e)))?;
    buf.truncate(read);
    Ok(rt.heap.bytes(buf))
}

/// Write bytes; returns the count written.
pub fn io_write(rt: &Runtime, handle: Value, data: Value) -> Result<Value, RtError> {
    rt.require_cap(Capability::FsWrite)?;
    let bytes = match data.obj().map(|o| &o.payload) {
        Some(Payload::Bytes(b)) => b.as_slice(),
        _ => return Err(type_error("io_write takes bytes")),
    };
    let obj = file_of(rt, handle)?;
    let Some(Payload::File(file)) = obj.obj().map(|o| &o.payload) else {
        return Err(type_error("handle does not refer to a file"));
    };
    let mut guard = file.borrow_mut();
    let file = guard.as_mut().ok_or_else(|| value_error("file is closed"))?;
    file.write_all(bytes)
        .map_err(|e| os_error(format!("write failed: {}", e)))?;
    Ok(rt.heap.int(bytes.len() as i64))
}

/// Close the file and release its handle and object.
pub fn io_close(rt: &Runtime, handle: Value) -> Result<Value, RtError> {
    let obj = file_of(rt, handle)?;
    if let Some(Payload::File(file)) = obj.obj().map(|o| &o.payload) {
        // Dropping the File closes the descriptor.
        file.borrow_mut().take();
    }
    let _guard = rt.lock.lock();
    rt.handles.release(handle.0.as_handle());
    rt.heap.release(obj);
    Ok(Value::null())
}

pub fn env_get(rt: &Runtime, name: Value) -> Result<Value, RtError> {
    rt.require_cap(Capability::EnvRead)?;
    let name = name.expect_str()?;
    match std::env::var(name) {
        Ok(v) => Ok(rt.heap.str(v)),
        Err(_) => Ok(Value::null()),
    }
}

pub fn env_set(rt: &Runtime, name: Value, value: Value) -> Result<Value, RtError> {
    rt.require_cap(Capability::EnvWrite)?;
    std::env::set_var(name.expect_str()?, value.expect_str()?);
    Ok(Value::null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use molt_core::CapabilitySet;
    use std::io::Write as _;

    fn rt_with(caps: CapabilitySet) -> Runtime {
        Runtime::new(RuntimeConfig::default().with_caps(caps))
    }

    #[test]
    fn test_open_denied_without_capability() {
        let rt = rt_with(CapabilitySet::empty());
        let path = rt.heap.str("/tmp/nonexistent");
        let mode = rt.heap.str("r");
        let err = io_open(&rt, path, mode).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::CapabilityDenied);
    }

    #[test]
    fn test_open_read_close_roundtrip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"molt data").unwrap();
        let rt = rt_with(CapabilitySet::empty().with(Capability::FsRead));

        let path = rt.heap.str(tmp.path().to_str().unwrap());
        let mode = rt.heap.str("r");
        let handle = io_open(&rt, path, mode).unwrap();
        assert!(handle.0.is_handle());

        let data = io_read(&rt, handle, rt.heap.int(1024)).unwrap();
        match &data.obj().unwrap().payload {
            Payload::Bytes(b) => assert_eq!(b.as_slice(), b"molt data"),
            other => panic!("expected bytes, got {:?}", other.tag()),
        }

        io_close(&rt, handle).unwrap();
        // Stale handle after close.
        assert!(io_read(&rt, handle, rt.heap.int(1)).is_err());
    }

    #[test]
    fn test_write_requires_write_capability() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let rt = rt_with(CapabilitySet::empty().with(Capability::FsRead));
        let path = rt.heap.str(tmp.path().to_str().unwrap());
        let mode = rt.heap.str("w");
        let err = io_open(&rt, path, mode).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::CapabilityDenied);
    }

    #[test]
    fn test_env_gated() {
        let rt = rt_with(CapabilitySet::empty());
        let name = rt.heap.str("PATH");
        let err = env_get(&rt, name).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::CapabilityDenied);
    }
}
