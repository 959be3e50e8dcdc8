//! Production diagnostics
//!
//! SIGQUIT (`kill -3`) dumps runtime state to stderr without stopping
//! the process: heap counters, scheduler lifetime statistics, open
//! channel count, live handles. Unix only, behind the `diagnostics`
//! feature, as a thread watching the signal with `signal-hook` (a
//! signal-safe handler cannot format reports itself).

#[cfg(all(unix, feature = "diagnostics"))]
mod imp {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, OnceLock};

    use signal_hook::consts::SIGQUIT;
    use signal_hook::iterator::Signals;

    type ReportFn = Box<dyn Fn() -> String + Send>;

    static INSTALLED: AtomicBool = AtomicBool::new(false);
    static REPORTERS: OnceLock<Mutex<Vec<ReportFn>>> = OnceLock::new();

    fn reporters() -> &'static Mutex<Vec<ReportFn>> {
        REPORTERS.get_or_init(|| Mutex::new(Vec::new()))
    }

    /// Register a report source. The first registration spawns the
    /// watcher thread.
    pub fn register_reporter(f: ReportFn) {
        reporters().lock().expect("reporters poisoned").push(f);
        if INSTALLED.swap(true, Ordering::AcqRel) {
            return;
        }
        std::thread::Builder::new()
            .name("molt-diagnostics".into())
            .spawn(|| {
                let mut signals = match Signals::new([SIGQUIT]) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("diagnostics signal handler unavailable: {}", e);
                        return;
                    }
                };
                for _ in signals.forever() {
                    let reports = reporters().lock().expect("reporters poisoned");
                    eprintln!("==== molt runtime diagnostics ====");
                    for report in reports.iter() {
                        eprintln!("{}", report());
                    }
                    eprintln!("==== end diagnostics ====");
                }
            })
            .expect("diagnostics thread spawn");
    }

    /// Wire a runtime instance into the SIGQUIT report.
    pub fn install_for(rt: &Arc<crate::runtime::Runtime>) {
        let rt = Arc::clone(rt);
        register_reporter(Box::new(move || {
            let heap = rt.heap.stats();
            let (spawned, completed, peak) = rt.scheduler_stats();
            let channels = rt
                .chans
                .lock()
                .map(|c| c.open_count())
                .unwrap_or_default();
            format!(
                "heap: {} objects / {} bytes live, {} allocated, {} freed, {} cycle passes\n\
                 tasks: {} spawned, {} completed, peak {}\n\
                 channels open: {}\nhandles live: {}\nscratch bytes: {}",
                heap.live_objects,
                heap.live_bytes,
                heap.total_allocated,
                heap.total_freed,
                heap.cycle_passes,
                spawned,
                completed,
                peak,
                channels,
                rt.handles.live_count(),
                crate::arena::scratch_bytes(),
            )
        }));
    }
}

#[cfg(all(unix, feature = "diagnostics"))]
pub use imp::{install_for, register_reporter};

#[cfg(not(all(unix, feature = "diagnostics")))]
pub fn install_for(_rt: &std::sync::Arc<crate::runtime::Runtime>) {}
