//! Trace session lifecycle.
//!
//! One [`trace`] call owns everything: enabling trace events, sizing the
//! ring buffer, the signal-terminated wait, draining and ingesting records,
//! block reduction, rotational ordering and pack write-out. Transport state
//! is captured into a scope guard that restores it on every exit path;
//! restore failures are logged and never change the outcome.

use crate::ingest::{FILEMAP_EVENTS, Ingester};
use crate::order;
use crate::path_filter::{PathFilter, PathPrefix};
use crate::reduce;
use crate::scanner::{PackSet, Scanner};
use pw_error::{PwError, Result};
use pw_ext::ExtTopology;
use pw_index::DeviceTable;
use pw_pack::{codec, naming};
use pw_tracefs::TraceTransport;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const FS_SYSTEM: &str = "fs";
pub const FILEMAP_SYSTEM: &str = "filemap";

/// Events to enable, required ones first.
pub const TRACE_EVENTS: [(&str, &str); 6] = [
    (FS_SYSTEM, "do_sys_open"),
    (FS_SYSTEM, "open_exec"),
    (FS_SYSTEM, "uselib"),
    (FILEMAP_SYSTEM, "mm_filemap_fault"),
    (FILEMAP_SYSTEM, "mm_filemap_get_pages"),
    (FILEMAP_SYSTEM, "mm_filemap_map_pages"),
];
pub const NR_REQUIRED_EVENTS: usize = 2;

/// Ring buffer size while collecting, per cpu.
pub const TRACE_BUFFER_SIZE_KB: u64 = 8192;

/// How much to lower our priority before the I/O-heavy scan.
const NICE_INCREMENT: libc::c_int = 15;

/// Configuration of one trace run.
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    pub daemonise: bool,
    /// Stop after this long; `None` waits for SIGINT/SIGTERM.
    pub timeout: Option<Duration>,
    /// Only write the device whose per-device pack name matches.
    pub filename_to_replace: Option<PathBuf>,
    /// Explicit output path overriding per-device naming.
    pub pack_file: Option<PathBuf>,
    pub path_prefix_filter: Option<String>,
    pub path_prefix: Option<PathPrefix>,
    /// Do not enable or disable trace events (policy-restricted hosts).
    pub use_existing_trace_events: bool,
    pub force_ssd_mode: bool,
}

// ── Signal-driven termination ───────────────────────────────────────────────

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

struct SignalScope {
    old_term: libc::sigaction,
    old_int: libc::sigaction,
}

impl SignalScope {
    fn install() -> std::io::Result<Self> {
        unsafe {
            let mut act: libc::sigaction = std::mem::zeroed();
            act.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as usize;
            libc::sigemptyset(&mut act.sa_mask);

            let mut old_term: libc::sigaction = std::mem::zeroed();
            let mut old_int: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGTERM, &act, &mut old_term) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::sigaction(libc::SIGINT, &act, &mut old_int) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self { old_term, old_int })
        }
    }
}

impl Drop for SignalScope {
    fn drop(&mut self) {
        unsafe {
            libc::sigaction(libc::SIGTERM, &self.old_term, std::ptr::null_mut());
            libc::sigaction(libc::SIGINT, &self.old_int, std::ptr::null_mut());
        }
    }
}

/// Interruptible sleep until a signal or the timeout.
fn wait_for_signal(timeout: Option<Duration>) {
    let deadline = timeout.map(|t| Instant::now() + t);

    while !INTERRUPTED.load(Ordering::SeqCst) {
        let step = match deadline {
            Some(deadline) => {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    break;
                };
                remaining.min(Duration::from_millis(100))
            }
            None => Duration::from_millis(100),
        };
        std::thread::sleep(step);
    }
}

/// A signal during post-processing stops the run at the next phase boundary.
fn checkpoint() -> Result<()> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        Err(PwError::Interrupted)
    } else {
        Ok(())
    }
}

// ── Process plumbing ────────────────────────────────────────────────────────

/// Fork into the background; the parent exits immediately.
fn daemonise() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(PwError::Io(std::io::Error::last_os_error())),
        0 => Ok(()),
        _ => unsafe { libc::_exit(0) },
    }
}

fn lower_priority() {
    unsafe {
        libc::nice(NICE_INCREMENT);
    }
}

// ── Transport restore guard ─────────────────────────────────────────────────

/// Captures trace subsystem state as it is mutated and puts it back on all
/// exit paths. Restore methods are idempotent so the normal path can run
/// them at the right phase while `Drop` covers errors.
struct TransportScope<'a, T: TraceTransport + ?Sized> {
    transport: &'a T,
    manage_events: bool,
    events_were_enabled: [Option<bool>; TRACE_EVENTS.len()],
    prior_buffer_kb: Option<u64>,
    tracing_was_on: Option<bool>,
}

impl<'a, T: TraceTransport + ?Sized> TransportScope<'a, T> {
    fn new(transport: &'a T, manage_events: bool) -> Self {
        Self {
            transport,
            manage_events,
            events_were_enabled: [None; TRACE_EVENTS.len()],
            prior_buffer_kb: None,
            tracing_was_on: None,
        }
    }

    fn restore_tracing(&mut self) {
        if self.tracing_was_on.take() == Some(false) {
            if let Err(err) = self.transport.trace_off() {
                warn!(%err, "failed to turn tracing back off");
            }
        }
    }

    fn restore_events(&mut self) {
        if !self.manage_events {
            return;
        }
        for (i, (system, name)) in TRACE_EVENTS.iter().enumerate() {
            if self.events_were_enabled[i].take() == Some(false) {
                if let Err(err) = self.transport.event_disable(system, name) {
                    warn!(event = name, %err, "failed to disable trace event");
                }
            }
        }
    }

    fn restore_buffer(&mut self) {
        if let Some(kb) = self.prior_buffer_kb.take() {
            if let Err(err) = self.transport.set_buffer_size_kb(kb) {
                warn!(%err, "failed to restore trace buffer size");
            }
        }
    }
}

impl<T: TraceTransport + ?Sized> Drop for TransportScope<'_, T> {
    fn drop(&mut self) {
        self.restore_tracing();
        self.restore_events();
        self.restore_buffer();
    }
}

// ── The trace session ───────────────────────────────────────────────────────

/// Run one complete trace and write the resulting packs.
///
/// Returns the paths written. Only setup failures (events, buffer, trace
/// stream) and write-out failures escape; per-file and per-record problems
/// are absorbed with warnings along the way.
pub fn trace<T: TraceTransport + ?Sized>(
    transport: &T,
    config: &TraceConfig,
) -> Result<Vec<PathBuf>> {
    let mut scope = TransportScope::new(transport, !config.use_existing_trace_events);

    if !config.use_existing_trace_events {
        for (i, (system, name)) in TRACE_EVENTS.iter().enumerate() {
            scope.events_were_enabled[i] =
                Some(transport.event_is_enabled(system, name).unwrap_or(false));
            if let Err(err) = transport.event_enable(system, name) {
                if i < NR_REQUIRED_EVENTS {
                    return Err(PwError::TraceSetup(format!(
                        "cannot enable {system}:{name}: {err}"
                    )));
                }
                debug!(event = name, %err, "optional trace event missing");
            }
        }
    }

    // Read cpu 0 for the per-core size, assuming all cpus match.
    scope.prior_buffer_kb = Some(transport.buffer_size_kb(0)?);
    transport.set_buffer_size_kb(TRACE_BUFFER_SIZE_KB)?;

    scope.tracing_was_on = Some(transport.trace_is_on()?);
    transport.trace_on()?;

    if config.daemonise {
        daemonise()?;
    }

    // Sleep until a signal or the timeout; the signal is the normal way to
    // end collection, so the flag is cleared again afterwards.
    INTERRUPTED.store(false, Ordering::SeqCst);
    {
        let _signals = SignalScope::install()?;
        wait_for_signal(config.timeout);
    }
    INTERRUPTED.store(false, Ordering::SeqCst);

    scope.restore_tracing();
    scope.restore_events();

    // Be nicer: the scan should not starve boot-critical tasks.
    lower_priority();

    let mut filter = PathFilter::new(
        config.path_prefix_filter.clone(),
        config.path_prefix.clone(),
    );
    let mut scanner = Scanner::new(config.force_ssd_mode);
    let mut packs = PackSet::new();
    let mut table = DeviceTable::new();

    {
        let mut ingester = Ingester {
            filter: &mut filter,
            scanner: &mut scanner,
            packs: &mut packs,
            table: &mut table,
        };
        transport.drain_events(&mut |record| ingester.handle(record))?;
    }

    // The buffer has been read; give the memory back before the heavy work.
    scope.restore_buffer();

    let mut files = packs.into_files();

    // Reduce only when the filemap events could have fed the index.
    let have_filemap = FILEMAP_EVENTS
        .iter()
        .all(|name| transport.event_exists(FILEMAP_SYSTEM, name));
    if have_filemap {
        checkpoint()?;
        for file in &mut files {
            reduce::remove_untouched_blocks(file, &table);
        }
    } else {
        info!("filemap events unavailable, keeping unreduced blocks");
    }

    let mut written = Vec::new();
    for file in &mut files {
        checkpoint()?;

        let filename = if let Some(explicit) = &config.pack_file {
            if !written.is_empty() {
                warn!(dev = %file.dev, "explicit pack file already written, skipping device");
                continue;
            }
            explicit.clone()
        } else {
            match naming::pack_file_name_for_device(file.dev) {
                Ok(filename) => filename,
                Err(err) => {
                    warn!(dev = %file.dev, %err, "skipping device");
                    continue;
                }
            }
        };

        if config.pack_file.is_none() {
            if let Some(replace) = &config.filename_to_replace {
                if *replace != filename {
                    info!(path = %filename.display(), "skipping");
                    continue;
                }
            }
        }

        // Only the HDD-optimised packs need ordering; SSDs read in any
        // order quite happily.
        if file.rotational {
            match ExtTopology::open_for_device(file.dev) {
                Ok(topology) => order::add_group_hints(file, &topology),
                Err(err) => debug!(dev = %file.dev, %err, "no inode group topology"),
            }
            order::sort_blocks(file);
            order::sort_paths(file);
        }

        info!(path = %filename.display(), paths = file.paths.len(), blocks = file.blocks.len(), "writing pack");
        codec::write_pack(&filename, file)?;
        written.push(filename);
    }

    Ok(written)
}
