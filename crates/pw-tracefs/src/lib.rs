#![forbid(unsafe_code)]
//! Kernel trace event transport.
//!
//! The trace ingester consumes typed records through the `TraceTransport`
//! trait; `Tracefs` implements it against the kernel's tracefs mount
//! (`/sys/kernel/tracing`, with the older debugfs location as fallback).
//!
//! Record decoding follows the conventions of the events prewarm enables:
//! numeric fields are exposed by their trace-format names (`s_dev`, `i_ino`,
//! `index`, `last_index`), and a `dev MAJ:MIN` token is re-encoded as
//! `(major << 20) | (minor & 0xff)` — the packed form the trace subsystem
//! reports — so the ingester applies one decode path to every transport.

use pw_error::{PwError, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One decoded trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub name: String,
    pub cpu: u32,
    fields: Vec<(String, u64)>,
    text: Option<String>,
}

impl EventRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, cpu: u32) -> Self {
        Self {
            name: name.into(),
            cpu,
            fields: Vec::new(),
            text: None,
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: u64) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Numeric field by its trace-format name.
    #[must_use]
    pub fn number_field(&self, name: &str) -> Option<u64> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| *v)
    }

    /// The record's string payload (the `filename` of open-family events).
    #[must_use]
    pub fn text_field(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

/// Operations prewarm needs from the kernel trace subsystem.
pub trait TraceTransport {
    /// Whether the event is known to this kernel at all.
    fn event_exists(&self, system: &str, event: &str) -> bool;
    fn event_is_enabled(&self, system: &str, event: &str) -> Result<bool>;
    fn event_enable(&self, system: &str, event: &str) -> Result<()>;
    fn event_disable(&self, system: &str, event: &str) -> Result<()>;

    /// Per-cpu ring buffer size in KiB.
    fn buffer_size_kb(&self, cpu: u32) -> Result<u64>;
    /// Set the ring buffer size for all cpus.
    fn set_buffer_size_kb(&self, kb: u64) -> Result<()>;

    fn trace_is_on(&self) -> Result<bool>;
    fn trace_on(&self) -> Result<()>;
    fn trace_off(&self) -> Result<()>;

    /// Drain the buffered records in emission order.
    fn drain_events(&self, on_record: &mut dyn FnMut(&EventRecord)) -> Result<()>;
}

/// The real tracefs mount.
#[derive(Debug)]
pub struct Tracefs {
    root: PathBuf,
}

impl Tracefs {
    /// Locate the tracefs mount.
    pub fn mount() -> Result<Self> {
        for root in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
            if Path::new(root).join("trace").exists() {
                return Ok(Self { root: root.into() });
            }
        }
        Err(PwError::TraceSetup("tracefs is not mounted".into()))
    }

    /// Use an explicit root (tests).
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn event_file(&self, system: &str, event: &str, file: &str) -> PathBuf {
        self.root.join("events").join(system).join(event).join(file)
    }

    fn read_value(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_owned())
            .map_err(|e| PwError::io_at(path, e))
    }

    fn write_value(&self, path: &Path, value: &str) -> Result<()> {
        std::fs::write(path, value).map_err(|e| PwError::io_at(path, e))
    }
}

impl TraceTransport for Tracefs {
    fn event_exists(&self, system: &str, event: &str) -> bool {
        self.event_file(system, event, "format").exists()
    }

    fn event_is_enabled(&self, system: &str, event: &str) -> Result<bool> {
        let state = self.read_value(&self.event_file(system, event, "enable"))?;
        // "X" means enabled with qualifiers; treat anything but "0" as on.
        Ok(state != "0")
    }

    fn event_enable(&self, system: &str, event: &str) -> Result<()> {
        self.write_value(&self.event_file(system, event, "enable"), "1")
    }

    fn event_disable(&self, system: &str, event: &str) -> Result<()> {
        self.write_value(&self.event_file(system, event, "enable"), "0")
    }

    fn buffer_size_kb(&self, cpu: u32) -> Result<u64> {
        let path = self
            .root
            .join("per_cpu")
            .join(format!("cpu{cpu}"))
            .join("buffer_size_kb");
        let value = self.read_value(&path)?;
        value
            .parse()
            .map_err(|_| PwError::TraceSetup(format!("unparseable buffer size {value:?}")))
    }

    fn set_buffer_size_kb(&self, kb: u64) -> Result<()> {
        self.write_value(&self.root.join("buffer_size_kb"), &kb.to_string())
    }

    fn trace_is_on(&self) -> Result<bool> {
        Ok(self.read_value(&self.root.join("tracing_on"))? == "1")
    }

    fn trace_on(&self) -> Result<()> {
        self.write_value(&self.root.join("tracing_on"), "1")
    }

    fn trace_off(&self) -> Result<()> {
        self.write_value(&self.root.join("tracing_on"), "0")
    }

    fn drain_events(&self, on_record: &mut dyn FnMut(&EventRecord)) -> Result<()> {
        let path = self.root.join("trace");
        let file = std::fs::File::open(&path).map_err(|e| PwError::io_at(&path, e))?;
        let reader = BufReader::new(file);

        let mut records = 0_u64;
        for line in reader.lines() {
            let line = line.map_err(PwError::Io)?;
            if let Some(record) = parse_trace_line(&line) {
                records += 1;
                on_record(&record);
            }
        }
        debug!(records, "trace buffer drained");
        Ok(())
    }
}

/// Shift width of a page; filemap events report byte offsets (`ofs`,
/// `max_ofs`) that convert to page indices with this shift.
const PAGE_SHIFT: u32 = 12;

/// Parse one line of the `trace` file into a record.
///
/// Lines look like:
///
/// ```text
///   systemd-1   [000] ....   2.103424: do_sys_open: "/etc/ld.so.cache" flags 524288 mode 0
///   cat-1234    [002] ....  49.001123: mm_filemap_fault: dev 8:1 ino af1d page=... pfn=0x13a2 ofs=86016
/// ```
#[must_use]
pub fn parse_trace_line(line: &str) -> Option<EventRecord> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let lb = line.find('[')?;
    let rb = line[lb..].find(']')? + lb;
    let cpu: u32 = line[lb + 1..rb].trim().parse().ok()?;

    // Skip the flags/timestamp column, then split "event: body".
    let rest = &line[rb + 1..];
    let rest = &rest[rest.find(": ")? + 2..];
    let colon = rest.find(':')?;
    let name = rest[..colon].trim();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    let body = rest[colon + 1..].trim_start();

    let mut record = EventRecord::new(name, cpu);
    let mut body = body;

    // A leading quoted string is the filename payload.
    if let Some(stripped) = body.strip_prefix('"') {
        let close = stripped.find('"')?;
        record = record.with_text(&stripped[..close]);
        body = stripped[close + 1..].trim_start();
    }

    let mut tokens = body.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            if let Some((major, minor)) = tokens.next().and_then(parse_dev_pair) {
                record = record.with_field("s_dev", (u64::from(major) << 20) | u64::from(minor & 0xff));
            }
        } else if token == "ino" {
            // The kernel prints the inode in bare hex.
            if let Some(ino) = tokens.next().and_then(|t| u64::from_str_radix(t, 16).ok()) {
                record = record.with_field("i_ino", ino);
            }
        } else if let Some((key, value)) = token.split_once('=') {
            let Some(value) = parse_number(value) else {
                continue;
            };
            match key {
                "ofs" => record = record.with_field("index", value >> PAGE_SHIFT),
                "max_ofs" => record = record.with_field("last_index", value >> PAGE_SHIFT),
                _ => record = record.with_field(key, value),
            }
        } else if token.chars().all(|c| c.is_ascii_alphabetic() || c == '_') {
            // "flags 524288" style word/value pairs.
            if let Some(value) = tokens.peek().and_then(|t| parse_number(t)) {
                tokens.next();
                record = record.with_field(token, value);
            }
        }
    }

    Some(record)
}

fn parse_dev_pair(token: &str) -> Option<(u32, u32)> {
    let (major, minor) = token.split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn parse_number(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}
