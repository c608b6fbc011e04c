//! Trace record dispatch.
//!
//! Open-family records carry a filename and flow through the path filter
//! into the scanner; filemap records carry (device, inode, page interval)
//! and feed the interval index. Records with missing fields are logged and
//! dropped; unknown events are ignored.

use crate::path_filter::PathFilter;
use crate::scanner::{PackSet, Scanner};
use pw_index::DeviceTable;
use pw_tracefs::EventRecord;
use pw_types::{Dev, InodeNumber};
use tracing::warn;

/// Events that name an opened path.
pub const OPEN_EVENTS: [&str; 3] = ["do_sys_open", "open_exec", "uselib"];

/// Events that report page-cache accesses.
pub const FILEMAP_EVENTS: [&str; 3] = [
    "mm_filemap_fault",
    "mm_filemap_get_pages",
    "mm_filemap_map_pages",
];

/// Dispatches one trace's records into the session-owned accumulators.
pub struct Ingester<'a> {
    pub filter: &'a mut PathFilter,
    pub scanner: &'a mut Scanner,
    pub packs: &'a mut PackSet,
    pub table: &'a mut DeviceTable,
}

impl Ingester<'_> {
    pub fn handle(&mut self, record: &EventRecord) {
        if OPEN_EVENTS.contains(&record.name.as_str()) {
            self.handle_open(record);
        } else if FILEMAP_EVENTS.contains(&record.name.as_str()) {
            self.handle_filemap(record);
        }
    }

    fn handle_open(&mut self, record: &EventRecord) {
        let Some(raw) = record.text_field() else {
            warn!(event = %record.name, "record has no filename field, dropped");
            return;
        };

        if let Some(path) = self.filter.admit(raw) {
            self.scanner.scan_path(self.packs, &path);
        }
    }

    fn handle_filemap(&mut self, record: &EventRecord) {
        let Some(raw_dev) = record.number_field("s_dev") else {
            warn!(event = %record.name, "record has no s_dev field, dropped");
            return;
        };
        let Some(ino) = record.number_field("i_ino") else {
            warn!(event = %record.name, "record has no i_ino field, dropped");
            return;
        };
        let Some(index) = record.number_field("index") else {
            warn!(event = %record.name, "record has no index field, dropped");
            return;
        };
        // The fault event carries no last_index; a single page is implied.
        let last_index = record.number_field("last_index").unwrap_or(index);

        // The trace subsystem packs the device with a 20-bit major shift.
        let dev = decode_trace_dev(raw_dev);
        self.table.add(dev, InodeNumber(ino), index, last_index);
    }
}

/// Decode the `s_dev` field as the trace subsystem reports it.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // masked before narrowing
pub fn decode_trace_dev(raw: u64) -> Dev {
    Dev::new((raw >> 20) as u32, (raw & 0xff) as u32)
}
