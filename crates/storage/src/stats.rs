/// Fire-and-forget statistics.
///
/// The storage reports through this sink and never looks at what happens to
/// the numbers. Names are static dotted strings such as `"storage.add_entry"`.
pub trait StatsSink: Send + Sync {
    /// Adds `delta` to a counter.
    fn incr(&self, name: &'static str, delta: u64);

    /// Sets a gauge to `value`.
    fn gauge(&self, name: &'static str, value: u64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl StatsSink for NullStats {
    fn incr(&self, _name: &'static str, _delta: u64) {}

    fn gauge(&self, _name: &'static str, _value: u64) {}
}

pub const ADD_ENTRY: &str = "storage.add_entry";
pub const READ_ENTRY: &str = "storage.read_entry";
pub const FLUSH: &str = "storage.flush";
pub const FLUSHED_ENTRIES: &str = "storage.flushed_entries";
pub const WRITE_CACHE_BYTES: &str = "storage.write_cache_bytes";
pub const INCONSISTENCIES: &str = "storage.inconsistencies";
