//! Per-group operation statistics.
//!
//! The manager reports every operation outcome as a [`StatsEvent`] to a
//! [`StatsCollector`]. [`GroupStats`] keeps counters for the sum of all
//! groups plus every group registered through `add_group`, each broken down
//! by size class.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use parking_lot::Mutex;

/// Operation being reported.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatsOp {
    Get,
    GetBase,
    GetTouch,
    Add,
    Set,
    Replace,
    Append,
    Prepend,
    Delete,
    Incr,
    Decr,
    UpdateFlags,
    UpdateExpiration,
    Flush,
    Link,
    Unlink,
    CreateWatch,
    CheckWatch,
}

impl StatsOp {
    /// Report name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::GetBase => "get_base",
            Self::GetTouch => "get_touch",
            Self::Add => "add",
            Self::Set => "set",
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Delete => "delete",
            Self::Incr => "incr",
            Self::Decr => "decr",
            Self::UpdateFlags => "update_flags",
            Self::UpdateExpiration => "update_expiration",
            Self::Flush => "flush",
            Self::Link => "item_link",
            Self::Unlink => "item_unlink",
            Self::CreateWatch => "create_watch",
            Self::CheckWatch => "check_watch",
        }
    }
}

/// Outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    /// Read found the item.
    Hit,
    /// Read found the item and subscribed a watch.
    HitWatch,
    /// Write stored the item.
    Success,
    /// Write stored the item and subscribed a watch.
    SuccessWatch,
    /// Key not present.
    Miss,
    /// The supplied watch id does not exist.
    WatchMiss,
    /// Cache id mismatch.
    Mismatch,
    /// Add against an existing key.
    Fail,
    /// Allocation refused at the memory ceiling.
    OutOfMemory,
    /// Item larger than the largest class.
    TooLarge,
}

impl Outcome {
    /// Report name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::HitWatch => "hit_watch",
            Self::Success => "success",
            Self::SuccessWatch => "success_watch",
            Self::Miss => "miss",
            Self::WatchMiss => "watch_miss",
            Self::Mismatch => "mismatch",
            Self::Fail => "fail",
            Self::OutOfMemory => "out_of_memory",
            Self::TooLarge => "too_large",
        }
    }
}

/// A single statistics event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsEvent {
    /// The operation.
    pub op: StatsOp,
    /// Its outcome.
    pub outcome: Outcome,
    /// Group the key belongs to.
    pub group_id: u32,
    /// Size class of the item involved, `0` if none.
    pub class_id: u8,
    /// Bytes involved, `0` if not applicable.
    pub bytes: u64,
}

impl StatsEvent {
    /// Event without a class or byte count.
    pub fn new(op: StatsOp, outcome: Outcome, group_id: u32) -> Self {
        Self {
            op,
            outcome,
            group_id,
            class_id: 0,
            bytes: 0,
        }
    }

    /// Attach the item's class and size.
    pub fn with_item(mut self, class_id: u8, bytes: usize) -> Self {
        self.class_id = class_id;
        self.bytes = bytes as u64;
        self
    }
}

/// Receiver of statistics events.
pub trait StatsCollector: Send + Sync {
    /// Record one event.
    fn record(&self, event: StatsEvent);

    /// Start tracking a group separately. Returns false if already tracked.
    fn add_group(&self, group_id: u32) -> bool;

    /// Stop tracking a group. Returns false if it was not tracked.
    fn remove_group(&self, group_id: u32) -> bool;

    /// Render counters for one group (or the sum of all groups with `None`),
    /// optionally restricted to one class.
    fn report(&self, group_id: Option<u32>, class_id: Option<u8>) -> String;
}

/// Collector that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsCollector for NoopStats {
    fn record(&self, _event: StatsEvent) {}

    fn add_group(&self, _group_id: u32) -> bool {
        true
    }

    fn remove_group(&self, _group_id: u32) -> bool {
        true
    }

    fn report(&self, _group_id: Option<u32>, _class_id: Option<u8>) -> String {
        String::new()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Tally {
    count: u64,
    bytes: u64,
}

type Counters = BTreeMap<(StatsOp, Outcome), Tally>;

#[derive(Debug, Default)]
struct ClassedCounters {
    total: Counters,
    by_class: BTreeMap<u8, Counters>,
}

impl ClassedCounters {
    fn record(&mut self, event: &StatsEvent) {
        let key = (event.op, event.outcome);
        bump(self.total.entry(key).or_default(), event.bytes);
        if event.class_id != 0 {
            let class = self.by_class.entry(event.class_id).or_default();
            bump(class.entry(key).or_default(), event.bytes);
        }
    }

    fn select(&self, class_id: Option<u8>) -> Option<&Counters> {
        match class_id {
            None => Some(&self.total),
            Some(class_id) => self.by_class.get(&class_id),
        }
    }
}

#[inline]
fn bump(tally: &mut Tally, bytes: u64) {
    tally.count += 1;
    tally.bytes += bytes;
}

#[derive(Debug, Default)]
struct GroupStatsInner {
    sum: ClassedCounters,
    groups: HashMap<u32, ClassedCounters>,
}

/// Counting collector with per-group and per-class breakdown.
#[derive(Debug, Default)]
pub struct GroupStats {
    inner: Mutex<GroupStatsInner>,
}

impl GroupStats {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of one `(op, outcome)` pair, for a group or the sum.
    pub fn count(&self, group_id: Option<u32>, op: StatsOp, outcome: Outcome) -> u64 {
        let inner = self.inner.lock();
        let counters = match group_id {
            None => Some(&inner.sum),
            Some(group_id) => inner.groups.get(&group_id),
        };
        counters
            .and_then(|c| c.total.get(&(op, outcome)))
            .map_or(0, |tally| tally.count)
    }
}

impl StatsCollector for GroupStats {
    fn record(&self, event: StatsEvent) {
        let mut inner = self.inner.lock();
        inner.sum.record(&event);
        if let Some(group) = inner.groups.get_mut(&event.group_id) {
            group.record(&event);
        }
    }

    fn add_group(&self, group_id: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.groups.contains_key(&group_id) {
            return false;
        }
        inner.groups.insert(group_id, ClassedCounters::default());
        true
    }

    fn remove_group(&self, group_id: u32) -> bool {
        self.inner.lock().groups.remove(&group_id).is_some()
    }

    fn report(&self, group_id: Option<u32>, class_id: Option<u8>) -> String {
        let inner = self.inner.lock();
        let counters = match group_id {
            None => Some(&inner.sum),
            Some(group_id) => inner.groups.get(&group_id),
        }
        .and_then(|c| c.select(class_id));

        let mut out = String::new();
        if let Some(group_id) = group_id {
            let _ = writeln!(out, "group_id {group_id}");
        }
        if let Some(class_id) = class_id {
            let _ = writeln!(out, "class_id {class_id}");
        }
        let Some(counters) = counters else {
            return out;
        };

        for ((op, outcome), tally) in counters {
            let _ = writeln!(out, "{}_{} {}", op.as_str(), outcome.as_str(), tally.count);
            if tally.bytes != 0 {
                let _ = writeln!(
                    out,
                    "{}_{}_bytes {}",
                    op.as_str(),
                    outcome.as_str(),
                    tally.bytes
                );
            }
        }

        let get = |op: StatsOp| counters.get(&(op, Outcome::Success)).copied().unwrap_or_default();
        let (link, unlink) = (get(StatsOp::Link), get(StatsOp::Unlink));
        let _ = writeln!(out, "curr_items {}", link.count.saturating_sub(unlink.count));
        let _ = writeln!(out, "curr_bytes {}", link.bytes.saturating_sub(unlink.bytes));
        out
    }
}
