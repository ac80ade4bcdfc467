//! Counter table and counter aggregator
//!
//! The counter table is a per-CPU arena indexed by cookie. Each CPU only ever
//! writes its own slice, so aggregators on different CPUs never race. A span
//! handler nested on the same CPU may read a value one sample behind; that torn
//! read is accepted instead of synchronizing.

/// Current CPU's slice of the counter table
pub trait CounterTable {
    /// Cumulative sample period for `cookie`, `None` if nothing was recorded yet
    fn load(&self, cookie: u32) -> Option<u64>;

    /// Overwrite the cumulative value for `cookie`
    ///
    /// Cookies outside the table are ignored.
    fn store(&self, cookie: u32, value: u64);

    /// Value written into records: `0` for cookies with no samples yet
    #[inline(always)]
    fn snapshot(&self, cookie: u32) -> u64 {
        self.load(cookie).unwrap_or(0)
    }
}

/// Add one overflow sample's period to the counter for `cookie`
///
/// Initializes the entry to `sample_period` on the first sample for this cookie
/// on this CPU. Never fails.
#[inline(always)]
pub fn accumulate_sample<T: CounterTable + ?Sized>(table: &T, cookie: u32, sample_period: u64) {
    let value = match table.load(cookie) {
        Some(current) => current.saturating_add(sample_period),
        None => sample_period,
    };
    table.store(cookie, value);
}

#[cfg(test)]
pub(crate) mod fake {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::CounterTable;
    use crate::MAX_COUNTERS;

    /// Per-CPU counter table backed by host maps; `cpu` selects the slice
    #[derive(Default)]
    pub struct FakeCounters {
        pub cpu: Cell<u32>,
        pub values: RefCell<HashMap<(u32, u32), u64>>,
        pub loads: Cell<usize>,
    }

    impl FakeCounters {
        pub fn on_cpu(&self, cpu: u32) -> &Self {
            self.cpu.set(cpu);
            self
        }

        pub fn value(&self, cpu: u32, cookie: u32) -> Option<u64> {
            self.values.borrow().get(&(cpu, cookie)).copied()
        }
    }

    impl CounterTable for FakeCounters {
        fn load(&self, cookie: u32) -> Option<u64> {
            self.loads.set(self.loads.get() + 1);
            self.value(self.cpu.get(), cookie)
        }

        fn store(&self, cookie: u32, value: u64) {
            if (cookie as usize) < MAX_COUNTERS {
                self.values.borrow_mut().insert((self.cpu.get(), cookie), value);
            }
        }
    }
}
