use std::collections::HashMap;

use chrono::{DateTime, Utc};

use bootlog_types::{MAX_MODULE_NAME_LEN, ModuleRecord, split_dependencies, truncate};

/// Per-module timing and dependency records in first-seen order
///
/// Not synchronized on its own; the aggregator keeps it behind a mutex so
/// that touching the index and pushing the entry form one critical section.
#[derive(Debug, Default)]
pub struct ModuleIndex {
    /// Records in insertion order
    records: Vec<ModuleRecord>,

    /// Module name to position in `records`
    positions: HashMap<String, usize>,
}

impl ModuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the record for `module` and mark it active at `at`
    ///
    /// Returns whole seconds since the module's first sighting, clamped to
    /// zero if the clock went backwards.
    pub fn touch<S: AsRef<str>>(
        &mut self,
        module: &str,
        dependencies: &[S],
        at: DateTime<Utc>,
    ) -> u64 {
        let module = truncate(module, MAX_MODULE_NAME_LEN);

        let record = match self.positions.get(module) {
            Some(&pos) => &mut self.records[pos],
            None => {
                self.positions.insert(module.to_string(), self.records.len());
                self.records.push(ModuleRecord::new(module.to_string(), at));
                let last = self.records.len() - 1;
                &mut self.records[last]
            }
        };

        if at > record.last_seen {
            record.last_seen = at;
        }

        for raw in dependencies {
            for name in split_dependencies(raw.as_ref()) {
                if !record.dependencies.contains(name) {
                    record.dependencies.insert(name.to_string());
                }
            }
        }

        (at - record.first_seen).num_seconds().max(0) as u64
    }

    /// Consistent copy of all records, first-seen module first
    pub fn snapshot(&self) -> Vec<ModuleRecord> {
        self.records.clone()
    }

    pub fn get(&self, module: &str) -> Option<&ModuleRecord> {
        self.positions.get(module).map(|&pos| &self.records[pos])
    }

    /// Number of distinct modules seen
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
