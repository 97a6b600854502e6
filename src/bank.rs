//! Memory banks: named byte ranges that pools are carved from

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Result, SubframeError};
use crate::pool::{PagePool, PoolConfig};
use crate::region::UnmanagedRegion;
use crate::stats::ReadoutStats;

/// A named byte range (usually an unmanaged region) with a carve cursor.
#[derive(Debug)]
pub struct MemoryBank {
    name: String,
    region: Arc<UnmanagedRegion>,
    cursor: Mutex<usize>,
}

impl MemoryBank {
    /// Wrap `region` as a bank named `name`
    pub fn new(name: impl Into<String>, region: Arc<UnmanagedRegion>) -> Self {
        Self {
            name: name.into(),
            region,
            cursor: Mutex::new(0),
        }
    }

    /// Bank name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing region
    pub fn region(&self) -> &Arc<UnmanagedRegion> {
        &self.region
    }

    /// Reserve `len` bytes; returns the offset of the reserved range.
    pub fn reserve(&self, len: usize) -> Result<usize> {
        let mut cursor = self.cursor.lock().unwrap();
        let offset = *cursor;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| SubframeError::no_room(len, 0))?;
        if end > self.region.len() {
            return Err(SubframeError::no_room(len, self.region.len() - offset));
        }
        *cursor = end;
        Ok(offset)
    }
}

/// Registry of memory banks, hands out pools carved from them.
#[derive(Debug, Default)]
pub struct BankManager {
    banks: RwLock<HashMap<String, Arc<MemoryBank>>>,
}

impl BankManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a bank under its name
    pub fn add_bank(&self, bank: Arc<MemoryBank>) -> Result<()> {
        let mut banks = self.banks.write().unwrap();
        if banks.contains_key(bank.name()) {
            return Err(SubframeError::config(
                "memoryBankName",
                format!("bank {} already registered", bank.name()),
            ));
        }
        tracing::info!(bank = %bank.name(), size = bank.region().len(), "bank added");
        banks.insert(bank.name().to_string(), bank);
        Ok(())
    }

    /// Look up a bank by name
    pub fn bank(&self, name: &str) -> Option<Arc<MemoryBank>> {
        self.banks.read().unwrap().get(name).cloned()
    }

    /// Create a paged pool backed by bank `bank_name`, or by a private
    /// anonymous mapping when the name is empty or unknown.
    pub fn paged_pool(
        &self,
        config: PoolConfig,
        bank_name: &str,
        stats: Arc<ReadoutStats>,
    ) -> Result<PagePool> {
        if let Some(bank) = self.bank(bank_name) {
            let offset = bank.reserve(config.bytes_required())?;
            return PagePool::in_region(config, Arc::clone(bank.region()), offset, stats);
        }
        PagePool::new(config, stats)
    }
}
