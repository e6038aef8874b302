//! The register arena
//!
//! All entries live in one ordered map keyed by [`RegisterKey`], so a plain
//! iteration visits them address-then-kind and a per-kind view is ordered by
//! address. The poll cycle mutates entries through short, synchronous
//! sections; the map is never locked across an await.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use crate::error::{ModbusError, ModbusResult};
use crate::register::{EntryError, RegisterEntry, RegisterKey, RegisterKind, RegisterValue};

/// Register entries indexed by kind and address.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    entries: BTreeMap<RegisterKey, RegisterEntry>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` entries of every kind, addressed 0..count.
    ///
    /// ```rust
    /// use rtu_master::{RegisterKind, RegisterMap};
    ///
    /// let map = RegisterMap::with_entries(16);
    /// assert_eq!(map.len(), 64);
    /// assert_eq!(map.iter_kind(RegisterKind::Coil).count(), 16);
    /// ```
    pub fn with_entries(count: u16) -> Self {
        let entries = RegisterKind::ALL
            .iter()
            .flat_map(|&kind| (0..count).map(move |address| RegisterEntry::new(kind, address)))
            .map(|entry| (entry.key(), entry))
            .collect();
        Self { entries }
    }

    /// Add one entry. Addresses are unique per kind only.
    pub fn add_entry(&mut self, kind: RegisterKind, address: u16) -> ModbusResult<()> {
        let key = RegisterKey::new(kind, address);
        if self.entries.contains_key(&key) {
            return Err(ModbusError::validation(format!(
                "Duplicate {} at address {}",
                kind, address
            )));
        }
        self.entries.insert(key, RegisterEntry::new(kind, address));
        Ok(())
    }

    /// Queue a value for the next write phase.
    ///
    /// Replaces a value queued earlier that has not been written yet. The
    /// value is consumed when the write is issued; a failed write is reported
    /// in `write_error` and not retried.
    pub fn set_pending_write(
        &mut self,
        kind: RegisterKind,
        address: u16,
        value: RegisterValue,
    ) -> ModbusResult<()> {
        kind.ensure_writable()?;
        kind.check_value(value)?;
        let entry = self
            .entries
            .get_mut(&RegisterKey::new(kind, address))
            .ok_or_else(|| {
                ModbusError::validation(format!("No {} at address {}", kind, address))
            })?;
        entry.pending_write = Some(value);
        Ok(())
    }

    pub fn get(&self, kind: RegisterKind, address: u16) -> Option<&RegisterEntry> {
        self.entries.get(&RegisterKey::new(kind, address))
    }

    /// All entries, address-then-kind.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterEntry> {
        self.entries.values()
    }

    /// Entries of one kind, by address.
    pub fn iter_kind(&self, kind: RegisterKind) -> impl Iterator<Item = &RegisterEntry> {
        self.entries.values().filter(move |entry| entry.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<RegisterKey> {
        self.entries.keys().copied().collect()
    }

    /// Writable entries with a queued value, address-then-kind.
    pub fn pending_writes(&self) -> Vec<RegisterKey> {
        self.entries
            .values()
            .filter(|entry| entry.is_writable() && entry.pending_write.is_some())
            .map(RegisterEntry::key)
            .collect()
    }

    /// Owned copy of every entry for observers.
    pub fn snapshot(&self) -> Vec<RegisterEntry> {
        self.entries.values().cloned().collect()
    }

    // ===== Cycle bookkeeping =====

    /// Take the queued value and mark the entry busy.
    pub(crate) fn begin_write(&mut self, key: RegisterKey) -> Option<RegisterValue> {
        let entry = self.entries.get_mut(&key)?;
        let value = entry.pending_write.take()?;
        entry.updating = true;
        entry.write_error = None;
        Some(value)
    }

    pub(crate) fn finish_write(&mut self, key: RegisterKey, result: &ModbusResult<()>) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.updating = false;
            entry.write_error = result.as_ref().err().map(EntryError::from);
        }
    }

    pub(crate) fn begin_read(&mut self, key: RegisterKey) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.updating = true;
                entry.error = None;
                true
            }
            None => false,
        }
    }

    /// Store the read outcome. A failure keeps the previous value.
    pub(crate) fn finish_read(&mut self, key: RegisterKey, result: &ModbusResult<RegisterValue>) {
        if let Some(entry) = self.entries.get_mut(&key) {
            match result {
                Ok(value) => entry.value = Some(*value),
                Err(err) => entry.error = Some(EntryError::from(err)),
            }
            entry.updating = false;
            entry.last_update = Some(Utc::now());
        }
    }
}

/// Shared lock recovery: a poisoned map is still consistent field by field.
pub(crate) fn read_map(map: &RwLock<RegisterMap>) -> RwLockReadGuard<'_, RegisterMap> {
    map.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_map(map: &RwLock<RegisterMap>) -> RwLockWriteGuard<'_, RegisterMap> {
    map.write().unwrap_or_else(PoisonError::into_inner)
}
