use crate::error::AtomStateError;
use crate::model::{AtomKey, PredicateCatalog};
use bincode::{Decode, Encode};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum AtomStatus {
    RandomVariable,
    Observed,
}

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct AtomState {
    pub status: AtomStatus,
    pub value: f32,
}

const OBSERVED_BIT: u64 = 1 << 32;

impl AtomState {
    pub fn random_variable(value: f32) -> Self {
        AtomState { status: AtomStatus::RandomVariable, value }
    }

    pub fn observed(value: f32) -> Self {
        AtomState { status: AtomStatus::Observed, value }
    }

    // Status and value share one word so a reader can never see them out of step.
    fn pack(self) -> u64 {
        let status = match self.status {
            AtomStatus::RandomVariable => 0,
            AtomStatus::Observed => OBSERVED_BIT,
        };
        status | self.value.to_bits() as u64
    }

    fn unpack(word: u64) -> Self {
        let status = if word & OBSERVED_BIT != 0 {
            AtomStatus::Observed
        } else {
            AtomStatus::RandomVariable
        };
        AtomState {
            status,
            value: f32::from_bits(word as u32),
        }
    }
}

/// One persisted atom, as written by grounding.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct AtomRecord {
    pub key: AtomKey,
    pub state: AtomState,
}

/// The live ground atoms of a session.
///
/// The set of atoms is fixed once the table is built; only the
/// `(status, value)` of each slot changes afterwards, one atomic word per
/// atom, so the optimizer keeps reading untouched atoms while an action
/// mutates another one.
#[derive(Debug, Default)]
pub struct AtomTable {
    cells: Vec<AtomicU64>,
    keys: Vec<AtomKey>,
    index: FxHashMap<AtomKey, u32>,
}

impl AtomTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<AtomRecord>) -> Result<Self, String> {
        let mut table = Self::new();
        for record in records {
            table.insert(record.key, record.state)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, key: AtomKey, state: AtomState) -> Result<u32, String> {
        if self.index.contains_key(&key) {
            return Err(format!("Duplicate ground atom: {:?}", key));
        }
        let slot = self.cells.len() as u32;
        self.cells.push(AtomicU64::new(state.pack()));
        self.index.insert(key.clone(), slot);
        self.keys.push(key);
        Ok(slot)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn lookup(&self, key: &AtomKey) -> Option<u32> {
        self.index.get(key).copied()
    }

    pub fn key(&self, slot: u32) -> &AtomKey {
        &self.keys[slot as usize]
    }

    pub fn state(&self, slot: u32) -> AtomState {
        AtomState::unpack(self.cells[slot as usize].load(Ordering::Acquire))
    }

    pub fn value(&self, slot: u32) -> f32 {
        self.state(slot).value
    }

    /// Freezes a random variable at whatever value it holds right now.
    pub fn fix(&self, slot: u32, catalog: &PredicateCatalog) -> Result<AtomState, AtomStateError> {
        let cell = &self.cells[slot as usize];
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let state = AtomState::unpack(current);
            if state.status == AtomStatus::Observed {
                return Err(AtomStateError::AlreadyObserved(self.key(slot).describe(catalog)));
            }
            let fixed = AtomState::observed(state.value);
            match cell.compare_exchange_weak(current, fixed.pack(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(fixed),
                Err(actual) => current = actual,
            }
        }
    }

    /// Optimizer write path. Returns false, leaving the slot alone, when the
    /// atom has been observed in the meantime.
    pub fn update_value(&self, slot: u32, value: f32) -> bool {
        let cell = &self.cells[slot as usize];
        let mut current = cell.load(Ordering::Acquire);
        loop {
            if AtomState::unpack(current).status == AtomStatus::Observed {
                return false;
            }
            let next = AtomState::random_variable(value).pack();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn records(&self) -> Vec<AtomRecord> {
        self.keys
            .iter()
            .enumerate()
            .map(|(slot, key)| AtomRecord {
                key: key.clone(),
                state: self.state(slot as u32),
            })
            .collect()
    }
}
