use crate::InferenceError;
use crate::atom_table::AtomTable;
use crate::page_store::TermPageStore;
use crate::term::PageTerm;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct ReasonerOptions {
    pub step_size: f32,
    pub max_epochs_per_round: usize,
    /// A round ends early once an epoch moves no atom by more than this.
    pub tolerance: f32,
}

impl Default for ReasonerOptions {
    fn default() -> Self {
        Self {
            step_size: 0.1,
            max_epochs_per_round: 50,
            tolerance: 1e-5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: u64,
    pub terms: usize,
    pub objective: f64,
    pub max_movement: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EpochOutcome {
    Completed(EpochSummary),
    Stopped,
}

/// Wakes an idle reasoner or tells it to stop.
#[derive(Clone)]
pub struct ReasonerHandle {
    wake: Sender<()>,
    stop: Arc<AtomicBool>,
}

impl ReasonerHandle {
    pub fn channel() -> (ReasonerHandle, Receiver<()>) {
        let (wake, rx) = crossbeam_channel::bounded(1);
        let handle = ReasonerHandle {
            wake,
            stop: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    /// The model changed; start another round if idle.
    pub fn notify(&self) {
        match self.wake.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.notify();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Drives the page store epoch by epoch.
///
/// The numeric update is a projected gradient step on each term's loss.
/// Observed atoms are read but never written: the write goes through
/// [`AtomTable::update_value`], which refuses atoms fixed since the read.
pub struct Reasoner<T: PageTerm> {
    store: TermPageStore<T>,
    atoms: Arc<AtomTable>,
    options: ReasonerOptions,
    epochs: u64,
}

impl<T: PageTerm> Reasoner<T> {
    pub fn new(store: TermPageStore<T>, atoms: Arc<AtomTable>, options: ReasonerOptions) -> Self {
        Self {
            store,
            atoms,
            options,
            epochs: 0,
        }
    }

    pub fn epochs(&self) -> u64 {
        self.epochs
    }

    pub fn store(&self) -> &TermPageStore<T> {
        &self.store
    }

    pub fn run_epoch(&mut self, stop: &AtomicBool) -> Result<EpochOutcome, InferenceError> {
        let atoms = &self.atoms;
        let step_size = self.options.step_size;
        let mut epoch = self.store.open_epoch();
        let mut terms = 0;
        let mut objective = 0.0f64;
        let mut max_movement = 0.0f32;

        while let Some(slot) = epoch.next()? {
            if stop.load(Ordering::Acquire) {
                // The slot in hand is untouched; flush what this page already changed.
                epoch.close()?;
                return Ok(EpochOutcome::Stopped);
            }

            let term = slot.objective();
            let dot = term.dot(atoms);
            objective += term.evaluate(atoms) as f64;
            terms += 1;

            let active = !term.hinge || dot > 0.0;
            if active {
                let scale = if term.squared { 2.0 * dot } else { 1.0 };
                for (coefficient, atom) in term.coefficients.iter().zip(term.atoms.iter()) {
                    let current = atoms.value(*atom);
                    let gradient = term.weight * scale * coefficient;
                    let next = (current - step_size * gradient).clamp(0.0, 1.0);
                    if next != current && atoms.update_value(*atom, next) {
                        max_movement = max_movement.max((next - current).abs());
                    }
                }
            }
            slot.record_step(dot.max(0.0), step_size);
        }

        self.epochs += 1;
        let summary = EpochSummary {
            epoch: self.epochs,
            terms,
            objective,
            max_movement,
        };
        debug!(
            epoch = summary.epoch,
            terms,
            objective,
            max_movement,
            "epoch complete"
        );
        Ok(EpochOutcome::Completed(summary))
    }

    /// Runs one round: epochs until convergence, the epoch limit, or stop.
    pub fn run_round(&mut self, stop: &AtomicBool) -> Result<EpochOutcome, InferenceError> {
        let mut last = EpochOutcome::Stopped;
        for _ in 0..self.options.max_epochs_per_round {
            last = self.run_epoch(stop)?;
            match last {
                EpochOutcome::Stopped => return Ok(last),
                EpochOutcome::Completed(summary) if summary.max_movement <= self.options.tolerance => break,
                EpochOutcome::Completed(_) => {}
            }
        }
        Ok(last)
    }

    /// Optimizes until stopped, idling between rounds until the model changes.
    pub fn run(mut self, handle: ReasonerHandle, wake: Receiver<()>) -> Result<u64, InferenceError> {
        let stop = Arc::clone(&handle.stop);
        loop {
            if let EpochOutcome::Completed(summary) = self.run_round(&stop)? {
                info!(
                    epochs = self.epochs,
                    objective = summary.objective,
                    bytes_read = self.store.stats().bytes_read(),
                    "optimization round finished"
                );
            }
            if handle.is_stopped() {
                break;
            }
            if wake.recv().is_err() || handle.is_stopped() {
                break;
            }
        }
        info!(epochs = self.epochs, "reasoner stopped");
        Ok(self.epochs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom_table::AtomState;
    use crate::model::{AtomKey, Constant};
    use crate::page_store::{DiskStats, PageWriter, StoreOptions};
    use crate::term::{DcdTerm, ObjectiveTerm, SgdTerm};
    use tempfile::TempDir;

    fn table(states: &[AtomState]) -> Arc<AtomTable> {
        let mut table = AtomTable::new();
        for (i, state) in states.iter().enumerate() {
            table.insert(AtomKey::new(0, vec![Constant::Int(i as i64)]), *state).unwrap();
        }
        Arc::new(table)
    }

    // x0 -> x1: penalize x0 exceeding x1.
    fn implication(dir: &TempDir) -> TermPageStore<SgdTerm> {
        let mut writer = PageWriter::<SgdTerm>::create(dir.path(), 4, DiskStats::new()).unwrap();
        writer
            .push(SgdTerm::new(ObjectiveTerm::new(1.0, 0.0, false, true, &[(1.0, 0), (-1.0, 1)])))
            .unwrap();
        writer.finish().unwrap();
        TermPageStore::open(dir.path(), StoreOptions::default(), DiskStats::new()).unwrap()
    }

    #[test]
    fn test_epoch_moves_random_variables() {
        let dir = TempDir::new().unwrap();
        let atoms = table(&[AtomState::observed(1.0), AtomState::random_variable(0.0)]);
        let mut reasoner = Reasoner::new(implication(&dir), Arc::clone(&atoms), ReasonerOptions::default());

        let stop = AtomicBool::new(false);
        reasoner.run_round(&stop).unwrap();

        assert!(atoms.value(1) > 0.9, "x1 should be pulled up to x0, got {}", atoms.value(1));
        assert_eq!(atoms.state(0), AtomState::observed(1.0));
    }

    #[test]
    fn test_observed_atoms_are_never_updated() {
        let dir = TempDir::new().unwrap();
        let atoms = table(&[AtomState::observed(1.0), AtomState::observed(0.2)]);
        let mut reasoner = Reasoner::new(implication(&dir), Arc::clone(&atoms), ReasonerOptions::default());

        let stop = AtomicBool::new(false);
        match reasoner.run_epoch(&stop).unwrap() {
            EpochOutcome::Completed(summary) => {
                assert_eq!(summary.terms, 1);
                assert_eq!(summary.max_movement, 0.0);
                assert!((summary.objective - 0.8).abs() < 1e-6);
            }
            EpochOutcome::Stopped => panic!("not stopped"),
        }
        assert_eq!(atoms.state(1), AtomState::observed(0.2));
    }

    #[test]
    fn test_stop_ends_epoch() {
        let dir = TempDir::new().unwrap();
        let atoms = table(&[AtomState::random_variable(1.0), AtomState::random_variable(0.0)]);
        let mut reasoner = Reasoner::new(implication(&dir), Arc::clone(&atoms), ReasonerOptions::default());

        let stop = AtomicBool::new(true);
        assert_eq!(reasoner.run_epoch(&stop).unwrap(), EpochOutcome::Stopped);
        assert_eq!(reasoner.epochs(), 0);
    }

    #[test]
    fn test_run_returns_after_stop() {
        let dir = TempDir::new().unwrap();
        let atoms = table(&[AtomState::random_variable(1.0), AtomState::random_variable(0.0)]);
        let reasoner = Reasoner::new(implication(&dir), atoms, ReasonerOptions::default());
        let (handle, wake) = ReasonerHandle::channel();

        let worker = {
            let handle = handle.clone();
            std::thread::spawn(move || reasoner.run(handle, wake))
        };
        handle.notify();
        handle.stop();
        let epochs = worker.join().unwrap().unwrap();
        assert!(epochs <= 1 + ReasonerOptions::default().max_epochs_per_round as u64 * 2);
    }

    #[test]
    fn test_dcd_state_written_back() {
        let dir = TempDir::new().unwrap();
        let stats = DiskStats::new();
        let mut writer = PageWriter::<DcdTerm>::create(dir.path(), 4, Arc::clone(&stats)).unwrap();
        writer
            .push(DcdTerm::new(ObjectiveTerm::new(1.0, 0.0, false, true, &[(1.0, 0), (-1.0, 1)])))
            .unwrap();
        writer.finish().unwrap();

        let store = TermPageStore::<DcdTerm>::open(dir.path(), StoreOptions::default(), Arc::clone(&stats)).unwrap();
        let atoms = table(&[AtomState::observed(1.0), AtomState::observed(0.0)]);
        let mut reasoner = Reasoner::new(store, atoms, ReasonerOptions::default());

        let before = stats.bytes_written();
        reasoner.run_epoch(&AtomicBool::new(false)).unwrap();
        assert!(stats.bytes_written() > before);
    }
}
