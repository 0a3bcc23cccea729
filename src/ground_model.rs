use crate::InferenceError;
use crate::atom_table::{AtomRecord, AtomStatus, AtomTable};
use crate::model::{Predicate, PredicateCatalog, PredicateKind};
use bincode::{Decode, Encode};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const MODEL_FILE: &str = "model.bin";

/// Predicates and ground atoms handed over by grounding, stored next to the
/// term pages they index into.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct GroundModel {
    pub predicates: Vec<Predicate>,
    pub atoms: Vec<AtomRecord>,
}

impl GroundModel {
    pub fn path(cache_dir: &Path) -> PathBuf {
        cache_dir.join(MODEL_FILE)
    }

    pub fn save(&self, cache_dir: &Path) -> Result<(), InferenceError> {
        fs::create_dir_all(cache_dir)?;
        let bytes = bincode::encode_to_vec(self, bincode::config::standard())?;
        fs::write(Self::path(cache_dir), bytes)?;
        Ok(())
    }

    pub fn load(cache_dir: &Path) -> Result<Self, InferenceError> {
        let path = Self::path(cache_dir);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => InferenceError::MissingPage(path.clone()),
            _ => InferenceError::Io(e),
        })?;
        let (model, _): (GroundModel, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(model)
    }

    /// Builds the catalog and atom table, checking every atom against its predicate.
    pub fn into_parts(self) -> Result<(PredicateCatalog, AtomTable), InferenceError> {
        let catalog = PredicateCatalog::from_predicates(self.predicates).map_err(InferenceError::Other)?;

        for record in &self.atoms {
            let predicate = catalog
                .predicates()
                .get(record.key.predicate as usize)
                .ok_or_else(|| format!("Atom refers to unknown predicate id {}", record.key.predicate))?;
            if predicate.kind != PredicateKind::Standard {
                return Err(InferenceError::Other(format!(
                    "Derived predicate {} cannot have stored atoms",
                    predicate.name
                )));
            }
            let well_typed = predicate.arity() == record.key.arguments.len()
                && predicate
                    .arg_types
                    .iter()
                    .zip(&record.key.arguments)
                    .all(|(t, c)| t.accepts(c));
            if !well_typed {
                return Err(InferenceError::Other(format!(
                    "Atom does not match predicate {}: {:?}",
                    predicate.name, record.key.arguments
                )));
            }
        }

        let atoms = AtomTable::from_records(self.atoms).map_err(InferenceError::Other)?;
        info!(predicates = catalog.len(), atoms = atoms.len(), "ground model loaded");
        Ok((catalog, atoms))
    }
}

/// Writes `<predicate>.txt` for each standard predicate: one line per random
/// variable atom, arguments then value, tab separated.
pub fn write_inferred_predicates(
    output_dir: &Path,
    catalog: &PredicateCatalog,
    atoms: &AtomTable,
) -> Result<usize, InferenceError> {
    fs::create_dir_all(output_dir)?;

    let mut writers = Vec::with_capacity(catalog.len());
    for predicate in catalog.predicates() {
        if predicate.kind == PredicateKind::Standard {
            let path = output_dir.join(format!("{}.txt", predicate.name));
            writers.push(Some(BufWriter::new(fs::File::create(path)?)));
        } else {
            writers.push(None);
        }
    }

    let mut written = 0;
    for slot in 0..atoms.len() as u32 {
        let state = atoms.state(slot);
        if state.status != AtomStatus::RandomVariable {
            continue;
        }
        let key = atoms.key(slot);
        if let Some(writer) = writers[key.predicate as usize].as_mut() {
            writeln!(writer, "{}\t{}", itertools::join(&key.arguments, "\t"), state.value)?;
            written += 1;
        }
    }

    for writer in writers.iter_mut().flatten() {
        writer.flush()?;
    }
    info!(dir = %output_dir.display(), atoms = written, "wrote inferred predicates");
    Ok(written)
}
