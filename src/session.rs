use crate::InferenceError;
use crate::atom_table::{AtomState, AtomTable};
use crate::error::AtomStateError;
use crate::ground_model::write_inferred_predicates;
use crate::model::PredicateCatalog;
use crate::protocol::{Action, AtomRef, OnlineResponse, STOPPED_MESSAGE};
use crate::reasoner::ReasonerHandle;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// What the connection should do after delivering a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    CloseConnection,
    StopSession,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub response: OnlineResponse,
    pub control: Control,
}

/// Shared state of one running inference.
///
/// Connection handlers call [`OnlineSession::submit_action`]; the reasoner
/// reads the same [`AtomTable`]. No disk I/O happens here.
pub struct OnlineSession {
    catalog: Arc<PredicateCatalog>,
    atoms: Arc<AtomTable>,
    reasoner: ReasonerHandle,
    shutdown: watch::Sender<bool>,
}

impl OnlineSession {
    pub fn new(catalog: Arc<PredicateCatalog>, atoms: Arc<AtomTable>, reasoner: ReasonerHandle) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            catalog,
            atoms,
            reasoner,
            shutdown,
        }
    }

    pub fn catalog(&self) -> &Arc<PredicateCatalog> {
        &self.catalog
    }

    pub fn atoms(&self) -> &Arc<AtomTable> {
        &self.atoms
    }

    /// Current `(status, value)` of an atom, as the optimizer sees it.
    pub fn atom_state(&self, atom: &AtomRef) -> Option<AtomState> {
        let key = atom.to_key(&self.catalog)?;
        self.atoms.lookup(&key).map(|slot| self.atoms.state(slot))
    }

    /// Parses and applies one action line. Parse and atom errors come back as
    /// failed responses; nothing here is fatal.
    pub fn submit_action(&self, id: u64, line: &str) -> Submission {
        match Action::parse(line, &self.catalog) {
            Ok(action) => self.apply(id, &action),
            Err(e) => {
                debug!(id, error = %e, "rejected action");
                Submission {
                    response: OnlineResponse::failure(id, e.to_string()),
                    control: Control::Continue,
                }
            }
        }
    }

    pub fn apply(&self, id: u64, action: &Action) -> Submission {
        let continue_with = |response| Submission {
            response,
            control: Control::Continue,
        };

        match action {
            Action::FixAtom(atom) => match self.fix_atom(atom) {
                Ok(state) => {
                    self.reasoner.notify();
                    info!(id, atom = %atom, value = state.value, "fixed atom");
                    continue_with(OnlineResponse::success(
                        id,
                        format!("Fixed atom {} at {}.", self.describe(atom), state.value),
                    ))
                }
                Err(e) => continue_with(OnlineResponse::failure(id, e.to_string())),
            },
            Action::QueryAtom(atom) => match self.resolve(atom) {
                Ok(slot) => {
                    let state = self.atoms.state(slot);
                    continue_with(OnlineResponse::QueryResult {
                        id,
                        atom: self.describe(atom),
                        status: state.status,
                        value: state.value,
                    })
                }
                Err(e) => continue_with(OnlineResponse::failure(id, e.to_string())),
            },
            Action::Exit => Submission {
                response: OnlineResponse::success(id, "Connection closed."),
                control: Control::CloseConnection,
            },
            Action::Stop => {
                self.stop();
                Submission {
                    response: OnlineResponse::success(id, STOPPED_MESSAGE),
                    control: Control::StopSession,
                }
            }
        }
    }

    fn resolve(&self, atom: &AtomRef) -> Result<u32, AtomStateError> {
        atom.to_key(&self.catalog)
            .and_then(|key| self.atoms.lookup(&key))
            .ok_or_else(|| AtomStateError::UnknownAtom(self.describe(atom)))
    }

    fn fix_atom(&self, atom: &AtomRef) -> Result<AtomState, AtomStateError> {
        let slot = self.resolve(atom)?;
        self.atoms.fix(slot, &self.catalog)
    }

    fn describe(&self, atom: &AtomRef) -> String {
        format!("{}({})", atom.predicate, itertools::join(&atom.arguments, ", "))
    }

    /// Signals connection handlers and the reasoner to wind down.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("session stopping");
        }
        self.reasoner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn write_inferred_predicates(&self, output_dir: &Path) -> Result<usize, InferenceError> {
        write_inferred_predicates(output_dir, &self.catalog, &self.atoms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom_table::AtomStatus;
    use crate::model::{ArgType, AtomKey, Constant, Predicate};

    fn session() -> OnlineSession {
        let catalog = PredicateCatalog::from_predicates(vec![
            Predicate::standard("Knows", vec![ArgType::UniqueStringId, ArgType::UniqueStringId]),
            Predicate::standard("Lived", vec![ArgType::UniqueStringId, ArgType::String]),
        ])
        .unwrap();
        let mut atoms = AtomTable::new();
        atoms
            .insert(
                AtomKey::new(0, vec![Constant::Str("Alice".into()), Constant::Str("Bob".into())]),
                AtomState::random_variable(0.73),
            )
            .unwrap();
        atoms
            .insert(
                AtomKey::new(1, vec![Constant::Str("Alice".into()), Constant::Str("Paris".into())]),
                AtomState::observed(1.0),
            )
            .unwrap();
        let (handle, _wake) = ReasonerHandle::channel();
        OnlineSession::new(Arc::new(catalog), Arc::new(atoms), handle)
    }

    #[test]
    fn test_fix_atom_freezes_current_value() {
        let session = session();
        let submission = session.submit_action(0, "FIXATOM\tKnows\tAlice\tBob");

        assert!(submission.response.is_success(), "{}", submission.response);
        assert_eq!(submission.control, Control::Continue);
        let atom = AtomRef::new("Knows", vec![Constant::Str("Alice".into()), Constant::Str("Bob".into())]);
        assert_eq!(session.atom_state(&atom), Some(AtomState::observed(0.73)));
    }

    #[test]
    fn test_fix_observed_atom_fails_without_change() {
        let session = session();
        let before = session.atoms().records();

        let submission = session.submit_action(4, "FIXATOM\tLived\tAlice\tParis");
        assert!(!submission.response.is_success());
        assert_eq!(submission.response.id(), 4);
        assert_eq!(session.atoms().records(), before);
    }

    #[test]
    fn test_fix_twice() {
        let session = session();
        assert!(session.submit_action(0, "FIXATOM\tKnows\tAlice\tBob").response.is_success());
        let before = session.atoms().records();
        assert!(!session.submit_action(1, "FIXATOM\tKnows\tAlice\tBob").response.is_success());
        assert_eq!(session.atoms().records(), before);
    }

    #[test]
    fn test_unknown_ground_atom() {
        let session = session();
        let before = session.atoms().records();
        let submission = session.submit_action(0, "FIXATOM\tKnows\tBob\tZed");
        match submission.response {
            OnlineResponse::ActionStatus { success, message, .. } => {
                assert!(!success);
                assert!(message.contains("does not exist"));
            }
            other => panic!("unexpected response {}", other),
        }
        assert_eq!(session.atoms().records(), before);
    }

    #[test]
    fn test_parse_error_response() {
        let session = session();
        let before = session.atoms().records();
        let submission = session.submit_action(2, "FIXATOM\tUnknownPred\tX");
        assert!(submission.response.to_string().contains("Error parsing command"));
        assert_eq!(submission.control, Control::Continue);
        assert_eq!(session.atoms().records(), before);
    }

    #[test]
    fn test_query_atom() {
        let session = session();
        let submission = session.submit_action(7, "QUERYATOM\tKnows\tAlice\tBob");
        assert_eq!(
            submission.response,
            OnlineResponse::QueryResult {
                id: 7,
                atom: "Knows(Alice, Bob)".into(),
                status: AtomStatus::RandomVariable,
                value: 0.73,
            }
        );
    }

    #[test]
    fn test_stop_and_exit_controls() {
        let session = session();
        let mut shutdown = session.subscribe();

        let exit = session.submit_action(0, "EXIT");
        assert_eq!(exit.control, Control::CloseConnection);
        assert!(!session.is_stopped());

        let stop = session.submit_action(1, "STOP");
        assert_eq!(stop.control, Control::StopSession);
        assert!(stop.response.to_string().contains(STOPPED_MESSAGE));
        assert!(session.is_stopped());
        assert!(shutdown.has_changed().unwrap());
    }
}
