//! Line-oriented action and response encoding.
//!
//! Every action is one line of tab separated fields, the first being the
//! verb. Every response is one line as well, correlated with its action by
//! the per-connection sequence number.

use crate::atom_table::AtomStatus;
use crate::error::{InferenceError, ParseError};
use crate::model::{AtomKey, Constant, PredicateCatalog, PredicateKind};
use std::fmt;

pub const STOPPED_MESSAGE: &str = "Online inference stopped.";

/// A ground atom named by predicate and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomRef {
    pub predicate: String,
    pub arguments: Vec<Constant>,
}

impl AtomRef {
    pub fn new(predicate: &str, arguments: Vec<Constant>) -> Self {
        AtomRef {
            predicate: predicate.to_string(),
            arguments,
        }
    }

    pub fn to_key(&self, catalog: &PredicateCatalog) -> Option<AtomKey> {
        let (id, _) = catalog.lookup(&self.predicate)?;
        Some(AtomKey::new(id, self.arguments.clone()))
    }

    fn parse(line: &str, fields: &[&str], catalog: &PredicateCatalog) -> Result<Self, ParseError> {
        let Some((name, args)) = fields.split_first() else {
            return Err(ParseError::new(line, "Missing predicate name"));
        };
        let Some((_, predicate)) = catalog.lookup(name) else {
            return Err(ParseError::new(line, format!("Unknown predicate: {}", name)));
        };
        if predicate.kind != PredicateKind::Standard {
            return Err(ParseError::new(
                line,
                format!("Predicate is not a standard predicate: {}", predicate.name),
            ));
        }
        if args.len() != predicate.arity() {
            return Err(ParseError::new(
                line,
                format!(
                    "Predicate {} takes {} arguments, got {}",
                    predicate.name,
                    predicate.arity(),
                    args.len()
                ),
            ));
        }

        let arguments = predicate
            .arg_types
            .iter()
            .zip(args.iter())
            .enumerate()
            .map(|(i, (arg_type, token))| {
                arg_type
                    .parse(token)
                    .map_err(|reason| ParseError::new(line, format!("Argument {}: {}", i, reason)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AtomRef {
            predicate: predicate.name.clone(),
            arguments,
        })
    }
}

impl fmt::Display for AtomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.predicate)?;
        for arg in &self.arguments {
            write!(f, "\t{}", arg)?;
        }
        Ok(())
    }
}

/// Everything a client can ask of a session. Adding a verb means adding a
/// variant here together with its arms in `parse` and `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Turn a random variable into an observation at its current value.
    FixAtom(AtomRef),
    /// Report an atom's current status and value.
    QueryAtom(AtomRef),
    /// End the session.
    Stop,
    /// Close only the sending connection.
    Exit,
}

impl Action {
    pub fn verb(&self) -> &'static str {
        match self {
            Action::FixAtom(_) => "FIXATOM",
            Action::QueryAtom(_) => "QUERYATOM",
            Action::Stop => "STOP",
            Action::Exit => "EXIT",
        }
    }

    pub fn parse(line: &str, catalog: &PredicateCatalog) -> Result<Action, ParseError> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = trimmed.split('\t').collect();
        let verb = fields[0].trim();
        if verb.is_empty() {
            return Err(ParseError::new(trimmed, "Empty command"));
        }

        match verb.to_ascii_uppercase().as_str() {
            "FIXATOM" => Ok(Action::FixAtom(AtomRef::parse(trimmed, &fields[1..], catalog)?)),
            "QUERYATOM" => Ok(Action::QueryAtom(AtomRef::parse(trimmed, &fields[1..], catalog)?)),
            "STOP" | "EXIT" if fields.len() > 1 => Err(ParseError::new(
                trimmed,
                format!("{} takes no arguments", verb.to_ascii_uppercase()),
            )),
            "STOP" => Ok(Action::Stop),
            "EXIT" => Ok(Action::Exit),
            _ => Err(ParseError::new(trimmed, format!("Unknown action: {}", verb))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::FixAtom(atom) | Action::QueryAtom(atom) => write!(f, "{}\t{}", self.verb(), atom),
            Action::Stop | Action::Exit => write!(f, "{}", self.verb()),
        }
    }
}

fn status_name(status: AtomStatus) -> &'static str {
    match status {
        AtomStatus::RandomVariable => "RandomVariable",
        AtomStatus::Observed => "Observed",
    }
}

/// The single reply to one action.
#[derive(Debug, Clone, PartialEq)]
pub enum OnlineResponse {
    ActionStatus {
        id: u64,
        success: bool,
        message: String,
    },
    QueryResult {
        id: u64,
        atom: String,
        status: AtomStatus,
        value: f32,
    },
}

impl OnlineResponse {
    pub fn success(id: u64, message: impl Into<String>) -> Self {
        OnlineResponse::ActionStatus {
            id,
            success: true,
            message: single_line(message.into()),
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        OnlineResponse::ActionStatus {
            id,
            success: false,
            message: single_line(message.into()),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            OnlineResponse::ActionStatus { id, .. } | OnlineResponse::QueryResult { id, .. } => *id,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            OnlineResponse::ActionStatus { success, .. } => *success,
            OnlineResponse::QueryResult { .. } => true,
        }
    }

    pub fn parse(line: &str) -> Result<Self, InferenceError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let bad = || InferenceError::Protocol(format!("Malformed response: {}", line.escape_default()));

        let (kind, rest) = line.split_once('\t').ok_or_else(bad)?;
        match kind {
            "ACTIONSTATUS" => {
                let mut fields = rest.splitn(3, '\t');
                let id = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
                let success = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
                let message = fields.next().unwrap_or_default().to_string();
                Ok(OnlineResponse::ActionStatus { id, success, message })
            }
            "QUERYRESULT" => {
                let fields: Vec<&str> = rest.split('\t').collect();
                let [id, atom, status, value] = fields.as_slice() else {
                    return Err(bad());
                };
                let status = match *status {
                    "RandomVariable" => AtomStatus::RandomVariable,
                    "Observed" => AtomStatus::Observed,
                    _ => return Err(bad()),
                };
                Ok(OnlineResponse::QueryResult {
                    id: id.parse().map_err(|_| bad())?,
                    atom: atom.to_string(),
                    status,
                    value: value.parse().map_err(|_| bad())?,
                })
            }
            _ => Err(bad()),
        }
    }
}

fn single_line(message: String) -> String {
    if message.contains(['\n', '\r']) {
        message.replace(['\n', '\r'], " ")
    } else {
        message
    }
}

impl fmt::Display for OnlineResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnlineResponse::ActionStatus { id, success, message } => {
                write!(f, "ACTIONSTATUS\t{}\t{}\t{}", id, success, message)
            }
            OnlineResponse::QueryResult { id, atom, status, value } => {
                write!(f, "QUERYRESULT\t{}\t{}\t{}\t{}", id, atom, status_name(*status), value)
            }
        }
    }
}
