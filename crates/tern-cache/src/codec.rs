//! Serialization of a constrained dataset into a cache entry body, and back.
//!
//! The body is the schema section (human-diagnosable text), a `--DATA:`
//! sentinel line, then each send-flagged variable's payload in declaration
//! order in the cache's binary format. The witness line above the body is
//! owned by the lookup layer.

use crate::error::{CacheError, Result};
use crate::marshal;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tern_dap::{schema, Dataset, Payload, Sequence, TypeFactory, Variable};

pub(crate) const DATA_MARK: &str = "--DATA:";

/// Builds replay sequences, so a rehydrated dataset serializes from its
/// in-memory row buffer and never re-opens the original data source.
struct CachedSequenceFactory;

impl TypeFactory for CachedSequenceFactory {
    fn make_sequence(&self, name: &str, columns: Vec<Variable>) -> Variable {
        Variable::new(name, Payload::Sequence(Sequence::new_replay(columns)))
    }
}

/// Write the schema section, the data boundary, and the typed payloads of
/// every send-flagged variable. The caller flushes and closes the sink
/// before releasing any locks.
pub fn write_body(w: &mut impl Write, dataset: &Dataset) -> Result<()> {
    let schema_text = schema::print_dataset(dataset, true);
    w.write_all(schema_text.as_bytes())?;
    writeln!(w, "{DATA_MARK}")?;
    for variable in dataset.variables().iter().filter(|v| v.send()) {
        marshal::write_value(w, variable.payload())?;
    }
    Ok(())
}

/// Rehydrate a dataset from a source positioned just past the witness line.
///
/// Every variable comes back marked read and send, with sequence row cursors
/// reset to zero so the caller's serialization starts from row 0.
pub fn read_body(r: &mut impl BufRead, path: &Path) -> Result<Dataset> {
    let mut schema_text = String::new();
    loop {
        let mut line = String::new();
        let n = r.read_line(&mut line).map_err(|err| corrupt(path, err))?;
        if n == 0 {
            return Err(CacheError::Corrupt {
                path: path.to_path_buf(),
                reason: "data boundary missing".into(),
            });
        }
        if line.trim_end_matches(['\n', '\r']) == DATA_MARK {
            break;
        }
        schema_text.push_str(&line);
    }

    let mut dataset = schema::parse_dataset(&schema_text, &CachedSequenceFactory)?;
    for variable in dataset.variables_mut() {
        let filled =
            marshal::read_value(r, variable.payload()).map_err(|err| corrupt(path, err))?;
        *variable.payload_mut() = filled;
        variable.set_read(true);
        variable.set_send(true);
        variable.reset_row_numbers();
    }
    Ok(dataset)
}

fn corrupt(path: &Path, err: io::Error) -> CacheError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
        _ => CacheError::Io(err),
    }
}
