use crate::error::{DapError, Result};

/// The scalar kinds a variable payload can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
    Str,
    Url,
}

impl ScalarKind {
    /// The schema element name for this kind.
    pub fn element_name(self) -> &'static str {
        match self {
            ScalarKind::Byte => "Byte",
            ScalarKind::Int16 => "Int16",
            ScalarKind::UInt16 => "UInt16",
            ScalarKind::Int32 => "Int32",
            ScalarKind::UInt32 => "UInt32",
            ScalarKind::Float32 => "Float32",
            ScalarKind::Float64 => "Float64",
            ScalarKind::Str => "String",
            ScalarKind::Url => "Url",
        }
    }

    pub fn from_element_name(name: &str) -> Option<Self> {
        Some(match name {
            "Byte" => ScalarKind::Byte,
            "Int16" => ScalarKind::Int16,
            "UInt16" => ScalarKind::UInt16,
            "Int32" => ScalarKind::Int32,
            "UInt32" => ScalarKind::UInt32,
            "Float32" => ScalarKind::Float32,
            "Float64" => ScalarKind::Float64,
            "String" => ScalarKind::Str,
            "Url" => ScalarKind::Url,
            _ => return None,
        })
    }

    /// A zero/empty value of this kind, used for schema-only variables whose
    /// payload has not been read yet.
    pub fn default_value(self) -> ScalarValue {
        match self {
            ScalarKind::Byte => ScalarValue::Byte(0),
            ScalarKind::Int16 => ScalarValue::Int16(0),
            ScalarKind::UInt16 => ScalarValue::UInt16(0),
            ScalarKind::Int32 => ScalarValue::Int32(0),
            ScalarKind::UInt32 => ScalarValue::UInt32(0),
            ScalarKind::Float32 => ScalarValue::Float32(0.0),
            ScalarKind::Float64 => ScalarValue::Float64(0.0),
            ScalarKind::Str => ScalarValue::Str(String::new()),
            ScalarKind::Url => ScalarValue::Url(String::new()),
        }
    }
}

/// One scalar value.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float32(f32),
    Float64(f64),
    Str(String),
    Url(String),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::Byte(_) => ScalarKind::Byte,
            ScalarValue::Int16(_) => ScalarKind::Int16,
            ScalarValue::UInt16(_) => ScalarKind::UInt16,
            ScalarValue::Int32(_) => ScalarKind::Int32,
            ScalarValue::UInt32(_) => ScalarKind::UInt32,
            ScalarValue::Float32(_) => ScalarKind::Float32,
            ScalarValue::Float64(_) => ScalarKind::Float64,
            ScalarValue::Str(_) => ScalarKind::Str,
            ScalarValue::Url(_) => ScalarKind::Url,
        }
    }
}

/// A named array dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dim {
    pub name: String,
    pub size: usize,
}

impl Dim {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self { name: name.into(), size }
    }
}

/// A multi-dimensional array of scalars, stored flat in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    pub element: ScalarKind,
    pub dims: Vec<Dim>,
    pub values: Vec<ScalarValue>,
}

impl Array {
    pub fn new(element: ScalarKind, dims: Vec<Dim>) -> Self {
        Self { element, dims, values: Vec::new() }
    }

    /// Number of elements the declared dimensions call for.
    pub fn declared_len(&self) -> usize {
        self.dims.iter().map(|d| d.size).product()
    }
}

/// A variable whose values are rows delivered lazily by a data handler.
///
/// Rows produced so far are buffered in memory. `row_cursor` tracks how many
/// rows have already been consumed: deserialization advances it as a side
/// effect, and serialization starts emitting at the cursor, so a rehydrated
/// sequence must have its cursor reset before it can be serialized again.
#[derive(Clone, Debug)]
pub struct Sequence {
    columns: Vec<Variable>,
    rows: Vec<Vec<Payload>>,
    row_cursor: usize,
    replay: bool,
}

impl Sequence {
    /// A query-mode sequence: rows are produced by the owning data handler.
    pub fn new(columns: Vec<Variable>) -> Self {
        Self { columns, rows: Vec::new(), row_cursor: 0, replay: false }
    }

    /// A replay sequence: rows come from an in-memory buffer filled by
    /// deserialization, never from the original data source.
    pub fn new_replay(columns: Vec<Variable>) -> Self {
        Self { columns, rows: Vec::new(), row_cursor: 0, replay: true }
    }

    pub fn columns(&self) -> &[Variable] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [Variable] {
        &mut self.columns
    }

    pub fn rows(&self) -> &[Vec<Payload>] {
        &self.rows
    }

    /// Rows not yet consumed; serialization emits exactly these.
    pub fn unsent_rows(&self) -> &[Vec<Payload>] {
        &self.rows[self.row_cursor.min(self.rows.len())..]
    }

    pub fn row_cursor(&self) -> usize {
        self.row_cursor
    }

    pub fn is_replay(&self) -> bool {
        self.replay
    }

    pub fn push_row(&mut self, row: Vec<Payload>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(DapError::RowArity { expected: self.columns.len(), found: row.len() });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Mark one buffered row as consumed.
    pub fn advance_row(&mut self) {
        self.row_cursor = (self.row_cursor + 1).min(self.rows.len());
    }

    /// Reset the row cursor to zero. When `recursive`, nested sequences in
    /// both the column prototypes and the buffered rows are reset too.
    pub fn reset_row_number(&mut self, recursive: bool) {
        self.row_cursor = 0;
        if !recursive {
            return;
        }
        for column in &mut self.columns {
            column.reset_row_numbers();
        }
        for row in &mut self.rows {
            for payload in row {
                payload.reset_row_numbers();
            }
        }
    }
}

// The replay flag records provenance; it does not participate in equality.
impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
            && self.rows == other.rows
            && self.row_cursor == other.row_cursor
    }
}

/// The value a variable carries.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Scalar(ScalarValue),
    Array(Array),
    Structure(Vec<Variable>),
    Sequence(Sequence),
}

impl Payload {
    /// The schema element name for this payload.
    pub fn element_name(&self) -> &'static str {
        match self {
            Payload::Scalar(value) => value.kind().element_name(),
            Payload::Array(_) => "Array",
            Payload::Structure(_) => "Structure",
            Payload::Sequence(_) => "Sequence",
        }
    }

    fn reset_row_numbers(&mut self) {
        match self {
            Payload::Scalar(_) | Payload::Array(_) => {}
            Payload::Structure(fields) => {
                for field in fields {
                    field.reset_row_numbers();
                }
            }
            Payload::Sequence(seq) => seq.reset_row_number(true),
        }
    }
}

/// One node of the dataset tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    name: String,
    payload: Payload,
    read: bool,
    send: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self { name: name.into(), payload, read: false, send: false }
    }

    pub fn scalar(name: impl Into<String>, value: ScalarValue) -> Self {
        Self::new(name, Payload::Scalar(value))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn read(&self) -> bool {
        self.read
    }

    pub fn send(&self) -> bool {
        self.send
    }

    pub fn set_read(&mut self, read: bool) {
        self.read = read;
    }

    pub fn set_send(&mut self, send: bool) {
        self.send = send;
    }

    /// Recursively reset the row cursor of every sequence under this variable.
    pub fn reset_row_numbers(&mut self) {
        self.payload.reset_row_numbers();
    }
}

/// An in-memory tree of typed variables, identified by the name of the data
/// source it was built from.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Dataset {
    name: String,
    variables: Vec<Variable>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), variables: Vec::new() }
    }

    /// The dataset identifier, typically the source filename.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Append a variable, preserving declaration order.
    pub fn add_var(&mut self, variable: Variable) {
        self.variables.push(variable);
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut [Variable] {
        &mut self.variables
    }

    pub fn mark_all_send(&mut self) {
        for variable in &mut self.variables {
            variable.set_send(true);
        }
    }
}
