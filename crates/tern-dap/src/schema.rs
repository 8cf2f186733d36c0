//! The XML-ish schema document describing a dataset's variables and types.
//!
//! The printer emits one element per variable (`<Float64 name="x"/>`,
//! `<Array>`, `<Structure>`, `<Sequence>`) under a `<Dataset>` root. The
//! parser rebuilds an empty dataset from that text; payload values are
//! carried separately, in the cache's data section.

use crate::dataset::{Array, Dataset, Dim, Payload, ScalarKind, Sequence, Variable};
use crate::error::{DapError, Result};

const INDENT: &str = "    ";

/// Controls how variables are constructed while parsing a schema.
///
/// Most kinds use the one obvious constructor; sequences are pluggable so a
/// reader can substitute replay sequences whose serialization walks an
/// in-memory row buffer instead of re-executing a query.
pub trait TypeFactory {
    fn make_sequence(&self, name: &str, columns: Vec<Variable>) -> Variable;
}

/// Builds query-mode sequences, as the server's data handlers expect.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFactory;

impl TypeFactory for DefaultFactory {
    fn make_sequence(&self, name: &str, columns: Vec<Variable>) -> Variable {
        Variable::new(name, Payload::Sequence(Sequence::new(columns)))
    }
}

/// Print the schema document for `dataset`, terminated by a newline.
///
/// With `constrained` set, only variables whose send flag is set are printed;
/// members of a printed variable always follow their parent.
pub fn print_dataset(dataset: &Dataset, constrained: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!("<Dataset name=\"{}\">\n", escape(dataset.name())));
    for variable in dataset.variables() {
        if constrained && !variable.send() {
            continue;
        }
        print_variable(&mut out, variable, 1);
    }
    out.push_str("</Dataset>\n");
    out
}

fn print_variable(out: &mut String, variable: &Variable, depth: usize) {
    let pad = INDENT.repeat(depth);
    let name = escape(variable.name());
    match variable.payload() {
        Payload::Scalar(value) => {
            out.push_str(&format!("{pad}<{} name=\"{name}\"/>\n", value.kind().element_name()));
        }
        Payload::Array(array) => {
            out.push_str(&format!("{pad}<Array name=\"{name}\">\n"));
            out.push_str(&format!("{pad}{INDENT}<{}/>\n", array.element.element_name()));
            for dim in &array.dims {
                out.push_str(&format!(
                    "{pad}{INDENT}<dimension name=\"{}\" size=\"{}\"/>\n",
                    escape(&dim.name),
                    dim.size
                ));
            }
            out.push_str(&format!("{pad}</Array>\n"));
        }
        Payload::Structure(fields) => {
            out.push_str(&format!("{pad}<Structure name=\"{name}\">\n"));
            for field in fields {
                print_variable(out, field, depth + 1);
            }
            out.push_str(&format!("{pad}</Structure>\n"));
        }
        Payload::Sequence(seq) => {
            out.push_str(&format!("{pad}<Sequence name=\"{name}\">\n"));
            for column in seq.columns() {
                print_variable(out, column, depth + 1);
            }
            out.push_str(&format!("{pad}</Sequence>\n"));
        }
    }
}

/// Parse a schema document into an empty dataset.
///
/// Scalar payloads get zero/empty values, arrays get declared dimensions with
/// no elements, and sequences get no rows; data arrives separately.
pub fn parse_dataset(text: &str, factory: &dyn TypeFactory) -> Result<Dataset> {
    let doc = roxmltree::Document::parse(text)?;
    let root = doc.root_element();
    if root.tag_name().name() != "Dataset" {
        return Err(DapError::Schema(format!(
            "expected Dataset root element, found '{}'",
            root.tag_name().name()
        )));
    }
    let name = root
        .attribute("name")
        .ok_or_else(|| DapError::Schema("Dataset element is missing a name".into()))?;

    let mut dataset = Dataset::new(name);
    for node in root.children().filter(|n| n.is_element()) {
        dataset.add_var(parse_variable(node, factory)?);
    }
    Ok(dataset)
}

fn parse_variable(node: roxmltree::Node<'_, '_>, factory: &dyn TypeFactory) -> Result<Variable> {
    let tag = node.tag_name().name();
    let name = required_name(node)?;

    if let Some(kind) = ScalarKind::from_element_name(tag) {
        return Ok(Variable::new(name, Payload::Scalar(kind.default_value())));
    }

    match tag {
        "Array" => {
            let mut element = None;
            let mut dims = Vec::new();
            for child in node.children().filter(|n| n.is_element()) {
                let child_tag = child.tag_name().name();
                if child_tag == "dimension" {
                    dims.push(parse_dimension(child)?);
                } else if let Some(kind) = ScalarKind::from_element_name(child_tag) {
                    element = Some(kind);
                } else {
                    return Err(DapError::Schema(format!(
                        "unexpected element '{child_tag}' in Array '{name}'"
                    )));
                }
            }
            let element = element.ok_or_else(|| {
                DapError::Schema(format!("Array '{name}' has no element type"))
            })?;
            Ok(Variable::new(name, Payload::Array(Array::new(element, dims))))
        }
        "Structure" => {
            let mut fields = Vec::new();
            for child in node.children().filter(|n| n.is_element()) {
                fields.push(parse_variable(child, factory)?);
            }
            Ok(Variable::new(name, Payload::Structure(fields)))
        }
        "Sequence" => {
            let mut columns = Vec::new();
            for child in node.children().filter(|n| n.is_element()) {
                columns.push(parse_variable(child, factory)?);
            }
            Ok(factory.make_sequence(&name, columns))
        }
        other => Err(DapError::Schema(format!("unknown element '{other}'"))),
    }
}

fn parse_dimension(node: roxmltree::Node<'_, '_>) -> Result<Dim> {
    let name = required_name(node)?;
    let size = node
        .attribute("size")
        .ok_or_else(|| DapError::Schema(format!("dimension '{name}' is missing a size")))?;
    let size = size
        .parse::<usize>()
        .map_err(|_| DapError::Schema(format!("dimension '{name}' has invalid size '{size}'")))?;
    Ok(Dim::new(name, size))
}

fn required_name(node: roxmltree::Node<'_, '_>) -> Result<String> {
    node.attribute("name").map(str::to_owned).ok_or_else(|| {
        DapError::Schema(format!("{} element is missing a name", node.tag_name().name()))
    })
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
