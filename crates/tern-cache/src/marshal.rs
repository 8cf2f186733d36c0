//! The cache's binary encoding for variable payloads.
//!
//! Byte-deterministic for a given input and host byte order; cross-host
//! portability is not a goal. Scalars are fixed-width native-endian bytes,
//! strings carry a `u64` byte-length prefix, arrays a `u64` element count,
//! and sequences a `u64` row count. Structures are their fields in order with
//! no framing.

use std::io::{self, Read, Write};
use tern_dap::{Array, Payload, ScalarKind, ScalarValue, Sequence, Variable};

pub fn write_value(w: &mut impl Write, payload: &Payload) -> io::Result<()> {
    match payload {
        Payload::Scalar(value) => write_scalar(w, value),
        Payload::Array(array) => {
            write_len(w, array.values.len())?;
            for value in &array.values {
                if value.kind() != array.element {
                    return Err(invalid(format!(
                        "array element kind {:?} does not match declared {:?}",
                        value.kind(),
                        array.element
                    )));
                }
                write_scalar(w, value)?;
            }
            Ok(())
        }
        Payload::Structure(fields) => {
            for field in fields {
                write_value(w, field.payload())?;
            }
            Ok(())
        }
        Payload::Sequence(seq) => {
            // Emission starts at the row cursor: rows already consumed by an
            // earlier serialization are gone. Freshly evaluated datasets have
            // a zero cursor and emit everything.
            let rows = seq.unsent_rows();
            write_len(w, rows.len())?;
            for row in rows {
                for payload in row {
                    write_value(w, payload)?;
                }
            }
            Ok(())
        }
    }
}

/// Read one payload shaped like `prototype`, returning the filled-in value.
///
/// Reading a sequence advances its row cursor past every buffered row, as a
/// side effect of consuming the stream; callers that intend to serialize the
/// result again must reset cursors first.
pub fn read_value(r: &mut impl Read, prototype: &Payload) -> io::Result<Payload> {
    match prototype {
        Payload::Scalar(value) => Ok(Payload::Scalar(read_scalar(r, value.kind())?)),
        Payload::Array(array) => {
            let count = read_len(r)?;
            let declared = array.declared_len();
            if declared != 0 && count != declared {
                return Err(invalid(format!(
                    "array carries {count} elements but declares {declared}"
                )));
            }
            let mut values = Vec::with_capacity(count.min(MAX_PREALLOC));
            for _ in 0..count {
                values.push(read_scalar(r, array.element)?);
            }
            Ok(Payload::Array(Array {
                element: array.element,
                dims: array.dims.clone(),
                values,
            }))
        }
        Payload::Structure(fields) => {
            let mut filled = Vec::with_capacity(fields.len());
            for field in fields {
                let payload = read_value(r, field.payload())?;
                filled.push(rebuild(field, payload));
            }
            Ok(Payload::Structure(filled))
        }
        Payload::Sequence(seq) => {
            let count = read_len(r)?;
            let mut filled = if seq.is_replay() {
                Sequence::new_replay(seq.columns().to_vec())
            } else {
                Sequence::new(seq.columns().to_vec())
            };
            for _ in 0..count {
                let mut row = Vec::with_capacity(seq.columns().len());
                for column in seq.columns() {
                    row.push(read_value(r, column.payload())?);
                }
                filled.push_row(row).map_err(|err| invalid(err.to_string()))?;
                filled.advance_row();
            }
            Ok(Payload::Sequence(filled))
        }
    }
}

// Guards Vec::with_capacity against corrupt length prefixes; the loop itself
// fails on short reads long before a bogus count matters.
const MAX_PREALLOC: usize = 64 * 1024;

fn rebuild(prototype: &Variable, payload: Payload) -> Variable {
    let mut variable = Variable::new(prototype.name(), payload);
    variable.set_read(prototype.read());
    variable.set_send(prototype.send());
    variable
}

fn write_scalar(w: &mut impl Write, value: &ScalarValue) -> io::Result<()> {
    match value {
        ScalarValue::Byte(v) => w.write_all(&[*v]),
        ScalarValue::Int16(v) => w.write_all(&v.to_ne_bytes()),
        ScalarValue::UInt16(v) => w.write_all(&v.to_ne_bytes()),
        ScalarValue::Int32(v) => w.write_all(&v.to_ne_bytes()),
        ScalarValue::UInt32(v) => w.write_all(&v.to_ne_bytes()),
        ScalarValue::Float32(v) => w.write_all(&v.to_ne_bytes()),
        ScalarValue::Float64(v) => w.write_all(&v.to_ne_bytes()),
        ScalarValue::Str(s) | ScalarValue::Url(s) => {
            write_len(w, s.len())?;
            w.write_all(s.as_bytes())
        }
    }
}

fn read_scalar(r: &mut impl Read, kind: ScalarKind) -> io::Result<ScalarValue> {
    Ok(match kind {
        ScalarKind::Byte => {
            let mut buf = [0u8; 1];
            r.read_exact(&mut buf)?;
            ScalarValue::Byte(buf[0])
        }
        ScalarKind::Int16 => ScalarValue::Int16(i16::from_ne_bytes(read_bytes(r)?)),
        ScalarKind::UInt16 => ScalarValue::UInt16(u16::from_ne_bytes(read_bytes(r)?)),
        ScalarKind::Int32 => ScalarValue::Int32(i32::from_ne_bytes(read_bytes(r)?)),
        ScalarKind::UInt32 => ScalarValue::UInt32(u32::from_ne_bytes(read_bytes(r)?)),
        ScalarKind::Float32 => ScalarValue::Float32(f32::from_ne_bytes(read_bytes(r)?)),
        ScalarKind::Float64 => ScalarValue::Float64(f64::from_ne_bytes(read_bytes(r)?)),
        ScalarKind::Str => ScalarValue::Str(read_string(r)?),
        ScalarKind::Url => ScalarValue::Url(read_string(r)?),
    })
}

fn read_string(r: &mut impl Read) -> io::Result<String> {
    let len = read_len(r)?;
    let mut buf = vec![0u8; len.min(MAX_PREALLOC)];
    let mut out = Vec::with_capacity(len.min(MAX_PREALLOC));
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(buf.len());
        r.read_exact(&mut buf[..take])?;
        out.extend_from_slice(&buf[..take]);
        remaining -= take;
    }
    String::from_utf8(out).map_err(|err| invalid(err.to_string()))
}

fn write_len(w: &mut impl Write, len: usize) -> io::Result<()> {
    w.write_all(&(len as u64).to_ne_bytes())
}

fn read_len(r: &mut impl Read) -> io::Result<usize> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    let len = u64::from_ne_bytes(buf);
    usize::try_from(len).map_err(|_| invalid(format!("length prefix {len} overflows usize")))
}

fn read_bytes<const N: usize>(r: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}
