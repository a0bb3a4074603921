//! Frame codec
//!
//! Generic encode/decode engine driven by the registry's declarative layouts.
//! Notification and read payloads are flag-gated, variable-length records:
//! an optional leading flag word decides which of the following fields were
//! transmitted. Command buffers are fixed-size and written field by field.

use crate::registry::{CommandDefinition, FieldLayout, Modifier, OutputField, ValueSource, Verdict};
use crate::types::{Endian, Result, TrainerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single input value supplied when issuing a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<f64> for InputValue {
    fn from(value: f64) -> Self {
        InputValue::Number(value)
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        InputValue::Text(value.to_string())
    }
}

/// Named inputs for a command, e.g. `{"resistance": 50}`
pub type CommandInput = BTreeMap<String, InputValue>;

/// Value of a decoded field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    /// Bitfield expanded through a flag map, in declaration order
    Flags(Vec<(&'static str, bool)>),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(value) => Some(*value),
            FieldValue::Flags(_) => None,
        }
    }
}

/// One field emitted by [`decode_record`]
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    pub name: &'static str,
    pub unit: &'static str,
    pub value: FieldValue,
}

/// Fields decoded from one frame, in declared order
///
/// An empty record means the frame carried nothing this crate recognizes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedRecord {
    fields: Vec<DecodedField>,
}

impl DecodedRecord {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecodedField> {
        self.fields.iter()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }

    /// Numeric value of a field, if present and numeric
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_number)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|field| field.name).collect()
    }
}

/// Result of checking a command response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseVerdict {
    Accepted,
    Rejected { field: &'static str, reason: String },
}

fn read_field(field: &FieldLayout, buffer: &[u8], offset: usize) -> Result<f64> {
    field
        .format
        .read(buffer, offset, field.byte_size, Endian::Little)
        .ok_or(TrainerError::FrameTooShort {
            field: field.name,
            offset,
            needed: field.byte_size,
            available: buffer.len().saturating_sub(offset),
        })
}

fn apply_modifier(modifier: Option<Modifier>, raw: f64) -> FieldValue {
    match modifier {
        None => FieldValue::Number(raw),
        Some(Modifier::Scale(factor)) => FieldValue::Number(raw * factor),
        Some(Modifier::Flags(bits)) => {
            let word = raw as u32;
            FieldValue::Flags(
                bits.iter()
                    .map(|flag| (flag.name, word & flag.mask != 0))
                    .collect(),
            )
        }
    }
}

/// Decode a read/notify payload using `layout`
///
/// A leading `flags` field is consumed first and gates every later field
/// with a presence rule; gated-off fields consume no bytes. All values are
/// little-endian and read contiguously.
pub fn decode_record(layout: &[FieldLayout], buffer: &[u8]) -> Result<DecodedRecord> {
    let mut record = DecodedRecord::default();

    let Some(first) = layout.first() else {
        return Ok(record);
    };

    let mut offset = 0;
    let mut flags = 0u32;
    let mut fields = layout;

    if first.is_flags() {
        flags = read_field(first, buffer, offset)? as u32;
        offset += first.byte_size;
        fields = &layout[1..];
    }

    for field in fields {
        if !field.presence.is_present(flags) {
            continue;
        }

        let raw = read_field(field, buffer, offset)?;
        offset += field.byte_size;

        record.fields.push(DecodedField {
            name: field.name,
            unit: field.unit,
            value: apply_modifier(field.modifier, raw),
        });
    }

    Ok(record)
}

fn input_number(field: &OutputField, input: &CommandInput, key: &str) -> Result<f64> {
    match input.get(key) {
        Some(InputValue::Number(value)) => Ok(*value),
        Some(InputValue::Bool(value)) => Ok(if *value { 1.0 } else { 0.0 }),
        Some(InputValue::Text(text)) => text.trim().parse::<f64>().map_err(|_| {
            TrainerError::Encoding(format!(
                "{}: input '{}' is not a number: {:?}",
                field.name, key, text
            ))
        }),
        None => Err(TrainerError::Encoding(format!(
            "{}: missing input '{}'",
            field.name, key
        ))),
    }
}

fn resolve_value(field: &OutputField, input: &CommandInput) -> Result<f64> {
    match field.value {
        ValueSource::Constant(value) => Ok(value),
        ValueSource::Input(key) => input_number(field, input, key),
        // Half-way values round up
        ValueSource::RoundedInput(key) => Ok((input_number(field, input, key)? + 0.5).floor()),
        ValueSource::Choice { input: key, options } => {
            let choice = match input.get(key) {
                Some(InputValue::Text(text)) => text.as_str(),
                _ => {
                    return Err(TrainerError::Encoding(format!(
                        "{}: input '{}' must be one of {:?}",
                        field.name,
                        key,
                        options.iter().map(|(name, _)| *name).collect::<Vec<_>>()
                    )))
                }
            };
            options
                .iter()
                .find(|(name, _)| *name == choice)
                .map(|(_, value)| *value)
                .ok_or_else(|| {
                    TrainerError::Encoding(format!(
                        "{}: unknown choice '{}' for input '{}'",
                        field.name, choice, key
                    ))
                })
        }
    }
}

/// Build the fixed-size buffer for a command
///
/// Fields are written at consecutive offsets using their declared format and
/// byte order. Fails before producing any bytes if an input is missing or not
/// finite, or if the fields overrun the buffer.
pub fn encode_command(command: &CommandDefinition, input: &CommandInput) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; command.buffer_size];
    let mut offset = 0;

    for field in command.fields {
        let value = resolve_value(field, input)?;
        if !value.is_finite() {
            return Err(TrainerError::Encoding(format!(
                "{}: value {} is not finite",
                field.name, value
            )));
        }

        field
            .format
            .write(&mut buffer, offset, value, field.endian)
            .ok_or_else(|| {
                TrainerError::Encoding(format!(
                    "{}: {} at offset {} overruns a {}-byte buffer",
                    field.name, field.format, offset, command.buffer_size
                ))
            })?;
        offset += field.format.width();
    }

    Ok(buffer)
}

/// Check a response against a command's response fields
///
/// Fields are read little-endian at consecutive offsets and checked in
/// order; the first failure is reported and later fields are not evaluated.
pub fn validate_response(command: &CommandDefinition, buffer: &[u8]) -> ResponseVerdict {
    let mut offset = 0;

    for field in command.response {
        let width = field.format.width();
        let Some(value) = field.format.read(buffer, offset, width, Endian::Little) else {
            return ResponseVerdict::Rejected {
                field: field.name,
                reason: format!("Response truncated at {}", field.name),
            };
        };

        match field.check.check(value) {
            Verdict::Pass => {}
            Verdict::Fail => {
                return ResponseVerdict::Rejected {
                    field: field.name,
                    reason: format!("Invalid response: {}", field.name),
                }
            }
            Verdict::FailWith(reason) => {
                return ResponseVerdict::Rejected {
                    field: field.name,
                    reason,
                }
            }
        }

        offset += width;
    }

    ResponseVerdict::Accepted
}
