/* Copyright (C) 2017-2022 by Jacob Alexander
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
 * THE SOFTWARE.
 */

//! Bitfield layouts
//!
//! Each message declares its payload as an ordered table of [`Field`]s.
//! Fields are packed MSB-first within each byte and concatenated in
//! declaration order. Fields wider than 64 bits are byte arrays.

// ----- Crates -----

use crate::HidppParseError;
use alloc::vec;
use alloc::vec::Vec;

// ----- Enumerations -----

/// Value predicate, evaluated on both encode and decode
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Check {
    /// Any value that fits in the field width
    Any,
    /// Inclusive range
    Range { min: u64, max: u64 },
    /// Closed set of values
    OneOf(&'static [u64]),
}

/// Field value
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Value {
    Int(u64),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Int(value as u64)
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::Int(value.into())
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Int(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Int(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Value {
    fn from(value: [u8; N]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

// ----- Structs -----

/// Single entry of a message layout
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Field {
    pub name: &'static str,
    pub bits: usize,
    pub default: u64,
    pub check: Check,
}

impl Field {
    pub const fn new(name: &'static str, bits: usize) -> Field {
        Field {
            name,
            bits,
            default: 0,
            check: Check::Any,
        }
    }

    /// Zero filled bits up to the class size
    pub const fn padding(bits: usize) -> Field {
        Field::new("padding", bits)
    }

    pub const fn with_default(self, default: u64) -> Field {
        Field { default, ..self }
    }

    pub const fn with_check(self, check: Check) -> Field {
        Field { check, ..self }
    }

    /// Fields wider than 64 bits are carried as byte arrays
    pub const fn is_bytes(&self) -> bool {
        self.bits > 64
    }

    /// Validates an integer against the field width and check
    pub fn validate(&self, value: u64) -> Result<(), HidppParseError> {
        let fits = self.bits >= 64 || value >> self.bits == 0;
        let passes = match self.check {
            Check::Any => true,
            Check::Range { min, max } => value >= min && value <= max,
            Check::OneOf(allowed) => allowed.contains(&value),
        };

        if fits && passes {
            Ok(())
        } else {
            Err(HidppParseError::InvalidField {
                field: self.name,
                value,
            })
        }
    }
}

/// Named field values
///
/// Order follows the layout after unpacking. When packing, missing
/// entries fall back to the field default.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Values {
    entries: Vec<(&'static str, Value)>,
}

impl Values {
    pub fn new() -> Values {
        Values {
            ..Default::default()
        }
    }

    /// Builder style setter
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Values {
        self.set(name, value);
        self
    }

    /// Sets (or replaces) a value
    pub fn set(&mut self, name: &'static str, value: impl Into<Value>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, Value)> {
        self.entries.iter()
    }

    pub fn int(&self, name: &'static str) -> Result<u64, HidppParseError> {
        match self.get(name) {
            Some(Value::Int(value)) => Ok(*value),
            Some(Value::Bytes(bytes)) => Err(HidppParseError::InvalidFieldLength {
                field: name,
                len: bytes.len(),
                expected: 8,
            }),
            None => Err(HidppParseError::MissingField(name)),
        }
    }

    pub fn flag(&self, name: &'static str) -> Result<bool, HidppParseError> {
        Ok(self.int(name)? != 0)
    }

    pub fn u8(&self, name: &'static str) -> Result<u8, HidppParseError> {
        let value = self.int(name)?;
        u8::try_from(value).map_err(|_| HidppParseError::InvalidField { field: name, value })
    }

    pub fn u16(&self, name: &'static str) -> Result<u16, HidppParseError> {
        let value = self.int(name)?;
        u16::try_from(value).map_err(|_| HidppParseError::InvalidField { field: name, value })
    }

    pub fn u32(&self, name: &'static str) -> Result<u32, HidppParseError> {
        let value = self.int(name)?;
        u32::try_from(value).map_err(|_| HidppParseError::InvalidField { field: name, value })
    }

    pub fn bytes(&self, name: &'static str) -> Result<&[u8], HidppParseError> {
        match self.get(name) {
            Some(Value::Bytes(bytes)) => Ok(bytes),
            Some(Value::Int(value)) => Err(HidppParseError::InvalidField {
                field: name,
                value: *value,
            }),
            None => Err(HidppParseError::MissingField(name)),
        }
    }

    /// Fixed size byte field
    pub fn array<const N: usize>(&self, name: &'static str) -> Result<[u8; N], HidppParseError> {
        let bytes = self.bytes(name)?;
        bytes
            .try_into()
            .map_err(|_| HidppParseError::InvalidFieldLength {
                field: name,
                len: bytes.len(),
                expected: N,
            })
    }
}

/// Entry of a polymorphic payload table
///
/// The first payload byte selects the variant; `fields` includes that
/// discriminant byte as its first entry.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Variant {
    pub discriminant: u8,
    pub name: &'static str,
    pub fields: &'static [Field],
}

struct BitWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    fn put(&mut self, value: u64, bits: usize) {
        for shift in (0..bits).rev() {
            if shift < 64 && (value >> shift) & 1 == 1 {
                self.buf[self.pos / 8] |= 0x80 >> (self.pos % 8);
            }
            self.pos += 1;
        }
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn take(&mut self, bits: usize) -> u64 {
        let mut value = 0u64;
        for _ in 0..bits {
            let bit = (self.buf[self.pos / 8] >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.pos += 1;
        }
        value
    }
}

// ----- Functions -----

/// Total bit width of a layout
pub const fn layout_bits(fields: &[Field]) -> usize {
    let mut bits = 0;
    let mut idx = 0;
    while idx < fields.len() {
        bits += fields[idx].bits;
        idx += 1;
    }
    bits
}

/// Byte width of a layout, rounded up
pub const fn layout_bytes(fields: &[Field]) -> usize {
    (layout_bits(fields) + 7) / 8
}

/// Packs values into `out` following the layout
///
/// # Remarks
/// `out` is zeroed first, so trailing bytes beyond the layout stay 0x00.
/// Returns the number of bytes the layout covers.
pub fn pack(fields: &[Field], values: &Values, out: &mut [u8]) -> Result<usize, HidppParseError> {
    let len = layout_bytes(fields);
    if len > out.len() {
        return Err(HidppParseError::FrameTooLong(len));
    }
    out.iter_mut().for_each(|byte| *byte = 0);

    let mut writer = BitWriter { buf: out, pos: 0 };
    for field in fields {
        if field.is_bytes() {
            let width = field.bits / 8;
            let bytes = match values.get(field.name) {
                Some(Value::Bytes(bytes)) => bytes.clone(),
                Some(Value::Int(value)) => {
                    return Err(HidppParseError::InvalidField {
                        field: field.name,
                        value: *value,
                    });
                }
                None => vec![0; width],
            };
            if bytes.len() > width || field.bits % 8 != 0 {
                return Err(HidppParseError::InvalidFieldLength {
                    field: field.name,
                    len: bytes.len(),
                    expected: width,
                });
            }
            // Short byte arrays are zero padded on the right
            for idx in 0..width {
                writer.put(bytes.get(idx).copied().unwrap_or(0).into(), 8);
            }
            continue;
        }

        let value = match values.get(field.name) {
            Some(Value::Int(value)) => *value,
            Some(Value::Bytes(bytes)) if bytes.len() * 8 <= field.bits => bytes
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
            Some(Value::Bytes(bytes)) => {
                return Err(HidppParseError::InvalidFieldLength {
                    field: field.name,
                    len: bytes.len(),
                    expected: field.bits / 8,
                });
            }
            None => field.default,
        };
        field.validate(value)?;
        writer.put(value, field.bits);
    }

    Ok(len)
}

/// Unpacks a payload following the layout
///
/// # Remarks
/// Bytes past the layout are ignored (class padding).
pub fn unpack(fields: &[Field], data: &[u8]) -> Result<Values, HidppParseError> {
    let len = layout_bytes(fields);
    if data.len() < len {
        return Err(HidppParseError::ShortPayload {
            len: data.len(),
            expected: len,
        });
    }

    let mut values = Values::new();
    let mut reader = BitReader { buf: data, pos: 0 };
    for field in fields {
        if field.is_bytes() {
            let bytes: Vec<u8> = (0..field.bits / 8).map(|_| reader.take(8) as u8).collect();
            values.entries.push((field.name, Value::Bytes(bytes)));
            continue;
        }

        let value = reader.take(field.bits);
        field.validate(value)?;
        values.entries.push((field.name, Value::Int(value)));
    }

    Ok(values)
}

/// Looks up the variant selected by the first payload byte
pub fn select_variant<'a>(
    field: &'static str,
    table: &'a [Variant],
    data: &[u8],
) -> Result<&'a Variant, HidppParseError> {
    let discriminant = data.first().copied().ok_or(HidppParseError::ShortPayload {
        len: 0,
        expected: 1,
    })?;

    table
        .iter()
        .find(|variant| variant.discriminant == discriminant)
        .ok_or(HidppParseError::UnknownVariant {
            field,
            value: discriminant.into(),
        })
}

/// Unpacks a polymorphic payload
pub fn unpack_variant<'a>(
    field: &'static str,
    table: &'a [Variant],
    data: &[u8],
) -> Result<(&'a Variant, Values), HidppParseError> {
    let variant = select_variant(field, table, data)?;
    Ok((variant, unpack(variant.fields, data)?))
}

// ----- Tests -----
