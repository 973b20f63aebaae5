// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-level validation of the canonical programs.
//!
//! The compiler never parses payload bytes itself, so these tests
//! execute the lowered parse and serialise programs with a small
//! interpreter standing in for a compiled backend. Wire vectors follow
//! the little-endian contract: chunks are read and written in LE byte
//! order with bit fields packed LSB first.

use std::collections::BTreeMap;

use pdlc::ast::ByteOrder;
use pdlc::cir::*;
use pdlc::{ast, compile_inline};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Int(u64),
    Bytes(Vec<u8>),
    Record(BTreeMap<String, Value>),
    Array(Vec<Value>),
    Absent,
}

impl Value {
    fn int(&self) -> u64 {
        match self {
            Value::Int(value) => *value,
            value => panic!("expected an integer value, got {value:?}"),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Value::Bytes(bytes) => bytes,
            value => panic!("expected a byte value, got {value:?}"),
        }
    }
}

type Record = BTreeMap<String, Value>;

fn mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

struct Machine<'s> {
    schema: &'s Schema,
}

impl<'s> Machine<'s> {
    fn tag_value(&self, enum_id: &str, tag_id: &str) -> u64 {
        self.schema.enum_def(enum_id).tag_value(tag_id).expect("tag without a single value")
    }

    fn const_value(&self, value: &ConstValue) -> u64 {
        match value {
            ConstValue::Scalar(value) => *value,
            ConstValue::Tag { enum_id, tag_id } => self.tag_value(enum_id, tag_id),
        }
    }

    fn read_uint(&self, data: &[u8]) -> u64 {
        let mut value = 0u64;
        match self.schema.endianness {
            ByteOrder::LittleEndian => {
                for byte in data.iter().rev() {
                    value = (value << 8) | *byte as u64;
                }
            }
            ByteOrder::BigEndian => {
                for byte in data {
                    value = (value << 8) | *byte as u64;
                }
            }
        }
        value
    }

    fn write_uint(&self, out: &mut Vec<u8>, value: u64, width_bytes: usize) {
        match self.schema.endianness {
            ByteOrder::LittleEndian => {
                for i in 0..width_bytes {
                    out.push((value >> (8 * i)) as u8);
                }
            }
            ByteOrder::BigEndian => {
                for i in (0..width_bytes).rev() {
                    out.push((value >> (8 * i)) as u8);
                }
            }
        }
    }

    fn eval_len(
        &self,
        len: &LenExpr,
        vars: &BTreeMap<String, u64>,
        remaining: usize,
    ) -> Option<usize> {
        match len {
            LenExpr::Const(n) => Some(*n),
            LenExpr::Var(var) => Some(vars[var] as usize),
            LenExpr::VarMinus { var, modifier } => {
                let value = vars[var] as i128 - *modifier as i128;
                (value >= 0).then_some(value as usize)
            }
            LenExpr::VarTimes { var, element_bytes } => {
                Some(vars[var] as usize * element_bytes)
            }
            LenExpr::MaxConst { expr, bytes } => {
                Some(self.eval_len(expr, vars, remaining)?.max(*bytes))
            }
            LenExpr::Remaining => Some(remaining),
        }
    }

    fn parse_element(&self, elem: &ElemType, data: &[u8], pos: &mut usize) -> Option<Value> {
        match elem {
            ElemType::Byte => {
                let byte = *data.get(*pos)?;
                *pos += 1;
                Some(Value::Int(byte as u64))
            }
            ElemType::Scalar { width } | ElemType::Enum { width, .. } => {
                let bytes = width / 8;
                if data.len() - *pos < bytes {
                    return None;
                }
                let raw = self.read_uint(&data[*pos..*pos + bytes]);
                *pos += bytes;
                if let ElemType::Enum { enum_id, .. } = elem {
                    let def = self.schema.enum_def(enum_id);
                    if !def.open && !def.contains(raw) {
                        return None;
                    }
                }
                Some(Value::Int(raw))
            }
            ElemType::Struct { struct_id } => {
                let (record, consumed) = self.parse(struct_id, &data[*pos..])?;
                if consumed == 0 {
                    return None;
                }
                *pos += consumed;
                Some(Value::Record(record))
            }
        }
    }

    /// Execute the parse program of `codec_id` over the input bytes.
    /// Returns the parsed record and the number of consumed bytes.
    fn parse(&self, codec_id: &str, input: &[u8]) -> Option<(Record, usize)> {
        let codec = self.schema.codec(codec_id);
        let mut record = Record::new();
        let mut vars: BTreeMap<String, u64> = BTreeMap::new();
        let mut slices: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        // The cursor runs over the input, or over the parent payload
        // for specialised codecs.
        let mut data: Vec<u8> = input.to_vec();
        let mut pos = 0usize;
        let mut consumed_override = None;

        for op in &codec.parse {
            match op {
                ParseOp::ParentCheck { parent_id, constraints } => {
                    let (parent_record, parent_consumed) = self.parse(parent_id, input)?;
                    for check in constraints {
                        if parent_record[&check.field].int() != self.const_value(&check.value) {
                            return None;
                        }
                    }
                    for (id, value) in &parent_record {
                        if id == "payload"
                            || constraints.iter().any(|check| check.field == *id)
                        {
                            continue;
                        }
                        record.insert(id.clone(), value.clone());
                    }
                    data = parent_record
                        .get("payload")
                        .map(|payload| payload.bytes().to_vec())
                        .unwrap_or_default();
                    pos = 0;
                    consumed_override = Some(parent_consumed);
                }
                ParseOp::Require { bytes } => {
                    let wanted = self.eval_len(bytes, &vars, data.len() - pos)?;
                    if data.len() - pos < wanted {
                        return None;
                    }
                }
                ParseOp::ReadChunk { dst, width_bytes } => {
                    if data.len() - pos < *width_bytes {
                        return None;
                    }
                    let raw = self.read_uint(&data[pos..pos + width_bytes]);
                    pos += width_bytes;
                    vars.insert(dst.clone(), raw);
                }
                ParseOp::Unpack { src, fields, .. } => {
                    let chunk = vars[src];
                    for field in fields {
                        let raw = (chunk >> field.shift) & mask(field.width);
                        match &field.sink {
                            Sink::Field { id } => {
                                record.insert(id.clone(), Value::Int(raw));
                            }
                            Sink::EnumField { id, enum_id } => {
                                let def = self.schema.enum_def(enum_id);
                                if !def.open && !def.contains(raw) {
                                    return None;
                                }
                                record.insert(id.clone(), Value::Int(raw));
                            }
                            Sink::SizeVar { var }
                            | Sink::CountVar { var }
                            | Sink::CondVar { var } => {
                                vars.insert(var.clone(), raw);
                            }
                            Sink::CheckConst { value } => {
                                if raw != *value {
                                    return None;
                                }
                            }
                            Sink::CheckEnum { enum_id, tag_id } => {
                                if raw != self.tag_value(enum_id, tag_id) {
                                    return None;
                                }
                            }
                            Sink::Skip => (),
                        }
                    }
                }
                ParseOp::Skip { bytes } => {
                    if data.len() - pos < *bytes {
                        return None;
                    }
                    pos += bytes;
                }
                ParseOp::TakeSlice { dst, src, len } => match src {
                    None => {
                        let n = self.eval_len(len, &vars, data.len() - pos)?;
                        if data.len() - pos < n {
                            return None;
                        }
                        slices.insert(dst.clone(), data[pos..pos + n].to_vec());
                        pos += n;
                    }
                    Some(src) => {
                        let source = slices[src].clone();
                        let n = self.eval_len(len, &vars, source.len())?;
                        if source.len() < n {
                            return None;
                        }
                        slices.insert(dst.clone(), source[..n].to_vec());
                    }
                },
                ParseOp::TakeTail { dst, trailer_bytes } => {
                    if data.len() - pos < *trailer_bytes {
                        return None;
                    }
                    let end = data.len() - trailer_bytes;
                    slices.insert(dst.clone(), data[pos..end].to_vec());
                    pos = end;
                }
                ParseOp::AssignBytes { field, src } => {
                    record.insert(field.clone(), Value::Bytes(slices[src].clone()));
                }
                ParseOp::ParseStruct { field, struct_id } => {
                    let (value, consumed) = self.parse(struct_id, &data[pos..])?;
                    pos += consumed;
                    record.insert(field.clone(), Value::Record(value));
                }
                ParseOp::ParseStructFrom { field, struct_id, src } => {
                    let source = slices[src].clone();
                    let (value, _) = self.parse(struct_id, &source)?;
                    record.insert(field.clone(), Value::Record(value));
                }
                ParseOp::LoopCount { field, count, src, elem } => {
                    let count = self.eval_len(count, &vars, data.len() - pos)?;
                    let mut elements = vec![];
                    match src {
                        None => {
                            for _ in 0..count {
                                elements.push(self.parse_element(elem, &data, &mut pos)?);
                            }
                        }
                        Some(src) => {
                            let source = slices[src].clone();
                            let mut spos = 0;
                            for _ in 0..count {
                                elements.push(self.parse_element(elem, &source, &mut spos)?);
                            }
                        }
                    }
                    record.insert(field.clone(), Value::Array(elements));
                }
                ParseOp::LoopUntilEmpty { field, src, elem } => {
                    let source = slices[src].clone();
                    let mut spos = 0;
                    let mut elements = vec![];
                    while spos < source.len() {
                        elements.push(self.parse_element(elem, &source, &mut spos)?);
                    }
                    record.insert(field.clone(), Value::Array(elements));
                }
                ParseOp::Optional { field, cond, elem } => {
                    let set = vars[&cond.var] != 0;
                    if set == cond.present_when_set {
                        let value = self.parse_element(elem, &data, &mut pos)?;
                        record.insert(field.clone(), value);
                    } else {
                        record.insert(field.clone(), Value::Absent);
                    }
                }
            }
        }
        Some((record, consumed_override.unwrap_or(pos)))
    }

    fn eval_size(&self, expr: &SizeExpr, codec: &Codec, record: &Record) -> usize {
        match expr {
            SizeExpr::Const(n) => *n,
            SizeExpr::FieldBytes { field } => record[field].bytes().len(),
            SizeExpr::ArrayBytes { field, element_bytes: Some(bytes) } => match &record[field] {
                Value::Array(elements) => elements.len() * bytes,
                Value::Bytes(data) => data.len() * bytes,
                value => panic!("expected an array value, got {value:?}"),
            },
            SizeExpr::ArrayBytes { field, element_bytes: None } => {
                let struct_id = self.array_struct_id(codec, field);
                let struct_codec = self.schema.codec(&struct_id);
                match &record[field] {
                    Value::Array(elements) => elements
                        .iter()
                        .map(|element| match element {
                            Value::Record(record) => {
                                self.eval_size(&struct_codec.size, struct_codec, record)
                            }
                            value => panic!("expected a struct element, got {value:?}"),
                        })
                        .sum(),
                    value => panic!("expected an array value, got {value:?}"),
                }
            }
            SizeExpr::StructBytes { field } => {
                let struct_id = self.field_struct_id(codec, field);
                let struct_codec = self.schema.codec(&struct_id);
                match &record[field] {
                    Value::Record(record) => {
                        self.eval_size(&struct_codec.size, struct_codec, record)
                    }
                    value => panic!("expected a struct value, got {value:?}"),
                }
            }
            SizeExpr::OptionalBytes { field, element_bytes } => match &record[field] {
                Value::Absent => 0,
                Value::Record(inner) => {
                    let struct_id = self.field_struct_id(codec, field);
                    let struct_codec = self.schema.codec(&struct_id);
                    self.eval_size(&struct_codec.size, struct_codec, inner)
                }
                _ => element_bytes.expect("scalar optional without element size"),
            },
            SizeExpr::MaxConst { expr, bytes } => {
                self.eval_size(expr, codec, record).max(*bytes)
            }
            SizeExpr::Sum(terms) => {
                terms.iter().map(|term| self.eval_size(term, codec, record)).sum()
            }
        }
    }

    fn array_struct_id(&self, codec: &Codec, field: &str) -> String {
        codec
            .fields
            .iter()
            .find_map(|data_field| match (&data_field.ty, data_field.id == field) {
                (FieldType::Array { element: ElemType::Struct { struct_id }, .. }, true) => {
                    Some(struct_id.clone())
                }
                _ => None,
            })
            .expect("array field without struct elements")
    }

    fn field_struct_id(&self, codec: &Codec, field: &str) -> String {
        codec
            .fields
            .iter()
            .find_map(|data_field| match (&data_field.ty, data_field.id == field) {
                (FieldType::Struct { struct_id }, true) => Some(struct_id.clone()),
                _ => None,
            })
            .expect("field without struct type")
    }

    fn write_element(&self, elem: &ElemType, value: &Value, out: &mut Vec<u8>) {
        match elem {
            ElemType::Byte => out.push(value.int() as u8),
            ElemType::Scalar { width } => self.write_uint(out, value.int(), width / 8),
            ElemType::Enum { width, .. } => self.write_uint(out, value.int(), width / 8),
            ElemType::Struct { struct_id } => match value {
                Value::Record(record) => {
                    let encoded = self.serialize(struct_id, record);
                    out.extend_from_slice(&encoded);
                }
                value => panic!("expected a struct element, got {value:?}"),
            },
        }
    }

    /// Execute the serialise program of `codec_id` over a record value.
    fn serialize(&self, codec_id: &str, record: &Record) -> Vec<u8> {
        let codec = self.schema.codec(codec_id);
        let mut out = vec![];
        for op in &codec.serialize {
            match op {
                SerOp::PackChunk { width_bytes, fields } => {
                    let mut chunk = 0u64;
                    for field in fields {
                        let raw = match &field.value {
                            ValueExpr::Field { id } => record[id].int(),
                            ValueExpr::Const { value } => *value,
                            ValueExpr::Tag { enum_id, tag_id } => {
                                self.tag_value(enum_id, tag_id)
                            }
                            ValueExpr::Size { expr, modifier } => {
                                let size = self.eval_size(expr, codec, record) as i128
                                    + *modifier as i128;
                                size as u64
                            }
                            ValueExpr::Count { field } => match &record[field] {
                                Value::Array(elements) => elements.len() as u64,
                                Value::Bytes(data) => data.len() as u64,
                                value => panic!("expected an array value, got {value:?}"),
                            },
                            ValueExpr::Presence { field, set_value } => {
                                if record[field] != Value::Absent {
                                    *set_value
                                } else {
                                    1 - *set_value
                                }
                            }
                        };
                        chunk |= (raw & mask(field.width)) << field.shift;
                    }
                    self.write_uint(&mut out, chunk, *width_bytes);
                }
                SerOp::WriteBytes { field } => out.extend_from_slice(record[field].bytes()),
                SerOp::WriteStruct { field } => match &record[field] {
                    Value::Record(inner) => {
                        let struct_id = self.field_struct_id(codec, field);
                        let encoded = self.serialize(&struct_id, inner);
                        out.extend_from_slice(&encoded);
                    }
                    value => panic!("expected a struct value, got {value:?}"),
                },
                SerOp::ForEach { field, elem } => match &record[field] {
                    Value::Array(elements) => {
                        for element in elements {
                            self.write_element(elem, element, &mut out);
                        }
                    }
                    value => panic!("expected an array value, got {value:?}"),
                },
                SerOp::WriteOptional { field, elem } => {
                    if record[field] != Value::Absent {
                        self.write_element(elem, &record[field], &mut out);
                    }
                }
                SerOp::PadTo { content, bytes } => {
                    let written = self.eval_size(content, codec, record);
                    if written < *bytes {
                        out.resize(out.len() + bytes - written, 0);
                    }
                }
            }
        }
        out
    }

    fn size(&self, codec_id: &str, record: &Record) -> usize {
        let codec = self.schema.codec(codec_id);
        self.eval_size(&codec.size, codec, record)
    }
}

fn compile(source: &str) -> Schema {
    let mut sources = ast::SourceDatabase::new();
    compile_inline(&mut sources, "test.pdl", source.to_owned()).expect("compilation error")
}

fn record(entries: &[(&str, Value)]) -> Record {
    entries.iter().map(|(id, value)| (id.to_string(), value.clone())).collect()
}

fn ints(values: &[u64]) -> Value {
    Value::Array(values.iter().map(|value| Value::Int(*value)).collect())
}

#[test]
fn scalar_parent_roundtrip() {
    let schema = compile(
        r#"
        little_endian_packets
        packet ScalarParent {
            a : 8,
            _size_(_payload_) : 8,
            _payload_,
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[
        ("a", Value::Int(0x11)),
        ("payload", Value::Bytes(vec![0x22, 0x33])),
    ]);
    let encoded = machine.serialize("ScalarParent", &value);
    assert_eq!(encoded, vec![0x11, 0x02, 0x22, 0x33]);
    assert_eq!(machine.size("ScalarParent", &value), encoded.len());

    let (parsed, consumed) = machine.parse("ScalarParent", &encoded).unwrap();
    assert_eq!(consumed, 4);
    assert_eq!(parsed, value);
}

#[test]
fn child_packet_dispatch() {
    let schema = compile(
        r#"
        little_endian_packets
        packet ScalarParent {
            a : 8,
            _size_(_payload_) : 8,
            _payload_,
        }
        packet ScalarChildA : ScalarParent (a = 0) {
            b : 8,
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let child = record(&[("b", Value::Int(0xab))]);
    let encoded = machine.serialize("ScalarChildA", &child);
    assert_eq!(encoded, vec![0x00, 0x01, 0xab]);
    assert_eq!(machine.size("ScalarChildA", &child), 3);

    // Parsing as the parent yields the raw payload.
    let (parent, _) = machine.parse("ScalarParent", &encoded).unwrap();
    assert_eq!(parent["a"], Value::Int(0));
    assert_eq!(parent["payload"], Value::Bytes(vec![0xab]));

    // Parsing as the child validates the constraint and decodes the
    // payload.
    let (parsed, _) = machine.parse("ScalarChildA", &encoded).unwrap();
    assert_eq!(parsed["b"], Value::Int(0xab));

    // The constraint rejects other selector values.
    assert!(machine.parse("ScalarChildA", &[0x01, 0x01, 0xab]).is_none());
}

#[test]
fn packed_bit_fields() {
    let schema = compile(
        r#"
        little_endian_packets
        packet PackedScalars { a : 7, c : 57 }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[
        ("a", Value::Int(0x55)),
        ("c", Value::Int(0x123456789abcdef)),
    ]);
    let encoded = machine.serialize("PackedScalars", &value);
    let word = (0x55u64 & 0x7f) | ((0x123456789abcdef & 0x1ffffffffffffff) << 7);
    assert_eq!(encoded, word.to_le_bytes().to_vec());

    let (parsed, consumed) = machine.parse("PackedScalars", &encoded).unwrap();
    assert_eq!(consumed, 8);
    assert_eq!(parsed, value);
}

#[test]
fn byte_array_with_size_field() {
    let schema = compile(
        r#"
        little_endian_packets
        packet ByteArray {
            _size_(array) : 8,
            array : 8[],
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[("array", Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]))]);
    let encoded = machine.serialize("ByteArray", &value);
    assert_eq!(encoded, vec![0x04, 0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(machine.size("ByteArray", &value), 5);

    let (parsed, _) = machine.parse("ByteArray", &encoded).unwrap();
    assert_eq!(parsed, value);
}

#[test]
fn optional_fields_with_mixed_polarity() {
    let schema = compile(
        r#"
        little_endian_packets
        packet OptionalScalars {
            c0 : 1,
            c1 : 1,
            _reserved_ : 6,
            a : 8 if c0 = 0,
            b : 32 if c1 = 1,
        }
        "#,
    );
    let machine = Machine { schema: &schema };

    // `a` absent (present when clear) and `b` present (present when
    // set) both raise their bits: bitmap 0x03.
    let value = record(&[("a", Value::Absent), ("b", Value::Int(0x0003_0201))]);
    let encoded = machine.serialize("OptionalScalars", &value);
    assert_eq!(encoded, vec![0x03, 0x01, 0x02, 0x03, 0x00]);
    assert_eq!(machine.size("OptionalScalars", &value), 5);
    let (parsed, _) = machine.parse("OptionalScalars", &encoded).unwrap();
    assert_eq!(parsed, value);

    // Both present: bitmap 0x02.
    let value = record(&[("a", Value::Int(0x7f)), ("b", Value::Int(1))]);
    let encoded = machine.serialize("OptionalScalars", &value);
    assert_eq!(encoded, vec![0x02, 0x7f, 0x01, 0x00, 0x00, 0x00]);
    let (parsed, _) = machine.parse("OptionalScalars", &encoded).unwrap();
    assert_eq!(parsed, value);

    // Both absent: bitmap 0x01, no further bytes.
    let value = record(&[("a", Value::Absent), ("b", Value::Absent)]);
    let encoded = machine.serialize("OptionalScalars", &value);
    assert_eq!(encoded, vec![0x01]);
    assert_eq!(machine.size("OptionalScalars", &value), 1);
}

#[test]
fn padded_array_region() {
    let schema = compile(
        r#"
        little_endian_packets
        packet PaddedArray {
            _size_(array) : 8,
            array : 16[],
            _padding_ [16],
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[("array", ints(&[0x0001]))]);
    let encoded = machine.serialize("PaddedArray", &value);
    let mut expected = vec![0x02, 0x01, 0x00];
    expected.resize(17, 0);
    assert_eq!(encoded, expected);
    assert_eq!(machine.size("PaddedArray", &value), 17);

    let (parsed, consumed) = machine.parse("PaddedArray", &encoded).unwrap();
    assert_eq!(consumed, 17);
    assert_eq!(parsed, value);
}

#[test]
fn payload_with_trailer() {
    let schema = compile(
        r#"
        little_endian_packets
        packet Framed {
            _payload_,
            crc : 16,
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[
        ("payload", Value::Bytes(vec![1, 2, 3])),
        ("crc", Value::Int(0xbeef)),
    ]);
    let encoded = machine.serialize("Framed", &value);
    assert_eq!(encoded, vec![1, 2, 3, 0xef, 0xbe]);
    let (parsed, _) = machine.parse("Framed", &encoded).unwrap();
    assert_eq!(parsed, value);

    // The trailer requires two bytes even with an empty payload.
    assert!(machine.parse("Framed", &[1]).is_none());
}

#[test]
fn size_modifier_offsets_the_wire_value() {
    let schema = compile(
        r#"
        little_endian_packets
        packet Modified {
            _size_(_payload_) : 8,
            _payload_ : [+2],
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[("payload", Value::Bytes(vec![0xaa, 0xbb]))]);
    let encoded = machine.serialize("Modified", &value);
    // The wire size counts the payload plus the modifier.
    assert_eq!(encoded, vec![0x04, 0xaa, 0xbb]);
    let (parsed, _) = machine.parse("Modified", &encoded).unwrap();
    assert_eq!(parsed, value);

    // A wire size smaller than the modifier is a parse failure.
    assert!(machine.parse("Modified", &[0x01]).is_none());
}

#[test]
fn fixed_fields_validate() {
    let schema = compile(
        r#"
        little_endian_packets
        enum Marker : 8 { START = 0x7e }
        packet Fixed {
            _fixed_ = 0x2a : 8,
            _fixed_ = START : Marker,
            value : 8,
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[("value", Value::Int(5))]);
    let encoded = machine.serialize("Fixed", &value);
    assert_eq!(encoded, vec![0x2a, 0x7e, 0x05]);
    assert!(machine.parse("Fixed", &encoded).is_some());
    assert!(machine.parse("Fixed", &[0x2b, 0x7e, 0x05]).is_none());
    assert!(machine.parse("Fixed", &[0x2a, 0x7f, 0x05]).is_none());
}

#[test]
fn enum_field_validation() {
    let schema = compile(
        r#"
        little_endian_packets
        enum Closed : 8 { A = 1, B = 2 }
        enum Open : 8 { X = 1, OTHER = .. }
        packet WithClosed { e : Closed }
        packet WithOpen { e : Open }
        "#,
    );
    let machine = Machine { schema: &schema };
    assert!(machine.parse("WithClosed", &[0x01]).is_some());
    assert!(machine.parse("WithClosed", &[0x03]).is_none());
    // Open enums accept and tag unknown values.
    let (parsed, _) = machine.parse("WithOpen", &[0x7f]).unwrap();
    assert_eq!(parsed["e"], Value::Int(0x7f));
}

#[test]
fn count_array_of_structs() {
    let schema = compile(
        r#"
        little_endian_packets
        struct Entry {
            key : 8,
            value : 16,
        }
        packet Table {
            _count_(entries) : 8,
            entries : Entry[],
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let entry = |key, value| {
        Value::Record(record(&[("key", Value::Int(key)), ("value", Value::Int(value))]))
    };
    let value = record(&[(
        "entries",
        Value::Array(vec![entry(1, 0x0a0b), entry(2, 0x0c0d)]),
    )]);
    let encoded = machine.serialize("Table", &value);
    assert_eq!(encoded, vec![0x02, 0x01, 0x0b, 0x0a, 0x02, 0x0d, 0x0c]);
    assert_eq!(machine.size("Table", &value), 7);
    let (parsed, _) = machine.parse("Table", &encoded).unwrap();
    assert_eq!(parsed, value);
}

#[test]
fn variable_size_struct_array() {
    let schema = compile(
        r#"
        little_endian_packets
        struct Tlv {
            tag : 8,
            _size_(_body_) : 8,
            _body_,
        }
        packet Stream {
            _size_(tlvs) : 8,
            tlvs : Tlv[],
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let tlv = |tag, body: &[u8]| {
        Value::Record(record(&[
            ("tag", Value::Int(tag)),
            ("payload", Value::Bytes(body.to_vec())),
        ]))
    };
    let value = record(&[("tlvs", Value::Array(vec![tlv(1, &[0xaa]), tlv(2, &[])]))]);
    let encoded = machine.serialize("Stream", &value);
    assert_eq!(encoded, vec![0x05, 0x01, 0x01, 0xaa, 0x02, 0x00]);
    let (parsed, _) = machine.parse("Stream", &encoded).unwrap();
    assert_eq!(parsed, value);
}

#[test]
fn grandchild_packets() {
    let schema = compile(
        r#"
        little_endian_packets
        packet Root {
            op : 8,
            _size_(_payload_) : 8,
            _payload_,
        }
        packet Middle : Root (op = 1) {
            sub : 8,
            _size_(_payload_) : 8,
            _payload_,
        }
        packet Leaf : Middle (sub = 7) {
            value : 16,
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[("value", Value::Int(0x1234))]);
    let encoded = machine.serialize("Leaf", &value);
    // Root header, middle header, leaf content.
    assert_eq!(encoded, vec![0x01, 0x04, 0x07, 0x02, 0x34, 0x12]);
    assert_eq!(machine.size("Leaf", &value), 6);
    let (parsed, _) = machine.parse("Leaf", &encoded).unwrap();
    assert_eq!(parsed["value"], Value::Int(0x1234));

    // The intermediate constraint is validated.
    assert!(machine.parse("Leaf", &[0x01, 0x04, 0x08, 0x02, 0x34, 0x12]).is_none());
}

#[test]
fn shortage_fails_without_partial_state() {
    let schema = compile(
        r#"
        little_endian_packets
        packet Fixed32 { value : 32 }
        "#,
    );
    let machine = Machine { schema: &schema };
    assert!(machine.parse("Fixed32", &[1, 2, 3]).is_none());
    assert!(machine.parse("Fixed32", &[1, 2, 3, 4]).is_some());
}

#[test]
fn struct_field_roundtrip() {
    let schema = compile(
        r#"
        little_endian_packets
        struct Header {
            version : 8,
            flags : 8,
        }
        packet Message {
            header : Header,
            _size_(_payload_) : 8,
            _payload_,
        }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[
        (
            "header",
            Value::Record(record(&[
                ("version", Value::Int(2)),
                ("flags", Value::Int(0x80)),
            ])),
        ),
        ("payload", Value::Bytes(vec![9])),
    ]);
    let encoded = machine.serialize("Message", &value);
    assert_eq!(encoded, vec![0x02, 0x80, 0x01, 0x09]);
    assert_eq!(machine.size("Message", &value), 4);
    let (parsed, _) = machine.parse("Message", &encoded).unwrap();
    assert_eq!(parsed, value);
}

#[test]
fn big_endian_chunks() {
    let schema = compile(
        r#"
        big_endian_packets
        packet Word { value : 16 }
        "#,
    );
    let machine = Machine { schema: &schema };
    let value = record(&[("value", Value::Int(0x1234))]);
    assert_eq!(machine.serialize("Word", &value), vec![0x12, 0x34]);
    let (parsed, _) = machine.parse("Word", &[0x12, 0x34]).unwrap();
    assert_eq!(parsed, value);
}
