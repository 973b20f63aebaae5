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

//! Canonical intermediate representation.
//!
//! Every declaration lowers to a pair of linear programs: a parse
//! program consuming an input span, and a serialise program appending
//! to an output buffer, together with a symbolic expression for the
//! encoded size. The CIR is the only input of the target emitters and
//! carries no host-language constructs. Synthetic names (`chunk0`,
//! `c0`, ...) are drawn from one deterministic counter per record so
//! that emitted code is byte-identical across runs.

use std::collections::HashMap;

use crate::ast;
use crate::layout::{ArrayShape, Chunk, ElementKind, Layout, PayloadShape};
use crate::resolver::Scope;

/// Array element classification shared by loops and field types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElemType {
    Byte,
    Scalar { width: usize },
    Enum { enum_id: String, width: usize },
    Struct { struct_id: String },
}

impl ElemType {
    /// Encoded element size in bytes, when constant by type alone.
    pub fn fixed_bytes(&self) -> Option<usize> {
        match self {
            ElemType::Byte => Some(1),
            ElemType::Scalar { width } | ElemType::Enum { width, .. } => Some(width / 8),
            ElemType::Struct { .. } => None,
        }
    }
}

/// Type of a data member of the generated value types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Scalar { width: usize },
    Enum { enum_id: String, width: usize },
    Struct { struct_id: String },
    /// Opaque byte region: payload, body, or byte array.
    Bytes,
    Array { element: ElemType, count: Option<usize> },
}

#[derive(Debug, Clone)]
pub struct DataField {
    pub id: String,
    pub ty: FieldType,
    pub optional: bool,
    /// Declared by an ancestor packet rather than the record itself.
    pub inherited: bool,
}

/// Symbolic byte length used by `Require` and `TakeSlice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LenExpr {
    Const(usize),
    /// Value of a size or count variable.
    Var(String),
    /// Size variable minus the declared size modifier; parsing fails
    /// when the difference is negative.
    VarMinus { var: String, modifier: i64 },
    /// Count variable times a constant element size.
    VarTimes { var: String, element_bytes: usize },
    /// Lower bound applied to a length (padded arrays).
    MaxConst { expr: Box<LenExpr>, bytes: usize },
    Remaining,
}

/// Symbolic encoded size of record content, used to derive size
/// accessors without serialising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeExpr {
    Const(usize),
    /// Length of an opaque byte field.
    FieldBytes { field: String },
    /// Encoded length of an array field. `element_bytes` is the
    /// constant element size when the element type has one.
    ArrayBytes { field: String, element_bytes: Option<usize> },
    /// Encoded length of a struct field.
    StructBytes { field: String },
    /// Encoded length of an optional field; zero when absent.
    OptionalBytes { field: String, element_bytes: Option<usize> },
    /// Lower bound applied to a size (padded arrays).
    MaxConst { expr: Box<SizeExpr>, bytes: usize },
    Sum(Vec<SizeExpr>),
}

/// Presence condition of an optional field.
#[derive(Debug, Clone)]
pub struct Cond {
    pub var: String,
    pub present_when_set: bool,
}

/// Destination of one bit-packed value extracted from a chunk.
#[derive(Debug, Clone)]
pub enum Sink {
    /// Assign a scalar data field.
    Field { id: String },
    /// Convert and assign an enum data field.
    EnumField { id: String, enum_id: String },
    /// Bind a size variable, in bytes.
    SizeVar { var: String },
    /// Bind a count variable, in elements.
    CountVar { var: String },
    /// Bind a condition variable for a later optional field.
    CondVar { var: String },
    /// Validate a fixed scalar value.
    CheckConst { value: u64 },
    /// Validate a fixed enum tag.
    CheckEnum { enum_id: String, tag_id: String },
    /// Reserved bits.
    Skip,
}

#[derive(Debug, Clone)]
pub struct UnpackField {
    pub shift: usize,
    pub width: usize,
    pub sink: Sink,
}

/// Constraint value fixed by packet inheritance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstValue {
    Scalar(u64),
    Tag { enum_id: String, tag_id: String },
}

#[derive(Debug, Clone)]
pub struct ConstraintCheck {
    pub field: String,
    pub value: ConstValue,
}

/// One step of a parse program. The program operates on an implicit
/// input span; named slices are bound by `TakeSlice`/`TakeTail`.
#[derive(Debug, Clone)]
pub enum ParseOp {
    /// Fail unless at least `bytes` remain in the span.
    Require { bytes: LenExpr },
    /// Read a whole chunk into a synthetic variable and advance.
    ReadChunk { dst: String, width_bytes: usize },
    /// Extract bit-packed values from a chunk variable.
    Unpack { src: String, width_bytes: usize, fields: Vec<UnpackField> },
    /// Advance over reserved bytes.
    Skip { bytes: usize },
    /// Split `len` bytes off the front of the span, or borrow the
    /// prefix of a named slice, into a named slice.
    TakeSlice { dst: String, src: Option<String>, len: LenExpr },
    /// Split all but the trailing `trailer_bytes` into a named slice.
    TakeTail { dst: String, trailer_bytes: usize },
    /// Assign a named slice to an opaque byte field.
    AssignBytes { field: String, src: String },
    /// Parse a struct field from the span; the struct delimits itself.
    ParseStruct { field: String, struct_id: String },
    /// Parse a struct field consuming the whole named slice.
    ParseStructFrom { field: String, struct_id: String, src: String },
    /// Parse `count` array elements from the span or a named slice.
    LoopCount { field: String, count: LenExpr, src: Option<String>, elem: ElemType },
    /// Parse array elements from a named slice until it is empty.
    LoopUntilEmpty { field: String, src: String, elem: ElemType },
    /// Parse a single element guarded by a presence condition.
    Optional { field: String, cond: Cond, elem: ElemType },
    /// Validate the parent view and continue over its payload span.
    ParentCheck { parent_id: String, constraints: Vec<ConstraintCheck> },
}

/// Value packed into an output chunk.
#[derive(Debug, Clone)]
pub enum ValueExpr {
    Field { id: String },
    Const { value: u64 },
    Tag { enum_id: String, tag_id: String },
    /// Encoded size of a region plus the declared modifier.
    Size { expr: SizeExpr, modifier: i64 },
    /// Element count of an array field.
    Count { field: String },
    /// Presence bit of an optional field.
    Presence { field: String, set_value: u64 },
}

#[derive(Debug, Clone)]
pub struct PackField {
    pub shift: usize,
    pub width: usize,
    pub value: ValueExpr,
}

/// One step of a serialise program. The program appends to an implicit
/// output buffer.
#[derive(Debug, Clone)]
pub enum SerOp {
    /// Pack bit fields into a chunk and write it. An empty field list
    /// writes zero bytes (reserved chunks).
    PackChunk { width_bytes: usize, fields: Vec<PackField> },
    /// Append an opaque byte field.
    WriteBytes { field: String },
    /// Serialise a struct field.
    WriteStruct { field: String },
    /// Serialise every element of an array field.
    ForEach { field: String, elem: ElemType },
    /// Serialise an optional field when present.
    WriteOptional { field: String, elem: ElemType },
    /// Append zero bytes until the region written since the matching
    /// content reaches `bytes`.
    PadTo { content: SizeExpr, bytes: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Packet,
    Struct,
}

/// Codec programs of one packet or struct declaration.
#[derive(Debug)]
pub struct Codec {
    pub id: String,
    pub kind: RecordKind,
    pub parent: Option<String>,
    /// Direct children, in declaration order.
    pub children: Vec<String>,
    /// Data members of the generated value types: unconstrained
    /// ancestor fields first, then the record's own fields.
    pub fields: Vec<DataField>,
    pub parse: Vec<ParseOp>,
    pub serialize: Vec<SerOp>,
    /// Total encoded size of the serialise program output.
    pub size: SizeExpr,
}

#[derive(Debug, Clone)]
pub enum EnumTag {
    Value { id: String, value: u64 },
    Range { id: String, start: u64, end: u64, values: Vec<(String, u64)> },
    Default { id: String },
}

#[derive(Debug)]
pub struct EnumDef {
    pub id: String,
    pub width: usize,
    pub tags: Vec<EnumTag>,
    /// Unlisted values are accepted on parse and carried through the
    /// default tag.
    pub open: bool,
    /// The declared tags cover every value of the domain.
    pub complete: bool,
    /// The width is not a whole number of bytes.
    pub truncated: bool,
}

impl EnumDef {
    /// Test whether a parsed value matches a declared tag.
    pub fn contains(&self, value: u64) -> bool {
        self.tags.iter().any(|tag| match tag {
            EnumTag::Value { value: v, .. } => *v == value,
            EnumTag::Range { start, end, .. } => (*start..=*end).contains(&value),
            EnumTag::Default { .. } => false,
        })
    }

    /// Resolve a tag identifier to its value, for tags naming a single
    /// value.
    pub fn tag_value(&self, tag_id: &str) -> Option<u64> {
        self.tags.iter().find_map(|tag| match tag {
            EnumTag::Value { id, value } if id == tag_id => Some(*value),
            EnumTag::Range { values, .. } => values
                .iter()
                .find_map(|(id, value)| (id == tag_id).then_some(*value)),
            _ => None,
        })
    }
}

/// The full lowered file, sole input of the target emitters.
#[derive(Debug)]
pub struct Schema {
    pub namespace: String,
    pub endianness: ast::ByteOrder,
    pub enums: Vec<EnumDef>,
    pub codecs: Vec<Codec>,
}

impl Schema {
    pub fn enum_def(&self, id: &str) -> &EnumDef {
        self.enums.iter().find(|def| def.id == id).expect("unknown enum")
    }

    pub fn codec(&self, id: &str) -> &Codec {
        self.codecs.iter().find(|codec| codec.id == id).expect("unknown codec")
    }
}

fn size_var_name(field_id: &str) -> String {
    format!("{}_size", field_id.trim_matches('_'))
}

fn count_var_name(field_id: &str) -> String {
    format!("{}_count", field_id.trim_matches('_'))
}

fn lower_enum(id: &str, tags: &[ast::Tag], width: usize) -> EnumDef {
    let mut covered: u128 = 0;
    let lowered = tags
        .iter()
        .map(|tag| match tag {
            ast::Tag::Value(tag) => {
                covered += 1;
                EnumTag::Value { id: tag.id.clone(), value: tag.value as u64 }
            }
            ast::Tag::Range(tag) => {
                covered += (*tag.range.end() - *tag.range.start() + 1) as u128;
                EnumTag::Range {
                    id: tag.id.clone(),
                    start: *tag.range.start() as u64,
                    end: *tag.range.end() as u64,
                    values: tag
                        .tags
                        .iter()
                        .map(|tag| (tag.id.clone(), tag.value as u64))
                        .collect(),
                }
            }
            ast::Tag::Other(tag) => EnumTag::Default { id: tag.id.clone() },
        })
        .collect::<Vec<_>>();
    let open = tags.iter().any(|tag| matches!(tag, ast::Tag::Other(_)));
    // Values nested in ranges are already counted by their range.
    let domain = 1u128 << width;
    EnumDef {
        id: id.to_owned(),
        width,
        tags: lowered,
        open,
        complete: covered >= domain,
        truncated: width % 8 != 0,
    }
}

/// Synthetic name allocator, scoped per record.
#[derive(Default)]
struct Names {
    chunks: usize,
    conds: usize,
}

impl Names {
    fn chunk(&mut self) -> String {
        let name = format!("chunk{}", self.chunks);
        self.chunks += 1;
        name
    }

    fn cond(&mut self) -> String {
        let name = format!("c{}", self.conds);
        self.conds += 1;
        name
    }
}

struct Builder<'a> {
    scope: &'a Scope<'a>,
    layout: &'a Layout,
}

impl<'a> Builder<'a> {
    fn elem_type(&self, element: &ElementKind) -> ElemType {
        match element {
            ElementKind::Byte => ElemType::Byte,
            ElementKind::Scalar { width } => ElemType::Scalar { width: *width },
            ElementKind::Enum { enum_id, width } => {
                ElemType::Enum { enum_id: enum_id.clone(), width: *width }
            }
            ElementKind::Sized { struct_id, .. } | ElementKind::Unsized { struct_id } => {
                ElemType::Struct { struct_id: struct_id.clone() }
            }
        }
    }

    /// Collect the data members of the generated value types:
    /// unconstrained ancestor fields first, then the record's own
    /// fields. Condition flags and constrained fields are omitted.
    fn data_fields(&self, decl: &'a ast::Decl) -> Vec<DataField> {
        let constrained: HashMap<&str, ()> = self
            .scope
            .iter_constraints(decl)
            .map(|constraint| (constraint.id.as_str(), ()))
            .collect();

        let mut chain: Vec<&ast::Decl> = self.scope.iter_parents_and_self(decl).collect();
        chain.reverse();

        let mut fields = vec![];
        for ancestor in chain {
            let inherited = ancestor.key != decl.key;
            for field in ancestor.fields() {
                let ty = match &field.desc {
                    ast::FieldDesc::Scalar { width, .. } => FieldType::Scalar { width: *width },
                    ast::FieldDesc::Enum { enum_id, width, .. } => {
                        FieldType::Enum { enum_id: enum_id.clone(), width: *width }
                    }
                    ast::FieldDesc::Struct { struct_id, .. } => {
                        FieldType::Struct { struct_id: struct_id.clone() }
                    }
                    ast::FieldDesc::Array { count, .. } => {
                        let array = &self.layout.record(ancestor.key).arrays[&field.key];
                        match array.element {
                            ElementKind::Byte => FieldType::Bytes,
                            _ => FieldType::Array {
                                element: self.elem_type(&array.element),
                                count: *count,
                            },
                        }
                    }
                    ast::FieldDesc::Payload { .. } | ast::FieldDesc::Body => {
                        // Ancestor payloads carry the child content and
                        // are not data members of the child.
                        if inherited {
                            continue;
                        }
                        fields.push(DataField {
                            id: "payload".to_owned(),
                            ty: FieldType::Bytes,
                            optional: false,
                            inherited: false,
                        });
                        continue;
                    }
                    _ => continue,
                };
                let id = field.id().unwrap();
                if constrained.contains_key(id) {
                    continue;
                }
                fields.push(DataField {
                    id: id.to_owned(),
                    ty,
                    optional: field.cond.is_some(),
                    inherited,
                });
            }
        }
        fields
    }

    /// Size expression of one non-chunk field.
    fn field_size_expr(&self, decl: &ast::Decl, field: &ast::Field) -> Option<SizeExpr> {
        let record = self.layout.record(decl.key);
        match &field.desc {
            _ if field.cond.is_some() => {
                let element_bytes = match &field.desc {
                    ast::FieldDesc::Scalar { width, .. }
                    | ast::FieldDesc::Enum { width, .. } => Some(width / 8),
                    _ => None,
                };
                Some(SizeExpr::OptionalBytes {
                    field: field.id().unwrap().to_owned(),
                    element_bytes,
                })
            }
            ast::FieldDesc::Payload { .. } | ast::FieldDesc::Body => {
                Some(SizeExpr::FieldBytes { field: "payload".to_owned() })
            }
            ast::FieldDesc::Array { id, .. } => {
                let array = &record.arrays[&field.key];
                let expr = match &array.element {
                    ElementKind::Byte => SizeExpr::FieldBytes { field: id.clone() },
                    element => SizeExpr::ArrayBytes {
                        field: id.clone(),
                        element_bytes: self.elem_type(element).fixed_bytes(),
                    },
                };
                Some(match array.padded_bytes {
                    Some(padded) => SizeExpr::MaxConst { expr: Box::new(expr), bytes: padded },
                    None => expr,
                })
            }
            ast::FieldDesc::Struct { id, .. } => Some(SizeExpr::StructBytes { field: id.clone() }),
            _ => None,
        }
    }

    /// Lower the parse program for the record's own fields.
    fn build_parse(&self, decl: &'a ast::Decl, names: &mut Names) -> Vec<ParseOp> {
        let record = self.layout.record(decl.key);
        let mut ops = vec![];
        let mut emitted_chunks = vec![false; record.chunks.len()];
        let mut cond_vars: HashMap<String, String> = HashMap::new();

        // Condition variables are numbered in flag declaration order.
        for field in decl.fields() {
            if let ast::FieldDesc::Flag { id, .. } = &field.desc {
                cond_vars.insert(id.clone(), names.cond());
            }
        }

        for field in decl.fields() {
            if let Some((chunk_index, _)) = record.packed.get(&field.key) {
                if emitted_chunks[*chunk_index] {
                    continue;
                }
                emitted_chunks[*chunk_index] = true;
                self.parse_chunk(
                    decl,
                    &record.chunks[*chunk_index],
                    names,
                    &cond_vars,
                    &mut ops,
                );
                continue;
            }

            match &field.desc {
                _ if field.cond.is_some() => {
                    let slot = record
                        .optionals
                        .iter()
                        .find(|slot| slot.field_key == field.key)
                        .unwrap();
                    let elem = match &field.desc {
                        ast::FieldDesc::Scalar { width, .. } => ElemType::Scalar { width: *width },
                        ast::FieldDesc::Enum { enum_id, width, .. } => {
                            ElemType::Enum { enum_id: enum_id.clone(), width: *width }
                        }
                        ast::FieldDesc::Struct { struct_id, .. } => {
                            ElemType::Struct { struct_id: struct_id.clone() }
                        }
                        _ => unreachable!(),
                    };
                    ops.push(ParseOp::Optional {
                        field: field.id().unwrap().to_owned(),
                        cond: Cond {
                            var: cond_vars[&slot.flag_id].clone(),
                            present_when_set: slot.present_when_set,
                        },
                        elem,
                    });
                }
                ast::FieldDesc::Payload { .. } | ast::FieldDesc::Body => {
                    let slice = "payload_slice".to_owned();
                    match record.payload.as_ref().unwrap() {
                        PayloadShape::VariableSize { size_key: _, modifier } => {
                            let var = match &decl.payload_size().unwrap().desc {
                                ast::FieldDesc::Size { field_id, .. } => size_var_name(field_id),
                                _ => unreachable!(),
                            };
                            let len = LenExpr::VarMinus { var, modifier: *modifier };
                            ops.push(ParseOp::Require { bytes: len.clone() });
                            ops.push(ParseOp::TakeSlice { dst: slice.clone(), src: None, len });
                        }
                        PayloadShape::Trailing { trailer_bytes } => {
                            ops.push(ParseOp::Require {
                                bytes: LenExpr::Const(*trailer_bytes),
                            });
                            ops.push(ParseOp::TakeTail {
                                dst: slice.clone(),
                                trailer_bytes: *trailer_bytes,
                            });
                        }
                        PayloadShape::Terminal => {
                            ops.push(ParseOp::TakeTail { dst: slice.clone(), trailer_bytes: 0 });
                        }
                    }
                    ops.push(ParseOp::AssignBytes { field: "payload".to_owned(), src: slice });
                }
                ast::FieldDesc::Array { id, .. } => {
                    self.parse_array(decl, field, id, &mut ops);
                }
                ast::FieldDesc::Struct { id, struct_id, .. } => {
                    match record.trailers.get(&field.key) {
                        Some(trailer_bytes) => {
                            let slice = format!("{id}_slice");
                            ops.push(ParseOp::Require {
                                bytes: LenExpr::Const(*trailer_bytes),
                            });
                            ops.push(ParseOp::TakeTail {
                                dst: slice.clone(),
                                trailer_bytes: *trailer_bytes,
                            });
                            ops.push(ParseOp::ParseStructFrom {
                                field: id.clone(),
                                struct_id: struct_id.clone(),
                                src: slice,
                            });
                        }
                        None => ops.push(ParseOp::ParseStruct {
                            field: id.clone(),
                            struct_id: struct_id.clone(),
                        }),
                    }
                }
                ast::FieldDesc::Padding { .. } => (),
                desc => unreachable!("unhandled field in CIR lowering: {desc:?}"),
            }
        }
        ops
    }

    fn parse_chunk(
        &self,
        decl: &ast::Decl,
        chunk: &Chunk,
        names: &mut Names,
        cond_vars: &HashMap<String, String>,
        ops: &mut Vec<ParseOp>,
    ) {
        let fields_by_key: HashMap<ast::FieldKey, &ast::Field> =
            decl.fields().map(|field| (field.key, field)).collect();

        let mut unpack = vec![];
        for packed in &chunk.fields {
            let field = fields_by_key[&packed.key];
            let sink = match &field.desc {
                ast::FieldDesc::Scalar { id, .. } => Sink::Field { id: id.clone() },
                ast::FieldDesc::Enum { id, enum_id, .. } => {
                    Sink::EnumField { id: id.clone(), enum_id: enum_id.clone() }
                }
                ast::FieldDesc::FixedScalar { value, .. } => {
                    Sink::CheckConst { value: *value as u64 }
                }
                ast::FieldDesc::FixedEnum { enum_id, tag_id } => {
                    Sink::CheckEnum { enum_id: enum_id.clone(), tag_id: tag_id.clone() }
                }
                ast::FieldDesc::Size { field_id, .. } => {
                    Sink::SizeVar { var: size_var_name(field_id) }
                }
                ast::FieldDesc::Count { field_id, .. } => {
                    Sink::CountVar { var: count_var_name(field_id) }
                }
                ast::FieldDesc::Flag { id, .. } => Sink::CondVar { var: cond_vars[id].clone() },
                ast::FieldDesc::Reserved { .. } => Sink::Skip,
                desc => unreachable!("unexpected packed field: {desc:?}"),
            };
            unpack.push(UnpackField { shift: packed.shift, width: packed.width, sink });
        }

        ops.push(ParseOp::Require { bytes: LenExpr::Const(chunk.width_bytes) });
        if unpack.iter().all(|field| matches!(field.sink, Sink::Skip)) {
            ops.push(ParseOp::Skip { bytes: chunk.width_bytes });
        } else {
            let dst = names.chunk();
            ops.push(ParseOp::ReadChunk { dst: dst.clone(), width_bytes: chunk.width_bytes });
            ops.push(ParseOp::Unpack {
                src: dst,
                width_bytes: chunk.width_bytes,
                fields: unpack,
            });
        }
    }

    fn parse_array(
        &self,
        decl: &ast::Decl,
        field: &ast::Field,
        id: &str,
        ops: &mut Vec<ParseOp>,
    ) {
        let record = self.layout.record(decl.key);
        let array = &record.arrays[&field.key];
        let elem = self.elem_type(&array.element);
        let region = format!("{id}_slice");

        // The length of the encoded region, when bounded.
        let region_len = match &array.shape {
            ArrayShape::ConstantCount { count } => {
                elem.fixed_bytes().map(|bytes| LenExpr::Const(count * bytes))
            }
            ArrayShape::VariableSize { modifier, .. } => {
                Some(LenExpr::VarMinus { var: size_var_name(id), modifier: *modifier })
            }
            ArrayShape::VariableCount { .. } => elem
                .fixed_bytes()
                .map(|bytes| LenExpr::VarTimes { var: count_var_name(id), element_bytes: bytes }),
            ArrayShape::Unknown => None,
        };

        match array.padded_bytes {
            Some(padded) => {
                // The padded region spans a fixed number of bytes;
                // elements occupy a prefix and zero padding is skipped.
                // With dynamically sized elements the region is the
                // declared padding exactly.
                let outer = match &region_len {
                    Some(len) => {
                        LenExpr::MaxConst { expr: Box::new(len.clone()), bytes: padded }
                    }
                    None => LenExpr::Const(padded),
                };
                ops.push(ParseOp::Require { bytes: outer.clone() });
                ops.push(ParseOp::TakeSlice { dst: region.clone(), src: None, len: outer });
                match (&array.element, &array.shape) {
                    (ElementKind::Byte, _) => {
                        let content = format!("{id}_content");
                        ops.push(ParseOp::TakeSlice {
                            dst: content.clone(),
                            src: Some(region),
                            len: region_len.clone().unwrap(),
                        });
                        ops.push(ParseOp::AssignBytes { field: id.to_owned(), src: content });
                    }
                    (_, ArrayShape::ConstantCount { count }) => ops.push(ParseOp::LoopCount {
                        field: id.to_owned(),
                        count: LenExpr::Const(*count),
                        src: Some(region),
                        elem,
                    }),
                    (_, ArrayShape::VariableCount { .. }) => ops.push(ParseOp::LoopCount {
                        field: id.to_owned(),
                        count: LenExpr::Var(count_var_name(id)),
                        src: Some(region),
                        elem,
                    }),
                    (_, ArrayShape::VariableSize { .. }) => {
                        let content = format!("{id}_content");
                        ops.push(ParseOp::TakeSlice {
                            dst: content.clone(),
                            src: Some(region),
                            len: region_len.clone().unwrap(),
                        });
                        ops.push(ParseOp::LoopUntilEmpty {
                            field: id.to_owned(),
                            src: content,
                            elem,
                        });
                    }
                    (_, ArrayShape::Unknown) => unreachable!(),
                }
                // Remaining padding bytes of the region are dropped
                // with the region slice.
            }
            None => match &array.shape {
                ArrayShape::ConstantCount { count } => {
                    if let Some(len) = &region_len {
                        ops.push(ParseOp::Require { bytes: len.clone() });
                    }
                    match array.element {
                        ElementKind::Byte => {
                            ops.push(ParseOp::TakeSlice {
                                dst: region.clone(),
                                src: None,
                                len: LenExpr::Const(*count),
                            });
                            ops.push(ParseOp::AssignBytes { field: id.to_owned(), src: region });
                        }
                        _ => ops.push(ParseOp::LoopCount {
                            field: id.to_owned(),
                            count: LenExpr::Const(*count),
                            src: None,
                            elem,
                        }),
                    }
                }
                ArrayShape::VariableSize { modifier, .. } => {
                    let len = LenExpr::VarMinus { var: size_var_name(id), modifier: *modifier };
                    ops.push(ParseOp::Require { bytes: len.clone() });
                    ops.push(ParseOp::TakeSlice { dst: region.clone(), src: None, len });
                    match array.element {
                        ElementKind::Byte => {
                            ops.push(ParseOp::AssignBytes { field: id.to_owned(), src: region })
                        }
                        _ => ops.push(ParseOp::LoopUntilEmpty {
                            field: id.to_owned(),
                            src: region,
                            elem,
                        }),
                    }
                }
                ArrayShape::VariableCount { .. } => {
                    if let Some(len) = &region_len {
                        ops.push(ParseOp::Require { bytes: len.clone() });
                    }
                    match array.element {
                        ElementKind::Byte => {
                            ops.push(ParseOp::TakeSlice {
                                dst: region.clone(),
                                src: None,
                                len: LenExpr::Var(count_var_name(id)),
                            });
                            ops.push(ParseOp::AssignBytes { field: id.to_owned(), src: region });
                        }
                        _ => ops.push(ParseOp::LoopCount {
                            field: id.to_owned(),
                            count: LenExpr::Var(count_var_name(id)),
                            src: None,
                            elem,
                        }),
                    }
                }
                ArrayShape::Unknown => {
                    let trailer_bytes = record.trailers[&field.key];
                    if trailer_bytes > 0 {
                        ops.push(ParseOp::Require { bytes: LenExpr::Const(trailer_bytes) });
                    }
                    ops.push(ParseOp::TakeTail { dst: region.clone(), trailer_bytes });
                    match array.element {
                        ElementKind::Byte => {
                            ops.push(ParseOp::AssignBytes { field: id.to_owned(), src: region })
                        }
                        _ => ops.push(ParseOp::LoopUntilEmpty {
                            field: id.to_owned(),
                            src: region,
                            elem,
                        }),
                    }
                }
            },
        }
    }

    /// Lower the serialise program of the record's own fields.
    /// `payload` provides the ops and size standing in for the payload
    /// region: the record's own payload bytes for a generic codec, or
    /// the child content for a specialised one.
    fn build_serialize(
        &self,
        decl: &'a ast::Decl,
        constraints: &HashMap<String, ConstValue>,
        payload: (Vec<SerOp>, SizeExpr),
    ) -> (Vec<SerOp>, SizeExpr) {
        let record = self.layout.record(decl.key);
        let mut ops = vec![];
        let mut size_terms = vec![];
        let mut emitted_chunks = vec![false; record.chunks.len()];
        let (payload_ops, payload_size) = payload;
        let mut payload_ops = Some(payload_ops);

        let fields_by_key: HashMap<ast::FieldKey, &ast::Field> =
            decl.fields().map(|field| (field.key, field)).collect();

        for field in decl.fields() {
            if let Some((chunk_index, _)) = record.packed.get(&field.key) {
                if emitted_chunks[*chunk_index] {
                    continue;
                }
                emitted_chunks[*chunk_index] = true;
                let chunk = &record.chunks[*chunk_index];
                let mut pack = vec![];
                for packed in &chunk.fields {
                    let field = fields_by_key[&packed.key];
                    let value = match &field.desc {
                        ast::FieldDesc::Scalar { id, .. } | ast::FieldDesc::Enum { id, .. } => {
                            match constraints.get(id) {
                                Some(ConstValue::Scalar(value)) => {
                                    ValueExpr::Const { value: *value }
                                }
                                Some(ConstValue::Tag { enum_id, tag_id }) => ValueExpr::Tag {
                                    enum_id: enum_id.clone(),
                                    tag_id: tag_id.clone(),
                                },
                                None => ValueExpr::Field { id: id.clone() },
                            }
                        }
                        ast::FieldDesc::FixedScalar { value, .. } => {
                            ValueExpr::Const { value: *value as u64 }
                        }
                        ast::FieldDesc::FixedEnum { enum_id, tag_id } => ValueExpr::Tag {
                            enum_id: enum_id.clone(),
                            tag_id: tag_id.clone(),
                        },
                        ast::FieldDesc::Size { field_id, .. } => {
                            let (expr, modifier) = self.size_source(decl, field_id, &payload_size);
                            ValueExpr::Size { expr, modifier }
                        }
                        ast::FieldDesc::Count { field_id, .. } => {
                            ValueExpr::Count { field: field_id.clone() }
                        }
                        ast::FieldDesc::Flag { optional_field_id, set_value, .. } => {
                            ValueExpr::Presence {
                                field: optional_field_id.clone(),
                                set_value: *set_value as u64,
                            }
                        }
                        ast::FieldDesc::Reserved { .. } => continue,
                        desc => unreachable!("unexpected packed field: {desc:?}"),
                    };
                    pack.push(PackField { shift: packed.shift, width: packed.width, value });
                }
                ops.push(SerOp::PackChunk { width_bytes: chunk.width_bytes, fields: pack });
                size_terms.push(SizeExpr::Const(chunk.width_bytes));
                continue;
            }

            match &field.desc {
                _ if field.cond.is_some() => {
                    let id = field.id().unwrap().to_owned();
                    let elem = match &field.desc {
                        ast::FieldDesc::Scalar { width, .. } => ElemType::Scalar { width: *width },
                        ast::FieldDesc::Enum { enum_id, width, .. } => {
                            ElemType::Enum { enum_id: enum_id.clone(), width: *width }
                        }
                        ast::FieldDesc::Struct { struct_id, .. } => {
                            ElemType::Struct { struct_id: struct_id.clone() }
                        }
                        _ => unreachable!(),
                    };
                    size_terms.push(self.field_size_expr(decl, field).unwrap());
                    ops.push(SerOp::WriteOptional { field: id, elem });
                }
                ast::FieldDesc::Payload { .. } | ast::FieldDesc::Body => {
                    ops.extend(payload_ops.take().expect("duplicate payload field"));
                    size_terms.push(payload_size.clone());
                }
                ast::FieldDesc::Array { id, .. } => {
                    let array = &record.arrays[&field.key];
                    match array.element {
                        ElementKind::Byte => ops.push(SerOp::WriteBytes { field: id.clone() }),
                        _ => ops.push(SerOp::ForEach {
                            field: id.clone(),
                            elem: self.elem_type(&array.element),
                        }),
                    }
                    if let Some(padded) = array.padded_bytes {
                        let content = match &array.element {
                            ElementKind::Byte => SizeExpr::FieldBytes { field: id.clone() },
                            element => SizeExpr::ArrayBytes {
                                field: id.clone(),
                                element_bytes: self.elem_type(element).fixed_bytes(),
                            },
                        };
                        ops.push(SerOp::PadTo { content, bytes: padded });
                    }
                    size_terms.push(self.field_size_expr(decl, field).unwrap());
                }
                ast::FieldDesc::Struct { id, .. } => {
                    ops.push(SerOp::WriteStruct { field: id.clone() });
                    size_terms.push(SizeExpr::StructBytes { field: id.clone() });
                }
                ast::FieldDesc::Padding { .. } => (),
                desc => unreachable!("unhandled field in CIR lowering: {desc:?}"),
            }
        }

        let size = match size_terms.len() {
            0 => SizeExpr::Const(0),
            1 => size_terms.pop().unwrap(),
            _ => SizeExpr::Sum(size_terms),
        };
        (ops, size)
    }

    /// Resolve the region measured by a size field.
    fn size_source(
        &self,
        decl: &ast::Decl,
        field_id: &str,
        payload_size: &SizeExpr,
    ) -> (SizeExpr, i64) {
        if field_id == "_payload_" || field_id == "_body_" {
            let modifier = decl
                .payload()
                .map(|field| match &field.desc {
                    ast::FieldDesc::Payload { size_modifier } => size_modifier.unwrap_or(0),
                    _ => 0,
                })
                .unwrap_or(0);
            return (payload_size.clone(), modifier);
        }
        let field = decl
            .fields()
            .find(|field| field.id() == Some(field_id))
            .expect("unbound size field");
        let record = self.layout.record(decl.key);
        let array = &record.arrays[&field.key];
        let expr = match &array.element {
            ElementKind::Byte => SizeExpr::FieldBytes { field: field_id.to_owned() },
            element => SizeExpr::ArrayBytes {
                field: field_id.to_owned(),
                element_bytes: self.elem_type(element).fixed_bytes(),
            },
        };
        let modifier = match &array.shape {
            ArrayShape::VariableSize { modifier, .. } => *modifier,
            _ => 0,
        };
        (expr, modifier)
    }

    fn constraint_value(&self, decl: &ast::Decl, constraint: &ast::Constraint) -> ConstValue {
        match (&constraint.value, &constraint.tag_id) {
            (Some(value), _) => ConstValue::Scalar(*value as u64),
            (_, Some(tag_id)) => {
                let enum_id = self
                    .scope
                    .iter_fields(decl)
                    .find_map(|field| match &field.desc {
                        ast::FieldDesc::Enum { id, enum_id, .. } if *id == constraint.id => {
                            Some(enum_id.clone())
                        }
                        _ => None,
                    })
                    .expect("constraint on unresolved enum field");
                ConstValue::Tag { enum_id, tag_id: tag_id.clone() }
            }
            _ => unreachable!(),
        }
    }

    fn lower_record(&self, decl: &'a ast::Decl) -> Codec {
        let mut names = Names::default();
        let parent = self.scope.get_parent(decl);

        // Parse program: a specialised codec validates the parent view
        // and continues over its payload.
        let mut parse = vec![];
        if let Some(parent_decl) = parent {
            parse.push(ParseOp::ParentCheck {
                parent_id: parent_decl.id().to_owned(),
                constraints: decl
                    .constraints()
                    .map(|constraint| ConstraintCheck {
                        field: constraint.id.clone(),
                        value: self.constraint_value(parent_decl, constraint),
                    })
                    .collect(),
            });
        }
        parse.extend(self.build_parse(decl, &mut names));

        // Serialise program: ancestors are rendered outside in, the
        // record's own content standing in for each payload.
        let chain_constraints: HashMap<String, ConstValue> = self
            .scope
            .iter_parents_and_self(decl)
            .flat_map(|ancestor| {
                ancestor.constraints().map(|constraint| {
                    (
                        constraint.id.clone(),
                        self.constraint_value(
                            self.scope.get_parent(ancestor).unwrap_or(ancestor),
                            constraint,
                        ),
                    )
                })
            })
            .collect();

        let own_payload = (
            vec![SerOp::WriteBytes { field: "payload".to_owned() }],
            SizeExpr::FieldBytes { field: "payload".to_owned() },
        );
        let (mut serialize, mut size) =
            self.build_serialize(decl, &chain_constraints, own_payload);
        let mut ancestor = parent;
        while let Some(ancestor_decl) = ancestor {
            let (ops, total) = self.build_serialize(
                ancestor_decl,
                &chain_constraints,
                (serialize, size),
            );
            serialize = ops;
            size = total;
            ancestor = self.scope.get_parent(ancestor_decl);
        }

        Codec {
            id: decl.id().to_owned(),
            kind: match &decl.desc {
                ast::DeclDesc::Packet { .. } => RecordKind::Packet,
                _ => RecordKind::Struct,
            },
            parent: parent.map(|parent| parent.id().to_owned()),
            children: self.scope.iter_children(decl).map(|child| child.id().to_owned()).collect(),
            fields: self.data_fields(decl),
            parse,
            serialize,
            size,
        }
    }
}

/// Lower the resolved file into the canonical representation.
pub fn build(file: &ast::File, layout: &Layout) -> Schema {
    let scope = Scope::new(file).expect("CIR lowering over unresolved file");
    let builder = Builder { scope: &scope, layout };

    let mut enums = vec![];
    let mut codecs = vec![];
    for decl in &file.declarations {
        match &decl.desc {
            ast::DeclDesc::Enum { id, tags, width } => enums.push(lower_enum(id, tags, *width)),
            ast::DeclDesc::Packet { .. } | ast::DeclDesc::Struct { .. } => {
                codecs.push(builder.lower_record(decl))
            }
            ast::DeclDesc::Group { .. } => unreachable!("groups survived resolution"),
        }
    }

    Schema {
        namespace: file.namespace.clone(),
        endianness: file.endianness,
        enums,
        codecs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;
    use crate::parser::parse_inline;
    use crate::resolver;

    fn build_str(text: &str) -> Schema {
        let mut db = ast::SourceDatabase::new();
        let file = parse_inline(&mut db, "test.pdl", text.to_owned()).expect("parse error");
        let file = resolver::resolve(&file).expect("resolver error");
        let layout = layout::analyze(&file).expect("layout error");
        build(&file, &layout)
    }

    #[test]
    fn scalar_packet_programs() {
        let schema = build_str(
            r#"
            little_endian_packets
            packet P { a : 8, _size_(_payload_) : 8, _payload_ }
            "#,
        );
        let codec = schema.codec("P");
        assert!(matches!(
            codec.parse.as_slice(),
            [
                ParseOp::Require { .. },
                ParseOp::ReadChunk { .. },
                ParseOp::Unpack { .. },
                ParseOp::Require { .. },
                ParseOp::ReadChunk { .. },
                ParseOp::Unpack { .. },
                ParseOp::Require { .. },
                ParseOp::TakeSlice { .. },
                ParseOp::AssignBytes { .. },
            ]
        ));
        assert!(matches!(
            codec.serialize.as_slice(),
            [
                SerOp::PackChunk { .. },
                SerOp::PackChunk { .. },
                SerOp::WriteBytes { .. },
            ]
        ));
        assert_eq!(
            codec.size,
            SizeExpr::Sum(vec![
                SizeExpr::Const(1),
                SizeExpr::Const(1),
                SizeExpr::FieldBytes { field: "payload".to_owned() },
            ])
        );
    }

    #[test]
    fn packed_chunk_shifts() {
        let schema = build_str(
            r#"
            little_endian_packets
            packet P { a : 7, c : 57 }
            "#,
        );
        let codec = schema.codec("P");
        let ParseOp::Unpack { width_bytes, fields, .. } = &codec.parse[2] else {
            panic!("expected an unpack op, got {:?}", codec.parse[2]);
        };
        assert_eq!(*width_bytes, 8);
        assert_eq!((fields[0].shift, fields[0].width), (0, 7));
        assert_eq!((fields[1].shift, fields[1].width), (7, 57));
    }

    #[test]
    fn reserved_chunks_skip() {
        let schema = build_str(
            r#"
            little_endian_packets
            packet P { _reserved_ : 16, a : 8 }
            "#,
        );
        let codec = schema.codec("P");
        assert!(matches!(
            codec.parse.as_slice(),
            [
                ParseOp::Require { .. },
                ParseOp::Skip { bytes: 2 },
                ParseOp::Require { .. },
                ParseOp::ReadChunk { .. },
                ParseOp::Unpack { .. },
            ]
        ));
    }

    #[test]
    fn child_codec_checks_parent() {
        let schema = build_str(
            r#"
            little_endian_packets
            enum Op : 8 { NOP = 0, SET = 1 }
            packet P { op : Op, _size_(_payload_) : 8, _payload_ }
            packet C : P (op = SET) { value : 32 }
            "#,
        );
        let codec = schema.codec("C");
        let ParseOp::ParentCheck { parent_id, constraints } = &codec.parse[0] else {
            panic!("expected a parent check, got {:?}", codec.parse[0]);
        };
        assert_eq!(parent_id, "P");
        assert_eq!(constraints.len(), 1);
        assert_eq!(
            constraints[0].value,
            ConstValue::Tag { enum_id: "Op".to_owned(), tag_id: "SET".to_owned() }
        );
        // The serialise program renders the parent header with the
        // constraint fixed and the child content as payload.
        let SerOp::PackChunk { fields, .. } = &codec.serialize[0] else {
            panic!("expected a pack op, got {:?}", codec.serialize[0]);
        };
        assert!(matches!(&fields[0].value, ValueExpr::Tag { tag_id, .. } if tag_id == "SET"));
        let SerOp::PackChunk { fields, .. } = &codec.serialize[1] else {
            panic!("expected a pack op, got {:?}", codec.serialize[1]);
        };
        assert!(
            matches!(&fields[0].value, ValueExpr::Size { expr: SizeExpr::Const(4), .. }),
            "unexpected size source: {:?}",
            fields[0].value
        );
        // The constrained parent field is not a data member.
        assert!(!codec.fields.is_empty());
        assert_eq!(codec.fields[0].id, "value");
    }

    #[test]
    fn optional_fields_guarded() {
        let schema = build_str(
            r#"
            little_endian_packets
            packet P {
                c0 : 1,
                c1 : 1,
                _reserved_ : 6,
                a : 8 if c0 = 0,
                b : 32 if c1 = 1,
            }
            "#,
        );
        let codec = schema.codec("P");
        let ParseOp::Unpack { fields, .. } = &codec.parse[2] else {
            panic!("expected an unpack op");
        };
        assert!(matches!(&fields[0].sink, Sink::CondVar { var } if var == "c0"));
        assert!(matches!(&fields[1].sink, Sink::CondVar { var } if var == "c1"));
        let ParseOp::Optional { cond, .. } = &codec.parse[3] else {
            panic!("expected an optional op");
        };
        assert!(!cond.present_when_set);
        let SerOp::PackChunk { fields, .. } = &codec.serialize[0] else {
            panic!("expected a pack op");
        };
        assert!(
            matches!(&fields[0].value, ValueExpr::Presence { set_value: 0, .. }),
            "unexpected flag value: {:?}",
            fields[0].value
        );
    }

    #[test]
    fn enum_flags() {
        let schema = build_str(
            r#"
            little_endian_packets
            enum Closed : 2 { A = 0, B = 1, C = 2, D = 3 }
            enum Open : 8 { X = 0, UNKNOWN = .. }
            packet P { c : Closed, _reserved_ : 6, o : Open }
            "#,
        );
        let closed = schema.enum_def("Closed");
        assert!(closed.complete);
        assert!(!closed.open);
        assert!(closed.truncated);
        let open = schema.enum_def("Open");
        assert!(open.open);
        assert!(!open.complete);
        assert!(!open.truncated);
        assert_eq!(open.tag_value("X"), Some(0));
    }

    #[test]
    fn padded_array_programs() {
        let schema = build_str(
            r#"
            little_endian_packets
            struct S { v : 16 }
            packet P {
                _size_(array) : 8,
                array : S[],
                _padding_ [16],
            }
            "#,
        );
        let codec = schema.codec("P");
        assert!(codec.parse.iter().any(|op| matches!(
            op,
            ParseOp::TakeSlice { len: LenExpr::MaxConst { bytes: 16, .. }, .. }
        )));
        assert!(codec
            .serialize
            .iter()
            .any(|op| matches!(op, SerOp::PadTo { bytes: 16, .. })));
        assert_eq!(
            codec.size,
            SizeExpr::Sum(vec![
                SizeExpr::Const(1),
                SizeExpr::MaxConst {
                    expr: Box::new(SizeExpr::ArrayBytes {
                        field: "array".to_owned(),
                        element_bytes: Some(2),
                    }),
                    bytes: 16,
                },
            ])
        );
    }
}
