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

//! Layout analysis.
//!
//! The analyzer derives, for every field of the resolved AST, its
//! layout facts: the byte chunk it packs into together with its bit
//! shift, its size class, the discipline of payload and array regions,
//! the presence bit of optional fields, and the padded region sizes.
//! These facts are the input of the CIR builder.

use codespan_reporting::diagnostic::Diagnostic;
use std::collections::HashMap;

use crate::ast::*;
use crate::report::{Diagnostics, ErrorCode};
use crate::resolver::Scope;

/// Field and declaration size classification, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Constant size known at compile time.
    Constant(usize),
    /// Size determined at runtime by a size or count field.
    Variable,
    /// Size determined only by the extent of the enclosing payload.
    Unknown,
}

impl std::ops::Add for SizeClass {
    type Output = SizeClass;
    fn add(self, rhs: SizeClass) -> SizeClass {
        match (self, rhs) {
            (SizeClass::Unknown, _) | (_, SizeClass::Unknown) => SizeClass::Unknown,
            (SizeClass::Variable, _) | (_, SizeClass::Variable) => SizeClass::Variable,
            (SizeClass::Constant(lhs), SizeClass::Constant(rhs)) => SizeClass::Constant(lhs + rhs),
        }
    }
}

impl std::ops::Mul<usize> for SizeClass {
    type Output = SizeClass;
    fn mul(self, rhs: usize) -> SizeClass {
        match self {
            SizeClass::Constant(lhs) => SizeClass::Constant(lhs * rhs),
            other => other,
        }
    }
}

impl SizeClass {
    /// Return the bit count if the size is constant.
    pub fn constant(&self) -> Option<usize> {
        match self {
            SizeClass::Constant(bits) => Some(*bits),
            _ => None,
        }
    }
}

/// A single field packed inside a chunk.
#[derive(Debug, Clone)]
pub struct PackedField {
    pub key: FieldKey,
    /// Bit offset of the field inside the chunk, counted from the
    /// least significant bit.
    pub shift: usize,
    /// Width of the field in bits.
    pub width: usize,
}

/// A contiguous group of bit-packed fields, rounded to whole bytes and
/// read or written with a single native access.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub width_bytes: usize,
    pub fields: Vec<PackedField>,
}

/// Discipline of the payload region of a record.
#[derive(Debug, Clone)]
pub enum PayloadShape {
    /// The region length is given by a preceding size field, minus the
    /// declared size modifier.
    VariableSize { size_key: FieldKey, modifier: i64 },
    /// No size field; the region runs to the end of the input minus
    /// the constant trailer that follows it.
    Trailing { trailer_bytes: usize },
    /// No size field and nothing after: the region is the rest of the
    /// input.
    Terminal,
}

/// Element classification of an array field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    /// Plain byte elements (`name : 8[]`).
    Byte,
    /// Multi-byte scalar elements.
    Scalar { width: usize },
    /// Enum elements.
    Enum { enum_id: String, width: usize },
    /// Struct elements of constant encoded size.
    Sized { struct_id: String, bytes: usize },
    /// Struct elements that delimit themselves at runtime.
    Unsized { struct_id: String },
}

/// Element count discipline of an array field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayShape {
    ConstantCount { count: usize },
    VariableSize { size_key: FieldKey, modifier: i64 },
    VariableCount { count_key: FieldKey },
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ArrayLayout {
    pub element: ElementKind,
    pub shape: ArrayShape,
    /// Fixed encoded region in bytes when the array is followed by a
    /// padding field.
    pub padded_bytes: Option<usize>,
}

/// Presence bit of one optional field.
#[derive(Debug, Clone)]
pub struct OptionalSlot {
    pub field_key: FieldKey,
    pub flag_id: String,
    /// Bit position of the condition flag inside the bitmap chunk.
    pub bit_index: usize,
    /// Present when the bit is set; otherwise present when clear.
    pub present_when_set: bool,
}

/// Layout facts of one packet or struct declaration.
#[derive(Debug, Default)]
pub struct RecordLayout {
    pub chunks: Vec<Chunk>,
    /// Chunk index and bit shift of every packed field.
    pub packed: HashMap<FieldKey, (usize, usize)>,
    pub payload: Option<PayloadShape>,
    pub arrays: HashMap<FieldKey, ArrayLayout>,
    pub optionals: Vec<OptionalSlot>,
    /// Constant trailer in bytes following each unbounded array or
    /// struct field.
    pub trailers: HashMap<FieldKey, usize>,
}

/// Layout facts for a whole file.
#[derive(Debug, Default)]
pub struct Layout {
    field_size: HashMap<FieldKey, SizeClass>,
    padded_size: HashMap<FieldKey, Option<usize>>,
    decl_size: HashMap<DeclKey, SizeClass>,
    parent_size: HashMap<DeclKey, SizeClass>,
    payload_size: HashMap<DeclKey, SizeClass>,
    records: HashMap<DeclKey, RecordLayout>,
}

impl Layout {
    /// Size class of the selected field, in bits.
    pub fn field_size(&self, key: FieldKey) -> SizeClass {
        self.field_size[&key]
    }

    /// Padded region size in bits, for array fields followed by a
    /// padding field.
    pub fn padded_size(&self, key: FieldKey) -> Option<usize> {
        self.padded_size.get(&key).copied().flatten()
    }

    /// Size class of the declaration's own fields, excluding payload
    /// and inherited fields.
    pub fn decl_size(&self, key: DeclKey) -> SizeClass {
        self.decl_size[&key]
    }

    /// Combined size class of the ancestors' fields.
    pub fn parent_size(&self, key: DeclKey) -> SizeClass {
        self.parent_size[&key]
    }

    /// Size class of the declaration's payload region.
    pub fn payload_size(&self, key: DeclKey) -> SizeClass {
        self.payload_size[&key]
    }

    /// Total encoded size class of the declaration.
    pub fn total_size(&self, key: DeclKey) -> SizeClass {
        self.decl_size(key) + self.parent_size(key) + self.payload_size(key)
    }

    pub fn record(&self, key: DeclKey) -> &RecordLayout {
        &self.records[&key]
    }
}

/// Chunk widths with a native single read or write on every target.
const NATIVE_CHUNK_BYTES: [usize; 6] = [1, 2, 3, 4, 6, 8];

/// Compute field and declaration sizes. Forward references are allowed:
/// referenced declarations are measured on demand.
fn compute_sizes(file: &File, scope: &Scope) -> Layout {
    fn decl_total_size(
        layout: &mut Layout,
        file: &File,
        scope: &Scope,
        decl: &Decl,
    ) -> SizeClass {
        if let Some(size) = layout.decl_size.get(&decl.key) {
            return *size
                + layout.parent_size[&decl.key]
                + layout.payload_size[&decl.key];
        }
        measure_decl(layout, file, scope, decl);
        layout.decl_size[&decl.key]
            + layout.parent_size[&decl.key]
            + layout.payload_size[&decl.key]
    }

    fn measure_field(
        layout: &mut Layout,
        file: &File,
        scope: &Scope,
        decl: &Decl,
        field: &Field,
    ) -> SizeClass {
        let size = match &field.desc {
            _ if field.cond.is_some() => SizeClass::Variable,
            FieldDesc::Scalar { width, .. }
            | FieldDesc::Reserved { width }
            | FieldDesc::FixedScalar { width, .. }
            | FieldDesc::Size { width, .. }
            | FieldDesc::Count { width, .. }
            | FieldDesc::Enum { width, .. } => SizeClass::Constant(*width),
            FieldDesc::Flag { .. } => SizeClass::Constant(1),
            FieldDesc::FixedEnum { enum_id, .. } => match &scope.typedef[enum_id.as_str()].desc {
                DeclDesc::Enum { width, .. } => SizeClass::Constant(*width),
                _ => unreachable!(),
            },
            FieldDesc::Padding { .. } => SizeClass::Constant(0),
            FieldDesc::Payload { .. } | FieldDesc::Body => {
                if decl.payload_size().is_some() {
                    SizeClass::Variable
                } else {
                    SizeClass::Unknown
                }
            }
            FieldDesc::Struct { struct_id, .. } => {
                let struct_decl = scope.typedef[struct_id.as_str()];
                decl_total_size(layout, file, scope, struct_decl)
            }
            FieldDesc::Array { width, type_id, count, .. } => {
                let element_size = match (width, type_id) {
                    (Some(width), _) => SizeClass::Constant(*width),
                    (_, Some(type_id)) => {
                        let element_decl = scope.typedef[type_id.as_str()];
                        decl_total_size(layout, file, scope, element_decl)
                    }
                    _ => unreachable!(),
                };
                match count {
                    Some(count) => element_size * *count,
                    None if decl.array_size(field.id().unwrap()).is_some() => {
                        SizeClass::Variable
                    }
                    None => SizeClass::Unknown,
                }
            }
            FieldDesc::Typedef { .. } | FieldDesc::Group { .. } => {
                unreachable!("unresolved field in layout: {:?}", field.desc)
            }
        };
        layout.field_size.insert(field.key, size);
        size
    }

    fn measure_decl(layout: &mut Layout, file: &File, scope: &Scope, decl: &Decl) {
        if layout.decl_size.contains_key(&decl.key) {
            return;
        }
        // Mark the declaration as measured before recursing; cycles
        // have been rejected by the resolver, except through arrays of
        // dynamically sized elements which are measured as unknown.
        layout.decl_size.insert(decl.key, SizeClass::Constant(0));
        layout.parent_size.insert(decl.key, SizeClass::Constant(0));
        layout.payload_size.insert(decl.key, SizeClass::Constant(0));

        let parent_size = match scope.get_parent(decl) {
            Some(parent) => {
                decl_total_size(layout, file, scope, parent);
                layout.decl_size[&parent.key] + layout.parent_size[&parent.key]
            }
            None => SizeClass::Constant(0),
        };

        // Padding regions, computed from the field that follows the
        // padded array.
        let mut padding = None;
        for field in decl.fields().rev() {
            layout.padded_size.insert(field.key, padding);
            padding = match &field.desc {
                FieldDesc::Padding { size } => Some(8 * *size),
                _ => None,
            };
        }

        let mut decl_size = SizeClass::Constant(0);
        let mut payload_size = SizeClass::Constant(0);
        for field in decl.fields() {
            let field_size = measure_field(layout, file, scope, decl, field);
            match &field.desc {
                FieldDesc::Payload { .. } | FieldDesc::Body => payload_size = field_size,
                _ => {
                    decl_size = decl_size
                        + match layout.padded_size[&field.key] {
                            Some(padding) => SizeClass::Constant(padding),
                            None => field_size,
                        }
                }
            }
        }

        let (decl_size, payload_size) = match &decl.desc {
            DeclDesc::Packet { .. } | DeclDesc::Struct { .. } | DeclDesc::Group { .. } => {
                (decl_size, payload_size)
            }
            DeclDesc::Enum { width, .. } => (SizeClass::Constant(*width), SizeClass::Constant(0)),
        };

        layout.decl_size.insert(decl.key, decl_size);
        layout.parent_size.insert(decl.key, parent_size);
        layout.payload_size.insert(decl.key, payload_size);
    }

    let mut layout = Layout::default();
    for decl in &file.declarations {
        measure_decl(&mut layout, file, scope, decl);
    }
    layout
}

/// Build the chunk list of a record and position its packed fields.
fn pack_chunks(
    layout: &mut Layout,
    scope: &Scope,
    decl: &Decl,
    diagnostics: &mut Diagnostics,
) -> (Vec<Chunk>, HashMap<FieldKey, (usize, usize)>) {
    let mut chunks: Vec<Chunk> = vec![];
    let mut packed: HashMap<FieldKey, (usize, usize)> = HashMap::new();
    let mut acc: Vec<PackedField> = vec![];
    let mut shift = 0;

    let mut close_chunk =
        |acc: &mut Vec<PackedField>, shift: &mut usize, loc: &SourceSpan, diagnostics: &mut Diagnostics| {
            if *shift == 0 {
                return;
            }
            let width_bytes = *shift / 8;
            if !NATIVE_CHUNK_BYTES.contains(&width_bytes) {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::UnsupportedChunkWidth)
                        .with_message(format!(
                            "bit fields group into a chunk of {width_bytes} bytes, which has no native width"
                        ))
                        .with_labels(vec![loc.primary()])
                        .with_notes(vec![
                            "note: chunks must total 1, 2, 3, 4, 6, or 8 bytes".to_owned()
                        ]),
                );
            }
            let index = chunks.len();
            for field in acc.iter() {
                packed.insert(field.key, (index, field.shift));
            }
            chunks.push(Chunk { width_bytes, fields: std::mem::take(acc) });
            *shift = 0;
        };

    for field in decl.fields() {
        if scope.is_bitfield(field) {
            let width = layout.field_size[&field.key].constant().unwrap();
            acc.push(PackedField { key: field.key, shift, width });
            shift += width;
            if shift % 8 == 0 {
                close_chunk(&mut acc, &mut shift, &field.loc, diagnostics);
            }
        } else {
            if shift % 8 != 0 {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::ChunkNotByteAligned)
                        .with_message(format!(
                            "{} field does not start on a byte boundary",
                            field.kind()
                        ))
                        .with_labels(vec![field.loc.primary()]),
                );
                // Recover by flushing the partial chunk.
                shift += 8 - shift % 8;
                close_chunk(&mut acc, &mut shift, &field.loc, diagnostics);
            }
        }
    }
    if shift % 8 != 0 {
        diagnostics.push(
            Diagnostic::error()
                .with_code(ErrorCode::UnalignedRecordSize)
                .with_message(format!(
                    "{} size is not an integral number of bytes",
                    decl.kind()
                ))
                .with_labels(vec![decl.loc.primary()]),
        );
        shift += 8 - shift % 8;
    }
    close_chunk(&mut acc, &mut shift, &decl.loc, diagnostics);

    (chunks, packed)
}

/// Sum the constant encoded size, in bytes, of the fields following
/// `index`. Returns None when a non-constant field follows.
fn trailer_bytes(layout: &Layout, decl: &Decl, index: usize) -> Option<usize> {
    let mut bits = 0;
    for field in decl.fields().skip(index + 1) {
        match layout
            .padded_size(field.key)
            .or_else(|| layout.field_size[&field.key].constant())
        {
            Some(width) => bits += width,
            None => return None,
        }
    }
    Some(bits / 8)
}

fn analyze_record(
    layout: &mut Layout,
    scope: &Scope,
    decl: &Decl,
    diagnostics: &mut Diagnostics,
) {
    let (chunks, packed) = pack_chunks(layout, scope, decl, diagnostics);
    let mut record = RecordLayout { chunks, packed, ..Default::default() };
    let fields: Vec<&Field> = decl.fields().collect();

    // Track the single field allowed to run to the end of the input.
    let mut unbounded: Option<&Field> = None;
    let report_unbounded = |field: &Field,
                                prev: Option<&Field>,
                                diagnostics: &mut Diagnostics| {
        if let Some(prev) = prev {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::VariableTrailer)
                    .with_message(format!(
                        "{} field follows a field of unbounded size",
                        field.kind()
                    ))
                    .with_labels(vec![
                        field.loc.primary(),
                        prev.loc.secondary().with_message(
                            "this field runs to the end of the input".to_owned(),
                        ),
                    ]),
            );
        }
    };

    for (index, field) in fields.iter().copied().enumerate() {
        match &field.desc {
            FieldDesc::Payload { .. } | FieldDesc::Body => {
                record.payload = Some(match decl.payload_size() {
                    Some(size_field) => PayloadShape::VariableSize {
                        size_key: size_field.key,
                        modifier: match &field.desc {
                            FieldDesc::Payload { size_modifier: Some(m) } => *m,
                            _ => 0,
                        },
                    },
                    None => {
                        report_unbounded(field, unbounded, diagnostics);
                        unbounded = Some(field);
                        match trailer_bytes(layout, decl, index) {
                            Some(0) => PayloadShape::Terminal,
                            Some(trailer) => PayloadShape::Trailing { trailer_bytes: trailer },
                            None => {
                                diagnostics.push(
                                    Diagnostic::error()
                                        .with_code(ErrorCode::VariableTrailer)
                                        .with_message(
                                            "fields of non-constant size follow the payload"
                                                .to_owned(),
                                        )
                                        .with_labels(vec![field.loc.primary()]),
                                );
                                PayloadShape::Terminal
                            }
                        }
                    }
                });
            }
            FieldDesc::Array { id, width, type_id, count, size_modifier } => {
                let element = match (width, type_id) {
                    (Some(8), _) => ElementKind::Byte,
                    (Some(width), _) => {
                        if width % 8 != 0 {
                            diagnostics.push(
                                Diagnostic::error()
                                    .with_code(ErrorCode::UnalignedFieldSize)
                                    .with_message(
                                        "array element size is not an integral number of bytes"
                                            .to_owned(),
                                    )
                                    .with_labels(vec![field.loc.primary()]),
                            );
                        }
                        ElementKind::Scalar { width: *width }
                    }
                    (_, Some(type_id)) => match &scope.typedef[type_id.as_str()].desc {
                        DeclDesc::Enum { width, .. } => {
                            if width % 8 != 0 {
                                diagnostics.push(
                                    Diagnostic::error()
                                        .with_code(ErrorCode::UnalignedFieldSize)
                                        .with_message(
                                            "array element size is not an integral number of bytes"
                                                .to_owned(),
                                        )
                                        .with_labels(vec![field.loc.primary()]),
                                );
                            }
                            ElementKind::Enum { enum_id: type_id.clone(), width: *width }
                        }
                        _ => {
                            let element_decl = scope.typedef[type_id.as_str()];
                            match layout.total_size(element_decl.key) {
                                SizeClass::Constant(bits) => ElementKind::Sized {
                                    struct_id: type_id.clone(),
                                    bytes: bits / 8,
                                },
                                SizeClass::Variable => {
                                    ElementKind::Unsized { struct_id: type_id.clone() }
                                }
                                SizeClass::Unknown => {
                                    diagnostics.push(
                                        Diagnostic::error()
                                            .with_code(ErrorCode::UnboundedArrayElement)
                                            .with_message(format!(
                                                "array elements of type `{type_id}` cannot delimit themselves"
                                            ))
                                            .with_labels(vec![field.loc.primary()]),
                                    );
                                    ElementKind::Unsized { struct_id: type_id.clone() }
                                }
                            }
                        }
                    },
                    _ => unreachable!(),
                };

                let shape = if let Some(count) = count {
                    ArrayShape::ConstantCount { count: *count }
                } else {
                    match decl.array_size(id).map(|f| (&f.desc, f.key)) {
                        Some((FieldDesc::Size { .. }, size_key)) => ArrayShape::VariableSize {
                            size_key,
                            modifier: size_modifier.unwrap_or(0),
                        },
                        Some((FieldDesc::Count { .. }, count_key)) => {
                            ArrayShape::VariableCount { count_key }
                        }
                        _ => {
                            report_unbounded(field, unbounded, diagnostics);
                            unbounded = Some(field);
                            match trailer_bytes(layout, decl, index) {
                                Some(trailer) => {
                                    record.trailers.insert(field.key, trailer);
                                }
                                None => diagnostics.push(
                                    Diagnostic::error()
                                        .with_code(ErrorCode::VariableTrailer)
                                        .with_message(
                                            "fields of non-constant size follow an unbounded array"
                                                .to_owned(),
                                        )
                                        .with_labels(vec![field.loc.primary()]),
                                ),
                            }
                            ArrayShape::Unknown
                        }
                    }
                };

                let padded_bytes = layout.padded_size(field.key).map(|bits| bits / 8);
                if padded_bytes.is_some() && shape == ArrayShape::Unknown {
                    diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidPaddingField)
                            .with_message(
                                "padding follows an array of unknown size".to_owned(),
                            )
                            .with_labels(vec![field.loc.primary()]),
                    );
                }
                if let Some(padded) = padded_bytes {
                    let minimum = match (&element, &shape) {
                        (ElementKind::Byte, ArrayShape::ConstantCount { count }) => Some(*count),
                        (ElementKind::Scalar { width }, ArrayShape::ConstantCount { count })
                        | (ElementKind::Enum { width, .. }, ArrayShape::ConstantCount { count }) => {
                            Some(count * width / 8)
                        }
                        (ElementKind::Sized { bytes, .. }, ArrayShape::ConstantCount { count }) => {
                            Some(count * bytes)
                        }
                        _ => None,
                    };
                    if minimum.is_some_and(|minimum| minimum > padded) {
                        diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::PaddedRegionTooSmall)
                                .with_message(format!(
                                    "padded region of {padded} bytes is smaller than the minimum array encoding"
                                ))
                                .with_labels(vec![field.loc.primary()]),
                        );
                    }
                }

                record.arrays.insert(
                    field.key,
                    ArrayLayout { element, shape, padded_bytes },
                );
            }
            FieldDesc::Struct { struct_id, .. } if field.cond.is_none() => {
                let struct_decl = scope.typedef[struct_id.as_str()];
                if layout.total_size(struct_decl.key) == SizeClass::Unknown {
                    report_unbounded(field, unbounded, diagnostics);
                    unbounded = Some(field);
                    match trailer_bytes(layout, decl, index) {
                        Some(trailer) => {
                            record.trailers.insert(field.key, trailer);
                        }
                        None => diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::VariableTrailer)
                                .with_message(
                                    "fields of non-constant size follow an unbounded struct"
                                        .to_owned(),
                                )
                                .with_labels(vec![field.loc.primary()]),
                        ),
                    }
                }
            }
            _ => (),
        }

        // Record the presence bit of optional fields.
        if let Some(cond) = &field.cond {
            let flag = decl
                .fields()
                .find(|f| matches!(&f.desc, FieldDesc::Flag { id, .. } if *id == cond.id))
                .expect("missing condition flag");
            match record.packed.get(&flag.key) {
                Some((chunk_index, bit_index)) => {
                    if let Some(slot) = record.optionals.first() {
                        let (first_chunk, _) = record.packed[&decl
                            .fields()
                            .find(|f| f.id() == Some(slot.flag_id.as_str()))
                            .unwrap()
                            .key];
                        if first_chunk != *chunk_index {
                            diagnostics.push(
                                Diagnostic::error()
                                    .with_code(ErrorCode::InvalidConditionField)
                                    .with_message(
                                        "condition flags do not share a single bitmap chunk"
                                            .to_owned(),
                                    )
                                    .with_labels(vec![field.loc.primary(), flag.loc.secondary()]),
                            );
                        }
                    }
                    record.optionals.push(OptionalSlot {
                        field_key: field.key,
                        flag_id: cond.id.clone(),
                        bit_index: *bit_index,
                        present_when_set: cond.value == Some(1),
                    });
                }
                None => {
                    // The flag did not pack; an alignment error was
                    // already reported.
                }
            }
        }
    }

    layout.records.insert(decl.key, record);
}

/// Layout analysis entry point.
pub fn analyze(file: &File) -> Result<Layout, Diagnostics> {
    let scope = Scope::new(file).expect("layout analysis over unresolved file");
    let mut layout = compute_sizes(file, &scope);
    let mut diagnostics = Diagnostics::default();
    for decl in &file.declarations {
        match &decl.desc {
            DeclDesc::Packet { .. } | DeclDesc::Struct { .. } => {
                analyze_record(&mut layout, &scope, decl, &mut diagnostics)
            }
            _ => (),
        }
    }
    diagnostics.err_or(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_inline;
    use crate::resolver;

    fn layout_str(text: &str) -> (File, Layout) {
        let mut db = SourceDatabase::new();
        let file = parse_inline(&mut db, "test.pdl", text.to_owned()).expect("parse error");
        let file = resolver::resolve(&file).expect("resolver error");
        let layout = analyze(&file).expect("layout error");
        (file, layout)
    }

    macro_rules! raises {
        ($code:ident, $text:literal) => {{
            let mut db = SourceDatabase::new();
            let file = parse_inline(&mut db, "test.pdl", $text.to_owned()).expect("parse error");
            let file = resolver::resolve(&file).expect("resolver error");
            let diagnostics = analyze(&file).err().expect("expected a layout error");
            assert!(!diagnostics.diagnostics.is_empty());
            assert_eq!(
                diagnostics.diagnostics[0].code,
                Some(crate::report::ErrorCode::$code.into())
            );
        }};
    }

    #[test]
    fn single_scalar_chunk() {
        let (file, layout) = layout_str(
            r#"
            little_endian_packets
            packet P { a : 8 }
            "#,
        );
        let record = layout.record(file.declarations[0].key);
        assert_eq!(record.chunks.len(), 1);
        assert_eq!(record.chunks[0].width_bytes, 1);
        assert_eq!(record.chunks[0].fields.len(), 1);
    }

    #[test]
    fn bit_fields_pack_into_one_chunk() {
        // 7 + 57 bits pack into a single 8 byte chunk, the first field
        // in the low bits.
        let (file, layout) = layout_str(
            r#"
            little_endian_packets
            packet P { a : 7, c : 57 }
            "#,
        );
        let record = layout.record(file.declarations[0].key);
        assert_eq!(record.chunks.len(), 1);
        assert_eq!(record.chunks[0].width_bytes, 8);
        let a = &record.chunks[0].fields[0];
        let c = &record.chunks[0].fields[1];
        assert_eq!((a.shift, a.width), (0, 7));
        assert_eq!((c.shift, c.width), (7, 57));
    }

    #[test]
    fn chunks_close_at_byte_boundaries() {
        let (file, layout) = layout_str(
            r#"
            little_endian_packets
            packet P { a : 4, b : 4, c : 16 }
            "#,
        );
        let record = layout.record(file.declarations[0].key);
        assert_eq!(record.chunks.len(), 2);
        assert_eq!(record.chunks[0].width_bytes, 1);
        assert_eq!(record.chunks[1].width_bytes, 2);
    }

    #[test]
    fn chunk_width_five_is_rejected() {
        raises!(
            UnsupportedChunkWidth,
            r#"
            little_endian_packets
            packet P { a : 4, b : 36 }
            "#
        );
    }

    #[test]
    fn misaligned_array_is_rejected() {
        raises!(
            ChunkNotByteAligned,
            r#"
            little_endian_packets
            packet P { a : 4, b : 8[2] }
            "#
        );
    }

    #[test]
    fn unaligned_record_is_rejected() {
        raises!(
            UnalignedRecordSize,
            r#"
            little_endian_packets
            packet P { a : 4 }
            "#
        );
    }

    #[test]
    fn payload_disciplines() {
        let (file, layout) = layout_str(
            r#"
            little_endian_packets
            packet A { _size_(_payload_) : 8, _payload_ }
            packet B { _payload_, crc : 16 }
            packet C { _payload_ }
            "#,
        );
        assert!(matches!(
            layout.record(file.declarations[0].key).payload,
            Some(PayloadShape::VariableSize { .. })
        ));
        assert!(matches!(
            layout.record(file.declarations[1].key).payload,
            Some(PayloadShape::Trailing { trailer_bytes: 2 })
        ));
        assert!(matches!(
            layout.record(file.declarations[2].key).payload,
            Some(PayloadShape::Terminal)
        ));
    }

    #[test]
    fn variable_trailer_is_rejected() {
        raises!(
            VariableTrailer,
            r#"
            little_endian_packets
            packet P { _payload_, a : 8[] }
            "#
        );
    }

    #[test]
    fn array_layouts() {
        let (file, layout) = layout_str(
            r#"
            little_endian_packets
            enum E : 16 { X = 0 }
            struct S { a : 32 }
            packet P {
                _size_(bytes) : 8,
                _count_(words) : 8,
                bytes : 8[],
                words : 16[],
                enums : E[2],
                structs : S[],
            }
            "#,
        );
        let decl = &file.declarations[2];
        let fields: Vec<_> = decl.fields().collect();
        let record = layout.record(decl.key);
        let bytes = &record.arrays[&fields[2].key];
        assert_eq!(bytes.element, ElementKind::Byte);
        assert!(matches!(bytes.shape, ArrayShape::VariableSize { .. }));
        let words = &record.arrays[&fields[3].key];
        assert_eq!(words.element, ElementKind::Scalar { width: 16 });
        assert!(matches!(words.shape, ArrayShape::VariableCount { .. }));
        let enums = &record.arrays[&fields[4].key];
        assert_eq!(
            enums.element,
            ElementKind::Enum { enum_id: "E".to_owned(), width: 16 }
        );
        assert_eq!(enums.shape, ArrayShape::ConstantCount { count: 2 });
        let structs = &record.arrays[&fields[5].key];
        assert_eq!(
            structs.element,
            ElementKind::Sized { struct_id: "S".to_owned(), bytes: 4 }
        );
        assert_eq!(structs.shape, ArrayShape::Unknown);
        assert_eq!(record.trailers[&fields[5].key], 0);
    }

    #[test]
    fn padded_array_region() {
        let (file, layout) = layout_str(
            r#"
            little_endian_packets
            struct S { a : 16 }
            packet P {
                _size_(array) : 8,
                array : S[],
                _padding_ [16],
            }
            "#,
        );
        let decl = &file.declarations[1];
        let fields: Vec<_> = decl.fields().collect();
        let record = layout.record(decl.key);
        assert_eq!(record.arrays[&fields[1].key].padded_bytes, Some(16));
        // The padded region contributes a constant size.
        assert_eq!(layout.decl_size(decl.key), SizeClass::Constant(8 + 16 * 8));
    }

    #[test]
    fn padded_region_too_small() {
        raises!(
            PaddedRegionTooSmall,
            r#"
            little_endian_packets
            packet P {
                array : 16[10],
                _padding_ [4],
            }
            "#
        );
    }

    #[test]
    fn optional_bitmap_positions() {
        let (file, layout) = layout_str(
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
        let record = layout.record(file.declarations[0].key);
        assert_eq!(record.optionals.len(), 2);
        assert_eq!(record.optionals[0].bit_index, 0);
        assert!(!record.optionals[0].present_when_set);
        assert_eq!(record.optionals[1].bit_index, 1);
        assert!(record.optionals[1].present_when_set);
    }

    #[test]
    fn size_classes() {
        let (file, layout) = layout_str(
            r#"
            little_endian_packets
            struct Fixed { a : 16 }
            struct Sized { _size_(_body_) : 8, _body_ }
            struct Open { _body_ }
            packet P { x : Fixed, _payload_ }
            "#,
        );
        assert_eq!(
            layout.total_size(file.declarations[0].key),
            SizeClass::Constant(16)
        );
        assert_eq!(layout.total_size(file.declarations[1].key), SizeClass::Variable);
        assert_eq!(layout.total_size(file.declarations[2].key), SizeClass::Unknown);
        assert_eq!(layout.decl_size(file.declarations[3].key), SizeClass::Constant(16));
        assert_eq!(layout.payload_size(file.declarations[3].key), SizeClass::Unknown);
    }

    #[test]
    fn parent_sizes_accumulate() {
        let (file, layout) = layout_str(
            r#"
            little_endian_packets
            packet A { op : 8, _payload_ }
            packet B : A (op = 1) { x : 16, _payload_ }
            packet C : B { y : 8 }
            "#,
        );
        assert_eq!(layout.parent_size(file.declarations[2].key), SizeClass::Constant(24));
        assert_eq!(layout.decl_size(file.declarations[2].key), SizeClass::Constant(8));
    }
}
