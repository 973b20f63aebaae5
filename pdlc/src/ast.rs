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

//! Abstract syntax tree for PDL source files.
//!
//! The tree produced by the parser is untyped: type references are plain
//! identifiers and no semantic property has been checked. The resolver
//! rewrites it in place (splicing groups, splitting typedef references
//! into enum and struct references) but keeps the same node types.

use codespan_reporting::diagnostic;
use codespan_reporting::files;
use serde::Serialize;
use std::fmt;
use std::ops;

/// File identifier, indexing the source database.
pub type FileId = usize;

/// Stores the contents of every compiled source file, for diagnostics.
pub type SourceDatabase = files::SimpleFiles<String, String>;

#[derive(Debug, Default, Copy, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceLocation {
    /// Byte offset into the file (counted from zero).
    pub offset: usize,
    /// Line number (counted from zero).
    pub line: usize,
    /// Column number (counted from zero).
    pub column: usize,
}

#[derive(Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSpan {
    pub file: FileId,
    pub start: SourceLocation,
    pub end: SourceLocation,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Numbered enum tag, e.g. `Foo = 1`.
#[derive(Debug, Clone, Serialize)]
pub struct TagValue {
    pub id: String,
    pub loc: SourceSpan,
    pub value: usize,
}

/// Reserved range of values, e.g. `Foo = 1..10`, with optional
/// nested value tags.
#[derive(Debug, Clone, Serialize)]
pub struct TagRange {
    pub id: String,
    pub loc: SourceSpan,
    pub range: ops::RangeInclusive<usize>,
    pub tags: Vec<TagValue>,
}

/// Catch-all tag, e.g. `Foo = ..`. Its presence makes the enum open:
/// unlisted values are accepted on parse and surfaced through this tag.
#[derive(Debug, Clone, Serialize)]
pub struct TagOther {
    pub id: String,
    pub loc: SourceSpan,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Tag {
    Value(TagValue),
    Range(TagRange),
    Other(TagOther),
}

/// Equality predicate `id = value` or `id = tag`, used both for packet
/// inheritance constraints and for optional field conditions.
#[derive(Debug, Serialize, Clone)]
pub struct Constraint {
    pub id: String,
    pub loc: SourceSpan,
    pub value: Option<usize>,
    pub tag_id: Option<String>,
}

/// Unique identifier for a field node, assigned by the parser and
/// preserved through resolution. Used to key derived layout facts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldKey(pub usize);

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum FieldDesc {
    #[serde(rename = "scalar_field")]
    Scalar { id: String, width: usize },
    #[serde(rename = "reserved_field")]
    Reserved { width: usize },
    #[serde(rename = "fixed_field")]
    FixedScalar { width: usize, value: usize },
    #[serde(rename = "fixed_field")]
    FixedEnum { enum_id: String, tag_id: String },
    #[serde(rename = "size_field")]
    Size { field_id: String, width: usize },
    #[serde(rename = "count_field")]
    Count { field_id: String, width: usize },
    #[serde(rename = "payload_field")]
    Payload { size_modifier: Option<i64> },
    #[serde(rename = "body_field")]
    Body,
    #[serde(rename = "padding_field")]
    Padding { size: usize },
    #[serde(rename = "array_field")]
    Array {
        id: String,
        width: Option<usize>,
        type_id: Option<String>,
        count: Option<usize>,
        size_modifier: Option<i64>,
    },
    /// Reference to a declared type, not yet resolved. The resolver
    /// replaces this variant with `Enum` or `Struct`.
    #[serde(rename = "typedef_field")]
    Typedef { id: String, type_id: String },
    /// Reference to a declared enum type. Produced by the resolver.
    #[serde(rename = "enum_field")]
    Enum { id: String, enum_id: String, width: usize },
    /// Reference to a declared struct type. Produced by the resolver.
    #[serde(rename = "struct_field")]
    Struct { id: String, struct_id: String },
    /// Scalar of width 1 governing the presence of a single optional
    /// field. Produced by the resolver from scalars referenced in
    /// `if` conditions.
    #[serde(rename = "flag_field")]
    Flag { id: String, optional_field_id: String, set_value: usize },
    #[serde(rename = "group_field")]
    Group { group_id: String, constraints: Vec<Constraint> },
}

#[derive(Debug, Serialize, Clone)]
pub struct Field {
    pub loc: SourceSpan,
    #[serde(skip_serializing)]
    pub key: FieldKey,
    #[serde(flatten)]
    pub desc: FieldDesc,
    /// Presence condition for optional fields: names a flag field and
    /// the value (0 or 1) that makes this field present.
    pub cond: Option<Constraint>,
}

/// Unique identifier for a declaration node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeclKey(pub usize);

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum DeclDesc {
    #[serde(rename = "enum_declaration")]
    Enum { id: String, tags: Vec<Tag>, width: usize },
    #[serde(rename = "struct_declaration")]
    Struct { id: String, fields: Vec<Field> },
    #[serde(rename = "packet_declaration")]
    Packet {
        id: String,
        fields: Vec<Field>,
        parent_id: Option<String>,
        constraints: Vec<Constraint>,
    },
    #[serde(rename = "group_declaration")]
    Group { id: String, fields: Vec<Field> },
}

#[derive(Debug, Serialize, Clone)]
pub struct Decl {
    pub loc: SourceSpan,
    #[serde(skip_serializing)]
    pub key: DeclKey,
    #[serde(flatten)]
    pub desc: DeclDesc,
}

#[derive(Debug, Serialize, Clone)]
pub struct File {
    pub file: FileId,
    /// Identifier used as the namespace of the emitted artifacts,
    /// derived from the source file name.
    pub namespace: String,
    pub endianness: ByteOrder,
    pub declarations: Vec<Decl>,
    #[serde(skip_serializing)]
    pub max_key: usize,
}

impl SourceLocation {
    /// Construct a location from a byte offset and the table of line
    /// start offsets. `line_starts[0]` is `0` for any non-empty file.
    pub fn new(offset: usize, line_starts: &[usize]) -> SourceLocation {
        let line = line_starts.partition_point(|start| *start <= offset).saturating_sub(1);
        let column = offset - line_starts.get(line).unwrap_or(&0);
        SourceLocation { offset, line, column }
    }
}

impl SourceSpan {
    pub fn primary(&self) -> diagnostic::Label<FileId> {
        diagnostic::Label::primary(self.file, self.start.offset..self.end.offset)
    }

    pub fn secondary(&self) -> diagnostic::Label<FileId> {
        diagnostic::Label::secondary(self.file, self.start.offset..self.end.offset)
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.line == self.end.line {
            write!(f, "{}:{}-{}", self.start.line, self.start.column, self.end.column)
        } else {
            write!(
                f,
                "{}:{}-{}:{}",
                self.start.line, self.start.column, self.end.line, self.end.column
            )
        }
    }
}

impl fmt::Debug for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSpan").finish_non_exhaustive()
    }
}

impl Eq for TagValue {}
impl PartialEq for TagValue {
    fn eq(&self, other: &Self) -> bool {
        // Structural equality, ignoring source locations.
        self.id == other.id && self.value == other.value
    }
}

impl Eq for TagRange {}
impl PartialEq for TagRange {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.range == other.range && self.tags == other.tags
    }
}

impl Eq for TagOther {}
impl PartialEq for TagOther {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Constraint {}
impl PartialEq for Constraint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.value == other.value && self.tag_id == other.tag_id
    }
}

impl Tag {
    pub fn id(&self) -> &str {
        match self {
            Tag::Value(TagValue { id, .. })
            | Tag::Range(TagRange { id, .. })
            | Tag::Other(TagOther { id, .. }) => id,
        }
    }

    pub fn loc(&self) -> &SourceSpan {
        match self {
            Tag::Value(TagValue { loc, .. })
            | Tag::Range(TagRange { loc, .. })
            | Tag::Other(TagOther { loc, .. }) => loc,
        }
    }

    pub fn value(&self) -> Option<usize> {
        match self {
            Tag::Value(TagValue { value, .. }) => Some(*value),
            Tag::Range(_) | Tag::Other(_) => None,
        }
    }
}

impl Eq for Field {}
impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.desc == other.desc && self.cond == other.cond
    }
}

impl Field {
    pub fn id(&self) -> Option<&str> {
        match &self.desc {
            FieldDesc::Scalar { id, .. }
            | FieldDesc::Array { id, .. }
            | FieldDesc::Typedef { id, .. }
            | FieldDesc::Enum { id, .. }
            | FieldDesc::Struct { id, .. }
            | FieldDesc::Flag { id, .. } => Some(id),
            FieldDesc::Reserved { .. }
            | FieldDesc::FixedScalar { .. }
            | FieldDesc::FixedEnum { .. }
            | FieldDesc::Size { .. }
            | FieldDesc::Count { .. }
            | FieldDesc::Payload { .. }
            | FieldDesc::Body
            | FieldDesc::Padding { .. }
            | FieldDesc::Group { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.desc {
            FieldDesc::Scalar { .. } => "scalar",
            FieldDesc::Reserved { .. } => "reserved",
            FieldDesc::FixedScalar { .. } | FieldDesc::FixedEnum { .. } => "fixed",
            FieldDesc::Size { .. } => "size",
            FieldDesc::Count { .. } => "count",
            FieldDesc::Payload { .. } => "payload",
            FieldDesc::Body => "body",
            FieldDesc::Padding { .. } => "padding",
            FieldDesc::Array { .. } => "array",
            FieldDesc::Typedef { .. } => "typedef",
            FieldDesc::Enum { .. } => "enum",
            FieldDesc::Struct { .. } => "struct",
            FieldDesc::Flag { .. } => "flag",
            FieldDesc::Group { .. } => "group",
        }
    }
}

impl Eq for Decl {}
impl PartialEq for Decl {
    fn eq(&self, other: &Self) -> bool {
        self.desc == other.desc
    }
}

impl Decl {
    pub fn id(&self) -> &str {
        match &self.desc {
            DeclDesc::Enum { id, .. }
            | DeclDesc::Struct { id, .. }
            | DeclDesc::Packet { id, .. }
            | DeclDesc::Group { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.desc {
            DeclDesc::Enum { .. } => "enum",
            DeclDesc::Struct { .. } => "struct",
            DeclDesc::Packet { .. } => "packet",
            DeclDesc::Group { .. } => "group",
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match &self.desc {
            DeclDesc::Packet { parent_id, .. } => parent_id.as_deref(),
            _ => None,
        }
    }

    pub fn fields(&self) -> std::slice::Iter<'_, Field> {
        match &self.desc {
            DeclDesc::Struct { fields, .. }
            | DeclDesc::Packet { fields, .. }
            | DeclDesc::Group { fields, .. } => fields.iter(),
            DeclDesc::Enum { .. } => [].iter(),
        }
    }

    pub fn constraints(&self) -> std::slice::Iter<'_, Constraint> {
        match &self.desc {
            DeclDesc::Packet { constraints, .. } => constraints.iter(),
            _ => [].iter(),
        }
    }

    /// Return the payload or body field of the declaration, if present.
    pub fn payload(&self) -> Option<&Field> {
        self.fields()
            .find(|field| matches!(&field.desc, FieldDesc::Payload { .. } | FieldDesc::Body))
    }

    /// Return the size field governing the payload or body, if present.
    pub fn payload_size(&self) -> Option<&Field> {
        self.fields().find(|field| match &field.desc {
            FieldDesc::Size { field_id, .. } => field_id == "_payload_" || field_id == "_body_",
            _ => false,
        })
    }

    /// Return the size or count field bound to the named array, if present.
    pub fn array_size(&self, id: &str) -> Option<&Field> {
        self.fields().find(|field| match &field.desc {
            FieldDesc::Size { field_id, .. } | FieldDesc::Count { field_id, .. } => field_id == id,
            _ => false,
        })
    }
}

impl Eq for File {}
impl PartialEq for File {
    fn eq(&self, other: &Self) -> bool {
        self.endianness == other.endianness && self.declarations == other.declarations
    }
}

impl File {
    /// Iterate over the direct children of the selected packet.
    /// Unsafe on files with cyclic parent references; the resolver
    /// rejects those before anything downstream calls this.
    pub fn iter_children<'d>(&'d self, decl: &'d Decl) -> impl Iterator<Item = &'d Decl> {
        self.declarations.iter().filter(|other| other.parent_id() == Some(decl.id()))
    }
}
