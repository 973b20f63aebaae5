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

//! Rust backend.
//!
//! Renders, for every declaration, an owned value type doubling as the
//! builder (`serialize` + `size`), a borrowing view type with an
//! `is_valid` flag and asserting getters, and for packets with
//! children a dispatch enumeration. The emitted code targets the
//! `pdlc_runtime` crate.

use heck::ToUpperCamelCase;

use crate::ast::ByteOrder;
use crate::cir::*;
use crate::emit::{mask, scalar_bits, Writer};

struct Ctx<'a> {
    schema: &'a Schema,
}

impl<'a> Ctx<'a> {
    fn read_fn(&self) -> &'static str {
        match self.schema.endianness {
            ByteOrder::LittleEndian => "read_le",
            ByteOrder::BigEndian => "read_be",
        }
    }

    fn write_fn(&self) -> &'static str {
        match self.schema.endianness {
            ByteOrder::LittleEndian => "write_le",
            ByteOrder::BigEndian => "write_be",
        }
    }

    fn enum_is_open(&self, enum_id: &str) -> bool {
        self.schema.enum_def(enum_id).open
    }
}

/// Escape Rust keywords used as PDL identifiers.
fn ident(id: &str) -> String {
    match id {
        "as" | "break" | "const" | "continue" | "crate" | "else" | "enum" | "extern" | "false"
        | "fn" | "for" | "if" | "impl" | "in" | "let" | "loop" | "match" | "mod" | "move"
        | "mut" | "pub" | "ref" | "return" | "self" | "static" | "struct" | "super" | "trait"
        | "true" | "type" | "unsafe" | "use" | "where" | "while" | "async" | "await" | "dyn"
        | "try" => format!("r#{id}"),
        _ => id.to_owned(),
    }
}

fn uint_type(width: usize) -> String {
    format!("u{}", scalar_bits(width))
}

fn tag_name(tag_id: &str) -> String {
    tag_id.to_upper_camel_case()
}

/// Storage type of a data member inside the view struct.
fn view_type(field: &DataField) -> String {
    let base = match &field.ty {
        FieldType::Scalar { width } => uint_type(*width),
        FieldType::Enum { enum_id, .. } => enum_id.clone(),
        FieldType::Struct { struct_id } => format!("{struct_id}View<'a>"),
        FieldType::Bytes => "Slice<'a>".to_owned(),
        FieldType::Array { element, .. } => format!("Vec<{}>", element_view_type(element)),
    };
    match &field.ty {
        FieldType::Scalar { .. } if field.optional => format!("Option<{base}>"),
        FieldType::Enum { .. } | FieldType::Struct { .. } => format!("Option<{base}>"),
        _ => base,
    }
}

fn element_view_type(element: &ElemType) -> String {
    match element {
        ElemType::Byte => "u8".to_owned(),
        ElemType::Scalar { width } => uint_type(*width),
        ElemType::Enum { enum_id, .. } => enum_id.clone(),
        ElemType::Struct { struct_id } => format!("{struct_id}View<'a>"),
    }
}

/// Default value of a view member before parsing.
fn view_default(field: &DataField) -> &'static str {
    match &field.ty {
        FieldType::Scalar { .. } if field.optional => "None",
        FieldType::Scalar { .. } => "0",
        FieldType::Enum { .. } | FieldType::Struct { .. } => "None",
        FieldType::Bytes => "Slice::new(&[])",
        FieldType::Array { .. } => "Vec::new()",
    }
}

/// Type of a data member of the owned value type.
fn value_type(field: &DataField) -> String {
    let base = match &field.ty {
        FieldType::Scalar { width } => uint_type(*width),
        FieldType::Enum { enum_id, .. } => enum_id.clone(),
        FieldType::Struct { struct_id } => struct_id.clone(),
        FieldType::Bytes => "Vec<u8>".to_owned(),
        FieldType::Array { element, .. } => format!("Vec<{}>", element_value_type(element)),
    };
    if field.optional {
        format!("Option<{base}>")
    } else {
        base
    }
}

fn element_value_type(element: &ElemType) -> String {
    match element {
        ElemType::Byte => "u8".to_owned(),
        ElemType::Scalar { width } => uint_type(*width),
        ElemType::Enum { enum_id, .. } => enum_id.clone(),
        ElemType::Struct { struct_id } => struct_id.clone(),
    }
}

fn generate_enum(w: &mut Writer, def: &EnumDef) {
    let ty = uint_type(def.width);
    w.line("#[derive(Debug, Clone, Copy, PartialEq, Eq)]");
    w.open(format!("pub enum {} {{", def.id));
    for tag in &def.tags {
        match tag {
            EnumTag::Value { id, .. } => w.line(format!("{},", tag_name(id))),
            EnumTag::Range { id, values, .. } => {
                for (id, _) in values {
                    w.line(format!("{},", tag_name(id)));
                }
                w.line(format!("{}({}),", tag_name(id), ty));
            }
            EnumTag::Default { id } => w.line(format!("{}({}),", tag_name(id), ty)),
        }
    }
    w.close("}");
    w.blank();

    w.open(format!("impl {} {{", def.id));
    if def.open {
        w.open(format!("pub fn from_raw(raw: {ty}) -> {} {{", def.id));
    } else {
        w.open(format!("pub fn try_from_raw(raw: {ty}) -> Option<{}> {{", def.id));
    }
    let wrap = |variant: String| {
        if def.open {
            variant
        } else {
            format!("Some({variant})")
        }
    };
    w.open("match raw {");
    for tag in &def.tags {
        match tag {
            EnumTag::Value { id, value } => w.line(format!(
                "{:#x} => {},",
                value,
                wrap(format!("{}::{}", def.id, tag_name(id)))
            )),
            EnumTag::Range { id, start, end, values } => {
                for (id, value) in values {
                    w.line(format!(
                        "{:#x} => {},",
                        value,
                        wrap(format!("{}::{}", def.id, tag_name(id)))
                    ));
                }
                w.line(format!(
                    "{:#x}..={:#x} => {},",
                    start,
                    end,
                    wrap(format!("{}::{}(raw)", def.id, tag_name(id)))
                ));
            }
            EnumTag::Default { .. } => (),
        }
    }
    match def.tags.iter().find(|tag| matches!(tag, EnumTag::Default { .. })) {
        Some(EnumTag::Default { id }) => {
            w.line(format!("_ => {}::{}(raw),", def.id, tag_name(id)))
        }
        _ => w.line("_ => None,"),
    }
    w.close("}");
    w.close("}");
    w.blank();

    w.open(format!("pub fn to_raw(self) -> {ty} {{"));
    w.open("match self {");
    for tag in &def.tags {
        match tag {
            EnumTag::Value { id, value } => {
                w.line(format!("{}::{} => {:#x},", def.id, tag_name(id), value))
            }
            EnumTag::Range { id, values, .. } => {
                for (id, value) in values {
                    w.line(format!("{}::{} => {:#x},", def.id, tag_name(id), value));
                }
                w.line(format!("{}::{}(raw) => raw,", def.id, tag_name(id)));
            }
            EnumTag::Default { id } => {
                w.line(format!("{}::{}(raw) => raw,", def.id, tag_name(id)))
            }
        }
    }
    w.close("}");
    w.close("}");
    w.close("}");
    w.blank();
}

/// Render a length expression; guard statements are only emitted for
/// the `Require` op preceding the use.
fn len_expr(len: &LenExpr) -> String {
    match len {
        LenExpr::Const(n) => format!("{n}"),
        LenExpr::Var(var) => var.clone(),
        LenExpr::VarMinus { var, modifier } => match modifier {
            0 => var.clone(),
            m if *m > 0 => format!("({var} - {m})"),
            m => format!("({var} + {})", -m),
        },
        LenExpr::VarTimes { var, element_bytes } => format!("({var} * {element_bytes})"),
        LenExpr::MaxConst { expr, bytes } => {
            format!("usize::max({}, {})", len_expr(expr), bytes)
        }
        LenExpr::Remaining => "span.size()".to_owned(),
    }
}

/// Guard statements required before evaluating a length expression.
fn len_guards(len: &LenExpr, out: &mut Vec<String>) {
    match len {
        LenExpr::VarMinus { var, modifier } if *modifier > 0 => {
            out.push(format!("if {var} < {modifier} {{ return false; }}"));
        }
        LenExpr::MaxConst { expr, .. } => len_guards(expr, out),
        _ => (),
    }
}

fn size_expr(expr: &SizeExpr, receiver: &str) -> String {
    match expr {
        SizeExpr::Const(n) => format!("{n}"),
        SizeExpr::FieldBytes { field } => format!("{receiver}.{}.len()", ident(field)),
        SizeExpr::ArrayBytes { field, element_bytes: Some(bytes) } => {
            format!("{receiver}.{}.len() * {bytes}", ident(field))
        }
        SizeExpr::ArrayBytes { field, element_bytes: None } => {
            format!("{receiver}.{}.iter().map(|element| element.size()).sum::<usize>()", ident(field))
        }
        SizeExpr::StructBytes { field } => format!("{receiver}.{}.size()", ident(field)),
        SizeExpr::OptionalBytes { field, element_bytes: Some(bytes) } => {
            format!("if {receiver}.{}.is_some() {{ {bytes} }} else {{ 0 }}", ident(field))
        }
        SizeExpr::OptionalBytes { field, element_bytes: None } => {
            format!("{receiver}.{}.as_ref().map(|element| element.size()).unwrap_or(0)", ident(field))
        }
        SizeExpr::MaxConst { expr, bytes } => {
            format!("usize::max({}, {})", size_expr(expr, receiver), bytes)
        }
        SizeExpr::Sum(terms) => {
            let mut parts = vec![];
            let mut constant = 0;
            for term in terms {
                match term {
                    SizeExpr::Const(n) => constant += n,
                    SizeExpr::OptionalBytes { .. } => {
                        parts.push(format!("({})", size_expr(term, receiver)))
                    }
                    term => parts.push(size_expr(term, receiver)),
                }
            }
            if constant > 0 || parts.is_empty() {
                parts.insert(0, format!("{constant}"));
            }
            parts.join(" + ")
        }
    }
}

fn generate_codec(ctx: &Ctx, w: &mut Writer, codec: &Codec) {
    generate_value_type(ctx, w, codec);
    generate_view_type(ctx, w, codec);
    if !codec.children.is_empty() {
        generate_child_enum(w, codec);
    }
}

fn generate_value_type(ctx: &Ctx, w: &mut Writer, codec: &Codec) {
    let id = &codec.id;
    w.line("#[derive(Debug, Clone, PartialEq, Eq)]");
    w.open(format!("pub struct {id} {{"));
    for field in &codec.fields {
        w.line(format!("pub {}: {},", ident(&field.id), value_type(field)));
    }
    w.close("}");
    w.blank();

    w.open(format!("impl {id} {{"));
    w.open("pub fn size(&self) -> usize {");
    w.line(size_expr(&codec.size, "self"));
    w.close("}");
    w.blank();

    let out_unused = codec.serialize.is_empty();
    w.open(format!(
        "pub fn serialize(&self, {}: &mut Builder) {{",
        if out_unused { "_out" } else { "out" }
    ));
    let mut chunk_index = 0;
    for op in &codec.serialize {
        generate_ser_op(ctx, w, codec, op, &mut chunk_index);
    }
    w.close("}");
    w.blank();

    w.open("pub fn serialize_to_vec(&self) -> Vec<u8> {");
    w.line("let mut out = Builder::with_capacity(self.size());");
    w.line("self.serialize(&mut out);");
    w.line("out.into_vec()");
    w.close("}");
    w.close("}");
    w.blank();
}

fn pack_value(codec: &Codec, value: &ValueExpr) -> String {
    match value {
        ValueExpr::Field { id } => {
            let field = codec.fields.iter().find(|field| field.id == *id).unwrap();
            match &field.ty {
                FieldType::Enum { .. } => format!("(self.{}.to_raw() as u64)", ident(id)),
                _ => format!("(self.{} as u64)", ident(id)),
            }
        }
        ValueExpr::Const { value } => format!("{value:#x}"),
        ValueExpr::Tag { enum_id, tag_id } => {
            format!("({}::{}.to_raw() as u64)", enum_id, tag_name(tag_id))
        }
        ValueExpr::Size { expr, modifier } => {
            let size = size_expr(expr, "self");
            match modifier {
                0 => format!("(({size}) as u64)"),
                m if *m > 0 => format!("((({size}) + {m}) as u64)"),
                m => format!("((({size}) - {}) as u64)", -m),
            }
        }
        ValueExpr::Count { field } => format!("(self.{}.len() as u64)", ident(field)),
        ValueExpr::Presence { field, set_value } => {
            if *set_value == 1 {
                format!("(if self.{}.is_some() {{ 1u64 }} else {{ 0u64 }})", ident(field))
            } else {
                format!("(if self.{}.is_some() {{ 0u64 }} else {{ 1u64 }})", ident(field))
            }
        }
    }
}

fn generate_ser_op(ctx: &Ctx, w: &mut Writer, codec: &Codec, op: &SerOp, chunk_index: &mut usize) {
    let write = ctx.write_fn();
    match op {
        SerOp::PackChunk { width_bytes, fields } => {
            if fields.is_empty() {
                w.line(format!("out.append_zeroes({width_bytes});"));
                return;
            }
            let chunk = format!("chunk{}", chunk_index);
            *chunk_index += 1;
            let parts: Vec<String> = fields
                .iter()
                .map(|field| {
                    let value = format!(
                        "({} & {})",
                        pack_value(codec, &field.value),
                        mask(field.width)
                    );
                    if field.shift > 0 {
                        format!("({} << {})", value, field.shift)
                    } else {
                        value
                    }
                })
                .collect();
            w.line(format!("let {chunk}: u64 = {};", parts.join(" | ")));
            w.line(format!("out.{write}::<{width_bytes}>({chunk});"));
        }
        SerOp::WriteBytes { field } => {
            w.line(format!("out.append_bytes(&self.{});", ident(field)))
        }
        SerOp::WriteStruct { field } => w.line(format!("self.{}.serialize(out);", ident(field))),
        SerOp::ForEach { field, elem } => {
            w.open(format!("for element in &self.{} {{", ident(field)));
            match elem {
                ElemType::Byte => w.line("out.append_bytes(&[*element]);"),
                ElemType::Scalar { width } => {
                    w.line(format!("out.{write}::<{}>(*element as u64);", width / 8))
                }
                ElemType::Enum { width, .. } => {
                    w.line(format!("out.{write}::<{}>(element.to_raw() as u64);", width / 8))
                }
                ElemType::Struct { .. } => w.line("element.serialize(out);"),
            }
            w.close("}");
        }
        SerOp::WriteOptional { field, elem } => {
            w.open(format!("if let Some(element) = &self.{} {{", ident(field)));
            match elem {
                ElemType::Byte => w.line("out.append_bytes(&[*element]);"),
                ElemType::Scalar { width } => {
                    w.line(format!("out.{write}::<{}>(*element as u64);", width / 8))
                }
                ElemType::Enum { width, .. } => {
                    w.line(format!("out.{write}::<{}>(element.to_raw() as u64);", width / 8))
                }
                ElemType::Struct { .. } => w.line("element.serialize(out);"),
            }
            w.close("}");
        }
        SerOp::PadTo { content, bytes } => {
            w.line(format!("let content_size = {};", size_expr(content, "self")));
            w.open(format!("if content_size < {bytes} {{"));
            w.line(format!("out.append_zeroes({bytes} - content_size);"));
            w.close("}");
        }
    }
}

fn generate_view_type(ctx: &Ctx, w: &mut Writer, codec: &Codec) {
    let id = &codec.id;
    let view = format!("{id}View");

    w.line("#[derive(Debug, Clone)]");
    w.open(format!("pub struct {view}<'a> {{"));
    w.line("bytes: Slice<'a>,");
    w.line("valid: bool,");
    for field in &codec.fields {
        w.line(format!("{}: {},", ident(&field.id), view_type(field)));
    }
    w.close("}");
    w.blank();

    w.open(format!("impl<'a> {view}<'a> {{"));

    // Constructors.
    let (own_ops, parent_check) = match codec.parse.first() {
        Some(ParseOp::ParentCheck { parent_id, constraints }) => {
            (&codec.parse[1..], Some((parent_id, constraints)))
        }
        _ => (&codec.parse[..], None),
    };

    let invalid_init = |w: &mut Writer, codec: &Codec, bytes: &str| {
        w.open(format!("let mut view = {view} {{"));
        w.line(format!("bytes: {bytes},"));
        w.line("valid: false,");
        for field in &codec.fields {
            w.line(format!("{}: {},", ident(&field.id), view_default(field)));
        }
        w.close("};");
    };

    match parent_check {
        None => {
            w.open(format!("pub fn parse(bytes: &'a [u8]) -> {view}<'a> {{"));
            w.line("let mut span = Slice::new(bytes);");
            w.line("Self::parse_mut(&mut span)");
            w.close("}");
            w.blank();

            w.open(format!("pub fn parse_mut(span: &mut Slice<'a>) -> {view}<'a> {{"));
            w.line("let start = *span;");
            invalid_init(w, codec, "start");
            w.open("if !view.fill(span) {");
            w.line("*span = start;");
            w.line("return view;");
            w.close("}");
            w.line("view.bytes = start.subrange(0, start.size() - span.size());");
            w.line("view.valid = true;");
            w.line("view");
            w.close("}");
        }
        Some((parent_id, constraints)) => {
            let parent_view = format!("{parent_id}View");
            w.open(format!(
                "pub fn parse(parent: &{parent_view}<'a>) -> {view}<'a> {{"
            ));
            invalid_init(w, codec, "parent.bytes");
            w.open("if !parent.is_valid() {");
            w.line("return view;");
            w.close("}");
            for check in constraints {
                let actual = format!("parent.{}()", ident(&check.field));
                let expected = match &check.value {
                    ConstValue::Scalar(value) => format!("{value:#x}"),
                    ConstValue::Tag { enum_id, tag_id } => {
                        format!("{}::{}", enum_id, tag_name(tag_id))
                    }
                };
                w.open(format!("if {actual} != {expected} {{"));
                w.line("return view;");
                w.close("}");
            }
            for field in codec.fields.iter().filter(|field| field.inherited) {
                let copy = match (&field.ty, field.optional) {
                    (FieldType::Scalar { .. }, _) => format!("parent.{}()", ident(&field.id)),
                    (FieldType::Enum { .. }, false) => format!("Some(parent.{}())", ident(&field.id)),
                    (FieldType::Enum { .. }, true) => format!("parent.{}()", ident(&field.id)),
                    (FieldType::Struct { .. }, false) => {
                        format!("Some(parent.{}().clone())", ident(&field.id))
                    }
                    (FieldType::Struct { .. }, true) => format!("parent.{}().cloned()", ident(&field.id)),
                    (FieldType::Bytes, _) => format!("Slice::new(parent.{}())", ident(&field.id)),
                    (FieldType::Array { .. }, _) => format!("parent.{}().to_vec()", ident(&field.id)),
                };
                w.line(format!("view.{} = {};", ident(&field.id), copy));
            }
            let parent_codec = ctx.schema.codec(parent_id);
            if parent_codec.fields.iter().any(|field| field.id == "payload") {
                w.line("let mut span = parent.payload;");
            } else {
                w.line("let mut span = Slice::new(&[]);");
            }
            w.open("if !view.fill(&mut span) {");
            w.line("return view;");
            w.close("}");
            w.line("view.valid = true;");
            w.line("view");
            w.close("}");
        }
    }
    w.blank();

    // Parse body.
    let span_name = if own_ops.is_empty() { "_span" } else { "span" };
    w.open(format!(
        "fn fill(&mut self, {span_name}: &mut Slice<'a>) -> bool {{"
    ));
    for op in own_ops {
        generate_parse_op(ctx, w, op);
    }
    w.line("true");
    w.close("}");
    w.blank();

    // Accessors.
    w.open("pub fn is_valid(&self) -> bool {");
    w.line("self.valid");
    w.close("}");
    w.blank();
    w.open("pub fn bytes(&self) -> &'a [u8] {");
    w.line("self.bytes.bytes()");
    w.close("}");
    for field in &codec.fields {
        w.blank();
        let id = ident(&field.id);
        let (ret, body) = match (&field.ty, field.optional) {
            (FieldType::Scalar { width }, false) => {
                (uint_type(*width), format!("self.{id}"))
            }
            (FieldType::Scalar { width }, true) => {
                (format!("Option<{}>", uint_type(*width)), format!("self.{id}"))
            }
            (FieldType::Enum { enum_id, .. }, false) => {
                (enum_id.clone(), format!("self.{id}.unwrap()"))
            }
            (FieldType::Enum { enum_id, .. }, true) => {
                (format!("Option<{enum_id}>"), format!("self.{id}"))
            }
            (FieldType::Struct { struct_id }, false) => (
                format!("&{struct_id}View<'a>"),
                format!("self.{id}.as_ref().unwrap()"),
            ),
            (FieldType::Struct { struct_id }, true) => (
                format!("Option<&{struct_id}View<'a>>"),
                format!("self.{id}.as_ref()"),
            ),
            (FieldType::Bytes, _) => ("&'a [u8]".to_owned(), format!("self.{id}.bytes()")),
            (FieldType::Array { element, .. }, _) => (
                format!("&[{}]", element_view_type(element)),
                format!("&self.{id}"),
            ),
        };
        w.open(format!("pub fn {id}(&self) -> {ret} {{"));
        w.line("assert!(self.valid);");
        w.line(body);
        w.close("}");
    }
    w.close("}");
    w.blank();
}

fn element_parse(
    ctx: &Ctx,
    w: &mut Writer,
    elem: &ElemType,
    src: &str,
    assign: &dyn Fn(&str) -> String,
) {
    let read = ctx.read_fn();
    match elem {
        ElemType::Byte => {
            w.open(format!("if {src}.size() < 1 {{"));
            w.line("return false;");
            w.close("}");
            w.line(assign(&format!("{src}.{read}::<1>() as u8")));
        }
        ElemType::Scalar { width } => {
            let bytes = width / 8;
            w.open(format!("if {src}.size() < {bytes} {{"));
            w.line("return false;");
            w.close("}");
            w.line(assign(&format!(
                "{src}.{read}::<{bytes}>() as {}",
                uint_type(*width)
            )));
        }
        ElemType::Enum { enum_id, width } => {
            let bytes = width / 8;
            w.open(format!("if {src}.size() < {bytes} {{"));
            w.line("return false;");
            w.close("}");
            let raw = format!("{src}.{read}::<{bytes}>() as {}", uint_type(*width));
            if ctx.enum_is_open(enum_id) {
                w.line(assign(&format!("{enum_id}::from_raw({raw})")));
            } else {
                w.open(format!("let element = match {enum_id}::try_from_raw({raw}) {{"));
                w.line("Some(element) => element,");
                w.line("None => return false,");
                w.close("};");
                w.line(assign("element"));
            }
        }
        ElemType::Struct { struct_id } => {
            w.line(format!(
                "let element = {struct_id}View::parse_mut({});",
                if src == "span" { "span".to_owned() } else { format!("&mut {src}") }
            ));
            w.open("if !element.is_valid() {");
            w.line("return false;");
            w.close("}");
            w.line(assign("element"));
        }
    }
}

fn generate_parse_op(ctx: &Ctx, w: &mut Writer, op: &ParseOp) {
    let read = ctx.read_fn();
    match op {
        ParseOp::Require { bytes } => {
            let mut guards = vec![];
            len_guards(bytes, &mut guards);
            for guard in guards {
                w.line(guard);
            }
            w.open(format!("if span.size() < {} {{", len_expr(bytes)));
            w.line("return false;");
            w.close("}");
        }
        ParseOp::ReadChunk { dst, width_bytes } => {
            w.line(format!("let {dst} = span.{read}::<{width_bytes}>();"));
        }
        ParseOp::Unpack { src, width_bytes, fields } => {
            for field in fields {
                let chunk_bits = width_bytes * 8;
                let mut value = src.clone();
                if field.shift > 0 {
                    value = format!("({value} >> {})", field.shift);
                }
                if field.shift + field.width < chunk_bits {
                    value = format!("({value} & {})", mask(field.width));
                }
                let ty = uint_type(field.width);
                match &field.sink {
                    Sink::Field { id } => {
                        w.line(format!("self.{} = {value} as {ty};", ident(id)))
                    }
                    Sink::EnumField { id, enum_id } => {
                        if ctx.enum_is_open(enum_id) {
                            w.line(format!(
                                "self.{} = Some({enum_id}::from_raw({value} as {ty}));", ident(id)
                            ));
                        } else {
                            w.open(format!(
                                "match {enum_id}::try_from_raw({value} as {ty}) {{"
                            ));
                            w.line(format!("Some(value) => self.{} = Some(value),", ident(id)));
                            w.line("None => return false,");
                            w.close("}");
                        }
                    }
                    Sink::SizeVar { var } | Sink::CountVar { var } => {
                        w.line(format!("let {var} = {value} as usize;"));
                    }
                    Sink::CondVar { var } => w.line(format!("let {var} = {value} as u8;")),
                    Sink::CheckConst { value: expected } => {
                        w.open(format!("if {value} != {expected:#x} {{"));
                        w.line("return false;");
                        w.close("}");
                    }
                    Sink::CheckEnum { enum_id, tag_id } => {
                        w.open(format!(
                            "if {value} as {ty} != {enum_id}::{}.to_raw() {{",
                            tag_name(tag_id)
                        ));
                        w.line("return false;");
                        w.close("}");
                    }
                    Sink::Skip => (),
                }
            }
        }
        ParseOp::Skip { bytes } => w.line(format!("span.skip({bytes});")),
        ParseOp::TakeSlice { dst, src, len } => match src {
            None => {
                let len = len_expr(len);
                w.line(format!("let {dst} = span.subrange(0, {len});"));
                w.line(format!("span.skip({len});"));
            }
            Some(src) => {
                w.line(format!("let {dst} = {src}.subrange(0, {});", len_expr(len)));
            }
        },
        ParseOp::TakeTail { dst, trailer_bytes } => {
            if *trailer_bytes == 0 {
                w.line(format!("let {dst} = span.subrange(0, span.size());"));
                w.line("span.clear();");
            } else {
                w.line(format!("let tail_size = span.size() - {trailer_bytes};"));
                w.line(format!("let {dst} = span.subrange(0, tail_size);"));
                w.line("span.skip(tail_size);");
            }
        }
        ParseOp::AssignBytes { field, src } => {
            w.line(format!("self.{} = {src};", ident(field)));
        }
        ParseOp::ParseStruct { field, struct_id } => {
            w.line(format!("let value = {struct_id}View::parse_mut(span);"));
            w.open("if !value.is_valid() {");
            w.line("return false;");
            w.close("}");
            w.line(format!("self.{} = Some(value);", ident(field)));
        }
        ParseOp::ParseStructFrom { field, struct_id, src } => {
            w.line(format!("let mut cursor = {src};"));
            w.line(format!("let value = {struct_id}View::parse_mut(&mut cursor);"));
            w.open("if !value.is_valid() {");
            w.line("return false;");
            w.close("}");
            w.line(format!("self.{} = Some(value);", ident(field)));
        }
        ParseOp::LoopCount { field, count, src, elem } => {
            if let Some(src) = src {
                w.line(format!("let mut cursor = {src};"));
            }
            let cursor = if src.is_some() { "cursor" } else { "span" };
            w.open(format!("for _ in 0..{} {{", len_expr(count)));
            element_parse(ctx, w, elem, cursor, &|value| {
                format!("self.{}.push({value});", ident(field))
            });
            w.close("}");
        }
        ParseOp::LoopUntilEmpty { field, src, elem } => {
            w.line(format!("let mut cursor = {src};"));
            w.open("while !cursor.is_empty() {");
            element_parse(ctx, w, elem, "cursor", &|value| {
                format!("self.{}.push({value});", ident(field))
            });
            w.close("}");
        }
        ParseOp::Optional { field, cond, elem } => {
            let test = if cond.present_when_set { "!= 0" } else { "== 0" };
            w.open(format!("if {} {test} {{", cond.var));
            element_parse(ctx, w, elem, "span", &|value| {
                format!("self.{} = Some({value});", ident(field))
            });
            w.close("}");
        }
        ParseOp::ParentCheck { .. } => {
            unreachable!("parent checks are rendered by the view constructor")
        }
    }
}

fn generate_child_enum(w: &mut Writer, codec: &Codec) {
    let id = &codec.id;
    w.line("#[derive(Debug, Clone)]");
    w.open(format!("pub enum {id}Child<'a> {{"));
    for child in &codec.children {
        w.line(format!("{child}({child}View<'a>),"));
    }
    w.line("None,");
    w.close("}");
    w.blank();

    w.open(format!("impl<'a> {id}View<'a> {{"));
    w.open(format!("pub fn specialize(&self) -> {id}Child<'a> {{"));
    for child in &codec.children {
        w.line(format!("let child = {child}View::parse(self);"));
        w.open("if child.is_valid() {");
        w.line(format!("return {id}Child::{child}(child);"));
        w.close("}");
    }
    w.line(format!("{id}Child::None"));
    w.close("}");
    w.close("}");
    w.blank();
}

/// Render the schema as a single Rust source file.
pub fn generate(schema: &Schema) -> String {
    let ctx = Ctx { schema };
    let mut w = Writer::new("    ");
    w.line(format!("// @generated rust packets from {}.pdl.", schema.namespace));
    w.line("// /!\\ Do not edit by hand.");
    w.blank();
    w.line("use pdlc_runtime::{Builder, Slice};");
    w.blank();
    for def in &schema.enums {
        generate_enum(&mut w, def);
    }
    for codec in &schema.codecs {
        generate_codec(&ctx, &mut w, codec);
    }
    w.finish()
}
