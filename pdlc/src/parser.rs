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

//! PDL lexer and parser.
//!
//! The grammar is embedded inline so that the parser is generated at
//! build time without relying on the manifest directory. The parser
//! performs no semantic checks; it produces an untyped AST with source
//! spans and lets the resolver do the rest.

use crate::ast;
use codespan_reporting::diagnostic::Diagnostic;
use codespan_reporting::files;
use pest::iterators::{Pair, Pairs};
use pest::Parser;
use std::iter::Peekable;

#[derive(pest_derive::Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\n" | "\r" | "\t" }
COMMENT = _{ block_comment | line_comment }

block_comment = { "/*" ~ (!"*/" ~ ANY)* ~ "*/" }
line_comment = { "//" ~ (!"\n" ~ ANY)* }

alpha = { 'a'..'z' | 'A'..'Z' }
digit = { '0'..'9' }
hexdigit = { digit | 'a'..'f' | 'A'..'F' }
alphanum = { alpha | digit | "_" }

identifier = @{ alpha ~ alphanum* }
payload_identifier = @{ "_payload_" }
body_identifier = @{ "_body_" }
intvalue = @{ digit+ }
hexvalue = @{ ("0x" | "0X") ~ hexdigit+ }
integer = @{ hexvalue | intvalue }
size_modifier = @{ ("+" | "-") ~ intvalue }

ENUM = @{ "enum" ~ WHITESPACE }
PACKET = @{ "packet" ~ WHITESPACE }
STRUCT = @{ "struct" ~ WHITESPACE }
GROUP = @{ "group" ~ WHITESPACE }

endianness_declaration = ${ ("little_endian_packets" | "big_endian_packets") ~ WHITESPACE }

enum_value = { identifier ~ "=" ~ integer }
enum_value_list = { enum_value ~ ("," ~ enum_value)* ~ ","? }
enum_range = {
    identifier ~ "=" ~ integer ~ ".." ~ integer ~ ("{" ~
        enum_value_list ~
    "}")?
}
enum_other = { identifier ~ "=" ~ ".." }
enum_tag = { enum_range | enum_value | enum_other }
enum_tag_list = { enum_tag ~ ("," ~ enum_tag)* ~ ","? }
enum_declaration = {
    ENUM ~ identifier ~ ":" ~ integer ~ "{" ~
        enum_tag_list ~
    "}"
}

constraint = { identifier ~ "=" ~ (identifier | integer) }
constraint_list = { constraint ~ ("," ~ constraint)* }

padding_field = { "_padding_" ~ "[" ~ integer ~ "]" }
size_field = { "_size_" ~ "(" ~ (identifier | payload_identifier | body_identifier) ~ ")" ~ ":" ~ integer }
count_field = { "_count_" ~ "(" ~ identifier ~ ")" ~ ":" ~ integer }
body_field = @{ "_body_" }
payload_field = { "_payload_" ~ (":" ~ "[" ~ size_modifier ~ "]")? }
fixed_field = { "_fixed_" ~ "=" ~ (
    (integer ~ ":" ~ integer) |
    (identifier ~ ":" ~ identifier)
)}
reserved_field = { "_reserved_" ~ ":" ~ integer }
array_field = { identifier ~ ":" ~ (integer | identifier) ~
    "[" ~ (size_modifier | integer)? ~ "]"
}
scalar_field = { identifier ~ ":" ~ integer }
typedef_field = { identifier ~ ":" ~ identifier }
group_field = { identifier ~ ("{" ~ constraint_list? ~ "}")? }

field_desc = _{
    padding_field |
    size_field |
    count_field |
    body_field |
    payload_field |
    fixed_field |
    reserved_field |
    array_field |
    scalar_field |
    typedef_field |
    group_field
}
field = { field_desc ~ ("if" ~ constraint)? }
field_list = { field ~ ("," ~ field)* ~ ","? }

packet_declaration = {
    PACKET ~ identifier ~
        (":" ~ identifier ~ ("(" ~ constraint_list ~ ")")?)? ~
    "{" ~
        field_list? ~
    "}"
}

struct_declaration = {
    STRUCT ~ identifier ~ "{" ~ field_list? ~ "}"
}

group_declaration = {
    GROUP ~ identifier ~ "{" ~ field_list ~ "}"
}

declaration = _{
    enum_declaration |
    packet_declaration |
    struct_declaration |
    group_declaration
}

file = {
    SOI ~
    endianness_declaration ~
    declaration* ~
    EOI
}
"#]
struct PdlParser;

type Node<'i> = Pair<'i, Rule>;
type Children<'i> = Peekable<Pairs<'i, Rule>>;

struct Context<'a> {
    file: ast::FileId,
    line_starts: &'a [usize],
    key: std::cell::Cell<usize>,
}

impl Context<'_> {
    fn next_key(&self) -> usize {
        self.key.replace(self.key.get() + 1)
    }
}

fn span_of(node: &Node<'_>, context: &Context) -> ast::SourceSpan {
    let span = node.as_span();
    ast::SourceSpan {
        file: context.file,
        start: ast::SourceLocation::new(span.start_pos().pos(), context.line_starts),
        end: ast::SourceLocation::new(span.end_pos().pos(), context.line_starts),
    }
}

fn number_of(node: &Node<'_>) -> Result<usize, String> {
    let text = node.as_str();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| format!("cannot convert `{text}` to an integer"))
}

fn expect<'i>(children: &mut Children<'i>, rule: Rule) -> Result<Node<'i>, String> {
    match children.next() {
        Some(node) if node.as_rule() == rule => Ok(node),
        Some(node) => Err(format!("expected rule {:?}, got {:?}", rule, node.as_rule())),
        None => Err(format!("expected rule {:?}, got nothing", rule)),
    }
}

fn accept<'i>(children: &mut Children<'i>, rule: Rule) -> Option<Node<'i>> {
    children.next_if(|node| node.as_rule() == rule)
}

fn parse_identifier(children: &mut Children<'_>) -> Result<String, String> {
    expect(children, Rule::identifier).map(|node| node.as_str().to_owned())
}

fn parse_integer(children: &mut Children<'_>) -> Result<usize, String> {
    expect(children, Rule::integer).and_then(|node| number_of(&node))
}

fn parse_identifier_or_integer(
    children: &mut Children<'_>,
) -> Result<(Option<String>, Option<usize>), String> {
    match children.next() {
        Some(node) if node.as_rule() == Rule::identifier => {
            Ok((Some(node.as_str().to_owned()), None))
        }
        Some(node) if node.as_rule() == Rule::integer => Ok((None, Some(number_of(&node)?))),
        Some(node) => {
            Err(format!("expected an identifier or integer, got {:?}", node.as_rule()))
        }
        None => Err("expected an identifier or integer, got nothing".to_owned()),
    }
}

fn parse_size_modifier(children: &mut Children<'_>) -> Result<Option<i64>, String> {
    accept(children, Rule::size_modifier)
        .map(|node| {
            node.as_str()
                .parse::<i64>()
                .map_err(|_| format!("cannot convert `{}` to a size modifier", node.as_str()))
        })
        .transpose()
}

fn parse_constraint(node: Node<'_>, context: &Context) -> Result<ast::Constraint, String> {
    if node.as_rule() != Rule::constraint {
        return Err(format!("expected rule constraint, got {:?}", node.as_rule()));
    }
    let loc = span_of(&node, context);
    let mut children = node.into_inner().peekable();
    let id = parse_identifier(&mut children)?;
    let (tag_id, value) = parse_identifier_or_integer(&mut children)?;
    Ok(ast::Constraint { id, loc, value, tag_id })
}

fn parse_constraint_list(
    children: &mut Children<'_>,
    context: &Context,
) -> Result<Vec<ast::Constraint>, String> {
    accept(children, Rule::constraint_list).map_or(Ok(vec![]), |node| {
        node.into_inner().map(|node| parse_constraint(node, context)).collect()
    })
}

fn parse_enum_value(node: Node<'_>, context: &Context) -> Result<ast::TagValue, String> {
    let loc = span_of(&node, context);
    let mut children = node.into_inner().peekable();
    let id = parse_identifier(&mut children)?;
    let value = parse_integer(&mut children)?;
    Ok(ast::TagValue { id, loc, value })
}

fn parse_enum_tag(node: Node<'_>, context: &Context) -> Result<ast::Tag, String> {
    let inner = node
        .into_inner()
        .next()
        .ok_or_else(|| "expected an enum tag, got nothing".to_owned())?;
    match inner.as_rule() {
        Rule::enum_value => Ok(ast::Tag::Value(parse_enum_value(inner, context)?)),
        Rule::enum_range => {
            let loc = span_of(&inner, context);
            let mut children = inner.into_inner().peekable();
            let id = parse_identifier(&mut children)?;
            let start = parse_integer(&mut children)?;
            let end = parse_integer(&mut children)?;
            let tags = accept(&mut children, Rule::enum_value_list).map_or(Ok(vec![]), |node| {
                node.into_inner()
                    .map(|node| parse_enum_value(node, context))
                    .collect::<Result<Vec<_>, _>>()
            })?;
            Ok(ast::Tag::Range(ast::TagRange { id, loc, range: start..=end, tags }))
        }
        Rule::enum_other => {
            let loc = span_of(&inner, context);
            let mut children = inner.into_inner().peekable();
            let id = parse_identifier(&mut children)?;
            Ok(ast::Tag::Other(ast::TagOther { id, loc }))
        }
        rule => Err(format!("expected an enum tag, got {:?}", rule)),
    }
}

fn parse_field(node: Node<'_>, context: &Context) -> Result<ast::Field, String> {
    let loc = span_of(&node, context);
    let mut parts = node.into_inner().peekable();
    let desc = parts.next().ok_or_else(|| "expected a field, got nothing".to_owned())?;
    let cond =
        parts.next().map(|constraint| parse_constraint(constraint, context)).transpose()?;
    let rule = desc.as_rule();
    let mut children = desc.into_inner().peekable();
    let desc = match rule {
        Rule::padding_field => {
            let size = parse_integer(&mut children)?;
            ast::FieldDesc::Padding { size }
        }
        Rule::size_field => {
            let field_id = match children.next() {
                Some(node)
                    if matches!(
                        node.as_rule(),
                        Rule::identifier | Rule::payload_identifier | Rule::body_identifier
                    ) =>
                {
                    node.as_str().to_owned()
                }
                Some(node) => {
                    return Err(format!("expected a size referent, got {:?}", node.as_rule()))
                }
                None => return Err("expected a size referent, got nothing".to_owned()),
            };
            let width = parse_integer(&mut children)?;
            ast::FieldDesc::Size { field_id, width }
        }
        Rule::count_field => {
            let field_id = parse_identifier(&mut children)?;
            let width = parse_integer(&mut children)?;
            ast::FieldDesc::Count { field_id, width }
        }
        Rule::body_field => ast::FieldDesc::Body,
        Rule::payload_field => {
            let size_modifier = parse_size_modifier(&mut children)?;
            ast::FieldDesc::Payload { size_modifier }
        }
        Rule::fixed_field => match children.next() {
            Some(node) if node.as_rule() == Rule::integer => {
                let value = number_of(&node)?;
                let width = parse_integer(&mut children)?;
                ast::FieldDesc::FixedScalar { width, value }
            }
            Some(node) if node.as_rule() == Rule::identifier => {
                let tag_id = node.as_str().to_owned();
                let enum_id = parse_identifier(&mut children)?;
                ast::FieldDesc::FixedEnum { enum_id, tag_id }
            }
            _ => unreachable!(),
        },
        Rule::reserved_field => {
            let width = parse_integer(&mut children)?;
            ast::FieldDesc::Reserved { width }
        }
        Rule::array_field => {
            let id = parse_identifier(&mut children)?;
            let (type_id, width) = parse_identifier_or_integer(&mut children)?;
            let (count, size_modifier) = match children.next() {
                Some(node) if node.as_rule() == Rule::integer => (Some(number_of(&node)?), None),
                Some(node) if node.as_rule() == Rule::size_modifier => {
                    let modifier = node.as_str().parse::<i64>().map_err(|_| {
                        format!("cannot convert `{}` to a size modifier", node.as_str())
                    })?;
                    (None, Some(modifier))
                }
                Some(node) => {
                    return Err(format!(
                        "expected an array count or size modifier, got {:?}",
                        node.as_rule()
                    ))
                }
                None => (None, None),
            };
            ast::FieldDesc::Array { id, width, type_id, count, size_modifier }
        }
        Rule::scalar_field => {
            let id = parse_identifier(&mut children)?;
            let width = parse_integer(&mut children)?;
            ast::FieldDesc::Scalar { id, width }
        }
        Rule::typedef_field => {
            let id = parse_identifier(&mut children)?;
            let type_id = parse_identifier(&mut children)?;
            ast::FieldDesc::Typedef { id, type_id }
        }
        Rule::group_field => {
            let group_id = parse_identifier(&mut children)?;
            let constraints = parse_constraint_list(&mut children, context)?;
            ast::FieldDesc::Group { group_id, constraints }
        }
        rule => return Err(format!("expected a field, got {:?}", rule)),
    };
    Ok(ast::Field { loc, key: ast::FieldKey(context.next_key()), desc, cond })
}

fn parse_field_list(
    children: &mut Children<'_>,
    context: &Context,
) -> Result<Vec<ast::Field>, String> {
    accept(children, Rule::field_list).map_or(Ok(vec![]), |node| {
        node.into_inner().map(|node| parse_field(node, context)).collect()
    })
}

fn parse_file_root(root: Node<'_>, context: &Context) -> Result<Vec<ast::Decl>, String> {
    let mut declarations = vec![];
    for node in root.into_inner() {
        let loc = span_of(&node, context);
        let key = ast::DeclKey(context.next_key());
        match node.as_rule() {
            Rule::endianness_declaration | Rule::EOI => (),
            Rule::enum_declaration => {
                let mut children = node.into_inner().peekable();
                expect(&mut children, Rule::ENUM)?;
                let id = parse_identifier(&mut children)?;
                let width = parse_integer(&mut children)?;
                let tags = expect(&mut children, Rule::enum_tag_list)?
                    .into_inner()
                    .map(|node| parse_enum_tag(node, context))
                    .collect::<Result<Vec<_>, _>>()?;
                declarations.push(ast::Decl {
                    loc,
                    key,
                    desc: ast::DeclDesc::Enum { id, tags, width },
                });
            }
            Rule::packet_declaration => {
                let mut children = node.into_inner().peekable();
                expect(&mut children, Rule::PACKET)?;
                let id = parse_identifier(&mut children)?;
                let parent_id = accept(&mut children, Rule::identifier)
                    .map(|node| node.as_str().to_owned());
                let constraints = parse_constraint_list(&mut children, context)?;
                let fields = parse_field_list(&mut children, context)?;
                declarations.push(ast::Decl {
                    loc,
                    key,
                    desc: ast::DeclDesc::Packet { id, fields, parent_id, constraints },
                });
            }
            Rule::struct_declaration => {
                let mut children = node.into_inner().peekable();
                expect(&mut children, Rule::STRUCT)?;
                let id = parse_identifier(&mut children)?;
                let fields = parse_field_list(&mut children, context)?;
                declarations.push(ast::Decl {
                    loc,
                    key,
                    desc: ast::DeclDesc::Struct { id, fields },
                });
            }
            Rule::group_declaration => {
                let mut children = node.into_inner().peekable();
                expect(&mut children, Rule::GROUP)?;
                let id = parse_identifier(&mut children)?;
                let fields = expect(&mut children, Rule::field_list)?
                    .into_inner()
                    .map(|node| parse_field(node, context))
                    .collect::<Result<Vec<_>, _>>()?;
                declarations.push(ast::Decl {
                    loc,
                    key,
                    desc: ast::DeclDesc::Group { id, fields },
                });
            }
            rule => return Err(format!("unexpected rule {:?} at file scope", rule)),
        }
    }
    Ok(declarations)
}

/// Derive the emitted namespace identifier from the source file name.
fn namespace_of(name: &str) -> String {
    let stem = std::path::Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("pdl");
    let mut namespace = String::with_capacity(stem.len());
    for c in stem.chars() {
        namespace.push(if c.is_ascii_alphanumeric() { c } else { '_' });
    }
    if namespace.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        namespace.insert(0, '_');
    }
    namespace
}

/// Parse PDL source text. The text is added to the source database
/// under the provided name.
pub fn parse_inline(
    sources: &mut ast::SourceDatabase,
    name: &str,
    source: String,
) -> Result<ast::File, Diagnostic<ast::FileId>> {
    let root = PdlParser::parse(Rule::file, &source)
        .map_err(|e| {
            Diagnostic::error()
                .with_message(format!("failed to parse input file '{}': {}", name, e))
        })?
        .next()
        .unwrap();
    let line_starts: Vec<_> = files::line_starts(&source).collect();
    let endianness = match root.clone().into_inner().next() {
        Some(node) if node.as_rule() == Rule::endianness_declaration => {
            match node.as_str().trim() {
                "little_endian_packets" => ast::ByteOrder::LittleEndian,
                "big_endian_packets" => ast::ByteOrder::BigEndian,
                _ => unreachable!(),
            }
        }
        _ => ast::ByteOrder::LittleEndian,
    };
    let file = sources.add(name.to_owned(), source.clone());
    let context = Context { file, line_starts: &line_starts, key: std::cell::Cell::new(0) };
    let declarations =
        parse_file_root(root, &context).map_err(|e| Diagnostic::error().with_message(e))?;
    Ok(ast::File {
        file,
        namespace: namespace_of(name),
        endianness,
        declarations,
        max_key: context.key.get(),
    })
}

/// Read and parse a new source file, adding it to the source database.
pub fn parse_file(
    sources: &mut ast::SourceDatabase,
    name: &str,
) -> Result<ast::File, Diagnostic<ast::FileId>> {
    let source = std::fs::read_to_string(name).map_err(|e| {
        Diagnostic::error().with_message(format!("failed to read input file '{}': {}", name, e))
    })?;
    parse_inline(sources, name, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(text: &str) -> Result<ast::File, Diagnostic<ast::FileId>> {
        let mut db = ast::SourceDatabase::new();
        parse_inline(&mut db, "test.pdl", text.to_owned())
    }

    #[test]
    fn endianness_is_set() {
        let file = parse_str("  big_endian_packets  ").unwrap();
        assert_eq!(file.endianness, ast::ByteOrder::BigEndian);
        let file = parse_str("little_endian_packets").unwrap();
        assert_eq!(file.endianness, ast::ByteOrder::LittleEndian);
    }

    #[test]
    fn keywords_require_whitespace() {
        assert!(parse_str("little_endian_packetsstructx{foo:8}").is_err());
        assert!(parse_str("little_endian_packets struct x { foo : 8 }").is_ok());
    }

    #[test]
    fn comments_are_skipped() {
        let file = parse_str(
            r#"
            little_endian_packets
            // one comment
            packet A { /* inline */ a : 8 }
            "#,
        )
        .unwrap();
        assert_eq!(file.declarations.len(), 1);
        assert_eq!(file.declarations[0].id(), "A");
    }

    #[test]
    fn scalar_and_reserved_fields() {
        let file = parse_str(
            r#"
            little_endian_packets
            struct S {
                a : 3,
                _reserved_ : 5,
                b : 0x10,
            }
            "#,
        )
        .unwrap();
        let fields: Vec<_> = file.declarations[0].fields().collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(
            fields[0].desc,
            ast::FieldDesc::Scalar { id: "a".to_owned(), width: 3 }
        );
        assert_eq!(fields[1].desc, ast::FieldDesc::Reserved { width: 5 });
        assert_eq!(
            fields[2].desc,
            ast::FieldDesc::Scalar { id: "b".to_owned(), width: 16 }
        );
    }

    #[test]
    fn fixed_fields() {
        let file = parse_str(
            r#"
            little_endian_packets
            struct S {
                _fixed_ = 0x2a : 8,
                _fixed_ = Foo : Bar,
            }
            "#,
        )
        .unwrap();
        let fields: Vec<_> = file.declarations[0].fields().collect();
        assert_eq!(fields[0].desc, ast::FieldDesc::FixedScalar { width: 8, value: 42 });
        assert_eq!(
            fields[1].desc,
            ast::FieldDesc::FixedEnum { enum_id: "Bar".to_owned(), tag_id: "Foo".to_owned() }
        );
    }

    #[test]
    fn size_count_and_payload_fields() {
        let file = parse_str(
            r#"
            little_endian_packets
            packet P {
                _size_(_payload_) : 8,
                _count_(a) : 4,
                _reserved_ : 4,
                a : 16[],
                _payload_,
            }
            "#,
        )
        .unwrap();
        let fields: Vec<_> = file.declarations[0].fields().collect();
        assert_eq!(
            fields[0].desc,
            ast::FieldDesc::Size { field_id: "_payload_".to_owned(), width: 8 }
        );
        assert_eq!(
            fields[1].desc,
            ast::FieldDesc::Count { field_id: "a".to_owned(), width: 4 }
        );
        assert_eq!(fields[4].desc, ast::FieldDesc::Payload { size_modifier: None });
    }

    #[test]
    fn payload_size_modifier() {
        let file = parse_str(
            r#"
            little_endian_packets
            packet P {
                _size_(_payload_) : 8,
                _payload_ : [+2],
            }
            "#,
        )
        .unwrap();
        let fields: Vec<_> = file.declarations[0].fields().collect();
        assert_eq!(fields[1].desc, ast::FieldDesc::Payload { size_modifier: Some(2) });
    }

    #[test]
    fn array_fields() {
        let file = parse_str(
            r#"
            little_endian_packets
            packet P {
                a : 8[],
                b : 16[4],
                c : Elem[],
                d : Elem[+1],
                _padding_ [16],
            }
            "#,
        )
        .unwrap();
        let fields: Vec<_> = file.declarations[0].fields().collect();
        assert_eq!(
            fields[0].desc,
            ast::FieldDesc::Array {
                id: "a".to_owned(),
                width: Some(8),
                type_id: None,
                count: None,
                size_modifier: None,
            }
        );
        assert_eq!(
            fields[1].desc,
            ast::FieldDesc::Array {
                id: "b".to_owned(),
                width: Some(16),
                type_id: None,
                count: Some(4),
                size_modifier: None,
            }
        );
        assert_eq!(
            fields[2].desc,
            ast::FieldDesc::Array {
                id: "c".to_owned(),
                width: None,
                type_id: Some("Elem".to_owned()),
                count: None,
                size_modifier: None,
            }
        );
        assert_eq!(
            fields[3].desc,
            ast::FieldDesc::Array {
                id: "d".to_owned(),
                width: None,
                type_id: Some("Elem".to_owned()),
                count: None,
                size_modifier: Some(1),
            }
        );
        assert_eq!(fields[4].desc, ast::FieldDesc::Padding { size: 16 });
    }

    #[test]
    fn optional_fields() {
        let file = parse_str(
            r#"
            little_endian_packets
            packet P {
                c0 : 1,
                c1 : 1,
                _reserved_ : 6,
                a : 8 if c0 = 0,
                b : Foo if c1 = 1,
            }
            "#,
        )
        .unwrap();
        let fields: Vec<_> = file.declarations[0].fields().collect();
        let cond = fields[3].cond.as_ref().unwrap();
        assert_eq!(cond.id, "c0");
        assert_eq!(cond.value, Some(0));
        let cond = fields[4].cond.as_ref().unwrap();
        assert_eq!(cond.id, "c1");
        assert_eq!(cond.value, Some(1));
    }

    #[test]
    fn enum_declaration_with_ranges() {
        let file = parse_str(
            r#"
            little_endian_packets
            enum E : 8 {
                A = 1,
                B = 2..5 { B1 = 2, B2 = 3 },
                OTHER = ..,
            }
            "#,
        )
        .unwrap();
        match &file.declarations[0].desc {
            ast::DeclDesc::Enum { id, tags, width } => {
                assert_eq!(id, "E");
                assert_eq!(*width, 8);
                assert_eq!(tags.len(), 3);
                assert!(matches!(&tags[0], ast::Tag::Value(tag) if tag.value == 1));
                assert!(
                    matches!(&tags[1], ast::Tag::Range(tag) if tag.range == (2..=5) && tag.tags.len() == 2)
                );
                assert!(matches!(&tags[2], ast::Tag::Other(_)));
            }
            desc => panic!("expected an enum declaration, got {desc:?}"),
        }
    }

    #[test]
    fn packet_inheritance_and_constraints() {
        let file = parse_str(
            r#"
            little_endian_packets
            packet Parent { op : 8, _payload_ }
            packet Child : Parent(op = 1) { a : 8 }
            packet Other : Parent(op = RESET) { }
            "#,
        )
        .unwrap();
        let child = &file.declarations[1];
        assert_eq!(child.parent_id(), Some("Parent"));
        let constraints: Vec<_> = child.constraints().collect();
        assert_eq!(constraints[0].id, "op");
        assert_eq!(constraints[0].value, Some(1));
        let other = &file.declarations[2];
        assert_eq!(other.constraints().next().unwrap().tag_id.as_deref(), Some("RESET"));
    }

    #[test]
    fn group_fields() {
        let file = parse_str(
            r#"
            little_endian_packets
            group G { a : 8, b : 8 }
            packet P { G { a = 1 } }
            packet Q { G }
            "#,
        )
        .unwrap();
        let p_fields: Vec<_> = file.declarations[1].fields().collect();
        match &p_fields[0].desc {
            ast::FieldDesc::Group { group_id, constraints } => {
                assert_eq!(group_id, "G");
                assert_eq!(constraints.len(), 1);
            }
            desc => panic!("expected a group field, got {desc:?}"),
        }
        let q_fields: Vec<_> = file.declarations[2].fields().collect();
        assert!(matches!(&q_fields[0].desc, ast::FieldDesc::Group { constraints, .. } if constraints.is_empty()));
    }

    #[test]
    fn namespace_from_file_name() {
        assert_eq!(namespace_of("foo/bar/uci-packets.pdl"), "uci_packets");
        assert_eq!(namespace_of("1st.pdl"), "_1st");
    }
}
