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

//! Reference resolution and semantic validation.
//!
//! The resolver runs two passes over the parsed file: first it collects
//! the top-level declarations into a symbol table, then it validates
//! every reference and structural invariant, splices group fields into
//! their referents, desugars condition flags, and splits typedef
//! references into enum and struct references. Its output is the typed
//! AST consumed by the layout analyzer.

use codespan_reporting::diagnostic::Diagnostic;
use std::collections::HashMap;

use crate::ast::*;
use crate::report::{Diagnostics, ErrorCode};

/// Symbol table over the top-level declarations of a file.
#[derive(Debug)]
pub struct Scope<'d> {
    pub file: &'d File,
    pub typedef: HashMap<String, &'d Decl>,
}

impl<'d> Scope<'d> {
    pub fn new(file: &'d File) -> Result<Scope<'d>, Diagnostics> {
        let mut scope = Scope { file, typedef: Default::default() };
        let mut diagnostics: Diagnostics = Default::default();
        for decl in &file.declarations {
            if let Some(prev) = scope.typedef.insert(decl.id().to_string(), decl) {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::DuplicateName)
                        .with_message(format!(
                            "redeclaration of {} identifier `{}`",
                            decl.kind(),
                            decl.id()
                        ))
                        .with_labels(vec![
                            decl.loc.primary(),
                            prev.loc.secondary().with_message(format!(
                                "`{}` is first declared here",
                                decl.id()
                            )),
                        ]),
                )
            }
        }
        diagnostics.err_or(scope)
    }

    /// Return the parent declaration of the selected packet, if any.
    pub fn get_parent(&self, decl: &Decl) -> Option<&'d Decl> {
        decl.parent_id().and_then(|parent_id| self.typedef.get(parent_id).copied())
    }

    /// Iterate over the ancestors of the selected declaration, nearest
    /// parent first.
    pub fn iter_parents<'s>(&'s self, decl: &'d Decl) -> impl Iterator<Item = &'d Decl> + 's {
        std::iter::successors(self.get_parent(decl), |decl| self.get_parent(decl))
    }

    /// Iterate over the declaration and its ancestors, self first.
    pub fn iter_parents_and_self<'s>(
        &'s self,
        decl: &'d Decl,
    ) -> impl Iterator<Item = &'d Decl> + 's {
        std::iter::successors(Some(decl), |decl| self.get_parent(decl))
    }

    /// Iterate over the fields of the declaration and its ancestors.
    pub fn iter_fields<'s>(&'s self, decl: &'d Decl) -> impl Iterator<Item = &'d Field> + 's {
        self.iter_parents_and_self(decl).flat_map(Decl::fields)
    }

    /// Iterate over the constraints declared along the inheritance chain.
    pub fn iter_constraints<'s>(
        &'s self,
        decl: &'d Decl,
    ) -> impl Iterator<Item = &'d Constraint> + 's {
        self.iter_parents_and_self(decl).flat_map(Decl::constraints)
    }

    /// Iterate over the direct children of the selected packet.
    pub fn iter_children<'s>(&'s self, decl: &'d Decl) -> impl Iterator<Item = &'d Decl> + 's {
        self.file.iter_children(decl)
    }

    /// Return the declaration of the selected field's type, if it has one.
    pub fn get_type_declaration(&self, field: &Field) -> Option<&'d Decl> {
        match &field.desc {
            FieldDesc::Typedef { type_id, .. }
            | FieldDesc::Enum { enum_id: type_id, .. }
            | FieldDesc::Struct { struct_id: type_id, .. }
            | FieldDesc::FixedEnum { enum_id: type_id, .. }
            | FieldDesc::Array { type_id: Some(type_id), .. } => {
                self.typedef.get(type_id).copied()
            }
            _ => None,
        }
    }

    /// Test whether the selected field packs into a bit chunk.
    pub fn is_bitfield(&self, field: &Field) -> bool {
        match &field.desc {
            FieldDesc::Scalar { .. }
            | FieldDesc::Reserved { .. }
            | FieldDesc::FixedScalar { .. }
            | FieldDesc::FixedEnum { .. }
            | FieldDesc::Size { .. }
            | FieldDesc::Count { .. }
            | FieldDesc::Flag { .. }
            | FieldDesc::Enum { .. } => field.cond.is_none(),
            FieldDesc::Typedef { type_id, .. } => {
                field.cond.is_none()
                    && matches!(
                        self.typedef.get(type_id),
                        Some(Decl { desc: DeclDesc::Enum { .. }, .. })
                    )
            }
            _ => false,
        }
    }
}

/// Return the number of bits needed to represent a scalar value.
fn bit_width(value: usize) -> usize {
    usize::BITS as usize - value.leading_zeros() as usize
}

/// Return the maximum value representable in `width` bits.
pub fn scalar_max(width: usize) -> usize {
    if width >= usize::BITS as usize {
        usize::MAX
    } else {
        (1 << width) - 1
    }
}

/// Validate type references and reject cyclic declarations.
fn check_references(file: &File, scope: &Scope) -> Result<(), Diagnostics> {
    enum Mark {
        Visiting,
        Done,
    }
    #[derive(Default)]
    struct Context<'d> {
        visited: HashMap<&'d str, Mark>,
    }

    fn visit<'d>(
        decl: &'d Decl,
        context: &mut Context<'d>,
        scope: &Scope<'d>,
        diagnostics: &mut Diagnostics,
    ) {
        match context.visited.get(decl.id()) {
            Some(Mark::Done) => return,
            Some(Mark::Visiting) => {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::CycleInStruct)
                        .with_message(format!(
                            "recursive declaration of {} `{}`",
                            decl.kind(),
                            decl.id()
                        ))
                        .with_labels(vec![decl.loc.primary()]),
                );
                return;
            }
            None => (),
        }
        context.visited.insert(decl.id(), Mark::Visiting);

        for field in decl.fields() {
            match &field.desc {
                FieldDesc::Group { group_id, .. } => match scope.typedef.get(group_id) {
                    None => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::UnresolvedName)
                            .with_message(format!("undeclared group identifier `{group_id}`"))
                            .with_labels(vec![field.loc.primary()])
                            .with_notes(vec!["hint: expected group identifier".to_owned()]),
                    ),
                    Some(group_decl @ Decl { desc: DeclDesc::Group { .. }, .. }) => {
                        visit(group_decl, context, scope, diagnostics)
                    }
                    Some(_) => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidReference)
                            .with_message(format!("invalid group identifier `{group_id}`"))
                            .with_labels(vec![field.loc.primary()])
                            .with_notes(vec!["hint: expected group identifier".to_owned()]),
                    ),
                },
                FieldDesc::Typedef { type_id, .. }
                | FieldDesc::Array { type_id: Some(type_id), .. } => {
                    match scope.typedef.get(type_id) {
                        None => diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::UnresolvedName)
                                .with_message(format!(
                                    "undeclared {} identifier `{}`",
                                    field.kind(),
                                    type_id
                                ))
                                .with_labels(vec![field.loc.primary()])
                                .with_notes(vec![
                                    "hint: expected enum or struct identifier".to_owned()
                                ]),
                        ),
                        Some(Decl { desc: DeclDesc::Packet { .. }, .. })
                        | Some(Decl { desc: DeclDesc::Group { .. }, .. }) => diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::InvalidReference)
                                .with_message(format!(
                                    "invalid {} identifier `{}`",
                                    field.kind(),
                                    type_id
                                ))
                                .with_labels(vec![field.loc.primary()])
                                .with_notes(vec![
                                    "hint: expected enum or struct identifier".to_owned()
                                ]),
                        ),
                        Some(type_decl) => {
                            // An array of dynamically sized elements is
                            // allowed to recurse: nested TLV structures
                            // terminate on the size of the input.
                            if matches!(&field.desc, FieldDesc::Typedef { .. })
                                || matches!(&field.desc, FieldDesc::Array { count: Some(_), .. })
                            {
                                visit(type_decl, context, scope, diagnostics)
                            }
                        }
                    }
                }
                FieldDesc::FixedEnum { enum_id, .. } => match scope.typedef.get(enum_id) {
                    None => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::UnresolvedName)
                            .with_message(format!("undeclared enum identifier `{enum_id}`"))
                            .with_labels(vec![field.loc.primary()])
                            .with_notes(vec!["hint: expected enum identifier".to_owned()]),
                    ),
                    Some(Decl { desc: DeclDesc::Enum { .. }, .. }) => (),
                    Some(_) => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidReference)
                            .with_message(format!("invalid enum identifier `{enum_id}`"))
                            .with_labels(vec![field.loc.primary()])
                            .with_notes(vec!["hint: expected enum identifier".to_owned()]),
                    ),
                },
                _ => (),
            }
        }

        if let Some(parent_id) = decl.parent_id() {
            match scope.typedef.get(parent_id) {
                None => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::UnresolvedName)
                        .with_message(format!("undeclared parent identifier `{parent_id}`"))
                        .with_labels(vec![decl.loc.primary()])
                        .with_notes(vec!["hint: expected packet identifier".to_owned()]),
                ),
                Some(parent_decl @ Decl { desc: DeclDesc::Packet { .. }, .. }) => {
                    visit(parent_decl, context, scope, diagnostics)
                }
                Some(_) => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::InvalidReference)
                        .with_message(format!("invalid parent identifier `{parent_id}`"))
                        .with_labels(vec![decl.loc.primary()])
                        .with_notes(vec!["hint: expected packet identifier".to_owned()]),
                ),
            }
        }

        context.visited.insert(decl.id(), Mark::Done);
    }

    let mut diagnostics = Default::default();
    let mut context = Default::default();
    for decl in &file.declarations {
        match &decl.desc {
            DeclDesc::Enum { .. } => (),
            DeclDesc::Packet { .. } | DeclDesc::Struct { .. } | DeclDesc::Group { .. } => {
                visit(decl, &mut context, scope, &mut diagnostics)
            }
        }
    }
    diagnostics.err_or(())
}

/// Reject duplicate field identifiers within a declaration.
fn check_field_names(file: &File) -> Result<(), Diagnostics> {
    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        let mut seen = HashMap::new();
        for field in decl.fields() {
            if let Some(id) = field.id() {
                if let Some(prev) = seen.insert(id.to_string(), field) {
                    diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::DuplicateFieldName)
                            .with_message(format!(
                                "redeclaration of {} field identifier `{}`",
                                field.kind(),
                                id
                            ))
                            .with_labels(vec![
                                field.loc.primary(),
                                prev.loc
                                    .secondary()
                                    .with_message(format!("`{id}` is first declared here")),
                            ]),
                    )
                }
            }
        }
    }
    diagnostics.err_or(())
}

/// Validate enum declarations: tag name and value uniqueness, range
/// bounds and overlap, default tag uniqueness.
fn check_enum_declarations(file: &File) -> Result<(), Diagnostics> {
    fn ordered(range: &std::ops::RangeInclusive<usize>) -> std::ops::RangeInclusive<usize> {
        *range.start().min(range.end())..=*range.start().max(range.end())
    }

    fn check_value<'a>(
        tag: &'a TagValue,
        bounds: &std::ops::RangeInclusive<usize>,
        names: &mut HashMap<&'a str, SourceSpan>,
        values: &mut HashMap<usize, SourceSpan>,
        diagnostics: &mut Diagnostics,
    ) {
        if let Some(prev) = names.insert(&tag.id, tag.loc) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::DuplicateTagName)
                    .with_message(format!("duplicate tag identifier `{}`", tag.id))
                    .with_labels(vec![
                        tag.loc.primary(),
                        prev.secondary()
                            .with_message(format!("`{}` is first declared here", tag.id)),
                    ]),
            )
        }
        if let Some(prev) = values.insert(tag.value, tag.loc) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::DuplicateTagValue)
                    .with_message(format!("duplicate tag value `{}`", tag.value))
                    .with_labels(vec![
                        tag.loc.primary(),
                        prev.secondary()
                            .with_message(format!("`{}` is first declared here", tag.value)),
                    ]),
            )
        }
        if !bounds.contains(&tag.value) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::EnumValueOutOfRange)
                    .with_message(format!(
                        "tag value `{}` is outside the range of valid values `{}..{}`",
                        tag.value,
                        bounds.start(),
                        bounds.end()
                    ))
                    .with_labels(vec![tag.loc.primary()]),
            )
        }
    }

    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        let DeclDesc::Enum { tags, width, .. } = &decl.desc else { continue };

        if *width == 0 || *width > 64 {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::BitsOutOfRange)
                    .with_message(format!(
                        "enum width `{width}` is outside the valid range `1..=64`"
                    ))
                    .with_labels(vec![decl.loc.primary()]),
            );
            continue;
        }

        let bounds = 0..=scalar_max(*width);
        let mut names = HashMap::new();
        let mut values = HashMap::new();
        let mut default_tag: Option<SourceSpan> = None;
        let mut ranges: Vec<&TagRange> = vec![];

        for tag in tags {
            match tag {
                Tag::Value(tag) => {
                    check_value(tag, &bounds, &mut names, &mut values, &mut diagnostics)
                }
                Tag::Range(tag) => {
                    if let Some(prev) = names.insert(&tag.id, tag.loc) {
                        diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::DuplicateTagName)
                                .with_message(format!("duplicate tag identifier `{}`", tag.id))
                                .with_labels(vec![
                                    tag.loc.primary(),
                                    prev.secondary().with_message(format!(
                                        "`{}` is first declared here",
                                        tag.id
                                    )),
                                ]),
                        )
                    }
                    if !bounds.contains(tag.range.start()) || !bounds.contains(tag.range.end()) {
                        diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::InvalidTagRange)
                                .with_message(format!(
                                    "tag range `{}..{}` has bounds outside the valid values `{}..{}`",
                                    tag.range.start(),
                                    tag.range.end(),
                                    bounds.start(),
                                    bounds.end()
                                ))
                                .with_labels(vec![tag.loc.primary()]),
                        )
                    }
                    if tag.range.start() >= tag.range.end() {
                        diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::InvalidTagRange)
                                .with_message(format!(
                                    "tag range start `{}` is not less than its end `{}`",
                                    tag.range.start(),
                                    tag.range.end()
                                ))
                                .with_labels(vec![tag.loc.primary()]),
                        )
                    }
                    let inner_bounds = ordered(&tag.range);
                    for tag in tag.tags.iter() {
                        check_value(tag, &inner_bounds, &mut names, &mut values, &mut diagnostics)
                    }
                    ranges.push(tag);
                }
                Tag::Other(tag) => {
                    if let Some(prev) = names.insert(&tag.id, tag.loc) {
                        diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::DuplicateTagName)
                                .with_message(format!("duplicate tag identifier `{}`", tag.id))
                                .with_labels(vec![
                                    tag.loc.primary(),
                                    prev.secondary().with_message(format!(
                                        "`{}` is first declared here",
                                        tag.id
                                    )),
                                ]),
                        )
                    }
                    if let Some(prev) = default_tag {
                        diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::DuplicateDefaultTag)
                                .with_message("duplicate default tag".to_owned())
                                .with_labels(vec![
                                    tag.loc.primary(),
                                    prev.secondary().with_message(
                                        "the default tag is first declared here".to_owned(),
                                    ),
                                ]),
                        )
                    }
                    default_tag = Some(tag.loc);
                }
            }
        }

        // Standalone tag values may not fall into a reserved range.
        for tag in tags {
            if let Tag::Value(tag) = tag {
                for range in &ranges {
                    if ordered(&range.range).contains(&tag.value) {
                        diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::EnumValueOutOfRange)
                                .with_message(format!(
                                    "tag value `{}` is declared inside the range `{} = {}..{}`",
                                    tag.value,
                                    range.id,
                                    range.range.start(),
                                    range.range.end()
                                ))
                                .with_labels(vec![tag.loc.primary()]),
                        )
                    }
                }
            }
        }

        // Ranges must not intersect each other.
        ranges.sort_by_key(|tag| ordered(&tag.range).into_inner());
        for pair in ranges.windows(2) {
            let left = ordered(&pair[0].range);
            let right = ordered(&pair[1].range);
            if right.start() <= left.end() {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::OverlappingTagRange)
                        .with_message(format!(
                            "overlapping tag range `{}..{}`",
                            right.start(),
                            right.end()
                        ))
                        .with_labels(vec![
                            pair[1].loc.primary(),
                            pair[0].loc.secondary().with_message(format!(
                                "`{}..{}` is first declared here",
                                left.start(),
                                left.end()
                            )),
                        ]),
                )
            }
        }
    }
    diagnostics.err_or(())
}

/// Validate declared bit widths and fixed field values.
fn check_field_values(file: &File, scope: &Scope) -> Result<(), Diagnostics> {
    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        for field in decl.fields() {
            let width = match &field.desc {
                FieldDesc::Scalar { width, .. }
                | FieldDesc::Reserved { width }
                | FieldDesc::FixedScalar { width, .. }
                | FieldDesc::Size { width, .. }
                | FieldDesc::Count { width, .. } => Some(*width),
                FieldDesc::Array { width, .. } => *width,
                _ => None,
            };
            if let Some(width) = width {
                if width == 0 || width > 64 {
                    diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::BitsOutOfRange)
                            .with_message(format!(
                                "{} field width `{width}` is outside the valid range `1..=64`",
                                field.kind()
                            ))
                            .with_labels(vec![field.loc.primary()]),
                    );
                    continue;
                }
            }
            match &field.desc {
                FieldDesc::FixedScalar { value, width } if bit_width(*value) > *width => {
                    diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::FixedValueOutOfRange)
                            .with_message(format!(
                                "fixed value `{value}` is larger than maximum value"
                            ))
                            .with_labels(vec![field.loc.primary()]),
                    )
                }
                FieldDesc::FixedEnum { enum_id, tag_id } => {
                    if let Some(Decl { desc: DeclDesc::Enum { tags, .. }, .. }) =
                        scope.typedef.get(enum_id)
                    {
                        if !tags.iter().any(|tag| tag.id() == tag_id) {
                            diagnostics.push(
                                Diagnostic::error()
                                    .with_code(ErrorCode::UnresolvedName)
                                    .with_message(format!(
                                        "undeclared tag identifier `{tag_id}`"
                                    ))
                                    .with_labels(vec![field.loc.primary()]),
                            )
                        }
                    }
                }
                _ => (),
            }
        }
    }
    diagnostics.err_or(())
}

/// Validate size and count fields: uniqueness per referent, and a
/// single matching referent of the right kind declared later in source
/// order.
fn check_size_fields(file: &File) -> Result<(), Diagnostics> {
    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        let mut bindings = HashMap::new();
        for (index, field) in decl.fields().enumerate() {
            let field_id = match &field.desc {
                FieldDesc::Size { field_id, .. } | FieldDesc::Count { field_id, .. } => field_id,
                _ => continue,
            };
            if let Some(prev) = bindings.insert(field_id, field) {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::DuplicateSizeField)
                        .with_message(format!("duplicate {} field", field.kind()))
                        .with_labels(vec![
                            field.loc.primary(),
                            prev.loc
                                .secondary()
                                .with_message(format!("{} is first declared here", prev.kind())),
                        ]),
                )
            }

            let referent = decl.fields().enumerate().find(|(_, other)| match &other.desc {
                FieldDesc::Payload { .. } => field_id == "_payload_",
                FieldDesc::Body => field_id == "_body_",
                _ => other.id() == Some(field_id),
            });
            match (&field.desc, referent) {
                (_, None) => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::InvalidSizeReferent)
                        .with_message(format!(
                            "undeclared {} referent `{}`",
                            field.kind(),
                            field_id
                        ))
                        .with_labels(vec![field.loc.primary()])
                        .with_notes(vec![match &field.desc {
                            FieldDesc::Size { .. } => {
                                "hint: expected payload, body, or array identifier".to_owned()
                            }
                            _ => "hint: expected array identifier".to_owned(),
                        }]),
                ),
                (_, Some((referent_index, referent))) if referent_index < index => diagnostics
                    .push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidSizeReferent)
                            .with_message(format!(
                                "{} referent `{}` is declared before the {} field",
                                field.kind(),
                                field_id,
                                field.kind()
                            ))
                            .with_labels(vec![field.loc.primary(), referent.loc.secondary()]),
                    ),
                (
                    FieldDesc::Size { .. },
                    Some((
                        _,
                        Field {
                            desc:
                                FieldDesc::Payload { .. } | FieldDesc::Body | FieldDesc::Array { .. },
                            ..
                        },
                    )),
                )
                | (
                    FieldDesc::Count { .. },
                    Some((_, Field { desc: FieldDesc::Array { .. }, .. })),
                ) => {
                    if let Some((_, array @ Field { desc: FieldDesc::Array { count, .. }, .. })) =
                        referent
                    {
                        if count.is_some() {
                            diagnostics.push(
                                Diagnostic::error()
                                    .with_code(ErrorCode::RedundantArraySize)
                                    .with_message(format!(
                                        "redundant array {} field",
                                        field.kind()
                                    ))
                                    .with_labels(vec![
                                        field.loc.primary(),
                                        array.loc.secondary().with_message(format!(
                                            "`{field_id}` has a constant element count"
                                        )),
                                    ]),
                            )
                        }
                    }
                }
                (_, Some((_, referent))) => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::InvalidSizeReferent)
                        .with_message(format!(
                            "invalid {} referent `{}`",
                            field.kind(),
                            field_id
                        ))
                        .with_labels(vec![field.loc.primary(), referent.loc.secondary()]),
                ),
            }
        }
    }
    diagnostics.err_or(())
}

/// Validate payload and body fields.
fn check_payload_fields(file: &File) -> Result<(), Diagnostics> {
    fn requires_payload(file: &File, decl: &Decl) -> bool {
        file.iter_children(decl).any(|child| child.fields().next().is_some())
    }

    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        let mut payload: Option<&Field> = None;
        for field in decl.fields() {
            if matches!(&field.desc, FieldDesc::Payload { .. } | FieldDesc::Body) {
                if let Some(prev) = payload {
                    diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::DuplicatePayload)
                            .with_message(format!("duplicate {} field", field.kind()))
                            .with_labels(vec![
                                field.loc.primary(),
                                prev.loc.secondary().with_message(format!(
                                    "{} is first declared here",
                                    prev.kind()
                                )),
                            ]),
                    )
                } else {
                    payload = Some(field);
                }
            }
        }
        if payload.is_none() && requires_payload(file, decl) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::MissingPayload)
                    .with_message("missing payload field".to_owned())
                    .with_labels(vec![decl.loc.primary()])
                    .with_notes(vec![format!(
                        "hint: a child packet is extending `{}`",
                        decl.id()
                    )]),
            )
        }
    }
    diagnostics.err_or(())
}

/// Padding fields must directly follow an array field.
fn check_padding_fields(file: &File) -> Result<(), Diagnostics> {
    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        let mut previous_is_array = false;
        for field in decl.fields() {
            match &field.desc {
                FieldDesc::Padding { .. } if !previous_is_array => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::InvalidPaddingField)
                        .with_message("padding field does not follow an array field".to_owned())
                        .with_labels(vec![field.loc.primary()]),
                ),
                FieldDesc::Array { .. } => previous_is_array = true,
                _ => previous_is_array = false,
            }
        }
    }
    diagnostics.err_or(())
}

/// Validate optional fields and their condition flags.
fn check_optional_fields(file: &File, scope: &Scope) -> Result<(), Diagnostics> {
    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        let mut declared: HashMap<String, &Field> = HashMap::new();
        let mut used_flags: HashMap<String, &Field> = HashMap::new();
        for field in decl.fields() {
            if let Some(ref cond) = field.cond {
                match &field.desc {
                    FieldDesc::Scalar { width, .. } if width % 8 == 0 => (),
                    FieldDesc::Typedef { type_id, .. } => {
                        if let Some(Decl { desc: DeclDesc::Enum { width, .. }, .. }) =
                            scope.typedef.get(type_id)
                        {
                            if width % 8 != 0 {
                                diagnostics.push(
                                    Diagnostic::error()
                                        .with_code(ErrorCode::InvalidOptionalField)
                                        .with_message(
                                            "invalid optional field of truncated enum type"
                                                .to_owned(),
                                        )
                                        .with_labels(vec![field.loc.primary()]),
                                )
                            }
                        }
                    }
                    _ => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidOptionalField)
                            .with_message("invalid optional field".to_owned())
                            .with_labels(vec![field.loc.primary()])
                            .with_notes(vec![
                                "note: expected a byte-aligned scalar or a typedef field"
                                    .to_owned(),
                            ]),
                    ),
                }
                match declared.get(&cond.id) {
                    None => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidConditionField)
                            .with_message(format!("undeclared condition identifier `{}`", cond.id))
                            .with_labels(vec![field.loc.primary()])
                            .with_notes(vec![
                                "note: expected a preceding scalar field of width 1".to_owned()
                            ]),
                    ),
                    Some(Field { cond: Some(_), loc, .. }) => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidConditionField)
                            .with_message(format!("optional condition identifier `{}`", cond.id))
                            .with_labels(vec![
                                field.loc.primary(),
                                loc.secondary().with_message(format!(
                                    "`{}` is declared optional here",
                                    cond.id
                                )),
                            ]),
                    ),
                    Some(Field { desc: FieldDesc::Scalar { width: 1, .. }, .. }) => (),
                    Some(Field { loc, .. }) => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidConditionField)
                            .with_message(format!("invalid condition identifier `{}`", cond.id))
                            .with_labels(vec![
                                field.loc.primary(),
                                loc.secondary()
                                    .with_message(format!("`{}` is declared here", cond.id)),
                            ])
                            .with_notes(vec![
                                "note: expected a scalar field of width 1".to_owned()
                            ]),
                    ),
                }
                match (&cond.value, &cond.tag_id) {
                    (Some(0), None) | (Some(1), None) => (),
                    _ => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::InvalidConditionValue)
                            .with_message("invalid condition value".to_owned())
                            .with_labels(vec![field.loc.primary()])
                            .with_notes(vec!["note: expected 0 or 1".to_owned()]),
                    ),
                }
                if let Some(prev) = used_flags.insert(cond.id.to_owned(), field) {
                    diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::OverlappingOptionalBit)
                            .with_message(format!(
                                "condition flag `{}` governs more than one optional field",
                                cond.id
                            ))
                            .with_labels(vec![
                                field.loc.primary(),
                                prev.loc
                                    .secondary()
                                    .with_message("first optional field is declared here".to_owned()),
                            ]),
                    )
                }
            }
            if let Some(id) = field.id() {
                declared.insert(id.to_owned(), field);
            }
        }
    }
    diagnostics.err_or(())
}

/// Helper validating one constraint against the fields of `decl`.
fn check_constraint(
    constraint: &Constraint,
    decl: &Decl,
    scope: &Scope,
    diagnostics: &mut Diagnostics,
) {
    match scope.iter_fields(decl).find(|field| field.id() == Some(&constraint.id)) {
        None => diagnostics.push(
            Diagnostic::error()
                .with_code(ErrorCode::ConstraintTargetNotAField)
                .with_message(format!("undeclared constraint identifier `{}`", constraint.id))
                .with_labels(vec![constraint.loc.primary()])
                .with_notes(vec!["hint: expected scalar or typedef identifier".to_owned()]),
        ),
        Some(field @ Field { desc: FieldDesc::Scalar { width, .. }, .. }) => {
            match constraint.value {
                None => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::InvalidConstraintValue)
                        .with_message(format!(
                            "invalid constraint value `{}`",
                            constraint.tag_id.as_deref().unwrap_or_default()
                        ))
                        .with_labels(vec![
                            constraint.loc.primary(),
                            field.loc.secondary().with_message(format!(
                                "`{}` is declared here as scalar field",
                                constraint.id
                            )),
                        ])
                        .with_notes(vec!["hint: expected scalar value".to_owned()]),
                ),
                Some(value) if bit_width(value) > *width => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::ConstraintValueOutOfRange)
                        .with_message(format!(
                            "constraint value `{value}` is larger than maximum value"
                        ))
                        .with_labels(vec![constraint.loc.primary(), field.loc.secondary()]),
                ),
                _ => (),
            }
        }
        Some(field @ Field { desc: FieldDesc::Typedef { type_id, .. }, .. })
        | Some(field @ Field { desc: FieldDesc::Enum { enum_id: type_id, .. }, .. }) => {
            match scope.typedef.get(type_id) {
                Some(Decl { desc: DeclDesc::Enum { tags, .. }, .. }) => {
                    match &constraint.tag_id {
                        None => diagnostics.push(
                            Diagnostic::error()
                                .with_code(ErrorCode::InvalidConstraintValue)
                                .with_message(format!(
                                    "invalid constraint value `{}`",
                                    constraint.value.unwrap_or_default()
                                ))
                                .with_labels(vec![
                                    constraint.loc.primary(),
                                    field.loc.secondary().with_message(format!(
                                        "`{}` is declared here as enum field",
                                        constraint.id
                                    )),
                                ])
                                .with_notes(vec!["hint: expected enum tag".to_owned()]),
                        ),
                        Some(tag_id) => match tags.iter().find(|tag| tag.id() == tag_id) {
                            None => diagnostics.push(
                                Diagnostic::error()
                                    .with_code(ErrorCode::UnresolvedName)
                                    .with_message(format!("undeclared enum tag `{tag_id}`"))
                                    .with_labels(vec![
                                        constraint.loc.primary(),
                                        field.loc.secondary(),
                                    ]),
                            ),
                            Some(Tag::Range { .. }) | Some(Tag::Other { .. }) => diagnostics.push(
                                Diagnostic::error()
                                    .with_code(ErrorCode::InvalidConstraintValue)
                                    .with_message(format!(
                                        "enum tag `{tag_id}` does not name a single value"
                                    ))
                                    .with_labels(vec![
                                        constraint.loc.primary(),
                                        field.loc.secondary(),
                                    ])
                                    .with_notes(vec![
                                        "hint: expected enum tag with value".to_owned()
                                    ]),
                            ),
                            Some(Tag::Value(_)) => (),
                        },
                    }
                }
                // Unresolved references are reported by the reference
                // check.
                None => (),
                Some(type_decl) => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::ConstraintTargetNotAField)
                        .with_message(format!(
                            "invalid constraint identifier `{}`",
                            constraint.id
                        ))
                        .with_labels(vec![
                            constraint.loc.primary(),
                            field.loc.secondary().with_message(format!(
                                "`{}` is declared here as {} field",
                                constraint.id,
                                type_decl.kind()
                            )),
                        ])
                        .with_notes(vec!["hint: expected scalar or enum identifier".to_owned()]),
                ),
            }
        }
        Some(field) => diagnostics.push(
            Diagnostic::error()
                .with_code(ErrorCode::ConstraintTargetNotAField)
                .with_message(format!("invalid constraint identifier `{}`", constraint.id))
                .with_labels(vec![
                    constraint.loc.primary(),
                    field.loc.secondary().with_message(format!(
                        "`{}` is declared here as {} field",
                        constraint.id,
                        field.kind()
                    )),
                ])
                .with_notes(vec!["hint: expected scalar or typedef identifier".to_owned()]),
        ),
    }
}

fn check_constraint_list<'d>(
    constraints: &'d [Constraint],
    target_decl: &Decl,
    scope: &Scope,
    mut seen: HashMap<String, &'d Constraint>,
    diagnostics: &mut Diagnostics,
) {
    for constraint in constraints {
        check_constraint(constraint, target_decl, scope, diagnostics);
        if let Some(prev) = seen.insert(constraint.id.to_string(), constraint) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::DuplicateConstraint)
                    .with_message(format!("duplicate constraint identifier `{}`", constraint.id))
                    .with_labels(vec![
                        constraint.loc.primary(),
                        prev.loc
                            .secondary()
                            .with_message(format!("`{}` is first constrained here", prev.id)),
                    ]),
            )
        }
    }
}

/// Validate constraints declared on group references.
fn check_group_constraints(file: &File, scope: &Scope) -> Result<(), Diagnostics> {
    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        for field in decl.fields() {
            if let FieldDesc::Group { group_id, constraints } = &field.desc {
                if let Some(group_decl) = scope.typedef.get(group_id) {
                    check_constraint_list(
                        constraints,
                        group_decl,
                        scope,
                        HashMap::new(),
                        &mut diagnostics,
                    )
                }
            }
        }
    }
    diagnostics.err_or(())
}

/// Validate constraints declared for packet inheritance, including
/// duplicates along the inheritance chain and sibling packets whose
/// constraint sets cannot be told apart.
fn check_parent_constraints(file: &File, scope: &Scope) -> Result<(), Diagnostics> {
    let mut diagnostics: Diagnostics = Default::default();
    for decl in &file.declarations {
        if let DeclDesc::Packet { constraints, parent_id: Some(parent_id), .. } = &decl.desc {
            let parent_decl = scope.typedef[parent_id.as_str()];
            check_constraint_list(
                constraints,
                parent_decl,
                scope,
                scope.iter_parents(decl).fold(HashMap::new(), |acc, decl| {
                    decl.constraints().fold(acc, |mut acc, constraint| {
                        acc.insert(constraint.id.to_string(), constraint);
                        acc
                    })
                }),
                &mut diagnostics,
            )
        }
    }

    // Two children constraining the parent payload identically can
    // never both be selected.
    for decl in &file.declarations {
        let mut seen: HashMap<Vec<(String, Option<usize>, Option<String>)>, &Decl> =
            HashMap::new();
        for child in file.iter_children(decl) {
            let mut constraint_set: Vec<_> = child
                .constraints()
                .map(|c| (c.id.clone(), c.value, c.tag_id.clone()))
                .collect();
            constraint_set.sort();
            if let Some(prev) = seen.insert(constraint_set, child) {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::ConflictingChildConstraints)
                        .with_message(format!(
                            "`{}` and `{}` declare the same constraints on `{}`",
                            prev.id(),
                            child.id(),
                            decl.id()
                        ))
                        .with_labels(vec![child.loc.primary(), prev.loc.secondary()]),
                )
            }
        }
    }
    diagnostics.err_or(())
}

/// Splice group fields into their referents and drop the group
/// declarations. Constrained scalar fields become fixed scalars,
/// constrained enum references become fixed enums. Spliced fields
/// receive fresh keys so that layout facts never collide between two
/// splice sites of the same group.
fn splice_groups(file: &File) -> File {
    fn splice_fields<'a>(
        fields: impl Iterator<Item = &'a Field>,
        groups: &HashMap<String, &Decl>,
        constraints: &HashMap<String, Constraint>,
        next_key: &mut usize,
    ) -> Vec<Field> {
        fields
            .flat_map(|field| match &field.desc {
                FieldDesc::Group { group_id, constraints: group_constraints } => {
                    let mut constraints = constraints.clone();
                    constraints.extend(
                        group_constraints
                            .iter()
                            .map(|constraint| (constraint.id.clone(), constraint.clone())),
                    );
                    splice_fields(
                        groups.get(group_id).unwrap().fields(),
                        groups,
                        &constraints,
                        next_key,
                    )
                }
                FieldDesc::Scalar { id, width } if constraints.contains_key(id) => {
                    let key = FieldKey(std::mem::replace(next_key, *next_key + 1));
                    vec![Field {
                        desc: FieldDesc::FixedScalar {
                            width: *width,
                            value: constraints[id].value.unwrap(),
                        },
                        loc: field.loc,
                        key,
                        cond: field.cond.clone(),
                    }]
                }
                FieldDesc::Typedef { id, type_id } if constraints.contains_key(id) => {
                    let key = FieldKey(std::mem::replace(next_key, *next_key + 1));
                    vec![Field {
                        desc: FieldDesc::FixedEnum {
                            enum_id: type_id.clone(),
                            tag_id: constraints[id].tag_id.clone().unwrap(),
                        },
                        loc: field.loc,
                        key,
                        cond: field.cond.clone(),
                    }]
                }
                _ => {
                    let key = FieldKey(std::mem::replace(next_key, *next_key + 1));
                    vec![Field { key, ..field.clone() }]
                }
            })
            .collect()
    }

    let groups = file
        .declarations
        .iter()
        .filter(|decl| matches!(&decl.desc, DeclDesc::Group { .. }))
        .map(|decl| (decl.id().to_owned(), decl))
        .collect::<HashMap<String, _>>();

    let mut next_key = file.max_key;
    let declarations = file
        .declarations
        .iter()
        .filter_map(|decl| match &decl.desc {
            DeclDesc::Packet { fields, id, parent_id, constraints } => Some(Decl {
                desc: DeclDesc::Packet {
                    fields: splice_fields(fields.iter(), &groups, &HashMap::new(), &mut next_key),
                    id: id.clone(),
                    parent_id: parent_id.clone(),
                    constraints: constraints.clone(),
                },
                loc: decl.loc,
                key: decl.key,
            }),
            DeclDesc::Struct { fields, id } => Some(Decl {
                desc: DeclDesc::Struct {
                    fields: splice_fields(fields.iter(), &groups, &HashMap::new(), &mut next_key),
                    id: id.clone(),
                },
                loc: decl.loc,
                key: decl.key,
            }),
            DeclDesc::Group { .. } => None,
            _ => Some(decl.clone()),
        })
        .collect();

    File {
        declarations,
        file: file.file,
        namespace: file.namespace.clone(),
        endianness: file.endianness,
        max_key: next_key,
    }
}

/// Replace scalar fields referenced as optional conditions with the
/// dedicated flag construct.
fn desugar_condition_flags(file: &mut File) {
    for decl in &mut file.declarations {
        let (DeclDesc::Packet { fields, .. } | DeclDesc::Struct { fields, .. }) = &mut decl.desc
        else {
            continue;
        };
        let mut conditions: HashMap<String, (String, usize)> = HashMap::new();
        for field in fields.iter() {
            if let Some(ref cond) = field.cond {
                conditions.insert(
                    cond.id.to_owned(),
                    (field.id().unwrap().to_owned(), cond.value.unwrap()),
                );
            }
        }
        for field in fields.iter_mut() {
            if let Some((optional_field_id, set_value)) =
                field.id().and_then(|id| conditions.get(id))
            {
                field.desc = FieldDesc::Flag {
                    id: field.id().unwrap().to_owned(),
                    optional_field_id: optional_field_id.clone(),
                    set_value: *set_value,
                };
            }
        }
    }
}

/// Split typedef references into enum and struct references.
fn resolve_type_references(file: &mut File) {
    let kinds: HashMap<String, (bool, usize)> = file
        .declarations
        .iter()
        .map(|decl| match &decl.desc {
            DeclDesc::Enum { id, width, .. } => (id.clone(), (true, *width)),
            _ => (decl.id().to_owned(), (false, 0)),
        })
        .collect();

    for decl in &mut file.declarations {
        let (DeclDesc::Packet { fields, .. } | DeclDesc::Struct { fields, .. }) = &mut decl.desc
        else {
            continue;
        };
        for field in fields.iter_mut() {
            if let FieldDesc::Typedef { id, type_id } = &field.desc {
                field.desc = match kinds.get(type_id) {
                    Some((true, width)) => FieldDesc::Enum {
                        id: id.clone(),
                        enum_id: type_id.clone(),
                        width: *width,
                    },
                    _ => FieldDesc::Struct { id: id.clone(), struct_id: type_id.clone() },
                };
            }
        }
    }
}

/// Resolver entry point. Returns the typed AST: groups spliced,
/// condition flags desugared, and type references split by kind.
pub fn resolve(file: &File) -> Result<File, Diagnostics> {
    let scope = Scope::new(file)?;
    check_references(file, &scope)?;
    check_field_names(file)?;
    check_enum_declarations(file)?;
    check_field_values(file, &scope)?;
    check_size_fields(file)?;
    check_payload_fields(file)?;
    check_padding_fields(file)?;
    check_optional_fields(file, &scope)?;
    check_group_constraints(file, &scope)?;
    let mut file = splice_groups(file);
    {
        let scope = Scope::new(&file)?;
        check_parent_constraints(&file, &scope)?;
    }
    desugar_condition_flags(&mut file);
    resolve_type_references(&mut file);
    Ok(file)
}
