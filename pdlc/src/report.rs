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

//! Diagnostic codes and aggregation shared by the resolver and the
//! layout analyzer.

use codespan_reporting::diagnostic::Diagnostic;
use codespan_reporting::files;
use codespan_reporting::term;
use codespan_reporting::term::termcolor;
use std::fmt;

use crate::ast::{FileId, SourceDatabase};

/// Unique error codes reported as compiler diagnostics.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    // Reference errors.
    DuplicateName = 1,
    CycleInStruct = 2,
    UnresolvedName = 3,
    InvalidReference = 4,
    DuplicateFieldName = 5,

    // Enum typing errors.
    DuplicateTagName = 6,
    DuplicateTagValue = 7,
    EnumValueOutOfRange = 8,
    InvalidTagRange = 9,
    OverlappingTagRange = 10,
    DuplicateDefaultTag = 11,

    // Width and value errors.
    BitsOutOfRange = 12,
    FixedValueOutOfRange = 13,

    // Constraint errors.
    ConstraintTargetNotAField = 14,
    InvalidConstraintValue = 15,
    ConstraintValueOutOfRange = 16,
    DuplicateConstraint = 17,
    ConflictingChildConstraints = 18,

    // Size and count binding errors.
    DuplicateSizeField = 19,
    InvalidSizeReferent = 20,
    RedundantArraySize = 21,

    // Payload errors.
    DuplicatePayload = 22,
    MissingPayload = 23,

    // Padding errors.
    InvalidPaddingField = 24,

    // Optional field errors.
    InvalidOptionalField = 25,
    InvalidConditionField = 26,
    InvalidConditionValue = 27,
    OverlappingOptionalBit = 28,

    // Layout errors.
    ChunkNotByteAligned = 29,
    UnsupportedChunkWidth = 30,
    UnalignedFieldSize = 31,
    UnalignedRecordSize = 32,
    VariableTrailer = 33,
    PaddedRegionTooSmall = 34,
    UnboundedArrayElement = 35,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "E{}", *self as u16)
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        format!("{}", code)
    }
}

/// Aggregate compiler diagnostics.
///
/// Checks within one stage run to completion and accumulate; the stage
/// fails afterwards if any error was recorded.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub diagnostics: Vec<Diagnostic<FileId>>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn push(&mut self, diagnostic: Diagnostic<FileId>) {
        self.diagnostics.push(diagnostic)
    }

    pub fn err_or<T>(self, value: T) -> Result<T, Diagnostics> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }

    pub fn emit(
        &self,
        sources: &SourceDatabase,
        writer: &mut dyn termcolor::WriteColor,
    ) -> Result<(), files::Error> {
        let config = term::Config::default();
        for d in self.diagnostics.iter() {
            term::emit(writer, &config, sources, d)?;
        }
        Ok(())
    }
}
