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

//! PDL parser, analyzer, and code generators.
//!
//! The compiler is a pure pipeline: parse, resolve, analyze layout,
//! lower to the canonical representation, and emit for the selected
//! target. Each stage owns its output and never mutates the previous
//! stage's result.

pub mod ast;
pub mod cir;
pub mod emit;
pub mod layout;
pub mod parser;
pub mod report;
pub mod resolver;

use codespan_reporting::diagnostic::Diagnostic;

/// Run the front- and middle-end over source text: parse, resolve,
/// analyze, and lower. Returns the emitter-ready schema.
pub fn compile_inline(
    sources: &mut ast::SourceDatabase,
    name: &str,
    source: String,
) -> Result<cir::Schema, Vec<Diagnostic<ast::FileId>>> {
    let file = parser::parse_inline(sources, name, source).map_err(|diagnostic| vec![diagnostic])?;
    let file = resolver::resolve(&file).map_err(|diagnostics| diagnostics.diagnostics)?;
    let layout = layout::analyze(&file).map_err(|diagnostics| diagnostics.diagnostics)?;
    Ok(cir::build(&file, &layout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_output_is_deterministic() {
        // The emitted code must not depend on any hash iteration
        // order, for every backend.
        let source = r#"
            little_endian_packets

            enum Kind : 8 {
                EVENT = 0x01,
                COMMAND = 0x02,
            }

            struct Entry {
                key : 16,
                value : 16,
            }

            packet Frame {
                kind : Kind,
                _size_(_payload_) : 8,
                _payload_,
            }

            packet Command : Frame (kind = COMMAND) {
                _count_(entries) : 8,
                entries : Entry[],
            }
        "#;

        let mut outputs = vec![];
        for _ in 0..3 {
            let mut sources = ast::SourceDatabase::new();
            let schema = compile_inline(&mut sources, "frame.pdl", source.to_owned()).unwrap();
            outputs.push((
                emit::generate(&schema, emit::Target::Rust),
                emit::generate(&schema, emit::Target::Cxx),
                emit::generate(&schema, emit::Target::Python),
            ));
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[1], outputs[2]);
    }
}
