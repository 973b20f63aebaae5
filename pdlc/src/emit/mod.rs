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

//! Target emitters.
//!
//! Every backend walks the same canonical representation and renders
//! text through the shared line writer. Rendering is deterministic:
//! declaration order drives everything, and no hash-ordered container
//! is consulted while emitting.

use crate::cir;

pub mod cxx;
pub mod json;
pub mod python;
pub mod rust;

/// Supported output languages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Target {
    Rust,
    Cxx,
    Python,
}

/// Render the lowered schema for the selected target.
pub fn generate(schema: &cir::Schema, target: Target) -> String {
    match target {
        Target::Rust => rust::generate(schema),
        Target::Cxx => cxx::generate(schema),
        Target::Python => python::generate(schema),
    }
}

/// Indentation-aware line writer shared by the backends.
pub struct Writer {
    out: String,
    indent: usize,
    tab: &'static str,
}

impl Writer {
    pub fn new(tab: &'static str) -> Writer {
        Writer { out: String::new(), indent: 0, tab }
    }

    /// Append one line at the current indentation.
    pub fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            self.out.push('\n');
            return;
        }
        for _ in 0..self.indent {
            self.out.push_str(self.tab);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    /// Append a line and indent the following ones.
    pub fn open(&mut self, text: impl AsRef<str>) {
        self.line(text);
        self.indent += 1;
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn dedent(&mut self) {
        self.indent -= 1;
    }

    /// Dedent and append a closing line.
    pub fn close(&mut self, text: impl AsRef<str>) {
        self.indent -= 1;
        self.line(text);
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// Format a bit mask of the given width as a hex literal.
pub fn mask(width: usize) -> String {
    if width >= 64 {
        return "0xffffffffffffffff".to_owned();
    }
    format!("{:#x}", (1u64 << width) - 1)
}

/// Round a bit width up to the nearest machine integer width.
pub fn scalar_bits(width: usize) -> usize {
    for bits in [8, 16, 32, 64] {
        if width <= bits {
            return bits;
        }
    }
    panic!("scalar width {width} exceeds 64 bits")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_indents_blocks() {
        let mut w = Writer::new("    ");
        w.open("fn main() {");
        w.line("let x = 1;");
        w.close("}");
        assert_eq!(w.finish(), "fn main() {\n    let x = 1;\n}\n");
    }

    #[test]
    fn masks() {
        assert_eq!(mask(1), "0x1");
        assert_eq!(mask(7), "0x7f");
        assert_eq!(mask(57), "0x1ffffffffffffff");
        assert_eq!(mask(64), "0xffffffffffffffff");
    }

    #[test]
    fn scalar_widths() {
        assert_eq!(scalar_bits(1), 8);
        assert_eq!(scalar_bits(9), 16);
        assert_eq!(scalar_bits(33), 64);
    }
}
