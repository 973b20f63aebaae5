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

//! PDL compiler driver.

use argh::FromArgs;
use codespan_reporting::term::{self, termcolor};

use pdlc::{ast, cir, emit, layout, parser, resolver};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum OutputFormat {
    Json,
    Rust,
    Cxx,
    Python,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "rust" => Ok(Self::Rust),
            "cxx" => Ok(Self::Cxx),
            "python" => Ok(Self::Python),
            _ => Err(format!(
                "could not parse {input:?}, valid options are 'json', 'rust', 'cxx', 'python'."
            )),
        }
    }
}

/// PDL analyzer and generator.
#[derive(FromArgs, Debug)]
struct Opt {
    /// print tool version and exit.
    #[argh(switch)]
    version: bool,

    /// generate output in this format ("json", "rust", "cxx", "python").
    /// The output is printed on stdout in all cases.
    #[argh(option, default = "OutputFormat::Json")]
    output_format: OutputFormat,

    /// exclude declarations from the generated output.
    #[argh(option)]
    exclude_declaration: Vec<String>,

    /// input file.
    #[argh(positional)]
    input_file: String,
}

/// Remove declarations listed in the input filter.
fn filter_declarations(file: ast::File, exclude_declarations: &[String]) -> ast::File {
    ast::File {
        declarations: file
            .declarations
            .into_iter()
            .filter(|decl| !exclude_declarations.contains(&decl.id().to_owned()))
            .collect(),
        ..file
    }
}

fn run(opt: &Opt) -> Result<(), String> {
    let mut sources = ast::SourceDatabase::new();
    let writer = termcolor::StandardStream::stderr(termcolor::ColorChoice::Always);
    let config = term::Config::default();

    let file = match parser::parse_file(&mut sources, &opt.input_file) {
        Ok(file) => filter_declarations(file, &opt.exclude_declaration),
        Err(err) => {
            term::emit(&mut writer.lock(), &config, &sources, &err)
                .expect("could not print error");
            return Err(String::from("error while parsing input"));
        }
    };

    let file = match resolver::resolve(&file) {
        Ok(file) => file,
        Err(diagnostics) => {
            diagnostics
                .emit(&sources, &mut writer.lock())
                .expect("could not print analyzer diagnostics");
            return Err(String::from("analysis failed"));
        }
    };

    if opt.output_format == OutputFormat::Json {
        println!("{}", emit::json::generate(&file)?);
        return Ok(());
    }

    let layout = match layout::analyze(&file) {
        Ok(layout) => layout,
        Err(diagnostics) => {
            diagnostics
                .emit(&sources, &mut writer.lock())
                .expect("could not print analyzer diagnostics");
            return Err(String::from("analysis failed"));
        }
    };
    let schema = cir::build(&file, &layout);

    let target = match opt.output_format {
        OutputFormat::Rust => emit::Target::Rust,
        OutputFormat::Cxx => emit::Target::Cxx,
        OutputFormat::Python => emit::Target::Python,
        OutputFormat::Json => unreachable!(),
    };
    print!("{}", emit::generate(&schema, target));
    Ok(())
}

fn main() -> Result<(), String> {
    let opt: Opt = argh::from_env();

    if opt.version {
        println!("Packet Description Language compiler version 1.0");
        return Ok(());
    }

    run(&opt)
}
