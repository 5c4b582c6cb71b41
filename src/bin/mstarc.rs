//! the main compiler binary. takes a source file and an output path for the
//! generated NASM, plus debug flags for the abstract-instruction dump and
//! the elimination report.
//!
//! run with `--help` for more info.

use clap::{CommandFactory, Parser};

use mstar::common::Config;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None, ignore_errors = true)]
struct Args {
    /// the source file
    #[arg(long = "in", value_name = "path")]
    input: Option<String>,
    /// the NASM output file
    #[arg(long = "out", value_name = "path")]
    output: Option<String>,
    /// dump abstract instructions to stderr before register allocation
    #[arg(long, default_value_t = false)]
    print_ins: bool,
    /// report output-irrelevant elimination decisions to stderr
    #[arg(long, default_value_t = false)]
    print_remove: bool,
}

fn main() {
    let args = Args::parse();

    // Missing paths print the usage and succeed, matching the original
    // tool's behavior.
    let (Some(input), Some(output)) = (&args.input, &args.output) else {
        Args::command().print_help().expect("usage should print");
        return;
    };

    let config = Config {
        print_ins: args.print_ins,
        print_remove: args.print_remove,
        ..Config::default()
    };

    let source = match std::fs::read_to_string(input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{input}: {e}");
            std::process::exit(1);
        }
    };

    match mstar::compile(&source, &config) {
        Ok(compiled) => {
            if config.print_ins {
                for line in &compiled.pre_alloc {
                    eprintln!("{line}");
                }
            }
            if config.print_remove {
                for r in &compiled.removed {
                    eprintln!("{r}");
                }
            }
            if let Err(e) = std::fs::write(output, compiled.asm) {
                eprintln!("{output}: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
