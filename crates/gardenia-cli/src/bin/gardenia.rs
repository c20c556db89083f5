use std::{
    borrow::Cow,
    fs,
    io::{self, IsTerminal, Read, Write},
    path::PathBuf,
};

use anyhow::bail;
use clap::Parser;
use gardenia::Autodiff;
use termcolor::{ColorChoice, NoColor, StandardStream, WriteColor};

/// Apply reverse-mode automatic differentiation to a WebAssembly module.
#[derive(Debug, Parser)]
#[command(name = "gardenia", version)]
struct Cli {
    /// Input file path, or `-` to read from stdin.
    input: PathBuf,

    /// Do not validate the input WebAssembly module.
    #[clap(long)]
    no_validate: bool,

    /// Output file path; if not provided, will write to stdout.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Output the WebAssembly text format instead of the binary format.
    #[clap(short = 't', long)]
    wat: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let raw = if args.input.to_str() == Some("-") {
        let mut stdin = Vec::new();
        io::stdin().read_to_end(&mut stdin)?;
        stdin
    } else {
        fs::read(args.input)?
    };
    let before = match wat::parse_bytes(&raw)? {
        Cow::Borrowed(bytes) => {
            assert_eq!((bytes.as_ptr(), bytes.len()), (raw.as_ptr(), raw.len()));
            raw
        }
        Cow::Owned(bytes) => bytes,
    };
    let ad = if args.no_validate {
        Autodiff::no_validate()
    } else {
        Autodiff::new()
    };
    let after = ad.transform(&before)?;
    if args.wat {
        match args.output {
            Some(path) => {
                let writer = NoColor::new(io::BufWriter::new(fs::File::create(path)?));
                print_wat(&after, writer)?;
            }
            None => {
                let color = if io::stdout().is_terminal() {
                    ColorChoice::Auto
                } else {
                    ColorChoice::Never
                };
                print_wat(&after, StandardStream::stdout(color))?;
            }
        }
    } else {
        match args.output {
            Some(path) => fs::write(path, after)?,
            None => {
                let mut stdout = std::io::stdout();
                if stdout.is_terminal() {
                    bail!("can't print binary to terminal; redirect or give `--output` or `--wat`");
                }
                stdout.write_all(&after)?;
            }
        }
    }
    Ok(())
}

fn print_wat(wasm: &[u8], writer: impl WriteColor) -> anyhow::Result<()> {
    wasmprinter::Config::new().print(wasm, &mut wasmprinter::PrintTermcolor(writer))?;
    Ok(())
}
