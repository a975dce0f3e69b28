use std::fs::{read_to_string, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::{exit, Command};

use clap::Parser;

mod codegen;
mod interpreter;
mod ir;
mod optimizer;

/// an optimizing ahead-of-time Brainfuck compiler
#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// path to the brainf*ck source file
    path: PathBuf,

    /// skip assembly/linking and run the optimized IR directly
    #[arg(short, long)]
    interpret: bool,

    /// print a diagnostic for loops recognized as non-terminating
    #[arg(short, long)]
    warn: bool,
}

fn run_command(cmd: &mut Command) -> std::io::Result<()> {
    let status = cmd.output()?;
    let program = cmd.get_program().to_string_lossy();

    if !status.status.success() {
        eprintln!("! {program} exited with {}", status.status);
        if !status.stdout.is_empty() {
            eprintln!("? {program} stdout:\n{}", String::from_utf8_lossy(&status.stdout));
        }
        if !status.stderr.is_empty() {
            eprintln!("? {program} stderr:\n{}", String::from_utf8_lossy(&status.stderr));
        }
        exit(status.status.code().unwrap_or(1));
    }

    Ok(())
}

fn entry(cli: Cli) -> anyhow::Result<()> {
    let source = read_to_string(&cli.path)?;
    ir::verify(&source)?;

    println!("Compiling...");
    let raw = ir::parse(&source);
    let optimized = optimizer::optimize(raw, cli.warn);

    if cli.interpret {
        return interpreter::interpret(&optimized);
    }

    let mut asm_path = cli.path.clone();
    asm_path.set_extension("s");
    {
        let mut out = BufWriter::new(File::create(&asm_path)?);
        codegen::to_asm(&optimized, &mut out)?;
        out.flush()?;
    }

    let mut object_path = cli.path.clone();
    object_path.set_extension("o");

    println!("Assembling...");
    run_command(Command::new("as").arg(&asm_path).arg("-o").arg(&object_path))?;

    let mut binary_path = cli.path.clone();
    binary_path.set_extension("");

    println!("Linking...");
    run_command(Command::new("ld").arg(&object_path).arg("-o").arg(&binary_path))?;

    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = entry(cli) {
        eprintln!("! fatal error: {err:?}");
        exit(1);
    }
}
