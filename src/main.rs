use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use basalt::logging::{self, LogSink};
use basalt::{InterpretEngine, JitEngine, Options};

#[derive(Parser)]
#[command(name = "basalt")]
#[command(about = "A method-at-a-time JIT for block-structured SSA bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Dump each compiled function to function_<name>.dump
    #[arg(short = 'd')]
    debug: bool,

    /// Write enabled log topics to FILE, or to stdout with `-`
    #[arg(long = "log", value_name = "FILE")]
    log: Option<String>,

    /// Enable every log topic
    #[arg(long = "log-all")]
    log_all: bool,

    /// Enable a single log topic (lir, llog, lrange, llines, rlog,
    /// rhints, rsplit, machine, alloc, address, compile, result)
    #[arg(long = "log-lir")]
    log_lir: bool,
    #[arg(long = "log-llog", hide = true)]
    log_llog: bool,
    #[arg(long = "log-lrange", hide = true)]
    log_lrange: bool,
    #[arg(long = "log-llines", hide = true)]
    log_llines: bool,
    #[arg(long = "log-rlog", hide = true)]
    log_rlog: bool,
    #[arg(long = "log-rhints", hide = true)]
    log_rhints: bool,
    #[arg(long = "log-rsplit", hide = true)]
    log_rsplit: bool,
    #[arg(long = "log-machine", hide = true)]
    log_machine: bool,
    #[arg(long = "log-alloc", hide = true)]
    log_alloc: bool,
    #[arg(long = "log-address", hide = true)]
    log_address: bool,
    #[arg(long = "log-compile", hide = true)]
    log_compile: bool,
    #[arg(long = "log-result", hide = true)]
    log_result: bool,

    /// The bytecode file to run
    file: PathBuf,
}

impl RunArgs {
    fn enabled_topics(&self) -> Vec<String> {
        let flags = [
            (self.log_all, "all"),
            (self.log_lir, "lir"),
            (self.log_llog, "llog"),
            (self.log_lrange, "lrange"),
            (self.log_llines, "llines"),
            (self.log_rlog, "rlog"),
            (self.log_rhints, "rhints"),
            (self.log_rsplit, "rsplit"),
            (self.log_machine, "machine"),
            (self.log_alloc, "alloc"),
            (self.log_address, "address"),
            (self.log_compile, "compile"),
            (self.log_result, "result"),
        ];
        flags
            .iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, name)| name.to_string())
            .collect()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile functions on demand and run natively
    Jit(RunArgs),
    /// Run in the tree-walking interpreter
    Interpreter(RunArgs),
    /// Print the version
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Jit(args) => run(args, true),
        Commands::Interpreter(args) => run(args, false),
        Commands::Version => {
            println!("basalt {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

fn run(args: RunArgs, jit: bool) -> ExitCode {
    if let Some(spec) = &args.log {
        let sink = match LogSink::open(spec) {
            Ok(sink) => sink,
            Err(e) => {
                eprintln!("error: could not open log sink '{}': {}", spec, e);
                return ExitCode::from(2);
            }
        };
        if logging::init(&args.enabled_topics(), sink).is_err() {
            eprintln!("error: logger was already installed");
            return ExitCode::from(2);
        }
    }

    let program = match basalt::vm::load_file(&args.file) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let options = Options { debug: args.debug };

    let result = if jit {
        JitEngine::new(program, options).and_then(|mut engine| {
            let code = engine.execute()?;
            println!("returned {}", code as i32);
            Ok(code as i32)
        })
    } else {
        let mut engine = InterpretEngine::new(program, options);
        match engine.execute() {
            Ok(code) => Ok(code),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::from(1);
            }
        }
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    }
}
