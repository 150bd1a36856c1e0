use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use console::style;
use knotd_lib::{ServerConfig, Session};

#[derive(Parser)]
#[command(
    name = "knotd",
    about = "Evaluate graph constraint requests against a process-local store.",
    long_about = "Requests are read from -e arguments, a file, or stdin, one per line.\n\
                  Lines starting with `#` are comments. Each request prints one reply\n\
                  line; the exit code is 1 if any request errored."
)]
struct Args {
    /// Request to evaluate; repeatable, evaluated in order.
    #[arg(short = 'e', long = "execute", value_name = "REQUEST")]
    execute: Vec<String>,

    /// File of requests, one per line.
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    file: Option<PathBuf>,

    /// Server configuration (INI).
    #[arg(long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Instance id (hex) stamped into guids; overrides the config.
    #[arg(long = "instance", value_name = "HEX")]
    instance: Option<String>,

    /// More logging; repeat for debug output.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        eprintln!("{}: {}", record.level().as_str().to_lowercase(), record.args());
    }

    fn flush(&self) {}
}

fn fail(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("{} {message}", style("knotd:").red().bold());
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let args = Args::parse();

    static LOGGER: StderrLogger = StderrLogger;
    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }

    let mut config = match &args.config {
        None => ServerConfig::default(),
        Some(path) => {
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => return fail(format_args!("{}: {err}", path.display())),
            };
            match ServerConfig::from_ini(&text) {
                Ok(config) => config,
                Err(err) => return fail(format_args!("{}: {err}", path.display())),
            }
        }
    };
    if let Some(instance) = &args.instance {
        match u32::from_str_radix(instance, 16) {
            Ok(id) => config.instance_id = id,
            Err(_) => return fail(format_args!("bad instance id `{instance}`")),
        }
    }

    let mut session = Session::new(config);
    let mut errors = 0usize;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let mut evaluate = |session: &mut Session, line: &str| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return true;
        }
        let reply = session.submit(line);
        let ok = reply.starts_with("ok ");
        if !ok && console::user_attended_stderr() {
            eprintln!("{} {line}", style("failed:").red());
        }
        let _ = writeln!(out, "{reply}");
        ok
    };

    for request in &args.execute {
        if !evaluate(&mut session, request) {
            errors += 1;
        }
    }

    if let Some(path) = &args.file {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => return fail(format_args!("{}: {err}", path.display())),
        };
        for line in text.lines() {
            if !evaluate(&mut session, line) {
                errors += 1;
            }
        }
    } else if args.execute.is_empty() {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => return fail(format_args!("stdin: {err}")),
            };
            if !evaluate(&mut session, &line) {
                errors += 1;
            }
        }
    }

    if errors > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
