use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use malie_core::{run, Mode, ToolSettings};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Export,
    Import,
    Disasm,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Export => Mode::Export,
            ModeArg::Import => Mode::Import,
            ModeArg::Disasm => Mode::Disasm,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "MalieScript-CLI", version, about = "Malie script text export/import tool")]
struct Args {
    #[arg(value_enum, required_unless_present = "settings")]
    mode: Option<ModeArg>,

    /// Script container, e.g. exec.dat
    #[arg(required_unless_present = "settings")]
    input: Option<PathBuf>,

    /// Rebuilt script (import) or listing (disasm)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Message translation file [default: <input>.msg.txt]
    #[arg(long)]
    messages: Option<PathBuf>,

    /// String translation file [default: <input>.str.txt]
    #[arg(long)]
    strings: Option<PathBuf>,

    /// Load every setting from a JSON file; other flags are ignored.
    #[arg(long, value_name = "JSON")]
    settings: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Also append log records to this file.
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn setup_logging(debug: bool, log_file: Option<&PathBuf>) -> Result<(), fern::InitError> {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

fn settings_from_args(args: &Args) -> Result<ToolSettings, String> {
    if let Some(path) = args.settings.as_ref() {
        return ToolSettings::load(path).map_err(|e| format!("{}: {}", path.display(), e));
    }

    // clap requires both positionals whenever --settings is absent.
    match (args.mode, args.input.clone()) {
        (Some(mode), Some(input)) => Ok(ToolSettings {
            mode: mode.into(),
            input_path: input,
            output_path: args.output.clone(),
            messages_path: args.messages.clone(),
            strings_path: args.strings.clone(),
            debug: args.debug,
        }),
        _ => Err("mode and input are required without --settings".to_string()),
    }
}

fn main() {
    let args = Args::parse();

    let settings = match settings_from_args(&args) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = setup_logging(settings.debug || args.debug, args.log_file.as_ref()) {
        eprintln!("Failed to initialise logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(settings) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
