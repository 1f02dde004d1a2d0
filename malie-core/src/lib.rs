use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(test)]
pub(crate) mod asm;
pub mod bytecode;
pub mod container;
pub mod repack;
pub mod scan;
mod script;
pub mod text;
pub mod translation;

pub use bytecode::DecodeError;
pub use container::{Container, FormatError};
pub use repack::PackingError;
pub use script::Script;
pub use translation::TranslationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Write message and string translation files next to the input.
    Export,
    /// Apply translation files and save a rebuilt script.
    Import,
    /// Write an instruction listing.
    Disasm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    pub mode: Mode,
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub messages_path: Option<PathBuf>,
    #[serde(default)]
    pub strings_path: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
}

impl ToolSettings {
    /// Read settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// `exec.dat` -> `exec.msg.txt` unless given explicitly.
    pub fn messages_path(&self) -> PathBuf {
        self.messages_path
            .clone()
            .unwrap_or_else(|| self.input_path.with_extension("msg.txt"))
    }

    /// `exec.dat` -> `exec.str.txt` unless given explicitly.
    pub fn strings_path(&self) -> PathBuf {
        self.strings_path
            .clone()
            .unwrap_or_else(|| self.input_path.with_extension("str.txt"))
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("settings file: {0}")]
    Settings(#[from] serde_json::Error),
    #[error("malformed container: {0}")]
    Format(#[from] FormatError),
    #[error("bytecode: {0}")]
    Decode(#[from] DecodeError),
    #[error("translation file: {0}")]
    Translation(#[from] TranslationError),
    #[error("repack failed: {0}")]
    Packing(#[from] PackingError),
}

pub type Result<T> = std::result::Result<T, ScriptError>;

/// Read a translation file if it exists.
fn read_optional(path: &Path) -> Result<Option<String>> {
    if path.exists() {
        Ok(Some(fs::read_to_string(path)?))
    } else {
        log::info!("{} not found, skipping", path.display());
        Ok(None)
    }
}

pub fn run(settings: ToolSettings) -> Result<()> {
    if !settings.input_path.is_file() {
        return Err(ScriptError::Config(format!(
            "Input script does not exist: {}",
            settings.input_path.display()
        )));
    }

    let data = fs::read(&settings.input_path)?;
    let mut script = Script::load(&data)?;

    match settings.mode {
        Mode::Export => {
            let messages_path = settings.messages_path();
            let strings_path = settings.strings_path();
            fs::write(&messages_path, script.export_messages())?;
            fs::write(&strings_path, script.export_strings())?;
            log::info!(
                "exported {} messages to {} and {} strings to {}",
                script.messages().len(),
                messages_path.display(),
                script.strings().len(),
                strings_path.display()
            );
        }
        Mode::Import => {
            let output_path = settings.output_path.as_ref().ok_or_else(|| {
                ScriptError::Config("import needs an output path".to_string())
            })?;

            let messages = read_optional(&settings.messages_path())?;
            let strings = read_optional(&settings.strings_path())?;
            if messages.is_none() && strings.is_none() {
                return Err(ScriptError::Config(format!(
                    "Neither {} nor {} exists",
                    settings.messages_path().display(),
                    settings.strings_path().display()
                )));
            }

            if let Some(text) = messages {
                script.import_messages(&text)?;
            }
            if let Some(text) = strings {
                script.import_strings(&text)?;
            }

            fs::write(output_path, script.save()?)?;
            log::info!("wrote {}", output_path.display());
        }
        Mode::Disasm => {
            let output_path = settings
                .output_path
                .clone()
                .unwrap_or_else(|| settings.input_path.with_extension("dis.txt"));
            fs::write(&output_path, script.listing()?)?;
            log::info!("wrote listing to {}", output_path.display());
        }
    }

    Ok(())
}
