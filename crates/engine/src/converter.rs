use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use crate::config::ToolConfig;

/// Options handed to the conversion tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// OCR language profile, e.g. "eng+kan"
    pub language: String,
    pub dpi: u32,
    /// Straighten skewed pages
    pub deskew: bool,
    pub remove_background: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            dpi: 300,
            deskew: true,
            remove_background: false,
        }
    }
}

/// The external conversion operation.
///
/// The engine only builds and supervises the command; whether the run worked
/// is decided by the output file, never by anything the tool reports.
pub trait ConversionTool: Send + Sync {
    /// Check that the tool can be run at all
    fn validate(&self) -> Result<()>;

    /// Command converting `input` into `output`
    fn command(&self, input: &Path, output: &Path, options: &ConversionOptions) -> Command;

    /// Human-readable name for logs
    fn name(&self) -> String;
}

/// Conversion tool described by a program and argument templates
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    config: ToolConfig,
}

impl CommandTemplate {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// Expand the argument templates for one job
    pub fn render_args(&self, input: &Path, output: &Path, options: &ConversionOptions) -> Vec<String> {
        let render = |template: &String| {
            template
                .replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
                .replace("{language}", &options.language)
                .replace("{dpi}", &options.dpi.to_string())
        };

        let mut args: Vec<String> = self.config.args.iter().map(render).collect();
        if options.deskew {
            args.extend(self.config.deskew_args.iter().map(render));
        }
        if options.remove_background {
            args.extend(self.config.remove_background_args.iter().map(render));
        }
        args.extend(self.config.trailing_args.iter().map(render));
        args
    }
}

impl ConversionTool for CommandTemplate {
    fn validate(&self) -> Result<()> {
        let program = &self.config.program;
        if program.as_os_str().is_empty() {
            return Err(anyhow!("No conversion tool configured"));
        }
        if program.components().count() > 1 {
            // Explicit path: must exist
            if !program.exists() {
                return Err(anyhow!("Conversion tool not found at: {}", program.display()));
            }
            return Ok(());
        }
        find_in_path(program)
            .map(|_| ())
            .with_context(|| format!("Conversion tool '{}' not found on PATH", program.display()))
    }

    fn command(&self, input: &Path, output: &Path, options: &ConversionOptions) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.render_args(input, output, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn name(&self) -> String {
        self.config.program.display().to_string()
    }
}

/// Resolve a bare program name against PATH
fn find_in_path(program: &Path) -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH").ok_or_else(|| anyhow!("PATH is not set"))?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Ok(exe);
            }
        }
    }
    Err(anyhow!("{} not found in any PATH entry", program.display()))
}
