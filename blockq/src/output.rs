//! Output formatting for CLI commands.
//!
//! Every command result is either printed as text or serialized as one JSON
//! document, selected once by `--json`.

use anyhow::Result;
use blockq_core::RemovedBlock;
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write output using the configured format.
    ///
    /// `text_fn` is only called in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Print one text line immediately. Ignored in JSON mode.
    pub fn line(&self, text: impl AsRef<str>) -> Result<()> {
        if !self.is_json() {
            writeln!(&self.stdout, "{}", text.as_ref())?;
        }
        Ok(())
    }

    /// Write an error to stderr, as JSON with `success=false` in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// JSON output records
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub algorithm: String,
    pub filestore: bool,
    pub chunker: String,
}

/// One completed entry of an add.
#[derive(Debug, Clone, Serialize)]
pub struct AddedEntry {
    pub name: String,
    pub cid: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct AddOutput {
    pub success: bool,
    pub result_code: u8,
    pub entries: Vec<AddedEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct GetOutput {
    pub success: bool,
    pub result_code: u8,
    pub cid: String,
    pub destination: String,
}

#[derive(Debug, Serialize)]
pub struct BlockStatOutput {
    pub success: bool,
    pub result_code: u8,
    pub cid: String,
    pub size: u64,
    pub backend: String,
}

#[derive(Debug, Serialize)]
pub struct BlockPutOutput {
    pub success: bool,
    pub result_code: u8,
    pub cid: String,
}

#[derive(Debug, Serialize)]
pub struct BlockRmOutput {
    pub success: bool,
    pub result_code: u8,
    pub outcomes: Vec<RemovedBlock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinInfo {
    pub cid: String,
    pub mode: String,
}

#[derive(Debug, Serialize)]
pub struct PinListOutput {
    pub success: bool,
    pub result_code: u8,
    pub pins: Vec<PinInfo>,
}

/// Output for `pin add` and `pin rm`.
#[derive(Debug, Serialize)]
pub struct PinChangeOutput {
    pub success: bool,
    pub result_code: u8,
    pub pins: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub blocks_deleted: usize,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilestoreRefInfo {
    pub cid: String,
    pub path: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct FilestoreListOutput {
    pub success: bool,
    pub result_code: u8,
    pub refs: Vec<FilestoreRefInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyInfo {
    pub cid: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FilestoreVerifyOutput {
    pub success: bool,
    pub result_code: u8,
    pub entries: Vec<VerifyInfo>,
}
