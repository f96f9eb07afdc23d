//! JSON output for the CLI. One response object per line on stdout.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;

use super::errors::{CliError, CliResult};

/// Envelope around every command result
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { data: Value },
    Error { code: &'static str, message: String },
}

impl Response {
    pub fn failure(error: &CliError) -> Self {
        Response::Error {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Serialize `response` as one line to `writer`
pub fn emit<W: Write>(writer: &mut W, response: &Response) -> CliResult<()> {
    serde_json::to_writer(&mut *writer, response)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    emit(&mut io::stdout().lock(), &Response::Ok { data })
}

/// Write an error response to stdout
pub fn write_error(error: &CliError) -> CliResult<()> {
    emit(&mut io::stdout().lock(), &Response::failure(error))
}
