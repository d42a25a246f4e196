//! The privileged side of an action call.
//!
//! `privileged-actions <module> <action>` runs as root through `sudo`.
//! It reads the JSON arguments from stdin, resolves and validates the
//! call, runs the action once and prints exactly one JSON [`Outcome`]
//! to stdout.  Diagnostics go to stderr; the exit code tells the caller
//! which kind of failure happened.

use crate::{
    action::Param,
    error::Error,
    outcome::Outcome,
    registry::Registry,
    types::REDACTED,
    validate,
};
use nix::unistd::geteuid;
use privileged_log::{debug, error, info};
use serde_json::{json, Value};
use std::io::{Read, Write};

/// Name of the dispatcher binary.
pub const PROGRAM: &str = "privileged-actions";

/// Exit code for malformed calls and argument errors.
pub const EXIT_SYNTAX: i32 = 10;

/// Exit code for permission errors.
pub const EXIT_PERM: i32 = 20;

/// Exit code for any other failure of the dispatcher itself.
pub const EXIT_FAILURE: i32 = 1;

/// Maximum accepted length of the JSON arguments in bytes.
pub const MAX_REQUEST_LENGTH: u64 = 1_000_000;

/// Arguments used when the caller sends none.
pub fn empty_arguments() -> Value {
    json!({"args": [], "kwargs": {}})
}

/// Resolve, validate and run a single privileged action.
///
/// Returns an error if the call was rejected; an error raised by the
/// action itself is part of the returned [`Outcome`].
pub fn call(
    registry: &Registry,
    module: &str,
    action: &str,
    arguments: &Value,
) -> Result<Outcome, Error> {
    let function = registry.resolve(module, action)?;
    let values = validate::validate(function.params(), arguments)?;

    info!(
        "Running privileged action - {}.{}({})",
        module,
        action,
        redacted(function.params(), &values)
    );

    let outcome = function.invoke(values)?;
    if let Outcome::Exception { exception } = &outcome {
        error!(
            "Error running privileged action {}.{} - {}",
            module, action, exception
        );
        for line in &exception.traceback {
            debug!("{}", line);
        }
    }

    Ok(outcome)
}

/// Format bound arguments for logging with secrets replaced.
pub(crate) fn redacted(params: &[Param], values: &[Value]) -> String {
    params
        .iter()
        .zip(values)
        .map(|(param, value)| {
            if param.ty.is_secret() && !value.is_null() {
                format!("{}={}", param.name, REDACTED)
            } else {
                format!("{}={}", param.name, value)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read the JSON arguments from the caller.
///
/// Empty input is the same as no arguments.
pub fn read_arguments<R: Read>(reader: R, no_args: bool) -> Result<Value, Error> {
    if no_args {
        return Ok(empty_arguments());
    }

    let mut request = Vec::new();
    reader
        .take(MAX_REQUEST_LENGTH + 1)
        .read_to_end(&mut request)?;
    if request.len() as u64 > MAX_REQUEST_LENGTH {
        return Err(Error::syntax("Request too large"));
    }
    if request.iter().all(u8::is_ascii_whitespace) {
        return Ok(empty_arguments());
    }

    serde_json::from_slice(&request).map_err(|_| Error::syntax("Arguments on stdin not JSON."))
}

/// Exit code reported to the caller for a rejected call.
pub fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Syntax(_) | Error::Type(_) | Error::InvalidAction(_) => EXIT_SYNTAX,
        Error::PermissionDenied | Error::UserNotFound(_) => EXIT_PERM,
        _ => EXIT_FAILURE,
    }
}

/// Fail unless the effective user is root.
pub fn require_root() -> Result<(), Error> {
    if geteuid().is_root() {
        Ok(())
    } else {
        Err(Error::PermissionDenied)
    }
}

/// Run the dispatcher and return the process exit code.
pub fn run<R: Read, W: Write>(
    registry: &Registry,
    module: &str,
    action: &str,
    no_args: bool,
    input: R,
    mut output: W,
) -> i32 {
    let result = read_arguments(input, no_args)
        .and_then(|arguments| call(registry, module, action, &arguments))
        .and_then(|outcome| write_outcome(&mut output, &outcome));

    match result {
        Ok(()) => 0,
        Err(err) => {
            error!("{}", err);
            exit_code(&err)
        }
    }
}

fn write_outcome<W: Write>(output: &mut W, outcome: &Outcome) -> Result<(), Error> {
    serde_json::to_writer(&mut *output, outcome)?;
    output.write_all(b"\n")?;
    output.flush().map_err(Into::into)
}
