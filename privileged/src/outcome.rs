//! Results and errors crossing the privilege boundary.
//!
//! The dispatcher prints exactly one [`Outcome`] on stdout.  Errors
//! raised by an action are not lost on the way: they travel as an
//! [`Exception`] record with the error's type path, its message and a
//! textual traceback, and are turned back into an error on the caller
//! side.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    any::{type_name, Any},
    error::Error as StdError,
    fmt,
};

/// Module path reported for captured panics.
pub const PANIC_MODULE: &str = "std::panic";

/// Name reported for captured panics.
pub const PANIC_NAME: &str = "Panic";

/// The single JSON document printed by a privileged action.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Outcome {
    Success {
        #[serde(rename = "return")]
        value: Value,
    },
    Exception {
        exception: Exception,
    },
}

impl Outcome {
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success {
            value: value.into(),
        }
    }

    /// Convert any error into an exception outcome.
    pub fn from_error<E: StdError + 'static>(err: &E) -> Self {
        Self::Exception {
            exception: Exception::from_error(err),
        }
    }

    /// Convert a panic payload caught with `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Exception {
            exception: Exception::from_panic(payload),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// An error raised by a privileged action.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Exception {
    /// Module path of the error type, e.g. `std::io::error`.
    pub module: String,
    /// Name of the error type, e.g. `Error`.
    pub name: String,
    /// Error arguments; the first one is the error message.
    pub args: Vec<Value>,
    /// Human-readable cause chain of the error.
    pub traceback: Vec<String>,
    /// Standard error of the action process, attached by the caller.
    #[serde(skip)]
    pub stderr: String,
}

impl Exception {
    /// Build the exception from an error and its chain of sources.
    ///
    /// The traceback is the cause chain only.  The error is converted
    /// after it was returned from the action, so a stack captured here
    /// would show the conversion and not where the error was raised.
    pub fn from_error<E: StdError + 'static>(err: &E) -> Self {
        let (module, name) = split_type_name(type_name::<E>());

        let mut traceback = vec![format!("Error: {}", err)];
        let mut source = err.source();
        while let Some(cause) = source {
            traceback.push(format!("Caused by: {}", cause));
            source = cause.source();
        }

        Self {
            module: module.to_string(),
            name: name.to_string(),
            args: vec![Value::String(err.to_string())],
            traceback,
            stderr: String::new(),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        Self {
            module: PANIC_MODULE.to_string(),
            name: PANIC_NAME.to_string(),
            traceback: vec![format!("panicked: {}", message)],
            args: vec![Value::String(message)],
            stderr: String::new(),
        }
    }

    /// The error message, as the first string argument.
    pub fn message(&self) -> String {
        self.args
            .iter()
            .map(|arg| match arg {
                Value::String(arg) => arg.clone(),
                arg => arg.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Full type path of the raised error.
    pub fn type_path(&self) -> String {
        if self.module.is_empty() {
            self.name.clone()
        } else {
            format!("{}::{}", self.module, self.name)
        }
    }

    /// Returns `true` if the exception was raised as an `E`.
    pub fn is<E: ?Sized>(&self) -> bool {
        let (module, name) = split_type_name(type_name::<E>());
        self.module == module && self.name == name
    }

    /// Turn the exception back into the error type that raised it.
    ///
    /// Returns the exception itself if it was raised by another type or
    /// could not be rebuilt from its arguments.
    pub fn reconstruct<E: FromException>(self) -> Result<E, Self> {
        if !self.is::<E>() {
            return Err(self);
        }
        match E::from_exception(&self) {
            Some(err) => Ok(err),
            None => Err(self),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_path(), self.message())
    }
}

impl StdError for Exception {}

/// Error types that can be rebuilt from a transported [`Exception`].
pub trait FromException: Sized {
    fn from_exception(exception: &Exception) -> Option<Self>;
}

impl FromException for std::io::Error {
    fn from_exception(exception: &Exception) -> Option<Self> {
        Some(Self::new(std::io::ErrorKind::Other, exception.message()))
    }
}

/// Return values of privileged action functions.
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> Outcome {
        Outcome::success(Value::Null)
    }
}

impl<T, E> IntoOutcome for Result<T, E>
where
    T: serde::Serialize,
    E: StdError + 'static,
{
    fn into_outcome(self) -> Outcome {
        match self.map(serde_json::to_value) {
            Ok(Ok(value)) => Outcome::success(value),
            Ok(Err(err)) => Outcome::from_error(&err),
            Err(err) => Outcome::from_error(&err),
        }
    }
}

/// Split a type path into its module path and the type name.
///
/// Generic arguments stay with the name: `a::B<c::D>` is `("a", "B<c::D>")`.
pub(crate) fn split_type_name(path: &str) -> (&str, &str) {
    let base = path.find('<').map_or(path, |generic| &path[..generic]);
    match base.rfind("::") {
        Some(index) => (&path[..index], &path[index + 2..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::{split_type_name, Exception, FromException, IntoOutcome, Outcome};
    use serde_json::{json, Value};
    use std::{fmt, io, panic};

    #[derive(Debug)]
    struct RuntimeError(String);

    impl fmt::Display for RuntimeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl std::error::Error for RuntimeError {}

    impl FromException for RuntimeError {
        fn from_exception(exception: &Exception) -> Option<Self> {
            exception.args.first()?.as_str().map(|s| Self(s.to_string()))
        }
    }

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("failed to write configuration")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_split_type_name() {
        assert_eq!(split_type_name("std::io::error::Error"), ("std::io::error", "Error"));
        assert_eq!(split_type_name("Plain"), ("", "Plain"));
        assert_eq!(
            split_type_name("a::Wrapper<b::Inner>"),
            ("a", "Wrapper<b::Inner>")
        );
    }

    #[test]
    fn test_success_wire_format() {
        let outcome = Ok::<_, io::Error>(vec![1, 2]).into_outcome();
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"result": "success", "return": [1, 2]})
        );
        assert_eq!(().into_outcome(), Outcome::success(Value::Null));
    }

    #[test]
    fn test_exception_wire_format() {
        let outcome = Err::<(), _>(RuntimeError("foo-exception".to_string())).into_outcome();
        let value = serde_json::to_value(&outcome).unwrap();

        assert_eq!(value["result"], "exception");
        assert_eq!(value["exception"]["name"], "RuntimeError");
        assert!(value["exception"]["module"]
            .as_str()
            .unwrap()
            .ends_with("outcome::tests"));
        assert_eq!(value["exception"]["args"], json!(["foo-exception"]));
        assert_eq!(value["exception"]["traceback"][0], "Error: foo-exception");
        assert!(value["exception"].get("stderr").is_none());

        let parsed: Outcome = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, outcome);
    }

    #[test]
    fn test_traceback_cause_chain() {
        let err = Wrapped(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        let exception = Exception::from_error(&err);

        assert_eq!(
            exception.traceback,
            vec!["Error: failed to write configuration", "Caused by: denied"]
        );
    }

    #[test]
    fn test_reconstruct() {
        let exception = Exception::from_error(&RuntimeError("boom".to_string()));
        assert!(exception.is::<RuntimeError>());
        assert!(!exception.is::<io::Error>());

        let err: RuntimeError = exception.clone().reconstruct().unwrap();
        assert_eq!(err.0, "boom");

        let exception = exception.reconstruct::<io::Error>().unwrap_err();
        assert_eq!(exception.message(), "boom");
        assert!(exception.to_string().ends_with("RuntimeError: boom"));
    }

    #[test]
    fn test_panic_payload() {
        let payload = panic::catch_unwind(|| panic!("out of cheese")).unwrap_err();
        let exception = Exception::from_panic(payload);

        assert_eq!(exception.module, "std::panic");
        assert_eq!(exception.name, "Panic");
        assert_eq!(exception.args, vec![json!("out of cheese")]);

        let payload = panic::catch_unwind(|| panic!("{} cheese", 0)).unwrap_err();
        assert_eq!(Exception::from_panic(payload).message(), "0 cheese");
    }
}
