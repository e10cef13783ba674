//! Shared process plumbing for the `controller` and `dstore` binaries.

use crate::error::Error;
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Wrong number of arguments.
pub const EXIT_ARGUMENT_COUNT: i32 = 1;
/// An argument could not be parsed or is out of range.
pub const EXIT_INVALID_ARGUMENT: i32 = 2;
/// A socket could not be bound or connected, or a link was lost.
pub const EXIT_SOCKET: i32 = 3;
/// The storage directory could not be prepared.
pub const EXIT_FILESYSTEM: i32 = 4;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Exit code for a command-line parse failure, `None` for help and version output.
pub fn parse_exit_code(kind: ErrorKind) -> Option<i32> {
    match kind {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => None,
        ErrorKind::MissingRequiredArgument
        | ErrorKind::UnknownArgument
        | ErrorKind::TooManyValues
        | ErrorKind::TooFewValues
        | ErrorKind::WrongNumberOfValues => Some(EXIT_ARGUMENT_COUNT),
        _ => Some(EXIT_INVALID_ARGUMENT),
    }
}

/// Parse the process arguments, exiting with the matching code on failure.
pub fn parse_args<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = parse_exit_code(e.kind());
            let _ = e.print();
            std::process::exit(code.unwrap_or(0));
        }
    }
}

/// Exit code for a fatal startup or runtime error.
pub fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Config(_) | Error::Protocol(_) => EXIT_INVALID_ARGUMENT,
        Error::Storage(_) => EXIT_FILESYSTEM,
        Error::Network(_) | Error::Timeout | Error::Internal(_) => EXIT_SOCKET,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NetworkError, StorageError};

    #[derive(Parser, Debug)]
    struct Args {
        port: u16,
        #[arg(value_parser = clap::value_parser!(u64).range(1..))]
        timeout_ms: u64,
    }

    fn code_for(argv: &[&str]) -> Option<i32> {
        let err = Args::try_parse_from(argv).unwrap_err();
        parse_exit_code(err.kind())
    }

    #[test]
    fn test_argument_count_errors() {
        assert_eq!(code_for(&["bin", "4000"]), Some(EXIT_ARGUMENT_COUNT));
        assert_eq!(
            code_for(&["bin", "4000", "10", "extra"]),
            Some(EXIT_ARGUMENT_COUNT)
        );
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(code_for(&["bin", "port", "10"]), Some(EXIT_INVALID_ARGUMENT));
        assert_eq!(code_for(&["bin", "4000", "0"]), Some(EXIT_INVALID_ARGUMENT));
        assert_eq!(code_for(&["bin", "70000", "10"]), Some(EXIT_INVALID_ARGUMENT));
    }

    #[test]
    fn test_runtime_exit_codes() {
        assert_eq!(
            exit_code(&NetworkError::ConnectionClosed.into()),
            EXIT_SOCKET
        );
        assert_eq!(
            exit_code(&StorageError::NotADirectory("x".into()).into()),
            EXIT_FILESYSTEM
        );
        assert_eq!(
            exit_code(&Error::Config("bad".into())),
            EXIT_INVALID_ARGUMENT
        );
    }
}
