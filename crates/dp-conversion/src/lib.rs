//! Conversion of raw files through persistent Matlab, Julia, R and Python interpreters.

pub mod bridge;
pub mod framing;
pub mod language;
pub mod runner;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod uniform;

pub use bridge::{
    check_script_name, InterpreterBridge, InterpreterFactory, ScriptInterpreter, SubprocessFactory,
};
pub use framing::{Markers, Response, DEFAULT_MARKER_PREFIX};
pub use language::Language;
pub use runner::{
    CheckReport, ConversionJob, ConversionRunner, DEFAULT_BLOCK_SIZE, DEFAULT_CALL_LIMIT,
    MIN_BLOCK_SIZE,
};
pub use session::{BridgeError, InterpreterConfig, InterpreterSession};
pub use uniform::{UniformTable, MAX_ROW_ERRORS};

pub const CRATE_NAME: &str = "dp-conversion";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_name_is_stable() {
        assert_eq!(CRATE_NAME, "dp-conversion");
    }
}
