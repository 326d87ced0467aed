//! # Transaction Error Kinds
//!
//! Most fallible paths in EmberDB return `eyre::Result` with context attached
//! at each I/O boundary. The commit path is different: callers need to branch
//! on *why* a transaction failed (retry on a race, give up on an overflow),
//! so aborts travel as a small typed enum until they reach the session
//! boundary, where they are folded into an eyre report.
//!
//! ## Kinds
//!
//! | Kind                 | Meaning                                             | Retryable |
//! |----------------------|-----------------------------------------------------|-----------|
//! | `ReadSetOverflow`    | Read set hit `xct.max_read_set_size`                | no        |
//! | `WriteSetOverflow`   | Write set hit `xct.max_write_set_size`              | no        |
//! | `LogBufferFull`      | Redo buffer has no room until the logger catches up | yes       |
//! | `RaceAbort`          | A concurrently committed writer invalidated a read  | yes       |
//! | `LargeReadSetAbort`  | Read set too large to validate within the bound     | no        |
//! | `UserRequestedAbort` | The procedure asked for an abort                    | caller's  |
//! | `UnexpectedAbort`    | Engine shutting down, fatal flag, or internal limit | no        |
//!
//! Overflow and abort kinds are recovered locally: the worker truncates its
//! log buffer, releases any held locks, and hands the kind back. I/O errors
//! from background threads set the engine fatal flag instead, after which
//! every commit fails with `UnexpectedAbort`.

use std::fmt;

/// Why a transaction could not commit (or could not even buffer its intent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XctError {
    ReadSetOverflow,
    WriteSetOverflow,
    LogBufferFull,
    RaceAbort,
    LargeReadSetAbort,
    UserRequestedAbort,
    UnexpectedAbort,
}

impl XctError {
    /// Whether retrying the same transaction is likely to succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, XctError::RaceAbort | XctError::LogBufferFull)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XctError::ReadSetOverflow => "read set overflow",
            XctError::WriteSetOverflow => "write set overflow",
            XctError::LogBufferFull => "thread log buffer full",
            XctError::RaceAbort => "race abort",
            XctError::LargeReadSetAbort => "read set too large to validate",
            XctError::UserRequestedAbort => "user requested abort",
            XctError::UnexpectedAbort => "unexpected abort",
        }
    }
}

impl fmt::Display for XctError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for XctError {}

pub type XctResult<T> = std::result::Result<T, XctError>;
