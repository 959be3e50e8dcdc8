//! Error kinds and process exit codes
//!
//! The runtime raises errors by kind, arranged in a shallow taxonomy.
//! Kinds are shared between the compiler (which lowers `except` clauses
//! into kind tests) and the runtime (which constructs and matches them).

/// Process exit code: success.
pub const EXIT_OK: i32 = 0;
/// Process exit code: uncaught runtime error.
pub const EXIT_RUNTIME: i32 = 1;
/// Process exit code: compile error.
pub const EXIT_COMPILE: i32 = 2;
/// Process exit code: capability denied.
pub const EXIT_CAPABILITY: i32 = 3;
/// Process exit code: lockfile/determinism violation.
pub const EXIT_DETERMINISM: i32 = 4;

/// Named error kinds. The hierarchy is expressed by [`ErrorKind::parent`];
/// `except LookupError` catches `KeyError` and `IndexError` through it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Syntax = 0,
    Type = 1,
    Value = 2,
    Lookup = 3,
    Key = 4,
    Index = 5,
    Arithmetic = 6,
    ZeroDivision = 7,
    Overflow = 8,
    Os = 9,
    Cancelled = 10,
    Timeout = 11,
    CapabilityDenied = 12,
    DeterminismViolation = 13,
    Internal = 14,
}

impl ErrorKind {
    /// The parent kind in the taxonomy, if any.
    pub fn parent(self) -> Option<ErrorKind> {
        match self {
            ErrorKind::Key | ErrorKind::Index => Some(ErrorKind::Lookup),
            ErrorKind::ZeroDivision | ErrorKind::Overflow => Some(ErrorKind::Arithmetic),
            _ => None,
        }
    }

    /// True when `self` is `ancestor` or a specialization of it.
    pub fn is_a(self, ancestor: ErrorKind) -> bool {
        let mut cur = Some(self);
        while let Some(k) = cur {
            if k == ancestor {
                return true;
            }
            cur = k.parent();
        }
        false
    }

    /// The user-visible name.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Lookup => "LookupError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Arithmetic => "ArithmeticError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Overflow => "OverflowError",
            ErrorKind::Os => "OSError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::CapabilityDenied => "CapabilityDenied",
            ErrorKind::DeterminismViolation => "DeterminismViolation",
            ErrorKind::Internal => "InternalError",
        }
    }

    /// Parse a user-visible name.
    pub fn parse(name: &str) -> Option<Self> {
        const ALL: [ErrorKind; 15] = [
            ErrorKind::Syntax,
            ErrorKind::Type,
            ErrorKind::Value,
            ErrorKind::Lookup,
            ErrorKind::Key,
            ErrorKind::Index,
            ErrorKind::Arithmetic,
            ErrorKind::ZeroDivision,
            ErrorKind::Overflow,
            ErrorKind::Os,
            ErrorKind::Cancelled,
            ErrorKind::Timeout,
            ErrorKind::CapabilityDenied,
            ErrorKind::DeterminismViolation,
            ErrorKind::Internal,
        ];
        ALL.into_iter().find(|k| k.name() == name)
    }

    /// The process exit code when this kind escapes to the top level.
    /// A top-level `CancelledError` is a clean shutdown.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Cancelled => EXIT_OK,
            ErrorKind::CapabilityDenied => EXIT_CAPABILITY,
            ErrorKind::DeterminismViolation => EXIT_DETERMINISM,
            _ => EXIT_RUNTIME,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy() {
        assert!(ErrorKind::Key.is_a(ErrorKind::Lookup));
        assert!(ErrorKind::Index.is_a(ErrorKind::Lookup));
        assert!(ErrorKind::ZeroDivision.is_a(ErrorKind::Arithmetic));
        assert!(ErrorKind::Key.is_a(ErrorKind::Key));
        assert!(!ErrorKind::Key.is_a(ErrorKind::Arithmetic));
        assert!(!ErrorKind::Lookup.is_a(ErrorKind::Key));
    }

    #[test]
    fn test_name_roundtrip() {
        for name in ["KeyError", "ZeroDivisionError", "CapabilityDenied"] {
            assert_eq!(ErrorKind::parse(name).unwrap().name(), name);
        }
        assert_eq!(ErrorKind::parse("NoSuchError"), None);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorKind::Cancelled.exit_code(), EXIT_OK);
        assert_eq!(ErrorKind::Type.exit_code(), EXIT_RUNTIME);
        assert_eq!(ErrorKind::CapabilityDenied.exit_code(), EXIT_CAPABILITY);
        assert_eq!(ErrorKind::DeterminismViolation.exit_code(), EXIT_DETERMINISM);
    }
}
