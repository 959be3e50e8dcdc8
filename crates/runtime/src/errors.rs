//! Runtime errors and tracebacks
//!
//! Operations fail by raising an [`RtError`]: a kind from the shared
//! taxonomy, an optional message, an optional structured cause chain, and
//! the traceback frames accumulated while unwinding. Frames come from the
//! frame descriptors the compiler records at every potential deopt point,
//! so specialized and general code produce the same traceback.

use molt_core::ErrorKind;

/// One traceback entry, built from a frame descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEntry {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// A raised runtime error.
#[derive(Debug, Clone)]
pub struct RtError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Box<RtError>>,
    pub frames: Vec<FrameEntry>,
}

impl RtError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RtError {
            kind,
            message: message.into(),
            cause: None,
            frames: Vec::new(),
        }
    }

    /// Chain a structured cause.
    pub fn with_cause(mut self, cause: RtError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Record a frame while unwinding. Innermost frame first.
    pub fn push_frame(&mut self, function: &str, file: &str, line: u32) {
        self.frames.push(FrameEntry {
            function: function.to_string(),
            file: file.to_string(),
            line,
        });
    }

    pub fn is_a(&self, ancestor: ErrorKind) -> bool {
        self.kind.is_a(ancestor)
    }

    /// Render the full traceback, outermost frame first, cause chain
    /// included.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(cause) = &self.cause {
            out.push_str(&cause.render());
            out.push_str("\nThe above error was the direct cause of:\n\n");
        }
        out.push_str("Traceback (most recent call last):\n");
        for frame in self.frames.iter().rev() {
            out.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                frame.file, frame.line, frame.function
            ));
        }
        if self.message.is_empty() {
            out.push_str(self.kind.name());
        } else {
            out.push_str(&format!("{}: {}", self.kind.name(), self.message));
        }
        out
    }

    /// The process exit code when this error escapes the top level.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

impl std::fmt::Display for RtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.message)
        }
    }
}

impl std::error::Error for RtError {}

// Short constructors for the kinds raised throughout the runtime.

pub fn type_error(message: impl Into<String>) -> RtError {
    RtError::new(ErrorKind::Type, message)
}

pub fn value_error(message: impl Into<String>) -> RtError {
    RtError::new(ErrorKind::Value, message)
}

pub fn key_error(message: impl Into<String>) -> RtError {
    RtError::new(ErrorKind::Key, message)
}

pub fn index_error(message: impl Into<String>) -> RtError {
    RtError::new(ErrorKind::Index, message)
}

pub fn zero_division(message: impl Into<String>) -> RtError {
    RtError::new(ErrorKind::ZeroDivision, message)
}

pub fn os_error(message: impl Into<String>) -> RtError {
    RtError::new(ErrorKind::Os, message)
}

pub fn cancelled() -> RtError {
    RtError::new(ErrorKind::Cancelled, "")
}

pub fn timeout() -> RtError {
    RtError::new(ErrorKind::Timeout, "")
}

pub fn capability_denied(cap: molt_core::Capability) -> RtError {
    RtError::new(
        ErrorKind::CapabilityDenied,
        format!("capability '{}' not granted", cap.name()),
    )
}

pub fn determinism_violation(what: &str) -> RtError {
    RtError::new(
        ErrorKind::DeterminismViolation,
        format!("{} is disabled in deterministic builds", what),
    )
}

pub fn internal(message: impl Into<String>) -> RtError {
    RtError::new(ErrorKind::Internal, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_chain_renders_first() {
        let root = value_error("bad input");
        let mut err = type_error("while converting").with_cause(root);
        err.push_frame("convert", "app.mt", 12);
        let text = err.render();
        let root_pos = text.find("ValueError: bad input").unwrap();
        let outer_pos = text.find("TypeError: while converting").unwrap();
        assert!(root_pos < outer_pos);
        assert!(text.contains("line 12, in convert"));
    }

    #[test]
    fn test_frames_render_outermost_first() {
        let mut err = key_error("'x'");
        err.push_frame("inner", "app.mt", 5);
        err.push_frame("main", "app.mt", 1);
        let text = err.render();
        let main_pos = text.find("in main").unwrap();
        let inner_pos = text.find("in inner").unwrap();
        assert!(main_pos < inner_pos);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(cancelled().exit_code(), molt_core::EXIT_OK);
        assert_eq!(type_error("x").exit_code(), molt_core::EXIT_RUNTIME);
        assert_eq!(
            capability_denied(molt_core::Capability::FsRead).exit_code(),
            molt_core::EXIT_CAPABILITY
        );
    }
}
