use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A layout key that the version description never mentions.
    #[error("Missing {kind} definition: {name}")]
    MissingDefinition { kind: &'static str, name: String },

    /// A layout key that was declared but never given a value.
    #[error("{kind} definition declared but not set: {name}")]
    UnsetDefinition { kind: &'static str, name: String },

    #[error("Bad hex value for {name}: {value:?}")]
    BadHexValue { name: String, value: String },

    #[error("Unknown operating system: {0:?}")]
    UnknownOs(String),

    #[error("Underspecified {list} entry: {detail}")]
    UnderspecifiedEntry { list: &'static str, detail: String },

    #[error("Bad document root: expected <{expected}>, found <{found}>")]
    BadDocumentRoot { expected: String, found: String },

    #[error("Document parse error at line {line}, column {column}: {message}")]
    Document {
        message: String,
        line: usize,
        column: usize,
    },

    #[error("Unknown version description: {0}")]
    UnknownVersion(String),

    #[error("Version inheritance cycle through {0}")]
    InheritanceCycle(String),

    /// Attach-phase failure. Recoverable: nothing is left mapped or locked.
    #[error("Failed to attach to target: {0}")]
    AttachFailure(String),

    #[error("Server protocol version mismatch: ours is {ours}, server runs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    /// The server acknowledged a command with its error code. Non-fatal:
    /// the session stays usable.
    #[error("Command rejected by server: {0}")]
    CommandFailed(&'static str),

    /// The embedded server stopped responding mid-session. The session is
    /// torn down before this is raised; discard it, do not retry.
    #[error("Shared memory server disappeared")]
    ServerDisappeared,

    #[error("Locking protocol violation during {0}")]
    LockingError(&'static str),

    /// Memory access attempted while the target is not suspended.
    #[error("Memory access denied: target is not suspended")]
    MemoryAccessDenied,

    #[error("Not attached to a target process")]
    NotAttached,

    /// The word read as a vtable pointer cannot be one. Non-fatal: the
    /// object was garbage, not the session.
    #[error("Bad vtable pointer: {0:#x}")]
    BadVtablePointer(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a failed session can be kept around and retried.
    ///
    /// Attach-time conditions are reported to the caller for a decision;
    /// mid-session protocol violations mean the session must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ServerDisappeared | Error::LockingError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_definition_message_names_kind_and_key() {
        let err = Error::MissingDefinition {
            kind: "address",
            name: "Maps/map_data".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing address definition: Maps/map_data"
        );
    }

    #[test]
    fn test_fatality_split() {
        assert!(Error::ServerDisappeared.is_fatal());
        assert!(Error::LockingError("resume").is_fatal());
        assert!(!Error::AttachFailure("no free client slot".into()).is_fatal());
        assert!(!Error::VersionMismatch { ours: 9, theirs: 8 }.is_fatal());
        assert!(!Error::MemoryAccessDenied.is_fatal());
    }
}
