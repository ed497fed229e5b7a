use thiserror::Error;

/// Unified error classification shared by every backend.
///
/// The kind is the sole currency for flow-control decisions: retry harnesses,
/// transaction orchestration, and the pool's connection recycling all branch
/// on the classifier predicates below, never on driver-native codes. Each
/// driver maps its native error codes onto exactly one kind; ambiguous codes
/// are classified conservatively (`QueryFailure` over `QueryDeadlock`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation complete, no more rows guaranteed by `Stmt::fetch`.
    Success,
    /// Operation complete, rows may be available to fetch.
    SuccessRow,

    // -- Connectivity failures --
    /// No driver registered under the requested name.
    ConnNoDriver,
    /// Driver refused to load or initialize.
    ConnDriverLoad,
    /// Driver version incompatible with this core.
    ConnDriverVer,
    /// Connection string parameter validation failed.
    ConnParams,
    /// Failed to establish a connection to the server.
    ConnFailed,
    /// Server rejected the credentials.
    ConnBadAuth,
    /// Connection to the server was lost mid-operation.
    ConnLost,

    // -- Prepare failures --
    /// Invalid query format.
    PrepareInvalid,
    /// A string literal was detected in the query that was not bound.
    PrepareStrNotBound,
    /// Multiple requests in a single query are not allowed.
    PrepareNoMultiQuery,

    // -- Execute failures --
    /// Statement has not been prepared.
    QueryNotPrepared,
    /// Wrong number of bound parameters provided for the query.
    QueryWrongNumParams,
    /// Backend failed to prepare the query for execution.
    QueryPrepare,

    /// Deadlock or serialization failure, must rollback.
    QueryDeadlock,
    /// Constraint violation (unique, primary key, foreign key, check).
    QueryConstraint,
    /// Uncategorized backend-side failure.
    QueryFailure,

    // -- Generic misuse --
    /// Resource is in use, the requested action is invalid.
    InUse,
    /// Invalid API use.
    InvalidUse,
    /// Invalid data type for conversion.
    InvalidType,

    // -- Caller-supplied outcomes for Trans::process callbacks --
    /// Callback outcome: commit pending work.
    UserSuccess,
    /// Callback outcome: rollback and retry the whole transaction.
    UserRetry,
    /// Callback outcome: rollback and report the failure.
    UserFailure,
}

impl ErrorKind {
    /// Generic string form of the kind. The per-statement message recorded by
    /// the driver is usually more useful for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Success => "success",
            ErrorKind::SuccessRow => "success, rows available",
            ErrorKind::ConnNoDriver => "driver not found",
            ErrorKind::ConnDriverLoad => "driver failed to load",
            ErrorKind::ConnDriverVer => "driver version invalid",
            ErrorKind::ConnParams => "connection string validation failed",
            ErrorKind::ConnFailed => "failed to establish connection",
            ErrorKind::ConnBadAuth => "authentication failed",
            ErrorKind::ConnLost => "connection lost",
            ErrorKind::PrepareInvalid => "invalid query format",
            ErrorKind::PrepareStrNotBound => "unbound string literal in query",
            ErrorKind::PrepareNoMultiQuery => "multiple queries not allowed",
            ErrorKind::QueryNotPrepared => "statement not prepared",
            ErrorKind::QueryWrongNumParams => "wrong number of bound parameters",
            ErrorKind::QueryPrepare => "backend failed to prepare query",
            ErrorKind::QueryDeadlock => "deadlock, rollback required",
            ErrorKind::QueryConstraint => "constraint violation",
            ErrorKind::QueryFailure => "query failure",
            ErrorKind::InUse => "resource in use",
            ErrorKind::InvalidUse => "invalid use",
            ErrorKind::InvalidType => "invalid data type",
            ErrorKind::UserSuccess => "user success",
            ErrorKind::UserRetry => "user retry requested",
            ErrorKind::UserFailure => "user failure",
        }
    }

    /// True for every kind other than `Success` and `SuccessRow`.
    pub fn is_error(&self) -> bool {
        !matches!(self, ErrorKind::Success | ErrorKind::SuccessRow)
    }

    /// True if the kind indicates a connection cannot be (re)established or
    /// was lost mid-operation. The pool destroys such connections on release
    /// and establishes a fresh one on next use.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnNoDriver
                | ErrorKind::ConnDriverLoad
                | ErrorKind::ConnDriverVer
                | ErrorKind::ConnParams
                | ErrorKind::ConnFailed
                | ErrorKind::ConnBadAuth
                | ErrorKind::ConnLost
        )
    }

    /// True if the correct recovery is to rollback (or discard) the current
    /// transaction and retry from the beginning.
    pub fn is_rollback(&self) -> bool {
        matches!(self, ErrorKind::QueryDeadlock | ErrorKind::UserRetry) || self.is_disconnect()
    }

    /// True for server-side failures that will not succeed on re-attempt,
    /// typically a query the backend cannot parse or a constraint violation.
    pub fn is_fatal(&self) -> bool {
        self.is_error() && !self.is_rollback() && !self.is_disconnect()
    }
}

impl Default for ErrorKind {
    fn default() -> Self {
        ErrorKind::Success
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error value carried by statements and returned from every fallible
/// operation: a unified kind plus the driver's human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct SqlError {
    kind: ErrorKind,
    message: String,
}

impl SqlError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_disconnect(&self) -> bool {
        self.kind.is_disconnect()
    }

    pub fn is_rollback(&self) -> bool {
        self.kind.is_rollback()
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl From<ErrorKind> for SqlError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_partitions_kinds() {
        let disconnects = [
            ErrorKind::ConnFailed,
            ErrorKind::ConnBadAuth,
            ErrorKind::ConnLost,
        ];
        for kind in disconnects {
            assert!(kind.is_error());
            assert!(kind.is_disconnect());
            assert!(kind.is_rollback(), "{kind:?} should be rollback-class");
            assert!(!kind.is_fatal());
        }

        assert!(ErrorKind::QueryDeadlock.is_rollback());
        assert!(!ErrorKind::QueryDeadlock.is_disconnect());
        assert!(ErrorKind::UserRetry.is_rollback());

        for kind in [
            ErrorKind::ConnNoDriver,
            ErrorKind::ConnParams,
            ErrorKind::ConnDriverLoad,
        ] {
            assert!(kind.is_disconnect());
            assert!(kind.is_rollback());
        }

        for kind in [
            ErrorKind::PrepareInvalid,
            ErrorKind::QueryConstraint,
            ErrorKind::QueryFailure,
            ErrorKind::UserFailure,
        ] {
            assert!(kind.is_fatal(), "{kind:?} should be fatal");
            assert!(!kind.is_rollback());
        }
    }

    #[test]
    fn only_success_and_success_row_are_not_errors() {
        for kind in [ErrorKind::Success, ErrorKind::SuccessRow] {
            assert!(!kind.is_error());
            assert!(!kind.is_rollback());
            assert!(!kind.is_fatal());
        }

        // UserSuccess is a commit signal for Trans::process, not a member
        // of the success family as far as the classifier is concerned.
        assert!(ErrorKind::UserSuccess.is_error());
        assert!(!ErrorKind::UserSuccess.is_rollback());
        assert!(ErrorKind::UserSuccess.is_fatal());
    }

    #[test]
    fn error_carries_kind_and_message() {
        let err = SqlError::new(ErrorKind::QueryConstraint, "duplicate key on t.pk");
        assert_eq!(err.kind(), ErrorKind::QueryConstraint);
        assert_eq!(err.message(), "duplicate key on t.pk");
        assert_eq!(err.to_string(), "constraint violation: duplicate key on t.pk");
    }
}
