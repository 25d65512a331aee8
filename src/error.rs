use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AkvErrorCode {
    InvalidConfig,
    Unsupported,
    Unavailable,
    OperationFailed,
    QuotaExceeded,
    ReadonlyTransaction,
    DriverNotFound,
    NotInitialized,
    Encode,
    Decode,
    Aborted,
}

impl AkvErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AkvErrorCode::InvalidConfig => "invalid_config",
            AkvErrorCode::Unsupported => "unsupported",
            AkvErrorCode::Unavailable => "unavailable",
            AkvErrorCode::OperationFailed => "operation_failed",
            AkvErrorCode::QuotaExceeded => "quota_exceeded",
            AkvErrorCode::ReadonlyTransaction => "readonly_transaction",
            AkvErrorCode::DriverNotFound => "driver_not_found",
            AkvErrorCode::NotInitialized => "not_initialized",
            AkvErrorCode::Encode => "encode",
            AkvErrorCode::Decode => "decode",
            AkvErrorCode::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AkvError {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("operation '{operation}' unsupported by driver '{driver}'")]
    Unsupported { operation: String, driver: String },
    #[error("driver '{driver}' unavailable: {message}")]
    Unavailable { driver: String, message: String },
    #[error("{operation} failed on driver '{driver}': {source_name}: {source_message}")]
    OperationFailed {
        operation: String,
        key: Option<String>,
        driver: String,
        source_name: String,
        source_message: String,
    },
    #[error("quota exceeded on driver '{driver}': {message}")]
    QuotaExceeded { driver: String, message: String },
    #[error("'{operation}' attempted inside a read-only transaction")]
    ReadonlyTransaction { operation: String },
    #[error("driver '{name}' not found")]
    DriverNotFound { name: String },
    #[error("store is not initialized")]
    NotInitialized,
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("operation aborted by plugin '{plugin}': {message}")]
    Aborted { plugin: String, message: String },
}

impl AkvError {
    pub fn code(&self) -> AkvErrorCode {
        match self {
            AkvError::InvalidConfig { .. } => AkvErrorCode::InvalidConfig,
            AkvError::Unsupported { .. } => AkvErrorCode::Unsupported,
            AkvError::Unavailable { .. } => AkvErrorCode::Unavailable,
            AkvError::OperationFailed { .. } => AkvErrorCode::OperationFailed,
            AkvError::QuotaExceeded { .. } => AkvErrorCode::QuotaExceeded,
            AkvError::ReadonlyTransaction { .. } => AkvErrorCode::ReadonlyTransaction,
            AkvError::DriverNotFound { .. } => AkvErrorCode::DriverNotFound,
            AkvError::NotInitialized => AkvErrorCode::NotInitialized,
            AkvError::Encode(_) => AkvErrorCode::Encode,
            AkvError::Decode(_) => AkvErrorCode::Decode,
            AkvError::Aborted { .. } => AkvErrorCode::Aborted,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Wraps a lower-level backend failure, preserving the original error's
    /// name and message alongside the failing operation and key.
    pub fn operation_failed(
        operation: impl Into<String>,
        key: Option<&str>,
        driver: impl Into<String>,
        source: &AkvError,
    ) -> Self {
        AkvError::OperationFailed {
            operation: operation.into(),
            key: key.map(str::to_owned),
            driver: driver.into(),
            source_name: source.code_str().to_owned(),
            source_message: source.to_string(),
        }
    }

    /// Attaches the failing operation, key, and driver to a raw backend
    /// failure. Errors that already identify their operation (plugin
    /// aborts, read-only rejections, config problems) pass through
    /// unchanged, as do already-wrapped ones.
    pub fn with_context(self, operation: &str, key: Option<&str>, driver: &str) -> Self {
        match &self {
            AkvError::Unavailable { .. }
            | AkvError::QuotaExceeded { .. }
            | AkvError::Encode(_)
            | AkvError::Decode(_) => AkvError::operation_failed(operation, key, driver, &self),
            _ => self,
        }
    }

    /// True for errors that signal a stale or invalidated connection handle,
    /// which the admission layer may transparently retry once.
    pub fn is_stale_handle(&self) -> bool {
        matches!(self, AkvError::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{AkvError, AkvErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(
            AkvErrorCode::ReadonlyTransaction.as_str(),
            "readonly_transaction"
        );
        assert_eq!(AkvErrorCode::DriverNotFound.as_str(), "driver_not_found");
        assert_eq!(AkvErrorCode::QuotaExceeded.as_str(), "quota_exceeded");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = AkvError::ReadonlyTransaction {
            operation: "set".into(),
        };
        assert_eq!(err.code(), AkvErrorCode::ReadonlyTransaction);
        assert_eq!(err.code_str(), "readonly_transaction");
    }

    #[test]
    fn wrapped_failures_carry_structured_context() {
        let inner = AkvError::Unavailable {
            driver: "memory".into(),
            message: "handle invalidated".into(),
        };
        let wrapped = AkvError::operation_failed("get_item", Some("k1"), "memory", &inner);
        match wrapped {
            AkvError::OperationFailed {
                operation,
                key,
                driver,
                source_name,
                ..
            } => {
                assert_eq!(operation, "get_item");
                assert_eq!(key.as_deref(), Some("k1"));
                assert_eq!(driver, "memory");
                assert_eq!(source_name, "unavailable");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn context_wrapping_skips_already_shaped_errors() {
        let raw = AkvError::Unavailable {
            driver: "memory".into(),
            message: "gone".into(),
        };
        let wrapped = raw.with_context("keys", None, "memory");
        assert!(matches!(
            wrapped,
            AkvError::OperationFailed { ref operation, .. } if operation == "keys"
        ));

        let readonly = AkvError::ReadonlyTransaction {
            operation: "set".into(),
        };
        assert_eq!(
            readonly.clone().with_context("set_item", Some("k"), "memory"),
            readonly
        );

        // Double wrapping would bury the original operation.
        assert_eq!(
            wrapped.clone().with_context("length", None, "memory"),
            wrapped
        );
    }
}
