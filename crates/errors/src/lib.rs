use std::borrow::Cow;

use http::StatusCode;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object used across the
/// workspace to tag errors coming out of a table backend with information the
/// façade uses to classify them.
///
/// The msg is conveyed as a user facing error message.
///
/// The short_msg is used as a tag - available for tests and for log fields -
/// to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching
    /// w/ a standard test helper.
    /// Eg EntityAlreadyExists
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    /// Eg "The entity with RowKey `1` already exists in partition `P1`"
    pub msg: Cow<'static, str>,
}

#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    NotFound,
    Conflict,

    /// The stored version of an entity no longer matches the version the
    /// caller read.
    OCC,
    Canceled,

    Overloaded,
}

impl ErrorMetadata {
    /// Bad Request. Maps to 400 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error.
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found. Maps to 404 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// TableNotFound). The msg should be a descriptive message targeted
    /// toward the developer.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The resource already exists. Maps to 409 in HTTP.
    pub fn conflict(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Conflict,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// InvalidAccountKey). The msg should be a descriptive message targeted
    /// toward the developer.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The backend is temporarily unable to serve the request. Maps to 503 in
    /// HTTP.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Optimistic Concurrency Control failure: a conditional write or delete
    /// carried an ETag that no longer matches the stored entity. Maps to 412
    /// in HTTP.
    pub fn occ(table_name: Option<&str>) -> Self {
        let table_description = table_name
            .map(|name| format!("the \"{name}\" table"))
            .unwrap_or("the table".to_owned());
        Self {
            code: ErrorCode::OCC,
            short_msg: OCC_ERROR.into(),
            msg: format!(
                "An entity in {table_description} changed since it was read. Read it again or \
                 skip the ETag check to overwrite it."
            )
            .into(),
        }
    }

    /// The operation was canceled by the caller before it completed.
    pub fn canceled() -> Self {
        Self {
            code: ErrorCode::Canceled,
            short_msg: CANCELED.into(),
            msg: CANCELED_MSG.into(),
        }
    }

    pub fn is_occ(&self) -> bool {
        self.code == ErrorCode::OCC
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::Conflict
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_canceled(&self) -> bool {
        self.code == ErrorCode::Canceled
    }
}

impl ErrorCode {
    /// Classifies a status code returned by a table service endpoint.
    pub fn from_http_status_code(code: StatusCode) -> Option<Self> {
        match code {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(ErrorCode::Unauthenticated),
            StatusCode::NOT_FOUND => Some(ErrorCode::NotFound),
            StatusCode::CONFLICT => Some(ErrorCode::Conflict),
            StatusCode::PRECONDITION_FAILED => Some(ErrorCode::OCC),
            // Tries to categorize in one of the above more specific 4xx codes first,
            // otherwise categorizes as a general 4xx via BadRequest
            v if v.is_client_error() => Some(ErrorCode::BadRequest),
            v if v.is_server_error() => Some(ErrorCode::Overloaded),
            _ => None,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_occ(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    fn is_canceled(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as OCC
    fn is_occ(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_occ();
        }
        false
    }

    /// Returns true if error is tagged as NotFound
    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    /// Returns true if error is tagged as Conflict
    fn is_conflict(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_conflict();
        }
        false
    }

    /// Returns true if error is tagged as BadRequest
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    /// Returns true if error is tagged as Canceled
    fn is_canceled(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_canceled();
        }
        false
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_ERROR_MSG
    }
}

pub const INTERNAL_ERROR_MSG: &str = "The table service couldn't complete the request.";
pub const INTERNAL_ERROR: &str = "InternalError";
pub const OCC_ERROR: &str = "UpdateConditionNotSatisfied";
const CANCELED_MSG: &str = "The operation was canceled before it completed.";
const CANCELED: &str = "OperationCanceled";


#[cfg(test)]
mod tests {
    use http::StatusCode;
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        INTERNAL_ERROR,
        INTERNAL_ERROR_MSG,
        OCC_ERROR,
    };

    #[test]
    fn test_occ_is_detected_through_context() {
        let err = anyhow::anyhow!("412 from the service").context(ErrorMetadata::occ(Some("people")));
        assert!(err.is_occ());
        assert!(!err.is_not_found());
        assert_eq!(err.short_msg(), OCC_ERROR);
        assert!(err.msg().contains("\"people\""));
    }

    #[test]
    fn test_untagged_errors_are_internal() {
        let err = anyhow::anyhow!("socket closed");
        assert!(!err.is_occ());
        assert!(!err.is_bad_request());
        assert_eq!(err.short_msg(), INTERNAL_ERROR);
        assert_eq!(err.msg(), INTERNAL_ERROR_MSG);
    }

    #[test]
    fn test_status_code_classification() {
        assert_eq!(
            ErrorCode::from_http_status_code(StatusCode::PRECONDITION_FAILED),
            Some(ErrorCode::OCC)
        );
        assert_eq!(
            ErrorCode::from_http_status_code(StatusCode::CONFLICT),
            Some(ErrorCode::Conflict)
        );
        assert_eq!(
            ErrorCode::from_http_status_code(StatusCode::FORBIDDEN),
            Some(ErrorCode::Unauthenticated)
        );
        assert_eq!(
            ErrorCode::from_http_status_code(StatusCode::IM_A_TEAPOT),
            Some(ErrorCode::BadRequest)
        );
        assert_eq!(
            ErrorCode::from_http_status_code(StatusCode::BAD_GATEWAY),
            Some(ErrorCode::Overloaded)
        );
        assert_eq!(ErrorCode::from_http_status_code(StatusCode::OK), None);
    }

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_classification_survives_context(err in any::<ErrorMetadata>()) {
            let code = err.code;
            let short_msg = err.short_msg.clone();
            let wrapped = anyhow::anyhow!("backend failure").context(err);
            prop_assert_eq!(wrapped.short_msg(), short_msg.as_ref());
            prop_assert_eq!(wrapped.is_occ(), code == ErrorCode::OCC);
            prop_assert_eq!(wrapped.is_not_found(), code == ErrorCode::NotFound);
            prop_assert_eq!(wrapped.is_conflict(), code == ErrorCode::Conflict);
            prop_assert_eq!(wrapped.is_bad_request(), code == ErrorCode::BadRequest);
            prop_assert_eq!(wrapped.is_canceled(), code == ErrorCode::Canceled);
        }
    }
}
