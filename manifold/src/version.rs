//! Contains the types necessary for Optimistic Locking through versioning,
//! and the version tokens projections use to reference a point in an
//! object's history.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{codes, ErrorCode};

/// Position of an event within a stream, and the version of the stream
/// itself.
///
/// Event versions form a dense sequence starting at `0`; the version of
/// an empty stream is [`EMPTY_STREAM_VERSION`].
pub type Version = i64;

/// The stream version reported before any event has been committed.
pub const EMPTY_STREAM_VERSION: Version = -1;

/// This error is returned by a function when a version conflict error has
/// been detected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("conflict error detected on stream {stream_id}, expected version was: {expected}, found: {actual}")]
pub struct ConflictError {
    /// The stream whose manifest saw the conflicting write.
    pub stream_id: String,

    /// The [Version] value that was expected when calling the function that failed.
    pub expected: Version,

    /// The actual [Version] value, which mismatch caused this error.
    pub actual: Version,
}

impl ErrorCode for ConflictError {
    fn error_code(&self) -> &'static str {
        codes::CONCURRENCY_CONFLICT
    }
}

/// Error returned when two [VersionToken]s of different objects are compared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("version tokens reference different objects: {left_name}/{left_id} vs {right_name}/{right_id}")]
pub struct TokenMismatchError {
    pub left_name: String,
    pub left_id: String,
    pub right_name: String,
    pub right_id: String,
}

impl ErrorCode for TokenMismatchError {
    fn error_code(&self) -> &'static str {
        codes::VAL_TOKEN_MISMATCH
    }
}

/// References a specific point in an object's history.
///
/// Projections persist these tokens to remember how far into a stream
/// they have folded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionToken {
    pub object_name: String,
    pub object_id: String,
    pub stream_identifier: String,
    pub event_version: Version,
}

impl VersionToken {
    /// Orders two tokens of the same object by stream generation first,
    /// then event version.
    ///
    /// Tokens of different objects are not comparable and fail with a
    /// [TokenMismatchError].
    pub fn compare(&self, other: &VersionToken) -> Result<Ordering, TokenMismatchError> {
        if self.object_name != other.object_name || self.object_id != other.object_id {
            return Err(TokenMismatchError {
                left_name: self.object_name.clone(),
                left_id: self.object_id.clone(),
                right_name: other.object_name.clone(),
                right_id: other.object_id.clone(),
            });
        }

        Ok(self
            .stream_identifier
            .cmp(&other.stream_identifier)
            .then(self.event_version.cmp(&other.event_version)))
    }
}

/// Error returned when parsing a wire-form identifier fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdentifierError {
    /// The input did not start with the expected `oid[` / `vid[` prefix
    /// or was missing the closing bracket.
    #[error("malformed identifier: {0:?}")]
    Malformed(String),

    /// The schema suffix after the closing bracket was empty.
    #[error("identifier {0:?} is missing its schema suffix")]
    MissingSchema(String),
}

impl ErrorCode for ParseIdentifierError {
    fn error_code(&self) -> &'static str {
        codes::VAL_DESERIALIZATION
    }
}

fn parse_tagged(tag: &str, input: &str) -> Result<(String, String), ParseIdentifierError> {
    let rest = input
        .strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix('['))
        .ok_or_else(|| ParseIdentifierError::Malformed(input.to_owned()))?;

    let close = rest
        .rfind(']')
        .ok_or_else(|| ParseIdentifierError::Malformed(input.to_owned()))?;

    let (value, schema) = (&rest[..close], &rest[close + 1..]);
    if schema.is_empty() {
        return Err(ParseIdentifierError::MissingSchema(input.to_owned()));
    }

    Ok((value.to_owned(), schema.to_owned()))
}

/// Wire-form object identifier: `oid[<value>]<schema>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectIdentifier {
    pub value: String,
    pub schema: String,
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid[{}]{}", self.value, self.schema)
    }
}

impl FromStr for ObjectIdentifier {
    type Err = ParseIdentifierError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (value, schema) = parse_tagged("oid", input)?;
        Ok(Self { value, schema })
    }
}

impl TryFrom<String> for ObjectIdentifier {
    type Error = ParseIdentifierError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

impl From<ObjectIdentifier> for String {
    fn from(id: ObjectIdentifier) -> Self {
        id.to_string()
    }
}

/// Wire-form version identifier: `vid[<value>]<schema>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionIdentifier {
    pub value: String,
    pub schema: String,
}

impl fmt::Display for VersionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vid[{}]{}", self.value, self.schema)
    }
}

impl FromStr for VersionIdentifier {
    type Err = ParseIdentifierError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (value, schema) = parse_tagged("vid", input)?;
        Ok(Self { value, schema })
    }
}

impl TryFrom<String> for VersionIdentifier {
    type Error = ParseIdentifierError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

impl From<VersionIdentifier> for String {
    fn from(id: VersionIdentifier) -> Self {
        id.to_string()
    }
}
