//! Protocol error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Point has no fields")]
    NoFields,

    #[error("Point has an empty measurement name")]
    EmptyMeasurement,

    #[error("Empty tag key or value for tag {0:?}")]
    EmptyTag(String),

    #[error("Empty field key")]
    EmptyFieldKey,

    #[error("Field {0:?} is not a finite number")]
    NonFiniteField(String),

    #[error("Malformed line protocol: {0}")]
    Malformed(String),
}
