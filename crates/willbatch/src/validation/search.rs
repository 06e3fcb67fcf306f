//! Field checks for bulk search batches.

use chrono::{NaiveDate, Utc};

use super::{text_field, RecordContext, RecordValidator, Validation};
use crate::error::ProcessingError;
use crate::job::Record;

/// A search row needs a `lastName`; `dateOfBirth`, when given, must be a
/// past `YYYY-MM-DD` date.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchRecordValidator;

impl RecordValidator for SearchRecordValidator {
    fn validate(
        &self,
        _ctx: &RecordContext<'_>,
        record: &Record,
    ) -> Result<Validation, ProcessingError> {
        if !record.is_object() {
            return Ok(Validation::rejected("Record is not an object"));
        }
        if text_field(record, "lastName").is_none() {
            return Ok(Validation::rejected("Missing required fields: lastName"));
        }
        if let Some(raw) = text_field(record, "dateOfBirth") {
            match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                Ok(date) if date <= Utc::now().date_naive() => {}
                Ok(date) => {
                    return Ok(Validation::rejected(format!(
                        "Date of birth {} is in the future",
                        date
                    )))
                }
                Err(_) => {
                    return Ok(Validation::rejected(format!(
                        "Invalid dateOfBirth '{}', expected YYYY-MM-DD",
                        raw
                    )))
                }
            }
        }
        Ok(Validation::Accepted)
    }
}
