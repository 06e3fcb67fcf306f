//! Required-field checks for bulk will uploads.

use chrono::{NaiveDate, Utc};

use super::{text_field, RecordContext, RecordValidator, Validation};
use crate::error::ProcessingError;
use crate::job::Record;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Validates a will registration row.
///
/// Required: `testatorFirstName`, `testatorLastName`, `willDate`.
/// `dateOfBirth` is optional but must precede `willDate` when present.
#[derive(Debug, Clone)]
pub struct WillRecordValidator {
    pub required_fields: Vec<&'static str>,
}

impl Default for WillRecordValidator {
    fn default() -> Self {
        Self {
            required_fields: vec!["testatorFirstName", "testatorLastName", "willDate"],
        }
    }
}

/// Key used to detect the same will uploaded twice.
pub fn will_reference(record: &Record) -> Option<String> {
    if let Some(reference) = text_field(record, "willReference") {
        return Some(reference.to_lowercase());
    }
    let first = text_field(record, "testatorFirstName")?;
    let last = text_field(record, "testatorLastName")?;
    let date = text_field(record, "willDate")?;
    Some(format!("{}|{}|{}", first, last, date).to_lowercase())
}

fn parse_date(record: &Record, field: &str) -> Result<Option<NaiveDate>, String> {
    match text_field(record, field) {
        None => Ok(None),
        Some(raw) => NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map(Some)
            .map_err(|_| format!("Invalid {} '{}', expected YYYY-MM-DD", field, raw)),
    }
}

impl WillRecordValidator {
    fn check(&self, record: &Record) -> Result<(), String> {
        if !record.is_object() {
            return Err("Record is not an object".to_string());
        }

        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .copied()
            .filter(|f| text_field(record, f).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(format!("Missing required fields: {}", missing.join(", ")));
        }

        let will_date = parse_date(record, "willDate")?;
        let birth_date = parse_date(record, "dateOfBirth")?;

        if let Some(will_date) = will_date {
            if will_date > Utc::now().date_naive() {
                return Err(format!("Will date {} is in the future", will_date));
            }
            if let Some(birth) = birth_date {
                if birth >= will_date {
                    return Err("Date of birth must be before the will date".to_string());
                }
            }
        }

        Ok(())
    }
}

impl RecordValidator for WillRecordValidator {
    fn validate(
        &self,
        _ctx: &RecordContext<'_>,
        record: &Record,
    ) -> Result<Validation, ProcessingError> {
        Ok(match self.check(record) {
            Ok(()) => Validation::Accepted,
            Err(reason) => Validation::Rejected { reason },
        })
    }
}
