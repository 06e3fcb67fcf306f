//! Builders for submissions and record sets.

#![allow(dead_code)]

use serde_json::json;

use willbatch::{JobSubmission, JobType, Record};

/// A will record that passes `WillRecordValidator`. `row` keeps references unique.
pub fn valid_will(row: usize) -> Record {
    json!({
        "testatorFirstName": format!("Testator{}", row),
        "testatorLastName": "Example",
        "dateOfBirth": "1948-02-29",
        "willDate": "2018-07-01",
        "willReference": format!("W-{:05}", row)
    })
}

/// A will record missing its last name.
pub fn invalid_will(row: usize) -> Record {
    json!({
        "testatorFirstName": format!("Testator{}", row),
        "willDate": "2018-07-01",
        "willReference": format!("W-{:05}", row)
    })
}

/// Builder for `JobSubmission`.
pub struct SubmissionBuilder {
    job_type: JobType,
    firm_id: String,
    user_id: String,
    file_name: String,
    count: usize,
    invalid_rows: Vec<usize>,
    copies: Vec<(usize, usize)>,
}

impl SubmissionBuilder {
    /// A will upload of `count` valid records.
    pub fn wills(count: usize) -> Self {
        Self {
            job_type: JobType::WillUpload,
            firm_id: "FIRM_1".to_string(),
            user_id: "USER_1".to_string(),
            file_name: "wills.csv".to_string(),
            count,
            invalid_rows: vec![],
            copies: vec![],
        }
    }

    /// A search batch of `count` valid records.
    pub fn searches(count: usize) -> Self {
        Self {
            job_type: JobType::SearchBatch,
            file_name: "search.csv".to_string(),
            ..Self::wills(count)
        }
    }

    pub fn firm(mut self, firm_id: &str) -> Self {
        self.firm_id = firm_id.to_string();
        self
    }

    pub fn file_name(mut self, file_name: &str) -> Self {
        self.file_name = file_name.to_string();
        self
    }

    /// Makes the record at 1-based `row` fail validation.
    pub fn invalid_at(mut self, row: usize) -> Self {
        self.invalid_rows.push(row);
        self
    }

    /// Makes the record at `row` an exact copy of the one at `original`.
    pub fn copy_of(mut self, row: usize, original: usize) -> Self {
        self.copies.push((row, original));
        self
    }

    pub fn build(self) -> JobSubmission {
        let mut records: Vec<Record> = (1..=self.count)
            .map(|row| {
                let invalid = self.invalid_rows.contains(&row);
                match (self.job_type, invalid) {
                    (JobType::WillUpload, false) => valid_will(row),
                    (JobType::WillUpload, true) => invalid_will(row),
                    (JobType::SearchBatch, false) => json!({ "lastName": format!("Name{}", row) }),
                    (JobType::SearchBatch, true) => json!({ "firstName": format!("Name{}", row) }),
                }
            })
            .collect();
        for &(row, original) in &self.copies {
            records[row - 1] = records[original - 1].clone();
        }

        JobSubmission::new(
            self.job_type,
            &self.firm_id,
            &self.user_id,
            &self.file_name,
            records,
        )
    }
}
