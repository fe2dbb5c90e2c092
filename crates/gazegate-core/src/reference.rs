//! Mapping a staff registration number to the server-side reference image name.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("registration number is empty")]
    Empty,
    #[error("registration number must contain only digits: {0:?}")]
    NotNumeric(String),
}

/// Server file name of the reference photo for `registration`.
///
/// Short numbers (up to six digits) belong to the `014` series and are padded
/// to six digits behind that prefix. Numbers of six or more digits starting
/// with `8` get a single leading zero instead; that rule also wins for six-digit
/// numbers starting with `8`. Anything else is used as is. The name is padded
/// to at least six digits and given a `.jpg` extension.
pub fn reference_file_name(registration: &str) -> Result<String, RegistrationError> {
    let digits = registration.trim();
    if digits.is_empty() {
        return Err(RegistrationError::Empty);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RegistrationError::NotNumeric(digits.to_string()));
    }

    let len = digits.len();
    let stem = if digits.starts_with('8') && len >= 6 {
        format!("0{digits:0>6}")
    } else if len <= 6 {
        format!("014{digits:0>6}")
    } else {
        digits.to_string()
    };

    Ok(format!("{stem:0>6}.jpg"))
}
