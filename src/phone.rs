use crate::error::ApiError;

/// E.164: `+`, then 7 to 15 digits, first digit non-zero.
pub fn is_e164(s: &str) -> bool {
    let Some(digits) = s.strip_prefix('+') else {
        return false;
    };
    (7..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
}

/// Validate a request field as E.164, tolerating surrounding whitespace.
pub fn require_e164(field: &str, value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if is_e164(trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(ApiError::invalid_field(field, "expected E.164 (+<digits>)"))
    }
}

/// Last four digits, for logs.
pub fn redact(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(char::is_ascii_digit).collect();
    let tail: String = digits[digits.len().saturating_sub(4)..].iter().collect();
    format!("***{tail}")
}
