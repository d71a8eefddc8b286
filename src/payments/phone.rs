//! Zambian MSISDN handling.
//!
//! National numbers are 10 digits with a leading trunk `0` (`0971234567`);
//! the international form drops the `0` and prefixes `260` (`260971234567`).
//! Both forms of the same number normalize identically.

pub const COUNTRY_CODE: &str = "260";

pub const MTN_PREFIXES: &[&str] = &["96", "76"];
pub const AIRTEL_PREFIXES: &[&str] = &["97", "77"];
pub const ZAMTEL_PREFIXES: &[&str] = &["95", "75"];

/// Returns the 12-digit international form, or `None` when the input is not a
/// well-formed Zambian mobile number.
pub fn normalize(raw: &str) -> Option<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '+' | '.'))
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let national = if digits.len() == 12 && digits.starts_with(COUNTRY_CODE) {
        &digits[3..]
    } else if digits.len() == 10 && digits.starts_with('0') {
        &digits[1..]
    } else if digits.len() == 9 {
        digits.as_str()
    } else {
        return None;
    };

    if national.starts_with('0') {
        return None;
    }
    Some(format!("{}{}", COUNTRY_CODE, national))
}

/// 9-digit subscriber number without trunk prefix or country code.
pub fn national_number(raw: &str) -> Option<String> {
    normalize(raw).map(|n| n[COUNTRY_CODE.len()..].to_string())
}

/// 10-digit local form with the trunk `0`.
pub fn to_local(raw: &str) -> Option<String> {
    national_number(raw).map(|n| format!("0{}", n))
}

/// True when the number is well-formed and starts with one of the operator prefixes.
pub fn matches_prefixes(raw: &str, prefixes: &[&str]) -> bool {
    national_number(raw)
        .map(|n| prefixes.iter().any(|p| n.starts_with(p)))
        .unwrap_or(false)
}
