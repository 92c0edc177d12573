//! Phone number redaction for logs.

/// Leading digits kept visible (country code + area code).
const VISIBLE_DIGITS: usize = 4;

/// Mask every digit after the first few: `+14155550123` → `+1415*******`.
pub fn redact_phone(phone: &str) -> String {
    let mut digits = 0;
    phone
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                digits += 1;
                if digits > VISIBLE_DIGITS { '*' } else { c }
            } else {
                c
            }
        })
        .collect()
}
