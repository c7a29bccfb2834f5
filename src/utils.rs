use crate::error::{HarvestError, Result};
use crate::schema::Period;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Number of whole months from `start` to `end` (negative when `end` is earlier).
pub fn months_between(start: Period, end: Period) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Every period from `start` to `end`, both inclusive, in chronological order.
pub fn periods_in_range(start: Period, end: Period) -> Result<Vec<Period>> {
    if end < start {
        return Err(HarvestError::InvalidRange { start, end });
    }

    let mut periods = Vec::with_capacity(months_between(start, end) as usize + 1);
    let mut current = start;
    while current <= end {
        periods.push(current);
        current = current.next();
    }

    Ok(periods)
}

/// Parses a period string in the format "MM/YYYY" or "YYYY-MM".
pub fn parse_period_string(period: &str) -> Result<Period> {
    let trimmed = period.trim();
    let invalid = || HarvestError::InvalidPeriod(period.to_string());

    let (year, month) = if let Some((month, year)) = trimmed.split_once('/') {
        (year, month)
    } else if let Some((year, month)) = trimmed.split_once('-') {
        (year, month)
    } else {
        return Err(invalid());
    };

    if year.len() != 4 || month.is_empty() || month.len() > 2 {
        return Err(invalid());
    }

    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    Period::new(year, month)
}

/// Parses an amount written with `,` as the decimal separator.
///
/// Accepts an optional `$` sign, surrounding whitespace and `.` thousands
/// grouping ("1.234,56"). Without a comma the text is read as a `.`-grouped
/// integer when it is one ("1.234" is 1234), otherwise as a plain number.
/// Returns `None` for anything else.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$')
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    let normalized = match cleaned.split_once(',') {
        Some((int_part, frac_part)) => {
            if frac_part.is_empty() || !frac_part.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let int_part = if int_part.contains('.') {
                if !is_dot_grouped(int_part) {
                    return None;
                }
                int_part.replace('.', "")
            } else {
                int_part.to_string()
            };
            format!("{}.{}", int_part, frac_part)
        }
        None if is_dot_grouped(&cleaned) => cleaned.replace('.', ""),
        None => cleaned,
    };

    Decimal::from_str(&normalized).ok()
}

fn is_dot_grouped(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let mut groups = digits.split('.');

    let first_ok = groups
        .next()
        .map(|g| (1..=3).contains(&g.len()) && g.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);

    let mut rest = 0;
    for group in groups {
        if group.len() != 3 || !group.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        rest += 1;
    }

    first_ok && rest > 0
}

/// Spreadsheet column letters for a zero-based column index (0 = "A", 26 = "AA").
pub fn column_letter(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(text: &str) -> Decimal {
        text.parse().unwrap()
    }

    #[test]
    fn test_months_between() {
        let jan = Period::new(2023, 1).unwrap();
        let mar = Period::new(2024, 3).unwrap();
        assert_eq!(months_between(jan, mar), 14);
        assert_eq!(months_between(mar, jan), -14);
        assert_eq!(months_between(jan, jan), 0);
    }

    #[test]
    fn test_periods_in_range_crosses_year() {
        let start = Period::new(2023, 11).unwrap();
        let end = Period::new(2024, 2).unwrap();
        let periods = periods_in_range(start, end).unwrap();
        let labels: Vec<String> = periods.iter().map(|p| p.to_string()).collect();
        assert_eq!(labels, vec!["11/2023", "12/2023", "01/2024", "02/2024"]);
    }

    #[test]
    fn test_periods_in_range_rejects_reversed() {
        let start = Period::new(2024, 5).unwrap();
        let end = Period::new(2024, 4).unwrap();
        assert!(matches!(
            periods_in_range(start, end),
            Err(HarvestError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_parse_period_string_both_forms() {
        assert_eq!(
            parse_period_string("06/2024").unwrap(),
            Period::new(2024, 6).unwrap()
        );
        assert_eq!(
            parse_period_string("2024-06").unwrap(),
            Period::new(2024, 6).unwrap()
        );
        assert!(parse_period_string("2024/06").is_err());
        assert!(parse_period_string("13/2024").is_err());
        assert!(parse_period_string("June 2024").is_err());
    }

    #[test]
    fn test_parse_amount_comma_decimal() {
        assert_eq!(parse_amount("1234,56"), Some(dec("1234.56")));
        assert_eq!(parse_amount(" $ 1.234,56 "), Some(dec("1234.56")));
        assert_eq!(parse_amount("-10,5"), Some(dec("-10.5")));
        assert_eq!(parse_amount("0,00"), Some(dec("0")));
        assert_eq!(parse_amount("100"), Some(dec("100")));
        assert_eq!(parse_amount("1.234"), Some(dec("1234")));
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("   "), None);
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount("1,2,3"), None);
        assert_eq!(parse_amount("12,"), None);
        assert_eq!(parse_amount("12.34.5,00"), None);
    }

    #[test]
    fn test_column_letter() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }
}
