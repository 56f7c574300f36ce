//! Natural (alphanumeric) string ordering: `v2` sorts before `v10`.

use std::cmp::Ordering;

fn chunks(s: &str) -> Vec<(bool, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut digits = None;
    for (i, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        match digits {
            Some(prev) if prev != is_digit => {
                out.push((prev, &s[start..i]));
                start = i;
            }
            _ => {}
        }
        digits = Some(is_digit);
    }
    if let Some(prev) = digits {
        out.push((prev, &s[start..]));
    }
    out
}

fn compare_digits(a: &str, b: &str) -> Ordering {
    let a_trimmed = a.trim_start_matches('0');
    let b_trimmed = b.trim_start_matches('0');
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
        // "01" after "1" so distinct strings never compare equal
        .then_with(|| a.len().cmp(&b.len()))
}

/// Compare two strings, treating runs of ASCII digits as numbers.
///
/// Text runs compare case-insensitively first; exact byte order breaks the
/// remaining ties so the ordering is total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let left = chunks(a);
    let right = chunks(b);
    for ((a_digit, a_part), (b_digit, b_part)) in left.iter().zip(right.iter()) {
        let ord = match (a_digit, b_digit) {
            (true, true) => compare_digits(a_part, b_part),
            _ => a_part.to_lowercase().cmp(&b_part.to_lowercase()),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len()).then_with(|| a.cmp(b))
}

/// Sort in place with [`natural_cmp`].
pub fn sort_natural<S: AsRef<str>>(items: &mut [S]) {
    items.sort_by(|a, b| natural_cmp(a.as_ref(), b.as_ref()));
}
