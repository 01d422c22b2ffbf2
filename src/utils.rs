use sha2::{Digest, Sha256};

/// a macro to declare simple Vec<String>
#[macro_export]
macro_rules! string_vec {
    ($($x:expr),*) => {
        vec![$($x.into()),*]
    };
}

/// info! that strips ANSI colour sequences when colours are disabled
#[macro_export]
macro_rules! cinfo {
    ($colorful:expr, $($arg:tt)*) => {
        if $colorful {
            log::info!($($arg)*);
        } else {
            log::info!("{}", $crate::utils::strip_ansi(&format!($($arg)*)));
        }
    };
}

/// Removes `ESC[...m` colour sequences from a string.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            for d in chars.by_ref() {
                if d == 'm' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Clamps a prediction to the rating scale. NaN passes through unchanged.
pub fn bound_value(value: f32, min: i8, max: i8) -> f32 {
    if value.is_nan() {
        return value;
    }
    value.max(min as f32).min(max as f32)
}

/// Deals `values` into `p` bins round-robin, the first value going to bin `offset % p`.
pub fn deal_round_robin<T>(values: Vec<T>, p: usize, offset: usize) -> Vec<Vec<T>> {
    let mut bins: Vec<Vec<T>> = (0..p).map(|_| Vec::new()).collect();
    if p == 0 {
        return bins;
    }
    for (i, v) in values.into_iter().enumerate() {
        bins[(i + offset) % p].push(v);
    }
    bins
}

/// Hex SHA-256 digest of the given lines, in order.
pub fn fingerprint<I, S>(lines: I) -> String
    where I: IntoIterator<Item = S>, S: AsRef<str>
{
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_value() {
        assert_eq!(bound_value(7.2, 1, 5), 5.0);
        assert_eq!(bound_value(-3.0, 1, 5), 1.0);
        assert_eq!(bound_value(3.5, 1, 5), 3.5);
        assert!(bound_value(f32::NAN, 1, 5).is_nan());
    }

    #[test]
    fn test_deal_round_robin_with_offset() {
        let bins = deal_round_robin(vec![1, 2, 3, 4, 5], 3, 1);
        assert_eq!(bins, vec![vec![3], vec![1, 4], vec![2, 5]]);
        let none: Vec<Vec<u8>> = deal_round_robin(vec![], 2, 0);
        assert_eq!(none, vec![Vec::<u8>::new(), Vec::new()]);
    }

    #[test]
    fn test_fingerprint_depends_on_order() {
        let a = fingerprint(["1 2 0", "1 3 1"]);
        let b = fingerprint(["1 3 1", "1 2 0"]);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, fingerprint(vec!["1 2 0".to_string(), "1 3 1".to_string()]));
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;93mFold #1\x1b[0m done"), "Fold #1 done");
        let names: Vec<String> = string_vec!["a", "b"];
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
