//! Human-readable byte counts for log messages and system info.

use core::fmt;

/// Wraps a byte count and displays it with binary prefixes (KiB, MiB, ...).
///
/// Formatting uses integer arithmetic only (the kernel has no floating
/// point here); up to two decimal digits are shown, trailing zeros dropped.
///
/// # Examples
///
/// ```
/// use kmm::ByteSize;
///
/// assert_eq!(format!("{}", ByteSize(512)), "512B");
/// assert_eq!(format!("{}", ByteSize(1024)), "1KiB");
/// assert_eq!(format!("{}", ByteSize(1536)), "1.5KiB");
/// assert_eq!(format!("{}", ByteSize(4 * 1024 * 1024)), "4MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ByteSize(pub usize);

impl From<usize> for ByteSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

        let mut whole = self.0;
        let mut remainder = 0;
        let mut unit = 0;

        while whole >= 1024 && unit < UNITS.len() - 1 {
            remainder = whole % 1024;
            whole /= 1024;
            unit += 1;
        }

        if unit == 0 {
            return write!(f, "{}B", self.0);
        }

        // Two decimal digits, truncated; 1536B becomes "1.5KiB", not "1.50KiB".
        let hundredths = remainder * 100 / 1024;
        if hundredths == 0 {
            write!(f, "{}{}", whole, UNITS[unit])
        } else if hundredths % 10 == 0 {
            write!(f, "{}.{}{}", whole, hundredths / 10, UNITS[unit])
        } else {
            write!(f, "{}.{:02}{}", whole, hundredths, UNITS[unit])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_plain_bytes() {
        assert_eq!(format!("{}", ByteSize(0)), "0B");
        assert_eq!(format!("{}", ByteSize(1)), "1B");
        assert_eq!(format!("{}", ByteSize(1023)), "1023B");
    }

    #[test]
    fn formats_whole_units() {
        assert_eq!(format!("{}", ByteSize(1024)), "1KiB");
        assert_eq!(format!("{}", ByteSize(8 * 1024)), "8KiB");
        assert_eq!(format!("{}", ByteSize(1024 * 1024)), "1MiB");
        assert_eq!(format!("{}", ByteSize(3 * 1024 * 1024 * 1024)), "3GiB");
    }

    #[test]
    fn formats_fractional_units() {
        assert_eq!(format!("{}", ByteSize(1536)), "1.5KiB");
        assert_eq!(format!("{}", ByteSize(1024 + 256)), "1.25KiB");
        assert_eq!(format!("{}", ByteSize(1536 * 1024)), "1.5MiB");
    }

    #[test]
    fn truncates_to_two_digits() {
        // 1025B is 1.0009... KiB; the fraction is below the precision shown.
        assert_eq!(format!("{}", ByteSize(1025)), "1KiB");
    }
}
