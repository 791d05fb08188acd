//! Log formatting for operator-supplied names and raw radio frames.

use std::fmt;

use crate::validation::MAX_AQUARIUM_NAME_LEN;

/// Operator-supplied name rendered for a log line.
///
/// Device, aquarium and schedule names arrive over the radio or from the
/// state file, so they are quoted, cut at the longest name the fleet accepts
/// and stripped of anything that would split the line. Formats lazily, so a
/// filtered-out `debug!` costs nothing.
#[derive(Clone, Copy)]
pub struct LogName<'a>(pub &'a str);

impl fmt::Display for LogName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<unnamed>");
        }
        f.write_str("'")?;
        for (i, ch) in self.0.chars().enumerate() {
            if i == MAX_AQUARIUM_NAME_LEN {
                f.write_str("…")?;
                break;
            }
            match ch {
                '\'' => f.write_str("\\'")?,
                c if c.is_control() => write!(f, "\\x{:02X}", c as u32)?,
                c => write!(f, "{}", c)?,
            }
        }
        f.write_str("'")
    }
}

/// Shorthand for `LogName(name)`.
pub fn log_name(name: &str) -> LogName<'_> {
    LogName(name)
}

/// Space separated hex of the first `max` bytes, for trace logging of raw frames.
pub fn hex_preview(bytes: &[u8], max: usize) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len().min(max) * 3 + 4);
    for (i, b) in bytes.iter().take(max).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{:02X}", b);
    }
    if bytes.len() > max {
        let _ = write!(&mut out, " …(+{})", bytes.len() - max);
    }
    out
}
