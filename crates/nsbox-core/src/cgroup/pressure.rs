//! Pressure stall information (`*.pressure` files).

use serde::Serialize;

/// One line of a PSI file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StallWindow {
    /// Share of time stalled over the last 10 seconds, in percent.
    pub avg10: f64,
    /// Over the last 60 seconds.
    pub avg60: f64,
    /// Over the last 300 seconds.
    pub avg300: f64,
    /// Total stall time in microseconds.
    pub total_usec: u64,
}

/// Parsed contents of `memory.pressure` or `cpu.pressure`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Pressure {
    /// Some tasks were stalled.
    pub some: StallWindow,
    /// All non-idle tasks were stalled at once, when reported.
    pub full: Option<StallWindow>,
}

impl Pressure {
    /// Parses PSI output such as
    /// `some avg10=0.00 avg60=0.00 avg300=0.00 total=0`.
    ///
    /// Returns `None` when no `some` line is present.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let mut some = None;
        let mut full = None;
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("some") => some = parse_window(fields),
                Some("full") => full = parse_window(fields),
                _ => {}
            }
        }
        Some(Self { some: some?, full })
    }
}

fn parse_window<'a>(fields: impl Iterator<Item = &'a str>) -> Option<StallWindow> {
    let mut window = StallWindow::default();
    for field in fields {
        let (key, value) = field.split_once('=')?;
        match key {
            "avg10" => window.avg10 = value.parse().ok()?,
            "avg60" => window.avg60 = value.parse().ok()?,
            "avg300" => window.avg300 = value.parse().ok()?,
            "total" => window.total_usec = value.parse().ok()?,
            _ => {}
        }
    }
    Some(window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pressure_with_full_line() {
        let content = "some avg10=1.50 avg60=0.25 avg300=0.00 total=4200\n\
                       full avg10=0.75 avg60=0.00 avg300=0.00 total=1800\n";
        let p = Pressure::parse(content).expect("psi");
        assert!((p.some.avg10 - 1.5).abs() < f64::EPSILON);
        assert_eq!(p.some.total_usec, 4200);
        assert_eq!(p.full.map(|f| f.total_usec), Some(1800));
    }

    #[test]
    fn missing_some_line_is_none() {
        assert!(Pressure::parse("").is_none());
        assert!(Pressure::parse("some avg10=oops\n").is_none());
    }
}
