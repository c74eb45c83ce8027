//! Progress and diagnostic reporting.

use log::Level;

/// Append-only channel for human-readable progress lines.
pub trait OutputSink {
    fn line(&mut self, level: Level, message: String);
}

/// Forwards every line to the `log` facade and keeps a copy.
#[derive(Debug, Default)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

impl OutputSink for Transcript {
    fn line(&mut self, level: Level, message: String) {
        log::log!(level, "{}", message);
        self.lines.push(message);
    }
}

/// `record!(sink, Info, "fmt", args..)`
macro_rules! record {
    ($sink:expr, $level:ident, $($arg:tt)+) => {
        $crate::transcript::OutputSink::line(
            &mut *$sink,
            ::log::Level::$level,
            format!($($arg)+),
        )
    };
}

pub(crate) use record;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_keeps_order() {
        let mut transcript = Transcript::new();
        let sink = &mut transcript;
        record!(sink, Info, "Creating VM");
        record!(sink, Warn, "slot {} busy", 2);

        assert_eq!(transcript.lines(), &["Creating VM", "slot 2 busy"]);
        assert_eq!(transcript.into_lines().len(), 2);
    }
}
