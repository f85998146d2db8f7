use std::time::SystemTime;
use log::debug;
use tokio::time::{Duration, Instant};

use crate::device::types::Measurement;

/// Turns data-channel notifications into measurements. Runs once per frame, so it
/// does not allocate beyond the record itself and only logs when asked to.
#[derive(Debug)]
pub struct DataStreamProcessor {
    unit: String,
    diagnostics: bool,
    log_interval: Duration,
    last_log: Option<Instant>,
    received: u64,
    dropped: u64,
}

impl DataStreamProcessor {
    pub fn new(unit: &str, diagnostics: bool, log_interval: Duration) -> Self {
        DataStreamProcessor {
            unit: unit.to_string(),
            diagnostics,
            log_interval,
            last_log: None,
            received: 0,
            dropped: 0,
        }
    }

    /// Malformed frames yield `None`; they are expected noise on this link.
    pub fn process(&mut self, frame: &[u8]) -> Option<Measurement> {
        self.received += 1;

        let measurement = parse_value(frame).map(|value| Measurement {
            value,
            captured_at: SystemTime::now(),
            unit: self.unit.clone(),
        });

        if measurement.is_none() {
            self.dropped += 1;
        }

        if self.diagnostics {
            self.log_throttled(frame, measurement.as_ref());
        }

        measurement
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn log_throttled(&mut self, frame: &[u8], measurement: Option<&Measurement>) {
        let now = Instant::now();
        if let Some(last) = self.last_log {
            if now.duration_since(last) < self.log_interval {
                return;
            }
        }
        self.last_log = Some(now);

        debug!(
            "Data stream: {} frames, {} dropped; last frame {:?} -> {:?}",
            self.received,
            self.dropped,
            String::from_utf8_lossy(frame),
            measurement.map(|m| m.value),
        );
    }
}

fn parse_value(frame: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(frame).ok()?;
    let value: f64 = text.trim().parse().ok()?;

    // "NaN" and "inf" parse as f64 but are not decimal readings
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> DataStreamProcessor {
        DataStreamProcessor::new("g", false, Duration::from_millis(500))
    }

    #[test]
    fn parses_decimal_frames() {
        let mut processor = processor();

        let measurement = processor.process(b" 12.5\r\n").unwrap();
        assert_eq!(measurement.value, 12.5);
        assert_eq!(measurement.unit, "g");

        assert_eq!(processor.process(b"-3").unwrap().value, -3.0);
    }

    #[test]
    fn drops_malformed_frames() {
        let mut processor = processor();

        let frames: [&[u8]; 7] = [b"", b"   ", b"abc", b"12,5", b"NaN", b"inf", &[0xff, 0xfe]];
        for frame in frames {
            assert!(processor.process(frame).is_none(), "frame {:?} should be dropped", frame);
        }
        assert_eq!(processor.received(), 7);
        assert_eq!(processor.dropped(), 7);
    }

    #[test]
    fn diagnostics_do_not_change_results() {
        let mut processor = DataStreamProcessor::new("g", true, Duration::from_millis(500));

        assert!(processor.process(b"1").is_some());
        assert!(processor.process(b"x").is_none());
        assert_eq!(processor.dropped(), 1);
    }
}
