//! Text rendering for the terminal tuner.

use tuner_core::DetectedNote;
use tuner_core::audio::DeviceDescriptor;

/// The meter spans -50 to +50 cents, half a scale step either way.
const METER_RANGE: i32 = 50;
const METER_WIDTH: usize = 41;

/// Renders a needle on a fixed-width scale, e.g. `[-----|---+--------]`.
pub fn cent_meter(cents: i32) -> String {
    let clamped = cents.clamp(-METER_RANGE, METER_RANGE);
    let span = (METER_WIDTH - 1) as i32;
    let needle = ((clamped + METER_RANGE) * span / (2 * METER_RANGE)) as usize;
    let center = METER_WIDTH / 2;

    let body: String = (0..METER_WIDTH)
        .map(|i| match i {
            _ if i == needle => '|',
            _ if i == center => '+',
            _ => '-',
        })
        .collect();
    format!("[{body}]")
}

/// Accuracy label used next to the meter.
pub fn accuracy(cents: i32) -> &'static str {
    match cents.abs() {
        0..5 => "in tune",
        5..20 => "close",
        _ if cents < 0 => "flat",
        _ => "sharp",
    }
}

pub fn note_line(note: &DetectedNote) -> String {
    format!(
        "{:>3}{:<2} {:>+4} cents {} {:8.2} Hz  {}",
        note.name,
        note.octave,
        note.cents,
        cent_meter(note.cents),
        note.frequency,
        accuracy(note.cents)
    )
}

pub fn device_list(devices: &[DeviceDescriptor], selected: Option<&str>) -> String {
    if devices.is_empty() {
        return "No input devices found".to_string();
    }
    devices
        .iter()
        .map(|d| {
            let marker = if Some(d.id.as_str()) == selected { '*' } else { ' ' };
            format!("{marker} {}", d.label)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
