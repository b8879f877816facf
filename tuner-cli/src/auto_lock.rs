//! Auto mode: a note is only shown once the same name has been detected in
//! two consecutive frames, which hides single-frame octave jumps and noise.

use tuner_core::DetectedNote;

#[derive(Debug, Default)]
pub struct AutoLock {
    last_name: Option<String>,
}

impl AutoLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the note if it repeats the previous name. A differing name
    /// becomes the new candidate and is held back.
    pub fn accept<'a>(&mut self, note: &'a DetectedNote) -> Option<&'a DetectedNote> {
        if self.last_name.as_deref() == Some(note.name.as_str()) {
            Some(note)
        } else {
            self.last_name = Some(note.name.clone());
            None
        }
    }

    pub fn reset(&mut self) {
        self.last_name = None;
    }
}
