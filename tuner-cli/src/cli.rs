use clap::{Parser, ValueEnum};
use tuner_core::tuning::Scale;

#[derive(Parser, Debug)]
#[command(
    name = "heptatune",
    version,
    about = "Live tuner for seven-step equal-tempered instruments"
)]
pub struct Cli {
    /// Frequency of the reference note in Hz. Saved for the next run.
    #[arg(short, long)]
    pub reference: Option<f64>,

    /// Input device id (see --list-devices). Defaults to the system input.
    #[arg(short, long)]
    pub device: Option<String>,

    /// List input devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Route the microphone to the speakers while tuning
    #[arg(long)]
    pub monitor: bool,

    /// Only show a note once it has been heard twice in a row
    #[arg(long)]
    pub auto: bool,

    /// Note names to display
    #[arg(long, value_enum, default_value_t = ScaleChoice::Thai)]
    pub scale: ScaleChoice,

    /// Play the in-tune pitch of this note index while listening (42 is the
    /// reference note)
    #[arg(long, value_name = "NOTE_INDEX", allow_negative_numbers = true)]
    pub play: Option<i32>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleChoice {
    Thai,
    Latin,
}

impl From<ScaleChoice> for Scale {
    fn from(choice: ScaleChoice) -> Self {
        match choice {
            ScaleChoice::Thai => Scale::THAI,
            ScaleChoice::Latin => Scale::LATIN,
        }
    }
}
