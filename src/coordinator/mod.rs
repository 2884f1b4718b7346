//! Session coordinator
//!
//! A single actor task owns every piece of session state: the active
//! [`Mode`], the auto-capture loop, the navigation session and any
//! calibration in progress. User intents and internal completions arrive on
//! one inbox, so no two handlers ever run concurrently.

mod handle;
mod intent;
mod machine;
mod mode;
mod prompt;

pub use handle::{CoordinatorGone, CoordinatorHandle, SessionSnapshot};
pub use intent::Intent;
pub use machine::{Coordinator, CoordinatorOptions, Devices, Services};
pub use mode::{ControlState, Mode};
pub use prompt::{Prompter, RecognitionError, SpeechRecognizer};
