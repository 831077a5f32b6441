/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The user-defined parameters of a simulation session.
//!
//! The session's [configuration](Configuration) is defined using the builder pattern, for example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(PeerIndex::new(1))
//!     .min_target_frame_time(Duration::from_millis(50))
//!     .max_target_frame_time(Duration::from_millis(300))
//!     .min_frames_per_round(1)
//!     .max_frames_per_round(8)
//!     .commit_timeout(Duration::from_secs(10))
//!     .commit_answer_timeout(Duration::from_secs(10))
//!     .log_events(true)
//!     .build()
//! ```

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::simulation::round::PacingLimits;
use crate::types::data_types::PeerIndex;

/// Stores the user-defined parameters required to run the simulation stage, that is:
/// 1. The local peer's slot (0 for the host).
/// 2. The bounds that a round's target frame time is clamped to.
/// 3. The bounds that a round's frame count is clamped to. The upper bound is also the capacity of each
///    round's command buffer.
/// 4. The commit timeout: how long the next round may take to be fully committed once it became the
///    next round.
/// 5. The commit answer timeout: how long every active peer may take to acknowledge a commit.
/// 6. The window length and seeds of the frame time and ping time moving averages.
/// 7. The capacity of the simulation thread's event queue.
/// 8. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Log Events
///
/// Logging goes through the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed
/// onto a terminal or to a file, set up a
/// [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.min_target_frame_time(...)`
    - `.max_target_frame_time(...)`
    - `.min_frames_per_round(...)`
    - `.max_frames_per_round(...)`
    - `.commit_timeout(...)`
    - `.commit_answer_timeout(...)`

    Optional:
    - `.average_window(...)`
    - `.frame_time_seed(...)`
    - `.ping_time_seed(...)`
    - `.event_queue_capacity(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the local peer's slot. The host is slot 0. Required."))]
    pub me: PeerIndex,
    #[builder(setter(doc = "Set the shortest duration a frame may be paced at. Required."))]
    pub min_target_frame_time: Duration,
    #[builder(setter(doc = "Set the longest duration a frame may be paced at. Required."))]
    pub max_target_frame_time: Duration,
    #[builder(setter(doc = "Set the least number of frames in a round. Required."))]
    pub min_frames_per_round: u32,
    #[builder(setter(doc = "Set the greatest number of frames in a round. Required."))]
    pub max_frames_per_round: u32,
    #[builder(setter(doc = "Set how long the next round may go without being fully committed. Required."))]
    pub commit_timeout: Duration,
    #[builder(setter(doc = "Set how long a peer may take to acknowledge a commit. Required."))]
    pub commit_answer_timeout: Duration,
    #[builder(default = 16, setter(doc = "Set the number of samples kept by the moving averages. Optional, defaults to 16."))]
    pub average_window: usize,
    #[builder(default = Duration::from_millis(50), setter(doc = "Set the initial average frame time. Optional, defaults to 50ms."))]
    pub frame_time_seed: Duration,
    #[builder(default = Duration::from_millis(100), setter(doc = "Set the initial average ping time. Optional, defaults to 100ms."))]
    pub ping_time_seed: Duration,
    #[builder(default = 1024, setter(doc = "Set the capacity of the event queue. Optional, defaults to 1024."))]
    pub event_queue_capacity: usize,
    #[builder(default = false, setter(doc = "Enable logging? Optional, defaults to false."))]
    pub log_events: bool,
}

impl Configuration {
    /// Check that the parameters are consistent with each other.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.min_target_frame_time > self.max_target_frame_time {
            return Err(ConfigurationError::InvertedFrameTimeRange);
        }
        if self.max_target_frame_time.as_millis() > u16::MAX as u128 {
            return Err(ConfigurationError::FrameTimeTooLong);
        }
        if self.min_frames_per_round == 0 {
            return Err(ConfigurationError::NoFramesPerRound);
        }
        if self.min_frames_per_round > self.max_frames_per_round {
            return Err(ConfigurationError::InvertedFrameCountRange);
        }
        if self.average_window == 0 {
            return Err(ConfigurationError::EmptyAverageWindow);
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigurationError::EmptyEventQueue);
        }
        Ok(())
    }

    pub fn pacing_limits(&self) -> PacingLimits {
        PacingLimits {
            min_target_frame_time: self.min_target_frame_time,
            max_target_frame_time: self.max_target_frame_time,
            min_frames: self.min_frames_per_round,
            max_frames: self.max_frames_per_round,
        }
    }
}

/// Enumerates the ways a [`Configuration`] can be inconsistent.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    InvertedFrameTimeRange,
    /// Frame times are reported on the wire in 16-bit milliseconds.
    FrameTimeTooLong,
    NoFramesPerRound,
    InvertedFrameCountRange,
    EmptyAverageWindow,
    EmptyEventQueue,
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::InvertedFrameTimeRange => {
                write!(f, "min_target_frame_time exceeds max_target_frame_time")
            }
            ConfigurationError::FrameTimeTooLong => {
                write!(f, "max_target_frame_time exceeds {}ms", u16::MAX)
            }
            ConfigurationError::NoFramesPerRound => write!(f, "min_frames_per_round must be at least 1"),
            ConfigurationError::InvertedFrameCountRange => {
                write!(f, "min_frames_per_round exceeds max_frames_per_round")
            }
            ConfigurationError::EmptyAverageWindow => write!(f, "average_window must be at least 1"),
            ConfigurationError::EmptyEventQueue => write!(f, "event_queue_capacity must be at least 1"),
        }
    }
}
