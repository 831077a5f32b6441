use std::time::Duration;

use lockstep_rs::{config::Configuration, types::data_types::PeerIndex};

/// Parameters shared by the manager tests: frames of 50ms to 300ms, 1 to 8 frames per round, and the
/// moving averages seeded with 50ms frames and 100ms pings.
pub(crate) fn manager_configuration(me: usize) -> Configuration {
    Configuration::builder()
        .me(PeerIndex::new(me))
        .min_target_frame_time(Duration::from_millis(50))
        .max_target_frame_time(Duration::from_millis(300))
        .min_frames_per_round(1)
        .max_frames_per_round(8)
        .commit_timeout(Duration::from_secs(10))
        .commit_answer_timeout(Duration::from_secs(10))
        .average_window(4)
        .frame_time_seed(Duration::from_millis(50))
        .ping_time_seed(Duration::from_millis(100))
        .build()
}

/// Short frames so that a threaded session runs many rounds quickly.
pub(crate) fn session_configuration(me: usize) -> Configuration {
    Configuration::builder()
        .me(PeerIndex::new(me))
        .min_target_frame_time(Duration::from_millis(2))
        .max_target_frame_time(Duration::from_millis(20))
        .min_frames_per_round(1)
        .max_frames_per_round(4)
        .commit_timeout(Duration::from_secs(5))
        .commit_answer_timeout(Duration::from_secs(5))
        .frame_time_seed(Duration::from_millis(2))
        .ping_time_seed(Duration::from_millis(5))
        .log_events(true)
        .build()
}
