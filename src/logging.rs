/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the session's
//! [configuration](crate::config::Configuration).
//!
//! Logging goes through the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveCommit](crate::events::ReceiveCommitEvent) is printed:
//!
//! ```text
//! ReceiveCommit, 1701329264, 2, 17, 16, 140, Id5u7f6
//! ```
//!
//! In the snippet:
//! - The third value is the slot of the peer that sent the commit.
//! - The fourth value is the committed round.
//! - The fifth and sixth values are the sender's average frame time and average ping time, in milliseconds.
//! - The seventh value is the first seven characters of the Base64 encoding of the sender's state hash.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;

use crate::events::*;
use crate::simulation::manager::Termination;

// Names of each event in PascalCase for printing:
pub const COMMIT: &str = "Commit";
pub const RECEIVE_COMMIT: &str = "ReceiveCommit";
pub const RECEIVE_COMMIT_ACK: &str = "ReceiveCommitAck";

pub const START_ROUND: &str = "StartRound";
pub const WAIT_FOR_COMMIT: &str = "WaitForCommit";
pub const RESUME_FROM_WAIT: &str = "ResumeFromWait";

pub const PEER_LEFT: &str = "PeerLeft";
pub const HOST_LEFT: &str = "HostLeft";

pub const SIMULATION_ERROR: &str = "SimulationError";
pub const TERMINATE: &str = "Terminate";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                commit_event.round,
                commit_event.ticket,
                commit_event.aft.millis(),
                commit_event.apt.millis(),
                first_seven_base64_chars(commit_event.state_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_commit_event: &ReceiveCommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                RECEIVE_COMMIT,
                secs_since_unix_epoch(receive_commit_event.timestamp),
                receive_commit_event.origin,
                receive_commit_event.commit.round,
                receive_commit_event.commit.aft.millis(),
                receive_commit_event.commit.apt.millis(),
                first_seven_base64_chars(receive_commit_event.commit.state_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveCommitAckEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_commit_ack_event: &ReceiveCommitAckEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_COMMIT_ACK,
                secs_since_unix_epoch(receive_commit_ack_event.timestamp),
                receive_commit_ack_event.origin,
                receive_commit_ack_event.ticket,
                receive_commit_ack_event.round_trip.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_round_event: &StartRoundEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                START_ROUND,
                secs_since_unix_epoch(start_round_event.timestamp),
                start_round_event.round,
                start_round_event.pacing.target_frame_time.as_millis(),
                start_round_event.pacing.frame_count
            )
        };
        Box::new(logger)
    }
}

impl Logger for WaitForCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |wait_for_commit_event: &WaitForCommitEvent| {
            log::info!(
                "{}, {}, {}",
                WAIT_FOR_COMMIT,
                secs_since_unix_epoch(wait_for_commit_event.timestamp),
                wait_for_commit_event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for ResumeFromWaitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |resume_from_wait_event: &ResumeFromWaitEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RESUME_FROM_WAIT,
                secs_since_unix_epoch(resume_from_wait_event.timestamp),
                resume_from_wait_event.round,
                resume_from_wait_event.waited.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for PeerLeftEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |peer_left_event: &PeerLeftEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PEER_LEFT,
                secs_since_unix_epoch(peer_left_event.timestamp),
                peer_left_event.peer,
                peer_left_event
                    .round
                    .map(|round| round.to_string())
                    .unwrap_or_else(|| String::from("-")),
                peer_left_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for HostLeftEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |host_left_event: &HostLeftEvent| {
            log::info!(
                "{}, {}, {}",
                HOST_LEFT,
                secs_since_unix_epoch(host_left_event.timestamp),
                host_left_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for SimulationErrorEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |simulation_error_event: &SimulationErrorEvent| {
            log::error!(
                "{}, {}, {}",
                SIMULATION_ERROR,
                secs_since_unix_epoch(simulation_error_event.timestamp),
                simulation_error_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for TerminateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |terminate_event: &TerminateEvent| {
            log::info!(
                "{}, {}, {}",
                TERMINATE,
                secs_since_unix_epoch(terminate_event.timestamp),
                termination_info(&terminate_event.termination)
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn termination_info(termination: &Termination) -> String {
    match termination {
        Termination::Finished => String::from("Finished"),
        Termination::HostLeft => String::from("HostLeft"),
        Termination::Failed { reason, .. } => format!("Failed: {}", reason),
    }
}
