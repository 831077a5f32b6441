/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The simulation stage: pipelined rounds of lockstep frames.
//!
//! - [`round`]: one round's command buffer, commit flags, and pacing.
//! - [`pipeline`]: the four rounds alive at any time and their rotation.
//! - [`commit_monitor`]: acknowledgement tracking for one broadcast commit.
//! - [`manager`]: the protocol state machine that drives all of the above.

pub mod commit_monitor;

pub mod manager;

pub mod pipeline;

pub mod round;
