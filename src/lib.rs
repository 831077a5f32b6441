/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of a lockstep synchronization core for peer-to-peer real-time simulations.
//!
//! Every peer in a session executes the same sequence of simulation frames, in the same order, with the
//! same commands. Frames are batched into rounds, and rounds are pipelined so that the commit exchange
//! for a round happens while earlier rounds execute, hiding network latency from the frame cadence.
//!
//! The library user supplies:
//! - A [simulation client](client::SimulationClient) that steps the deterministic simulation,
//! - A [network](networking::network::Network) over which the peers exchange frames, and
//! - A [configuration](config::Configuration) of frame time and frame count bounds and timeouts.
//!
//! and starts a [session](session::SessionSpec) with them.

pub mod client;

pub mod config;

pub mod events;

pub(crate) mod event_bus;

pub mod logging;

pub mod messages;

pub mod moving_average;

pub mod networking;

pub mod session;

pub mod simulation;

pub mod timer;

pub mod types;
