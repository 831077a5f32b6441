/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](network::Network) for pluggable peer-to-peer networking, as well as the internal
//! types and functions that the simulation thread uses to interact with the network.

pub mod network;

pub(crate) mod receiving;

pub(crate) mod sending;
