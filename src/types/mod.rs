/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that are common across the components of the synchronization core.
//!
//! The types defined in [`data_types`] are "inert": they are sent around and inspected, but have no
//! active behavior. They follow the newtype pattern. [`membership`] defines the operator membership
//! vector that every round and commit monitor is evaluated against.

pub mod data_types;

pub mod membership;
