pub(crate) mod client;

pub(crate) mod configuration;

pub(crate) mod logging;

pub(crate) mod network;

pub(crate) mod timer;
