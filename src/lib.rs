pub mod action;
pub mod actor;
pub mod cli;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod postcondition;
pub mod ptt;
pub mod rfss;
pub mod scenario;
pub mod scheduler;
pub mod script;
pub mod sip;
pub mod testutil;
pub mod timer;
pub mod topology;
pub mod trace;
pub mod transport;
pub mod trigger;
