//! One file per phase. Each state declares the states it may move to with
//! `TransitionTo`.
pub(crate) mod addresses;
pub(crate) mod cleanup;
pub(crate) mod convergence;
pub(crate) mod done;
pub(crate) mod handoff;
pub(crate) mod provisioning;
pub(crate) mod reachability;
pub(crate) mod start;

pub(crate) use start::Start;
