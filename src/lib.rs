//! # Task orchestration for vertical federated learning
//!
//! In vertical federated learning every party holds a different slice of the features of a
//! shared set of samples, and exactly one party holds the labels. The parties train a model
//! jointly without revealing their raw data: in every round each party sends intermediate values
//! computed from its own features to all others.
//!
//! This crate runs such tasks on behalf of one party. A [`Coordinator`] admits training and
//! prediction tasks up to configurable limits, drives their rounds with its peers and hands the
//! outcomes to a [`ModelHolder`]. Trained models can be evaluated with a random split, cross
//! validation or leave-one-out, where the label holder scores every fold and confirms it to the
//! other parties.
//!
//! The peers are reached through a [`PeerTransport`]. The [`LocalNetwork`] connects coordinators
//! on the same runtime, which is what the `simulate` binary and the tests use.
//!
//! [`PeerTransport`]: rpc::PeerTransport

pub mod algorithms;
pub mod common;
pub mod coordinator;
pub mod evaluator;
pub mod holder;
mod predictor;
pub mod rpc;
pub mod settings;
mod trainer;
mod worker;

#[cfg(test)]
mod tests;

pub use crate::{
    coordinator::{Config, Coordinator, CoordinatorHandle},
    holder::{InMemoryHolder, ModelHolder},
    rpc::LocalNetwork,
};
