//! The concrete instantiation of a rule over one input set.

use crate::{
    commands::Command,
    graph::node::NodeId,
    language::{ProductId, Rule},
    script::EvalObservations,
    utils::FileTime,
};
use std::{collections::BTreeSet, sync::Arc};

/// Owns the output artifacts produced from a specific set of inputs and
/// the command list that produces them. Shared by all artifacts in
/// `outputs`.
#[derive(Clone, Debug)]
pub struct Transformer {
    pub rule: Arc<Rule>,
    pub product: ProductId,
    pub inputs: BTreeSet<NodeId>,
    pub explicitly_depends_on: BTreeSet<NodeId>,
    pub outputs: BTreeSet<NodeId>,
    pub commands: Vec<Command>,
    /// Everything the prepare script observed while creating `commands`.
    pub prepare_observations: EvalObservations,
    /// Everything script commands observed while executing.
    pub command_observations: EvalObservations,
    pub last_command_execution_time: FileTime,
    pub last_prepare_execution_time: FileTime,
    pub prepare_needs_change_tracking: bool,
    pub commands_need_change_tracking: bool,
    pub marked_for_rerun: bool,
    pub always_run: bool,
}

impl Transformer {
    pub fn new(rule: Arc<Rule>, product: ProductId) -> Self {
        let always_run = rule.always_run;
        Self {
            rule,
            product,
            inputs: BTreeSet::new(),
            explicitly_depends_on: BTreeSet::new(),
            outputs: BTreeSet::new(),
            commands: Vec::new(),
            prepare_observations: EvalObservations::default(),
            command_observations: EvalObservations::default(),
            last_command_execution_time: FileTime::oldest(),
            last_prepare_execution_time: FileTime::oldest(),
            prepare_needs_change_tracking: false,
            commands_need_change_tracking: false,
            marked_for_rerun: false,
            always_run,
        }
    }

    /// Carries the change-tracking snapshots of a predecessor over, so an
    /// artifact reused by a fresh application does not look dirty.
    pub fn rescue_change_tracking_data(&mut self, old: &Transformer) {
        self.prepare_observations = old.prepare_observations.clone();
        self.command_observations = old.command_observations.clone();
        self.last_command_execution_time = old.last_command_execution_time;
        self.last_prepare_execution_time = old.last_prepare_execution_time;
        self.prepare_needs_change_tracking = old.prepare_needs_change_tracking;
        self.commands_need_change_tracking = old.commands_need_change_tracking;
        self.marked_for_rerun = old.marked_for_rerun;
    }
}
