use crate::{
    error::EngineError,
    graph::{
        node::{NodeId, NodeSpec, ParamKind},
        param::{ParamTimeline, RampCommand},
    },
};

/// The output device as seen from the control thread.
///
/// Implementations own the nodes; callers only ever hold [`NodeId`]s. Every
/// mutating call returns `StaleNode` when the id no longer refers to a live
/// node, so teardown paths can tolerate double stops.
pub trait AudioDevice {
    fn sample_rate(&self) -> f32;

    /// Device clock in seconds. Ramps are scheduled against this.
    fn current_time(&self) -> f64;

    fn is_ready(&self) -> bool {
        true
    }

    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, EngineError>;

    /// Feed `from`'s output into `to`'s input. Inputs are summed.
    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), EngineError>;

    fn start(&mut self, node: NodeId, at: f64) -> Result<(), EngineError>;

    /// Stopping a node twice returns `StaleNode`.
    fn stop(&mut self, node: NodeId) -> Result<(), EngineError>;

    /// Detach the node from the graph and release its slot.
    fn disconnect(&mut self, node: NodeId) -> Result<(), EngineError>;

    fn schedule(
        &mut self,
        node: NodeId,
        param: ParamKind,
        command: RampCommand,
    ) -> Result<(), EngineError>;

    /// Instantaneous value of a parameter at the device's current time.
    fn param_value(&self, node: NodeId, param: ParamKind) -> Option<f32>;

    fn timeline(&self, node: NodeId, param: ParamKind) -> Option<&ParamTimeline>;

    /// Copy the most recent tap samples (oldest first) into `out`, returning
    /// how many were written.
    fn read_tap(&mut self, node: NodeId, out: &mut [f32]) -> usize;

    fn is_live(&self, node: NodeId) -> bool;

    fn schedule_all(
        &mut self,
        node: NodeId,
        param: ParamKind,
        commands: &[RampCommand],
    ) -> Result<(), EngineError> {
        for &command in commands {
            self.schedule(node, param, command)?;
        }
        Ok(())
    }

    /// Glide from the current value to `value` over `duration` seconds,
    /// cancelling anything already pending.
    fn ramp_to(
        &mut self,
        node: NodeId,
        param: ParamKind,
        value: f32,
        duration: f64,
    ) -> Result<(), EngineError> {
        let now = self.current_time();
        let current = self
            .param_value(node, param)
            .ok_or(EngineError::StaleNode(node))?;

        self.schedule_all(
            node,
            param,
            &[
                RampCommand::CancelScheduled { from: now },
                RampCommand::SetValueAt {
                    value: current,
                    time: now,
                },
                RampCommand::LinearRampTo {
                    value,
                    end_time: now + duration,
                },
            ],
        )
    }

    /// Jump to `value` now, cancelling anything already pending.
    fn set_now(&mut self, node: NodeId, param: ParamKind, value: f32) -> Result<(), EngineError> {
        let now = self.current_time();
        self.schedule_all(
            node,
            param,
            &[
                RampCommand::CancelScheduled { from: now },
                RampCommand::SetValueAt { value, time: now },
            ],
        )
    }
}
