use std::fmt;

use crate::{
    engine::{params::ParameterAddress, sources::ModSource},
    graph::node::NodeId,
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The output device is missing or not ready yet.
    DeviceUnavailable,
    /// The device command queue is full; the command was dropped.
    QueueFull,
    /// The device has no room for another node or connection.
    DeviceFull,
    InvalidWaveform { reason: &'static str },
    /// The node was already stopped or removed.
    StaleNode(NodeId),
    SlotOutOfRange { slot: usize },
    UnknownParameter(ParameterAddress),
    DuplicateParameter(ParameterAddress),
    RouteSlotOutOfRange { slot: usize },
    UnknownSource(ModSource),
    ExpressionEvaluation { index: usize, message: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::DeviceUnavailable => write!(f, "output device is not ready"),
            EngineError::QueueFull => write!(f, "device command queue is full"),
            EngineError::DeviceFull => write!(f, "device node table is full"),
            EngineError::InvalidWaveform { reason } => write!(f, "invalid waveform: {reason}"),
            EngineError::StaleNode(id) => write!(f, "node {id} is already stopped or removed"),
            EngineError::SlotOutOfRange { slot } => {
                write!(f, "oscillator slot {slot} out of range")
            }
            EngineError::UnknownParameter(addr) => write!(f, "parameter {addr} is not registered"),
            EngineError::DuplicateParameter(addr) => {
                write!(f, "parameter {addr} is already registered")
            }
            EngineError::RouteSlotOutOfRange { slot } => {
                write!(f, "route slot {slot} out of range (expected 0 or 1)")
            }
            EngineError::UnknownSource(source) => write!(f, "no such modulation source {source}"),
            EngineError::ExpressionEvaluation { index, message } => {
                write!(f, "expression failed at sample {index}: {message}")
            }
        }
    }
}

impl std::error::Error for EngineError {}
