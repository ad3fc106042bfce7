//! Signal alphabet shared by networks, body parts and the wiring resolver.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value a body part can expose to its neighbours, or a socket it can
/// receive on.
///
/// `Node` names a node of the part's own control network. The sensor tags
/// (`Joint`, `Contact`) are read from the physics simulation, while `Motor`
/// tags name the three per-axis motor sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Signal {
    Node(usize),
    Joint(u8),
    Contact,
    Motor(u8),
}

impl Signal {
    /// Sensor tags read from the simulation rather than from a network.
    pub fn is_sensor(&self) -> bool {
        matches!(self, Signal::Joint(_) | Signal::Contact)
    }

    pub fn is_motor(&self) -> bool {
        matches!(self, Signal::Motor(_))
    }

    /// Short column label used in signal logs.
    pub fn label(&self) -> String {
        match self {
            Signal::Node(i) => format!("n{}", i),
            Signal::Joint(a) => format!("j{}", a),
            Signal::Contact => "c".to_string(),
            Signal::Motor(s) => format!("m{}", s),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Node(i) => write!(f, "NODE_{}", i),
            Signal::Joint(a) => write!(f, "JOINT_{}", a),
            Signal::Contact => write!(f, "CONTACT"),
            Signal::Motor(s) => write!(f, "MOTOR_{}", s),
        }
    }
}

/// A cross-network input installed on a node: where it comes from, how
/// strongly it counts, and the value last read from its source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExternalInput {
    /// Source body part (index into the phenotype graph)
    pub part: usize,
    /// Source signal on that part
    pub signal: Signal,
    /// Weight in [-7, 7]
    pub weight: f32,
    /// Current value in [0, 1], refreshed every tick by the simulator
    pub value: f32,
}

impl ExternalInput {
    pub fn new(part: usize, signal: Signal, weight: f32) -> Self {
        Self {
            part,
            signal,
            weight,
            value: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_tags() {
        assert!(Signal::Joint(1).is_sensor());
        assert!(Signal::Contact.is_sensor());
        assert!(!Signal::Node(0).is_sensor());
        assert!(!Signal::Motor(2).is_sensor());
        assert!(Signal::Motor(2).is_motor());
    }

    #[test]
    fn test_display_uses_tag_names() {
        assert_eq!(Signal::Joint(2).to_string(), "JOINT_2");
        assert_eq!(Signal::Motor(0).to_string(), "MOTOR_0");
        assert_eq!(Signal::Contact.to_string(), "CONTACT");
        assert_eq!(Signal::Node(3).label(), "n3");
    }
}
