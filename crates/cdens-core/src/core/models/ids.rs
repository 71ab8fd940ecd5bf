use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one frame of one replica trajectory.
///
/// Frames order by replica first and by time index second, which is the order
/// every selection and report in the crate uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId {
    pub replica: usize,
    pub time: usize,
}

impl FrameId {
    pub fn new(replica: usize, time: usize) -> Self {
        Self { replica, time }
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica {} frame {}", self.replica, self.time)
    }
}

/// Identifier of a basis set understood by the external spectrum predictor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasisSetId(String);

impl BasisSetId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BasisSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BasisSetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ids_order_by_replica_then_time() {
        let mut ids = vec![
            FrameId::new(1, 0),
            FrameId::new(0, 5),
            FrameId::new(0, 2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![FrameId::new(0, 2), FrameId::new(0, 5), FrameId::new(1, 0)]
        );
    }

    #[test]
    fn basis_set_id_displays_its_name() {
        let id = BasisSetId::from("ab-initio");
        assert_eq!(id.to_string(), "ab-initio");
        assert_eq!(id.as_str(), "ab-initio");
    }
}
