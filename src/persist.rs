//! The part of a saved session owned by the acquisition engine: trigger intent, synchronization
//! settings and instrument identity. Waveform bytes and file layout belong to the session layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::instrument::{InstrumentId, StreamDescriptor};
use crate::trigger::TriggerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmIntent {
    Stopped,
    Continuous,
    Single,
}

impl ArmIntent {
    pub fn from_state(state: TriggerState, oneshot: bool) -> ArmIntent {
        match state {
            TriggerState::Disarmed => ArmIntent::Stopped,
            _ if oneshot => ArmIntent::Single,
            _ => ArmIntent::Continuous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub id: InstrumentId,
    pub name: String,
    pub streams: Vec<StreamDescriptor>,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub trigger: ArmIntent,
    #[serde(with = "humantime_serde")]
    pub sync_window: Duration,
    pub synchronize: bool,
    pub instruments: Vec<InstrumentRecord>,
}

impl SessionDocument {
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<SessionDocument> {
        Ok(SessionDocument::deserialize(value)?)
    }

    pub fn primary(&self) -> Option<&InstrumentRecord> {
        self.instruments.iter().find(|record| record.primary)
    }
}
