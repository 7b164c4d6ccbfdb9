//! Software trigger configuration and pulses

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{AcqError, SdkError};
use crate::sdk::NodeMap;

/// Which acquisition event the trigger starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSelector {
    FrameStart,
    ExposureStart,
}

impl TriggerSelector {
    pub fn entry(self) -> &'static str {
        match self {
            TriggerSelector::FrameStart => "FrameStart",
            TriggerSelector::ExposureStart => "ExposureStart",
        }
    }
}

impl fmt::Display for TriggerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Unconfigured,
    /// Mode On, source Software
    Configured(TriggerSelector),
    /// Configured and the device is acquiring
    Armed(TriggerSelector),
}

/// Drives one device's trigger nodes.
///
/// `Unconfigured -> Configured -> Armed`. Pulses are only accepted when
/// armed; the owning worker arms on start and disarms on stop.
#[derive(Debug)]
pub struct TriggerController {
    camera: String,
    state: TriggerState,
}

impl TriggerController {
    pub fn new(camera: impl Into<String>) -> Self {
        Self {
            camera: camera.into(),
            state: TriggerState::Unconfigured,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn selector(&self) -> Option<TriggerSelector> {
        match self.state {
            TriggerState::Unconfigured => None,
            TriggerState::Configured(s) | TriggerState::Armed(s) => Some(s),
        }
    }

    /// Puts the device into software-trigger mode.
    ///
    /// Binds the selector to `FrameStart`, falling back to `ExposureStart`
    /// when the device does not offer it, then sets mode On and source
    /// Software.
    pub fn configure(&mut self, nodes: &mut dyn NodeMap) -> Result<TriggerSelector, AcqError> {
        let selector = match nodes.set_enum("TriggerSelector", TriggerSelector::FrameStart.entry()) {
            Ok(()) => TriggerSelector::FrameStart,
            Err(SdkError::EntryNotAvailable { .. }) => {
                debug!(camera = %self.camera, "FrameStart unavailable, trying ExposureStart");
                nodes
                    .set_enum("TriggerSelector", TriggerSelector::ExposureStart.entry())
                    .map_err(|e| self.rejected("TriggerSelector", e))?;
                TriggerSelector::ExposureStart
            }
            Err(e) => return Err(self.rejected("TriggerSelector", e)),
        };

        nodes
            .set_enum("TriggerMode", "On")
            .map_err(|e| self.rejected("TriggerMode", e))?;
        nodes
            .set_enum("TriggerSource", "Software")
            .map_err(|e| self.rejected("TriggerSource", e))?;

        info!(camera = %self.camera, %selector, "Software trigger configured");
        self.state = TriggerState::Configured(selector);
        Ok(selector)
    }

    pub fn arm(&mut self) -> Result<(), AcqError> {
        match self.state {
            TriggerState::Configured(s) | TriggerState::Armed(s) => {
                self.state = TriggerState::Armed(s);
                Ok(())
            }
            TriggerState::Unconfigured => Err(AcqError::protocol(
                &self.camera,
                "arm",
                "trigger not configured",
            )),
        }
    }

    pub fn disarm(&mut self) {
        if let TriggerState::Armed(s) = self.state {
            self.state = TriggerState::Configured(s);
        }
    }

    /// Issues one software trigger. Rejected without touching the device
    /// unless armed.
    pub fn pulse(&self, nodes: &mut dyn NodeMap) -> Result<(), AcqError> {
        if !matches!(self.state, TriggerState::Armed(_)) {
            return Err(AcqError::protocol(
                &self.camera,
                "trigger",
                format!("trigger is {:?}", self.state),
            ));
        }
        nodes
            .execute("TriggerSoftware")
            .map_err(|e| AcqError::from_sdk(&self.camera, e))
    }

    /// Forces trigger mode Off. Best effort: failures are logged.
    pub fn teardown(&mut self, nodes: &mut dyn NodeMap) {
        if let Err(e) = nodes.set_enum("TriggerMode", "Off") {
            warn!(camera = %self.camera, "Could not switch trigger mode off: {}", e);
        }
        self.state = TriggerState::Unconfigured;
    }

    fn rejected(&self, node: &str, err: SdkError) -> AcqError {
        AcqError::Configuration {
            camera: self.camera.clone(),
            message: format!("{node}: {err}"),
        }
    }
}
