use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::device::{DeviceLease, DeviceRegistry, DeviceSet};
use crate::error::{HarnessError, Result};

use super::EngineHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loaded,
    Ready,
    Running,
}

/// How a model instance gives its devices back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Teardown {
    /// Free device memory, keep the engine resident for the next load.
    #[default]
    FreeDevices,
    /// Tear the engine down completely.
    Deinit,
}

/// One set of weights loaded onto one [`DeviceSet`].
///
/// The instance holds the device lease for as long as it exists, so a second
/// instance cannot be loaded onto the same devices until this one is torn
/// down.
#[derive(Debug)]
pub struct ModelInstance {
    weights: PathBuf,
    lease: DeviceLease,
    state: ModelState,
    config: Option<GenerationConfig>,
    load_time: Duration,
}

impl ModelInstance {
    /// `Unloaded -> Loaded`. The device claim happens before the engine is
    /// touched.
    pub fn load<E: EngineHandle + ?Sized>(
        engine: &mut E,
        registry: &DeviceRegistry,
        devices: &DeviceSet,
        weights: &Path,
    ) -> Result<Self> {
        let lease = registry.claim(devices)?;

        tracing::info!(weights = %weights.display(), devices = %devices, "loading model");
        let start = Instant::now();
        engine.load(devices, weights).map_err(HarnessError::from)?;
        let load_time = start.elapsed();
        tracing::info!(elapsed = ?load_time, "model loaded");

        Ok(Self {
            weights: weights.to_path_buf(),
            lease,
            state: ModelState::Loaded,
            config: None,
            load_time,
        })
    }

    /// `Loaded -> Ready`. The config is bound once and never changes for the
    /// lifetime of this instance.
    pub fn configure<E: EngineHandle + ?Sized>(
        &mut self,
        engine: &mut E,
        config: &GenerationConfig,
    ) -> Result<()> {
        if self.state != ModelState::Loaded || self.config.is_some() {
            return Err(HarnessError::Config(format!(
                "generation config can only be applied once, right after load (state {:?})",
                self.state
            )));
        }
        config.validate()?;
        engine.configure(config);
        self.config = Some(config.clone());
        self.state = ModelState::Ready;
        Ok(())
    }

    /// `Ready -> Running`; a no-op when already running.
    pub fn begin_task(&mut self) -> Result<()> {
        match self.state {
            ModelState::Ready | ModelState::Running => {
                self.state = ModelState::Running;
                Ok(())
            }
            state => Err(HarnessError::Inference(format!(
                "cannot run a task while the model is {:?}",
                state
            ))),
        }
    }

    /// `Running -> Loaded` once every task for this model is done.
    pub fn finish_tasks(&mut self) {
        if self.state == ModelState::Running || self.state == ModelState::Ready {
            self.state = ModelState::Loaded;
        }
    }

    /// Gives the devices back. Consumes the instance so nothing can be run on
    /// it afterwards.
    pub fn teardown<E: EngineHandle + ?Sized>(
        mut self,
        engine: &mut E,
        how: Teardown,
    ) -> Result<()> {
        self.finish_tasks();
        let outcome = match how {
            Teardown::FreeDevices => engine.free_devices(),
            Teardown::Deinit => engine.deinit(),
        };
        self.state = ModelState::Unloaded;
        tracing::info!(weights = %self.weights.display(), teardown = ?how, "model unloaded");
        outcome.map_err(HarnessError::from)
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn devices(&self) -> &DeviceSet {
        self.lease.devices()
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }
}
