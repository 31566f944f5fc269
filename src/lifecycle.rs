//! Generation lifecycle as a pure state machine.
//!
//! `transition` maps (state, event) to (new state, effects). The engine runs
//! the effects, and effects that finish asynchronous work (precache, store
//! sweep) feed their result back in as the next event.
//!
//! ```text
//! Installing -> Waiting -> Activating -> Active -> Superseded
//!      \-> Failed
//! ```

use serde::Serialize;

use crate::cache::CacheNames;
use crate::error::EngineError;
use crate::messages::ClientEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
  Installing,
  Waiting,
  Activating,
  Active,
  Superseded,
  /// Precache failed; the generation never activates
  Failed,
}

/// One versioned set of stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub version: String,
  pub names: CacheNames,
  pub phase: Phase,
  /// Precache URLs that failed, when `phase` is `Failed`
  pub failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
  InstallStarted { version: String, names: CacheNames },
  PrecacheFinished { version: String, failed: Vec<String> },
  /// Promote the newest waiting generation
  SkipWaiting,
  ActivationFinished { version: String },
  /// Generation found already active in durable storage
  Restored { version: String, names: CacheNames },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
  Broadcast(ClientEvent),
  Precache { version: String },
  /// Delete every store not in `keep`, then report `ActivationFinished`
  Activate { version: String, keep: CacheNames },
  WriteMetadata { version: String },
}

/// All generations the engine knows about.
#[derive(Debug, Clone, Default)]
pub struct LifecycleState {
  generations: Vec<Generation>,
  skip_waiting: bool,
}

impl LifecycleState {
  /// `skip_waiting` promotes every generation as soon as it is precached.
  pub fn new(skip_waiting: bool) -> Self {
    Self {
      generations: Vec::new(),
      skip_waiting,
    }
  }

  pub fn generations(&self) -> &[Generation] {
    &self.generations
  }

  pub fn generation(&self, version: &str) -> Option<&Generation> {
    self.generations.iter().find(|g| g.version == version)
  }

  /// The generation serving traffic.
  pub fn current(&self) -> Option<&Generation> {
    self.in_phase(Phase::Active)
  }

  /// The generation new requests are routed to.
  ///
  /// Once promotion starts this is the activating generation, even though the
  /// previous one stays `Active` until the sweep finishes.
  pub fn serving(&self) -> Option<&Generation> {
    self.in_phase(Phase::Activating).or_else(|| self.current())
  }

  /// The newest generation waiting for promotion.
  pub fn waiting(&self) -> Option<&Generation> {
    self
      .generations
      .iter()
      .rev()
      .find(|g| g.phase == Phase::Waiting)
  }

  fn in_phase(&self, phase: Phase) -> Option<&Generation> {
    self.generations.iter().find(|g| g.phase == phase)
  }

  fn generation_mut(&mut self, version: &str) -> Result<&mut Generation, EngineError> {
    self
      .generations
      .iter_mut()
      .find(|g| g.version == version)
      .ok_or_else(|| EngineError::UnknownGeneration(version.to_string()))
  }

  fn promote(&mut self, version: &str) -> Result<Vec<Effect>, EngineError> {
    let generation = self.generation_mut(version)?;
    generation.phase = Phase::Activating;
    Ok(vec![Effect::Activate {
      version: generation.version.clone(),
      keep: generation.names.clone(),
    }])
  }
}

/// Apply one event to the lifecycle.
pub fn transition(
  state: &LifecycleState,
  event: LifecycleEvent,
) -> Result<(LifecycleState, Vec<Effect>), EngineError> {
  let mut next = state.clone();

  let effects = match event {
    LifecycleEvent::InstallStarted { version, names } => {
      match next.generation(&version).map(|g| g.phase) {
        // Already installing or installed
        Some(Phase::Installing | Phase::Waiting | Phase::Activating | Phase::Active) => Vec::new(),
        _ => {
          next.generations.retain(|g| g.version != version);
          next.generations.push(Generation {
            version: version.clone(),
            names,
            phase: Phase::Installing,
            failures: Vec::new(),
          });
          vec![
            Effect::Broadcast(ClientEvent::Installing {
              version: version.clone(),
            }),
            Effect::Precache { version },
          ]
        }
      }
    }

    LifecycleEvent::PrecacheFinished { version, failed } => {
      let generation = next.generation_mut(&version)?;
      if generation.phase != Phase::Installing {
        return Ok((next, Vec::new()));
      }

      if !failed.is_empty() {
        generation.phase = Phase::Failed;
        generation.failures = failed;
        return Ok((next, Vec::new()));
      }
      generation.phase = Phase::Waiting;

      match next.current().map(|g| g.version.clone()) {
        Some(current) if !next.skip_waiting => vec![Effect::Broadcast(ClientEvent::UpdateAvailable {
          current_version: current,
          new_version: version,
        })],
        _ => next.promote(&version)?,
      }
    }

    LifecycleEvent::SkipWaiting => match next.waiting().map(|g| g.version.clone()) {
      Some(version) => next.promote(&version)?,
      None => Vec::new(),
    },

    LifecycleEvent::ActivationFinished { version } => {
      if next.generation_mut(&version)?.phase != Phase::Activating {
        return Ok((next, Vec::new()));
      }

      // Superseded generations' stores were removed by this sweep
      next.generations.retain(|g| g.phase != Phase::Superseded);
      for generation in next.generations.iter_mut() {
        if generation.version == version {
          generation.phase = Phase::Active;
        } else if generation.phase == Phase::Active {
          generation.phase = Phase::Superseded;
        }
      }

      vec![
        Effect::WriteMetadata {
          version: version.clone(),
        },
        Effect::Broadcast(ClientEvent::Activated { version }),
      ]
    }

    LifecycleEvent::Restored { version, names } => {
      if next.current().is_none() {
        next.generations.retain(|g| g.version != version);
        next.generations.push(Generation {
          version,
          names,
          phase: Phase::Active,
          failures: Vec::new(),
        });
      }
      Vec::new()
    }
  };

  Ok((next, effects))
}
