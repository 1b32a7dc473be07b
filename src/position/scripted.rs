// src/position/scripted.rs
//! Position source that replays a fixed script of samples and errors

use super::{
    data::Position,
    source::{PositionEvent, PositionOptions, PositionSource, Watch},
};
use crate::error::{PositionErrorKind, Result};
use async_trait::async_trait;
use std::{path::Path, time::Duration};
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct ScriptedSource {
    initial: Option<Position>,
    events: Vec<PositionEvent>,
    interval: Duration,
}

impl ScriptedSource {
    pub fn new(events: Vec<PositionEvent>) -> Self {
        Self {
            initial: None,
            events,
            interval: Duration::from_secs(1),
        }
    }

    pub fn from_positions(positions: Vec<Position>) -> Self {
        Self::new(positions.into_iter().map(PositionEvent::Sample).collect())
    }

    /// Load a JSON array of positions. The first one becomes the initial fix.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut positions: Vec<Position> = serde_json::from_str(&contents)?;
        if positions.is_empty() {
            return Ok(Self::new(Vec::new()));
        }
        let initial = positions.remove(0);
        Ok(Self::from_positions(positions).with_initial(initial))
    }

    /// Fix returned by `get_once` instead of the first scripted sample
    pub fn with_initial(mut self, position: Position) -> Self {
        self.initial = Some(position);
        self
    }

    /// Delay before each scripted event
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl PositionSource for ScriptedSource {
    async fn get_once(
        &self,
        _options: &PositionOptions,
    ) -> std::result::Result<Position, PositionErrorKind> {
        if let Some(initial) = self.initial {
            return Ok(initial);
        }
        self.events
            .iter()
            .find_map(|event| match event {
                PositionEvent::Sample(p) => Some(*p),
                PositionEvent::Error(_) => None,
            })
            .ok_or(PositionErrorKind::PositionUnavailable)
    }

    fn watch(&self, _options: &PositionOptions) -> Watch {
        let (sender, watch) = Watch::channel(self.events.len().max(1));
        let events = self.events.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            let handle = sender.handle().clone();
            for event in events {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = handle.stopped() => return,
                }
                if !sender.send(event).await {
                    return;
                }
            }
        });

        watch
    }
}
