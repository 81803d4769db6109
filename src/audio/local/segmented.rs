use flume::Sender;

use crate::audio::{error::PlayerError, local::element::LocalSignal, track::TrackSource};

use super::element::MediaElement;

/// A nested player that feeds a segmented stream into the media element.
/// One is created per source and destroyed before the next source loads.
pub trait SegmentedPlayer: Send {
    fn attach(&mut self, element: &mut dyn MediaElement) -> Result<(), PlayerError>;
    fn destroy(&mut self);
}

pub trait SegmentedPlayerFactory: Send + Sync {
    fn create(
        &self,
        source: &TrackSource,
        reporter: StreamReporter,
    ) -> Result<Box<dyn SegmentedPlayer>, PlayerError>;
}

/// Lets a sub-player report a fatal failure. Reports from a sub-player
/// whose source has since been replaced are discarded by the backend.
#[derive(Debug, Clone)]
pub struct StreamReporter {
    generation: u64,
    tx: Sender<LocalSignal>,
}

impl StreamReporter {
    pub(crate) fn new(generation: u64, tx: Sender<LocalSignal>) -> Self {
        Self { generation, tx }
    }

    pub fn fatal(&self, message: impl Into<String>) {
        let _ = self.tx.send(LocalSignal::StreamFatal {
            generation: self.generation,
            message: message.into(),
        });
    }
}
