use rollcall_core::DetectionBatch;
use rollcall_hw::{Frame, FrameSink};
use tokio::sync::mpsc;

use crate::scheduler::FrameQueue;

/// Everything the capture and detection threads report to the consumer.
#[derive(Debug)]
pub enum PipelineEvent {
    CameraStatus(String),
    CameraError(String),
    Detection(DetectionBatch),
    DetectionError(String),
}

pub type EventSender = mpsc::UnboundedSender<PipelineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

/// Routes captured frames into the scheduler and camera messages to the consumer.
pub struct ChannelSink {
    queue: FrameQueue,
    events: EventSender,
}

impl ChannelSink {
    pub fn new(queue: FrameQueue, events: EventSender) -> Self {
        Self { queue, events }
    }

    fn send(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("event consumer gone, dropping camera event");
        }
    }
}

impl FrameSink for ChannelSink {
    fn frame(&mut self, frame: Frame) {
        self.queue.queue_frame(frame);
    }

    fn status(&mut self, message: String) {
        tracing::info!(%message, "camera status");
        self.send(PipelineEvent::CameraStatus(message));
    }

    fn error(&mut self, message: String) {
        tracing::warn!(%message, "camera error");
        self.send(PipelineEvent::CameraError(message));
    }
}
