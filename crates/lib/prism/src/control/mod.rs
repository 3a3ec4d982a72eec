//! The asynchronous request source. The control channel (HTTP or
//! otherwise) lives outside this layer; requests arrive here as decoded
//! values and are drained once per present boundary.

use crate::capture::CaptureRequest;
use crossbeam_channel::Receiver;
use serde::Deserialize;

/// A command posted by the external controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum ControlRequest {
    /// Enable or disable call tracing and GPU-time collection.
    SetTracing { enabled: bool },
    /// Request a frame capture on the queue identified by its native
    /// handle value. Honored at most once per present interval.
    Capture {
        queue: u64,
        #[serde(flatten)]
        request: CaptureRequest,
    },
}

/// Source of pending control requests. Polled at present time; never
/// blocks.
pub trait RequestSource: Send + Sync {
    fn drain(&self) -> Vec<ControlRequest>;
}

/// Channel-fed request source.
pub struct ChannelSource {
    requests: Receiver<ControlRequest>,
}

impl ChannelSource {
    pub fn new(requests: Receiver<ControlRequest>) -> Self {
        Self { requests }
    }
}

impl RequestSource for ChannelSource {
    fn drain(&self) -> Vec<ControlRequest> {
        self.requests.try_iter().collect()
    }
}

/// Source that never produces requests; tracing stays in whatever state
/// the embedding configured.
pub struct NullSource;

impl RequestSource for NullSource {
    fn drain(&self) -> Vec<ControlRequest> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn drain_takes_everything_without_blocking() {
        let (tx, rx) = unbounded();
        let source = ChannelSource::new(rx);

        assert!(source.drain().is_empty());

        tx.send(ControlRequest::SetTracing { enabled: true }).unwrap();
        tx.send(ControlRequest::SetTracing { enabled: false })
            .unwrap();

        assert_eq!(source.drain().len(), 2);
        assert!(source.drain().is_empty());
    }

    #[test]
    fn capture_request_decodes_from_json() {
        let json = r#"{
            "command": "capture",
            "queue": 42,
            "source_image": 7,
            "source_width": 1920,
            "source_height": 1080,
            "dest_width": 480,
            "dest_height": 270,
            "flip_x": false,
            "flip_y": true
        }"#;

        let request: ControlRequest = serde_json::from_str(json).unwrap();
        match request {
            ControlRequest::Capture { queue, request } => {
                assert_eq!(queue, 42);
                assert_eq!(request.dest_width, 480);
                assert!(request.flip_y);
            }
            other => panic!("decoded {other:?}"),
        }
    }
}
