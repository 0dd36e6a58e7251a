//! Owning-thread side of decoded pictures.
//!
//! A [`ResourceConsumer`] stands in for whatever holds the per-stream picture
//! resources (textures in a renderer, files on disk). [`PictureTable`] tracks
//! the extent each resource was last sized to so the consumer only sees a
//! `resize` when a stream's resolution actually changes.

use std::collections::HashMap;

use crate::metrics;
use crate::protocol::StreamId;
use crate::session::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Plane {
    /// One byte per pixel, full resolution.
    Luma,
    /// Interleaved UV, two bytes per texel at half resolution.
    Chroma,
}

impl Plane {
    pub const ALL: [Plane; 2] = [Plane::Luma, Plane::Chroma];

    pub fn extent(self, resolution: Resolution) -> Resolution {
        match self {
            Plane::Luma => resolution,
            Plane::Chroma => resolution.chroma(),
        }
    }

    pub fn byte_len(self, resolution: Resolution) -> usize {
        match self {
            Plane::Luma => resolution.luma_len(),
            Plane::Chroma => resolution.chroma_len(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Plane::Luma => "luma",
            Plane::Chroma => "chroma",
        }
    }
}

/// Receives picture resources on the owning thread. Never called from any
/// other thread.
pub trait ResourceConsumer {
    fn resize(&mut self, stream: StreamId, plane: Plane, extent: Resolution);

    fn upload(&mut self, stream: StreamId, plane: Plane, bytes: &[u8]);
}

#[derive(Debug, Default)]
pub struct PictureTable {
    extents: HashMap<(StreamId, Plane), Resolution>,
}

impl PictureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes both plane resources of `stream` for `resolution`. Returns true
    /// if anything was resized.
    pub fn ensure(
        &mut self,
        consumer: &mut dyn ResourceConsumer,
        stream: StreamId,
        resolution: Resolution,
    ) -> bool {
        let mut resized = false;
        for plane in Plane::ALL {
            let extent = plane.extent(resolution);
            if self.extents.get(&(stream, plane)) != Some(&extent) {
                consumer.resize(stream, plane, extent);
                self.extents.insert((stream, plane), extent);
                resized = true;
            }
        }
        if resized {
            tracing::debug!(
                target: "beach_reel::resources",
                stream,
                %resolution,
                "picture resources sized"
            );
        }
        resized
    }

    /// Uploads one decoded picture, resizing first when needed.
    pub fn upload(
        &mut self,
        consumer: &mut dyn ResourceConsumer,
        stream: StreamId,
        resolution: Resolution,
        luma: &[u8],
        chroma: &[u8],
    ) {
        self.ensure(consumer, stream, resolution);
        consumer.upload(stream, Plane::Luma, luma);
        consumer.upload(stream, Plane::Chroma, chroma);
        metrics::PLANE_UPLOADS
            .with_label_values(&[Plane::Luma.label()])
            .inc();
        metrics::PLANE_UPLOADS
            .with_label_values(&[Plane::Chroma.label()])
            .inc();
    }

    pub fn extent(&self, stream: StreamId, plane: Plane) -> Option<Resolution> {
        self.extents.get(&(stream, plane)).copied()
    }

    pub fn clear(&mut self) {
        self.extents.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerCall {
    Resize {
        stream: StreamId,
        plane: Plane,
        extent: Resolution,
    },
    Upload {
        stream: StreamId,
        plane: Plane,
        bytes: Vec<u8>,
    },
}

/// Consumer that records every call, for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingConsumer {
    pub calls: Vec<ConsumerCall>,
}

impl RecordingConsumer {
    pub fn uploads(&self) -> impl Iterator<Item = (StreamId, Plane, &[u8])> {
        self.calls.iter().filter_map(|call| match call {
            ConsumerCall::Upload {
                stream,
                plane,
                bytes,
            } => Some((*stream, *plane, bytes.as_slice())),
            ConsumerCall::Resize { .. } => None,
        })
    }
}

impl ResourceConsumer for RecordingConsumer {
    fn resize(&mut self, stream: StreamId, plane: Plane, extent: Resolution) {
        self.calls.push(ConsumerCall::Resize {
            stream,
            plane,
            extent,
        });
    }

    fn upload(&mut self, stream: StreamId, plane: Plane, bytes: &[u8]) {
        self.calls.push(ConsumerCall::Upload {
            stream,
            plane,
            bytes: bytes.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resizes_only_on_change() {
        let mut table = PictureTable::new();
        let mut consumer = RecordingConsumer::default();
        let vga = Resolution::new(640, 480);

        assert!(table.ensure(&mut consumer, 1, vga));
        assert!(!table.ensure(&mut consumer, 1, vga));
        assert_eq!(
            consumer.calls,
            vec![
                ConsumerCall::Resize {
                    stream: 1,
                    plane: Plane::Luma,
                    extent: vga,
                },
                ConsumerCall::Resize {
                    stream: 1,
                    plane: Plane::Chroma,
                    extent: Resolution::new(320, 240),
                },
            ]
        );
        assert_eq!(table.extent(1, Plane::Chroma), Some(Resolution::new(320, 240)));
        assert_eq!(table.extent(2, Plane::Luma), None);
    }

    #[test]
    fn upload_at_new_size_resizes_first() {
        let mut table = PictureTable::new();
        let mut consumer = RecordingConsumer::default();
        let small = Resolution::new(4, 2);
        let big = Resolution::new(8, 4);

        table.upload(&mut consumer, 0, small, &[0; 8], &[0; 4]);
        consumer.calls.clear();
        table.upload(&mut consumer, 0, big, &[1; 32], &[2; 16]);

        let kinds: Vec<&str> = consumer
            .calls
            .iter()
            .map(|call| match call {
                ConsumerCall::Resize { .. } => "resize",
                ConsumerCall::Upload { .. } => "upload",
            })
            .collect();
        assert_eq!(kinds, vec!["resize", "resize", "upload", "upload"]);
        let sizes: Vec<(Plane, usize)> = consumer
            .uploads()
            .map(|(_, plane, bytes)| (plane, bytes.len()))
            .collect();
        assert_eq!(
            sizes,
            vec![
                (Plane::Luma, Plane::Luma.byte_len(big)),
                (Plane::Chroma, Plane::Chroma.byte_len(big)),
            ]
        );
    }
}
