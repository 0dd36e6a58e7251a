use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use beach_reel::protocol::StreamId;
use beach_reel::{Plane, Resolution, ResourceConsumer};

/// Logs resource activity and counts pictures.
#[derive(Debug, Default)]
pub struct LogConsumer {
    pictures: HashMap<StreamId, u64>,
}

impl ResourceConsumer for LogConsumer {
    fn resize(&mut self, stream: StreamId, plane: Plane, extent: Resolution) {
        tracing::info!(stream, plane = plane.label(), %extent, "resize picture resource");
    }

    fn upload(&mut self, stream: StreamId, plane: Plane, bytes: &[u8]) {
        if plane == Plane::Chroma {
            let count = self.pictures.entry(stream).or_default();
            *count += 1;
            tracing::debug!(stream, picture = *count, "picture uploaded");
        }
        tracing::trace!(stream, plane = plane.label(), len = bytes.len(), "plane uploaded");
    }
}

/// Writes each picture as `stream-<id>-<seq>.nv12`: the luma plane followed
/// by the interleaved chroma plane.
#[derive(Debug)]
pub struct DumpConsumer {
    dir: PathBuf,
    luma: HashMap<StreamId, Vec<u8>>,
    seq: HashMap<StreamId, u64>,
    written: u64,
}

impl DumpConsumer {
    pub fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            luma: HashMap::new(),
            seq: HashMap::new(),
            written: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn write_picture(&mut self, stream: StreamId, chroma: &[u8]) -> io::Result<PathBuf> {
        let luma = self.luma.remove(&stream).unwrap_or_default();
        let seq = self.seq.entry(stream).or_default();
        let path = self.dir.join(format!("stream-{stream}-{seq:06}.nv12"));
        *seq += 1;
        let mut picture = luma;
        picture.extend_from_slice(chroma);
        fs::write(&path, &picture)?;
        Ok(path)
    }
}

impl ResourceConsumer for DumpConsumer {
    fn resize(&mut self, stream: StreamId, plane: Plane, extent: Resolution) {
        tracing::debug!(stream, plane = plane.label(), %extent, "dump resource resized");
    }

    fn upload(&mut self, stream: StreamId, plane: Plane, bytes: &[u8]) {
        match plane {
            Plane::Luma => {
                self.luma.insert(stream, bytes.to_vec());
            }
            Plane::Chroma => match self.write_picture(stream, bytes) {
                Ok(path) => {
                    self.written += 1;
                    tracing::debug!(stream, path = %path.display(), "picture dumped");
                }
                Err(err) => {
                    tracing::warn!(stream, error = %err, "failed to dump picture");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn dump_writes_luma_then_chroma() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("beach-reel-dump-{}-{nanos}", std::process::id()));
        let mut consumer = DumpConsumer::create(&dir).expect("create dir");

        consumer.upload(2, Plane::Luma, &[1, 1, 1, 1]);
        consumer.upload(2, Plane::Chroma, &[2, 2]);
        consumer.upload(2, Plane::Luma, &[3, 3, 3, 3]);
        consumer.upload(2, Plane::Chroma, &[4, 4]);

        assert_eq!(consumer.written(), 2);
        let first = fs::read(dir.join("stream-2-000000.nv12")).expect("first picture");
        let second = fs::read(dir.join("stream-2-000001.nv12")).expect("second picture");
        assert_eq!(first, vec![1, 1, 1, 1, 2, 2]);
        assert_eq!(second, vec![3, 3, 3, 3, 4, 4]);
        fs::remove_dir_all(&dir).ok();
    }
}
