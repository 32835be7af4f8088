//! Camera platform and its delivery sub-protocol.
//!
//! Cameras do not take part in the regular state subscription; a client asks
//! for images explicitly with `CameraImageRequest`. A single-shot request is
//! answered with the current frame marked `done`. A stream request is the
//! current frame followed by every new frame for a five-second window, the
//! same window ESPHome uses, kept for client compatibility.
//!
//! The `fake` platform renders a moving gradient and encodes it to JPEG.
//! With a `directory` configured, every frame is also spooled to disk as
//! `iNNNNNNNNNN.jpg`; numbering resumes above the highest index found so a
//! restart never overwrites history.

use super::{CameraStream, Entity, EntityCore, EntityKind, Identity, ProducerHandle, ReplySink, StateUpdate};
use crate::api::proto;
use crate::api::registry::Response;
use crate::cancel::CancelToken;
use crate::config;
use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FRAME_WIDTH: u32 = 320;
const FRAME_HEIGHT: u32 = 240;
const JPEG_QUALITY: u8 = 90;
const FRAME_INTERVAL: Duration = Duration::from_secs(1);

/// How long a stream request keeps forwarding frames. Inherited from
/// ESPHome's camera component.
const STREAM_WINDOW: Duration = Duration::from_secs(5);

/// Length of a spool file name: `i` + 10-digit index + `.jpg`.
const SPOOL_NAME_LEN: usize = 15;

pub struct FakeCamera {
    core: Arc<EntityCore>,
    producer: ProducerHandle,
}

impl FakeCamera {
    pub fn new(node_name: &str, token: &CancelToken, cfg: &config::Camera) -> Result<Self> {
        let identity = Identity::derive(node_name, &cfg.name, EntityKind::Camera)?;
        let core = Arc::new(EntityCore::new(identity));

        let spool = if cfg.directory.is_empty() {
            None
        } else {
            Some(Spool::open(Path::new(&cfg.directory))?)
        };

        // Produce the first frame right away so a request arriving before
        // the first tick still has an image to answer with.
        let mut producer_state = ProducerState { spool, seq: 0 };
        producer_state.produce(&core)?;

        let producer = {
            let core = Arc::clone(&core);
            ProducerHandle::spawn("camera-fake", token, move |token| {
                while !token.wait_timeout(FRAME_INTERVAL) {
                    if let Err(e) = producer_state.produce(&core) {
                        log::error!("camera frame failed: {}", e);
                    }
                }
            })?
        };
        Ok(FakeCamera { core, producer })
    }
}

struct ProducerState {
    spool: Option<Spool>,
    seq: u64,
}

impl ProducerState {
    fn produce(&mut self, core: &EntityCore) -> Result<()> {
        let jpeg = encode_frame(FRAME_WIDTH, FRAME_HEIGHT, self.seq)?;
        core.publish(StateUpdate::Camera(proto::CameraImageResponse {
            key: core.key(),
            data: jpeg.clone(),
            done: false,
        }));
        self.seq += 1;
        if let Some(spool) = &mut self.spool {
            spool.store(&jpeg)?;
        }
        Ok(())
    }
}

impl Entity for FakeCamera {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn describe(&self) -> Response {
        let id = self.core.identity();
        Response::ListEntitiesCamera(proto::ListEntitiesCameraResponse {
            object_id: id.object_id.clone(),
            key: id.key,
            name: id.name.clone(),
            unique_id: id.unique_id.clone(),
        })
    }

    fn close(&self) -> Result<()> {
        self.producer.stop();
        Ok(())
    }

    fn as_camera(&self) -> Option<&dyn CameraStream> {
        Some(self)
    }
}

impl CameraStream for FakeCamera {
    fn camera_stream(&self, token: &CancelToken, sink: &dyn ReplySink, req: &proto::CameraImageRequest) {
        log::debug!("camera request: single={} stream={}", req.single, req.stream);
        let Some(StateUpdate::Camera(mut image)) = self.core.snapshot() else {
            log::error!("camera has produced no image yet");
            return;
        };
        image.done = !req.stream;
        if sink.reply(Response::CameraImage(image)).is_err() {
            return;
        }
        if !req.stream {
            return;
        }

        let (id, rx, _) = self.core.register();
        let deadline = Instant::now() + STREAM_WINDOW;
        while let Some(update) = token.recv_deadline_or_cancelled(&rx, deadline) {
            if sink.reply(update.into()).is_err() {
                break;
            }
        }
        self.core.unregister(id);
    }
}

/// On-disk frame archive with restart-safe numbering.
struct Spool {
    dir: PathBuf,
    index: u64,
}

impl Spool {
    fn open(dir: &Path) -> Result<Spool> {
        match fs::metadata(dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(Error::Config(format!(
                    "exists but is not a directory: {}",
                    dir.display()
                )));
            }
            Ok(_) => {}
            Err(_) => fs::create_dir_all(dir)?,
        }
        let index = next_index(dir)?;
        if index != 0 {
            log::info!("camera spool resuming at index {}", index);
        }
        Ok(Spool {
            dir: dir.to_path_buf(),
            index,
        })
    }

    fn store(&mut self, jpeg: &[u8]) -> Result<()> {
        let name = format!("i{:010}.jpg", self.index);
        fs::write(self.dir.join(name), jpeg)?;
        self.index += 1;
        Ok(())
    }
}

/// One past the highest `iNNNNNNNNNN.jpg` index present in `dir`.
fn next_index(dir: &Path) -> Result<u64> {
    let mut next = 0u64;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.len() != SPOOL_NAME_LEN || !name.starts_with('i') || !name.ends_with(".jpg") {
            continue;
        }
        if let Ok(v) = name[1..11].parse::<u64>() {
            next = next.max(v + 1);
        }
    }
    Ok(next)
}

/// Render and JPEG-encode one frame: a gradient whose phase moves with the
/// sequence number, so consecutive frames are visibly different.
fn encode_frame(width: u32, height: u32, seq: u64) -> Result<Vec<u8>> {
    let img = render_frame(width, height, seq);
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&img)
        .map_err(|e| Error::Other(format!("jpeg encode failed: {}", e)))?;
    Ok(jpeg)
}

fn render_frame(width: u32, height: u32, seq: u64) -> RgbImage {
    let phase = (seq % 32) as f32 / 32.0;
    RgbImage::from_fn(width, height, |x, _y| {
        let t = (x as f32 / width as f32 + phase).fract();
        Rgb([lerp(0.0, 72.0, t), 0, lerp(128.0, 0.0, t)])
    })
}

fn lerp(a: f32, b: f32, t: f32) -> u8 {
    (a + (b - a) * t).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel;
    use crate::entity::RecordingSink;
    use std::sync::Mutex;
    use std::thread;

    fn cfg(directory: &str) -> config::Camera {
        config::Camera {
            platform: "fake".into(),
            name: "fake camera".into(),
            directory: directory.into(),
            rotation: 0,
        }
    }

    #[test]
    fn test_frames_are_jpeg() {
        let jpeg = encode_frame(32, 24, 0).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        // Consecutive frames differ.
        assert_ne!(jpeg, encode_frame(32, 24, 1).unwrap());
    }

    #[test]
    fn test_initial_frame_available() {
        let (_canceller, token) = cancel::root();
        let camera = FakeCamera::new("pi", &token, &cfg("")).unwrap();
        match camera.core().snapshot() {
            Some(StateUpdate::Camera(m)) => {
                assert_eq!(m.key, 1841563375);
                assert!(!m.data.is_empty());
                assert!(!m.done);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
        camera.close().unwrap();
    }

    #[test]
    fn test_single_shot_sets_done() {
        let (_canceller, token) = cancel::root();
        let camera = FakeCamera::new("pi", &token, &cfg("")).unwrap();
        let sink = RecordingSink::new();
        camera.camera_stream(
            &token,
            &sink,
            &proto::CameraImageRequest {
                single: true,
                stream: false,
            },
        );
        let replies = sink.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            Response::CameraImage(m) => {
                assert!(m.done);
                assert_eq!(m.key, 1841563375);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        drop(replies);
        camera.close().unwrap();
    }

    #[test]
    fn test_stream_forwards_new_frames() {
        let (canceller, token) = cancel::root();
        let camera = Arc::new(FakeCamera::new("pi", &token, &cfg("")).unwrap());
        let sink = Arc::new(RecordingSink::new());

        let streamer = {
            let camera = Arc::clone(&camera);
            let sink = Arc::clone(&sink);
            let token = token.clone();
            thread::spawn(move || {
                camera.camera_stream(
                    &token,
                    sink.as_ref(),
                    &proto::CameraImageRequest {
                        single: false,
                        stream: true,
                    },
                )
            })
        };

        // Wait for the initial frame, then push one through the producer
        // path and make sure it is forwarded.
        for _ in 0..100 {
            if !sink.replies.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        camera.core().publish(StateUpdate::Camera(proto::CameraImageResponse {
            key: camera.core().key(),
            data: vec![0xff, 0xd8, 0x01],
            done: false,
        }));
        for _ in 0..100 {
            if sink.replies.lock().unwrap().len() >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        canceller.cancel();
        streamer.join().unwrap();

        let replies = sink.replies.lock().unwrap();
        assert!(replies.len() >= 2, "expected streamed frames, got {}", replies.len());
        match &replies[0] {
            Response::CameraImage(m) => assert!(!m.done),
            other => panic!("unexpected reply {:?}", other),
        }
        drop(replies);
        camera.close().unwrap();
    }

    #[test]
    fn test_failed_initial_reply_aborts_stream() {
        let (_canceller, token) = cancel::root();
        let camera = FakeCamera::new("pi", &token, &cfg("")).unwrap();
        let sink = RecordingSink {
            replies: Mutex::new(Vec::new()),
            fail_after: Some(0),
        };
        // Initial reply fails; the call must return without streaming.
        camera.camera_stream(
            &token,
            &sink,
            &proto::CameraImageRequest {
                single: false,
                stream: true,
            },
        );
        assert!(sink.replies.lock().unwrap().is_empty());
        camera.close().unwrap();
    }

    #[test]
    fn test_spool_writes_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        // Seed existing frames, including a malformed name to skip.
        fs::write(dir.path().join("i0000000041.jpg"), b"x").unwrap();
        fs::write(dir.path().join("i0000000007.jpg"), b"x").unwrap();
        fs::write(dir.path().join("not-a-frame.jpg"), b"x").unwrap();
        assert_eq!(next_index(dir.path()).unwrap(), 42);

        let mut spool = Spool::open(dir.path()).unwrap();
        spool.store(b"\xff\xd8frame").unwrap();
        assert!(dir.path().join("i0000000042.jpg").exists());
        assert_eq!(spool.index, 43);
    }

    #[test]
    fn test_spool_rejects_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        assert!(Spool::open(&file).is_err());
    }

    #[test]
    fn test_camera_with_spool_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (_canceller, token) = cancel::root();
        let camera =
            FakeCamera::new("pi", &token, &cfg(dir.path().to_str().unwrap())).unwrap();
        // The construction-time frame is already on disk.
        assert!(dir.path().join("i0000000000.jpg").exists());
        camera.close().unwrap();
    }
}
