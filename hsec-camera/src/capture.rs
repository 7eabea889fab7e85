//! Frame sources: a directory of JPEGs replayed in a loop, or a synthetic test pattern.

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use hsec_core::FrameSource;
use tracing::{info, warn};

/// Minimum gap between captures for a given fps cap. Zero fps means no cap.
struct Throttle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    fn new(max_fps: u32) -> Self {
        let min_interval = if max_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / max_fps
        };
        Self {
            min_interval,
            last: None,
        }
    }

    fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

pub struct DirectoryFrames {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    throttle: Throttle,
}

impl DirectoryFrames {
    pub fn new(dir: PathBuf, max_fps: u32) -> Self {
        Self {
            dir,
            files: Vec::new(),
            next: 0,
            throttle: Throttle::new(max_fps),
        }
    }
}

fn is_jpeg(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

impl FrameSource for DirectoryFrames {
    fn init(&mut self) -> io::Result<()> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_jpeg(p))
            .collect();
        if files.is_empty() {
            return Err(io::Error::new(
                ErrorKind::NotFound,
                format!("no JPEG frames in {}", self.dir.display()),
            ));
        }
        files.sort();
        info!(dir = %self.dir.display(), frames = files.len(), "frame directory ready");
        self.files = files;
        Ok(())
    }

    fn capture(&mut self, frame: &mut Vec<u8>) -> bool {
        if self.files.is_empty() || !self.throttle.ready(Instant::now()) {
            return false;
        }
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        match std::fs::read(path) {
            Ok(bytes) => {
                *frame = bytes;
                true
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read frame");
                false
            }
        }
    }
}

/// Minimal JPEG-framed payload carrying a frame counter.
pub struct SyntheticFrames {
    counter: u32,
    throttle: Throttle,
}

impl SyntheticFrames {
    pub fn new(max_fps: u32) -> Self {
        Self {
            counter: 0,
            throttle: Throttle::new(max_fps),
        }
    }
}

impl FrameSource for SyntheticFrames {
    fn init(&mut self) -> io::Result<()> {
        info!("using synthetic frames");
        Ok(())
    }

    fn capture(&mut self, frame: &mut Vec<u8>) -> bool {
        if !self.throttle.ready(Instant::now()) {
            return false;
        }
        self.counter = self.counter.wrapping_add(1);
        frame.clear();
        frame.extend_from_slice(&[0xFF, 0xD8]);
        frame.extend_from_slice(&self.counter.to_be_bytes());
        frame.extend_from_slice(&[0xFF, 0xD9]);
        true
    }
}

pub fn from_config(cfg: &crate::config::Config) -> Box<dyn FrameSource> {
    match &cfg.frames_dir {
        Some(dir) => Box::new(DirectoryFrames::new(dir.clone(), cfg.max_fps)),
        None => Box::new(SyntheticFrames::new(cfg.max_fps)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_caps_rate() {
        let mut t = Throttle::new(10);
        let t0 = Instant::now();
        assert!(t.ready(t0));
        assert!(!t.ready(t0 + Duration::from_millis(50)));
        assert!(t.ready(t0 + Duration::from_millis(100)));
        let mut free = Throttle::new(0);
        assert!(free.ready(t0));
        assert!(free.ready(t0));
    }

    #[test]
    fn directory_replays_sorted_jpegs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.path().join("a.JPEG"), b"first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let mut src = DirectoryFrames::new(dir.path().to_path_buf(), 0);
        src.init().unwrap();
        let mut frame = Vec::new();
        let mut seen = Vec::new();
        for _ in 0..3 {
            assert!(src.capture(&mut frame));
            seen.push(frame.clone());
        }
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec(), b"first".to_vec()]);
    }

    #[test]
    fn empty_directory_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = DirectoryFrames::new(dir.path().to_path_buf(), 0);
        assert_eq!(src.init().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn synthetic_frames_count() {
        let mut src = SyntheticFrames::new(0);
        let mut frame = Vec::new();
        assert!(src.capture(&mut frame));
        assert_eq!(frame, vec![0xFF, 0xD8, 0, 0, 0, 1, 0xFF, 0xD9]);
    }
}
