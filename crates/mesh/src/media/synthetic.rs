//! Capture source that fabricates tracks without touching hardware

use super::{MediaConstraints, MediaError, MediaKind, MediaSource, MediaStream};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// [`MediaSource`] producing empty tracks on demand
///
/// Failures can be scripted per request type. Request counters let callers
/// assert that capture was (or was not) re-acquired.
#[derive(Default)]
pub struct SyntheticMediaSource {
    user_media_error: Mutex<Option<MediaError>>,
    display_media_error: Mutex<Option<MediaError>>,
    user_media_requests: AtomicUsize,
    display_media_requests: AtomicUsize,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every user-media request with `error`
    pub fn deny_user_media(self, error: MediaError) -> Self {
        self.set_user_media_error(Some(error));
        self
    }

    /// Fail every display-media request with `error`
    pub fn deny_display_media(self, error: MediaError) -> Self {
        self.set_display_media_error(Some(error));
        self
    }

    pub fn set_user_media_error(&self, error: Option<MediaError>) {
        *self.user_media_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub fn set_display_media_error(&self, error: Option<MediaError>) {
        *self.display_media_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    pub fn display_media_requests(&self) -> usize {
        self.display_media_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn request_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.user_media_error.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(error);
        }

        if !constraints.audio && !constraints.video {
            return Err(MediaError::Other("No media kinds requested".to_string()));
        }

        let mut stream = MediaStream::new();
        if constraints.audio {
            stream = stream.with_track(MediaKind::Audio, "synthetic-microphone");
        }
        if constraints.video {
            stream = stream.with_track(MediaKind::Video, "synthetic-camera");
        }

        debug!(stream_id = %stream.id, tracks = stream.tracks.len(), "Synthetic user media created");
        Ok(stream)
    }

    async fn request_display_media(&self) -> Result<MediaStream, MediaError> {
        self.display_media_requests.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.display_media_error.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(error);
        }

        Ok(MediaStream::new().with_track(MediaKind::Video, "synthetic-screen"))
    }
}
