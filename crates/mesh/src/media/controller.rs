//! Local media controller
//!
//! Owns every local capture track. Peer connections only borrow track
//! handles to send them; stopping tracks happens here and nowhere else.

use super::{MediaConstraints, MediaError, MediaKind, MediaSource, MediaStream, MediaTrack};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Camera/microphone/display state for one session
pub struct LocalMediaController {
    source: Arc<dyn MediaSource>,
    stream: Option<MediaStream>,
    display: Option<MediaStream>,
    video_enabled: bool,
    audio_enabled: bool,
    last_error: Option<MediaError>,
}

impl LocalMediaController {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            stream: None,
            display: None,
            video_enabled: true,
            audio_enabled: true,
            last_error: None,
        }
    }

    /// Acquire a camera/microphone stream
    ///
    /// Failures are classified into `last_error` and reported as `None`.
    /// A previously held stream is stopped and replaced.
    pub async fn acquire(&mut self, constraints: &MediaConstraints) -> Option<MediaStream> {
        match self.source.request_user_media(constraints).await {
            Ok(stream) => {
                if let Some(previous) = self.stream.take() {
                    previous.stop_all();
                }

                for track in stream.tracks_of(MediaKind::Video) {
                    track.set_enabled(self.video_enabled);
                }
                for track in stream.tracks_of(MediaKind::Audio) {
                    track.set_enabled(self.audio_enabled);
                }

                info!(
                    stream_id = %stream.id,
                    tracks = stream.tracks.len(),
                    "Acquired local media"
                );
                self.last_error = None;
                self.stream = Some(stream.clone());
                Some(stream)
            }
            Err(e) => {
                warn!("Failed to acquire local media: {}", e);
                self.last_error = Some(e);
                None
            }
        }
    }

    /// Mute or unmute every video track, the display track included
    ///
    /// No-op with neither a camera stream nor a display. Never re-acquires
    /// or renegotiates.
    pub fn set_video_enabled(&mut self, enabled: bool) {
        if self.stream.is_none() && self.display.is_none() {
            debug!("set_video_enabled ignored: no local video");
            return;
        }

        self.video_enabled = enabled;
        let display_tracks = self.display.iter().flat_map(|d| d.tracks_of(MediaKind::Video));
        for track in self
            .stream
            .iter()
            .flat_map(|s| s.tracks_of(MediaKind::Video))
            .chain(display_tracks)
        {
            track.set_enabled(enabled);
        }
    }

    /// Mute or unmute every audio track
    ///
    /// No-op without a stream.
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        let Some(stream) = &self.stream else {
            debug!("set_audio_enabled ignored: no local stream");
            return;
        };

        self.audio_enabled = enabled;
        for track in stream.tracks_of(MediaKind::Audio) {
            track.set_enabled(enabled);
        }
    }

    /// Request a display stream and make it the outgoing video source
    ///
    /// Returns the display track. Already sharing returns the current one.
    pub async fn start_screen_share(&mut self) -> Result<MediaTrack, MediaError> {
        if let Some(track) = self.display_track() {
            return Ok(track);
        }

        let display = self.source.request_display_media().await?;
        let Some(track) = display.video_track().cloned() else {
            display.stop_all();
            return Err(MediaError::Other("Display stream has no video track".to_string()));
        };

        track.set_enabled(self.video_enabled);
        info!(track_id = %track.id(), label = %track.label(), "Screen share started");
        self.display = Some(display);
        Ok(track)
    }

    /// Stop the display stream; returns false when not sharing
    pub fn stop_screen_share(&mut self) -> bool {
        match self.display.take() {
            Some(display) => {
                display.stop_all();
                info!("Screen share stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every owned track and forget the streams
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
        }
        if let Some(display) = self.display.take() {
            display.stop_all();
        }
        debug!("Local media released");
    }

    /// Track currently sent as outgoing video
    pub fn outgoing_video_track(&self) -> Option<MediaTrack> {
        self.display_track().or_else(|| self.camera_track())
    }

    /// Every track a new peer connection should send
    pub fn outgoing_tracks(&self) -> Vec<MediaTrack> {
        let mut tracks: Vec<MediaTrack> = self
            .stream
            .iter()
            .flat_map(|s| s.tracks_of(MediaKind::Audio))
            .cloned()
            .collect();
        tracks.extend(self.outgoing_video_track());
        tracks
    }

    pub fn camera_track(&self) -> Option<MediaTrack> {
        self.stream.as_ref().and_then(|s| s.video_track().cloned())
    }

    pub fn display_track(&self) -> Option<MediaTrack> {
        self.display.as_ref().and_then(|d| d.video_track().cloned())
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.display.is_some()
    }

    pub fn last_error(&self) -> Option<&MediaError> {
        self.last_error.as_ref()
    }
}

impl Drop for LocalMediaController {
    fn drop(&mut self) {
        self.release();
    }
}
