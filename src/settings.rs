use std::path::PathBuf;

use serde::Deserialize;

use crate::error::StreamError;
use crate::session::Container;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub streaming: StreamingSettings,
}

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Streaming section of the configuration.
///
/// Each profile list is indexed by the `mode` query parameter of the
/// streaming API; a profile carries the encoder command template with
/// `%FFMPEG%`, `%OUTPUT%`, `%INPUT%` and (for RTMP) `%RTMP_URL%` tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingSettings {
    /// Upper bound on concurrent stream slots. 0 disables streaming.
    #[serde(default)]
    pub max_streams: usize,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Directory where segmented sessions write `stream{N}.m3u8` and their
    /// numbered segment files.
    #[serde(default = "default_stream_dir")]
    pub stream_dir: PathBuf,

    /// Base URL of the broadcast tuner HTTP API.
    #[serde(default)]
    pub tuner_url: String,

    /// Directory holding recorded transport-stream files.
    #[serde(default)]
    pub recorded_dir: PathBuf,

    /// Tuner priority passed along with every live source request.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub live_hls: Vec<StreamProfile>,
    #[serde(default)]
    pub live_mpegts: Vec<StreamProfile>,
    #[serde(default)]
    pub live_webm: Vec<StreamProfile>,
    #[serde(default)]
    pub live_mp4: Vec<StreamProfile>,
    #[serde(default)]
    pub live_rtmp: Vec<RtmpProfile>,
    #[serde(default)]
    pub recorded_hls: Vec<StreamProfile>,
    #[serde(default)]
    pub recorded_mpegts: Vec<StreamProfile>,
    #[serde(default)]
    pub recorded_webm: Vec<StreamProfile>,
    #[serde(default)]
    pub recorded_mp4: Vec<StreamProfile>,
}

fn default_ffmpeg_path() -> String {
    "/usr/bin/ffmpeg".to_string()
}

fn default_stream_dir() -> PathBuf {
    PathBuf::from("/tmp/tvgate-stream")
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamProfile {
    pub cmd: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RtmpProfile {
    pub cmd: String,
    /// Ingest destination; `%STREAM_KEY%` is replaced with the generated
    /// session key before substitution into the command template.
    pub url: String,
}

impl StreamingSettings {
    /// Looks up a profile by mode index, failing with a configuration error
    /// naming the offending table.
    pub fn pick<'a, T>(
        table: &'static str,
        profiles: &'a [T],
        mode: usize,
    ) -> Result<&'a T, StreamError> {
        profiles.get(mode).ok_or(StreamError::Config { table, mode })
    }

    pub fn live_transcode(&self, container: Container) -> &[StreamProfile] {
        match container {
            Container::WebM => &self.live_webm,
            Container::Mp4 => &self.live_mp4,
            Container::MpegTs => &self.live_mpegts,
        }
    }

    pub fn recorded_stream(&self, container: Container) -> &[StreamProfile] {
        match container {
            Container::WebM => &self.recorded_webm,
            Container::Mp4 => &self.recorded_mp4,
            Container::MpegTs => &self.recorded_mpegts,
        }
    }
}

/// Settings with every profile table pointing at `cat`, for exercising the
/// lifecycle without a real ffmpeg.
#[cfg(test)]
pub fn stub_settings(max_streams: usize, dir: &std::path::Path) -> StreamingSettings {
    let profile = || {
        vec![
            StreamProfile { cmd: "cat".into() },
            StreamProfile { cmd: "cat".into() },
        ]
    };
    StreamingSettings {
        max_streams,
        ffmpeg_path: "cat".into(),
        stream_dir: dir.to_path_buf(),
        tuner_url: String::new(),
        recorded_dir: dir.to_path_buf(),
        priority: 0,
        live_hls: profile(),
        live_mpegts: profile(),
        live_webm: profile(),
        live_mp4: profile(),
        live_rtmp: vec![RtmpProfile {
            cmd: "cat".into(),
            url: "rtmp://127.0.0.1/live/%STREAM_KEY%".into(),
        }],
        recorded_hls: profile(),
        recorded_mpegts: profile(),
        recorded_webm: profile(),
        recorded_mp4: profile(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> StreamingSettings {
        StreamingSettings {
            max_streams: 2,
            ffmpeg_path: "/usr/bin/ffmpeg".into(),
            stream_dir: PathBuf::from("/tmp"),
            tuner_url: String::new(),
            recorded_dir: PathBuf::from("/tmp"),
            priority: 0,
            live_hls: vec![StreamProfile { cmd: "cat".into() }],
            live_mpegts: Vec::new(),
            live_webm: Vec::new(),
            live_mp4: Vec::new(),
            live_rtmp: Vec::new(),
            recorded_hls: Vec::new(),
            recorded_mpegts: Vec::new(),
            recorded_webm: Vec::new(),
            recorded_mp4: Vec::new(),
        }
    }

    #[test]
    fn pick_rejects_out_of_range_mode() {
        let settings = minimal();
        assert!(StreamingSettings::pick("live_hls", &settings.live_hls, 0).is_ok());
        let err = StreamingSettings::pick("live_hls", &settings.live_hls, 1).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Config { table: "live_hls", mode: 1 }
        ));
    }
}
