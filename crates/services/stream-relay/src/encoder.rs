//! Encoder invocation
//!
//! Builds the command line for the external encoder. Argument construction is
//! deterministic: the same profile, destination and track layout always yield
//! the same argv.

use std::ffi::OsString;

use crate::config::EncoderConfig;
use crate::destination::Destination;

/// Tracks present in the incoming media, as announced by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackLayout {
    pub has_audio: bool,
    pub has_video: bool,
}

impl Default for TrackLayout {
    fn default() -> Self {
        Self {
            has_audio: true,
            has_video: true,
        }
    }
}

/// A fully resolved program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Produces the process that consumes a session's media
pub trait CommandFactory: Send + Sync {
    fn build(&self, destination: &Destination, tracks: TrackLayout) -> CommandSpec;
}

/// Fixed encoding settings applied to every stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingProfile {
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub gop: u32,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self::from(&EncoderConfig::default())
    }
}

impl From<&EncoderConfig> for EncodingProfile {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            video_bitrate_kbps: config.video_bitrate_kbps,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            gop: config.gop,
        }
    }
}

impl EncodingProfile {
    /// Low-latency demux flags; input always arrives on stdin
    fn input_args(&self) -> Vec<String> {
        strings(&[
            "-hide_banner",
            "-fflags",
            "+genpts+nobuffer+flush_packets",
            "-thread_queue_size",
            "1024",
            "-analyzeduration",
            "100000",
            "-probesize",
            "100000",
            "-i",
            "pipe:0",
        ])
    }

    fn video_args(&self) -> Vec<String> {
        let bitrate = format!("{}k", self.video_bitrate_kbps);
        let filter = format!(
            "scale={w}:-2,crop={w}:{h}:0:(ih-{h})/2,format=yuv420p",
            w = self.width,
            h = self.height
        );
        let gop = self.gop.to_string();

        let mut args = strings(&[
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-profile:v",
            "high",
            "-level",
            "4.1",
        ]);
        args.extend([
            "-vf".to_string(),
            filter,
            "-b:v".to_string(),
            bitrate.clone(),
            "-maxrate".to_string(),
            bitrate,
            "-bufsize".to_string(),
            format!("{}k", self.video_bitrate_kbps.saturating_mul(2)),
            "-g".to_string(),
            gop.clone(),
            "-keyint_min".to_string(),
            gop,
        ]);
        args.extend(strings(&[
            "-sc_threshold",
            "0",
            "-force_key_frames",
            "expr:gte(t,n_forced*0.5)",
        ]));
        args
    }

    fn audio_args(&self) -> Vec<String> {
        vec![
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", self.audio_bitrate_kbps),
            "-ar".to_string(),
            "48000".to_string(),
            "-ac".to_string(),
            "2".to_string(),
        ]
    }

    /// Low-latency mux flags followed by the output URL
    fn output_args(&self, destination: &Destination) -> Vec<String> {
        let mut args = vec!["-f".to_string(), destination.muxer().to_string()];
        args.extend(strings(&[
            "-flush_packets",
            "1",
            "-max_delay",
            "0",
            "-muxdelay",
            "0",
            "-muxpreload",
            "0",
        ]));
        args.push(destination.url().to_string());
        args
    }

    /// Complete encoder argument list for one destination
    pub fn build_args(&self, destination: &Destination, tracks: TrackLayout) -> Vec<String> {
        let mut args = self.input_args();

        if tracks.has_video {
            args.extend(self.video_args());
        } else {
            args.push("-vn".to_string());
        }

        if tracks.has_audio {
            args.extend(self.audio_args());
        } else {
            args.push("-an".to_string());
        }

        args.extend(self.output_args(destination));
        args
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Production command factory running FFmpeg
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    program: String,
    profile: EncodingProfile,
}

impl FfmpegCommand {
    pub fn new(program: impl Into<String>, profile: EncodingProfile) -> Self {
        Self {
            program: program.into(),
            profile,
        }
    }

    pub fn from_config(config: &EncoderConfig) -> Self {
        Self::new(config.program.clone(), EncodingProfile::from(config))
    }

    pub fn profile(&self) -> &EncodingProfile {
        &self.profile
    }
}

impl CommandFactory for FfmpegCommand {
    fn build(&self, destination: &Destination, tracks: TrackLayout) -> CommandSpec {
        CommandSpec::new(&self.program).args(self.profile.build_args(destination, tracks))
    }
}
