//! Transcoder command line construction.

use relaycast_ipc::{Layout, MediaKind};

use crate::{InputSpec, SpawnRequest, TranscodeConfig, VideoStrategy};

/// Bumped whenever the generated command line changes shape. Logged with
/// every spawn so output from different argument sets can be told apart.
pub const ARGS_VERSION: u32 = 1;

/// Layout for the video inputs of a request. Audio inputs are mixed and
/// never take a cell.
pub fn select_layout(inputs: &[InputSpec]) -> Layout {
    Layout::for_count(count_kind(inputs, MediaKind::Video))
}

fn count_kind(inputs: &[InputSpec], kind: MediaKind) -> usize {
    inputs.iter().filter(|input| input.kind == kind).count()
}

/// Build the full argument list for one transcoder generation.
pub fn build_args(config: &TranscodeConfig, request: &SpawnRequest) -> Vec<String> {
    let mut args = Args::default();
    args.push_all(["-hide_banner", "-nostats", "-loglevel", "info", "-y"]);

    for input in &request.inputs {
        args.push_all(["-protocol_whitelist", "file,udp,rtp"]);
        args.push_all(["-fflags", "+genpts"]);
        args.push("-i");
        args.push(input.descriptor.display().to_string());
    }

    let video: Vec<usize> = indices_of(&request.inputs, MediaKind::Video);
    let audio: Vec<usize> = indices_of(&request.inputs, MediaKind::Audio);
    let mut filters = Vec::new();

    match video.as_slice() {
        [] => args.push("-vn"),
        [index] => {
            args.push_all(["-map".to_string(), format!("{index}:v:0")]);
            if copies_video(config, &request.inputs[*index]) {
                args.push_all(["-c:v", "copy"]);
            } else {
                push_video_encoder(&mut args, config);
            }
        }
        many => {
            let layout = Layout::for_count(many.len());
            filters.push(composite_filter(config, &layout, many));
            args.push_all(["-map", "[vout]"]);
            push_video_encoder(&mut args, config);
        }
    }

    match audio.as_slice() {
        [] => args.push("-an"),
        [index] => {
            args.push_all(["-map".to_string(), format!("{index}:a:0")]);
            push_audio_encoder(&mut args, config);
        }
        many => {
            let labels: String = many.iter().map(|i| format!("[{i}:a]")).collect();
            filters.push(format!(
                "{labels}amix=inputs={}:dropout_transition=0:normalize=0[aout]",
                many.len()
            ));
            args.push_all(["-map", "[aout]"]);
            push_audio_encoder(&mut args, config);
        }
    }

    if !filters.is_empty() {
        args.push("-filter_complex");
        args.push(filters.join(";"));
    }

    let output = &request.output;
    args.push_all(["-f", "hls"]);
    args.push_all(["-hls_time".to_string(), config.segment_secs.to_string()]);
    args.push_all(["-hls_list_size".to_string(), config.list_size.to_string()]);
    args.push_all(["-hls_flags", "delete_segments+independent_segments"]);
    args.push("-hls_segment_filename");
    args.push(
        output
            .dir
            .join(output.live_segment_pattern(request.generation))
            .display()
            .to_string(),
    );
    args.push(output.playlist_path().display().to_string());

    args.0
}

fn indices_of(inputs: &[InputSpec], kind: MediaKind) -> Vec<usize> {
    inputs
        .iter()
        .enumerate()
        .filter(|(_, input)| input.kind == kind)
        .map(|(index, _)| index)
        .collect()
}

fn copies_video(config: &TranscodeConfig, input: &InputSpec) -> bool {
    match config.video {
        VideoStrategy::Copy => true,
        VideoStrategy::Reencode => false,
        VideoStrategy::Auto => input.codec.is_hls_playable(),
    }
}

fn push_video_encoder(args: &mut Args, config: &TranscodeConfig) {
    let gop = (config.framerate * config.segment_secs).max(1).to_string();
    args.push_all(["-c:v", "libx264"]);
    args.push_all(["-preset".to_string(), config.preset.clone()]);
    args.push_all(["-tune", "zerolatency", "-pix_fmt", "yuv420p"]);
    args.push_all(["-r".to_string(), config.framerate.to_string()]);
    args.push_all(["-b:v".to_string(), format!("{}k", config.video_bitrate_kbps)]);
    args.push_all(["-g".to_string(), gop.clone()]);
    args.push_all(["-keyint_min".to_string(), gop]);
    args.push_all(["-sc_threshold", "0"]);
}

fn push_audio_encoder(args: &mut Args, config: &TranscodeConfig) {
    args.push_all(["-c:a", "aac", "-ar", "48000", "-ac", "2"]);
    args.push_all(["-b:a".to_string(), format!("{}k", config.audio_bitrate_kbps)]);
}

/// Scale every video input into its cell and stack the cells on one canvas.
fn composite_filter(config: &TranscodeConfig, layout: &Layout, inputs: &[usize]) -> String {
    let cells = layout.cells(config.width, config.height);
    let mut chains: Vec<String> = inputs
        .iter()
        .zip(&cells)
        .enumerate()
        .map(|(n, (input, cell))| {
            format!(
                "[{input}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,\
                 pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps}[v{n}]",
                w = cell.width,
                h = cell.height,
                fps = config.framerate,
            )
        })
        .collect();

    let labels: String = (0..inputs.len()).map(|n| format!("[v{n}]")).collect();
    let positions: Vec<String> = cells
        .iter()
        .take(inputs.len())
        .map(|cell| format!("{}_{}", cell.x, cell.y))
        .collect();

    chains.push(format!(
        "{labels}xstack=inputs={}:layout={}:fill=black,\
         pad={}:{}:0:0:black[vout]",
        inputs.len(),
        positions.join("|"),
        config.width & !1,
        config.height & !1,
    ));
    chains.join(";")
}

#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn push(&mut self, arg: impl Into<String>) {
        self.0.push(arg.into());
    }

    fn push_all<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_ipc::{CodecDescriptor, OutputTarget};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn input(id: &str, kind: MediaKind, mime: &str) -> InputSpec {
        InputSpec {
            producer_id: id.to_string(),
            kind,
            codec: CodecDescriptor {
                mime_type: mime.to_string(),
                clock_rate: if kind == MediaKind::Audio { 48000 } else { 90000 },
                channels: (kind == MediaKind::Audio).then_some(2),
                payload_type: 96,
                parameters: BTreeMap::new(),
            },
            descriptor: PathBuf::from(format!("/work/{id}.sdp")),
        }
    }

    fn request(inputs: Vec<InputSpec>) -> SpawnRequest {
        SpawnRequest {
            generation: 7,
            inputs,
            output: OutputTarget::new("/srv/hls"),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_single_h264_input_is_copied_under_auto() {
        let config = TranscodeConfig::default();
        let args = build_args(&config, &request(vec![input("p1", MediaKind::Video, "video/H264")]));

        assert_eq!(value_after(&args, "-i"), Some("/work/p1.sdp"));
        assert_eq!(value_after(&args, "-map"), Some("0:v:0"));
        assert_eq!(value_after(&args, "-c:v"), Some("copy"));
        assert!(args.contains(&"-an".to_string()));
        assert!(!args.contains(&"-filter_complex".to_string()));
    }

    #[test]
    fn test_single_vp8_input_is_reencoded_under_auto() {
        let config = TranscodeConfig::default();
        let args = build_args(&config, &request(vec![input("p1", MediaKind::Video, "video/VP8")]));

        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-g"), Some("60"));
    }

    #[test]
    fn test_two_video_inputs_are_stacked_side_by_side() {
        let config = TranscodeConfig::default();
        let args = build_args(
            &config,
            &request(vec![
                input("p1", MediaKind::Video, "video/VP8"),
                input("p2", MediaKind::Video, "video/H264"),
            ]),
        );

        let filter = value_after(&args, "-filter_complex").unwrap();
        assert!(filter.contains("[0:v]scale=640:720"));
        assert!(filter.contains("[1:v]scale=640:720"));
        assert!(filter.contains("xstack=inputs=2:layout=0_0|640_0"));
        assert_eq!(value_after(&args, "-map"), Some("[vout]"));
        // Composites are always encoded.
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
    }

    #[test]
    fn test_audio_inputs_are_mixed() {
        let config = TranscodeConfig::default();
        let args = build_args(
            &config,
            &request(vec![
                input("a1", MediaKind::Audio, "audio/opus"),
                input("v1", MediaKind::Video, "video/H264"),
                input("a2", MediaKind::Audio, "audio/opus"),
            ]),
        );

        let filter = value_after(&args, "-filter_complex").unwrap();
        assert!(filter.contains("[0:a][2:a]amix=inputs=2"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-c:v"), Some("copy"));
    }

    #[test]
    fn test_hls_output_uses_generation_pattern() {
        let config = TranscodeConfig::default();
        let args = build_args(&config, &request(vec![input("p1", MediaKind::Video, "video/H264")]));

        assert_eq!(value_after(&args, "-f"), Some("hls"));
        assert_eq!(
            value_after(&args, "-hls_segment_filename"),
            Some("/srv/hls/live_g7_%05d.ts")
        );
        assert_eq!(args.last().map(String::as_str), Some("/srv/hls/index.m3u8"));
    }

    #[test]
    fn test_select_layout_counts_video_only() {
        let inputs = vec![
            input("a1", MediaKind::Audio, "audio/opus"),
            input("v1", MediaKind::Video, "video/VP8"),
            input("v2", MediaKind::Video, "video/VP8"),
            input("v3", MediaKind::Video, "video/VP8"),
        ];
        assert_eq!(select_layout(&inputs), Layout::TwoTopOneBottom);
        assert_eq!(select_layout(&inputs[..2]), Layout::PassThrough);
    }
}
