/// CUDA decode so frames stay in GPU memory for scale_cuda.
pub fn input_args(args: &mut Vec<String>) {
    for arg in ["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"] {
        args.push(arg.to_string());
    }
}

/// CQ mode; -b:v 0 is required or NVENC falls back to bitrate targeting.
pub fn video_args(args: &mut Vec<String>, hevc: bool, quality: i64) {
    args.push("-c:v".to_string());
    args.push(if hevc { "hevc_nvenc" } else { "h264_nvenc" }.to_string());
    args.push("-preset".to_string());
    args.push("p4".to_string());
    args.push("-cq".to_string());
    args.push(quality.to_string());
    args.push("-b:v".to_string());
    args.push("0".to_string());
}

pub fn scale_filter() -> &'static str {
    "scale_cuda=1280:-2"
}
