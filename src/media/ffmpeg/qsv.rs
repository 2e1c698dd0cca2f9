pub fn input_args(args: &mut Vec<String>) {
    for arg in ["-hwaccel", "qsv", "-hwaccel_output_format", "qsv"] {
        args.push(arg.to_string());
    }
}

pub fn video_args(args: &mut Vec<String>, hevc: bool, quality: i64) {
    args.push("-c:v".to_string());
    args.push(if hevc { "hevc_qsv" } else { "h264_qsv" }.to_string());
    args.push("-global_quality".to_string());
    args.push(quality.to_string());
}

pub fn scale_filter() -> &'static str {
    "vpp_qsv=w=1280:h=-2"
}
