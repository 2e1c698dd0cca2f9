pub fn video_args(args: &mut Vec<String>, hevc: bool, quality: i64) {
    args.push("-c:v".to_string());
    args.push(if hevc { "libx265" } else { "libx264" }.to_string());
    args.push("-crf".to_string());
    args.push(quality.to_string());
    args.push("-preset".to_string());
    args.push("medium".to_string());
}

pub fn scale_filter() -> &'static str {
    "scale=1280:-2"
}
