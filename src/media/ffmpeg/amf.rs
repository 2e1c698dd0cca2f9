pub fn video_args(args: &mut Vec<String>, hevc: bool, quality: i64) {
    args.push("-c:v".to_string());
    args.push(if hevc { "hevc_amf" } else { "h264_amf" }.to_string());
    args.push("-rc".to_string());
    args.push("cqp".to_string());
    args.push("-qp_i".to_string());
    args.push(quality.to_string());
    args.push("-qp_p".to_string());
    args.push(quality.to_string());
}

/// AMF decodes in system memory, so the plain software scaler applies.
pub fn scale_filter() -> &'static str {
    "scale=1280:-2"
}
