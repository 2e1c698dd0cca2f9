/// VAAPI needs the render node named explicitly on the input side.
pub fn input_args(args: &mut Vec<String>, render_node: &str) {
    for arg in ["-hwaccel", "vaapi", "-vaapi_device"] {
        args.push(arg.to_string());
    }
    args.push(render_node.to_string());
    args.push("-hwaccel_output_format".to_string());
    args.push("vaapi".to_string());
}

pub fn video_args(args: &mut Vec<String>, hevc: bool, quality: i64) {
    args.push("-c:v".to_string());
    args.push(if hevc { "hevc_vaapi" } else { "h264_vaapi" }.to_string());
    args.push("-rc_mode".to_string());
    args.push("CQP".to_string());
    args.push("-qp".to_string());
    args.push(quality.to_string());
}

pub fn scale_filter() -> &'static str {
    "scale_vaapi=w=1280:h=-2"
}
