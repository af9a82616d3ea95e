pub mod mp4;
pub mod rtsp;
