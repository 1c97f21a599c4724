pub mod capture;
pub mod codec;
pub mod firebase;
pub mod http;
pub mod mjpeg;
pub mod onnx;
pub mod v4l2;
