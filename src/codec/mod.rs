pub mod body;
mod request_decoder;
mod response_encoder;

pub use request_decoder::{RequestDecoder, RequestHead};
pub use response_encoder::ResponseEncoder;
