// Leadforge OpenAI - Responses API adapter
//
// Shapes provider-specific request/response details into a uniform surface:
// - params: build_params (autonomy preamble, multimodal input, structured output)
// - client: ResponsesApi trait + ResponsesClient with in-client error recovery
// - stream: SSE events and the flush-on-boundary delta buffer
// - process: response -> text / image sources / usage / audit records
// - images_api: the dedicated Images API path for image-generation steps

pub mod client;
pub mod images_api;
pub mod params;
pub mod process;
pub mod stream;
pub mod types;

pub use client::{ImageRescuer, ResponsesApi, ResponsesClient};
pub use params::{build_params, BuildParamsArgs};
pub use process::{process_response, ProcessedResponse};
pub use stream::{FlushBuffer, ResponseStream, StreamEvent};
pub use types::{ImageSource, Response, ResponseRequest, Usage};
