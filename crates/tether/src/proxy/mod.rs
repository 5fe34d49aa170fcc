mod error;
mod passthrough;
mod routing;
mod server;
mod streaming;

pub use error::{ProxyError, StreamErrorEvent, stream_error_response};
pub use passthrough::forward_request;
pub use routing::{
    Credentials, GROUP_HEADER, GROUP_PARAM, GroupSource, Route, is_streaming_request,
};
pub use server::{AppState, ProxyServer, build_client, create_router};
pub use streaming::relay_stream;
