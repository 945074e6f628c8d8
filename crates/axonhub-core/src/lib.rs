pub mod auth;
pub mod bootstrap;
pub mod executor;
pub mod probe;
pub mod upstream_client;

pub use auth::{AuthContext, AuthService, generate_api_key};
pub use executor::{ClientReply, ExecutionContext, RequestExecutor};
pub use probe::probe_channel;
pub use upstream_client::{
    UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamResponse, WreqUpstreamClient,
};
