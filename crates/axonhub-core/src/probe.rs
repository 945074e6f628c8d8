use axonhub_channel::channel::Channel;
use axonhub_channel::{build_probe_request, evaluate_probe};
use axonhub_common::GatewayResult;
use bytes::Bytes;

use crate::upstream_client::{UpstreamBody, UpstreamClient};

/// Health-check one channel with a minimal one-token completion.
pub async fn probe_channel(client: &dyn UpstreamClient, channel: &Channel) -> GatewayResult<()> {
    let spec = build_probe_request(channel)?;
    let response = client.send(spec).await?;
    let body = match response.body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut collected = Vec::new();
            while let Some(chunk) = rx.recv().await {
                collected.extend_from_slice(&chunk);
            }
            Bytes::from(collected)
        }
    };
    evaluate_probe(channel, response.status, &body)
}
