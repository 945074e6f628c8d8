use axonhub_common::{GatewayError, GatewayResult};
use axonhub_protocol::unified::{ChatRequest, Message, Role};
use axonhub_transform::{HttpRequestSpec, outbound};

use crate::channel::Channel;

const PROBE_PROMPT: &str = "ping";

/// Build the minimal completion used to health-check a channel: verifies
/// both reachability and that the test model is actually served.
pub fn build_probe_request(channel: &Channel) -> GatewayResult<HttpRequestSpec> {
    let model = channel
        .settings
        .default_test_model
        .clone()
        .or_else(|| channel.supported_models.first().cloned())
        .ok_or_else(|| GatewayError::InvalidModel("channel serves no models".to_string()))?;
    let resolved = channel
        .choose_model(&model)
        .map_err(|_| GatewayError::InvalidModel(model.clone()))?;

    let mut request = ChatRequest::new(resolved);
    request.messages.push(Message::text(Role::User, PROBE_PROMPT));
    request.max_tokens = Some(1);

    let codec = outbound(channel.channel_type.api_format(), channel.endpoint());
    codec
        .transform_request(&request)
        .map_err(|error| GatewayError::InvalidModel(error.to_string()))
}

/// Interpret the upstream answer to a probe.
pub fn evaluate_probe(channel: &Channel, status: u16, body: &[u8]) -> GatewayResult<()> {
    if !(200..300).contains(&status) {
        return Err(GatewayError::upstream_status(status, body.to_vec()));
    }
    let codec = outbound(channel.channel_type.api_format(), channel.endpoint());
    codec
        .transform_response(body)
        .map(|_| ())
        .map_err(|error| GatewayError::InternalStorage(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelCredentials, ChannelSettings, ChannelStatus, ChannelType};

    #[test]
    fn probe_uses_the_test_model() {
        let channel = Channel {
            id: 1,
            name: "probe".to_string(),
            channel_type: ChannelType::OpenAiCompatible,
            status: ChannelStatus::Enabled,
            base_url: "https://api.example.com/v1".to_string(),
            credentials: ChannelCredentials {
                api_key: "k".to_string(),
                ..ChannelCredentials::default()
            },
            supported_models: vec!["small".to_string(), "large".to_string()],
            settings: ChannelSettings {
                default_test_model: Some("small".to_string()),
                ..ChannelSettings::default()
            },
        };
        let spec = build_probe_request(&channel).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&spec.body).unwrap();
        assert_eq!(body["model"], "small");
        assert_eq!(body["max_tokens"], 1);
        assert!(!spec.stream);
    }

    #[test]
    fn probe_fails_for_empty_channel() {
        let channel = Channel {
            id: 1,
            name: "empty".to_string(),
            channel_type: ChannelType::OpenAiCompatible,
            status: ChannelStatus::Enabled,
            base_url: "https://api.example.com/v1".to_string(),
            credentials: ChannelCredentials::default(),
            supported_models: Vec::new(),
            settings: ChannelSettings::default(),
        };
        assert!(build_probe_request(&channel).is_err());
    }
}
