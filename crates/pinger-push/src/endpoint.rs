use crate::error::PushError;
use crate::gateway::PushGateway;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pinger_store::DeviceInfo;

pub const PUSH_SERVICE_APNS: &str = "APNS";

const APNS_TOKEN_HEX_LEN: usize = 64;

/// Normalize an APNS device token to 64 lowercase hex characters. Tokens
/// already in hex pass through; anything else is read as base64.
pub fn decode_apns_token(token: &str) -> Result<String, PushError> {
    if token.len() == APNS_TOKEN_HEX_LEN {
        if hex::decode(token).is_ok() {
            return Ok(token.to_ascii_lowercase());
        }
        return Err(PushError::InvalidToken(format!(
            "could not determine push token format: {token}"
        )));
    }
    let bytes = BASE64
        .decode(token)
        .map_err(|e| PushError::InvalidToken(format!("not hex or base64: {e}")))?;
    let hex_token = hex::encode(bytes);
    if hex_token.len() != APNS_TOKEN_HEX_LEN {
        return Err(PushError::InvalidToken(format!(
            "decoded token is {} hex chars, expected {APNS_TOKEN_HEX_LEN}",
            hex_token.len()
        )));
    }
    Ok(hex_token)
}

fn gateway_token(service: &str, token: &str) -> Result<String, PushError> {
    if service.eq_ignore_ascii_case(PUSH_SERVICE_APNS) {
        decode_apns_token(token)
    } else {
        Ok(token.to_string())
    }
}

/// Create (or adopt) the gateway endpoint for a device token and make sure
/// it is enabled, carries the current token and is tagged with the client.
pub async fn register_endpoint(
    gateway: &dyn PushGateway,
    service: &str,
    token: &str,
    custom_data: &str,
) -> Result<String, PushError> {
    if token.is_empty() {
        return Err(PushError::InvalidToken("empty push token".to_string()));
    }
    let token = gateway_token(service, token)?;

    let arn = match gateway.register_endpoint(service, &token, custom_data).await {
        Ok(arn) => {
            tracing::debug!(service, %arn, "endpoint created");
            arn
        }
        Err(PushError::EndpointExists { arn }) => {
            tracing::warn!(service, %arn, "endpoint previously registered, updating");
            arn
        }
        Err(e) => return Err(e),
    };

    let mut attributes = gateway.get_attributes(&arn).await?;
    let mut changed = false;
    if attributes.get("Enabled").map(String::as_str) != Some("true") {
        tracing::warn!(%arn, "gateway has endpoint disabled, re-enabling");
        attributes.insert("Enabled".to_string(), "true".to_string());
        changed = true;
    }
    if attributes.get("Token").map(String::as_str) != Some(token.as_str()) {
        attributes.insert("Token".to_string(), token.clone());
        changed = true;
    }
    if attributes.get("CustomUserData").map(String::as_str) != Some(custom_data) {
        attributes.insert("CustomUserData".to_string(), custom_data.to_string());
        changed = true;
    }
    if changed {
        tracing::debug!(%arn, "setting endpoint attributes");
        gateway.set_attributes(&arn, &attributes).await?;
    }
    Ok(arn)
}

/// Register the device's endpoint and record it on the device. Returns
/// whether the device record changed and must be saved.
///
/// With `ignore_failures` a registration error is logged and the device is
/// left untouched.
pub async fn ensure_device_endpoint(
    gateway: &dyn PushGateway,
    device: &mut DeviceInfo,
    ignore_failures: bool,
) -> Result<bool, PushError> {
    let result = register_endpoint(
        gateway,
        &device.push_service,
        &device.push_token,
        &device.client_id,
    )
    .await;

    match result {
        Ok(arn) => {
            let changed = device.endpoint_arn != arn || !device.enabled;
            device.endpoint_arn = arn;
            device.enabled = true;
            Ok(changed)
        }
        Err(e) if ignore_failures => {
            tracing::warn!(
                device = %device.session_key(),
                service = %device.push_service,
                err = %e,
                "push registration failed (ignored)"
            );
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Tear down a device's endpoint after the gateway rejected its token. The
/// device is left disabled with no endpoint until it registers again. A
/// failed delete is logged; the device is disabled either way.
pub async fn disable_device_endpoint(gateway: &dyn PushGateway, device: &mut DeviceInfo) {
    if !device.endpoint_arn.is_empty() {
        if let Err(e) = gateway.delete_endpoint(&device.endpoint_arn).await {
            tracing::warn!(arn = %device.endpoint_arn, err = %e, "could not delete endpoint");
        }
    }
    device.endpoint_arn.clear();
    device.enabled = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Attributes;
    use crate::memory::MemoryGateway;

    const HEX_TOKEN: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    fn b64_token() -> String {
        BASE64.encode(hex::decode(HEX_TOKEN).unwrap())
    }

    #[test]
    fn apns_token_formats() {
        assert_eq!(decode_apns_token(HEX_TOKEN).unwrap(), HEX_TOKEN);
        assert_eq!(
            decode_apns_token(&HEX_TOKEN.to_uppercase()).unwrap(),
            HEX_TOKEN
        );
        assert_eq!(decode_apns_token(&b64_token()).unwrap(), HEX_TOKEN);

        assert!(matches!(
            decode_apns_token(&"z".repeat(64)),
            Err(PushError::InvalidToken(_))
        ));
        assert!(matches!(
            decode_apns_token(&BASE64.encode([1u8, 2, 3])),
            Err(PushError::InvalidToken(_))
        ));
        assert!(matches!(
            decode_apns_token("%%%"),
            Err(PushError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn registers_with_decoded_token() {
        let gateway = MemoryGateway::new();
        let arn = register_endpoint(&gateway, "APNS", &b64_token(), "C1")
            .await
            .unwrap();
        let attrs = gateway.endpoint(&arn).unwrap();
        assert_eq!(attrs["Token"], HEX_TOKEN);
        assert_eq!(attrs["CustomUserData"], "C1");
    }

    #[tokio::test]
    async fn existing_endpoint_is_adopted_and_repaired() {
        let gateway = MemoryGateway::new();
        let arn = register_endpoint(&gateway, "APNS", HEX_TOKEN, "C1")
            .await
            .unwrap();
        gateway.put_endpoint(
            &arn,
            Attributes::from([("Enabled".to_string(), "false".to_string())]),
        );

        let again = register_endpoint(&gateway, "APNS", HEX_TOKEN, "C2")
            .await
            .unwrap();
        assert_eq!(again, arn);
        let attrs = gateway.endpoint(&arn).unwrap();
        assert_eq!(attrs["Enabled"], "true");
        assert_eq!(attrs["Token"], HEX_TOKEN);
        assert_eq!(attrs["CustomUserData"], "C2");
    }

    #[tokio::test]
    async fn other_services_pass_token_through() {
        let gateway = MemoryGateway::new();
        let arn = register_endpoint(&gateway, "GCM", "gcm-registration-id", "C1")
            .await
            .unwrap();
        assert_eq!(gateway.endpoint(&arn).unwrap()["Token"], "gcm-registration-id");
    }

    #[tokio::test]
    async fn device_endpoint_failures_can_be_ignored() {
        let gateway = MemoryGateway::new();
        let mut device = DeviceInfo {
            client_id: "C1".to_string(),
            client_context: "ctx1".to_string(),
            device_id: "D1".to_string(),
            platform: "ios".to_string(),
            push_service: "APNS".to_string(),
            push_token: "not-a-token".to_string(),
            ..Default::default()
        };

        let err = ensure_device_endpoint(&gateway, &mut device, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::InvalidToken(_)));

        let changed = ensure_device_endpoint(&gateway, &mut device, true)
            .await
            .unwrap();
        assert!(!changed);
        assert!(device.endpoint_arn.is_empty());

        device.push_token = HEX_TOKEN.to_string();
        assert!(ensure_device_endpoint(&gateway, &mut device, false).await.unwrap());
        assert!(device.enabled);
        assert!(!device.endpoint_arn.is_empty());
    }

    #[tokio::test]
    async fn disabling_deletes_the_endpoint() {
        let gateway = MemoryGateway::new();
        let mut device = DeviceInfo {
            client_id: "C1".to_string(),
            platform: "ios".to_string(),
            push_service: "APNS".to_string(),
            push_token: HEX_TOKEN.to_string(),
            ..Default::default()
        };
        ensure_device_endpoint(&gateway, &mut device, false).await.unwrap();
        let arn = device.endpoint_arn.clone();
        assert!(gateway.endpoint(&arn).is_some());

        disable_device_endpoint(&gateway, &mut device).await;
        assert!(gateway.endpoint(&arn).is_none());
        assert!(device.endpoint_arn.is_empty());
        assert!(!device.enabled);

        // Already gone: nothing to delete, still disabled.
        disable_device_endpoint(&gateway, &mut device).await;
        assert!(!device.enabled);
    }
}
