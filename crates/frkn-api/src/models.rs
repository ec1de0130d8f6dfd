//! Wire models of the device API.

use frkn_tunnel::ServerDescriptor;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/devices/register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterRequest {
    pub device_id: String,
    pub platform: String,
    pub name: String,
}

/// Registration result
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub device_id: String,
    pub device_token: String,
    pub referral_code: String,
    pub is_new_user: bool,
}

/// Body of `GET /api/v1/devices/config`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigResponse {
    pub servers: Vec<ServerDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_shape() {
        let request = RegisterRequest {
            device_id: "abc".into(),
            platform: "linux".into(),
            name: "laptop".into(),
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"device_id":"abc","platform":"linux","name":"laptop"}"#
        );
    }

    #[test]
    fn test_config_response() {
        let json = r#"{"servers":[{
            "server_ip": "203.0.113.5",
            "port": 443,
            "auth_password": "s3cr3t",
            "obfs_type": "salamander",
            "obfs_password": "hunter2",
            "insecure": true,
            "connection_uri": "hysteria2://s3cr3t@203.0.113.5:443"
        }]}"#;

        let response: ConfigResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.servers.len(), 1);
        assert!(response.servers[0].insecure);
        assert_eq!(response.servers[0].obfuscation().unwrap().kind, "salamander");
    }
}
