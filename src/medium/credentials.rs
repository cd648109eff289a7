use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::ids::ServiceId;

const SERVICE_NAME_BYTES: usize = 8;
const PASSWORD_BYTES: usize = 16;
const SERVICE_TYPE_HASH_BYTES: usize = 6;

/// Credential bundle carried by an `UpgradePathAvailable` frame.
///
/// Each variant holds exactly what the target needs to dial the initiator on
/// the upgraded medium. The values are short-lived: they are dropped once the
/// upgrade resolves or reverts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UpgradeCredentials {
    WifiHotspot {
        ssid: String,
        password: String,
        gateway: String,
        port: u16,
    },
    WifiLan {
        ip: String,
        port: u16,
    },
    Awdl {
        service_name: String,
        service_type: String,
        password: String,
    },
    WebRtc {
        peer_id: String,
    },
    Bluetooth {
        mac: [u8; 6],
    },
}

impl UpgradeCredentials {
    /// Returns the service name a hub-backed listener registers under.
    #[must_use]
    pub fn dial_key(&self) -> String {
        match self {
            Self::WifiHotspot { ssid, .. } => ssid.clone(),
            Self::WifiLan { ip, port } => format!("{ip}:{port}"),
            Self::Awdl { service_name, .. } => service_name.clone(),
            Self::WebRtc { peer_id } => peer_id.clone(),
            Self::Bluetooth { mac } => hex::encode(mac),
        }
    }

    /// Returns the shared secret the listener verifies, when the medium has one.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        match self {
            Self::WifiHotspot { password, .. } | Self::Awdl { password, .. } => Some(password),
            Self::WifiLan { .. } | Self::WebRtc { .. } | Self::Bluetooth { .. } => None,
        }
    }
}

/// Generates a random hex-encoded service name (8 random bytes).
#[must_use]
pub fn generate_service_name() -> String {
    let mut bytes = [0u8; SERVICE_NAME_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generates a random hex-encoded password (16 random bytes).
#[must_use]
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Formats the DNS-SD style service type for a service id.
///
/// The type embeds the first six bytes of the SHA-256 digest of the service
/// id, so unrelated services never collide on the air.
#[must_use]
pub fn service_type_for(service_id: &ServiceId) -> String {
    let digest = Sha256::digest(service_id.as_str().as_bytes());
    let mut truncated = [0u8; SERVICE_TYPE_HASH_BYTES];
    truncated.copy_from_slice(&digest[..SERVICE_TYPE_HASH_BYTES]);
    format!("_{}._tcp", hex::encode(truncated))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn generated_service_names_are_hex_of_eight_bytes() {
        let name = generate_service_name();
        assert_eq!(SERVICE_NAME_BYTES * 2, name.len());
        assert_eq!(true, name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_passwords_are_hex_of_sixteen_bytes() {
        let password = generate_password();
        assert_eq!(PASSWORD_BYTES * 2, password.len());
    }

    #[test]
    fn service_type_is_stable_for_a_service_id() {
        let service = ServiceId::from("NearbySharing");
        assert_eq!(service_type_for(&service), service_type_for(&service));
        assert_eq!(true, service_type_for(&service).starts_with('_'));
        assert_eq!(true, service_type_for(&service).ends_with("._tcp"));
    }

    #[test]
    fn distinct_service_ids_produce_distinct_types() {
        let left = service_type_for(&ServiceId::from("ServiceA"));
        let right = service_type_for(&ServiceId::from("ServiceB"));
        assert_eq!(false, left == right);
    }

    #[test]
    fn hotspot_credentials_expose_ssid_and_password() {
        let credentials = UpgradeCredentials::WifiHotspot {
            ssid: "DIRECT-ab12".into(),
            password: "p".into(),
            gateway: "192.168.49.1".into(),
            port: 4242,
        };
        assert_eq!("DIRECT-ab12", credentials.dial_key());
        assert_eq!(Some("p"), credentials.password());
    }

    #[test]
    fn lan_credentials_have_no_password() {
        let credentials = UpgradeCredentials::WifiLan {
            ip: "127.0.0.1".into(),
            port: 9000,
        };
        assert_eq!(None, credentials.password());
        assert_eq!("127.0.0.1:9000", credentials.dial_key());
    }
}
