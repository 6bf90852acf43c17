use rand::Rng;
use rand::distributions::Alphanumeric;

/// Row id of a client in the relational table.
pub type ClientId = i64;

/// Row id of an inbound listener.
pub type InboundId = i64;

/// Random identifier for identity-based protocols (VLESS, VMess).
pub fn generate_identifier() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Random alphanumeric password for secret-based protocols (Trojan, Shadowsocks).
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_password() {
        let password = generate_password(16);
        assert_eq!(password.len(), 16);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, generate_password(16));
    }

    #[test]
    fn test_generate_identifier_is_uuid() {
        let id = generate_identifier();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }
}
