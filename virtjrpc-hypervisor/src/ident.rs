//! Identifier generation and validation: UUIDs, QEMU-KVM MAC addresses and
//! domain names.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::error::{Error, Result};

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid pattern")
});

static MAC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2}$").expect("mac pattern")
});

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[0-9a-zA-Z_-]+$").expect("name pattern"));

/// The locally administered OUI QEMU-KVM guests use.
pub const MAC_PREFIX: &str = "52:54:00";

/// Generate a pseudo-random version-4 UUID, lowercase hyphenated.
pub fn gen_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a pseudo-random MAC inside the QEMU-KVM vendor prefix.
pub fn gen_mac() -> String {
    let mut rng = rand::thread_rng();
    let tail: [u8; 3] = rng.gen();
    format!(
        "{}:{:02x}:{:02x}:{:02x}",
        MAC_PREFIX, tail[0], tail[1], tail[2]
    )
}

/// Validate the canonical 8-4-4-4-12 hex UUID form.
pub fn validate_uuid(uuid: &str) -> Result<()> {
    if UUID_PATTERN.is_match(uuid) {
        Ok(())
    } else {
        Err(Error::validation(format!("not valid UUID {}", uuid)))
    }
}

/// Validate a guest MAC: canonical six-octet form inside the QEMU-KVM
/// vendor prefix.
pub fn validate_mac(mac: &str) -> Result<()> {
    if !mac.starts_with(MAC_PREFIX) {
        return Err(Error::validation(format!(
            "MAC: {} has non valid QEMU-KVM vendor prefix",
            mac
        )));
    }
    if !MAC_PATTERN.is_match(mac) {
        return Err(Error::validation(format!("not valid MAC: {}", mac)));
    }
    Ok(())
}

/// Validate a domain name: non-empty, `[0-9A-Za-z_-]+`.
pub fn validate_domain_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("domain name is empty"));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(Error::validation(format!(
            "not valid name, should contain only this symbols: (0-9,a-z,A-Z,_,-): {}",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uuid_validates() {
        let uuid = gen_uuid();
        validate_uuid(&uuid).unwrap();
        assert_eq!(uuid, uuid.to_lowercase());
    }

    #[test]
    fn generated_mac_validates() {
        let mac = gen_mac();
        validate_mac(&mac).unwrap();
        assert!(mac.starts_with("52:54:00:"));
    }

    #[test]
    fn uuid_rejects_malformed() {
        assert!(validate_uuid("").is_err());
        assert!(validate_uuid("0d15ea5e-dead-dead-dead").is_err());
        assert!(validate_uuid("0d15ea5e-dead-dead-dead-defec8eddeag").is_err());
        validate_uuid("0d15ea5e-dead-dead-dead-defec8eddead").unwrap();
    }

    #[test]
    fn mac_rejects_foreign_prefix() {
        let err = validate_mac("fa:16:3e:aa:bb:cc").unwrap_err();
        assert!(err.to_string().contains("non valid QEMU-KVM vendor prefix"));
    }

    #[test]
    fn mac_rejects_malformed_octets() {
        let err = validate_mac("52:54:00:zz:bb:cc").unwrap_err();
        assert_eq!(err.to_string(), "not valid MAC: 52:54:00:zz:bb:cc");
        assert!(validate_mac("52:54:00:ab:cd").is_err());
    }

    #[test]
    fn name_charset() {
        validate_domain_name("vm01").unwrap();
        validate_domain_name("web_front-2").unwrap();
        assert!(validate_domain_name("").is_err());
        assert!(validate_domain_name("vm 01").is_err());
        assert!(validate_domain_name("vm/01").is_err());
        assert!(validate_domain_name("vm*").is_err());
    }
}
