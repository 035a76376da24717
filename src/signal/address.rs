use std::fmt;

use crate::binary::Jid;

/// Identifies one device of one user, e.g. `15550002222.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    pub user: String,
    pub device: u16,
}

impl ProtocolAddress {
    pub fn new(user: impl Into<String>, device: u16) -> Self {
        Self {
            user: user.into(),
            device,
        }
    }

    /// Derives the address for a JID, defaulting to the primary device.
    pub fn from_jid(jid: &Jid) -> Self {
        Self {
            user: jid.user.clone(),
            device: u16::from(jid.device_or_zero()),
        }
    }

    /// Parses the `user.device` form.
    pub fn parse(raw: &str) -> Option<Self> {
        let (user, device) = raw.rsplit_once('.')?;
        Some(Self {
            user: user.to_owned(),
            device: device.parse().ok()?,
        })
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::ProtocolAddress;
    use crate::binary::Jid;

    #[test]
    fn display_and_parse_roundtrip() {
        let address = ProtocolAddress::new("15550002222", 3);
        assert_eq!(address.to_string(), "15550002222.3");
        assert_eq!(ProtocolAddress::parse("15550002222.3"), Some(address));
    }

    #[test]
    fn from_jid_defaults_device_to_zero() {
        let jid = Jid::parse("15550002222@s.whatsapp.net").expect("jid");
        assert_eq!(
            ProtocolAddress::from_jid(&jid),
            ProtocolAddress::new("15550002222", 0)
        );
    }
}
