use std::fmt;

/// Default user server.
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
/// Hidden-user (lid) server.
pub const LID_SERVER: &str = "lid";
/// Group server.
pub const GROUP_SERVER: &str = "g.us";

/// Parsed identity of the form `user@server`, optionally `user:device@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub device: Option<u8>,
}

impl Jid {
    /// Builds a device-less JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            device: None,
        }
    }

    /// Parses a JID string; returns None when there is no server part.
    pub fn parse(raw: &str) -> Option<Self> {
        let (user_part, server) = match raw.split_once('@') {
            Some((user, server)) if !server.is_empty() => (user, server),
            _ => return None,
        };

        let (user, device) = match user_part.split_once(':') {
            Some((user, device_raw)) => (user, Some(device_raw.parse::<u8>().ok()?)),
            None => (user_part, None),
        };

        Some(Self {
            user: user.to_owned(),
            server: server.to_owned(),
            device,
        })
    }

    /// The bare `user@server` form, dropping any device part.
    pub fn to_non_ad(&self) -> Jid {
        Jid {
            user: self.user.clone(),
            server: self.server.clone(),
            device: None,
        }
    }

    /// True for group JIDs.
    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// Device number, defaulting to the primary device.
    pub fn device_or_zero(&self) -> u8 {
        self.device.unwrap_or(0)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            return f.write_str(&self.server);
        }
        match self.device {
            Some(device) => write!(f, "{}:{}@{}", self.user, device, self.server),
            None => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Jid;

    #[test]
    fn parse_and_format_roundtrip() {
        let plain = Jid::parse("15550001111@s.whatsapp.net").expect("plain");
        assert_eq!(plain.user, "15550001111");
        assert_eq!(plain.device, None);
        assert_eq!(plain.to_string(), "15550001111@s.whatsapp.net");

        let device = Jid::parse("15550001111:2@s.whatsapp.net").expect("device");
        assert_eq!(device.device, Some(2));
        assert_eq!(device.to_string(), "15550001111:2@s.whatsapp.net");
    }

    #[test]
    fn rejects_serverless_strings() {
        assert!(Jid::parse("no-server").is_none());
        assert!(Jid::parse("user@").is_none());
    }
}
